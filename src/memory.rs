#![allow(non_upper_case_globals)]

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicI32, AtomicU32, Ordering};

use bitflags::bitflags;
use libc::{PROT_EXEC, PROT_READ, PROT_WRITE};
use parking_lot::{Mutex, RwLock};
use tracing::trace;

use crate::arch::Word;
use crate::config::MemoryConfig;
use crate::error::{Error, Result};
use crate::kernel::TeamId;

pub type AreaId = i32;

bitflags! {
    pub struct Protection: i32 {
        const Read = PROT_READ;
        const Write = PROT_WRITE;
        const Execute = PROT_EXEC;
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AreaInfo {
    pub id: AreaId,
    pub base: Word,
    pub size: usize,
    pub protection: Protection,
}

impl AreaInfo {
    pub fn end(&self) -> Word {
        self.base + self.size as Word
    }

    pub fn contains(&self, address: Word) -> bool {
        address >= self.base && address < self.end()
    }
}

/// Page-fault-aware access to a team's user memory.
pub trait UserMemory: Send + Sync {
    fn is_user_address(&self, address: Word) -> bool;
    fn page_size(&self) -> usize;

    /// Copies the whole range or fails; a fault never yields a partial copy.
    fn copy_from_user(&self, address: Word, buffer: &mut [u8]) -> Result<()>;
    fn copy_to_user(&self, address: Word, buffer: &[u8]) -> Result<()>;

    fn area_for(&self, address: Word) -> Option<AreaInfo>;

    /// Writes within one area even if it is read-only. The protection is
    /// lifted and restored while no other access can observe it.
    fn copy_to_user_unprotected(&self, address: Word, buffer: &[u8]) -> Result<()>;
}

struct MappedArea {
    info: AreaInfo,
    data: Vec<u8>,
}

type AreaMap = BTreeMap<Word, MappedArea>;

fn lookup(areas: &AreaMap, address: Word) -> Option<&MappedArea> {
    areas
        .range(..=address)
        .next_back()
        .map(|(_, area)| area)
        .filter(|area| area.info.contains(address))
}

fn lookup_mut(areas: &mut AreaMap, address: Word) -> Option<&mut MappedArea> {
    areas
        .range_mut(..=address)
        .next_back()
        .map(|(_, area)| area)
        .filter(|area| area.info.contains(address))
}

/// A team's user address space: a set of non-overlapping areas.
pub struct AddressSpace {
    areas: RwLock<AreaMap>,
    next_area: AtomicI32,
    page_size: usize,
    user_base: Word,
    user_top: Word,
}

impl AddressSpace {
    pub fn new(config: &MemoryConfig) -> Self {
        Self {
            areas: RwLock::new(BTreeMap::new()),
            next_area: AtomicI32::new(1),
            page_size: config.page_size,
            user_base: config.user_base,
            user_top: config.user_top,
        }
    }

    pub fn map(&self, base: Word, size: usize, protection: Protection) -> Result<AreaId> {
        let end = base.checked_add(size as Word).ok_or(Error::BadAddress(base))?;
        if size == 0 || !self.is_user_address(base) || end > self.user_top {
            return Err(Error::BadAddress(base));
        }

        let mut areas = self.areas.write();
        let overlaps = areas
            .range(..end)
            .next_back()
            .map_or(false, |(_, area)| area.info.end() > base);
        if overlaps {
            return Err(Error::Busy);
        }

        let id = self.next_area.fetch_add(1, Ordering::Relaxed);
        areas.insert(
            base,
            MappedArea {
                info: AreaInfo {
                    id,
                    base,
                    size,
                    protection,
                },
                data: vec![0; size],
            },
        );
        Ok(id)
    }

    pub fn unmap(&self, area: AreaId) -> Result<()> {
        let mut areas = self.areas.write();
        let base = areas
            .values()
            .find(|a| a.info.id == area)
            .map(|a| a.info.base)
            .ok_or(Error::BadValue)?;
        areas.remove(&base);
        Ok(())
    }

    /// Drops every mapping, as exec does.
    pub fn clear(&self) {
        self.areas.write().clear();
    }

    /// Writes regardless of protection, the way a loader populates an image.
    pub fn load(&self, address: Word, bytes: &[u8]) -> Result<()> {
        let mut areas = self.areas.write();
        Self::check_range(&areas, address, bytes.len(), Protection::empty())?;
        Self::copy_in(&mut areas, address, bytes);
        Ok(())
    }

    fn check_range(areas: &AreaMap, address: Word, len: usize, required: Protection) -> Result<()> {
        let mut pos = 0;
        while pos < len {
            let addr = address + pos as Word;
            let area = lookup(areas, addr).ok_or(Error::BadAddress(addr))?;
            if !area.info.protection.contains(required) {
                return Err(Error::BadAddress(addr));
            }
            pos += ((area.info.end() - addr) as usize).min(len - pos);
        }
        Ok(())
    }

    fn copy_in(areas: &mut AreaMap, address: Word, bytes: &[u8]) {
        let mut pos = 0;
        while pos < bytes.len() {
            let addr = address + pos as Word;
            let area = match lookup_mut(areas, addr) {
                Some(area) => area,
                None => return,
            };
            let offset = (addr - area.info.base) as usize;
            let n = (area.info.size - offset).min(bytes.len() - pos);
            area.data[offset..offset + n].copy_from_slice(&bytes[pos..pos + n]);
            pos += n;
        }
    }
}

impl UserMemory for AddressSpace {
    fn is_user_address(&self, address: Word) -> bool {
        address >= self.user_base && address < self.user_top
    }

    fn page_size(&self) -> usize {
        self.page_size
    }

    fn copy_from_user(&self, address: Word, buffer: &mut [u8]) -> Result<()> {
        let areas = self.areas.read();
        Self::check_range(&areas, address, buffer.len(), Protection::Read)?;

        let mut pos = 0;
        while pos < buffer.len() {
            let addr = address + pos as Word;
            let area = lookup(&areas, addr).ok_or(Error::BadAddress(addr))?;
            let offset = (addr - area.info.base) as usize;
            let n = (area.info.size - offset).min(buffer.len() - pos);
            buffer[pos..pos + n].copy_from_slice(&area.data[offset..offset + n]);
            pos += n;
        }
        Ok(())
    }

    fn copy_to_user(&self, address: Word, buffer: &[u8]) -> Result<()> {
        let mut areas = self.areas.write();
        Self::check_range(&areas, address, buffer.len(), Protection::Write)?;
        Self::copy_in(&mut areas, address, buffer);
        Ok(())
    }

    fn area_for(&self, address: Word) -> Option<AreaInfo> {
        lookup(&self.areas.read(), address).map(|area| area.info.clone())
    }

    fn copy_to_user_unprotected(&self, address: Word, buffer: &[u8]) -> Result<()> {
        let mut areas = self.areas.write();
        let area = lookup_mut(&mut areas, address).ok_or(Error::BadAddress(address))?;
        let mut writable = WritableGuard::lift(area);
        writable.write(address, buffer)
    }
}

/// Makes a read-only area writable for as long as the guard lives.
struct WritableGuard<'a> {
    area: &'a mut MappedArea,
    original: Protection,
}

impl<'a> WritableGuard<'a> {
    fn lift(area: &'a mut MappedArea) -> Self {
        let original = area.info.protection;
        area.info.protection |= Protection::Write;
        Self { area, original }
    }

    fn write(&mut self, address: Word, buffer: &[u8]) -> Result<()> {
        let info = &self.area.info;
        let offset = (address - info.base) as usize;
        if offset + buffer.len() > info.size {
            return Err(Error::BadAddress(info.end()));
        }
        if !info.protection.contains(Protection::Write) {
            return Err(Error::BadAddress(address));
        }
        self.area.data[offset..offset + buffer.len()].copy_from_slice(buffer);
        Ok(())
    }
}

impl Drop for WritableGuard<'_> {
    fn drop(&mut self) {
        self.area.info.protection = self.original;
    }
}

/// Reads user memory page by page. A fault after some bytes were transferred
/// is reported as a short read; only a fault on the first page is an error.
pub fn read_user_memory(memory: &dyn UserMemory, address: Word, buffer: &mut [u8]) -> Result<usize> {
    if !memory.is_user_address(address) {
        return Err(Error::BadAddress(address));
    }
    if buffer.is_empty() {
        return Err(Error::BadValue);
    }

    let page_size = memory.page_size() as Word;
    let mut read = 0;
    let mut error = None;

    while read < buffer.len() {
        let addr = address + read as Word;
        if !memory.is_user_address(addr) {
            error = Some(Error::BadAddress(addr));
            break;
        }

        let max_read = (page_size - addr % page_size) as usize;
        let to_read = (buffer.len() - read).min(max_read);

        if let Err(e) = memory.copy_from_user(addr, &mut buffer[read..read + to_read]) {
            error = Some(e);
            break;
        }
        read += to_read;
    }

    match error {
        Some(e) if read == 0 => Err(e),
        _ => Ok(read),
    }
}

/// Writes user memory area by area, temporarily lifting write protection.
pub fn write_user_memory(memory: &dyn UserMemory, address: Word, buffer: &[u8]) -> Result<usize> {
    if !memory.is_user_address(address) {
        return Err(Error::BadAddress(address));
    }
    if buffer.is_empty() {
        return Err(Error::BadValue);
    }

    let page_size = memory.page_size() as Word;
    let mut written = 0;
    let mut error = None;

    while written < buffer.len() {
        let addr = address + written as Word;
        if !memory.is_user_address(addr) {
            error = Some(Error::BadAddress(addr));
            break;
        }

        let info = match memory.area_for(addr) {
            Some(info) => info,
            None => {
                error = Some(Error::BadAddress(addr));
                break;
            }
        };

        let max_write = ((info.end() - addr) as usize).min((page_size - addr % page_size) as usize);
        let to_write = (buffer.len() - written).min(max_write);

        if let Err(e) = memory.copy_to_user_unprotected(addr, &buffer[written..written + to_write]) {
            trace!(address = addr, error = %e, "user memory write failed");
            error = Some(e);
            break;
        }
        written += to_write;
    }

    match error {
        Some(e) if written == 0 => Err(e),
        _ => Ok(written),
    }
}

/// A kernel area that can be cloned into other teams and wired while in use.
#[derive(Debug)]
pub struct SharedArea {
    id: AreaId,
    owner: TeamId,
    data: Mutex<Vec<u8>>,
    locks: AtomicU32,
}

impl SharedArea {
    pub fn new(id: AreaId, owner: TeamId, size: usize) -> Self {
        Self {
            id,
            owner,
            data: Mutex::new(vec![0; size]),
            locks: AtomicU32::new(0),
        }
    }

    pub fn id(&self) -> AreaId {
        self.id
    }

    pub fn owner(&self) -> TeamId {
        self.owner
    }

    pub fn size(&self) -> usize {
        self.data.lock().len()
    }

    pub fn words(&self) -> usize {
        self.size() / std::mem::size_of::<Word>()
    }

    pub fn lock_memory(&self) {
        self.locks.fetch_add(1, Ordering::AcqRel);
    }

    pub fn unlock_memory(&self) {
        self.locks
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1))
            .ok();
    }

    pub fn is_locked(&self) -> bool {
        self.locks.load(Ordering::Acquire) != 0
    }

    pub fn write_word(&self, index: usize, value: Word) -> bool {
        let mut data = self.data.lock();
        let offset = index * std::mem::size_of::<Word>();
        match data.get_mut(offset..offset + std::mem::size_of::<Word>()) {
            Some(slot) => {
                slot.copy_from_slice(&value.to_le_bytes());
                true
            }
            None => false,
        }
    }

    pub fn read_word(&self, index: usize) -> Option<Word> {
        let data = self.data.lock();
        let offset = index * std::mem::size_of::<Word>();
        data.get(offset..offset + std::mem::size_of::<Word>()).map(|slot| {
            let mut bytes = [0u8; std::mem::size_of::<Word>()];
            bytes.copy_from_slice(slot);
            Word::from_le_bytes(bytes)
        })
    }

    pub fn read_words(&self, count: usize) -> Vec<Word> {
        (0..count).filter_map(|i| self.read_word(i)).collect()
    }
}
