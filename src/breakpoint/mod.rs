use std::collections::BTreeMap;
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::{debug, trace, warn};

use crate::arch::{self, DebugArch, Trigger, Word};
use crate::config::BreakpointConfig;
use crate::error::{Error, Result};
use crate::memory::{read_user_memory, write_user_memory, UserMemory};

pub mod hardware;
pub mod software;

use hardware::{Owner, Pool, SlotIndex};

/// Current realization of a logical breakpoint.
#[derive(Debug)]
pub enum Breakpoint {
    Hardware(SlotIndex),
    Software(software::Breakpoint),
}

impl Breakpoint {
    pub fn is_hardware(&self) -> bool {
        matches!(self, Self::Hardware(_))
    }

    pub fn is_software(&self) -> bool {
        matches!(self, Self::Software(_))
    }
}

#[derive(Debug)]
pub struct InstalledBreakpoint {
    address: Word,
    realization: Breakpoint,
    // install order; the smallest hardware one is evicted first
    sequence: u64,
}

impl InstalledBreakpoint {
    pub fn address(&self) -> Word {
        self.address
    }

    pub fn realization(&self) -> &Breakpoint {
        &self.realization
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstalledWatchpoint {
    pub address: Word,
    pub trigger: Trigger,
    pub length: usize,
    pub slot: Option<SlotIndex>,
}

/// What stopped an instruction fetch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchTrap {
    Hardware,
    Software,
}

#[derive(Debug)]
struct Inner {
    pool: Pool,
    breakpoints: BTreeMap<Word, InstalledBreakpoint>,
    watchpoints: BTreeMap<Word, InstalledWatchpoint>,
    sequence: u64,
}

impl Inner {
    fn next_sequence(&mut self) -> u64 {
        self.sequence += 1;
        self.sequence
    }

    fn software(&self, start: Word, end: Word, width: usize) -> impl Iterator<Item = &software::Breakpoint> {
        self.breakpoints
            .range(start.saturating_sub(width.saturating_sub(1) as Word)..end)
            .filter_map(|(_, installed)| match &installed.realization {
                Breakpoint::Software(sw) => Some(sw),
                Breakpoint::Hardware(_) => None,
            })
    }
}

/// Per-team registry of breakpoints and watchpoints.
///
/// Structural changes take the write lock; queries and memory I/O take the
/// read lock. Hardware slot reassignment happens entirely under the write
/// lock, so a fetch check (read lock) sees either the old or the new
/// realization of an address, never neither.
pub struct BreakpointManager {
    inner: RwLock<Inner>,
    arch: Arc<dyn DebugArch>,
    memory: Arc<dyn UserMemory>,
    trap: Vec<u8>,
    max_breakpoints: usize,
}

impl BreakpointManager {
    pub fn new(
        arch: Arc<dyn DebugArch>,
        memory: Arc<dyn UserMemory>,
        config: &BreakpointConfig,
    ) -> Self {
        Self {
            inner: RwLock::new(Inner {
                pool: Pool::new(arch.breakpoint_slots()),
                breakpoints: BTreeMap::new(),
                watchpoints: BTreeMap::new(),
                sequence: 0,
            }),
            arch,
            memory,
            trap: config.software_breakpoint.clone(),
            max_breakpoints: config.max_breakpoints,
        }
    }

    pub fn trap_instruction(&self) -> &[u8] {
        &self.trap
    }

    pub fn arch(&self) -> &Arc<dyn DebugArch> {
        &self.arch
    }

    pub fn install_breakpoint(&self, address: Word) -> Result<()> {
        let mut inner = self.inner.write();

        if inner.breakpoints.contains_key(&address) {
            return Err(Error::DuplicateBreakpoint(address));
        }
        if inner.breakpoints.len() >= self.max_breakpoints {
            return Err(Error::ResourceExhausted);
        }
        if !self.memory.is_user_address(address) {
            return Err(Error::BadAddress(address));
        }

        let realization = match self.unused_hardware_slot(&mut inner, false) {
            Some(slot) => match self.arch.set_breakpoint(address) {
                Ok(()) => {
                    inner.pool.acquire(slot, Owner::Breakpoint(address));
                    Breakpoint::Hardware(slot)
                }
                Err(e) => {
                    debug!(address, error = %e, "hardware breakpoint refused; patching instead");
                    Breakpoint::Software(self.install_software(&inner, address)?)
                }
            },
            None => Breakpoint::Software(self.install_software(&inner, address)?),
        };

        trace!(address, hardware = realization.is_hardware(), "breakpoint installed");

        let sequence = inner.next_sequence();
        inner.breakpoints.insert(
            address,
            InstalledBreakpoint {
                address,
                realization,
                sequence,
            },
        );
        Ok(())
    }

    pub fn uninstall_breakpoint(&self, address: Word) -> Result<()> {
        let mut inner = self.inner.write();

        let installed = inner
            .breakpoints
            .remove(&address)
            .ok_or(Error::NoBreakpoint(address))?;

        match installed.realization {
            Breakpoint::Hardware(slot) => {
                if let Err(e) = self.arch.clear_breakpoint(address) {
                    warn!(address, error = %e, "hardware breakpoint was not armed");
                }
                inner.pool.release(slot);
            }
            Breakpoint::Software(sw) => {
                if let Err(e) = self.uninstall_software(&inner, &sw) {
                    warn!(address, error = %e, "could not restore original instruction");
                }
            }
        }

        trace!(address, "breakpoint uninstalled");
        Ok(())
    }

    pub fn install_watchpoint(&self, address: Word, trigger: Trigger, length: usize) -> Result<()> {
        arch::breakpoint_type(trigger)?;
        arch::breakpoint_len_field(length)?;
        if trigger.contains(Trigger::Execute) {
            return Err(Error::InvalidWatchpointType(trigger.bits() as u32));
        }

        let mut inner = self.inner.write();

        if inner.watchpoints.contains_key(&address) {
            return Err(Error::DuplicateBreakpoint(address));
        }
        if inner.watchpoints.len() >= self.arch.watchpoint_slots() {
            return Err(Error::ResourceExhausted);
        }
        if !self.memory.is_user_address(address) {
            return Err(Error::BadAddress(address));
        }

        let slot = if self.arch.shared_slots() {
            Some(
                self.unused_hardware_slot(&mut inner, true)
                    .ok_or(Error::ResourceExhausted)?,
            )
        } else {
            None
        };

        self.arch.set_watchpoint(address, trigger, length)?;
        if let Some(slot) = slot {
            inner.pool.acquire(slot, Owner::Watchpoint(address));
        }

        trace!(address, length, ?trigger, "watchpoint installed");

        inner.watchpoints.insert(
            address,
            InstalledWatchpoint {
                address,
                trigger,
                length,
                slot,
            },
        );
        Ok(())
    }

    pub fn uninstall_watchpoint(&self, address: Word) -> Result<()> {
        let mut inner = self.inner.write();

        let installed = inner
            .watchpoints
            .remove(&address)
            .ok_or(Error::NoBreakpoint(address))?;

        if let Err(e) = self.arch.clear_watchpoint(address) {
            warn!(address, error = %e, "watchpoint was not armed");
        }
        if let Some(slot) = installed.slot {
            inner.pool.release(slot);
        }

        trace!(address, "watchpoint uninstalled");
        Ok(())
    }

    /// Drops every breakpoint and watchpoint, restoring patched code.
    pub fn remove_all_breakpoints(&self) {
        let mut inner = self.inner.write();

        let breakpoints = std::mem::take(&mut inner.breakpoints);
        for (address, installed) in breakpoints {
            match installed.realization {
                Breakpoint::Hardware(slot) => {
                    self.arch.clear_breakpoint(address).ok();
                    inner.pool.release(slot);
                }
                Breakpoint::Software(sw) => {
                    if let Err(e) = self.write_direct(address, &sw.original()) {
                        debug!(address, error = %e, "original instruction not restored");
                    }
                }
            }
        }

        let watchpoints = std::mem::take(&mut inner.watchpoints);
        for (address, installed) in watchpoints {
            self.arch.clear_watchpoint(address).ok();
            if let Some(slot) = installed.slot {
                inner.pool.release(slot);
            }
        }

        debug!("all breakpoints removed");
    }

    /// Promotes a software breakpoint at the resume address to hardware, so
    /// the thread can execute the original instruction without stepping
    /// over a patch.
    pub fn prepare_to_continue(&self, address: Word) {
        let mut inner = self.inner.write();

        match inner.breakpoints.get(&address) {
            Some(installed) if installed.realization.is_software() => (),
            _ => return,
        }

        let slot = match self.unused_hardware_slot(&mut inner, true) {
            Some(slot) => slot,
            None => {
                debug!(address, "no hardware slot to promote breakpoint into");
                return;
            }
        };

        // the address stays monitored: arm first, unpatch second
        if let Err(e) = self.arch.set_breakpoint(address) {
            debug!(address, error = %e, "could not arm promoted breakpoint");
            return;
        }

        let restored = match inner.breakpoints.get(&address).map(|b| &b.realization) {
            Some(Breakpoint::Software(sw)) => self.uninstall_software(&inner, sw),
            _ => Ok(()),
        };
        if let Err(e) = restored {
            warn!(address, error = %e, "could not unpatch breakpoint; keeping it in software");
            self.arch.clear_breakpoint(address).ok();
            return;
        }

        inner.pool.acquire(slot, Owner::Breakpoint(address));
        let sequence = inner.next_sequence();
        if let Some(installed) = inner.breakpoints.get_mut(&address) {
            installed.realization = Breakpoint::Hardware(slot);
            installed.sequence = sequence;
        }

        trace!(address, slot, "breakpoint promoted to hardware");
    }

    /// Reads user memory with every software breakpoint's original bytes
    /// in place of its patch. Short reads are reported as a count.
    pub fn read_memory(&self, address: Word, buffer: &mut [u8]) -> Result<usize> {
        let inner = self.inner.read();
        self.read_overlaid(&inner, address, buffer)
    }

    /// Writes user memory; bytes that fall on a software breakpoint go to
    /// its shadow copy so the trap stays in place.
    pub fn write_memory(&self, address: Word, data: &[u8]) -> Result<usize> {
        let inner = self.inner.read();
        self.write_through(&inner, address, data, None)
    }

    /// Checks whether fetching at `ip` traps. Hardware checks are skipped
    /// when `resuming` is set.
    pub fn fetch_trap(&self, ip: Word, resuming: bool) -> Option<FetchTrap> {
        let _inner = self.inner.read();

        if !resuming && self.arch.breakpoint_armed(ip) {
            return Some(FetchTrap::Hardware);
        }

        let mut bytes = vec![0; self.trap.len()];
        match self.memory.copy_from_user(ip, &mut bytes) {
            Ok(()) if bytes == self.trap => Some(FetchTrap::Software),
            _ => None,
        }
    }

    pub fn watchpoint_hit(&self, address: Word, length: usize, access: Trigger) -> Option<Word> {
        let _inner = self.inner.read();
        self.arch.watchpoint_triggered(address, length, access)
    }

    pub fn breakpoint_count(&self) -> usize {
        self.inner.read().breakpoints.len()
    }

    pub fn hardware_breakpoint_count(&self) -> usize {
        self.inner
            .read()
            .breakpoints
            .values()
            .filter(|b| b.realization.is_hardware())
            .count()
    }

    pub fn watchpoint_count(&self) -> usize {
        self.inner.read().watchpoints.len()
    }

    /// `Some(true)` when the breakpoint at `address` is in a hardware slot.
    pub fn is_hardware(&self, address: Word) -> Option<bool> {
        self.inner
            .read()
            .breakpoints
            .get(&address)
            .map(|b| b.realization.is_hardware())
    }

    pub fn watchpoint(&self, address: Word) -> Option<InstalledWatchpoint> {
        self.inner.read().watchpoints.get(&address).cloned()
    }

    pub fn slots_in_use(&self) -> usize {
        self.inner.read().pool.in_use()
    }

    pub fn slot_capacity(&self) -> usize {
        self.inner.read().pool.capacity()
    }

    /// Finds a free hardware slot. With `force`, demotes the
    /// least-recently-installed hardware breakpoint to software first; the
    /// slot is only released once the patch is in place.
    fn unused_hardware_slot(&self, inner: &mut Inner, force: bool) -> Option<SlotIndex> {
        if let Some(slot) = inner.pool.unused() {
            return Some(slot);
        }
        if !force {
            return None;
        }

        let (address, slot) = inner
            .breakpoints
            .values()
            .filter_map(|b| match b.realization {
                Breakpoint::Hardware(slot) => Some((b.sequence, b.address, slot)),
                Breakpoint::Software(_) => None,
            })
            .min_by_key(|(sequence, _, _)| *sequence)
            .map(|(_, address, slot)| (address, slot))?;

        let sw = match self.install_software(inner, address) {
            Ok(sw) => sw,
            Err(e) => {
                debug!(address, error = %e, "cannot demote hardware breakpoint");
                return None;
            }
        };

        if let Err(e) = self.arch.clear_breakpoint(address) {
            warn!(address, error = %e, "hardware breakpoint vanished during demotion");
        }
        inner.pool.release(slot);
        if let Some(installed) = inner.breakpoints.get_mut(&address) {
            installed.realization = Breakpoint::Software(sw);
        }

        trace!(address, slot, "breakpoint demoted to software");
        Some(slot)
    }

    fn install_software(&self, inner: &Inner, address: Word) -> Result<software::Breakpoint> {
        let len = self.trap.len();
        let mut original = vec![0; len];

        let read = self.read_overlaid(inner, address, &mut original)?;
        if read < len {
            return Err(Error::BadAddress(address + read as Word));
        }

        let written = write_user_memory(&*self.memory, address, &self.trap)?;
        if written < len {
            if let Err(e) = write_user_memory(&*self.memory, address, &original[..written]) {
                warn!(address, error = %e, "rollback of partial patch failed");
            }
            return Err(Error::BadAddress(address + written as Word));
        }

        Ok(software::Breakpoint::new(address, original))
    }

    fn uninstall_software(&self, inner: &Inner, sw: &software::Breakpoint) -> Result<()> {
        let original = sw.original();
        let written = self.write_through(inner, sw.address(), &original, Some(sw.address()))?;
        if written < original.len() {
            return Err(Error::BadAddress(sw.address() + written as Word));
        }
        Ok(())
    }

    fn read_overlaid(&self, inner: &Inner, address: Word, buffer: &mut [u8]) -> Result<usize> {
        let read = read_user_memory(&*self.memory, address, buffer)?;
        let end = address + read as Word;
        for sw in inner.software(address, end, self.trap.len()) {
            sw.overlay(address, &mut buffer[..read]);
        }
        Ok(read)
    }

    fn write_through(
        &self,
        inner: &Inner,
        address: Word,
        data: &[u8],
        exclude: Option<Word>,
    ) -> Result<usize> {
        if !self.memory.is_user_address(address) {
            return Err(Error::BadAddress(address));
        }
        if data.is_empty() {
            return Err(Error::BadValue);
        }

        let end = address + data.len() as Word;
        let mut cursor = 0usize;

        let patches = inner
            .software(address, end, self.trap.len())
            .filter(|sw| Some(sw.address()) != exclude);

        for sw in patches {
            let absorbed = match sw.absorb(address, data) {
                Some(range) => range,
                None => continue,
            };
            if absorbed.start > cursor {
                let n = self.write_chunk(address, data, cursor..absorbed.start)?;
                if cursor + n < absorbed.start {
                    return Ok(cursor + n);
                }
            }
            cursor = cursor.max(absorbed.end);
        }

        if cursor < data.len() {
            let n = self.write_chunk(address, data, cursor..data.len())?;
            return Ok(cursor + n);
        }
        Ok(data.len())
    }

    // the first chunk failing is an error, later ones make the write short
    fn write_chunk(&self, address: Word, data: &[u8], range: std::ops::Range<usize>) -> Result<usize> {
        let start = range.start;
        match self.write_direct(address + start as Word, &data[range]) {
            Ok(n) => Ok(n),
            Err(e) if start == 0 => Err(e),
            Err(_) => Ok(0),
        }
    }

    fn write_direct(&self, address: Word, bytes: &[u8]) -> Result<usize> {
        write_user_memory(&*self.memory, address, bytes)
    }
}

impl std::fmt::Debug for BreakpointManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.read();
        f.debug_struct("BreakpointManager")
            .field("breakpoints", &inner.breakpoints.len())
            .field("watchpoints", &inner.watchpoints.len())
            .field("slots", &inner.pool.in_use())
            .finish()
    }
}

impl Drop for BreakpointManager {
    fn drop(&mut self) {
        let inner = self.inner.get_mut();
        if !inner.breakpoints.is_empty() || !inner.watchpoints.is_empty() {
            self.remove_all_breakpoints();
        }
    }
}
