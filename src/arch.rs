#![allow(non_upper_case_globals)]

use bitflags::bitflags;
use libc::{PROT_EXEC, PROT_READ, PROT_WRITE};
use parking_lot::Mutex;

use crate::config::BreakpointConfig;
use crate::error::{Error, Result};

#[cfg(target_pointer_width = "64")]
pub type Word = u64;
#[cfg(target_pointer_width = "32")]
pub type Word = u32;

pub const TRAP_FLAG: u32 = 0x100;
pub const RESUME_FLAG: u32 = 0x10000;

pub const MAX_WATCHPOINT_LENGTH: usize = 8;

bitflags! {
    pub struct Trigger: i32 {
        const Read = PROT_READ;
        const Write = PROT_WRITE;
        const Execute = PROT_EXEC;
    }
}

bitflags! {
    pub struct CpuFlags: u32 {
        const Trap   = TRAP_FLAG;
        const Resume = RESUME_FLAG;
    }
}

impl Default for CpuFlags {
    fn default() -> Self {
        Self::empty()
    }
}

/// Register snapshot of a debugged thread as seen by the debugger.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CpuState {
    pub ip: Word,
    pub sp: Word,
    pub flags: CpuFlags,
    pub registers: [Word; 16],
    /// Return addresses, innermost first.
    pub frames: Vec<Word>,
}

impl CpuState {
    pub fn at(ip: Word) -> Self {
        Self {
            ip,
            ..Self::default()
        }
    }

    pub fn trapped(&self) -> bool {
        self.flags.contains(CpuFlags::Trap)
    }

    pub fn trap(&mut self, val: bool) {
        self.flags.set(CpuFlags::Trap, val);
    }

    pub fn resuming(&self) -> bool {
        self.flags.contains(CpuFlags::Resume)
    }

    pub fn resume(&mut self, val: bool) {
        self.flags.set(CpuFlags::Resume, val);
    }
}

const fn dr7_enable_field_shift(i: usize) -> u32 {
    i.wrapping_mul(2) as u32
}

const fn dr7_kind_field_shift(i: usize) -> u32 {
    i.wrapping_mul(4).wrapping_add(16) as u32
}

const fn dr7_len_field_shift(i: usize) -> u32 {
    i.wrapping_mul(4).wrapping_add(18) as u32
}

#[inline(always)]
fn dr7_breakpoint_enabled(i: usize) -> Word {
    (1 as Word).checked_shl(dr7_enable_field_shift(i)).unwrap_or(0)
}

#[inline(always)]
fn dr7_kind_field(i: usize, kind: u8) -> Word {
    (kind as Word)
        .checked_shl(dr7_kind_field_shift(i))
        .unwrap_or(0)
}

#[inline(always)]
fn dr7_len_field(i: usize, len: u8) -> Word {
    (len as Word)
        .checked_shl(dr7_len_field_shift(i))
        .unwrap_or(0)
}

pub fn watchpoint_trigger(kind: u32) -> Result<Trigger> {
    let trigger = Trigger::from_bits(kind as i32).ok_or(Error::InvalidWatchpointType(kind))?;
    breakpoint_type(trigger)?;
    Ok(trigger)
}

pub(crate) fn breakpoint_type(trigger: Trigger) -> Result<u8> {
    if trigger.intersects(Trigger::Execute) && trigger != Trigger::Execute {
        Err(Error::InvalidWatchpointType(trigger.bits() as u32))
    } else if trigger == Trigger::Execute {
        Ok(0)
    } else if (trigger & !Trigger::Write) == Trigger::Read {
        Ok(3)
    } else if trigger == Trigger::Write {
        Ok(1)
    } else {
        Err(Error::InvalidWatchpointType(trigger.bits() as u32))
    }
}

pub(crate) fn breakpoint_len_field(size: usize) -> Result<u8> {
    match size {
        1 => Ok(0),
        2 => Ok(1),
        4 => Ok(3),
        8 => Ok(2),
        _ => Err(Error::InvalidWatchpointLength(size)),
    }
}

/// Register programming for instruction breakpoints and data watchpoints.
pub trait DebugArch: Send + Sync {
    fn breakpoint_slots(&self) -> usize;
    fn watchpoint_slots(&self) -> usize;
    /// Whether breakpoints and watchpoints are taken from one register pool.
    fn shared_slots(&self) -> bool;

    fn set_breakpoint(&self, address: Word) -> Result<()>;
    fn clear_breakpoint(&self, address: Word) -> Result<()>;
    fn set_watchpoint(&self, address: Word, trigger: Trigger, length: usize) -> Result<()>;
    fn clear_watchpoint(&self, address: Word) -> Result<()>;

    fn breakpoint_armed(&self, address: Word) -> bool;
    fn watchpoint_triggered(&self, address: Word, length: usize, access: Trigger) -> Option<Word>;
}

#[derive(Debug, Default, Clone)]
struct DebugRegisterSet {
    hardware: Vec<Word>,
    used: Vec<bool>,
    kind: Vec<u8>,
    len: Vec<u8>,
    control: Word,
}

impl DebugRegisterSet {
    fn with_slots(n: usize) -> Self {
        Self {
            hardware: vec![0; n],
            used: vec![false; n],
            kind: vec![0; n],
            len: vec![0; n],
            control: 0,
        }
    }

    fn update_control(&mut self) {
        let mut control = 0;
        for i in 0..self.hardware.len() {
            if self.used[i] {
                control |= dr7_breakpoint_enabled(i)
                    | dr7_kind_field(i, self.kind[i])
                    | dr7_len_field(i, self.len[i]);
            }
        }
        self.control = control;
    }

    fn find(&self, range: std::ops::Range<usize>, address: Word, execute: bool) -> Option<usize> {
        range.into_iter().find(|&i| {
            self.used[i] && self.hardware[i] == address && ((self.kind[i] == 0) == execute)
        })
    }

    fn free_slot(&self, range: std::ops::Range<usize>) -> Option<usize> {
        range.into_iter().find(|&i| !self.used[i])
    }
}

/// x86-style debug register file: address registers plus a DR7-like control
/// word. When slots are shared, breakpoints and watchpoints compete for the
/// same registers.
#[derive(Debug)]
pub struct DebugRegisters {
    regs: Mutex<DebugRegisterSet>,
    breakpoints: usize,
    watchpoints: usize,
    shared: bool,
}

impl DebugRegisters {
    pub fn new(breakpoints: usize, watchpoints: usize, shared: bool) -> Self {
        let total = if shared {
            breakpoints.max(watchpoints)
        } else {
            breakpoints + watchpoints
        };
        Self {
            regs: Mutex::new(DebugRegisterSet::with_slots(total)),
            breakpoints: if shared { total } else { breakpoints },
            watchpoints: if shared { total } else { watchpoints },
            shared,
        }
    }

    pub fn from_config(config: &BreakpointConfig) -> Self {
        Self::new(
            config.hardware_breakpoints,
            config.hardware_watchpoints,
            config.shared_slots,
        )
    }

    fn breakpoint_range(&self) -> std::ops::Range<usize> {
        0..self.breakpoints
    }

    fn watchpoint_range(&self) -> std::ops::Range<usize> {
        if self.shared {
            0..self.watchpoints
        } else {
            self.breakpoints..self.breakpoints + self.watchpoints
        }
    }

    pub fn control(&self) -> Word {
        self.regs.lock().control
    }

    pub fn armed(&self) -> usize {
        self.regs.lock().used.iter().filter(|u| **u).count()
    }

    fn set(&self, range: std::ops::Range<usize>, address: Word, kind: u8, len: u8) -> Result<()> {
        let mut regs = self.regs.lock();
        if regs.find(range.clone(), address, kind == 0).is_some() {
            return Err(Error::DuplicateBreakpoint(address));
        }
        let slot = regs.free_slot(range).ok_or(Error::ResourceExhausted)?;

        regs.hardware[slot] = address;
        regs.kind[slot] = kind;
        regs.len[slot] = len;
        regs.used[slot] = true;
        regs.update_control();
        Ok(())
    }

    fn clear(&self, range: std::ops::Range<usize>, address: Word, execute: bool) -> Result<()> {
        let mut regs = self.regs.lock();
        let slot = regs
            .find(range, address, execute)
            .ok_or(Error::NoBreakpoint(address))?;
        regs.used[slot] = false;
        regs.hardware[slot] = 0;
        regs.update_control();
        Ok(())
    }
}

impl DebugArch for DebugRegisters {
    fn breakpoint_slots(&self) -> usize {
        self.breakpoints
    }

    fn watchpoint_slots(&self) -> usize {
        self.watchpoints
    }

    fn shared_slots(&self) -> bool {
        self.shared
    }

    fn set_breakpoint(&self, address: Word) -> Result<()> {
        self.set(self.breakpoint_range(), address, 0, 0)
    }

    fn clear_breakpoint(&self, address: Word) -> Result<()> {
        self.clear(self.breakpoint_range(), address, true)
    }

    fn set_watchpoint(&self, address: Word, trigger: Trigger, length: usize) -> Result<()> {
        let kind = breakpoint_type(trigger)?;
        let len = breakpoint_len_field(length)?;
        if kind == 0 {
            return Err(Error::InvalidWatchpointType(trigger.bits() as u32));
        }
        self.set(self.watchpoint_range(), address, kind, len)
    }

    fn clear_watchpoint(&self, address: Word) -> Result<()> {
        self.clear(self.watchpoint_range(), address, false)
    }

    fn breakpoint_armed(&self, address: Word) -> bool {
        self.regs
            .lock()
            .find(self.breakpoint_range(), address, true)
            .is_some()
    }

    fn watchpoint_triggered(&self, address: Word, length: usize, access: Trigger) -> Option<Word> {
        let regs = self.regs.lock();
        let end = address.saturating_add(length as Word);
        self.watchpoint_range().into_iter().find_map(|i| {
            if !regs.used[i] || regs.kind[i] == 0 {
                return None;
            }
            let size = match regs.len[i] {
                0 => 1,
                1 => 2,
                3 => 4,
                _ => 8,
            };
            let start = regs.hardware[i];
            let overlaps = start < end && address < start + size;
            // kind 1 traps on writes only, kind 3 on reads and writes
            let wanted = regs.kind[i] == 3 || access.contains(Trigger::Write);
            if overlaps && wanted {
                Some(start)
            } else {
                None
            }
        })
    }
}
