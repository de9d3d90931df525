#![allow(non_upper_case_globals)]

use std::fmt;
use std::sync::Arc;

use bitflags::bitflags;
use parking_lot::Mutex;

use crate::arch::CpuState;
use crate::kernel::{PortId, ThreadId};
use crate::profiler::ProfileInfo;
use crate::team::Team;

bitflags! {
    pub struct ThreadDebugFlags: u32 {
        const Initialized = 0x0001;
        const Dying       = 0x0002;
        const Stop        = 0x0004;
        const Stopped     = 0x0008;
        const SingleStep  = 0x0010;
        const NubThread   = 0x0020;

        const PreSyscall  = 0x0001_0000;
        const PostSyscall = 0x0002_0000;
    }
}

pub const THREAD_USER_FLAG_MASK: u32 = 0xffff_0000;
pub const THREAD_KERNEL_FLAG_MASK: u32 = 0x0000_ffff;

impl Default for ThreadDebugFlags {
    fn default() -> Self {
        Self::empty()
    }
}

#[derive(Debug, Default)]
pub struct ThreadDebugInfo {
    pub flags: ThreadDebugFlags,
    /// Private port the thread blocks on while stopped.
    pub debug_port: Option<PortId>,
    pub ignore_signals: u64,
    pub ignore_signals_once: u64,
    pub profile: Option<ProfileInfo>,
}

impl ThreadDebugInfo {
    /// Resets the record and hands back the old contents, so the port and
    /// the profiling buffer can be released without holding the lock.
    pub fn take(&mut self, dying: bool) -> ThreadDebugInfo {
        let old = std::mem::take(self);
        if dying {
            self.flags = ThreadDebugFlags::Dying;
        }
        old
    }

    pub fn is_stopped(&self) -> bool {
        self.flags.contains(ThreadDebugFlags::Stopped)
    }

    pub fn user_flags(&self) -> u32 {
        self.flags.bits() & THREAD_USER_FLAG_MASK
    }

    pub fn set_user_flags(&mut self, flags: u32) {
        let kernel = self.flags.bits() & THREAD_KERNEL_FLAG_MASK;
        self.flags = ThreadDebugFlags::from_bits_truncate(kernel | (flags & THREAD_USER_FLAG_MASK));
    }
}

pub struct Thread {
    id: ThreadId,
    name: String,
    team: Arc<Team>,
    debug_info: Mutex<ThreadDebugInfo>,
    cpu: Mutex<CpuState>,
}

impl Thread {
    pub(crate) fn new(id: ThreadId, name: impl Into<String>, team: Arc<Team>) -> Self {
        Self {
            id,
            name: name.into(),
            team,
            debug_info: Mutex::new(ThreadDebugInfo::default()),
            cpu: Mutex::new(CpuState::default()),
        }
    }

    pub fn id(&self) -> ThreadId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn team(&self) -> &Arc<Team> {
        &self.team
    }

    pub fn debug_info(&self) -> &Mutex<ThreadDebugInfo> {
        &self.debug_info
    }

    pub fn flags(&self) -> ThreadDebugFlags {
        self.debug_info.lock().flags
    }

    pub fn is_nub(&self) -> bool {
        self.flags().contains(ThreadDebugFlags::NubThread)
    }

    pub fn cpu(&self) -> &Mutex<CpuState> {
        &self.cpu
    }

    pub fn cpu_state(&self) -> CpuState {
        self.cpu.lock().clone()
    }

    pub fn set_cpu_state(&self, cpu: CpuState) {
        *self.cpu.lock() = cpu;
    }
}

impl fmt::Debug for Thread {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Thread")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("team", &self.team.id())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn user_flags_keep_kernel_bits() {
        let mut info = ThreadDebugInfo::default();
        info.flags = ThreadDebugFlags::Initialized | ThreadDebugFlags::Stopped;
        info.set_user_flags(ThreadDebugFlags::PreSyscall.bits() | ThreadDebugFlags::SingleStep.bits());

        assert!(info.flags.contains(ThreadDebugFlags::Initialized | ThreadDebugFlags::Stopped));
        assert!(info.flags.contains(ThreadDebugFlags::PreSyscall));
        assert!(!info.flags.contains(ThreadDebugFlags::SingleStep));
        assert_eq!(info.user_flags(), ThreadDebugFlags::PreSyscall.bits());
    }

    #[test]
    fn take_marks_dying() {
        let mut info = ThreadDebugInfo {
            debug_port: Some(PortId(3)),
            ignore_signals: 0b10,
            ..ThreadDebugInfo::default()
        };
        let old = info.take(true);
        assert_eq!(old.debug_port, Some(PortId(3)));
        assert_eq!(info.flags, ThreadDebugFlags::Dying);
        assert_eq!(info.ignore_signals, 0);
    }
}
