#![allow(non_upper_case_globals)]

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::thread::JoinHandle;

use bitflags::bitflags;
use fnv::FnvHashMap as HashMap;
use parking_lot::{Condvar, Mutex, RwLock};

use crate::breakpoint::BreakpointManager;
use crate::kernel::{PortId, TeamId, ThreadId};
use crate::memory::AddressSpace;
use crate::message::SignalAction;
use crate::port::Latch;
use crate::thread::Thread;

bitflags! {
    pub struct TeamDebugFlags: u32 {
        const DebuggerInstalled = 0x0001;
        /// Set by PREPARE_HANDOVER; no event may reach the old debugger.
        const DebuggerHandover  = 0x0002;
        const HandingOver       = 0x0004;
        const DebuggerDisabled  = 0x0008;

        const Signals           = 0x0001_0000;
        const PreSyscall        = 0x0002_0000;
        const PostSyscall       = 0x0004_0000;
        const TeamCreation      = 0x0008_0000;
        const Threads           = 0x0010_0000;
        const Images            = 0x0020_0000;
    }
}

pub const TEAM_USER_FLAG_MASK: u32 = 0xffff_0000;
pub const TEAM_KERNEL_FLAG_MASK: u32 = 0x0000_ffff;

impl Default for TeamDebugFlags {
    fn default() -> Self {
        Self::empty()
    }
}

/// Debug state of a team. At most one session is active at a time; the
/// whole session is swapped out in one step under the team's lock.
#[derive(Debug, Default)]
pub struct TeamDebugInfo {
    pub flags: TeamDebugFlags,
    pub debugger_team: Option<TeamId>,
    pub debugger_port: Option<PortId>,
    pub nub_port: Option<PortId>,
    pub nub_thread: Option<ThreadId>,
    pub nub_handle: Option<JoinHandle<()>>,
    pub breakpoint_manager: Option<Arc<BreakpointManager>>,
    pub causing_thread: Option<ThreadId>,
    pub image_event: u32,
    /// Bumped on every install, handover and removal.
    pub generation: u64,
}

/// Copy of the fields event delivery needs, taken under the lock.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DebugSnapshot {
    pub flags: TeamDebugFlags,
    pub debugger_team: Option<TeamId>,
    pub debugger_port: Option<PortId>,
    pub nub_port: Option<PortId>,
    pub nub_thread: Option<ThreadId>,
    pub generation: u64,
}

impl DebugSnapshot {
    pub fn installed(&self) -> bool {
        self.flags.contains(TeamDebugFlags::DebuggerInstalled)
    }

    pub fn wants(&self, flags: TeamDebugFlags) -> bool {
        self.flags.contains(TeamDebugFlags::DebuggerInstalled | flags)
    }
}

impl TeamDebugInfo {
    pub fn installed(&self) -> bool {
        self.flags.contains(TeamDebugFlags::DebuggerInstalled)
    }

    pub fn snapshot(&self) -> DebugSnapshot {
        DebugSnapshot {
            flags: self.flags,
            debugger_team: self.debugger_team,
            debugger_port: self.debugger_port,
            nub_port: self.nub_port,
            nub_thread: self.nub_thread,
            generation: self.generation,
        }
    }

    /// Clears the session and returns it for destruction outside the lock.
    /// The image event counter and the disabled state survive.
    pub fn take_session(&mut self) -> TeamDebugInfo {
        let disabled = self.flags & TeamDebugFlags::DebuggerDisabled;
        let image_event = self.image_event;
        let generation = self.generation + 1;

        let old = std::mem::take(self);

        self.flags = disabled;
        self.image_event = image_event;
        self.generation = generation;
        old
    }

    pub fn set_user_flags(&mut self, flags: u32) {
        let kernel = self.flags.bits() & TEAM_KERNEL_FLAG_MASK;
        self.flags = TeamDebugFlags::from_bits_truncate(kernel | (flags & TEAM_USER_FLAG_MASK));
    }
}

#[derive(Debug, Default)]
struct ChangeQueue {
    next_ticket: u64,
    serving: u64,
}

/// FIFO slot admitting one debugger change (install, removal, handover) at
/// a time.
#[derive(Debug, Default)]
pub struct DebuggerChangeCondition {
    queue: Mutex<ChangeQueue>,
    cond: Condvar,
}

impl DebuggerChangeCondition {
    pub fn acquire(&self) -> ChangeGuard<'_> {
        let mut queue = self.queue.lock();
        let ticket = queue.next_ticket;
        queue.next_ticket += 1;
        while queue.serving != ticket {
            self.cond.wait(&mut queue);
        }
        ChangeGuard { condition: self }
    }

    pub fn in_flight(&self) -> usize {
        let queue = self.queue.lock();
        (queue.next_ticket - queue.serving) as usize
    }
}

pub struct ChangeGuard<'a> {
    condition: &'a DebuggerChangeCondition,
}

impl Drop for ChangeGuard<'_> {
    fn drop(&mut self) {
        self.condition.queue.lock().serving += 1;
        self.condition.cond.notify_all();
    }
}

pub struct Team {
    id: TeamId,
    name: String,
    kernel: bool,
    address_space: Arc<AddressSpace>,
    threads: RwLock<HashMap<ThreadId, Weak<Thread>>>,
    debug_info: Mutex<TeamDebugInfo>,
    debugger_change: DebuggerChangeCondition,
    debugger_write_lock: Mutex<()>,
    signal_actions: Mutex<HashMap<i32, SignalAction>>,
    kill: Latch,
    dying: AtomicBool,
    exit_status: Mutex<Option<i32>>,
}

impl Team {
    pub(crate) fn new(id: TeamId, name: impl Into<String>, kernel: bool, address_space: AddressSpace) -> Self {
        Self {
            id,
            name: name.into(),
            kernel,
            address_space: Arc::new(address_space),
            threads: RwLock::new(HashMap::default()),
            debug_info: Mutex::new(TeamDebugInfo::default()),
            debugger_change: DebuggerChangeCondition::default(),
            debugger_write_lock: Mutex::new(()),
            signal_actions: Mutex::new(HashMap::default()),
            kill: Latch::new(),
            dying: AtomicBool::new(false),
            exit_status: Mutex::new(None),
        }
    }

    pub fn id(&self) -> TeamId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_kernel(&self) -> bool {
        self.kernel
    }

    pub fn address_space(&self) -> &Arc<AddressSpace> {
        &self.address_space
    }

    pub fn debug_info(&self) -> &Mutex<TeamDebugInfo> {
        &self.debug_info
    }

    pub fn snapshot(&self) -> DebugSnapshot {
        self.debug_info.lock().snapshot()
    }

    pub fn breakpoint_manager(&self) -> Option<Arc<BreakpointManager>> {
        self.debug_info.lock().breakpoint_manager.clone()
    }

    pub fn debugger_change(&self) -> &DebuggerChangeCondition {
        &self.debugger_change
    }

    pub fn debugger_write_lock(&self) -> &Mutex<()> {
        &self.debugger_write_lock
    }

    pub fn kill_latch(&self) -> &Latch {
        &self.kill
    }

    pub fn is_dying(&self) -> bool {
        self.dying.load(Ordering::Acquire)
    }

    /// Marks the team as exiting and interrupts every kill-interruptible
    /// wait of its threads.
    pub fn kill(&self, status: i32) {
        if !self.dying.swap(true, Ordering::AcqRel) {
            *self.exit_status.lock() = Some(status);
        }
        self.kill.trigger();
    }

    pub fn exit_status(&self) -> Option<i32> {
        *self.exit_status.lock()
    }

    pub(crate) fn add_thread(&self, thread: &Arc<Thread>) {
        self.threads.write().insert(thread.id(), Arc::downgrade(thread));
    }

    pub(crate) fn remove_thread(&self, id: ThreadId) {
        self.threads.write().remove(&id);
    }

    pub fn threads(&self) -> Vec<Arc<Thread>> {
        let mut threads: Vec<_> = self.threads.read().values().filter_map(Weak::upgrade).collect();
        threads.sort_by_key(|t| t.id());
        threads
    }

    pub fn thread(&self, id: ThreadId) -> Option<Arc<Thread>> {
        self.threads.read().get(&id).and_then(Weak::upgrade)
    }

    pub fn signal_action(&self, signal: i32) -> SignalAction {
        self.signal_actions
            .lock()
            .get(&signal)
            .copied()
            .unwrap_or_default()
    }

    pub fn set_signal_action(&self, signal: i32, action: SignalAction) -> SignalAction {
        self.signal_actions
            .lock()
            .insert(signal, action)
            .unwrap_or_default()
    }
}

impl fmt::Debug for Team {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Team")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("kernel", &self.kernel)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn take_session_keeps_counters() {
        let mut info = TeamDebugInfo {
            flags: TeamDebugFlags::DebuggerInstalled | TeamDebugFlags::DebuggerDisabled | TeamDebugFlags::Signals,
            debugger_port: Some(PortId(7)),
            nub_port: Some(PortId(8)),
            image_event: 3,
            generation: 5,
            ..TeamDebugInfo::default()
        };

        let old = info.take_session();
        assert_eq!(old.debugger_port, Some(PortId(7)));
        assert!(!info.installed());
        assert_eq!(info.flags, TeamDebugFlags::DebuggerDisabled);
        assert_eq!(info.image_event, 3);
        assert_eq!(info.generation, 6);
        assert_eq!(info.nub_port, None);
    }

    #[test]
    fn user_flags_are_masked() {
        let mut info = TeamDebugInfo {
            flags: TeamDebugFlags::DebuggerInstalled,
            ..TeamDebugInfo::default()
        };
        info.set_user_flags(0xffff_ffff);
        assert!(info.flags.contains(TeamDebugFlags::DebuggerInstalled));
        assert!(!info.flags.contains(TeamDebugFlags::DebuggerHandover));
        assert!(info.flags.contains(TeamDebugFlags::Images | TeamDebugFlags::Signals));
    }

    #[test]
    fn change_condition_serves_one_at_a_time() {
        let condition = Arc::new(DebuggerChangeCondition::default());
        let active = Arc::new(Mutex::new(0usize));
        let peak = Arc::new(Mutex::new(0usize));

        let workers: Vec<_> = (0..8)
            .map(|_| {
                let condition = condition.clone();
                let active = active.clone();
                let peak = peak.clone();
                thread::spawn(move || {
                    let _guard = condition.acquire();
                    let now = {
                        let mut a = active.lock();
                        *a += 1;
                        *a
                    };
                    {
                        let mut p = peak.lock();
                        *p = (*p).max(now);
                    }
                    thread::sleep(Duration::from_millis(2));
                    *active.lock() -= 1;
                })
            })
            .collect();

        for w in workers {
            w.join().unwrap();
        }
        assert_eq!(*peak.lock(), 1);
        assert_eq!(condition.in_flight(), 0);
    }
}
