use std::sync::Arc;

use nix::sys::signal::Signal;
use tracing::trace;

use crate::arch::{Trigger, Word};
use crate::breakpoint::FetchTrap;
use crate::dispatch::{DebugEventDispatcher, SignalOutcome};
use crate::error::Result;
use crate::memory::UserMemory;
use crate::thread::Thread;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    /// The instruction ran and the instruction pointer moved on.
    Executed,
    /// A breakpoint fired; the instruction did not run.
    Trapped(FetchTrap),
    /// The trap could not be debugged and killed the team.
    Killed,
}

/// Drives one debuggee thread through instructions and data accesses,
/// raising the traps a real CPU would.
#[derive(Debug)]
pub struct Cpu<'a> {
    dispatcher: &'a DebugEventDispatcher,
    thread: &'a Arc<Thread>,
}

impl<'a> Cpu<'a> {
    pub fn new(dispatcher: &'a DebugEventDispatcher, thread: &'a Arc<Thread>) -> Self {
        Self { dispatcher, thread }
    }

    pub fn ip(&self) -> Word {
        self.thread.cpu().lock().ip
    }

    pub fn jump(&self, ip: Word) {
        self.thread.cpu().lock().ip = ip;
    }

    /// Executes the `len`-byte instruction at the instruction pointer.
    pub fn step(&self, len: usize) -> Step {
        let (ip, resuming) = {
            let cpu = self.thread.cpu().lock();
            (cpu.ip, cpu.resuming())
        };

        if let Some(trap) = self.fetch_trap(ip, resuming) {
            trace!(thread = %self.thread.id(), ip, ?trap, "fetch trap");
            let hit = self
                .dispatcher
                .breakpoint_hit(self.thread, trap == FetchTrap::Software);
            return match hit {
                Ok(_) => Step::Trapped(trap),
                Err(_) => self.trap_signal(),
            };
        }

        let single_step = {
            let mut cpu = self.thread.cpu().lock();
            cpu.ip += len as Word;
            cpu.resume(false);
            cpu.trapped()
        };

        if single_step && self.dispatcher.single_step(self.thread).is_err() {
            return self.trap_signal();
        }
        Step::Executed
    }

    /// Runs instructions of `len` bytes until the thread traps or `count`
    /// instructions have executed.
    pub fn run(&self, len: usize, count: usize) -> Step {
        for _ in 0..count {
            match self.step(len) {
                Step::Executed => (),
                other => return other,
            }
        }
        Step::Executed
    }

    pub fn load(&self, address: Word, buffer: &mut [u8]) -> Result<Step> {
        self.thread.team().address_space().copy_from_user(address, buffer)?;
        Ok(self.data_access(address, buffer.len(), Trigger::Read))
    }

    pub fn store(&self, address: Word, data: &[u8]) -> Result<Step> {
        self.thread.team().address_space().copy_to_user(address, data)?;
        Ok(self.data_access(address, data.len(), Trigger::Write))
    }

    fn data_access(&self, address: Word, len: usize, access: Trigger) -> Step {
        let hit = self
            .thread
            .team()
            .breakpoint_manager()
            .and_then(|m| m.watchpoint_hit(address, len, access));

        match hit {
            Some(watched) => match self.dispatcher.watchpoint_hit(self.thread, watched) {
                Ok(_) => Step::Executed,
                Err(_) => self.trap_signal(),
            },
            None => Step::Executed,
        }
    }

    fn fetch_trap(&self, ip: Word, resuming: bool) -> Option<FetchTrap> {
        let team = self.thread.team();
        if let Some(manager) = team.breakpoint_manager() {
            return manager.fetch_trap(ip, resuming);
        }

        // a trap instruction left in an undebugged team
        let trap = &self.dispatcher.session().kernel().config().breakpoints.software_breakpoint;
        let mut bytes = vec![0; trap.len()];
        match team.address_space().copy_from_user(ip, &mut bytes) {
            Ok(()) if &bytes == trap => Some(FetchTrap::Software),
            _ => None,
        }
    }

    fn trap_signal(&self) -> Step {
        match self.dispatcher.deliver_signal(self.thread, Signal::SIGTRAP as i32) {
            SignalOutcome::Killed => Step::Killed,
            _ => Step::Executed,
        }
    }
}
