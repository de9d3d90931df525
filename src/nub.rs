use std::sync::Arc;

use nix::sys::signal::Signal;
use tracing::{debug, info, trace, warn};

use crate::arch::{self, Word};
use crate::breakpoint::BreakpointManager;
use crate::error::{Error, Result};
use crate::kernel::{Kernel, PortId, ThreadId};
use crate::memory::UserMemory;
use crate::message::{Message, NubCommand, NubMessage, NubReply, SignalMasks, ThreadCommand};
use crate::port::Wait;
use crate::profiler;
use crate::session::{broadcast_debugger_changed, DebuggerSessionController};
use crate::team::Team;
use crate::thread::{Thread, ThreadDebugFlags};

/// Per-team command server. Runs on its own OS thread, reading the nub
/// port until it is deleted or the team dies.
#[derive(Debug)]
pub struct NubCommandLoop {
    session: DebuggerSessionController,
    team: Arc<Team>,
    thread: Arc<Thread>,
    port: PortId,
}

impl NubCommandLoop {
    pub fn new(session: DebuggerSessionController, team: Arc<Team>, thread: Arc<Thread>, port: PortId) -> Self {
        Self {
            session,
            team,
            thread,
            port,
        }
    }

    fn kernel(&self) -> &Arc<Kernel> {
        self.session.kernel()
    }

    pub fn run(self) {
        if self.team.snapshot().nub_thread != Some(self.thread.id()) {
            debug!(team = %self.team.id(), "nub thread superseded before start");
            return;
        }

        // threads waiting for any debugger may proceed now
        broadcast_debugger_changed(self.kernel(), &self.team, Some(self.thread.id()));
        debug!(team = %self.team.id(), port = %self.port, "nub running");

        loop {
            let message = match self
                .kernel()
                .ports()
                .read(self.port, Wait::kill_interruptible(self.team.kill_latch()))
            {
                Ok(Message::Nub(message)) => message,
                Ok(other) => {
                    warn!(team = %self.team.id(), message = ?other, "malformed nub message");
                    continue;
                }
                Err(e) => {
                    debug!(team = %self.team.id(), error = %e, "nub port read failed");
                    break;
                }
            };

            if !self.serve(message) {
                break;
            }
        }

        self.session.nub_cleanup(&self.team, &self.thread);
        info!(team = %self.team.id(), "nub exited");
    }

    /// Handles one command; returns false when the reply could not be sent.
    fn serve(&self, message: NubMessage) -> bool {
        let NubMessage { reply_port, command } = message;
        let opcode = command.opcode();
        trace!(team = %self.team.id(), opcode, "nub command");

        let reply = self.handle(command, reply_port);

        let (reply_port, reply) = match (reply_port, reply) {
            (Some(port), Some(reply)) => (port, reply),
            _ => return true,
        };
        if let Err(e) = reply.status() {
            debug!(team = %self.team.id(), opcode, error = %e, "nub command failed");
        }

        let wait = Wait::kill_interruptible(self.team.kill_latch())
            .with_timeout(self.kernel().config().ports.write_timeout());
        match self.kernel().ports().write(reply_port, reply, wait) {
            Ok(()) => true,
            Err(e) => {
                warn!(team = %self.team.id(), port = %reply_port, opcode, error = %e, "nub reply failed");
                false
            }
        }
    }

    fn handle(&self, command: NubCommand, reply_port: Option<PortId>) -> Option<NubReply> {
        let reply = match command {
            NubCommand::ReadMemory { address, size } => NubReply::ReadMemory(self.read_memory(address, size)),
            NubCommand::WriteMemory { address, data } => NubReply::WriteMemory(self.write_memory(address, &data)),
            NubCommand::SetTeamFlags { flags } => {
                self.team.debug_info().lock().set_user_flags(flags);
                NubReply::Status(Ok(()))
            }
            NubCommand::SetThreadFlags { thread, flags } => NubReply::Status(
                self.team_thread(thread)
                    .map(|t| t.debug_info().lock().set_user_flags(flags)),
            ),
            NubCommand::ContinueThread {
                thread,
                disposition,
                single_step,
            } => NubReply::Status(self.forward(
                thread,
                ThreadCommand::Continue {
                    disposition,
                    single_step,
                },
            )),
            NubCommand::SetCpuState { thread, cpu } => {
                NubReply::Status(self.forward(thread, ThreadCommand::SetCpuState(cpu)))
            }
            NubCommand::GetCpuState { thread } => {
                // the stopped thread replies itself
                let forwarded = reply_port
                    .ok_or(Error::BadValue)
                    .and_then(|reply_port| self.forward(thread, ThreadCommand::GetCpuState { reply_port }));
                match forwarded {
                    Ok(()) => return None,
                    Err(e) => NubReply::CpuState(Err(e)),
                }
            }
            NubCommand::SetBreakpoint { address } => NubReply::Status(
                self.user_address(address)
                    .and_then(|_| self.manager())
                    .and_then(|m| m.install_breakpoint(address)),
            ),
            NubCommand::ClearBreakpoint { address } => NubReply::Status(
                self.user_address(address)
                    .and_then(|_| self.manager())
                    .and_then(|m| m.uninstall_breakpoint(address)),
            ),
            NubCommand::SetWatchpoint { address, kind, length } => NubReply::Status(
                self.user_address(address)
                    .and_then(|_| arch::watchpoint_trigger(kind))
                    .and_then(|trigger| self.manager()?.install_watchpoint(address, trigger, length)),
            ),
            NubCommand::ClearWatchpoint { address } => NubReply::Status(
                self.user_address(address)
                    .and_then(|_| self.manager())
                    .and_then(|m| m.uninstall_watchpoint(address)),
            ),
            NubCommand::SetSignalMasks {
                thread,
                ignore,
                ignore_op,
                ignore_once,
                ignore_once_op,
            } => NubReply::Status(self.team_thread(thread).map(|t| {
                let mut info = t.debug_info().lock();
                ignore_op.apply(&mut info.ignore_signals, ignore);
                ignore_once_op.apply(&mut info.ignore_signals_once, ignore_once);
            })),
            NubCommand::GetSignalMasks { thread } => NubReply::SignalMasks(self.team_thread(thread).map(|t| {
                let info = t.debug_info().lock();
                SignalMasks {
                    ignore: info.ignore_signals,
                    ignore_once: info.ignore_signals_once,
                }
            })),
            NubCommand::SetSignalHandler { thread, signal, action } => NubReply::Status(
                self.team_thread(thread)
                    .and_then(|_| catchable(signal))
                    .map(|_| {
                        self.team.set_signal_action(signal, action);
                    }),
            ),
            NubCommand::GetSignalHandler { thread, signal } => NubReply::SignalHandler(
                self.team_thread(thread)
                    .and_then(|_| valid_signal(signal))
                    .map(|_| self.team.signal_action(signal)),
            ),
            NubCommand::PrepareHandover => NubReply::Status(self.session.prepare_handover(&self.team)),
            NubCommand::HandedOver => {
                broadcast_debugger_changed(self.kernel(), &self.team, Some(self.thread.id()));
                NubReply::Status(Ok(()))
            }
            NubCommand::StartProfiler {
                thread,
                interval,
                sample_area,
                stack_depth,
                variable_stack_depth,
            } => NubReply::StartProfiler(self.team_thread(thread).and_then(|t| {
                profiler::start_profiler(
                    self.kernel(),
                    &t,
                    interval,
                    sample_area,
                    stack_depth,
                    variable_stack_depth,
                )
            })),
            NubCommand::StopProfiler { thread } => {
                NubReply::StopProfiler(self.team_thread(thread).and_then(|t| profiler::stop_profiler(&t)))
            }
        };
        Some(reply)
    }

    fn manager(&self) -> Result<Arc<BreakpointManager>> {
        self.team
            .breakpoint_manager()
            .ok_or(Error::NoDebugger(self.team.id()))
    }

    fn user_address(&self, address: Word) -> Result<()> {
        if self.team.address_space().is_user_address(address) {
            Ok(())
        } else {
            Err(Error::BadAddress(address))
        }
    }

    fn transfer_size(&self, size: usize) -> Result<()> {
        if size == 0 || size > self.kernel().config().memory.max_read_write_size {
            Err(Error::BadValue)
        } else {
            Ok(())
        }
    }

    fn read_memory(&self, address: Word, size: usize) -> Result<Vec<u8>> {
        self.user_address(address)?;
        self.transfer_size(size)?;

        let mut buffer = vec![0; size];
        let read = self.manager()?.read_memory(address, &mut buffer)?;
        buffer.truncate(read);
        Ok(buffer)
    }

    fn write_memory(&self, address: Word, data: &[u8]) -> Result<usize> {
        self.user_address(address)?;
        self.transfer_size(data.len())?;
        self.manager()?.write_memory(address, data)
    }

    /// A non-nub thread of the debugged team.
    fn team_thread(&self, id: ThreadId) -> Result<Arc<Thread>> {
        let thread = self.kernel().thread(id)?;
        if thread.team().id() != self.team.id() || thread.is_nub() {
            return Err(Error::BadThreadId(id));
        }
        Ok(thread)
    }

    /// Sends `command` to the private port of a stopped thread.
    fn forward(&self, id: ThreadId, command: ThreadCommand) -> Result<()> {
        let thread = self.team_thread(id)?;
        let port = {
            let info = thread.debug_info().lock();
            match (info.flags.contains(ThreadDebugFlags::Stopped), info.debug_port) {
                (true, Some(port)) => port,
                _ => return Err(Error::StateError(id)),
            }
        };

        let wait = Wait::kill_interruptible(self.team.kill_latch())
            .with_timeout(self.kernel().config().ports.write_timeout());
        self.kernel().ports().write(port, command, wait)
    }
}

fn valid_signal(signal: i32) -> Result<Signal> {
    Signal::try_from(signal).map_err(|_| Error::BadValue)
}

fn catchable(signal: i32) -> Result<Signal> {
    match valid_signal(signal)? {
        Signal::SIGKILL | Signal::SIGSTOP => Err(Error::BadValue),
        signal => Ok(signal),
    }
}
