use std::sync::Arc;
use std::time::{Duration, Instant};

use nix::sys::signal::Signal;
use tracing::{debug, trace, warn};

use crate::arch::Word;
use crate::error::{Error, Result};
use crate::kernel::{Kernel, PortId, TeamId, ThreadId};
use crate::message::{
    DebugEvent, DebugOrigin, DebuggerMessage, EventDisposition, ExceptionKind, ImageInfo, Message,
    NubReply, SignalHandler, ThreadCommand,
};
use crate::port::Wait;
use crate::profiler;
use crate::session::DebuggerSessionController;
use crate::team::{DebugSnapshot, Team, TeamDebugFlags};
use crate::thread::{Thread, ThreadDebugFlags};

/// Bit of `signal` in the ignore masks.
pub fn signal_mask(signal: i32) -> u64 {
    if (1..=64).contains(&signal) {
        1 << (signal - 1)
    } else {
        0
    }
}

/// What became of a signal that went through the debugger.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalOutcome {
    Ignored,
    Handled,
    Killed,
}

enum Resolution {
    Continue(EventDisposition),
    Restart,
}

/// Suspends reporting threads, relays their events to the debugger and
/// applies the commands sent back.
#[derive(Debug, Clone)]
pub struct DebugEventDispatcher {
    kernel: Arc<Kernel>,
    session: DebuggerSessionController,
}

impl DebugEventDispatcher {
    pub fn new(kernel: Arc<Kernel>) -> Self {
        let session = DebuggerSessionController::new(kernel.clone());
        Self { kernel, session }
    }

    pub fn session(&self) -> &DebuggerSessionController {
        &self.session
    }

    fn write_wait<'a>(&self, team: &'a Team) -> Wait<'a> {
        Wait::kill_interruptible(team.kill_latch()).with_timeout(self.kernel.config().ports.write_timeout())
    }

    /// Sends `message` to the debugger, unless the session moved to another
    /// port or a handover is under way. Returns whether it was delivered.
    fn debugger_write(&self, team: &Team, port: PortId, message: DebuggerMessage, dont_wait: bool) -> Result<bool> {
        let timeout = self.kernel.config().ports.write_timeout();
        let _write = team
            .debugger_write_lock()
            .try_lock_for(timeout)
            .ok_or(Error::TimedOut)?;

        let snapshot = team.snapshot();
        if snapshot.debugger_port != Some(port)
            || snapshot
                .flags
                .intersects(TeamDebugFlags::DebuggerHandover | TeamDebugFlags::HandingOver)
        {
            trace!(team = %team.id(), port = %port, event = message.event.name(), "event withheld");
            return Ok(false);
        }

        let wait = if dont_wait { Wait::no_wait() } else { self.write_wait(team) };
        self.kernel.ports().write(port, message, wait)?;
        Ok(true)
    }

    /// Reports `event` without stopping the thread.
    fn notify(&self, team: &Team, thread: Option<ThreadId>, event: DebugEvent) {
        let snapshot = team.snapshot();
        let port = match snapshot.debugger_port {
            Some(port) if snapshot.installed() => port,
            _ => return,
        };
        let name = event.name();
        let message = DebuggerMessage {
            origin: DebugOrigin {
                thread,
                team: team.id(),
                nub_port: snapshot.nub_port,
            },
            event,
        };
        if let Err(e) = self.debugger_write(team, port, message, true) {
            debug!(team = %team.id(), event = name, error = %e, "notification dropped");
        }
    }

    /// Stops `thread`, reports `event` and waits for the debugger to let it
    /// go. Without a debugger the event is skipped, unless
    /// `require_debugger` is false, in which case the thread waits for one.
    pub fn thread_hit_debug_event(
        &self,
        thread: &Arc<Thread>,
        event: DebugEvent,
        require_debugger: bool,
    ) -> Result<EventDisposition> {
        loop {
            match self.hit_debug_event(thread, &event, require_debugger)? {
                Resolution::Continue(disposition) => return Ok(disposition),
                Resolution::Restart => trace!(thread = %thread.id(), "debugger changed, restarting wait"),
            }
        }
    }

    fn hit_debug_event(&self, thread: &Arc<Thread>, event: &DebugEvent, require_debugger: bool) -> Result<Resolution> {
        let team = thread.team();
        let ports = self.kernel.ports();

        let mut created = if thread.flags().contains(ThreadDebugFlags::Initialized) {
            None
        } else {
            Some(ports.create(
                team.id(),
                self.kernel.config().ports.thread_port_capacity,
                format!("nub to thread {}", thread.id()),
            ))
        };

        let (snapshot, port) = {
            let info = team.debug_info().lock();
            let mut tinfo = thread.debug_info().lock();
            tinfo.flags.remove(ThreadDebugFlags::Stop);

            let snapshot = info.snapshot();
            let port = if tinfo.flags.contains(ThreadDebugFlags::NubThread) {
                Err(Error::NotAllowed)
            } else if !snapshot.installed() && require_debugger {
                Err(Error::NoDebugger(team.id()))
            } else if tinfo.flags.contains(ThreadDebugFlags::Initialized) {
                tinfo.debug_port.ok_or(Error::StateError(thread.id()))
            } else if let Some(port) = created.take() {
                tinfo.flags.insert(ThreadDebugFlags::Initialized);
                tinfo.debug_port = Some(port);
                Ok(port)
            } else {
                Err(Error::StateError(thread.id()))
            };
            if port.is_ok() {
                tinfo.flags.insert(ThreadDebugFlags::Stopped);
            }
            (snapshot, port)
        };
        if let Some(unused) = created {
            ports.delete(unused).ok();
        }
        let port = port?;

        let mut delivered = false;
        if let Some(debugger_port) = snapshot.debugger_port.filter(|_| snapshot.installed()) {
            let message = DebuggerMessage {
                origin: DebugOrigin {
                    thread: Some(thread.id()),
                    team: team.id(),
                    nub_port: snapshot.nub_port,
                },
                event: event.clone(),
            };
            match self.debugger_write(team, debugger_port, message, false) {
                Ok(sent) => delivered = sent,
                Err(e) => {
                    if matches!(e, Error::BadPortId(_)) {
                        warn!(team = %team.id(), port = %debugger_port, "debugger port gone, tearing down session");
                        if let Some(nub_port) = snapshot.nub_port {
                            ports.delete(nub_port).ok();
                        }
                    }
                    self.resume(thread, false, false);
                    return Err(e);
                }
            }
        }
        debug!(
            team = %team.id(),
            thread = %thread.id(),
            event = event.name(),
            delivered,
            "thread stopped"
        );

        let (resolution, single_step) = match self.wait_for_command(thread, port, snapshot, delivered) {
            Ok(r) => r,
            Err(e) => {
                self.resume(thread, false, false);
                return Err(e);
            }
        };

        self.resume(thread, single_step, matches!(resolution, Resolution::Restart));
        Ok(resolution)
    }

    fn wait_for_command(
        &self,
        thread: &Arc<Thread>,
        port: PortId,
        snapshot: DebugSnapshot,
        delivered: bool,
    ) -> Result<(Resolution, bool)> {
        let team = thread.team();
        let ports = self.kernel.ports();
        let poll = self.kernel.config().ports.poll_interval();

        loop {
            let wait = Wait::kill_interruptible(team.kill_latch()).with_timeout(poll);
            let command = match ports.read(port, wait) {
                Ok(Message::Thread(command)) => command,
                Ok(other) => {
                    warn!(thread = %thread.id(), message = ?other, "unexpected message on thread port");
                    continue;
                }
                Err(Error::TimedOut) => {
                    let now = team.snapshot();
                    if snapshot.installed() && !now.installed() {
                        return Ok((Resolution::Continue(EventDisposition::Handle), false));
                    }
                    if now.installed() && now.generation != snapshot.generation {
                        return Ok((Resolution::Restart, false));
                    }
                    if now.installed()
                        && !delivered
                        && !now
                            .flags
                            .intersects(TeamDebugFlags::DebuggerHandover | TeamDebugFlags::HandingOver)
                    {
                        return Ok((Resolution::Restart, false));
                    }
                    if let (true, Some(debugger_port)) = (now.installed(), now.debugger_port) {
                        if !ports.exists(debugger_port) {
                            warn!(team = %team.id(), port = %debugger_port, "debugger vanished");
                            if let Some(nub_port) = now.nub_port {
                                ports.delete(nub_port).ok();
                            }
                        }
                    }
                    continue;
                }
                Err(e) => return Err(e),
            };

            match command {
                ThreadCommand::Continue {
                    disposition,
                    single_step,
                } => {
                    trace!(thread = %thread.id(), ?disposition, single_step, "continue");
                    return Ok((Resolution::Continue(disposition), single_step));
                }
                ThreadCommand::SetCpuState(cpu) => thread.set_cpu_state(cpu),
                ThreadCommand::GetCpuState { reply_port } => {
                    let reply = NubReply::CpuState(Ok(thread.cpu_state()));
                    if let Err(e) = ports.write(reply_port, reply, self.write_wait(team)) {
                        debug!(thread = %thread.id(), error = %e, "cpu state reply failed");
                    }
                }
                ThreadCommand::DebuggerChanged => {
                    let now = team.snapshot();
                    if now.installed() && now.generation != snapshot.generation {
                        return Ok((Resolution::Restart, false));
                    }
                    if !now.installed() && snapshot.installed() {
                        return Ok((Resolution::Continue(EventDisposition::Handle), false));
                    }
                }
            }
        }
    }

    /// Clears the stopped state. Without a session the thread's debug
    /// record is destroyed; otherwise the resume address is made safe to
    /// execute while no debugger change can run.
    fn resume(&self, thread: &Arc<Thread>, single_step: bool, restart: bool) {
        let team = thread.team();

        let change = team.debugger_change().acquire();
        let (manager, destroyed) = {
            let info = team.debug_info().lock();
            let mut tinfo = thread.debug_info().lock();
            if info.installed() {
                tinfo.flags.set(ThreadDebugFlags::SingleStep, single_step);
                tinfo.flags.remove(ThreadDebugFlags::Stopped);
                (info.breakpoint_manager.clone(), None)
            } else {
                (None, Some(tinfo.take(false)))
            }
        };

        if !restart {
            let mut cpu = thread.cpu().lock();
            if let Some(manager) = &manager {
                manager.prepare_to_continue(cpu.ip);
                cpu.resume(true);
            }
            cpu.trap(single_step && manager.is_some());
        }
        drop(change);

        if let Some(old) = destroyed {
            if let Some(port) = old.debug_port {
                self.kernel.ports().delete(port).ok();
            }
            if let Some(profile) = old.profile {
                profiler::release(thread, profile);
            }
        }
    }

    /// Like `thread_hit_debug_event`, but installs the default debugger if
    /// the team has none. Fails only if no debugger could be installed.
    fn thread_hit_serious_debug_event(&self, thread: &Arc<Thread>, event: DebugEvent) -> Result<EventDisposition> {
        let team = thread.team();
        if let Err(e) = self.session.ensure_debugger_installed(team.id(), Some(thread.id())) {
            warn!(team = %team.id(), thread = %thread.id(), event = event.name(), error = %e, "no debugger for serious event");
            return Err(e);
        }
        let name = event.name();
        match self.thread_hit_debug_event(thread, event, true) {
            Ok(disposition) => Ok(disposition),
            Err(e) => {
                // the debugger went away or stalled: carry on as if handled
                debug!(team = %team.id(), thread = %thread.id(), event = name, error = %e, "debug event not delivered");
                Ok(EventDisposition::Handle)
            }
        }
    }

    pub fn pre_syscall(&self, thread: &Arc<Thread>, syscall: u32, args: &[Word]) {
        if !self.syscall_traced(thread, TeamDebugFlags::PreSyscall, ThreadDebugFlags::PreSyscall) {
            return;
        }
        let event = DebugEvent::PreSyscall {
            syscall,
            args: args.to_vec(),
        };
        self.thread_hit_debug_event(thread, event, true).ok();
    }

    pub fn post_syscall(
        &self,
        thread: &Arc<Thread>,
        syscall: u32,
        args: &[Word],
        return_value: u64,
        start_time: Instant,
    ) {
        if !self.syscall_traced(thread, TeamDebugFlags::PostSyscall, ThreadDebugFlags::PostSyscall) {
            return;
        }
        let event = DebugEvent::PostSyscall {
            syscall,
            args: args.to_vec(),
            return_value,
            start_time,
            end_time: Instant::now(),
        };
        self.thread_hit_debug_event(thread, event, true).ok();
    }

    fn syscall_traced(&self, thread: &Thread, team_flag: TeamDebugFlags, thread_flag: ThreadDebugFlags) -> bool {
        let snapshot = thread.team().snapshot();
        snapshot.installed() && (snapshot.flags.contains(team_flag) || thread.flags().contains(thread_flag))
    }

    /// Gives the debugger a chance to look at `signal` before delivery.
    /// Returns whether the signal should still be delivered.
    pub fn handle_signal(&self, thread: &Arc<Thread>, signal: i32, deadly: bool) -> bool {
        let mask = signal_mask(signal);
        {
            let mut tinfo = thread.debug_info().lock();
            if tinfo.ignore_signals_once & mask != 0 {
                tinfo.ignore_signals_once &= !mask;
                return true;
            }
            if tinfo.ignore_signals & mask != 0 {
                return true;
            }
        }

        let team = thread.team();
        if !team.snapshot().wants(TeamDebugFlags::Signals) {
            return true;
        }

        let event = DebugEvent::SignalReceived {
            signal,
            action: team.signal_action(signal),
            deadly,
        };
        !matches!(
            self.thread_hit_debug_event(thread, event, true),
            Ok(EventDisposition::Ignore)
        )
    }

    /// Applies the team's action for `signal` to `thread`, after the
    /// debugger had its say.
    pub fn deliver_signal(&self, thread: &Arc<Thread>, signal: i32) -> SignalOutcome {
        let team = thread.team();
        let action = team.signal_action(signal);
        let deadly = action.handler == SignalHandler::Default && default_kills(signal);

        if !self.handle_signal(thread, signal, deadly) {
            return SignalOutcome::Ignored;
        }

        match action.handler {
            SignalHandler::Ignore => SignalOutcome::Ignored,
            SignalHandler::Handler(_) => SignalOutcome::Handled,
            SignalHandler::Default if deadly => {
                debug!(team = %team.id(), thread = %thread.id(), signal, "killed by signal");
                team.kill(128 + signal);
                SignalOutcome::Killed
            }
            SignalHandler::Default => SignalOutcome::Ignored,
        }
    }

    /// Returns whether the exception should be turned into `signal`.
    pub fn exception_occurred(&self, thread: &Arc<Thread>, exception: ExceptionKind, signal: i32) -> bool {
        if thread.team().signal_action(signal).handler != SignalHandler::Default {
            return true;
        }
        let event = DebugEvent::ExceptionOccurred { exception, signal };
        !matches!(
            self.thread_hit_serious_debug_event(thread, event),
            Ok(EventDisposition::Ignore)
        )
    }

    /// The `debugger()` call. The team exits if no debugger can be found.
    pub fn debugger_call(&self, thread: &Arc<Thread>, message: Option<&str>) -> Result<()> {
        let event = DebugEvent::DebuggerCall {
            message: message.map(str::to_string),
        };
        match self.thread_hit_serious_debug_event(thread, event) {
            Ok(_) => Ok(()),
            Err(e) => {
                thread.team().kill(1);
                Err(e)
            }
        }
    }

    pub fn breakpoint_hit(&self, thread: &Arc<Thread>, software: bool) -> Result<EventDisposition> {
        let event = DebugEvent::BreakpointHit {
            cpu: thread.cpu_state(),
            software,
        };
        self.thread_hit_serious_debug_event(thread, event)
    }

    pub fn watchpoint_hit(&self, thread: &Arc<Thread>, address: Word) -> Result<EventDisposition> {
        let event = DebugEvent::WatchpointHit {
            cpu: thread.cpu_state(),
            address,
        };
        self.thread_hit_serious_debug_event(thread, event)
    }

    pub fn single_step(&self, thread: &Arc<Thread>) -> Result<EventDisposition> {
        let event = DebugEvent::SingleStep {
            cpu: thread.cpu_state(),
        };
        self.thread_hit_serious_debug_event(thread, event)
    }

    pub fn stop_thread(&self, thread: &Arc<Thread>) -> Result<EventDisposition> {
        self.thread_hit_serious_debug_event(thread, DebugEvent::ThreadDebugged)
    }

    /// Blocks until a debugger is installed and lets the thread go.
    pub fn wait_for_debugger(&self, thread: &Arc<Thread>) -> Result<()> {
        self.thread_hit_debug_event(thread, DebugEvent::ThreadDebugged, false)
            .map(|_| ())
    }

    pub fn team_created(&self, thread: &Arc<Thread>, new_team: TeamId) {
        if !thread.team().snapshot().wants(TeamDebugFlags::TeamCreation) {
            return;
        }
        self.thread_hit_debug_event(thread, DebugEvent::TeamCreated { new_team }, true)
            .ok();
    }

    /// The team is gone; its debugger only gets a note.
    pub fn team_deleted(&self, team: TeamId, debugger_port: PortId) {
        let message = DebuggerMessage {
            origin: DebugOrigin {
                thread: None,
                team,
                nub_port: None,
            },
            event: DebugEvent::TeamDeleted,
        };
        if let Err(e) = self.kernel.ports().write(debugger_port, message, Wait::no_wait()) {
            debug!(team = %team, port = %debugger_port, error = %e, "team deletion not reported");
        }
    }

    /// The team replaced its image: breakpoints refer to code that is gone.
    pub fn team_exec(&self, thread: &Arc<Thread>) {
        let team = thread.team();
        let (manager, image_event, snapshot) = {
            let mut info = team.debug_info().lock();
            info.image_event += 1;
            (info.breakpoint_manager.clone(), info.image_event, info.snapshot())
        };
        if let Some(manager) = manager {
            manager.remove_all_breakpoints();
        }
        team.address_space().clear();

        if snapshot.wants(TeamDebugFlags::TeamCreation) {
            self.thread_hit_debug_event(thread, DebugEvent::TeamExec { image_event }, true)
                .ok();
        }
    }

    pub fn thread_created(&self, thread: &Arc<Thread>, new_thread: ThreadId) {
        if !thread.team().snapshot().wants(TeamDebugFlags::Threads) {
            return;
        }
        self.thread_hit_debug_event(thread, DebugEvent::ThreadCreated { new_thread }, true)
            .ok();
    }

    pub fn thread_deleted(&self, team: &Team, thread: ThreadId) {
        if team.snapshot().wants(TeamDebugFlags::Threads) {
            self.notify(team, Some(thread), DebugEvent::ThreadDeleted);
        }
    }

    /// Final hook of an exiting thread: stops its profiler and destroys
    /// its debug record.
    pub fn thread_exiting(&self, thread: &Arc<Thread>) {
        let old = thread.debug_info().lock().take(true);

        if let Some(profile) = old.profile {
            let update = profiler::release(thread, profile);
            self.notify(thread.team(), Some(thread.id()), DebugEvent::ProfilerUpdate(update));
        }
        if let Some(port) = old.debug_port {
            self.kernel.ports().delete(port).ok();
        }
    }

    pub fn image_created(&self, thread: &Arc<Thread>, image: ImageInfo) {
        self.image_event(thread, image, true);
    }

    pub fn image_deleted(&self, thread: &Arc<Thread>, image: ImageInfo) {
        self.image_event(thread, image, false);
    }

    fn image_event(&self, thread: &Arc<Thread>, info: ImageInfo, created: bool) {
        let (image_event, snapshot) = {
            let mut team_info = thread.team().debug_info().lock();
            team_info.image_event += 1;
            (team_info.image_event, team_info.snapshot())
        };
        if !snapshot.wants(TeamDebugFlags::Images) {
            return;
        }
        let event = if created {
            DebugEvent::ImageCreated { info, image_event }
        } else {
            DebugEvent::ImageDeleted { info, image_event }
        };
        self.thread_hit_debug_event(thread, event, true).ok();
    }

    /// Timer tick for a profiled thread; returns whether a flush is due.
    pub fn profiler_tick(&self, thread: &Arc<Thread>, elapsed: Duration) -> bool {
        profiler::profiler_tick(thread, elapsed)
    }

    /// Runs before the thread returns to user mode: honours stop requests
    /// and hands full sample buffers to the debugger.
    pub fn thread_at_kernel_exit(&self, thread: &Arc<Thread>) {
        if thread.flags().contains(ThreadDebugFlags::Stop) {
            if let Err(e) = self.stop_thread(thread) {
                debug!(thread = %thread.id(), error = %e, "stop request dropped");
            }
        }

        if let Some(update) = profiler::pending_update(thread) {
            trace!(thread = %thread.id(), samples = update.sample_count, "profiler flush");
            if self
                .thread_hit_debug_event(thread, DebugEvent::ProfilerUpdate(update), true)
                .is_ok()
            {
                profiler::flushed(thread);
            }
        }
    }

    /// Tears down the debug state of an exiting team and removes it.
    pub fn team_exiting(&self, team_id: TeamId) -> Result<()> {
        let team = self.kernel.team(team_id)?;
        let snapshot = team.snapshot();
        team.kill(0);

        for thread in team.threads() {
            if !thread.is_nub() {
                self.thread_exiting(&thread);
            }
        }
        if snapshot.installed() {
            self.session.remove(team_id).ok();
            if let Some(port) = snapshot.debugger_port {
                self.team_deleted(team_id, port);
            }
        }
        self.kernel.remove_team(team_id)
    }
}

fn default_kills(signal: i32) -> bool {
    !matches!(
        Signal::try_from(signal),
        Ok(Signal::SIGCHLD) | Ok(Signal::SIGCONT) | Ok(Signal::SIGURG) | Ok(Signal::SIGWINCH)
    )
}

