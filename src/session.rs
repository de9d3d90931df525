use std::sync::Arc;
use std::thread as os_thread;

use tracing::{debug, info, warn};

use crate::arch::DebugRegisters;
use crate::breakpoint::BreakpointManager;
use crate::error::{Error, Result};
use crate::kernel::{Kernel, PortId, TeamId, ThreadId};
use crate::message::{DebugEvent, DebugOrigin, DebuggerMessage, NubCommand, NubMessage, ThreadCommand};
use crate::nub::NubCommandLoop;
use crate::port::Wait;
use crate::team::{Team, TeamDebugFlags, TeamDebugInfo};
use crate::thread::{Thread, ThreadDebugFlags, THREAD_USER_FLAG_MASK};

/// Owns the debugger lifecycle of teams: install, handover and removal.
/// Every transition runs under the team's debugger-change slot.
#[derive(Debug, Clone)]
pub struct DebuggerSessionController {
    kernel: Arc<Kernel>,
}

impl DebuggerSessionController {
    pub fn new(kernel: Arc<Kernel>) -> Self {
        Self { kernel }
    }

    pub fn kernel(&self) -> &Arc<Kernel> {
        &self.kernel
    }

    /// Installs the debugger listening on `debugger_port` for `team_id` and
    /// returns the team's nub port. A prepared handover is completed here.
    pub fn install(&self, team_id: TeamId, debugger_port: PortId, dont_replace: bool) -> Result<PortId> {
        self.install_debugger(team_id, debugger_port, dont_replace, None)
    }

    /// Installs the default debugger unless one is installed already.
    pub fn ensure_debugger_installed(&self, team_id: TeamId, causing_thread: Option<ThreadId>) -> Result<PortId> {
        let team = self.kernel.live_team(team_id)?;
        {
            let info = team.debug_info().lock();
            if info.installed() {
                return info.nub_port.ok_or(Error::NoDebugger(team_id));
            }
            if info.flags.contains(TeamDebugFlags::DebuggerDisabled) {
                return Err(Error::NotAllowed);
            }
        }

        let port = self
            .kernel
            .default_debugger_port()
            .ok_or(Error::NoDebugger(team_id))?;
        self.install_debugger(team_id, port, true, causing_thread)
    }

    fn install_debugger(
        &self,
        team_id: TeamId,
        debugger_port: PortId,
        dont_replace: bool,
        causing_thread: Option<ThreadId>,
    ) -> Result<PortId> {
        let ports = self.kernel.ports();
        let debugger_team = ports.owner(debugger_port)?;

        if debugger_team == self.kernel.kernel_team().id() || debugger_team == team_id {
            warn!(team = %team_id, debugger = %debugger_team, "refusing to debug kernel or self");
            return Err(Error::NotAllowed);
        }

        let team = self.kernel.live_team(team_id)?;
        if team.is_kernel() {
            return Err(Error::NotAllowed);
        }

        loop {
            let change = team.debugger_change().acquire();

            let info = team.debug_info().lock();
            if info.installed() {
                if !info.flags.contains(TeamDebugFlags::DebuggerHandover) {
                    return match (dont_replace, info.nub_port) {
                        (true, Some(nub_port)) => Ok(nub_port),
                        _ => Err(Error::Busy),
                    };
                }
                drop(info);
                if let Some(nub_port) = self.hand_over(&team, debugger_team, debugger_port) {
                    return Ok(nub_port);
                }

                // the old session died under us; the nub may be queued for
                // the change slot, so it is joined without holding it
                let old = team.debug_info().lock().take_session();
                if let Some(manager) = &old.breakpoint_manager {
                    manager.remove_all_breakpoints();
                }
                drop(change);
                self.destroy_session(&team, old);
                debug!(team = %team.id(), "stale session dropped, installing afresh");
                continue;
            }
            drop(info);

            return self.start_session(&team, debugger_team, debugger_port, causing_thread);
        }
    }

    fn start_session(
        &self,
        team: &Arc<Team>,
        debugger_team: TeamId,
        debugger_port: PortId,
        causing_thread: Option<ThreadId>,
    ) -> Result<PortId> {
        let ports = self.kernel.ports();
        let config = self.kernel.config();

        let nub_port = ports.create(
            team.id(),
            config.ports.nub_port_capacity,
            format!("team {} debug", team.id()),
        );
        // the nub port goes away with the debugger team
        ports.set_owner(nub_port, debugger_team)?;

        let nub_thread = match self.kernel.spawn_thread(team, &format!("team {} debug task", team.id())) {
            Ok(thread) => thread,
            Err(e) => {
                ports.delete(nub_port).ok();
                return Err(e);
            }
        };
        nub_thread.debug_info().lock().flags = ThreadDebugFlags::NubThread;

        let manager = Arc::new(BreakpointManager::new(
            Arc::new(DebugRegisters::from_config(&config.breakpoints)),
            team.address_space().clone(),
            &config.breakpoints,
        ));

        {
            let mut info = team.debug_info().lock();
            let disabled = info.flags & TeamDebugFlags::DebuggerDisabled;
            info.flags = disabled | TeamDebugFlags::DebuggerInstalled;
            info.debugger_team = Some(debugger_team);
            info.debugger_port = Some(debugger_port);
            info.nub_port = Some(nub_port);
            info.nub_thread = Some(nub_thread.id());
            info.breakpoint_manager = Some(manager);
            info.causing_thread = causing_thread;
            info.generation += 1;
        }
        reset_thread_debug_infos(team, nub_thread.id());

        let task = NubCommandLoop::new(self.clone(), team.clone(), nub_thread.clone(), nub_port);
        let spawned = os_thread::Builder::new()
            .name(nub_thread.name().to_string())
            .spawn(move || task.run());

        match spawned {
            Ok(handle) => {
                let mut info = team.debug_info().lock();
                if info.nub_thread == Some(nub_thread.id()) {
                    info.nub_handle = Some(handle);
                }
            }
            Err(e) => {
                warn!(team = %team.id(), error = %e, "could not spawn nub thread");
                let old = team.debug_info().lock().take_session();
                self.destroy_session(team, old);
                return Err(Error::ResourceExhausted);
            }
        }

        info!(
            team = %team.id(),
            debugger = %debugger_team,
            port = %debugger_port,
            nub = %nub_port,
            "debugger installed"
        );
        Ok(nub_port)
    }

    /// Moves an installed session to a new debugger. Returns `None` if the
    /// nub port could not be handed to the new owner.
    fn hand_over(&self, team: &Arc<Team>, debugger_team: TeamId, debugger_port: PortId) -> Option<PortId> {
        let ports = self.kernel.ports();
        let config = self.kernel.config();

        let (old_port, nub_port, causing_thread) = {
            let mut info = team.debug_info().lock();
            let nub_port = info.nub_port?;

            if ports.set_owner(nub_port, debugger_team).is_err() {
                return None;
            }

            info.flags.remove(TeamDebugFlags::DebuggerHandover);
            info.flags.insert(TeamDebugFlags::HandingOver);
            let old_port = info.debugger_port.replace(debugger_port);
            info.debugger_team = Some(debugger_team);
            info.generation += 1;
            (old_port, nub_port, info.causing_thread)
        };
        let nub_thread = team.snapshot().nub_thread;
        if let Some(nub_thread) = nub_thread {
            reset_thread_debug_infos(team, nub_thread);
        }

        let notification = DebuggerMessage {
            origin: DebugOrigin {
                thread: None,
                team: team.id(),
                nub_port: Some(nub_port),
            },
            event: DebugEvent::HandedOver {
                debugger: debugger_team,
                debugger_port,
                causing_thread,
            },
        };

        let wait = Wait::kill_interruptible(team.kill_latch()).with_timeout(config.ports.write_timeout());
        if let Err(e) = ports.write(debugger_port, notification.clone(), wait) {
            warn!(team = %team.id(), port = %debugger_port, error = %e, "could not notify new debugger");
        }

        team.debug_info().lock().flags.remove(TeamDebugFlags::HandingOver);

        // stopped threads re-send their events to the new debugger
        if let Err(e) = ports.write(nub_port, NubMessage::new(NubCommand::HandedOver), wait) {
            debug!(team = %team.id(), error = %e, "could not notify nub of handover");
        }

        if let Some(old_port) = old_port {
            if let Err(e) = ports.write(old_port, notification, Wait::no_wait()) {
                debug!(team = %team.id(), port = %old_port, error = %e, "could not notify old debugger");
            }
        }

        info!(team = %team.id(), debugger = %debugger_team, port = %debugger_port, "debugger handed over");
        Some(nub_port)
    }

    /// Marks the session for handover; from now on no debug event is sent
    /// to the current debugger.
    pub fn prepare_handover(&self, team: &Team) -> Result<()> {
        let timeout = self.kernel.config().ports.write_timeout();
        let _write = team
            .debugger_write_lock()
            .try_lock_for(timeout)
            .ok_or(Error::TimedOut)?;

        let mut info = team.debug_info().lock();
        if !info.installed() {
            return Err(Error::NoDebugger(team.id()));
        }
        info.flags.insert(TeamDebugFlags::DebuggerHandover);
        debug!(team = %team.id(), "handover prepared");
        Ok(())
    }

    pub fn remove(&self, team_id: TeamId) -> Result<()> {
        let team = self.kernel.team(team_id)?;

        let change = team.debugger_change().acquire();
        let old = {
            let mut info = team.debug_info().lock();
            if !info.installed() {
                return Err(Error::NoDebugger(team_id));
            }
            info.take_session()
        };
        if let Some(manager) = &old.breakpoint_manager {
            manager.remove_all_breakpoints();
        }
        drop(change);

        self.destroy_session(&team, old);
        info!(team = %team_id, "debugger removed");
        Ok(())
    }

    /// Called by a nub thread whose port read failed.
    pub(crate) fn nub_cleanup(&self, team: &Arc<Team>, nub: &Thread) {
        let change = team.debugger_change().acquire();
        let old = {
            let mut info = team.debug_info().lock();
            if info.installed() && info.nub_thread == Some(nub.id()) {
                Some(info.take_session())
            } else {
                None
            }
        };
        if let Some(manager) = old.as_ref().and_then(|o| o.breakpoint_manager.as_ref()) {
            manager.remove_all_breakpoints();
        }
        drop(change);

        if let Some(old) = old {
            self.destroy_session(team, old);
            info!(team = %team.id(), "debugger gone");
        }

        broadcast_debugger_changed(&self.kernel, team, Some(nub.id()));
    }

    fn destroy_session(&self, team: &Team, old: TeamDebugInfo) {
        let TeamDebugInfo {
            nub_port,
            nub_thread,
            nub_handle,
            ..
        } = old;

        if let Some(port) = nub_port {
            self.kernel.ports().delete(port).ok();
        }
        if let Some(handle) = nub_handle {
            if handle.thread().id() != os_thread::current().id() && handle.join().is_err() {
                warn!(team = %team.id(), "nub thread panicked");
            }
        }
        if let Some(id) = nub_thread {
            self.kernel.remove_thread(id).ok();
        }
    }

    /// Registers the port of the debugger used when a team hits a serious
    /// event without one. Returns the previous port.
    pub fn install_default_debugger(&self, port: Option<PortId>) -> Result<Option<PortId>> {
        if let Some(port) = port {
            if self.kernel.ports().owner(port)? == self.kernel.kernel_team().id() {
                return Err(Error::NotAllowed);
            }
        }
        let previous = self.kernel.default_debugger_port();
        self.kernel.set_default_debugger_port(port);
        debug!(port = ?port.map(|p| p.0), "default debugger set");
        Ok(previous)
    }

    /// Toggles whether a debugger may be auto-installed for the team.
    /// Returns the previous state.
    pub fn disable_debugger(&self, team_id: TeamId, disable: bool) -> Result<bool> {
        let team = self.kernel.live_team(team_id)?;
        let mut info = team.debug_info().lock();
        let previous = info.flags.contains(TeamDebugFlags::DebuggerDisabled);
        info.flags.set(TeamDebugFlags::DebuggerDisabled, disable);
        Ok(previous)
    }

    /// Asks a running thread to stop at its next kernel exit.
    pub fn debug_thread(&self, thread_id: ThreadId) -> Result<()> {
        let thread = self.kernel.thread(thread_id)?;
        if thread.team().is_kernel() {
            return Err(Error::NotAllowed);
        }

        let mut info = thread.debug_info().lock();
        if info.flags.contains(ThreadDebugFlags::NubThread) {
            return Err(Error::NotAllowed);
        }
        if info.flags.contains(ThreadDebugFlags::Dying) {
            return Err(Error::BadThreadId(thread_id));
        }
        info.flags.insert(ThreadDebugFlags::Stop);
        debug!(thread = %thread_id, "stop requested");
        Ok(())
    }
}

fn reset_thread_debug_infos(team: &Team, nub_thread: ThreadId) {
    for thread in team.threads() {
        let mut info = thread.debug_info().lock();
        if thread.id() == nub_thread {
            info.flags = ThreadDebugFlags::NubThread;
        } else {
            let kernel = info.flags.bits() & !THREAD_USER_FLAG_MASK;
            info.flags = ThreadDebugFlags::from_bits_truncate(kernel);
            info.ignore_signals = 0;
            info.ignore_signals_once = 0;
        }
    }
}

/// Tells every thread with a debug port to re-evaluate its debugger.
pub(crate) fn broadcast_debugger_changed(kernel: &Kernel, team: &Team, except: Option<ThreadId>) {
    let wait = Wait::timeout(kernel.config().ports.poll_interval());
    for thread in team.threads() {
        if Some(thread.id()) == except {
            continue;
        }
        let port = {
            let info = thread.debug_info().lock();
            if !info.flags.contains(ThreadDebugFlags::Initialized) {
                continue;
            }
            match info.debug_port {
                Some(port) => port,
                None => continue,
            }
        };
        if let Err(e) = kernel.ports().write(port, ThreadCommand::DebuggerChanged, wait) {
            debug!(thread = %thread.id(), error = %e, "debugger change not delivered");
        }
    }
}
