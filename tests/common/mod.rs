#![allow(dead_code)]

use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use debug_nub::arch::{CpuState, Word};
use debug_nub::memory::Protection;
use debug_nub::message::{DebuggerMessage, EventDisposition, Message, NubCommand, NubMessage, NubReply};
use debug_nub::port::Wait;
use debug_nub::team::Team;
use debug_nub::thread::Thread;
use debug_nub::{Config, Cpu, DebugEventDispatcher, Kernel, PortId, Step, ThreadId};

pub const TEXT: Word = 0x10000;
pub const TEXT_SIZE: usize = 0x2000;
pub const DATA: Word = 0x40000;
pub const DATA_SIZE: usize = 0x1000;

pub const TIMEOUT: Duration = Duration::from_secs(5);

pub fn config() -> Config {
    let mut config = Config::default();
    config.ports.poll_interval_ms = 20;
    config.ports.write_timeout_ms = 500;
    config
}

/// A debugger process: a team with an event port and a reply port.
pub struct Debugger {
    pub team: Arc<Team>,
    pub events: PortId,
    pub replies: PortId,
}

pub struct Harness {
    pub kernel: Arc<Kernel>,
    pub dispatcher: DebugEventDispatcher,
    pub app: Arc<Team>,
    pub main: Arc<Thread>,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_config(config())
    }

    pub fn with_config(config: Config) -> Self {
        let kernel = Kernel::new(config);
        let dispatcher = DebugEventDispatcher::new(kernel.clone());

        let app = kernel.create_team("app");
        let space = app.address_space();
        space.map(TEXT, TEXT_SIZE, Protection::Read | Protection::Execute).unwrap();
        space.load(TEXT, &[0x90; TEXT_SIZE]).unwrap();
        space.map(DATA, DATA_SIZE, Protection::Read | Protection::Write).unwrap();

        let main = kernel.spawn_thread(&app, "main").unwrap();
        main.set_cpu_state(CpuState::at(TEXT));

        Self {
            kernel,
            dispatcher,
            app,
            main,
        }
    }

    pub fn debugger(&self, name: &str) -> Debugger {
        let team = self.kernel.create_team(name);
        let events = self.kernel.ports().create(team.id(), 64, format!("{} events", name));
        let replies = self.kernel.ports().create(team.id(), 4, format!("{} replies", name));
        Debugger { team, events, replies }
    }

    pub fn attach(&self, debugger: &Debugger) -> PortId {
        self.dispatcher
            .session()
            .install(self.app.id(), debugger.events, false)
            .unwrap()
    }

    pub fn command(&self, debugger: &Debugger, nub: PortId, command: NubCommand) -> NubReply {
        self.kernel
            .ports()
            .write(nub, NubMessage::with_reply(command, debugger.replies), Wait::timeout(TIMEOUT))
            .unwrap();
        match self.kernel.ports().read(debugger.replies, Wait::timeout(TIMEOUT)) {
            Ok(Message::Reply(reply)) => reply,
            other => panic!("unexpected reply: {:?}", other),
        }
    }

    pub fn next_event(&self, debugger: &Debugger) -> DebuggerMessage {
        match self.kernel.ports().read(debugger.events, Wait::timeout(TIMEOUT)) {
            Ok(Message::Debugger(message)) => message,
            other => panic!("unexpected event: {:?}", other),
        }
    }

    pub fn resume(&self, debugger: &Debugger, nub: PortId, thread: ThreadId) {
        let reply = self.command(
            debugger,
            nub,
            NubCommand::ContinueThread {
                thread,
                disposition: EventDisposition::Handle,
                single_step: false,
            },
        );
        assert_eq!(reply.status(), Ok(()));
    }

    /// Runs `count` one-byte instructions of `thread` on its own OS thread.
    pub fn run(&self, thread: &Arc<Thread>, count: usize) -> JoinHandle<Vec<Step>> {
        let dispatcher = self.dispatcher.clone();
        let thread = thread.clone();
        thread::spawn(move || {
            let cpu = Cpu::new(&dispatcher, &thread);
            let mut steps = Vec::new();
            let mut executed = 0;
            while executed < count {
                let step = cpu.step(1);
                steps.push(step);
                match step {
                    Step::Executed => executed += 1,
                    Step::Trapped(_) => (),
                    Step::Killed => break,
                }
            }
            steps
        })
    }
}

pub fn wait_until(mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + TIMEOUT;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        thread::sleep(Duration::from_millis(5));
    }
    false
}
