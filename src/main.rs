use std::thread;
use std::time::Duration;

use anyhow::{anyhow, bail, Context};
use clap::{App, Arg};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use debug_nub::arch::{CpuState, Word};
use debug_nub::memory::Protection;
use debug_nub::message::{DebugEvent, EventDisposition, Message, NubCommand, NubMessage, NubReply};
use debug_nub::port::Wait;
use debug_nub::{Config, Cpu, DebugEventDispatcher, Kernel, PortId, Step};

const TEXT: Word = 0x10000;
const TEXT_SIZE: usize = 0x1000;

fn command(kernel: &Kernel, nub: PortId, reply: PortId, command: NubCommand) -> anyhow::Result<NubReply> {
    let opcode = command.opcode();
    kernel
        .ports()
        .write(nub, NubMessage::with_reply(command, reply), Wait::timeout(Duration::from_secs(2)))
        .with_context(|| format!("sending {}", opcode))?;

    match kernel.ports().read(reply, Wait::timeout(Duration::from_secs(2)))? {
        Message::Reply(reply) => Ok(reply),
        other => bail!("unexpected reply to {}: {:?}", opcode, other),
    }
}

fn main() -> anyhow::Result<()> {
    let matches = App::new("debug-nub")
        .about("Runs a scripted debug session against a simulated team")
        .arg(
            Arg::with_name("config")
                .short("c")
                .long("config")
                .takes_value(true)
                .help("TOML configuration file"),
        )
        .arg(
            Arg::with_name("breakpoints")
                .short("b")
                .long("breakpoints")
                .takes_value(true)
                .default_value("6")
                .help("Number of breakpoints to set"),
        )
        .arg(
            Arg::with_name("instructions")
                .short("n")
                .long("instructions")
                .takes_value(true)
                .default_value("64")
                .help("Instructions the debuggee executes"),
        )
        .get_matches();

    let config = match matches.value_of("config") {
        Some(path) => Config::from_file(path).with_context(|| format!("loading {}", path))?,
        None => Config::default(),
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.logging.level)),
        )
        .init();

    let breakpoints: usize = matches.value_of("breakpoints").unwrap_or("6").parse()?;
    let instructions: usize = matches.value_of("instructions").unwrap_or("64").parse()?;

    let kernel = Kernel::new(config);
    let dispatcher = DebugEventDispatcher::new(kernel.clone());

    let debugger = kernel.create_team("debugger");
    let debugger_port = kernel.ports().create(
        debugger.id(),
        kernel.config().ports.debugger_port_capacity,
        "debugger events",
    );
    let reply_port = kernel.ports().create(debugger.id(), 4, "debugger replies");

    let app = kernel.create_team("app");
    app.address_space()
        .map(TEXT, TEXT_SIZE, Protection::Read | Protection::Execute)?;
    app.address_space().load(TEXT, &[0x90; TEXT_SIZE])?;
    let main_thread = kernel.spawn_thread(&app, "main")?;
    main_thread.set_cpu_state(CpuState::at(TEXT));

    let nub = dispatcher.session().install(app.id(), debugger_port, false)?;
    info!(team = %app.id(), nub = %nub, "debugging app");

    for i in 0..breakpoints {
        let address = TEXT + (i as Word) * 8;
        command(&kernel, nub, reply_port, NubCommand::SetBreakpoint { address })?
            .status()
            .map_err(|e| anyhow!("breakpoint at {:#x}: {}", address, e))?;
    }

    let runner = {
        let dispatcher = dispatcher.clone();
        let thread = main_thread.clone();
        thread::Builder::new()
            .name("app main".into())
            .spawn(move || {
                let cpu = Cpu::new(&dispatcher, &thread);
                let mut executed = 0;
                while executed < instructions {
                    match cpu.step(1) {
                        Step::Executed => executed += 1,
                        Step::Trapped(_) => (),
                        Step::Killed => break,
                    }
                }
                cpu.ip()
            })?
    };

    let mut hits = 0;
    while !runner.is_finished() || kernel.ports().get(debugger_port)?.queued() > 0 {
        let message = match kernel.ports().read(debugger_port, Wait::timeout(Duration::from_millis(50))) {
            Ok(Message::Debugger(message)) => message,
            Ok(other) => {
                warn!(message = ?other, "unexpected message on debugger port");
                continue;
            }
            Err(_) => continue,
        };

        let thread = match message.origin.thread {
            Some(thread) => thread,
            None => continue,
        };
        if let DebugEvent::BreakpointHit { cpu, software } = &message.event {
            hits += 1;
            let code = match command(&kernel, nub, reply_port, NubCommand::ReadMemory { address: cpu.ip, size: 4 })? {
                NubReply::ReadMemory(Ok(bytes)) => bytes,
                other => bail!("read failed: {:?}", other),
            };
            info!(ip = cpu.ip, software = *software, code = ?code, "breakpoint hit");
        }

        command(
            &kernel,
            nub,
            reply_port,
            NubCommand::ContinueThread {
                thread,
                disposition: EventDisposition::Handle,
                single_step: false,
            },
        )?
        .status()?;
    }

    let ip = runner.join().map_err(|_| anyhow!("debuggee panicked"))?;
    info!(hits, ip, "debuggee finished");

    dispatcher.session().remove(app.id())?;
    dispatcher.team_exiting(app.id())?;
    Ok(())
}
