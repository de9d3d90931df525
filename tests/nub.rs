mod common;

use std::thread;
use std::time::{Duration, Instant};

use common::*;
use debug_nub::memory::UserMemory;
use debug_nub::arch::{CpuState, Word};
use debug_nub::message::{
    DebugEvent, EventDisposition, NubCommand, NubReply, SignalAction, SignalHandler, SignalMaskOp, SignalMasks,
};
use debug_nub::team::TeamDebugFlags;
use debug_nub::thread::ThreadDebugFlags;
use debug_nub::{Cpu, Error, Step};
use nix::sys::signal::Signal;

#[test]
fn memory_commands_hide_breakpoints() {
    let mut config = config();
    config.breakpoints.hardware_breakpoints = 0;
    config.breakpoints.hardware_watchpoints = 0;
    let h = Harness::with_config(config);
    let debugger = h.debugger("debugger");
    let nub = h.attach(&debugger);

    let address = TEXT + 0x10;
    assert_eq!(
        h.command(&debugger, nub, NubCommand::SetBreakpoint { address }).status(),
        Ok(())
    );
    assert_eq!(
        h.command(&debugger, nub, NubCommand::ReadMemory { address, size: 1 }),
        NubReply::ReadMemory(Ok(vec![0x90]))
    );

    let data = vec![0xaa, 0xbb, 0xcc, 0xdd];
    assert_eq!(
        h.command(&debugger, nub, NubCommand::WriteMemory { address: address - 1, data: data.clone() }),
        NubReply::WriteMemory(Ok(4))
    );
    assert_eq!(
        h.command(&debugger, nub, NubCommand::ReadMemory { address: address - 1, size: 4 }),
        NubReply::ReadMemory(Ok(data))
    );

    assert_eq!(
        h.command(&debugger, nub, NubCommand::ClearBreakpoint { address }).status(),
        Ok(())
    );
    assert_eq!(
        h.command(&debugger, nub, NubCommand::ReadMemory { address, size: 1 }),
        NubReply::ReadMemory(Ok(vec![0xbb]))
    );
}

#[test]
fn short_read_reports_transferred_bytes() {
    let h = Harness::new();
    let debugger = h.debugger("debugger");
    let nub = h.attach(&debugger);

    let end = TEXT + TEXT_SIZE as Word;
    assert_eq!(
        h.command(&debugger, nub, NubCommand::ReadMemory { address: end - 3, size: 8 }),
        NubReply::ReadMemory(Ok(vec![0x90; 3]))
    );
}

#[test]
fn malformed_commands_get_error_replies() {
    let h = Harness::new();
    let debugger = h.debugger("debugger");
    let nub = h.attach(&debugger);
    let main = h.main.id();

    let cases = vec![
        (NubCommand::ReadMemory { address: TEXT, size: 0 }, Error::BadValue),
        (NubCommand::ReadMemory { address: TEXT, size: 4096 }, Error::BadValue),
        (NubCommand::ReadMemory { address: 0, size: 4 }, Error::BadAddress(0)),
        (NubCommand::WriteMemory { address: 0x10, data: vec![1] }, Error::BadAddress(0x10)),
        (
            NubCommand::ContinueThread {
                thread: main,
                disposition: EventDisposition::Handle,
                single_step: false,
            },
            Error::StateError(main),
        ),
        (
            NubCommand::SetWatchpoint { address: DATA, kind: 4, length: 4 },
            Error::InvalidWatchpointType(4),
        ),
        (
            NubCommand::SetWatchpoint { address: DATA, kind: 2, length: 3 },
            Error::InvalidWatchpointLength(3),
        ),
        (NubCommand::ClearBreakpoint { address: TEXT }, Error::NoBreakpoint(TEXT)),
        (
            NubCommand::SetSignalHandler {
                thread: main,
                signal: Signal::SIGKILL as i32,
                action: SignalAction::default(),
            },
            Error::BadValue,
        ),
        (NubCommand::StopProfiler { thread: main }, Error::BadValue),
        (
            NubCommand::SetThreadFlags {
                thread: debug_nub::ThreadId(9999),
                flags: 0,
            },
            Error::BadThreadId(debug_nub::ThreadId(9999)),
        ),
    ];

    for (command, error) in cases {
        let opcode = command.opcode();
        assert_eq!(h.command(&debugger, nub, command).status(), Err(error), "{}", opcode);
    }
    assert!(h.app.snapshot().installed());
}

#[test]
fn duplicate_watchpoint_is_rejected() {
    let h = Harness::new();
    let debugger = h.debugger("debugger");
    let nub = h.attach(&debugger);

    let set = || NubCommand::SetWatchpoint { address: DATA, kind: 2, length: 4 };
    assert_eq!(h.command(&debugger, nub, set()).status(), Ok(()));
    assert_eq!(
        h.command(&debugger, nub, set()).status(),
        Err(Error::DuplicateBreakpoint(DATA))
    );
}

#[test]
fn cpu_state_is_read_and_written_through_stopped_thread() {
    let h = Harness::new();
    let debugger = h.debugger("debugger");
    let nub = h.attach(&debugger);
    let main = h.main.id();

    h.command(&debugger, nub, NubCommand::SetBreakpoint { address: TEXT + 4 });
    let runner = h.run(&h.main, 8);
    h.next_event(&debugger);

    match h.command(&debugger, nub, NubCommand::GetCpuState { thread: main }) {
        NubReply::CpuState(Ok(cpu)) => assert_eq!(cpu.ip, TEXT + 4),
        other => panic!("unexpected reply {:?}", other),
    }

    let moved = CpuState::at(TEXT + 0x40);
    assert_eq!(
        h.command(&debugger, nub, NubCommand::SetCpuState { thread: main, cpu: moved }).status(),
        Ok(())
    );
    h.resume(&debugger, nub, main);

    assert!(wait_until(|| runner.is_finished()));
    assert_eq!(h.main.cpu_state().ip, TEXT + 0x40 + 4);
}

#[test]
fn single_step_reports_next_instruction() {
    let h = Harness::new();
    let debugger = h.debugger("debugger");
    let nub = h.attach(&debugger);
    let main = h.main.id();

    h.command(&debugger, nub, NubCommand::SetBreakpoint { address: TEXT + 2 });
    let runner = h.run(&h.main, 6);
    h.next_event(&debugger);

    let step = NubCommand::ContinueThread {
        thread: main,
        disposition: EventDisposition::Handle,
        single_step: true,
    };
    assert_eq!(h.command(&debugger, nub, step).status(), Ok(()));

    match h.next_event(&debugger).event {
        DebugEvent::SingleStep { cpu } => assert_eq!(cpu.ip, TEXT + 3),
        other => panic!("expected single step, got {:?}", other),
    }
    assert!(h.main.flags().contains(ThreadDebugFlags::SingleStep));

    h.resume(&debugger, nub, main);
    assert!(wait_until(|| runner.is_finished()));
    assert!(!h.main.cpu_state().trapped());
}

#[test]
fn software_breakpoint_resumes_without_retrapping() {
    let mut config = config();
    config.breakpoints.hardware_breakpoints = 1;
    config.breakpoints.hardware_watchpoints = 1;
    let h = Harness::with_config(config);
    let debugger = h.debugger("debugger");
    let nub = h.attach(&debugger);

    h.command(&debugger, nub, NubCommand::SetBreakpoint { address: TEXT + 1 });
    h.command(&debugger, nub, NubCommand::SetBreakpoint { address: TEXT + 3 });

    let runner = h.run(&h.main, 6);
    for ip in [TEXT + 1, TEXT + 3] {
        let event = h.next_event(&debugger);
        match event.event {
            DebugEvent::BreakpointHit { cpu, .. } => assert_eq!(cpu.ip, ip),
            other => panic!("unexpected event {:?}", other),
        }
        h.resume(&debugger, nub, h.main.id());
    }

    let steps = runner.join().unwrap();
    let traps = steps.iter().filter(|s| matches!(s, Step::Trapped(_))).count();
    assert_eq!(traps, 2);
}

#[test]
fn watchpoint_reports_data_access() {
    let h = Harness::new();
    let debugger = h.debugger("debugger");
    let nub = h.attach(&debugger);

    h.command(&debugger, nub, NubCommand::SetWatchpoint { address: DATA, kind: 2, length: 4 });

    let store = {
        let dispatcher = h.dispatcher.clone();
        let main = h.main.clone();
        thread::spawn(move || {
            let cpu = Cpu::new(&dispatcher, &main);
            let mut buf = [0u8; 4];
            assert_eq!(cpu.load(DATA, &mut buf), Ok(Step::Executed));
            cpu.store(DATA + 2, &[7])
        })
    };

    let event = h.next_event(&debugger);
    assert!(matches!(event.event, DebugEvent::WatchpointHit { address, .. } if address == DATA));
    h.resume(&debugger, nub, h.main.id());
    assert_eq!(store.join().unwrap(), Ok(Step::Executed));
}

#[test]
fn signal_masks_and_handlers() {
    let h = Harness::new();
    let debugger = h.debugger("debugger");
    let nub = h.attach(&debugger);
    let main = h.main.id();
    let usr1 = Signal::SIGUSR1 as i32;
    let usr2 = Signal::SIGUSR2 as i32;

    h.command(&debugger, nub, NubCommand::SetTeamFlags { flags: TeamDebugFlags::Signals.bits() });
    let set = NubCommand::SetSignalMasks {
        thread: main,
        ignore: debug_nub::dispatch::signal_mask(usr1),
        ignore_op: SignalMaskOp::Or,
        ignore_once: debug_nub::dispatch::signal_mask(usr2),
        ignore_once_op: SignalMaskOp::Set,
    };
    assert_eq!(h.command(&debugger, nub, set).status(), Ok(()));
    assert_eq!(
        h.command(&debugger, nub, NubCommand::GetSignalMasks { thread: main }),
        NubReply::SignalMasks(Ok(SignalMasks {
            ignore: 1 << (usr1 - 1),
            ignore_once: 1 << (usr2 - 1),
        }))
    );

    // both are let through without a stop
    assert!(h.dispatcher.handle_signal(&h.main, usr1, false));
    assert!(h.dispatcher.handle_signal(&h.main, usr2, false));
    assert_eq!(h.main.debug_info().lock().ignore_signals_once, 0);

    let action = SignalAction {
        handler: SignalHandler::Handler(0x2000),
        ..SignalAction::default()
    };
    let set = NubCommand::SetSignalHandler {
        thread: main,
        signal: usr2,
        action,
    };
    assert_eq!(h.command(&debugger, nub, set).status(), Ok(()));
    assert_eq!(
        h.command(&debugger, nub, NubCommand::GetSignalHandler { thread: main, signal: usr2 }),
        NubReply::SignalHandler(Ok(action))
    );

    // the second one stops; the debugger swallows it
    let signal = {
        let dispatcher = h.dispatcher.clone();
        let main = h.main.clone();
        thread::spawn(move || dispatcher.handle_signal(&main, usr2, false))
    };
    match h.next_event(&debugger).event {
        DebugEvent::SignalReceived { signal, action: got, deadly } => {
            assert_eq!(signal, usr2);
            assert_eq!(got, action);
            assert!(!deadly);
        }
        other => panic!("unexpected event {:?}", other),
    }
    let ignore = NubCommand::ContinueThread {
        thread: main,
        disposition: EventDisposition::Ignore,
        single_step: false,
    };
    h.command(&debugger, nub, ignore);
    assert!(!signal.join().unwrap());
}

#[test]
fn thread_and_image_events_follow_team_flags() {
    let h = Harness::new();
    let debugger = h.debugger("debugger");
    let nub = h.attach(&debugger);
    let flags = (TeamDebugFlags::Threads | TeamDebugFlags::Images).bits();
    h.command(&debugger, nub, NubCommand::SetTeamFlags { flags });

    let worker = h.kernel.spawn_thread(&h.app, "worker").unwrap();
    let created = {
        let dispatcher = h.dispatcher.clone();
        let main = h.main.clone();
        let id = worker.id();
        thread::spawn(move || dispatcher.thread_created(&main, id))
    };
    assert_eq!(
        h.next_event(&debugger).event,
        DebugEvent::ThreadCreated { new_thread: worker.id() }
    );
    h.resume(&debugger, nub, h.main.id());
    created.join().unwrap();

    h.dispatcher.thread_exiting(&worker);
    h.dispatcher.thread_deleted(&h.app, worker.id());
    let deleted = h.next_event(&debugger);
    assert_eq!(deleted.event, DebugEvent::ThreadDeleted);
    assert_eq!(deleted.origin.thread, Some(worker.id()));

    let image = debug_nub::message::ImageInfo {
        id: 1,
        name: "libc.so".into(),
        text: TEXT,
        text_size: TEXT_SIZE,
        data: DATA,
        data_size: DATA_SIZE,
    };
    let unloaded = {
        let dispatcher = h.dispatcher.clone();
        let main = h.main.clone();
        let image = image.clone();
        thread::spawn(move || dispatcher.image_deleted(&main, image))
    };
    assert_eq!(
        h.next_event(&debugger).event,
        DebugEvent::ImageDeleted { info: image, image_event: 1 }
    );
    h.resume(&debugger, nub, h.main.id());
    unloaded.join().unwrap();
}

#[test]
fn profiler_samples_and_flushes() {
    let h = Harness::new();
    let debugger = h.debugger("debugger");
    let nub = h.attach(&debugger);
    let main = h.main.id();

    let area = h.kernel.create_area(debugger.team.id(), 10 * 8).unwrap();
    let start = NubCommand::StartProfiler {
        thread: main,
        interval: Duration::from_millis(1),
        sample_area: area,
        stack_depth: 1,
        variable_stack_depth: false,
    };
    assert_eq!(
        h.command(&debugger, nub, start),
        NubReply::StartProfiler(Ok(Duration::from_millis(1)))
    );

    for _ in 0..7 {
        h.dispatcher.profiler_tick(&h.main, Duration::from_millis(1));
    }

    let exit = {
        let dispatcher = h.dispatcher.clone();
        let main = h.main.clone();
        thread::spawn(move || dispatcher.thread_at_kernel_exit(&main))
    };
    match h.next_event(&debugger).event {
        DebugEvent::ProfilerUpdate(update) => {
            assert_eq!(update.sample_count, 7);
            assert!(!update.stopped);
        }
        other => panic!("unexpected event {:?}", other),
    }
    h.resume(&debugger, nub, main);
    exit.join().unwrap();

    h.dispatcher.profiler_tick(&h.main, Duration::from_millis(1));
    match h.command(&debugger, nub, NubCommand::StopProfiler { thread: main }) {
        NubReply::StopProfiler(Ok(update)) => {
            assert!(update.stopped);
            assert_eq!(update.sample_count, 1);
        }
        other => panic!("unexpected reply {:?}", other),
    }
    assert!(!h.kernel.clone_area(area).unwrap().is_locked());
}

#[test]
fn get_cpu_state_of_running_thread_fails() {
    let h = Harness::new();
    let debugger = h.debugger("debugger");
    let nub = h.attach(&debugger);

    assert_eq!(
        h.command(&debugger, nub, NubCommand::GetCpuState { thread: h.main.id() }),
        NubReply::CpuState(Err(Error::StateError(h.main.id())))
    );
}

#[test]
fn syscall_events_follow_team_and_thread_flags() {
    let h = Harness::new();
    let debugger = h.debugger("debugger");
    let nub = h.attach(&debugger);
    let worker = h.kernel.spawn_thread(&h.app, "worker").unwrap();
    let events = h.kernel.ports().get(debugger.events).unwrap();

    h.dispatcher.pre_syscall(&h.main, 3, &[1]);
    h.dispatcher.post_syscall(&h.main, 3, &[1], 0, Instant::now());
    assert_eq!(events.queued(), 0);

    let flags = ThreadDebugFlags::PreSyscall.bits();
    assert_eq!(
        h.command(&debugger, nub, NubCommand::SetThreadFlags { thread: h.main.id(), flags }).status(),
        Ok(())
    );
    h.dispatcher.pre_syscall(&worker, 3, &[1]);
    assert_eq!(events.queued(), 0);

    let pre = {
        let dispatcher = h.dispatcher.clone();
        let main = h.main.clone();
        thread::spawn(move || dispatcher.pre_syscall(&main, 3, &[1, 2]))
    };
    let event = h.next_event(&debugger);
    assert_eq!(event.origin.thread, Some(h.main.id()));
    assert_eq!(
        event.event,
        DebugEvent::PreSyscall {
            syscall: 3,
            args: vec![1, 2]
        }
    );
    h.resume(&debugger, nub, h.main.id());
    pre.join().unwrap();

    let flags = TeamDebugFlags::PostSyscall.bits();
    assert_eq!(h.command(&debugger, nub, NubCommand::SetTeamFlags { flags }).status(), Ok(()));
    let post = {
        let dispatcher = h.dispatcher.clone();
        let worker = worker.clone();
        thread::spawn(move || dispatcher.post_syscall(&worker, 4, &[], 7, Instant::now()))
    };
    let event = h.next_event(&debugger);
    assert_eq!(event.origin.thread, Some(worker.id()));
    match event.event {
        DebugEvent::PostSyscall {
            syscall,
            return_value,
            start_time,
            end_time,
            ..
        } => {
            assert_eq!((syscall, return_value), (4, 7));
            assert!(end_time >= start_time);
        }
        other => panic!("unexpected event {:?}", other),
    }
    h.resume(&debugger, nub, worker.id());
    post.join().unwrap();
}

#[test]
fn exec_drops_breakpoints_and_reports_new_image() {
    let h = Harness::new();
    let debugger = h.debugger("debugger");
    let nub = h.attach(&debugger);

    let address = TEXT + 4;
    assert_eq!(
        h.command(&debugger, nub, NubCommand::SetBreakpoint { address }).status(),
        Ok(())
    );
    let flags = TeamDebugFlags::TeamCreation.bits();
    assert_eq!(h.command(&debugger, nub, NubCommand::SetTeamFlags { flags }).status(), Ok(()));

    let exec = {
        let dispatcher = h.dispatcher.clone();
        let main = h.main.clone();
        thread::spawn(move || dispatcher.team_exec(&main))
    };
    assert_eq!(h.next_event(&debugger).event, DebugEvent::TeamExec { image_event: 1 });

    let manager = h.app.breakpoint_manager().unwrap();
    assert_eq!(manager.breakpoint_count(), 0);
    assert!(h.app.address_space().area_for(TEXT).is_none());

    h.resume(&debugger, nub, h.main.id());
    exec.join().unwrap();
    assert_eq!(
        h.command(&debugger, nub, NubCommand::ClearBreakpoint { address }).status(),
        Err(Error::NoBreakpoint(address))
    );
}
