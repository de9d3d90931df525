use std::sync::Arc;
use std::thread;

use debug_nub::arch::{DebugRegisters, Trigger, Word};
use debug_nub::config::{BreakpointConfig, MemoryConfig};
use debug_nub::memory::{AddressSpace, Protection, UserMemory};
use debug_nub::{BreakpointManager, Error};

const TEXT: Word = 0x10000;
const DATA: Word = 0x40000;

fn manager(breakpoints: usize, watchpoints: usize, shared: bool) -> (Arc<AddressSpace>, BreakpointManager) {
    let space = Arc::new(AddressSpace::new(&MemoryConfig::default()));
    space.map(TEXT, 0x4000, Protection::Read | Protection::Execute).unwrap();
    space.load(TEXT, &[0x90; 0x4000]).unwrap();
    space.map(DATA, 0x1000, Protection::Read | Protection::Write).unwrap();

    let config = BreakpointConfig {
        hardware_breakpoints: breakpoints,
        hardware_watchpoints: watchpoints,
        shared_slots: shared,
        ..BreakpointConfig::default()
    };
    let arch = Arc::new(DebugRegisters::from_config(&config));
    let manager = BreakpointManager::new(arch, space.clone(), &config);
    (space, manager)
}

fn raw(space: &AddressSpace, address: Word, len: usize) -> Vec<u8> {
    let mut bytes = vec![0; len];
    space.copy_from_user(address, &mut bytes).unwrap();
    bytes
}

#[test]
fn ninth_of_nine_breakpoints_is_patched() {
    let (space, manager) = manager(8, 4, false);

    for i in 0..9 {
        manager.install_breakpoint(TEXT + i * 0x10).unwrap();
    }

    for i in 0..8 {
        assert_eq!(manager.is_hardware(TEXT + i * 0x10), Some(true));
        assert_eq!(raw(&space, TEXT + i * 0x10, 1), vec![0x90]);
    }
    assert_eq!(manager.is_hardware(TEXT + 0x80), Some(false));
    assert_eq!(raw(&space, TEXT + 0x80, 1), vec![0xcc]);
    assert_eq!(manager.hardware_breakpoint_count(), 8);
}

#[test]
fn patched_byte_reads_as_original() {
    let (space, manager) = manager(0, 0, false);
    let address = TEXT + 0x42;

    manager.install_breakpoint(address).unwrap();
    assert_eq!(raw(&space, address, 1), vec![0xcc]);

    let mut byte = [0u8];
    assert_eq!(manager.read_memory(address, &mut byte), Ok(1));
    assert_eq!(byte, [0x90]);

    let mut span = [0u8; 16];
    assert_eq!(manager.read_memory(address - 8, &mut span), Ok(16));
    assert!(span.iter().all(|b| *b == 0x90));
}

#[test]
fn second_watchpoint_at_same_address_is_duplicate() {
    let (_space, manager) = manager(4, 4, true);

    manager.install_watchpoint(DATA, Trigger::Write, 4).unwrap();
    assert_eq!(
        manager.install_watchpoint(DATA, Trigger::Write, 4),
        Err(Error::DuplicateBreakpoint(DATA))
    );
    assert_eq!(manager.watchpoint_count(), 1);
    assert_eq!(manager.slots_in_use(), 1);
}

#[test]
fn write_over_patch_survives_uninstall() {
    let (space, manager) = manager(0, 0, false);
    let address = TEXT + 0x100;

    manager.install_breakpoint(address).unwrap();
    assert_eq!(manager.write_memory(address - 1, &[1, 2, 3]), Ok(3));

    assert_eq!(raw(&space, address - 1, 3), vec![1, 0xcc, 3]);
    let mut seen = [0u8; 3];
    manager.read_memory(address - 1, &mut seen).unwrap();
    assert_eq!(seen, [1, 2, 3]);

    manager.uninstall_breakpoint(address).unwrap();
    assert_eq!(raw(&space, address - 1, 3), vec![1, 2, 3]);
}

#[test]
fn reinstall_starts_from_current_bytes() {
    let (space, manager) = manager(0, 0, false);
    let address = TEXT + 0x200;

    manager.install_breakpoint(address).unwrap();
    manager.write_memory(address, &[0x55]).unwrap();
    manager.uninstall_breakpoint(address).unwrap();
    assert_eq!(raw(&space, address, 1), vec![0x55]);

    space.load(address, &[0x66]).unwrap();
    manager.install_breakpoint(address).unwrap();
    let mut byte = [0u8];
    manager.read_memory(address, &mut byte).unwrap();
    assert_eq!(byte, [0x66]);

    manager.uninstall_breakpoint(address).unwrap();
    assert_eq!(raw(&space, address, 1), vec![0x66]);
    assert_eq!(manager.uninstall_breakpoint(address), Err(Error::NoBreakpoint(address)));
}

#[test]
fn promotion_clears_patch_at_resume_address() {
    let (space, manager) = manager(2, 2, true);

    for i in 0..3 {
        manager.install_breakpoint(TEXT + i).unwrap();
    }
    assert_eq!(manager.is_hardware(TEXT + 2), Some(false));

    manager.prepare_to_continue(TEXT + 2);
    assert_eq!(manager.is_hardware(TEXT + 2), Some(true));
    assert_eq!(raw(&space, TEXT + 2, 1), vec![0x90]);
    // resuming skips the hardware check, and no patch is left to hit
    assert_eq!(manager.fetch_trap(TEXT + 2, true), None);
    assert!(manager.fetch_trap(TEXT + 2, false).is_some());

    assert_eq!(manager.hardware_breakpoint_count(), 2);
    assert_eq!(manager.breakpoint_count(), 3);
}

#[test]
fn concurrent_churn_never_overcommits_slots() {
    let (space, manager) = manager(4, 4, true);
    let manager = Arc::new(manager);
    let capacity = manager.slot_capacity();

    let workers: Vec<_> = (0..4)
        .map(|w| {
            let manager = manager.clone();
            thread::spawn(move || {
                for round in 0..50 {
                    let address = TEXT + (w * 0x400 + (round % 10) * 8) as Word;
                    manager.install_breakpoint(address).ok();
                    if round % 3 == 0 {
                        manager.prepare_to_continue(address);
                    }
                    assert!(manager.hardware_breakpoint_count() <= capacity);
                    assert!(manager.slots_in_use() <= capacity);
                    if round % 2 == 1 {
                        manager.uninstall_breakpoint(address).ok();
                    }
                }
            })
        })
        .collect();

    for worker in workers {
        worker.join().unwrap();
    }

    manager.remove_all_breakpoints();
    assert_eq!(manager.breakpoint_count(), 0);
    assert_eq!(manager.slots_in_use(), 0);
    assert!(raw(&space, TEXT, 0x4000).iter().all(|b| *b == 0x90));
}

#[test]
fn read_only_text_keeps_its_protection() {
    let (space, manager) = manager(0, 0, false);
    manager.install_breakpoint(TEXT + 8).unwrap();
    manager.uninstall_breakpoint(TEXT + 8).unwrap();

    let area = space.area_for(TEXT).unwrap();
    assert_eq!(area.protection, Protection::Read | Protection::Execute);
    assert_eq!(space.copy_to_user(TEXT, &[0]), Err(Error::BadAddress(TEXT)));
}
