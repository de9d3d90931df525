use crate::arch::Word;

pub type SlotIndex = usize;

/// What a hardware slot is currently realizing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Owner {
    Breakpoint(Word),
    Watchpoint(Word),
}

/// Descriptor of one architecture debug register slot.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct Breakpoint {
    owner: Option<Owner>,
}

impl Breakpoint {
    pub fn used(&self) -> bool {
        self.owner.is_some()
    }

    pub fn owner(&self) -> Option<Owner> {
        self.owner
    }
}

/// Fixed pool of slot descriptors, allocated once for the lifetime of a
/// breakpoint manager.
#[derive(Debug, Clone)]
pub struct Pool {
    slots: Vec<Breakpoint>,
}

impl Pool {
    pub fn new(slots: usize) -> Self {
        Self {
            slots: vec![Breakpoint::default(); slots],
        }
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    pub fn unused(&self) -> Option<SlotIndex> {
        self.slots.iter().position(|slot| !slot.used())
    }

    pub fn in_use(&self) -> usize {
        self.slots.iter().filter(|slot| slot.used()).count()
    }

    pub fn acquire(&mut self, index: SlotIndex, owner: Owner) {
        let slot = &mut self.slots[index];
        debug_assert!(!slot.used(), "slot {} already owned", index);
        slot.owner = Some(owner);
    }

    pub fn release(&mut self, index: SlotIndex) {
        if let Some(slot) = self.slots.get_mut(index) {
            slot.owner = None;
        }
    }
}
