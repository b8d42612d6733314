use LSQEntryState::{ALLOCATED, IDLE, RESOLVED};

use crate::instructions::instructions::WordType;

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub(crate) enum LSQEntryState {
    // not used.
    IDLE,
    // allocated at dispatch; the address is not known yet
    ALLOCATED,
    // the address (and for a store the value) is known
    RESOLVED,
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub(crate) enum AccessKind {
    Load,
    Store,
}

pub(crate) struct LSQEntry {
    pub(crate) state: LSQEntryState,
    pub(crate) kind: AccessKind,
    pub(crate) seq: u64,
    pub(crate) rob_slot_index: u16,
    pub(crate) addr: WordType,
    pub(crate) value: WordType,
}

impl LSQEntry {
    fn reset(&mut self) {
        self.state = IDLE;
        self.kind = AccessKind::Load;
        self.seq = 0;
        self.rob_slot_index = 0;
        self.addr = 0;
        self.value = 0;
    }
}

/// The outcome of checking a load against the older stores in the queue.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub(crate) enum LoadCheck {
    // an older store has an unresolved address
    Blocked,
    // the youngest older store to the same address
    Forward(WordType),
    // no older store aliases; read committed memory
    Memory,
}

/// The load/store queue. Memory accesses are allocated in program order at
/// dispatch and released in program order at retirement, so the queue is a
/// ring buffer where the head is the oldest access.
pub(crate) struct LSQ {
    head: u64,
    tail: u64,
    entries: Vec<LSQEntry>,
    capacity: u16,
}

impl LSQ {
    pub(crate) fn new(capacity: u16) -> LSQ {
        let mut entries = Vec::with_capacity(capacity as usize);
        for _ in 0..capacity {
            entries.push(LSQEntry {
                state: IDLE,
                kind: AccessKind::Load,
                seq: 0,
                rob_slot_index: 0,
                addr: 0,
                value: 0,
            })
        }

        LSQ {
            capacity,
            head: 0,
            tail: 0,
            entries,
        }
    }

    fn to_index(&self, pos: u64) -> u16 {
        (pos % self.capacity as u64) as u16
    }

    pub(crate) fn size(&self) -> u16 {
        (self.tail - self.head) as u16
    }

    pub(crate) fn capacity(&self) -> u16 {
        self.capacity
    }

    pub(crate) fn has_space(&self) -> bool {
        self.size() < self.capacity
    }

    pub(crate) fn allocate(&mut self, kind: AccessKind, seq: u64, rob_slot_index: u16) -> u16 {
        assert!(self.has_space(), "LSQ: can't allocate because there is no space");

        let index = self.to_index(self.tail);
        let entry = &mut self.entries[index as usize];
        entry.state = ALLOCATED;
        entry.kind = kind;
        entry.seq = seq;
        entry.rob_slot_index = rob_slot_index;
        self.tail += 1;
        index
    }

    pub(crate) fn resolve_store(&mut self, index: u16, addr: WordType, value: WordType) {
        let entry = &mut self.entries[index as usize];
        debug_assert!(entry.kind == AccessKind::Store);
        debug_assert!(entry.state == ALLOCATED);

        entry.addr = addr;
        entry.value = value;
        entry.state = RESOLVED;
    }

    pub(crate) fn resolve_load(&mut self, index: u16, addr: WordType) {
        let entry = &mut self.entries[index as usize];
        debug_assert!(entry.kind == AccessKind::Load);

        entry.addr = addr;
        entry.state = RESOLVED;
    }

    /// Checks a load with sequence number `seq` to `addr` against every older
    /// store, youngest first.
    pub(crate) fn check_load(&self, seq: u64, addr: WordType) -> LoadCheck {
        for pos in (self.head..self.tail).rev() {
            let entry = &self.entries[self.to_index(pos) as usize];
            if entry.seq >= seq || entry.kind != AccessKind::Store {
                continue;
            }

            if entry.state != RESOLVED {
                return LoadCheck::Blocked;
            }

            if entry.addr == addr {
                return LoadCheck::Forward(entry.value);
            }
        }

        LoadCheck::Memory
    }

    pub(crate) fn get(&self, index: u16) -> &LSQEntry {
        &self.entries[index as usize]
    }

    pub(crate) fn head(&self) -> Option<&LSQEntry> {
        if self.head == self.tail {
            return None;
        }
        Some(&self.entries[self.to_index(self.head) as usize])
    }

    /// Releases the oldest entry; returns the kind, address and value it held.
    pub(crate) fn retire_head(&mut self) -> Option<(AccessKind, WordType, WordType)> {
        if self.head == self.tail {
            return None;
        }

        let index = self.to_index(self.head);
        let entry = &mut self.entries[index as usize];
        let released = (entry.kind, entry.addr, entry.value);
        entry.reset();
        self.head += 1;
        Some(released)
    }

    // Drops every access younger than `seq`; returns the number of dropped entries.
    pub(crate) fn squash_after(&mut self, seq: u64) -> u16 {
        let mut squashed = 0;
        while self.tail > self.head {
            let index = self.to_index(self.tail - 1);
            let entry = &mut self.entries[index as usize];
            if entry.seq <= seq {
                break;
            }
            entry.reset();
            self.tail -= 1;
            squashed += 1;
        }
        squashed
    }

    pub(crate) fn flush(&mut self) {
        for entry in self.entries.iter_mut() {
            entry.reset();
        }
        self.head = self.tail;
    }
}
