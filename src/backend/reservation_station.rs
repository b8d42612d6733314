use std::fmt;
use std::fmt::Display;

use crate::instructions::instructions::{mnemonic, Opcode, WordType, MAX_SOURCE_COUNT};

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub(crate) enum RSState {
    IDLE,
    BUSY,
}

/// A renamed source operand.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub(crate) enum RSOperand {
    Value(WordType),
    // waiting for the broadcast of the instruction in this ROB slot
    Waiting(u16),
    Unused,
}

// A single reservation station
pub(crate) struct RS {
    pub(crate) rob_slot_index: Option<u16>,
    pub(crate) seq: u64,
    pub(crate) opcode: Opcode,
    pub(crate) state: RSState,
    pub(crate) source_cnt: u8,
    pub(crate) source: [RSOperand; MAX_SOURCE_COUNT as usize],
    pub(crate) source_ready_cnt: u8,
}

impl RS {
    fn new() -> Self {
        Self {
            opcode: Opcode::NOP,
            state: RSState::IDLE,
            seq: 0,
            source_cnt: 0,
            source: [RSOperand::Unused, RSOperand::Unused],
            source_ready_cnt: 0,
            rob_slot_index: None,
        }
    }

    fn reset(&mut self) {
        self.rob_slot_index = None;
        self.state = RSState::IDLE;
        self.seq = 0;
        self.opcode = Opcode::NOP;
        self.source = [RSOperand::Unused, RSOperand::Unused];
        self.source_ready_cnt = 0;
        self.source_cnt = 0;
    }

    pub(crate) fn is_ready(&self) -> bool {
        self.state == RSState::BUSY && self.source_ready_cnt == self.source_cnt
    }

    /// The resolved source values; only meaningful once the RS is ready.
    pub(crate) fn operand_values(&self) -> Vec<WordType> {
        self.source[..self.source_cnt as usize]
            .iter()
            .map(|source| match source {
                RSOperand::Value(value) => *value,
                _ => 0,
            })
            .collect()
    }
}

impl Display for RS {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "RS ")?;
        write!(f, "{}", mnemonic(self.opcode))?;

        for k in 0..self.source_cnt {
            write!(f, " {:?}", self.source[k as usize])?;
        }

        Ok(())
    }
}

pub(crate) struct RSTable {
    free_stack: Vec<u16>,
    pub(crate) capacity: u16,
    array: Vec<RS>,
}

impl RSTable {
    pub(crate) fn new(capacity: u16) -> Self {
        let mut free_stack = Vec::with_capacity(capacity as usize);
        let mut array = Vec::with_capacity(capacity as usize);
        for _ in 0..capacity {
            array.push(RS::new());
        }
        // lowest index is handed out first
        for i in (0..capacity).rev() {
            free_stack.push(i);
        }

        RSTable {
            capacity,
            array,
            free_stack,
        }
    }

    pub(crate) fn get(&self, rs_index: u16) -> &RS {
        &self.array[rs_index as usize]
    }

    pub(crate) fn get_mut(&mut self, rs_index: u16) -> &mut RS {
        &mut self.array[rs_index as usize]
    }

    pub(crate) fn has_free(&self) -> bool {
        !self.free_stack.is_empty()
    }

    pub(crate) fn busy_cnt(&self) -> u16 {
        self.capacity - self.free_stack.len() as u16
    }

    pub(crate) fn allocate(&mut self) -> u16 {
        if let Some(last_element) = self.free_stack.pop() {
            let rs = &mut self.array[last_element as usize];
            debug_assert!(rs.state == RSState::IDLE);
            rs.state = RSState::BUSY;
            last_element
        } else {
            panic!("No free RS")
        }
    }

    pub(crate) fn deallocate(&mut self, rs_index: u16) {
        let rs = &mut self.array[rs_index as usize];
        debug_assert!(rs.state == RSState::BUSY);
        debug_assert!(!self.free_stack.contains(&rs_index));

        rs.reset();
        self.free_stack.push(rs_index);
    }

    /// The busy stations with all sources resolved, oldest first.
    pub(crate) fn ready_by_age(&self) -> Vec<u16> {
        let mut ready: Vec<u16> = (0..self.capacity)
            .filter(|rs_index| self.array[*rs_index as usize].is_ready())
            .collect();
        ready.sort_by_key(|rs_index| self.array[*rs_index as usize].seq);
        ready
    }

    // Replaces every source waiting on `tag` by `value`.
    pub(crate) fn wake(&mut self, tag: u16, value: WordType) -> u16 {
        let mut woken = 0;
        for rs in self.array.iter_mut() {
            if rs.state == RSState::IDLE {
                continue;
            }

            for source_index in 0..rs.source_cnt as usize {
                if rs.source[source_index] == RSOperand::Waiting(tag) {
                    rs.source[source_index] = RSOperand::Value(value);
                    rs.source_ready_cnt += 1;
                    woken += 1;
                }
            }
        }
        woken
    }

    pub(crate) fn squash_after(&mut self, seq: u64) {
        for rs_index in 0..self.capacity {
            let rs = &self.array[rs_index as usize];
            if rs.state == RSState::BUSY && rs.seq > seq {
                self.deallocate(rs_index);
            }
        }
    }

    pub(crate) fn flush(&mut self) {
        for rs_index in 0..self.capacity {
            if self.array[rs_index as usize].state == RSState::BUSY {
                self.deallocate(rs_index);
            }
        }
    }
}
