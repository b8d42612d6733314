use std::rc::Rc;

use crate::backend::execution_unit::Fault;
use crate::instructions::instructions::{CodeAddress, Instr, WordType};

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub(crate) enum ROBSlotState {
    UNUSED,
    // renamed and waiting in a reservation station
    DISPATCHED,
    // occupying a functional unit
    ISSUED,
    // the result has been broadcast on the CDB
    EXECUTED,
}

impl ROBSlotState {
    pub(crate) fn name(self) -> &'static str {
        match self {
            ROBSlotState::UNUSED => "unused",
            ROBSlotState::DISPATCHED => "dispatched",
            ROBSlotState::ISSUED => "issued",
            ROBSlotState::EXECUTED => "executed",
        }
    }
}

pub(crate) struct ROBSlot {
    pub(crate) instr: Option<Rc<Instr>>,
    pub(crate) state: ROBSlotState,
    pub(crate) seq: u64,
    pub(crate) result: Option<WordType>,
    pub(crate) fault: Option<Fault>,
    pub(crate) rs_index: Option<u16>,
    pub(crate) lsq_index: Option<u16>,
    pub(crate) branch_target_predicted: CodeAddress,
    pub(crate) branch_target_actual: Option<CodeAddress>,
}

impl ROBSlot {
    fn reset(&mut self) {
        self.instr = None;
        self.state = ROBSlotState::UNUSED;
        self.seq = 0;
        self.result = None;
        self.fault = None;
        self.rs_index = None;
        self.lsq_index = None;
        self.branch_target_predicted = 0;
        self.branch_target_actual = None;
    }

    // A conditional branch whose outcome is not known yet.
    pub(crate) fn is_unresolved_branch(&self) -> bool {
        match &self.instr {
            Some(instr) => instr.is_conditional_branch() && self.branch_target_actual.is_none(),
            None => false,
        }
    }
}

/// The reorder buffer. The index of a slot doubles as the tag of the
/// instruction that occupies it.
pub(crate) struct ROB {
    capacity: u16,
    // everything before this point is retired.
    head: u64,
    tail: u64,
    slots: Vec<ROBSlot>,
}

impl ROB {
    pub(crate) fn new(capacity: u16) -> Self {
        let mut slots = Vec::with_capacity(capacity as usize);
        for _ in 0..capacity {
            slots.push(ROBSlot {
                instr: None,
                state: ROBSlotState::UNUSED,
                seq: 0,
                result: None,
                fault: None,
                rs_index: None,
                lsq_index: None,
                branch_target_predicted: 0,
                branch_target_actual: None,
            });
        }

        Self {
            capacity,
            tail: 0,
            head: 0,
            slots,
        }
    }

    pub(crate) fn to_index(&self, pos: u64) -> u16 {
        (pos % self.capacity as u64) as u16
    }

    pub(crate) fn get(&self, slot_index: u16) -> &ROBSlot {
        &self.slots[slot_index as usize]
    }

    pub(crate) fn get_mut(&mut self, slot_index: u16) -> &mut ROBSlot {
        &mut self.slots[slot_index as usize]
    }

    pub(crate) fn allocate(&mut self) -> u16 {
        assert!(self.has_space(), "ROB: Can't allocate if no space.");

        let index = self.to_index(self.tail);
        self.tail += 1;
        index
    }

    pub(crate) fn head_index(&self) -> Option<u16> {
        if self.tail == self.head {
            return None;
        }
        Some(self.to_index(self.head))
    }

    pub(crate) fn head_has_executed(&self) -> bool {
        match self.head_index() {
            Some(index) => self.slots[index as usize].state == ROBSlotState::EXECUTED,
            None => false,
        }
    }

    pub(crate) fn retire_head(&mut self) {
        assert!(self.head_has_executed(), "ROB: can't retire because the head hasn't executed");

        let index = self.to_index(self.head);
        self.slots[index as usize].reset();
        self.head += 1;
    }

    /// Releases every slot holding an instruction younger than `seq`, youngest
    /// first. Returns the indices of the released slots.
    pub(crate) fn squash_after(&mut self, seq: u64) -> Vec<u16> {
        let mut squashed = Vec::new();
        while self.tail > self.head {
            let index = self.to_index(self.tail - 1);
            let slot = &mut self.slots[index as usize];
            if slot.seq <= seq {
                break;
            }
            slot.reset();
            self.tail -= 1;
            squashed.push(index);
        }
        squashed
    }

    pub(crate) fn flush(&mut self) -> u16 {
        let flushed = self.size();
        for slot in self.slots.iter_mut() {
            slot.reset();
        }
        self.head = self.tail;
        flushed
    }

    // The indices of the occupied slots from oldest to youngest.
    pub(crate) fn in_order(&self) -> impl Iterator<Item = u16> + '_ {
        (self.head..self.tail).map(move |pos| self.to_index(pos))
    }

    pub(crate) fn size(&self) -> u16 {
        (self.tail - self.head) as u16
    }

    pub(crate) fn capacity(&self) -> u16 {
        self.capacity
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.tail == self.head
    }

    pub(crate) fn has_space(&self) -> bool {
        self.capacity > self.size()
    }
}
