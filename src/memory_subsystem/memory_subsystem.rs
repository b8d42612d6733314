use std::collections::BTreeMap;

use crate::cpu::CPUConfig;
use crate::instructions::instructions::{Program, WordType};
use crate::memory_subsystem::load_store_queue::LSQ;

/// Word addressed memory; addresses that were never written read as 0.
pub(crate) struct MemorySubsystem {
    pub(crate) memory: BTreeMap<WordType, WordType>,
    pub(crate) lsq: LSQ,
}

impl MemorySubsystem {
    pub fn new(cpu_config: &CPUConfig) -> MemorySubsystem {
        MemorySubsystem {
            memory: BTreeMap::new(),
            lsq: LSQ::new(cpu_config.lsq_capacity),
        }
    }

    pub(crate) fn init(&mut self, program: &Program) {
        self.memory = program.data_items.clone();
        self.lsq.flush();
    }

    pub(crate) fn load(&self, addr: WordType) -> WordType {
        self.memory.get(&addr).copied().unwrap_or(0)
    }

    pub(crate) fn store(&mut self, addr: WordType, value: WordType) {
        self.memory.insert(addr, value);
    }
}
