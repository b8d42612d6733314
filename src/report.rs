use std::collections::BTreeMap;

use serde::ser::SerializeMap;
use serde::{Serialize, Serializer};

use crate::backend::backend::{ExceptionRecord, Retirement};
use crate::backend::execution_unit::Fault;
use crate::cpu::{PerfCounters, CPU};
use crate::instructions::instructions::{register_name, CodeAddress, RegisterType, WordType};

#[derive(Serialize, Debug, Clone)]
pub(crate) struct ROBEntrySnapshot {
    pub(crate) tag: u16,
    pub(crate) seq: u64,
    pub(crate) pc: CodeAddress,
    pub(crate) instr: String,
    pub(crate) state: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub(crate) result: Option<WordType>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub(crate) fault: Option<Fault>,
}

/// The state of the pipeline at the end of a cycle.
#[derive(Serialize, Debug, Clone)]
pub(crate) struct CycleSnapshot {
    pub(crate) cycle: u64,
    // the next pc the frontend fetches from
    pub(crate) fetch_pc: CodeAddress,
    // the pcs waiting in the instruction queue
    pub(crate) instr_queue: Vec<CodeAddress>,
    pub(crate) rob: Vec<ROBEntrySnapshot>,
    pub(crate) rs_busy: u16,
    pub(crate) units_busy: u16,
    pub(crate) lsq: u16,
    pub(crate) retired: u64,
}

/// The final architectural state and statistics of a run.
#[derive(Serialize, Debug)]
pub(crate) struct Report {
    #[serde(serialize_with = "serialize_registers")]
    pub(crate) registers: Vec<WordType>,
    pub(crate) memory: BTreeMap<WordType, WordType>,
    pub(crate) cycles: u64,
    pub(crate) retired: u64,
    pub(crate) mispredictions: u64,
    pub(crate) exception: Option<ExceptionRecord>,
    pub(crate) counters: PerfCounters,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub(crate) retirements: Option<Vec<Retirement>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub(crate) cycle_log: Option<Vec<CycleSnapshot>>,
}

fn serialize_registers<S: Serializer>(registers: &[WordType], serializer: S) -> Result<S::Ok, S::Error> {
    let mut map = serializer.serialize_map(Some(registers.len()))?;
    for (reg, value) in registers.iter().enumerate() {
        map.serialize_entry(&register_name(reg as RegisterType), value)?;
    }
    map.end()
}

impl Report {
    pub(crate) fn new(cpu: &CPU, with_retirements: bool) -> Report {
        let perf_counters = &cpu.perf_counters;
        Report {
            registers: cpu.arch_reg_file.values(),
            memory: cpu.memory_subsystem.memory.clone(),
            cycles: perf_counters.cycle_cnt,
            retired: perf_counters.retired_cnt,
            mispredictions: perf_counters.branch_misprediction_cnt,
            exception: cpu.exception(),
            counters: perf_counters.clone(),
            retirements: if with_retirements { Some(cpu.retirements().to_vec()) } else { None },
            cycle_log: cpu.cycle_log.clone(),
        }
    }

    pub(crate) fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(self)
    }
}
