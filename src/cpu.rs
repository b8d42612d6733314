use std::collections::BTreeMap;
use std::fs::File;
use std::rc::Rc;

use log::{debug, info};
use serde::{Deserialize, Serialize};

use crate::backend::backend::{Backend, CycleContext, ExceptionRecord, Retirement};
use crate::error::{LoadError, SimError};
use crate::frontend::branch_predictor::BranchPrediction;
use crate::frontend::frontend::{Frontend, FrontendControl};
use crate::instructions::instructions::{InstrQueue, Program, RegisterType, UnitClass, WordType, ARCH_REG_CNT};
use crate::memory_subsystem::memory_subsystem::MemorySubsystem;
use crate::report::CycleSnapshot;

#[derive(Clone, Default, Debug, Serialize)]
pub(crate) struct PerfCounters {
    #[serde(rename = "fetched")]
    pub fetch_cnt: u64,
    #[serde(rename = "dispatched")]
    pub dispatch_cnt: u64,
    #[serde(rename = "issued")]
    pub issue_cnt: u64,
    #[serde(rename = "executed")]
    pub execute_cnt: u64,
    #[serde(rename = "broadcast")]
    pub broadcast_cnt: u64,
    #[serde(rename = "retired")]
    pub retired_cnt: u64,
    #[serde(rename = "branches")]
    pub branch_cnt: u64,
    #[serde(rename = "mispredictions")]
    pub branch_misprediction_cnt: u64,
    #[serde(rename = "squashed")]
    pub squashed_cnt: u64,
    #[serde(rename = "pipeline_flushes")]
    pub pipeline_flushes: u64,
    #[serde(rename = "loads_forwarded")]
    pub loads_forwarded_cnt: u64,
    #[serde(rename = "load_stalls")]
    pub load_stall_cnt: u64,
    #[serde(rename = "cycles")]
    pub cycle_cnt: u64,
}

impl PerfCounters {
    pub fn new() -> Self {
        Self::default()
    }
}

// Which pipeline stages emit debug logging.
#[derive(Clone, Default, Deserialize, Debug)]
#[serde(default, deny_unknown_fields)]
pub(crate) struct Trace {
    pub fetch: bool,
    pub dispatch: bool,
    pub issue: bool,
    pub execute: bool,
    pub broadcast: bool,
    pub retire: bool,
    pub flush: bool,
    pub cycle: bool,
}

#[derive(Clone, Copy, Deserialize, Debug, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub(crate) struct UnitConfig {
    // the number of units of the class
    pub(crate) count: u8,
    // the number of cycles a unit is occupied by a single instruction
    pub(crate) latency: u32,
}

impl UnitConfig {
    pub(crate) fn default_for(class: UnitClass) -> UnitConfig {
        match class {
            UnitClass::Alu => UnitConfig { count: 2, latency: 1 },
            UnitClass::Mul => UnitConfig { count: 1, latency: 3 },
            UnitClass::Mem => UnitConfig { count: 1, latency: 2 },
            UnitClass::Branch => UnitConfig { count: 1, latency: 1 },
        }
    }
}

#[derive(Clone, Deserialize, Debug)]
#[serde(default, deny_unknown_fields)]
pub(crate) struct CPUConfig {
    // the number of instructions the frontend can fetch per clock cycle.
    #[serde(rename = "fetch_width")]
    pub(crate) frontend_n_wide: u8,
    // the size of the instruction queue between frontend and backend
    #[serde(rename = "instr_queue_size")]
    pub(crate) instr_queue_capacity: u16,
    // the number of instructions that can be renamed into the ROB/RS every clock cycle.
    #[serde(rename = "dispatch_width")]
    pub(crate) dispatch_n_wide: u8,
    // the number of instructions that can be sent to execution units every clock cycle.
    #[serde(rename = "issue_width")]
    pub(crate) issue_n_wide: u8,
    // the number of instructions that can retire per clock cycle
    #[serde(rename = "retire_width")]
    pub(crate) retire_n_wide: u8,
    // the number of results broadcast on the CDB per clock cycle; one per unit class if absent
    #[serde(rename = "cdb_width")]
    pub(crate) cdb_n_wide: Option<u8>,
    // the capacity of the reorder buffer
    #[serde(rename = "rob_size")]
    pub(crate) rob_capacity: u16,
    // the number of reservation stations
    #[serde(rename = "rs_size")]
    pub(crate) rs_count: u16,
    // the capacity of the load/store queue
    #[serde(rename = "lsq_size")]
    pub(crate) lsq_capacity: u16,
    // the execution units per class; classes that are absent get their default
    pub(crate) units: BTreeMap<UnitClass, UnitConfig>,
    pub(crate) branch_prediction: BranchPrediction,
    // the number of unresolved conditional branches that can be in flight
    pub(crate) max_outstanding_branches: u16,
    // the simulation fails when the program didn't complete within this many cycles
    pub(crate) max_cycles: u64,
    // if processing of a single instruction should be traced (logged)
    pub(crate) trace: Trace,
}

impl Default for CPUConfig {
    fn default() -> Self {
        CPUConfig {
            frontend_n_wide: 4,
            instr_queue_capacity: 8,
            dispatch_n_wide: 4,
            issue_n_wide: 4,
            retire_n_wide: 4,
            cdb_n_wide: None,
            rob_capacity: 32,
            rs_count: 16,
            lsq_capacity: 16,
            units: BTreeMap::new(),
            branch_prediction: BranchPrediction::NotTaken,
            max_outstanding_branches: 1,
            max_cycles: 1_000_000,
            trace: Trace::default(),
        }
    }
}

impl CPUConfig {
    pub(crate) fn unit_config(&self, class: UnitClass) -> UnitConfig {
        self.units.get(&class).copied().unwrap_or_else(|| UnitConfig::default_for(class))
    }

    pub(crate) fn cdb_width(&self) -> u8 {
        self.cdb_n_wide.unwrap_or(UnitClass::ALL.len() as u8)
    }

    /// Returns a message for every setting the core can't run with.
    pub(crate) fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();

        let sizes = [
            ("fetch_width", self.frontend_n_wide as u64),
            ("instr_queue_size", self.instr_queue_capacity as u64),
            ("dispatch_width", self.dispatch_n_wide as u64),
            ("issue_width", self.issue_n_wide as u64),
            ("retire_width", self.retire_n_wide as u64),
            ("cdb_width", self.cdb_width() as u64),
            ("rob_size", self.rob_capacity as u64),
            ("rs_size", self.rs_count as u64),
            ("lsq_size", self.lsq_capacity as u64),
            ("max_outstanding_branches", self.max_outstanding_branches as u64),
            ("max_cycles", self.max_cycles),
        ];
        for (name, value) in sizes {
            if value == 0 {
                errors.push(format!("config: {} must be larger than 0", name));
            }
        }

        for (class, unit_config) in &self.units {
            if unit_config.latency == 0 {
                errors.push(format!("config: latency of the {} units must be larger than 0", class));
            }
        }

        errors
    }
}

pub(crate) fn load_cpu_config(file_path: &str) -> Result<CPUConfig, LoadError> {
    let file = File::open(file_path).map_err(|source| LoadError::IOError { path: file_path.to_string(), source })?;
    let config = serde_yaml::from_reader(file).map_err(|err| LoadError::ParseError(format!("{}: {}", file_path, err)))?;
    Ok(config)
}

pub(crate) struct CPU {
    backend: Backend,
    frontend: Frontend,
    instr_queue: InstrQueue,
    pub(crate) memory_subsystem: MemorySubsystem,
    pub(crate) arch_reg_file: ArgRegFile,
    trace: Trace,
    max_cycles: u64,
    pub(crate) perf_counters: PerfCounters,
    // the per cycle snapshots; only recorded when enabled
    pub(crate) cycle_log: Option<Vec<CycleSnapshot>>,
}

impl CPU {
    pub(crate) fn new(cpu_config: &CPUConfig) -> CPU {
        CPU {
            backend: Backend::new(cpu_config),
            frontend: Frontend::new(cpu_config),
            instr_queue: InstrQueue::new(cpu_config.instr_queue_capacity),
            memory_subsystem: MemorySubsystem::new(cpu_config),
            arch_reg_file: ArgRegFile::new(ARCH_REG_CNT),
            trace: cpu_config.trace.clone(),
            max_cycles: cpu_config.max_cycles,
            perf_counters: PerfCounters::new(),
            cycle_log: None,
        }
    }

    pub(crate) fn record_cycles(&mut self) {
        self.cycle_log = Some(Vec::new());
    }

    pub(crate) fn run(&mut self, program: &Rc<Program>) -> Result<(), SimError> {
        for (arch_reg, value) in &program.registers {
            self.arch_reg_file.set_value(*arch_reg, *value);
        }
        self.memory_subsystem.init(program);
        self.frontend.init(program);
        self.backend.init(&self.arch_reg_file);

        while !self.is_done() {
            if self.perf_counters.cycle_cnt >= self.max_cycles {
                return Err(SimError::CycleLimit(self.max_cycles));
            }
            self.do_cycle()?;
        }

        info!("Program complete: {} instructions retired in {} cycles",
              self.perf_counters.retired_cnt,
              self.perf_counters.cycle_cnt);
        Ok(())
    }

    pub(crate) fn is_done(&self) -> bool {
        self.frontend.is_done() && self.instr_queue.is_empty() && self.backend.is_empty()
    }

    pub(crate) fn do_cycle(&mut self) -> Result<(), SimError> {
        self.perf_counters.cycle_cnt += 1;
        let cycle = self.perf_counters.cycle_cnt;

        let mut ctx = CycleContext {
            cycle,
            instr_queue: &mut self.instr_queue,
            memory_subsystem: &mut self.memory_subsystem,
            arch_reg_file: &mut self.arch_reg_file,
            perf_counters: &mut self.perf_counters,
        };

        match self.backend.do_cycle(&mut ctx)? {
            FrontendControl::Continue => self.frontend.do_cycle(&mut self.instr_queue, &mut self.perf_counters),
            // no fetch in the cycle the frontend is re-steered
            FrontendControl::Redirect(target) => self.frontend.redirect(target),
            FrontendControl::Halt => self.frontend.halt(),
        }

        self.backend
            .check_invariants(&self.memory_subsystem)
            .map_err(|msg| SimError::Invariant { cycle, msg })?;

        if self.trace.cycle {
            let perf_counters = &self.perf_counters;
            debug!("[Cycles:{}][Fetched={}][Dispatched={}][Issued={}][Executed={}][Retired={}][IPC={:.2}]",
                   perf_counters.cycle_cnt,
                   perf_counters.fetch_cnt,
                   perf_counters.dispatch_cnt,
                   perf_counters.issue_cnt,
                   perf_counters.execute_cnt,
                   perf_counters.retired_cnt,
                   perf_counters.retired_cnt as f32 / perf_counters.cycle_cnt as f32
            );
        }

        if self.cycle_log.is_some() {
            let snapshot = self.snapshot(cycle);
            if let Some(cycle_log) = self.cycle_log.as_mut() {
                cycle_log.push(snapshot);
            }
        }

        Ok(())
    }

    fn snapshot(&self, cycle: u64) -> CycleSnapshot {
        CycleSnapshot {
            cycle,
            fetch_pc: self.frontend.pc,
            instr_queue: self.instr_queue.iter().map(|slot| slot.instr.pc).collect(),
            rob: self.backend.rob_snapshot(),
            rs_busy: self.backend.rs_busy_cnt(),
            units_busy: self.backend.eu_executing_cnt(),
            lsq: self.memory_subsystem.lsq.size(),
            retired: self.perf_counters.retired_cnt,
        }
    }

    pub(crate) fn exception(&self) -> Option<ExceptionRecord> {
        self.backend.exception
    }

    pub(crate) fn retirements(&self) -> &[Retirement] {
        &self.backend.retirements
    }
}

struct ArgRegEntry {
    pub(crate) value: WordType,
}

pub struct ArgRegFile {
    entries: Vec<ArgRegEntry>,
}

impl ArgRegFile {
    pub(crate) fn new(reg_count: u16) -> ArgRegFile {
        let mut array = Vec::with_capacity(reg_count as usize);
        for _ in 0..reg_count {
            array.push(ArgRegEntry { value: 0 });
        }

        ArgRegFile { entries: array }
    }

    pub fn get_value(&self, reg: RegisterType) -> WordType {
        self.entries[reg as usize].value
    }

    pub fn set_value(&mut self, reg: RegisterType, value: WordType) {
        self.entries[reg as usize].value = value;
    }

    pub fn values(&self) -> Vec<WordType> {
        self.entries.iter().map(|entry| entry.value).collect()
    }
}
