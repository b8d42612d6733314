use std::rc::Rc;

use log::debug;
use serde::Serialize;

use crate::backend::execution_unit::{compute, Completion, EUTable, Fault, Outcome};
use crate::backend::register_alias_table::{RATEntry, RAT};
use crate::backend::reorder_buffer::{ROBSlotState, ROB};
use crate::backend::reservation_station::{RSOperand, RSTable};
use crate::cpu::{ArgRegFile, CPUConfig, PerfCounters, Trace};
use crate::error::SimError;
use crate::frontend::frontend::FrontendControl;
use crate::instructions::instructions::{CodeAddress, InstrQueue, Operand, ARCH_REG_CNT, MAX_SOURCE_COUNT};
use crate::memory_subsystem::load_store_queue::{AccessKind, LoadCheck};
use crate::memory_subsystem::memory_subsystem::MemorySubsystem;
use crate::report::ROBEntrySnapshot;

#[derive(Clone, Copy, PartialEq, Eq, Debug, Serialize)]
pub(crate) struct ExceptionRecord {
    pub(crate) pc: CodeAddress,
    pub(crate) seq: u64,
    pub(crate) cause: Fault,
}

#[derive(Clone, Copy, PartialEq, Eq, Debug, Serialize)]
pub(crate) struct Retirement {
    pub(crate) seq: u64,
    pub(crate) pc: CodeAddress,
    pub(crate) cycle: u64,
}

/// The parts of the CPU state the backend works on during a single cycle.
pub(crate) struct CycleContext<'a> {
    pub(crate) cycle: u64,
    pub(crate) instr_queue: &'a mut InstrQueue,
    pub(crate) memory_subsystem: &'a mut MemorySubsystem,
    pub(crate) arch_reg_file: &'a mut ArgRegFile,
    pub(crate) perf_counters: &'a mut PerfCounters,
}

pub(crate) struct Backend {
    rs_table: RSTable,
    rat: RAT,
    rob: ROB,
    eu_table: EUTable,
    trace: Trace,
    retire_n_wide: u8,
    dispatch_n_wide: u8,
    issue_n_wide: u8,
    cdb_n_wide: u8,
    max_outstanding_branches: u16,
    // results that finished executing but haven't been broadcast yet.
    cdb_broadcast_buffer: Vec<Completion>,
    // the sequence number handed to the next dispatched instruction.
    next_seq: u64,
    // the sequence number the next retiring instruction must have.
    seq_retired: u64,
    unresolved_branch_cnt: u16,
    pub(crate) exception: Option<ExceptionRecord>,
    pub(crate) retirements: Vec<Retirement>,
}

impl Backend {
    pub(crate) fn new(cpu_config: &CPUConfig) -> Backend {
        Backend {
            trace: cpu_config.trace.clone(),
            rs_table: RSTable::new(cpu_config.rs_count),
            rat: RAT::new(ARCH_REG_CNT),
            rob: ROB::new(cpu_config.rob_capacity),
            eu_table: EUTable::new(cpu_config),
            retire_n_wide: cpu_config.retire_n_wide,
            dispatch_n_wide: cpu_config.dispatch_n_wide,
            issue_n_wide: cpu_config.issue_n_wide,
            cdb_n_wide: cpu_config.cdb_width(),
            max_outstanding_branches: cpu_config.max_outstanding_branches,
            cdb_broadcast_buffer: Vec::new(),
            next_seq: 0,
            seq_retired: 0,
            unresolved_branch_cnt: 0,
            exception: None,
            retirements: Vec::new(),
        }
    }

    pub(crate) fn init(&mut self, arch_reg_file: &ArgRegFile) {
        self.rat.reset(arch_reg_file);
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.rob.is_empty()
    }

    /// Runs the stages youngest to oldest, so every stage only sees what the
    /// stages downstream of it committed in an earlier cycle.
    pub(crate) fn do_cycle(&mut self, ctx: &mut CycleContext) -> Result<FrontendControl, SimError> {
        if self.cycle_retire(ctx)? {
            return Ok(FrontendControl::Halt);
        }
        self.cycle_issue(ctx)?;
        self.cycle_execute(ctx);
        let control = self.cycle_broadcast(ctx)?;
        self.cycle_dispatch(ctx)?;
        Ok(control)
    }

    fn invariant(cycle: u64, msg: String) -> SimError {
        SimError::Invariant { cycle, msg }
    }

    // Retires completed instructions from the head of the ROB. Returns true
    // if a faulting instruction reached the head.
    fn cycle_retire(&mut self, ctx: &mut CycleContext) -> Result<bool, SimError> {
        for _ in 0..self.retire_n_wide {
            let rob_slot_index = match self.rob.head_index() {
                Some(index) => index,
                None => break,
            };

            let rob_slot = self.rob.get(rob_slot_index);
            if rob_slot.state != ROBSlotState::EXECUTED {
                break;
            }

            let seq = rob_slot.seq;
            let fault = rob_slot.fault;
            let result = rob_slot.result;
            let instr = match &rob_slot.instr {
                Some(instr) => Rc::clone(instr),
                None => return Err(Self::invariant(ctx.cycle, format!("retiring empty ROB slot {}", rob_slot_index))),
            };

            if seq != self.seq_retired {
                return Err(Self::invariant(ctx.cycle, format!("retiring seq {} while seq {} was expected", seq, self.seq_retired)));
            }

            if let Some(cause) = fault {
                self.raise_exception(ctx, ExceptionRecord { pc: instr.pc, seq, cause });
                return Ok(true);
            }

            if let Some(arch_reg) = instr.sink {
                let value = match result {
                    Some(value) => value,
                    None => return Err(Self::invariant(ctx.cycle, format!("retiring [{}] without a result", instr))),
                };

                ctx.arch_reg_file.set_value(arch_reg, value);

                // only when the RAT still points to this instruction, the
                // register reverts to its architectural value
                if self.rat.get(arch_reg) == RATEntry::Pending(rob_slot_index) {
                    self.rat.set_ready(arch_reg, value);
                }
            }

            if instr.is_mem_access() {
                let lsq = &mut ctx.memory_subsystem.lsq;
                if lsq.head().map(|entry| entry.seq) != Some(seq) {
                    return Err(Self::invariant(ctx.cycle, format!("LSQ head doesn't match retiring [{}]", instr)));
                }

                if let Some((AccessKind::Store, addr, value)) = lsq.retire_head() {
                    ctx.memory_subsystem.store(addr, value);
                }
            }

            if self.trace.retire {
                debug!("Retiring [{}] seq={}", instr, seq);
            }

            self.retirements.push(Retirement { seq, pc: instr.pc, cycle: ctx.cycle });
            self.rob.retire_head();
            self.seq_retired += 1;
            ctx.perf_counters.retired_cnt += 1;
        }

        Ok(false)
    }

    fn raise_exception(&mut self, ctx: &mut CycleContext, record: ExceptionRecord) {
        if self.trace.flush {
            debug!("Exception {} at pc={} seq={}; flushing the pipeline", record.cause, record.pc, record.seq);
        }

        let squashed = self.rob.flush() as u64 + ctx.instr_queue.flush();
        self.rs_table.flush();
        self.eu_table.flush();
        self.cdb_broadcast_buffer.clear();
        ctx.memory_subsystem.lsq.flush();
        self.rat.reset(ctx.arch_reg_file);
        self.unresolved_branch_cnt = 0;
        self.exception = Some(record);

        ctx.perf_counters.squashed_cnt += squashed;
        ctx.perf_counters.pipeline_flushes += 1;
    }

    // Sends the oldest ready reservation stations to idle execution units.
    fn cycle_issue(&mut self, ctx: &mut CycleContext) -> Result<(), SimError> {
        let mut issued = 0;

        for rs_index in self.rs_table.ready_by_age() {
            if issued == self.issue_n_wide {
                break;
            }

            let rs = self.rs_table.get(rs_index);
            let seq = rs.seq;
            let operands = rs.operand_values();
            let rob_slot_index = match rs.rob_slot_index {
                Some(index) => index,
                None => return Err(Self::invariant(ctx.cycle, format!("busy RS {} without ROB slot", rs_index))),
            };

            let rob_slot = self.rob.get(rob_slot_index);
            let lsq_index = rob_slot.lsq_index;
            let instr = match &rob_slot.instr {
                Some(instr) => Rc::clone(instr),
                None => return Err(Self::invariant(ctx.cycle, format!("RS {} points to empty ROB slot {}", rs_index, rob_slot_index))),
            };

            let eu_index = match self.eu_table.find_idle(instr.unit_class(), ctx.cycle) {
                Some(eu_index) => eu_index,
                None => continue,
            };

            let outcome = match compute(&instr, &operands) {
                Ok(Outcome::Load { addr }) => {
                    let lsq_index = match lsq_index {
                        Some(index) => index,
                        None => return Err(Self::invariant(ctx.cycle, format!("load [{}] without LSQ entry", instr))),
                    };

                    let value = match ctx.memory_subsystem.lsq.check_load(seq, addr) {
                        LoadCheck::Blocked => {
                            if self.trace.issue {
                                debug!("Load [{}] waits for an older store address", instr);
                            }
                            ctx.perf_counters.load_stall_cnt += 1;
                            continue;
                        }
                        LoadCheck::Forward(value) => {
                            ctx.perf_counters.loads_forwarded_cnt += 1;
                            value
                        }
                        LoadCheck::Memory => ctx.memory_subsystem.load(addr),
                    };

                    ctx.memory_subsystem.lsq.resolve_load(lsq_index, addr);
                    Ok(Outcome::Value(value))
                }
                other => other,
            };

            self.eu_table.issue(eu_index, rob_slot_index, seq, ctx.cycle, outcome);
            self.rs_table.deallocate(rs_index);

            let rob_slot = self.rob.get_mut(rob_slot_index);
            rob_slot.state = ROBSlotState::ISSUED;
            rob_slot.rs_index = None;

            if self.trace.issue {
                debug!("Issued [{}] to {} unit {}", instr, self.eu_table.get(eu_index).class, eu_index);
            }

            ctx.perf_counters.issue_cnt += 1;
            issued += 1;
        }

        Ok(())
    }

    fn cycle_execute(&mut self, ctx: &mut CycleContext) {
        for completion in self.eu_table.complete(ctx.cycle) {
            if self.trace.execute {
                debug!("Executed seq={} outcome={:?}", completion.seq, completion.outcome);
            }

            ctx.perf_counters.execute_cnt += 1;
            self.cdb_broadcast_buffer.push(completion);
        }
    }

    // Broadcasts the oldest finished results on the CDB. A mispredicted branch
    // squashes everything younger and redirects the frontend.
    fn cycle_broadcast(&mut self, ctx: &mut CycleContext) -> Result<FrontendControl, SimError> {
        self.cdb_broadcast_buffer.sort_by_key(|completion| completion.seq);
        let broadcast_cnt = self.cdb_broadcast_buffer.len().min(self.cdb_n_wide as usize);
        let broadcasts: Vec<Completion> = self.cdb_broadcast_buffer.drain(..broadcast_cnt).collect();

        for completion in broadcasts {
            let rob_slot_index = completion.rob_slot_index;
            let rob_slot = self.rob.get_mut(rob_slot_index);
            if rob_slot.state != ROBSlotState::ISSUED || rob_slot.seq != completion.seq {
                return Err(Self::invariant(ctx.cycle, format!("broadcast for seq {} doesn't match ROB slot {}", completion.seq, rob_slot_index)));
            }

            rob_slot.state = ROBSlotState::EXECUTED;
            ctx.perf_counters.broadcast_cnt += 1;

            if self.trace.broadcast {
                debug!("CDB broadcast tag={} seq={} outcome={:?}", rob_slot_index, completion.seq, completion.outcome);
            }

            match completion.outcome {
                Ok(Outcome::Value(value)) => {
                    rob_slot.result = Some(value);
                    self.rs_table.wake(rob_slot_index, value);
                }
                Ok(Outcome::Store { addr, value }) => {
                    let lsq_index = match rob_slot.lsq_index {
                        Some(index) => index,
                        None => return Err(Self::invariant(ctx.cycle, format!("store seq {} without LSQ entry", completion.seq))),
                    };
                    ctx.memory_subsystem.lsq.resolve_store(lsq_index, addr, value);
                }
                Ok(Outcome::Branch { next_pc }) => {
                    rob_slot.branch_target_actual = Some(next_pc);
                    let predicted = rob_slot.branch_target_predicted;
                    let conditional = rob_slot.instr.as_ref().map_or(false, |instr| instr.is_conditional_branch());

                    if conditional {
                        self.unresolved_branch_cnt = self.unresolved_branch_cnt.saturating_sub(1);
                    }
                    ctx.perf_counters.branch_cnt += 1;

                    if next_pc != predicted {
                        if self.trace.flush {
                            debug!("Branch seq={} mispredicted: predicted={} actual={}", completion.seq, predicted, next_pc);
                        }
                        ctx.perf_counters.branch_misprediction_cnt += 1;
                        self.squash_after(completion.seq, ctx);
                        return Ok(FrontendControl::Redirect(next_pc));
                    }
                }
                Ok(Outcome::Done) => {}
                Ok(Outcome::Load { .. }) => {
                    return Err(Self::invariant(ctx.cycle, format!("load seq {} reached the CDB without a value", completion.seq)));
                }
                Err(fault) => rob_slot.fault = Some(fault),
            }
        }

        Ok(FrontendControl::Continue)
    }

    /// Discards every instruction younger than `seq` and rebuilds the RAT from
    /// the architectural state and the surviving in flight writers.
    fn squash_after(&mut self, seq: u64, ctx: &mut CycleContext) {
        let squashed = self.rob.squash_after(seq);
        self.rs_table.squash_after(seq);
        self.eu_table.squash_after(seq);
        self.cdb_broadcast_buffer.retain(|completion| completion.seq <= seq);
        ctx.memory_subsystem.lsq.squash_after(seq);
        let dropped = ctx.instr_queue.flush();

        self.rat.reset(ctx.arch_reg_file);
        let survivors: Vec<u16> = self.rob.in_order().collect();
        let mut unresolved_branch_cnt = 0;
        for rob_slot_index in survivors {
            let rob_slot = self.rob.get(rob_slot_index);
            if rob_slot.is_unresolved_branch() {
                unresolved_branch_cnt += 1;
            }
            if let Some(arch_reg) = rob_slot.instr.as_ref().and_then(|instr| instr.sink) {
                self.rat.set_pending(arch_reg, rob_slot_index);
            }
        }

        self.unresolved_branch_cnt = unresolved_branch_cnt;
        self.next_seq = seq + 1;

        if self.trace.flush {
            debug!("Squashed {} ROB entries and {} queued instructions after seq={}", squashed.len(), dropped, seq);
        }

        ctx.perf_counters.squashed_cnt += squashed.len() as u64 + dropped;
        ctx.perf_counters.pipeline_flushes += 1;
    }

    // Renames instructions from the instruction queue, in program order, into the ROB and the RS table.
    fn cycle_dispatch(&mut self, ctx: &mut CycleContext) -> Result<(), SimError> {
        for _ in 0..self.dispatch_n_wide {
            let instr = match ctx.instr_queue.peek() {
                Some(slot) => Rc::clone(&slot.instr),
                None => break,
            };

            if !self.rob.has_space() || !self.rs_table.has_free() {
                break;
            }

            if instr.is_mem_access() && !ctx.memory_subsystem.lsq.has_space() {
                break;
            }

            if instr.is_conditional_branch() && self.unresolved_branch_cnt >= self.max_outstanding_branches {
                break;
            }

            let branch_target_predicted = match ctx.instr_queue.dequeue() {
                Some(slot) => slot.branch_target_predicted,
                None => break,
            };

            let seq = self.next_seq;
            self.next_seq += 1;

            // Register renaming of the source operands; before the sink so that
            // 'add r1, r1, 1' reads the old r1.
            let mut source = [RSOperand::Unused; MAX_SOURCE_COUNT as usize];
            let mut source_ready_cnt = 0;
            for source_index in 0..instr.source_cnt as usize {
                source[source_index] = match instr.source[source_index] {
                    Operand::Register(arch_reg) => match self.rat.get(arch_reg) {
                        RATEntry::Ready(value) => RSOperand::Value(value),
                        RATEntry::Pending(tag) => {
                            let producer = self.rob.get(tag);
                            match (producer.state, producer.result) {
                                // the value was broadcast before we got here
                                (ROBSlotState::EXECUTED, Some(value)) => RSOperand::Value(value),
                                _ => RSOperand::Waiting(tag),
                            }
                        }
                    },
                    Operand::Immediate(value) => RSOperand::Value(value),
                    Operand::Unused => {
                        return Err(Self::invariant(ctx.cycle, format!("illegal source {} of [{}]", source_index, instr)));
                    }
                };

                if let RSOperand::Value(_) = source[source_index] {
                    source_ready_cnt += 1;
                }
            }

            let rob_slot_index = self.rob.allocate();
            let rs_index = self.rs_table.allocate();

            let rs = self.rs_table.get_mut(rs_index);
            rs.rob_slot_index = Some(rob_slot_index);
            rs.seq = seq;
            rs.opcode = instr.opcode;
            rs.source_cnt = instr.source_cnt;
            rs.source = source;
            rs.source_ready_cnt = source_ready_cnt;

            // Register renaming of the sink operand.
            if let Some(arch_reg) = instr.sink {
                self.rat.set_pending(arch_reg, rob_slot_index);
            }

            let lsq_index = if instr.is_mem_access() {
                let kind = if instr.opcode.is_store() { AccessKind::Store } else { AccessKind::Load };
                Some(ctx.memory_subsystem.lsq.allocate(kind, seq, rob_slot_index))
            } else {
                None
            };

            if instr.is_conditional_branch() {
                self.unresolved_branch_cnt += 1;
            }

            if self.trace.dispatch {
                debug!("Dispatched [{}] seq={} tag={} {}", instr, seq, rob_slot_index, self.rs_table.get(rs_index));
            }

            let rob_slot = self.rob.get_mut(rob_slot_index);
            rob_slot.instr = Some(instr);
            rob_slot.state = ROBSlotState::DISPATCHED;
            rob_slot.seq = seq;
            rob_slot.rs_index = Some(rs_index);
            rob_slot.lsq_index = lsq_index;
            rob_slot.branch_target_predicted = branch_target_predicted;

            ctx.perf_counters.dispatch_cnt += 1;
        }

        Ok(())
    }

    /// Checks the structural invariants that must hold at every cycle boundary.
    pub(crate) fn check_invariants(&self, memory_subsystem: &MemorySubsystem) -> Result<(), String> {
        for (arch_reg, tag) in self.rat.pending() {
            let rob_slot = self.rob.get(tag);
            if rob_slot.state == ROBSlotState::UNUSED {
                return Err(format!("r{} is pending on unused ROB slot {}", arch_reg, tag));
            }

            let sink = rob_slot.instr.as_ref().and_then(|instr| instr.sink);
            if sink != Some(arch_reg) {
                return Err(format!("r{} is pending on ROB slot {} which doesn't write it", arch_reg, tag));
            }
        }

        if self.rob.size() > self.rob.capacity() {
            return Err(format!("ROB holds {} entries, capacity is {}", self.rob.size(), self.rob.capacity()));
        }

        if self.rs_table.busy_cnt() > self.rs_table.capacity {
            return Err(format!("{} reservation stations busy, capacity is {}", self.rs_table.busy_cnt(), self.rs_table.capacity));
        }

        let lsq = &memory_subsystem.lsq;
        if lsq.size() > lsq.capacity() {
            return Err(format!("LSQ holds {} entries, capacity is {}", lsq.size(), lsq.capacity()));
        }

        let mut mem_access_cnt = 0;
        for rob_slot_index in self.rob.in_order() {
            let rob_slot = self.rob.get(rob_slot_index);
            match &rob_slot.instr {
                Some(instr) => {
                    if instr.is_mem_access() {
                        mem_access_cnt += 1;
                    }
                }
                None => return Err(format!("ROB slot {} is in flight without an instruction", rob_slot_index)),
            }

            if let Some(rs_index) = rob_slot.rs_index {
                if self.rs_table.get(rs_index).rob_slot_index != Some(rob_slot_index) {
                    return Err(format!("ROB slot {} and RS {} don't point to each other", rob_slot_index, rs_index));
                }
            }

            if let Some(lsq_index) = rob_slot.lsq_index {
                let entry = lsq.get(lsq_index);
                if entry.rob_slot_index != rob_slot_index || entry.seq != rob_slot.seq {
                    return Err(format!("ROB slot {} and LSQ entry {} don't point to each other", rob_slot_index, lsq_index));
                }
            }
        }

        if mem_access_cnt != lsq.size() {
            return Err(format!("{} memory accesses in flight, but the LSQ holds {}", mem_access_cnt, lsq.size()));
        }

        Ok(())
    }

    pub(crate) fn rob_snapshot(&self) -> Vec<ROBEntrySnapshot> {
        self.rob
            .in_order()
            .map(|rob_slot_index| {
                let rob_slot = self.rob.get(rob_slot_index);
                ROBEntrySnapshot {
                    tag: rob_slot_index,
                    seq: rob_slot.seq,
                    pc: rob_slot.instr.as_ref().map_or(0, |instr| instr.pc),
                    instr: rob_slot.instr.as_ref().map_or_else(String::new, |instr| instr.to_string()),
                    state: rob_slot.state.name(),
                    result: rob_slot.result,
                    fault: rob_slot.fault,
                }
            })
            .collect()
    }

    pub(crate) fn rs_busy_cnt(&self) -> u16 {
        self.rs_table.busy_cnt()
    }

    pub(crate) fn eu_executing_cnt(&self) -> u16 {
        self.eu_table.executing_cnt()
    }
}
