use std::fmt;

use serde::Serialize;

use crate::cpu::CPUConfig;
use crate::instructions::instructions::{CodeAddress, Instr, Opcode, UnitClass, WordType};

/// A synchronous exception raised by an instruction. It only takes effect
/// once the instruction reaches the head of the ROB.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Serialize)]
#[serde(rename_all = "snake_case")]
pub(crate) enum Fault {
    DivideByZero,
}

impl fmt::Display for Fault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Fault::DivideByZero => write!(f, "divide_by_zero"),
        }
    }
}

/// What an instruction produces once its operands are known.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub(crate) enum Outcome {
    Value(WordType),
    Store { addr: WordType, value: WordType },
    // the effective address of a load; the value comes from the LSQ or memory
    Load { addr: WordType },
    Branch { next_pc: CodeAddress },
    Done,
}

/// Computes the outcome of `instr` given its resolved source values in
/// source order.
pub(crate) fn compute(instr: &Instr, operands: &[WordType]) -> Result<Outcome, Fault> {
    let a = operands.first().copied().unwrap_or(0);
    let b = operands.get(1).copied().unwrap_or(0);

    let outcome = match instr.opcode {
        Opcode::NOP => Outcome::Done,
        Opcode::MOV => Outcome::Value(a),
        Opcode::ADD => Outcome::Value(a.wrapping_add(b)),
        Opcode::SUB => Outcome::Value(a.wrapping_sub(b)),
        Opcode::AND => Outcome::Value(a & b),
        Opcode::ORR => Outcome::Value(a | b),
        Opcode::EOR => Outcome::Value(a ^ b),
        Opcode::LSL => Outcome::Value(a << (b & 63)),
        Opcode::LSR => Outcome::Value(a >> (b & 63)),
        Opcode::SLT => Outcome::Value(((a as i64) < (b as i64)) as WordType),
        Opcode::MUL => Outcome::Value(a.wrapping_mul(b)),
        Opcode::DIV => {
            if b == 0 {
                return Err(Fault::DivideByZero);
            }
            Outcome::Value(a / b)
        }
        Opcode::REM => {
            if b == 0 {
                return Err(Fault::DivideByZero);
            }
            Outcome::Value(a % b)
        }
        Opcode::LDR => Outcome::Load { addr: a.wrapping_add(instr.mem_offset) },
        Opcode::STR => Outcome::Store { addr: b.wrapping_add(instr.mem_offset), value: a },
        Opcode::B |
        Opcode::BEQ |
        Opcode::BNE |
        Opcode::BLT |
        Opcode::BGE => {
            let target = instr.branch_target.unwrap_or(instr.fallthrough());
            let taken = match instr.opcode {
                Opcode::B => true,
                Opcode::BEQ => a == b,
                Opcode::BNE => a != b,
                Opcode::BLT => (a as i64) < (b as i64),
                Opcode::BGE => (a as i64) >= (b as i64),
                _ => unreachable!("Unhandled opcode {:?}", instr.opcode),
            };
            Outcome::Branch { next_pc: if taken { target } else { instr.fallthrough() } }
        }
    };

    Ok(outcome)
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub(crate) enum EUState {
    IDLE,
    EXECUTING,
}

/// A single execution unit.
pub(crate) struct EU {
    pub(crate) index: u16,
    pub(crate) class: UnitClass,
    pub(crate) latency: u32,
    pub(crate) state: EUState,
    pub(crate) rob_slot_index: Option<u16>,
    pub(crate) seq: u64,
    // the first cycle the unit can accept a new instruction
    pub(crate) busy_until: u64,
    pub(crate) complete_at: u64,
    outcome: Option<Result<Outcome, Fault>>,
}

impl EU {
    fn reset(&mut self) {
        self.rob_slot_index = None;
        self.seq = 0;
        self.state = EUState::IDLE;
        self.complete_at = 0;
        self.outcome = None;
    }
}

/// A result that finished executing and waits for the CDB.
#[derive(Clone, Copy, Debug)]
pub(crate) struct Completion {
    pub(crate) rob_slot_index: u16,
    pub(crate) seq: u64,
    pub(crate) outcome: Result<Outcome, Fault>,
}

/// The table containing all execution units of a CPU core.
pub(crate) struct EUTable {
    array: Vec<EU>,
}

impl EUTable {
    pub(crate) fn new(cpu_config: &CPUConfig) -> EUTable {
        let mut array = Vec::new();
        for class in UnitClass::ALL {
            let unit_config = cpu_config.unit_config(class);
            for _ in 0..unit_config.count {
                array.push(EU {
                    index: array.len() as u16,
                    class,
                    latency: unit_config.latency,
                    state: EUState::IDLE,
                    rob_slot_index: None,
                    seq: 0,
                    busy_until: 0,
                    complete_at: 0,
                    outcome: None,
                });
            }
        }

        EUTable { array }
    }

    pub(crate) fn get(&self, eu_index: u16) -> &EU {
        &self.array[eu_index as usize]
    }

    // The lowest numbered unit of the class that can start in this cycle.
    pub(crate) fn find_idle(&self, class: UnitClass, cycle: u64) -> Option<u16> {
        self.array
            .iter()
            .find(|eu| eu.class == class && eu.state == EUState::IDLE && eu.busy_until <= cycle)
            .map(|eu| eu.index)
    }

    pub(crate) fn issue(&mut self, eu_index: u16, rob_slot_index: u16, seq: u64, cycle: u64, outcome: Result<Outcome, Fault>) {
        let eu = &mut self.array[eu_index as usize];
        debug_assert!(eu.state == EUState::IDLE);
        debug_assert!(eu.busy_until <= cycle);

        eu.state = EUState::EXECUTING;
        eu.rob_slot_index = Some(rob_slot_index);
        eu.seq = seq;
        eu.busy_until = cycle + eu.latency as u64;
        eu.complete_at = cycle + eu.latency as u64 - 1;
        eu.outcome = Some(outcome);
    }

    /// Hands out the results of the units that finish in `cycle`.
    pub(crate) fn complete(&mut self, cycle: u64) -> Vec<Completion> {
        let mut completions = Vec::new();
        for eu in self.array.iter_mut() {
            if eu.state != EUState::EXECUTING || eu.complete_at != cycle {
                continue;
            }

            if let (Some(rob_slot_index), Some(outcome)) = (eu.rob_slot_index, eu.outcome) {
                completions.push(Completion { rob_slot_index, seq: eu.seq, outcome });
            }
            eu.reset();
        }
        completions
    }

    pub(crate) fn executing_cnt(&self) -> u16 {
        self.array.iter().filter(|eu| eu.state == EUState::EXECUTING).count() as u16
    }

    pub(crate) fn squash_after(&mut self, seq: u64) {
        for eu in self.array.iter_mut() {
            if eu.state == EUState::EXECUTING && eu.seq > seq {
                eu.reset();
                eu.busy_until = 0;
            }
        }
    }

    pub(crate) fn flush(&mut self) {
        for eu in self.array.iter_mut() {
            eu.reset();
            eu.busy_until = 0;
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use super::*;
    use crate::cpu::UnitConfig;
    use crate::instructions::instructions::{create_instr, Operand, Operands};

    fn instr(opcode: Opcode, operands: Operands) -> Instr {
        create_instr(4, opcode, operands).unwrap()
    }

    fn binary(opcode: Opcode) -> Instr {
        instr(opcode, Operands {
            sink: Some(Operand::Register(1)),
            sources: vec![Operand::Register(2), Operand::Register(3)],
            ..Operands::default()
        })
    }

    fn branch(opcode: Opcode, target: CodeAddress) -> Instr {
        instr(opcode, Operands {
            sources: vec![Operand::Register(2), Operand::Register(3)],
            target: Some(target),
            ..Operands::default()
        })
    }

    #[test]
    fn test_compute_alu() {
        assert_eq!(compute(&binary(Opcode::ADD), &[u64::MAX, 2]), Ok(Outcome::Value(1)));
        assert_eq!(compute(&binary(Opcode::SUB), &[0, 1]), Ok(Outcome::Value(u64::MAX)));
        assert_eq!(compute(&binary(Opcode::LSL), &[1, 65]), Ok(Outcome::Value(2)));
        assert_eq!(compute(&binary(Opcode::LSR), &[u64::MAX, 63]), Ok(Outcome::Value(1)));
        assert_eq!(compute(&binary(Opcode::SLT), &[(-1i64) as u64, 0]), Ok(Outcome::Value(1)));
        assert_eq!(compute(&binary(Opcode::SLT), &[3, 3]), Ok(Outcome::Value(0)));
        assert_eq!(compute(&binary(Opcode::REM), &[7, 3]), Ok(Outcome::Value(1)));
    }

    #[test]
    fn test_compute_divide_by_zero() {
        assert_eq!(compute(&binary(Opcode::DIV), &[7, 0]), Err(Fault::DivideByZero));
        assert_eq!(compute(&binary(Opcode::REM), &[7, 0]), Err(Fault::DivideByZero));
        assert_eq!(format!("{}", Fault::DivideByZero), "divide_by_zero");
    }

    #[test]
    fn test_compute_branches() {
        assert_eq!(compute(&branch(Opcode::BEQ, 0), &[1, 1]), Ok(Outcome::Branch { next_pc: 0 }));
        assert_eq!(compute(&branch(Opcode::BEQ, 0), &[1, 2]), Ok(Outcome::Branch { next_pc: 5 }));
        assert_eq!(compute(&branch(Opcode::BLT, 9), &[(-2i64) as u64, 1]), Ok(Outcome::Branch { next_pc: 9 }));
        assert_eq!(compute(&branch(Opcode::BGE, 9), &[(-2i64) as u64, 1]), Ok(Outcome::Branch { next_pc: 5 }));
    }

    #[test]
    fn test_compute_memory() {
        let store = instr(Opcode::STR, Operands {
            sources: vec![Operand::Register(2)],
            mem: Some((Operand::Register(1), 8)),
            ..Operands::default()
        });
        assert_eq!(compute(&store, &[42, 100]), Ok(Outcome::Store { addr: 108, value: 42 }));

        let load = instr(Opcode::LDR, Operands {
            sink: Some(Operand::Register(3)),
            mem: Some((Operand::Register(1), (-4i64) as u64)),
            ..Operands::default()
        });
        assert_eq!(compute(&load, &[100]), Ok(Outcome::Load { addr: 96 }));
    }

    #[test]
    fn test_unit_busy_for_latency() {
        let mut units = BTreeMap::new();
        units.insert(UnitClass::Mul, UnitConfig { count: 1, latency: 3 });
        let cpu_config = CPUConfig { units, ..CPUConfig::default() };
        let mut eu_table = EUTable::new(&cpu_config);

        let eu_index = eu_table.find_idle(UnitClass::Mul, 5).unwrap();
        eu_table.issue(eu_index, 0, 0, 5, Ok(Outcome::Value(24)));
        assert_eq!(eu_table.find_idle(UnitClass::Mul, 6), None);

        assert!(eu_table.complete(6).is_empty());
        let completions = eu_table.complete(7);
        assert_eq!(completions.len(), 1);
        assert_eq!(completions[0].outcome, Ok(Outcome::Value(24)));

        assert_eq!(eu_table.find_idle(UnitClass::Mul, 7), None);
        assert_eq!(eu_table.find_idle(UnitClass::Mul, 8), Some(eu_index));
    }

    #[test]
    fn test_squash_after_releases_units() {
        let mut eu_table = EUTable::new(&CPUConfig::default());
        let eu_index = eu_table.find_idle(UnitClass::Alu, 1).unwrap();
        eu_table.issue(eu_index, 3, 10, 1, Ok(Outcome::Done));
        assert_eq!(eu_table.executing_cnt(), 1);

        eu_table.squash_after(9);
        assert_eq!(eu_table.executing_cnt(), 0);
        assert_eq!(eu_table.find_idle(UnitClass::Alu, 1), Some(eu_index));
    }
}
