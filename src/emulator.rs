use std::collections::BTreeMap;

use log::debug;

use crate::backend::backend::ExceptionRecord;
use crate::backend::execution_unit::{compute, Outcome};
use crate::cpu::CPU;
use crate::error::SimError;
use crate::instructions::instructions::{register_name, Operand, Program, RegisterType, WordType, ARCH_REG_CNT};

/// Executes a program one instruction at a time in program order. The final
/// state of the out-of-order pipeline must be indistinguishable from it.
pub(crate) struct Emulator {
    pub(crate) registers: Vec<WordType>,
    pub(crate) memory: BTreeMap<WordType, WordType>,
    pub(crate) retired: u64,
    pub(crate) exception: Option<ExceptionRecord>,
}

impl Emulator {
    pub(crate) fn new(program: &Program) -> Emulator {
        let mut registers = vec![0; ARCH_REG_CNT as usize];
        for (arch_reg, value) in &program.registers {
            registers[*arch_reg as usize] = *value;
        }

        Emulator {
            registers,
            memory: program.data_items.clone(),
            retired: 0,
            exception: None,
        }
    }

    /// Runs until the pc leaves the program or an instruction faults.
    pub(crate) fn run(&mut self, program: &Program, max_steps: u64) -> Result<(), SimError> {
        let mut pc = 0;
        while pc < program.len() {
            if self.retired >= max_steps {
                return Err(SimError::CycleLimit(max_steps));
            }

            let instr = program.get_instr(pc);
            let operands: Vec<WordType> = instr.source[..instr.source_cnt as usize]
                .iter()
                .map(|operand| match operand {
                    Operand::Register(arch_reg) => self.registers[*arch_reg as usize],
                    Operand::Immediate(value) => *value,
                    Operand::Unused => 0,
                })
                .collect();

            let mut next_pc = instr.fallthrough();
            match compute(&instr, &operands) {
                Ok(Outcome::Value(value)) => self.write(instr.sink, value),
                Ok(Outcome::Load { addr }) => {
                    let value = self.memory.get(&addr).copied().unwrap_or(0);
                    self.write(instr.sink, value);
                }
                Ok(Outcome::Store { addr, value }) => {
                    self.memory.insert(addr, value);
                }
                Ok(Outcome::Branch { next_pc: target }) => next_pc = target,
                Ok(Outcome::Done) => {}
                Err(cause) => {
                    debug!("Reference model: {} at pc={}", cause, pc);
                    self.exception = Some(ExceptionRecord { pc, seq: self.retired, cause });
                    return Ok(());
                }
            }

            self.retired += 1;
            pc = next_pc;
        }

        Ok(())
    }

    fn write(&mut self, sink: Option<RegisterType>, value: WordType) {
        if let Some(arch_reg) = sink {
            self.registers[arch_reg as usize] = value;
        }
    }

    /// Compares the final architectural state of `cpu` with this model.
    pub(crate) fn verify(&self, cpu: &CPU) -> Result<(), SimError> {
        let registers = cpu.arch_reg_file.values();
        for (arch_reg, expected) in self.registers.iter().enumerate() {
            let actual = registers[arch_reg];
            if actual != *expected {
                return Err(SimError::Divergence(format!("{} is {} but should be {}",
                                                        register_name(arch_reg as RegisterType), actual, expected)));
            }
        }

        if cpu.memory_subsystem.memory != self.memory {
            return Err(SimError::Divergence(format!("memory is {:?} but should be {:?}",
                                                    cpu.memory_subsystem.memory, self.memory)));
        }

        if cpu.perf_counters.retired_cnt != self.retired {
            return Err(SimError::Divergence(format!("{} instructions retired but should be {}",
                                                    cpu.perf_counters.retired_cnt, self.retired)));
        }

        if cpu.exception() != self.exception {
            return Err(SimError::Divergence(format!("exception is {:?} but should be {:?}",
                                                    cpu.exception(), self.exception)));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::execution_unit::Fault;
    use crate::cpu::CPUConfig;
    use crate::loader::loader::load_from_string;

    fn emulate(src: &str) -> Emulator {
        let (_, program) = load_from_string(src, CPUConfig::default()).unwrap();
        let mut emulator = Emulator::new(&program);
        emulator.run(&program, 1000).unwrap();
        emulator
    }

    #[test]
    fn test_loop() {
        let emulator = emulate(r#"{
            "registers": { "r1": 4 },
            "trace": ["add r2, r2, 3", "sub r1, r1, 1", "bne r1, r0, 0"]
        }"#);
        assert_eq!(emulator.registers[2], 12);
        assert_eq!(emulator.registers[1], 0);
        assert_eq!(emulator.retired, 12);
        assert!(emulator.exception.is_none());
    }

    #[test]
    fn test_memory() {
        let emulator = emulate(r#"{
            "registers": { "r1": 16 },
            "memory": { "20": 9 },
            "trace": ["ldr r2, [r1 + 4]", "add r2, r2, 1", "str r2, [r1]", "ldr r3, [r1]"]
        }"#);
        assert_eq!(emulator.registers[3], 10);
        assert_eq!(emulator.memory.get(&16), Some(&10));
        assert_eq!(emulator.memory.get(&20), Some(&9));
    }

    #[test]
    fn test_fault_stops_execution() {
        let emulator = emulate(r#"{ "trace": ["mov r1, 1", "rem r2, r1, r0", "mov r3, 3"] }"#);
        assert_eq!(emulator.retired, 1);
        assert_eq!(emulator.exception, Some(ExceptionRecord { pc: 1, seq: 1, cause: Fault::DivideByZero }));
        assert_eq!(emulator.registers[3], 0);
    }

    #[test]
    fn test_step_budget() {
        let (_, program) = load_from_string(r#"{ "trace": ["b 0"] }"#, CPUConfig::default()).unwrap();
        let mut emulator = Emulator::new(&program);
        assert!(matches!(emulator.run(&program, 50), Err(SimError::CycleLimit(50))));
    }
}
