use std::collections::BTreeMap;
use std::fmt;
use std::rc::Rc;

use serde::{Deserialize, Serialize};

use crate::instructions::instructions::Operand::{Immediate, Register, Unused};

pub(crate) type WordType = u64;
pub(crate) type RegisterType = u16;
// Position of an instruction in the trace.
pub(crate) type CodeAddress = usize;

pub(crate) const ARCH_REG_CNT: u16 = 32;
// The maximum number of source (input) operands for an instruction.
pub(crate) const MAX_SOURCE_COUNT: u8 = 2;

#[derive(Clone, Copy, PartialEq, Eq, Debug, Hash)]
pub(crate) enum Opcode {
    NOP,
    MOV,
    ADD,
    SUB,
    AND,
    ORR,
    EOR,
    LSL,
    LSR,
    SLT,
    MUL,
    DIV,
    REM,
    LDR,
    STR,
    B,
    BEQ,
    BNE,
    BLT,
    BGE,
}

/// The kind of functional unit an opcode executes on.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Debug, Hash, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub(crate) enum UnitClass {
    Alu,
    Mul,
    Mem,
    Branch,
}

impl UnitClass {
    pub(crate) const ALL: [UnitClass; 4] = [UnitClass::Alu, UnitClass::Mul, UnitClass::Mem, UnitClass::Branch];

    pub(crate) fn name(self) -> &'static str {
        match self {
            UnitClass::Alu => "alu",
            UnitClass::Mul => "mul",
            UnitClass::Mem => "mem",
            UnitClass::Branch => "branch",
        }
    }
}

impl fmt::Display for UnitClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

impl Opcode {
    pub(crate) fn unit_class(self) -> UnitClass {
        match self {
            Opcode::NOP |
            Opcode::MOV |
            Opcode::ADD |
            Opcode::SUB |
            Opcode::AND |
            Opcode::ORR |
            Opcode::EOR |
            Opcode::LSL |
            Opcode::LSR |
            Opcode::SLT => UnitClass::Alu,
            Opcode::MUL |
            Opcode::DIV |
            Opcode::REM => UnitClass::Mul,
            Opcode::LDR |
            Opcode::STR => UnitClass::Mem,
            Opcode::B |
            Opcode::BEQ |
            Opcode::BNE |
            Opcode::BLT |
            Opcode::BGE => UnitClass::Branch,
        }
    }

    // True if the instruction writes an architectural register.
    pub(crate) fn has_sink(self) -> bool {
        !matches!(self, Opcode::NOP | Opcode::STR) && !self.is_branch()
    }

    pub(crate) fn is_branch(self) -> bool {
        self.unit_class() == UnitClass::Branch
    }

    pub(crate) fn is_conditional_branch(self) -> bool {
        matches!(self, Opcode::BEQ | Opcode::BNE | Opcode::BLT | Opcode::BGE)
    }

    pub(crate) fn is_store(self) -> bool {
        self == Opcode::STR
    }

    pub(crate) fn is_mem_access(self) -> bool {
        self.unit_class() == UnitClass::Mem
    }
}

pub(crate) fn mnemonic(opcode: Opcode) -> &'static str {
    match opcode {
        Opcode::NOP => "NOP",
        Opcode::MOV => "MOV",
        Opcode::ADD => "ADD",
        Opcode::SUB => "SUB",
        Opcode::AND => "AND",
        Opcode::ORR => "ORR",
        Opcode::EOR => "EOR",
        Opcode::LSL => "LSL",
        Opcode::LSR => "LSR",
        Opcode::SLT => "SLT",
        Opcode::MUL => "MUL",
        Opcode::DIV => "DIV",
        Opcode::REM => "REM",
        Opcode::LDR => "LDR",
        Opcode::STR => "STR",
        Opcode::B => "B",
        Opcode::BEQ => "BEQ",
        Opcode::BNE => "BNE",
        Opcode::BLT => "BLT",
        Opcode::BGE => "BGE",
    }
}

pub(crate) fn get_opcode(mnemonic: &str) -> Option<Opcode> {
    let string = mnemonic.to_uppercase();
    let mnemonic_uppercased = string.as_str();

    match mnemonic_uppercased {
        "NOP" => Some(Opcode::NOP),
        "MOV" | "LI" => Some(Opcode::MOV),
        "ADD" | "ADDI" => Some(Opcode::ADD),
        "SUB" | "SUBI" => Some(Opcode::SUB),
        "AND" | "ANDI" => Some(Opcode::AND),
        "ORR" | "OR" | "ORI" => Some(Opcode::ORR),
        "EOR" | "XOR" | "XORI" => Some(Opcode::EOR),
        "LSL" | "SHL" | "SLL" => Some(Opcode::LSL),
        "LSR" | "SHR" | "SRL" => Some(Opcode::LSR),
        "SLT" => Some(Opcode::SLT),
        "MUL" | "MULU" => Some(Opcode::MUL),
        "DIV" | "DIVU" => Some(Opcode::DIV),
        "REM" | "REMU" => Some(Opcode::REM),
        "LDR" | "LOAD" | "LD" => Some(Opcode::LDR),
        "STR" | "STORE" | "ST" => Some(Opcode::STR),
        "B" | "J" | "JMP" => Some(Opcode::B),
        "BEQ" => Some(Opcode::BEQ),
        "BNE" => Some(Opcode::BNE),
        "BLT" => Some(Opcode::BLT),
        "BGE" => Some(Opcode::BGE),
        _ => None,
    }
}

pub(crate) fn get_register(name: &str) -> Option<RegisterType> {
    let name_lowercased = name.trim().to_lowercase();
    let reg_name = name_lowercased
        .strip_prefix('r')
        .or_else(|| name_lowercased.strip_prefix('x'))?;

    // reject "r01" and "r+1"; only plain decimal indices are register names
    if reg_name.is_empty() || !reg_name.chars().all(|c| c.is_ascii_digit()) || (reg_name.len() > 1 && reg_name.starts_with('0')) {
        return None;
    }

    let reg: RegisterType = reg_name.parse().ok()?;
    if reg >= ARCH_REG_CNT {
        return None;
    }
    Some(reg)
}

pub(crate) fn register_name(reg: RegisterType) -> String {
    format!("r{}", reg)
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Operand {
    Register(RegisterType),
    // The operand is directly specified in the instruction itself.
    Immediate(WordType),
    Unused,
}

impl fmt::Display for Operand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Register(reg) => write!(f, "r{}", reg),
            Immediate(val) => write!(f, "#{}", *val as i64),
            Unused => write!(f, "Unused"),
        }
    }
}

/// A decoded instruction. Immutable once created by the loader.
#[derive(Debug, Clone)]
pub(crate) struct Instr {
    pub(crate) pc: CodeAddress,
    pub(crate) opcode: Opcode,
    pub(crate) source_cnt: u8,
    pub(crate) source: [Operand; MAX_SOURCE_COUNT as usize],
    pub(crate) sink: Option<RegisterType>,
    // Added to the base source of a LDR/STR to form the address.
    pub(crate) mem_offset: WordType,
    pub(crate) branch_target: Option<CodeAddress>,
    pub(crate) predicted_target: Option<CodeAddress>,
}

impl Instr {
    pub(crate) fn fallthrough(&self) -> CodeAddress {
        self.pc + 1
    }

    pub(crate) fn is_conditional_branch(&self) -> bool {
        self.opcode.is_conditional_branch()
    }

    pub(crate) fn is_mem_access(&self) -> bool {
        self.opcode.is_mem_access()
    }

    pub(crate) fn unit_class(&self) -> UnitClass {
        self.opcode.unit_class()
    }

    fn fmt_mem(&self, f: &mut fmt::Formatter<'_>, base: &Operand) -> fmt::Result {
        match base {
            Register(_) => write!(f, "[{} + {}]", base, self.mem_offset as i64),
            _ => write!(f, "[{}]", (self.mem_offset as i64).wrapping_add(base.immediate_or_zero() as i64)),
        }
    }
}

impl Operand {
    fn immediate_or_zero(&self) -> WordType {
        match self {
            Immediate(value) => *value,
            _ => 0,
        }
    }
}

impl fmt::Display for Instr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", mnemonic(self.opcode))?;

        match self.opcode {
            Opcode::NOP => {}
            Opcode::MOV => write!(f, " r{}, {}", self.sink.unwrap_or_default(), self.source[0])?,
            Opcode::LDR => {
                write!(f, " r{}, ", self.sink.unwrap_or_default())?;
                self.fmt_mem(f, &self.source[0])?;
            }
            Opcode::STR => {
                write!(f, " {}, ", self.source[0])?;
                self.fmt_mem(f, &self.source[1])?;
            }
            Opcode::B => write!(f, " {}", self.branch_target.unwrap_or_default())?,
            Opcode::BEQ |
            Opcode::BNE |
            Opcode::BLT |
            Opcode::BGE => write!(f, " {}, {}, {}", self.source[0], self.source[1], self.branch_target.unwrap_or_default())?,
            _ => write!(f, " r{}, {}, {}", self.sink.unwrap_or_default(), self.source[0], self.source[1])?,
        }

        write!(f, " ; {}", self.pc)
    }
}

/// The operands of an instruction before they are checked against the opcode.
#[derive(Debug, Default, Clone)]
pub(crate) struct Operands {
    pub(crate) sink: Option<Operand>,
    pub(crate) sources: Vec<Operand>,
    // base and offset of the memory reference
    pub(crate) mem: Option<(Operand, WordType)>,
    pub(crate) target: Option<CodeAddress>,
    pub(crate) predicted_target: Option<CodeAddress>,
}

pub(crate) fn create_instr(pc: CodeAddress, opcode: Opcode, operands: Operands) -> Result<Instr, String> {
    let mut instr = Instr {
        pc,
        opcode,
        source_cnt: 0,
        source: [Unused, Unused],
        sink: None,
        mem_offset: 0,
        branch_target: None,
        predicted_target: None,
    };

    if opcode.has_sink() {
        match operands.sink {
            Some(Register(reg)) => instr.sink = Some(reg),
            Some(other) => return Err(format!("{:?} expects a register as destination, got {}", opcode, other)),
            None => return Err(format!("{:?} expects a destination register", opcode)),
        }
    } else if operands.sink.is_some() {
        return Err(format!("{:?} does not write a register", opcode));
    }

    let expected_sources = match opcode {
        Opcode::NOP | Opcode::LDR | Opcode::B => 0,
        Opcode::MOV | Opcode::STR => 1,
        _ => 2,
    };
    if operands.sources.len() != expected_sources {
        return Err(format!("{:?} expects {} source operands, but {} are provided", opcode, expected_sources, operands.sources.len()));
    }
    for (k, source) in operands.sources.iter().enumerate() {
        if *source == Unused {
            return Err(format!("{:?} source {} is missing", opcode, k));
        }
        instr.source[k] = *source;
    }
    instr.source_cnt = expected_sources as u8;

    match (opcode.is_mem_access(), operands.mem) {
        (true, Some((base, offset))) => {
            // the base register/immediate goes after the value being stored
            instr.source[instr.source_cnt as usize] = base;
            instr.source_cnt += 1;
            instr.mem_offset = offset;
        }
        (true, None) => return Err(format!("{:?} expects a memory operand", opcode)),
        (false, Some(_)) => return Err(format!("{:?} does not take a memory operand", opcode)),
        (false, None) => {}
    }

    match (opcode.is_branch(), operands.target) {
        (true, Some(target)) => instr.branch_target = Some(target),
        (true, None) => return Err(format!("{:?} expects a branch target", opcode)),
        (false, Some(_)) => return Err(format!("{:?} does not take a branch target", opcode)),
        (false, None) => {}
    }

    if operands.predicted_target.is_some() && !opcode.is_conditional_branch() {
        return Err(format!("{:?} can't carry a predicted target", opcode));
    }
    instr.predicted_target = operands.predicted_target;

    Ok(instr)
}

/// The static program together with the initial architectural state.
pub(crate) struct Program {
    pub(crate) code: Vec<Rc<Instr>>,
    pub(crate) registers: Vec<(RegisterType, WordType)>,
    pub(crate) data_items: BTreeMap<WordType, WordType>,
}

impl Program {
    pub fn get_instr(&self, pos: CodeAddress) -> Rc<Instr> {
        Rc::clone(&self.code[pos])
    }

    pub fn len(&self) -> usize {
        self.code.len()
    }
}

pub(crate) struct InstrQueueSlot {
    pub(crate) instr: Rc<Instr>,
    // where the frontend continued fetching after this instruction
    pub(crate) branch_target_predicted: CodeAddress,
}

/// The queue between the frontend and the backend.
pub(crate) struct InstrQueue {
    capacity: u16,
    head: u64,
    tail: u64,
    slots: Vec<Option<InstrQueueSlot>>,
}

impl InstrQueue {
    pub(crate) fn new(capacity: u16) -> Self {
        let mut slots = Vec::with_capacity(capacity as usize);
        for _ in 0..capacity {
            slots.push(None);
        }

        Self {
            capacity,
            head: 0,
            tail: 0,
            slots,
        }
    }

    fn to_index(&self, seq: u64) -> usize {
        (seq % self.capacity as u64) as usize
    }

    pub(crate) fn size(&self) -> u16 {
        (self.tail - self.head) as u16
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.head == self.tail
    }

    pub(crate) fn is_full(&self) -> bool {
        self.size() == self.capacity
    }

    pub(crate) fn enqueue(&mut self, slot: InstrQueueSlot) {
        assert!(!self.is_full(), "InstrQueue: can't enqueue when full");

        let index = self.to_index(self.tail);
        self.slots[index] = Some(slot);
        self.tail += 1;
    }

    pub(crate) fn peek(&self) -> Option<&InstrQueueSlot> {
        if self.is_empty() {
            return None;
        }
        self.slots[self.to_index(self.head)].as_ref()
    }

    pub(crate) fn dequeue(&mut self) -> Option<InstrQueueSlot> {
        if self.is_empty() {
            return None;
        }
        let index = self.to_index(self.head);
        self.head += 1;
        self.slots[index].take()
    }

    // Discards everything that was fetched; returns the number of dropped instructions.
    pub(crate) fn flush(&mut self) -> u64 {
        let dropped = self.tail - self.head;
        for slot in self.slots.iter_mut() {
            *slot = None;
        }
        self.head = self.tail;
        dropped
    }

    pub(crate) fn iter(&self) -> impl Iterator<Item = &InstrQueueSlot> + '_ {
        (self.head..self.tail).filter_map(move |seq| self.slots[self.to_index(seq)].as_ref())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn binary(dst: RegisterType, a: Operand, b: Operand) -> Operands {
        Operands {
            sink: Some(Register(dst)),
            sources: vec![a, b],
            ..Operands::default()
        }
    }

    #[test]
    fn test_get_opcode_aliases() {
        assert_eq!(get_opcode("add"), Some(Opcode::ADD));
        assert_eq!(get_opcode("addi"), Some(Opcode::ADD));
        assert_eq!(get_opcode("mulu"), Some(Opcode::MUL));
        assert_eq!(get_opcode("divu"), Some(Opcode::DIV));
        assert_eq!(get_opcode("Jmp"), Some(Opcode::B));
        assert_eq!(get_opcode("fadd"), None);
    }

    #[test]
    fn test_get_register() {
        assert_eq!(get_register("r0"), Some(0));
        assert_eq!(get_register("R31"), Some(31));
        assert_eq!(get_register("x7"), Some(7));
        assert_eq!(get_register("r32"), None);
        assert_eq!(get_register("r"), None);
        assert_eq!(get_register("r01"), None);
        assert_eq!(get_register("sp"), None);
    }

    #[test]
    fn test_create_binary() {
        let instr = create_instr(3, Opcode::ADD, binary(3, Register(1), Immediate(5))).unwrap();
        assert_eq!(instr.sink, Some(3));
        assert_eq!(instr.source_cnt, 2);
        assert_eq!(instr.source, [Register(1), Immediate(5)]);
        assert_eq!(instr.unit_class(), UnitClass::Alu);
        assert_eq!(format!("{}", instr), "ADD r3, r1, #5 ; 3");
    }

    #[test]
    fn test_create_store_puts_base_last() {
        let operands = Operands {
            sources: vec![Register(2)],
            mem: Some((Register(1), 8)),
            ..Operands::default()
        };
        let instr = create_instr(0, Opcode::STR, operands).unwrap();
        assert_eq!(instr.source_cnt, 2);
        assert_eq!(instr.source, [Register(2), Register(1)]);
        assert_eq!(instr.mem_offset, 8);
        assert_eq!(instr.sink, None);
    }

    #[test]
    fn test_create_arity_errors() {
        let missing_source = Operands {
            sink: Some(Register(1)),
            sources: vec![Register(2)],
            ..Operands::default()
        };
        assert!(create_instr(0, Opcode::ADD, missing_source).is_err());

        let immediate_sink = binary(0, Register(1), Register(2));
        let immediate_sink = Operands { sink: Some(Immediate(4)), ..immediate_sink };
        assert!(create_instr(0, Opcode::ADD, immediate_sink).is_err());

        let no_target = Operands {
            sources: vec![Register(1), Register(2)],
            ..Operands::default()
        };
        assert!(create_instr(0, Opcode::BEQ, no_target).is_err());

        let no_mem = Operands {
            sink: Some(Register(1)),
            ..Operands::default()
        };
        assert!(create_instr(0, Opcode::LDR, no_mem).is_err());
    }

    #[test]
    fn test_instr_queue_wraps() {
        let instr = Rc::new(create_instr(0, Opcode::NOP, Operands::default()).unwrap());
        let mut queue = InstrQueue::new(2);
        for round in 0..3 {
            queue.enqueue(InstrQueueSlot { instr: Rc::clone(&instr), branch_target_predicted: round });
            queue.enqueue(InstrQueueSlot { instr: Rc::clone(&instr), branch_target_predicted: round + 1 });
            assert!(queue.is_full());
            assert_eq!(queue.dequeue().unwrap().branch_target_predicted, round);
            assert_eq!(queue.peek().unwrap().branch_target_predicted, round + 1);
            assert_eq!(queue.flush(), 1);
            assert!(queue.is_empty());
        }
    }
}
