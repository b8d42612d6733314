use std::collections::BTreeMap;
use std::fs;
use std::rc::Rc;

use log::info;
use regex::Regex;

use crate::cpu::CPUConfig;
use crate::error::LoadError;
use crate::instructions::instructions::{create_instr, get_opcode, get_register, register_name, CodeAddress, Instr, Operand, Operands, Program, RegisterType, UnitClass, WordType};
use crate::loader::ast::{AddrSpec, InputDocument, InstrSpec, OperandSpec, TraceItem, Word};

/// The regular expressions for the textual instruction syntax.
struct TextSyntax {
    instr: Regex,
    mem: Regex,
}

impl TextSyntax {
    fn new() -> Result<TextSyntax, LoadError> {
        let instr = Regex::new(r"^\s*([A-Za-z]+)(?:\s+(.*?))?\s*;?\s*$")
            .map_err(|err| LoadError::ParseError(err.to_string()))?;
        let mem = Regex::new(r"^\[\s*(#?-?[0-9A-Za-z]+)\s*(?:([+-])\s*#?(0[xX][0-9a-fA-F]+|[0-9]+))?\s*\]$")
            .map_err(|err| LoadError::ParseError(err.to_string()))?;
        Ok(TextSyntax { instr, mem })
    }

    /// Parses "OP operands" into the same form as a structured trace item.
    fn parse(&self, text: &str) -> Result<InstrSpec, String> {
        let captures = self.instr.captures(text).ok_or_else(|| format!("Can't parse '{}'", text))?;
        let op = captures[1].to_string();
        let opcode = get_opcode(&op).ok_or_else(|| format!("Unknown mnemonic '{}'", op))?;

        let operands = captures.get(2).map_or("", |m| m.as_str()).trim();
        let mut tokens: Vec<&str> = if operands.is_empty() {
            Vec::new()
        } else {
            operands.split(',').map(str::trim).collect()
        };

        let mut spec = InstrSpec { op, ..InstrSpec::default() };

        if opcode.has_sink() && !tokens.is_empty() {
            spec.dst = Some(OperandSpec::Name(tokens.remove(0).to_string()));
        }

        if opcode.is_branch() {
            if let Some(token) = tokens.pop() {
                let target = parse_number(token).ok_or_else(|| format!("Illegal branch target '{}'", token))?;
                spec.target = Some(target as CodeAddress);
            }
        }

        for token in tokens {
            if token.starts_with('[') {
                if spec.addr.is_some() {
                    return Err(format!("More than one memory operand in '{}'", text));
                }
                spec.addr = Some(self.parse_mem(token)?);
            } else {
                spec.src.push(OperandSpec::Name(token.to_string()));
            }
        }

        Ok(spec)
    }

    fn parse_mem(&self, token: &str) -> Result<AddrSpec, String> {
        let captures = self.mem.captures(token).ok_or_else(|| format!("Illegal memory operand '{}'", token))?;
        let base = OperandSpec::Name(captures[1].to_string());

        let offset = match (captures.get(2), captures.get(3)) {
            (Some(sign), Some(digits)) => {
                let value = parse_number(digits.as_str()).ok_or_else(|| format!("Illegal offset in '{}'", token))?;
                if sign.as_str() == "-" { value.wrapping_neg() } else { value }
            }
            _ => 0,
        };

        Ok(AddrSpec { base, offset: Word::Unsigned(offset) })
    }
}

// Parses a decimal or 0x hex number with an optional '#' prefix and '-' sign.
fn parse_number(text: &str) -> Option<WordType> {
    let text = text.trim();
    let text = text.strip_prefix('#').unwrap_or(text);
    let (negative, digits) = match text.strip_prefix('-') {
        Some(digits) => (true, digits),
        None => (false, text),
    };

    let value = match digits.strip_prefix("0x").or_else(|| digits.strip_prefix("0X")) {
        Some(hex) => u64::from_str_radix(hex, 16).ok()?,
        None => digits.parse::<u64>().ok()?,
    };

    Some(if negative { value.wrapping_neg() } else { value })
}

fn parse_address(text: &str) -> Option<WordType> {
    let text = text.trim();
    match text.strip_prefix("0x").or_else(|| text.strip_prefix("0X")) {
        Some(hex) => u64::from_str_radix(hex, 16).ok(),
        None => text.parse::<u64>().ok(),
    }
}

fn resolve_operand(spec: &OperandSpec) -> Result<Operand, String> {
    match spec {
        OperandSpec::Value(word) => Ok(Operand::Immediate(word.to_word())),
        OperandSpec::Name(name) => {
            if let Some(reg) = get_register(name) {
                Ok(Operand::Register(reg))
            } else if let Some(value) = parse_number(name) {
                Ok(Operand::Immediate(value))
            } else {
                Err(format!("Illegal operand '{}'", name))
            }
        }
    }
}

fn build_instr(pc: CodeAddress, spec: &InstrSpec) -> Result<Instr, String> {
    let opcode = get_opcode(&spec.op).ok_or_else(|| format!("Unknown mnemonic '{}'", spec.op))?;

    let sink = spec.dst.as_ref().map(resolve_operand).transpose()?;
    let sources = spec.src.iter().map(resolve_operand).collect::<Result<Vec<_>, _>>()?;
    let mem = match &spec.addr {
        Some(addr) => Some((resolve_operand(&addr.base)?, addr.offset.to_word())),
        None => None,
    };

    create_instr(pc, opcode, Operands {
        sink,
        sources,
        mem,
        target: spec.target,
        predicted_target: spec.predicted_target,
    })
}

struct Loader {
    cpu_config: CPUConfig,
    syntax: TextSyntax,
    code: Vec<Instr>,
    registers: BTreeMap<RegisterType, WordType>,
    data_items: BTreeMap<WordType, WordType>,
    errors: Vec<String>,
}

impl Loader {
    fn load(&mut self, document: &InputDocument) {
        self.errors.extend(self.cpu_config.validate());

        for (name, value) in &document.registers {
            match get_register(name) {
                Some(reg) => {
                    if self.registers.insert(reg, value.to_word()).is_some() {
                        self.errors.push(format!("registers: {} is given more than once", register_name(reg)));
                    }
                }
                None => self.errors.push(format!("registers: illegal register '{}'", name)),
            }
        }

        for (key, value) in &document.memory {
            match parse_address(key) {
                Some(addr) => {
                    if self.data_items.insert(addr, value.to_word()).is_some() {
                        self.errors.push(format!("memory: address {} is given more than once", addr));
                    }
                }
                None => self.errors.push(format!("memory: illegal address '{}'", key)),
            }
        }

        for (pc, item) in document.trace.iter().enumerate() {
            let instr = match item {
                TraceItem::Text(text) => self.syntax.parse(text).and_then(|spec| build_instr(pc, &spec)),
                TraceItem::Structured(spec) => build_instr(pc, spec),
            };

            match instr {
                Ok(instr) => self.code.push(instr),
                Err(msg) => self.errors.push(format!("trace[{}]: {}", pc, msg)),
            }
        }

        self.analyze(document.trace.len());
    }

    // Checks that need the whole trace.
    fn analyze(&mut self, trace_len: usize) {
        for instr in &self.code {
            if let Some(target) = instr.branch_target {
                if target > trace_len {
                    self.errors.push(format!("trace[{}]: branch target {} is outside the trace of length {}", instr.pc, target, trace_len));
                }
            }

            if let Some(target) = instr.predicted_target {
                if target > trace_len {
                    self.errors.push(format!("trace[{}]: predicted target {} is outside the trace of length {}", instr.pc, target, trace_len));
                }
            }
        }

        for class in UnitClass::ALL {
            let used = self.code.iter().any(|instr| instr.unit_class() == class);
            if used && self.cpu_config.unit_config(class).count == 0 {
                self.errors.push(format!("config: the trace needs a {} unit, but there are none", class));
            }
        }
    }
}

pub(crate) fn load(path: &str, fallback_config: CPUConfig) -> Result<(CPUConfig, Program), LoadError> {
    let src = fs::read_to_string(path).map_err(|source| LoadError::IOError { path: path.to_string(), source })?;
    info!("Loading {}", path);
    load_from_string(&src, fallback_config)
}

/// Loads an input document. The `config` section of the document takes
/// precedence over `fallback_config`.
pub(crate) fn load_from_string(src: &str, fallback_config: CPUConfig) -> Result<(CPUConfig, Program), LoadError> {
    let mut document: InputDocument = serde_json::from_str(src)
        .map_err(|err| LoadError::ParseError(format!("input: {}", err)))?;

    let mut loader = Loader {
        cpu_config: document.config.take().unwrap_or(fallback_config),
        syntax: TextSyntax::new()?,
        code: Vec::with_capacity(document.trace.len()),
        registers: BTreeMap::new(),
        data_items: BTreeMap::new(),
        errors: Vec::new(),
    };

    loader.load(&document);

    if !loader.errors.is_empty() {
        return Err(LoadError::AnalysisError(loader.errors));
    }

    let code = loader.code.into_iter().map(Rc::new).collect();
    let program = Program {
        code,
        registers: loader.registers.into_iter().collect(),
        data_items: loader.data_items,
    };
    Ok((loader.cpu_config, program))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::instructions::instructions::Opcode;

    fn load_ok(src: &str) -> (CPUConfig, Program) {
        match load_from_string(src, CPUConfig::default()) {
            Ok(loaded) => loaded,
            Err(err) => panic!("{}", err),
        }
    }

    fn analysis_errors(src: &str) -> Vec<String> {
        match load_from_string(src, CPUConfig::default()) {
            Err(LoadError::AnalysisError(errors)) => errors,
            Err(err) => panic!("unexpected error {}", err),
            Ok(_) => panic!("expected analysis errors"),
        }
    }

    #[test]
    fn test_text_syntax() {
        let (_, program) = load_ok(r#"{ "trace": [
            "ADD r3, r1, #2",
            "li x4, -1",
            "ldr r5, [r1 + 8]",
            "str r5, [r2 - 0x10];",
            "ld r6, [100]",
            "bne r1, r2, 0",
            "j 7",
            "nop"
        ] }"#);

        assert_eq!(program.len(), 8);

        let add = &program.code[0];
        assert_eq!(add.opcode, Opcode::ADD);
        assert_eq!(add.sink, Some(3));
        assert_eq!(add.source, [Operand::Register(1), Operand::Immediate(2)]);

        assert_eq!(program.code[1].source[0], Operand::Immediate(u64::MAX));

        let ldr = &program.code[2];
        assert_eq!(ldr.source[0], Operand::Register(1));
        assert_eq!(ldr.mem_offset, 8);

        let store = &program.code[3];
        assert_eq!(store.source, [Operand::Register(5), Operand::Register(2)]);
        assert_eq!(store.mem_offset, (-16i64) as u64);

        let absolute = &program.code[4];
        assert_eq!(absolute.source[0], Operand::Immediate(100));

        assert_eq!(program.code[5].branch_target, Some(0));
        assert_eq!(program.code[6].opcode, Opcode::B);
        assert_eq!(program.code[6].branch_target, Some(7));
        assert_eq!(program.code[7].source_cnt, 0);
    }

    #[test]
    fn test_structured_and_initial_state() {
        let (cpu_config, program) = load_ok(r##"{
            "config": { "rob_size": 4 },
            "registers": { "r1": 5, "x2": 3 },
            "memory": { "100": 7, "0x20": 1 },
            "trace": [
                { "op": "mul", "dst": "r4", "src": ["r1", "#3"] },
                { "op": "str", "src": ["r4"], "addr": { "base": 100 } },
                { "op": "beq", "src": ["r1", 0], "target": 0, "predicted_target": 0 }
            ]
        }"##);

        assert_eq!(cpu_config.rob_capacity, 4);
        assert_eq!(program.registers, vec![(1, 5), (2, 3)]);
        assert_eq!(program.data_items.get(&100), Some(&7));
        assert_eq!(program.data_items.get(&0x20), Some(&1));
        assert_eq!(program.code[0].source, [Operand::Register(1), Operand::Immediate(3)]);
        assert_eq!(program.code[1].source, [Operand::Register(4), Operand::Immediate(100)]);
        assert_eq!(program.code[2].predicted_target, Some(0));
    }

    #[test]
    fn test_fallback_config_is_used_without_config_section() {
        let fallback = CPUConfig { rob_capacity: 2, ..CPUConfig::default() };
        let (cpu_config, _) = load_from_string(r#"{ "trace": [] }"#, fallback).unwrap();
        assert_eq!(cpu_config.rob_capacity, 2);
    }

    #[test]
    fn test_all_errors_are_collected() {
        let errors = analysis_errors(r#"{
            "config": { "rob_size": 0 },
            "registers": { "r40": 1 },
            "memory": { "abc": 1 },
            "trace": [
                "fadd r1, r2, r3",
                "add r1, r2",
                "beq r1, r2, 9",
                { "op": "mov", "dst": 5, "src": [1] }
            ]
        }"#);

        assert_eq!(errors.len(), 7, "{:?}", errors);
        assert!(errors.iter().any(|e| e.contains("rob_size")));
        assert!(errors.iter().any(|e| e.contains("r40")));
        assert!(errors.iter().any(|e| e.contains("'abc'")));
        assert!(errors.iter().any(|e| e.starts_with("trace[0]") && e.contains("fadd")));
        assert!(errors.iter().any(|e| e.starts_with("trace[1]")));
        assert!(errors.iter().any(|e| e.starts_with("trace[2]") && e.contains("outside")));
        assert!(errors.iter().any(|e| e.starts_with("trace[3]") && e.contains("destination")));
    }

    #[test]
    fn test_target_equal_to_length_is_allowed() {
        let (_, program) = load_ok(r#"{ "trace": [ "beq r0, r0, 1" ] }"#);
        assert_eq!(program.code[0].branch_target, Some(1));
    }

    #[test]
    fn test_missing_unit_for_used_class() {
        let errors = analysis_errors(r#"{
            "config": { "units": { "mul": { "count": 0, "latency": 3 } } },
            "trace": [ "mul r1, r2, r3" ]
        }"#);
        assert_eq!(errors, vec!["config: the trace needs a mul unit, but there are none".to_string()]);
    }

    #[test]
    fn test_duplicate_register_alias() {
        let errors = analysis_errors(r#"{ "registers": { "r1": 1, "x1": 2 }, "trace": [] }"#);
        assert_eq!(errors, vec!["registers: r1 is given more than once".to_string()]);
    }

    #[test]
    fn test_malformed_json_is_a_parse_error() {
        match load_from_string("{ \"trace\": [", CPUConfig::default()) {
            Err(err @ LoadError::ParseError(_)) => assert_eq!(err.exit_code(), 2),
            _ => panic!("expected a parse error"),
        }
    }

    #[test]
    fn test_missing_file() {
        match load("/nonexistent/input.json", CPUConfig::default()) {
            Err(err @ LoadError::IOError { .. }) => assert_eq!(err.exit_code(), 1),
            _ => panic!("expected an IO error"),
        }
    }
}
