use std::collections::BTreeMap;

use serde::Deserialize;

use crate::cpu::CPUConfig;
use crate::instructions::instructions::{CodeAddress, WordType};

/// The input document.
#[derive(Deserialize, Debug)]
#[serde(deny_unknown_fields)]
pub(crate) struct InputDocument {
    #[serde(default)]
    pub(crate) config: Option<CPUConfig>,
    #[serde(default)]
    pub(crate) registers: BTreeMap<String, Word>,
    // address (decimal or 0x hex) to value
    #[serde(default)]
    pub(crate) memory: BTreeMap<String, Word>,
    pub(crate) trace: Vec<TraceItem>,
}

/// A JSON integer; negative values are stored two's complement.
#[derive(Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(untagged)]
pub(crate) enum Word {
    Unsigned(u64),
    Signed(i64),
}

impl Word {
    pub(crate) fn to_word(self) -> WordType {
        match self {
            Word::Unsigned(value) => value,
            Word::Signed(value) => value as WordType,
        }
    }
}

impl Default for Word {
    fn default() -> Self {
        Word::Unsigned(0)
    }
}

#[derive(Deserialize, Debug)]
#[serde(untagged)]
pub(crate) enum TraceItem {
    // e.g. "add r3, r1, #2"
    Text(String),
    Structured(InstrSpec),
}

#[derive(Deserialize, Debug, Default, Clone, PartialEq)]
#[serde(deny_unknown_fields)]
pub(crate) struct InstrSpec {
    pub(crate) op: String,
    #[serde(default)]
    pub(crate) dst: Option<OperandSpec>,
    #[serde(default)]
    pub(crate) src: Vec<OperandSpec>,
    #[serde(default)]
    pub(crate) addr: Option<AddrSpec>,
    #[serde(default)]
    pub(crate) target: Option<CodeAddress>,
    #[serde(default)]
    pub(crate) predicted_target: Option<CodeAddress>,
}

/// A register name ("r1") or an immediate, either as a JSON integer or as a
/// string ("#5", "-3", "0x10").
#[derive(Deserialize, Debug, Clone, PartialEq)]
#[serde(untagged)]
pub(crate) enum OperandSpec {
    Value(Word),
    Name(String),
}

#[derive(Deserialize, Debug, Clone, PartialEq)]
#[serde(deny_unknown_fields)]
pub(crate) struct AddrSpec {
    pub(crate) base: OperandSpec,
    #[serde(default)]
    pub(crate) offset: Word,
}
