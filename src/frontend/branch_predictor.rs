use serde::{Deserialize, Serialize};

use crate::instructions::instructions::{CodeAddress, Instr, Opcode};

#[derive(Clone, Copy, PartialEq, Eq, Debug, Default, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub(crate) enum BranchPrediction {
    #[default]
    NotTaken,
    Taken,
    // backward taken, forward not taken
    BackwardTaken,
    // use the predicted_target of the instruction
    Annotated,
}

/// A static branch predictor; the prediction only depends on the instruction.
pub(crate) struct BranchPredictor {
    mode: BranchPrediction,
}

impl BranchPredictor {
    pub(crate) fn new(mode: BranchPrediction) -> Self {
        Self { mode }
    }

    /// The pc the frontend continues fetching from after `instr`.
    pub(crate) fn predict(&self, instr: &Instr) -> CodeAddress {
        let fallthrough = instr.fallthrough();
        let target = match instr.branch_target {
            Some(target) => target,
            None => return fallthrough,
        };

        if instr.opcode == Opcode::B {
            return target;
        }

        match self.mode {
            BranchPrediction::NotTaken => fallthrough,
            BranchPrediction::Taken => target,
            BranchPrediction::BackwardTaken => if target <= instr.pc { target } else { fallthrough },
            BranchPrediction::Annotated => instr.predicted_target.unwrap_or(fallthrough),
        }
    }
}
