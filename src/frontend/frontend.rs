use std::rc::Rc;

use log::debug;

use crate::cpu::{CPUConfig, PerfCounters, Trace};
use crate::frontend::branch_predictor::BranchPredictor;
use crate::instructions::instructions::{CodeAddress, InstrQueue, InstrQueueSlot, Program};

/// What the backend asks of the frontend at the end of a cycle.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub(crate) enum FrontendControl {
    Continue,
    // a branch was mispredicted; fetch restarts at the actual target next cycle
    Redirect(CodeAddress),
    // an exception was raised; nothing more will be fetched
    Halt,
}

pub(crate) struct Frontend {
    n_wide: u8,
    program_option: Option<Rc<Program>>,
    trace: Trace,
    predictor: BranchPredictor,
    pub(crate) pc: CodeAddress,
    pub(crate) halted: bool,
}

impl Frontend {
    pub(crate) fn new(cpu_config: &CPUConfig) -> Frontend {
        Frontend {
            n_wide: cpu_config.frontend_n_wide,
            program_option: None,
            trace: cpu_config.trace.clone(),
            predictor: BranchPredictor::new(cpu_config.branch_prediction),
            pc: 0,
            halted: false,
        }
    }

    pub(crate) fn init(&mut self, program: &Rc<Program>) {
        self.program_option = Some(Rc::clone(program));
        self.pc = 0;
        self.halted = false;
    }

    pub(crate) fn redirect(&mut self, target: CodeAddress) {
        if self.trace.fetch {
            debug!("Frontend: redirected to {}", target);
        }
        self.pc = target;
    }

    pub(crate) fn halt(&mut self) {
        self.halted = true;
    }

    /// True when nothing is left to fetch.
    pub(crate) fn is_done(&self) -> bool {
        match &self.program_option {
            Some(program) => self.halted || self.pc >= program.len(),
            None => true,
        }
    }

    pub(crate) fn do_cycle(&mut self, instr_queue: &mut InstrQueue, perf_counters: &mut PerfCounters) {
        let program = match &self.program_option {
            Some(program) => Rc::clone(program),
            None => return,
        };

        for _ in 0..self.n_wide {
            if self.halted || self.pc >= program.len() || instr_queue.is_full() {
                break;
            }

            let instr = program.get_instr(self.pc);
            let branch_target_predicted = self.predictor.predict(&instr);

            if self.trace.fetch {
                debug!("Frontend: fetched [{}] next={}", instr, branch_target_predicted);
            }

            let taken = branch_target_predicted != instr.fallthrough();
            instr_queue.enqueue(InstrQueueSlot { instr, branch_target_predicted });
            self.pc = branch_target_predicted;
            perf_counters.fetch_cnt += 1;

            // a fetch group ends at a taken control transfer
            if taken {
                break;
            }
        }
    }
}
