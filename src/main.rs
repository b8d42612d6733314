use std::fs;
use std::path::PathBuf;
use std::process::exit;
use std::rc::Rc;

use log::{error, info};
use structopt::StructOpt;

use crate::cpu::{load_cpu_config, CPUConfig, CPU};
use crate::emulator::Emulator;
use crate::error::LoadError;
use crate::loader::loader::load;
use crate::report::Report;

mod backend;
mod cpu;
mod emulator;
mod error;
mod frontend;
mod instructions;
mod loader;
mod memory_subsystem;
mod report;

#[derive(StructOpt, Debug)]
#[structopt(name = "ooo470", about = "Cycle-level simulator of a superscalar out-of-order core")]
struct Opt {
    /// Path of the input document (JSON)
    #[structopt(parse(from_os_str))]
    input: PathBuf,

    /// Path the final state is written to (JSON)
    #[structopt(parse(from_os_str))]
    output: PathBuf,

    /// CPU config (YAML) used when the input has no config section
    #[structopt(short, long, parse(from_os_str))]
    config: Option<PathBuf>,

    /// Include the retirement cycle of every instruction in the output
    #[structopt(long)]
    retirements: bool,

    /// Include a snapshot of the pipeline after every cycle in the output
    #[structopt(long)]
    cycle_log: bool,

    /// Compare the final state with the in-order reference model
    #[structopt(long)]
    check: bool,
}

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let opt = Opt::from_args();
    exit(run(&opt));
}

fn run(opt: &Opt) -> i32 {
    let fallback_config = match &opt.config {
        Some(path) => {
            let path = path.to_string_lossy();
            match load_cpu_config(&path) {
                Ok(cpu_config) => cpu_config,
                Err(err) => {
                    error!("Failed to load config {}. Cause: {}", path, err);
                    return err.exit_code();
                }
            }
        }
        None => CPUConfig::default(),
    };

    let input = opt.input.to_string_lossy();
    let (cpu_config, program) = match load(&input, fallback_config) {
        Ok((cpu_config, program)) => (cpu_config, Rc::new(program)),
        Err(err) => {
            error!("Loading '{}' failed.", input);
            match &err {
                LoadError::AnalysisError(msgs) => {
                    for msg in msgs {
                        error!("{}", msg);
                    }
                }
                _ => error!("{}", err),
            }
            return err.exit_code();
        }
    };

    let mut cpu = CPU::new(&cpu_config);
    if opt.cycle_log {
        cpu.record_cycles();
    }

    if let Err(err) = cpu.run(&program) {
        error!("{}", err);
        return err.exit_code();
    }

    if opt.check {
        let mut emulator = Emulator::new(&program);
        let max_steps = cpu_config.max_cycles.saturating_mul(cpu_config.retire_n_wide as u64);
        if let Err(err) = emulator.run(&program, max_steps).and_then(|_| emulator.verify(&cpu)) {
            error!("{}", err);
            return err.exit_code();
        }
        info!("Final state matches the reference model");
    }

    let json = match Report::new(&cpu, opt.retirements).to_json() {
        Ok(json) => json,
        Err(err) => {
            error!("Failed to serialize the report: {}", err);
            return 1;
        }
    };

    let output = opt.output.to_string_lossy();
    if let Err(err) = fs::write(opt.output.as_path(), json) {
        error!("Failed to write '{}': {}", output, err);
        return 1;
    }

    info!("Wrote {}", output);
    0
}
