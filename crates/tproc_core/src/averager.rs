use crate::channels::{ChannelMap, RegisterAddr};
use crate::program::{Instruction, Program};
use crate::pulse::Sequencer;
use crate::sweep::{SweepDescriptor, SweepGenerator};
use crate::{AssemblyError, Result};
use serde::{Deserialize, Serialize};
use tproc_common::dmem::COUNTER_ADDR;
use tproc_common::isa::Operator;
use tracing::info;

/// Label of the repetition loop.
pub const REPS_LOOP: &str = "LOOP_J";

fn default_counter_addr() -> u32 {
    COUNTER_ADDR
}

fn default_shot_reg() -> RegisterAddr {
    RegisterAddr::new(0, 13)
}

fn default_reps_reg() -> RegisterAddr {
    RegisterAddr::new(0, 15)
}

/// Shape of an averaging program.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AveragerConfig {
    /// Repetitions of the body per sweep point.
    pub reps: u32,
    /// Data memory word the shot counter is published to.
    #[serde(default = "default_counter_addr")]
    pub counter_addr: u32,
    #[serde(default = "default_shot_reg")]
    pub shot_reg: RegisterAddr,
    #[serde(default = "default_reps_reg")]
    pub reps_reg: RegisterAddr,
    /// Optional outer parameter sweep.
    #[serde(default)]
    pub expts: Option<SweepDescriptor>,
}

impl AveragerConfig {
    pub fn new(reps: u32) -> Self {
        Self {
            reps,
            counter_addr: COUNTER_ADDR,
            shot_reg: default_shot_reg(),
            reps_reg: default_reps_reg(),
            expts: None,
        }
    }

    pub fn with_expts(mut self, expts: SweepDescriptor) -> Self {
        self.expts = Some(expts);
        self
    }

    /// Sweep points of the outer sweep, one list per swept register.
    pub fn expt_points(&self) -> Vec<Vec<u32>> {
        self.expts
            .as_ref()
            .map(|e| (0..e.registers.len()).map(|i| e.values(i)).collect())
            .unwrap_or_default()
    }

    /// Number of shots the program publishes before it ends.
    pub fn total_count(&self) -> u64 {
        let expts = self.expts.as_ref().map_or(1, |e| u64::from(e.count));
        u64::from(self.reps) * expts
    }
}

/// A built averaging program and what the host needs to read it out.
#[derive(Debug, Clone)]
pub struct AveragerProgram {
    pub program: Program,
    /// Final value of the published shot counter.
    pub total_count: u64,
    pub counter_addr: u32,
    pub expt_points: Vec<Vec<u32>>,
}

/// Builds the standard acquisition program.
///
/// The generated code runs `initialize` once, zeroes the shot counter, then
/// repeats `body` `reps` times (inside the optional `expts` sweep). After
/// every repetition the shot counter is incremented and written to data
/// memory with `memwi`, which is what the acquisition streamer polls.
///
/// # Arguments
///
/// * `config` - Repetition count, counter location and optional sweep
/// * `map` - Register map handed to the pulse sequencer
/// * `initialize` - Emits one-time setup code
/// * `body` - Emits the code of one repetition
pub fn build_averager<I, B>(
    config: &AveragerConfig,
    map: &ChannelMap,
    initialize: I,
    body: B,
) -> Result<AveragerProgram>
where
    I: FnOnce(&mut Sequencer<'_>) -> Result<()>,
    B: FnOnce(&mut Sequencer<'_>) -> Result<()>,
{
    let mut program = Program::new();
    initialize(&mut Sequencer::new(&mut program, map))?;

    let mut generator = SweepGenerator::new(&mut program);
    let shot = config.shot_reg;
    generator.reserve(shot, "shot counter")?;
    generator.program().append_with_comment(
        Instruction::Regwi {
            page: shot.page,
            reg: shot.reg,
            imm: 0,
        },
        "shot counter",
    );

    match &config.expts {
        Some(expts) => generator.sweep(expts, |g| reps_loop(g, config, map, body))?,
        None => reps_loop(&mut generator, config, map, body)?,
    }
    generator.program().end();

    info!(
        reps = config.reps,
        total_count = config.total_count(),
        instructions = program.len(),
        "built averaging program"
    );

    Ok(AveragerProgram {
        program,
        total_count: config.total_count(),
        counter_addr: config.counter_addr,
        expt_points: config.expt_points(),
    })
}

fn reps_loop<B>(
    generator: &mut SweepGenerator<'_>,
    config: &AveragerConfig,
    map: &ChannelMap,
    body: B,
) -> Result<()>
where
    B: FnOnce(&mut Sequencer<'_>) -> Result<()>,
{
    let reps = SweepDescriptor::new(REPS_LOOP, config.reps, config.reps_reg);
    let counter_addr = i64::from(config.counter_addr);
    generator.sweep(&reps, |g| {
        body(&mut Sequencer::new(g.program(), map))?;
        let RegisterAddr { page, reg } = config.shot_reg;
        let prog = g.program();
        prog.mathi(page, reg, reg, Operator::Add, 1);
        prog.memwi(page, reg, counter_addr);
        Ok(())
    })
}

impl AveragerProgram {
    /// Encoded program words.
    pub fn encode(&self) -> Result<Vec<u64>, AssemblyError> {
        self.program.encode()
    }
}
