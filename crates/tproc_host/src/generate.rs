//! Builds the standard swept acquisition program from command-line options.

use anyhow::{Context, Result};
use clap::Args;
use std::fs;
use std::path::{Path, PathBuf};
use tproc_core::averager::{AveragerConfig, AveragerProgram, build_averager};
use tproc_core::channels::{ChannelMap, RegisterAddr, RegisterMapConfig, SpecialRegister};
use tproc_core::pulse::{PulseDescriptor, Start, TRIGGER_TAIL};
use tproc_core::sweep::{SweepDescriptor, SweptRegister};
use tproc_core::vm::{Emulator, Event};
use tproc_io::loader;
use tracing::debug;

/// Shape of a gain-swept readout experiment.
#[derive(Args, Debug, Clone)]
pub struct AcquisitionArgs {
    /// Repetitions per sweep point
    #[arg(long, default_value_t = 100)]
    pub reps: u32,
    /// Gain sweep points; 1 disables the sweep
    #[arg(long, default_value_t = 1)]
    pub expts: u32,
    /// Generator channel of the readout pulse
    #[arg(long, default_value_t = 7)]
    pub ch: u8,
    /// Frequency register value of the readout pulse
    #[arg(long, default_value_t = 100_000)]
    pub freq: i64,
    #[arg(long, default_value_t = 1000)]
    pub gain_start: i64,
    #[arg(long, default_value_t = 500)]
    pub gain_step: i64,
    /// Pulse length in fabric cycles
    #[arg(long, default_value_t = 400)]
    pub length: u32,
    /// Trigger offset from pulse start
    #[arg(long, default_value_t = 200)]
    pub adc_offset: i64,
    /// Relaxation delay after each shot
    #[arg(long, default_value_t = 1000)]
    pub relax: i64,
    /// Readout triggers to raise
    #[arg(long, value_delimiter = ',', default_value = "0")]
    pub adcs: Vec<u8>,
    /// Register map JSON; the built-in QICK layout when omitted
    #[arg(long)]
    pub map: Option<PathBuf>,
}

impl AcquisitionArgs {
    pub fn channel_map(&self) -> Result<ChannelMap> {
        let config = match &self.map {
            Some(path) => {
                let text = fs::read_to_string(path)
                    .with_context(|| format!("Failed to read register map {}", path.display()))?;
                RegisterMapConfig::from_json(&text)?
            }
            None => RegisterMapConfig::qsystem2(),
        };
        Ok(ChannelMap::new(config)?)
    }

    pub fn build(&self) -> Result<AveragerProgram> {
        let map = self.channel_map()?;
        let pulse = PulseDescriptor::constant(self.ch, "readout", self.freq, self.gain_start, self.length);

        let mut config = AveragerConfig::new(self.reps);
        if self.expts > 1 {
            let gain = map.special_register(self.ch, SpecialRegister::Gain)?;
            let counter = RegisterAddr::new(map.page(self.ch)?, 14);
            let sweep = SweptRegister::new(gain, self.gain_start, self.gain_step)
                .with_width(map.width(SpecialRegister::Gain));
            config = config.with_expts(SweepDescriptor::new("LOOP_I", self.expts, counter).sweep(sweep));
        }

        // The gain register is swept, so the body only plays the pulse
        // configured once up front.
        let built = build_averager(
            &config,
            &map,
            |seq| seq.setup(&pulse),
            |seq| {
                let t = seq.timestamp(pulse.channel);
                seq.trigger(&self.adcs, &[], t + self.adc_offset, pulse.duration() + TRIGGER_TAIL)?;
                seq.play(&pulse, Start::At(t))?;
                seq.sync_all(self.relax);
                Ok(())
            },
        )?;
        Ok(built)
    }
}

pub fn run_gen(args: &AcquisitionArgs, output: Option<&Path>, emulate: bool) -> Result<()> {
    let built = args.build()?;
    println!(
        "Built {} instructions, {} shots published to dmem[{}]",
        built.program.len(),
        built.total_count,
        built.counter_addr
    );
    for (i, points) in built.expt_points.iter().enumerate() {
        println!("Sweep register {i}: {points:?}");
    }

    match output {
        Some(path) if path.extension().is_some_and(|e| e == "asm") => {
            fs::write(path, built.program.asm())
                .with_context(|| format!("Failed to write {}", path.display()))?;
            println!("Listing written to {}", path.display());
        }
        Some(path) => {
            loader::save_words(path, &built.encode()?)?;
            println!("Program written to {}", path.display());
        }
        None => print!("{}", built.program),
    }

    if emulate {
        let mut vm = Emulator::new(built.encode()?);
        vm.run()?;
        debug!(steps = vm.steps(), events = vm.events().len(), "emulation finished");
        let pulses = vm
            .events()
            .iter()
            .filter(|e| matches!(e, Event::Set { ch, .. } if *ch == args.ch))
            .count();
        println!("Emulation");
        println!("Steps:     {}", vm.steps());
        println!("Pulses:    {}", pulses);
        println!(
            "Counter:   {}",
            vm.dmem(built.counter_addr as usize).unwrap_or_default()
        );
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;

    #[derive(Parser)]
    struct Harness {
        #[command(flatten)]
        args: AcquisitionArgs,
    }

    fn args(cli: &[&str]) -> AcquisitionArgs {
        Harness::parse_from(std::iter::once("generate").chain(cli.iter().copied())).args
    }

    #[test]
    fn swept_program_publishes_every_shot() {
        let args = args(&["--reps", "4", "--expts", "3"]);
        let built = args.build().unwrap();
        assert_eq!(built.total_count, 12);
        assert_eq!(built.expt_points, vec![vec![1000, 1500, 2000]]);

        let mut vm = Emulator::new(built.encode().unwrap());
        vm.run().unwrap();
        assert_eq!(vm.dmem(built.counter_addr as usize), Some(12));
        let gains: Vec<u32> = vm
            .events()
            .iter()
            .filter(|e| matches!(e, Event::Set { ch: 7, .. }))
            .filter_map(|e| match e {
                Event::Set { gain, .. } => Some(*gain),
                _ => None,
            })
            .collect();
        assert_eq!(gains.len(), 12);
        assert_eq!(gains[0], 1000);
        assert_eq!(gains[11], 2000);
    }

    #[test]
    fn unknown_channel_is_reported() {
        let args = args(&["--ch", "9"]);
        assert!(args.build().is_err());
    }
}
