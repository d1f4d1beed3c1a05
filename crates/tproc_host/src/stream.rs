use crate::generate::AcquisitionArgs;
use crate::stats::ChunkTimings;
use anyhow::{Context, Result, bail};
use clap::Args;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use tproc_core::averager::AveragerProgram;
use tproc_hw::Soc;
use tproc_hw::bridge::BridgeSoc;
use tproc_hw::sim::{DEFAULT_CAPACITY, SimulatedSoc};
use tproc_hw::streamer::{DataStreamer, StreamConfig};
use tracing::debug;

#[derive(Args, Debug, Clone)]
pub struct StreamArgs {
    #[command(flatten)]
    pub acquisition: AcquisitionArgs,
    /// Board agent address; the built-in simulation when omitted
    #[arg(long)]
    pub bridge: Option<String>,
    /// Accumulation buffer depth of the simulated board
    #[arg(long, default_value_t = DEFAULT_CAPACITY)]
    pub capacity: usize,
    /// Shots the simulated board completes per counter poll
    #[arg(long, default_value_t = 8)]
    pub increment: u32,
    /// Unread samples that trigger a transfer; a tenth of the buffer when omitted
    #[arg(long)]
    pub stride: Option<usize>,
    #[arg(long, default_value_t = 1000)]
    pub poll_us: u64,
    #[arg(long, default_value_t = 1000)]
    pub timeout_ms: u64,
    /// Readout channels to drain
    #[arg(long, value_delimiter = ',', default_value = "0")]
    pub readouts: Vec<usize>,
}

/// Running I/Q sums per readout channel and sweep point.
struct Averages {
    reps: u64,
    sums: Vec<Vec<(i64, i64)>>,
    shots: u64,
}

impl Averages {
    fn new(channels: usize, points: usize, reps: u64) -> Self {
        Self {
            reps: reps.max(1),
            sums: vec![vec![(0, 0); points.max(1)]; channels],
            shots: 0,
        }
    }

    fn add(&mut self, channel: usize, shot: u64, i: i32, q: i32) {
        let point = ((shot / self.reps) as usize).min(self.sums[channel].len() - 1);
        let (si, sq) = &mut self.sums[channel][point];
        *si += i64::from(i);
        *sq += i64::from(q);
    }
}

pub fn run_stream(args: &StreamArgs) -> Result<()> {
    let built = args.acquisition.build()?;
    if args.readouts.is_empty() {
        bail!("no readout channel selected");
    }

    match &args.bridge {
        Some(addr) => {
            println!("Connecting to board agent at {}...", addr);
            let soc = BridgeSoc::connect(addr.as_str())
                .with_context(|| format!("Failed to connect to {addr}"))?;
            drive(Arc::new(soc), args, &built)
        }
        None => {
            let channels = args.readouts.iter().max().map_or(1, |m| m + 1);
            let limit = u32::try_from(built.total_count).context("shot count exceeds counter width")?;
            debug!(capacity = args.capacity, channels, limit, "using simulated board");
            let soc = SimulatedSoc::new(args.capacity, channels)
                .with_increment(args.increment)
                .with_limit(limit)
                .with_counter_addr(built.counter_addr);
            drive(Arc::new(soc), args, &built)
        }
    }
}

fn drive<S: Soc + 'static>(soc: Arc<S>, args: &StreamArgs, built: &AveragerProgram) -> Result<()> {
    let words = built.encode()?;
    soc.load_program(&words)?;

    let config = StreamConfig {
        stride: args.stride,
        poll_interval: Duration::from_micros(args.poll_us),
        transfer_timeout: Duration::from_millis(args.timeout_ms),
        reads_per_count: 1,
    };
    let capacity = soc.buffer_capacity();
    println!("ACQUISITION STREAMING");
    println!("Program:  {} words", words.len());
    println!("Shots:    {}", built.total_count);
    println!("Buffer:   {} samples, stride {}", capacity, config.stride_for(capacity));
    println!("Readouts: {:?}", args.readouts);
    println!("-------------------------------");

    let points = built.expt_points.first().map_or(1, Vec::len);
    let mut averages = Averages::new(args.readouts.len(), points, u64::from(args.acquisition.reps));
    let mut timings = ChunkTimings::new();

    let mut streamer = DataStreamer::new(Arc::clone(&soc), config);
    let started = Instant::now();
    streamer.start_readout(built.total_count, built.counter_addr, &args.readouts)?;

    loop {
        let finished = streamer.readout_done();
        let chunks = streamer.poll_data()?;
        for chunk in &chunks {
            timings.update(chunk.stats.elapsed, chunk.len());
            for (channel, data) in chunk.data.iter().enumerate() {
                for (k, (i, q)) in data.i.iter().zip(&data.q).enumerate() {
                    averages.add(channel, averages.shots + k as u64, *i, *q);
                }
            }
            averages.shots += chunk.len() as u64;
        }
        if finished && chunks.is_empty() {
            break;
        }
        thread::sleep(Duration::from_millis(5));
    }
    soc.stop()?;

    let elapsed = started.elapsed();
    println!("Results");
    println!("Time:       {:.4} s", elapsed.as_secs_f64());
    println!("Shots:      {} / {}", averages.shots, built.total_count);
    println!(
        "Throughput: {:.0} shots/s",
        averages.shots as f64 / elapsed.as_secs_f64().max(f64::EPSILON)
    );
    timings.print_report();

    let gains = built.expt_points.first();
    for (channel, sums) in args.readouts.iter().zip(&averages.sums) {
        println!("\nReadout {channel}");
        for (point, (si, sq)) in sums.iter().enumerate() {
            let reps = averages.reps as f64;
            let label = gains
                .and_then(|g| g.get(point))
                .map_or_else(|| format!("{point}"), |g| format!("gain {g}"));
            println!("{label:>12}: I = {:>14.2}  Q = {:>14.2}", *si as f64 / reps, *sq as f64 / reps);
        }
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
        args: StreamArgs,
    }

    #[test]
    fn simulated_run_drains_every_shot() {
        let harness = Harness::parse_from([
            "stream", "--reps", "50", "--expts", "4", "--capacity", "64", "--increment", "3",
            "--poll-us", "0", "--readouts", "0,1",
        ]);
        run_stream(&harness.args).unwrap();
    }

    #[test]
    fn averages_bin_shots_by_sweep_point() {
        let mut averages = Averages::new(1, 2, 3);
        for shot in 0..6 {
            averages.add(0, shot, shot as i32, -1);
        }
        assert_eq!(averages.sums[0], vec![(3, -3), (12, -3)]);
    }
}
