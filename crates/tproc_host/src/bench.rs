use crate::generate::AcquisitionArgs;
use anyhow::{Result, bail};
use rayon::prelude::*;
use std::time::Instant;
use tproc_io::{compare_programs, parse_program};

/// Assembles `programs` variants of the acquisition program in parallel,
/// each with a different repetition count, and checks that every listing
/// reassembles to the same words.
pub fn run_bench(args: &AcquisitionArgs, programs: usize) -> Result<()> {
    println!("Starting Benchmark (Parallel - Rayon)...");
    let start_bench = Instant::now();

    let results: Vec<Result<(usize, bool)>> = (0..programs)
        .into_par_iter()
        .map(|i| {
            let variant = AcquisitionArgs {
                reps: args.reps + i as u32,
                ..args.clone()
            };
            let built = variant.build()?;
            let words = built.encode()?;
            let reparsed = parse_program(&built.program.asm())?.encode()?;
            Ok((words.len(), compare_programs(&words, &reparsed).is_empty()))
        })
        .collect();

    let mut words = 0usize;
    let mut mismatched = 0usize;
    for result in results {
        let (len, identical) = result?;
        words += len;
        if !identical {
            mismatched += 1;
        }
    }

    let seconds = start_bench.elapsed().as_secs_f64().max(f64::EPSILON);
    println!("Results");
    println!("Time:       {:.4} s", seconds);
    println!("Programs:   {}", programs);
    println!("Words:      {}", words);
    println!("Throughput: {:.0} programs/s", programs as f64 / seconds);
    println!("Throughput: {:.0} words/s", words as f64 / seconds);

    if mismatched > 0 {
        bail!("{mismatched} listings did not reassemble to the same words");
    }
    Ok(())
}
