mod bench;
mod generate;
mod stats;
mod stream;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::fs;
use std::path::{Path, PathBuf};
use tproc_io::loader::{self, Format};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "tproc", about = "tProc assembler and acquisition streamer")]
struct Cli {
    /// Log at debug level regardless of RUST_LOG
    #[arg(short, long, global = true)]
    verbose: bool,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Assemble a listing into program words
    Asm {
        input: PathBuf,
        /// Output file; .bin writes binary words, anything else hex
        #[arg(short, long)]
        output: Option<PathBuf>,
        /// Print binary words instead of hex
        #[arg(long)]
        bin: bool,
        /// Word listing to diff the result against
        #[arg(long)]
        compare: Option<PathBuf>,
    },
    /// Generate the swept acquisition program
    Gen {
        #[command(flatten)]
        args: generate::AcquisitionArgs,
        /// Output file; .asm writes the listing, .bin/.hex the words
        #[arg(short, long)]
        output: Option<PathBuf>,
        /// Run the program on the reference emulator
        #[arg(long)]
        emulate: bool,
    },
    /// Run a readout against the simulated board or a board agent
    Stream {
        #[command(flatten)]
        args: stream::StreamArgs,
    },
    /// Parallel assembly throughput
    Bench {
        #[command(flatten)]
        args: generate::AcquisitionArgs,
        #[arg(long, default_value_t = 1000)]
        programs: usize,
    },
}

fn init_tracing(verbose: bool) {
    let filter = if verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
}

fn run_asm(
    input: &Path,
    output: Option<&Path>,
    bin: bool,
    compare: Option<&Path>,
) -> Result<()> {
    let text = fs::read_to_string(input)
        .with_context(|| format!("Failed to read listing {}", input.display()))?;
    let program = tproc_io::parse_program(&text)?;
    let words = program.encode()?;

    match output {
        Some(path) => {
            loader::save_words(path, &words)?;
            println!("{} words written to {}", words.len(), path.display());
        }
        None => {
            let format = if bin { Format::Bin } else { Format::Hex };
            print!("{}", loader::format_words(&words, format));
        }
    }

    if let Some(path) = compare {
        let reference = loader::load_words(path)?;
        let diffs = loader::compare_programs(&words, &reference);
        if diffs.is_empty() {
            println!("Identical to {}", path.display());
        }
        for diff in &diffs {
            match (diff.left, diff.right) {
                (Some(l), Some(r)) => {
                    println!("word {:5}: {:#018x} != {:#018x} bits {:?}", diff.index, l, r, diff.bits)
                }
                (l, r) => println!("word {:5}: {:?} != {:?}", diff.index, l, r),
            }
        }
    }
    Ok(())
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    match cli.command {
        Commands::Asm {
            input,
            output,
            bin,
            compare,
        } => run_asm(&input, output.as_deref(), bin, compare.as_deref())?,
        Commands::Gen {
            args,
            output,
            emulate,
        } => generate::run_gen(&args, output.as_deref(), emulate)?,
        Commands::Stream { args } => stream::run_stream(&args)?,
        Commands::Bench { args, programs } => bench::run_bench(&args, programs)?,
    }
    Ok(())
}
