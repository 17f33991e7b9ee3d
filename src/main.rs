use anyhow::Context;
use clap::{Parser, ValueEnum};
use gb_core::{
    Emulator,
    loader::{CartridgeLoader, DEFAULT_ROM_DIR, DirectorySource},
};
use tracing::metadata::LevelFilter;
use tracing_subscriber::EnvFilter;

use std::{path::PathBuf, rc::Rc};

/// Output format of the log lines.
#[derive(Clone, Copy, Debug, Default, ValueEnum)]
enum LogFormat {
    /// Human readable, multi-line output.
    #[default]
    Pretty,
    /// One JSON object per line.
    Json,
}

/// Runs a Game Boy cartridge on the CPU core.
#[derive(Debug, Parser)]
struct Args {
    /// Specifies the logical name of the ROM that the emulator will run.
    #[arg(
        short,
        long,
        help = "Required. Specifies the name of the ROM to run, without extension."
    )]
    rom: String,
    /// Directory the ROM name is resolved in.
    #[arg(long, default_value = DEFAULT_ROM_DIR)]
    rom_dir: PathBuf,
    /// Stop after this many machine cycles instead of running until an error.
    #[arg(short, long)]
    ticks: Option<u64>,
    /// Log every executed instruction.
    #[arg(long)]
    trace: bool,
    /// Format of the log output.
    #[arg(long, value_enum, default_value_t)]
    log_format: LogFormat,
}

/// Installs the global tracing subscriber.
fn init_logging(format: LogFormat) {
    // Default to INFO logs but allow the RUST_LOG env variable to override.
    let filter = EnvFilter::builder()
        .with_default_directive(LevelFilter::INFO.into())
        .from_env_lossy();

    let builder = tracing_subscriber::fmt()
        .with_level(true)
        .with_target(true)
        .with_file(true)
        .with_line_number(true)
        .with_env_filter(filter);

    match format {
        LogFormat::Pretty => builder.pretty().init(),
        LogFormat::Json => builder.json().init(),
    }
}

/// Main entry point into the emulator application.
fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    init_logging(args.log_format);

    let mut loader = CartridgeLoader::new(DirectorySource::new(&args.rom_dir));
    loader
        .load(&args.rom)
        .with_context(|| format!("load ROM '{}' from {:?}", args.rom, args.rom_dir))?;

    let mut emulator = Emulator::load(Rc::new(loader));
    if args.trace {
        emulator
            .cpu_mut()
            .set_trace_hook(|instruction| tracing::info!("{}", instruction));
    }

    emulator.begin().context("begin execution")?;

    let result = emulator.run(args.ticks);

    if let Err(e) = &result {
        for instruction in emulator.cpu().history().take(10) {
            tracing::error!("history: {}", instruction);
        }
        tracing::error!("stopped after {} cycles: {}", emulator.ticks(), e);
    }

    let ticks = result.context("run emulator")?;
    tracing::info!("finished after {} cycles", ticks);

    Ok(())
}
