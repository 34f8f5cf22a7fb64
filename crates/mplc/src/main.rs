use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

use midicapl::{compile, CompilerOptions};

#[derive(Parser, Debug)]
#[command(name = "mplc")]
#[command(about = "Compile MidicaPL sources to Standard MIDI Files")]
#[command(version)]
struct Cli {
    /// Source file to compile
    input: PathBuf,

    /// Output file (defaults to the input path with a .mid extension)
    #[arg(short, long)]
    output: Option<PathBuf>,

    /// Ticks per quarter note
    #[arg(long, default_value = "480")]
    resolution: u32,

    /// Transpose every non-percussion note by this many semitones
    #[arg(long, default_value = "0", allow_hyphen_values = true)]
    transpose: i8,

    /// Print per-channel tick totals and song metadata after compiling
    #[arg(long)]
    summary: bool,
}

fn main() -> ExitCode {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    match run(&cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("{e:#}");
            ExitCode::FAILURE
        }
    }
}

fn run(cli: &Cli) -> Result<()> {
    let options = CompilerOptions {
        resolution: cli.resolution,
        transpose: cli.transpose,
    };

    // CompileError renders its own location and call stack; keep it intact
    // instead of wrapping it in an outer context.
    let seq = compile(&cli.input, options).map_err(anyhow::Error::new)?;

    let output = cli
        .output
        .clone()
        .unwrap_or_else(|| cli.input.with_extension("mid"));
    let bytes = seq.to_midi_bytes();
    std::fs::write(&output, &bytes)
        .with_context(|| format!("cannot write {}", output.display()))?;
    info!(output = %output.display(), bytes = bytes.len(), "wrote MIDI file");

    if cli.summary {
        if let Some(title) = &seq.meta.title {
            println!("title: {title}");
        }
        if let Some(composer) = &seq.meta.composer {
            println!("composer: {composer}");
        }
        for (channel, tick) in &seq.channel_ticks {
            println!("channel {channel}: {tick} ticks");
        }
    }
    println!("{}", output.display());
    Ok(())
}
