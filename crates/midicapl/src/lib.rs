//! A compiler for MidicaPL, a line-oriented music description language,
//! producing tick-indexed MIDI event sequences and Standard MIDI Files.
//!
//! The compiler makes seven ordered passes over the source (keyword
//! redefinitions, constants, chords and metadata, callable names, callable
//! bodies, condition pre-check, emission) so that chords, functions and
//! patterns may be used before their definition appears. Output goes
//! through the [`EventSink`] trait; [`SequenceRecorder`] is the standard
//! in-memory implementation with an SMF encoder.
//!
//! ```
//! use midicapl::{compile_source, CompilerOptions};
//!
//! let src = "INSTRUMENTS\n0 0 piano\nEND\n0 c /4\n0 d /4\n";
//! let seq = compile_source("example.mpl", src, CompilerOptions::default()).unwrap();
//! assert_eq!(seq.channel_tick(0), Some(960));
//! ```

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

pub mod block;
pub mod channel;
pub mod cond;
pub mod defs;
pub mod duration;
pub mod error;
mod exec;
pub mod keywords;
pub mod line;
pub mod note;
pub mod options;
pub mod parser;
pub mod sink;
pub mod subst;

pub use error::{CompileError, ErrorKind, Result, StackTraceElement};
pub use parser::{CompileSummary, CompilerOptions, MetaInfo};
pub use sink::{Event, EventSink, SequenceRecorder, TextKind, TimedEvent};

use parser::CompileContext;

/// A finished compilation: the recorded event log plus summary data.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompiledSequence {
    pub recorder: SequenceRecorder,
    /// Final tick cursor per used channel, ordered by channel.
    pub channel_ticks: Vec<(u8, u64)>,
    pub meta: MetaInfo,
    pub soundbank: Option<PathBuf>,
}

impl CompiledSequence {
    /// Encode as a Standard MIDI File (format 1).
    pub fn to_midi_bytes(&self) -> Vec<u8> {
        self.recorder.to_midi_bytes()
    }

    /// The final tick cursor of a channel, if it was used.
    pub fn channel_tick(&self, channel: u8) -> Option<u64> {
        self.channel_ticks
            .iter()
            .find(|(ch, _)| *ch == channel)
            .map(|(_, tick)| *tick)
    }
}

/// Compile a source file from disk, following INCLUDEs relative to it.
pub fn compile(root: &Path, options: CompilerOptions) -> Result<CompiledSequence> {
    let mut recorder = SequenceRecorder::new(options.resolution);
    let summary = {
        let mut ctx = CompileContext::new(options, &mut recorder);
        ctx.run(root)?;
        ctx.into_summary()
    };
    Ok(CompiledSequence {
        recorder,
        channel_ticks: summary.channel_ticks,
        meta: summary.meta,
        soundbank: summary.soundbank,
    })
}

/// Compile source text held in memory. `name` stands in for the file path
/// in diagnostics; INCLUDEs resolve relative to it.
pub fn compile_source(
    name: impl Into<PathBuf>,
    text: &str,
    options: CompilerOptions,
) -> Result<CompiledSequence> {
    let name = name.into();
    let mut recorder = SequenceRecorder::new(options.resolution);
    let summary = {
        let mut ctx = CompileContext::new(options, &mut recorder);
        ctx.preload(line::SourceFile::from_text(name.clone(), text));
        ctx.run(&name)?;
        ctx.into_summary()
    };
    Ok(CompiledSequence {
        recorder,
        channel_ticks: summary.channel_ticks,
        meta: summary.meta,
        soundbank: summary.soundbank,
    })
}

/// Compile into a caller-supplied sink instead of the standard recorder.
pub fn compile_with_sink(
    root: &Path,
    options: CompilerOptions,
    sink: &mut dyn EventSink,
) -> Result<CompileSummary> {
    let mut ctx = CompileContext::new(options, sink);
    ctx.run(root)?;
    Ok(ctx.into_summary())
}
