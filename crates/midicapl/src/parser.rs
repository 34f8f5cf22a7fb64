//! Multi-pass compiler driver.
//!
//! The compiler makes exactly seven ordered passes over the root file, each
//! one a full traversal that follows INCLUDE statements recursively:
//!
//! 1. keyword redefinitions (DEFINE)
//! 2. constants (CONST)
//! 3. chords, the first INSTRUMENTS block, META, nesting validation
//! 4. function/pattern name discovery (makes forward calls legal)
//! 5. function/pattern bodies
//! 6. condition syntax pre-check
//! 7. emission - the only pass that mutates channel state or emits events
//!
//! Every pass decides per line whether to ignore it, track nesting only, or
//! fully parse it, based on the current mode and the pass identity. That
//! policy lives in [`line_action`] and is covered by a table-driven test.

use std::collections::{HashMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::channel::ChannelState;
use crate::defs::{define_once, Definition};
use crate::error::{CompileError, Result, StackTraceElement};
use crate::exec;
use crate::keywords::{CommandKind, KeywordTable};
use crate::line::{SourceFile, SourceLine};
use crate::note;
use crate::options;
use crate::sink::{EventSink, TextKind};
use crate::subst::{self, ParamFrame};

/// The seven compiler passes, in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Pass {
    Definitions,
    Constants,
    ChordsAndMeta,
    FunctionNames,
    Bodies,
    ConditionCheck,
    Emission,
}

impl Pass {
    pub const ALL: [Pass; 7] = [
        Pass::Definitions,
        Pass::Constants,
        Pass::ChordsAndMeta,
        Pass::FunctionNames,
        Pass::Bodies,
        Pass::ConditionCheck,
        Pass::Emission,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Pass::Definitions => "definitions",
            Pass::Constants => "constants",
            Pass::ChordsAndMeta => "chords+meta",
            Pass::FunctionNames => "function names",
            Pass::Bodies => "bodies",
            Pass::ConditionCheck => "condition check",
            Pass::Emission => "emission",
        }
    }
}

/// Parser mode: which multi-line construct the traversal is inside.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Default,
    Instruments,
    Meta,
    Function,
    Pattern,
}

/// Coarse classification of a line by its first column.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LineClass {
    Command(CommandKind),
    /// Selector is a channel number (or `p` for percussion).
    Channel,
    /// Anything else: mode content, or an unknown command.
    Other,
}

/// What a pass does with one line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LineAction {
    Ignore,
    TrackNesting,
    Parse,
}

pub(crate) fn classify(keywords: &KeywordTable, line: &SourceLine) -> LineClass {
    let Some(selector) = line.selector() else {
        return LineClass::Other;
    };
    if let Some(kind) = keywords.lookup(selector) {
        return LineClass::Command(kind);
    }
    if selector.eq_ignore_ascii_case("p") || selector.chars().all(|c| c.is_ascii_digit()) {
        return LineClass::Channel;
    }
    LineClass::Other
}

/// The central pass-gating policy: what each pass does with a line, given
/// the current mode and the line's classification.
pub fn line_action(pass: Pass, mode: Mode, class: LineClass) -> LineAction {
    use CommandKind::*;
    use LineAction::*;

    match mode {
        Mode::Default => match class {
            LineClass::Command(kind) => match (pass, kind) {
                // Includes are followed in every pass.
                (_, Include) => Parse,
                (Pass::Definitions, Define) => Parse,
                (Pass::Constants, Const) => Parse,
                (Pass::ChordsAndMeta, Chord | Soundbank) => Parse,
                // Pass 3 validates nesting, so braces and mode commands
                // are fully parsed there.
                (
                    Pass::ChordsAndMeta,
                    Instruments | Meta | Function | Pattern | End | BlockOpen | BlockClose,
                ) => Parse,
                (Pass::FunctionNames, Function | Pattern) => Parse,
                (Pass::Bodies, Function | Pattern | End) => Parse,
                (Pass::ConditionCheck, Call | BlockOpen | BlockClose) => Parse,
                (Pass::Emission, Instruments) => Parse,
                (Pass::Emission, Var | Call | Global | BlockOpen | BlockClose) => Parse,
                (Pass::Emission, Meta | Function | Pattern | End) => TrackNesting,
                (_, Instruments | Meta | Function | Pattern | End) => TrackNesting,
                _ => Ignore,
            },
            LineClass::Channel => match pass {
                Pass::ConditionCheck | Pass::Emission => Parse,
                _ => Ignore,
            },
            // Unknown selectors only become an error in the emission pass.
            LineClass::Other => match pass {
                Pass::Emission => Parse,
                _ => Ignore,
            },
        },
        Mode::Instruments | Mode::Meta => match class {
            LineClass::Command(End) => match pass {
                Pass::ChordsAndMeta => Parse,
                _ => TrackNesting,
            },
            LineClass::Command(Instruments | Meta | Function | Pattern) => match pass {
                Pass::ChordsAndMeta => Parse,
                _ => TrackNesting,
            },
            _ => match (pass, mode) {
                (Pass::ChordsAndMeta, _) => Parse,
                (Pass::Emission, Mode::Instruments) => Parse,
                _ => Ignore,
            },
        },
        Mode::Function | Mode::Pattern => match class {
            LineClass::Command(End) => match pass {
                Pass::ChordsAndMeta | Pass::Bodies => Parse,
                _ => TrackNesting,
            },
            LineClass::Command(Instruments | Meta | Function | Pattern) => match pass {
                Pass::ChordsAndMeta => Parse,
                _ => TrackNesting,
            },
            _ => match pass {
                Pass::Bodies | Pass::ConditionCheck => Parse,
                _ => Ignore,
            },
        },
    }
}

/// Song metadata collected from the META block.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MetaInfo {
    pub title: Option<String>,
    pub composer: Option<String>,
    pub copyright: Option<String>,
    pub lyricist: Option<String>,
}

/// Knobs the caller can turn before compiling.
#[derive(Debug, Clone, Copy)]
pub struct CompilerOptions {
    /// Ticks per quarter note.
    pub resolution: u32,
    /// Semitone transposition, applied to every note except percussion.
    pub transpose: i8,
}

impl Default for CompilerOptions {
    fn default() -> Self {
        CompilerOptions {
            resolution: 480,
            transpose: 0,
        }
    }
}

/// Everything the compile produced besides the event log itself.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompileSummary {
    /// Final tick cursor per used channel, ordered by channel.
    pub channel_ticks: Vec<(u8, u64)>,
    pub meta: MetaInfo,
    pub soundbank: Option<PathBuf>,
}

/// All compiler state, threaded explicitly through every pass and handler.
pub(crate) struct CompileContext<'s> {
    pub options: CompilerOptions,
    pub keywords: KeywordTable,
    pub constants: HashMap<String, String>,
    pub variables: HashMap<String, String>,
    pub chords: HashMap<String, Vec<u8>>,
    pub functions: HashMap<String, Definition>,
    pub patterns: HashMap<String, Definition>,
    pub function_names: HashSet<String>,
    pub pattern_names: HashSet<String>,
    pub channels: HashMap<u8, ChannelState>,
    pub channel_comments: HashMap<u8, String>,
    pub meta: MetaInfo,
    pub soundbank: Option<PathBuf>,
    /// Parameter frames of the currently executing calls, innermost last.
    pub param_stack: Vec<ParamFrame>,
    /// Names of the currently executing functions, innermost last.
    pub function_stack: Vec<String>,
    pub pattern_depth: usize,
    /// Tick of the last full GLOBAL resync; channels created later start here.
    pub last_sync_tick: u64,
    pub instruments_parsed: bool,
    first_instruments_active: bool,
    instrument_blocks_seen: usize,
    files: HashMap<PathBuf, Arc<SourceFile>>,
    include_stack: Vec<PathBuf>,
    pub sink: &'s mut dyn EventSink,
}

impl<'s> CompileContext<'s> {
    pub fn new(options: CompilerOptions, sink: &'s mut dyn EventSink) -> Self {
        CompileContext {
            options,
            keywords: KeywordTable::default(),
            constants: HashMap::new(),
            variables: HashMap::new(),
            chords: HashMap::new(),
            functions: HashMap::new(),
            patterns: HashMap::new(),
            function_names: HashSet::new(),
            pattern_names: HashSet::new(),
            channels: HashMap::new(),
            channel_comments: HashMap::new(),
            meta: MetaInfo::default(),
            soundbank: None,
            param_stack: Vec::new(),
            function_stack: Vec::new(),
            pattern_depth: 0,
            last_sync_tick: 0,
            instruments_parsed: false,
            first_instruments_active: false,
            instrument_blocks_seen: 0,
            files: HashMap::new(),
            include_stack: Vec::new(),
            sink,
        }
    }

    /// Register an in-memory source so [`run`](Self::run) can start from it.
    pub fn preload(&mut self, file: Arc<SourceFile>) {
        self.files.insert(file.path.clone(), file);
    }

    pub fn run(&mut self, root: &Path) -> Result<()> {
        // The SMF division word holds ticks per quarter in 15 bits.
        if self.options.resolution == 0 || self.options.resolution > 0x7fff {
            return Err(CompileError::midi(format!(
                "resolution out of range 1-32767: {}",
                self.options.resolution
            )));
        }
        self.sink.reset(self.options.resolution);
        for pass in Pass::ALL {
            debug!(pass = pass.name(), "running compiler pass");
            if pass == Pass::Emission {
                self.emit_initial();
            }
            run_pass(self, pass, root)?;
        }
        Ok(())
    }

    pub fn into_summary(self) -> CompileSummary {
        let mut channel_ticks: Vec<(u8, u64)> = self
            .channels
            .iter()
            .map(|(channel, state)| (*channel, state.current_tick))
            .collect();
        channel_ticks.sort_unstable_by_key(|(channel, _)| *channel);
        CompileSummary {
            channel_ticks,
            meta: self.meta,
            soundbank: self.soundbank,
        }
    }

    pub fn frame(&self) -> Option<&ParamFrame> {
        self.param_stack.last()
    }

    /// Split borrow used by note emission: channel state and sink at once.
    pub fn channel_and_sink(&mut self, channel: u8) -> (&mut ChannelState, &mut dyn EventSink) {
        let state = self
            .channels
            .entry(channel)
            .or_insert_with(|| ChannelState::auto(channel));
        (state, &mut *self.sink)
    }

    fn load(&mut self, path: &Path) -> Result<Arc<SourceFile>> {
        if let Some(file) = self.files.get(path) {
            return Ok(file.clone());
        }
        let text = fs::read_to_string(path)
            .map_err(|e| CompileError::io(format!("cannot read {}: {e}", path.display())))?;
        let file = SourceFile::from_text(path, &text);
        self.files.insert(path.to_path_buf(), file.clone());
        Ok(file)
    }

    /// Resolve constants in a line, re-tokenizing when anything changed.
    fn const_resolved(&self, line: &SourceLine) -> Result<SourceLine> {
        let text = subst::resolve_constants(&line.raw, &self.constants)?;
        if text == line.raw {
            Ok(line.clone())
        } else {
            Ok(line.retokenized(&text))
        }
    }

    /// Emit the events that precede any note: meta texts and the channel
    /// initializations collected from the first INSTRUMENTS block.
    fn emit_initial(&mut self) {
        if let Some(title) = &self.meta.title {
            self.sink.add_text(TextKind::TrackName, title, 0);
        }
        if let Some(copyright) = &self.meta.copyright {
            self.sink.add_text(TextKind::Copyright, copyright, 0);
        }
        if let Some(composer) = &self.meta.composer {
            let text = format!("composer: {composer}");
            self.sink.add_text(TextKind::Text, &text, 0);
        }
        if let Some(lyricist) = &self.meta.lyricist {
            let text = format!("lyricist: {lyricist}");
            self.sink.add_text(TextKind::Text, &text, 0);
        }

        let mut channels: Vec<u8> = self.channels.keys().copied().collect();
        channels.sort_unstable();
        for channel in channels {
            let (program, bank_msb, bank_lsb) = {
                let state = &self.channels[&channel];
                (state.program, state.bank_msb, state.bank_lsb)
            };
            let comment = self
                .channel_comments
                .get(&channel)
                .cloned()
                .unwrap_or_default();
            if bank_msb != 0 {
                self.sink.set_bank(channel, 0, bank_msb, false);
            }
            if bank_lsb != 0 {
                self.sink.set_bank(channel, 0, bank_lsb, true);
            }
            self.sink.init_channel(channel, program, &comment, 0);
        }
    }
}

struct PendingDef {
    kind: CommandKind,
    def: Definition,
}

fn run_pass(ctx: &mut CompileContext, pass: Pass, path: &Path) -> Result<()> {
    let file = ctx.load(path)?;
    if ctx.include_stack.contains(&file.path) {
        return Err(CompileError::semantic(format!(
            "circular include of {}",
            file.path.display()
        )));
    }
    ctx.include_stack.push(file.path.clone());
    let result = run_file(ctx, pass, &file);
    ctx.include_stack.pop();
    result
}

fn run_file(ctx: &mut CompileContext, pass: Pass, file: &Arc<SourceFile>) -> Result<()> {
    let mut mode = Mode::Default;
    let mut brace_depth = 0usize;
    let mut pending: Option<PendingDef> = None;
    let mut exec_state = exec::ExecState::new();

    for raw in &file.lines {
        step(
            ctx,
            pass,
            file,
            raw,
            &mut mode,
            &mut brace_depth,
            &mut pending,
            &mut exec_state,
        )
        .map_err(|e| e.with_location_if_unset(&file.path, raw.number, Some(&raw.raw)))?;
    }

    if pass == Pass::ChordsAndMeta {
        if mode != Mode::Default {
            return Err(CompileError::semantic(format!(
                "missing END at end of {}",
                file.path.display()
            )));
        }
        if brace_depth > 0 {
            return Err(CompileError::semantic(format!(
                "unclosed block at end of {}",
                file.path.display()
            )));
        }
    }
    if pass == Pass::Emission {
        if let Some(open_line) = exec_state.unclosed_line() {
            return Err(CompileError::semantic(format!(
                "unclosed block opened at {}:{open_line}",
                file.path.display()
            )));
        }
    }
    Ok(())
}

#[allow(clippy::too_many_arguments)]
fn step(
    ctx: &mut CompileContext,
    pass: Pass,
    file: &Arc<SourceFile>,
    raw: &SourceLine,
    mode: &mut Mode,
    brace_depth: &mut usize,
    pending: &mut Option<PendingDef>,
    exec_state: &mut exec::ExecState,
) -> Result<()> {
    let line = if pass >= Pass::ChordsAndMeta {
        ctx.const_resolved(raw)?
    } else {
        raw.clone()
    };
    if line.is_empty() {
        return Ok(());
    }
    let class = classify(&ctx.keywords, &line);
    match line_action(pass, *mode, class) {
        LineAction::Ignore => Ok(()),
        LineAction::TrackNesting => {
            track_mode(mode, class);
            Ok(())
        }
        LineAction::Parse => parse_line(
            ctx,
            pass,
            file,
            &line,
            class,
            mode,
            brace_depth,
            pending,
            exec_state,
        ),
    }
}

fn track_mode(mode: &mut Mode, class: LineClass) {
    if let LineClass::Command(kind) = class {
        match kind {
            CommandKind::Instruments => *mode = Mode::Instruments,
            CommandKind::Meta => *mode = Mode::Meta,
            CommandKind::Function => *mode = Mode::Function,
            CommandKind::Pattern => *mode = Mode::Pattern,
            CommandKind::End => *mode = Mode::Default,
            _ => {}
        }
    }
}

#[allow(clippy::too_many_arguments)]
fn parse_line(
    ctx: &mut CompileContext,
    pass: Pass,
    file: &Arc<SourceFile>,
    line: &SourceLine,
    class: LineClass,
    mode: &mut Mode,
    brace_depth: &mut usize,
    pending: &mut Option<PendingDef>,
    exec_state: &mut exec::ExecState,
) -> Result<()> {
    if let LineClass::Command(kind) = class {
        match kind {
            CommandKind::End => return close_mode(ctx, pass, mode, pending),
            CommandKind::Instruments
            | CommandKind::Meta
            | CommandKind::Function
            | CommandKind::Pattern => {
                return open_mode(ctx, pass, file, line, kind, mode, *brace_depth, pending)
            }
            CommandKind::Include if *mode == Mode::Default => {
                if pass == Pass::ChordsAndMeta && *brace_depth > 0 {
                    return Err(CompileError::semantic(
                        "INCLUDE is not allowed inside a block",
                    ));
                }
                return include(ctx, pass, file, line);
            }
            _ => {}
        }
    }

    match *mode {
        Mode::Default => parse_default(ctx, pass, file, line, class, brace_depth, exec_state),
        Mode::Instruments => match pass {
            Pass::ChordsAndMeta => {
                if ctx.first_instruments_active {
                    parse_instrument_entry(ctx, line)
                } else {
                    Ok(())
                }
            }
            Pass::Emission => {
                if ctx.instrument_blocks_seen > 1 {
                    switch_instrument(ctx, line)
                } else {
                    Ok(())
                }
            }
            _ => Ok(()),
        },
        Mode::Meta => parse_meta_field(ctx, line),
        Mode::Function | Mode::Pattern => match pass {
            Pass::Bodies => {
                let open = pending.as_mut().ok_or_else(|| {
                    CompileError::semantic("line outside of an open FUNCTION or PATTERN")
                })?;
                open.def.lines.push(line.clone());
                Ok(())
            }
            Pass::ConditionCheck => precheck_line(ctx, line, class),
            _ => Ok(()),
        },
    }
}

fn parse_default(
    ctx: &mut CompileContext,
    pass: Pass,
    file: &Arc<SourceFile>,
    line: &SourceLine,
    class: LineClass,
    brace_depth: &mut usize,
    exec_state: &mut exec::ExecState,
) -> Result<()> {
    match class {
        LineClass::Command(CommandKind::Define) => parse_define(ctx, line),
        LineClass::Command(CommandKind::Const) => parse_const(ctx, line),
        LineClass::Command(CommandKind::Chord) => parse_chord(ctx, line),
        LineClass::Command(CommandKind::Soundbank) => parse_soundbank(ctx, file, line),
        LineClass::Command(CommandKind::BlockOpen) if pass == Pass::ChordsAndMeta => {
            *brace_depth += 1;
            Ok(())
        }
        LineClass::Command(CommandKind::BlockClose) if pass == Pass::ChordsAndMeta => {
            if *brace_depth == 0 {
                return Err(CompileError::syntax("'}' without a matching '{'"));
            }
            *brace_depth -= 1;
            Ok(())
        }
        _ if pass == Pass::ConditionCheck => precheck_line(ctx, line, class),
        _ if pass == Pass::Emission => exec::step_exec(ctx, exec_state, line, &file.path),
        _ => Ok(()),
    }
}

#[allow(clippy::too_many_arguments)]
fn open_mode(
    ctx: &mut CompileContext,
    pass: Pass,
    file: &Arc<SourceFile>,
    line: &SourceLine,
    kind: CommandKind,
    mode: &mut Mode,
    brace_depth: usize,
    pending: &mut Option<PendingDef>,
) -> Result<()> {
    if *mode != Mode::Default {
        return Err(CompileError::semantic(format!(
            "{} cannot be nested inside another block",
            kind.canonical()
        )));
    }
    if pass == Pass::ChordsAndMeta && brace_depth > 0 {
        return Err(CompileError::semantic(format!(
            "{} is not allowed inside a block",
            kind.canonical()
        )));
    }
    *mode = match kind {
        CommandKind::Instruments => Mode::Instruments,
        CommandKind::Meta => Mode::Meta,
        CommandKind::Function => Mode::Function,
        CommandKind::Pattern => Mode::Pattern,
        _ => {
            return Err(CompileError::semantic(format!(
                "unexpected mode command: {}",
                kind.canonical()
            )))
        }
    };

    match (pass, kind) {
        (Pass::ChordsAndMeta, CommandKind::Instruments) => {
            if !ctx.instruments_parsed {
                ctx.instruments_parsed = true;
                ctx.first_instruments_active = true;
            }
        }
        (Pass::FunctionNames, CommandKind::Function) => {
            let name = def_name(line)?;
            ctx.function_names.insert(name);
        }
        (Pass::FunctionNames, CommandKind::Pattern) => {
            let name = def_name(line)?;
            ctx.pattern_names.insert(name);
        }
        (Pass::Bodies, CommandKind::Function | CommandKind::Pattern) => {
            let name = def_name(line)?;
            *pending = Some(PendingDef {
                kind,
                def: Definition {
                    name,
                    file: file.path.clone(),
                    start_line: line.number,
                    lines: Vec::new(),
                },
            });
        }
        (Pass::Emission, CommandKind::Instruments) => ctx.instrument_blocks_seen += 1,
        _ => {}
    }
    Ok(())
}

fn close_mode(
    ctx: &mut CompileContext,
    pass: Pass,
    mode: &mut Mode,
    pending: &mut Option<PendingDef>,
) -> Result<()> {
    if *mode == Mode::Default {
        if pass == Pass::ChordsAndMeta {
            return Err(CompileError::semantic(
                "END without an open INSTRUMENTS, META, FUNCTION or PATTERN block",
            ));
        }
        return Ok(());
    }
    if pass == Pass::ChordsAndMeta && *mode == Mode::Instruments {
        ctx.first_instruments_active = false;
    }
    if pass == Pass::Bodies {
        if let Some(open) = pending.take() {
            let (table, what) = if open.kind == CommandKind::Function {
                (&mut ctx.functions, "function")
            } else {
                (&mut ctx.patterns, "pattern")
            };
            let name = open.def.name.clone();
            define_once(table, &name, open.def, what)?;
        }
    }
    *mode = Mode::Default;
    Ok(())
}

fn include(
    ctx: &mut CompileContext,
    pass: Pass,
    file: &Arc<SourceFile>,
    line: &SourceLine,
) -> Result<()> {
    let target = text_after_selector(line).trim();
    if target.is_empty() {
        return Err(CompileError::syntax("INCLUDE requires a file path"));
    }
    let base = file.path.parent().unwrap_or_else(|| Path::new(""));
    let path = base.join(target);
    debug!(path = %path.display(), "following include");
    run_pass(ctx, pass, &path).map_err(|e| {
        e.with_frame(StackTraceElement::Include {
            file: file.path.display().to_string(),
            line: line.number,
        })
    })
}

fn parse_define(ctx: &mut CompileContext, line: &SourceLine) -> Result<()> {
    let command = line
        .value()
        .ok_or_else(|| CompileError::syntax("DEFINE requires a command and a new spelling"))?;
    let spelling = line.rest().map(str::trim).unwrap_or("");
    if spelling.is_empty() || spelling.contains(char::is_whitespace) {
        return Err(CompileError::syntax(
            "DEFINE requires exactly one new spelling",
        ));
    }
    let command = command.to_string();
    let spelling = spelling.to_string();
    ctx.keywords.redefine(&command, &spelling)
}

fn parse_const(ctx: &mut CompileContext, line: &SourceLine) -> Result<()> {
    let name_token = line
        .value()
        .ok_or_else(|| CompileError::syntax("CONST requires a name and a value"))?;
    let name = name_token.strip_prefix('$').unwrap_or(name_token);
    validate_name(name)?;
    let value = strip_assign(line.rest().unwrap_or(""));
    if value.is_empty() {
        return Err(CompileError::syntax("CONST requires a value"));
    }
    if ctx.constants.contains_key(name) {
        return Err(CompileError::semantic(format!(
            "constant already defined: ${name}"
        )));
    }
    ctx.constants.insert(name.to_string(), value.to_string());
    Ok(())
}

fn parse_chord(ctx: &mut CompileContext, line: &SourceLine) -> Result<()> {
    let name = line
        .value()
        .ok_or_else(|| CompileError::syntax("CHORD requires a name and a note list"))?
        .to_string();
    validate_name(&name)?;
    let notes = crate::defs::parse_chord_notes(
        line.rest()
            .ok_or_else(|| CompileError::syntax("CHORD requires a note list"))?,
    )?;
    define_once(&mut ctx.chords, &name, notes, "chord")
}

fn parse_soundbank(
    ctx: &mut CompileContext,
    file: &Arc<SourceFile>,
    line: &SourceLine,
) -> Result<()> {
    if ctx.soundbank.is_some() {
        return Err(CompileError::semantic("soundbank already set"));
    }
    let target = text_after_selector(line).trim();
    if target.is_empty() {
        return Err(CompileError::syntax("SOUNDBANK requires a file path"));
    }
    let base = file.path.parent().unwrap_or_else(|| Path::new(""));
    let path = base.join(target);
    if fs::metadata(&path).is_err() {
        return Err(CompileError::io(format!(
            "soundbank file not found: {}",
            path.display()
        )));
    }
    ctx.soundbank = Some(path);
    Ok(())
}

fn parse_instrument_entry(ctx: &mut CompileContext, line: &SourceLine) -> Result<()> {
    let channel = parse_channel(line.selector().unwrap_or(""))?;
    let spec = line
        .value()
        .ok_or_else(|| CompileError::syntax("INSTRUMENTS entry needs a channel and an instrument"))?;
    let (program, bank_msb, bank_lsb) = parse_instrument_spec(spec)?;
    if ctx.channels.contains_key(&channel) {
        return Err(CompileError::semantic(format!(
            "channel {channel} configured twice in INSTRUMENTS"
        )));
    }
    let mut state = ChannelState::configured(channel, program, note::instrument_name(program));
    state.bank_msb = bank_msb;
    state.bank_lsb = bank_lsb;
    ctx.channels.insert(channel, state);
    ctx.channel_comments
        .insert(channel, line.rest().unwrap_or("").to_string());
    Ok(())
}

/// A later INSTRUMENTS block switches an instrument at the channel's
/// current tick instead of initializing it.
fn switch_instrument(ctx: &mut CompileContext, line: &SourceLine) -> Result<()> {
    let channel = parse_channel(line.selector().unwrap_or(""))?;
    let spec = line
        .value()
        .ok_or_else(|| CompileError::syntax("INSTRUMENTS entry needs a channel and an instrument"))?;
    let comment = line.rest().unwrap_or("").to_string();
    let (program, bank_msb, bank_lsb) = parse_instrument_spec(spec)?;

    let start = ctx.last_sync_tick;
    let state = ctx.channels.entry(channel).or_insert_with(|| {
        let mut auto = ChannelState::auto(channel);
        auto.current_tick = start;
        auto
    });
    let tick = state.current_tick;
    state.program = program;
    state.instrument_name = note::instrument_name(program).to_string();
    if bank_msb != state.bank_msb {
        state.bank_msb = bank_msb;
        ctx.sink.set_bank(channel, tick, bank_msb, false);
    }
    if bank_lsb != state.bank_lsb {
        state.bank_lsb = bank_lsb;
        ctx.sink.set_bank(channel, tick, bank_lsb, true);
    }
    ctx.sink.init_channel(channel, program, &comment, tick);
    Ok(())
}

/// Instrument column: `prog`, `prog,msb` or `prog,msb,lsb`.
fn parse_instrument_spec(spec: &str) -> Result<(u8, u8, u8)> {
    let mut parts = spec.split(',');
    let program = note::parse_instrument(parts.next().unwrap_or(""))?;
    let bank_msb = parts.next().map(parse_bank).transpose()?.unwrap_or(0);
    let bank_lsb = parts.next().map(parse_bank).transpose()?.unwrap_or(0);
    if parts.next().is_some() {
        return Err(CompileError::syntax(format!(
            "too many bank numbers in instrument: {spec}"
        )));
    }
    Ok((program, bank_msb, bank_lsb))
}

fn parse_bank(token: &str) -> Result<u8> {
    let value: u8 = token
        .parse()
        .map_err(|_| CompileError::syntax(format!("invalid bank number: {token}")))?;
    if value > 127 {
        return Err(CompileError::midi(format!(
            "bank number out of range 0-127: {token}"
        )));
    }
    Ok(value)
}

fn parse_meta_field(ctx: &mut CompileContext, line: &SourceLine) -> Result<()> {
    let field = line.selector().unwrap_or("").to_lowercase();
    let value = text_after_selector(line).trim().to_string();
    if value.is_empty() {
        return Err(CompileError::syntax(format!(
            "META field '{field}' requires a value"
        )));
    }
    let slot = match field.as_str() {
        "title" => &mut ctx.meta.title,
        "composer" => &mut ctx.meta.composer,
        "copyright" => &mut ctx.meta.copyright,
        "lyricist" => &mut ctx.meta.lyricist,
        _ => {
            return Err(CompileError::syntax(format!(
                "unknown META field: {field}"
            )))
        }
    };
    *slot = Some(value);
    Ok(())
}

/// Pass 6: validate the condition expressions of a line without executing
/// anything. `$` markers are still unresolved here and are allowed.
fn precheck_line(ctx: &CompileContext, line: &SourceLine, class: LineClass) -> Result<()> {
    let opt_text: Option<String> = match class {
        LineClass::Channel => line
            .rest()
            .and_then(|rest| rest.split_once(char::is_whitespace))
            .map(|(_, opts)| opts.to_string()),
        LineClass::Command(CommandKind::Call) => {
            let (sig, opts) = crate::defs::split_call_line(text_after_selector(line))?;
            // Undefined call targets fail here, even on branches that will
            // never play. Names built from markers can only be checked later.
            let name = sig.split('(').next().unwrap_or(sig).trim();
            if !name.contains('$') && !ctx.function_names.contains(name) {
                return Err(CompileError::semantic(format!(
                    "undefined function: {name}"
                )));
            }
            Some(opts.to_string())
        }
        LineClass::Command(CommandKind::BlockOpen | CommandKind::BlockClose) => {
            Some(text_after_selector(line).to_string())
        }
        _ => None,
    };
    if let Some(text) = opt_text {
        for expr in options::conditions_in(&text, &ctx.keywords) {
            crate::cond::precheck(&expr)?;
        }
    }
    Ok(())
}

fn def_name(line: &SourceLine) -> Result<String> {
    let name = line
        .value()
        .ok_or_else(|| CompileError::syntax("FUNCTION and PATTERN require a name"))?;
    validate_name(name)?;
    Ok(name.to_string())
}

pub(crate) fn validate_name(name: &str) -> Result<()> {
    if name.is_empty() || !name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
        return Err(CompileError::syntax(format!("invalid name: {name}")));
    }
    Ok(())
}

/// Channel selector: a number 0-15, or `p` for the percussion channel.
pub(crate) fn parse_channel(token: &str) -> Result<u8> {
    if token.eq_ignore_ascii_case("p") {
        return Ok(crate::channel::PERCUSSION_CHANNEL);
    }
    let channel: u8 = token
        .parse()
        .map_err(|_| CompileError::syntax(format!("invalid channel: {token}")))?;
    if channel > 15 {
        return Err(CompileError::midi(format!(
            "channel out of range 0-15: {token}"
        )));
    }
    Ok(channel)
}

/// Everything on the line after the first column, with its internal
/// whitespace intact.
pub(crate) fn text_after_selector(line: &SourceLine) -> &str {
    let trimmed = line.raw.trim_start();
    match line.selector() {
        Some(selector) => trimmed[selector.len()..].trim_start(),
        None => "",
    }
}

/// Strip the optional `=` between a name and its value.
pub(crate) fn strip_assign(text: &str) -> &str {
    let trimmed = text.trim();
    trimmed
        .strip_prefix('=')
        .map(str::trim_start)
        .unwrap_or(trimmed)
}
