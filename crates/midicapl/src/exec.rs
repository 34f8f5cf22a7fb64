//! Emission-pass execution: the only code that mutates channel state or
//! emits events.
//!
//! Channel lines, CALL, VAR, GLOBAL and block braces all arrive here, both
//! from the top-level traversal and from buffered replay (function bodies,
//! block children, pattern bodies). Variable and parameter substitution
//! happens at execution time, so a block replayed with `quantity` sees
//! variable updates between repetitions.

use std::collections::HashMap;
use std::path::Path;

use tracing::debug;

use crate::block::{BlockBuilder, BlockElement, NestableBlock};
use crate::channel::{ChannelState, PERCUSSION_CHANNEL};
use crate::cond;
use crate::defs::{self, CallSignature, MAX_FUNCTION_DEPTH, MAX_PATTERN_DEPTH};
use crate::duration;
use crate::error::{CompileError, Result, StackTraceElement};
use crate::keywords::CommandKind;
use crate::line::SourceLine;
use crate::note;
use crate::options::{self, CondKind, Opts};
use crate::parser::{
    classify, parse_channel, strip_assign, text_after_selector, validate_name, CompileContext,
    LineClass,
};
use crate::sink::{EventSink, TextKind};
use crate::subst;

/// Inherited execution parameters, composed downward through blocks and
/// calls: shift adds, tuplet concatenates onto every duration string.
#[derive(Debug, Clone, Default)]
pub(crate) struct ExecEnv {
    pub shift: i32,
    pub tuplet: String,
}

/// Conditional-chain bookkeeping across sibling elements.
#[derive(Debug, Default)]
struct ChainState {
    opened: bool,
    hit: bool,
}

/// Per-traversal execution state: the block under construction and the
/// conditional chain among top-level siblings.
pub(crate) struct ExecState {
    chain: ChainState,
    blocks: BlockBuilder,
}

impl ExecState {
    pub fn new() -> Self {
        ExecState {
            chain: ChainState::default(),
            blocks: BlockBuilder::new(),
        }
    }

    pub fn unclosed_line(&self) -> Option<usize> {
        self.blocks.unclosed_line()
    }
}

/// Execute one line of the emission pass.
pub(crate) fn step_exec(
    ctx: &mut CompileContext,
    state: &mut ExecState,
    line: &SourceLine,
    file: &Path,
) -> Result<()> {
    match classify(&ctx.keywords, line) {
        LineClass::Command(CommandKind::BlockOpen) => {
            let opts = brace_opts(ctx, line)?;
            state.blocks.open(opts, line.number);
            Ok(())
        }
        LineClass::Command(CommandKind::BlockClose) => {
            let opts = brace_opts(ctx, line)?;
            if let Some(root) = state.blocks.close(opts, line.number)? {
                play_block(ctx, &root, file, &ExecEnv::default(), &mut state.chain)?;
            }
            Ok(())
        }
        // Inside an open block, lines are buffered raw and substituted when
        // the block plays.
        _ if state.blocks.collecting() => {
            state.blocks.push_line(line.clone());
            Ok(())
        }
        _ => exec_command_line(ctx, line, &ExecEnv::default(), &mut state.chain),
    }
}

/// Replay a function body.
fn run_lines(ctx: &mut CompileContext, lines: &[SourceLine], file: &Path, env: &ExecEnv) -> Result<()> {
    let mut chain = ChainState::default();
    let mut blocks = BlockBuilder::new();
    for line in lines {
        if line.is_empty() {
            continue;
        }
        body_step(ctx, line, file, env, &mut chain, &mut blocks)
            .map_err(|e| e.with_location_if_unset(file, line.number, Some(&line.raw)))?;
    }
    if let Some(open_line) = blocks.unclosed_line() {
        return Err(CompileError::semantic(format!(
            "unclosed block opened at line {open_line}"
        )));
    }
    Ok(())
}

fn body_step(
    ctx: &mut CompileContext,
    line: &SourceLine,
    file: &Path,
    env: &ExecEnv,
    chain: &mut ChainState,
    blocks: &mut BlockBuilder,
) -> Result<()> {
    match classify(&ctx.keywords, line) {
        LineClass::Command(CommandKind::BlockOpen) => {
            let opts = brace_opts(ctx, line)?;
            blocks.open(opts, line.number);
            Ok(())
        }
        LineClass::Command(CommandKind::BlockClose) => {
            let opts = brace_opts(ctx, line)?;
            if let Some(root) = blocks.close(opts, line.number)? {
                play_block(ctx, &root, file, env, chain)?;
            }
            Ok(())
        }
        _ if blocks.collecting() => {
            blocks.push_line(line.clone());
            Ok(())
        }
        _ => exec_command_line(ctx, line, env, chain),
    }
}

fn exec_command_line(
    ctx: &mut CompileContext,
    line: &SourceLine,
    env: &ExecEnv,
    chain: &mut ChainState,
) -> Result<()> {
    match classify(&ctx.keywords, line) {
        LineClass::Command(CommandKind::Var) => {
            should_run(ctx, chain, &None)?;
            exec_var(ctx, line)
        }
        LineClass::Command(CommandKind::Call) => exec_call(ctx, line, env, chain),
        LineClass::Command(CommandKind::Global) => {
            should_run(ctx, chain, &None)?;
            exec_global(ctx, line)
        }
        LineClass::Command(kind) => Err(CompileError::syntax(format!(
            "{} is not allowed here",
            kind.canonical()
        ))),
        LineClass::Channel => exec_channel_line(ctx, line, env, chain),
        LineClass::Other => Err(CompileError::syntax(format!(
            "unknown command: {}",
            line.selector().unwrap_or("")
        ))),
    }
}

/// Parse the options on a `{` or `}` line. Conditions are split off raw;
/// everything else is substituted now.
fn brace_opts(ctx: &CompileContext, line: &SourceLine) -> Result<Opts> {
    let text = text_after_selector(line);
    let (rest, condition) = options::split_conditions(text, &ctx.keywords)?;
    let rest = subst::resolve_variables(&rest, &ctx.variables, ctx.frame())?;
    let mut opts = Opts::parse(&rest, &ctx.keywords)?;
    opts.condition = condition;
    Ok(opts)
}

/// Decide whether an element runs, updating the conditional chain.
fn should_run(
    ctx: &CompileContext,
    chain: &mut ChainState,
    condition: &Option<(CondKind, String)>,
) -> Result<bool> {
    match condition {
        None => {
            chain.opened = false;
            chain.hit = false;
            Ok(true)
        }
        Some((CondKind::If, expr)) => {
            chain.opened = true;
            chain.hit = eval_condition(ctx, expr)?;
            Ok(chain.hit)
        }
        Some((CondKind::Elsif, expr)) => {
            if !chain.opened {
                return Err(CompileError::semantic("elsif without a preceding if"));
            }
            if chain.hit {
                return Ok(false);
            }
            chain.hit = eval_condition(ctx, expr)?;
            Ok(chain.hit)
        }
        Some((CondKind::Else, _)) => {
            if !chain.opened {
                return Err(CompileError::semantic("else without a preceding if"));
            }
            let run = !chain.hit;
            chain.opened = false;
            chain.hit = false;
            Ok(run)
        }
    }
}

fn eval_condition(ctx: &CompileContext, expr: &str) -> Result<bool> {
    let substituted = subst::resolve_variables(expr, &ctx.variables, ctx.frame())?;
    cond::eval(&substituted)
}

fn exec_var(ctx: &mut CompileContext, line: &SourceLine) -> Result<()> {
    let name_token = line
        .value()
        .ok_or_else(|| CompileError::syntax("VAR requires a name and a value"))?;
    let name = name_token.strip_prefix('$').unwrap_or(name_token);
    validate_name(name)?;
    let raw_value = strip_assign(line.rest().unwrap_or(""));
    let value = subst::resolve_variables(raw_value, &ctx.variables, ctx.frame())?;
    ctx.variables.insert(name.to_string(), value);
    Ok(())
}

fn exec_call(
    ctx: &mut CompileContext,
    line: &SourceLine,
    env: &ExecEnv,
    chain: &mut ChainState,
) -> Result<()> {
    let text = subst::resolve_variables(text_after_selector(line), &ctx.variables, ctx.frame())?;
    let (sig_text, opt_text) = defs::split_call_line(&text)?;
    let opts = Opts::parse(opt_text, &ctx.keywords)?;
    if opts.velocity.is_some()
        || opts.duration_ratio.is_some()
        || opts.lyrics.is_some()
        || opts.tuplet.is_some()
        || opts.tremolo.is_some()
    {
        return Err(CompileError::syntax(
            "CALL accepts only quantity, multiple, shift and if/elsif/else options",
        ));
    }
    if !should_run(ctx, chain, &opts.condition)? {
        return Ok(());
    }

    let sig = defs::parse_call_signature(sig_text)?;
    let def = ctx
        .functions
        .get(&sig.name)
        .cloned()
        .ok_or_else(|| CompileError::semantic(format!("undefined function: {}", sig.name)))?;
    if ctx.function_stack.last() == Some(&sig.name) {
        return Err(CompileError::semantic(format!(
            "function calls itself: {}",
            sig.name
        )));
    }
    if ctx.function_stack.len() >= MAX_FUNCTION_DEPTH {
        return Err(CompileError::semantic(format!(
            "function call depth exceeds {MAX_FUNCTION_DEPTH}"
        )));
    }
    debug!(function = %sig.name, "expanding function call");

    let child_env = ExecEnv {
        shift: env.shift + opts.shift.unwrap_or(0),
        tuplet: env.tuplet.clone(),
    };
    let snapshot = opts.multiple.then(|| snapshot_ticks(ctx));
    ctx.param_stack.push(sig.frame.clone());
    ctx.function_stack.push(sig.name.clone());
    let mut result = Ok(());
    for _ in 0..opts.quantity.unwrap_or(1) {
        result = run_lines(ctx, &def.lines, &def.file, &child_env);
        if result.is_err() {
            break;
        }
    }
    ctx.function_stack.pop();
    ctx.param_stack.pop();
    if let Some(ticks) = snapshot {
        restore_ticks(ctx, ticks);
    }
    result.map_err(|e| {
        e.with_frame(StackTraceElement::Function {
            name: sig.name.clone(),
            params: sig.params_raw.clone(),
            file: def.file.display().to_string(),
            line: def.start_line,
        })
    })
}

fn exec_global(ctx: &mut CompileContext, line: &SourceLine) -> Result<()> {
    let text = subst::resolve_variables(text_after_selector(line), &ctx.variables, ctx.frame())?;
    let tokens: Vec<&str> = text.split_whitespace().collect();
    let (targets, command) = match tokens.as_slice() {
        [] => (None, None),
        [cmd, value] if is_global_command(cmd) => (None, Some((*cmd, *value))),
        [range] => (Some(parse_channel_range(range)?), None),
        [range, cmd, value] if is_global_command(cmd) => {
            (Some(parse_channel_range(range)?), Some((*cmd, *value)))
        }
        _ => {
            return Err(CompileError::syntax(format!(
                "malformed GLOBAL command: {text}"
            )))
        }
    };
    let tick = sync_channels(ctx, targets.as_deref());
    if let Some((cmd, value)) = command {
        apply_global(ctx, cmd, value, tick)?;
    }
    Ok(())
}

fn is_global_command(token: &str) -> bool {
    matches!(token, "tempo" | "time" | "key")
}

/// Set the targeted channels' tick cursors to the maximum among them.
/// Returns that maximum; a full sync also becomes the starting tick for
/// channels created afterwards.
fn sync_channels(ctx: &mut CompileContext, targets: Option<&[u8]>) -> u64 {
    let selected = |channel: &u8| targets.map_or(true, |t| t.contains(channel));
    let max = ctx
        .channels
        .iter()
        .filter(|(channel, _)| selected(channel))
        .map(|(_, state)| state.current_tick)
        .max()
        .unwrap_or(ctx.last_sync_tick);
    for (channel, state) in ctx.channels.iter_mut() {
        if selected(channel) {
            state.current_tick = max;
        }
    }
    if targets.is_none() {
        ctx.last_sync_tick = max;
    }
    max
}

fn apply_global(ctx: &mut CompileContext, cmd: &str, value: &str, tick: u64) -> Result<()> {
    match cmd {
        "tempo" => {
            let bpm: u16 = value
                .parse()
                .map_err(|_| CompileError::syntax(format!("invalid tempo: {value}")))?;
            if bpm == 0 {
                return Err(CompileError::semantic("tempo must be greater than zero"));
            }
            ctx.sink.add_tempo(bpm, tick);
        }
        "time" => {
            let (numerator, denominator) = value
                .split_once('/')
                .ok_or_else(|| CompileError::syntax(format!("time signature must look like 3/4, got: {value}")))?;
            let numerator: u8 = numerator
                .parse()
                .map_err(|_| CompileError::syntax(format!("invalid time signature: {value}")))?;
            let denominator: u8 = denominator
                .parse()
                .map_err(|_| CompileError::syntax(format!("invalid time signature: {value}")))?;
            if numerator == 0 || denominator == 0 || !denominator.is_power_of_two() {
                return Err(CompileError::semantic(format!(
                    "time signature denominator must be a power of two: {value}"
                )));
            }
            ctx.sink.add_time_signature(numerator, denominator, tick);
        }
        "key" => {
            let (sharps, major) = parse_key(value)?;
            ctx.sink.add_key_signature(sharps, major, tick);
        }
        _ => {
            return Err(CompileError::syntax(format!(
                "unknown GLOBAL command: {cmd}"
            )))
        }
    }
    Ok(())
}

/// Key signature: `<tonic>/<maj|min>`, resolved to a sharp/flat count via
/// the circle of fifths.
fn parse_key(value: &str) -> Result<(i8, bool)> {
    let (tonic, mode) = value.split_once('/').ok_or_else(|| {
        CompileError::syntax(format!("key must look like c/maj or a/min, got: {value}"))
    })?;
    let major = match mode.to_lowercase().as_str() {
        "maj" | "major" => true,
        "min" | "minor" => false,
        _ => {
            return Err(CompileError::syntax(format!(
                "key mode must be maj or min, got: {mode}"
            )))
        }
    };
    let tonic = tonic.to_lowercase();
    let mut chars = tonic.chars();
    let letter = chars
        .next()
        .ok_or_else(|| CompileError::syntax("empty key tonic"))?;
    let fifths: i32 = match letter {
        'f' => -1,
        'c' => 0,
        'g' => 1,
        'd' => 2,
        'a' => 3,
        'e' => 4,
        'b' => 5,
        _ => {
            return Err(CompileError::syntax(format!(
                "unknown key tonic: {tonic}"
            )))
        }
    };
    let accidental: i32 = match chars.as_str() {
        "" => 0,
        "#" => 1,
        "b" => -1,
        other => {
            return Err(CompileError::syntax(format!(
                "unknown accidental in key tonic: {other}"
            )))
        }
    };
    let mut sharps = fifths + 7 * accidental;
    if !major {
        sharps -= 3;
    }
    if !(-7..=7).contains(&sharps) {
        return Err(CompileError::semantic(format!(
            "key signature out of range: {value}"
        )));
    }
    Ok((sharps as i8, major))
}

/// `0-3,5,p` into a duplicate-free channel list.
fn parse_channel_range(text: &str) -> Result<Vec<u8>> {
    let mut channels = Vec::new();
    for part in text.split(',') {
        match part.split_once('-') {
            Some((from, to)) => {
                let from = parse_channel(from)?;
                let to = parse_channel(to)?;
                if from > to {
                    return Err(CompileError::syntax(format!(
                        "descending channel range: {part}"
                    )));
                }
                channels.extend(from..=to);
            }
            None => channels.push(parse_channel(part)?),
        }
    }
    channels.sort_unstable();
    channels.dedup();
    if channels.is_empty() {
        return Err(CompileError::syntax("empty channel range"));
    }
    Ok(channels)
}

fn play_block(
    ctx: &mut CompileContext,
    block: &NestableBlock,
    file: &Path,
    env: &ExecEnv,
    chain: &mut ChainState,
) -> Result<()> {
    if !should_run(ctx, chain, &block.condition)? {
        return Ok(());
    }
    run_block(ctx, block, file, env).map_err(|e| {
        e.with_frame(StackTraceElement::Block {
            file: file.display().to_string(),
            open_line: block.open_line,
            close_line: block.close_line,
        })
    })
}

fn run_block(ctx: &mut CompileContext, block: &NestableBlock, file: &Path, env: &ExecEnv) -> Result<()> {
    let child_env = ExecEnv {
        shift: env.shift + block.shift,
        tuplet: match &block.tuplet {
            Some(tuplet) => format!("{}{tuplet}", env.tuplet),
            None => env.tuplet.clone(),
        },
    };
    let snapshot = block.multiple.then(|| snapshot_ticks(ctx));
    for _ in 0..block.quantity {
        let mut chain = ChainState::default();
        for element in &block.children {
            match element {
                BlockElement::Line(line) => {
                    if line.is_empty() {
                        continue;
                    }
                    exec_command_line(ctx, line, &child_env, &mut chain)
                        .map_err(|e| e.with_location_if_unset(file, line.number, Some(&line.raw)))?;
                }
                BlockElement::Block(inner) => play_block(ctx, inner, file, &child_env, &mut chain)?,
            }
        }
    }
    if let Some(ticks) = snapshot {
        restore_ticks(ctx, ticks);
    }
    Ok(())
}

fn snapshot_ticks(ctx: &CompileContext) -> HashMap<u8, u64> {
    ctx.channels
        .iter()
        .map(|(channel, state)| (*channel, state.current_tick))
        .collect()
}

fn restore_ticks(ctx: &mut CompileContext, ticks: HashMap<u8, u64>) {
    for (channel, tick) in ticks {
        if let Some(state) = ctx.channels.get_mut(&channel) {
            state.current_tick = tick;
        }
    }
}

fn ensure_channel(ctx: &mut CompileContext, channel: u8) {
    if ctx.channels.contains_key(&channel) {
        return;
    }
    let mut state = ChannelState::auto(channel);
    state.current_tick = ctx.last_sync_tick;
    ctx.sink
        .init_channel(channel, state.program, "", state.current_tick);
    ctx.channels.insert(channel, state);
}

fn exec_channel_line(
    ctx: &mut CompileContext,
    line: &SourceLine,
    env: &ExecEnv,
    chain: &mut ChainState,
) -> Result<()> {
    let text = subst::resolve_variables(&line.raw, &ctx.variables, ctx.frame())?;
    let line = line.retokenized(&text);
    if line.is_empty() {
        return Ok(());
    }
    let channel = parse_channel(line.selector().unwrap_or(""))?;
    let note_token = line
        .value()
        .ok_or_else(|| CompileError::syntax("channel command needs a note and a duration"))?
        .to_string();
    let rest = line
        .rest()
        .ok_or_else(|| CompileError::syntax("channel command needs a duration"))?
        .to_string();

    // Third column starting with a pattern name is a pattern call, not a
    // duration.
    if let Some(name) = call_name(&rest) {
        if ctx.pattern_names.contains(name) {
            return exec_pattern_call(ctx, channel, &note_token, &rest, env, chain);
        }
    }

    let (duration_token, opt_text) = match rest.split_once(char::is_whitespace) {
        Some((duration, opts)) => (duration, opts.trim_start()),
        None => (rest.as_str(), ""),
    };
    let opts = Opts::parse(opt_text, &ctx.keywords)?;
    if !should_run(ctx, chain, &opts.condition)? {
        return Ok(());
    }

    ensure_channel(ctx, channel);
    let duration_text = format!(
        "{duration_token}{}{}",
        opts.tuplet.as_deref().unwrap_or(""),
        env.tuplet
    );
    let duration = duration::parse_duration(&duration_text, ctx.options.resolution)?;
    let quantity = opts.quantity.unwrap_or(1);
    let tremolo_step = opts
        .tremolo
        .as_deref()
        .map(|t| duration::parse_duration(t, ctx.options.resolution))
        .transpose()?;

    if note_token == "-" {
        let (state, _) = ctx.channel_and_sink(channel);
        if let Some(velocity) = opts.velocity {
            state.set_velocity(velocity);
        }
        if let Some(ratio) = opts.duration_ratio {
            state.set_duration_ratio(ratio);
        }
        if !opts.multiple {
            for _ in 0..quantity {
                state.add_rest(duration);
            }
        }
        return Ok(());
    }

    let notes = resolve_notes(ctx, &note_token)?;
    let shift = env.shift + opts.shift.unwrap_or(0);
    let pitches: Vec<u8> = notes
        .iter()
        .map(|&n| resolve_pitch(ctx, channel, n, shift))
        .collect::<Result<_>>()?;

    let (state, sink) = ctx.channel_and_sink(channel);
    if let Some(velocity) = opts.velocity {
        state.set_velocity(velocity);
    }
    if let Some(ratio) = opts.duration_ratio {
        state.set_duration_ratio(ratio);
    }
    let start = state.current_tick;
    if let Some(lyrics) = &opts.lyrics {
        sink.add_text(TextKind::Lyrics, lyrics, start);
    }
    for _ in 0..quantity {
        match tremolo_step {
            Some(step) => strike_tremolo(sink, state, &pitches, duration, step),
            None => strike(sink, state, &pitches, duration),
        }
    }
    if opts.multiple {
        state.current_tick = start;
    }
    Ok(())
}

/// First word of a third column, up to `(` or whitespace. Used to decide
/// whether the column is a pattern call.
fn call_name(text: &str) -> Option<&str> {
    let end = text
        .find(|c: char| c == '(' || c.is_whitespace())
        .unwrap_or(text.len());
    let name = &text[..end];
    (!name.is_empty()).then_some(name)
}

/// Note column: a defined chord name, an inline comma list, or one note.
fn resolve_notes(ctx: &CompileContext, token: &str) -> Result<Vec<u8>> {
    if let Some(chord) = ctx.chords.get(token) {
        return Ok(chord.clone());
    }
    if token.contains(',') {
        let mut notes = Vec::new();
        for part in token.split(',') {
            let part = part.trim();
            if part.is_empty() {
                return Err(CompileError::syntax(format!(
                    "empty note in chord: {token}"
                )));
            }
            let n = note::parse_note(part)?;
            if notes.contains(&n) {
                return Err(CompileError::semantic(format!(
                    "duplicate note in chord: {part}"
                )));
            }
            notes.push(n);
        }
        return Ok(notes);
    }
    note::parse_note(token).map(|n| vec![n])
}

fn resolve_pitch(ctx: &CompileContext, channel: u8, note: u8, shift: i32) -> Result<u8> {
    let mut value = note as i32 + shift;
    if channel != PERCUSSION_CHANNEL {
        value += ctx.options.transpose as i32;
    }
    if !(0..=127).contains(&value) {
        return Err(CompileError::midi(format!(
            "note {note} lands on {value} after shift/transpose, outside 0-127"
        )));
    }
    Ok(value as u8)
}

/// Strike all pitches as one chord at the channel's cursor, advancing it by
/// `duration`, and apply legato correction for any pitch still sounding.
fn strike(sink: &mut dyn EventSink, state: &mut ChannelState, pitches: &[u8], duration: u64) {
    let channel = state.channel;
    let on_tick = state.current_tick;
    let velocity = state.velocity;
    for &pitch in pitches {
        state.current_tick = on_tick;
        let off_tick = state.add_note(pitch, duration);
        if let Some(from) = state.take_stop_tick_to_correct() {
            sink.move_note_off(channel, pitch, from, on_tick.saturating_sub(1));
        }
        sink.add_note_on(channel, pitch, on_tick, velocity);
        sink.add_note_off(channel, pitch, off_tick);
    }
}

/// Tremolo: re-strike in `step`-sized slices until `total` is consumed.
fn strike_tremolo(
    sink: &mut dyn EventSink,
    state: &mut ChannelState,
    pitches: &[u8],
    total: u64,
    step: u64,
) {
    let mut remaining = total;
    while remaining >= step {
        strike(sink, state, pitches, step);
        remaining -= step;
    }
    if remaining > 0 {
        strike(sink, state, pitches, remaining);
    }
}

fn exec_pattern_call(
    ctx: &mut CompileContext,
    channel: u8,
    note_token: &str,
    call_text: &str,
    env: &ExecEnv,
    chain: &mut ChainState,
) -> Result<()> {
    let (sig_text, opt_text) = defs::split_call_line(call_text)?;
    let outer = Opts::parse(opt_text, &ctx.keywords)?;
    if outer.tuplet.is_some() || outer.tremolo.is_some() {
        return Err(CompileError::syntax(
            "pattern calls accept velocity, duration, multiple, quantity, shift and lyrics options",
        ));
    }
    if !should_run(ctx, chain, &outer.condition)? {
        return Ok(());
    }
    if note_token == "-" {
        return Err(CompileError::semantic("a pattern call needs notes, not a rest"));
    }
    let notes = resolve_notes(ctx, note_token)?;
    let sig = defs::parse_call_signature(sig_text)?;
    run_pattern(ctx, channel, &notes, &sig, &outer, env)
}

fn run_pattern(
    ctx: &mut CompileContext,
    channel: u8,
    notes: &[u8],
    sig: &CallSignature,
    outer: &Opts,
    env: &ExecEnv,
) -> Result<()> {
    let def = ctx
        .patterns
        .get(&sig.name)
        .cloned()
        .ok_or_else(|| CompileError::semantic(format!("undefined pattern: {}", sig.name)))?;
    if ctx.pattern_depth >= MAX_PATTERN_DEPTH {
        return Err(CompileError::semantic(format!(
            "pattern nesting depth exceeds {MAX_PATTERN_DEPTH}"
        )));
    }
    ensure_channel(ctx, channel);
    debug!(pattern = %sig.name, channel, "expanding pattern");

    ctx.pattern_depth += 1;
    ctx.param_stack.push(sig.frame.clone());
    let result = run_pattern_body(ctx, channel, notes, &def, outer, env);
    ctx.param_stack.pop();
    ctx.pattern_depth -= 1;
    result.map_err(|e| {
        e.with_frame(StackTraceElement::Pattern {
            name: sig.name.clone(),
            params: sig.params_raw.clone(),
            file: def.file.display().to_string(),
            line: def.start_line,
        })
    })
}

fn run_pattern_body(
    ctx: &mut CompileContext,
    channel: u8,
    notes: &[u8],
    def: &crate::defs::Definition,
    outer: &Opts,
    env: &ExecEnv,
) -> Result<()> {
    // Outer velocity/duration apply for the whole call; the originals come
    // back afterwards so a pattern never leaks state into the channel.
    let (saved_velocity, saved_ratio) = {
        let (state, _) = ctx.channel_and_sink(channel);
        let saved = (state.velocity, state.duration_ratio);
        if let Some(velocity) = outer.velocity {
            state.set_velocity(velocity);
        }
        if let Some(ratio) = outer.duration_ratio {
            state.set_duration_ratio(ratio);
        }
        saved
    };
    let snapshot = outer.multiple.then(|| {
        let (state, _) = ctx.channel_and_sink(channel);
        state.current_tick
    });
    if let Some(lyrics) = &outer.lyrics {
        let tick = {
            let (state, _) = ctx.channel_and_sink(channel);
            state.current_tick
        };
        ctx.sink.add_text(TextKind::Lyrics, lyrics, tick);
    }
    let child_env = ExecEnv {
        shift: env.shift + outer.shift.unwrap_or(0),
        tuplet: env.tuplet.clone(),
    };

    let mut result = Ok(());
    'replay: for _ in 0..outer.quantity.unwrap_or(1) {
        for line in &def.lines {
            if line.is_empty() {
                continue;
            }
            if let Err(e) = exec_pattern_line(ctx, channel, notes, line, &child_env) {
                result = Err(e.with_location_if_unset(&def.file, line.number, Some(&line.raw)));
                break 'replay;
            }
        }
    }

    let (state, _) = ctx.channel_and_sink(channel);
    if let Some(tick) = snapshot {
        state.current_tick = tick;
    }
    state.set_velocity(saved_velocity);
    state.set_duration_ratio(saved_ratio);
    result
}

fn exec_pattern_line(
    ctx: &mut CompileContext,
    channel: u8,
    notes: &[u8],
    line: &SourceLine,
    env: &ExecEnv,
) -> Result<()> {
    let text = subst::resolve_variables(&line.raw, &ctx.variables, ctx.frame())?;
    let line = line.retokenized(&text);
    if line.is_empty() {
        return Ok(());
    }
    let selector = line.selector().unwrap_or("").to_string();
    let rest = text_after_selector(&line).to_string();

    // Rest line: `- <duration>`.
    if selector == "-" {
        let (duration_token, opt_text) = split_first(&rest)
            .ok_or_else(|| CompileError::syntax("pattern rest needs a duration"))?;
        let inner = Opts::parse(opt_text, &ctx.keywords)?;
        let duration_text = format!(
            "{duration_token}{}{}",
            inner.tuplet.as_deref().unwrap_or(""),
            env.tuplet
        );
        let duration = duration::parse_duration(&duration_text, ctx.options.resolution)?;
        let (state, _) = ctx.channel_and_sink(channel);
        for _ in 0..inner.quantity.unwrap_or(1) {
            state.add_rest(duration);
        }
        return Ok(());
    }

    let indices = parse_index_list(&selector, notes.len())?;
    let selected: Vec<u8> = indices.iter().map(|&i| notes[i]).collect();

    // A nested pattern call forwards the selected notes.
    if let Some(name) = call_name(&rest) {
        if ctx.pattern_names.contains(name) {
            let (sig_text, opt_text) = defs::split_call_line(&rest)?;
            let inner = Opts::parse(opt_text, &ctx.keywords)?;
            let sig = defs::parse_call_signature(sig_text)?;
            return run_pattern(ctx, channel, &selected, &sig, &inner, env);
        }
    }

    let (duration_token, opt_text) =
        split_first(&rest).ok_or_else(|| CompileError::syntax("pattern line needs a duration"))?;
    let inner = Opts::parse(opt_text, &ctx.keywords)?;
    if inner.condition.is_some() || inner.lyrics.is_some() || inner.shift.is_some() {
        return Err(CompileError::syntax(
            "pattern lines accept velocity, duration, multiple, quantity, tuplet and tremolo options",
        ));
    }
    let duration_text = format!(
        "{duration_token}{}{}",
        inner.tuplet.as_deref().unwrap_or(""),
        env.tuplet
    );
    let duration = duration::parse_duration(&duration_text, ctx.options.resolution)?;
    let tremolo_step = inner
        .tremolo
        .as_deref()
        .map(|t| duration::parse_duration(t, ctx.options.resolution))
        .transpose()?;
    let pitches: Vec<u8> = selected
        .iter()
        .map(|&n| resolve_pitch(ctx, channel, n, env.shift))
        .collect::<Result<_>>()?;

    // Inner velocity/duration win for this line only.
    let (state, sink) = ctx.channel_and_sink(channel);
    let (prev_velocity, prev_ratio) = (state.velocity, state.duration_ratio);
    if let Some(velocity) = inner.velocity {
        state.set_velocity(velocity);
    }
    if let Some(ratio) = inner.duration_ratio {
        state.set_duration_ratio(ratio);
    }
    let start = state.current_tick;
    for _ in 0..inner.quantity.unwrap_or(1) {
        match tremolo_step {
            Some(step) => strike_tremolo(sink, state, &pitches, duration, step),
            None => strike(sink, state, &pitches, duration),
        }
    }
    if inner.multiple {
        state.current_tick = start;
    }
    state.set_velocity(prev_velocity);
    state.set_duration_ratio(prev_ratio);
    Ok(())
}

fn split_first(text: &str) -> Option<(&str, &str)> {
    let text = text.trim();
    if text.is_empty() {
        return None;
    }
    match text.split_once(char::is_whitespace) {
        Some((first, rest)) => Some((first, rest.trim_start())),
        None => Some((text, "")),
    }
}

/// Pattern body index column: `0`, `0,2`, ...
fn parse_index_list(text: &str, available: usize) -> Result<Vec<usize>> {
    let mut indices = Vec::new();
    for part in text.split(',') {
        let index: usize = part
            .trim()
            .parse()
            .map_err(|_| CompileError::syntax(format!("invalid note index: {part}")))?;
        if index >= available {
            return Err(CompileError::semantic(format!(
                "note index {index} out of range, {available} notes supplied"
            )));
        }
        indices.push(index);
    }
    Ok(indices)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_parse_key() {
        assert_eq!(parse_key("c/maj").unwrap(), (0, true));
        assert_eq!(parse_key("g/maj").unwrap(), (1, true));
        assert_eq!(parse_key("f/maj").unwrap(), (-1, true));
        assert_eq!(parse_key("f#/maj").unwrap(), (6, true));
        assert_eq!(parse_key("eb/maj").unwrap(), (-3, true));
        assert_eq!(parse_key("a/min").unwrap(), (0, false));
        assert_eq!(parse_key("e/min").unwrap(), (1, false));
        assert_eq!(parse_key("c/min").unwrap(), (-3, false));
        assert!(parse_key("h/maj").is_err());
        assert!(parse_key("c").is_err());
        assert!(parse_key("g#/maj").is_err()); // 8 sharps
    }

    #[test]
    fn test_parse_channel_range() {
        assert_eq!(parse_channel_range("0-3,5").unwrap(), vec![0, 1, 2, 3, 5]);
        assert_eq!(parse_channel_range("p").unwrap(), vec![9]);
        assert_eq!(parse_channel_range("5,5,1").unwrap(), vec![1, 5]);
        assert!(parse_channel_range("3-1").is_err());
        assert!(parse_channel_range("0-16").is_err());
    }

    #[test]
    fn test_call_name() {
        assert_eq!(call_name("verse(c, d) q=2"), Some("verse"));
        assert_eq!(call_name("/4 v=95"), Some("/4"));
        assert_eq!(call_name(""), None);
    }

    #[test]
    fn test_parse_index_list() {
        assert_eq!(parse_index_list("0,2,1", 3).unwrap(), vec![0, 2, 1]);
        assert!(parse_index_list("3", 3).is_err());
        assert!(parse_index_list("x", 3).is_err());
    }

    #[test]
    fn test_split_first() {
        assert_eq!(split_first("/4 v=95"), Some(("/4", "v=95")));
        assert_eq!(split_first("/4"), Some(("/4", "")));
        assert_eq!(split_first("  "), None);
    }
}
