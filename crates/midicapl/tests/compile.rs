//! End-to-end compiles of small sources, checking the emitted event log.

use midicapl::{
    compile, compile_source, CompiledSequence, CompilerOptions, ErrorKind, Event, StackTraceElement,
};
use pretty_assertions::assert_eq;

fn run(src: &str) -> CompiledSequence {
    compile_source("test.mpl", src, CompilerOptions::default()).unwrap()
}

fn fail(src: &str) -> midicapl::CompileError {
    compile_source("test.mpl", src, CompilerOptions::default()).unwrap_err()
}

/// (tick, channel, note, velocity) of every note-on, in tick order.
fn note_ons(seq: &CompiledSequence) -> Vec<(u64, u8, u8, u8)> {
    seq.recorder
        .sorted_events()
        .iter()
        .filter_map(|e| match e.event {
            Event::NoteOn {
                channel,
                note,
                velocity,
            } => Some((e.tick, channel, note, velocity)),
            _ => None,
        })
        .collect()
}

/// (tick, channel, note) of every note-off, in tick order.
fn note_offs(seq: &CompiledSequence) -> Vec<(u64, u8, u8)> {
    seq.recorder
        .sorted_events()
        .iter()
        .filter_map(|e| match e.event {
            Event::NoteOff { channel, note } => Some((e.tick, channel, note)),
            _ => None,
        })
        .collect()
}

#[test]
fn test_two_quarter_notes() {
    let seq = run("INSTRUMENTS\n0 0 piano\nEND\n0 c /4\n0 d /4\n");
    assert_eq!(
        note_ons(&seq),
        vec![(0, 0, 60, 64), (480, 0, 62, 64)]
    );
    // Default duration ratio is 0.8 of the slot.
    assert_eq!(note_offs(&seq), vec![(384, 0, 60), (864, 0, 62)]);
    assert_eq!(seq.channel_tick(0), Some(960));
}

#[test]
fn test_compile_is_deterministic() {
    let src = "INSTRUMENTS\n0 40 violin\nEND\nCHORD cmaj c,e,g\n0 cmaj /4\n0 e /8\nGLOBAL tempo 90\n1 g /4\n";
    let a = run(src);
    let b = run(src);
    assert_eq!(a.recorder.events(), b.recorder.events());
    assert_eq!(a.to_midi_bytes(), b.to_midi_bytes());
}

#[test]
fn test_legato_pulls_note_off_back() {
    // 150% hold: c is still sounding when struck again, so its first
    // release moves to one tick before the second strike.
    let seq = run("0 c /4 d=150%\n0 c /4\n");
    assert_eq!(note_ons(&seq), vec![(0, 0, 60, 64), (480, 0, 60, 64)]);
    assert_eq!(note_offs(&seq), vec![(479, 0, 60), (1200, 0, 60)]);
}

#[test]
fn test_no_legato_without_overlap() {
    let seq = run("0 c /4\n0 c /4\n");
    assert_eq!(note_offs(&seq), vec![(384, 0, 60), (864, 0, 60)]);
}

#[test]
fn test_conditional_chain_takes_one_branch() {
    let seq = run(
        "VAR $x = 2\n\
         0 c /4 if=$x==1\n\
         0 d /4 elsif=$x==2\n\
         0 e /4 else\n",
    );
    assert_eq!(note_ons(&seq), vec![(0, 0, 62, 64)]);
    assert_eq!(seq.channel_tick(0), Some(480));
}

#[test]
fn test_chain_first_true_wins() {
    let seq = run(
        "VAR $x = 1\n\
         0 c /4 if=$x==1\n\
         0 d /4 elsif=$x<=5\n\
         0 e /4 else\n",
    );
    assert_eq!(note_ons(&seq), vec![(0, 0, 60, 64)]);
}

#[test]
fn test_else_without_if_fails() {
    let err = fail("0 c /4 else\n");
    assert_eq!(err.kind, ErrorKind::Semantic);
    assert!(err.message.contains("else without"));
}

#[test]
fn test_plain_line_resets_chain() {
    // The unconditional d breaks the chain, so the trailing else is orphaned.
    let err = fail(
        "VAR $x = 1\n\
         0 c /4 if=$x==2\n\
         0 d /4\n\
         0 e /4 else\n",
    );
    assert_eq!(err.kind, ErrorKind::Semantic);
}

#[test]
fn test_global_syncs_channels() {
    // Channel 1 first appears after the sync, so it starts at the sync
    // tick, not at zero.
    let seq = run("0 c /4\nGLOBAL\n1 e /4\n");
    assert_eq!(seq.channel_tick(0), Some(480));
    assert_eq!(seq.channel_tick(1), Some(960));
}

#[test]
fn test_global_partial_sync() {
    let seq = run(
        "0 c /4\n\
         1 e /2\n\
         2 g /8\n\
         GLOBAL 0-1\n\
         0 d /4\n",
    );
    // Channels 0 and 1 meet at 960; channel 2 is untouched.
    assert_eq!(seq.channel_tick(0), Some(1440));
    assert_eq!(seq.channel_tick(1), Some(960));
    assert_eq!(seq.channel_tick(2), Some(240));
}

#[test]
fn test_global_tempo_time_key() {
    let seq = run(
        "GLOBAL tempo 90\n\
         GLOBAL time 3/4\n\
         GLOBAL key g/maj\n\
         0 c /4\n",
    );
    let events = seq.recorder.sorted_events();
    assert!(events
        .iter()
        .any(|e| e.tick == 0 && e.event == Event::Tempo { bpm: 90 }));
    assert!(events.iter().any(|e| e.event
        == Event::TimeSignature {
            numerator: 3,
            denominator: 4
        }));
    assert!(events.iter().any(|e| e.event
        == Event::KeySignature {
            sharps: 1,
            major: true
        }));
}

#[test]
fn test_global_tempo_mid_song() {
    let seq = run("0 c /4\nGLOBAL tempo 140\n0 d /4\n");
    let events = seq.recorder.sorted_events();
    assert!(events
        .iter()
        .any(|e| e.tick == 480 && e.event == Event::Tempo { bpm: 140 }));
}

#[test]
fn test_function_call_with_parameters() {
    let seq = run(
        "FUNCTION riff\n\
         0 $[0] /8\n\
         END\n\
         CALL riff(c) q=2\n",
    );
    assert_eq!(note_ons(&seq), vec![(0, 0, 60, 64), (240, 0, 60, 64)]);
    assert_eq!(seq.channel_tick(0), Some(480));
}

#[test]
fn test_function_named_parameters() {
    let seq = run(
        "FUNCTION riff\n\
         0 $(note) $(len)\n\
         END\n\
         CALL riff(note=e, len=/4)\n",
    );
    assert_eq!(note_ons(&seq), vec![(0, 0, 64, 64)]);
}

#[test]
fn test_forward_call_is_legal() {
    let seq = run(
        "CALL riff\n\
         FUNCTION riff\n\
         0 g /4\n\
         END\n",
    );
    assert_eq!(note_ons(&seq), vec![(0, 0, 67, 64)]);
}

#[test]
fn test_function_self_call_fails() {
    let err = fail(
        "FUNCTION loop\n\
         CALL loop\n\
         END\n\
         CALL loop\n",
    );
    assert_eq!(err.kind, ErrorKind::Semantic);
    assert!(err.message.contains("calls itself"));
    assert!(err
        .stack
        .iter()
        .any(|f| matches!(f, StackTraceElement::Function { name, .. } if name == "loop")));
}

#[test]
fn test_undefined_function_fails() {
    let err = fail("CALL nothere\n");
    assert_eq!(err.kind, ErrorKind::Semantic);
    assert!(err.message.contains("undefined function"));
}

#[test]
fn test_call_shift_option() {
    let seq = run(
        "FUNCTION riff\n\
         0 c /4\n\
         END\n\
         CALL riff s=12\n",
    );
    assert_eq!(note_ons(&seq), vec![(0, 0, 72, 64)]);
}

#[test]
fn test_pattern_expands_indexed_notes() {
    let seq = run(
        "PATTERN up\n\
         0 /8\n\
         1 /8\n\
         2 /8\n\
         END\n\
         0 c,e,g up\n",
    );
    assert_eq!(
        note_ons(&seq),
        vec![(0, 0, 60, 64), (240, 0, 64, 64), (480, 0, 67, 64)]
    );
    assert_eq!(seq.channel_tick(0), Some(720));
}

#[test]
fn test_pattern_chord_line_and_rest() {
    let seq = run(
        "PATTERN pluck\n\
         0,2 /8\n\
         - /8\n\
         1 /8\n\
         END\n\
         0 c,e,g pluck\n",
    );
    assert_eq!(
        note_ons(&seq),
        vec![(0, 0, 60, 64), (0, 0, 67, 64), (480, 0, 64, 64)]
    );
}

#[test]
fn test_pattern_velocity_restored_after_call() {
    let seq = run(
        "PATTERN loud\n\
         0 /4 v=100\n\
         END\n\
         0 c loud\n\
         0 d /4\n",
    );
    // The pattern's v=100 does not leak into the following line.
    assert_eq!(note_ons(&seq), vec![(0, 0, 60, 100), (480, 0, 62, 64)]);
}

#[test]
fn test_pattern_recursion_depth_limited() {
    let err = fail(
        "PATTERN deep\n\
         0 /8\n\
         0,1,2 deep\n\
         END\n\
         0 c,e,g deep\n",
    );
    assert_eq!(err.kind, ErrorKind::Semantic);
    assert!(err.message.contains("depth"));
    assert!(err
        .stack
        .iter()
        .any(|f| matches!(f, StackTraceElement::Pattern { name, .. } if name == "deep")));
}

#[test]
fn test_pattern_index_out_of_range() {
    let err = fail(
        "PATTERN up\n\
         3 /8\n\
         END\n\
         0 c,e,g up\n",
    );
    assert_eq!(err.kind, ErrorKind::Semantic);
    assert!(err.message.contains("out of range"));
}

#[test]
fn test_chord_definition_expands() {
    let seq = run("CHORD cmaj c,e,g\n0 cmaj /4\n");
    assert_eq!(
        note_ons(&seq),
        vec![(0, 0, 60, 64), (0, 0, 64, 64), (0, 0, 67, 64)]
    );
    // One slot advance for the whole chord.
    assert_eq!(seq.channel_tick(0), Some(480));
}

#[test]
fn test_inline_chord() {
    let seq = run("0 c,g /2\n");
    assert_eq!(note_ons(&seq), vec![(0, 0, 60, 64), (0, 0, 67, 64)]);
    assert_eq!(seq.channel_tick(0), Some(960));
}

#[test]
fn test_chord_redefinition_fails() {
    let err = fail("CHORD x c,e\nCHORD x d,f\n");
    assert_eq!(err.kind, ErrorKind::Semantic);
    assert!(err.message.contains("already defined"));
}

#[test]
fn test_block_quantity() {
    let seq = run("INSTRUMENTS\n0 0 piano\nEND\n{ q=2\n0 c /4\n}\n");
    assert_eq!(note_ons(&seq), vec![(0, 0, 60, 64), (480, 0, 60, 64)]);
    assert_eq!(seq.channel_tick(0), Some(960));
}

#[test]
fn test_block_multiple_restores_tick() {
    let seq = run(
        "INSTRUMENTS\n0 0 piano\nEND\n\
         { m\n\
         0 c /1\n\
         }\n\
         0 d /4\n",
    );
    // d starts where the block started, under the whole note.
    assert_eq!(note_ons(&seq), vec![(0, 0, 60, 64), (0, 0, 62, 64)]);
    assert_eq!(seq.channel_tick(0), Some(480));
}

#[test]
fn test_block_tuplet_applies_to_children() {
    let seq = run("{ t\n0 c /4\n}\n");
    // A quarter inside a triplet block: 480 * 2/3 = 320.
    assert_eq!(seq.channel_tick(0), Some(320));
    assert_eq!(note_offs(&seq), vec![(256, 0, 60)]);
}

#[test]
fn test_nested_block_tuplets_compose() {
    let seq = run("{ t\n{ t\n0 c /4\n}\n}\n");
    // 480 * 2/3 * 2/3, rounded half up.
    assert_eq!(seq.channel_tick(0), Some(213));
}

#[test]
fn test_block_shift() {
    let seq = run("{ s=-12\n0 c /4\n}\n");
    assert_eq!(note_ons(&seq), vec![(0, 0, 48, 64)]);
}

#[test]
fn test_block_conditional_chain() {
    let seq = run(
        "VAR $x = 1\n\
         { if=$x==2\n\
         0 c /4\n\
         }\n\
         { else\n\
         0 d /4\n\
         }\n",
    );
    assert_eq!(note_ons(&seq), vec![(0, 0, 62, 64)]);
}

#[test]
fn test_block_option_on_either_brace() {
    let seq = run("{\n0 c /4\n} q=2\n");
    assert_eq!(note_ons(&seq).len(), 2);
}

#[test]
fn test_block_option_conflict_fails() {
    let err = fail("{ q=2\n0 c /4\n} q=3\n");
    assert!(err.message.contains("more than once"));
}

#[test]
fn test_unclosed_block_fails() {
    let err = fail("{ q=2\n0 c /4\n");
    assert_eq!(err.kind, ErrorKind::Semantic);
    assert!(err.message.contains("unclosed block"));
}

#[test]
fn test_transpose_skips_percussion() {
    let options = CompilerOptions {
        transpose: 12,
        ..CompilerOptions::default()
    };
    let seq = compile_source("test.mpl", "0 c /4\np 60 /4\n", options).unwrap();
    let ons = note_ons(&seq);
    assert!(ons.contains(&(0, 0, 72, 64)));
    assert!(ons.contains(&(0, 9, 60, 64)));
}

#[test]
fn test_note_shift_option() {
    let seq = run("0 c /4 s=7\n");
    assert_eq!(note_ons(&seq), vec![(0, 0, 67, 64)]);
}

#[test]
fn test_shifted_note_out_of_range_fails() {
    let err = fail("0 b+5 /4 s=12\n");
    assert_eq!(err.kind, ErrorKind::MidiConstraint);
}

#[test]
fn test_velocity_and_ratio_persist() {
    let seq = run("0 c /4 v=100, d=50%\n0 d /4\n");
    assert_eq!(note_ons(&seq), vec![(0, 0, 60, 100), (480, 0, 62, 100)]);
    // 50% hold applies to both notes.
    assert_eq!(note_offs(&seq), vec![(240, 0, 60), (720, 0, 62)]);
}

#[test]
fn test_rest_advances_silently() {
    let seq = run("0 c /4\n0 - /4\n0 d /4\n");
    assert_eq!(note_ons(&seq), vec![(0, 0, 60, 64), (960, 0, 62, 64)]);
}

#[test]
fn test_tremolo_subdivides() {
    let seq = run("0 c /2 tr=/8\n");
    let ons = note_ons(&seq);
    assert_eq!(
        ons.iter().map(|(tick, ..)| *tick).collect::<Vec<_>>(),
        vec![0, 240, 480, 720]
    );
    assert_eq!(seq.channel_tick(0), Some(960));
}

#[test]
fn test_constant_substitution() {
    let seq = run("CONST $forte = v=95\n0 c /4 $forte\n");
    assert_eq!(note_ons(&seq), vec![(0, 0, 60, 95)]);
}

#[test]
fn test_constant_redefinition_fails() {
    let err = fail("CONST $x = 1\nCONST $x = 2\n");
    assert_eq!(err.kind, ErrorKind::Semantic);
}

#[test]
fn test_variable_reassignment() {
    let seq = run("VAR $n = c\n0 $n /4\nVAR $n = d\n0 $n /4\n");
    assert_eq!(note_ons(&seq), vec![(0, 0, 60, 64), (480, 0, 62, 64)]);
}

#[test]
fn test_undefined_variable_fails() {
    let err = fail("0 $nope /4\n");
    assert_eq!(err.kind, ErrorKind::Semantic);
    assert!(err.message.contains("undefined variable"));
    assert_eq!(err.line, Some(1));
}

#[test]
fn test_define_respells_keyword() {
    let seq = run("DEFINE CHORD Akkord\nAkkord cmaj c,e,g\n0 cmaj /4\n");
    assert_eq!(note_ons(&seq).len(), 3);
}

#[test]
fn test_meta_block() {
    let seq = run("META\ntitle My Song\ncomposer Someone\nEND\n0 c /4\n");
    assert_eq!(seq.meta.title.as_deref(), Some("My Song"));
    assert_eq!(seq.meta.composer.as_deref(), Some("Someone"));
    let events = seq.recorder.sorted_events();
    assert!(events.iter().any(|e| matches!(
        &e.event,
        Event::Text { text, .. } if text == "My Song"
    )));
}

#[test]
fn test_instruments_configures_program() {
    let seq = run("INSTRUMENTS\n0 24 my guitar\nEND\n0 c /4\n");
    let events = seq.recorder.sorted_events();
    assert!(events.iter().any(|e| e.tick == 0
        && e.event
            == Event::ProgramChange {
                channel: 0,
                program: 24
            }));
}

#[test]
fn test_second_instruments_block_switches() {
    let seq = run(
        "INSTRUMENTS\n0 0 piano\nEND\n\
         0 c /4\n\
         INSTRUMENTS\n0 24 guitar\nEND\n\
         0 d /4\n",
    );
    let events = seq.recorder.sorted_events();
    assert!(events.iter().any(|e| e.tick == 480
        && e.event
            == Event::ProgramChange {
                channel: 0,
                program: 24
            }));
}

#[test]
fn test_duplicate_instruments_channel_fails() {
    let err = fail("INSTRUMENTS\n0 0 piano\n0 24 guitar\nEND\n");
    assert_eq!(err.kind, ErrorKind::Semantic);
    assert!(err.message.contains("configured twice"));
}

#[test]
fn test_unknown_command_reports_location() {
    let err = fail("0 c /4\nbogus x y\n");
    assert_eq!(err.kind, ErrorKind::Syntax);
    assert_eq!(err.line, Some(2));
    assert!(err.line_content.as_deref().unwrap_or("").contains("bogus"));
}

#[test]
fn test_missing_end_fails() {
    let err = fail("FUNCTION f\n0 c /4\n");
    assert_eq!(err.kind, ErrorKind::Semantic);
    assert!(err.message.contains("missing END"));
}

#[test]
fn test_nested_mode_blocks_fail() {
    let err = fail("FUNCTION f\nMETA\nEND\nEND\n");
    assert_eq!(err.kind, ErrorKind::Semantic);
    assert!(err.message.contains("nested"));
}

#[test]
fn test_bad_condition_fails_before_emission() {
    // The malformed condition sits on a line that would never play, but the
    // pre-check pass still rejects it.
    let err = fail(
        "VAR $x = 1\n\
         0 c /4 if=$x==1\n\
         0 d /4 elsif=a b c\n",
    );
    assert_eq!(err.kind, ErrorKind::Syntax);
}

#[test]
fn test_lyrics_emitted_at_note_start() {
    let seq = run("0 c /4\n0 d /4 l=la\n");
    let events = seq.recorder.sorted_events();
    assert!(events.iter().any(|e| e.tick == 480
        && matches!(&e.event, Event::Text { text, .. } if text == "la")));
}

#[test]
fn test_smf_output_header() {
    let seq = run("0 c /4\n");
    let midi = seq.to_midi_bytes();
    assert_eq!(&midi[0..4], b"MThd");
    assert_eq!(&midi[8..10], &[0, 1]);
    assert_eq!(&midi[12..14], &480u16.to_be_bytes());
}

#[test]
fn test_resolution_outside_smf_range_rejected() {
    // The SMF division word only holds 15 bits of ticks per quarter.
    for resolution in [0u32, 32768, 70000] {
        let options = CompilerOptions {
            resolution,
            ..CompilerOptions::default()
        };
        let err = compile_source("test.mpl", "0 c /4\n", options).unwrap_err();
        assert_eq!(err.kind, ErrorKind::MidiConstraint);
        assert!(err.message.contains("resolution out of range"));
    }
    let options = CompilerOptions {
        resolution: 32767,
        ..CompilerOptions::default()
    };
    assert!(compile_source("test.mpl", "0 c /4\n", options).is_ok());
}

#[test]
fn test_include_merges_and_reports_origin() {
    let dir = tempfile::tempdir().unwrap();
    let lib = dir.path().join("lib.mpl");
    let main = dir.path().join("main.mpl");
    std::fs::write(&lib, "CHORD cmaj c,e,g\n").unwrap();
    std::fs::write(&main, "INCLUDE lib.mpl\n0 cmaj /4\n").unwrap();

    let seq = compile(&main, CompilerOptions::default()).unwrap();
    assert_eq!(note_ons(&seq).len(), 3);
}

#[test]
fn test_include_error_points_into_included_file() {
    let dir = tempfile::tempdir().unwrap();
    let lib = dir.path().join("lib.mpl");
    let main = dir.path().join("main.mpl");
    std::fs::write(&lib, "bogus x y\n").unwrap();
    std::fs::write(&main, "INCLUDE lib.mpl\n").unwrap();

    let err = compile(&main, CompilerOptions::default()).unwrap_err();
    assert_eq!(err.file.as_deref(), Some(lib.as_path()));
    assert_eq!(err.line, Some(1));
    assert!(err
        .stack
        .iter()
        .any(|f| matches!(f, StackTraceElement::Include { line: 1, .. })));
}

#[test]
fn test_circular_include_fails() {
    let dir = tempfile::tempdir().unwrap();
    let a = dir.path().join("a.mpl");
    let b = dir.path().join("b.mpl");
    std::fs::write(&a, "INCLUDE b.mpl\n").unwrap();
    std::fs::write(&b, "INCLUDE a.mpl\n").unwrap();

    let err = compile(&a, CompilerOptions::default()).unwrap_err();
    assert_eq!(err.kind, ErrorKind::Semantic);
    assert!(err.message.contains("circular include"));
}

#[test]
fn test_missing_include_fails() {
    let err = fail("INCLUDE nosuch.mpl\n");
    assert_eq!(err.kind, ErrorKind::Io);
}
