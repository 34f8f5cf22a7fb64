//! Event sink: where the compiler's output goes.
//!
//! The core treats its output as an append-only, tick-ordered event log
//! keyed by channel, behind the [`EventSink`] trait so alternative backends
//! (tests, live players) can be dropped in. [`SequenceRecorder`] is the
//! standard implementation: an in-memory log with a Standard MIDI File
//! (format 1) encoder.

use serde::{Deserialize, Serialize};

/// Which logical track a text event belongs on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TextKind {
    TrackName,
    Copyright,
    Text,
    Lyrics,
}

/// One event, without its tick.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Event {
    NoteOn {
        channel: u8,
        note: u8,
        velocity: u8,
    },
    NoteOff {
        channel: u8,
        note: u8,
    },
    ProgramChange {
        channel: u8,
        program: u8,
    },
    BankSelect {
        channel: u8,
        value: u8,
        lsb: bool,
    },
    Tempo {
        bpm: u16,
    },
    TimeSignature {
        numerator: u8,
        denominator: u8,
    },
    KeySignature {
        sharps: i8,
        major: bool,
    },
    Text {
        kind: TextKind,
        text: String,
    },
    /// Free-form channel comment from INSTRUMENTS, kept for diagnostics.
    ChannelComment {
        channel: u8,
        comment: String,
    },
}

impl Event {
    /// The channel this event belongs to, if any.
    pub fn channel(&self) -> Option<u8> {
        match self {
            Event::NoteOn { channel, .. }
            | Event::NoteOff { channel, .. }
            | Event::ProgramChange { channel, .. }
            | Event::BankSelect { channel, .. }
            | Event::ChannelComment { channel, .. } => Some(*channel),
            _ => None,
        }
    }
}

/// An event at a tick position.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimedEvent {
    pub tick: u64,
    pub event: Event,
}

/// The interface the compiler needs from its output backend.
pub trait EventSink {
    fn reset(&mut self, resolution: u32);
    fn init_channel(&mut self, channel: u8, program: u8, comment: &str, tick: u64);
    fn set_bank(&mut self, channel: u8, tick: u64, value: u8, is_lsb: bool);
    fn add_note_on(&mut self, channel: u8, note: u8, tick: u64, velocity: u8);
    fn add_note_off(&mut self, channel: u8, note: u8, tick: u64);
    fn add_tempo(&mut self, bpm: u16, tick: u64);
    fn add_time_signature(&mut self, numerator: u8, denominator: u8, tick: u64);
    fn add_key_signature(&mut self, sharps: i8, major: bool, tick: u64);
    fn add_text(&mut self, kind: TextKind, text: &str, tick: u64);
    /// Retroactively move a note-off. Used by legato correction to pull an
    /// earlier release to one tick before a new strike of the same note.
    fn move_note_off(&mut self, channel: u8, note: u8, from_tick: u64, to_tick: u64);
    fn resolution(&self) -> u32;
}

/// In-memory, tick-ordered event log.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SequenceRecorder {
    resolution: u32,
    events: Vec<TimedEvent>,
}

impl SequenceRecorder {
    pub fn new(resolution: u32) -> Self {
        SequenceRecorder {
            resolution,
            events: Vec::new(),
        }
    }

    /// All events in insertion order (tick order only after
    /// [`sorted_events`](Self::sorted_events)).
    pub fn events(&self) -> &[TimedEvent] {
        &self.events
    }

    /// Events sorted by tick. The sort is stable, so events at the same
    /// tick keep their emission order (a note-off recorded before a
    /// note-on at the same tick stays first).
    pub fn sorted_events(&self) -> Vec<TimedEvent> {
        let mut sorted = self.events.clone();
        sorted.sort_by_key(|e| e.tick);
        sorted
    }

    /// Channels that carry at least one event.
    pub fn used_channels(&self) -> Vec<u8> {
        let mut channels: Vec<u8> = self
            .events
            .iter()
            .filter_map(|e| e.event.channel())
            .collect();
        channels.sort_unstable();
        channels.dedup();
        channels
    }

    fn push(&mut self, tick: u64, event: Event) {
        self.events.push(TimedEvent { tick, event });
    }

    /// Encode as a Standard MIDI File, format 1: one meta track followed by
    /// one track per used channel.
    pub fn to_midi_bytes(&self) -> Vec<u8> {
        let sorted = self.sorted_events();

        let mut tracks: Vec<Vec<u8>> = Vec::new();

        // Track 0: meta events only.
        let meta: Vec<&TimedEvent> = sorted
            .iter()
            .filter(|e| e.event.channel().is_none())
            .collect();
        tracks.push(encode_track(&meta));

        for channel in self.used_channels() {
            let channel_events: Vec<&TimedEvent> = sorted
                .iter()
                .filter(|e| e.event.channel() == Some(channel))
                .collect();
            tracks.push(encode_track(&channel_events));
        }

        let mut out = Vec::new();
        out.extend_from_slice(b"MThd");
        out.extend_from_slice(&6u32.to_be_bytes());
        out.extend_from_slice(&1u16.to_be_bytes()); // format 1
        out.extend_from_slice(&(tracks.len() as u16).to_be_bytes());
        out.extend_from_slice(&(self.resolution as u16).to_be_bytes());
        for track in tracks {
            out.extend_from_slice(b"MTrk");
            out.extend_from_slice(&(track.len() as u32).to_be_bytes());
            out.extend(track);
        }
        out
    }
}

impl EventSink for SequenceRecorder {
    fn reset(&mut self, resolution: u32) {
        self.resolution = resolution;
        self.events.clear();
    }

    fn init_channel(&mut self, channel: u8, program: u8, comment: &str, tick: u64) {
        self.push(tick, Event::ProgramChange { channel, program });
        if !comment.is_empty() {
            self.push(
                tick,
                Event::ChannelComment {
                    channel,
                    comment: comment.to_string(),
                },
            );
        }
    }

    fn set_bank(&mut self, channel: u8, tick: u64, value: u8, is_lsb: bool) {
        self.push(
            tick,
            Event::BankSelect {
                channel,
                value,
                lsb: is_lsb,
            },
        );
    }

    fn add_note_on(&mut self, channel: u8, note: u8, tick: u64, velocity: u8) {
        self.push(
            tick,
            Event::NoteOn {
                channel,
                note,
                velocity,
            },
        );
    }

    fn add_note_off(&mut self, channel: u8, note: u8, tick: u64) {
        self.push(tick, Event::NoteOff { channel, note });
    }

    fn add_tempo(&mut self, bpm: u16, tick: u64) {
        self.push(tick, Event::Tempo { bpm });
    }

    fn add_time_signature(&mut self, numerator: u8, denominator: u8, tick: u64) {
        self.push(
            tick,
            Event::TimeSignature {
                numerator,
                denominator,
            },
        );
    }

    fn add_key_signature(&mut self, sharps: i8, major: bool, tick: u64) {
        self.push(tick, Event::KeySignature { sharps, major });
    }

    fn add_text(&mut self, kind: TextKind, text: &str, tick: u64) {
        self.push(
            tick,
            Event::Text {
                kind,
                text: text.to_string(),
            },
        );
    }

    fn move_note_off(&mut self, channel: u8, note: u8, from_tick: u64, to_tick: u64) {
        // Search backwards: the off being corrected is always the most
        // recently recorded one for this channel/note.
        for timed in self.events.iter_mut().rev() {
            if timed.tick == from_tick
                && matches!(
                    timed.event,
                    Event::NoteOff { channel: c, note: n } if c == channel && n == note
                )
            {
                timed.tick = to_tick;
                return;
            }
        }
    }

    fn resolution(&self) -> u32 {
        self.resolution
    }
}

fn encode_track(events: &[&TimedEvent]) -> Vec<u8> {
    let mut out = Vec::new();
    let mut last_tick = 0u64;

    for timed in events {
        let delta = timed.tick.saturating_sub(last_tick);
        out.extend(encode_variable_length(delta as u32));
        out.extend(encode_event(&timed.event));
        last_tick = timed.tick;
    }

    // End of track.
    out.extend(&[0x00, 0xFF, 0x2F, 0x00]);
    out
}

fn encode_event(event: &Event) -> Vec<u8> {
    match event {
        Event::NoteOn {
            channel,
            note,
            velocity,
        } => vec![0x90 | (channel & 0x0F), *note, *velocity],
        Event::NoteOff { channel, note } => vec![0x80 | (channel & 0x0F), *note, 0],
        Event::ProgramChange { channel, program } => {
            vec![0xC0 | (channel & 0x0F), program & 0x7F]
        }
        Event::BankSelect { channel, value, lsb } => {
            let controller = if *lsb { 0x20 } else { 0x00 };
            vec![0xB0 | (channel & 0x0F), controller, value & 0x7F]
        }
        Event::Tempo { bpm } => {
            let us_per_beat = 60_000_000u32 / (*bpm).max(1) as u32;
            vec![
                0xFF,
                0x51,
                0x03,
                ((us_per_beat >> 16) & 0xFF) as u8,
                ((us_per_beat >> 8) & 0xFF) as u8,
                (us_per_beat & 0xFF) as u8,
            ]
        }
        Event::TimeSignature {
            numerator,
            denominator,
        } => {
            // Denominator is stored as a power of two.
            let power = denominator.trailing_zeros() as u8;
            vec![0xFF, 0x58, 0x04, *numerator, power, 24, 8]
        }
        Event::KeySignature { sharps, major } => {
            vec![0xFF, 0x59, 0x02, *sharps as u8, u8::from(!*major)]
        }
        Event::Text { kind, text } => {
            let meta_type = match kind {
                TextKind::Text => 0x01,
                TextKind::Copyright => 0x02,
                TextKind::TrackName => 0x03,
                TextKind::Lyrics => 0x05,
            };
            let bytes = text.as_bytes();
            let mut out = vec![0xFF, meta_type];
            out.extend(encode_variable_length(bytes.len() as u32));
            out.extend_from_slice(bytes);
            out
        }
        // Diagnostics only; rendered as a MIDI text event.
        Event::ChannelComment { comment, .. } => {
            let bytes = comment.as_bytes();
            let mut out = vec![0xFF, 0x01];
            out.extend(encode_variable_length(bytes.len() as u32));
            out.extend_from_slice(bytes);
            out
        }
    }
}

/// Encode a value as a MIDI variable-length quantity.
fn encode_variable_length(mut value: u32) -> Vec<u8> {
    if value == 0 {
        return vec![0];
    }

    let mut bytes = Vec::new();
    bytes.push((value & 0x7F) as u8);
    value >>= 7;

    while value > 0 {
        bytes.push(((value & 0x7F) | 0x80) as u8);
        value >>= 7;
    }

    bytes.reverse();
    bytes
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_variable_length_encoding() {
        assert_eq!(encode_variable_length(0), vec![0x00]);
        assert_eq!(encode_variable_length(127), vec![0x7F]);
        assert_eq!(encode_variable_length(128), vec![0x81, 0x00]);
        assert_eq!(encode_variable_length(16383), vec![0xFF, 0x7F]);
        assert_eq!(encode_variable_length(16384), vec![0x81, 0x80, 0x00]);
    }

    #[test]
    fn test_recorder_orders_by_tick() {
        let mut rec = SequenceRecorder::new(480);
        rec.add_note_on(0, 60, 0, 80);
        rec.add_note_off(0, 60, 384);
        rec.add_note_on(0, 62, 480, 80);
        rec.add_note_off(0, 62, 864);

        let sorted = rec.sorted_events();
        let ticks: Vec<u64> = sorted.iter().map(|e| e.tick).collect();
        assert_eq!(ticks, vec![0, 384, 480, 864]);
    }

    #[test]
    fn test_move_note_off() {
        let mut rec = SequenceRecorder::new(480);
        rec.add_note_on(0, 60, 0, 80);
        rec.add_note_off(0, 60, 720);
        rec.add_note_on(0, 60, 480, 80);

        rec.move_note_off(0, 60, 720, 479);

        let sorted = rec.sorted_events();
        assert_eq!(sorted[1].tick, 479);
        assert!(matches!(sorted[1].event, Event::NoteOff { note: 60, .. }));
    }

    #[test]
    fn test_move_note_off_targets_most_recent() {
        let mut rec = SequenceRecorder::new(480);
        rec.add_note_off(1, 60, 100);
        rec.add_note_off(1, 60, 100);
        rec.move_note_off(1, 60, 100, 99);

        // Exactly one of the two moved, and it is the later-recorded one.
        assert_eq!(rec.events()[0].tick, 100);
        assert_eq!(rec.events()[1].tick, 99);
    }

    #[test]
    fn test_smf_header() {
        let mut rec = SequenceRecorder::new(480);
        rec.add_tempo(120, 0);
        rec.add_note_on(0, 60, 0, 80);
        rec.add_note_off(0, 60, 384);

        let midi = rec.to_midi_bytes();
        assert_eq!(&midi[0..4], b"MThd");
        assert_eq!(&midi[8..10], &[0, 1]); // format 1
        assert_eq!(&midi[10..12], &[0, 2]); // meta track + one channel track
        assert_eq!(&midi[12..14], &480u16.to_be_bytes());
    }

    #[test]
    fn test_separate_tracks_per_channel() {
        let mut rec = SequenceRecorder::new(480);
        rec.add_note_on(0, 60, 0, 80);
        rec.add_note_off(0, 60, 100);
        rec.add_note_on(5, 64, 0, 80);
        rec.add_note_off(5, 64, 100);

        assert_eq!(rec.used_channels(), vec![0, 5]);
        let midi = rec.to_midi_bytes();
        assert_eq!(&midi[10..12], &[0, 3]);
    }

    #[test]
    fn test_reset_clears() {
        let mut rec = SequenceRecorder::new(480);
        rec.add_note_on(0, 60, 0, 80);
        rec.reset(960);
        assert!(rec.events().is_empty());
        assert_eq!(rec.resolution(), 960);
    }
}
