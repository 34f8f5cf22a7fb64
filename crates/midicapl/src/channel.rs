//! Per-channel playback state.
//!
//! One [`ChannelState`] per MIDI channel carries the tick cursor, the
//! current velocity and duration ratio, and enough note history to detect
//! legato overlap: a note struck again before its previous occurrence was
//! released must have that earlier note-off pulled back to one tick before
//! the new note-on, or the two would merge audibly.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// Default velocity for channels never configured explicitly.
pub const DEFAULT_VELOCITY: u8 = 64;

/// Default fraction of a note slot that is actually held down.
pub const DEFAULT_DURATION_RATIO: f32 = 0.8;

/// The percussion channel, exempt from transposition.
pub const PERCUSSION_CHANNEL: u8 = 9;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChannelState {
    pub channel: u8,
    pub program: u8,
    pub bank_msb: u8,
    pub bank_lsb: u8,
    pub instrument_name: String,
    /// True for channels synthesized with defaults because they were never
    /// mentioned in an INSTRUMENTS block.
    pub auto_assigned: bool,
    pub velocity: u8,
    /// Held fraction of each note slot. Invariant: > 0. Values above 1.0
    /// mean legato (notes overlap their successors).
    pub duration_ratio: f32,
    pub current_tick: u64,
    last_note_on: HashMap<u8, u64>,
    last_note_off: HashMap<u8, u64>,
    pending_correction: Option<u64>,
}

impl ChannelState {
    /// An auto-assigned channel with defaults.
    pub fn auto(channel: u8) -> Self {
        ChannelState {
            channel,
            program: 0,
            bank_msb: 0,
            bank_lsb: 0,
            instrument_name: String::new(),
            auto_assigned: true,
            velocity: DEFAULT_VELOCITY,
            duration_ratio: DEFAULT_DURATION_RATIO,
            current_tick: 0,
            last_note_on: HashMap::new(),
            last_note_off: HashMap::new(),
            pending_correction: None,
        }
    }

    /// A channel configured by an INSTRUMENTS entry.
    pub fn configured(channel: u8, program: u8, name: impl Into<String>) -> Self {
        ChannelState {
            program,
            instrument_name: name.into(),
            auto_assigned: false,
            ..Self::auto(channel)
        }
    }

    /// Strike a note: advance the cursor by `duration` ticks and return the
    /// tick where the note-off belongs (press length scaled by the duration
    /// ratio, at least one tick).
    ///
    /// If this note number is still sounding from an earlier strike, the
    /// earlier off-tick is remembered and exposed via
    /// [`take_stop_tick_to_correct`](Self::take_stop_tick_to_correct) so the
    /// caller can retroactively move it to `on_tick - 1`.
    pub fn add_note(&mut self, note: u8, duration: u64) -> u64 {
        let on_tick = self.current_tick;
        let press = ((duration as f64 * self.duration_ratio as f64).round() as u64).max(1);
        let off_tick = on_tick + press;

        if let (Some(&prev_on), Some(&prev_off)) =
            (self.last_note_on.get(&note), self.last_note_off.get(&note))
        {
            // Overlap: the previous strike has not been released by the
            // time this one begins.
            if prev_on < on_tick && prev_off >= on_tick {
                self.pending_correction = Some(prev_off);
            }
        }

        self.last_note_on.insert(note, on_tick);
        self.last_note_off.insert(note, off_tick);
        self.current_tick = on_tick + duration;
        off_tick
    }

    /// Advance the cursor without striking anything.
    pub fn add_rest(&mut self, duration: u64) {
        self.current_tick += duration;
    }

    /// The off-tick of an earlier overlapping note, if the last
    /// [`add_note`](Self::add_note) detected one. Consumed on read.
    pub fn take_stop_tick_to_correct(&mut self) -> Option<u64> {
        self.pending_correction.take()
    }

    /// Set the velocity for subsequent notes (1-127).
    pub fn set_velocity(&mut self, velocity: u8) {
        self.velocity = velocity;
    }

    /// Set the duration ratio for subsequent notes. Caller validates > 0.
    pub fn set_duration_ratio(&mut self, ratio: f32) {
        debug_assert!(ratio > 0.0);
        self.duration_ratio = ratio;
    }
}
