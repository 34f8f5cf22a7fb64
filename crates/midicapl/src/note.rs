//! Note name and instrument name resolution.
//!
//! Note tokens are either bare MIDI numbers (0-127) or note names in the
//! `c`/`c#`/`db` style with octave arithmetic: `c` is middle C (60), `c+`
//! one octave up, `c-2` two octaves down, `c+3` three up.

use winnow::combinator::{alt, opt};
use winnow::prelude::*;
use winnow::token::{one_of, take_while};

use crate::error::{CompileError, Result};

type PResult<T> = winnow::ModalResult<T>;

/// Middle C.
const BASE_NOTE: i16 = 60;

/// Resolve a note token to a MIDI note number, before transposition/shift.
pub fn parse_note(token: &str) -> Result<u8> {
    if token.chars().all(|c| c.is_ascii_digit()) {
        let number: u16 = token
            .parse()
            .map_err(|_| CompileError::syntax(format!("invalid note number: {token}")))?;
        if number > 127 {
            return Err(CompileError::midi(format!(
                "note number out of range 0-127: {token}"
            )));
        }
        return Ok(number as u8);
    }

    let mut input = token;
    match named_note.parse_next(&mut input) {
        Ok(value) if input.is_empty() && (0..=127).contains(&value) => Ok(value as u8),
        Ok(_) if input.is_empty() => Err(CompileError::midi(format!(
            "note out of MIDI range 0-127: {token}"
        ))),
        _ => Err(CompileError::syntax(format!("unknown note: {token}"))),
    }
}

fn named_note(input: &mut &str) -> PResult<i16> {
    let letter = one_of(['c', 'd', 'e', 'f', 'g', 'a', 'b']).parse_next(input)?;
    let semitone = match letter {
        'c' => 0,
        'd' => 2,
        'e' => 4,
        'f' => 5,
        'g' => 7,
        'a' => 9,
        'b' => 11,
        _ => unreachable!(),
    };

    let accidental: i16 = alt((
        "##".map(|_| 2),
        "#".map(|_| 1),
        "bb".map(|_| -2),
        "b".map(|_| -1),
        "".map(|_| 0),
    ))
    .parse_next(input)?;

    let octaves = octave_shift(input)?;
    Ok(BASE_NOTE + semitone + accidental + octaves * 12)
}

/// `+`/`-` octave arithmetic: `+` = +1 octave, `+3` = +3, `--` = -2.
fn octave_shift(input: &mut &str) -> PResult<i16> {
    let sign = opt(one_of(['+', '-'])).parse_next(input)?;
    let Some(sign) = sign else {
        return Ok(0);
    };
    let direction: i16 = if sign == '+' { 1 } else { -1 };

    let digits: &str = take_while(0.., |c: char| c.is_ascii_digit()).parse_next(input)?;
    if !digits.is_empty() {
        let n: i16 = digits.parse().unwrap_or(0);
        return Ok(direction * n);
    }

    // Repeated signs: c++ / c--
    let more: Vec<char> = winnow::combinator::repeat(0.., one_of(['+', '-'])).parse_next(input)?;
    let extra = more.iter().filter(|c| **c == sign).count() as i16;
    Ok(direction * (1 + extra))
}

/// General MIDI program names, indexed by program number.
const GM_PROGRAMS: [&str; 128] = [
    "acoustic_grand_piano",
    "bright_acoustic_piano",
    "electric_grand_piano",
    "honky_tonk_piano",
    "electric_piano_1",
    "electric_piano_2",
    "harpsichord",
    "clavinet",
    "celesta",
    "glockenspiel",
    "music_box",
    "vibraphone",
    "marimba",
    "xylophone",
    "tubular_bells",
    "dulcimer",
    "drawbar_organ",
    "percussive_organ",
    "rock_organ",
    "church_organ",
    "reed_organ",
    "accordion",
    "harmonica",
    "tango_accordion",
    "nylon_guitar",
    "steel_guitar",
    "jazz_guitar",
    "clean_guitar",
    "muted_guitar",
    "overdriven_guitar",
    "distortion_guitar",
    "guitar_harmonics",
    "acoustic_bass",
    "finger_bass",
    "pick_bass",
    "fretless_bass",
    "slap_bass_1",
    "slap_bass_2",
    "synth_bass_1",
    "synth_bass_2",
    "violin",
    "viola",
    "cello",
    "contrabass",
    "tremolo_strings",
    "pizzicato_strings",
    "orchestral_harp",
    "timpani",
    "string_ensemble_1",
    "string_ensemble_2",
    "synth_strings_1",
    "synth_strings_2",
    "choir_aahs",
    "voice_oohs",
    "synth_voice",
    "orchestra_hit",
    "trumpet",
    "trombone",
    "tuba",
    "muted_trumpet",
    "french_horn",
    "brass_section",
    "synth_brass_1",
    "synth_brass_2",
    "soprano_sax",
    "alto_sax",
    "tenor_sax",
    "baritone_sax",
    "oboe",
    "english_horn",
    "bassoon",
    "clarinet",
    "piccolo",
    "flute",
    "recorder",
    "pan_flute",
    "blown_bottle",
    "shakuhachi",
    "whistle",
    "ocarina",
    "lead_1_square",
    "lead_2_sawtooth",
    "lead_3_calliope",
    "lead_4_chiff",
    "lead_5_charang",
    "lead_6_voice",
    "lead_7_fifths",
    "lead_8_bass_lead",
    "pad_1_new_age",
    "pad_2_warm",
    "pad_3_polysynth",
    "pad_4_choir",
    "pad_5_bowed",
    "pad_6_metallic",
    "pad_7_halo",
    "pad_8_sweep",
    "fx_1_rain",
    "fx_2_soundtrack",
    "fx_3_crystal",
    "fx_4_atmosphere",
    "fx_5_brightness",
    "fx_6_goblins",
    "fx_7_echoes",
    "fx_8_sci_fi",
    "sitar",
    "banjo",
    "shamisen",
    "koto",
    "kalimba",
    "bagpipe",
    "fiddle",
    "shanai",
    "tinkle_bell",
    "agogo",
    "steel_drums",
    "woodblock",
    "taiko_drum",
    "melodic_tom",
    "synth_drum",
    "reverse_cymbal",
    "guitar_fret_noise",
    "breath_noise",
    "seashore",
    "bird_tweet",
    "telephone_ring",
    "helicopter",
    "applause",
    "gunshot",
];

/// Common short aliases on top of the canonical GM names.
fn program_alias(name: &str) -> Option<u8> {
    let program = match name {
        "piano" => 0,
        "organ" => 19,
        "guitar" => 24,
        "bass" => 32,
        "strings" => 48,
        "sax" => 65,
        _ => return None,
    };
    Some(program)
}

/// Resolve an instrument token to a GM program number. Accepts a bare
/// number, a canonical GM name, or a short alias; case-insensitive, with
/// spaces and dashes treated as underscores.
pub fn parse_instrument(token: &str) -> Result<u8> {
    if token.chars().all(|c| c.is_ascii_digit()) {
        let number: u16 = token
            .parse()
            .map_err(|_| CompileError::syntax(format!("invalid instrument number: {token}")))?;
        if number > 127 {
            return Err(CompileError::midi(format!(
                "instrument number out of range 0-127: {token}"
            )));
        }
        return Ok(number as u8);
    }

    let normalized: String = token
        .to_lowercase()
        .chars()
        .map(|c| if c == ' ' || c == '-' { '_' } else { c })
        .collect();

    if let Some(program) = program_alias(&normalized) {
        return Ok(program);
    }
    GM_PROGRAMS
        .iter()
        .position(|name| *name == normalized)
        .map(|idx| idx as u8)
        .ok_or_else(|| CompileError::semantic(format!("unknown instrument: {token}")))
}

/// The display name for a program number.
pub fn instrument_name(program: u8) -> &'static str {
    GM_PROGRAMS[(program & 0x7F) as usize]
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_numeric_notes() {
        assert_eq!(parse_note("0").unwrap(), 0);
        assert_eq!(parse_note("60").unwrap(), 60);
        assert_eq!(parse_note("127").unwrap(), 127);
        assert!(parse_note("128").is_err());
    }

    #[test]
    fn test_named_notes() {
        assert_eq!(parse_note("c").unwrap(), 60);
        assert_eq!(parse_note("c#").unwrap(), 61);
        assert_eq!(parse_note("db").unwrap(), 61);
        assert_eq!(parse_note("b").unwrap(), 71);
        assert_eq!(parse_note("a").unwrap(), 69);
    }

    #[test]
    fn test_octave_arithmetic() {
        assert_eq!(parse_note("c+").unwrap(), 72);
        assert_eq!(parse_note("c+2").unwrap(), 84);
        assert_eq!(parse_note("c++").unwrap(), 84);
        assert_eq!(parse_note("c-").unwrap(), 48);
        assert_eq!(parse_note("c-5").unwrap(), 0);
        assert!(parse_note("c-6").is_err()); // below 0
    }

    #[test]
    fn test_bad_notes() {
        assert!(parse_note("h").is_err());
        assert!(parse_note("c%").is_err());
        assert!(parse_note("").is_err());
    }

    #[test]
    fn test_instruments() {
        assert_eq!(parse_instrument("0").unwrap(), 0);
        assert_eq!(parse_instrument("VIOLIN").unwrap(), 40);
        assert_eq!(parse_instrument("acoustic grand piano").unwrap(), 0);
        assert_eq!(parse_instrument("piano").unwrap(), 0);
        assert_eq!(parse_instrument("steel-drums").unwrap(), 114);
        assert!(parse_instrument("kazoo").is_err());
        assert!(parse_instrument("128").is_err());
    }

    #[test]
    fn test_instrument_names_round() {
        assert_eq!(instrument_name(40), "violin");
        assert_eq!(parse_instrument(instrument_name(77)).unwrap(), 77);
    }
}
