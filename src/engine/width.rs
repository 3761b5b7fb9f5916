//! Width and spacing — the minimum halo (`w_left`, `w_right`) of every symbol
//! and its elastic advance (`shrink`, `space`, `stretch`) from the previous
//! moment of the line.

use std::collections::HashMap;

use crate::model::*;
use super::constants::*;

// ═══════════════════════════════════════════════════════════════════════
// Duration spacing
// ═══════════════════════════════════════════════════════════════════════

/// Natural advance for a time distance.
///
/// Piecewise linear between the anchors of the power-of-two durations, so
/// doubling a duration multiplies its space by about 1.41.
pub fn nwidth(len: i32) -> f64 {
    let band = |len: i32, lo: i32, hi: i32, w_lo: f64, w_hi: f64| {
        w_lo + (len - lo) as f64 * (w_hi - w_lo) / (hi - lo) as f64
    };
    if len >= WHOLE {
        band(len, WHOLE, BREVE, SPACE_WHOLE, SPACE_BREVE)
    } else if len >= HALF {
        band(len, HALF, WHOLE, SPACE_HALF, SPACE_WHOLE)
    } else if len >= QUARTER {
        band(len, QUARTER, HALF, SPACE_QUARTER, SPACE_HALF)
    } else if len >= EIGHTH {
        band(len, EIGHTH, QUARTER, SPACE_EIGHTH, SPACE_QUARTER)
    } else if len >= SIXTEENTH {
        band(len, SIXTEENTH, EIGHTH, SPACE_SIXTEENTH, SPACE_EIGHTH)
    } else {
        SPACE_SHORT_BASE + len.max(0) as f64 * (SPACE_SIXTEENTH - SPACE_SHORT_BASE) / SIXTEENTH as f64
    }
}

/// Estimated rendered width of a text run.
pub(crate) fn text_width(text: &str, size: f64) -> f64 {
    text.chars().count() as f64 * size * TEXT_WIDTH_FACTOR
}

pub(crate) fn head_half_width(s: &Symbol) -> f64 {
    if s.flags.grace {
        return HW_GRACE;
    }
    match s.head {
        HeadType::Breve => HW_BREVE,
        HeadType::Whole => HW_WHOLE,
        HeadType::Half | HeadType::Filled => HW_FILLED,
    }
}

/// Extents of a bar glyph left and right of its x.
pub(crate) fn bar_extents(bar_type: BarType) -> (f64, f64) {
    match bar_type {
        BarType::Single | BarType::Dotted | BarType::Invisible => (0.0, 0.0),
        BarType::Double => BAR_DOUBLE,
        BarType::ThinThick => BAR_THIN_THICK,
        BarType::ThickThin => BAR_THICK_THIN,
        BarType::LeftRepeat => BAR_LEFT_REPEAT,
        BarType::RightRepeat => BAR_RIGHT_REPEAT,
        BarType::DoubleRepeat => BAR_DOUBLE_REPEAT,
    }
}

/// Width of a key signature including cancellation naturals.
pub(crate) fn key_width(key: &KeySig) -> f64 {
    let count = key.sharps.unsigned_abs() + key.naturals();
    if count == 0 {
        return 0.0;
    }
    let mut w = count as f64 * KEY_ACC_SPACE;
    if key.switches_sign() {
        w += KEY_SWITCH_BUFFER;
    }
    w
}

pub(crate) fn meter_width(meter: &Meter) -> f64 {
    let digits = meter.top.to_string().len().max(meter.bottom.to_string().len());
    digits as f64 * METER_DIGIT_WIDTH
}

fn has_ledger(s: &Symbol) -> Option<bool> {
    let (lo, hi) = s.step_range()?;
    if lo < -1 {
        Some(false)
    } else if hi > 9 {
        Some(true)
    } else {
        None
    }
}

// ═══════════════════════════════════════════════════════════════════════
// Symbol widths
// ═══════════════════════════════════════════════════════════════════════

/// Set `w_left` and `w_right` of every symbol of a line.
pub fn set_widths(tune: &mut Tune, ids: &[SymbolId]) {
    let mut prev_note: HashMap<usize, SymbolId> = HashMap::new();
    for &id in ids {
        let voice = tune.sym(id).voice;
        let prev = prev_note.get(&voice).copied();
        let (w_left, w_right) = symbol_widths(tune, id, prev);
        let s = tune.sym_mut(id);
        s.w_left = w_left;
        s.w_right = w_right;
        if s.is_note() || s.is_rest() {
            prev_note.insert(voice, id);
        }
    }
}

fn symbol_widths(tune: &Tune, id: SymbolId, prev_note: Option<SymbolId>) -> (f64, f64) {
    let s = tune.sym(id);
    match &s.kind {
        SymbolKind::Note(_) => note_widths(s, prev_note.map(|p| tune.sym(p))),
        SymbolKind::Rest => {
            let hw = head_half_width(s);
            let mut w_right = hw;
            if s.dots > 0 {
                w_right += DOT_SHIFT + (s.dots - 1) as f64 * DOT_SPACE;
            }
            annotate_widths(s, hw, w_right)
        }
        SymbolKind::Bar(bar) => {
            let (l, r) = bar_extents(bar.bar_type);
            (l + BAR_PAD, r + BAR_PAD)
        }
        SymbolKind::Clef(_) => {
            let w = if s.seq == SEQ_LINE_CLEF {
                CLEF_HALF_WIDTH
            } else {
                CLEF_HALF_WIDTH * SMALL_CLEF_RATIO
            };
            (w, w)
        }
        SymbolKind::KeySig(key) => {
            let w = key_width(key);
            if w == 0.0 {
                (0.0, 0.0)
            } else {
                (1.0, w)
            }
        }
        SymbolKind::TimeSig(meter) => {
            let half = meter_width(meter) / 2.0;
            (half + 1.0, half + 1.0)
        }
        SymbolKind::Grace(_) => grace_widths(tune, id),
        SymbolKind::Tuplet(_) | SymbolKind::FormatChange(_) => (0.0, 0.0),
        SymbolKind::StaffBreak(w) => (w / 2.0, w / 2.0),
    }
}

fn note_widths(s: &Symbol, prev: Option<&Symbol>) -> (f64, f64) {
    let hw = head_half_width(s);
    let heads = s.heads();
    let min_shift = heads.iter().map(|h| h.shift).fold(0.0_f64, f64::min);
    let max_shift = heads.iter().map(|h| h.shift).fold(0.0_f64, f64::max);
    let mut w_left = hw - min_shift;
    let mut w_right = hw + max_shift;

    for h in heads.iter().filter(|h| h.accidental.is_some()) {
        w_left = w_left.max(-h.acc_x + ACC_HALF_WIDTH);
    }

    let free_flag = s.stem > 0 && s.nflags > 0 && s.flags.word_start && s.flags.word_end && !s.flags.grace;
    if free_flag {
        w_right += FLAG_WIDTH;
    }
    if s.dots > 0 {
        w_right += DOT_SHIFT + (s.dots - 1) as f64 * DOT_SPACE + s.dot_shift;
        if heads.iter().any(|h| h.step % 2 == 0) {
            w_right += DOT_LINE_SHIFT;
        }
    }

    if let Some(p) = prev {
        if p.is_note() && p.stem > 0 && s.stem < 0 {
            w_left += STEM_CROSS_PAD;
        }
        if let (Some(a), Some(b)) = (has_ledger(p), has_ledger(s)) {
            if a == b {
                w_left += LEDGER_NEIGHBOUR_PAD;
            }
        }
    }

    if s.x_shift > 0.0 {
        w_right += s.x_shift;
    } else {
        w_left -= s.x_shift;
    }
    annotate_widths(s, w_left, w_right)
}

/// Room for lyrics and guitar chords attached to a note or rest.
fn annotate_widths(s: &Symbol, mut w_left: f64, mut w_right: f64) -> (f64, f64) {
    for lyric in s.lyrics.iter().flatten() {
        let half = text_width(&lyric.text, LYRIC_FONT_SIZE) / 2.0;
        w_left = w_left.max(half);
        let gap = if lyric.hyphen { LYRIC_MIN_GAP * 3.0 } else { LYRIC_MIN_GAP };
        w_right = w_right.max(half + gap);
    }
    if let Some(chord) = &s.gchord {
        let hw = head_half_width(s);
        w_right = w_right.max(text_width(chord, GCHORD_FONT_SIZE) - hw + LYRIC_MIN_GAP);
    }
    (w_left, w_right)
}

fn grace_widths(tune: &Tune, group: SymbolId) -> (f64, f64) {
    let notes = tune.grace_notes(group);
    if notes.is_empty() {
        return (0.0, 0.0);
    }
    let n = notes.len() as f64;
    let mut w_left = GRACE_MAIN_GAP + (n - 1.0) * GRACE_NOTE_SPACE + HW_GRACE;
    if tune.sym(notes[0]).heads().iter().any(|h| h.accidental.is_some()) {
        w_left += ACC_HALF_WIDTH * 2.0 * 0.7;
    }
    (w_left, 0.0)
}

/// x of the i-th grace note relative to its group.
pub(crate) fn grace_offset(index: usize, count: usize) -> f64 {
    -GRACE_MAIN_GAP - (count - 1 - index) as f64 * GRACE_NOTE_SPACE
}

// ═══════════════════════════════════════════════════════════════════════
// Elastic spacing
// ═══════════════════════════════════════════════════════════════════════

/// Symbols that take no room and are spaced through.
pub(crate) fn is_transparent(s: &Symbol) -> bool {
    matches!(s.kind, SymbolKind::Tuplet(_) | SymbolKind::FormatChange(_))
}

fn zero_time_pad(s: &Symbol) -> f64 {
    match s.kind {
        SymbolKind::Note(_) | SymbolKind::Rest | SymbolKind::Grace(_) => PAD_NOTE,
        SymbolKind::Bar(_) => PAD_BAR,
        SymbolKind::Clef(_) => PAD_CLEF,
        SymbolKind::KeySig(_) | SymbolKind::TimeSig(_) => PAD_SIGNATURE,
        SymbolKind::Tuplet(_) | SymbolKind::FormatChange(_) | SymbolKind::StaffBreak(_) => 0.0,
    }
}

#[derive(Clone, Copy)]
struct StaffTrack {
    /// w_right of the staff's latest moment
    right: f64,
    /// Minimum advance accumulated since that moment
    gap: f64,
}

/// Group a line's time-order ids into moments of equal `(time, seq)`.
pub(crate) fn moments_of(tune: &Tune, ids: &[SymbolId]) -> Vec<Vec<SymbolId>> {
    let mut groups: Vec<Vec<SymbolId>> = Vec::new();
    for &id in ids {
        let starts = match groups.last().and_then(|g| g.first()) {
            None => true,
            Some(&f) => {
                let (a, b) = (tune.sym(f), tune.sym(id));
                a.time != b.time || a.seq != b.seq
            }
        };
        if starts {
            groups.push(vec![id]);
        } else if let Some(g) = groups.last_mut() {
            g.push(id);
        }
    }
    groups
}

/// Set `shrink`, `space` and `stretch` of every symbol of a line.
///
/// `shrink` keeps the halo of the symbol clear of the nearest earlier symbol
/// on the same staff; `space` grows with the time elapsed since the previous
/// moment; `stretch` is a fixed ratio of `space`.  Leading signatures do not
/// stretch.
pub fn set_spacing(tune: &mut Tune, ids: &[SymbolId]) {
    let mut tracks: HashMap<usize, StaffTrack> = HashMap::new();
    let mut prev_time: Option<i32> = None;

    for moment in moments_of(tune, ids) {
        if moment.iter().all(|&id| is_transparent(tune.sym(id))) {
            for &id in &moment {
                let s = tune.sym_mut(id);
                s.shrink = 0.0;
                s.space = 0.0;
                s.stretch = 0.0;
            }
            continue;
        }
        let time = tune.sym(moment[0]).time;
        let dt = prev_time.map(|t| time - t);
        let mut moment_shrink: f64 = 0.0;

        for &id in &moment {
            let s = tune.sym(id);
            let before = tracks
                .get(&s.staff)
                .map(|t| (t.right - t.gap).max(0.0))
                .unwrap_or(LINE_START_PAD);
            let shrink = before + s.w_left;
            let space = match dt {
                None => shrink,
                Some(d) if d > 0 => nwidth(d).max(shrink),
                Some(_) => shrink + zero_time_pad(s),
            };
            let leading = s.seq <= SEQ_LINE_BAR;
            let stretch = if leading || dt.is_none() { space } else { space * STRETCH_RATIO };
            moment_shrink = moment_shrink.max(shrink);

            let s = tune.sym_mut(id);
            s.shrink = shrink;
            s.space = space;
            s.stretch = stretch;
        }

        for t in tracks.values_mut() {
            t.gap += moment_shrink;
        }
        let mut rights: HashMap<usize, f64> = HashMap::new();
        for &id in &moment {
            let s = tune.sym(id);
            let r = rights.entry(s.staff).or_insert(0.0);
            *r = r.max(s.w_right);
        }
        for (staff, right) in rights {
            tracks.insert(staff, StaffTrack { right, gap: 0.0 });
        }
        prev_time = Some(time);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builder::TuneBuilder;
    use crate::engine::vertical::map_pitches;
    use float_cmp::approx_eq;
    use more_asserts::{assert_gt, assert_le, assert_lt};

    #[test]
    fn nwidth_hits_anchors_and_grows_sublinearly() {
        assert!(approx_eq!(f64, nwidth(QUARTER), SPACE_QUARTER, epsilon = 1e-9));
        assert!(approx_eq!(f64, nwidth(WHOLE), SPACE_WHOLE, epsilon = 1e-9));
        assert!(approx_eq!(f64, nwidth(SIXTEENTH), SPACE_SIXTEENTH, epsilon = 1e-9));
        let mut last = 0.0;
        for len in (1..=BREVE).step_by(7) {
            let w = nwidth(len);
            assert_le!(last, w, "nwidth must not decrease at {}", len);
            last = w;
        }
        for len in [SIXTEENTH, EIGHTH, QUARTER, HALF, WHOLE] {
            assert_lt!(nwidth(2 * len), 2.0 * nwidth(len));
        }
    }

    #[test]
    fn key_switch_adds_buffer() {
        let plain = KeySig::new(2);
        let switch = KeySig { sharps: -2, old_sharps: Some(2) };
        assert!(approx_eq!(f64, key_width(&plain), 2.0 * KEY_ACC_SPACE, epsilon = 1e-9));
        assert!(approx_eq!(f64, key_width(&switch), 4.0 * KEY_ACC_SPACE + KEY_SWITCH_BUFFER, epsilon = 1e-9));
        assert_eq!(key_width(&KeySig::new(0)), 0.0);
    }

    #[test]
    fn spacing_follows_time() {
        let mut b = TuneBuilder::new();
        let staff = b.add_staff(Clef::treble());
        let v = b.add_voice("1", staff).unwrap();
        let head = || vec![NoteHead::new(diatonic('B', 4))];
        let q = b.note(v, head(), QUARTER).unwrap();
        let h = b.note(v, head(), HALF).unwrap();
        let e = b.note(v, head(), EIGHTH).unwrap();
        let mut tune = b.finish().unwrap();
        let ids = tune.ts_ids(tune.ts_first);
        set_widths(&mut tune, &ids);
        set_spacing(&mut tune, &ids);

        assert!(approx_eq!(f64, tune.sym(h).space, SPACE_QUARTER, epsilon = 1e-9));
        assert!(approx_eq!(f64, tune.sym(e).space, SPACE_HALF, epsilon = 1e-9));
        for id in [q, h, e] {
            let s = tune.sym(id);
            assert_le!(s.shrink, s.space);
            assert_le!(s.space, s.stretch);
        }
    }

    #[test]
    fn dots_and_free_flags_widen_the_right_side() {
        let mut b = TuneBuilder::new();
        let staff = b.add_staff(Clef::treble());
        let v = b.add_voice("1", staff).unwrap();
        let plain = b.note(v, vec![NoteHead::new(diatonic('A', 4))], QUARTER).unwrap();
        let dotted = b.note(v, vec![NoteHead::new(diatonic('A', 4))], QUARTER + EIGHTH).unwrap();
        let flagged = b.note(v, vec![NoteHead::new(diatonic('A', 4))], EIGHTH).unwrap();
        b.stem(flagged, true).unwrap();
        let mut tune = b.finish().unwrap();
        let ids = tune.ts_ids(tune.ts_first);
        set_widths(&mut tune, &ids);
        assert_gt!(tune.sym(dotted).w_right, tune.sym(plain).w_right);
        assert_gt!(tune.sym(flagged).w_right, tune.sym(plain).w_right);
    }

    fn mapped(b: TuneBuilder) -> Tune {
        let mut tune = b.finish().unwrap();
        map_pitches(&mut tune);
        let ids = tune.ts_ids(tune.ts_first);
        set_widths(&mut tune, &ids);
        tune
    }

    #[test]
    fn dotted_head_on_a_line_gets_the_extra_shift() {
        let mut b = TuneBuilder::new();
        let staff = b.add_staff(Clef::treble());
        let v = b.add_voice("1", staff).unwrap();
        let on_line = b.note(v, vec![NoteHead::new(diatonic('E', 4))], QUARTER + EIGHTH).unwrap();
        let in_space = b.note(v, vec![NoteHead::new(diatonic('F', 4))], QUARTER + EIGHTH).unwrap();
        let tune = mapped(b);
        let extra = tune.sym(on_line).w_right - tune.sym(in_space).w_right;
        assert!(approx_eq!(f64, extra, DOT_LINE_SHIFT, epsilon = 1e-9));
    }

    #[test]
    fn up_stem_then_down_stem_widens_the_left_side() {
        let mut b = TuneBuilder::new();
        let staff = b.add_staff(Clef::treble());
        let v = b.add_voice("1", staff).unwrap();
        let b4 = || vec![NoteHead::new(diatonic('B', 4))];
        let up = b.note(v, b4(), QUARTER).unwrap();
        let crossing = b.note(v, b4(), QUARTER).unwrap();
        let following = b.note(v, b4(), QUARTER).unwrap();
        b.stem(up, true).unwrap();
        b.stem(crossing, false).unwrap();
        b.stem(following, false).unwrap();
        let tune = mapped(b);
        let extra = tune.sym(crossing).w_left - tune.sym(following).w_left;
        assert!(approx_eq!(f64, extra, STEM_CROSS_PAD, epsilon = 1e-9));
    }

    #[test]
    fn neighbours_with_ledger_lines_keep_apart() {
        let mut b = TuneBuilder::new();
        let staff = b.add_staff(Clef::treble());
        let v = b.add_voice("1", staff).unwrap();
        let a3 = || vec![NoteHead::new(diatonic('A', 3))];
        b.note(v, vec![NoteHead::new(diatonic('B', 4))], QUARTER).unwrap();
        let after_plain = b.note(v, a3(), QUARTER).unwrap();
        let after_ledger = b.note(v, a3(), QUARTER).unwrap();
        let tune = mapped(b);
        let extra = tune.sym(after_ledger).w_left - tune.sym(after_plain).w_left;
        assert!(approx_eq!(f64, extra, LEDGER_NEIGHBOUR_PAD, epsilon = 1e-9));
    }
}
