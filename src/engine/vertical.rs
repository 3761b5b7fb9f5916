//! Vertical placement — stems, chord heads and accidentals, voice collisions
//! on shared staves, annotation baselines and the staff offsets of a line.
//!
//! Staff-relative y grows upwards from the bottom staff line.  Every staff
//! keeps `top`/`bottom` reservation arrays of [`YSTEPS`] horizontal buckets
//! across the line; symbols, beams, curves and texts register their
//! footprint there and annotations are stacked on what is already reserved.

use std::collections::{BTreeMap, HashMap};
use std::ops::RangeInclusive;

use crate::config::MeasureNumbering;
use crate::draw::TextKind;
use crate::error::DiagnosticKind;
use crate::model::*;
use super::beam::stem_x;
use super::constants::*;
use super::width::{grace_offset, head_half_width, text_width};
use super::{LayoutContext, LineWork, PlacedText, Segment, StaffPoint};

/// Vertical size of a laid-out line, in staff units.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LineMetrics {
    /// From the line top to the lowest reservation of the last staff
    pub height: f64,
    /// Distance to the next line
    pub advance: f64,
}

// ═══════════════════════════════════════════════════════════════════════
// Pitches and stems
// ═══════════════════════════════════════════════════════════════════════

/// Set the staff step of every head from the clef in force.
pub fn map_pitches(tune: &mut Tune) {
    for v in 0..tune.voices.len() {
        let mut clef = tune.voices[v].clef;
        for id in tune.voice_ids(tune.voices[v].first) {
            if let SymbolKind::Clef(c) = tune.sym(id).kind {
                clef = c;
                continue;
            }
            let mut targets = vec![id];
            if matches!(tune.sym(id).kind, SymbolKind::Grace(_)) {
                targets.extend(tune.grace_notes(id));
            }
            for t in targets {
                let staff = tune.sym(t).staff;
                let bottom = if staff != tune.voices[v].staff {
                    tune.staves[staff].clef.bottom_line_pitch()
                } else {
                    clef.bottom_line_pitch()
                };
                if let Some(heads) = tune.sym_mut(t).heads_mut() {
                    for h in heads.iter_mut() {
                        h.step = h.pitch - bottom;
                    }
                }
            }
        }
    }
}

/// Voices with notes or rests on each staff of the line, in index order.
pub(super) fn staff_voices(tune: &Tune, ids: &[SymbolId]) -> HashMap<usize, Vec<usize>> {
    let mut map: HashMap<usize, Vec<usize>> = HashMap::new();
    for &id in ids {
        let s = tune.sym(id);
        if s.kind.is_note_or_rest() {
            let voices = map.entry(s.staff).or_default();
            if !voices.contains(&s.voice) {
                voices.push(s.voice);
            }
        }
    }
    for voices in map.values_mut() {
        voices.sort_unstable();
    }
    map
}

fn stem_end(s: &Symbol, up: bool) -> f64 {
    let (lo, hi) = s.step_range().unwrap_or((MIDDLE_STEP, MIDDLE_STEP));
    if s.flags.grace {
        return if up {
            hi as f64 * STEP + GRACE_STEM
        } else {
            lo as f64 * STEP - GRACE_STEM
        };
    }
    let extra = STEM_FLAG_EXTRA[s.nflags.clamp(0, 5) as usize];
    if up {
        (hi as f64 * STEP + STEM + extra).max(STAFF_MIDDLE)
    } else {
        (lo as f64 * STEP - STEM - extra).min(STAFF_MIDDLE)
    }
}

/// Resting position of a rest glyph on a staff of its own: whole and
/// breve rests hang from the fourth line, the others sit on the middle.
pub(super) fn rest_base(s: &Symbol) -> f64 {
    match s.head {
        HeadType::Whole | HeadType::Breve => STAFF_MIDDLE + LINE_SPACING,
        HeadType::Half | HeadType::Filled => STAFF_MIDDLE,
    }
}

/// Choose the stem direction of every note and its natural stem end.
///
/// A source direction wins, then the voice policy; on a staff shared by
/// several voices the first voice points up and the others down; otherwise
/// a whole beam word points down when its average head sits on or above the
/// middle line.
pub fn set_stems(tune: &mut Tune, ids: &[SymbolId]) {
    let shared = staff_voices(tune, ids);
    let mut open: HashMap<usize, Vec<SymbolId>> = HashMap::new();

    let decide = |tune: &mut Tune, word: &[SymbolId]| {
        let Some(&first) = word.first() else { return };
        let (voice, staff) = (tune.sym(first).voice, tune.voices[tune.sym(first).voice].staff);
        let fixed = word.iter().map(|&id| tune.sym(id)).find(|s| s.flags.stem_fixed).map(|s| s.stem > 0);
        let up = match (fixed, tune.voices[voice].stem_policy) {
            (Some(up), _) => up,
            (None, StemPolicy::Up) => true,
            (None, StemPolicy::Down) => false,
            (None, StemPolicy::Auto) => match shared.get(&staff) {
                Some(voices) if voices.len() > 1 => voices.first() == Some(&voice),
                _ => {
                    let sum: f64 = word
                        .iter()
                        .filter_map(|&id| tune.sym(id).step_range())
                        .map(|(lo, hi)| (lo + hi) as f64 / 2.0)
                        .sum();
                    sum / (word.len() as f64) < MIDDLE_STEP as f64
                }
            },
        };
        for &id in word {
            let end = stem_end(tune.sym(id), up);
            let s = tune.sym_mut(id);
            s.stem = if up { 1 } else { -1 };
            s.y_stem = end;
        }
    };

    for &id in ids {
        let (voice, staff, start, end) = {
            let s = tune.sym(id);
            (s.voice, s.staff, s.flags.word_start, s.flags.word_end)
        };
        if tune.sym(id).is_note() {
            let word = open.entry(voice).or_default();
            if start && !word.is_empty() {
                let done = std::mem::take(word);
                decide(tune, &done);
            }
            let word = open.entry(voice).or_default();
            word.push(id);
            if end {
                let done = std::mem::take(word);
                decide(tune, &done);
            }
        } else if tune.sym(id).is_rest() {
            let position = match shared.get(&staff) {
                Some(v) if v.len() > 1 && v.first() == Some(&voice) => 1.0,
                Some(v) if v.len() > 1 => -1.0,
                _ => 0.0,
            };
            let s = tune.sym_mut(id);
            s.stem = 0;
            s.y = rest_base(s) + position * REST_VOICE_SHIFT;
        } else if matches!(tune.sym(id).kind, SymbolKind::Grace(_)) {
            for g in tune.grace_notes(id) {
                let up = {
                    let gs = tune.sym(g);
                    !gs.flags.stem_fixed || gs.stem > 0
                };
                let end = stem_end(tune.sym(g), up);
                let gs = tune.sym_mut(g);
                gs.stem = if up { 1 } else { -1 };
                gs.y_stem = end;
            }
        }
    }
    let rest: Vec<Vec<SymbolId>> = open.into_values().filter(|w| !w.is_empty()).collect();
    for word in rest {
        decide(tune, &word);
    }
}

// ═══════════════════════════════════════════════════════════════════════
// Chords and accidentals
// ═══════════════════════════════════════════════════════════════════════

/// Shift the second of every pair of heads a step apart and stack the
/// accidentals of a chord into columns.
fn place_chord(s: &mut Symbol) {
    let hw = head_half_width(s);
    let up = s.stem >= 0;
    let Some(heads) = s.heads_mut() else { return };
    let n = heads.len();
    for h in heads.iter_mut() {
        h.shift = 0.0;
        h.acc_x = 0.0;
    }
    if up {
        for i in 1..n {
            if heads[i].step - heads[i - 1].step == 1 && heads[i - 1].shift == 0.0 {
                heads[i].shift = 2.0 * hw;
            }
        }
    } else {
        for i in (0..n.saturating_sub(1)).rev() {
            if heads[i + 1].step - heads[i].step == 1 && heads[i + 1].shift == 0.0 {
                heads[i].shift = -2.0 * hw;
            }
        }
    }

    let left = heads.iter().map(|h| h.shift).fold(0.0_f64, f64::min) - hw;
    let base = left - ACC_GAP - ACC_HALF_WIDTH;
    let mut placed: Vec<(i32, f64)> = Vec::new();
    for h in heads.iter_mut().rev().filter(|h| h.accidental.is_some()) {
        let mut x = base;
        for &(step, px) in &placed {
            let d = (step - h.step).abs();
            if d < ACC_CONFLICT_STEPS {
                let shift = if d <= 3 { ACC_SHIFT_STRONG } else { ACC_SHIFT_WEAK };
                x = x.min(px - shift);
            }
        }
        h.acc_x = x;
        placed.push((h.step, x));
    }
}

/// Head shifts and accidental columns of every note and grace note.
pub fn place_heads(tune: &mut Tune, ids: &[SymbolId]) {
    for &id in ids {
        match tune.sym(id).kind {
            SymbolKind::Note(_) => place_chord(tune.sym_mut(id)),
            SymbolKind::Grace(_) => {
                for g in tune.grace_notes(id) {
                    place_chord(tune.sym_mut(g));
                }
            }
            _ => {}
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════
// Voice collisions
// ═══════════════════════════════════════════════════════════════════════

/// Horizontal offset of the upper note when two voices meet on a staff.
///
/// `d` is the bottom step of the upper voice minus the top step of the
/// lower one.
fn collision_shift(upper: &Symbol, lower: &Symbol, d: i32) -> f64 {
    match d {
        d if d >= 2 => 0.0,
        1 => 2.0 * head_half_width(upper),
        0 => {
            let single = upper.heads().len() == 1 && lower.heads().len() == 1;
            if single && upper.head == lower.head && upper.dots == lower.dots {
                0.0
            } else {
                VOICE_SHIFT_UNISON
            }
        }
        _ => {
            if upper.head.is_open() || lower.head.is_open() {
                VOICE_SHIFT_CROSS_OPEN
            } else {
                VOICE_SHIFT_CROSS
            }
        }
    }
}

/// Shift notes of different voices that sound together on one staff.
pub fn resolve_voice_collisions(tune: &mut Tune, ids: &[SymbolId]) {
    let mut groups: BTreeMap<(i32, usize), Vec<SymbolId>> = BTreeMap::new();
    for &id in ids {
        let s = tune.sym_mut(id);
        if !s.is_note() {
            continue;
        }
        s.x_shift = 0.0;
        s.dot_shift = 0.0;
        groups.entry((s.time, s.staff)).or_default().push(id);
    }
    for mut notes in groups.into_values() {
        if notes.len() < 2 {
            continue;
        }
        // upper voices first: stems up, then by voice
        notes.sort_by_key(|&id| {
            let s = tune.sym(id);
            (s.stem <= 0, s.voice)
        });
        for pair in notes.windows(2) {
            let (u, l) = (pair[0], pair[1]);
            if tune.sym(u).voice == tune.sym(l).voice {
                continue;
            }
            let (Some((u_lo, _)), Some((_, l_hi))) = (tune.sym(u).step_range(), tune.sym(l).step_range()) else {
                continue;
            };
            let shift = collision_shift(tune.sym(u), tune.sym(l), u_lo - l_hi);
            if shift > 0.0 {
                log::trace!("voices collide at {}: shifting {} by {}", tune.sym(u).time, u, shift);
                tune.sym_mut(u).x_shift += shift;
                tune.sym_mut(l).dot_shift = shift;
            }
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════
// Extents
// ═══════════════════════════════════════════════════════════════════════

/// Place grace notes relative to their group once the group has its x.
pub fn place_graces(tune: &mut Tune, ids: &[SymbolId]) {
    for &id in ids {
        if !matches!(tune.sym(id).kind, SymbolKind::Grace(_)) {
            continue;
        }
        let x = tune.sym(id).x;
        let notes = tune.grace_notes(id);
        let count = notes.len();
        for (i, g) in notes.into_iter().enumerate() {
            tune.sym_mut(g).x = x + grace_offset(i, count);
        }
    }
}

fn note_extents(s: &mut Symbol) {
    let (lo, hi) = s.step_range().unwrap_or((MIDDLE_STEP, MIDDLE_STEP));
    let half = if s.flags.grace { STEP * 0.7 } else { STEP };
    s.y = lo as f64 * STEP;
    s.y_avg = (lo + hi) as f64 * STEP / 2.0;
    s.y_min = lo as f64 * STEP - half;
    s.y_max = hi as f64 * STEP + half;
    if s.has_stem() || s.flags.grace {
        if s.stem > 0 {
            s.y_max = s.y_max.max(s.y_stem);
        } else {
            s.y_min = s.y_min.min(s.y_stem);
        }
    }
}

/// Vertical extents of every symbol of the line, stems included.
pub fn set_extents(tune: &mut Tune, ids: &[SymbolId]) {
    for &id in ids {
        let graces = tune.grace_notes(id);
        let s = tune.sym_mut(id);
        match &s.kind {
            SymbolKind::Note(_) => note_extents(s),
            SymbolKind::Rest => {
                s.y_avg = s.y;
                s.y_min = s.y - LINE_SPACING;
                s.y_max = s.y + LINE_SPACING;
            }
            SymbolKind::Bar(_) | SymbolKind::KeySig(_) | SymbolKind::TimeSig(_) => {
                s.y_min = 0.0;
                s.y_max = STAFF_TOP;
            }
            SymbolKind::Clef(_) => {
                s.y_min = -LINE_SPACING;
                s.y_max = STAFF_TOP + LINE_SPACING;
            }
            SymbolKind::Grace(_) => {
                let (mut lo, mut hi) = (STAFF_MIDDLE, STAFF_MIDDLE);
                for g in graces {
                    let gs = tune.sym_mut(g);
                    note_extents(gs);
                    lo = lo.min(gs.y_min);
                    hi = hi.max(gs.y_max);
                }
                let s = tune.sym_mut(id);
                s.y_min = lo;
                s.y_max = hi;
            }
            SymbolKind::Tuplet(_) | SymbolKind::StaffBreak(_) | SymbolKind::FormatChange(_) => {
                s.y_min = STAFF_MIDDLE;
                s.y_max = STAFF_MIDDLE;
            }
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════
// Reservations
// ═══════════════════════════════════════════════════════════════════════

struct Reservations {
    width: f64,
}

impl Reservations {
    fn range(&self, x1: f64, x2: f64) -> RangeInclusive<usize> {
        let last = (YSTEPS - 1) as f64;
        let bucket = |x: f64| {
            if self.width <= 0.0 {
                return 0;
            }
            ((x / self.width) * YSTEPS as f64).floor().clamp(0.0, last) as usize
        };
        bucket(x1.min(x2))..=bucket(x1.max(x2))
    }

    fn reserve(&self, staff: &mut Staff, x1: f64, x2: f64, y_min: f64, y_max: f64) {
        for i in self.range(x1, x2) {
            staff.top[i] = staff.top[i].max(y_max + YSTEP_PAD);
            staff.bottom[i] = staff.bottom[i].min(y_min - YSTEP_PAD);
        }
    }

    fn top(&self, staff: &Staff, x1: f64, x2: f64) -> f64 {
        self.range(x1, x2).map(|i| staff.top[i]).fold(STAFF_TOP, f64::max)
    }

    fn bottom(&self, staff: &Staff, x1: f64, x2: f64) -> f64 {
        self.range(x1, x2).map(|i| staff.bottom[i]).fold(0.0, f64::min)
    }
}

fn max_of(values: &[f64], floor: f64) -> f64 {
    values.iter().copied().fold(floor, f64::max)
}

fn min_of(values: &[f64], ceiling: f64) -> f64 {
    values.iter().copied().fold(ceiling, f64::min)
}

fn decoration_text(d: &Decoration) -> String {
    match d {
        Decoration::Staccato => ".".into(),
        Decoration::Accent => ">".into(),
        Decoration::Tenuto => "-".into(),
        Decoration::Fermata => "\u{1D110}".into(),
        Decoration::Trill => "tr".into(),
        Decoration::Other(name) => name.clone(),
    }
}

/// Register the line content, place annotations on what it reserved and
/// stack the staves.
pub fn finish_line(ctx: &mut LayoutContext, tune: &mut Tune, work: &mut LineWork) -> LineMetrics {
    let res = Reservations { width: work.width.max(ctx.width) };
    for staff in tune.staves.iter_mut() {
        staff.top.iter_mut().for_each(|t| *t = STAFF_TOP);
        staff.bottom.iter_mut().for_each(|b| *b = 0.0);
        staff.lyric_y.clear();
        staff.gchord_y = STAFF_TOP;
    }

    register_symbols(&res, tune, &work.ids);
    register_beams(&res, tune, work);
    register_curves(&res, tune, work);
    place_decorations(&res, tune, work);
    place_tuplets(&res, tune, work);
    place_voltas(&res, tune, work);
    place_measure_numbers(ctx, &res, tune, work);
    place_gchords(&res, tune, work);
    place_lyrics(ctx, &res, tune, work);
    place_staves(ctx, tune)
}

fn register_symbols(res: &Reservations, tune: &mut Tune, ids: &[SymbolId]) {
    for &id in ids {
        let s = tune.sym(id);
        if matches!(s.kind, SymbolKind::Tuplet(_) | SymbolKind::FormatChange(_) | SymbolKind::StaffBreak(_))
            || s.flags.invisible
        {
            continue;
        }
        let (x1, x2, lo, hi, staff) = (s.x - s.w_left, s.x + s.w_right, s.y_min, s.y_max, s.staff);
        res.reserve(&mut tune.staves[staff], x1, x2, lo, hi);
    }
}

fn register_beams(res: &Reservations, tune: &mut Tune, work: &LineWork) {
    for beam in &work.beams {
        let levels = beam.segments.iter().map(|s| s.level).max().unwrap_or(0) as f64;
        let (x1, x2) = (stem_x(tune.sym(beam.first)), stem_x(tune.sym(beam.last)));
        let (y1, y2) = (beam.y_at(x1), beam.y_at(x2));
        let depth = beam.depth() + levels * beam.shift();
        let (lo, hi) = if beam.up {
            (y1.min(y2) - depth, y1.max(y2))
        } else {
            (y1.min(y2), y1.max(y2) + depth)
        };
        res.reserve(&mut tune.staves[beam.staff], x1, x2, lo, hi);
    }
}

fn register_curves(res: &Reservations, tune: &mut Tune, work: &LineWork) {
    for curve in &work.curves {
        let xs: Vec<f64> = curve.points.iter().map(|p| p.x).collect();
        let ys: Vec<f64> = curve.points.iter().map(|p| p.y).collect();
        // the bow reaches CURVE_PEAK of the control point offset
        let (y0, y3) = (ys[0], ys[3]);
        let mid = (y0 + y3) / 2.0;
        let ctrl = (ys[1] + ys[2]) / 2.0;
        let peak = mid + (ctrl - mid) * CURVE_PEAK;
        let lo = min_of(&[y0, y3, peak], f64::INFINITY);
        let hi = max_of(&[y0, y3, peak], f64::NEG_INFINITY);
        res.reserve(&mut tune.staves[curve.staff], min_of(&xs, f64::INFINITY), max_of(&xs, f64::NEG_INFINITY), lo, hi);
    }
}

fn place_decorations(res: &Reservations, tune: &mut Tune, work: &mut LineWork) {
    for &id in &work.ids {
        let s = tune.sym(id);
        if s.decorations.is_empty() || !s.kind.is_note_or_rest() {
            continue;
        }
        let staff = s.staff;
        let (x, hw) = (s.x + s.x_shift, head_half_width(s));
        let (head_lo, head_hi) = s
            .step_range()
            .map(|(lo, hi)| (lo as f64 * STEP - STEP, hi as f64 * STEP + STEP))
            .unwrap_or((s.y_min, s.y_max));
        let stem_up = s.stem > 0;
        let decorations = s.decorations.clone();
        let mut near_below = head_lo;
        let mut near_above = head_hi;
        for d in &decorations {
            let text = decoration_text(d);
            let size = if matches!(d, Decoration::Fermata) { 16.0 } else { 12.0 };
            let y = match d {
                Decoration::Staccato | Decoration::Accent | Decoration::Tenuto => {
                    if stem_up {
                        near_below -= DECO_SPACE;
                        near_below - size * 0.5
                    } else {
                        near_above += DECO_SPACE;
                        near_above
                    }
                }
                _ => {
                    let top = res.top(&tune.staves[staff], x - hw, x + hw).max(tune.sym(id).y_max);
                    top + DECO_SPACE
                }
            };
            res.reserve(&mut tune.staves[staff], x - hw, x + hw, y, y + size * 0.7);
            work.texts.push(PlacedText { staff, x, y, text, kind: TextKind::Decoration, size });
        }
    }
}

/// Notes of a tuplet group that are on this line.
fn tuplet_members(tune: &Tune, group: SymbolId, on_line: &[SymbolId]) -> Vec<SymbolId> {
    let mut members = Vec::new();
    for id in tune.voice_ids(tune.sym(group).next) {
        let s = tune.sym(id);
        if !s.kind.is_note_or_rest() {
            if matches!(s.kind, SymbolKind::Grace(_) | SymbolKind::FormatChange(_)) {
                continue;
            }
            break;
        }
        if !s.flags.in_tuplet {
            break;
        }
        if on_line.contains(&id) {
            members.push(id);
        }
        if s.flags.tuplet_end {
            break;
        }
    }
    members
}

fn place_tuplets(res: &Reservations, tune: &mut Tune, work: &mut LineWork) {
    for &id in &work.ids {
        let SymbolKind::Tuplet(t) = tune.sym(id).kind else { continue };
        if t.r == 0 {
            continue;
        }
        let members = tuplet_members(tune, id, &work.ids);
        let (Some(&first), Some(&last)) = (members.first(), members.last()) else { continue };
        let staff = tune.sym(first).staff;
        let (x1, x2) = (tune.sym(first).x, tune.sym(last).x);
        let above = members.iter().all(|&m| tune.sym(m).stem >= 0);
        let y = if above {
            let notes = max_of(&members.iter().map(|&m| tune.sym(m).y_max).collect::<Vec<_>>(), STAFF_TOP);
            res.top(&tune.staves[staff], x1, x2).max(notes) + TUPLET_SPACE
        } else {
            let notes = min_of(&members.iter().map(|&m| tune.sym(m).y_min).collect::<Vec<_>>(), 0.0);
            res.bottom(&tune.staves[staff], x1, x2).min(notes) - TUPLET_SPACE - TUPLET_FONT_SIZE
        };
        res.reserve(&mut tune.staves[staff], x1, x2, y, y + TUPLET_FONT_SIZE);
        work.texts.push(PlacedText {
            staff,
            x: (x1 + x2) / 2.0,
            y,
            text: t.p.to_string(),
            kind: TextKind::Tuplet,
            size: TUPLET_FONT_SIZE,
        });
    }
}

fn place_voltas(res: &Reservations, tune: &mut Tune, work: &mut LineWork) {
    let bars: Vec<SymbolId> = work
        .ids
        .iter()
        .copied()
        .filter(|&id| tune.sym(id).is_bar() && tune.sym(id).voice == 0)
        .collect();
    for (i, &id) in bars.iter().enumerate() {
        let Some(text) = tune.sym(id).bar().and_then(|b| b.text.clone()) else { continue };
        let staff = tune.sym(id).staff;
        let x1 = tune.sym(id).x + 2.0;
        let x2 = bars.get(i + 1).map_or(work.width, |&n| tune.sym(n).x - 2.0);
        let y = res.top(&tune.staves[staff], x1, x2) + VOLTA_HEIGHT;
        let at = |x: f64, y: f64| StaffPoint { x, y, staff };
        work.segments.push(Segment { from: at(x1, y - VOLTA_HEIGHT), to: at(x1, y), width: 0.8 });
        work.segments.push(Segment { from: at(x1, y), to: at(x2, y), width: 0.8 });
        work.texts.push(PlacedText {
            staff,
            x: x1 + 2.0,
            y: y - VOLTA_FONT_SIZE,
            text,
            kind: TextKind::Decoration,
            size: VOLTA_FONT_SIZE,
        });
        res.reserve(&mut tune.staves[staff], x1, x2, y - VOLTA_HEIGHT, y);
    }
}

fn place_measure_numbers(ctx: &mut LayoutContext, res: &Reservations, tune: &mut Tune, work: &mut LineWork) {
    let mode = ctx.config.bar_numbers;
    if mode == MeasureNumbering::EachLine && ctx.line > 0 {
        let y = res.top(&tune.staves[0], 0.0, 20.0) + 2.0;
        work.texts.push(PlacedText {
            staff: 0,
            x: 0.0,
            y,
            text: ctx.measure.to_string(),
            kind: TextKind::MeasureNumber,
            size: MEASURE_NUMBER_SIZE,
        });
    }
    let meter = tune.voices.first().map(|v| v.meter).unwrap_or_default();
    for &id in &work.ids {
        let s = tune.sym(id);
        if !s.is_bar() || s.voice != 0 || s.seq == SEQ_LINE_BAR || s.time == 0 {
            continue;
        }
        let pickup = !ctx.first_bar_seen && s.time < meter.measure_length();
        ctx.first_bar_seen = true;
        if pickup {
            continue;
        }
        ctx.measure += 1;
        if let MeasureNumbering::Every(n) = mode {
            if n > 0 && ctx.measure % n == 0 && s.next.is_some() {
                let (x, staff) = (s.x, s.staff);
                let y = res.top(&tune.staves[staff], x - 4.0, x + 4.0) + 2.0;
                res.reserve(&mut tune.staves[staff], x - 4.0, x + 8.0, y, y + MEASURE_NUMBER_SIZE);
                work.texts.push(PlacedText {
                    staff,
                    x: x - 2.0,
                    y,
                    text: ctx.measure.to_string(),
                    kind: TextKind::MeasureNumber,
                    size: MEASURE_NUMBER_SIZE,
                });
            }
        }
    }
}

fn place_gchords(res: &Reservations, tune: &mut Tune, work: &mut LineWork) {
    let mut baselines: HashMap<usize, f64> = HashMap::new();
    for &id in &work.ids {
        let s = tune.sym(id);
        if s.gchord.is_some() {
            baselines.entry(s.staff).or_insert_with(|| {
                let staff = &tune.staves[s.staff];
                max_of(&staff.top, STAFF_TOP) + GCHORD_SPACE
            });
        }
    }
    for &id in &work.ids {
        let s = tune.sym(id);
        let Some(chord) = s.gchord.clone() else { continue };
        let (staff, x) = (s.staff, s.x - head_half_width(s));
        let y = baselines.get(&staff).copied().unwrap_or(STAFF_TOP + GCHORD_SPACE);
        let w = text_width(&chord, GCHORD_FONT_SIZE);
        tune.staves[staff].gchord_y = y;
        res.reserve(&mut tune.staves[staff], x, x + w, y, y + GCHORD_FONT_SIZE * 0.7);
        work.texts.push(PlacedText { staff, x, y, text: chord, kind: TextKind::GuitarChord, size: GCHORD_FONT_SIZE });
    }
}

fn place_lyrics(ctx: &LayoutContext, res: &Reservations, tune: &mut Tune, work: &mut LineWork) {
    let mut verses: HashMap<usize, usize> = HashMap::new();
    for &id in &work.ids {
        let s = tune.sym(id);
        if s.lyrics.iter().any(Option::is_some) {
            let v = verses.entry(s.staff).or_insert(0);
            *v = (*v).max(s.lyrics.len());
        }
    }
    for h in &work.hyphens {
        let v = verses.entry(h.staff).or_insert(0);
        *v = (*v).max(h.verse + 1);
    }
    for (&staff, &count) in &verses {
        let st = &mut tune.staves[staff];
        st.lyric_y = if ctx.config.vocal_above {
            let top = max_of(&st.top, STAFF_TOP) + LYRIC_MIN_GAP;
            (0..count).map(|v| top + v as f64 * ctx.config.lyric_space).collect()
        } else {
            let bottom = min_of(&st.bottom, 0.0);
            (0..count).map(|v| bottom - (v + 1) as f64 * ctx.config.lyric_space).collect()
        };
        let (lo, hi) = (min_of(&st.lyric_y, f64::INFINITY), max_of(&st.lyric_y, f64::NEG_INFINITY));
        let width = res.width;
        res.reserve(st, 0.0, width, lo - LYRIC_FONT_SIZE * 0.3, hi + LYRIC_FONT_SIZE * 0.7);
    }
    for &id in &work.ids {
        let s = tune.sym(id);
        for (verse, lyric) in s.lyrics.iter().enumerate() {
            let Some(lyric) = lyric else { continue };
            let Some(&y) = tune.staves[s.staff].lyric_y.get(verse) else { continue };
            work.texts.push(PlacedText {
                staff: s.staff,
                x: s.x + s.x_shift,
                y,
                text: lyric.text.clone(),
                kind: TextKind::Lyric,
                size: LYRIC_FONT_SIZE,
            });
        }
    }
    for h in work.hyphens.iter_mut() {
        if let Some(&y) = tune.staves[h.staff].lyric_y.get(h.verse) {
            h.y = y + if h.extender { 0.0 } else { LYRIC_FONT_SIZE * 0.3 };
        }
    }
}

/// Stack the staves of the line top to bottom.
fn place_staves(ctx: &mut LayoutContext, tune: &mut Tune) -> LineMetrics {
    let mut y = 0.0;
    for i in 0..tune.staves.len() {
        let top = max_of(&tune.staves[i].top, STAFF_TOP);
        if i == 0 {
            y = top + YSTEP_PAD;
        } else {
            // clearance bucket by bucket: content only collides where it overlaps
            let (prev, cur) = (&tune.staves[i - 1], &tune.staves[i]);
            let clearance = prev
                .bottom
                .iter()
                .zip(&cur.top)
                .map(|(&b, &t)| t.max(STAFF_TOP) - b.min(0.0))
                .fold(STAFF_TOP, f64::max);
            let required = clearance + STAFF_CLEARANCE_PAD;
            let mut sep = ctx.config.staff_sep.max(required);
            if sep > ctx.config.max_staff_sep {
                ctx.diagnostics.capacity(
                    DiagnosticKind::StaffOverlap,
                    None,
                    format!("staff {} needs {:.1} units of separation, maximum is {:.1}", i, sep, ctx.config.max_staff_sep),
                );
                sep = ctx.config.max_staff_sep;
            }
            y += sep;
        }
        tune.staves[i].y = y;
    }
    let below = tune.staves.last().map_or(0.0, |s| -min_of(&s.bottom, 0.0));
    let height = y + below + LINE_BOTTOM_PAD;
    let mut advance = ctx.config.system_sep.max(height);
    if advance > ctx.config.max_system_sep {
        ctx.diagnostics.capacity(
            DiagnosticKind::StaffOverlap,
            None,
            format!("line {} is {:.1} units high, maximum system separation is {:.1}", ctx.line, height, ctx.config.max_system_sep),
        );
        advance = ctx.config.max_system_sep;
    }
    LineMetrics { height, advance }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builder::TuneBuilder;
    use crate::config::LayoutConfig;
    use float_cmp::approx_eq;
    use more_asserts::{assert_ge, assert_gt, assert_lt};

    fn head(step: char, octave: i32) -> NoteHead {
        NoteHead::new(diatonic(step, octave))
    }

    fn prepared(tune: &mut Tune) -> Vec<SymbolId> {
        map_pitches(tune);
        let ids = tune.ts_ids(tune.ts_first);
        set_stems(tune, &ids);
        place_heads(tune, &ids);
        ids
    }

    #[test]
    fn pitches_follow_the_clef() {
        let mut b = TuneBuilder::new();
        let staff = b.add_staff(Clef::bass());
        let v = b.add_voice("1", staff).unwrap();
        let g = b.note(v, vec![head('G', 2)], QUARTER).unwrap();
        b.clef(v, Clef::treble()).unwrap();
        let e = b.note(v, vec![head('E', 4)], QUARTER).unwrap();
        let mut tune = b.finish().unwrap();
        map_pitches(&mut tune);
        assert_eq!(tune.sym(g).heads()[0].step, 0);
        assert_eq!(tune.sym(e).heads()[0].step, 0);
    }

    #[test]
    fn high_words_point_down() {
        let mut b = TuneBuilder::new();
        let staff = b.add_staff(Clef::treble());
        let v = b.add_voice("1", staff).unwrap();
        let hi: Vec<SymbolId> = (0..2).map(|_| b.note(v, vec![head('D', 5)], EIGHTH).unwrap()).collect();
        b.bar(v, BarType::Single).unwrap();
        let lo = b.note(v, vec![head('F', 4)], QUARTER).unwrap();
        let mut tune = b.finish().unwrap();
        prepared(&mut tune);
        assert!(hi.iter().all(|&id| tune.sym(id).stem < 0));
        assert!(tune.sym(lo).stem > 0);
        // low notes reach the middle line
        assert_ge!(tune.sym(lo).y_stem, STAFF_MIDDLE);
    }

    #[test]
    fn shared_staff_splits_stems() {
        let mut b = TuneBuilder::new();
        let staff = b.add_staff(Clef::treble());
        let v1 = b.add_voice("1", staff).unwrap();
        let v2 = b.add_voice("2", staff).unwrap();
        let top = b.note(v1, vec![head('E', 4)], QUARTER).unwrap();
        let bottom = b.note(v2, vec![head('G', 5)], QUARTER).unwrap();
        let mut tune = b.finish().unwrap();
        prepared(&mut tune);
        assert_eq!(tune.sym(top).stem, 1);
        assert_eq!(tune.sym(bottom).stem, -1);
    }

    #[test]
    fn seconds_shift_heads_and_accidentals_stack() {
        let mut b = TuneBuilder::new();
        let staff = b.add_staff(Clef::treble());
        let v = b.add_voice("1", staff).unwrap();
        let chord = b
            .note(
                v,
                vec![
                    head('F', 4).with_accidental(Accidental::Sharp),
                    head('G', 4).with_accidental(Accidental::Sharp),
                    head('A', 4),
                ],
                QUARTER,
            )
            .unwrap();
        b.stem(chord, true).unwrap();
        let mut tune = b.finish().unwrap();
        prepared(&mut tune);
        let heads = tune.sym(chord).heads();
        assert_eq!(heads[0].shift, 0.0);
        assert_gt!(heads[1].shift, 0.0);
        assert_eq!(heads[2].shift, 0.0);
        // a second apart: the lower accidental takes its own column
        assert!(approx_eq!(f64, heads[1].acc_x - heads[0].acc_x, ACC_SHIFT_STRONG, epsilon = 1e-9));
    }

    #[test]
    fn crossed_voices_shift_by_table() {
        let mut b = TuneBuilder::new();
        let staff = b.add_staff(Clef::treble());
        let v1 = b.add_voice("1", staff).unwrap();
        let v2 = b.add_voice("2", staff).unwrap();
        let unison_a = b.note(v1, vec![head('B', 4)], QUARTER).unwrap();
        let unison_b = b.note(v2, vec![head('B', 4)], QUARTER).unwrap();
        let second_a = b.note(v1, vec![head('C', 5)], QUARTER).unwrap();
        let second_b = b.note(v2, vec![head('B', 4)], QUARTER).unwrap();
        let cross_a = b.note(v1, vec![head('A', 4)], HALF).unwrap();
        let cross_b = b.note(v2, vec![head('C', 5)], QUARTER).unwrap();
        let mut tune = b.finish().unwrap();
        let ids = prepared(&mut tune);
        resolve_voice_collisions(&mut tune, &ids);
        assert_eq!(tune.sym(unison_a).x_shift, 0.0);
        assert_eq!(tune.sym(unison_b).x_shift, 0.0);
        assert!(approx_eq!(f64, tune.sym(second_a).x_shift, 2.0 * HW_FILLED, epsilon = 1e-9));
        assert_eq!(tune.sym(second_b).x_shift, 0.0);
        assert!(approx_eq!(f64, tune.sym(cross_a).x_shift, VOICE_SHIFT_CROSS_OPEN, epsilon = 1e-9));
        assert!(approx_eq!(f64, tune.sym(cross_b).dot_shift, VOICE_SHIFT_CROSS_OPEN, epsilon = 1e-9));
    }

    #[test]
    fn staves_keep_the_minimum_separation() {
        let mut b = TuneBuilder::new();
        let s1 = b.add_staff(Clef::treble());
        let s2 = b.add_staff(Clef::bass());
        let v1 = b.add_voice("1", s1).unwrap();
        let v2 = b.add_voice("2", s2).unwrap();
        b.note(v1, vec![head('C', 4)], WHOLE).unwrap();
        b.note(v2, vec![head('C', 3)], WHOLE).unwrap();
        let mut tune = b.finish().unwrap();
        let ids = prepared(&mut tune);
        let mut ctx = LayoutContext::new(&LayoutConfig::default());
        for &id in &ids {
            tune.sym_mut(id).x = 20.0;
        }
        set_extents(&mut tune, &ids);
        let mut work = LineWork::new(ids, 100.0);
        let metrics = finish_line(&mut ctx, &mut tune, &mut work);
        assert_ge!(tune.staves[1].y - tune.staves[0].y, ctx.config.staff_sep);
        assert_gt!(metrics.height, tune.staves[1].y);
        assert_ge!(metrics.advance, ctx.config.system_sep);
        assert_lt!(tune.staves[0].y, tune.staves[1].y);
    }

    /// Two treble staves with two whole notes each, the first column at
    /// x = 20 and the second far to the right; returns the separation.
    fn separation(config: &LayoutConfig, upper: (char, i32), lower: [(char, i32); 2]) -> (f64, LayoutContext) {
        let mut b = TuneBuilder::new();
        let s1 = b.add_staff(Clef::treble());
        let s2 = b.add_staff(Clef::treble());
        let v1 = b.add_voice("1", s1).unwrap();
        let v2 = b.add_voice("2", s2).unwrap();
        b.note(v1, vec![head(upper.0, upper.1)], WHOLE).unwrap();
        b.note(v1, vec![head('B', 4)], WHOLE).unwrap();
        for (step, octave) in lower {
            b.note(v2, vec![head(step, octave)], WHOLE).unwrap();
        }
        let mut tune = b.finish().unwrap();
        let ids = prepared(&mut tune);
        for &id in &ids {
            let s = tune.sym_mut(id);
            s.x = if s.time == 0 { 20.0 } else { 400.0 };
        }
        set_extents(&mut tune, &ids);
        let mut ctx = LayoutContext::new(config);
        let mut work = LineWork::new(ids, 500.0);
        finish_line(&mut ctx, &mut tune, &mut work);
        (tune.staves[1].y - tune.staves[0].y, ctx)
    }

    #[test]
    fn staves_only_clear_content_that_overlaps() {
        let config = LayoutConfig::default();
        let (apart, _) = separation(&config, ('C', 3), [('B', 4), ('C', 8)]);
        let (without_low, _) = separation(&config, ('B', 4), [('B', 4), ('C', 8)]);
        assert!(approx_eq!(f64, apart, without_low, epsilon = 1e-9));
        let (stacked, _) = separation(&config, ('C', 3), [('C', 8), ('B', 4)]);
        assert_gt!(stacked, apart);
    }

    #[test]
    fn staff_separation_is_clamped_and_reported() {
        let config = LayoutConfig { max_staff_sep: 50.0, verbosity: 1, ..LayoutConfig::default() };
        let (sep, ctx) = separation(&config, ('C', 3), [('C', 8), ('B', 4)]);
        assert!(approx_eq!(f64, sep, 50.0, epsilon = 1e-9));
        assert_ge!(ctx.diagnostics.count(DiagnosticKind::StaffOverlap), 1);
    }

    #[test]
    fn lyrics_sit_below_the_notes() {
        let mut b = TuneBuilder::new();
        let staff = b.add_staff(Clef::treble());
        let v = b.add_voice("1", staff).unwrap();
        let low = b.note(v, vec![head('G', 3)], QUARTER).unwrap();
        b.lyric(low, 0, Lyric::new("la")).unwrap();
        let mut tune = b.finish().unwrap();
        let ids = prepared(&mut tune);
        set_extents(&mut tune, &ids);
        let mut ctx = LayoutContext::new(&LayoutConfig::default());
        let mut work = LineWork::new(ids, 100.0);
        finish_line(&mut ctx, &mut tune, &mut work);
        let y = tune.staves[0].lyric_y[0];
        assert_lt!(y, tune.sym(low).y_min);
        assert_eq!(work.texts.iter().filter(|t| t.kind == TextKind::Lyric).count(), 1);
    }
}
