//! Beam geometry — one shared line per beamed word, fitted to the natural
//! stem ends, then flattened, clamped, lengthened and snapped.

use serde::{Deserialize, Serialize};

use crate::model::*;
use super::constants::*;
use super::LayoutContext;

/// x of the stem of a note.
pub(crate) fn stem_x(s: &Symbol) -> f64 {
    let off = if s.flags.grace { GRACE_STEM_XOFF } else { STEM_XOFF };
    s.x + s.x_shift + if s.stem > 0 { off } else { -off }
}

/// One beam line between two stem positions, `level` 0 being the outer
/// (primary) beam.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BeamSegment {
    pub level: u8,
    pub x1: f64,
    pub x2: f64,
}

/// Geometry of one beamed group.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Beam {
    pub first: SymbolId,
    pub last: SymbolId,
    /// Stemmed notes of the group in order
    pub notes: Vec<SymbolId>,
    pub staff: usize,
    pub up: bool,
    pub grace: bool,
    /// Least-squares slope before flattening and clamping
    pub fitted_slope: f64,
    /// Non-collinear notes had their slope reduced
    pub flattened: bool,
    pub slope: f64,
    pub intercept: f64,
    pub segments: Vec<BeamSegment>,
}

impl Beam {
    /// y of the outer beam line at `x`.
    pub fn y_at(&self, x: f64) -> f64 {
        self.slope * x + self.intercept
    }

    pub fn depth(&self) -> f64 {
        if self.grace {
            GRACE_BEAM_DEPTH
        } else {
            BEAM_DEPTH
        }
    }

    /// Distance between two beam levels.
    pub fn shift(&self) -> f64 {
        if self.grace {
            GRACE_BEAM_SHIFT
        } else {
            BEAM_SHIFT
        }
    }

    /// y of the outer edge of a segment at `x`.
    pub fn segment_y(&self, level: u8, x: f64) -> f64 {
        let dir = if self.up { 1.0 } else { -1.0 };
        self.y_at(x) - dir * level as f64 * self.shift()
    }
}

/// Stemmed notes of the word starting at `start`, following the voice list.
fn word_notes(tune: &Tune, start: SymbolId) -> Vec<SymbolId> {
    let mut notes = Vec::new();
    let mut cur = Some(start);
    while let Some(id) = cur {
        let s = tune.sym(id);
        match s.kind {
            SymbolKind::Note(_) => {
                if s.has_stem() {
                    notes.push(id);
                }
                if s.flags.word_end {
                    break;
                }
            }
            SymbolKind::Rest | SymbolKind::Grace(_) | SymbolKind::Tuplet(_) | SymbolKind::FormatChange(_) => {}
            _ => break,
        }
        cur = s.next;
    }
    notes
}

/// Compute the beams of a line and set the stem ends of the beamed notes.
pub fn compute_beams(ctx: &LayoutContext, tune: &mut Tune, ids: &[SymbolId]) -> Vec<Beam> {
    let mut beams = Vec::new();
    for (pos, &id) in ids.iter().enumerate() {
        let s = tune.sym(id);
        let group = match s.kind {
            SymbolKind::Note(_) if s.flags.word_start && s.beamable() && !s.flags.word_end => word_notes(tune, id),
            SymbolKind::Grace(_) => tune
                .grace_notes(id)
                .into_iter()
                .filter(|&g| tune.sym(g).beamable())
                .collect(),
            _ => continue,
        };
        if group.len() < 2 {
            continue;
        }
        let beam = fit_beam(ctx, tune, ids, pos, group);
        for &n in &beam.notes {
            let x = stem_x(tune.sym(n));
            tune.sym_mut(n).y_stem = beam.y_at(x);
        }
        beams.push(beam);
    }
    beams
}

/// Least-squares line through the points and the sum of squared residuals.
fn least_squares(points: &[(f64, f64)]) -> (f64, f64, f64) {
    let n = points.len() as f64;
    let (sx, sy) = points.iter().fold((0.0, 0.0), |(a, b), &(x, y)| (a + x, b + y));
    let sxx: f64 = points.iter().map(|&(x, _)| x * x).sum();
    let sxy: f64 = points.iter().map(|&(x, y)| x * y).sum();
    let den = n * sxx - sx * sx;
    let a = if den.abs() > 1e-9 { (n * sxy - sx * sy) / den } else { 0.0 };
    let b = (sy - a * sx) / n;
    let residual = points.iter().map(|&(x, y)| (y - (a * x + b)).powi(2)).sum();
    (a, b, residual)
}

/// Stem end each note needs at least.
fn required_end(s: &Symbol, up: bool, shift: f64) -> f64 {
    let (lo, hi) = s.step_range().unwrap_or((MIDDLE_STEP, MIDDLE_STEP));
    let (lo, hi) = (lo as f64 * STEP, hi as f64 * STEP);
    let flags = s.nflags.clamp(0, 5) as usize;
    let inner = (s.nflags.max(1) - 1) as f64 * shift;
    if s.flags.grace {
        return if up { hi + GRACE_STEM_MIN + inner } else { lo - GRACE_STEM_MIN - inner };
    }
    let min = if s.heads().len() > 1 { STEM_MIN_CHORD[flags] } else { STEM_MIN[flags] };
    if up {
        (hi + min + inner).max(STAFF_MIDDLE)
    } else {
        (lo - min - inner).min(STAFF_MIDDLE)
    }
}

fn snap(b: f64, up: bool, required: f64) -> f64 {
    let below = ((b - BEAM_OFFSET) / STEP).floor() * STEP + BEAM_OFFSET;
    let above = below + STEP;
    // nearest grid position that still keeps every stem long enough
    let ok = |c: f64| if up { c >= required - 1e-9 } else { c <= required + 1e-9 };
    let (near, far) = if b - below <= above - b { (below, above) } else { (above, below) };
    if ok(near) {
        near
    } else if ok(far) {
        far
    } else {
        b
    }
}

fn fit_beam(ctx: &LayoutContext, tune: &Tune, ids: &[SymbolId], pos: usize, notes: Vec<SymbolId>) -> Beam {
    let first = notes[0];
    let last = notes[notes.len() - 1];
    let s0 = tune.sym(first);
    let (up, grace, staff) = (s0.stem > 0, s0.flags.grace, s0.staff);
    let mut beam = Beam {
        first,
        last,
        notes: Vec::new(),
        staff,
        up,
        grace,
        fitted_slope: 0.0,
        flattened: false,
        slope: 0.0,
        intercept: 0.0,
        segments: Vec::new(),
    };
    let shift = beam.shift();
    let points: Vec<(f64, f64)> = notes
        .iter()
        .map(|&n| (stem_x(tune.sym(n)), tune.sym(n).y_stem))
        .collect();

    if ctx.config.flat_beams {
        beam.intercept = if up { FLAT_BEAM_Y_UP } else { FLAT_BEAM_Y };
    } else {
        let n = points.len();
        let (fitted, _, residual) = least_squares(&points);
        beam.fitted_slope = fitted;
        let mut a = fitted;
        if n >= 3 && residual / (n - 2) as f64 > BEAM_RESIDUAL {
            a *= BEAM_FLATFAC;
            beam.flattened = true;
        }
        a = if grace {
            a.clamp(-BEAM_SLOPE, BEAM_SLOPE)
        } else {
            BEAM_SLOPE * a / (BEAM_SLOPE + a.abs())
        };
        let span = points[n - 1].0 - points[0].0;
        if (a * span / (20.0 * (n - 1) as f64)).powi(2) < BEAM_THRESH {
            a = 0.0;
        }
        let (mx, my) = (
            points.iter().map(|p| p.0).sum::<f64>() / n as f64,
            points.iter().map(|p| p.1).sum::<f64>() / n as f64,
        );
        beam.slope = a;
        beam.intercept = my - a * mx;

        // stem minimums: one shift of the whole beam
        let deficit = notes
            .iter()
            .zip(&points)
            .map(|(&id, &(x, _))| {
                let need = required_end(tune.sym(id), up, shift);
                if up {
                    need - beam.y_at(x)
                } else {
                    beam.y_at(x) - need
                }
            })
            .fold(0.0, f64::max);
        beam.intercept += if up { deficit } else { -deficit };

        if !grace {
            clear_obstacles(tune, ids, pos, &mut beam);
            if beam.slope == 0.0 {
                let required = notes
                    .iter()
                    .map(|&id| required_end(tune.sym(id), up, shift))
                    .fold(if up { f64::NEG_INFINITY } else { f64::INFINITY }, |acc, r| {
                        if up {
                            acc.max(r)
                        } else {
                            acc.min(r)
                        }
                    });
                beam.intercept = snap(beam.intercept, up, required);
            }
        }
    }
    beam.segments = segments(tune, &notes, &beam);
    beam.notes = notes;
    beam
}

/// Raise (or lower) the beam over clefs, bars and grace groups inside it.
fn clear_obstacles(tune: &Tune, ids: &[SymbolId], pos: usize, beam: &mut Beam) {
    let Some(end) = ids.iter().skip(pos).position(|&id| id == beam.last).map(|p| p + pos) else { return };
    let levels = beam.notes_levels(tune);
    let thickness = beam.depth() + levels as f64 * beam.shift();
    let mut deficit: f64 = 0.0;
    for &id in &ids[pos + 1..end] {
        let s = tune.sym(id);
        if s.staff != beam.staff || !matches!(s.kind, SymbolKind::Clef(_) | SymbolKind::Bar(_) | SymbolKind::Grace(_)) {
            continue;
        }
        let y = beam.y_at(s.x);
        let d = if beam.up {
            s.y_max + BEAM_CLEARANCE - (y - thickness)
        } else {
            (y + thickness) - (s.y_min - BEAM_CLEARANCE)
        };
        deficit = deficit.max(d);
    }
    if deficit > 0.0 {
        beam.intercept += if beam.up { deficit } else { -deficit };
    }
}

impl Beam {
    fn notes_levels(&self, tune: &Tune) -> u8 {
        self.notes
            .iter()
            .map(|&id| tune.sym(id).nflags.max(1) as u8 - 1)
            .max()
            .unwrap_or(0)
    }
}

fn breaks_before(s: &Symbol, level: u8) -> bool {
    (level >= 1 && (s.flags.beam_break || s.flags.tuplet_start)) || (level >= 2 && s.flags.beam_break2)
}

/// Primary beam over the whole group, then runs and stubs per level.
fn segments(tune: &Tune, notes: &[SymbolId], beam: &Beam) -> Vec<BeamSegment> {
    let xs: Vec<f64> = notes.iter().map(|&n| stem_x(tune.sym(n))).collect();
    let flags: Vec<i8> = notes.iter().map(|&n| tune.sym(n).nflags).collect();
    let mut out = vec![BeamSegment { level: 0, x1: xs[0], x2: xs[xs.len() - 1] }];
    let max_level = flags.iter().copied().max().unwrap_or(1).max(1) as u8;
    let stub = if beam.grace { BEAM_STUB * 0.6 } else { BEAM_STUB };
    for level in 1..max_level {
        let mut i = 0;
        while i < notes.len() {
            if flags[i] as u8 <= level {
                i += 1;
                continue;
            }
            let start = i;
            i += 1;
            while i < notes.len() && flags[i] as u8 > level && !breaks_before(tune.sym(notes[i]), level) {
                i += 1;
            }
            let end = i - 1;
            if end > start {
                out.push(BeamSegment { level, x1: xs[start], x2: xs[end] });
                continue;
            }
            let next_breaks = notes.get(start + 1).map_or(false, |&n| breaks_before(tune.sym(n), level));
            let left = if start == 0 {
                false
            } else if start == notes.len() - 1 {
                true
            } else {
                flags[start - 1] < flags[start] || next_breaks
            };
            let (x1, x2) = if left { (xs[start] - stub, xs[start]) } else { (xs[start], xs[start] + stub) };
            out.push(BeamSegment { level, x1, x2 });
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builder::TuneBuilder;
    use crate::config::LayoutConfig;
    use crate::engine::vertical::{map_pitches, place_heads, set_stems};
    use float_cmp::approx_eq;
    use more_asserts::{assert_ge, assert_le, assert_lt};
    use pretty_assertions::assert_eq;

    fn layout(notes: &[(char, i32, i32)], config: &LayoutConfig) -> (Tune, Vec<Beam>) {
        let mut b = TuneBuilder::new();
        let staff = b.add_staff(Clef::treble());
        let v = b.add_voice("1", staff).unwrap();
        for &(step, octave, len) in notes {
            b.note(v, vec![NoteHead::new(diatonic(step, octave))], len).unwrap();
        }
        let mut tune = b.finish().unwrap();
        map_pitches(&mut tune);
        let ids = tune.ts_ids(tune.ts_first);
        set_stems(&mut tune, &ids);
        place_heads(&mut tune, &ids);
        for (i, &id) in ids.iter().enumerate() {
            tune.sym_mut(id).x = 30.0 * i as f64;
        }
        let ctx = LayoutContext::new(config);
        let beams = compute_beams(&ctx, &mut tune, &ids);
        (tune, beams)
    }

    #[test]
    fn equal_pitches_give_a_flat_snapped_beam() {
        let (tune, beams) = layout(&[('A', 4, EIGHTH); 4], &LayoutConfig::default());
        assert_eq!(beams.len(), 1);
        let beam = &beams[0];
        assert_eq!(beam.slope, 0.0);
        let grid = (beam.intercept - BEAM_OFFSET) / STEP;
        assert!(approx_eq!(f64, grid, grid.round(), epsilon = 1e-9));
        for &n in &beam.notes {
            let s = tune.sym(n);
            assert_ge!(s.y_stem - s.heads()[0].step as f64 * STEP, STEM_MIN[1] - 1e-9);
        }
    }

    #[test]
    fn steep_lines_are_clamped() {
        let (_, beams) = layout(&[('C', 4, EIGHTH), ('C', 6, EIGHTH)], &LayoutConfig::default());
        let beam = &beams[0];
        assert_lt!(beam.slope.abs(), BEAM_SLOPE);
        assert_le!(beam.slope.abs(), beam.fitted_slope.abs());
    }

    #[test]
    fn zigzag_words_are_flattened() {
        let notes = [('C', 4, EIGHTH), ('A', 5, EIGHTH), ('D', 4, EIGHTH), ('B', 5, EIGHTH)];
        let (_, beams) = layout(&notes, &LayoutConfig::default());
        let beam = &beams[0];
        assert!(beam.flattened);
        assert_le!(beam.slope.abs(), beam.fitted_slope.abs());
    }

    #[test]
    fn sixteenth_after_dotted_eighth_gets_a_left_stub() {
        let notes = [('A', 4, EIGHTH + SIXTEENTH), ('A', 4, SIXTEENTH)];
        let (tune, beams) = layout(&notes, &LayoutConfig::default());
        let beam = &beams[0];
        assert_eq!(beam.segments.len(), 2);
        let stub = beam.segments[1];
        assert_eq!(stub.level, 1);
        let x = stem_x(tune.sym(beam.last));
        assert!(approx_eq!(f64, stub.x2, x, epsilon = 1e-9));
        assert!(approx_eq!(f64, stub.x1, x - BEAM_STUB, epsilon = 1e-9));
    }

    #[test]
    fn secondary_beams_join_runs() {
        let notes = [('A', 4, EIGHTH), ('A', 4, SIXTEENTH), ('A', 4, SIXTEENTH)];
        let (_, beams) = layout(&notes, &LayoutConfig::default());
        let levels: Vec<u8> = beams[0].segments.iter().map(|s| s.level).collect();
        assert_eq!(levels, vec![0, 1]);
    }

    #[test]
    fn bagpipe_beams_are_fixed() {
        let config = LayoutConfig { flat_beams: true, ..LayoutConfig::default() };
        let (_, beams) = layout(&[('B', 5, EIGHTH); 3], &config);
        assert_eq!(beams[0].slope, 0.0);
        assert_eq!(beams[0].intercept, FLAT_BEAM_Y);
    }
}
