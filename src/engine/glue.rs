//! Glue solver — maps the elastic spacing of a line onto x positions.
//!
//! Every moment advances by `alpha*shrink + beta*stretch + (1-alpha-beta)*space`
//! from the previous one.  One pair of factors is solved for the whole line
//! so that the last moment (plus the halo of a trailing non-bar symbol) lands
//! on the line width.

use serde::{Deserialize, Serialize};

use crate::error::DiagnosticKind;
use crate::model::*;
use super::vertical::rest_base;
use super::width::{is_transparent, moments_of};
use super::LayoutContext;

const EPS: f64 = 1e-6;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum GlueStatus {
    /// Natural spacing, nothing to fill
    Natural,
    Shrunk,
    Stretched,
    /// Too wide even at maximum shrink and no cut was possible
    Overfull,
    /// Could not be stretched to the full width
    Underfull,
}

/// Shrink and stretch factors of one line and the width they produce.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Glue {
    pub alpha: f64,
    pub beta: f64,
    pub status: GlueStatus,
    pub width: f64,
}

impl Glue {
    pub fn natural() -> Self {
        Self { alpha: 0.0, beta: 0.0, status: GlueStatus::Natural, width: 0.0 }
    }

    /// Advance of one moment under these factors.
    pub fn advance(&self, shrink: f64, space: f64, stretch: f64) -> f64 {
        self.alpha * shrink + self.beta * stretch + (1.0 - self.alpha - self.beta) * space
    }
}

/// Result of fitting a line.
#[derive(Debug, Clone, PartialEq)]
pub enum GlueOutcome {
    /// The line fits; positions are set
    Fit { glue: Glue, moments: Vec<Moment> },
    /// The line is overfull: keep symbols up to and including `at`
    Cut { at: SymbolId },
}

/// Symbols sharing one `(time, seq)` and their common advance.
#[derive(Debug, Clone, PartialEq)]
pub struct Moment {
    pub ids: Vec<SymbolId>,
    pub time: i32,
    pub shrink: f64,
    pub space: f64,
    pub stretch: f64,
    /// Largest right halo, the line tail when this moment ends it
    pub right: f64,
    pub bar: bool,
    /// A bar closing an overlong measure
    pub wrong_duration: bool,
    pub key: bool,
    pub notes: usize,
    /// Re-created clef, key, meter or carried bar at the line start
    pub leading: bool,
    pub transparent: bool,
}

// ═══════════════════════════════════════════════════════════════════════
// Moments
// ═══════════════════════════════════════════════════════════════════════

/// Build the moments of a line from the per-symbol spacing.
///
/// The advance of a moment is the smallest `space` among its symbols whose
/// `shrink` is minimal, raised to the largest `shrink` so no symbol of the
/// moment collides with its predecessor.
pub fn collect_moments(tune: &Tune, ids: &[SymbolId]) -> Vec<Moment> {
    let mut moments = Vec::new();
    for group in moments_of(tune, ids) {
        let first = tune.sym(group[0]);
        let transparent = group.iter().all(|&id| is_transparent(tune.sym(id)));
        let shrink = group.iter().map(|&id| tune.sym(id).shrink).fold(0.0, f64::max);
        let min_shrink = group.iter().map(|&id| tune.sym(id).shrink).fold(f64::INFINITY, f64::min);
        let (space, stretch) = group
            .iter()
            .map(|&id| tune.sym(id))
            .filter(|s| s.shrink <= min_shrink + EPS)
            .map(|s| (s.space, s.stretch))
            .fold((f64::INFINITY, 0.0), |acc, v| if v.0 < acc.0 { v } else { acc });
        let space = if space.is_finite() { space.max(shrink) } else { shrink };
        let stretch = stretch.max(space);
        let bar = group.iter().any(|&id| tune.sym(id).is_bar());
        moments.push(Moment {
            time: first.time,
            shrink,
            space,
            stretch,
            right: group.iter().map(|&id| tune.sym(id).w_right).fold(0.0, f64::max),
            bar,
            wrong_duration: group
                .iter()
                .any(|&id| tune.sym(id).bar().map_or(false, |b| b.wrong_duration)),
            key: group.iter().any(|&id| matches!(tune.sym(id).kind, SymbolKind::KeySig(_))),
            notes: group.iter().filter(|&&id| tune.sym(id).is_note()).count(),
            leading: first.seq <= SEQ_LINE_BAR,
            transparent,
            ids: group,
        });
    }
    moments
}

fn next_solid(moments: &[Moment], i: usize) -> Option<usize> {
    (i + 1..moments.len()).find(|&j| !moments[j].transparent)
}

fn prev_solid(moments: &[Moment], i: usize) -> Option<usize> {
    (0..i).rev().find(|&j| !moments[j].transparent)
}

/// Blend the spacing of moment `i` and the bar moment `j` after it towards
/// their average; `ratio` 1 centres `i` between its neighbours.
fn center_between(moments: &mut [Moment], i: usize, j: usize, ratio: f64) {
    let avg = |a: f64, b: f64| (a + b) / 2.0;
    let (sh, sp, st) = (
        avg(moments[i].shrink, moments[j].shrink),
        avg(moments[i].space, moments[j].space),
        avg(moments[i].stretch, moments[j].stretch),
    );
    for k in [i, j] {
        let m = &mut moments[k];
        m.shrink = (1.0 - ratio) * m.shrink + ratio * sh;
        m.space = (1.0 - ratio) * m.space + ratio * sp;
        m.stretch = (1.0 - ratio) * m.stretch + ratio * st;
    }
}

/// Whole-measure rests are centred between their bars and drawn with the
/// glyph matching the measure length; a lone note of a single-voice tune is
/// nudged towards the centre of its measure.
pub fn center_measure_rests(ctx: &LayoutContext, tune: &mut Tune, moments: &mut [Moment]) {
    let solo = tune.voices.len() == 1;
    for i in 0..moments.len() {
        let Some(j) = next_solid(moments, i) else { continue };
        if !moments[j].bar || moments[i].bar || moments[i].leading || moments[i].transparent {
            continue;
        }
        let opens_measure = match prev_solid(moments, i) {
            None => true,
            Some(p) => moments[p].bar || moments[p].leading,
        };
        if !opens_measure {
            continue;
        }
        let bar_time = moments[j].time;
        let all_rests = moments[i].ids.iter().all(|&id| {
            let s = tune.sym(id);
            s.is_rest() && s.end_time() == bar_time
        });
        if all_rests {
            for &id in &moments[i].ids {
                let s = tune.sym_mut(id);
                let offset = s.y - rest_base(s);
                s.head = if s.duration >= 2 * WHOLE {
                    HeadType::Breve
                } else if s.duration >= HALF {
                    HeadType::Whole
                } else {
                    HeadType::Half
                };
                s.dots = 0;
                s.flags.measure_rest = true;
                s.y = rest_base(s) + offset;
            }
            center_between(moments, i, j, 1.0);
        } else if solo && moments[i].notes == 1 && moments[i].ids.len() == 1 {
            let id = moments[i].ids[0];
            if tune.sym(id).end_time() == bar_time && ctx.config.solo_center_ratio > 0.0 {
                center_between(moments, i, j, ctx.config.solo_center_ratio);
            }
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════
// Overfull detection
// ═══════════════════════════════════════════════════════════════════════

fn min_advance(m: &Moment, max_shrink: f64) -> f64 {
    max_shrink * m.shrink + (1.0 - max_shrink) * m.space
}

fn tail(m: &Moment) -> f64 {
    if m.bar {
        0.0
    } else {
        m.right
    }
}

/// Look for the point where the line stops fitting at maximum shrink.
///
/// Returns the last symbol to keep.  The cut backs up to the nearest bar
/// (kept) or key signature (moved to the next line); bars closing overlong
/// measures are never used.  At least one content moment always stays on the
/// line.
pub fn find_cut(moments: &[Moment], width: f64, max_shrink: f64) -> Option<SymbolId> {
    let first_content = moments.iter().position(|m| !m.leading && !m.transparent)?;
    let mut total = 0.0;
    let mut bars = 0usize;
    let mut notes = 0usize;
    for (i, m) in moments.iter().enumerate() {
        total += min_advance(m, max_shrink);
        if i > first_content && total + tail(m) > width + EPS && (bars > 1 || notes > 1) {
            return Some(back_up(moments, i, first_content));
        }
        if m.bar {
            bars += 1;
        }
        notes += m.notes;
    }
    None
}

fn back_up(moments: &[Moment], overflow: usize, first_content: usize) -> SymbolId {
    let keep = |k: usize| moments[k].ids[moments[k].ids.len() - 1];
    for j in (first_content..overflow).rev() {
        let m = &moments[j];
        if m.bar && !m.wrong_duration {
            return keep(j);
        }
        if m.key && !m.leading && j > first_content {
            return keep(j - 1);
        }
    }
    keep(overflow - 1)
}

// ═══════════════════════════════════════════════════════════════════════
// Solving
// ═══════════════════════════════════════════════════════════════════════

struct Sums {
    shrink: f64,
    space: f64,
    stretch: f64,
    tail: f64,
}

fn sums(moments: &[Moment]) -> Sums {
    let mut s = Sums { shrink: 0.0, space: 0.0, stretch: 0.0, tail: 0.0 };
    for m in moments {
        s.shrink += m.shrink;
        s.space += m.space;
        s.stretch += m.stretch;
    }
    if let Some(m) = moments.iter().rev().find(|m| !m.transparent) {
        s.tail = tail(m);
    }
    s
}

fn realized(g: &Glue, s: &Sums) -> f64 {
    g.advance(s.shrink, s.space, s.stretch) + s.tail
}

/// Solve the glue factors of a line of width `width`.
pub fn solve(ctx: &mut LayoutContext, moments: &[Moment], width: f64, last_line: bool) -> Glue {
    let cfg = &ctx.config;
    let s = sums(moments);
    let target = width - s.tail;
    let mut glue = Glue::natural();

    if s.space > target + EPS {
        let alpha = if s.space - s.shrink > EPS { (s.space - target) / (s.space - s.shrink) } else { 1.0 };
        if alpha > cfg.max_shrink {
            glue.alpha = cfg.max_shrink;
            glue.status = GlueStatus::Overfull;
            glue.width = realized(&glue, &s);
            ctx.diagnostics.capacity(
                DiagnosticKind::Overfull,
                moments.first().and_then(|m| m.ids.first().copied()),
                format!("line {} is {:.1} units too wide", ctx.line, glue.width - width),
            );
            return glue;
        }
        glue.alpha = alpha;
        glue.status = GlueStatus::Shrunk;
        glue.width = realized(&glue, &s);
        return glue;
    }

    let natural_width = s.space + s.tail;
    if !cfg.stretch_staff || target - s.space <= EPS {
        glue.width = natural_width;
        return glue;
    }

    if last_line && natural_width < cfg.stretch_last * width {
        if let Some(prev) = ctx.prev_glue {
            let candidate = Glue { status: GlueStatus::Natural, ..prev };
            let w = realized(&candidate, &s);
            if w <= width + EPS {
                return Glue { width: w, ..candidate };
            }
        }
        glue.width = natural_width;
        return glue;
    }

    let beta = if s.stretch - s.space > EPS { (target - s.space) / (s.stretch - s.space) } else { f64::INFINITY };
    if beta <= cfg.max_stretch {
        glue.beta = beta;
        glue.status = GlueStatus::Stretched;
        glue.width = realized(&glue, &s);
        return glue;
    }

    ctx.diagnostics.capacity(
        DiagnosticKind::Underfull,
        moments.first().and_then(|m| m.ids.first().copied()),
        format!("line {} needs stretch {:.2}, maximum is {:.2}", ctx.line, beta, cfg.max_stretch),
    );
    glue = match ctx.prev_glue {
        Some(prev) => Glue { status: GlueStatus::Underfull, ..prev },
        None => Glue { alpha: 0.0, beta: cfg.max_stretch, status: GlueStatus::Underfull, width: 0.0 },
    };
    glue.width = realized(&glue, &s);
    glue
}

/// x of every moment under `glue`.
pub fn positions(moments: &[Moment], glue: &Glue) -> Vec<f64> {
    moments
        .iter()
        .scan(0.0, |x, m| {
            *x += glue.advance(m.shrink, m.space, m.stretch);
            Some(*x)
        })
        .collect()
}

/// Set the x of every symbol from the moment advances.  Returns the width.
pub fn apply(tune: &mut Tune, moments: &[Moment], glue: &Glue) -> f64 {
    let xs = positions(moments, glue);
    for (m, &x) in moments.iter().zip(&xs) {
        for &id in &m.ids {
            tune.sym_mut(id).x = x;
        }
    }
    let last_tail = moments.iter().rev().find(|m| !m.transparent).map_or(0.0, tail);
    xs.last().copied().unwrap_or(0.0) + last_tail
}

/// Fit one line: detect overfull content, else solve and place.
///
/// With `allow_cut` unset an overfull line is placed at maximum shrink.
pub fn fit_line(ctx: &mut LayoutContext, tune: &mut Tune, ids: &[SymbolId], last_line: bool, allow_cut: bool) -> GlueOutcome {
    let mut moments = collect_moments(tune, ids);
    center_measure_rests(ctx, tune, &mut moments);
    let width = ctx.width;
    if allow_cut {
        if let Some(at) = find_cut(&moments, width, ctx.config.max_shrink) {
            log::trace!("line {}: overfull, cutting after {}", ctx.line, at);
            return GlueOutcome::Cut { at };
        }
    }
    let mut glue = solve(ctx, &moments, width, last_line);
    glue.width = apply(tune, &moments, &glue);
    GlueOutcome::Fit { glue, moments }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builder::TuneBuilder;
    use crate::config::LayoutConfig;
    use crate::engine::width::{set_spacing, set_widths};
    use float_cmp::approx_eq;
    use more_asserts::{assert_ge, assert_lt};
    use pretty_assertions::assert_eq;

    fn moment(id: usize, shrink: f64, space: f64, stretch: f64, bar: bool) -> Moment {
        Moment {
            ids: vec![SymbolId(id)],
            time: id as i32,
            shrink,
            space,
            stretch,
            right: 4.0,
            bar,
            wrong_duration: false,
            key: false,
            notes: usize::from(!bar),
            leading: false,
            transparent: false,
        }
    }

    #[test]
    fn shrinks_to_width() {
        let mut ctx = LayoutContext::new(&LayoutConfig::default());
        let moments = vec![moment(0, 10.0, 40.0, 72.0, false), moment(1, 10.0, 40.0, 72.0, true)];
        let glue = solve(&mut ctx, &moments, 65.0, false);
        assert_eq!(glue.status, GlueStatus::Shrunk);
        assert!(approx_eq!(f64, glue.alpha, 0.5, epsilon = 1e-9));
        assert!(approx_eq!(f64, glue.width, 65.0, epsilon = 1e-9));
    }

    #[test]
    fn stretches_to_width() {
        let mut ctx = LayoutContext::new(&LayoutConfig::default());
        let moments = vec![moment(0, 10.0, 40.0, 72.0, false), moment(1, 10.0, 40.0, 72.0, true)];
        let glue = solve(&mut ctx, &moments, 100.0, false);
        assert_eq!(glue.status, GlueStatus::Stretched);
        assert!(approx_eq!(f64, glue.width, 100.0, epsilon = 1e-9));
    }

    #[test]
    fn underfull_reuses_previous_line() {
        let mut ctx = LayoutContext::new(&LayoutConfig::default());
        ctx.prev_glue = Some(Glue { alpha: 0.0, beta: 0.3, status: GlueStatus::Stretched, width: 600.0 });
        let moments = vec![moment(0, 10.0, 40.0, 72.0, false), moment(1, 10.0, 40.0, 72.0, true)];
        let glue = solve(&mut ctx, &moments, 600.0, false);
        assert_eq!(glue.status, GlueStatus::Underfull);
        assert!(approx_eq!(f64, glue.beta, 0.3, epsilon = 1e-9));
    }

    #[test]
    fn underfull_without_stretching_is_left_short() {
        let config = LayoutConfig { stretch_staff: false, ..LayoutConfig::default() };
        let mut ctx = LayoutContext::new(&config);
        ctx.prev_glue = Some(Glue { alpha: 0.0, beta: 0.3, status: GlueStatus::Stretched, width: 600.0 });
        let moments = vec![moment(0, 10.0, 40.0, 72.0, false), moment(1, 10.0, 40.0, 72.0, true)];
        let glue = solve(&mut ctx, &moments, 600.0, false);
        assert_eq!(glue.status, GlueStatus::Natural);
        assert_eq!((glue.alpha, glue.beta), (0.0, 0.0));
        assert_eq!(positions(&moments, &glue), vec![40.0, 80.0]);
        assert_lt!(glue.width, 600.0);
    }

    fn lone_whole_note() -> (Tune, SymbolId, Vec<SymbolId>) {
        let mut b = TuneBuilder::new();
        let staff = b.add_staff(Clef::treble());
        let v = b.add_voice("1", staff).unwrap();
        let b4 = || vec![NoteHead::new(diatonic('B', 4))];
        for _ in 0..4 {
            b.note(v, b4(), QUARTER).unwrap();
        }
        b.bar(v, BarType::Single).unwrap();
        let lone = b.note(v, b4(), WHOLE).unwrap();
        b.bar(v, BarType::Single).unwrap();
        let mut tune = b.finish().unwrap();
        let ids = tune.ts_ids(tune.ts_first);
        set_widths(&mut tune, &ids);
        set_spacing(&mut tune, &ids);
        (tune, lone, ids)
    }

    #[test]
    fn lone_note_is_nudged_towards_the_measure_centre() {
        let (mut tune, lone, ids) = lone_whole_note();
        let plain = collect_moments(&tune, &ids);
        let i = plain.iter().position(|m| m.ids.contains(&lone)).expect("moment of the lone note");
        let j = i + 1;
        assert!(plain[j].bar);

        let off = LayoutContext::new(&LayoutConfig { solo_center_ratio: 0.0, ..LayoutConfig::default() });
        let mut untouched = plain.clone();
        center_measure_rests(&off, &mut tune, &mut untouched);
        assert_eq!(untouched, plain);

        let ctx = LayoutContext::new(&LayoutConfig { solo_center_ratio: 0.5, ..LayoutConfig::default() });
        let mut nudged = plain.clone();
        center_measure_rests(&ctx, &mut tune, &mut nudged);
        let avg = (plain[i].space + plain[j].space) / 2.0;
        assert!(approx_eq!(f64, nudged[i].space, 0.5 * plain[i].space + 0.5 * avg, epsilon = 1e-9));
        assert!(approx_eq!(f64, nudged[j].space, 0.5 * plain[j].space + 0.5 * avg, epsilon = 1e-9));
        // the full measure before it is left alone
        assert_eq!(nudged[..i], plain[..i]);
    }

    #[test]
    fn cut_backs_up_to_the_last_bar() {
        let moments = vec![
            moment(0, 10.0, 40.0, 72.0, false),
            moment(1, 10.0, 40.0, 72.0, true),
            moment(2, 10.0, 40.0, 72.0, false),
            moment(3, 10.0, 40.0, 72.0, false),
            moment(4, 10.0, 40.0, 72.0, true),
        ];
        // minimum advance per moment at alpha 0.5 is 25
        let cut = find_cut(&moments, 90.0, 0.5);
        assert_eq!(cut, Some(SymbolId(1)));
        assert_eq!(find_cut(&moments, 200.0, 0.5), None);
    }

    #[test]
    fn cut_skips_wrong_duration_bars() {
        let mut moments = vec![
            moment(0, 10.0, 40.0, 72.0, false),
            moment(1, 10.0, 40.0, 72.0, true),
            moment(2, 10.0, 40.0, 72.0, false),
            moment(3, 10.0, 40.0, 72.0, true),
            moment(4, 10.0, 40.0, 72.0, false),
            moment(5, 10.0, 40.0, 72.0, false),
        ];
        moments[3].wrong_duration = true;
        let cut = find_cut(&moments, 120.0, 0.5);
        assert_eq!(cut, Some(SymbolId(1)));
    }

    #[test]
    fn applied_positions_never_decrease() {
        let mut ctx = LayoutContext::new(&LayoutConfig::default());
        let moments = vec![
            moment(0, 10.0, 40.0, 72.0, false),
            moment(1, 0.0, 0.0, 0.0, false),
            moment(2, 12.0, 30.0, 54.0, true),
        ];
        let glue = solve(&mut ctx, &moments, 60.0, false);
        let xs = positions(&moments, &glue);
        for pair in xs.windows(2) {
            assert_ge!(pair[1], pair[0]);
        }
        for m in &moments {
            assert_ge!(glue.advance(m.shrink, m.space, m.stretch) + EPS, m.shrink);
        }
    }

    #[test]
    fn solving_twice_gives_the_same_positions() {
        let mut ctx = LayoutContext::new(&LayoutConfig::default());
        let moments = vec![moment(0, 10.0, 40.0, 72.0, false), moment(1, 12.0, 30.0, 54.0, true)];
        let first = solve(&mut ctx, &moments, 90.0, false);
        let second = solve(&mut ctx, &moments, 90.0, false);
        assert_eq!(positions(&moments, &first), positions(&moments, &second));
    }
}
