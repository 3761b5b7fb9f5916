//! Slur, tie and lyric hyphen geometry, and the carry-over of everything
//! still open at the end of a line.
//!
//! Each voice of a line is read as a tree of spans: plain symbols, grace
//! groups and tuplet groups.  Slurs are matched over the flattened tree with
//! a stack; ties look for the same pitch in the next note of the voice.

use std::collections::HashSet;

use serde::{Deserialize, Serialize};

use crate::draw::{CurveKind, Point};
use crate::error::DiagnosticKind;
use crate::model::*;
use super::beam::stem_x;
use super::constants::*;
use super::vertical::staff_voices;
use super::width::{head_half_width, text_width};
use super::{Curve, HyphenRun, LayoutContext, LineWork, Segment, StaffPoint};

/// Open ties, slurs and hyphens entering and leaving one line.
///
/// Entering items are either closed on the line or pass through it; leaving
/// items are the ones passing through plus the ones opened on the line.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CarryReport {
    pub ties_in: usize,
    pub ties_closed: usize,
    pub ties_through: usize,
    pub ties_opened: usize,
    pub ties_out: usize,
    pub slurs_in: usize,
    pub slurs_closed: usize,
    pub slurs_through: usize,
    pub slurs_opened: usize,
    pub slurs_out: usize,
    pub hyphens_in: usize,
    pub hyphens_out: usize,
}

impl CarryReport {
    pub fn is_balanced(&self) -> bool {
        self.ties_in == self.ties_closed + self.ties_through
            && self.ties_out == self.ties_through + self.ties_opened
            && self.slurs_in == self.slurs_closed + self.slurs_through
            && self.slurs_out == self.slurs_through + self.slurs_opened
    }
}

// ═══════════════════════════════════════════════════════════════════════
// Span tree
// ═══════════════════════════════════════════════════════════════════════

enum Span {
    Leaf(SymbolId),
    Grace(Vec<Span>),
    Tuplet(Vec<Span>),
}

enum Scan {
    Continue,
    Done,
}

fn scan(spans: &[Span], visit: &mut dyn FnMut(SymbolId) -> Scan) -> Scan {
    for span in spans {
        let result = match span {
            Span::Leaf(id) => visit(*id),
            Span::Grace(inner) | Span::Tuplet(inner) => scan(inner, visit),
        };
        if let Scan::Done = result {
            return Scan::Done;
        }
    }
    Scan::Continue
}

/// Span tree of one voice over the symbols of a line.
fn voice_spans(tune: &Tune, ids: &[SymbolId], voice: usize) -> Vec<Span> {
    let mut stack: Vec<Vec<Span>> = vec![Vec::new()];
    for &id in ids.iter().filter(|&&id| tune.sym(id).voice == voice) {
        let s = tune.sym(id);
        let span = match s.kind {
            SymbolKind::Tuplet(t) if t.r > 0 => {
                stack.push(Vec::new());
                continue;
            }
            SymbolKind::Grace(_) => Span::Grace(tune.grace_notes(id).into_iter().map(Span::Leaf).collect()),
            _ => Span::Leaf(id),
        };
        if let Some(top) = stack.last_mut() {
            top.push(span);
        }
        if s.flags.tuplet_end && stack.len() > 1 {
            close_group(&mut stack);
        }
    }
    // tuplets cut by the line end
    while stack.len() > 1 {
        close_group(&mut stack);
    }
    stack.pop().unwrap_or_default()
}

fn close_group(stack: &mut Vec<Vec<Span>>) {
    if let Some(inner) = stack.pop() {
        if let Some(top) = stack.last_mut() {
            top.push(Span::Tuplet(inner));
        }
    }
}

fn flatten(spans: &[Span]) -> Vec<SymbolId> {
    let mut out = Vec::new();
    scan(spans, &mut |id| {
        out.push(id);
        Scan::Continue
    });
    out
}

fn first_note(tune: &Tune, spans: &[Span]) -> Option<SymbolId> {
    let mut found = None;
    scan(spans, &mut |id| {
        let s = tune.sym(id);
        if s.is_note() && !s.flags.grace {
            found = Some(id);
            Scan::Done
        } else {
            Scan::Continue
        }
    });
    found
}

/// One voice on the current line.
struct VoiceLine {
    leaves: Vec<SymbolId>,
    /// First main note
    lead: Option<SymbolId>,
    /// On a shared staff: whether this is the upper voice
    upper: Option<bool>,
}

/// Compute every slur, tie and hyphen of a line and update the carry-over
/// state of each voice.
pub fn compute_curves(ctx: &mut LayoutContext, tune: &mut Tune, work: &mut LineWork) -> CarryReport {
    let on_line: HashSet<SymbolId> = work.ids.iter().copied().collect();
    let shared = staff_voices(tune, &work.ids);
    let mut report = CarryReport::default();
    for v in 0..tune.voices.len() {
        let spans = voice_spans(tune, &work.ids, v);
        let line = VoiceLine {
            leaves: flatten(&spans),
            lead: first_note(tune, &spans),
            upper: shared
                .get(&tune.voices[v].staff)
                .filter(|voices| voices.len() > 1)
                .map(|voices| voices[0] == v),
        };
        let carried = std::mem::take(&mut tune.voices[v].carry);
        let mut out = CarryOver::default();
        ties(ctx, tune, work, &line, &on_line, &carried.ties, &mut out.ties, &mut report);
        slurs(ctx, tune, work, &line, &carried.slurs, &mut out.slurs, &mut report);
        hyphens(tune, work, &line, &carried.hyphens, &mut out.hyphens, &mut report);
        tune.voices[v].carry = out;
    }
    grace_slurs(tune, work, &on_line);
    report.ties_out = report.ties_through + report.ties_opened;
    report.slurs_out = report.slurs_through + report.slurs_opened;
    log::trace!("line {}: carry {:?}", ctx.line, report);
    report
}

/// Control points of a bow from (x1, y1) to (x2, y2) whose middle lies
/// `h` away from the chord on the `dir` side.
fn bow(x1: f64, y1: f64, x2: f64, y2: f64, dir: f64, h: f64) -> [Point; 4] {
    let (dx, dy) = (x2 - x1, y2 - y1);
    let c = dir * h / CURVE_PEAK;
    [
        Point::new(x1, y1),
        Point::new(x1 + CURVE_ALFA * dx, y1 + CURVE_ALFA * dy + c),
        Point::new(x2 - CURVE_ALFA * dx, y2 - CURVE_ALFA * dy + c),
        Point::new(x2, y2),
    ]
}

// ═══════════════════════════════════════════════════════════════════════
// Ties
// ═══════════════════════════════════════════════════════════════════════

/// Next note or rest of the voice, wherever it is.
fn tie_target(tune: &Tune, id: SymbolId) -> Option<SymbolId> {
    let mut cur = tune.sym(id).next;
    while let Some(n) = cur {
        let s = tune.sym(n);
        if s.kind.is_note_or_rest() {
            return Some(n);
        }
        cur = s.next;
    }
    None
}

/// Side of a tie: away from the stem, split top and bottom in chords.
fn tie_dir(s: &Symbol, index: usize) -> f64 {
    let base = if s.has_stem() {
        if s.stem > 0 {
            -1.0
        } else {
            1.0
        }
    } else if s.heads().get(index).map_or(0, |h| h.step) >= MIDDLE_STEP {
        1.0
    } else {
        -1.0
    };
    let n = s.heads().len();
    if n < 2 {
        return base;
    }
    match (2 * index + 1).cmp(&n) {
        std::cmp::Ordering::Greater => 1.0,
        std::cmp::Ordering::Less => -1.0,
        std::cmp::Ordering::Equal => base,
    }
}

fn head_center(s: &Symbol, h: &NoteHead) -> f64 {
    s.x + s.x_shift + h.shift
}

fn tie_curve(staff: usize, x1: f64, y1: f64, x2: f64, y2: f64, dir: f64) -> Curve {
    let dx = (x2 - x1).max(1.0);
    let h = (TIE_HEIGHT_PER_UNIT * dx + TIE_MIN_HEIGHT).clamp(TIE_MIN_HEIGHT, TIE_MAX_HEIGHT);
    Curve { staff, points: bow(x1, y1, x1 + dx, y2, dir, h), kind: CurveKind::Tie, dotted: false }
}

#[allow(clippy::too_many_arguments)]
fn ties(
    ctx: &mut LayoutContext,
    tune: &Tune,
    work: &mut LineWork,
    line: &VoiceLine,
    on_line: &HashSet<SymbolId>,
    carried: &[i32],
    out: &mut Vec<i32>,
    report: &mut CarryReport,
) {
    report.ties_in += carried.len();
    match line.lead {
        None => {
            out.extend_from_slice(carried);
            report.ties_through += carried.len();
        }
        Some(lead) => {
            let s = tune.sym(lead);
            for &pitch in carried {
                report.ties_closed += 1;
                let Some((i, h)) = s.heads().iter().enumerate().find(|(_, h)| h.pitch == pitch) else {
                    ctx.diagnostics.warning(
                        DiagnosticKind::UnmatchedTie,
                        Some(lead),
                        format!("tie from the previous line finds no pitch {} at {}", pitch, lead),
                    );
                    continue;
                };
                let x2 = head_center(s, h) - head_half_width(s) - TIE_GAP;
                let x1 = (x2 - LINE_EDGE_TIE).max(0.0);
                let dir = tie_dir(s, i);
                let y = h.step as f64 * STEP + dir * TIE_Y_OFFSET;
                work.curves.push(tie_curve(s.staff, x1, y, x2, y, dir));
            }
        }
    }

    for &id in &line.leaves {
        let s = tune.sym(id);
        if !s.is_note() || s.flags.grace || !s.heads().iter().any(|h| h.tie) {
            continue;
        }
        let target = tie_target(tune, id).filter(|&t| tune.sym(t).is_note());
        let hw = head_half_width(s);
        for (i, head) in s.heads().iter().enumerate().filter(|(_, h)| h.tie) {
            let dir = tie_dir(s, i);
            let x1 = head_center(s, head) + hw + TIE_GAP;
            let y1 = head.step as f64 * STEP + dir * TIE_Y_OFFSET;
            match target {
                Some(t) if on_line.contains(&t) => {
                    let ts = tune.sym(t);
                    let Some(end) = ts.heads().iter().find(|h| h.pitch == head.pitch) else {
                        ctx.diagnostics.warning(
                            DiagnosticKind::UnmatchedTie,
                            Some(id),
                            format!("tie from {} finds no pitch {} at {}", id, head.pitch, t),
                        );
                        continue;
                    };
                    let x2 = head_center(ts, end) - head_half_width(ts) - TIE_GAP;
                    let y2 = end.step as f64 * STEP + dir * TIE_Y_OFFSET;
                    if ts.staff != s.staff {
                        work.segments.push(Segment {
                            from: StaffPoint { x: x1, y: y1, staff: s.staff },
                            to: StaffPoint { x: x2, y: y2, staff: ts.staff },
                            width: 1.0,
                        });
                    } else {
                        work.curves.push(tie_curve(s.staff, x1, y1, x2, y2, dir));
                    }
                }
                Some(_) => {
                    let x2 = work.width.max(x1 + LINE_EDGE_TIE);
                    work.curves.push(tie_curve(s.staff, x1, y1, x2, y1, dir));
                    out.push(head.pitch);
                    report.ties_opened += 1;
                }
                None => ctx.diagnostics.warning(
                    DiagnosticKind::UnmatchedTie,
                    Some(id),
                    format!("tie from {} has no note to end on", id),
                ),
            }
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════
// Slurs
// ═══════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, Copy)]
enum End {
    /// A symbol of the voice line, by leaf index
    Note(usize),
    /// A line edge or restart bar at x, bounding the span at leaf `index`
    Edge { x: f64, index: usize },
}

impl End {
    fn index(self) -> usize {
        match self {
            End::Note(i) => i,
            End::Edge { index, .. } => index,
        }
    }
}

enum Open {
    Note(usize, SlurPlacement),
    Carried(SlurPlacement),
}

/// Side of a slur over `span`: +1 above, -1 below.
pub(crate) fn slur_direction(tune: &Tune, span: &[SymbolId], placement: SlurPlacement, upper: Option<bool>) -> f64 {
    match (placement, upper) {
        (SlurPlacement::Above, _) => return 1.0,
        (SlurPlacement::Below, _) => return -1.0,
        (SlurPlacement::Auto, Some(true)) => return 1.0,
        (SlurPlacement::Auto, Some(false)) => return -1.0,
        (SlurPlacement::Auto, None) => {}
    }
    let main: Vec<&Symbol> = span
        .iter()
        .map(|&id| tune.sym(id))
        .filter(|s| s.is_note() && !s.flags.grace)
        .collect();
    let notes: Vec<&Symbol> = if main.is_empty() {
        span.iter().map(|&id| tune.sym(id)).filter(|s| s.is_note()).collect()
    } else {
        main
    };
    if notes.iter().any(|s| s.has_stem() && s.stem < 0) {
        return 1.0;
    }
    if !notes.is_empty() && notes.iter().all(|s| !s.has_stem()) {
        let avg = notes
            .iter()
            .filter_map(|s| s.step_range())
            .map(|(lo, hi)| (lo + hi) as f64 / 2.0)
            .sum::<f64>()
            / notes.len() as f64;
        if avg >= MIDDLE_STEP as f64 {
            return 1.0;
        }
    }
    -1.0
}

/// Endpoint of a slur at a symbol.
fn anchor(s: &Symbol, dir: f64, start: bool) -> (f64, f64) {
    let x = s.x + s.x_shift;
    let Some((lo, hi)) = s.step_range() else {
        let y = if dir > 0.0 { s.y_max } else { s.y_min };
        return (x, y + dir * SLUR_CLEAR_PAD);
    };
    let toward = s.has_stem() && f64::from(s.stem) * dir > 0.0;
    if toward {
        let free_flags = s.nflags > 0 && s.flags.word_start && s.flags.word_end;
        let nudge = if free_flags && start { SLUR_FLAG_NUDGE } else { SLUR_STEM_NUDGE };
        let sx = stem_x(s);
        let x = if start { sx + nudge } else { sx - nudge };
        (x, s.y_stem + dir * SLUR_STEM_CLEAR)
    } else {
        let step = if dir > 0.0 { hi } else { lo };
        let y = step as f64 * STEP + dir * SLUR_HEAD_CLEAR;
        // start past the right edge of the first note
        let x = if start { s.x + s.w_right } else { x - SLUR_HEAD_NUDGE };
        (x, y)
    }
}

fn slur_curve(
    ctx: &LayoutContext,
    tune: &Tune,
    leaves: &[SymbolId],
    from: End,
    to: End,
    placement: SlurPlacement,
    upper: Option<bool>,
) -> Curve {
    let (a, b) = (from.index(), to.index().max(from.index()));
    let span = &leaves[a..=b];
    let dir = slur_direction(tune, span, placement, upper);
    let staff = match from {
        End::Note(i) => tune.sym(leaves[i]).staff,
        End::Edge { .. } => tune.sym(leaves[b]).staff,
    };

    let start = match from {
        End::Note(i) => Some(anchor(tune.sym(leaves[i]), dir, true)),
        End::Edge { .. } => None,
    };
    let end = match to {
        End::Note(i) => Some(anchor(tune.sym(leaves[i]), dir, false)),
        End::Edge { .. } => None,
    };
    let (mut x1, mut y1, mut x2, mut y2) = match (start, end, from, to) {
        (Some((x1, y1)), Some((x2, y2)), _, _) => (x1, y1, x2, y2),
        (Some((x1, y1)), None, _, End::Edge { x, .. }) => (x1, y1, x, y1),
        (None, Some((x2, y2)), End::Edge { x, .. }, _) => (x, y2, x2, y2),
        (_, _, from, to) => {
            let y = if dir > 0.0 { STAFF_TOP + SLUR_HEAD_CLEAR } else { -SLUR_HEAD_CLEAR };
            let edge = |e: End| if let End::Edge { x, .. } = e { x } else { 0.0 };
            (edge(from), y, edge(to), y)
        }
    };
    if x2 - x1 < 2.0 {
        x2 = x1 + 2.0;
    }

    // big jumps: pull the outer end toward the other one
    let dy = y2 - y1;
    if dy.abs() > SLUR_MAX_JUMP {
        let excess = dy.abs() - SLUR_MAX_JUMP;
        if dir * dy > 0.0 {
            y1 += dy.signum() * excess * SLUR_JUMP_DY;
            x1 -= excess * SLUR_JUMP_DX;
        } else {
            y2 -= dy.signum() * excess * SLUR_JUMP_DY;
            x2 += excess * SLUR_JUMP_DX;
        }
    }
    let dx = (x2 - x1).max(2.0);
    let max_dy = SLUR_SLOPE * dx;
    if (y2 - y1).abs() > max_dy {
        // move the inner end out
        if (dir > 0.0) == (y1 < y2) {
            y1 = y2 - (y2 - y1).signum() * max_dy;
        } else {
            y2 = y1 + (y2 - y1).signum() * max_dy;
        }
    }

    let notes = span.iter().filter(|&&id| tune.sym(id).kind.is_note_or_rest()).count();
    let mut h = SLUR_HEIGHT_BASE + SLUR_HEIGHT_PER_UNIT * dx + SLUR_HEIGHT_PER_NOTE * notes.saturating_sub(2) as f64;
    let floor = SLUR_MIN_HEIGHT.max(0.5 * (y2 - y1).abs()).min(SLUR_MAX_HEIGHT);
    h = h.clamp(floor, SLUR_MAX_HEIGHT) * ctx.config.slur_height;

    if span.len() > 2 {
        let mut excess: f64 = 0.0;
        for &id in &span[1..span.len() - 1] {
            let s = tune.sym(id);
            if s.staff != staff || !s.kind.is_note_or_rest() || s.flags.invisible {
                continue;
            }
            let t = ((s.x - x1) / dx).clamp(0.0, 1.0);
            let chord = y1 + (y2 - y1) * t;
            let obstacle = if dir > 0.0 { s.y_max } else { s.y_min };
            excess = excess.max(dir * (obstacle - chord) + SLUR_CLEAR_PAD - h);
        }
        if excess > 0.0 {
            y1 += dir * SLUR_ENDPOINT_BLEND * excess;
            y2 += dir * SLUR_ENDPOINT_BLEND * excess;
            h += SLUR_HEIGHT_BLEND * excess;
        }
    }

    Curve { staff, points: bow(x1, y1, x2, y2, dir, h), kind: CurveKind::Slur, dotted: false }
}

/// x where a slur continued from the previous line starts.
fn line_start_x(tune: &Tune, leaves: &[SymbolId]) -> f64 {
    leaves
        .iter()
        .map(|&id| tune.sym(id))
        .find(|s| s.kind.is_note_or_rest())
        .map_or(0.0, |s| (s.x - head_half_width(s) - LINE_EDGE_TIE).max(0.0))
}

fn slurs(
    ctx: &mut LayoutContext,
    tune: &Tune,
    work: &mut LineWork,
    line: &VoiceLine,
    carried: &[SlurPlacement],
    out: &mut Vec<SlurPlacement>,
    report: &mut CarryReport,
) {
    let leaves = &line.leaves;
    report.slurs_in += carried.len();
    if leaves.is_empty() {
        out.extend_from_slice(carried);
        report.slurs_through += carried.len();
        return;
    }
    let mut stack: Vec<Open> = carried.iter().map(|&p| Open::Carried(p)).collect();
    let mut restart: Option<usize> = None;
    let mut pairs: Vec<(End, End, SlurPlacement)> = Vec::new();
    let edge_start = End::Edge { x: line_start_x(tune, leaves), index: 0 };

    for (i, &id) in leaves.iter().enumerate() {
        let s = tune.sym(id);
        if let Some(bar) = s.bar() {
            if bar.is_slur_restart() {
                restart = Some(i);
            }
            continue;
        }
        for _ in 0..s.slur_ends {
            match stack.pop() {
                Some(Open::Note(start, p)) => pairs.push((End::Note(start), End::Note(i), p)),
                Some(Open::Carried(p)) => {
                    report.slurs_closed += 1;
                    let from = match restart {
                        Some(r) => End::Edge { x: tune.sym(leaves[r]).x + BAR_PAD, index: r },
                        None => edge_start,
                    };
                    pairs.push((from, End::Note(i), p));
                }
                None => ctx.diagnostics.warning(
                    DiagnosticKind::UnmatchedSlur,
                    Some(id),
                    format!("slur ends at {} without a start", id),
                ),
            }
        }
        for &p in &s.slur_starts {
            stack.push(Open::Note(i, p));
        }
    }

    let last = End::Edge { x: work.width, index: leaves.len() - 1 };
    for open in &stack {
        let (from, p) = match *open {
            Open::Note(start, p) => {
                report.slurs_opened += 1;
                (End::Note(start), p)
            }
            Open::Carried(p) => {
                report.slurs_through += 1;
                (edge_start, p)
            }
        };
        // the continuation bows to the side this half was drawn on
        let dir = slur_direction(tune, &leaves[from.index()..], p, line.upper);
        out.push(if dir > 0.0 { SlurPlacement::Above } else { SlurPlacement::Below });
        pairs.push((from, last, p));
    }
    for (from, to, p) in pairs {
        let curve = slur_curve(ctx, tune, leaves, from, to, p, line.upper);
        work.curves.push(curve);
    }
}

/// Appoggiatura slurs from the last grace note to the main note.
fn grace_slurs(tune: &Tune, work: &mut LineWork, on_line: &HashSet<SymbolId>) {
    for &id in &work.ids {
        let SymbolKind::Grace(data) = tune.sym(id).kind else { continue };
        if !data.slur_to_main {
            continue;
        }
        let Some(&last) = tune.grace_notes(id).last() else { continue };
        let Some(main) = tie_target(tune, id).filter(|m| on_line.contains(m) && tune.sym(*m).is_note()) else {
            continue;
        };
        let (g, m) = (tune.sym(last), tune.sym(main));
        let (Some((g_lo, _)), Some((m_lo, _))) = (g.step_range(), m.step_range()) else { continue };
        let x1 = g.x;
        let x2 = (m.x + m.x_shift - head_half_width(m)).max(x1 + 2.0);
        let y1 = g_lo as f64 * STEP - STEP;
        let y2 = m_lo as f64 * STEP - STEP;
        work.curves.push(Curve {
            staff: g.staff,
            points: bow(x1, y1, x2, y2, -1.0, 2.0),
            kind: CurveKind::Slur,
            dotted: false,
        });
    }
}

// ═══════════════════════════════════════════════════════════════════════
// Lyric hyphens
// ═══════════════════════════════════════════════════════════════════════

fn syllable_half(s: &Symbol, verse: usize) -> f64 {
    s.lyrics
        .get(verse)
        .and_then(Option::as_ref)
        .map_or(0.0, |l| text_width(&l.text, LYRIC_FONT_SIZE) / 2.0)
}

fn hyphens(
    tune: &Tune,
    work: &mut LineWork,
    line: &VoiceLine,
    carried: &[usize],
    out: &mut Vec<usize>,
    report: &mut CarryReport,
) {
    report.hyphens_in += carried.len();
    let sung: Vec<SymbolId> = line
        .leaves
        .iter()
        .copied()
        .filter(|&id| {
            let s = tune.sym(id);
            s.is_note() && !s.flags.grace && s.lyrics.iter().any(Option::is_some)
        })
        .collect();
    let has_verse = |id: SymbolId, verse: usize| tune.sym(id).lyrics.get(verse).map_or(false, Option::is_some);

    for &verse in carried {
        match sung.iter().copied().find(|&id| has_verse(id, verse)) {
            Some(id) => {
                let s = tune.sym(id);
                let x2 = s.x + s.x_shift - syllable_half(s, verse) - LYRIC_MIN_GAP;
                let x1 = (x2 - LINE_EDGE_TIE).max(0.0);
                work.hyphens.push(HyphenRun { staff: s.staff, verse, x1, x2, y: 0.0, extender: false });
            }
            None => out.push(verse),
        }
    }

    for (k, &id) in sung.iter().enumerate() {
        let s = tune.sym(id);
        for (verse, lyric) in s.lyrics.iter().enumerate() {
            let Some(lyric) = lyric else { continue };
            if !lyric.hyphen && !lyric.extend {
                continue;
            }
            let x1 = s.x + s.x_shift + syllable_half(s, verse) + LYRIC_MIN_GAP;
            let next = sung[k + 1..].iter().copied().find(|&n| has_verse(n, verse));
            let x2 = match next {
                Some(n) => {
                    let ns = tune.sym(n);
                    ns.x + ns.x_shift - syllable_half(ns, verse) - LYRIC_MIN_GAP
                }
                None => {
                    if lyric.hyphen {
                        out.push(verse);
                    }
                    work.width
                }
            };
            work.hyphens.push(HyphenRun {
                staff: s.staff,
                verse,
                x1,
                x2: x2.max(x1),
                y: 0.0,
                extender: lyric.extend && !lyric.hyphen,
            });
        }
    }
    report.hyphens_out += out.len();
}
