//! Emission — turns a laid-out line into draw operations.
//!
//! Staff-relative coordinates are converted to page points here:
//! `x_page = left_margin + x * scale` and `y_page = (staff.y - y) * scale`,
//! y growing downwards from the line top.

use std::collections::HashSet;

use crate::draw::{DrawOp, DrawSink, Point, TextKind};
use crate::error::LayoutError;
use crate::model::*;
use super::beam::stem_x;
use super::constants::*;
use super::vertical::LineMetrics;
use super::width::head_half_width;
use super::{LayoutContext, LineWork, StaffPoint};

const BRACE_GAP: f64 = 6.0;
const TITLE_SIZE: f64 = 20.0;

// staff steps of the key accidentals on a treble staff
const SHARP_STEPS: [i32; 7] = [8, 5, 9, 6, 3, 7, 4];
const FLAT_STEPS: [i32; 7] = [4, 7, 3, 6, 2, 5, 1];

/// Staff-to-page mapping of the current line.
struct Page {
    left: f64,
    scale: f64,
    staves: Vec<f64>,
}

impl Page {
    fn x(&self, x: f64) -> f64 {
        self.left + x * self.scale
    }

    fn y(&self, staff: usize, y: f64) -> f64 {
        (self.staves[staff] - y) * self.scale
    }

    fn point(&self, staff: usize, x: f64, y: f64) -> Point {
        Point::new(self.x(x), self.y(staff, y))
    }

    fn staff_point(&self, p: &StaffPoint) -> Point {
        self.point(p.staff, p.x, p.y)
    }
}

/// Send one laid-out line to `sink`.
pub(super) fn emit_line(
    ctx: &mut LayoutContext,
    tune: &Tune,
    work: &LineWork,
    metrics: &LineMetrics,
    sink: &mut dyn DrawSink,
) -> Result<(), LayoutError> {
    let page = Page {
        left: ctx.config.left_margin,
        scale: ctx.config.scale,
        staves: tune.staves.iter().map(|s| s.y).collect(),
    };
    sink.begin_line(ctx.line, metrics.height * page.scale);

    if ctx.line == 0 {
        if let Some(title) = &tune.title {
            sink.draw(DrawOp::Text {
                x: page.x(work.width / 2.0),
                y: 0.0,
                text: title.clone(),
                kind: TextKind::Title,
                size: TITLE_SIZE * page.scale,
            });
        }
    }
    staff_lines(tune, work, &page, sink);
    staff_groups(tune, &page, sink);

    let beamed: HashSet<SymbolId> = work.beams.iter().flat_map(|b| b.notes.iter().copied()).collect();
    let mut bars_drawn = HashSet::new();
    for &id in &work.ids {
        let s = tune.sym(id);
        if s.flags.invisible {
            continue;
        }
        match &s.kind {
            SymbolKind::Note(_) => note(ctx, tune, id, &beamed, &page, sink)?,
            SymbolKind::Rest => rest(s, &page, sink),
            SymbolKind::Bar(bar) => {
                if bar.bar_type == BarType::Invisible {
                    continue;
                }
                let (top, bottom) = bar_span(tune, s.staff);
                if bars_drawn.insert((s.time, s.seq, top)) {
                    sink.draw(DrawOp::Bar {
                        x: page.x(s.x),
                        y_top: page.y(top, STAFF_TOP),
                        y_bottom: page.y(bottom, 0.0),
                        bar_type: bar.bar_type,
                    });
                }
            }
            SymbolKind::Clef(c) => sink.draw(DrawOp::Clef {
                x: page.x(s.x),
                y: page.y(s.staff, (c.line - 1) as f64 * LINE_SPACING),
                clef: c.clef_type,
                small: s.seq != SEQ_LINE_CLEF,
            }),
            SymbolKind::KeySig(key) => key_signature(tune, s, key, &page, sink),
            SymbolKind::TimeSig(m) => sink.draw(DrawOp::TimeSignature {
                x: page.x(s.x),
                y: page.y(s.staff, STAFF_MIDDLE),
                top: m.top,
                bottom: m.bottom,
            }),
            SymbolKind::Grace(g) => {
                let notes = tune.grace_notes(id);
                for &n in &notes {
                    note(ctx, tune, n, &beamed, &page, sink)?;
                }
                if g.slash {
                    if let Some(&first) = notes.first() {
                        slash(tune.sym(first), &page, sink);
                    }
                }
            }
            SymbolKind::Tuplet(_) | SymbolKind::StaffBreak(_) | SymbolKind::FormatChange(_) => {}
        }
    }

    for beam in &work.beams {
        let depth = (if beam.up { beam.depth() } else { -beam.depth() }) * page.scale;
        for seg in &beam.segments {
            let (y1, y2) = (beam.segment_y(seg.level, seg.x1), beam.segment_y(seg.level, seg.x2));
            sink.draw(DrawOp::Beam {
                from: page.point(beam.staff, seg.x1, y1),
                to: page.point(beam.staff, seg.x2, y2),
                depth,
            });
        }
    }
    for curve in &work.curves {
        let points = curve.points.map(|p| page.point(curve.staff, p.x, p.y));
        sink.draw(DrawOp::Curve { points, kind: curve.kind, dotted: curve.dotted });
    }
    for seg in &work.segments {
        sink.draw(DrawOp::Line {
            from: page.staff_point(&seg.from),
            to: page.staff_point(&seg.to),
            width: seg.width * page.scale,
        });
    }
    for t in &work.texts {
        sink.draw(DrawOp::Text {
            x: page.x(t.x),
            y: page.y(t.staff, t.y),
            text: t.text.clone(),
            kind: t.kind,
            size: t.size * page.scale,
        });
    }
    for h in &work.hyphens {
        let y = page.y(h.staff, h.y);
        if h.extender {
            sink.draw(DrawOp::Line { from: Point::new(page.x(h.x1), y), to: Point::new(page.x(h.x2), y), width: page.scale });
        } else {
            sink.draw(DrawOp::Hyphen { x1: page.x(h.x1), x2: page.x(h.x2), y });
        }
    }
    sink.end_line();
    Ok(())
}

// ═══════════════════════════════════════════════════════════════════════
// Staves
// ═══════════════════════════════════════════════════════════════════════

/// Staff lines across the line width, interrupted by staff breaks.
fn staff_lines(tune: &Tune, work: &LineWork, page: &Page, sink: &mut dyn DrawSink) {
    for staff in 0..tune.staves.len() {
        let mut gaps: Vec<(f64, f64)> = work
            .ids
            .iter()
            .map(|&id| tune.sym(id))
            .filter(|s| s.staff == staff)
            .filter_map(|s| match s.kind {
                SymbolKind::StaffBreak(w) => Some((s.x - w / 2.0, s.x + w / 2.0)),
                _ => None,
            })
            .collect();
        gaps.sort_by(|a, b| a.0.total_cmp(&b.0));
        let mut x = 0.0;
        for (start, end) in gaps.into_iter().chain(std::iter::once((work.width, work.width))) {
            if start > x {
                sink.draw(DrawOp::StaffLines {
                    x1: page.x(x),
                    x2: page.x(start),
                    y: page.y(staff, 0.0),
                    spacing: LINE_SPACING * page.scale,
                });
            }
            x = x.max(end);
        }
    }
}

fn staff_groups(tune: &Tune, page: &Page, sink: &mut dyn DrawSink) {
    for (i, staff) in tune.staves.iter().enumerate() {
        let Some((group, count)) = staff.group else {
            continue;
        };
        let last = (i + count.max(1) - 1).min(tune.staves.len() - 1);
        let (x, y_top, y_bottom) = (page.left - BRACE_GAP * page.scale, page.y(i, STAFF_TOP), page.y(last, 0.0));
        sink.draw(match group {
            StaffGroup::Brace => DrawOp::Brace { x, y_top, y_bottom },
            StaffGroup::Bracket => DrawOp::Bracket { x, y_top, y_bottom },
        });
    }
}

/// Staves a bar on `staff` runs across: its whole group, if any.
fn bar_span(tune: &Tune, staff: usize) -> (usize, usize) {
    for (i, st) in tune.staves.iter().enumerate().take(staff + 1) {
        if let Some((_, count)) = st.group {
            if staff < i + count {
                return (i, (i + count - 1).min(tune.staves.len() - 1));
            }
        }
    }
    (staff, staff)
}

// ═══════════════════════════════════════════════════════════════════════
// Symbols
// ═══════════════════════════════════════════════════════════════════════

fn note(
    ctx: &mut LayoutContext,
    tune: &Tune,
    id: SymbolId,
    beamed: &HashSet<SymbolId>,
    page: &Page,
    sink: &mut dyn DrawSink,
) -> Result<(), LayoutError> {
    let s = tune.sym(id);
    let Some((lo, hi)) = s.step_range() else {
        return ctx.internal(Some(id), "note without heads");
    };
    let staff = s.staff;
    let cx = s.x + s.x_shift;
    let hw = head_half_width(s);
    let grace = s.flags.grace;

    for h in s.heads() {
        let y = page.y(staff, h.step as f64 * STEP);
        sink.draw(DrawOp::NoteHead { x: page.x(cx + h.shift), y, head: s.head, grace });
        if let Some(accidental) = h.accidental {
            sink.draw(DrawOp::Accidental { x: page.x(cx + h.acc_x), y, accidental });
        }
    }
    ledger_lines(staff, cx, hw, lo, hi, page, sink);
    dots(s, cx, hw, page, sink);

    if s.has_stem() {
        let sx = stem_x(s);
        let base = f64::from(if s.stem > 0 { lo } else { hi }) * STEP;
        sink.draw(DrawOp::Stem { x: page.x(sx), y1: page.y(staff, base), y2: page.y(staff, s.y_stem) });
        if s.nflags > 0 && !beamed.contains(&id) {
            sink.draw(DrawOp::Flag {
                x: page.x(sx),
                y: page.y(staff, s.y_stem),
                count: s.nflags as u8,
                up: s.stem > 0,
                straight: ctx.config.straight_flags,
            });
        }
    }
    Ok(())
}

fn ledger_lines(staff: usize, cx: f64, hw: f64, lo: i32, hi: i32, page: &Page, sink: &mut dyn DrawSink) {
    let (x1, x2) = (page.x(cx - hw - LEDGER_EXTEND), page.x(cx + hw + LEDGER_EXTEND));
    let below = (lo..=-2).filter(|step| step % 2 == 0);
    let above = (10..=hi).filter(|step| step % 2 == 0);
    for step in below.chain(above) {
        sink.draw(DrawOp::LedgerLine { x1, x2, y: page.y(staff, step as f64 * STEP) });
    }
}

/// Dots sit in the space of their head, or the space above a line.
fn dots(s: &Symbol, cx: f64, hw: f64, page: &Page, sink: &mut dyn DrawSink) {
    if s.dots == 0 {
        return;
    }
    let mut rows: Vec<i32> = match s.step_range() {
        Some(_) => s.heads().iter().map(|h| if h.step % 2 == 0 { h.step + 1 } else { h.step }).collect(),
        None => vec![(s.y / STEP).round() as i32 | 1],
    };
    rows.sort_unstable();
    rows.dedup();
    let x0 = cx + hw + DOT_SHIFT + s.dot_shift;
    for row in rows {
        for k in 0..s.dots {
            sink.draw(DrawOp::Dot {
                x: page.x(x0 + k as f64 * DOT_SPACE),
                y: page.y(s.staff, row as f64 * STEP),
            });
        }
    }
}

fn rest(s: &Symbol, page: &Page, sink: &mut dyn DrawSink) {
    let duration = match s.head {
        HeadType::Breve => BREVE,
        HeadType::Whole => WHOLE,
        HeadType::Half => HALF,
        HeadType::Filled => QUARTER >> s.nflags.max(0),
    };
    let x = s.x + s.x_shift;
    sink.draw(DrawOp::Rest { x: page.x(x), y: page.y(s.staff, s.y), duration });
    if !s.flags.measure_rest {
        dots(s, x, head_half_width(s), page, sink);
    }
}

fn key_signature(tune: &Tune, s: &Symbol, key: &KeySig, page: &Page, sink: &mut dyn DrawSink) {
    let clef = tune.staves[s.staff].clef;
    let shift = {
        let d = (Clef::treble().bottom_line_pitch() - clef.bottom_line_pitch()).rem_euclid(7);
        if d > 3 {
            d - 7
        } else {
            d
        }
    };
    let steps = |sharps: bool| if sharps { SHARP_STEPS } else { FLAT_STEPS };
    let mut accidentals = Vec::new();
    let mut x = s.x;

    let naturals = key.naturals() as usize;
    if let Some(old) = key.old_sharps.filter(|_| naturals > 0) {
        let all = steps(old > 0);
        let count = (old.unsigned_abs() as usize).min(7);
        for &step in &all[count.saturating_sub(naturals)..count] {
            accidentals.push((page.x(x), page.y(s.staff, (step + shift) as f64 * STEP), Accidental::Natural));
            x += KEY_ACC_SPACE;
        }
        if key.switches_sign() {
            x += KEY_SWITCH_BUFFER;
        }
    }
    let sign = if key.sharps > 0 { Accidental::Sharp } else { Accidental::Flat };
    for &step in steps(key.sharps > 0).iter().take(key.sharps.unsigned_abs() as usize) {
        accidentals.push((page.x(x), page.y(s.staff, (step + shift) as f64 * STEP), sign));
        x += KEY_ACC_SPACE;
    }
    if accidentals.is_empty() {
        return;
    }
    sink.draw(DrawOp::KeySignature { x: page.x(s.x), y: page.y(s.staff, 0.0), accidentals });
}

/// Acciaccatura stroke across the stem of the first grace note.
fn slash(s: &Symbol, page: &Page, sink: &mut dyn DrawSink) {
    let sx = stem_x(s);
    let dir = if s.stem >= 0 { 1.0 } else { -1.0 };
    let y = s.y_stem - dir * GRACE_STEM * 0.35;
    sink.draw(DrawOp::Slash {
        from: page.point(s.staff, sx - 3.0, y - dir * 3.0),
        to: page.point(s.staff, sx + 3.0, y + dir * 2.0),
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builder::TuneBuilder;
    use crate::config::LayoutConfig;
    use crate::draw::DrawList;
    use crate::engine::layout_tune;
    use more_asserts::{assert_ge, assert_lt};
    use pretty_assertions::assert_eq;

    fn count(list: &DrawList, pred: impl Fn(&DrawOp) -> bool) -> usize {
        list.count(pred)
    }

    #[test]
    fn ledger_lines_below_middle_c() {
        let mut b = TuneBuilder::new();
        let staff = b.add_staff(Clef::treble());
        let v = b.add_voice("1", staff).unwrap();
        b.note(v, vec![NoteHead::new(diatonic('C', 4))], QUARTER).unwrap();
        b.note(v, vec![NoteHead::new(diatonic('A', 3))], QUARTER).unwrap();
        b.note(v, vec![NoteHead::new(diatonic('B', 4))], HALF).unwrap();
        let mut tune = b.finish().unwrap();
        let mut list = DrawList::new();
        layout_tune(&mut tune, &LayoutConfig::default(), &mut list).unwrap();
        // C4 sits on one ledger line, A3 on two
        assert_eq!(count(&list, |op| matches!(op, DrawOp::LedgerLine { .. })), 3);
        assert_eq!(count(&list, |op| matches!(op, DrawOp::NoteHead { .. })), 3);
        assert_eq!(count(&list, |op| matches!(op, DrawOp::StaffLines { .. })), 1);
    }

    #[test]
    fn beamed_notes_have_no_flags() {
        let mut b = TuneBuilder::new();
        let staff = b.add_staff(Clef::treble());
        let v = b.add_voice("1", staff).unwrap();
        for _ in 0..4 {
            b.note(v, vec![NoteHead::new(diatonic('G', 4))], EIGHTH).unwrap();
        }
        b.note(v, vec![NoteHead::new(diatonic('G', 4))], QUARTER).unwrap();
        b.note(v, vec![NoteHead::new(diatonic('G', 4))], EIGHTH).unwrap();
        b.rest(v, EIGHTH).unwrap();
        let mut tune = b.finish().unwrap();
        let mut list = DrawList::new();
        layout_tune(&mut tune, &LayoutConfig::default(), &mut list).unwrap();
        assert_eq!(count(&list, |op| matches!(op, DrawOp::Beam { .. })), 1);
        assert_eq!(count(&list, |op| matches!(op, DrawOp::Flag { .. })), 1);
        assert_eq!(count(&list, |op| matches!(op, DrawOp::Stem { .. })), 6);
        assert_eq!(count(&list, |op| matches!(op, DrawOp::Rest { duration: EIGHTH, .. })), 1);
    }

    #[test]
    fn page_coordinates_follow_margin_and_scale() {
        let mut b = TuneBuilder::new();
        let staff = b.add_staff(Clef::treble());
        let v = b.add_voice("1", staff).unwrap();
        b.note(v, vec![NoteHead::new(diatonic('E', 4))], WHOLE).unwrap();
        let mut tune = b.finish().unwrap();
        let config = LayoutConfig::default();
        let mut list = DrawList::new();
        layout_tune(&mut tune, &config, &mut list).unwrap();
        let staff_y = list
            .ops()
            .find_map(|op| match op {
                DrawOp::StaffLines { x1, y, .. } => Some((*x1, *y)),
                _ => None,
            })
            .unwrap();
        assert_eq!(staff_y.0, config.left_margin);
        let head = list
            .ops()
            .find_map(|op| match op {
                DrawOp::NoteHead { x, y, .. } => Some((*x, *y)),
                _ => None,
            })
            .unwrap();
        // E4 sits on the bottom line of a treble staff
        assert!((head.1 - staff_y.1).abs() < 1e-9);
        assert_ge!(head.0, config.left_margin);
        assert_lt!(head.0, config.left_margin + config.line_width() * config.scale);
    }

    #[test]
    fn key_change_draws_naturals_then_sharps() {
        let mut b = TuneBuilder::new();
        let staff = b.add_staff(Clef::treble());
        let v = b.add_voice("1", staff).unwrap();
        b.initial_key(v, KeySig::new(-2)).unwrap();
        b.note(v, vec![NoteHead::new(diatonic('B', 4))], WHOLE).unwrap();
        b.bar(v, BarType::Single).unwrap();
        b.key(v, 1).unwrap();
        b.note(v, vec![NoteHead::new(diatonic('B', 4))], WHOLE).unwrap();
        let mut tune = b.finish().unwrap();
        let mut list = DrawList::new();
        layout_tune(&mut tune, &LayoutConfig::default(), &mut list).unwrap();
        let keys: Vec<Vec<Accidental>> = list
            .ops()
            .filter_map(|op| match op {
                DrawOp::KeySignature { accidentals, .. } => Some(accidentals.iter().map(|a| a.2).collect()),
                _ => None,
            })
            .collect();
        assert_eq!(
            keys,
            vec![
                vec![Accidental::Flat, Accidental::Flat],
                vec![Accidental::Natural, Accidental::Natural, Accidental::Sharp],
            ]
        );
    }
}
