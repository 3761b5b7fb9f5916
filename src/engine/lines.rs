//! Line segmentation — cuts the time-order list into output lines.
//!
//! Each line goes through three states: the leading signatures of every
//! staff are re-created (`ReInit`), symbols are accumulated up to a
//! candidate end (`Accumulating`), and the candidate is cut, laid out and
//! emitted, retrying with a shorter line while the glue solver reports it
//! overfull (`Cutting`).  Voice lists are never severed; only the
//! time-order list is split so `ts_first` always heads the unprocessed part.

use std::collections::{BTreeMap, HashSet};

use crate::config::LayoutConfig;
use crate::draw::DrawSink;
use crate::error::{DiagnosticKind, LayoutError};
use crate::model::*;
use super::beam::compute_beams;
use super::emit::emit_line;
use super::glue::{fit_line, GlueOutcome, GlueStatus};
use super::slur::compute_curves;
use super::vertical::{finish_line, place_graces, place_heads, resolve_voice_collisions, set_extents, set_stems};
use super::width::{set_spacing, set_widths};
use super::{LayoutContext, LineLayout, LineWork};

enum State {
    ReInit,
    Accumulating,
    Cutting { end: SymbolId },
    Done,
}

/// Bookkeeping of one cut, enough to undo it when the line is retried.
struct Severance {
    end: SymbolId,
    rest: Option<SymbolId>,
    words: Vec<(SymbolId, SymbolFlags)>,
    bars: Vec<(SymbolId, BarData)>,
    carried: Vec<(usize, BarData)>,
}

/// Lay out every line of the tune, emitting each to `sink` as it is done.
pub(super) fn run(ctx: &mut LayoutContext, tune: &mut Tune, sink: &mut dyn DrawSink) -> Result<Vec<LineLayout>, LayoutError> {
    let mut lines = Vec::new();
    let mut carried: Vec<(usize, BarData)> = Vec::new();
    let mut state = State::ReInit;
    loop {
        state = match state {
            State::ReInit => {
                reinit(ctx, tune, std::mem::take(&mut carried));
                State::Accumulating
            }
            State::Accumulating => match accumulate(ctx, tune) {
                Some(end) => State::Cutting { end },
                None => State::Done,
            },
            State::Cutting { end } => {
                let line = cut_and_lay_out(ctx, tune, end, sink, &mut carried)?;
                lines.push(line);
                if tune.ts_first.is_some() {
                    State::ReInit
                } else {
                    State::Done
                }
            }
            State::Done => break,
        };
    }
    Ok(lines)
}

// ═══════════════════════════════════════════════════════════════════════
// Line start
// ═══════════════════════════════════════════════════════════════════════

/// First remaining symbol of every voice, by voice index.
fn voice_heads(tune: &Tune) -> BTreeMap<usize, SymbolId> {
    let mut heads = BTreeMap::new();
    for id in tune.ts_ids(tune.ts_first) {
        heads.entry(tune.sym(id).voice).or_insert(id);
    }
    heads
}

/// Re-create the clef, key and (first line only) meter of every staff and
/// the bars carried over from a split repeat.
fn reinit(ctx: &mut LayoutContext, tune: &mut Tune, carried: Vec<(usize, BarData)>) {
    let Some(head) = tune.ts_first else {
        return;
    };
    let time = tune.sym(head).time;
    let first_line = ctx.line == 0;
    let heads = voice_heads(tune);

    let mut staves_done = HashSet::new();
    for (&v, &vhead) in &heads {
        let staff = tune.voices[v].staff;
        if !staves_done.insert(staff) {
            continue;
        }
        let (mut clef, mut key, mut meter) = (false, false, false);
        let mut adopt = Vec::new();
        let mut cur = Some(vhead);
        while let Some(id) = cur {
            let s = tune.sym(id);
            if s.time != time {
                break;
            }
            match s.kind {
                SymbolKind::Clef(_) if !clef => {
                    clef = true;
                    adopt.push((id, SEQ_LINE_CLEF));
                }
                SymbolKind::KeySig(_) if !key => {
                    key = true;
                    adopt.push((id, SEQ_LINE_KEY));
                }
                SymbolKind::TimeSig(_) if !meter => {
                    meter = true;
                    adopt.push((id, SEQ_LINE_METER));
                }
                SymbolKind::FormatChange(_) => {}
                _ => break,
            }
            cur = s.next;
        }
        for (id, seq) in adopt {
            if tune.sym(id).seq != seq {
                tune.unlink_ts(id);
                tune.sym_mut(id).seq = seq;
                insert_sorted(tune, id);
            }
        }

        let voice = &tune.voices[v];
        let (c, k, m) = (voice.clef, voice.key.sharps, voice.meter);
        if !clef {
            synthesize(tune, vhead, time, SymbolKind::Clef(c), SEQ_LINE_CLEF);
        }
        if !key && k != 0 {
            synthesize(tune, vhead, time, SymbolKind::KeySig(KeySig::new(k)), SEQ_LINE_KEY);
        }
        if first_line && !meter {
            synthesize(tune, vhead, time, SymbolKind::TimeSig(m), SEQ_LINE_METER);
        }
    }

    for (v, bar) in carried {
        if let Some(&vhead) = heads.get(&v) {
            synthesize(tune, vhead, time, SymbolKind::Bar(bar), SEQ_LINE_BAR);
        }
    }
    tune.mark_moments(tune.ts_first);
}

/// Create a symbol at the line start, linked before `before` in its voice.
fn synthesize(tune: &mut Tune, before: SymbolId, time: i32, kind: SymbolKind, seq: u32) {
    let (voice, staff) = {
        let b = tune.sym(before);
        (b.voice, tune.voices[b.voice].staff)
    };
    let mut s = Symbol::new(kind, voice, staff);
    s.time = time;
    s.seq = seq;
    let id = tune.alloc(s);
    tune.insert_voice_before(id, before);
    insert_sorted(tune, id);
}

/// Link `id` into the time-order list at its `(time, seq, voice)` position.
fn insert_sorted(tune: &mut Tune, id: SymbolId) {
    let key = |s: &Symbol| (s.time, s.seq, s.voice);
    let k = key(tune.sym(id));
    let mut cur = tune.ts_first;
    let mut last = None;
    while let Some(n) = cur {
        if key(tune.sym(n)) > k {
            tune.insert_ts_before(id, n);
            return;
        }
        last = Some(n);
        cur = tune.ts_next(n);
    }
    match last {
        Some(l) => tune.sym_mut(l).ts_next = Some(id),
        None => tune.ts_first = Some(id),
    }
    let s = tune.sym_mut(id);
    s.ts_prev = last;
    s.ts_next = None;
}

// ═══════════════════════════════════════════════════════════════════════
// Accumulation
// ═══════════════════════════════════════════════════════════════════════

/// Find the candidate end of the current line.
///
/// Format changes met on the way only steer the search; they reach the
/// running configuration once the line is fitted.
fn accumulate(ctx: &LayoutContext, tune: &Tune) -> Option<SymbolId> {
    let head = tune.ts_first?;
    let mut cfg = ctx.config.clone();
    let mut bars = 0u32;
    let mut last_bar_time = None;
    let mut content = false;
    let mut cur = Some(head);
    let mut last = head;
    while let Some(id) = cur {
        last = id;
        let s = tune.sym(id);
        match &s.kind {
            SymbolKind::FormatChange(f) => {
                apply_format(&mut cfg, f);
            }
            SymbolKind::Note(_) | SymbolKind::Rest | SymbolKind::Grace(_) => content = true,
            SymbolKind::Bar(_) if content && s.seq != SEQ_LINE_BAR && last_bar_time != Some(s.time) => {
                last_bar_time = Some(s.time);
                bars += 1;
                if cfg.bars_per_line.is_some_and(|n| n > 0 && bars >= n) {
                    return Some(refine(tune, id));
                }
            }
            _ => {}
        }
        if cfg.bars_per_line.is_none() && !cfg.continue_all && s.flags.eoln {
            return Some(refine(tune, id));
        }
        cur = s.ts_next;
    }
    Some(last)
}

/// Extend a candidate end so no note is split from what sounds with it.
fn refine(tune: &Tune, id: SymbolId) -> SymbolId {
    let s = tune.sym(id);
    let mut end = id;
    if s.kind.is_note_or_rest() {
        let stop = s.end_time();
        while let Some(n) = tune.ts_next(end) {
            if tune.sym(n).time >= stop {
                break;
            }
            end = n;
        }
    } else {
        let key = (s.time, s.seq);
        while let Some(n) = tune.ts_next(end) {
            let ns = tune.sym(n);
            if (ns.time, ns.seq) != key {
                break;
            }
            end = n;
        }
    }
    end
}

fn parse_flag(value: &str) -> Option<bool> {
    match value.trim() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

/// Apply an inline format change; `false` when the name or value is not
/// understood.
fn apply_format(cfg: &mut LayoutConfig, f: &FormatChange) -> bool {
    let value = f.value.trim();
    let applied = match f.name.as_str() {
        "slur_height" => value.parse::<f64>().ok().filter(|v| v.is_finite() && *v > 0.0).map(|v| cfg.slur_height = v),
        "max_shrink" => value.parse::<f64>().ok().filter(|v| (0.0..=1.0).contains(v)).map(|v| cfg.max_shrink = v),
        "flat_beams" => parse_flag(value).map(|v| cfg.flat_beams = v),
        "straight_flags" => parse_flag(value).map(|v| cfg.straight_flags = v),
        "continue_all" => parse_flag(value).map(|v| cfg.continue_all = v),
        "bars_per_line" => value.parse::<u32>().ok().map(|n| cfg.bars_per_line = (n > 0).then_some(n)),
        _ => None,
    };
    applied.is_some()
}

/// Apply the format changes of a candidate line; returns the rejected ones.
fn apply_formats(cfg: &mut LayoutConfig, tune: &Tune, ids: &[SymbolId]) -> Vec<SymbolId> {
    ids.iter()
        .copied()
        .filter(|&id| match &tune.sym(id).kind {
            SymbolKind::FormatChange(f) => !apply_format(cfg, f),
            _ => false,
        })
        .collect()
}

// ═══════════════════════════════════════════════════════════════════════
// Cutting
// ═══════════════════════════════════════════════════════════════════════

fn sever(tune: &mut Tune, end: SymbolId) -> Severance {
    let rest = tune.ts_next(end);
    if let Some(r) = rest {
        tune.sym_mut(end).ts_next = None;
        tune.sym_mut(r).ts_prev = None;
    }
    let mut cut = Severance { end, rest, words: Vec::new(), bars: Vec::new(), carried: Vec::new() };
    if rest.is_some() {
        let ids = tune.ts_ids(tune.ts_first);
        close_words(tune, &ids, &mut cut);
        split_bars(tune, &ids, &mut cut);
    }
    cut
}

fn rejoin(tune: &mut Tune, cut: Severance) {
    for (id, flags) in cut.words.into_iter().rev() {
        tune.sym_mut(id).flags = flags;
    }
    for (id, bar) in cut.bars {
        tune.sym_mut(id).kind = SymbolKind::Bar(bar);
    }
    if let Some(r) = cut.rest {
        tune.sym_mut(cut.end).ts_next = Some(r);
        tune.sym_mut(r).ts_prev = Some(cut.end);
    }
}

/// Beams do not cross a line end: close the last word of every voice and
/// open a new one after it.
fn close_words(tune: &mut Tune, ids: &[SymbolId], cut: &mut Severance) {
    let mut seen = HashSet::new();
    for &id in ids.iter().rev() {
        let s = tune.sym(id);
        if !s.is_note() || !seen.insert(s.voice) {
            continue;
        }
        if !s.flags.word_end && s.beamable() {
            cut.words.push((id, s.flags));
            tune.sym_mut(id).flags.word_end = true;
        }
        let mut next = tune.next(id);
        while let Some(n) = next {
            let ns = tune.sym(n);
            if ns.is_note() || ns.is_rest() || ns.is_bar() {
                break;
            }
            next = ns.next;
        }
        if let Some(n) = next.filter(|&n| tune.sym(n).is_note() && !tune.sym(n).flags.word_start) {
            cut.words.push((n, tune.sym(n).flags));
            tune.sym_mut(n).flags.word_start = true;
        }
    }
}

/// A repeat start or volta at the very end of a line moves to the next one.
fn split_bars(tune: &mut Tune, ids: &[SymbolId], cut: &mut Severance) {
    let mut seen = HashSet::new();
    for &id in ids.iter().rev() {
        let s = tune.sym(id);
        if !seen.insert(s.voice) {
            continue;
        }
        let Some(bar) = s.bar().cloned() else {
            continue;
        };
        let (here, next) = match bar.bar_type {
            BarType::LeftRepeat => (BarType::Single, BarType::LeftRepeat),
            BarType::DoubleRepeat => (BarType::RightRepeat, BarType::LeftRepeat),
            _ if bar.text.is_some() => (bar.bar_type, BarType::Invisible),
            _ => continue,
        };
        cut.carried.push((s.voice, BarData { bar_type: next, text: bar.text.clone(), wrong_duration: false }));
        tune.sym_mut(id).kind = SymbolKind::Bar(BarData { bar_type: here, text: None, wrong_duration: bar.wrong_duration });
        cut.bars.push((id, bar));
    }
}

/// Horizontal passes that depend on where the line ends.
fn prepare(tune: &mut Tune, ids: &[SymbolId]) {
    set_stems(tune, ids);
    place_heads(tune, ids);
    resolve_voice_collisions(tune, ids);
    set_widths(tune, ids);
    set_spacing(tune, ids);
}

fn cut_and_lay_out(
    ctx: &mut LayoutContext,
    tune: &mut Tune,
    mut end: SymbolId,
    sink: &mut dyn DrawSink,
    carried: &mut Vec<(usize, BarData)>,
) -> Result<LineLayout, LayoutError> {
    ctx.diagnostics.set_line(Some(ctx.line));
    let mut allow_cut = true;
    let base = ctx.config.clone();
    let (glue, moments, ids, cut, rejected) = loop {
        let cut = sever(tune, end);
        let ids = tune.ts_ids(tune.ts_first);
        ctx.config = base.clone();
        let rejected = apply_formats(&mut ctx.config, tune, &ids);
        prepare(tune, &ids);
        match fit_line(ctx, tune, &ids, cut.rest.is_none(), allow_cut) {
            GlueOutcome::Fit { glue, moments } => break (glue, moments, ids, cut, rejected),
            GlueOutcome::Cut { at } => {
                rejoin(tune, cut);
                if at == end {
                    allow_cut = false;
                } else {
                    end = at;
                }
            }
        }
    };

    tune.ts_first = cut.rest;
    *carried = cut.carried;
    for id in rejected {
        if let SymbolKind::FormatChange(f) = &tune.sym(id).kind {
            ctx.diagnostics.warning(
                DiagnosticKind::UnexpectedSymbol,
                Some(id),
                format!("ignored format change {} = {}", f.name, f.value),
            );
        }
    }
    if ctx.config != base {
        log::debug!("line {}: format changed", ctx.line);
    }

    place_graces(tune, &ids);
    set_extents(tune, &ids);
    let beams = compute_beams(ctx, tune, &ids);
    set_extents(tune, &ids);

    let mut work = LineWork::new(ids, glue.width);
    work.beams = beams;
    let carry = compute_curves(ctx, tune, &mut work);
    let metrics = finish_line(ctx, tune, &mut work);
    emit_line(ctx, tune, &work, &metrics, sink)?;
    update_voices(tune, &work.ids);

    log::trace!(
        "line {}: {} symbols, {:?} alpha {:.3} beta {:.3}, width {:.1}",
        ctx.line,
        work.ids.len(),
        glue.status,
        glue.alpha,
        glue.beta,
        glue.width
    );
    if glue.status != GlueStatus::Overfull {
        ctx.prev_glue = Some(glue);
    }

    let line = LineLayout {
        index: ctx.line,
        symbols: work.ids,
        glue,
        moments,
        width: work.width,
        height: metrics.height,
        advance: metrics.advance,
        staff_y: tune.staves.iter().map(|s| s.y).collect(),
        cut: cut.rest.map(|_| cut.end),
        carry,
        beams: work.beams,
        curves: work.curves,
    };
    ctx.line += 1;
    ctx.diagnostics.set_line(None);
    Ok(line)
}

/// Signatures in force at the end of a line carry into the next.
fn update_voices(tune: &mut Tune, ids: &[SymbolId]) {
    for &id in ids {
        let s = tune.sym(id);
        let v = s.voice;
        match &s.kind {
            SymbolKind::Clef(c) => {
                let c = *c;
                tune.voices[v].clef = c;
                let staff = tune.voices[v].staff;
                tune.staves[staff].clef = c;
            }
            SymbolKind::KeySig(k) => tune.voices[v].key = KeySig::new(k.sharps),
            SymbolKind::TimeSig(m) => tune.voices[v].meter = *m,
            _ => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builder::TuneBuilder;
    use crate::config::LayoutConfig;
    use crate::draw::NullSink;
    use crate::engine::vertical::map_pitches;
    use more_asserts::assert_gt;
    use pretty_assertions::assert_eq;

    fn c4() -> Vec<NoteHead> {
        vec![NoteHead::new(diatonic('C', 4))]
    }

    fn voice(b: &mut TuneBuilder) -> usize {
        let staff = b.add_staff(Clef::treble());
        b.add_voice("1", staff).unwrap()
    }

    fn measures(b: &mut TuneBuilder, v: usize, count: usize) {
        for _ in 0..count {
            for _ in 0..4 {
                b.note(v, c4(), QUARTER).unwrap();
            }
            b.bar(v, BarType::Single).unwrap();
        }
    }

    fn lay_out(tune: &mut Tune, config: &LayoutConfig) -> (LayoutContext, Vec<LineLayout>) {
        let mut ctx = LayoutContext::new(config);
        map_pitches(tune);
        let lines = run(&mut ctx, tune, &mut NullSink).expect("layout");
        (ctx, lines)
    }

    #[test]
    fn eoln_ends_lines() {
        let mut b = TuneBuilder::new();
        let v = voice(&mut b);
        measures(&mut b, v, 2);
        b.eoln(v).unwrap();
        measures(&mut b, v, 2);
        let mut tune = b.finish().unwrap();
        let (_, lines) = lay_out(&mut tune, &LayoutConfig::default());
        assert_eq!(lines.len(), 2);
        assert!(lines[0].cut.is_some());
        assert!(lines[1].cut.is_none());
        assert_eq!(tune.ts_first, None);
    }

    #[test]
    fn bars_per_line_overrides_eoln() {
        let mut b = TuneBuilder::new();
        let v = voice(&mut b);
        measures(&mut b, v, 1);
        b.eoln(v).unwrap();
        measures(&mut b, v, 5);
        let mut tune = b.finish().unwrap();
        let config = LayoutConfig { bars_per_line: Some(3), ..LayoutConfig::default() };
        let (_, lines) = lay_out(&mut tune, &config);
        assert_eq!(lines.len(), 2);
        let bars = |l: &LineLayout| l.symbols.iter().filter(|&&id| tune.sym(id).is_bar() && tune.sym(id).seq == SEQ_BAR).count();
        assert_eq!(bars(&lines[0]), 3);
        assert_eq!(bars(&lines[1]), 3);
    }

    #[test]
    fn every_line_starts_with_a_clef_and_key() {
        let mut b = TuneBuilder::new();
        let v = voice(&mut b);
        b.initial_key(v, KeySig::new(2)).unwrap();
        measures(&mut b, v, 2);
        b.eoln(v).unwrap();
        measures(&mut b, v, 2);
        let mut tune = b.finish().unwrap();
        let (_, lines) = lay_out(&mut tune, &LayoutConfig::default());
        for line in &lines {
            let seqs: Vec<u32> = line.symbols.iter().take(2).map(|&id| tune.sym(id).seq).collect();
            assert_eq!(seqs, vec![SEQ_LINE_CLEF, SEQ_LINE_KEY]);
        }
        let meters = |l: &LineLayout| l.symbols.iter().filter(|&&id| matches!(tune.sym(id).kind, SymbolKind::TimeSig(_))).count();
        assert_eq!(meters(&lines[0]), 1);
        assert_eq!(meters(&lines[1]), 0);
    }

    #[test]
    fn overfull_content_is_cut_into_several_lines() {
        let mut b = TuneBuilder::new();
        let v = voice(&mut b);
        measures(&mut b, v, 24);
        let mut tune = b.finish().unwrap();
        let config = LayoutConfig { continue_all: true, ..LayoutConfig::default() };
        let (ctx, lines) = lay_out(&mut tune, &config);
        assert_gt!(lines.len(), 1);
        for line in &lines {
            assert_ne!(line.glue.status, GlueStatus::Overfull);
            assert!(line.width <= ctx.width + 1e-6);
        }
        let notes: usize = lines.iter().map(|l| l.symbols.iter().filter(|&&id| tune.sym(id).is_note()).count()).sum();
        assert_eq!(notes, 96);
    }

    #[test]
    fn repeat_start_at_a_line_end_moves_to_the_next_line() {
        let mut b = TuneBuilder::new();
        let v = voice(&mut b);
        measures(&mut b, v, 1);
        b.bar(v, BarType::LeftRepeat).unwrap();
        b.eoln(v).unwrap();
        measures(&mut b, v, 1);
        let mut tune = b.finish().unwrap();
        let (_, lines) = lay_out(&mut tune, &LayoutConfig::default());
        assert_eq!(lines.len(), 2);
        let last = *lines[0].symbols.last().expect("symbols");
        assert_eq!(tune.sym(last).bar().map(|b| b.bar_type), Some(BarType::Single));
        let carried = lines[1]
            .symbols
            .iter()
            .find(|&&id| tune.sym(id).seq == SEQ_LINE_BAR)
            .and_then(|&id| tune.sym(id).bar().map(|b| b.bar_type));
        assert_eq!(carried, Some(BarType::LeftRepeat));
    }

    #[test]
    fn beams_close_at_a_forced_cut() {
        let mut b = TuneBuilder::new();
        let v = voice(&mut b);
        for _ in 0..64 {
            b.note(v, c4(), EIGHTH).unwrap();
        }
        let mut tune = b.finish().unwrap();
        let config = LayoutConfig { continue_all: true, ..LayoutConfig::default() };
        let (_, lines) = lay_out(&mut tune, &config);
        assert_gt!(lines.len(), 1);
        for line in &lines {
            for beam in &line.beams {
                assert!(line.symbols.contains(&beam.first));
                assert!(line.symbols.contains(&beam.last));
            }
        }
    }

    #[test]
    fn format_changes_apply_from_their_line() {
        let mut b = TuneBuilder::new();
        let v = voice(&mut b);
        measures(&mut b, v, 1);
        b.eoln(v).unwrap();
        b.format(v, "slur_height", "1.5").unwrap();
        b.format(v, "no_such_option", "3").unwrap();
        measures(&mut b, v, 1);
        let mut tune = b.finish().unwrap();
        let (ctx, _) = lay_out(&mut tune, &LayoutConfig::default());
        assert_eq!(ctx.config.slur_height, 1.5);
        assert_eq!(ctx.diagnostics.count(DiagnosticKind::UnexpectedSymbol), 1);
    }

    #[test]
    fn format_change_does_not_reach_back_to_earlier_lines() {
        let build = |change: bool| {
            let mut b = TuneBuilder::new();
            let v = voice(&mut b);
            let first = b.note(v, c4(), QUARTER).unwrap();
            b.note(v, c4(), QUARTER).unwrap();
            let third = b.note(v, c4(), QUARTER).unwrap();
            b.note(v, c4(), QUARTER).unwrap();
            b.slur_start(first, SlurPlacement::Auto).unwrap();
            b.slur_end(third).unwrap();
            b.bar(v, BarType::Single).unwrap();
            measures(&mut b, v, 30);
            if change {
                b.format(v, "slur_height", "3.0").unwrap();
            }
            measures(&mut b, v, 4);
            b.finish().unwrap()
        };
        let config = LayoutConfig { continue_all: true, ..LayoutConfig::default() };
        let (mut plain, mut changed) = (build(false), build(true));
        let (_, before) = lay_out(&mut plain, &config);
        let (ctx, after) = lay_out(&mut changed, &config);
        assert_gt!(after.len(), 2);
        assert_eq!(before[0].curves.len(), 1);
        assert_eq!(before[0].curves, after[0].curves);
        assert_eq!(ctx.config.slur_height, 3.0);
    }
}
