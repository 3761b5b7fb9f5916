//! Layout invariants checked over a family of generated tunes: placement,
//! glue, beams, curve determinism and carry-over bookkeeping.

use more_asserts::{assert_ge, assert_le};
use pretty_assertions::assert_eq;
use scorelayout::engine::{positions, GlueStatus};
use scorelayout::*;

const EPS: f64 = 1e-6;
const MAX_BEAM_SLOPE: f64 = 0.5;

/// Small deterministic generator so every run sees the same tunes.
struct Lcg(u64);

impl Lcg {
    fn next(&mut self) -> u64 {
        self.0 = self.0.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
        self.0 >> 33
    }

    fn pick(&mut self, n: usize) -> usize {
        (self.next() % n as u64) as usize
    }
}

const PATTERNS: [&[i32]; 6] = [
    &[QUARTER, QUARTER, QUARTER, QUARTER],
    &[EIGHTH, EIGHTH, EIGHTH, EIGHTH, EIGHTH, EIGHTH, EIGHTH, EIGHTH],
    &[HALF, QUARTER, EIGHTH, EIGHTH],
    &[EIGHTH + SIXTEENTH, SIXTEENTH, QUARTER, HALF],
    &[SIXTEENTH, SIXTEENTH, SIXTEENTH, SIXTEENTH, QUARTER, HALF],
    &[WHOLE],
];

const STEPS: [char; 7] = ['C', 'D', 'E', 'F', 'G', 'A', 'B'];

/// Two voices on a treble staff and one on a braced bass staff, with ties,
/// slurs and hyphenated lyrics in the top voice.
fn generated_tune(seed: u64, measures: usize) -> Tune {
    let mut rng = Lcg(seed);
    let mut b = TuneBuilder::new();
    let treble = b.add_staff(Clef::treble());
    let bass = b.add_staff(Clef::bass());
    b.group_staves(treble, 2, StaffGroup::Brace).unwrap();
    let voices = [
        b.add_voice("upper", treble).unwrap(),
        b.add_voice("lower", treble).unwrap(),
        b.add_voice("bass", bass).unwrap(),
    ];
    let octaves = [5, 4, 3];

    for (v, &voice) in voices.iter().enumerate() {
        let mut tied_pitch: Option<i32> = None;
        let mut slur_open = false;
        let mut syllable = 0;
        for m in 0..measures {
            let pattern = PATTERNS[rng.pick(PATTERNS.len())];
            for (i, &d) in pattern.iter().enumerate() {
                let last = m + 1 == measures && i + 1 == pattern.len();
                let pitch = tied_pitch.take().unwrap_or_else(|| diatonic(STEPS[rng.pick(7)], octaves[v]));
                let id = b.note(voice, vec![NoteHead::new(pitch)], d).unwrap();
                if !last && rng.pick(6) == 0 {
                    b.tie(id, pitch).unwrap();
                    tied_pitch = Some(pitch);
                }
                if slur_open && (last || rng.pick(3) == 0) {
                    b.slur_end(id).unwrap();
                    slur_open = false;
                } else if !slur_open && !last && rng.pick(5) == 0 {
                    b.slur_start(id, SlurPlacement::Auto).unwrap();
                    slur_open = true;
                }
                if v == 0 {
                    syllable += 1;
                    let text = format!("la{syllable}");
                    let lyric = if !last && rng.pick(2) == 0 { Lyric::hyphenated(text) } else { Lyric::new(text) };
                    b.lyric(id, 0, lyric).unwrap();
                }
            }
            b.bar(voice, BarType::Single).unwrap();
            if m % 3 == 2 {
                b.eoln(voice).unwrap();
            }
        }
    }
    b.finish().unwrap()
}

fn lay_out(tune: &mut Tune, config: &LayoutConfig) -> TuneLayout {
    layout_tune(tune, config, &mut NullSink).expect("layout failed")
}

fn configs() -> Vec<LayoutConfig> {
    vec![
        LayoutConfig::default(),
        LayoutConfig { continue_all: true, ..LayoutConfig::default() },
        LayoutConfig { bars_per_line: Some(2), scale: 1.0, ..LayoutConfig::default() },
    ]
}

fn each_layout(mut check: impl FnMut(&Tune, &TuneLayout, &LayoutConfig)) {
    for seed in 1..=6 {
        for config in configs() {
            let mut tune = generated_tune(seed, 9);
            let layout = lay_out(&mut tune, &config);
            check(&tune, &layout, &config);
        }
    }
}

#[test]
fn x_never_decreases_in_time_order() {
    each_layout(|tune, layout, _| {
        for line in &layout.lines {
            for pair in line.symbols.windows(2) {
                let (a, b) = (tune.sym(pair[0]), tune.sym(pair[1]));
                assert_le!(a.x, b.x + EPS, "line {}: {} after {}", line.index, pair[1], pair[0]);
            }
        }
    });
}

#[test]
fn advances_respect_shrink_and_lines_fit() {
    each_layout(|_, layout, config| {
        for line in &layout.lines {
            let xs = positions(&line.moments, &line.glue);
            let mut prev = 0.0;
            for (m, &x) in line.moments.iter().zip(&xs) {
                assert_ge!(x - prev, m.shrink - EPS);
                prev = x;
            }
            if line.glue.status != GlueStatus::Overfull {
                assert_le!(line.width, config.line_width() + EPS);
            }
        }
    });
}

#[test]
fn glue_reproduces_the_placed_positions() {
    each_layout(|tune, layout, _| {
        for line in &layout.lines {
            let first = positions(&line.moments, &line.glue);
            let second = positions(&line.moments, &line.glue);
            assert_eq!(first, second);
            for (m, &x) in line.moments.iter().zip(&first) {
                for &id in &m.ids {
                    assert_eq!(tune.sym(id).x, x);
                }
            }
        }
    });
}

#[test]
fn beam_slopes_are_clamped_and_flattening_only_reduces() {
    each_layout(|_, layout, _| {
        for beam in layout.lines.iter().flat_map(|l| &l.beams) {
            assert_le!(beam.slope.abs(), MAX_BEAM_SLOPE + EPS);
            if beam.flattened {
                assert_le!(beam.slope.abs(), beam.fitted_slope.abs() + EPS);
            }
        }
    });
}

#[test]
fn curves_are_deterministic() {
    for seed in 1..=4 {
        let config = LayoutConfig::default();
        let (mut a, mut b) = (generated_tune(seed, 9), generated_tune(seed, 9));
        let (la, lb) = (lay_out(&mut a, &config), lay_out(&mut b, &config));
        assert_eq!(la.lines.len(), lb.lines.len());
        for (x, y) in la.lines.iter().zip(&lb.lines) {
            assert_eq!(x.curves, y.curves);
        }
    }
}

#[test]
fn carried_ties_and_slurs_are_conserved() {
    each_layout(|tune, layout, _| {
        for line in &layout.lines {
            assert!(line.carry.is_balanced(), "line {}: {:?}", line.index, line.carry);
        }
        for pair in layout.lines.windows(2) {
            let (a, b) = (&pair[0].carry, &pair[1].carry);
            assert_eq!(a.ties_out, b.ties_in);
            assert_eq!(a.slurs_out, b.slurs_in);
            assert_eq!(a.hyphens_out, b.hyphens_in);
        }
        if let Some(last) = layout.lines.last() {
            assert_eq!(last.carry.ties_out, 0);
            assert_eq!(last.carry.slurs_out, 0);
        }
        assert!(tune.voices.iter().all(|v| v.carry.ties.is_empty()));
    });
}

#[test]
fn every_note_is_laid_out_once() {
    each_layout(|tune, layout, _| {
        let mut seen: Vec<SymbolId> = layout.lines.iter().flat_map(|l| l.symbols.iter().copied()).collect();
        let total = seen.len();
        seen.sort_by_key(|id| id.0);
        seen.dedup();
        assert_eq!(seen.len(), total);
        let notes = tune.symbols.iter().filter(|s| s.is_note() && !s.flags.grace).count();
        assert_eq!(seen.iter().filter(|&&id| tune.sym(id).is_note()).count(), notes);
    });
}
