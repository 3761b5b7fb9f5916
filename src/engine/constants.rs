//! Engraving policy: every tuning constant of the layout engine.
//!
//! Units are unscaled staff units: one staff step (line to adjacent space)
//! is 3.0, the distance between two staff lines 6.0.  Staff-relative y grows
//! upwards from the bottom line.

// ── Staff geometry ──────────────────────────────────────────────────
pub(super) const STEP: f64 = 3.0; // one staff step
pub(super) const LINE_SPACING: f64 = 6.0; // between two staff lines
pub(super) const STAFF_TOP: f64 = 24.0; // top line
pub(super) const STAFF_MIDDLE: f64 = 12.0; // middle line
pub(super) const MIDDLE_STEP: i32 = 4; // middle line as a staff step

// ── Duration spacing: nwidth() anchors ──────────────────────────────
pub(super) const SPACE_SHORT_BASE: f64 = 7.0; // below a sixteenth: base + len * slope
pub(super) const SPACE_SIXTEENTH: f64 = 20.0;
pub(super) const SPACE_EIGHTH: f64 = 28.3;
pub(super) const SPACE_QUARTER: f64 = 40.0;
pub(super) const SPACE_HALF: f64 = 56.6;
pub(super) const SPACE_WHOLE: f64 = 80.0;
pub(super) const SPACE_BREVE: f64 = 113.0;
pub(super) const STRETCH_RATIO: f64 = 1.8; // stretch = space * ratio

// ── Spacing of zero-time neighbours ─────────────────────────────────
pub(super) const LINE_START_PAD: f64 = 2.0;
pub(super) const PAD_NOTE: f64 = 5.0; // note/rest/grace right after a bar or signature
pub(super) const PAD_BAR: f64 = 3.0;
pub(super) const PAD_CLEF: f64 = 2.0;
pub(super) const PAD_SIGNATURE: f64 = 3.0;

// ── Heads, dots, flags ──────────────────────────────────────────────
pub(super) const HW_FILLED: f64 = 4.5; // half head width
pub(super) const HW_WHOLE: f64 = 6.0;
pub(super) const HW_BREVE: f64 = 8.0;
pub(super) const HW_GRACE: f64 = 3.0;
pub(super) const STEM_XOFF: f64 = 4.0; // stem x from the head centre (filled heads)
pub(super) const GRACE_STEM_XOFF: f64 = 2.6;
pub(super) const DOT_SHIFT: f64 = 3.5; // first dot from head edge
pub(super) const DOT_SPACE: f64 = 3.5; // between dots
pub(super) const DOT_LINE_SHIFT: f64 = 3.5; // extra when a dotted head sits on a line
pub(super) const FLAG_WIDTH: f64 = 6.0; // extra right width of a free flag
pub(super) const STEM_CROSS_PAD: f64 = 3.5; // up-stem followed by down-stem
pub(super) const LEDGER_NEIGHBOUR_PAD: f64 = 1.5; // adjacent notes both with ledger lines
pub(super) const LEDGER_EXTEND: f64 = 3.0; // ledger line beyond head edge

// ── Accidentals ─────────────────────────────────────────────────────
pub(super) const ACC_HALF_WIDTH: f64 = 3.5;
pub(super) const ACC_GAP: f64 = 1.5; // between accidental and head
pub(super) const ACC_CONFLICT_STEPS: i32 = 6; // accidentals this close need their own column
pub(super) const ACC_SHIFT_WEAK: f64 = 5.0; // conflict distance 4 or 5 steps
pub(super) const ACC_SHIFT_STRONG: f64 = 7.5; // conflict distance 3 steps or less

// ── Voice collisions on a shared staff ──────────────────────────────
pub(super) const VOICE_SHIFT_UNISON: f64 = 8.0; // unison with different head or dots
pub(super) const VOICE_SHIFT_CROSS: f64 = 8.0; // crossed voices, filled heads
pub(super) const VOICE_SHIFT_CROSS_OPEN: f64 = 12.0; // crossed voices, an open head involved

// ── Bars: (left extent, right extent) around the bar x ──────────────
pub(super) const BAR_PAD: f64 = 4.0;
pub(super) const BAR_DOUBLE: (f64, f64) = (3.0, 0.0);
pub(super) const BAR_THIN_THICK: (f64, f64) = (4.5, 1.5);
pub(super) const BAR_THICK_THIN: (f64, f64) = (6.0, 0.0);
pub(super) const BAR_LEFT_REPEAT: (f64, f64) = (7.5, 3.2);
pub(super) const BAR_RIGHT_REPEAT: (f64, f64) = (9.2, 1.5);
pub(super) const BAR_DOUBLE_REPEAT: (f64, f64) = (8.2, 5.2);

// ── Signatures ──────────────────────────────────────────────────────
pub(super) const CLEF_HALF_WIDTH: f64 = 10.0;
pub(super) const SMALL_CLEF_RATIO: f64 = 0.75;
pub(super) const KEY_ACC_SPACE: f64 = 5.5; // per accidental
pub(super) const KEY_SWITCH_BUFFER: f64 = 3.0; // naturals followed by the other sign
pub(super) const METER_DIGIT_WIDTH: f64 = 7.0;

// ── Grace notes ─────────────────────────────────────────────────────
pub(super) const GRACE_NOTE_SPACE: f64 = 7.0; // between grace notes
pub(super) const GRACE_MAIN_GAP: f64 = 4.0; // last grace to the group position

// ── Text (width estimation: chars * size * factor) ──────────────────
pub(super) const TEXT_WIDTH_FACTOR: f64 = 0.55;
pub(super) const LYRIC_FONT_SIZE: f64 = 13.0;
pub(super) const GCHORD_FONT_SIZE: f64 = 12.0;
pub(super) const MEASURE_NUMBER_SIZE: f64 = 10.0;
pub(super) const TUPLET_FONT_SIZE: f64 = 10.0;
pub(super) const VOLTA_FONT_SIZE: f64 = 11.0;
pub(super) const LYRIC_MIN_GAP: f64 = 2.0;

// ── Stems ───────────────────────────────────────────────────────────
pub(super) const STEM: f64 = 20.0;
pub(super) const GRACE_STEM: f64 = 14.0;
pub(super) const STEM_FLAG_EXTRA: [f64; 6] = [0.0, 0.0, 2.0, 6.0, 10.0, 14.0]; // by flag count
pub(super) const STEM_MIN: [f64; 6] = [16.0, 16.0, 14.0, 12.0, 10.0, 10.0]; // single heads, by flags
pub(super) const STEM_MIN_CHORD: [f64; 6] = [14.0, 14.0, 10.0, 9.0, 9.0, 9.0]; // chords
pub(super) const GRACE_STEM_MIN: f64 = 10.0;

// ── Beams ───────────────────────────────────────────────────────────
pub(super) const BEAM_DEPTH: f64 = 3.2;
pub(super) const BEAM_SHIFT: f64 = 5.0; // between beam levels
pub(super) const BEAM_STUB: f64 = 7.0; // partial beam length
pub(super) const BEAM_OFFSET: f64 = 0.25; // staff line snap offset
pub(super) const BEAM_SLOPE: f64 = 0.5; // soft clamp scale, also the hard maximum
pub(super) const BEAM_FLATFAC: f64 = 0.6; // slope factor for non-collinear notes
pub(super) const BEAM_RESIDUAL: f64 = 0.5; // mean squared residual triggering flattening
pub(super) const BEAM_THRESH: f64 = 0.06; // normalised slope below which beams are flat
pub(super) const BEAM_CLEARANCE: f64 = 2.0; // above clefs, bars and grace notes
pub(super) const GRACE_BEAM_DEPTH: f64 = 1.7;
pub(super) const GRACE_BEAM_SHIFT: f64 = 3.0;
pub(super) const FLAT_BEAM_Y: f64 = -11.0; // bagpipe: beam under the staff
pub(super) const FLAT_BEAM_Y_UP: f64 = 35.0; // bagpipe: beam of up stems (graces)

// ── Slurs and ties ──────────────────────────────────────────────────
pub(super) const SLUR_SLOPE: f64 = 1.0;
pub(super) const SLUR_MAX_JUMP: f64 = 8.0;
pub(super) const SLUR_JUMP_DX: f64 = 0.5;
pub(super) const SLUR_JUMP_DY: f64 = 0.3;
pub(super) const SLUR_HEAD_CLEAR: f64 = 4.0; // endpoint beyond the head
pub(super) const SLUR_STEM_CLEAR: f64 = 2.0; // endpoint beyond the stem tip
pub(super) const SLUR_FLAG_NUDGE: f64 = 3.0; // start past a free flag
pub(super) const SLUR_STEM_NUDGE: f64 = 1.0;
pub(super) const SLUR_HEAD_NUDGE: f64 = 1.0;
pub(super) const SLUR_MIN_HEIGHT: f64 = 3.0;
pub(super) const SLUR_MAX_HEIGHT: f64 = 24.0;
pub(super) const SLUR_HEIGHT_BASE: f64 = 3.0;
pub(super) const SLUR_HEIGHT_PER_UNIT: f64 = 0.04; // per unit of span width
pub(super) const SLUR_HEIGHT_PER_NOTE: f64 = 0.5; // per note beyond the endpoints
pub(super) const SLUR_CLEAR_PAD: f64 = 2.0;
pub(super) const SLUR_ENDPOINT_BLEND: f64 = 0.45;
pub(super) const SLUR_HEIGHT_BLEND: f64 = 0.65;
pub(super) const CURVE_ALFA: f64 = 0.3; // control point inset along the chord
pub(super) const CURVE_PEAK: f64 = 0.75; // bow height of a cubic with equal control offsets
pub(super) const TIE_MIN_HEIGHT: f64 = 3.0;
pub(super) const TIE_MAX_HEIGHT: f64 = 8.0;
pub(super) const TIE_HEIGHT_PER_UNIT: f64 = 0.04;
pub(super) const TIE_GAP: f64 = 1.0; // between head and tie end
pub(super) const TIE_Y_OFFSET: f64 = 2.0;
pub(super) const LINE_EDGE_TIE: f64 = 12.0; // half tie length at a line start

// ── Vertical layout ─────────────────────────────────────────────────
pub(super) const YSTEP_PAD: f64 = 2.0; // around registered footprints
pub(super) const STAFF_CLEARANCE_PAD: f64 = 6.0;
pub(super) const LINE_BOTTOM_PAD: f64 = 6.0;
pub(super) const DECO_SPACE: f64 = 6.0;
pub(super) const GCHORD_SPACE: f64 = 4.0;
pub(super) const TUPLET_SPACE: f64 = 4.0;
pub(super) const VOLTA_HEIGHT: f64 = 8.0;
pub(super) const REST_VOICE_SHIFT: f64 = 12.0; // rests of a multi-voice staff leave the middle line
