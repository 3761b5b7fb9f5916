//! Data model for one tune: an arena of symbols doubly linked per voice and,
//! across all voices, in time order.
//!
//! Links are `Option<SymbolId>` indices into [`Tune::symbols`].  A voice list
//! owns its symbols; the time-order list only threads through them.  Grace
//! groups hang their notes off the group symbol's `extra` link as a separate
//! voice-order sub-list which is never part of the time-order list.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{Diagnostics, LayoutError};

// ── Durations (ticks) ───────────────────────────────────────────────
pub const BREVE: i32 = 3072;
pub const WHOLE: i32 = 1536;
pub const HALF: i32 = 768;
pub const QUARTER: i32 = 384;
pub const EIGHTH: i32 = 192;
pub const SIXTEENTH: i32 = 96;

/// Index of a symbol in the tune arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SymbolId(pub usize);

impl fmt::Display for SymbolId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Diatonic pitch number: C4 (middle C) is 28, each step one letter name.
pub fn diatonic(step: char, octave: i32) -> i32 {
    let index = match step.to_ascii_uppercase() {
        'C' => 0,
        'D' => 1,
        'E' => 2,
        'F' => 3,
        'G' => 4,
        'A' => 5,
        'B' => 6,
        _ => 0,
    };
    octave * 7 + index
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Accidental {
    Sharp,
    Flat,
    Natural,
    DoubleSharp,
    DoubleFlat,
}

/// Note-head (and rest glyph) shape.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum HeadType {
    Breve,
    Whole,
    Half,
    Filled,
}

impl HeadType {
    pub fn is_open(self) -> bool {
        !matches!(self, HeadType::Filled)
    }
}

/// Head, dot count and flag count for a notated duration.
///
/// `nflags` is -1 for stemless heads (whole and breve), 0 for half and
/// quarter notes, 1 for eighths, and so on.
pub fn note_shape(duration: i32) -> (HeadType, u8, i8) {
    let mut base = BREVE;
    while base > 1 && base > duration {
        base /= 2;
    }
    let mut dots = 0u8;
    let mut rest = duration - base;
    let mut part = base / 2;
    while rest > 0 && part > 0 && rest >= part && dots < 3 {
        rest -= part;
        part /= 2;
        dots += 1;
    }
    let (head, nflags) = if base >= BREVE {
        (HeadType::Breve, -1)
    } else if base >= WHOLE {
        (HeadType::Whole, -1)
    } else if base >= HALF {
        (HeadType::Half, 0)
    } else {
        let mut flags = 0i8;
        let mut b = QUARTER;
        while b > base && b > 1 {
            b /= 2;
            flags += 1;
        }
        (HeadType::Filled, flags)
    };
    (head, dots, nflags)
}

/// One head of a note or chord.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NoteHead {
    /// Diatonic pitch (see [`diatonic`])
    pub pitch: i32,
    pub accidental: Option<Accidental>,
    /// A tie starts at this head
    pub tie: bool,
    /// Staff step, 0 = bottom line, 8 = top line (set by vertical placement)
    pub step: i32,
    /// Horizontal head shift for seconds in chords
    pub shift: f64,
    /// Horizontal position of the accidental relative to the note x
    pub acc_x: f64,
}

impl NoteHead {
    pub fn new(pitch: i32) -> Self {
        Self {
            pitch,
            accidental: None,
            tie: false,
            step: 0,
            shift: 0.0,
            acc_x: 0.0,
        }
    }

    pub fn with_accidental(mut self, accidental: Accidental) -> Self {
        self.accidental = Some(accidental);
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NoteData {
    /// Heads sorted ascending by pitch
    pub heads: Vec<NoteHead>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BarType {
    Single,
    Double,
    ThinThick,
    ThickThin,
    LeftRepeat,
    RightRepeat,
    DoubleRepeat,
    Dotted,
    Invisible,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BarData {
    pub bar_type: BarType,
    /// Repeat-ending (volta) text starting at this bar, e.g. "1" or "2"
    pub text: Option<String>,
    /// The measure ending here holds more time than the meter allows
    pub wrong_duration: bool,
}

impl BarData {
    /// Bars a continued slur may restart from at the beginning of a line.
    pub fn is_slur_restart(&self) -> bool {
        matches!(
            self.bar_type,
            BarType::RightRepeat | BarType::DoubleRepeat | BarType::ThinThick | BarType::ThickThin
        ) || self.text.as_deref().map_or(false, |t| !t.starts_with('1'))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ClefType {
    Treble,
    Bass,
    Alto,
    Tenor,
    Percussion,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Clef {
    pub clef_type: ClefType,
    /// Staff line of the clef's reference pitch, 1 = bottom line
    pub line: i32,
    /// Octave transposition (-1 for an "8vb" treble clef)
    pub octave: i32,
}

impl Clef {
    pub fn treble() -> Self {
        Self { clef_type: ClefType::Treble, line: 2, octave: 0 }
    }

    pub fn bass() -> Self {
        Self { clef_type: ClefType::Bass, line: 4, octave: 0 }
    }

    pub fn alto() -> Self {
        Self { clef_type: ClefType::Alto, line: 3, octave: 0 }
    }

    pub fn tenor() -> Self {
        Self { clef_type: ClefType::Tenor, line: 4, octave: 0 }
    }

    /// Diatonic pitch shown on the bottom staff line.
    pub fn bottom_line_pitch(&self) -> i32 {
        let reference = match self.clef_type {
            ClefType::Treble | ClefType::Percussion => diatonic('G', 4),
            ClefType::Bass => diatonic('F', 3),
            ClefType::Alto | ClefType::Tenor => diatonic('C', 4),
        };
        reference - (self.line - 1) * 2 + self.octave * 7
    }
}

impl Default for Clef {
    fn default() -> Self {
        Self::treble()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeySig {
    /// Sharps (positive) or flats (negative)
    pub sharps: i32,
    /// Key in force before this change, for cancellation naturals
    pub old_sharps: Option<i32>,
}

impl KeySig {
    pub fn new(sharps: i32) -> Self {
        Self { sharps, old_sharps: None }
    }

    /// Number of cancelling naturals drawn before the new accidentals.
    pub fn naturals(&self) -> u32 {
        let old = match self.old_sharps {
            Some(o) if o != 0 => o,
            _ => return 0,
        };
        if self.sharps == 0 || (old > 0) != (self.sharps > 0) {
            old.unsigned_abs()
        } else if self.sharps.abs() < old.abs() {
            old.unsigned_abs() - self.sharps.unsigned_abs()
        } else {
            0
        }
    }

    /// The key switches between sharps and flats.
    pub fn switches_sign(&self) -> bool {
        matches!(self.old_sharps, Some(o) if o != 0 && self.sharps != 0 && (o > 0) != (self.sharps > 0))
    }
}

impl Default for KeySig {
    fn default() -> Self {
        Self::new(0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Meter {
    pub top: u32,
    pub bottom: u32,
}

impl Meter {
    pub fn new(top: u32, bottom: u32) -> Self {
        Self { top, bottom }
    }

    /// Duration of a full measure in ticks.
    pub fn measure_length(&self) -> i32 {
        if self.bottom == 0 {
            return 0;
        }
        (self.top as i32) * WHOLE / self.bottom as i32
    }
}

impl Default for Meter {
    fn default() -> Self {
        Self::new(4, 4)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct GraceData {
    /// Draw a slur from the last grace note to the main note
    pub slur_to_main: bool,
    /// Acciaccatura slash through the first stem
    pub slash: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TupletData {
    /// p notes ...
    pub p: u32,
    /// ... in the time of q
    pub q: u32,
    /// number of notes affected
    pub r: u32,
}

/// A deferred formatting directive carried in the symbol stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FormatChange {
    pub name: String,
    pub value: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum SymbolKind {
    Note(NoteData),
    Rest,
    Bar(BarData),
    Clef(Clef),
    KeySig(KeySig),
    TimeSig(Meter),
    /// Grace-note group; the notes are the sub-list at `extra`
    Grace(GraceData),
    Tuplet(TupletData),
    /// A gap in the staff lines of the given width
    StaffBreak(f64),
    FormatChange(FormatChange),
}

impl SymbolKind {
    /// Ordering rank among symbols of different kinds at the same time.
    pub fn rank(&self) -> u32 {
        match self {
            SymbolKind::FormatChange(_) => SEQ_FORMAT,
            SymbolKind::Clef(_) => SEQ_CLEF,
            SymbolKind::Bar(_) => SEQ_BAR,
            SymbolKind::KeySig(_) => SEQ_KEY,
            SymbolKind::TimeSig(_) => SEQ_METER,
            SymbolKind::StaffBreak(_) => SEQ_STAFF_BREAK,
            SymbolKind::Tuplet(_) => SEQ_TUPLET,
            SymbolKind::Grace(_) => SEQ_GRACE,
            SymbolKind::Note(_) | SymbolKind::Rest => SEQ_NOTE,
        }
    }

    pub fn is_note_or_rest(&self) -> bool {
        matches!(self, SymbolKind::Note(_) | SymbolKind::Rest)
    }

    pub fn name(&self) -> &'static str {
        match self {
            SymbolKind::Note(_) => "note",
            SymbolKind::Rest => "rest",
            SymbolKind::Bar(_) => "bar",
            SymbolKind::Clef(_) => "clef",
            SymbolKind::KeySig(_) => "key signature",
            SymbolKind::TimeSig(_) => "time signature",
            SymbolKind::Grace(_) => "grace group",
            SymbolKind::Tuplet(_) => "tuplet",
            SymbolKind::StaffBreak(_) => "staff break",
            SymbolKind::FormatChange(_) => "format change",
        }
    }
}

// ── Sequence ranks ──────────────────────────────────────────────────
// Symbols re-created at a line start sort before everything else at
// the same time.
pub const SEQ_LINE_CLEF: u32 = 0;
pub const SEQ_LINE_KEY: u32 = 1;
pub const SEQ_LINE_METER: u32 = 2;
pub const SEQ_LINE_BAR: u32 = 3;
pub const SEQ_FORMAT: u32 = 4;
pub const SEQ_CLEF: u32 = 5;
pub const SEQ_BAR: u32 = 6;
pub const SEQ_KEY: u32 = 7;
pub const SEQ_METER: u32 = 8;
pub const SEQ_STAFF_BREAK: u32 = 9;
pub const SEQ_TUPLET: u32 = 10;
pub const SEQ_GRACE: u32 = 11;
pub const SEQ_NOTE: u32 = 12;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SlurPlacement {
    Auto,
    Above,
    Below,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Lyric {
    pub text: String,
    /// A hyphen follows this syllable
    pub hyphen: bool,
    /// An extender line follows this syllable
    pub extend: bool,
}

impl Lyric {
    pub fn new(text: impl Into<String>) -> Self {
        Self { text: text.into(), hyphen: false, extend: false }
    }

    pub fn hyphenated(text: impl Into<String>) -> Self {
        Self { text: text.into(), hyphen: true, extend: false }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Decoration {
    Staccato,
    Accent,
    Tenuto,
    Fermata,
    Trill,
    Other(String),
}

/// Per-symbol boolean state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct SymbolFlags {
    pub grace: bool,
    /// End of a source line
    pub eoln: bool,
    pub invisible: bool,
    pub stemless: bool,
    /// Stem direction given in the source, not computed
    pub stem_fixed: bool,
    /// A beam may not continue into this note
    pub beam_split: bool,
    /// Secondary beams break before this note
    pub beam_break: bool,
    /// Beams above the second level break before this note
    pub beam_break2: bool,
    pub word_start: bool,
    pub word_end: bool,
    pub in_tuplet: bool,
    pub tuplet_start: bool,
    pub tuplet_end: bool,
    /// First symbol of its (time, sequence) moment
    pub moment_start: bool,
    /// Whole-measure rest centred between its bars
    pub measure_rest: bool,
}

/// One musical or formatting element.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Symbol {
    pub kind: SymbolKind,
    /// Advance in time for the owning voice; 0 for formatting symbols
    pub duration: i32,
    /// Absolute start time within the tune
    pub time: i32,
    /// Tie-break order for symbols sharing a time
    pub seq: u32,
    pub voice: usize,
    pub staff: usize,

    pub next: Option<SymbolId>,
    pub prev: Option<SymbolId>,
    pub ts_next: Option<SymbolId>,
    pub ts_prev: Option<SymbolId>,
    pub extra: Option<SymbolId>,
    /// Owning grace group for grace notes
    pub parent: Option<SymbolId>,

    pub flags: SymbolFlags,
    /// +1 up, -1 down, 0 none
    pub stem: i8,
    pub nflags: i8,
    pub dots: u8,
    pub head: HeadType,
    pub slur_starts: Vec<SlurPlacement>,
    pub slur_ends: u8,
    /// One entry per verse
    pub lyrics: Vec<Option<Lyric>>,
    pub gchord: Option<String>,
    pub decorations: Vec<Decoration>,

    // ── Geometry (points, staff-relative, y up from the bottom line) ──
    pub x: f64,
    pub y: f64,
    pub y_min: f64,
    pub y_max: f64,
    pub y_avg: f64,
    /// Stem end
    pub y_stem: f64,
    /// Horizontal offset of the whole note from voice collision
    pub x_shift: f64,
    /// Extra horizontal offset of the dots
    pub dot_shift: f64,
    pub w_left: f64,
    pub w_right: f64,
    pub space: f64,
    pub shrink: f64,
    pub stretch: f64,
}

impl Symbol {
    pub fn new(kind: SymbolKind, voice: usize, staff: usize) -> Self {
        let seq = kind.rank();
        Self {
            kind,
            duration: 0,
            time: 0,
            seq,
            voice,
            staff,
            next: None,
            prev: None,
            ts_next: None,
            ts_prev: None,
            extra: None,
            parent: None,
            flags: SymbolFlags::default(),
            stem: 0,
            nflags: -1,
            dots: 0,
            head: HeadType::Filled,
            slur_starts: Vec::new(),
            slur_ends: 0,
            lyrics: Vec::new(),
            gchord: None,
            decorations: Vec::new(),
            x: 0.0,
            y: 0.0,
            y_min: 0.0,
            y_max: 0.0,
            y_avg: 0.0,
            y_stem: 0.0,
            x_shift: 0.0,
            dot_shift: 0.0,
            w_left: 0.0,
            w_right: 0.0,
            space: 0.0,
            shrink: 0.0,
            stretch: 0.0,
        }
    }

    pub fn heads(&self) -> &[NoteHead] {
        match &self.kind {
            SymbolKind::Note(n) => &n.heads,
            _ => &[],
        }
    }

    pub fn heads_mut(&mut self) -> Option<&mut Vec<NoteHead>> {
        match &mut self.kind {
            SymbolKind::Note(n) => Some(&mut n.heads),
            _ => None,
        }
    }

    pub fn is_note(&self) -> bool {
        matches!(self.kind, SymbolKind::Note(_))
    }

    pub fn is_rest(&self) -> bool {
        matches!(self.kind, SymbolKind::Rest)
    }

    pub fn is_bar(&self) -> bool {
        matches!(self.kind, SymbolKind::Bar(_))
    }

    pub fn bar(&self) -> Option<&BarData> {
        match &self.kind {
            SymbolKind::Bar(b) => Some(b),
            _ => None,
        }
    }

    /// Note with a visible stem.
    pub fn has_stem(&self) -> bool {
        self.is_note() && self.nflags >= 0 && !self.flags.stemless
    }

    /// Note that can join a beam.
    pub fn beamable(&self) -> bool {
        self.has_stem() && self.nflags > 0
    }

    /// Bottom and top staff steps of the heads.
    pub fn step_range(&self) -> Option<(i32, i32)> {
        let heads = self.heads();
        Some((heads.first()?.step, heads.last()?.step))
    }

    /// End time in the owning voice.
    pub fn end_time(&self) -> i32 {
        self.time + self.duration
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StemPolicy {
    Auto,
    Up,
    Down,
}

/// Ties, slurs and hyphens left open at the end of a line.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct CarryOver {
    /// Pitches of heads whose tie continues on the next line
    pub ties: Vec<i32>,
    /// Direction of every slur still open, innermost last
    pub slurs: Vec<SlurPlacement>,
    /// Verses whose last syllable expects a hyphen
    pub hyphens: Vec<usize>,
}

impl CarryOver {
    pub fn is_empty(&self) -> bool {
        self.ties.is_empty() && self.slurs.is_empty() && self.hyphens.is_empty()
    }
}

/// One musical part.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Voice {
    pub name: String,
    pub staff: usize,
    pub clef: Clef,
    pub key: KeySig,
    pub meter: Meter,
    pub stem_policy: StemPolicy,
    pub scale: f64,
    /// Head of the voice list (first symbol of the current line once cut)
    pub first: Option<SymbolId>,
    pub last: Option<SymbolId>,
    pub carry: CarryOver,
}

impl Voice {
    pub fn new(name: impl Into<String>, staff: usize) -> Self {
        Self {
            name: name.into(),
            staff,
            clef: Clef::treble(),
            key: KeySig::default(),
            meter: Meter::default(),
            stem_policy: StemPolicy::Auto,
            scale: 1.0,
            first: None,
            last: None,
            carry: CarryOver::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StaffGroup {
    Brace,
    Bracket,
}

/// Number of horizontal buckets used for vertical collision tracking.
pub const YSTEPS: usize = 128;

/// A set of staff lines shared by one or more voices.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Staff {
    /// Distance from the line top down to the bottom staff line (points)
    pub y: f64,
    /// Highest reserved offset per horizontal bucket
    pub top: Vec<f64>,
    /// Lowest reserved offset per horizontal bucket
    pub bottom: Vec<f64>,
    pub clef: Clef,
    /// Group starting at this staff and the number of staves it spans
    pub group: Option<(StaffGroup, usize)>,
    /// Baselines of the lyric verses for the current line
    pub lyric_y: Vec<f64>,
    /// Baseline of guitar chords for the current line
    pub gchord_y: f64,
}

impl Staff {
    pub fn new(clef: Clef) -> Self {
        Self {
            y: 0.0,
            top: vec![0.0; YSTEPS],
            bottom: vec![0.0; YSTEPS],
            clef,
            group: None,
            lyric_y: Vec::new(),
            gchord_y: 0.0,
        }
    }
}

/// One tune: the arena and its lists.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Tune {
    pub title: Option<String>,
    pub symbols: Vec<Symbol>,
    pub voices: Vec<Voice>,
    pub staves: Vec<Staff>,
    /// Head of the time-order list (first symbol of the current line once cut)
    pub ts_first: Option<SymbolId>,
    /// Structural conditions found while linking
    pub diagnostics: Diagnostics,
}

impl Tune {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn sym(&self, id: SymbolId) -> &Symbol {
        &self.symbols[id.0]
    }

    pub fn sym_mut(&mut self, id: SymbolId) -> &mut Symbol {
        &mut self.symbols[id.0]
    }

    pub fn get(&self, id: SymbolId) -> Option<&Symbol> {
        self.symbols.get(id.0)
    }

    /// Store a symbol in the arena without linking it.
    pub fn alloc(&mut self, symbol: Symbol) -> SymbolId {
        self.symbols.push(symbol);
        SymbolId(self.symbols.len() - 1)
    }

    pub fn next(&self, id: SymbolId) -> Option<SymbolId> {
        self.sym(id).next
    }

    pub fn prev(&self, id: SymbolId) -> Option<SymbolId> {
        self.sym(id).prev
    }

    pub fn ts_next(&self, id: SymbolId) -> Option<SymbolId> {
        self.sym(id).ts_next
    }

    pub fn ts_prev(&self, id: SymbolId) -> Option<SymbolId> {
        self.sym(id).ts_prev
    }

    /// Time-order ids from `start` to the end of the (current) list.
    pub fn ts_ids(&self, start: Option<SymbolId>) -> Vec<SymbolId> {
        let mut ids = Vec::new();
        let mut cur = start;
        while let Some(id) = cur {
            ids.push(id);
            cur = self.ts_next(id);
        }
        ids
    }

    /// Time-order ids from `start` through `end` inclusive.
    pub fn ts_range(&self, start: SymbolId, end: SymbolId) -> Vec<SymbolId> {
        let mut ids = Vec::new();
        let mut cur = Some(start);
        while let Some(id) = cur {
            ids.push(id);
            if id == end {
                break;
            }
            cur = self.ts_next(id);
        }
        ids
    }

    /// Voice-order ids from `start` to the end of the list.
    pub fn voice_ids(&self, start: Option<SymbolId>) -> Vec<SymbolId> {
        let mut ids = Vec::new();
        let mut cur = start;
        while let Some(id) = cur {
            ids.push(id);
            cur = self.next(id);
        }
        ids
    }

    /// Grace notes of a grace group.
    pub fn grace_notes(&self, group: SymbolId) -> Vec<SymbolId> {
        self.voice_ids(self.sym(group).extra)
    }

    /// Append a symbol to the end of a voice list.
    pub fn append_to_voice(&mut self, voice: usize, id: SymbolId) -> Result<(), LayoutError> {
        let last = self.voices.get(voice).ok_or(LayoutError::UnknownVoice(voice))?.last;
        {
            let s = self.sym_mut(id);
            s.prev = last;
            s.next = None;
        }
        match last {
            Some(l) => self.sym_mut(l).next = Some(id),
            None => self.voices[voice].first = Some(id),
        }
        self.voices[voice].last = Some(id);
        Ok(())
    }

    /// Link `id` into its voice list just before `at` (or as the head when `at`
    /// is the current head).
    pub fn insert_voice_before(&mut self, id: SymbolId, at: SymbolId) {
        let voice = self.sym(at).voice;
        let prev = self.sym(at).prev;
        {
            let s = self.sym_mut(id);
            s.prev = prev;
            s.next = Some(at);
        }
        self.sym_mut(at).prev = Some(id);
        match prev {
            Some(p) => self.sym_mut(p).next = Some(id),
            None => {
                if self.voices[voice].first == Some(at) || self.voices[voice].first.is_none() {
                    self.voices[voice].first = Some(id);
                }
            }
        }
    }

    /// Link `id` into the time-order list just before `at`.
    pub fn insert_ts_before(&mut self, id: SymbolId, at: SymbolId) {
        let prev = self.ts_prev(at);
        {
            let s = self.sym_mut(id);
            s.ts_prev = prev;
            s.ts_next = Some(at);
        }
        self.sym_mut(at).ts_prev = Some(id);
        match prev {
            Some(p) => self.sym_mut(p).ts_next = Some(id),
            None => self.ts_first = Some(id),
        }
    }

    /// Remove `id` from the time-order list, keeping it in its voice.
    pub fn unlink_ts(&mut self, id: SymbolId) {
        let (prev, next) = (self.ts_prev(id), self.ts_next(id));
        match prev {
            Some(p) => self.sym_mut(p).ts_next = next,
            None => {
                if self.ts_first == Some(id) {
                    self.ts_first = next;
                }
            }
        }
        if let Some(n) = next {
            self.sym_mut(n).ts_prev = prev;
        }
        let s = self.sym_mut(id);
        s.ts_prev = None;
        s.ts_next = None;
    }

    /// Merge all voice lists into the time-order list, ordered by
    /// `(time, seq)`, then voice index, then voice order.
    pub fn link_time_order(&mut self) {
        let mut order: Vec<(i32, u32, usize, usize, SymbolId)> = Vec::new();
        for (v, voice) in self.voices.iter().enumerate() {
            let mut cur = voice.first;
            let mut pos = 0usize;
            while let Some(id) = cur {
                let s = self.sym(id);
                order.push((s.time, s.seq, v, pos, id));
                pos += 1;
                cur = s.next;
            }
        }
        order.sort_by(|a, b| (a.0, a.1, a.2, a.3).cmp(&(b.0, b.1, b.2, b.3)));

        let mut prev: Option<SymbolId> = None;
        self.ts_first = order.first().map(|o| o.4);
        for &(_, _, _, _, id) in &order {
            self.sym_mut(id).ts_prev = prev;
            if let Some(p) = prev {
                self.sym_mut(p).ts_next = Some(id);
            }
            prev = Some(id);
        }
        if let Some(p) = prev {
            self.sym_mut(p).ts_next = None;
        }
        self.mark_moments(self.ts_first);
    }

    /// Recompute `moment_start` from `start` to the end of the list.
    pub fn mark_moments(&mut self, start: Option<SymbolId>) {
        let mut cur = start;
        while let Some(id) = cur {
            let starts = match self.ts_prev(id) {
                None => true,
                Some(p) => {
                    let (a, b) = (self.sym(p), self.sym(id));
                    a.time != b.time || a.seq != b.seq
                }
            };
            self.sym_mut(id).flags.moment_start = starts;
            cur = self.ts_next(id);
        }
    }

    /// Verify that every link is reciprocal and the time-order list is sorted.
    pub fn check_links(&self) -> Result<(), LayoutError> {
        let mut cur = self.ts_first;
        let mut last: Option<SymbolId> = None;
        let mut count = 0usize;
        while let Some(id) = cur {
            let s = self.get(id).ok_or_else(|| LayoutError::BrokenLink(id, "dangling id".into()))?;
            if s.ts_prev != last {
                return Err(LayoutError::BrokenLink(id, "ts_prev does not match".into()));
            }
            if let Some(l) = last {
                let p = self.sym(l);
                if (p.time, p.seq) > (s.time, s.seq) {
                    return Err(LayoutError::BrokenLink(id, "time order not sorted".into()));
                }
            }
            if s.staff >= self.staves.len() {
                return Err(LayoutError::UnknownStaff(s.staff));
            }
            if s.voice >= self.voices.len() {
                return Err(LayoutError::UnknownVoice(s.voice));
            }
            count += 1;
            if count > self.symbols.len() {
                return Err(LayoutError::BrokenLink(id, "cycle in time order".into()));
            }
            last = Some(id);
            cur = s.ts_next;
        }
        for voice in &self.voices {
            let mut cur = voice.first;
            let mut prev: Option<SymbolId> = None;
            let mut time = i32::MIN;
            while let Some(id) = cur {
                let s = self.get(id).ok_or_else(|| LayoutError::BrokenLink(id, "dangling id".into()))?;
                if s.prev != prev {
                    return Err(LayoutError::BrokenLink(id, "prev does not match".into()));
                }
                if s.time < time {
                    return Err(LayoutError::BrokenLink(id, "time decreases within voice".into()));
                }
                time = s.time;
                prev = Some(id);
                cur = s.next;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn note_shapes_follow_durations() {
        assert_eq!(note_shape(WHOLE), (HeadType::Whole, 0, -1));
        assert_eq!(note_shape(HALF + QUARTER), (HeadType::Half, 1, 0));
        assert_eq!(note_shape(QUARTER), (HeadType::Filled, 0, 0));
        assert_eq!(note_shape(EIGHTH), (HeadType::Filled, 0, 1));
        assert_eq!(note_shape(SIXTEENTH + SIXTEENTH / 2), (HeadType::Filled, 1, 2));
        assert_eq!(note_shape(BREVE), (HeadType::Breve, 0, -1));
    }

    #[test]
    fn clef_bottom_lines() {
        assert_eq!(Clef::treble().bottom_line_pitch(), diatonic('E', 4));
        assert_eq!(Clef::bass().bottom_line_pitch(), diatonic('G', 2));
        assert_eq!(Clef::alto().bottom_line_pitch(), diatonic('F', 3));
        let guitar = Clef { octave: -1, ..Clef::treble() };
        assert_eq!(guitar.bottom_line_pitch(), diatonic('E', 3));
    }

    #[test]
    fn key_cancellation() {
        let k = KeySig { sharps: -2, old_sharps: Some(3) };
        assert_eq!(k.naturals(), 3);
        assert!(k.switches_sign());
        let k = KeySig { sharps: 1, old_sharps: Some(3) };
        assert_eq!(k.naturals(), 2);
        assert!(!k.switches_sign());
        assert_eq!(KeySig::new(2).naturals(), 0);
    }

    #[test]
    fn time_order_merges_voices() {
        let mut tune = Tune::new();
        tune.staves.push(Staff::new(Clef::treble()));
        tune.voices.push(Voice::new("1", 0));
        tune.voices.push(Voice::new("2", 0));
        for (v, times) in [(0usize, [0, 384]), (1, [0, 192])] {
            for t in times {
                let mut s = Symbol::new(SymbolKind::Rest, v, 0);
                s.time = t;
                let id = tune.alloc(s);
                tune.append_to_voice(v, id).unwrap();
            }
        }
        tune.link_time_order();
        let times: Vec<(i32, usize)> = tune
            .ts_ids(tune.ts_first)
            .iter()
            .map(|&id| (tune.sym(id).time, tune.sym(id).voice))
            .collect();
        assert_eq!(times, vec![(0, 0), (0, 1), (192, 1), (384, 0)]);
        assert!(tune.check_links().is_ok());

        let ids = tune.ts_ids(tune.ts_first);
        assert!(tune.sym(ids[0]).flags.moment_start);
        assert!(!tune.sym(ids[1]).flags.moment_start);
        assert!(tune.sym(ids[2]).flags.moment_start);
    }

    #[test]
    fn unlink_and_reinsert_keeps_links_consistent() {
        let mut tune = Tune::new();
        tune.staves.push(Staff::new(Clef::treble()));
        tune.voices.push(Voice::new("1", 0));
        for t in [0, 384, 768] {
            let mut s = Symbol::new(SymbolKind::Rest, 0, 0);
            s.time = t;
            let id = tune.alloc(s);
            tune.append_to_voice(0, id).unwrap();
        }
        tune.link_time_order();
        let ids = tune.ts_ids(tune.ts_first);
        tune.unlink_ts(ids[0]);
        assert_eq!(tune.ts_first, Some(ids[1]));
        tune.insert_ts_before(ids[0], ids[1]);
        assert_eq!(tune.ts_first, Some(ids[0]));
        assert!(tune.check_links().is_ok());
    }
}
