//! Symbol linker: builds a [`Tune`] voice by voice and links it for layout.
//!
//! Each voice keeps a time cursor; appended symbols get the cursor as their
//! start time and advance it by their duration.  [`TuneBuilder::finish`]
//! then sets beam words, checks measure lengths against the meter and merges
//! all voices into the time-order list.

use crate::error::{DiagnosticKind, Diagnostics, LayoutError};
use crate::model::*;

struct VoiceCursor {
    time: i32,
    /// Key in force, for cancellation naturals on key changes
    key: KeySig,
    tuplet: Option<OpenTuplet>,
}

struct OpenTuplet {
    p: u32,
    q: u32,
    r: u32,
    /// notes still to come
    left: u32,
    group: SymbolId,
}

pub struct TuneBuilder {
    tune: Tune,
    cursors: Vec<VoiceCursor>,
    diagnostics: Diagnostics,
}

impl Default for TuneBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl TuneBuilder {
    pub fn new() -> Self {
        Self {
            tune: Tune::new(),
            cursors: Vec::new(),
            diagnostics: Diagnostics::new(0),
        }
    }

    pub fn title(&mut self, title: impl Into<String>) -> &mut Self {
        self.tune.title = Some(title.into());
        self
    }

    // ── Staves and voices ───────────────────────────────────────────

    pub fn add_staff(&mut self, clef: Clef) -> usize {
        self.tune.staves.push(Staff::new(clef));
        self.tune.staves.len() - 1
    }

    /// Group `count` staves starting at `first` with a brace or bracket.
    pub fn group_staves(&mut self, first: usize, count: usize, group: StaffGroup) -> Result<(), LayoutError> {
        if first + count > self.tune.staves.len() || count == 0 {
            return Err(LayoutError::UnknownStaff(first + count.saturating_sub(1)));
        }
        self.tune.staves[first].group = Some((group, count));
        Ok(())
    }

    pub fn add_voice(&mut self, name: impl Into<String>, staff: usize) -> Result<usize, LayoutError> {
        let clef = self.tune.staves.get(staff).ok_or(LayoutError::UnknownStaff(staff))?.clef;
        let mut voice = Voice::new(name, staff);
        voice.clef = clef;
        self.tune.voices.push(voice);
        self.cursors.push(VoiceCursor {
            time: 0,
            key: KeySig::default(),
            tuplet: None,
        });
        Ok(self.tune.voices.len() - 1)
    }

    fn voice_mut(&mut self, voice: usize) -> Result<&mut Voice, LayoutError> {
        self.tune.voices.get_mut(voice).ok_or(LayoutError::UnknownVoice(voice))
    }

    /// Clef in force at the start of the voice.
    pub fn initial_clef(&mut self, voice: usize, clef: Clef) -> Result<(), LayoutError> {
        self.voice_mut(voice)?.clef = clef;
        Ok(())
    }

    pub fn initial_key(&mut self, voice: usize, key: KeySig) -> Result<(), LayoutError> {
        self.voice_mut(voice)?.key = key;
        self.cursors[voice].key = key;
        Ok(())
    }

    pub fn initial_meter(&mut self, voice: usize, meter: Meter) -> Result<(), LayoutError> {
        self.voice_mut(voice)?.meter = meter;
        Ok(())
    }

    pub fn stem_policy(&mut self, voice: usize, policy: StemPolicy) -> Result<(), LayoutError> {
        self.voice_mut(voice)?.stem_policy = policy;
        Ok(())
    }

    // ── Symbols ─────────────────────────────────────────────────────

    fn push(&mut self, voice: usize, kind: SymbolKind, duration: i32) -> Result<SymbolId, LayoutError> {
        let staff = self.tune.voices.get(voice).ok_or(LayoutError::UnknownVoice(voice))?.staff;
        let mut symbol = Symbol::new(kind, voice, staff);
        symbol.time = self.cursors[voice].time;
        symbol.duration = duration;
        let id = self.tune.alloc(symbol);
        self.tune.append_to_voice(voice, id)?;
        self.cursors[voice].time += duration;
        Ok(id)
    }

    /// Apply the open tuplet, if any, to a note or rest of notated length
    /// `notated`; returns the played duration.
    fn tuplet_duration(&mut self, voice: usize, notated: i32) -> (i32, Option<(bool, bool)>) {
        let cursor = &mut self.cursors[voice];
        match cursor.tuplet.as_mut() {
            Some(t) if t.left > 0 => {
                let first = t.left == t.r;
                let last = t.left == 1;
                let played = notated * t.q as i32 / t.p as i32;
                t.left -= 1;
                if last {
                    cursor.tuplet = None;
                }
                (played, Some((first, last)))
            }
            _ => (notated, None),
        }
    }

    fn shape(&mut self, id: SymbolId, notated: i32, tuplet: Option<(bool, bool)>) {
        let (head, dots, nflags) = note_shape(notated);
        let s = self.tune.sym_mut(id);
        s.head = head;
        s.dots = dots;
        s.nflags = nflags;
        s.flags.stemless = nflags < 0;
        if let Some((first, last)) = tuplet {
            s.flags.in_tuplet = true;
            s.flags.tuplet_start = first;
            s.flags.tuplet_end = last;
        }
    }

    /// Append a note or chord of notated length `duration`.
    pub fn note(&mut self, voice: usize, heads: Vec<NoteHead>, duration: i32) -> Result<SymbolId, LayoutError> {
        let mut heads = heads;
        heads.sort_by_key(|h| h.pitch);
        let (played, tuplet) = self.tuplet_duration_checked(voice, duration)?;
        let id = self.push(voice, SymbolKind::Note(NoteData { heads }), played)?;
        self.shape(id, duration, tuplet);
        Ok(id)
    }

    pub fn rest(&mut self, voice: usize, duration: i32) -> Result<SymbolId, LayoutError> {
        let (played, tuplet) = self.tuplet_duration_checked(voice, duration)?;
        let id = self.push(voice, SymbolKind::Rest, played)?;
        self.shape(id, duration, tuplet);
        self.tune.sym_mut(id).flags.stemless = true;
        Ok(id)
    }

    fn tuplet_duration_checked(&mut self, voice: usize, duration: i32) -> Result<(i32, Option<(bool, bool)>), LayoutError> {
        if voice >= self.tune.voices.len() {
            return Err(LayoutError::UnknownVoice(voice));
        }
        Ok(self.tuplet_duration(voice, duration))
    }

    pub fn bar(&mut self, voice: usize, bar_type: BarType) -> Result<SymbolId, LayoutError> {
        self.bar_with_text(voice, bar_type, None)
    }

    /// A bar starting a repeat ending with the given text.
    pub fn bar_with_text(&mut self, voice: usize, bar_type: BarType, text: Option<&str>) -> Result<SymbolId, LayoutError> {
        self.close_tuplet(voice);
        let data = BarData {
            bar_type,
            text: text.map(str::to_string),
            wrong_duration: false,
        };
        self.push(voice, SymbolKind::Bar(data), 0)
    }

    pub fn clef(&mut self, voice: usize, clef: Clef) -> Result<SymbolId, LayoutError> {
        self.push(voice, SymbolKind::Clef(clef), 0)
    }

    pub fn key(&mut self, voice: usize, sharps: i32) -> Result<SymbolId, LayoutError> {
        let old = self.cursors.get(voice).ok_or(LayoutError::UnknownVoice(voice))?.key.sharps;
        let key = KeySig { sharps, old_sharps: Some(old) };
        self.cursors[voice].key = key;
        self.push(voice, SymbolKind::KeySig(key), 0)
    }

    pub fn meter(&mut self, voice: usize, meter: Meter) -> Result<SymbolId, LayoutError> {
        self.push(voice, SymbolKind::TimeSig(meter), 0)
    }

    /// Open a tuplet: the next `r` notes or rests play `p` in the time of `q`.
    pub fn tuplet(&mut self, voice: usize, p: u32, q: u32, r: u32) -> Result<SymbolId, LayoutError> {
        self.close_tuplet(voice);
        let id = self.push(voice, SymbolKind::Tuplet(TupletData { p, q, r }), 0)?;
        if p > 0 && q > 0 && r > 0 {
            self.cursors[voice].tuplet = Some(OpenTuplet { p, q, r, left: r, group: id });
        }
        Ok(id)
    }

    fn close_tuplet(&mut self, voice: usize) {
        if let Some(cursor) = self.cursors.get_mut(voice) {
            if let Some(t) = cursor.tuplet.take() {
                self.diagnostics.warning(
                    DiagnosticKind::IncompleteTuplet,
                    Some(t.group),
                    format!("tuplet is missing {} note(s)", t.left),
                );
                self.drop_tuplet_marks(t.group);
            }
        }
    }

    /// Incomplete tuplets are not drawn: clear the membership flags.
    fn drop_tuplet_marks(&mut self, group: SymbolId) {
        for id in self.tune.voice_ids(self.tune.sym(group).next) {
            let s = self.tune.sym_mut(id);
            if !s.flags.in_tuplet {
                break;
            }
            s.flags.in_tuplet = false;
            s.flags.tuplet_start = false;
            s.flags.tuplet_end = false;
        }
        if let SymbolKind::Tuplet(t) = &mut self.tune.sym_mut(group).kind {
            t.r = 0;
        }
    }

    /// Grace notes before the next main note.  Each entry is a chord and its
    /// notated length.
    pub fn grace(&mut self, voice: usize, notes: Vec<(Vec<NoteHead>, i32)>, data: GraceData) -> Result<SymbolId, LayoutError> {
        let group = self.push(voice, SymbolKind::Grace(data), 0)?;
        let (time, staff) = {
            let g = self.tune.sym(group);
            (g.time, g.staff)
        };
        let mut prev: Option<SymbolId> = None;
        for (mut heads, duration) in notes {
            heads.sort_by_key(|h| h.pitch);
            let mut s = Symbol::new(SymbolKind::Note(NoteData { heads }), voice, staff);
            s.time = time;
            s.flags.grace = true;
            s.parent = Some(group);
            let (head, dots, nflags) = note_shape(duration);
            s.head = head;
            s.dots = dots;
            s.nflags = nflags.max(0);
            s.prev = prev;
            let id = self.tune.alloc(s);
            match prev {
                Some(p) => self.tune.sym_mut(p).next = Some(id),
                None => self.tune.sym_mut(group).extra = Some(id),
            }
            prev = Some(id);
        }
        let graces = self.tune.grace_notes(group);
        if let (Some(&first), Some(&last)) = (graces.first(), graces.last()) {
            self.tune.sym_mut(first).flags.word_start = true;
            self.tune.sym_mut(last).flags.word_end = true;
        }
        Ok(group)
    }

    pub fn staff_break(&mut self, voice: usize, width: f64) -> Result<SymbolId, LayoutError> {
        self.push(voice, SymbolKind::StaffBreak(width), 0)
    }

    pub fn format(&mut self, voice: usize, name: &str, value: &str) -> Result<SymbolId, LayoutError> {
        let change = FormatChange {
            name: name.to_string(),
            value: value.to_string(),
        };
        self.push(voice, SymbolKind::FormatChange(change), 0)
    }

    /// Mark the end of a source line after the last symbol of `voice`.
    pub fn eoln(&mut self, voice: usize) -> Result<(), LayoutError> {
        let last = self.tune.voices.get(voice).ok_or(LayoutError::UnknownVoice(voice))?.last;
        if let Some(id) = last {
            self.tune.sym_mut(id).flags.eoln = true;
        }
        Ok(())
    }

    // ── Annotations ─────────────────────────────────────────────────

    fn checked(&mut self, id: SymbolId) -> Result<&mut Symbol, LayoutError> {
        self.tune
            .symbols
            .get_mut(id.0)
            .ok_or_else(|| LayoutError::BrokenLink(id, "no such symbol".into()))
    }

    /// Tie the head of the given pitch to the next note.
    pub fn tie(&mut self, id: SymbolId, pitch: i32) -> Result<(), LayoutError> {
        let s = self.checked(id)?;
        if let Some(heads) = s.heads_mut() {
            for h in heads.iter_mut().filter(|h| h.pitch == pitch) {
                h.tie = true;
            }
        }
        Ok(())
    }

    /// Tie every head of a note or chord.
    pub fn tie_all(&mut self, id: SymbolId) -> Result<(), LayoutError> {
        let s = self.checked(id)?;
        if let Some(heads) = s.heads_mut() {
            for h in heads.iter_mut() {
                h.tie = true;
            }
        }
        Ok(())
    }

    pub fn slur_start(&mut self, id: SymbolId, placement: SlurPlacement) -> Result<(), LayoutError> {
        self.checked(id)?.slur_starts.push(placement);
        Ok(())
    }

    pub fn slur_end(&mut self, id: SymbolId) -> Result<(), LayoutError> {
        self.checked(id)?.slur_ends += 1;
        Ok(())
    }

    pub fn lyric(&mut self, id: SymbolId, verse: usize, lyric: Lyric) -> Result<(), LayoutError> {
        let s = self.checked(id)?;
        if s.lyrics.len() <= verse {
            s.lyrics.resize(verse + 1, None);
        }
        s.lyrics[verse] = Some(lyric);
        Ok(())
    }

    pub fn gchord(&mut self, id: SymbolId, text: &str) -> Result<(), LayoutError> {
        self.checked(id)?.gchord = Some(text.to_string());
        Ok(())
    }

    pub fn decorate(&mut self, id: SymbolId, decoration: Decoration) -> Result<(), LayoutError> {
        self.checked(id)?.decorations.push(decoration);
        Ok(())
    }

    /// No beam joins `id` to the note before it.
    pub fn beam_split(&mut self, id: SymbolId) -> Result<(), LayoutError> {
        self.checked(id)?.flags.beam_split = true;
        Ok(())
    }

    /// Secondary beams break before `id`; `level2` keeps the second beam.
    pub fn beam_break(&mut self, id: SymbolId, level2: bool) -> Result<(), LayoutError> {
        let s = self.checked(id)?;
        if level2 {
            s.flags.beam_break2 = true;
        } else {
            s.flags.beam_break = true;
        }
        Ok(())
    }

    pub fn stem(&mut self, id: SymbolId, up: bool) -> Result<(), LayoutError> {
        let s = self.checked(id)?;
        s.stem = if up { 1 } else { -1 };
        s.flags.stem_fixed = true;
        Ok(())
    }

    /// Draw a note on another staff than its voice's.
    pub fn cross_staff(&mut self, id: SymbolId, staff: usize) -> Result<(), LayoutError> {
        if staff >= self.tune.staves.len() {
            return Err(LayoutError::UnknownStaff(staff));
        }
        self.checked(id)?.staff = staff;
        Ok(())
    }

    pub fn invisible(&mut self, id: SymbolId) -> Result<(), LayoutError> {
        self.checked(id)?.flags.invisible = true;
        Ok(())
    }

    /// Direct access to a symbol being built.
    pub fn symbol_mut(&mut self, id: SymbolId) -> Result<&mut Symbol, LayoutError> {
        self.checked(id)
    }

    // ── Linking ─────────────────────────────────────────────────────

    pub fn finish(mut self) -> Result<Tune, LayoutError> {
        for v in 0..self.tune.voices.len() {
            self.close_tuplet(v);
            set_words(&mut self.tune, v);
            check_measures(&mut self.tune, v, &mut self.diagnostics);
        }
        self.tune.link_time_order();
        self.tune.check_links()?;
        let mut diagnostics = std::mem::take(&mut self.diagnostics);
        self.tune.diagnostics.append(&mut diagnostics);
        log::trace!(
            "linked tune: {} symbols, {} voices, {} staves",
            self.tune.symbols.len(),
            self.tune.voices.len(),
            self.tune.staves.len()
        );
        Ok(self.tune)
    }
}

/// Set `word_start`/`word_end` on the notes of one voice.
///
/// A word is a run of flagged notes; rests may sit inside a word but never
/// start or end one.  Bars and other non-note symbols close the word.
/// Notes that cannot be beamed form one-note words.
fn set_words(tune: &mut Tune, voice: usize) {
    let ids = tune.voice_ids(tune.voices[voice].first);
    let mut current: Vec<SymbolId> = Vec::new();

    fn close(tune: &mut Tune, word: &mut Vec<SymbolId>) {
        let notes: Vec<SymbolId> = word.iter().copied().filter(|&id| tune.sym(id).is_note()).collect();
        if let (Some(&first), Some(&last)) = (notes.first(), notes.last()) {
            tune.sym_mut(first).flags.word_start = true;
            tune.sym_mut(last).flags.word_end = true;
        }
        word.clear();
    }

    for id in ids {
        let s = tune.sym(id);
        match &s.kind {
            SymbolKind::Note(_) => {
                if !s.beamable() {
                    close(tune, &mut current);
                    let s = tune.sym_mut(id);
                    s.flags.word_start = true;
                    s.flags.word_end = true;
                    continue;
                }
                if s.flags.beam_split {
                    close(tune, &mut current);
                }
                current.push(id);
            }
            SymbolKind::Rest => {
                if s.flags.beam_split || current.is_empty() {
                    close(tune, &mut current);
                } else {
                    current.push(id);
                }
            }
            SymbolKind::Grace(_) | SymbolKind::Tuplet(_) | SymbolKind::FormatChange(_) => {}
            _ => close(tune, &mut current),
        }
    }
    // trailing rests are outside the word
    close(tune, &mut current);
}

/// Compare each measure with the meter in force.
///
/// An overlong measure is reported and its closing bar marked so the glue
/// pass never cuts there.  Short measures and the pickup are accepted.
fn check_measures(tune: &mut Tune, voice: usize, diagnostics: &mut Diagnostics) {
    let mut meter = tune.voices[voice].meter;
    let mut start = 0;
    for id in tune.voice_ids(tune.voices[voice].first) {
        let (time, kind_is_bar) = {
            let s = tune.sym(id);
            if let SymbolKind::TimeSig(m) = s.kind {
                meter = m;
            }
            (s.time, s.is_bar())
        };
        if !kind_is_bar {
            continue;
        }
        let length = meter.measure_length();
        let used = time - start;
        if length > 0 && used > length {
            diagnostics.error(
                DiagnosticKind::WrongDuration,
                Some(id),
                format!("voice {}: measure holds {} ticks, meter allows {}", voice, used, length),
            );
            if let SymbolKind::Bar(b) = &mut tune.sym_mut(id).kind {
                b.wrong_duration = true;
            }
        }
        start = time;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn c4() -> Vec<NoteHead> {
        vec![NoteHead::new(diatonic('C', 4))]
    }

    #[test]
    fn times_follow_durations() {
        let mut b = TuneBuilder::new();
        let staff = b.add_staff(Clef::treble());
        let v = b.add_voice("1", staff).unwrap();
        let a = b.note(v, c4(), QUARTER).unwrap();
        let r = b.rest(v, HALF).unwrap();
        let bar = b.bar(v, BarType::Single).unwrap();
        let tune = b.finish().unwrap();
        assert_eq!(tune.sym(a).time, 0);
        assert_eq!(tune.sym(r).time, QUARTER);
        assert_eq!(tune.sym(bar).time, QUARTER + HALF);
        assert!(tune.check_links().is_ok());
    }

    #[test]
    fn eighths_form_words_broken_by_bars() {
        let mut b = TuneBuilder::new();
        let staff = b.add_staff(Clef::treble());
        let v = b.add_voice("1", staff).unwrap();
        let n: Vec<SymbolId> = (0..3).map(|_| b.note(v, c4(), EIGHTH).unwrap()).collect();
        b.bar(v, BarType::Single).unwrap();
        let after = b.note(v, c4(), EIGHTH).unwrap();
        let q = b.note(v, c4(), QUARTER).unwrap();
        let tune = b.finish().unwrap();
        assert!(tune.sym(n[0]).flags.word_start);
        assert!(!tune.sym(n[1]).flags.word_start && !tune.sym(n[1]).flags.word_end);
        assert!(tune.sym(n[2]).flags.word_end);
        assert!(tune.sym(after).flags.word_start && tune.sym(after).flags.word_end);
        assert!(tune.sym(q).flags.word_start && tune.sym(q).flags.word_end);
    }

    #[test]
    fn rests_stay_inside_words_but_not_at_edges() {
        let mut b = TuneBuilder::new();
        let staff = b.add_staff(Clef::treble());
        let v = b.add_voice("1", staff).unwrap();
        let a = b.note(v, c4(), EIGHTH).unwrap();
        let r = b.rest(v, EIGHTH).unwrap();
        let c = b.note(v, c4(), EIGHTH).unwrap();
        b.rest(v, EIGHTH).unwrap();
        let tune = b.finish().unwrap();
        assert!(tune.sym(a).flags.word_start);
        assert!(!tune.sym(r).flags.word_end);
        assert!(tune.sym(c).flags.word_end);
    }

    #[test]
    fn triplets_scale_durations() {
        let mut b = TuneBuilder::new();
        let staff = b.add_staff(Clef::treble());
        let v = b.add_voice("1", staff).unwrap();
        b.tuplet(v, 3, 2, 3).unwrap();
        let n: Vec<SymbolId> = (0..3).map(|_| b.note(v, c4(), EIGHTH).unwrap()).collect();
        let after = b.note(v, c4(), QUARTER).unwrap();
        let tune = b.finish().unwrap();
        assert_eq!(tune.sym(n[0]).duration, 128);
        assert_eq!(tune.sym(after).time, QUARTER);
        assert!(tune.sym(n[0]).flags.tuplet_start);
        assert!(tune.sym(n[2]).flags.tuplet_end);
        assert_eq!(tune.sym(n[0]).nflags, 1);
        assert!(!tune.sym(after).flags.in_tuplet);
    }

    #[test]
    fn incomplete_tuplet_is_reported() {
        let mut b = TuneBuilder::new();
        let staff = b.add_staff(Clef::treble());
        let v = b.add_voice("1", staff).unwrap();
        b.tuplet(v, 3, 2, 3).unwrap();
        let n = b.note(v, c4(), EIGHTH).unwrap();
        b.bar(v, BarType::Single).unwrap();
        let tune = b.finish().unwrap();
        assert_eq!(tune.diagnostics.count(DiagnosticKind::IncompleteTuplet), 1);
        assert!(!tune.sym(n).flags.in_tuplet);
    }

    #[test]
    fn overlong_measure_marks_bar() {
        let mut b = TuneBuilder::new();
        let staff = b.add_staff(Clef::treble());
        let v = b.add_voice("1", staff).unwrap();
        b.initial_meter(v, Meter::new(2, 4)).unwrap();
        for _ in 0..3 {
            b.note(v, c4(), QUARTER).unwrap();
        }
        let bar = b.bar(v, BarType::Single).unwrap();
        let tune = b.finish().unwrap();
        assert_eq!(tune.diagnostics.count(DiagnosticKind::WrongDuration), 1);
        assert!(tune.sym(bar).bar().map_or(false, |b| b.wrong_duration));
    }

    #[test]
    fn grace_notes_hang_off_the_group() {
        let mut b = TuneBuilder::new();
        let staff = b.add_staff(Clef::treble());
        let v = b.add_voice("1", staff).unwrap();
        let g = b
            .grace(v, vec![(c4(), SIXTEENTH), (c4(), SIXTEENTH)], GraceData::default())
            .unwrap();
        let main = b.note(v, c4(), QUARTER).unwrap();
        let tune = b.finish().unwrap();
        let graces = tune.grace_notes(g);
        assert_eq!(graces.len(), 2);
        assert!(graces.iter().all(|&id| tune.sym(id).flags.grace));
        // grace notes are not in the time-order list
        let ts = tune.ts_ids(tune.ts_first);
        assert_eq!(ts, vec![g, main]);
    }

    #[test]
    fn key_changes_remember_the_old_key() {
        let mut b = TuneBuilder::new();
        let staff = b.add_staff(Clef::treble());
        let v = b.add_voice("1", staff).unwrap();
        b.initial_key(v, KeySig::new(3)).unwrap();
        let k = b.key(v, -1).unwrap();
        let tune = b.finish().unwrap();
        match tune.sym(k).kind {
            SymbolKind::KeySig(key) => assert_eq!(key.old_sharps, Some(3)),
            _ => panic!("expected a key signature"),
        }
    }
}
