//! Abstract drawing operations and the sink they are emitted to.
//!
//! Coordinates are absolute page points, y growing downwards from the top of
//! the current line.  The sink decides where each line goes on a page using
//! the height passed to [`DrawSink::begin_line`].

use serde::{Deserialize, Serialize};

use crate::model::{Accidental, BarType, ClefType, HeadType};

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Point {
    pub x: f64,
    pub y: f64,
}

impl Point {
    pub fn new(x: f64, y: f64) -> Self {
        Self { x, y }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CurveKind {
    Slur,
    Tie,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TextKind {
    Lyric,
    GuitarChord,
    MeasureNumber,
    Tuplet,
    Decoration,
    Title,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum DrawOp {
    /// Five staff lines; `y` is the bottom line
    StaffLines { x1: f64, x2: f64, y: f64, spacing: f64 },
    NoteHead { x: f64, y: f64, head: HeadType, grace: bool },
    Accidental { x: f64, y: f64, accidental: Accidental },
    Dot { x: f64, y: f64 },
    Stem { x: f64, y1: f64, y2: f64 },
    /// `count` flags on a stem ending at (x, y); `up` is the stem direction
    Flag { x: f64, y: f64, count: u8, up: bool, straight: bool },
    /// Acciaccatura stroke
    Slash { from: Point, to: Point },
    LedgerLine { x1: f64, x2: f64, y: f64 },
    Rest { x: f64, y: f64, duration: i32 },
    /// Bar line from `y_top` down to `y_bottom`
    Bar { x: f64, y_top: f64, y_bottom: f64, bar_type: BarType },
    Clef { x: f64, y: f64, clef: ClefType, small: bool },
    KeySignature { x: f64, y: f64, accidentals: Vec<(f64, f64, Accidental)> },
    TimeSignature { x: f64, y: f64, top: u32, bottom: u32 },
    /// One beam segment as a parallelogram of the given vertical depth
    Beam { from: Point, to: Point, depth: f64 },
    Curve { points: [Point; 4], kind: CurveKind, dotted: bool },
    Line { from: Point, to: Point, width: f64 },
    Text { x: f64, y: f64, text: String, kind: TextKind, size: f64 },
    Hyphen { x1: f64, x2: f64, y: f64 },
    Brace { x: f64, y_top: f64, y_bottom: f64 },
    Bracket { x: f64, y_top: f64, y_bottom: f64 },
}

/// Receiver of the layout output.
pub trait DrawSink {
    /// A new output line of the given height (points) starts.
    fn begin_line(&mut self, line: usize, height: f64);
    fn draw(&mut self, op: DrawOp);
    fn end_line(&mut self);
}

/// One output line as collected by [`DrawList`].
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DrawnLine {
    pub index: usize,
    pub height: f64,
    pub ops: Vec<DrawOp>,
}

/// Sink that keeps every operation in memory.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DrawList {
    pub lines: Vec<DrawnLine>,
}

impl DrawList {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn ops(&self) -> impl Iterator<Item = &DrawOp> {
        self.lines.iter().flat_map(|l| l.ops.iter())
    }

    pub fn count(&self, pred: impl Fn(&DrawOp) -> bool) -> usize {
        self.ops().filter(|op| pred(op)).count()
    }
}

impl DrawSink for DrawList {
    fn begin_line(&mut self, line: usize, height: f64) {
        self.lines.push(DrawnLine { index: line, height, ops: Vec::new() });
    }

    fn draw(&mut self, op: DrawOp) {
        if self.lines.is_empty() {
            self.lines.push(DrawnLine::default());
        }
        if let Some(line) = self.lines.last_mut() {
            line.ops.push(op);
        }
    }

    fn end_line(&mut self) {}
}

/// Sink discarding everything; used when only the layout result matters.
#[derive(Debug, Clone, Copy, Default)]
pub struct NullSink;

impl DrawSink for NullSink {
    fn begin_line(&mut self, _line: usize, _height: f64) {}
    fn draw(&mut self, _op: DrawOp) {}
    fn end_line(&mut self) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn draw_list_groups_ops_by_line() {
        let mut list = DrawList::new();
        list.begin_line(0, 80.0);
        list.draw(DrawOp::Dot { x: 1.0, y: 2.0 });
        list.end_line();
        list.begin_line(1, 60.0);
        list.draw(DrawOp::Stem { x: 1.0, y1: 0.0, y2: 10.0 });
        list.draw(DrawOp::Dot { x: 3.0, y: 2.0 });
        list.end_line();
        assert_eq!(list.lines.len(), 2);
        assert_eq!(list.lines[1].ops.len(), 2);
        assert_eq!(list.count(|op| matches!(op, DrawOp::Dot { .. })), 2);
    }
}
