//! SVG preview sink — turns drawing operations into a standalone SVG document.
//!
//! Lines are stacked from the top margin downwards; a new page is not started,
//! the document simply grows.  Glyphs are drawn with Unicode music symbols and
//! simple shapes, which is enough to inspect a layout.

use crate::config::LayoutConfig;
use crate::draw::{CurveKind, DrawOp, DrawSink, Point, TextKind};
use crate::model::{Accidental, BarType, ClefType, HeadType, HALF, QUARTER, WHOLE};

// ── Colors ──────────────────────────────────────────────────────────
const NOTE_COLOR: &str = "#1a1a1a";
const STAFF_COLOR: &str = "#555555";
const BARLINE_COLOR: &str = "#333333";
const CHORD_COLOR: &str = "#4a4a9a";

const STAFF_LINE_WIDTH: f64 = 0.6;
const STEM_WIDTH: f64 = 0.8;
const BARLINE_WIDTH: f64 = 0.8;

// ═══════════════════════════════════════════════════════════════════════
// SvgSink
// ═══════════════════════════════════════════════════════════════════════

pub struct SvgSink {
    elements: Vec<String>,
    width: f64,
    /// Page y of the top of the current line
    line_top: f64,
    line_height: f64,
    gap: f64,
}

impl SvgSink {
    pub fn new(config: &LayoutConfig) -> Self {
        Self {
            elements: Vec::new(),
            width: config.page_width,
            line_top: config.top_margin,
            line_height: 0.0,
            gap: 0.0,
        }
    }

    /// Document height so far.
    pub fn height(&self) -> f64 {
        self.line_top + self.line_height + 20.0
    }

    pub fn build(self) -> String {
        let height = self.height();
        let mut svg = format!(
            r#"<svg xmlns="http://www.w3.org/2000/svg" viewBox="0 0 {:.0} {:.0}" width="{:.0}" height="{:.0}" style="font-family: 'Georgia', 'Times New Roman', serif;">"#,
            self.width, height, self.width, height
        );
        svg.push('\n');
        for el in &self.elements {
            svg.push_str("  ");
            svg.push_str(el);
            svg.push('\n');
        }
        svg.push_str("</svg>\n");
        svg
    }

    fn y(&self, y: f64) -> f64 {
        self.line_top + y
    }

    fn line(&mut self, x1: f64, y1: f64, x2: f64, y2: f64, color: &str, width: f64) {
        let (y1, y2) = (self.y(y1), self.y(y2));
        self.elements.push(format!(
            r#"<line x1="{:.1}" y1="{:.1}" x2="{:.1}" y2="{:.1}" stroke="{}" stroke-width="{:.1}"/>"#,
            x1, y1, x2, y2, color, width
        ));
    }

    fn glyph(&mut self, x: f64, y: f64, glyph: &str, size: f64) {
        let y = self.y(y);
        self.elements.push(format!(
            r#"<text x="{:.1}" y="{:.1}" font-size="{:.1}" fill="{}" text-anchor="middle">{}</text>"#,
            x, y, size, NOTE_COLOR, glyph
        ));
    }

    fn text(&mut self, x: f64, y: f64, content: &str, size: f64, fill: &str, anchor: &str) {
        let y = self.y(y);
        let escaped = content
            .replace('&', "&amp;")
            .replace('<', "&lt;")
            .replace('>', "&gt;");
        self.elements.push(format!(
            r#"<text x="{:.1}" y="{:.1}" font-size="{:.0}" fill="{}" text-anchor="{}">{}</text>"#,
            x, y, size, fill, anchor, escaped
        ));
    }

    fn notehead(&mut self, cx: f64, cy: f64, head: HeadType, grace: bool) {
        let cy = self.y(cy);
        let k = if grace { 0.6 } else { 1.0 };
        let (rx, ry) = (3.6 * k, 2.6 * k);
        if head == HeadType::Filled {
            self.elements.push(format!(
                r#"<ellipse cx="{:.1}" cy="{:.1}" rx="{:.1}" ry="{:.1}" fill="{}" transform="rotate(-20,{:.1},{:.1})"/>"#,
                cx, cy, rx, ry, NOTE_COLOR, cx, cy
            ));
        } else {
            let rx = if head == HeadType::Half { rx } else { rx * 1.2 };
            self.elements.push(format!(
                r#"<ellipse cx="{:.1}" cy="{:.1}" rx="{:.1}" ry="{:.1}" fill="none" stroke="{}" stroke-width="1.1"/>"#,
                cx, cy, rx - 0.5, ry - 0.5, NOTE_COLOR
            ));
            if head == HeadType::Breve {
                self.line(cx - rx - 1.5, cy - self.line_top - ry, cx - rx - 1.5, cy - self.line_top + ry, NOTE_COLOR, 0.8);
                self.line(cx + rx + 1.5, cy - self.line_top - ry, cx + rx + 1.5, cy - self.line_top + ry, NOTE_COLOR, 0.8);
            }
        }
    }

    fn beam(&mut self, from: Point, to: Point, depth: f64) {
        let path = format!(
            "M{:.1},{:.1} L{:.1},{:.1} L{:.1},{:.1} L{:.1},{:.1} Z",
            from.x,
            self.y(from.y),
            to.x,
            self.y(to.y),
            to.x,
            self.y(to.y + depth),
            from.x,
            self.y(from.y + depth),
        );
        self.elements.push(format!(r#"<path d="{}" fill="{}"/>"#, path, NOTE_COLOR));
    }

    fn curve(&mut self, p: &[Point; 4], kind: CurveKind, dotted: bool) {
        let dash = if dotted { r#" stroke-dasharray="1,2""# } else { "" };
        let width = if kind == CurveKind::Tie { 1.0 } else { 1.2 };
        self.elements.push(format!(
            r#"<path d="M{:.1},{:.1} C{:.1},{:.1} {:.1},{:.1} {:.1},{:.1}" fill="none" stroke="{}" stroke-width="{:.1}"{}/>"#,
            p[0].x,
            self.y(p[0].y),
            p[1].x,
            self.y(p[1].y),
            p[2].x,
            self.y(p[2].y),
            p[3].x,
            self.y(p[3].y),
            NOTE_COLOR,
            width,
            dash
        ));
    }

    fn bar(&mut self, x: f64, y_top: f64, y_bottom: f64, bar_type: BarType) {
        let thin = |s: &mut Self, x: f64| s.line(x, y_top, x, y_bottom, BARLINE_COLOR, BARLINE_WIDTH);
        let thick = |s: &mut Self, x: f64| s.line(x, y_top, x, y_bottom, BARLINE_COLOR, 3.0);
        let dots = |s: &mut Self, x: f64| {
            let mid = (y_top + y_bottom) / 2.0;
            for dy in [-3.0, 3.0] {
                let cy = s.y(mid + dy);
                s.elements.push(format!(r#"<circle cx="{:.1}" cy="{:.1}" r="1.2" fill="{}"/>"#, x, cy, NOTE_COLOR));
            }
        };
        match bar_type {
            BarType::Single => thin(self, x),
            BarType::Double => {
                thin(self, x - 3.0);
                thin(self, x);
            }
            BarType::ThinThick => {
                thin(self, x - 4.5);
                thick(self, x);
            }
            BarType::ThickThin => {
                thick(self, x - 4.5);
                thin(self, x);
            }
            BarType::LeftRepeat => {
                thick(self, x - 6.0);
                thin(self, x - 2.0);
                dots(self, x + 2.0);
            }
            BarType::RightRepeat => {
                dots(self, x - 8.0);
                thin(self, x - 4.0);
                thick(self, x);
            }
            BarType::DoubleRepeat => {
                dots(self, x - 7.0);
                thin(self, x - 3.0);
                thin(self, x);
                dots(self, x + 4.0);
            }
            BarType::Dotted => {
                let (y1, y2) = (self.y(y_top), self.y(y_bottom));
                self.elements.push(format!(
                    r#"<line x1="{:.1}" y1="{:.1}" x2="{:.1}" y2="{:.1}" stroke="{}" stroke-width="{:.1}" stroke-dasharray="2,2"/>"#,
                    x, y1, x, y2, BARLINE_COLOR, BARLINE_WIDTH
                ));
            }
            BarType::Invisible => {}
        }
    }
}

fn accidental_glyph(acc: Accidental) -> &'static str {
    match acc {
        Accidental::Sharp => "\u{266F}",
        Accidental::Flat => "\u{266D}",
        Accidental::Natural => "\u{266E}",
        Accidental::DoubleSharp => "\u{1D12A}",
        Accidental::DoubleFlat => "\u{1D12B}",
    }
}

fn rest_glyph(duration: i32) -> &'static str {
    if duration >= 2 * WHOLE {
        "\u{1D13A}"
    } else if duration >= WHOLE {
        "\u{1D13B}"
    } else if duration >= HALF {
        "\u{1D13C}"
    } else if duration >= QUARTER {
        "\u{1D13D}"
    } else if duration >= QUARTER / 2 {
        "\u{1D13E}"
    } else {
        "\u{1D13F}"
    }
}

fn clef_glyph(clef: ClefType) -> &'static str {
    match clef {
        ClefType::Treble => "\u{1D11E}",
        ClefType::Bass => "\u{1D122}",
        ClefType::Alto | ClefType::Tenor => "\u{1D121}",
        ClefType::Percussion => "\u{1D125}",
    }
}

impl DrawSink for SvgSink {
    fn begin_line(&mut self, line: usize, height: f64) {
        if line > 0 {
            self.line_top += self.line_height + self.gap;
        }
        self.line_height = height;
        self.gap = 10.0;
    }

    fn draw(&mut self, op: DrawOp) {
        match op {
            DrawOp::StaffLines { x1, x2, y, spacing } => {
                for i in 0..5 {
                    let ly = y - i as f64 * spacing;
                    self.line(x1, ly, x2, ly, STAFF_COLOR, STAFF_LINE_WIDTH);
                }
            }
            DrawOp::NoteHead { x, y, head, grace } => self.notehead(x, y, head, grace),
            DrawOp::Accidental { x, y, accidental } => self.glyph(x, y + 3.0, accidental_glyph(accidental), 11.0),
            DrawOp::Dot { x, y } => {
                let cy = self.y(y);
                self.elements.push(format!(r#"<circle cx="{:.1}" cy="{:.1}" r="1.1" fill="{}"/>"#, x, cy, NOTE_COLOR));
            }
            DrawOp::Stem { x, y1, y2 } => self.line(x, y1, x, y2, NOTE_COLOR, STEM_WIDTH),
            DrawOp::Flag { x, y, count, up, straight } => {
                let dir = if up { 1.0 } else { -1.0 };
                for i in 0..count {
                    let fy = y + dir * i as f64 * 4.0;
                    if straight {
                        self.line(x, fy, x + 6.0, fy + dir * 4.0, NOTE_COLOR, 1.6);
                    } else {
                        let (y0, y1) = (self.y(fy), self.y(fy + dir * 9.0));
                        self.elements.push(format!(
                            r#"<path d="M{:.1},{:.1} C{:.1},{:.1} {:.1},{:.1} {:.1},{:.1}" fill="none" stroke="{}" stroke-width="1.3"/>"#,
                            x, y0, x + 2.0, y0 + dir * 3.0, x + 7.0, y0 + dir * 5.0, x + 4.0, y1, NOTE_COLOR
                        ));
                    }
                }
            }
            DrawOp::Slash { from, to } => self.line(from.x, from.y, to.x, to.y, NOTE_COLOR, 0.8),
            DrawOp::LedgerLine { x1, x2, y } => self.line(x1, y, x2, y, STAFF_COLOR, STAFF_LINE_WIDTH),
            DrawOp::Rest { x, y, duration } => self.glyph(x, y, rest_glyph(duration), 18.0),
            DrawOp::Bar { x, y_top, y_bottom, bar_type } => self.bar(x, y_top, y_bottom, bar_type),
            DrawOp::Clef { x, y, clef, small } => {
                let size = if small { 20.0 } else { 28.0 };
                self.glyph(x, y, clef_glyph(clef), size);
            }
            DrawOp::KeySignature { accidentals, .. } => {
                for (ax, ay, acc) in accidentals {
                    self.glyph(ax, ay + 3.0, accidental_glyph(acc), 11.0);
                }
            }
            DrawOp::TimeSignature { x, y, top, bottom } => {
                self.text(x, y - 13.0, &top.to_string(), 13.0, NOTE_COLOR, "middle");
                self.text(x, y - 1.0, &bottom.to_string(), 13.0, NOTE_COLOR, "middle");
            }
            DrawOp::Beam { from, to, depth } => self.beam(from, to, depth),
            DrawOp::Curve { points, kind, dotted } => self.curve(&points, kind, dotted),
            DrawOp::Line { from, to, width } => self.line(from.x, from.y, to.x, to.y, NOTE_COLOR, width),
            DrawOp::Text { x, y, text, kind, size } => {
                let (fill, anchor) = match kind {
                    TextKind::GuitarChord => (CHORD_COLOR, "start"),
                    TextKind::Lyric | TextKind::Tuplet | TextKind::Decoration | TextKind::Title => (NOTE_COLOR, "middle"),
                    TextKind::MeasureNumber => (NOTE_COLOR, "start"),
                };
                self.text(x, y, &text, size, fill, anchor);
            }
            DrawOp::Hyphen { x1, x2, y } => {
                let mid = (x1 + x2) / 2.0;
                self.line(mid - 2.0, y, mid + 2.0, y, NOTE_COLOR, 0.7);
            }
            DrawOp::Brace { x, y_top, y_bottom } => {
                let mid = (y_top + y_bottom) / 2.0;
                let (t, m, b) = (self.y(y_top), self.y(mid), self.y(y_bottom));
                self.elements.push(format!(
                    r#"<path d="M{:.1},{:.1} C{:.1},{:.1} {:.1},{:.1} {:.1},{:.1} C{:.1},{:.1} {:.1},{:.1} {:.1},{:.1}" fill="none" stroke="{}" stroke-width="1.6"/>"#,
                    x, t, x - 6.0, t + 6.0, x + 2.0, m - 6.0, x - 5.0, m, x + 2.0, m + 6.0, x - 6.0, b - 6.0, x, b, NOTE_COLOR
                ));
            }
            DrawOp::Bracket { x, y_top, y_bottom } => {
                self.line(x, y_top, x, y_bottom, NOTE_COLOR, 3.0);
                self.line(x, y_top, x + 5.0, y_top - 3.0, NOTE_COLOR, 1.0);
                self.line(x, y_bottom, x + 5.0, y_bottom + 3.0, NOTE_COLOR, 1.0);
            }
        }
    }

    fn end_line(&mut self) {}
}
