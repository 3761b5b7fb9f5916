//! Layout engine — horizontal spacing, line breaking, vertical placement,
//! beams and curves for one tune.
//!
//! Pipeline per output line:
//!
//! 1. stems, chord heads, voice collisions     (`vertical`)
//! 2. widths and spacing of every symbol        (`width`)
//! 3. glue: fit the line or cut it shorter      (`glue`, `lines`)
//! 4. grace notes, beams, extents               (`vertical`, `beam`)
//! 5. slurs, ties and lyric hyphens             (`slur`)
//! 6. annotations and staff stacking            (`vertical`)
//! 7. draw operations                           (`emit`)

mod beam;
mod constants;
mod emit;
mod glue;
mod lines;
mod slur;
mod vertical;
mod width;

use serde::Serialize;

use crate::config::LayoutConfig;
use crate::draw::{CurveKind, DrawSink, Point, TextKind};
use crate::error::{DiagnosticKind, Diagnostics, LayoutError};
use crate::model::{SymbolId, Tune};

pub use beam::{Beam, BeamSegment};
pub use glue::{positions, Glue, GlueStatus, Moment};
pub use slur::CarryReport;
pub use vertical::LineMetrics;
pub use width::nwidth;

// ═══════════════════════════════════════════════════════════════════════
// Context
// ═══════════════════════════════════════════════════════════════════════

/// State that outlives a single line: the running configuration (inline
/// format changes update it), the previous line's glue and the measure
/// counter.
#[derive(Debug, Clone)]
pub struct LayoutContext {
    pub config: LayoutConfig,
    /// Usable line width in staff units
    pub width: f64,
    pub diagnostics: Diagnostics,
    pub prev_glue: Option<Glue>,
    /// Index of the line being laid out
    pub line: usize,
    pub measure: u32,
    pub first_bar_seen: bool,
}

impl LayoutContext {
    pub fn new(config: &LayoutConfig) -> Self {
        Self {
            config: config.clone(),
            width: config.line_width(),
            diagnostics: Diagnostics::new(config.verbosity),
            prev_glue: None,
            line: 0,
            measure: config.first_measure,
            first_bar_seen: false,
        }
    }

    /// Record an internal inconsistency; fatal when so configured.
    pub(crate) fn internal(&mut self, symbol: Option<SymbolId>, message: &str) -> Result<(), LayoutError> {
        self.diagnostics.internal(DiagnosticKind::UnexpectedSymbol, symbol, message);
        if self.config.fatal_internal {
            return Err(LayoutError::Internal(format!("line {}: {}", self.line, message)));
        }
        Ok(())
    }
}

// ═══════════════════════════════════════════════════════════════════════
// Line geometry
// ═══════════════════════════════════════════════════════════════════════

/// A point in the coordinates of one staff.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct StaffPoint {
    pub x: f64,
    pub y: f64,
    pub staff: usize,
}

/// A slur or tie as a cubic Bézier in staff coordinates.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Curve {
    pub staff: usize,
    pub points: [Point; 4],
    pub kind: CurveKind,
    pub dotted: bool,
}

/// A straight line, possibly between two staves.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Segment {
    pub from: StaffPoint,
    pub to: StaffPoint,
    pub width: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PlacedText {
    pub staff: usize,
    pub x: f64,
    pub y: f64,
    pub text: String,
    pub kind: TextKind,
    pub size: f64,
}

/// A lyric hyphen or extender between two x positions.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct HyphenRun {
    pub staff: usize,
    pub verse: usize,
    pub x1: f64,
    pub x2: f64,
    /// Set once the lyric baselines are known
    pub y: f64,
    pub extender: bool,
}

/// Everything computed for the line being finished.
#[derive(Debug, Clone, Default)]
pub struct LineWork {
    pub ids: Vec<SymbolId>,
    /// Realized line width
    pub width: f64,
    pub beams: Vec<Beam>,
    pub curves: Vec<Curve>,
    pub segments: Vec<Segment>,
    pub hyphens: Vec<HyphenRun>,
    pub texts: Vec<PlacedText>,
}

impl LineWork {
    pub fn new(ids: Vec<SymbolId>, width: f64) -> Self {
        Self { ids, width, ..Self::default() }
    }
}

// ═══════════════════════════════════════════════════════════════════════
// Results
// ═══════════════════════════════════════════════════════════════════════

/// One laid-out output line.
#[derive(Debug, Clone)]
pub struct LineLayout {
    pub index: usize,
    /// Symbols of the line in time order
    pub symbols: Vec<SymbolId>,
    pub glue: Glue,
    pub moments: Vec<Moment>,
    pub width: f64,
    pub height: f64,
    /// Distance to the next line
    pub advance: f64,
    /// Offset of every staff's bottom line from the line top
    pub staff_y: Vec<f64>,
    /// Last symbol of the line when the tune continues after it
    pub cut: Option<SymbolId>,
    pub carry: CarryReport,
    pub beams: Vec<Beam>,
    pub curves: Vec<Curve>,
}

#[derive(Debug, Clone)]
pub struct TuneLayout {
    pub lines: Vec<LineLayout>,
    pub diagnostics: Diagnostics,
    /// The tune asks for a page of its own
    pub new_page: bool,
}

impl TuneLayout {
    pub fn height(&self) -> f64 {
        self.lines.iter().map(|l| l.advance).sum()
    }
}

/// Lay out a linked tune line by line, emitting to `sink`.
///
/// The time-order list is consumed: once done, `tune.ts_first` is `None`
/// and the symbols keep their final positions.
pub fn layout_tune(tune: &mut Tune, config: &LayoutConfig, sink: &mut dyn DrawSink) -> Result<TuneLayout, LayoutError> {
    config.validate()?;
    if tune.ts_first.is_none() {
        return Err(LayoutError::EmptyTune);
    }
    tune.check_links()?;

    let mut ctx = LayoutContext::new(config);
    vertical::map_pitches(tune);
    let lines = lines::run(&mut ctx, tune, sink)?;
    log::debug!(
        "laid out {} lines, {} diagnostics",
        lines.len(),
        ctx.diagnostics.entries().len() + tune.diagnostics.entries().len()
    );

    let mut diagnostics = std::mem::take(&mut tune.diagnostics);
    diagnostics.append(&mut ctx.diagnostics);
    Ok(TuneLayout { lines, diagnostics, new_page: config.one_tune_per_page })
}
