//! scorelayout — horizontal spacing, line breaking and engraving geometry
//! for a linked music symbol graph.
//!
//! A tune is built with [`TuneBuilder`], laid out with [`layout_tune`] and
//! emitted as abstract [`DrawOp`]s to any [`DrawSink`].
//!
//! # Example
//! ```no_run
//! use scorelayout::*;
//!
//! let mut b = TuneBuilder::new();
//! let staff = b.add_staff(Clef::treble());
//! let v = b.add_voice("1", staff).unwrap();
//! for step in ['C', 'D', 'E', 'F'] {
//!     b.note(v, vec![NoteHead::new(diatonic(step, 5))], QUARTER).unwrap();
//! }
//! b.bar(v, BarType::Single).unwrap();
//! let mut tune = b.finish().unwrap();
//!
//! let mut ops = DrawList::new();
//! let layout = layout_tune(&mut tune, &LayoutConfig::default(), &mut ops).unwrap();
//! println!("lines: {}", layout.lines.len());
//! ```

pub mod builder;
pub mod config;
pub mod draw;
pub mod engine;
pub mod error;
pub mod model;
pub mod svg;

pub use builder::TuneBuilder;
pub use config::{LayoutConfig, MeasureNumbering};
pub use draw::{DrawList, DrawOp, DrawSink, NullSink};
pub use engine::{layout_tune, LayoutContext, LineLayout, TuneLayout};
pub use error::{Diagnostic, DiagnosticKind, Diagnostics, LayoutError, Severity};
pub use model::*;
pub use svg::SvgSink;

/// Serialize a collected operation stream to pretty JSON.
pub fn ops_to_json(ops: &DrawList) -> Result<String, LayoutError> {
    Ok(serde_json::to_string_pretty(ops)?)
}

/// Lay out a tune and render it as a standalone SVG document.
pub fn render_tune_to_svg(tune: &mut Tune, config: &LayoutConfig) -> Result<String, LayoutError> {
    let mut sink = SvgSink::new(config);
    let layout = layout_tune(tune, config, &mut sink)?;
    for d in layout.diagnostics.entries() {
        log::debug!("{:?} {:?}: {}", d.severity, d.kind, d.message);
    }
    Ok(sink.build())
}
