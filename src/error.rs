//! Error types and layout diagnostics.
//!
//! Hard failures (bad configuration, a corrupted symbol graph) are returned as
//! [`LayoutError`].  Everything the engine can recover from is recorded as a
//! [`Diagnostic`] and layout carries on with a local repair.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::model::SymbolId;

/// Fatal layout errors.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum LayoutError {
    /// A configuration value is out of range
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// A voice index does not exist in the tune
    #[error("unknown voice {0}")]
    UnknownVoice(usize),

    /// A staff index does not exist in the tune
    #[error("unknown staff {0}")]
    UnknownStaff(usize),

    /// The tune has no symbols to lay out
    #[error("tune has no symbols")]
    EmptyTune,

    /// The symbol graph links are inconsistent
    #[error("broken link at symbol {0}: {1}")]
    BrokenLink(SymbolId, String),

    /// An internal invariant was violated and `fatal_internal` is set
    #[error("internal layout error: {0}")]
    Internal(String),

    /// Serialization failure
    #[error("JSON error: {0}")]
    Json(String),
}

impl From<serde_json::Error> for LayoutError {
    fn from(e: serde_json::Error) -> Self {
        LayoutError::Json(e.to_string())
    }
}

/// How serious a diagnostic is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Severity {
    Warning,
    Error,
    /// A bug-class condition: the engine reached a state it should not.
    Internal,
}

/// What a diagnostic is about.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DiagnosticKind {
    /// More time in a measure than the meter allows
    WrongDuration,
    /// A tuplet declared more notes than followed it
    IncompleteTuplet,
    /// A slur end without a start, or a start never closed
    UnmatchedSlur,
    /// A tie with no note to end on
    UnmatchedTie,
    /// Content wider than the line even at maximum shrink
    Overfull,
    /// Content too short to fill the line at maximum stretch
    Underfull,
    /// Staves need more separation than the configured maximum
    StaffOverlap,
    /// A symbol that should not appear where it was found
    UnexpectedSymbol,
    /// A beam group without a usable end
    BrokenBeam,
}

/// One recorded condition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Diagnostic {
    pub severity: Severity,
    pub kind: DiagnosticKind,
    pub message: String,
    /// Offending symbol, when there is one
    pub symbol: Option<SymbolId>,
    /// Output line the condition was found on
    pub line: Option<usize>,
}

/// Collector for diagnostics; every entry is also sent to the `log` facade.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Diagnostics {
    entries: Vec<Diagnostic>,
    verbosity: u8,
    line: Option<usize>,
}

impl Diagnostics {
    pub fn new(verbosity: u8) -> Self {
        Self {
            entries: Vec::new(),
            verbosity,
            line: None,
        }
    }

    /// Tag subsequent diagnostics with an output line index.
    pub fn set_line(&mut self, line: Option<usize>) {
        self.line = line;
    }

    pub fn warning(&mut self, kind: DiagnosticKind, symbol: Option<SymbolId>, message: impl Into<String>) {
        self.push(Severity::Warning, kind, symbol, message.into());
    }

    pub fn error(&mut self, kind: DiagnosticKind, symbol: Option<SymbolId>, message: impl Into<String>) {
        self.push(Severity::Error, kind, symbol, message.into());
    }

    pub fn internal(&mut self, kind: DiagnosticKind, symbol: Option<SymbolId>, message: impl Into<String>) {
        self.push(Severity::Internal, kind, symbol, message.into());
    }

    /// Layout-capacity conditions (overfull, underfull, clamped separation).
    /// Always logged at debug level; recorded only above default verbosity.
    pub fn capacity(&mut self, kind: DiagnosticKind, symbol: Option<SymbolId>, message: impl Into<String>) {
        let message = message.into();
        log::debug!("{:?}: {}", kind, message);
        if self.verbosity > 0 {
            self.entries.push(Diagnostic {
                severity: Severity::Warning,
                kind,
                message,
                symbol,
                line: self.line,
            });
        }
    }

    fn push(&mut self, severity: Severity, kind: DiagnosticKind, symbol: Option<SymbolId>, message: String) {
        match severity {
            Severity::Warning => log::warn!("{:?}: {}", kind, message),
            Severity::Error => log::error!("{:?}: {}", kind, message),
            Severity::Internal => log::error!("internal {:?}: {}", kind, message),
        }
        self.entries.push(Diagnostic {
            severity,
            kind,
            message,
            symbol,
            line: self.line,
        });
    }

    /// Move all entries of `other` into this collector.
    pub fn append(&mut self, other: &mut Diagnostics) {
        self.entries.append(&mut other.entries);
    }

    pub fn entries(&self) -> &[Diagnostic] {
        &self.entries
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn count(&self, kind: DiagnosticKind) -> usize {
        self.entries.iter().filter(|d| d.kind == kind).count()
    }

    pub fn has_internal(&self) -> bool {
        self.entries.iter().any(|d| d.severity == Severity::Internal)
    }

    /// The first internal diagnostic, if any.
    pub fn first_internal(&self) -> Option<&Diagnostic> {
        self.entries.iter().find(|d| d.severity == Severity::Internal)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn capacity_entries_depend_on_verbosity() {
        let mut quiet = Diagnostics::new(0);
        quiet.capacity(DiagnosticKind::Overfull, None, "line too wide");
        assert!(quiet.is_empty());

        let mut verbose = Diagnostics::new(1);
        verbose.capacity(DiagnosticKind::Overfull, None, "line too wide");
        assert_eq!(verbose.count(DiagnosticKind::Overfull), 1);
    }

    #[test]
    fn entries_carry_the_current_line() {
        let mut diags = Diagnostics::new(0);
        diags.set_line(Some(3));
        diags.warning(DiagnosticKind::UnmatchedTie, Some(SymbolId(7)), "tie without end");
        let d = &diags.entries()[0];
        assert_eq!(d.line, Some(3));
        assert_eq!(d.symbol, Some(SymbolId(7)));
        assert_eq!(d.severity, Severity::Warning);
        assert!(!diags.has_internal());
    }
}
