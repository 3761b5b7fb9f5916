//! Layout configuration.
//!
//! All lengths are in points (1/72 inch).  Horizontal layout works in
//! unscaled staff units; the usable line width is
//! `(page_width - left_margin - right_margin) / scale`.

use serde::{Deserialize, Serialize};

use crate::error::LayoutError;

/// How measure numbers are printed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MeasureNumbering {
    None,
    /// Above the first bar of every line
    EachLine,
    /// Above every N-th bar
    Every(u32),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LayoutConfig {
    // ── Page ──
    pub page_width: f64,
    pub page_height: f64,
    pub left_margin: f64,
    pub right_margin: f64,
    pub top_margin: f64,
    pub bottom_margin: f64,
    /// Global scale from staff units to page points
    pub scale: f64,

    // ── Glue ──
    /// Largest shrink factor alpha allowed before a line is cut
    pub max_shrink: f64,
    /// Largest stretch factor beta before a line is treated as underfull
    pub max_stretch: f64,
    /// Stretch lines to the full width
    pub stretch_staff: bool,
    /// Stretch the last line when its natural width reaches this fraction
    /// of the line width (0 always stretches, above 1 never does)
    pub stretch_last: f64,
    /// Blend ratio of the centring nudge for a lone note in a solo measure
    pub solo_center_ratio: f64,

    // ── Line breaking ──
    /// Force a line break every N bars
    pub bars_per_line: Option<u32>,
    /// Ignore source line ends and fill lines by width
    pub continue_all: bool,
    /// Start each tune on a new page (reported in the layout result)
    pub one_tune_per_page: bool,

    // ── Vertical ──
    pub staff_sep: f64,
    pub max_staff_sep: f64,
    pub system_sep: f64,
    pub max_system_sep: f64,
    /// Distance between lyric verses
    pub lyric_space: f64,
    /// Put lyrics above the staff
    pub vocal_above: bool,

    // ── Drawing ──
    /// Global factor applied to slur heights
    pub slur_height: f64,
    /// Bagpipe style: flat beams at a fixed offset
    pub flat_beams: bool,
    pub straight_flags: bool,
    pub bar_numbers: MeasureNumbering,
    pub first_measure: u32,

    // ── Diagnostics ──
    /// Abort on internal invariant violations instead of skipping the symbol
    pub fatal_internal: bool,
    /// 0 records only user-data diagnostics; >0 also records capacity events
    pub verbosity: u8,
}

impl Default for LayoutConfig {
    fn default() -> Self {
        Self {
            page_width: 595.0, // A4
            page_height: 842.0,
            left_margin: 50.0,
            right_margin: 50.0,
            top_margin: 30.0,
            bottom_margin: 30.0,
            scale: 0.75,
            max_shrink: 0.65,
            max_stretch: 1.0,
            stretch_staff: true,
            stretch_last: 0.25,
            solo_center_ratio: 0.5,
            bars_per_line: None,
            continue_all: false,
            one_tune_per_page: false,
            staff_sep: 46.0,
            max_staff_sep: 2000.0,
            system_sep: 60.0,
            max_system_sep: 2000.0,
            lyric_space: 14.0,
            vocal_above: false,
            slur_height: 1.0,
            flat_beams: false,
            straight_flags: false,
            bar_numbers: MeasureNumbering::None,
            first_measure: 1,
            fatal_internal: false,
            verbosity: 0,
        }
    }
}

impl LayoutConfig {
    /// Usable line width in unscaled staff units.
    pub fn line_width(&self) -> f64 {
        (self.page_width - self.left_margin - self.right_margin) / self.scale
    }

    /// Parse a configuration from JSON; missing fields take their defaults.
    pub fn from_json(json: &str) -> Result<Self, LayoutError> {
        let config: LayoutConfig = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), LayoutError> {
        let finite = [
            ("page_width", self.page_width),
            ("page_height", self.page_height),
            ("left_margin", self.left_margin),
            ("right_margin", self.right_margin),
            ("top_margin", self.top_margin),
            ("bottom_margin", self.bottom_margin),
            ("scale", self.scale),
            ("max_shrink", self.max_shrink),
            ("max_stretch", self.max_stretch),
            ("solo_center_ratio", self.solo_center_ratio),
            ("stretch_last", self.stretch_last),
            ("staff_sep", self.staff_sep),
            ("max_staff_sep", self.max_staff_sep),
            ("system_sep", self.system_sep),
            ("max_system_sep", self.max_system_sep),
            ("lyric_space", self.lyric_space),
            ("slur_height", self.slur_height),
        ];
        for (name, value) in finite {
            if !value.is_finite() {
                return Err(LayoutError::InvalidConfig(format!("{name} is not finite")));
            }
        }
        if self.scale <= 0.0 {
            return Err(LayoutError::InvalidConfig("scale must be positive".into()));
        }
        if self.line_width() <= 0.0 {
            return Err(LayoutError::InvalidConfig("margins leave no room on the page".into()));
        }
        if !(0.0..=1.0).contains(&self.max_shrink) {
            return Err(LayoutError::InvalidConfig("max_shrink must be within 0..=1".into()));
        }
        if self.max_stretch < 0.0 {
            return Err(LayoutError::InvalidConfig("max_stretch must not be negative".into()));
        }
        if !(0.0..=1.0).contains(&self.solo_center_ratio) {
            return Err(LayoutError::InvalidConfig("solo_center_ratio must be within 0..=1".into()));
        }
        if self.max_staff_sep < self.staff_sep {
            return Err(LayoutError::InvalidConfig("max_staff_sep is below staff_sep".into()));
        }
        if self.max_system_sep < self.system_sep {
            return Err(LayoutError::InvalidConfig("max_system_sep is below system_sep".into()));
        }
        if self.bars_per_line == Some(0) {
            return Err(LayoutError::InvalidConfig("bars_per_line must be at least 1".into()));
        }
        if self.bar_numbers == MeasureNumbering::Every(0) {
            return Err(LayoutError::InvalidConfig("measure numbering interval must be at least 1".into()));
        }
        if self.slur_height <= 0.0 {
            return Err(LayoutError::InvalidConfig("slur_height must be positive".into()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use float_cmp::approx_eq;

    #[test]
    fn default_is_valid() {
        let config = LayoutConfig::default();
        assert!(config.validate().is_ok());
        assert!(approx_eq!(f64, config.line_width(), 495.0 / 0.75, epsilon = 1e-9));
    }

    #[test]
    fn json_fills_missing_fields() {
        let config = LayoutConfig::from_json(r#"{"bars_per_line": 4, "flat_beams": true}"#).unwrap();
        assert_eq!(config.bars_per_line, Some(4));
        assert!(config.flat_beams);
        assert_eq!(config.scale, 0.75);
    }

    #[test]
    fn rejects_bad_values() {
        let config = LayoutConfig { max_shrink: 1.5, ..LayoutConfig::default() };
        assert!(matches!(config.validate(), Err(LayoutError::InvalidConfig(_))));
        let config = LayoutConfig { scale: f64::NAN, ..LayoutConfig::default() };
        assert!(config.validate().is_err());
        assert!(LayoutConfig::from_json(r#"{"bars_per_line": 0}"#).is_err());
    }
}
