use serde::Deserialize;

use crate::geometry::Size;

/// Tunables shared by the interaction engine and the exporter. Lengths are in
/// display pixels unless noted otherwise.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Smallest overlay, in document units (display pixels at scale 1).
    pub min_overlay_size: Size,
    /// Padding added around a freehand capture's bounding box.
    pub capture_padding: f64,
    /// Side of the square hit area around each resize corner.
    pub handle_size: f64,
    pub default_font_size: f64,
    pub text_line_height: f64,
    /// Average glyph advance as a fraction of the font size.
    pub text_char_width: f64,
    /// Stroke width in capture pixels.
    pub stroke_width: f64,
    pub stroke_color: [f32; 3],
    /// Raster pixels per capture pixel for generated previews.
    pub preview_scale: f64,
    pub output_suffix: String,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            min_overlay_size: Size::new(24.0, 24.0),
            capture_padding: 10.0,
            handle_size: 14.0,
            default_font_size: 24.0,
            text_line_height: 1.2,
            text_char_width: 0.55,
            stroke_width: 2.5,
            stroke_color: [0.0, 0.0, 0.0],
            preview_scale: 2.0,
            output_suffix: "-signed".to_string(),
        }
    }
}

impl EngineConfig {
    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }

    /// Display size of a single line of text at `font_size`.
    pub fn text_box(&self, text: &str, font_size: f64) -> Size {
        let chars = text.chars().count().max(1) as f64;
        Size::new(
            chars * font_size * self.text_char_width,
            font_size * self.text_line_height,
        )
    }

    /// Font size and box for `text`, shrunk together when the box would not
    /// fit inside `bounds`.
    pub fn fit_text(&self, text: &str, font_size: f64, bounds: Option<Size>) -> (f64, Size) {
        let size = self.text_box(text, font_size);
        let factor = bounds.map_or(1.0, |b| {
            (b.width / size.width).min(b.height / size.height).min(1.0)
        });
        if factor.is_finite() && factor > 0.0 {
            (font_size * factor, size.scaled(factor))
        } else {
            (font_size, size)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_json_keeps_defaults() {
        let config = EngineConfig::from_json(r#"{"capture_padding": 4.0}"#).unwrap();
        assert_eq!(config.capture_padding, 4.0);
        assert_eq!(config.min_overlay_size, Size::new(24.0, 24.0));
        assert_eq!(config.output_suffix, "-signed");
    }

    #[test]
    fn text_box_grows_with_length() {
        let config = EngineConfig::default();
        let short = config.text_box("Jo", 20.0);
        let long = config.text_box("John Doe", 20.0);
        assert!(long.width > short.width);
        assert_eq!(short.height, long.height);
    }

    #[test]
    fn fit_text_shrinks_font_with_box() {
        let config = EngineConfig::default();
        let text = "A very long legal name that will not fit on a page";
        let page = Size::new(300.0, 400.0);
        let (font_size, size) = config.fit_text(text, 24.0, Some(page));
        assert!(font_size < 24.0);
        assert!((size.width - 300.0).abs() < 1e-9);
        let expected = config.text_box(text, font_size);
        assert!((size.height - expected.height).abs() < 1e-9);

        assert_eq!(config.fit_text("Jo", 24.0, Some(page)), (24.0, config.text_box("Jo", 24.0)));
        assert_eq!(config.fit_text(text, 24.0, None).0, 24.0);
    }
}
