//! Text element content.

use serde::{Deserialize, Serialize};

/// Default font size in canvas units.
pub const DEFAULT_FONT_SIZE: f64 = 20.0;

/// Default font family name.
pub const DEFAULT_FONT_FAMILY: &str = "sans-serif";

/// Font weight options.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FontWeight {
    #[default]
    Normal,
    Bold,
}

/// Font style options.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FontStyle {
    #[default]
    Normal,
    Italic,
}

/// Text decoration options.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TextDecoration {
    #[default]
    None,
    Underline,
}

/// Content of a text element.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TextContent {
    pub text: String,
    #[serde(default = "default_font_size")]
    pub font_size: f64,
    #[serde(default = "default_font_family")]
    pub font_family: String,
    #[serde(default)]
    pub font_weight: FontWeight,
    #[serde(default)]
    pub font_style: FontStyle,
    #[serde(default)]
    pub text_decoration: TextDecoration,
    #[serde(default)]
    pub width: f64,
    #[serde(default)]
    pub height: f64,
}

impl TextContent {
    /// Create text content with default typography.
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            font_size: DEFAULT_FONT_SIZE,
            font_family: DEFAULT_FONT_FAMILY.to_string(),
            font_weight: FontWeight::default(),
            font_style: FontStyle::default(),
            text_decoration: TextDecoration::default(),
            width: 0.0,
            height: 0.0,
        }
    }

    /// Set the font size.
    pub fn with_font_size(mut self, font_size: f64) -> Self {
        self.font_size = font_size;
        self
    }

    /// Toggle bold weight.
    pub fn toggle_bold(&mut self) {
        self.font_weight = match self.font_weight {
            FontWeight::Normal => FontWeight::Bold,
            FontWeight::Bold => FontWeight::Normal,
        };
    }

    /// Toggle italic style.
    pub fn toggle_italic(&mut self) {
        self.font_style = match self.font_style {
            FontStyle::Normal => FontStyle::Italic,
            FontStyle::Italic => FontStyle::Normal,
        };
    }

    /// Toggle underline decoration.
    pub fn toggle_underline(&mut self) {
        self.text_decoration = match self.text_decoration {
            TextDecoration::None => TextDecoration::Underline,
            TextDecoration::Underline => TextDecoration::None,
        };
    }
}

fn default_font_size() -> f64 {
    DEFAULT_FONT_SIZE
}

fn default_font_family() -> String {
    DEFAULT_FONT_FAMILY.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_typography_uses_defaults() {
        let text: TextContent = serde_json::from_str(r#"{"text":"hi"}"#).unwrap();
        assert_eq!(text.font_size, DEFAULT_FONT_SIZE);
        assert_eq!(text.font_weight, FontWeight::Normal);
        assert_eq!(text.text_decoration, TextDecoration::None);
    }

    #[test]
    fn test_toggles() {
        let mut text = TextContent::new("hello");
        text.toggle_bold();
        text.toggle_italic();
        text.toggle_underline();

        let json = serde_json::to_value(&text).unwrap();
        assert_eq!(json["fontWeight"], "bold");
        assert_eq!(json["fontStyle"], "italic");
        assert_eq!(json["textDecoration"], "underline");

        text.toggle_bold();
        assert_eq!(text.font_weight, FontWeight::Normal);
    }
}
