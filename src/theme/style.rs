//! Style types for themed tokens
//!
//! Styles are partial: every field is optional so a more specific theme rule
//! can override some attributes and inherit the rest.

use crate::grammar::attrs::FontStyle;

/// Text style attributes, colors given as [`ColorMap`](super::ColorMap) ids
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Style {
    /// Foreground color id
    pub foreground: Option<u16>,
    /// Background color id
    pub background: Option<u16>,
    pub bold: Option<bool>,
    pub italic: Option<bool>,
    pub underline: Option<bool>,
    pub strikethrough: Option<bool>,
}

impl Style {
    /// Create a style with just foreground color
    pub fn fg(color: u16) -> Self {
        Self {
            foreground: Some(color),
            ..Default::default()
        }
    }

    /// Create a style with just background color
    pub fn bg(color: u16) -> Self {
        Self {
            background: Some(color),
            ..Default::default()
        }
    }

    /// Create a style with every font flag set explicitly
    pub fn from_font_style(font_style: FontStyle) -> Self {
        Self::default().with_font_style(font_style)
    }

    /// Builder: set foreground color
    pub fn with_fg(mut self, color: u16) -> Self {
        self.foreground = Some(color);
        self
    }

    /// Builder: set background color
    pub fn with_bg(mut self, color: u16) -> Self {
        self.background = Some(color);
        self
    }

    /// Builder: set bold
    pub fn with_bold(mut self) -> Self {
        self.bold = Some(true);
        self
    }

    /// Builder: set italic
    pub fn with_italic(mut self) -> Self {
        self.italic = Some(true);
        self
    }

    /// Builder: set underline
    pub fn with_underline(mut self) -> Self {
        self.underline = Some(true);
        self
    }

    /// Builder: set every font flag, clearing the ones absent from `font_style`
    pub fn with_font_style(mut self, font_style: FontStyle) -> Self {
        self.bold = Some(font_style.contains(FontStyle::BOLD));
        self.italic = Some(font_style.contains(FontStyle::ITALIC));
        self.underline = Some(font_style.contains(FontStyle::UNDERLINE));
        self.strikethrough = Some(font_style.contains(FontStyle::STRIKETHROUGH));
        self
    }

    /// Overlay the fields `other` sets on top of `self`
    pub fn merge(self, other: &Style) -> Self {
        Self {
            foreground: other.foreground.or(self.foreground),
            background: other.background.or(self.background),
            bold: other.bold.or(self.bold),
            italic: other.italic.or(self.italic),
            underline: other.underline.or(self.underline),
            strikethrough: other.strikethrough.or(self.strikethrough),
        }
    }

    /// Font flags, or `None` when no flag has been set either way
    pub fn font_style(&self) -> Option<FontStyle> {
        if self.bold.is_none() && self.italic.is_none() && self.underline.is_none() && self.strikethrough.is_none() {
            return None;
        }
        let mut style = FontStyle::empty();
        style.set(FontStyle::BOLD, self.bold == Some(true));
        style.set(FontStyle::ITALIC, self.italic == Some(true));
        style.set(FontStyle::UNDERLINE, self.underline == Some(true));
        style.set(FontStyle::STRIKETHROUGH, self.strikethrough == Some(true));
        Some(style)
    }

    /// Check if this is the default (no styling)
    pub fn is_default(&self) -> bool {
        *self == Self::default()
    }
}

/// A styled span of text within a line
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Span {
    /// Byte offset where this span starts (inclusive)
    pub start: usize,
    /// Byte offset where this span ends (exclusive)
    pub end: usize,
    /// Style to apply to this span
    pub style: Style,
}

impl Span {
    /// Create a new span
    pub fn new(start: usize, end: usize, style: Style) -> Self {
        Self { start, end, style }
    }

    /// Check if this span contains a byte position
    pub fn contains(&self, pos: usize) -> bool {
        pos >= self.start && pos < self.end
    }

    /// Get the length of this span in bytes
    pub fn len(&self) -> usize {
        self.end.saturating_sub(self.start)
    }

    /// Check if span is empty
    pub fn is_empty(&self) -> bool {
        self.start >= self.end
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_style_default() {
        let style = Style::default();
        assert!(style.is_default());
        assert_eq!(style.foreground, None);
        assert_eq!(style.font_style(), None);
    }

    #[test]
    fn test_style_builders() {
        let style = Style::fg(3).with_bold().with_bg(4);
        assert_eq!(style.foreground, Some(3));
        assert_eq!(style.background, Some(4));
        assert_eq!(style.font_style(), Some(FontStyle::BOLD));
        assert!(!style.is_default());
    }

    #[test]
    fn test_merge_overrides_only_set_fields() {
        let base = Style::fg(1).with_bg(2).with_italic();
        let merged = base.merge(&Style::fg(5).with_bold());
        assert_eq!(merged.foreground, Some(5));
        assert_eq!(merged.background, Some(2));
        assert_eq!(merged.italic, Some(true));
        assert_eq!(merged.bold, Some(true));
    }

    #[test]
    fn test_explicit_plain_font_style() {
        let style = Style::from_font_style(FontStyle::empty());
        assert_eq!(style.font_style(), Some(FontStyle::empty()));
        let merged = Style::default().with_bold().merge(&style);
        assert_eq!(merged.bold, Some(false));
    }

    #[test]
    fn test_span_contains() {
        let span = Span::new(5, 10, Style::default());
        assert!(!span.contains(4));
        assert!(span.contains(5));
        assert!(span.contains(9));
        assert!(!span.contains(10));
        assert_eq!(span.len(), 5);
    }
}
