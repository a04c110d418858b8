//! Themes: resolving scope paths to styles
//!
//! A theme is an ordered list of rules, each a scope selector plus a partial
//! [`Style`]. Resolving a scope path ranks every matching rule by selector
//! priority, then by how deep in the path it matched, then by how precise the
//! matching selector is, then by declaration order. Styles are merged from
//! the least to the most specific rule.

mod color;
mod css;
mod raw;
mod style;

use std::fs;
use std::path::Path;

use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use tracing::{debug, warn};

pub use color::{ColorMap, Rgb};
pub use style::{Span, Style};

use crate::error::{SelectorError, ThemeError};
use crate::grammar::attrs::FontStyle;
use crate::grammar::Token;
use crate::selector::{Priority, SelectorList, SelectorMatch, Specificity};

/// One declaration before colors are mapped to ids
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ThemeSetting {
    /// Selector string, `None` for the theme's global defaults
    pub selector: Option<String>,
    pub foreground: Option<Rgb>,
    pub background: Option<Rgb>,
    pub font_style: Option<FontStyle>,
    /// Individual font flags, applied after `font_style`
    pub bold: Option<bool>,
    pub italic: Option<bool>,
    pub underline: Option<bool>,
    pub strikethrough: Option<bool>,
}

impl ThemeSetting {
    pub fn new(selector: &str) -> Self {
        Self {
            selector: Some(selector.to_string()),
            ..Default::default()
        }
    }

    pub fn foreground(mut self, color: Rgb) -> Self {
        self.foreground = Some(color);
        self
    }

    pub fn background(mut self, color: Rgb) -> Self {
        self.background = Some(color);
        self
    }

    pub fn font_style(mut self, font_style: FontStyle) -> Self {
        self.font_style = Some(font_style);
        self
    }

    fn to_style(&self, colors: &mut ColorMap) -> Style {
        let mut style = match self.font_style {
            Some(font_style) => Style::from_font_style(font_style),
            None => Style::default(),
        };
        style.foreground = self.foreground.map(|c| colors.id_for(c)).filter(|id| *id != 0);
        style.background = self.background.map(|c| colors.id_for(c)).filter(|id| *id != 0);
        style.bold = self.bold.or(style.bold);
        style.italic = self.italic.or(style.italic);
        style.underline = self.underline.or(style.underline);
        style.strikethrough = self.strikethrough.or(style.strikethrough);
        style
    }
}

/// What a theme rule applies to
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RuleSelector {
    Scopes(SelectorList),
    /// Stylesheet classes, written `.a.b`. Every class must equal a dot
    /// segment of some scope on the path, in any order.
    Classes(Vec<String>),
}

impl RuleSelector {
    pub fn parse(selector: &str) -> Result<Self, SelectorError> {
        if !selector.starts_with('.') {
            return SelectorList::parse(selector).map(Self::Scopes);
        }
        let classes: Vec<String> = selector
            .split(|c: char| c == '.' || c.is_whitespace())
            .filter(|class| !class.is_empty())
            .map(String::from)
            .collect();
        if classes.is_empty() {
            return Err(SelectorError::Empty);
        }
        Ok(Self::Classes(classes))
    }

    pub fn best_match<S: AsRef<str>>(&self, scopes: &[S]) -> Option<SelectorMatch> {
        match self {
            Self::Scopes(list) => list.best_match(scopes),
            Self::Classes(classes) => {
                let mut depth = 0;
                for class in classes {
                    let frame = scopes
                        .iter()
                        .rposition(|scope| scope.as_ref().split('.').any(|segment| segment == class))?;
                    depth = depth.max(frame + 1);
                }
                Some(SelectorMatch {
                    priority: Priority::Normal,
                    specificity: Specificity {
                        depth,
                        atom_segments: 1,
                        atoms: classes.len(),
                    },
                })
            }
        }
    }
}

#[derive(Debug, Clone)]
pub struct ThemeRule {
    pub selector: RuleSelector,
    pub style: Style,
    /// Declaration index, later rules win ties
    pub index: usize,
}

/// A compiled theme
#[derive(Debug)]
pub struct Theme {
    name: Option<String>,
    rules: Vec<ThemeRule>,
    defaults: Style,
    color_map: ColorMap,
    cache: Mutex<FxHashMap<Vec<String>, Option<Style>>>,
}

impl Theme {
    /// Build a theme. `seed` colors get the lowest ids, in order.
    pub fn new(name: Option<String>, settings: impl IntoIterator<Item = ThemeSetting>, seed: &[Rgb]) -> Self {
        let mut color_map = ColorMap::with_seed(seed);
        let mut defaults = Style::default();
        let mut rules = Vec::new();

        for setting in settings {
            let style = setting.to_style(&mut color_map);
            let Some(selector) = setting.selector.as_deref().map(str::trim).filter(|s| !s.is_empty()) else {
                defaults = defaults.merge(&style);
                continue;
            };
            match RuleSelector::parse(selector) {
                Ok(selector) => {
                    let index = rules.len();
                    rules.push(ThemeRule { selector, style, index });
                }
                Err(e) => warn!(selector, error = %e, "ignoring theme rule"),
            }
        }

        debug!(rules = rules.len(), colors = color_map.len(), "theme built");
        Self {
            name,
            rules,
            defaults,
            color_map,
            cache: Mutex::new(FxHashMap::default()),
        }
    }

    /// Parse a JSON theme in the TextMate `settings` (or VS Code `tokenColors`) form
    pub fn from_json(json: &str) -> Result<Self, ThemeError> {
        raw::parse_json(json)
    }

    /// Parse a CSS stylesheet theme
    pub fn from_css(css: &str) -> Result<Self, ThemeError> {
        css::parse(css)
    }

    /// Load a theme file, choosing the format from its extension
    pub fn load(path: &Path) -> Result<Self, ThemeError> {
        let contents = fs::read_to_string(path).map_err(|source| ThemeError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let is_css = path
            .extension()
            .and_then(|ext| ext.to_str())
            .is_some_and(|ext| ext.eq_ignore_ascii_case("css"));
        if is_css {
            Self::from_css(&contents)
        } else {
            Self::from_json(&contents)
        }
    }

    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    pub fn rules(&self) -> &[ThemeRule] {
        &self.rules
    }

    /// Style applied where no rule matches
    pub fn defaults(&self) -> Style {
        self.defaults
    }

    pub fn color_map(&self) -> &ColorMap {
        &self.color_map
    }

    pub fn color(&self, id: u16) -> Option<Rgb> {
        self.color_map.color(id)
    }

    /// Merged style of every rule matching `scope_path` (outermost scope first),
    /// or `None` when no rule matches.
    pub fn resolve_style<S: AsRef<str>>(&self, scope_path: &[S]) -> Option<Style> {
        let key: Vec<String> = scope_path.iter().map(|s| s.as_ref().to_string()).collect();
        if let Some(cached) = self.cache.lock().get(&key) {
            return *cached;
        }
        let resolved = self.compute_style(scope_path);
        self.cache.lock().insert(key, resolved);
        resolved
    }

    fn compute_style<S: AsRef<str>>(&self, scope_path: &[S]) -> Option<Style> {
        let mut matched: Vec<_> = self
            .rules
            .iter()
            .filter_map(|rule| {
                rule.selector
                    .best_match(scope_path)
                    .map(|m| ((m.priority, m.specificity, rule.index), &rule.style))
            })
            .collect();
        if matched.is_empty() {
            return None;
        }
        matched.sort_by_key(|(rank, _)| *rank);
        Some(
            matched
                .into_iter()
                .fold(Style::default(), |acc, (_, style)| acc.merge(style)),
        )
    }

    /// Style for one token, falling back to the theme defaults
    pub fn token_style(&self, token: &Token) -> Style {
        match self.resolve_style(&token.scopes) {
            Some(style) => self.defaults.merge(&style),
            None => self.defaults,
        }
    }

    /// Styled spans for a tokenized line
    pub fn spans(&self, tokens: &[Token]) -> Vec<Span> {
        tokens
            .iter()
            .map(|token| Span::new(token.start, token.end, self.token_style(token)))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    const X: Rgb = Rgb::new(255, 128, 128);
    const Y: Rgb = Rgb::new(255, 0, 0);

    fn theme() -> Theme {
        Theme::new(
            None,
            vec![
                ThemeSetting::default().foreground(Rgb::new(1, 1, 1)),
                ThemeSetting::new("invalid").background(X),
                ThemeSetting::new("storage invalid").background(Y),
                ThemeSetting::new("comment").foreground(Rgb::new(0, 128, 0)).font_style(FontStyle::ITALIC),
                ThemeSetting::new("comment.block").foreground(Rgb::new(0, 0, 128)),
            ],
            &[],
        )
    }

    #[test]
    fn test_more_specific_selector_wins() {
        let theme = theme();
        let both = theme
            .resolve_style(&["source.java", "storage.modifier", "invalid.deprecated"])
            .unwrap();
        assert_eq!(theme.color(both.background.unwrap()), Some(Y));

        let only_invalid = theme.resolve_style(&["source.java", "invalid.illegal"]).unwrap();
        assert_eq!(theme.color(only_invalid.background.unwrap()), Some(X));

        assert_eq!(theme.resolve_style(&["source.java", "keyword"]), None);
    }

    #[test]
    fn test_partial_styles_inherit() {
        let theme = theme();
        let style = theme.resolve_style(&["source", "comment.block.documentation"]).unwrap();
        assert_eq!(theme.color(style.foreground.unwrap()), Some(Rgb::new(0, 0, 128)));
        assert_eq!(style.italic, Some(true));
    }

    #[test]
    fn test_deeper_match_wins() {
        let theme = Theme::new(
            None,
            vec![
                ThemeSetting::new("string.quoted").foreground(Y),
                ThemeSetting::new("meta").foreground(X),
            ],
            &[],
        );
        let style = theme.resolve_style(&["meta", "string.quoted.double"]).unwrap();
        assert_eq!(theme.color(style.foreground.unwrap()), Some(Y));
        let style = theme.resolve_style(&["string.quoted.double", "meta"]).unwrap();
        assert_eq!(theme.color(style.foreground.unwrap()), Some(X));
    }

    #[test]
    fn test_later_declaration_wins_ties() {
        let theme = Theme::new(
            None,
            vec![ThemeSetting::new("keyword").foreground(X), ThemeSetting::new("keyword").foreground(Y)],
            &[],
        );
        let style = theme.resolve_style(&["keyword.control"]).unwrap();
        assert_eq!(theme.color(style.foreground.unwrap()), Some(Y));
    }

    #[test]
    fn test_bad_selector_never_matches() {
        let theme = Theme::new(
            None,
            vec![ThemeSetting::new("a >> b").foreground(X), ThemeSetting::new("b").foreground(Y)],
            &[],
        );
        assert_eq!(theme.rules().len(), 1);
        let style = theme.resolve_style(&["a", "b"]).unwrap();
        assert_eq!(theme.color(style.foreground.unwrap()), Some(Y));
    }

    #[test]
    fn test_defaults_and_memoization() {
        let theme = theme();
        assert_eq!(theme.color(theme.defaults().foreground.unwrap()), Some(Rgb::new(1, 1, 1)));
        let first = theme.resolve_style(&["comment.line"]);
        let second = theme.resolve_style(&["comment.line"]);
        assert_eq!(first, second);
        assert_eq!(theme.cache.lock().len(), 1);
    }

    #[test]
    fn test_seed_colors_get_first_ids() {
        let theme = Theme::new(None, vec![ThemeSetting::new("a").foreground(Y)], &[X]);
        assert_eq!(theme.color_map().get_id(X), Some(1));
        assert_eq!(theme.color_map().get_id(Y), Some(2));
    }
}
