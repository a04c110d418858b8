//! CSS stylesheet themes
//!
//! ```css
//! .comment { color: rgb(0, 128, 0); font-style: italic; }
//! .storage.invalid { background-color: red; }
//! * { color: #d4d4d4; background-color: #1e1e1e; }
//! ```
//!
//! Class names match the dot segments of scopes: `.storage.invalid` applies to
//! `storage.invalid`, `invalid.storage` and `storage.modifier invalid.deprecated`
//! alike. Rules naming more classes win. The `*` and `.editor` rules set the
//! theme defaults.

use tracing::warn;

use super::{Rgb, Theme, ThemeSetting};
use crate::error::ThemeError;

pub(super) fn parse(css: &str) -> Result<Theme, ThemeError> {
    let css = strip_comments(css)?;
    let mut settings = Vec::new();
    let mut rest = css.as_str();
    let mut offset = 0;

    loop {
        let trimmed = rest.trim_start();
        offset += rest.len() - trimmed.len();
        rest = trimmed;
        if rest.is_empty() {
            break;
        }

        let open = rest.find('{').ok_or_else(|| ThemeError::Css {
            offset,
            message: "expected '{'".to_string(),
        })?;
        let close = rest[open..].find('}').map(|i| open + i).ok_or_else(|| ThemeError::Css {
            offset: offset + open,
            message: "unterminated block".to_string(),
        })?;

        let selectors = rest[..open].trim();
        if selectors.is_empty() {
            return Err(ThemeError::Css {
                offset,
                message: "missing selector".to_string(),
            });
        }
        let declarations = declarations(&rest[open + 1..close]);

        for selector in selectors.split(',') {
            let mut setting = declarations.clone();
            setting.selector = scope_selector(selector.trim());
            settings.push(setting);
        }

        offset += close + 1;
        rest = &rest[close + 1..];
    }

    Ok(Theme::new(None, settings, &[]))
}

fn strip_comments(css: &str) -> Result<String, ThemeError> {
    let mut out = String::with_capacity(css.len());
    let mut rest = css;
    while let Some(start) = rest.find("/*") {
        out.push_str(&rest[..start]);
        let end = rest[start + 2..].find("*/").ok_or_else(|| ThemeError::Css {
            offset: css.len() - rest.len() + start,
            message: "unterminated comment".to_string(),
        })?;
        // Keep offsets stable for error messages
        out.extend(std::iter::repeat(' ').take(end + 4));
        rest = &rest[start + 2 + end + 2..];
    }
    out.push_str(rest);
    Ok(out)
}

/// `.a.b .c` becomes the class selector `.a.b.c`. `None` marks the defaults.
fn scope_selector(selector: &str) -> Option<String> {
    if selector == "*" || selector == ".editor" {
        return None;
    }
    let classes: String = selector
        .split(|c: char| c.is_whitespace() || c == '.')
        .filter(|class| !class.is_empty())
        .flat_map(|class| [".", class])
        .collect();
    Some(classes)
}

fn declarations(block: &str) -> ThemeSetting {
    let mut setting = ThemeSetting::default();
    for declaration in block.split(';') {
        let Some((property, value)) = declaration.split_once(':') else {
            continue;
        };
        let property = property.trim().to_ascii_lowercase();
        let value = value.trim();
        match property.as_str() {
            "color" => setting.foreground = color(value),
            "background-color" | "background" => setting.background = color(value),
            "font-weight" => setting.bold = Some(value == "bold" || value.parse::<u16>().is_ok_and(|w| w >= 600)),
            "font-style" => setting.italic = Some(value == "italic" || value == "oblique"),
            "text-decoration" => {
                setting.underline = Some(value.contains("underline"));
                setting.strikethrough = Some(value.contains("line-through"));
            }
            _ => {}
        }
    }
    setting
}

fn color(value: &str) -> Option<Rgb> {
    match value.parse() {
        Ok(rgb) => Some(rgb),
        Err(e) => {
            warn!(value, error = %e, "ignoring stylesheet color");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn background(theme: &Theme, names: &[&str]) -> Option<Rgb> {
        theme
            .resolve_style(names)
            .and_then(|style| style.background)
            .and_then(|id| theme.color(id))
    }

    #[test]
    fn test_class_specificity() {
        let theme = Theme::from_css(
            ".invalid { background-color: rgb(255,128,128); }\n\
             .storage.invalid { background-color: red; }",
        )
        .unwrap();

        assert_eq!(theme.resolve_style(&["undefined"]), None);
        assert_eq!(background(&theme, &["invalid"]), Some(Rgb::new(255, 128, 128)));
        assert_eq!(background(&theme, &["storage", "invalid"]), Some(Rgb::new(255, 0, 0)));
        assert_eq!(
            background(&theme, &["storage", "modifier", "invalid", "deprecated"]),
            Some(Rgb::new(255, 0, 0))
        );
        assert_eq!(
            background(&theme, &["source.java", "storage.modifier", "invalid.deprecated"]),
            Some(Rgb::new(255, 0, 0))
        );
    }

    #[test]
    fn test_classes_are_unordered() {
        let theme = Theme::from_css(
            ".invalid { background-color: rgb(255,128,128); }\n\
             .storage.invalid { background-color: red; }",
        )
        .unwrap();

        assert_eq!(background(&theme, &["source", "storage.invalid"]), Some(Rgb::new(255, 0, 0)));
        assert_eq!(background(&theme, &["source", "invalid.storage"]), Some(Rgb::new(255, 0, 0)));
        assert_eq!(background(&theme, &["invalid.deprecated", "storage"]), Some(Rgb::new(255, 0, 0)));
        assert_eq!(background(&theme, &["source", "markup.invalid"]), Some(Rgb::new(255, 128, 128)));
        assert_eq!(background(&theme, &["source", "invalidated"]), None);
    }

    #[test]
    fn test_declarations() {
        let theme = Theme::from_css(
            "/* header */\n\
             * { color: #d4d4d4; background-color: #1e1e1e }\n\
             .comment, .string.quoted { color: green; font-style: italic; }\n\
             .keyword { font-weight: bold; text-decoration: underline line-through; color: nope }",
        )
        .unwrap();

        assert_eq!(theme.color(theme.defaults().foreground.unwrap()), Some(Rgb::new(0xd4, 0xd4, 0xd4)));
        assert_eq!(theme.rules().len(), 3);

        let comment = theme.resolve_style(&["comment.line"]).unwrap();
        assert_eq!(comment.italic, Some(true));
        assert_eq!(theme.color(comment.foreground.unwrap()), Some(Rgb::new(0, 128, 0)));
        assert!(theme.resolve_style(&["string", "quoted"]).is_some());

        let keyword = theme.resolve_style(&["keyword"]).unwrap();
        assert_eq!(keyword.bold, Some(true));
        assert_eq!(keyword.underline, Some(true));
        assert_eq!(keyword.strikethrough, Some(true));
        assert_eq!(keyword.foreground, None);
    }

    #[test]
    fn test_syntax_errors() {
        assert!(matches!(Theme::from_css(".a { color: red;"), Err(ThemeError::Css { .. })));
        assert!(matches!(Theme::from_css(".a color: red; }"), Err(ThemeError::Css { .. })));
        assert!(matches!(Theme::from_css("{ color: red }"), Err(ThemeError::Css { .. })));
        assert!(matches!(Theme::from_css("/* open"), Err(ThemeError::Css { .. })));
    }
}
