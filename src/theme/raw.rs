//! JSON themes

use serde::Deserialize;
use tracing::warn;

use super::{Rgb, Theme, ThemeSetting};
use crate::error::ThemeError;
use crate::grammar::attrs::FontStyle;

#[derive(Debug, Deserialize)]
struct RawTheme {
    name: Option<String>,
    #[serde(default, alias = "tokenColors")]
    settings: Vec<RawThemeSetting>,
}

#[derive(Debug, Deserialize)]
struct RawThemeSetting {
    scope: Option<RawScope>,
    #[serde(default)]
    settings: RawStyle,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum RawScope {
    One(String),
    Many(Vec<String>),
}

#[derive(Debug, Default, Deserialize)]
struct RawStyle {
    foreground: Option<String>,
    background: Option<String>,
    #[serde(rename = "fontStyle")]
    font_style: Option<String>,
}

fn color(value: Option<&str>) -> Option<Rgb> {
    let value = value?;
    match Rgb::from_hex(value) {
        Ok(rgb) => Some(rgb),
        Err(e) => {
            warn!(value, error = %e, "ignoring theme color");
            None
        }
    }
}

pub(super) fn parse_json(json: &str) -> Result<Theme, ThemeError> {
    let raw: RawTheme = serde_json::from_str(json)?;
    let settings = raw.settings.into_iter().map(|setting| ThemeSetting {
        selector: setting.scope.map(|scope| match scope {
            RawScope::One(s) => s,
            RawScope::Many(list) => list.join(", "),
        }),
        foreground: color(setting.settings.foreground.as_deref()),
        background: color(setting.settings.background.as_deref()),
        font_style: setting.settings.font_style.as_deref().map(FontStyle::parse),
        ..Default::default()
    });
    Ok(Theme::new(raw.name, settings, &[]))
}
