//! Token attributes
//!
//! Every token carries one `u32` of metadata. Layout, most significant bit first:
//!
//! ```text
//! | language (8) | token type (2) | font style (4) | background (9) | foreground (9) |
//!  31        24   23          22   21          18   17           9   8            0
//! ```
//!
//! A zero field always means "unset", so a color id of 0 inherits the theme default.

use std::fmt;

use parking_lot::Mutex;
use regex::Regex;
use rustc_hash::FxHashMap;

const FOREGROUND_OFFSET: u32 = 0;
const BACKGROUND_OFFSET: u32 = 9;
const FONT_STYLE_OFFSET: u32 = 18;
const TOKEN_TYPE_OFFSET: u32 = 22;
const LANGUAGE_OFFSET: u32 = 24;

const FOREGROUND_MASK: u32 = 0x1FF << FOREGROUND_OFFSET;
const BACKGROUND_MASK: u32 = 0x1FF << BACKGROUND_OFFSET;
const FONT_STYLE_MASK: u32 = 0xF << FONT_STYLE_OFFSET;
const TOKEN_TYPE_MASK: u32 = 0x3 << TOKEN_TYPE_OFFSET;
const LANGUAGE_MASK: u32 = 0xFF << LANGUAGE_OFFSET;

/// Largest color id that fits in the encoding
pub const MAX_COLOR_ID: u16 = 0x1FF;

bitflags::bitflags! {
    /// Font style flags. An empty set means "not set".
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct FontStyle: u8 {
        const ITALIC = 1;
        const BOLD = 1 << 1;
        const UNDERLINE = 1 << 2;
        const STRIKETHROUGH = 1 << 3;
    }
}

impl FontStyle {
    /// Parse a TextMate `fontStyle` value such as `"bold italic"`
    pub fn parse(value: &str) -> Self {
        value
            .split_whitespace()
            .fold(FontStyle::empty(), |style, word| match word {
                "italic" => style | FontStyle::ITALIC,
                "bold" => style | FontStyle::BOLD,
                "underline" => style | FontStyle::UNDERLINE,
                "strikethrough" => style | FontStyle::STRIKETHROUGH,
                _ => style,
            })
    }
}

/// Standard token types understood by editors (bracket matching, comment toggling)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum StandardTokenType {
    #[default]
    Other = 0,
    Comment = 1,
    String = 2,
    RegEx = 3,
}

impl StandardTokenType {
    /// Get a human-readable name for this token type
    pub fn name(&self) -> &'static str {
        match self {
            StandardTokenType::Other => "other",
            StandardTokenType::Comment => "comment",
            StandardTokenType::String => "string",
            StandardTokenType::RegEx => "regex",
        }
    }

    /// Parse a token type from its name (for grammar configuration)
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "other" => Some(StandardTokenType::Other),
            "comment" => Some(StandardTokenType::Comment),
            "string" => Some(StandardTokenType::String),
            "regex" => Some(StandardTokenType::RegEx),
            _ => None,
        }
    }

    fn from_bits(bits: u32) -> Self {
        match bits & 0x3 {
            1 => StandardTokenType::Comment,
            2 => StandardTokenType::String,
            3 => StandardTokenType::RegEx,
            _ => StandardTokenType::Other,
        }
    }
}

/// Decoded form of the metadata word
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct TokenAttributes {
    pub language_id: u8,
    pub token_type: StandardTokenType,
    pub font_style: FontStyle,
    /// Foreground color id, at most [`MAX_COLOR_ID`]
    pub foreground: u16,
    /// Background color id, at most [`MAX_COLOR_ID`]
    pub background: u16,
}

impl TokenAttributes {
    pub fn encode(&self) -> u32 {
        ((self.language_id as u32) << LANGUAGE_OFFSET)
            | ((self.token_type as u32) << TOKEN_TYPE_OFFSET)
            | (((self.font_style.bits() as u32) << FONT_STYLE_OFFSET) & FONT_STYLE_MASK)
            | (((self.background as u32) << BACKGROUND_OFFSET) & BACKGROUND_MASK)
            | (((self.foreground as u32) << FOREGROUND_OFFSET) & FOREGROUND_MASK)
    }

    pub fn decode(metadata: u32) -> Self {
        Self {
            language_id: ((metadata & LANGUAGE_MASK) >> LANGUAGE_OFFSET) as u8,
            token_type: StandardTokenType::from_bits((metadata & TOKEN_TYPE_MASK) >> TOKEN_TYPE_OFFSET),
            font_style: FontStyle::from_bits_truncate(
                ((metadata & FONT_STYLE_MASK) >> FONT_STYLE_OFFSET) as u8,
            ),
            background: ((metadata & BACKGROUND_MASK) >> BACKGROUND_OFFSET) as u16,
            foreground: ((metadata & FOREGROUND_MASK) >> FOREGROUND_OFFSET) as u16,
        }
    }
}

pub fn language_id(metadata: u32) -> u8 {
    ((metadata & LANGUAGE_MASK) >> LANGUAGE_OFFSET) as u8
}

pub fn token_type(metadata: u32) -> StandardTokenType {
    StandardTokenType::from_bits((metadata & TOKEN_TYPE_MASK) >> TOKEN_TYPE_OFFSET)
}

pub fn font_style(metadata: u32) -> FontStyle {
    FontStyle::from_bits_truncate(((metadata & FONT_STYLE_MASK) >> FONT_STYLE_OFFSET) as u8)
}

pub fn foreground(metadata: u32) -> u16 {
    ((metadata & FOREGROUND_MASK) >> FOREGROUND_OFFSET) as u16
}

pub fn background(metadata: u32) -> u16 {
    ((metadata & BACKGROUND_MASK) >> BACKGROUND_OFFSET) as u16
}

/// Overlay fields on existing metadata. `None` and zero color ids leave the
/// existing value in place.
pub fn merge(
    metadata: u32,
    language_id: Option<u8>,
    token_type: Option<StandardTokenType>,
    font_style: Option<FontStyle>,
    foreground: u16,
    background: u16,
) -> u32 {
    let mut attrs = TokenAttributes::decode(metadata);
    if let Some(language_id) = language_id.filter(|id| *id != 0) {
        attrs.language_id = language_id;
    }
    if let Some(token_type) = token_type {
        attrs.token_type = token_type;
    }
    if let Some(font_style) = font_style {
        attrs.font_style = font_style;
    }
    if foreground != 0 {
        attrs.foreground = foreground;
    }
    if background != 0 {
        attrs.background = background;
    }
    attrs.encode()
}

/// Wrapper that prints a metadata word field by field
pub struct DisplayMetadata(pub u32);

impl fmt::Display for DisplayMetadata {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let attrs = TokenAttributes::decode(self.0);
        write!(
            f,
            "lang={} type={} font={:?} fg={} bg={}",
            attrs.language_id,
            attrs.token_type.name(),
            attrs.font_style,
            attrs.foreground,
            attrs.background
        )
    }
}

/// Attributes that depend on a single scope name only
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BasicScopeAttributes {
    pub language_id: u8,
    /// `None` when the scope does not imply a token type
    pub token_type: Option<StandardTokenType>,
}

/// Maps scope names to language ids and standard token types, caching the result
pub struct ScopeAttributesProvider {
    default_language: u8,
    embedded: Option<(Regex, FxHashMap<String, u8>)>,
    standard_type: Regex,
    cache: Mutex<FxHashMap<String, BasicScopeAttributes>>,
}

impl ScopeAttributesProvider {
    pub fn new(default_language: u8, embedded_languages: &FxHashMap<String, u8>) -> Self {
        let embedded = if embedded_languages.is_empty() {
            None
        } else {
            let mut scopes: Vec<&String> = embedded_languages.keys().collect();
            // Longer prefixes first so `source.js.regexp` wins over `source.js`
            scopes.sort_by(|a, b| b.len().cmp(&a.len()).then_with(|| a.cmp(b)));
            let alternation = scopes
                .iter()
                .map(|s| regex::escape(s))
                .collect::<Vec<_>>()
                .join("|");
            Regex::new(&format!(r"^(?:{alternation})(?:\.|$)"))
                .ok()
                .map(|re| (re, embedded_languages.clone()))
        };
        Self {
            default_language,
            embedded,
            standard_type: Regex::new(r"\b(comment|string|regex|meta\.embedded)\b")
                .expect("static pattern"),
            cache: Mutex::new(FxHashMap::default()),
        }
    }

    pub fn default_attributes(&self) -> BasicScopeAttributes {
        BasicScopeAttributes {
            language_id: self.default_language,
            token_type: Some(StandardTokenType::Other),
        }
    }

    pub fn attributes(&self, scope_name: &str) -> BasicScopeAttributes {
        if let Some(cached) = self.cache.lock().get(scope_name) {
            return *cached;
        }
        let attrs = BasicScopeAttributes {
            language_id: self.language_for(scope_name),
            token_type: self.standard_type_for(scope_name),
        };
        self.cache.lock().insert(scope_name.to_string(), attrs);
        attrs
    }

    fn language_for(&self, scope_name: &str) -> u8 {
        let Some((re, languages)) = &self.embedded else {
            return self.default_language;
        };
        re.find(scope_name)
            .map(|m| m.as_str().trim_end_matches('.'))
            .and_then(|prefix| languages.get(prefix).copied())
            .unwrap_or(self.default_language)
    }

    fn standard_type_for(&self, scope_name: &str) -> Option<StandardTokenType> {
        let captures = self.standard_type.captures(scope_name)?;
        match captures.get(1)?.as_str() {
            "comment" => Some(StandardTokenType::Comment),
            "string" => Some(StandardTokenType::String),
            "regex" => Some(StandardTokenType::RegEx),
            _ => Some(StandardTokenType::Other),
        }
    }
}

impl fmt::Debug for ScopeAttributesProvider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ScopeAttributesProvider")
            .field("default_language", &self.default_language)
            .finish_non_exhaustive()
    }
}
