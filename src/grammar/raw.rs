//! Raw grammar tree as found in `.tmLanguage.json` files

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use rustc_hash::FxHashMap;
use serde::{Deserialize, Deserializer};

use crate::error::GrammarLoadError;

/// Capture index (as a string key) to capture rule
pub type RawCaptures = FxHashMap<String, RawRule>;

pub type RawRepository = FxHashMap<String, RawRule>;

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawGrammar {
    pub scope_name: Option<String>,
    pub name: Option<String>,
    #[serde(default)]
    pub patterns: Vec<RawRule>,
    #[serde(default)]
    pub repository: RawRepository,
    /// Selector to rule, iterated in key order
    #[serde(default)]
    pub injections: BTreeMap<String, RawRule>,
    pub injection_selector: Option<String>,
    /// Scopes this grammar injects itself into
    #[serde(default)]
    pub inject_to: Vec<String>,
    #[serde(default)]
    pub file_types: Vec<String>,
    pub first_line_match: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawRule {
    pub include: Option<String>,
    pub name: Option<String>,
    pub content_name: Option<String>,
    #[serde(rename = "match")]
    pub match_: Option<String>,
    pub captures: Option<RawCaptures>,
    pub begin: Option<String>,
    pub begin_captures: Option<RawCaptures>,
    pub end: Option<String>,
    pub end_captures: Option<RawCaptures>,
    #[serde(rename = "while")]
    pub while_: Option<String>,
    pub while_captures: Option<RawCaptures>,
    pub patterns: Option<Vec<RawRule>>,
    pub repository: Option<RawRepository>,
    #[serde(default, deserialize_with = "flag")]
    pub apply_end_pattern_last: bool,
}

/// Grammars write boolean flags as either `true` or `1`
fn flag<'de, D: Deserializer<'de>>(deserializer: D) -> Result<bool, D::Error> {
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Flag {
        Bool(bool),
        Int(i64),
    }
    Ok(match Flag::deserialize(deserializer)? {
        Flag::Bool(b) => b,
        Flag::Int(i) => i != 0,
    })
}

impl RawGrammar {
    /// Parse and validate a JSON grammar
    pub fn from_json(json: &str) -> Result<Self, GrammarLoadError> {
        let grammar: RawGrammar = serde_json::from_str(json)?;
        grammar.validate()?;
        Ok(grammar)
    }

    pub fn from_path(path: &Path) -> Result<Self, GrammarLoadError> {
        let contents = fs::read_to_string(path).map_err(|source| GrammarLoadError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_json(&contents)
    }

    pub fn scope_name(&self) -> &str {
        self.scope_name.as_deref().unwrap_or_default()
    }

    /// Check the tree is complete enough to compile
    pub fn validate(&self) -> Result<(), GrammarLoadError> {
        if self.scope_name.as_deref().map_or(true, |s| s.trim().is_empty()) {
            return Err(GrammarLoadError::MissingScopeName);
        }
        for (i, rule) in self.patterns.iter().enumerate() {
            rule.validate(&format!("patterns[{i}]"))?;
        }
        for (name, rule) in &self.repository {
            rule.validate(&format!("repository.{name}"))?;
        }
        for (selector, rule) in &self.injections {
            rule.validate(&format!("injections[{selector:?}]"))?;
        }
        Ok(())
    }
}

impl RawRule {
    fn validate(&self, path: &str) -> Result<(), GrammarLoadError> {
        let malformed = |reason: &str| GrammarLoadError::MalformedRule {
            path: path.to_string(),
            reason: reason.to_string(),
        };
        if self.include.is_none() && self.match_.is_none() {
            match (&self.begin, &self.end, &self.while_) {
                (Some(_), None, None) => return Err(malformed("`begin` without `end` or `while`")),
                (Some(_), Some(_), Some(_)) => return Err(malformed("both `end` and `while`")),
                (None, Some(_), _) => return Err(malformed("`end` without `begin`")),
                (None, _, Some(_)) => return Err(malformed("`while` without `begin`")),
                _ => {}
            }
        }
        if let Some(include) = &self.include {
            if include.is_empty() {
                return Err(malformed("empty include"));
            }
        }

        if let Some(patterns) = &self.patterns {
            for (i, rule) in patterns.iter().enumerate() {
                rule.validate(&format!("{path}.patterns[{i}]"))?;
            }
        }
        if let Some(repository) = &self.repository {
            for (name, rule) in repository {
                rule.validate(&format!("{path}.repository.{name}"))?;
            }
        }
        let captures = [
            ("captures", &self.captures),
            ("beginCaptures", &self.begin_captures),
            ("endCaptures", &self.end_captures),
            ("whileCaptures", &self.while_captures),
        ];
        for (field, captures) in captures {
            for (key, rule) in captures.iter().flatten() {
                if key.parse::<usize>().is_err() {
                    return Err(malformed(&format!("non numeric {field} key {key:?}")));
                }
                rule.validate(&format!("{path}.{field}.{key}"))?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_grammar() {
        let grammar = RawGrammar::from_json(
            r##"{
                "scopeName": "source.test",
                "fileTypes": ["test"],
                "patterns": [
                    { "include": "#comment" },
                    { "match": "\\d+", "name": "constant.numeric" }
                ],
                "repository": {
                    "comment": {
                        "begin": "/\\*", "end": "\\*/", "name": "comment.block",
                        "applyEndPatternLast": 1,
                        "beginCaptures": { "0": { "name": "punctuation" } }
                    }
                },
                "injections": { "L:comment": { "patterns": [] } }
            }"##,
        )
        .unwrap();

        assert_eq!(grammar.scope_name(), "source.test");
        assert_eq!(grammar.patterns.len(), 2);
        let comment = &grammar.repository["comment"];
        assert!(comment.apply_end_pattern_last);
        assert!(comment.begin_captures.as_ref().unwrap().contains_key("0"));
        assert_eq!(grammar.injections.len(), 1);
        assert_eq!(grammar.file_types, vec!["test".to_string()]);
    }

    #[test]
    fn test_missing_scope_name() {
        assert!(matches!(
            RawGrammar::from_json(r#"{ "patterns": [] }"#),
            Err(GrammarLoadError::MissingScopeName)
        ));
        assert!(matches!(
            RawGrammar::from_json(r#"{ "scopeName": " " }"#),
            Err(GrammarLoadError::MissingScopeName)
        ));
    }

    #[test]
    fn test_malformed_rules() {
        let err = RawGrammar::from_json(
            r#"{ "scopeName": "source.x", "repository": { "s": { "patterns": [ { "begin": "a" } ] } } }"#,
        )
        .unwrap_err();
        match err {
            GrammarLoadError::MalformedRule { path, .. } => assert_eq!(path, "repository.s.patterns[0]"),
            other => panic!("unexpected error {other:?}"),
        }

        assert!(RawGrammar::from_json(r#"{ "scopeName": "source.x", "patterns": [ { "end": "a" } ] }"#).is_err());
        assert!(RawGrammar::from_json(
            r#"{ "scopeName": "source.x", "patterns": [ { "match": "a", "captures": { "one": {} } } ] }"#
        )
        .is_err());
    }

    #[test]
    fn test_invalid_json() {
        assert!(matches!(RawGrammar::from_json("{"), Err(GrammarLoadError::Parse(_))));
    }

    #[test]
    fn test_from_path() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("x.tmLanguage.json");
        fs::write(&path, r#"{ "scopeName": "source.x", "patterns": [] }"#).unwrap();
        assert_eq!(RawGrammar::from_path(&path).unwrap().scope_name(), "source.x");
        assert!(matches!(
            RawGrammar::from_path(&dir.path().join("missing.json")),
            Err(GrammarLoadError::Io { .. })
        ));
    }
}
