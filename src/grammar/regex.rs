//! Oniguruma regex adapter
//!
//! Grammar patterns are Oniguruma expressions. Two anchors depend on where a
//! search starts: `\A` may only match on the first line of a document and `\G`
//! only at the position where the previous match of the enclosing rule ended.
//! When a search is not allowed to use one of them it runs a variant of the
//! pattern where the anchor is replaced with a character that never occurs in
//! text. Variants are compiled on first use.

use std::sync::OnceLock;

use onig::{Region, RegexOptions, SearchOptions, Syntax};
use regex::Regex;
use tracing::warn;

/// Byte spans of every capture group, `None` for groups that did not take part
pub type CaptureSpans = Vec<Option<(usize, usize)>>;

/// Stands in for an anchor that may not match
const NEVER: &str = "\u{FFFF}";

#[derive(Debug)]
pub struct RegexSource {
    source: String,
    has_anchor: bool,
    has_back_references: bool,
    /// Indexed by `allow_a | allow_g << 1`
    variants: [OnceLock<Option<onig::Regex>>; 4],
}

impl RegexSource {
    /// Compile `source`, failing if it is not a valid expression.
    ///
    /// A pattern with back references is never searched as is, only after
    /// [`resolve_back_references`](Self::resolve_back_references). It is
    /// checked with each reference standing for an empty group.
    pub fn new(source: &str) -> Result<Self, onig::Error> {
        let source = rewrite_end_of_text(source);
        let has_back_references = back_reference_pattern().is_match(&source);
        let variants: [OnceLock<Option<onig::Regex>>; 4] = Default::default();
        if has_back_references {
            compile(&back_reference_pattern().replace_all(&source, "(?:)"))?;
        } else {
            let _ = variants[3].set(Some(compile(&source)?));
        }
        Ok(Self {
            has_anchor: scan_anchors(&source),
            has_back_references,
            source,
            variants,
        })
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn has_back_references(&self) -> bool {
        self.has_back_references
    }

    fn regex(&self, allow_a: bool, allow_g: bool) -> Option<&onig::Regex> {
        if self.has_back_references {
            return None;
        }
        let index = if self.has_anchor {
            usize::from(allow_a) | usize::from(allow_g) << 1
        } else {
            3
        };
        self.variants[index]
            .get_or_init(|| {
                let pattern = replace_anchors(&self.source, allow_a, allow_g);
                compile(&pattern)
                    .map_err(|e| warn!(pattern = %self.source, error = %e, "anchor variant failed to compile"))
                    .ok()
            })
            .as_ref()
    }

    /// Search `text` from byte offset `start`
    pub fn search(&self, text: &str, start: usize, allow_a: bool, allow_g: bool) -> Option<CaptureSpans> {
        let regex = self.regex(allow_a, allow_g)?;
        let mut region = Region::new();
        regex.search_with_options(
            text,
            start,
            text.len(),
            SearchOptions::SEARCH_OPTION_NONE,
            Some(&mut region),
        )?;
        Some((0..region.len()).map(|i| region.pos(i)).collect())
    }

    /// Substitute `\N` back references with the escaped text of capture `N`
    pub fn resolve_back_references(&self, line: &str, captures: &[Option<(usize, usize)>]) -> String {
        back_reference_pattern()
            .replace_all(&self.source, |caps: &regex::Captures<'_>| {
                let text = caps[1]
                    .parse::<usize>()
                    .ok()
                    .and_then(|i| captures.get(i).copied().flatten())
                    .and_then(|(start, end)| line.get(start..end))
                    .unwrap_or_default();
                escape(text)
            })
            .into_owned()
    }
}

/// Result of scanning a pattern list
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScanMatch {
    /// Index of the winning pattern
    pub index: usize,
    pub captures: CaptureSpans,
}

impl ScanMatch {
    pub fn start(&self) -> usize {
        self.captures[0].map_or(0, |(start, _)| start)
    }

    pub fn end(&self) -> usize {
        self.captures[0].map_or(0, |(_, end)| end)
    }
}

/// Earliest match of any pattern at or after `start`, ties going to the
/// pattern listed first.
pub fn find_best_match<'r>(
    patterns: impl IntoIterator<Item = &'r RegexSource>,
    text: &str,
    start: usize,
    anchor: Option<usize>,
    first_line: bool,
) -> Option<ScanMatch> {
    let allow_g = anchor == Some(start);
    let mut best: Option<ScanMatch> = None;
    for (index, pattern) in patterns.into_iter().enumerate() {
        let Some(captures) = pattern.search(text, start, first_line, allow_g) else {
            continue;
        };
        if captures.first().copied().flatten().is_none() {
            continue;
        }
        let found = ScanMatch { index, captures };
        if best.as_ref().map_or(true, |b| found.start() < b.start()) {
            let at_start = found.start() == start;
            best = Some(found);
            if at_start {
                break;
            }
        }
    }
    best
}

fn compile(pattern: &str) -> Result<onig::Regex, onig::Error> {
    onig::Regex::with_options(pattern, RegexOptions::REGEX_OPTION_CAPTURE_GROUP, Syntax::default())
}

fn back_reference_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"\\(\d+)").expect("static pattern"))
}

fn escape(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        if "-\\{}*+?|^$.,[]()#".contains(c) || c.is_whitespace() {
            out.push('\\');
        }
        out.push(c);
    }
    out
}

/// Lines are searched with a trailing newline, so `\z` must not match before it
fn rewrite_end_of_text(source: &str) -> String {
    rewrite_escapes(source, |c| (c == 'z').then_some("$(?!\\n)(?<!\\n)"))
}

fn scan_anchors(source: &str) -> bool {
    let mut found = false;
    rewrite_escapes(source, |c| {
        found |= c == 'A' || c == 'G';
        None
    });
    found
}

fn replace_anchors(source: &str, allow_a: bool, allow_g: bool) -> String {
    rewrite_escapes(source, |c| match c {
        'A' if !allow_a => Some(NEVER),
        'G' if !allow_g => Some(NEVER),
        _ => None,
    })
}

/// Walk the escape sequences of `source`, replacing `\c` with whatever `f`
/// returns for `c`.
fn rewrite_escapes(source: &str, mut f: impl FnMut(char) -> Option<&'static str>) -> String {
    let mut out = String::with_capacity(source.len());
    let mut chars = source.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some(next) => match f(next) {
                Some(replacement) => out.push_str(replacement),
                None => {
                    out.push('\\');
                    out.push(next);
                }
            },
            None => out.push('\\'),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn re(pattern: &str) -> RegexSource {
        RegexSource::new(pattern).unwrap()
    }

    #[test]
    fn test_search_captures() {
        let r = re(r"(a)(x)?(b)");
        assert_eq!(
            r.search("zzab", 0, true, true),
            Some(vec![Some((2, 4)), Some((2, 3)), None, Some((3, 4))])
        );
        assert_eq!(r.search("zzab", 3, true, true), None);
    }

    #[test]
    fn test_invalid_pattern() {
        assert!(RegexSource::new("(unclosed").is_err());
    }

    #[test]
    fn test_g_anchor() {
        let r = re(r"\Gfoo");
        assert!(r.search("xfoo", 1, false, true).is_some());
        assert!(r.search("xfoo", 1, false, false).is_none());
        assert_eq!(
            find_best_match([&r], "xfoo", 1, Some(1), false).map(|m| m.index),
            Some(0)
        );
        assert!(find_best_match([&r], "xfoo", 1, Some(0), false).is_none());
        assert!(find_best_match([&r], "xfoo", 1, None, false).is_none());
    }

    #[test]
    fn test_a_anchor() {
        let r = re(r"\A#!");
        assert!(r.search("#!/bin/sh\n", 0, true, false).is_some());
        assert!(r.search("#!/bin/sh\n", 0, false, false).is_none());
    }

    #[test]
    fn test_escaped_backslash_is_not_an_anchor() {
        let r = re(r"\\G");
        assert!(!r.has_anchor);
        assert!(r.search(r"a\G", 0, false, false).is_some());
    }

    #[test]
    fn test_end_of_text_ignores_appended_newline() {
        let r = re(r"a\z");
        assert!(r.search("a\n", 0, false, false).is_none());
        assert!(r.search("a", 0, false, false).is_some());
    }

    #[test]
    fn test_earliest_match_wins() {
        let patterns = [re("c"), re("b"), re("bc")];
        let found = find_best_match(&patterns, "abc", 0, None, false).unwrap();
        assert_eq!(found.index, 1);
        assert_eq!((found.start(), found.end()), (1, 2));
        assert!(find_best_match(&patterns, "xyz", 0, None, false).is_none());
    }

    #[test]
    fn test_back_references() {
        let begin = re(r"<<(\w+)");
        let end = re(r"^\1$");
        assert!(end.has_back_references());
        let line = "x <<EOF";
        let captures = begin.search(line, 0, false, false).unwrap();
        assert_eq!(end.resolve_back_references(line, &captures), "^EOF$");

        let captures = vec![Some((0, 3))];
        assert_eq!(end.resolve_back_references("a.b", &captures), "^$");
        assert_eq!(re(r"\0").resolve_back_references("a.b", &captures), r"a\.b");
    }

    #[test]
    fn test_back_referenced_pattern_is_only_searched_resolved() {
        let end = re(r"^\1+$");
        assert_eq!(end.search("EOF", 0, false, false), None);
        let resolved = re(&end.resolve_back_references("x <<EOF", &[None, Some((4, 7))]));
        assert!(!resolved.has_back_references());
        assert!(resolved.search("EOFF", 0, false, false).is_some());
        assert!(resolved.search("EOFEOF", 0, false, false).is_none());
        assert!(RegexSource::new(r"(\1").is_err());
    }
}
