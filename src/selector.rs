//! Scope selectors
//!
//! Selectors decide whether a theme rule or a grammar injection applies to a
//! scope path. The syntax is the TextMate one:
//!
//! - `a.b c` matches when a scope matching `a.b` is an ancestor of one matching `c`
//! - `a, b` (or `a | b`) matches either alternative
//! - `-a` or `!a` excludes paths containing `a`
//! - `(...)` groups
//! - `L:` and `R:` prefixes raise or lower an alternative's priority
//!
//! Atoms match on dot boundaries: `string.quoted` matches `string.quoted.double`
//! but not `string.quotedx`.

use std::fmt;

use regex::Regex;

use crate::error::SelectorError;

/// Priority of one selector alternative
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub enum Priority {
    /// Excluding branches and `L:` selectors
    Low = -1,
    #[default]
    Normal = 0,
    /// `R:` selectors
    High = 1,
}

impl Priority {
    pub fn value(self) -> i8 {
        self as i8
    }
}

/// How closely a selector matched a scope path. Compares greater when more specific.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Specificity {
    /// One past the index of the deepest frame an atom matched
    pub depth: usize,
    /// Number of dot segments in the atom that matched deepest
    pub atom_segments: usize,
    /// Number of atoms in the matching descendant chain
    pub atoms: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SelectorMatch {
    pub priority: Priority,
    pub specificity: Specificity,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Matcher {
    /// Descendant chain, outermost atom first
    Path(Vec<String>),
    Not(Box<Matcher>),
    And(Vec<Matcher>),
    Or(Vec<Matcher>),
}

impl Matcher {
    pub fn evaluate<S: AsRef<str>>(&self, scopes: &[S]) -> Option<Specificity> {
        match self {
            Matcher::Path(atoms) => match_path(atoms, scopes),
            Matcher::Not(inner) => match inner.evaluate(scopes) {
                Some(_) => None,
                None => Some(Specificity::default()),
            },
            Matcher::And(all) => all
                .iter()
                .try_fold(Specificity::default(), |best, m| m.evaluate(scopes).map(|s| best.max(s))),
            Matcher::Or(any) => any.iter().filter_map(|m| m.evaluate(scopes)).max(),
        }
    }
}

impl fmt::Display for Matcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Matcher::Path(atoms) => write!(f, "{}", atoms.join(" ")),
            Matcher::Not(inner) => write!(f, "-{inner}"),
            Matcher::And(all) => {
                for (i, m) in all.iter().enumerate() {
                    if i > 0 {
                        f.write_str(" ")?;
                    }
                    write!(f, "{m}")?;
                }
                Ok(())
            }
            Matcher::Or(any) => {
                f.write_str("(")?;
                for (i, m) in any.iter().enumerate() {
                    if i > 0 {
                        f.write_str(" | ")?;
                    }
                    write!(f, "{m}")?;
                }
                f.write_str(")")
            }
        }
    }
}

/// `scope` matches `atom` exactly or extends it past a dot
pub fn atom_matches(atom: &str, scope: &str) -> bool {
    if let Some(prefix) = atom.strip_suffix('.') {
        return scope.len() > atom.len() && scope.starts_with(prefix) && scope[prefix.len()..].starts_with('.');
    }
    scope == atom || (scope.starts_with(atom) && scope.as_bytes().get(atom.len()) == Some(&b'.'))
}

fn match_path<S: AsRef<str>>(atoms: &[String], scopes: &[S]) -> Option<Specificity> {
    let (last, ancestors) = atoms.split_last()?;
    let mut next = 0;
    for atom in ancestors {
        let found = scopes[next..].iter().position(|s| atom_matches(atom, s.as_ref()))?;
        next += found + 1;
    }
    // The innermost atom takes the deepest frame it can
    let index = (next..scopes.len())
        .rev()
        .find(|&i| atom_matches(last, scopes[i].as_ref()))?;
    Some(Specificity {
        depth: index + 1,
        atom_segments: last.split('.').filter(|s| !s.is_empty()).count(),
        atoms: atoms.len(),
    })
}

/// One comma separated alternative of a selector
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScopeSelector {
    pub matcher: Matcher,
    pub priority: Priority,
}

impl ScopeSelector {
    pub fn matches<S: AsRef<str>>(&self, scopes: &[S]) -> Option<SelectorMatch> {
        self.matcher.evaluate(scopes).map(|specificity| SelectorMatch {
            priority: self.priority,
            specificity,
        })
    }
}

/// A parsed selector string
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SelectorList {
    source: String,
    alternatives: Vec<ScopeSelector>,
}

impl SelectorList {
    pub fn parse(selector: &str) -> Result<Self, SelectorError> {
        let tokens = tokenize(selector)?;
        let mut parser = Parser {
            selector,
            tokens,
            pos: 0,
        };
        let alternatives = parser.parse_alternatives()?;
        Ok(Self {
            source: selector.to_string(),
            alternatives,
        })
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn alternatives(&self) -> &[ScopeSelector] {
        &self.alternatives
    }

    pub fn into_alternatives(self) -> Vec<ScopeSelector> {
        self.alternatives
    }

    pub fn matches<S: AsRef<str>>(&self, scopes: &[S]) -> bool {
        self.alternatives.iter().any(|alt| alt.matches(scopes).is_some())
    }

    pub fn matches_with_priority<S: AsRef<str>>(&self, scopes: &[S]) -> Option<Priority> {
        self.best_match(scopes).map(|m| m.priority)
    }

    /// Strongest matching alternative, ranked by priority then specificity
    pub fn best_match<S: AsRef<str>>(&self, scopes: &[S]) -> Option<SelectorMatch> {
        self.alternatives
            .iter()
            .filter_map(|alt| alt.matches(scopes))
            .max_by_key(|m| (m.priority, m.specificity))
    }
}

fn tokenize(selector: &str) -> Result<Vec<&str>, SelectorError> {
    thread_local! {
        static TOKEN: Regex = Regex::new(r"[LR]:|[\w.:][\w.:+\-]*|[,|\-!()]").expect("static pattern");
    }
    TOKEN.with(|re| {
        let mut tokens = Vec::new();
        let mut last = 0;
        for m in re.find_iter(selector) {
            let gap = &selector[last..m.start()];
            if let Some(bad) = gap.split_whitespace().next() {
                return Err(SelectorError::Unexpected {
                    selector: selector.to_string(),
                    token: bad.to_string(),
                });
            }
            tokens.push(m.as_str());
            last = m.end();
        }
        if let Some(bad) = selector[last..].split_whitespace().next() {
            return Err(SelectorError::Unexpected {
                selector: selector.to_string(),
                token: bad.to_string(),
            });
        }
        Ok(tokens)
    })
}

fn is_identifier(token: &str) -> bool {
    !matches!(token, "," | "|" | "-" | "!" | "(" | ")")
        && !(token.len() == 2 && token.ends_with(':') && matches!(&token[..1], "L" | "R"))
}

struct Parser<'a> {
    selector: &'a str,
    tokens: Vec<&'a str>,
    pos: usize,
}

impl<'a> Parser<'a> {
    fn peek(&self) -> Option<&'a str> {
        self.tokens.get(self.pos).copied()
    }

    fn unexpected(&self, token: &str) -> SelectorError {
        SelectorError::Unexpected {
            selector: self.selector.to_string(),
            token: token.to_string(),
        }
    }

    fn parse_alternatives(&mut self) -> Result<Vec<ScopeSelector>, SelectorError> {
        let mut alternatives = Vec::new();
        loop {
            let mut priority = Priority::Normal;
            match self.peek() {
                Some("L:") => {
                    priority = Priority::Low;
                    self.pos += 1;
                }
                Some("R:") => {
                    priority = Priority::High;
                    self.pos += 1;
                }
                _ => {}
            }

            let Some(matcher) = self.parse_conjunction()? else {
                return Err(match self.peek() {
                    Some(token) => self.unexpected(token),
                    None => SelectorError::Empty,
                });
            };
            if priority == Priority::Normal && leads_with_negation(&matcher) {
                priority = Priority::Low;
            }
            alternatives.push(ScopeSelector { matcher, priority });

            match self.peek() {
                None => return Ok(alternatives),
                Some("," | "|") => self.pos += 1,
                Some(")") => return Err(SelectorError::Unbalanced(self.selector.to_string())),
                Some(token) => return Err(self.unexpected(token)),
            }
        }
    }

    fn parse_conjunction(&mut self) -> Result<Option<Matcher>, SelectorError> {
        let mut operands = Vec::new();
        while let Some(operand) = self.parse_operand()? {
            operands.push(operand);
        }
        Ok(match operands.len() {
            0 => None,
            1 => operands.pop(),
            _ => Some(Matcher::And(operands)),
        })
    }

    fn parse_operand(&mut self) -> Result<Option<Matcher>, SelectorError> {
        let Some(token) = self.peek() else {
            return Ok(None);
        };
        match token {
            "-" | "!" => {
                self.pos += 1;
                match self.parse_operand()? {
                    Some(inner) => Ok(Some(Matcher::Not(Box::new(inner)))),
                    None => Err(match self.peek() {
                        Some(next) => self.unexpected(next),
                        None => SelectorError::Empty,
                    }),
                }
            }
            "(" => {
                self.pos += 1;
                let inner = self.parse_inner()?;
                if self.peek() != Some(")") {
                    return Err(SelectorError::Unbalanced(self.selector.to_string()));
                }
                self.pos += 1;
                Ok(Some(inner))
            }
            _ if is_identifier(token) => {
                let mut atoms = Vec::new();
                while let Some(atom) = self.peek().filter(|t| is_identifier(t)) {
                    atoms.push(atom.to_string());
                    self.pos += 1;
                }
                Ok(Some(Matcher::Path(atoms)))
            }
            _ => Ok(None),
        }
    }

    fn parse_inner(&mut self) -> Result<Matcher, SelectorError> {
        let mut any = Vec::new();
        while let Some(conjunction) = self.parse_conjunction()? {
            any.push(conjunction);
            if !matches!(self.peek(), Some("," | "|")) {
                break;
            }
            while matches!(self.peek(), Some("," | "|")) {
                self.pos += 1;
            }
        }
        match any.len() {
            0 => Err(SelectorError::Empty),
            1 => Ok(any.remove(0)),
            _ => Ok(Matcher::Or(any)),
        }
    }
}

fn leads_with_negation(matcher: &Matcher) -> bool {
    match matcher {
        Matcher::Not(_) => true,
        Matcher::And(all) => matches!(all.first(), Some(Matcher::Not(_))),
        _ => false,
    }
}
