//! TextMate grammars
//!
//! A [`Grammar`] compiles a raw `.tmLanguage.json` tree into a rule graph and
//! tokenizes one line at a time, threading a [`StateStack`] from each line to
//! the next.

pub mod attrs;
mod raw;
mod regex;
mod rule;
mod stack;
mod tokenizer;

use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use rustc_hash::FxHashMap;
use tracing::{debug, trace, warn};

pub use self::raw::{RawCaptures, RawGrammar, RawRepository, RawRule};
pub use self::regex::{find_best_match, CaptureSpans, RegexSource, ScanMatch};
pub use self::rule::{Injection, Rule, RuleGraph, RuleId, RuleKind};
pub use self::stack::{ScopeStack, StateStack};

use self::attrs::{ScopeAttributesProvider, StandardTokenType, TokenAttributes};
use crate::error::GrammarLoadError;
use crate::selector::SelectorList;
use crate::theme::Theme;

/// Most back referenced end and while patterns kept compiled at once
const END_RULE_CACHE_LIMIT: usize = 256;

/// Source of the grammars a grammar includes or is injected with
pub trait GrammarRepository: Send + Sync {
    /// Raw grammar for a scope name
    fn lookup(&self, scope_name: &str) -> Option<Arc<RawGrammar>>;

    /// Scopes of the grammars injecting themselves into `scope_name`
    fn injections(&self, _scope_name: &str) -> Vec<String> {
        Vec::new()
    }
}

/// Per grammar settings that shape token metadata
#[derive(Debug, Clone, Default)]
pub struct GrammarConfiguration {
    /// Language id of the grammar itself
    pub initial_language: u8,
    /// Scope prefix to language id, for embedded languages
    pub embedded_languages: FxHashMap<String, u8>,
    /// Scope selector to the token type forced on matching tokens
    pub token_types: FxHashMap<String, StandardTokenType>,
}

/// A run of text with its scope path
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Token {
    /// Byte offset where this token starts (inclusive)
    pub start: usize,
    /// Byte offset where this token ends (exclusive)
    pub end: usize,
    /// Scope names, outermost first
    pub scopes: Vec<String>,
    /// Encoded [`TokenAttributes`]
    pub metadata: u32,
}

impl Token {
    pub fn len(&self) -> usize {
        self.end - self.start
    }

    pub fn is_empty(&self) -> bool {
        self.start == self.end
    }

    /// Innermost scope
    pub fn scope(&self) -> Option<&str> {
        self.scopes.last().map(String::as_str)
    }
}

#[derive(Debug, Clone)]
pub struct TokenizeLineResult {
    pub tokens: Vec<Token>,
    /// State to pass when tokenizing the next line
    pub state: StateStack,
    /// The time budget ran out. `tokens` covers the line but the rest of it is
    /// a single token, and `state` is the state the line started with.
    pub stopped_early: bool,
}

/// Binary tokens: `[start, metadata]` pairs, adjacent tokens with equal
/// metadata merged
#[derive(Debug, Clone)]
pub struct TokenizeLineResult2 {
    pub tokens: Vec<u32>,
    pub state: StateStack,
    pub stopped_early: bool,
}

pub struct Grammar {
    scope_name: String,
    raw: Arc<RawGrammar>,
    graph: RuleGraph,
    attributes: ScopeAttributesProvider,
    token_types: Vec<(SelectorList, StandardTokenType)>,
    theme: RwLock<Option<Arc<Theme>>>,
    /// End and while patterns with back references substituted
    end_rules: Mutex<FxHashMap<String, Arc<RegexSource>>>,
    first_line_match: Option<RegexSource>,
}

impl Grammar {
    pub fn new(
        raw: Arc<RawGrammar>,
        repository: Option<&dyn GrammarRepository>,
        config: &GrammarConfiguration,
    ) -> Result<Self, GrammarLoadError> {
        raw.validate()?;
        let scope_name = raw.scope_name().to_string();
        let graph = RuleGraph::compile(Arc::clone(&raw), repository);

        let mut selectors: Vec<(&String, &StandardTokenType)> = config.token_types.iter().collect();
        selectors.sort_by(|a, b| a.0.cmp(b.0));
        let token_types = selectors
            .into_iter()
            .filter_map(|(selector, token_type)| match SelectorList::parse(selector) {
                Ok(list) => Some((list, *token_type)),
                Err(e) => {
                    warn!(selector = %selector, error = %e, "ignoring token type selector");
                    None
                }
            })
            .collect();

        let first_line_match = raw
            .first_line_match
            .as_deref()
            .and_then(|pattern| RegexSource::new(pattern).ok());

        debug!(scope = %scope_name, rules = graph.len(), "grammar ready");
        Ok(Self {
            scope_name,
            attributes: ScopeAttributesProvider::new(config.initial_language, &config.embedded_languages),
            raw,
            graph,
            token_types,
            theme: RwLock::new(None),
            end_rules: Mutex::new(FxHashMap::default()),
            first_line_match,
        })
    }

    /// Compile a standalone grammar that includes no other grammars
    pub fn from_json(json: &str) -> Result<Self, GrammarLoadError> {
        Self::new(Arc::new(RawGrammar::from_json(json)?), None, &GrammarConfiguration::default())
    }

    pub fn scope_name(&self) -> &str {
        &self.scope_name
    }

    /// Display name from the grammar file
    pub fn name(&self) -> Option<&str> {
        self.raw.name.as_deref()
    }

    pub fn file_types(&self) -> &[String] {
        &self.raw.file_types
    }

    /// Whether `line` looks like the first line of a document in this language
    pub fn matches_first_line(&self, line: &str) -> bool {
        self.first_line_match
            .as_ref()
            .is_some_and(|re| re.search(line, 0, true, true).is_some())
    }

    pub fn rule_graph(&self) -> &RuleGraph {
        &self.graph
    }

    /// Theme used for the style bits of token metadata. States created under
    /// the previous theme keep its color ids, so lines must be re-tokenized
    /// from the start of the document (see
    /// [`TokenizationModel::set_theme`](crate::model::TokenizationModel::set_theme)).
    pub fn set_theme(&self, theme: Option<Arc<Theme>>) {
        *self.theme.write() = theme;
    }

    pub fn theme(&self) -> Option<Arc<Theme>> {
        self.theme.read().clone()
    }

    /// State for the first line of a document
    pub fn initial_state(&self) -> StateStack {
        let scopes = self.push_scopes(&ScopeStack::empty(), Some(&self.scope_name));
        StateStack::root(self.graph.root(), scopes)
    }

    /// Tokenize one line (without its line terminator). `prior` is the state
    /// returned for the previous line, `None` for the first line.
    pub fn tokenize_line(&self, line: &str, prior: Option<&StateStack>, time_budget: Option<Duration>) -> TokenizeLineResult {
        let (tokens, state, stopped_early) = tokenizer::tokenize_line(self, line, prior, time_budget, false);
        TokenizeLineResult {
            tokens: tokens.into_tokens(),
            state,
            stopped_early,
        }
    }

    pub fn tokenize_line2(&self, line: &str, prior: Option<&StateStack>, time_budget: Option<Duration>) -> TokenizeLineResult2 {
        let (tokens, state, stopped_early) = tokenizer::tokenize_line(self, line, prior, time_budget, true);
        TokenizeLineResult2 {
            tokens: tokens.into_binary(),
            state,
            stopped_early,
        }
    }

    /// Tokenize consecutive lines from the start of a document
    pub fn tokenize_lines<'a>(&self, lines: impl IntoIterator<Item = &'a str>) -> Vec<Vec<Token>> {
        let mut state: Option<StateStack> = None;
        lines
            .into_iter()
            .map(|line| {
                let result = self.tokenize_line(line, state.as_ref(), None);
                state = Some(result.state);
                result.tokens
            })
            .collect()
    }

    /// Push the space separated scopes of `name` onto `base`
    fn push_scopes(&self, base: &ScopeStack, name: Option<&str>) -> ScopeStack {
        let Some(name) = name else {
            return base.clone();
        };
        let mut scopes = base.clone();
        for scope in name.split_ascii_whitespace() {
            let metadata = self.scope_metadata(&scopes, scope);
            scopes = scopes.push(scope, metadata);
        }
        scopes
    }

    fn scope_metadata(&self, parent: &ScopeStack, scope: &str) -> u32 {
        let theme = self.theme.read().clone();
        let parent_metadata = if parent.is_empty() {
            self.root_metadata(theme.as_deref())
        } else {
            parent.metadata()
        };
        let basic = self.attributes.attributes(scope);
        let style = theme.and_then(|theme| {
            let mut path = parent.names();
            path.push(scope.to_string());
            theme.resolve_style(&path)
        });
        let (font_style, foreground, background) = style.map_or((None, 0, 0), |style| {
            (
                style.font_style(),
                style.foreground.unwrap_or(0),
                style.background.unwrap_or(0),
            )
        });
        attrs::merge(
            parent_metadata,
            Some(basic.language_id),
            basic.token_type,
            font_style,
            foreground,
            background,
        )
    }

    fn root_metadata(&self, theme: Option<&Theme>) -> u32 {
        let defaults = self.attributes.default_attributes();
        let style = theme.map(Theme::defaults).unwrap_or_default();
        TokenAttributes {
            language_id: defaults.language_id,
            token_type: defaults.token_type.unwrap_or(StandardTokenType::Other),
            font_style: style.font_style().unwrap_or_default(),
            foreground: style.foreground.unwrap_or(0),
            background: style.background.unwrap_or(0),
        }
        .encode()
    }

    /// Metadata of a token in `scopes`, with token type overrides applied
    fn token_metadata(&self, scopes: &ScopeStack) -> u32 {
        let mut metadata = scopes.metadata();
        if self.token_types.is_empty() {
            return metadata;
        }
        let names = scopes.names();
        for (selector, token_type) in &self.token_types {
            if selector.matches(&names) {
                metadata = attrs::merge(metadata, None, Some(*token_type), None, 0, 0);
            }
        }
        metadata
    }

    fn resolved_end_rule(&self, pattern: String) -> Option<Arc<RegexSource>> {
        let mut cache = self.end_rules.lock();
        if let Some(regex) = cache.get(&pattern) {
            return Some(Arc::clone(regex));
        }
        match RegexSource::new(&pattern) {
            Ok(regex) => {
                let regex = Arc::new(regex);
                // States keep their own reference, the cache only saves recompiles
                if cache.len() >= END_RULE_CACHE_LIMIT {
                    trace!(entries = cache.len(), "resolved pattern cache cleared");
                    cache.clear();
                }
                cache.insert(pattern, Arc::clone(&regex));
                Some(regex)
            }
            Err(e) => {
                warn!(pattern = %pattern, error = %e, "back referenced pattern failed to compile");
                None
            }
        }
    }
}

impl std::fmt::Debug for Grammar {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Grammar")
            .field("scope_name", &self.scope_name)
            .field("rules", &self.graph.len())
            .finish_non_exhaustive()
    }
}
