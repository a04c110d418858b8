//! Compiled rule graph
//!
//! Raw rules are compiled once per grammar into a flat table addressed by
//! [`RuleId`]. Includes become plain ids, so recursive grammars (a block that
//! includes `$self`, two repository entries including each other) are cycles
//! in the table rather than infinite trees. Rules from other grammars pulled in
//! through `source.x` includes are compiled into the same table.

use std::sync::{Arc, OnceLock};

use regex::Regex;
use rustc_hash::{FxHashMap, FxHashSet};
use tracing::{debug, warn};

use super::raw::{RawCaptures, RawGrammar, RawRepository, RawRule};
use super::regex::RegexSource;
use super::GrammarRepository;
use crate::selector::{Priority, ScopeSelector, SelectorList};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RuleId(u32);

impl RuleId {
    pub(crate) const fn new(index: u32) -> Self {
        Self(index)
    }

    pub const fn index(self) -> usize {
        self.0 as usize
    }
}

/// Capture group index to capture rule
pub type CaptureRules = Vec<Option<RuleId>>;

#[derive(Debug)]
pub enum RuleKind {
    Match {
        regex: Arc<RegexSource>,
        captures: CaptureRules,
    },
    BeginEnd {
        begin: Arc<RegexSource>,
        begin_captures: CaptureRules,
        end: Arc<RegexSource>,
        end_captures: CaptureRules,
        apply_end_pattern_last: bool,
        patterns: Vec<RuleId>,
    },
    BeginWhile {
        begin: Arc<RegexSource>,
        begin_captures: CaptureRules,
        while_: Arc<RegexSource>,
        while_captures: CaptureRules,
        patterns: Vec<RuleId>,
    },
    /// A bare pattern list, flattened into whoever includes it
    IncludeOnly { patterns: Vec<RuleId> },
    /// Names a capture group, optionally tokenizing its text with nested patterns
    Capture { retokenize: Option<RuleId> },
}

#[derive(Debug)]
pub struct Rule {
    pub id: RuleId,
    name: Option<NameTemplate>,
    content_name: Option<NameTemplate>,
    pub kind: RuleKind,
    flat: OnceLock<Vec<RuleId>>,
}

impl Rule {
    pub fn name(&self, line: &str, captures: &[Option<(usize, usize)>]) -> Option<String> {
        self.name.as_ref().map(|n| n.resolve(line, captures))
    }

    pub fn content_name(&self, line: &str, captures: &[Option<(usize, usize)>]) -> Option<String> {
        self.content_name.as_ref().map(|n| n.resolve(line, captures))
    }

    /// The pattern that starts this rule
    pub fn match_regex(&self) -> Option<&RegexSource> {
        match &self.kind {
            RuleKind::Match { regex, .. } => Some(regex),
            RuleKind::BeginEnd { begin, .. } | RuleKind::BeginWhile { begin, .. } => Some(begin),
            RuleKind::IncludeOnly { .. } | RuleKind::Capture { .. } => None,
        }
    }

    fn nested(&self) -> &[RuleId] {
        match &self.kind {
            RuleKind::BeginEnd { patterns, .. }
            | RuleKind::BeginWhile { patterns, .. }
            | RuleKind::IncludeOnly { patterns } => patterns,
            RuleKind::Match { .. } | RuleKind::Capture { .. } => &[],
        }
    }
}

/// Scope name with `$N` and `${N:/downcase}` capture references
#[derive(Debug, Clone)]
struct NameTemplate {
    source: String,
    dynamic: bool,
}

fn template_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"\$(\d+)|\$\{(\d+):/(downcase|upcase)\}").expect("static pattern"))
}

impl NameTemplate {
    fn new(source: &str) -> Self {
        Self {
            dynamic: template_pattern().is_match(source),
            source: source.to_string(),
        }
    }

    fn resolve(&self, line: &str, captures: &[Option<(usize, usize)>]) -> String {
        if !self.dynamic {
            return self.source.clone();
        }
        template_pattern()
            .replace_all(&self.source, |caps: &regex::Captures<'_>| {
                let capture = caps
                    .get(1)
                    .or_else(|| caps.get(2))
                    .and_then(|m| m.as_str().parse::<usize>().ok())
                    .and_then(|i| captures.get(i).copied().flatten())
                    .and_then(|(start, end)| line.get(start..end));
                let Some(text) = capture else {
                    return caps[0].to_string();
                };
                let text = text.trim_start_matches('.');
                match caps.get(3).map(|m| m.as_str()) {
                    Some("downcase") => text.to_lowercase(),
                    Some("upcase") => text.to_uppercase(),
                    _ => text.to_string(),
                }
            })
            .into_owned()
    }
}

/// Injected patterns and where they apply
#[derive(Debug, Clone)]
pub struct Injection {
    pub selector: ScopeSelector,
    pub rule: RuleId,
}

impl Injection {
    pub fn priority(&self) -> Priority {
        self.selector.priority
    }
}

#[derive(Debug)]
pub struct RuleGraph {
    rules: Vec<Rule>,
    root: RuleId,
    injections: Vec<Injection>,
}

impl RuleGraph {
    /// Compile `base`, resolving cross grammar includes through `repository`
    pub fn compile(base: Arc<RawGrammar>, repository: Option<&dyn GrammarRepository>) -> Self {
        let mut compiler = Compiler {
            repository,
            base: Arc::clone(&base),
            rules: Vec::new(),
            memo: FxHashMap::default(),
            roots: FxHashMap::default(),
            loaded: FxHashMap::default(),
        };
        let root = compiler.compile_root(&base);
        let injections = compiler.compile_injections(&base);

        let rules: Vec<Rule> = compiler
            .rules
            .into_iter()
            .enumerate()
            .map(|(i, rule)| rule.unwrap_or_else(|| Rule::include_only(RuleId(i as u32), Vec::new())))
            .collect();
        debug!(scope = base.scope_name(), rules = rules.len(), injections = injections.len(), "grammar compiled");
        Self { rules, root, injections }
    }

    pub fn root(&self) -> RuleId {
        self.root
    }

    pub fn rule(&self, id: RuleId) -> &Rule {
        &self.rules[id.index()]
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    pub fn injections(&self) -> &[Injection] {
        &self.injections
    }

    /// Candidate rules nested in `id`, include-only rules expanded in place
    pub fn patterns(&self, id: RuleId) -> &[RuleId] {
        let rule = self.rule(id);
        rule.flat.get_or_init(|| {
            let mut out = Vec::new();
            let mut visited = FxHashSet::default();
            self.collect(rule.nested(), &mut visited, &mut out);
            out
        })
    }

    fn collect(&self, ids: &[RuleId], visited: &mut FxHashSet<RuleId>, out: &mut Vec<RuleId>) {
        for &id in ids {
            if !visited.insert(id) {
                continue;
            }
            match &self.rule(id).kind {
                RuleKind::IncludeOnly { patterns } => self.collect(patterns, visited, out),
                RuleKind::Capture { .. } => {}
                _ => out.push(id),
            }
        }
    }
}

impl Rule {
    fn include_only(id: RuleId, patterns: Vec<RuleId>) -> Self {
        Self {
            id,
            name: None,
            content_name: None,
            kind: RuleKind::IncludeOnly { patterns },
            flat: OnceLock::new(),
        }
    }
}

/// Where `$self` and `#name` resolve while compiling a rule
#[derive(Clone)]
struct Context<'r> {
    grammar: &'r RawGrammar,
    /// Innermost last
    repositories: Vec<&'r RawRepository>,
}

impl<'r> Context<'r> {
    fn new(grammar: &'r RawGrammar) -> Self {
        Self {
            grammar,
            repositories: vec![&grammar.repository],
        }
    }

    fn with(&self, repository: &'r RawRepository) -> Self {
        let mut ctx = self.clone();
        ctx.repositories.push(repository);
        ctx
    }

    fn lookup(&self, name: &str) -> Option<&'r RawRule> {
        self.repositories.iter().rev().find_map(|repo| repo.get(name))
    }
}

struct Compiler<'a> {
    repository: Option<&'a dyn GrammarRepository>,
    base: Arc<RawGrammar>,
    rules: Vec<Option<Rule>>,
    /// Raw rule address to compiled id, `None` for rules that failed to compile
    memo: FxHashMap<usize, Option<RuleId>>,
    /// Top level rule of each grammar by scope name
    roots: FxHashMap<String, RuleId>,
    loaded: FxHashMap<String, Option<Arc<RawGrammar>>>,
}

impl Compiler<'_> {
    fn reserve(&mut self) -> RuleId {
        let id = RuleId(self.rules.len() as u32);
        self.rules.push(None);
        id
    }

    fn fill(&mut self, id: RuleId, raw: Option<&RawRule>, kind: RuleKind) {
        self.rules[id.index()] = Some(Rule {
            id,
            name: raw.and_then(|r| r.name.as_deref()).map(NameTemplate::new),
            content_name: raw.and_then(|r| r.content_name.as_deref()).map(NameTemplate::new),
            kind,
            flat: OnceLock::new(),
        });
    }

    fn compile_root(&mut self, grammar: &RawGrammar) -> RuleId {
        if let Some(&id) = self.roots.get(grammar.scope_name()) {
            return id;
        }
        let id = self.reserve();
        self.roots.insert(grammar.scope_name().to_string(), id);
        let ctx = Context::new(grammar);
        let patterns = self.compile_patterns(&grammar.patterns, &ctx);
        self.fill(id, None, RuleKind::IncludeOnly { patterns });
        id
    }

    fn compile_patterns<'r>(&mut self, raws: &'r [RawRule], ctx: &Context<'r>) -> Vec<RuleId> {
        raws.iter().filter_map(|raw| self.compile_rule(raw, ctx)).collect()
    }

    fn compile_rule<'r>(&mut self, raw: &'r RawRule, ctx: &Context<'r>) -> Option<RuleId> {
        if let Some(include) = raw.include.as_deref() {
            return self.resolve_include(include, ctx);
        }
        let key = raw as *const RawRule as usize;
        if let Some(&id) = self.memo.get(&key) {
            return id;
        }

        let regexes = RuleRegexes::compile(raw);
        let Some(regexes) = regexes else {
            self.memo.insert(key, None);
            return None;
        };
        let id = self.reserve();
        self.memo.insert(key, Some(id));

        let ctx = match &raw.repository {
            Some(repository) => ctx.with(repository),
            None => ctx.clone(),
        };
        let patterns = raw
            .patterns
            .as_deref()
            .map(|p| self.compile_patterns(p, &ctx))
            .unwrap_or_default();

        let kind = match regexes {
            RuleRegexes::Match(regex) => RuleKind::Match {
                regex,
                captures: self.compile_captures(raw.captures.as_ref(), &ctx),
            },
            RuleRegexes::BeginEnd(begin, end) => RuleKind::BeginEnd {
                begin,
                begin_captures: self.compile_captures(raw.begin_captures.as_ref().or(raw.captures.as_ref()), &ctx),
                end,
                end_captures: self.compile_captures(raw.end_captures.as_ref().or(raw.captures.as_ref()), &ctx),
                apply_end_pattern_last: raw.apply_end_pattern_last,
                patterns,
            },
            RuleRegexes::BeginWhile(begin, while_) => RuleKind::BeginWhile {
                begin,
                begin_captures: self.compile_captures(raw.begin_captures.as_ref().or(raw.captures.as_ref()), &ctx),
                while_,
                while_captures: self.compile_captures(raw.while_captures.as_ref().or(raw.captures.as_ref()), &ctx),
                patterns,
            },
            RuleRegexes::None => RuleKind::IncludeOnly { patterns },
        };
        self.fill(id, Some(raw), kind);
        Some(id)
    }

    fn compile_captures<'r>(&mut self, captures: Option<&'r RawCaptures>, ctx: &Context<'r>) -> CaptureRules {
        let Some(captures) = captures else {
            return Vec::new();
        };
        let mut indexed: Vec<(usize, &RawRule)> = captures
            .iter()
            .filter_map(|(key, raw)| key.parse::<usize>().ok().map(|i| (i, raw)))
            .collect();
        indexed.sort_by_key(|(i, _)| *i);

        let len = indexed.last().map_or(0, |(i, _)| i + 1);
        let mut rules = vec![None; len];
        for (index, raw) in indexed {
            rules[index] = Some(self.compile_capture(raw, ctx));
        }
        rules
    }

    fn compile_capture<'r>(&mut self, raw: &'r RawRule, ctx: &Context<'r>) -> RuleId {
        let key = raw as *const RawRule as usize;
        if let Some(&Some(id)) = self.memo.get(&key) {
            return id;
        }
        let id = self.reserve();
        self.memo.insert(key, Some(id));

        let retokenize = match raw.patterns.as_deref() {
            Some(patterns) if !patterns.is_empty() => {
                let ctx = match &raw.repository {
                    Some(repository) => ctx.with(repository),
                    None => ctx.clone(),
                };
                let nested = self.reserve();
                let patterns = self.compile_patterns(patterns, &ctx);
                self.fill(nested, None, RuleKind::IncludeOnly { patterns });
                Some(nested)
            }
            _ => None,
        };
        self.fill(id, Some(raw), RuleKind::Capture { retokenize });
        id
    }

    fn resolve_include<'r>(&mut self, include: &str, ctx: &Context<'r>) -> Option<RuleId> {
        match include {
            "$self" => Some(self.compile_root(ctx.grammar)),
            "$base" => {
                let base = Arc::clone(&self.base);
                Some(self.compile_root(&base))
            }
            local if local.starts_with('#') => {
                let name = &local[1..];
                match ctx.lookup(name) {
                    Some(raw) => self.compile_rule(raw, ctx),
                    None => {
                        warn!(grammar = ctx.grammar.scope_name(), include, "unknown repository rule");
                        None
                    }
                }
            }
            external => {
                let (scope, name) = match external.split_once('#') {
                    Some((scope, name)) => (scope, Some(name)),
                    None => (external, None),
                };
                let grammar = self.external(scope)?;
                match name {
                    None => Some(self.compile_root(&grammar)),
                    Some(name) => {
                        let ctx = Context::new(&grammar);
                        match ctx.lookup(name) {
                            Some(raw) => self.compile_rule(raw, &ctx),
                            None => {
                                warn!(grammar = scope, include, "unknown repository rule");
                                None
                            }
                        }
                    }
                }
            }
        }
    }

    fn external(&mut self, scope: &str) -> Option<Arc<RawGrammar>> {
        if scope == self.base.scope_name() {
            return Some(Arc::clone(&self.base));
        }
        if let Some(loaded) = self.loaded.get(scope) {
            return loaded.clone();
        }
        let grammar = self.repository.and_then(|repo| repo.lookup(scope));
        if grammar.is_none() {
            warn!(scope, "included grammar not available");
        }
        self.loaded.insert(scope.to_string(), grammar.clone());
        grammar
    }

    fn compile_injections(&mut self, base: &RawGrammar) -> Vec<Injection> {
        let mut injections = Vec::new();
        let ctx = Context::new(base);
        for (selector, raw) in &base.injections {
            if let Some(rule) = self.compile_rule(raw, &ctx) {
                push_injection(&mut injections, selector, rule);
            }
        }

        let injectors = self
            .repository
            .map(|repo| repo.injections(base.scope_name()))
            .unwrap_or_default();
        for scope in injectors {
            let Some(grammar) = self.external(&scope) else {
                continue;
            };
            let Some(selector) = grammar.injection_selector.clone() else {
                debug!(scope, "injector has no injection selector");
                continue;
            };
            let rule = self.compile_root(&grammar);
            push_injection(&mut injections, &selector, rule);
        }
        injections.sort_by_key(Injection::priority);
        injections
    }
}

fn push_injection(injections: &mut Vec<Injection>, selector: &str, rule: RuleId) {
    match SelectorList::parse(selector) {
        Ok(list) => injections.extend(
            list.into_alternatives()
                .into_iter()
                .map(|selector| Injection { selector, rule }),
        ),
        Err(e) => warn!(selector, error = %e, "ignoring injection"),
    }
}

enum RuleRegexes {
    Match(Arc<RegexSource>),
    BeginEnd(Arc<RegexSource>, Arc<RegexSource>),
    BeginWhile(Arc<RegexSource>, Arc<RegexSource>),
    None,
}

impl RuleRegexes {
    /// `None` when one of the rule's own patterns is invalid
    fn compile(raw: &RawRule) -> Option<Self> {
        if let Some(pattern) = raw.match_.as_deref() {
            return Some(Self::Match(regex(raw, pattern)?));
        }
        let Some(begin) = raw.begin.as_deref() else {
            return Some(Self::None);
        };
        let begin = regex(raw, begin)?;
        match (raw.end.as_deref(), raw.while_.as_deref()) {
            (Some(end), _) => Some(Self::BeginEnd(begin, regex(raw, end)?)),
            (None, Some(while_)) => Some(Self::BeginWhile(begin, regex(raw, while_)?)),
            // Rejected when the grammar was validated
            (None, None) => Some(Self::None),
        }
    }
}

fn regex(raw: &RawRule, pattern: &str) -> Option<Arc<RegexSource>> {
    match RegexSource::new(pattern) {
        Ok(regex) => Some(Arc::new(regex)),
        Err(e) => {
            warn!(name = raw.name.as_deref().unwrap_or_default(), pattern, error = %e, "dropping rule with invalid pattern");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn graph(json: &str) -> RuleGraph {
        RuleGraph::compile(Arc::new(RawGrammar::from_json(json).unwrap()), None)
    }

    fn kinds(graph: &RuleGraph, ids: &[RuleId]) -> Vec<&'static str> {
        ids.iter()
            .map(|id| match graph.rule(*id).kind {
                RuleKind::Match { .. } => "match",
                RuleKind::BeginEnd { .. } => "begin-end",
                RuleKind::BeginWhile { .. } => "begin-while",
                RuleKind::IncludeOnly { .. } => "include",
                RuleKind::Capture { .. } => "capture",
            })
            .collect()
    }

    #[test]
    fn test_recursive_grammar_compiles() {
        let graph = graph(
            r##"{
                "scopeName": "source.t",
                "patterns": [ { "include": "#block" }, { "match": "\\w+", "name": "word" } ],
                "repository": {
                    "block": { "begin": "\\{", "end": "\\}", "patterns": [ { "include": "$self" } ] }
                }
            }"##,
        );
        let top = graph.patterns(graph.root());
        assert_eq!(kinds(&graph, top), vec!["begin-end", "match"]);

        let block = top[0];
        assert_eq!(graph.patterns(block), top);
    }

    #[test]
    fn test_mutual_includes_terminate() {
        let graph = graph(
            r##"{
                "scopeName": "source.t",
                "patterns": [ { "include": "#a" } ],
                "repository": {
                    "a": { "patterns": [ { "include": "#b" }, { "match": "a" } ] },
                    "b": { "patterns": [ { "include": "#a" }, { "match": "b" } ] }
                }
            }"##,
        );
        let top = graph.patterns(graph.root());
        assert_eq!(kinds(&graph, top), vec!["match", "match"]);
        let sources: Vec<&str> = top
            .iter()
            .map(|id| graph.rule(*id).match_regex().unwrap().source())
            .collect();
        assert_eq!(sources, vec!["b", "a"]);
    }

    #[test]
    fn test_unknown_include_and_bad_pattern_are_dropped() {
        let graph = graph(
            r##"{
                "scopeName": "source.t",
                "patterns": [
                    { "include": "#missing" },
                    { "include": "source.other" },
                    { "match": "(unclosed" },
                    { "match": "ok" }
                ]
            }"##,
        );
        assert_eq!(kinds(&graph, graph.patterns(graph.root())), vec!["match"]);
    }

    #[test]
    fn test_back_referenced_end_keeps_rule() {
        let graph = graph(
            r#"{
                "scopeName": "source.t",
                "patterns": [
                    { "begin": "<<(\\w+)", "end": "^\\1$" },
                    { "begin": "^(>+)", "while": "^\\1" },
                    { "begin": "a", "end": "(\\1" }
                ]
            }"#,
        );
        assert_eq!(kinds(&graph, graph.patterns(graph.root())), vec!["begin-end", "begin-while"]);
    }

    #[test]
    fn test_nested_repository_shadows_outer() {
        let graph = graph(
            r##"{
                "scopeName": "source.t",
                "patterns": [
                    { "begin": "<", "end": ">",
                      "repository": { "item": { "match": "inner" } },
                      "patterns": [ { "include": "#item" } ] },
                    { "include": "#item" }
                ],
                "repository": { "item": { "match": "outer" } }
            }"##,
        );
        let top = graph.patterns(graph.root());
        let nested = graph.patterns(top[0]);
        assert_eq!(graph.rule(nested[0]).match_regex().unwrap().source(), "inner");
        assert_eq!(graph.rule(top[1]).match_regex().unwrap().source(), "outer");
    }

    #[test]
    fn test_captures_and_retokenize() {
        let graph = graph(
            r#"{
                "scopeName": "source.t",
                "patterns": [
                    { "match": "(a)(b)", "captures": {
                        "2": { "name": "second", "patterns": [ { "match": "b", "name": "inner" } ] }
                    } }
                ]
            }"#,
        );
        let id = graph.patterns(graph.root())[0];
        let RuleKind::Match { captures, .. } = &graph.rule(id).kind else {
            panic!("expected a match rule");
        };
        assert_eq!(captures.len(), 3);
        assert!(captures[1].is_none());
        let capture = graph.rule(captures[2].unwrap());
        assert_eq!(capture.name("", &[]), Some("second".to_string()));
        let RuleKind::Capture { retokenize: Some(nested) } = capture.kind else {
            panic!("expected nested patterns");
        };
        assert_eq!(kinds(&graph, graph.patterns(nested)), vec!["match"]);
    }

    #[test]
    fn test_name_templates() {
        let template = NameTemplate::new("entity.$1.${2:/upcase}.${1:/downcase}.$5");
        let line = "Foo.bar";
        let captures = vec![Some((0, 7)), Some((0, 3)), Some((3, 7))];
        assert_eq!(template.resolve(line, &captures), "entity.Foo.BAR.foo.$5");
        assert_eq!(NameTemplate::new("plain").resolve(line, &captures), "plain");
    }

    #[test]
    fn test_injections_split_alternatives() {
        let graph = graph(
            r#"{
                "scopeName": "source.t",
                "injections": { "L:comment, string": { "patterns": [ { "match": "TODO" } ] } }
            }"#,
        );
        let priorities: Vec<Priority> = graph.injections().iter().map(Injection::priority).collect();
        assert_eq!(priorities, vec![Priority::Low, Priority::Normal]);
        assert_eq!(graph.injections()[0].rule, graph.injections()[1].rule);
    }

    struct Repo(FxHashMap<String, Arc<RawGrammar>>);

    impl GrammarRepository for Repo {
        fn lookup(&self, scope_name: &str) -> Option<Arc<RawGrammar>> {
            self.0.get(scope_name).cloned()
        }

        fn injections(&self, scope_name: &str) -> Vec<String> {
            if scope_name == "source.base" {
                vec!["text.injector".to_string()]
            } else {
                Vec::new()
            }
        }
    }

    #[test]
    fn test_external_grammars() {
        let base = Arc::new(
            RawGrammar::from_json(
                r#"{ "scopeName": "source.base", "patterns": [ { "include": "source.other#num" }, { "include": "source.other" } ] }"#,
            )
            .unwrap(),
        );
        let other = RawGrammar::from_json(
            r#"{ "scopeName": "source.other",
                 "patterns": [ { "match": "x" }, { "include": "$base" } ],
                 "repository": { "num": { "match": "\\d" } } }"#,
        )
        .unwrap();
        let injector = RawGrammar::from_json(
            r#"{ "scopeName": "text.injector", "injectionSelector": "R:source.base", "patterns": [ { "match": "!" } ] }"#,
        )
        .unwrap();
        let mut grammars = FxHashMap::default();
        grammars.insert("source.other".to_string(), Arc::new(other));
        grammars.insert("text.injector".to_string(), Arc::new(injector));
        let repo = Repo(grammars);

        let graph = RuleGraph::compile(base, Some(&repo));
        let sources: Vec<&str> = graph
            .patterns(graph.root())
            .iter()
            .map(|id| graph.rule(*id).match_regex().unwrap().source())
            .collect();
        assert_eq!(sources, vec!["\\d", "x"]);

        assert_eq!(graph.injections().len(), 1);
        assert_eq!(graph.injections()[0].priority(), Priority::High);
    }
}
