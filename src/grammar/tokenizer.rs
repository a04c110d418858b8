//! The line tokenizer
//!
//! Each line is searched with a `\n` appended, as grammars are written against
//! newline terminated lines. The loop repeatedly scans the candidate patterns
//! of the rule on top of the stack (plus injections and the end pattern) from
//! the current position, emits the text before the winning match under the
//! current scopes, then applies the match: a `Match` rule emits its own token,
//! a begin pattern pushes a frame and an end pattern pops one.

use std::time::{Duration, Instant};

use tracing::trace;

use super::regex::{find_best_match, CaptureSpans, RegexSource};
use super::rule::{RuleId, RuleKind};
use super::stack::{ScopeStack, StateStack};
use super::{Grammar, Token};
use crate::selector::Priority;

/// Tokens accumulated for one line
pub(super) struct LineTokens<'g> {
    grammar: &'g Grammar,
    binary: bool,
    tokens: Vec<Token>,
    binary_tokens: Vec<u32>,
    last_end: usize,
}

impl<'g> LineTokens<'g> {
    fn new(grammar: &'g Grammar, binary: bool) -> Self {
        Self {
            grammar,
            binary,
            tokens: Vec::new(),
            binary_tokens: Vec::new(),
            last_end: 0,
        }
    }

    fn produce(&mut self, state: &StateStack, end: usize) {
        self.produce_scopes(state.content_scopes(), end);
    }

    fn produce_scopes(&mut self, scopes: &ScopeStack, end: usize) {
        if self.last_end >= end {
            return;
        }
        let metadata = self.grammar.token_metadata(scopes);
        if self.binary {
            if self.binary_tokens.last() == Some(&metadata) {
                self.last_end = end;
                return;
            }
            self.binary_tokens.push(self.last_end as u32);
            self.binary_tokens.push(metadata);
        } else {
            self.tokens.push(Token {
                start: self.last_end,
                end,
                scopes: scopes.names(),
                metadata,
            });
        }
        self.last_end = end;
    }

    /// Drop the token for the appended newline, make sure the line has at
    /// least one token and clip everything to the original text.
    fn finish(&mut self, state: &StateStack, line_len: usize) {
        let text_len = line_len - 1;
        if self.binary {
            let len = self.binary_tokens.len();
            if len >= 2 && self.binary_tokens[len - 2] as usize == text_len {
                self.binary_tokens.truncate(len - 2);
            }
            if self.binary_tokens.is_empty() {
                self.binary_tokens.push(0);
                self.binary_tokens.push(self.grammar.token_metadata(state.content_scopes()));
            }
            return;
        }

        if self.tokens.last().is_some_and(|t| t.start == text_len) {
            self.tokens.pop();
        }
        if self.tokens.is_empty() {
            self.tokens.push(Token {
                start: 0,
                end: line_len,
                scopes: state.scope_names(),
                metadata: self.grammar.token_metadata(state.content_scopes()),
            });
        }
        for token in &mut self.tokens {
            token.end = token.end.min(text_len);
        }
    }

    pub(super) fn into_tokens(self) -> Vec<Token> {
        self.tokens
    }

    pub(super) fn into_binary(self) -> Vec<u32> {
        self.binary_tokens
    }
}

pub(super) fn tokenize_line<'g>(
    grammar: &'g Grammar,
    line: &str,
    prior: Option<&StateStack>,
    time_budget: Option<Duration>,
    binary: bool,
) -> (LineTokens<'g>, StateStack, bool) {
    let first_line = prior.is_none();
    let prior = prior.cloned().unwrap_or_else(|| grammar.initial_state());
    let text = format!("{line}\n");
    let mut tokens = LineTokens::new(grammar, binary);

    let tokenizer = Tokenizer {
        grammar,
        deadline: time_budget.map(|budget| Instant::now() + budget),
    };
    let (state, stopped_early) = tokenizer.tokenize_string(&text, first_line, 0, prior.clone(), &mut tokens, true);

    if stopped_early {
        trace!(scope = grammar.scope_name(), len = line.len(), "line stopped early");
        tokens.produce(&state, text.len());
        tokens.finish(&state, text.len());
        return (tokens, prior, true);
    }
    tokens.finish(&state, text.len());
    (tokens, state, false)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Target {
    Rule(RuleId),
    /// End pattern of the rule on top of the stack
    End,
}

struct Found {
    target: Target,
    captures: CaptureSpans,
}

impl Found {
    fn start(&self) -> usize {
        self.captures[0].map_or(0, |(start, _)| start)
    }

    fn end(&self) -> usize {
        self.captures[0].map_or(0, |(_, end)| end)
    }
}

struct Tokenizer<'g> {
    grammar: &'g Grammar,
    deadline: Option<Instant>,
}

impl Tokenizer<'_> {
    fn expired(&self) -> bool {
        self.deadline.is_some_and(|deadline| Instant::now() >= deadline)
    }

    /// Returns the final state and whether the time budget ran out. `floor`
    /// tracking: frames deeper than `floor` were pushed on this line, so their
    /// enter and anchor positions refer to `text`.
    fn tokenize_string(
        &self,
        text: &str,
        mut first_line: bool,
        mut pos: usize,
        mut stack: StateStack,
        tokens: &mut LineTokens<'_>,
        top_level: bool,
    ) -> (StateStack, bool) {
        let len = text.len();
        let mut floor = if top_level { stack.depth() } else { stack.depth() - 1 };
        let mut anchor = None;

        if top_level {
            let checked = self.check_while_conditions(text, first_line, pos, stack, tokens);
            stack = checked.stack;
            pos = checked.pos;
            anchor = checked.anchor;
            first_line = checked.first_line;
            floor = floor.min(stack.depth());
        }

        loop {
            if top_level && self.expired() {
                return (stack, true);
            }

            let Some(found) = self.match_rule_or_injections(text, first_line, pos, &stack, anchor) else {
                tokens.produce(&stack, len);
                return (stack, false);
            };
            let (start, end) = (found.start(), found.end());
            let advanced = end > pos;

            match found.target {
                Target::End => {
                    let popped = stack.clone();
                    let end_captures: &[Option<RuleId>] = match &self.grammar.graph.rule(popped.rule_id()).kind {
                        RuleKind::BeginEnd { end_captures, .. } => end_captures,
                        _ => &[],
                    };
                    tokens.produce(&stack, start);
                    stack = stack.with_content_scopes(stack.name_scopes().clone());
                    self.handle_captures(text, first_line, &stack, tokens, end_captures, &found.captures);
                    tokens.produce(&stack, end);

                    let pushed_this_line = popped.depth() > floor;
                    stack = popped.safe_pop();
                    floor = floor.min(stack.depth());
                    anchor = if pushed_this_line { popped.anchor_pos() } else { None };

                    if !advanced && pushed_this_line && popped.enter_pos() == Some(start) {
                        // Entered and left at the same spot: keep the rule and move on
                        stack = popped;
                        match step(text, pos, &stack, tokens) {
                            Some(next) => {
                                pos = next;
                                first_line = false;
                                continue;
                            }
                            None => return (stack, false),
                        }
                    }
                }
                Target::Rule(id) => {
                    let rule = self.grammar.graph.rule(id);
                    tokens.produce(&stack, start);
                    let name = rule.name(text, &found.captures);
                    let name_scopes = self.grammar.push_scopes(stack.content_scopes(), name.as_deref());

                    match &rule.kind {
                        RuleKind::Match { captures, .. } => {
                            let matched = stack.push(id, Some(start), anchor, end == len, None, name_scopes.clone(), name_scopes);
                            self.handle_captures(text, first_line, &matched, tokens, captures, &found.captures);
                            tokens.produce(&matched, end);
                            if !advanced {
                                match step(text, pos, &stack, tokens) {
                                    Some(next) => {
                                        pos = next;
                                        first_line = false;
                                        continue;
                                    }
                                    None => return (stack, false),
                                }
                            }
                        }
                        RuleKind::BeginEnd {
                            begin_captures,
                            end: follow,
                            ..
                        }
                        | RuleKind::BeginWhile {
                            begin_captures,
                            while_: follow,
                            ..
                        } => {
                            let before_push = stack.clone();
                            let mut pushed =
                                stack.push(id, Some(start), anchor, end == len, None, name_scopes.clone(), name_scopes.clone());
                            self.handle_captures(text, first_line, &pushed, tokens, begin_captures, &found.captures);
                            tokens.produce(&pushed, end);
                            anchor = Some(end);

                            let content_name = rule.content_name(text, &found.captures);
                            pushed = pushed.with_content_scopes(self.grammar.push_scopes(&name_scopes, content_name.as_deref()));
                            if follow.has_back_references() {
                                let pattern = follow.resolve_back_references(text, &found.captures);
                                if let Some(resolved) = self.grammar.resolved_end_rule(pattern) {
                                    pushed = pushed.with_end_rule(resolved);
                                }
                            }
                            stack = pushed;

                            if !advanced && before_push.has_same_rule_as(id, Some(start), floor) {
                                // The same rule is already open here, pushing again would loop
                                stack = before_push;
                                anchor = None;
                                match step(text, pos, &stack, tokens) {
                                    Some(next) => {
                                        pos = next;
                                        first_line = false;
                                        continue;
                                    }
                                    None => return (stack, false),
                                }
                            }
                        }
                        RuleKind::IncludeOnly { .. } | RuleKind::Capture { .. } => {}
                    }
                }
            }

            if advanced {
                pos = end;
                first_line = false;
            }
        }
    }

    fn check_while_conditions(
        &self,
        text: &str,
        mut first_line: bool,
        mut pos: usize,
        stack: StateStack,
        tokens: &mut LineTokens<'_>,
    ) -> WhileCheck {
        let graph = &self.grammar.graph;
        let mut anchor = stack.begin_rule_captured_eol().then_some(0);
        let mut frames: Vec<StateStack> = stack
            .frames()
            .filter(|frame| matches!(graph.rule(frame.rule_id()).kind, RuleKind::BeginWhile { .. }))
            .cloned()
            .collect();
        frames.reverse();

        let mut stack = stack;
        for frame in frames {
            let RuleKind::BeginWhile { while_, while_captures, .. } = &graph.rule(frame.rule_id()).kind else {
                continue;
            };
            let regex: &RegexSource = frame.end_rule().unwrap_or(while_);
            let captures = regex
                .search(text, pos, first_line, anchor == Some(pos))
                .filter(|captures| captures[0].is_some_and(|(start, _)| start == pos));
            let Some(captures) = captures else {
                stack = frame.safe_pop();
                break;
            };

            let (start, end) = captures[0].unwrap_or((pos, pos));
            tokens.produce(&frame, start);
            self.handle_captures(text, first_line, &frame, tokens, while_captures, &captures);
            tokens.produce(&frame, end);
            anchor = Some(end);
            if end > pos {
                pos = end;
                first_line = false;
            }
        }

        WhileCheck {
            stack,
            pos,
            anchor,
            first_line,
        }
    }

    fn match_rule_or_injections(
        &self,
        text: &str,
        first_line: bool,
        pos: usize,
        stack: &StateStack,
        anchor: Option<usize>,
    ) -> Option<Found> {
        let matched = self.match_rule(text, first_line, pos, stack, anchor);
        if self.grammar.graph.injections().is_empty() {
            return matched;
        }
        let Some((injected, priority)) = self.match_injections(text, first_line, pos, stack, anchor) else {
            return matched;
        };
        let Some(matched) = matched else {
            return Some(injected);
        };
        if injected.start() < matched.start() || (priority == Priority::Low && injected.start() == matched.start()) {
            Some(injected)
        } else {
            Some(matched)
        }
    }

    fn match_rule(
        &self,
        text: &str,
        first_line: bool,
        pos: usize,
        stack: &StateStack,
        anchor: Option<usize>,
    ) -> Option<Found> {
        let graph = &self.grammar.graph;
        let end = match &graph.rule(stack.rule_id()).kind {
            RuleKind::BeginEnd {
                end,
                apply_end_pattern_last,
                ..
            } => Some((stack.end_rule().unwrap_or(end), *apply_end_pattern_last)),
            _ => None,
        };

        let ids = graph.patterns(stack.rule_id());
        let mut targets = Vec::with_capacity(ids.len() + 1);
        let mut regexes: Vec<&RegexSource> = Vec::with_capacity(ids.len() + 1);
        if let Some((regex, false)) = end {
            targets.push(Target::End);
            regexes.push(regex);
        }
        for &id in ids {
            if let Some(regex) = graph.rule(id).match_regex() {
                targets.push(Target::Rule(id));
                regexes.push(regex);
            }
        }
        if let Some((regex, true)) = end {
            targets.push(Target::End);
            regexes.push(regex);
        }

        let found = find_best_match(regexes, text, pos, anchor, first_line)?;
        Some(Found {
            target: targets[found.index],
            captures: found.captures,
        })
    }

    fn match_injections(
        &self,
        text: &str,
        first_line: bool,
        pos: usize,
        stack: &StateStack,
        anchor: Option<usize>,
    ) -> Option<(Found, Priority)> {
        let graph = &self.grammar.graph;
        let scopes = stack.scope_names();
        let mut best: Option<(Found, Priority)> = None;

        for injection in graph.injections() {
            if injection.selector.matches(&scopes).is_none() {
                continue;
            }
            let ids: &[RuleId] = match graph.rule(injection.rule).kind {
                RuleKind::IncludeOnly { .. } => graph.patterns(injection.rule),
                _ => std::slice::from_ref(&injection.rule),
            };
            let (targets, regexes): (Vec<RuleId>, Vec<&RegexSource>) = ids
                .iter()
                .filter_map(|&id| graph.rule(id).match_regex().map(|regex| (id, regex)))
                .unzip();
            let Some(found) = find_best_match(regexes, text, pos, anchor, first_line) else {
                continue;
            };
            let found = Found {
                target: Target::Rule(targets[found.index]),
                captures: found.captures,
            };
            if best.as_ref().map_or(true, |(b, _)| found.start() < b.start()) {
                let at_pos = found.start() == pos;
                best = Some((found, injection.priority()));
                if at_pos {
                    break;
                }
            }
        }
        best
    }

    /// Emit nested tokens for capture groups. Groups are visited in index
    /// order, which for well formed patterns is also start order, and each
    /// group's scope stays open until the text it covers has been emitted.
    fn handle_captures(
        &self,
        text: &str,
        first_line: bool,
        stack: &StateStack,
        tokens: &mut LineTokens<'_>,
        rules: &[Option<RuleId>],
        captures: &[Option<(usize, usize)>],
    ) {
        if rules.is_empty() {
            return;
        }
        let graph = &self.grammar.graph;
        let max_end = captures[0].map_or(0, |(_, end)| end);
        let mut open: Vec<(ScopeStack, usize)> = Vec::new();

        for (rule, capture) in rules.iter().zip(captures) {
            let (Some(rule), Some((start, end))) = (rule, *capture) else {
                continue;
            };
            if start == end {
                continue;
            }
            if start > max_end {
                break;
            }

            while let Some((scopes, open_end)) = open.last() {
                if *open_end > start {
                    break;
                }
                tokens.produce_scopes(scopes, *open_end);
                open.pop();
            }
            match open.last() {
                Some((scopes, _)) => tokens.produce_scopes(scopes, start),
                None => tokens.produce(stack, start),
            }

            let capture_rule = graph.rule(*rule);
            let name = capture_rule.name(text, captures);
            if let RuleKind::Capture { retokenize: Some(nested) } = capture_rule.kind {
                let name_scopes = self.grammar.push_scopes(stack.content_scopes(), name.as_deref());
                let content_name = capture_rule.content_name(text, captures);
                let content_scopes = self.grammar.push_scopes(&name_scopes, content_name.as_deref());
                let nested_stack = stack.push(nested, Some(start), None, false, None, name_scopes, content_scopes);
                self.tokenize_string(&text[..end], first_line && start == 0, start, nested_stack, tokens, false);
                continue;
            }

            if let Some(name) = name {
                let base = match open.last() {
                    Some((scopes, _)) => scopes.clone(),
                    None => stack.content_scopes().clone(),
                };
                open.push((self.grammar.push_scopes(&base, Some(&name)), end));
            }
        }

        while let Some((scopes, end)) = open.pop() {
            tokens.produce_scopes(&scopes, end);
        }
    }
}

struct WhileCheck {
    stack: StateStack,
    pos: usize,
    anchor: Option<usize>,
    first_line: bool,
}

/// Emit the character at `pos` under the scopes of `stack`. `None` once the
/// text is exhausted, after emitting up to its end.
fn step(text: &str, pos: usize, stack: &StateStack, tokens: &mut LineTokens<'_>) -> Option<usize> {
    match text[pos..].chars().next() {
        Some(c) => {
            let next = pos + c.len_utf8();
            tokens.produce(stack, next);
            Some(next)
        }
        None => {
            tokens.produce(stack, text.len());
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::super::attrs::{self, StandardTokenType};
    use super::super::GrammarConfiguration;
    use super::*;
    use crate::grammar::RawGrammar;
    use crate::theme::{Rgb, Theme, ThemeSetting};
    use pretty_assertions::assert_eq;
    use proptest::prelude::*;

    const GRAMMAR: &str = r##"{
        "scopeName": "source.t",
        "patterns": [
            { "include": "#comment" },
            { "include": "#block" },
            { "include": "#string" },
            { "match": "\\b(let)\\s+(\\w+)", "captures": {
                "1": { "name": "keyword.declaration" },
                "2": { "name": "variable.name" }
            } },
            { "match": "\\d+", "name": "constant.numeric" }
        ],
        "repository": {
            "comment": { "begin": "/\\*", "end": "\\*/", "name": "comment.block" },
            "block": {
                "begin": "\\{", "end": "\\}", "name": "meta.block",
                "beginCaptures": { "0": { "name": "punctuation.begin" } },
                "endCaptures": { "0": { "name": "punctuation.end" } },
                "patterns": [ { "include": "$self" } ]
            },
            "string": {
                "begin": "\"", "end": "\"", "name": "string.quoted",
                "patterns": [ { "match": "\\\\.", "name": "constant.character.escape" } ]
            }
        }
    }"##;

    fn grammar(json: &str) -> Grammar {
        Grammar::from_json(json).unwrap()
    }

    /// `(text, innermost scope)` for each token
    fn simple(line: &str, tokens: &[Token]) -> Vec<(String, String)> {
        tokens
            .iter()
            .map(|t| (line[t.start..t.end].to_string(), t.scope().unwrap_or_default().to_string()))
            .collect()
    }

    fn pairs(items: &[(&str, &str)]) -> Vec<(String, String)> {
        items.iter().map(|(a, b)| (a.to_string(), b.to_string())).collect()
    }

    fn assert_covers(line: &str, tokens: &[Token]) {
        assert!(!tokens.is_empty());
        assert_eq!(tokens[0].start, 0);
        for pair in tokens.windows(2) {
            assert_eq!(pair[0].end, pair[1].start, "tokens must be contiguous: {tokens:?}");
        }
        assert_eq!(tokens.last().unwrap().end, line.len());
    }

    #[test]
    fn test_balanced_block() {
        let grammar = grammar(GRAMMAR);
        let line = "{ a }";
        let result = grammar.tokenize_line(line, None, None);
        assert_eq!(
            simple(line, &result.tokens),
            pairs(&[("{", "punctuation.begin"), (" a ", "meta.block"), ("}", "punctuation.end")])
        );
        assert_eq!(result.tokens[1].scopes, vec!["source.t", "meta.block"]);
        assert_eq!(result.state, grammar.initial_state());
        assert!(!result.stopped_early);
    }

    #[test]
    fn test_state_carries_across_lines() {
        let grammar = grammar(GRAMMAR);
        let first = grammar.tokenize_line("x /* open", None, None);
        assert_eq!(first.state.scope_names(), vec!["source.t", "comment.block"]);
        assert_ne!(first.state, grammar.initial_state());

        let second = grammar.tokenize_line("still */ 42", Some(&first.state), None);
        assert_eq!(
            simple("still */ 42", &second.tokens),
            pairs(&[
                ("still ", "comment.block"),
                ("*/", "comment.block"),
                (" ", "source.t"),
                ("42", "constant.numeric"),
            ])
        );
        assert_eq!(second.state, grammar.initial_state());
    }

    #[test]
    fn test_match_captures() {
        let grammar = grammar(GRAMMAR);
        let line = "let answer = 42";
        let result = grammar.tokenize_line(line, None, None);
        assert_eq!(
            simple(line, &result.tokens),
            pairs(&[
                ("let", "keyword.declaration"),
                (" ", "source.t"),
                ("answer", "variable.name"),
                (" = ", "source.t"),
                ("42", "constant.numeric"),
            ])
        );
    }

    #[test]
    fn test_nested_string_escape() {
        let grammar = grammar(GRAMMAR);
        let line = r#"{"a\"b"}"#;
        let result = grammar.tokenize_line(line, None, None);
        let escape = result
            .tokens
            .iter()
            .find(|t| t.scope() == Some("constant.character.escape"))
            .unwrap();
        assert_eq!(escape.scopes, vec!["source.t", "meta.block", "string.quoted", "constant.character.escape"]);
        assert_covers(line, &result.tokens);
    }

    #[test]
    fn test_empty_line() {
        let grammar = grammar(GRAMMAR);
        let result = grammar.tokenize_line("", None, None);
        assert_eq!(result.tokens.len(), 1);
        assert_eq!((result.tokens[0].start, result.tokens[0].end), (0, 0));
        assert_eq!(result.tokens[0].scopes, vec!["source.t"]);

        let binary = grammar.tokenize_line2("", None, None);
        assert_eq!(binary.tokens.len(), 2);
        assert_eq!(binary.tokens[0], 0);
    }

    #[test]
    fn test_zero_width_patterns_terminate() {
        let grammar = grammar(
            r#"{
                "scopeName": "source.z",
                "patterns": [
                    { "match": "(?=b)", "name": "lookahead" },
                    { "begin": "(?=c)", "end": "", "name": "empty.block" },
                    { "match": "x*", "name": "maybe" }
                ]
            }"#,
        );
        for line in ["abcabc", "", "ccc", "é b c"] {
            let result = grammar.tokenize_line(line, None, None);
            assert_covers(line, &result.tokens);
        }
    }

    #[test]
    fn test_recursive_zero_width_begin() {
        let grammar = grammar(
            r##"{
                "scopeName": "source.z",
                "patterns": [ { "include": "#loop" } ],
                "repository": {
                    "loop": { "begin": "(?=a)", "end": "(?=z)", "name": "meta.loop",
                              "patterns": [ { "include": "#loop" } ] }
                }
            }"##,
        );
        let result = grammar.tokenize_line("aaa", None, None);
        assert_covers("aaa", &result.tokens);
    }

    #[test]
    fn test_while_rule() {
        let grammar = grammar(
            r#"{
                "scopeName": "text.q",
                "patterns": [
                    { "begin": "^>", "while": "^>", "name": "markup.quote",
                      "beginCaptures": { "0": { "name": "punctuation.quote" } },
                      "whileCaptures": { "0": { "name": "punctuation.quote" } } }
                ]
            }"#,
        );
        let lines = grammar.tokenize_lines(["> a", "> b", "c"]);
        assert_eq!(simple("> a", &lines[0]), pairs(&[(">", "punctuation.quote"), (" a", "markup.quote")]));
        assert_eq!(simple("> b", &lines[1]), pairs(&[(">", "punctuation.quote"), (" b", "markup.quote")]));
        assert_eq!(simple("c", &lines[2]), pairs(&[("c", "text.q")]));
    }

    #[test]
    fn test_while_rule_with_back_reference() {
        let grammar = grammar(
            r#"{
                "scopeName": "text.n",
                "patterns": [ { "begin": "^(\\w+):", "while": "^\\1:", "name": "meta.section" } ]
            }"#,
        );
        let lines = grammar.tokenize_lines(["note: a", "note: b", "x"]);
        assert_eq!(
            simple("note: b", &lines[1]),
            pairs(&[("note:", "meta.section"), (" b", "meta.section")])
        );
        assert_eq!(simple("x", &lines[2]), pairs(&[("x", "text.n")]));

        let first = grammar.tokenize_line("note: a", None, None);
        let other = grammar.tokenize_line("todo: a", Some(&first.state), None);
        assert_eq!(other.state.scope_names(), vec!["text.n", "meta.section"]);
        assert_ne!(other.state, first.state);
    }

    #[test]
    fn test_back_referenced_end() {
        let grammar = grammar(
            r#"{
                "scopeName": "source.h",
                "patterns": [ { "begin": "<<(\\w+)", "end": "^\\1$", "name": "string.heredoc" } ]
            }"#,
        );
        let first = grammar.tokenize_line("cat <<EOF", None, None);
        let middle = grammar.tokenize_line("END", Some(&first.state), None);
        assert_eq!(middle.state.scope_names(), vec!["source.h", "string.heredoc"]);
        let last = grammar.tokenize_line("EOF", Some(&middle.state), None);
        assert_eq!(last.state, grammar.initial_state());

        let other = grammar.tokenize_line("cat <<END", None, None);
        assert_ne!(other.state, first.state);
    }

    #[test]
    fn test_resolved_end_patterns_are_bounded() {
        let grammar = grammar(
            r#"{
                "scopeName": "source.h",
                "patterns": [ { "begin": "<<(\\w+)", "end": "^\\1$", "name": "string.heredoc" } ]
            }"#,
        );
        let first = grammar.tokenize_line("cat <<T0", None, None);
        for i in 1..crate::grammar::END_RULE_CACHE_LIMIT + 10 {
            grammar.tokenize_line(&format!("cat <<T{i}"), None, None);
        }
        assert!(grammar.end_rules.lock().len() <= crate::grammar::END_RULE_CACHE_LIMIT);

        let last = grammar.tokenize_line("T0", Some(&first.state), None);
        assert_eq!(last.state, grammar.initial_state());
    }

    #[test]
    fn test_apply_end_pattern_last() {
        let json = |last: bool| {
            format!(
                r#"{{
                    "scopeName": "source.e",
                    "patterns": [ {{ "begin": "<", "end": ">", "name": "tag", "applyEndPatternLast": {last},
                                     "patterns": [ {{ "match": ">>", "name": "shift" }} ] }} ]
                }}"#
            )
        };
        let line = "<a>>b";
        let first = grammar(&json(false)).tokenize_line(line, None, None);
        assert_eq!(first.state, grammar(&json(false)).initial_state());

        let last = grammar(&json(true)).tokenize_line(line, None, None);
        assert!(last.tokens.iter().any(|t| t.scope() == Some("shift")));
        assert_eq!(last.state.scope_names(), vec!["source.e", "tag"]);
    }

    #[test]
    fn test_capture_patterns_are_tokenized() {
        let grammar = grammar(
            r##"{
                "scopeName": "source.c",
                "patterns": [ { "match": "#(\\w+ \\d+)", "name": "meta.directive", "captures": {
                    "1": { "name": "meta.args", "patterns": [ { "match": "\\d+", "name": "constant.numeric" } ] }
                } } ]
            }"##,
        );
        let line = "#line 42";
        let result = grammar.tokenize_line(line, None, None);
        assert_eq!(
            simple(line, &result.tokens),
            pairs(&[("#", "meta.directive"), ("line ", "meta.args"), ("42", "constant.numeric")])
        );
        assert_eq!(result.tokens[2].scopes, vec!["source.c", "meta.directive", "meta.args", "constant.numeric"]);
    }

    #[test]
    fn test_injection() {
        let grammar = grammar(
            r##"{
                "scopeName": "source.i",
                "patterns": [ { "begin": "#", "end": "$", "name": "comment.line" }, { "match": "TODO", "name": "plain.todo" } ],
                "injections": { "L:comment": { "patterns": [ { "match": "TODO", "name": "keyword.todo" } ] } }
            }"##,
        );
        let line = "TODO # TODO";
        let result = grammar.tokenize_line(line, None, None);
        assert_eq!(
            simple(line, &result.tokens),
            pairs(&[
                ("TODO", "plain.todo"),
                (" ", "source.i"),
                ("#", "comment.line"),
                (" ", "comment.line"),
                ("TODO", "keyword.todo"),
            ])
        );
    }

    #[test]
    fn test_name_template_from_capture() {
        let grammar = grammar(
            r#"{
                "scopeName": "source.n",
                "patterns": [ { "match": "@(\\w+)", "name": "storage.${1:/downcase}" } ]
            }"#,
        );
        let result = grammar.tokenize_line("@Inline", None, None);
        assert_eq!(result.tokens[0].scope(), Some("storage.inline"));
    }

    #[test]
    fn test_time_budget() {
        let grammar = grammar(GRAMMAR);
        let prior = grammar.tokenize_line("/* open", None, None).state;
        let line = "let x = 1 */ {";
        let result = grammar.tokenize_line(line, Some(&prior), Some(Duration::ZERO));
        assert!(result.stopped_early);
        assert_eq!(result.state, prior);
        assert_covers(line, &result.tokens);
    }

    #[test]
    fn test_binary_tokens_merge() {
        let grammar = grammar(GRAMMAR);
        let result = grammar.tokenize_line2("a b 1", None, None);
        // Numbers carry no attributes of their own, so the whole line is one token
        assert_eq!(result.tokens.len(), 2);
        assert_eq!(result.tokens[0], 0);

        let config = GrammarConfiguration {
            token_types: [("constant".to_string(), StandardTokenType::String)].into_iter().collect(),
            ..Default::default()
        };
        let typed = Grammar::new(Arc::new(RawGrammar::from_json(GRAMMAR).unwrap()), None, &config).unwrap();
        let result = typed.tokenize_line2("a b 1", None, None);
        assert_eq!(result.tokens.len(), 4);
        assert_eq!(result.tokens[2], 4);
        assert_eq!(attrs::token_type(result.tokens[3]), StandardTokenType::String);
    }

    #[test]
    fn test_standard_types_and_theme_metadata() {
        let grammar = grammar(GRAMMAR);
        let theme = Arc::new(Theme::new(
            None,
            vec![ThemeSetting::new("comment").foreground(Rgb::new(0, 128, 0))],
            &[],
        ));
        grammar.set_theme(Some(Arc::clone(&theme)));

        let result = grammar.tokenize_line("1 /* c */", None, None);
        let comment = result.tokens.iter().find(|t| t.scope() == Some("comment.block")).unwrap();
        assert_eq!(attrs::token_type(comment.metadata), StandardTokenType::Comment);
        assert_eq!(theme.color(attrs::foreground(comment.metadata)), Some(Rgb::new(0, 128, 0)));
        assert_eq!(attrs::foreground(result.tokens[0].metadata), 0);
    }

    #[test]
    fn test_first_line_anchor() {
        let grammar = grammar(
            r#"{ "scopeName": "source.sh", "patterns": [ { "match": "\\A#!.*", "name": "comment.shebang" } ] }"#,
        );
        let first = grammar.tokenize_line("#!/bin/sh", None, None);
        assert_eq!(first.tokens[0].scope(), Some("comment.shebang"));
        let later = grammar.tokenize_line("#!/bin/sh", Some(&first.state), None);
        assert_eq!(later.tokens[0].scope(), Some("source.sh"));
    }

    proptest! {
        #[test]
        fn prop_tokens_cover_line(line in "[a-z0-9 {}/*\"\\\\é]{0,40}") {
            let grammar = grammar(GRAMMAR);
            let first = grammar.tokenize_line(&line, None, None);
            assert_covers(&line, &first.tokens);
            for token in &first.tokens {
                prop_assert!(line.is_char_boundary(token.start) && line.is_char_boundary(token.end));
            }

            let again = grammar.tokenize_line(&line, None, None);
            prop_assert_eq!(&first.tokens, &again.tokens);
            prop_assert_eq!(&first.state, &again.state);
        }
    }
}
