//! Tokenizer state carried from one line to the next
//!
//! Both stacks are persistent linked lists of `Arc` frames: pushing shares the
//! parent, so keeping the end state of every line of a document costs one
//! frame per push rather than a copy of the whole stack.

use std::fmt;
use std::sync::Arc;

use super::regex::RegexSource;
use super::rule::RuleId;

/// Scope names from outermost to innermost, each with the token metadata
/// accumulated up to that scope
#[derive(Clone, Default)]
pub struct ScopeStack(Option<Arc<ScopeNode>>);

struct ScopeNode {
    parent: ScopeStack,
    scope: String,
    metadata: u32,
}

impl ScopeStack {
    pub fn empty() -> Self {
        Self(None)
    }

    pub fn push(&self, scope: impl Into<String>, metadata: u32) -> Self {
        Self(Some(Arc::new(ScopeNode {
            parent: self.clone(),
            scope: scope.into(),
            metadata,
        })))
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_none()
    }

    /// Innermost scope
    pub fn scope(&self) -> Option<&str> {
        self.0.as_ref().map(|node| node.scope.as_str())
    }

    /// Metadata of the innermost scope, 0 when empty
    pub fn metadata(&self) -> u32 {
        self.0.as_ref().map_or(0, |node| node.metadata)
    }

    pub fn parent(&self) -> Option<&ScopeStack> {
        self.0.as_ref().map(|node| &node.parent)
    }

    fn iter(&self) -> impl Iterator<Item = &ScopeNode> {
        std::iter::successors(self.0.as_deref(), |node| node.parent.0.as_deref())
    }

    /// Scope names, outermost first
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.iter().map(|node| node.scope.clone()).collect();
        names.reverse();
        names
    }

    pub fn len(&self) -> usize {
        self.iter().count()
    }

    fn same_names(&self, other: &ScopeStack) -> bool {
        let mut a = self;
        let mut b = other;
        loop {
            match (&a.0, &b.0) {
                (None, None) => return true,
                (Some(x), Some(y)) => {
                    if Arc::ptr_eq(x, y) {
                        return true;
                    }
                    if x.scope != y.scope {
                        return false;
                    }
                    a = &x.parent;
                    b = &y.parent;
                }
                _ => return false,
            }
        }
    }
}

impl PartialEq for ScopeStack {
    fn eq(&self, other: &Self) -> bool {
        self.same_names(other)
    }
}

impl Eq for ScopeStack {}

impl fmt::Debug for ScopeStack {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.names()).finish()
    }
}

/// The nesting of open begin/end and begin/while rules at the end of a line
///
/// Two states compare equal when they would tokenize any following line the
/// same way: same rules, same resolved end patterns and same scopes. Positions
/// within the line they were produced on are ignored.
#[derive(Clone)]
pub struct StateStack(Arc<Frame>);

struct Frame {
    parent: Option<StateStack>,
    depth: usize,
    rule_id: RuleId,
    /// Where the rule's begin match started, on the line it was pushed
    enter_pos: Option<usize>,
    /// `\G` position in effect before the push, restored when the frame pops
    anchor_pos: Option<usize>,
    begin_rule_captured_eol: bool,
    /// End or while pattern with back references already substituted
    end_rule: Option<Arc<RegexSource>>,
    name_scopes: ScopeStack,
    content_scopes: ScopeStack,
}

impl StateStack {
    pub(crate) fn root(rule_id: RuleId, scopes: ScopeStack) -> Self {
        Self(Arc::new(Frame {
            parent: None,
            depth: 1,
            rule_id,
            enter_pos: None,
            anchor_pos: None,
            begin_rule_captured_eol: false,
            end_rule: None,
            name_scopes: scopes.clone(),
            content_scopes: scopes,
        }))
    }

    #[allow(clippy::too_many_arguments)]
    pub(crate) fn push(
        &self,
        rule_id: RuleId,
        enter_pos: Option<usize>,
        anchor_pos: Option<usize>,
        begin_rule_captured_eol: bool,
        end_rule: Option<Arc<RegexSource>>,
        name_scopes: ScopeStack,
        content_scopes: ScopeStack,
    ) -> Self {
        Self(Arc::new(Frame {
            parent: Some(self.clone()),
            depth: self.0.depth + 1,
            rule_id,
            enter_pos,
            anchor_pos,
            begin_rule_captured_eol,
            end_rule,
            name_scopes,
            content_scopes,
        }))
    }

    /// The enclosing state, `None` at the root
    pub fn pop(&self) -> Option<StateStack> {
        self.0.parent.clone()
    }

    /// Like [`pop`](Self::pop) but the root pops to itself
    pub(crate) fn safe_pop(&self) -> StateStack {
        self.pop().unwrap_or_else(|| self.clone())
    }

    fn replace(&self, f: impl FnOnce(&mut Frame)) -> Self {
        let frame = &self.0;
        let mut copy = Frame {
            parent: frame.parent.clone(),
            depth: frame.depth,
            rule_id: frame.rule_id,
            enter_pos: frame.enter_pos,
            anchor_pos: frame.anchor_pos,
            begin_rule_captured_eol: frame.begin_rule_captured_eol,
            end_rule: frame.end_rule.clone(),
            name_scopes: frame.name_scopes.clone(),
            content_scopes: frame.content_scopes.clone(),
        };
        f(&mut copy);
        Self(Arc::new(copy))
    }

    pub(crate) fn with_content_scopes(&self, content_scopes: ScopeStack) -> Self {
        self.replace(|frame| frame.content_scopes = content_scopes)
    }

    pub(crate) fn with_end_rule(&self, end_rule: Arc<RegexSource>) -> Self {
        self.replace(|frame| frame.end_rule = Some(end_rule))
    }

    pub fn depth(&self) -> usize {
        self.0.depth
    }

    pub fn rule_id(&self) -> RuleId {
        self.0.rule_id
    }

    pub(crate) fn enter_pos(&self) -> Option<usize> {
        self.0.enter_pos
    }

    pub(crate) fn anchor_pos(&self) -> Option<usize> {
        self.0.anchor_pos
    }

    pub(crate) fn begin_rule_captured_eol(&self) -> bool {
        self.0.begin_rule_captured_eol
    }

    pub(crate) fn end_rule(&self) -> Option<&Arc<RegexSource>> {
        self.0.end_rule.as_ref()
    }

    pub fn name_scopes(&self) -> &ScopeStack {
        &self.0.name_scopes
    }

    pub fn content_scopes(&self) -> &ScopeStack {
        &self.0.content_scopes
    }

    /// Scope names applied to text inside the innermost rule
    pub fn scope_names(&self) -> Vec<String> {
        self.0.content_scopes.names()
    }

    /// Frames from innermost to outermost
    pub(crate) fn frames(&self) -> impl Iterator<Item = &StateStack> {
        std::iter::successors(Some(self), |state| state.0.parent.as_ref())
    }

    /// Whether a frame for `rule_id` was entered at `enter_pos` below this one.
    /// Pushing it again without consuming text would never terminate.
    pub(crate) fn has_same_rule_as(&self, rule_id: RuleId, enter_pos: Option<usize>, valid_above: usize) -> bool {
        self.frames()
            .take_while(|state| state.depth() > valid_above && state.enter_pos() == enter_pos)
            .any(|state| state.rule_id() == rule_id)
    }
}

impl PartialEq for StateStack {
    fn eq(&self, other: &Self) -> bool {
        let mut a = self;
        let mut b = other;
        loop {
            if Arc::ptr_eq(&a.0, &b.0) {
                return true;
            }
            if a.0.depth != b.0.depth
                || a.0.rule_id != b.0.rule_id
                || !same_end_rule(&a.0.end_rule, &b.0.end_rule)
                || a.0.name_scopes != b.0.name_scopes
                || a.0.content_scopes != b.0.content_scopes
            {
                return false;
            }
            match (&a.0.parent, &b.0.parent) {
                (Some(pa), Some(pb)) => {
                    a = pa;
                    b = pb;
                }
                (None, None) => return true,
                _ => return false,
            }
        }
    }
}

impl Eq for StateStack {}

fn same_end_rule(a: &Option<Arc<RegexSource>>, b: &Option<Arc<RegexSource>>) -> bool {
    match (a, b) {
        (None, None) => true,
        (Some(a), Some(b)) => Arc::ptr_eq(a, b) || a.source() == b.source(),
        _ => false,
    }
}

impl fmt::Debug for StateStack {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut frames: Vec<_> = self.frames().collect();
        frames.reverse();
        let mut list = f.debug_list();
        for state in frames {
            list.entry(&format_args!(
                "{}{:?}",
                state.rule_id().index(),
                state.content_scopes().scope()
            ));
        }
        list.finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn id(index: u32) -> RuleId {
        RuleId::new(index)
    }

    fn root() -> StateStack {
        StateStack::root(id(0), ScopeStack::empty().push("source.t", 1))
    }

    #[test]
    fn test_scope_stack() {
        let scopes = ScopeStack::empty().push("source.t", 1).push("string.quoted", 7);
        assert_eq!(scopes.names(), vec!["source.t", "string.quoted"]);
        assert_eq!(scopes.scope(), Some("string.quoted"));
        assert_eq!(scopes.metadata(), 7);
        assert_eq!(scopes.len(), 2);
        assert_eq!(scopes.parent().unwrap().scope(), Some("source.t"));
        assert_eq!(ScopeStack::empty().metadata(), 0);
    }

    #[test]
    fn test_scope_equality_ignores_metadata() {
        let a = ScopeStack::empty().push("a", 1).push("b", 2);
        let b = ScopeStack::empty().push("a", 5).push("b", 6);
        let c = ScopeStack::empty().push("a", 1).push("c", 2);
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_ne!(a, ScopeStack::empty().push("b", 2));
    }

    #[test]
    fn test_push_pop() {
        let root = root();
        let scopes = root.content_scopes().push("string", 0);
        let pushed = root.push(id(3), Some(4), Some(5), false, None, scopes.clone(), scopes);
        assert_eq!(pushed.depth(), 2);
        assert_eq!(pushed.scope_names(), vec!["source.t", "string"]);
        assert_eq!(pushed.pop().unwrap(), root);
        assert!(root.pop().is_none());
        assert_eq!(root.safe_pop(), root);
    }

    #[test]
    fn test_equality_ignores_positions() {
        let root = root();
        let scopes = root.content_scopes().push("comment", 0);
        let a = root.push(id(2), Some(0), Some(2), false, None, scopes.clone(), scopes.clone());
        let b = root.push(id(2), Some(7), Some(9), true, None, scopes.clone(), scopes.clone());
        assert_eq!(a, b);

        let other_rule = root.push(id(3), Some(0), Some(2), false, None, scopes.clone(), scopes.clone());
        assert_ne!(a, other_rule);

        let end = Arc::new(RegexSource::new("^EOF$").unwrap());
        let with_end = a.with_end_rule(Arc::clone(&end));
        assert_ne!(a, with_end);
        let same_end = b.with_end_rule(Arc::new(RegexSource::new("^EOF$").unwrap()));
        assert_eq!(with_end, same_end);

        let rescoped = a.with_content_scopes(scopes.push("inner", 0));
        assert_ne!(a, rescoped);
        assert_eq!(rescoped.pop().unwrap(), root);
    }

    #[test]
    fn test_same_rule_detection() {
        let root = root();
        let scopes = root.content_scopes().clone();
        let a = root.push(id(2), Some(3), Some(3), false, None, scopes.clone(), scopes.clone());
        let b = a.push(id(4), Some(3), Some(3), false, None, scopes.clone(), scopes);
        assert!(b.has_same_rule_as(id(2), Some(3), 1));
        assert!(!b.has_same_rule_as(id(2), Some(4), 1));
        // Frames from earlier lines do not count
        assert!(!b.has_same_rule_as(id(2), Some(3), 2));
    }
}
