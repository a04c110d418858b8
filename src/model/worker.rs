//! Background tokenizer loop
//!
//! The worker owns the only write path for line slots. It drains messages,
//! then runs passes from the first invalid line until a line's end state
//! matches the one stored before and the next line is valid. Any message
//! that arrives mid pass aborts it; the pass restarts from the first invalid
//! line once the message is applied.

use std::ops::RangeInclusive;
use std::sync::Arc;
use std::time::Duration;

use crossbeam_channel::{Receiver, Sender, TryRecvError};
use parking_lot::{Mutex, RwLock};
use tracing::{debug, trace, warn};

use super::cache::{merge_ranges, shift_ranges, BackgroundState, LineCache};
use super::document::{Document, DocumentEdit};
use super::ModelEvent;
use crate::grammar::{Grammar, StateStack, Token};

pub(crate) enum Message {
    Edit { edit: DocumentEdit, seq: u64 },
    Invalidate { line: usize, seq: u64 },
    InvalidateAll { seq: u64 },
    SetGrammar { grammar: Arc<Grammar>, seq: u64 },
    Shutdown,
}

/// State shared between the model handle and its worker
pub(crate) struct Shared {
    pub cache: RwLock<LineCache>,
    pub subscribers: Mutex<Vec<Sender<ModelEvent>>>,
}

impl Shared {
    pub fn emit(&self, event: ModelEvent) {
        self.subscribers
            .lock()
            .retain(|subscriber| subscriber.send(event.clone()).is_ok());
    }
}

pub(crate) struct Worker {
    shared: Arc<Shared>,
    document: Arc<dyn Document>,
    grammar: Arc<Grammar>,
    rx: Receiver<Message>,
    /// Sequence number of the last message applied to the slots
    applied_seq: u64,
    /// Lines re-tokenized since the last notification
    changed: Vec<RangeInclusive<usize>>,
    /// Last background state sent to subscribers
    reported: BackgroundState,
    max_line_length: usize,
    line_time_budget: Option<Duration>,
}

enum Pass {
    Done,
    Superseded,
}

impl Worker {
    pub fn new(
        shared: Arc<Shared>,
        document: Arc<dyn Document>,
        grammar: Arc<Grammar>,
        rx: Receiver<Message>,
        max_line_length: usize,
        line_time_budget: Option<Duration>,
    ) -> Self {
        Self {
            shared,
            document,
            grammar,
            rx,
            applied_seq: 0,
            changed: Vec::new(),
            reported: BackgroundState::Completed,
            max_line_length,
            line_time_budget,
        }
    }

    pub fn run(mut self) {
        trace!(scope = %self.grammar.scope_name(), "tokenizer worker started");
        loop {
            let message = if self.next_line().is_some() {
                match self.rx.try_recv() {
                    Ok(message) => Some(message),
                    Err(TryRecvError::Empty) => None,
                    Err(TryRecvError::Disconnected) => break,
                }
            } else {
                self.finish();
                match self.rx.recv() {
                    Ok(message) => Some(message),
                    Err(_) => break,
                }
            };

            match message {
                Some(Message::Shutdown) => break,
                Some(message) => self.apply(message),
                None => {
                    if let Pass::Superseded = self.pass() {
                        trace!("pass superseded");
                    }
                }
            }
        }
        trace!("tokenizer worker stopped");
    }

    fn apply(&mut self, message: Message) {
        let mut cache = self.shared.cache.write();
        match message {
            Message::Edit { edit, seq } => {
                cache.splice(&edit);
                shift_ranges(&mut self.changed, &edit);
                self.applied_seq = seq;
            }
            Message::Invalidate { line, seq } => {
                cache.invalidate(line);
                self.applied_seq = seq;
            }
            Message::InvalidateAll { seq } => {
                cache.invalidate_all();
                self.applied_seq = seq;
            }
            Message::SetGrammar { grammar, seq } => {
                debug!(scope = %grammar.scope_name(), "grammar switched");
                self.grammar = grammar;
                cache.invalidate_all();
                self.applied_seq = seq;
            }
            Message::Shutdown => {}
        }
    }

    fn next_line(&self) -> Option<usize> {
        self.shared.cache.read().first_invalid(0)
    }

    /// Publish what the passes found once nothing is left to do. Events go
    /// out under the cache lock so a subscriber that sees the model idle has
    /// missed none of them.
    fn finish(&mut self) {
        let mut cache = self.shared.cache.write();
        if cache.seq != self.applied_seq {
            return;
        }
        cache.first_pending = cache.slots.len();
        cache.background = BackgroundState::Completed;

        let ranges = merge_ranges(std::mem::take(&mut self.changed));
        if !ranges.is_empty() {
            debug!(?ranges, "tokens changed");
            self.shared.emit(ModelEvent::TokensChanged { ranges });
        }
        if self.reported != BackgroundState::Completed {
            self.reported = BackgroundState::Completed;
            self.shared
                .emit(ModelEvent::BackgroundStateChanged(BackgroundState::Completed));
        }
    }

    fn report(&mut self, state: BackgroundState) {
        if self.reported != state {
            self.reported = state;
            self.shared.emit(ModelEvent::BackgroundStateChanged(state));
        }
    }

    fn pass(&mut self) -> Pass {
        let Some(start) = self.next_line() else {
            return Pass::Done;
        };
        self.report(BackgroundState::InProgress);
        debug!(start, "tokenization pass");

        let mut line = start;
        loop {
            if !self.rx.is_empty() {
                self.record(start, line);
                return Pass::Superseded;
            }

            let prior = if line == 0 {
                None
            } else {
                self.shared.cache.read().slots.get(line - 1).and_then(|slot| slot.end_state.clone())
            };
            let Some(text) = self.document.line_text(line) else {
                let mut cache = self.shared.cache.write();
                if cache.seq == self.applied_seq {
                    warn!(line, lines = cache.slots.len(), "document is shorter than its line cache");
                    cache.slots.truncate(line);
                }
                drop(cache);
                self.record(start, line);
                return Pass::Done;
            };
            let (tokens, end_state) = self.tokenize(&text, prior.as_ref());
            trace!(line, tokens = tokens.len(), "line tokenized");

            let mut cache = self.shared.cache.write();
            if cache.seq != self.applied_seq || line >= cache.slots.len() {
                drop(cache);
                self.record(start, line);
                return Pass::Superseded;
            }
            let unchanged = cache.slots[line].end_state.as_ref() == Some(&end_state);
            cache.store(line, tokens, end_state);
            let next = line + 1;
            let next_valid = cache.slots.get(next).map_or(true, |slot| !slot.invalid);
            if (unchanged && next_valid) || next >= cache.slots.len() {
                cache.first_pending = cache.first_invalid(next).unwrap_or(cache.slots.len());
                drop(cache);
                self.record(start, next);
                return Pass::Done;
            }
            cache.first_pending = next;
            line = next;
        }
    }

    /// Remember lines `start..end` as re-tokenized
    fn record(&mut self, start: usize, end: usize) {
        if end > start {
            self.changed.push(start..=end - 1);
        }
    }

    fn tokenize(&self, text: &str, prior: Option<&StateStack>) -> (Vec<Token>, StateStack) {
        if text.len() > self.max_line_length {
            let state = prior.cloned().unwrap_or_else(|| self.grammar.initial_state());
            let token = Token {
                start: 0,
                end: text.len(),
                scopes: state.scope_names(),
                metadata: state.content_scopes().metadata(),
            };
            return (vec![token], state);
        }
        let result = self.grammar.tokenize_line(text, prior, self.line_time_budget);
        (result.tokens, result.state)
    }
}
