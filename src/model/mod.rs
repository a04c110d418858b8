//! Incremental background tokenization
//!
//! A [`TokenizationModel`] keeps the tokens and end state of every line of a
//! document, re-tokenizing on a dedicated thread as edits come in. Readers
//! never block: lines not yet re-tokenized since the last edit report
//! [`LineTokens::Pending`].

mod cache;
mod document;
mod worker;

use std::ops::RangeInclusive;
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use crossbeam_channel::{Receiver, Sender};
use parking_lot::{Mutex, RwLock};
use tracing::{trace, warn};

pub use self::cache::{BackgroundState, LineTokens};
pub use self::document::{Document, DocumentEdit, TextDocument};

use self::cache::LineCache;
use self::worker::{Message, Shared, Worker};
use crate::config::Config;
use crate::error::Result;
use crate::grammar::{Grammar, StateStack};
use crate::theme::Theme;

/// Notifications sent to [`TokenizationModel::subscribe`] receivers
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ModelEvent {
    /// Lines whose tokens were replaced, sorted and disjoint
    TokensChanged { ranges: Vec<RangeInclusive<usize>> },
    BackgroundStateChanged(BackgroundState),
}

pub struct TokenizationModel {
    shared: Arc<Shared>,
    document: Arc<dyn Document>,
    grammar: Mutex<Arc<Grammar>>,
    tx: Sender<Message>,
    handle: Option<JoinHandle<()>>,
}

impl TokenizationModel {
    /// Start tokenizing `document` in the background
    pub fn new(document: Arc<dyn Document>, grammar: Arc<Grammar>, config: &Config) -> Result<Self> {
        let shared = Arc::new(Shared {
            cache: RwLock::new(LineCache::new(document.line_count())),
            subscribers: Mutex::new(Vec::new()),
        });
        let (tx, rx) = crossbeam_channel::unbounded();
        let worker = Worker::new(
            Arc::clone(&shared),
            Arc::clone(&document),
            Arc::clone(&grammar),
            rx,
            config.tokenizer.max_line_length,
            config.line_time_budget(),
        );
        let handle = thread::Builder::new()
            .name(config.scheduler.thread_name.clone())
            .spawn(move || worker.run())?;
        trace!(thread = %config.scheduler.thread_name, "tokenizer thread spawned");

        Ok(Self {
            shared,
            document,
            grammar: Mutex::new(grammar),
            tx,
            handle: Some(handle),
        })
    }

    /// Receive events for changes made after this call
    pub fn subscribe(&self) -> Receiver<ModelEvent> {
        let (tx, rx) = crossbeam_channel::unbounded();
        let _cache = self.shared.cache.read();
        self.shared.subscribers.lock().push(tx);
        rx
    }

    pub fn document(&self) -> &Arc<dyn Document> {
        &self.document
    }

    pub fn grammar(&self) -> Arc<Grammar> {
        Arc::clone(&self.grammar.lock())
    }

    /// Report an edit already applied to the document
    pub fn apply_edit(&self, edit: DocumentEdit) {
        self.send(edit.start_line, |seq| Message::Edit { edit, seq });
    }

    /// Re-tokenize a line whose text did not change
    pub fn invalidate_line(&self, line: usize) {
        self.send(line, |seq| Message::Invalidate { line, seq });
    }

    /// Re-tokenize the whole document with another grammar
    pub fn set_grammar(&self, grammar: Arc<Grammar>) {
        *self.grammar.lock() = Arc::clone(&grammar);
        self.send(0, |seq| Message::SetGrammar { grammar, seq });
    }

    /// Switch the theme behind token metadata. Every line is re-tokenized
    /// from the first, since cached states carry the old theme's color ids.
    pub fn set_theme(&self, theme: Option<Arc<Theme>>) {
        self.grammar.lock().set_theme(theme);
        self.send(0, |seq| Message::InvalidateAll { seq });
    }

    pub fn line_tokens(&self, line: usize) -> LineTokens {
        self.shared.cache.read().tokens(line)
    }

    /// State at the end of `line`, `None` while pending
    pub fn line_state(&self, line: usize) -> Option<StateStack> {
        self.shared.cache.read().state(line)
    }

    pub fn background_state(&self) -> BackgroundState {
        self.shared.cache.read().background
    }

    fn send(&self, line: usize, message: impl FnOnce(u64) -> Message) {
        // The message is queued before the lock is released so the worker
        // always finds it once it sees the new sequence number
        let mut cache = self.shared.cache.write();
        let seq = cache.mark_pending(line);
        if self.tx.send(message(seq)).is_err() {
            warn!("tokenizer thread is gone");
        }
    }
}

impl Drop for TokenizationModel {
    fn drop(&mut self) {
        let _ = self.tx.send(Message::Shutdown);
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                warn!("tokenizer thread panicked");
            }
        }
    }
}

impl std::fmt::Debug for TokenizationModel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenizationModel")
            .field("grammar", &self.grammar.lock().scope_name())
            .field("background", &self.background_state())
            .finish_non_exhaustive()
    }
}
