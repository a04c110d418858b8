//! Per line tokenization cache
//!
//! Only the worker thread fills slots. Edits lower `first_pending` from the
//! caller's thread before the worker has spliced the slots, so every line at
//! or past it reads as pending.

use std::ops::RangeInclusive;
use std::sync::Arc;

use super::document::DocumentEdit;
use crate::grammar::{StateStack, Token};

/// Tokens of one line as seen by a reader
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LineTokens {
    Ready(Arc<Vec<Token>>),
    /// Not tokenized since the last edit
    Pending,
}

impl LineTokens {
    pub fn is_pending(&self) -> bool {
        matches!(self, Self::Pending)
    }

    pub fn ready(&self) -> Option<&[Token]> {
        match self {
            Self::Ready(tokens) => Some(tokens),
            Self::Pending => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackgroundState {
    InProgress,
    Completed,
}

#[derive(Debug, Clone, Default)]
pub(crate) struct Slot {
    /// State at the end of the line, kept while invalid to detect when a
    /// pass can stop
    pub end_state: Option<StateStack>,
    pub tokens: Option<Arc<Vec<Token>>>,
    pub invalid: bool,
}

impl Slot {
    fn invalid(end_state: Option<StateStack>) -> Self {
        Self {
            end_state,
            tokens: None,
            invalid: true,
        }
    }
}

#[derive(Debug)]
pub(crate) struct LineCache {
    pub slots: Vec<Slot>,
    /// First line that may be out of date
    pub first_pending: usize,
    /// Bumped on every edit, invalidation or grammar switch
    pub seq: u64,
    pub background: BackgroundState,
}

impl LineCache {
    pub fn new(line_count: usize) -> Self {
        Self {
            slots: vec![Slot::invalid(None); line_count],
            first_pending: 0,
            seq: 0,
            background: BackgroundState::InProgress,
        }
    }

    pub fn tokens(&self, line: usize) -> LineTokens {
        if line >= self.first_pending {
            return LineTokens::Pending;
        }
        match self.slots.get(line) {
            Some(Slot {
                tokens: Some(tokens),
                invalid: false,
                ..
            }) => LineTokens::Ready(Arc::clone(tokens)),
            _ => LineTokens::Pending,
        }
    }

    pub fn state(&self, line: usize) -> Option<StateStack> {
        if line >= self.first_pending {
            return None;
        }
        self.slots.get(line).filter(|slot| !slot.invalid)?.end_state.clone()
    }

    /// Note a change that the worker has not applied yet
    pub fn mark_pending(&mut self, line: usize) -> u64 {
        self.first_pending = self.first_pending.min(line);
        self.background = BackgroundState::InProgress;
        self.seq += 1;
        self.seq
    }

    /// Mirror a document edit in the slots
    pub fn splice(&mut self, edit: &DocumentEdit) {
        let len = self.slots.len();
        let start = edit.start_line.min(len);
        let end = start.saturating_add(edit.lines_removed).min(len);

        // The last inserted line takes over the end state of the last removed
        // one, so a pass whose result matches it can stop there.
        let carried = if end > start {
            self.slots[end - 1].end_state.clone()
        } else if start > 0 {
            self.slots[start - 1].end_state.clone()
        } else {
            None
        };
        let mut inserted = vec![Slot::invalid(None); edit.lines_added];
        if let Some(last) = inserted.last_mut() {
            last.end_state = carried;
        }
        self.slots.splice(start..end, inserted);

        // The line after a removal has a new predecessor
        if edit.lines_added == 0 {
            if let Some(slot) = self.slots.get_mut(start) {
                slot.invalid = true;
            }
        }
        self.first_pending = self.first_pending.min(start);
    }

    pub fn invalidate(&mut self, line: usize) {
        if let Some(slot) = self.slots.get_mut(line) {
            slot.invalid = true;
        }
        self.first_pending = self.first_pending.min(line);
    }

    pub fn invalidate_all(&mut self) {
        self.slots.fill(Slot::invalid(None));
        self.first_pending = 0;
    }

    pub fn first_invalid(&self, from: usize) -> Option<usize> {
        self.slots
            .iter()
            .skip(from)
            .position(|slot| slot.invalid)
            .map(|i| i + from)
    }

    pub fn store(&mut self, line: usize, tokens: Vec<Token>, end_state: StateStack) {
        if let Some(slot) = self.slots.get_mut(line) {
            *slot = Slot {
                end_state: Some(end_state),
                tokens: Some(Arc::new(tokens)),
                invalid: false,
            };
        }
    }
}

/// Move already reported line ranges to where `edit` leaves those lines.
/// Lines the edit replaced are dropped; they are re-tokenized and reported
/// again.
pub(crate) fn shift_ranges(ranges: &mut Vec<RangeInclusive<usize>>, edit: &DocumentEdit) {
    let start = edit.start_line;
    let removed_end = start.saturating_add(edit.lines_removed);
    let mut shifted = Vec::with_capacity(ranges.len());
    for range in ranges.drain(..) {
        let (first, last) = (*range.start(), *range.end());
        if first < start {
            shifted.push(first..=last.min(start - 1));
        }
        if last >= removed_end {
            let from = first.max(removed_end);
            shifted.push(from - edit.lines_removed + edit.lines_added..=last - edit.lines_removed + edit.lines_added);
        }
    }
    *ranges = shifted;
}

/// Sort and join overlapping or adjacent ranges
pub(crate) fn merge_ranges(mut ranges: Vec<RangeInclusive<usize>>) -> Vec<RangeInclusive<usize>> {
    ranges.sort_by_key(|range| *range.start());
    let mut merged: Vec<RangeInclusive<usize>> = Vec::with_capacity(ranges.len());
    for range in ranges {
        match merged.last_mut() {
            Some(last) if *range.start() <= last.end() + 1 => {
                if range.end() > last.end() {
                    *last = *last.start()..=*range.end();
                }
            }
            _ => merged.push(range),
        }
    }
    merged
}
