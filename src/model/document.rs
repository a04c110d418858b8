//! Line oriented documents read by the background tokenizer

use std::path::Path;

use parking_lot::RwLock;

/// Text source of a [`TokenizationModel`](super::TokenizationModel)
///
/// Read from the worker thread while the owner edits it, so implementations
/// use interior mutability.
pub trait Document: Send + Sync {
    fn line_count(&self) -> usize;

    /// Text of a line without its terminator
    fn line_text(&self, index: usize) -> Option<String>;
}

/// A change to a run of lines: `lines_removed` lines starting at
/// `start_line` were replaced by `lines_added` lines
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DocumentEdit {
    pub start_line: usize,
    pub lines_removed: usize,
    pub lines_added: usize,
}

impl DocumentEdit {
    pub fn new(start_line: usize, lines_removed: usize, lines_added: usize) -> Self {
        Self {
            start_line,
            lines_removed,
            lines_added,
        }
    }

    /// A single line whose text changed
    pub fn line_changed(line: usize) -> Self {
        Self::new(line, 1, 1)
    }
}

/// In memory document, one `String` per line
#[derive(Debug, Default)]
pub struct TextDocument {
    lines: RwLock<Vec<String>>,
}

impl TextDocument {
    pub fn new(text: &str) -> Self {
        Self::from_lines(text.lines().map(String::from).collect())
    }

    pub fn from_lines(lines: Vec<String>) -> Self {
        Self {
            lines: RwLock::new(lines),
        }
    }

    pub fn from_file(path: &Path) -> std::io::Result<Self> {
        Ok(Self::new(&std::fs::read_to_string(path)?))
    }

    /// Replace `count` lines starting at `start` with `new_lines`. Out of
    /// range positions are clamped to the end of the document.
    pub fn replace_lines(&self, start: usize, count: usize, new_lines: &[&str]) -> DocumentEdit {
        let mut lines = self.lines.write();
        let start = start.min(lines.len());
        let end = start.saturating_add(count).min(lines.len());
        lines.splice(start..end, new_lines.iter().map(|line| line.to_string()));
        DocumentEdit::new(start, end - start, new_lines.len())
    }

    pub fn set_line(&self, index: usize, text: &str) -> DocumentEdit {
        self.replace_lines(index, 1, &[text])
    }

    pub fn text(&self) -> String {
        self.lines.read().join("\n")
    }
}

impl Document for TextDocument {
    fn line_count(&self) -> usize {
        self.lines.read().len()
    }

    fn line_text(&self, index: usize) -> Option<String> {
        self.lines.read().get(index).cloned()
    }
}
