//! tm-highlight - TextMate grammar tokenization and theming
//!
//! Grammars tokenize one line at a time into scoped tokens, themes resolve
//! scope paths into styles through scope selectors, and a background model
//! keeps a whole document's tokens current as it is edited.

pub mod config;
pub mod error;
pub mod grammar;
pub mod model;
pub mod registry;
pub mod selector;
pub mod theme;

pub use config::Config;
pub use error::{Error, GrammarLoadError, Result};
pub use grammar::attrs::{FontStyle, StandardTokenType, TokenAttributes};
pub use grammar::{Grammar, GrammarConfiguration, GrammarRepository, RawGrammar, StateStack, Token, TokenizeLineResult};
pub use model::{BackgroundState, DocumentEdit, LineTokens, ModelEvent, TextDocument, TokenizationModel};
pub use registry::Registry;
pub use selector::{Priority, ScopeSelector, SelectorList};
pub use theme::{Rgb, Style, Theme};
