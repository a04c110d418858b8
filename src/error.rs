//! Error types for tm-highlight

use std::path::PathBuf;

use thiserror::Error;

/// Result type alias for tm-highlight operations
pub type Result<T> = std::result::Result<T, Error>;

/// Raised when a raw grammar cannot be turned into a usable grammar.
#[derive(Error, Debug)]
pub enum GrammarLoadError {
    #[error("grammar has no scope name")]
    MissingScopeName,

    #[error("malformed rule at {path}: {reason}")]
    MalformedRule { path: String, reason: String },

    #[error("cannot parse grammar: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("cannot read grammar {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Scope selector syntax errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SelectorError {
    #[error("empty selector")]
    Empty,

    #[error("unexpected {token:?} in selector {selector:?}")]
    Unexpected { selector: String, token: String },

    #[error("unbalanced parenthesis in selector {0:?}")]
    Unbalanced(String),
}

/// Theme loading errors
#[derive(Error, Debug)]
pub enum ThemeError {
    #[error("cannot parse theme: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("stylesheet syntax error at byte {offset}: {message}")]
    Css { offset: usize, message: String },

    #[error("invalid color: {0}")]
    Color(String),

    #[error("cannot read theme {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Configuration file errors
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("cannot read config {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid config: {0}")]
    Toml(#[from] toml::de::Error),
}

/// Top level error
#[derive(Error, Debug)]
pub enum Error {
    #[error(transparent)]
    Grammar(#[from] GrammarLoadError),

    #[error(transparent)]
    Theme(#[from] ThemeError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("no grammar registered for scope {0}")]
    UnknownScope(String),

    #[error("{0}")]
    Message(String),
}
