//! Error types for the guidance engine

use thiserror::Error;

/// Result type alias using the engine's [`Error`]
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for template processing and its collaborators
#[derive(Error, Debug)]
pub enum Error {
    #[error("Tokenizer error: {0}")]
    Tokenizer(String),

    #[error("Template error: {0}")]
    Template(String),

    #[error("Invalid directive: {0}")]
    InvalidDirective(String),

    #[error("{0} variable not found")]
    MissingVariable(String),

    #[error("Variable {0} is not a list of options")]
    NotAList(String),

    #[error("SEL {0} has no options to select from")]
    NoOptions(String),

    #[error("No backend candidate matches a valid continuation for {0}")]
    NoMatchingCandidate(String),

    #[error("Backend returned {status}: {body}")]
    Backend { status: u16, body: String },

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("JSON parsing error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Config error: {0}")]
    Config(String),

    #[error("Template processing cancelled")]
    Cancelled,
}
