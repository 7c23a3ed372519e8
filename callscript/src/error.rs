use thiserror::Error;

/// Errors produced while parsing restricted code.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum ParseError {
    #[error("syntax error: {0}")]
    Syntax(String),
    #[error("invalid literal: {0}")]
    InvalidLiteral(String),
}

impl ParseError {
    pub(crate) fn unexpected(what: impl Into<String>) -> Self {
        ParseError::Syntax(format!("unexpected grammar node: {}", what.into()))
    }
}

/// Errors produced while walking a program. `E` is the host's own error
/// type; call failures pass through untouched so the embedder keeps its
/// full taxonomy.
#[derive(Debug, Error)]
pub enum EvalError<E> {
    #[error("unknown variable '{0}'")]
    UnknownVariable(String),
    #[error("no function calls in program")]
    NoCalls,
    #[error("{0}")]
    Host(E),
}
