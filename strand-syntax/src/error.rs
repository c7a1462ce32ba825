//! Parse error types.

use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ParseError {
    #[error("invalid token `{text}` at offset {offset}")]
    InvalidToken { text: String, offset: usize },

    #[error("unexpected token `{found}` at offset {offset}, expected {expected}")]
    UnexpectedToken {
        found: String,
        expected: String,
        offset: usize,
    },

    #[error("unexpected end of input, expected {expected}")]
    UnexpectedEof { expected: String },
}
