//! Runtime error taxonomy.
//!
//! Two channels only: `Raise` carries a language-level error value and is
//! catchable by `try`; `Fault` is a contract violation that aborts the
//! current fiber (the host process survives — the executor turns it into
//! the task's terminal value).

use thiserror::Error;

use crate::value::Value;

#[derive(Error, Debug, Clone)]
pub enum VmError {
    /// A raised error value, propagating until a `try` frame catches it.
    #[error("{0}")]
    Raise(Value),

    /// A contract violation; fatal to the current fiber.
    #[error("fault: {0}")]
    Fault(String),
}

impl VmError {
    pub fn fault(msg: impl Into<String>) -> Self {
        VmError::Fault(msg.into())
    }

    /// Raise a fresh error value with the given message.
    pub fn raise(msg: impl Into<String>) -> Self {
        VmError::Raise(Value::error(msg, Value::Nil))
    }
}

pub type VmResult<T> = Result<T, VmError>;
