//! Reported runtime errors.
//!
//! These are the recoverable failures of the engine: they abort the current
//! top-level call and are handed back to the embedder. Contract violations
//! (a corrupted code stream, a trusted field with the wrong tag) panic instead.

/// Result type used throughout the VM.
pub type Result<T> = std::result::Result<T, VmError>;

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum VmError {
    #[error("missing field \"{0}\"")]
    MissingField(String),

    #[error("stack underflow: {0}")]
    StackUnderflow(&'static str),

    #[error("stack overflow: value stack capacity of {capacity} slots exceeded")]
    StackOverflow { capacity: usize },

    #[error("{op}, index {index} out of bounds (length {len})")]
    IndexOutOfBounds {
        op: &'static str,
        index: i64,
        len: usize,
    },

    #[error("{op}, byte {byte:#04x} at index {index} is not a single-byte character")]
    NonAsciiChar {
        op: &'static str,
        index: i64,
        byte: u8,
    },

    #[error("invalid identifier in set_field \"{0}\"")]
    InvalidIdentifier(String),

    #[error("unhandled opcode in basic block \"{0}\"")]
    UnhandledOpcode(String),

    #[error("malformed block: {0}")]
    MalformedBlock(String),

    #[error("{op} expects {expected} value, got {found}")]
    TypeMismatch {
        op: &'static str,
        expected: &'static str,
        found: &'static str,
    },

    #[error("{pos}incorrect argument count in call, received {received}, expected {expected}")]
    ArityMismatch {
        pos: String,
        received: usize,
        expected: usize,
    },

    #[error("invalid callee at call site")]
    InvalidCallee,

    #[error("invalid function: {0}")]
    InvalidFunction(String),

    #[error("local index {index} out of range ({num_locals} locals)")]
    InvalidLocal { index: usize, num_locals: usize },

    #[error("failed to import package \"{name}\": {reason}")]
    ImportFailed { name: String, reason: String },

    #[error("{pos}aborting execution due to error{}", abort_suffix(.message))]
    Aborted { pos: String, message: String },

    #[error("host function {name}: {message}")]
    Host { name: String, message: String },

    #[error("image error: {0}")]
    Image(String),
}

fn abort_suffix(message: &str) -> String {
    if message.is_empty() {
        String::new()
    } else {
        format!(": {}", message)
    }
}

impl VmError {
    pub fn type_mismatch(op: &'static str, expected: &'static str, found: &'static str) -> Self {
        VmError::TypeMismatch {
            op,
            expected,
            found,
        }
    }
}
