//! Compile-time diagnostics produced by the lexer, parser and binder.

use thiserror::Error;

/// A compile error located on a single source line.
#[derive(Debug, Clone, PartialEq, Error)]
#[error("[line {line}] {message}")]
pub struct CompileError {
    pub line: u32,
    pub message: String,
}

impl CompileError {
    pub fn new(line: u32, message: impl Into<String>) -> Self {
        Self {
            line,
            message: message.into(),
        }
    }
}

pub type CompileResult<T> = Result<T, CompileError>;
