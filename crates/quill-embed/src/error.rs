//! Error types for the embedding bridge

use std::fmt;

/// Result type for bridge operations
pub type Result<T> = std::result::Result<T, Error>;

/// Failure returned by a host foreign method or initializer.
///
/// Its `Display` text becomes the value the guest fiber aborts with.
pub type ForeignError = Box<dyn std::error::Error + Send + Sync>;

/// One frame of a guest stack trace, innermost first.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StackFrame {
    pub module: String,
    pub line: u32,
    pub function: String,
}

impl fmt::Display for StackFrame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{} line {}] in {}", self.module, self.line, self.function)
    }
}

/// Bridge error kinds
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The guest compiler rejected a module
    #[error("[{module} line {line}] {message}")]
    Compile {
        /// Module being compiled
        module: String,
        /// Line of the offending token
        line: u32,
        /// Compiler message
        message: String,
    },

    /// A guest fiber aborted and nothing caught it
    #[error("{message}")]
    Runtime {
        /// The abort value rendered as text
        message: String,
        /// Frames collected after the error, innermost first
        stack_trace: Vec<StackFrame>,
    },

    /// One stack trace frame, delivered to error handlers after `Runtime`
    #[error("{0}")]
    StackTrace(StackFrame),

    /// Interpret or call attempted while the VM is already running
    #[error("VM is already running")]
    ReentrantCall,

    /// The handle was released before use
    #[error("handle has been released")]
    HandleReleased,

    /// A handle was passed to a VM that did not create it
    #[error("handle belongs to a different VM")]
    WrongVm,

    /// A host value outside the marshalable set
    #[error("unsupported value of type {type_name}")]
    UnsupportedValue {
        /// Rust type name of the rejected value
        type_name: String,
    },

    /// Map keys must be null, booleans, numbers or strings
    #[error("invalid map key: {key}")]
    InvalidMapKey { key: String },

    #[error("key not found: {key}")]
    KeyNotFound { key: String },

    #[error("index {index} out of bounds for list of {count}")]
    IndexOutOfBounds { index: usize, count: usize },

    /// No payload was registered for a foreign object's data block
    #[error("no foreign object registered at {address:#x}")]
    UnknownForeignObject { address: usize },

    #[error("module '{module}' is not loaded")]
    NoSuchModule { module: String },

    #[error("module '{module}' has no variable named '{name}'")]
    NoSuchVariable { module: String, name: String },

    #[error("VM has already been freed")]
    VmAlreadyFreed,

    /// A foreign payload is not of the requested Rust type
    #[error("foreign payload is not a {expected}")]
    ForeignTypeMismatch { expected: &'static str },

    #[error("invalid method signature '{signature}': {reason}")]
    InvalidSignature { signature: String, reason: String },

    /// A call handle was invoked with the wrong number of arguments
    #[error("'{signature}' expects {expected} argument(s), got {got}")]
    ArityMismatch {
        signature: String,
        expected: usize,
        got: usize,
    },

    /// Names crossing the C boundary cannot contain NUL bytes
    #[error("{what} contains an interior NUL byte")]
    InteriorNul { what: &'static str },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Whether the error came from guest code rather than from the bridge.
    pub fn is_guest_error(&self) -> bool {
        matches!(self, Error::Compile { .. } | Error::Runtime { .. } | Error::StackTrace(_))
    }

    pub(crate) fn unsupported<T: ?Sized>() -> Self {
        Error::UnsupportedValue {
            type_name: std::any::type_name::<T>().to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_formats() {
        let err = Error::Compile {
            module: "main".into(),
            line: 3,
            message: "Expect expression.".into(),
        };
        assert_eq!(err.to_string(), "[main line 3] Expect expression.");

        let frame = StackFrame {
            module: "main".into(),
            line: 7,
            function: "Counter.increment(_)".into(),
        };
        assert_eq!(Error::StackTrace(frame).to_string(), "[main line 7] in Counter.increment(_)");

        let err = Error::UnknownForeignObject { address: 0x10 };
        assert_eq!(err.to_string(), "no foreign object registered at 0x10");
    }

    #[test]
    fn test_unsupported_names_the_type() {
        let err = Error::unsupported::<Vec<u32>>();
        assert!(err.to_string().contains("Vec<u32>"));
        assert!(!err.is_guest_error());
    }
}
