//! Quill guest VM
//!
//! A small class-based scripting language with a C embedding API:
//! - **Front end**: logos lexer and recursive-descent parser (`lexer`, `parser`, `ast`)
//! - **Runtime**: tree-walking interpreter with built-in classes (`interpreter`, `builtins`)
//! - **Memory**: object arena with a mark-sweep collector (`heap`)
//! - **Embedding**: slot-based C ABI (`c_api`)
//!
//! # Example
//!
//! ```rust,ignore
//! use quill_vm::c_api::*;
//!
//! unsafe {
//!     let vm = quill_new_vm(std::ptr::null());
//!     let result = quill_interpret(vm, c"main".as_ptr(), c"var x = 1 + 2".as_ptr());
//!     assert_eq!(result, QuillInterpretResult::Success);
//!     quill_free_vm(vm);
//! }
//! ```

pub mod ast;
pub mod builtins;
pub mod c_api;
pub mod error;
pub mod heap;
pub mod interpreter;
pub mod lexer;
pub mod parser;
pub mod random;
pub mod value;

pub use error::{CompileError, CompileResult};
pub use interpreter::{Interpreter, Throw, TraceFrame};
pub use value::Value;
