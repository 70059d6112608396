//! Quill Embedding
//!
//! Safe host-side bindings for the Quill scripting VM.
//!
//! This crate provides:
//! - Value marshaling between host values and VM slots (`value`, `marshal`)
//! - Reference-counted handles to guest objects (`handle`)
//! - Foreign classes and methods implemented in Rust (`bindings`, `foreign`)
//! - Routing of VM callbacks to the right host VM (`registry`, `dispatch`)
//! - The `Vm` façade for interpreting code and calling guest methods (`vm`)
//!
//! # Usage
//!
//! ```rust,ignore
//! use quill_embed::{Config, ForeignClass, Module, ModuleMap, Value, Vm};
//!
//! let counter = ForeignClass::new()
//!     .with_default_payload::<f64>()
//!     .with_method("increment(_)", |ctx, args| {
//!         let this = args[0].as_foreign().unwrap();
//!         let by = args[1].as_num().unwrap_or(0.0);
//!         Ok(this.with(|total: &mut f64| { *total += by; *total })?.into())
//!     })?;
//! let modules =
//!     ModuleMap::new().with_module("main", Module::new().with_class("Counter", counter));
//!
//! let vm = Vm::with_modules(Config::with_std_streams(), &modules);
//! vm.interpret("main", r#"
//!     foreign class Counter {
//!         construct new() {}
//!         foreign increment(by)
//!     }
//!     var c = Counter.new()
//! "#)?;
//! let c = vm.get_variable("main", "c")?;
//! let total = c.as_handle().unwrap().func("increment(_)")?.call(&[Value::Num(5.0)])?;
//! assert_eq!(total, Value::Num(5.0));
//! ```

pub mod bindings;
pub mod config;
pub mod defaults;
pub mod dispatch;
pub mod error;
pub mod foreign;
pub mod handle;
mod marshal;
mod registry;
pub mod signature;
pub mod value;
pub mod vm;

pub use bindings::{
    ClassMap, Finalizer, ForeignClass, ForeignFn, Initializer, MethodMap, Module, ModuleMap,
};
pub use config::{Config, ErrorFn, LoadModuleFn, ResolveModuleFn, SharedWriter, WriteFn};
pub use defaults::{set_default_error, set_default_loader, set_default_output};
pub use error::{Error, ForeignError, Result, StackFrame};
pub use foreign::{ForeignPayload, ForeignTable};
pub use handle::{AsHandle, CallHandle, ForeignHandle, Handle, ListHandle, MapHandle};
pub use registry::live_vm_count;
pub use signature::{Signature, SignatureKind};
pub use value::Value;
pub use vm::{Vm, VmContext};

/// Version of the embedded VM
pub const VERSION_STRING: &str = quill_vm::c_api::QUILL_VERSION_STRING;
pub const VERSION_MAJOR: u32 = quill_vm::c_api::QUILL_VERSION_MAJOR as u32;
pub const VERSION_MINOR: u32 = quill_vm::c_api::QUILL_VERSION_MINOR as u32;
pub const VERSION_PATCH: u32 = quill_vm::c_api::QUILL_VERSION_PATCH as u32;

/// `(major, minor, patch)` of the embedded VM.
pub fn version_tuple() -> (u32, u32, u32) {
    (VERSION_MAJOR, VERSION_MINOR, VERSION_PATCH)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version_matches_string() {
        let (major, minor, patch) = version_tuple();
        assert_eq!(VERSION_STRING, format!("{major}.{minor}.{patch}"));
    }
}
