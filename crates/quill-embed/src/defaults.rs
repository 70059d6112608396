//! Process-wide fallbacks
//!
//! Used by every VM whose [`Config`](crate::Config) leaves the matching
//! callback and default stream unset. Initially stdout, stderr and a loader
//! that reads `<name>` or `<name>.quill` from the working directory. Setting
//! any of them to `None` disables it.

use crate::config::{LoadModuleFn, SharedWriter};
use crate::vm::VmContext;
use parking_lot::{Mutex, RwLock};
use std::sync::{Arc, LazyLock};
use tracing::debug;

pub const MODULE_EXTENSION: &str = "quill";

struct Defaults {
    output: Option<SharedWriter>,
    error: Option<SharedWriter>,
    loader: Option<LoadModuleFn>,
}

static DEFAULTS: LazyLock<RwLock<Defaults>> = LazyLock::new(|| {
    RwLock::new(Defaults {
        output: Some(stdout_writer()),
        error: Some(stderr_writer()),
        loader: Some(file_loader()),
    })
});

pub fn set_default_output(writer: Option<SharedWriter>) {
    DEFAULTS.write().output = writer;
}

pub fn set_default_error(writer: Option<SharedWriter>) {
    DEFAULTS.write().error = writer;
}

pub fn set_default_loader(loader: Option<LoadModuleFn>) {
    DEFAULTS.write().loader = loader;
}

pub(crate) fn output() -> Option<SharedWriter> {
    DEFAULTS.read().output.clone()
}

pub(crate) fn error() -> Option<SharedWriter> {
    DEFAULTS.read().error.clone()
}

pub(crate) fn loader() -> Option<LoadModuleFn> {
    DEFAULTS.read().loader.clone()
}

pub fn stdout_writer() -> SharedWriter {
    Arc::new(Mutex::new(std::io::stdout()))
}

pub fn stderr_writer() -> SharedWriter {
    Arc::new(Mutex::new(std::io::stderr()))
}

/// The loader installed at startup.
pub fn file_loader() -> LoadModuleFn {
    Arc::new(|_: &VmContext, name: &str| load_from_file(name))
}

/// Read module `name` from `name`, then from `name.quill`.
pub fn load_from_file(name: &str) -> Option<String> {
    let source = std::fs::read_to_string(name)
        .or_else(|_| std::fs::read_to_string(format!("{name}.{MODULE_EXTENSION}")))
        .ok()?;
    debug!(module = name, "loaded module from file");
    Some(source)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn test_load_from_file_tries_extension() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("util.quill"), "var x = 1").unwrap();
        fs::write(dir.path().join("exact"), "var y = 2").unwrap();

        let util = dir.path().join("util");
        assert_eq!(load_from_file(util.to_str().unwrap()).as_deref(), Some("var x = 1"));

        let exact = dir.path().join("exact");
        assert_eq!(load_from_file(exact.to_str().unwrap()).as_deref(), Some("var y = 2"));

        let missing = dir.path().join("missing");
        assert!(load_from_file(missing.to_str().unwrap()).is_none());
    }
}
