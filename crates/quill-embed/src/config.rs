//! VM configuration
//!
//! Host callbacks for output, errors and module loading, plus heap sizing.
//! Unset callbacks fall through to the configured default streams and then
//! to the process-wide defaults in [`crate::defaults`].

use crate::error::Error;
use crate::vm::VmContext;
use parking_lot::Mutex;
use quill_vm::c_api::QuillConfiguration;
use std::any::Any;
use std::fmt;
use std::io::Write;
use std::sync::Arc;

pub type WriteFn = Arc<dyn Fn(&VmContext, &str) + Send + Sync>;

/// Receives [`Error::Compile`], [`Error::Runtime`] and [`Error::StackTrace`].
pub type ErrorFn = Arc<dyn Fn(&VmContext, &Error) + Send + Sync>;

/// Returns the source of a module, or `None` if it does not exist.
pub type LoadModuleFn = Arc<dyn Fn(&VmContext, &str) -> Option<String> + Send + Sync>;

/// Maps `(importer, name)` to a canonical module name; `None` keeps `name`.
pub type ResolveModuleFn = Arc<dyn Fn(&VmContext, &str, &str) -> Option<String> + Send + Sync>;

pub type SharedWriter = Arc<Mutex<dyn Write + Send>>;

/// Per-VM configuration.
#[derive(Clone)]
pub struct Config {
    pub write_fn: Option<WriteFn>,
    pub error_fn: Option<ErrorFn>,
    pub load_module_fn: Option<LoadModuleFn>,
    pub resolve_module_fn: Option<ResolveModuleFn>,
    pub default_output: Option<SharedWriter>,
    pub default_error: Option<SharedWriter>,
    pub user_data: Option<Arc<dyn Any + Send + Sync>>,
    pub initial_heap_size: usize,
    pub min_heap_size: usize,
    pub heap_growth_percent: i32,
}

impl Config {
    pub fn new() -> Self {
        let native = QuillConfiguration::default();
        Self {
            write_fn: None,
            error_fn: None,
            load_module_fn: None,
            resolve_module_fn: None,
            default_output: None,
            default_error: None,
            user_data: None,
            initial_heap_size: native.initial_heap_size,
            min_heap_size: native.min_heap_size,
            heap_growth_percent: native.heap_growth_percent,
        }
    }

    /// A config whose default streams are this process's stdout and stderr.
    pub fn with_std_streams() -> Self {
        Self::new()
            .with_default_output(crate::defaults::stdout_writer())
            .with_default_error(crate::defaults::stderr_writer())
    }

    pub fn with_write_fn(mut self, f: impl Fn(&VmContext, &str) + Send + Sync + 'static) -> Self {
        self.write_fn = Some(Arc::new(f));
        self
    }

    pub fn with_error_fn(mut self, f: impl Fn(&VmContext, &Error) + Send + Sync + 'static) -> Self {
        self.error_fn = Some(Arc::new(f));
        self
    }

    pub fn with_load_module_fn(
        mut self,
        f: impl Fn(&VmContext, &str) -> Option<String> + Send + Sync + 'static,
    ) -> Self {
        self.load_module_fn = Some(Arc::new(f));
        self
    }

    pub fn with_resolve_module_fn(
        mut self,
        f: impl Fn(&VmContext, &str, &str) -> Option<String> + Send + Sync + 'static,
    ) -> Self {
        self.resolve_module_fn = Some(Arc::new(f));
        self
    }

    pub fn with_default_output(mut self, writer: SharedWriter) -> Self {
        self.default_output = Some(writer);
        self
    }

    pub fn with_default_error(mut self, writer: SharedWriter) -> Self {
        self.default_error = Some(writer);
        self
    }

    pub fn with_user_data(mut self, data: impl Any + Send + Sync) -> Self {
        self.user_data = Some(Arc::new(data));
        self
    }

    pub fn with_heap(mut self, initial: usize, min: usize, growth_percent: i32) -> Self {
        self.initial_heap_size = initial;
        self.min_heap_size = min;
        self.heap_growth_percent = growth_percent;
        self
    }

    /// Heap settings for the native VM. Callbacks are filled in by the VM.
    pub(crate) fn native(&self) -> QuillConfiguration {
        QuillConfiguration {
            initial_heap_size: self.initial_heap_size,
            min_heap_size: self.min_heap_size,
            heap_growth_percent: self.heap_growth_percent,
            ..QuillConfiguration::default()
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Config")
            .field("write_fn", &self.write_fn.is_some())
            .field("error_fn", &self.error_fn.is_some())
            .field("load_module_fn", &self.load_module_fn.is_some())
            .field("resolve_module_fn", &self.resolve_module_fn.is_some())
            .field("default_output", &self.default_output.is_some())
            .field("default_error", &self.default_error.is_some())
            .field("user_data", &self.user_data.is_some())
            .field("initial_heap_size", &self.initial_heap_size)
            .field("min_heap_size", &self.min_heap_size)
            .field("heap_growth_percent", &self.heap_growth_percent)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_config_is_empty() {
        let config = Config::new();
        assert!(config.write_fn.is_none());
        assert!(config.default_output.is_none());
        assert_eq!(config.heap_growth_percent, 50);
        assert_eq!(config.native().min_heap_size, 1024 * 1024);
    }

    #[test]
    fn test_builders() {
        let config = Config::with_std_streams()
            .with_user_data(5u32)
            .with_heap(4096, 1024, 25)
            .with_write_fn(|_, _| {});
        assert!(config.default_output.is_some());
        assert!(config.default_error.is_some());
        assert!(config.write_fn.is_some());
        assert_eq!(config.native().initial_heap_size, 4096);
        let data = config.user_data.clone().unwrap();
        assert_eq!(data.downcast_ref::<u32>(), Some(&5));
    }
}
