//! C ABI for embedding the Quill VM.
//!
//! The API follows these principles:
//! - ABI-stable (uses only C-compatible types)
//! - Values cross the boundary through numbered slots
//! - Opaque pointers for the VM and for handles
//! - Host strings are copied on entry; returned strings are released by a
//!   host-supplied callback
//!
//! A VM is single-threaded: every call for a given `*mut QuillVM` must come
//! from one thread at a time.

use crate::interpreter::{to_cstring, Interpreter};
use crate::value::{Obj, Value};
use std::ffi::{c_void, CStr};
use std::os::raw::{c_char, c_int};
use std::ptr;

// ============================================================================
// Version
// ============================================================================

pub const QUILL_VERSION_MAJOR: c_int = 0;
pub const QUILL_VERSION_MINOR: c_int = 4;
pub const QUILL_VERSION_PATCH: c_int = 0;
pub const QUILL_VERSION_STRING: &str = "0.4.0";

/// `major * 1000000 + minor * 1000 + patch`
#[no_mangle]
pub extern "C" fn quill_get_version_number() -> c_int {
    QUILL_VERSION_MAJOR * 1_000_000 + QUILL_VERSION_MINOR * 1_000 + QUILL_VERSION_PATCH
}

// ============================================================================
// Opaque Types
// ============================================================================

/// Opaque handle to a Quill VM instance
#[repr(C)]
pub struct QuillVM {
    _private: [u8; 0],
}

/// Opaque handle keeping a guest value alive
#[repr(C)]
pub struct QuillHandle {
    _private: [u8; 0],
}

// ============================================================================
// Callbacks and configuration
// ============================================================================

/// A foreign method or allocator. Arguments and results travel through slots.
pub type QuillForeignMethodFn = unsafe extern "C" fn(vm: *mut QuillVM);

/// Called with a foreign object's data when the object is collected.
pub type QuillFinalizerFn = unsafe extern "C" fn(data: *mut c_void);

pub type QuillWriteFn = unsafe extern "C" fn(vm: *mut QuillVM, text: *const c_char);

/// `module` is null and `line` is -1 for the runtime error message itself.
pub type QuillErrorFn = unsafe extern "C" fn(
    vm: *mut QuillVM,
    error_type: QuillErrorType,
    module: *const c_char,
    line: c_int,
    message: *const c_char,
);

/// A string handed from the host to the VM. The VM copies `text` and then
/// calls `release` on it, if set.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct QuillHostString {
    pub text: *mut c_char,
    pub release: Option<unsafe extern "C" fn(text: *mut c_char)>,
}

impl QuillHostString {
    pub const fn none() -> Self {
        Self {
            text: ptr::null_mut(),
            release: None,
        }
    }
}

pub type QuillResolveModuleFn = unsafe extern "C" fn(
    vm: *mut QuillVM,
    importer: *const c_char,
    name: *const c_char,
) -> QuillHostString;

pub type QuillLoadModuleFn =
    unsafe extern "C" fn(vm: *mut QuillVM, name: *const c_char) -> QuillHostString;

pub type QuillBindForeignMethodFn = unsafe extern "C" fn(
    vm: *mut QuillVM,
    module: *const c_char,
    class_name: *const c_char,
    is_static: bool,
    signature: *const c_char,
) -> Option<QuillForeignMethodFn>;

#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct QuillForeignClassMethods {
    pub allocate: Option<QuillForeignMethodFn>,
    pub finalize: Option<QuillFinalizerFn>,
}

pub type QuillBindForeignClassFn = unsafe extern "C" fn(
    vm: *mut QuillVM,
    module: *const c_char,
    class_name: *const c_char,
) -> QuillForeignClassMethods;

#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct QuillConfiguration {
    pub write_fn: Option<QuillWriteFn>,
    pub error_fn: Option<QuillErrorFn>,
    pub resolve_module_fn: Option<QuillResolveModuleFn>,
    pub load_module_fn: Option<QuillLoadModuleFn>,
    pub bind_foreign_method_fn: Option<QuillBindForeignMethodFn>,
    pub bind_foreign_class_fn: Option<QuillBindForeignClassFn>,
    pub initial_heap_size: usize,
    pub min_heap_size: usize,
    pub heap_growth_percent: c_int,
    pub user_data: *mut c_void,
}

impl Default for QuillConfiguration {
    fn default() -> Self {
        Self {
            write_fn: None,
            error_fn: None,
            resolve_module_fn: None,
            load_module_fn: None,
            bind_foreign_method_fn: None,
            bind_foreign_class_fn: None,
            initial_heap_size: 10 * 1024 * 1024,
            min_heap_size: 1024 * 1024,
            heap_growth_percent: 50,
            user_data: ptr::null_mut(),
        }
    }
}

#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QuillErrorType {
    Compile,
    Runtime,
    StackTrace,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QuillInterpretResult {
    Success,
    CompileError,
    RuntimeError,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QuillType {
    Bool,
    Num,
    Foreign,
    List,
    Map,
    Null,
    String,
    Unknown,
}

// ============================================================================
// Helper Functions
// ============================================================================

unsafe fn vm_ref<'a>(vm: *mut QuillVM) -> Option<&'a Interpreter> {
    if vm.is_null() {
        None
    } else {
        Some(Interpreter::from_raw(vm))
    }
}

unsafe fn c_str<'a>(text: *const c_char) -> Option<std::borrow::Cow<'a, str>> {
    if text.is_null() {
        None
    } else {
        Some(CStr::from_ptr(text).to_string_lossy())
    }
}

fn slot(index: c_int) -> usize {
    index.max(0) as usize
}

// ============================================================================
// VM Lifecycle Functions
// ============================================================================

/// Fill `config` with the default settings.
///
/// # Safety
/// `config` must point to writable memory for a `QuillConfiguration`.
#[no_mangle]
pub unsafe extern "C" fn quill_init_configuration(config: *mut QuillConfiguration) {
    if let Some(config) = config.as_mut() {
        *config = QuillConfiguration::default();
    }
}

/// Create a new VM. A null `config` uses the defaults.
///
/// # Safety
/// The returned VM must be freed with `quill_free_vm()`.
#[no_mangle]
pub unsafe extern "C" fn quill_new_vm(config: *const QuillConfiguration) -> *mut QuillVM {
    let config = config.as_ref().copied().unwrap_or_default();
    Box::into_raw(Interpreter::new(config)) as *mut QuillVM
}

/// Destroy a VM, releasing outstanding handles and running the finalizers of
/// every remaining foreign object.
///
/// # Safety
/// - VM pointer must be valid (created by `quill_new_vm()`)
/// - VM and its handles must not be used after this call
#[no_mangle]
pub unsafe extern "C" fn quill_free_vm(vm: *mut QuillVM) {
    if vm.is_null() {
        return;
    }
    drop(Box::from_raw(vm as *mut Interpreter));
}

/// Collect garbage now, or at the end of the current run if code is executing.
///
/// # Safety
/// VM pointer must be valid.
#[no_mangle]
pub unsafe extern "C" fn quill_collect_garbage(vm: *mut QuillVM) {
    if let Some(vm) = vm_ref(vm) {
        vm.collect_garbage();
    }
}

/// # Safety
/// VM pointer must be valid.
#[no_mangle]
pub unsafe extern "C" fn quill_get_user_data(vm: *mut QuillVM) -> *mut c_void {
    vm_ref(vm).map_or(ptr::null_mut(), Interpreter::user_data)
}

/// # Safety
/// VM pointer must be valid.
#[no_mangle]
pub unsafe extern "C" fn quill_set_user_data(vm: *mut QuillVM, user_data: *mut c_void) {
    if let Some(vm) = vm_ref(vm) {
        vm.set_user_data(user_data);
    }
}

// ============================================================================
// Execution
// ============================================================================

/// Run `source` in `module`.
///
/// # Arguments
/// * `vm` - Pointer to QuillVM
/// * `module` - Null-terminated module name
/// * `source` - Null-terminated source text
///
/// # Returns
/// * `Success`, `CompileError` or `RuntimeError`; details go to the error callback
///
/// # Safety
/// All pointers must be valid.
#[no_mangle]
pub unsafe extern "C" fn quill_interpret(
    vm: *mut QuillVM,
    module: *const c_char,
    source: *const c_char,
) -> QuillInterpretResult {
    let (Some(vm), Some(module), Some(source)) = (vm_ref(vm), c_str(module), c_str(source)) else {
        return QuillInterpretResult::CompileError;
    };
    vm.interpret(&module, &source)
}

/// Create a handle that invokes `signature` on the receiver in slot 0.
///
/// # Safety
/// Pointers must be valid. The handle must be released with `quill_release_handle()`.
#[no_mangle]
pub unsafe extern "C" fn quill_make_call_handle(
    vm: *mut QuillVM,
    signature: *const c_char,
) -> *mut QuillHandle {
    let (Some(vm), Some(signature)) = (vm_ref(vm), c_str(signature)) else {
        return ptr::null_mut();
    };
    vm.make_handle(Value::Null, Some(signature.into_owned()))
}

/// Call a method: the receiver in slot 0, arguments in slots 1..=arity.
/// On success the return value is left in slot 0.
///
/// # Safety
/// Pointers must be valid.
#[no_mangle]
pub unsafe extern "C" fn quill_call(
    vm: *mut QuillVM,
    method: *mut QuillHandle,
) -> QuillInterpretResult {
    match vm_ref(vm) {
        Some(vm) => vm.call(method),
        None => QuillInterpretResult::RuntimeError,
    }
}

/// Release a handle. Releasing an unknown handle is a no-op.
///
/// # Safety
/// VM pointer must be valid.
#[no_mangle]
pub unsafe extern "C" fn quill_release_handle(vm: *mut QuillVM, handle: *mut QuillHandle) {
    if let Some(vm) = vm_ref(vm) {
        vm.release_handle(handle);
    }
}

/// Raise the value in `slot` as an error once the current foreign method returns.
///
/// # Safety
/// VM pointer must be valid.
#[no_mangle]
pub unsafe extern "C" fn quill_abort_fiber(vm: *mut QuillVM, slot_index: c_int) {
    if let Some(vm) = vm_ref(vm) {
        vm.abort_fiber(slot(slot_index));
    }
}

// ============================================================================
// Slots
// ============================================================================

/// # Safety
/// VM pointer must be valid.
#[no_mangle]
pub unsafe extern "C" fn quill_get_slot_count(vm: *mut QuillVM) -> c_int {
    vm_ref(vm).map_or(0, |vm| vm.slot_count() as c_int)
}

/// # Safety
/// VM pointer must be valid.
#[no_mangle]
pub unsafe extern "C" fn quill_ensure_slots(vm: *mut QuillVM, num_slots: c_int) {
    if let Some(vm) = vm_ref(vm) {
        vm.ensure_slots(slot(num_slots));
    }
}

/// # Safety
/// VM pointer must be valid.
#[no_mangle]
pub unsafe extern "C" fn quill_get_slot_type(vm: *mut QuillVM, slot_index: c_int) -> QuillType {
    vm_ref(vm).map_or(QuillType::Unknown, |vm| vm.slot_type(slot(slot_index)))
}

/// # Safety
/// VM pointer must be valid.
#[no_mangle]
pub unsafe extern "C" fn quill_get_slot_bool(vm: *mut QuillVM, slot_index: c_int) -> bool {
    vm_ref(vm).is_some_and(|vm| matches!(vm.slot(slot(slot_index)), Value::Bool(true)))
}

/// # Safety
/// VM pointer must be valid.
#[no_mangle]
pub unsafe extern "C" fn quill_get_slot_double(vm: *mut QuillVM, slot_index: c_int) -> f64 {
    match vm_ref(vm).map(|vm| vm.slot(slot(slot_index))) {
        Some(Value::Num(n)) => n,
        _ => 0.0,
    }
}

/// Bytes of the string in a slot. The pointer stays valid until the next
/// garbage collection.
///
/// # Safety
/// VM pointer must be valid; `length` may be null.
#[no_mangle]
pub unsafe extern "C" fn quill_get_slot_bytes(
    vm: *mut QuillVM,
    slot_index: c_int,
    length: *mut c_int,
) -> *const c_char {
    let bytes = vm_ref(vm).and_then(|vm| vm.slot_bytes_raw(slot(slot_index)));
    let (data, len) = bytes.unwrap_or((ptr::null(), 0));
    if let Some(length) = length.as_mut() {
        *length = len as c_int;
    }
    data.cast()
}

/// # Safety
/// VM pointer must be valid.
#[no_mangle]
pub unsafe extern "C" fn quill_get_slot_handle(
    vm: *mut QuillVM,
    slot_index: c_int,
) -> *mut QuillHandle {
    match vm_ref(vm) {
        Some(vm) => vm.make_handle(vm.slot(slot(slot_index)), None),
        None => ptr::null_mut(),
    }
}

/// Pointer to the data block of the foreign object in a slot, or null.
///
/// # Safety
/// VM pointer must be valid.
#[no_mangle]
pub unsafe extern "C" fn quill_get_slot_foreign(
    vm: *mut QuillVM,
    slot_index: c_int,
) -> *mut c_void {
    vm_ref(vm).map_or(ptr::null_mut(), |vm| vm.slot_foreign(slot(slot_index)))
}

/// # Safety
/// VM pointer must be valid.
#[no_mangle]
pub unsafe extern "C" fn quill_set_slot_bool(vm: *mut QuillVM, slot_index: c_int, value: bool) {
    if let Some(vm) = vm_ref(vm) {
        vm.set_slot(slot(slot_index), Value::Bool(value));
    }
}

/// # Safety
/// VM pointer must be valid.
#[no_mangle]
pub unsafe extern "C" fn quill_set_slot_double(vm: *mut QuillVM, slot_index: c_int, value: f64) {
    if let Some(vm) = vm_ref(vm) {
        vm.set_slot(slot(slot_index), Value::Num(value));
    }
}

/// Copy `length` bytes into a new string. The bytes may contain NUL.
///
/// # Safety
/// `bytes` must point to `length` readable bytes.
#[no_mangle]
pub unsafe extern "C" fn quill_set_slot_bytes(
    vm: *mut QuillVM,
    slot_index: c_int,
    bytes: *const c_char,
    length: usize,
) {
    let Some(vm) = vm_ref(vm) else {
        return;
    };
    let copied = if bytes.is_null() {
        Vec::new()
    } else {
        std::slice::from_raw_parts(bytes.cast::<u8>(), length).to_vec()
    };
    let value = vm.new_string(copied);
    vm.set_slot(slot(slot_index), value);
}

/// # Safety
/// `text` must be a valid null-terminated string.
#[no_mangle]
pub unsafe extern "C" fn quill_set_slot_string(
    vm: *mut QuillVM,
    slot_index: c_int,
    text: *const c_char,
) {
    let Some(vm) = vm_ref(vm) else {
        return;
    };
    let bytes = if text.is_null() {
        Vec::new()
    } else {
        CStr::from_ptr(text).to_bytes().to_vec()
    };
    let value = vm.new_string(bytes);
    vm.set_slot(slot(slot_index), value);
}

/// # Safety
/// VM pointer must be valid.
#[no_mangle]
pub unsafe extern "C" fn quill_set_slot_null(vm: *mut QuillVM, slot_index: c_int) {
    if let Some(vm) = vm_ref(vm) {
        vm.set_slot(slot(slot_index), Value::Null);
    }
}

/// Store a handle's value in a slot. Unknown handles store null.
///
/// # Safety
/// VM pointer must be valid.
#[no_mangle]
pub unsafe extern "C" fn quill_set_slot_handle(
    vm: *mut QuillVM,
    slot_index: c_int,
    handle: *mut QuillHandle,
) {
    if let Some(vm) = vm_ref(vm) {
        let value = vm.handle_value(handle).unwrap_or(Value::Null);
        vm.set_slot(slot(slot_index), value);
    }
}

/// Create a foreign object of the class in `class_slot` with `size` bytes of
/// zeroed storage and return its data pointer, or null if the slot does not
/// hold a foreign class.
///
/// # Safety
/// VM pointer must be valid.
#[no_mangle]
pub unsafe extern "C" fn quill_set_slot_new_foreign(
    vm: *mut QuillVM,
    slot_index: c_int,
    class_slot: c_int,
    size: usize,
) -> *mut c_void {
    vm_ref(vm).map_or(ptr::null_mut(), |vm| {
        vm.new_foreign(slot(slot_index), slot(class_slot), size)
    })
}

/// # Safety
/// VM pointer must be valid.
#[no_mangle]
pub unsafe extern "C" fn quill_set_slot_new_list(vm: *mut QuillVM, slot_index: c_int) {
    if let Some(vm) = vm_ref(vm) {
        let list = vm.alloc(Obj::List(Vec::new()));
        vm.set_slot(slot(slot_index), list);
    }
}

/// # Safety
/// VM pointer must be valid.
#[no_mangle]
pub unsafe extern "C" fn quill_set_slot_new_map(vm: *mut QuillVM, slot_index: c_int) {
    if let Some(vm) = vm_ref(vm) {
        let map = vm.alloc(Obj::Map(Default::default()));
        vm.set_slot(slot(slot_index), map);
    }
}

// ============================================================================
// Lists
// ============================================================================

/// # Safety
/// VM pointer must be valid.
#[no_mangle]
pub unsafe extern "C" fn quill_get_list_count(vm: *mut QuillVM, slot_index: c_int) -> c_int {
    vm_ref(vm).map_or(0, |vm| vm.list_count(slot(slot_index)) as c_int)
}

/// Copy element `index` (negative counts from the end) into `element_slot`.
/// Returns false if the index is out of bounds.
///
/// # Safety
/// VM pointer must be valid.
#[no_mangle]
pub unsafe extern "C" fn quill_get_list_element(
    vm: *mut QuillVM,
    list_slot: c_int,
    index: c_int,
    element_slot: c_int,
) -> bool {
    vm_ref(vm).is_some_and(|vm| vm.list_get(slot(list_slot), index as isize, slot(element_slot)))
}

/// # Safety
/// VM pointer must be valid.
#[no_mangle]
pub unsafe extern "C" fn quill_set_list_element(
    vm: *mut QuillVM,
    list_slot: c_int,
    index: c_int,
    element_slot: c_int,
) -> bool {
    vm_ref(vm).is_some_and(|vm| vm.list_set(slot(list_slot), index as isize, slot(element_slot)))
}

/// Insert before `index`; -1 appends.
///
/// # Safety
/// VM pointer must be valid.
#[no_mangle]
pub unsafe extern "C" fn quill_insert_in_list(
    vm: *mut QuillVM,
    list_slot: c_int,
    index: c_int,
    element_slot: c_int,
) -> bool {
    vm_ref(vm).is_some_and(|vm| vm.list_insert(slot(list_slot), index as isize, slot(element_slot)))
}

// ============================================================================
// Maps
// ============================================================================

/// # Safety
/// VM pointer must be valid.
#[no_mangle]
pub unsafe extern "C" fn quill_get_map_count(vm: *mut QuillVM, slot_index: c_int) -> c_int {
    vm_ref(vm).map_or(0, |vm| vm.map_count(slot(slot_index)) as c_int)
}

/// # Safety
/// VM pointer must be valid.
#[no_mangle]
pub unsafe extern "C" fn quill_get_map_contains_key(
    vm: *mut QuillVM,
    map_slot: c_int,
    key_slot: c_int,
) -> bool {
    vm_ref(vm).is_some_and(|vm| vm.map_contains(slot(map_slot), slot(key_slot)))
}

/// Copy the value for a key into `value_slot` (null when missing).
/// Returns whether the key was present.
///
/// # Safety
/// VM pointer must be valid.
#[no_mangle]
pub unsafe extern "C" fn quill_get_map_value(
    vm: *mut QuillVM,
    map_slot: c_int,
    key_slot: c_int,
    value_slot: c_int,
) -> bool {
    vm_ref(vm).is_some_and(|vm| vm.map_get(slot(map_slot), slot(key_slot), slot(value_slot)))
}

/// Returns false, leaving the map untouched, if the key is not a value type.
///
/// # Safety
/// VM pointer must be valid.
#[no_mangle]
pub unsafe extern "C" fn quill_set_map_value(
    vm: *mut QuillVM,
    map_slot: c_int,
    key_slot: c_int,
    value_slot: c_int,
) -> bool {
    vm_ref(vm).is_some_and(|vm| vm.map_set(slot(map_slot), slot(key_slot), slot(value_slot)))
}

/// Remove a key, storing the removed value in `removed_slot` unless it is negative.
///
/// # Safety
/// VM pointer must be valid.
#[no_mangle]
pub unsafe extern "C" fn quill_remove_map_value(
    vm: *mut QuillVM,
    map_slot: c_int,
    key_slot: c_int,
    removed_slot: c_int,
) -> bool {
    let removed = (removed_slot >= 0).then(|| slot(removed_slot));
    vm_ref(vm).is_some_and(|vm| vm.map_remove(slot(map_slot), slot(key_slot), removed))
}

// ============================================================================
// Modules
// ============================================================================

/// Load a module variable into `slot`. Returns false if the module or
/// variable does not exist.
///
/// # Safety
/// All pointers must be valid.
#[no_mangle]
pub unsafe extern "C" fn quill_get_variable(
    vm: *mut QuillVM,
    module: *const c_char,
    name: *const c_char,
    slot_index: c_int,
) -> bool {
    let (Some(vm), Some(module), Some(name)) = (vm_ref(vm), c_str(module), c_str(name)) else {
        return false;
    };
    vm.load_variable(&module, &name, slot(slot_index))
}

/// # Safety
/// All pointers must be valid.
#[no_mangle]
pub unsafe extern "C" fn quill_has_variable(
    vm: *mut QuillVM,
    module: *const c_char,
    name: *const c_char,
) -> bool {
    let (Some(vm), Some(module), Some(name)) = (vm_ref(vm), c_str(module), c_str(name)) else {
        return false;
    };
    vm.module_variable(&module, &name).is_some()
}

/// # Safety
/// All pointers must be valid.
#[no_mangle]
pub unsafe extern "C" fn quill_has_module(vm: *mut QuillVM, module: *const c_char) -> bool {
    let (Some(vm), Some(module)) = (vm_ref(vm), c_str(module)) else {
        return false;
    };
    vm.has_module(&module)
}

/// Copy of `text` for returning through [`QuillHostString`], released with
/// [`quill_release_host_string`].
pub fn host_string(text: &str) -> QuillHostString {
    QuillHostString {
        text: to_cstring(text.as_bytes()).into_raw(),
        release: Some(quill_release_host_string),
    }
}

/// Frees a string made by [`host_string`].
///
/// # Safety
/// `text` must come from [`host_string`] and not be freed twice.
#[no_mangle]
pub unsafe extern "C" fn quill_release_host_string(text: *mut c_char) {
    if !text.is_null() {
        drop(std::ffi::CString::from_raw(text));
    }
}
