//! End-to-end tests for the Quill interpreter, driven through the C ABI.
//!
//! # Running Tests
//! ```bash
//! cargo test -p quill-vm --test interpreter_tests
//! ```

use quill_vm::c_api::*;
use std::cell::{Cell, RefCell};
use std::ffi::{c_void, CStr, CString};
use std::os::raw::{c_char, c_int};
use std::ptr;

thread_local! {
    static OUTPUT: RefCell<String> = RefCell::new(String::new());
    static ERRORS: RefCell<Vec<String>> = RefCell::new(Vec::new());
    static FINALIZED: Cell<usize> = Cell::new(0);
}

unsafe extern "C" fn capture_write(_vm: *mut QuillVM, text: *const c_char) {
    let text = CStr::from_ptr(text).to_string_lossy().into_owned();
    OUTPUT.with(|out| out.borrow_mut().push_str(&text));
}

unsafe extern "C" fn capture_error(
    _vm: *mut QuillVM,
    kind: QuillErrorType,
    module: *const c_char,
    line: c_int,
    message: *const c_char,
) {
    let module = if module.is_null() {
        String::new()
    } else {
        CStr::from_ptr(module).to_string_lossy().into_owned()
    };
    let message = CStr::from_ptr(message).to_string_lossy().into_owned();
    ERRORS.with(|errors| errors.borrow_mut().push(format!("{kind:?}|{module}|{line}|{message}")));
}

unsafe extern "C" fn reenter(vm: *mut QuillVM) {
    let result = quill_interpret(vm, c"main".as_ptr(), c"var y = 1".as_ptr());
    quill_set_slot_bool(vm, 0, result == QuillInterpretResult::RuntimeError);
}

unsafe extern "C" fn fail(vm: *mut QuillVM) {
    quill_set_slot_string(vm, 0, c"host failure".as_ptr());
    quill_abort_fiber(vm, 0);
}

unsafe extern "C" fn bind_method(
    _vm: *mut QuillVM,
    _module: *const c_char,
    class_name: *const c_char,
    is_static: bool,
    signature: *const c_char,
) -> Option<QuillForeignMethodFn> {
    let class_name = CStr::from_ptr(class_name).to_str().ok()?;
    let signature = CStr::from_ptr(signature).to_str().ok()?;
    match (class_name, is_static, signature) {
        ("Host", true, "reenter()") => Some(reenter),
        ("Host", true, "fail()") => Some(fail),
        _ => None,
    }
}

unsafe extern "C" fn blob_allocate(vm: *mut QuillVM) {
    let data = quill_set_slot_new_foreign(vm, 0, 0, 8).cast::<u64>();
    *data = 7;
}

unsafe extern "C" fn blob_finalize(data: *mut c_void) {
    assert_eq!(*data.cast::<u64>(), 7);
    FINALIZED.with(|count| count.set(count.get() + 1));
}

unsafe extern "C" fn bind_class(
    _vm: *mut QuillVM,
    _module: *const c_char,
    class_name: *const c_char,
) -> QuillForeignClassMethods {
    if CStr::from_ptr(class_name).to_bytes() == b"Blob" {
        QuillForeignClassMethods {
            allocate: Some(blob_allocate),
            finalize: Some(blob_finalize),
        }
    } else {
        QuillForeignClassMethods::default()
    }
}

fn config() -> QuillConfiguration {
    QuillConfiguration {
        write_fn: Some(capture_write),
        error_fn: Some(capture_error),
        bind_foreign_method_fn: Some(bind_method),
        bind_foreign_class_fn: Some(bind_class),
        ..Default::default()
    }
}

fn interpret(vm: *mut QuillVM, source: &str) -> QuillInterpretResult {
    let source = CString::new(source).unwrap();
    unsafe { quill_interpret(vm, c"main".as_ptr(), source.as_ptr()) }
}

/// Runs `source` in a fresh VM and returns the result, output and error lines.
fn run(source: &str) -> (QuillInterpretResult, String, Vec<String>) {
    OUTPUT.with(|out| out.borrow_mut().clear());
    ERRORS.with(|errors| errors.borrow_mut().clear());
    let config = config();
    let vm = unsafe { quill_new_vm(&config) };
    let result = interpret(vm, source);
    unsafe { quill_free_vm(vm) };
    (
        result,
        OUTPUT.with(|out| out.borrow().clone()),
        ERRORS.with(|errors| errors.borrow().clone()),
    )
}

fn output_of(source: &str) -> String {
    let (result, output, errors) = run(source);
    assert_eq!(result, QuillInterpretResult::Success, "errors: {errors:?}");
    output
}

// ===== Language Tests =====

#[test]
fn test_arithmetic_and_print() {
    assert_eq!(output_of("System.print(1 + 2 * 3)"), "7\n");
    assert_eq!(output_of("System.print((1 + 2) * 3 - 10 / 4)"), "6.5\n");
    assert_eq!(output_of("System.print(\"ab\" + \"cd\")"), "abcd\n");
}

#[test]
fn test_class_with_fields_and_getter() {
    let source = "class Counter {
  construct new(start) {
    _count = start
  }
  increment() {
    _count = _count + 1
    return _count
  }
  count { _count }
}
var c = Counter.new(5)
c.increment()
System.print(c.count)
";
    assert_eq!(output_of(source), "6\n");
}

#[test]
fn test_inheritance_and_super() {
    let source = "class Animal {
  construct new(name) {
    _name = name
  }
  name { _name }
  speak() { \"...\" }
  describe() { name + \" says \" + speak() }
}
class Dog is Animal {
  construct new(name) {
    super(name)
  }
  speak() { \"woof\" }
}
System.print(Dog.new(\"rex\").describe())
System.print(Dog.new(\"a\") is Animal)
";
    assert_eq!(output_of(source), "rex says woof\ntrue\n");
}

#[test]
fn test_closures_capture_scope() {
    let source = "var makeCounter = Fn.new {
  var n = 0
  return Fn.new { n = n + 1 }
}
var counter = makeCounter.call()
counter.call()
System.print(counter.call())
";
    assert_eq!(output_of(source), "2\n");
}

#[test]
fn test_loops_lists_and_ranges() {
    let source = "var sum = 0
for (i in 1..4) sum = sum + i
System.print(sum)
var list = [1, 2, 3]
list.add(4)
System.print(list)
var i = 0
while (true) {
  i = i + 1
  if (i > 2) break
}
System.print(i)
";
    assert_eq!(output_of(source), "10\n[1, 2, 3, 4]\n3\n");
}

#[test]
fn test_maps() {
    let source = "var m = {\"a\": 1, \"b\": 2}
m[\"c\"] = 3
System.print(m.count)
System.print(m[\"b\"])
System.print(m.containsKey(\"z\"))
";
    assert_eq!(output_of(source), "3\n2\nfalse\n");
}

#[test]
fn test_fiber_try_captures_error() {
    let source = "var f = Fiber.new {
  Fiber.abort(\"boom\")
}
var e = f.try()
System.print(e)
System.print(f.isDone)
System.print(f.error)
";
    assert_eq!(output_of(source), "boom\ntrue\nboom\n");
}

#[test]
fn test_builtin_random_module() {
    let source = "import \"random\" for Random
var r = Random.new(12)
var x = r.float()
System.print(x >= 0 && x < 1)
var n = r.int(10)
System.print(n >= 0 && n < 10)
";
    assert_eq!(output_of(source), "true\ntrue\n");
}

// ===== Error Reporting Tests =====

#[test]
fn test_runtime_error_reports_stack_trace() {
    let (result, _, errors) = run("var x = 1\nx.foo()");
    assert_eq!(result, QuillInterpretResult::RuntimeError);
    assert_eq!(
        errors,
        vec![
            "Runtime||-1|Num does not implement 'foo()'.".to_string(),
            "StackTrace|main|2|(script)".to_string(),
        ]
    );
}

#[test]
fn test_compile_error_reports_module_and_line() {
    let (result, _, errors) = run("var ok = 1\nvar = 3");
    assert_eq!(result, QuillInterpretResult::CompileError);
    assert_eq!(errors.len(), 1);
    assert!(errors[0].starts_with("Compile|main|2|"), "{errors:?}");
}

#[test]
fn test_unbound_foreign_method_is_compile_error() {
    let (result, _, errors) = run("class Host {\n  foreign static missing()\n}");
    assert_eq!(result, QuillInterpretResult::CompileError);
    assert_eq!(
        errors,
        vec!["Compile|main|2|Could not find foreign method 'missing()' for class Host in module 'main'.".to_string()]
    );
}

#[test]
fn test_unknown_module() {
    let (result, _, errors) = run("import \"nowhere\" for Thing");
    assert_eq!(result, QuillInterpretResult::RuntimeError);
    assert_eq!(errors[0], "Runtime||-1|Could not load module 'nowhere'.");
}

#[test]
fn test_foreign_abort_becomes_runtime_error() {
    let source = "class Host {
  foreign static fail()
}
var f = Fiber.new { Host.fail() }
System.print(f.try())
Host.fail()
";
    let (result, output, errors) = run(source);
    assert_eq!(result, QuillInterpretResult::RuntimeError);
    assert_eq!(output, "host failure\n");
    assert_eq!(errors[0], "Runtime||-1|host failure");
}

// ===== Embedding Tests =====

#[test]
fn test_reentrant_interpret_is_rejected() {
    let source = "class Host {
  foreign static reenter()
}
System.print(Host.reenter())
";
    assert_eq!(output_of(source), "true\n");
}

#[test]
fn test_call_handle_invokes_static_method() {
    let config = config();
    unsafe {
        let vm = quill_new_vm(&config);
        assert_eq!(
            interpret(vm, "class Math {\n  static add(a, b) { a + b }\n}"),
            QuillInterpretResult::Success
        );
        quill_ensure_slots(vm, 3);
        assert!(quill_get_variable(vm, c"main".as_ptr(), c"Math".as_ptr(), 0));
        let add = quill_make_call_handle(vm, c"add(_,_)".as_ptr());
        quill_set_slot_double(vm, 1, 2.0);
        quill_set_slot_double(vm, 2, 3.0);
        assert_eq!(quill_call(vm, add), QuillInterpretResult::Success);
        assert_eq!(quill_get_slot_double(vm, 0), 5.0);

        quill_release_handle(vm, add);
        quill_release_handle(vm, add);
        quill_free_vm(vm);
    }
}

#[test]
fn test_map_rejects_reference_keys() {
    unsafe {
        let vm = quill_new_vm(ptr::null());
        quill_ensure_slots(vm, 3);
        quill_set_slot_new_map(vm, 0);
        quill_set_slot_new_list(vm, 1);
        quill_set_slot_double(vm, 2, 1.0);
        assert!(!quill_set_map_value(vm, 0, 1, 2));
        assert_eq!(quill_get_map_count(vm, 0), 0);

        quill_set_slot_string(vm, 1, c"key".as_ptr());
        assert!(quill_set_map_value(vm, 0, 1, 2));
        assert!(quill_get_map_contains_key(vm, 0, 1));
        assert_eq!(quill_get_map_count(vm, 0), 1);
        quill_free_vm(vm);
    }
}

#[test]
fn test_list_insert_and_negative_index() {
    unsafe {
        let vm = quill_new_vm(ptr::null());
        quill_ensure_slots(vm, 2);
        quill_set_slot_new_list(vm, 0);
        for n in [1.0, 2.0, 3.0] {
            quill_set_slot_double(vm, 1, n);
            assert!(quill_insert_in_list(vm, 0, -1, 1));
        }
        assert_eq!(quill_get_list_count(vm, 0), 3);
        assert!(quill_get_list_element(vm, 0, -1, 1));
        assert_eq!(quill_get_slot_double(vm, 1), 3.0);
        assert!(!quill_get_list_element(vm, 0, 3, 1));
        quill_free_vm(vm);
    }
}

#[test]
fn test_foreign_objects_are_finalized_once() {
    FINALIZED.with(|count| count.set(0));
    let config = config();
    unsafe {
        let vm = quill_new_vm(&config);
        let source = "foreign class Blob {\n  construct new() {}\n}\nBlob.new()\nvar keep = Blob.new()";
        assert_eq!(interpret(vm, source), QuillInterpretResult::Success);
        assert_eq!(FINALIZED.with(Cell::get), 0);

        quill_collect_garbage(vm);
        assert_eq!(FINALIZED.with(Cell::get), 1);
        quill_collect_garbage(vm);
        assert_eq!(FINALIZED.with(Cell::get), 1);

        quill_free_vm(vm);
        assert_eq!(FINALIZED.with(Cell::get), 2);
    }
}

#[test]
fn test_user_data_round_trip() {
    let mut marker = 5u32;
    let config = QuillConfiguration {
        user_data: (&mut marker as *mut u32).cast(),
        ..Default::default()
    };
    unsafe {
        let vm = quill_new_vm(&config);
        assert_eq!(quill_get_user_data(vm), (&mut marker as *mut u32).cast());
        quill_set_user_data(vm, ptr::null_mut());
        assert!(quill_get_user_data(vm).is_null());
        quill_free_vm(vm);
    }
}
