//! End-to-end tests for the embedding bridge: foreign classes, handles,
//! marshaling and the interpret/call state machine, all driven through
//! real guest code.
//!
//! # Running Tests
//! ```bash
//! cargo test -p quill-embed --test vm_tests
//! ```

use parking_lot::Mutex;
use quill_embed::dispatch::{CLASS_SLOTS, METHOD_SLOTS};
use quill_embed::{
    AsHandle, CallHandle, Config, Error, ForeignClass, ForeignTable, Module, ModuleMap, StackFrame,
    Value, Vm, VmContext,
};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// A config that records everything the VM writes and reports.
fn capturing_config() -> (Config, Arc<Mutex<String>>, Arc<Mutex<Vec<String>>>) {
    let output = Arc::new(Mutex::new(String::new()));
    let errors = Arc::new(Mutex::new(Vec::new()));
    let out = output.clone();
    let errs = errors.clone();
    let config = Config::new()
        .with_write_fn(move |_, text| out.lock().push_str(text))
        .with_error_fn(move |_, err| errs.lock().push(err.to_string()));
    (config, output, errors)
}

fn counter_class() -> ForeignClass {
    ForeignClass::new()
        .with_initializer(|_, args| {
            let start = args.first().and_then(Value::as_num).unwrap_or(0.0);
            Ok(Box::new(start))
        })
        .with_method("increment(_)", |_, args| {
            let this = args[0].as_foreign().ok_or("receiver is not a foreign object")?;
            let by = args[1].as_num().ok_or("increment expects a number")?;
            let total = this.with(|total: &mut f64| {
                *total += by;
                *total
            })?;
            Ok(Value::Num(total))
        })
        .unwrap()
}

fn host_class() -> ForeignClass {
    ForeignClass::new()
        .with_static_method("fail()", |_, _| Err("boom".into()))
        .unwrap()
        .with_static_method("explode()", |_, _| panic!("kaboom"))
        .unwrap()
        .with_static_method("reenter()", |ctx: &VmContext, _| {
            let rejected = matches!(ctx.interpret("main", "var y = 1"), Err(Error::ReentrantCall));
            Ok(Value::Bool(rejected && ctx.is_running()))
        })
        .unwrap()
        .with_static_method("sum(_)", |_, args| {
            let list = args[1].as_list().ok_or("sum expects a list")?;
            let total: f64 = list.to_vec()?.iter().filter_map(Value::as_num).sum();
            Ok(Value::Num(total))
        })
        .unwrap()
}

fn modules() -> ModuleMap {
    ModuleMap::new().with_module(
        "main",
        Module::new()
            .with_class("Counter", counter_class())
            .with_class("Host", host_class()),
    )
}

const COUNTER_SOURCE: &str = "foreign class Counter {
  construct new() {}
  construct new(start) {}
  foreign increment(by)
}
";

const HOST_SOURCE: &str = "class Host {
  foreign static fail()
  foreign static explode()
  foreign static reenter()
  foreign static sum(list)
}
";

// ===== Foreign Class Tests =====

#[test]
fn test_counter_increments() {
    init_tracing();
    let vm = Vm::with_modules(Config::new(), &modules());
    let source = format!("{COUNTER_SOURCE}var c = Counter.new()\nvar first = c.increment(5)\nvar second = c.increment(3)\n");
    vm.interpret("main", &source).unwrap();

    assert_eq!(vm.get_variable("main", "first").unwrap(), Value::Num(5.0));
    assert_eq!(vm.get_variable("main", "second").unwrap(), Value::Num(8.0));

    let c = vm.get_variable("main", "c").unwrap();
    let counter = c.as_foreign().unwrap();
    assert_eq!(counter.with(|total: &mut f64| *total).unwrap(), 8.0);
    assert!(matches!(counter.with(|_: &mut String| ()), Err(Error::ForeignTypeMismatch { .. })));

    let increment = counter.func("increment(_)").unwrap();
    assert_eq!(increment.call(&[Value::from(2)]).unwrap(), Value::Num(10.0));
}

#[test]
fn test_initializer_receives_constructor_arguments() {
    let vm = Vm::with_modules(Config::new(), &modules());
    let source = format!("{COUNTER_SOURCE}var c = Counter.new(10)\nvar total = c.increment(1)\n");
    vm.interpret("main", &source).unwrap();
    assert_eq!(vm.get_variable("main", "total").unwrap(), Value::Num(11.0));
}

#[test]
fn test_foreign_failure_aborts_fiber() {
    init_tracing();
    let vm = Vm::with_modules(Config::new(), &modules());
    let source = format!("{HOST_SOURCE}var f = Fiber.new {{ Host.fail() }}\nvar e = f.try()\n");
    vm.interpret("main", &source).unwrap();
    assert_eq!(vm.get_variable("main", "e").unwrap(), Value::from("boom"));
}

#[test]
fn test_uncaught_foreign_failure_is_runtime_error() {
    let (config, _, errors) = capturing_config();
    let vm = Vm::with_modules(config, &modules());
    let source = format!("{HOST_SOURCE}Host.fail()\n");
    match vm.interpret("main", &source) {
        Err(Error::Runtime { message, .. }) => assert_eq!(message, "boom"),
        other => panic!("expected runtime error, got {other:?}"),
    }
    assert_eq!(errors.lock().first().map(String::as_str), Some("boom"));
}

#[test]
fn test_host_panic_becomes_guest_error() {
    let vm = Vm::with_modules(Config::new(), &modules());
    let source = format!("{HOST_SOURCE}var f = Fiber.new {{ Host.explode() }}\nvar e = f.try()\n");
    vm.interpret("main", &source).unwrap();
    assert_eq!(
        vm.get_variable("main", "e").unwrap(),
        Value::from("Host function panicked: kaboom")
    );
}

#[test]
fn test_foreign_method_reads_list_argument() {
    let vm = Vm::with_modules(Config::new(), &modules());
    let source = format!("{HOST_SOURCE}var total = Host.sum([1, 2, 3.5])\n");
    vm.interpret("main", &source).unwrap();
    assert_eq!(vm.get_variable("main", "total").unwrap(), Value::Num(6.5));
}

#[test]
fn test_class_without_initializer_cannot_be_constructed() {
    let modules =
        ModuleMap::new().with_module("main", Module::new().with_class("Bare", ForeignClass::new()));
    let vm = Vm::with_modules(Config::new(), &modules);
    let source = "foreign class Bare {\n  construct new() {}\n}\nvar f = Fiber.new { Bare.new() }\nvar e = f.try()\n";
    vm.interpret("main", source).unwrap();
    assert_eq!(
        vm.get_variable("main", "e").unwrap(),
        Value::from("Class 'Bare' implements no constructor.")
    );

    let source = "foreign class Unknown {\n  construct new() {}\n}\nUnknown.new()\n";
    assert!(matches!(vm.interpret("main", source), Err(Error::Runtime { .. })));
}

#[test]
fn test_unbound_foreign_method_is_compile_error() {
    let (config, _, errors) = capturing_config();
    let vm = Vm::new(config);
    match vm.interpret("main", "class Host {\n  foreign static missing()\n}") {
        Err(Error::Compile { module, line, message }) => {
            assert_eq!(module, "main");
            assert_eq!(line, 2);
            assert!(message.contains("missing()"), "{message}");
        }
        other => panic!("expected compile error, got {other:?}"),
    }
    assert_eq!(errors.lock().len(), 1);
}

#[test]
fn test_bindings_added_after_creation() {
    let vm = Vm::new(Config::new());
    vm.set_module("main", modules().get("main").unwrap());
    let source = format!("{COUNTER_SOURCE}var total = Counter.new().increment(4)\n");
    vm.interpret("main", &source).unwrap();
    assert_eq!(vm.get_variable("main", "total").unwrap(), Value::Num(4.0));
}

#[test]
fn test_vm_keeps_its_own_copy_of_bindings() {
    let mut table = modules();
    let vm = Vm::with_modules(Config::new(), &table);
    table.insert("main", Module::new());

    let source = format!("{COUNTER_SOURCE}var total = Counter.new().increment(1)\n");
    vm.interpret("main", &source).unwrap();
    assert!(vm.modules().class("main", "Counter").is_some());
}

#[test]
fn test_finalizer_runs_once() {
    let finalized = Arc::new(AtomicUsize::new(0));
    let seen = finalized.clone();
    let blob = ForeignClass::new()
        .with_default_payload::<u32>()
        .with_finalizer(move |ctx, payload| {
            assert!(payload.downcast_ref::<u32>().is_some());
            assert!(ctx.id() > 0);
            seen.fetch_add(1, Ordering::SeqCst);
        });
    let modules = ModuleMap::new().with_module("main", Module::new().with_class("Blob", blob));
    let mut vm = Vm::with_modules(Config::new(), &modules);
    let id = vm.id();

    let source = "foreign class Blob {\n  construct new() {}\n}\nBlob.new()\nvar keep = Blob.new()\n";
    vm.interpret("main", source).unwrap();
    assert_eq!(ForeignTable::global().count_for_vm(id), 2);
    assert_eq!(finalized.load(Ordering::SeqCst), 0);

    vm.collect_garbage().unwrap();
    assert_eq!(finalized.load(Ordering::SeqCst), 1);
    vm.collect_garbage().unwrap();
    assert_eq!(finalized.load(Ordering::SeqCst), 1);

    vm.free().unwrap();
    assert_eq!(finalized.load(Ordering::SeqCst), 2);
    assert_eq!(ForeignTable::global().count_for_vm(id), 0);
}

#[test]
fn test_builtin_random_module_without_bindings() {
    let vm = Vm::new(Config::new());
    let source = "import \"random\" for Random\nvar r = Random.new(7)\nvar n = r.int(10)\n";
    vm.interpret("main", source).unwrap();
    let n = vm.get_variable("main", "n").unwrap().as_num().unwrap();
    assert!((0.0..10.0).contains(&n));
}

// ===== Multiple VM Tests =====

fn tag_modules(tag: &'static str) -> ModuleMap {
    let class = ForeignClass::new()
        .with_default_payload::<()>()
        .with_method("tag()", move |_, _| Ok(Value::from(tag)))
        .unwrap();
    ModuleMap::new().with_module("main", Module::new().with_class("Tag", class))
}

#[test]
fn test_same_class_name_in_two_vms() {
    let a = Vm::with_modules(Config::new(), &tag_modules("a"));
    let b = Vm::with_modules(Config::new(), &tag_modules("b"));
    let source = "foreign class Tag {\n  construct new() {}\n  foreign tag()\n}\nvar t = Tag.new()\n";
    a.interpret("main", source).unwrap();
    b.interpret("main", source).unwrap();

    a.interpret("main", "var result = t.tag()").unwrap();
    b.interpret("main", "var result = t.tag()").unwrap();
    assert_eq!(a.get_variable("main", "result").unwrap(), Value::from("a"));
    assert_eq!(b.get_variable("main", "result").unwrap(), Value::from("b"));
}

#[test]
fn test_many_live_vms_bind_the_same_class() {
    let source = "foreign class Thing {\n  construct new() {}\n  foreign get()\n}\nvar r = Fiber.new { Thing.new().get() }.try()\n";
    let count = CLASS_SLOTS.max(METHOD_SLOTS) + 4;
    let vms: Vec<Vm> = (0..count)
        .map(|i| {
            let thing = ForeignClass::new()
                .with_default_payload::<f64>()
                .with_method("get()", move |_, _| Ok(Value::from(i)))
                .unwrap();
            let modules =
                ModuleMap::new().with_module("main", Module::new().with_class("Thing", thing));
            let vm = Vm::with_modules(Config::new(), &modules);
            vm.interpret("main", source).unwrap();
            vm
        })
        .collect();
    for (i, vm) in vms.iter().enumerate() {
        assert_eq!(vm.get_variable("main", "r").unwrap(), Value::from(i));
    }
}

#[test]
fn test_vms_run_in_parallel() {
    init_tracing();
    let workers: Vec<_> = (0..4)
        .map(|worker| {
            thread::spawn(move || {
                let vm = Vm::with_modules(Config::new(), &modules());
                let source = format!(
                    "{COUNTER_SOURCE}var c = Counter.new({worker})\nfor (i in 1..50) c.increment(1)\nvar total = c.increment(0)\n"
                );
                vm.interpret("main", &source).unwrap();
                vm.get_variable("main", "total").unwrap()
            })
        })
        .collect();
    for (worker, handle) in workers.into_iter().enumerate() {
        assert_eq!(handle.join().unwrap(), Value::Num(worker as f64 + 50.0));
    }
}

#[test]
fn test_context_shared_across_threads() {
    let vm = Vm::new(Config::new());
    vm.interpret("main", "var n = 0").unwrap();
    let workers: Vec<_> = (0..4)
        .map(|_| {
            let ctx = vm.context();
            thread::spawn(move || {
                for _ in 0..25 {
                    ctx.interpret("main", "n = n + 1").unwrap();
                }
            })
        })
        .collect();
    for worker in workers {
        worker.join().unwrap();
    }
    assert_eq!(vm.get_variable("main", "n").unwrap(), Value::Num(100.0));
}

#[test]
fn test_handle_from_other_vm_is_rejected() {
    let a = Vm::new(Config::new());
    let b = Vm::new(Config::new());
    let list = a.new_list().unwrap();

    b.ensure_slots(1).unwrap();
    assert!(matches!(b.set_slot(0, list.clone()), Err(Error::WrongVm)));
    assert_eq!(b.slot(0).unwrap(), Value::Null);
    assert!(matches!(b.make_call_handle(list.handle(), "count"), Err(Error::WrongVm)));
}

// ===== Interpret / Call Tests =====

#[test]
fn test_reentrant_interpret_is_rejected() {
    let vm = Vm::with_modules(Config::new(), &modules());
    let source = format!("{HOST_SOURCE}var rejected = Host.reenter()\n");
    vm.interpret("main", &source).unwrap();
    assert_eq!(vm.get_variable("main", "rejected").unwrap(), Value::Bool(true));

    assert!(!vm.is_running());
    vm.interpret("main", "var after = 2").unwrap();
    assert_eq!(vm.get_variable("main", "after").unwrap(), Value::Num(2.0));
}

#[test]
fn test_reentrant_call_is_rejected() {
    let stored: Arc<Mutex<Option<CallHandle>>> = Arc::new(Mutex::new(None));
    let inside = stored.clone();
    let hook = ForeignClass::new()
        .with_static_method("callBack()", move |_, _| {
            let ping = inside.lock().clone().ok_or("no call handle stored")?;
            Ok(Value::Bool(matches!(ping.call(&[]), Err(Error::ReentrantCall))))
        })
        .unwrap();
    let modules = ModuleMap::new().with_module("main", Module::new().with_class("Hook", hook));
    let vm = Vm::with_modules(Config::new(), &modules);
    vm.interpret(
        "main",
        "class Hook {\n  foreign static callBack()\n}\nclass Target {\n  static ping() { 1 }\n}\n",
    )
    .unwrap();
    let ping = vm.method("main", "Target", "ping()").unwrap();
    *stored.lock() = Some(ping.clone());

    vm.interpret("main", "var rejected = Hook.callBack()").unwrap();
    assert_eq!(vm.get_variable("main", "rejected").unwrap(), Value::Bool(true));
    assert!(!vm.is_running());
    assert_eq!(ping.call(&[]).unwrap(), Value::Num(1.0));

    stored.lock().take();
    ping.release();
    assert!(matches!(ping.call(&[]), Err(Error::HandleReleased)));
}

#[test]
fn test_call_handle_on_class() {
    let vm = Vm::new(Config::new());
    vm.interpret("main", "class Math {\n  static add(a, b) { a + b }\n}").unwrap();

    let add = vm.method("main", "Math", "add(_,_)").unwrap();
    assert_eq!(add.signature(), "add(_,_)");
    assert_eq!(add.arity(), 2);
    assert_eq!(add.call(&[Value::from(2), Value::from(3)]).unwrap(), Value::Num(5.0));
    assert_eq!(add.call(&[Value::from("a"), Value::from("b")]).unwrap(), Value::from("ab"));
    assert!(matches!(
        add.call(&[Value::from(1)]),
        Err(Error::ArityMismatch { expected: 2, got: 1, .. })
    ));

    let math = vm.get_variable("main", "Math").unwrap();
    let math = math.as_handle().unwrap();
    assert!(matches!(math.func("static add(_,_)"), Err(Error::InvalidSignature { .. })));
    let missing = vm.make_call_handle(math, "missing()").unwrap();
    assert!(matches!(missing.call(&[]), Err(Error::Runtime { .. })));
    assert!(!vm.is_running());
}

#[test]
fn test_runtime_error_carries_stack_trace() {
    let (config, _, errors) = capturing_config();
    let vm = Vm::new(config);
    match vm.interpret("main", "var x = 1\nx.foo()") {
        Err(Error::Runtime { message, stack_trace }) => {
            assert_eq!(message, "Num does not implement 'foo()'.");
            assert_eq!(
                stack_trace,
                vec![StackFrame {
                    module: "main".to_string(),
                    line: 2,
                    function: "(script)".to_string(),
                }]
            );
        }
        other => panic!("expected runtime error, got {other:?}"),
    }
    assert_eq!(
        *errors.lock(),
        vec!["Num does not implement 'foo()'.".to_string(), "[main line 2] in (script)".to_string()]
    );
}

#[test]
fn test_compile_error() {
    let vm = Vm::new(Config::new().with_error_fn(|_, _| {}));
    match vm.interpret("main", "var ok = 1\nvar = 3") {
        Err(Error::Compile { module, line, .. }) => {
            assert_eq!(module, "main");
            assert_eq!(line, 2);
        }
        other => panic!("expected compile error, got {other:?}"),
    }
    assert!(matches!(vm.interpret("ma\0in", "var x = 1"), Err(Error::InteriorNul { .. })));
}

#[test]
fn test_get_variable() {
    let vm = Vm::new(Config::new());
    vm.interpret("main", "var answer = 42").unwrap();
    assert_eq!(vm.get_variable("main", "answer").unwrap(), Value::Num(42.0));
    assert!(vm.has_module("main").unwrap());
    assert!(vm.has_variable("main", "answer").unwrap());
    assert!(!vm.has_variable("main", "question").unwrap());
    assert!(matches!(vm.get_variable("nowhere", "answer"), Err(Error::NoSuchModule { .. })));
    assert!(matches!(
        vm.get_variable("main", "question"),
        Err(Error::NoSuchVariable { .. })
    ));
}

// ===== Handle Tests =====

#[test]
fn test_release_is_idempotent() {
    let vm = Vm::new(Config::new());
    vm.interpret("main", "var list = [1, 2, 3]").unwrap();
    let before = vm.live_handle_count();

    let list = vm.get_variable("main", "list").unwrap();
    let list = list.as_list().unwrap().clone();
    assert_eq!(list.count().unwrap(), 3);
    assert_eq!(vm.live_handle_count(), before + 1);

    list.release();
    list.release();
    assert!(list.is_released());
    assert_eq!(vm.live_handle_count(), before);
    assert!(matches!(list.count(), Err(Error::HandleReleased)));
    assert!(matches!(list.get(0), Err(Error::HandleReleased)));
    assert!(matches!(vm.set_slot(0, list.clone()), Err(Error::HandleReleased)));
}

#[test]
fn test_list_operations() {
    let vm = Vm::new(Config::new());
    let list = vm.new_list().unwrap();
    for n in [1, 2, 3] {
        list.push(n).unwrap();
    }
    list.insert(0, "first").unwrap();
    list.insert(4, "last").unwrap();
    list.set(1, true).unwrap();

    assert_eq!(list.count().unwrap(), 5);
    assert_eq!(list.get(0).unwrap(), Value::from("first"));
    assert_eq!(
        list.to_vec().unwrap(),
        vec![
            Value::from("first"),
            Value::Bool(true),
            Value::Num(2.0),
            Value::Num(3.0),
            Value::from("last"),
        ]
    );
    assert!(matches!(list.get(5), Err(Error::IndexOutOfBounds { index: 5, count: 5 })));
    assert!(matches!(list.insert(9, 0), Err(Error::IndexOutOfBounds { .. })));
    assert!(matches!(list.set(7, 0), Err(Error::IndexOutOfBounds { .. })));
}

#[test]
fn test_map_operations() {
    let vm = Vm::new(Config::new());
    let map = vm.new_map().unwrap();
    map.set("a", 1).unwrap();
    map.set(2, "two").unwrap();
    map.set(Value::Null, false).unwrap();

    assert_eq!(map.count().unwrap(), 3);
    assert!(map.contains("a").unwrap());
    assert!(!map.contains("b").unwrap());
    assert_eq!(map.get(2).unwrap(), Value::from("two"));
    assert!(matches!(map.get("b"), Err(Error::KeyNotFound { .. })));

    assert_eq!(map.remove("a").unwrap(), Value::Num(1.0));
    assert!(matches!(map.remove("a"), Err(Error::KeyNotFound { .. })));
    assert_eq!(map.count().unwrap(), 2);
}

#[test]
fn test_map_rejects_handle_keys() {
    let vm = Vm::new(Config::new());
    let map = vm.new_map().unwrap();
    map.set("kept", 1).unwrap();
    let key = vm.new_list().unwrap();

    assert!(matches!(map.set(key.clone(), 2), Err(Error::InvalidMapKey { .. })));
    assert!(matches!(map.contains(key), Err(Error::InvalidMapKey { .. })));
    assert_eq!(map.count().unwrap(), 1);
    assert_eq!(map.get("kept").unwrap(), Value::Num(1.0));
}

#[test]
fn test_guest_collections_read_back() {
    let vm = Vm::new(Config::new());
    vm.interpret("main", "var m = {\"k\": [1, \"two\"]}").unwrap();
    let m = vm.get_variable("main", "m").unwrap();
    let inner = m.as_map().unwrap().get("k").unwrap();
    let items = inner.as_list().unwrap().to_vec().unwrap();
    assert_eq!(items, vec![Value::Num(1.0), Value::from("two")]);
}

// ===== Marshaling Tests =====

#[test]
fn test_slot_round_trips() {
    let vm = Vm::new(Config::new());
    vm.ensure_slots(2).unwrap();
    assert!(vm.slot_count().unwrap() >= 2);

    let samples = [
        Value::Null,
        Value::Bool(true),
        Value::Bool(false),
        Value::from(-7i32),
        Value::from(u32::MAX),
        Value::from(1u64 << 53),
        Value::from(0.1f64),
        Value::from(f64::MAX),
        Value::from(""),
        Value::from("nul\0inside"),
        Value::from("héllo wörld ✓"),
        Value::from(vec![0xffu8, 0x00, 0xfe]),
    ];
    for sample in samples {
        vm.set_slot(1, sample.clone()).unwrap();
        assert_eq!(vm.slot(1).unwrap(), sample);
    }
}

#[test]
fn test_set_slot_any() {
    let vm = Vm::new(Config::new());
    vm.ensure_slots(1).unwrap();

    vm.set_slot_any(0, &42u64).unwrap();
    assert_eq!(vm.slot(0).unwrap(), Value::Num(42.0));
    vm.set_slot_any(0, &7u128).unwrap();
    assert_eq!(vm.slot(0).unwrap(), Value::Num(7.0));
    vm.set_slot_any(0, &-5i128).unwrap();
    assert_eq!(vm.slot(0).unwrap(), Value::Num(-5.0));
    vm.set_slot_any(0, &String::from("text")).unwrap();
    assert_eq!(vm.slot(0).unwrap(), Value::from("text"));

    let result = vm.set_slot_any(0, &std::time::Duration::from_secs(1));
    assert!(matches!(result, Err(Error::UnsupportedValue { .. })));
    assert_eq!(vm.slot(0).unwrap(), Value::Null);
}

// ===== Configuration Tests =====

#[test]
fn test_write_goes_to_handler() {
    let (config, output, _) = capturing_config();
    let vm = Vm::new(config);
    vm.interpret("main", "System.print(\"hello\")\nSystem.write(1 + 2)").unwrap();
    assert_eq!(*output.lock(), "hello\n3");
}

#[test]
fn test_default_streams_are_used_without_handlers() {
    let out = Arc::new(Mutex::new(Vec::<u8>::new()));
    let err = Arc::new(Mutex::new(Vec::<u8>::new()));
    let config = Config::new()
        .with_default_output(out.clone())
        .with_default_error(err.clone());
    let vm = Vm::new(config);

    vm.interpret("main", "System.print(\"to stream\")").unwrap();
    assert!(vm.interpret("main", "null.foo()").is_err());
    assert_eq!(String::from_utf8_lossy(&out.lock()), "to stream\n");
    assert!(String::from_utf8_lossy(&err.lock()).contains("does not implement 'foo()'"));
}

#[test]
fn test_update_config_replaces_handler() {
    let vm = Vm::new(Config::new().with_write_fn(|_, _| {}));
    let captured = Arc::new(Mutex::new(String::new()));
    let sink = captured.clone();
    vm.update_config(move |config| {
        config.write_fn = Some(Arc::new(move |_: &VmContext, text: &str| {
            sink.lock().push_str(text)
        }));
    });
    vm.interpret("main", "System.write(\"x\")").unwrap();
    assert_eq!(*captured.lock(), "x");
}

#[test]
fn test_module_loading() {
    let config = Config::new()
        .with_resolve_module_fn(|_, importer, name| Some(format!("{importer}/{name}")))
        .with_load_module_fn(|_, name| match name {
            "main/util" => Some("var Answer = 42".to_string()),
            _ => None,
        })
        .with_error_fn(|_, _| {});
    let vm = Vm::new(config);
    vm.interpret("main", "import \"util\" for Answer\nvar x = Answer").unwrap();
    assert_eq!(vm.get_variable("main", "x").unwrap(), Value::Num(42.0));
    assert!(vm.has_module("main/util").unwrap());

    match vm.interpret("main", "import \"nowhere\" for Thing") {
        Err(Error::Runtime { message, .. }) => {
            assert_eq!(message, "Could not load module 'main/nowhere'.")
        }
        other => panic!("expected runtime error, got {other:?}"),
    }
}

#[test]
fn test_interpret_file() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("script.quill");
    std::fs::write(&path, "var fromFile = \"yes\"").unwrap();

    let vm = Vm::new(Config::new());
    vm.interpret_file(&path).unwrap();
    let module = path.to_string_lossy();
    assert_eq!(vm.get_variable(&module, "fromFile").unwrap(), Value::from("yes"));
    assert!(matches!(vm.interpret_file(dir.path().join("missing.quill")), Err(Error::Io(_))));
}

#[test]
fn test_user_data() {
    let vm = Vm::new(Config::new().with_user_data(String::from("state")));
    assert_eq!(vm.user_data_as::<String>().as_deref().map(String::as_str), Some("state"));
    assert!(vm.user_data_as::<u32>().is_none());
}

// ===== Lifecycle Tests =====

#[test]
fn test_free_releases_everything() {
    let mut vm = Vm::with_modules(Config::new(), &modules());
    let ctx = vm.context();
    vm.interpret("main", "var list = [1]").unwrap();
    let list = vm.get_variable("main", "list").unwrap();
    assert_eq!(vm.live_handle_count(), 1);

    vm.free().unwrap();
    assert!(ctx.is_freed());
    assert_eq!(ctx.live_handle_count(), 0);
    assert!(list.as_list().unwrap().is_released());
    assert!(matches!(list.as_list().unwrap().count(), Err(Error::HandleReleased)));
    assert!(matches!(ctx.interpret("main", "var x = 1"), Err(Error::VmAlreadyFreed)));
    assert!(matches!(ctx.get_variable("main", "list"), Err(Error::VmAlreadyFreed)));
    assert!(matches!(vm.free(), Err(Error::VmAlreadyFreed)));
}

#[test]
fn test_live_vm_count_tracks_vms() {
    let vm = Vm::new(Config::new());
    assert!(quill_embed::live_vm_count() >= 1);
    drop(vm);
}
