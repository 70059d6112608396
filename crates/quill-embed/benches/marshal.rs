use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use quill_embed::{Config, ForeignClass, Module, ModuleMap, Value, Vm};

fn bench_slots(c: &mut Criterion) {
    let vm = Vm::new(Config::new());
    vm.ensure_slots(2).unwrap();
    let mut group = c.benchmark_group("slots");

    let samples = [
        ("num", Value::Num(42.5)),
        ("bool", Value::Bool(true)),
        ("short_string", Value::from("hello")),
        ("long_string", Value::from("x".repeat(4096))),
    ];
    for (name, value) in samples {
        group.bench_with_input(BenchmarkId::new("write_read", name), &value, |b, value| {
            b.iter(|| {
                vm.set_slot(1, black_box(value.clone())).unwrap();
                vm.slot(1).unwrap()
            });
        });
    }

    group.finish();
}

fn bench_handles(c: &mut Criterion) {
    let vm = Vm::new(Config::new());
    vm.interpret("main", "var list = [1, 2, 3, 4, 5, 6, 7, 8]").unwrap();

    c.bench_function("read_list_handle", |b| {
        b.iter(|| {
            let list = vm.get_variable("main", black_box("list")).unwrap();
            list.as_list().unwrap().count().unwrap()
        });
    });

    let list = vm.get_variable("main", "list").unwrap();
    let list = list.as_list().unwrap().clone();
    c.bench_function("list_to_vec", |b| b.iter(|| list.to_vec().unwrap()));
}

fn bench_foreign_calls(c: &mut Criterion) {
    let math = ForeignClass::new()
        .with_static_method("add(_,_)", |_, args| {
            let a = args[1].as_num().unwrap_or(0.0);
            let b = args[2].as_num().unwrap_or(0.0);
            Ok(Value::Num(a + b))
        })
        .unwrap();
    let modules = ModuleMap::new().with_module("main", Module::new().with_class("Math", math));
    let vm = Vm::with_modules(Config::new(), &modules);
    vm.interpret(
        "main",
        "class Math {\n  foreign static add(a, b)\n}\nclass Loop {\n  static run(n) {\n    var total = 0\n    for (i in 1..n) total = Math.add(total, i)\n    return total\n  }\n}\n",
    )
    .unwrap();
    let run = vm.method("main", "Loop", "run(_)").unwrap();

    c.bench_function("foreign_add_x100", |b| {
        b.iter(|| run.call(&[black_box(Value::Num(100.0))]).unwrap());
    });

    let add = vm.method("main", "Math", "add(_,_)").unwrap();
    c.bench_function("host_call_handle", |b| {
        b.iter(|| add.call(&[Value::Num(1.0), black_box(Value::Num(2.0))]).unwrap());
    });
}

criterion_group!(benches, bench_slots, bench_handles, bench_foreign_calls);
criterion_main!(benches);
