//! The built-in `random` module: a seedable `Random` foreign class.
//!
//! Used only when the host's loader and binders do not claim `random`.

use crate::c_api::{QuillForeignClassMethods, QuillForeignMethodFn, QuillVM};
use crate::interpreter::Interpreter;
use crate::value::Value;
use std::mem::size_of;

pub const MODULE_NAME: &str = "random";

const SOURCE: &str = r#"
foreign class Random {
  construct new() {
    seed_()
  }

  construct new(seed) {
    if (!(seed is Num)) Fiber.abort("Seed must be a number.")
    seed_(seed)
  }

  foreign seed_()
  foreign seed_(seed)

  foreign float()
  float(end) { float() * end }
  float(start, end) { float() * (end - start) + start }

  foreign int()
  int(end) { (float() * end).floor }
  int(start, end) { (float() * (end - start)).floor + start }

  sample(list) {
    if (list.isEmpty) Fiber.abort("Not enough elements to sample.")
    return list[int(list.count)]
  }

  shuffle(list) {
    var i = list.count - 1
    while (i > 0) {
      var j = int(i + 1)
      var swap = list[i]
      list[i] = list[j]
      list[j] = swap
      i = i - 1
    }
    return list
  }
}
"#;

pub fn module_source(name: &str) -> Option<&'static str> {
    (name == MODULE_NAME).then_some(SOURCE)
}

pub fn bind_class(class: &str) -> QuillForeignClassMethods {
    if class != "Random" {
        return QuillForeignClassMethods::default();
    }
    QuillForeignClassMethods {
        allocate: Some(allocate),
        finalize: None,
    }
}

pub fn bind_method(class: &str, is_static: bool, signature: &str) -> Option<QuillForeignMethodFn> {
    if class != "Random" || is_static {
        return None;
    }
    match signature {
        "seed_()" => Some(seed_from_entropy),
        "seed_(_)" => Some(seed_from_number),
        "float()" => Some(float),
        "int()" => Some(int),
        _ => None,
    }
}

/// splitmix64 step.
fn next(state: &mut u64) -> u64 {
    *state = state.wrapping_add(0x9E37_79B9_7F4A_7C15);
    let mut z = *state;
    z = (z ^ (z >> 30)).wrapping_mul(0xBF58_476D_1CE4_E5B9);
    z = (z ^ (z >> 27)).wrapping_mul(0x94D0_49BB_1331_11EB);
    z ^ (z >> 31)
}

unsafe fn state<'a>(vm: &Interpreter) -> Option<&'a mut u64> {
    vm.slot_foreign(0).cast::<u64>().as_mut()
}

unsafe extern "C" fn allocate(vm: *mut QuillVM) {
    let vm = Interpreter::from_raw(vm);
    let data = vm.new_foreign(0, 0, size_of::<u64>()).cast::<u64>();
    if let Some(data) = data.as_mut() {
        *data = 0;
    }
}

unsafe extern "C" fn seed_from_entropy(vm: *mut QuillVM) {
    let vm = Interpreter::from_raw(vm);
    if let Some(state) = state(vm) {
        *state = rand::random::<u64>();
    }
}

unsafe extern "C" fn seed_from_number(vm: *mut QuillVM) {
    let vm = Interpreter::from_raw(vm);
    let seed = match vm.slot(1) {
        Value::Num(n) => n.to_bits(),
        _ => 0,
    };
    if let Some(state) = state(vm) {
        *state = seed;
    }
}

unsafe extern "C" fn float(vm: *mut QuillVM) {
    let vm = Interpreter::from_raw(vm);
    if let Some(state) = state(vm) {
        let bits = next(state) >> 11;
        vm.set_slot(0, Value::Num(bits as f64 / (1u64 << 53) as f64));
    }
}

unsafe extern "C" fn int(vm: *mut QuillVM) {
    let vm = Interpreter::from_raw(vm);
    if let Some(state) = state(vm) {
        let bits = next(state) >> 32;
        vm.set_slot(0, Value::Num(bits as f64));
    }
}
