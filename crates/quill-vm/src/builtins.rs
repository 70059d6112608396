//! Built-in classes and their primitive methods.

use crate::heap::Heap;
use crate::interpreter::{class_name, normalize_index, Interpreter, Throw};
use crate::value::*;
use std::time::{SystemTime, UNIX_EPOCH};

/// Ids of the classes every interpreter starts with.
#[derive(Debug, Clone, Copy)]
pub struct CoreClasses {
    pub object: ObjId,
    pub class: ObjId,
    pub bool_: ObjId,
    pub null: ObjId,
    pub num: ObjId,
    pub string: ObjId,
    pub list: ObjId,
    pub map: ObjId,
    pub range: ObjId,
    pub fn_: ObjId,
    pub fiber: ObjId,
    pub system: ObjId,
}

impl CoreClasses {
    pub fn all(&self) -> [ObjId; 12] {
        [
            self.object,
            self.class,
            self.bool_,
            self.null,
            self.num,
            self.string,
            self.list,
            self.map,
            self.range,
            self.fn_,
            self.fiber,
            self.system,
        ]
    }

    /// Every core class except `Object` is closed to subclassing.
    pub fn is_sealed(&self, id: ObjId) -> bool {
        id != self.object && self.all().contains(&id)
    }
}

/// Allocates the core classes and returns them with their global names.
pub fn bootstrap(heap: &mut Heap) -> (CoreClasses, Vec<(&'static str, ObjId)>) {
    let object = heap.alloc(Obj::Class(ClassObj::new("Object", None)));
    let mut class = |name: &str| heap.alloc(Obj::Class(ClassObj::new(name, Some(object))));
    let core = CoreClasses {
        object,
        class: class("Class"),
        bool_: class("Bool"),
        null: class("Null"),
        num: class("Num"),
        string: class("String"),
        list: class("List"),
        map: class("Map"),
        range: class("Range"),
        fn_: class("Fn"),
        fiber: class("Fiber"),
        system: class("System"),
    };

    define_object(heap, &core);
    define_bool_and_null(heap, &core);
    define_num(heap, &core);
    define_string(heap, &core);
    define_list(heap, &core);
    define_map(heap, &core);
    define_range(heap, &core);
    define_fn(heap, &core);
    define_fiber(heap, &core);
    define_system(heap, &core);

    let globals = vec![
        ("Object", core.object),
        ("Class", core.class),
        ("Bool", core.bool_),
        ("Null", core.null),
        ("Num", core.num),
        ("String", core.string),
        ("List", core.list),
        ("Map", core.map),
        ("Range", core.range),
        ("Fn", core.fn_),
        ("Fiber", core.fiber),
        ("System", core.system),
    ];
    (core, globals)
}

fn method(heap: &mut Heap, class: ObjId, signature: &str, primitive: Primitive) {
    if let Obj::Class(class) = &mut heap[class] {
        class
            .methods
            .insert(signature.to_string(), Method::Primitive(primitive));
    }
}

fn static_method(heap: &mut Heap, class: ObjId, signature: &str, primitive: Primitive) {
    if let Obj::Class(class) = &mut heap[class] {
        class
            .static_methods
            .insert(signature.to_string(), Method::Primitive(primitive));
    }
}

// ============================================================================
// Argument helpers
// ============================================================================

fn num_arg(vm: &Interpreter, args: &[Value], index: usize, what: &str) -> Result<f64, Throw> {
    match args.get(index) {
        Some(Value::Num(n)) => Ok(*n),
        _ => Err(vm.error(format!("{what} must be a number."))),
    }
}

fn int_arg(vm: &Interpreter, args: &[Value], index: usize, what: &str) -> Result<i64, Throw> {
    let n = num_arg(vm, args, index, what)?;
    if n.fract() != 0.0 || !n.is_finite() {
        return Err(vm.error(format!("{what} must be an integer.")));
    }
    Ok(n as i64)
}

fn string_arg(
    vm: &Interpreter,
    args: &[Value],
    index: usize,
    what: &str,
) -> Result<Vec<u8>, Throw> {
    args.get(index)
        .and_then(|value| vm.string_bytes(*value))
        .ok_or_else(|| vm.error(format!("{what} must be a string.")))
}

fn subscript(vm: &Interpreter, args: &[Value], index: usize, len: usize) -> Result<usize, Throw> {
    let n = match args.get(index) {
        Some(Value::Num(n)) => *n,
        _ => return Err(vm.error("Subscript must be a number.")),
    };
    if n.fract() != 0.0 {
        return Err(vm.error("Subscript must be an integer."));
    }
    normalize_index(n as isize, len).ok_or_else(|| vm.error("Subscript out of bounds."))
}

fn receiver_num(args: &[Value]) -> f64 {
    match args[0] {
        Value::Num(n) => n,
        _ => f64::NAN,
    }
}

fn list_items(vm: &Interpreter, value: Value) -> Result<Vec<Value>, Throw> {
    with_list(vm, value, |items| items.clone())
}

fn with_list<R>(
    vm: &Interpreter,
    value: Value,
    f: impl FnOnce(&mut Vec<Value>) -> R,
) -> Result<R, Throw> {
    let result = value.as_obj().and_then(|id| match &mut vm.heap.borrow_mut()[id] {
        Obj::List(items) => Some(f(items)),
        _ => None,
    });
    result.ok_or_else(|| vm.error("Expected a list."))
}

fn with_map<R>(
    vm: &Interpreter,
    value: Value,
    f: impl FnOnce(&mut MapObj) -> R,
) -> Result<R, Throw> {
    let result = value.as_obj().and_then(|id| match &mut vm.heap.borrow_mut()[id] {
        Obj::Map(map) => Some(f(map)),
        _ => None,
    });
    result.ok_or_else(|| vm.error("Expected a map."))
}

fn range_of(vm: &Interpreter, value: Value) -> Result<RangeObj, Throw> {
    let range = value.as_obj().and_then(|id| match &vm.heap.borrow()[id] {
        Obj::Range(range) => Some(*range),
        _ => None,
    });
    range.ok_or_else(|| vm.error("Expected a range."))
}

fn text(vm: &Interpreter, text: impl Into<String>) -> Value {
    vm.new_string(text.into().into_bytes())
}

/// Formats like C's `%.14g`, with `nan` and `infinity` spelled out.
pub fn format_num(n: f64) -> String {
    if n.is_nan() {
        return "nan".to_string();
    }
    if n.is_infinite() {
        return if n > 0.0 { "infinity" } else { "-infinity" }.to_string();
    }
    if n == 0.0 {
        return if n.is_sign_negative() { "-0" } else { "0" }.to_string();
    }
    let scientific = format!("{n:.13e}");
    let (mantissa, exponent) = scientific.split_once('e').unwrap_or((&scientific, "0"));
    let exponent: i32 = exponent.parse().unwrap_or(0);
    if !(-4..14).contains(&exponent) {
        let sign = if exponent < 0 { '-' } else { '+' };
        format!("{}e{}{:02}", trim_fraction(mantissa), sign, exponent.abs())
    } else {
        let decimals = (13 - exponent).max(0) as usize;
        trim_fraction(&format!("{n:.decimals$}"))
    }
}

fn trim_fraction(text: &str) -> String {
    if text.contains('.') {
        text.trim_end_matches('0').trim_end_matches('.').to_string()
    } else {
        text.to_string()
    }
}

fn find_bytes(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    if needle.is_empty() {
        return Some(0);
    }
    haystack.windows(needle.len()).position(|window| window == needle)
}

// ============================================================================
// Object, Class, Bool, Null
// ============================================================================

fn define_object(heap: &mut Heap, core: &CoreClasses) {
    method(heap, core.object, "!", |_, _| Ok(Value::Bool(false)));
    method(heap, core.object, "==(_)", |vm, a| Ok(Value::Bool(vm.values_equal(a[0], a[1]))));
    method(heap, core.object, "!=(_)", |vm, a| Ok(Value::Bool(!vm.values_equal(a[0], a[1]))));
    method(heap, core.object, "is(_)", |vm, a| vm.is_instance(a[0], a[1]).map(Value::Bool));
    method(heap, core.object, "type", |vm, a| Ok(Value::Obj(vm.class_of(a[0]))));
    method(heap, core.object, "toString", |vm, a| {
        let name = class_name(&vm.heap.borrow(), vm.class_of(a[0]));
        Ok(text(vm, format!("instance of {name}")))
    });

    method(heap, core.class, "name", |vm, a| {
        let name = a[0].as_obj().map(|id| class_name(&vm.heap.borrow(), id));
        Ok(text(vm, name.unwrap_or_default()))
    });
    method(heap, core.class, "toString", |vm, a| {
        let name = a[0].as_obj().map(|id| class_name(&vm.heap.borrow(), id));
        Ok(text(vm, name.unwrap_or_default()))
    });
    method(heap, core.class, "supertype", |vm, a| {
        let superclass = a[0].as_obj().and_then(|id| match &vm.heap.borrow()[id] {
            Obj::Class(class) => class.superclass,
            _ => None,
        });
        Ok(superclass.map_or(Value::Null, Value::Obj))
    });
}

fn define_bool_and_null(heap: &mut Heap, core: &CoreClasses) {
    method(heap, core.bool_, "!", |_, a| Ok(Value::Bool(a[0].is_falsy())));
    method(heap, core.bool_, "toString", |vm, a| {
        Ok(text(vm, if a[0].is_falsy() { "false" } else { "true" }))
    });
    method(heap, core.null, "!", |_, _| Ok(Value::Bool(true)));
    method(heap, core.null, "toString", |vm, _| Ok(text(vm, "null")));
}

// ============================================================================
// Num
// ============================================================================

fn num_binary(
    vm: &Interpreter,
    args: &[Value],
    op: impl Fn(f64, f64) -> Value,
) -> Result<Value, Throw> {
    let rhs = num_arg(vm, args, 1, "Right operand")?;
    Ok(op(receiver_num(args), rhs))
}

fn num_unary(args: &[Value], op: impl Fn(f64) -> f64) -> Result<Value, Throw> {
    Ok(Value::Num(op(receiver_num(args))))
}

fn num_bitwise(
    vm: &Interpreter,
    args: &[Value],
    op: impl Fn(u32, u32) -> u32,
) -> Result<Value, Throw> {
    let rhs = num_arg(vm, args, 1, "Right operand")?;
    Ok(Value::Num(op(receiver_num(args) as u32, rhs as u32) as f64))
}

fn new_range(vm: &Interpreter, args: &[Value], inclusive: bool) -> Result<Value, Throw> {
    let to = num_arg(vm, args, 1, "Right hand side of range")?;
    Ok(vm.alloc(Obj::Range(RangeObj {
        from: receiver_num(args),
        to,
        inclusive,
    })))
}

fn parse_num(text: &str) -> Option<f64> {
    let text = text.trim();
    if let Some(hex) = text.strip_prefix("0x") {
        return u64::from_str_radix(hex, 16).ok().map(|n| n as f64);
    }
    let plain = text
        .chars()
        .all(|c| c.is_ascii_digit() || matches!(c, '.' | '-' | '+' | 'e' | 'E'));
    if !plain {
        return None;
    }
    text.parse().ok()
}

fn define_num(heap: &mut Heap, core: &CoreClasses) {
    let num = core.num;
    method(heap, num, "+(_)", |vm, a| num_binary(vm, a, |x, y| Value::Num(x + y)));
    method(heap, num, "-(_)", |vm, a| num_binary(vm, a, |x, y| Value::Num(x - y)));
    method(heap, num, "*(_)", |vm, a| num_binary(vm, a, |x, y| Value::Num(x * y)));
    method(heap, num, "/(_)", |vm, a| num_binary(vm, a, |x, y| Value::Num(x / y)));
    method(heap, num, "%(_)", |vm, a| num_binary(vm, a, |x, y| Value::Num(x % y)));
    method(heap, num, "<(_)", |vm, a| num_binary(vm, a, |x, y| Value::Bool(x < y)));
    method(heap, num, ">(_)", |vm, a| num_binary(vm, a, |x, y| Value::Bool(x > y)));
    method(heap, num, "<=(_)", |vm, a| num_binary(vm, a, |x, y| Value::Bool(x <= y)));
    method(heap, num, ">=(_)", |vm, a| num_binary(vm, a, |x, y| Value::Bool(x >= y)));
    method(heap, num, "&(_)", |vm, a| num_bitwise(vm, a, |x, y| x & y));
    method(heap, num, "|(_)", |vm, a| num_bitwise(vm, a, |x, y| x | y));
    method(heap, num, "^(_)", |vm, a| num_bitwise(vm, a, |x, y| x ^ y));
    method(heap, num, "<<(_)", |vm, a| num_bitwise(vm, a, |x, y| x.wrapping_shl(y)));
    method(heap, num, ">>(_)", |vm, a| num_bitwise(vm, a, |x, y| x.wrapping_shr(y)));
    method(heap, num, "..(_)", |vm, a| new_range(vm, a, true));
    method(heap, num, "...(_)", |vm, a| new_range(vm, a, false));
    method(heap, num, "-", |_, a| num_unary(a, |x| -x));
    method(heap, num, "~", |_, a| Ok(Value::Num(!(receiver_num(a) as u32) as f64)));

    method(heap, num, "abs", |_, a| num_unary(a, f64::abs));
    method(heap, num, "ceil", |_, a| num_unary(a, f64::ceil));
    method(heap, num, "floor", |_, a| num_unary(a, f64::floor));
    method(heap, num, "round", |_, a| num_unary(a, f64::round));
    method(heap, num, "truncate", |_, a| num_unary(a, f64::trunc));
    method(heap, num, "fraction", |_, a| num_unary(a, f64::fract));
    method(heap, num, "sqrt", |_, a| num_unary(a, f64::sqrt));
    method(heap, num, "sin", |_, a| num_unary(a, f64::sin));
    method(heap, num, "cos", |_, a| num_unary(a, f64::cos));
    method(heap, num, "tan", |_, a| num_unary(a, f64::tan));
    method(heap, num, "log", |_, a| num_unary(a, f64::ln));
    method(heap, num, "exp", |_, a| num_unary(a, f64::exp));
    method(heap, num, "sign", |_, a| {
        num_unary(a, |x| if x > 0.0 { 1.0 } else if x < 0.0 { -1.0 } else { 0.0 })
    });
    method(heap, num, "pow(_)", |vm, a| num_binary(vm, a, |x, y| Value::Num(x.powf(y))));
    method(heap, num, "min(_)", |vm, a| num_binary(vm, a, |x, y| Value::Num(x.min(y))));
    method(heap, num, "max(_)", |vm, a| num_binary(vm, a, |x, y| Value::Num(x.max(y))));
    method(heap, num, "clamp(_,_)", |vm, a| {
        let min = num_arg(vm, a, 1, "Min value")?;
        let max = num_arg(vm, a, 2, "Max value")?;
        Ok(Value::Num(receiver_num(a).max(min).min(max)))
    });
    method(heap, num, "isInteger", |_, a| {
        let n = receiver_num(a);
        Ok(Value::Bool(n.is_finite() && n.fract() == 0.0))
    });
    method(heap, num, "isNan", |_, a| Ok(Value::Bool(receiver_num(a).is_nan())));
    method(heap, num, "isInfinity", |_, a| Ok(Value::Bool(receiver_num(a).is_infinite())));
    method(heap, num, "toString", |vm, a| Ok(text(vm, format_num(receiver_num(a)))));

    static_method(heap, num, "fromString(_)", |vm, a| {
        let source = string_arg(vm, a, 1, "Argument")?;
        let parsed = parse_num(&String::from_utf8_lossy(&source));
        Ok(parsed.map_or(Value::Null, Value::Num))
    });
    static_method(heap, num, "pi", |_, _| Ok(Value::Num(std::f64::consts::PI)));
    static_method(heap, num, "infinity", |_, _| Ok(Value::Num(f64::INFINITY)));
    static_method(heap, num, "nan", |_, _| Ok(Value::Num(f64::NAN)));
    static_method(heap, num, "largest", |_, _| Ok(Value::Num(f64::MAX)));
    static_method(heap, num, "smallest", |_, _| Ok(Value::Num(f64::MIN_POSITIVE)));
}

// ============================================================================
// String
// ============================================================================

fn receiver_string(vm: &Interpreter, args: &[Value]) -> Result<Vec<u8>, Throw> {
    vm.string_bytes(args[0])
        .ok_or_else(|| vm.error("Expected a string."))
}

fn nth_char(bytes: &[u8], index: usize) -> Option<String> {
    String::from_utf8_lossy(bytes)
        .chars()
        .nth(index)
        .map(|c| c.to_string())
}

fn define_string(heap: &mut Heap, core: &CoreClasses) {
    let string = core.string;
    method(heap, string, "+(_)", |vm, a| {
        let mut lhs = receiver_string(vm, a)?;
        lhs.extend(string_arg(vm, a, 1, "Right operand")?);
        Ok(vm.new_string(lhs))
    });
    method(heap, string, "*(_)", |vm, a| {
        let count = int_arg(vm, a, 1, "Count")?;
        if count < 0 {
            return Err(vm.error("Count must be a non-negative integer."));
        }
        let repeated = receiver_string(vm, a)?.repeat(count as usize);
        Ok(vm.new_string(repeated))
    });
    method(heap, string, "count", |vm, a| {
        let bytes = receiver_string(vm, a)?;
        Ok(Value::Num(String::from_utf8_lossy(&bytes).chars().count() as f64))
    });
    method(heap, string, "byteCount", |vm, a| {
        Ok(Value::Num(receiver_string(vm, a)?.len() as f64))
    });
    method(heap, string, "isEmpty", |vm, a| {
        Ok(Value::Bool(receiver_string(vm, a)?.is_empty()))
    });
    method(heap, string, "contains(_)", |vm, a| {
        let needle = string_arg(vm, a, 1, "Argument")?;
        Ok(Value::Bool(find_bytes(&receiver_string(vm, a)?, &needle).is_some()))
    });
    method(heap, string, "startsWith(_)", |vm, a| {
        let prefix = string_arg(vm, a, 1, "Argument")?;
        Ok(Value::Bool(receiver_string(vm, a)?.starts_with(&prefix)))
    });
    method(heap, string, "endsWith(_)", |vm, a| {
        let suffix = string_arg(vm, a, 1, "Argument")?;
        Ok(Value::Bool(receiver_string(vm, a)?.ends_with(&suffix)))
    });
    method(heap, string, "indexOf(_)", |vm, a| {
        let needle = string_arg(vm, a, 1, "Argument")?;
        let index = find_bytes(&receiver_string(vm, a)?, &needle);
        Ok(Value::Num(index.map_or(-1.0, |i| i as f64)))
    });
    method(heap, string, "[_]", |vm, a| {
        let bytes = receiver_string(vm, a)?;
        let count = String::from_utf8_lossy(&bytes).chars().count();
        let index = subscript(vm, a, 1, count)?;
        Ok(text(vm, nth_char(&bytes, index).unwrap_or_default()))
    });
    method(heap, string, "trim()", |vm, a| {
        let bytes = receiver_string(vm, a)?;
        Ok(text(vm, String::from_utf8_lossy(&bytes).trim()))
    });
    method(heap, string, "split(_)", |vm, a| {
        let separator = string_arg(vm, a, 1, "Separator")?;
        if separator.is_empty() {
            return Err(vm.error("Separator cannot be empty."));
        }
        let bytes = receiver_string(vm, a)?;
        let mut parts = Vec::new();
        let mut rest = bytes.as_slice();
        while let Some(index) = find_bytes(rest, &separator) {
            parts.push(vm.new_string(rest[..index].to_vec()));
            rest = &rest[index + separator.len()..];
        }
        parts.push(vm.new_string(rest.to_vec()));
        Ok(vm.alloc(Obj::List(parts)))
    });
    method(heap, string, "toString", |_, a| Ok(a[0]));
    method(heap, string, "iterate(_)", |vm, a| {
        let bytes = receiver_string(vm, a)?;
        let count = String::from_utf8_lossy(&bytes).chars().count() as f64;
        let next = match a[1] {
            Value::Null => 0.0,
            _ => num_arg(vm, a, 1, "Iterator")? + 1.0,
        };
        Ok(if next < count { Value::Num(next) } else { Value::Bool(false) })
    });
    method(heap, string, "iteratorValue(_)", |vm, a| {
        let bytes = receiver_string(vm, a)?;
        let index = int_arg(vm, a, 1, "Iterator")?;
        let c = nth_char(&bytes, index.max(0) as usize)
            .ok_or_else(|| vm.error("Iterator out of bounds."))?;
        Ok(text(vm, c))
    });
}

// ============================================================================
// List
// ============================================================================

fn join(vm: &Interpreter, list: Value, separator: &[u8]) -> Result<Vec<u8>, Throw> {
    let mut out = Vec::new();
    for (i, item) in list_items(vm, list)?.into_iter().enumerate() {
        if i > 0 {
            out.extend_from_slice(separator);
        }
        out.extend(vm.stringify(item)?);
    }
    Ok(out)
}

fn define_list(heap: &mut Heap, core: &CoreClasses) {
    let list = core.list;
    static_method(heap, list, "new()", |vm, _| Ok(vm.alloc(Obj::List(Vec::new()))));
    static_method(heap, list, "filled(_,_)", |vm, a| {
        let size = int_arg(vm, a, 1, "Size")?;
        if size < 0 {
            return Err(vm.error("Size cannot be negative."));
        }
        Ok(vm.alloc(Obj::List(vec![a[2]; size as usize])))
    });

    method(heap, list, "add(_)", |vm, a| {
        with_list(vm, a[0], |items| items.push(a[1]))?;
        Ok(a[1])
    });
    method(heap, list, "addAll(_)", |vm, a| {
        let extra = list_items(vm, a[1])?;
        with_list(vm, a[0], |items| items.extend(extra))?;
        Ok(a[1])
    });
    method(heap, list, "insert(_,_)", |vm, a| {
        let index = int_arg(vm, a, 1, "Index")? as isize;
        let inserted = with_list(vm, a[0], |items| {
            let len = items.len() as isize;
            let position = if index < 0 { len + 1 + index } else { index };
            if (0..=len).contains(&position) {
                items.insert(position as usize, a[2]);
                true
            } else {
                false
            }
        })?;
        if !inserted {
            return Err(vm.error("Index out of bounds."));
        }
        Ok(a[2])
    });
    method(heap, list, "removeAt(_)", |vm, a| {
        let len = with_list(vm, a[0], |items| items.len())?;
        let index = subscript(vm, a, 1, len)?;
        with_list(vm, a[0], |items| items.remove(index))
    });
    method(heap, list, "remove(_)", |vm, a| {
        let items = list_items(vm, a[0])?;
        match items.iter().position(|item| vm.values_equal(*item, a[1])) {
            Some(index) => with_list(vm, a[0], |items| items.remove(index)),
            None => Ok(Value::Null),
        }
    });
    method(heap, list, "clear()", |vm, a| {
        with_list(vm, a[0], |items| items.clear())?;
        Ok(Value::Null)
    });
    method(heap, list, "count", |vm, a| {
        with_list(vm, a[0], |items| Value::Num(items.len() as f64))
    });
    method(heap, list, "isEmpty", |vm, a| {
        with_list(vm, a[0], |items| Value::Bool(items.is_empty()))
    });
    method(heap, list, "[_]", |vm, a| {
        let items = list_items(vm, a[0])?;
        let index = subscript(vm, a, 1, items.len())?;
        Ok(items[index])
    });
    method(heap, list, "[_]=(_)", |vm, a| {
        let len = with_list(vm, a[0], |items| items.len())?;
        let index = subscript(vm, a, 1, len)?;
        with_list(vm, a[0], |items| items[index] = a[2])?;
        Ok(a[2])
    });
    method(heap, list, "contains(_)", |vm, a| {
        let items = list_items(vm, a[0])?;
        Ok(Value::Bool(items.iter().any(|item| vm.values_equal(*item, a[1]))))
    });
    method(heap, list, "indexOf(_)", |vm, a| {
        let items = list_items(vm, a[0])?;
        let index = items.iter().position(|item| vm.values_equal(*item, a[1]));
        Ok(Value::Num(index.map_or(-1.0, |i| i as f64)))
    });
    method(heap, list, "iterate(_)", |vm, a| {
        let len = with_list(vm, a[0], |items| items.len())? as f64;
        let next = match a[1] {
            Value::Null => 0.0,
            _ => num_arg(vm, a, 1, "Iterator")? + 1.0,
        };
        Ok(if next < len { Value::Num(next) } else { Value::Bool(false) })
    });
    method(heap, list, "iteratorValue(_)", |vm, a| {
        let items = list_items(vm, a[0])?;
        let index = subscript(vm, a, 1, items.len())?;
        Ok(items[index])
    });
    method(heap, list, "+(_)", |vm, a| {
        let mut items = list_items(vm, a[0])?;
        items.extend(list_items(vm, a[1])?);
        Ok(vm.alloc(Obj::List(items)))
    });
    method(heap, list, "join()", |vm, a| {
        let joined = join(vm, a[0], b"")?;
        Ok(vm.new_string(joined))
    });
    method(heap, list, "join(_)", |vm, a| {
        let separator = string_arg(vm, a, 1, "Separator")?;
        let joined = join(vm, a[0], &separator)?;
        Ok(vm.new_string(joined))
    });
    method(heap, list, "toString", |vm, a| {
        let mut out = b"[".to_vec();
        out.extend(join(vm, a[0], b", ")?);
        out.push(b']');
        Ok(vm.new_string(out))
    });
}

// ============================================================================
// Map
// ============================================================================

fn define_map(heap: &mut Heap, core: &CoreClasses) {
    let map = core.map;
    static_method(heap, map, "new()", |vm, _| Ok(vm.alloc(Obj::Map(MapObj::default()))));

    method(heap, map, "[_]", |vm, a| {
        let key = vm.map_key(a[1])?;
        with_map(vm, a[0], |map| map.get(&key).map_or(Value::Null, |(_, v)| *v))
    });
    method(heap, map, "[_]=(_)", |vm, a| {
        let key = vm.map_key(a[1])?;
        with_map(vm, a[0], |map| map.insert(key, (a[1], a[2])))?;
        Ok(a[2])
    });
    method(heap, map, "containsKey(_)", |vm, a| {
        let key = vm.map_key(a[1])?;
        with_map(vm, a[0], |map| Value::Bool(map.contains_key(&key)))
    });
    method(heap, map, "remove(_)", |vm, a| {
        let key = vm.map_key(a[1])?;
        with_map(vm, a[0], |map| map.remove(&key).map_or(Value::Null, |(_, v)| v))
    });
    method(heap, map, "clear()", |vm, a| {
        with_map(vm, a[0], |map| map.clear())?;
        Ok(Value::Null)
    });
    method(heap, map, "count", |vm, a| {
        with_map(vm, a[0], |map| Value::Num(map.len() as f64))
    });
    method(heap, map, "isEmpty", |vm, a| {
        with_map(vm, a[0], |map| Value::Bool(map.is_empty()))
    });
    method(heap, map, "keys", |vm, a| {
        let keys: Vec<Value> = with_map(vm, a[0], |map| map.values().map(|(k, _)| *k).collect())?;
        Ok(vm.alloc(Obj::List(keys)))
    });
    method(heap, map, "values", |vm, a| {
        let values: Vec<Value> = with_map(vm, a[0], |map| map.values().map(|(_, v)| *v).collect())?;
        Ok(vm.alloc(Obj::List(values)))
    });
    method(heap, map, "toString", |vm, a| {
        let entries: Vec<(Value, Value)> =
            with_map(vm, a[0], |map| map.values().copied().collect())?;
        let mut out = b"{".to_vec();
        for (i, (key, value)) in entries.into_iter().enumerate() {
            if i > 0 {
                out.extend_from_slice(b", ");
            }
            out.extend(vm.stringify(key)?);
            out.extend_from_slice(b": ");
            out.extend(vm.stringify(value)?);
        }
        out.push(b'}');
        Ok(vm.new_string(out))
    });
}

// ============================================================================
// Range
// ============================================================================

fn range_next(range: RangeObj, iterator: Value) -> Value {
    let ascending = range.from <= range.to;
    let next = match iterator {
        Value::Num(current) if ascending => current + 1.0,
        Value::Num(current) => current - 1.0,
        _ => range.from,
    };
    let in_range = match (ascending, range.inclusive) {
        (true, true) => next <= range.to,
        (true, false) => next < range.to,
        (false, true) => next >= range.to,
        (false, false) => next > range.to,
    };
    if in_range {
        Value::Num(next)
    } else {
        Value::Bool(false)
    }
}

fn define_range(heap: &mut Heap, core: &CoreClasses) {
    let range = core.range;
    method(heap, range, "from", |vm, a| Ok(Value::Num(range_of(vm, a[0])?.from)));
    method(heap, range, "to", |vm, a| Ok(Value::Num(range_of(vm, a[0])?.to)));
    method(heap, range, "min", |vm, a| {
        let r = range_of(vm, a[0])?;
        Ok(Value::Num(r.from.min(r.to)))
    });
    method(heap, range, "max", |vm, a| {
        let r = range_of(vm, a[0])?;
        Ok(Value::Num(r.from.max(r.to)))
    });
    method(heap, range, "isInclusive", |vm, a| {
        Ok(Value::Bool(range_of(vm, a[0])?.inclusive))
    });
    method(heap, range, "iterate(_)", |vm, a| Ok(range_next(range_of(vm, a[0])?, a[1])));
    method(heap, range, "iteratorValue(_)", |_, a| Ok(a[1]));
    method(heap, range, "toString", |vm, a| {
        let r = range_of(vm, a[0])?;
        let op = if r.inclusive { ".." } else { "..." };
        Ok(text(vm, format!("{}{}{}", format_num(r.from), op, format_num(r.to))))
    });
}

// ============================================================================
// Fn and Fiber
// ============================================================================

/// `call()` through `call(_,...)` with sixteen arguments.
const MAX_FN_ARGS: usize = 16;

fn fn_arity(vm: &Interpreter, value: Value) -> Option<usize> {
    let id = value.as_obj()?;
    match &vm.heap.borrow()[id] {
        Obj::Fn(function) => Some(function.decl.params.len()),
        _ => None,
    }
}

fn define_fn(heap: &mut Heap, core: &CoreClasses) {
    static_method(heap, core.fn_, "new(_)", |vm, a| {
        fn_arity(vm, a[1]).ok_or_else(|| vm.error("Argument must be a function."))?;
        Ok(a[1])
    });
    method(heap, core.fn_, "arity", |vm, a| {
        Ok(Value::Num(fn_arity(vm, a[0]).unwrap_or(0) as f64))
    });
    for arity in 0..=MAX_FN_ARGS {
        let signature = crate::ast::call_signature("call", arity);
        method(heap, core.fn_, &signature, |vm, a| vm.call_fn(a[0], &a[1..]));
    }
}

fn fiber_error(vm: &Interpreter, fiber: Value) -> Option<(FiberState, Value)> {
    let id = fiber.as_obj()?;
    match &vm.heap.borrow()[id] {
        Obj::Fiber(fiber) => Some((fiber.state, fiber.error)),
        _ => None,
    }
}

fn fiber_id(vm: &Interpreter, value: Value) -> Result<ObjId, Throw> {
    value
        .as_obj()
        .filter(|_| fiber_error(vm, value).is_some())
        .ok_or_else(|| vm.error("Receiver must be a fiber."))
}

fn define_fiber(heap: &mut Heap, core: &CoreClasses) {
    let fiber = core.fiber;
    static_method(heap, fiber, "new(_)", |vm, a| {
        let arity = fn_arity(vm, a[1]).ok_or_else(|| vm.error("Argument must be a function."))?;
        if arity > 1 {
            return Err(vm.error("Function cannot take more than one parameter."));
        }
        let func = a[1].as_obj().ok_or_else(|| vm.error("Argument must be a function."))?;
        Ok(vm.alloc(Obj::Fiber(FiberObj {
            func,
            state: FiberState::New,
            error: Value::Null,
        })))
    });
    static_method(heap, fiber, "abort(_)", |vm, a| match a[1] {
        Value::Null => Ok(Value::Null),
        error => Err(vm.throw(error)),
    });
    static_method(heap, fiber, "yield()", |vm, _| Err(vm.error("Fiber.yield is not supported.")));
    static_method(heap, fiber, "yield(_)", |vm, _| Err(vm.error("Fiber.yield is not supported.")));

    method(heap, fiber, "call()", |vm, a| vm.run_fiber(fiber_id(vm, a[0])?, &[], false));
    method(heap, fiber, "call(_)", |vm, a| vm.run_fiber(fiber_id(vm, a[0])?, &a[1..2], false));
    method(heap, fiber, "try()", |vm, a| vm.run_fiber(fiber_id(vm, a[0])?, &[], true));
    method(heap, fiber, "try(_)", |vm, a| vm.run_fiber(fiber_id(vm, a[0])?, &a[1..2], true));
    method(heap, fiber, "error", |vm, a| {
        Ok(fiber_error(vm, a[0]).map_or(Value::Null, |(_, error)| error))
    });
    method(heap, fiber, "isDone", |vm, a| {
        let state = fiber_error(vm, a[0]).map(|(state, _)| state);
        Ok(Value::Bool(state == Some(FiberState::Done)))
    });
}

// ============================================================================
// System
// ============================================================================

fn define_system(heap: &mut Heap, core: &CoreClasses) {
    let system = core.system;
    static_method(heap, system, "print()", |vm, _| {
        vm.write(b"\n");
        Ok(Value::Null)
    });
    static_method(heap, system, "print(_)", |vm, a| {
        let text = vm.stringify(a[1])?;
        vm.write(&text);
        vm.write(b"\n");
        Ok(a[1])
    });
    static_method(heap, system, "printAll(_)", |vm, a| {
        let text = join(vm, a[1], b"")?;
        vm.write(&text);
        vm.write(b"\n");
        Ok(Value::Null)
    });
    static_method(heap, system, "write(_)", |vm, a| {
        let text = vm.stringify(a[1])?;
        vm.write(&text);
        Ok(a[1])
    });
    static_method(heap, system, "writeAll(_)", |vm, a| {
        let text = join(vm, a[1], b"")?;
        vm.write(&text);
        Ok(Value::Null)
    });
    static_method(heap, system, "gc()", |vm, _| {
        vm.request_collection();
        Ok(Value::Null)
    });
    static_method(heap, system, "clock", |_, _| {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs_f64())
            .unwrap_or(0.0);
        Ok(Value::Num(now))
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_num() {
        assert_eq!(format_num(8.0), "8");
        assert_eq!(format_num(-2.5), "-2.5");
        assert_eq!(format_num(0.1 + 0.2), "0.3");
        assert_eq!(format_num(1e20), "1e+20");
        assert_eq!(format_num(0.00001), "1e-05");
        assert_eq!(format_num(f64::NAN), "nan");
        assert_eq!(format_num(f64::NEG_INFINITY), "-infinity");
        assert_eq!(format_num(123456.789), "123456.789");
    }

    #[test]
    fn test_parse_num() {
        assert_eq!(parse_num(" 42 "), Some(42.0));
        assert_eq!(parse_num("0xff"), Some(255.0));
        assert_eq!(parse_num("-1.5e2"), Some(-150.0));
        assert_eq!(parse_num("nan"), None);
        assert_eq!(parse_num("twelve"), None);
    }

    #[test]
    fn test_range_iteration_bounds() {
        let inclusive = RangeObj { from: 1.0, to: 3.0, inclusive: true };
        assert_eq!(range_next(inclusive, Value::Null), Value::Num(1.0));
        assert_eq!(range_next(inclusive, Value::Num(3.0)), Value::Bool(false));

        let descending = RangeObj { from: 3.0, to: 1.0, inclusive: false };
        assert_eq!(range_next(descending, Value::Num(3.0)), Value::Num(2.0));
        assert_eq!(range_next(descending, Value::Num(2.0)), Value::Bool(false));

        let empty = RangeObj { from: 0.0, to: 0.0, inclusive: false };
        assert_eq!(range_next(empty, Value::Null), Value::Bool(false));
    }

    #[test]
    fn test_sealed_core_classes() {
        let mut heap = Heap::new(Default::default());
        let (core, globals) = bootstrap(&mut heap);
        assert!(!core.is_sealed(core.object));
        assert!(core.is_sealed(core.list));
        assert_eq!(globals.len(), 12);
    }
}
