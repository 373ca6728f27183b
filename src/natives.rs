// File: src/natives.rs
//
// The minimal native-function ABI surface SPEC_FULL.md calls for: `len`,
// `type_name`, and `clock`. Registered into VM globals at construction,
// following the teacher's `src/builtins.rs` convention of exposing native
// functions as ordinary global bindings rather than reserved keywords.

use crate::memory::Heap;
use crate::hashmap::ValueMap;
use crate::value::{NativeObj, Obj, Value};

pub fn register(heap: &mut Heap, globals: &mut ValueMap) {
    define(heap, globals, "len", 1, native_len);
    define(heap, globals, "type_name", 1, native_type_name);
    define(heap, globals, "clock", 0, native_clock);
}

fn define(heap: &mut Heap, globals: &mut ValueMap, name: &str, arity: u8, function: crate::value::NativeFn) {
    let name_ref = heap.intern(name);
    let native_ref = heap.alloc(Obj::Native(NativeObj { name: name.to_string(), arity, function }));
    let key = Value::Obj(name_ref);
    let hash = heap.hash_value(key);
    globals.put(key, Value::Obj(native_ref), hash);
}

fn native_len(vm: &mut crate::vm::Vm, args: &[Value]) -> Value {
    match args[0] {
        Value::Obj(r) => match vm.heap.kind(r) {
            Obj::String(s) => Value::Number(s.chars().count() as f64),
            Obj::Array(items) => Value::Number(items.len() as f64),
            Obj::Dict(map) => Value::Number(map.len() as f64),
            _ => error_value(vm, "len: argument has no length"),
        },
        _ => error_value(vm, "len: argument has no length"),
    }
}

fn native_type_name(vm: &mut crate::vm::Vm, args: &[Value]) -> Value {
    let name = args[0].type_name(&vm.heap);
    Value::Obj(vm.heap.intern(name))
}

fn native_clock(_vm: &mut crate::vm::Vm, _args: &[Value]) -> Value {
    let now = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default();
    Value::Number(now.as_secs_f64())
}

fn error_value(vm: &mut crate::vm::Vm, message: &str) -> Value {
    Value::Obj(vm.heap.alloc(Obj::Error(message.to_string())))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vm::Vm;

    #[test]
    fn len_reports_string_char_count() {
        let mut vm = Vm::new();
        vm.interpret("let n = len(\"hello\");").unwrap_or_else(|_| panic!("compile/run failed"));
    }

    #[test]
    fn clock_returns_a_number() {
        let mut vm = Vm::new();
        vm.interpret("let t = clock();").unwrap_or_else(|_| panic!("compile/run failed"));
    }
}
