// File: src/value.rs
//
// Runtime value types for the Ruff bytecode VM.
// `Value` is the tagged union every stack slot, constant, and upvalue cell
// holds; heap payloads live behind an `ObjRef` handle into the memory
// manager's arena rather than an owned pointer, so `Value` itself stays
// `Copy` even though the data it can reference is shared and GC-managed.

use crate::chunk::Chunk;
use std::fmt;

/// Index into the memory manager's object arena. Stable for the lifetime of
/// the object it names; recycled by the allocator once that object is
/// swept, so a handle must never be dereferenced after the GC has run
/// unless it was kept reachable from a root.
pub type ObjRef = usize;

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Value {
    Nihl,
    Bool(bool),
    Number(f64),
    Obj(ObjRef),
}

impl Value {
    /// `Nihl` and `false` are falsy; everything else (0, "", empty
    /// containers) is truthy.
    pub fn is_truthy(&self) -> bool {
        !matches!(self, Value::Nihl | Value::Bool(false))
    }

    pub fn is_number(&self) -> bool {
        matches!(self, Value::Number(_))
    }

    pub fn as_number(&self) -> Option<f64> {
        match self {
            Value::Number(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_obj(&self) -> Option<ObjRef> {
        match self {
            Value::Obj(r) => Some(*r),
            _ => None,
        }
    }

    pub fn type_name(&self, heap: &crate::memory::Heap) -> &'static str {
        match self {
            Value::Nihl => "nihl",
            Value::Bool(_) => "bool",
            Value::Number(_) => "number",
            Value::Obj(r) => match heap.kind(*r) {
                Obj::String(_) => "string",
                Obj::Function(_) => "function",
                Obj::Closure(_) => "closure",
                Obj::Upvalue(_) => "upvalue",
                Obj::Native(_) => "native",
                Obj::Array(_) => "array",
                Obj::Dict(_) => "dict",
                Obj::Error(_) => "error",
            },
        }
    }
}

/// Heap object payloads. Every variant here is reachable only through an
/// `ObjRef`; the arena slot that owns it also carries the GC mark bit and a
/// precomputed hash (see `memory::ObjHeader`).
pub enum Obj {
    String(String),
    Function(FunctionObj),
    Closure(ClosureObj),
    Upvalue(UpvalueObj),
    Native(NativeObj),
    Array(Vec<Value>),
    Dict(crate::hashmap::ValueMap),
    Error(String),
}

pub struct FunctionObj {
    pub arity: u8,
    pub upvalue_count: u16,
    pub chunk: Chunk,
    /// Interned name, `None` for the implicit top-level script function.
    pub name: Option<ObjRef>,
}

impl FunctionObj {
    pub fn new(name: Option<ObjRef>, arity: u8) -> Self {
        FunctionObj {
            arity,
            upvalue_count: 0,
            chunk: Chunk::new(),
            name,
        }
    }
}

pub struct ClosureObj {
    pub function: ObjRef,
    pub upvalues: Vec<ObjRef>,
}

#[derive(Debug, Clone, Copy)]
pub enum UpvalueState {
    /// Still resident on the VM stack at this absolute index.
    Open(usize),
    Closed(Value),
}

pub struct UpvalueObj {
    pub state: UpvalueState,
}

pub type NativeFn = fn(&mut crate::vm::Vm, &[Value]) -> Value;

pub struct NativeObj {
    pub name: String,
    pub arity: u8,
    pub function: NativeFn,
}

/// Renders a value for `print` / REPL echo / error messages. Requires the
/// heap to resolve object payloads; strings print unquoted at top level but
/// quoted when nested inside an array/dict rendering, matching how most
/// scripting-language REPLs distinguish a bare string result from one
/// embedded in a structure.
pub fn display_value(heap: &crate::memory::Heap, value: Value, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    display_value_inner(heap, value, f, false)
}

fn display_value_inner(
    heap: &crate::memory::Heap,
    value: Value,
    f: &mut fmt::Formatter<'_>,
    nested: bool,
) -> fmt::Result {
    match value {
        Value::Nihl => write!(f, "nihl"),
        Value::Bool(b) => write!(f, "{}", b),
        Value::Number(n) => write!(f, "{}", format_number(n)),
        Value::Obj(r) => match heap.kind(r) {
            Obj::String(s) => {
                if nested {
                    write!(f, "\"{}\"", s)
                } else {
                    write!(f, "{}", s)
                }
            }
            Obj::Function(func) => match func.name {
                Some(name_ref) => write!(f, "<fn {}>", heap.as_string(name_ref)),
                None => write!(f, "<script>"),
            },
            Obj::Closure(closure) => match heap.kind(closure.function) {
                Obj::Function(func) => match func.name {
                    Some(name_ref) => write!(f, "<closure {}>", heap.as_string(name_ref)),
                    None => write!(f, "<closure script>"),
                },
                _ => write!(f, "<closure>"),
            },
            Obj::Upvalue(_) => write!(f, "<upvalue>"),
            Obj::Native(native) => write!(f, "<native {}>", native.name),
            Obj::Array(items) => {
                write!(f, "[")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    display_value_inner(heap, *item, f, true)?;
                }
                write!(f, "]")
            }
            Obj::Dict(map) => {
                write!(f, "{{")?;
                for (i, (k, v)) in map.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    display_value_inner(heap, k, f, true)?;
                    write!(f, ": ")?;
                    display_value_inner(heap, v, f, true)?;
                }
                write!(f, "}}")
            }
            Obj::Error(msg) => write!(f, "<error {}>", msg),
        },
    }
}

/// Minimal-digits number formatting (closest idiomatic Rust equivalent to
/// the reference implementation's `%g`): integral doubles print without a
/// trailing `.0`.
fn format_number(n: f64) -> String {
    if n.is_finite() && n.fract() == 0.0 && n.abs() < 1e15 {
        format!("{}", n as i64)
    } else {
        format!("{}", n)
    }
}
