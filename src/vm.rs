// File: src/vm.rs
//
// Stack-based virtual machine. Dispatches the byte-level instruction stream
// produced by `compiler.rs`, maintains the operand stack and call frames,
// and drives the memory manager's garbage collector by supplying it with
// roots (the stack, globals, the closures of live frames, and open
// upvalues) since `memory::Heap` has no notion of "the running program" on
// its own. Grounded on the reference implementation's `vm.c` for dispatch
// structure, call protocol, and exact runtime error message text; the
// `CallFrame`/`Vm` naming follows the teacher's `src/vm.rs`.

use crate::chunk::op;
use crate::hashmap::ValueMap;
use crate::memory::{Heap, Roots};
use crate::value::{ClosureObj, FunctionObj, Obj, ObjRef, UpvalueObj, UpvalueState, Value};

const MAX_FRAMES: usize = 256;

#[derive(Debug)]
pub struct RuntimeError {
    pub line: u32,
    pub message: String,
}

impl std::fmt::Display for RuntimeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "runtime error [line {}] in program: {}", self.line, self.message)
    }
}

impl std::error::Error for RuntimeError {}

struct CallFrame {
    closure: ObjRef,
    ip: usize,
    /// Index into the VM stack where this frame's slot 0 (the closure
    /// itself) lives; locals are addressed relative to this.
    stack_base: usize,
}

pub struct Vm {
    stack: Vec<Value>,
    frames: Vec<CallFrame>,
    globals: ValueMap,
    /// Open upvalues, sorted by descending stack index so closing the top
    /// of the stack only ever has to look at a prefix of this list —
    /// mirrors the reference implementation's `openUpvalues` linked list.
    open_upvalues: Vec<ObjRef>,
    pub heap: Heap,
    /// Gates the `RUFF_DEBUG_TRACE` disassembly trace; read once at
    /// construction, ambient debug tooling only (see SPEC_FULL.md's Chunk
    /// module note).
    trace: bool,
}

impl Vm {
    pub fn new() -> Self {
        let mut heap = Heap::new();
        let mut globals = ValueMap::new();
        crate::natives::register(&mut heap, &mut globals);
        Vm {
            stack: Vec::with_capacity(256),
            frames: Vec::new(),
            globals,
            open_upvalues: Vec::new(),
            heap,
            trace: std::env::var("RUFF_DEBUG_TRACE").is_ok(),
        }
    }

    /// Compiles and runs `source` as a fresh top-level script.
    pub fn interpret(&mut self, source: &str) -> Result<(), InterpretError> {
        let function = crate::compiler::Compiler::new(source, &mut self.heap)
            .compile()
            .map_err(InterpretError::Compile)?;
        self.run_function(function)
    }

    /// Runs one REPL line against the persistent VM state, returning the
    /// value of a bare trailing expression if the line was one (so the REPL
    /// can echo it) rather than an expression *statement* ending in `;`.
    pub fn interpret_repl_line(&mut self, source: &str) -> Result<Option<Value>, InterpretError> {
        let trimmed = source.trim().trim_end_matches(';');
        let wrapped = format!("let __repl_result = ({});", trimmed);
        // Try compiling as a bare expression first so the REPL can echo its
        // value; fall back to compiling verbatim for statements/declarations
        // that aren't valid expressions on their own.
        if let Ok(function) = crate::compiler::Compiler::new(&wrapped, &mut self.heap).compile() {
            self.run_function(function)?;
            let name = Value::Obj(self.heap.intern("__repl_result"));
            let hash = self.heap.hash_value(name);
            return Ok(self.globals.get(name, hash));
        }
        self.interpret(source)?;
        Ok(None)
    }

    /// Allocates the implicit top-level closure for `function` and runs it
    /// to completion, rooting each intermediate allocation before the next
    /// one (see the memory manager's root-safety discipline).
    fn run_function(&mut self, function: FunctionObj) -> Result<(), InterpretError> {
        let function_ref = self.heap.alloc(Obj::Function(function));
        self.push(Value::Obj(function_ref));
        let closure_ref = self.heap.alloc(Obj::Closure(ClosureObj { function: function_ref, upvalues: Vec::new() }));
        self.pop();
        self.push(Value::Obj(closure_ref));
        if let Err(e) = self.call_value(Value::Obj(closure_ref), 0) {
            self.reset_after_runtime_error();
            return Err(InterpretError::Runtime(e));
        }
        if let Err(e) = self.run() {
            self.reset_after_runtime_error();
            return Err(InterpretError::Runtime(e));
        }
        Ok(())
    }

    // ---- stack helpers ----------------------------------------------------

    fn push(&mut self, value: Value) {
        self.stack.push(value);
    }

    fn pop(&mut self) -> Value {
        self.stack.pop().expect("stack underflow")
    }

    fn peek(&self, distance: usize) -> Value {
        self.stack[self.stack.len() - 1 - distance]
    }

    fn current_line(&self) -> u32 {
        let frame = self.frames.last().expect("no active frame");
        let function_ref = self.closure_function(frame.closure);
        match self.heap.kind(function_ref) {
            Obj::Function(f) => f.chunk.line_of(frame.ip.saturating_sub(1)),
            _ => 0,
        }
    }

    fn runtime_error(&self, message: impl Into<String>) -> RuntimeError {
        RuntimeError { line: self.current_line(), message: message.into() }
    }

    /// Per spec.md §7: a runtime error aborts the run and "leaves the stack
    /// reset" so the VM is clean and reusable — globals survive (they're
    /// the REPL's persistent session state), but any partially executed
    /// call's frames, operand stack, and open-upvalue bookkeeping do not.
    fn reset_after_runtime_error(&mut self) {
        self.stack.clear();
        self.frames.clear();
        self.open_upvalues.clear();
    }

    fn closure_function(&self, closure_ref: ObjRef) -> ObjRef {
        match self.heap.kind(closure_ref) {
            Obj::Closure(c) => c.function,
            _ => panic!("object {} is not a closure", closure_ref),
        }
    }

    // ---- garbage collection -------------------------------------------

    fn maybe_collect(&mut self, additional: usize) {
        if self.heap.should_collect(additional) {
            self.collect();
        }
    }

    fn collect(&mut self) {
        let frame_closures: Vec<ObjRef> = self.frames.iter().map(|f| f.closure).collect();
        let roots = Roots {
            stack: &self.stack,
            globals: &self.globals,
            frame_closures: &frame_closures,
            open_upvalues: &self.open_upvalues,
        };
        self.heap.mark_roots(roots);
        self.heap.finish_collection();
    }

    /// Allocates `kind`, first ensuring any reachable dependency is already
    /// rooted (callers must push dependent values before calling this — see
    /// `memory::Heap::alloc`'s doc comment on the root-safety discipline).
    fn alloc(&mut self, kind: Obj) -> ObjRef {
        self.maybe_collect(64);
        self.heap.alloc(kind)
    }

    // ---- calling ------------------------------------------------------

    fn call_value(&mut self, callee: Value, argc: u8) -> Result<(), RuntimeError> {
        if let Value::Obj(r) = callee {
            match self.heap.kind(r) {
                Obj::Closure(_) => return self.call_closure(r, argc),
                Obj::Native(native) => {
                    let function = native.function;
                    let arity = native.arity;
                    if argc != arity {
                        return Err(self.runtime_error(format!("expected {} arguments, got {}", arity, argc)));
                    }
                    let args_start = self.stack.len() - argc as usize;
                    let args: Vec<Value> = self.stack[args_start..].to_vec();
                    let result = function(self, &args);
                    self.stack.truncate(args_start - 1);
                    self.push(result);
                    return Ok(());
                }
                _ => {}
            }
        }
        Err(self.runtime_error("value is not callable"))
    }

    fn call_closure(&mut self, closure_ref: ObjRef, argc: u8) -> Result<(), RuntimeError> {
        let function_ref = self.closure_function(closure_ref);
        let arity = match self.heap.kind(function_ref) {
            Obj::Function(f) => f.arity,
            _ => unreachable!(),
        };
        if argc != arity {
            return Err(self.runtime_error(format!("expected {} arguments, got {}", arity, argc)));
        }
        if self.frames.len() >= MAX_FRAMES {
            return Err(self.runtime_error("stack overflow"));
        }
        let stack_base = self.stack.len() - argc as usize - 1;
        self.frames.push(CallFrame { closure: closure_ref, ip: 0, stack_base });
        Ok(())
    }

    // ---- upvalues -------------------------------------------------------

    /// Finds an existing open upvalue pointing at absolute stack index
    /// `index`, or creates one. Reusing an existing upvalue means two
    /// closures capturing the same local share one cell, as spec.md
    /// requires.
    fn capture_upvalue(&mut self, index: usize) -> ObjRef {
        for &existing in &self.open_upvalues {
            if let Obj::Upvalue(u) = self.heap.kind(existing) {
                if let UpvalueState::Open(i) = u.state {
                    if i == index {
                        return existing;
                    }
                }
            }
        }
        let r = self.alloc(Obj::Upvalue(UpvalueObj { state: UpvalueState::Open(index) }));
        self.open_upvalues.push(r);
        r
    }

    /// Closes every open upvalue at or above `from_index`, copying the
    /// stack value into the upvalue's own storage and detaching it from the
    /// VM's tracking list — run when a scope holding captured locals exits.
    fn close_upvalues(&mut self, from_index: usize) {
        let stack = &self.stack;
        let heap = &mut self.heap;
        self.open_upvalues.retain(|&r| {
            let index = match heap.kind(r) {
                Obj::Upvalue(u) => match u.state {
                    UpvalueState::Open(i) => i,
                    UpvalueState::Closed(_) => return false,
                },
                _ => unreachable!(),
            };
            if index < from_index {
                return true;
            }
            let value = stack[index];
            if let Obj::Upvalue(u) = heap.kind_mut(r) {
                u.state = UpvalueState::Closed(value);
            }
            false
        });
    }

    // ---- indexing -------------------------------------------------------

    fn index_get(&mut self, container: Value, key: Value) -> Result<Value, RuntimeError> {
        // The `Obj::String` case needs to intern a fresh one-character
        // string, which requires `&mut self.heap` — but the match below
        // scrutinizes `self.heap.kind(r)` immutably. `IndexOutcome` lets the
        // whole lookup finish (and drop that borrow) before any mutable
        // heap access happens.
        enum IndexOutcome {
            Value(Value),
            Char(char),
        }
        let outcome = match container {
            Value::Obj(r) => match self.heap.kind(r) {
                Obj::Array(items) => match key.as_number().map(|n| n as i64) {
                    Some(i) if i >= 0 && (i as usize) < items.len() => Ok(IndexOutcome::Value(items[i as usize])),
                    _ => Err(self.runtime_error("index out of bounds")),
                },
                Obj::Dict(map) => {
                    let hash = self.heap.hash_value(key);
                    match map.get(key, hash) {
                        Some(v) => Ok(IndexOutcome::Value(v)),
                        None => Err(self.runtime_error("undefined key")),
                    }
                }
                Obj::String(s) => {
                    let chars: Vec<char> = s.chars().collect();
                    match key.as_number().map(|n| n as i64) {
                        Some(i) if i >= 0 && (i as usize) < chars.len() => Ok(IndexOutcome::Char(chars[i as usize])),
                        _ => Err(self.runtime_error("index out of bounds")),
                    }
                }
                _ => Err(self.runtime_error("value is not indexable")),
            },
            _ => Err(self.runtime_error("value is not indexable")),
        }?;
        Ok(match outcome {
            IndexOutcome::Value(v) => v,
            IndexOutcome::Char(c) => Value::Obj(self.heap.intern_owned(c.to_string())),
        })
    }

    fn index_set(&mut self, container: Value, key: Value, value: Value) -> Result<(), RuntimeError> {
        // Precompute the line before taking a mutable borrow of `self.heap`
        // below, since `runtime_error` needs `&self` as a whole.
        let line = self.current_line();
        let oob = || RuntimeError { line, message: "index out of bounds".to_string() };
        let not_indexable = || RuntimeError { line, message: "value is not indexable".to_string() };
        match container {
            Value::Obj(r) => {
                let hash = self.heap.hash_value(key);
                match self.heap.kind_mut(r) {
                    Obj::Array(items) => match key.as_number().map(|n| n as i64) {
                        Some(i) if i >= 0 && (i as usize) < items.len() => {
                            items[i as usize] = value;
                            Ok(())
                        }
                        _ => Err(oob()),
                    },
                    Obj::Dict(map) => {
                        map.put(key, value, hash);
                        Ok(())
                    }
                    _ => Err(not_indexable()),
                }
            }
            _ => Err(not_indexable()),
        }
    }

    // ---- the dispatch loop ------------------------------------------------

    fn run(&mut self) -> Result<(), RuntimeError> {
        loop {
            if self.trace {
                self.trace_instruction();
            }
            let instruction = self.read_byte();
            match instruction {
                op::CONST => {
                    let v = self.read_constant(false);
                    self.push(v);
                }
                op::CONST_LONG => {
                    let v = self.read_constant(true);
                    self.push(v);
                }
                op::CONST_NIHL => self.push(Value::Nihl),
                op::CONST_TRUE => self.push(Value::Bool(true)),
                op::CONST_FALSE => self.push(Value::Bool(false)),
                op::POP => {
                    self.pop();
                }
                op::NEGATE => {
                    let v = self.peek(0);
                    match v.as_number() {
                        Some(n) => {
                            self.pop();
                            self.push(Value::Number(-n));
                        }
                        None => return Err(self.runtime_error("operand must be numbers")),
                    }
                }
                op::NOT => {
                    let v = self.pop();
                    self.push(Value::Bool(!v.is_truthy()));
                }
                op::ADD | op::SUB | op::MUL | op::LESS | op::LESS_EQUAL | op::GREATER | op::GREATER_EQUAL => {
                    self.binary_op(instruction)?;
                }
                op::DIV => {
                    let (a, b) = self.pop_two_numbers("operands must be numbers")?;
                    if b == 0.0 {
                        return Err(self.runtime_error("cannot divide by zero (/ 0)"));
                    }
                    self.push(Value::Number(a / b));
                }
                op::MOD => {
                    let (a, b) = self.pop_two_numbers("operands must be numbers")?;
                    if a.fract() != 0.0 || b.fract() != 0.0 {
                        return Err(self.runtime_error("only integer allowed when using %"));
                    }
                    if b == 0.0 {
                        return Err(self.runtime_error("cannot divide by 0 (% 0)"));
                    }
                    self.push(Value::Number((a as i64 % b as i64) as f64));
                }
                op::POW => {
                    let (a, b) = self.pop_two_numbers("operands must be numbers")?;
                    self.push(Value::Number(a.powf(b)));
                }
                op::EQUAL => {
                    let b = self.pop();
                    let a = self.pop();
                    self.push(Value::Bool(self.values_equal(a, b)));
                }
                op::NOT_EQUAL => {
                    let b = self.pop();
                    let a = self.pop();
                    self.push(Value::Bool(!self.values_equal(a, b)));
                }
                op::CONCAT => self.concat()?,
                op::XOR => {
                    let b = self.pop();
                    let a = self.pop();
                    self.push(Value::Bool(a.is_truthy() ^ b.is_truthy()));
                }
                op::GLOBAL_DECL => self.global_decl(false),
                op::GLOBAL_DECL_LONG => self.global_decl(true),
                op::GLOBAL_GET => self.global_get(false)?,
                op::GLOBAL_GET_LONG => self.global_get(true)?,
                op::GLOBAL_SET => self.global_set(false)?,
                op::GLOBAL_SET_LONG => self.global_set(true)?,
                op::LOCAL_GET => self.local_get(false),
                op::LOCAL_GET_LONG => self.local_get(true),
                op::LOCAL_SET => self.local_set(false),
                op::LOCAL_SET_LONG => self.local_set(true),
                op::UPVALUE_GET => self.upvalue_get(false),
                op::UPVALUE_GET_LONG => self.upvalue_get(true),
                op::UPVALUE_SET => self.upvalue_set(false),
                op::UPVALUE_SET_LONG => self.upvalue_set(true),
                op::CLOSE_UPVALUE => {
                    let top = self.stack.len() - 1;
                    self.close_upvalues(top);
                    self.pop();
                }
                op::JUMP_IF_FALSE => {
                    let offset = self.read_u16();
                    if !self.peek(0).is_truthy() {
                        self.frames.last_mut().unwrap().ip += offset as usize;
                    }
                }
                op::JUMP_IF_TRUE => {
                    let offset = self.read_u16();
                    if self.peek(0).is_truthy() {
                        self.frames.last_mut().unwrap().ip += offset as usize;
                    }
                }
                op::JUMP => {
                    let offset = self.read_u16();
                    self.frames.last_mut().unwrap().ip += offset as usize;
                }
                op::JUMP_BACK => {
                    let offset = self.read_u16();
                    self.frames.last_mut().unwrap().ip -= offset as usize;
                }
                op::CALL => {
                    let argc = self.read_byte();
                    let callee = self.peek(argc as usize);
                    self.call_value(callee, argc)?;
                }
                op::ARRAY => self.make_array(false),
                op::ARRAY_LONG => self.make_array(true),
                op::DICT => self.make_dict(false),
                op::DICT_LONG => self.make_dict(true),
                op::INDEXING_GET => {
                    let key = self.pop();
                    let container = self.pop();
                    let v = self.index_get(container, key)?;
                    self.push(v);
                }
                op::INDEXING_SET => {
                    let value = self.pop();
                    let key = self.pop();
                    let container = self.pop();
                    self.index_set(container, key, value)?;
                    self.push(value);
                }
                op::CLOSURE | op::CLOSURE_LONG => {
                    self.make_closure(instruction == op::CLOSURE_LONG);
                }
                op::PRINT => {
                    let v = self.pop();
                    println!("{}", DisplayValue(&self.heap, v));
                }
                op::RET => {
                    let result = self.pop();
                    let frame = self.frames.pop().unwrap();
                    self.close_upvalues(frame.stack_base);
                    if self.frames.is_empty() {
                        self.stack.truncate(frame.stack_base);
                        return Ok(());
                    }
                    self.stack.truncate(frame.stack_base);
                    self.push(result);
                }
                other => panic!("unknown opcode {}", other),
            }
        }
    }

    // ---- instruction decoding ----------------------------------------

    fn read_byte(&mut self) -> u8 {
        let frame = self.frames.last_mut().unwrap();
        let function_ref = self.heap.kind(frame.closure);
        let function_ref = match function_ref {
            Obj::Closure(c) => c.function,
            _ => unreachable!(),
        };
        let byte = match self.heap.kind(function_ref) {
            Obj::Function(f) => f.chunk.code[frame.ip],
            _ => unreachable!(),
        };
        self.frames.last_mut().unwrap().ip += 1;
        byte
    }

    fn read_u16(&mut self) -> u16 {
        let hi = self.read_byte();
        let lo = self.read_byte();
        ((hi as u16) << 8) | lo as u16
    }

    fn current_function(&self) -> ObjRef {
        let frame = self.frames.last().unwrap();
        self.closure_function(frame.closure)
    }

    fn read_constant(&mut self, long: bool) -> Value {
        let index = if long { self.read_u16() as usize } else { self.read_byte() as usize };
        let function_ref = self.current_function();
        match self.heap.kind(function_ref) {
            Obj::Function(f) => f.chunk.read_constant(index),
            _ => unreachable!(),
        }
    }

    // ---- opcode handlers --------------------------------------------------

    fn pop_two_numbers(&mut self, message: &str) -> Result<(f64, f64), RuntimeError> {
        let b = self.peek(0);
        let a = self.peek(1);
        match (a.as_number(), b.as_number()) {
            (Some(a), Some(b)) => {
                self.pop();
                self.pop();
                Ok((a, b))
            }
            _ => Err(self.runtime_error(message)),
        }
    }

    fn binary_op(&mut self, instruction: u8) -> Result<(), RuntimeError> {
        if instruction == op::ADD {
            // `+` on two strings is not concatenation — that's `..` — but
            // numeric addition is the only overload the reference
            // implementation's `binary_op` macro handles for OP_ADD.
            let (a, b) = self.pop_two_numbers("operands must be numbers")?;
            self.push(Value::Number(a + b));
            return Ok(());
        }
        let (a, b) = self.pop_two_numbers("operands must be numbers")?;
        let result = match instruction {
            op::SUB => Value::Number(a - b),
            op::MUL => Value::Number(a * b),
            op::LESS => Value::Bool(a < b),
            op::LESS_EQUAL => Value::Bool(a <= b),
            op::GREATER => Value::Bool(a > b),
            op::GREATER_EQUAL => Value::Bool(a >= b),
            _ => unreachable!(),
        };
        self.push(result);
        Ok(())
    }

    fn values_equal(&self, a: Value, b: Value) -> bool {
        a == b
    }

    fn concat(&mut self) -> Result<(), RuntimeError> {
        let b = self.pop();
        let a = self.pop();
        let rendered_a = format!("{}", DisplayValue(&self.heap, a));
        let rendered_b = format!("{}", DisplayValue(&self.heap, b));
        let combined = rendered_a + &rendered_b;
        self.push(Value::Obj(self.alloc_interned(combined)));
        Ok(())
    }

    fn alloc_interned(&mut self, s: String) -> ObjRef {
        self.maybe_collect(32 + s.len());
        self.heap.intern_owned(s)
    }

    fn global_decl(&mut self, long: bool) {
        let name = self.read_constant(long);
        let value = self.pop();
        let hash = self.heap.hash_value(name);
        self.globals.put(name, value, hash);
    }

    fn global_get(&mut self, long: bool) -> Result<(), RuntimeError> {
        let name = self.read_constant(long);
        let hash = self.heap.hash_value(name);
        match self.globals.get(name, hash) {
            Some(v) => {
                self.push(v);
                Ok(())
            }
            None => Err(self.runtime_error("cannot get value of undefined global variable")),
        }
    }

    fn global_set(&mut self, long: bool) -> Result<(), RuntimeError> {
        let name = self.read_constant(long);
        let hash = self.heap.hash_value(name);
        if !self.globals.contains(name, hash) {
            return Err(self.runtime_error("cannot assign undefined global variable"));
        }
        let value = self.peek(0);
        self.globals.put(name, value, hash);
        Ok(())
    }

    fn read_indexed(&mut self, long: bool) -> usize {
        if long {
            self.read_u16() as usize
        } else {
            self.read_byte() as usize
        }
    }

    fn local_get(&mut self, long: bool) {
        let slot = self.read_indexed(long);
        let base = self.frames.last().unwrap().stack_base;
        self.push(self.stack[base + slot]);
    }

    fn local_set(&mut self, long: bool) {
        let slot = self.read_indexed(long);
        let base = self.frames.last().unwrap().stack_base;
        self.stack[base + slot] = self.peek(0);
    }

    fn upvalue_ref(&self, slot: usize) -> ObjRef {
        let closure_ref = self.frames.last().unwrap().closure;
        match self.heap.kind(closure_ref) {
            Obj::Closure(c) => c.upvalues[slot],
            _ => unreachable!(),
        }
    }

    fn upvalue_get(&mut self, long: bool) {
        let slot = self.read_indexed(long);
        let upvalue_ref = self.upvalue_ref(slot);
        let value = match self.heap.kind(upvalue_ref) {
            Obj::Upvalue(u) => match u.state {
                UpvalueState::Open(i) => self.stack[i],
                UpvalueState::Closed(v) => v,
            },
            _ => unreachable!(),
        };
        self.push(value);
    }

    fn upvalue_set(&mut self, long: bool) {
        let slot = self.read_indexed(long);
        let upvalue_ref = self.upvalue_ref(slot);
        let value = self.peek(0);
        let state = match self.heap.kind(upvalue_ref) {
            Obj::Upvalue(u) => u.state,
            _ => unreachable!(),
        };
        match state {
            UpvalueState::Open(i) => self.stack[i] = value,
            UpvalueState::Closed(_) => {
                if let Obj::Upvalue(u) = self.heap.kind_mut(upvalue_ref) {
                    u.state = UpvalueState::Closed(value);
                }
            }
        }
    }

    /// Builds the element vector and allocates the `Array` object *before*
    /// truncating the stack, so the elements (which may themselves be heap
    /// references) stay reachable from the stack root for the duration of
    /// the allocation that might trigger a collection — the root-safety
    /// discipline spec.md §5 requires around composite allocations.
    fn make_array(&mut self, long: bool) {
        let count = self.read_indexed(long);
        let start = self.stack.len() - count;
        let items: Vec<Value> = self.stack[start..].to_vec();
        let r = self.alloc(Obj::Array(items));
        self.stack.truncate(start);
        self.push(Value::Obj(r));
    }

    fn make_dict(&mut self, long: bool) {
        let count = self.read_indexed(long);
        let start = self.stack.len() - count * 2;
        let entries: Vec<Value> = self.stack[start..].to_vec();
        let mut map = ValueMap::new();
        for pair in entries.chunks_exact(2) {
            let hash = self.heap.hash_value(pair[0]);
            map.put(pair[0], pair[1], hash);
        }
        let r = self.alloc(Obj::Dict(map));
        self.stack.truncate(start);
        self.push(Value::Obj(r));
    }

    fn make_closure(&mut self, long: bool) {
        let function_value = self.read_constant(long);
        let function_ref = function_value.as_obj().expect("CLOSURE constant must be a function");
        let upvalue_count = match self.heap.kind(function_ref) {
            Obj::Function(f) => f.upvalue_count,
            _ => unreachable!(),
        };
        let mut refs = Vec::with_capacity(upvalue_count as usize);
        let base = self.frames.last().unwrap().stack_base;
        for _ in 0..upvalue_count {
            let owned_above = self.read_byte() != 0;
            let index = self.read_byte();
            let up_ref = if owned_above {
                self.upvalue_ref(index as usize)
            } else {
                self.capture_upvalue(base + index as usize)
            };
            refs.push(up_ref);
        }
        let r = self.alloc(Obj::Closure(ClosureObj { function: function_ref, upvalues: refs }));
        self.push(Value::Obj(r));
    }

    fn trace_instruction(&self) {
        let frame = self.frames.last().unwrap();
        let function_ref = self.closure_function(frame.closure);
        if let Obj::Function(f) = self.heap.kind(function_ref) {
            let mut out = String::new();
            use std::fmt::Write;
            let _ = write!(out, "{}", f.chunk.disassemble("trace").lines().nth(frame.ip + 1).unwrap_or(""));
            eprintln!("{}", out);
        }
    }
}

impl Default for Vm {
    fn default() -> Self {
        Self::new()
    }
}

pub enum InterpretError {
    Compile(Vec<crate::compiler::CompileError>),
    Runtime(RuntimeError),
}

/// Adapter so `display_value` (which needs `&Heap` and a `Formatter`) can be
/// used anywhere a plain `Display` is expected (`print`, `..` concatenation).
struct DisplayValue<'a>(&'a Heap, Value);

impl std::fmt::Display for DisplayValue<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        crate::value::display_value(self.0, self.1, f)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn run(source: &str) -> Vm {
        let mut vm = Vm::new();
        match vm.interpret(source) {
            Ok(()) => vm,
            Err(InterpretError::Compile(errs)) => {
                panic!("compile error: {}", errs.iter().map(|e| e.to_string()).collect::<Vec<_>>().join("; "))
            }
            Err(InterpretError::Runtime(e)) => panic!("runtime error: {}", e),
        }
    }

    fn run_err(source: &str) -> RuntimeError {
        let mut vm = Vm::new();
        match vm.interpret(source) {
            Err(InterpretError::Runtime(e)) => e,
            Ok(()) => panic!("expected a runtime error"),
            Err(InterpretError::Compile(errs)) => {
                panic!("unexpected compile error: {}", errs.iter().map(|e| e.to_string()).collect::<Vec<_>>().join("; "))
            }
        }
    }

    #[test]
    fn arithmetic_precedence() {
        let mut vm = run("let x = 1 + 2 * 3;");
        let x = vm.globals.get(Value::Obj(vm.heap.intern("x")), vm.heap.hash_value(Value::Obj(vm.heap.intern("x"))));
        assert_eq!(x, Some(Value::Number(7.0)));
    }

    #[test]
    fn string_interning_equality() {
        let mut vm = run("let a = \"hi\"; let b = \"hi\"; let same = a == b;");
        let key = Value::Obj(vm.heap.intern("same"));
        let hash = vm.heap.hash_value(key);
        assert_eq!(vm.globals.get(key, hash), Some(Value::Bool(true)));
    }

    #[test]
    fn closures_share_captured_upvalue() {
        let mut vm = run(
            "let make_counter = fn() { let count = 0; return fn() { count = count + 1; return count; }; };\n\
             let counter = make_counter();\n\
             let a = counter();\n\
             let b = counter();\n\
             let c = counter();",
        );
        let key = Value::Obj(vm.heap.intern("c"));
        let hash = vm.heap.hash_value(key);
        assert_eq!(vm.globals.get(key, hash), Some(Value::Number(3.0)));
    }

    #[test]
    fn divide_by_zero_is_a_runtime_error() {
        let err = run_err("let x = 1 / 0;");
        assert!(err.message.contains("divide by zero"));
    }

    #[test]
    fn modulo_by_zero_is_a_runtime_error() {
        let err = run_err("let x = 1 % 0;");
        assert!(err.message.contains("divide by 0"));
    }

    #[test]
    fn while_loop_mutates_global() {
        let mut vm = run("let i = 0; while (i < 5) { i = i + 1; }");
        let key = Value::Obj(vm.heap.intern("i"));
        let hash = vm.heap.hash_value(key);
        assert_eq!(vm.globals.get(key, hash), Some(Value::Number(5.0)));
    }

    #[test]
    fn array_mutation_through_index_set() {
        let mut vm = run("let arr = [1, 2, 3]; arr[1] = 99;");
        let key = Value::Obj(vm.heap.intern("arr"));
        let hash = vm.heap.hash_value(key);
        let arr = vm.globals.get(key, hash).unwrap();
        let r = arr.as_obj().unwrap();
        match vm.heap.kind(r) {
            Obj::Array(items) => assert_eq!(items[1], Value::Number(99.0)),
            _ => panic!("not an array"),
        }
    }

    #[test]
    fn calling_a_non_callable_is_a_runtime_error() {
        let err = run_err("let x = 1; x();");
        assert_eq!(err.message, "value is not callable");
    }

    #[test]
    fn wrong_arity_is_a_runtime_error() {
        let err = run_err("let f = fn(a, b) { return a + b; }; f(1);");
        assert!(err.message.contains("expected 2 arguments"));
    }
}
