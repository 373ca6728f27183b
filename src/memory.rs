// File: src/memory.rs
//
// Memory manager: arena allocator, interned-string table, and the
// mark-and-sweep garbage collector. Grounded on `src/memory.c` from the
// distillation sources (`collectGarbage`, `reallocate`, threshold
// bookkeeping) and on the arena-of-handles pattern from
// `examples/other_examples/881a529c_ceronman-loxido__src-allocator.rs.rs`,
// adapted so the GC driver lives on `Vm` (it needs the VM's stack/frames/
// globals as roots) while this module owns the low-level arena, worklist,
// and interning primitives — the idiomatic-Rust split the spec's design
// notes call for (model the object list as an arena of indices, not a tree
// of owning references).

use crate::hashmap::ValueMap;
use crate::value::{Obj, ObjRef, Value};

/// Starting allocation threshold before the first collection can fire.
const BASE_TRIGGER_GC_THRESHOLD: usize = 1024 * 1024;
/// `threshold := allocated_bytes * GC_THRESHOLD_FACTOR` after every collection.
const GC_THRESHOLD_FACTOR: usize = 2;

struct ObjHeader {
    marked: bool,
    hash: u32,
    kind: Obj,
}

pub struct Heap {
    objects: Vec<Option<ObjHeader>>,
    free_slots: Vec<usize>,
    interned: ValueMap,
    allocated_bytes: usize,
    threshold: usize,
    /// Grey worklist for tricolor marking; cleared at the end of each
    /// collection, reused (not reallocated) across collections.
    worklist: Vec<ObjRef>,
    /// Forces `collect()` on every allocation that grows `allocated_bytes`,
    /// regardless of threshold. Wired to `RUFF_GC_STRESS` by the CLI driver;
    /// exists so the "GC safety" testable property can be exercised without
    /// a special build (the reference implementation used a compile-time
    /// `STRESS_GC` switch instead).
    pub stress: bool,
}

/// The root set a collection must mark, supplied by the VM since the heap
/// itself has no notion of "the running program".
pub struct Roots<'a> {
    pub stack: &'a [Value],
    pub globals: &'a ValueMap,
    pub frame_closures: &'a [ObjRef],
    pub open_upvalues: &'a [ObjRef],
}

impl Heap {
    pub fn new() -> Self {
        Heap {
            objects: Vec::new(),
            free_slots: Vec::new(),
            interned: ValueMap::new(),
            allocated_bytes: 0,
            threshold: BASE_TRIGGER_GC_THRESHOLD,
            worklist: Vec::new(),
            stress: std::env::var("RUFF_GC_STRESS").is_ok(),
        }
    }

    pub fn allocated_bytes(&self) -> usize {
        self.allocated_bytes
    }

    pub fn should_collect(&self, additional: usize) -> bool {
        self.stress || self.allocated_bytes + additional >= self.threshold
    }

    // ---- object access -------------------------------------------------

    fn header(&self, r: ObjRef) -> &ObjHeader {
        self.objects[r]
            .as_ref()
            .unwrap_or_else(|| panic!("use of freed object reference {}", r))
    }

    fn header_mut(&mut self, r: ObjRef) -> &mut ObjHeader {
        self.objects[r]
            .as_mut()
            .unwrap_or_else(|| panic!("use of freed object reference {}", r))
    }

    pub fn kind(&self, r: ObjRef) -> &Obj {
        &self.header(r).kind
    }

    pub fn kind_mut(&mut self, r: ObjRef) -> &mut Obj {
        &mut self.header_mut(r).kind
    }

    pub fn object_hash(&self, r: ObjRef) -> u32 {
        self.header(r).hash
    }

    pub fn as_string(&self, r: ObjRef) -> &str {
        match self.kind(r) {
            Obj::String(s) => s.as_str(),
            _ => panic!("object {} is not a string", r),
        }
    }

    /// Rough per-object byte accounting, used only to drive the allocation
    /// threshold (not for any user-visible behavior).
    fn size_of(obj: &Obj) -> usize {
        match obj {
            Obj::String(s) => 32 + s.len(),
            Obj::Array(v) => 32 + v.capacity() * std::mem::size_of::<Value>(),
            Obj::Dict(_) => 64,
            _ => 48,
        }
    }

    /// Allocates a new heap object with the given precomputed hash, reusing
    /// a freed slot if one is available.
    fn alloc_raw(&mut self, kind: Obj, hash: u32) -> ObjRef {
        let size = Self::size_of(&kind);
        self.allocated_bytes += size;
        let header = ObjHeader {
            marked: false,
            hash,
            kind,
        };
        if let Some(slot) = self.free_slots.pop() {
            self.objects[slot] = Some(header);
            slot
        } else {
            self.objects.push(Some(header));
            self.objects.len() - 1
        }
    }

    /// Low-level allocation entry point. Per spec.md §5's root-safety
    /// discipline, callers must ensure any value this allocation logically
    /// depends on is already reachable from a root (typically: already
    /// pushed on the VM stack) *before* calling this, since it may trigger
    /// a collection.
    ///
    /// Non-string objects hash by arena-index identity (the reference
    /// implementation's `hash_pointer`), which isn't known until the object
    /// has a slot, so the hash is filled in immediately after placement.
    pub fn alloc(&mut self, kind: Obj) -> ObjRef {
        let r = self.alloc_raw(kind, 0);
        let hash = match &self.header(r).kind {
            Obj::String(s) => fnv1a(s.as_bytes()),
            _ => hash_u32(r as u32),
        };
        self.header_mut(r).hash = hash;
        r
    }

    // ---- string interning -----------------------------------------------

    /// Canonicalizes `chars` through the interned-string table: returns the
    /// existing String object on a content match, else allocates a new one.
    pub fn intern(&mut self, chars: &str) -> ObjRef {
        let hash = fnv1a(chars.as_bytes());
        if let Some(existing) = self.find_interned(chars, hash) {
            return existing;
        }
        let r = self.alloc_raw(Obj::String(chars.to_owned()), hash);
        self.interned.put(Value::Obj(r), Value::Obj(r), hash);
        r
    }

    /// Same as `intern`, but adopts an owned `String` rather than copying
    /// a borrowed slice — the reference implementation's `takeString`.
    pub fn intern_owned(&mut self, chars: String) -> ObjRef {
        let hash = fnv1a(chars.as_bytes());
        if let Some(existing) = self.find_interned(&chars, hash) {
            return existing;
        }
        let r = self.alloc_raw(Obj::String(chars), hash);
        self.interned.put(Value::Obj(r), Value::Obj(r), hash);
        r
    }

    fn find_interned(&self, chars: &str, hash: u32) -> Option<ObjRef> {
        // The interned table's keys and values are both the same object
        // reference; probe only the bucket `hash` maps to, then confirm by
        // content (we don't yet have an ObjRef for `chars` to compare by
        // identity).
        let found = self.interned.find_by_hash(hash, |key| match key {
            Value::Obj(r) => matches!(&self.objects[r].as_ref().unwrap().kind, Obj::String(s) if s == chars),
            _ => false,
        })?;
        found.as_obj()
    }

    // ---- hashing ----------------------------------------------------

    /// Computes the map bucket hash for an arbitrary `Value`. Numbers hash
    /// over their full 64-bit representation (spec.md §9's recommended fix
    /// over the reference implementation's 32-bit truncation); objects use
    /// their precomputed header hash.
    pub fn hash_value(&self, value: Value) -> u32 {
        match value {
            Value::Nihl => hash_u32(0x9E37_79B9),
            Value::Bool(false) => hash_u32(0x1000_0001),
            Value::Bool(true) => hash_u32(0x1000_0002),
            Value::Number(n) => hash_u64(n.to_bits()),
            Value::Obj(r) => self.object_hash(r),
        }
    }

    // ---- garbage collection -------------------------------------------

    pub fn mark_value(&mut self, value: Value) {
        if let Value::Obj(r) = value {
            self.mark_object(r);
        }
    }

    pub fn mark_object(&mut self, r: ObjRef) {
        let header = match self.objects[r].as_mut() {
            Some(h) => h,
            None => return,
        };
        if header.marked {
            return;
        }
        header.marked = true;
        self.worklist.push(r);
    }

    fn mark_map(&mut self, map_entries: Vec<(Value, Value)>) {
        for (k, v) in map_entries {
            self.mark_value(k);
            self.mark_value(v);
        }
    }

    pub fn mark_roots(&mut self, roots: Roots) {
        for value in roots.stack {
            self.mark_value(*value);
        }
        let global_entries: Vec<_> = roots.globals.iter().collect();
        self.mark_map(global_entries);
        for &closure in roots.frame_closures {
            self.mark_object(closure);
        }
        for &upvalue in roots.open_upvalues {
            self.mark_object(upvalue);
        }
    }

    /// Drains the grey worklist, blackening each object (marking its
    /// children) until no grey objects remain.
    pub fn trace_references(&mut self) {
        while let Some(r) = self.worklist.pop() {
            self.blacken(r);
        }
    }

    fn blacken(&mut self, r: ObjRef) {
        // Children are collected into a small buffer first so `mark_object`
        // (which needs `&mut self`) isn't called while `self.objects` is
        // borrowed immutably.
        let mut child_objects: Vec<ObjRef> = Vec::new();
        let mut child_values: Vec<Value> = Vec::new();
        match &self.header(r).kind {
            Obj::Closure(c) => {
                child_objects.push(c.function);
                child_objects.extend(c.upvalues.iter().copied());
            }
            Obj::Upvalue(u) => {
                if let crate::value::UpvalueState::Closed(v) = u.state {
                    child_values.push(v);
                }
            }
            Obj::Function(f) => {
                if let Some(name) = f.name {
                    child_objects.push(name);
                }
                child_values.extend(f.chunk.constants.iter().copied());
            }
            Obj::Array(items) => child_values.extend(items.iter().copied()),
            Obj::Dict(map) => {
                for (k, v) in map.iter() {
                    child_values.push(k);
                    child_values.push(v);
                }
            }
            Obj::String(_) | Obj::Native(_) | Obj::Error(_) => {}
        }
        for obj in child_objects {
            self.mark_object(obj);
        }
        for val in child_values {
            self.mark_value(val);
        }
    }

    /// Removes every interned-table entry whose key object didn't survive
    /// marking. Must run before `sweep` so freed strings leave no dangling
    /// map keys.
    fn sweep_interned(&mut self) {
        let objects = &self.objects;
        self.interned.retain_keys(|key| {
            if let Value::Obj(r) = key {
                objects[r].as_ref().map(|h| h.marked).unwrap_or(false)
            } else {
                true
            }
        });
    }

    fn sweep_objects(&mut self) {
        for (i, slot) in self.objects.iter_mut().enumerate() {
            match slot {
                Some(header) if header.marked => header.marked = false,
                Some(header) => {
                    self.allocated_bytes = self.allocated_bytes.saturating_sub(Self::size_of(&header.kind));
                    *slot = None;
                    self.free_slots.push(i);
                }
                None => {}
            }
        }
    }

    /// Runs a full collection: mark roots, trace the worklist, sweep the
    /// interned table, sweep the object arena, then update the threshold.
    /// The mark-roots step is driven by the VM (see `vm.rs::Vm::collect`);
    /// this method performs the remaining, VM-agnostic steps.
    pub fn finish_collection(&mut self) {
        self.trace_references();
        self.sweep_interned();
        self.sweep_objects();
        self.threshold = self.allocated_bytes * GC_THRESHOLD_FACTOR;
        if self.threshold < BASE_TRIGGER_GC_THRESHOLD {
            self.threshold = BASE_TRIGGER_GC_THRESHOLD;
        }
    }
}

impl Default for Heap {
    fn default() -> Self {
        Self::new()
    }
}

/// FNV-1a, 32-bit. Used for string content hashing; a standard,
/// well-understood choice for this family of bytecode-VM implementations.
fn fnv1a(bytes: &[u8]) -> u32 {
    let mut hash: u32 = 0x811c_9dc5;
    for &b in bytes {
        hash ^= b as u32;
        hash = hash.wrapping_mul(0x0100_0193);
    }
    hash
}

/// Integer avalanche mix, ported from the reference implementation's
/// `hash_int` (`util.h`).
fn hash_u32(mut a: u32) -> u32 {
    a = a.wrapping_add(0x7ed5_5d16).wrapping_add(a << 12);
    a = (a ^ 0xc761_c23c) ^ (a >> 19);
    a = a.wrapping_add(0x1656_67b1).wrapping_add(a << 5);
    a = a.wrapping_add(0xd3a2_646c) ^ (a << 9);
    a = a.wrapping_add(0xfd70_46c5).wrapping_add(a << 3);
    a = (a ^ 0xb55a_4f09) ^ (a >> 16);
    a
}

/// 64-bit extension of `hash_u32`, used to hash a double's full bit pattern
/// per spec.md §9's resolution of the number-hashing open question (the
/// reference implementation truncates to 32-bit float first; this avoids
/// that precision loss).
fn hash_u64(bits: u64) -> u32 {
    let lo = hash_u32(bits as u32);
    let hi = hash_u32((bits >> 32) as u32);
    hash_u32(lo ^ hi.rotate_left(15))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn string_interning_is_canonical() {
        let mut heap = Heap::new();
        let a = heap.intern("hello");
        let b = heap.intern("hello");
        assert_eq!(a, b);
    }

    #[test]
    fn distinct_strings_are_distinct() {
        let mut heap = Heap::new();
        let a = heap.intern("foo");
        let b = heap.intern("bar");
        assert_ne!(a, b);
    }

    #[test]
    fn unreachable_objects_are_collected() {
        let mut heap = Heap::new();
        let a = heap.alloc(Obj::Array(vec![]));
        heap.mark_roots(Roots {
            stack: &[],
            globals: &ValueMap::new(),
            frame_closures: &[],
            open_upvalues: &[],
        });
        heap.finish_collection();
        // `a`'s slot has been freed; dereferencing now panics.
        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| heap.kind(a)));
        assert!(result.is_err());
    }

    #[test]
    fn rooted_objects_survive_collection() {
        let mut heap = Heap::new();
        let a = heap.alloc(Obj::Array(vec![]));
        let stack = [Value::Obj(a)];
        heap.mark_roots(Roots {
            stack: &stack,
            globals: &ValueMap::new(),
            frame_closures: &[],
            open_upvalues: &[],
        });
        heap.finish_collection();
        assert!(matches!(heap.kind(a), Obj::Array(_)));
    }

    #[test]
    fn interned_sweep_removes_unreachable_strings() {
        let mut heap = Heap::new();
        let s = heap.intern("transient");
        heap.mark_roots(Roots {
            stack: &[],
            globals: &ValueMap::new(),
            frame_closures: &[],
            open_upvalues: &[],
        });
        heap.finish_collection();
        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| heap.kind(s)));
        assert!(result.is_err());
        // Re-interning the same content allocates a fresh object rather
        // than returning the freed reference.
        let s2 = heap.intern("transient");
        assert!(matches!(heap.kind(s2), Obj::String(_)));
    }
}
