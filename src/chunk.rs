// File: src/chunk.rs
//
// A `Chunk` bundles the byte-level instruction stream, a constant pool, and
// a run-length-encoded line table for a single function body. Constants are
// addressed by an 8-bit index; code needing more than 256 constants must
// emit the `_LONG` form of an opcode, which addresses a 16-bit big-endian
// pair instead.

use crate::value::Value;

/// Raw opcode bytes. Kept as plain `u8` constants (rather than a `#[repr(u8)]`
/// enum) since the spec's wire format *is* a byte stream — dispatch in
/// `vm.rs` matches directly on these.
pub mod op {
    pub const CONST: u8 = 0;
    pub const CONST_LONG: u8 = 1;
    pub const CONST_NIHL: u8 = 2;
    pub const CONST_TRUE: u8 = 3;
    pub const CONST_FALSE: u8 = 4;
    pub const POP: u8 = 5;
    pub const NEGATE: u8 = 6;
    pub const ADD: u8 = 7;
    pub const SUB: u8 = 8;
    pub const MUL: u8 = 9;
    pub const POW: u8 = 10;
    pub const DIV: u8 = 11;
    pub const MOD: u8 = 12;
    pub const NOT: u8 = 13;
    pub const EQUAL: u8 = 14;
    pub const NOT_EQUAL: u8 = 15;
    pub const LESS: u8 = 16;
    pub const LESS_EQUAL: u8 = 17;
    pub const GREATER: u8 = 18;
    pub const GREATER_EQUAL: u8 = 19;
    pub const CONCAT: u8 = 20;
    pub const XOR: u8 = 21;
    pub const GLOBAL_DECL: u8 = 22;
    pub const GLOBAL_DECL_LONG: u8 = 23;
    pub const GLOBAL_GET: u8 = 24;
    pub const GLOBAL_GET_LONG: u8 = 25;
    pub const GLOBAL_SET: u8 = 26;
    pub const GLOBAL_SET_LONG: u8 = 27;
    pub const LOCAL_GET: u8 = 28;
    pub const LOCAL_GET_LONG: u8 = 29;
    pub const LOCAL_SET: u8 = 30;
    pub const LOCAL_SET_LONG: u8 = 31;
    pub const UPVALUE_GET: u8 = 32;
    pub const UPVALUE_GET_LONG: u8 = 33;
    pub const UPVALUE_SET: u8 = 34;
    pub const UPVALUE_SET_LONG: u8 = 35;
    pub const CLOSE_UPVALUE: u8 = 36;
    pub const JUMP_IF_FALSE: u8 = 37;
    pub const JUMP_IF_TRUE: u8 = 38;
    pub const JUMP: u8 = 39;
    pub const JUMP_BACK: u8 = 40;
    pub const CALL: u8 = 41;
    pub const ARRAY: u8 = 42;
    pub const ARRAY_LONG: u8 = 43;
    pub const DICT: u8 = 44;
    pub const DICT_LONG: u8 = 45;
    pub const INDEXING_GET: u8 = 46;
    pub const INDEXING_SET: u8 = 47;
    pub const CLOSURE: u8 = 48;
    pub const CLOSURE_LONG: u8 = 49;
    pub const RET: u8 = 50;
    pub const PRINT: u8 = 51;
}

/// One run of the line table: `count` consecutive instruction bytes all
/// originating from source `line`.
#[derive(Debug, Clone, Copy)]
struct LineRun {
    line: u32,
    count: u32,
}

#[derive(Default)]
pub struct Chunk {
    pub code: Vec<u8>,
    pub constants: Vec<Value>,
    lines: Vec<LineRun>,
}

impl Chunk {
    pub fn new() -> Self {
        Chunk {
            code: Vec::new(),
            constants: Vec::new(),
            lines: Vec::new(),
        }
    }

    /// Appends one byte, recording `line` in the run-length line table.
    /// Returns the offset the byte was written at.
    pub fn write(&mut self, byte: u8, line: u32) -> usize {
        match self.lines.last_mut() {
            Some(run) if run.line == line => run.count += 1,
            _ => self.lines.push(LineRun { line, count: 1 }),
        }
        self.code.push(byte);
        self.code.len() - 1
    }

    /// Writes a 16-bit big-endian operand across two bytes.
    pub fn write_u16(&mut self, value: u16, line: u32) {
        self.write((value >> 8) as u8, line);
        self.write((value & 0xff) as u8, line);
    }

    /// Adds `value` to the constant pool (no deduplication) and returns its
    /// index. Callers must emit the `_LONG` opcode form once this exceeds
    /// `u8::MAX`.
    pub fn add_constant(&mut self, value: Value) -> usize {
        self.constants.push(value);
        self.constants.len() - 1
    }

    pub fn read_constant(&self, index: usize) -> Value {
        self.constants[index]
    }

    /// Walks the run-length line table accumulating counts until
    /// instruction offset `i` is reached.
    pub fn line_of(&self, offset: usize) -> u32 {
        let mut accumulated = 0usize;
        for run in &self.lines {
            accumulated += run.count as usize;
            if offset < accumulated {
                return run.line;
            }
        }
        self.lines.last().map(|r| r.line).unwrap_or(0)
    }

    /// Disassembles the whole chunk into a human-readable string. Debug
    /// tooling only (see SPEC_FULL.md's Chunk module note) — never used by
    /// the VM's dispatch path.
    pub fn disassemble(&self, name: &str) -> String {
        use std::fmt::Write;
        let mut out = String::new();
        let _ = writeln!(out, "== {} ==", name);
        let mut offset = 0;
        while offset < self.code.len() {
            offset = self.disassemble_instruction(&mut out, offset);
        }
        out
    }

    fn disassemble_instruction(&self, out: &mut String, offset: usize) -> usize {
        use std::fmt::Write;
        let _ = write!(out, "{:04} line {:4} ", offset, self.line_of(offset));
        let instruction = self.code[offset];
        macro_rules! simple {
            ($name:expr) => {{
                let _ = writeln!(out, "{}", $name);
                offset + 1
            }};
        }
        macro_rules! const_op {
            ($name:expr, $long:expr) => {{
                let (idx, width) = if $long {
                    (self.read_u16(offset + 1) as usize, 3)
                } else {
                    (self.code[offset + 1] as usize, 2)
                };
                let _ = writeln!(out, "{} [{}]", $name, idx);
                offset + width
            }};
        }
        macro_rules! byte_op {
            ($name:expr, $long:expr) => {{
                let (arg, width) = if $long {
                    (self.read_u16(offset + 1) as usize, 3)
                } else {
                    (self.code[offset + 1] as usize, 2)
                };
                let _ = writeln!(out, "{} {}", $name, arg);
                offset + width
            }};
        }
        match instruction {
            op::CONST => const_op!("OP_CONST", false),
            op::CONST_LONG => const_op!("OP_CONST_LONG", true),
            op::CONST_NIHL => simple!("OP_CONST_NIHL"),
            op::CONST_TRUE => simple!("OP_CONST_TRUE"),
            op::CONST_FALSE => simple!("OP_CONST_FALSE"),
            op::POP => simple!("OP_POP"),
            op::NEGATE => simple!("OP_NEGATE"),
            op::ADD => simple!("OP_ADD"),
            op::SUB => simple!("OP_SUB"),
            op::MUL => simple!("OP_MUL"),
            op::POW => simple!("OP_POW"),
            op::DIV => simple!("OP_DIV"),
            op::MOD => simple!("OP_MOD"),
            op::NOT => simple!("OP_NOT"),
            op::EQUAL => simple!("OP_EQUAL"),
            op::NOT_EQUAL => simple!("OP_NOT_EQUAL"),
            op::LESS => simple!("OP_LESS"),
            op::LESS_EQUAL => simple!("OP_LESS_EQUAL"),
            op::GREATER => simple!("OP_GREATER"),
            op::GREATER_EQUAL => simple!("OP_GREATER_EQUAL"),
            op::CONCAT => simple!("OP_CONCAT"),
            op::XOR => simple!("OP_XOR"),
            op::GLOBAL_DECL => const_op!("OP_GLOBAL_DECL", false),
            op::GLOBAL_DECL_LONG => const_op!("OP_GLOBAL_DECL_LONG", true),
            op::GLOBAL_GET => const_op!("OP_GLOBAL_GET", false),
            op::GLOBAL_GET_LONG => const_op!("OP_GLOBAL_GET_LONG", true),
            op::GLOBAL_SET => const_op!("OP_GLOBAL_SET", false),
            op::GLOBAL_SET_LONG => const_op!("OP_GLOBAL_SET_LONG", true),
            op::LOCAL_GET => byte_op!("OP_LOCAL_GET", false),
            op::LOCAL_GET_LONG => byte_op!("OP_LOCAL_GET_LONG", true),
            op::LOCAL_SET => byte_op!("OP_LOCAL_SET", false),
            op::LOCAL_SET_LONG => byte_op!("OP_LOCAL_SET_LONG", true),
            op::UPVALUE_GET => byte_op!("OP_UPVALUE_GET", false),
            op::UPVALUE_GET_LONG => byte_op!("OP_UPVALUE_GET_LONG", true),
            op::UPVALUE_SET => byte_op!("OP_UPVALUE_SET", false),
            op::UPVALUE_SET_LONG => byte_op!("OP_UPVALUE_SET_LONG", true),
            op::CLOSE_UPVALUE => simple!("OP_CLOSE_UPVALUE"),
            op::JUMP_IF_FALSE => byte_op!("OP_JUMP_IF_FALSE", true),
            op::JUMP_IF_TRUE => byte_op!("OP_JUMP_IF_TRUE", true),
            op::JUMP => byte_op!("OP_JUMP", true),
            op::JUMP_BACK => byte_op!("OP_JUMP_BACK", true),
            op::CALL => byte_op!("OP_CALL", false),
            op::ARRAY => byte_op!("OP_ARRAY", false),
            op::ARRAY_LONG => byte_op!("OP_ARRAY_LONG", true),
            op::DICT => byte_op!("OP_DICT", false),
            op::DICT_LONG => byte_op!("OP_DICT_LONG", true),
            op::INDEXING_GET => simple!("OP_INDEXING_GET"),
            op::INDEXING_SET => simple!("OP_INDEXING_SET"),
            op::RET => simple!("OP_RET"),
            op::PRINT => simple!("OP_PRINT"),
            op::CLOSURE | op::CLOSURE_LONG => {
                // Upvalue count lives on the Function object, not in the
                // chunk, so this prints the constant index only; the
                // trailing (owned_above, index) byte pairs are not walked.
                let long = instruction == op::CLOSURE_LONG;
                let (idx, next) = if long {
                    (self.read_u16(offset + 1) as usize, offset + 3)
                } else {
                    (self.code[offset + 1] as usize, offset + 2)
                };
                let name = if long { "OP_CLOSURE_LONG" } else { "OP_CLOSURE" };
                let _ = writeln!(out, "{} [{}]", name, idx);
                next
            }
            other => {
                let _ = writeln!(out, "unknown opcode {}", other);
                offset + 1
            }
        }
    }

    fn read_u16(&self, offset: usize) -> u16 {
        ((self.code[offset] as u16) << 8) | (self.code[offset + 1] as u16)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn line_table_round_trips() {
        let mut chunk = Chunk::new();
        chunk.write(op::CONST_NIHL, 1);
        chunk.write(op::CONST_NIHL, 1);
        chunk.write(op::POP, 2);
        chunk.write(op::RET, 3);
        assert_eq!(chunk.line_of(0), 1);
        assert_eq!(chunk.line_of(1), 1);
        assert_eq!(chunk.line_of(2), 2);
        assert_eq!(chunk.line_of(3), 3);
    }

    #[test]
    fn constants_are_not_deduplicated() {
        let mut chunk = Chunk::new();
        let a = chunk.add_constant(Value::Number(1.0));
        let b = chunk.add_constant(Value::Number(1.0));
        assert_ne!(a, b);
    }

    #[test]
    fn u16_operand_round_trips() {
        let mut chunk = Chunk::new();
        chunk.write(op::JUMP, 1);
        chunk.write_u16(0x1234, 1);
        assert_eq!(chunk.read_u16(1), 0x1234);
    }
}
