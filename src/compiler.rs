// File: src/compiler.rs
//
// Single-pass compiler: a Pratt parser that emits bytecode directly as it
// parses, with no intermediate AST. Scope/local/upvalue bookkeeping follows
// the same shape as a typical single-pass bytecode compiler; grounded on the
// reference implementation's `compiler.c` for precedence levels and jump
// patching, and on the teacher's `src/compiler.rs`/`src/parser.rs` for
// overall module layout (error recovery, `Compiler` struct naming).

use crate::chunk::{op, Chunk};
use crate::lexer::{Lexer, Token, TokenKind};
use crate::memory::Heap;
use crate::value::{FunctionObj, Obj, Value};

const MAX_CONSTANTS: usize = 65536;
/// One byte addresses a local slot, so a scope holds at most 256 of them
/// (spec.md §4.5/§7: "too many locals in one function" fires at this
/// boundary; the closure encoding in `function_body`/`vm::make_closure`
/// also depends on local/upvalue indices fitting a single byte).
const MAX_LOCALS: usize = u8::MAX as usize + 1;
/// Same one-byte addressing constraint as `MAX_LOCALS`, since an upvalue's
/// `index` operand in the closure encoding is a single byte wide.
const MAX_UPVALUES: usize = u8::MAX as usize + 1;

#[derive(Debug, Clone, Copy, PartialEq, PartialOrd)]
enum Precedence {
    None,
    Assignment,
    Or,
    And,
    Equality,
    Comparison,
    Concat,
    Xor,
    Term,
    Factor,
    Power,
    Unary,
    Call,
    Primary,
}

impl Precedence {
    fn next(self) -> Precedence {
        use Precedence::*;
        match self {
            None => Assignment,
            Assignment => Or,
            Or => And,
            And => Equality,
            Equality => Comparison,
            Comparison => Concat,
            Concat => Xor,
            Xor => Term,
            Term => Factor,
            Factor => Power,
            Power => Unary,
            Unary => Call,
            Call => Primary,
            Primary => Primary,
        }
    }
}

fn precedence_of(kind: TokenKind) -> Precedence {
    use TokenKind::*;
    match kind {
        Or => Precedence::Or,
        And => Precedence::And,
        EqualEqual | BangEqual => Precedence::Equality,
        Less | LessEqual | Greater | GreaterEqual => Precedence::Comparison,
        DotDot => Precedence::Concat,
        Caret => Precedence::Xor,
        Plus | Minus => Precedence::Term,
        Star | Slash | Percent => Precedence::Factor,
        StarStar => Precedence::Power,
        LeftParen | LeftBracket => Precedence::Call,
        _ => Precedence::None,
    }
}

struct Local {
    name: String,
    depth: i32,
    is_captured: bool,
}

struct Upvalue {
    owned_above: bool,
    /// A single byte wide, per spec.md's closure encoding (`read two bytes
    /// (ownedAbove, index)`) — `MAX_UPVALUES` keeps this from overflowing.
    index: u8,
}

/// One function body being compiled. Compiling a nested `fn` pushes a new
/// `FunctionScope` and pops back to the enclosing one when the body closes,
/// standing in for the reference implementation's linked `Compiler` chain.
struct FunctionScope {
    function: FunctionObj,
    locals: Vec<Local>,
    upvalues: Vec<Upvalue>,
    scope_depth: i32,
}

impl FunctionScope {
    fn new(name: Option<usize>, arity: u8) -> Self {
        FunctionScope {
            function: FunctionObj::new(name, arity),
            // Slot 0 is reserved for the function's own closure value, matching
            // the calling convention used by `Vm::call`: callee slot 0 holds
            // the closure so recursive self-calls can find it.
            locals: vec![Local { name: String::new(), depth: 0, is_captured: false }],
            upvalues: Vec::new(),
            scope_depth: 0,
        }
    }
}

#[derive(Debug)]
pub struct CompileError {
    pub line: u32,
    pub message: String,
    pub at_end: bool,
    pub lexeme: String,
}

impl std::fmt::Display for CompileError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.at_end {
            write!(f, "[line {}] Error at end: {}", self.line, self.message)
        } else {
            write!(f, "[line {}] Error at '{}': {}", self.line, self.lexeme, self.message)
        }
    }
}

impl std::error::Error for CompileError {}

pub struct Compiler<'src, 'heap> {
    lexer: Lexer<'src>,
    heap: &'heap mut Heap,
    previous: Token<'src>,
    current: Token<'src>,
    had_error: bool,
    panic_mode: bool,
    errors: Vec<CompileError>,
    scopes: Vec<FunctionScope>,
}

impl<'src, 'heap> Compiler<'src, 'heap> {
    pub fn new(source: &'src str, heap: &'heap mut Heap) -> Self {
        let lexer = Lexer::new(source);
        // Dummy placeholder never read meaningfully — `compile`'s first
        // `advance()` call overwrites both fields with real tokens, looping
        // past any leading lexical-error tokens along the way.
        let placeholder = Token { kind: TokenKind::Eof, lexeme: "", line: 0 };
        Compiler {
            lexer,
            heap,
            previous: placeholder.clone(),
            current: placeholder,
            had_error: false,
            panic_mode: false,
            errors: Vec::new(),
            scopes: vec![FunctionScope::new(None, 0)],
        }
    }

    /// Compiles the whole source as the implicit top-level script function.
    pub fn compile(mut self) -> Result<FunctionObj, Vec<CompileError>> {
        self.advance();
        while !self.check(TokenKind::Eof) {
            self.declaration();
        }
        self.emit_byte(op::CONST_NIHL);
        self.emit_byte(op::RET);
        if self.had_error {
            Err(self.errors)
        } else {
            Ok(self.scopes.pop().unwrap().function)
        }
    }

    // ---- token stream plumbing -------------------------------------------

    fn advance(&mut self) {
        self.previous = self.current.clone();
        loop {
            self.current = self.lexer.next_token();
            if self.current.kind != TokenKind::Error {
                break;
            }
            let message = self.current.lexeme.to_string();
            self.error_at_current(&message);
        }
    }

    fn check(&self, kind: TokenKind) -> bool {
        self.current.kind == kind
    }

    fn matches(&mut self, kind: TokenKind) -> bool {
        if !self.check(kind) {
            return false;
        }
        self.advance();
        true
    }

    fn consume(&mut self, kind: TokenKind, message: &str) {
        if self.current.kind == kind {
            self.advance();
            return;
        }
        self.error_at_current(message);
    }

    fn error_at_current(&mut self, message: &str) {
        self.error_at_token(true, message);
    }

    fn error(&mut self, message: &str) {
        self.error_at_token(false, message);
    }

    fn error_at_token(&mut self, at_current: bool, message: &str) {
        if self.panic_mode {
            return;
        }
        self.panic_mode = true;
        self.had_error = true;
        let token = if at_current { &self.current } else { &self.previous };
        self.errors.push(CompileError {
            line: token.line,
            message: message.to_string(),
            at_end: token.kind == TokenKind::Eof,
            lexeme: token.lexeme.to_string(),
        });
    }

    /// Panic-mode recovery: discard tokens until a statement boundary.
    fn synchronize(&mut self) {
        self.panic_mode = false;
        while self.current.kind != TokenKind::Eof {
            if self.previous.kind == TokenKind::Semicolon {
                return;
            }
            use TokenKind::*;
            if matches!(
                self.current.kind,
                Fn | Let | For | If | While | Print | Return
            ) {
                return;
            }
            self.advance();
        }
    }

    // ---- emission helpers --------------------------------------------------

    fn chunk(&mut self) -> &mut Chunk {
        &mut self.scopes.last_mut().unwrap().function.chunk
    }

    fn line(&self) -> u32 {
        self.previous.line
    }

    fn emit_byte(&mut self, byte: u8) {
        let line = self.line();
        self.chunk().write(byte, line);
    }

    fn emit_bytes(&mut self, a: u8, b: u8) {
        self.emit_byte(a);
        self.emit_byte(b);
    }

    fn emit_u16(&mut self, value: u16) {
        let line = self.line();
        self.chunk().write_u16(value, line);
    }

    /// Emits `short` with an 8-bit operand if `index` fits, else `long` with
    /// a 16-bit one.
    fn emit_indexed(&mut self, short: u8, long: u8, index: usize) {
        if index <= u8::MAX as usize {
            self.emit_byte(short);
            self.emit_byte(index as u8);
        } else {
            self.emit_byte(long);
            self.emit_u16(index as u16);
        }
    }

    fn make_constant(&mut self, value: Value) -> usize {
        let index = self.chunk().add_constant(value);
        if index >= MAX_CONSTANTS {
            self.error("too many constants in one chunk");
        }
        index
    }

    fn emit_constant(&mut self, value: Value) {
        let index = self.make_constant(value);
        self.emit_indexed(op::CONST, op::CONST_LONG, index);
    }

    /// Emits a forward jump placeholder and returns its patch offset.
    fn emit_jump(&mut self, instruction: u8) -> usize {
        self.emit_byte(instruction);
        self.emit_u16(0xffff);
        self.chunk().code.len() - 2
    }

    /// Backpatches a forward jump to land at the current code position.
    fn patch_jump(&mut self, offset: usize) {
        let target = self.chunk().code.len();
        let jump = target - offset - 2;
        if jump > u16::MAX as usize {
            self.error("jump target too far away");
        }
        let code = &mut self.chunk().code;
        code[offset] = ((jump >> 8) & 0xff) as u8;
        code[offset + 1] = (jump & 0xff) as u8;
    }

    fn emit_loop(&mut self, loop_start: usize) {
        self.emit_byte(op::JUMP_BACK);
        let offset = self.chunk().code.len() - loop_start + 2;
        if offset > u16::MAX as usize {
            self.error("loop body too large");
        }
        self.emit_u16(offset as u16);
    }

    fn intern_identifier(&mut self, name: &str) -> usize {
        let r = self.heap.intern(name);
        self.make_constant(Value::Obj(r))
    }

    // ---- scope / locals ---------------------------------------------------

    fn begin_scope(&mut self) {
        self.scopes.last_mut().unwrap().scope_depth += 1;
    }

    fn end_scope(&mut self) {
        let scope = self.scopes.last_mut().unwrap();
        scope.scope_depth -= 1;
        let depth = scope.scope_depth;
        while let Some(local) = scope.locals.last() {
            if local.depth <= depth {
                break;
            }
            if local.is_captured {
                self.emit_byte(op::CLOSE_UPVALUE);
            } else {
                self.emit_byte(op::POP);
            }
            scope.locals.pop();
        }
    }

    fn declare_local(&mut self, name: &str) {
        let scope = self.scopes.last_mut().unwrap();
        if scope.scope_depth == 0 {
            return; // globals are resolved dynamically, not declared as locals
        }
        for local in scope.locals.iter().rev() {
            if local.depth != -1 && local.depth < scope.scope_depth {
                break;
            }
            if local.name == name {
                self.error("a variable with this name already exists in this scope");
            }
        }
        if scope.locals.len() >= MAX_LOCALS {
            self.error("too many local variables in one function");
            return;
        }
        scope.locals.push(Local { name: name.to_string(), depth: -1, is_captured: false });
    }

    fn mark_initialized(&mut self) {
        let scope = self.scopes.last_mut().unwrap();
        if scope.scope_depth == 0 {
            return;
        }
        let depth = scope.scope_depth;
        scope.locals.last_mut().unwrap().depth = depth;
    }

    fn resolve_local(scope: &FunctionScope, name: &str) -> Option<usize> {
        scope.locals.iter().enumerate().rev().find(|(_, l)| l.name == name).map(|(i, _)| i)
    }

    /// Resolves `name` as an upvalue of `self.scopes[scope_index]`, searching
    /// the enclosing scope first as a local, then recursively as an upvalue
    /// of *its* enclosing scope. Reuses an existing upvalue slot on repeat
    /// lookups rather than adding a duplicate.
    fn resolve_upvalue(&mut self, scope_index: usize, name: &str) -> Option<usize> {
        if scope_index == 0 {
            return None;
        }
        let enclosing_index = scope_index - 1;
        if let Some(local_index) = Self::resolve_local(&self.scopes[enclosing_index], name) {
            self.scopes[enclosing_index].locals[local_index].is_captured = true;
            return Some(self.add_upvalue(scope_index, true, local_index as u8));
        }
        if let Some(upvalue_index) = self.resolve_upvalue(enclosing_index, name) {
            return Some(self.add_upvalue(scope_index, false, upvalue_index as u8));
        }
        None
    }

    fn add_upvalue(&mut self, scope_index: usize, owned_above: bool, index: u8) -> usize {
        let scope = &mut self.scopes[scope_index];
        for (i, up) in scope.upvalues.iter().enumerate() {
            if up.owned_above == owned_above && up.index == index {
                return i;
            }
        }
        if scope.upvalues.len() >= MAX_UPVALUES {
            self.error("too many closure variables in one function");
            return 0;
        }
        scope.upvalues.push(Upvalue { owned_above, index });
        scope.function.upvalue_count = scope.upvalues.len() as u16;
        scope.upvalues.len() - 1
    }

    // ---- declarations and statements --------------------------------------

    fn declaration(&mut self) {
        if self.matches(TokenKind::Let) {
            self.let_declaration();
        } else if self.matches(TokenKind::Fn) {
            self.fn_declaration();
        } else {
            self.statement();
        }
        if self.panic_mode {
            self.synchronize();
        }
    }

    fn let_declaration(&mut self) {
        self.consume(TokenKind::Identifier, "expected a variable name");
        let name = self.previous.lexeme.to_string();
        let is_local = self.scopes.last().unwrap().scope_depth > 0;
        if is_local {
            self.declare_local(&name);
        }
        if self.matches(TokenKind::Equal) {
            self.expression();
        } else {
            self.emit_byte(op::CONST_NIHL);
        }
        self.consume(TokenKind::Semicolon, "expected ';' after variable declaration");
        if is_local {
            self.mark_initialized();
        } else {
            let index = self.intern_identifier(&name);
            self.emit_indexed(op::GLOBAL_DECL, op::GLOBAL_DECL_LONG, index);
        }
    }

    /// `fn name(params) { body }` desugars to `let name = fn(params) { body };`
    /// — the function value is compiled first so the name can be declared
    /// (and therefore reachable from inside the body for recursion) exactly
    /// like any other `let` binding.
    fn fn_declaration(&mut self) {
        self.consume(TokenKind::Identifier, "expected a function name");
        let name = self.previous.lexeme.to_string();
        let is_local = self.scopes.last().unwrap().scope_depth > 0;
        if is_local {
            self.declare_local(&name);
            self.mark_initialized();
        }
        self.function_body(Some(name.clone()));
        // For a local, the closure is already sitting on the stack in the
        // slot `declare_local`/`mark_initialized` assigned it — nothing
        // further to emit. Only a global needs an explicit define.
        if !is_local {
            let index = self.intern_identifier(&name);
            self.emit_indexed(op::GLOBAL_DECL, op::GLOBAL_DECL_LONG, index);
        }
    }

    fn function_body(&mut self, name: Option<String>) {
        self.consume(TokenKind::LeftParen, "expected '(' after function name");
        let name_ref = name.map(|n| self.heap.intern(&n));
        self.scopes.push(FunctionScope::new(name_ref, 0));
        self.begin_scope();
        let mut arity: u16 = 0;
        if !self.check(TokenKind::RightParen) {
            loop {
                arity += 1;
                if arity > 255 {
                    self.error("a function cannot have more than 255 parameters");
                }
                self.consume(TokenKind::Identifier, "expected a parameter name");
                let param = self.previous.lexeme.to_string();
                self.declare_local(&param);
                self.mark_initialized();
                if !self.matches(TokenKind::Comma) {
                    break;
                }
            }
        }
        self.consume(TokenKind::RightParen, "expected ')' after parameters");
        self.scopes.last_mut().unwrap().function.arity = arity as u8;
        self.consume(TokenKind::LeftBrace, "expected '{' before function body");
        self.block();
        self.emit_byte(op::CONST_NIHL);
        self.emit_byte(op::RET);

        let finished = self.scopes.pop().unwrap();
        let upvalues = finished.upvalues;
        let function_ref = self.heap.alloc(Obj::Function(finished.function));
        let function_const = self.make_constant(Value::Obj(function_ref));
        self.emit_indexed(op::CLOSURE, op::CLOSURE_LONG, function_const);
        for up in &upvalues {
            self.emit_byte(up.owned_above as u8);
            self.emit_byte(up.index);
        }
    }

    fn block(&mut self) {
        while !self.check(TokenKind::RightBrace) && !self.check(TokenKind::Eof) {
            self.declaration();
        }
        self.consume(TokenKind::RightBrace, "expected '}' after block");
    }

    fn statement(&mut self) {
        if self.matches(TokenKind::Print) {
            self.print_statement();
        } else if self.matches(TokenKind::If) {
            self.if_statement();
        } else if self.matches(TokenKind::While) {
            self.while_statement();
        } else if self.matches(TokenKind::For) {
            self.for_statement();
        } else if self.matches(TokenKind::Return) {
            self.return_statement();
        } else if self.matches(TokenKind::LeftBrace) {
            self.begin_scope();
            self.block();
            self.end_scope();
        } else {
            self.expression_statement();
        }
    }

    fn print_statement(&mut self) {
        self.expression();
        self.consume(TokenKind::Semicolon, "expected ';' after value");
        self.emit_byte(op::PRINT);
    }

    fn expression_statement(&mut self) {
        self.expression();
        self.consume(TokenKind::Semicolon, "expected ';' after expression");
        self.emit_byte(op::POP);
    }

    fn if_statement(&mut self) {
        self.consume(TokenKind::LeftParen, "expected '(' after 'if'");
        self.expression();
        self.consume(TokenKind::RightParen, "expected ')' after condition");
        let then_jump = self.emit_jump(op::JUMP_IF_FALSE);
        self.emit_byte(op::POP);
        self.statement();
        let else_jump = self.emit_jump(op::JUMP);
        self.patch_jump(then_jump);
        self.emit_byte(op::POP);
        if self.matches(TokenKind::Else) {
            self.statement();
        }
        self.patch_jump(else_jump);
    }

    fn while_statement(&mut self) {
        let loop_start = self.chunk().code.len();
        self.consume(TokenKind::LeftParen, "expected '(' after 'while'");
        self.expression();
        self.consume(TokenKind::RightParen, "expected ')' after condition");
        let exit_jump = self.emit_jump(op::JUMP_IF_FALSE);
        self.emit_byte(op::POP);
        self.statement();
        self.emit_loop(loop_start);
        self.patch_jump(exit_jump);
        self.emit_byte(op::POP);
    }

    /// `for (init; cond; post) body` desugars at compile time into
    /// `{ init; while (cond) { body; post; } }`, wrapped in its own scope so
    /// `init`'s bindings don't leak past the loop.
    fn for_statement(&mut self) {
        self.begin_scope();
        self.consume(TokenKind::LeftParen, "expected '(' after 'for'");

        if self.matches(TokenKind::Semicolon) {
            // no initializer
        } else if self.matches(TokenKind::Let) {
            self.let_declaration();
        } else {
            self.expression_statement();
        }

        let mut loop_start = self.chunk().code.len();
        let mut exit_jump = None;
        if !self.matches(TokenKind::Semicolon) {
            self.expression();
            self.consume(TokenKind::Semicolon, "expected ';' after loop condition");
            exit_jump = Some(self.emit_jump(op::JUMP_IF_FALSE));
            self.emit_byte(op::POP);
        }

        if !self.check(TokenKind::RightParen) {
            let body_jump = self.emit_jump(op::JUMP);
            let increment_start = self.chunk().code.len();
            self.expression();
            self.emit_byte(op::POP);
            self.consume(TokenKind::RightParen, "expected ')' after for clauses");
            self.emit_loop(loop_start);
            loop_start = increment_start;
            self.patch_jump(body_jump);
        } else {
            self.consume(TokenKind::RightParen, "expected ')' after for clauses");
        }

        self.statement();
        self.emit_loop(loop_start);

        if let Some(exit_jump) = exit_jump {
            self.patch_jump(exit_jump);
            self.emit_byte(op::POP);
        }
        self.end_scope();
    }

    fn return_statement(&mut self) {
        if self.scopes.len() == 1 {
            self.error("cannot return from top-level code");
        }
        if self.matches(TokenKind::Semicolon) {
            self.emit_byte(op::CONST_NIHL);
        } else {
            self.expression();
            self.consume(TokenKind::Semicolon, "expected ';' after return value");
        }
        self.emit_byte(op::RET);
    }

    // ---- expressions (Pratt parser) --------------------------------------

    fn expression(&mut self) {
        self.parse_precedence(Precedence::Assignment);
    }

    fn parse_precedence(&mut self, precedence: Precedence) {
        self.advance();
        let can_assign = precedence <= Precedence::Assignment;
        if !self.prefix(self.previous.kind, can_assign) {
            self.error("expected an expression");
            return;
        }
        while precedence <= precedence_of(self.current.kind) {
            self.advance();
            self.infix(self.previous.kind, can_assign);
        }
        if can_assign && self.matches(TokenKind::Equal) {
            self.error("invalid assignment target");
        }
    }

    fn prefix(&mut self, kind: TokenKind, can_assign: bool) -> bool {
        use TokenKind::*;
        match kind {
            Number => self.number(),
            String => self.string(),
            True => self.emit_byte(op::CONST_TRUE),
            False => self.emit_byte(op::CONST_FALSE),
            Nihl => self.emit_byte(op::CONST_NIHL),
            Identifier => self.variable(can_assign),
            LeftParen => self.grouping(),
            LeftBracket => self.array_literal(),
            LeftBrace => self.dict_literal(),
            Minus | Bang => self.unary(kind),
            Fn => self.function_body(None),
            _ => return false,
        }
        true
    }

    fn infix(&mut self, kind: TokenKind, _can_assign: bool) {
        use TokenKind::*;
        match kind {
            Plus | Minus | Star | Slash | Percent | StarStar | EqualEqual | BangEqual | Less
            | LessEqual | Greater | GreaterEqual | DotDot | Caret => self.binary(kind),
            And => self.and(),
            Or => self.or(),
            LeftParen => self.call(),
            LeftBracket => self.index_expr(),
            _ => {}
        }
    }

    fn number(&mut self) {
        let value: f64 = self.previous.lexeme.parse().unwrap_or_else(|_| {
            0.0
        });
        self.emit_constant(Value::Number(value));
    }

    fn string(&mut self) {
        let raw = self.previous.lexeme;
        let contents = &raw[1..raw.len() - 1];
        let unescaped = unescape(contents);
        let r = self.heap.intern_owned(unescaped);
        self.emit_constant(Value::Obj(r));
    }

    fn grouping(&mut self) {
        self.expression();
        self.consume(TokenKind::RightParen, "expected ')' after expression");
    }

    fn unary(&mut self, kind: TokenKind) {
        self.parse_precedence(Precedence::Unary);
        match kind {
            TokenKind::Minus => self.emit_byte(op::NEGATE),
            TokenKind::Bang => self.emit_byte(op::NOT),
            _ => unreachable!(),
        }
    }

    fn binary(&mut self, kind: TokenKind) {
        let precedence = precedence_of(kind);
        // `**` is right-associative: parse the rhs at the *same* precedence
        // rather than the next one up.
        let next = if kind == TokenKind::StarStar { precedence } else { precedence.next() };
        self.parse_precedence(next);
        match kind {
            TokenKind::Plus => self.emit_byte(op::ADD),
            TokenKind::Minus => self.emit_byte(op::SUB),
            TokenKind::Star => self.emit_byte(op::MUL),
            TokenKind::Slash => self.emit_byte(op::DIV),
            TokenKind::Percent => self.emit_byte(op::MOD),
            TokenKind::StarStar => self.emit_byte(op::POW),
            TokenKind::EqualEqual => self.emit_byte(op::EQUAL),
            TokenKind::BangEqual => self.emit_byte(op::NOT_EQUAL),
            TokenKind::Less => self.emit_byte(op::LESS),
            TokenKind::LessEqual => self.emit_byte(op::LESS_EQUAL),
            TokenKind::Greater => self.emit_byte(op::GREATER),
            TokenKind::GreaterEqual => self.emit_byte(op::GREATER_EQUAL),
            TokenKind::DotDot => self.emit_byte(op::CONCAT),
            TokenKind::Caret => self.emit_byte(op::XOR),
            _ => unreachable!(),
        }
    }

    /// Short-circuiting `and`: if the lhs is falsy, skip the rhs and leave
    /// the lhs value as the result.
    fn and(&mut self) {
        let end_jump = self.emit_jump(op::JUMP_IF_FALSE);
        self.emit_byte(op::POP);
        self.parse_precedence(Precedence::And);
        self.patch_jump(end_jump);
    }

    /// Short-circuiting `or`: if the lhs is truthy, skip the rhs.
    fn or(&mut self) {
        let end_jump = self.emit_jump(op::JUMP_IF_TRUE);
        self.emit_byte(op::POP);
        self.parse_precedence(Precedence::Or);
        self.patch_jump(end_jump);
    }

    fn call(&mut self) {
        let mut argc: u8 = 0;
        if !self.check(TokenKind::RightParen) {
            loop {
                self.expression();
                if argc == 255 {
                    self.error("cannot pass more than 255 arguments");
                }
                argc += 1;
                if !self.matches(TokenKind::Comma) {
                    break;
                }
            }
        }
        self.consume(TokenKind::RightParen, "expected ')' after arguments");
        self.emit_bytes(op::CALL, argc);
    }

    fn index_expr(&mut self) {
        self.expression();
        self.consume(TokenKind::RightBracket, "expected ']' after index");
        if self.matches(TokenKind::Equal) {
            self.expression();
            self.emit_byte(op::INDEXING_SET);
        } else {
            self.emit_byte(op::INDEXING_GET);
        }
    }

    fn array_literal(&mut self) {
        let mut count: usize = 0;
        if !self.check(TokenKind::RightBracket) {
            loop {
                self.expression();
                count += 1;
                if !self.matches(TokenKind::Comma) {
                    break;
                }
            }
        }
        self.consume(TokenKind::RightBracket, "expected ']' after array elements");
        self.emit_indexed(op::ARRAY, op::ARRAY_LONG, count);
    }

    fn dict_literal(&mut self) {
        let mut count: usize = 0;
        if !self.check(TokenKind::RightBrace) {
            loop {
                self.expression();
                self.consume(TokenKind::Colon, "expected ':' after dict key");
                self.expression();
                count += 1;
                if !self.matches(TokenKind::Comma) {
                    break;
                }
            }
        }
        self.consume(TokenKind::RightBrace, "expected '}' after dict entries");
        self.emit_indexed(op::DICT, op::DICT_LONG, count);
    }

    /// Resolves `name` as local, then upvalue, then falls back to a global
    /// lookup — the order spec.md §3 "Lexical Scope" specifies.
    fn variable(&mut self, can_assign: bool) {
        let name = self.previous.lexeme.to_string();
        let scope_index = self.scopes.len() - 1;

        if let Some(local) = Self::resolve_local(&self.scopes[scope_index], &name) {
            if self.scopes[scope_index].locals[local].depth == -1 {
                self.error("cannot read a local variable in its own initializer");
            }
            if can_assign && self.matches(TokenKind::Equal) {
                self.expression();
                self.emit_indexed(op::LOCAL_SET, op::LOCAL_SET_LONG, local);
            } else {
                self.emit_indexed(op::LOCAL_GET, op::LOCAL_GET_LONG, local);
            }
            return;
        }

        if let Some(upvalue) = self.resolve_upvalue(scope_index, &name) {
            if can_assign && self.matches(TokenKind::Equal) {
                self.expression();
                self.emit_indexed(op::UPVALUE_SET, op::UPVALUE_SET_LONG, upvalue);
            } else {
                self.emit_indexed(op::UPVALUE_GET, op::UPVALUE_GET_LONG, upvalue);
            }
            return;
        }

        let index = self.intern_identifier(&name);
        if can_assign && self.matches(TokenKind::Equal) {
            self.expression();
            self.emit_indexed(op::GLOBAL_SET, op::GLOBAL_SET_LONG, index);
        } else {
            self.emit_indexed(op::GLOBAL_GET, op::GLOBAL_GET_LONG, index);
        }
    }
}

/// Resolves `\n`, `\t`, `\\`, `\"` escapes in a string literal's contents.
/// Any other backslash sequence is passed through literally.
fn unescape(contents: &str) -> String {
    let mut out = String::with_capacity(contents.len());
    let mut chars = contents.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('n') => out.push('\n'),
            Some('t') => out.push('\t'),
            Some('r') => out.push('\r'),
            Some('\\') => out.push('\\'),
            Some('"') => out.push('"'),
            Some(other) => {
                out.push('\\');
                out.push(other);
            }
            None => out.push('\\'),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn compile_ok(src: &str) -> FunctionObj {
        let mut heap = Heap::new();
        let compiler = Compiler::new(src, &mut heap);
        compiler.compile().unwrap_or_else(|errs| {
            panic!("unexpected compile errors: {}", errs.iter().map(|e| e.to_string()).collect::<Vec<_>>().join("; "))
        })
    }

    fn compile_err(src: &str) -> Vec<CompileError> {
        let mut heap = Heap::new();
        let compiler = Compiler::new(src, &mut heap);
        compiler.compile().expect_err("expected a compile error")
    }

    #[test]
    fn compiles_arithmetic_expression_statement() {
        let func = compile_ok("1 + 2 * 3;");
        assert!(func.chunk.code.contains(&op::MUL));
        assert!(func.chunk.code.contains(&op::ADD));
    }

    #[test]
    fn compiles_let_and_print() {
        let func = compile_ok("let x = 1; print x;");
        assert!(func.chunk.code.contains(&op::GLOBAL_DECL));
        assert!(func.chunk.code.contains(&op::PRINT));
    }

    #[test]
    fn power_is_right_associative() {
        // 2 ** 3 ** 2 should compile without error regardless of
        // associativity; this just exercises the parse path.
        let func = compile_ok("2 ** 3 ** 2;");
        assert!(func.chunk.code.contains(&op::POW));
    }

    #[test]
    fn for_loop_desugars_to_while_with_increment() {
        let func = compile_ok("for (let i = 0; i < 3; i = i + 1) { print i; }");
        assert!(func.chunk.code.contains(&op::JUMP_BACK));
        assert!(func.chunk.code.contains(&op::JUMP_IF_FALSE));
    }

    #[test]
    fn nested_function_captures_upvalue() {
        let func = compile_ok(
            "let make_counter = fn() { let count = 0; return fn() { count = count + 1; return count; }; };",
        );
        // the outer closure's chunk should contain a nested CLOSURE emission
        assert!(func.chunk.code.contains(&op::CLOSURE) || func.chunk.code.contains(&op::CLOSURE_LONG));
    }

    #[test]
    fn reports_unterminated_block() {
        let errors = compile_err("{ let x = 1;");
        assert!(!errors.is_empty());
    }

    #[test]
    fn reports_invalid_assignment_target() {
        let errors = compile_err("1 + 1 = 2;");
        assert!(!errors.is_empty());
    }

    #[test]
    fn reports_return_outside_function() {
        let errors = compile_err("return 1;");
        assert!(!errors.is_empty());
    }

    #[test]
    fn return_inside_function_is_fine() {
        compile_ok("fn f() { return 1; }");
    }
}
