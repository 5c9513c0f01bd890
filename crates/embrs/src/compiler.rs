//! Single-pass bytecode compiler.
//!
//! A recursive-descent parser with Pratt-style operator precedence that
//! emits directly into the current function's [`Blob`] — there is no
//! intermediate AST. Function compilers stack up to mirror lexical
//! nesting; resolving a name searches locals, then enclosing-function
//! upvalues (captured transitively), then falls back to a global access
//! resolved at run time against the module's values and the VM globals.
//!
//! Jumps are emitted with a `0xffff` placeholder and patched once the
//! target is known. `break` emits a placeholder opcode rewritten to
//! `Jump` when its loop closes.

use std::collections::HashSet;

use crate::bytecode::{Blob, Opcode};
use crate::diagnostic::Diagnostic;
use crate::error::{Error, Result};
use crate::heap::{
    ClosureObj, FunctionKind, FunctionObj, Heap, Obj, ObjRef, SwitchObj,
};
use crate::modules;
use crate::scanner::{Scanner, Token, TokenKind};
use crate::table::Table;
use crate::value::{hash_value, Value};

/// Local slots per function; slot 0 is reserved for `self` (methods) or
/// the implicit receiver (scripts).
const MAX_LOCALS: usize = 256;

/// Exception handlers that may be open at once in a single function.
const MAX_HANDLERS: usize = 16;

const MAX_PARAMETERS: u8 = 255;

/// Options threaded through compilation.
#[derive(Debug, Clone, Default)]
pub struct CompileOptions {
    /// REPL mode: bare expression statements echo their value.
    pub repl: bool,
    /// Search roots for absolute imports (vendor dir, user dir, lib dir).
    pub search_paths: Vec<std::path::PathBuf>,
    /// Names of registered native modules, checked at import time.
    pub native_modules: HashSet<String>,
}

/// Compile a module body into a [`FunctionObj`] attached to `module`.
///
/// The returned function has arity 0 and kind `Script`; the VM wraps it in
/// a closure and calls it to execute the module. Collection is deferred
/// while the compiler runs because half-built blobs are invisible to the
/// GC's root enumeration.
pub fn compile(
    heap: &mut Heap,
    source: &str,
    module: ObjRef,
    options: &CompileOptions,
) -> Result<ObjRef> {
    heap.pause_gc();
    let result = Parser::new(heap, source, module, options).run();
    heap.resume_gc();
    result
}

// ---------------------------------------------------------------------------
// Precedence
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum Precedence {
    None,
    Assignment, // =, +=, -=, ...
    Conditional, // ?:
    Or,
    And,
    Equality,   // ==, !=
    Comparison, // <, <=, >, >=
    BitOr,
    BitXor,
    BitAnd,
    Shift, // <<, >>
    Range, // ..
    Term,  // +, -
    Factor, // *, /, %, **, //
    Unary,
    Call, // (), ., []
    Primary,
}

impl Precedence {
    fn next(self) -> Precedence {
        match self {
            Precedence::None => Precedence::Assignment,
            Precedence::Assignment => Precedence::Conditional,
            Precedence::Conditional => Precedence::Or,
            Precedence::Or => Precedence::And,
            Precedence::And => Precedence::Equality,
            Precedence::Equality => Precedence::Comparison,
            Precedence::Comparison => Precedence::BitOr,
            Precedence::BitOr => Precedence::BitXor,
            Precedence::BitXor => Precedence::BitAnd,
            Precedence::BitAnd => Precedence::Shift,
            Precedence::Shift => Precedence::Range,
            Precedence::Range => Precedence::Term,
            Precedence::Term => Precedence::Factor,
            Precedence::Factor => Precedence::Unary,
            Precedence::Unary => Precedence::Call,
            Precedence::Call => Precedence::Primary,
            Precedence::Primary => Precedence::Primary,
        }
    }
}

type PrefixFn = fn(&mut Parser<'_>, bool);
type InfixFn = fn(&mut Parser<'_>, Token<'_>, bool);

// ---------------------------------------------------------------------------
// Per-function compile state
// ---------------------------------------------------------------------------

struct Local {
    name: String,
    /// Scope depth, or -1 while declared but not yet initialised.
    depth: i32,
    captured: bool,
}

#[derive(Clone, Copy, PartialEq)]
struct CompilerUpvalue {
    index: u16,
    is_local: bool,
}

struct FuncCompiler {
    kind: FunctionKind,
    blob: Blob,
    locals: Vec<Local>,
    upvalues: Vec<CompilerUpvalue>,
    scope_depth: i32,
    handler_count: usize,
    arity: u8,
    is_variadic: bool,
    name: Option<ObjRef>,
}

impl FuncCompiler {
    fn new(kind: FunctionKind, name: Option<ObjRef>) -> Self {
        // Slot 0 belongs to the receiver in methods and to the function
        // value itself everywhere else.
        let slot_zero = match kind {
            FunctionKind::Method | FunctionKind::Initializer | FunctionKind::Private => "self",
            _ => "",
        };
        Self {
            kind,
            blob: Blob::new(),
            locals: vec![Local {
                name: slot_zero.to_string(),
                depth: 0,
                captured: false,
            }],
            upvalues: Vec::new(),
            scope_depth: 0,
            handler_count: 0,
            arity: 0,
            is_variadic: false,
            name,
        }
    }
}

struct ClassContext {
    name: String,
    has_superclass: bool,
}

// ---------------------------------------------------------------------------
// The parser
// ---------------------------------------------------------------------------

struct Parser<'a> {
    heap: &'a mut Heap,
    options: &'a CompileOptions,
    scanner: Scanner<'a>,
    source: &'a str,
    current: Token<'a>,
    previous: Token<'a>,
    had_error: bool,
    panic_mode: bool,
    diagnostic: Option<Diagnostic>,
    module: ObjRef,
    module_file: String,
    compilers: Vec<FuncCompiler>,
    classes: Vec<ClassContext>,
    innermost_loop_start: i32,
    innermost_loop_scope_depth: i32,
    is_trying: bool,
    repl_can_echo: bool,
    block_count: i32,
}

impl<'a> Parser<'a> {
    fn new(
        heap: &'a mut Heap,
        source: &'a str,
        module: ObjRef,
        options: &'a CompileOptions,
    ) -> Self {
        let module_file = heap.module(module).file.clone();
        let placeholder = Token {
            kind: TokenKind::Eof,
            lexeme: "",
            line: 1,
        };
        Self {
            heap,
            options,
            scanner: Scanner::new(source),
            source,
            current: placeholder,
            previous: placeholder,
            had_error: false,
            panic_mode: false,
            diagnostic: None,
            module,
            module_file,
            compilers: vec![FuncCompiler::new(FunctionKind::Script, None)],
            classes: Vec::new(),
            innermost_loop_start: -1,
            innermost_loop_scope_depth: 0,
            is_trying: false,
            repl_can_echo: false,
            block_count: 0,
        }
    }

    fn run(mut self) -> Result<ObjRef> {
        self.advance();
        self.ignore_space();
        while !self.matches(TokenKind::Eof) {
            self.declaration();
        }
        let function = self.end_compiler();
        if self.had_error {
            let diag = self.diagnostic.take().unwrap_or_else(|| {
                Diagnostic::new("compile error", self.module_file.clone(), 0)
            });
            return Err(Error::Compile(diag));
        }
        Ok(function)
    }

    // -- Error reporting ----------------------------------------------------

    fn error_at(&mut self, token: Token<'a>, message: &str) {
        if self.panic_mode {
            return;
        }
        self.panic_mode = true;
        self.had_error = true;
        if self.diagnostic.is_some() {
            return;
        }
        let line_text = self
            .source
            .lines()
            .nth(token.line.saturating_sub(1) as usize)
            .unwrap_or("");
        let column = match token.kind {
            TokenKind::Eof | TokenKind::Error | TokenKind::Newline => 0,
            _ => {
                let offset = token.lexeme.as_ptr() as usize - self.source.as_ptr() as usize;
                let line_start = self.source[..offset].rfind('\n').map(|i| i + 1).unwrap_or(0);
                self.source[line_start..offset].chars().count()
            }
        };
        let width = match token.kind {
            TokenKind::Eof | TokenKind::Error | TokenKind::Newline => 1,
            _ => token.lexeme.chars().count(),
        };
        self.diagnostic = Some(
            Diagnostic::new(message, self.module_file.clone(), token.line)
                .with_snippet(line_text, column, width),
        );
    }

    fn error(&mut self, message: &str) {
        self.error_at(self.previous, message);
    }

    fn error_at_current(&mut self, message: &str) {
        self.error_at(self.current, message);
    }

    // -- Token plumbing -----------------------------------------------------

    fn advance(&mut self) {
        self.previous = self.current;
        loop {
            self.current = self.scanner.scan_token();
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
        if self.check(kind) {
            self.advance();
            true
        } else {
            false
        }
    }

    fn consume(&mut self, kind: TokenKind, message: &str) {
        if self.check(kind) {
            self.advance();
        } else {
            self.error_at_current(message);
        }
    }

    fn ignore_space(&mut self) {
        while self.matches(TokenKind::Newline) {}
    }

    fn consume_stmt_end(&mut self) {
        // The last statement in a block may omit its terminator.
        if self.block_count > 0 && self.check(TokenKind::RBrace) {
            return;
        }
        if self.matches(TokenKind::Semicolon) {
            while self.matches(TokenKind::Semicolon) || self.matches(TokenKind::Newline) {}
            return;
        }
        if self.matches(TokenKind::Eof) || self.previous.kind == TokenKind::Eof {
            return;
        }
        self.consume(TokenKind::Newline, "end of statement expected");
        while self.matches(TokenKind::Semicolon) || self.matches(TokenKind::Newline) {}
    }

    // -- Emission helpers ---------------------------------------------------

    fn current_mut(&mut self) -> &mut FuncCompiler {
        self.compilers.last_mut().expect("compiler stack empty")
    }

    fn current(&self) -> &FuncCompiler {
        self.compilers.last().expect("compiler stack empty")
    }

    fn emit_op(&mut self, op: Opcode) {
        let line = self.previous.line;
        self.current_mut().blob.write_op(op, line);
    }

    fn emit_byte(&mut self, byte: u8) {
        let line = self.previous.line;
        self.current_mut().blob.write_byte(byte, line);
    }

    fn emit_short(&mut self, value: u16) {
        let line = self.previous.line;
        self.current_mut().blob.write_u16(value, line);
    }

    fn emit_op_short(&mut self, op: Opcode, value: u16) {
        self.emit_op(op);
        self.emit_short(value);
    }

    fn code_len(&self) -> usize {
        self.current().blob.len()
    }

    fn make_constant(&mut self, value: Value) -> u16 {
        self.current_mut().blob.add_constant(value)
    }

    fn emit_constant(&mut self, value: Value) {
        let index = self.make_constant(value);
        self.emit_op_short(Opcode::Constant, index);
    }

    fn string_constant(&mut self, text: &str) -> u16 {
        let value = self.heap.intern_value(text);
        self.make_constant(value)
    }

    fn ident_constant(&mut self, token: Token<'a>) -> u16 {
        self.string_constant(token.lexeme)
    }

    fn emit_jump(&mut self, op: Opcode) -> usize {
        self.emit_op(op);
        let offset = self.code_len();
        self.emit_short(0xffff);
        offset
    }

    fn patch_jump(&mut self, offset: usize) {
        // -2 skips over the operand itself.
        let jump = self.code_len() - offset - 2;
        if jump > u16::MAX as usize {
            self.error("too much code to jump over");
        }
        self.current_mut().blob.patch_u16(offset, jump as u16);
    }

    fn emit_loop(&mut self, loop_start: usize) {
        self.emit_op(Opcode::Loop);
        let offset = self.code_len() - loop_start + 2;
        if offset > u16::MAX as usize {
            self.error("loop body too large");
        }
        self.emit_short(offset as u16);
    }

    fn emit_return(&mut self) {
        if self.is_trying {
            self.emit_op(Opcode::PopTry);
        }
        if self.current().kind == FunctionKind::Initializer {
            self.emit_op_short(Opcode::GetLocal, 0);
        } else {
            self.emit_op(Opcode::Empty);
        }
        self.emit_op(Opcode::Return);
    }

    /// Close the innermost function compiler and produce its function
    /// object. The caller emits the `Closure` opcode and upvalue records.
    fn end_compiler(&mut self) -> ObjRef {
        self.emit_return();
        let compiler = self.compilers.pop().expect("compiler stack empty");
        let function = FunctionObj {
            arity: compiler.arity,
            upvalue_count: compiler.upvalues.len(),
            is_variadic: compiler.is_variadic,
            kind: compiler.kind,
            name: compiler.name,
            module: self.module,
            blob: compiler.blob,
        };
        self.heap.alloc(Obj::Function(function))
    }

    // -- Scopes and locals --------------------------------------------------

    fn begin_scope(&mut self) {
        self.current_mut().scope_depth += 1;
    }

    fn end_scope(&mut self) {
        let compiler = self.current_mut();
        compiler.scope_depth -= 1;
        let depth = compiler.scope_depth;
        while self
            .current()
            .locals
            .last()
            .map(|l| l.depth > depth)
            .unwrap_or(false)
        {
            let captured = self.current_mut().locals.pop().unwrap().captured;
            if captured {
                self.emit_op(Opcode::CloseUpvalue);
            } else {
                self.emit_op(Opcode::Pop);
            }
        }
    }

    /// Pop loop-scope locals for `continue` without forgetting them.
    fn discard_locals(&mut self, depth: i32) {
        let mut ops = Vec::new();
        for local in self.current().locals.iter().rev() {
            if local.depth <= depth {
                break;
            }
            ops.push(local.captured);
        }
        for captured in ops {
            if captured {
                self.emit_op(Opcode::CloseUpvalue);
            } else {
                self.emit_op(Opcode::Pop);
            }
        }
    }

    fn add_local(&mut self, name: &str) -> usize {
        if self.current().locals.len() == MAX_LOCALS {
            self.error("too many local variables in scope");
            return 0;
        }
        let compiler = self.current_mut();
        compiler.locals.push(Local {
            name: name.to_string(),
            depth: -1,
            captured: false,
        });
        compiler.locals.len() - 1
    }

    fn declare_variable(&mut self) {
        if self.current().scope_depth == 0 {
            return;
        }
        let name = self.previous.lexeme.to_string();
        let mut duplicate = false;
        {
            let compiler = self.current();
            for local in compiler.locals.iter().rev() {
                if local.depth != -1 && local.depth < compiler.scope_depth {
                    break;
                }
                if local.name == name {
                    duplicate = true;
                    break;
                }
            }
        }
        if duplicate {
            self.error("variable with this name already declared in scope");
            return;
        }
        self.add_local(&name);
    }

    fn parse_variable(&mut self, message: &str) -> u16 {
        self.consume(TokenKind::Identifier, message);
        self.declare_variable();
        if self.current().scope_depth > 0 {
            return 0;
        }
        self.ident_constant(self.previous)
    }

    fn mark_initialized(&mut self) {
        let compiler = self.current_mut();
        if compiler.scope_depth == 0 {
            return;
        }
        if let Some(local) = compiler.locals.last_mut() {
            local.depth = compiler.scope_depth;
        }
    }

    fn define_variable(&mut self, global: u16) {
        if self.current().scope_depth > 0 {
            self.mark_initialized();
            return;
        }
        self.emit_op_short(Opcode::DefineGlobal, global);
    }

    fn resolve_local(&mut self, level: usize, name: &str) -> Option<u16> {
        let mut uninitialized = false;
        let slot = {
            let compiler = &self.compilers[level];
            compiler.locals.iter().enumerate().rev().find_map(|(i, local)| {
                if local.name == name {
                    if local.depth == -1 {
                        uninitialized = true;
                    }
                    Some(i as u16)
                } else {
                    None
                }
            })
        };
        if uninitialized {
            self.error("cannot read local variable in its own initializer");
        }
        slot
    }

    fn add_upvalue(&mut self, level: usize, index: u16, is_local: bool) -> u16 {
        let compiler = &mut self.compilers[level];
        let upvalue = CompilerUpvalue { index, is_local };
        if let Some(existing) = compiler.upvalues.iter().position(|u| *u == upvalue) {
            return existing as u16;
        }
        compiler.upvalues.push(upvalue);
        (compiler.upvalues.len() - 1) as u16
    }

    fn resolve_upvalue(&mut self, level: usize, name: &str) -> Option<u16> {
        if level == 0 {
            return None;
        }
        if let Some(local) = self.resolve_local(level - 1, name) {
            self.compilers[level - 1].locals[local as usize].captured = true;
            return Some(self.add_upvalue(level, local, true));
        }
        if let Some(upvalue) = self.resolve_upvalue(level - 1, name) {
            return Some(self.add_upvalue(level, upvalue, false));
        }
        None
    }

    // -- Assignment ---------------------------------------------------------

    /// Emit a get, with the operand convention each access opcode uses.
    fn emit_get(&mut self, get_op: Opcode, arg: i32, will_assign: bool) {
        match get_op {
            Opcode::GetIndex | Opcode::GetRangedIndex => {
                self.emit_op(get_op);
                self.emit_byte(will_assign as u8);
            }
            _ => self.emit_op_short(get_op, arg as u16),
        }
    }

    fn emit_set(&mut self, set_op: Opcode, arg: i32) {
        if set_op == Opcode::SetIndex {
            self.emit_op(set_op);
        } else {
            self.emit_op_short(set_op, arg as u16);
        }
    }

    /// Compound assignment: re-read the target, evaluate the right side,
    /// apply `op`, and store back.
    fn compound_assign(&mut self, op: Opcode, get_op: Opcode, set_op: Opcode, arg: i32) {
        self.repl_can_echo = false;
        if matches!(get_op, Opcode::GetProperty | Opcode::GetSelfProperty) {
            self.emit_op(Opcode::Dup);
        }
        self.emit_get(get_op, arg, true);
        self.expression();
        self.emit_op(op);
        self.emit_set(set_op, arg);
    }

    /// Shared tail of every assignable expression: plain `=`, the
    /// compound-assignment family, `++`/`--`, or a plain read.
    fn do_assign(&mut self, get_op: Opcode, set_op: Opcode, arg: i32, can_assign: bool) {
        let compound = [
            (TokenKind::PlusEq, Opcode::Add),
            (TokenKind::MinusEq, Opcode::Subtract),
            (TokenKind::StarEq, Opcode::Multiply),
            (TokenKind::SlashEq, Opcode::Divide),
            (TokenKind::PowEq, Opcode::Pow),
            (TokenKind::PercentEq, Opcode::Remainder),
            (TokenKind::FloorEq, Opcode::FloorDivide),
            (TokenKind::AmpEq, Opcode::BitAnd),
            (TokenKind::BarEq, Opcode::BitOr),
            (TokenKind::CaretEq, Opcode::BitXor),
            (TokenKind::LShiftEq, Opcode::LeftShift),
            (TokenKind::RShiftEq, Opcode::RightShift),
        ];

        if can_assign && self.matches(TokenKind::Equal) {
            self.repl_can_echo = false;
            self.expression();
            self.emit_set(set_op, arg);
            return;
        }
        if can_assign {
            for (token, op) in compound {
                if self.matches(token) {
                    self.compound_assign(op, get_op, set_op, arg);
                    return;
                }
            }
            if self.matches(TokenKind::Increment) {
                self.repl_can_echo = false;
                if matches!(get_op, Opcode::GetProperty | Opcode::GetSelfProperty) {
                    self.emit_op(Opcode::Dup);
                }
                self.emit_get(get_op, arg, true);
                self.emit_op(Opcode::One);
                self.emit_op(Opcode::Add);
                self.emit_set(set_op, arg);
                return;
            }
            if self.matches(TokenKind::Decrement) {
                self.repl_can_echo = false;
                if matches!(get_op, Opcode::GetProperty | Opcode::GetSelfProperty) {
                    self.emit_op(Opcode::Dup);
                }
                self.emit_get(get_op, arg, true);
                self.emit_op(Opcode::One);
                self.emit_op(Opcode::Subtract);
                self.emit_set(set_op, arg);
                return;
            }
        }
        self.emit_get(get_op, arg, false);
    }

    fn named_variable(&mut self, name: &str, can_assign: bool) {
        let level = self.compilers.len() - 1;
        if let Some(slot) = self.resolve_local(level, name) {
            self.do_assign(Opcode::GetLocal, Opcode::SetLocal, slot as i32, can_assign);
        } else if let Some(upvalue) = self.resolve_upvalue(level, name) {
            self.do_assign(Opcode::GetUpvalue, Opcode::SetUpvalue, upvalue as i32, can_assign);
        } else {
            let constant = self.string_constant(name);
            self.do_assign(Opcode::GetGlobal, Opcode::SetGlobal, constant as i32, can_assign);
        }
    }

    // -- Expressions --------------------------------------------------------

    fn expression(&mut self) {
        self.parse_precedence(Precedence::Assignment);
    }

    fn parse_precedence(&mut self, precedence: Precedence) {
        self.advance();
        let Some(prefix) = prefix_rule(self.previous.kind) else {
            self.error("expected an expression");
            return;
        };
        let can_assign = precedence <= Precedence::Assignment;
        prefix(self, can_assign);

        while precedence <= precedence_of(self.current.kind) {
            let token_before = self.previous;
            self.advance();
            let Some(infix) = infix_rule(self.previous.kind) else {
                break;
            };
            infix(self, token_before, can_assign);
        }

        if can_assign && self.matches(TokenKind::Equal) {
            self.error("invalid assignment target");
        }
    }

    // Prefix rules ----------------------------------------------------------

    fn rule_number(&mut self, _can_assign: bool) {
        let value = parse_number(self.previous.lexeme);
        match value {
            Some(n) => self.emit_constant(Value::Number(n)),
            None => self.error("invalid number literal"),
        }
    }

    fn rule_literal(&mut self, _can_assign: bool) {
        match self.previous.kind {
            TokenKind::Nil => self.emit_op(Opcode::Nil),
            TokenKind::True => self.emit_op(Opcode::True),
            TokenKind::False => self.emit_op(Opcode::False),
            _ => unreachable!(),
        }
    }

    fn rule_string(&mut self, _can_assign: bool) {
        let text = unescape_string(self.previous.lexeme);
        let value = self.heap.intern_value(&text);
        self.emit_constant(value);
    }

    /// `"a ${x} b"` compiles each fragment, stringifies each spliced
    /// expression, and folds everything together with `Add`.
    fn rule_interpolation(&mut self, can_assign: bool) {
        let mut count = 0;
        loop {
            let mut added = false;
            if self.previous.lexeme.len() > 2 {
                self.rule_string(can_assign);
                added = true;
                if count > 0 {
                    self.emit_op(Opcode::Add);
                }
            }
            self.expression();
            self.emit_op(Opcode::Stringify);
            if added || count >= 1 {
                self.emit_op(Opcode::Add);
            }
            count += 1;
            if !self.matches(TokenKind::Interpolation) {
                break;
            }
        }
        self.consume(TokenKind::String, "unterminated string interpolation");
        if self.previous.lexeme.len() > 2 {
            self.rule_string(can_assign);
            self.emit_op(Opcode::Add);
        }
    }

    fn rule_grouping(&mut self, _can_assign: bool) {
        self.ignore_space();
        self.expression();
        self.ignore_space();
        self.consume(TokenKind::RParen, "expected ')' after grouped expression");
    }

    fn rule_unary(&mut self, _can_assign: bool) {
        let op = self.previous.kind;
        self.parse_precedence(Precedence::Unary);
        match op {
            TokenKind::Minus => self.emit_op(Opcode::Negate),
            TokenKind::Bang => self.emit_op(Opcode::Not),
            TokenKind::Tilde => self.emit_op(Opcode::BitNot),
            _ => {}
        }
    }

    fn rule_variable(&mut self, can_assign: bool) {
        let name = self.previous.lexeme.to_string();
        self.named_variable(&name, can_assign);
    }

    fn rule_self(&mut self, _can_assign: bool) {
        if self.classes.is_empty() {
            self.error("cannot use keyword 'self' outside of a method");
            return;
        }
        self.named_variable("self", false);
    }

    fn rule_parent(&mut self, _can_assign: bool) {
        if self.classes.is_empty() {
            self.error("cannot use keyword 'parent' outside of a class");
        } else if !self.classes.last().unwrap().has_superclass {
            self.error("cannot use keyword 'parent' in a class without a parent");
        }
        let mut name = None;
        let mut invoke_self = false;
        if !self.check(TokenKind::LParen) {
            self.consume(TokenKind::Dot, "expected '.' or '(' after parent");
            self.consume(TokenKind::Identifier, "expected parent class method name after '.'");
            name = Some(self.ident_constant(self.previous));
        } else {
            invoke_self = true;
        }
        self.named_variable("self", false);
        if self.matches(TokenKind::LParen) {
            let arg_count = self.argument_list();
            self.named_variable("parent", false);
            if let Some(name) = name {
                self.emit_op_short(Opcode::SuperInvoke, name);
                self.emit_byte(arg_count);
            } else {
                debug_assert!(invoke_self);
                self.emit_op(Opcode::SuperInvokeSelf);
                self.emit_byte(arg_count);
            }
        } else {
            self.named_variable("parent", false);
            self.emit_op_short(Opcode::GetSuper, name.unwrap_or(0));
        }
    }

    fn rule_list(&mut self, _can_assign: bool) {
        // Placeholder slot keeps every element rooted while the VM builds
        // the list in place.
        self.emit_op(Opcode::Nil);
        let mut count: u16 = 0;
        if !self.check(TokenKind::RBracket) {
            loop {
                self.ignore_space();
                if self.check(TokenKind::RBracket) {
                    break;
                }
                self.expression();
                self.ignore_space();
                count += 1;
                if !self.matches(TokenKind::Comma) {
                    break;
                }
            }
        }
        self.ignore_space();
        self.consume(TokenKind::RBracket, "expected ']' at end of list");
        self.emit_op_short(Opcode::List, count);
    }

    fn rule_dict(&mut self, _can_assign: bool) {
        self.emit_op(Opcode::Nil);
        let mut count: u16 = 0;
        if !self.check(TokenKind::RBrace) {
            loop {
                self.ignore_space();
                if self.check(TokenKind::RBrace) {
                    break;
                }
                // A bare identifier key is sugar for a string key.
                if self.matches(TokenKind::Identifier) {
                    let text = self.previous.lexeme.to_string();
                    let value = self.heap.intern_value(&text);
                    self.emit_constant(value);
                } else {
                    self.expression();
                }
                self.ignore_space();
                self.consume(TokenKind::Colon, "expected ':' after dictionary key");
                self.ignore_space();
                self.expression();
                self.ignore_space();
                count += 1;
                if !self.matches(TokenKind::Comma) {
                    break;
                }
            }
        }
        self.ignore_space();
        self.consume(TokenKind::RBrace, "expected '}' after dictionary");
        self.emit_op_short(Opcode::Dict, count);
    }

    /// Anonymous function: `|a, b| { ... }`.
    fn rule_anonymous(&mut self, _can_assign: bool) {
        self.compilers.push(FuncCompiler::new(FunctionKind::Function, None));
        self.begin_scope();
        if !self.check(TokenKind::Bar) {
            self.function_params();
        }
        self.consume(TokenKind::Bar, "expected '|' after anonymous function parameters");
        self.function_body();
    }

    // Infix rules -----------------------------------------------------------

    fn rule_binary(&mut self, _previous: Token<'_>, _can_assign: bool) {
        let op = self.previous.kind;
        self.ignore_space();
        self.parse_precedence(precedence_of(op).next());
        match op {
            TokenKind::Plus => self.emit_op(Opcode::Add),
            TokenKind::Minus => self.emit_op(Opcode::Subtract),
            TokenKind::Star => self.emit_op(Opcode::Multiply),
            TokenKind::Slash => self.emit_op(Opcode::Divide),
            TokenKind::Percent => self.emit_op(Opcode::Remainder),
            TokenKind::Pow => self.emit_op(Opcode::Pow),
            TokenKind::Floor => self.emit_op(Opcode::FloorDivide),
            TokenKind::EqualEq => self.emit_op(Opcode::Equal),
            TokenKind::BangEq => {
                self.emit_op(Opcode::Equal);
                self.emit_op(Opcode::Not);
            }
            TokenKind::Greater => self.emit_op(Opcode::Greater),
            TokenKind::GreaterEq => {
                self.emit_op(Opcode::Less);
                self.emit_op(Opcode::Not);
            }
            TokenKind::Less => self.emit_op(Opcode::Less),
            TokenKind::LessEq => {
                self.emit_op(Opcode::Greater);
                self.emit_op(Opcode::Not);
            }
            TokenKind::Amp => self.emit_op(Opcode::BitAnd),
            TokenKind::Bar => self.emit_op(Opcode::BitOr),
            TokenKind::Caret => self.emit_op(Opcode::BitXor),
            TokenKind::LShift => self.emit_op(Opcode::LeftShift),
            TokenKind::RShift => self.emit_op(Opcode::RightShift),
            TokenKind::Range => self.emit_op(Opcode::Range),
            _ => {}
        }
    }

    fn rule_and(&mut self, _previous: Token<'_>, _can_assign: bool) {
        let end_jump = self.emit_jump(Opcode::JumpIfFalse);
        self.emit_op(Opcode::Pop);
        self.parse_precedence(Precedence::And);
        self.patch_jump(end_jump);
    }

    fn rule_or(&mut self, _previous: Token<'_>, _can_assign: bool) {
        let else_jump = self.emit_jump(Opcode::JumpIfFalse);
        let end_jump = self.emit_jump(Opcode::Jump);
        self.patch_jump(else_jump);
        self.emit_op(Opcode::Pop);
        self.parse_precedence(Precedence::Or);
        self.patch_jump(end_jump);
    }

    fn rule_conditional(&mut self, _previous: Token<'_>, _can_assign: bool) {
        let then_jump = self.emit_jump(Opcode::JumpIfFalse);
        self.emit_op(Opcode::Pop);
        self.ignore_space();
        self.parse_precedence(Precedence::Conditional);
        self.ignore_space();
        let else_jump = self.emit_jump(Opcode::Jump);
        self.patch_jump(then_jump);
        self.emit_op(Opcode::Pop);
        self.consume(TokenKind::Colon, "expected matching ':' after '?' conditional");
        self.ignore_space();
        // Conditionals nest linearly, so the else arm re-enters at
        // assignment precedence.
        self.parse_precedence(Precedence::Assignment);
        self.patch_jump(else_jump);
    }

    fn rule_call(&mut self, _previous: Token<'_>, _can_assign: bool) {
        let arg_count = self.argument_list();
        self.emit_op(Opcode::Call);
        self.emit_byte(arg_count);
    }

    fn rule_dot(&mut self, previous: Token<'_>, can_assign: bool) {
        self.ignore_space();
        if !self.matches(TokenKind::Identifier) && !self.matches(TokenKind::Decorator) {
            self.error_at_current("expected property name after '.'");
            return;
        }
        let name = self.ident_constant(self.previous);
        let on_self = !self.classes.is_empty()
            && (previous.kind == TokenKind::SelfKw
                || previous.lexeme == self.classes.last().unwrap().name);
        if self.matches(TokenKind::LParen) {
            let arg_count = self.argument_list();
            if on_self {
                self.emit_op_short(Opcode::InvokeSelf, name);
            } else {
                self.emit_op_short(Opcode::Invoke, name);
            }
            self.emit_byte(arg_count);
        } else {
            let get_op = if on_self { Opcode::GetSelfProperty } else { Opcode::GetProperty };
            self.do_assign(get_op, Opcode::SetProperty, name as i32, can_assign);
        }
    }

    fn rule_indexing(&mut self, _previous: Token<'_>, _can_assign: bool) {
        let mut assignable = true;
        let mut comma_matched = false;
        let mut get_op = Opcode::GetIndex;
        if self.matches(TokenKind::Comma) {
            self.emit_op(Opcode::Nil);
            comma_matched = true;
            get_op = Opcode::GetRangedIndex;
        } else {
            self.expression();
        }
        if !self.matches(TokenKind::RBracket) {
            get_op = Opcode::GetRangedIndex;
            if !comma_matched {
                self.consume(TokenKind::Comma, "expected ',' or ']'");
            }
            if self.matches(TokenKind::RBracket) {
                self.emit_op(Opcode::Nil);
            } else {
                self.expression();
                self.consume(TokenKind::RBracket, "expected ']' after indexing");
            }
            assignable = false;
        } else if comma_matched {
            self.emit_op(Opcode::Nil);
        }
        self.do_assign(get_op, Opcode::SetIndex, -1, assignable);
    }

    fn argument_list(&mut self) -> u8 {
        let mut count: u8 = 0;
        self.ignore_space();
        if !self.check(TokenKind::RParen) {
            loop {
                self.ignore_space();
                self.expression();
                if count == MAX_PARAMETERS {
                    self.error("too many arguments to a function call");
                }
                count = count.wrapping_add(1);
                if !self.matches(TokenKind::Comma) {
                    break;
                }
            }
        }
        self.ignore_space();
        self.consume(TokenKind::RParen, "expected ')' after argument list");
        count
    }

    // -- Functions and classes ----------------------------------------------

    fn function_params(&mut self) {
        loop {
            self.ignore_space();
            if self.current().arity == MAX_PARAMETERS {
                self.error_at_current("too many function parameters");
            }
            self.current_mut().arity = self.current().arity.wrapping_add(1);
            if self.matches(TokenKind::TriDot) {
                self.current_mut().is_variadic = true;
                self.add_local("__args__");
                self.mark_initialized();
                break;
            }
            let constant = self.parse_variable("expected parameter name");
            self.define_variable(constant);
            self.ignore_space();
            if !self.matches(TokenKind::Comma) {
                break;
            }
        }
    }

    fn function_body(&mut self) {
        self.ignore_space();
        self.consume(TokenKind::LBrace, "expected '{' before function body");
        self.block();
        let upvalues: Vec<CompilerUpvalue> = self.current().upvalues.clone();
        let function = self.end_compiler();
        let closure_const = self.make_constant(Value::Obj(function));
        self.emit_op_short(Opcode::Closure, closure_const);
        for upvalue in upvalues {
            self.emit_byte(upvalue.is_local as u8);
            self.emit_short(upvalue.index);
        }
    }

    fn function(&mut self, kind: FunctionKind, name: ObjRef) {
        self.compilers.push(FuncCompiler::new(kind, Some(name)));
        self.begin_scope();
        self.consume(TokenKind::LParen, "expected '(' after function name");
        if !self.check(TokenKind::RParen) {
            self.function_params();
        }
        self.consume(TokenKind::RParen, "expected ')' after function parameters");
        self.function_body();
    }

    fn method(&mut self, class_name: &str, is_static: bool) {
        if !self.matches(TokenKind::Identifier) && !self.matches(TokenKind::Decorator) {
            self.error_at_current("method name expected");
            self.advance();
            return;
        }
        let name_token = self.previous;
        let constant = self.ident_constant(name_token);
        let mut kind = if is_static { FunctionKind::Static } else { FunctionKind::Method };
        if name_token.lexeme == class_name {
            kind = FunctionKind::Initializer;
        } else if name_token.lexeme.starts_with('_') {
            kind = FunctionKind::Private;
        }
        let name = self.heap.intern(name_token.lexeme);
        self.function(kind, name);
        self.emit_op_short(Opcode::Method, constant);
    }

    fn field(&mut self, is_static: bool) {
        self.consume(TokenKind::Identifier, "class property name expected");
        let constant = self.ident_constant(self.previous);
        if self.matches(TokenKind::Equal) {
            self.expression();
        } else {
            self.emit_op(Opcode::Nil);
        }
        self.emit_op_short(Opcode::ClassProperty, constant);
        self.emit_byte(is_static as u8);
        self.consume_stmt_end();
        self.ignore_space();
    }

    fn class_declaration(&mut self) {
        self.consume(TokenKind::Identifier, "class name expected");
        let name_constant = self.ident_constant(self.previous);
        let class_name = self.previous.lexeme.to_string();
        self.declare_variable();
        self.emit_op_short(Opcode::Class, name_constant);
        self.define_variable(name_constant);

        self.classes.push(ClassContext {
            name: class_name.clone(),
            has_superclass: false,
        });

        if self.matches(TokenKind::Less) {
            self.consume(TokenKind::Identifier, "name of superclass expected");
            let superclass_name = self.previous.lexeme.to_string();
            self.rule_variable(false);
            if superclass_name == class_name {
                self.error("a class cannot inherit from itself");
            }
            self.begin_scope();
            self.add_local("parent");
            self.mark_initialized();
            self.named_variable(&class_name, false);
            self.emit_op(Opcode::Inherit);
            self.classes.last_mut().unwrap().has_superclass = true;
        }

        self.named_variable(&class_name, false);
        self.ignore_space();
        self.consume(TokenKind::LBrace, "expected '{' before class body");
        self.ignore_space();
        while !self.check(TokenKind::RBrace) && !self.check(TokenKind::Eof) {
            let is_static = self.matches(TokenKind::Static);
            if self.matches(TokenKind::Var) {
                self.field(is_static);
            } else {
                // `def` is optional before a method; initializers are
                // conventionally written without it.
                self.matches(TokenKind::Def);
                self.method(&class_name, is_static);
                self.ignore_space();
            }
            if self.panic_mode {
                break;
            }
        }
        self.consume(TokenKind::RBrace, "expected '}' after class body");
        self.emit_op(Opcode::Pop);

        if self.classes.last().unwrap().has_superclass {
            self.end_scope();
        }
        self.classes.pop();
    }

    fn function_declaration(&mut self) {
        let global = self.parse_variable("function name expected");
        self.mark_initialized();
        let name = self.heap.intern(self.previous.lexeme);
        self.function(FunctionKind::Function, name);
        self.define_variable(global);
    }

    fn var_declaration(&mut self) {
        loop {
            let global = self.parse_variable("variable name expected");
            if self.matches(TokenKind::Equal) {
                self.expression();
            } else {
                self.emit_op(Opcode::Nil);
            }
            self.define_variable(global);
            if !self.matches(TokenKind::Comma) {
                break;
            }
        }
        self.consume_stmt_end();
    }

    // -- Statements ---------------------------------------------------------

    fn expression_statement(&mut self, is_initializer: bool) {
        self.repl_can_echo = self.options.repl;
        self.expression();
        if is_initializer {
            self.consume(TokenKind::Semicolon, "expected ';' after initializer");
        } else if self.repl_can_echo && self.compilers.len() == 1 && self.current().scope_depth == 0
        {
            self.emit_op(Opcode::Echo);
            self.consume_stmt_end();
            self.repl_can_echo = false;
            return;
        } else {
            self.consume_stmt_end();
        }
        self.emit_op(Opcode::Pop);
    }

    fn echo_statement(&mut self) {
        self.expression();
        self.emit_op(Opcode::Echo);
        self.consume_stmt_end();
    }

    fn die_statement(&mut self) {
        self.expression();
        self.emit_op(Opcode::Die);
        self.consume_stmt_end();
    }

    fn assert_statement(&mut self) {
        self.expression();
        if self.matches(TokenKind::Comma) {
            self.ignore_space();
            self.expression();
        } else {
            self.emit_op(Opcode::Nil);
        }
        self.emit_op(Opcode::Assert);
        self.consume_stmt_end();
    }

    fn if_statement(&mut self) {
        self.expression();
        let else_jump = self.emit_jump(Opcode::JumpIfFalse);
        self.emit_op(Opcode::Pop);
        self.statement();
        let end_jump = self.emit_jump(Opcode::Jump);
        self.patch_jump(else_jump);
        self.emit_op(Opcode::Pop);
        if self.matches(TokenKind::Else) {
            self.statement();
        }
        self.patch_jump(end_jump);
    }

    fn while_statement(&mut self) {
        let surrounding_start = self.innermost_loop_start;
        let surrounding_depth = self.innermost_loop_scope_depth;
        self.innermost_loop_start = self.code_len() as i32;
        self.innermost_loop_scope_depth = self.current().scope_depth;

        self.expression();
        let exit_jump = self.emit_jump(Opcode::JumpIfFalse);
        self.emit_op(Opcode::Pop);
        self.statement();
        self.emit_loop(self.innermost_loop_start as usize);
        self.patch_jump(exit_jump);
        self.emit_op(Opcode::Pop);
        self.end_loop();
        self.innermost_loop_start = surrounding_start;
        self.innermost_loop_scope_depth = surrounding_depth;
    }

    fn do_while_statement(&mut self) {
        let surrounding_start = self.innermost_loop_start;
        let surrounding_depth = self.innermost_loop_scope_depth;
        self.innermost_loop_start = self.code_len() as i32;
        self.innermost_loop_scope_depth = self.current().scope_depth;

        self.statement();
        self.ignore_space();
        self.consume(TokenKind::While, "expected 'while' after do body");
        self.expression();
        let exit_jump = self.emit_jump(Opcode::JumpIfFalse);
        self.emit_op(Opcode::Pop);
        self.emit_loop(self.innermost_loop_start as usize);
        self.patch_jump(exit_jump);
        self.emit_op(Opcode::Pop);
        self.end_loop();
        self.innermost_loop_start = surrounding_start;
        self.innermost_loop_scope_depth = surrounding_depth;
        self.consume_stmt_end();
    }

    /// `for init; cond; incr body` — `continue` targets the increment.
    fn for_statement(&mut self) {
        let has_paren = self.matches(TokenKind::LParen);
        self.begin_scope();

        if self.matches(TokenKind::Semicolon) {
            // no initializer
        } else if self.matches(TokenKind::Var) {
            self.var_declaration_for_initializer();
        } else {
            self.expression_statement(true);
        }

        let surrounding_start = self.innermost_loop_start;
        let surrounding_depth = self.innermost_loop_scope_depth;
        self.innermost_loop_start = self.code_len() as i32;
        self.innermost_loop_scope_depth = self.current().scope_depth;

        let mut exit_jump = None;
        if !self.matches(TokenKind::Semicolon) {
            self.expression();
            self.consume(TokenKind::Semicolon, "expected ';' after loop condition");
            self.ignore_space();
            exit_jump = Some(self.emit_jump(Opcode::JumpIfFalse));
            self.emit_op(Opcode::Pop);
        }

        if !self.check(TokenKind::LBrace) && !(has_paren && self.check(TokenKind::RParen)) {
            let body_jump = self.emit_jump(Opcode::Jump);
            let increment_start = self.code_len();
            self.expression();
            self.ignore_space();
            self.emit_op(Opcode::Pop);
            self.emit_loop(self.innermost_loop_start as usize);
            self.innermost_loop_start = increment_start as i32;
            self.patch_jump(body_jump);
        }

        if has_paren {
            self.consume(TokenKind::RParen, "expected ')' after for clauses");
        }

        self.statement();
        self.emit_loop(self.innermost_loop_start as usize);
        if let Some(exit) = exit_jump {
            self.patch_jump(exit);
            self.emit_op(Opcode::Pop);
        }
        self.end_loop();
        self.innermost_loop_start = surrounding_start;
        self.innermost_loop_scope_depth = surrounding_depth;
        self.end_scope();
    }

    /// A `var` initializer inside `for`, terminated by ';' instead of a
    /// statement end.
    fn var_declaration_for_initializer(&mut self) {
        loop {
            let global = self.parse_variable("variable name expected");
            if self.matches(TokenKind::Equal) {
                self.expression();
            } else {
                self.emit_op(Opcode::Nil);
            }
            self.define_variable(global);
            if !self.matches(TokenKind::Comma) {
                break;
            }
        }
        self.consume(TokenKind::Semicolon, "expected ';' after initializer");
    }

    /// `foreach x in e` / `foreach k, v in e` desugars to calls on the
    /// iterable's `@itern`/`@iter` pair through hidden locals.
    fn foreach_statement(&mut self) {
        self.begin_scope();
        let iter_const = self.string_constant("@iter");
        let itern_const = self.string_constant("@itern");

        self.consume(TokenKind::Identifier, "expected variable name after 'foreach'");
        let first = self.previous.lexeme.to_string();
        let (key_name, value_name) = if self.check(TokenKind::Comma) {
            self.consume(TokenKind::Comma, "");
            self.consume(TokenKind::Identifier, "expected variable name after ','");
            (first, self.previous.lexeme.to_string())
        } else {
            // The space keeps the synthetic key from colliding with any
            // user-visible name.
            (" _ ".to_string(), first)
        };
        self.consume(TokenKind::In, "expected 'in' after foreach variables");
        self.ignore_space();

        // Evaluate the iterable into a hidden slot.
        self.expression();
        if self.current().locals.len() + 3 > MAX_LOCALS {
            self.error("too many local variables in scope");
            return;
        }
        let iterator_slot = self.add_local(" iterator ") as u16;
        self.mark_initialized();
        // Key slot starts at nil.
        self.emit_op(Opcode::Nil);
        let key_slot = self.add_local(&key_name) as u16;
        self.mark_initialized();
        // Value slot.
        self.emit_op(Opcode::Nil);
        let value_slot = self.add_local(&value_name) as u16;
        self.mark_initialized();

        let surrounding_start = self.innermost_loop_start;
        let surrounding_depth = self.innermost_loop_scope_depth;
        self.innermost_loop_start = self.code_len() as i32;
        self.innermost_loop_scope_depth = self.current().scope_depth;

        // key = iterator.@itern(key); fall out when falsey.
        self.emit_op_short(Opcode::GetLocal, iterator_slot);
        self.emit_op_short(Opcode::GetLocal, key_slot);
        self.emit_op_short(Opcode::Invoke, itern_const);
        self.emit_byte(1);
        self.emit_op_short(Opcode::SetLocal, key_slot);
        let false_jump = self.emit_jump(Opcode::JumpIfFalse);
        self.emit_op(Opcode::Pop);

        // value = iterator.@iter(key), bound fresh each iteration so
        // closures capture distinct variables.
        self.emit_op_short(Opcode::GetLocal, iterator_slot);
        self.emit_op_short(Opcode::GetLocal, key_slot);
        self.emit_op_short(Opcode::Invoke, iter_const);
        self.emit_byte(1);
        self.begin_scope();
        self.emit_op_short(Opcode::SetLocal, value_slot);
        self.emit_op(Opcode::Pop);
        self.statement();
        self.end_scope();

        self.emit_loop(self.innermost_loop_start as usize);
        self.patch_jump(false_jump);
        self.emit_op(Opcode::Pop);
        self.end_loop();
        self.innermost_loop_start = surrounding_start;
        self.innermost_loop_scope_depth = surrounding_depth;
        self.end_scope();
    }

    /// `using expr { when a, b: ... default: ... }` builds a `Switch`
    /// constant so the VM dispatches in one table lookup.
    fn using_statement(&mut self) {
        self.expression();
        self.consume(TokenKind::LBrace, "expected '{' after using expression");
        self.ignore_space();

        let switch_ref = self.heap.alloc(Obj::Switch(SwitchObj {
            table: Table::new(),
            default_jump: -1,
            exit_jump: -1,
        }));
        let switch_const = self.make_constant(Value::Obj(switch_ref));
        self.emit_op_short(Opcode::Switch, switch_const);
        let start_offset = self.code_len();

        // 0: before any case, 1: inside cases, 2: after default.
        let mut state = 0;
        let mut case_ends: Vec<usize> = Vec::new();

        while !self.matches(TokenKind::RBrace) && !self.check(TokenKind::Eof) {
            if self.matches(TokenKind::When) || self.matches(TokenKind::Default) {
                let case_kind = self.previous.kind;
                if state == 2 {
                    self.error("cannot have another case after a default case");
                }
                if state == 1 {
                    case_ends.push(self.emit_jump(Opcode::Jump));
                }
                if case_kind == TokenKind::When {
                    state = 1;
                    loop {
                        self.ignore_space();
                        self.advance();
                        let jump = Value::Number((self.code_len() - start_offset) as f64);
                        let negated = self.previous.kind == TokenKind::Minus
                            && self.check(TokenKind::Number);
                        if negated {
                            self.advance();
                        }
                        let key = match self.previous.kind {
                            TokenKind::True => Some(Value::Bool(true)),
                            TokenKind::False => Some(Value::Bool(false)),
                            TokenKind::String => {
                                let text = unescape_string(self.previous.lexeme);
                                Some(self.heap.intern_value(&text))
                            }
                            TokenKind::Number => parse_number(self.previous.lexeme)
                                .map(|n| Value::Number(if negated { -n } else { n })),
                            _ => None,
                        };
                        match key {
                            Some(key) => {
                                let hash = hash_value(self.heap, key);
                                match self.heap.get_mut(switch_ref) {
                                    Obj::Switch(sw) => {
                                        sw.table.set(hash, key, jump);
                                    }
                                    _ => unreachable!(),
                                }
                            }
                            None => {
                                self.error("only constants can be used in 'when' expressions");
                            }
                        }
                        if !self.matches(TokenKind::Comma) {
                            break;
                        }
                    }
                    self.consume(TokenKind::Colon, "expected ':' after when values");
                    self.ignore_space();
                } else {
                    state = 2;
                    self.consume(TokenKind::Colon, "expected ':' after default");
                    self.ignore_space();
                    let jump = (self.code_len() - start_offset) as i32;
                    match self.heap.get_mut(switch_ref) {
                        Obj::Switch(sw) => sw.default_jump = jump,
                        _ => unreachable!(),
                    }
                }
            } else {
                if state == 0 {
                    self.error("cannot have statements before any case");
                }
                self.statement();
                self.ignore_space();
            }
        }

        for case_end in case_ends {
            self.patch_jump(case_end);
        }
        let exit = (self.code_len() - start_offset) as i32;
        match self.heap.get_mut(switch_ref) {
            Obj::Switch(sw) => sw.exit_jump = exit,
            _ => unreachable!(),
        }
        self.emit_op(Opcode::Pop);
    }

    fn try_statement(&mut self) {
        if self.current().handler_count == MAX_HANDLERS {
            self.error("maximum exception handlers in scope exceeded");
        }
        self.current_mut().handler_count += 1;
        self.is_trying = true;
        self.ignore_space();

        // TRY <type u16> <handler u16> <finally u16>, patched below.
        self.emit_op(Opcode::Try);
        let try_operands = self.code_len();
        self.emit_short(0xffff);
        self.emit_short(0xffff);
        self.emit_short(0xffff);

        self.statement();
        self.emit_op(Opcode::PopTry);
        let exit_jump = self.emit_jump(Opcode::Jump);
        self.is_trying = false;

        // A program cannot start with a handler, so 0 doubles as "absent".
        let mut handler_address: usize = 0;
        let mut finally_address: usize = 0;
        let type_constant: u16;
        let mut catch_exists = false;

        if self.matches(TokenKind::Catch) {
            catch_exists = true;
            self.begin_scope();
            self.consume(TokenKind::Identifier, "missing exception class name");
            type_constant = self.ident_constant(self.previous);
            handler_address = self.code_len();
            if self.matches(TokenKind::Identifier) {
                // The handler entry path leaves the exception exactly at
                // this slot, so the pushed value becomes the binding.
                self.add_local(self.previous.lexeme);
                self.mark_initialized();
            } else {
                self.emit_op(Opcode::Pop);
            }
            self.emit_op(Opcode::PopTry);
            self.ignore_space();
            self.statement();
            self.end_scope();
        } else {
            // No catch: record the base class so `finally` still runs for
            // every raised exception.
            type_constant = self.string_constant("Exception");
        }

        self.patch_jump(exit_jump);

        let mut finally_exists = false;
        if self.matches(TokenKind::Finally) {
            finally_exists = true;
            // Reaching here on the normal path: the sentinel says "do not
            // re-raise after the finally body".
            self.emit_op(Opcode::False);
            finally_address = self.code_len();
            self.ignore_space();
            self.statement();
            let continue_jump = self.emit_jump(Opcode::JumpIfFalse);
            self.emit_op(Opcode::Pop);
            self.emit_op(Opcode::PublishTry);
            self.patch_jump(continue_jump);
            self.emit_op(Opcode::Pop);
        }

        if !catch_exists && !finally_exists {
            self.error("try block must contain at least one of catch or finally");
        }

        let blob = &mut self.current_mut().blob;
        blob.patch_u16(try_operands, type_constant);
        blob.patch_u16(try_operands + 2, handler_address as u16);
        blob.patch_u16(try_operands + 4, finally_address as u16);
        self.current_mut().handler_count -= 1;
    }

    fn return_statement(&mut self) {
        if self.current().kind == FunctionKind::Script {
            self.error("cannot return from top-level code");
        }
        if self.matches(TokenKind::Semicolon) || self.matches(TokenKind::Newline) {
            self.emit_return();
        } else {
            if self.current().kind == FunctionKind::Initializer {
                self.error("cannot return value from constructor");
            }
            if self.is_trying {
                self.emit_op(Opcode::PopTry);
            }
            self.expression();
            self.emit_op(Opcode::Return);
            self.consume_stmt_end();
        }
    }

    fn break_statement(&mut self) {
        if self.innermost_loop_start == -1 {
            self.error("'break' can only be used in a loop");
        }
        self.discard_locals(self.innermost_loop_scope_depth);
        self.emit_jump(Opcode::BreakPlaceholder);
        self.consume_stmt_end();
    }

    fn continue_statement(&mut self) {
        if self.innermost_loop_start == -1 {
            self.error("'continue' can only be used in a loop");
        }
        self.discard_locals(self.innermost_loop_scope_depth);
        self.emit_loop(self.innermost_loop_start.max(0) as usize);
        self.consume_stmt_end();
    }

    /// Rewrite every `BreakPlaceholder` emitted by the closing loop into a
    /// forward jump past the loop. Walks the bytecode instruction-wise so
    /// operand bytes cannot alias the placeholder.
    fn end_loop(&mut self) {
        let start = self.innermost_loop_start.max(0) as usize;
        let mut i = start;
        while i < self.code_len() {
            let byte = self.current().blob.code[i];
            if byte == Opcode::BreakPlaceholder as u8 {
                self.current_mut().blob.code[i] = Opcode::Jump as u8;
                self.patch_jump(i + 1);
                i += 3;
            } else {
                let op = Opcode::from_byte(byte).expect("invalid opcode in blob");
                i += 1 + self.instruction_operand_width(op, i + 1);
            }
        }
    }

    /// Operand byte count of the instruction at `operand_offset`.
    fn instruction_operand_width(&self, op: Opcode, operand_offset: usize) -> usize {
        use Opcode::*;
        match op {
            Call | SuperInvokeSelf | GetIndex | GetRangedIndex => 1,
            DefineGlobal | GetGlobal | SetGlobal | GetLocal | SetLocal | GetUpvalue
            | SetUpvalue | GetProperty | GetSelfProperty | SetProperty | JumpIfFalse | Jump
            | Loop | Constant | PopN | Class | GetSuper | Method | List | Dict | CallImport
            | NativeModule | SelectImport | SelectNativeImport | EjectImport
            | EjectNativeImport | Switch | BreakPlaceholder => 2,
            Invoke | InvokeSelf | SuperInvoke | ClassProperty => 3,
            Try => 6,
            Closure => {
                let constant = self.current().blob.read_u16(operand_offset) as usize;
                let function = self.current().blob.constants[constant]
                    .as_obj()
                    .expect("closure constant");
                2 + self.heap.function(function).upvalue_count * 3
            }
            _ => 0,
        }
    }

    // -- Imports ------------------------------------------------------------

    fn import_statement(&mut self) {
        let mut is_relative = self.matches(TokenKind::Dot);
        let mut parent_hops = 0;
        if self.matches(TokenKind::Range) {
            if is_relative {
                self.error("conflicting module path; parent or current directory?");
                return;
            }
            is_relative = true;
            parent_hops = 1;
        }

        let mut parts: Vec<String> = Vec::new();
        loop {
            if self.previous.kind == TokenKind::Range && !parts.is_empty() {
                parent_hops += 1;
            }
            self.consume(TokenKind::Identifier, "module name expected");
            let part = self.previous.lexeme.to_string();

            // Native modules carry a leading underscore and are never
            // path-resolved.
            if parts.is_empty() && part.starts_with('_') && !is_relative {
                let constant = self.string_constant(&part);
                self.emit_op_short(Opcode::NativeModule, constant);
                self.specific_import(&part, constant, false, true);
                return;
            }
            parts.push(part);
            if !self.matches(TokenKind::Dot) && !self.matches(TokenKind::Range) {
                break;
            }
        }

        let mut module_name = parts.last().cloned().unwrap_or_default();
        let was_renamed = if self.matches(TokenKind::As) {
            self.consume(TokenKind::Identifier, "module alias expected");
            module_name = self.previous.lexeme.to_string();
            true
        } else {
            false
        };

        let resolved = modules::resolve_import(
            &self.module_file,
            &parts,
            is_relative,
            parent_hops,
            &self.options.search_paths,
        );
        let Some(path) = resolved else {
            if self.options.native_modules.contains(&module_name) {
                let constant = self.string_constant(&module_name);
                self.emit_op_short(Opcode::NativeModule, constant);
                self.specific_import(&module_name, constant, was_renamed, true);
                return;
            }
            self.error(&format!("module '{}' not found", parts.join(".")));
            return;
        };

        if !self.check(TokenKind::LBrace) {
            self.consume_stmt_end();
        }

        let source = match std::fs::read_to_string(&path) {
            Ok(source) => source,
            Err(err) => {
                self.error(&format!("could not read module '{}': {}", path.display(), err));
                return;
            }
        };

        // Compile the module body recursively against its own module
        // object; the import site only holds the resulting closure.
        let module_obj = self.heap.alloc(Obj::Module(crate::heap::ModuleObj {
            name: module_name.clone(),
            file: path.to_string_lossy().into_owned(),
            values: Table::new(),
            preloader: None,
            unloader: None,
            imported: false,
        }));
        let function = {
            let mut sub = Parser::new(self.heap, &source, module_obj, self.options);
            sub.advance();
            sub.ignore_space();
            while !sub.matches(TokenKind::Eof) {
                sub.declaration();
            }
            let function = sub.end_compiler();
            if sub.had_error {
                let message = sub
                    .diagnostic
                    .take()
                    .map(|d| d.message)
                    .unwrap_or_else(|| "compile error".to_string());
                self.error(&format!("failed to import '{}': {}", module_name, message));
                return;
            }
            function
        };
        let closure = self.heap.alloc(Obj::Closure(ClosureObj {
            function,
            upvalues: Vec::new(),
        }));
        let import_constant = self.make_constant(Value::Obj(closure));
        self.emit_op_short(Opcode::CallImport, import_constant);
        self.emit_op(Opcode::Pop);
        self.specific_import(&module_name, import_constant, was_renamed, false);
    }

    /// The `{ a, b, * }` selective-import clause.
    fn specific_import(&mut self, module_name: &str, constant: u16, was_renamed: bool, is_native: bool) {
        if !self.matches(TokenKind::LBrace) {
            if is_native {
                self.consume_stmt_end();
            }
            return;
        }
        if was_renamed {
            self.error("selective import on renamed module");
            return;
        }
        self.emit_op_short(Opcode::Constant, constant);
        let mut same_name_selected = false;
        loop {
            self.ignore_space();
            if self.matches(TokenKind::Star) {
                self.emit_op(if is_native { Opcode::ImportAllNative } else { Opcode::ImportAll });
                break;
            }
            self.consume(TokenKind::Identifier, "module object name expected");
            let name = self.ident_constant(self.previous);
            if self.previous.lexeme == module_name {
                same_name_selected = true;
            }
            self.emit_op_short(
                if is_native { Opcode::SelectNativeImport } else { Opcode::SelectImport },
                name,
            );
            if !self.matches(TokenKind::Comma) {
                break;
            }
        }
        self.ignore_space();
        self.consume(TokenKind::RBrace, "expected '}' at end of selective import");
        if !same_name_selected {
            self.emit_op_short(
                if is_native { Opcode::EjectNativeImport } else { Opcode::EjectImport },
                constant,
            );
        }
        self.emit_op(Opcode::Pop);
        self.consume_stmt_end();
    }

    // -- Declarations and dispatch ------------------------------------------

    fn block(&mut self) {
        self.block_count += 1;
        self.ignore_space();
        while !self.check(TokenKind::RBrace) && !self.check(TokenKind::Eof) {
            self.declaration();
        }
        self.block_count -= 1;
        self.consume(TokenKind::RBrace, "expected '}' after block");
    }

    fn declaration(&mut self) {
        // Stray separators between declarations are harmless.
        while self.matches(TokenKind::Newline) || self.matches(TokenKind::Semicolon) {}
        if self.check(TokenKind::Eof) {
            return;
        }
        if self.matches(TokenKind::Class) {
            self.class_declaration();
        } else if self.matches(TokenKind::Def) {
            self.function_declaration();
        } else if self.matches(TokenKind::Var) {
            self.var_declaration();
        } else if self.matches(TokenKind::LBrace) {
            self.begin_scope();
            self.block();
            self.end_scope();
        } else {
            self.statement();
        }
        self.ignore_space();
        if self.panic_mode {
            self.synchronize();
        }
    }

    fn statement(&mut self) {
        self.repl_can_echo = false;
        self.ignore_space();
        if self.matches(TokenKind::Echo) {
            self.echo_statement();
        } else if self.matches(TokenKind::If) {
            self.if_statement();
        } else if self.matches(TokenKind::Do) {
            self.do_while_statement();
        } else if self.matches(TokenKind::While) {
            self.while_statement();
        } else if self.matches(TokenKind::For) {
            self.for_statement();
        } else if self.matches(TokenKind::Foreach) {
            self.foreach_statement();
        } else if self.matches(TokenKind::Using) {
            self.using_statement();
        } else if self.matches(TokenKind::Import) {
            self.import_statement();
        } else if self.matches(TokenKind::Assert) {
            self.assert_statement();
        } else if self.matches(TokenKind::Try) {
            self.try_statement();
        } else if self.matches(TokenKind::Return) {
            self.return_statement();
        } else if self.matches(TokenKind::Break) {
            self.break_statement();
        } else if self.matches(TokenKind::Continue) {
            self.continue_statement();
        } else if self.matches(TokenKind::Die) {
            self.die_statement();
        } else if self.matches(TokenKind::LBrace) {
            self.begin_scope();
            self.block();
            self.end_scope();
        } else {
            self.expression_statement(false);
        }
        self.ignore_space();
    }

    fn synchronize(&mut self) {
        self.panic_mode = false;
        while self.current.kind != TokenKind::Eof {
            if self.previous.kind == TokenKind::Newline
                || self.previous.kind == TokenKind::Semicolon
            {
                return;
            }
            match self.current.kind {
                TokenKind::Class
                | TokenKind::Def
                | TokenKind::Var
                | TokenKind::Foreach
                | TokenKind::If
                | TokenKind::Using
                | TokenKind::While
                | TokenKind::For
                | TokenKind::Do
                | TokenKind::Echo
                | TokenKind::Assert
                | TokenKind::Try
                | TokenKind::Catch
                | TokenKind::Die
                | TokenKind::Return
                | TokenKind::Static
                | TokenKind::SelfKw
                | TokenKind::Parent
                | TokenKind::Finally
                | TokenKind::In
                | TokenKind::Import => return,
                _ => {}
            }
            self.advance();
        }
    }
}

// ---------------------------------------------------------------------------
// Rule table
// ---------------------------------------------------------------------------

fn prefix_rule(kind: TokenKind) -> Option<PrefixFn> {
    use TokenKind::*;
    Some(match kind {
        LParen => rule_grouping_fn,
        LBracket => rule_list_fn,
        LBrace => rule_dict_fn,
        Minus | Bang | Tilde => rule_unary_fn,
        Bar => rule_anonymous_fn,
        Number => rule_number_fn,
        String => rule_string_fn,
        Interpolation => rule_interpolation_fn,
        Identifier => rule_variable_fn,
        Nil | True | False => rule_literal_fn,
        SelfKw => rule_self_fn,
        Parent => rule_parent_fn,
        _ => return None,
    })
}

fn infix_rule(kind: TokenKind) -> Option<InfixFn> {
    use TokenKind::*;
    Some(match kind {
        LParen => rule_call_fn,
        LBracket => rule_indexing_fn,
        Dot => rule_dot_fn,
        Plus | Minus | Star | Slash | Percent | Pow | Floor | EqualEq | BangEq | Greater
        | GreaterEq | Less | LessEq | Amp | Bar | Caret | LShift | RShift | Range => {
            rule_binary_fn
        }
        And => rule_and_fn,
        Or => rule_or_fn,
        Question => rule_conditional_fn,
        _ => return None,
    })
}

fn rule_grouping_fn<'a, 'b>(parser: &'a mut Parser<'b>, can_assign: bool) {
    parser.rule_grouping(can_assign);
}

fn rule_list_fn<'a, 'b>(parser: &'a mut Parser<'b>, can_assign: bool) {
    parser.rule_list(can_assign);
}

fn rule_dict_fn<'a, 'b>(parser: &'a mut Parser<'b>, can_assign: bool) {
    parser.rule_dict(can_assign);
}

fn rule_unary_fn<'a, 'b>(parser: &'a mut Parser<'b>, can_assign: bool) {
    parser.rule_unary(can_assign);
}

fn rule_anonymous_fn<'a, 'b>(parser: &'a mut Parser<'b>, can_assign: bool) {
    parser.rule_anonymous(can_assign);
}

fn rule_number_fn<'a, 'b>(parser: &'a mut Parser<'b>, can_assign: bool) {
    parser.rule_number(can_assign);
}

fn rule_string_fn<'a, 'b>(parser: &'a mut Parser<'b>, can_assign: bool) {
    parser.rule_string(can_assign);
}

fn rule_interpolation_fn<'a, 'b>(parser: &'a mut Parser<'b>, can_assign: bool) {
    parser.rule_interpolation(can_assign);
}

fn rule_variable_fn<'a, 'b>(parser: &'a mut Parser<'b>, can_assign: bool) {
    parser.rule_variable(can_assign);
}

fn rule_literal_fn<'a, 'b>(parser: &'a mut Parser<'b>, can_assign: bool) {
    parser.rule_literal(can_assign);
}

fn rule_self_fn<'a, 'b>(parser: &'a mut Parser<'b>, can_assign: bool) {
    parser.rule_self(can_assign);
}

fn rule_parent_fn<'a, 'b>(parser: &'a mut Parser<'b>, can_assign: bool) {
    parser.rule_parent(can_assign);
}

fn rule_call_fn<'a, 'b, 'c>(parser: &'a mut Parser<'b>, previous: Token<'c>, can_assign: bool) {
    parser.rule_call(previous, can_assign);
}

fn rule_indexing_fn<'a, 'b, 'c>(parser: &'a mut Parser<'b>, previous: Token<'c>, can_assign: bool) {
    parser.rule_indexing(previous, can_assign);
}

fn rule_dot_fn<'a, 'b, 'c>(parser: &'a mut Parser<'b>, previous: Token<'c>, can_assign: bool) {
    parser.rule_dot(previous, can_assign);
}

fn rule_binary_fn<'a, 'b, 'c>(parser: &'a mut Parser<'b>, previous: Token<'c>, can_assign: bool) {
    parser.rule_binary(previous, can_assign);
}

fn rule_and_fn<'a, 'b, 'c>(parser: &'a mut Parser<'b>, previous: Token<'c>, can_assign: bool) {
    parser.rule_and(previous, can_assign);
}

fn rule_or_fn<'a, 'b, 'c>(parser: &'a mut Parser<'b>, previous: Token<'c>, can_assign: bool) {
    parser.rule_or(previous, can_assign);
}

fn rule_conditional_fn<'a, 'b, 'c>(parser: &'a mut Parser<'b>, previous: Token<'c>, can_assign: bool) {
    parser.rule_conditional(previous, can_assign);
}

fn precedence_of(kind: TokenKind) -> Precedence {
    use TokenKind::*;
    match kind {
        LParen | LBracket | Dot => Precedence::Call,
        Star | Slash | Percent | Pow | Floor => Precedence::Factor,
        Plus | Minus => Precedence::Term,
        Range => Precedence::Range,
        LShift | RShift => Precedence::Shift,
        Amp => Precedence::BitAnd,
        Caret => Precedence::BitXor,
        Bar => Precedence::BitOr,
        Less | LessEq | Greater | GreaterEq => Precedence::Comparison,
        EqualEq | BangEq => Precedence::Equality,
        And => Precedence::And,
        Or => Precedence::Or,
        Question => Precedence::Conditional,
        _ => Precedence::None,
    }
}

// ---------------------------------------------------------------------------
// Literal parsing
// ---------------------------------------------------------------------------

/// Parse a number literal: decimal, binary (`0b`), octal (`0c`), hex
/// (`0x`), or floating point with optional exponent.
fn parse_number(lexeme: &str) -> Option<f64> {
    let bytes = lexeme.as_bytes();
    if bytes.len() > 2 && bytes[0] == b'0' {
        let digits = &lexeme[2..];
        match bytes[1] {
            b'b' | b'B' => return i64::from_str_radix(digits, 2).ok().map(|n| n as f64),
            b'c' | b'C' => return i64::from_str_radix(digits, 8).ok().map(|n| n as f64),
            b'x' | b'X' => return i64::from_str_radix(digits, 16).ok().map(|n| n as f64),
            _ => {}
        }
    }
    lexeme.parse::<f64>().ok()
}

/// Strip the quotes from a string token and process escapes.
fn unescape_string(lexeme: &str) -> String {
    // The first and last byte are the delimiters (for interpolation
    // segments, `}` and the quote play that role).
    let inner = &lexeme[1..lexeme.len().saturating_sub(1)];
    let mut out = String::with_capacity(inner.len());
    let mut chars = inner.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('0') => out.push('\0'),
            Some('$') => out.push('$'),
            Some('\'') => out.push('\''),
            Some('"') => out.push('"'),
            Some('\\') => out.push('\\'),
            Some('a') => out.push('\x07'),
            Some('b') => out.push('\x08'),
            Some('f') => out.push('\x0c'),
            Some('n') => out.push('\n'),
            Some('r') => out.push('\r'),
            Some('t') => out.push('\t'),
            Some('v') => out.push('\x0b'),
            Some('x') => {
                let hi = chars.next().and_then(|c| c.to_digit(16));
                let lo = chars.next().and_then(|c| c.to_digit(16));
                if let (Some(hi), Some(lo)) = (hi, lo) {
                    out.push(char::from((hi * 16 + lo) as u8));
                }
            }
            Some('u') => {
                let mut code = 0u32;
                let mut ok = true;
                for _ in 0..4 {
                    match chars.next().and_then(|c| c.to_digit(16)) {
                        Some(d) => code = code * 16 + d,
                        None => {
                            ok = false;
                            break;
                        }
                    }
                }
                if ok {
                    if let Some(c) = char::from_u32(code) {
                        out.push(c);
                    }
                }
            }
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
    use crate::heap::ModuleObj;

    fn compile_source(source: &str) -> Result<(Heap, ObjRef)> {
        let mut heap = Heap::new();
        let module = heap.alloc(Obj::Module(ModuleObj {
            name: "<test>".to_string(),
            file: "<test>".to_string(),
            values: Table::new(),
            preloader: None,
            unloader: None,
            imported: false,
        }));
        let options = CompileOptions::default();
        let function = compile(&mut heap, source, module, &options)?;
        Ok((heap, function))
    }

    #[test]
    fn compiles_simple_expression() {
        let (heap, function) = compile_source("echo 1 + 2\n").unwrap();
        let function = heap.function(function);
        assert!(!function.blob.is_empty());
        assert_eq!(function.arity, 0);
        assert_eq!(function.kind, FunctionKind::Script);
    }

    #[test]
    fn number_literal_radixes() {
        assert_eq!(parse_number("0b101"), Some(5.0));
        assert_eq!(parse_number("0c17"), Some(15.0));
        assert_eq!(parse_number("0xff"), Some(255.0));
        assert_eq!(parse_number("2.5e2"), Some(250.0));
    }

    #[test]
    fn unescape_handles_common_escapes() {
        assert_eq!(unescape_string("'a\\nb'"), "a\nb");
        assert_eq!(unescape_string("\"\\x41\""), "A");
        assert_eq!(unescape_string("'\\u00e9'"), "é");
    }

    #[test]
    fn break_outside_loop_is_an_error() {
        assert!(compile_source("break\n").is_err());
    }

    #[test]
    fn return_at_top_level_is_an_error() {
        assert!(compile_source("return 1\n").is_err());
    }

    #[test]
    fn try_requires_catch_or_finally() {
        assert!(compile_source("try { echo 1 }\n").is_err());
        assert!(compile_source("try { echo 1 } finally { echo 2 }\n").is_ok());
    }

    #[test]
    fn closures_record_upvalues() {
        let (heap, script) = compile_source(
            "var mk = |x| { return || { x = x + 1; return x } }\n",
        )
        .unwrap();
        // The outer anonymous function is a constant of the script blob;
        // the inner one is a constant of the outer blob.
        let script = heap.function(script);
        let outer = script
            .blob
            .constants
            .iter()
            .filter_map(|v| v.as_obj())
            .find(|r| matches!(heap.get(*r), Obj::Function(_)))
            .expect("outer function constant");
        let inner = heap
            .function(outer)
            .blob
            .constants
            .iter()
            .filter_map(|v| v.as_obj())
            .find(|r| matches!(heap.get(*r), Obj::Function(_)))
            .expect("inner function constant");
        assert_eq!(heap.function(outer).upvalue_count, 0);
        assert_eq!(heap.function(inner).upvalue_count, 1);
    }

    #[test]
    fn variadic_function_binds_args_local() {
        let (heap, script) = compile_source("def sum(...) { return 0 }\n").unwrap();
        let script = heap.function(script);
        let function = script
            .blob
            .constants
            .iter()
            .filter_map(|v| v.as_obj())
            .find(|r| matches!(heap.get(*r), Obj::Function(_)))
            .expect("function constant");
        let function = heap.function(function);
        assert!(function.is_variadic);
        assert_eq!(function.arity, 1);
    }

    #[test]
    fn using_builds_a_switch_constant() {
        let (heap, script) = compile_source(
            "using 2 {\nwhen 1: echo \"one\"\nwhen 2, 3: echo \"some\"\ndefault: echo \"other\"\n}\n",
        )
        .unwrap();
        let script = heap.function(script);
        let switch = script
            .blob
            .constants
            .iter()
            .filter_map(|v| v.as_obj())
            .find(|r| matches!(heap.get(*r), Obj::Switch(_)))
            .expect("switch constant");
        let switch = heap.switch(switch);
        assert_eq!(switch.table.len(), 3);
        assert!(switch.default_jump >= 0);
        assert!(switch.exit_jump >= 0);
    }
}
