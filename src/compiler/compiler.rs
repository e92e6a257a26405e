use std::borrow::Cow;

use colored::*;
use thiserror::Error;

use super::scanner::{Scanner, ScannerError};
use super::token::{Token, TokenKind};
use crate::debug::{self, LOG_COMPILED_CODE, LOG_COMPILER};
use crate::memory::{Function, Gc, Object, GC};
use crate::vm::{instruction::OpCode, value::Value};

#[derive(Debug, Clone, Error)]
pub enum CompileError {
    #[error("Aborting compilation after {} error(s)", .0.len())]
    Multiple(Vec<CompileError>),

    #[error(transparent)]
    Scanner(#[from] ScannerError),

    #[error("[line {line}] Error{at}: {message}")]
    Parse {
        message: Cow<'static, str>,
        at: String,
        line: u64,
    },

    #[error("Error parsing number: {0}")]
    ParseFloat(#[from] std::num::ParseFloatError),

    #[error("Ran out of tokens while parsing")]
    TokenNotFound,
}

type Result<T> = std::result::Result<T, CompileError>;

/// What kind of function body is being compiled; decides the shape of the
/// implicit return and which slot-zero binding exists.
#[derive(Debug, Copy, Clone, PartialEq)]
pub enum FunctionKind {
    Script,
    Function,
    Method,
    Initializer,
}

/// The name of the receiver binding reserved in slot 0 of method and
/// initializer frames. The `this` keyword compiles into a lookup of it.
const RECEIVER_NAME: &str = "ego";

/// The name of the hidden local holding the superclass while a subclass
/// body compiles. `super` expressions resolve it like any other variable.
const SUPERCLASS_NAME: &str = "super";

#[derive(Debug)]
struct Local {
    name: String,

    /// Scope nesting level, or -1 while the initializer is still running.
    depth: i64,

    /// Set when a closure captures this local, so leaving the scope emits
    /// CloseUpvalue instead of Pop.
    is_captured: bool,
}

#[derive(Debug)]
struct Upvalue {
    index: u8,
    is_local: bool,
}

/// How `resolve_local` found (or did not find) a name.
enum Resolution {
    Slot(u8),
    Uninitialized,
    NotFound,
}

/// Per-function compiler state. The active chain lives in `GC::functions`
/// so a collection triggered mid-compile can reach every constant emitted
/// so far.
#[derive(Debug)]
pub struct FunctionState {
    pub function: Function,
    kind: FunctionKind,
    locals: Vec<Local>,
    scope_depth: i64,
    upvalues: Vec<Upvalue>,
}

impl FunctionState {
    fn script() -> Self {
        Self::with_function(Function::script(), FunctionKind::Script)
    }

    fn new(name: Gc<Object>, kind: FunctionKind) -> Self {
        Self::with_function(Function::named(name), kind)
    }

    fn with_function(function: Function, kind: FunctionKind) -> Self {
        let slot_zero = match kind {
            FunctionKind::Method | FunctionKind::Initializer => RECEIVER_NAME,
            _ => "",
        };
        Self {
            function,
            kind,
            // Slot 0 belongs to the callee (or the receiver in methods).
            locals: vec![Local {
                name: slot_zero.to_owned(),
                depth: 0,
                is_captured: false,
            }],
            scope_depth: 0,
            upvalues: Vec::new(),
        }
    }

    fn emit_raw(&mut self, byte: u8, line: u64) {
        if LOG_COMPILER {
            println!("{}\temit byte {}", "[COMPILER]".blue().bold(), byte);
        }
        self.function.chunk.write_byte(byte, line);
    }

    fn emit(&mut self, op_code: OpCode, line: u64) {
        if LOG_COMPILER {
            println!("{}\temit {}", "[COMPILER]".blue().bold(), op_code);
        }
        self.function.chunk.write(op_code, line);
    }

    fn emit_index(&mut self, op_code: OpCode, index: u8, line: u64) {
        if LOG_COMPILER {
            println!(
                "{}\temit {} {}",
                "[COMPILER]".blue().bold(),
                op_code,
                index
            );
        }
        self.function.chunk.write_index(op_code, index, line);
    }

    /// Implicit return: initializers hand back the receiver, everything
    /// else returns nil.
    fn emit_return(&mut self, line: u64) {
        match self.kind {
            FunctionKind::Initializer => self.emit_index(OpCode::GetLocal, 0, line),
            _ => self.emit(OpCode::Nil, line),
        }
        self.emit(OpCode::Return, line);
    }

    /// Emits a forward jump with a placeholder offset and returns the
    /// position to patch once the target is known.
    fn emit_jump(&mut self, op_code: OpCode, line: u64) -> usize {
        self.emit(op_code, line);
        self.emit_raw(0xff, line);
        self.emit_raw(0xff, line);
        self.function.chunk.code.len() - 2
    }

    /// Patches a forward jump to land after the last emitted byte. Returns
    /// false when the distance overflows the 16-bit operand.
    fn patch_jump(&mut self, offset: usize) -> bool {
        // -2 accounts for the operand bytes themselves.
        let jump = self.function.chunk.code.len() - offset - 2;
        if jump > u16::MAX as usize {
            return false;
        }
        self.function.chunk.code[offset] = (jump >> 8) as u8;
        self.function.chunk.code[offset + 1] = (jump & 0xff) as u8;
        true
    }

    /// Emits a backward jump to `loop_start`. Returns false when the
    /// distance overflows the 16-bit operand.
    fn emit_loop(&mut self, loop_start: usize, line: u64) -> bool {
        self.emit(OpCode::Loop, line);
        // +2 skips over the operand of the Loop instruction itself.
        let offset = self.function.chunk.code.len() - loop_start + 2;
        if offset > u16::MAX as usize {
            return false;
        }
        self.emit_raw((offset >> 8) as u8, line);
        self.emit_raw((offset & 0xff) as u8, line);
        true
    }

    fn resolve_local(&self, name: &str) -> Resolution {
        for (i, local) in self.locals.iter().enumerate().rev() {
            if local.name == name {
                if local.depth == -1 {
                    return Resolution::Uninitialized;
                }
                return Resolution::Slot(i as u8);
            }
        }
        Resolution::NotFound
    }

    /// Registers an upvalue, reusing an existing record for the same
    /// target. Returns None when the function already captures 256.
    fn add_upvalue(&mut self, index: u8, is_local: bool) -> Option<u8> {
        for (i, upvalue) in self.upvalues.iter().enumerate() {
            if upvalue.index == index && upvalue.is_local == is_local {
                return Some(i as u8);
            }
        }
        if self.upvalues.len() > u8::MAX as usize {
            return None;
        }
        self.upvalues.push(Upvalue { index, is_local });
        self.function.upvalue_count = self.upvalues.len();
        Some((self.upvalues.len() - 1) as u8)
    }

    fn mark_initialized(&mut self) {
        if self.scope_depth == 0 {
            return;
        }
        if let Some(local) = self.locals.last_mut() {
            local.depth = self.scope_depth;
        }
    }
}

/// Precedence levels from lowest to highest; the derived order is what the
/// Pratt loop compares against.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum Precedence {
    None,
    Assignment, // =
    Or,         // or
    And,        // and
    Equality,   // == !=
    Comparison, // < > <= >=
    Term,       // + -
    Factor,     // * /
    Unary,      // ! -
    Call,       // . ()
    Primary,
}

impl Precedence {
    fn higher(&self) -> Precedence {
        match self {
            Precedence::None => Precedence::Assignment,
            Precedence::Assignment => Precedence::Or,
            Precedence::Or => Precedence::And,
            Precedence::And => Precedence::Equality,
            Precedence::Equality => Precedence::Comparison,
            Precedence::Comparison => Precedence::Term,
            Precedence::Term => Precedence::Factor,
            Precedence::Factor => Precedence::Unary,
            Precedence::Unary => Precedence::Call,
            Precedence::Call => Precedence::Primary,
            Precedence::Primary => Precedence::Primary,
        }
    }
}

/// Identifier of a parse handler. The table stores these instead of
/// function pointers; `run_prefix`/`run_infix` resolve them with a match,
/// which keeps the dispatch table a plain const.
#[derive(Debug, Clone, Copy, PartialEq)]
enum Handler {
    None,
    Grouping,
    Call,
    Dot,
    Unary,
    Binary,
    Variable,
    String,
    Number,
    And,
    Or,
    Literal,
    Super,
    This,
}

#[derive(Debug, Clone, Copy)]
struct ParseRule {
    prefix: Handler,
    infix: Handler,
    precedence: Precedence,
}

const fn rule(prefix: Handler, infix: Handler, precedence: Precedence) -> ParseRule {
    ParseRule {
        prefix,
        infix,
        precedence,
    }
}

/// Indexed by `TokenKind as usize`; the order matches the TokenKind
/// declaration.
#[rustfmt::skip]
const RULES_TABLE: [ParseRule; 39] = [
    rule(Handler::Grouping, Handler::Call,   Precedence::Call),       // ParenLeft
    rule(Handler::None,     Handler::None,   Precedence::None),       // ParenRight
    rule(Handler::None,     Handler::None,   Precedence::None),       // BraceLeft
    rule(Handler::None,     Handler::None,   Precedence::None),       // BraceRight
    rule(Handler::None,     Handler::None,   Precedence::None),       // Comma
    rule(Handler::None,     Handler::Dot,    Precedence::Call),       // Dot
    rule(Handler::Unary,    Handler::Binary, Precedence::Term),       // Minus
    rule(Handler::None,     Handler::Binary, Precedence::Term),       // Plus
    rule(Handler::None,     Handler::None,   Precedence::None),       // Semicolon
    rule(Handler::None,     Handler::Binary, Precedence::Factor),     // Slash
    rule(Handler::None,     Handler::Binary, Precedence::Factor),     // Star
    rule(Handler::Unary,    Handler::None,   Precedence::None),       // Bang
    rule(Handler::None,     Handler::Binary, Precedence::Equality),   // BangEqual
    rule(Handler::None,     Handler::None,   Precedence::None),       // Equal
    rule(Handler::None,     Handler::Binary, Precedence::Equality),   // EqualEqual
    rule(Handler::None,     Handler::Binary, Precedence::Comparison), // Greater
    rule(Handler::None,     Handler::Binary, Precedence::Comparison), // GreaterEqual
    rule(Handler::None,     Handler::Binary, Precedence::Comparison), // Less
    rule(Handler::None,     Handler::Binary, Precedence::Comparison), // LessEqual
    rule(Handler::Variable, Handler::None,   Precedence::None),       // Identifier
    rule(Handler::String,   Handler::None,   Precedence::None),       // String
    rule(Handler::Number,   Handler::None,   Precedence::None),       // Number
    rule(Handler::None,     Handler::And,    Precedence::And),        // And
    rule(Handler::None,     Handler::None,   Precedence::None),       // Class
    rule(Handler::None,     Handler::None,   Precedence::None),       // Else
    rule(Handler::Literal,  Handler::None,   Precedence::None),       // False
    rule(Handler::None,     Handler::None,   Precedence::None),       // For
    rule(Handler::None,     Handler::None,   Precedence::None),       // Fun
    rule(Handler::None,     Handler::None,   Precedence::None),       // If
    rule(Handler::Literal,  Handler::None,   Precedence::None),       // Nil
    rule(Handler::None,     Handler::Or,     Precedence::Or),         // Or
    rule(Handler::None,     Handler::None,   Precedence::None),       // Print
    rule(Handler::None,     Handler::None,   Precedence::None),       // Return
    rule(Handler::Super,    Handler::None,   Precedence::None),       // Super
    rule(Handler::This,     Handler::None,   Precedence::None),       // This
    rule(Handler::Literal,  Handler::None,   Precedence::None),       // True
    rule(Handler::None,     Handler::None,   Precedence::None),       // Var
    rule(Handler::None,     Handler::None,   Precedence::None),       // While
    rule(Handler::None,     Handler::None,   Precedence::None),       // EOF
];

fn rule_for(kind: TokenKind) -> ParseRule {
    RULES_TABLE[kind as usize]
}

struct Parser {
    current: Option<Token>,
    previous: Option<Token>,
}

impl Parser {
    fn new() -> Self {
        Self {
            current: None,
            previous: None,
        }
    }
}

/// Per-class compiler state, stacked for nested class declarations.
struct ClassState {
    has_superclass: bool,
}

/// Single pass compiler: parses the token stream with a Pratt parser and
/// emits bytecode as it goes. Nested functions push a fresh
/// `FunctionState` onto the chain in `GC::functions`.
pub struct Compiler<'src> {
    scanner: Scanner<'src>,
    parser: Parser,
    gc: &'src mut GC,
    class_states: Vec<ClassState>,
    errors: Vec<CompileError>,
}

impl<'src> Compiler<'src> {
    pub fn new(source: &'src str, gc: &'src mut GC) -> Self {
        Self {
            scanner: Scanner::new(source),
            parser: Parser::new(),
            gc,
            class_states: Vec::new(),
            errors: Vec::new(),
        }
    }

    /// Compiles the whole source into the top-level script function and
    /// returns it already tracked by the collector, so the caller can root
    /// it before the next allocation. Succeeds only when no errors were
    /// recorded along the way.
    pub fn compile(mut self) -> Result<Gc<Object>> {
        self.advance();
        self.gc.functions.push(FunctionState::script());

        loop {
            match self.match_token(TokenKind::EOF) {
                Ok(true) => break,
                Ok(false) => self.declaration(),
                Err(err) => {
                    self.errors.push(err);
                    break;
                }
            }
        }

        let line = self.line();
        self.state_mut().emit_return(line);
        // Track while the state chain still roots the script's constants.
        let function = self.gc.track_function(self.state().function.clone());
        let state = self.gc.functions.pop().unwrap();

        if !self.errors.is_empty() {
            Err(CompileError::Multiple(self.errors))
        } else {
            if LOG_COMPILED_CODE {
                debug::disassemble_chunk(&state.function.chunk, state.function.name());
            }
            Ok(function)
        }
    }

    // The compiler pushes one state per function nesting level and pops it
    // when that level ends, so the chain is never empty inside compile().
    fn state(&self) -> &FunctionState {
        self.gc.functions.last().unwrap()
    }

    fn state_mut(&mut self) -> &mut FunctionState {
        self.gc.functions.last_mut().unwrap()
    }

    fn current(&self) -> Result<&Token> {
        self.parser.current.as_ref().ok_or(CompileError::TokenNotFound)
    }

    fn previous(&self) -> Result<&Token> {
        self.parser.previous.as_ref().ok_or(CompileError::TokenNotFound)
    }

    fn line(&self) -> u64 {
        self.parser.previous.as_ref().map(|token| token.line).unwrap_or(1)
    }

    fn error_at(token: Option<&Token>, message: impl Into<Cow<'static, str>>) -> CompileError {
        let (at, line) = match token {
            Some(token) if token.kind == TokenKind::EOF => (" at end".to_owned(), token.line),
            Some(token) => (format!(" at '{}'", token.data), token.line),
            None => (String::new(), 0),
        };
        CompileError::Parse {
            message: message.into(),
            at,
            line,
        }
    }

    fn error_at_previous(&self, message: impl Into<Cow<'static, str>>) -> CompileError {
        Self::error_at(self.parser.previous.as_ref(), message)
    }

    fn error_at_current(&self, message: impl Into<Cow<'static, str>>) -> CompileError {
        Self::error_at(self.parser.current.as_ref(), message)
    }

    /// Moves to the next token, recording (but skipping past) scan errors.
    fn advance(&mut self) {
        std::mem::swap(&mut self.parser.previous, &mut self.parser.current);

        loop {
            match self.scanner.scan_token() {
                Ok(token) => {
                    if LOG_COMPILER {
                        println!("{}\tadvance {:?}", "[COMPILER]".blue(), token);
                    }
                    self.parser.current = Some(token);
                    return;
                }
                Err(err) => {
                    let err = CompileError::from(err);
                    eprintln!("{}", err);
                    self.errors.push(err);
                }
            }
        }
    }

    fn check(&self, kind: TokenKind) -> Result<bool> {
        Ok(self.current()?.kind == kind)
    }

    fn match_token(&mut self, kind: TokenKind) -> Result<bool> {
        if self.check(kind)? {
            self.advance();
            Ok(true)
        } else {
            Ok(false)
        }
    }

    fn consume(&mut self, expected: TokenKind, message: &'static str) -> Result<()> {
        if self.check(expected)? {
            self.advance();
            Ok(())
        } else {
            Err(self.error_at_current(message))
        }
    }

    /// Skips tokens until something that looks like a statement boundary,
    /// so one error does not cascade into a pile of bogus ones.
    fn synchronize(&mut self) {
        loop {
            if matches!(&self.parser.previous, Some(token) if token.kind == TokenKind::Semicolon) {
                return;
            }
            match &self.parser.current {
                None => return,
                Some(token) => match token.kind {
                    TokenKind::EOF
                    | TokenKind::Class
                    | TokenKind::Fun
                    | TokenKind::Var
                    | TokenKind::For
                    | TokenKind::If
                    | TokenKind::While
                    | TokenKind::Print
                    | TokenKind::Return => return,
                    _ => {}
                },
            }
            self.advance();
        }
    }

    /// Declaration boundary: errors are reported here and the parser
    /// resynchronizes instead of giving up.
    fn declaration(&mut self) {
        if let Err(err) = self.declaration_inner() {
            eprintln!("{}", err);
            self.errors.push(err);
            self.synchronize();
        }
    }

    fn declaration_inner(&mut self) -> Result<()> {
        if self.match_token(TokenKind::Class)? {
            self.class_declaration()
        } else if self.match_token(TokenKind::Fun)? {
            self.fun_declaration()
        } else if self.match_token(TokenKind::Var)? {
            self.var_declaration()
        } else {
            self.statement()
        }
    }

    fn class_declaration(&mut self) -> Result<()> {
        self.consume(TokenKind::Identifier, "Expect class name.")?;
        let class_name = self.previous()?.data.clone();
        let name_constant = self.identifier_constant(class_name.clone())?;
        self.declare_variable()?;
        self.emit_index(OpCode::Class, name_constant);
        self.define_variable(name_constant);

        self.class_states.push(ClassState {
            has_superclass: false,
        });
        let result = self.class_body(&class_name);
        let class_state = self.class_states.pop();

        if result.is_ok() {
            if let Some(class_state) = class_state {
                if class_state.has_superclass {
                    self.scope_leave();
                }
            }
        }
        result
    }

    fn class_body(&mut self, class_name: &str) -> Result<()> {
        if self.match_token(TokenKind::Less)? {
            self.consume(TokenKind::Identifier, "Expect superclass name.")?;
            let superclass_name = self.previous()?.data.clone();
            if superclass_name == class_name {
                return Err(self.error_at_previous("A class can't inherit from itself."));
            }
            self.named_variable(&superclass_name, false)?;

            // The superclass lives in a hidden local so that methods can
            // close over it for super dispatch.
            self.scope_enter();
            self.add_local(SUPERCLASS_NAME.to_owned())?;
            self.define_variable(0);

            self.named_variable(class_name, false)?;
            self.emit(OpCode::Inherit);
            self.class_states.last_mut().unwrap().has_superclass = true;
        }

        // Leave the class on the stack while methods are installed.
        self.named_variable(class_name, false)?;
        self.consume(TokenKind::BraceLeft, "Expect '{' before class body.")?;
        while !self.check(TokenKind::BraceRight)? && !self.check(TokenKind::EOF)? {
            self.method()?;
        }
        self.consume(TokenKind::BraceRight, "Expect '}' after class body.")?;
        self.emit(OpCode::Pop);
        Ok(())
    }

    fn method(&mut self) -> Result<()> {
        self.consume(TokenKind::Identifier, "Expect method name.")?;
        let name = self.previous()?.data.clone();
        let constant = self.identifier_constant(name.clone())?;
        let kind = if name == "init" {
            FunctionKind::Initializer
        } else {
            FunctionKind::Method
        };
        self.function(kind)?;
        self.emit_index(OpCode::Method, constant);
        Ok(())
    }

    fn fun_declaration(&mut self) -> Result<()> {
        let global = self.parse_variable("Expect function name.")?;
        // Initialized right away so the function can call itself.
        self.state_mut().mark_initialized();
        self.function(FunctionKind::Function)?;
        self.define_variable(global);
        Ok(())
    }

    fn function(&mut self, kind: FunctionKind) -> Result<()> {
        let state = {
            let name = self.previous()?.data.clone();
            let name = self.gc.track_string(name);
            FunctionState::new(name, kind)
        };
        self.gc.functions.push(state);

        let body = self.function_body();

        // Track the finished function while the state still roots its
        // constants, then drop the state.
        let function = self.gc.track_function(self.state().function.clone());
        let state = self.gc.functions.pop().unwrap();
        body?;

        let index = self.make_constant(function.into())?;
        self.emit_index(OpCode::Closure, index);
        let line = self.line();
        for upvalue in state.upvalues.iter() {
            let is_local = if upvalue.is_local { 1 } else { 0 };
            self.state_mut().emit_raw(is_local, line);
            self.state_mut().emit_raw(upvalue.index, line);
        }
        Ok(())
    }

    fn function_body(&mut self) -> Result<()> {
        self.scope_enter();

        self.consume(TokenKind::ParenLeft, "Expect '(' after function name.")?;
        if !self.check(TokenKind::ParenRight)? {
            loop {
                self.state_mut().function.arity += 1;
                if self.state().function.arity > 255 {
                    return Err(self.error_at_current("Can't have more than 255 parameters."));
                }
                let constant = self.parse_variable("Expect parameter name.")?;
                self.define_variable(constant);
                if !self.match_token(TokenKind::Comma)? {
                    break;
                }
            }
        }
        self.consume(TokenKind::ParenRight, "Expect ')' after parameters.")?;

        self.consume(TokenKind::BraceLeft, "Expect '{' before function body.")?;
        self.block()?;

        let line = self.line();
        self.state_mut().emit_return(line);

        if LOG_COMPILED_CODE {
            debug::disassemble_chunk(&self.state().function.chunk, self.state().function.name());
        }
        Ok(())
    }

    fn var_declaration(&mut self) -> Result<()> {
        let global = self.parse_variable("Expect variable name.")?;

        if self.match_token(TokenKind::Equal)? {
            self.expression()?;
        } else {
            self.emit(OpCode::Nil);
        }
        self.consume(TokenKind::Semicolon, "Expect ';' after variable declaration.")?;

        self.define_variable(global);
        Ok(())
    }

    fn parse_variable(&mut self, error_message: &'static str) -> Result<u8> {
        self.consume(TokenKind::Identifier, error_message)?;

        self.declare_variable()?;
        if self.state().scope_depth > 0 {
            return Ok(0);
        }

        let name = self.previous()?.data.clone();
        self.identifier_constant(name)
    }

    fn declare_variable(&mut self) -> Result<()> {
        // Globals are implicitly declared.
        if self.state().scope_depth == 0 {
            return Ok(());
        }

        let name = self.previous()?.data.clone();
        let state = self.state();
        for local in state.locals.iter().rev() {
            if local.depth != -1 && local.depth < state.scope_depth {
                break;
            }
            if local.name == name {
                return Err(
                    self.error_at_previous("Already a variable with this name in this scope.")
                );
            }
        }

        self.add_local(name)
    }

    fn add_local(&mut self, name: String) -> Result<()> {
        if self.state().locals.len() > u8::MAX as usize {
            return Err(self.error_at_previous("Too many local variables in function."));
        }
        self.state_mut().locals.push(Local {
            name,
            depth: -1,
            is_captured: false,
        });
        Ok(())
    }

    fn define_variable(&mut self, index: u8) {
        if self.state().scope_depth > 0 {
            self.state_mut().mark_initialized();
            return;
        }
        self.emit_index(OpCode::DefineGlobal, index);
    }

    fn identifier_constant(&mut self, name: String) -> Result<u8> {
        let string = self.gc.track_string(name);
        self.make_constant(string.into())
    }

    fn make_constant(&mut self, constant: Value) -> Result<u8> {
        // Keep the constant reachable while the pool grows.
        self.gc.stack.push(constant.clone());
        let index = self.state_mut().function.chunk.add_constant(constant);
        self.gc.stack.pop();

        if index > u8::MAX as usize {
            return Err(self.error_at_previous("Too many constants in one chunk."));
        }
        Ok(index as u8)
    }

    fn resolve_local_current(&self, name: &str) -> Result<Option<u8>> {
        match self.state().resolve_local(name) {
            Resolution::Slot(slot) => Ok(Some(slot)),
            Resolution::Uninitialized => {
                Err(self.error_at_previous("Can't read local variable in its own initializer."))
            }
            Resolution::NotFound => Ok(None),
        }
    }

    /// Resolves `name` as an upvalue of the function at `state_index` by
    /// searching the enclosing functions, marking captured locals and
    /// threading upvalue records down the chain.
    fn resolve_upvalue(&mut self, state_index: usize, name: &str) -> Result<Option<u8>> {
        if state_index == 0 {
            return Ok(None);
        }
        let enclosing = state_index - 1;

        match self.gc.functions[enclosing].resolve_local(name) {
            Resolution::Slot(slot) => {
                self.gc.functions[enclosing].locals[slot as usize].is_captured = true;
                match self.gc.functions[state_index].add_upvalue(slot, true) {
                    Some(index) => Ok(Some(index)),
                    None => {
                        Err(self.error_at_previous("Too many closure variables in function."))
                    }
                }
            }
            Resolution::Uninitialized => {
                Err(self.error_at_previous("Can't read local variable in its own initializer."))
            }
            Resolution::NotFound => match self.resolve_upvalue(enclosing, name)? {
                Some(upvalue_index) => {
                    match self.gc.functions[state_index].add_upvalue(upvalue_index, false) {
                        Some(index) => Ok(Some(index)),
                        None => Err(
                            self.error_at_previous("Too many closure variables in function.")
                        ),
                    }
                }
                None => Ok(None),
            },
        }
    }

    fn named_variable(&mut self, name: &str, can_assign: bool) -> Result<()> {
        let (arg, get_op, set_op) = match self.resolve_local_current(name)? {
            Some(slot) => (slot, OpCode::GetLocal, OpCode::SetLocal),
            None => match self.resolve_upvalue(self.gc.functions.len() - 1, name)? {
                Some(index) => (index, OpCode::GetUpvalue, OpCode::SetUpvalue),
                None => (
                    self.identifier_constant(name.to_owned())?,
                    OpCode::GetGlobal,
                    OpCode::SetGlobal,
                ),
            },
        };

        if can_assign && self.match_token(TokenKind::Equal)? {
            self.expression()?;
            self.emit_index(set_op, arg);
        } else {
            self.emit_index(get_op, arg);
        }
        Ok(())
    }

    fn statement(&mut self) -> Result<()> {
        if self.match_token(TokenKind::Print)? {
            self.print_statement()
        } else if self.match_token(TokenKind::If)? {
            self.if_statement()
        } else if self.match_token(TokenKind::Return)? {
            self.return_statement()
        } else if self.match_token(TokenKind::While)? {
            self.while_statement()
        } else if self.match_token(TokenKind::For)? {
            self.for_statement()
        } else if self.match_token(TokenKind::BraceLeft)? {
            self.scope_enter();
            let result = self.block();
            self.scope_leave();
            result
        } else {
            self.expression_statement()
        }
    }

    fn print_statement(&mut self) -> Result<()> {
        self.expression()?;
        self.consume(TokenKind::Semicolon, "Expect ';' after value.")?;
        self.emit(OpCode::Print);
        Ok(())
    }

    fn return_statement(&mut self) -> Result<()> {
        if self.state().kind == FunctionKind::Script {
            return Err(self.error_at_previous("Can't return from top-level code."));
        }

        if self.match_token(TokenKind::Semicolon)? {
            let line = self.line();
            self.state_mut().emit_return(line);
            Ok(())
        } else {
            if self.state().kind == FunctionKind::Initializer {
                return Err(self.error_at_previous("Can't return a value from an initializer."));
            }
            self.expression()?;
            self.consume(TokenKind::Semicolon, "Expect ';' after return value.")?;
            self.emit(OpCode::Return);
            Ok(())
        }
    }

    fn if_statement(&mut self) -> Result<()> {
        self.consume(TokenKind::ParenLeft, "Expect '(' after 'if'.")?;
        self.expression()?;
        self.consume(TokenKind::ParenRight, "Expect ')' after condition.")?;

        let then_jump = self.emit_jump(OpCode::JumpIfFalse);
        self.emit(OpCode::Pop); // Condition, when it was truthy.
        self.statement()?;
        let else_jump = self.emit_jump(OpCode::Jump);

        self.patch_jump(then_jump)?;
        self.emit(OpCode::Pop); // Condition, when it was falsy.

        if self.match_token(TokenKind::Else)? {
            self.statement()?;
        }
        self.patch_jump(else_jump)
    }

    fn while_statement(&mut self) -> Result<()> {
        let loop_start = self.state().function.chunk.code.len();

        self.consume(TokenKind::ParenLeft, "Expect '(' after 'while'.")?;
        self.expression()?;
        self.consume(TokenKind::ParenRight, "Expect ')' after condition.")?;

        let exit_jump = self.emit_jump(OpCode::JumpIfFalse);
        self.emit(OpCode::Pop);

        self.statement()?;
        self.emit_loop(loop_start)?;

        self.patch_jump(exit_jump)?;
        self.emit(OpCode::Pop);
        Ok(())
    }

    fn for_statement(&mut self) -> Result<()> {
        self.scope_enter();
        let result = self.for_statement_inner();
        self.scope_leave();
        result
    }

    fn for_statement_inner(&mut self) -> Result<()> {
        self.consume(TokenKind::ParenLeft, "Expect '(' after 'for'.")?;

        // Initializer clause.
        if self.match_token(TokenKind::Semicolon)? {
            // No initializer.
        } else if self.match_token(TokenKind::Var)? {
            self.var_declaration()?;
        } else {
            self.expression_statement()?;
        }

        // Condition clause.
        let mut loop_start = self.state().function.chunk.code.len();
        let exit_jump = if self.match_token(TokenKind::Semicolon)? {
            None
        } else {
            self.expression()?;
            self.consume(TokenKind::Semicolon, "Expect ';' after loop condition.")?;

            let exit_jump = self.emit_jump(OpCode::JumpIfFalse);
            self.emit(OpCode::Pop);
            Some(exit_jump)
        };

        // Increment clause. It textually precedes the body but runs after
        // it, so jump over it into the body and loop back through it.
        if !self.match_token(TokenKind::ParenRight)? {
            let body_jump = self.emit_jump(OpCode::Jump);
            let increment_start = self.state().function.chunk.code.len();

            self.expression()?;
            self.emit(OpCode::Pop);
            self.consume(TokenKind::ParenRight, "Expect ')' after for clauses.")?;

            self.emit_loop(loop_start)?;
            loop_start = increment_start;
            self.patch_jump(body_jump)?;
        }

        self.statement()?;
        self.emit_loop(loop_start)?;

        if let Some(exit_jump) = exit_jump {
            self.patch_jump(exit_jump)?;
            self.emit(OpCode::Pop);
        }
        Ok(())
    }

    fn expression_statement(&mut self) -> Result<()> {
        self.expression()?;
        self.consume(TokenKind::Semicolon, "Expect ';' after expression.")?;
        self.emit(OpCode::Pop);
        Ok(())
    }

    fn expression(&mut self) -> Result<()> {
        self.parse_precedence(Precedence::Assignment)
    }

    fn block(&mut self) -> Result<()> {
        while !self.check(TokenKind::BraceRight)? && !self.check(TokenKind::EOF)? {
            self.declaration();
        }
        self.consume(TokenKind::BraceRight, "Expect '}' after block.")
    }

    fn scope_enter(&mut self) {
        self.state_mut().scope_depth += 1;
    }

    /// Drops the scope's locals, hoisting captured ones to the heap.
    fn scope_leave(&mut self) {
        let line = self.line();
        let state = self.state_mut();
        state.scope_depth -= 1;

        while let Some(local) = state.locals.last() {
            if local.depth <= state.scope_depth {
                break;
            }
            if local.is_captured {
                state.emit(OpCode::CloseUpvalue, line);
            } else {
                state.emit(OpCode::Pop, line);
            }
            state.locals.pop();
        }
    }

    fn parse_precedence(&mut self, precedence: Precedence) -> Result<()> {
        self.advance();

        let can_assign = precedence <= Precedence::Assignment;
        let prefix = rule_for(self.previous()?.kind).prefix;
        self.run_prefix(prefix, can_assign)?;

        while precedence <= rule_for(self.current()?.kind).precedence {
            self.advance();
            let infix = rule_for(self.previous()?.kind).infix;
            self.run_infix(infix, can_assign)?;
        }

        if can_assign && self.match_token(TokenKind::Equal)? {
            return Err(self.error_at_previous("Invalid assignment target."));
        }
        Ok(())
    }

    fn run_prefix(&mut self, handler: Handler, can_assign: bool) -> Result<()> {
        match handler {
            Handler::Grouping => self.grouping(),
            Handler::Unary => self.unary(),
            Handler::Variable => self.variable(can_assign),
            Handler::String => self.string(),
            Handler::Number => self.number(),
            Handler::Literal => self.literal(),
            Handler::Super => self.super_(),
            Handler::This => self.this_(),
            _ => Err(self.error_at_previous("Expect expression.")),
        }
    }

    fn run_infix(&mut self, handler: Handler, can_assign: bool) -> Result<()> {
        match handler {
            Handler::Call => self.call(),
            Handler::Dot => self.dot(can_assign),
            Handler::Binary => self.binary(),
            Handler::And => self.and_(),
            Handler::Or => self.or_(),
            _ => Err(self.error_at_previous("Expect expression.")),
        }
    }

    fn grouping(&mut self) -> Result<()> {
        self.expression()?;
        self.consume(TokenKind::ParenRight, "Expect ')' after expression.")
    }

    fn number(&mut self) -> Result<()> {
        let value = self.previous()?.data.parse::<f64>()?;
        let index = self.make_constant(Value::Number(value))?;
        self.emit_index(OpCode::Constant, index);
        Ok(())
    }

    fn string(&mut self) -> Result<()> {
        let data = self.previous()?.data.clone();
        // Strip the surrounding quotes.
        let contents = data[1..data.len() - 1].to_owned();
        let string = self.gc.track_string(contents);
        let index = self.make_constant(string.into())?;
        self.emit_index(OpCode::Constant, index);
        Ok(())
    }

    fn literal(&mut self) -> Result<()> {
        match self.previous()?.kind {
            TokenKind::Nil => self.emit(OpCode::Nil),
            TokenKind::True => self.emit(OpCode::True),
            TokenKind::False => self.emit(OpCode::False),
            _ => unreachable!("literal handler on a non-literal token"),
        }
        Ok(())
    }

    fn variable(&mut self, can_assign: bool) -> Result<()> {
        let name = self.previous()?.data.clone();
        self.named_variable(&name, can_assign)
    }

    fn this_(&mut self) -> Result<()> {
        if self.class_states.is_empty() {
            return Err(self.error_at_previous("Can't use 'this' outside of a class."));
        }
        self.named_variable(RECEIVER_NAME, false)
    }

    fn super_(&mut self) -> Result<()> {
        match self.class_states.last() {
            None => {
                return Err(self.error_at_previous("Can't use 'super' outside of a class."));
            }
            Some(class_state) if !class_state.has_superclass => {
                return Err(
                    self.error_at_previous("Can't use 'super' in a class with no superclass.")
                );
            }
            _ => {}
        }

        self.consume(TokenKind::Dot, "Expect '.' after 'super'.")?;
        self.consume(TokenKind::Identifier, "Expect superclass method name.")?;
        let method = self.previous()?.data.clone();
        let constant = self.identifier_constant(method)?;

        self.named_variable(RECEIVER_NAME, false)?;
        if self.match_token(TokenKind::ParenLeft)? {
            let arg_count = self.argument_list()?;
            self.named_variable(SUPERCLASS_NAME, false)?;
            self.emit_invoke(OpCode::SuperInvoke, constant, arg_count);
        } else {
            self.named_variable(SUPERCLASS_NAME, false)?;
            self.emit_index(OpCode::GetSuper, constant);
        }
        Ok(())
    }

    fn unary(&mut self) -> Result<()> {
        let operator = self.previous()?.kind;
        self.parse_precedence(Precedence::Unary)?;

        match operator {
            TokenKind::Minus => self.emit(OpCode::Negate),
            TokenKind::Bang => self.emit(OpCode::Not),
            _ => unreachable!("unary handler on a non-unary token"),
        }
        Ok(())
    }

    fn binary(&mut self) -> Result<()> {
        let operator = self.previous()?.kind;

        // Left associative: parse the right operand one level tighter.
        self.parse_precedence(rule_for(operator).precedence.higher())?;

        match operator {
            TokenKind::Plus => self.emit(OpCode::Add),
            TokenKind::Minus => self.emit(OpCode::Subtract),
            TokenKind::Star => self.emit(OpCode::Multiply),
            TokenKind::Slash => self.emit(OpCode::Divide),
            TokenKind::EqualEqual => self.emit(OpCode::Equal),
            TokenKind::BangEqual => {
                self.emit(OpCode::Equal);
                self.emit(OpCode::Not);
            }
            TokenKind::Greater => self.emit(OpCode::Greater),
            TokenKind::GreaterEqual => {
                self.emit(OpCode::Less);
                self.emit(OpCode::Not);
            }
            TokenKind::Less => self.emit(OpCode::Less),
            TokenKind::LessEqual => {
                self.emit(OpCode::Greater);
                self.emit(OpCode::Not);
            }
            _ => unreachable!("binary handler on a non-binary token"),
        }
        Ok(())
    }

    fn and_(&mut self) -> Result<()> {
        let end_jump = self.emit_jump(OpCode::JumpIfFalse);
        self.emit(OpCode::Pop);
        self.parse_precedence(Precedence::And)?;
        self.patch_jump(end_jump)
    }

    fn or_(&mut self) -> Result<()> {
        let else_jump = self.emit_jump(OpCode::JumpIfFalse);
        let end_jump = self.emit_jump(OpCode::Jump);

        self.patch_jump(else_jump)?;
        self.emit(OpCode::Pop);

        self.parse_precedence(Precedence::Or)?;
        self.patch_jump(end_jump)
    }

    fn call(&mut self) -> Result<()> {
        let arg_count = self.argument_list()?;
        self.emit_index(OpCode::Call, arg_count);
        Ok(())
    }

    fn dot(&mut self, can_assign: bool) -> Result<()> {
        self.consume(TokenKind::Identifier, "Expect property name after '.'.")?;
        let name = self.previous()?.data.clone();
        let constant = self.identifier_constant(name)?;

        if can_assign && self.match_token(TokenKind::Equal)? {
            self.expression()?;
            self.emit_index(OpCode::SetProperty, constant);
        } else if self.match_token(TokenKind::ParenLeft)? {
            // Property access immediately followed by a call fuses into a
            // single Invoke instruction.
            let arg_count = self.argument_list()?;
            self.emit_invoke(OpCode::Invoke, constant, arg_count);
        } else {
            self.emit_index(OpCode::GetProperty, constant);
        }
        Ok(())
    }

    fn argument_list(&mut self) -> Result<u8> {
        let mut arg_count: usize = 0;
        if !self.check(TokenKind::ParenRight)? {
            loop {
                self.expression()?;
                arg_count += 1;
                if arg_count > 255 {
                    return Err(self.error_at_previous("Can't have more than 255 arguments."));
                }
                if !self.match_token(TokenKind::Comma)? {
                    break;
                }
            }
        }
        self.consume(TokenKind::ParenRight, "Expect ')' after arguments.")?;
        Ok(arg_count as u8)
    }

    fn emit(&mut self, op_code: OpCode) {
        let line = self.line();
        self.state_mut().emit(op_code, line);
    }

    fn emit_index(&mut self, op_code: OpCode, index: u8) {
        let line = self.line();
        self.state_mut().emit_index(op_code, index, line);
    }

    fn emit_invoke(&mut self, op_code: OpCode, constant: u8, arg_count: u8) {
        let line = self.line();
        self.state_mut().emit_index(op_code, constant, line);
        self.state_mut().emit_raw(arg_count, line);
    }

    fn emit_jump(&mut self, op_code: OpCode) -> usize {
        let line = self.line();
        self.state_mut().emit_jump(op_code, line)
    }

    fn patch_jump(&mut self, offset: usize) -> Result<()> {
        if self.state_mut().patch_jump(offset) {
            Ok(())
        } else {
            Err(self.error_at_previous("Too much code to jump over."))
        }
    }

    fn emit_loop(&mut self, loop_start: usize) -> Result<()> {
        let line = self.line();
        if self.state_mut().emit_loop(loop_start, line) {
            Ok(())
        } else {
            Err(self.error_at_previous("Loop body too large."))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn compile(source: &str) -> Result<()> {
        let mut gc = GC::new();
        let compiler = Compiler::new(source, &mut gc);
        compiler.compile().map(|_| ())
    }

    fn first_error(source: &str) -> String {
        match compile(source) {
            Err(CompileError::Multiple(errors)) => errors[0].to_string(),
            other => panic!("expected compile errors, got {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn compile_math() {
        assert!(compile("(-1 + 2) * 3 - -4;").is_ok());
        assert!(compile("1.5 + 1.3 * 3.5;").is_ok());
    }

    #[test]
    fn compile_print() {
        assert!(compile("print 1;").is_ok());
    }

    #[test]
    fn compile_globals() {
        let source = r#"
        var beverage = "cafe au lait";
        var breakfast = "beignets with " + beverage;
        print breakfast;
        "#;
        assert!(compile(source).is_ok());
    }

    #[test]
    fn compile_invalid_assignment_target() {
        assert!(first_error("a * b = c + d;").contains("Invalid assignment target."));
    }

    #[test]
    fn compile_missing_expression() {
        assert!(first_error("print ;").contains("Expect expression."));
    }

    #[test]
    fn compile_local_in_own_initializer() {
        let source = r#"
        var a = 1;
        {
            var a = a;
        }"#;
        assert!(
            first_error(source).contains("Can't read local variable in its own initializer.")
        );
    }

    #[test]
    fn compile_duplicate_local() {
        let source = "{ var a = 1; var a = 2; }";
        assert!(first_error(source).contains("Already a variable with this name in this scope."));
    }

    #[test]
    fn compile_control_flow() {
        assert!(compile("if (1 < 2) { print 1; } else { print 2; }").is_ok());
        assert!(compile("while (true) {}").is_ok());
        assert!(compile("for (var i = 0; i < 10; i = i + 1) {}").is_ok());
        assert!(compile("print true and false or nil;").is_ok());
    }

    #[test]
    fn compile_functions() {
        let source = r#"
            fun fib(n) {
                if (n < 2) return n;
                return fib(n - 2) + fib(n - 1);
            }
            print fib(10);
        "#;
        assert!(compile(source).is_ok());
    }

    #[test]
    fn compile_closures() {
        let source = r#"
            fun makeClosure() {
                var local = "local";
                fun closure() {
                    print local;
                }
                return closure;
            }
            var closure = makeClosure();
            closure();
        "#;
        assert!(compile(source).is_ok());
    }

    #[test]
    fn compile_return_at_top_level() {
        assert!(first_error("return 1;").contains("Can't return from top-level code."));
    }

    #[test]
    fn compile_classes() {
        let source = r#"
            class Brioche {
                init(flour) {
                    this.flour = flour;
                }
                bake() {
                    return "baked with " + this.flour;
                }
            }
            print Brioche("wheat").bake();
        "#;
        assert!(compile(source).is_ok());
    }

    #[test]
    fn compile_inheritance() {
        let source = r#"
            class A { say() { print "A"; } }
            class B < A { say() { super.say(); print "B"; } }
            B().say();
        "#;
        assert!(compile(source).is_ok());
    }

    #[test]
    fn compile_class_inherits_from_itself() {
        assert!(first_error("class A < A {}").contains("A class can't inherit from itself."));
    }

    #[test]
    fn compile_this_outside_class() {
        assert!(first_error("print this;").contains("Can't use 'this' outside of a class."));
    }

    #[test]
    fn compile_super_outside_class() {
        assert!(
            first_error("print super.x;").contains("Can't use 'super' outside of a class.")
        );
    }

    #[test]
    fn compile_super_without_superclass() {
        let source = "class A { f() { super.f(); } }";
        assert!(
            first_error(source).contains("Can't use 'super' in a class with no superclass.")
        );
    }

    #[test]
    fn compile_value_return_in_initializer() {
        let source = "class A { init() { return 1; } }";
        assert!(
            first_error(source).contains("Can't return a value from an initializer.")
        );
    }

    #[test]
    fn compile_bare_return_in_initializer() {
        let source = "class A { init() { return; } }";
        assert!(compile(source).is_ok());
    }

    #[test]
    fn compile_constant_pool_overflow() {
        let mut source = String::new();
        for i in 0..300 {
            source.push_str(&format!("var v{} = {};\n", i, i));
        }
        assert!(first_error(&source).contains("Too many constants in one chunk."));
    }

    #[test]
    fn compile_keeps_going_after_error() {
        // Both errors are reported thanks to synchronization.
        let source = "var 1 = 2; print ;";
        match compile(source) {
            Err(CompileError::Multiple(errors)) => assert!(errors.len() >= 2),
            other => panic!("expected compile errors, got {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn compile_upvalue_resolution() {
        // `x` is captured through two levels of nesting.
        let source = r#"
            fun outer() {
                var x = "value";
                fun middle() {
                    fun inner() {
                        print x;
                    }
                    return inner;
                }
                return middle;
            }
            outer()()();
        "#;
        assert!(compile(source).is_ok());
    }
}
