//! Loader and sandbox for allele bodies.
//!
//! Allele source is a small structured-expression language interpreted
//! directly: `use` imports from a module whitelist, function declarations,
//! `let`/`if`/`for`/`return`, and JSON-shaped values. The capability object
//! is bound as `sdk`; `sdk.<operation>(args...)` is the only bridge out of
//! the sandbox. Execution is bounded by a wall clock enforced both by
//! `tokio::time::timeout` around the blocking interpreter task and by a
//! cancellation flag the interpreter polls at statement boundaries.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use serde_json::{json, Map, Value};
use sha2::{Digest as _, Sha256};
use thiserror::Error;

pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// Modules allele code may import.
pub const ALLOWED_MODULES: &[&str] = &[
    "json", "str", "re", "hash", "math", "time", "list", "copy",
];

/// Builtin names alleles must not call.
pub const DENIED_BUILTINS: &[&str] = &[
    "eval",
    "exec",
    "compile",
    "open",
    "input",
    "import",
    "breakpoint",
    "exit",
    "spawn",
];

const MAX_CALL_DEPTH: usize = 64;

#[derive(Debug, Error)]
pub enum LoadError {
    #[error("allele source parse error: {0}")]
    Parse(String),
    #[error("allele source does not define an execute(input) entry point")]
    MissingEntryPoint,
}

#[derive(Clone, Debug, Error, PartialEq)]
pub enum SandboxError {
    #[error("import denied: module '{0}' is not whitelisted")]
    ImportDenied(String),
    #[error("builtin denied: '{0}'")]
    BuiltinDenied(String),
    #[error("execution exceeded the {}s wall-clock limit", .limit.as_secs())]
    Timeout { limit: Duration },
    #[error("runtime fault: {0}")]
    RuntimeFault(String),
    #[error("protected resource: {0}")]
    ProtectedResource(String),
}

/// Result of a capability operation. `Protected` aborts the invocation and
/// triggers rollback upstream; `Failed` is an ordinary runtime fault.
#[derive(Clone, Debug, Error, PartialEq)]
pub enum CapabilityFault {
    #[error("protected resource: {0}")]
    Protected(String),
    #[error("capability operation failed: {0}")]
    Failed(String),
}

/// The only bridge from sandboxed code to the environment. Implementations
/// must be reentrant and thread-safe.
pub trait Capability: Send + Sync {
    fn call(&self, operation: &str, args: &[Value]) -> Result<Value, CapabilityFault>;
}

// ---------------------------------------------------------------------------
// Lexer

#[derive(Clone, Debug, PartialEq)]
enum Token {
    Ident(String),
    Int(i64),
    Float(f64),
    Str(String),
    Use,
    Fn,
    Let,
    If,
    Else,
    For,
    In,
    Return,
    True,
    False,
    Null,
    And,
    Or,
    Not,
    LBrace,
    RBrace,
    LParen,
    RParen,
    LBracket,
    RBracket,
    Comma,
    Colon,
    ColonColon,
    Dot,
    Semi,
    Assign,
    EqEq,
    NotEq,
    Lt,
    Gt,
    Le,
    Ge,
    Plus,
    Minus,
    Star,
    Slash,
    Percent,
}

fn lex(source: &str) -> Result<Vec<(Token, u32)>, LoadError> {
    let mut tokens = Vec::new();
    let mut chars = source.chars().peekable();
    let mut line = 1u32;
    while let Some(&ch) = chars.peek() {
        match ch {
            '\n' => {
                line += 1;
                chars.next();
            }
            ch if ch.is_whitespace() => {
                chars.next();
            }
            '#' => {
                for ch in chars.by_ref() {
                    if ch == '\n' {
                        line += 1;
                        break;
                    }
                }
            }
            '"' => {
                chars.next();
                let mut text = String::new();
                loop {
                    match chars.next() {
                        Some('"') => break,
                        Some('\\') => match chars.next() {
                            Some('n') => text.push('\n'),
                            Some('t') => text.push('\t'),
                            Some('"') => text.push('"'),
                            Some('\\') => text.push('\\'),
                            other => {
                                return Err(LoadError::Parse(format!(
                                    "line {line}: invalid escape {other:?}"
                                )))
                            }
                        },
                        Some('\n') | None => {
                            return Err(LoadError::Parse(format!(
                                "line {line}: unterminated string"
                            )))
                        }
                        Some(ch) => text.push(ch),
                    }
                }
                tokens.push((Token::Str(text), line));
            }
            ch if ch.is_ascii_digit() => {
                let mut digits = String::new();
                let mut is_float = false;
                while let Some(&ch) = chars.peek() {
                    if ch.is_ascii_digit() {
                        digits.push(ch);
                        chars.next();
                    } else if ch == '.' && !is_float {
                        let mut lookahead = chars.clone();
                        lookahead.next();
                        if lookahead.peek().is_some_and(|next| next.is_ascii_digit()) {
                            is_float = true;
                            digits.push('.');
                            chars.next();
                        } else {
                            break;
                        }
                    } else {
                        break;
                    }
                }
                let token = if is_float {
                    Token::Float(digits.parse().map_err(|_| {
                        LoadError::Parse(format!("line {line}: invalid number {digits}"))
                    })?)
                } else {
                    Token::Int(digits.parse().map_err(|_| {
                        LoadError::Parse(format!("line {line}: invalid number {digits}"))
                    })?)
                };
                tokens.push((token, line));
            }
            ch if ch.is_ascii_alphabetic() || ch == '_' => {
                let mut word = String::new();
                while let Some(&ch) = chars.peek() {
                    if ch.is_ascii_alphanumeric() || ch == '_' {
                        word.push(ch);
                        chars.next();
                    } else {
                        break;
                    }
                }
                let token = match word.as_str() {
                    "use" => Token::Use,
                    "fn" => Token::Fn,
                    "let" => Token::Let,
                    "if" => Token::If,
                    "else" => Token::Else,
                    "for" => Token::For,
                    "in" => Token::In,
                    "return" => Token::Return,
                    "true" => Token::True,
                    "false" => Token::False,
                    "null" => Token::Null,
                    "and" => Token::And,
                    "or" => Token::Or,
                    "not" => Token::Not,
                    _ => Token::Ident(word),
                };
                tokens.push((token, line));
            }
            _ => {
                chars.next();
                let token = match ch {
                    '{' => Token::LBrace,
                    '}' => Token::RBrace,
                    '(' => Token::LParen,
                    ')' => Token::RParen,
                    '[' => Token::LBracket,
                    ']' => Token::RBracket,
                    ',' => Token::Comma,
                    ';' => Token::Semi,
                    '.' => Token::Dot,
                    '+' => Token::Plus,
                    '-' => Token::Minus,
                    '*' => Token::Star,
                    '/' => Token::Slash,
                    '%' => Token::Percent,
                    ':' => {
                        if chars.peek() == Some(&':') {
                            chars.next();
                            Token::ColonColon
                        } else {
                            Token::Colon
                        }
                    }
                    '=' => {
                        if chars.peek() == Some(&'=') {
                            chars.next();
                            Token::EqEq
                        } else {
                            Token::Assign
                        }
                    }
                    '!' => {
                        if chars.peek() == Some(&'=') {
                            chars.next();
                            Token::NotEq
                        } else {
                            return Err(LoadError::Parse(format!(
                                "line {line}: unexpected character '!'"
                            )));
                        }
                    }
                    '<' => {
                        if chars.peek() == Some(&'=') {
                            chars.next();
                            Token::Le
                        } else {
                            Token::Lt
                        }
                    }
                    '>' => {
                        if chars.peek() == Some(&'=') {
                            chars.next();
                            Token::Ge
                        } else {
                            Token::Gt
                        }
                    }
                    other => {
                        return Err(LoadError::Parse(format!(
                            "line {line}: unexpected character '{other}'"
                        )))
                    }
                };
                tokens.push((token, line));
            }
        }
    }
    Ok(tokens)
}

// ---------------------------------------------------------------------------
// Parser

#[derive(Clone, Debug)]
struct FnDecl {
    params: Vec<String>,
    body: Vec<Stmt>,
}

#[derive(Clone, Debug)]
struct Program {
    uses: Vec<String>,
    functions: HashMap<String, FnDecl>,
}

#[derive(Clone, Debug)]
enum Stmt {
    Let(String, Expr),
    Return(Option<Expr>),
    If {
        cond: Expr,
        then_body: Vec<Stmt>,
        else_body: Vec<Stmt>,
    },
    For {
        variable: String,
        iterable: Expr,
        body: Vec<Stmt>,
    },
    Expr(Expr),
}

#[derive(Clone, Debug, PartialEq)]
enum BinOp {
    Add,
    Sub,
    Mul,
    Div,
    Rem,
    Eq,
    Ne,
    Lt,
    Gt,
    Le,
    Ge,
    And,
    Or,
}

#[derive(Clone, Debug)]
enum Expr {
    Literal(Value),
    Ident(String),
    Object(Vec<(String, Expr)>),
    Array(Vec<Expr>),
    Field(Box<Expr>, String),
    Index(Box<Expr>, Box<Expr>),
    Neg(Box<Expr>),
    Not(Box<Expr>),
    Binary(BinOp, Box<Expr>, Box<Expr>),
    ModuleCall(String, String, Vec<Expr>),
    MethodCall(Box<Expr>, String, Vec<Expr>),
    Call(String, Vec<Expr>),
}

struct Parser {
    tokens: Vec<(Token, u32)>,
    pos: usize,
}

impl Parser {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos).map(|(token, _)| token)
    }

    fn line(&self) -> u32 {
        self.tokens
            .get(self.pos.min(self.tokens.len().saturating_sub(1)))
            .map(|(_, line)| *line)
            .unwrap_or(0)
    }

    fn next(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.pos).map(|(token, _)| token.clone());
        self.pos += 1;
        token
    }

    fn error(&self, message: &str) -> LoadError {
        LoadError::Parse(format!("line {}: {message}", self.line()))
    }

    fn expect(&mut self, expected: Token) -> Result<(), LoadError> {
        match self.next() {
            Some(token) if token == expected => Ok(()),
            other => Err(LoadError::Parse(format!(
                "line {}: expected {expected:?}, found {other:?}",
                self.line()
            ))),
        }
    }

    fn expect_ident(&mut self) -> Result<String, LoadError> {
        match self.next() {
            Some(Token::Ident(name)) => Ok(name),
            other => Err(LoadError::Parse(format!(
                "line {}: expected identifier, found {other:?}",
                self.line()
            ))),
        }
    }

    fn parse_program(&mut self) -> Result<Program, LoadError> {
        let mut uses = Vec::new();
        let mut functions = HashMap::new();
        while let Some(token) = self.peek() {
            match token {
                Token::Use => {
                    self.next();
                    uses.push(self.expect_ident()?);
                }
                Token::Fn => {
                    self.next();
                    let name = self.expect_ident()?;
                    self.expect(Token::LParen)?;
                    let mut params = Vec::new();
                    if self.peek() != Some(&Token::RParen) {
                        loop {
                            params.push(self.expect_ident()?);
                            match self.peek() {
                                Some(Token::Comma) => {
                                    self.next();
                                }
                                _ => break,
                            }
                        }
                    }
                    self.expect(Token::RParen)?;
                    let body = self.parse_block()?;
                    functions.insert(name, FnDecl { params, body });
                }
                _ => return Err(self.error("expected 'use' or 'fn' at top level")),
            }
        }
        Ok(Program { uses, functions })
    }

    fn parse_block(&mut self) -> Result<Vec<Stmt>, LoadError> {
        self.expect(Token::LBrace)?;
        let mut body = Vec::new();
        loop {
            while self.peek() == Some(&Token::Semi) {
                self.next();
            }
            if self.peek() == Some(&Token::RBrace) {
                self.next();
                return Ok(body);
            }
            if self.peek().is_none() {
                return Err(self.error("unterminated block"));
            }
            body.push(self.parse_stmt()?);
        }
    }

    fn parse_stmt(&mut self) -> Result<Stmt, LoadError> {
        match self.peek() {
            Some(Token::Let) => {
                self.next();
                let name = self.expect_ident()?;
                self.expect(Token::Assign)?;
                Ok(Stmt::Let(name, self.parse_expr()?))
            }
            Some(Token::Return) => {
                self.next();
                if matches!(self.peek(), Some(Token::RBrace) | Some(Token::Semi) | None) {
                    Ok(Stmt::Return(None))
                } else {
                    Ok(Stmt::Return(Some(self.parse_expr()?)))
                }
            }
            Some(Token::If) => self.parse_if(),
            Some(Token::For) => {
                self.next();
                let variable = self.expect_ident()?;
                self.expect(Token::In)?;
                let iterable = self.parse_expr()?;
                let body = self.parse_block()?;
                Ok(Stmt::For {
                    variable,
                    iterable,
                    body,
                })
            }
            _ => Ok(Stmt::Expr(self.parse_expr()?)),
        }
    }

    fn parse_if(&mut self) -> Result<Stmt, LoadError> {
        self.expect(Token::If)?;
        let cond = self.parse_expr()?;
        let then_body = self.parse_block()?;
        let else_body = if self.peek() == Some(&Token::Else) {
            self.next();
            if self.peek() == Some(&Token::If) {
                vec![self.parse_if()?]
            } else {
                self.parse_block()?
            }
        } else {
            Vec::new()
        };
        Ok(Stmt::If {
            cond,
            then_body,
            else_body,
        })
    }

    fn parse_expr(&mut self) -> Result<Expr, LoadError> {
        self.parse_or()
    }

    fn parse_or(&mut self) -> Result<Expr, LoadError> {
        let mut left = self.parse_and()?;
        while self.peek() == Some(&Token::Or) {
            self.next();
            let right = self.parse_and()?;
            left = Expr::Binary(BinOp::Or, Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn parse_and(&mut self) -> Result<Expr, LoadError> {
        let mut left = self.parse_cmp()?;
        while self.peek() == Some(&Token::And) {
            self.next();
            let right = self.parse_cmp()?;
            left = Expr::Binary(BinOp::And, Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn parse_cmp(&mut self) -> Result<Expr, LoadError> {
        let left = self.parse_add()?;
        let op = match self.peek() {
            Some(Token::EqEq) => BinOp::Eq,
            Some(Token::NotEq) => BinOp::Ne,
            Some(Token::Lt) => BinOp::Lt,
            Some(Token::Gt) => BinOp::Gt,
            Some(Token::Le) => BinOp::Le,
            Some(Token::Ge) => BinOp::Ge,
            _ => return Ok(left),
        };
        self.next();
        let right = self.parse_add()?;
        Ok(Expr::Binary(op, Box::new(left), Box::new(right)))
    }

    fn parse_add(&mut self) -> Result<Expr, LoadError> {
        let mut left = self.parse_mul()?;
        loop {
            let op = match self.peek() {
                Some(Token::Plus) => BinOp::Add,
                Some(Token::Minus) => BinOp::Sub,
                _ => return Ok(left),
            };
            self.next();
            let right = self.parse_mul()?;
            left = Expr::Binary(op, Box::new(left), Box::new(right));
        }
    }

    fn parse_mul(&mut self) -> Result<Expr, LoadError> {
        let mut left = self.parse_unary()?;
        loop {
            let op = match self.peek() {
                Some(Token::Star) => BinOp::Mul,
                Some(Token::Slash) => BinOp::Div,
                Some(Token::Percent) => BinOp::Rem,
                _ => return Ok(left),
            };
            self.next();
            let right = self.parse_unary()?;
            left = Expr::Binary(op, Box::new(left), Box::new(right));
        }
    }

    fn parse_unary(&mut self) -> Result<Expr, LoadError> {
        match self.peek() {
            Some(Token::Minus) => {
                self.next();
                Ok(Expr::Neg(Box::new(self.parse_unary()?)))
            }
            Some(Token::Not) => {
                self.next();
                Ok(Expr::Not(Box::new(self.parse_unary()?)))
            }
            _ => self.parse_postfix(),
        }
    }

    fn parse_postfix(&mut self) -> Result<Expr, LoadError> {
        let mut expr = self.parse_primary()?;
        loop {
            match self.peek() {
                Some(Token::Dot) => {
                    self.next();
                    let name = self.expect_ident()?;
                    if self.peek() == Some(&Token::LParen) {
                        let args = self.parse_args()?;
                        expr = Expr::MethodCall(Box::new(expr), name, args);
                    } else {
                        expr = Expr::Field(Box::new(expr), name);
                    }
                }
                Some(Token::LBracket) => {
                    self.next();
                    let index = self.parse_expr()?;
                    self.expect(Token::RBracket)?;
                    expr = Expr::Index(Box::new(expr), Box::new(index));
                }
                _ => return Ok(expr),
            }
        }
    }

    fn parse_args(&mut self) -> Result<Vec<Expr>, LoadError> {
        self.expect(Token::LParen)?;
        let mut args = Vec::new();
        if self.peek() != Some(&Token::RParen) {
            loop {
                args.push(self.parse_expr()?);
                match self.peek() {
                    Some(Token::Comma) => {
                        self.next();
                    }
                    _ => break,
                }
            }
        }
        self.expect(Token::RParen)?;
        Ok(args)
    }

    fn parse_primary(&mut self) -> Result<Expr, LoadError> {
        match self.next() {
            Some(Token::Int(value)) => Ok(Expr::Literal(json!(value))),
            Some(Token::Float(value)) => Ok(Expr::Literal(json!(value))),
            Some(Token::Str(value)) => Ok(Expr::Literal(Value::String(value))),
            Some(Token::True) => Ok(Expr::Literal(Value::Bool(true))),
            Some(Token::False) => Ok(Expr::Literal(Value::Bool(false))),
            Some(Token::Null) => Ok(Expr::Literal(Value::Null)),
            Some(Token::LParen) => {
                let inner = self.parse_expr()?;
                self.expect(Token::RParen)?;
                Ok(inner)
            }
            Some(Token::LBracket) => {
                let mut items = Vec::new();
                if self.peek() != Some(&Token::RBracket) {
                    loop {
                        items.push(self.parse_expr()?);
                        match self.peek() {
                            Some(Token::Comma) => {
                                self.next();
                            }
                            _ => break,
                        }
                    }
                }
                self.expect(Token::RBracket)?;
                Ok(Expr::Array(items))
            }
            Some(Token::LBrace) => {
                let mut fields = Vec::new();
                if self.peek() != Some(&Token::RBrace) {
                    loop {
                        let key = match self.next() {
                            Some(Token::Ident(name)) => name,
                            Some(Token::Str(text)) => text,
                            other => {
                                return Err(LoadError::Parse(format!(
                                    "line {}: expected object key, found {other:?}",
                                    self.line()
                                )))
                            }
                        };
                        self.expect(Token::Colon)?;
                        fields.push((key, self.parse_expr()?));
                        match self.peek() {
                            Some(Token::Comma) => {
                                self.next();
                            }
                            _ => break,
                        }
                    }
                }
                self.expect(Token::RBrace)?;
                Ok(Expr::Object(fields))
            }
            Some(Token::Ident(name)) => match self.peek() {
                Some(Token::ColonColon) => {
                    self.next();
                    let function = self.expect_ident()?;
                    let args = self.parse_args()?;
                    Ok(Expr::ModuleCall(name, function, args))
                }
                Some(Token::LParen) => {
                    let args = self.parse_args()?;
                    Ok(Expr::Call(name, args))
                }
                _ => Ok(Expr::Ident(name)),
            },
            other => Err(LoadError::Parse(format!(
                "line {}: unexpected token {other:?}",
                self.line()
            ))),
        }
    }
}

// ---------------------------------------------------------------------------
// Interpreter

struct Interp<'a> {
    program: &'a Program,
    capability: &'a dyn Capability,
    deadline: Instant,
    limit: Duration,
    cancelled: &'a AtomicBool,
    depth: usize,
}

enum Flow {
    Normal(Option<Value>),
    Return(Value),
}

type Scope = HashMap<String, Value>;

impl<'a> Interp<'a> {
    fn checkpoint(&self) -> Result<(), SandboxError> {
        if self.cancelled.load(Ordering::Relaxed) || Instant::now() >= self.deadline {
            return Err(SandboxError::Timeout { limit: self.limit });
        }
        Ok(())
    }

    fn call_function(&mut self, name: &str, args: Vec<Value>) -> Result<Value, SandboxError> {
        let decl = self
            .program
            .functions
            .get(name)
            .ok_or_else(|| SandboxError::RuntimeFault(format!("unknown function '{name}'")))?;
        if decl.params.len() != args.len() {
            return Err(SandboxError::RuntimeFault(format!(
                "function '{name}' takes {} argument(s), got {}",
                decl.params.len(),
                args.len()
            )));
        }
        if self.depth >= MAX_CALL_DEPTH {
            return Err(SandboxError::RuntimeFault("call depth exceeded".into()));
        }
        self.depth += 1;
        let mut scope: Scope = decl.params.iter().cloned().zip(args).collect();
        let flow = self.run_block(&decl.body, &mut scope);
        self.depth -= 1;
        match flow? {
            Flow::Return(value) => Ok(value),
            Flow::Normal(value) => Ok(value.unwrap_or(Value::Null)),
        }
    }

    fn run_block(&mut self, body: &[Stmt], scope: &mut Scope) -> Result<Flow, SandboxError> {
        let mut last = None;
        for stmt in body {
            self.checkpoint()?;
            match stmt {
                Stmt::Let(name, expr) => {
                    let value = self.eval(expr, scope)?;
                    scope.insert(name.clone(), value);
                    last = None;
                }
                Stmt::Return(expr) => {
                    let value = match expr {
                        Some(expr) => self.eval(expr, scope)?,
                        None => Value::Null,
                    };
                    return Ok(Flow::Return(value));
                }
                Stmt::If {
                    cond,
                    then_body,
                    else_body,
                } => {
                    let branch = if truthy(&self.eval(cond, scope)?) {
                        then_body
                    } else {
                        else_body
                    };
                    match self.run_block(branch, scope)? {
                        Flow::Return(value) => return Ok(Flow::Return(value)),
                        Flow::Normal(value) => last = value,
                    }
                }
                Stmt::For {
                    variable,
                    iterable,
                    body,
                } => {
                    let items = match self.eval(iterable, scope)? {
                        Value::Array(items) => items,
                        other => {
                            return Err(SandboxError::RuntimeFault(format!(
                                "cannot iterate over {}",
                                type_name(&other)
                            )))
                        }
                    };
                    for item in items {
                        self.checkpoint()?;
                        scope.insert(variable.clone(), item);
                        match self.run_block(body, scope)? {
                            Flow::Return(value) => return Ok(Flow::Return(value)),
                            Flow::Normal(_) => {}
                        }
                    }
                    last = None;
                }
                Stmt::Expr(expr) => {
                    last = Some(self.eval(expr, scope)?);
                }
            }
        }
        Ok(Flow::Normal(last))
    }

    fn eval(&mut self, expr: &Expr, scope: &mut Scope) -> Result<Value, SandboxError> {
        match expr {
            Expr::Literal(value) => Ok(value.clone()),
            Expr::Ident(name) => scope
                .get(name)
                .cloned()
                .ok_or_else(|| SandboxError::RuntimeFault(format!("unknown name '{name}'"))),
            Expr::Object(fields) => {
                let mut object = Map::new();
                for (key, value_expr) in fields {
                    object.insert(key.clone(), self.eval(value_expr, scope)?);
                }
                Ok(Value::Object(object))
            }
            Expr::Array(items) => {
                let mut out = Vec::with_capacity(items.len());
                for item in items {
                    out.push(self.eval(item, scope)?);
                }
                Ok(Value::Array(out))
            }
            Expr::Field(receiver, name) => match self.eval(receiver, scope)? {
                Value::Object(object) => Ok(object.get(name).cloned().unwrap_or(Value::Null)),
                other => Err(SandboxError::RuntimeFault(format!(
                    "cannot read field '{name}' of {}",
                    type_name(&other)
                ))),
            },
            Expr::Index(receiver, index) => {
                let receiver = self.eval(receiver, scope)?;
                let index = self.eval(index, scope)?;
                match (&receiver, &index) {
                    (Value::Array(items), Value::Number(number)) => {
                        let position = number.as_i64().ok_or_else(|| {
                            SandboxError::RuntimeFault("array index must be an integer".into())
                        })?;
                        usize::try_from(position)
                            .ok()
                            .and_then(|position| items.get(position).cloned())
                            .ok_or_else(|| {
                                SandboxError::RuntimeFault(format!(
                                    "index {position} out of range"
                                ))
                            })
                    }
                    (Value::Object(object), Value::String(key)) => {
                        Ok(object.get(key).cloned().unwrap_or(Value::Null))
                    }
                    _ => Err(SandboxError::RuntimeFault(format!(
                        "cannot index {} with {}",
                        type_name(&receiver),
                        type_name(&index)
                    ))),
                }
            }
            Expr::Neg(inner) => match self.eval(inner, scope)? {
                Value::Number(number) => {
                    if let Some(value) = number.as_i64() {
                        Ok(json!(-value))
                    } else {
                        Ok(json!(-number.as_f64().unwrap_or(0.0)))
                    }
                }
                other => Err(SandboxError::RuntimeFault(format!(
                    "cannot negate {}",
                    type_name(&other)
                ))),
            },
            Expr::Not(inner) => {
                let value = self.eval(inner, scope)?;
                Ok(Value::Bool(!truthy(&value)))
            }
            Expr::Binary(op, left, right) => self.eval_binary(op, left, right, scope),
            Expr::ModuleCall(module, function, args) => {
                if !ALLOWED_MODULES.contains(&module.as_str()) {
                    return Err(SandboxError::ImportDenied(module.clone()));
                }
                let mut values = Vec::with_capacity(args.len());
                for arg in args {
                    values.push(self.eval(arg, scope)?);
                }
                call_module(module, function, &values)
            }
            Expr::MethodCall(receiver, name, args) => {
                match receiver.as_ref() {
                    Expr::Ident(target) if target == "sdk" => {}
                    _ => {
                        return Err(SandboxError::RuntimeFault(
                            "method calls are only supported on sdk".into(),
                        ))
                    }
                }
                let mut values = Vec::with_capacity(args.len());
                for arg in args {
                    values.push(self.eval(arg, scope)?);
                }
                self.checkpoint()?;
                match self.capability.call(name, &values) {
                    Ok(value) => Ok(value),
                    Err(CapabilityFault::Protected(reason)) => {
                        Err(SandboxError::ProtectedResource(reason))
                    }
                    Err(CapabilityFault::Failed(reason)) => {
                        Err(SandboxError::RuntimeFault(reason))
                    }
                }
            }
            Expr::Call(name, args) => {
                if DENIED_BUILTINS.contains(&name.as_str()) {
                    return Err(SandboxError::BuiltinDenied(name.clone()));
                }
                let mut values = Vec::with_capacity(args.len());
                for arg in args {
                    values.push(self.eval(arg, scope)?);
                }
                if self.program.functions.contains_key(name) {
                    self.call_function(name, values)
                } else {
                    call_builtin(name, &values)
                }
            }
        }
    }

    fn eval_binary(
        &mut self,
        op: &BinOp,
        left: &Expr,
        right: &Expr,
        scope: &mut Scope,
    ) -> Result<Value, SandboxError> {
        if matches!(op, BinOp::And | BinOp::Or) {
            let left = self.eval(left, scope)?;
            return match op {
                BinOp::And if !truthy(&left) => Ok(left),
                BinOp::Or if truthy(&left) => Ok(left),
                _ => self.eval(right, scope),
            };
        }
        let left = self.eval(left, scope)?;
        let right = self.eval(right, scope)?;
        match op {
            BinOp::Eq => Ok(Value::Bool(left == right)),
            BinOp::Ne => Ok(Value::Bool(left != right)),
            BinOp::Lt | BinOp::Gt | BinOp::Le | BinOp::Ge => {
                let ordering = compare(&left, &right)?;
                let holds = match op {
                    BinOp::Lt => ordering.is_lt(),
                    BinOp::Gt => ordering.is_gt(),
                    BinOp::Le => ordering.is_le(),
                    _ => ordering.is_ge(),
                };
                Ok(Value::Bool(holds))
            }
            BinOp::Add => add_values(&left, &right),
            BinOp::Sub | BinOp::Mul | BinOp::Rem => arith(op, &left, &right),
            BinOp::Div => {
                let divisor = as_f64(&right).ok_or_else(|| non_numeric("/", &right))?;
                if divisor == 0.0 {
                    return Err(SandboxError::RuntimeFault("division by zero".into()));
                }
                let dividend = as_f64(&left).ok_or_else(|| non_numeric("/", &left))?;
                Ok(json!(dividend / divisor))
            }
            BinOp::And | BinOp::Or => unreachable!("handled above"),
        }
    }
}

fn truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(flag) => *flag,
        Value::Number(number) => number.as_f64().is_some_and(|value| value != 0.0),
        Value::String(text) => !text.is_empty(),
        Value::Array(items) => !items.is_empty(),
        Value::Object(object) => !object.is_empty(),
    }
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

fn as_f64(value: &Value) -> Option<f64> {
    value.as_f64()
}

fn non_numeric(op: &str, value: &Value) -> SandboxError {
    SandboxError::RuntimeFault(format!("operator '{op}' requires numbers, got {}", type_name(value)))
}

fn compare(left: &Value, right: &Value) -> Result<std::cmp::Ordering, SandboxError> {
    match (left, right) {
        (Value::Number(_), Value::Number(_)) => {
            let left = as_f64(left).unwrap_or(f64::NAN);
            let right = as_f64(right).unwrap_or(f64::NAN);
            left.partial_cmp(&right).ok_or_else(|| {
                SandboxError::RuntimeFault("cannot compare non-finite numbers".into())
            })
        }
        (Value::String(left), Value::String(right)) => Ok(left.cmp(right)),
        _ => Err(SandboxError::RuntimeFault(format!(
            "cannot compare {} with {}",
            type_name(left),
            type_name(right)
        ))),
    }
}

fn add_values(left: &Value, right: &Value) -> Result<Value, SandboxError> {
    match (left, right) {
        (Value::String(left), Value::String(right)) => Ok(json!(format!("{left}{right}"))),
        (Value::Array(left), Value::Array(right)) => {
            let mut out = left.clone();
            out.extend(right.iter().cloned());
            Ok(Value::Array(out))
        }
        _ => arith(&BinOp::Add, left, right),
    }
}

fn arith(op: &BinOp, left: &Value, right: &Value) -> Result<Value, SandboxError> {
    let symbol = match op {
        BinOp::Add => "+",
        BinOp::Sub => "-",
        BinOp::Mul => "*",
        BinOp::Rem => "%",
        _ => "?",
    };
    if let (Some(left_int), Some(right_int)) = (left.as_i64(), right.as_i64()) {
        let result = match op {
            BinOp::Add => left_int.checked_add(right_int),
            BinOp::Sub => left_int.checked_sub(right_int),
            BinOp::Mul => left_int.checked_mul(right_int),
            BinOp::Rem => {
                if right_int == 0 {
                    return Err(SandboxError::RuntimeFault("division by zero".into()));
                }
                left_int.checked_rem(right_int)
            }
            _ => None,
        };
        return result
            .map(|value| json!(value))
            .ok_or_else(|| SandboxError::RuntimeFault("integer overflow".into()));
    }
    let left = as_f64(left).ok_or_else(|| non_numeric(symbol, left))?;
    let right = as_f64(right).ok_or_else(|| non_numeric(symbol, right))?;
    let result = match op {
        BinOp::Add => left + right,
        BinOp::Sub => left - right,
        BinOp::Mul => left * right,
        BinOp::Rem => {
            if right == 0.0 {
                return Err(SandboxError::RuntimeFault("division by zero".into()));
            }
            left % right
        }
        _ => unreachable!(),
    };
    Ok(json!(result))
}

fn want_string<'v>(
    module: &str,
    function: &str,
    value: Option<&'v Value>,
) -> Result<&'v str, SandboxError> {
    value.and_then(Value::as_str).ok_or_else(|| {
        SandboxError::RuntimeFault(format!("{module}::{function} expects a string argument"))
    })
}

fn call_module(module: &str, function: &str, args: &[Value]) -> Result<Value, SandboxError> {
    let unknown = || {
        SandboxError::RuntimeFault(format!("unknown module function {module}::{function}"))
    };
    match module {
        "json" => match function {
            "parse" => {
                let text = want_string(module, function, args.first())?;
                serde_json::from_str(text).map_err(|err| {
                    SandboxError::RuntimeFault(format!("json::parse failed: {err}"))
                })
            }
            "dump" => {
                let value = args.first().cloned().unwrap_or(Value::Null);
                serde_json::to_string(&value)
                    .map(Value::String)
                    .map_err(|err| {
                        SandboxError::RuntimeFault(format!("json::dump failed: {err}"))
                    })
            }
            _ => Err(unknown()),
        },
        "str" => {
            let text = want_string(module, function, args.first())?;
            match function {
                "len" => Ok(json!(text.chars().count() as i64)),
                "lower" => Ok(json!(text.to_lowercase())),
                "upper" => Ok(json!(text.to_uppercase())),
                "trim" => Ok(json!(text.trim())),
                "contains" => {
                    let needle = want_string(module, function, args.get(1))?;
                    Ok(json!(text.contains(needle)))
                }
                "starts_with" => {
                    let prefix = want_string(module, function, args.get(1))?;
                    Ok(json!(text.starts_with(prefix)))
                }
                "ends_with" => {
                    let suffix = want_string(module, function, args.get(1))?;
                    Ok(json!(text.ends_with(suffix)))
                }
                "split" => {
                    let separator = want_string(module, function, args.get(1))?;
                    Ok(Value::Array(
                        text.split(separator).map(|part| json!(part)).collect(),
                    ))
                }
                "replace" => {
                    let from = want_string(module, function, args.get(1))?;
                    let to = want_string(module, function, args.get(2))?;
                    Ok(json!(text.replace(from, to)))
                }
                _ => Err(unknown()),
            }
        }
        "re" => {
            let pattern = want_string(module, function, args.first())?;
            let compiled = regex::Regex::new(pattern).map_err(|err| {
                SandboxError::RuntimeFault(format!("invalid pattern: {err}"))
            })?;
            let text = want_string(module, function, args.get(1))?;
            match function {
                "matches" => Ok(json!(compiled.is_match(text))),
                "find" => Ok(compiled
                    .find(text)
                    .map(|found| json!(found.as_str()))
                    .unwrap_or(Value::Null)),
                "replace" => {
                    let replacement = want_string(module, function, args.get(2))?;
                    Ok(json!(compiled.replace_all(text, replacement).into_owned()))
                }
                _ => Err(unknown()),
            }
        }
        "hash" => match function {
            "sha256" => {
                let text = want_string(module, function, args.first())?;
                let mut hasher = Sha256::new();
                hasher.update(text.as_bytes());
                Ok(json!(hex::encode(hasher.finalize())))
            }
            _ => Err(unknown()),
        },
        "math" => {
            let value = args
                .first()
                .and_then(as_f64)
                .ok_or_else(|| non_numeric(function, args.first().unwrap_or(&Value::Null)))?;
            match function {
                "abs" => Ok(json!(value.abs())),
                "floor" => Ok(json!(value.floor() as i64)),
                "ceil" => Ok(json!(value.ceil() as i64)),
                "round" => Ok(json!(value.round() as i64)),
                "min" | "max" => {
                    let other = args
                        .get(1)
                        .and_then(as_f64)
                        .ok_or_else(|| non_numeric(function, args.get(1).unwrap_or(&Value::Null)))?;
                    let result = if function == "min" {
                        value.min(other)
                    } else {
                        value.max(other)
                    };
                    Ok(json!(result))
                }
                _ => Err(unknown()),
            }
        }
        "time" => match function {
            "now" => Ok(json!(chrono::Utc::now().to_rfc3339())),
            _ => Err(unknown()),
        },
        "list" => match function {
            "range" => {
                let count = args.first().and_then(Value::as_i64).ok_or_else(|| {
                    SandboxError::RuntimeFault("list::range expects an integer".into())
                })?;
                Ok(Value::Array((0..count.max(0)).map(|i| json!(i)).collect()))
            }
            "join" => {
                let items = args.first().and_then(Value::as_array).ok_or_else(|| {
                    SandboxError::RuntimeFault("list::join expects a list".into())
                })?;
                let separator = want_string(module, function, args.get(1))?;
                let parts: Result<Vec<&str>, SandboxError> = items
                    .iter()
                    .map(|item| {
                        item.as_str().ok_or_else(|| {
                            SandboxError::RuntimeFault(
                                "list::join expects a list of strings".into(),
                            )
                        })
                    })
                    .collect();
                Ok(json!(parts?.join(separator)))
            }
            "push" => {
                let items = args.first().and_then(Value::as_array).ok_or_else(|| {
                    SandboxError::RuntimeFault("list::push expects a list".into())
                })?;
                let mut out = items.clone();
                out.push(args.get(1).cloned().unwrap_or(Value::Null));
                Ok(Value::Array(out))
            }
            "contains" => {
                let items = args.first().and_then(Value::as_array).ok_or_else(|| {
                    SandboxError::RuntimeFault("list::contains expects a list".into())
                })?;
                let needle = args.get(1).cloned().unwrap_or(Value::Null);
                Ok(json!(items.contains(&needle)))
            }
            "sort" => {
                let items = args.first().and_then(Value::as_array).ok_or_else(|| {
                    SandboxError::RuntimeFault("list::sort expects a list".into())
                })?;
                let mut out = items.clone();
                out.sort_by(|left, right| {
                    compare(left, right).unwrap_or(std::cmp::Ordering::Equal)
                });
                Ok(Value::Array(out))
            }
            _ => Err(unknown()),
        },
        "copy" => match function {
            "deep" => Ok(args.first().cloned().unwrap_or(Value::Null)),
            _ => Err(unknown()),
        },
        _ => Err(SandboxError::ImportDenied(module.to_string())),
    }
}

fn call_builtin(name: &str, args: &[Value]) -> Result<Value, SandboxError> {
    match name {
        "len" => match args.first() {
            Some(Value::String(text)) => Ok(json!(text.chars().count() as i64)),
            Some(Value::Array(items)) => Ok(json!(items.len() as i64)),
            Some(Value::Object(object)) => Ok(json!(object.len() as i64)),
            other => Err(SandboxError::RuntimeFault(format!(
                "len() is undefined for {}",
                type_name(other.unwrap_or(&Value::Null))
            ))),
        },
        "keys" => match args.first() {
            Some(Value::Object(object)) => Ok(Value::Array(
                object.keys().map(|key| json!(key)).collect(),
            )),
            _ => Err(SandboxError::RuntimeFault("keys() expects an object".into())),
        },
        "values" => match args.first() {
            Some(Value::Object(object)) => Ok(Value::Array(object.values().cloned().collect())),
            _ => Err(SandboxError::RuntimeFault(
                "values() expects an object".into(),
            )),
        },
        "int" => match args.first() {
            Some(Value::Number(number)) => Ok(json!(number.as_f64().unwrap_or(0.0) as i64)),
            Some(Value::String(text)) => text
                .trim()
                .parse::<i64>()
                .map(|value| json!(value))
                .map_err(|_| SandboxError::RuntimeFault(format!("int() cannot parse {text:?}"))),
            other => Err(SandboxError::RuntimeFault(format!(
                "int() is undefined for {}",
                type_name(other.unwrap_or(&Value::Null))
            ))),
        },
        "str" => Ok(json!(match args.first() {
            Some(Value::String(text)) => text.clone(),
            Some(other) => other.to_string(),
            None => String::new(),
        })),
        _ => Err(SandboxError::RuntimeFault(format!(
            "unknown function '{name}'"
        ))),
    }
}

// ---------------------------------------------------------------------------
// Loader & compiled genes

/// A parsed allele body ready for repeated execution.
#[derive(Clone, Debug)]
pub struct CompiledGene {
    program: Arc<Program>,
}

impl CompiledGene {
    pub fn compile(source: &str) -> Result<Self, LoadError> {
        let tokens = lex(source)?;
        let mut parser = Parser { tokens, pos: 0 };
        let program = parser.parse_program()?;
        match program.functions.get("execute") {
            Some(decl) if decl.params.len() == 1 => {}
            _ => return Err(LoadError::MissingEntryPoint),
        }
        Ok(Self {
            program: Arc::new(program),
        })
    }

    /// Run `execute(input)` on the calling thread, enforcing the deadline at
    /// statement boundaries. Import checks run here, not at compile time, so
    /// a gene importing a denied module loads fine and fails on invocation.
    pub fn execute_blocking(
        &self,
        input: &str,
        capability: &dyn Capability,
        limit: Duration,
        cancelled: &AtomicBool,
    ) -> Result<String, SandboxError> {
        for module in &self.program.uses {
            if !ALLOWED_MODULES.contains(&module.as_str()) {
                return Err(SandboxError::ImportDenied(module.clone()));
            }
        }
        let mut interp = Interp {
            program: &self.program,
            capability,
            deadline: Instant::now() + limit,
            limit,
            cancelled,
            depth: 0,
        };
        // `sdk` resolves through MethodCall, but bind it so bare references
        // to the name are defined.
        let result = {
            let decl = &self.program.functions["execute"];
            let mut scope: Scope = HashMap::new();
            scope.insert(decl.params[0].clone(), Value::String(input.to_string()));
            scope.insert("sdk".into(), Value::Null);
            match interp.run_block(&decl.body, &mut scope)? {
                Flow::Return(value) => value,
                Flow::Normal(value) => value.unwrap_or(Value::Null),
            }
        };
        match result {
            Value::String(output) => Ok(output),
            other => Err(SandboxError::RuntimeFault(format!(
                "execute returned {}, expected string",
                type_name(&other)
            ))),
        }
    }
}

/// Stateless loader with a digest-keyed cache of compiled programs.
#[derive(Default)]
pub struct GeneLoader {
    cache: Mutex<HashMap<String, CompiledGene>>,
}

impl GeneLoader {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn load(&self, digest: &str, source: &str) -> Result<CompiledGene, LoadError> {
        if let Ok(cache) = self.cache.lock() {
            if let Some(gene) = cache.get(digest) {
                return Ok(gene.clone());
            }
        }
        let gene = CompiledGene::compile(source)?;
        if let Ok(mut cache) = self.cache.lock() {
            cache.insert(digest.to_string(), gene.clone());
        }
        Ok(gene)
    }
}

/// Invoke a compiled gene under the wall-clock limit. The timeout is
/// authoritative; the cancellation flag makes the worker thread stop at its
/// next statement boundary.
pub async fn invoke(
    gene: &CompiledGene,
    input: String,
    capability: Arc<dyn Capability>,
    limit: Duration,
) -> Result<String, SandboxError> {
    let cancelled = Arc::new(AtomicBool::new(false));
    let flag = cancelled.clone();
    let worker = gene.clone();
    let handle = tokio::task::spawn_blocking(move || {
        worker.execute_blocking(&input, capability.as_ref(), limit, &flag)
    });
    match tokio::time::timeout(limit, handle).await {
        Ok(Ok(result)) => result,
        Ok(Err(join_error)) => Err(SandboxError::RuntimeFault(format!(
            "gene execution panicked: {join_error}"
        ))),
        Err(_) => {
            cancelled.store(true, Ordering::Relaxed);
            Err(SandboxError::Timeout { limit })
        }
    }
}
