//! Recursive descent parser for kernel source.
//!
//! ## Grammar
//!
//! ```text
//! <program>   ::= { <function> }
//! <function>  ::= ["kernel"] ("void" | <type>) <ident> "(" [<params>] ")" <block>
//! <param>     ::= {qualifier} <type> ["*"] {qualifier} <ident>
//! <stmt>      ::= <block> | <decl> ";" | "if" "(" <expr> ")" <stmt> ["else" <stmt>]
//!               | "for" "(" [<decl> | <expr>] ";" [<expr>] ";" [<expr>] ")" <stmt>
//!               | "while" "(" <expr> ")" <stmt> | "return" [<expr>] ";"
//!               | "break" ";" | "continue" ";" | [<expr>] ";"
//! <decl>      ::= ["const"] <type> <ident> ["=" <assign>] { "," <ident> ["=" <assign>] }
//! <assign>    ::= <ternary> [<assign-op> <assign>]
//! <ternary>   ::= <binary> ["?" <assign> ":" <ternary>]
//! <unary>     ::= ("-" | "+" | "!" | "~" | "++" | "--") <unary> | "(" <type> ")" <unary> | <postfix>
//! <postfix>   ::= <primary> { "[" <assign> "]" | "++" | "--" }
//! <primary>   ::= <literal> | <ident> | <ident> "(" [<args>] ")" | "(" <assign> ")"
//! ```
//!
//! Binary operators use C precedence, from `||` (lowest) to `* / %`.

use std::collections::HashMap;

use crate::backend::ScalarType;

use super::ast::{BinaryOp, Builtin, Callee, Expr, Function, Place, Program, Stmt, UnaryOp, VarType};
use super::lexer::{IntSuffix, Punct, Token, TokenKind};
use super::value::Value;
use super::{BuildError, Pos};

const QUALIFIERS: &[&str] = &["const", "global", "__global", "restrict", "__restrict", "volatile"];

struct Signature {
    name: String,
    params: Vec<VarType>,
}

pub(super) struct Parser {
    tokens: Vec<Token>,
    position: usize,
    signatures: Vec<Signature>,
    scopes: Vec<HashMap<String, usize>>,
    slot_types: Vec<VarType>,
    ret: Option<ScalarType>,
}

type PResult<T> = Result<T, BuildError>;

fn scalar_type(name: &str) -> Option<ScalarType> {
    Some(match name {
        "int" | "bool" => ScalarType::I32,
        "uint" => ScalarType::U32,
        "long" => ScalarType::I64,
        "ulong" | "size_t" => ScalarType::U64,
        "float" => ScalarType::F32,
        "double" => ScalarType::F64,
        _ => return None,
    })
}

fn binary_op(punct: Punct) -> Option<(BinaryOp, u8)> {
    Some(match punct {
        Punct::Pipe => (BinaryOp::BitOr, 3),
        Punct::Caret => (BinaryOp::BitXor, 4),
        Punct::Amp => (BinaryOp::BitAnd, 5),
        Punct::EqEq => (BinaryOp::Eq, 6),
        Punct::Ne => (BinaryOp::Ne, 6),
        Punct::Lt => (BinaryOp::Lt, 7),
        Punct::Gt => (BinaryOp::Gt, 7),
        Punct::Le => (BinaryOp::Le, 7),
        Punct::Ge => (BinaryOp::Ge, 7),
        Punct::Shl => (BinaryOp::Shl, 8),
        Punct::Shr => (BinaryOp::Shr, 8),
        Punct::Plus => (BinaryOp::Add, 9),
        Punct::Minus => (BinaryOp::Sub, 9),
        Punct::Star => (BinaryOp::Mul, 10),
        Punct::Slash => (BinaryOp::Div, 10),
        Punct::Percent => (BinaryOp::Rem, 10),
        _ => return None,
    })
}

fn assign_op(punct: Punct) -> Option<Option<BinaryOp>> {
    Some(match punct {
        Punct::Assign => None,
        Punct::PlusAssign => Some(BinaryOp::Add),
        Punct::MinusAssign => Some(BinaryOp::Sub),
        Punct::StarAssign => Some(BinaryOp::Mul),
        Punct::SlashAssign => Some(BinaryOp::Div),
        Punct::PercentAssign => Some(BinaryOp::Rem),
        Punct::AmpAssign => Some(BinaryOp::BitAnd),
        Punct::PipeAssign => Some(BinaryOp::BitOr),
        Punct::CaretAssign => Some(BinaryOp::BitXor),
        Punct::ShlAssign => Some(BinaryOp::Shl),
        Punct::ShrAssign => Some(BinaryOp::Shr),
        _ => return None,
    })
}

fn int_literal(value: u64, suffix: IntSuffix) -> Value {
    match suffix {
        IntSuffix::None if value <= i32::MAX as u64 => Value::I32(value as i32),
        IntSuffix::None | IntSuffix::Long if value <= i64::MAX as u64 => Value::I64(value as i64),
        IntSuffix::Unsigned if value <= u32::MAX as u64 => Value::U32(value as u32),
        _ => Value::U64(value),
    }
}

impl Parser {
    pub(super) fn new(tokens: Vec<Token>) -> Self {
        Parser {
            tokens,
            position: 0,
            signatures: Vec::new(),
            scopes: Vec::new(),
            slot_types: Vec::new(),
            ret: None,
        }
    }

    // ------------------------------------------------------------------
    // Token helpers
    // ------------------------------------------------------------------

    fn peek(&self) -> &TokenKind {
        &self.tokens[self.position.min(self.tokens.len() - 1)].kind
    }

    fn peek_at(&self, offset: usize) -> &TokenKind {
        &self.tokens[(self.position + offset).min(self.tokens.len() - 1)].kind
    }

    fn pos(&self) -> Pos {
        self.tokens[self.position.min(self.tokens.len() - 1)].pos
    }

    fn advance(&mut self) -> TokenKind {
        let kind = self.peek().clone();
        if self.position < self.tokens.len() - 1 {
            self.position += 1;
        }
        kind
    }

    fn error<T>(&self, message: impl Into<String>) -> PResult<T> {
        Err(BuildError::new(self.pos(), message))
    }

    fn is_punct(&self, punct: Punct) -> bool {
        *self.peek() == TokenKind::Punct(punct)
    }

    fn eat_punct(&mut self, punct: Punct) -> bool {
        if self.is_punct(punct) {
            self.advance();
            true
        } else {
            false
        }
    }

    fn expect_punct(&mut self, punct: Punct, what: &str) -> PResult<()> {
        if self.eat_punct(punct) {
            Ok(())
        } else {
            self.error(format!("expected {what}, found {}", self.peek()))
        }
    }

    fn is_keyword(&self, keyword: &str) -> bool {
        matches!(self.peek(), TokenKind::Ident(name) if name == keyword)
    }

    fn eat_keyword(&mut self, keyword: &str) -> bool {
        if self.is_keyword(keyword) {
            self.advance();
            true
        } else {
            false
        }
    }

    fn expect_ident(&mut self, what: &str) -> PResult<String> {
        match self.peek().clone() {
            TokenKind::Ident(name) => {
                self.advance();
                Ok(name)
            }
            other => self.error(format!("expected {what}, found {other}")),
        }
    }

    fn skip_qualifiers(&mut self) {
        while let TokenKind::Ident(name) = self.peek() {
            if QUALIFIERS.contains(&name.as_str()) {
                self.advance();
            } else {
                break;
            }
        }
    }

    fn is_type_start_at(&self, offset: usize) -> bool {
        match self.peek_at(offset) {
            TokenKind::Ident(name) => {
                scalar_type(name).is_some() || name == "unsigned" || QUALIFIERS.contains(&name.as_str())
            }
            _ => false,
        }
    }

    fn parse_type(&mut self) -> PResult<ScalarType> {
        self.skip_qualifiers();
        if self.eat_keyword("unsigned") {
            if self.eat_keyword("long") {
                return Ok(ScalarType::U64);
            }
            self.eat_keyword("int");
            return Ok(ScalarType::U32);
        }
        let name = self.expect_ident("type name")?;
        match scalar_type(&name) {
            Some(ty) => Ok(ty),
            None => Err(BuildError::new(
                self.tokens[self.position.saturating_sub(1)].pos,
                format!("unknown type name '{name}'"),
            )),
        }
    }

    // ------------------------------------------------------------------
    // Scopes
    // ------------------------------------------------------------------

    fn declare(&mut self, name: String, ty: VarType, pos: Pos) -> PResult<usize> {
        let slot = self.slot_types.len();
        let scope = match self.scopes.last_mut() {
            Some(scope) => scope,
            None => return Err(BuildError::new(pos, "declaration outside of a function")),
        };
        if scope.contains_key(&name) {
            return Err(BuildError::new(pos, format!("redefinition of '{name}'")));
        }
        scope.insert(name, slot);
        self.slot_types.push(ty);
        Ok(slot)
    }

    fn lookup(&self, name: &str) -> Option<usize> {
        self.scopes.iter().rev().find_map(|scope| scope.get(name).copied())
    }

    // ------------------------------------------------------------------
    // Top level
    // ------------------------------------------------------------------

    pub(super) fn parse_program(mut self) -> PResult<Program> {
        let mut functions = Vec::new();
        while *self.peek() != TokenKind::Eof {
            functions.push(self.parse_function()?);
        }
        Ok(Program { functions })
    }

    fn parse_function(&mut self) -> PResult<Function> {
        let start = self.pos();
        let is_kernel = self.eat_keyword("kernel") || self.eat_keyword("__kernel");
        while self.eat_keyword("inline") || self.eat_keyword("static") {}

        let ret = if self.eat_keyword("void") {
            None
        } else {
            Some(self.parse_type()?)
        };
        if is_kernel && ret.is_some() {
            return Err(BuildError::new(start, "kernel functions must return void"));
        }

        let name_pos = self.pos();
        let name = self.expect_ident("function name")?;
        if self.signatures.iter().any(|s| s.name == name) {
            return Err(BuildError::new(name_pos, format!("redefinition of '{name}'")));
        }

        self.scopes = vec![HashMap::new()];
        self.slot_types.clear();
        self.ret = ret;

        self.expect_punct(Punct::LParen, "'('")?;
        let mut params = Vec::new();
        if !(self.is_keyword("void") && *self.peek_at(1) == TokenKind::Punct(Punct::RParen))
            && !self.is_punct(Punct::RParen)
        {
            loop {
                let ty = self.parse_type()?;
                let ty = if self.eat_punct(Punct::Star) {
                    VarType::Pointer(ty)
                } else {
                    VarType::Scalar(ty)
                };
                self.skip_qualifiers();
                let pos = self.pos();
                let param = self.expect_ident("parameter name")?;
                self.declare(param, ty, pos)?;
                params.push(ty);
                if !self.eat_punct(Punct::Comma) {
                    break;
                }
            }
        } else {
            self.eat_keyword("void");
        }
        self.expect_punct(Punct::RParen, "')'")?;

        if self.is_punct(Punct::Semi) {
            return self.error("function prototypes are not supported; define the function before use");
        }

        // Registered before the body so that recursion resolves.
        self.signatures.push(Signature {
            name: name.clone(),
            params: params.clone(),
        });

        let body = self.parse_block_body()?;

        Ok(Function {
            name,
            is_kernel,
            ret,
            params,
            frame_size: self.slot_types.len(),
            body,
        })
    }

    // ------------------------------------------------------------------
    // Statements
    // ------------------------------------------------------------------

    fn parse_block_body(&mut self) -> PResult<Vec<Stmt>> {
        self.expect_punct(Punct::LBrace, "'{'")?;
        self.scopes.push(HashMap::new());
        let mut stmts = Vec::new();
        while !self.eat_punct(Punct::RBrace) {
            if *self.peek() == TokenKind::Eof {
                return self.error("expected '}' before end of input");
            }
            stmts.push(self.parse_stmt()?);
        }
        self.scopes.pop();
        Ok(stmts)
    }

    fn parse_stmt(&mut self) -> PResult<Stmt> {
        if self.is_punct(Punct::LBrace) {
            return Ok(Stmt::Block(self.parse_block_body()?));
        }
        if self.eat_punct(Punct::Semi) {
            return Ok(Stmt::Block(Vec::new()));
        }
        if self.eat_keyword("if") {
            self.expect_punct(Punct::LParen, "'(' after 'if'")?;
            let cond = self.parse_expr()?;
            self.expect_punct(Punct::RParen, "')'")?;
            let then = Box::new(self.parse_stmt()?);
            let otherwise = if self.eat_keyword("else") {
                Some(Box::new(self.parse_stmt()?))
            } else {
                None
            };
            return Ok(Stmt::If { cond, then, otherwise });
        }
        if self.eat_keyword("for") {
            return self.parse_for();
        }
        if self.eat_keyword("while") {
            self.expect_punct(Punct::LParen, "'(' after 'while'")?;
            let cond = self.parse_expr()?;
            self.expect_punct(Punct::RParen, "')'")?;
            let body = Box::new(self.parse_stmt()?);
            return Ok(Stmt::While { cond, body });
        }
        if self.is_keyword("return") {
            let pos = self.pos();
            self.advance();
            let value = if self.is_punct(Punct::Semi) {
                None
            } else {
                Some(self.parse_expr()?)
            };
            match (&value, self.ret) {
                (Some(_), None) => return Err(BuildError::new(pos, "void function should not return a value")),
                (None, Some(_)) => return Err(BuildError::new(pos, "non-void function should return a value")),
                _ => {}
            }
            self.expect_punct(Punct::Semi, "';'")?;
            return Ok(Stmt::Return(value));
        }
        if self.eat_keyword("break") {
            self.expect_punct(Punct::Semi, "';'")?;
            return Ok(Stmt::Break);
        }
        if self.eat_keyword("continue") {
            self.expect_punct(Punct::Semi, "';'")?;
            return Ok(Stmt::Continue);
        }
        if self.is_type_start_at(0) {
            let decl = self.parse_decl()?;
            self.expect_punct(Punct::Semi, "';'")?;
            return Ok(decl);
        }
        let expr = self.parse_expr()?;
        self.expect_punct(Punct::Semi, "';'")?;
        Ok(Stmt::Expr(expr))
    }

    fn parse_for(&mut self) -> PResult<Stmt> {
        self.expect_punct(Punct::LParen, "'(' after 'for'")?;
        self.scopes.push(HashMap::new());

        let init = if self.eat_punct(Punct::Semi) {
            None
        } else if self.is_type_start_at(0) {
            let decl = self.parse_decl()?;
            self.expect_punct(Punct::Semi, "';'")?;
            Some(Box::new(decl))
        } else {
            let expr = self.parse_expr()?;
            self.expect_punct(Punct::Semi, "';'")?;
            Some(Box::new(Stmt::Expr(expr)))
        };

        let cond = if self.is_punct(Punct::Semi) {
            None
        } else {
            Some(self.parse_expr()?)
        };
        self.expect_punct(Punct::Semi, "';'")?;

        let step = if self.is_punct(Punct::RParen) {
            None
        } else {
            Some(self.parse_expr()?)
        };
        self.expect_punct(Punct::RParen, "')'")?;

        let body = Box::new(self.parse_stmt()?);
        self.scopes.pop();
        Ok(Stmt::For { init, cond, step, body })
    }

    fn parse_decl(&mut self) -> PResult<Stmt> {
        let ty = self.parse_type()?;
        self.skip_qualifiers();
        let mut declarators = Vec::new();
        loop {
            if self.is_punct(Punct::Star) {
                return self.error("pointer locals are not supported");
            }
            let pos = self.pos();
            let name = self.expect_ident("variable name")?;
            let init = if self.eat_punct(Punct::Assign) {
                Some(self.parse_assign()?)
            } else {
                None
            };
            let slot = self.declare(name, VarType::Scalar(ty), pos)?;
            declarators.push((slot, ty, init));
            if !self.eat_punct(Punct::Comma) {
                break;
            }
        }
        Ok(Stmt::Decl(declarators))
    }

    // ------------------------------------------------------------------
    // Expressions
    // ------------------------------------------------------------------

    fn parse_expr(&mut self) -> PResult<Expr> {
        self.parse_assign()
    }

    fn into_place(&self, expr: Expr, pos: Pos) -> PResult<Place> {
        match expr {
            Expr::Local(slot) => match self.slot_types[slot] {
                VarType::Scalar(ty) => Ok(Place::Local { slot, ty }),
                VarType::Pointer(_) => Err(BuildError::new(pos, "cannot assign to a pointer parameter")),
            },
            Expr::Index { slot, elem, index } => Ok(Place::Element { slot, elem, index }),
            _ => Err(BuildError::new(pos, "expression is not assignable")),
        }
    }

    fn parse_assign(&mut self) -> PResult<Expr> {
        let pos = self.pos();
        let lhs = self.parse_ternary()?;
        let op = match self.peek() {
            TokenKind::Punct(p) => assign_op(*p),
            _ => None,
        };
        match op {
            Some(op) => {
                self.advance();
                let target = self.into_place(lhs, pos)?;
                let value = Box::new(self.parse_assign()?);
                Ok(Expr::Assign { target, op, value })
            }
            None => Ok(lhs),
        }
    }

    fn parse_ternary(&mut self) -> PResult<Expr> {
        let cond = self.parse_binary(1)?;
        if !self.eat_punct(Punct::Question) {
            return Ok(cond);
        }
        let a = self.parse_assign()?;
        self.expect_punct(Punct::Colon, "':' in conditional expression")?;
        let b = self.parse_ternary()?;
        Ok(Expr::Ternary(Box::new(cond), Box::new(a), Box::new(b)))
    }

    fn parse_binary(&mut self, min_prec: u8) -> PResult<Expr> {
        let mut lhs = self.parse_unary()?;
        loop {
            let punct = match self.peek() {
                TokenKind::Punct(p) => *p,
                _ => return Ok(lhs),
            };
            match punct {
                Punct::OrOr if min_prec <= 1 => {
                    self.advance();
                    let rhs = self.parse_binary(2)?;
                    lhs = Expr::Or(Box::new(lhs), Box::new(rhs));
                }
                Punct::AndAnd if min_prec <= 2 => {
                    self.advance();
                    let rhs = self.parse_binary(3)?;
                    lhs = Expr::And(Box::new(lhs), Box::new(rhs));
                }
                _ => match binary_op(punct) {
                    Some((op, prec)) if prec >= min_prec => {
                        self.advance();
                        let rhs = self.parse_binary(prec + 1)?;
                        lhs = Expr::Binary(op, Box::new(lhs), Box::new(rhs));
                    }
                    _ => return Ok(lhs),
                },
            }
        }
    }

    fn parse_unary(&mut self) -> PResult<Expr> {
        let pos = self.pos();
        let op = match self.peek() {
            TokenKind::Punct(Punct::Minus) => Some(UnaryOp::Neg),
            TokenKind::Punct(Punct::Plus) => Some(UnaryOp::Plus),
            TokenKind::Punct(Punct::Bang) => Some(UnaryOp::Not),
            TokenKind::Punct(Punct::Tilde) => Some(UnaryOp::BitNot),
            _ => None,
        };
        if let Some(op) = op {
            self.advance();
            let operand = self.parse_unary()?;
            return Ok(Expr::Unary(op, Box::new(operand)));
        }

        for (punct, delta) in [(Punct::PlusPlus, 1), (Punct::MinusMinus, -1)] {
            if self.eat_punct(punct) {
                let operand = self.parse_unary()?;
                let target = self.into_place(operand, pos)?;
                return Ok(Expr::Step {
                    target,
                    delta,
                    prefix: true,
                });
            }
        }

        if self.is_punct(Punct::LParen) && self.is_type_start_at(1) {
            self.advance();
            let ty = self.parse_type()?;
            self.expect_punct(Punct::RParen, "')' after cast type")?;
            let operand = self.parse_unary()?;
            return Ok(Expr::Cast(ty, Box::new(operand)));
        }

        self.parse_postfix()
    }

    fn parse_postfix(&mut self) -> PResult<Expr> {
        let pos = self.pos();
        let mut expr = self.parse_primary()?;
        loop {
            if self.eat_punct(Punct::LBracket) {
                let slot = match expr {
                    Expr::Local(slot) => slot,
                    _ => return Err(BuildError::new(pos, "subscripted value is not a pointer")),
                };
                let elem = match self.slot_types[slot] {
                    VarType::Pointer(elem) => elem,
                    VarType::Scalar(_) => return Err(BuildError::new(pos, "subscripted value is not a pointer")),
                };
                let index = Box::new(self.parse_expr()?);
                self.expect_punct(Punct::RBracket, "']'")?;
                expr = Expr::Index { slot, elem, index };
            } else if self.is_punct(Punct::PlusPlus) || self.is_punct(Punct::MinusMinus) {
                let delta = if self.eat_punct(Punct::PlusPlus) {
                    1
                } else {
                    self.advance();
                    -1
                };
                let target = self.into_place(expr, pos)?;
                expr = Expr::Step {
                    target,
                    delta,
                    prefix: false,
                };
            } else {
                return Ok(expr);
            }
        }
    }

    fn parse_primary(&mut self) -> PResult<Expr> {
        let pos = self.pos();
        match self.advance() {
            TokenKind::Int { value, suffix } => Ok(Expr::Const(int_literal(value, suffix))),
            TokenKind::Float { value, single: true } => Ok(Expr::Const(Value::F32(value as f32))),
            TokenKind::Float { value, single: false } => Ok(Expr::Const(Value::F64(value))),
            TokenKind::Punct(Punct::LParen) => {
                let expr = self.parse_expr()?;
                self.expect_punct(Punct::RParen, "')'")?;
                Ok(expr)
            }
            TokenKind::Ident(name) => {
                if self.is_punct(Punct::LParen) {
                    return self.parse_call(name, pos);
                }
                match name.as_str() {
                    "INFINITY" => return Ok(Expr::Const(Value::F32(f32::INFINITY))),
                    "NAN" => return Ok(Expr::Const(Value::F32(f32::NAN))),
                    "true" => return Ok(Expr::Const(Value::I32(1))),
                    "false" => return Ok(Expr::Const(Value::I32(0))),
                    _ => {}
                }
                match self.lookup(&name) {
                    Some(slot) => Ok(Expr::Local(slot)),
                    None => Err(BuildError::new(pos, format!("use of undeclared identifier '{name}'"))),
                }
            }
            other => Err(BuildError::new(pos, format!("expected expression, found {other}"))),
        }
    }

    fn parse_call(&mut self, name: String, pos: Pos) -> PResult<Expr> {
        self.expect_punct(Punct::LParen, "'('")?;
        let mut args = Vec::new();
        if !self.eat_punct(Punct::RParen) {
            loop {
                args.push(self.parse_assign()?);
                if self.eat_punct(Punct::RParen) {
                    break;
                }
                self.expect_punct(Punct::Comma, "',' or ')' in argument list")?;
            }
        }

        let (callee, arity) = if let Some(index) = self.signatures.iter().position(|s| s.name == name) {
            (Callee::Function(index), self.signatures[index].params.len())
        } else if let Some(builtin) = Builtin::lookup(&name) {
            (Callee::Builtin(builtin), builtin.arity())
        } else {
            return Err(BuildError::new(pos, format!("implicit declaration of function '{name}'")));
        };

        if args.len() != arity {
            return Err(BuildError::new(
                pos,
                format!("'{name}' expects {arity} argument(s), {} given", args.len()),
            ));
        }
        Ok(Expr::Call { callee, args })
    }
}
