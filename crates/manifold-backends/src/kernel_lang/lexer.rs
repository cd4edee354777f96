//! Tokenizer for kernel source.
//!
//! Preprocessor lines (`#pragma ...`) and comments are skipped; everything
//! else becomes a [`Token`] tagged with its source position.

use std::fmt;

use super::{BuildError, Pos};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(super) enum IntSuffix {
    None,
    Unsigned,
    Long,
    UnsignedLong,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(super) enum Punct {
    LParen,
    RParen,
    LBrace,
    RBrace,
    LBracket,
    RBracket,
    Comma,
    Semi,
    Question,
    Colon,
    Plus,
    Minus,
    Star,
    Slash,
    Percent,
    Amp,
    Pipe,
    Caret,
    Tilde,
    Bang,
    Lt,
    Gt,
    Le,
    Ge,
    EqEq,
    Ne,
    AndAnd,
    OrOr,
    Shl,
    Shr,
    Assign,
    PlusAssign,
    MinusAssign,
    StarAssign,
    SlashAssign,
    PercentAssign,
    AmpAssign,
    PipeAssign,
    CaretAssign,
    ShlAssign,
    ShrAssign,
    PlusPlus,
    MinusMinus,
}

impl Punct {
    fn as_str(self) -> &'static str {
        match self {
            Punct::LParen => "(",
            Punct::RParen => ")",
            Punct::LBrace => "{",
            Punct::RBrace => "}",
            Punct::LBracket => "[",
            Punct::RBracket => "]",
            Punct::Comma => ",",
            Punct::Semi => ";",
            Punct::Question => "?",
            Punct::Colon => ":",
            Punct::Plus => "+",
            Punct::Minus => "-",
            Punct::Star => "*",
            Punct::Slash => "/",
            Punct::Percent => "%",
            Punct::Amp => "&",
            Punct::Pipe => "|",
            Punct::Caret => "^",
            Punct::Tilde => "~",
            Punct::Bang => "!",
            Punct::Lt => "<",
            Punct::Gt => ">",
            Punct::Le => "<=",
            Punct::Ge => ">=",
            Punct::EqEq => "==",
            Punct::Ne => "!=",
            Punct::AndAnd => "&&",
            Punct::OrOr => "||",
            Punct::Shl => "<<",
            Punct::Shr => ">>",
            Punct::Assign => "=",
            Punct::PlusAssign => "+=",
            Punct::MinusAssign => "-=",
            Punct::StarAssign => "*=",
            Punct::SlashAssign => "/=",
            Punct::PercentAssign => "%=",
            Punct::AmpAssign => "&=",
            Punct::PipeAssign => "|=",
            Punct::CaretAssign => "^=",
            Punct::ShlAssign => "<<=",
            Punct::ShrAssign => ">>=",
            Punct::PlusPlus => "++",
            Punct::MinusMinus => "--",
        }
    }
}

// Longest spellings first so that `<<=` wins over `<<` and `<`.
const PUNCTS: &[(&str, Punct)] = &[
    ("<<=", Punct::ShlAssign),
    (">>=", Punct::ShrAssign),
    ("<<", Punct::Shl),
    (">>", Punct::Shr),
    ("<=", Punct::Le),
    (">=", Punct::Ge),
    ("==", Punct::EqEq),
    ("!=", Punct::Ne),
    ("&&", Punct::AndAnd),
    ("||", Punct::OrOr),
    ("++", Punct::PlusPlus),
    ("--", Punct::MinusMinus),
    ("+=", Punct::PlusAssign),
    ("-=", Punct::MinusAssign),
    ("*=", Punct::StarAssign),
    ("/=", Punct::SlashAssign),
    ("%=", Punct::PercentAssign),
    ("&=", Punct::AmpAssign),
    ("|=", Punct::PipeAssign),
    ("^=", Punct::CaretAssign),
    ("(", Punct::LParen),
    (")", Punct::RParen),
    ("{", Punct::LBrace),
    ("}", Punct::RBrace),
    ("[", Punct::LBracket),
    ("]", Punct::RBracket),
    (",", Punct::Comma),
    (";", Punct::Semi),
    ("?", Punct::Question),
    (":", Punct::Colon),
    ("+", Punct::Plus),
    ("-", Punct::Minus),
    ("*", Punct::Star),
    ("/", Punct::Slash),
    ("%", Punct::Percent),
    ("&", Punct::Amp),
    ("|", Punct::Pipe),
    ("^", Punct::Caret),
    ("~", Punct::Tilde),
    ("!", Punct::Bang),
    ("<", Punct::Lt),
    (">", Punct::Gt),
    ("=", Punct::Assign),
];

#[derive(Debug, Clone, PartialEq)]
pub(super) enum TokenKind {
    Ident(String),
    Int { value: u64, suffix: IntSuffix },
    Float { value: f64, single: bool },
    Punct(Punct),
    Eof,
}

impl fmt::Display for TokenKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TokenKind::Ident(name) => write!(f, "'{name}'"),
            TokenKind::Int { value, .. } => write!(f, "'{value}'"),
            TokenKind::Float { value, .. } => write!(f, "'{value}'"),
            TokenKind::Punct(p) => write!(f, "'{}'", p.as_str()),
            TokenKind::Eof => write!(f, "end of input"),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub(super) struct Token {
    pub kind: TokenKind,
    pub pos: Pos,
}

struct Lexer<'a> {
    input: &'a str,
    position: usize,
    line: u32,
    col: u32,
}

impl<'a> Lexer<'a> {
    fn new(input: &'a str) -> Self {
        Lexer {
            input,
            position: 0,
            line: 1,
            col: 1,
        }
    }

    fn rest(&self) -> &'a str {
        &self.input[self.position..]
    }

    fn peek(&self) -> Option<char> {
        self.rest().chars().next()
    }

    fn peek_second(&self) -> Option<char> {
        self.rest().chars().nth(1)
    }

    fn pos(&self) -> Pos {
        Pos {
            line: self.line,
            col: self.col,
        }
    }

    fn consume(&mut self) -> Option<char> {
        let ch = self.peek()?;
        self.position += ch.len_utf8();
        if ch == '\n' {
            self.line += 1;
            self.col = 1;
        } else {
            self.col += 1;
        }
        Some(ch)
    }

    fn skip_line(&mut self) {
        while let Some(ch) = self.consume() {
            if ch == '\n' {
                break;
            }
        }
    }

    fn skip_trivia(&mut self) -> Result<(), BuildError> {
        loop {
            match self.peek() {
                Some(ch) if ch.is_whitespace() => {
                    self.consume();
                }
                Some('#') => self.skip_line(),
                Some('/') if self.peek_second() == Some('/') => self.skip_line(),
                Some('/') if self.peek_second() == Some('*') => {
                    let start = self.pos();
                    self.consume();
                    self.consume();
                    loop {
                        match self.consume() {
                            Some('*') if self.peek() == Some('/') => {
                                self.consume();
                                break;
                            }
                            Some(_) => {}
                            None => return Err(BuildError::new(start, "unterminated comment")),
                        }
                    }
                }
                _ => return Ok(()),
            }
        }
    }

    fn ident(&mut self) -> TokenKind {
        let start = self.position;
        while matches!(self.peek(), Some(ch) if ch.is_ascii_alphanumeric() || ch == '_') {
            self.consume();
        }
        TokenKind::Ident(self.input[start..self.position].to_string())
    }

    fn number(&mut self, pos: Pos) -> Result<TokenKind, BuildError> {
        let start = self.position;

        if self.peek() == Some('0') && matches!(self.peek_second(), Some('x' | 'X')) {
            self.consume();
            self.consume();
            let digits_start = self.position;
            while matches!(self.peek(), Some(ch) if ch.is_ascii_hexdigit()) {
                self.consume();
            }
            let digits = &self.input[digits_start..self.position];
            let value = u64::from_str_radix(digits, 16)
                .map_err(|_| BuildError::new(pos, format!("invalid hexadecimal literal '0x{digits}'")))?;
            let suffix = self.int_suffix(pos)?;
            return Ok(TokenKind::Int { value, suffix });
        }

        let mut is_float = false;
        while matches!(self.peek(), Some(ch) if ch.is_ascii_digit()) {
            self.consume();
        }
        if self.peek() == Some('.') {
            is_float = true;
            self.consume();
            while matches!(self.peek(), Some(ch) if ch.is_ascii_digit()) {
                self.consume();
            }
        }
        if matches!(self.peek(), Some('e' | 'E')) {
            is_float = true;
            self.consume();
            if matches!(self.peek(), Some('+' | '-')) {
                self.consume();
            }
            while matches!(self.peek(), Some(ch) if ch.is_ascii_digit()) {
                self.consume();
            }
        }
        let text = &self.input[start..self.position];

        if is_float || matches!(self.peek(), Some('f' | 'F')) {
            let value: f64 = text
                .parse()
                .map_err(|_| BuildError::new(pos, format!("invalid floating literal '{text}'")))?;
            let single = matches!(self.peek(), Some('f' | 'F'));
            if single {
                self.consume();
            }
            return Ok(TokenKind::Float { value, single });
        }

        let value: u64 = text
            .parse()
            .map_err(|_| BuildError::new(pos, format!("integer literal '{text}' is too large")))?;
        let suffix = self.int_suffix(pos)?;
        Ok(TokenKind::Int { value, suffix })
    }

    fn int_suffix(&mut self, pos: Pos) -> Result<IntSuffix, BuildError> {
        let mut unsigned = false;
        let mut long = false;
        while let Some(ch) = self.peek() {
            match ch {
                'u' | 'U' if !unsigned => unsigned = true,
                'l' | 'L' => long = true,
                c if c.is_ascii_alphanumeric() || c == '_' => {
                    return Err(BuildError::new(pos, format!("invalid suffix '{c}' on integer literal")));
                }
                _ => break,
            }
            self.consume();
        }
        Ok(match (unsigned, long) {
            (false, false) => IntSuffix::None,
            (true, false) => IntSuffix::Unsigned,
            (false, true) => IntSuffix::Long,
            (true, true) => IntSuffix::UnsignedLong,
        })
    }

    fn punct(&mut self, pos: Pos) -> Result<TokenKind, BuildError> {
        let rest = self.rest();
        for (spelling, punct) in PUNCTS {
            if rest.starts_with(spelling) {
                for _ in 0..spelling.len() {
                    self.consume();
                }
                return Ok(TokenKind::Punct(*punct));
            }
        }
        let ch = self.peek().unwrap_or('?');
        Err(BuildError::new(pos, format!("unexpected character '{ch}'")))
    }

    fn next_token(&mut self) -> Result<Token, BuildError> {
        self.skip_trivia()?;
        let pos = self.pos();
        let kind = match self.peek() {
            None => TokenKind::Eof,
            Some(ch) if ch.is_ascii_alphabetic() || ch == '_' => self.ident(),
            Some(ch) if ch.is_ascii_digit() => self.number(pos)?,
            Some('.') if matches!(self.peek_second(), Some(d) if d.is_ascii_digit()) => self.number(pos)?,
            Some(_) => self.punct(pos)?,
        };
        Ok(Token { kind, pos })
    }
}

/// Split kernel source into tokens, ending with a single [`TokenKind::Eof`].
pub(super) fn tokenize(input: &str) -> Result<Vec<Token>, BuildError> {
    let mut lexer = Lexer::new(input);
    let mut tokens = Vec::new();
    loop {
        let token = lexer.next_token()?;
        let done = token.kind == TokenKind::Eof;
        tokens.push(token);
        if done {
            return Ok(tokens);
        }
    }
}
