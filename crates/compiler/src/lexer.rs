//! Lexer: byte stream to token stream.
//!
//! Input is consumed one logical line at a time; a trailing backslash
//! joins physical lines, and block comments may span lines. Up to two
//! tokens can be pushed back, which is all the declaration grammar needs.
//! Identifiers are interned as they are lexed; keywords are recognized by
//! a table lookup on the interned name.

use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;

use crate::diag::{CompileError, Diagnostics};
use crate::symbols::{Name, NameTable};
use crate::types::FixnumKind;

pub const MAX_LOOKAHEAD: usize = 2;

/// One logical source line, shared by every token lexed from it.
#[derive(Debug)]
pub struct Line {
    pub filename: Rc<str>,
    pub lineno: u32,
    pub text: String,
}

#[derive(Debug, Clone, PartialEq)]
pub enum TokenKind {
    Eof,

    // Punctuators.
    Add,          // +
    Sub,          // -
    Mul,          // *
    Div,          // /
    Mod,          // %
    Amp,          // &
    Or,           // |
    Hat,          // ^
    Lt,           // <
    Gt,           // >
    Not,          // !
    LParen,       // (
    RParen,       // )
    LBrace,       // {
    RBrace,       // }
    LBracket,     // [
    RBracket,     // ]
    Assign,       // =
    Colon,        // :
    Semicolon,    // ;
    Comma,        // ,
    Dot,          // .
    Question,     // ?
    Tilde,        // ~
    LShift,       // <<
    RShift,       // >>
    Eq,           // ==
    Ne,           // !=
    Le,           // <=
    Ge,           // >=
    LogAnd,       // &&
    LogOr,        // ||
    Arrow,        // ->
    AddAssign,    // +=
    SubAssign,    // -=
    MulAssign,    // *=
    DivAssign,    // /=
    ModAssign,    // %=
    AndAssign,    // &=
    OrAssign,     // |=
    HatAssign,    // ^=
    LShiftAssign, // <<=
    RShiftAssign, // >>=
    Inc,          // ++
    Dec,          // --
    Ellipsis,     // ...
    PpConcat,     // ## (only meaningful to the preprocessor)
    PpStringify,  // #

    // Keywords.
    If,
    Else,
    Switch,
    Case,
    Default,
    Do,
    While,
    For,
    Break,
    Continue,
    Goto,
    Return,
    Void,
    Char,
    Short,
    Int,
    Long,
    Unsigned,
    Signed,
    Const,
    Static,
    Inline,
    Extern,
    Volatile,
    Struct,
    Union,
    Enum,
    Sizeof,
    Alignof,
    Typedef,
    Float,
    Double,
    Asm,

    // Literals and identifiers.
    IntLit { value: i64, kind: FixnumKind, unsigned: bool },
    FloatLit { value: f64, single: bool },
    Str(Rc<Vec<u8>>),
    Ident(Name),
}

#[derive(Debug, Clone)]
pub struct Token {
    pub kind: TokenKind,
    pub line: Rc<Line>,
    /// Byte range within `line.text` for caret rendering.
    pub begin: usize,
    pub end: usize,
}

impl Token {
    pub fn ident(&self) -> Option<Name> {
        match self.kind {
            TokenKind::Ident(name) => Some(name),
            _ => None,
        }
    }
}

/// Keywords are recognized by interned-name lookup after identifier lex.
fn keyword_entries() -> Vec<(&'static str, TokenKind)> {
    vec![
        ("if", TokenKind::If),
        ("else", TokenKind::Else),
        ("switch", TokenKind::Switch),
        ("case", TokenKind::Case),
        ("default", TokenKind::Default),
        ("do", TokenKind::Do),
        ("while", TokenKind::While),
        ("for", TokenKind::For),
        ("break", TokenKind::Break),
        ("continue", TokenKind::Continue),
        ("goto", TokenKind::Goto),
        ("return", TokenKind::Return),
        ("void", TokenKind::Void),
        ("char", TokenKind::Char),
        ("short", TokenKind::Short),
        ("int", TokenKind::Int),
        ("long", TokenKind::Long),
        ("unsigned", TokenKind::Unsigned),
        ("signed", TokenKind::Signed),
        ("const", TokenKind::Const),
        ("static", TokenKind::Static),
        ("inline", TokenKind::Inline),
        ("extern", TokenKind::Extern),
        ("volatile", TokenKind::Volatile),
        ("struct", TokenKind::Struct),
        ("union", TokenKind::Union),
        ("enum", TokenKind::Enum),
        ("sizeof", TokenKind::Sizeof),
        ("_Alignof", TokenKind::Alignof),
        ("typedef", TokenKind::Typedef),
        ("float", TokenKind::Float),
        ("double", TokenKind::Double),
        ("__asm", TokenKind::Asm),
    ]
}

/// Called at logical end of input; may supply another chunk of source.
pub type EofCallback = Box<dyn FnMut() -> Option<String>>;

pub struct Lexer {
    names: Rc<RefCell<NameTable>>,
    diags: Rc<RefCell<Diagnostics>>,
    keywords: HashMap<Name, TokenKind>,

    filename: Rc<str>,
    physical: Vec<String>,
    next_physical: usize,
    lineno: u32,

    line: Rc<Line>,
    p: usize,

    fetched: Vec<Token>,
    eof_callback: Option<EofCallback>,
}

fn split_physical_lines(source: &str) -> Vec<String> {
    source.split_inclusive('\n').map(|s| s.to_string()).collect()
}

impl Lexer {
    pub fn new(
        source: &str,
        filename: &str,
        names: Rc<RefCell<NameTable>>,
        diags: Rc<RefCell<Diagnostics>>,
    ) -> Lexer {
        let keywords = {
            let mut table = names.borrow_mut();
            keyword_entries()
                .into_iter()
                .map(|(word, kind)| (table.intern(word), kind))
                .collect()
        };
        let filename: Rc<str> = filename.into();
        let empty = Rc::new(Line { filename: filename.clone(), lineno: 0, text: String::new() });
        Lexer {
            names,
            diags,
            keywords,
            filename,
            physical: split_physical_lines(source),
            next_physical: 0,
            lineno: 0,
            line: empty,
            p: 0,
            fetched: Vec::new(),
            eof_callback: None,
        }
    }

    /// Replace the remaining input with `text`, numbering from `lineno`.
    pub fn set_source_string(&mut self, text: &str, lineno: u32) {
        self.physical = split_physical_lines(text);
        self.next_physical = 0;
        self.lineno = lineno.saturating_sub(1);
        self.line = Rc::new(Line {
            filename: self.filename.clone(),
            lineno: self.lineno,
            text: String::new(),
        });
        self.p = 0;
        self.fetched.clear();
    }

    /// Install a callback consulted at end of input. Returns the old one.
    pub fn set_eof_callback(&mut self, callback: Option<EofCallback>) -> Option<EofCallback> {
        std::mem::replace(&mut self.eof_callback, callback)
    }

    pub fn unget(&mut self, token: Token) {
        debug_assert!(self.fetched.len() < MAX_LOOKAHEAD);
        self.fetched.push(token);
    }

    /// Consume the next token if it equals `kind` (unit kinds only).
    pub fn matches(&mut self, kind: &TokenKind) -> Result<Option<Token>, CompileError> {
        let token = self.fetch()?;
        if token.kind == *kind {
            Ok(Some(token))
        } else {
            self.unget(token);
            Ok(None)
        }
    }

    /// Consume the next token if it is an identifier.
    pub fn match_ident(&mut self) -> Result<Option<Token>, CompileError> {
        let token = self.fetch()?;
        if matches!(token.kind, TokenKind::Ident(_)) {
            Ok(Some(token))
        } else {
            self.unget(token);
            Ok(None)
        }
    }

    pub fn fetch(&mut self) -> Result<Token, CompileError> {
        if let Some(token) = self.fetched.pop() {
            return Ok(token);
        }
        let token = self.lex_one()?;
        // Adjacent string literals concatenate into one token.
        if let TokenKind::Str(first) = &token.kind {
            let mut bytes = first.as_ref().clone();
            let mut merged = token.clone();
            loop {
                let next = self.lex_one()?;
                match &next.kind {
                    TokenKind::Str(more) => {
                        bytes.pop(); // drop the previous terminator
                        bytes.extend_from_slice(more);
                        merged.end = next.end;
                        merged.line = next.line.clone();
                        merged.begin = next.begin;
                    }
                    _ => {
                        self.unget(next);
                        break;
                    }
                }
            }
            merged.kind = TokenKind::Str(Rc::new(bytes));
            return Ok(merged);
        }
        Ok(token)
    }

    fn make_token(&self, kind: TokenKind, begin: usize) -> Token {
        Token { kind, line: self.line.clone(), begin, end: self.p }
    }

    fn bytes(&self) -> &[u8] {
        self.line.text.as_bytes()
    }

    fn peek(&self) -> Option<u8> {
        self.bytes().get(self.p).copied()
    }

    fn peek_at(&self, offset: usize) -> Option<u8> {
        self.bytes().get(self.p + offset).copied()
    }

    /// Pull the next logical line, joining backslash continuations.
    fn read_line(&mut self) -> bool {
        if self.next_physical >= self.physical.len() {
            return false;
        }
        let mut text = String::new();
        let first_lineno = self.lineno + 1;
        loop {
            if self.next_physical >= self.physical.len() {
                break;
            }
            let mut chunk = self.physical[self.next_physical].clone();
            self.next_physical += 1;
            self.lineno += 1;
            let trimmed = chunk.trim_end_matches('\n');
            if trimmed.ends_with('\\') {
                chunk = trimmed[..trimmed.len() - 1].to_string();
                text.push_str(&chunk);
                continue;
            }
            text.push_str(&chunk);
            break;
        }
        self.line = Rc::new(Line { filename: self.filename.clone(), lineno: first_lineno, text });
        self.p = 0;
        true
    }

    fn lex_error(&mut self, begin: usize, message: String) -> Result<(), CompileError> {
        let end = self.p.max(begin + 1);
        self.diags.borrow_mut().error_on_line(self.line.clone(), (begin, end), message)
    }

    /// Skip whitespace and comments, crossing lines as needed.
    /// Returns false at end of input.
    fn skip_blanks(&mut self) -> Result<bool, CompileError> {
        loop {
            match self.peek() {
                None | Some(b'\n') => {
                    if !self.read_line() {
                        if let Some(callback) = self.eof_callback.as_mut() {
                            if let Some(more) = callback() {
                                let lineno = self.lineno;
                                let fetched = std::mem::take(&mut self.fetched);
                                self.set_source_string(&more, lineno + 1);
                                self.fetched = fetched;
                                continue;
                            }
                        }
                        return Ok(false);
                    }
                }
                Some(c) if c.is_ascii_whitespace() => self.p += 1,
                Some(b'/') if self.peek_at(1) == Some(b'/') => {
                    self.p = self.bytes().len();
                }
                Some(b'/') if self.peek_at(1) == Some(b'*') => {
                    let begin = self.p;
                    self.p += 2;
                    if !self.skip_block_comment()? {
                        self.lex_error(begin, "Block comment not closed".to_string())?;
                        return Ok(false);
                    }
                }
                _ => return Ok(true),
            }
        }
    }

    fn skip_block_comment(&mut self) -> Result<bool, CompileError> {
        loop {
            match self.peek() {
                None => {
                    if !self.read_line() {
                        return Ok(false);
                    }
                }
                Some(b'*') if self.peek_at(1) == Some(b'/') => {
                    self.p += 2;
                    return Ok(true);
                }
                _ => self.p += 1,
            }
        }
    }

    fn lex_one(&mut self) -> Result<Token, CompileError> {
        loop {
            if !self.skip_blanks()? {
                return Ok(self.make_token(TokenKind::Eof, self.p));
            }
            let begin = self.p;
            let c = self.peek().unwrap();

            if c == b'_' || c.is_ascii_alphabetic() {
                return Ok(self.lex_ident(begin));
            }
            if c.is_ascii_digit()
                || (c == b'.' && self.peek_at(1).is_some_and(|d| d.is_ascii_digit()))
            {
                return self.lex_number(begin);
            }
            if c == b'"' {
                return self.lex_string(begin);
            }
            if c == b'\'' {
                return self.lex_char(begin);
            }
            if let Some(token) = self.lex_punct(begin) {
                return Ok(token);
            }

            self.p += 1;
            self.lex_error(begin, format!("Unexpected character `{}'", c as char))?;
            // Recover: drop the character and keep lexing.
        }
    }

    fn lex_ident(&mut self, begin: usize) -> Token {
        while self
            .peek()
            .is_some_and(|c| c == b'_' || c.is_ascii_alphanumeric())
        {
            self.p += 1;
        }
        let text = &self.line.text[begin..self.p];
        let name = self.names.borrow_mut().intern(text);
        let kind = match self.keywords.get(&name) {
            Some(keyword) => keyword.clone(),
            None => TokenKind::Ident(name),
        };
        self.make_token(kind, begin)
    }

    fn lex_punct(&mut self, begin: usize) -> Option<Token> {
        let three: [(&[u8], TokenKind); 3] = [
            (b"<<=", TokenKind::LShiftAssign),
            (b">>=", TokenKind::RShiftAssign),
            (b"...", TokenKind::Ellipsis),
        ];
        let two: [(&[u8], TokenKind); 20] = [
            (b"<<", TokenKind::LShift),
            (b">>", TokenKind::RShift),
            (b"==", TokenKind::Eq),
            (b"!=", TokenKind::Ne),
            (b"<=", TokenKind::Le),
            (b">=", TokenKind::Ge),
            (b"&&", TokenKind::LogAnd),
            (b"||", TokenKind::LogOr),
            (b"->", TokenKind::Arrow),
            (b"+=", TokenKind::AddAssign),
            (b"-=", TokenKind::SubAssign),
            (b"*=", TokenKind::MulAssign),
            (b"/=", TokenKind::DivAssign),
            (b"%=", TokenKind::ModAssign),
            (b"&=", TokenKind::AndAssign),
            (b"|=", TokenKind::OrAssign),
            (b"^=", TokenKind::HatAssign),
            (b"++", TokenKind::Inc),
            (b"--", TokenKind::Dec),
            (b"##", TokenKind::PpConcat),
        ];
        let one: [(u8, TokenKind); 25] = [
            (b'+', TokenKind::Add),
            (b'-', TokenKind::Sub),
            (b'*', TokenKind::Mul),
            (b'/', TokenKind::Div),
            (b'%', TokenKind::Mod),
            (b'&', TokenKind::Amp),
            (b'|', TokenKind::Or),
            (b'^', TokenKind::Hat),
            (b'<', TokenKind::Lt),
            (b'>', TokenKind::Gt),
            (b'!', TokenKind::Not),
            (b'(', TokenKind::LParen),
            (b')', TokenKind::RParen),
            (b'{', TokenKind::LBrace),
            (b'}', TokenKind::RBrace),
            (b'[', TokenKind::LBracket),
            (b']', TokenKind::RBracket),
            (b'=', TokenKind::Assign),
            (b':', TokenKind::Colon),
            (b';', TokenKind::Semicolon),
            (b',', TokenKind::Comma),
            (b'.', TokenKind::Dot),
            (b'?', TokenKind::Question),
            (b'~', TokenKind::Tilde),
            (b'#', TokenKind::PpStringify),
        ];

        let first = self.peek()?;
        let second = self.peek_at(1);
        let third = self.peek_at(2);
        for (pat, kind) in three {
            if pat[0] == first && second == Some(pat[1]) && third == Some(pat[2]) {
                self.p += 3;
                return Some(self.make_token(kind, begin));
            }
        }
        for (pat, kind) in two {
            if pat[0] == first && second == Some(pat[1]) {
                self.p += 2;
                return Some(self.make_token(kind, begin));
            }
        }
        for (ch, kind) in one {
            if ch == first {
                self.p += 1;
                return Some(self.make_token(kind, begin));
            }
        }
        None
    }

    fn lex_number(&mut self, begin: usize) -> Result<Token, CompileError> {
        let bytes = self.bytes().to_vec();

        // Hexadecimal.
        if bytes[self.p] == b'0'
            && matches!(self.peek_at(1), Some(b'x') | Some(b'X'))
        {
            self.p += 2;
            let digits_begin = self.p;
            let mut value: u64 = 0;
            while let Some(c) = self.peek() {
                let digit = match c {
                    b'0'..=b'9' => (c - b'0') as u64,
                    b'a'..=b'f' => (c - b'a' + 10) as u64,
                    b'A'..=b'F' => (c - b'A' + 10) as u64,
                    _ => break,
                };
                value = value.wrapping_mul(16).wrapping_add(digit);
                self.p += 1;
            }
            if self.p == digits_begin {
                self.lex_error(begin, "Hexadecimal digit expected".to_string())?;
            }
            let kind = self.lex_int_suffix(value, false)?;
            return Ok(self.make_token(kind, begin));
        }

        // Look ahead for a float: digits then `.` or an exponent.
        let mut scan = self.p;
        while bytes.get(scan).is_some_and(|c| c.is_ascii_digit()) {
            scan += 1;
        }
        let is_float = matches!(bytes.get(scan), Some(b'.') | Some(b'e') | Some(b'E'));
        if is_float || bytes[self.p] == b'.' {
            return self.lex_float(begin);
        }

        // Octal or decimal.
        let octal = bytes[self.p] == b'0';
        let mut value: u64 = 0;
        let mut bad_digit = None;
        while let Some(c) = self.peek() {
            if !c.is_ascii_digit() {
                break;
            }
            if octal && c >= b'8' && bad_digit.is_none() {
                bad_digit = Some(self.p);
            }
            let base = if octal { 8 } else { 10 };
            value = value.wrapping_mul(base).wrapping_add((c - b'0') as u64);
            self.p += 1;
        }
        if let Some(at) = bad_digit {
            self.lex_error(at, "Invalid octal digit".to_string())?;
        }
        let kind = self.lex_int_suffix(value, !octal)?;
        Ok(self.make_token(kind, begin))
    }

    /// Consume `u`/`l`/`ll` suffixes and pick the smallest type that
    /// holds `value`.
    fn lex_int_suffix(&mut self, value: u64, decimal: bool) -> Result<TokenKind, CompileError> {
        let mut unsigned = false;
        let mut longs = 0usize;
        loop {
            match self.peek() {
                Some(b'u') | Some(b'U') if !unsigned => {
                    unsigned = true;
                    self.p += 1;
                }
                Some(b'l') | Some(b'L') if longs < 2 => {
                    longs += 1;
                    self.p += 1;
                }
                _ => break,
            }
        }
        let min_kind = match longs {
            0 => FixnumKind::Int,
            1 => FixnumKind::Long,
            _ => FixnumKind::LongLong,
        };

        // Candidate order: signed first for decimal literals, interleaved
        // for octal/hex, per the usual C rules.
        let candidates: &[(FixnumKind, bool)] = if unsigned {
            &[(FixnumKind::Int, true), (FixnumKind::Long, true), (FixnumKind::LongLong, true)]
        } else if decimal {
            &[(FixnumKind::Int, false), (FixnumKind::Long, false), (FixnumKind::LongLong, false)]
        } else {
            &[
                (FixnumKind::Int, false),
                (FixnumKind::Int, true),
                (FixnumKind::Long, false),
                (FixnumKind::Long, true),
                (FixnumKind::LongLong, false),
                (FixnumKind::LongLong, true),
            ]
        };
        for (kind, uns) in candidates {
            if kind.rank() < min_kind.rank() {
                continue;
            }
            let fits = match (kind, uns) {
                (FixnumKind::Int, false) => value <= i32::MAX as u64,
                (FixnumKind::Int, true) => value <= u32::MAX as u64,
                (_, false) => value <= i64::MAX as u64,
                (_, true) => true,
            };
            if fits {
                return Ok(TokenKind::IntLit { value: value as i64, kind: *kind, unsigned: *uns });
            }
        }
        // Did not fit a signed 64-bit value: it is unsigned long long.
        Ok(TokenKind::IntLit {
            value: value as i64,
            kind: FixnumKind::LongLong,
            unsigned: true,
        })
    }

    fn lex_float(&mut self, begin: usize) -> Result<Token, CompileError> {
        while self.peek().is_some_and(|c| c.is_ascii_digit()) {
            self.p += 1;
        }
        if self.peek() == Some(b'.') {
            self.p += 1;
            while self.peek().is_some_and(|c| c.is_ascii_digit()) {
                self.p += 1;
            }
        }
        if matches!(self.peek(), Some(b'e') | Some(b'E')) {
            let mark = self.p;
            self.p += 1;
            if matches!(self.peek(), Some(b'+') | Some(b'-')) {
                self.p += 1;
            }
            if self.peek().is_some_and(|c| c.is_ascii_digit()) {
                while self.peek().is_some_and(|c| c.is_ascii_digit()) {
                    self.p += 1;
                }
            } else {
                self.p = mark;
                self.lex_error(mark, "Exponent digits expected".to_string())?;
            }
        }
        let text = self.line.text[begin..self.p].to_string();
        let mut single = false;
        match self.peek() {
            Some(b'f') | Some(b'F') => {
                single = true;
                self.p += 1;
            }
            Some(b'l') | Some(b'L') => {
                self.p += 1;
            }
            _ => {}
        }
        let value = match text.parse::<f64>() {
            Ok(v) => v,
            Err(_) => {
                self.lex_error(begin, format!("Invalid float literal `{}'", text))?;
                0.0
            }
        };
        Ok(self.make_token(TokenKind::FloatLit { value, single }, begin))
    }

    /// One escape sequence, the leading backslash already consumed.
    fn lex_escape(&mut self, begin: usize) -> Result<u8, CompileError> {
        let c = match self.peek() {
            Some(c) => c,
            None => {
                self.lex_error(begin, "Escape at end of line".to_string())?;
                return Ok(b'\\');
            }
        };
        self.p += 1;
        let value = match c {
            b'a' => 0x07,
            b'b' => 0x08,
            b'f' => 0x0c,
            b'n' => b'\n',
            b'r' => b'\r',
            b't' => b'\t',
            b'v' => 0x0b,
            b'\\' => b'\\',
            b'\'' => b'\'',
            b'"' => b'"',
            b'0'..=b'7' => {
                let mut value = (c - b'0') as u32;
                for _ in 0..2 {
                    match self.peek() {
                        Some(d @ b'0'..=b'7') => {
                            value = value * 8 + (d - b'0') as u32;
                            self.p += 1;
                        }
                        _ => break,
                    }
                }
                value as u8
            }
            b'x' => {
                let mut value: u32 = 0;
                let mut digits = 0;
                while let Some(d) = self.peek() {
                    let digit = match d {
                        b'0'..=b'9' => (d - b'0') as u32,
                        b'a'..=b'f' => (d - b'a' + 10) as u32,
                        b'A'..=b'F' => (d - b'A' + 10) as u32,
                        _ => break,
                    };
                    value = value * 16 + digit;
                    digits += 1;
                    self.p += 1;
                }
                if digits == 0 {
                    self.lex_error(begin, "Hexadecimal digit expected after \\x".to_string())?;
                }
                value as u8
            }
            _ => {
                self.lex_error(begin, format!("Invalid escape `\\{}'", c as char))?;
                c
            }
        };
        Ok(value)
    }

    fn lex_string(&mut self, begin: usize) -> Result<Token, CompileError> {
        self.p += 1; // opening quote
        let mut bytes = Vec::new();
        loop {
            match self.peek() {
                None => {
                    self.lex_error(begin, "String not closed".to_string())?;
                    break;
                }
                Some(b'"') => {
                    self.p += 1;
                    break;
                }
                Some(b'\\') => {
                    let esc_begin = self.p;
                    self.p += 1;
                    bytes.push(self.lex_escape(esc_begin)?);
                }
                Some(c) => {
                    bytes.push(c);
                    self.p += 1;
                }
            }
        }
        bytes.push(0);
        Ok(self.make_token(TokenKind::Str(Rc::new(bytes)), begin))
    }

    fn lex_char(&mut self, begin: usize) -> Result<Token, CompileError> {
        self.p += 1; // opening quote
        let value = match self.peek() {
            None | Some(b'\'') => {
                self.lex_error(begin, "Character literal is empty".to_string())?;
                0
            }
            Some(b'\\') => {
                let esc_begin = self.p;
                self.p += 1;
                self.lex_escape(esc_begin)? as i64
            }
            Some(c) => {
                self.p += 1;
                c as i64
            }
        };
        if self.peek() == Some(b'\'') {
            self.p += 1;
        } else {
            self.lex_error(begin, "Character literal not closed".to_string())?;
            // Recover to the end of the would-be literal.
            while self.peek().is_some_and(|c| c != b'\'' && c != b'\n') {
                self.p += 1;
            }
            if self.peek() == Some(b'\'') {
                self.p += 1;
            }
        }
        // Character constants have type int.
        Ok(self.make_token(
            TokenKind::IntLit { value, kind: FixnumKind::Int, unsigned: false },
            begin,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lexer_for(source: &str) -> Lexer {
        let names = Rc::new(RefCell::new(NameTable::new()));
        let diags = Rc::new(RefCell::new(Diagnostics::new()));
        Lexer::new(source, "test.c", names, diags)
    }

    fn kinds(source: &str) -> Vec<TokenKind> {
        let mut lexer = lexer_for(source);
        let mut out = Vec::new();
        loop {
            let token = lexer.fetch().unwrap();
            if token.kind == TokenKind::Eof {
                break;
            }
            out.push(token.kind);
        }
        out
    }

    #[test]
    fn test_punctuators_longest_match() {
        assert_eq!(
            kinds("<<= << < ... . -> -"),
            vec![
                TokenKind::LShiftAssign,
                TokenKind::LShift,
                TokenKind::Lt,
                TokenKind::Ellipsis,
                TokenKind::Dot,
                TokenKind::Arrow,
                TokenKind::Sub,
            ]
        );
    }

    #[test]
    fn test_keywords_and_idents() {
        let mut lexer = lexer_for("int foo; for forever");
        assert_eq!(lexer.fetch().unwrap().kind, TokenKind::Int);
        assert!(matches!(lexer.fetch().unwrap().kind, TokenKind::Ident(_)));
        assert_eq!(lexer.fetch().unwrap().kind, TokenKind::Semicolon);
        assert_eq!(lexer.fetch().unwrap().kind, TokenKind::For);
        assert!(matches!(lexer.fetch().unwrap().kind, TokenKind::Ident(_)));
    }

    #[test]
    fn test_interned_names_are_identical() {
        let mut lexer = lexer_for("abc xyz abc");
        let a1 = lexer.fetch().unwrap().ident().unwrap();
        let other = lexer.fetch().unwrap().ident().unwrap();
        let a2 = lexer.fetch().unwrap().ident().unwrap();
        assert_eq!(a1, a2);
        assert_ne!(a1, other);
    }

    #[test]
    fn test_int_literal_widths() {
        assert_eq!(
            kinds("1 0x10 017 2147483648 5u 5l 5ull"),
            vec![
                TokenKind::IntLit { value: 1, kind: FixnumKind::Int, unsigned: false },
                TokenKind::IntLit { value: 16, kind: FixnumKind::Int, unsigned: false },
                TokenKind::IntLit { value: 15, kind: FixnumKind::Int, unsigned: false },
                // Decimal without suffix grows to the next signed type.
                TokenKind::IntLit { value: 2147483648, kind: FixnumKind::Long, unsigned: false },
                TokenKind::IntLit { value: 5, kind: FixnumKind::Int, unsigned: true },
                TokenKind::IntLit { value: 5, kind: FixnumKind::Long, unsigned: false },
                TokenKind::IntLit { value: 5, kind: FixnumKind::LongLong, unsigned: true },
            ]
        );
    }

    #[test]
    fn test_hex_overflows_to_unsigned() {
        assert_eq!(
            kinds("0xFFFFFFFF"),
            vec![TokenKind::IntLit { value: 0xFFFFFFFF, kind: FixnumKind::Int, unsigned: true }]
        );
    }

    #[test]
    fn test_char_literals() {
        assert_eq!(
            kinds(r"'a' '\n' '\x41' '\0'"),
            vec![
                TokenKind::IntLit { value: 97, kind: FixnumKind::Int, unsigned: false },
                TokenKind::IntLit { value: 10, kind: FixnumKind::Int, unsigned: false },
                TokenKind::IntLit { value: 65, kind: FixnumKind::Int, unsigned: false },
                TokenKind::IntLit { value: 0, kind: FixnumKind::Int, unsigned: false },
            ]
        );
    }

    #[test]
    fn test_float_literals() {
        assert_eq!(
            kinds("1.5 2. 1e3 2.5f"),
            vec![
                TokenKind::FloatLit { value: 1.5, single: false },
                TokenKind::FloatLit { value: 2.0, single: false },
                TokenKind::FloatLit { value: 1000.0, single: false },
                TokenKind::FloatLit { value: 2.5, single: true },
            ]
        );
    }

    #[test]
    fn test_string_concatenation() {
        let mut lexer = lexer_for("\"foo\" \"bar\"");
        let token = lexer.fetch().unwrap();
        match token.kind {
            TokenKind::Str(bytes) => assert_eq!(bytes.as_ref(), b"foobar\0"),
            other => panic!("expected string, got {:?}", other),
        }
    }

    #[test]
    fn test_string_escapes() {
        let mut lexer = lexer_for(r#""a\tb\0""#);
        let token = lexer.fetch().unwrap();
        match token.kind {
            TokenKind::Str(bytes) => assert_eq!(bytes.as_ref(), b"a\tb\0\0"),
            other => panic!("expected string, got {:?}", other),
        }
    }

    #[test]
    fn test_comments() {
        assert_eq!(
            kinds("a // line\nb /* block\nspanning */ c"),
            kinds("a b c")
        );
    }

    #[test]
    fn test_backslash_continuation() {
        let mut lexer = lexer_for("ab\\\ncd");
        let token = lexer.fetch().unwrap();
        assert!(matches!(token.kind, TokenKind::Ident(_)));
        assert_eq!(lexer.fetch().unwrap().kind, TokenKind::Eof);
    }

    #[test]
    fn test_unget_two_deep() {
        let mut lexer = lexer_for("a b c");
        let a = lexer.fetch().unwrap();
        let b = lexer.fetch().unwrap();
        lexer.unget(b.clone());
        lexer.unget(a.clone());
        assert_eq!(lexer.fetch().unwrap().ident(), a.ident());
        assert_eq!(lexer.fetch().unwrap().ident(), b.ident());
    }

    #[test]
    fn test_line_numbers() {
        let mut lexer = lexer_for("a\nb\n\nc");
        assert_eq!(lexer.fetch().unwrap().line.lineno, 1);
        assert_eq!(lexer.fetch().unwrap().line.lineno, 2);
        assert_eq!(lexer.fetch().unwrap().line.lineno, 4);
    }

    #[test]
    fn test_unterminated_string_recovers() {
        let mut lexer = lexer_for("\"oops\nnext");
        let token = lexer.fetch().unwrap();
        assert!(matches!(token.kind, TokenKind::Str(_)));
        assert!(matches!(lexer.fetch().unwrap().kind, TokenKind::Ident(_)));
        assert_eq!(lexer.diags.borrow().error_count(), 1);
    }

    #[test]
    fn test_eof_callback_supplies_more_input() {
        let mut lexer = lexer_for("a");
        let more = std::cell::Cell::new(Some("b".to_string()));
        lexer.set_eof_callback(Some(Box::new(move || more.take())));
        assert!(matches!(lexer.fetch().unwrap().kind, TokenKind::Ident(_)));
        assert!(matches!(lexer.fetch().unwrap().kind, TokenKind::Ident(_)));
        assert_eq!(lexer.fetch().unwrap().kind, TokenKind::Eof);
    }
}
