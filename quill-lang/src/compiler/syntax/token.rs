//! Converts source text into a stream of [`Token`]s.

use std::cmp::Ordering;
use std::fmt::Display;
use std::hash::Hash;
use std::iter::Peekable;
use std::ops::RangeBounds;
use std::str::CharIndices;

use serde::{Deserialize, Serialize};

use super::Ranged;
use crate::runtime::symbol::Symbol;

/// A lexical token.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum Token {
    /// A run of whitespace.
    Whitespace,
    /// A `//` or `/* */` comment.
    Comment,
    /// An identifier or keyword.
    Identifier(Symbol),
    /// An integer literal.
    Int(i64),
    /// A floating point literal.
    Float(f64),
    /// A single punctuation character.
    Char(char),
    /// A string literal with its escapes decoded.
    String(String),
    /// `<=`
    LessThanOrEqual,
    /// `>=`
    GreaterThanOrEqual,
    /// `==`
    Equals,
    /// `!=`
    NotEqual,
    /// `+=`
    AddAssign,
    /// `-=`
    SubtractAssign,
    /// `*=`
    MultiplyAssign,
    /// `/=`
    DivideAssign,
    /// `%=`
    RemainderAssign,
    /// `<<`
    ShiftLeft,
    /// `>>`
    ShiftRight,
    /// `&&`
    And,
    /// `||`
    Or,
    /// `??`
    Coalesce,
    /// `++`
    Increment,
    /// `--`
    Decrement,
    /// An opening delimiter.
    Open(Paired),
    /// A closing delimiter.
    Close(Paired),
}

impl Token {
    /// Returns true if this token is the identifier `keyword`.
    #[must_use]
    pub fn is_keyword(&self, keyword: &Symbol) -> bool {
        matches!(self, Token::Identifier(ident) if ident == keyword)
    }
}

impl Eq for Token {}

impl PartialEq for Token {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::Identifier(l0), Self::Identifier(r0)) => l0 == r0,
            (Self::Int(l0), Self::Int(r0)) => l0 == r0,
            (Self::Float(l0), Self::Float(r0)) => l0.total_cmp(r0) == Ordering::Equal,
            (Self::Char(l0), Self::Char(r0)) => l0 == r0,
            (Self::String(l0), Self::String(r0)) => l0 == r0,
            (Self::Open(l0), Self::Open(r0)) | (Self::Close(l0), Self::Close(r0)) => l0 == r0,
            _ => core::mem::discriminant(self) == core::mem::discriminant(other),
        }
    }
}

impl Hash for Token {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        core::mem::discriminant(self).hash(state);
        match self {
            Token::Identifier(t) => t.hash(state),
            Token::Int(t) => t.hash(state),
            Token::Float(t) => t.to_bits().hash(state),
            Token::Char(t) => t.hash(state),
            Token::Open(t) | Token::Close(t) => t.hash(state),
            Token::String(t) => t.hash(state),
            Token::Whitespace
            | Token::Comment
            | Token::LessThanOrEqual
            | Token::GreaterThanOrEqual
            | Token::Equals
            | Token::NotEqual
            | Token::AddAssign
            | Token::SubtractAssign
            | Token::MultiplyAssign
            | Token::DivideAssign
            | Token::RemainderAssign
            | Token::ShiftLeft
            | Token::ShiftRight
            | Token::And
            | Token::Or
            | Token::Coalesce
            | Token::Increment
            | Token::Decrement => {}
        }
    }
}

impl Display for Token {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Token::Whitespace => f.write_str("whitespace"),
            Token::Comment => f.write_str("comment"),
            Token::Identifier(ident) => write!(f, "`{ident}`"),
            Token::Int(value) => write!(f, "`{value}`"),
            Token::Float(value) => write!(f, "`{value}`"),
            Token::Char(ch) => write!(f, "`{ch}`"),
            Token::String(value) => write!(f, "{value:?}"),
            Token::LessThanOrEqual => f.write_str("`<=`"),
            Token::GreaterThanOrEqual => f.write_str("`>=`"),
            Token::Equals => f.write_str("`==`"),
            Token::NotEqual => f.write_str("`!=`"),
            Token::AddAssign => f.write_str("`+=`"),
            Token::SubtractAssign => f.write_str("`-=`"),
            Token::MultiplyAssign => f.write_str("`*=`"),
            Token::DivideAssign => f.write_str("`/=`"),
            Token::RemainderAssign => f.write_str("`%=`"),
            Token::ShiftLeft => f.write_str("`<<`"),
            Token::ShiftRight => f.write_str("`>>`"),
            Token::And => f.write_str("`&&`"),
            Token::Or => f.write_str("`||`"),
            Token::Coalesce => f.write_str("`??`"),
            Token::Increment => f.write_str("`++`"),
            Token::Decrement => f.write_str("`--`"),
            Token::Open(Paired::Brace) => f.write_str("`{`"),
            Token::Open(Paired::Paren) => f.write_str("`(`"),
            Token::Open(Paired::Bracket) => f.write_str("`[`"),
            Token::Close(Paired::Brace) => f.write_str("`}`"),
            Token::Close(Paired::Paren) => f.write_str("`)`"),
            Token::Close(Paired::Bracket) => f.write_str("`]`"),
        }
    }
}

/// A delimiter that is always used in open/close pairs.
#[derive(Clone, Copy, Eq, PartialEq, Debug, Hash, Serialize, Deserialize)]
pub enum Paired {
    /// `{` and `}`
    Brace,
    /// `(` and `)`
    Paren,
    /// `[` and `]`
    Bracket,
}

struct Chars<'a> {
    source: Peekable<CharIndices<'a>>,
    last_index: usize,
}

impl<'a> Chars<'a> {
    fn new(source: &'a str) -> Self {
        Self {
            source: source.char_indices().peekable(),
            last_index: 0,
        }
    }

    fn peek(&mut self) -> Option<char> {
        self.source.peek().map(|(_, ch)| *ch)
    }

    fn next_if_eq(&mut self, expected: char) -> bool {
        if self.peek() == Some(expected) {
            self.next();
            true
        } else {
            false
        }
    }

    fn ranged<T>(&self, range: impl RangeBounds<usize>, value: T) -> Ranged<T> {
        Ranged::bounded(range, self.last_index, value)
    }
}

impl Iterator for Chars<'_> {
    type Item = (usize, char);

    fn next(&mut self) -> Option<Self::Item> {
        let (offset, char) = self.source.next()?;
        self.last_index = offset + char.len_utf8();
        Some((offset, char))
    }
}

/// An iterator of tokens parsed from a source string.
pub struct Tokens<'a> {
    chars: Chars<'a>,
    scratch: String,
    include_whitespace: bool,
    include_comments: bool,
}

impl Iterator for Tokens<'_> {
    type Item = Result<Ranged<Token>, Ranged<Error>>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            break Some(match self.chars.next()? {
                (start, ch) if ch.is_whitespace() => {
                    let whitespace = self.tokenize_whitespace(start);
                    if self.include_whitespace {
                        Ok(whitespace)
                    } else {
                        continue;
                    }
                }
                (start, '/') if matches!(self.chars.peek(), Some('/' | '*')) => {
                    let comment = match self.tokenize_comment(start) {
                        Ok(comment) => comment,
                        Err(err) => break Some(Err(err)),
                    };
                    if self.include_comments {
                        Ok(comment)
                    } else {
                        continue;
                    }
                }
                (start, '"') => self.tokenize_string(start),
                (start, '{') => Ok(self.chars.ranged(start.., Token::Open(Paired::Brace))),
                (start, '}') => Ok(self.chars.ranged(start.., Token::Close(Paired::Brace))),
                (start, '(') => Ok(self.chars.ranged(start.., Token::Open(Paired::Paren))),
                (start, ')') => Ok(self.chars.ranged(start.., Token::Close(Paired::Paren))),
                (start, '[') => Ok(self.chars.ranged(start.., Token::Open(Paired::Bracket))),
                (start, ']') => Ok(self.chars.ranged(start.., Token::Close(Paired::Bracket))),
                (start, ch) if ch.is_ascii_digit() => self.tokenize_number(start, ch),
                (start, '.') if self.chars.peek().map_or(false, |ch| ch.is_ascii_digit()) => {
                    self.tokenize_number(start, '.')
                }
                (start, ch) if ch.is_ascii_punctuation() => {
                    Ok(self.tokenize_punctuation(start, ch))
                }
                (start, ch) if ch == '_' || unicode_ident::is_xid_start(ch) => {
                    Ok(self.tokenize_identifier(start, ch))
                }
                (start, ch) => Err(self.chars.ranged(start.., Error::UnexpectedChar(ch))),
            });
        }
    }
}

impl<'a> Tokens<'a> {
    /// Returns a tokenizer over `source`.
    #[must_use]
    pub fn new(source: &'a str) -> Self {
        Self {
            chars: Chars::new(source),
            scratch: String::new(),
            include_whitespace: true,
            include_comments: true,
        }
    }

    /// Skips whitespace tokens.
    #[must_use]
    pub fn excluding_whitespace(mut self) -> Self {
        self.include_whitespace = false;
        self
    }

    /// Skips comment tokens.
    #[must_use]
    pub fn excluding_comments(mut self) -> Self {
        self.include_comments = false;
        self
    }

    fn tokenize_punctuation(&mut self, start: usize, ch: char) -> Ranged<Token> {
        let token = match ch {
            '<' if self.chars.next_if_eq('=') => Token::LessThanOrEqual,
            '<' if self.chars.next_if_eq('<') => Token::ShiftLeft,
            '>' if self.chars.next_if_eq('=') => Token::GreaterThanOrEqual,
            '>' if self.chars.next_if_eq('>') => Token::ShiftRight,
            '=' if self.chars.next_if_eq('=') => Token::Equals,
            '!' if self.chars.next_if_eq('=') => Token::NotEqual,
            '+' if self.chars.next_if_eq('=') => Token::AddAssign,
            '+' if self.chars.next_if_eq('+') => Token::Increment,
            '-' if self.chars.next_if_eq('=') => Token::SubtractAssign,
            '-' if self.chars.next_if_eq('-') => Token::Decrement,
            '*' if self.chars.next_if_eq('=') => Token::MultiplyAssign,
            '/' if self.chars.next_if_eq('=') => Token::DivideAssign,
            '%' if self.chars.next_if_eq('=') => Token::RemainderAssign,
            '&' if self.chars.next_if_eq('&') => Token::And,
            '|' if self.chars.next_if_eq('|') => Token::Or,
            '?' if self.chars.next_if_eq('?') => Token::Coalesce,
            other => Token::Char(other),
        };
        self.chars.ranged(start.., token)
    }

    fn tokenize_number(
        &mut self,
        start: usize,
        start_char: char,
    ) -> Result<Ranged<Token>, Ranged<Error>> {
        self.scratch.clear();
        self.scratch.push(start_char);
        let mut has_decimal = if start_char == '.' {
            true
        } else {
            while let Some(ch) = self.chars.peek().filter(char::is_ascii_digit) {
                self.scratch.push(ch);
                self.chars.next();
            }

            if self.chars.peek() == Some('.') {
                self.scratch.push('.');
                self.chars.next();
                true
            } else {
                false
            }
        };

        if has_decimal {
            while let Some(ch) = self.chars.peek().filter(char::is_ascii_digit) {
                self.scratch.push(ch);
                self.chars.next();
            }
        }

        if matches!(self.chars.peek(), Some('e' | 'E')) {
            has_decimal = true;
            self.scratch.push('e');
            self.chars.next();
            if let Some(sign @ ('+' | '-')) = self.chars.peek() {
                self.scratch.push(sign);
                self.chars.next();
            }
            while let Some(ch) = self.chars.peek().filter(char::is_ascii_digit) {
                self.scratch.push(ch);
                self.chars.next();
            }
        }

        if has_decimal {
            let float = self.scratch.parse::<f64>().map_err(|err| {
                self.chars
                    .ranged(start.., Error::FloatParse(err.to_string()))
            })?;
            Ok(self.chars.ranged(start.., Token::Float(float)))
        } else {
            let int = self.scratch.parse::<i64>().map_err(|err| {
                self.chars
                    .ranged(start.., Error::IntegerParse(err.to_string()))
            })?;
            Ok(self.chars.ranged(start.., Token::Int(int)))
        }
    }

    fn tokenize_identifier(&mut self, start: usize, start_char: char) -> Ranged<Token> {
        self.scratch.clear();
        self.scratch.push(start_char);

        while let Some(ch) = self
            .chars
            .peek()
            .filter(|ch| unicode_ident::is_xid_continue(*ch) || *ch == '_')
        {
            self.scratch.push(ch);
            self.chars.next();
        }

        let symbol = Symbol::from(&self.scratch);
        self.chars.ranged(start.., Token::Identifier(symbol))
    }

    fn tokenize_whitespace(&mut self, start: usize) -> Ranged<Token> {
        while self.chars.peek().map_or(false, char::is_whitespace) {
            self.chars.next();
        }
        self.chars.ranged(start.., Token::Whitespace)
    }

    fn tokenize_comment(&mut self, start: usize) -> Result<Ranged<Token>, Ranged<Error>> {
        if self.chars.next_if_eq('/') {
            while self
                .chars
                .peek()
                .map_or(false, |ch| !matches!(ch, '\r' | '\n'))
            {
                self.chars.next();
            }
        } else {
            self.chars.next();
            loop {
                match self.chars.next() {
                    Some((_, '*')) if self.chars.next_if_eq('/') => break,
                    Some(_) => {}
                    None => {
                        return Err(self.chars.ranged(start.., Error::MissingCommentEnd));
                    }
                }
            }
        }
        Ok(self.chars.ranged(start.., Token::Comment))
    }

    fn tokenize_string(&mut self, start: usize) -> Result<Ranged<Token>, Ranged<Error>> {
        self.scratch.clear();
        loop {
            match self.chars.next() {
                Some((_, '"')) => break,
                Some((index, '\\')) => match self.chars.next() {
                    Some((_, '"')) => self.scratch.push('"'),
                    Some((_, 'n')) => self.scratch.push('\n'),
                    Some((_, 'r')) => self.scratch.push('\r'),
                    Some((_, 't')) => self.scratch.push('\t'),
                    Some((_, '\\')) => self.scratch.push('\\'),
                    Some((_, '0')) => self.scratch.push('\0'),
                    Some((_, 'u')) => self
                        .decode_unicode_escape_into_scratch()
                        .map_err(|()| self.chars.ranged(index.., Error::InvalidEscapeSequence))?,
                    Some((_, 'x')) => self
                        .decode_ascii_escape_into_scratch()
                        .map_err(|()| self.chars.ranged(index.., Error::InvalidEscapeSequence))?,
                    _ => return Err(self.chars.ranged(index.., Error::InvalidEscapeSequence)),
                },
                Some((_, ch)) => {
                    self.scratch.push(ch);
                }
                None => {
                    return Err(self
                        .chars
                        .ranged(self.chars.last_index.., Error::MissingEndQuote))
                }
            }
        }

        Ok(self
            .chars
            .ranged(start.., Token::String(self.scratch.clone())))
    }

    fn decode_unicode_escape_into_scratch(&mut self) -> Result<(), ()> {
        match self.chars.next() {
            Some((_, '{')) => {}
            _ => return Err(()),
        }

        let mut decoded = 0_u32;
        let mut digit_count = 0;
        loop {
            match self.chars.next() {
                Some((_, '}')) if digit_count > 0 => break,
                Some((_, ch)) if digit_count < 6 => {
                    let digit = decode_hex_char(ch).ok_or(())?;
                    decoded = (decoded << 4) | u32::from(digit);
                    digit_count += 1;
                }
                _ => return Err(()),
            }
        }

        let ch = char::from_u32(decoded).ok_or(())?;
        self.scratch.push(ch);
        Ok(())
    }

    fn decode_ascii_escape_into_scratch(&mut self) -> Result<(), ()> {
        match (self.chars.next(), self.chars.next()) {
            (Some((_, high)), Some((_, low))) => {
                match (decode_hex_char(high), decode_hex_char(low)) {
                    (Some(high), Some(low)) => {
                        let ascii = (high << 4) | low;
                        if ascii <= 127 {
                            self.scratch.push(char::from(ascii));
                            Ok(())
                        } else {
                            Err(())
                        }
                    }
                    _ => Err(()),
                }
            }
            _ => Err(()),
        }
    }
}

fn decode_hex_char(ch: char) -> Option<u8> {
    const ASCII_CASE_BIT: u8 = 0b10_0000;
    let u8 = u8::try_from(ch).ok()? | ASCII_CASE_BIT;
    match u8 {
        b'0'..=b'9' => Some(u8 - b'0'),
        b'a'..=b'f' => Some(u8 - b'a' + 10),
        _ => None,
    }
}

/// An error encountered while tokenizing.
#[derive(Debug, Clone, Eq, PartialEq, Serialize, Deserialize)]
pub enum Error {
    /// A character that cannot begin any token.
    UnexpectedChar(char),
    /// An integer literal could not be parsed.
    IntegerParse(String),
    /// A float literal could not be parsed.
    FloatParse(String),
    /// A string literal was not terminated.
    MissingEndQuote,
    /// A block comment was not terminated.
    MissingCommentEnd,
    /// An unknown or malformed escape sequence.
    InvalidEscapeSequence,
}

impl Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Error::UnexpectedChar(ch) => write!(f, "unexpected character `{ch}`"),
            Error::IntegerParse(err) => write!(f, "invalid integer literal: {err}"),
            Error::FloatParse(err) => write!(f, "invalid float literal: {err}"),
            Error::MissingEndQuote => f.write_str("missing closing quote"),
            Error::MissingCommentEnd => f.write_str("missing `*/`"),
            Error::InvalidEscapeSequence => f.write_str("invalid escape sequence"),
        }
    }
}

#[test]
fn decode_hex_char_tests() {
    assert_eq!(decode_hex_char('1'), Some(1));
    assert_eq!(decode_hex_char('a'), Some(10));
    assert_eq!(decode_hex_char('F'), Some(15));
    assert_eq!(decode_hex_char('.'), None);
}

#[test]
fn basics() {
    let tokens = Tokens::new("a_09_ += 1 - .2")
        .collect::<Result<Vec<_>, _>>()
        .unwrap();
    assert_eq!(
        tokens,
        &[
            Ranged::new(0..5, Token::Identifier(Symbol::from("a_09_"))),
            Ranged::new(5..6, Token::Whitespace),
            Ranged::new(6..8, Token::AddAssign),
            Ranged::new(8..9, Token::Whitespace),
            Ranged::new(9..10, Token::Int(1)),
            Ranged::new(10..11, Token::Whitespace),
            Ranged::new(11..12, Token::Char('-')),
            Ranged::new(12..13, Token::Whitespace),
            Ranged::new(13..15, Token::Float(0.2)),
        ]
    );
}

#[test]
fn comments_and_operators() {
    let tokens = Tokens::new("a ?? b // trailing\n/* block */ x++ << 2")
        .excluding_whitespace()
        .excluding_comments()
        .map(|token| token.map(|token| token.0))
        .collect::<Result<Vec<_>, _>>()
        .unwrap();
    assert_eq!(
        tokens,
        &[
            Token::Identifier(Symbol::from("a")),
            Token::Coalesce,
            Token::Identifier(Symbol::from("b")),
            Token::Identifier(Symbol::from("x")),
            Token::Increment,
            Token::ShiftLeft,
            Token::Int(2),
        ]
    );
}

#[test]
fn unterminated_string() {
    let result = Tokens::new("\"abc").collect::<Result<Vec<_>, _>>();
    assert_eq!(result.unwrap_err().0, Error::MissingEndQuote);
}
