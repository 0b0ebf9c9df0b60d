//! The abstract syntax tree and the parser that produces it.

use std::collections::VecDeque;
use std::fmt::Display;
use std::ops::{Bound, Deref, DerefMut, Range, RangeBounds, RangeInclusive};

use serde::{Deserialize, Serialize};

use self::token::{Paired, Token, Tokens};
use crate::runtime::symbol::Symbol;

pub mod token;

/// A value annotated with the region of source it was produced from.
#[derive(Default, Clone, Copy, Eq, PartialEq, Debug, Serialize, Deserialize)]
pub struct Ranged<T>(pub T, pub SourceRange);

impl<T> Ranged<T> {
    /// Returns `value` annotated with `range`.
    pub fn new(range: impl Into<SourceRange>, value: T) -> Self {
        Self(value, range.into())
    }

    /// Returns `value` annotated with `range`, using `end` for an unbounded
    /// end.
    pub fn bounded(range: impl RangeBounds<usize>, end: usize, value: T) -> Ranged<T> {
        let start = match range.start_bound() {
            Bound::Included(start) => *start,
            Bound::Excluded(start) => start + 1,
            Bound::Unbounded => 0,
        };
        let end = match range.end_bound() {
            Bound::Included(end) => end + 1,
            Bound::Excluded(end) => *end,
            Bound::Unbounded => end,
        };
        Ranged(
            value,
            SourceRange {
                start,
                length: end.saturating_sub(start),
            },
        )
    }

    /// Maps the contained value, keeping the range.
    pub fn map<U>(self, map: impl FnOnce(T) -> U) -> Ranged<U> {
        Ranged(map(self.0), self.1)
    }

    /// Returns the source range of this value.
    pub const fn range(&self) -> SourceRange {
        self.1
    }
}

impl<T> Deref for Ranged<T> {
    type Target = T;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl<T> DerefMut for Ranged<T> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.0
    }
}

/// A region of source code, in bytes.
#[derive(Default, Clone, Copy, Eq, PartialEq, Debug, Serialize, Deserialize)]
pub struct SourceRange {
    /// The byte offset of the start of the range.
    pub start: usize,
    /// The number of bytes in the range.
    pub length: usize,
}

impl SourceRange {
    /// Returns the exclusive end offset.
    #[must_use]
    pub const fn end(&self) -> usize {
        self.start + self.length
    }

    /// Returns a range spanning from the start of `self` to the end of
    /// `other`.
    #[must_use]
    pub fn through(&self, other: SourceRange) -> Self {
        Self {
            start: self.start,
            length: other.end().saturating_sub(self.start),
        }
    }
}

impl From<Range<usize>> for SourceRange {
    fn from(range: Range<usize>) -> Self {
        Self {
            start: range.start,
            length: range.end - range.start,
        }
    }
}

impl From<RangeInclusive<usize>> for SourceRange {
    fn from(range: RangeInclusive<usize>) -> Self {
        Self {
            start: *range.start(),
            length: range.end() - range.start(),
        }
    }
}

/// Source code and the name it was loaded from.
#[derive(Clone, Copy, Debug)]
pub struct SourceCode<'a> {
    /// The file name used in diagnostics and runtime error messages.
    pub name: &'a str,
    /// The source text.
    pub code: &'a str,
}

impl<'a> SourceCode<'a> {
    /// Returns a new source code reference.
    #[must_use]
    pub const fn new(name: &'a str, code: &'a str) -> Self {
        Self { name, code }
    }

    /// Returns the 1-based line and column of `offset`.
    #[must_use]
    pub fn line_column(&self, offset: usize) -> (usize, usize) {
        let offset = offset.min(self.code.len());
        let before = &self.code.as_bytes()[..offset];
        let line = before.iter().filter(|b| **b == b'\n').count() + 1;
        let line_start = before
            .iter()
            .rposition(|b| *b == b'\n')
            .map_or(0, |index| index + 1);
        (line, offset - line_start + 1)
    }
}

impl<'a> From<&'a str> for SourceCode<'a> {
    fn from(code: &'a str) -> Self {
        Self::new("<source>", code)
    }
}

impl<'a> From<&'a String> for SourceCode<'a> {
    fn from(code: &'a String) -> Self {
        Self::from(code.as_str())
    }
}

/// A statement.
#[derive(Debug, Clone, PartialEq)]
pub enum Statement {
    /// An expression evaluated for its side effects.
    Expression(Ranged<Expression>),
    /// `var name = value;`
    Var(Box<VarDeclaration>),
    /// `function name(..) { .. }`
    Function(Box<FunctionDefinition>),
    /// `class Name extends Base { .. }`
    Class(Box<ClassDefinition>),
    /// `enum Name { .. }`
    Enum(Box<EnumDefinition>),
    /// `module name { .. }`
    Module(Box<ModuleDefinition>),
    /// `import name as alias;`
    Import(Box<Import>),
    /// `{ .. }`
    Block(Vec<Ranged<Statement>>),
    /// `if (..) .. else ..`
    If(Box<IfStatement>),
    /// `while (..) ..`
    While(Box<WhileLoop>),
    /// `do .. while (..);`
    DoWhile(Box<WhileLoop>),
    /// `for (..; ..; ..) ..`
    For(Box<ForLoop>),
    /// `switch (..) { case ..: .. }`
    Switch(Box<SwitchStatement>),
    /// `break;`
    Break,
    /// `continue;`
    Continue,
    /// `return value;`
    Return(Option<Ranged<Expression>>),
    /// `;`
    Empty,
}

/// A variable declaration.
#[derive(Debug, Clone, PartialEq)]
pub struct VarDeclaration {
    pub name: Ranged<Symbol>,
    pub value: Option<Ranged<Expression>>,
}

/// A function declaration or expression.
#[derive(Debug, Clone, PartialEq)]
pub struct FunctionDefinition {
    pub name: Option<Ranged<Symbol>>,
    pub is_async: bool,
    pub parameters: Vec<Ranged<Symbol>>,
    pub body: Vec<Ranged<Statement>>,
}

/// A class declaration.
#[derive(Debug, Clone, PartialEq)]
pub struct ClassDefinition {
    pub name: Ranged<Symbol>,
    pub base: Option<Ranged<Expression>>,
    pub methods: Vec<Ranged<FunctionDefinition>>,
}

/// An enum declaration.
#[derive(Debug, Clone, PartialEq)]
pub struct EnumDefinition {
    pub name: Ranged<Symbol>,
    pub variants: Vec<EnumVariant>,
}

/// One member of an enum.
#[derive(Debug, Clone, PartialEq)]
pub struct EnumVariant {
    pub name: Ranged<Symbol>,
    pub value: Option<Ranged<Expression>>,
}

/// A module declaration.
#[derive(Debug, Clone, PartialEq)]
pub struct ModuleDefinition {
    pub name: Ranged<Symbol>,
    pub body: Vec<Ranged<Statement>>,
}

/// An import of a registered module.
#[derive(Debug, Clone, PartialEq)]
pub struct Import {
    pub module: Ranged<Symbol>,
    pub alias: Option<Ranged<Symbol>>,
}

impl Import {
    /// Returns the local name the module is bound to.
    #[must_use]
    pub fn binding(&self) -> &Ranged<Symbol> {
        self.alias.as_ref().unwrap_or(&self.module)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct IfStatement {
    pub condition: Ranged<Expression>,
    pub when_true: Ranged<Statement>,
    pub when_false: Option<Ranged<Statement>>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct WhileLoop {
    pub condition: Ranged<Expression>,
    pub body: Ranged<Statement>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ForLoop {
    pub initializer: Option<Ranged<Statement>>,
    pub condition: Option<Ranged<Expression>>,
    pub step: Option<Ranged<Expression>>,
    pub body: Ranged<Statement>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SwitchStatement {
    pub subject: Ranged<Expression>,
    pub cases: Vec<SwitchCase>,
}

/// A `case value:` or `default:` arm. `value` is `None` for `default`.
#[derive(Debug, Clone, PartialEq)]
pub struct SwitchCase {
    pub value: Option<Ranged<Expression>>,
    pub body: Vec<Ranged<Statement>>,
}

/// An expression.
#[derive(Default, Debug, Clone, PartialEq)]
pub enum Expression {
    #[default]
    Null,
    Bool(bool),
    Int(i32),
    Num(f64),
    String(String),
    Array(Vec<Ranged<Expression>>),
    Object(Vec<ObjectField>),
    Identifier(Symbol),
    This,
    Function(Box<FunctionDefinition>),
    Unary(Box<UnaryExpression>),
    Binary(Box<BinaryExpression>),
    Logical(Box<LogicalExpression>),
    Conditional(Box<Conditional>),
    Assign(Box<Assignment>),
    Update(Box<Update>),
    Call(Box<FunctionCall>),
    New(Box<FunctionCall>),
    Index(Box<Index>),
    Attribute(Box<Attribute>),
    Await(Box<Ranged<Expression>>),
}

#[derive(Debug, Clone, PartialEq)]
pub struct ObjectField {
    pub key: Ranged<Symbol>,
    pub value: Ranged<Expression>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct UnaryExpression {
    pub kind: UnaryKind,
    pub operand: Ranged<Expression>,
}

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum UnaryKind {
    Not,
    Negate,
    Positive,
    TypeOf,
}

#[derive(Debug, Clone, PartialEq)]
pub struct BinaryExpression {
    pub kind: BinaryKind,
    pub left: Ranged<Expression>,
    pub right: Ranged<Expression>,
}

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum BinaryKind {
    Add,
    Subtract,
    Multiply,
    Divide,
    Remainder,
    ShiftLeft,
    ShiftRight,
    BitwiseAnd,
    BitwiseOr,
    BitwiseXor,
    Compare(CompareKind),
}

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum CompareKind {
    LessThan,
    LessThanOrEqual,
    GreaterThan,
    GreaterThanOrEqual,
    Equal,
    NotEqual,
}

/// A short-circuiting binary expression.
#[derive(Debug, Clone, PartialEq)]
pub struct LogicalExpression {
    pub kind: LogicalKind,
    pub left: Ranged<Expression>,
    pub right: Ranged<Expression>,
}

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum LogicalKind {
    And,
    Or,
    /// `??`
    Coalesce,
    /// `catch`
    Catch,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Conditional {
    pub condition: Ranged<Expression>,
    pub when_true: Ranged<Expression>,
    pub when_false: Ranged<Expression>,
}

/// A location that can be assigned to.
#[derive(Debug, Clone, PartialEq)]
pub enum AssignTarget {
    Identifier(Symbol),
    Index(Box<Index>),
    Attribute(Box<Attribute>),
}

impl AssignTarget {
    fn from_expression(expression: Expression) -> Option<Self> {
        match expression {
            Expression::Identifier(name) => Some(Self::Identifier(name)),
            Expression::Index(index) => Some(Self::Index(index)),
            Expression::Attribute(attribute) => Some(Self::Attribute(attribute)),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Assignment {
    pub target: Ranged<AssignTarget>,
    /// The operator of a compound assignment such as `+=`.
    pub operator: Option<BinaryKind>,
    pub value: Ranged<Expression>,
}

/// `++x`, `x++`, `--x` or `x--`.
#[derive(Debug, Clone, PartialEq)]
pub struct Update {
    pub target: Ranged<AssignTarget>,
    pub increment: bool,
    pub prefix: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct FunctionCall {
    pub function: Ranged<Expression>,
    pub arguments: Vec<Ranged<Expression>>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Index {
    pub target: Ranged<Expression>,
    pub index: Ranged<Expression>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Attribute {
    pub target: Ranged<Expression>,
    pub name: Ranged<Symbol>,
}

/// Parses `source` into a list of statements.
pub fn parse(source: &str) -> Result<Vec<Ranged<Statement>>, Ranged<Error>> {
    let mut parser = Parser {
        tokens: TokenReader::new(source),
    };
    let mut statements = Vec::new();
    while parser.tokens.peek().is_some() {
        statements.push(parser.parse_statement()?);
    }
    // A tokenizer error is hidden from peek.
    match parser.tokens.next() {
        Err(Ranged(Error::UnexpectedEof, _)) => Ok(statements),
        Err(err) => Err(err),
        Ok(token) => Err(token.map(Error::UnexpectedToken)),
    }
}

struct TokenReader<'a> {
    tokens: Tokens<'a>,
    peeked: VecDeque<Result<Ranged<Token>, Ranged<Error>>>,
    last_index: usize,
}

impl<'a> TokenReader<'a> {
    fn new(source: &'a str) -> Self {
        Self {
            tokens: Tokens::new(source)
                .excluding_comments()
                .excluding_whitespace(),
            peeked: VecDeque::with_capacity(2),
            last_index: 0,
        }
    }

    fn peek_n(&mut self, index: usize) -> Option<Ranged<Token>> {
        while self.peeked.len() < index + 1 {
            self.peeked
                .push_back(self.tokens.next()?.map_err(Ranged::from));
        }

        self.peeked
            .get(index)
            .and_then(|result| result.as_ref().ok())
            .cloned()
    }

    fn peek(&mut self) -> Option<Ranged<Token>> {
        self.peek_n(0)
    }

    fn peek_token(&mut self) -> Option<Token> {
        self.peek_n(0).map(|t| t.0)
    }

    fn next(&mut self) -> Result<Ranged<Token>, Ranged<Error>> {
        let token = if let Some(peeked) = self.peeked.pop_front() {
            peeked?
        } else {
            self.tokens.next().ok_or_else(|| {
                self.ranged(self.last_index..self.last_index, Error::UnexpectedEof)
            })??
        };
        self.last_index = token.1.start + token.1.length;
        Ok(token)
    }

    fn next_if(&mut self, expected: &Token) -> Option<Ranged<Token>> {
        if self.peek_token().as_ref() == Some(expected) {
            self.next().ok()
        } else {
            None
        }
    }

    fn next_if_keyword(&mut self, keyword: &Symbol) -> Option<Ranged<Token>> {
        if self.peek_token().map_or(false, |t| t.is_keyword(keyword)) {
            self.next().ok()
        } else {
            None
        }
    }

    fn expect(&mut self, expected: &Token, error: Error) -> Result<Ranged<Token>, Ranged<Error>> {
        let token = self.next()?;
        if &token.0 == expected {
            Ok(token)
        } else {
            Err(token.map(|_| error))
        }
    }

    fn ranged<T>(&self, range: impl RangeBounds<usize>, value: T) -> Ranged<T> {
        Ranged::bounded(range, self.last_index, value)
    }
}

/// A syntax error.
#[derive(Debug, Clone, Eq, PartialEq, Serialize, Deserialize)]
pub enum Error {
    UnexpectedEof,
    MissingEnd(Paired),
    Token(token::Error),
    UnexpectedToken(Token),
    ExpectedName,
    ExpectedSemicolon,
    ExpectedColon,
    ExpectedBlock,
    ExpectedParameters,
    ExpectedOpenParen,
    ExpectedWhile,
    ExpectedCaseOrDefault,
    ReservedWord(Symbol),
    InvalidAssignmentTarget,
}

impl crate::ErrorKind for Error {
    fn kind(&self) -> &'static str {
        match self {
            Error::UnexpectedEof => "unexpected eof",
            Error::MissingEnd(_) => "missing end",
            Error::Token(_) => "invalid token",
            Error::UnexpectedToken(_) => "unexpected token",
            Error::ExpectedName => "expected name",
            Error::ExpectedSemicolon => "expected semicolon",
            Error::ExpectedColon => "expected colon",
            Error::ExpectedBlock => "expected block",
            Error::ExpectedParameters => "expected parameters",
            Error::ExpectedOpenParen => "expected open paren",
            Error::ExpectedWhile => "expected while",
            Error::ExpectedCaseOrDefault => "expected case or default",
            Error::ReservedWord(_) => "reserved word",
            Error::InvalidAssignmentTarget => "invalid assignment target",
        }
    }
}

impl std::error::Error for Error {}

impl Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Error::UnexpectedEof => f.write_str("unexpected end of input"),
            Error::MissingEnd(Paired::Brace) => f.write_str("missing closing `}`"),
            Error::MissingEnd(Paired::Paren) => f.write_str("missing closing `)`"),
            Error::MissingEnd(Paired::Bracket) => f.write_str("missing closing `]`"),
            Error::Token(err) => Display::fmt(err, f),
            Error::UnexpectedToken(token) => write!(f, "unexpected {token}"),
            Error::ExpectedName => f.write_str("expected a name"),
            Error::ExpectedSemicolon => f.write_str("expected `;`"),
            Error::ExpectedColon => f.write_str("expected `:`"),
            Error::ExpectedBlock => f.write_str("expected `{`"),
            Error::ExpectedParameters => f.write_str("expected a parameter list"),
            Error::ExpectedOpenParen => f.write_str("expected `(`"),
            Error::ExpectedWhile => f.write_str("expected `while`"),
            Error::ExpectedCaseOrDefault => f.write_str("expected `case` or `default`"),
            Error::ReservedWord(word) => write!(f, "`{word}` is a reserved word"),
            Error::InvalidAssignmentTarget => f.write_str("invalid assignment target"),
        }
    }
}

impl From<Ranged<token::Error>> for Ranged<Error> {
    fn from(err: Ranged<token::Error>) -> Self {
        err.map(Error::Token)
    }
}

fn is_reserved(name: &Symbol) -> bool {
    [
        Symbol::async_symbol(),
        Symbol::await_symbol(),
        Symbol::break_symbol(),
        Symbol::case_symbol(),
        Symbol::catch_symbol(),
        Symbol::class_symbol(),
        Symbol::continue_symbol(),
        Symbol::default_symbol(),
        Symbol::do_symbol(),
        Symbol::else_symbol(),
        Symbol::enum_symbol(),
        Symbol::extends_symbol(),
        Symbol::false_symbol(),
        Symbol::for_symbol(),
        Symbol::function_symbol(),
        Symbol::if_symbol(),
        Symbol::import_symbol(),
        Symbol::module_symbol(),
        Symbol::new_symbol(),
        Symbol::null_symbol(),
        Symbol::return_symbol(),
        Symbol::switch_symbol(),
        Symbol::this_symbol(),
        Symbol::true_symbol(),
        Symbol::typeof_symbol(),
        Symbol::var_symbol(),
        Symbol::while_symbol(),
    ]
    .into_iter()
    .any(|keyword| keyword == name)
}

struct Parser<'a> {
    tokens: TokenReader<'a>,
}

impl Parser<'_> {
    fn parse_statement(&mut self) -> Result<Ranged<Statement>, Ranged<Error>> {
        let Some(token) = self.tokens.peek() else {
            return Err(self.tokens.next().err().unwrap_or_else(|| {
                self.tokens
                    .ranged(self.tokens.last_index.., Error::UnexpectedEof)
            }));
        };
        let start = token.range().start;

        let statement = match &token.0 {
            Token::Char(';') => {
                self.tokens.next()?;
                Statement::Empty
            }
            Token::Open(Paired::Brace) => Statement::Block(self.parse_block()?),
            Token::Identifier(word) if word == Symbol::var_symbol() => {
                let declaration = self.parse_var()?;
                self.expect_semicolon()?;
                declaration
            }
            Token::Identifier(word) if word == Symbol::function_symbol() => {
                if matches!(self.tokens.peek_n(1), Some(Ranged(Token::Identifier(_), _))) {
                    self.tokens.next()?;
                    Statement::Function(Box::new(self.parse_function_rest(false, true)?))
                } else {
                    self.parse_expression_statement()?
                }
            }
            Token::Identifier(word)
                if word == Symbol::async_symbol()
                    && matches!(self.tokens.peek_n(2), Some(Ranged(Token::Identifier(_), _))) =>
            {
                self.tokens.next()?;
                self.expect_keyword(Symbol::function_symbol())?;
                Statement::Function(Box::new(self.parse_function_rest(true, true)?))
            }
            Token::Identifier(word) if word == Symbol::class_symbol() => self.parse_class()?,
            Token::Identifier(word) if word == Symbol::enum_symbol() => self.parse_enum()?,
            Token::Identifier(word) if word == Symbol::module_symbol() => {
                self.tokens.next()?;
                let name = self.parse_name()?;
                let body = self.parse_block()?;
                Statement::Module(Box::new(ModuleDefinition { name, body }))
            }
            Token::Identifier(word) if word == Symbol::import_symbol() => {
                self.tokens.next()?;
                let module = self.parse_name()?;
                let alias = if self.tokens.next_if_keyword(Symbol::as_symbol()).is_some() {
                    Some(self.parse_name()?)
                } else {
                    None
                };
                self.expect_semicolon()?;
                Statement::Import(Box::new(Import { module, alias }))
            }
            Token::Identifier(word) if word == Symbol::if_symbol() => {
                self.tokens.next()?;
                let condition = self.parse_condition()?;
                let when_true = self.parse_statement()?;
                let when_false = if self.tokens.next_if_keyword(Symbol::else_symbol()).is_some() {
                    Some(self.parse_statement()?)
                } else {
                    None
                };
                Statement::If(Box::new(IfStatement {
                    condition,
                    when_true,
                    when_false,
                }))
            }
            Token::Identifier(word) if word == Symbol::while_symbol() => {
                self.tokens.next()?;
                let condition = self.parse_condition()?;
                let body = self.parse_statement()?;
                Statement::While(Box::new(WhileLoop { condition, body }))
            }
            Token::Identifier(word) if word == Symbol::do_symbol() => {
                self.tokens.next()?;
                let body = self.parse_statement()?;
                let while_token = self.tokens.next()?;
                if !while_token.is_keyword(Symbol::while_symbol()) {
                    return Err(while_token.map(|_| Error::ExpectedWhile));
                }
                let condition = self.parse_condition()?;
                self.expect_semicolon()?;
                Statement::DoWhile(Box::new(WhileLoop { condition, body }))
            }
            Token::Identifier(word) if word == Symbol::for_symbol() => self.parse_for()?,
            Token::Identifier(word) if word == Symbol::switch_symbol() => self.parse_switch()?,
            Token::Identifier(word) if word == Symbol::break_symbol() => {
                self.tokens.next()?;
                self.expect_semicolon()?;
                Statement::Break
            }
            Token::Identifier(word) if word == Symbol::continue_symbol() => {
                self.tokens.next()?;
                self.expect_semicolon()?;
                Statement::Continue
            }
            Token::Identifier(word) if word == Symbol::return_symbol() => {
                self.tokens.next()?;
                if self.tokens.next_if(&Token::Char(';')).is_some() {
                    Statement::Return(None)
                } else {
                    let value = self.parse_expression()?;
                    self.expect_semicolon()?;
                    Statement::Return(Some(value))
                }
            }
            _ => self.parse_expression_statement()?,
        };

        Ok(self.tokens.ranged(start.., statement))
    }

    fn parse_expression_statement(&mut self) -> Result<Statement, Ranged<Error>> {
        let expression = self.parse_expression()?;
        self.expect_semicolon()?;
        Ok(Statement::Expression(expression))
    }

    fn expect_semicolon(&mut self) -> Result<(), Ranged<Error>> {
        self.tokens
            .expect(&Token::Char(';'), Error::ExpectedSemicolon)
            .map(|_| ())
    }

    fn expect_keyword(&mut self, keyword: &Symbol) -> Result<(), Ranged<Error>> {
        let token = self.tokens.next()?;
        if token.is_keyword(keyword) {
            Ok(())
        } else {
            Err(token.map(Error::UnexpectedToken))
        }
    }

    fn parse_name(&mut self) -> Result<Ranged<Symbol>, Ranged<Error>> {
        let token = self.tokens.next()?;
        match token.0 {
            Token::Identifier(name) if is_reserved(&name) => {
                Err(Ranged(Error::ReservedWord(name), token.1))
            }
            Token::Identifier(name) => Ok(Ranged(name, token.1)),
            _ => Err(Ranged(Error::ExpectedName, token.1)),
        }
    }

    fn parse_block(&mut self) -> Result<Vec<Ranged<Statement>>, Ranged<Error>> {
        self.tokens
            .expect(&Token::Open(Paired::Brace), Error::ExpectedBlock)?;
        let mut statements = Vec::new();
        loop {
            match self.tokens.peek_token() {
                Some(Token::Close(Paired::Brace)) => {
                    self.tokens.next()?;
                    return Ok(statements);
                }
                Some(_) => statements.push(self.parse_statement()?),
                None => {
                    return Err(match self.tokens.next() {
                        Err(Ranged(Error::UnexpectedEof, range)) => {
                            Ranged(Error::MissingEnd(Paired::Brace), range)
                        }
                        Err(err) => err,
                        Ok(token) => token.map(Error::UnexpectedToken),
                    })
                }
            }
        }
    }

    fn parse_condition(&mut self) -> Result<Ranged<Expression>, Ranged<Error>> {
        self.tokens
            .expect(&Token::Open(Paired::Paren), Error::ExpectedOpenParen)?;
        let condition = self.parse_expression()?;
        self.expect_close(Paired::Paren)?;
        Ok(condition)
    }

    fn expect_close(&mut self, kind: Paired) -> Result<(), Ranged<Error>> {
        self.tokens
            .expect(&Token::Close(kind), Error::MissingEnd(kind))
            .map(|_| ())
    }

    fn parse_var(&mut self) -> Result<Statement, Ranged<Error>> {
        self.tokens.next()?;
        let name = self.parse_name()?;
        let value = if self.tokens.next_if(&Token::Char('=')).is_some() {
            Some(self.parse_expression()?)
        } else {
            None
        };
        Ok(Statement::Var(Box::new(VarDeclaration { name, value })))
    }

    fn parse_parameters(&mut self) -> Result<Vec<Ranged<Symbol>>, Ranged<Error>> {
        self.tokens
            .expect(&Token::Open(Paired::Paren), Error::ExpectedParameters)?;
        let mut parameters = Vec::new();
        if self.tokens.next_if(&Token::Close(Paired::Paren)).is_some() {
            return Ok(parameters);
        }
        loop {
            parameters.push(self.parse_name()?);
            if self.tokens.next_if(&Token::Char(',')).is_none() {
                self.expect_close(Paired::Paren)?;
                return Ok(parameters);
            }
        }
    }

    /// Parses the remainder of a function after the `function` keyword.
    fn parse_function_rest(
        &mut self,
        is_async: bool,
        require_name: bool,
    ) -> Result<FunctionDefinition, Ranged<Error>> {
        let name = if require_name
            || matches!(self.tokens.peek_token(), Some(Token::Identifier(_)))
        {
            Some(self.parse_name()?)
        } else {
            None
        };
        let parameters = self.parse_parameters()?;
        let body = self.parse_block()?;
        Ok(FunctionDefinition {
            name,
            is_async,
            parameters,
            body,
        })
    }

    fn parse_class(&mut self) -> Result<Statement, Ranged<Error>> {
        self.tokens.next()?;
        let name = self.parse_name()?;
        let base = if self
            .tokens
            .next_if_keyword(Symbol::extends_symbol())
            .is_some()
        {
            Some(self.parse_postfix()?)
        } else {
            None
        };
        self.tokens
            .expect(&Token::Open(Paired::Brace), Error::ExpectedBlock)?;
        let mut methods = Vec::new();
        while self.tokens.next_if(&Token::Close(Paired::Brace)).is_none() {
            let start = self.tokens.peek().map_or(self.tokens.last_index, |t| t.1.start);
            let is_async = matches!(self.tokens.peek_n(1), Some(Ranged(Token::Identifier(_), _)))
                && self
                    .tokens
                    .next_if_keyword(Symbol::async_symbol())
                    .is_some();
            let method = self.parse_function_rest(is_async, true)?;
            methods.push(self.tokens.ranged(start.., method));
        }
        Ok(Statement::Class(Box::new(ClassDefinition {
            name,
            base,
            methods,
        })))
    }

    fn parse_enum(&mut self) -> Result<Statement, Ranged<Error>> {
        self.tokens.next()?;
        let name = self.parse_name()?;
        self.tokens
            .expect(&Token::Open(Paired::Brace), Error::ExpectedBlock)?;
        let mut variants = Vec::new();
        while self.tokens.next_if(&Token::Close(Paired::Brace)).is_none() {
            let variant = self.parse_name()?;
            let value = if self.tokens.next_if(&Token::Char('=')).is_some() {
                Some(self.parse_expression()?)
            } else {
                None
            };
            variants.push(EnumVariant {
                name: variant,
                value,
            });
            if self.tokens.next_if(&Token::Char(',')).is_none() {
                self.expect_close(Paired::Brace)?;
                break;
            }
        }
        Ok(Statement::Enum(Box::new(EnumDefinition { name, variants })))
    }

    fn parse_for(&mut self) -> Result<Statement, Ranged<Error>> {
        self.tokens.next()?;
        self.tokens
            .expect(&Token::Open(Paired::Paren), Error::ExpectedOpenParen)?;

        let initializer = if self.tokens.next_if(&Token::Char(';')).is_some() {
            None
        } else {
            let start = self.tokens.peek().map_or(self.tokens.last_index, |t| t.1.start);
            let statement = if self
                .tokens
                .peek_token()
                .map_or(false, |t| t.is_keyword(Symbol::var_symbol()))
            {
                self.parse_var()?
            } else {
                Statement::Expression(self.parse_expression()?)
            };
            self.expect_semicolon()?;
            Some(self.tokens.ranged(start.., statement))
        };

        let condition = if self.tokens.next_if(&Token::Char(';')).is_some() {
            None
        } else {
            let condition = self.parse_expression()?;
            self.expect_semicolon()?;
            Some(condition)
        };

        let step = if self.tokens.next_if(&Token::Close(Paired::Paren)).is_some() {
            None
        } else {
            let step = self.parse_expression()?;
            self.expect_close(Paired::Paren)?;
            Some(step)
        };

        let body = self.parse_statement()?;
        Ok(Statement::For(Box::new(ForLoop {
            initializer,
            condition,
            step,
            body,
        })))
    }

    fn parse_switch(&mut self) -> Result<Statement, Ranged<Error>> {
        self.tokens.next()?;
        let subject = self.parse_condition()?;
        self.tokens
            .expect(&Token::Open(Paired::Brace), Error::ExpectedBlock)?;
        let mut cases = Vec::new();
        while self.tokens.next_if(&Token::Close(Paired::Brace)).is_none() {
            let token = self.tokens.next()?;
            let value = if token.is_keyword(Symbol::case_symbol()) {
                Some(self.parse_expression()?)
            } else if token.is_keyword(Symbol::default_symbol()) {
                None
            } else {
                return Err(token.map(|_| Error::ExpectedCaseOrDefault));
            };
            self.tokens
                .expect(&Token::Char(':'), Error::ExpectedColon)?;

            let mut body = Vec::new();
            while !matches!(
                self.tokens.peek_token(),
                Some(Token::Close(Paired::Brace)) | None
            ) && !self.tokens.peek_token().map_or(false, |t| {
                t.is_keyword(Symbol::case_symbol()) || t.is_keyword(Symbol::default_symbol())
            }) {
                body.push(self.parse_statement()?);
            }
            cases.push(SwitchCase { value, body });
        }
        Ok(Statement::Switch(Box::new(SwitchStatement { subject, cases })))
    }

    fn parse_expression(&mut self) -> Result<Ranged<Expression>, Ranged<Error>> {
        self.parse_assignment()
    }

    fn parse_assignment(&mut self) -> Result<Ranged<Expression>, Ranged<Error>> {
        let target = self.parse_conditional()?;
        let operator = match self.tokens.peek_token() {
            Some(Token::Char('=')) => None,
            Some(Token::AddAssign) => Some(BinaryKind::Add),
            Some(Token::SubtractAssign) => Some(BinaryKind::Subtract),
            Some(Token::MultiplyAssign) => Some(BinaryKind::Multiply),
            Some(Token::DivideAssign) => Some(BinaryKind::Divide),
            Some(Token::RemainderAssign) => Some(BinaryKind::Remainder),
            _ => return Ok(target),
        };
        self.tokens.next()?;
        let target_range = target.range();
        let target = AssignTarget::from_expression(target.0)
            .ok_or(Ranged(Error::InvalidAssignmentTarget, target_range))?;
        let value = self.parse_assignment()?;
        Ok(Ranged::new(
            target_range.through(value.range()),
            Expression::Assign(Box::new(Assignment {
                target: Ranged(target, target_range),
                operator,
                value,
            })),
        ))
    }

    fn parse_conditional(&mut self) -> Result<Ranged<Expression>, Ranged<Error>> {
        let condition = self.parse_catch()?;
        if self.tokens.next_if(&Token::Char('?')).is_none() {
            return Ok(condition);
        }
        let when_true = self.parse_assignment()?;
        self.tokens
            .expect(&Token::Char(':'), Error::ExpectedColon)?;
        let when_false = self.parse_assignment()?;
        Ok(Ranged::new(
            condition.range().through(when_false.range()),
            Expression::Conditional(Box::new(Conditional {
                condition,
                when_true,
                when_false,
            })),
        ))
    }

    fn parse_catch(&mut self) -> Result<Ranged<Expression>, Ranged<Error>> {
        let mut left = self.parse_logical(0)?;
        while self
            .tokens
            .next_if_keyword(Symbol::catch_symbol())
            .is_some()
        {
            let right = self.parse_logical(0)?;
            left = logical(LogicalKind::Catch, left, right);
        }
        Ok(left)
    }

    /// Parses `??`, `||` and `&&`, from lowest to highest precedence.
    fn parse_logical(&mut self, level: usize) -> Result<Ranged<Expression>, Ranged<Error>> {
        let (token, kind) = match level {
            0 => (Token::Coalesce, LogicalKind::Coalesce),
            1 => (Token::Or, LogicalKind::Or),
            2 => (Token::And, LogicalKind::And),
            _ => return self.parse_binary(0),
        };
        let mut left = self.parse_logical(level + 1)?;
        while self.tokens.next_if(&token).is_some() {
            let right = self.parse_logical(level + 1)?;
            left = logical(kind, left, right);
        }
        Ok(left)
    }

    fn parse_binary(&mut self, level: usize) -> Result<Ranged<Expression>, Ranged<Error>> {
        let Some(operators) = binary_level(level) else {
            return self.parse_unary();
        };
        let mut left = self.parse_binary(level + 1)?;
        'operators: loop {
            let Some(next) = self.tokens.peek_token() else {
                break;
            };
            for (token, kind) in operators {
                if &next == token {
                    self.tokens.next()?;
                    let right = self.parse_binary(level + 1)?;
                    left = Ranged::new(
                        left.range().through(right.range()),
                        Expression::Binary(Box::new(BinaryExpression {
                            kind: *kind,
                            left,
                            right,
                        })),
                    );
                    continue 'operators;
                }
            }
            break;
        }
        Ok(left)
    }

    fn parse_unary(&mut self) -> Result<Ranged<Expression>, Ranged<Error>> {
        let Some(token) = self.tokens.peek() else {
            return self.parse_postfix();
        };
        let kind = match &token.0 {
            Token::Char('!') => UnaryKind::Not,
            Token::Char('-') => UnaryKind::Negate,
            Token::Char('+') => UnaryKind::Positive,
            Token::Identifier(word) if word == Symbol::typeof_symbol() => UnaryKind::TypeOf,
            Token::Identifier(word) if word == Symbol::await_symbol() => {
                self.tokens.next()?;
                let operand = self.parse_unary()?;
                return Ok(Ranged::new(
                    token.range().through(operand.range()),
                    Expression::Await(Box::new(operand)),
                ));
            }
            Token::Increment | Token::Decrement => {
                self.tokens.next()?;
                let operand = self.parse_unary()?;
                let range = token.range().through(operand.range());
                let operand_range = operand.range();
                let target = AssignTarget::from_expression(operand.0)
                    .ok_or(Ranged(Error::InvalidAssignmentTarget, operand_range))?;
                return Ok(Ranged::new(
                    range,
                    Expression::Update(Box::new(Update {
                        target: Ranged(target, operand_range),
                        increment: token.0 == Token::Increment,
                        prefix: true,
                    })),
                ));
            }
            _ => return self.parse_postfix(),
        };
        self.tokens.next()?;
        let operand = self.parse_unary()?;
        Ok(Ranged::new(
            token.range().through(operand.range()),
            Expression::Unary(Box::new(UnaryExpression { kind, operand })),
        ))
    }

    fn parse_arguments(&mut self) -> Result<Vec<Ranged<Expression>>, Ranged<Error>> {
        self.parse_delimited(Paired::Paren, Self::parse_expression)
    }

    /// Parses comma separated items until the closing `kind`. The opening
    /// delimiter must already be consumed.
    fn parse_delimited<T>(
        &mut self,
        kind: Paired,
        mut parse: impl FnMut(&mut Self) -> Result<T, Ranged<Error>>,
    ) -> Result<Vec<T>, Ranged<Error>> {
        let mut items = Vec::new();
        loop {
            if self.tokens.next_if(&Token::Close(kind)).is_some() {
                return Ok(items);
            }
            items.push(parse(self)?);
            if self.tokens.next_if(&Token::Char(',')).is_none() {
                self.expect_close(kind)?;
                return Ok(items);
            }
        }
    }

    fn parse_postfix(&mut self) -> Result<Ranged<Expression>, Ranged<Error>> {
        let mut expression = self.parse_primary()?;
        loop {
            let Some(token) = self.tokens.peek_token() else {
                break;
            };
            expression = match token {
                Token::Open(Paired::Paren) => {
                    self.tokens.next()?;
                    let arguments = self.parse_arguments()?;
                    self.tokens.ranged(
                        expression.range().start..,
                        Expression::Call(Box::new(FunctionCall {
                            function: expression,
                            arguments,
                        })),
                    )
                }
                Token::Open(Paired::Bracket) => {
                    self.tokens.next()?;
                    let index = self.parse_expression()?;
                    self.expect_close(Paired::Bracket)?;
                    self.tokens.ranged(
                        expression.range().start..,
                        Expression::Index(Box::new(Index {
                            target: expression,
                            index,
                        })),
                    )
                }
                Token::Char('.') => {
                    self.tokens.next()?;
                    let name = self.parse_attribute_name()?;
                    self.tokens.ranged(
                        expression.range().start..,
                        Expression::Attribute(Box::new(Attribute {
                            target: expression,
                            name,
                        })),
                    )
                }
                Token::Increment | Token::Decrement => {
                    let range = expression.range();
                    let Some(target) = AssignTarget::from_expression(expression.0.clone()) else {
                        break;
                    };
                    self.tokens.next()?;
                    self.tokens.ranged(
                        range.start..,
                        Expression::Update(Box::new(Update {
                            target: Ranged(target, range),
                            increment: token == Token::Increment,
                            prefix: false,
                        })),
                    )
                }
                _ => break,
            };
        }
        Ok(expression)
    }

    /// Attribute names may be keywords, such as `A.init` or `m.default`.
    fn parse_attribute_name(&mut self) -> Result<Ranged<Symbol>, Ranged<Error>> {
        let token = self.tokens.next()?;
        match token.0 {
            Token::Identifier(name) => Ok(Ranged(name, token.1)),
            _ => Err(Ranged(Error::ExpectedName, token.1)),
        }
    }

    fn parse_primary(&mut self) -> Result<Ranged<Expression>, Ranged<Error>> {
        let token = self.tokens.next()?;
        let start = token.range().start;
        let expression = match token.0 {
            Token::Int(value) => match i32::try_from(value) {
                Ok(value) => Expression::Int(value),
                #[allow(clippy::cast_precision_loss)]
                Err(_) => Expression::Num(value as f64),
            },
            Token::Float(value) => Expression::Num(value),
            Token::String(value) => Expression::String(value),
            Token::Open(Paired::Paren) => {
                let inner = self.parse_expression()?;
                self.expect_close(Paired::Paren)?;
                return Ok(self.tokens.ranged(start.., inner.0));
            }
            Token::Open(Paired::Bracket) => {
                Expression::Array(self.parse_delimited(Paired::Bracket, Self::parse_expression)?)
            }
            Token::Open(Paired::Brace) => {
                Expression::Object(self.parse_delimited(Paired::Brace, Self::parse_field)?)
            }
            Token::Identifier(word) if &word == Symbol::null_symbol() => Expression::Null,
            Token::Identifier(word) if &word == Symbol::true_symbol() => Expression::Bool(true),
            Token::Identifier(word) if &word == Symbol::false_symbol() => Expression::Bool(false),
            Token::Identifier(word) if &word == Symbol::this_symbol() => Expression::This,
            Token::Identifier(word) if &word == Symbol::function_symbol() => {
                Expression::Function(Box::new(self.parse_function_rest(false, false)?))
            }
            Token::Identifier(word) if &word == Symbol::async_symbol() => {
                self.expect_keyword(Symbol::function_symbol())?;
                Expression::Function(Box::new(self.parse_function_rest(true, false)?))
            }
            Token::Identifier(word) if &word == Symbol::new_symbol() => {
                let function = self.parse_constructor_target()?;
                self.tokens
                    .expect(&Token::Open(Paired::Paren), Error::ExpectedOpenParen)?;
                let arguments = self.parse_arguments()?;
                Expression::New(Box::new(FunctionCall {
                    function,
                    arguments,
                }))
            }
            Token::Identifier(word) if is_reserved(&word) => {
                return Err(Ranged(Error::ReservedWord(word), token.1));
            }
            Token::Identifier(word) => Expression::Identifier(word),
            other => return Err(Ranged(Error::UnexpectedToken(other), token.1)),
        };
        Ok(self.tokens.ranged(start.., expression))
    }

    /// Parses the class expression following `new`: a name optionally
    /// followed by attribute accesses.
    fn parse_constructor_target(&mut self) -> Result<Ranged<Expression>, Ranged<Error>> {
        let mut target = self.parse_name()?.map(Expression::Identifier);
        while self.tokens.next_if(&Token::Char('.')).is_some() {
            let name = self.parse_attribute_name()?;
            target = self.tokens.ranged(
                target.range().start..,
                Expression::Attribute(Box::new(Attribute { target, name })),
            );
        }
        Ok(target)
    }

    fn parse_field(&mut self) -> Result<ObjectField, Ranged<Error>> {
        let token = self.tokens.next()?;
        let key = match token.0 {
            Token::Identifier(name) => Ranged(name, token.1),
            Token::String(name) => Ranged(Symbol::from(name), token.1),
            _ => return Err(Ranged(Error::ExpectedName, token.1)),
        };
        self.tokens
            .expect(&Token::Char(':'), Error::ExpectedColon)?;
        let value = self.parse_expression()?;
        Ok(ObjectField { key, value })
    }
}

fn logical(kind: LogicalKind, left: Ranged<Expression>, right: Ranged<Expression>) -> Ranged<Expression> {
    Ranged::new(
        left.range().through(right.range()),
        Expression::Logical(Box::new(LogicalExpression { kind, left, right })),
    )
}

fn binary_level(level: usize) -> Option<&'static [(Token, BinaryKind)]> {
    const BITWISE_OR: &[(Token, BinaryKind)] = &[(Token::Char('|'), BinaryKind::BitwiseOr)];
    const BITWISE_XOR: &[(Token, BinaryKind)] = &[(Token::Char('^'), BinaryKind::BitwiseXor)];
    const BITWISE_AND: &[(Token, BinaryKind)] = &[(Token::Char('&'), BinaryKind::BitwiseAnd)];
    const EQUALITY: &[(Token, BinaryKind)] = &[
        (Token::Equals, BinaryKind::Compare(CompareKind::Equal)),
        (Token::NotEqual, BinaryKind::Compare(CompareKind::NotEqual)),
    ];
    const RELATIONAL: &[(Token, BinaryKind)] = &[
        (Token::Char('<'), BinaryKind::Compare(CompareKind::LessThan)),
        (
            Token::LessThanOrEqual,
            BinaryKind::Compare(CompareKind::LessThanOrEqual),
        ),
        (
            Token::Char('>'),
            BinaryKind::Compare(CompareKind::GreaterThan),
        ),
        (
            Token::GreaterThanOrEqual,
            BinaryKind::Compare(CompareKind::GreaterThanOrEqual),
        ),
    ];
    const SHIFT: &[(Token, BinaryKind)] = &[
        (Token::ShiftLeft, BinaryKind::ShiftLeft),
        (Token::ShiftRight, BinaryKind::ShiftRight),
    ];
    const ADDITIVE: &[(Token, BinaryKind)] = &[
        (Token::Char('+'), BinaryKind::Add),
        (Token::Char('-'), BinaryKind::Subtract),
    ];
    const MULTIPLICATIVE: &[(Token, BinaryKind)] = &[
        (Token::Char('*'), BinaryKind::Multiply),
        (Token::Char('/'), BinaryKind::Divide),
        (Token::Char('%'), BinaryKind::Remainder),
    ];

    [
        BITWISE_OR,
        BITWISE_XOR,
        BITWISE_AND,
        EQUALITY,
        RELATIONAL,
        SHIFT,
        ADDITIVE,
        MULTIPLICATIVE,
    ]
    .get(level)
    .copied()
}

#[cfg(test)]
fn parse_expression_source(source: &str) -> Expression {
    let mut statements = parse(source).unwrap();
    match statements.remove(0).0 {
        Statement::Expression(expression) => expression.0,
        other => unreachable!("expected expression, got {other:?}"),
    }
}

#[test]
fn precedence() {
    let Expression::Binary(add) = parse_expression_source("1 + 2 * 3;") else {
        unreachable!()
    };
    assert_eq!(add.kind, BinaryKind::Add);
    assert_eq!(add.left.0, Expression::Int(1));
    assert!(matches!(&add.right.0, Expression::Binary(mul) if mul.kind == BinaryKind::Multiply));
}

#[test]
fn large_integers_become_floats() {
    assert_eq!(
        parse_expression_source("2147483648;"),
        Expression::Num(2_147_483_648.0)
    );
    assert_eq!(
        parse_expression_source("2147483647;"),
        Expression::Int(i32::MAX)
    );
}

#[test]
fn assignment_targets() {
    let err = parse("1 = 2;").unwrap_err();
    assert_eq!(err.0, Error::InvalidAssignmentTarget);
    assert!(matches!(
        parse_expression_source("a.b[0] += 1;"),
        Expression::Assign(assign) if assign.operator == Some(BinaryKind::Add)
            && matches!(assign.target.0, AssignTarget::Index(_))
    ));
}

#[test]
fn declarations() {
    let statements = parse(
        "class B extends A { init(x) { this.x = x; } async go() { return 1; } }
         enum Color { Red, Green = 5 }
         module m { var a = 1; }
         import math as m2;",
    )
    .unwrap();
    assert_eq!(statements.len(), 4);
    let Statement::Class(class) = &statements[0].0 else {
        unreachable!()
    };
    assert_eq!(class.methods.len(), 2);
    assert!(class.methods[1].is_async);
    let Statement::Enum(definition) = &statements[1].0 else {
        unreachable!()
    };
    assert_eq!(definition.variants.len(), 2);
}

#[test]
fn reserved_words_are_not_names() {
    let err = parse("var class = 1;").unwrap_err();
    assert_eq!(err.0, Error::ReservedWord(Symbol::from("class")));
}
