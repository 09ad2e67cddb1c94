//! Sandboxed formula expressions
//!
//! A small recursive-descent parser over a fixed grammar:
//!
//! ```text
//! expr       := or
//! or         := and ( "||" and )*
//! and        := unary ( "&&" unary )*
//! unary      := "!" unary | comparison
//! comparison := primary ( ( "==" | "!=" | ">" | ">=" | "<" | "<=" ) primary )?
//! primary    := literal | path | "$current_user." path | "(" expr ")"
//! ```
//!
//! Paths resolve against the record, `$current_user.` paths against the acting
//! user. Evaluation touches nothing else.

use std::cmp::Ordering;

use serde_json::Value;

use permgate_common::error::{Error, Result};
use permgate_common::types::lookup_path;

/// Comparison operators shared by formulas and the filter compiler
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompareOp {
    Eq,
    Ne,
    Gt,
    Gte,
    Lt,
    Lte,
}

impl CompareOp {
    /// Apply the operator to two (possibly missing) values
    #[must_use]
    pub fn apply(self, left: Option<&Value>, right: Option<&Value>) -> bool {
        match self {
            CompareOp::Eq => loose_eq(left, right),
            CompareOp::Ne => !loose_eq(left, right),
            CompareOp::Gt => order(left, right) == Some(Ordering::Greater),
            CompareOp::Gte => matches!(order(left, right), Some(Ordering::Greater | Ordering::Equal)),
            CompareOp::Lt => order(left, right) == Some(Ordering::Less),
            CompareOp::Lte => matches!(order(left, right), Some(Ordering::Less | Ordering::Equal)),
        }
    }
}

/// Equality where missing and null are alike and numbers compare numerically
#[must_use]
pub fn loose_eq(left: Option<&Value>, right: Option<&Value>) -> bool {
    let left = left.unwrap_or(&Value::Null);
    let right = right.unwrap_or(&Value::Null);
    match (left, right) {
        (Value::Number(a), Value::Number(b)) => a.as_f64() == b.as_f64(),
        (a, b) => a == b,
    }
}

/// Ordering for numbers and strings; anything else is unordered
#[must_use]
pub fn order(left: Option<&Value>, right: Option<&Value>) -> Option<Ordering> {
    match (left?, right?) {
        (Value::Number(a), Value::Number(b)) => a.as_f64()?.partial_cmp(&b.as_f64()?),
        (Value::String(a), Value::String(b)) => Some(a.cmp(b)),
        _ => None,
    }
}

/// Truthiness: null, false, 0 and "" are false
#[must_use]
pub fn truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().is_some_and(|f| f != 0.0),
        Value::String(s) => !s.is_empty(),
        Value::Array(_) | Value::Object(_) => true,
    }
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Token {
    Path(String),
    UserPath(String),
    Literal(Value),
    Compare(CompareOp),
    And,
    Or,
    Not,
    LParen,
    RParen,
}

const USER_SIGIL: &str = "$current_user.";

/// Split `source` into tokens
pub(crate) fn tokenize(source: &str) -> Result<Vec<Token>> {
    let chars: Vec<char> = source.chars().collect();
    let mut tokens = Vec::new();
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];
        match c {
            c if c.is_whitespace() => i += 1,
            '(' => {
                tokens.push(Token::LParen);
                i += 1;
            }
            ')' => {
                tokens.push(Token::RParen);
                i += 1;
            }
            '&' | '|' => {
                if chars.get(i + 1) != Some(&c) {
                    return Err(Error::Expression(format!("expected '{c}{c}' at {i}")));
                }
                tokens.push(if c == '&' { Token::And } else { Token::Or });
                i += 2;
            }
            '=' | '!' | '<' | '>' => {
                let next = chars.get(i + 1).copied();
                let (token, width) = match (c, next) {
                    ('=', Some('=')) => (Token::Compare(CompareOp::Eq), 2),
                    ('!', Some('=')) => (Token::Compare(CompareOp::Ne), 2),
                    ('>', Some('=')) => (Token::Compare(CompareOp::Gte), 2),
                    ('<', Some('=')) => (Token::Compare(CompareOp::Lte), 2),
                    ('>', _) => (Token::Compare(CompareOp::Gt), 1),
                    ('<', _) => (Token::Compare(CompareOp::Lt), 1),
                    ('!', _) => (Token::Not, 1),
                    _ => return Err(Error::Expression(format!("unexpected '=' at {i}"))),
                };
                i += width;
                // `===` / `!==`
                if matches!(token, Token::Compare(CompareOp::Eq | CompareOp::Ne))
                    && chars.get(i) == Some(&'=')
                {
                    i += 1;
                }
                tokens.push(token);
            }
            '\'' | '"' => {
                let (text, end) = read_string(&chars, i)?;
                tokens.push(Token::Literal(Value::String(text)));
                i = end;
            }
            c if c.is_ascii_digit() || (c == '-' && chars.get(i + 1).is_some_and(char::is_ascii_digit)) => {
                let start = i;
                i += 1;
                while i < chars.len() && (chars[i].is_ascii_digit() || chars[i] == '.') {
                    i += 1;
                }
                let text: String = chars[start..i].iter().collect();
                tokens.push(Token::Literal(parse_number(&text)?));
            }
            c if c == '$' || c == '_' || c.is_alphabetic() => {
                let start = i;
                i += 1;
                while i < chars.len()
                    && (chars[i].is_alphanumeric() || chars[i] == '_' || chars[i] == '.' || chars[i] == '$')
                {
                    i += 1;
                }
                let word: String = chars[start..i].iter().collect();
                tokens.push(word_token(word)?);
            }
            other => {
                return Err(Error::Expression(format!("unexpected character '{other}' at {i}")))
            }
        }
    }

    Ok(tokens)
}

fn read_string(chars: &[char], start: usize) -> Result<(String, usize)> {
    let quote = chars[start];
    let mut text = String::new();
    let mut i = start + 1;
    while i < chars.len() {
        match chars[i] {
            '\\' => {
                let escaped = chars
                    .get(i + 1)
                    .ok_or_else(|| Error::Expression("dangling escape".to_string()))?;
                text.push(match escaped {
                    'n' => '\n',
                    't' => '\t',
                    other => *other,
                });
                i += 2;
            }
            c if c == quote => return Ok((text, i + 1)),
            c => {
                text.push(c);
                i += 1;
            }
        }
    }
    Err(Error::Expression("unterminated string literal".to_string()))
}

fn parse_number(text: &str) -> Result<Value> {
    if let Ok(int) = text.parse::<i64>() {
        return Ok(Value::from(int));
    }
    text.parse::<f64>()
        .ok()
        .and_then(serde_json::Number::from_f64)
        .map(Value::Number)
        .ok_or_else(|| Error::Expression(format!("invalid number '{text}'")))
}

fn word_token(word: String) -> Result<Token> {
    match word.as_str() {
        "true" => return Ok(Token::Literal(Value::Bool(true))),
        "false" => return Ok(Token::Literal(Value::Bool(false))),
        "null" | "undefined" => return Ok(Token::Literal(Value::Null)),
        _ => {}
    }
    if let Some(path) = word.strip_prefix(USER_SIGIL) {
        if valid_path(path) {
            return Ok(Token::UserPath(path.to_string()));
        }
    } else if valid_path(&word) {
        return Ok(Token::Path(word));
    }
    Err(Error::Expression(format!("invalid identifier '{word}'")))
}

fn valid_path(path: &str) -> bool {
    !path.is_empty()
        && path
            .split('.')
            .all(|segment| !segment.is_empty() && !segment.contains('$'))
}

/// Parsed expression tree
#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Literal(Value),
    Field(String),
    User(String),
    Not(Box<Expr>),
    And(Box<Expr>, Box<Expr>),
    Or(Box<Expr>, Box<Expr>),
    Compare(Box<Expr>, CompareOp, Box<Expr>),
}

impl Expr {
    /// Evaluate to a value against `record` and `user`
    #[must_use]
    pub fn eval(&self, record: &Value, user: &Value) -> Value {
        match self {
            Expr::Literal(value) => value.clone(),
            Expr::Field(path) => lookup_path(record, path).cloned().unwrap_or(Value::Null),
            Expr::User(path) => lookup_path(user, path).cloned().unwrap_or(Value::Null),
            Expr::Not(inner) => Value::Bool(!inner.test(record, user)),
            Expr::And(left, right) => {
                Value::Bool(left.test(record, user) && right.test(record, user))
            }
            Expr::Or(left, right) => {
                Value::Bool(left.test(record, user) || right.test(record, user))
            }
            Expr::Compare(left, op, right) => {
                let left = left.eval(record, user);
                let right = right.eval(record, user);
                Value::Bool(op.apply(Some(&left), Some(&right)))
            }
        }
    }

    /// Evaluate as a boolean
    #[must_use]
    pub fn test(&self, record: &Value, user: &Value) -> bool {
        truthy(&self.eval(record, user))
    }
}

/// Deepest nesting of `!` and parentheses a formula may use
const MAX_DEPTH: usize = 64;
/// Longest formula, in tokens
const MAX_TOKENS: usize = 1024;

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
    depth: usize,
}

impl Parser {
    fn descend(&mut self) -> Result<()> {
        self.depth += 1;
        if self.depth > MAX_DEPTH {
            return Err(Error::Expression(format!(
                "formula nested deeper than {MAX_DEPTH} levels"
            )));
        }
        Ok(())
    }

    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn next(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.pos).cloned();
        self.pos += 1;
        token
    }

    fn or(&mut self) -> Result<Expr> {
        let mut left = self.and()?;
        while self.peek() == Some(&Token::Or) {
            self.pos += 1;
            let right = self.and()?;
            left = Expr::Or(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn and(&mut self) -> Result<Expr> {
        let mut left = self.unary()?;
        while self.peek() == Some(&Token::And) {
            self.pos += 1;
            let right = self.unary()?;
            left = Expr::And(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn unary(&mut self) -> Result<Expr> {
        if self.peek() == Some(&Token::Not) {
            self.pos += 1;
            self.descend()?;
            let inner = self.unary()?;
            self.depth -= 1;
            return Ok(Expr::Not(Box::new(inner)));
        }
        self.comparison()
    }

    fn comparison(&mut self) -> Result<Expr> {
        let left = self.primary()?;
        if let Some(Token::Compare(op)) = self.peek().cloned() {
            self.pos += 1;
            let right = self.primary()?;
            return Ok(Expr::Compare(Box::new(left), op, Box::new(right)));
        }
        Ok(left)
    }

    fn primary(&mut self) -> Result<Expr> {
        match self.next() {
            Some(Token::Literal(value)) => Ok(Expr::Literal(value)),
            Some(Token::Path(path)) => Ok(Expr::Field(path)),
            Some(Token::UserPath(path)) => Ok(Expr::User(path)),
            Some(Token::LParen) => {
                self.descend()?;
                let inner = self.or()?;
                self.depth -= 1;
                match self.next() {
                    Some(Token::RParen) => Ok(inner),
                    _ => Err(Error::Expression("expected ')'".to_string())),
                }
            }
            Some(token) => Err(Error::Expression(format!("unexpected token {token:?}"))),
            None => Err(Error::Expression("unexpected end of expression".to_string())),
        }
    }
}

/// A parsed formula, ready to evaluate
#[derive(Debug, Clone, PartialEq)]
pub struct Formula {
    source: String,
    ast: Expr,
}

impl Formula {
    /// Parse `source`
    ///
    /// # Errors
    /// Returns `Error::Expression` if the text is outside the grammar.
    pub fn parse(source: &str) -> Result<Self> {
        let tokens = tokenize(source)?;
        if tokens.is_empty() {
            return Err(Error::Expression("empty formula".to_string()));
        }
        if tokens.len() > MAX_TOKENS {
            return Err(Error::Expression(format!(
                "formula longer than {MAX_TOKENS} tokens"
            )));
        }
        let mut parser = Parser {
            tokens,
            pos: 0,
            depth: 0,
        };
        let ast = parser.or()?;
        if parser.pos < parser.tokens.len() {
            return Err(Error::Expression(format!(
                "trailing input after position {}",
                parser.pos
            )));
        }
        Ok(Self {
            source: source.to_string(),
            ast,
        })
    }

    #[must_use]
    pub fn source(&self) -> &str {
        &self.source
    }

    #[must_use]
    pub fn ast(&self) -> &Expr {
        &self.ast
    }

    /// Evaluate against a record and the acting user's JSON view
    #[must_use]
    pub fn evaluate(&self, record: &Value, user: &Value) -> bool {
        self.ast.test(record, user)
    }
}
