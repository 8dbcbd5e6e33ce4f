//! Condition and payload expressions.
//!
//! A small query language evaluated against a JSON object:
//! literals (`true`, `false`, `null`, numbers, `'single'` or `"double"` quoted
//! strings, `[..]` arrays), paths (`a.b`, `a['b']`, `a[0]`), comparisons
//! (`==`, `!=`, `<`, `<=`, `>`, `>=`, `IN`, `NOT IN`), boolean operators
//! (`AND`/`&&`, `OR`/`||`, `NOT`/`!`) and parentheses. Keywords are
//! case-insensitive. A path that does not resolve evaluates to `null`.
//! `AND` and `OR` short-circuit and yield the operand that decided the result.

use std::cmp::Ordering;

use serde_json::{Map, Number, Value};

use casebook_core::error::{CasebookError, Result};
use casebook_core::traits::ExpressionEvaluator;

/// The built-in expression evaluator.
#[derive(Debug, Clone, Copy, Default)]
pub struct ExprEvaluator;

impl ExprEvaluator {
    pub fn new() -> Self {
        Self
    }

    /// Parse without evaluating.
    pub fn validate(expr: &str) -> Result<()> {
        if expr.trim().is_empty() {
            return Ok(());
        }
        parse(expr).map(|_| ())
    }
}

impl ExpressionEvaluator for ExprEvaluator {
    fn evaluate(&self, expr: &str, context: &Map<String, Value>) -> Result<Value> {
        if expr.trim().is_empty() {
            return Ok(Value::Bool(true));
        }
        let ast = parse(expr)?;
        Ok(eval(&ast, context))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CmpOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    In,
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Ident(String),
    Value(Value),
    Cmp(CmpOp),
    And,
    Or,
    Not,
    LParen,
    RParen,
    LBracket,
    RBracket,
    Dot,
    Comma,
}

#[derive(Debug, Clone, PartialEq)]
enum Segment {
    Key(String),
    Index(usize),
}

#[derive(Debug, Clone, PartialEq)]
enum Expr {
    Literal(Value),
    Path(Vec<Segment>),
    Array(Vec<Expr>),
    Not(Box<Expr>),
    And(Box<Expr>, Box<Expr>),
    Or(Box<Expr>, Box<Expr>),
    Compare(CmpOp, Box<Expr>, Box<Expr>),
}

fn parse(expr: &str) -> Result<Expr> {
    let tokens = tokenize(expr).map_err(|e| CasebookError::expression(expr, e))?;
    let mut parser = Parser { tokens, pos: 0 };
    let ast = parser
        .parse_or()
        .map_err(|e| CasebookError::expression(expr, e))?;
    if let Some(token) = parser.peek() {
        return Err(CasebookError::expression(
            expr,
            format!("unexpected token {token:?}"),
        ));
    }
    Ok(ast)
}

fn tokenize(input: &str) -> std::result::Result<Vec<Token>, String> {
    let mut tokens = Vec::new();
    let mut chars = input.chars().peekable();

    while let Some(&c) = chars.peek() {
        match c {
            c if c.is_whitespace() => {
                chars.next();
            }
            '(' | ')' | '[' | ']' | '.' | ',' => {
                chars.next();
                tokens.push(match c {
                    '(' => Token::LParen,
                    ')' => Token::RParen,
                    '[' => Token::LBracket,
                    ']' => Token::RBracket,
                    '.' => Token::Dot,
                    _ => Token::Comma,
                });
            }
            '=' => {
                chars.next();
                if chars.next_if_eq(&'=').is_none() {
                    return Err("expected `==`".into());
                }
                tokens.push(Token::Cmp(CmpOp::Eq));
            }
            '!' => {
                chars.next();
                if chars.next_if_eq(&'=').is_some() {
                    tokens.push(Token::Cmp(CmpOp::Ne));
                } else {
                    tokens.push(Token::Not);
                }
            }
            '<' | '>' => {
                chars.next();
                let or_equal = chars.next_if_eq(&'=').is_some();
                tokens.push(Token::Cmp(match (c, or_equal) {
                    ('<', false) => CmpOp::Lt,
                    ('<', true) => CmpOp::Le,
                    (_, false) => CmpOp::Gt,
                    (_, true) => CmpOp::Ge,
                }));
            }
            '&' | '|' => {
                chars.next();
                if chars.next_if_eq(&c).is_none() {
                    return Err(format!("expected `{c}{c}`"));
                }
                tokens.push(if c == '&' { Token::And } else { Token::Or });
            }
            '\'' | '"' => {
                chars.next();
                let mut s = String::new();
                let mut closed = false;
                while let Some(ch) = chars.next() {
                    match ch {
                        '\\' => match chars.next() {
                            Some('n') => s.push('\n'),
                            Some('t') => s.push('\t'),
                            Some(other) => s.push(other),
                            None => break,
                        },
                        ch if ch == c => {
                            closed = true;
                            break;
                        }
                        ch => s.push(ch),
                    }
                }
                if !closed {
                    return Err("unterminated string".into());
                }
                tokens.push(Token::Value(Value::String(s)));
            }
            c if c.is_ascii_digit() || c == '-' => {
                chars.next();
                let mut text = String::from(c);
                while let Some(d) = chars.next_if(|d| d.is_ascii_digit()) {
                    text.push(d);
                }
                // Only a digit after the dot makes it a fraction; `a.0` stays a path.
                let mut lookahead = chars.clone();
                if lookahead.next() == Some('.') && lookahead.peek().is_some_and(|d| d.is_ascii_digit()) {
                    chars.next();
                    text.push('.');
                    while let Some(d) = chars.next_if(|d| d.is_ascii_digit()) {
                        text.push(d);
                    }
                }
                tokens.push(Token::Value(parse_number(&text)?));
            }
            c if c.is_alphabetic() || c == '_' => {
                let mut ident = String::new();
                while let Some(ch) = chars.next_if(|ch| ch.is_alphanumeric() || *ch == '_') {
                    ident.push(ch);
                }
                tokens.push(match ident.to_ascii_uppercase().as_str() {
                    "AND" => Token::And,
                    "OR" => Token::Or,
                    "NOT" => Token::Not,
                    "IN" => Token::Cmp(CmpOp::In),
                    "TRUE" => Token::Value(Value::Bool(true)),
                    "FALSE" => Token::Value(Value::Bool(false)),
                    "NULL" => Token::Value(Value::Null),
                    _ => Token::Ident(ident),
                });
            }
            other => return Err(format!("unexpected character `{other}`")),
        }
    }
    Ok(tokens)
}

fn parse_number(text: &str) -> std::result::Result<Value, String> {
    if text == "-" {
        return Err("expected a number after `-`".into());
    }
    if let Ok(n) = text.parse::<i64>() {
        return Ok(Value::Number(n.into()));
    }
    text.parse::<f64>()
        .ok()
        .and_then(Number::from_f64)
        .map(Value::Number)
        .ok_or_else(|| format!("invalid number `{text}`"))
}

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
}

type ParseResult = std::result::Result<Expr, String>;

impl Parser {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn peek_at(&self, offset: usize) -> Option<&Token> {
        self.tokens.get(self.pos + offset)
    }

    fn next(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.pos).cloned();
        if token.is_some() {
            self.pos += 1;
        }
        token
    }

    fn expect(&mut self, want: Token) -> std::result::Result<(), String> {
        match self.next() {
            Some(ref got) if *got == want => Ok(()),
            Some(got) => Err(format!("expected {want:?}, found {got:?}")),
            None => Err(format!("expected {want:?}, found end of input")),
        }
    }

    fn parse_or(&mut self) -> ParseResult {
        let mut left = self.parse_and()?;
        while self.peek() == Some(&Token::Or) {
            self.pos += 1;
            let right = self.parse_and()?;
            left = Expr::Or(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn parse_and(&mut self) -> ParseResult {
        let mut left = self.parse_not()?;
        while self.peek() == Some(&Token::And) {
            self.pos += 1;
            let right = self.parse_not()?;
            left = Expr::And(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn parse_not(&mut self) -> ParseResult {
        if self.peek() == Some(&Token::Not) {
            self.pos += 1;
            let inner = self.parse_not()?;
            return Ok(Expr::Not(Box::new(inner)));
        }
        self.parse_comparison()
    }

    fn parse_comparison(&mut self) -> ParseResult {
        let left = self.parse_primary()?;
        match self.peek() {
            Some(Token::Cmp(op)) => {
                let op = *op;
                self.pos += 1;
                let right = self.parse_primary()?;
                Ok(Expr::Compare(op, Box::new(left), Box::new(right)))
            }
            Some(Token::Not) if self.peek_at(1) == Some(&Token::Cmp(CmpOp::In)) => {
                self.pos += 2;
                let right = self.parse_primary()?;
                Ok(Expr::Not(Box::new(Expr::Compare(
                    CmpOp::In,
                    Box::new(left),
                    Box::new(right),
                ))))
            }
            _ => Ok(left),
        }
    }

    fn parse_primary(&mut self) -> ParseResult {
        match self.next() {
            Some(Token::Value(value)) => Ok(Expr::Literal(value)),
            Some(Token::LParen) => {
                let inner = self.parse_or()?;
                self.expect(Token::RParen)?;
                Ok(inner)
            }
            Some(Token::LBracket) => {
                let mut items = Vec::new();
                if self.peek() == Some(&Token::RBracket) {
                    self.pos += 1;
                    return Ok(Expr::Array(items));
                }
                loop {
                    items.push(self.parse_or()?);
                    match self.next() {
                        Some(Token::Comma) => continue,
                        Some(Token::RBracket) => break,
                        other => return Err(format!("expected `,` or `]`, found {other:?}")),
                    }
                }
                Ok(Expr::Array(items))
            }
            Some(Token::Ident(name)) => self.parse_path(name),
            Some(other) => Err(format!("unexpected token {other:?}")),
            None => Err("unexpected end of input".into()),
        }
    }

    fn parse_path(&mut self, head: String) -> ParseResult {
        let mut segments = vec![Segment::Key(head)];
        loop {
            match self.peek() {
                Some(Token::Dot) => {
                    self.pos += 1;
                    match self.next() {
                        Some(Token::Ident(key)) => segments.push(Segment::Key(key)),
                        Some(Token::Value(Value::Number(n))) => segments.push(index_segment(&n)?),
                        other => return Err(format!("expected attribute name, found {other:?}")),
                    }
                }
                Some(Token::LBracket) => {
                    self.pos += 1;
                    match self.next() {
                        Some(Token::Value(Value::String(key))) => segments.push(Segment::Key(key)),
                        Some(Token::Value(Value::Number(n))) => segments.push(index_segment(&n)?),
                        other => return Err(format!("expected key or index, found {other:?}")),
                    }
                    self.expect(Token::RBracket)?;
                }
                _ => break,
            }
        }
        Ok(Expr::Path(segments))
    }
}

fn index_segment(n: &Number) -> std::result::Result<Segment, String> {
    n.as_u64()
        .and_then(|i| usize::try_from(i).ok())
        .map(Segment::Index)
        .ok_or_else(|| format!("invalid index {n}"))
}

fn eval(expr: &Expr, context: &Map<String, Value>) -> Value {
    match expr {
        Expr::Literal(value) => value.clone(),
        Expr::Path(segments) => lookup(segments, context),
        Expr::Array(items) => Value::Array(items.iter().map(|e| eval(e, context)).collect()),
        Expr::Not(inner) => Value::Bool(!truthy(&eval(inner, context))),
        // Both return the deciding operand, so `a || b` works as a fallback.
        Expr::And(left, right) => {
            let left = eval(left, context);
            if truthy(&left) {
                eval(right, context)
            } else {
                left
            }
        }
        Expr::Or(left, right) => {
            let left = eval(left, context);
            if truthy(&left) {
                left
            } else {
                eval(right, context)
            }
        }
        Expr::Compare(op, left, right) => {
            let left = eval(left, context);
            let right = eval(right, context);
            let result = match op {
                CmpOp::In => match &right {
                    Value::Array(items) => items
                        .iter()
                        .any(|item| compare(&left, item) == Ordering::Equal),
                    _ => false,
                },
                CmpOp::Eq => compare(&left, &right) == Ordering::Equal,
                CmpOp::Ne => compare(&left, &right) != Ordering::Equal,
                CmpOp::Lt => compare(&left, &right) == Ordering::Less,
                CmpOp::Le => compare(&left, &right) != Ordering::Greater,
                CmpOp::Gt => compare(&left, &right) == Ordering::Greater,
                CmpOp::Ge => compare(&left, &right) != Ordering::Less,
            };
            Value::Bool(result)
        }
    }
}

fn lookup(segments: &[Segment], context: &Map<String, Value>) -> Value {
    let Some((Segment::Key(head), rest)) = segments.split_first() else {
        return Value::Null;
    };
    let mut current = match context.get(head) {
        Some(value) => value,
        None => return Value::Null,
    };
    for segment in rest {
        let next = match (segment, current) {
            (Segment::Key(key), Value::Object(map)) => map.get(key),
            (Segment::Index(i), Value::Array(items)) => items.get(*i),
            _ => None,
        };
        match next {
            Some(value) => current = value,
            None => return Value::Null,
        }
    }
    current.clone()
}

fn truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().is_some_and(|f| f != 0.0),
        Value::String(s) => !s.is_empty(),
        Value::Array(_) | Value::Object(_) => true,
    }
}

fn type_rank(value: &Value) -> u8 {
    match value {
        Value::Null => 0,
        Value::Bool(_) => 1,
        Value::Number(_) => 2,
        Value::String(_) => 3,
        Value::Array(_) => 4,
        Value::Object(_) => 5,
    }
}

/// Total order over JSON values: null < bool < number < string < array < object.
fn compare(left: &Value, right: &Value) -> Ordering {
    match (left, right) {
        (Value::Null, Value::Null) => Ordering::Equal,
        (Value::Bool(a), Value::Bool(b)) => a.cmp(b),
        (Value::Number(a), Value::Number(b)) => {
            let a = a.as_f64().unwrap_or(0.0);
            let b = b.as_f64().unwrap_or(0.0);
            a.partial_cmp(&b).unwrap_or(Ordering::Equal)
        }
        (Value::String(a), Value::String(b)) => a.cmp(b),
        (Value::Array(a), Value::Array(b)) => {
            for (x, y) in a.iter().zip(b.iter()) {
                let ord = compare(x, y);
                if ord != Ordering::Equal {
                    return ord;
                }
            }
            a.len().cmp(&b.len())
        }
        (Value::Object(a), Value::Object(b)) => {
            for ((ka, va), (kb, vb)) in a.iter().zip(b.iter()) {
                let ord = ka.cmp(kb).then_with(|| compare(va, vb));
                if ord != Ordering::Equal {
                    return ord;
                }
            }
            a.len().cmp(&b.len())
        }
        _ => type_rank(left).cmp(&type_rank(right)),
    }
}
