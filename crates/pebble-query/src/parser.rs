//! Text predicate parser
//!
//! Parses filter strings such as
//! `faction = 'red' AND hp >= 10 AND within(0, 0, 0, 50)` into a [`Predicate`].
//!
//! ```text
//! expr    := and (("OR" | "||") and)*
//! and     := unary (("AND" | "&&" | ",") unary)*
//! unary   := ("NOT" | "!") unary | primary
//! primary := "(" expr ")" | "*" | call | path op literal
//! call    := within(x, y, z, r) | inside(x1, y1, z1, x2, y2, z2) | has(path)
//! op      := "=" | "==" | "!=" | "<" | "<=" | ">" | ">="
//! literal := number | 'text' | "text" | true | false | null
//! ```

use pebble_spatial::{Aabb, Point3};
use serde_json::{Number, Value};
use thiserror::Error;

use crate::predicate::Predicate;
use crate::value::FieldPath;

/// Parse error.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("parse error at position {position}: {message}")]
pub struct ParseError {
    pub message: String,
    pub position: usize,
}

/// Parse a filter string into a [`Predicate`].
///
/// Keywords are case-insensitive. Field paths are dotted identifiers.
///
/// # Errors
///
/// Returns `ParseError` if the string is empty or malformed.
pub fn parse_predicate(input: &str) -> Result<Predicate, ParseError> {
    let mut parser = Parser::new(input);
    parser.parse()
}

#[derive(Clone, Copy)]
enum Comparison {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

struct Parser<'a> {
    input: &'a str,
    pos: usize,
}

impl<'a> Parser<'a> {
    fn new(input: &'a str) -> Self {
        Self { input, pos: 0 }
    }

    fn parse(&mut self) -> Result<Predicate, ParseError> {
        self.skip_whitespace();
        if self.is_eof() {
            return Err(self.error("empty predicate"));
        }

        let predicate = self.parse_or()?;

        self.skip_whitespace();
        if !self.is_eof() {
            return Err(self.error("unexpected trailing input"));
        }

        Ok(predicate)
    }

    fn parse_or(&mut self) -> Result<Predicate, ParseError> {
        let mut lhs = self.parse_and()?;

        loop {
            self.skip_whitespace();
            if self.eat_str("||") || self.eat_keyword("or") {
                let rhs = self.parse_and()?;
                lhs = lhs.or(rhs);
            } else {
                return Ok(lhs);
            }
        }
    }

    fn parse_and(&mut self) -> Result<Predicate, ParseError> {
        let mut lhs = self.parse_unary()?;

        loop {
            self.skip_whitespace();
            if self.eat_str("&&") || self.eat_str(",") || self.eat_keyword("and") {
                let rhs = self.parse_unary()?;
                lhs = lhs.and(rhs);
            } else {
                return Ok(lhs);
            }
        }
    }

    fn parse_unary(&mut self) -> Result<Predicate, ParseError> {
        self.skip_whitespace();

        if self.peek() == Some('!') && !self.check_str("!=") {
            self.advance();
            return Ok(Predicate::Not(Box::new(self.parse_unary()?)));
        }
        if self.eat_keyword("not") {
            return Ok(Predicate::Not(Box::new(self.parse_unary()?)));
        }

        self.parse_primary()
    }

    fn parse_primary(&mut self) -> Result<Predicate, ParseError> {
        self.skip_whitespace();

        match self.peek() {
            None => Err(self.error("expected predicate")),
            Some('(') => {
                self.advance();
                let inner = self.parse_or()?;
                self.expect(')')?;
                Ok(inner)
            }
            Some('*') => {
                self.advance();
                Ok(Predicate::All)
            }
            Some(_) => {
                let start = self.pos;
                let path = self.parse_path()?;

                self.skip_whitespace();
                if self.peek() == Some('(') {
                    return self.parse_call(&path, start);
                }

                let op = self.parse_comparison()?;
                let value = self.parse_literal()?;
                let field = FieldPath::new(&path);

                Ok(match op {
                    Comparison::Eq => Predicate::Eq { field, value },
                    Comparison::Ne => Predicate::Not(Box::new(Predicate::Eq { field, value })),
                    Comparison::Lt => Predicate::lt(field, value),
                    Comparison::Le => Predicate::le(field, value),
                    Comparison::Gt => Predicate::gt(field, value),
                    Comparison::Ge => Predicate::ge(field, value),
                })
            }
        }
    }

    fn parse_call(&mut self, name: &str, start: usize) -> Result<Predicate, ParseError> {
        self.expect('(')?;

        let predicate = match name.to_ascii_lowercase().as_str() {
            "within" => {
                let args = self.parse_numbers::<4>()?;
                let radius = args[3];
                if radius.is_nan() || radius < 0.0 {
                    return Err(ParseError {
                        message: "radius must be non-negative".to_string(),
                        position: start,
                    });
                }
                Predicate::within(Point3::new(args[0], args[1], args[2]), radius)
            }
            "inside" => {
                let args = self.parse_numbers::<6>()?;
                Predicate::inside(Aabb::from_corners(
                    Point3::new(args[0], args[1], args[2]),
                    Point3::new(args[3], args[4], args[5]),
                ))
            }
            "has" => {
                self.skip_whitespace();
                let path = self.parse_path()?;
                Predicate::exists(path.as_str())
            }
            _ => {
                return Err(ParseError {
                    message: format!("unknown function '{name}'"),
                    position: start,
                });
            }
        };

        self.skip_whitespace();
        self.expect(')')?;
        Ok(predicate)
    }

    /// Exactly `N` comma-separated numbers.
    fn parse_numbers<const N: usize>(&mut self) -> Result<[f64; N], ParseError> {
        let mut out = [0.0; N];
        for (i, slot) in out.iter_mut().enumerate() {
            if i > 0 {
                self.skip_whitespace();
                self.expect(',')?;
            }
            self.skip_whitespace();
            let position = self.pos;
            let value = self.parse_number()?;
            *slot = value.as_f64().ok_or_else(|| ParseError {
                message: "expected number".to_string(),
                position,
            })?;
        }
        Ok(out)
    }

    fn parse_comparison(&mut self) -> Result<Comparison, ParseError> {
        self.skip_whitespace();

        let op = if self.eat_str("==") || self.eat_str("=") {
            Comparison::Eq
        } else if self.eat_str("!=") {
            Comparison::Ne
        } else if self.eat_str("<=") {
            Comparison::Le
        } else if self.eat_str(">=") {
            Comparison::Ge
        } else if self.eat_str("<") {
            Comparison::Lt
        } else if self.eat_str(">") {
            Comparison::Gt
        } else {
            return Err(self.error("expected comparison operator"));
        };

        Ok(op)
    }

    fn parse_literal(&mut self) -> Result<Value, ParseError> {
        self.skip_whitespace();

        match self.peek() {
            Some('\'') => self.parse_single_quoted().map(Value::String),
            Some('"') => self.parse_double_quoted(),
            Some(c) if c.is_ascii_digit() || c == '-' || c == '+' || c == '.' => self.parse_number(),
            Some(_) => {
                if self.eat_keyword("true") {
                    Ok(Value::Bool(true))
                } else if self.eat_keyword("false") {
                    Ok(Value::Bool(false))
                } else if self.eat_keyword("null") {
                    Ok(Value::Null)
                } else {
                    Err(self.error("expected literal"))
                }
            }
            None => Err(self.error("expected literal")),
        }
    }

    fn parse_number(&mut self) -> Result<Value, ParseError> {
        let start = self.pos;

        if matches!(self.peek(), Some('-' | '+')) {
            self.advance();
        }
        while let Some(c) = self.peek() {
            let exponent_sign = matches!(c, '-' | '+')
                && self.input[start..self.pos].ends_with(['e', 'E']);
            if c.is_ascii_digit() || c == '.' || c == 'e' || c == 'E' || exponent_sign {
                self.advance();
            } else {
                break;
            }
        }

        let text = self.input[start..self.pos].trim_start_matches('+');
        let error = || ParseError {
            message: format!("invalid number '{}'", &self.input[start..self.pos]),
            position: start,
        };

        if let Ok(n) = text.parse::<i64>() {
            return Ok(Value::from(n));
        }
        if let Ok(n) = text.parse::<u64>() {
            return Ok(Value::from(n));
        }
        let float = text.parse::<f64>().map_err(|_| error())?;
        Number::from_f64(float).map(Value::Number).ok_or_else(error)
    }

    fn parse_single_quoted(&mut self) -> Result<String, ParseError> {
        let start = self.pos;
        self.advance();

        let mut text = String::new();
        loop {
            match self.peek() {
                None => {
                    return Err(ParseError {
                        message: "unterminated string".to_string(),
                        position: start,
                    });
                }
                Some('\'') => {
                    self.advance();
                    return Ok(text);
                }
                Some('\\') => {
                    self.advance();
                    if let Some(c) = self.peek() {
                        text.push(c);
                        self.advance();
                    }
                }
                Some(c) => {
                    text.push(c);
                    self.advance();
                }
            }
        }
    }

    /// Double-quoted strings follow JSON escaping.
    fn parse_double_quoted(&mut self) -> Result<Value, ParseError> {
        let start = self.pos;
        self.advance();

        loop {
            match self.peek() {
                None => {
                    return Err(ParseError {
                        message: "unterminated string".to_string(),
                        position: start,
                    });
                }
                Some('"') => {
                    self.advance();
                    break;
                }
                Some('\\') => {
                    self.advance();
                    self.advance();
                }
                Some(_) => self.advance(),
            }
        }

        serde_json::from_str::<String>(&self.input[start..self.pos])
            .map(Value::String)
            .map_err(|e| ParseError {
                message: format!("invalid string: {e}"),
                position: start,
            })
    }

    fn parse_path(&mut self) -> Result<String, ParseError> {
        let start = self.pos;

        while let Some(c) = self.peek() {
            if c.is_alphanumeric() || c == '_' || c == '.' || c == '-' {
                self.advance();
            } else {
                break;
            }
        }

        let path = &self.input[start..self.pos];
        if path.is_empty() {
            return Err(self.error("expected field path"));
        }

        Ok(path.to_string())
    }

    fn expect(&mut self, c: char) -> Result<(), ParseError> {
        self.skip_whitespace();
        if self.peek() == Some(c) {
            self.advance();
            Ok(())
        } else {
            Err(self.error(&format!("expected '{c}'")))
        }
    }

    fn eat_str(&mut self, s: &str) -> bool {
        if self.check_str(s) {
            self.pos += s.len();
            true
        } else {
            false
        }
    }

    /// Case-insensitive keyword that is not a prefix of a longer identifier.
    fn eat_keyword(&mut self, keyword: &str) -> bool {
        let rest = self.remaining();
        let Some(head) = rest.get(..keyword.len()) else {
            return false;
        };
        if !head.eq_ignore_ascii_case(keyword) {
            return false;
        }
        let boundary = rest[keyword.len()..]
            .chars()
            .next()
            .is_none_or(|c| !(c.is_alphanumeric() || c == '_' || c == '.'));
        if boundary {
            self.pos += keyword.len();
        }
        boundary
    }

    fn error(&self, message: &str) -> ParseError {
        ParseError {
            message: message.to_string(),
            position: self.pos,
        }
    }

    fn skip_whitespace(&mut self) {
        while let Some(c) = self.peek() {
            if c.is_whitespace() {
                self.advance();
            } else {
                break;
            }
        }
    }

    fn peek(&self) -> Option<char> {
        self.remaining().chars().next()
    }

    fn check_str(&self, s: &str) -> bool {
        self.remaining().starts_with(s)
    }

    fn remaining(&self) -> &str {
        self.input.get(self.pos..).unwrap_or("")
    }

    fn advance(&mut self) {
        if let Some(c) = self.peek() {
            self.pos += c.len_utf8();
        }
    }

    fn is_eof(&self) -> bool {
        self.pos >= self.input.len()
    }
}
