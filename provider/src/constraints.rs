//! Constraint expressions: boolean predicates over an instance's labels.
//!
//! ```text
//! Label("team", "payments") && !LabelRegex("env", "^dev-")
//! ```
//!
//! `!` binds tightest, then `&&`, then `||`. Parentheses group.

use regex::Regex;
use std::collections::BTreeMap;
use std::iter::Peekable;
use std::str::{CharIndices, FromStr};

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum ConstraintError {
    #[error("syntax error at offset {offset}: {reason}")]
    Syntax { offset: usize, reason: String },

    #[error("unknown constraint function {0:?}")]
    UnknownFunction(String),

    #[error("{name} takes {expected} arguments, got {got}")]
    Arity {
        name: String,
        expected: usize,
        got: usize,
    },

    #[error("invalid regular expression {pattern:?}: {reason}")]
    Regex { pattern: String, reason: String },
}

#[derive(Clone, Debug)]
pub enum Constraint {
    /// The label exists with exactly this value.
    Label { key: String, value: String },
    /// The label exists and its value matches.
    LabelRegex { key: String, regex: Regex },
    Not(Box<Constraint>),
    And(Box<Constraint>, Box<Constraint>),
    Or(Box<Constraint>, Box<Constraint>),
}

impl Constraint {
    pub fn parse(expression: &str) -> Result<Self, ConstraintError> {
        let tokens = tokenize(expression)?;
        let mut parser = Parser {
            tokens,
            pos: 0,
            end: expression.len(),
        };
        let constraint = parser.or()?;
        if let Some((offset, token)) = parser.tokens.get(parser.pos) {
            return Err(syntax(*offset, format!("unexpected {token:?}")));
        }
        Ok(constraint)
    }

    pub fn matches(&self, labels: &BTreeMap<String, String>) -> bool {
        match self {
            Constraint::Label { key, value } => labels.get(key) == Some(value),
            Constraint::LabelRegex { key, regex } => {
                labels.get(key).is_some_and(|value| regex.is_match(value))
            }
            Constraint::Not(inner) => !inner.matches(labels),
            Constraint::And(lhs, rhs) => lhs.matches(labels) && rhs.matches(labels),
            Constraint::Or(lhs, rhs) => lhs.matches(labels) || rhs.matches(labels),
        }
    }
}

impl FromStr for Constraint {
    type Err = ConstraintError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Constraint::parse(s)
    }
}

#[derive(Clone, Debug, PartialEq)]
enum Token {
    Ident(String),
    Str(String),
    LParen,
    RParen,
    Comma,
    Not,
    And,
    Or,
}

fn syntax(offset: usize, reason: impl Into<String>) -> ConstraintError {
    ConstraintError::Syntax {
        offset,
        reason: reason.into(),
    }
}

fn tokenize(input: &str) -> Result<Vec<(usize, Token)>, ConstraintError> {
    let mut tokens = Vec::new();
    let mut chars = input.char_indices().peekable();

    while let Some((at, c)) = chars.next() {
        let token = match c {
            c if c.is_whitespace() => continue,
            '(' => Token::LParen,
            ')' => Token::RParen,
            ',' => Token::Comma,
            '!' => Token::Not,
            '&' | '|' => {
                if chars.next_if(|&(_, next)| next == c).is_none() {
                    return Err(syntax(at, format!("expected {c}{c}")));
                }
                if c == '&' { Token::And } else { Token::Or }
            }
            '"' | '`' => Token::Str(quoted(&mut chars, c, at)?),
            c if c.is_alphanumeric() || c == '_' => {
                let mut ident = c.to_string();
                while let Some((_, c)) = chars.next_if(|&(_, c)| c.is_alphanumeric() || c == '_') {
                    ident.push(c);
                }
                Token::Ident(ident)
            }
            c => return Err(syntax(at, format!("unexpected {c:?}"))),
        };
        tokens.push((at, token));
    }

    Ok(tokens)
}

fn quoted(
    chars: &mut Peekable<CharIndices<'_>>,
    quote: char,
    at: usize,
) -> Result<String, ConstraintError> {
    let mut s = String::new();
    while let Some((_, c)) = chars.next() {
        match c {
            c if c == quote => return Ok(s),
            '\\' if quote == '"' => match chars.next() {
                Some((_, escaped)) => s.push(escaped),
                None => break,
            },
            c => s.push(c),
        }
    }
    Err(syntax(at, "unterminated string"))
}

struct Parser {
    tokens: Vec<(usize, Token)>,
    pos: usize,
    end: usize,
}

impl Parser {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos).map(|(_, token)| token)
    }

    fn next(&mut self) -> Option<(usize, Token)> {
        let token = self.tokens.get(self.pos).cloned();
        self.pos += 1;
        token
    }

    fn expect(&mut self, expected: Token) -> Result<(), ConstraintError> {
        match self.next() {
            Some((_, token)) if token == expected => Ok(()),
            Some((offset, token)) => {
                Err(syntax(offset, format!("expected {expected:?}, got {token:?}")))
            }
            None => Err(syntax(self.end, format!("expected {expected:?}"))),
        }
    }

    fn or(&mut self) -> Result<Constraint, ConstraintError> {
        let mut lhs = self.and()?;
        while self.peek() == Some(&Token::Or) {
            self.pos += 1;
            lhs = Constraint::Or(Box::new(lhs), Box::new(self.and()?));
        }
        Ok(lhs)
    }

    fn and(&mut self) -> Result<Constraint, ConstraintError> {
        let mut lhs = self.unary()?;
        while self.peek() == Some(&Token::And) {
            self.pos += 1;
            lhs = Constraint::And(Box::new(lhs), Box::new(self.unary()?));
        }
        Ok(lhs)
    }

    fn unary(&mut self) -> Result<Constraint, ConstraintError> {
        if self.peek() == Some(&Token::Not) {
            self.pos += 1;
            return Ok(Constraint::Not(Box::new(self.unary()?)));
        }
        self.primary()
    }

    fn primary(&mut self) -> Result<Constraint, ConstraintError> {
        match self.next() {
            Some((_, Token::LParen)) => {
                let inner = self.or()?;
                self.expect(Token::RParen)?;
                Ok(inner)
            }
            Some((_, Token::Ident(name))) => {
                self.expect(Token::LParen)?;
                let args = self.arguments()?;
                call(name, args)
            }
            Some((offset, token)) => Err(syntax(offset, format!("unexpected {token:?}"))),
            None => Err(syntax(self.end, "unexpected end of expression")),
        }
    }

    /// String arguments up to and including the closing parenthesis.
    fn arguments(&mut self) -> Result<Vec<String>, ConstraintError> {
        let mut args = Vec::new();
        if self.peek() == Some(&Token::RParen) {
            self.pos += 1;
            return Ok(args);
        }

        loop {
            match self.next() {
                Some((_, Token::Str(arg))) => args.push(arg),
                Some((offset, token)) => {
                    return Err(syntax(offset, format!("expected a string, got {token:?}")));
                }
                None => return Err(syntax(self.end, "unexpected end of expression")),
            }
            match self.next() {
                Some((_, Token::Comma)) => continue,
                Some((_, Token::RParen)) => return Ok(args),
                Some((offset, token)) => {
                    return Err(syntax(offset, format!("expected , or ), got {token:?}")));
                }
                None => return Err(syntax(self.end, "unexpected end of expression")),
            }
        }
    }
}

fn call(name: String, args: Vec<String>) -> Result<Constraint, ConstraintError> {
    let arity = |expected: usize| ConstraintError::Arity {
        name: name.clone(),
        expected,
        got: args.len(),
    };

    match name.as_str() {
        "Label" => {
            let [key, value]: [String; 2] = args.clone().try_into().map_err(|_| arity(2))?;
            Ok(Constraint::Label { key, value })
        }
        "LabelRegex" => {
            let [key, pattern]: [String; 2] = args.clone().try_into().map_err(|_| arity(2))?;
            let regex = Regex::new(&pattern).map_err(|e| ConstraintError::Regex {
                pattern: pattern.clone(),
                reason: e.to_string(),
            })?;
            Ok(Constraint::LabelRegex { key, regex })
        }
        _ => Err(ConstraintError::UnknownFunction(name)),
    }
}
