//! Rule templates.
//!
//! A rule is plain text with `{{ ... }}` actions evaluated against the
//! instance's `Name` and `Labels`:
//!
//! ```text
//! Host(`{{ normalize .Name }}.example.com`)
//! Host(`{{ index .Labels "app.domain" | lower }}`)
//! ```
//!
//! An action is a pipeline of commands separated by `|`. Each command is an
//! operand (`.`, `.Name`, `.Labels`, `.Labels.key` or a quoted string) or a
//! function call; the result of the previous command is passed as the last
//! argument of the next one. `{{-` and `-}}` trim the surrounding whitespace.

use crate::instance::normalize;
use std::borrow::Cow;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum TemplateError {
    #[error("syntax error at offset {offset}: {reason}")]
    Syntax { offset: usize, reason: String },

    #[error("function {0:?} not defined")]
    UnknownFunction(String),

    #[error("can't evaluate field {0}")]
    UndefinedField(String),

    #[error("error calling {name}: {reason}")]
    Call { name: String, reason: String },

    #[error("{0} cannot be printed in a rule")]
    NotPrintable(&'static str),
}

/// A named string function callable from templates.
pub type TemplateFn = Arc<dyn Fn(&[String]) -> Result<String, String> + Send + Sync>;

const BUILTINS: &[&str] = &["index", "lower", "normalize", "replace", "trimPrefix", "upper"];

/// Functions available to templates in addition to the built-ins.
#[derive(Clone, Default)]
pub struct TemplateFunctions {
    custom: BTreeMap<String, TemplateFn>,
}

impl TemplateFunctions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `f` under `name`. Built-in names cannot be overridden.
    pub fn with<F>(mut self, name: impl Into<String>, f: F) -> Self
    where
        F: Fn(&[String]) -> Result<String, String> + Send + Sync + 'static,
    {
        self.custom.insert(name.into(), Arc::new(f));
        self
    }

    fn contains(&self, name: &str) -> bool {
        BUILTINS.contains(&name) || self.custom.contains_key(name)
    }
}

impl fmt::Debug for TemplateFunctions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.custom.keys()).finish()
    }
}

/// Data a rule is rendered with.
#[derive(Clone, Copy, Debug)]
pub struct RuleContext<'a> {
    pub name: &'a str,
    pub labels: &'a BTreeMap<String, String>,
}

#[derive(Clone, Debug)]
pub struct RuleTemplate {
    source: String,
    segments: Vec<Segment>,
    functions: TemplateFunctions,
}

#[derive(Clone, Debug)]
enum Segment {
    Text(String),
    Action(Vec<Command>),
}

#[derive(Clone, Debug)]
enum Command {
    Operand(Operand),
    Call { name: String, args: Vec<Operand> },
}

#[derive(Clone, Debug)]
enum Operand {
    /// `.` is the empty path.
    Field(Vec<String>),
    Literal(String),
}

#[derive(Debug)]
enum Token {
    Field(Vec<String>),
    Literal(String),
    Ident(String),
    Pipe,
}

enum Value<'a> {
    Str(Cow<'a, str>),
    Labels(&'a BTreeMap<String, String>),
    Context,
}

impl Value<'_> {
    fn into_string(self) -> Option<String> {
        match self {
            Value::Str(s) => Some(s.into_owned()),
            _ => None,
        }
    }
}

impl RuleTemplate {
    pub fn compile(source: &str, functions: &TemplateFunctions) -> Result<Self, TemplateError> {
        Ok(RuleTemplate {
            source: source.to_string(),
            segments: parse(source, functions)?,
            functions: functions.clone(),
        })
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn render(&self, ctx: &RuleContext<'_>) -> Result<String, TemplateError> {
        let mut out = String::with_capacity(self.source.len());

        for segment in &self.segments {
            match segment {
                Segment::Text(text) => out.push_str(text),
                Segment::Action(pipeline) => {
                    let mut value = None;
                    for command in pipeline {
                        value = Some(self.eval_command(command, ctx, value)?);
                    }
                    match value {
                        Some(Value::Str(s)) => out.push_str(&s),
                        Some(Value::Labels(labels)) => write_map(&mut out, labels),
                        Some(Value::Context) | None => {
                            return Err(TemplateError::NotPrintable("the rule context"));
                        }
                    }
                }
            }
        }

        Ok(out)
    }

    fn eval_command<'a>(
        &self,
        command: &Command,
        ctx: &RuleContext<'a>,
        piped: Option<Value<'a>>,
    ) -> Result<Value<'a>, TemplateError> {
        match command {
            Command::Operand(operand) => {
                if piped.is_some() {
                    return Err(TemplateError::Syntax {
                        offset: 0,
                        reason: "can't give argument to non-function".into(),
                    });
                }
                eval_operand(operand, ctx)
            }
            Command::Call { name, args } => {
                let mut values = args
                    .iter()
                    .map(|arg| eval_operand(arg, ctx))
                    .collect::<Result<Vec<_>, _>>()?;
                values.extend(piped);
                self.call(name, values)
            }
        }
    }

    fn call<'a>(&self, name: &str, args: Vec<Value<'a>>) -> Result<Value<'a>, TemplateError> {
        let call_error = |reason: String| TemplateError::Call {
            name: name.to_string(),
            reason,
        };

        if name == "index" {
            return match args.as_slice() {
                [Value::Labels(labels), Value::Str(key)] => {
                    let labels: &'a BTreeMap<String, String> = *labels;
                    Ok(Value::Str(Cow::Borrowed(
                        labels.get::<str>(key).map_or("", String::as_str),
                    )))
                }
                _ => Err(call_error("expected a map and a key".into())),
            };
        }

        let args = args
            .into_iter()
            .map(Value::into_string)
            .collect::<Option<Vec<_>>>()
            .ok_or_else(|| call_error("arguments must be strings".into()))?;

        let result = match name {
            "normalize" => normalize(&arity::<1>(name, &args)?[0]),
            "lower" => arity::<1>(name, &args)?[0].to_lowercase(),
            "upper" => arity::<1>(name, &args)?[0].to_uppercase(),
            "trimPrefix" => {
                let [prefix, s] = arity::<2>(name, &args)?;
                s.strip_prefix(prefix.as_str()).unwrap_or(s).to_string()
            }
            "replace" => {
                let [old, new, s] = arity::<3>(name, &args)?;
                s.replace(old.as_str(), new)
            }
            _ => match self.functions.custom.get(name) {
                Some(f) => f(&args).map_err(call_error)?,
                None => return Err(TemplateError::UnknownFunction(name.to_string())),
            },
        };

        Ok(Value::Str(Cow::Owned(result)))
    }
}

fn arity<'s, const N: usize>(
    name: &str,
    args: &'s [String],
) -> Result<&'s [String; N], TemplateError> {
    args.try_into().map_err(|_| TemplateError::Call {
        name: name.to_string(),
        reason: format!("wrong number of args: want {N}, got {}", args.len()),
    })
}

fn eval_operand<'a>(operand: &Operand, ctx: &RuleContext<'a>) -> Result<Value<'a>, TemplateError> {
    let path = match operand {
        Operand::Literal(s) => return Ok(Value::Str(Cow::Owned(s.clone()))),
        Operand::Field(path) => path.as_slice(),
    };

    match path {
        [] => Ok(Value::Context),
        [field] if field == "Name" => Ok(Value::Str(Cow::Borrowed(ctx.name))),
        [field] if field == "Labels" => Ok(Value::Labels(ctx.labels)),
        [field, key] if field == "Labels" => Ok(Value::Str(Cow::Borrowed(
            ctx.labels.get(key).map_or("", String::as_str),
        ))),
        [field, _, nested, ..] if field == "Labels" => {
            Err(TemplateError::UndefinedField(format!("{nested} in type string")))
        }
        [field, nested, ..] if field == "Name" => {
            Err(TemplateError::UndefinedField(format!("{nested} in type string")))
        }
        [field, ..] => Err(TemplateError::UndefinedField(field.clone())),
    }
}

fn write_map(out: &mut String, map: &BTreeMap<String, String>) {
    let entries: Vec<String> = map.iter().map(|(k, v)| format!("{k}:{v}")).collect();
    out.push_str("map[");
    out.push_str(&entries.join(" "));
    out.push(']');
}

fn syntax(offset: usize, reason: &str) -> TemplateError {
    TemplateError::Syntax {
        offset,
        reason: reason.to_string(),
    }
}

fn parse(source: &str, functions: &TemplateFunctions) -> Result<Vec<Segment>, TemplateError> {
    let mut segments = Vec::new();
    let mut rest = source;
    let mut offset = 0;
    let mut trim_next = false;

    while let Some(open) = rest.find("{{") {
        let mut text = &rest[..open];
        if trim_next {
            text = text.trim_start();
        }

        let body = &rest[open + 2..];
        let close = body
            .find("}}")
            .ok_or_else(|| syntax(offset + open, "unclosed action"))?;
        let mut inner = &body[..close];

        if let Some(stripped) = inner.strip_prefix('-')
            && stripped.starts_with(char::is_whitespace)
        {
            text = text.trim_end();
            inner = stripped;
        }
        trim_next = false;
        if let Some(stripped) = inner.strip_suffix('-')
            && stripped.ends_with(char::is_whitespace)
        {
            trim_next = true;
            inner = stripped;
        }

        if !text.is_empty() {
            segments.push(Segment::Text(text.to_string()));
        }

        let inner = inner.trim();
        let is_comment = inner.starts_with("/*") && inner.ends_with("*/");
        if !is_comment {
            let tokens = tokenize(inner, offset + open + 2)?;
            segments.push(Segment::Action(parse_pipeline(
                tokens,
                offset + open + 2,
                functions,
            )?));
        }

        let consumed = open + 2 + close + 2;
        offset += consumed;
        rest = &rest[consumed..];
    }

    let text = if trim_next { rest.trim_start() } else { rest };
    if !text.is_empty() {
        segments.push(Segment::Text(text.to_string()));
    }

    Ok(segments)
}

fn tokenize(input: &str, offset: usize) -> Result<Vec<Token>, TemplateError> {
    let mut tokens = Vec::new();
    let mut chars = input.char_indices().peekable();

    while let Some(&(at, c)) = chars.peek() {
        match c {
            c if c.is_whitespace() => {
                chars.next();
            }
            '|' => {
                chars.next();
                tokens.push(Token::Pipe);
            }
            '"' => {
                chars.next();
                let mut literal = String::new();
                let mut closed = false;
                while let Some((_, c)) = chars.next() {
                    match c {
                        '"' => {
                            closed = true;
                            break;
                        }
                        '\\' => match chars.next() {
                            Some((_, 'n')) => literal.push('\n'),
                            Some((_, 't')) => literal.push('\t'),
                            Some((_, escaped)) => literal.push(escaped),
                            None => break,
                        },
                        c => literal.push(c),
                    }
                }
                if !closed {
                    return Err(syntax(offset + at, "unterminated quoted string"));
                }
                tokens.push(Token::Literal(literal));
            }
            '`' => {
                chars.next();
                let mut literal = String::new();
                let mut closed = false;
                for (_, c) in chars.by_ref() {
                    if c == '`' {
                        closed = true;
                        break;
                    }
                    literal.push(c);
                }
                if !closed {
                    return Err(syntax(offset + at, "unterminated raw string"));
                }
                tokens.push(Token::Literal(literal));
            }
            '.' => {
                chars.next();
                let mut path = Vec::new();
                let mut current = String::new();
                while let Some(&(dot, c)) = chars.peek() {
                    if c.is_alphanumeric() || c == '_' {
                        current.push(c);
                        chars.next();
                    } else if c == '.' {
                        if current.is_empty() {
                            return Err(syntax(offset + dot, "unexpected . in field"));
                        }
                        path.push(std::mem::take(&mut current));
                        chars.next();
                    } else {
                        break;
                    }
                }
                if current.is_empty() && !path.is_empty() {
                    return Err(syntax(offset + at, "field name expected after ."));
                }
                if !current.is_empty() {
                    path.push(current);
                }
                tokens.push(Token::Field(path));
            }
            c if c.is_alphabetic() || c == '_' => {
                let mut ident = String::new();
                while let Some(&(_, c)) = chars.peek() {
                    if c.is_alphanumeric() || c == '_' {
                        ident.push(c);
                        chars.next();
                    } else {
                        break;
                    }
                }
                tokens.push(Token::Ident(ident));
            }
            c => {
                return Err(syntax(offset + at, &format!("unexpected {c:?} in action")));
            }
        }
    }

    Ok(tokens)
}

fn parse_pipeline(
    tokens: Vec<Token>,
    offset: usize,
    functions: &TemplateFunctions,
) -> Result<Vec<Command>, TemplateError> {
    let mut pipeline = Vec::new();
    let mut current: Vec<Token> = Vec::new();

    for token in tokens.into_iter().chain(std::iter::once(Token::Pipe)) {
        if !matches!(token, Token::Pipe) {
            current.push(token);
            continue;
        }

        let mut words = std::mem::take(&mut current).into_iter();
        let command = match words.next() {
            None => return Err(syntax(offset, "missing command")),
            Some(Token::Ident(name)) => {
                if !functions.contains(&name) {
                    return Err(TemplateError::UnknownFunction(name));
                }
                let args = words
                    .map(|word| operand(word, offset))
                    .collect::<Result<Vec<_>, _>>()?;
                Command::Call { name, args }
            }
            Some(first) => {
                if !pipeline.is_empty() || words.next().is_some() {
                    return Err(syntax(offset, "can't give argument to non-function"));
                }
                Command::Operand(operand(first, offset)?)
            }
        };
        pipeline.push(command);
    }

    Ok(pipeline)
}

fn operand(token: Token, offset: usize) -> Result<Operand, TemplateError> {
    match token {
        Token::Field(path) => Ok(Operand::Field(path)),
        Token::Literal(s) => Ok(Operand::Literal(s)),
        Token::Ident(name) => Err(syntax(
            offset,
            &format!("function {name:?} can only start a command"),
        )),
        Token::Pipe => Err(syntax(offset, "missing command")),
    }
}
