//! Grammar of the focus/filter commands: a sequence of clauses, each an
//! axis name optionally followed by `=` and a value. A value is a literal,
//! `*` (wildcard), or absent (defaulting to the caller-supplied sentinel).
//! Block and thread values are `(x,y,z)` tuples with trailing components
//! defaulting to 0; a bare scalar means `(n,0,0)`.

use crate::coords::{CoordValue, Coords, Dim3};
use crate::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Axis {
    Device,
    Sm,
    Warp,
    Lane,
    Kernel,
    Grid,
    Block,
    Thread,
}

impl Axis {
    #[must_use]
    pub fn is_physical(&self) -> bool {
        matches!(self, Axis::Device | Axis::Sm | Axis::Warp | Axis::Lane)
    }

    fn from_word(word: &str) -> Option<Self> {
        match word {
            "device" | "dev" => Some(Axis::Device),
            "sm" => Some(Axis::Sm),
            "warp" => Some(Axis::Warp),
            "lane" => Some(Axis::Lane),
            "kernel" => Some(Axis::Kernel),
            "grid" => Some(Axis::Grid),
            "block" => Some(Axis::Block),
            "thread" => Some(Axis::Thread),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestValue {
    Scalar(u64),
    Dim(Dim3),
    Wildcard,
    Current,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Request {
    pub axis: Axis,
    pub value: RequestValue,
    /// Whether the user wrote the value out (as opposed to the mode
    /// default); a clause without an explicit value is a query for that
    /// axis.
    pub explicit: bool,
}

/// What the caller is parsing for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Filter,
    Switch,
    Query,
    /// Disambiguated by the input: all-implicit clauses make a query,
    /// anything else a switch.
    SwitchOrQuery,
}

/// Sentinel substituted for a clause without an explicit value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DefaultMeta {
    Wildcard,
    Current,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandKind {
    Filter,
    Switch,
    Query,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Parsed {
    pub kind: CommandKind,
    pub requests: Vec<Request>,
}

impl Parsed {
    /// Writes every request into the corresponding coordinate slot.
    pub fn apply_to(&self, coords: &mut Coords) {
        for request in &self.requests {
            let meta_u32 = |v: &RequestValue| match v {
                RequestValue::Scalar(s) => CoordValue::Concrete(*s as u32),
                RequestValue::Wildcard => CoordValue::Wildcard,
                RequestValue::Current => CoordValue::Current,
                RequestValue::Dim(_) => CoordValue::Wildcard,
            };
            let meta_u64 = |v: &RequestValue| match v {
                RequestValue::Scalar(s) => CoordValue::Concrete(*s),
                RequestValue::Wildcard => CoordValue::Wildcard,
                RequestValue::Current => CoordValue::Current,
                RequestValue::Dim(_) => CoordValue::Wildcard,
            };
            let meta_dim = |v: &RequestValue| match v {
                RequestValue::Dim(d) => CoordValue::Concrete(*d),
                RequestValue::Scalar(s) => CoordValue::Concrete(Dim3::new(*s as u32, 0, 0)),
                RequestValue::Wildcard => CoordValue::Wildcard,
                RequestValue::Current => CoordValue::Current,
            };
            match request.axis {
                Axis::Device => coords.dev = meta_u32(&request.value),
                Axis::Sm => coords.sm = meta_u32(&request.value),
                Axis::Warp => coords.wp = meta_u32(&request.value),
                Axis::Lane => coords.ln = meta_u32(&request.value),
                Axis::Kernel => coords.kernel_id = meta_u64(&request.value),
                Axis::Grid => coords.grid_id = meta_u64(&request.value),
                Axis::Block => coords.block_idx = meta_dim(&request.value),
                Axis::Thread => coords.thread_idx = meta_dim(&request.value),
            }
        }
        coords.update_valid();
    }

    /// Does the solution honor every explicitly requested component?
    #[must_use]
    pub fn satisfied_by(&self, solution: &Coords) -> bool {
        let explicit = Parsed {
            kind: self.kind,
            requests: self.requests.iter().copied().filter(|r| r.explicit).collect(),
        };
        let mut wanted = Coords::wildcard();
        explicit.apply_to(&mut wanted);
        wanted.matches(solution)
    }

    #[must_use]
    pub fn names_physical_axis(&self) -> bool {
        self.requests.iter().any(|r| r.axis.is_physical())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Token {
    Word(String),
    Number(u64),
    Star,
    Open,
    Close,
    Comma,
    Equals,
}

fn tokenize(input: &str) -> Result<Vec<Token>> {
    let mut tokens = Vec::new();
    let mut chars = input.chars().peekable();
    while let Some(&ch) = chars.peek() {
        match ch {
            c if c.is_whitespace() => {
                chars.next();
            }
            '*' => {
                chars.next();
                tokens.push(Token::Star);
            }
            '(' => {
                chars.next();
                tokens.push(Token::Open);
            }
            ')' => {
                chars.next();
                tokens.push(Token::Close);
            }
            ',' => {
                chars.next();
                tokens.push(Token::Comma);
            }
            '=' => {
                chars.next();
                tokens.push(Token::Equals);
            }
            c if c.is_ascii_digit() => {
                let mut text = String::new();
                while let Some(&c) = chars.peek() {
                    if c.is_ascii_alphanumeric() {
                        text.push(c);
                        chars.next();
                    } else {
                        break;
                    }
                }
                let value = if let Some(hex) = text.strip_prefix("0x").or_else(|| text.strip_prefix("0X")) {
                    u64::from_str_radix(hex, 16)
                } else {
                    text.parse::<u64>()
                }
                .map_err(|_| Error::Parse(format!("malformed number: '{text}'")))?;
                tokens.push(Token::Number(value));
            }
            c if c.is_ascii_alphabetic() => {
                let mut text = String::new();
                while let Some(&c) = chars.peek() {
                    if c.is_ascii_alphabetic() {
                        text.push(c);
                        chars.next();
                    } else {
                        break;
                    }
                }
                tokens.push(Token::Word(text.to_ascii_lowercase()));
            }
            c => return Err(Error::Parse(format!("unexpected character: '{c}'"))),
        }
    }
    Ok(tokens)
}

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
}

impl Parser {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn bump(&mut self) -> Option<Token> {
        let t = self.tokens.get(self.pos).cloned();
        if t.is_some() {
            self.pos += 1;
        }
        t
    }

    fn eat(&mut self, token: &Token) -> bool {
        if self.peek() == Some(token) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn tuple(&mut self) -> Result<Dim3> {
        let mut parts = [0u32; 3];
        let mut n = 0;
        loop {
            match self.bump() {
                Some(Token::Number(v)) if n < 3 => {
                    parts[n] = u32::try_from(v)
                        .map_err(|_| Error::Parse(format!("index out of range: {v}")))?;
                    n += 1;
                }
                Some(Token::Number(_)) => {
                    return Err(Error::Parse("too many tuple components".into()))
                }
                t => {
                    return Err(Error::Parse(format!(
                        "malformed (x,y,z) tuple near {t:?}"
                    )))
                }
            }
            match self.bump() {
                Some(Token::Comma) => continue,
                Some(Token::Close) => break,
                t => {
                    return Err(Error::Parse(format!(
                        "malformed (x,y,z) tuple near {t:?}"
                    )))
                }
            }
        }
        Ok(Dim3::new(parts[0], parts[1], parts[2]))
    }

    fn value(&mut self, axis: Axis) -> Result<Option<RequestValue>> {
        let _ = self.eat(&Token::Equals);
        match self.peek() {
            Some(Token::Star) => {
                self.pos += 1;
                Ok(Some(RequestValue::Wildcard))
            }
            Some(Token::Word(w)) if w.as_str() == "current" => {
                self.pos += 1;
                Ok(Some(RequestValue::Current))
            }
            Some(Token::Number(v)) => {
                let v = *v;
                self.pos += 1;
                if axis.is_physical() && u32::try_from(v).is_err() {
                    return Err(Error::Parse(format!("index out of range: {v}")));
                }
                Ok(Some(RequestValue::Scalar(v)))
            }
            Some(Token::Open) => {
                if !matches!(axis, Axis::Block | Axis::Thread) {
                    return Err(Error::Parse("(x,y,z) value not allowed for this axis".into()));
                }
                self.pos += 1;
                Ok(Some(RequestValue::Dim(self.tuple()?)))
            }
            _ => Ok(None),
        }
    }
}

/// Parses a filter, switch, or query expression. A clause without an
/// explicit value receives `default`.
pub fn parse(input: &str, mode: Mode, default: DefaultMeta) -> Result<Parsed> {
    let mut parser = Parser {
        tokens: tokenize(input)?,
        pos: 0,
    };

    let mut requests = Vec::new();
    let mut any_explicit = false;
    while let Some(token) = parser.bump() {
        let Token::Word(word) = &token else {
            return Err(Error::Parse(format!("expected an axis name, got {token:?}")));
        };
        let axis = Axis::from_word(word)
            .ok_or_else(|| Error::Parse(format!("unknown axis name: '{word}'")))?;
        let (value, explicit) = match parser.value(axis)? {
            Some(v) => (v, true),
            None => (
                match default {
                    DefaultMeta::Wildcard => RequestValue::Wildcard,
                    DefaultMeta::Current => RequestValue::Current,
                },
                false,
            ),
        };
        any_explicit |= explicit;
        requests.push(Request {
            axis,
            value,
            explicit,
        });
        let _ = parser.eat(&Token::Comma);
    }

    let kind = match mode {
        Mode::Filter => CommandKind::Filter,
        Mode::Switch => CommandKind::Switch,
        Mode::Query => CommandKind::Query,
        Mode::SwitchOrQuery => {
            if any_explicit {
                CommandKind::Switch
            } else {
                CommandKind::Query
            }
        }
    };
    Ok(Parsed { kind, requests })
}
