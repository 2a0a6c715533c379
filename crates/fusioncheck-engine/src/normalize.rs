//! Unit normalization
//!
//! Models often declare their config inline (`{{ config(materialized='table') }}`
//! in SQL, `dbt.config(materialized="table")` in Python) instead of in YAML.
//! Before rules run, literal keyword arguments of those calls are merged into
//! the unit's declared config. Declared keys always win; arguments that are not
//! plain literals (`var('x')`, string concatenation, ...) are ignored.

use crate::rule::{cached_regex, RuleError};
use fusioncheck_dbt::{ProjectUnit, UnitKind};
use regex::Regex;
use serde_json::Value;
use std::borrow::Cow;
use std::collections::BTreeMap;
use std::sync::OnceLock;

static CONFIG_CALL: OnceLock<Result<Regex, regex::Error>> = OnceLock::new();

/// Merge inline config into a model; other units are returned unchanged
pub fn normalize(unit: &ProjectUnit) -> Result<Cow<'_, ProjectUnit>, RuleError> {
    if unit.kind != UnitKind::Model {
        return Ok(Cow::Borrowed(unit));
    }

    let missing: Vec<(String, Value)> = inline_config(&unit.source)?
        .into_iter()
        .filter(|(key, _)| !unit.config.contains_key(key))
        .collect();

    if missing.is_empty() {
        return Ok(Cow::Borrowed(unit));
    }

    let mut owned = unit.clone();
    owned.config.extend(missing);
    Ok(Cow::Owned(owned))
}

/// Literal keyword arguments of every `config(...)` call in `source`
///
/// Later calls override earlier ones.
pub fn inline_config(source: &str) -> Result<BTreeMap<String, Value>, RuleError> {
    let re = cached_regex(&CONFIG_CALL, r"(?:\{\{-?\s*|\bdbt\s*\.\s*)config\s*\(")?;

    let mut config = BTreeMap::new();
    for m in re.find_iter(source) {
        let mut args = Args {
            src: source,
            pos: m.end(),
        };
        config.extend(args.kwargs());
    }
    Ok(config)
}

/// Cursor over the argument list of a call
struct Args<'s> {
    src: &'s str,
    pos: usize,
}

impl<'s> Args<'s> {
    fn peek(&self) -> Option<u8> {
        self.src.as_bytes().get(self.pos).copied()
    }

    fn skip_ws(&mut self) {
        while self.peek().is_some_and(|b| b.is_ascii_whitespace()) {
            self.pos += 1;
        }
    }

    fn eat(&mut self, expected: u8) -> bool {
        if self.peek() == Some(expected) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn at_arg_end(&self) -> bool {
        matches!(self.peek(), Some(b',') | Some(b')'))
    }

    fn kwargs(&mut self) -> BTreeMap<String, Value> {
        let mut out = BTreeMap::new();

        loop {
            self.skip_ws();
            if self.peek().is_none() || self.eat(b')') {
                break;
            }

            // Positional arguments end the scan
            let Some(key) = self.ident() else { break };
            self.skip_ws();
            if !self.eat(b'=') {
                break;
            }

            self.skip_ws();
            let start = self.pos;
            let value = self.value();
            self.skip_ws();

            match value {
                Some(value) if self.at_arg_end() => {
                    out.insert(key.to_string(), value);
                }
                _ => {
                    self.pos = start;
                    self.skip_expr();
                }
            }

            if !self.eat(b',') {
                break;
            }
        }

        out
    }

    fn ident(&mut self) -> Option<&'s str> {
        let start = self.pos;
        while self
            .peek()
            .is_some_and(|b| b.is_ascii_alphanumeric() || b == b'_')
        {
            self.pos += 1;
        }
        (self.pos > start).then(|| &self.src[start..self.pos])
    }

    fn string(&mut self) -> Option<String> {
        let quote = self.peek()?;
        if quote != b'\'' && quote != b'"' {
            return None;
        }
        self.pos += 1;
        let start = self.pos;

        loop {
            match self.peek()? {
                b'\\' => self.pos += 2,
                b if b == quote => {
                    let raw = self.src.get(start..self.pos)?;
                    self.pos += 1;
                    return Some(unescape(raw));
                }
                _ => self.pos += 1,
            }
        }
    }

    fn number(&mut self) -> Option<Value> {
        let start = self.pos;
        while self
            .peek()
            .is_some_and(|b| b.is_ascii_digit() || matches!(b, b'.' | b'-' | b'+' | b'e' | b'E'))
        {
            self.pos += 1;
        }
        let text = &self.src[start..self.pos];

        if let Ok(int) = text.parse::<i64>() {
            return Some(Value::from(int));
        }
        text.parse::<f64>()
            .ok()
            .and_then(serde_json::Number::from_f64)
            .map(Value::Number)
    }

    fn sequence(&mut self, close: u8) -> Option<Value> {
        self.pos += 1;
        let mut items = Vec::new();
        loop {
            self.skip_ws();
            if self.eat(close) {
                break;
            }
            items.push(self.value()?);
            self.skip_ws();
            if self.eat(b',') {
                continue;
            }
            if self.eat(close) {
                break;
            }
            return None;
        }
        Some(Value::Array(items))
    }

    fn mapping(&mut self) -> Option<Value> {
        self.pos += 1;
        let mut map = serde_json::Map::new();
        loop {
            self.skip_ws();
            if self.eat(b'}') {
                break;
            }
            let key = self.string()?;
            self.skip_ws();
            if !self.eat(b':') {
                return None;
            }
            let value = self.value()?;
            map.insert(key, value);
            self.skip_ws();
            if self.eat(b',') {
                continue;
            }
            if self.eat(b'}') {
                break;
            }
            return None;
        }
        Some(Value::Object(map))
    }

    fn value(&mut self) -> Option<Value> {
        self.skip_ws();
        match self.peek()? {
            b'\'' | b'"' => self.string().map(Value::String),
            b'[' => self.sequence(b']'),
            b'(' => self.sequence(b')'),
            b'{' => self.mapping(),
            b if b == b'-' || b.is_ascii_digit() => self.number(),
            _ => match self.ident()? {
                "true" | "True" => Some(Value::Bool(true)),
                "false" | "False" => Some(Value::Bool(false)),
                "none" | "None" | "null" => Some(Value::Null),
                _ => None,
            },
        }
    }

    /// Skip to the next top-level `,` or `)`
    fn skip_expr(&mut self) {
        let mut depth = 0usize;
        while let Some(b) = self.peek() {
            match b {
                b'\'' | b'"' => {
                    if self.string().is_none() {
                        self.pos = self.src.len();
                    }
                    continue;
                }
                b'(' | b'[' | b'{' => depth += 1,
                b')' | b']' | b'}' if depth > 0 => depth -= 1,
                b',' | b')' if depth == 0 => return,
                _ => {}
            }
            self.pos += 1;
        }
    }
}

fn unescape(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    let mut chars = raw.chars();
    while let Some(c) = chars.next() {
        if c == '\\' {
            match chars.next() {
                Some('n') => out.push('\n'),
                Some('t') => out.push('\t'),
                Some(other) => out.push(other),
                None => out.push('\\'),
            }
        } else {
            out.push(c);
        }
    }
    out
}
