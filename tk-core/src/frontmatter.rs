// tk-core/src/frontmatter.rs
// YAML frontmatter subset: scalars, string lists, and flat objects between
// two `---` delimiters at the top of a ticket file

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::error::{Result, TkError};

/// Upper bound on lines scanned for the closing delimiter. Caps worst-case
/// reads on files that merely start with `---`.
pub const SCAN_LIMIT: usize = 100;

const DELIMITER: &str = "---";

/// A single scalar frontmatter value.
///
/// Untagged so the same value serializes naturally inside the JSONL WAL:
/// booleans and integers stay typed, everything else is a string.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Scalar {
    Bool(bool),
    Int(i64),
    Str(String),
}

/// A frontmatter value: scalar, list of strings, or flat object of scalars.
/// Deeper nesting is rejected by both the parser and the serde layer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Value {
    Scalar(Scalar),
    List(Vec<String>),
    Object(BTreeMap<String, Scalar>),
}

pub type Frontmatter = BTreeMap<String, Value>;

impl Value {
    pub fn str(s: impl Into<String>) -> Value {
        Value::Scalar(Scalar::Str(s.into()))
    }

    pub fn int(i: i64) -> Value {
        Value::Scalar(Scalar::Int(i))
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Value::Scalar(Scalar::Bool(_)) => "boolean",
            Value::Scalar(Scalar::Int(_)) => "integer",
            Value::Scalar(Scalar::Str(_)) => "string",
            Value::List(_) => "list",
            Value::Object(_) => "object",
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Scalar(Scalar::Str(s)) => Some(s),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            Value::Scalar(Scalar::Int(i)) => Some(*i),
            _ => None,
        }
    }

    pub fn as_list(&self) -> Option<&[String]> {
        match self {
            Value::List(items) => Some(items),
            _ => None,
        }
    }
}

fn err(line: usize, reason: impl Into<String>) -> TkError {
    TkError::Frontmatter {
        line,
        reason: reason.into(),
    }
}

/// Split a ticket file into its frontmatter region and raw body.
///
/// The body slice starts immediately after the closing delimiter line; the
/// caller owns blank-line / trailing-newline normalization.
pub fn split(input: &str) -> Result<(&str, &str)> {
    let Some(rest) = strip_first_line(input, DELIMITER) else {
        return Err(err(1, "missing opening `---` delimiter"));
    };

    let mut offset = 0usize;
    for (lineno, line) in rest.split_inclusive('\n').enumerate() {
        // lineno 0 here is file line 2
        if lineno + 2 > SCAN_LIMIT {
            break;
        }
        let trimmed = line.strip_suffix('\n').unwrap_or(line);
        if trimmed == DELIMITER {
            let region = &rest[..offset];
            let body = &rest[offset + line.len()..];
            return Ok((region, body));
        }
        offset += line.len();
    }
    Err(err(
        SCAN_LIMIT,
        format!("frontmatter not terminated within {} lines", SCAN_LIMIT),
    ))
}

fn strip_first_line<'a>(input: &'a str, expected: &str) -> Option<&'a str> {
    let mut lines = input.split_inclusive('\n');
    let first = lines.next()?;
    let trimmed = first.strip_suffix('\n').unwrap_or(first);
    if trimmed == expected {
        Some(&input[first.len()..])
    } else {
        None
    }
}

/// Parse the full file: frontmatter map plus the raw body slice.
pub fn parse(input: &str) -> Result<(Frontmatter, &str)> {
    let (region, body) = split(input)?;
    let fm = parse_region(region, 2)?;
    Ok((fm, body))
}

/// Pending multi-line block under a bare `key:` line. The first
/// continuation line decides the shape.
enum Block {
    Undecided,
    List(Vec<String>),
    Object(BTreeMap<String, Scalar>),
}

/// Parse the region between the delimiters. `line_offset` is the 1-based
/// file line number of the region's first line, for error reporting.
pub fn parse_region(region: &str, line_offset: usize) -> Result<Frontmatter> {
    let mut fm = Frontmatter::new();
    let mut pending: Option<(String, Block, usize)> = None;

    for (i, raw) in region.lines().enumerate() {
        let lineno = line_offset + i;

        if let Some(item) = raw.strip_prefix("  ") {
            let (key, block, _) = pending
                .as_mut()
                .ok_or_else(|| err(lineno, "continuation line outside a block"))?;
            if let Some(entry) = item.strip_prefix("- ") {
                match block {
                    Block::Undecided => *block = Block::List(vec![parse_list_item(entry, lineno)?]),
                    Block::List(items) => items.push(parse_list_item(entry, lineno)?),
                    Block::Object(_) => {
                        return Err(err(
                            lineno,
                            format!("list item inside object block `{}`", key),
                        ))
                    }
                }
            } else if let Some((sub, value)) = split_key_value(item) {
                let scalar = match parse_scalar(value, lineno)? {
                    Some(s) => s,
                    None => return Err(err(lineno, "nested blocks are not supported")),
                };
                match block {
                    Block::Undecided => {
                        let mut map = BTreeMap::new();
                        map.insert(sub.to_string(), scalar);
                        *block = Block::Object(map);
                    }
                    Block::Object(map) => {
                        if map.insert(sub.to_string(), scalar).is_some() {
                            return Err(err(lineno, format!("duplicate object key `{}`", sub)));
                        }
                    }
                    Block::List(_) => {
                        return Err(err(
                            lineno,
                            format!("object entry inside list block `{}`", key),
                        ))
                    }
                }
            } else {
                return Err(err(lineno, "malformed continuation line"));
            }
            continue;
        }

        // A non-indented line closes any open block
        if let Some((key, block, opened_at)) = pending.take() {
            finish_block(&mut fm, key, block, opened_at)?;
        }

        if raw.trim().is_empty() {
            return Err(err(lineno, "blank line inside frontmatter"));
        }

        let Some((key, value)) = split_key_value(raw) else {
            return Err(err(lineno, "expected `key: value` or `key:`"));
        };
        if key.is_empty() || key.starts_with(char::is_whitespace) {
            return Err(err(lineno, "empty or indented key"));
        }
        if fm.contains_key(key) {
            return Err(err(lineno, format!("duplicate key `{}`", key)));
        }

        if value == "[]" {
            fm.insert(key.to_string(), Value::List(Vec::new()));
        } else {
            match parse_scalar(value, lineno)? {
                Some(scalar) => {
                    fm.insert(key.to_string(), Value::Scalar(scalar));
                }
                // Bare `key:` opens a block
                None => pending = Some((key.to_string(), Block::Undecided, lineno)),
            }
        }
    }

    if let Some((key, block, opened_at)) = pending.take() {
        finish_block(&mut fm, key, block, opened_at)?;
    }

    Ok(fm)
}

fn finish_block(fm: &mut Frontmatter, key: String, block: Block, opened_at: usize) -> Result<()> {
    let value = match block {
        Block::Undecided => {
            return Err(err(opened_at, format!("key `{}` has no value", key)))
        }
        Block::List(items) => Value::List(items),
        Block::Object(map) => Value::Object(map),
    };
    fm.insert(key, value);
    Ok(())
}

/// Split on the first `:`; returns (key, value-after-optional-space).
/// A bare `key:` yields an empty value.
fn split_key_value(line: &str) -> Option<(&str, &str)> {
    let idx = line.find(':')?;
    let key = &line[..idx];
    let rest = &line[idx + 1..];
    if rest.is_empty() {
        Some((key, ""))
    } else {
        rest.strip_prefix(' ').map(|value| (key, value))
    }
}

/// Parse a scalar value. Empty input means "block follows" and returns None.
fn parse_scalar(value: &str, lineno: usize) -> Result<Option<Scalar>> {
    if value.is_empty() {
        return Ok(None);
    }
    if let Some(stripped) = value.strip_prefix('"') {
        return Ok(Some(Scalar::Str(unquote(stripped, lineno)?)));
    }
    if value == "true" {
        return Ok(Some(Scalar::Bool(true)));
    }
    if value == "false" {
        return Ok(Some(Scalar::Bool(false)));
    }
    if let Ok(i) = value.parse::<i64>() {
        return Ok(Some(Scalar::Int(i)));
    }
    Ok(Some(Scalar::Str(value.to_string())))
}

fn parse_list_item(entry: &str, lineno: usize) -> Result<String> {
    if entry.is_empty() {
        return Err(err(lineno, "empty list item"));
    }
    match parse_scalar(entry, lineno)? {
        Some(Scalar::Str(s)) => Ok(s),
        Some(_) => Ok(entry.to_string()),
        None => Err(err(lineno, "empty list item")),
    }
}

/// Unescape the remainder of a double-quoted scalar (opening quote already
/// stripped).
fn unquote(rest: &str, lineno: usize) -> Result<String> {
    let mut out = String::with_capacity(rest.len());
    let mut chars = rest.chars();
    while let Some(c) = chars.next() {
        match c {
            '"' => {
                if chars.next().is_some() {
                    return Err(err(lineno, "trailing characters after closing quote"));
                }
                return Ok(out);
            }
            '\\' => match chars.next() {
                Some('"') => out.push('"'),
                Some('\\') => out.push('\\'),
                Some('n') => out.push('\n'),
                _ => return Err(err(lineno, "invalid escape sequence")),
            },
            other => out.push(other),
        }
    }
    Err(err(lineno, "unterminated quoted string"))
}

/// Serialize a frontmatter map, delimiters included.
///
/// `id` and `schema_version` come first; the remaining keys follow in
/// lexicographic order, one key per line. Empty lists render as `[]`,
/// non-empty lists in block style.
pub fn emit(fm: &Frontmatter) -> String {
    let mut out = String::new();
    out.push_str(DELIMITER);
    out.push('\n');

    for key in ["id", "schema_version"] {
        if let Some(value) = fm.get(key) {
            emit_entry(&mut out, key, value);
        }
    }
    for (key, value) in fm {
        if key == "id" || key == "schema_version" {
            continue;
        }
        emit_entry(&mut out, key, value);
    }

    out.push_str(DELIMITER);
    out.push('\n');
    out
}

fn emit_entry(out: &mut String, key: &str, value: &Value) {
    match value {
        Value::Scalar(scalar) => {
            out.push_str(key);
            out.push_str(": ");
            emit_scalar(out, scalar);
            out.push('\n');
        }
        Value::List(items) if items.is_empty() => {
            out.push_str(key);
            out.push_str(": []\n");
        }
        Value::List(items) => {
            out.push_str(key);
            out.push_str(":\n");
            for item in items {
                out.push_str("  - ");
                emit_str(out, item);
                out.push('\n');
            }
        }
        Value::Object(map) => {
            out.push_str(key);
            out.push_str(":\n");
            for (sub, scalar) in map {
                out.push_str("  ");
                out.push_str(sub);
                out.push_str(": ");
                emit_scalar(out, scalar);
                out.push('\n');
            }
        }
    }
}

fn emit_scalar(out: &mut String, scalar: &Scalar) {
    match scalar {
        Scalar::Bool(b) => out.push_str(if *b { "true" } else { "false" }),
        Scalar::Int(i) => out.push_str(&i.to_string()),
        Scalar::Str(s) => emit_str(out, s),
    }
}

/// Write a string scalar, quoting whenever a bare rendering would not
/// re-parse as the same string.
fn emit_str(out: &mut String, s: &str) {
    if needs_quoting(s) {
        out.push('"');
        for c in s.chars() {
            match c {
                '"' => out.push_str("\\\""),
                '\\' => out.push_str("\\\\"),
                '\n' => out.push_str("\\n"),
                other => out.push(other),
            }
        }
        out.push('"');
    } else {
        out.push_str(s);
    }
}

fn needs_quoting(s: &str) -> bool {
    s.is_empty()
        || s == "true"
        || s == "false"
        || s == "[]"
        || s.parse::<i64>().is_ok()
        || s.starts_with('"')
        || s.starts_with('-')
        || s.starts_with(char::is_whitespace)
        || s.ends_with(char::is_whitespace)
        || s.contains('\n')
}
