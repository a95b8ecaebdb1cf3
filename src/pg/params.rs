//! Client-side parameter binding for the simple query protocol
//!
//! `$1`..`$n` placeholders are replaced by SQL literals. Placeholders inside
//! string literals, quoted identifiers, dollar-quoted bodies and comments are
//! left alone.

use crate::types::Value;
use crate::{Error, Result};
use std::fmt::Write;

/// Substitute `params` into `sql`
pub fn bind(sql: &str, params: &[Value]) -> Result<String> {
    if params.is_empty() {
        return Ok(sql.to_string());
    }

    let bytes = sql.as_bytes();
    let mut out = String::with_capacity(sql.len() + params.len() * 8);
    let mut used = vec![false; params.len()];
    let mut i = 0;
    let mut copied = 0;

    while i < bytes.len() {
        match bytes[i] {
            b'\'' if is_escape_string(bytes, i) => i = skip_escape_string(bytes, i),
            b'\'' | b'"' => i = skip_quoted(bytes, i, bytes[i]),
            b'-' if bytes.get(i + 1) == Some(&b'-') => {
                i = bytes[i..]
                    .iter()
                    .position(|&b| b == b'\n')
                    .map_or(bytes.len(), |p| i + p + 1);
            }
            b'/' if bytes.get(i + 1) == Some(&b'*') => {
                i = sql[i + 2..].find("*/").map_or(bytes.len(), |p| i + 2 + p + 2);
            }
            b'$' => {
                let digits = bytes[i + 1..].iter().take_while(|b| b.is_ascii_digit()).count();
                if digits > 0 {
                    let n: usize = sql[i + 1..i + 1 + digits]
                        .parse()
                        .map_err(|_| Error::Protocol(format!("bad placeholder in {:?}", sql)))?;
                    let value = n
                        .checked_sub(1)
                        .and_then(|idx| params.get(idx).map(|v| (idx, v)))
                        .ok_or_else(|| {
                            Error::Protocol(format!(
                                "placeholder ${} has no parameter ({} given)",
                                n,
                                params.len()
                            ))
                        })?;
                    out.push_str(&sql[copied..i]);
                    write_literal(&mut out, value.1)?;
                    used[value.0] = true;
                    i += 1 + digits;
                    copied = i;
                } else {
                    i = skip_dollar_quoted(sql, i);
                }
            }
            _ => i += 1,
        }
    }
    out.push_str(&sql[copied..]);

    if let Some(unused) = used.iter().position(|u| !u) {
        return Err(Error::Protocol(format!(
            "parameter {} is not referenced by the statement",
            unused + 1
        )));
    }
    Ok(out)
}

/// Render a value as a SQL literal
pub fn write_literal(out: &mut String, value: &Value) -> Result<()> {
    match value {
        Value::Null => out.push_str("NULL"),
        Value::Bool(true) => out.push_str("TRUE"),
        Value::Bool(false) => out.push_str("FALSE"),
        Value::Int(v) if *v < 0 => {
            let _ = write!(out, "({})", v);
        }
        Value::Int(v) => {
            let _ = write!(out, "{}", v);
        }
        Value::Float(v) if v.is_nan() => out.push_str("'NaN'::float8"),
        Value::Float(v) if v.is_infinite() => {
            out.push_str(if *v > 0.0 { "'Infinity'::float8" } else { "'-Infinity'::float8" })
        }
        Value::Float(v) if *v < 0.0 => {
            let _ = write!(out, "({:?}::float8)", v);
        }
        Value::Float(v) => {
            let _ = write!(out, "{:?}::float8", v);
        }
        Value::Text(s) => {
            if s.contains('\0') {
                return Err(Error::Protocol("text parameter contains a NUL byte".into()));
            }
            out.push('\'');
            out.push_str(&s.replace('\'', "''"));
            out.push('\'');
        }
        Value::Bytes(b) => {
            out.push_str("'\\x");
            for byte in b {
                let _ = write!(out, "{:02x}", byte);
            }
            out.push_str("'::bytea");
        }
    }
    Ok(())
}

fn skip_quoted(bytes: &[u8], start: usize, quote: u8) -> usize {
    let mut i = start + 1;
    while i < bytes.len() {
        if bytes[i] == quote {
            if bytes.get(i + 1) == Some(&quote) {
                i += 2;
                continue;
            }
            return i + 1;
        }
        i += 1;
    }
    bytes.len()
}

/// Whether the quote at `quote` opens an `E'...'` string
fn is_escape_string(bytes: &[u8], quote: usize) -> bool {
    match quote.checked_sub(1).map(|p| bytes[p]) {
        Some(b'E' | b'e') => !quote
            .checked_sub(2)
            .is_some_and(|p| bytes[p].is_ascii_alphanumeric() || bytes[p] == b'_'),
        _ => false,
    }
}

/// Skip an `E'...'` string, where a backslash escapes the next byte
fn skip_escape_string(bytes: &[u8], start: usize) -> usize {
    let mut i = start + 1;
    while i < bytes.len() {
        match bytes[i] {
            b'\\' => i += 2,
            b'\'' if bytes.get(i + 1) == Some(&b'\'') => i += 2,
            b'\'' => return i + 1,
            _ => i += 1,
        }
    }
    bytes.len()
}

/// Skip `$tag$ ... $tag$`; a lone `$` is just a character
fn skip_dollar_quoted(sql: &str, start: usize) -> usize {
    let rest = &sql[start + 1..];
    let tag_len = rest
        .bytes()
        .take_while(|b| b.is_ascii_alphanumeric() || *b == b'_')
        .count();
    if rest.as_bytes().get(tag_len) != Some(&b'$') {
        return start + 1;
    }
    let delim = &sql[start..start + tag_len + 2];
    let body_start = start + delim.len();
    sql[body_start..]
        .find(delim)
        .map_or(sql.len(), |p| body_start + p + delim.len())
}
