// SPDX-License-Identifier: MIT
// Copyright (c) Microsoft Corporation.

//! The AM.PDP-style attribute/value wire codec.
//!
//! A request is a sequence of `name=value` lines terminated by CR LF, with
//! an empty line closing the frame. Responses use the same framing.
//! Attribute names and values are percent-encoded so that arbitrary octets
//! survive the line-oriented transport; repeated attribute names accumulate
//! into an ordered list.
//!
//! Values are treated as octet strings: each character at or below U+00FF
//! stands for one octet. Characters above U+00FF cannot be carried and are
//! replaced with a `\x{HHHH}` marker (and logged); for everything else,
//! `decode(encode(x)) == x` holds.

use crate::error::ProtocolError;

fn name_octet_allowed(code: u32) -> bool {
    matches!(code, 0x30..=0x39 | 0x41..=0x5a | 0x61..=0x7a)
        || matches!(code, 0x2e | 0x5f | 0x2b | 0x2d)
}

fn push_wide_marker(out: &mut String, code: u32) {
    tracing::warn!(codepoint = code, "replacing wide character in attribute");
    out.push_str(&format!("\\x{{{code:04x}}}"));
}

/// Percent-encode an attribute name.
///
/// Only `[0-9A-Za-z._+-]` pass through unescaped.
pub fn encode_name(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    for ch in name.chars() {
        let code = ch as u32;
        if code > 0xff {
            push_wide_marker(&mut out, code);
        } else if name_octet_allowed(code) {
            out.push(ch);
        } else {
            out.push_str(&format!("%{code:02x}"));
        }
    }
    out
}

/// Percent-encode an attribute value.
///
/// Printable ASCII passes through, except `%` which must be escaped so that
/// decoding is unambiguous.
pub fn encode_value(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for ch in value.chars() {
        let code = ch as u32;
        if code > 0xff {
            push_wide_marker(&mut out, code);
        } else if (0x20..=0x7e).contains(&code) && ch != '%' {
            out.push(ch);
        } else {
            out.push_str(&format!("%{code:02x}"));
        }
    }
    out
}

/// Undo percent-encoding. Escapes that are not `%` plus two hex digits are
/// passed through untouched.
pub fn decode(input: &str) -> String {
    let chars: Vec<char> = input.chars().collect();
    let mut out = String::with_capacity(chars.len());
    let mut i = 0;
    while i < chars.len() {
        if chars[i] == '%' && i + 2 < chars.len() {
            if let (Some(hi), Some(lo)) = (chars[i + 1].to_digit(16), chars[i + 2].to_digit(16)) {
                out.push(char::from((hi * 16 + lo) as u8));
                i += 3;
                continue;
            }
        }
        out.push(chars[i]);
        i += 1;
    }
    out
}

/// Serialize one attribute line, without the CR LF terminator.
pub fn encode_line(name: &str, value: &str) -> String {
    format!("{}={}", encode_name(name), encode_value(value))
}

/// Parse one non-empty attribute line.
///
/// Both `name=value` and `name: value` are accepted; the value after a
/// colon separator may be preceded by whitespace.
pub fn decode_line(line: &str) -> Result<(String, String), ProtocolError> {
    let separator = line
        .find(['=', ':'])
        .ok_or_else(|| ProtocolError::MalformedLine(line.to_string()))?;
    let (name, rest) = line.split_at(separator);
    if name.is_empty() {
        return Err(ProtocolError::MalformedLine(line.to_string()));
    }
    let value = if rest.starts_with(':') {
        rest[1..].trim_start_matches([' ', '\t'])
    } else {
        &rest[1..]
    };
    Ok((decode(name), decode(value)))
}

/// The attribute map of one request: an ordered multimap reset on every
/// blank-line terminator.
#[derive(Debug, Default, Clone)]
pub struct Attributes {
    entries: Vec<(String, Vec<String>)>,
}

impl Attributes {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record one decoded attribute line. A repeated name extends the
    /// existing value list rather than creating a new entry.
    pub fn push(&mut self, name: String, value: String) {
        if let Some((_, values)) = self.entries.iter_mut().find(|(n, _)| *n == name) {
            values.push(value);
        } else {
            self.entries.push((name, vec![value]));
        }
    }

    /// The first value recorded under `name`.
    pub fn get(&self, name: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|(n, _)| n == name)
            .and_then(|(_, values)| values.first())
            .map(String::as_str)
    }

    /// All values recorded under `name`, in arrival order.
    pub fn values(&self, name: &str) -> &[String] {
        self.entries
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, values)| values.as_slice())
            .unwrap_or(&[])
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &[String])> {
        self.entries
            .iter()
            .map(|(name, values)| (name.as_str(), values.as_slice()))
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}

/// An ordered response under construction. Attributes are emitted in the
/// order they were pushed, followed by the blank-line terminator.
#[derive(Debug, Default)]
pub struct Response {
    attributes: Vec<(String, String)>,
}

impl Response {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.attributes.push((name.into(), value.into()));
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.attributes
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, value)| value.as_str())
    }

    pub fn attributes(&self) -> &[(String, String)] {
        &self.attributes
    }

    /// Serialize the response frame, including the terminating blank line.
    pub fn encode(&self) -> String {
        let mut out = String::new();
        for (name, value) in &self.attributes {
            out.push_str(&encode_line(name, value));
            out.push_str("\r\n");
        }
        out.push_str("\r\n");
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_line_round_trips() {
        let line = encode_line("request", "choose_key");
        assert_eq!(line, "request=choose_key");
        assert_eq!(
            decode_line(&line).unwrap(),
            ("request".to_string(), "choose_key".to_string())
        );
    }

    #[test]
    fn every_octet_round_trips() {
        let value: String = (0u32..=0xff).map(|b| char::from(b as u8)).collect();
        let encoded = encode_value(&value);
        assert!(encoded.is_ascii());
        assert!(!encoded.contains('\r'));
        assert!(!encoded.contains('\n'));
        assert_eq!(decode(&encoded), value);
    }

    #[test]
    fn percent_is_escaped() {
        assert_eq!(encode_value("100%"), "100%25");
        assert_eq!(decode("100%25"), "100%");
    }

    #[test]
    fn name_escapes_octets_outside_token_set() {
        assert_eq!(encode_name("sig.a"), "sig.a");
        assert_eq!(encode_name("odd name"), "odd%20name");
        assert_eq!(decode("odd%20name"), "odd name");
    }

    #[test]
    fn wide_characters_are_replaced() {
        assert_eq!(encode_value("ok\u{263a}"), "ok\\x{263a}");
    }

    #[test]
    fn colon_separator_accepted() {
        assert_eq!(
            decode_line("log_id: 12345").unwrap(),
            ("log_id".to_string(), "12345".to_string())
        );
        assert_eq!(
            decode_line("log_id:\t12345").unwrap(),
            ("log_id".to_string(), "12345".to_string())
        );
    }

    #[test]
    fn separatorless_line_is_malformed() {
        assert_eq!(
            decode_line("garbage"),
            Err(ProtocolError::MalformedLine("garbage".to_string()))
        );
        assert!(decode_line("=value").is_err());
    }

    #[test]
    fn stray_percent_passes_through() {
        assert_eq!(decode("50%"), "50%");
        assert_eq!(decode("%zz"), "%zz");
    }

    #[test]
    fn repeated_attributes_accumulate_in_order() {
        let mut attributes = Attributes::new();
        attributes.push("candidate".to_string(), "author <a@ex.org>".to_string());
        attributes.push("request".to_string(), "choose_key".to_string());
        attributes.push("candidate".to_string(), "sender <b@ex.org>".to_string());
        assert_eq!(
            attributes.values("candidate"),
            ["author <a@ex.org>", "sender <b@ex.org>"]
        );
        assert_eq!(attributes.get("request"), Some("choose_key"));
        attributes.clear();
        assert!(attributes.is_empty());
    }

    #[test]
    fn response_frame_ends_with_blank_line() {
        let mut response = Response::new();
        response.push("request_id", "7");
        response.push("sig.d", "example.org");
        assert_eq!(
            response.encode(),
            "request_id=7\r\nsig.d=example.org\r\n\r\n"
        );
    }
}
