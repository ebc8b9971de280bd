//! Pattern matcher interface and a small signature-based implementation.
//!
//! The engine only needs `compile` and `scan`; any rule engine can sit
//! behind [`PatternMatcher`]. [`SignatureMatcher`] understands the string
//! section of a YARA-style rule:
//!
//! ```text
//! rule decoder {
//!     strings:
//!         $xor_loop = { 8A 04 ?? 34 41 88 04 ?? }
//!         $marker   = "cfg" wide
//!     condition:
//!         any of them
//! }
//! ```
//!
//! Hex strings support `??` wildcards; text strings support the `wide` and
//! `ascii` modifiers. The condition is always treated as `any of them`.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{EngineError, EngineResult};

/// A raw hit reported by a matcher, as a file offset.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawMatch {
    pub offset: u64,
    pub identifier: String,
}

/// A hit resolved to an address in the binary.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Match {
    pub address: u64,
    pub identifier: Option<String>,
}

impl Match {
    pub fn new(address: u64, identifier: Option<&str>) -> Self {
        Self { address, identifier: identifier.map(str::to_string) }
    }
}

/// Rule compilation and matching against the input file.
pub trait PatternMatcher {
    type Rule;

    fn compile(&self, rule_text: &str) -> EngineResult<Self::Rule>;

    /// Scan the file at `path`. `on_match` is called with the hits of each
    /// matching rule. Returns whether anything matched.
    fn scan(
        &self,
        rule: &Self::Rule,
        path: &Path,
        on_match: &mut dyn FnMut(&[RawMatch]),
    ) -> EngineResult<bool>;
}

/// One `$id = ...` definition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignatureString {
    pub identifier: String,
    pub pattern: Vec<Option<u8>>,
}

/// Compiled signature rule.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignatureRule {
    pub name: Option<String>,
    pub strings: Vec<SignatureString>,
}

impl SignatureRule {
    /// All hits of all definitions in `data`, ordered by offset.
    pub fn scan_bytes(&self, data: &[u8]) -> Vec<RawMatch> {
        let mut hits = Vec::new();
        for sig in &self.strings {
            for offset in scan_all(data, &sig.pattern) {
                hits.push(RawMatch { offset: offset as u64, identifier: sig.identifier.clone() });
            }
        }
        hits.sort_by_key(|h| h.offset);
        hits
    }
}

/// Matcher for hex/text signature rules.
#[derive(Debug, Default, Clone, Copy)]
pub struct SignatureMatcher;

impl PatternMatcher for SignatureMatcher {
    type Rule = SignatureRule;

    fn compile(&self, rule_text: &str) -> EngineResult<SignatureRule> {
        parse_rule(rule_text)
    }

    fn scan(
        &self,
        rule: &SignatureRule,
        path: &Path,
        on_match: &mut dyn FnMut(&[RawMatch]),
    ) -> EngineResult<bool> {
        let data = std::fs::read(path)
            .map_err(|e| EngineError::Rule(format!("Failed to read {}: {e}", path.display())))?;
        let hits = rule.scan_bytes(&data);
        if hits.is_empty() {
            return Ok(false);
        }
        on_match(&hits);
        Ok(true)
    }
}

fn parse_rule(rule_text: &str) -> EngineResult<SignatureRule> {
    let mut name = None;
    let mut strings = Vec::new();

    for raw_line in rule_text.lines() {
        let line = strip_comment(raw_line).trim();
        if line.is_empty() {
            continue;
        }
        if let Some(rest) = line.strip_prefix("rule ") {
            let rule_name = rest.trim_end_matches('{').split_whitespace().next().unwrap_or("");
            if !rule_name.is_empty() {
                name = Some(rule_name.to_string());
            }
            continue;
        }
        let Some(rest) = line.strip_prefix('$') else { continue };
        let Some((identifier, body)) = rest.split_once('=') else {
            return Err(EngineError::Rule(format!("Missing '=' in string definition: {line}")));
        };
        let identifier = format!("${}", identifier.trim());
        let body = body.trim();
        let pattern = if let Some(hex) = body.strip_prefix('{') {
            let hex = hex
                .split_once('}')
                .map(|(h, _)| h)
                .ok_or_else(|| EngineError::Rule(format!("Unterminated hex string {identifier}")))?;
            parse_hex_pattern(hex)?
        } else if let Some(quoted) = body.strip_prefix('"') {
            let (text, modifiers) = quoted
                .rsplit_once('"')
                .ok_or_else(|| EngineError::Rule(format!("Unterminated text string {identifier}")))?;
            let text = unescape(text);
            if modifiers.split_whitespace().any(|m| m == "wide") {
                text.encode_utf16().flat_map(|u| u.to_le_bytes()).map(Some).collect()
            } else {
                text.bytes().map(Some).collect()
            }
        } else {
            return Err(EngineError::Rule(format!("Unsupported string definition: {line}")));
        };
        if pattern.is_empty() {
            return Err(EngineError::Rule(format!("Empty string definition {identifier}")));
        }
        strings.push(SignatureString { identifier, pattern });
    }

    if strings.is_empty() {
        return Err(EngineError::Rule("Rule defines no strings".into()));
    }
    Ok(SignatureRule { name, strings })
}

/// Drop a trailing `//` comment that is not inside a quoted string.
fn strip_comment(line: &str) -> &str {
    let mut quoted = false;
    let mut escaped = false;
    for (idx, c) in line.char_indices() {
        match c {
            _ if escaped => escaped = false,
            '\\' if quoted => escaped = true,
            '"' => quoted = !quoted,
            '/' if !quoted && line[idx..].starts_with("//") => return &line[..idx],
            _ => {}
        }
    }
    line
}

fn unescape(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut chars = text.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('n') => out.push('\n'),
            Some('t') => out.push('\t'),
            Some('r') => out.push('\r'),
            Some('0') => out.push('\0'),
            Some(other) => out.push(other),
            None => out.push('\\'),
        }
    }
    out
}

/// Parse a hex byte pattern such as `"8B 45 ?? 00"`. `??` is a wildcard.
pub fn parse_hex_pattern(text: &str) -> EngineResult<Vec<Option<u8>>> {
    let digits: String = text.chars().filter(|c| !c.is_whitespace()).collect();
    if digits.len() % 2 != 0 {
        return Err(EngineError::Rule(format!("Odd number of hex digits in pattern: {text}")));
    }
    digits
        .as_bytes()
        .chunks(2)
        .map(|pair| match pair {
            b"??" => Ok(None),
            _ => std::str::from_utf8(pair)
                .ok()
                .and_then(|s| u8::from_str_radix(s, 16).ok())
                .map(Some)
                .ok_or_else(|| EngineError::Rule(format!("Invalid hex byte in pattern: {text}"))),
        })
        .collect()
}

/// Offset of the first match of `pattern` in `data`.
pub fn scan(data: &[u8], pattern: &[Option<u8>]) -> Option<usize> {
    let pat_len = pattern.len();
    if pat_len == 0 || data.len() < pat_len {
        return None;
    }

    let limit = data.len() - pat_len + 1;
    (0..limit).find(|&i| matches_at(data, i, pattern))
}

/// Offsets of every (possibly overlapping) match of `pattern` in `data`.
pub fn scan_all(data: &[u8], pattern: &[Option<u8>]) -> Vec<usize> {
    let pat_len = pattern.len();
    if pat_len == 0 || data.len() < pat_len {
        return Vec::new();
    }
    (0..data.len() - pat_len + 1).filter(|&i| matches_at(data, i, pattern)).collect()
}

fn matches_at(data: &[u8], at: usize, pattern: &[Option<u8>]) -> bool {
    pattern.iter().enumerate().all(|(j, expected)| match expected {
        Some(byte) => data[at + j] == *byte,
        None => true,
    })
}
