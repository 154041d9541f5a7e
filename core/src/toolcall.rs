//! Parsing structured tool invocations out of model text.
//!
//! The wire form is XML-flavored fragments embedded in prose:
//! `<tool_name><parameter>value</parameter>…</tool_name>`. Parameter bodies
//! are taken verbatim to the matching close tag, so multi-line bash
//! commands with quotes and operators survive intact. Only names the
//! registry knows are treated as invocations; everything else in the text
//! is prose.

use std::collections::BTreeMap;
use std::collections::HashSet;

use crate::models::ToolInvocation;

/// Extract tool invocations in order of appearance. `known_tools` decides
/// which tag names count; unknown tags (markdown, HTML, generics in prose)
/// are skipped.
pub fn parse_tool_invocations(text: &str, known_tools: &HashSet<String>) -> Vec<ToolInvocation> {
    let mut invocations = Vec::new();
    let mut cursor = 0;

    while let Some((tag_start, name)) = next_open_tag(text, cursor, Some(known_tools)) {
        let body_start = tag_start + name.len() + 2;
        let close = format!("</{name}>");
        let Some(close_rel) = text[body_start..].find(&close) else {
            // Unclosed tag: not an invocation, keep scanning after it.
            cursor = body_start;
            continue;
        };
        let body = &text[body_start..body_start + close_rel];
        invocations.push(ToolInvocation {
            name: name.clone(),
            params: parse_parameters(body),
            raw: text[tag_start..body_start + close_rel + close.len()].to_string(),
        });
        cursor = body_start + close_rel + close.len();
    }
    invocations
}

/// `<param>value</param>` pairs within an invocation body. Values keep
/// interior newlines; a single leading and trailing newline (artifacts of
/// tag formatting) is trimmed.
fn parse_parameters(body: &str) -> BTreeMap<String, String> {
    let mut params = BTreeMap::new();
    let mut cursor = 0;
    while let Some((tag_start, name)) = next_open_tag(body, cursor, None) {
        let value_start = tag_start + name.len() + 2;
        let close = format!("</{name}>");
        let Some(close_rel) = body[value_start..].find(&close) else {
            cursor = value_start;
            continue;
        };
        let raw_value = &body[value_start..value_start + close_rel];
        params.insert(name, trim_tag_artifacts(raw_value).to_string());
        cursor = value_start + close_rel + close.len();
    }
    params
}

/// Find the next `<name>` tag at or after `from`. When `known` is given,
/// only those names match; otherwise any identifier-shaped name does.
fn next_open_tag(
    text: &str,
    from: usize,
    known: Option<&HashSet<String>>,
) -> Option<(usize, String)> {
    let bytes = text.as_bytes();
    let mut i = from;
    while i < bytes.len() {
        if bytes[i] != b'<' {
            i += 1;
            continue;
        }
        let rest = &text[i + 1..];
        let name_len = rest
            .bytes()
            .take_while(|b| b.is_ascii_alphanumeric() || *b == b'_' || *b == b'-')
            .count();
        if name_len == 0 || rest.as_bytes().get(name_len) != Some(&b'>') {
            i += 1;
            continue;
        }
        let name = &rest[..name_len];
        if known.is_none_or(|set| set.contains(name)) {
            return Some((i, name.to_string()));
        }
        i += 1;
    }
    None
}

fn trim_tag_artifacts(value: &str) -> &str {
    let value = value.strip_prefix("\r\n").or_else(|| value.strip_prefix('\n')).unwrap_or(value);
    value
        .strip_suffix('\n')
        .map(|v| v.strip_suffix('\r').unwrap_or(v))
        .unwrap_or(value)
}
