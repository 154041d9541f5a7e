//! Short per-line content hashes for stale-safe line-addressed edits.
//!
//! A line hash is two hex characters: DJB2 over the line with all
//! whitespace removed, reduced mod 256. Listings are annotated as
//! `<line-no>:<hash> |<content>`; a line reference is either a bare line
//! number or `line:hash`, and a present hash must match current content.

/// DJB2 of the line with every whitespace character stripped, mod 256.
pub fn compute_line_hash(line: &str) -> String {
    let mut hash: u32 = 5381;
    for c in line.chars().filter(|c| !c.is_whitespace()) {
        let mut buf = [0u8; 4];
        for b in c.encode_utf8(&mut buf).bytes() {
            hash = hash.wrapping_mul(33).wrapping_add(u32::from(b));
        }
    }
    format!("{:02x}", hash % 256)
}

/// Annotate a listing with `line:hash |` prefixes. Line numbers start at
/// `start_line`; LF and CRLF endings are preserved.
pub fn annotate_listing(text: &str, start_line: usize) -> String {
    let line_count = text.split_inclusive('\n').count().max(1);
    let width = (start_line + line_count - 1).to_string().len();
    let mut out = String::with_capacity(text.len() + line_count * (width + 6));
    for (offset, raw) in text.split_inclusive('\n').enumerate() {
        let (content, ending) = split_line_ending(raw);
        let number = start_line + offset;
        let hash = compute_line_hash(content);
        out.push_str(&format!("{number:>width$}:{hash} |{content}{ending}"));
    }
    if text.is_empty() {
        out.push_str(&format!("{start_line:>width$}:{} |", compute_line_hash("")));
    }
    out
}

/// Parse `12` or `12:af` into (line, hash?). Returns `None` for anything
/// else.
pub fn parse_line_ref(text: &str) -> Option<(usize, Option<String>)> {
    let trimmed = text.trim();
    match trimmed.split_once(':') {
        Some((number, hash)) => {
            let number = number.parse::<usize>().ok()?;
            if number == 0 {
                return None;
            }
            let hash = hash.trim();
            if hash.len() == 2 && hash.chars().all(|c| c.is_ascii_hexdigit()) {
                Some((number, Some(hash.to_ascii_lowercase())))
            } else {
                None
            }
        }
        None => {
            let number = trimmed.parse::<usize>().ok()?;
            if number == 0 { None } else { Some((number, None)) }
        }
    }
}

/// Whether `line_ref`'s hash (if any) matches the addressed line of
/// `content`. Bare line numbers always verify.
pub fn verify_line_ref(content: &str, line: usize, hash: Option<&str>) -> bool {
    let Some(hash) = hash else {
        return true;
    };
    let Some(addressed) = content.lines().nth(line.saturating_sub(1)) else {
        return false;
    };
    compute_line_hash(addressed) == hash.to_ascii_lowercase()
}

/// Remove `line:hash |` (or the tolerated `line |`) prefixes that the
/// model echoed back into replacement text. Only activates when the
/// majority of non-empty lines carry the prefix, so legitimate content
/// that happens to contain pipes is left alone.
pub fn strip_line_prefixes(text: &str) -> String {
    let non_empty: Vec<&str> = text.lines().filter(|l| !l.trim().is_empty()).collect();
    if non_empty.is_empty() {
        return text.to_string();
    }
    let prefixed = non_empty
        .iter()
        .filter(|l| parse_annotated_prefix(l).is_some())
        .count();
    if prefixed * 2 <= non_empty.len() {
        return text.to_string();
    }

    let mut out = String::with_capacity(text.len());
    for raw in text.split_inclusive('\n') {
        let (content, ending) = split_line_ending(raw);
        match parse_annotated_prefix(content) {
            Some(rest) => out.push_str(rest),
            None => out.push_str(content),
        }
        out.push_str(ending);
    }
    out
}

fn split_line_ending(raw: &str) -> (&str, &str) {
    if let Some(stripped) = raw.strip_suffix("\r\n") {
        (stripped, "\r\n")
    } else if let Some(stripped) = raw.strip_suffix('\n') {
        (stripped, "\n")
    } else {
        (raw, "")
    }
}

/// `"  12:af |rest"` → `Some("rest")`; `"12 |rest"` → `Some("rest")`.
fn parse_annotated_prefix(line: &str) -> Option<&str> {
    let after_ws = line.trim_start();
    let digits = after_ws.chars().take_while(|c| c.is_ascii_digit()).count();
    if digits == 0 {
        return None;
    }
    let mut rest = &after_ws[digits..];
    if let Some(stripped) = rest.strip_prefix(':') {
        let hash_len = stripped
            .chars()
            .take_while(|c| c.is_ascii_hexdigit())
            .count();
        if hash_len != 2 {
            return None;
        }
        rest = &stripped[2..];
    }
    let rest_trimmed = rest.trim_start_matches([' ', '\t']);
    rest_trimmed.strip_prefix('|')
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn hash_ignores_all_whitespace() {
        let a = compute_line_hash("let x = 1;");
        assert_eq!(a, compute_line_hash("letx=1;"));
        assert_eq!(a, compute_line_hash("  let\tx  =  1;  "));
        assert_eq!(a.len(), 2);
    }

    #[test]
    fn different_content_usually_differs() {
        assert_ne!(compute_line_hash("let x = 1;"), compute_line_hash("let x = 2;"));
    }

    #[test]
    fn annotates_and_preserves_endings() {
        let annotated = annotate_listing("alpha\r\nbeta\n", 9);
        let expected = format!(
            " 9:{} |alpha\r\n10:{} |beta\n",
            compute_line_hash("alpha"),
            compute_line_hash("beta")
        );
        assert_eq!(annotated, expected);
    }

    #[test]
    fn parses_both_line_ref_forms() {
        assert_eq!(parse_line_ref("12"), Some((12, None)));
        assert_eq!(parse_line_ref("12:AF"), Some((12, Some("af".to_string()))));
        assert_eq!(parse_line_ref("0"), None);
        assert_eq!(parse_line_ref("12:xyz"), None);
        assert_eq!(parse_line_ref("not a ref"), None);
    }

    #[test]
    fn verifies_hashes_against_content() {
        let content = "first\nsecond\nthird";
        let hash = compute_line_hash("second");
        assert!(verify_line_ref(content, 2, Some(&hash)));
        assert!(!verify_line_ref(content, 3, Some(&hash)));
        assert!(verify_line_ref(content, 99, None));
    }

    #[test]
    fn strips_echoed_prefixes_when_majority() {
        let hash = compute_line_hash("fn main() {}");
        let text = format!("1:{hash} |fn main() {{}}\n2:{} |\n", compute_line_hash(""));
        assert_eq!(strip_line_prefixes(&text), "fn main() {}\n\n");
    }

    #[test]
    fn tolerates_hashless_prefixes() {
        let text = "1 |alpha\n2 |beta\n";
        assert_eq!(strip_line_prefixes(text), "alpha\nbeta\n");
    }

    #[test]
    fn leaves_unprefixed_text_alone() {
        let text = "result | grep foo\nplain line\nanother\n";
        assert_eq!(strip_line_prefixes(text), text);
    }
}
