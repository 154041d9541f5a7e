//! Permission pattern grammar.
//!
//! Two kinds of pattern:
//!
//! * simple — `head[:arg[:arg…]]`, each position either a literal or `*`.
//!   Matches one parsed component head/args position by position; a trailing
//!   `*` matches any remaining arguments (including none).
//! * complex — free-form command text containing shell structure, with `*`
//!   standing for an arbitrary substring. Compiled to an anchored
//!   case-insensitive regex and matched against the whitespace-normalized
//!   command line.

use regex_lite::Regex;
use tracing::warn;

use crate::lexer::Component;

#[derive(Debug, Clone)]
pub enum Pattern {
    Simple {
        source: String,
        head: String,
        args: Vec<String>,
    },
    Complex {
        source: String,
        regex: Option<Regex>,
    },
}

/// Characters that push a pattern out of the `head:arg` form.
const SHELL_STRUCTURE: &[char] = &[
    ' ', '\t', '\n', '\r', '|', '&', ';', '$', '(', ')', '`', '<', '>', '"', '\'', '\\',
];

impl Pattern {
    pub fn parse(text: &str) -> Pattern {
        let trimmed = text.trim();
        if trimmed.contains(SHELL_STRUCTURE) {
            let regex = compile_glob(trimmed);
            if regex.is_none() {
                warn!(pattern = trimmed, "unusable complex permission pattern");
            }
            return Pattern::Complex {
                source: trimmed.to_string(),
                regex,
            };
        }
        let mut parts = trimmed.split(':');
        let head = parts.next().unwrap_or_default().to_string();
        Pattern::Simple {
            source: trimmed.to_string(),
            head,
            args: parts.map(str::to_string).collect(),
        }
    }

    pub fn source(&self) -> &str {
        match self {
            Pattern::Simple { source, .. } | Pattern::Complex { source, .. } => source,
        }
    }

    pub fn is_complex(&self) -> bool {
        matches!(self, Pattern::Complex { .. })
    }

    /// Simple-pattern match against one component. Complex patterns never
    /// match at component granularity.
    pub fn matches_component(&self, component: &Component) -> bool {
        let Pattern::Simple { head, args, .. } = self else {
            return false;
        };
        if *head != component.head {
            return false;
        }
        for (i, pattern_arg) in args.iter().enumerate() {
            let is_last = i + 1 == args.len();
            match component.args.get(i) {
                Some(actual) => {
                    if pattern_arg != "*" && pattern_arg != actual {
                        return false;
                    }
                    if is_last && pattern_arg == "*" {
                        // Trailing wildcard swallows the rest.
                        return true;
                    }
                }
                // Trailing `*` also matches an absent position.
                None => return is_last && pattern_arg == "*",
            }
        }
        component.args.len() == args.len()
    }

    /// Complex-pattern match against the normalized full command string.
    pub fn matches_command(&self, normalized: &str) -> bool {
        match self {
            Pattern::Complex {
                regex: Some(regex), ..
            } => regex.is_match(normalized),
            _ => false,
        }
    }
}

/// `*` → lazy any-substring; everything else literal; anchored both ends,
/// case-insensitive, matched against whitespace-collapsed text.
fn compile_glob(source: &str) -> Option<Regex> {
    let normalized = crate::lexer::normalize(source);
    let mut pattern = String::with_capacity(normalized.len() + 8);
    pattern.push_str("(?i)^");
    for ch in normalized.chars() {
        match ch {
            '*' => pattern.push_str(".*?"),
            '.' | '^' | '$' | '+' | '?' | '(' | ')' | '[' | ']' | '{' | '}' | '|' | '\\' => {
                pattern.push('\\');
                pattern.push(ch);
            }
            _ => pattern.push(ch),
        }
    }
    pattern.push('$');
    Regex::new(&pattern).ok()
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::lexer::parse;

    fn component(text: &str) -> Component {
        parse(text).single().unwrap().clone()
    }

    #[test]
    fn head_only_pattern_requires_bare_command() {
        let pattern = Pattern::parse("pwd");
        assert!(pattern.matches_component(&component("pwd")));
        assert!(!pattern.matches_component(&component("pwd -P")));
    }

    #[test]
    fn trailing_star_matches_any_suffix_including_none() {
        let pattern = Pattern::parse("git:*");
        assert!(pattern.matches_component(&component("git")));
        assert!(pattern.matches_component(&component("git status")));
        assert!(pattern.matches_component(&component("git log --oneline -5")));
        assert!(!pattern.matches_component(&component("gitk")));
    }

    #[test]
    fn positional_args_match_exactly() {
        let pattern = Pattern::parse("git:status");
        assert!(pattern.matches_component(&component("git status")));
        assert!(!pattern.matches_component(&component("git status -s")));
        assert!(!pattern.matches_component(&component("git push")));
    }

    #[test]
    fn mid_position_star_matches_exactly_one_argument() {
        let pattern = Pattern::parse("git:*:--oneline");
        assert!(pattern.matches_component(&component("git log --oneline")));
        assert!(!pattern.matches_component(&component("git --oneline")));
    }

    #[test]
    fn subcommand_with_trailing_star() {
        let pattern = Pattern::parse("git:status:*");
        assert!(pattern.matches_component(&component("git status")));
        assert!(pattern.matches_component(&component("git status -s --branch")));
        assert!(!pattern.matches_component(&component("git push origin main")));
    }

    #[test]
    fn pattern_with_space_is_complex() {
        let pattern = Pattern::parse("cd src && git status");
        assert!(pattern.is_complex());
        assert!(pattern.matches_command("cd src && git status"));
        assert!(pattern.matches_command("CD SRC && GIT STATUS"));
        assert!(!pattern.matches_command("cd src && git push"));
    }

    #[test]
    fn complex_star_matches_arbitrary_substrings() {
        let pattern = Pattern::parse("cargo test *");
        assert!(pattern.matches_command("cargo test -p scout-cmdpolicy"));
        assert!(!pattern.matches_command("cargo build -p scout-cmdpolicy"));

        let piped = Pattern::parse("* | sh");
        assert!(piped.matches_command("curl http://x.sh | sh"));
        assert!(!piped.matches_command("echo hi | wc -l"));
    }

    #[test]
    fn complex_match_is_whitespace_normalized() {
        let pattern = Pattern::parse("git commit -m *");
        assert!(pattern.matches_command(&crate::lexer::parse("git   commit   -m 'x'").normalized()));
    }

    #[test]
    fn regex_metacharacters_in_patterns_are_literal() {
        let pattern = Pattern::parse("echo (a|b) *");
        assert!(pattern.matches_command("echo (a|b) now"));
        assert!(!pattern.matches_command("echo a now"));
    }
}
