//! Two-pass shell command lexer.
//!
//! Pass 1 splits a command string into components on the shell operators
//! (`&&`, `||`, `|`, `;`, lone `&`, newline) while tracking quote state and
//! command-substitution depth, so operators inside quotes or `$(…)` never
//! split. Pass 2 tokenizes each component into a head and arguments with
//! shell-style quote and escape handling.
//!
//! The lexer never executes anything; it only produces the structure the
//! permission policy needs to make a decision.

use thiserror::Error;

/// Separator that joined two adjacent components in the original text.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Separator {
    /// `&&`
    And,
    /// `||`
    Or,
    /// `|`
    Pipe,
    /// `;`
    Sequential,
    /// lone `&`
    Background,
    /// `\n` or `\r\n` outside quotes
    Newline,
}

impl Separator {
    pub fn as_str(self) -> &'static str {
        match self {
            Separator::And => "&&",
            Separator::Or => "||",
            Separator::Pipe => "|",
            Separator::Sequential => ";",
            Separator::Background => "&",
            Separator::Newline => "\n",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ParseError {
    #[error("Unclosed quote")]
    UnclosedQuote,
    #[error("Incomplete command substitution")]
    IncompleteSubstitution,
}

/// Which compound constructs appear outside quotes.
///
/// Redirection is tracked but deliberately excluded from
/// [`Structure::is_complex`]: `wc -l < file` is still a simple command for
/// permission purposes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Structure {
    pub pipe: bool,
    pub logical_and: bool,
    pub logical_or: bool,
    pub sequential: bool,
    pub background: bool,
    pub redirection: bool,
    pub substitution: bool,
}

impl Structure {
    pub fn is_complex(&self) -> bool {
        self.pipe
            || self.logical_and
            || self.logical_or
            || self.sequential
            || self.background
            || self.substitution
    }
}

/// One simple command within a (possibly compound) command line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Component {
    /// First token; empty for an empty component (e.g. between `;;`).
    pub head: String,
    /// Remaining tokens with trailing redirections stripped.
    pub args: Vec<String>,
    /// Trimmed source text of this component, redirections included.
    pub raw: String,
}

impl Component {
    pub fn is_empty(&self) -> bool {
        self.head.is_empty() && self.args.is_empty()
    }
}

/// Result of lexing one command line.
///
/// Parse failures are carried in `error` rather than an `Err` so the policy
/// layer can uniformly deny them with a structural reason.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedCommand {
    /// The input after trimming.
    pub original: String,
    pub components: Vec<Component>,
    /// `separators[i]` sits between `components[i]` and `components[i + 1]`.
    pub separators: Vec<Separator>,
    pub structure: Structure,
    /// Recursively parsed bodies of `$(…)` and backtick substitutions.
    pub substitutions: Vec<ParsedCommand>,
    pub error: Option<ParseError>,
}

impl ParsedCommand {
    pub fn is_complex(&self) -> bool {
        self.structure.is_complex()
    }

    pub fn is_empty(&self) -> bool {
        self.components.iter().all(Component::is_empty)
    }

    /// The single component of a non-complex command, if that is what this is.
    pub fn single(&self) -> Option<&Component> {
        if !self.is_complex() && self.components.len() == 1 {
            self.components.first()
        } else {
            None
        }
    }

    /// Every command head present anywhere in the line, including inside
    /// command substitutions, in source order and deduplicated.
    pub fn command_names(&self) -> Vec<String> {
        let mut names = Vec::new();
        self.collect_command_names(&mut names);
        names
    }

    fn collect_command_names(&self, names: &mut Vec<String>) {
        for component in &self.components {
            if !component.head.is_empty() && !names.contains(&component.head) {
                names.push(component.head.clone());
            }
        }
        for substitution in &self.substitutions {
            substitution.collect_command_names(names);
        }
    }

    /// The original line with all whitespace runs collapsed to single spaces.
    /// Complex permission patterns match against this form.
    pub fn normalized(&self) -> String {
        normalize(&self.original)
    }

    /// Rejoin raw component spans with their separators, one space around
    /// each separator. For well-formed input this reproduces the trimmed
    /// original up to whitespace normalization.
    pub fn reassemble(&self) -> String {
        let mut out = String::new();
        for (i, component) in self.components.iter().enumerate() {
            if !component.raw.is_empty() {
                out.push_str(&component.raw);
            }
            if let Some(sep) = self.separators.get(i) {
                if !out.is_empty() && !out.ends_with(' ') {
                    out.push(' ');
                }
                out.push_str(sep.as_str());
                out.push(' ');
            }
        }
        normalize(&out)
    }
}

pub fn normalize(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Lex a command line. Never fails; malformed input comes back with
/// `error` set and whatever components were recognized before the fault.
pub fn parse(input: &str) -> ParsedCommand {
    let trimmed = input.trim();
    if trimmed.is_empty() {
        return ParsedCommand {
            original: String::new(),
            components: Vec::new(),
            separators: Vec::new(),
            structure: Structure::default(),
            substitutions: Vec::new(),
            error: None,
        };
    }

    let mut splitter = Splitter::new(trimmed);
    let error = splitter.run();
    let Splitter {
        texts,
        separators,
        mut structure,
        substitution_bodies,
        ..
    } = splitter;

    let mut components = Vec::with_capacity(texts.len());
    for text in &texts {
        let (component, saw_redirection) = tokenize_component(text);
        structure.redirection |= saw_redirection;
        components.push(component);
    }

    let substitutions = substitution_bodies
        .iter()
        .map(|body| parse(body))
        .collect();

    ParsedCommand {
        original: trimmed.to_string(),
        components,
        separators,
        structure,
        substitutions,
        error,
    }
}

/// Pass 1 state machine.
struct Splitter {
    chars: Vec<char>,
    texts: Vec<String>,
    separators: Vec<Separator>,
    structure: Structure,
    substitution_bodies: Vec<String>,
}

impl Splitter {
    fn new(source: &str) -> Self {
        Self {
            chars: source.chars().collect(),
            texts: Vec::new(),
            separators: Vec::new(),
            structure: Structure::default(),
            substitution_bodies: Vec::new(),
        }
    }

    fn run(&mut self) -> Option<ParseError> {
        let mut current = String::new();
        let mut body = String::new();
        let mut in_single = false;
        let mut in_double = false;
        let mut in_backtick = false;
        let mut depth: usize = 0;

        let mut i = 0;
        let len = self.chars.len();
        while i < len {
            let c = self.chars[i];
            let in_substitution = depth > 0 || in_backtick;

            if in_single {
                current.push(c);
                if in_substitution {
                    body.push(c);
                }
                if c == '\'' {
                    in_single = false;
                }
                i += 1;
                continue;
            }

            if c == '\\' {
                // Escape: the next character loses all significance.
                current.push(c);
                if in_substitution {
                    body.push(c);
                }
                if let Some(&next) = self.chars.get(i + 1) {
                    current.push(next);
                    if in_substitution {
                        body.push(next);
                    }
                    i += 2;
                } else {
                    i += 1;
                }
                continue;
            }

            if in_double {
                current.push(c);
                if in_substitution {
                    body.push(c);
                }
                if c == '"' {
                    in_double = false;
                }
                i += 1;
                continue;
            }

            match c {
                '\'' => {
                    in_single = true;
                    current.push(c);
                    if in_substitution {
                        body.push(c);
                    }
                    i += 1;
                }
                '"' => {
                    in_double = true;
                    current.push(c);
                    if in_substitution {
                        body.push(c);
                    }
                    i += 1;
                }
                '`' if depth == 0 => {
                    current.push(c);
                    if in_backtick {
                        in_backtick = false;
                        self.structure.substitution = true;
                        self.substitution_bodies.push(std::mem::take(&mut body));
                    } else {
                        in_backtick = true;
                    }
                    i += 1;
                }
                _ if in_backtick => {
                    body.push(c);
                    current.push(c);
                    i += 1;
                }
                '$' if self.chars.get(i + 1) == Some(&'(') => {
                    if depth > 0 {
                        body.push_str("$(");
                    }
                    depth += 1;
                    current.push_str("$(");
                    i += 2;
                }
                ')' => {
                    if depth == 0 {
                        return Some(ParseError::IncompleteSubstitution);
                    }
                    depth -= 1;
                    if depth == 0 {
                        self.structure.substitution = true;
                        self.substitution_bodies.push(std::mem::take(&mut body));
                    } else {
                        body.push(c);
                    }
                    current.push(c);
                    i += 1;
                }
                _ if depth > 0 => {
                    body.push(c);
                    current.push(c);
                    i += 1;
                }
                '&' if self.chars.get(i + 1) == Some(&'&') => {
                    self.split(&mut current, Separator::And);
                    i += 2;
                }
                '|' if self.chars.get(i + 1) == Some(&'|') => {
                    self.split(&mut current, Separator::Or);
                    i += 2;
                }
                '|' => {
                    self.split(&mut current, Separator::Pipe);
                    i += 1;
                }
                ';' => {
                    self.split(&mut current, Separator::Sequential);
                    i += 1;
                }
                '&' => {
                    self.split(&mut current, Separator::Background);
                    i += 1;
                }
                '\r' | '\n' => {
                    self.split(&mut current, Separator::Newline);
                    if c == '\r' && self.chars.get(i + 1) == Some(&'\n') {
                        i += 2;
                    } else {
                        i += 1;
                    }
                }
                '>' | '<' => {
                    self.structure.redirection = true;
                    current.push(c);
                    // Keep `>&` / `<&` pairs intact so the duplication target
                    // is not mistaken for a background operator.
                    if self.chars.get(i + 1) == Some(&'&') {
                        current.push('&');
                        i += 2;
                    } else {
                        i += 1;
                    }
                }
                _ => {
                    current.push(c);
                    i += 1;
                }
            }
        }

        if in_single || in_double {
            return Some(ParseError::UnclosedQuote);
        }
        if depth > 0 || in_backtick {
            return Some(ParseError::IncompleteSubstitution);
        }

        self.texts.push(current.trim().to_string());
        None
    }

    fn split(&mut self, current: &mut String, separator: Separator) {
        self.texts.push(current.trim().to_string());
        self.separators.push(separator);
        match separator {
            Separator::And => self.structure.logical_and = true,
            Separator::Or => self.structure.logical_or = true,
            Separator::Pipe => self.structure.pipe = true,
            Separator::Sequential | Separator::Newline => self.structure.sequential = true,
            Separator::Background => self.structure.background = true,
        }
        current.clear();
    }
}

/// Pass 2: tokenize one component into head + args, stripping redirections
/// from the policy-visible argument list.
fn tokenize_component(text: &str) -> (Component, bool) {
    let tokens = tokenize(text);
    let (mut tokens, saw_redirection) = strip_redirections(tokens);
    let head = if tokens.is_empty() {
        String::new()
    } else {
        tokens.remove(0)
    };
    (
        Component {
            head,
            args: tokens,
            raw: text.to_string(),
        },
        saw_redirection,
    )
}

fn tokenize(text: &str) -> Vec<String> {
    let chars: Vec<char> = text.chars().collect();
    let mut tokens = Vec::new();
    let mut current = String::new();
    // Distinct from `current.is_empty()` so `""` survives as an empty arg.
    let mut has_token = false;
    let mut in_single = false;
    let mut in_double = false;

    let mut i = 0;
    while i < chars.len() {
        let c = chars[i];
        if in_single {
            if c == '\'' {
                in_single = false;
            } else {
                current.push(c);
            }
            i += 1;
            continue;
        }
        if in_double {
            match c {
                '"' => in_double = false,
                '\\' => {
                    if let Some(&next) = chars.get(i + 1) {
                        current.push(next);
                        i += 1;
                    } else {
                        current.push('\\');
                    }
                }
                _ => current.push(c),
            }
            i += 1;
            continue;
        }
        match c {
            ' ' | '\t' => {
                if has_token {
                    tokens.push(std::mem::take(&mut current));
                    has_token = false;
                }
            }
            '\'' => {
                in_single = true;
                has_token = true;
            }
            '"' => {
                in_double = true;
                has_token = true;
            }
            '\\' => {
                if let Some(&next) = chars.get(i + 1) {
                    current.push(next);
                    i += 1;
                } else {
                    current.push('\\');
                }
                has_token = true;
            }
            _ => {
                current.push(c);
                has_token = true;
            }
        }
        i += 1;
    }
    if has_token {
        tokens.push(current);
    }
    tokens
}

fn strip_redirections(tokens: Vec<String>) -> (Vec<String>, bool) {
    let mut out = Vec::new();
    let mut saw = false;
    let mut iter = tokens.into_iter().peekable();
    while let Some(token) = iter.next() {
        if is_redirection_operator(&token) {
            saw = true;
            // Drop the operator and its target.
            iter.next();
            continue;
        }
        if is_attached_redirection(&token) {
            saw = true;
            continue;
        }
        out.push(token);
    }
    (out, saw)
}

/// `>`, `>>`, `<`, `<<`, optionally prefixed by a file descriptor digit
/// (`2>`), taking their target as the following token.
fn is_redirection_operator(token: &str) -> bool {
    let rest = token.trim_start_matches(|c: char| c.is_ascii_digit());
    matches!(rest, ">" | ">>" | "<" | "<<")
}

/// A redirection with its target attached (`>out.txt`, `2>&1`, `<<EOF`).
fn is_attached_redirection(token: &str) -> bool {
    let rest = token.trim_start_matches(|c: char| c.is_ascii_digit());
    let Some(stripped) = rest
        .strip_prefix(">>")
        .or_else(|| rest.strip_prefix("<<"))
        .or_else(|| rest.strip_prefix('>'))
        .or_else(|| rest.strip_prefix('<'))
    else {
        return false;
    };
    !stripped.is_empty()
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]
    use pretty_assertions::assert_eq;

    use super::*;

    fn heads(parsed: &ParsedCommand) -> Vec<&str> {
        parsed.components.iter().map(|c| c.head.as_str()).collect()
    }

    #[test]
    fn simple_command_is_single_component() {
        let parsed = parse("git status");
        assert!(!parsed.is_complex());
        let component = parsed.single().unwrap();
        assert_eq!(component.head, "git");
        assert_eq!(component.args, vec!["status".to_string()]);
        assert!(parsed.error.is_none());
    }

    #[test]
    fn empty_input_parses_to_empty_command() {
        let parsed = parse("   ");
        assert!(parsed.components.is_empty());
        assert!(parsed.error.is_none());
        assert!(parsed.is_empty());
    }

    #[test]
    fn operators_split_components() {
        let parsed = parse("cd src && git status");
        assert_eq!(heads(&parsed), vec!["cd", "git"]);
        assert_eq!(parsed.separators, vec![Separator::And]);
        assert!(parsed.structure.logical_and);
        assert!(parsed.is_complex());
    }

    #[test]
    fn operators_inside_quotes_do_not_split() {
        let parsed = parse("grep \"a && b\" *.txt");
        assert!(!parsed.is_complex());
        let component = parsed.single().unwrap();
        assert_eq!(component.head, "grep");
        assert_eq!(component.args, vec!["a && b".to_string(), "*.txt".to_string()]);
    }

    #[test]
    fn pipe_and_or_and_sequence() {
        let parsed = parse("a | b || c ; d");
        assert_eq!(heads(&parsed), vec!["a", "b", "c", "d"]);
        assert_eq!(
            parsed.separators,
            vec![Separator::Pipe, Separator::Or, Separator::Sequential]
        );
        assert!(parsed.structure.pipe);
        assert!(parsed.structure.logical_or);
        assert!(parsed.structure.sequential);
    }

    #[test]
    fn lone_ampersand_is_background() {
        let parsed = parse("sleep 5 & echo hi");
        assert_eq!(heads(&parsed), vec!["sleep", "echo"]);
        assert!(parsed.structure.background);
    }

    #[test]
    fn trailing_ampersand_leaves_empty_component() {
        let parsed = parse("sleep 5 &");
        assert_eq!(heads(&parsed), vec!["sleep", ""]);
        assert!(parsed.structure.background);
    }

    #[test]
    fn newline_splits_like_semicolon() {
        let parsed = parse("echo a\necho b\r\necho c");
        assert_eq!(heads(&parsed), vec!["echo", "echo", "echo"]);
        assert!(parsed.structure.sequential);
        assert!(parsed.is_complex());
    }

    #[test]
    fn newline_inside_quotes_does_not_split() {
        let parsed = parse("echo \"a\nb\"");
        assert!(!parsed.is_complex());
        assert_eq!(parsed.single().unwrap().args, vec!["a\nb".to_string()]);
    }

    #[test]
    fn unclosed_quote_is_an_error() {
        let parsed = parse("echo \"oops");
        assert_eq!(parsed.error, Some(ParseError::UnclosedQuote));
    }

    #[test]
    fn unbalanced_substitution_is_an_error() {
        assert_eq!(
            parse("echo $(date").error,
            Some(ParseError::IncompleteSubstitution)
        );
        assert_eq!(
            parse("echo hi)").error,
            Some(ParseError::IncompleteSubstitution)
        );
    }

    #[test]
    fn substitution_is_recorded_and_recursed() {
        let parsed = parse("echo $(rm -rf /)");
        assert!(parsed.structure.substitution);
        assert!(parsed.is_complex());
        assert_eq!(parsed.substitutions.len(), 1);
        assert_eq!(
            parsed.command_names(),
            vec!["echo".to_string(), "rm".to_string()]
        );
    }

    #[test]
    fn nested_substitution_collects_all_names() {
        let parsed = parse("echo $(cat $(find . -name x))");
        assert_eq!(
            parsed.command_names(),
            vec!["echo".to_string(), "cat".to_string(), "find".to_string()]
        );
    }

    #[test]
    fn backtick_substitution_is_detected() {
        let parsed = parse("echo `whoami`");
        assert!(parsed.structure.substitution);
        assert_eq!(
            parsed.command_names(),
            vec!["echo".to_string(), "whoami".to_string()]
        );
    }

    #[test]
    fn operators_inside_substitution_do_not_split() {
        let parsed = parse("echo $(ls | wc -l)");
        assert_eq!(parsed.components.len(), 1);
        assert_eq!(parsed.substitutions[0].components.len(), 2);
    }

    #[test]
    fn redirection_does_not_make_command_complex() {
        let parsed = parse("wc -l < input.txt");
        assert!(!parsed.is_complex());
        assert!(parsed.structure.redirection);
        let component = parsed.single().unwrap();
        assert_eq!(component.head, "wc");
        assert_eq!(component.args, vec!["-l".to_string()]);
        assert_eq!(component.raw, "wc -l < input.txt");
    }

    #[test]
    fn attached_and_fd_redirections_are_stripped() {
        let parsed = parse("make test >build.log 2>&1");
        let component = parsed.single().unwrap();
        assert_eq!(component.head, "make");
        assert_eq!(component.args, vec!["test".to_string()]);
        assert!(parsed.structure.redirection);
        assert!(!parsed.structure.background);
    }

    #[test]
    fn escapes_outside_quotes_are_literal() {
        let parsed = parse("echo a\\&\\&b");
        assert!(!parsed.is_complex());
        assert_eq!(parsed.single().unwrap().args, vec!["a&&b".to_string()]);
    }

    #[test]
    fn backslash_in_double_quotes_escapes_next_char() {
        let parsed = parse("echo \"a\\\"b\"");
        assert_eq!(parsed.single().unwrap().args, vec!["a\"b".to_string()]);
    }

    #[test]
    fn backslash_in_single_quotes_is_literal() {
        let parsed = parse("echo 'a\\nb'");
        assert_eq!(parsed.single().unwrap().args, vec!["a\\nb".to_string()]);
    }

    #[test]
    fn empty_component_between_separators_is_retained() {
        let parsed = parse("a ; ; b");
        assert_eq!(heads(&parsed), vec!["a", "", "b"]);
    }

    #[test]
    fn leading_separator_yields_empty_first_component() {
        let parsed = parse("&& echo hi");
        assert_eq!(heads(&parsed), vec!["", "echo"]);
    }

    #[test]
    fn empty_quoted_string_survives_as_argument() {
        let parsed = parse("grep \"\" file");
        assert_eq!(
            parsed.single().unwrap().args,
            vec![String::new(), "file".to_string()]
        );
    }

    #[test]
    fn reassemble_reproduces_normalized_original() {
        for text in [
            "git status",
            "cd src && git status",
            "a | b || c ; d",
            "echo $(ls | wc -l) && pwd",
        ] {
            let parsed = parse(text);
            assert_eq!(parsed.reassemble(), normalize(text), "for {text:?}");
        }
    }
}
