//! Conversation history and the context-overflow compactor.
//!
//! The history is a system-message prefix followed by segments. A segment
//! opens at a real user message (not an agent-injected reminder, not a tool
//! result) and runs to the next one. On context overflow the compactor
//! strips reminders, then reduces every segment older than the most recent
//! K to its opening user message plus its final answer or tool result.

use std::ops::Range;

use crate::models::ChatMessage;
use crate::models::Role;

/// Agent-injected coaxing messages. Recognizable by prefix so the
/// compactor can strip them first.
pub const TOOL_REMINDER: &str = "Reminder: respond with exactly one tool invocation in the \
documented <tool><parameter>…</parameter></tool> form, or invoke <completion> when the task is \
done.";
pub const SCHEMA_REMINDER_PREFIX: &str =
    "Reminder: the final answer must be valid JSON matching the required schema";
pub const JSON_CORRECTION_PREFIX: &str =
    "Correction: your previous response did not satisfy the required response schema";
pub const DIAGRAM_FIX_PREFIX: &str =
    "Correction: the mermaid diagram in your previous response failed to parse";

const REMINDER_PREFIXES: &[&str] = &["Reminder:", "Correction:"];

/// Tool results are user-role messages wrapped in this envelope so segment
/// detection can tell them apart from real user input.
pub const TOOL_RESULT_OPEN: &str = "<tool_result";

/// Provider phrasings that indicate the conversation no longer fits the
/// context window. Heuristic and intentionally broad; extendable via
/// configuration because the exact set varies with provider version.
pub const CONTEXT_OVERFLOW_MARKERS: &[&str] = &[
    "context_length_exceeded",
    "prompt is too long",
    "maximum context length",
    "input token count exceeds",
    "tokens exceed",
    "too long",
    "over limit",
];

pub fn is_context_overflow(message: &str, extra_markers: &[String]) -> bool {
    let lowered = message.to_lowercase();
    CONTEXT_OVERFLOW_MARKERS
        .iter()
        .any(|marker| lowered.contains(marker))
        || extra_markers
            .iter()
            .any(|marker| lowered.contains(&marker.to_lowercase()))
}

pub fn is_internal_reminder(message: &ChatMessage) -> bool {
    message.role == Role::User
        && REMINDER_PREFIXES
            .iter()
            .any(|prefix| message.content.starts_with(prefix))
}

pub fn is_tool_result(message: &ChatMessage) -> bool {
    message.role == Role::User && message.content.trim_start().starts_with(TOOL_RESULT_OPEN)
}

fn is_segment_start(message: &ChatMessage) -> bool {
    message.role == Role::User && !is_internal_reminder(message) && !is_tool_result(message)
}

#[derive(Debug, Clone, Copy, Default)]
pub struct CloneOptions {
    pub strip_internal_reminders: bool,
    pub drop_system: bool,
}

#[derive(Debug, Clone, Default)]
pub struct ConversationHistory {
    /// Oldest first; the system message, when present, is index 0 and is
    /// never removed.
    messages: Vec<ChatMessage>,
}

impl ConversationHistory {
    pub fn new(system: impl Into<String>) -> Self {
        Self {
            messages: vec![ChatMessage::system(system)],
        }
    }

    pub fn messages(&self) -> &[ChatMessage] {
        &self.messages
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub fn push(&mut self, message: ChatMessage) {
        self.messages.push(message);
    }

    pub fn push_user(&mut self, content: impl Into<String>) {
        self.messages.push(ChatMessage::user(content));
    }

    pub fn push_assistant(&mut self, content: impl Into<String>) {
        self.messages.push(ChatMessage::assistant(content));
    }

    pub fn push_internal_reminder(&mut self, content: impl Into<String>) {
        self.messages.push(ChatMessage::user(content));
    }

    /// Tool results are appended as user-role messages, wrapped so they are
    /// distinguishable from real user input.
    pub fn push_tool_result(&mut self, tool: &str, output: &str) {
        self.messages.push(ChatMessage::user(format!(
            "<tool_result tool=\"{tool}\">\n{output}\n</tool_result>"
        )));
    }

    pub fn last_assistant_message(&self) -> Option<&str> {
        self.messages
            .iter()
            .rev()
            .find(|m| m.role == Role::Assistant)
            .map(|m| m.content.as_str())
    }

    /// Segment ranges over the message list. Messages before the first
    /// segment (the system prefix) belong to no segment.
    fn segments(&self) -> Vec<Range<usize>> {
        let mut out = Vec::new();
        let mut start: Option<usize> = None;
        for (i, message) in self.messages.iter().enumerate() {
            if is_segment_start(message) {
                if let Some(s) = start.take() {
                    out.push(s..i);
                }
                start = Some(i);
            }
        }
        if let Some(s) = start {
            out.push(s..self.messages.len());
        }
        out
    }

    pub fn strip_internal_reminders(&mut self) {
        self.messages.retain(|m| !is_internal_reminder(m));
    }

    /// Shrink old segments to (opening user message, final answer/result).
    /// The most recent `keep_recent` segments (minimum 1) stay whole; the
    /// system message is never touched. Returns how many messages were
    /// dropped — zero means compaction cannot help.
    pub fn compact(&mut self, keep_recent: usize) -> usize {
        let before = self.messages.len();
        self.strip_internal_reminders();

        let keep_recent = keep_recent.max(1);
        let segments = self.segments();
        if segments.len() > keep_recent {
            let cutoff = segments.len() - keep_recent;
            let mut keep = vec![true; self.messages.len()];
            for segment in &segments[..cutoff] {
                for i in segment.clone() {
                    keep[i] = false;
                }
                keep[segment.start] = true;
                if segment.end - segment.start > 1 {
                    keep[segment.end - 1] = true;
                }
            }
            let mut index = 0;
            self.messages.retain(|_| {
                let kept = keep[index];
                index += 1;
                kept
            });
        }
        before - self.messages.len()
    }

    /// Deep copy for branching a child agent off the current state without
    /// mutating the parent.
    pub fn clone_with(&self, options: CloneOptions) -> ConversationHistory {
        let messages = self
            .messages
            .iter()
            .filter(|m| {
                if options.drop_system && m.role == Role::System {
                    return false;
                }
                !(options.strip_internal_reminders && is_internal_reminder(m))
            })
            .cloned()
            .collect();
        ConversationHistory { messages }
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]
    use pretty_assertions::assert_eq;

    use super::*;

    /// 1 system message plus `segments` segments of
    /// user + `monologues` assistant messages + 1 tool result.
    fn history(segments: usize, monologues: usize) -> ConversationHistory {
        let mut h = ConversationHistory::new("system prompt");
        for s in 0..segments {
            h.push_user(format!("question {s}"));
            for m in 0..monologues {
                h.push_assistant(format!("thinking {s}.{m}"));
            }
            h.push_tool_result("search", &format!("result {s}"));
        }
        h
    }

    #[test]
    fn compaction_matches_expected_shape() {
        // 1 + 5×(1+3+1) = 26 messages; with K=1 the four old segments each
        // shrink to user+result: 1 + 4×2 + 5 = 14.
        let mut h = history(5, 3);
        assert_eq!(h.len(), 26);
        let dropped = h.compact(1);
        assert_eq!(h.len(), 14);
        assert_eq!(dropped, 12);

        // System message and every user question survive.
        assert_eq!(h.messages()[0].role, Role::System);
        for s in 0..5 {
            assert!(
                h.messages()
                    .iter()
                    .any(|m| m.content == format!("question {s}"))
            );
        }
        // Every final tool result survives.
        for s in 0..5 {
            assert!(h.messages().iter().any(|m| m.content.contains(&format!("result {s}"))));
        }
        // Old monologues are gone; the recent segment's are intact.
        assert!(!h.messages().iter().any(|m| m.content == "thinking 0.0"));
        assert!(h.messages().iter().any(|m| m.content == "thinking 4.0"));
    }

    #[test]
    fn keep_recent_is_at_least_one() {
        let mut h = history(3, 2);
        h.compact(0);
        // Most recent segment is whole even with keep_recent=0.
        assert!(h.messages().iter().any(|m| m.content == "thinking 2.1"));
    }

    #[test]
    fn compacting_a_compact_history_drops_nothing() {
        let mut h = history(2, 2);
        h.compact(1);
        let dropped = h.compact(1);
        assert_eq!(dropped, 0);
    }

    #[test]
    fn reminders_are_stripped_first() {
        let mut h = ConversationHistory::new("system");
        h.push_user("question");
        h.push_internal_reminder(TOOL_REMINDER);
        h.push_assistant("answer");
        h.compact(5);
        assert_eq!(h.len(), 3);
        assert!(!h.messages().iter().any(is_internal_reminder));
    }

    #[test]
    fn tool_results_do_not_open_segments() {
        let mut h = ConversationHistory::new("system");
        h.push_user("question");
        h.push_assistant("calling tool");
        h.push_tool_result("bash", "output");
        h.push_assistant("done");
        assert_eq!(h.segments(), vec![1..5]);
    }

    #[test]
    fn overflow_detection_is_substring_based() {
        assert!(is_context_overflow(
            "error: This model's maximum context length is 128000 tokens",
            &[]
        ));
        assert!(is_context_overflow("Prompt is too long: 210000 tokens", &[]));
        assert!(!is_context_overflow("rate limit exceeded", &[]));
        assert!(is_context_overflow(
            "E_WINDOW: conversation exceeds budget",
            &["e_window".to_string()]
        ));
    }

    #[test]
    fn clone_with_options_does_not_mutate_parent() {
        let mut h = ConversationHistory::new("system");
        h.push_user("question");
        h.push_internal_reminder(TOOL_REMINDER);

        let branched = h.clone_with(CloneOptions {
            strip_internal_reminders: true,
            drop_system: true,
        });
        assert_eq!(branched.len(), 1);
        assert_eq!(h.len(), 3);
    }
}
