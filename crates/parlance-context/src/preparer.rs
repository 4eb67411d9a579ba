//! Context preparation: system directive, turn capping and budget trimming

use std::fmt;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::history::{total_chars, Message};
use crate::window::{ContextLimits, SystemDirective};

/// Character totals measured around the budget-trimming stage
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrimReport {
    pub chars_before: usize,
    pub chars_after: usize,
}

impl TrimReport {
    pub fn untouched(chars: usize) -> Self {
        Self {
            chars_before: chars,
            chars_after: chars,
        }
    }

    pub fn was_trimmed(&self) -> bool {
        self.chars_before > self.chars_after
    }
}

impl fmt::Display for TrimReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "context trimmed: {} → {} chars",
            self.chars_before, self.chars_after
        )
    }
}

/// The exact message list to submit for one generation call
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PreparedContext {
    pub messages: Vec<Message>,
    pub report: TrimReport,
}

/// Builds bounded model requests from an unbounded history
#[derive(Debug, Clone, Copy, Default)]
pub struct ContextPreparer {
    limits: ContextLimits,
}

impl ContextPreparer {
    pub fn new(limits: ContextLimits) -> Self {
        Self { limits }
    }

    pub fn limits(&self) -> ContextLimits {
        self.limits
    }

    /// Apply the system directive, cap turns, then trim to the character budget.
    ///
    /// The history is only read; every stage works on a copy.
    pub fn prepare(&self, history: &[Message], directive: &SystemDirective) -> PreparedContext {
        let with_system = apply_system(history, directive);
        let capped = cap_turns(with_system, &self.limits);
        let (messages, report) = trim_to_budget(capped, self.limits.budget_chars);

        debug!(
            history = history.len(),
            prepared = messages.len(),
            chars_before = report.chars_before,
            chars_after = report.chars_after,
            "prepared context"
        );

        PreparedContext { messages, report }
    }
}

/// Replace any system messages with one built from the directive.
///
/// A disabled or blank directive leaves the messages untouched.
pub fn apply_system(messages: &[Message], directive: &SystemDirective) -> Vec<Message> {
    let Some(text) = directive.effective_text() else {
        return messages.to_vec();
    };

    std::iter::once(Message::system(text))
        .chain(messages.iter().filter(|m| !m.is_system()).cloned())
        .collect()
}

/// Keep the leading system message plus at most `2 * max_turns` of the newest others.
pub fn cap_turns(mut messages: Vec<Message>, limits: &ContextLimits) -> Vec<Message> {
    let head = usize::from(messages.first().is_some_and(Message::is_system));
    let tail_len = messages.len() - head;
    let max_tail = limits.max_tail_messages();

    if tail_len > max_tail {
        let excess = tail_len - max_tail;
        debug!(dropped = excess, "capping turns");
        messages.drain(head..head + excess);
    }
    messages
}

/// Drop the oldest non-system messages, two at a time, until the total fits `budget_chars`.
///
/// Removal never splits a message and never leaves the request empty, so a
/// single oversized message survives over budget.
pub fn trim_to_budget(mut messages: Vec<Message>, budget_chars: usize) -> (Vec<Message>, TrimReport) {
    let before = total_chars(&messages);
    if before <= budget_chars {
        return (messages, TrimReport::untouched(before));
    }

    let has_head = messages.first().is_some_and(Message::is_system);
    let head = usize::from(has_head);
    let floor = usize::from(!has_head);

    let mut total = before;
    let mut start = head;
    while total > budget_chars {
        let remaining = messages.len() - start;
        if remaining <= floor {
            break;
        }
        let step = remaining.min(2).min(remaining - floor);
        total -= total_chars(&messages[start..start + step]);
        start += step;
    }
    messages.drain(head..start);

    debug!(before, after = total, budget_chars, "trimmed context to budget");
    (
        messages,
        TrimReport {
            chars_before: before,
            chars_after: total,
        },
    )
}
