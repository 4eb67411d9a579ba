//! Context window limits and the pinned system directive

use serde::{Deserialize, Serialize};

use crate::error::{ContextError, ContextResult};

/// Default number of user+assistant rounds kept in a prepared request.
pub const DEFAULT_MAX_TURNS: usize = 20;

/// Default character budget for a prepared request.
pub const DEFAULT_BUDGET_CHARS: usize = 12_000;

/// Bounds applied when preparing a model request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContextLimits {
    /// Maximum conversational rounds; one round is a user and an assistant message
    pub max_turns: usize,
    /// Maximum total characters across all prepared messages
    pub budget_chars: usize,
}

impl Default for ContextLimits {
    fn default() -> Self {
        Self {
            max_turns: DEFAULT_MAX_TURNS,
            budget_chars: DEFAULT_BUDGET_CHARS,
        }
    }
}

impl ContextLimits {
    pub fn new(max_turns: usize, budget_chars: usize) -> ContextResult<Self> {
        if max_turns == 0 {
            return Err(ContextError::InvalidLimits(
                "max_turns must be at least 1".to_string(),
            ));
        }
        Ok(Self {
            max_turns,
            budget_chars,
        })
    }

    /// Maximum number of non-system messages kept by turn capping.
    pub fn max_tail_messages(&self) -> usize {
        self.max_turns.saturating_mul(2)
    }
}

/// Optional pinned system instruction for a request
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SystemDirective {
    pub enabled: bool,
    pub text: String,
}

impl SystemDirective {
    pub fn new(enabled: bool, text: impl Into<String>) -> Self {
        Self {
            enabled,
            text: text.into(),
        }
    }

    pub fn disabled() -> Self {
        Self::default()
    }

    pub fn enabled(text: impl Into<String>) -> Self {
        Self::new(true, text)
    }

    /// The trimmed instruction, if enabled and not blank.
    pub fn effective_text(&self) -> Option<&str> {
        if !self.enabled {
            return None;
        }
        let text = self.text.trim();
        (!text.is_empty()).then_some(text)
    }
}
