//! Per-session state slots and the turn state machine.

use parlance_context::{ConversationHistory, TrimReport};
use parlance_runtime::GenerationMetrics;
use serde::Serialize;

/// Everything a chat session keeps between turns.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SessionState {
    pub history: ConversationHistory,
    /// Report from the most recent context preparation
    pub last_trim: Option<TrimReport>,
    /// Metrics from the most recent completed generation call
    pub last_metrics: Option<GenerationMetrics>,
    /// Text received so far from an in-flight stream
    pub pending: String,
}

impl SessionState {
    pub fn clear(&mut self) {
        self.history.clear();
        self.last_trim = None;
        self.last_metrics = None;
        self.pending.clear();
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TurnState {
    #[default]
    Idle,
    AwaitingInput,
    Generating,
    Streaming,
    FallbackSynchronous,
}
