//! Parlance Context Management - conversation history and request preparation
//!
//! This crate provides:
//! - Conversation history and its JSON export format
//! - Context limits (turn cap and character budget)
//! - The context preparer that turns an unbounded history into a bounded request

pub mod error;
pub mod history;
pub mod preparer;
pub mod window;

pub use error::{ContextError, ContextResult};
pub use history::{total_chars, ConversationHistory, Message, Role};
pub use preparer::{ContextPreparer, PreparedContext, TrimReport};
pub use window::{ContextLimits, SystemDirective, DEFAULT_BUDGET_CHARS, DEFAULT_MAX_TURNS};

/// Prelude for common imports
pub mod prelude {
    pub use crate::error::{ContextError, ContextResult};
    pub use crate::history::{ConversationHistory, Message, Role};
    pub use crate::preparer::{ContextPreparer, PreparedContext, TrimReport};
    pub use crate::window::{ContextLimits, SystemDirective};
}
