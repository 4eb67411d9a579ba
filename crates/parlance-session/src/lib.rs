//! Parlance Session - turn-taking protocol over a generation backend
//!
//! A [`ChatSession`] appends the user turn, prepares a bounded request,
//! streams the reply, falls back to a single non-streaming call when the
//! stream yields no text, and appends exactly one assistant turn.

pub mod error;
pub mod session;
pub mod state;

pub use error::{SessionError, SessionResult};
pub use session::{
    ChatSession, ResponsePath, ResponseStream, TurnOutcome, NO_RESPONSE_PLACEHOLDER,
};
pub use state::{SessionState, TurnState};
