use std::time::Duration;

use parlance_runtime::BackendError;
use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SessionError {
    #[error("input is empty")]
    EmptyInput,
    #[error(transparent)]
    Backend(#[from] BackendError),
    #[error("turn timed out after {0:?}")]
    TimedOut(Duration),
}

pub type SessionResult<T> = Result<T, SessionError>;
