//! Turn-taking over a generation backend
//!
//! One [`ChatSession`] owns one conversation. A turn appends the user
//! message, prepares a bounded request, streams the reply and, when the
//! stream produced no visible text, retries once through the
//! non-streaming path. Exactly one assistant message is appended per
//! successful turn.

use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::{Duration, Instant};

use futures::{Stream, StreamExt};
use parlance_context::{ContextPreparer, ConversationHistory, SystemDirective, TrimReport};
use parlance_runtime::{
    BackendResult, ChatBackend, Completion, FragmentStream, GenerationMetrics, StreamChunk,
};
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::error::{SessionError, SessionResult};
use crate::state::{SessionState, TurnState};

/// Assistant text recorded when neither generation path produced any.
pub const NO_RESPONSE_PLACEHOLDER: &str = "_(no response)_";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ResponsePath {
    Streamed,
    Fallback,
    Placeholder,
}

/// Result of one resolved user turn
#[derive(Debug, Clone, PartialEq)]
pub struct TurnOutcome {
    pub reply: String,
    pub path: ResponsePath,
    /// Number of non-empty fragments received from the stream
    pub fragments: usize,
    pub trim: TrimReport,
    pub metrics: GenerationMetrics,
    pub elapsed: Duration,
}

pub struct ChatSession {
    backend: Arc<dyn ChatBackend>,
    preparer: ContextPreparer,
    state: SessionState,
    turn: TurnState,
    turn_timeout: Option<Duration>,
}

impl ChatSession {
    pub fn new(backend: Arc<dyn ChatBackend>, preparer: ContextPreparer) -> Self {
        Self {
            backend,
            preparer,
            state: SessionState::default(),
            turn: TurnState::Idle,
            turn_timeout: None,
        }
    }

    /// Bound the generation part of every turn. Expiry drops the stream, which
    /// cancels any in-flight decoding.
    pub fn with_turn_timeout(mut self, timeout: Duration) -> Self {
        self.turn_timeout = Some(timeout);
        self
    }

    pub fn backend_name(&self) -> &'static str {
        self.backend.name()
    }

    pub fn preparer(&self) -> &ContextPreparer {
        &self.preparer
    }

    pub fn state(&self) -> TurnState {
        self.turn
    }

    pub fn history(&self) -> &ConversationHistory {
        &self.state.history
    }

    pub fn state_slots(&self) -> &SessionState {
        &self.state
    }

    pub fn reset(&mut self) {
        self.state.clear();
        self.turn = TurnState::Idle;
        debug!("session reset");
    }

    /// Prepare the current history and open a fragment stream over it.
    ///
    /// Records the trim report. While the stream is consumed, fragment text
    /// accumulates in `pending` and the metrics of the finished call land in
    /// `last_metrics`. The caller is responsible for appending the assistant
    /// turn.
    pub async fn generate_response(
        &mut self,
        directive: &SystemDirective,
    ) -> SessionResult<ResponseStream<'_>> {
        let prepared = self.preparer.prepare(self.state.history.as_slice(), directive);
        self.state.last_trim = Some(prepared.report);
        self.state.pending.clear();
        self.turn = TurnState::Streaming;

        let inner = self.backend.stream_generate(prepared.messages).await?;
        Ok(ResponseStream {
            inner,
            state: &mut self.state,
            completed: false,
        })
    }

    /// Re-run preparation and generate the whole reply in one call.
    ///
    /// Overwrites the trim report and the last metrics.
    pub async fn generate_once_fallback(
        &mut self,
        directive: &SystemDirective,
    ) -> SessionResult<Completion> {
        let prepared = self.preparer.prepare(self.state.history.as_slice(), directive);
        self.state.last_trim = Some(prepared.report);
        self.turn = TurnState::FallbackSynchronous;

        let completion = self.backend.generate_once(prepared.messages).await?;
        self.state.last_metrics = Some(completion.metrics);
        Ok(completion)
    }

    /// Run one full turn for `input`, forwarding each fragment to `on_fragment`.
    ///
    /// The user message is appended before generation starts and stays in the
    /// history if generation fails or times out; no assistant message is
    /// appended in that case.
    pub async fn submit<F>(
        &mut self,
        input: &str,
        directive: &SystemDirective,
        mut on_fragment: F,
    ) -> SessionResult<TurnOutcome>
    where
        F: FnMut(&str),
    {
        self.turn = TurnState::AwaitingInput;
        if input.trim().is_empty() {
            self.turn = TurnState::Idle;
            return Err(SessionError::EmptyInput);
        }

        self.state.history.push_user(input);
        self.state.pending.clear();
        self.turn = TurnState::Generating;
        let started = Instant::now();

        let result = match self.turn_timeout {
            Some(limit) => {
                match tokio::time::timeout(limit, self.resolve_turn(directive, &mut on_fragment)).await {
                    Ok(result) => result,
                    Err(_) => Err(SessionError::TimedOut(limit)),
                }
            }
            None => self.resolve_turn(directive, &mut on_fragment).await,
        };
        self.turn = TurnState::Idle;

        let (reply, path, fragments) = match result {
            Ok(resolved) => resolved,
            Err(err) => {
                warn!(backend = self.backend.name(), error = %err, "turn failed");
                return Err(err);
            }
        };

        self.state.history.push_assistant(reply.clone());
        self.state.pending.clear();

        let outcome = TurnOutcome {
            reply,
            path,
            fragments,
            trim: self.state.last_trim.unwrap_or_default(),
            metrics: self.state.last_metrics.unwrap_or_default(),
            elapsed: started.elapsed(),
        };
        info!(
            backend = self.backend.name(),
            path = ?outcome.path,
            chars = outcome.reply.chars().count(),
            elapsed_ms = outcome.elapsed.as_millis() as u64,
            "turn complete"
        );
        Ok(outcome)
    }

    async fn resolve_turn<F>(
        &mut self,
        directive: &SystemDirective,
        on_fragment: &mut F,
    ) -> SessionResult<(String, ResponsePath, usize)>
    where
        F: FnMut(&str),
    {
        let mut fragments = 0;
        {
            let mut stream = self.generate_response(directive).await?;
            while let Some(chunk) = stream.next().await {
                if let StreamChunk::Delta { text } = chunk? {
                    if !text.is_empty() {
                        fragments += 1;
                        on_fragment(&text);
                    }
                }
            }
        }

        if !self.state.pending.trim().is_empty() {
            let reply = std::mem::take(&mut self.state.pending);
            return Ok((reply, ResponsePath::Streamed, fragments));
        }

        warn!(
            backend = self.backend.name(),
            fragments, "stream produced no text, falling back to a single generation call"
        );
        let completion = self.generate_once_fallback(directive).await?;
        if completion.text.trim().is_empty() {
            Ok((NO_RESPONSE_PLACEHOLDER.to_string(), ResponsePath::Placeholder, fragments))
        } else {
            Ok((completion.text, ResponsePath::Fallback, fragments))
        }
    }
}

/// Fragment stream returned by [`ChatSession::generate_response`].
///
/// Yields the backend's chunks unchanged and records them into the session.
/// A stream that ends without a completion chunk records unknown metrics.
pub struct ResponseStream<'a> {
    inner: FragmentStream,
    state: &'a mut SessionState,
    completed: bool,
}

impl Stream for ResponseStream<'_> {
    type Item = BackendResult<StreamChunk>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = &mut *self;
        let polled = this.inner.poll_next_unpin(cx);
        match &polled {
            Poll::Ready(Some(Ok(StreamChunk::Delta { text }))) => this.state.pending.push_str(text),
            Poll::Ready(Some(Ok(StreamChunk::Done { metrics }))) => {
                this.state.last_metrics = Some(*metrics);
                this.completed = true;
            }
            Poll::Ready(None) if !this.completed => {
                this.state.last_metrics = Some(GenerationMetrics::default());
                this.completed = true;
            }
            _ => {}
        }
        polled
    }
}

impl std::fmt::Debug for ResponseStream<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResponseStream")
            .field("pending", &self.state.pending.len())
            .field("completed", &self.completed)
            .finish()
    }
}

impl std::fmt::Debug for ChatSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChatSession")
            .field("backend", &self.backend.name())
            .field("preparer", &self.preparer)
            .field("turn", &self.turn)
            .field("messages", &self.state.history.len())
            .finish()
    }
}
