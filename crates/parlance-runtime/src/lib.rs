//! Runtime abstractions for generation backends.
//!
//! A backend turns a prepared message list into either a lazy stream of text
//! fragments (terminated by [`StreamChunk::Done`] carrying normalized metrics)
//! or a single complete [`Completion`].

use std::collections::VecDeque;
use std::pin::Pin;
use std::sync::Mutex;

use async_trait::async_trait;
use futures::stream::{self, Stream, StreamExt};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub mod backends;
pub mod config;
pub mod metrics;

pub use backends::local::{DecodeParams, LocalBackend, LocalModel, ModelCache, ModelKey, ModelLoader};
pub use backends::ollama::OllamaBackend;
pub use config::{BackendConfig, BackendKind};
pub use metrics::{DaemonTelemetry, GenerationMetrics, LocalTelemetry};
pub use parlance_context::{Message, Role};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StreamChunk {
    Delta { text: String },
    Done { metrics: GenerationMetrics },
}

/// Full text of a non-streaming generation plus its metrics
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Completion {
    pub text: String,
    pub metrics: GenerationMetrics,
}

pub type FragmentStream = Pin<Box<dyn Stream<Item = Result<StreamChunk, BackendError>> + Send>>;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum BackendError {
    #[error("transport error: {0}")]
    Transport(String),
    #[error("http status {status}: {body}")]
    HttpStatus { status: u16, body: String },
    #[error("decode error: {0}")]
    Decode(String),
    #[error("model load failed: {0}")]
    ModelLoad(String),
    #[error("generation failed: {0}")]
    Generation(String),
    #[error("background task failed: {0}")]
    TaskJoin(String),
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
    #[error("unsupported: {0}")]
    Unsupported(String),
    #[error("mock backend has no queued response")]
    MockQueueEmpty,
}

pub type BackendResult<T> = Result<T, BackendError>;

#[async_trait]
pub trait ChatBackend: Send + Sync {
    fn name(&self) -> &'static str;

    /// Stream fragments in generation order. The stream is single-use and ends
    /// with exactly one `Done` chunk unless an error is yielded first.
    async fn stream_generate(&self, messages: Vec<Message>) -> BackendResult<FragmentStream>;

    async fn generate_once(&self, messages: Vec<Message>) -> BackendResult<Completion>;
}

/// Drain a fragment stream into one completion.
///
/// Metrics stay unknown if the stream ends without a `Done` chunk.
pub async fn collect_stream(mut stream: FragmentStream) -> BackendResult<Completion> {
    let mut completion = Completion::default();
    while let Some(chunk) = stream.next().await {
        match chunk? {
            StreamChunk::Delta { text } => completion.text.push_str(&text),
            StreamChunk::Done { metrics } => completion.metrics = metrics,
        }
    }
    Ok(completion)
}

#[derive(Debug, Default)]
pub struct MockBackend {
    once_queue: Mutex<VecDeque<BackendResult<Completion>>>,
    stream_queue: Mutex<VecDeque<BackendResult<Vec<StreamChunk>>>>,
    stream_requests: Mutex<Vec<Vec<Message>>>,
    once_requests: Mutex<Vec<Vec<Message>>>,
}

impl MockBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn enqueue_once(&self, result: BackendResult<Completion>) {
        self.once_queue
            .lock()
            .expect("mock once queue poisoned")
            .push_back(result);
    }

    pub fn enqueue_stream(&self, result: BackendResult<Vec<StreamChunk>>) {
        self.stream_queue
            .lock()
            .expect("mock stream queue poisoned")
            .push_back(result);
    }

    /// Queue a stream of the given fragments followed by `Done`.
    pub fn enqueue_fragments(&self, fragments: &[&str], metrics: GenerationMetrics) {
        let mut chunks: Vec<StreamChunk> = fragments
            .iter()
            .map(|text| StreamChunk::Delta {
                text: (*text).to_string(),
            })
            .collect();
        chunks.push(StreamChunk::Done { metrics });
        self.enqueue_stream(Ok(chunks));
    }

    pub fn stream_requests(&self) -> Vec<Vec<Message>> {
        self.stream_requests
            .lock()
            .expect("mock request log poisoned")
            .clone()
    }

    pub fn once_requests(&self) -> Vec<Vec<Message>> {
        self.once_requests
            .lock()
            .expect("mock request log poisoned")
            .clone()
    }
}

#[async_trait]
impl ChatBackend for MockBackend {
    fn name(&self) -> &'static str {
        "mock"
    }

    async fn stream_generate(&self, messages: Vec<Message>) -> BackendResult<FragmentStream> {
        self.stream_requests
            .lock()
            .expect("mock request log poisoned")
            .push(messages);

        let next = self
            .stream_queue
            .lock()
            .expect("mock stream queue poisoned")
            .pop_front()
            .unwrap_or(Err(BackendError::MockQueueEmpty))?;

        Ok(Box::pin(stream::iter(next.into_iter().map(Ok))))
    }

    async fn generate_once(&self, messages: Vec<Message>) -> BackendResult<Completion> {
        self.once_requests
            .lock()
            .expect("mock request log poisoned")
            .push(messages);

        self.once_queue
            .lock()
            .expect("mock once queue poisoned")
            .pop_front()
            .unwrap_or(Err(BackendError::MockQueueEmpty))
    }
}
