//! In-process model backend
//!
//! The model runtime itself is abstracted behind [`ModelLoader`] and
//! [`LocalModel`]. Decoding is blocking, so it runs on a worker thread and
//! hands fragments to the async side over a bounded channel. Dropping the
//! returned stream closes the channel, which stops the decode at its next
//! fragment.

use std::fmt;
use std::ops::ControlFlow;
use std::sync::Arc;
use std::time::Instant;

use async_stream::stream;
use async_trait::async_trait;
use tokio::sync::mpsc;
use tracing::debug;

use crate::metrics::LocalTelemetry;
use crate::{
    collect_stream, BackendError, BackendResult, ChatBackend, Completion, FragmentStream, Message,
    StreamChunk,
};

mod cache;

pub use cache::ModelCache;

pub const DEFAULT_MAX_NEW_TOKENS: usize = 256;
const FRAGMENT_BUFFER: usize = 32;

/// Identity of a loaded model: base weights, optional adapter, quantization.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ModelKey {
    pub base_model: String,
    pub adapter: Option<String>,
    pub quantize_4bit: bool,
}

impl ModelKey {
    pub fn new(base_model: impl Into<String>, adapter: Option<String>, quantize_4bit: bool) -> Self {
        Self {
            base_model: base_model.into(),
            adapter,
            quantize_4bit,
        }
    }
}

impl fmt::Display for ModelKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.base_model)?;
        if let Some(adapter) = &self.adapter {
            write!(f, "+{adapter}")?;
        }
        if self.quantize_4bit {
            f.write_str(" (4-bit)")?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DecodeParams {
    pub max_new_tokens: usize,
    /// Argmax decoding; sampling is not exposed.
    pub greedy: bool,
}

impl Default for DecodeParams {
    fn default() -> Self {
        Self {
            max_new_tokens: DEFAULT_MAX_NEW_TOKENS,
            greedy: true,
        }
    }
}

/// A loaded model. All methods block.
pub trait LocalModel: Send + Sync {
    /// Render messages through the model's chat template, ending with the
    /// assistant generation prompt.
    fn render_prompt(&self, messages: &[Message]) -> BackendResult<String>;

    fn count_tokens(&self, text: &str) -> u64;

    /// Decode new text after `prompt`, handing each fragment to `sink` with
    /// special tokens and the prompt already stripped. Stops early when
    /// `sink` returns `Break`.
    fn generate(
        &self,
        prompt: &str,
        params: &DecodeParams,
        sink: &mut dyn FnMut(String) -> ControlFlow<()>,
    ) -> BackendResult<()>;
}

pub trait ModelLoader: Send + Sync {
    fn load(&self, key: &ModelKey) -> BackendResult<Arc<dyn LocalModel>>;
}

#[derive(Debug, Clone)]
pub struct LocalBackend {
    cache: Arc<ModelCache>,
    key: ModelKey,
    params: DecodeParams,
}

impl LocalBackend {
    pub fn new(cache: Arc<ModelCache>, key: ModelKey) -> Self {
        Self {
            cache,
            key,
            params: DecodeParams::default(),
        }
    }

    pub fn with_max_new_tokens(mut self, max_new_tokens: usize) -> Self {
        self.params.max_new_tokens = max_new_tokens;
        self
    }

    pub fn key(&self) -> &ModelKey {
        &self.key
    }

    pub fn params(&self) -> DecodeParams {
        self.params
    }
}

fn join_error(err: tokio::task::JoinError) -> BackendError {
    BackendError::TaskJoin(err.to_string())
}

#[async_trait]
impl ChatBackend for LocalBackend {
    fn name(&self) -> &'static str {
        "local"
    }

    async fn stream_generate(&self, messages: Vec<Message>) -> BackendResult<FragmentStream> {
        let cache = Arc::clone(&self.cache);
        let key = self.key.clone();
        let (model, prompt, prompt_tokens) = tokio::task::spawn_blocking(move || {
            let model = cache.get_or_load(&key)?;
            let prompt = model.render_prompt(&messages)?;
            let prompt_tokens = model.count_tokens(&prompt);
            Ok::<_, BackendError>((model, prompt, prompt_tokens))
        })
        .await
        .map_err(join_error)??;

        let (tx, mut rx) = mpsc::channel::<String>(FRAGMENT_BUFFER);
        let params = self.params;
        let decoder = Arc::clone(&model);
        let started = Instant::now();
        let producer = tokio::task::spawn_blocking(move || {
            decoder.generate(&prompt, &params, &mut |fragment: String| {
                if tx.blocking_send(fragment).is_err() {
                    ControlFlow::Break(())
                } else {
                    ControlFlow::Continue(())
                }
            })
        });

        let fragments = stream! {
            let mut first_fragment = None;
            let mut produced = String::new();

            while let Some(fragment) = rx.recv().await {
                if fragment.is_empty() {
                    continue;
                }
                first_fragment.get_or_insert_with(|| started.elapsed());
                produced.push_str(&fragment);
                yield Ok::<_, BackendError>(StreamChunk::Delta { text: fragment });
            }

            // The producer has dropped its sender; wait for it so the finish
            // timestamp covers the whole decode.
            match producer.await.map_err(join_error) {
                Ok(Ok(())) => {}
                Ok(Err(err)) | Err(err) => {
                    yield Err(err);
                    return;
                }
            }
            let wall = started.elapsed();
            let generated_tokens = model.count_tokens(&produced);
            debug!(prompt_tokens, generated_tokens, "local decode finished");

            let telemetry = LocalTelemetry {
                prompt_tokens: Some(prompt_tokens),
                generated_tokens: Some(generated_tokens),
                first_fragment,
                generation: first_fragment.map(|ttft| wall.saturating_sub(ttft)),
                wall: Some(wall),
            };
            yield Ok(StreamChunk::Done { metrics: telemetry.normalize() });
        };

        Ok(Box::pin(fragments))
    }

    async fn generate_once(&self, messages: Vec<Message>) -> BackendResult<Completion> {
        let stream = self.stream_generate(messages).await?;
        collect_stream(stream).await
    }
}
