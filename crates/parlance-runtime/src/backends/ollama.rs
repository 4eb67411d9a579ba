//! Local inference daemon backend
//!
//! Talks to an Ollama-compatible `/api/chat` endpoint. Streaming responses
//! are newline-delimited JSON objects; the final object carries `done: true`
//! and the daemon's token counts and nanosecond durations.

use std::time::Duration;

use async_trait::async_trait;
use bytes::BytesMut;
use futures::StreamExt;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, warn};

use crate::config::BackendConfig;
use crate::metrics::DaemonTelemetry;
use crate::{
    BackendError, BackendResult, ChatBackend, Completion, FragmentStream, Message, StreamChunk,
};

pub const DEFAULT_HOST: &str = "http://127.0.0.1:11434";
pub const DEFAULT_MODEL: &str = "Qwen2.5-7B-Instruct";
const CHAT_PATH: &str = "/api/chat";
const FRAGMENT_BUFFER: usize = 32;

#[derive(Debug, Clone)]
pub struct OllamaBackend {
    client: Client,
    host: String,
    pub model: String,
}

impl OllamaBackend {
    pub fn new(host: impl Into<String>, model: impl Into<String>) -> Self {
        // No overall request timeout: a streamed reply may legitimately run for minutes.
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .build()
            .expect("Failed to create HTTP client");

        Self {
            client,
            host: host.into(),
            model: model.into(),
        }
    }

    pub fn from_config(config: &BackendConfig) -> Self {
        Self::new(config.ollama_host.clone(), config.model.clone())
    }

    pub fn endpoint(&self, path: &str) -> String {
        format!("{}{}", self.host.trim_end_matches('/'), path)
    }

    fn payload(&self, messages: Vec<Message>, stream: bool) -> ChatRequest<'_> {
        ChatRequest {
            model: &self.model,
            messages,
            stream,
        }
    }

    async fn send(&self, payload: &ChatRequest<'_>) -> BackendResult<reqwest::Response> {
        let response = self
            .client
            .post(self.endpoint(CHAT_PATH))
            .json(payload)
            .send()
            .await
            .map_err(|err| BackendError::Transport(err.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(Self::parse_error_response(status, response).await);
        }
        Ok(response)
    }

    async fn parse_error_response(status: StatusCode, response: reqwest::Response) -> BackendError {
        let body = response
            .text()
            .await
            .unwrap_or_else(|_| "<unable to read body>".to_string());

        let parsed = serde_json::from_str::<ErrorEnvelope>(&body)
            .map(|envelope| envelope.error)
            .unwrap_or(body);

        BackendError::HttpStatus {
            status: status.as_u16(),
            body: parsed,
        }
    }
}

#[async_trait]
impl ChatBackend for OllamaBackend {
    fn name(&self) -> &'static str {
        "ollama"
    }

    async fn stream_generate(&self, messages: Vec<Message>) -> BackendResult<FragmentStream> {
        let payload = self.payload(messages, true);
        let response = self.send(&payload).await?;
        let mut body = response.bytes_stream();

        let (tx, rx) = mpsc::channel::<BackendResult<StreamChunk>>(FRAGMENT_BUFFER);
        tokio::spawn(async move {
            let mut lines = LineBuffer::default();
            let mut telemetry = None;

            loop {
                // A dropped consumer hangs up on the daemon even while it is silent.
                let next = tokio::select! {
                    _ = tx.closed() => {
                        debug!("stream consumer dropped; closing daemon stream");
                        return;
                    }
                    next = body.next() => next,
                };
                let Some(next) = next else { break };
                let bytes = match next {
                    Ok(bytes) => bytes,
                    Err(err) => {
                        let _ = tx.send(Err(BackendError::Transport(err.to_string()))).await;
                        return;
                    }
                };
                for line in lines.push(&bytes) {
                    if !forward_line(&line, &tx, &mut telemetry).await {
                        return;
                    }
                }
            }
            if let Some(line) = lines.finish() {
                if !forward_line(&line, &tx, &mut telemetry).await {
                    return;
                }
            }

            let metrics = match telemetry {
                Some(telemetry) => telemetry.normalize(),
                None => {
                    warn!("daemon stream ended without a completion chunk");
                    crate::GenerationMetrics::default()
                }
            };
            let _ = tx.send(Ok(StreamChunk::Done { metrics })).await;
        });

        Ok(Box::pin(ReceiverStream::new(rx)))
    }

    async fn generate_once(&self, messages: Vec<Message>) -> BackendResult<Completion> {
        let payload = self.payload(messages, false);
        let response = self.send(&payload).await?;

        let body: ChatChunk = response
            .json()
            .await
            .map_err(|err| BackendError::Decode(err.to_string()))?;
        if let Some(error) = body.error {
            return Err(BackendError::Generation(error));
        }

        Ok(Completion {
            text: body.delta().unwrap_or_default().to_string(),
            metrics: body.telemetry.normalize(),
        })
    }
}

/// Parse one NDJSON line and forward its delta. Returns `false` when the stream should stop.
async fn forward_line(
    line: &[u8],
    tx: &mpsc::Sender<BackendResult<StreamChunk>>,
    telemetry: &mut Option<DaemonTelemetry>,
) -> bool {
    let chunk = match ChatChunk::parse(line) {
        Ok(Some(chunk)) => chunk,
        Ok(None) => return true,
        Err(err) => {
            let _ = tx.send(Err(err)).await;
            return false;
        }
    };

    if let Some(error) = chunk.error {
        let _ = tx.send(Err(BackendError::Generation(error))).await;
        return false;
    }

    if let Some(text) = chunk.delta() {
        let delta = StreamChunk::Delta {
            text: text.to_string(),
        };
        if tx.send(Ok(delta)).await.is_err() {
            debug!("stream consumer dropped; closing daemon stream");
            return false;
        }
    }

    if chunk.done {
        *telemetry = Some(chunk.telemetry);
    }
    true
}

/// Splits a byte stream into newline-terminated records.
#[derive(Debug, Default)]
struct LineBuffer {
    buf: BytesMut,
}

impl LineBuffer {
    fn push(&mut self, bytes: &[u8]) -> Vec<BytesMut> {
        self.buf.extend_from_slice(bytes);
        let mut lines = Vec::new();
        while let Some(pos) = self.buf.iter().position(|b| *b == b'\n') {
            let mut line = self.buf.split_to(pos + 1);
            line.truncate(pos);
            lines.push(line);
        }
        lines
    }

    /// Whatever trails the last newline.
    fn finish(&mut self) -> Option<BytesMut> {
        (!self.buf.is_empty()).then(|| self.buf.split())
    }
}

#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<Message>,
    stream: bool,
}

/// One response object from the daemon, streaming or not.
#[derive(Debug, Deserialize)]
struct ChatChunk {
    #[serde(default)]
    message: Option<ChunkMessage>,
    /// Generate-style responses put the text here instead of `message`.
    #[serde(default)]
    response: Option<String>,
    #[serde(default)]
    done: bool,
    #[serde(default)]
    error: Option<String>,
    #[serde(flatten)]
    telemetry: DaemonTelemetry,
}

impl ChatChunk {
    fn parse(line: &[u8]) -> BackendResult<Option<Self>> {
        let line = line.trim_ascii();
        if line.is_empty() {
            return Ok(None);
        }
        serde_json::from_slice(line)
            .map(Some)
            .map_err(|err| BackendError::Decode(err.to_string()))
    }

    fn delta(&self) -> Option<&str> {
        self.message
            .as_ref()
            .map(|message| message.content.as_str())
            .filter(|text| !text.is_empty())
            .or_else(|| self.response.as_deref().filter(|text| !text.is_empty()))
    }
}

#[derive(Debug, Deserialize)]
struct ChunkMessage {
    #[serde(default)]
    content: String,
}

#[derive(Debug, Deserialize)]
struct ErrorEnvelope {
    error: String,
}

#[cfg(test)]
mod tests {
    use super::{ChatChunk, LineBuffer, OllamaBackend};
    use crate::{collect_stream, BackendError, ChatBackend, Message, StreamChunk};
    use futures::StreamExt;
    use httpmock::Method::POST;
    use httpmock::MockServer;
    use serde_json::json;

    fn request() -> Vec<Message> {
        vec![Message::system("be brief"), Message::user("Say hello")]
    }

    const FINAL_LINE: &str = "{\"model\":\"qwen\",\"message\":{\"role\":\"assistant\",\"content\":\"\"},\"done\":true,\"prompt_eval_count\":5,\"eval_count\":2,\"prompt_eval_duration\":1000000,\"eval_duration\":2000000,\"total_duration\":4000000}\n";

    #[test]
    fn endpoint_building() {
        let backend = OllamaBackend::new("http://localhost:11434/", "qwen");
        assert_eq!(backend.endpoint("/api/chat"), "http://localhost:11434/api/chat");
    }

    #[test]
    fn line_buffer_reassembles_split_records() {
        let mut buffer = LineBuffer::default();

        assert!(buffer.push(b"{\"a\":").is_empty());
        let lines = buffer.push(b"1}\n{\"b\":2}\n{\"c\"");

        assert_eq!(lines.len(), 2);
        assert_eq!(&lines[0][..], b"{\"a\":1}");
        assert_eq!(&lines[1][..], b"{\"b\":2}");
        assert_eq!(buffer.finish().as_deref(), Some(&b"{\"c\""[..]));
        assert!(buffer.finish().is_none());
    }

    #[test]
    fn chunk_prefers_message_content_and_falls_back_to_response() {
        let chat = ChatChunk::parse(br#"{"message":{"role":"assistant","content":"hi"}}"#)
            .unwrap()
            .unwrap();
        assert_eq!(chat.delta(), Some("hi"));

        let generate = ChatChunk::parse(br#"{"response":"yo","done":false}"#)
            .unwrap()
            .unwrap();
        assert_eq!(generate.delta(), Some("yo"));

        let empty = ChatChunk::parse(br#"{"message":{"role":"assistant","content":""},"done":true}"#)
            .unwrap()
            .unwrap();
        assert_eq!(empty.delta(), None);
        assert!(empty.done);

        assert!(ChatChunk::parse(b"  \r").unwrap().is_none());
    }

    #[tokio::test]
    async fn stream_generate_reads_ndjson_and_emits_deltas() {
        let server = MockServer::start_async().await;
        let body = format!(
            "{}{}{}",
            "{\"model\":\"qwen\",\"message\":{\"role\":\"assistant\",\"content\":\"Hel\"},\"done\":false}\n",
            "{\"model\":\"qwen\",\"message\":{\"role\":\"assistant\",\"content\":\"lo\"},\"done\":false}\n",
            FINAL_LINE,
        );
        let mock = server
            .mock_async(|when, then| {
                when.method(POST)
                    .path("/api/chat")
                    .body_includes("\"stream\":true")
                    .body_includes("\"model\":\"qwen\"")
                    .body_includes("\"role\":\"system\"");
                then.status(200)
                    .header("content-type", "application/x-ndjson")
                    .body(body);
            })
            .await;

        let backend = OllamaBackend::new(server.base_url(), "qwen");
        let mut stream = backend.stream_generate(request()).await.unwrap();

        let first = stream.next().await.unwrap().unwrap();
        let second = stream.next().await.unwrap().unwrap();
        let done = stream.next().await.unwrap().unwrap();

        mock.assert_async().await;
        assert_eq!(first, StreamChunk::Delta { text: "Hel".to_string() });
        assert_eq!(second, StreamChunk::Delta { text: "lo".to_string() });
        match done {
            StreamChunk::Done { metrics } => {
                assert_eq!(metrics.prompt_tokens, Some(5));
                assert_eq!(metrics.generated_tokens, Some(2));
                assert_eq!(metrics.ttft_ms, Some(1.0));
                assert_eq!(metrics.generation_ms, Some(2.0));
                assert_eq!(metrics.wall_ms, Some(4.0));
            }
            other => panic!("expected Done, got {other:?}"),
        }
        assert!(stream.next().await.is_none());
    }

    #[tokio::test]
    async fn stream_with_only_completion_chunk_yields_no_fragments() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(POST).path("/api/chat");
                then.status(200).body(FINAL_LINE);
            })
            .await;

        let backend = OllamaBackend::new(server.base_url(), "qwen");
        let stream = backend.stream_generate(request()).await.unwrap();
        let completion = collect_stream(stream).await.unwrap();

        assert!(completion.text.is_empty());
        assert_eq!(completion.metrics.generated_tokens, Some(2));
    }

    #[tokio::test]
    async fn stream_parses_final_line_without_trailing_newline() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(POST).path("/api/chat");
                then.status(200).body(concat!(
                    "{\"response\":\"ok\",\"done\":false}\n",
                    "{\"done\":true,\"eval_count\":1}"
                ));
            })
            .await;

        let backend = OllamaBackend::new(server.base_url(), "qwen");
        let stream = backend.stream_generate(request()).await.unwrap();
        let completion = collect_stream(stream).await.unwrap();

        assert_eq!(completion.text, "ok");
        assert_eq!(completion.metrics.generated_tokens, Some(1));
        assert_eq!(completion.metrics.prompt_tokens, None);
    }

    #[tokio::test]
    async fn stream_surfaces_in_band_daemon_error() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(POST).path("/api/chat");
                then.status(200).body(concat!(
                    "{\"message\":{\"role\":\"assistant\",\"content\":\"par\"},\"done\":false}\n",
                    "{\"error\":\"model runner crashed\"}\n"
                ));
            })
            .await;

        let backend = OllamaBackend::new(server.base_url(), "qwen");
        let stream = backend.stream_generate(request()).await.unwrap();
        let err = collect_stream(stream).await.unwrap_err();

        assert_eq!(err, BackendError::Generation("model runner crashed".to_string()));
    }

    #[tokio::test]
    async fn stream_reports_malformed_json_as_decode_error() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(POST).path("/api/chat");
                then.status(200).body("not json\n");
            })
            .await;

        let backend = OllamaBackend::new(server.base_url(), "qwen");
        let stream = backend.stream_generate(request()).await.unwrap();
        let err = collect_stream(stream).await.unwrap_err();

        assert!(matches!(err, BackendError::Decode(_)));
    }

    #[tokio::test]
    async fn generate_once_reads_single_response() {
        let server = MockServer::start_async().await;
        let mock = server
            .mock_async(|when, then| {
                when.method(POST)
                    .path("/api/chat")
                    .body_includes("\"stream\":false");
                then.status(200).json_body(json!({
                    "model": "qwen",
                    "message": {"role": "assistant", "content": "Hello there"},
                    "done": true,
                    "prompt_eval_count": 7,
                    "eval_count": 3,
                    "eval_duration": 3_000_000
                }));
            })
            .await;

        let backend = OllamaBackend::new(server.base_url(), "qwen");
        let completion = backend.generate_once(request()).await.unwrap();

        mock.assert_async().await;
        assert_eq!(completion.text, "Hello there");
        assert_eq!(completion.metrics.prompt_tokens, Some(7));
        assert_eq!(completion.metrics.generated_tokens, Some(3));
        assert_eq!(completion.metrics.generation_ms, Some(3.0));
        assert_eq!(completion.metrics.ttft_ms, None);
    }

    #[tokio::test]
    async fn non_success_status_maps_to_http_status_error() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(POST).path("/api/chat");
                then.status(404)
                    .json_body(json!({"error": "model 'missing' not found"}));
            })
            .await;

        let backend = OllamaBackend::new(server.base_url(), "missing");
        let err = backend.stream_generate(request()).await.err().unwrap();

        assert_eq!(
            err,
            BackendError::HttpStatus {
                status: 404,
                body: "model 'missing' not found".to_string()
            }
        );
    }

    #[tokio::test]
    async fn unreachable_daemon_is_a_transport_error() {
        let backend = OllamaBackend::new("http://127.0.0.1:1", "qwen");

        let err = backend.generate_once(request()).await.unwrap_err();

        assert!(matches!(err, BackendError::Transport(_)));
    }

    #[tokio::test]
    async fn dropping_the_stream_hangs_up_on_a_silent_daemon() {
        use std::time::Duration;
        use tokio::io::{AsyncReadExt, AsyncWriteExt};
        use tokio::net::TcpListener;

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let daemon = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut request = Vec::new();
            let mut buf = [0u8; 4096];
            while !request.windows(4).any(|w| w == b"\r\n\r\n") {
                let n = socket.read(&mut buf).await.unwrap();
                assert!(n > 0, "client closed before sending headers");
                request.extend_from_slice(&buf[..n]);
            }

            let line = "{\"message\":{\"role\":\"assistant\",\"content\":\"Hel\"},\"done\":false}\n";
            let response = format!(
                "HTTP/1.1 200 OK\r\ncontent-type: application/x-ndjson\r\ntransfer-encoding: chunked\r\n\r\n{:x}\r\n{}\r\n",
                line.len(),
                line
            );
            socket.write_all(response.as_bytes()).await.unwrap();

            // Never finish the body; wait for the client to close the connection.
            tokio::time::timeout(Duration::from_secs(3), async {
                loop {
                    match socket.read(&mut buf).await {
                        Ok(0) | Err(_) => break,
                        Ok(_) => continue,
                    }
                }
            })
            .await
            .is_ok()
        });

        let backend = OllamaBackend::new(format!("http://{addr}"), "qwen");
        let mut stream = backend.stream_generate(request()).await.unwrap();
        let first = stream.next().await.unwrap().unwrap();
        assert_eq!(
            first,
            StreamChunk::Delta {
                text: "Hel".to_string()
            }
        );

        drop(stream);

        assert!(daemon.await.unwrap(), "connection stayed open after the stream was dropped");
    }
}
