use std::sync::Arc;

use httpmock::prelude::*;
use parlance_context::{ContextLimits, ContextPreparer, ConversationHistory, Message, SystemDirective};
use parlance_runtime::{BackendError, OllamaBackend};
use parlance_session::{ChatSession, ResponsePath, SessionError, NO_RESPONSE_PLACEHOLDER};

fn ndjson(fragments: &[&str]) -> String {
    let mut body = String::new();
    for fragment in fragments {
        let chunk = serde_json::json!({
            "model": "qwen",
            "message": {"role": "assistant", "content": fragment},
            "done": false
        });
        body.push_str(&chunk.to_string());
        body.push('\n');
    }
    let done = serde_json::json!({
        "model": "qwen",
        "message": {"role": "assistant", "content": ""},
        "done": true,
        "prompt_eval_count": 18,
        "eval_count": fragments.len(),
        "prompt_eval_duration": 40_000_000u64,
        "eval_duration": 250_000_000u64,
        "total_duration": 310_000_000u64
    });
    body.push_str(&done.to_string());
    body.push('\n');
    body
}

fn session_for(server: &MockServer) -> ChatSession {
    let backend = Arc::new(OllamaBackend::new(server.base_url(), "qwen"));
    ChatSession::new(backend, ContextPreparer::default())
}

#[tokio::test]
async fn streamed_turns_build_up_the_conversation() {
    let server = MockServer::start_async().await;
    let mut first = server
        .mock_async(|when, then| {
            when.method(POST)
                .path("/api/chat")
                .body_includes("\"stream\":true")
                .body_includes("Capital of France?");
            then.status(200)
                .header("content-type", "application/x-ndjson")
                .body(ndjson(&["Par", "is."]));
        })
        .await;

    let mut session = session_for(&server);
    let directive = SystemDirective::enabled("Answer in one word.");
    let mut streamed = String::new();

    let outcome = session
        .submit("Capital of France?", &directive, |text| streamed.push_str(text))
        .await
        .unwrap();

    first.assert_async().await;
    first.delete_async().await;
    assert_eq!(outcome.path, ResponsePath::Streamed);
    assert_eq!(outcome.reply, "Paris.");
    assert_eq!(streamed, "Paris.");
    assert_eq!(outcome.fragments, 2);
    assert_eq!(outcome.metrics.prompt_tokens, Some(18));
    assert_eq!(outcome.metrics.generated_tokens, Some(2));
    assert_eq!(outcome.metrics.ttft_ms, Some(40.0));
    assert_eq!(
        outcome.metrics.summary().as_deref(),
        Some("18/2 tokens • TTFT 40 ms • gen 250 ms")
    );
    assert!(!outcome.trim.was_trimmed());

    let second = server
        .mock_async(|when, then| {
            when.method(POST)
                .path("/api/chat")
                .body_includes("\"role\":\"system\"")
                .body_includes("Paris.")
                .body_includes("And of Italy?");
            then.status(200).body(ndjson(&["Rome."]));
        })
        .await;

    let outcome = session
        .submit("And of Italy?", &directive, |_| {})
        .await
        .unwrap();

    second.assert_async().await;
    assert_eq!(outcome.reply, "Rome.");
    assert_eq!(
        session.history().as_slice(),
        &[
            Message::user("Capital of France?"),
            Message::assistant("Paris."),
            Message::user("And of Italy?"),
            Message::assistant("Rome."),
        ]
    );
}

#[tokio::test]
async fn empty_daemon_stream_uses_the_non_streaming_fallback() {
    let server = MockServer::start_async().await;
    let streaming = server
        .mock_async(|when, then| {
            when.method(POST)
                .path("/api/chat")
                .body_includes("\"stream\":true");
            then.status(200).body(ndjson(&[]));
        })
        .await;
    let fallback = server
        .mock_async(|when, then| {
            when.method(POST)
                .path("/api/chat")
                .body_includes("\"stream\":false");
            then.status(200).json_body(serde_json::json!({
                "model": "qwen",
                "message": {"role": "assistant", "content": "Recovered answer"},
                "done": true,
                "prompt_eval_count": 9,
                "eval_count": 2
            }));
        })
        .await;

    let mut session = session_for(&server);

    let outcome = session
        .submit("hello", &SystemDirective::disabled(), |_| {})
        .await
        .unwrap();

    streaming.assert_async().await;
    fallback.assert_hits_async(1).await;
    assert_eq!(outcome.path, ResponsePath::Fallback);
    assert_eq!(outcome.reply, "Recovered answer");
    assert_eq!(outcome.metrics.prompt_tokens, Some(9));
    assert_eq!(session.history().len(), 2);
}

#[tokio::test]
async fn empty_stream_and_empty_fallback_record_the_placeholder() {
    let server = MockServer::start_async().await;
    server
        .mock_async(|when, then| {
            when.method(POST)
                .path("/api/chat")
                .body_includes("\"stream\":true");
            then.status(200).body(ndjson(&[]));
        })
        .await;
    server
        .mock_async(|when, then| {
            when.method(POST)
                .path("/api/chat")
                .body_includes("\"stream\":false");
            then.status(200).json_body(serde_json::json!({
                "message": {"role": "assistant", "content": "   "},
                "done": true
            }));
        })
        .await;

    let mut session = session_for(&server);

    let outcome = session
        .submit("hello", &SystemDirective::disabled(), |_| {})
        .await
        .unwrap();

    assert_eq!(outcome.path, ResponsePath::Placeholder);
    assert_eq!(
        session.history().last(),
        Some(&Message::assistant(NO_RESPONSE_PLACEHOLDER))
    );
}

#[tokio::test]
async fn daemon_failure_surfaces_and_keeps_the_user_turn() {
    let server = MockServer::start_async().await;
    server
        .mock_async(|when, then| {
            when.method(POST).path("/api/chat");
            then.status(500)
                .json_body(serde_json::json!({"error": "out of memory"}));
        })
        .await;

    let mut session = session_for(&server);

    let err = session
        .submit("hello", &SystemDirective::disabled(), |_| {})
        .await
        .unwrap_err();

    assert_eq!(
        err,
        SessionError::Backend(BackendError::HttpStatus {
            status: 500,
            body: "out of memory".to_string()
        })
    );
    assert_eq!(session.history().as_slice(), &[Message::user("hello")]);
}

#[tokio::test]
async fn long_conversations_are_trimmed_before_sending() {
    let server = MockServer::start_async().await;
    server
        .mock_async(|when, then| {
            when.method(POST).path("/api/chat");
            then.status(200).body(ndjson(&["ok"]));
        })
        .await;

    let backend = Arc::new(OllamaBackend::new(server.base_url(), "qwen"));
    let limits = ContextLimits::new(20, 200).unwrap();
    let mut session = ChatSession::new(backend, ContextPreparer::new(limits));
    // Five rounds of 100 chars of user text plus a 2 char reply.
    for _ in 0..5 {
        session
            .submit(&"q".repeat(100), &SystemDirective::disabled(), |_| {})
            .await
            .unwrap();
    }

    let outcome = session
        .submit("latest question", &SystemDirective::disabled(), |_| {})
        .await
        .unwrap();

    assert!(outcome.trim.was_trimmed());
    assert_eq!(outcome.trim.chars_before, 5 * 102 + 15);
    assert_eq!(outcome.trim.chars_after, 102 + 15);
    assert_eq!(
        outcome.trim.to_string(),
        "context trimmed: 525 → 117 chars"
    );
    // Trimming only shapes the request; the stored history keeps every turn.
    assert_eq!(session.history().len(), 12);
}

#[tokio::test]
async fn exported_transcript_round_trips() {
    let server = MockServer::start_async().await;
    server
        .mock_async(|when, then| {
            when.method(POST).path("/api/chat");
            then.status(200).body(ndjson(&["Grüße ", "🌍"]));
        })
        .await;

    let mut session = session_for(&server);
    session
        .submit("Say hi", &SystemDirective::disabled(), |_| {})
        .await
        .unwrap();

    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("chat_history.json");
    session.history().export_to(&path).unwrap();

    let raw = std::fs::read_to_string(&path).unwrap();
    assert!(raw.contains("Grüße 🌍"));
    assert!(raw.starts_with("[\n  {"));

    let exported: serde_json::Value = serde_json::from_str(&raw).unwrap();
    assert_eq!(
        exported,
        serde_json::json!([
            {"role": "user", "content": "Say hi"},
            {"role": "assistant", "content": "Grüße 🌍"}
        ])
    );

    let reloaded = ConversationHistory::from_export_json(&raw).unwrap();
    assert_eq!(&reloaded, session.history());
}
