//! External tests for the HTTP backend against a throwaway loopback server
//! that answers one canned response per connection.

use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tokio_stream::StreamExt;

use turnstream::backend::{ConversationBackend, HttpBackend};
use turnstream::conversation::Role;
use turnstream::error::ChatError;
use turnstream::protocol::ChatRequest;
use turnstream::session::StreamTransport;

/// A captured request: head (request line + headers) and body.
struct Seen {
    head: String,
    body: String,
}

/// Serve `response` to the first connection and report what was received.
async fn serve_once(response: &'static str) -> (String, oneshot::Receiver<Seen>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let base = format!("http://{}", listener.local_addr().unwrap());
    let (tx, rx) = oneshot::channel();
    tokio::spawn(async move {
        let (mut stream, _) = listener.accept().await.unwrap();
        let mut buf = Vec::new();
        let mut chunk = [0u8; 4096];
        let (head, body) = loop {
            let n = stream.read(&mut chunk).await.unwrap();
            buf.extend_from_slice(&chunk[..n]);
            let text = String::from_utf8_lossy(&buf).into_owned();
            if let Some(split) = text.find("\r\n\r\n") {
                let head = text[..split].to_string();
                let want = head
                    .lines()
                    .find_map(|l| {
                        let (k, v) = l.split_once(':')?;
                        k.eq_ignore_ascii_case("content-length")
                            .then(|| v.trim().parse::<usize>().ok())?
                    })
                    .unwrap_or(0);
                let body = text[split + 4..].to_string();
                if body.len() >= want || n == 0 {
                    break (head, body);
                }
            }
            if n == 0 {
                break (text, String::new());
            }
        };
        stream.write_all(response.as_bytes()).await.unwrap();
        let _ = stream.shutdown().await;
        let _ = tx.send(Seen { head, body });
    });
    (base, rx)
}

fn request() -> ChatRequest {
    ChatRequest {
        conversation_id: Some("c1".into()),
        model: "deepseek-chat".into(),
        system_prompt: "You are a helpful assistant".into(),
        client_id: "me".into(),
        messages: vec![],
        message: "hello".into(),
        attachments: vec![],
        regenerate_message_id: None,
    }
}

fn backend(base: &str) -> HttpBackend {
    HttpBackend::builder(base)
        .connect_timeout(Duration::from_secs(2))
        .request_timeout(Duration::from_secs(5))
        .build()
}

// -- Streaming ----------------------------------------------------------------

#[tokio::test]
async fn test_stream_posts_json_and_yields_body_bytes() {
    let (base, seen) = serve_once(
        "HTTP/1.1 200 OK\r\nContent-Type: text/event-stream\r\nConnection: close\r\n\r\n\
         data: {\"type\":\"content\",\"content\":\"Hi\"}\n\ndata: {\"type\":\"done\"}\n\n",
    )
    .await;
    let b = backend(&base);
    let mut stream = b.open(&request()).await.unwrap();
    let mut body = Vec::new();
    while let Some(chunk) = stream.next().await {
        body.extend(chunk.unwrap());
    }
    let text = String::from_utf8(body).unwrap();
    assert!(text.contains("\"content\":\"Hi\""));
    assert!(text.contains("\"type\":\"done\""));

    let seen = seen.await.unwrap();
    let head = seen.head.to_ascii_lowercase();
    assert!(head.starts_with("post /api/chat/send"), "head: {head}");
    assert!(head.contains("accept: text/event-stream"));
    assert!(head.contains("cache-control: no-cache"));
    let json: serde_json::Value = serde_json::from_str(&seen.body).unwrap();
    assert_eq!(json["message"], "hello");
    assert_eq!(json["conversation_id"], "c1");
    assert_eq!(json["client_id"], "me");
}

#[tokio::test]
async fn test_stream_non_success_is_http_error_with_status() {
    let (base, _seen) = serve_once(
        "HTTP/1.1 503 Service Unavailable\r\nContent-Length: 10\r\nConnection: close\r\n\r\noverloaded",
    )
    .await;
    match backend(&base).open(&request()).await {
        Err(ChatError::Http { status, body }) => {
            assert_eq!(status, 503);
            assert_eq!(body, "overloaded");
        }
        Err(other) => panic!("expected http error, got {other:?}"),
        Ok(_) => panic!("expected http error, got a stream"),
    }
}

// -- Persistence ----------------------------------------------------------------

#[tokio::test]
async fn test_list_conversations_parses_summaries() {
    let (base, seen) = serve_once(
        "HTTP/1.1 200 OK\r\nContent-Type: application/json\r\nConnection: close\r\n\r\n\
         {\"conversations\":[{\"conversation_id\":\"a\",\"created_at\":1.5,\"summary\":\"Solar\",\"message_count\":4}]}",
    )
    .await;
    let list = backend(&base).list_conversations().await.unwrap();
    assert_eq!(list.len(), 1);
    assert_eq!(list[0].id, "a");
    assert_eq!(list[0].summary.as_deref(), Some("Solar"));
    assert_eq!(list[0].message_count, 4);
    assert!(seen.await.unwrap().head.starts_with("GET /conversations "));
}

#[tokio::test]
async fn test_get_conversation_maps_messages() {
    let (base, seen) = serve_once(
        "HTTP/1.1 200 OK\r\nContent-Type: application/json\r\nConnection: close\r\n\r\n\
         {\"messages\":[{\"message_id\":\"m1\",\"role\":\"user\",\"content\":\"q\"},{\"message_id\":\"m2\",\"role\":\"assistant\",\"content\":\"a\"}]}",
    )
    .await;
    let msgs = backend(&base).get_conversation("c9").await.unwrap();
    assert_eq!(msgs.len(), 2);
    assert_eq!(msgs[0].id, "m1");
    assert_eq!(msgs[1].role, Role::Assistant);
    assert!(seen.await.unwrap().head.starts_with("GET /conversations/c9 "));
}

#[tokio::test]
async fn test_create_conversation_returns_id() {
    let (base, seen) = serve_once(
        "HTTP/1.1 200 OK\r\nContent-Type: application/json\r\nConnection: close\r\n\r\n{\"conversation_id\":\"new-1\"}",
    )
    .await;
    assert_eq!(backend(&base).create_conversation().await.unwrap(), "new-1");
    assert!(seen.await.unwrap().head.starts_with("POST /create_conversation "));
}

#[tokio::test]
async fn test_edit_message_puts_content() {
    let (base, seen) = serve_once("HTTP/1.1 200 OK\r\nContent-Length: 2\r\nConnection: close\r\n\r\n{}").await;
    backend(&base).edit_message("m5", "fixed").await.unwrap();
    let seen = seen.await.unwrap();
    assert!(seen.head.starts_with("PUT /messages/m5 "));
    let json: serde_json::Value = serde_json::from_str(&seen.body).unwrap();
    assert_eq!(json["content"], "fixed");
}

#[tokio::test]
async fn test_delete_failure_is_backend_error() {
    let (base, _seen) = serve_once(
        "HTTP/1.1 404 Not Found\r\nContent-Length: 9\r\nConnection: close\r\n\r\nNot Found",
    )
    .await;
    let err = backend(&base).delete_conversation("gone").await.unwrap_err();
    assert_eq!(err.kind(), "backend");
    assert!(err.to_string().contains("404"), "{err}");
}

#[tokio::test]
async fn test_unexpected_json_is_json_error() {
    let (base, _seen) = serve_once(
        "HTTP/1.1 200 OK\r\nContent-Type: application/json\r\nConnection: close\r\n\r\n[1,2,3]",
    )
    .await;
    let err = backend(&base).create_conversation().await.unwrap_err();
    assert_eq!(err.kind(), "json");
}
