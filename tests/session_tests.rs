//! External tests for the stream session: chunk-boundary invariance,
//! malformed-record tolerance and exactly-once finalization.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use proptest::prelude::*;
use tokio_util::sync::CancellationToken;

use turnstream::accumulator::ImageResolver;
use turnstream::conversation::Message;
use turnstream::error::{ChatError, Result};
use turnstream::protocol::ChatRequest;
use turnstream::session::{ByteStream, MessageSink, SessionState, StreamSession, StreamTransport};

// -- Helpers ----------------------------------------------------------------

#[derive(Default)]
struct Collect(Mutex<Vec<Message>>);

impl MessageSink for Collect {
    fn append_message(&self, _conversation_id: &str, message: Message) {
        self.0.lock().unwrap().push(message);
    }
}

/// Serves a fixed body split at the given offsets.
struct Chunked {
    body: Vec<u8>,
    cuts: Vec<usize>,
    fail_at_end: bool,
}

#[async_trait]
impl StreamTransport for Chunked {
    async fn open(&self, _request: &ChatRequest) -> Result<ByteStream> {
        let mut offsets: Vec<usize> = self.cuts.iter().map(|c| c % (self.body.len() + 1)).collect();
        offsets.sort_unstable();
        let mut chunks: Vec<Result<Vec<u8>>> = Vec::new();
        let mut start = 0;
        for off in offsets {
            chunks.push(Ok(self.body[start..off].to_vec()));
            start = off;
        }
        chunks.push(Ok(self.body[start..].to_vec()));
        if self.fail_at_end {
            chunks.push(Err(ChatError::Transport("connection reset by peer".into())));
        }
        Ok(Box::pin(tokio_stream::iter(chunks)))
    }
}

fn request() -> ChatRequest {
    ChatRequest {
        conversation_id: Some("c".into()),
        model: "deepseek-chat".into(),
        system_prompt: "sys".into(),
        client_id: "me".into(),
        messages: vec![],
        message: "q".into(),
        attachments: vec![],
        regenerate_message_id: None,
    }
}

fn record(kind: &str, content: &str) -> String {
    format!("data: {}\n", serde_json::json!({ "type": kind, "content": content }))
}

async fn run(body: &str, cuts: Vec<usize>, fail_at_end: bool) -> (SessionState, Vec<Message>) {
    let transport = Chunked {
        body: body.as_bytes().to_vec(),
        cuts,
        fail_at_end,
    };
    let sink = Collect::default();
    let session = StreamSession::new("c", ImageResolver::new("http://img"), CancellationToken::new());
    let outcome = session.run(&transport, &request(), &sink).await;
    let appended = sink.0.into_inner().unwrap();
    (outcome.state, appended)
}

fn runtime() -> tokio::runtime::Runtime {
    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .unwrap()
}

// -- Scenarios ----------------------------------------------------------------

#[tokio::test]
async fn test_hello_world_in_three_chunks() {
    let body = format!("{}{}{}", record("content", "Hello"), record("content", " world"), record("done", ""));
    let (state, msgs) = run(&body, vec![5, 31], false).await;
    assert_eq!(state, SessionState::Completed);
    assert_eq!(msgs.len(), 1);
    assert_eq!(msgs[0].content, "Hello world");
}

#[tokio::test]
async fn test_reasoning_and_context_land_on_message() {
    let body = format!(
        "{}{}data: {}\n{}",
        record("reasoning", "thinking..."),
        record("content", "answer"),
        serde_json::json!({
            "type": "context",
            "content": [{ "fileName": "a.pdf", "similarity": 0.5, "content": "snippet" }]
        }),
        record("done", "")
    );
    let (_, msgs) = run(&body, vec![], false).await;
    assert_eq!(msgs[0].reasoning_content.as_deref(), Some("thinking..."));
    assert_eq!(msgs[0].context.len(), 1);
    assert_eq!(msgs[0].context[0].file_name, "a.pdf");
}

#[tokio::test]
async fn test_exactly_once_on_every_terminal_path() {
    let done = format!("{}{}", record("content", "x"), record("done", ""));
    let error = format!("{}{}", record("content", "x"), record("error", "boom"));
    let closed = record("content", "x");

    for (body, fail, expected) in [
        (done.as_str(), false, SessionState::Completed),
        (error.as_str(), false, SessionState::Errored),
        (closed.as_str(), false, SessionState::Completed),
        (closed.as_str(), true, SessionState::Errored),
    ] {
        let (state, msgs) = run(body, vec![3], fail).await;
        assert_eq!(state, expected, "body {body:?}");
        assert_eq!(msgs.len(), 1, "body {body:?}");
    }
}

#[tokio::test]
async fn test_cancel_mid_stream_appends_once() {
    struct Stalling;

    #[async_trait]
    impl StreamTransport for Stalling {
        async fn open(&self, _request: &ChatRequest) -> Result<ByteStream> {
            let head = tokio_stream::iter(vec![Ok(record("content", "Hel").into_bytes())]);
            Ok(Box::pin(tokio_stream::StreamExt::chain(head, futures_util::stream::pending())))
        }
    }

    let sink = Arc::new(Collect::default());
    let session = StreamSession::new("c", ImageResolver::new("http://img"), CancellationToken::new());
    let cancel = session.cancellation_token();
    let mut draft = session.subscribe_draft();
    let task = {
        let sink = sink.clone();
        tokio::spawn(async move { session.run(&Stalling, &request(), sink.as_ref()).await })
    };
    draft.wait_for(|d| d.content == "Hel").await.unwrap();
    cancel.cancel();
    let outcome = task.await.unwrap();

    assert_eq!(outcome.state, SessionState::Aborted);
    let msgs = sink.0.lock().unwrap();
    assert_eq!(msgs.len(), 1);
    assert_eq!(msgs[0].content, "Hel");
    assert!(msgs[0].interrupted);
}

// -- Properties ----------------------------------------------------------------

proptest! {
    #[test]
    fn prop_chunk_boundaries_do_not_change_result(
        deltas in proptest::collection::vec("[a-zA-Z0-9 éü🦀\"\\\\]{0,8}", 1..6),
        cuts in proptest::collection::vec(0usize..400, 0..12),
    ) {
        let mut body = String::new();
        for d in &deltas {
            body.push_str(&record("content", d));
        }
        body.push_str(&record("done", ""));

        let rt = runtime();
        let (whole_state, whole) = rt.block_on(run(&body, vec![], false));
        let (split_state, split) = rt.block_on(run(&body, cuts, false));

        prop_assert_eq!(whole_state, SessionState::Completed);
        prop_assert_eq!(split_state, SessionState::Completed);
        prop_assert_eq!(&whole[0].content, &deltas.concat());
        prop_assert_eq!(&split[0].content, &whole[0].content);
    }

    #[test]
    fn prop_malformed_records_do_not_change_content(
        deltas in proptest::collection::vec("[a-z ]{1,6}", 1..5),
        junk in proptest::collection::vec(
            prop_oneof![
                Just("data: {not json".to_string()),
                Just("data: {\"type\":\"bogus\",\"content\":1}".to_string()),
                Just("data: {\"type\":\"content\",\"content\":[1,2]}".to_string()),
                Just(": keep-alive".to_string()),
                Just(String::new()),
            ],
            0..6,
        ),
    ) {
        let mut clean = String::new();
        let mut noisy = String::new();
        for (i, d) in deltas.iter().enumerate() {
            let rec = record("content", d);
            clean.push_str(&rec);
            noisy.push_str(&rec);
            if let Some(j) = junk.get(i) {
                noisy.push_str(j);
                noisy.push('\n');
            }
        }
        clean.push_str(&record("done", ""));
        noisy.push_str(&record("done", ""));

        let rt = runtime();
        let (_, a) = rt.block_on(run(&clean, vec![], false));
        let (_, b) = rt.block_on(run(&noisy, vec![], false));
        prop_assert_eq!(&a[0].content, &b[0].content);
        prop_assert_eq!(&a[0].reasoning_content, &b[0].reasoning_content);
    }
}
