//! # Stage: Event Decoder
//!
//! ## Responsibility
//! Parse one complete record line into a [`StreamEvent`].
//!
//! ## Guarantees
//! - Lines without the `data:` prefix are noise (keep-alives, SSE comments,
//!   `event:`/`id:` fields) and yield `None` silently.
//! - Prefixed lines whose payload does not parse yield `None` and are logged
//!   once at `warn`. Nothing here returns an error to the session.

use tracing::{trace, warn};

use crate::error::ChatError;
use crate::protocol::{RawRecord, StreamEvent, DONE_SENTINEL, RECORD_PREFIX};

/// Decode a record, dropping noise and malformed payloads.
pub fn decode(line: &str) -> Option<StreamEvent> {
    let payload = match line.strip_prefix(RECORD_PREFIX) {
        Some(rest) => rest.trim(),
        None => {
            if !line.trim().is_empty() {
                trace!(line, "ignoring non-record line");
            }
            return None;
        }
    };
    if payload.is_empty() {
        return None;
    }
    match parse_payload(payload) {
        Ok(event) => Some(event),
        Err(e) => {
            warn!(error = %e, record = payload, "dropping malformed stream record");
            None
        }
    }
}

/// Strict form of [`decode`]'s payload handling. Exposed for callers that
/// want to count or inspect rejects.
pub fn parse_payload(payload: &str) -> Result<StreamEvent, ChatError> {
    if payload == DONE_SENTINEL {
        return Ok(StreamEvent::Done);
    }
    let raw: RawRecord = serde_json::from_str(payload).map_err(|e| parse_error(payload, e))?;
    let content = raw.content;
    let event = match raw.kind.as_str() {
        "content" => StreamEvent::Content(text(content, payload)?),
        "reasoning" => StreamEvent::Reasoning(text(content, payload)?),
        "context" => StreamEvent::Context(
            serde_json::from_value(content).map_err(|e| parse_error(payload, e))?,
        ),
        "image" => StreamEvent::Image(
            serde_json::from_value(content).map_err(|e| parse_error(payload, e))?,
        ),
        "error" => StreamEvent::Error(match content {
            serde_json::Value::String(s) => s,
            serde_json::Value::Null => "unknown error".to_string(),
            other => other.to_string(),
        }),
        "done" => StreamEvent::Done,
        other => {
            return Err(ChatError::StreamParse {
                detail: format!("unknown record type '{other}'"),
                record: payload.to_string(),
            })
        }
    };
    Ok(event)
}

fn text(content: serde_json::Value, payload: &str) -> Result<String, ChatError> {
    match content {
        serde_json::Value::String(s) => Ok(s),
        serde_json::Value::Null => Ok(String::new()),
        other => Err(ChatError::StreamParse {
            detail: format!("expected string content, got {other}"),
            record: payload.to_string(),
        }),
    }
}

fn parse_error(payload: &str, e: serde_json::Error) -> ChatError {
    ChatError::StreamParse {
        detail: e.to_string(),
        record: payload.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::ContextSnippet;
    use rstest::rstest;

    #[rstest]
    #[case(r#"data: {"type":"content","content":"Hello"}"#, StreamEvent::Content("Hello".into()))]
    #[case(r#"data: {"type":"reasoning","content":"think"}"#, StreamEvent::Reasoning("think".into()))]
    #[case(r#"data: {"type":"error","content":"boom"}"#, StreamEvent::Error("boom".into()))]
    #[case(r#"data: {"type":"done"}"#, StreamEvent::Done)]
    #[case(r#"data: {"type":"done","content":""}"#, StreamEvent::Done)]
    #[case("data: [DONE]", StreamEvent::Done)]
    #[case(r#"data:{"type":"content","content":"tight"}"#, StreamEvent::Content("tight".into()))]
    fn decodes_known_records(#[case] line: &str, #[case] expected: StreamEvent) {
        assert_eq!(decode(line), Some(expected));
    }

    #[rstest]
    #[case("")]
    #[case("   ")]
    #[case(": keep-alive")]
    #[case("event: message")]
    #[case("id: 42")]
    #[case("data: ")]
    fn noise_is_ignored(#[case] line: &str) {
        assert_eq!(decode(line), None);
    }

    #[rstest]
    #[case("data: {not json")]
    #[case(r#"data: {"type":"telemetry","content":1}"#)]
    #[case(r#"data: {"type":"content","content":{"nested":true}}"#)]
    #[case(r#"data: {"type":"context","content":"not a list"}"#)]
    #[case(r#"data: {"content":"missing type"}"#)]
    fn malformed_is_dropped(#[case] line: &str) {
        assert_eq!(decode(line), None);
    }

    #[test]
    fn context_snapshot_decodes() {
        let line = r#"data: {"type":"context","content":[{"fileName":"cell.pdf","similarity":0.82,"content":"TOPCon"}]}"#;
        let expected = vec![ContextSnippet {
            file_name: "cell.pdf".into(),
            similarity: 0.82,
            content: "TOPCon".into(),
        }];
        assert_eq!(decode(line), Some(StreamEvent::Context(expected)));
    }

    #[test]
    fn image_descriptor_decodes() {
        let line = r#"data: {"type":"image","content":{"url_path":"/static/jv.png","tool_name":"solar","image_index":0}}"#;
        match decode(line) {
            Some(StreamEvent::Image(d)) => {
                assert_eq!(d.url_path.as_deref(), Some("/static/jv.png"));
                assert_eq!(d.tool_name.as_deref(), Some("solar"));
                assert!(d.image_data.is_none());
            }
            other => panic!("expected image, got {other:?}"),
        }
    }

    #[test]
    fn null_error_content_gets_placeholder() {
        assert_eq!(
            decode(r#"data: {"type":"error","content":null}"#),
            Some(StreamEvent::Error("unknown error".into()))
        );
    }

    #[test]
    fn parse_payload_reports_unknown_type() {
        let err = parse_payload(r#"{"type":"nope"}"#).unwrap_err();
        assert_eq!(err.kind(), "stream_parse");
        assert!(err.to_string().contains("nope"));
    }
}
