use crate::runs::broker::{BrokerMessage, Terminal};
use crate::runs::gateway::RunStream;
use axum::http::{HeaderValue, header};
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use futures::{Stream, StreamExt};
use serde_json::json;
use std::convert::Infallible;
use std::time::Duration;

/// SSE frame for one broker message. Events carry `id`, `event: {mode}` and
/// the JSON payload; the stream ends with `end`, `cancelled` or `error`.
pub fn to_sse_event(message: &BrokerMessage) -> Event {
    match message {
        BrokerMessage::Event(record) => {
            let data =
                serde_json::to_string(&record.event.data).unwrap_or_else(|_| "null".to_string());
            Event::default()
                .id(record.event_id.as_str())
                .event(record.event.mode.as_str())
                .data(data)
        }
        BrokerMessage::End(Terminal::Done) => Event::default().event("end").data("{}"),
        BrokerMessage::End(Terminal::Cancelled) => Event::default()
            .event("cancelled")
            .data(json!({ "message": "run cancelled" }).to_string()),
        BrokerMessage::End(Terminal::Error(message)) => Event::default()
            .event("error")
            .data(json!({ "error": "run_failed", "message": message }).to_string()),
    }
}

pub fn build_sse_stream(
    stream: RunStream,
    keep_alive: Duration,
) -> Sse<impl Stream<Item = Result<Event, Infallible>> + Send> {
    let stream = stream.map(|message| Ok(to_sse_event(&message)));
    Sse::new(stream).keep_alive(KeepAlive::new().interval(keep_alive))
}

/// SSE response with the caching headers streaming clients and proxies need.
pub fn build_sse_response(stream: RunStream, keep_alive: Duration) -> Response {
    let mut response = build_sse_stream(stream, keep_alive).into_response();
    let headers = response.headers_mut();
    headers.insert(header::CACHE_CONTROL, HeaderValue::from_static("no-cache"));
    headers.insert(header::CONNECTION, HeaderValue::from_static("keep-alive"));
    response
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::events::{EventRecord, RunEvent, StreamMode};
    use std::sync::Arc;

    #[tokio::test]
    async fn test_frames_events_and_sentinels() {
        let record = EventRecord::new(
            "r",
            1,
            RunEvent {
                mode: StreamMode::Values,
                data: json!({ "messages": [] }),
            },
        );
        let messages = vec![
            BrokerMessage::Event(Arc::new(record)),
            BrokerMessage::End(Terminal::Error("boom".into())),
        ];
        let stream: RunStream = Box::pin(futures::stream::iter(messages));

        let response = build_sse_response(stream, Duration::from_secs(15));
        assert_eq!(response.headers()[header::CACHE_CONTROL], "no-cache");
        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let body = String::from_utf8(body.to_vec()).unwrap();

        assert!(body.contains("id: r_event_1\n"));
        assert!(body.contains("event: values\ndata: {\"messages\":[]}\n"));
        assert!(body.contains("event: error\ndata: {\"error\":\"run_failed\",\"message\":\"boom\"}\n"));
    }
}
