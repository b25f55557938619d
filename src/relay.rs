use crate::canonical::decode::UpstreamConverter;
use crate::sse::SseLineBuffer;
use bytes::Bytes;
use futures_util::{Stream, StreamExt};
use std::fmt::Display;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;

pub const RELAY_CHANNEL_CAPACITY: usize = 16;

pub type BodyChunk = Result<Bytes, std::io::Error>;
pub type BodySender = mpsc::Sender<BodyChunk>;

/// Bounded channel feeding a streaming response body. The relay waits on a
/// full channel, so upstream reads never outrun the client.
pub fn body_channel() -> (BodySender, ReceiverStream<BodyChunk>) {
    let (tx, rx) = mpsc::channel(RELAY_CHANNEL_CAPACITY);
    (tx, ReceiverStream::new(rx))
}

/// Drives `converter` over an upstream SSE byte stream, writing each canonical
/// event to `tx` before reading further. Returns everything written, which is
/// the partial transcript when the upstream fails or the client disconnects.
pub async fn relay_converted<S, E>(
    upstream: S,
    mut converter: UpstreamConverter,
    tx: BodySender,
) -> String
where
    S: Stream<Item = Result<Bytes, E>>,
    E: Display,
{
    let mut upstream = std::pin::pin!(upstream);
    let mut lines = SseLineBuffer::new();
    let mut transcript = String::new();

    while let Some(chunk) = upstream.next().await {
        let chunk = match chunk {
            Ok(chunk) => chunk,
            Err(err) => {
                tracing::warn!(error = %err, "upstream stream failed mid-response");
                return transcript;
            }
        };
        for payload in lines.push(&chunk) {
            if !forward_events(&mut converter, &payload, &tx, &mut transcript).await {
                tracing::debug!("client went away, stopping relay");
                return transcript;
            }
        }
    }
    if let Some(payload) = lines.finish() {
        if !forward_events(&mut converter, &payload, &tx, &mut transcript).await {
            return transcript;
        }
    }
    send_events(converter.flush(), &tx, &mut transcript).await;
    transcript
}

async fn forward_events(
    converter: &mut UpstreamConverter,
    payload: &str,
    tx: &BodySender,
    transcript: &mut String,
) -> bool {
    send_events(converter.process_event(payload), tx, transcript).await
}

async fn send_events(events: Vec<String>, tx: &BodySender, transcript: &mut String) -> bool {
    for event in events {
        transcript.push_str(&event);
        if tx.send(Ok(Bytes::from(event))).await.is_err() {
            return false;
        }
    }
    true
}

/// Forwards raw bytes unchanged and returns a lossy text copy of them.
pub async fn relay_passthrough<S, E>(upstream: S, tx: BodySender) -> String
where
    S: Stream<Item = Result<Bytes, E>>,
    E: Display,
{
    let mut upstream = std::pin::pin!(upstream);
    let mut copy = Vec::new();
    while let Some(chunk) = upstream.next().await {
        match chunk {
            Ok(chunk) => {
                copy.extend_from_slice(&chunk);
                if tx.send(Ok(chunk)).await.is_err() {
                    tracing::debug!("client went away, stopping passthrough");
                    break;
                }
            }
            Err(err) => {
                tracing::warn!(error = %err, "passthrough stream failed mid-response");
                let _ = tx
                    .send(Err(std::io::Error::other(err.to_string())))
                    .await;
                break;
            }
        }
    }
    String::from_utf8_lossy(&copy).into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::canonical::decode::{ChatStreamConverter, ResponsesStreamConverter};
    use futures_util::stream;

    fn chunks(parts: &[&'static str]) -> Vec<Result<Bytes, String>> {
        parts
            .iter()
            .map(|p| Ok(Bytes::from_static(p.as_bytes())))
            .collect()
    }

    async fn drain(rx: ReceiverStream<BodyChunk>) -> String {
        let parts: Vec<BodyChunk> = rx.collect().await;
        parts
            .into_iter()
            .map(|c| String::from_utf8(c.unwrap().to_vec()).unwrap())
            .collect()
    }

    #[tokio::test]
    async fn converted_events_reach_the_client_and_the_transcript() {
        let upstream = stream::iter(chunks(&[
            "data: {\"choices\":[{\"delta\":{\"content\":\"Hi\"}}]}\n\nda",
            "ta: {\"choices\":[{\"delta\":{},\"finish_reason\":\"stop\"}]}\n\n",
            "data: [DONE]",
        ]));
        let (tx, rx) = body_channel();
        let converter = UpstreamConverter::Chat(ChatStreamConverter::new("gpt-oss-120b"));
        let reader = tokio::spawn(drain(rx));
        let transcript = relay_converted(upstream, converter, tx).await;
        let written = reader.await.unwrap();

        assert_eq!(written, transcript);
        assert!(transcript.starts_with("event: message_start\n"));
        assert!(transcript.ends_with("event: message_stop\ndata: {\"type\":\"message_stop\"}\n\n"));
        assert_eq!(transcript.matches("event: message_stop").count(), 1);
    }

    #[tokio::test]
    async fn finished_chat_stream_without_done_is_closed_with_late_usage() {
        let upstream = stream::iter(chunks(&[
            "data: {\"choices\":[{\"delta\":{\"content\":\"Hi\"}}]}\n\n",
            "data: {\"choices\":[{\"delta\":{},\"finish_reason\":\"stop\"}]}\n\n",
            "data: {\"choices\":[],\"usage\":{\"prompt_tokens\":12,\"completion_tokens\":9}}\n\n",
        ]));
        let (tx, rx) = body_channel();
        let converter = UpstreamConverter::Chat(ChatStreamConverter::new("gpt-oss-120b"));
        let reader = tokio::spawn(drain(rx));
        let transcript = relay_converted(upstream, converter, tx).await;

        assert_eq!(reader.await.unwrap(), transcript);
        assert_eq!(transcript.matches("event: message_stop").count(), 1);
        let entry = crate::usage::extract_usage(&transcript, "cerebras", "gpt-oss-120b")
            .expect("usage entry");
        assert_eq!(entry.output_tokens, 9);
    }

    #[tokio::test]
    async fn upstream_error_keeps_what_was_already_written() {
        let upstream = stream::iter(vec![
            Ok(Bytes::from_static(
                b"data: {\"type\":\"response.created\",\"response\":{\"id\":\"r\"}}\n",
            )),
            Err("connection reset".to_string()),
            Ok(Bytes::from_static(b"data: {\"type\":\"response.completed\"}\n")),
        ]);
        let (tx, rx) = body_channel();
        let converter = UpstreamConverter::Responses(ResponsesStreamConverter::new("gpt-5.1-codex"));
        let reader = tokio::spawn(drain(rx));
        let transcript = relay_converted(upstream, converter, tx).await;
        let written = reader.await.unwrap();

        assert_eq!(written, transcript);
        assert!(transcript.contains("message_start"));
        assert!(!transcript.contains("message_stop"));
    }

    #[tokio::test]
    async fn closed_client_stops_the_relay() {
        let upstream = stream::iter(chunks(&[
            "data: {\"choices\":[{\"delta\":{\"content\":\"a\"}}]}\n",
            "data: {\"choices\":[{\"delta\":{\"content\":\"b\"}}]}\n",
        ]));
        let (tx, rx) = body_channel();
        drop(rx);
        let converter = UpstreamConverter::Chat(ChatStreamConverter::new("m"));
        let transcript = relay_converted(upstream, converter, tx).await;
        assert!(transcript.starts_with("event: message_start"));
        assert!(!transcript.contains("\"b\""));
    }

    #[tokio::test]
    async fn passthrough_forwards_bytes_verbatim() {
        let upstream = stream::iter(chunks(&["event: ping\n", "data: {}\n\n"]));
        let (tx, rx) = body_channel();
        let reader = tokio::spawn(drain(rx));
        let copy = relay_passthrough(upstream, tx).await;
        assert_eq!(reader.await.unwrap(), "event: ping\ndata: {}\n\n");
        assert_eq!(copy, "event: ping\ndata: {}\n\n");
    }
}
