use futures_util::{future, stream, Sink, SinkExt, Stream, StreamExt};
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::sleep;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tracing::debug;

use crate::config::MAX_ROOM_ID;
use crate::message::{format_timestamp, ChatMessage, ChatResponse};

/// Close code the chat server uses when it refuses a room path.
pub const CLOSE_UNSUPPORTED: u16 = 1003;

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("connect to {url} failed: {reason}")]
    Connect { url: String, reason: String },
    #[error("connect to {0} timed out")]
    ConnectTimeout(String),
    #[error("send failed: {0}")]
    Send(String),
    #[error("receive failed: {0}")]
    Receive(String),
    #[error("connection closed")]
    Closed,
}

/// A frame read from the server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Inbound {
    Text(String),
    Closed { code: Option<u16>, reason: String },
}

pub type FrameSink = Pin<Box<dyn Sink<String, Error = TransportError> + Send>>;
pub type FrameStream = Pin<Box<dyn Stream<Item = Result<Inbound, TransportError>> + Send>>;

/// One established connection, split into its write and read halves.
pub struct Connection {
    pub sink: FrameSink,
    pub stream: FrameStream,
}

/// Something that can open a connection to a chat room.
pub trait Transport: Send + Sync {
    fn name(&self) -> &'static str;

    fn connect<'a>(
        &'a self,
        room_id: u8,
    ) -> Pin<Box<dyn Future<Output = Result<Connection, TransportError>> + Send + 'a>>;
}

/// Connects to `<base_url>/chat/<room>` over WebSocket.
pub struct WebSocketTransport {
    base_url: String,
    connect_timeout: Duration,
}

impl WebSocketTransport {
    pub fn new(base_url: impl Into<String>, connect_timeout: Duration) -> Self {
        Self {
            base_url: base_url.into(),
            connect_timeout,
        }
    }

    pub fn room_url(&self, room_id: u8) -> String {
        format!("{}/chat/{}", self.base_url.trim_end_matches('/'), room_id)
    }
}

impl Transport for WebSocketTransport {
    fn name(&self) -> &'static str {
        "websocket"
    }

    fn connect<'a>(
        &'a self,
        room_id: u8,
    ) -> Pin<Box<dyn Future<Output = Result<Connection, TransportError>> + Send + 'a>> {
        Box::pin(async move {
            let url = self.room_url(room_id);
            let (ws, _) = match tokio::time::timeout(self.connect_timeout, connect_async(url.as_str())).await {
                Ok(Ok(pair)) => pair,
                Ok(Err(e)) => {
                    return Err(TransportError::Connect {
                        url,
                        reason: e.to_string(),
                    })
                }
                Err(_) => return Err(TransportError::ConnectTimeout(url)),
            };
            debug!("Connected to {}", url);

            let (write, read) = ws.split();
            let sink = write
                .sink_map_err(|e| TransportError::Send(e.to_string()))
                .with(|text: String| future::ready(Ok::<_, TransportError>(Message::Text(text))));
            let stream = read.filter_map(|item| {
                future::ready(match item {
                    Ok(Message::Text(text)) => Some(Ok(Inbound::Text(text))),
                    Ok(Message::Close(frame)) => Some(Ok(Inbound::Closed {
                        code: frame.as_ref().map(|f| u16::from(f.code)),
                        reason: frame.map(|f| f.reason.into_owned()).unwrap_or_default(),
                    })),
                    Ok(_) => None,
                    Err(e) => Some(Err(TransportError::Receive(e.to_string()))),
                })
            });

            Ok(Connection {
                sink: Box::pin(sink),
                stream: Box::pin(stream),
            })
        })
    }
}

/// How the in-memory chat server misbehaves. Counters are per connection and
/// 1-based: `silent_every = Some(3)` leaves every third request unanswered.
#[derive(Debug, Clone, Default)]
pub struct MockBehavior {
    pub latency: Duration,
    pub silent_every: Option<u64>,
    pub malformed_every: Option<u64>,
    pub reject_every: Option<u64>,
    /// Close the connection instead of answering request N+1.
    pub close_after: Option<u64>,
    /// Fail this many connection attempts before accepting any.
    pub failed_connects: u32,
}

fn nth(every: Option<u64>, seen: u64) -> bool {
    matches!(every, Some(n) if n > 0 && seen % n == 0)
}

/// In-memory stand-in for the chat server: echoes each request on the same
/// connection, in order, after `latency`.
pub struct MockTransport {
    behavior: MockBehavior,
    failures_left: AtomicU32,
    connections: AtomicU64,
    requests: Arc<AtomicU64>,
}

impl MockTransport {
    pub fn new(behavior: MockBehavior) -> Self {
        Self {
            failures_left: AtomicU32::new(behavior.failed_connects),
            behavior,
            connections: AtomicU64::new(0),
            requests: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn with_latency(latency: Duration) -> Self {
        Self::new(MockBehavior {
            latency,
            ..MockBehavior::default()
        })
    }

    /// Connections accepted so far.
    pub fn connections(&self) -> u64 {
        self.connections.load(Ordering::Relaxed)
    }

    /// Request frames received across all connections.
    pub fn requests(&self) -> u64 {
        self.requests.load(Ordering::Relaxed)
    }
}

impl Transport for MockTransport {
    fn name(&self) -> &'static str {
        "mock"
    }

    fn connect<'a>(
        &'a self,
        room_id: u8,
    ) -> Pin<Box<dyn Future<Output = Result<Connection, TransportError>> + Send + 'a>> {
        Box::pin(async move {
            let refused = self
                .failures_left
                .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1))
                .is_ok();
            if refused {
                return Err(TransportError::Connect {
                    url: format!("mock://chat/{room_id}"),
                    reason: "connection refused".to_string(),
                });
            }
            self.connections.fetch_add(1, Ordering::Relaxed);

            let (out_tx, out_rx) = mpsc::channel::<String>(64);
            let (in_tx, in_rx) = mpsc::channel::<Result<Inbound, TransportError>>(64);
            tokio::spawn(serve_mock(
                room_id,
                self.behavior.clone(),
                self.requests.clone(),
                out_rx,
                in_tx,
            ));

            let sink = futures_util::sink::unfold(out_tx, |tx, text: String| async move {
                tx.send(text).await.map_err(|_| TransportError::Closed)?;
                Ok::<_, TransportError>(tx)
            });
            let stream = stream::unfold(in_rx, |mut rx| async move {
                rx.recv().await.map(|item| (item, rx))
            });

            Ok(Connection {
                sink: Box::pin(sink),
                stream: Box::pin(stream),
            })
        })
    }
}

async fn serve_mock(
    room_id: u8,
    behavior: MockBehavior,
    requests: Arc<AtomicU64>,
    mut rx: mpsc::Receiver<String>,
    tx: mpsc::Sender<Result<Inbound, TransportError>>,
) {
    if room_id == 0 || room_id > MAX_ROOM_ID {
        let _ = tx
            .send(Ok(Inbound::Closed {
                code: Some(CLOSE_UNSUPPORTED),
                reason: "Invalid room number. Room must be between 1 and 20".to_string(),
            }))
            .await;
        return;
    }

    let mut seen = 0u64;
    while let Some(text) = rx.recv().await {
        seen += 1;
        requests.fetch_add(1, Ordering::Relaxed);

        if matches!(behavior.close_after, Some(limit) if seen > limit) {
            let _ = tx
                .send(Ok(Inbound::Closed {
                    code: Some(1001),
                    reason: "server going away".to_string(),
                }))
                .await;
            return;
        }
        if nth(behavior.silent_every, seen) {
            continue;
        }
        if !behavior.latency.is_zero() {
            sleep(behavior.latency).await;
        }

        let reply = if nth(behavior.malformed_every, seen) {
            "<<not json>>".to_string()
        } else {
            mock_reply(&text, nth(behavior.reject_every, seen))
        };
        if tx.send(Ok(Inbound::Text(reply))).await.is_err() {
            return;
        }
    }
}

fn mock_reply(request: &str, reject: bool) -> String {
    let now = format_timestamp(&chrono::Utc::now());
    let response = match serde_json::from_str::<ChatMessage>(request) {
        Ok(msg) if !reject => ChatResponse {
            status: Some("success".to_string()),
            user_id: Some(msg.user_id),
            username: Some(msg.username),
            message: Some(msg.message),
            message_type: Some(msg.message_type.to_string()),
            server_timestamp: Some(now),
            errors: Vec::new(),
        },
        Ok(_) => ChatResponse {
            status: Some("error".to_string()),
            server_timestamp: Some(now),
            errors: vec!["message rejected by server".to_string()],
            ..ChatResponse::default()
        },
        Err(e) => ChatResponse {
            status: Some("error".to_string()),
            server_timestamp: Some(now),
            errors: vec![format!("Invalid message format: {e}")],
            ..ChatResponse::default()
        },
    };
    serde_json::to_string(&response).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{MessageType, ResponseStatus};

    async fn next_text(conn: &mut Connection) -> String {
        match conn.stream.next().await {
            Some(Ok(Inbound::Text(text))) => text,
            other => panic!("unexpected frame: {:?}", other),
        }
    }

    #[test]
    fn test_room_url() {
        let transport = WebSocketTransport::new("ws://localhost:8080/", Duration::from_secs(1));
        assert_eq!(transport.room_url(7), "ws://localhost:8080/chat/7");
    }

    #[tokio::test]
    async fn test_mock_echoes_in_order() {
        let transport = MockTransport::new(MockBehavior::default());
        let mut conn = transport.connect(3).await.unwrap();

        for i in 1..=3u32 {
            let msg = ChatMessage::new(i, format!("hello {i}"), MessageType::Text);
            conn.sink.send(msg.to_json().unwrap()).await.unwrap();
        }
        for i in 1..=3u32 {
            let resp = ChatResponse::parse(&next_text(&mut conn).await).unwrap();
            assert_eq!(resp.status(), ResponseStatus::Success);
            assert_eq!(resp.user_id, Some(i));
        }
        assert_eq!(transport.connections(), 1);
        assert_eq!(transport.requests(), 3);
    }

    #[tokio::test]
    async fn test_mock_rejects_invalid_room() {
        let transport = MockTransport::new(MockBehavior::default());
        let mut conn = transport.connect(21).await.unwrap();
        match conn.stream.next().await {
            Some(Ok(Inbound::Closed { code, .. })) => assert_eq!(code, Some(CLOSE_UNSUPPORTED)),
            other => panic!("unexpected frame: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_mock_failed_connects() {
        let transport = MockTransport::new(MockBehavior {
            failed_connects: 1,
            ..MockBehavior::default()
        });
        assert!(matches!(
            transport.connect(1).await,
            Err(TransportError::Connect { .. })
        ));
        assert!(transport.connect(1).await.is_ok());
        assert_eq!(transport.connections(), 1);
    }

    #[tokio::test]
    async fn test_mock_rejects_and_garbles() {
        let transport = MockTransport::new(MockBehavior {
            reject_every: Some(2),
            malformed_every: Some(3),
            ..MockBehavior::default()
        });
        let mut conn = transport.connect(1).await.unwrap();
        for i in 1..=3u32 {
            let msg = ChatMessage::new(i, "hi".to_string(), MessageType::Text);
            conn.sink.send(msg.to_json().unwrap()).await.unwrap();
        }

        let first = ChatResponse::parse(&next_text(&mut conn).await).unwrap();
        assert_eq!(first.status(), ResponseStatus::Success);
        let second = ChatResponse::parse(&next_text(&mut conn).await).unwrap();
        assert_eq!(second.status(), ResponseStatus::Error);
        assert!(!second.errors.is_empty());
        assert!(ChatResponse::parse(&next_text(&mut conn).await).is_err());
    }
}
