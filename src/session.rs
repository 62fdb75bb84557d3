//! Duplex session boundary.
//!
//! The controller only ever sees the [`DuplexSession`] / [`Connector`]
//! traits; the WebSocket implementation below is one backend. Outbound
//! frames are queued through an mpsc writer, so `send` is fire-and-forget
//! in creation order and tolerates being called before the connection has
//! finished opening. Inbound events arrive on a single ordered channel.

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::{connect_async, tungstenite::protocol::Message};
use url::Url;
use uuid::Uuid;

use crate::error::TransportError;
use crate::protocol::{ServerMessage, SessionConfig, SessionEvent, SetupMessage, TransportEnvelope};

/// A live bidirectional stream to the conversational backend.
#[async_trait]
pub trait DuplexSession: Send + Sync {
    /// Queue one outbound frame. No acknowledgment; frames leave in the
    /// order they were queued.
    async fn send(&self, envelope: TransportEnvelope) -> Result<(), TransportError>;

    /// Orderly close. Idempotent; no events follow the resulting `Closed`.
    async fn close(&self);
}

/// Opens sessions. The controller takes one of these so tests can script
/// the backend.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(
        &self,
        config: &SessionConfig,
    ) -> Result<(Box<dyn DuplexSession>, mpsc::Receiver<SessionEvent>), TransportError>;
}

enum Outbound {
    Frame(TransportEnvelope),
    Close,
}

/// WebSocket-backed session: binary frames carry PCM payloads, JSON text
/// carries control signaling.
pub struct WsSession {
    out_tx: mpsc::Sender<Outbound>,
}

#[async_trait]
impl DuplexSession for WsSession {
    async fn send(&self, envelope: TransportEnvelope) -> Result<(), TransportError> {
        self.out_tx
            .send(Outbound::Frame(envelope))
            .await
            .map_err(|_| TransportError::Closed)
    }

    async fn close(&self) {
        let _ = self.out_tx.send(Outbound::Close).await;
    }
}

pub struct WsConnector {
    client_id: String,
}

impl WsConnector {
    pub fn new() -> Self {
        Self {
            client_id: Uuid::new_v4().to_string(),
        }
    }
}

impl Default for WsConnector {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Connector for WsConnector {
    async fn connect(
        &self,
        config: &SessionConfig,
    ) -> Result<(Box<dyn DuplexSession>, mpsc::Receiver<SessionEvent>), TransportError> {
        let url = Url::parse(&config.endpoint)
            .map_err(|e| TransportError::Connect(e.to_string()))?;
        let host = url.host_str().unwrap_or_default().to_string();

        let request = tokio_tungstenite::tungstenite::http::Request::builder()
            .method("GET")
            .uri(config.endpoint.as_str())
            .header("Host", host)
            .header("Connection", "Upgrade")
            .header("Upgrade", "websocket")
            .header("Sec-WebSocket-Version", "13")
            .header(
                "Sec-WebSocket-Key",
                tokio_tungstenite::tungstenite::handshake::client::generate_key(),
            )
            .header("Authorization", format!("Bearer {}", config.token))
            .header("Client-Id", &self.client_id)
            .body(())
            .map_err(|e| TransportError::Connect(e.to_string()))?;

        tracing::info!(endpoint = %config.endpoint, "connecting duplex session");
        let (ws_stream, _) = connect_async(request)
            .await
            .map_err(|e| TransportError::Connect(e.to_string()))?;
        let (mut write, read) = ws_stream.split();

        // Declare both audio formats before any frame flows.
        let setup = serde_json::to_string(&SetupMessage::from_config(config))
            .map_err(|e| TransportError::Connect(e.to_string()))?;
        write
            .send(Message::Text(setup.into()))
            .await
            .map_err(|e| TransportError::Connect(e.to_string()))?;

        let (event_tx, event_rx) = mpsc::channel::<SessionEvent>(64);
        let (out_tx, out_rx) = mpsc::channel::<Outbound>(64);

        tokio::spawn(async move {
            match session_loop(write, read, out_rx, &event_tx).await {
                Ok(()) => {
                    let _ = event_tx.send(SessionEvent::Closed).await;
                }
                Err(e) => {
                    tracing::error!("session transport error: {e}");
                    let _ = event_tx.send(SessionEvent::Error(e.to_string())).await;
                }
            }
        });

        Ok((Box::new(WsSession { out_tx }), event_rx))
    }
}

type WsWrite = futures_util::stream::SplitSink<
    tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>,
    Message,
>;
type WsRead = futures_util::stream::SplitStream<
    tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>,
>;

async fn session_loop(
    mut write: WsWrite,
    mut read: WsRead,
    mut out_rx: mpsc::Receiver<Outbound>,
    event_tx: &mpsc::Sender<SessionEvent>,
) -> Result<(), TransportError> {
    loop {
        tokio::select! {
            msg = read.next() => match msg {
                Some(Ok(Message::Text(text))) => match parse_control(&text) {
                    Some(SessionEvent::Error(reason)) => {
                        return Err(TransportError::Remote(reason));
                    }
                    Some(event) => {
                        if event_tx.send(event).await.is_err() {
                            return Ok(());
                        }
                    }
                    None => {}
                },
                Some(Ok(Message::Binary(data))) => {
                    if event_tx.send(SessionEvent::AudioDelta(data)).await.is_err() {
                        return Ok(());
                    }
                }
                Some(Ok(Message::Close(frame))) => {
                    tracing::info!("backend closed session: {frame:?}");
                    return Ok(());
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => return Err(TransportError::Remote(e.to_string())),
                None => return Ok(()),
            },
            cmd = out_rx.recv() => match cmd {
                Some(Outbound::Frame(envelope)) => {
                    write
                        .send(Message::Binary(envelope.payload))
                        .await
                        .map_err(|e| TransportError::Send(e.to_string()))?;
                }
                Some(Outbound::Close) | None => {
                    let _ = write.send(Message::Close(None)).await;
                    return Ok(());
                }
            },
        }
    }
}

fn parse_control(text: &str) -> Option<SessionEvent> {
    let msg: ServerMessage = match serde_json::from_str(text) {
        Ok(msg) => msg,
        Err(_) => {
            tracing::debug!("ignoring non-control text frame: {text}");
            return None;
        }
    };
    match msg.msg_type.as_str() {
        "ready" => Some(SessionEvent::Opened),
        "interrupted" => Some(SessionEvent::Interrupted),
        "turn_complete" => Some(SessionEvent::TurnComplete),
        "error" => Some(SessionEvent::Error(
            msg.reason.unwrap_or_else(|| "unspecified backend error".to_string()),
        )),
        other => {
            tracing::debug!("unhandled control message type: {other}");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn control_messages_map_to_events() {
        assert!(matches!(
            parse_control(r#"{"type":"ready"}"#),
            Some(SessionEvent::Opened)
        ));
        assert!(matches!(
            parse_control(r#"{"type":"interrupted"}"#),
            Some(SessionEvent::Interrupted)
        ));
        assert!(matches!(
            parse_control(r#"{"type":"turn_complete"}"#),
            Some(SessionEvent::TurnComplete)
        ));
        match parse_control(r#"{"type":"error","reason":"quota"}"#) {
            Some(SessionEvent::Error(reason)) => assert_eq!(reason, "quota"),
            other => panic!("expected error event, got {other:?}"),
        }
        assert!(parse_control("not json").is_none());
        assert!(parse_control(r#"{"type":"transcript"}"#).is_none());
    }
}
