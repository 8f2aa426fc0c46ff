//! WebSocket exchange channel.
//!
//! One outbound task serializes [`ClientMessage`]s onto the socket; one
//! inbound task parses frames into [`ChannelEvent`]s. Reconnecting is just
//! calling [`ExchangeChannel::connect`] again once the previous connection
//! failed or closed.

use async_trait::async_trait;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tokio_tungstenite::tungstenite::Message as WsMessage;

use super::channel::{ChannelEvent, ExchangeChannel};
use super::protocol::{parse_server_frame, ClientMessage};
use crate::config::ExchangeConfig;
use crate::error::{Result, SessionError};

type WsStream =
    tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>;

/// State of the exchange WebSocket.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Never connected.
    Disconnected,
    /// Handshake in progress.
    Connecting,
    /// Open and usable.
    Ready,
    /// Dropped or refused; `connect` may be called again.
    Failed,
    /// Closed on request.
    Closed,
}

#[derive(Debug)]
enum Outbound {
    Message(ClientMessage),
    Close,
}

pub struct WsExchangeChannel {
    url: String,
    session_id: String,
    capacity: usize,
    state: Arc<Mutex<ConnectionState>>,
    outbound: Mutex<Option<mpsc::Sender<Outbound>>>,
    pending_ack: Arc<Mutex<Option<oneshot::Sender<()>>>>,
    event_tx: mpsc::Sender<ChannelEvent>,
}

impl WsExchangeChannel {
    /// Build an unconnected channel and the receiver for its events.
    pub fn new(
        config: &ExchangeConfig,
        session_id: impl Into<String>,
    ) -> Result<(Self, mpsc::Receiver<ChannelEvent>)> {
        let url = config
            .ws_url
            .clone()
            .ok_or_else(|| SessionError::Config("exchange.ws_url is not set".into()))?;
        let (event_tx, event_rx) = mpsc::channel(config.channel_capacity);
        Ok((
            Self {
                url,
                session_id: session_id.into(),
                capacity: config.channel_capacity,
                state: Arc::new(Mutex::new(ConnectionState::Disconnected)),
                outbound: Mutex::new(None),
                pending_ack: Arc::new(Mutex::new(None)),
                event_tx,
            },
            event_rx,
        ))
    }

    pub fn connection_state(&self) -> ConnectionState {
        *self.state.lock()
    }

    /// Close the socket gracefully.
    pub async fn close(&self) {
        let tx = self.outbound.lock().take();
        if let Some(tx) = tx {
            let _ = tx.send(Outbound::Close).await;
        }
    }

    async fn outbound_loop(
        mut rx: mpsc::Receiver<Outbound>,
        mut sink: SplitSink<WsStream, WsMessage>,
        state: Arc<Mutex<ConnectionState>>,
        session_id: String,
    ) {
        while let Some(outbound) = rx.recv().await {
            match outbound {
                Outbound::Message(message) => {
                    let json = match serde_json::to_string(&message) {
                        Ok(json) => json,
                        Err(e) => {
                            tracing::error!(
                                session_id = %session_id,
                                kind = message.kind(),
                                error = %e,
                                "Failed to serialize exchange message"
                            );
                            continue;
                        }
                    };
                    tracing::debug!(session_id = %session_id, kind = message.kind(), "⬆ Exchange message");
                    if sink.send(WsMessage::text(json)).await.is_err() {
                        tracing::warn!(
                            session_id = %session_id,
                            "WebSocket send failed, closing outbound loop"
                        );
                        *state.lock() = ConnectionState::Failed;
                        break;
                    }
                }
                Outbound::Close => {
                    let _ = sink.send(WsMessage::Close(None)).await;
                    *state.lock() = ConnectionState::Closed;
                    break;
                }
            }
        }
        tracing::debug!(session_id = %session_id, "Outbound loop terminated");
    }

    async fn inbound_loop(
        mut source: SplitStream<WsStream>,
        event_tx: mpsc::Sender<ChannelEvent>,
        state: Arc<Mutex<ConnectionState>>,
        pending_ack: Arc<Mutex<Option<oneshot::Sender<()>>>>,
        session_id: String,
    ) {
        let mut reason = String::from("stream ended");

        while let Some(frame) = source.next().await {
            let event = match frame {
                Ok(WsMessage::Text(text)) => parse_server_frame(text.as_str()),
                // Some gateways relay JSON as binary frames.
                Ok(WsMessage::Binary(data)) if data.first() == Some(&b'{') => {
                    match std::str::from_utf8(&data) {
                        Ok(text) => parse_server_frame(text),
                        Err(_) => continue,
                    }
                }
                Ok(WsMessage::Close(frame)) => {
                    reason = frame.map_or_else(
                        || "closed by server".to_string(),
                        |f| format!("closed by server: {}", f.reason.as_str()),
                    );
                    break;
                }
                Ok(_) => continue,
                Err(e) => {
                    tracing::warn!(session_id = %session_id, error = %e, "WebSocket receive error");
                    reason = e.to_string();
                    break;
                }
            };

            tracing::debug!(session_id = %session_id, event = ?event, "⬇ Exchange event");
            if event == ChannelEvent::EndAcknowledged {
                if let Some(ack) = pending_ack.lock().take() {
                    let _ = ack.send(());
                }
            }
            if event_tx.send(event).await.is_err() {
                tracing::debug!(
                    session_id = %session_id,
                    "Event receiver dropped, closing inbound loop"
                );
                return;
            }
        }

        {
            let mut state = state.lock();
            if *state != ConnectionState::Closed {
                *state = ConnectionState::Failed;
            }
        }
        // Anyone awaiting an end acknowledgment gets an error now.
        pending_ack.lock().take();
        tracing::info!(session_id = %session_id, reason = %reason, "Exchange channel disconnected");
        let _ = event_tx.send(ChannelEvent::Disconnected { reason }).await;
    }
}

#[async_trait]
impl ExchangeChannel for WsExchangeChannel {
    fn is_connected(&self) -> bool {
        *self.state.lock() == ConnectionState::Ready
    }

    async fn connect(&self) -> Result<()> {
        {
            let mut state = self.state.lock();
            if matches!(*state, ConnectionState::Ready | ConnectionState::Connecting) {
                return Ok(());
            }
            *state = ConnectionState::Connecting;
        }

        tracing::info!(session_id = %self.session_id, url = %self.url, "Connecting exchange channel");
        let ws_stream = match tokio_tungstenite::connect_async(self.url.as_str()).await {
            Ok((stream, _response)) => stream,
            Err(e) => {
                *self.state.lock() = ConnectionState::Failed;
                return Err(SessionError::channel(format!(
                    "Failed to connect to exchange backend: {e}"
                )));
            }
        };

        let (sink, source) = ws_stream.split();
        let (out_tx, out_rx) = mpsc::channel::<Outbound>(self.capacity);

        let state_out = Arc::clone(&self.state);
        let sid_out = self.session_id.clone();
        tokio::spawn(async move {
            Self::outbound_loop(out_rx, sink, state_out, sid_out).await;
        });

        let event_tx = self.event_tx.clone();
        let state_in = Arc::clone(&self.state);
        let ack_in = Arc::clone(&self.pending_ack);
        let sid_in = self.session_id.clone();
        tokio::spawn(async move {
            Self::inbound_loop(source, event_tx, state_in, ack_in, sid_in).await;
        });

        *self.outbound.lock() = Some(out_tx);
        *self.state.lock() = ConnectionState::Ready;
        tracing::info!(session_id = %self.session_id, "Exchange channel ready");
        let _ = self.event_tx.send(ChannelEvent::Connected).await;
        Ok(())
    }

    async fn send(&self, message: ClientMessage) -> Result<()> {
        let tx = self
            .outbound
            .lock()
            .clone()
            .ok_or_else(|| SessionError::channel("exchange channel is not connected"))?;
        tx.send(Outbound::Message(message))
            .await
            .map_err(|_| SessionError::channel("exchange outbound channel closed"))
    }

    async fn end_interview(&self, interview_id: &str) -> Result<()> {
        let (ack_tx, ack_rx) = oneshot::channel();
        *self.pending_ack.lock() = Some(ack_tx);
        self.send(ClientMessage::EndInterview {
            interview_id: interview_id.to_string(),
        })
        .await?;
        ack_rx
            .await
            .map_err(|_| SessionError::channel("connection closed before end acknowledgment"))
    }
}
