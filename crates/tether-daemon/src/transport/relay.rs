//! Relay WebSocket link
//!
//! [`RelayTransport`] is the sending half handed to the coordinator; it
//! outlives individual connections. [`RelayClient`] owns the socket, keeps
//! reconnecting with backoff and reports what happens as [`RelayEvent`]s.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use futures::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;

use tether_core::config::BackoffConfig;
use tether_core::error::TransportError;
use tether_core::traits::Transport;
use tether_protocol::Envelope;

use super::reconnect::ExponentialBackoff;

type RelaySocket = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Connection lifecycle and inbound traffic of the relay link
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RelayEvent {
    /// Socket is up; the daemon should (re-)register
    Connected,
    /// A text frame from the relay
    Message(String),
    /// Socket dropped; a reconnect is scheduled
    Disconnected,
}

/// Sending half of the relay connection
#[derive(Debug, Default)]
pub struct RelayTransport {
    outbound: Mutex<Option<mpsc::UnboundedSender<String>>>,
    open: AtomicBool,
}

impl RelayTransport {
    pub fn new() -> Self {
        Self::default()
    }

    fn attach(&self, tx: mpsc::UnboundedSender<String>) {
        if let Ok(mut outbound) = self.outbound.lock() {
            *outbound = Some(tx);
            self.open.store(true, Ordering::SeqCst);
        }
    }

    fn detach(&self) {
        self.open.store(false, Ordering::SeqCst);
        if let Ok(mut outbound) = self.outbound.lock() {
            outbound.take();
        }
    }
}

impl Transport for RelayTransport {
    fn send(&self, event: &str, payload: &Value) -> Result<(), TransportError> {
        let text = Envelope::new(event, payload.clone()).to_json();
        let outbound = self
            .outbound
            .lock()
            .map_err(|_| TransportError::Relay("outbound queue poisoned".to_string()))?;
        let tx = outbound.as_ref().ok_or(TransportError::NotOpen)?;
        tx.send(text).map_err(|_| TransportError::Closed)
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    fn name(&self) -> &'static str {
        "relay"
    }

    fn close(&self) {
        self.detach();
    }
}

/// Keeps the relay WebSocket connected
pub struct RelayClient {
    url: String,
    transport: Arc<RelayTransport>,
    backoff: ExponentialBackoff,
}

impl RelayClient {
    pub fn new(url: impl Into<String>, transport: Arc<RelayTransport>, backoff: &BackoffConfig) -> Self {
        Self {
            url: url.into(),
            transport,
            backoff: ExponentialBackoff::from_config(backoff),
        }
    }

    /// Connect, serve and reconnect until `cancel` fires
    pub async fn run(mut self, events: mpsc::Sender<RelayEvent>, cancel: CancellationToken) {
        loop {
            let connected = tokio::select! {
                _ = cancel.cancelled() => break,
                result = connect_async(self.url.as_str()) => result,
            };

            match connected {
                Ok((socket, _response)) => {
                    tracing::info!(url = %self.url, "Connected to relay");
                    self.backoff.reset();
                    if !self.serve(socket, &events, &cancel).await {
                        break;
                    }
                }
                Err(e) => {
                    tracing::warn!(url = %self.url, error = %e, "Relay connection failed");
                }
            }

            if cancel.is_cancelled() {
                break;
            }

            let delay = self.backoff.next_delay();
            tracing::info!(
                attempt = self.backoff.attempts(),
                delay_ms = delay.as_millis() as u64,
                "Reconnecting to relay"
            );
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(delay) => {}
            }
        }

        self.transport.detach();
        tracing::debug!("Relay client stopped");
    }

    /// Pump one connection. Returns false when nobody listens for events.
    async fn serve(
        &self,
        socket: RelaySocket,
        events: &mpsc::Sender<RelayEvent>,
        cancel: &CancellationToken,
    ) -> bool {
        let (mut sink, mut stream) = socket.split();
        let (tx, mut rx) = mpsc::unbounded_channel::<String>();
        self.transport.attach(tx);

        if events.send(RelayEvent::Connected).await.is_err() {
            self.transport.detach();
            return false;
        }

        let mut listening = true;
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    let _ = sink.send(Message::Close(None)).await;
                    break;
                }
                outbound = rx.recv() => match outbound {
                    Some(text) => {
                        if let Err(e) = sink.send(Message::Text(text)).await {
                            tracing::warn!(error = %e, "Relay write failed");
                            break;
                        }
                    }
                    None => {
                        // Transport closed locally
                        let _ = sink.send(Message::Close(None)).await;
                        break;
                    }
                },
                inbound = stream.next() => match inbound {
                    Some(Ok(Message::Text(text))) => {
                        if events.send(RelayEvent::Message(text)).await.is_err() {
                            listening = false;
                            break;
                        }
                    }
                    Some(Ok(Message::Binary(bytes))) => match String::from_utf8(bytes) {
                        Ok(text) => {
                            if events.send(RelayEvent::Message(text)).await.is_err() {
                                listening = false;
                                break;
                            }
                        }
                        Err(_) => tracing::debug!("Ignoring non-UTF-8 relay frame"),
                    },
                    Some(Ok(Message::Close(frame))) => {
                        tracing::info!(frame = ?frame, "Relay closed the connection");
                        break;
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        tracing::warn!(error = %e, "Relay read failed");
                        break;
                    }
                    None => break,
                },
            }
        }

        self.transport.detach();
        if listening && events.send(RelayEvent::Disconnected).await.is_err() {
            listening = false;
        }
        listening
    }
}
