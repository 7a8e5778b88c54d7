//! Headless client speaking the sync protocol over TCP.
//!
//! A [`SyncClient`] runs two background tasks: a writer draining the
//! outgoing queue and a reader that routes replies to waiting calls and
//! everything else to [`SyncClient::next_event`].

use crate::error::ClientError;
use log::{debug, info, warn};
use serde_json::Value;
use shared::framing::{read_packet, write_packet};
use shared::{Packet, Payload, ProcedureKind, RequestId, Snapshot, WireError, PROTOCOL_VERSION};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpStream, ToSocketAddrs};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

type ReplySender = oneshot::Sender<Result<Payload, WireError>>;
/// Waiting calls by request id. `None` once the reader has stopped.
type PendingReplies = Arc<Mutex<Option<HashMap<RequestId, ReplySender>>>>;

/// Server pushes delivered to the application.
#[derive(Debug, Clone, PartialEq)]
pub enum ClientEvent {
    /// Fresh result of a subscribed request/send procedure.
    Published {
        path: String,
        input: Value,
        result: Value,
    },
    Snapshot(Snapshot),
    Disconnected {
        reason: String,
    },
}

pub struct SyncClient {
    client_id: String,
    host: bool,
    resumed: bool,
    broadcast_period: Duration,
    next_id: AtomicU32,
    pending: PendingReplies,
    outgoing: mpsc::UnboundedSender<Packet>,
    events: mpsc::UnboundedReceiver<ClientEvent>,
    reader: JoinHandle<()>,
    writer: Option<JoinHandle<()>>,
}

impl SyncClient {
    /// Connects and identifies as `client_id`.
    pub async fn connect<A: ToSocketAddrs>(addr: A, client_id: &str) -> Result<Self, ClientError> {
        let stream = TcpStream::connect(addr).await?;
        stream.set_nodelay(true)?;
        let (mut reader, mut writer) = stream.into_split();

        let identify = Packet::Identify {
            client_id: client_id.to_string(),
            protocol_version: PROTOCOL_VERSION,
        };
        write_packet(&mut writer, &identify).await?;

        let (host, resumed, broadcast_period) = match read_packet(&mut reader).await {
            Ok(Packet::Welcome {
                host,
                resumed,
                broadcast_period_ms,
                ..
            }) => (host, resumed, Duration::from_millis(broadcast_period_ms)),
            Ok(Packet::Disconnected { reason }) => return Err(ClientError::Rejected(reason)),
            Ok(other) => {
                return Err(ClientError::Protocol(format!(
                    "expected welcome, got {}",
                    other.name()
                )))
            }
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                return Err(ClientError::Rejected("connection closed during handshake".to_string()))
            }
            Err(e) => return Err(e.into()),
        };
        info!(
            "Connected as {} (host: {}, resumed: {})",
            client_id, host, resumed
        );

        let pending: PendingReplies = Arc::new(Mutex::new(Some(HashMap::new())));
        let (outgoing_tx, outgoing_rx) = mpsc::unbounded_channel();
        let (events_tx, events_rx) = mpsc::unbounded_channel();

        let writer = tokio::spawn(write_loop(writer, outgoing_rx));
        let reader = tokio::spawn(read_loop(reader, Arc::clone(&pending), events_tx));

        Ok(Self {
            client_id: client_id.to_string(),
            host,
            resumed,
            broadcast_period,
            next_id: AtomicU32::new(1),
            pending,
            outgoing: outgoing_tx,
            events: events_rx,
            reader,
            writer: Some(writer),
        })
    }

    /// One request/response exchange on a connection of its own, closed
    /// right after the reply. It shares the session of `client_id` with any
    /// persistent connection, so scope and authorization apply as usual.
    pub async fn call_once<A: ToSocketAddrs>(
        addr: A,
        client_id: &str,
        path: &str,
        kind: ProcedureKind,
        input: Value,
    ) -> Result<Value, ClientError> {
        let client = Self::connect(addr, client_id).await?;
        let result = client.invoke(path, kind, input).await;
        if let Err(e) = client.close().await {
            debug!("Closing one-shot connection for {} failed: {}", path, e);
        }
        result
    }

    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    /// Whether the server granted this session host rights.
    pub fn is_host(&self) -> bool {
        self.host
    }

    /// Whether the server reattached an existing session.
    pub fn resumed(&self) -> bool {
        self.resumed
    }

    pub fn broadcast_period(&self) -> Duration {
        self.broadcast_period
    }

    async fn request<F>(&self, build: F) -> Result<Value, ClientError>
    where
        F: FnOnce(RequestId) -> Packet,
    {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        match self.pending.lock().ok().as_deref_mut() {
            Some(Some(pending)) => {
                pending.insert(id, tx);
            }
            _ => return Err(ClientError::Closed),
        }

        if self.outgoing.send(build(id)).is_err() {
            if let Ok(Some(pending)) = self.pending.lock().as_deref_mut() {
                pending.remove(&id);
            }
            return Err(ClientError::Closed);
        }

        match rx.await {
            Ok(Ok(payload)) => Ok(payload.to_value()?),
            Ok(Err(err)) => Err(ClientError::Remote(err)),
            Err(_) => Err(ClientError::Closed),
        }
    }

    /// Calls a procedure as `kind`.
    pub async fn invoke(&self, path: &str, kind: ProcedureKind, input: Value) -> Result<Value, ClientError> {
        self.request(|id| Packet::Call {
            id,
            path: path.to_string(),
            kind,
            input: Payload::from_value(&input),
        })
        .await
    }

    pub async fn call(&self, path: &str, input: Value) -> Result<Value, ClientError> {
        self.invoke(path, ProcedureKind::Request, input).await
    }

    pub async fn send(&self, path: &str, input: Value) -> Result<Value, ClientError> {
        self.invoke(path, ProcedureKind::Send, input).await
    }

    /// Asks the server to push fresh results of `path` whenever a relevant
    /// event is published.
    pub async fn subscribe(&self, path: &str, input: Value) -> Result<Value, ClientError> {
        self.request(|id| Packet::Subscribe {
            id,
            path: path.to_string(),
            input: Payload::from_value(&input),
        })
        .await
    }

    /// Resolves to `true` if the subscription existed.
    pub async fn unsubscribe(&self, path: &str, input: Value) -> Result<Value, ClientError> {
        self.request(|id| Packet::Unsubscribe {
            id,
            path: path.to_string(),
            input: Payload::from_value(&input),
        })
        .await
    }

    pub async fn stream_subscribe(&self, path: &str, input: Value) -> Result<Value, ClientError> {
        self.request(|id| Packet::StreamSubscribe {
            id,
            path: path.to_string(),
            input: Payload::from_value(&input),
        })
        .await
    }

    pub async fn stream_unsubscribe(&self, path: &str, input: Value) -> Result<Value, ClientError> {
        self.request(|id| Packet::StreamUnsubscribe {
            id,
            path: path.to_string(),
            input: Payload::from_value(&input),
        })
        .await
    }

    /// Next server push. `None` after the connection is gone and every
    /// event has been consumed.
    pub async fn next_event(&mut self) -> Option<ClientEvent> {
        self.events.recv().await
    }

    /// Non-blocking variant of [`SyncClient::next_event`].
    pub fn try_next_event(&mut self) -> Option<ClientEvent> {
        self.events.try_recv().ok()
    }

    /// Says goodbye and waits for the outgoing queue to flush.
    pub async fn close(mut self) -> Result<(), ClientError> {
        self.outgoing
            .send(Packet::Goodbye)
            .map_err(|_| ClientError::Closed)?;
        if let Some(writer) = self.writer.take() {
            let _ = writer.await;
        }
        Ok(())
    }
}

impl Drop for SyncClient {
    fn drop(&mut self) {
        self.reader.abort();
    }
}

async fn write_loop(mut writer: OwnedWriteHalf, mut outgoing: mpsc::UnboundedReceiver<Packet>) {
    while let Some(packet) = outgoing.recv().await {
        let goodbye = matches!(packet, Packet::Goodbye);
        if let Err(e) = write_packet(&mut writer, &packet).await {
            debug!("Failed to send {}: {}", packet.name(), e);
            break;
        }
        if goodbye {
            break;
        }
    }
    let _ = writer.shutdown().await;
}

async fn read_loop(
    mut reader: OwnedReadHalf,
    pending: PendingReplies,
    events: mpsc::UnboundedSender<ClientEvent>,
) {
    let reason = loop {
        match read_packet(&mut reader).await {
            Ok(Packet::Reply { id, result, .. }) => {
                let waiter = match pending.lock().as_deref_mut() {
                    Ok(Some(waiting)) => waiting.remove(&id),
                    _ => None,
                };
                match waiter {
                    Some(waiter) => {
                        let _ = waiter.send(result);
                    }
                    None => warn!("Reply for unknown request {}", id),
                }
            }
            Ok(Packet::PublishResult {
                path,
                input,
                result,
            }) => match (input.to_value(), result.to_value()) {
                (Ok(input), Ok(result)) => {
                    let _ = events.send(ClientEvent::Published {
                        path,
                        input,
                        result,
                    });
                }
                _ => warn!("Undecodable publish result for {}", path),
            },
            Ok(Packet::Snapshot(snapshot)) => {
                let _ = events.send(ClientEvent::Snapshot(snapshot));
            }
            Ok(Packet::Disconnected { reason }) => break reason,
            Ok(other) => warn!("Unexpected {} packet from server", other.name()),
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                break "connection closed".to_string()
            }
            Err(e) => break e.to_string(),
        }
    };

    info!("Disconnected: {}", reason);
    // Dropping the senders fails every outstanding call with `Closed`
    if let Ok(mut pending) = pending.lock() {
        pending.take();
    }
    let _ = events.send(ClientEvent::Disconnected { reason });
}
