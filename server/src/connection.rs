//! Per-socket connection state.
//!
//! A [`Connection`] exists from the moment a socket identifies until it
//! closes. It owns the client's subscriptions and the outbound side of the
//! socket. Nothing here outlives the socket; durable state lives in the
//! session store.

use crate::encoder::{SnapshotClock, SnapshotEncoder, DEFAULT_HARD_CUT_DISTANCE};
use log::debug;
use serde_json::Value;
use shared::{Packet, ProcedureKind, Snapshot};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{mpsc, watch};

pub type ConnectionId = u32;

/// The wait for `Identify` happens in the socket task before a
/// `Connection` exists, so the first state is `Identified`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Identified and attached to a session, welcome not yet sent.
    Identified,
    /// Accepting calls and subscriptions.
    Active,
    Closed,
}

/// Sending half of a connection's outbound queue.
///
/// Replies and publish results are queued in order. Snapshots go through a
/// single slot instead, so a snapshot the writer has not sent yet is
/// replaced by the next one. Hard cuts in a replaced snapshot carry over
/// into its replacement.
#[derive(Debug)]
pub struct Outbound {
    packets: mpsc::UnboundedSender<Packet>,
    snapshots: watch::Sender<Option<Snapshot>>,
    /// Timestamp of the last snapshot the receiver took.
    delivered: Arc<AtomicU64>,
}

pub struct OutboundReceiver {
    packets: mpsc::UnboundedReceiver<Packet>,
    snapshots: watch::Receiver<Option<Snapshot>>,
    snapshots_open: bool,
    delivered: Arc<AtomicU64>,
}

impl Outbound {
    pub fn channel() -> (Outbound, OutboundReceiver) {
        let (packets_tx, packets_rx) = mpsc::unbounded_channel();
        let (snapshots_tx, snapshots_rx) = watch::channel(None);
        let delivered = Arc::new(AtomicU64::new(0));
        (
            Outbound {
                packets: packets_tx,
                snapshots: snapshots_tx,
                delivered: Arc::clone(&delivered),
            },
            OutboundReceiver {
                packets: packets_rx,
                snapshots: snapshots_rx,
                snapshots_open: true,
                delivered,
            },
        )
    }

    pub fn send(&self, packet: Packet) -> bool {
        self.packets.send(packet).is_ok()
    }

    /// Replaces any snapshot that has not been written yet, keeping its
    /// hard cuts.
    pub fn send_snapshot(&self, mut snapshot: Snapshot) -> bool {
        if self.packets.is_closed() {
            return false;
        }
        self.snapshots.send_modify(|slot| {
            // The receiver records delivery under the slot's read lock
            let delivered = self.delivered.load(Ordering::Acquire);
            if let Some(pending) = slot.as_ref().filter(|p| p.timestamp > delivered) {
                let carried = snapshot.carry_hard_cuts(pending);
                if carried > 0 {
                    debug!(
                        "Snapshot {} superseded, carried {} hard cuts",
                        pending.timestamp, carried
                    );
                }
            }
            *slot = Some(snapshot);
        });
        true
    }

    pub fn is_closed(&self) -> bool {
        self.packets.is_closed()
    }
}

impl OutboundReceiver {
    /// Next packet to write, preferring queued packets over the snapshot
    /// slot. `None` once the sending side is gone.
    pub async fn next(&mut self) -> Option<Packet> {
        loop {
            tokio::select! {
                biased;
                packet = self.packets.recv() => return packet,
                changed = self.snapshots.changed(), if self.snapshots_open => {
                    if changed.is_err() {
                        self.snapshots_open = false;
                        continue;
                    }
                    if let Some(snapshot) = self.take_snapshot() {
                        return Some(Packet::Snapshot(snapshot));
                    }
                }
            }
        }
    }

    /// Non-blocking variant of [`OutboundReceiver::next`].
    pub fn try_next(&mut self) -> Option<Packet> {
        if let Ok(packet) = self.packets.try_recv() {
            return Some(packet);
        }
        if self.snapshots.has_changed().unwrap_or(false) {
            return self.take_snapshot().map(Packet::Snapshot);
        }
        None
    }

    fn take_snapshot(&mut self) -> Option<Snapshot> {
        let slot = self.snapshots.borrow_and_update();
        let snapshot = (*slot).clone()?;
        self.delivered.store(snapshot.timestamp, Ordering::Release);
        Some(snapshot)
    }
}

/// Identity of a subscription within one connection.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriptionKey {
    pub path: String,
    /// Canonical JSON text of the input.
    pub input_identity: String,
}

impl SubscriptionKey {
    pub fn new(path: &str, input: &Value) -> Self {
        // serde_json objects are key-sorted, so equal documents print equally
        Self {
            path: path.to_string(),
            input_identity: input.to_string(),
        }
    }
}

/// Standing request to re-run a request/send procedure on publish.
#[derive(Debug, Clone)]
pub struct Subscription {
    pub key: SubscriptionKey,
    pub kind: ProcedureKind,
    pub input: Value,
}

/// Standing data-stream subscription with its own encoder state.
#[derive(Debug, Clone)]
pub struct StreamSubscription {
    pub key: SubscriptionKey,
    pub input: Value,
    pub encoder: SnapshotEncoder,
}

#[derive(Debug)]
pub struct Connection {
    id: ConnectionId,
    client_id: String,
    pub addr: SocketAddr,
    state: ConnectionState,
    outbound: Outbound,
    subscriptions: Vec<Subscription>,
    streams: Vec<StreamSubscription>,
    hard_cut_distance: f32,
    pub clock: SnapshotClock,
    pub last_fingerprint: Option<u64>,
    pub connected_at: Instant,
    pub last_seen: Instant,
}

impl Connection {
    pub fn new(id: ConnectionId, client_id: &str, addr: SocketAddr, outbound: Outbound) -> Self {
        let now = Instant::now();
        Self {
            id,
            client_id: client_id.to_string(),
            addr,
            state: ConnectionState::Identified,
            outbound,
            subscriptions: Vec::new(),
            streams: Vec::new(),
            hard_cut_distance: DEFAULT_HARD_CUT_DISTANCE,
            clock: SnapshotClock::default(),
            last_fingerprint: None,
            connected_at: now,
            last_seen: now,
        }
    }

    pub fn with_hard_cut_distance(mut self, distance: f32) -> Self {
        self.hard_cut_distance = distance;
        self
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn is_active(&self) -> bool {
        self.state == ConnectionState::Active
    }

    pub fn activate(&mut self) {
        if self.state == ConnectionState::Identified {
            self.state = ConnectionState::Active;
        }
    }

    /// Moves to `Closed` and drops every subscription. Nothing is sent
    /// afterwards.
    pub fn close(&mut self) {
        if self.state != ConnectionState::Closed {
            debug!(
                "Connection {} for client {} closed with {} subscriptions and {} streams",
                self.id,
                self.client_id,
                self.subscriptions.len(),
                self.streams.len()
            );
        }
        self.state = ConnectionState::Closed;
        self.subscriptions.clear();
        self.streams.clear();
    }

    pub fn touch(&mut self) {
        self.last_seen = Instant::now();
    }

    pub fn send(&self, packet: Packet) -> bool {
        self.state != ConnectionState::Closed && self.outbound.send(packet)
    }

    pub fn send_snapshot(&self, snapshot: Snapshot) -> bool {
        self.state == ConnectionState::Active && self.outbound.send_snapshot(snapshot)
    }

    /// Adds a publish subscription. Returns false if an identical one
    /// already existed.
    pub fn subscribe(&mut self, path: &str, kind: ProcedureKind, input: Value) -> bool {
        let key = SubscriptionKey::new(path, &input);
        if self.subscriptions.iter().any(|s| s.key == key) {
            return false;
        }
        self.subscriptions.push(Subscription { key, kind, input });
        true
    }

    /// Returns whether a matching subscription existed.
    pub fn unsubscribe(&mut self, path: &str, input: &Value) -> bool {
        let key = SubscriptionKey::new(path, input);
        let before = self.subscriptions.len();
        self.subscriptions.retain(|s| s.key != key);
        self.subscriptions.len() != before
    }

    pub fn stream_subscribe(&mut self, path: &str, input: Value) -> bool {
        let key = SubscriptionKey::new(path, &input);
        if self.streams.iter().any(|s| s.key == key) {
            return false;
        }
        self.streams.push(StreamSubscription {
            key,
            input,
            encoder: SnapshotEncoder::new(self.hard_cut_distance),
        });
        self.last_fingerprint = None;
        true
    }

    pub fn stream_unsubscribe(&mut self, path: &str, input: &Value) -> bool {
        let key = SubscriptionKey::new(path, input);
        let before = self.streams.len();
        self.streams.retain(|s| s.key != key);
        let removed = self.streams.len() != before;
        if removed {
            self.last_fingerprint = None;
        }
        removed
    }

    pub fn subscriptions(&self) -> impl Iterator<Item = &Subscription> {
        self.subscriptions.iter()
    }

    pub fn streams(&self) -> &[StreamSubscription] {
        &self.streams
    }

    pub fn streams_mut(&mut self) -> &mut [StreamSubscription] {
        &mut self.streams
    }

    pub fn subscription_count(&self) -> usize {
        self.subscriptions.len() + self.streams.len()
    }
}
