//! Process-local publish/subscribe fan-out.
//!
//! [`Broker`] is a cheap cloneable handle. The simulation, resolvers, and
//! anything else holding one call [`Broker::publish`]; events land in a
//! single FIFO ([`PublishQueue`]) owned by the server loop, which hands each
//! one to [`fan_out`] in the order it was published. A subscription is a
//! standing request to re-run a procedure, so subscribers receive the
//! resolver's fresh result for their own input, never the raw payload.

use crate::connection_manager::ConnectionManager;
use crate::procedure::{Context, FilterArgs};
use crate::registry::Registry;
use crate::session::SessionStore;
use crate::world::World;
use log::{debug, warn};
use serde_json::Value;
use shared::{Packet, Payload};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;

#[derive(Debug, Clone, PartialEq)]
pub struct Published {
    pub sequence: u64,
    pub event: String,
    pub payload: Value,
}

#[derive(Clone)]
pub struct Broker {
    tx: mpsc::UnboundedSender<Published>,
    next_sequence: Arc<AtomicU64>,
}

pub struct PublishQueue {
    rx: mpsc::UnboundedReceiver<Published>,
}

impl Broker {
    /// Creates an isolated broker and the queue that receives its events.
    pub fn channel() -> (Broker, PublishQueue) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Broker {
                tx,
                next_sequence: Arc::new(AtomicU64::new(0)),
            },
            PublishQueue { rx },
        )
    }

    /// Queues an event for fan-out. Returns false once the server loop that
    /// owned the queue has stopped.
    pub fn publish(&self, event: impl Into<String>, payload: Value) -> bool {
        let published = Published {
            sequence: self.next_sequence.fetch_add(1, Ordering::Relaxed),
            event: event.into(),
            payload,
        };
        self.tx.send(published).is_ok()
    }
}

impl PublishQueue {
    pub async fn recv(&mut self) -> Option<Published> {
        self.rx.recv().await
    }

    pub fn try_next(&mut self) -> Option<Published> {
        self.rx.try_recv().ok()
    }

    /// Takes every event queued so far. Events published while the caller
    /// fans these out stay queued for the next call, so a resolver that
    /// republishes its own topic cannot keep a drain going forever.
    pub fn take_pending(&mut self) -> Vec<Published> {
        let mut pending = Vec::new();
        while let Ok(published) = self.rx.try_recv() {
            pending.push(published);
        }
        pending
    }
}

/// Re-runs every matching request/send subscription for one published event
/// and pushes the fresh results. Returns the number of results delivered.
///
/// Filter failures exclude that subscription for this event. Resolver
/// failures are logged and nothing is pushed for that subscription.
pub fn fan_out(
    published: &Published,
    registry: &Registry,
    connections: &mut ConnectionManager,
    sessions: &mut SessionStore,
    world: &dyn World,
    broker: &Broker,
) -> usize {
    let paths = registry.paths_for_topic(&published.event);
    if paths.is_empty() {
        return 0;
    }

    let mut delivered = 0;

    for connection in connections.iter_mut() {
        if !connection.is_active() {
            continue;
        }

        let session = match sessions.get_mut(connection.client_id()) {
            Some(session) => session,
            None => continue,
        };

        let matching: Vec<(String, Value)> = connection
            .subscriptions()
            .filter(|s| paths.iter().any(|p| p == &s.key.path))
            .map(|s| (s.key.path.clone(), s.input.clone()))
            .collect();

        for (path, input) in matching {
            let endpoint = match registry.resolve(&path).ok().and_then(|p| p.endpoint()) {
                Some(endpoint) => endpoint,
                None => continue,
            };

            let args = FilterArgs {
                input: &input,
                session: &*session,
                world,
            };
            match endpoint.accepts(&published.payload, &args) {
                Ok(true) => {}
                Ok(false) => continue,
                Err(err) => {
                    warn!(
                        "Excluding {} for client {} from event {}: {}",
                        path,
                        connection.client_id(),
                        published.event,
                        err
                    );
                    continue;
                }
            }

            let mut ctx = Context {
                session: &mut *session,
                world,
                broker,
            };
            match endpoint.resolve(&mut ctx, &input) {
                Ok(result) => {
                    let packet = Packet::PublishResult {
                        path: path.clone(),
                        input: Payload::from_value(&input),
                        result: Payload::from_value(&result),
                    };
                    if connection.send(packet) {
                        delivered += 1;
                    }
                }
                Err(err) => {
                    warn!(
                        "Re-running {} for client {} after {} failed: {}",
                        path,
                        connection.client_id(),
                        published.event,
                        err
                    );
                }
            }
        }
    }

    debug!(
        "Event {} (#{}) delivered {} results",
        published.event, published.sequence, delivered
    );
    delivered
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::{ConnectionId, Outbound};
    use crate::error::ProcedureError;
    use crate::procedure::Endpoint;
    use crate::registry::RegistryBuilder;
    use crate::session::HostPolicy;
    use crate::world::EntityTable;
    use serde_json::json;
    use shared::ProcedureKind;
    use std::sync::atomic::AtomicUsize;

    struct Harness {
        registry: Registry,
        connections: ConnectionManager,
        sessions: SessionStore,
        world: EntityTable,
        broker: Broker,
        queue: PublishQueue,
    }

    impl Harness {
        fn new(registry: Registry) -> Self {
            let (broker, queue) = Broker::channel();
            Self {
                registry,
                connections: ConnectionManager::new(8),
                sessions: SessionStore::new(None, HostPolicy::FirstClient),
                world: EntityTable::new(),
                broker,
                queue,
            }
        }

        fn connect(&mut self, client_id: &str) -> (ConnectionId, crate::connection::OutboundReceiver) {
            let (outbound, rx) = Outbound::channel();
            self.sessions.attach(client_id);
            let id = self
                .connections
                .add_connection(client_id, "127.0.0.1:9000".parse().unwrap(), outbound)
                .unwrap();
            self.connections.get_mut(id).unwrap().activate();
            (id, rx)
        }

        fn publish(&mut self, event: &str, payload: Value) -> usize {
            let published = Published {
                sequence: 0,
                event: event.to_string(),
                payload,
            };
            fan_out(
                &published,
                &self.registry,
                &mut self.connections,
                &mut self.sessions,
                &self.world,
                &self.broker,
            )
        }
    }

    fn cargo_registry(runs: Arc<AtomicUsize>) -> Registry {
        RegistryBuilder::new()
            .request(
                "cargo.manifest",
                Endpoint::new(move |_, input| {
                    runs.fetch_add(1, Ordering::SeqCst);
                    Ok(json!({"station": input["station"].clone(), "crates": 3}))
                })
                .topic("cargo.changed")
                .filter(|payload, args| Ok(payload["station"] == args.input["station"])),
            )
            .build()
            .unwrap()
    }

    fn drain(rx: &mut crate::connection::OutboundReceiver) -> Vec<Packet> {
        let mut packets = Vec::new();
        while let Some(packet) = rx.try_next() {
            packets.push(packet);
        }
        packets
    }

    #[test]
    fn test_publish_assigns_increasing_sequence() {
        let (broker, mut queue) = Broker::channel();
        assert!(broker.publish("a", json!(1)));
        assert!(broker.publish("b", json!(2)));

        let first = queue.try_next().unwrap();
        let second = queue.try_next().unwrap();
        assert_eq!(first.event, "a");
        assert_eq!(second.event, "b");
        assert!(second.sequence > first.sequence);
        assert!(queue.try_next().is_none());
    }

    #[test]
    fn test_republishing_resolver_is_drained_one_round_at_a_time() {
        let registry = RegistryBuilder::new()
            .send(
                "beacon",
                Endpoint::new(|ctx, _| {
                    ctx.broker.publish("beacon", json!(null));
                    Ok(json!("pulse"))
                })
                .topic("beacon"),
            )
            .build()
            .unwrap();
        let mut harness = Harness::new(registry);
        let (id, mut rx) = harness.connect("alice");
        harness
            .connections
            .get_mut(id)
            .unwrap()
            .subscribe("beacon", ProcedureKind::Send, Value::Null);

        harness.broker.publish("beacon", json!(null));
        for _ in 0..3 {
            let pending = harness.queue.take_pending();
            assert_eq!(pending.len(), 1);
            for published in &pending {
                fan_out(
                    published,
                    &harness.registry,
                    &mut harness.connections,
                    &mut harness.sessions,
                    &harness.world,
                    &harness.broker,
                );
            }
            assert_eq!(drain(&mut rx).len(), 1);
        }
    }

    #[test]
    fn test_publish_after_queue_dropped_reports_false() {
        let (broker, queue) = Broker::channel();
        drop(queue);
        assert!(!broker.publish("a", json!(null)));
    }

    #[test]
    fn test_each_subscriber_gets_result_for_own_input() {
        let runs = Arc::new(AtomicUsize::new(0));
        let mut harness = Harness::new(cargo_registry(runs.clone()));

        let (alice, mut alice_rx) = harness.connect("alice");
        let (bob, mut bob_rx) = harness.connect("bob");
        harness.connections.get_mut(alice).unwrap().subscribe(
            "cargo.manifest",
            ProcedureKind::Request,
            json!({"station": "ceres"}),
        );
        harness.connections.get_mut(bob).unwrap().subscribe(
            "cargo.manifest",
            ProcedureKind::Request,
            json!({"station": "vesta"}),
        );

        let delivered = harness.publish("cargo.changed", json!({"station": "ceres"}));
        assert_eq!(delivered, 1);
        assert_eq!(runs.load(Ordering::SeqCst), 1);

        match drain(&mut alice_rx).as_slice() {
            [Packet::PublishResult { path, result, .. }] => {
                assert_eq!(path, "cargo.manifest");
                assert_eq!(result.to_value().unwrap()["station"], json!("ceres"));
            }
            other => panic!("Unexpected packets {:?}", other),
        }
        assert!(drain(&mut bob_rx).is_empty());
    }

    #[test]
    fn test_unrelated_event_delivers_nothing() {
        let runs = Arc::new(AtomicUsize::new(0));
        let mut harness = Harness::new(cargo_registry(runs.clone()));
        let (alice, mut alice_rx) = harness.connect("alice");
        harness.connections.get_mut(alice).unwrap().subscribe(
            "cargo.manifest",
            ProcedureKind::Request,
            json!({"station": "ceres"}),
        );

        assert_eq!(harness.publish("power.changed", json!({})), 0);
        assert_eq!(runs.load(Ordering::SeqCst), 0);
        assert!(drain(&mut alice_rx).is_empty());
    }

    #[test]
    fn test_duplicate_subscription_delivers_once() {
        let runs = Arc::new(AtomicUsize::new(0));
        let mut harness = Harness::new(cargo_registry(runs));
        let (alice, mut alice_rx) = harness.connect("alice");
        for _ in 0..2 {
            harness.connections.get_mut(alice).unwrap().subscribe(
                "cargo.manifest",
                ProcedureKind::Request,
                json!({"station": "ceres"}),
            );
        }

        harness.publish("cargo.changed", json!({"station": "ceres"}));
        assert_eq!(drain(&mut alice_rx).len(), 1);
    }

    #[test]
    fn test_failing_filter_excludes_without_affecting_others() {
        let registry = RegistryBuilder::new()
            .request(
                "fragile",
                Endpoint::new(|_, _| Ok(json!("ok"))).filter(|_, args| {
                    if args.session.client_id() == "alice" {
                        Err(ProcedureError::resolver("cannot judge alice"))
                    } else {
                        Ok(true)
                    }
                }),
            )
            .build()
            .unwrap();
        let mut harness = Harness::new(registry);
        let (alice, mut alice_rx) = harness.connect("alice");
        let (bob, mut bob_rx) = harness.connect("bob");
        for id in [alice, bob] {
            harness.connections.get_mut(id).unwrap().subscribe(
                "fragile",
                ProcedureKind::Request,
                Value::Null,
            );
        }

        assert_eq!(harness.publish("fragile", json!({})), 1);
        assert!(drain(&mut alice_rx).is_empty());
        assert_eq!(drain(&mut bob_rx).len(), 1);
    }

    #[test]
    fn test_closed_connection_receives_nothing() {
        let runs = Arc::new(AtomicUsize::new(0));
        let mut harness = Harness::new(cargo_registry(runs.clone()));
        let (alice, _alice_rx) = harness.connect("alice");
        harness.connections.get_mut(alice).unwrap().subscribe(
            "cargo.manifest",
            ProcedureKind::Request,
            json!({"station": "ceres"}),
        );
        harness.connections.remove_connection(alice);

        assert_eq!(harness.publish("cargo.changed", json!({"station": "ceres"})), 0);
        assert_eq!(runs.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_results_arrive_in_publish_order() {
        let registry = RegistryBuilder::new()
            .request(
                "echo",
                Endpoint::new(|ctx, _| Ok(json!(ctx.world.tick()))).topic("tick"),
            )
            .build()
            .unwrap();
        let mut harness = Harness::new(registry);
        let (alice, mut alice_rx) = harness.connect("alice");
        harness.connections.get_mut(alice).unwrap().subscribe(
            "echo",
            ProcedureKind::Request,
            Value::Null,
        );

        for tick in 1..=3 {
            harness.world.tick = tick;
            harness.publish("tick", json!(tick));
        }

        let ticks: Vec<Value> = drain(&mut alice_rx)
            .into_iter()
            .map(|p| match p {
                Packet::PublishResult { result, .. } => result.to_value().unwrap(),
                other => panic!("Unexpected packet {:?}", other),
            })
            .collect();
        assert_eq!(ticks, vec![json!(1), json!(2), json!(3)]);
    }
}
