//! One period of the data-stream broadcast loop.
//!
//! Every active connection's stream subscriptions are evaluated against the
//! current entity set and batched into a single snapshot. The snapshot is
//! skipped when its content matches what the connection was last sent.

use crate::connection_manager::ConnectionManager;
use crate::encoder::{fingerprint, StreamItem};
use crate::procedure::FilterArgs;
use crate::registry::Registry;
use crate::session::SessionStore;
use crate::world::World;
use log::{debug, warn};
use shared::{Payload, Snapshot, StreamBatch};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BroadcastStats {
    /// Snapshots handed to outbound queues.
    pub sent: usize,
    /// Connections whose snapshot was identical to the previous one.
    pub unchanged: usize,
    pub records: usize,
    /// Entities dropped because a filter or projection failed.
    pub filter_errors: usize,
}

pub fn broadcast_tick(
    registry: &Registry,
    connections: &mut ConnectionManager,
    sessions: &SessionStore,
    world: &dyn World,
    now_ms: u64,
) -> BroadcastStats {
    let mut stats = BroadcastStats::default();

    for connection in connections.iter_mut() {
        if !connection.is_active() || connection.streams().is_empty() {
            continue;
        }
        let session = match sessions.get(connection.client_id()) {
            Some(session) => session,
            None => continue,
        };

        let mut batches = Vec::with_capacity(connection.streams().len());
        for subscription in connection.streams_mut() {
            let stream = match registry.stream(&subscription.key.path, &subscription.input) {
                Ok(stream) => stream,
                Err(err) => {
                    warn!("Skipping stream {}: {}", subscription.key.path, err);
                    continue;
                }
            };
            let args = FilterArgs {
                input: &subscription.input,
                session,
                world,
            };

            let mut items = Vec::new();
            for entity in world.entities() {
                match stream.evaluate(entity, &args) {
                    Ok(Some(fields)) => items.push(StreamItem {
                        id: entity.id.clone(),
                        epoch: entity.epoch,
                        fields,
                    }),
                    Ok(None) => {}
                    Err(err) => {
                        stats.filter_errors += 1;
                        warn!(
                            "Dropping entity {} from {} for client {}: {}",
                            entity.id,
                            subscription.key.path,
                            session.client_id(),
                            err
                        );
                    }
                }
            }

            let records = subscription.encoder.encode(items);
            batches.push(StreamBatch {
                path: subscription.key.path.clone(),
                input: Payload::from_value(&subscription.input),
                records,
            });
        }

        let content = fingerprint(&batches);
        if connection.last_fingerprint == Some(content) {
            stats.unchanged += 1;
            continue;
        }

        let snapshot = Snapshot {
            timestamp: connection.clock.next(now_ms),
            streams: batches,
        };
        let records = snapshot.record_count();
        if connection.send_snapshot(snapshot) {
            connection.last_fingerprint = Some(content);
            stats.sent += 1;
            stats.records += records;
        }
    }

    if stats.sent > 0 || stats.filter_errors > 0 {
        debug!(
            "Broadcast: {} snapshots, {} records, {} unchanged, {} filter errors",
            stats.sent, stats.records, stats.unchanged, stats.filter_errors
        );
    }
    stats
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::{ConnectionId, Outbound, OutboundReceiver};
    use crate::error::ProcedureError;
    use crate::procedure::Stream;
    use crate::registry::RegistryBuilder;
    use crate::session::HostPolicy;
    use crate::world::{Entity, EntityTable};
    use serde_json::json;
    use shared::{Packet, SnapshotFields};

    struct Harness {
        registry: Registry,
        connections: ConnectionManager,
        sessions: SessionStore,
        world: EntityTable,
        now: u64,
    }

    impl Harness {
        fn new() -> Self {
            let registry = RegistryBuilder::new()
                .stream(
                    "ships.in_system",
                    Stream::new(|entity, args| {
                        Ok(entity.attribute("system") == Some(&args.input["system"]))
                    }),
                )
                .stream(
                    "ships.gauges",
                    Stream::new(|entity, _| {
                        if entity.id == "cursed" {
                            return Err(ProcedureError::resolver("sensor fault"));
                        }
                        Ok(true)
                    })
                    .project(|entity, _| Ok(SnapshotFields::Channels(entity.channels))),
                )
                .build()
                .unwrap();

            let mut world = EntityTable::new();
            world.insert(Entity::new("a", "ship").with_attribute("system", "sol"));
            world.insert(Entity::new("b", "ship").with_attribute("system", "vega"));

            Self {
                registry,
                connections: ConnectionManager::new(8),
                sessions: SessionStore::new(None, HostPolicy::FirstClient),
                world,
                now: 1_000,
            }
        }

        fn connect(&mut self, client_id: &str) -> (ConnectionId, OutboundReceiver) {
            let (outbound, rx) = Outbound::channel();
            self.sessions.attach(client_id);
            let id = self
                .connections
                .add_connection(client_id, "127.0.0.1:9000".parse().unwrap(), outbound)
                .unwrap();
            self.connections.get_mut(id).unwrap().activate();
            (id, rx)
        }

        fn tick(&mut self) -> BroadcastStats {
            self.now += 50;
            broadcast_tick(
                &self.registry,
                &mut self.connections,
                &self.sessions,
                &self.world,
                self.now,
            )
        }
    }

    fn snapshot(rx: &mut OutboundReceiver) -> Option<Snapshot> {
        match rx.try_next() {
            Some(Packet::Snapshot(snapshot)) => Some(snapshot),
            Some(other) => panic!("Unexpected packet {:?}", other),
            None => None,
        }
    }

    fn ids(snapshot: &Snapshot) -> Vec<&str> {
        snapshot.records().map(|r| r.id.as_str()).collect()
    }

    #[test]
    fn test_filter_selects_entities_and_follows_changes() {
        let mut h = Harness::new();
        let (id, mut rx) = h.connect("alice");
        h.connections
            .get_mut(id)
            .unwrap()
            .stream_subscribe("ships.in_system", json!({"system": "sol"}));

        h.tick();
        let first = snapshot(&mut rx).unwrap();
        assert_eq!(ids(&first), vec!["a"]);

        h.world.get_mut("b").unwrap().set_attribute("system", "sol");
        h.tick();
        let second = snapshot(&mut rx).unwrap();
        assert_eq!(ids(&second), vec!["a", "b"]);
        assert!(second.timestamp > first.timestamp);

        // b is new to this stream, a is not
        let cuts: Vec<bool> = second.records().map(|r| r.hard_cut).collect();
        assert_eq!(cuts, vec![false, true]);
    }

    #[test]
    fn test_unchanged_snapshot_is_skipped() {
        let mut h = Harness::new();
        let (id, mut rx) = h.connect("alice");
        h.connections
            .get_mut(id)
            .unwrap()
            .stream_subscribe("ships.in_system", json!({"system": "sol"}));

        assert_eq!(h.tick().sent, 1);
        snapshot(&mut rx).unwrap();

        // Second tick clears the first-appearance hard cut
        assert_eq!(h.tick().sent, 1);
        snapshot(&mut rx).unwrap();

        let stats = h.tick();
        assert_eq!(stats.sent, 0);
        assert_eq!(stats.unchanged, 1);
        assert!(snapshot(&mut rx).is_none());

        h.world.get_mut("a").unwrap().position = [1.0, 0.0, 0.0];
        assert_eq!(h.tick().sent, 1);
    }

    #[test]
    fn test_failing_entity_does_not_abort_tick() {
        let mut h = Harness::new();
        h.world.insert(Entity::new("cursed", "ship"));
        let (alice, mut alice_rx) = h.connect("alice");
        let (bob, mut bob_rx) = h.connect("bob");
        for id in [alice, bob] {
            h.connections
                .get_mut(id)
                .unwrap()
                .stream_subscribe("ships.gauges", json!(null));
        }

        let stats = h.tick();
        assert_eq!(stats.sent, 2);
        assert_eq!(stats.filter_errors, 2);
        for rx in [&mut alice_rx, &mut bob_rx] {
            assert_eq!(ids(&snapshot(rx).unwrap()), vec!["a", "b"]);
        }
    }

    #[test]
    fn test_streams_batched_per_connection() {
        let mut h = Harness::new();
        let (id, mut rx) = h.connect("alice");
        {
            let conn = h.connections.get_mut(id).unwrap();
            conn.stream_subscribe("ships.in_system", json!({"system": "vega"}));
            conn.stream_subscribe("ships.gauges", json!(null));
        }

        h.tick();
        let snapshot = snapshot(&mut rx).unwrap();
        assert_eq!(snapshot.streams.len(), 2);
        assert_eq!(snapshot.streams[0].path, "ships.in_system");
        assert_eq!(snapshot.streams[0].records.len(), 1);
        assert_eq!(snapshot.streams[1].path, "ships.gauges");
        assert!(matches!(
            snapshot.streams[1].records[0].fields,
            SnapshotFields::Channels(_)
        ));
    }

    #[test]
    fn test_closed_and_unsubscribed_connections_get_nothing() {
        let mut h = Harness::new();
        let (gone, mut gone_rx) = h.connect("alice");
        let (quiet, mut quiet_rx) = h.connect("bob");
        h.connections
            .get_mut(gone)
            .unwrap()
            .stream_subscribe("ships.gauges", json!(null));
        h.connections.remove_connection(gone);
        assert!(h.connections.get(quiet).unwrap().streams().is_empty());

        let stats = h.tick();
        assert_eq!(stats.sent, 0);
        assert!(snapshot(&mut gone_rx).is_none());
        assert!(snapshot(&mut quiet_rx).is_none());
    }

    #[test]
    fn test_hard_cut_survives_superseded_snapshot() {
        let mut h = Harness::new();
        let (id, mut rx) = h.connect("alice");
        h.connections
            .get_mut(id)
            .unwrap()
            .stream_subscribe("ships.in_system", json!({"system": "sol"}));
        for _ in 0..2 {
            h.tick();
            snapshot(&mut rx).unwrap();
        }

        h.world.get_mut("a").unwrap().teleport([5000.0, 0.0, 0.0]);
        assert_eq!(h.tick().sent, 1);
        // Writer has not caught up before the next period
        h.world.get_mut("a").unwrap().position = [5001.0, 0.0, 0.0];
        assert_eq!(h.tick().sent, 1);

        let delivered = snapshot(&mut rx).unwrap();
        assert!(snapshot(&mut rx).is_none());
        let record = delivered.records().next().unwrap();
        assert_eq!(record.fields.position(), Some([5001.0, 0.0, 0.0]));
        assert!(record.hard_cut);

        // Once delivered, the cut is not repeated
        h.world.get_mut("a").unwrap().position = [5002.0, 0.0, 0.0];
        h.tick();
        assert!(!snapshot(&mut rx).unwrap().records().next().unwrap().hard_cut);
    }

    #[test]
    fn test_timestamps_strictly_increase_with_stalled_clock() {
        let mut h = Harness::new();
        let (id, mut rx) = h.connect("alice");
        h.connections
            .get_mut(id)
            .unwrap()
            .stream_subscribe("ships.in_system", json!({"system": "sol"}));

        let mut last = 0;
        for step in 0..3 {
            h.world.get_mut("a").unwrap().position = [step as f32, 0.0, 0.0];
            broadcast_tick(&h.registry, &mut h.connections, &h.sessions, &h.world, 5_000);
            let snapshot = snapshot(&mut rx).unwrap();
            assert!(snapshot.timestamp > last);
            last = snapshot.timestamp;
        }
    }
}
