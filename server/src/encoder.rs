//! Per-subscription snapshot encoding.
//!
//! The encoder remembers, for every entity it has emitted, the epoch and
//! position it last reported. That is enough to decide when a client must
//! snap instead of interpolate: the first time an entity appears, after the
//! simulation bumped its epoch, or when it moved further than the
//! configured distance since the previous snapshot.

use shared::{SnapshotFields, SnapshotRecord};
use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};

/// Jumps longer than this are treated as teleports even without an epoch bump.
pub const DEFAULT_HARD_CUT_DISTANCE: f32 = 50.0;

#[derive(Debug, Clone, Copy)]
struct LastSeen {
    epoch: u32,
    position: Option<[f32; 3]>,
}

/// One filtered and projected entity, ready to encode.
#[derive(Debug, Clone)]
pub struct StreamItem {
    pub id: String,
    pub epoch: u32,
    pub fields: SnapshotFields,
}

#[derive(Debug, Clone)]
pub struct SnapshotEncoder {
    last_seen: HashMap<String, LastSeen>,
    hard_cut_distance: f32,
}

impl SnapshotEncoder {
    pub fn new(hard_cut_distance: f32) -> Self {
        Self {
            last_seen: HashMap::new(),
            hard_cut_distance,
        }
    }

    /// Encodes this period's items, sorted by entity id. Entities absent
    /// from `items` are forgotten, so they hard-cut if they come back.
    pub fn encode(&mut self, mut items: Vec<StreamItem>) -> Vec<SnapshotRecord> {
        items.sort_by(|a, b| a.id.cmp(&b.id));

        let mut next_seen = HashMap::with_capacity(items.len());
        let mut records = Vec::with_capacity(items.len());

        for item in items {
            let position = item.fields.position();
            let hard_cut = match self.last_seen.get(&item.id) {
                None => true,
                Some(previous) if previous.epoch != item.epoch => true,
                Some(previous) => match (previous.position, position) {
                    (Some(from), Some(to)) => distance(from, to) > self.hard_cut_distance,
                    _ => false,
                },
            };

            next_seen.insert(
                item.id.clone(),
                LastSeen {
                    epoch: item.epoch,
                    position,
                },
            );
            records.push(SnapshotRecord {
                id: item.id,
                fields: item.fields,
                hard_cut,
            });
        }

        self.last_seen = next_seen;
        records
    }

    /// Forgets everything, e.g. after the subscription input changed.
    pub fn reset(&mut self) {
        self.last_seen.clear();
    }

    pub fn tracked(&self) -> usize {
        self.last_seen.len()
    }
}

impl Default for SnapshotEncoder {
    fn default() -> Self {
        Self::new(DEFAULT_HARD_CUT_DISTANCE)
    }
}

fn distance(a: [f32; 3], b: [f32; 3]) -> f32 {
    let dx = a[0] - b[0];
    let dy = a[1] - b[1];
    let dz = a[2] - b[2];
    (dx * dx + dy * dy + dz * dz).sqrt()
}

/// Content hash of a snapshot body, ignoring the timestamp. Two equal
/// fingerprints mean nothing changed since the last send.
pub fn fingerprint<T: serde::Serialize>(body: &T) -> u64 {
    let mut hasher = DefaultHasher::new();
    match bincode::serialize(body) {
        Ok(bytes) => bytes.hash(&mut hasher),
        // Unserializable bodies never compare equal to a previous send
        Err(_) => return u64::MAX,
    }
    hasher.finish()
}

/// Hands out strictly increasing snapshot timestamps for one connection.
#[derive(Debug, Clone, Copy, Default)]
pub struct SnapshotClock {
    last: Option<u64>,
}

impl SnapshotClock {
    pub fn next(&mut self, now_ms: u64) -> u64 {
        let timestamp = match self.last {
            Some(last) if now_ms <= last => last + 1,
            _ => now_ms,
        };
        self.last = Some(timestamp);
        timestamp
    }

    pub fn last(&self) -> Option<u64> {
        self.last
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn item(id: &str, epoch: u32, position: [f32; 3]) -> StreamItem {
        StreamItem {
            id: id.to_string(),
            epoch,
            fields: SnapshotFields::Position(position),
        }
    }

    #[test]
    fn test_first_appearance_is_hard_cut() {
        let mut encoder = SnapshotEncoder::default();
        let records = encoder.encode(vec![item("a", 0, [0.0; 3])]);
        assert!(records[0].hard_cut);

        let records = encoder.encode(vec![item("a", 0, [1.0, 0.0, 0.0])]);
        assert!(!records[0].hard_cut);
    }

    #[test]
    fn test_epoch_change_is_hard_cut() {
        let mut encoder = SnapshotEncoder::default();
        encoder.encode(vec![item("a", 0, [0.0; 3])]);
        let records = encoder.encode(vec![item("a", 1, [0.5, 0.0, 0.0])]);
        assert!(records[0].hard_cut);
    }

    #[test]
    fn test_long_jump_is_hard_cut() {
        let mut encoder = SnapshotEncoder::new(10.0);
        encoder.encode(vec![item("a", 0, [0.0; 3])]);

        let records = encoder.encode(vec![item("a", 0, [9.0, 0.0, 0.0])]);
        assert!(!records[0].hard_cut);
        let records = encoder.encode(vec![item("a", 0, [30.0, 0.0, 0.0])]);
        assert!(records[0].hard_cut);
    }

    #[test]
    fn test_reappearing_entity_is_hard_cut() {
        let mut encoder = SnapshotEncoder::default();
        encoder.encode(vec![item("a", 0, [0.0; 3]), item("b", 0, [0.0; 3])]);
        encoder.encode(vec![item("b", 0, [0.0; 3])]);
        assert_eq!(encoder.tracked(), 1);

        let records = encoder.encode(vec![item("a", 0, [0.0; 3]), item("b", 0, [0.0; 3])]);
        assert!(records[0].hard_cut);
        assert!(!records[1].hard_cut);
    }

    #[test]
    fn test_records_sorted_by_id() {
        let mut encoder = SnapshotEncoder::default();
        let records = encoder.encode(vec![
            item("c", 0, [0.0; 3]),
            item("a", 0, [0.0; 3]),
            item("b", 0, [0.0; 3]),
        ]);
        let ids: Vec<&str> = records.iter().map(|r| r.id.as_str()).collect();
        assert_eq!(ids, vec!["a", "b", "c"]);
    }

    #[test]
    fn test_channels_never_cut_on_distance() {
        let mut encoder = SnapshotEncoder::new(1.0);
        let channels = |v: f32| StreamItem {
            id: "gauge".to_string(),
            epoch: 0,
            fields: SnapshotFields::Channels([v, v]),
        };
        encoder.encode(vec![channels(0.0)]);
        let records = encoder.encode(vec![channels(500.0)]);
        assert!(!records[0].hard_cut);
    }

    #[test]
    fn test_fingerprint_tracks_content() {
        let mut encoder = SnapshotEncoder::default();
        let first = encoder.encode(vec![item("a", 0, [0.0; 3])]);
        let second = encoder.encode(vec![item("a", 0, [0.0; 3])]);
        let third = encoder.encode(vec![item("a", 0, [2.0, 0.0, 0.0])]);

        // The hard-cut flag differs between first and second
        assert_ne!(fingerprint(&first), fingerprint(&second));
        assert_eq!(fingerprint(&second), fingerprint(&second.clone()));
        assert_ne!(fingerprint(&second), fingerprint(&third));
    }

    #[test]
    fn test_clock_strictly_increases() {
        let mut clock = SnapshotClock::default();
        assert_eq!(clock.next(1_000), 1_000);
        assert_eq!(clock.next(1_000), 1_001);
        // Wall clock stepping backwards
        assert_eq!(clock.next(900), 1_002);
        assert_eq!(clock.next(2_000), 2_000);
        assert_eq!(clock.last(), Some(2_000));
    }
}
