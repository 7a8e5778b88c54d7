//! Client-side smoothing of data-stream snapshots.
//!
//! Snapshots arrive on the server's broadcast period. Rendering them directly
//! makes motion step at that rate, so the buffer renders slightly in the past
//! and blends between the two snapshots that bracket the render time.

use shared::{Payload, Snapshot, SnapshotFields};
use std::collections::{HashMap, VecDeque};

pub const DEFAULT_INTERPOLATION_DELAY_MS: u64 = 100;
pub const DEFAULT_RETENTION_MS: u64 = 500;
/// How long an entity is still shown after the server stopped sending it.
pub const DEFAULT_EXPIRY_GRACE_MS: u64 = 250;
pub const DEFAULT_CAPACITY: usize = 64;

/// Identity of a streamed entity: which subscription it came from and its id.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct EntityKey {
    pub path: String,
    pub input: Payload,
    pub id: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SampledEntity {
    pub path: String,
    pub id: String,
    pub fields: SnapshotFields,
}

#[derive(Debug, Clone, Copy)]
struct BufferedRecord {
    fields: SnapshotFields,
    hard_cut: bool,
}

#[derive(Debug)]
struct BufferedSnapshot {
    timestamp: u64,
    records: HashMap<EntityKey, BufferedRecord>,
}

impl BufferedSnapshot {
    fn from_snapshot(snapshot: Snapshot) -> Self {
        let mut records = HashMap::new();
        for batch in snapshot.streams {
            for record in batch.records {
                let key = EntityKey {
                    path: batch.path.clone(),
                    input: batch.input.clone(),
                    id: record.id,
                };
                records.insert(
                    key,
                    BufferedRecord {
                        fields: record.fields,
                        hard_cut: record.hard_cut,
                    },
                );
            }
        }
        Self {
            timestamp: snapshot.timestamp,
            records,
        }
    }
}

#[derive(Debug)]
pub struct SnapshotBuffer {
    snapshots: VecDeque<BufferedSnapshot>,
    last_seen: HashMap<EntityKey, u64>,
    delay_ms: u64,
    retention_ms: u64,
    grace_ms: u64,
    capacity: usize,
}

impl Default for SnapshotBuffer {
    fn default() -> Self {
        Self::new(DEFAULT_INTERPOLATION_DELAY_MS)
    }
}

impl SnapshotBuffer {
    pub fn new(delay_ms: u64) -> Self {
        Self {
            snapshots: VecDeque::new(),
            last_seen: HashMap::new(),
            delay_ms,
            retention_ms: DEFAULT_RETENTION_MS.max(delay_ms * 2),
            grace_ms: DEFAULT_EXPIRY_GRACE_MS,
            capacity: DEFAULT_CAPACITY,
        }
    }

    pub fn with_grace(mut self, grace_ms: u64) -> Self {
        self.grace_ms = grace_ms;
        self
    }

    pub fn with_capacity(mut self, capacity: usize) -> Self {
        self.capacity = capacity.max(2);
        self
    }

    pub fn delay_ms(&self) -> u64 {
        self.delay_ms
    }

    pub fn len(&self) -> usize {
        self.snapshots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.snapshots.is_empty()
    }

    pub fn latest_timestamp(&self) -> Option<u64> {
        self.snapshots.back().map(|s| s.timestamp)
    }

    /// Buffers a snapshot. Returns `false` if its timestamp is not newer than
    /// the latest one already buffered.
    pub fn push(&mut self, snapshot: Snapshot) -> bool {
        if let Some(latest) = self.latest_timestamp() {
            if snapshot.timestamp <= latest {
                return false;
            }
        }

        let buffered = BufferedSnapshot::from_snapshot(snapshot);
        let now = buffered.timestamp;
        for key in buffered.records.keys() {
            self.last_seen.insert(key.clone(), now);
        }
        self.snapshots.push_back(buffered);

        // Keep two snapshots around no matter how old, so there is always
        // something to interpolate between
        let cutoff = now.saturating_sub(self.retention_ms);
        while self.snapshots.len() > 2
            && self.snapshots.front().map_or(false, |s| s.timestamp < cutoff)
        {
            self.snapshots.pop_front();
        }
        while self.snapshots.len() > self.capacity {
            self.snapshots.pop_front();
        }

        let grace = self.grace_ms;
        self.last_seen.retain(|_, seen| now - *seen <= grace);
        true
    }

    /// Samples at `latest - delay`.
    pub fn sample(&self) -> Vec<SampledEntity> {
        match self.latest_timestamp() {
            Some(latest) => self.sample_at(latest.saturating_sub(self.delay_ms)),
            None => Vec::new(),
        }
    }

    /// Interpolated view of every live entity at `render_time`, sorted by
    /// path then id.
    pub fn sample_at(&self, render_time: u64) -> Vec<SampledEntity> {
        let mut before = None;
        let mut after = None;
        for snapshot in &self.snapshots {
            if snapshot.timestamp <= render_time {
                before = Some(snapshot);
            } else {
                after = Some(snapshot);
                break;
            }
        }

        let mut sampled: HashMap<&EntityKey, SnapshotFields> = HashMap::new();
        match (before, after) {
            (Some(from), Some(to)) => {
                let alpha = if to.timestamp > from.timestamp {
                    (render_time - from.timestamp) as f32 / (to.timestamp - from.timestamp) as f32
                } else {
                    0.0
                };

                for (key, target) in &to.records {
                    let fields = match from.records.get(key) {
                        // Render time is before `to`, so the jump has not happened yet
                        Some(start) if target.hard_cut => start.fields,
                        Some(start) => start.fields.lerp(&target.fields, alpha),
                        None => target.fields,
                    };
                    sampled.insert(key, fields);
                }
                // Dropped by the newer snapshot; shown until the grace runs out
                for (key, record) in &from.records {
                    sampled.entry(key).or_insert(record.fields);
                }
            }
            (Some(only), None) | (None, Some(only)) => {
                for (key, record) in &only.records {
                    sampled.insert(key, record.fields);
                }
            }
            (None, None) => {}
        }

        let mut entities: Vec<SampledEntity> = sampled
            .into_iter()
            .filter(|(key, _)| self.last_seen.contains_key(*key))
            .map(|(key, fields)| SampledEntity {
                path: key.path.clone(),
                id: key.id.clone(),
                fields,
            })
            .collect();
        entities.sort_by(|a, b| a.path.cmp(&b.path).then_with(|| a.id.cmp(&b.id)));
        entities
    }

    pub fn clear(&mut self) {
        self.snapshots.clear();
        self.last_seen.clear();
    }
}
