use crate::packet::Payload;
use serde::{Deserialize, Serialize};

/// Interpolatable scalars for one entity.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum SnapshotFields {
    Transform {
        position: [f32; 3],
        rotation: [f32; 4],
    },
    Position([f32; 3]),
    /// Two free numeric channels, e.g. charge and heat of a weapon.
    Channels([f32; 2]),
}

impl SnapshotFields {
    /// Blends `self` towards `target` by `alpha` in `[0, 1]`.
    ///
    /// Rotations use a normalized lerp along the shorter arc. If the two
    /// values are different variants there is nothing to blend and the
    /// target is returned as-is.
    pub fn lerp(&self, target: &SnapshotFields, alpha: f32) -> SnapshotFields {
        let alpha = alpha.clamp(0.0, 1.0);
        match (self, target) {
            (
                SnapshotFields::Transform {
                    position: p1,
                    rotation: r1,
                },
                SnapshotFields::Transform {
                    position: p2,
                    rotation: r2,
                },
            ) => SnapshotFields::Transform {
                position: lerp_array(p1, p2, alpha),
                rotation: nlerp(r1, r2, alpha),
            },
            (SnapshotFields::Position(p1), SnapshotFields::Position(p2)) => {
                SnapshotFields::Position(lerp_array(p1, p2, alpha))
            }
            (SnapshotFields::Channels(c1), SnapshotFields::Channels(c2)) => {
                SnapshotFields::Channels(lerp_array(c1, c2, alpha))
            }
            _ => *target,
        }
    }

    pub fn position(&self) -> Option<[f32; 3]> {
        match self {
            SnapshotFields::Transform { position, .. } | SnapshotFields::Position(position) => {
                Some(*position)
            }
            SnapshotFields::Channels(_) => None,
        }
    }
}

fn lerp_array<const N: usize>(from: &[f32; N], to: &[f32; N], alpha: f32) -> [f32; N] {
    std::array::from_fn(|i| from[i] + (to[i] - from[i]) * alpha)
}

fn nlerp(from: &[f32; 4], to: &[f32; 4], alpha: f32) -> [f32; 4] {
    let dot: f32 = from.iter().zip(to.iter()).map(|(a, b)| a * b).sum();
    // q and -q are the same rotation; flip to take the short way round
    let to = if dot < 0.0 {
        [-to[0], -to[1], -to[2], -to[3]]
    } else {
        *to
    };

    let blended = lerp_array(from, &to, alpha);
    let magnitude = blended.iter().map(|c| c * c).sum::<f32>().sqrt();
    if magnitude < f32::EPSILON {
        return to;
    }
    [
        blended[0] / magnitude,
        blended[1] / magnitude,
        blended[2] / magnitude,
        blended[3] / magnitude,
    ]
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SnapshotRecord {
    /// Entity identifier.
    pub id: String,
    pub fields: SnapshotFields,
    /// Jump straight to `fields` instead of interpolating into them.
    pub hard_cut: bool,
}

/// Records produced by one data-stream subscription.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamBatch {
    pub path: String,
    pub input: Payload,
    pub records: Vec<SnapshotRecord>,
}

/// Everything one connection receives on a broadcast period.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    /// Strictly increasing per connection, in unix milliseconds.
    pub timestamp: u64,
    pub streams: Vec<StreamBatch>,
}

impl Snapshot {
    pub fn record_count(&self) -> usize {
        self.streams.iter().map(|s| s.records.len()).sum()
    }

    pub fn records(&self) -> impl Iterator<Item = &SnapshotRecord> {
        self.streams.iter().flat_map(|s| s.records.iter())
    }

    /// Marks every record as a hard cut that was one in `superseded`, for
    /// the same stream and entity. Used when `superseded` is dropped without
    /// being delivered. Returns how many records were marked.
    pub fn carry_hard_cuts(&mut self, superseded: &Snapshot) -> usize {
        let mut carried = 0;
        for batch in &mut self.streams {
            let previous = match superseded
                .streams
                .iter()
                .find(|b| b.path == batch.path && b.input == batch.input)
            {
                Some(previous) => previous,
                None => continue,
            };
            for record in batch.records.iter_mut().filter(|r| !r.hard_cut) {
                if previous
                    .records
                    .iter()
                    .any(|r| r.hard_cut && r.id == record.id)
                {
                    record.hard_cut = true;
                    carried += 1;
                }
            }
        }
        carried
    }
}
