pub mod framing;
pub mod packet;
pub mod snapshot;

pub use packet::{ErrorKind, Packet, Payload, ProcedureKind, RequestId, WireError};
pub use snapshot::{Snapshot, SnapshotFields, SnapshotRecord, StreamBatch};

use std::time::{Duration, SystemTime, UNIX_EPOCH};

pub const PROTOCOL_VERSION: u32 = 1;
pub const DEFAULT_BROADCAST_PERIOD_MS: u64 = 50;
pub const IDENTIFY_TIMEOUT_SECS: u64 = 60;
pub const MAX_PACKET_SIZE: u32 = 4 * 1024 * 1024;
pub const DEFAULT_PORT: u16 = 8080;

/// Milliseconds since the unix epoch, saturating to zero if the clock is
/// before the epoch.
pub fn timestamp_millis() -> u64 {
    let millis = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or(Duration::from_secs(0))
        .as_millis();
    (millis.min(u64::MAX as u128)) as u64
}
