//! # Sync Client Library
//!
//! Headless client for the realtime synchronization server. It speaks the
//! framed packet protocol from the `shared` crate and exposes the server's
//! procedure tree as plain async calls.
//!
//! ## Components
//!
//! ### Network (`network`)
//! [`network::SyncClient`] identifies with a stable client id, correlates
//! replies with their calls by request id, and surfaces server pushes
//! (re-run subscription results and data-stream snapshots) as
//! [`network::ClientEvent`]s.
//!
//! ### Interpolation (`interpolation`)
//! [`interpolation::SnapshotBuffer`] orders incoming snapshots, renders a
//! fixed delay behind the newest one, blends between the two snapshots that
//! bracket the render time, and honours hard cuts so teleports are not
//! smeared across the screen.
//!
//! ## Usage Example
//!
//! ```rust,no_run
//! use client::interpolation::SnapshotBuffer;
//! use client::network::{ClientEvent, SyncClient};
//! use serde_json::json;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let mut client = SyncClient::connect("127.0.0.1:8080", "viewer-1").await?;
//!     let ships = client.call("fleet.list", json!({ "system": "sol" })).await?;
//!     println!("{}", ships);
//!
//!     client.stream_subscribe("fleet.positions", json!({ "system": "sol" })).await?;
//!     let mut buffer = SnapshotBuffer::default();
//!     while let Some(event) = client.next_event().await {
//!         if let ClientEvent::Snapshot(snapshot) = event {
//!             buffer.push(snapshot);
//!             for entity in buffer.sample() {
//!                 println!("{} {:?}", entity.id, entity.fields);
//!             }
//!         }
//!     }
//!     Ok(())
//! }
//! ```

pub mod error;
pub mod interpolation;
pub mod network;

pub use error::ClientError;
pub use network::{ClientEvent, SyncClient};
