//! # Sync Server Library
//!
//! This library provides the server half of a realtime synchronization and
//! remote-procedure layer. A single authoritative simulation is exposed to
//! many simultaneously connected clients through a tree of named procedures,
//! a publish/subscribe broker, and a fixed-rate data-stream broadcast.
//!
//! ## Core Responsibilities
//!
//! ### Procedure Dispatch
//! Procedures are registered under dot-separated paths in one of three
//! shapes:
//! - **Request**: the client asks and the server answers once
//! - **Send**: the client issues a command and awaits its acknowledgement
//! - **Data-Stream**: the server keeps pushing entity snapshots that match a
//!   per-client filter
//!
//! Inputs are validated against an optional [`schema::Schema`] before a
//! resolver runs. Resolver panics are caught and reported as errors to the
//! caller; they never take the connection down.
//!
//! ### Publish/Subscribe
//! Any holder of a [`broker::Broker`] may publish a named event. Every
//! request/send subscription whose topic matches and whose filter accepts
//! the payload re-runs its resolver with the subscriber's own input, and the
//! fresh result is pushed to that subscriber.
//!
//! ### Sessions
//! A [`session::SessionContext`] is keyed by the client's self-chosen id and
//! survives reconnects. Detached sessions are evicted after an idle window.
//!
//! ### Snapshot Broadcast
//! On a fixed wall-clock period, each connection's data-stream subscriptions
//! are evaluated against the current entity set, encoded with hard-cut
//! flags, batched into one timestamped snapshot, and sent only if something
//! changed. Unsent snapshots are superseded by newer ones.
//!
//! ## Architecture Design
//!
//! ### Single Event Loop
//! All dispatch, fan-out, and broadcast work runs sequentially on one server
//! task. Socket tasks only frame and forward packets. This keeps per-connection
//! ordering trivial: publish results reach a connection in publish order and
//! snapshot timestamps strictly increase.
//!
//! ### Single Writer Simulation
//! The simulation lives behind `Arc<RwLock<W>>` where `W: World`. The
//! simulation task is its only writer; the server loop takes read locks.
//! Clients mutate the simulation through send procedures that enqueue
//! commands for the simulation to apply on its next tick.
//!
//! ## Module Organization
//!
//! - `schema`, `procedure`, `registry`: procedure definitions and the tree
//! - `broker`: publish queue and subscription fan-out
//! - `session`: session contexts and the store that owns them
//! - `connection`, `connection_manager`: per-socket state and admission
//! - `encoder`, `broadcast`: snapshot encoding and the broadcast period
//! - `dispatch`, `network`: packet handling and the TCP server loop
//! - `world`, `game`, `routes`: the simulation boundary and a demo fleet
//!
//! ## Usage Example
//!
//! ```rust,no_run
//! use server::config::ServerConfig;
//! use server::game::{run_simulation, FleetWorld, DEFAULT_SYSTEMS};
//! use server::network::Server;
//! use server::routes::demo_routes;
//! use std::sync::Arc;
//! use tokio::sync::{mpsc, RwLock};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let world = Arc::new(RwLock::new(FleetWorld::new(12, &DEFAULT_SYSTEMS)));
//!     let (commands_tx, commands_rx) = mpsc::unbounded_channel();
//!     let registry = Arc::new(demo_routes(commands_tx)?);
//!
//!     let server = Server::bind(ServerConfig::default(), registry, Arc::clone(&world)).await?;
//!     tokio::spawn(run_simulation(world, server.broker(), commands_rx, 30, 0.01));
//!
//!     // Accepts sockets, dispatches calls, fans out publishes, and
//!     // broadcasts snapshots until shut down
//!     server.run().await?;
//!     Ok(())
//! }
//! ```

pub mod broadcast;
pub mod broker;
pub mod config;
pub mod connection;
pub mod connection_manager;
pub mod dispatch;
pub mod encoder;
pub mod error;
pub mod game;
pub mod network;
pub mod procedure;
pub mod registry;
pub mod routes;
pub mod schema;
pub mod session;
pub mod world;
