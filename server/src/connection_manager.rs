//! Connection registry for the sync server
//!
//! This module tracks every identified socket, including:
//! - Connection admission against the configured capacity
//! - Connection id assignment and lookup by client id
//! - Removal on close, handing the closed connection back for cleanup
//!
//! Connections are kept in id order so fan-out and broadcast visit them
//! deterministically.

use crate::connection::{Connection, ConnectionId, Outbound};
use crate::encoder::DEFAULT_HARD_CUT_DISTANCE;
use log::info;
use std::collections::BTreeMap;
use std::net::SocketAddr;

/// Owns all live connections
///
/// The ConnectionManager enforces the server's capacity limit and hands out
/// connection ids. It is only ever touched from the server loop, so it needs
/// no locking of its own.
pub struct ConnectionManager {
    /// Live connections indexed by their id
    connections: BTreeMap<ConnectionId, Connection>,
    /// Next id handed to an admitted connection
    next_connection_id: ConnectionId,
    /// Maximum number of concurrent connections allowed
    max_connections: usize,
    /// Teleport threshold given to every new connection's encoders
    hard_cut_distance: f32,
}

impl ConnectionManager {
    /// Creates an empty manager with the given capacity limit
    ///
    /// Connection ids start from 1 and increase for each admitted socket.
    pub fn new(max_connections: usize) -> Self {
        Self {
            connections: BTreeMap::new(),
            next_connection_id: 1,
            max_connections,
            hard_cut_distance: DEFAULT_HARD_CUT_DISTANCE,
        }
    }

    pub fn with_hard_cut_distance(mut self, distance: f32) -> Self {
        self.hard_cut_distance = distance;
        self
    }

    /// Whether another connection would be admitted
    pub fn has_capacity(&self) -> bool {
        self.connections.len() < self.max_connections
    }

    /// Admits an identified socket
    ///
    /// Returns Some(connection_id) if admitted, None if the server is at
    /// capacity. The connection starts in the `Identified` state.
    pub fn add_connection(
        &mut self,
        client_id: &str,
        addr: SocketAddr,
        outbound: Outbound,
    ) -> Option<ConnectionId> {
        if !self.has_capacity() {
            return None;
        }

        let id = self.next_connection_id;
        self.next_connection_id = self.next_connection_id.wrapping_add(1).max(1);

        let connection = Connection::new(id, client_id, addr, outbound)
            .with_hard_cut_distance(self.hard_cut_distance);
        info!("Connection {} identified as {} from {}", id, client_id, addr);
        self.connections.insert(id, connection);

        Some(id)
    }

    /// Removes and closes a connection
    ///
    /// Returns the closed connection so the caller can detach its session,
    /// or None if it was already gone.
    pub fn remove_connection(&mut self, id: ConnectionId) -> Option<Connection> {
        let mut connection = self.connections.remove(&id)?;
        connection.close();
        info!(
            "Connection {} ({}) closed",
            id,
            connection.client_id()
        );
        Some(connection)
    }

    pub fn get(&self, id: ConnectionId) -> Option<&Connection> {
        self.connections.get(&id)
    }

    pub fn get_mut(&mut self, id: ConnectionId) -> Option<&mut Connection> {
        self.connections.get_mut(&id)
    }

    /// Finds every live connection for a client id
    ///
    /// A client may briefly hold two connections while a reconnect races the
    /// old socket's close.
    pub fn find_by_client_id(&self, client_id: &str) -> Vec<ConnectionId> {
        self.connections
            .values()
            .filter(|c| c.client_id() == client_id)
            .map(Connection::id)
            .collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Connection> {
        self.connections.values()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut Connection> {
        self.connections.values_mut()
    }

    pub fn ids(&self) -> Vec<ConnectionId> {
        self.connections.keys().copied().collect()
    }

    /// Returns the number of live connections
    pub fn len(&self) -> usize {
        self.connections.len()
    }

    /// Returns true if no connections are live
    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }
}
