//! Handling of client packets on an active connection.
//!
//! [`Dispatcher::dispatch`] is synchronous: it runs resolvers, edits the connection's
//! subscription set, and returns the reply to queue. The network layer
//! supplies the world read guard and drains any publishes the call made.

use crate::broker::Broker;
use crate::connection::Connection;
use crate::error::ProcedureError;
use crate::procedure::Context;
use crate::registry::Registry;
use crate::session::SessionStore;
use crate::world::World;
use log::{debug, warn};
use serde_json::Value;
use shared::{Packet, Payload, RequestId};

/// Shared state a packet is dispatched against.
pub struct Dispatcher<'a> {
    pub registry: &'a Registry,
    pub sessions: &'a mut SessionStore,
    pub broker: &'a Broker,
    pub world: &'a dyn World,
}

fn decode_input(input: &Payload) -> Result<Value, ProcedureError> {
    input
        .to_value()
        .map_err(|e| ProcedureError::InvalidInput(format!("input is not valid JSON: {}", e)))
}

fn reply(id: RequestId, path: String, result: Result<Value, ProcedureError>) -> Packet {
    Packet::Reply {
        id,
        path,
        result: result
            .map(|value| Payload::from_value(&value))
            .map_err(|err| err.to_wire()),
    }
}

impl Dispatcher<'_> {
    /// Handles one packet from `connection` and returns the reply, if the
    /// packet warrants one.
    pub fn dispatch(&mut self, connection: &mut Connection, packet: Packet) -> Option<Packet> {
        if !connection.is_active() {
            return None;
        }
        connection.touch();

        match packet {
            Packet::Call {
                id,
                path,
                kind,
                input,
            } => {
                let result = decode_input(&input).and_then(|input| {
                    let session = self
                        .sessions
                        .get_mut(connection.client_id())
                        .ok_or_else(|| ProcedureError::Unauthorized("session expired".to_string()))?;
                    let mut ctx = Context {
                        session,
                        world: self.world,
                        broker: self.broker,
                    };
                    self.registry.call(&path, kind, &mut ctx, &input)
                });
                if let Err(err) = &result {
                    debug!("{} {} from {} failed: {}", kind, path, connection.client_id(), err);
                }
                Some(reply(id, path, result))
            }

            Packet::Subscribe { id, path, input } => {
                let result = decode_input(&input).and_then(|input| {
                    let kind = self.registry.subscribable(&path, &input)?.kind();
                    if connection.subscribe(&path, kind, input) {
                        debug!("{} subscribed to {}", connection.client_id(), path);
                    }
                    Ok(Value::Null)
                });
                Some(reply(id, path, result))
            }

            Packet::Unsubscribe { id, path, input } => {
                let result = decode_input(&input)
                    .map(|input| Value::Bool(connection.unsubscribe(&path, &input)));
                Some(reply(id, path, result))
            }

            Packet::StreamSubscribe { id, path, input } => {
                let result = decode_input(&input).and_then(|input| {
                    self.registry.stream(&path, &input)?;
                    if connection.stream_subscribe(&path, input) {
                        debug!("{} streaming {}", connection.client_id(), path);
                    }
                    Ok(Value::Null)
                });
                Some(reply(id, path, result))
            }

            Packet::StreamUnsubscribe { id, path, input } => {
                let result = decode_input(&input)
                    .map(|input| Value::Bool(connection.stream_unsubscribe(&path, &input)));
                Some(reply(id, path, result))
            }

            other => {
                warn!(
                    "Ignoring unexpected {} packet from {}",
                    other.name(),
                    connection.client_id()
                );
                None
            }
        }
    }
}
