//! Packet vocabulary exchanged between clients and the sync server.
//!
//! The envelope is a fixed `bincode` enum. Procedure inputs and results are
//! free-form JSON documents, so they travel as opaque [`Payload`] bytes inside
//! the envelope and are only decoded by the side that needs them.

use crate::snapshot::Snapshot;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

/// Correlates a reply with the client operation that caused it.
pub type RequestId = u32;

/// Call shape of a registered procedure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ProcedureKind {
    Request,
    Send,
    DataStream,
}

impl fmt::Display for ProcedureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ProcedureKind::Request => "request",
            ProcedureKind::Send => "send",
            ProcedureKind::DataStream => "dataStream",
        };
        f.write_str(name)
    }
}

/// JSON document carried as raw bytes.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Payload(Vec<u8>);

impl Payload {
    pub fn null() -> Self {
        Payload(b"null".to_vec())
    }

    pub fn from_value(value: &Value) -> Self {
        Payload(value.to_string().into_bytes())
    }

    pub fn from_bytes(bytes: Vec<u8>) -> Self {
        Payload(bytes)
    }

    pub fn to_value(&self) -> Result<Value, serde_json::Error> {
        serde_json::from_slice(&self.0)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl Default for Payload {
    fn default() -> Self {
        Payload::null()
    }
}

impl From<Value> for Payload {
    fn from(value: Value) -> Self {
        Payload::from_value(&value)
    }
}

/// Error categories surfaced to clients.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorKind {
    NotFound,
    InvalidInput,
    Unauthorized,
    ResolverError,
    HandshakeTimeout,
    FilterError,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WireError {
    pub kind: ErrorKind,
    pub message: String,
}

impl WireError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

impl fmt::Display for WireError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)
    }
}

impl std::error::Error for WireError {}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Packet {
    // Client -> server
    Identify {
        client_id: String,
        protocol_version: u32,
    },
    Call {
        id: RequestId,
        path: String,
        kind: ProcedureKind,
        input: Payload,
    },
    Subscribe {
        id: RequestId,
        path: String,
        input: Payload,
    },
    Unsubscribe {
        id: RequestId,
        path: String,
        input: Payload,
    },
    StreamSubscribe {
        id: RequestId,
        path: String,
        input: Payload,
    },
    StreamUnsubscribe {
        id: RequestId,
        path: String,
        input: Payload,
    },
    Goodbye,

    // Server -> client
    Welcome {
        client_id: String,
        resumed: bool,
        host: bool,
        broadcast_period_ms: u64,
    },
    Reply {
        id: RequestId,
        path: String,
        result: Result<Payload, WireError>,
    },
    PublishResult {
        path: String,
        input: Payload,
        result: Payload,
    },
    Snapshot(Snapshot),
    Disconnected {
        reason: String,
    },
}

impl Packet {
    /// Short name used in log lines.
    pub fn name(&self) -> &'static str {
        match self {
            Packet::Identify { .. } => "identify",
            Packet::Call { .. } => "call",
            Packet::Subscribe { .. } => "subscribe",
            Packet::Unsubscribe { .. } => "unsubscribe",
            Packet::StreamSubscribe { .. } => "streamSubscribe",
            Packet::StreamUnsubscribe { .. } => "streamUnsubscribe",
            Packet::Goodbye => "goodbye",
            Packet::Welcome { .. } => "welcome",
            Packet::Reply { .. } => "reply",
            Packet::PublishResult { .. } => "publishResult",
            Packet::Snapshot(_) => "snapshot",
            Packet::Disconnected { .. } => "disconnected",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_payload_value_roundtrip() {
        let value = json!({"system": "sol", "limit": 3});
        let payload = Payload::from_value(&value);
        assert_eq!(payload.to_value().unwrap(), value);
    }

    #[test]
    fn test_payload_default_is_null() {
        assert_eq!(Payload::default().to_value().unwrap(), Value::Null);
    }

    #[test]
    fn test_payload_rejects_garbage() {
        let payload = Payload::from_bytes(b"{not json".to_vec());
        assert!(payload.to_value().is_err());
    }

    #[test]
    fn test_payload_canonical_key_order() {
        let a = Payload::from_value(&json!({"b": 1, "a": 2}));
        let b = Payload::from_value(&json!({"a": 2, "b": 1}));
        assert_eq!(a, b);
    }

    #[test]
    fn test_reply_with_error_survives_bincode() {
        let packet = Packet::Reply {
            id: 7,
            path: "fleet.jump".to_string(),
            result: Err(WireError::new(ErrorKind::Unauthorized, "host only")),
        };

        let bytes = bincode::serialize(&packet).unwrap();
        let decoded: Packet = bincode::deserialize(&bytes).unwrap();

        match decoded {
            Packet::Reply { id, path, result } => {
                assert_eq!(id, 7);
                assert_eq!(path, "fleet.jump");
                let err = result.unwrap_err();
                assert_eq!(err.kind, ErrorKind::Unauthorized);
                assert_eq!(err.message, "host only");
            }
            _ => panic!("Wrong packet type after deserialization"),
        }
    }

    #[test]
    fn test_call_carries_json_input() {
        let packet = Packet::Call {
            id: 1,
            path: "ping".to_string(),
            kind: ProcedureKind::Request,
            input: Payload::from_value(&json!({"echo": "hi"})),
        };

        let bytes = bincode::serialize(&packet).unwrap();
        match bincode::deserialize::<Packet>(&bytes).unwrap() {
            Packet::Call { kind, input, .. } => {
                assert_eq!(kind, ProcedureKind::Request);
                assert_eq!(input.to_value().unwrap(), json!({"echo": "hi"}));
            }
            _ => panic!("Wrong packet type after deserialization"),
        }
    }

    #[test]
    fn test_kind_display() {
        assert_eq!(ProcedureKind::Request.to_string(), "request");
        assert_eq!(ProcedureKind::Send.to_string(), "send");
        assert_eq!(ProcedureKind::DataStream.to_string(), "dataStream");
    }
}
