use shared::{ErrorKind, WireError};
use thiserror::Error;

/// Failures produced while resolving, validating, or running a procedure.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProcedureError {
    #[error("no procedure at `{0}`")]
    NotFound(String),
    #[error("invalid input: {0}")]
    InvalidInput(String),
    #[error("unauthorized: {0}")]
    Unauthorized(String),
    #[error("resolver failed: {0}")]
    Resolver(String),
    #[error("client did not identify within {0} ms")]
    HandshakeTimeout(u64),
    #[error("filter failed: {0}")]
    Filter(String),
}

impl ProcedureError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            ProcedureError::NotFound(_) => ErrorKind::NotFound,
            ProcedureError::InvalidInput(_) => ErrorKind::InvalidInput,
            ProcedureError::Unauthorized(_) => ErrorKind::Unauthorized,
            ProcedureError::Resolver(_) => ErrorKind::ResolverError,
            ProcedureError::HandshakeTimeout(_) => ErrorKind::HandshakeTimeout,
            ProcedureError::Filter(_) => ErrorKind::FilterError,
        }
    }

    pub fn resolver(message: impl Into<String>) -> Self {
        ProcedureError::Resolver(message.into())
    }

    pub fn to_wire(&self) -> WireError {
        WireError::new(self.kind(), self.to_string())
    }
}

impl From<ProcedureError> for WireError {
    fn from(err: ProcedureError) -> Self {
        err.to_wire()
    }
}

/// Problems found while assembling the procedure tree.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RegistryError {
    #[error("procedure path `{0}` registered twice")]
    DuplicatePath(String),
    #[error("invalid procedure path `{0}`")]
    InvalidPath(String),
}

/// Turns a caught panic payload into a readable message.
pub(crate) fn panic_message(payload: Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "panic with non-string payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kinds_map_to_wire() {
        let cases = vec![
            (ProcedureError::NotFound("x".into()), ErrorKind::NotFound),
            (
                ProcedureError::InvalidInput("x".into()),
                ErrorKind::InvalidInput,
            ),
            (
                ProcedureError::Unauthorized("x".into()),
                ErrorKind::Unauthorized,
            ),
            (ProcedureError::resolver("x"), ErrorKind::ResolverError),
            (ProcedureError::HandshakeTimeout(60_000), ErrorKind::HandshakeTimeout),
            (ProcedureError::Filter("x".into()), ErrorKind::FilterError),
        ];

        for (err, kind) in cases {
            assert_eq!(err.to_wire().kind, kind);
        }
    }

    #[test]
    fn test_wire_message_is_display() {
        let wire: WireError = ProcedureError::NotFound("fleet.nope".into()).into();
        assert_eq!(wire.message, "no procedure at `fleet.nope`");
    }

    #[test]
    fn test_panic_message_variants() {
        assert_eq!(panic_message(Box::new("boom")), "boom");
        assert_eq!(panic_message(Box::new(String::from("bang"))), "bang");
        assert_eq!(panic_message(Box::new(42u8)), "panic with non-string payload");
    }
}
