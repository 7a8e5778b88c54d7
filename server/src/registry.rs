//! The procedure tree.
//!
//! Procedures are registered under dot-separated paths with a
//! [`RegistryBuilder`], optionally nested under a namespace prefix, and
//! frozen into an immutable [`Registry`]. The registry is shared read-only by
//! every connection for the lifetime of the server.

use crate::error::{ProcedureError, RegistryError};
use crate::procedure::{Context, Endpoint, Procedure, Stream};
use serde_json::Value;
use shared::ProcedureKind;
use std::collections::HashMap;

#[derive(Default)]
pub struct RegistryBuilder {
    entries: Vec<(String, Procedure)>,
}

impl RegistryBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a request procedure: the caller waits for its result.
    pub fn request(self, path: &str, endpoint: Endpoint) -> Self {
        self.add(path, Procedure::Request(endpoint))
    }

    /// Registers a send procedure: a command that mutates state.
    pub fn send(self, path: &str, endpoint: Endpoint) -> Self {
        self.add(path, Procedure::Send(endpoint))
    }

    /// Registers a data stream, evaluated per entity on every broadcast.
    pub fn stream(self, path: &str, stream: Stream) -> Self {
        self.add(path, Procedure::DataStream(stream))
    }

    /// Mounts another builder's procedures under `prefix`.
    pub fn nest(mut self, prefix: &str, other: RegistryBuilder) -> Self {
        for (path, procedure) in other.entries {
            self.entries.push((format!("{}.{}", prefix, path), procedure));
        }
        self
    }

    fn add(mut self, path: &str, procedure: Procedure) -> Self {
        self.entries.push((path.to_string(), procedure));
        self
    }

    /// Freezes the tree, rejecting malformed and duplicate paths.
    pub fn build(self) -> Result<Registry, RegistryError> {
        let mut procedures = HashMap::with_capacity(self.entries.len());
        let mut topics: HashMap<String, Vec<String>> = HashMap::new();

        for (path, procedure) in self.entries {
            if !is_valid_path(&path) {
                return Err(RegistryError::InvalidPath(path));
            }
            if procedures.contains_key(&path) {
                return Err(RegistryError::DuplicatePath(path));
            }

            if let Some(endpoint) = procedure.endpoint() {
                let topic = endpoint.topic.clone().unwrap_or_else(|| path.clone());
                topics.entry(topic).or_default().push(path.clone());
            }
            procedures.insert(path, procedure);
        }

        for paths in topics.values_mut() {
            paths.sort();
        }

        Ok(Registry { procedures, topics })
    }
}

fn is_valid_path(path: &str) -> bool {
    !path.is_empty()
        && path.split('.').all(|segment| {
            !segment.is_empty()
                && segment
                    .chars()
                    .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
        })
}

pub struct Registry {
    procedures: HashMap<String, Procedure>,
    /// Publish event name to the request/send paths it re-runs.
    topics: HashMap<String, Vec<String>>,
}

impl Registry {
    pub fn resolve(&self, path: &str) -> Result<&Procedure, ProcedureError> {
        self.procedures
            .get(path)
            .ok_or_else(|| ProcedureError::NotFound(path.to_string()))
    }

    /// Looks up `path` and checks that it was registered as `kind`.
    pub fn resolve_kind(&self, path: &str, kind: ProcedureKind) -> Result<&Procedure, ProcedureError> {
        match self.procedures.get(path) {
            Some(procedure) if procedure.kind() == kind => Ok(procedure),
            Some(procedure) => Err(ProcedureError::NotFound(format!(
                "{} (registered as {}, called as {})",
                path,
                procedure.kind(),
                kind
            ))),
            None => Err(ProcedureError::NotFound(path.to_string())),
        }
    }

    /// Validates and runs a request or send procedure.
    pub fn call(
        &self,
        path: &str,
        kind: ProcedureKind,
        ctx: &mut Context<'_>,
        input: &Value,
    ) -> Result<Value, ProcedureError> {
        if kind == ProcedureKind::DataStream {
            return Err(ProcedureError::NotFound(format!(
                "{} (data streams cannot be called)",
                path
            )));
        }
        let procedure = self.resolve_kind(path, kind)?;
        procedure.validate(input)?;
        match procedure.endpoint() {
            Some(endpoint) => endpoint.resolve(ctx, input),
            None => Err(ProcedureError::NotFound(path.to_string())),
        }
    }

    /// Validated lookup for a publish subscription on a request or send
    /// procedure.
    pub fn subscribable(&self, path: &str, input: &Value) -> Result<&Procedure, ProcedureError> {
        let procedure = self.resolve(path)?;
        if procedure.endpoint().is_none() {
            return Err(ProcedureError::NotFound(format!(
                "{} (use a stream subscription for data streams)",
                path
            )));
        }
        procedure.validate(input)?;
        Ok(procedure)
    }

    /// Validated lookup for a data-stream subscription.
    pub fn stream(&self, path: &str, input: &Value) -> Result<&Stream, ProcedureError> {
        let procedure = self.resolve_kind(path, ProcedureKind::DataStream)?;
        procedure.validate(input)?;
        procedure
            .stream()
            .ok_or_else(|| ProcedureError::NotFound(path.to_string()))
    }

    pub fn paths_for_topic(&self, event: &str) -> &[String] {
        self.topics.get(event).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn paths(&self) -> impl Iterator<Item = (&str, ProcedureKind)> {
        self.procedures
            .iter()
            .map(|(path, procedure)| (path.as_str(), procedure.kind()))
    }

    pub fn len(&self) -> usize {
        self.procedures.len()
    }

    pub fn is_empty(&self) -> bool {
        self.procedures.is_empty()
    }
}
