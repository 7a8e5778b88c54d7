//! Procedure variants and the arguments handed to their closures.
//!
//! Every closure receives its ambient state explicitly: resolvers get a
//! [`Context`], filters and projections get [`FilterArgs`]. Nothing is
//! captured from the connection that happens to be running them, which is
//! what lets the broker re-run a resolver on behalf of any subscriber.

use crate::broker::Broker;
use crate::error::{panic_message, ProcedureError};
use crate::schema::Schema;
use crate::session::SessionContext;
use crate::world::{Entity, World};
use serde_json::Value;
use shared::{ProcedureKind, SnapshotFields};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

/// State available to a resolver.
pub struct Context<'a> {
    pub session: &'a mut SessionContext,
    pub world: &'a dyn World,
    pub broker: &'a Broker,
}

/// Read-only state available to filters and projections.
pub struct FilterArgs<'a> {
    /// The subscriber's most recent input.
    pub input: &'a Value,
    pub session: &'a SessionContext,
    pub world: &'a dyn World,
}

pub type Resolver =
    Arc<dyn Fn(&mut Context<'_>, &Value) -> Result<Value, ProcedureError> + Send + Sync>;
pub type PublishFilter =
    Arc<dyn Fn(&Value, &FilterArgs<'_>) -> Result<bool, ProcedureError> + Send + Sync>;
pub type EntityFilter =
    Arc<dyn Fn(&Entity, &FilterArgs<'_>) -> Result<bool, ProcedureError> + Send + Sync>;
pub type Projection =
    Arc<dyn Fn(&Entity, &FilterArgs<'_>) -> Result<SnapshotFields, ProcedureError> + Send + Sync>;

/// A request or send procedure.
#[derive(Clone)]
pub struct Endpoint {
    pub schema: Option<Schema>,
    pub resolver: Resolver,
    /// Publish event that makes subscribers re-run this endpoint. `None`
    /// means the endpoint's own path.
    pub topic: Option<String>,
    pub filter: Option<PublishFilter>,
}

impl Endpoint {
    pub fn new<F>(resolver: F) -> Self
    where
        F: Fn(&mut Context<'_>, &Value) -> Result<Value, ProcedureError> + Send + Sync + 'static,
    {
        Self {
            schema: None,
            resolver: Arc::new(resolver),
            topic: None,
            filter: None,
        }
    }

    pub fn input(mut self, schema: Schema) -> Self {
        self.schema = Some(schema);
        self
    }

    pub fn topic(mut self, topic: &str) -> Self {
        self.topic = Some(topic.to_string());
        self
    }

    pub fn filter<F>(mut self, filter: F) -> Self
    where
        F: Fn(&Value, &FilterArgs<'_>) -> Result<bool, ProcedureError> + Send + Sync + 'static,
    {
        self.filter = Some(Arc::new(filter));
        self
    }

    /// Runs the resolver. Panics become [`ProcedureError::Resolver`].
    pub fn resolve(&self, ctx: &mut Context<'_>, input: &Value) -> Result<Value, ProcedureError> {
        match catch_unwind(AssertUnwindSafe(|| (self.resolver)(ctx, input))) {
            Ok(result) => result,
            Err(payload) => Err(ProcedureError::Resolver(panic_message(payload))),
        }
    }

    /// Whether a published payload is relevant to a subscriber. Errors and
    /// panics are reported as [`ProcedureError::Filter`].
    pub fn accepts(&self, payload: &Value, args: &FilterArgs<'_>) -> Result<bool, ProcedureError> {
        let filter = match &self.filter {
            Some(filter) => filter,
            None => return Ok(true),
        };
        match catch_unwind(AssertUnwindSafe(|| filter(payload, args))) {
            Ok(Ok(accepted)) => Ok(accepted),
            Ok(Err(err)) => Err(ProcedureError::Filter(err.to_string())),
            Err(payload) => Err(ProcedureError::Filter(panic_message(payload))),
        }
    }
}

/// A data-stream procedure, evaluated per entity on every broadcast period.
#[derive(Clone)]
pub struct Stream {
    pub schema: Option<Schema>,
    pub filter: EntityFilter,
    pub projection: Projection,
}

impl Stream {
    pub fn new<F>(filter: F) -> Self
    where
        F: Fn(&Entity, &FilterArgs<'_>) -> Result<bool, ProcedureError> + Send + Sync + 'static,
    {
        Self {
            schema: None,
            filter: Arc::new(filter),
            projection: Arc::new(transform_of),
        }
    }

    pub fn input(mut self, schema: Schema) -> Self {
        self.schema = Some(schema);
        self
    }

    pub fn project<F>(mut self, projection: F) -> Self
    where
        F: Fn(&Entity, &FilterArgs<'_>) -> Result<SnapshotFields, ProcedureError>
            + Send
            + Sync
            + 'static,
    {
        self.projection = Arc::new(projection);
        self
    }

    /// Filters and projects one entity. `Ok(None)` means the entity is not
    /// part of this stream.
    pub fn evaluate(
        &self,
        entity: &Entity,
        args: &FilterArgs<'_>,
    ) -> Result<Option<SnapshotFields>, ProcedureError> {
        let outcome = catch_unwind(AssertUnwindSafe(|| {
            if (self.filter)(entity, args)? {
                (self.projection)(entity, args).map(Some)
            } else {
                Ok(None)
            }
        }));
        match outcome {
            Ok(Ok(fields)) => Ok(fields),
            Ok(Err(err)) => Err(ProcedureError::Filter(err.to_string())),
            Err(payload) => Err(ProcedureError::Filter(panic_message(payload))),
        }
    }
}

fn transform_of(entity: &Entity, _: &FilterArgs<'_>) -> Result<SnapshotFields, ProcedureError> {
    Ok(SnapshotFields::Transform {
        position: entity.position,
        rotation: entity.rotation,
    })
}

#[derive(Clone)]
pub enum Procedure {
    Request(Endpoint),
    Send(Endpoint),
    DataStream(Stream),
}

impl Procedure {
    pub fn kind(&self) -> ProcedureKind {
        match self {
            Procedure::Request(_) => ProcedureKind::Request,
            Procedure::Send(_) => ProcedureKind::Send,
            Procedure::DataStream(_) => ProcedureKind::DataStream,
        }
    }

    pub fn schema(&self) -> Option<&Schema> {
        match self {
            Procedure::Request(e) | Procedure::Send(e) => e.schema.as_ref(),
            Procedure::DataStream(s) => s.schema.as_ref(),
        }
    }

    pub fn validate(&self, input: &Value) -> Result<(), ProcedureError> {
        match self.schema() {
            Some(schema) => schema.validate(input).map_err(ProcedureError::InvalidInput),
            None => Ok(()),
        }
    }

    pub fn endpoint(&self) -> Option<&Endpoint> {
        match self {
            Procedure::Request(e) | Procedure::Send(e) => Some(e),
            Procedure::DataStream(_) => None,
        }
    }

    pub fn stream(&self) -> Option<&Stream> {
        match self {
            Procedure::DataStream(s) => Some(s),
            _ => None,
        }
    }
}
