//! Demo procedure tree served by the `server` binary.
//!
//! | path                   | kind       | notes                               |
//! |------------------------|------------|-------------------------------------|
//! | `ping`                 | request    | server time                         |
//! | `session.whoami`       | request    | re-runs on `session.changed`        |
//! | `session.setViewpoint` | send       | publishes `session.changed`         |
//! | `fleet.list`           | request    | re-runs on `fleet.jumped`           |
//! | `fleet.get`            | request    | re-runs on `fleet.jumped`           |
//! | `fleet.jump`           | send       | host only                           |
//! | `fleet.positions`      | dataStream | ships in one system                 |
//! | `fleet.inView`         | dataStream | ships in the viewpoint's system     |
//! | `fleet.telemetry`      | dataStream | two gauge channels per ship         |

use crate::error::{ProcedureError, RegistryError};
use crate::game::WorldCommand;
use crate::procedure::{Endpoint, FilterArgs, Stream};
use crate::registry::{Registry, RegistryBuilder};
use crate::schema::Schema;
use crate::world::{Entity, World};
use serde_json::{json, Value};
use shared::{timestamp_millis, SnapshotFields};
use tokio::sync::mpsc;

fn ship_summary(ship: &Entity) -> Value {
    json!({
        "id": ship.id,
        "name": ship.attribute("name").cloned().unwrap_or(Value::Null),
        "system": ship.attribute("system").cloned().unwrap_or(Value::Null),
    })
}

fn session_routes() -> RegistryBuilder {
    RegistryBuilder::new()
        .request(
            "whoami",
            Endpoint::new(|ctx, _| {
                Ok(json!({
                    "clientId": ctx.session.client_id(),
                    "host": ctx.session.is_host(),
                    "scope": ctx.session.scope,
                }))
            })
            .topic("session.changed")
            .filter(|payload, args| Ok(payload["clientId"] == args.session.client_id())),
        )
        .send(
            "setViewpoint",
            Endpoint::new(|ctx, input| {
                let viewpoint = input["viewpoint"].as_str().map(str::to_string);
                if let Some(id) = &viewpoint {
                    if ctx.world.entity(id).is_none() {
                        return Err(ProcedureError::resolver(format!("unknown viewpoint `{}`", id)));
                    }
                }
                ctx.session.scope.viewpoint = viewpoint;
                ctx.session.scope.simulation = input["simulation"].as_str().map(str::to_string);
                ctx.broker.publish(
                    "session.changed",
                    json!({"clientId": ctx.session.client_id()}),
                );
                Ok(json!(ctx.session.scope))
            })
            .input(
                Schema::object()
                    .optional_field("viewpoint", Schema::String)
                    .optional_field("simulation", Schema::String),
            ),
        )
}

fn in_system(entity: &Entity, system: &Value) -> bool {
    entity.category == "ship" && entity.attribute("system") == Some(system)
}

/// The system the session's viewpoint ship is currently in.
fn viewpoint_system<'w>(args: &FilterArgs<'w>) -> Option<&'w Value> {
    let viewpoint = args.session.scope.viewpoint.as_deref()?;
    args.world.entity(viewpoint)?.attribute("system")
}

fn fleet_routes(commands: mpsc::UnboundedSender<WorldCommand>) -> RegistryBuilder {
    RegistryBuilder::new()
        .request(
            "list",
            Endpoint::new(|ctx, input| {
                let system = input["system"].as_str();
                let ships: Vec<Value> = ctx
                    .world
                    .entities()
                    .filter(|e| e.category == "ship")
                    .filter(|e| system.map_or(true, |s| e.attribute_str("system") == Some(s)))
                    .map(ship_summary)
                    .collect();
                Ok(Value::Array(ships))
            })
            .input(Schema::optional(
                Schema::object().optional_field("system", Schema::String),
            ))
            .topic("fleet.jumped")
            .filter(|payload, args| match args.input["system"].as_str() {
                Some(system) => Ok(payload["from"] == system || payload["to"] == system),
                None => Ok(true),
            }),
        )
        .request(
            "get",
            Endpoint::new(|ctx, input| {
                let id = input["id"].as_str().unwrap_or_default();
                let ship = ctx
                    .world
                    .entity(id)
                    .ok_or_else(|| ProcedureError::resolver(format!("unknown ship `{}`", id)))?;
                let mut details = ship_summary(ship);
                details["epoch"] = json!(ship.epoch);
                details["position"] = json!(ship.position);
                Ok(details)
            })
            .input(Schema::object().field("id", Schema::String))
            .topic("fleet.jumped")
            .filter(|payload, args| Ok(payload["ship"] == args.input["id"])),
        )
        .send(
            "jump",
            Endpoint::new(move |ctx, input| {
                ctx.session.require_host()?;
                let ship = input["ship"].as_str().unwrap_or_default().to_string();
                let system = input["system"].as_str().unwrap_or_default().to_string();
                if ctx.world.entity(&ship).is_none() {
                    return Err(ProcedureError::resolver(format!("unknown ship `{}`", ship)));
                }
                commands
                    .send(WorldCommand::Jump { ship, system })
                    .map_err(|_| ProcedureError::resolver("simulation is not running"))?;
                Ok(json!({"queued": true}))
            })
            .input(
                Schema::object()
                    .field("ship", Schema::String)
                    .field("system", Schema::String),
            ),
        )
        .stream(
            "positions",
            Stream::new(|entity, args| Ok(in_system(entity, &args.input["system"])))
                .input(Schema::object().field("system", Schema::String)),
        )
        .stream(
            "inView",
            Stream::new(|entity, args| match viewpoint_system(args) {
                Some(system) => Ok(in_system(entity, system)),
                None => Ok(false),
            }),
        )
        .stream(
            "telemetry",
            Stream::new(|entity, args| match args.input["ships"].as_array() {
                Some(ships) => Ok(ships.iter().any(|s| s == entity.id.as_str())),
                None => Ok(entity.category == "ship"),
            })
            .input(Schema::optional(
                Schema::object().optional_field("ships", Schema::array(Schema::String)),
            ))
            .project(|entity, _| Ok(SnapshotFields::Channels(entity.channels))),
        )
}

/// Builds the demo tree. `commands` feeds the simulation's command queue.
pub fn demo_routes(commands: mpsc::UnboundedSender<WorldCommand>) -> Result<Registry, RegistryError> {
    RegistryBuilder::new()
        .request(
            "ping",
            Endpoint::new(|_, _| Ok(json!({"time": timestamp_millis()}))),
        )
        .nest("session", session_routes())
        .nest("fleet", fleet_routes(commands))
        .build()
}
