//! Demo simulation: a fleet of ships orbiting in named star systems.
//!
//! The simulation is the single writer of its [`FleetWorld`]. Clients change
//! it only through [`WorldCommand`]s, which the simulation applies at the
//! start of its next tick. Ships occasionally jump to another system on
//! their own; every jump bumps the ship's epoch and publishes `fleet.jumped`.

use crate::broker::Broker;
use crate::world::{Entity, EntityId, World};
use log::{info, warn};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::f32::consts::TAU;
use std::sync::Arc;
use tokio::sync::{mpsc, RwLock};
use tokio::time::{interval, Duration, Instant, MissedTickBehavior};

pub const DEFAULT_SYSTEMS: [&str; 3] = ["sol", "vega", "sirius"];

/// Distance between neighbouring system centres.
const SYSTEM_SPACING: f32 = 1_000.0;

#[derive(Debug)]
pub enum WorldCommand {
    Jump { ship: EntityId, system: String },
}

#[derive(Debug, Clone)]
struct Orbit {
    radius: f32,
    /// Radians per second.
    speed: f32,
    phase: f32,
}

#[derive(Debug, Clone)]
pub struct FleetWorld {
    tick: u64,
    systems: Vec<String>,
    ships: BTreeMap<EntityId, Entity>,
    orbits: BTreeMap<EntityId, Orbit>,
}

impl FleetWorld {
    /// Creates `ship_count` ships spread round-robin over `systems`.
    pub fn new(ship_count: usize, systems: &[&str]) -> Self {
        let mut world = Self {
            tick: 0,
            systems: systems.iter().map(|s| s.to_string()).collect(),
            ships: BTreeMap::new(),
            orbits: BTreeMap::new(),
        };

        for i in 0..ship_count {
            let id = format!("ship-{}", i + 1);
            let system = match world.systems.get(i % world.systems.len().max(1)) {
                Some(system) => system.clone(),
                None => break,
            };
            let orbit = Orbit {
                radius: 40.0 + (i % 7) as f32 * 15.0,
                speed: 0.2 + (i % 5) as f32 * 0.05,
                phase: i as f32 * 0.7,
            };
            let ship = Entity::new(id.clone(), "ship")
                .with_attribute("name", format!("Vessel {}", i + 1))
                .with_attribute("system", system);
            world.ships.insert(id.clone(), ship);
            world.orbits.insert(id.clone(), orbit);
            world.place(&id);
        }

        world
    }

    pub fn systems(&self) -> &[String] {
        &self.systems
    }

    pub fn has_system(&self, system: &str) -> bool {
        self.systems.iter().any(|s| s == system)
    }

    fn system_centre(&self, system: &str) -> [f32; 3] {
        let index = self.systems.iter().position(|s| s == system).unwrap_or(0);
        [index as f32 * SYSTEM_SPACING, 0.0, 0.0]
    }

    /// Puts a ship where its orbit says it is right now.
    fn place(&mut self, id: &str) {
        let (orbit, system) = match (self.orbits.get(id), self.ships.get(id)) {
            (Some(orbit), Some(ship)) => (
                orbit.clone(),
                ship.attribute_str("system").unwrap_or_default().to_string(),
            ),
            _ => return,
        };
        let centre = self.system_centre(&system);
        let time = self.tick as f32;

        if let Some(ship) = self.ships.get_mut(id) {
            let angle = orbit.phase;
            ship.position = [
                centre[0] + orbit.radius * angle.cos(),
                centre[1],
                centre[2] + orbit.radius * angle.sin(),
            ];
            // Heading along the orbit, as a rotation about +y
            let half = -angle / 2.0;
            ship.rotation = [0.0, half.sin(), 0.0, half.cos()];
            ship.channels = [
                0.5 + 0.5 * (time * 0.05 + orbit.phase).sin(),
                0.5 + 0.5 * (time * 0.03 + orbit.radius).cos(),
            ];
        }
    }

    /// Moves a ship to another system. Returns the system it left.
    pub fn jump(&mut self, ship_id: &str, system: &str) -> Result<String, String> {
        if !self.has_system(system) {
            return Err(format!("unknown system `{}`", system));
        }
        let from = match self.ships.get(ship_id) {
            Some(ship) => ship.attribute_str("system").unwrap_or_default().to_string(),
            None => return Err(format!("unknown ship `{}`", ship_id)),
        };

        let centre = self.system_centre(system);
        if let Some(ship) = self.ships.get_mut(ship_id) {
            ship.set_attribute("system", system);
            ship.teleport(centre);
        }
        self.place(ship_id);
        Ok(from)
    }

    /// Advances orbits by `dt` seconds and rolls for spontaneous jumps.
    /// Returns the events to publish.
    pub fn step<R: Rng>(&mut self, dt: f32, jump_chance: f64, rng: &mut R) -> Vec<(String, Value)> {
        self.tick += 1;

        let ids: Vec<EntityId> = self.ships.keys().cloned().collect();
        for id in &ids {
            if let Some(orbit) = self.orbits.get_mut(id) {
                orbit.phase = (orbit.phase + orbit.speed * dt) % TAU;
            }
            self.place(id);
        }

        let mut events = Vec::new();
        if self.systems.len() < 2 || ids.is_empty() || !rng.gen_bool(jump_chance.clamp(0.0, 1.0)) {
            return events;
        }

        let ship = &ids[rng.gen_range(0..ids.len())];
        let system = self.systems[rng.gen_range(0..self.systems.len())].clone();
        let current = self.ships.get(ship).and_then(|s| s.attribute_str("system"));
        if current == Some(system.as_str()) {
            return events;
        }
        if let Ok(from) = self.jump(ship, &system) {
            events.push(jumped_event(ship, &from, &system));
        }
        events
    }

    /// Applies a client command. Returns the events to publish.
    pub fn apply(&mut self, command: WorldCommand) -> Vec<(String, Value)> {
        match command {
            WorldCommand::Jump { ship, system } => match self.jump(&ship, &system) {
                Ok(from) => vec![jumped_event(&ship, &from, &system)],
                Err(e) => {
                    warn!("Ignoring jump of {}: {}", ship, e);
                    Vec::new()
                }
            },
        }
    }
}

fn jumped_event(ship: &str, from: &str, to: &str) -> (String, Value) {
    (
        "fleet.jumped".to_string(),
        json!({"ship": ship, "from": from, "to": to}),
    )
}

impl World for FleetWorld {
    fn entities(&self) -> Box<dyn Iterator<Item = &Entity> + '_> {
        Box::new(self.ships.values())
    }

    fn entity(&self, id: &str) -> Option<&Entity> {
        self.ships.get(id)
    }

    fn tick(&self) -> u64 {
        self.tick
    }
}

/// Runs the simulation until the command channel closes.
pub async fn run_simulation(
    world: Arc<RwLock<FleetWorld>>,
    broker: Broker,
    mut commands: mpsc::UnboundedReceiver<WorldCommand>,
    tick_rate: u32,
    jump_chance: f64,
) {
    let mut interval_timer = interval(Duration::from_secs_f32(1.0 / tick_rate.max(1) as f32));
    interval_timer.set_missed_tick_behavior(MissedTickBehavior::Skip);

    let mut rng = StdRng::from_entropy();
    let mut last_update = Instant::now();

    // Cap the maximum delta time to 100ms
    let max_delta_time = 0.1;

    info!("Simulation running at {} Hz", tick_rate);

    loop {
        interval_timer.tick().await;

        let current_time = Instant::now();
        let delta_time = (current_time - last_update).as_secs_f32().min(max_delta_time);
        last_update = current_time;

        let mut pending = Vec::new();
        loop {
            match commands.try_recv() {
                Ok(command) => pending.push(command),
                Err(mpsc::error::TryRecvError::Empty) => break,
                Err(mpsc::error::TryRecvError::Disconnected) => {
                    info!("Simulation stopped");
                    return;
                }
            }
        }

        let events = {
            let mut state = world.write().await;
            let mut events = Vec::new();
            for command in pending {
                events.extend(state.apply(command));
            }
            events.extend(state.step(delta_time, jump_chance, &mut rng));
            events
        };

        // Publish after releasing the write lock so fan-out sees the new state
        for (event, payload) in events {
            broker.publish(event, payload);
        }
    }
}
