//! Boundary between the sync layer and the simulation it publishes.
//!
//! The simulation owns its entities and mutates them from a single writer.
//! The sync layer only ever reads through the [`World`] trait.

use serde::Serialize;
use serde_json::Value;
use std::collections::BTreeMap;

pub type EntityId = String;

pub const IDENTITY_ROTATION: [f32; 4] = [0.0, 0.0, 0.0, 1.0];

/// Read-only view of one simulation entity.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Entity {
    pub id: EntityId,
    /// Structural category such as `ship` or `station`. Never streamed.
    pub category: String,
    pub position: [f32; 3],
    pub rotation: [f32; 4],
    /// Two free numeric channels a stream may choose to publish.
    pub channels: [f32; 2],
    /// Teleport generation. The simulation bumps it whenever the entity
    /// moves discontinuously.
    pub epoch: u32,
    /// Free-form facts filters can key on, e.g. `system` or `owner`.
    pub attributes: BTreeMap<String, Value>,
}

impl Entity {
    pub fn new(id: impl Into<EntityId>, category: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            category: category.into(),
            position: [0.0; 3],
            rotation: IDENTITY_ROTATION,
            channels: [0.0; 2],
            epoch: 0,
            attributes: BTreeMap::new(),
        }
    }

    pub fn with_position(mut self, position: [f32; 3]) -> Self {
        self.position = position;
        self
    }

    pub fn with_attribute(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.attributes.insert(key.to_string(), value.into());
        self
    }

    pub fn attribute(&self, key: &str) -> Option<&Value> {
        self.attributes.get(key)
    }

    pub fn attribute_str(&self, key: &str) -> Option<&str> {
        self.attributes.get(key).and_then(Value::as_str)
    }

    pub fn set_attribute(&mut self, key: &str, value: impl Into<Value>) {
        self.attributes.insert(key.to_string(), value.into());
    }

    /// Moves the entity discontinuously so subscribers do not interpolate
    /// across the jump.
    pub fn teleport(&mut self, position: [f32; 3]) {
        self.position = position;
        self.epoch = self.epoch.wrapping_add(1);
    }
}

/// Read access to the simulation's entity set.
pub trait World: Send + Sync {
    fn entities(&self) -> Box<dyn Iterator<Item = &Entity> + '_>;

    fn entity(&self, id: &str) -> Option<&Entity> {
        self.entities().find(|e| e.id == id)
    }

    /// Simulation tick counter, if the simulation keeps one.
    fn tick(&self) -> u64 {
        0
    }
}

/// Plain entity table, handy for tests and tools.
#[derive(Debug, Clone, Default)]
pub struct EntityTable {
    pub tick: u64,
    entities: BTreeMap<EntityId, Entity>,
}

impl EntityTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, entity: Entity) {
        self.entities.insert(entity.id.clone(), entity);
    }

    pub fn remove(&mut self, id: &str) -> Option<Entity> {
        self.entities.remove(id)
    }

    pub fn get_mut(&mut self, id: &str) -> Option<&mut Entity> {
        self.entities.get_mut(id)
    }

    pub fn len(&self) -> usize {
        self.entities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entities.is_empty()
    }
}

impl World for EntityTable {
    fn entities(&self) -> Box<dyn Iterator<Item = &Entity> + '_> {
        Box::new(self.entities.values())
    }

    fn entity(&self, id: &str) -> Option<&Entity> {
        self.entities.get(id)
    }

    fn tick(&self) -> u64 {
        self.tick
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_entity_defaults() {
        let entity = Entity::new("ship-1", "ship");
        assert_eq!(entity.id, "ship-1");
        assert_eq!(entity.rotation, IDENTITY_ROTATION);
        assert_eq!(entity.epoch, 0);
        assert!(entity.attributes.is_empty());
    }

    #[test]
    fn test_teleport_bumps_epoch() {
        let mut entity = Entity::new("ship-1", "ship").with_position([1.0, 2.0, 3.0]);
        entity.teleport([100.0, 0.0, 0.0]);
        assert_eq!(entity.position, [100.0, 0.0, 0.0]);
        assert_eq!(entity.epoch, 1);
    }

    #[test]
    fn test_attribute_lookup() {
        let entity = Entity::new("s", "station").with_attribute("system", "sol");
        assert_eq!(entity.attribute_str("system"), Some("sol"));
        assert_eq!(entity.attribute_str("owner"), None);
    }

    #[test]
    fn test_entity_table_world() {
        let mut table = EntityTable::new();
        table.insert(Entity::new("b", "ship"));
        table.insert(Entity::new("a", "ship"));

        let ids: Vec<&str> = table.entities().map(|e| e.id.as_str()).collect();
        assert_eq!(ids, vec!["a", "b"]);
        assert!(table.entity("a").is_some());
        assert!(table.entity("zzz").is_none());

        table.remove("a");
        assert_eq!(table.len(), 1);
    }
}
