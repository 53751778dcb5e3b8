//! Event-type registry
//!
//! Maps event types to the schema used to encode their payloads. The registry
//! is built once at startup and shared immutably (behind an `Arc`) with every
//! stream writer and reader that needs it; there is no process-wide mutable
//! registry.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

/// Numeric event type tag carried by every typed log record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct EventType(pub u16);

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "event-type-{}", self.0)
    }
}

/// Schema information for one event type.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchemaDescriptor {
    /// Human-readable schema name (e.g. "deployment")
    pub name: String,
    /// Schema version; readers reject records written with a newer version
    pub version: u16,
}

impl SchemaDescriptor {
    /// Create a descriptor.
    pub fn new(name: impl Into<String>, version: u16) -> Self {
        SchemaDescriptor {
            name: name.into(),
            version,
        }
    }
}

/// Immutable event-type registry.
#[derive(Debug, Clone, Default)]
pub struct EventRegistry {
    schemas: BTreeMap<EventType, SchemaDescriptor>,
}

impl EventRegistry {
    /// Start building a registry.
    pub fn builder() -> EventRegistryBuilder {
        EventRegistryBuilder::default()
    }

    /// Look up the schema for an event type.
    pub fn get(&self, event_type: EventType) -> Option<&SchemaDescriptor> {
        self.schemas.get(&event_type)
    }

    /// Look up the schema for an event type, failing if it is unknown.
    pub fn require(&self, event_type: EventType) -> Result<&SchemaDescriptor, RegistryError> {
        self.get(event_type)
            .ok_or(RegistryError::UnknownEventType(event_type))
    }

    /// True if the event type is registered.
    pub fn contains(&self, event_type: EventType) -> bool {
        self.schemas.contains_key(&event_type)
    }

    /// Number of registered event types.
    pub fn len(&self) -> usize {
        self.schemas.len()
    }

    /// True if nothing is registered.
    pub fn is_empty(&self) -> bool {
        self.schemas.is_empty()
    }

    /// Iterate over registered types in ascending order.
    pub fn iter(&self) -> impl Iterator<Item = (EventType, &SchemaDescriptor)> {
        self.schemas.iter().map(|(t, s)| (*t, s))
    }
}

/// Builder for [`EventRegistry`].
#[derive(Debug, Default)]
pub struct EventRegistryBuilder {
    schemas: BTreeMap<EventType, SchemaDescriptor>,
}

impl EventRegistryBuilder {
    /// Register a schema. Registering the same type twice is an error.
    pub fn register(
        mut self,
        event_type: EventType,
        schema: SchemaDescriptor,
    ) -> Result<Self, RegistryError> {
        if self.schemas.contains_key(&event_type) {
            return Err(RegistryError::DuplicateEventType(event_type));
        }
        self.schemas.insert(event_type, schema);
        Ok(self)
    }

    /// Freeze the registry.
    pub fn build(self) -> EventRegistry {
        EventRegistry {
            schemas: self.schemas,
        }
    }
}

/// Registry errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RegistryError {
    /// Event type was registered twice
    #[error("Event type {0} is already registered")]
    DuplicateEventType(EventType),

    /// Event type is not in the registry
    #[error("Event type {0} is not registered")]
    UnknownEventType(EventType),
}
