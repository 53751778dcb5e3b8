//! Core types for partition state
//!
//! This crate holds the small, dependency-light types shared by every other
//! crate in the workspace:
//!
//! - Partition configuration (`partstate.toml`)
//! - Log positions and the "no snapshot" sentinel
//! - Snapshot restore info exposed to the replication protocol
//! - The immutable event-type registry threaded through stream components
//! - Workflow lifecycle labels consumed by an external interpreter

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod config;
pub mod position;
pub mod registry;
pub mod restore_info;
pub mod step;

pub use config::{ConfigError, PartitionConfig, CONFIG_FILE_NAME};
pub use position::{
    is_valid_position, position_from_wire, position_to_wire, Position, MAX_POSITION, NO_POSITION,
};
pub use registry::{EventRegistry, EventRegistryBuilder, EventType, RegistryError, SchemaDescriptor};
pub use restore_info::{RestoreInfoError, RestoreInfoRecord, SnapshotRestoreInfo};
pub use step::BpmnStep;
