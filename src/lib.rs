//! Partstate - durable partition state
//!
//! Each partition owns an embedded state database whose contents survive
//! restarts through directory snapshots, and an append-only log stream
//! whose commit position drives those snapshots. Every stateful component
//! runs as an actor on a shared cooperative scheduler.
//!
//! # Quick Start
//!
//! ```ignore
//! use partstate::{Partition, PartitionConfig};
//!
//! let config = PartitionConfig::new("/var/lib/p0");
//! let scheduler = Partition::scheduler(&config)?;
//! let partition = Partition::open(config, &scheduler)?;
//!
//! partition.log_stream().append(b"event".to_vec()).join()??;
//! partition.snapshot_now()?;
//! partition.close()?;
//! ```
//!
//! # Crates
//!
//! - `partstate-core`: configuration, positions, restore info, event registry
//! - `partstate-scheduler`: actor scheduler
//! - `partstate-storage`: the state database engine
//! - `partstate-durability`: snapshots, retention and recovery
//! - `partstate-logstream`: log storage and the log stream actor

pub mod partition;

pub use partition::{Partition, PartitionError, PartitionResult};

pub use partstate_core::{
    BpmnStep, EventRegistry, EventType, PartitionConfig, Position, SchemaDescriptor,
    SnapshotRestoreInfo,
};
pub use partstate_durability::{
    SnapshotDirector, SnapshotDirectorHandle, SnapshotError, StateSnapshotController, StateStorage,
};
pub use partstate_logstream::{
    DistributedLogBridge, FsLogStorage, LocalLogBridge, LogStream, LogStreamError,
    LogStreamReader, TypedStreamReader, TypedStreamWriter,
};
pub use partstate_scheduler::{
    Actor, ActorControl, ActorError, ActorFuture, ActorScheduler, ControlledActorClock,
};
pub use partstate_storage::{ColumnFamily, DbError, StateDb, WriteBatch};
