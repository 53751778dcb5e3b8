//! Partition log stream
//!
//! - [`FsLogStorage`]: segmented, CRC-framed log files
//! - [`LogStream`]: single-writer stream actor with a commit position
//! - [`DistributedLogBridge`]: where appended entries are made durable;
//!   [`LocalLogBridge`] writes to the local storage from the blocking pool
//! - [`LogStreamReader`], [`TypedStreamWriter`], [`TypedStreamReader`]

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod bridge;
pub mod error;
pub mod reader;
pub mod storage;
pub mod stream;
pub mod typed;

pub use bridge::{DistributedLogBridge, LocalLogBridge};
pub use error::{LogStreamError, LogStreamResult};
pub use reader::LogStreamReader;
pub use storage::{FsLogStorage, LoggedEntry};
pub use stream::{LogStream, LogStreamBuilder, FIRST_POSITION};
pub use typed::{TypedRecord, TypedStreamReader, TypedStreamWriter};
