//! Typed records
//!
//! A typed record is an ordinary log entry whose payload starts with the
//! event type and the schema version it was written with, followed by the
//! MessagePack encoded value:
//!
//! ```text
//! ┌──────────────────┬──────────────────────┬──────────────────┐
//! │ Event type (u16) │ Schema version (u16) │ MessagePack body │
//! └──────────────────┴──────────────────────┴──────────────────┘
//! ```
//!
//! Writers refuse event types missing from the [`EventRegistry`]; readers
//! additionally refuse records written with a newer schema version than the
//! registry describes.

use std::io::Cursor;
use std::sync::Arc;

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use serde::de::DeserializeOwned;
use serde::Serialize;

use partstate_core::{EventRegistry, EventType, Position};
use partstate_scheduler::ActorFuture;

use crate::error::{LogStreamError, LogStreamResult};
use crate::reader::LogStreamReader;
use crate::storage::LoggedEntry;
use crate::stream::LogStream;

const RECORD_HEADER_SIZE: usize = 4;

/// A typed record read back from the stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TypedRecord {
    /// Log position
    pub position: Position,
    /// Event type tag
    pub event_type: EventType,
    /// Schema version the value was written with
    pub schema_version: u16,
    body: Vec<u8>,
}

impl TypedRecord {
    /// Decode the value.
    pub fn value<T: DeserializeOwned>(&self) -> LogStreamResult<T> {
        rmp_serde::from_slice(&self.body).map_err(|e| LogStreamError::Decode {
            position: self.position,
            message: e.to_string(),
        })
    }

    /// The encoded value.
    pub fn body(&self) -> &[u8] {
        &self.body
    }
}

/// Appends typed records to a log stream.
pub struct TypedStreamWriter {
    stream: LogStream,
    registry: Arc<EventRegistry>,
}

impl TypedStreamWriter {
    /// Writer over `stream` validating against `registry`.
    pub fn new(stream: LogStream, registry: Arc<EventRegistry>) -> Self {
        TypedStreamWriter { stream, registry }
    }

    /// Append `value` as a record of `event_type`.
    pub fn write<T: Serialize + ?Sized>(
        &self,
        event_type: EventType,
        value: &T,
    ) -> ActorFuture<LogStreamResult<Position>> {
        match self.encode(event_type, value) {
            Ok(bytes) => self.stream.append(bytes),
            Err(e) => ActorFuture::completed(Err(e)),
        }
    }

    fn encode<T: Serialize + ?Sized>(
        &self,
        event_type: EventType,
        value: &T,
    ) -> LogStreamResult<Vec<u8>> {
        let schema = self.registry.require(event_type)?;
        let body = rmp_serde::to_vec_named(value).map_err(|e| LogStreamError::Encode(e.to_string()))?;
        let mut bytes = Vec::with_capacity(RECORD_HEADER_SIZE + body.len());
        bytes.write_u16::<LittleEndian>(event_type.0)?;
        bytes.write_u16::<LittleEndian>(schema.version)?;
        bytes.extend_from_slice(&body);
        Ok(bytes)
    }
}

/// Reads typed records from a log stream, up to the commit position.
pub struct TypedStreamReader {
    reader: LogStreamReader,
    registry: Arc<EventRegistry>,
}

impl TypedStreamReader {
    /// Reader over `reader` validating against `registry`.
    pub fn new(reader: LogStreamReader, registry: Arc<EventRegistry>) -> Self {
        TypedStreamReader { reader, registry }
    }

    /// Continue at the first record at or after `position`.
    pub fn seek(&mut self, position: Position) {
        self.reader.seek(position);
    }

    fn decode(&self, entry: LoggedEntry) -> LogStreamResult<TypedRecord> {
        if entry.payload.len() < RECORD_HEADER_SIZE {
            return Err(LogStreamError::Decode {
                position: entry.position,
                message: format!("record of {} bytes has no header", entry.payload.len()),
            });
        }
        let mut header = Cursor::new(&entry.payload[..RECORD_HEADER_SIZE]);
        let event_type = EventType(header.read_u16::<LittleEndian>()?);
        let written = header.read_u16::<LittleEndian>()?;

        let schema = self.registry.require(event_type)?;
        if written > schema.version {
            return Err(LogStreamError::UnsupportedSchemaVersion {
                event_type,
                written,
                supported: schema.version,
            });
        }

        let mut payload = entry.payload;
        let body = payload.split_off(RECORD_HEADER_SIZE);
        Ok(TypedRecord {
            position: entry.position,
            event_type,
            schema_version: written,
            body,
        })
    }
}

impl Iterator for TypedStreamReader {
    type Item = LogStreamResult<TypedRecord>;

    fn next(&mut self) -> Option<Self::Item> {
        let entry = self.reader.next()?;
        Some(entry.and_then(|entry| self.decode(entry)))
    }
}
