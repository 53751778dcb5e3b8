//! Column families and write batches
//!
//! A [`WriteBatch`] is the unit of atomicity: it is appended to the WAL as a
//! single CRC-protected record and applied to the in-memory view as a whole.
//!
//! # Batch encoding
//!
//! ```text
//! op_count u32 | op*
//! op = tag u8 (1 = put, 2 = delete) | cf u8 | key_len u32 | key | [value_len u32 | value]
//! ```

use std::fmt;
use std::io::Cursor;

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};

use crate::error::FormatError;
use crate::format::{ensure_consumed, read_bytes, truncated};

const TAG_PUT: u8 = 1;
const TAG_DELETE: u8 = 2;

/// Namespace inside the database.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct ColumnFamily(pub u8);

impl ColumnFamily {
    /// The default column family
    pub const DEFAULT: ColumnFamily = ColumnFamily(0);
}

impl fmt::Display for ColumnFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "cf-{}", self.0)
    }
}

/// Single operation in a batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BatchOp {
    /// Insert or overwrite
    Put {
        /// Column family
        cf: ColumnFamily,
        /// Key
        key: Vec<u8>,
        /// Value
        value: Vec<u8>,
    },
    /// Remove (no-op if absent)
    Delete {
        /// Column family
        cf: ColumnFamily,
        /// Key
        key: Vec<u8>,
    },
}

/// Ordered set of writes applied atomically.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WriteBatch {
    ops: Vec<BatchOp>,
}

impl WriteBatch {
    /// Empty batch.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a put.
    pub fn put(&mut self, cf: ColumnFamily, key: impl Into<Vec<u8>>, value: impl Into<Vec<u8>>) -> &mut Self {
        self.ops.push(BatchOp::Put {
            cf,
            key: key.into(),
            value: value.into(),
        });
        self
    }

    /// Add a delete.
    pub fn delete(&mut self, cf: ColumnFamily, key: impl Into<Vec<u8>>) -> &mut Self {
        self.ops.push(BatchOp::Delete { cf, key: key.into() });
        self
    }

    /// Operations in order.
    pub fn ops(&self) -> &[BatchOp] {
        &self.ops
    }

    /// Number of operations.
    pub fn len(&self) -> usize {
        self.ops.len()
    }

    /// True if the batch has no operations.
    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    pub(crate) fn encode(&self) -> Vec<u8> {
        let mut bytes = Vec::new();
        let _ = bytes.write_u32::<LittleEndian>(self.ops.len() as u32);
        for op in &self.ops {
            match op {
                BatchOp::Put { cf, key, value } => {
                    let _ = bytes.write_u8(TAG_PUT);
                    let _ = bytes.write_u8(cf.0);
                    write_bytes(&mut bytes, key);
                    write_bytes(&mut bytes, value);
                }
                BatchOp::Delete { cf, key } => {
                    let _ = bytes.write_u8(TAG_DELETE);
                    let _ = bytes.write_u8(cf.0);
                    write_bytes(&mut bytes, key);
                }
            }
        }
        bytes
    }

    pub(crate) fn decode(bytes: &[u8]) -> Result<Self, FormatError> {
        let mut cursor = Cursor::new(bytes);
        let count = cursor.read_u32::<LittleEndian>().map_err(truncated)?;
        let mut ops = Vec::with_capacity(count.min(1024) as usize);
        for _ in 0..count {
            let tag = cursor.read_u8().map_err(truncated)?;
            let cf = ColumnFamily(cursor.read_u8().map_err(truncated)?);
            let key = read_bytes(&mut cursor)?;
            let op = match tag {
                TAG_PUT => BatchOp::Put {
                    cf,
                    key,
                    value: read_bytes(&mut cursor)?,
                },
                TAG_DELETE => BatchOp::Delete { cf, key },
                other => return Err(FormatError::UnknownOperation(other)),
            };
            ops.push(op);
        }
        ensure_consumed(&cursor)?;
        Ok(WriteBatch { ops })
    }
}

fn write_bytes(out: &mut Vec<u8>, data: &[u8]) {
    let _ = out.write_u32::<LittleEndian>(data.len() as u32);
    out.extend_from_slice(data);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_preserves_order() {
        let mut batch = WriteBatch::new();
        batch
            .put(ColumnFamily::DEFAULT, "k", "v1")
            .delete(ColumnFamily(2), "k")
            .put(ColumnFamily::DEFAULT, "k", "v2");
        let decoded = WriteBatch::decode(&batch.encode()).unwrap();
        assert_eq!(decoded, batch);
        assert_eq!(decoded.len(), 3);
    }

    #[test]
    fn test_unknown_tag() {
        let mut bytes = Vec::new();
        bytes.extend_from_slice(&1u32.to_le_bytes());
        bytes.push(9);
        bytes.push(0);
        bytes.extend_from_slice(&0u32.to_le_bytes());
        assert_eq!(WriteBatch::decode(&bytes), Err(FormatError::UnknownOperation(9)));
    }
}
