//! Prepared statements sent to a peer for remote execution.
//!
//! The statement travels as an aligned parcel inside the CBOR packet:
//!
//! ```text
//! i32 version | i32 opcode | string sql | i32 arg count | string * count
//! ```

use crate::error::{ProtocolError, ProtocolResult};
use meshsync_codec::{CodecError, Parcel, ParcelReader, ParcelWriter};
use serde::de::{self, Visitor};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;

/// Parcel layout version.
pub const PREPARED_STMT_VERSION: i32 = 1;

/// Maximum number of bind arguments accepted on the wire.
pub const PREPARED_STMT_MAX_ARGS: usize = 1000;

/// Statement kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ExecutorOperation {
    /// Read rows.
    #[default]
    Query = 1,
    /// Delete rows.
    Delete = 2,
    /// Update rows.
    Update = 3,
    /// Insert rows.
    Insert = 4,
}

impl ExecutorOperation {
    const MIN_LIMIT: i32 = ExecutorOperation::Query as i32;
    const MAX_LIMIT: i32 = ExecutorOperation::Insert as i32;

    /// Wire opcode.
    pub fn code(self) -> i32 {
        self as i32
    }

    /// Parses an opcode within the accepted range.
    pub fn from_code(code: i32) -> ProtocolResult<Self> {
        if !(Self::MIN_LIMIT..=Self::MAX_LIMIT).contains(&code) {
            return Err(ProtocolError::InvalidOpcode(code));
        }
        Ok(match code {
            1 => ExecutorOperation::Query,
            2 => ExecutorOperation::Delete,
            3 => ExecutorOperation::Update,
            _ => ExecutorOperation::Insert,
        })
    }
}

/// A SQL statement with positional bind arguments.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct PreparedStmt {
    /// Statement kind.
    pub operation: ExecutorOperation,
    /// Statement text.
    pub sql: String,
    /// Bind arguments, as text.
    pub bind_args: Vec<String>,
}

impl PreparedStmt {
    /// Creates a statement.
    pub fn new(operation: ExecutorOperation, sql: impl Into<String>, bind_args: Vec<String>) -> Self {
        Self {
            operation,
            sql: sql.into(),
            bind_args,
        }
    }

    /// Creates a query statement.
    pub fn query(sql: impl Into<String>) -> Self {
        Self::new(ExecutorOperation::Query, sql, Vec::new())
    }

    /// Adds a bind argument.
    pub fn bind(mut self, arg: impl Into<String>) -> Self {
        self.bind_args.push(arg.into());
        self
    }

    /// Returns true if the statement only reads.
    pub fn is_query(&self) -> bool {
        self.operation == ExecutorOperation::Query
    }

    /// Encoded parcel size.
    pub fn parcel_len(&self) -> usize {
        Parcel::int_len() * 3
            + Parcel::string_len(&self.sql)
            + self.bind_args.iter().map(|a| Parcel::string_len(a)).sum::<usize>()
    }

    /// Writes the parcel form.
    pub fn to_parcel(&self) -> ProtocolResult<Vec<u8>> {
        if self.bind_args.len() > PREPARED_STMT_MAX_ARGS {
            return Err(ProtocolError::TooManyBindArgs {
                count: self.bind_args.len() as i64,
                max: PREPARED_STMT_MAX_ARGS,
            });
        }
        let mut writer = ParcelWriter::with_capacity(self.parcel_len());
        writer.write_i32(PREPARED_STMT_VERSION);
        writer.write_i32(self.operation.code());
        writer.write_string(&self.sql)?;
        writer.write_i32(self.bind_args.len() as i32);
        for arg in &self.bind_args {
            writer.write_string(arg)?;
        }
        Ok(writer.into_bytes().to_vec())
    }

    /// Parses the parcel form.
    ///
    /// # Errors
    ///
    /// Unknown opcodes and argument counts outside `0..=PREPARED_STMT_MAX_ARGS`
    /// are rejected, as is any truncated field.
    pub fn from_parcel(bytes: &[u8]) -> ProtocolResult<Self> {
        let mut reader = ParcelReader::new(bytes);
        let version = reader.read_i32()?;
        if version <= 0 {
            return Err(CodecError::out_of_range("prepared statement version", version).into());
        }
        let operation = ExecutorOperation::from_code(reader.read_i32()?)?;
        let sql = reader.read_string()?;
        let count = reader.read_i32()?;
        if count < 0 || count as usize > PREPARED_STMT_MAX_ARGS {
            return Err(ProtocolError::TooManyBindArgs {
                count: count.into(),
                max: PREPARED_STMT_MAX_ARGS,
            });
        }
        let bind_args = (0..count)
            .map(|_| reader.read_string())
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self {
            operation,
            sql,
            bind_args,
        })
    }
}

impl Serialize for PreparedStmt {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let bytes = self.to_parcel().map_err(serde::ser::Error::custom)?;
        serializer.serialize_bytes(&bytes)
    }
}

impl<'de> Deserialize<'de> for PreparedStmt {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct ParcelVisitor;

        impl<'de> Visitor<'de> for ParcelVisitor {
            type Value = PreparedStmt;

            fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
                f.write_str("a prepared statement parcel")
            }

            fn visit_bytes<E: de::Error>(self, v: &[u8]) -> Result<PreparedStmt, E> {
                PreparedStmt::from_parcel(v).map_err(E::custom)
            }

            fn visit_byte_buf<E: de::Error>(self, v: Vec<u8>) -> Result<PreparedStmt, E> {
                self.visit_bytes(&v)
            }
        }

        deserializer.deserialize_bytes(ParcelVisitor)
    }
}
