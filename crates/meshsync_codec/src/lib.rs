//! # MeshSync Codec
//!
//! Encoding primitives shared by every MeshSync wire packet.
//!
//! This crate provides:
//! - CBOR encoding for serde types ([`to_cbor`], [`from_cbor`] and the
//!   [`Encode`]/[`Decode`] traits)
//! - Eight-byte aligned parcels ([`ParcelWriter`], [`ParcelReader`]) for
//!   records with a fixed binary layout, such as prepared statements
//!
//! ## Usage
//!
//! ```
//! use meshsync_codec::{ParcelReader, ParcelWriter};
//!
//! let mut writer = ParcelWriter::new();
//! writer.write_i32(3);
//! writer.write_string("SELECT * FROM t").unwrap();
//! let bytes = writer.into_bytes();
//!
//! let mut reader = ParcelReader::new(&bytes);
//! assert_eq!(reader.read_i32().unwrap(), 3);
//! assert_eq!(reader.read_string().unwrap(), "SELECT * FROM t");
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod cbor;
mod error;
mod parcel;

pub use cbor::{from_cbor, to_cbor, Decode, Encode};
pub use error::{CodecError, CodecResult};
pub use parcel::{Parcel, ParcelReader, ParcelWriter, PARCEL_ALIGN};
