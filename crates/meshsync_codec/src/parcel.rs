//! Eight-byte aligned binary parcels.
//!
//! Records such as prepared statements travel as a flat sequence of
//! little-endian integers and length-prefixed strings. Every field starts on
//! an 8-byte boundary; the gap after a shorter field is zero padding.

use crate::error::{CodecError, CodecResult};
use bytes::{Buf, BufMut, Bytes, BytesMut};

/// Alignment of every parcel field, in bytes.
pub const PARCEL_ALIGN: usize = 8;

/// Size helpers for parcel layouts.
pub struct Parcel;

impl Parcel {
    /// Rounds `len` up to the next multiple of [`PARCEL_ALIGN`].
    pub const fn aligned_len(len: usize) -> usize {
        (len + PARCEL_ALIGN - 1) & !(PARCEL_ALIGN - 1)
    }

    /// Encoded size of a 32-bit integer field.
    pub const fn int_len() -> usize {
        Self::aligned_len(4)
    }

    /// Encoded size of a 64-bit integer field.
    pub const fn long_len() -> usize {
        Self::aligned_len(8)
    }

    /// Encoded size of a string field (length prefix plus padded body).
    pub fn string_len(value: &str) -> usize {
        Self::int_len() + Self::aligned_len(value.len())
    }
}

/// Writes parcel fields into a growable buffer.
#[derive(Debug, Default)]
pub struct ParcelWriter {
    buf: BytesMut,
}

impl ParcelWriter {
    /// Creates an empty writer.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a writer with room for `capacity` bytes.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            buf: BytesMut::with_capacity(capacity),
        }
    }

    /// Writes a signed 32-bit integer.
    pub fn write_i32(&mut self, value: i32) {
        self.buf.put_i32_le(value);
        self.pad();
    }

    /// Writes an unsigned 32-bit integer.
    pub fn write_u32(&mut self, value: u32) {
        self.buf.put_u32_le(value);
        self.pad();
    }

    /// Writes an unsigned 64-bit integer.
    pub fn write_u64(&mut self, value: u64) {
        self.buf.put_u64_le(value);
    }

    /// Writes a length-prefixed UTF-8 string.
    pub fn write_string(&mut self, value: &str) -> CodecResult<()> {
        self.write_bytes(value.as_bytes())
    }

    /// Writes a length-prefixed byte string.
    pub fn write_bytes(&mut self, value: &[u8]) -> CodecResult<()> {
        let len = u32::try_from(value.len())
            .map_err(|_| CodecError::encoding_failed("parcel field longer than u32::MAX"))?;
        self.write_u32(len);
        self.buf.put_slice(value);
        self.pad();
        Ok(())
    }

    /// Number of bytes written so far.
    pub fn len(&self) -> usize {
        self.buf.len()
    }

    /// Returns true if nothing has been written.
    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// Finishes the parcel.
    pub fn into_bytes(self) -> Bytes {
        self.buf.freeze()
    }

    fn pad(&mut self) {
        let len = self.buf.len();
        self.buf.put_bytes(0, Parcel::aligned_len(len) - len);
    }
}

/// Reads parcel fields from a byte slice.
#[derive(Debug)]
pub struct ParcelReader<'a> {
    buf: &'a [u8],
    consumed: usize,
}

impl<'a> ParcelReader<'a> {
    /// Creates a reader over `buf`.
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf, consumed: 0 }
    }

    /// Bytes left to read.
    pub fn remaining(&self) -> usize {
        self.buf.remaining()
    }

    /// Reads a signed 32-bit integer.
    pub fn read_i32(&mut self) -> CodecResult<i32> {
        self.ensure(4)?;
        let value = self.buf.get_i32_le();
        self.consumed += 4;
        self.skip_padding()?;
        Ok(value)
    }

    /// Reads an unsigned 32-bit integer.
    pub fn read_u32(&mut self) -> CodecResult<u32> {
        self.ensure(4)?;
        let value = self.buf.get_u32_le();
        self.consumed += 4;
        self.skip_padding()?;
        Ok(value)
    }

    /// Reads an unsigned 64-bit integer.
    pub fn read_u64(&mut self) -> CodecResult<u64> {
        self.ensure(8)?;
        self.consumed += 8;
        Ok(self.buf.get_u64_le())
    }

    /// Reads a length-prefixed byte string.
    pub fn read_bytes(&mut self) -> CodecResult<Vec<u8>> {
        let len = self.read_u32()? as usize;
        self.ensure(len)?;
        let value = self.buf[..len].to_vec();
        self.buf.advance(len);
        self.consumed += len;
        self.skip_padding()?;
        Ok(value)
    }

    /// Reads a length-prefixed UTF-8 string.
    pub fn read_string(&mut self) -> CodecResult<String> {
        let raw = self.read_bytes()?;
        String::from_utf8(raw).map_err(|_| CodecError::InvalidUtf8)
    }

    fn ensure(&self, needed: usize) -> CodecResult<()> {
        if self.buf.remaining() < needed {
            return Err(CodecError::UnexpectedEof {
                needed,
                remaining: self.buf.remaining(),
            });
        }
        Ok(())
    }

    fn skip_padding(&mut self) -> CodecResult<()> {
        let pad = Parcel::aligned_len(self.consumed) - self.consumed;
        self.ensure(pad)?;
        self.buf.advance(pad);
        self.consumed += pad;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn integers_are_padded_to_eight_bytes() {
        let mut writer = ParcelWriter::new();
        writer.write_i32(-7);
        assert_eq!(writer.len(), 8);
        writer.write_u64(u64::MAX);
        assert_eq!(writer.len(), 16);

        let bytes = writer.into_bytes();
        let mut reader = ParcelReader::new(&bytes);
        assert_eq!(reader.read_i32().unwrap(), -7);
        assert_eq!(reader.read_u64().unwrap(), u64::MAX);
        assert_eq!(reader.remaining(), 0);
    }

    #[test]
    fn string_layout_matches_size_helper() {
        let mut writer = ParcelWriter::new();
        writer.write_string("SELECT 1").unwrap();
        writer.write_string("abc").unwrap();
        assert_eq!(
            writer.len(),
            Parcel::string_len("SELECT 1") + Parcel::string_len("abc")
        );

        let bytes = writer.into_bytes();
        let mut reader = ParcelReader::new(&bytes);
        assert_eq!(reader.read_string().unwrap(), "SELECT 1");
        assert_eq!(reader.read_string().unwrap(), "abc");
    }

    #[test]
    fn truncated_string_is_an_error() {
        let mut writer = ParcelWriter::new();
        writer.write_string("truncated").unwrap();
        let bytes = writer.into_bytes();

        let mut reader = ParcelReader::new(&bytes[..12]);
        assert!(matches!(
            reader.read_string(),
            Err(CodecError::UnexpectedEof { .. })
        ));
    }

    #[test]
    fn invalid_utf8_is_rejected() {
        let mut writer = ParcelWriter::new();
        writer.write_bytes(&[0xff, 0xfe]).unwrap();
        let bytes = writer.into_bytes();
        let mut reader = ParcelReader::new(&bytes);
        assert_eq!(reader.read_string(), Err(CodecError::InvalidUtf8));
    }

    proptest! {
        #[test]
        fn reader_never_panics_on_garbage(data in proptest::collection::vec(any::<u8>(), 0..64)) {
            let mut reader = ParcelReader::new(&data);
            let _ = reader.read_i32();
            let _ = reader.read_string();
            let _ = reader.read_u64();
        }
    }
}
