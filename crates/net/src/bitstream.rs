//! Bit-packed wire codec.
//!
//! Values are written least-significant bit first into a growable byte
//! buffer. Booleans take a single bit, ranged integers take just enough bits
//! to hold `max - min`, and ranged floats are linearly quantized over
//! `[min, max]` at a caller-chosen width.
//!
//! The writer never validates ranges: an out-of-range value is written as
//! whatever its low bits happen to be. Callers clamp before writing. The
//! reader, on the other hand, always yields values inside the requested range
//! and reports reads past the end of the buffer as [`DecodeError`].

use thiserror::Error;

/// Errors raised while decoding a bit stream.
///
/// Any of these means the rest of the message cannot be trusted; the whole
/// message is discarded by the caller.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DecodeError {
    /// Attempted to read more bits than the buffer holds.
    #[error("read past end of buffer: needed {needed} bits at bit {position}, {available} available")]
    ReadPastEnd {
        /// Bit position of the failed read.
        position: usize,
        /// Bits requested.
        needed: usize,
        /// Bits left in the buffer.
        available: usize,
    },
    /// A string field did not contain valid UTF-8.
    #[error("string field is not valid utf-8")]
    InvalidString,
    /// A variable-length integer did not terminate within 5 bytes.
    #[error("variable-length integer overflows 32 bits")]
    VarIntOverflow,
    /// A tag byte had no matching variant.
    #[error("unrecognized {field} value {value}")]
    UnknownTag {
        /// Name of the tagged field.
        field: &'static str,
        /// Offending value.
        value: u8,
    },
    /// A length-prefixed field exceeded its protocol limit.
    #[error("{field} length {len} exceeds limit {max}")]
    LimitExceeded {
        /// Name of the field.
        field: &'static str,
        /// Length found on the wire.
        len: usize,
        /// Protocol maximum.
        max: usize,
    },
    /// The payload parsed but violates the message contract.
    #[error("invalid payload: {0}")]
    Invalid(&'static str),
}

/// Number of bits needed to hold `value` (at least one).
pub fn bits_to_hold(value: u32) -> u32 {
    (u32::BITS - value.leading_zeros()).max(1)
}

fn quantization_steps(bits: u32) -> u64 {
    debug_assert!((1..=32).contains(&bits), "ranged float width must be 1..=32");
    (1u64 << bits.clamp(1, 32)) - 1
}

/// Growable bit-level writer.
#[derive(Debug, Clone, Default)]
pub struct BitWriter {
    buf: Vec<u8>,
    bit_pos: usize,
}

impl BitWriter {
    /// Create an empty writer.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create an empty writer with room for `bytes` bytes.
    pub fn with_capacity(bytes: usize) -> Self {
        Self {
            buf: Vec::with_capacity(bytes),
            bit_pos: 0,
        }
    }

    /// Number of bits written so far.
    pub fn bit_len(&self) -> usize {
        self.bit_pos
    }

    /// Number of bytes the written bits occupy.
    pub fn byte_len(&self) -> usize {
        self.buf.len()
    }

    /// Consume the writer and return the packed bytes.
    ///
    /// Trailing bits of a partially filled final byte are zero.
    pub fn into_bytes(self) -> Vec<u8> {
        self.buf
    }

    fn push_bit(&mut self, bit: bool) {
        let byte = self.bit_pos / 8;
        if byte == self.buf.len() {
            self.buf.push(0);
        }
        if bit {
            self.buf[byte] |= 1 << (self.bit_pos % 8);
        }
        self.bit_pos += 1;
    }

    /// Write the low `bits` bits of `value`.
    pub fn write_bits(&mut self, value: u32, bits: u32) {
        debug_assert!(bits <= 32);
        for i in 0..bits.min(32) {
            self.push_bit((value >> i) & 1 != 0);
        }
    }

    /// Write a single-bit boolean.
    pub fn write_bool(&mut self, value: bool) {
        self.push_bit(value);
    }

    /// Advance to the next byte boundary.
    pub fn write_pad_bits(&mut self) {
        let offset = self.bit_pos % 8;
        if offset != 0 {
            self.bit_pos += 8 - offset;
        }
    }

    /// Write an 8-bit unsigned integer.
    pub fn write_u8(&mut self, value: u8) {
        if self.bit_pos % 8 == 0 {
            self.buf.push(value);
            self.bit_pos += 8;
        } else {
            self.write_bits(u32::from(value), 8);
        }
    }

    /// Write a 16-bit unsigned integer.
    pub fn write_u16(&mut self, value: u16) {
        self.write_bits(u32::from(value), 16);
    }

    /// Write a 32-bit unsigned integer.
    pub fn write_u32(&mut self, value: u32) {
        self.write_bits(value, 32);
    }

    /// Write a 32-bit signed integer.
    pub fn write_i32(&mut self, value: i32) {
        self.write_bits(value as u32, 32);
    }

    /// Write a 64-bit unsigned integer, low word first.
    pub fn write_u64(&mut self, value: u64) {
        self.write_bits(value as u32, 32);
        self.write_bits((value >> 32) as u32, 32);
    }

    /// Write a full-precision 32-bit float.
    pub fn write_f32(&mut self, value: f32) {
        self.write_bits(value.to_bits(), 32);
    }

    /// Write raw bytes.
    pub fn write_bytes(&mut self, bytes: &[u8]) {
        if self.bit_pos % 8 == 0 {
            self.buf.extend_from_slice(bytes);
            self.bit_pos += bytes.len() * 8;
        } else {
            for &byte in bytes {
                self.write_bits(u32::from(byte), 8);
            }
        }
    }

    /// Write an unsigned integer in 7-bit groups (LEB128).
    pub fn write_var_u32(&mut self, value: u32) {
        let mut remaining = value;
        while remaining >= 0x80 {
            self.write_u8((remaining as u8) | 0x80);
            remaining >>= 7;
        }
        self.write_u8(remaining as u8);
    }

    /// Write a length-prefixed UTF-8 string.
    pub fn write_string(&mut self, value: &str) {
        self.write_var_u32(value.len() as u32);
        self.write_bytes(value.as_bytes());
    }

    /// Write `value` using `bits_to_hold(max - min)` bits.
    ///
    /// Values outside `[min, max]` are not rejected; their offset from `min`
    /// is truncated to the field width.
    pub fn write_ranged_integer(&mut self, value: i32, min: i32, max: i32) {
        let range = (i64::from(max) - i64::from(min)) as u32;
        let bits = bits_to_hold(range);
        let offset = (i64::from(value) - i64::from(min)) as u32;
        self.write_bits(offset, bits);
    }

    /// Write `value` linearly quantized over `[min, max]` at `bits` bits.
    ///
    /// Out-of-range input is not rejected; the quantized step is truncated
    /// to the field width and decodes to an unrelated value.
    pub fn write_ranged_single(&mut self, value: f32, min: f32, max: f32, bits: u32) {
        let steps = quantization_steps(bits);
        let range = f64::from(max) - f64::from(min);
        let unit = (f64::from(value) - f64::from(min)) / range;
        let quantized = (unit * steps as f64).round() as i64;
        self.write_bits(quantized as u32, bits);
    }
}

/// Bit-level reader over a borrowed buffer.
#[derive(Debug, Clone)]
pub struct BitReader<'a> {
    buf: &'a [u8],
    bit_pos: usize,
    bit_len: usize,
}

impl<'a> BitReader<'a> {
    /// Create a reader positioned at the first bit of `buf`.
    pub fn new(buf: &'a [u8]) -> Self {
        Self {
            buf,
            bit_pos: 0,
            bit_len: buf.len() * 8,
        }
    }

    /// Current bit position.
    pub fn bit_position(&self) -> usize {
        self.bit_pos
    }

    /// Bits left to read.
    pub fn remaining_bits(&self) -> usize {
        self.bit_len - self.bit_pos
    }

    /// Whether fewer than eight bits remain.
    ///
    /// Trailing padding never spans a whole byte, so this is how callers
    /// detect the end of a packed payload.
    pub fn is_exhausted(&self) -> bool {
        self.remaining_bits() < 8
    }

    fn ensure(&self, bits: usize) -> Result<(), DecodeError> {
        if bits > self.remaining_bits() {
            return Err(DecodeError::ReadPastEnd {
                position: self.bit_pos,
                needed: bits,
                available: self.remaining_bits(),
            });
        }
        Ok(())
    }

    fn take_bit(&mut self) -> bool {
        let byte = self.buf[self.bit_pos / 8];
        let bit = (byte >> (self.bit_pos % 8)) & 1 != 0;
        self.bit_pos += 1;
        bit
    }

    /// Read `bits` bits as an unsigned integer.
    pub fn read_bits(&mut self, bits: u32) -> Result<u32, DecodeError> {
        debug_assert!(bits <= 32);
        self.ensure(bits as usize)?;
        let mut value = 0u32;
        for i in 0..bits.min(32) {
            if self.take_bit() {
                value |= 1 << i;
            }
        }
        Ok(value)
    }

    /// Read a single-bit boolean.
    pub fn read_bool(&mut self) -> Result<bool, DecodeError> {
        self.ensure(1)?;
        Ok(self.take_bit())
    }

    /// Skip to the next byte boundary.
    pub fn read_pad_bits(&mut self) {
        let offset = self.bit_pos % 8;
        if offset != 0 {
            self.bit_pos = (self.bit_pos + 8 - offset).min(self.bit_len);
        }
    }

    /// Read an 8-bit unsigned integer.
    pub fn read_u8(&mut self) -> Result<u8, DecodeError> {
        if self.bit_pos % 8 == 0 {
            self.ensure(8)?;
            let value = self.buf[self.bit_pos / 8];
            self.bit_pos += 8;
            return Ok(value);
        }
        Ok(self.read_bits(8)? as u8)
    }

    /// Peek at the next byte without consuming it.
    pub fn peek_u8(&self) -> Result<u8, DecodeError> {
        self.clone().read_u8()
    }

    /// Read a 16-bit unsigned integer.
    pub fn read_u16(&mut self) -> Result<u16, DecodeError> {
        Ok(self.read_bits(16)? as u16)
    }

    /// Read a 32-bit unsigned integer.
    pub fn read_u32(&mut self) -> Result<u32, DecodeError> {
        self.read_bits(32)
    }

    /// Read a 32-bit signed integer.
    pub fn read_i32(&mut self) -> Result<i32, DecodeError> {
        Ok(self.read_bits(32)? as i32)
    }

    /// Read a 64-bit unsigned integer, low word first.
    pub fn read_u64(&mut self) -> Result<u64, DecodeError> {
        self.ensure(64)?;
        let low = u64::from(self.read_bits(32)?);
        let high = u64::from(self.read_bits(32)?);
        Ok(low | (high << 32))
    }

    /// Read a full-precision 32-bit float.
    pub fn read_f32(&mut self) -> Result<f32, DecodeError> {
        Ok(f32::from_bits(self.read_bits(32)?))
    }

    /// Read `len` raw bytes.
    pub fn read_bytes(&mut self, len: usize) -> Result<Vec<u8>, DecodeError> {
        self.ensure(len.saturating_mul(8))?;
        if self.bit_pos % 8 == 0 {
            let start = self.bit_pos / 8;
            self.bit_pos += len * 8;
            return Ok(self.buf[start..start + len].to_vec());
        }
        let mut bytes = Vec::with_capacity(len);
        for _ in 0..len {
            bytes.push(self.read_bits(8)? as u8);
        }
        Ok(bytes)
    }

    /// Read an unsigned integer written in 7-bit groups.
    pub fn read_var_u32(&mut self) -> Result<u32, DecodeError> {
        let mut result = 0u32;
        let mut shift = 0u32;
        loop {
            let chunk = self.read_u8()?;
            if shift > 28 {
                return Err(DecodeError::VarIntOverflow);
            }
            result |= u32::from(chunk & 0x7f) << shift;
            if chunk & 0x80 == 0 {
                return Ok(result);
            }
            shift += 7;
        }
    }

    /// Read a length-prefixed UTF-8 string.
    pub fn read_string(&mut self) -> Result<String, DecodeError> {
        let len = self.read_var_u32()? as usize;
        let bytes = self.read_bytes(len)?;
        String::from_utf8(bytes).map_err(|_| DecodeError::InvalidString)
    }

    /// Read a ranged integer written with [`BitWriter::write_ranged_integer`].
    ///
    /// The result is clamped to `max` when the field width can represent
    /// more values than the range holds.
    pub fn read_ranged_integer(&mut self, min: i32, max: i32) -> Result<i32, DecodeError> {
        let range = (i64::from(max) - i64::from(min)) as u32;
        let bits = bits_to_hold(range);
        let offset = i64::from(self.read_bits(bits)?);
        Ok((i64::from(min) + offset).min(i64::from(max)) as i32)
    }

    /// Read a ranged float written with [`BitWriter::write_ranged_single`].
    pub fn read_ranged_single(&mut self, min: f32, max: f32, bits: u32) -> Result<f32, DecodeError> {
        let steps = quantization_steps(bits);
        let quantized = u64::from(self.read_bits(bits)?);
        let range = f64::from(max) - f64::from(min);
        let value = f64::from(min) + range * quantized as f64 / steps as f64;
        Ok((value as f32).clamp(min.min(max), max.max(min)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bits_to_hold() {
        assert_eq!(bits_to_hold(0), 1);
        assert_eq!(bits_to_hold(1), 1);
        assert_eq!(bits_to_hold(2), 2);
        assert_eq!(bits_to_hold(255), 8);
        assert_eq!(bits_to_hold(256), 9);
        assert_eq!(bits_to_hold(u32::MAX), 32);
    }

    #[test]
    fn test_booleans_are_bit_packed() {
        let mut writer = BitWriter::new();
        for bit in [true, false, true, true, false, false, false, true, true] {
            writer.write_bool(bit);
        }
        assert_eq!(writer.bit_len(), 9);
        let bytes = writer.into_bytes();
        assert_eq!(bytes, vec![0b1000_1101, 0b0000_0001]);

        let mut reader = BitReader::new(&bytes);
        assert!(reader.read_bool().unwrap());
        assert!(!reader.read_bool().unwrap());
        assert!(reader.read_bool().unwrap());
    }

    #[test]
    fn test_mixed_fields_roundtrip() {
        let mut writer = BitWriter::new();
        writer.write_bool(true);
        writer.write_u16(0xBEEF);
        writer.write_f32(-3.25);
        writer.write_ranged_integer(5, 0, 9);
        writer.write_string("Hello, hull");
        writer.write_pad_bits();
        writer.write_u64(0x0123_4567_89AB_CDEF);
        let bytes = writer.into_bytes();

        let mut reader = BitReader::new(&bytes);
        assert!(reader.read_bool().unwrap());
        assert_eq!(reader.read_u16().unwrap(), 0xBEEF);
        assert_eq!(reader.read_f32().unwrap(), -3.25);
        assert_eq!(reader.read_ranged_integer(0, 9).unwrap(), 5);
        assert_eq!(reader.read_string().unwrap(), "Hello, hull");
        reader.read_pad_bits();
        assert_eq!(reader.read_u64().unwrap(), 0x0123_4567_89AB_CDEF);
        assert!(reader.is_exhausted());
    }

    #[test]
    fn test_ranged_integer_width() {
        let mut writer = BitWriter::new();
        writer.write_ranged_integer(-3, -4, 3);
        assert_eq!(writer.bit_len(), 3);
    }

    #[test]
    fn test_ranged_integer_read_is_clamped() {
        // Range 0..=4 takes 3 bits; a raw 7 must not decode past the max.
        let mut writer = BitWriter::new();
        writer.write_bits(7, 3);
        let bytes = writer.into_bytes();
        let mut reader = BitReader::new(&bytes);
        assert_eq!(reader.read_ranged_integer(0, 4).unwrap(), 4);
    }

    #[test]
    fn test_ranged_single_precision() {
        let (min, max, bits) = (-20.0f32, 20.0f32, 12);
        for value in [-20.0f32, -7.3, 0.0, 4.0, 19.99, 20.0] {
            let mut writer = BitWriter::new();
            writer.write_ranged_single(value, min, max, bits);
            assert_eq!(writer.bit_len(), 12);
            let bytes = writer.into_bytes();
            let decoded = BitReader::new(&bytes)
                .read_ranged_single(min, max, bits)
                .unwrap();
            assert!((decoded - value).abs() <= (max - min) / 4096.0);
            assert!((min..=max).contains(&decoded));
        }
    }

    #[test]
    fn test_ranged_single_out_of_range_is_not_rejected() {
        let mut writer = BitWriter::new();
        writer.write_ranged_single(2.5, 0.0, 1.0, 8);
        writer.write_bool(true);
        let bytes = writer.into_bytes();

        let mut reader = BitReader::new(&bytes);
        let garbage = reader.read_ranged_single(0.0, 1.0, 8).unwrap();
        assert!((0.0..=1.0).contains(&garbage));
        // Following fields are still aligned with the schema.
        assert!(reader.read_bool().unwrap());
    }

    #[test]
    fn test_pad_bits() {
        let mut writer = BitWriter::new();
        writer.write_bool(true);
        writer.write_pad_bits();
        assert_eq!(writer.bit_len(), 8);
        writer.write_pad_bits();
        assert_eq!(writer.bit_len(), 8);
        writer.write_u8(0xAA);
        let bytes = writer.into_bytes();
        assert_eq!(bytes, vec![0x01, 0xAA]);

        let mut reader = BitReader::new(&bytes);
        reader.read_bool().unwrap();
        reader.read_pad_bits();
        assert_eq!(reader.read_u8().unwrap(), 0xAA);
    }

    #[test]
    fn test_read_past_end() {
        let bytes = [0xFFu8];
        let mut reader = BitReader::new(&bytes);
        let err = reader.read_u16().unwrap_err();
        assert_eq!(
            err,
            DecodeError::ReadPastEnd {
                position: 0,
                needed: 16,
                available: 8
            }
        );
    }

    #[test]
    fn test_truncated_string() {
        let mut writer = BitWriter::new();
        writer.write_var_u32(40);
        writer.write_bytes(b"short");
        let bytes = writer.into_bytes();
        assert!(matches!(
            BitReader::new(&bytes).read_string(),
            Err(DecodeError::ReadPastEnd { .. })
        ));
    }

    #[test]
    fn test_var_u32_overflow() {
        let bytes = [0xFFu8; 6];
        assert_eq!(
            BitReader::new(&bytes).read_var_u32(),
            Err(DecodeError::VarIntOverflow)
        );
    }

    #[test]
    fn test_var_u32_roundtrip() {
        for value in [0u32, 1, 127, 128, 300, 16_384, u32::MAX] {
            let mut writer = BitWriter::new();
            writer.write_var_u32(value);
            let bytes = writer.into_bytes();
            assert_eq!(BitReader::new(&bytes).read_var_u32().unwrap(), value);
        }
    }

    #[test]
    fn test_unaligned_bytes() {
        let mut writer = BitWriter::new();
        writer.write_bool(false);
        writer.write_bytes(&[1, 2, 3]);
        let bytes = writer.into_bytes();
        assert_eq!(bytes.len(), 4);
        let mut reader = BitReader::new(&bytes);
        reader.read_bool().unwrap();
        assert_eq!(reader.read_bytes(3).unwrap(), vec![1, 2, 3]);
    }

    #[test]
    fn test_peek_does_not_consume() {
        let bytes = [9u8, 10];
        let mut reader = BitReader::new(&bytes);
        assert_eq!(reader.peek_u8().unwrap(), 9);
        assert_eq!(reader.read_u8().unwrap(), 9);
        assert_eq!(reader.read_u8().unwrap(), 10);
    }
}
