//! Wire-level primitives shared by every control packet.
//!
//! MQTT 5.0 composes all packets from a small set of encodings: Variable
//! Byte Integers, big-endian two/four-byte integers, length-prefixed
//! UTF-8 strings, length-prefixed binary data, and string pairs. This
//! module provides a bounds-checked decoder cursor over one framed packet
//! body plus the matching write helpers.

use crate::error::MqttError;
use bytes::{Buf, BufMut, Bytes, BytesMut};

pub mod packet;
pub mod properties;
pub mod reason;

/// Largest value representable by a Variable Byte Integer.
pub const VBI_MAX: u32 = 268_435_455;

/// Largest length-prefixed string or binary field, in octets.
pub const MAX_FIELD_LEN: usize = 65_535;

// ---------------------------------------------------------------------------
// Decoder cursor
// ---------------------------------------------------------------------------

/// Bounds-checked reader over one packet body.
///
/// Every read fails with [`MqttError::MalformedPacket`] on underflow; a
/// packet that decodes successfully has therefore been fully validated
/// against its framed length.
#[derive(Debug)]
pub struct Reader {
    buf: Bytes,
}

impl Reader {
    pub fn new(buf: Bytes) -> Self {
        Self { buf }
    }

    /// Bytes left in the frame.
    pub fn remaining(&self) -> usize {
        self.buf.remaining()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn read_u8(&mut self) -> Result<u8, MqttError> {
        if self.buf.remaining() < 1 {
            return Err(MqttError::malformed("unexpected end of packet"));
        }
        Ok(self.buf.get_u8())
    }

    pub fn read_u16(&mut self) -> Result<u16, MqttError> {
        if self.buf.remaining() < 2 {
            return Err(MqttError::malformed("unexpected end of packet"));
        }
        Ok(self.buf.get_u16())
    }

    pub fn read_u32(&mut self) -> Result<u32, MqttError> {
        if self.buf.remaining() < 4 {
            return Err(MqttError::malformed("unexpected end of packet"));
        }
        Ok(self.buf.get_u32())
    }

    /// Decode a Variable Byte Integer: 1-4 bytes, low seven bits per
    /// byte, bit 7 as the continuation flag.
    pub fn read_vbi(&mut self) -> Result<u32, MqttError> {
        let mut value: u32 = 0;
        let mut shift: u32 = 0;
        loop {
            let byte = self.read_u8()?;
            value |= u32::from(byte & 0x7F) << shift;
            if byte & 0x80 == 0 {
                return Ok(value);
            }
            shift += 7;
            if shift > 21 {
                return Err(MqttError::malformed("variable byte integer exceeds 4 bytes"));
            }
        }
    }

    /// Two-byte length prefix followed by UTF-8 bytes.
    pub fn read_string(&mut self) -> Result<String, MqttError> {
        let bytes = self.read_binary()?;
        match std::str::from_utf8(&bytes) {
            Ok(s) => Ok(s.to_string()),
            Err(_) => Err(MqttError::malformed("string field is not valid UTF-8")),
        }
    }

    /// Two-byte length prefix followed by raw bytes.
    pub fn read_binary(&mut self) -> Result<Bytes, MqttError> {
        let len = self.read_u16()? as usize;
        self.read_bytes(len)
    }

    /// Two UTF-8 strings in sequence.
    pub fn read_string_pair(&mut self) -> Result<(String, String), MqttError> {
        let key = self.read_string()?;
        let value = self.read_string()?;
        Ok((key, value))
    }

    pub fn read_bytes(&mut self, len: usize) -> Result<Bytes, MqttError> {
        if self.buf.remaining() < len {
            return Err(MqttError::malformed("unexpected end of packet"));
        }
        Ok(self.buf.split_to(len))
    }

    /// Consume and return every remaining byte of the frame.
    pub fn take_rest(&mut self) -> Bytes {
        self.buf.split_to(self.buf.len())
    }
}

// ---------------------------------------------------------------------------
// Write helpers
// ---------------------------------------------------------------------------

/// Encode a Variable Byte Integer into `out`.
pub fn write_vbi(out: &mut BytesMut, value: u32) -> Result<(), MqttError> {
    if value > VBI_MAX {
        return Err(MqttError::malformed(format!(
            "value {value} exceeds variable byte integer range"
        )));
    }
    let mut v = value;
    loop {
        let mut byte = (v % 128) as u8;
        v /= 128;
        if v > 0 {
            byte |= 0x80;
        }
        out.put_u8(byte);
        if v == 0 {
            return Ok(());
        }
    }
}

/// Number of bytes `write_vbi` will emit for `value`.
pub fn vbi_len(value: u32) -> usize {
    match value {
        0..=127 => 1,
        128..=16_383 => 2,
        16_384..=2_097_151 => 3,
        _ => 4,
    }
}

/// Length-prefixed UTF-8 string; fails when the string exceeds 65535
/// octets.
pub fn write_string(out: &mut BytesMut, s: &str) -> Result<(), MqttError> {
    if s.len() > MAX_FIELD_LEN {
        return Err(MqttError::malformed(format!(
            "string of {} octets exceeds field limit",
            s.len()
        )));
    }
    out.put_u16(s.len() as u16);
    out.put_slice(s.as_bytes());
    Ok(())
}

/// Length-prefixed binary data; fails when the data exceeds 65535 octets.
pub fn write_binary(out: &mut BytesMut, data: &[u8]) -> Result<(), MqttError> {
    if data.len() > MAX_FIELD_LEN {
        return Err(MqttError::malformed(format!(
            "binary field of {} octets exceeds field limit",
            data.len()
        )));
    }
    out.put_u16(data.len() as u16);
    out.put_slice(data);
    Ok(())
}

/// Two length-prefixed UTF-8 strings in sequence.
pub fn write_string_pair(out: &mut BytesMut, key: &str, value: &str) -> Result<(), MqttError> {
    write_string(out, key)?;
    write_string(out, value)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn encode_vbi(value: u32) -> BytesMut {
        let mut out = BytesMut::new();
        write_vbi(&mut out, value).unwrap();
        out
    }

    #[test]
    fn test_vbi_round_trip_boundaries() {
        for value in [
            0u32, 1, 127, 128, 16_383, 16_384, 2_097_151, 2_097_152, VBI_MAX,
        ] {
            let encoded = encode_vbi(value);
            assert_eq!(encoded.len(), vbi_len(value), "length for {value}");
            let mut reader = Reader::new(encoded.freeze());
            assert_eq!(reader.read_vbi().unwrap(), value);
            assert!(reader.is_empty());
        }
    }

    #[test]
    fn test_vbi_rejects_value_out_of_range() {
        let mut out = BytesMut::new();
        assert!(write_vbi(&mut out, VBI_MAX + 1).is_err());
    }

    #[test]
    fn test_vbi_rejects_fifth_continuation_byte() {
        let mut reader = Reader::new(Bytes::from_static(&[0xFF, 0xFF, 0xFF, 0xFF, 0x01]));
        assert!(matches!(
            reader.read_vbi(),
            Err(MqttError::MalformedPacket(_))
        ));
    }

    #[test]
    fn test_vbi_underflow() {
        let mut reader = Reader::new(Bytes::from_static(&[0x80]));
        assert!(reader.read_vbi().is_err());
    }

    #[test]
    fn test_string_round_trip() {
        let mut out = BytesMut::new();
        write_string(&mut out, "sensors/room-1/temp").unwrap();
        let mut reader = Reader::new(out.freeze());
        assert_eq!(reader.read_string().unwrap(), "sensors/room-1/temp");
    }

    #[test]
    fn test_string_rejects_invalid_utf8() {
        let mut reader = Reader::new(Bytes::from_static(&[0x00, 0x02, 0xC3, 0x28]));
        assert!(reader.read_string().is_err());
    }

    #[test]
    fn test_binary_round_trip() {
        let payload: Vec<u8> = (0..=255).collect();
        let mut out = BytesMut::new();
        write_binary(&mut out, &payload).unwrap();
        let mut reader = Reader::new(out.freeze());
        assert_eq!(reader.read_binary().unwrap().as_ref(), payload.as_slice());
    }

    #[test]
    fn test_field_length_limit() {
        let oversized = vec![0u8; MAX_FIELD_LEN + 1];
        let mut out = BytesMut::new();
        assert!(write_binary(&mut out, &oversized).is_err());
    }

    #[test]
    fn test_string_pair_round_trip() {
        let mut out = BytesMut::new();
        write_string_pair(&mut out, "trace-id", "abc123").unwrap();
        let mut reader = Reader::new(out.freeze());
        assert_eq!(
            reader.read_string_pair().unwrap(),
            ("trace-id".to_string(), "abc123".to_string())
        );
    }

    #[test]
    fn test_reader_underflow_reports_malformed() {
        let mut reader = Reader::new(Bytes::from_static(&[0x01]));
        assert!(reader.read_u16().is_err());
        let mut reader = Reader::new(Bytes::from_static(&[0x01, 0x02]));
        assert!(reader.read_u32().is_err());
    }
}
