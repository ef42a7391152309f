//! Record codec for bulk loading and saving enum stores.
//!
//! A serialized store is a plain sequence of records in ascending value
//! order, with no header. Integers are fixed-width little endian; strings and
//! byte strings are a varint length followed by the bytes.

use crate::error::{Result, StoreError};

/// Longest varint encoding of a `u64`.
pub const MAX_VARINT_LEN: usize = 10;

/// Write `value` as a little-endian base-128 varint into `buf`, returning
/// the number of bytes written.
pub fn encode_varint(mut value: u64, buf: &mut [u8]) -> usize {
    let mut i = 0;
    while value >= 0x80 {
        buf[i] = (value as u8) | 0x80;
        value >>= 7;
        i += 1;
    }
    buf[i] = value as u8;
    i + 1
}

/// Bytes [`encode_varint`] writes for `value`.
#[inline]
pub fn varint_size(value: u64) -> usize {
    // Zero still takes one byte.
    ((64 - (value | 1).leading_zeros()) as usize).div_ceil(7)
}

/// Append a length-prefixed byte slice.
pub fn encode_bytes(data: &[u8], buf: &mut Vec<u8>) {
    let mut len_buf = [0u8; MAX_VARINT_LEN];
    let len_size = encode_varint(data.len() as u64, &mut len_buf);
    buf.extend_from_slice(&len_buf[..len_size]);
    buf.extend_from_slice(data);
}

/// Cursor over serialized records.
///
/// Every read checks bounds and reports the offset it failed at.
#[derive(Debug, Clone)]
pub struct Decoder<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Decoder<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    /// Bytes consumed so far.
    pub fn position(&self) -> usize {
        self.pos
    }

    pub fn is_empty(&self) -> bool {
        self.pos == self.buf.len()
    }

    fn corrupt(&self, reason: &'static str) -> StoreError {
        StoreError::Corrupt {
            offset: self.pos,
            reason,
        }
    }

    pub fn read_varint(&mut self) -> Result<u64> {
        let mut value = 0u64;
        let mut shift = 0;
        let mut i = self.pos;
        loop {
            let Some(&byte) = self.buf.get(i) else {
                return Err(self.corrupt("truncated varint"));
            };
            if shift == 63 && byte > 1 {
                return Err(self.corrupt("varint overflows u64"));
            }
            value |= ((byte & 0x7F) as u64) << shift;
            i += 1;
            if byte & 0x80 == 0 {
                break;
            }
            shift += 7;
        }
        self.pos = i;
        Ok(value)
    }

    pub fn read_fixed<const N: usize>(&mut self) -> Result<[u8; N]> {
        let end = self.pos + N;
        let Some(bytes) = self.buf.get(self.pos..end) else {
            return Err(self.corrupt("truncated fixed-width record"));
        };
        let mut out = [0u8; N];
        out.copy_from_slice(bytes);
        self.pos = end;
        Ok(out)
    }

    /// Read a length-prefixed byte slice.
    pub fn read_bytes(&mut self) -> Result<&'a [u8]> {
        let start = self.pos;
        let len = self.read_varint()?;
        let end = usize::try_from(len)
            .ok()
            .and_then(|len| self.pos.checked_add(len))
            .filter(|&end| end <= self.buf.len());
        let Some(end) = end else {
            self.pos = start;
            return Err(self.corrupt("length prefix past end of input"));
        };
        let bytes = &self.buf[self.pos..end];
        self.pos = end;
        Ok(bytes)
    }
}

/// A value an enum store can hold and persist.
///
/// Encodings need not preserve order; the store checks ordering on the decoded
/// values.
pub trait EnumValue: Ord + Clone + Send + Sync + Sized {
    fn encode(&self, buf: &mut Vec<u8>);

    /// Bytes [`encode`](Self::encode) appends.
    fn encoded_len(&self) -> usize;

    fn decode(decoder: &mut Decoder<'_>) -> Result<Self>;
}

macro_rules! fixed_width_enum_value {
    ($($ty:ty),*) => {$(
        impl EnumValue for $ty {
            fn encode(&self, buf: &mut Vec<u8>) {
                buf.extend_from_slice(&self.to_le_bytes());
            }

            fn encoded_len(&self) -> usize {
                std::mem::size_of::<$ty>()
            }

            fn decode(decoder: &mut Decoder<'_>) -> Result<Self> {
                decoder.read_fixed().map(<$ty>::from_le_bytes)
            }
        }
    )*};
}

fixed_width_enum_value!(i8, i16, i32, i64, u8, u16, u32, u64);

impl EnumValue for String {
    fn encode(&self, buf: &mut Vec<u8>) {
        encode_bytes(self.as_bytes(), buf);
    }

    fn encoded_len(&self) -> usize {
        varint_size(self.len() as u64) + self.len()
    }

    fn decode(decoder: &mut Decoder<'_>) -> Result<Self> {
        let start = decoder.position();
        let bytes = decoder.read_bytes()?;
        match std::str::from_utf8(bytes) {
            Ok(s) => Ok(s.to_owned()),
            Err(_) => Err(StoreError::Corrupt {
                offset: start,
                reason: "string is not valid utf-8",
            }),
        }
    }
}

impl EnumValue for Vec<u8> {
    fn encode(&self, buf: &mut Vec<u8>) {
        encode_bytes(self, buf);
    }

    fn encoded_len(&self) -> usize {
        varint_size(self.len() as u64) + self.len()
    }

    fn decode(decoder: &mut Decoder<'_>) -> Result<Self> {
        decoder.read_bytes().map(<[u8]>::to_vec)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_varint_roundtrip() {
        let test_values = [0, 1, 127, 128, 16383, 16384, u64::MAX];

        for &value in &test_values {
            let mut buf = [0u8; MAX_VARINT_LEN];
            let size = encode_varint(value, &mut buf);
            let mut decoder = Decoder::new(&buf[..size]);
            assert_eq!(decoder.read_varint().unwrap(), value);
            assert!(decoder.is_empty());
            assert_eq!(size, varint_size(value));
        }
    }

    #[test]
    fn test_truncated_varint() {
        let mut decoder = Decoder::new(&[0x80, 0x80]);
        assert_eq!(
            decoder.read_varint(),
            Err(StoreError::Corrupt {
                offset: 0,
                reason: "truncated varint"
            })
        );
        assert_eq!(decoder.position(), 0, "failed reads consume nothing");
    }

    #[test]
    fn test_overlong_varint() {
        let buf = [0xFFu8; 11];
        assert!(Decoder::new(&buf).read_varint().is_err());
    }

    #[test]
    fn test_bytes_past_end() {
        let mut buf = Vec::new();
        encode_bytes(b"hello world", &mut buf);
        buf.truncate(5);
        let err = Decoder::new(&buf).read_bytes().unwrap_err();
        assert!(matches!(err, StoreError::Corrupt { offset: 0, .. }));
    }

    #[test]
    fn test_string_records() {
        let mut buf = Vec::new();
        "abc".to_string().encode(&mut buf);
        String::new().encode(&mut buf);
        let mut decoder = Decoder::new(&buf);
        assert_eq!(String::decode(&mut decoder).unwrap(), "abc");
        assert_eq!(String::decode(&mut decoder).unwrap(), "");
        assert!(decoder.is_empty());
    }

    #[test]
    fn test_invalid_utf8() {
        let mut buf = Vec::new();
        encode_bytes(&[0xC3, 0x28], &mut buf);
        let err = String::decode(&mut Decoder::new(&buf)).unwrap_err();
        assert_eq!(
            err,
            StoreError::Corrupt {
                offset: 0,
                reason: "string is not valid utf-8"
            }
        );
    }

    #[test]
    fn test_encoded_len_matches_encoding() {
        for len in [0, 127, 128, 20_000] {
            let value = "x".repeat(len);
            let mut buf = Vec::new();
            value.encode(&mut buf);
            assert_eq!(value.encoded_len(), buf.len(), "string of {len} bytes");

            let bytes = vec![7u8; len];
            buf.clear();
            bytes.encode(&mut buf);
            assert_eq!(bytes.encoded_len(), buf.len());
        }
        let mut buf = Vec::new();
        (-3i16).encode(&mut buf);
        assert_eq!((-3i16).encoded_len(), buf.len());
    }

    #[test]
    fn test_fixed_width_truncated() {
        let mut buf = Vec::new();
        7i64.encode(&mut buf);
        buf.pop();
        let mut decoder = Decoder::new(&buf);
        assert!(matches!(
            i64::decode(&mut decoder),
            Err(StoreError::Corrupt { offset: 0, .. })
        ));
    }
}
