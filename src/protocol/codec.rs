//! Dvalue encoding and decoding.
//!
//! The encoder only produces what a debug client ever sends: integers,
//! numbers, strings, booleans and the structural markers. The richer
//! variants (buffers, objects, pointers, ...) only flow target → client.
//!
//! Decoding never consumes a partial value: if the buffered bytes end in
//! the middle of a dvalue, [`DecodeError::NeedMoreData`] is returned and
//! the caller retries once more bytes have arrived.

use bytes::{BufMut, Bytes, BytesMut};
use thiserror::Error;

use super::dvalue::{tag, Dvalue};

/// Largest integer packed into the tag byte.
const INLINE_INT_MAX: i32 = 0x3f;

/// Largest integer using the two-byte form.
const TWO_BYTE_INT_MAX: i32 = 0x3fff;

/// Longest string packed into the tag byte.
const INLINE_STR_MAX: usize = 0x1f;

/// A value that cannot be written to the wire.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EncodeError {
    /// String longer than a 32-bit length prefix can express.
    #[error("cannot convert to dvalue, invalid string length: {0}")]
    StringTooLong(usize),

    /// Variant the client never sends.
    #[error("value cannot be converted to dvalue: {0}")]
    Unsupported(&'static str),
}

/// Why a decode attempt did not produce a value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecodeError {
    /// The buffer ends inside a dvalue. Nothing was consumed.
    NeedMoreData,
    /// The leading byte is not a known tag. Fatal for the stream.
    InvalidTag(u8),
}

/// Encode a single dvalue.
///
/// # Example
///
/// ```
/// use dvalue_debugger::protocol::{encode, Dvalue};
///
/// assert_eq!(&encode(&Dvalue::Int(5)).unwrap()[..], &[0x85]);
/// assert_eq!(&encode(&Dvalue::str("ab")).unwrap()[..], &[0x62, b'a', b'b']);
/// ```
pub fn encode(value: &Dvalue) -> Result<Bytes, EncodeError> {
    let mut buf = BytesMut::with_capacity(16);
    encode_into(value, &mut buf)?;
    Ok(buf.freeze())
}

/// Encode a single dvalue, appending to `buf`.
///
/// On error nothing is appended.
pub fn encode_into(value: &Dvalue, buf: &mut BytesMut) -> Result<(), EncodeError> {
    match value {
        Dvalue::Eom => buf.put_u8(tag::EOM),
        Dvalue::Req => buf.put_u8(tag::REQ),
        Dvalue::Rep => buf.put_u8(tag::REP),
        Dvalue::Err => buf.put_u8(tag::ERR),
        Dvalue::Nfy => buf.put_u8(tag::NFY),
        Dvalue::Bool(true) => buf.put_u8(tag::TRUE),
        Dvalue::Bool(false) => buf.put_u8(tag::FALSE),
        Dvalue::Int(v) => encode_int(*v, buf),
        Dvalue::Number(v) => encode_number(*v, buf),
        Dvalue::Str(bytes) => encode_str(bytes, buf)?,
        Dvalue::Buffer(_) => return Err(EncodeError::Unsupported("buffer")),
        Dvalue::Unused => return Err(EncodeError::Unsupported("unused")),
        Dvalue::Undefined => return Err(EncodeError::Unsupported("undefined")),
        Dvalue::Null => return Err(EncodeError::Unsupported("null")),
        Dvalue::Object { .. } => return Err(EncodeError::Unsupported("object")),
        Dvalue::Pointer { .. } => return Err(EncodeError::Unsupported("pointer")),
        Dvalue::Lightfunc { .. } => return Err(EncodeError::Unsupported("lightfunc")),
        Dvalue::Heapptr { .. } => return Err(EncodeError::Unsupported("heapptr")),
    }
    Ok(())
}

fn encode_int(v: i32, buf: &mut BytesMut) {
    if (0..=INLINE_INT_MAX).contains(&v) {
        buf.put_u8(tag::INT_INLINE + v as u8);
    } else if (0..=TWO_BYTE_INT_MAX).contains(&v) {
        buf.put_u8(tag::INT_TWO_BYTE + (v >> 8) as u8);
        buf.put_u8((v & 0xff) as u8);
    } else {
        buf.put_u8(tag::INT32);
        buf.put_i32(v);
    }
}

fn encode_number(v: f64, buf: &mut BytesMut) {
    let whole = v.fract() == 0.0;
    let negative_zero = v == 0.0 && v.is_sign_negative();
    let in_range = v >= f64::from(i32::MIN) && v <= f64::from(i32::MAX);

    if whole && !negative_zero && in_range {
        encode_int(v as i32, buf);
    } else {
        buf.put_u8(tag::NUMBER);
        buf.put_f64(v);
    }
}

fn encode_str(bytes: &[u8], buf: &mut BytesMut) -> Result<(), EncodeError> {
    let len = bytes.len();
    if len <= INLINE_STR_MAX {
        buf.put_u8(tag::STR_INLINE + len as u8);
    } else if len <= u16::MAX as usize {
        buf.put_u8(tag::STR16);
        buf.put_u16(len as u16);
    } else if len <= u32::MAX as usize {
        buf.put_u8(tag::STR32);
        buf.put_u32(len as u32);
    } else {
        return Err(EncodeError::StringTooLong(len));
    }
    buf.put_slice(bytes);
    Ok(())
}

/// Decode one dvalue from the front of `buf`.
///
/// Returns the value and the number of bytes it occupied.
///
/// # Example
///
/// ```
/// use dvalue_debugger::protocol::{decode, DecodeError, Dvalue};
///
/// assert_eq!(decode(&[0xc1, 0x00]), Ok((Dvalue::Int(256), 2)));
/// assert_eq!(decode(&[0xc1]), Err(DecodeError::NeedMoreData));
/// ```
pub fn decode(buf: &[u8]) -> Result<(Dvalue, usize), DecodeError> {
    let Some(&x) = buf.first() else {
        return Err(DecodeError::NeedMoreData);
    };

    if x >= tag::INT_TWO_BYTE {
        let b = need(buf, 2)?;
        let v = (i32::from(x - tag::INT_TWO_BYTE) << 8) + i32::from(b[1]);
        return Ok((Dvalue::Int(v), 2));
    }
    if x >= tag::INT_INLINE {
        return Ok((Dvalue::Int(i32::from(x - tag::INT_INLINE)), 1));
    }
    if x >= tag::STR_INLINE {
        let len = usize::from(x - tag::STR_INLINE);
        let b = need(buf, 1 + len)?;
        return Ok((Dvalue::Str(Bytes::copy_from_slice(&b[1..])), 1 + len));
    }

    match x {
        tag::EOM => Ok((Dvalue::Eom, 1)),
        tag::REQ => Ok((Dvalue::Req, 1)),
        tag::REP => Ok((Dvalue::Rep, 1)),
        tag::ERR => Ok((Dvalue::Err, 1)),
        tag::NFY => Ok((Dvalue::Nfy, 1)),
        tag::INT32 => {
            let b = need(buf, 5)?;
            let v = i32::from_be_bytes([b[1], b[2], b[3], b[4]]);
            Ok((Dvalue::Int(v), 5))
        }
        tag::STR32 | tag::BUF32 => {
            let b = need(buf, 5)?;
            let len = u32::from_be_bytes([b[1], b[2], b[3], b[4]]) as usize;
            let data = Bytes::copy_from_slice(&need(buf, 5 + len)?[5..]);
            let value = if x == tag::STR32 {
                Dvalue::Str(data)
            } else {
                Dvalue::Buffer(data)
            };
            Ok((value, 5 + len))
        }
        tag::STR16 | tag::BUF16 => {
            let b = need(buf, 3)?;
            let len = usize::from(u16::from_be_bytes([b[1], b[2]]));
            let data = Bytes::copy_from_slice(&need(buf, 3 + len)?[3..]);
            let value = if x == tag::STR16 {
                Dvalue::Str(data)
            } else {
                Dvalue::Buffer(data)
            };
            Ok((value, 3 + len))
        }
        tag::UNUSED => Ok((Dvalue::Unused, 1)),
        tag::UNDEFINED => Ok((Dvalue::Undefined, 1)),
        tag::NULL => Ok((Dvalue::Null, 1)),
        tag::TRUE => Ok((Dvalue::Bool(true), 1)),
        tag::FALSE => Ok((Dvalue::Bool(false), 1)),
        tag::NUMBER => {
            let b = need(buf, 9)?;
            let mut raw = [0u8; 8];
            raw.copy_from_slice(&b[1..9]);
            Ok((Dvalue::Number(f64::from_be_bytes(raw)), 9))
        }
        tag::OBJECT => {
            let b = need(buf, 3)?;
            let (class, len) = (b[1], usize::from(b[2]));
            let ptr = Bytes::copy_from_slice(&need(buf, 3 + len)?[3..]);
            Ok((Dvalue::Object { class, ptr }, 3 + len))
        }
        tag::POINTER | tag::HEAPPTR => {
            let b = need(buf, 2)?;
            let len = usize::from(b[1]);
            let ptr = Bytes::copy_from_slice(&need(buf, 2 + len)?[2..]);
            let value = if x == tag::POINTER {
                Dvalue::Pointer { ptr }
            } else {
                Dvalue::Heapptr { ptr }
            };
            Ok((value, 2 + len))
        }
        tag::LIGHTFUNC => {
            let b = need(buf, 4)?;
            let flags = u16::from_be_bytes([b[1], b[2]]);
            let len = usize::from(b[3]);
            let ptr = Bytes::copy_from_slice(&need(buf, 4 + len)?[4..]);
            Ok((Dvalue::Lightfunc { flags, ptr }, 4 + len))
        }
        other => Err(DecodeError::InvalidTag(other)),
    }
}

/// The first `n` bytes of `buf`, or `NeedMoreData`.
#[inline]
fn need(buf: &[u8], n: usize) -> Result<&[u8], DecodeError> {
    buf.get(..n).ok_or(DecodeError::NeedMoreData)
}
