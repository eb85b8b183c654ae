//! The dvalue type and its wire tags.
//!
//! Every dvalue starts with a single tag byte. Small integers and short
//! strings are packed into the tag itself:
//! ```text
//! 0x00..=0x04  EOM REQ REP ERR NFY
//! 0x10         int32, 4 bytes BE
//! 0x11 / 0x12  string, 4 / 2 byte BE length + bytes
//! 0x13 / 0x14  buffer, 4 / 2 byte BE length + bytes
//! 0x15..=0x19  unused undefined null true false
//! 0x1a         IEEE double, 8 bytes BE
//! 0x1b..=0x1e  object pointer lightfunc heapptr
//! 0x60..=0x7f  string, length 0-31 in the tag
//! 0x80..=0xbf  integer 0-63 in the tag
//! 0xc0..=0xff  integer 0-16383, high 6 bits in the tag
//! ```

use std::fmt;

use bytes::Bytes;
use serde::{Serialize, Serializer};
use serde_json::json;

/// Tag byte constants.
pub mod tag {
    /// End of message.
    pub const EOM: u8 = 0x00;
    /// Request marker.
    pub const REQ: u8 = 0x01;
    /// Reply marker.
    pub const REP: u8 = 0x02;
    /// Error marker.
    pub const ERR: u8 = 0x03;
    /// Notification marker.
    pub const NFY: u8 = 0x04;
    /// Signed 32-bit integer.
    pub const INT32: u8 = 0x10;
    /// String with a 32-bit length.
    pub const STR32: u8 = 0x11;
    /// String with a 16-bit length.
    pub const STR16: u8 = 0x12;
    /// Buffer with a 32-bit length.
    pub const BUF32: u8 = 0x13;
    /// Buffer with a 16-bit length.
    pub const BUF16: u8 = 0x14;
    /// Unused (array gap).
    pub const UNUSED: u8 = 0x15;
    /// Undefined.
    pub const UNDEFINED: u8 = 0x16;
    /// Null.
    pub const NULL: u8 = 0x17;
    /// Boolean true.
    pub const TRUE: u8 = 0x18;
    /// Boolean false.
    pub const FALSE: u8 = 0x19;
    /// IEEE double.
    pub const NUMBER: u8 = 0x1a;
    /// Object reference.
    pub const OBJECT: u8 = 0x1b;
    /// Raw pointer.
    pub const POINTER: u8 = 0x1c;
    /// Lightweight function.
    pub const LIGHTFUNC: u8 = 0x1d;
    /// Heap pointer.
    pub const HEAPPTR: u8 = 0x1e;
    /// First inline string tag (length 0).
    pub const STR_INLINE: u8 = 0x60;
    /// First one-byte integer tag (value 0).
    pub const INT_INLINE: u8 = 0x80;
    /// First two-byte integer tag.
    pub const INT_TWO_BYTE: u8 = 0xc0;
}

/// One unit of the debug wire format.
///
/// Strings are opaque byte sequences: the target usually sends UTF-8 (or
/// CESU-8) but internal strings may be arbitrary bytes, so nothing is
/// decoded at this layer.
#[derive(Debug, Clone, PartialEq)]
pub enum Dvalue {
    /// End of message.
    Eom,
    /// Start of a request.
    Req,
    /// Start of a reply.
    Rep,
    /// Start of an error reply.
    Err,
    /// Start of a notification.
    Nfy,
    /// Plain integer (command numbers, line numbers, counts).
    Int(i32),
    /// IEEE double, used for any engine number that is not a plain integer.
    Number(f64),
    /// String bytes.
    Str(Bytes),
    /// Buffer bytes.
    Buffer(Bytes),
    /// Unused array slot.
    Unused,
    /// Undefined.
    Undefined,
    /// Null.
    Null,
    /// Boolean.
    Bool(bool),
    /// Heap object reference with its internal class number.
    Object {
        /// Engine class number.
        class: u8,
        /// Raw heap pointer bytes.
        ptr: Bytes,
    },
    /// Raw pointer.
    Pointer {
        /// Raw pointer bytes.
        ptr: Bytes,
    },
    /// Lightweight function.
    Lightfunc {
        /// Lightfunc flags field.
        flags: u16,
        /// Raw function pointer bytes.
        ptr: Bytes,
    },
    /// Heap pointer.
    Heapptr {
        /// Raw heap pointer bytes.
        ptr: Bytes,
    },
}

impl Dvalue {
    /// Create a string dvalue from anything byte-like.
    pub fn str(value: impl AsRef<[u8]>) -> Self {
        Dvalue::Str(Bytes::copy_from_slice(value.as_ref()))
    }

    /// Check if this is one of the structural markers.
    #[inline]
    pub fn is_marker(&self) -> bool {
        matches!(
            self,
            Dvalue::Eom | Dvalue::Req | Dvalue::Rep | Dvalue::Err | Dvalue::Nfy
        )
    }

    /// Integer view: `Int`, or a `Number` that holds a whole 32-bit value.
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Dvalue::Int(v) => Some(i64::from(*v)),
            Dvalue::Number(v) if v.fract() == 0.0 && v.abs() <= 9_007_199_254_740_992.0 => {
                Some(*v as i64)
            }
            _ => None,
        }
    }

    /// Integer view clamped to the `u32` range, as used for line numbers and pcs.
    pub fn as_u32(&self) -> Option<u32> {
        self.as_i64().and_then(|v| u32::try_from(v).ok())
    }

    /// Integer view reinterpreted as unsigned 32 bits (flags and hashes).
    pub fn as_u32_bits(&self) -> Option<u32> {
        self.as_i64().map(|v| v as u32)
    }

    /// Numeric view of `Int` and `Number`.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Dvalue::Int(v) => Some(f64::from(*v)),
            Dvalue::Number(v) => Some(*v),
            _ => None,
        }
    }

    /// Raw string bytes.
    pub fn as_str_bytes(&self) -> Option<&[u8]> {
        match self {
            Dvalue::Str(b) => Some(b),
            _ => None,
        }
    }

    /// String contents decoded as UTF-8, replacing invalid sequences.
    pub fn to_string_lossy(&self) -> Option<String> {
        self.as_str_bytes()
            .map(|b| String::from_utf8_lossy(b).into_owned())
    }
}

impl From<i32> for Dvalue {
    fn from(v: i32) -> Self {
        Dvalue::Int(v)
    }
}

impl From<u32> for Dvalue {
    fn from(v: u32) -> Self {
        match i32::try_from(v) {
            Ok(v) => Dvalue::Int(v),
            Err(_) => Dvalue::Number(f64::from(v)),
        }
    }
}

impl From<f64> for Dvalue {
    fn from(v: f64) -> Self {
        Dvalue::Number(v)
    }
}

impl From<bool> for Dvalue {
    fn from(v: bool) -> Self {
        Dvalue::Bool(v)
    }
}

impl From<&str> for Dvalue {
    fn from(v: &str) -> Self {
        Dvalue::str(v)
    }
}

impl From<String> for Dvalue {
    fn from(v: String) -> Self {
        Dvalue::Str(Bytes::from(v))
    }
}

/// Lowercase hex rendering of raw bytes.
pub(crate) fn hex(bytes: &[u8]) -> String {
    const NYBBLES: &[u8; 16] = b"0123456789abcdef";
    let mut out = String::with_capacity(bytes.len() * 2);
    for b in bytes {
        out.push(NYBBLES[(b >> 4) as usize] as char);
        out.push(NYBBLES[(b & 0x0f) as usize] as char);
    }
    out
}

/// Map bytes to codepoints U+0000..U+00FF one-to-one.
pub(crate) fn latin1(bytes: &[u8]) -> String {
    bytes.iter().map(|&b| b as char).collect()
}

impl Dvalue {
    /// JSON form used by dumps and serialized state.
    ///
    /// Markers and `undefined` have no JSON equivalent and become tagged
    /// objects.
    pub fn to_json(&self) -> serde_json::Value {
        match self {
            Dvalue::Eom | Dvalue::Req | Dvalue::Rep | Dvalue::Err | Dvalue::Nfy => {
                json!({ "MARKER": marker_name(self) })
            }
            Dvalue::Undefined => json!({ "UNDEFINED": true }),
            Dvalue::Int(v) => json!(v),
            Dvalue::Number(v) => json!({ "NUM": hex(&v.to_be_bytes()), "value": v }),
            Dvalue::Str(b) => json!(latin1(b)),
            Dvalue::Buffer(b) => json!({ "BUF": hex(b) }),
            Dvalue::Unused => json!({ "UNUSED": true }),
            Dvalue::Null => serde_json::Value::Null,
            Dvalue::Bool(v) => json!(v),
            Dvalue::Object { class, ptr } => json!({ "OBJ": hex(ptr), "class": class }),
            Dvalue::Pointer { ptr } => json!({ "PTR": hex(ptr) }),
            Dvalue::Lightfunc { flags, ptr } => json!({ "LFUNC": hex(ptr), "flags": flags }),
            Dvalue::Heapptr { ptr } => json!({ "HEAPPTR": hex(ptr) }),
        }
    }
}

fn marker_name(value: &Dvalue) -> &'static str {
    match value {
        Dvalue::Eom => "EOM",
        Dvalue::Req => "REQ",
        Dvalue::Rep => "REP",
        Dvalue::Err => "ERR",
        Dvalue::Nfy => "NFY",
        _ => "",
    }
}

/// Debug dump form: markers by name, everything else JSON-ish.
impl fmt::Display for Dvalue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_marker() {
            return f.write_str(marker_name(self));
        }
        if matches!(self, Dvalue::Undefined) {
            return f.write_str("undefined");
        }
        write!(f, "{}", self.to_json())
    }
}

impl Serialize for Dvalue {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.to_json().serialize(serializer)
    }
}
