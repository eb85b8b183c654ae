//! Human oriented formatting of dvalues.
//!
//! Strings are shown as Unicode when they are strict UTF-8 and as escaped
//! bytes otherwise. Long output is clipped with a trailing `...`.

use std::fmt::Write as _;

use super::dvalue::{hex, Dvalue};

/// Clip length for print/alert/log lines.
pub const UI_MESSAGE_CLIPLEN: usize = 128;

/// Clip length for local variable values.
pub const LOCALS_CLIPLEN: usize = 64;

/// Clip length for eval results.
pub const EVAL_CLIPLEN: usize = 4096;

/// Clip length for GetVar results.
pub const GETVAR_CLIPLEN: usize = 4096;

/// Engine internal class names, indexed by class number.
pub const CLASS_NAMES: [&str; 19] = [
    "unused",
    "Arguments",
    "Array",
    "Boolean",
    "Date",
    "Error",
    "Function",
    "JSON",
    "Math",
    "Number",
    "Object",
    "RegExp",
    "String",
    "global",
    "ObjEnv",
    "DecEnv",
    "Buffer",
    "Pointer",
    "Thread",
];

/// Format a number, keeping infinities, NaN and negative zero readable.
pub fn ui_number(x: f64) -> String {
    if x.is_nan() {
        "NaN".to_string()
    } else if x == f64::INFINITY {
        "Infinity".to_string()
    } else if x == f64::NEG_INFINITY {
        "-Infinity".to_string()
    } else if x == 0.0 && x.is_sign_negative() {
        "-0".to_string()
    } else {
        x.to_string()
    }
}

/// Quoted form of string bytes.
///
/// UTF-8 input becomes a JSON string literal. Anything else becomes
/// `r"..."` with quotes, control bytes and high bytes as `\xNN`.
pub fn ui_string(bytes: &[u8], cliplen: Option<usize>) -> String {
    let out = match std::str::from_utf8(bytes) {
        Ok(s) => serde_json::Value::String(s.to_string()).to_string(),
        Err(_) => {
            let mut out = String::from("r\"");
            for &b in bytes {
                if b == b'"' || b == b'\'' || b < 0x20 || b >= 0x80 {
                    escape_byte(&mut out, b);
                } else {
                    out.push(b as char);
                }
            }
            out.push('"');
            out
        }
    };
    // The closing quote is intentionally lost when clipping.
    clip(out, cliplen)
}

/// Unquoted form of string bytes, for output lines.
pub fn ui_string_unquoted(bytes: &[u8], cliplen: Option<usize>) -> String {
    let out = match std::str::from_utf8(bytes) {
        Ok(s) => s.to_string(),
        Err(_) => {
            let mut out = String::with_capacity(bytes.len());
            for &b in bytes {
                if b < 0x20 || b >= 0x80 {
                    escape_byte(&mut out, b);
                } else {
                    out.push(b as char);
                }
            }
            out
        }
    };
    clip(out, cliplen)
}

/// Ready-to-display form of any dvalue.
pub fn ui_value(value: &Dvalue, cliplen: Option<usize>) -> String {
    match value {
        Dvalue::Eom => "EOM".to_string(),
        Dvalue::Req => "REQ".to_string(),
        Dvalue::Rep => "REP".to_string(),
        Dvalue::Err => "ERR".to_string(),
        Dvalue::Nfy => "NFY".to_string(),
        Dvalue::Undefined => "undefined".to_string(),
        Dvalue::Null => "null".to_string(),
        Dvalue::Bool(b) => b.to_string(),
        Dvalue::Str(bytes) => ui_string(bytes, cliplen),
        Dvalue::Int(v) => v.to_string(),
        Dvalue::Number(v) => ui_number(*v),
        Dvalue::Unused => "unused".to_string(),
        Dvalue::Buffer(bytes) => format!("|{}|", hex(bytes)),
        Dvalue::Object { class, .. } => match CLASS_NAMES.get(usize::from(*class)) {
            Some(name) => format!("[object {}]", name),
            None => format!("[object class {}]", class),
        },
        Dvalue::Pointer { ptr } => format!("<pointer {}>", hex(ptr)),
        Dvalue::Lightfunc { flags, ptr } => format!("<lightfunc 0x{:x} {}>", flags, hex(ptr)),
        Dvalue::Heapptr { ptr } => format!("<heapptr {}>", hex(ptr)),
    }
}

fn escape_byte(out: &mut String, b: u8) {
    let _ = write!(out, "\\x{:02x}", b);
}

fn clip(s: String, cliplen: Option<usize>) -> String {
    match cliplen {
        Some(n) if s.chars().count() > n => {
            let mut clipped: String = s.chars().take(n).collect();
            clipped.push_str("...");
            clipped
        }
        _ => s,
    }
}
