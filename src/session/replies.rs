//! Typed views of reply messages.
//!
//! Replies are flat dvalue arrays after the REP marker. List replies use a
//! fixed stride per entry; heap dumps use a small record grammar.

use serde::Serialize;

use super::state::{BasicInfo, Breakpoint, CallFrame, Endianness, Local};
use crate::error::{DebuggerError, Result};
use crate::protocol::pretty::{ui_value, LOCALS_CLIPLEN};
use crate::protocol::{Dvalue, Message};

/// Heap object type codes.
pub mod htype {
    pub const STRING: i64 = 1;
    pub const OBJECT: i64 = 2;
    pub const BUFFER: i64 = 3;
}

/// Result of GetVar.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct VarResult {
    /// The variable exists in the active scope.
    pub found: bool,
    pub value: Dvalue,
}

/// Result of Eval.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EvalResult {
    /// The evaluation threw; `value` is the thrown value.
    pub error: bool,
    pub value: Dvalue,
}

fn text(value: Option<&Dvalue>) -> String {
    match value {
        Some(v) => v.to_string_lossy().unwrap_or_else(|| ui_value(v, None)),
        None => String::new(),
    }
}

fn number(value: Option<&Dvalue>) -> u32 {
    value.and_then(Dvalue::as_u32).unwrap_or(0)
}

/// ListBreak reply: `(fileName, line)` pairs.
pub fn breakpoints(msg: &Message) -> Vec<Breakpoint> {
    msg.payload()
        .chunks_exact(2)
        .map(|pair| Breakpoint {
            file_name: text(pair.first()),
            line: number(pair.get(1)),
        })
        .collect()
}

/// GetLocals reply: `(key, value)` pairs.
pub fn locals(msg: &Message) -> Vec<Local> {
    msg.payload()
        .chunks_exact(2)
        .map(|pair| Local {
            key: text(pair.first()),
            value: pair
                .get(1)
                .map(|v| ui_value(v, Some(LOCALS_CLIPLEN)))
                .unwrap_or_default(),
        })
        .collect()
}

/// GetCallStack reply: `(fileName, funcName, line, pc)` quads.
pub fn callstack(msg: &Message) -> Vec<CallFrame> {
    msg.payload()
        .chunks_exact(4)
        .map(|quad| CallFrame {
            file_name: text(quad.first()),
            func_name: text(quad.get(1)),
            line: number(quad.get(2)),
            pc: number(quad.get(3)),
        })
        .collect()
}

/// BasicInfo reply: version, git describe, target info, endianness.
pub fn basic_info(msg: &Message) -> BasicInfo {
    BasicInfo {
        version: number(msg.get(1)),
        git_describe: text(msg.get(2)),
        target_info: text(msg.get(3)),
        endianness: Endianness::from_code(msg.int(4)),
    }
}

/// GetVar reply.
pub fn var_result(msg: &Message) -> VarResult {
    VarResult {
        found: msg.int(1) == Some(1),
        value: msg.get(2).cloned().unwrap_or(Dvalue::Undefined),
    }
}

/// Eval reply.
pub fn eval_result(msg: &Message) -> EvalResult {
    EvalResult {
        error: msg.int(1) == Some(1),
        value: msg.get(2).cloned().unwrap_or(Dvalue::Undefined),
    }
}

/// A whole heap dump.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HeapDump {
    pub heap_objects: Vec<HeapObject>,
}

/// One heap allocation.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HeapObject {
    pub ptr: Dvalue,
    pub flags: u32,
    pub refc: i64,
    #[serde(flatten)]
    pub body: HeapBody,
}

/// Type specific part of a heap object.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum HeapBody {
    String {
        blen: i64,
        clen: i64,
        hash: u32,
        data: Dvalue,
    },
    Buffer {
        len: i64,
        alloc: i64,
        data: Dvalue,
    },
    Object {
        class: i64,
        proto: Dvalue,
        esize: i64,
        enext: i64,
        asize: i64,
        hsize: i64,
        props: Vec<HeapProperty>,
        array: Vec<Dvalue>,
    },
}

/// One entry part property of a heap object.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HeapProperty {
    pub flags: i64,
    pub key: Dvalue,
    #[serde(flatten)]
    pub slot: PropertySlot,
}

/// Plain value or accessor pair.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum PropertySlot {
    Value { value: Dvalue },
    Accessor { getter: Dvalue, setter: Dvalue },
}

/// Sequential reader over reply values.
struct Cursor<'a> {
    values: &'a [Dvalue],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn has_more(&self) -> bool {
        self.pos < self.values.len()
    }

    fn value(&mut self) -> Result<Dvalue> {
        let value = self
            .values
            .get(self.pos)
            .cloned()
            .ok_or_else(|| DebuggerError::Protocol("truncated heap dump".to_string()))?;
        self.pos += 1;
        Ok(value)
    }

    fn int(&mut self) -> Result<i64> {
        let value = self.value()?;
        value
            .as_i64()
            .ok_or_else(|| DebuggerError::Protocol(format!("expected integer in heap dump, got {}", value)))
    }

    /// Flags and hashes travel as signed integers; keep the bit pattern.
    fn bits(&mut self) -> Result<u32> {
        let value = self.value()?;
        value
            .as_u32_bits()
            .ok_or_else(|| DebuggerError::Protocol(format!("expected integer in heap dump, got {}", value)))
    }

    /// A count used to size a loop; negative counts are rejected.
    fn count(&mut self) -> Result<usize> {
        let n = self.int()?;
        usize::try_from(n)
            .map_err(|_| DebuggerError::Protocol(format!("invalid count {} in heap dump", n)))
    }
}

/// DumpHeap reply.
///
/// # Errors
///
/// Returns a protocol error for an unknown heap object type or a
/// truncated record. The caller drops the connection in that case.
pub fn heap_dump(msg: &Message) -> Result<HeapDump> {
    let mut cur = Cursor {
        values: msg.payload(),
        pos: 0,
    };
    let mut heap_objects = Vec::new();

    while cur.has_more() {
        let ptr = cur.value()?;
        let kind = cur.int()?;
        let flags = cur.bits()?;
        let refc = cur.int()?;

        let body = match kind {
            htype::STRING => HeapBody::String {
                blen: cur.int()?,
                clen: cur.int()?,
                hash: cur.bits()?,
                data: cur.value()?,
            },
            htype::BUFFER => HeapBody::Buffer {
                len: cur.int()?,
                alloc: cur.int()?,
                data: cur.value()?,
            },
            htype::OBJECT => {
                let class = cur.int()?;
                let proto = cur.value()?;
                let esize = cur.int()?;
                let enext = cur.count()?;
                let asize = cur.count()?;
                let hsize = cur.int()?;

                let mut props = Vec::with_capacity(enext.min(1024));
                for _ in 0..enext {
                    let flags = cur.int()?;
                    let key = cur.value()?;
                    let slot = if cur.int()? == 1 {
                        PropertySlot::Accessor {
                            getter: cur.value()?,
                            setter: cur.value()?,
                        }
                    } else {
                        PropertySlot::Value {
                            value: cur.value()?,
                        }
                    };
                    props.push(HeapProperty { flags, key, slot });
                }

                let mut array = Vec::with_capacity(asize.min(1024));
                for _ in 0..asize {
                    array.push(cur.value()?);
                }

                HeapBody::Object {
                    class,
                    proto,
                    esize,
                    enext: enext as i64,
                    asize: asize as i64,
                    hsize,
                    props,
                    array,
                }
            }
            other => {
                return Err(DebuggerError::Protocol(format!(
                    "invalid heap object type {}",
                    other
                )))
            }
        };

        heap_objects.push(HeapObject {
            ptr,
            flags,
            refc,
            body,
        });
    }

    Ok(HeapDump { heap_objects })
}
