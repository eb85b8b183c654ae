//! Messages: dvalue sequences framed by a leading marker and a trailing EOM.
//!
//! A [`Message`] holds the leading marker and everything after it, but not
//! the closing EOM: the parser strips it and the encoder appends it.
//!
//! # Example
//!
//! ```
//! use dvalue_debugger::protocol::{command, Dvalue, Message, MessageKind};
//!
//! let msg = Message::request(command::GET_VAR).with("length");
//! assert_eq!(msg.kind(), Some(MessageKind::Request));
//! assert_eq!(msg.command(), Some(command::GET_VAR));
//! assert_eq!(msg.to_string(), r#"REQ 26 "length""#);
//! ```

use std::fmt;

use bytes::{Bytes, BytesMut};

use super::codec::{encode_into, EncodeError};
use super::dvalue::Dvalue;

/// Command numbers.
///
/// Notifications are initiated by the target, requests by the client.
/// The numbers do not overlap so one name table covers both directions.
pub mod command {
    /// Execution status notification.
    pub const STATUS: i32 = 0x01;
    /// `print()` output notification.
    pub const PRINT: i32 = 0x02;
    /// `alert()` output notification.
    pub const ALERT: i32 = 0x03;
    /// Logger output notification.
    pub const LOG: i32 = 0x04;
    /// Garbage collection notification (named for dumps only).
    pub const GC: i32 = 0x05;
    /// Target version information.
    pub const BASIC_INFO: i32 = 0x10;
    /// Ask the target to send a status notification.
    pub const TRIGGER_STATUS: i32 = 0x11;
    /// Pause execution.
    pub const PAUSE: i32 = 0x12;
    /// Resume execution.
    pub const RESUME: i32 = 0x13;
    /// Step into.
    pub const STEP_INTO: i32 = 0x14;
    /// Step over.
    pub const STEP_OVER: i32 = 0x15;
    /// Step out.
    pub const STEP_OUT: i32 = 0x16;
    /// List breakpoints.
    pub const LIST_BREAK: i32 = 0x17;
    /// Add a breakpoint.
    pub const ADD_BREAK: i32 = 0x18;
    /// Delete a breakpoint by index.
    pub const DEL_BREAK: i32 = 0x19;
    /// Read a variable.
    pub const GET_VAR: i32 = 0x1a;
    /// Write a variable.
    pub const PUT_VAR: i32 = 0x1b;
    /// Read the call stack.
    pub const GET_CALL_STACK: i32 = 0x1c;
    /// Read local variables of the active frame.
    pub const GET_LOCALS: i32 = 0x1d;
    /// Evaluate an expression.
    pub const EVAL: i32 = 0x1e;
    /// Detach the debugger.
    pub const DETACH: i32 = 0x1f;
    /// Dump the whole heap.
    pub const DUMP_HEAP: i32 = 0x20;

    /// Name of a command, for logs and dumps.
    pub fn name(cmd: i32) -> Option<&'static str> {
        Some(match cmd {
            STATUS => "Status",
            PRINT => "Print",
            ALERT => "Alert",
            LOG => "Log",
            GC => "Gc",
            BASIC_INFO => "BasicInfo",
            TRIGGER_STATUS => "TriggerStatus",
            PAUSE => "Pause",
            RESUME => "Resume",
            STEP_INTO => "StepInto",
            STEP_OVER => "StepOver",
            STEP_OUT => "StepOut",
            LIST_BREAK => "ListBreak",
            ADD_BREAK => "AddBreak",
            DEL_BREAK => "DelBreak",
            GET_VAR => "GetVar",
            PUT_VAR => "PutVar",
            GET_CALL_STACK => "GetCallStack",
            GET_LOCALS => "GetLocals",
            EVAL => "Eval",
            DETACH => "Detach",
            DUMP_HEAP => "DumpHeap",
            _ => return None,
        })
    }
}

/// Error codes carried by ERR messages.
pub mod error_code {
    /// Unknown error.
    pub const UNKNOWN: i32 = 0x00;
    /// Command not supported by the target.
    pub const UNSUPPORTED: i32 = 0x01;
    /// Resource limit reached (e.g. too many breakpoints).
    pub const TOO_MANY: i32 = 0x02;
    /// Referenced item not found.
    pub const NOT_FOUND: i32 = 0x03;
}

/// The role of a message, from its leading marker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageKind {
    /// REQ
    Request,
    /// REP
    Reply,
    /// ERR
    Error,
    /// NFY
    Notify,
}

/// One protocol message, without its trailing EOM.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Message {
    values: Vec<Dvalue>,
}

impl Message {
    /// Wrap already decoded values.
    pub fn new(values: Vec<Dvalue>) -> Self {
        Self { values }
    }

    /// Start a request for `cmd`.
    pub fn request(cmd: i32) -> Self {
        Self {
            values: vec![Dvalue::Req, Dvalue::Int(cmd)],
        }
    }

    /// Append a value (builder style).
    pub fn with(mut self, value: impl Into<Dvalue>) -> Self {
        self.values.push(value.into());
        self
    }

    /// Append a value.
    pub fn push(&mut self, value: Dvalue) {
        self.values.push(value);
    }

    /// Role of the message, `None` if it does not start with a marker.
    pub fn kind(&self) -> Option<MessageKind> {
        match self.values.first()? {
            Dvalue::Req => Some(MessageKind::Request),
            Dvalue::Rep => Some(MessageKind::Reply),
            Dvalue::Err => Some(MessageKind::Error),
            Dvalue::Nfy => Some(MessageKind::Notify),
            _ => None,
        }
    }

    /// Command number at index 1 (requests and notifications).
    pub fn command(&self) -> Option<i32> {
        self.values.get(1)?.as_i64().and_then(|v| i32::try_from(v).ok())
    }

    /// Value at `index`.
    #[inline]
    pub fn get(&self, index: usize) -> Option<&Dvalue> {
        self.values.get(index)
    }

    /// Integer at `index`.
    pub fn int(&self, index: usize) -> Option<i64> {
        self.get(index)?.as_i64()
    }

    /// String at `index`, decoded lossily.
    pub fn string(&self, index: usize) -> Option<String> {
        self.get(index)?.to_string_lossy()
    }

    /// All values.
    #[inline]
    pub fn values(&self) -> &[Dvalue] {
        &self.values
    }

    /// Number of values (excluding the EOM).
    #[inline]
    pub fn len(&self) -> usize {
        self.values.len()
    }

    /// Check if the message has no values.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Values after the marker (and command, for requests and notifications).
    pub fn payload(&self) -> &[Dvalue] {
        let skip = match self.kind() {
            Some(MessageKind::Request) | Some(MessageKind::Notify) => 2,
            _ => 1,
        };
        self.values.get(skip..).unwrap_or(&[])
    }

    /// Encode every value followed by EOM.
    ///
    /// Either the whole message is encoded or an error is returned; a
    /// partially encoded message is never handed out.
    pub fn encode(&self) -> Result<Bytes, EncodeError> {
        let mut buf = BytesMut::with_capacity(16 * (self.values.len() + 1));
        for value in &self.values {
            encode_into(value, &mut buf)?;
        }
        encode_into(&Dvalue::Eom, &mut buf)?;
        Ok(buf.freeze())
    }

    /// Human readable command name, or the number.
    pub fn command_name(&self) -> String {
        describe_command(self.command())
    }
}

/// Command name for logs, falling back to the raw number.
pub fn describe_command(cmd: Option<i32>) -> String {
    match cmd {
        Some(c) => command::name(c)
            .map(str::to_string)
            .unwrap_or_else(|| c.to_string()),
        None => "?".to_string(),
    }
}

/// One-line dump form: every value's debug form separated by spaces.
impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, value) in self.values.iter().enumerate() {
            if i > 0 {
                f.write_str(" ")?;
            }
            write!(f, "{}", value)?;
        }
        Ok(())
    }
}
