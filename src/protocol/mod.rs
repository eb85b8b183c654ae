//! Protocol module - dvalues, messages and stream parsing.
//!
//! This module implements the debug wire protocol:
//! - dvalue type and tag constants
//! - encode/decode of single dvalues
//! - messages (marker ... EOM) and command numbers
//! - incremental stream parser with version handshake
//! - display formatting for dumps and UIs

mod codec;
mod dvalue;
mod message;
mod parser;
pub mod pretty;

pub use codec::{decode, encode, encode_into, DecodeError, EncodeError};
pub use dvalue::{tag, Dvalue};
pub use message::{command, describe_command, error_code, Message, MessageKind};
pub use parser::{
    DumpSink, ParserEvent, StreamParser, StreamStats, VersionInfo, MAX_VERSION_LINE,
};

pub(crate) use dvalue::hex;
