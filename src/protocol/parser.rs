//! Incremental parser for the debug byte stream.
//!
//! Uses `bytes::BytesMut` to accumulate input that arrives in arbitrary
//! chunks. Implements a state machine:
//! - `AwaitingVersionLine`: buffer until the `\n` ending the version line
//! - `Decoding`: decode dvalues, group them into messages at each EOM
//! - `Closed`: all further input is ignored
//!
//! The same parser type is used for the outbound direction: it is fed a
//! copy of every byte written to the target, constructed with a fixed
//! version so it skips the handshake, and only serves statistics and dumps.
//!
//! # Example
//!
//! ```
//! use dvalue_debugger::protocol::{ParserEvent, StreamParser};
//!
//! let mut parser = StreamParser::new();
//! let events = parser.push(b"1 10099 v1.0.0 engine\n\x04\x82\x63abc\x00").unwrap();
//! assert!(matches!(events[0], ParserEvent::Handshake(ref v) if v.version == Some(1)));
//! assert!(matches!(events[1], ParserEvent::Message(_)));
//! ```

use std::fs::OpenOptions;
use std::io::Write;
use std::path::PathBuf;
use std::time::Duration;

use bytes::{Buf, BytesMut};
use serde::Serialize;

use super::codec::{decode, DecodeError};
use super::dvalue::Dvalue;
use super::message::Message;
use crate::error::{DebuggerError, Result};

/// Longest version line accepted before giving up on the peer.
pub const MAX_VERSION_LINE: usize = 1024;

/// Parsed version identification line.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct VersionInfo {
    /// Protocol version number, `None` if the first word is not a number.
    pub version: Option<u32>,
    /// Everything after the first space.
    pub identification: String,
}

impl VersionInfo {
    /// Parse the text of a version line (without the newline).
    pub fn parse(line: &str) -> Self {
        let (number, rest) = line.split_once(' ').unwrap_or((line, ""));
        Self {
            version: number.trim().parse().ok(),
            identification: rest.to_string(),
        }
    }
}

/// Output of the parser for one input chunk.
#[derive(Debug, Clone, PartialEq)]
pub enum ParserEvent {
    /// The version line was received.
    Handshake(VersionInfo),
    /// A complete message was received.
    Message(Message),
}

/// Traffic counters for one direction.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize)]
pub struct StreamStats {
    /// Total bytes seen.
    pub bytes: u64,
    /// Total dvalues decoded.
    pub dvalues: u64,
    /// Total messages completed.
    pub messages: u64,
    /// Throughput over the last sampling interval.
    pub bytes_per_sec: f64,
}

/// Optional file sinks for raw and pretty dumps.
#[derive(Debug, Clone, Default)]
pub struct DumpSink {
    raw: Option<PathBuf>,
    pretty: Option<PathBuf>,
    prefix: &'static str,
}

impl DumpSink {
    /// Dump raw bytes and/or one pretty line per message, prefixing pretty lines.
    pub fn new(raw: Option<PathBuf>, pretty: Option<PathBuf>, prefix: &'static str) -> Self {
        Self {
            raw,
            pretty,
            prefix,
        }
    }

    fn raw(&self, data: &[u8]) {
        if let Some(path) = &self.raw {
            append(path, data);
        }
    }

    fn message(&self, msg: &Message) {
        if let Some(path) = &self.pretty {
            let line = format!("{}{}\n", self.prefix, msg);
            append(path, line.as_bytes());
        }
    }
}

fn append(path: &PathBuf, data: &[u8]) {
    let result = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .and_then(|mut f| f.write_all(data));
    if let Err(e) = result {
        tracing::warn!("Failed to write dump file {}: {}", path.display(), e);
    }
}

/// State machine for stream parsing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    /// Waiting for the `\n` that ends the version line.
    AwaitingVersionLine,
    /// Decoding dvalues.
    Decoding,
    /// Closed, input is dropped.
    Closed,
}

/// Incremental dvalue stream parser.
pub struct StreamParser {
    /// Bytes not yet consumed.
    buffer: BytesMut,
    /// Current parsing state.
    state: State,
    /// Values of the message being accumulated.
    current: Vec<Dvalue>,
    /// Counters.
    stats: StreamStats,
    /// Byte count at the previous stats sample.
    prev_bytes: u64,
    /// Dump destinations.
    dump: DumpSink,
}

impl StreamParser {
    /// Create a parser that expects a version line first.
    pub fn new() -> Self {
        Self::build(State::AwaitingVersionLine, DumpSink::default())
    }

    /// Create a parser that expects a version line first, with dump sinks.
    pub fn with_dump(dump: DumpSink) -> Self {
        Self::build(State::AwaitingVersionLine, dump)
    }

    /// Create a parser for a stream without a version line, such as the
    /// client's own outbound traffic. Decoding starts immediately.
    pub fn without_handshake(dump: DumpSink) -> Self {
        Self::build(State::Decoding, dump)
    }

    fn build(state: State, dump: DumpSink) -> Self {
        Self {
            buffer: BytesMut::with_capacity(16 * 1024),
            state,
            current: Vec::new(),
            stats: StreamStats::default(),
            prev_bytes: 0,
            dump,
        }
    }

    /// Push a chunk and extract every handshake and complete message in it.
    ///
    /// Partial dvalues stay buffered for the next push.
    ///
    /// # Errors
    ///
    /// Returns a parse error for an oversized version line or an unknown
    /// tag byte. The parser is closed afterwards.
    pub fn push(&mut self, data: &[u8]) -> Result<Vec<ParserEvent>> {
        if self.state == State::Closed {
            tracing::debug!(
                "Ignoring incoming data from closed input stream, len {}",
                data.len()
            );
            return Ok(Vec::new());
        }

        self.stats.bytes += data.len() as u64;
        self.dump.raw(data);
        self.buffer.extend_from_slice(data);

        let mut events = Vec::new();

        if self.state == State::AwaitingVersionLine {
            match self.try_version_line()? {
                Some(info) => events.push(ParserEvent::Handshake(info)),
                None => return Ok(events),
            }
        }

        while let Some(msg) = self.try_extract_message()? {
            events.push(ParserEvent::Message(msg));
        }

        Ok(events)
    }

    /// Look for the version line in the buffer.
    fn try_version_line(&mut self) -> Result<Option<VersionInfo>> {
        let Some(pos) = self.buffer.iter().position(|&b| b == b'\n') else {
            if self.buffer.len() > MAX_VERSION_LINE {
                self.close();
                return Err(DebuggerError::Parse(
                    "version identification too long".to_string(),
                ));
            }
            return Ok(None);
        };

        let line = self.buffer.split_to(pos);
        self.buffer.advance(1);
        self.state = State::Decoding;

        Ok(Some(VersionInfo::parse(&String::from_utf8_lossy(&line))))
    }

    /// Decode dvalues until a message completes or input runs out.
    fn try_extract_message(&mut self) -> Result<Option<Message>> {
        loop {
            let (value, used) = match decode(&self.buffer) {
                Ok(decoded) => decoded,
                Err(DecodeError::NeedMoreData) => return Ok(None),
                Err(DecodeError::InvalidTag(tag)) => {
                    self.close();
                    return Err(DebuggerError::Parse(format!(
                        "invalid dvalue tag 0x{:02x}",
                        tag
                    )));
                }
            };
            self.buffer.advance(used);
            self.stats.dvalues += 1;

            if value != Dvalue::Eom {
                self.current.push(value);
                continue;
            }

            self.stats.messages += 1;
            let msg = Message::new(std::mem::take(&mut self.current));
            self.dump.message(&msg);
            return Ok(Some(msg));
        }
    }

    /// Close the parser.
    ///
    /// Returns `true` only for the call that actually closed it.
    pub fn close(&mut self) -> bool {
        if self.state == State::Closed {
            return false;
        }
        self.state = State::Closed;
        self.buffer.clear();
        self.current.clear();
        true
    }

    /// Check if the parser has been closed.
    #[inline]
    pub fn is_closed(&self) -> bool {
        self.state == State::Closed
    }

    /// Check if the version line has been consumed (or was never expected).
    #[inline]
    pub fn is_handshook(&self) -> bool {
        self.state == State::Decoding
    }

    /// Current counters.
    #[inline]
    pub fn stats(&self) -> StreamStats {
        self.stats
    }

    /// Recompute throughput over `interval` and return the counters.
    pub fn sample_stats(&mut self, interval: Duration) -> StreamStats {
        let secs = interval.as_secs_f64();
        if secs > 0.0 {
            self.stats.bytes_per_sec = (self.stats.bytes - self.prev_bytes) as f64 / secs;
        }
        self.prev_bytes = self.stats.bytes;
        self.stats
    }

    /// Number of buffered, not yet decoded bytes.
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    /// Get the current state for debugging.
    #[cfg(test)]
    fn state_name(&self) -> &'static str {
        match self.state {
            State::AwaitingVersionLine => "AwaitingVersionLine",
            State::Decoding => "Decoding",
            State::Closed => "Closed",
        }
    }
}

impl Default for StreamParser {
    fn default() -> Self {
        Self::new()
    }
}
