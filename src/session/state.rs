//! Derived session state, as published to consumers.

use std::collections::VecDeque;

use serde::Serialize;

use crate::protocol::StreamStats;

/// Execution state of the target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecState {
    /// No debug session.
    #[default]
    Detached,
    /// Attached and running.
    Running,
    /// Attached and paused.
    Paused,
}

/// Execution status, as reported by Status notifications.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize)]
pub struct ExecStatus {
    /// Whether a debug session is active.
    pub attached: bool,
    pub state: ExecState,
    pub file_name: String,
    pub func_name: String,
    pub line: u32,
    pub pc: u32,
}

impl ExecStatus {
    /// Status right after a successful handshake: running, no location.
    pub fn attached() -> Self {
        Self {
            attached: true,
            state: ExecState::Running,
            ..Self::default()
        }
    }
}

/// A breakpoint as listed by the target.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Breakpoint {
    pub file_name: String,
    pub line: u32,
}

/// One call stack entry, innermost first.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CallFrame {
    pub file_name: String,
    pub func_name: String,
    pub line: u32,
    pub pc: u32,
}

/// A local variable with its display value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Local {
    pub key: String,
    /// Clipped UI form of the value.
    pub value: String,
}

/// Byte order of the target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Endianness {
    Little,
    Mixed,
    Big,
    #[default]
    Unknown,
}

impl Endianness {
    /// Map the BasicInfo wire code.
    pub fn from_code(code: Option<i64>) -> Self {
        match code {
            Some(1) => Endianness::Little,
            Some(2) => Endianness::Mixed,
            Some(3) => Endianness::Big,
            _ => Endianness::Unknown,
        }
    }
}

/// Target identification from BasicInfo.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize)]
pub struct BasicInfo {
    /// Engine version number, e.g. 10500 for 1.5.0.
    pub version: u32,
    pub git_describe: String,
    pub target_info: String,
    pub endianness: Endianness,
}

/// Traffic counters for both directions.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize)]
pub struct DebugStats {
    pub rx_bytes: u64,
    pub rx_dvalues: u64,
    pub rx_messages: u64,
    pub rx_bytes_per_sec: f64,
    pub tx_bytes: u64,
    pub tx_dvalues: u64,
    pub tx_messages: u64,
    pub tx_bytes_per_sec: f64,
}

impl DebugStats {
    /// Combine per-direction parser counters.
    pub fn from_streams(rx: StreamStats, tx: StreamStats) -> Self {
        Self {
            rx_bytes: rx.bytes,
            rx_dvalues: rx.dvalues,
            rx_messages: rx.messages,
            rx_bytes_per_sec: rx.bytes_per_sec,
            tx_bytes: tx.bytes,
            tx_dvalues: tx.dvalues,
            tx_messages: tx.messages,
            tx_bytes_per_sec: tx.bytes_per_sec,
        }
    }
}

/// Origin of an output line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum LogKind {
    /// `print()` in the target.
    Print,
    /// `alert()` in the target.
    Alert,
    /// Target logger output.
    Log,
    /// Message from the debugger itself.
    DebuggerInfo,
}

/// One line of output.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LogLine {
    pub kind: LogKind,
    /// Logger level, for `Log` lines.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub level: Option<i64>,
    pub message: String,
}

impl LogLine {
    /// A debugger info line.
    pub fn info(message: impl Into<String>) -> Self {
        Self {
            kind: LogKind::DebuggerInfo,
            level: None,
            message: message.into(),
        }
    }
}

/// Everything the session knows, in one value.
#[derive(Debug, Clone, PartialEq, Default, Serialize)]
pub struct SessionState {
    /// Transport connected.
    pub attached: bool,
    /// Version line received and accepted.
    pub handshook: bool,
    /// Version number from the last handshake.
    pub protocol_version: Option<u32>,
    /// Free-form text from the last handshake.
    pub version_identification: Option<String>,
    pub exec_status: ExecStatus,
    pub breakpoints: Vec<Breakpoint>,
    pub callstack: Vec<CallFrame>,
    pub locals: Vec<Local>,
    pub basic_info: Option<BasicInfo>,
    pub stats: DebugStats,
    /// Recent output lines, oldest first.
    pub output: VecDeque<LogLine>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_endianness_codes() {
        assert_eq!(Endianness::from_code(Some(1)), Endianness::Little);
        assert_eq!(Endianness::from_code(Some(2)), Endianness::Mixed);
        assert_eq!(Endianness::from_code(Some(3)), Endianness::Big);
        assert_eq!(Endianness::from_code(Some(9)), Endianness::Unknown);
        assert_eq!(Endianness::from_code(None), Endianness::Unknown);
    }

    #[test]
    fn test_exec_status_serialization() {
        let status = ExecStatus {
            attached: true,
            state: ExecState::Paused,
            file_name: "app.js".to_string(),
            func_name: "main".to_string(),
            line: 12,
            pc: 3,
        };
        let json = serde_json::to_value(&status).unwrap();
        assert_eq!(json["state"], "paused");
        assert_eq!(json["file_name"], "app.js");
        assert_eq!(json["line"], 12);
    }

    #[test]
    fn test_log_line_serialization() {
        let json = serde_json::to_value(LogLine::info("Debug transport connected")).unwrap();
        assert_eq!(json["kind"], "debugger-info");
        assert!(json.get("level").is_none());
    }
}
