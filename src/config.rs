//! Debugger configuration.

use std::path::PathBuf;
use std::time::Duration;

use crate::events::RateLimit;
use crate::protocol::DumpSink;

/// Default target host.
pub const DEFAULT_HOST: &str = "127.0.0.1";

/// Default target port.
pub const DEFAULT_PORT: u16 = 9091;

/// The only protocol version this client speaks.
pub const SUPPORTED_PROTOCOL_VERSION: u32 = 1;

/// Default interval between state polls while the target runs.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(500);

/// Default interval between traffic stats samples.
pub const DEFAULT_STATS_INTERVAL: Duration = Duration::from_secs(2);

/// Default time to wait for a Detach reply before disconnecting anyway.
pub const DEFAULT_DETACH_TIMEOUT: Duration = Duration::from_secs(3);

/// Default number of output lines kept.
pub const DEFAULT_SCROLLBACK: usize = 100;

/// Default event channel capacity.
pub const DEFAULT_EVENT_CAPACITY: usize = 256;

/// Default throttle for exec status events.
pub const DEFAULT_EXEC_STATUS_LIMIT: RateLimit = RateLimit::new(50, Duration::from_millis(500));

/// Default throttle for stats events.
pub const DEFAULT_STATS_LIMIT: RateLimit = RateLimit::new(1, Duration::from_secs(2));

/// Default throttle for log line events.
pub const DEFAULT_LOG_LINE_LIMIT: RateLimit = RateLimit::new(10, Duration::from_millis(1000));

/// Files to dump protocol traffic into.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DumpConfig {
    /// Raw bytes read from the target.
    pub read_raw: Option<PathBuf>,
    /// Raw bytes written to the target.
    pub write_raw: Option<PathBuf>,
    /// One line per message in both directions.
    pub pretty: Option<PathBuf>,
}

impl DumpConfig {
    pub(crate) fn input_sink(&self) -> DumpSink {
        DumpSink::new(self.read_raw.clone(), self.pretty.clone(), "Recv: ")
    }

    pub(crate) fn output_sink(&self) -> DumpSink {
        DumpSink::new(self.write_raw.clone(), self.pretty.clone(), "Send: ")
    }
}

/// Configuration for a debugger session.
#[derive(Debug, Clone)]
pub struct DebuggerConfig {
    /// Target host for the default TCP connector.
    pub host: String,
    /// Target port for the default TCP connector.
    pub port: u16,
    /// Protocol version required in the handshake.
    pub protocol_version: u32,
    /// Poll interval while running.
    pub poll_interval: Duration,
    /// Stats sampling interval.
    pub stats_interval: Duration,
    /// Bound on the wait for a Detach reply.
    pub detach_timeout: Duration,
    /// Output lines kept in the session state.
    pub scrollback: usize,
    /// Capacity of the event broadcast channel.
    pub event_capacity: usize,
    pub exec_status_limit: RateLimit,
    pub stats_limit: RateLimit,
    /// Throttle for log line events; held back lines are capped at `scrollback`.
    pub log_line_limit: RateLimit,
    /// Log every message with `tracing::info!`.
    pub log_messages: bool,
    pub dump: DumpConfig,
}

impl Default for DebuggerConfig {
    fn default() -> Self {
        Self {
            host: DEFAULT_HOST.to_string(),
            port: DEFAULT_PORT,
            protocol_version: SUPPORTED_PROTOCOL_VERSION,
            poll_interval: DEFAULT_POLL_INTERVAL,
            stats_interval: DEFAULT_STATS_INTERVAL,
            detach_timeout: DEFAULT_DETACH_TIMEOUT,
            scrollback: DEFAULT_SCROLLBACK,
            event_capacity: DEFAULT_EVENT_CAPACITY,
            exec_status_limit: DEFAULT_EXEC_STATUS_LIMIT,
            stats_limit: DEFAULT_STATS_LIMIT,
            log_line_limit: DEFAULT_LOG_LINE_LIMIT,
            log_messages: false,
            dump: DumpConfig::default(),
        }
    }
}
