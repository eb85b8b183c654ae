//! Debugger builder, handle and driver loop.
//!
//! The [`DebuggerBuilder`] provides a fluent API for configuring the
//! session. [`DebuggerBuilder::spawn`] starts a driver task that owns the
//! [`Session`] and multiplexes:
//! 1. Commands from [`Debugger`] handles
//! 2. Transport events from the connection task
//! 3. Poll ticks while the target runs
//! 4. Stats sampling ticks
//!
//! # Example
//!
//! ```no_run
//! use dvalue_debugger::{Debugger, DebuggerEvent};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let debugger = Debugger::builder().host("127.0.0.1").port(9091).spawn();
//!     let mut events = debugger.subscribe();
//!
//!     debugger.connect().await?;
//!     while let Ok(event) = events.recv().await {
//!         if event == DebuggerEvent::Attached {
//!             break;
//!         }
//!     }
//!
//!     debugger.toggle_breakpoint("app.js", 12).await?;
//!     let value = debugger.eval("1 + 2").await?;
//!     println!("{}", value.value);
//!
//!     debugger.detach().await?;
//!     Ok(())
//! }
//! ```

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::time::{interval_at, Instant, MissedTickBehavior};

use crate::config::DebuggerConfig;
use crate::error::{DebuggerError, Result};
use crate::events::{DebuggerEvent, EventKind, Publisher, RateLimit, Subscription};
use crate::protocol::pretty::{ui_value, EVAL_CLIPLEN, GETVAR_CLIPLEN};
use crate::protocol::{command, Dvalue, Message};
use crate::session::{
    replies, BreakpointMode, Breakpoint, EvalResult, HeapDump, Session, SessionState, VarResult,
};
use crate::transport::{Connector, TaggedEvent, TcpConnector};

/// Capacity of the command channel between handles and the driver.
pub const DEFAULT_COMMAND_CAPACITY: usize = 64;

/// Work for the driver task.
enum Command {
    Connect,
    Disconnect,
    Request {
        message: Message,
        refresh_locals: bool,
        reply: oneshot::Sender<Result<Message>>,
    },
    ChangeBreakpoint {
        file_name: String,
        line: u32,
        mode: BreakpointMode,
        reply: oneshot::Sender<Result<Vec<Breakpoint>>>,
    },
    DumpHeap(oneshot::Sender<Result<HeapDump>>),
    Snapshot(oneshot::Sender<SessionState>),
}

/// Builder for configuring and spawning a [`Debugger`].
pub struct DebuggerBuilder {
    config: DebuggerConfig,
    connector: Option<Arc<dyn Connector>>,
}

impl DebuggerBuilder {
    /// Create a builder with default configuration.
    pub fn new() -> Self {
        Self {
            config: DebuggerConfig::default(),
            connector: None,
        }
    }

    /// Replace the whole configuration.
    pub fn config(mut self, config: DebuggerConfig) -> Self {
        self.config = config;
        self
    }

    /// Target host for the default TCP connector.
    ///
    /// Default: 127.0.0.1
    pub fn host(mut self, host: impl Into<String>) -> Self {
        self.config.host = host.into();
        self
    }

    /// Target port for the default TCP connector.
    ///
    /// Default: 9091
    pub fn port(mut self, port: u16) -> Self {
        self.config.port = port;
        self
    }

    /// Use a custom transport instead of TCP.
    pub fn connector(mut self, connector: impl Connector + 'static) -> Self {
        self.connector = Some(Arc::new(connector));
        self
    }

    /// Protocol version required in the handshake.
    ///
    /// Default: 1
    pub fn protocol_version(mut self, version: u32) -> Self {
        self.config.protocol_version = version;
        self
    }

    /// Interval between state polls while the target runs.
    ///
    /// Default: 500ms
    pub fn poll_interval(mut self, interval: Duration) -> Self {
        self.config.poll_interval = interval;
        self
    }

    /// Interval between traffic stats samples.
    ///
    /// Default: 2 seconds
    pub fn stats_interval(mut self, interval: Duration) -> Self {
        self.config.stats_interval = interval;
        self
    }

    /// Bound on the wait for a Detach reply.
    ///
    /// Default: 3 seconds
    pub fn detach_timeout(mut self, timeout: Duration) -> Self {
        self.config.detach_timeout = timeout;
        self
    }

    /// Output lines kept in the session state.
    ///
    /// Default: 100
    pub fn scrollback(mut self, lines: usize) -> Self {
        self.config.scrollback = lines;
        self
    }

    /// Capacity of the event broadcast channel.
    ///
    /// Default: 256
    pub fn event_capacity(mut self, capacity: usize) -> Self {
        self.config.event_capacity = capacity;
        self
    }

    /// Throttle for exec status events.
    ///
    /// Default: 50 per 500 ms
    pub fn exec_status_limit(mut self, limit: RateLimit) -> Self {
        self.config.exec_status_limit = limit;
        self
    }

    /// Throttle for stats events.
    ///
    /// Default: 1 per 2 seconds
    pub fn stats_limit(mut self, limit: RateLimit) -> Self {
        self.config.stats_limit = limit;
        self
    }

    /// Throttle for log line events.
    ///
    /// Default: 10 per second
    pub fn log_line_limit(mut self, limit: RateLimit) -> Self {
        self.config.log_line_limit = limit;
        self
    }

    /// Log every message at info level.
    pub fn log_messages(mut self, enabled: bool) -> Self {
        self.config.log_messages = enabled;
        self
    }

    /// Dump raw inbound bytes to a file.
    pub fn dump_read_raw(mut self, path: impl Into<PathBuf>) -> Self {
        self.config.dump.read_raw = Some(path.into());
        self
    }

    /// Dump raw outbound bytes to a file.
    pub fn dump_write_raw(mut self, path: impl Into<PathBuf>) -> Self {
        self.config.dump.write_raw = Some(path.into());
        self
    }

    /// Dump both directions, one line per message.
    pub fn dump_pretty(mut self, path: impl Into<PathBuf>) -> Self {
        self.config.dump.pretty = Some(path.into());
        self
    }

    /// Start the driver task and return a handle to it.
    ///
    /// The session starts detached; call [`Debugger::connect`]. Must be
    /// called from within a tokio runtime.
    pub fn spawn(self) -> Debugger {
        let config = self.config;
        let connector: Arc<dyn Connector> = match self.connector {
            Some(connector) => connector,
            None => Arc::new(TcpConnector::new(config.host.clone(), config.port)),
        };

        let publisher = Publisher::new(
            config.event_capacity,
            config.exec_status_limit,
            config.stats_limit,
            config.log_line_limit,
            config.scrollback,
        );
        let events = publisher.sender();
        let detach_timeout = config.detach_timeout;
        let poll_interval = config.poll_interval;
        let stats_interval = config.stats_interval;

        let (session, transport) = Session::new(config, connector, publisher);
        let (commands_tx, commands_rx) = mpsc::channel(DEFAULT_COMMAND_CAPACITY);

        tokio::spawn(async move {
            drive(session, commands_rx, transport, poll_interval, stats_interval).await;
            tracing::debug!("Debugger driver stopped");
        });

        Debugger {
            commands: commands_tx,
            events,
            detach_timeout,
        }
    }
}

impl Default for DebuggerBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Driver loop. Runs until every [`Debugger`] handle is dropped.
async fn drive(
    mut session: Session,
    mut commands: mpsc::Receiver<Command>,
    mut transport: mpsc::UnboundedReceiver<TaggedEvent>,
    poll_interval: Duration,
    stats_interval: Duration,
) {
    let mut poll = interval_at(Instant::now() + poll_interval, poll_interval);
    poll.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let mut stats = interval_at(Instant::now() + stats_interval, stats_interval);
    stats.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            command = commands.recv() => match command {
                Some(command) => execute(&mut session, command),
                None => break,
            },
            Some((generation, event)) = transport.recv() => {
                session.on_transport_event(generation, event);
            }
            _ = poll.tick() => session.poll_tick(),
            _ = stats.tick() => session.sample_stats(stats_interval),
        }
    }

    session.disconnect();
}

fn execute(session: &mut Session, command: Command) {
    match command {
        Command::Connect => session.connect(),
        Command::Disconnect => session.drop_connection("Debug transport closed"),
        Command::Request {
            message,
            refresh_locals,
            reply,
        } => session.request(message, refresh_locals, reply),
        Command::ChangeBreakpoint {
            file_name,
            line,
            mode,
            reply,
        } => session.change_breakpoint(file_name, line, mode, reply),
        Command::DumpHeap(reply) => session.dump_heap(reply),
        Command::Snapshot(reply) => {
            let _ = reply.send(session.snapshot());
        }
    }
}

/// Handle to a running debugger session.
///
/// Cheap to clone; the session stops when the last handle is dropped.
#[derive(Clone)]
pub struct Debugger {
    commands: mpsc::Sender<Command>,
    events: broadcast::Sender<DebuggerEvent>,
    detach_timeout: Duration,
}

impl Debugger {
    /// Create a new debugger builder.
    pub fn builder() -> DebuggerBuilder {
        DebuggerBuilder::new()
    }

    async fn send(&self, command: Command) -> Result<()> {
        self.commands
            .send(command)
            .await
            .map_err(|_| DebuggerError::SessionClosed)
    }

    async fn call<T>(&self, command: impl FnOnce(oneshot::Sender<Result<T>>) -> Command) -> Result<T> {
        let (tx, rx) = oneshot::channel();
        self.send(command(tx)).await?;
        rx.await.map_err(|_| DebuggerError::Disconnected)?
    }

    /// Connect to the target, tearing down any previous connection.
    ///
    /// Returns once the connection attempt has started; watch for
    /// [`DebuggerEvent::Attached`] to know when requests can be sent.
    pub async fn connect(&self) -> Result<()> {
        self.send(Command::Connect).await
    }

    /// Drop the connection. Pending requests fail with `Disconnected`.
    pub async fn disconnect(&self) -> Result<()> {
        self.send(Command::Disconnect).await
    }

    /// Send a raw request and wait for its reply.
    ///
    /// An ERR reply comes back as [`DebuggerError::Target`].
    pub async fn request(&self, message: Message) -> Result<Message> {
        self.call(|reply| Command::Request {
            message,
            refresh_locals: false,
            reply,
        })
        .await
    }

    async fn request_refreshing_locals(&self, message: Message) -> Result<Message> {
        self.call(|reply| Command::Request {
            message,
            refresh_locals: true,
            reply,
        })
        .await
    }

    /// Pause the target at the next opportunity.
    pub async fn pause(&self) -> Result<()> {
        self.request(Message::request(command::PAUSE)).await.map(drop)
    }

    /// Resume a paused target.
    pub async fn resume(&self) -> Result<()> {
        self.request(Message::request(command::RESUME)).await.map(drop)
    }

    /// Step into the next call.
    pub async fn step_into(&self) -> Result<()> {
        self.request(Message::request(command::STEP_INTO)).await.map(drop)
    }

    /// Step to the next line in the current function.
    pub async fn step_over(&self) -> Result<()> {
        self.request(Message::request(command::STEP_OVER)).await.map(drop)
    }

    /// Run until the current function returns.
    pub async fn step_out(&self) -> Result<()> {
        self.request(Message::request(command::STEP_OUT)).await.map(drop)
    }

    /// Evaluate `code` in the paused activation.
    ///
    /// Locals are refreshed afterwards since the code may have changed them.
    pub async fn eval(&self, code: &str) -> Result<EvalResult> {
        let reply = self
            .request_refreshing_locals(Message::request(command::EVAL).with(code))
            .await?;
        let result = replies::eval_result(&reply);
        tracing::debug!(
            "Eval result: {}{}",
            if result.error { "error " } else { "" },
            ui_value(&result.value, Some(EVAL_CLIPLEN))
        );
        Ok(result)
    }

    /// Read a variable from the active scope.
    pub async fn get_var(&self, name: &str) -> Result<VarResult> {
        let reply = self
            .request(Message::request(command::GET_VAR).with(name))
            .await?;
        let result = replies::var_result(&reply);
        tracing::debug!(
            "GetVar {}: {}",
            name,
            if result.found {
                ui_value(&result.value, Some(GETVAR_CLIPLEN))
            } else {
                "not found".to_string()
            }
        );
        Ok(result)
    }

    /// Write a variable in the active scope.
    ///
    /// `value` must be encodable (integer, number, string or boolean);
    /// anything else fails with an encode error and drops the connection.
    pub async fn put_var(&self, name: &str, value: impl Into<Dvalue>) -> Result<()> {
        let message = Message::request(command::PUT_VAR)
            .with(name)
            .with(value.into());
        self.request_refreshing_locals(message).await.map(drop)
    }

    async fn change_breakpoint(
        &self,
        file_name: &str,
        line: u32,
        mode: BreakpointMode,
    ) -> Result<Vec<Breakpoint>> {
        let file_name = file_name.to_string();
        self.call(|reply| Command::ChangeBreakpoint {
            file_name,
            line,
            mode,
            reply,
        })
        .await
    }

    /// Add a breakpoint; returns the resulting list.
    pub async fn add_breakpoint(&self, file_name: &str, line: u32) -> Result<Vec<Breakpoint>> {
        self.change_breakpoint(file_name, line, BreakpointMode::Add).await
    }

    /// Delete every breakpoint at `file_name:line`; returns the resulting list.
    pub async fn delete_breakpoint(&self, file_name: &str, line: u32) -> Result<Vec<Breakpoint>> {
        self.change_breakpoint(file_name, line, BreakpointMode::Delete).await
    }

    /// Delete breakpoints at `file_name:line`, or add one if there were none.
    pub async fn toggle_breakpoint(&self, file_name: &str, line: u32) -> Result<Vec<Breakpoint>> {
        self.change_breakpoint(file_name, line, BreakpointMode::Toggle).await
    }

    pub async fn delete_all_breakpoints(&self) -> Result<Vec<Breakpoint>> {
        self.change_breakpoint("", 0, BreakpointMode::DeleteAll).await
    }

    /// Fetch and parse a dump of the target heap.
    pub async fn dump_heap(&self) -> Result<HeapDump> {
        self.call(Command::DumpHeap).await
    }

    /// Ask the target to detach, then disconnect.
    ///
    /// Waits for the Detach reply at most the configured detach timeout
    /// and disconnects either way. Fails with `InvalidState` if the session
    /// was not attached, or with `Timeout` if the target never answered.
    pub async fn detach(&self) -> Result<()> {
        let pending = self.request(Message::request(command::DETACH));
        let timed_out = match tokio::time::timeout(self.detach_timeout, pending).await {
            Ok(Ok(_)) => {
                tracing::debug!("Target acknowledged detach");
                false
            }
            Ok(Err(DebuggerError::InvalidState)) => return Err(DebuggerError::InvalidState),
            Ok(Err(e)) => {
                tracing::debug!("Detach failed: {}", e);
                false
            }
            Err(_) => {
                tracing::warn!("Detach timed out, disconnecting");
                true
            }
        };
        self.disconnect().await?;
        if timed_out {
            return Err(DebuggerError::Timeout);
        }
        Ok(())
    }

    /// Subscribe to every event.
    pub fn subscribe(&self) -> Subscription {
        Subscription::new(self.events.subscribe(), None)
    }

    /// Subscribe to selected event kinds.
    pub fn subscribe_to(&self, kinds: impl IntoIterator<Item = EventKind>) -> Subscription {
        Subscription::new(self.events.subscribe(), Some(kinds.into_iter().collect()))
    }

    /// Copy of the full session state.
    pub async fn snapshot(&self) -> Result<SessionState> {
        let (tx, rx) = oneshot::channel();
        self.send(Command::Snapshot(tx)).await?;
        rx.await.map_err(|_| DebuggerError::SessionClosed)
    }

    /// Check if the driver task is still running.
    pub fn is_running(&self) -> bool {
        !self.commands.is_closed()
    }
}
