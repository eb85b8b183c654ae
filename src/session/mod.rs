//! Session state machine.
//!
//! The [`Session`] owns everything about one debug connection: the
//! transport task, both stream parsers, the pending request FIFO and the
//! derived state. It performs no I/O of its own; the driver task feeds it
//! transport events, commands and timer ticks, and it writes outbound
//! messages through a [`WriterHandle`].
//!
//! ```text
//! Detached ─connect─► Connecting ─Connected─► AwaitingHandshake
//!     ▲                                            │ version line
//!     └──── close / error / violation ◄──── Attached{Running|Paused}
//! ```
//!
//! Replies carry no request id. The target answers strictly in order, so
//! every REP or ERR settles the oldest pending request.

pub(crate) mod replies;
mod state;

pub use replies::{
    htype, EvalResult, HeapBody, HeapDump, HeapObject, HeapProperty, PropertySlot, VarResult,
};
pub use state::{
    BasicInfo, Breakpoint, CallFrame, DebugStats, Endianness, ExecState, ExecStatus, Local,
    LogKind, LogLine, SessionState,
};

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use crate::config::DebuggerConfig;
use crate::error::{DebuggerError, Result};
use crate::events::{DebuggerEvent, Publisher};
use crate::protocol::pretty::{ui_string_unquoted, ui_value, UI_MESSAGE_CLIPLEN};
use crate::protocol::{command, Dvalue, Message, MessageKind, ParserEvent, StreamParser, VersionInfo};
use crate::transport::{spawn_connection, Connector, TaggedEvent, TransportEvent};
use crate::writer::WriterHandle;

/// How `change_breakpoint` treats matching entries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakpointMode {
    /// Add, after removing duplicates.
    Add,
    /// Remove every match.
    Delete,
    /// Remove every match, or add if there was none.
    Toggle,
    /// Remove everything.
    DeleteAll,
}

/// Derived state refreshed by a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RefreshKind {
    Status,
    Breakpoints,
    Locals,
    CallStack,
    BasicInfo,
}

impl RefreshKind {
    fn command(self) -> i32 {
        match self {
            RefreshKind::Status => command::TRIGGER_STATUS,
            RefreshKind::Breakpoints => command::LIST_BREAK,
            RefreshKind::Locals => command::GET_LOCALS,
            RefreshKind::CallStack => command::GET_CALL_STACK,
            RefreshKind::BasicInfo => command::BASIC_INFO,
        }
    }
}

/// Poller rotation, one request per tick.
const POLL_SLOTS: [RefreshKind; 4] = [
    RefreshKind::Status,
    RefreshKind::Breakpoints,
    RefreshKind::Locals,
    RefreshKind::CallStack,
];

/// What to do when a pending request settles.
enum Completion {
    /// Hand the reply to a caller.
    Reply(oneshot::Sender<Result<Message>>),
    /// Store the reply in the derived state.
    Refresh { kind: RefreshKind, polled: bool },
    /// First step of a breakpoint change: the authoritative list.
    ChangeBreakpoint {
        file_name: String,
        line: u32,
        mode: BreakpointMode,
        reply: oneshot::Sender<Result<Vec<Breakpoint>>>,
    },
    /// Store the breakpoint list and hand it to a caller.
    ListBreakpoints(oneshot::Sender<Result<Vec<Breakpoint>>>),
    HeapDump(oneshot::Sender<Result<HeapDump>>),
    /// Nobody waits; an error is shown as an output line if `context` is set.
    Discard { context: Option<&'static str> },
}

/// A request waiting for its REP or ERR.
struct PendingRequest {
    message: Message,
    completion: Completion,
}

/// The protocol engine for one target.
pub struct Session {
    config: DebuggerConfig,
    connector: Arc<dyn Connector>,
    /// Sender handed to connection tasks.
    transport_tx: mpsc::UnboundedSender<TaggedEvent>,
    /// Bumped on every connect and disconnect; older events are stale.
    generation: u64,
    connection: Option<JoinHandle<()>>,
    writer: Option<WriterHandle>,
    /// Inbound parser, performs the handshake.
    input: Option<StreamParser>,
    /// Fed a copy of outbound bytes, for stats and dumps only.
    output: Option<StreamParser>,
    /// Exists from transport connect until disconnect.
    queue: Option<VecDeque<PendingRequest>>,
    state: SessionState,
    publisher: Publisher,
    poll_round: usize,
    /// Poll slot requests still unanswered.
    poll_in_flight: [bool; 4],
}

impl Session {
    /// Create a detached session.
    ///
    /// Returns the receiver of transport events, which the driver must feed
    /// back through [`Session::on_transport_event`].
    pub(crate) fn new(
        config: DebuggerConfig,
        connector: Arc<dyn Connector>,
        publisher: Publisher,
    ) -> (Self, mpsc::UnboundedReceiver<TaggedEvent>) {
        let (transport_tx, transport_rx) = mpsc::unbounded_channel();
        let session = Self {
            config,
            connector,
            transport_tx,
            generation: 0,
            connection: None,
            writer: None,
            input: None,
            output: None,
            queue: None,
            state: SessionState::default(),
            publisher,
            poll_round: 0,
            poll_in_flight: [false; 4],
        };
        (session, transport_rx)
    }

    /// Current derived state.
    pub fn state(&self) -> &SessionState {
        &self.state
    }

    /// Tear down any previous connection and start a new one.
    pub fn connect(&mut self) {
        let generation = self.prepare_connection();
        tracing::info!("Connecting to debug target");
        self.connection = Some(spawn_connection(
            self.connector.clone(),
            generation,
            self.transport_tx.clone(),
        ));
    }

    /// Reset and create the parsers for a new connection.
    ///
    /// Returns the generation that transport events must carry.
    fn prepare_connection(&mut self) -> u64 {
        self.disconnect();
        self.generation += 1;
        self.input = Some(StreamParser::with_dump(self.config.dump.input_sink()));
        self.output = Some(StreamParser::without_handshake(self.config.dump.output_sink()));
        self.generation
    }

    /// Idempotent teardown.
    ///
    /// Pending requests are dropped; their callers see `Disconnected`.
    /// Returns `true` if there was anything to tear down.
    pub fn disconnect(&mut self) -> bool {
        let active = self.connection.is_some() || self.input.is_some() || self.writer.is_some();

        if let Some(connection) = self.connection.take() {
            connection.abort();
        }
        if let Some(writer) = self.writer.take() {
            let unwritten = writer.pending_count();
            if unwritten > 0 {
                tracing::debug!("Dropping {} unwritten messages", unwritten);
            }
        }
        if let Some(mut input) = self.input.take() {
            input.close();
        }
        if let Some(mut output) = self.output.take() {
            output.close();
        }
        if let Some(queue) = self.queue.take() {
            if !queue.is_empty() {
                tracing::debug!("Dropping {} pending requests", queue.len());
            }
        }

        self.state.attached = false;
        self.state.handshook = false;
        self.state.exec_status = ExecStatus::default();
        self.poll_in_flight = [false; 4];
        self.poll_round = 0;
        // Events still queued from the old connection are stale now
        self.generation += 1;

        active
    }

    /// Drop the connection with an explanation and tell consumers.
    ///
    /// Does nothing visible when no connection is active.
    pub fn drop_connection(&mut self, reason: impl Into<String>) {
        let reason = reason.into();
        if !self.disconnect() {
            tracing::debug!("Not connected, ignoring: {}", reason);
            return;
        }

        tracing::info!("{}", reason);
        self.output_line(LogLine::info(reason));
        self.publisher
            .publish(DebuggerEvent::ExecStatusChanged(self.state.exec_status.clone()));
        self.publisher.publish(DebuggerEvent::Detached);
    }

    /// Handle one event from a connection task.
    pub fn on_transport_event(&mut self, generation: u64, event: TransportEvent) {
        if generation != self.generation {
            tracing::debug!("Ignoring event from stale connection {}", generation);
            return;
        }

        match event {
            TransportEvent::Connected(writer) => {
                tracing::info!("Debug transport connected");
                self.writer = Some(writer);
                self.queue = Some(VecDeque::new());
                self.state.attached = true;
                self.output_line(LogLine::info("Debug transport connected"));
            }
            TransportEvent::Data(data) => self.on_data(&data),
            TransportEvent::Closed => self.drop_connection("Debug transport closed"),
            TransportEvent::Error(e) => {
                tracing::warn!("Debug transport error: {}", e);
                self.drop_connection(format!("Debug transport error: {}", e));
            }
        }
    }

    fn on_data(&mut self, data: &[u8]) {
        let Some(parser) = self.input.as_mut() else {
            return;
        };

        let events = match parser.push(data) {
            Ok(events) => events,
            Err(e) => {
                tracing::warn!("Debug stream error: {}", e);
                self.drop_connection(format!("Debug stream error, dropping connection: {}", e));
                return;
            }
        };

        for event in events {
            // A violation earlier in the chunk may have dropped the connection
            if self.input.is_none() {
                break;
            }
            match event {
                ParserEvent::Handshake(info) => self.on_handshake(info),
                ParserEvent::Message(msg) => self.process_message(msg),
            }
        }
    }

    fn on_handshake(&mut self, info: VersionInfo) {
        tracing::info!("Debug version identification: {}", info.identification);
        self.state.protocol_version = info.version;
        self.state.version_identification = Some(info.identification.clone());
        self.output_line(LogLine::info(format!(
            "Debug version identification: {}",
            info.identification
        )));

        if info.version != Some(self.config.protocol_version) {
            let shown = info
                .version
                .map(|v| v.to_string())
                .unwrap_or_else(|| "?".to_string());
            self.drop_connection(format!(
                "Protocol version {} unsupported, dropping connection",
                shown
            ));
            return;
        }

        self.output_line(LogLine::info(format!(
            "Debug protocol version: {}",
            self.config.protocol_version
        )));
        self.state.handshook = true;
        self.state.exec_status = ExecStatus::attached();
        self.publisher
            .publish(DebuggerEvent::ExecStatusChanged(self.state.exec_status.clone()));
        self.publisher.publish(DebuggerEvent::Attached);

        self.refresh(RefreshKind::BasicInfo, false);
    }

    /// Dispatch one inbound message.
    pub fn process_message(&mut self, msg: Message) {
        match msg.kind() {
            Some(MessageKind::Request) => {
                self.violation(format!("Unsolicited request message, dropping connection: {}", msg));
            }
            Some(MessageKind::Reply) => {
                let Some(pending) = self.pop_pending() else {
                    self.violation(format!("Unsolicited reply message, dropping connection: {}", msg));
                    return;
                };
                if self.config.log_messages {
                    tracing::info!("Reply for {}: {}", pending.message.command_name(), msg);
                }
                self.complete(pending.completion, Ok(msg));
            }
            Some(MessageKind::Error) => {
                let Some(pending) = self.pop_pending() else {
                    self.violation(format!("Unsolicited error message, dropping connection: {}", msg));
                    return;
                };
                if self.config.log_messages {
                    tracing::info!("Error for {}: {}", pending.message.command_name(), msg);
                }
                let err = DebuggerError::Target {
                    code: msg.int(1).and_then(|c| i32::try_from(c).ok()).unwrap_or(0),
                    description: msg
                        .get(2)
                        .map(|v| v.to_string_lossy().unwrap_or_else(|| ui_value(v, None)))
                        .unwrap_or_default(),
                };
                self.complete(pending.completion, Err(err));
            }
            Some(MessageKind::Notify) => self.on_notify(msg),
            None => {
                self.violation(format!("Invalid initial dvalue, dropping connection: {}", msg));
            }
        }
    }

    fn pop_pending(&mut self) -> Option<PendingRequest> {
        self.queue.as_mut()?.pop_front()
    }

    fn violation(&mut self, reason: String) {
        tracing::warn!("{}", reason);
        self.drop_connection(reason);
    }

    fn on_notify(&mut self, msg: Message) {
        if self.config.log_messages {
            tracing::info!("Notify {}: {}", msg.command_name(), msg);
        }

        match msg.command() {
            Some(command::STATUS) => {
                let previous = self.state.exec_status.state;
                let state = if msg.int(2) == Some(0) {
                    ExecState::Running
                } else {
                    ExecState::Paused
                };
                self.state.exec_status = ExecStatus {
                    attached: true,
                    state,
                    file_name: msg.string(3).unwrap_or_default(),
                    func_name: msg.string(4).unwrap_or_default(),
                    line: msg.get(5).and_then(Dvalue::as_u32).unwrap_or(0),
                    pc: msg.get(6).and_then(Dvalue::as_u32).unwrap_or(0),
                };

                if previous != state && state == ExecState::Paused {
                    self.refresh(RefreshKind::Breakpoints, false);
                    self.refresh(RefreshKind::Locals, false);
                    self.refresh(RefreshKind::CallStack, false);
                }

                self.publisher
                    .publish(DebuggerEvent::ExecStatusChanged(self.state.exec_status.clone()));
            }
            Some(command::PRINT) => self.output_line(LogLine {
                kind: LogKind::Print,
                level: None,
                message: ui_text(msg.get(2)),
            }),
            Some(command::ALERT) => self.output_line(LogLine {
                kind: LogKind::Alert,
                level: None,
                message: ui_text(msg.get(2)),
            }),
            Some(command::LOG) => self.output_line(LogLine {
                kind: LogKind::Log,
                level: msg.int(2),
                message: ui_text(msg.get(3)),
            }),
            _ => self.violation(format!("Unknown notify, dropping connection: {}", msg)),
        }
    }

    /// Append an output line and publish it.
    fn output_line(&mut self, line: LogLine) {
        self.state.output.push_back(line.clone());
        while self.state.output.len() > self.config.scrollback {
            self.state.output.pop_front();
        }
        self.publisher.publish(DebuggerEvent::LogLine(line));
    }

    /// Send a request whose reply goes to `reply`.
    ///
    /// With `refresh_locals`, a locals refresh is queued right behind it.
    pub fn request(
        &mut self,
        message: Message,
        refresh_locals: bool,
        reply: oneshot::Sender<Result<Message>>,
    ) {
        self.send_request(message, Completion::Reply(reply));
        if refresh_locals && self.is_ready() {
            self.refresh(RefreshKind::Locals, false);
        }
    }

    /// Edit breakpoints, resolving with the final list read from the target.
    ///
    /// The target list is fetched first and scanned from the highest index
    /// down, so that deleting one entry does not shift the ones still to go.
    pub fn change_breakpoint(
        &mut self,
        file_name: String,
        line: u32,
        mode: BreakpointMode,
        reply: oneshot::Sender<Result<Vec<Breakpoint>>>,
    ) {
        self.send_request(
            Message::request(command::LIST_BREAK),
            Completion::ChangeBreakpoint {
                file_name,
                line,
                mode,
                reply,
            },
        );
    }

    /// Request a heap dump.
    pub fn dump_heap(&mut self, reply: oneshot::Sender<Result<HeapDump>>) {
        self.send_request(Message::request(command::DUMP_HEAP), Completion::HeapDump(reply));
    }

    /// One poller tick; only does anything while the target runs.
    pub fn poll_tick(&mut self) {
        if self.state.exec_status.state != ExecState::Running {
            return;
        }

        let slot = self.poll_round;
        self.poll_round = (self.poll_round + 1) % POLL_SLOTS.len();

        if !self.poll_in_flight[slot] {
            self.poll_in_flight[slot] = true;
            self.refresh(POLL_SLOTS[slot], true);
        }
    }

    /// Sample traffic counters and publish them.
    pub fn sample_stats(&mut self, interval: Duration) {
        let (Some(input), Some(output)) = (self.input.as_mut(), self.output.as_mut()) else {
            return;
        };
        let rx = input.sample_stats(interval);
        let tx = output.sample_stats(interval);
        self.state.stats = DebugStats::from_streams(rx, tx);
        self.publisher.publish(DebuggerEvent::StatsChanged(self.state.stats));
    }

    fn is_ready(&self) -> bool {
        self.state.attached && self.state.handshook && self.queue.is_some() && self.writer.is_some()
    }

    fn refresh(&mut self, kind: RefreshKind, polled: bool) {
        self.send_request(
            Message::request(kind.command()),
            Completion::Refresh { kind, polled },
        );
    }

    /// Encode and write `message`, then queue its completion.
    ///
    /// On failure the completion is settled with the error right away.
    fn send_request(&mut self, message: Message, completion: Completion) {
        match self.write_request(&message) {
            Ok(()) => {
                if let Some(queue) = self.queue.as_mut() {
                    queue.push_back(PendingRequest {
                        message,
                        completion,
                    });
                }
            }
            Err(e) => self.complete(completion, Err(e)),
        }
    }

    fn write_request(&mut self, message: &Message) -> Result<()> {
        if !self.is_ready() {
            tracing::debug!(
                "Request {} while not attached",
                message.command_name()
            );
            return Err(DebuggerError::InvalidState);
        }

        let data = match message.encode() {
            Ok(data) => data,
            Err(e) => {
                tracing::warn!("Failed to encode {}: {}", message.command_name(), e);
                self.drop_connection(format!(
                    "Failed to encode request, dropping connection: {}",
                    e
                ));
                return Err(e.into());
            }
        };

        if self.config.log_messages {
            tracing::info!("Request {}: {}", message.command_name(), message);
        }

        self.write(data)
    }

    fn write(&mut self, data: Bytes) -> Result<()> {
        let Some(writer) = self.writer.as_ref() else {
            return Err(DebuggerError::InvalidState);
        };
        if let Err(e) = writer.send(data.clone()) {
            self.drop_connection("Debug transport writer stopped");
            return Err(e);
        }
        if let Some(output) = self.output.as_mut() {
            // Loopback only counts and dumps
            let _ = output.push(&data);
        }
        Ok(())
    }

    /// Settle a pending request.
    fn complete(&mut self, completion: Completion, result: Result<Message>) {
        match completion {
            Completion::Reply(reply) => {
                let _ = reply.send(result);
            }
            Completion::Refresh { kind, polled } => {
                if polled {
                    if let Some(slot) = POLL_SLOTS.iter().position(|k| *k == kind) {
                        self.poll_in_flight[slot] = false;
                    }
                }
                match result {
                    Ok(msg) => self.apply_refresh(kind, &msg),
                    Err(e) => tracing::debug!("Refresh {:?} failed: {}", kind, e),
                }
            }
            Completion::ChangeBreakpoint {
                file_name,
                line,
                mode,
                reply,
            } => match result {
                Ok(msg) => self.apply_breakpoint_change(&msg, file_name, line, mode, reply),
                Err(e) => {
                    let _ = reply.send(Err(e));
                }
            },
            Completion::ListBreakpoints(reply) => {
                let list = result.map(|msg| {
                    self.apply_refresh(RefreshKind::Breakpoints, &msg);
                    self.state.breakpoints.clone()
                });
                let _ = reply.send(list);
            }
            Completion::HeapDump(reply) => {
                let dump = result.and_then(|msg| replies::heap_dump(&msg));
                if let Err(DebuggerError::Protocol(reason)) = &dump {
                    self.violation(format!("{}, dropping connection", reason));
                }
                let _ = reply.send(dump);
            }
            Completion::Discard { context } => {
                if let (Err(e), Some(context)) = (result, context) {
                    self.output_line(LogLine::info(format!("{}: {}", context, e)));
                }
            }
        }
    }

    fn apply_refresh(&mut self, kind: RefreshKind, msg: &Message) {
        match kind {
            // The target answers with a Status notify
            RefreshKind::Status => {}
            RefreshKind::Breakpoints => {
                self.state.breakpoints = replies::breakpoints(msg);
                self.publisher
                    .publish(DebuggerEvent::BreakpointsChanged(self.state.breakpoints.clone()));
            }
            RefreshKind::Locals => {
                self.state.locals = replies::locals(msg);
                self.publisher
                    .publish(DebuggerEvent::LocalsChanged(self.state.locals.clone()));
            }
            RefreshKind::CallStack => {
                self.state.callstack = replies::callstack(msg);
                self.publisher
                    .publish(DebuggerEvent::CallStackChanged(self.state.callstack.clone()));
            }
            RefreshKind::BasicInfo => {
                let info = replies::basic_info(msg);
                tracing::info!(
                    "Target version {} ({}), {}",
                    info.version,
                    info.git_describe,
                    info.target_info
                );
                self.state.basic_info = Some(info.clone());
                self.publisher.publish(DebuggerEvent::BasicInfoChanged(info));
            }
        }
    }

    fn apply_breakpoint_change(
        &mut self,
        msg: &Message,
        file_name: String,
        line: u32,
        mode: BreakpointMode,
        reply: oneshot::Sender<Result<Vec<Breakpoint>>>,
    ) {
        let current = replies::breakpoints(msg);
        let mut deleted = false;

        // Add also removes matches, so duplicates never accumulate
        for (index, bp) in current.iter().enumerate().rev() {
            if mode == BreakpointMode::DeleteAll || (bp.file_name == file_name && bp.line == line) {
                deleted = true;
                let Ok(index) = i32::try_from(index) else {
                    continue;
                };
                self.send_request(
                    Message::request(command::DEL_BREAK).with(index),
                    Completion::Discard { context: None },
                );
            }
        }

        // Queued behind the deletes
        if mode == BreakpointMode::Add || (mode == BreakpointMode::Toggle && !deleted) {
            self.send_request(
                Message::request(command::ADD_BREAK)
                    .with(file_name)
                    .with(line),
                Completion::Discard {
                    context: Some("Failed to add breakpoint"),
                },
            );
        }

        self.send_request(
            Message::request(command::LIST_BREAK),
            Completion::ListBreakpoints(reply),
        );
    }

    /// Copy of the derived state.
    pub fn snapshot(&self) -> SessionState {
        self.state.clone()
    }

    /// Number of requests awaiting a reply.
    pub fn pending_requests(&self) -> usize {
        self.queue.as_ref().map_or(0, VecDeque::len)
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        if let Some(connection) = self.connection.take() {
            connection.abort();
        }
    }
}

/// Unquoted, clipped text of an output notification value.
fn ui_text(value: Option<&Dvalue>) -> String {
    match value {
        Some(v) => match v.as_str_bytes() {
            Some(bytes) => ui_string_unquoted(bytes, Some(UI_MESSAGE_CLIPLEN)),
            None => ui_value(v, Some(UI_MESSAGE_CLIPLEN)),
        },
        None => String::new(),
    }
}
