//! # dvalue-debugger
//!
//! Client side of a binary debug protocol for an embedded script engine.
//!
//! The target speaks a stream of tagged values ("dvalues") grouped into
//! messages, preceded by a one-line version handshake. This crate decodes
//! that stream, correlates replies with requests and keeps a model of the
//! target's execution state.
//!
//! ## Architecture
//!
//! - **Protocol** ([`protocol`]): dvalue codec, messages, incremental stream parser
//! - **Transport** ([`transport`]): connectors and the connection task
//! - **Session** ([`session`]): the state machine owning one connection
//! - **Debugger** ([`Debugger`]): clonable handle talking to the driver task
//!
//! ## Example
//!
//! ```no_run
//! use dvalue_debugger::{Debugger, EventKind};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let debugger = Debugger::builder().port(9091).spawn();
//!     let mut attached = debugger.subscribe_to([EventKind::Attached]);
//!
//!     debugger.connect().await?;
//!     attached.recv().await?;
//!
//!     let var = debugger.get_var("counter").await?;
//!     println!("counter = {}", var.value);
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod error;
pub mod events;
pub mod protocol;
pub mod ratelimit;
pub mod session;
pub mod source;
pub mod transport;
pub mod writer;

mod debugger;

pub use config::{DebuggerConfig, DumpConfig};
pub use debugger::{Debugger, DebuggerBuilder};
pub use error::{DebuggerError, Result};
pub use events::{DebuggerEvent, EventKind, RateLimit, Subscription};
pub use protocol::{Dvalue, Message};
pub use session::{ExecState, ExecStatus, SessionState};
