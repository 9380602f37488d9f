//! Byte-stream transports
//!
//! The engine consumes a half-duplex, line-oriented request/reply link. This
//! module defines that contract and ships two implementations:
//!
//! - [`SimulatedInstrument`]: in-memory TSP instrument for tests and dry runs
//! - [`SocketTransport`]: raw-socket LAN connection (port 5025)
//!
//! Transports report failures as `anyhow::Error`; the session lifts them into
//! [`crate::error::TspError::Transport`].

pub mod simulated;
pub mod socket;

pub use simulated::{SimValue, SimulatedInstrument};
pub use socket::SocketTransport;

use anyhow::Result;
use async_trait::async_trait;
use std::time::Duration;

/// Static facts about a link that shape how commands are written.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportCapabilities {
    /// Appended to every written line.
    pub line_terminator: String,
    /// Longest single line the link accepts, terminator excluded.
    pub max_message_length: usize,
}

impl Default for TransportCapabilities {
    fn default() -> Self {
        Self {
            line_terminator: "\n".to_string(),
            max_message_length: 2048,
        }
    }
}

/// Line-oriented instrument link.
///
/// ## Contract
/// - `open`/`close` bracket every use; `close` must be safe to call twice
/// - one outstanding request at a time: the caller serializes round trips
/// - replies come back in command order
/// - `read_status_byte` is non-destructive and does not consume output
/// - a status sample that cannot be taken within its bound yields `None`;
///   the transport keeps track of any reply that is still owed
#[async_trait]
pub trait Transport: Send {
    /// Open the resource at `address`.
    async fn open(&mut self, address: &str, model_hint: Option<&str>) -> Result<()>;

    /// Release the resource.
    async fn close(&mut self) -> Result<()>;

    /// Write one command line; returns the number of bytes written.
    async fn write_line(&mut self, command: &str) -> Result<usize>;

    /// Read one reply line (terminator stripped).
    async fn read_line(&mut self, timeout: Duration) -> Result<String>;

    /// Sample the status byte, giving up after `timeout`.
    async fn read_status_byte(&mut self, timeout: Duration) -> Result<Option<u8>>;

    /// Terminator and size limits of this link.
    fn capabilities(&self) -> TransportCapabilities;

    /// Whether `open` succeeded and `close` has not been called.
    fn is_open(&self) -> bool;
}
