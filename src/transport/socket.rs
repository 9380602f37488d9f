//! Raw-socket LAN transport
//!
//! TSP instruments accept line-terminated commands on TCP port 5025. The
//! raw-socket interface has no serial poll, so the status byte is read with a
//! tagged print of `status.condition`. Replies that arrive ahead of the tagged
//! line are buffered, returned by later reads, and reported as MAV.
//!
//! The instrument executes commands in order, so a status query issued behind a
//! blocking command (`waitcomplete()`) is only answered once that command is
//! done. A sample gives up when its bound runs out and leaves the tagged reply
//! owed: no second query is sent while one is outstanding, and a tagged line
//! that turns up later is consumed by whichever read sees it first.

use super::{Transport, TransportCapabilities};
use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use std::collections::VecDeque;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::time::Instant;
use tracing::{debug, trace};

/// Default raw-socket port.
pub const DEFAULT_PORT: u16 = 5025;

const STATUS_TAG: &str = "STB:";
const MESSAGE_AVAILABLE: u8 = 0x10;

/// Line transport over a TCP connection.
pub struct SocketTransport {
    reader: Option<BufReader<OwnedReadHalf>>,
    writer: Option<OwnedWriteHalf>,
    pending: VecDeque<String>,
    /// Bytes of a line whose read was cut short by a timeout.
    partial: Vec<u8>,
    /// A tagged status query has been sent and not yet answered.
    status_owed: bool,
    capabilities: TransportCapabilities,
    connect_timeout: Duration,
    status_timeout: Duration,
    status_query: String,
}

impl Default for SocketTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl SocketTransport {
    /// Unconnected transport with default timeouts.
    pub fn new() -> Self {
        Self {
            reader: None,
            writer: None,
            pending: VecDeque::new(),
            partial: Vec::new(),
            status_owed: false,
            capabilities: TransportCapabilities::default(),
            connect_timeout: Duration::from_secs(5),
            status_timeout: Duration::from_secs(10),
            status_query: format!("_G.print('{STATUS_TAG}' .. _G.status.condition)"),
        }
    }

    /// Longest wait for the TCP connection to come up.
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Longest a single status sample waits for the tagged reply.
    pub fn with_status_timeout(mut self, timeout: Duration) -> Self {
        self.status_timeout = timeout;
        self
    }

    /// `host` or `host:port`; the raw-socket port is the default.
    fn socket_address(address: &str) -> String {
        let address = address
            .trim()
            .trim_start_matches("TCPIP::")
            .trim_end_matches("::SOCKET");
        if let Some((host, port)) = address.split_once("::") {
            return format!("{host}:{port}");
        }
        if address.contains(':') {
            address.to_string()
        } else {
            format!("{address}:{DEFAULT_PORT}")
        }
    }

    async fn send(&mut self, command: &str) -> Result<usize> {
        let writer = self
            .writer
            .as_mut()
            .ok_or_else(|| anyhow!("Socket not connected"))?;
        let line = format!("{}{}", command, self.capabilities.line_terminator);
        writer
            .write_all(line.as_bytes())
            .await
            .context("Failed to write to socket")?;
        writer.flush().await.context("Failed to flush socket")?;
        Ok(line.len())
    }

    /// Read one line, or `None` if `timeout` passes first.
    ///
    /// A line cut short by the timeout stays in `partial` and is completed by
    /// the next read.
    async fn receive_within(&mut self, timeout: Duration) -> Result<Option<String>> {
        let reader = self
            .reader
            .as_mut()
            .ok_or_else(|| anyhow!("Socket not connected"))?;
        let pending_read = reader.read_until(b'\n', &mut self.partial);
        let read = match tokio::time::timeout(timeout, pending_read).await {
            Ok(read) => read.context("Failed to read from socket")?,
            Err(_) => return Ok(None),
        };
        if read == 0 && self.partial.is_empty() {
            bail!("Connection closed by instrument");
        }
        let line = std::mem::take(&mut self.partial);
        Ok(Some(
            String::from_utf8_lossy(&line)
                .trim_end_matches(|c| c == '\r' || c == '\n')
                .to_string(),
        ))
    }

    /// Next reply line, skipping a late answer to an abandoned status query.
    async fn receive(&mut self, timeout: Duration) -> Result<String> {
        let deadline = Instant::now().checked_add(timeout);
        loop {
            let remaining = time_left(deadline, timeout);
            let line = self
                .receive_within(remaining)
                .await?
                .ok_or_else(|| anyhow!("Read timed out after {:?}", timeout))?;
            if self.status_owed && parse_status(&line).is_some() {
                self.status_owed = false;
                trace!(reply = %line, "Dropped late status reply");
                continue;
            }
            return Ok(line);
        }
    }
}

/// Time until `deadline`; an unrepresentable deadline leaves `bound` intact.
fn time_left(deadline: Option<Instant>, bound: Duration) -> Duration {
    deadline.map_or(bound, |d| d.saturating_duration_since(Instant::now()))
}

/// Parse a tagged status reply such as `STB:16` or `STB:1.60000e+01`.
fn parse_status(line: &str) -> Option<Result<u8>> {
    let value = line.trim().strip_prefix(STATUS_TAG)?;
    Some(
        value
            .trim()
            .parse::<f64>()
            .ok()
            .filter(|v| (0.0..=255.0).contains(v))
            .map(|v| v as u8)
            .ok_or_else(|| anyhow!("Invalid status byte reply '{}'", line)),
    )
}

#[async_trait]
impl Transport for SocketTransport {
    async fn open(&mut self, address: &str, model_hint: Option<&str>) -> Result<()> {
        let target = Self::socket_address(address);
        let stream = tokio::time::timeout(self.connect_timeout, TcpStream::connect(&target))
            .await
            .with_context(|| format!("Timed out connecting to {}", target))?
            .with_context(|| format!("Failed to connect to {}", target))?;
        stream.set_nodelay(true).context("Failed to set TCP_NODELAY")?;
        let (read, write) = stream.into_split();
        self.reader = Some(BufReader::new(read));
        self.writer = Some(write);
        debug!(address = %target, model_hint = ?model_hint, "Socket opened");
        Ok(())
    }

    async fn close(&mut self) -> Result<()> {
        if let Some(mut writer) = self.writer.take() {
            writer.shutdown().await.context("Failed to shut down socket")?;
            debug!("Socket closed");
        }
        self.reader = None;
        self.pending.clear();
        self.partial.clear();
        self.status_owed = false;
        Ok(())
    }

    async fn write_line(&mut self, command: &str) -> Result<usize> {
        self.send(command).await
    }

    async fn read_line(&mut self, timeout: Duration) -> Result<String> {
        if let Some(line) = self.pending.pop_front() {
            return Ok(line);
        }
        self.receive(timeout).await
    }

    async fn read_status_byte(&mut self, timeout: Duration) -> Result<Option<u8>> {
        if !self.status_owed {
            let query = self.status_query.clone();
            self.send(&query).await?;
            self.status_owed = true;
        }
        let bound = timeout.min(self.status_timeout);
        let deadline = Instant::now().checked_add(bound);
        loop {
            let remaining = time_left(deadline, bound);
            let Some(line) = self.receive_within(remaining).await? else {
                trace!("Status reply still owed");
                return Ok(None);
            };
            match parse_status(&line) {
                Some(status) => {
                    self.status_owed = false;
                    let mut status = status?;
                    if !self.pending.is_empty() {
                        status |= MESSAGE_AVAILABLE;
                    }
                    return Ok(Some(status));
                }
                None => self.pending.push_back(line),
            }
        }
    }

    fn capabilities(&self) -> TransportCapabilities {
        self.capabilities.clone()
    }

    fn is_open(&self) -> bool {
        self.writer.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_socket_address() {
        assert_eq!(SocketTransport::socket_address("10.0.0.5"), "10.0.0.5:5025");
        assert_eq!(SocketTransport::socket_address("10.0.0.5:4000"), "10.0.0.5:4000");
        assert_eq!(
            SocketTransport::socket_address("TCPIP::10.0.0.5::5025::SOCKET"),
            "10.0.0.5:5025"
        );
    }

    #[test]
    fn test_parse_status() {
        assert_eq!(parse_status("STB:16").unwrap().unwrap(), 16);
        assert_eq!(parse_status("STB:1.60000e+01").unwrap().unwrap(), 16);
        assert!(parse_status("STB:nil").unwrap().is_err());
        assert!(parse_status("1").is_none());
    }
}
