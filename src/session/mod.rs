//! Instrument session
//!
//! A [`TspSession`] is the single owner of one instrument connection. The bus is
//! half-duplex, so every write+read round trip and every status byte sample
//! runs under one `tokio::sync::Mutex`; concurrent callers (including spawned
//! wait tasks) queue on that lock and see replies in command order.
//!
//! The session also owns the connection-scoped mutable state: the register
//! dictionaries with their cached status values, the last drained error queue
//! and the enable masks that must be restored after a clear.
//!
//! # Example
//!
//! ```no_run
//! use rust_tsp::config::SessionConfig;
//! use rust_tsp::session::{CommandSet, TspSession};
//! use rust_tsp::transport::SocketTransport;
//!
//! # async fn example() -> rust_tsp::TspResult<()> {
//! let config = SessionConfig::for_resource("192.168.1.50:5025");
//! let session = TspSession::connect(
//!     Box::new(SocketTransport::new()),
//!     config,
//!     CommandSet::default(),
//! )
//! .await?;
//!
//! println!("Instrument: {}", session.identity().await?);
//! session.close().await?;
//! # Ok(())
//! # }
//! ```

pub mod commands;
pub mod error_queue;
pub mod firmware;
pub mod wait;

pub use commands::CommandSet;
pub use error_queue::{DeviceError, DeviceErrorQueue, ErrorLevel, PARSE_FAILURE_NUMBER};
pub use firmware::{FirmwareRules, FirmwareVersion, BYTE_CODE_CUTOVER_MAJOR};
pub use wait::{StatusWaitTask, WaitOutcome, WaitState};

use crate::config::SessionConfig;
use crate::error::{TspError, TspResult};
use crate::node::NodeEntity;
use crate::registers::{EventRegister, StatusByte, StatusRegisters};
use crate::transport::Transport;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, info, trace, warn};

/// State owned by one connection. Only reachable through the session lock.
struct Connection {
    transport: Box<dyn Transport>,
    registers: StatusRegisters,
    error_queue: DeviceErrorQueue,
    service_request_enable: u32,
    standard_event_enable: u32,
    /// Replies owed by commands whose wait timed out.
    orphan_replies: usize,
}

impl Connection {
    /// Take one status sample within `bound` and cache it.
    ///
    /// `None` means the link could not produce a sample in time.
    async fn sample_status(&mut self, bound: Duration) -> TspResult<Option<StatusByte>> {
        let raw = self.transport.read_status_byte(bound).await?;
        Ok(raw.map(|raw| self.registers.record_status_byte(raw)))
    }

    /// Most recently cached status byte.
    fn last_status(&self) -> StatusByte {
        StatusByte(u8::try_from(self.registers.status_byte.status()).unwrap_or(u8::MAX))
    }
}

/// Handle to an open instrument session. Clones share the connection.
#[derive(Clone)]
pub struct TspSession {
    connection: Arc<Mutex<Connection>>,
    commands: Arc<CommandSet>,
    config: Arc<SessionConfig>,
    firmware: FirmwareVersion,
    rules: FirmwareRules,
}

impl TspSession {
    /// Open `transport` and bring the instrument to a known state.
    ///
    /// Clears the execution state and drains stale errors unless
    /// [`SessionConfig::clear_on_connect`] is off, then resolves the firmware
    /// rules. The transport is closed again if any step fails.
    ///
    /// # Errors
    /// - transport failure while opening or probing
    /// - unparsable firmware revision
    pub async fn connect(
        mut transport: Box<dyn Transport>,
        config: SessionConfig,
        commands: CommandSet,
    ) -> TspResult<Self> {
        transport
            .open(&config.resource, config.model_hint.as_deref())
            .await?;
        info!(resource = %config.resource, "Instrument session opened");

        let mut session = Self {
            connection: Arc::new(Mutex::new(Connection {
                transport,
                registers: StatusRegisters::new()?,
                error_queue: DeviceErrorQueue::new(),
                service_request_enable: 0,
                standard_event_enable: 0,
                orphan_replies: 0,
            })),
            commands: Arc::new(commands),
            config: Arc::new(config),
            firmware: FirmwareVersion {
                major: 0,
                minor: 0,
                patch: 0,
            },
            rules: FirmwareRules::Legacy,
        };

        match session.initialize().await {
            Ok(()) => Ok(session),
            Err(e) => {
                warn!(error = %e, "Session initialization failed, closing transport");
                if let Err(close_err) = session.close().await {
                    warn!(error = %close_err, "Failed to close transport after init failure");
                }
                Err(e)
            }
        }
    }

    async fn initialize(&mut self) -> TspResult<()> {
        if self.config.clear_on_connect {
            self.clear_execution_state().await?;
            let residual = self.drain_error_queue().await?;
            if !residual.is_empty() {
                warn!(report = %residual.report(), "Discarded errors left over from a previous session");
            }
        } else {
            debug!("Instrument state left as found");
        }

        let controller = self.controller();
        let revision = self
            .query_value(controller, &self.commands.firmware_revision)
            .await?;
        self.firmware = FirmwareVersion::parse(&revision)?;
        self.rules = FirmwareRules::for_version(self.firmware);
        info!(firmware = %self.firmware, rules = ?self.rules, "Firmware rules resolved");
        Ok(())
    }

    /// Run `f` against a connected session and close it on every exit path.
    pub async fn scoped<F, Fut, R>(
        transport: Box<dyn Transport>,
        config: SessionConfig,
        commands: CommandSet,
        f: F,
    ) -> TspResult<R>
    where
        F: FnOnce(TspSession) -> Fut,
        Fut: Future<Output = TspResult<R>>,
    {
        let session = Self::connect(transport, config, commands).await?;
        let result = f(session.clone()).await;
        let closed = session.close().await;
        match (result, closed) {
            (Ok(value), Ok(())) => Ok(value),
            (Ok(_), Err(e)) => Err(e),
            (Err(e), Err(close_err)) => {
                warn!(error = %close_err, "Failed to close transport");
                Err(e)
            }
            (Err(e), Ok(())) => Err(e),
        }
    }

    /// Release the transport.
    pub async fn close(&self) -> TspResult<()> {
        let mut conn = self.connection.lock().await;
        if conn.transport.is_open() {
            conn.transport.close().await?;
            debug!(resource = %self.config.resource, "Instrument session closed");
        }
        Ok(())
    }

    /// Command table in use.
    pub fn commands(&self) -> &CommandSet {
        &self.commands
    }

    /// Session settings.
    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// Firmware revision read at connect time.
    pub fn firmware(&self) -> FirmwareVersion {
        self.firmware
    }

    /// Firmware rules resolved at connect time.
    pub fn rules(&self) -> FirmwareRules {
        self.rules
    }

    /// The controller node.
    pub fn controller(&self) -> NodeEntity {
        NodeEntity::controller(self.config.controller_node)
    }

    /// Node `number` on this bus.
    pub fn node(&self, number: u32) -> NodeEntity {
        NodeEntity::new(number, self.config.controller_node)
    }

    // ------------------------------------------------------------------------
    // Round trips
    // ------------------------------------------------------------------------

    fn check_length(conn: &Connection, command: &str) -> TspResult<()> {
        let max = conn.transport.capabilities().max_message_length;
        if command.len() > max {
            return Err(TspError::InvalidOperation(format!(
                "Command of {} bytes exceeds the {} byte message limit",
                command.len(),
                max
            )));
        }
        Ok(())
    }

    async fn write_locked(conn: &mut Connection, command: &str) -> TspResult<()> {
        Self::check_length(conn, command)?;
        trace!(command, "write");
        conn.transport.write_line(command).await?;
        Ok(())
    }

    /// Discard replies owed by timed-out handshakes before the next query.
    ///
    /// Best effort: a reply that never shows up within the read timeout is
    /// written off with a warning.
    async fn discard_orphans(&self, conn: &mut Connection) -> TspResult<()> {
        while conn.orphan_replies > 0 {
            conn.orphan_replies -= 1;
            match conn.transport.read_line(self.config.read_timeout()).await {
                Ok(stale) => warn!(reply = %stale.trim(), "Discarded orphaned reply"),
                Err(e) => warn!(error = %e, "Orphaned reply never arrived"),
            }
        }
        Ok(())
    }

    /// Replace the connection's error queue with a fresh drain result.
    pub(crate) async fn store_error_queue(&self, queue: DeviceErrorQueue) {
        self.connection.lock().await.error_queue = queue;
    }

    /// Errors collected by the most recent drain.
    pub async fn last_device_errors(&self) -> DeviceErrorQueue {
        self.connection.lock().await.error_queue.clone()
    }

    /// Write one command line.
    pub async fn write(&self, command: &str) -> TspResult<()> {
        let mut conn = self.connection.lock().await;
        Self::write_locked(&mut conn, command).await
    }

    /// Write several lines without letting other callers interleave.
    pub async fn write_lines(&self, lines: &[String]) -> TspResult<()> {
        let mut conn = self.connection.lock().await;
        for line in lines {
            Self::write_locked(&mut conn, line).await?;
        }
        Ok(())
    }

    /// Write `command` and read its reply.
    pub async fn query(&self, command: &str) -> TspResult<String> {
        let mut conn = self.connection.lock().await;
        self.discard_orphans(&mut conn).await?;
        Self::write_locked(&mut conn, command).await?;
        let reply = conn.transport.read_line(self.config.read_timeout()).await?;
        let reply = reply.trim().to_string();
        trace!(command, reply = %reply, "query");
        Ok(reply)
    }

    /// Execute `command` on `node`.
    pub async fn execute(&self, node: NodeEntity, command: &str) -> TspResult<()> {
        let wrapped = node.wrap(&self.commands, command)?;
        self.write(&wrapped).await
    }

    /// Evaluate `expr` on `node` and return the printed value.
    pub async fn query_value(&self, node: NodeEntity, expr: &str) -> TspResult<String> {
        let plan = node.query(&self.commands, expr)?;
        let mut conn = self.connection.lock().await;
        self.discard_orphans(&mut conn).await?;
        if let Some(setup) = &plan.setup {
            Self::write_locked(&mut conn, setup).await?;
        }
        Self::write_locked(&mut conn, &plan.query).await?;
        let reply = conn.transport.read_line(self.config.read_timeout()).await?;
        let reply = reply.trim().to_string();
        trace!(%node, expr, reply = %reply, "query value");
        Ok(reply)
    }

    /// Evaluate a boolean expression on `node`.
    pub async fn query_bool(&self, node: NodeEntity, expr: &str) -> TspResult<bool> {
        let reply = self.query_value(node, expr).await?;
        match reply.as_str() {
            "true" => Ok(true),
            "false" => Ok(false),
            other => Err(TspError::Protocol(format!(
                "Expected true/false for '{}', got '{}'",
                expr, other
            ))),
        }
    }

    /// True if `expr` evaluates to nil on `node`.
    pub async fn is_nil(&self, node: NodeEntity, expr: &str) -> TspResult<bool> {
        let test = self.commands.nil_expr(expr)?;
        self.query_bool(node, &test).await
    }

    /// Instrument identity string.
    pub async fn identity(&self) -> TspResult<String> {
        let command = self.commands.identity.clone();
        self.query(&command).await
    }

    // ------------------------------------------------------------------------
    // Registers
    // ------------------------------------------------------------------------

    /// Sample the status byte and update the cached status.
    ///
    /// The sample is bounded by the read timeout; a link that cannot answer
    /// in time is a transport error here, unlike inside a status wait.
    pub async fn read_status_byte(&self) -> TspResult<StatusByte> {
        let timeout = self.config.read_timeout();
        let mut conn = self.connection.lock().await;
        conn.sample_status(timeout).await?.ok_or_else(|| {
            TspError::Transport(anyhow::anyhow!(
                "No status byte within {:?}",
                timeout
            ))
        })
    }

    /// Read (and thereby clear) an event register.
    pub async fn read_event_register(&self, register: EventRegister) -> TspResult<u32> {
        let expr = match register {
            EventRegister::Standard => &self.commands.standard_event_register,
            EventRegister::Operation => &self.commands.operation_event_register,
            EventRegister::Questionable => &self.commands.questionable_event_register,
            EventRegister::Measurement => &self.commands.measurement_event_register,
        };
        let reply = self.query_value(self.controller(), expr).await?;
        let value = parse_register_value(&reply)?;

        let mut conn = self.connection.lock().await;
        conn.registers.record_event(register, value);
        debug!(
            ?register,
            value,
            conditions = ?conn.registers.describe_event(register, value),
            "Event register read"
        );
        Ok(value)
    }

    /// Snapshot of the register dictionaries and their cached values.
    pub async fn registers(&self) -> StatusRegisters {
        self.connection.lock().await.registers.clone()
    }

    /// Set the service request enable mask.
    pub async fn enable_service_request(&self, mask: u32) -> TspResult<()> {
        let command = self
            .commands
            .assign(&self.commands.service_request_enable, mask)?;
        let mut conn = self.connection.lock().await;
        Self::write_locked(&mut conn, &command).await?;
        conn.service_request_enable = mask;
        Ok(())
    }

    /// Set the standard event enable mask.
    pub async fn enable_standard_events(&self, mask: u32) -> TspResult<()> {
        let command = self
            .commands
            .assign(&self.commands.standard_event_enable, mask)?;
        let mut conn = self.connection.lock().await;
        Self::write_locked(&mut conn, &command).await?;
        conn.standard_event_enable = mask;
        Ok(())
    }

    /// Clear status, empty the error queue and reset the last error.
    ///
    /// Enable masks are re-applied afterwards on instruments whose clear
    /// command does not preserve them.
    pub async fn clear_execution_state(&self) -> TspResult<()> {
        let mut conn = self.connection.lock().await;
        Self::write_locked(&mut conn, &self.commands.clear_execution_state).await?;
        conn.error_queue = DeviceErrorQueue::new();

        if !self.commands.clear_preserves_enables {
            let sre = conn.service_request_enable;
            let ese = conn.standard_event_enable;
            if sre != 0 {
                let command = self
                    .commands
                    .assign(&self.commands.service_request_enable, sre)?;
                Self::write_locked(&mut conn, &command).await?;
            }
            if ese != 0 {
                let command = self
                    .commands
                    .assign(&self.commands.standard_event_enable, ese)?;
                Self::write_locked(&mut conn, &command).await?;
            }
        }
        debug!("Execution state cleared");
        Ok(())
    }

    /// Reset the instrument, wait for completion, clear and drain errors.
    pub async fn reset_known_state(&self) -> TspResult<DeviceErrorQueue> {
        let reset = self.commands.reset.clone();
        self.write(&reset).await?;
        let outcome = self
            .await_operation_completion(self.controller(), self.config.operation_timeout())
            .await?;
        if outcome.timed_out() {
            return Err(TspError::OperationTimeout {
                operation: "reset".to_string(),
                timeout: self.config.operation_timeout(),
            });
        }
        self.clear_execution_state().await?;
        self.drain_error_queue().await
    }
}

/// Parse a printed register value (`32`, `3.20000e+01`).
fn parse_register_value(reply: &str) -> TspResult<u32> {
    let trimmed = reply.trim();
    if let Ok(value) = trimmed.parse::<u32>() {
        return Ok(value);
    }
    match trimmed.parse::<f64>() {
        Ok(value) if value >= 0.0 && value <= f64::from(u32::MAX) && value.fract() == 0.0 => {
            Ok(value as u32)
        }
        _ => Err(TspError::Protocol(format!(
            "Expected a register value, got '{}'",
            reply
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_register_value() {
        assert_eq!(parse_register_value("32").unwrap(), 32);
        assert_eq!(parse_register_value(" 3.20000e+01 ").unwrap(), 32);
        assert!(parse_register_value("nil").is_err());
        assert!(parse_register_value("-1").is_err());
    }
}
