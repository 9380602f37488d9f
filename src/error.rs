//! Custom error types for the protocol engine.
//!
//! This module defines the primary error type, `TspError`, for the whole crate.
//! Using the `thiserror` crate, it provides a single, consistent failure type for
//! the few outcomes that really are failures. Expected outcomes such as a wait
//! that ran out of time are *not* errors; they are returned as values (see
//! [`crate::session::WaitOutcome`]) and escalated only by orchestration code.
//!
//! ## Error Hierarchy
//!
//! - **`Transport`**: I/O failure at the byte-stream boundary. Transports return
//!   `anyhow::Result` and the engine lifts those errors with `?`. Always fatal to
//!   the operation in flight; the engine never retries it.
//! - **`DuplicateBitmask`**, **`UnknownKey`**, **`InvalidOperation`**,
//!   **`CommandFormat`**, **`Protocol`**: programming or configuration errors.
//!   They are never caught internally.
//! - **`Device`**: an instrument-reported problem drained from its error queue,
//!   raised through [`crate::session::DeviceErrorQueue::throw_if_error`].
//! - **`OperationTimeout`**: a required condition never appeared.
//! - **`Deployment`**: the aggregated report of a failed deployment pass.
//! - **`Config`**: configuration load or validation failure.

use crate::config::ConfigError;
use crate::script::DeploymentReport;
use std::time::Duration;
use thiserror::Error;

/// Convenience alias for results using the crate error type.
pub type TspResult<T> = std::result::Result<T, TspError>;

/// Every failure the engine reports.
#[derive(Error, Debug)]
pub enum TspError {
    /// Byte-stream failure reported by the transport.
    #[error(transparent)]
    Transport(#[from] anyhow::Error),

    /// A bitmask overlaps one already registered in the dictionary.
    #[error("Bitmask 0x{bitmask:X} of '{key}' is already registered for '{existing}'")]
    DuplicateBitmask {
        /// Key being added.
        key: String,
        /// Key that already owns the bits.
        existing: String,
        /// Mask being added.
        bitmask: u32,
    },

    /// Lookup of a key the dictionary does not hold.
    #[error("Unknown bitmask key: {0}")]
    UnknownKey(String),

    /// Call made in a state that does not allow it.
    #[error("Invalid operation: {0}")]
    InvalidOperation(String),

    /// A command template could not be rendered.
    #[error("Command format error: {0}")]
    CommandFormat(String),

    /// The instrument replied with something the engine cannot interpret.
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Errors drained from the instrument after a step.
    #[error("{context}; device errors: {report}")]
    Device {
        /// Step that raised them.
        context: String,
        /// Compound error report.
        report: String,
    },

    /// A required completion never arrived.
    #[error("Timed out after {timeout:?} waiting for {operation}")]
    OperationTimeout {
        /// Step that was waiting.
        operation: String,
        /// Time allowed.
        timeout: Duration,
    },

    /// A deployment pass left scripts out of line with the manifest.
    #[error("Deployment failed: {0}")]
    Deployment(DeploymentReport),

    /// Configuration could not be loaded or validated.
    #[error(transparent)]
    Config(#[from] ConfigError),
}

impl TspError {
    /// True for the invariant-violation family, which callers should never retry.
    pub fn is_invariant_violation(&self) -> bool {
        matches!(
            self,
            TspError::DuplicateBitmask { .. }
                | TspError::UnknownKey(_)
                | TspError::InvalidOperation(_)
                | TspError::CommandFormat(_)
                | TspError::Protocol(_)
        )
    }
}
