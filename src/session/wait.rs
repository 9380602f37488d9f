//! Status wait engine
//!
//! Polls the status byte until a target bit pattern shows up or a deadline
//! passes. Running out of time is an ordinary outcome ([`WaitState::TimedOut`]);
//! only transport failures and invalid masks are errors.
//!
//! Every sample goes through the session lock, so a wait spawned as a
//! background task still serializes its reads with every other round trip.
//! The operation-complete handshake holds the lock from its write to its reply
//! read, so no other caller can take its `1` or hand it a foreign reply.
//!
//! A timeout too large to represent as a deadline means "wait until the
//! condition shows up".

use super::{Connection, TspSession};
use crate::error::{TspError, TspResult};
use crate::node::NodeEntity;
use crate::registers::{StatusByte, StatusByteBit};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, trace, warn};

/// How a wait ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitState {
    /// A bit of the set mask turned on.
    Satisfied,
    /// The deadline passed first.
    TimedOut,
    /// A bit of the clear mask turned on.
    ClearConditionRaised,
}

/// Result of a status wait.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WaitOutcome {
    /// How the wait ended.
    pub state: WaitState,
    /// Last sampled status byte.
    pub status: StatusByte,
    /// Time from the first sample to the decision.
    pub elapsed: Duration,
    /// Number of status samples taken, answered or not.
    pub samples: u32,
}

impl WaitOutcome {
    /// The deadline passed before either mask matched.
    pub fn timed_out(&self) -> bool {
        self.state == WaitState::TimedOut
    }

    /// A bit of the set mask turned on.
    pub fn satisfied(&self) -> bool {
        self.state == WaitState::Satisfied
    }
}

/// A status wait running as its own task.
pub struct StatusWaitTask {
    handle: JoinHandle<TspResult<WaitOutcome>>,
}

impl StatusWaitTask {
    /// Wait for the task to finish.
    pub async fn join(self) -> TspResult<WaitOutcome> {
        match self.handle.await {
            Ok(result) => result,
            Err(e) => Err(TspError::Transport(anyhow::Error::new(e))),
        }
    }

    /// The task has returned.
    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }
}

/// Deadline and sample bookkeeping for one wait.
struct StatusPoll {
    set: u32,
    clear: u32,
    started: Instant,
    /// `None` when the timeout does not fit in an `Instant`.
    deadline: Option<Instant>,
    samples: u32,
    last: StatusByte,
}

impl StatusPoll {
    fn new(set: u32, clear: u32, timeout: Duration, last: StatusByte) -> Self {
        let started = Instant::now();
        Self {
            set,
            clear,
            started,
            deadline: started.checked_add(timeout),
            samples: 0,
            last,
        }
    }

    fn remaining(&self) -> Duration {
        self.deadline
            .map_or(Duration::MAX, |d| d.saturating_duration_since(Instant::now()))
    }

    /// How long the next sample may take. A zero-timeout wait still gets one
    /// answered sample, bounded by `fallback`.
    fn sample_bound(&self, fallback: Duration) -> Duration {
        let remaining = self.remaining();
        if self.samples == 0 && remaining.is_zero() {
            fallback
        } else {
            remaining.min(fallback)
        }
    }

    /// Account for one sample; `Some` once the wait is decided.
    fn observe(&mut self, sample: Option<StatusByte>) -> Option<WaitOutcome> {
        self.samples += 1;
        let bits = match sample {
            Some(status) => {
                trace!(%status, samples = self.samples, "status sample");
                self.last = status;
                status.bits()
            }
            None => {
                trace!(samples = self.samples, "status sample not answered in time");
                0
            }
        };

        let state = if self.clear != 0 && bits & self.clear != 0 {
            WaitState::ClearConditionRaised
        } else if bits & self.set != 0 {
            WaitState::Satisfied
        } else if self.remaining().is_zero() {
            WaitState::TimedOut
        } else {
            return None;
        };

        let outcome = WaitOutcome {
            state,
            status: self.last,
            elapsed: self.started.elapsed(),
            samples: self.samples,
        };
        debug!(
            ?state,
            status = %outcome.status,
            elapsed = ?outcome.elapsed,
            samples = outcome.samples,
            "Status wait finished"
        );
        Some(outcome)
    }

    fn pause(&self, delay: Duration) -> Duration {
        delay.min(self.remaining())
    }
}

impl TspSession {
    /// Poll until any bit of `target` is on, or `timeout` elapses.
    ///
    /// A zero timeout samples exactly once.
    pub async fn await_bitmask(&self, target: u32, timeout: Duration) -> TspResult<WaitOutcome> {
        self.await_set_and_clear(target, 0, timeout).await
    }

    /// Like [`await_bitmask`](Self::await_bitmask) but returns early with
    /// [`WaitState::ClearConditionRaised`] if any bit of `clear` turns on.
    pub async fn await_set_and_clear(
        &self,
        set: u32,
        clear: u32,
        timeout: Duration,
    ) -> TspResult<WaitOutcome> {
        check_target(set)?;
        let delay = self.config().status_read_delay();
        let fallback = self.config().read_timeout();
        let last = self.connection.lock().await.last_status();
        let mut poll = StatusPoll::new(set, clear, timeout, last);

        loop {
            let sample = {
                let mut conn = self.connection.lock().await;
                conn.sample_status(poll.sample_bound(fallback)).await?
            };
            if let Some(outcome) = poll.observe(sample) {
                return Ok(outcome);
            }
            tokio::time::sleep(poll.pause(delay)).await;
        }
    }

    /// Run [`await_set_and_clear`](Self::await_set_and_clear) on its own task.
    pub fn spawn_await_bitmask(&self, set: u32, clear: u32, timeout: Duration) -> StatusWaitTask {
        let session = self.clone();
        StatusWaitTask {
            handle: tokio::spawn(
                async move { session.await_set_and_clear(set, clear, timeout).await },
            ),
        }
    }

    /// Issue the operation-complete handshake for `node` and wait for its reply.
    ///
    /// The connection stays locked from the handshake write to its reply read.
    /// On a timeout the reply is still owed; it is discarded before the next
    /// query or handshake.
    pub async fn await_operation_completion(
        &self,
        node: NodeEntity,
        timeout: Duration,
    ) -> TspResult<WaitOutcome> {
        let handshake = node.completion_query(self.commands())?;
        let delay = self.config().status_read_delay();
        let read_timeout = self.config().read_timeout();

        let mut conn = self.connection.lock().await;
        self.discard_orphans(&mut conn).await?;
        Self::write_locked(&mut conn, &handshake).await?;

        let mav = conn
            .registers
            .status_byte
            .bitmask(StatusByteBit::MessageAvailable)?;
        let mut poll = StatusPoll::new(mav, 0, timeout, conn.last_status());
        let outcome = poll_locked(&mut conn, &mut poll, delay, read_timeout).await?;
        if outcome.timed_out() {
            conn.orphan_replies += 1;
            warn!(%node, pending = conn.orphan_replies, "Reply abandoned after timeout");
            return Ok(outcome);
        }

        let reply = conn.transport.read_line(read_timeout).await?;
        if reply.trim() != "1" {
            return Err(TspError::Protocol(format!(
                "Expected '1' from operation-complete handshake on {}, got '{}'",
                node,
                reply.trim()
            )));
        }
        Ok(outcome)
    }

    /// Wait for completion on `node`, then fail on any drained device error.
    ///
    /// A timeout escalates to [`TspError::OperationTimeout`].
    pub async fn confirm_completion(
        &self,
        node: NodeEntity,
        context: &str,
        timeout: Duration,
    ) -> TspResult<()> {
        let outcome = self.await_operation_completion(node, timeout).await?;
        if outcome.timed_out() {
            return Err(TspError::OperationTimeout {
                operation: context.to_string(),
                timeout,
            });
        }
        self.drain_if_error_available()
            .await?
            .throw_if_error(context)
    }
}

fn check_target(set: u32) -> TspResult<()> {
    if set == 0 {
        return Err(TspError::InvalidOperation(
            "Status wait requires a non-empty target mask".to_string(),
        ));
    }
    Ok(())
}

/// Sample on an already locked connection until `poll` decides.
async fn poll_locked(
    conn: &mut Connection,
    poll: &mut StatusPoll,
    delay: Duration,
    fallback: Duration,
) -> TspResult<WaitOutcome> {
    loop {
        let sample = conn.sample_status(poll.sample_bound(fallback)).await?;
        if let Some(outcome) = poll.observe(sample) {
            return Ok(outcome);
        }
        tokio::time::sleep(poll.pause(delay)).await;
    }
}
