//! The single-task loop that turns a replication stream into handler calls.
//!
//! Each iteration reads at most one message, decodes it, hands any complete
//! [`ChangeEvent`] to the handler and then decides whether to flush. When
//! nothing was buffered the loop parks on transport readiness, the shutdown
//! channel and a bounded timeout, whichever fires first.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::{sleep, Instant};
use tracing::{debug, error, info, trace, warn};

use crate::postgres::{ChangeEvent, Lsn, PayloadDecoder, RawMessage, ReplicationSession, ReplicationTransport};
use crate::{Error, Result};

/// Lifecycle of a receiver run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopState {
    Idle,
    SlotReady,
    Streaming,
    Draining,
    Closed,
}

/// Application side of the stream.
///
/// Called in order, once per event, on the loop's own task. A slow handler
/// delays flushes and shutdown by the same amount.
pub trait ChangeHandler: Send {
    fn on_change(&mut self, event: ChangeEvent) -> anyhow::Result<()>;
}

impl<F> ChangeHandler for F
where
    F: FnMut(ChangeEvent) -> anyhow::Result<()> + Send,
{
    fn on_change(&mut self, event: ChangeEvent) -> anyhow::Result<()> {
        self(event)
    }
}

/// Progress not yet acknowledged to the server.
#[derive(Debug, Clone)]
pub struct FlushState {
    last_applied: Lsn,
    last_flushed: Lsn,
    next_deadline: Instant,
}

impl FlushState {
    pub fn new(next_deadline: Instant) -> Self {
        Self {
            last_applied: Lsn::ZERO,
            last_flushed: Lsn::ZERO,
            next_deadline,
        }
    }

    /// Records that everything up to `position` reached the handler.
    /// Never moves backwards.
    pub fn advance(&mut self, position: Lsn) {
        if position > self.last_applied && position > self.last_flushed {
            self.last_applied = position;
        }
    }

    pub fn pending(&self) -> Option<Lsn> {
        (!self.last_applied.is_zero()).then_some(self.last_applied)
    }

    pub fn last_flushed(&self) -> Lsn {
        self.last_flushed
    }

    fn mark_flushed(&mut self, position: Lsn) {
        self.last_flushed = position;
        self.last_applied = Lsn::ZERO;
    }
}

pub struct EventLoop<T> {
    session: ReplicationSession<T>,
    decoder: PayloadDecoder,
    flush: FlushState,
    flush_interval: Duration,
    wait_timeout: Duration,
    state: Arc<watch::Sender<LoopState>>,
    delivered: u64,
}

impl<T: ReplicationTransport> EventLoop<T> {
    /// Wraps a session on which `begin` already succeeded.
    pub fn new(
        session: ReplicationSession<T>,
        decoder: PayloadDecoder,
        flush_interval: Duration,
        wait_timeout: Duration,
        state: Arc<watch::Sender<LoopState>>,
    ) -> Self {
        state.send_replace(LoopState::Streaming);
        debug!(
            slot = session.slot().unwrap_or_default(),
            format = %decoder.format(),
            "Streaming"
        );

        Self {
            session,
            decoder,
            flush: FlushState::new(Instant::now() + flush_interval),
            flush_interval,
            wait_timeout,
            state,
            delivered: 0,
        }
    }

    pub fn state(&self) -> LoopState {
        *self.state.borrow()
    }

    /// Number of events handed to the handler so far.
    pub fn delivered(&self) -> u64 {
        self.delivered
    }

    /// Streams until shutdown is requested or something fails, then runs the
    /// close path. Errors are returned only after the session is closed.
    pub async fn run<H>(&mut self, handler: &mut H, shutdown: &mut watch::Receiver<bool>) -> Result<()>
    where
        H: ChangeHandler + ?Sized,
    {
        let result = self.stream(handler, shutdown).await;
        if let Err(e) = &result {
            error!("Replication loop stopped: {}", e);
        }

        self.close().await;
        result
    }

    async fn stream<H>(&mut self, handler: &mut H, shutdown: &mut watch::Receiver<bool>) -> Result<()>
    where
        H: ChangeHandler + ?Sized,
    {
        if self.state() == LoopState::Closed {
            return Err(Error::Protocol("Replication session already closed".to_string()));
        }

        self.flush = FlushState::new(Instant::now() + self.flush_interval);
        let wait_timeout = self.wait_timeout;

        loop {
            if *shutdown.borrow_and_update() {
                break;
            }

            let received = match self.session.read_message().await? {
                Some(message) => {
                    self.process(message, handler)?;
                    true
                }
                None => false,
            };

            self.maybe_flush().await?;

            if received {
                continue;
            }

            tokio::select! {
                biased;
                _ = shutdown.changed() => break,
                ready = self.session.wait_readable() => ready?,
                _ = sleep(wait_timeout) => trace!("Wait timed out"),
            }
        }

        info!(delivered = self.delivered, "Shutdown requested, draining");
        self.state.send_replace(LoopState::Draining);
        Ok(())
    }

    fn process<H>(&mut self, message: RawMessage, handler: &mut H) -> Result<()>
    where
        H: ChangeHandler + ?Sized,
    {
        let Some(event) = self.decoder.feed(&message.data)? else {
            trace!(
                lsn = %message.position,
                pending = self.decoder.pending_fragments(),
                "Waiting for the rest of the document"
            );
            return Ok(());
        };

        debug!(
            lsn = %message.position,
            xid = %event.transaction_id,
            changes = event.changes.len(),
            "Delivering change event"
        );
        handler.on_change(event).map_err(Error::Handler)?;

        self.flush.advance(message.position);
        self.delivered += 1;
        Ok(())
    }

    async fn maybe_flush(&mut self) -> Result<()> {
        let now = Instant::now();
        if !self.flush_interval.is_zero() && now < self.flush.next_deadline {
            return Ok(());
        }

        if let Some(position) = self.flush.pending() {
            self.session.send_flush(position).await?;
            self.flush.mark_flushed(position);
        }
        self.flush.next_deadline = now + self.flush_interval;
        Ok(())
    }

    /// Final flush of anything pending, then releases the session. Safe to
    /// call more than once.
    pub async fn close(&mut self) {
        if self.state() == LoopState::Closed {
            return;
        }

        if let Some(position) = self.flush.pending() {
            match self.session.send_flush(position).await {
                Ok(()) => self.flush.mark_flushed(position),
                Err(e) => warn!(lsn = %position, "Final flush failed: {}", e),
            }
        }

        self.session.close().await;
        self.state.send_replace(LoopState::Closed);
        info!(
            slot = self.session.slot().unwrap_or_default(),
            last_flushed = %self.flush.last_flushed(),
            "Replication session closed"
        );
    }
}
