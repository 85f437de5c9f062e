//! The receiver facade: slot setup, one streaming run at a time, shutdown
//! and slot teardown.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{sleep, Instant};
use tracing::{debug, error, info, warn};

use crate::event_loop::{ChangeHandler, EventLoop, LoopState};
use crate::postgres::{
    Connector, DecoderFormat, Lsn, PayloadDecoder, PostgresRenderer, ReplicationOption,
    ReplicationSession, SlotManager, SqlExecutor, StatementRenderer,
};
use crate::{Error, Result};

/// Everything a [`Receiver`] needs besides its connections.
#[derive(Debug, Clone)]
pub struct ReceiverSettings {
    pub slot_name: String,
    pub plugin: String,
    pub format: DecoderFormat,
    /// Ordered options for `START_REPLICATION`, as produced by
    /// [`DecoderFormat::plugin_options`].
    pub plugin_options: Vec<ReplicationOption>,
    /// Zero flushes after every delivered event.
    pub flush_interval: Duration,
    pub wait_timeout: Duration,
    pub slot_poll_interval: Duration,
}

impl ReceiverSettings {
    /// Settings with the format's default plugin and options and stock
    /// timings.
    pub fn new(slot_name: impl Into<String>, format: DecoderFormat) -> Self {
        Self {
            slot_name: slot_name.into(),
            plugin: format.default_plugin().to_string(),
            format,
            plugin_options: format.base_options(),
            flush_interval: Duration::from_secs(10),
            wait_timeout: Duration::from_secs(1),
            slot_poll_interval: Duration::from_millis(100),
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.slot_name.trim().is_empty() {
            return Err(Error::Config("Slot name must not be empty".to_string()));
        }
        if self.plugin.trim().is_empty() {
            return Err(Error::Config("Output plugin must not be empty".to_string()));
        }
        if self.wait_timeout.is_zero() {
            return Err(Error::Config("Wait timeout must be greater than zero".to_string()));
        }
        if self.slot_poll_interval.is_zero() {
            return Err(Error::Config(
                "Slot poll interval must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }
}

/// Receives logical replication changes for one slot and hands them to an
/// application handler.
///
/// At most one streaming run is active at a time; a second `start` waits
/// until the first has closed. `stop`, `close` and `destroy` may be called
/// from any task.
pub struct Receiver<C: Connector, E> {
    settings: ReceiverSettings,
    connector: C,
    slots: SlotManager<E>,
    renderer: Arc<dyn StatementRenderer>,
    shutdown: watch::Sender<bool>,
    state: Arc<watch::Sender<LoopState>>,
    active: Mutex<Option<EventLoop<C::Transport>>>,
}

impl<C, E> Receiver<C, E>
where
    C: Connector,
    E: SqlExecutor,
{
    pub fn new(settings: ReceiverSettings, connector: C, executor: E) -> Result<Self> {
        Self::with_renderer(settings, connector, executor, Arc::new(PostgresRenderer))
    }

    pub fn with_renderer(
        settings: ReceiverSettings,
        connector: C,
        executor: E,
        renderer: Arc<dyn StatementRenderer>,
    ) -> Result<Self> {
        settings.validate()?;

        Ok(Self {
            slots: SlotManager::new(executor, Arc::clone(&renderer)),
            settings,
            connector,
            renderer,
            shutdown: watch::channel(false).0,
            state: Arc::new(watch::channel(LoopState::Idle).0),
            active: Mutex::new(None),
        })
    }

    pub fn settings(&self) -> &ReceiverSettings {
        &self.settings
    }

    pub fn slots(&self) -> &SlotManager<E> {
        &self.slots
    }

    pub fn state(&self) -> LoopState {
        *self.state.borrow()
    }

    /// Subscribes to state transitions.
    pub fn watch_state(&self) -> watch::Receiver<LoopState> {
        self.state.subscribe()
    }

    /// Streams from `position`, or from the slot's restart position when
    /// `None`, until [`stop`](Self::stop) is called or something fails.
    pub async fn start<H>(&self, position: Option<Lsn>, handler: &mut H) -> Result<()>
    where
        H: ChangeHandler + ?Sized,
    {
        let shutdown = self.arm_shutdown();
        self.run(position, handler, shutdown).await
    }

    /// Like [`start`](Self::start), on a dedicated task.
    pub fn spawn<H>(self: Arc<Self>, position: Option<Lsn>, mut handler: H) -> JoinHandle<Result<()>>
    where
        H: ChangeHandler + 'static,
        C: 'static,
        E: 'static,
    {
        // Armed before spawning so that a `stop` issued right after
        // `spawn` returns is not lost.
        let shutdown = self.arm_shutdown();
        tokio::spawn(async move { self.run(position, &mut handler, shutdown).await })
    }

    fn arm_shutdown(&self) -> watch::Receiver<bool> {
        self.shutdown.send_replace(false);
        self.shutdown.subscribe()
    }

    async fn run<H>(
        &self,
        position: Option<Lsn>,
        handler: &mut H,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<()>
    where
        H: ChangeHandler + ?Sized,
    {
        let mut active = self.active.lock().await;
        if let Some(mut previous) = active.take() {
            previous.close().await;
        }

        let slot = self.settings.slot_name.as_str();
        if self.slots.ensure_slot(slot, &self.settings.plugin).await {
            self.state.send_replace(LoopState::SlotReady);
        } else {
            warn!(slot, "Continuing without confirmed slot; START_REPLICATION will report if it is missing");
        }

        let start = match position {
            Some(lsn) => lsn,
            None => self.slots.restart_position(slot).await,
        };

        let mut session = match ReplicationSession::open(&self.connector, Arc::clone(&self.renderer)).await {
            Ok(session) => session,
            Err(e) => {
                error!(slot, "Failed to open replication connection: {}", e);
                self.state.send_replace(LoopState::Closed);
                return Err(e);
            }
        };

        if let Err(e) = session.begin(slot, start, &self.settings.plugin_options).await {
            error!(slot, lsn = %start, "Failed to start replication: {}", e);
            session.close().await;
            self.state.send_replace(LoopState::Closed);
            return Err(e);
        }

        let event_loop = active.insert(EventLoop::new(
            session,
            PayloadDecoder::new(self.settings.format),
            self.settings.flush_interval,
            self.settings.wait_timeout,
            Arc::clone(&self.state),
        ));

        event_loop.run(handler, &mut shutdown).await
    }

    /// Requests shutdown and returns immediately.
    pub fn stop(&self) {
        debug!(slot = %self.settings.slot_name, "Stop requested");
        self.shutdown.send_replace(true);
    }

    /// Requests shutdown and waits until the streaming connection is
    /// released.
    pub async fn close(&self) {
        self.stop();

        let mut active = self.active.lock().await;
        if let Some(mut event_loop) = active.take() {
            event_loop.close().await;
        }
    }

    /// Closes the receiver, waits up to `timeout` for the server to report
    /// the slot inactive, then drops it. Returns whether the drop succeeded.
    pub async fn destroy(&self, timeout: Duration) -> bool {
        self.close().await;

        let slot = self.settings.slot_name.as_str();
        let deadline = Instant::now() + timeout;
        while self.slots.is_active(slot).await {
            if Instant::now() >= deadline {
                warn!(slot, timeout_ms = timeout.as_millis() as u64, "Slot still active, dropping anyway");
                break;
            }
            sleep(self.settings.slot_poll_interval).await;
        }

        info!(slot, "Destroying replication slot");
        self.slots.drop_slot(slot).await
    }
}
