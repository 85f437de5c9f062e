use std::sync::Arc;
use tracing::{debug, info};

use super::connection::{Connector, ReplicationTransport};
use super::sql::{ReplicationOption, Statement, StatementRenderer};
use super::types::{Lsn, RawMessage};
use crate::Result;

/// The dedicated streaming connection of one receiver run.
///
/// Only ever touched from the event loop's task. Once closed it stays
/// closed; streaming again needs a new session.
pub struct ReplicationSession<T> {
    transport: T,
    renderer: Arc<dyn StatementRenderer>,
    slot: Option<String>,
    closed: bool,
}

impl<T: ReplicationTransport> ReplicationSession<T> {
    /// Connects a new session. Connectivity errors propagate.
    pub async fn open<C>(connector: &C, renderer: Arc<dyn StatementRenderer>) -> Result<Self>
    where
        C: Connector<Transport = T>,
    {
        let transport = connector.connect().await?;
        Ok(Self::new(transport, renderer))
    }

    pub fn new(transport: T, renderer: Arc<dyn StatementRenderer>) -> Self {
        Self {
            transport,
            renderer,
            slot: None,
            closed: false,
        }
    }

    /// Issues `START_REPLICATION` for `slot` from `start`.
    pub async fn begin(
        &mut self,
        slot: &str,
        start: Lsn,
        options: &[ReplicationOption],
    ) -> Result<()> {
        let statement = self.renderer.render(&Statement::StartReplication {
            slot,
            start,
            options,
        });

        info!(slot, lsn = %start, "Starting replication");
        self.transport.execute(&statement).await?;
        self.slot = Some(slot.to_string());
        Ok(())
    }

    pub fn slot(&self) -> Option<&str> {
        self.slot.as_deref()
    }

    pub async fn read_message(&mut self) -> Result<Option<RawMessage>> {
        self.transport.read_message().await
    }

    pub async fn wait_readable(&mut self) -> Result<()> {
        self.transport.wait_readable().await
    }

    /// Tells the server everything up to `position` is applied. The server
    /// may then recycle older WAL and will resume the slot from here.
    pub async fn send_flush(&mut self, position: Lsn) -> Result<()> {
        debug!(lsn = %position, "Flushing");
        self.transport.send_status(position).await
    }

    /// Releases the connection. Errors from an already broken connection
    /// are logged and dropped.
    pub async fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;

        if let Err(e) = self.transport.close().await {
            debug!("Ignoring error while closing replication connection: {}", e);
        }
    }
}
