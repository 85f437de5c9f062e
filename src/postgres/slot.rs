//! Replication slot lifecycle.
//!
//! Every operation here is a single statement on its own short-lived
//! connection, and none of them raise: failures are logged and turned into
//! `false` or a default so that callers can repeat them freely across
//! restarts.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use tokio_postgres::{NoTls, SimpleQueryMessage};
use tracing::{debug, error, info, warn};

use super::connection::ConnectParams;
use super::sql::{Statement, StatementRenderer};
use super::types::Lsn;
use crate::Result;

/// One result row, column name to text value.
pub type SqlRow = HashMap<String, Option<String>>;

/// Executes one statement over a connection that lives only for the call.
#[async_trait]
pub trait SqlExecutor: Send + Sync {
    async fn simple_query(&self, statement: &str) -> Result<Vec<SqlRow>>;
}

/// [`SqlExecutor`] backed by `tokio-postgres`.
#[derive(Debug, Clone)]
pub struct PgSlotClient {
    config: tokio_postgres::Config,
}

impl PgSlotClient {
    pub fn new(params: &ConnectParams) -> Self {
        let mut config = tokio_postgres::Config::new();
        config
            .host(&params.host)
            .port(params.port)
            .user(&params.user)
            .dbname(&params.database)
            .application_name(&params.application_name)
            .connect_timeout(params.connect_timeout);
        if let Some(password) = &params.password {
            config.password(password);
        }

        Self { config }
    }
}

#[async_trait]
impl SqlExecutor for PgSlotClient {
    async fn simple_query(&self, statement: &str) -> Result<Vec<SqlRow>> {
        let (client, connection) = self.config.connect(NoTls).await?;

        let connection_task = tokio::spawn(async move {
            if let Err(e) = connection.await {
                error!("Connection error: {}", e);
            }
        });

        let result = client.simple_query(statement).await;
        drop(client);
        let _ = connection_task.await;

        let mut rows = Vec::new();
        for message in result? {
            if let SimpleQueryMessage::Row(row) = message {
                let mut values = SqlRow::new();
                for (index, column) in row.columns().iter().enumerate() {
                    values.insert(column.name().to_string(), row.get(index).map(str::to_string));
                }
                rows.push(values);
            }
        }

        Ok(rows)
    }
}

/// What `pg_replication_slots` reports about a slot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SlotStatus {
    pub plugin: Option<String>,
    pub restart_position: Option<Lsn>,
    pub active: bool,
}

impl SlotStatus {
    fn from_row(row: &SqlRow) -> Self {
        let text = |column: &str| row.get(column).cloned().flatten();

        let restart_position = text("confirmed_flush_lsn")
            .or_else(|| text("restart_lsn"))
            .and_then(|lsn| lsn.parse::<Lsn>().ok());

        Self {
            plugin: text("plugin"),
            restart_position,
            active: matches!(text("active").as_deref(), Some("t") | Some("true")),
        }
    }
}

pub struct SlotManager<E> {
    executor: E,
    renderer: Arc<dyn StatementRenderer>,
}

impl<E: SqlExecutor> SlotManager<E> {
    pub fn new(executor: E, renderer: Arc<dyn StatementRenderer>) -> Self {
        Self { executor, renderer }
    }

    /// Creates the slot unless it already exists. Returns whether the
    /// statement succeeded.
    pub async fn ensure_slot(&self, slot: &str, plugin: &str) -> bool {
        let statement = self.renderer.render(&Statement::CreateSlot { slot, plugin });

        match self.executor.simple_query(&statement).await {
            Ok(rows) if rows.is_empty() => {
                info!(slot, "Replication slot already exists");
                true
            }
            Ok(_) => {
                info!(slot, plugin, "Created replication slot");
                true
            }
            Err(e) => {
                warn!(slot, plugin, "Failed to create replication slot: {}", e);
                false
            }
        }
    }

    pub async fn status(&self, slot: &str) -> Option<SlotStatus> {
        let statement = self.renderer.render(&Statement::SlotStatus { slot });

        match self.executor.simple_query(&statement).await {
            Ok(rows) => rows.first().map(SlotStatus::from_row),
            Err(e) => {
                warn!(slot, "Failed to query replication slot status: {}", e);
                None
            }
        }
    }

    /// The position a new session should resume from, or [`Lsn::ZERO`] when
    /// the slot has none recorded.
    pub async fn restart_position(&self, slot: &str) -> Lsn {
        let position = self
            .status(slot)
            .await
            .and_then(|status| status.restart_position)
            .unwrap_or_default();
        debug!(slot, lsn = %position, "Resolved restart position");
        position
    }

    pub async fn is_active(&self, slot: &str) -> bool {
        self.status(slot).await.map_or(false, |status| status.active)
    }

    pub async fn drop_slot(&self, slot: &str) -> bool {
        let statement = self.renderer.render(&Statement::DropSlot { slot });

        match self.executor.simple_query(&statement).await {
            Ok(_) => {
                info!(slot, "Dropped replication slot");
                true
            }
            Err(e) => {
                warn!(slot, "Failed to drop replication slot: {}", e);
                false
            }
        }
    }
}
