//! Rendering of slot management and streaming statements.
//!
//! The receiver never formats SQL inline; it describes what it wants as a
//! [`Statement`] and hands it to a [`StatementRenderer`]. [`PostgresRenderer`]
//! is the stock implementation.

use serde::{Deserialize, Serialize};

use super::types::Lsn;

/// A plugin option passed with `START_REPLICATION`, e.g. `"include-xids" '1'`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplicationOption {
    pub name: String,
    #[serde(default)]
    pub value: Option<String>,
}

impl ReplicationOption {
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: Some(value.into()),
        }
    }

    pub fn flag(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: None,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub enum Statement<'a> {
    /// Creates the slot unless one with the same name already exists.
    CreateSlot { slot: &'a str, plugin: &'a str },
    /// Returns `plugin`, `restart_lsn`, `confirmed_flush_lsn` and `active`.
    SlotStatus { slot: &'a str },
    DropSlot { slot: &'a str },
    StartReplication {
        slot: &'a str,
        start: Lsn,
        options: &'a [ReplicationOption],
    },
}

pub trait StatementRenderer: Send + Sync {
    fn render(&self, statement: &Statement<'_>) -> String;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct PostgresRenderer;

impl StatementRenderer for PostgresRenderer {
    fn render(&self, statement: &Statement<'_>) -> String {
        match *statement {
            Statement::CreateSlot { slot, plugin } => format!(
                "SELECT pg_create_logical_replication_slot({}, {}) \
                 WHERE NOT EXISTS (SELECT 1 FROM pg_replication_slots WHERE slot_name = {})",
                quote_literal(slot),
                quote_literal(plugin),
                quote_literal(slot)
            ),
            Statement::SlotStatus { slot } => format!(
                "SELECT plugin, restart_lsn, confirmed_flush_lsn, active \
                 FROM pg_replication_slots WHERE slot_name = {}",
                quote_literal(slot)
            ),
            Statement::DropSlot { slot } => {
                format!("SELECT pg_drop_replication_slot({})", quote_literal(slot))
            }
            Statement::StartReplication {
                slot,
                start,
                options,
            } => {
                let mut query = format!(
                    "START_REPLICATION SLOT {} LOGICAL {}",
                    quote_identifier(slot),
                    start
                );
                if !options.is_empty() {
                    let rendered: Vec<String> = options
                        .iter()
                        .map(|option| match &option.value {
                            Some(value) => {
                                format!("{} {}", quote_identifier(&option.name), quote_literal(value))
                            }
                            None => quote_identifier(&option.name),
                        })
                        .collect();
                    query.push_str(&format!(" ({})", rendered.join(", ")));
                }
                query
            }
        }
    }
}

pub fn quote_identifier(identifier: &str) -> String {
    format!("\"{}\"", identifier.replace('"', "\"\""))
}

pub fn quote_literal(literal: &str) -> String {
    format!("'{}'", literal.replace('\'', "''"))
}
