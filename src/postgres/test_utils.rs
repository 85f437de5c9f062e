//! In-memory doubles for the streaming transport and the slot catalog.

use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;

use super::connection::{Connector, ReplicationTransport};
use super::slot::{SqlExecutor, SqlRow};
use super::types::{ChangeEvent, Lsn, RawMessage};
use crate::{Error, Result};

enum Incoming {
    Message(RawMessage),
    Failure(String),
}

#[derive(Default)]
struct TransportState {
    incoming: VecDeque<Incoming>,
    executed: Vec<String>,
    flushed: Vec<Lsn>,
    close_calls: usize,
    connects: usize,
    fail_connect: bool,
    fail_execute: bool,
}

/// Shared handle onto a scripted replication stream.
#[derive(Clone, Default)]
pub struct MockStream {
    state: Arc<Mutex<TransportState>>,
    notify: Arc<Notify>,
}

impl MockStream {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, data: &str, position: u64) {
        self.state
            .lock()
            .unwrap()
            .incoming
            .push_back(Incoming::Message(RawMessage::new(data.as_bytes().to_vec(), Lsn(position))));
        self.notify.notify_one();
    }

    pub fn push_failure(&self, message: &str) {
        self.state
            .lock()
            .unwrap()
            .incoming
            .push_back(Incoming::Failure(message.to_string()));
        self.notify.notify_one();
    }

    pub fn fail_connect(&self) {
        self.state.lock().unwrap().fail_connect = true;
    }

    pub fn fail_execute(&self) {
        self.state.lock().unwrap().fail_execute = true;
    }

    pub fn executed(&self) -> Vec<String> {
        self.state.lock().unwrap().executed.clone()
    }

    pub fn flushed(&self) -> Vec<Lsn> {
        self.state.lock().unwrap().flushed.clone()
    }

    pub fn close_calls(&self) -> usize {
        self.state.lock().unwrap().close_calls
    }

    pub fn connects(&self) -> usize {
        self.state.lock().unwrap().connects
    }

    pub fn remaining(&self) -> usize {
        self.state.lock().unwrap().incoming.len()
    }

    pub fn transport(&self) -> MockTransport {
        MockTransport {
            stream: self.clone(),
        }
    }
}

pub struct MockTransport {
    stream: MockStream,
}

#[async_trait]
impl ReplicationTransport for MockTransport {
    async fn execute(&mut self, statement: &str) -> Result<()> {
        let mut state = self.stream.state.lock().unwrap();
        state.executed.push(statement.to_string());
        if state.fail_execute {
            return Err(Error::Protocol("ERROR 42704: replication slot does not exist".to_string()));
        }
        Ok(())
    }

    async fn read_message(&mut self) -> Result<Option<RawMessage>> {
        match self.stream.state.lock().unwrap().incoming.pop_front() {
            Some(Incoming::Message(message)) => Ok(Some(message)),
            Some(Incoming::Failure(message)) => Err(Error::Connection(message)),
            None => Ok(None),
        }
    }

    async fn wait_readable(&mut self) -> Result<()> {
        if self.stream.state.lock().unwrap().incoming.is_empty() {
            self.stream.notify.notified().await;
        }
        Ok(())
    }

    async fn send_status(&mut self, flushed: Lsn) -> Result<()> {
        self.stream.state.lock().unwrap().flushed.push(flushed);
        Ok(())
    }

    async fn close(&mut self) -> Result<()> {
        self.stream.state.lock().unwrap().close_calls += 1;
        Err(Error::Connection("connection already broken".to_string()))
    }
}

#[async_trait]
impl Connector for MockStream {
    type Transport = MockTransport;

    async fn connect(&self) -> Result<Self::Transport> {
        let mut state = self.state.lock().unwrap();
        state.connects += 1;
        if state.fail_connect {
            return Err(Error::Connection("connection refused".to_string()));
        }
        drop(state);
        Ok(self.transport())
    }
}

struct SlotEntry {
    plugin: String,
    confirmed_flush: Option<Lsn>,
    active_until: Option<Instant>,
}

#[derive(Default)]
struct SlotCatalog {
    slots: HashMap<String, SlotEntry>,
    status_queries: usize,
    fail_all: bool,
}

/// A `pg_replication_slots` stand-in that understands the statements
/// produced by `PostgresRenderer`.
#[derive(Clone, Default)]
pub struct InMemorySlots {
    catalog: Arc<Mutex<SlotCatalog>>,
}

impl InMemorySlots {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn slot_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.catalog.lock().unwrap().slots.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn set_active(&self, slot: &str, active: bool) {
        let until = active.then(|| Instant::now() + Duration::from_secs(86_400));
        if let Some(entry) = self.catalog.lock().unwrap().slots.get_mut(slot) {
            entry.active_until = until;
        }
    }

    /// Marks the slot active for `delay`, after which it reports inactive.
    pub fn deactivate_after(&self, slot: &str, delay: Duration) {
        if let Some(entry) = self.catalog.lock().unwrap().slots.get_mut(slot) {
            entry.active_until = Some(Instant::now() + delay);
        }
    }

    pub fn set_confirmed_flush(&self, slot: &str, lsn: Lsn) {
        if let Some(entry) = self.catalog.lock().unwrap().slots.get_mut(slot) {
            entry.confirmed_flush = Some(lsn);
        }
    }

    pub fn fail_all(&self, fail: bool) {
        self.catalog.lock().unwrap().fail_all = fail;
    }

    pub fn status_queries(&self) -> usize {
        self.catalog.lock().unwrap().status_queries
    }
}

fn literals(statement: &str) -> Vec<&str> {
    statement.split('\'').skip(1).step_by(2).collect()
}

#[async_trait]
impl SqlExecutor for InMemorySlots {
    async fn simple_query(&self, statement: &str) -> Result<Vec<SqlRow>> {
        let mut catalog = self.catalog.lock().unwrap();
        if catalog.fail_all {
            return Err(Error::Connection("connection refused".to_string()));
        }

        let args = literals(statement);
        let slot = args.first().copied().unwrap_or_default().to_string();

        if statement.starts_with("SELECT pg_create_logical_replication_slot(") {
            if catalog.slots.contains_key(&slot) {
                return Ok(Vec::new());
            }
            let plugin = args.get(1).copied().unwrap_or_default().to_string();
            catalog.slots.insert(
                slot.clone(),
                SlotEntry {
                    plugin,
                    confirmed_flush: None,
                    active_until: None,
                },
            );
            let mut row = SqlRow::new();
            row.insert("slot_name".to_string(), Some(slot));
            return Ok(vec![row]);
        }

        if statement.starts_with("SELECT plugin, restart_lsn") {
            catalog.status_queries += 1;
            let now = Instant::now();
            return Ok(catalog
                .slots
                .get(&slot)
                .map(|entry| {
                    let active = entry.active_until.map_or(false, |until| now < until);
                    let mut row = SqlRow::new();
                    row.insert("plugin".to_string(), Some(entry.plugin.clone()));
                    row.insert("restart_lsn".to_string(), None);
                    row.insert(
                        "confirmed_flush_lsn".to_string(),
                        entry.confirmed_flush.map(|lsn| lsn.to_string()),
                    );
                    row.insert(
                        "active".to_string(),
                        Some(if active { "t" } else { "f" }.to_string()),
                    );
                    row
                })
                .into_iter()
                .collect());
        }

        if statement.starts_with("SELECT pg_drop_replication_slot(") {
            let now = Instant::now();
            return match catalog.slots.get(&slot) {
                None => Err(Error::Protocol(format!(
                    "ERROR 42704: replication slot \"{}\" does not exist",
                    slot
                ))),
                Some(entry) if entry.active_until.map_or(false, |until| now < until) => {
                    Err(Error::Protocol(format!(
                        "ERROR 55006: replication slot \"{}\" is active",
                        slot
                    )))
                }
                Some(_) => {
                    catalog.slots.remove(&slot);
                    Ok(vec![SqlRow::new()])
                }
            };
        }

        Err(Error::Protocol(format!("unsupported statement: {}", statement)))
    }
}

/// Change handler that records every event it is given.
#[derive(Clone, Default)]
pub struct Recorder {
    events: Arc<Mutex<Vec<ChangeEvent>>>,
}

impl Recorder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<ChangeEvent> {
        self.events.lock().unwrap().clone()
    }

    pub fn transaction_ids(&self) -> Vec<String> {
        self.events
            .lock()
            .unwrap()
            .iter()
            .map(|event| event.transaction_id.clone())
            .collect()
    }

    pub fn handler(&self) -> impl FnMut(ChangeEvent) -> anyhow::Result<()> + Send + 'static {
        let events = Arc::clone(&self.events);
        move |event| {
            events.lock().unwrap().push(event);
            Ok(())
        }
    }
}

/// A compact-format document for transaction `xid` inserting one row.
pub fn compact_insert(xid: u32, value: &str) -> String {
    format!(
        r#"{{"xid":"{}","tx":[{{"op":"I","table":"t","colnames":["v"],"values":["{}"]}}]}}"#,
        xid, value
    )
}
