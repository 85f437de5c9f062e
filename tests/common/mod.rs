#![allow(dead_code)]

use pg_cdc_receiver::config::{Config, DecoderConfig, PostgresConfig, ReplicationConfig, SlotConfig};
use pg_cdc_receiver::{ChangeEvent, DecoderFormat};
use std::env;
use std::sync::{Arc, Mutex};
use tokio_postgres::{Client, NoTls};

/// Get test configuration from environment variables
pub fn get_test_config(test_name: &str) -> Config {
    // Use TEST_ prefix for test environment variables
    let postgres = PostgresConfig {
        host: env::var("TEST_PG_HOST").unwrap_or_else(|_| "localhost".to_string()),
        port: env::var("TEST_PG_PORT")
            .unwrap_or_else(|_| "5432".to_string())
            .parse()
            .unwrap_or(5432),
        database: env::var("TEST_PG_DATABASE").unwrap_or_else(|_| "postgres".to_string()),
        username: env::var("TEST_PG_USERNAME").unwrap_or_else(|_| "postgres".to_string()),
        password: Some(env::var("TEST_PG_PASSWORD").unwrap_or_else(|_| "postgres".to_string())),
        connect_timeout_secs: 10,
    };

    let slot = SlotConfig {
        name: format!("test_{}_{}", test_name, std::process::id()),
        plugin: None,
        drop_on_exit: true,
        destroy_timeout_secs: 5,
        poll_interval_ms: 100,
    };

    let replication = ReplicationConfig {
        flush_interval_ms: 200, // Frequent flushes for tests
        wait_timeout_ms: 100,
        start_lsn: None,
    };

    let decoder = DecoderConfig {
        format: DecoderFormat::Wal2Json,
        include_tables: vec![format!("public.{}", table_name(test_name))],
        exclude_tables: Vec::new(),
        options: Vec::new(),
    };

    Config {
        postgres,
        slot,
        replication,
        decoder,
    }
}

pub fn table_name(test_name: &str) -> String {
    format!("cdc_{}_{}", test_name, std::process::id())
}

/// Opens a regular (non-replication) connection for driving the test.
pub async fn connect(config: &Config) -> Client {
    let pg = &config.postgres;
    let (client, connection) = tokio_postgres::connect(
        &format!(
            "host={} port={} dbname={} user={} password={}",
            pg.host,
            pg.port,
            pg.database,
            pg.username,
            pg.password.as_deref().unwrap_or_default()
        ),
        NoTls,
    )
    .await
    .unwrap();

    tokio::spawn(async move {
        if let Err(e) = connection.await {
            eprintln!("Connection error: {}", e);
        }
    });

    client
}

pub async fn create_table(client: &Client, table: &str) {
    client
        .batch_execute(&format!(
            "DROP TABLE IF EXISTS {table};
             CREATE TABLE {table} (
                 id SERIAL PRIMARY KEY,
                 name TEXT NOT NULL,
                 age INTEGER NOT NULL
             )"
        ))
        .await
        .unwrap();
}

pub async fn cleanup(client: &Client, config: &Config, table: &str) {
    client
        .execute(&format!("DROP TABLE IF EXISTS {} CASCADE", table), &[])
        .await
        .ok();
    client
        .execute(
            "SELECT pg_drop_replication_slot(slot_name) FROM pg_replication_slots WHERE slot_name = $1 AND NOT active",
            &[&config.slot.name],
        )
        .await
        .ok();
}

pub async fn slot_exists(client: &Client, slot: &str) -> bool {
    client
        .query_opt("SELECT 1 FROM pg_replication_slots WHERE slot_name = $1", &[&slot])
        .await
        .unwrap()
        .is_some()
}

/// Collects events delivered to the handler.
#[derive(Clone, Default)]
pub struct Collected {
    events: Arc<Mutex<Vec<ChangeEvent>>>,
}

impl Collected {
    pub fn handler(&self) -> impl FnMut(ChangeEvent) -> anyhow::Result<()> + Send + 'static {
        let events = Arc::clone(&self.events);
        move |event| {
            events.lock().unwrap().push(event);
            Ok(())
        }
    }

    pub fn events(&self) -> Vec<ChangeEvent> {
        self.events.lock().unwrap().clone()
    }

    pub fn change_count(&self) -> usize {
        self.events.lock().unwrap().iter().map(|e| e.changes.len()).sum()
    }
}
