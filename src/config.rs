use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::postgres::{ConnectParams, DecoderFormat, Lsn, ReplicationOption, TableFilter};
use crate::receiver::ReceiverSettings;
use crate::{Error, Result};

const APPLICATION_NAME: &str = "pg-cdc-receiver";

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    pub postgres: PostgresConfig,
    pub slot: SlotConfig,
    #[serde(default)]
    pub replication: ReplicationConfig,
    #[serde(default)]
    pub decoder: DecoderConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct PostgresConfig {
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    pub database: String,
    pub username: String,
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SlotConfig {
    pub name: String,
    /// Output plugin; defaults to the decoder format's usual plugin.
    #[serde(default)]
    pub plugin: Option<String>,
    #[serde(default)]
    pub drop_on_exit: bool,
    #[serde(default = "default_destroy_timeout_secs")]
    pub destroy_timeout_secs: u64,
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ReplicationConfig {
    /// 0 flushes after every delivered event.
    #[serde(default = "default_flush_interval_ms")]
    pub flush_interval_ms: u64,
    #[serde(default = "default_wait_timeout_ms")]
    pub wait_timeout_ms: u64,
    #[serde(default)]
    pub start_lsn: Option<String>,
}

impl Default for ReplicationConfig {
    fn default() -> Self {
        Self {
            flush_interval_ms: default_flush_interval_ms(),
            wait_timeout_ms: default_wait_timeout_ms(),
            start_lsn: None,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct DecoderConfig {
    #[serde(default)]
    pub format: DecoderFormat,
    #[serde(default)]
    pub include_tables: Vec<String>,
    #[serde(default)]
    pub exclude_tables: Vec<String>,
    /// Extra plugin options, passed after the ones the receiver manages.
    #[serde(default)]
    pub options: Vec<ReplicationOption>,
}

impl DecoderConfig {
    pub fn table_filter(&self) -> TableFilter {
        TableFilter {
            include: self.include_tables.clone(),
            exclude: self.exclude_tables.clone(),
        }
    }
}

impl Config {
    /// Loads and validates `path`, with `PG_CDC__<SECTION>__<KEY>`
    /// environment variables taking precedence.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let settings = config::Config::builder()
            .add_source(config::File::from(path.as_ref()))
            .add_source(
                config::Environment::with_prefix("PG_CDC")
                    .prefix_separator("__")
                    .separator("__"),
            )
            .build()
            .map_err(|e| Error::Config(e.to_string()))?;

        let config: Config = settings
            .try_deserialize()
            .map_err(|e| Error::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.postgres.host.trim().is_empty() {
            return Err(Error::Config("postgres.host must not be empty".to_string()));
        }
        if self.slot.plugin.as_deref().map_or(false, |p| p.trim().is_empty()) {
            return Err(Error::Config("slot.plugin must not be empty when set".to_string()));
        }

        self.start_lsn()?;
        self.receiver_settings()?.validate()
    }

    /// The configured start position, if any.
    pub fn start_lsn(&self) -> Result<Option<Lsn>> {
        self.replication
            .start_lsn
            .as_deref()
            .map(str::parse::<Lsn>)
            .transpose()
    }

    pub fn connect_params(&self) -> ConnectParams {
        ConnectParams {
            host: self.postgres.host.clone(),
            port: self.postgres.port,
            user: self.postgres.username.clone(),
            password: self.postgres.password.clone(),
            database: self.postgres.database.clone(),
            application_name: APPLICATION_NAME.to_string(),
            connect_timeout: Duration::from_secs(self.postgres.connect_timeout_secs),
        }
    }

    pub fn receiver_settings(&self) -> Result<ReceiverSettings> {
        let format = self.decoder.format;
        let plugin_options =
            format.plugin_options(&self.decoder.table_filter(), &self.decoder.options)?;

        Ok(ReceiverSettings {
            slot_name: self.slot.name.clone(),
            plugin: self
                .slot
                .plugin
                .clone()
                .unwrap_or_else(|| format.default_plugin().to_string()),
            format,
            plugin_options,
            flush_interval: Duration::from_millis(self.replication.flush_interval_ms),
            wait_timeout: Duration::from_millis(self.replication.wait_timeout_ms),
            slot_poll_interval: Duration::from_millis(self.slot.poll_interval_ms),
        })
    }

    pub fn destroy_timeout(&self) -> Duration {
        Duration::from_secs(self.slot.destroy_timeout_secs)
    }
}

fn default_port() -> u16 {
    5432
}

fn default_connect_timeout() -> u64 {
    30
}

fn default_destroy_timeout_secs() -> u64 {
    10
}

fn default_poll_interval_ms() -> u64 {
    100
}

fn default_flush_interval_ms() -> u64 {
    10_000
}

fn default_wait_timeout_ms() -> u64 {
    1_000
}
