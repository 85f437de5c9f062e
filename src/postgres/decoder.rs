//! Translation of logical decoding plugin output into [`ChangeEvent`]s.
//!
//! Plugins may split one transaction document over several replication
//! messages. Every decoder keeps the fragments it has seen so far and only
//! emits an event once the concatenation parses as a complete JSON document;
//! until then [`PayloadDecoder::feed`] returns `Ok(None)`.

use bytes::BytesMut;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use tracing::{debug, trace};

use super::sql::ReplicationOption;
use super::types::{ChangeEvent, ChangeKind, Record, RowChange};
use crate::{Error, Result};

/// Wire payload formats the receiver understands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DecoderFormat {
    /// wal2json format-version 1; column names on every change.
    #[default]
    Wal2Json,
    /// Compact transaction documents; column names announced once per table.
    Compact,
}

const WAL2JSON_MANAGED_OPTIONS: &[&str] =
    &["include-xids", "write-in-chunks", "add-tables", "filter-tables"];

impl DecoderFormat {
    pub fn default_plugin(&self) -> &'static str {
        match self {
            DecoderFormat::Wal2Json => "wal2json",
            DecoderFormat::Compact => "compact_json",
        }
    }

    /// Options the receiver always passes for this format, before any
    /// table filters or user options.
    pub fn base_options(&self) -> Vec<ReplicationOption> {
        match self {
            DecoderFormat::Wal2Json => vec![
                ReplicationOption::new("include-xids", "1"),
                ReplicationOption::new("write-in-chunks", "1"),
            ],
            DecoderFormat::Compact => Vec::new(),
        }
    }

    /// Builds the ordered plugin option list for `START_REPLICATION`.
    ///
    /// Fails with [`Error::Config`] when the filter or the extra options are
    /// not something this format can honor.
    pub fn plugin_options(
        &self,
        filter: &TableFilter,
        extra: &[ReplicationOption],
    ) -> Result<Vec<ReplicationOption>> {
        filter.validate()?;

        if let Some(option) = extra.iter().find(|o| o.name.trim().is_empty()) {
            return Err(Error::Config(format!(
                "Decoder option with empty name (value {:?})",
                option.value
            )));
        }

        match self {
            DecoderFormat::Wal2Json => {
                if let Some(option) = extra
                    .iter()
                    .find(|o| WAL2JSON_MANAGED_OPTIONS.contains(&o.name.as_str()))
                {
                    return Err(Error::Config(format!(
                        "Decoder option '{}' is managed by the receiver and cannot be overridden",
                        option.name
                    )));
                }

                let mut options = self.base_options();
                if !filter.include.is_empty() {
                    options.push(ReplicationOption::new("add-tables", filter.include.join(",")));
                }
                if !filter.exclude.is_empty() {
                    options.push(ReplicationOption::new(
                        "filter-tables",
                        filter.exclude.join(","),
                    ));
                }
                options.extend(extra.iter().cloned());
                Ok(options)
            }
            DecoderFormat::Compact => {
                if !filter.is_empty() {
                    return Err(Error::Config(
                        "Table include/exclude lists are not supported by the compact format"
                            .to_string(),
                    ));
                }
                let mut options = self.base_options();
                options.extend(extra.iter().cloned());
                Ok(options)
            }
        }
    }
}

impl fmt::Display for DecoderFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DecoderFormat::Wal2Json => f.write_str("wal2json"),
            DecoderFormat::Compact => f.write_str("compact"),
        }
    }
}

/// Server-side table filtering, as `schema.table` patterns (`*` allowed for
/// either side).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableFilter {
    #[serde(default)]
    pub include: Vec<String>,
    #[serde(default)]
    pub exclude: Vec<String>,
}

impl TableFilter {
    pub fn is_empty(&self) -> bool {
        self.include.is_empty() && self.exclude.is_empty()
    }

    pub fn validate(&self) -> Result<()> {
        for entry in self.include.iter().chain(self.exclude.iter()) {
            validate_table_pattern(entry)?;
        }

        if let Some(both) = self.include.iter().find(|t| self.exclude.contains(t)) {
            return Err(Error::Config(format!(
                "Table '{}' is both included and excluded",
                both
            )));
        }

        Ok(())
    }
}

fn validate_table_pattern(entry: &str) -> Result<()> {
    let malformed = |reason: &str| {
        Error::Config(format!("Malformed table pattern '{}': {}", entry, reason))
    };

    if entry.chars().any(|c| c.is_whitespace() || c == ',') {
        return Err(malformed("whitespace and commas are not allowed"));
    }

    match entry.split_once('.') {
        Some((schema, table)) if !schema.is_empty() && !table.is_empty() => {
            if table.contains('.') {
                Err(malformed("expected exactly one '.'"))
            } else {
                Ok(())
            }
        }
        _ => Err(malformed("expected schema.table")),
    }
}

/// Fragments received since the last complete document.
#[derive(Debug, Default)]
struct Accumulator {
    buffer: BytesMut,
    fragments: usize,
}

impl Accumulator {
    fn push(&mut self, bytes: &[u8]) {
        self.buffer.extend_from_slice(bytes);
        self.fragments += 1;
    }

    fn clear(&mut self) {
        self.buffer.clear();
        self.fragments = 0;
    }

    /// Parses the buffered bytes as one document of type `T`.
    fn take_document<T: DeserializeOwned>(&mut self) -> Result<Option<T>> {
        if self.buffer.iter().all(u8::is_ascii_whitespace) {
            return Ok(None);
        }

        match serde_json::from_slice::<T>(&self.buffer) {
            Ok(document) => {
                trace!(fragments = self.fragments, bytes = self.buffer.len(), "Document complete");
                self.clear();
                Ok(Some(document))
            }
            Err(e) if e.is_eof() => {
                trace!(fragments = self.fragments, "Document incomplete, waiting for more input");
                Ok(None)
            }
            Err(e) => {
                self.clear();
                Err(Error::invalid_message(format!("Malformed payload: {}", e)))
            }
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum TransactionId {
    Number(u64),
    Text(String),
}

impl fmt::Display for TransactionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransactionId::Number(n) => write!(f, "{}", n),
            TransactionId::Text(s) => f.write_str(s),
        }
    }
}

fn zip_columns(table: &str, names: &[String], values: Vec<Value>) -> Result<Record> {
    if names.len() != values.len() {
        return Err(Error::invalid_message(format!(
            "Column count mismatch for {}: {} names vs {} values",
            table,
            names.len(),
            values.len()
        )));
    }

    Ok(names.iter().cloned().zip(values).collect())
}

#[derive(Debug, Deserialize)]
struct Wal2JsonTransaction {
    xid: TransactionId,
    #[serde(default)]
    change: Vec<Wal2JsonChange>,
}

#[derive(Debug, Deserialize)]
struct Wal2JsonChange {
    kind: String,
    schema: Option<String>,
    table: Option<String>,
    #[serde(default)]
    columnnames: Vec<String>,
    #[serde(default)]
    columnvalues: Vec<Value>,
    oldkeys: Option<Wal2JsonOldKeys>,
}

#[derive(Debug, Deserialize)]
struct Wal2JsonOldKeys {
    #[serde(default)]
    keynames: Vec<String>,
    #[serde(default)]
    keyvalues: Vec<Value>,
}

/// Decoder for wal2json format-version 1 output.
#[derive(Debug, Default)]
pub struct Wal2JsonDecoder {
    accumulator: Accumulator,
}

impl Wal2JsonDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn feed(&mut self, bytes: &[u8]) -> Result<Option<ChangeEvent>> {
        self.accumulator.push(bytes);

        let Some(document) = self.accumulator.take_document::<Wal2JsonTransaction>()? else {
            return Ok(None);
        };

        let transaction_id = document.xid.to_string();
        let mut changes = Vec::with_capacity(document.change.len());

        for change in document.change {
            let kind = match change.kind.as_str() {
                "insert" => ChangeKind::Insert,
                "update" => ChangeKind::Update,
                "delete" => ChangeKind::Delete,
                other => {
                    debug!(xid = %transaction_id, kind = other, "Skipping wal2json entry");
                    continue;
                }
            };

            let table = match (change.schema, change.table) {
                (Some(schema), Some(table)) => format!("{}.{}", schema, table),
                (None, Some(table)) => table,
                (_, None) => {
                    return Err(Error::invalid_message(format!(
                        "wal2json {} entry without table in transaction {}",
                        kind, transaction_id
                    )))
                }
            };

            let key = change
                .oldkeys
                .map(|old| zip_columns(&table, &old.keynames, old.keyvalues))
                .transpose()?;

            let record = match kind {
                ChangeKind::Delete => None,
                _ => Some(zip_columns(&table, &change.columnnames, change.columnvalues)?),
            };

            changes.push(RowChange {
                kind,
                table,
                key,
                record,
            });
        }

        debug!(xid = %transaction_id, changes = changes.len(), "Decoded wal2json transaction");
        Ok(Some(ChangeEvent {
            transaction_id,
            changes,
        }))
    }
}

#[derive(Debug, Deserialize)]
struct CompactTransaction {
    xid: TransactionId,
    #[serde(default)]
    tx: Vec<CompactEntry>,
}

#[derive(Debug, Deserialize)]
struct CompactEntry {
    op: Option<String>,
    table: String,
    values: Option<Vec<Value>>,
    colnames: Option<Vec<String>>,
    oldkey: Option<Record>,
}

/// Decoder for compact transaction documents.
///
/// Column names are cached per table for the lifetime of this decoder.
#[derive(Debug, Default)]
pub struct CompactDecoder {
    accumulator: Accumulator,
    columns: HashMap<String, Vec<String>>,
}

impl CompactDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn known_columns(&self, table: &str) -> Option<&[String]> {
        self.columns.get(table).map(Vec::as_slice)
    }

    pub fn feed(&mut self, bytes: &[u8]) -> Result<Option<ChangeEvent>> {
        self.accumulator.push(bytes);

        let Some(document) = self.accumulator.take_document::<CompactTransaction>()? else {
            return Ok(None);
        };

        let transaction_id = document.xid.to_string();
        let mut changes = Vec::with_capacity(document.tx.len());

        for entry in document.tx {
            if let Some(colnames) = entry.colnames {
                trace!(table = %entry.table, columns = colnames.len(), "Caching column names");
                self.columns.insert(entry.table.clone(), colnames);
            }

            let kind = match entry.op.as_deref() {
                None => continue,
                Some("I") => ChangeKind::Insert,
                Some("U") => ChangeKind::Update,
                Some("D") => ChangeKind::Delete,
                Some(other) => {
                    return Err(Error::invalid_message(format!(
                        "Unknown change type '{}' for table {}",
                        other, entry.table
                    )))
                }
            };

            let record = match (kind, entry.values) {
                (ChangeKind::Delete, _) => None,
                (_, None) => {
                    return Err(Error::invalid_message(format!(
                        "Missing values for {} on table {}",
                        kind, entry.table
                    )))
                }
                (_, Some(values)) => {
                    let names = self.columns.get(&entry.table).ok_or_else(|| {
                        Error::invalid_message(format!(
                            "No column names announced for table {}",
                            entry.table
                        ))
                    })?;
                    Some(zip_columns(&entry.table, names, values)?)
                }
            };

            changes.push(RowChange {
                kind,
                table: entry.table,
                key: entry.oldkey,
                record,
            });
        }

        debug!(xid = %transaction_id, changes = changes.len(), "Decoded compact transaction");
        Ok(Some(ChangeEvent {
            transaction_id,
            changes,
        }))
    }
}

/// The decoder selected for a receiver, one variant per wire format.
#[derive(Debug)]
pub enum PayloadDecoder {
    Wal2Json(Wal2JsonDecoder),
    Compact(CompactDecoder),
}

impl PayloadDecoder {
    pub fn new(format: DecoderFormat) -> Self {
        match format {
            DecoderFormat::Wal2Json => PayloadDecoder::Wal2Json(Wal2JsonDecoder::new()),
            DecoderFormat::Compact => PayloadDecoder::Compact(CompactDecoder::new()),
        }
    }

    pub fn format(&self) -> DecoderFormat {
        match self {
            PayloadDecoder::Wal2Json(_) => DecoderFormat::Wal2Json,
            PayloadDecoder::Compact(_) => DecoderFormat::Compact,
        }
    }

    /// Feeds one fragment; returns an event once a document is complete.
    pub fn feed(&mut self, bytes: &[u8]) -> Result<Option<ChangeEvent>> {
        match self {
            PayloadDecoder::Wal2Json(decoder) => decoder.feed(bytes),
            PayloadDecoder::Compact(decoder) => decoder.feed(bytes),
        }
    }

    /// Number of fragments waiting for the rest of their document.
    pub fn pending_fragments(&self) -> usize {
        match self {
            PayloadDecoder::Wal2Json(decoder) => decoder.accumulator.fragments,
            PayloadDecoder::Compact(decoder) => decoder.accumulator.fragments,
        }
    }
}
