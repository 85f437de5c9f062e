use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::Error;

/// A position in the write-ahead log.
///
/// Rendered the way PostgreSQL does (`16/B374D848`). [`Lsn::ZERO`] is both the
/// beginning of the stream and the "nothing pending" marker in flush state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Lsn(pub u64);

impl Lsn {
    pub const ZERO: Lsn = Lsn(0);

    pub fn is_zero(&self) -> bool {
        self.0 == 0
    }
}

impl fmt::Display for Lsn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:X}/{:X}", self.0 >> 32, self.0 & 0xFFFF_FFFF)
    }
}

impl FromStr for Lsn {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || Error::Config(format!("Invalid LSN: {:?}", s));

        let (high, low) = s.trim().split_once('/').ok_or_else(invalid)?;
        let high = u32::from_str_radix(high, 16).map_err(|_| invalid())?;
        let low = u32::from_str_radix(low, 16).map_err(|_| invalid())?;

        Ok(Lsn(((high as u64) << 32) | low as u64))
    }
}

impl From<u64> for Lsn {
    fn from(value: u64) -> Self {
        Lsn(value)
    }
}

/// One payload delivered by the replication stream, with the WAL position
/// of the frame that carried it.
#[derive(Debug, Clone)]
pub struct RawMessage {
    pub data: Bytes,
    pub position: Lsn,
}

impl RawMessage {
    pub fn new(data: impl Into<Bytes>, position: Lsn) -> Self {
        Self {
            data: data.into(),
            position,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeKind {
    Insert,
    Update,
    Delete,
}

impl fmt::Display for ChangeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ChangeKind::Insert => "insert",
            ChangeKind::Update => "update",
            ChangeKind::Delete => "delete",
        };
        f.write_str(name)
    }
}

/// Column name to value, in column order.
pub type Record = serde_json::Map<String, serde_json::Value>;

/// A single row-level change inside a transaction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RowChange {
    pub kind: ChangeKind,
    pub table: String,
    /// Previous identifying columns, only when the plugin sent them.
    pub key: Option<Record>,
    /// New row contents; `None` for deletes.
    pub record: Option<Record>,
}

/// All row changes of one committed transaction, in commit order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChangeEvent {
    pub transaction_id: String,
    pub changes: Vec<RowChange>,
}

impl ChangeEvent {
    /// The canonical single-line JSON form.
    pub fn to_json(&self) -> crate::Result<String> {
        Ok(serde_json::to_string(self)?)
    }
}
