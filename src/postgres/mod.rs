pub mod connection;
pub mod decoder;
pub mod replication;
pub mod slot;
pub mod sql;
pub mod types;

#[cfg(test)]
pub(crate) mod test_utils;

pub use connection::{ConnectParams, Connector, PgConnector, PgReplicationConnection, ReplicationTransport};
pub use decoder::{CompactDecoder, DecoderFormat, PayloadDecoder, TableFilter, Wal2JsonDecoder};
pub use replication::ReplicationSession;
pub use slot::{PgSlotClient, SlotManager, SlotStatus, SqlExecutor, SqlRow};
pub use sql::{PostgresRenderer, ReplicationOption, Statement, StatementRenderer};
pub use types::*;
