//! Receives PostgreSQL logical replication changes and hands them, one
//! transaction at a time, to an application handler.
//!
//! The [`Receiver`] owns a replication slot, streams from it over a
//! dedicated replication connection, decodes the output plugin's JSON
//! documents (`wal2json` or the compact format) and periodically confirms
//! progress back to the server.

pub mod config;
pub mod error;
pub mod event_loop;
pub mod postgres;
pub mod receiver;

pub use config::Config;
pub use error::{Error, Result};
pub use event_loop::{ChangeHandler, LoopState};
pub use postgres::{ChangeEvent, ChangeKind, DecoderFormat, Lsn, RowChange};
pub use receiver::{Receiver, ReceiverSettings};
