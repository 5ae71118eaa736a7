//! Persistence Layer
//!
//! Keeps database writes alive while the database is unreachable:
//! - Bounded write buffer with canonical-JSON sizing
//! - Line-oriented write-ahead log for crash replay
//! - Flush sinks (Postgres in production)

pub mod db_buffer;
pub mod sink;
pub mod wal;

pub use db_buffer::{BufferEntry, DbBufferConfig, DbWriteBuffer, SharedDbBuffer};
pub use sink::{BufferSink, PostgresSink};
pub use wal::{WalReplay, WriteAheadLog};
