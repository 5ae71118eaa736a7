//! Flush targets for the write buffer

use async_trait::async_trait;
use sqlx::postgres::{PgPool, PgPoolOptions};
use tracing::{debug, info};

use super::db_buffer::BufferEntry;
use crate::error::{Result, SentinelError};

/// Where buffered writes go on flush.
///
/// Must be all-or-nothing: on `Err` the buffer keeps every entry and will
/// hand the same batch over again, so writes must be idempotent per key,
/// with the last write for a key winning as it does on WAL replay.
#[async_trait]
pub trait BufferSink: Send + Sync {
    async fn write_batch(&self, entries: &[BufferEntry]) -> Result<()>;
}

/// Postgres sink writing into `buffered_writes`
pub struct PostgresSink {
    pool: PgPool,
}

impl PostgresSink {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn connect(url: &str, max_connections: u32) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(url)
            .await?;
        info!(max_connections, "Connected buffer sink to Postgres");
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Create the target table if it does not exist
    pub async fn ensure_schema(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS buffered_writes (
                idempotent_key TEXT PRIMARY KEY,
                resource_type TEXT NOT NULL,
                resource_id TEXT NOT NULL,
                seq_no BIGINT,
                data JSONB NOT NULL,
                buffered_at TIMESTAMPTZ NOT NULL,
                flushed_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
            )
            "#,
        )
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

#[async_trait]
impl BufferSink for PostgresSink {
    async fn write_batch(&self, entries: &[BufferEntry]) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        for entry in entries {
            let data = serde_json::Value::Object(entry.data().clone());
            let seq_no = bigint_seq(entry)?;

            sqlx::query(
                r#"
                INSERT INTO buffered_writes (
                    idempotent_key, resource_type, resource_id, seq_no, data, buffered_at
                )
                VALUES ($1, $2, $3, $4, $5, $6)
                ON CONFLICT (idempotent_key) DO UPDATE
                SET data = EXCLUDED.data, buffered_at = EXCLUDED.buffered_at
                "#,
            )
            .bind(entry.idempotent_key())
            .bind(entry.resource_type())
            .bind(entry.resource_id())
            .bind(seq_no)
            .bind(&data)
            .bind(entry.timestamp())
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        debug!(count = entries.len(), "Wrote buffered batch to Postgres");
        Ok(())
    }
}

/// `seq_no` as a Postgres BIGINT
fn bigint_seq(entry: &BufferEntry) -> Result<Option<i64>> {
    entry
        .seq_no()
        .map(|seq| {
            i64::try_from(seq).map_err(|_| {
                SentinelError::Internal(format!(
                    "seq_no {} of {} does not fit BIGINT",
                    seq,
                    entry.idempotent_key()
                ))
            })
        })
        .transpose()
}
