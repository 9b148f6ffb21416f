//! SQLite-backed message store (sqlx).
//!
//! Every mutating operation is a single SQL statement. SQLite serializes
//! writers, so the `WHERE` clause of each `UPDATE` is evaluated against the
//! same snapshot the write applies to. In particular `claim_unowned` re-checks
//! unowned-ness inside its own `UPDATE`; ids are never read first and written
//! in a second step.
//!
//! Timestamps are stored as Unix milliseconds.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions, SqliteRow};
use sqlx::{QueryBuilder, Row, Sqlite, SqlitePool};
use std::str::FromStr;
use tracing::{debug, info};

use super::{LeasePolicy, RetryPolicy};
use crate::domain::{MessageId, MessageRecord, Payload, StoreError, WorkerId};
use crate::observability::QueueCounts;
use crate::ports::{Clock, FailureReport, IdGenerator, MessageStore, SystemClock, UlidGenerator};

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS messages (
    id                TEXT PRIMARY KEY,
    payload           TEXT NOT NULL,
    owner             TEXT NULL,
    claimed_at_ms     INTEGER NULL,
    created_at_ms     INTEGER NOT NULL,
    sent_at_ms        INTEGER NULL,
    failed_attempts   INTEGER NOT NULL DEFAULT 0,
    terminally_failed INTEGER NOT NULL DEFAULT 0
);
CREATE INDEX IF NOT EXISTS messages_owner_pending
    ON messages (owner)
    WHERE sent_at_ms IS NULL AND terminally_failed = 0;
"#;

const PENDING: &str = "sent_at_ms IS NULL AND terminally_failed = 0";

const COLUMNS: &str = "id, payload, owner, claimed_at_ms, created_at_ms, sent_at_ms, \
                       failed_attempts, terminally_failed";

/// SQLite `MessageStore`.
///
/// Cheap to clone; clones share the pool.
#[derive(Clone)]
pub struct SqliteMessageStore {
    pool: SqlitePool,
    retry_policy: RetryPolicy,
    lease_policy: LeasePolicy,
    clock: Arc<dyn Clock>,
    ids: Arc<UlidGenerator>,
}

impl SqliteMessageStore {
    /// Connect (creating the database file if needed) and ensure the schema.
    ///
    /// `url` is a sqlx SQLite URL such as `sqlite://courier.db` or `sqlite::memory:`.
    pub async fn connect(url: &str, retry_policy: RetryPolicy) -> Result<Self, StoreError> {
        let options = SqliteConnectOptions::from_str(url)?.create_if_missing(true);
        let mut pool_options = SqlitePoolOptions::new().max_connections(5);
        if url.contains(":memory:") {
            // in-memory DB は接続が閉じると消えるので 1 本を使い続ける
            pool_options = pool_options
                .max_connections(1)
                .idle_timeout(None)
                .max_lifetime(None);
        }
        let pool = pool_options.connect_with(options).await?;
        Self::from_pool(pool, retry_policy, Arc::new(SystemClock)).await
    }

    /// Wrap an existing pool and ensure the schema.
    pub async fn from_pool(
        pool: SqlitePool,
        retry_policy: RetryPolicy,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, StoreError> {
        sqlx::raw_sql(SCHEMA).execute(&pool).await?;
        let store = Self {
            pool,
            retry_policy,
            lease_policy: LeasePolicy::default(),
            ids: Arc::new(UlidGenerator::new(Arc::clone(&clock))),
            clock,
        };
        store.finalize_exhausted().await?;
        Ok(store)
    }

    /// Mark pending rows that are already out of retry budget as terminally
    /// failed. Only happens when the store is opened with a lower
    /// `max_attempts` than the rows were written under.
    async fn finalize_exhausted(&self) -> Result<u64, StoreError> {
        let result = sqlx::query(&format!(
            "UPDATE messages SET owner = NULL, claimed_at_ms = NULL, terminally_failed = 1 \
             WHERE {PENDING} AND failed_attempts >= ?1"
        ))
        .bind(i64::from(self.retry_policy.max_attempts))
        .execute(&self.pool)
        .await?;
        if result.rows_affected() > 0 {
            info!(
                count = result.rows_affected(),
                max_attempts = self.retry_policy.max_attempts,
                "finalized pending messages already over the retry budget"
            );
        }
        Ok(result.rows_affected())
    }

    pub fn with_lease_policy(mut self, lease_policy: LeasePolicy) -> Self {
        self.lease_policy = lease_policy;
        self
    }
}

fn push_id_list(qb: &mut QueryBuilder<'_, Sqlite>, ids: &[MessageId]) {
    qb.push(" AND id IN (");
    let mut separated = qb.separated(", ");
    for id in ids {
        separated.push_bind(id.as_ulid().to_string());
    }
    separated.push_unseparated(")");
}

fn parse_id(raw: &str) -> Result<MessageId, StoreError> {
    raw.parse().map_err(|e: ulid::DecodeError| StoreError::Corrupt {
        id: raw.to_string(),
        reason: e.to_string(),
    })
}

fn from_millis(id: &str, millis: i64) -> Result<DateTime<Utc>, StoreError> {
    DateTime::from_timestamp_millis(millis).ok_or_else(|| StoreError::Corrupt {
        id: id.to_string(),
        reason: format!("timestamp out of range: {millis}"),
    })
}

fn row_to_record(row: &SqliteRow) -> Result<MessageRecord, StoreError> {
    let raw_id: String = row.try_get("id")?;
    let payload: String = row.try_get("payload")?;
    let owner: Option<String> = row.try_get("owner")?;
    let claimed_at_ms: Option<i64> = row.try_get("claimed_at_ms")?;
    let created_at_ms: i64 = row.try_get("created_at_ms")?;
    let sent_at_ms: Option<i64> = row.try_get("sent_at_ms")?;
    let failed_attempts: i64 = row.try_get("failed_attempts")?;
    let terminally_failed: bool = row.try_get("terminally_failed")?;

    Ok(MessageRecord {
        id: parse_id(&raw_id)?,
        payload: serde_json::from_str::<Payload>(&payload)?,
        owner: owner.map(WorkerId::new),
        claimed_at: claimed_at_ms.map(|ms| from_millis(&raw_id, ms)).transpose()?,
        created_at: from_millis(&raw_id, created_at_ms)?,
        sent_at: sent_at_ms.map(|ms| from_millis(&raw_id, ms)).transpose()?,
        failed_attempts: u32::try_from(failed_attempts).map_err(|_| StoreError::Corrupt {
            id: raw_id.clone(),
            reason: format!("failed_attempts out of range: {failed_attempts}"),
        })?,
        terminally_failed,
    })
}

#[async_trait]
impl MessageStore for SqliteMessageStore {
    async fn enqueue(&self, payload: Payload) -> Result<MessageId, StoreError> {
        let id = self.ids.generate_message_id();
        let body = serde_json::to_string(&payload)?;

        sqlx::query(
            r#"
            INSERT INTO messages (id, payload, created_at_ms, failed_attempts, terminally_failed)
            VALUES (?1, ?2, ?3, 0, 0)
            "#,
        )
        .bind(id.as_ulid().to_string())
        .bind(body)
        .bind(self.clock.now().timestamp_millis())
        .execute(&self.pool)
        .await?;

        Ok(id)
    }

    async fn count_owned_by(&self, owner: &WorkerId) -> Result<usize, StoreError> {
        let count: i64 = sqlx::query_scalar(&format!(
            "SELECT COUNT(*) FROM messages WHERE owner = ?1 AND {PENDING}"
        ))
        .bind(owner.as_str())
        .fetch_one(&self.pool)
        .await?;
        Ok(usize::try_from(count).unwrap_or(0))
    }

    async fn claim_unowned(
        &self,
        owner: &WorkerId,
        limit: usize,
    ) -> Result<Vec<MessageId>, StoreError> {
        if limit == 0 {
            return Ok(Vec::new());
        }
        let now = self.clock.now();
        let stale_before = self.lease_policy.stale_before(now).map(|t| t.timestamp_millis());

        let rows: Vec<String> = sqlx::query_scalar(&format!(
            r#"
            UPDATE messages
            SET owner = ?1, claimed_at_ms = ?2
            WHERE id IN (
                SELECT id FROM messages
                WHERE {PENDING}
                  AND failed_attempts < ?5
                  AND (owner IS NULL OR (?3 IS NOT NULL AND claimed_at_ms < ?3))
                LIMIT ?4
            )
            RETURNING id
            "#
        ))
        .bind(owner.as_str())
        .bind(now.timestamp_millis())
        .bind(stale_before)
        .bind(i64::try_from(limit).unwrap_or(i64::MAX))
        .bind(i64::from(self.retry_policy.max_attempts))
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(|raw| parse_id(raw)).collect()
    }

    async fn fetch_owned_by(
        &self,
        owner: &WorkerId,
        limit: usize,
    ) -> Result<Vec<MessageRecord>, StoreError> {
        let rows = sqlx::query(&format!(
            "SELECT {COLUMNS} FROM messages WHERE owner = ?1 AND {PENDING} LIMIT ?2"
        ))
        .bind(owner.as_str())
        .bind(i64::try_from(limit).unwrap_or(i64::MAX))
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(row_to_record).collect()
    }

    async fn record_sent(&self, owner: &WorkerId, ids: &[MessageId]) -> Result<u64, StoreError> {
        if ids.is_empty() {
            return Ok(0);
        }
        let mut qb = QueryBuilder::<Sqlite>::new(
            "UPDATE messages SET owner = NULL, claimed_at_ms = NULL, sent_at_ms = ",
        );
        qb.push_bind(self.clock.now().timestamp_millis());
        qb.push(" WHERE owner = ");
        qb.push_bind(owner.as_str().to_string());
        qb.push(format!(" AND {PENDING}"));
        push_id_list(&mut qb, ids);

        let result = qb.build().execute(&self.pool).await?;
        debug!(owner = %owner, updated = result.rows_affected(), "recorded sent");
        Ok(result.rows_affected())
    }

    async fn record_failed(
        &self,
        owner: &WorkerId,
        ids: &[MessageId],
    ) -> Result<FailureReport, StoreError> {
        let mut report = FailureReport::default();
        if ids.is_empty() {
            return Ok(report);
        }
        let max_attempts = i64::from(self.retry_policy.max_attempts);

        // SET 句の右辺は更新前の値で評価される
        let mut qb = QueryBuilder::<Sqlite>::new(
            "UPDATE messages SET owner = NULL, claimed_at_ms = NULL, \
             failed_attempts = failed_attempts + 1, \
             terminally_failed = CASE WHEN failed_attempts + 1 >= ",
        );
        qb.push_bind(max_attempts);
        qb.push(" THEN 1 ELSE 0 END WHERE owner = ");
        qb.push_bind(owner.as_str().to_string());
        qb.push(format!(" AND {PENDING}"));
        push_id_list(&mut qb, ids);
        qb.push(" RETURNING id, terminally_failed");

        let rows = qb.build().fetch_all(&self.pool).await?;
        for row in rows {
            let raw: String = row.try_get("id")?;
            let exhausted: bool = row.try_get("terminally_failed")?;
            let id = parse_id(&raw)?;
            if exhausted {
                report.exhausted.push(id);
            } else {
                report.retried.push(id);
            }
        }
        Ok(report)
    }

    async fn get(&self, id: MessageId) -> Result<Option<MessageRecord>, StoreError> {
        let row = sqlx::query(&format!("SELECT {COLUMNS} FROM messages WHERE id = ?1"))
            .bind(id.as_ulid().to_string())
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(row_to_record).transpose()
    }

    async fn release_owned_by(&self, owner: &WorkerId) -> Result<u64, StoreError> {
        let result = sqlx::query(&format!(
            "UPDATE messages SET owner = NULL, claimed_at_ms = NULL WHERE owner = ?1 AND {PENDING}"
        ))
        .bind(owner.as_str())
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    async fn counts(&self) -> Result<QueueCounts, StoreError> {
        let row = sqlx::query(&format!(
            r#"
            SELECT
                COALESCE(SUM(CASE WHEN {PENDING} AND owner IS NULL THEN 1 ELSE 0 END), 0) AS pending,
                COALESCE(SUM(CASE WHEN {PENDING} AND owner IS NOT NULL THEN 1 ELSE 0 END), 0) AS claimed,
                COALESCE(SUM(CASE WHEN sent_at_ms IS NOT NULL THEN 1 ELSE 0 END), 0) AS sent,
                COALESCE(SUM(CASE WHEN sent_at_ms IS NULL AND terminally_failed = 1 THEN 1 ELSE 0 END), 0)
                    AS terminally_failed
            FROM messages
            "#
        ))
        .fetch_one(&self.pool)
        .await?;

        let get = |col: &str| -> Result<usize, StoreError> {
            let n: i64 = row.try_get(col)?;
            Ok(usize::try_from(n).unwrap_or(0))
        };
        Ok(QueueCounts {
            pending: get("pending")?,
            claimed: get("claimed")?,
            sent: get("sent")?,
            terminally_failed: get("terminally_failed")?,
        })
    }
}
