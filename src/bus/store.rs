//! `SQLite` implementation of the durable queue store.
//!
//! Three relations back the bus: `queue_messages` holds live messages,
//! `dead_letters` keeps terminal failures for operator inspection, and
//! `processed_messages` is the per-consumer idempotency ledger.
//!
//! ## Atomicity
//!
//! `lease`, `lease_handled`, and `lease_filtered` are each a single
//! conditional `UPDATE … RETURNING` statement, so two concurrent callers can
//! never claim the same row. Multi-statement operations (enqueue's duplicate
//! check, dead-lettering) run inside transactions.
//!
//! ## Schema evolution
//!
//! On open the store self-migrates: tables and indexes are created if absent,
//! and any recognized context column missing from an older database is added
//! with its documented default. Migrations are additive; data is never
//! rewritten.

use chrono::{DateTime, SecondsFormat, Utc};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};
use std::time::Duration;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::bus::envelope::{Message, MessageKind, QueueName, SenderRole, Taint, Urgency};
use crate::database::DatabaseConnection;
use crate::domain_types::{
    ApprovalToken, ConsumerName, LeaseId, MessageId, ScopeId, TaskId, TraceId, WorkItemId,
};
use crate::error::StoreError;
use crate::time_provider::SharedTimeProvider;

/// Default lease duration.
pub const DEFAULT_LEASE_DURATION: Duration = Duration::from_secs(60);

const ENVELOPE_COLUMNS: &str = "id, queue_name, kind, sender, trace_id, payload, created_at, \
     lease_id, lease_expires_at, attempt_count, max_attempts, scope_id, taint, task_id, \
     parent_task_id, work_item_id, approval_token, tool_allowlist, urgency";

const CREATE_QUEUE_MESSAGES: &str = r"
CREATE TABLE IF NOT EXISTS queue_messages (
    id TEXT PRIMARY KEY,
    queue_name TEXT NOT NULL,
    kind TEXT NOT NULL,
    sender TEXT NOT NULL,
    trace_id TEXT NOT NULL,
    payload TEXT NOT NULL,
    created_at TEXT NOT NULL,
    lease_id TEXT,
    lease_expires_at TEXT,
    attempt_count INTEGER NOT NULL DEFAULT 0,
    max_attempts INTEGER NOT NULL DEFAULT 5
);
";

const CREATE_DEAD_LETTERS: &str = r"
CREATE TABLE IF NOT EXISTS dead_letters (
    id TEXT PRIMARY KEY,
    queue_name TEXT NOT NULL,
    kind TEXT NOT NULL,
    sender TEXT NOT NULL,
    trace_id TEXT NOT NULL,
    payload TEXT NOT NULL,
    created_at TEXT NOT NULL,
    lease_id TEXT,
    lease_expires_at TEXT,
    attempt_count INTEGER NOT NULL DEFAULT 0,
    max_attempts INTEGER NOT NULL DEFAULT 5,
    reason TEXT NOT NULL,
    dead_lettered_at TEXT NOT NULL
);
";

const CREATE_PROCESSED_MESSAGES: &str = r"
CREATE TABLE IF NOT EXISTS processed_messages (
    consumer_name TEXT NOT NULL,
    message_id TEXT NOT NULL,
    processed_at TEXT NOT NULL,
    PRIMARY KEY (consumer_name, message_id)
);
";

const CREATE_QUEUE_FIFO_INDEX: &str = r"
CREATE INDEX IF NOT EXISTS idx_queue_messages_fifo
ON queue_messages (queue_name, created_at, id);
";

const CREATE_QUEUE_TRACE_INDEX: &str = r"
CREATE INDEX IF NOT EXISTS idx_queue_messages_trace
ON queue_messages (queue_name, trace_id, kind);
";

/// Context columns added after the base schema shipped. Each is added with
/// its documented default when missing, on both live and dead-letter tables.
const CONTEXT_COLUMNS: &[(&str, &str)] = &[
    ("scope_id", "TEXT"),
    ("taint", "TEXT"),
    ("task_id", "TEXT"),
    ("parent_task_id", "TEXT"),
    ("work_item_id", "TEXT"),
    ("approval_token", "TEXT"),
    ("tool_allowlist", "TEXT"),
    ("urgency", "TEXT NOT NULL DEFAULT 'informational'"),
];

const LEASE_ONE: &str = r"
UPDATE queue_messages
SET lease_id = ?1, lease_expires_at = ?2
WHERE id = (
    SELECT id FROM queue_messages
    WHERE queue_name = ?3
      AND (lease_id IS NULL OR lease_expires_at < ?4)
    ORDER BY created_at, id
    LIMIT 1
)
RETURNING *;
";

const LEASE_FILTERED: &str = r"
UPDATE queue_messages
SET lease_id = ?1, lease_expires_at = ?2
WHERE id = (
    SELECT id FROM queue_messages
    WHERE queue_name = ?3
      AND trace_id = ?5
      AND kind = ?6
      AND (lease_id IS NULL OR lease_expires_at < ?4)
    ORDER BY created_at, id
    LIMIT 1
)
RETURNING *;
";

const ACK_MESSAGE: &str = "DELETE FROM queue_messages WHERE id = ?;";

const NACK_MESSAGE: &str = r"
UPDATE queue_messages
SET lease_id = NULL, lease_expires_at = NULL, attempt_count = attempt_count + 1
WHERE id = ?;
";

const HEARTBEAT_MESSAGE: &str = r"
UPDATE queue_messages
SET lease_expires_at = ?1
WHERE id = ?2 AND lease_id = ?3;
";

const REQUEUE_EXPIRED: &str = r"
UPDATE queue_messages
SET lease_id = NULL, lease_expires_at = NULL
WHERE lease_expires_at IS NOT NULL AND lease_expires_at < ?1;
";

const MARK_PROCESSED: &str = r"
INSERT OR IGNORE INTO processed_messages (consumer_name, message_id, processed_at)
VALUES (?1, ?2, ?3);
";

const HAS_PROCESSED: &str = r"
SELECT 1 FROM processed_messages WHERE consumer_name = ?1 AND message_id = ?2;
";

const PENDING_COUNT: &str = "SELECT COUNT(*) FROM queue_messages WHERE queue_name = ?;";

const DEAD_LETTER_COUNT: &str = "SELECT COUNT(*) FROM dead_letters WHERE queue_name = ?;";

/// Durable FIFO queue store with lease/ack/nack semantics and a per-consumer
/// idempotency ledger.
///
/// The store is the single coordination point between consumers, managers,
/// and the bridge; it is safe for concurrent use through the pooled
/// connection.
#[derive(Clone)]
pub struct QueueStore {
    connection: DatabaseConnection,
    time: SharedTimeProvider,
}

impl QueueStore {
    /// Opens the store over an initialized connection and self-migrates the
    /// schema.
    ///
    /// # Errors
    ///
    /// Returns an error if schema creation or migration fails.
    pub async fn open(
        connection: DatabaseConnection,
        time: SharedTimeProvider,
    ) -> Result<Self, StoreError> {
        let store = Self { connection, time };
        store.migrate().await?;
        Ok(store)
    }

    fn pool(&self) -> &SqlitePool {
        self.connection.pool()
    }

    fn now(&self) -> DateTime<Utc> {
        self.time.now()
    }

    async fn migrate(&self) -> Result<(), StoreError> {
        for statement in [
            CREATE_QUEUE_MESSAGES,
            CREATE_DEAD_LETTERS,
            CREATE_PROCESSED_MESSAGES,
        ] {
            sqlx::query(statement).execute(self.pool()).await?;
        }

        for table in ["queue_messages", "dead_letters"] {
            let existing = self.column_names(table).await?;
            for (column, declaration) in CONTEXT_COLUMNS {
                if !existing.iter().any(|name| name == column) {
                    let alter = format!("ALTER TABLE {table} ADD COLUMN {column} {declaration};");
                    sqlx::query(&alter).execute(self.pool()).await?;
                    info!(table, column, "added missing context column");
                }
            }
        }

        for statement in [CREATE_QUEUE_FIFO_INDEX, CREATE_QUEUE_TRACE_INDEX] {
            sqlx::query(statement).execute(self.pool()).await?;
        }

        Ok(())
    }

    async fn column_names(&self, table: &str) -> Result<Vec<String>, StoreError> {
        let pragma = format!("PRAGMA table_info({table});");
        let rows = sqlx::query(&pragma).fetch_all(self.pool()).await?;
        Ok(rows
            .iter()
            .map(|row| row.get::<String, _>("name"))
            .collect())
    }

    /// Inserts a message. The message must already carry a destination queue
    /// and its ID must be unused across live and dead-lettered messages.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Unrouted`] when `queue_name` is unset and
    /// [`StoreError::DuplicateId`] when the ID already exists.
    #[instrument(skip(self, message), fields(message_id = %message.id, kind = %message.kind, trace_id = %message.trace_id))]
    pub async fn enqueue(&self, message: &Message) -> Result<(), StoreError> {
        let queue = message.queue_name.ok_or(StoreError::Unrouted {
            message_id: message.id,
        })?;

        let payload = serde_json::to_string(&message.payload)?;
        let allowlist = if message.tool_allowlist.is_empty() {
            None
        } else {
            Some(serde_json::to_string(&message.tool_allowlist)?)
        };

        let mut tx = self.pool().begin().await?;

        let tombstoned = sqlx::query("SELECT 1 FROM dead_letters WHERE id = ?;")
            .bind(message.id.to_string())
            .fetch_optional(&mut *tx)
            .await?;
        if tombstoned.is_some() {
            return Err(StoreError::DuplicateId {
                message_id: message.id,
            });
        }

        let insert = format!(
            "INSERT INTO queue_messages ({ENVELOPE_COLUMNS}) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?);"
        );
        let result = sqlx::query(&insert)
            .bind(message.id.to_string())
            .bind(queue.as_str())
            .bind(message.kind.as_str())
            .bind(message.sender.as_str())
            .bind(message.trace_id.to_string())
            .bind(payload)
            .bind(fmt_ts(message.created_at))
            .bind(message.lease_id.map(|lease| lease.to_string()))
            .bind(message.lease_expires_at.map(fmt_ts))
            .bind(i64::from(message.attempt_count))
            .bind(i64::from(message.max_attempts))
            .bind(message.scope_id.as_ref().map(ToString::to_string))
            .bind(message.taint.map(Taint::as_str))
            .bind(message.task_id.as_ref().map(ToString::to_string))
            .bind(message.parent_task_id.as_ref().map(ToString::to_string))
            .bind(message.work_item_id.as_ref().map(ToString::to_string))
            .bind(message.approval_token.as_ref().map(ToString::to_string))
            .bind(allowlist)
            .bind(message.urgency.as_str())
            .execute(&mut *tx)
            .await;

        match result {
            Ok(_) => {}
            Err(error) if is_unique_violation(&error) => {
                return Err(StoreError::DuplicateId {
                    message_id: message.id,
                });
            }
            Err(error) => return Err(error.into()),
        }

        tx.commit().await?;
        debug!(queue = %queue, outcome = "enqueued", "message enqueued");
        Ok(())
    }

    /// Atomically claims the oldest available message on a queue.
    ///
    /// # Errors
    ///
    /// Returns an error on database failure or a corrupt row.
    #[instrument(skip(self), fields(queue = %queue))]
    pub async fn lease(
        &self,
        queue: QueueName,
        duration: Duration,
    ) -> Result<Option<Message>, StoreError> {
        let lease_id = LeaseId::generate();
        let now = self.now();
        let expires = now + chrono_duration(duration);

        let row = sqlx::query(LEASE_ONE)
            .bind(lease_id.to_string())
            .bind(fmt_ts(expires))
            .bind(queue.as_str())
            .bind(fmt_ts(now))
            .fetch_optional(self.pool())
            .await?;

        self.leased_row(row, queue)
    }

    /// Atomically claims the oldest available message whose kind is in
    /// `kinds`. This is how consumers poll without disturbing kinds they do
    /// not handle (the bridge's `agent_response` replies in particular).
    ///
    /// # Errors
    ///
    /// Returns an error on database failure or a corrupt row.
    #[instrument(skip(self, kinds), fields(queue = %queue))]
    pub async fn lease_handled(
        &self,
        queue: QueueName,
        kinds: &[MessageKind],
        duration: Duration,
    ) -> Result<Option<Message>, StoreError> {
        if kinds.is_empty() {
            return Ok(None);
        }

        let lease_id = LeaseId::generate();
        let now = self.now();
        let expires = now + chrono_duration(duration);

        let placeholders = vec!["?"; kinds.len()].join(", ");
        let sql = format!(
            "UPDATE queue_messages \
             SET lease_id = ?, lease_expires_at = ? \
             WHERE id = ( \
                 SELECT id FROM queue_messages \
                 WHERE queue_name = ? \
                   AND (lease_id IS NULL OR lease_expires_at < ?) \
                   AND kind IN ({placeholders}) \
                 ORDER BY created_at, id \
                 LIMIT 1 \
             ) \
             RETURNING *;"
        );

        let mut query = sqlx::query(&sql)
            .bind(lease_id.to_string())
            .bind(fmt_ts(expires))
            .bind(queue.as_str())
            .bind(fmt_ts(now));
        for kind in kinds {
            query = query.bind(kind.as_str());
        }

        let row = query.fetch_optional(self.pool()).await?;
        self.leased_row(row, queue)
    }

    /// Atomically claims the oldest available message matching a trace and
    /// kind. Used for targeted reply collection; messages outside the filter
    /// are never touched, so concurrent traces cannot disturb each other.
    ///
    /// This path deliberately ignores `max_attempts`: its callers ack
    /// immediately on receipt, so attempt accounting never applies.
    ///
    /// # Errors
    ///
    /// Returns an error on database failure or a corrupt row.
    #[instrument(skip(self), fields(queue = %queue, trace_id = %trace_id, kind = %kind))]
    pub async fn lease_filtered(
        &self,
        queue: QueueName,
        trace_id: TraceId,
        kind: MessageKind,
        duration: Duration,
    ) -> Result<Option<Message>, StoreError> {
        let lease_id = LeaseId::generate();
        let now = self.now();
        let expires = now + chrono_duration(duration);

        let row = sqlx::query(LEASE_FILTERED)
            .bind(lease_id.to_string())
            .bind(fmt_ts(expires))
            .bind(queue.as_str())
            .bind(fmt_ts(now))
            .bind(trace_id.to_string())
            .bind(kind.as_str())
            .fetch_optional(self.pool())
            .await?;

        self.leased_row(row, queue)
    }

    fn leased_row(
        &self,
        row: Option<SqliteRow>,
        queue: QueueName,
    ) -> Result<Option<Message>, StoreError> {
        let Some(row) = row else {
            return Ok(None);
        };
        let message = parse_message_row(&row)?;
        debug!(
            message_id = %message.id,
            kind = %message.kind,
            queue = %queue,
            trace_id = %message.trace_id,
            attempt_count = message.attempt_count,
            outcome = "leased",
            "message leased"
        );
        Ok(Some(message))
    }

    /// Deletes a message after successful processing. Succeeds silently if
    /// the row is already gone.
    ///
    /// # Errors
    ///
    /// Returns an error on database failure.
    #[instrument(skip(self), fields(message_id = %id))]
    pub async fn ack(&self, id: MessageId) -> Result<(), StoreError> {
        let result = sqlx::query(ACK_MESSAGE)
            .bind(id.to_string())
            .execute(self.pool())
            .await?;
        debug!(
            rows = result.rows_affected(),
            outcome = "acked",
            "message acked"
        );
        Ok(())
    }

    /// Releases a lease and counts the failed attempt; the message becomes
    /// immediately eligible again.
    ///
    /// # Errors
    ///
    /// Returns an error on database failure.
    #[instrument(skip(self), fields(message_id = %id))]
    pub async fn nack(&self, id: MessageId) -> Result<(), StoreError> {
        sqlx::query(NACK_MESSAGE)
            .bind(id.to_string())
            .execute(self.pool())
            .await?;
        debug!(outcome = "nacked", "message nacked");
        Ok(())
    }

    /// Moves a message to the dead-letter table. A missing row is a silent
    /// no-op so crash-replays cannot fail here.
    ///
    /// # Errors
    ///
    /// Returns an error on database failure.
    #[instrument(skip(self), fields(message_id = %id, reason = %reason))]
    pub async fn dead_letter(&self, id: MessageId, reason: &str) -> Result<(), StoreError> {
        let mut tx = self.pool().begin().await?;

        let copy = format!(
            "INSERT INTO dead_letters ({ENVELOPE_COLUMNS}, reason, dead_lettered_at) \
             SELECT {ENVELOPE_COLUMNS}, ?, ? FROM queue_messages WHERE id = ?;"
        );
        let moved = sqlx::query(&copy)
            .bind(reason)
            .bind(fmt_ts(self.now()))
            .bind(id.to_string())
            .execute(&mut *tx)
            .await?;

        sqlx::query(ACK_MESSAGE)
            .bind(id.to_string())
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;

        if moved.rows_affected() > 0 {
            warn!(message_id = %id, reason, outcome = "dead_lettered", "message dead-lettered");
        }
        Ok(())
    }

    /// Extends a lease. Fails silently if the row is gone or the lease is no
    /// longer held by `lease_id` (lease theft protection).
    ///
    /// # Errors
    ///
    /// Returns an error on database failure.
    #[instrument(skip(self), fields(message_id = %id))]
    pub async fn heartbeat(
        &self,
        id: MessageId,
        lease_id: LeaseId,
        extend: Duration,
    ) -> Result<(), StoreError> {
        let expires = self.now() + chrono_duration(extend);
        let result = sqlx::query(HEARTBEAT_MESSAGE)
            .bind(fmt_ts(expires))
            .bind(id.to_string())
            .bind(lease_id.to_string())
            .execute(self.pool())
            .await?;
        debug!(
            extended = result.rows_affected() > 0,
            outcome = "heartbeat",
            "lease heartbeat"
        );
        Ok(())
    }

    /// Whether a consumer has already committed side effects for a message.
    ///
    /// # Errors
    ///
    /// Returns an error on database failure.
    pub async fn has_processed(
        &self,
        consumer: &ConsumerName,
        id: MessageId,
    ) -> Result<bool, StoreError> {
        let row = sqlx::query(HAS_PROCESSED)
            .bind(consumer.to_string())
            .bind(id.to_string())
            .fetch_optional(self.pool())
            .await?;
        Ok(row.is_some())
    }

    /// Records that a consumer committed side effects for a message. The
    /// ledger is append-only and the mark is insert-if-absent.
    ///
    /// # Errors
    ///
    /// Returns an error on database failure.
    #[instrument(skip(self), fields(consumer = %consumer, message_id = %id))]
    pub async fn mark_processed(
        &self,
        consumer: &ConsumerName,
        id: MessageId,
    ) -> Result<(), StoreError> {
        sqlx::query(MARK_PROCESSED)
            .bind(consumer.to_string())
            .bind(id.to_string())
            .bind(fmt_ts(self.now()))
            .execute(self.pool())
            .await?;
        Ok(())
    }

    /// Startup recovery: clears lease fields on every row whose lease has
    /// expired. Returns the number of rows released.
    ///
    /// # Errors
    ///
    /// Returns an error on database failure.
    #[instrument(skip(self))]
    pub async fn requeue_expired(&self) -> Result<u64, StoreError> {
        let result = sqlx::query(REQUEUE_EXPIRED)
            .bind(fmt_ts(self.now()))
            .execute(self.pool())
            .await?;
        let released = result.rows_affected();
        if released > 0 {
            info!(released, "requeued messages with expired leases");
        }
        Ok(released)
    }

    /// Number of live messages on a queue.
    ///
    /// # Errors
    ///
    /// Returns an error on database failure.
    pub async fn pending_count(&self, queue: QueueName) -> Result<u64, StoreError> {
        let count: i64 = sqlx::query_scalar(PENDING_COUNT)
            .bind(queue.as_str())
            .fetch_one(self.pool())
            .await?;
        Ok(u64::try_from(count).unwrap_or(0))
    }

    /// Number of dead-lettered messages originally bound for a queue.
    ///
    /// # Errors
    ///
    /// Returns an error on database failure.
    pub async fn dead_letter_count(&self, queue: QueueName) -> Result<u64, StoreError> {
        let count: i64 = sqlx::query_scalar(DEAD_LETTER_COUNT)
            .bind(queue.as_str())
            .fetch_one(self.pool())
            .await?;
        Ok(u64::try_from(count).unwrap_or(0))
    }
}

fn is_unique_violation(error: &sqlx::Error) -> bool {
    error
        .as_database_error()
        .is_some_and(|db| matches!(db.kind(), sqlx::error::ErrorKind::UniqueViolation))
}

fn chrono_duration(duration: Duration) -> chrono::Duration {
    chrono::Duration::from_std(duration).unwrap_or_else(|_| chrono::Duration::seconds(60))
}

/// Fixed-width RFC 3339 UTC; lexicographic order equals chronological order,
/// which the lease expiry comparisons rely on.
fn fmt_ts(timestamp: DateTime<Utc>) -> String {
    timestamp.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_ts(raw: &str, id: &str) -> Result<DateTime<Utc>, StoreError> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|error| StoreError::CorruptRow {
            message_id: id.to_string(),
            detail: format!("bad timestamp '{raw}': {error}"),
        })
}

fn parse_uuid(raw: &str, id: &str, field: &str) -> Result<Uuid, StoreError> {
    Uuid::parse_str(raw).map_err(|error| StoreError::CorruptRow {
        message_id: id.to_string(),
        detail: format!("bad {field} uuid '{raw}': {error}"),
    })
}

fn corrupt(id: &str, detail: impl Into<String>) -> StoreError {
    StoreError::CorruptRow {
        message_id: id.to_string(),
        detail: detail.into(),
    }
}

fn parse_message_row(row: &SqliteRow) -> Result<Message, StoreError> {
    let id_str: String = row.get("id");

    let queue_str: String = row.get("queue_name");
    let kind_str: String = row.get("kind");
    let sender_str: String = row.get("sender");
    let trace_str: String = row.get("trace_id");
    let payload_str: String = row.get("payload");
    let created_str: String = row.get("created_at");
    let lease_str: Option<String> = row.get("lease_id");
    let lease_expires_str: Option<String> = row.get("lease_expires_at");
    let attempt_count: i64 = row.get("attempt_count");
    let max_attempts: i64 = row.get("max_attempts");
    let scope_str: Option<String> = row.get("scope_id");
    let taint_str: Option<String> = row.get("taint");
    let task_str: Option<String> = row.get("task_id");
    let parent_task_str: Option<String> = row.get("parent_task_id");
    let work_item_str: Option<String> = row.get("work_item_id");
    let approval_str: Option<String> = row.get("approval_token");
    let allowlist_str: Option<String> = row.get("tool_allowlist");
    let urgency_str: String = row.get("urgency");

    let kind = MessageKind::parse(&kind_str).map_err(|e| corrupt(&id_str, e.to_string()))?;
    let queue = QueueName::parse(&queue_str).map_err(|e| corrupt(&id_str, e.to_string()))?;
    let sender = SenderRole::parse(&sender_str).map_err(|e| corrupt(&id_str, e.to_string()))?;
    let urgency = Urgency::parse(&urgency_str).map_err(|e| corrupt(&id_str, e.to_string()))?;
    let taint = taint_str
        .map(|raw| Taint::parse(&raw).map_err(|e| corrupt(&id_str, e.to_string())))
        .transpose()?;

    let payload: serde_json::Value =
        serde_json::from_str(&payload_str).map_err(|e| corrupt(&id_str, e.to_string()))?;
    let tool_allowlist: Vec<String> = match allowlist_str {
        Some(raw) => serde_json::from_str(&raw).map_err(|e| corrupt(&id_str, e.to_string()))?,
        None => Vec::new(),
    };

    let lease_id = lease_str
        .map(|raw| parse_uuid(&raw, &id_str, "lease_id").map(LeaseId::new))
        .transpose()?;
    let lease_expires_at = lease_expires_str
        .map(|raw| parse_ts(&raw, &id_str))
        .transpose()?;

    let scope_id = scope_str
        .map(|raw| ScopeId::try_new(raw).map_err(|e| corrupt(&id_str, e.to_string())))
        .transpose()?;
    let task_id = task_str
        .map(|raw| TaskId::try_new(raw).map_err(|e| corrupt(&id_str, e.to_string())))
        .transpose()?;
    let parent_task_id = parent_task_str
        .map(|raw| TaskId::try_new(raw).map_err(|e| corrupt(&id_str, e.to_string())))
        .transpose()?;
    let work_item_id = work_item_str
        .map(|raw| WorkItemId::try_new(raw).map_err(|e| corrupt(&id_str, e.to_string())))
        .transpose()?;
    let approval_token = approval_str
        .map(|raw| ApprovalToken::try_new(raw).map_err(|e| corrupt(&id_str, e.to_string())))
        .transpose()?;

    Ok(Message {
        id: MessageId::new(parse_uuid(&id_str, &id_str, "id")?),
        queue_name: Some(queue),
        kind,
        sender,
        trace_id: TraceId::new(parse_uuid(&trace_str, &id_str, "trace_id")?),
        payload,
        created_at: parse_ts(&created_str, &id_str)?,
        lease_id,
        lease_expires_at,
        attempt_count: u32::try_from(attempt_count).unwrap_or(u32::MAX),
        max_attempts: u32::try_from(max_attempts).unwrap_or(u32::MAX),
        scope_id,
        taint,
        task_id,
        parent_task_id,
        work_item_id,
        approval_token,
        tool_allowlist,
        urgency,
    })
}
