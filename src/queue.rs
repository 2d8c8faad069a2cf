//! Durable queue of outbound messages that could not be delivered.
//!
//! The store is a collaborator behind [`QueueStore`]: an append-only table
//! of `(id, payload, created_at)` rows that survives restarts.
//! [`SqliteQueue`] keeps it in the local database.
//!
//! Rows are returned oldest first. Ties on `created_at` are broken by id,
//! which the store assigns in insertion order. Writers go through a
//! [`QueueWriter`] so rows are inserted in the order messages were sent.

use std::{
    fmt,
    sync::{Arc, OnceLock},
};

use async_trait::async_trait;
use sqlx::{QueryBuilder, Sqlite, SqlitePool};
use tokio::sync::mpsc;

use crate::{
    db::{from_sql, to_sql},
    error::Result,
    util,
};

/// Most ids bound in one `DELETE` statement.
const DELETE_BATCH: usize = 500;

/// A payload waiting in the durable queue.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct QueuedMessage {
    pub id: u64,

    /// Serialized [`Envelope`](crate::protocol::Envelope).
    pub payload: String,

    /// Milliseconds since the epoch, never decreasing within one store.
    pub created_at: u64,
}

#[async_trait]
pub trait QueueStore: Send + Sync {
    /// Appends a payload and returns the id assigned to it.
    async fn enqueue(&self, payload: &str) -> Result<u64>;

    /// All queued messages, oldest first.
    async fn get_all(&self) -> Result<Vec<QueuedMessage>>;

    async fn delete_many(&self, ids: &[u64]) -> Result<()>;

    async fn count(&self) -> Result<usize>;
}

#[derive(Debug)]
struct PendingWrite {
    kind: &'static str,
    payload: String,
}

/// Appends payloads to a [`QueueStore`] in the order they are handed in.
///
/// Every clone feeds the same background task, which is spawned on the
/// first write and performs one insert at a time.
#[derive(Clone)]
pub struct QueueWriter {
    store: Arc<dyn QueueStore>,
    tx: Arc<OnceLock<mpsc::UnboundedSender<PendingWrite>>>,
}

impl QueueWriter {
    #[must_use]
    pub fn new(store: Arc<dyn QueueStore>) -> Self {
        Self {
            store,
            tx: Arc::new(OnceLock::new()),
        }
    }

    /// Queues `payload` behind every earlier write.
    ///
    /// The write is best effort: a failure is logged and the message is lost.
    pub fn enqueue(&self, kind: &'static str, payload: String) {
        let tx = self.tx.get_or_init(|| self.spawn());
        if tx.send(PendingWrite { kind, payload }).is_err() {
            warn!("{kind}: lost, queue writer stopped");
        }
    }

    fn spawn(&self) -> mpsc::UnboundedSender<PendingWrite> {
        let (tx, mut rx) = mpsc::unbounded_channel::<PendingWrite>();
        let store = Arc::clone(&self.store);

        tokio::spawn(async move {
            while let Some(PendingWrite { kind, payload }) = rx.recv().await {
                match store.enqueue(&payload).await {
                    Ok(id) => debug!("{kind}: queued as #{id}"),
                    Err(e) => warn!("{kind}: lost, could not queue message: {e}"),
                }
            }
            trace!("queue writer stopped");
        });

        tx
    }
}

impl fmt::Debug for QueueWriter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueueWriter")
            .field("running", &self.tx.get().is_some())
            .finish_non_exhaustive()
    }
}

#[derive(sqlx::FromRow)]
struct Row {
    id: i64,
    payload: String,
    created_at: i64,
}

impl TryFrom<Row> for QueuedMessage {
    type Error = crate::error::Error;

    fn try_from(row: Row) -> Result<Self> {
        Ok(Self {
            id: from_sql(row.id)?,
            payload: row.payload,
            created_at: from_sql(row.created_at)?,
        })
    }
}

/// Queue persisted in the `offline_queue` table.
#[derive(Clone, Debug)]
pub struct SqliteQueue {
    pool: SqlitePool,
}

impl SqliteQueue {
    /// Creates the queue table in `pool` unless it exists.
    ///
    /// # Errors
    ///
    /// Will return `Err` if the table cannot be created.
    pub async fn new(pool: SqlitePool) -> Result<Self> {
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS offline_queue (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                payload TEXT NOT NULL,
                created_at INTEGER NOT NULL
            )",
        )
        .execute(&pool)
        .await?;

        let queue = Self { pool };
        debug!("durable queue holds {} messages", queue.count().await?);
        Ok(queue)
    }
}

#[async_trait]
impl QueueStore for SqliteQueue {
    async fn enqueue(&self, payload: &str) -> Result<u64> {
        // Wall clocks may step back; keep creation order monotonic.
        let result = sqlx::query(
            "INSERT INTO offline_queue (payload, created_at)
             SELECT ?1, MAX(?2, COALESCE(MAX(created_at), 0)) FROM offline_queue",
        )
        .bind(payload)
        .bind(to_sql(util::now_millis())?)
        .execute(&self.pool)
        .await?;

        from_sql(result.last_insert_rowid())
    }

    async fn get_all(&self) -> Result<Vec<QueuedMessage>> {
        let rows: Vec<Row> = sqlx::query_as(
            "SELECT id, payload, created_at FROM offline_queue ORDER BY created_at, id",
        )
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(QueuedMessage::try_from).collect()
    }

    async fn delete_many(&self, ids: &[u64]) -> Result<()> {
        if ids.is_empty() {
            return Ok(());
        }

        let mut tx = self.pool.begin().await?;
        for chunk in ids.chunks(DELETE_BATCH) {
            let mut query = QueryBuilder::<Sqlite>::new("DELETE FROM offline_queue WHERE id IN (");
            let mut separated = query.separated(", ");
            for id in chunk {
                separated.push_bind(to_sql(*id)?);
            }
            separated.push_unseparated(")");
            query.build().execute(&mut *tx).await?;
        }
        tx.commit().await?;

        Ok(())
    }

    async fn count(&self) -> Result<usize> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM offline_queue")
            .fetch_one(&self.pool)
            .await?;
        Ok(usize::try_from(from_sql(count)?).unwrap_or(usize::MAX))
    }
}
