//! Message store operations.

use crate::recycler::IdentifierRecycler;
use crate::sql::{MessageSql, SMALL_PAYLOAD_LIMIT};
use crate::{StoredMessage, TransportToken};
use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{params, Row};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use uplink_store_engine::{StorageEngineManager, StoreError, StoreResult};

/// Durable store-and-forward queue of outbound messages.
///
/// Built on connections obtained from a [`StorageEngineManager`]; owns the
/// message table schema and its indexes. Mutating operations are
/// single-writer per logical store so identifier recycling stays consistent;
/// reads run concurrently.
pub struct MessageStore {
    engine: Arc<StorageEngineManager>,
    table: String,
    sql: Arc<MessageSql>,
    write_gate: Mutex<()>,
}

impl MessageStore {
    /// Open the store on `engine`, creating the message table and its
    /// indexes if needed.
    pub async fn open(engine: Arc<StorageEngineManager>, table: &str) -> StoreResult<Self> {
        let sql = Arc::new(MessageSql::new(table));

        let setup = Arc::clone(&sql);
        engine
            .with_connection(move |conn| {
                conn.execute_batch(&setup.create_table)?;
                for index in &setup.create_indexes {
                    conn.execute_batch(index)?;
                }
                Ok(())
            })
            .await?;

        info!(table, "message store ready");
        Ok(Self {
            engine,
            table: table.to_string(),
            sql,
            write_gate: Mutex::new(()),
        })
    }

    /// Store a new outbound message and return its id.
    ///
    /// The record starts Unpublished: `createdOn` is stamped now, the
    /// lifecycle timestamps are unset and the transport correlation id is
    /// -1. A payload shorter than 200 bytes is stored inline, larger ones
    /// out of line. On id exhaustion or a duplicate key the identifier
    /// recycler runs and the insert is retried exactly once; any other
    /// failure propagates unretried.
    pub async fn store(
        &self,
        topic: &str,
        payload: Option<&[u8]>,
        qos: i32,
        retain: bool,
        priority: i32,
    ) -> StoreResult<i32> {
        let topic = topic.trim();
        if topic.is_empty() {
            return Err(StoreError::Validation(
                "topic must not be null or empty".to_string(),
            ));
        }
        let topic = topic.to_string();
        let payload = payload.map(<[u8]>::to_vec);

        let _writer = self.write_gate.lock().await;

        match self
            .insert_message(topic.clone(), payload.clone(), qos, retain, priority)
            .await
        {
            Ok(id) if id <= i32::MAX as i64 => Ok(id as i32),
            Ok(oversized) => {
                // The engine generated an id beyond the 32-bit space:
                // discard that row, recycle, and retry once.
                warn!(id = oversized, "generated message id exceeds the id space, recycling");
                self.delete_row(oversized).await?;
                self.retry_with_recycled_id(topic, payload, qos, retain, priority)
                    .await
            }
            Err(e) if is_id_collision(&e) => {
                warn!(error = %e, "message id collision, recycling");
                self.retry_with_recycled_id(topic, payload, qos, retain, priority)
                    .await
            }
            Err(e) => Err(e),
        }
    }

    /// Fetch a message by id, payload included.
    pub async fn get(&self, id: i32) -> StoreResult<Option<StoredMessage>> {
        let statement = self.sql.get_message.clone();
        self.engine
            .with_connection(move |conn| {
                let mut stmt = conn.prepare_cached(&statement)?;
                match stmt.query_row(params![id], read_message) {
                    Ok(message) => Ok(Some(message)),
                    Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
                    Err(e) => Err(e.into()),
                }
            })
            .await
    }

    /// The next message to hand to the transport: the Unpublished record
    /// with minimal `(priority, createdOn)`.
    pub async fn get_next_message(&self) -> StoreResult<Option<StoredMessage>> {
        let statement = self.sql.get_next_message.clone();
        self.engine
            .with_connection(move |conn| {
                let mut stmt = conn.prepare_cached(&statement)?;
                match stmt.query_row([], read_message) {
                    Ok(message) => Ok(Some(message)),
                    Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
                    Err(e) => Err(e.into()),
                }
            })
            .await
    }

    /// Mark a fire-and-forget message as handed to the transport.
    pub async fn mark_as_published(&self, id: i32) -> StoreResult<()> {
        self.update_timestamp(self.sql.set_published.clone(), id)
            .await
    }

    /// Mark a confirmable message as handed to the transport, recording the
    /// transport's correlation token.
    pub async fn mark_as_published_with_token(
        &self,
        id: i32,
        token: &TransportToken,
    ) -> StoreResult<()> {
        let statement = self.sql.set_published_with_token.clone();
        let published_message_id = token.message_id;
        let session_id = token.session_id.clone();
        let now = format_timestamp(Utc::now());

        let _writer = self.write_gate.lock().await;
        self.engine
            .with_connection(move |conn| {
                conn.prepare_cached(&statement)?
                    .execute(params![now, published_message_id, session_id, id])?;
                Ok(())
            })
            .await
    }

    /// Record the remote peer's acknowledgment. Idempotent.
    pub async fn mark_as_confirmed(&self, id: i32) -> StoreResult<()> {
        self.update_timestamp(self.sql.set_confirmed.clone(), id)
            .await
    }

    /// All Unpublished messages, most urgent first. No payloads.
    pub async fn get_unpublished_messages(&self) -> StoreResult<Vec<StoredMessage>> {
        self.list_messages(self.sql.all_unpublished.clone()).await
    }

    /// All InFlight messages, most urgent first. No payloads.
    pub async fn get_in_flight_messages(&self) -> StoreResult<Vec<StoredMessage>> {
        self.list_messages(self.sql.all_in_flight.clone()).await
    }

    /// All Dropped messages, most urgent first. No payloads.
    pub async fn get_dropped_messages(&self) -> StoreResult<Vec<StoredMessage>> {
        self.list_messages(self.sql.all_dropped.clone()).await
    }

    /// Return every InFlight message to Unpublished so it is resent after a
    /// session loss. Only `publishedOn` is cleared.
    pub async fn unpublish_all_in_flight_messages(&self) -> StoreResult<()> {
        let statement = self.sql.unpublish_all_in_flight.clone();
        let _writer = self.write_gate.lock().await;
        self.engine
            .with_connection(move |conn| {
                let reset = conn.prepare_cached(&statement)?.execute([])?;
                debug!(count = reset, "in-flight messages returned to unpublished");
                Ok(())
            })
            .await
    }

    /// Abandon redelivery of every InFlight message.
    pub async fn drop_all_in_flight_messages(&self) -> StoreResult<()> {
        let statement = self.sql.drop_all_in_flight.clone();
        let now = format_timestamp(Utc::now());
        let _writer = self.write_gate.lock().await;
        self.engine
            .with_connection(move |conn| {
                let dropped = conn.prepare_cached(&statement)?.execute(params![now])?;
                debug!(count = dropped, "in-flight messages dropped");
                Ok(())
            })
            .await
    }

    /// Purge terminal records older than `max_age`.
    ///
    /// Three independent deletes, each keyed off its own timestamp: Dropped
    /// by `droppedOn`, Confirmed by `confirmedOn`, fire-and-forget Delivered
    /// by `publishedOn`. InFlight records are never touched regardless of
    /// age.
    pub async fn delete_stale_messages(&self, max_age: Duration) -> StoreResult<()> {
        let max_age = chrono::Duration::from_std(max_age)
            .map_err(|_| StoreError::Validation("purge age is out of range".to_string()))?;
        let cutoff = format_timestamp(Utc::now() - max_age);
        let sql = Arc::clone(&self.sql);

        let _writer = self.write_gate.lock().await;
        self.engine
            .with_connection(move |conn| {
                let dropped = conn
                    .prepare_cached(&sql.delete_dropped)?
                    .execute(params![cutoff])?;
                let confirmed = conn
                    .prepare_cached(&sql.delete_confirmed)?
                    .execute(params![cutoff])?;
                let delivered = conn
                    .prepare_cached(&sql.delete_delivered)?
                    .execute(params![cutoff])?;
                debug!(dropped, confirmed, delivered, "stale messages purged");
                Ok(())
            })
            .await
    }

    /// Number of stored-but-undeleted records.
    pub async fn get_message_count(&self) -> StoreResult<i64> {
        let statement = self.sql.message_count.clone();
        self.engine
            .with_connection(move |conn| {
                conn.query_row(&statement, [], |row| row.get(0))
                    .map_err(Into::into)
            })
            .await
    }

    async fn insert_message(
        &self,
        topic: String,
        payload: Option<Vec<u8>>,
        qos: i32,
        retain: bool,
        priority: i32,
    ) -> StoreResult<i64> {
        let statement = self.sql.insert.clone();
        let created_on = format_timestamp(Utc::now());
        self.engine
            .with_connection(move |conn| {
                let (small, large) = split_payload(payload);
                conn.prepare_cached(&statement)?.execute(params![
                    topic,
                    qos,
                    retain,
                    created_on,
                    Option::<String>::None, // publishedOn
                    -1,                     // publishedMessageId
                    Option::<String>::None, // confirmedOn
                    small,
                    large,
                    priority,
                    Option::<String>::None, // sessionId
                    Option::<String>::None, // droppedOn
                ])?;
                Ok(conn.last_insert_rowid())
            })
            .await
    }

    /// Run the recycler, then retry the insert exactly once on the recycled
    /// id.
    async fn retry_with_recycled_id(
        &self,
        topic: String,
        payload: Option<Vec<u8>>,
        qos: i32,
        retain: bool,
        priority: i32,
    ) -> StoreResult<i32> {
        let sql = Arc::clone(&self.sql);
        let table = self.table.clone();
        let free = self
            .engine
            .with_connection(move |conn| IdentifierRecycler::new(&sql, &table).recycle(conn))
            .await?;

        let statement = self.sql.insert_with_id.clone();
        let created_on = format_timestamp(Utc::now());
        self.engine
            .with_connection(move |conn| {
                let (small, large) = split_payload(payload);
                conn.prepare_cached(&statement)?.execute(params![
                    free,
                    topic,
                    qos,
                    retain,
                    created_on,
                    Option::<String>::None,
                    -1,
                    Option::<String>::None,
                    small,
                    large,
                    priority,
                    Option::<String>::None,
                    Option::<String>::None,
                ])?;
                Ok(())
            })
            .await?;

        Ok(free as i32)
    }

    async fn delete_row(&self, id: i64) -> StoreResult<()> {
        let statement = self.sql.delete_message.clone();
        self.engine
            .with_connection(move |conn| {
                conn.prepare_cached(&statement)?.execute(params![id])?;
                Ok(())
            })
            .await
    }

    async fn update_timestamp(&self, statement: String, id: i32) -> StoreResult<()> {
        let now = format_timestamp(Utc::now());
        let _writer = self.write_gate.lock().await;
        self.engine
            .with_connection(move |conn| {
                conn.prepare_cached(&statement)?.execute(params![now, id])?;
                Ok(())
            })
            .await
    }

    async fn list_messages(&self, statement: String) -> StoreResult<Vec<StoredMessage>> {
        self.engine
            .with_connection(move |conn| {
                let mut stmt = conn.prepare_cached(&statement)?;
                let messages = stmt
                    .query_map([], read_message_metadata)?
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(messages)
            })
            .await
    }
}

/// True for the failures the identifier recycler can repair: a primary-key
/// or unique collision, or an exhausted id sequence.
fn is_id_collision(err: &StoreError) -> bool {
    matches!(
        err.engine_code(),
        Some(code) if code == rusqlite::ffi::SQLITE_CONSTRAINT_PRIMARYKEY
            || code == rusqlite::ffi::SQLITE_CONSTRAINT_UNIQUE
            || code == rusqlite::ffi::SQLITE_FULL
    )
}

fn split_payload(payload: Option<Vec<u8>>) -> (Option<Vec<u8>>, Option<Vec<u8>>) {
    match payload {
        None => (None, None),
        Some(payload) if payload.len() < SMALL_PAYLOAD_LIMIT => (Some(payload), None),
        Some(payload) => (None, Some(payload)),
    }
}

/// Timestamps are persisted as fixed-width RFC 3339 UTC text so that string
/// ordering matches chronological ordering.
fn format_timestamp(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_timestamp(s: String) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(&s)
        .map(|at| at.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}

/// Map a full row: `id, topic, qos, retain, createdOn, publishedOn,
/// publishedMessageId, confirmedOn, smallPayload, largePayload, priority,
/// sessionId, droppedOn`.
fn read_message(row: &Row<'_>) -> rusqlite::Result<StoredMessage> {
    let small: Option<Vec<u8>> = row.get(8)?;
    let large: Option<Vec<u8>> = row.get(9)?;
    Ok(StoredMessage {
        id: row.get(0)?,
        topic: row.get(1)?,
        qos: row.get(2)?,
        retain: row.get(3)?,
        created_on: parse_timestamp(row.get::<_, String>(4)?),
        published_on: row.get::<_, Option<String>>(5)?.map(parse_timestamp),
        published_message_id: row.get(6)?,
        confirmed_on: row.get::<_, Option<String>>(7)?.map(parse_timestamp),
        payload: small.or(large),
        priority: row.get(10)?,
        session_id: row.get(11)?,
        dropped_on: row.get::<_, Option<String>>(12)?.map(parse_timestamp),
    })
}

/// Map a metadata row, which skips the payload columns.
fn read_message_metadata(row: &Row<'_>) -> rusqlite::Result<StoredMessage> {
    Ok(StoredMessage {
        id: row.get(0)?,
        topic: row.get(1)?,
        qos: row.get(2)?,
        retain: row.get(3)?,
        created_on: parse_timestamp(row.get::<_, String>(4)?),
        published_on: row.get::<_, Option<String>>(5)?.map(parse_timestamp),
        published_message_id: row.get(6)?,
        confirmed_on: row.get::<_, Option<String>>(7)?.map(parse_timestamp),
        payload: None,
        priority: row.get(8)?,
        session_id: row.get(9)?,
        dropped_on: row.get::<_, Option<String>>(10)?.map(parse_timestamp),
    })
}
