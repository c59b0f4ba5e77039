//! Identifier recycling.
//!
//! Invoked by the message store only when an insert fails on id exhaustion
//! or a duplicate key. The recycler finds the smallest unused id with a
//! single-row-limited anti-join and rebases the table's id sequence so the
//! retried insert can take it. When the live row count already saturates the
//! 32-bit signed id space there is nothing to recycle and the store is full.

use crate::sql::MessageSql;
use rusqlite::{params, Connection};
use tracing::info;
use uplink_store_engine::{StoreError, StoreResult};

pub(crate) struct IdentifierRecycler<'a> {
    sql: &'a MessageSql,
    table: &'a str,
}

impl<'a> IdentifierRecycler<'a> {
    pub(crate) fn new(sql: &'a MessageSql, table: &'a str) -> Self {
        Self { sql, table }
    }

    /// Find a free id, rebase the id sequence to it, and return it.
    pub(crate) fn recycle(&self, conn: &Connection) -> StoreResult<i64> {
        let live: i64 = conn.query_row(&self.sql.message_count, [], |row| row.get(0))?;
        if live >= i32::MAX as i64 {
            return Err(StoreError::CapacityExhausted);
        }

        let free = self.find_free_id(conn)?;
        self.rebase_sequence(conn, free)?;
        info!(free_id = free, live_rows = live, "message id sequence rebased");
        Ok(free)
    }

    /// Smallest unused id. With fewer than `i32::MAX` live rows a gap always
    /// exists, and the anti-join stops at the first one.
    fn find_free_id(&self, conn: &Connection) -> StoreResult<i64> {
        let one_taken: bool = conn.query_row(&self.sql.id_one_taken, [], |row| row.get(0))?;
        if !one_taken {
            return Ok(1);
        }
        conn.query_row(&self.sql.first_gap_id, [], |row| row.get(0))
            .map_err(Into::into)
    }

    /// Point the engine's id sequence at `free` so generation resumes there.
    fn rebase_sequence(&self, conn: &Connection, free: i64) -> StoreResult<()> {
        let updated = conn.execute(
            "UPDATE sqlite_sequence SET seq = ?1 WHERE name = ?2",
            params![free, self.table],
        )?;
        if updated == 0 {
            // The engine materializes the sequence row on first insert; make
            // sure one exists when recycling runs before that.
            conn.execute(
                "INSERT INTO sqlite_sequence (name, seq) VALUES (?2, ?1)",
                params![free, self.table],
            )?;
        }
        Ok(())
    }
}
