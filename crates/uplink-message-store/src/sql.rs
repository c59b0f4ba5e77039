//! Statement set for one message table.
//!
//! All statements are built once per store against the sanitized table name;
//! the table name is the only identifier that ever reaches statement text,
//! and it is always quoted with embedded quotes doubled.

/// Payloads below this size are stored inline in `smallPayload`; anything
/// larger goes to the out-of-line `largePayload` column.
pub(crate) const SMALL_PAYLOAD_LIMIT: usize = 200;

const MESSAGE_COLUMNS: &str = "id, topic, qos, retain, createdOn, publishedOn, \
     publishedMessageId, confirmedOn, smallPayload, largePayload, priority, sessionId, droppedOn";

const METADATA_COLUMNS: &str = "id, topic, qos, retain, createdOn, publishedOn, \
     publishedMessageId, confirmedOn, priority, sessionId, droppedOn";

pub(crate) struct MessageSql {
    pub(crate) create_table: String,
    pub(crate) create_indexes: [String; 4],
    pub(crate) message_count: String,
    pub(crate) insert: String,
    pub(crate) insert_with_id: String,
    pub(crate) delete_message: String,
    pub(crate) get_message: String,
    pub(crate) get_next_message: String,
    pub(crate) set_published_with_token: String,
    pub(crate) set_published: String,
    pub(crate) set_confirmed: String,
    pub(crate) all_unpublished: String,
    pub(crate) all_in_flight: String,
    pub(crate) all_dropped: String,
    pub(crate) unpublish_all_in_flight: String,
    pub(crate) drop_all_in_flight: String,
    pub(crate) delete_dropped: String,
    pub(crate) delete_confirmed: String,
    pub(crate) delete_delivered: String,
    pub(crate) id_one_taken: String,
    pub(crate) first_gap_id: String,
}

impl MessageSql {
    pub(crate) fn new(table: &str) -> Self {
        let t = sanitize_identifier(table);

        Self {
            create_table: format!(
                "CREATE TABLE IF NOT EXISTS {t} (id INTEGER PRIMARY KEY AUTOINCREMENT, \
                 topic TEXT NOT NULL, qos INTEGER, retain INTEGER, createdOn TEXT, \
                 publishedOn TEXT, publishedMessageId INTEGER, confirmedOn TEXT, \
                 smallPayload BLOB, largePayload BLOB, priority INTEGER, sessionId TEXT, \
                 droppedOn TEXT);"
            ),
            create_indexes: [
                format!(
                    "CREATE INDEX IF NOT EXISTS {} ON {t} (publishedOn ASC, priority ASC, createdOn ASC, qos);",
                    sanitize_identifier(&format!("{table}_nextMsg"))
                ),
                format!(
                    "CREATE INDEX IF NOT EXISTS {} ON {t} (publishedOn DESC);",
                    sanitize_identifier(&format!("{table}_publishedOn"))
                ),
                format!(
                    "CREATE INDEX IF NOT EXISTS {} ON {t} (confirmedOn DESC);",
                    sanitize_identifier(&format!("{table}_confirmedOn"))
                ),
                format!(
                    "CREATE INDEX IF NOT EXISTS {} ON {t} (droppedOn DESC);",
                    sanitize_identifier(&format!("{table}_droppedOn"))
                ),
            ],
            message_count: format!("SELECT COUNT(*) FROM {t};"),
            insert: format!(
                "INSERT INTO {t} (topic, qos, retain, createdOn, publishedOn, publishedMessageId, \
                 confirmedOn, smallPayload, largePayload, priority, sessionId, droppedOn) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12);"
            ),
            insert_with_id: format!(
                "INSERT INTO {t} (id, topic, qos, retain, createdOn, publishedOn, \
                 publishedMessageId, confirmedOn, smallPayload, largePayload, priority, sessionId, \
                 droppedOn) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13);"
            ),
            delete_message: format!("DELETE FROM {t} WHERE id = ?1;"),
            get_message: format!("SELECT {MESSAGE_COLUMNS} FROM {t} WHERE id = ?1;"),
            get_next_message: format!(
                "SELECT {} FROM {t} AS a JOIN (SELECT id, publishedOn FROM {t} \
                 ORDER BY publishedOn ASC NULLS FIRST, priority ASC, createdOn ASC LIMIT 1) AS b \
                 WHERE a.id = b.id AND b.publishedOn IS NULL;",
                prefixed_columns("a")
            ),
            set_published_with_token: format!(
                "UPDATE {t} SET publishedOn = ?1, publishedMessageId = ?2, sessionId = ?3 \
                 WHERE id = ?4;"
            ),
            set_published: format!("UPDATE {t} SET publishedOn = ?1 WHERE id = ?2;"),
            set_confirmed: format!("UPDATE {t} SET confirmedOn = ?1 WHERE id = ?2;"),
            all_unpublished: format!(
                "SELECT {METADATA_COLUMNS} FROM {t} WHERE publishedOn IS NULL \
                 ORDER BY priority ASC, createdOn ASC;"
            ),
            all_in_flight: format!(
                "SELECT {METADATA_COLUMNS} FROM {t} WHERE publishedOn IS NOT NULL AND qos > 0 \
                 AND confirmedOn IS NULL AND droppedOn IS NULL ORDER BY priority ASC, createdOn ASC;"
            ),
            all_dropped: format!(
                "SELECT {METADATA_COLUMNS} FROM {t} WHERE droppedOn IS NOT NULL \
                 ORDER BY priority ASC, createdOn ASC;"
            ),
            unpublish_all_in_flight: format!(
                "UPDATE {t} SET publishedOn = NULL WHERE publishedOn IS NOT NULL AND qos > 0 \
                 AND confirmedOn IS NULL AND droppedOn IS NULL;"
            ),
            drop_all_in_flight: format!(
                "UPDATE {t} SET droppedOn = ?1 WHERE publishedOn IS NOT NULL AND qos > 0 \
                 AND confirmedOn IS NULL AND droppedOn IS NULL;"
            ),
            delete_dropped: format!(
                "DELETE FROM {t} WHERE droppedOn <= ?1 AND droppedOn IS NOT NULL;"
            ),
            delete_confirmed: format!(
                "DELETE FROM {t} WHERE confirmedOn <= ?1 AND confirmedOn IS NOT NULL;"
            ),
            delete_delivered: format!(
                "DELETE FROM {t} WHERE qos = 0 AND publishedOn <= ?1 AND publishedOn IS NOT NULL;"
            ),
            id_one_taken: format!("SELECT EXISTS (SELECT 1 FROM {t} WHERE id = 1);"),
            first_gap_id: format!(
                "SELECT g.id + 1 FROM {t} AS g LEFT JOIN {t} AS n ON n.id = g.id + 1 \
                 WHERE n.id IS NULL ORDER BY g.id LIMIT 1;"
            ),
        }
    }
}

/// Quote an identifier, doubling any embedded quotes so caller-controlled
/// table names cannot break out of the identifier position.
pub(crate) fn sanitize_identifier(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

fn prefixed_columns(prefix: &str) -> String {
    MESSAGE_COLUMNS
        .split(", ")
        .map(|column| format!("{prefix}.{}", column.trim()))
        .collect::<Vec<_>>()
        .join(", ")
}
