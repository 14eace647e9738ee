//! Read-only reader over the Messages database (chat.db).
//!
//! The schema is Apple's: `message` rows joined to a conversation through
//! `chat_message_join` / `chat_handle_join`, with the remote party in
//! `handle.id`. Outgoing rows carry `is_from_me = 1` and do not always
//! reference the handle directly, which is why the chat join is used for
//! both directions. Timestamps are nanoseconds since 2001-01-01.

use chrono::{Local, NaiveDateTime, TimeZone};
use rusqlite::{params, Connection, OpenFlags};
use std::path::Path;
use std::sync::Mutex;

use crate::errors::StoreError;

/// Seconds between the Unix epoch and Apple's 2001-01-01 reference date.
const APPLE_EPOCH_OFFSET: i64 = 978_307_200;

/// One historical chat line. Query-scoped; never retained beyond a scan.
#[derive(Debug, Clone)]
pub struct Message {
    pub row_id: i64,
    pub text: String,
    pub timestamp: NaiveDateTime,
    pub is_from_me: bool,
}

/// Read-only handle on the message database.
pub struct MessageStore {
    conn: Mutex<Connection>,
}

/// Shared row filters: text present, plain text message (`item_type` 0),
/// not a tapback/reaction (`associated_message_type` 2000-3999).
const ROW_FILTERS: &str = "m.text IS NOT NULL AND trim(m.text) <> '' \
     AND COALESCE(m.item_type, 0) = 0 \
     AND COALESCE(m.associated_message_type, 0) NOT BETWEEN 2000 AND 3999";

impl MessageStore {
    /// Open the database read-only. A missing file or a permission error
    /// (Full Disk Access not granted) surfaces as `StoreError::Unavailable`
    /// so the caller can raise a one-time permission hint instead of
    /// stalling silently.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, StoreError> {
        let path = path.as_ref();
        if !path.exists() {
            return Err(StoreError::Unavailable(format!(
                "{} does not exist",
                path.display()
            )));
        }

        let conn = Connection::open_with_flags(
            path,
            OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )
        .map_err(|e| StoreError::Unavailable(format!("{}: {}", path.display(), e)))?;

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn lock_conn(&self) -> std::sync::MutexGuard<'_, Connection> {
        match self.conn.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Messages with `ROWID > row_id` for the contact, oldest first, so new
    /// content is processed in causal order.
    pub fn fetch_after(
        &self,
        row_id: i64,
        contact: &str,
        include_own: bool,
    ) -> Result<Vec<Message>, StoreError> {
        let (exact, like) = contact_patterns(contact);
        let conn = self.lock_conn();
        let sql = format!(
            "SELECT DISTINCT m.ROWID, m.text, m.date, m.is_from_me \
             FROM message m \
             JOIN chat_message_join cmj ON cmj.message_id = m.ROWID \
             JOIN chat_handle_join chj ON chj.chat_id = cmj.chat_id \
             JOIN handle h ON h.ROWID = chj.handle_id \
             WHERE (h.id = ?1 OR h.id LIKE ?2) \
             AND m.ROWID > ?3 \
             AND {ROW_FILTERS} \
             AND (?4 OR m.is_from_me = 0) \
             ORDER BY m.ROWID ASC"
        );
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt
            .query_map(params![exact, like, row_id, include_own], row_to_message)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// The most recent `limit` messages strictly before `row_id`, returned
    /// in chronological order (queried descending, then reversed).
    pub fn fetch_before(
        &self,
        row_id: i64,
        contact: &str,
        include_own: bool,
        limit: usize,
    ) -> Result<Vec<Message>, StoreError> {
        let (exact, like) = contact_patterns(contact);
        let conn = self.lock_conn();
        let sql = format!(
            "SELECT DISTINCT m.ROWID, m.text, m.date, m.is_from_me \
             FROM message m \
             JOIN chat_message_join cmj ON cmj.message_id = m.ROWID \
             JOIN chat_handle_join chj ON chj.chat_id = cmj.chat_id \
             JOIN handle h ON h.ROWID = chj.handle_id \
             WHERE (h.id = ?1 OR h.id LIKE ?2) \
             AND m.ROWID < ?3 \
             AND {ROW_FILTERS} \
             AND (?4 OR m.is_from_me = 0) \
             ORDER BY m.ROWID DESC \
             LIMIT ?5"
        );
        let mut stmt = conn.prepare(&sql)?;
        let mut rows = stmt
            .query_map(
                params![exact, like, row_id, include_own, limit as i64],
                row_to_message,
            )?
            .collect::<Result<Vec<_>, _>>()?;
        rows.reverse();
        Ok(rows)
    }

    /// Highest row id in the whole table, used to baseline the cursor on
    /// first run so history is never replayed.
    pub fn max_row_id(&self) -> Result<i64, StoreError> {
        let conn = self.lock_conn();
        let max: i64 = conn.query_row("SELECT COALESCE(MAX(ROWID), 0) FROM message", [], |row| {
            row.get(0)
        })?;
        Ok(max)
    }
}

fn row_to_message(row: &rusqlite::Row<'_>) -> rusqlite::Result<Message> {
    Ok(Message {
        row_id: row.get(0)?,
        text: row.get(1)?,
        timestamp: apple_time_to_local(row.get(2)?),
        is_from_me: row.get::<_, i64>(3)? != 0,
    })
}

/// Convert a chat.db `date` value to a local wall-clock time. Modern macOS
/// stores nanoseconds since 2001-01-01; pre-High-Sierra rows stored seconds.
fn apple_time_to_local(raw: i64) -> NaiveDateTime {
    let secs = if raw.abs() > 100_000_000_000 {
        raw / 1_000_000_000
    } else {
        raw
    };
    match Local.timestamp_opt(secs + APPLE_EPOCH_OFFSET, 0) {
        chrono::LocalResult::Single(dt) | chrono::LocalResult::Ambiguous(dt, _) => dt.naive_local(),
        chrono::LocalResult::None => NaiveDateTime::UNIX_EPOCH,
    }
}

/// Build the exact and LIKE patterns for a contact identifier. Emails match
/// exactly; phone numbers match on their trailing ten digits so "+1 (555)
/// 123-4567" finds the canonical "+15551234567" handle.
fn contact_patterns(contact: &str) -> (String, String) {
    let exact = contact.trim().to_string();
    if exact.contains('@') {
        let like = exact.clone();
        return (exact, like);
    }
    let digits: String = exact.chars().filter(|c| c.is_ascii_digit()).collect();
    if digits.is_empty() {
        let like = exact.clone();
        return (exact, like);
    }
    let suffix: String = digits
        .chars()
        .rev()
        .take(10)
        .collect::<Vec<_>>()
        .into_iter()
        .rev()
        .collect();
    (exact, format!("%{}", suffix))
}
