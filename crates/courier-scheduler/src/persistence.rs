//! SQLite-backed store for accounts, recipients, scheduled messages,
//! the delivery ledger and persisted log events.
//! Survives restarts: queued jobs are re-adopted from `job_id`/`next_run_at`.

use chrono::{DateTime, Utc};
use courier_core::error::{CourierError, Result};
use courier_core::traits::Account;
use rusqlite::types::Type;
use rusqlite::{Connection, OptionalExtension, Row, params};
use std::collections::HashSet;
use std::path::Path;
use std::sync::Mutex;

use crate::message::{
    DeliveryStatus, LedgerEntry, LogEntry, LogLevel, MessageStatus, Recipient, ScheduledMessage,
};

const MESSAGE_COLUMNS: &str = "id, account_id, text, attachment, scheduled_at, status, job_id, \
     next_run_at, retry_count, last_error, created_at, updated_at";

/// Durable store for the dispatch engine.
pub struct DispatchDb {
    conn: Mutex<Connection>,
}

impl DispatchDb {
    /// Open or create the database at `path`.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)
            .map_err(|e| CourierError::Database(format!("DB open: {e}")))?;
        // WAL lets CLI commands read while the daemon writes.
        conn.execute_batch("PRAGMA journal_mode=WAL;").ok();
        Self::init(conn)
    }

    /// Private in-memory database (tests, dry runs).
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()
            .map_err(|e| CourierError::Database(format!("DB open: {e}")))?;
        Self::init(conn)
    }

    fn init(conn: Connection) -> Result<Self> {
        conn.execute_batch("PRAGMA foreign_keys=ON;").map_err(db_err)?;
        conn.busy_timeout(std::time::Duration::from_secs(5))
            .map_err(db_err)?;
        let db = Self { conn: Mutex::new(conn) };
        db.migrate()?;
        Ok(db)
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|e| CourierError::Database(format!("Lock: {e}")))
    }

    /// Run migrations to create tables.
    fn migrate(&self) -> Result<()> {
        let conn = self.lock()?;
        conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS accounts (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                name TEXT NOT NULL,
                phone TEXT NOT NULL UNIQUE,
                session_file TEXT NOT NULL,
                is_active INTEGER NOT NULL DEFAULT 1,
                created_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS recipients (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                name TEXT NOT NULL,
                handle TEXT NOT NULL UNIQUE,   -- '@username' or numeric chat id
                created_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS scheduled_messages (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                account_id INTEGER NOT NULL REFERENCES accounts(id),
                text TEXT NOT NULL,
                attachment TEXT,
                scheduled_at TEXT NOT NULL,
                status TEXT NOT NULL DEFAULT 'PENDING',
                job_id TEXT,
                next_run_at TEXT,
                retry_count INTEGER NOT NULL DEFAULT 0,
                last_error TEXT,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_messages_status ON scheduled_messages(status);

            CREATE TABLE IF NOT EXISTS message_recipients (
                message_id INTEGER NOT NULL REFERENCES scheduled_messages(id) ON DELETE CASCADE,
                recipient_id INTEGER NOT NULL REFERENCES recipients(id),
                PRIMARY KEY (message_id, recipient_id)
            );

            -- Append-only. FAILED rows are history; at most one SENT per pair.
            CREATE TABLE IF NOT EXISTS delivery_ledger (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                message_id INTEGER NOT NULL REFERENCES scheduled_messages(id) ON DELETE CASCADE,
                recipient_id INTEGER NOT NULL REFERENCES recipients(id),
                status TEXT NOT NULL,
                error TEXT,
                recorded_at TEXT NOT NULL
            );
            CREATE UNIQUE INDEX IF NOT EXISTS idx_ledger_one_sent
                ON delivery_ledger(message_id, recipient_id) WHERE status = 'SENT';
            CREATE INDEX IF NOT EXISTS idx_ledger_message ON delivery_ledger(message_id);

            CREATE TABLE IF NOT EXISTS log_entries (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                level TEXT NOT NULL,
                source TEXT NOT NULL,
                message TEXT NOT NULL,
                created_at TEXT NOT NULL
            );
            ",
        )
        .map_err(|e| CourierError::Database(format!("Migration: {e}")))?;
        Ok(())
    }

    // ─── Accounts ─────────────────────────────────────────────

    /// Register an account. `session_file` defaults to `session_<digits>`.
    pub fn create_account(
        &self,
        name: &str,
        phone: &str,
        session_file: Option<&str>,
    ) -> Result<Account> {
        let session_file = session_file
            .map(str::to_string)
            .unwrap_or_else(|| Account::session_file_for(phone));
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO accounts (name, phone, session_file, is_active, created_at)
             VALUES (?1, ?2, ?3, 1, ?4)",
            params![name, phone, session_file, now()],
        )
        .map_err(db_err)?;
        Ok(Account {
            id: conn.last_insert_rowid(),
            name: name.to_string(),
            phone: phone.to_string(),
            session_file,
            is_active: true,
        })
    }

    pub fn get_account(&self, id: i64) -> Result<Account> {
        let conn = self.lock()?;
        conn.query_row(
            "SELECT id, name, phone, session_file, is_active FROM accounts WHERE id = ?1",
            params![id],
            account_from_row,
        )
        .optional()
        .map_err(db_err)?
        .ok_or_else(|| CourierError::NotFound(format!("account {id}")))
    }

    pub fn list_accounts(&self) -> Result<Vec<Account>> {
        let conn = self.lock()?;
        let mut stmt = conn
            .prepare("SELECT id, name, phone, session_file, is_active FROM accounts ORDER BY id")
            .map_err(db_err)?;
        let rows = stmt
            .query_map([], account_from_row)
            .map_err(db_err)?
            .collect::<rusqlite::Result<Vec<_>>>()
            .map_err(db_err)?;
        Ok(rows)
    }

    pub fn set_account_active(&self, id: i64, active: bool) -> Result<()> {
        let conn = self.lock()?;
        let changed = conn
            .execute(
                "UPDATE accounts SET is_active = ?1 WHERE id = ?2",
                params![active as i32, id],
            )
            .map_err(db_err)?;
        if changed == 0 {
            return Err(CourierError::NotFound(format!("account {id}")));
        }
        Ok(())
    }

    // ─── Recipients ───────────────────────────────────────────

    pub fn create_recipient(&self, name: &str, handle: &str) -> Result<Recipient> {
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO recipients (name, handle, created_at) VALUES (?1, ?2, ?3)",
            params![name, handle, now()],
        )
        .map_err(db_err)?;
        Ok(Recipient {
            id: conn.last_insert_rowid(),
            name: name.to_string(),
            handle: handle.to_string(),
        })
    }

    pub fn find_recipient_by_handle(&self, handle: &str) -> Result<Option<Recipient>> {
        let conn = self.lock()?;
        conn.query_row(
            "SELECT id, name, handle FROM recipients WHERE handle = ?1",
            params![handle],
            recipient_from_row,
        )
        .optional()
        .map_err(db_err)
    }

    pub fn list_recipients(&self) -> Result<Vec<Recipient>> {
        let conn = self.lock()?;
        let mut stmt = conn
            .prepare("SELECT id, name, handle FROM recipients ORDER BY id")
            .map_err(db_err)?;
        let rows = stmt
            .query_map([], recipient_from_row)
            .map_err(db_err)?
            .collect::<rusqlite::Result<Vec<_>>>()
            .map_err(db_err)?;
        Ok(rows)
    }

    // ─── Scheduled messages ───────────────────────────────────

    /// Create a PENDING message. Recipients are attached separately.
    pub fn create_message(
        &self,
        account_id: i64,
        text: &str,
        attachment: Option<&str>,
        scheduled_at: DateTime<Utc>,
    ) -> Result<ScheduledMessage> {
        let id = {
            let conn = self.lock()?;
            let ts = now();
            conn.execute(
                "INSERT INTO scheduled_messages
                 (account_id, text, attachment, scheduled_at, status, retry_count, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, 0, ?6, ?6)",
                params![
                    account_id,
                    text,
                    attachment,
                    scheduled_at.to_rfc3339(),
                    MessageStatus::Pending.as_str(),
                    ts,
                ],
            )
            .map_err(db_err)?;
            conn.last_insert_rowid()
        };
        self.get_message(id)
    }

    pub fn get_message(&self, id: i64) -> Result<ScheduledMessage> {
        let conn = self.lock()?;
        conn.query_row(
            &format!("SELECT {MESSAGE_COLUMNS} FROM scheduled_messages WHERE id = ?1"),
            params![id],
            message_from_row,
        )
        .optional()
        .map_err(db_err)?
        .ok_or_else(|| CourierError::NotFound(format!("message {id}")))
    }

    /// List messages, optionally restricted to one status.
    pub fn list_messages(&self, status: Option<MessageStatus>) -> Result<Vec<ScheduledMessage>> {
        let conn = self.lock()?;
        let (sql, filter) = match status {
            Some(s) => (
                format!("SELECT {MESSAGE_COLUMNS} FROM scheduled_messages WHERE status = ?1 ORDER BY id"),
                Some(s.as_str()),
            ),
            None => (
                format!("SELECT {MESSAGE_COLUMNS} FROM scheduled_messages ORDER BY id"),
                None,
            ),
        };
        let mut stmt = conn.prepare(&sql).map_err(db_err)?;
        let rows = match filter {
            Some(f) => stmt.query_map(params![f], message_from_row),
            None => stmt.query_map([], message_from_row),
        }
        .map_err(db_err)?
        .collect::<rusqlite::Result<Vec<_>>>()
        .map_err(db_err)?;
        Ok(rows)
    }

    /// Messages that carry a job handle in a non-terminal dispatch state.
    pub fn messages_with_jobs(&self) -> Result<Vec<ScheduledMessage>> {
        let conn = self.lock()?;
        let mut stmt = conn
            .prepare(&format!(
                "SELECT {MESSAGE_COLUMNS} FROM scheduled_messages
                 WHERE job_id IS NOT NULL AND status IN ('SCHEDULED', 'PARTIAL', 'FAILED')
                 ORDER BY next_run_at"
            ))
            .map_err(db_err)?;
        let rows = stmt
            .query_map([], message_from_row)
            .map_err(db_err)?
            .collect::<rusqlite::Result<Vec<_>>>()
            .map_err(db_err)?;
        Ok(rows)
    }

    /// Persist the dispatch fields of `message` (status, job, retry state).
    pub fn save_dispatch_state(&self, message: &ScheduledMessage) -> Result<()> {
        let conn = self.lock()?;
        let changed = conn
            .execute(
                "UPDATE scheduled_messages
                 SET status = ?1, job_id = ?2, next_run_at = ?3, retry_count = ?4,
                     last_error = ?5, updated_at = ?6
                 WHERE id = ?7",
                params![
                    message.status.as_str(),
                    message.job_id,
                    message.next_run_at.map(|t| t.to_rfc3339()),
                    message.retry_count,
                    message.last_error,
                    now(),
                    message.id,
                ],
            )
            .map_err(db_err)?;
        if changed == 0 {
            return Err(CourierError::NotFound(format!("message {}", message.id)));
        }
        Ok(())
    }

    /// Like [`save_dispatch_state`](Self::save_dispatch_state), but only if
    /// the stored row still has `expected_status` and `expected_job`.
    /// Returns false when another writer got there first.
    pub fn compare_and_save(
        &self,
        message: &ScheduledMessage,
        expected_status: MessageStatus,
        expected_job: Option<&str>,
    ) -> Result<bool> {
        let conn = self.lock()?;
        let changed = conn
            .execute(
                "UPDATE scheduled_messages
                 SET status = ?1, job_id = ?2, next_run_at = ?3, retry_count = ?4,
                     last_error = ?5, updated_at = ?6
                 WHERE id = ?7 AND status = ?8 AND job_id IS ?9",
                params![
                    message.status.as_str(),
                    message.job_id,
                    message.next_run_at.map(|t| t.to_rfc3339()),
                    message.retry_count,
                    message.last_error,
                    now(),
                    message.id,
                    expected_status.as_str(),
                    expected_job,
                ],
            )
            .map_err(db_err)?;
        Ok(changed == 1)
    }

    /// Attach recipients to a message. Already-attached pairs are ignored.
    /// Returns how many new links were created.
    pub fn attach_recipients(&self, message_id: i64, recipient_ids: &[i64]) -> Result<usize> {
        let mut conn = self.lock()?;
        let tx = conn.transaction().map_err(db_err)?;
        let mut added = 0;
        for recipient_id in recipient_ids {
            let exists: Option<i64> = tx
                .query_row(
                    "SELECT id FROM recipients WHERE id = ?1",
                    params![recipient_id],
                    |row| row.get(0),
                )
                .optional()
                .map_err(db_err)?;
            if exists.is_none() {
                return Err(CourierError::NotFound(format!("recipient {recipient_id}")));
            }
            added += tx
                .execute(
                    "INSERT OR IGNORE INTO message_recipients (message_id, recipient_id)
                     VALUES (?1, ?2)",
                    params![message_id, recipient_id],
                )
                .map_err(db_err)?;
        }
        tx.commit().map_err(db_err)?;
        Ok(added)
    }

    /// Recipients of a message in stable id order.
    pub fn message_recipients(&self, message_id: i64) -> Result<Vec<Recipient>> {
        let conn = self.lock()?;
        let mut stmt = conn
            .prepare(
                "SELECT r.id, r.name, r.handle FROM recipients r
                 JOIN message_recipients mr ON mr.recipient_id = r.id
                 WHERE mr.message_id = ?1
                 ORDER BY r.id",
            )
            .map_err(db_err)?;
        let rows = stmt
            .query_map(params![message_id], recipient_from_row)
            .map_err(db_err)?
            .collect::<rusqlite::Result<Vec<_>>>()
            .map_err(db_err)?;
        Ok(rows)
    }

    // ─── Delivery ledger ──────────────────────────────────────

    /// Append a ledger row. A second SENT for the same pair is ignored;
    /// returns whether a row was written.
    pub fn insert_ledger(
        &self,
        message_id: i64,
        recipient_id: i64,
        status: DeliveryStatus,
        error: Option<&str>,
    ) -> Result<bool> {
        let conn = self.lock()?;
        let changed = conn
            .execute(
                "INSERT OR IGNORE INTO delivery_ledger
                 (message_id, recipient_id, status, error, recorded_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![message_id, recipient_id, status.as_str(), error, now()],
            )
            .map_err(db_err)?;
        Ok(changed > 0)
    }

    pub fn is_delivered(&self, message_id: i64, recipient_id: i64) -> Result<bool> {
        let conn = self.lock()?;
        let count: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM delivery_ledger
                 WHERE message_id = ?1 AND recipient_id = ?2 AND status = 'SENT'",
                params![message_id, recipient_id],
                |row| row.get(0),
            )
            .map_err(db_err)?;
        Ok(count > 0)
    }

    /// Recipient ids with a SENT entry for `message_id`.
    pub fn delivered_recipients(&self, message_id: i64) -> Result<HashSet<i64>> {
        let conn = self.lock()?;
        let mut stmt = conn
            .prepare(
                "SELECT recipient_id FROM delivery_ledger
                 WHERE message_id = ?1 AND status = 'SENT'",
            )
            .map_err(db_err)?;
        let ids = stmt
            .query_map(params![message_id], |row| row.get::<_, i64>(0))
            .map_err(db_err)?
            .collect::<rusqlite::Result<HashSet<_>>>()
            .map_err(db_err)?;
        Ok(ids)
    }

    /// Full ledger history of a message, oldest first.
    pub fn ledger_entries(&self, message_id: i64) -> Result<Vec<LedgerEntry>> {
        let conn = self.lock()?;
        let mut stmt = conn
            .prepare(
                "SELECT id, message_id, recipient_id, status, error, recorded_at
                 FROM delivery_ledger WHERE message_id = ?1 ORDER BY id",
            )
            .map_err(db_err)?;
        let rows = stmt
            .query_map(params![message_id], |row| {
                let status: String = row.get(3)?;
                Ok(LedgerEntry {
                    id: row.get(0)?,
                    message_id: row.get(1)?,
                    recipient_id: row.get(2)?,
                    status: DeliveryStatus::parse(&status).ok_or_else(|| {
                        conversion_error(3, format!("unknown delivery status {status}"))
                    })?,
                    error: row.get(4)?,
                    recorded_at: parse_ts(5, row.get(5)?)?,
                })
            })
            .map_err(db_err)?
            .collect::<rusqlite::Result<Vec<_>>>()
            .map_err(db_err)?;
        Ok(rows)
    }

    // ─── Log entries ──────────────────────────────────────────

    pub fn insert_log(&self, level: LogLevel, source: &str, message: &str) -> Result<LogEntry> {
        let created_at = Utc::now();
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO log_entries (level, source, message, created_at) VALUES (?1, ?2, ?3, ?4)",
            params![level.as_str(), source, message, created_at.to_rfc3339()],
        )
        .map_err(db_err)?;
        Ok(LogEntry {
            id: conn.last_insert_rowid(),
            level,
            source: source.to_string(),
            message: message.to_string(),
            created_at,
        })
    }

    /// Most recent log events at or above `min_level`, newest first.
    pub fn recent_logs(&self, min_level: LogLevel, limit: usize) -> Result<Vec<LogEntry>> {
        let conn = self.lock()?;
        let mut stmt = conn
            .prepare(
                "SELECT id, level, source, message, created_at
                 FROM log_entries ORDER BY id DESC",
            )
            .map_err(db_err)?;
        let rows = stmt
            .query_map([], |row| {
                let level: String = row.get(1)?;
                Ok(LogEntry {
                    id: row.get(0)?,
                    level: LogLevel::parse(&level)
                        .ok_or_else(|| conversion_error(1, format!("unknown log level {level}")))?,
                    source: row.get(2)?,
                    message: row.get(3)?,
                    created_at: parse_ts(4, row.get(4)?)?,
                })
            })
            .map_err(db_err)?;

        let mut entries = Vec::new();
        for row in rows {
            let entry = row.map_err(db_err)?;
            if entry.level >= min_level {
                entries.push(entry);
                if entries.len() >= limit {
                    break;
                }
            }
        }
        Ok(entries)
    }
}

fn now() -> String {
    Utc::now().to_rfc3339()
}

fn db_err(e: rusqlite::Error) -> CourierError {
    CourierError::Database(e.to_string())
}

fn conversion_error(idx: usize, msg: String) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, msg.into())
}

fn parse_ts(idx: usize, s: String) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(&s)
        .map(|d| d.with_timezone(&Utc))
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

fn account_from_row(row: &Row<'_>) -> rusqlite::Result<Account> {
    Ok(Account {
        id: row.get(0)?,
        name: row.get(1)?,
        phone: row.get(2)?,
        session_file: row.get(3)?,
        is_active: row.get::<_, i32>(4)? != 0,
    })
}

fn recipient_from_row(row: &Row<'_>) -> rusqlite::Result<Recipient> {
    Ok(Recipient {
        id: row.get(0)?,
        name: row.get(1)?,
        handle: row.get(2)?,
    })
}

fn message_from_row(row: &Row<'_>) -> rusqlite::Result<ScheduledMessage> {
    let status: String = row.get(5)?;
    let next_run_at: Option<String> = row.get(7)?;
    Ok(ScheduledMessage {
        id: row.get(0)?,
        account_id: row.get(1)?,
        text: row.get(2)?,
        attachment: row.get(3)?,
        scheduled_at: parse_ts(4, row.get(4)?)?,
        status: MessageStatus::parse(&status)
            .ok_or_else(|| conversion_error(5, format!("unknown status {status}")))?,
        job_id: row.get(6)?,
        next_run_at: next_run_at.map(|s| parse_ts(7, s)).transpose()?,
        retry_count: row.get(8)?,
        last_error: row.get(9)?,
        created_at: parse_ts(10, row.get(10)?)?,
        updated_at: parse_ts(11, row.get(11)?)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn seeded() -> (DispatchDb, Account, ScheduledMessage) {
        let db = DispatchDb::open_in_memory().unwrap();
        let account = db.create_account("main", "+1 555 0100", None).unwrap();
        let message = db
            .create_message(account.id, "hello", None, Utc::now() + chrono::Duration::hours(1))
            .unwrap();
        (db, account, message)
    }

    #[test]
    fn test_account_crud() {
        let (db, account, _) = seeded();
        assert_eq!(account.session_file, "session_15550100");
        assert_eq!(db.get_account(account.id).unwrap(), account);

        db.set_account_active(account.id, false).unwrap();
        assert!(!db.get_account(account.id).unwrap().is_active);
        assert!(matches!(db.get_account(99), Err(CourierError::NotFound(_))));
        assert_eq!(db.list_accounts().unwrap().len(), 1);
    }

    #[test]
    fn test_recipient_handles_are_unique() {
        let db = DispatchDb::open_in_memory().unwrap();
        let alice = db.create_recipient("Alice", "@alice").unwrap();
        assert!(db.create_recipient("Alice again", "@alice").is_err());
        assert_eq!(db.find_recipient_by_handle("@alice").unwrap(), Some(alice));
        assert_eq!(db.find_recipient_by_handle("@bob").unwrap(), None);
    }

    #[test]
    fn test_new_message_is_pending() {
        let (db, _, message) = seeded();
        assert_eq!(message.status, MessageStatus::Pending);
        assert_eq!(message.retry_count, 0);
        assert!(message.job_id.is_none());
        assert_eq!(db.list_messages(Some(MessageStatus::Pending)).unwrap().len(), 1);
        assert!(db.list_messages(Some(MessageStatus::Sent)).unwrap().is_empty());
    }

    #[test]
    fn test_save_dispatch_state() {
        let (db, _, mut message) = seeded();
        let due = Utc::now() + chrono::Duration::minutes(5);
        message.status = MessageStatus::Scheduled;
        message.job_id = Some("job-1".into());
        message.next_run_at = Some(due);
        message.retry_count = 2;
        db.save_dispatch_state(&message).unwrap();

        let loaded = db.get_message(message.id).unwrap();
        assert_eq!(loaded.status, MessageStatus::Scheduled);
        assert_eq!(loaded.job_id.as_deref(), Some("job-1"));
        assert_eq!(loaded.retry_count, 2);
        assert_eq!(loaded.next_run_at.map(|t| t.timestamp()), Some(due.timestamp()));
        assert_eq!(db.messages_with_jobs().unwrap().len(), 1);
    }

    #[test]
    fn test_compare_and_save_loses_to_concurrent_writer() {
        let (db, _, mut message) = seeded();
        message.status = MessageStatus::Scheduled;
        message.job_id = Some("job-1".into());
        db.save_dispatch_state(&message).unwrap();

        // Another process cancels between our read and our write.
        let mut cancelled = message.clone();
        cancelled.status = MessageStatus::Cancelled;
        cancelled.job_id = None;
        assert!(db.compare_and_save(&cancelled, MessageStatus::Scheduled, Some("job-1")).unwrap());

        let mut claimed = message.clone();
        claimed.status = MessageStatus::Partial;
        assert!(!db.compare_and_save(&claimed, MessageStatus::Scheduled, Some("job-1")).unwrap());
        assert_eq!(db.get_message(message.id).unwrap().status, MessageStatus::Cancelled);

        // NULL job ids compare equal.
        let mut pending = db
            .create_message(message.account_id, "x", None, Utc::now())
            .unwrap();
        pending.status = MessageStatus::Cancelled;
        assert!(db.compare_and_save(&pending, MessageStatus::Pending, None).unwrap());
    }

    #[test]
    fn test_attach_is_idempotent_and_ordered() {
        let (db, _, message) = seeded();
        let b = db.create_recipient("B", "@b").unwrap();
        let a = db.create_recipient("A", "@a").unwrap();

        assert_eq!(db.attach_recipients(message.id, &[a.id, b.id]).unwrap(), 2);
        assert_eq!(db.attach_recipients(message.id, &[a.id]).unwrap(), 0);
        let ids: Vec<i64> = db
            .message_recipients(message.id)
            .unwrap()
            .iter()
            .map(|r| r.id)
            .collect();
        assert_eq!(ids, vec![b.id, a.id]);

        assert!(matches!(
            db.attach_recipients(message.id, &[404]),
            Err(CourierError::NotFound(_))
        ));
    }

    #[test]
    fn test_ledger_allows_one_sent_per_pair() {
        let (db, _, message) = seeded();
        let r = db.create_recipient("R", "@r").unwrap();

        assert!(db.insert_ledger(message.id, r.id, DeliveryStatus::Failed, Some("boom")).unwrap());
        assert!(db.insert_ledger(message.id, r.id, DeliveryStatus::Failed, Some("boom")).unwrap());
        assert!(!db.is_delivered(message.id, r.id).unwrap());

        assert!(db.insert_ledger(message.id, r.id, DeliveryStatus::Sent, None).unwrap());
        assert!(!db.insert_ledger(message.id, r.id, DeliveryStatus::Sent, None).unwrap());
        assert!(db.is_delivered(message.id, r.id).unwrap());

        let entries = db.ledger_entries(message.id).unwrap();
        let statuses: Vec<DeliveryStatus> = entries.iter().map(|e| e.status).collect();
        assert_eq!(
            statuses,
            vec![DeliveryStatus::Failed, DeliveryStatus::Failed, DeliveryStatus::Sent]
        );
        assert_eq!(entries[0].error.as_deref(), Some("boom"));
    }

    #[test]
    fn test_recent_logs_filters_by_level() {
        let db = DispatchDb::open_in_memory().unwrap();
        db.insert_log(LogLevel::Info, "engine", "scheduled").unwrap();
        db.insert_log(LogLevel::Error, "engine", "failed").unwrap();
        db.insert_log(LogLevel::Debug, "send_loop", "noise").unwrap();

        let all = db.recent_logs(LogLevel::Debug, 10).unwrap();
        assert_eq!(all.len(), 3);
        assert_eq!(all[0].message, "noise");

        let errors = db.recent_logs(LogLevel::Error, 10).unwrap();
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].message, "failed");
        assert_eq!(db.recent_logs(LogLevel::Debug, 2).unwrap().len(), 2);
    }

    #[test]
    fn test_file_database_survives_reopen() {
        let dir = std::env::temp_dir().join("courier-db-reopen-test");
        std::fs::remove_dir_all(&dir).ok();
        let path = dir.join("courier.db");
        {
            let db = DispatchDb::open(&path).unwrap();
            db.create_recipient("A", "@a").unwrap();
        }
        let db = DispatchDb::open(&path).unwrap();
        assert_eq!(db.list_recipients().unwrap().len(), 1);
        std::fs::remove_dir_all(&dir).ok();
    }
}
