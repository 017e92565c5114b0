use super::StoreError;
use chrono::{DateTime, Duration, Utc};
use rusqlite::types::{FromSql, ToSql};
use rusqlite::{params, Connection};
use std::marker::PhantomData;
use std::sync::Mutex;

/// Idempotency ledger for one upstream tracker, parameterised on that
/// tracker's ID shape (integer for GitHub/Azure/GitLab, string for
/// Linear/Plane/Jira/Asana). Each set is backed by its own table; presence
/// of an ID means "do not pick this item up again".
pub struct ProcessedSet<'a, K> {
    conn: &'a Mutex<Connection>,
    table: &'static str,
    key_column: &'static str,
    _key: PhantomData<K>,
}

/// One ledger row: the tracker ID, when it was handled, and how.
#[derive(Debug, Clone, PartialEq)]
pub struct ProcessedEntry<K> {
    pub id: K,
    pub processed_at: DateTime<Utc>,
    pub result: String,
}

impl<'a, K> ProcessedSet<'a, K>
where
    K: ToSql + FromSql,
{
    pub(super) fn new(
        conn: &'a Mutex<Connection>,
        table: &'static str,
        key_column: &'static str,
    ) -> Self {
        Self {
            conn,
            table,
            key_column,
            _key: PhantomData,
        }
    }

    pub fn mark(&self, id: &K, result: &str) -> Result<(), StoreError> {
        let conn = self.conn.lock().unwrap();
        let sql = format!(
            "INSERT INTO {table} ({key}, processed_at, result) VALUES (?1, ?2, ?3) \
             ON CONFLICT({key}) DO UPDATE SET processed_at = excluded.processed_at, \
             result = excluded.result",
            table = self.table,
            key = self.key_column,
        );
        conn.execute(&sql, params![id, Utc::now(), result])?;
        Ok(())
    }

    pub fn unmark(&self, id: &K) -> Result<(), StoreError> {
        let conn = self.conn.lock().unwrap();
        let sql = format!(
            "DELETE FROM {} WHERE {} = ?1",
            self.table, self.key_column
        );
        conn.execute(&sql, params![id])?;
        Ok(())
    }

    pub fn is_processed(&self, id: &K) -> Result<bool, StoreError> {
        let conn = self.conn.lock().unwrap();
        let sql = format!(
            "SELECT COUNT(*) FROM {} WHERE {} = ?1",
            self.table, self.key_column
        );
        let count: i64 = conn.query_row(&sql, params![id], |row| row.get(0))?;
        Ok(count > 0)
    }

    pub fn load(&self) -> Result<Vec<ProcessedEntry<K>>, StoreError> {
        let conn = self.conn.lock().unwrap();
        let sql = format!(
            "SELECT {}, processed_at, result FROM {}",
            self.key_column, self.table
        );
        let mut statement = conn.prepare(&sql)?;
        let rows = statement.query_map([], |row| {
            Ok(ProcessedEntry {
                id: row.get(0)?,
                processed_at: row.get(1)?,
                result: row.get(2)?,
            })
        })?;
        let mut entries = Vec::new();
        for entry in rows {
            entries.push(entry?);
        }
        Ok(entries)
    }

    pub fn purge_old(&self, older_than: Duration) -> Result<usize, StoreError> {
        let cutoff = Utc::now() - older_than;
        let conn = self.conn.lock().unwrap();
        let sql = format!(
            "DELETE FROM {} WHERE julianday(processed_at) < julianday(?1)",
            self.table
        );
        let deleted = conn.execute(&sql, params![cutoff])?;
        Ok(deleted)
    }
}
