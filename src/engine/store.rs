//! SQLite-backed storage for the shared row.
//!
//! The store holds committed state only. Transactions buffer their writes
//! and hand them to [`ResourceStore::apply`] at commit, which writes them in
//! a single SQLite transaction.

use super::error::{DbError, SqlState};
use super::statement::TABLE;
use parking_lot::Mutex;
use rusqlite::{Connection, OptionalExtension, params};
use std::path::Path;

const CREATE_TABLE: &str =
    "CREATE TABLE IF NOT EXISTS t (id INTEGER PRIMARY KEY, name VARCHAR(64) UNIQUE, num INT)";

/// A buffered change to one row, applied at commit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RowWrite {
    /// Set `num` on an existing row.
    Update(i64),
    /// Insert the row, or set `num` to `on_conflict` if it exists.
    Upsert { num: i64, on_conflict: i64 },
    /// Insert the row; fails if the key exists.
    Insert(i64),
}

impl RowWrite {
    /// The value a read inside the writing transaction observes.
    pub fn visible_value(self, committed: Option<i64>) -> i64 {
        match self {
            Self::Update(num) | Self::Insert(num) => num,
            Self::Upsert { num, on_conflict } => {
                if committed.is_some() {
                    on_conflict
                } else {
                    num
                }
            },
        }
    }

    /// Folds a later write in the same transaction onto this one.
    pub fn then(self, later: RowWrite) -> RowWrite {
        match (self, later) {
            (Self::Insert(_) | Self::Upsert { .. }, Self::Update(num)) => Self::Upsert {
                num,
                on_conflict: num,
            },
            // The row is already visible to this transaction, so a later
            // upsert takes its conflict branch.
            (Self::Insert(_) | Self::Upsert { .. }, Self::Upsert { on_conflict, .. }) => {
                Self::Upsert {
                    num: on_conflict,
                    on_conflict,
                }
            },
            (_, later) => later,
        }
    }
}

/// Committed storage for table `t`.
///
/// # Thread Safety
///
/// The SQLite connection sits behind a mutex; every call is a short
/// synchronous critical section and never spans an `.await`.
pub struct ResourceStore {
    conn: Mutex<Connection>,
}

impl ResourceStore {
    /// Opens a private in-memory store.
    ///
    /// # Errors
    ///
    /// Returns an error if SQLite cannot allocate the database.
    pub fn in_memory() -> Result<Self, DbError> {
        Ok(Self {
            conn: Mutex::new(Connection::open_in_memory()?),
        })
    }

    /// Opens (or creates) a file-backed store.
    ///
    /// # Errors
    ///
    /// Returns an error if the database file cannot be opened.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, DbError> {
        Ok(Self {
            conn: Mutex::new(Connection::open(path)?),
        })
    }

    pub fn table_exists(&self) -> Result<bool, DbError> {
        let conn = self.conn.lock();
        let found: Option<String> = conn
            .query_row(
                "SELECT name FROM sqlite_master WHERE type = 'table' AND name = ?1",
                params![TABLE],
                |row| row.get(0),
            )
            .optional()?;
        Ok(found.is_some())
    }

    /// Creates table `t`.
    ///
    /// # Errors
    ///
    /// Fails when the table exists and `if_not_exists` is false.
    pub fn create_table(&self, if_not_exists: bool) -> Result<(), DbError> {
        if !if_not_exists && self.table_exists()? {
            return Err(DbError::new(
                SqlState::DuplicateTable,
                format!("relation \"{TABLE}\" already exists"),
            ));
        }
        self.conn.lock().execute_batch(CREATE_TABLE)?;
        Ok(())
    }

    /// Reads the committed `num` for `key`.
    pub fn get(&self, key: &str) -> Result<Option<i64>, DbError> {
        let conn = self.conn.lock();
        let num = conn
            .query_row("SELECT num FROM t WHERE name = ?1", params![key], |row| {
                row.get(0)
            })
            .optional()?;
        Ok(num)
    }

    /// Number of rows in table `t`.
    pub fn row_count(&self) -> Result<usize, DbError> {
        let conn = self.conn.lock();
        let count: i64 = conn.query_row("SELECT count(*) FROM t", [], |row| row.get(0))?;
        Ok(usize::try_from(count).unwrap_or(0))
    }

    /// Applies buffered writes atomically.
    ///
    /// # Errors
    ///
    /// Returns an error, with nothing applied, if any write fails.
    pub fn apply<'w, I>(&self, writes: I) -> Result<(), DbError>
    where
        I: IntoIterator<Item = (&'w String, &'w RowWrite)>,
    {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        for (key, write) in writes {
            match *write {
                RowWrite::Update(num) => {
                    tx.execute("UPDATE t SET num = ?1 WHERE name = ?2", params![num, key])?;
                },
                RowWrite::Upsert { num, on_conflict } => {
                    tx.execute(
                        "INSERT INTO t (name, num) VALUES (?1, ?2) \
                         ON CONFLICT(name) DO UPDATE SET num = ?3",
                        params![key, num, on_conflict],
                    )?;
                },
                RowWrite::Insert(num) => {
                    let inserted = tx.execute(
                        "INSERT INTO t (name, num) VALUES (?1, ?2) ON CONFLICT(name) DO NOTHING",
                        params![key, num],
                    )?;
                    if inserted == 0 {
                        return Err(duplicate_key(key));
                    }
                },
            }
        }
        tx.commit()?;
        Ok(())
    }
}

pub(crate) fn duplicate_key(key: &str) -> DbError {
    DbError::new(
        SqlState::UniqueViolation,
        format!("duplicate key value violates unique constraint \"t_name_key\" (name)=({key})"),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    fn store() -> ResourceStore {
        let store = ResourceStore::in_memory().unwrap();
        store.create_table(true).unwrap();
        store
    }

    #[test]
    fn test_upsert_is_idempotent() {
        let store = store();
        let key = "ian".to_string();
        let seed = RowWrite::Upsert {
            num: 777,
            on_conflict: 777,
        };
        for _ in 0..3 {
            store.apply([(&key, &seed)]).unwrap();
        }
        assert_eq!(store.row_count().unwrap(), 1);
        assert_eq!(store.get("ian").unwrap(), Some(777));
    }

    #[test]
    fn test_failed_apply_leaves_nothing_behind() {
        let store = store();
        let key = "ian".to_string();
        store.apply([(&key, &RowWrite::Insert(1))]).unwrap();

        let mut writes = BTreeMap::new();
        writes.insert("a".to_string(), RowWrite::Insert(5));
        writes.insert("ian".to_string(), RowWrite::Insert(2));
        let err = store.apply(&writes).unwrap_err();
        assert_eq!(err.code, SqlState::UniqueViolation);
        assert_eq!(store.get("a").unwrap(), None);
        assert_eq!(store.get("ian").unwrap(), Some(1));
    }

    #[test]
    fn test_create_table_twice() {
        let store = store();
        assert!(store.create_table(true).is_ok());
        let err = store.create_table(false).unwrap_err();
        assert_eq!(err.code, SqlState::DuplicateTable);
    }

    #[test]
    fn test_missing_table() {
        let store = ResourceStore::in_memory().unwrap();
        assert!(!store.table_exists().unwrap());
        assert_eq!(store.get("ian").unwrap_err().code, SqlState::UndefinedTable);
    }

    #[test]
    fn test_write_folding() {
        let insert = RowWrite::Insert(1);
        assert_eq!(
            insert.then(RowWrite::Update(9)),
            RowWrite::Upsert {
                num: 9,
                on_conflict: 9
            }
        );
        assert_eq!(RowWrite::Update(1).then(RowWrite::Update(2)), RowWrite::Update(2));
        assert_eq!(
            RowWrite::Upsert {
                num: 1,
                on_conflict: 3
            }
            .visible_value(Some(0)),
            3
        );
    }
}
