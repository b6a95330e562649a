//! Row-level lock table.
//!
//! Each row key maps to an async mutex. A transaction that writes a row
//! holds the owned guard until it commits, rolls back or is terminated;
//! other writers queue on the mutex in FIFO order.

use super::error::DbError;
use dashmap::DashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, OwnedMutexGuard};

/// A held row lock. Dropping it releases the row.
#[derive(Debug)]
pub struct RowLock {
    key: String,
    _guard: OwnedMutexGuard<()>,
}

impl RowLock {
    pub fn key(&self) -> &str {
        &self.key
    }
}

#[derive(Default)]
pub struct LockTable {
    rows: DashMap<String, Arc<Mutex<()>>>,
}

impl LockTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Waits for the row lock on `key`.
    ///
    /// A zero `timeout` waits indefinitely, as `lock_timeout = 0` does.
    ///
    /// # Errors
    ///
    /// Returns `55P03` if the lock is not granted within `timeout`.
    pub async fn acquire(&self, key: &str, timeout: Duration) -> Result<RowLock, DbError> {
        let row = self.row(key);
        let guard = if timeout.is_zero() {
            row.lock_owned().await
        } else {
            tokio::time::timeout(timeout, row.lock_owned())
                .await
                .map_err(|_| DbError::lock_timeout())?
        };
        Ok(RowLock {
            key: key.to_string(),
            _guard: guard,
        })
    }

    /// True if some transaction currently holds the row.
    pub fn is_locked(&self, key: &str) -> bool {
        self.rows
            .get(key)
            .is_some_and(|row| row.try_lock().is_err())
    }

    fn row(&self, key: &str) -> Arc<Mutex<()>> {
        // Clone the Arc out so the shard guard is released before awaiting.
        self.rows.entry(key.to_string()).or_default().clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_second_writer_times_out() {
        let locks = LockTable::new();
        let held = locks.acquire("ian", Duration::ZERO).await.unwrap();
        assert!(locks.is_locked("ian"));

        let err = locks
            .acquire("ian", Duration::from_millis(1500))
            .await
            .unwrap_err();
        assert_eq!(err, DbError::lock_timeout());

        drop(held);
        assert!(!locks.is_locked("ian"));
        let lock = locks
            .acquire("ian", Duration::from_millis(1500))
            .await
            .unwrap();
        assert_eq!(lock.key(), "ian");
    }

    #[tokio::test(start_paused = true)]
    async fn test_waiter_granted_on_release() {
        let locks = Arc::new(LockTable::new());
        let held = locks.acquire("ian", Duration::ZERO).await.unwrap();

        let waiter = {
            let locks = Arc::clone(&locks);
            tokio::spawn(async move { locks.acquire("ian", Duration::from_secs(5)).await })
        };

        tokio::time::sleep(Duration::from_secs(1)).await;
        drop(held);
        assert!(waiter.await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn test_distinct_rows_do_not_block() {
        let locks = LockTable::new();
        let _a = locks.acquire("a", Duration::ZERO).await.unwrap();
        let _b = locks.acquire("b", Duration::from_millis(10)).await.unwrap();
        assert!(locks.is_locked("a"));
        assert!(locks.is_locked("b"));
    }
}
