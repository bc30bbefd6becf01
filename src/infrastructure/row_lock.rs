use crate::domain::ports::AccountLock;
use crate::error::{LedgerError, Result};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

/// Per-employer exclusive locks, one per ledger row.
///
/// Mutations for one employer are serialized while other employers proceed
/// in parallel. Rows are created lazily and kept for the process lifetime.
#[derive(Default, Clone)]
pub struct RowLocks {
    rows: Arc<Mutex<HashMap<String, Arc<Mutex<()>>>>>,
}

impl RowLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Waits at most `wait` for the row. Timing out is a concurrency
    /// conflict for the caller to retry.
    pub async fn lock(&self, key: &str, wait: Duration) -> Result<AccountLock> {
        let row = {
            let mut rows = self.rows.lock().await;
            rows.entry(key.to_string())
                .or_insert_with(|| Arc::new(Mutex::new(())))
                .clone()
        };
        tokio::time::timeout(wait, row.lock_owned())
            .await
            .map_err(|_| LedgerError::ConcurrencyConflict(key.to_string()).into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::EndorseError;

    #[tokio::test]
    async fn test_same_row_is_exclusive() {
        let locks = RowLocks::new();
        let guard = locks.lock("emp-1", Duration::from_millis(10)).await.unwrap();

        let second = locks.lock("emp-1", Duration::from_millis(10)).await;
        assert!(matches!(
            second,
            Err(EndorseError::Ledger(LedgerError::ConcurrencyConflict(_)))
        ));

        drop(guard);
        assert!(locks.lock("emp-1", Duration::from_millis(10)).await.is_ok());
    }

    #[tokio::test]
    async fn test_different_rows_do_not_contend() {
        let locks = RowLocks::new();
        let _first = locks.lock("emp-1", Duration::from_millis(10)).await.unwrap();
        assert!(locks.lock("emp-2", Duration::from_millis(10)).await.is_ok());
    }
}
