use crate::domain::account::LedgerAccount;
use crate::domain::endorsement::{EndorsementRequest, RequestId, Status};
use crate::domain::ports::{
    AccountLock, BufferedRequest, LedgerStore, OpenWindow, RequestStore, SchedulerBuffer,
    WindowKey,
};
use crate::domain::transaction::LedgerTransaction;
use crate::error::{EndorseError, Result};
use crate::infrastructure::row_lock::RowLocks;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rocksdb::{ColumnFamily, ColumnFamilyDescriptor, DB, Direction, IteratorMode, Options, WriteBatch};
use serde::{Deserialize, Serialize};
use serde::de::DeserializeOwned;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

/// Column Family for endorsement requests, keyed by request id.
pub const CF_REQUESTS: &str = "requests";
/// Column Family for ledger accounts, keyed by employer id.
pub const CF_ACCOUNTS: &str = "accounts";
/// Column Family for ledger transactions, keyed by employer then time.
pub const CF_ENTRIES: &str = "entries";
/// Index of ledger transactions by request id.
pub const CF_REQUEST_ENTRIES: &str = "request_entries";
/// Index of top-ups by external payment reference.
pub const CF_EXTERNAL_REFS: &str = "external_refs";
/// Column Family for open scheduler windows.
pub const CF_WINDOWS: &str = "scheduler_windows";
/// Column Family for counters.
pub const CF_META: &str = "meta";

const SEQUENCE_KEY: &[u8] = b"ingestion_sequence";

#[derive(Debug, Serialize, Deserialize)]
struct StoredWindow {
    opened_at: DateTime<Utc>,
    entries: Vec<BufferedRequest>,
}

/// A persistent store implementation using RocksDB.
///
/// Backs the request store, the ledger store and the scheduler buffer with
/// separate Column Families. Ledger writes go through a single `WriteBatch`
/// so an account and its new transactions land atomically.
///
/// This struct is thread-safe (`Clone` shares the underlying `Arc<DB>`).
#[derive(Clone)]
pub struct RocksDBStore {
    db: Arc<DB>,
    rows: RowLocks,
    // Serializes read-modify-write cycles on counters and windows.
    write_guard: Arc<Mutex<()>>,
}

impl RocksDBStore {
    /// Opens or creates a RocksDB instance at the specified path, creating
    /// any missing column families.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let mut opts = Options::default();
        opts.create_if_missing(true);
        opts.create_missing_column_families(true);

        let families = [
            CF_REQUESTS,
            CF_ACCOUNTS,
            CF_ENTRIES,
            CF_REQUEST_ENTRIES,
            CF_EXTERNAL_REFS,
            CF_WINDOWS,
            CF_META,
        ]
        .into_iter()
        .map(|name| ColumnFamilyDescriptor::new(name, Options::default()));

        let db = DB::open_cf_descriptors(&opts, path, families)?;

        Ok(Self {
            db: Arc::new(db),
            rows: RowLocks::new(),
            write_guard: Arc::new(Mutex::new(())),
        })
    }

    fn cf(&self, name: &str) -> Result<&ColumnFamily> {
        self.db
            .cf_handle(name)
            .ok_or_else(|| EndorseError::Internal(format!("{name} column family not found")))
    }

    fn get_json<T: DeserializeOwned>(&self, cf: &str, key: &[u8]) -> Result<Option<T>> {
        match self.db.get_cf(self.cf(cf)?, key)? {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }

    fn put_json<T: Serialize>(&self, cf: &str, key: &[u8], value: &T) -> Result<()> {
        self.db.put_cf(self.cf(cf)?, key, serde_json::to_vec(value)?)?;
        Ok(())
    }

    /// Values of every key starting with `prefix`, in key order.
    fn scan_prefix<T: DeserializeOwned>(&self, cf: &str, prefix: &[u8]) -> Result<Vec<T>> {
        let iter = self
            .db
            .iterator_cf(self.cf(cf)?, IteratorMode::From(prefix, Direction::Forward));
        let mut values = Vec::new();
        for item in iter {
            let (key, value) = item?;
            if !key.starts_with(prefix) {
                break;
            }
            values.push(serde_json::from_slice(&value)?);
        }
        Ok(values)
    }
}

fn composite_key(parts: &[&str]) -> Vec<u8> {
    parts.join("\0").into_bytes()
}

fn prefix_key(part: &str) -> Vec<u8> {
    let mut key = part.as_bytes().to_vec();
    key.push(0);
    key
}

fn entry_time_key(entry: &LedgerTransaction) -> String {
    format!(
        "{:020}",
        entry.recorded_at.timestamp_nanos_opt().unwrap_or_default()
    )
}

fn window_key(key: &WindowKey) -> Vec<u8> {
    composite_key(&[&key.employer_id, &key.insurer_id])
}

#[async_trait]
impl RequestStore for RocksDBStore {
    async fn insert(&self, request: EndorsementRequest) -> Result<bool> {
        let _guard = self.write_guard.lock().await;
        let key = request.request_id.as_str().as_bytes();
        if self.db.get_pinned_cf(self.cf(CF_REQUESTS)?, key)?.is_some() {
            return Ok(false);
        }
        self.put_json(CF_REQUESTS, key, &request)?;
        Ok(true)
    }

    async fn get(&self, request_id: &RequestId) -> Result<Option<EndorsementRequest>> {
        self.get_json(CF_REQUESTS, request_id.as_str().as_bytes())
    }

    async fn update(&self, request: EndorsementRequest) -> Result<()> {
        self.put_json(CF_REQUESTS, request.request_id.as_str().as_bytes(), &request)
    }

    async fn with_status(
        &self,
        status: Status,
        employer_id: Option<&str>,
    ) -> Result<Vec<EndorsementRequest>> {
        let mut matching: Vec<EndorsementRequest> = self
            .all()
            .await?
            .into_iter()
            .filter(|r| r.status == status)
            .filter(|r| employer_id.is_none_or(|employer| r.employer_id == employer))
            .collect();
        matching.sort_by_key(|r| r.ingestion_sequence);
        Ok(matching)
    }

    async fn all(&self) -> Result<Vec<EndorsementRequest>> {
        let mut all: Vec<EndorsementRequest> = self.scan_prefix(CF_REQUESTS, b"")?;
        all.sort_by_key(|r| r.ingestion_sequence);
        Ok(all)
    }

    async fn next_sequence(&self) -> Result<u64> {
        let _guard = self.write_guard.lock().await;
        let next = self.get_json::<u64>(CF_META, SEQUENCE_KEY)?.unwrap_or(0) + 1;
        self.put_json(CF_META, SEQUENCE_KEY, &next)?;
        Ok(next)
    }
}

#[async_trait]
impl LedgerStore for RocksDBStore {
    async fn lock_account(&self, employer_id: &str, wait: Duration) -> Result<AccountLock> {
        self.rows.lock(employer_id, wait).await
    }

    async fn account(&self, employer_id: &str) -> Result<Option<LedgerAccount>> {
        self.get_json(CF_ACCOUNTS, employer_id.as_bytes())
    }

    async fn accounts(&self) -> Result<Vec<LedgerAccount>> {
        self.scan_prefix(CF_ACCOUNTS, b"")
    }

    async fn entries_for_request(&self, request_id: &RequestId) -> Result<Vec<LedgerTransaction>> {
        self.scan_prefix(CF_REQUEST_ENTRIES, &prefix_key(request_id.as_str()))
    }

    async fn entries_for_employer(&self, employer_id: &str) -> Result<Vec<LedgerTransaction>> {
        self.scan_prefix(CF_ENTRIES, &prefix_key(employer_id))
    }

    async fn entry_by_external_ref(
        &self,
        employer_id: &str,
        external_ref: &str,
    ) -> Result<Option<LedgerTransaction>> {
        self.get_json(CF_EXTERNAL_REFS, &composite_key(&[employer_id, external_ref]))
    }

    async fn apply(&self, account: LedgerAccount, entries: Vec<LedgerTransaction>) -> Result<()> {
        let mut batch = WriteBatch::default();
        batch.put_cf(
            self.cf(CF_ACCOUNTS)?,
            account.employer_id.as_bytes(),
            serde_json::to_vec(&account)?,
        );
        for entry in &entries {
            let value = serde_json::to_vec(entry)?;
            let time = entry_time_key(entry);
            let id = entry.id.to_string();
            batch.put_cf(
                self.cf(CF_ENTRIES)?,
                composite_key(&[&entry.employer_id, &time, &id]),
                &value,
            );
            if let Some(request_id) = &entry.request_id {
                batch.put_cf(
                    self.cf(CF_REQUEST_ENTRIES)?,
                    composite_key(&[request_id.as_str(), &time, &id]),
                    &value,
                );
            }
            if let Some(external_ref) = &entry.external_ref {
                batch.put_cf(
                    self.cf(CF_EXTERNAL_REFS)?,
                    composite_key(&[&entry.employer_id, external_ref]),
                    &value,
                );
            }
        }
        self.db.write(batch)?;
        Ok(())
    }
}

#[async_trait]
impl SchedulerBuffer for RocksDBStore {
    async fn push(&self, key: &WindowKey, entry: BufferedRequest, now: DateTime<Utc>) -> Result<()> {
        let _guard = self.write_guard.lock().await;
        let db_key = window_key(key);
        let mut window = self
            .get_json::<StoredWindow>(CF_WINDOWS, &db_key)?
            .unwrap_or(StoredWindow {
                opened_at: now,
                entries: Vec::new(),
            });
        if !window.entries.iter().any(|e| e.request_id == entry.request_id) {
            window.entries.push(entry);
        }
        self.put_json(CF_WINDOWS, &db_key, &window)
    }

    async fn windows(&self) -> Result<Vec<OpenWindow>> {
        let iter = self.db.iterator_cf(self.cf(CF_WINDOWS)?, IteratorMode::Start);
        let mut open = Vec::new();
        for item in iter {
            let (db_key, value) = item?;
            let window: StoredWindow = serde_json::from_slice(&value)?;
            let raw = String::from_utf8_lossy(&db_key);
            let Some((employer_id, insurer_id)) = raw.split_once('\0') else {
                continue;
            };
            open.push(OpenWindow {
                key: WindowKey::new(employer_id, insurer_id),
                opened_at: window.opened_at,
            });
        }
        Ok(open)
    }

    async fn peek(&self, key: &WindowKey) -> Result<Vec<BufferedRequest>> {
        Ok(self
            .get_json::<StoredWindow>(CF_WINDOWS, &window_key(key))?
            .map(|window| window.entries)
            .unwrap_or_default())
    }

    async fn remove(&self, key: &WindowKey, request_ids: &[RequestId]) -> Result<()> {
        let _guard = self.write_guard.lock().await;
        let db_key = window_key(key);
        let Some(mut window) = self.get_json::<StoredWindow>(CF_WINDOWS, &db_key)? else {
            return Ok(());
        };
        window.entries.retain(|e| !request_ids.contains(&e.request_id));
        if window.entries.is_empty() {
            self.db.delete_cf(self.cf(CF_WINDOWS)?, &db_key)?;
            Ok(())
        } else {
            self.put_json(CF_WINDOWS, &db_key, &window)
        }
    }
}
