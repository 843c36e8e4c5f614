//! Audit storage backends.
//!
//! Every backend is append-only: storing an entry whose id is already present
//! fails with [`AuditError::ImmutableEntry`] and leaves the original untouched.

use crate::entry::AuditEntry;
use crate::error::AuditError;
use crate::logger::AuditFilter;
use async_trait::async_trait;
use std::collections::HashSet;
use std::fs::{self, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};
use uuid::Uuid;

/// Trait for audit storage backends.
#[async_trait]
pub trait AuditStorage: Send + Sync {
    /// Append an entry. Fails if an entry with the same id already exists.
    async fn store(&self, entry: AuditEntry) -> Result<(), AuditError>;

    /// Query entries, newest first.
    async fn query(&self, filter: AuditFilter) -> Result<Vec<AuditEntry>, AuditError>;

    /// Get an entry by ID.
    async fn get(&self, id: Uuid) -> Result<Option<AuditEntry>, AuditError>;
}

#[derive(Default)]
struct EntryLog {
    entries: Vec<AuditEntry>,
    ids: HashSet<Uuid>,
}

impl EntryLog {
    fn insert(&mut self, entry: AuditEntry) -> Result<(), AuditError> {
        if !self.ids.insert(entry.id) {
            return Err(AuditError::ImmutableEntry(entry.id));
        }
        self.entries.push(entry);
        Ok(())
    }

    fn contains(&self, id: &Uuid) -> bool {
        self.ids.contains(id)
    }
}

fn lock_error<T>(err: std::sync::PoisonError<T>) -> AuditError {
    AuditError::StorageError(format!("audit lock poisoned: {err}"))
}

/// In-process storage. Entries live as long as the process.
#[derive(Default)]
pub struct MemoryStorage {
    log: RwLock<EntryLog>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl AuditStorage for MemoryStorage {
    async fn store(&self, entry: AuditEntry) -> Result<(), AuditError> {
        self.log.write().map_err(lock_error)?.insert(entry)
    }

    async fn query(&self, filter: AuditFilter) -> Result<Vec<AuditEntry>, AuditError> {
        let log = self.log.read().map_err(lock_error)?;
        Ok(filter.apply(log.entries.iter()))
    }

    async fn get(&self, id: Uuid) -> Result<Option<AuditEntry>, AuditError> {
        let log = self.log.read().map_err(lock_error)?;
        Ok(log.entries.iter().find(|e| e.id == id).cloned())
    }
}

/// File storage: one JSON object per line, appended, never rewritten.
///
/// Existing lines are loaded at startup so queries and duplicate detection
/// cover entries written by earlier runs.
pub struct FileStorage {
    path: PathBuf,
    log: RwLock<EntryLog>,
}

impl FileStorage {
    /// Open (or create) the log at `path`.
    pub fn new(path: impl AsRef<Path>) -> Result<Self, AuditError> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                fs::create_dir_all(parent)?;
            }
        }

        let mut log = EntryLog::default();
        for entry in Self::load_from_file(&path)? {
            if let Err(err) = log.insert(entry) {
                tracing::warn!(path = %path.display(), "Skipping duplicate audit line: {}", err);
            }
        }
        tracing::info!(path = %path.display(), entries = log.entries.len(), "Loaded audit log");

        Ok(Self {
            path,
            log: RwLock::new(log),
        })
    }

    fn load_from_file(path: &Path) -> Result<Vec<AuditEntry>, AuditError> {
        if !path.exists() {
            return Ok(Vec::new());
        }

        let reader = BufReader::new(fs::File::open(path)?);
        let mut entries = Vec::new();
        for (line_num, line) in reader.lines().enumerate() {
            let line = line?;
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            match serde_json::from_str::<AuditEntry>(line) {
                Ok(entry) => entries.push(entry),
                Err(e) => {
                    tracing::warn!(
                        "Failed to parse audit entry on line {} of {}: {}",
                        line_num + 1,
                        path.display(),
                        e
                    );
                }
            }
        }
        Ok(entries)
    }
}

#[async_trait]
impl AuditStorage for FileStorage {
    async fn store(&self, entry: AuditEntry) -> Result<(), AuditError> {
        let json = serde_json::to_string(&entry)?;

        // Hold the write lock across the append so the duplicate check and
        // the file stay in step.
        let mut log = self.log.write().map_err(lock_error)?;
        if log.contains(&entry.id) {
            return Err(AuditError::ImmutableEntry(entry.id));
        }

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        writeln!(file, "{}", json)?;

        log.insert(entry)
    }

    async fn query(&self, filter: AuditFilter) -> Result<Vec<AuditEntry>, AuditError> {
        let log = self.log.read().map_err(lock_error)?;
        Ok(filter.apply(log.entries.iter()))
    }

    async fn get(&self, id: Uuid) -> Result<Option<AuditEntry>, AuditError> {
        let log = self.log.read().map_err(lock_error)?;
        Ok(log.entries.iter().find(|e| e.id == id).cloned())
    }
}

/// Console storage (prints to stdout, keeps nothing).
pub struct ConsoleStorage;

#[async_trait]
impl AuditStorage for ConsoleStorage {
    async fn store(&self, entry: AuditEntry) -> Result<(), AuditError> {
        println!("{}", entry.to_log_line());
        Ok(())
    }

    async fn query(&self, _filter: AuditFilter) -> Result<Vec<AuditEntry>, AuditError> {
        Ok(vec![])
    }

    async fn get(&self, _id: Uuid) -> Result<Option<AuditEntry>, AuditError> {
        Ok(None)
    }
}

/// Discards everything. Used when auditing is disabled.
pub struct NullStorage;

#[async_trait]
impl AuditStorage for NullStorage {
    async fn store(&self, _entry: AuditEntry) -> Result<(), AuditError> {
        Ok(())
    }

    async fn query(&self, _filter: AuditFilter) -> Result<Vec<AuditEntry>, AuditError> {
        Ok(vec![])
    }

    async fn get(&self, _id: Uuid) -> Result<Option<AuditEntry>, AuditError> {
        Ok(None)
    }
}

/// Persists to an inner backend and echoes each stored entry to stdout.
pub struct DualStorage {
    inner: Arc<dyn AuditStorage>,
}

impl DualStorage {
    pub fn new(inner: Arc<dyn AuditStorage>) -> Self {
        Self { inner }
    }
}

#[async_trait]
impl AuditStorage for DualStorage {
    async fn store(&self, entry: AuditEntry) -> Result<(), AuditError> {
        let line = entry.to_log_line();
        self.inner.store(entry).await?;
        println!("{}", line);
        Ok(())
    }

    async fn query(&self, filter: AuditFilter) -> Result<Vec<AuditEntry>, AuditError> {
        self.inner.query(filter).await
    }

    async fn get(&self, id: Uuid) -> Result<Option<AuditEntry>, AuditError> {
        self.inner.get(id).await
    }
}
