//! KN-013: Journal storage backends — YAML journal file and SQLite.
//!
//! Both backends expose per-entry compare-and-set on the entry's `revision`
//! so concurrent runs against the same journal cannot both claim a
//! descriptor. The YAML file is rewritten atomically (temp file + rename)
//! while an exclusive lock on `journal.yaml.lock` is held, so separate
//! handles and separate processes serialize their read-modify-write cycles.

use super::error::{KilnError, Result};
use super::types::{entry_key, EntryStatus, JournalEntry};
use fs2::FileExt;
use indexmap::IndexMap;
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

/// Durable store of journal entries keyed by `(module, descriptor)`.
pub trait JournalStore: Send + Sync {
    fn get(&self, module: &str, descriptor: &str) -> Result<Option<JournalEntry>>;

    /// Write `entry` only if the stored revision equals `expected`
    /// (`None` = no entry yet). Returns false when the comparison fails.
    fn compare_and_set(&self, expected: Option<u64>, entry: &JournalEntry) -> Result<bool>;

    /// Delete an entry only if its stored revision equals `expected`.
    fn remove(&self, module: &str, descriptor: &str, expected: u64) -> Result<bool>;

    /// Every entry, in insertion order.
    fn entries(&self) -> Result<Vec<JournalEntry>>;
}

/// Storage backend selector.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Backend {
    #[default]
    Yaml,
    Sqlite,
}

/// Open the journal store for a deployment directory.
pub fn open_store(deployment_dir: &Path, backend: Backend) -> Result<Box<dyn JournalStore>> {
    std::fs::create_dir_all(deployment_dir)?;
    Ok(match backend {
        Backend::Yaml => Box::new(YamlFileStore::new(deployment_dir.join("journal.yaml"))),
        Backend::Sqlite => Box::new(SqliteStore::open(&deployment_dir.join("journal.sqlite"))?),
    })
}

// ============================================================================
// YAML journal file
// ============================================================================

/// On-disk layout of `journal.yaml`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JournalFile {
    pub schema: String,
    pub generator: String,
    pub updated_at: String,
    #[serde(default)]
    pub entries: IndexMap<String, JournalEntry>,
}

impl JournalFile {
    fn empty() -> Self {
        Self {
            schema: "1.0".to_string(),
            generator: format!("kiln {}", env!("CARGO_PKG_VERSION")),
            updated_at: crate::tripwire::eventlog::now_iso8601(),
            entries: IndexMap::new(),
        }
    }
}

/// Exclusive (or shared) advisory lock on a sidecar file; released on drop.
pub(crate) struct FileLock {
    file: File,
}

impl FileLock {
    /// Block until the exclusive lock on `path` is held.
    pub(crate) fn exclusive(path: &Path) -> std::io::Result<Self> {
        let file = Self::open(path)?;
        FileExt::lock_exclusive(&file)?;
        Ok(Self { file })
    }

    /// Block until a shared lock on `path` is held.
    pub(crate) fn shared(path: &Path) -> std::io::Result<Self> {
        let file = Self::open(path)?;
        FileExt::lock_shared(&file)?;
        Ok(Self { file })
    }

    fn open(path: &Path) -> std::io::Result<File> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)
    }
}

impl Drop for FileLock {
    fn drop(&mut self) {
        let _ = FileExt::unlock(&self.file);
    }
}

/// Sidecar lock path for a data file: `journal.yaml` -> `journal.yaml.lock`.
pub(crate) fn lock_path(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_os_string();
    name.push(".lock");
    PathBuf::from(name)
}

/// Temp file next to `path`, unique per process and per write.
pub(crate) fn unique_tmp_path(path: &Path) -> PathBuf {
    static SEQ: AtomicU64 = AtomicU64::new(0);
    let mut name = path.as_os_str().to_os_string();
    name.push(format!(
        ".{}.{}.tmp",
        std::process::id(),
        SEQ.fetch_add(1, Ordering::Relaxed)
    ));
    PathBuf::from(name)
}

/// Write `content` to a unique temp file, then rename it over `path`.
pub(crate) fn write_atomic(path: &Path, content: &str) -> std::io::Result<()> {
    let tmp = unique_tmp_path(path);
    if let Err(e) = std::fs::write(&tmp, content).and_then(|_| std::fs::rename(&tmp, path)) {
        let _ = std::fs::remove_file(&tmp);
        return Err(e);
    }
    Ok(())
}

/// Journal persisted as a single YAML file.
#[derive(Debug)]
pub struct YamlFileStore {
    path: PathBuf,
    lock_path: PathBuf,
}

impl YamlFileStore {
    pub fn new(path: PathBuf) -> Self {
        let lock_path = lock_path(&path);
        Self { path, lock_path }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn load(&self) -> Result<JournalFile> {
        if !self.path.exists() {
            return Ok(JournalFile::empty());
        }
        let content = std::fs::read_to_string(&self.path)?;
        serde_yaml_ng::from_str(&content).map_err(|e| {
            KilnError::Store(format!("invalid journal {}: {}", self.path.display(), e))
        })
    }

    /// Caller must hold the exclusive lock.
    fn save(&self, file: &mut JournalFile) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        file.updated_at = crate::tripwire::eventlog::now_iso8601();
        let yaml = serde_yaml_ng::to_string(file)
            .map_err(|e| KilnError::Store(format!("serialize error: {}", e)))?;
        write_atomic(&self.path, &yaml)?;
        Ok(())
    }

    fn lock_exclusive(&self) -> Result<FileLock> {
        FileLock::exclusive(&self.lock_path).map_err(|e| {
            KilnError::Store(format!("cannot lock {}: {}", self.lock_path.display(), e))
        })
    }

    fn lock_shared(&self) -> Result<FileLock> {
        FileLock::shared(&self.lock_path).map_err(|e| {
            KilnError::Store(format!("cannot lock {}: {}", self.lock_path.display(), e))
        })
    }
}

impl JournalStore for YamlFileStore {
    fn get(&self, module: &str, descriptor: &str) -> Result<Option<JournalEntry>> {
        let _held = self.lock_shared()?;
        Ok(self.load()?.entries.get(&entry_key(module, descriptor)).cloned())
    }

    fn compare_and_set(&self, expected: Option<u64>, entry: &JournalEntry) -> Result<bool> {
        let _held = self.lock_exclusive()?;
        let mut file = self.load()?;
        let key = entry.key();
        let current = file.entries.get(&key).map(|e| e.revision);
        if current != expected {
            return Ok(false);
        }
        file.entries.insert(key, entry.clone());
        self.save(&mut file)?;
        Ok(true)
    }

    fn remove(&self, module: &str, descriptor: &str, expected: u64) -> Result<bool> {
        let _held = self.lock_exclusive()?;
        let mut file = self.load()?;
        let key = entry_key(module, descriptor);
        match file.entries.get(&key) {
            Some(e) if e.revision == expected => {
                file.entries.shift_remove(&key);
                self.save(&mut file)?;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    fn entries(&self) -> Result<Vec<JournalEntry>> {
        let _held = self.lock_shared()?;
        Ok(self.load()?.entries.into_values().collect())
    }
}

// ============================================================================
// SQLite journal
// ============================================================================

const SCHEMA: &str = "CREATE TABLE IF NOT EXISTS journal (
    seq INTEGER PRIMARY KEY AUTOINCREMENT,
    module TEXT NOT NULL,
    descriptor TEXT NOT NULL,
    kind TEXT NOT NULL,
    fingerprint TEXT NOT NULL,
    status TEXT NOT NULL,
    result TEXT,
    error TEXT,
    attempts INTEGER NOT NULL,
    revision INTEGER NOT NULL,
    updated_at TEXT NOT NULL,
    UNIQUE (module, descriptor)
)";

const COLUMNS: &str =
    "module, descriptor, kind, fingerprint, status, result, error, attempts, revision, updated_at";

/// Journal persisted in a SQLite database.
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    pub fn open(path: &Path) -> Result<Self> {
        Self::init(Connection::open(path)?)
    }

    pub fn open_in_memory() -> Result<Self> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self> {
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| KilnError::Store("journal connection poisoned".to_string()))
    }
}

fn out_of_range(column: usize, err: std::num::TryFromIntError) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(column, rusqlite::types::Type::Integer, Box::new(err))
}

fn row_to_entry(row: &rusqlite::Row<'_>) -> rusqlite::Result<JournalEntry> {
    let status: String = row.get(4)?;
    let attempts: i64 = row.get(7)?;
    let revision: i64 = row.get(8)?;
    Ok(JournalEntry {
        module: row.get(0)?,
        descriptor: row.get(1)?,
        kind: row.get(2)?,
        fingerprint: row.get(3)?,
        status: EntryStatus::parse(&status).ok_or_else(|| {
            rusqlite::Error::FromSqlConversionFailure(
                4,
                rusqlite::types::Type::Text,
                format!("unknown status '{}'", status).into(),
            )
        })?,
        result: row.get(5)?,
        error: row.get(6)?,
        attempts: u32::try_from(attempts).map_err(|e| out_of_range(7, e))?,
        revision: u64::try_from(revision).map_err(|e| out_of_range(8, e))?,
        updated_at: row.get(9)?,
    })
}

impl JournalStore for SqliteStore {
    fn get(&self, module: &str, descriptor: &str) -> Result<Option<JournalEntry>> {
        let conn = self.lock()?;
        let sql = format!(
            "SELECT {} FROM journal WHERE module = ?1 AND descriptor = ?2",
            COLUMNS
        );
        Ok(conn
            .query_row(&sql, params![module, descriptor], row_to_entry)
            .optional()?)
    }

    fn compare_and_set(&self, expected: Option<u64>, entry: &JournalEntry) -> Result<bool> {
        let conn = self.lock()?;
        let changed = match expected {
            None => conn.execute(
                &format!(
                    "INSERT INTO journal ({}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
                     ON CONFLICT (module, descriptor) DO NOTHING",
                    COLUMNS
                ),
                params![
                    entry.module,
                    entry.descriptor,
                    entry.kind,
                    entry.fingerprint,
                    entry.status.as_str(),
                    entry.result,
                    entry.error,
                    entry.attempts as i64,
                    entry.revision as i64,
                    entry.updated_at,
                ],
            )?,
            Some(rev) => conn.execute(
                "UPDATE journal SET kind = ?3, fingerprint = ?4, status = ?5, result = ?6,
                     error = ?7, attempts = ?8, revision = ?9, updated_at = ?10
                 WHERE module = ?1 AND descriptor = ?2 AND revision = ?11",
                params![
                    entry.module,
                    entry.descriptor,
                    entry.kind,
                    entry.fingerprint,
                    entry.status.as_str(),
                    entry.result,
                    entry.error,
                    entry.attempts as i64,
                    entry.revision as i64,
                    entry.updated_at,
                    rev as i64,
                ],
            )?,
        };
        Ok(changed == 1)
    }

    fn remove(&self, module: &str, descriptor: &str, expected: u64) -> Result<bool> {
        let conn = self.lock()?;
        let changed = conn.execute(
            "DELETE FROM journal WHERE module = ?1 AND descriptor = ?2 AND revision = ?3",
            params![module, descriptor, expected as i64],
        )?;
        Ok(changed == 1)
    }

    fn entries(&self) -> Result<Vec<JournalEntry>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(&format!("SELECT {} FROM journal ORDER BY seq", COLUMNS))?;
        let rows = stmt.query_map([], row_to_entry)?;
        let mut entries = Vec::new();
        for row in rows {
            entries.push(row?);
        }
        Ok(entries)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(descriptor: &str, status: EntryStatus, revision: u64) -> JournalEntry {
        JournalEntry {
            module: "M".to_string(),
            descriptor: descriptor.to_string(),
            kind: "Token".to_string(),
            fingerprint: "blake3:abc".to_string(),
            status,
            result: None,
            error: None,
            attempts: 1,
            revision,
            updated_at: "2026-10-19T00:00:00Z".to_string(),
        }
    }

    fn exercise_cas(store: &dyn JournalStore) {
        assert!(store.get("M", "token").unwrap().is_none());

        // Insert only when absent
        assert!(store.compare_and_set(None, &entry("token", EntryStatus::Pending, 1)).unwrap());
        assert!(!store.compare_and_set(None, &entry("token", EntryStatus::Pending, 1)).unwrap());

        // Update only on matching revision
        let mut done = entry("token", EntryStatus::Completed, 2);
        done.result = Some("0xaa".to_string());
        assert!(!store.compare_and_set(Some(7), &done).unwrap());
        assert!(store.compare_and_set(Some(1), &done).unwrap());

        let loaded = store.get("M", "token").unwrap().unwrap();
        assert_eq!(loaded, done);

        // Removal is revision-checked too
        assert!(store.compare_and_set(None, &entry("vault", EntryStatus::Failed, 1)).unwrap());
        assert!(!store.remove("M", "vault", 5).unwrap());
        assert!(store.remove("M", "vault", 1).unwrap());
        assert!(store.get("M", "vault").unwrap().is_none());

        let all = store.entries().unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].descriptor, "token");
    }

    #[test]
    fn test_kn013_yaml_store_cas() {
        let dir = tempfile::tempdir().unwrap();
        let store = YamlFileStore::new(dir.path().join("journal.yaml"));
        exercise_cas(&store);
    }

    #[test]
    fn test_kn013_sqlite_store_cas() {
        let store = SqliteStore::open_in_memory().unwrap();
        exercise_cas(&store);
    }

    #[test]
    fn test_kn013_yaml_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("journal.yaml");
        {
            let store = YamlFileStore::new(path.clone());
            store
                .compare_and_set(None, &entry("token", EntryStatus::Pending, 1))
                .unwrap();
        }
        let store = YamlFileStore::new(path.clone());
        let loaded = store.get("M", "token").unwrap().unwrap();
        assert_eq!(loaded.status, EntryStatus::Pending);
        let leftovers = std::fs::read_dir(dir.path())
            .unwrap()
            .flatten()
            .filter(|e| e.file_name().to_string_lossy().ends_with(".tmp"))
            .count();
        assert_eq!(leftovers, 0);
        let content = std::fs::read_to_string(&path).unwrap();
        assert!(content.contains("M#token"));
    }

    #[test]
    fn test_kn013_yaml_two_handles_no_lost_writes() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("journal.yaml");

        std::thread::scope(|s| {
            for worker in 0..2 {
                let path = path.clone();
                s.spawn(move || {
                    let store = YamlFileStore::new(path);
                    for i in 0..50 {
                        let e = entry(&format!("w{worker}_{i}"), EntryStatus::Pending, 1);
                        assert!(store.compare_and_set(None, &e).unwrap());
                    }
                });
            }
        });

        let store = YamlFileStore::new(path.clone());
        assert_eq!(store.entries().unwrap().len(), 100);
        assert!(lock_path(&path).exists());
    }

    #[test]
    fn test_kn013_yaml_two_handles_one_claim() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("journal.yaml");
        let claims = std::sync::atomic::AtomicU32::new(0);

        std::thread::scope(|s| {
            for _ in 0..4 {
                let path = path.clone();
                let claims = &claims;
                s.spawn(move || {
                    let store = YamlFileStore::new(path);
                    if store
                        .compare_and_set(None, &entry("token", EntryStatus::Pending, 1))
                        .unwrap()
                    {
                        claims.fetch_add(1, Ordering::SeqCst);
                    }
                });
            }
        });

        assert_eq!(claims.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_kn013_tmp_paths_unique() {
        let path = Path::new("/state/journal.yaml");
        let a = unique_tmp_path(path);
        let b = unique_tmp_path(path);
        assert_ne!(a, b);
        assert!(a.to_string_lossy().starts_with("/state/journal.yaml."));
        assert_eq!(lock_path(path), PathBuf::from("/state/journal.yaml.lock"));
    }

    #[test]
    fn test_kn013_sqlite_rejects_out_of_range_counters() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("journal.sqlite");
        let store = SqliteStore::open(&path).unwrap();
        {
            let raw = Connection::open(&path).unwrap();
            raw.execute(
                &format!(
                    "INSERT INTO journal ({}) VALUES ('M', 'token', 'Token', 'blake3:abc', \
                     'pending', NULL, NULL, -1, 1, '2026-10-19T00:00:00Z')",
                    COLUMNS
                ),
                [],
            )
            .unwrap();
        }
        assert!(matches!(store.get("M", "token"), Err(KilnError::Store(_))));
    }

    #[test]
    fn test_kn013_sqlite_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("journal.sqlite");
        {
            let store = SqliteStore::open(&path).unwrap();
            store
                .compare_and_set(None, &entry("token", EntryStatus::Failed, 3))
                .unwrap();
        }
        let store = SqliteStore::open(&path).unwrap();
        let loaded = store.get("M", "token").unwrap().unwrap();
        assert_eq!(loaded.status, EntryStatus::Failed);
        assert_eq!(loaded.revision, 3);
    }

    #[test]
    fn test_kn013_yaml_preserves_insertion_order() {
        let dir = tempfile::tempdir().unwrap();
        let store = YamlFileStore::new(dir.path().join("journal.yaml"));
        for id in ["zeta", "alpha", "mid"] {
            store
                .compare_and_set(None, &entry(id, EntryStatus::Pending, 1))
                .unwrap();
        }
        let ids: Vec<_> = store
            .entries()
            .unwrap()
            .into_iter()
            .map(|e| e.descriptor)
            .collect();
        assert_eq!(ids, vec!["zeta", "alpha", "mid"]);
    }

    #[test]
    fn test_kn013_invalid_yaml_journal() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("journal.yaml");
        std::fs::write(&path, "entries: [not: {valid").unwrap();
        let store = YamlFileStore::new(path);
        assert!(matches!(store.get("M", "x"), Err(KilnError::Store(_))));
    }

    #[test]
    fn test_kn013_open_store_creates_dir() {
        let dir = tempfile::tempdir().unwrap();
        let deployment = dir.path().join("chain-80002");
        let store = open_store(&deployment, Backend::Sqlite).unwrap();
        assert!(store.entries().unwrap().is_empty());
        assert!(deployment.join("journal.sqlite").exists());
        let _ = open_store(&deployment, Backend::Yaml).unwrap();
    }
}
