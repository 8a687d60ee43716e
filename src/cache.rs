//! Content-addressed completion cache.
//!
//! Entries are keyed by a blake3 digest over every input that shapes a
//! model answer. The SQLite store survives across runs; the in-memory store
//! backs tests and cache-less runs. [`SingleFlight`] serializes concurrent
//! computation of the same signature inside one process.

use async_trait::async_trait;
use fs2::FileExt;
use rusqlite::{params, Connection};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::sync::OwnedMutexGuard;

// =============================================================================
// SIGNATURE
// =============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompletionSignature {
    pub model: String,
    pub language: String,
    pub prompt_hash: String,
    /// Canonical rendering of the request parameters actually sent.
    pub params: String,
    pub compress: bool,
    pub reasoning_effort: Option<String>,
    pub key_hash: String,
}

impl CompletionSignature {
    pub fn new(
        model: &str,
        language: &str,
        prompt: &str,
        params: &str,
        compress: bool,
        reasoning_effort: Option<&str>,
    ) -> Self {
        let prompt_hash = hash_text(&normalize_prompt(prompt));
        let compress_field = if compress { "compress" } else { "plain" };
        let key_hash = hash_fields(&[
            model,
            language,
            &prompt_hash,
            params,
            compress_field,
            reasoning_effort.unwrap_or("-"),
        ]);

        Self {
            model: model.to_string(),
            language: language.to_string(),
            prompt_hash,
            params: params.to_string(),
            compress,
            reasoning_effort: reasoning_effort.map(str::to_string),
            key_hash,
        }
    }

    /// Same inputs addressed to another model.
    pub fn for_model(&self, model: &str) -> Self {
        let key_hash = hash_fields(&[
            model,
            &self.language,
            &self.prompt_hash,
            &self.params,
            if self.compress { "compress" } else { "plain" },
            self.reasoning_effort.as_deref().unwrap_or("-"),
        ]);
        Self {
            model: model.to_string(),
            key_hash,
            ..self.clone()
        }
    }
}

/// Line endings and trailing whitespace never change an answer, so they
/// never change a signature.
pub fn normalize_prompt(prompt: &str) -> String {
    prompt
        .replace("\r\n", "\n")
        .lines()
        .map(str::trim_end)
        .collect::<Vec<_>>()
        .join("\n")
        .trim()
        .to_string()
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CachedCompletion {
    pub model: String,
    pub language: String,
    pub input_cost_picos: i64,
    pub output_cost_picos: i64,
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
    pub reasoning_tokens: u32,
    pub answer: String,
}

#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("cache lock poisoned")]
    Poisoned,
    #[error("task join error: {0}")]
    Join(String),
    #[error("serialization error: {0}")]
    Serde(String),
}

#[async_trait]
pub trait CompletionCache: Send + Sync {
    async fn get(&self, key: &CompletionSignature)
        -> Result<Option<CachedCompletion>, CacheError>;
    async fn put(
        &self,
        key: &CompletionSignature,
        value: &CachedCompletion,
    ) -> Result<(), CacheError>;
    async fn exists(&self, key: &CompletionSignature) -> Result<bool, CacheError>;
    /// Remove an entry by key hash. Returns whether anything was removed.
    async fn delete(&self, key_hash: &str) -> Result<bool, CacheError>;
}

// =============================================================================
// SQLITE STORE
// =============================================================================

#[derive(Clone)]
pub struct SqliteCompletionCache {
    path: PathBuf,
    conn: Arc<Mutex<Connection>>,
}

impl SqliteCompletionCache {
    pub fn new(path: impl AsRef<Path>) -> Result<Self, CacheError> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).ok();
        }
        let conn = Connection::open(&path)?;
        conn.execute_batch(
            "PRAGMA journal_mode=WAL;\
             PRAGMA synchronous=NORMAL;\
             CREATE TABLE IF NOT EXISTS completion_cache (\
               key_hash TEXT PRIMARY KEY,\
               model TEXT NOT NULL,\
               language TEXT NOT NULL,\
               prompt_hash TEXT NOT NULL,\
               params TEXT NOT NULL,\
               compress INTEGER NOT NULL,\
               answer TEXT NOT NULL,\
               prompt_tokens INTEGER NOT NULL,\
               completion_tokens INTEGER NOT NULL,\
               input_cost_picos INTEGER NOT NULL,\
               output_cost_picos INTEGER NOT NULL,\
               created_at INTEGER NOT NULL,\
               updated_at INTEGER NOT NULL,\
               hit_count INTEGER NOT NULL DEFAULT 0 \
             );",
        )?;
        ensure_column(&conn, "reasoning_effort", "TEXT")?;
        ensure_column(&conn, "reasoning_tokens", "INTEGER NOT NULL DEFAULT 0")?;

        Ok(Self {
            path,
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    pub fn default_path() -> PathBuf {
        if let Ok(path) = std::env::var("RAIDRAFT_CACHE_PATH") {
            return PathBuf::from(path);
        }
        PathBuf::from(".raidraft_completion_cache.sqlite")
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn lock_exclusive(&self) -> Result<CacheLock, CacheError> {
        CacheLock::new(&self.path)
    }

    fn with_conn<F, R>(&self, f: F) -> Result<R, CacheError>
    where
        F: FnOnce(&Connection) -> Result<R, CacheError>,
    {
        let guard = self.conn.lock().map_err(|_| CacheError::Poisoned)?;
        f(&guard)
    }

    async fn blocking<F, R>(&self, f: F) -> Result<R, CacheError>
    where
        F: FnOnce(&Connection) -> Result<R, CacheError> + Send + 'static,
        R: Send + 'static,
    {
        let cache = self.clone();
        tokio::task::spawn_blocking(move || cache.with_conn(f))
            .await
            .map_err(|e| CacheError::Join(e.to_string()))?
    }
}

fn ensure_column(conn: &Connection, name: &str, spec: &str) -> Result<(), CacheError> {
    let mut stmt = conn.prepare("PRAGMA table_info(completion_cache)")?;
    let mut rows = stmt.query([])?;
    while let Some(row) = rows.next()? {
        let col_name: String = row.get(1)?;
        if col_name == name {
            return Ok(());
        }
    }
    let sql = format!("ALTER TABLE completion_cache ADD COLUMN {name} {spec}");
    conn.execute(&sql, [])?;
    Ok(())
}

#[async_trait]
impl CompletionCache for SqliteCompletionCache {
    async fn get(
        &self,
        key: &CompletionSignature,
    ) -> Result<Option<CachedCompletion>, CacheError> {
        let key_hash = key.key_hash.clone();
        self.blocking(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT model, language, input_cost_picos, output_cost_picos,\
                        prompt_tokens, completion_tokens, reasoning_tokens, answer \
                 FROM completion_cache WHERE key_hash = ?1",
            )?;
            let mut rows = stmt.query(params![key_hash])?;
            if let Some(row) = rows.next()? {
                let entry = CachedCompletion {
                    model: row.get(0)?,
                    language: row.get(1)?,
                    input_cost_picos: row.get(2)?,
                    output_cost_picos: row.get(3)?,
                    prompt_tokens: row.get::<_, i64>(4)?.max(0) as u32,
                    completion_tokens: row.get::<_, i64>(5)?.max(0) as u32,
                    reasoning_tokens: row.get::<_, i64>(6)?.max(0) as u32,
                    answer: row.get(7)?,
                };
                conn.execute(
                    "UPDATE completion_cache \
                     SET hit_count = hit_count + 1, updated_at = ?1 \
                     WHERE key_hash = ?2",
                    params![now_epoch(), key_hash],
                )?;
                Ok(Some(entry))
            } else {
                Ok(None)
            }
        })
        .await
    }

    async fn put(
        &self,
        key: &CompletionSignature,
        value: &CachedCompletion,
    ) -> Result<(), CacheError> {
        let key = key.clone();
        let value = value.clone();
        self.blocking(move |conn| {
            let now = now_epoch();
            conn.execute(
                "INSERT INTO completion_cache (\
                    key_hash, model, language, prompt_hash, params, compress, reasoning_effort,\
                    answer, prompt_tokens, completion_tokens, reasoning_tokens,\
                    input_cost_picos, output_cost_picos, created_at, updated_at \
                 ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15) \
                 ON CONFLICT(key_hash) DO UPDATE SET \
                    answer = excluded.answer,\
                    prompt_tokens = excluded.prompt_tokens,\
                    completion_tokens = excluded.completion_tokens,\
                    reasoning_tokens = excluded.reasoning_tokens,\
                    input_cost_picos = excluded.input_cost_picos,\
                    output_cost_picos = excluded.output_cost_picos,\
                    updated_at = excluded.updated_at",
                params![
                    key.key_hash,
                    key.model,
                    key.language,
                    key.prompt_hash,
                    key.params,
                    if key.compress { 1 } else { 0 },
                    key.reasoning_effort,
                    value.answer,
                    value.prompt_tokens as i64,
                    value.completion_tokens as i64,
                    value.reasoning_tokens as i64,
                    value.input_cost_picos,
                    value.output_cost_picos,
                    now,
                    now,
                ],
            )?;
            Ok(())
        })
        .await
    }

    async fn exists(&self, key: &CompletionSignature) -> Result<bool, CacheError> {
        let key_hash = key.key_hash.clone();
        self.blocking(move |conn| {
            let count: i64 = conn.query_row(
                "SELECT COUNT(*) FROM completion_cache WHERE key_hash = ?1",
                params![key_hash],
                |row| row.get(0),
            )?;
            Ok(count > 0)
        })
        .await
    }

    async fn delete(&self, key_hash: &str) -> Result<bool, CacheError> {
        let key_hash = key_hash.to_string();
        self.blocking(move |conn| {
            let removed = conn.execute(
                "DELETE FROM completion_cache WHERE key_hash = ?1",
                params![key_hash],
            )?;
            Ok(removed > 0)
        })
        .await
    }
}

#[derive(Debug)]
pub struct CacheLock {
    _file: std::fs::File,
}

impl CacheLock {
    fn new(db_path: &Path) -> Result<Self, CacheError> {
        let mut lock_path = db_path.to_path_buf();
        lock_path.set_extension("lock");
        let file = std::fs::OpenOptions::new()
            .create(true)
            .truncate(false)
            .read(true)
            .write(true)
            .open(lock_path)?;
        file.lock_exclusive()?;
        Ok(Self { _file: file })
    }
}

#[derive(Debug, Serialize)]
pub struct CacheExportRow {
    pub key_hash: String,
    pub model: String,
    pub language: String,
    pub prompt_hash: String,
    pub params: String,
    pub compress: bool,
    pub reasoning_effort: Option<String>,
    pub answer: String,
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
    pub reasoning_tokens: u32,
    pub input_cost_picos: i64,
    pub output_cost_picos: i64,
    pub created_at: i64,
    pub updated_at: i64,
    pub hit_count: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct CachePruneStats {
    pub deleted: usize,
    pub remaining: usize,
}

impl SqliteCompletionCache {
    /// Write every entry as one JSON object per line, most recent first.
    pub async fn export_jsonl(&self, path: impl AsRef<Path>) -> Result<usize, CacheError> {
        let path = path.as_ref().to_path_buf();
        self.blocking(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT key_hash, model, language, prompt_hash, params, compress, reasoning_effort,\
                        answer, prompt_tokens, completion_tokens, reasoning_tokens,\
                        input_cost_picos, output_cost_picos, created_at, updated_at, hit_count \
                 FROM completion_cache ORDER BY updated_at DESC, key_hash",
            )?;
            let mut rows = stmt.query([])?;
            let mut file = std::fs::File::create(path)?;
            let mut written = 0usize;
            while let Some(row) = rows.next()? {
                let record = CacheExportRow {
                    key_hash: row.get(0)?,
                    model: row.get(1)?,
                    language: row.get(2)?,
                    prompt_hash: row.get(3)?,
                    params: row.get(4)?,
                    compress: row.get::<_, i64>(5)? != 0,
                    reasoning_effort: row.get(6)?,
                    answer: row.get(7)?,
                    prompt_tokens: row.get::<_, i64>(8)?.max(0) as u32,
                    completion_tokens: row.get::<_, i64>(9)?.max(0) as u32,
                    reasoning_tokens: row.get::<_, i64>(10)?.max(0) as u32,
                    input_cost_picos: row.get(11)?,
                    output_cost_picos: row.get(12)?,
                    created_at: row.get(13)?,
                    updated_at: row.get(14)?,
                    hit_count: row.get(15)?,
                };
                let line = serde_json::to_string(&record)
                    .map_err(|e| CacheError::Serde(e.to_string()))?;
                use std::io::Write;
                writeln!(file, "{line}")?;
                written += 1;
            }
            Ok(written)
        })
        .await
    }

    pub async fn prune(
        &self,
        max_age_days: Option<u64>,
        max_rows: Option<usize>,
    ) -> Result<CachePruneStats, CacheError> {
        self.blocking(move |conn| {
            let mut deleted: usize = 0;
            if let Some(days) = max_age_days {
                let cutoff = now_epoch().saturating_sub((days as i64).saturating_mul(86_400));
                let removed = conn.execute(
                    "DELETE FROM completion_cache WHERE updated_at < ?1",
                    params![cutoff],
                )?;
                deleted = deleted.saturating_add(removed);
            }

            if let Some(max_rows) = max_rows {
                let count: i64 =
                    conn.query_row("SELECT COUNT(*) FROM completion_cache", [], |row| {
                        row.get(0)
                    })?;
                let keep = max_rows as i64;
                if count > keep {
                    let removed = conn.execute(
                        "DELETE FROM completion_cache WHERE key_hash IN (\
                            SELECT key_hash FROM completion_cache \
                            ORDER BY updated_at DESC LIMIT -1 OFFSET ?1 \
                         )",
                        params![keep],
                    )?;
                    deleted = deleted.saturating_add(removed);
                }
            }

            let remaining: i64 =
                conn.query_row("SELECT COUNT(*) FROM completion_cache", [], |row| row.get(0))?;
            Ok(CachePruneStats {
                deleted,
                remaining: remaining.max(0) as usize,
            })
        })
        .await
    }
}

// =============================================================================
// IN-MEMORY STORE
// =============================================================================

/// Process-local cache. Contents vanish with the process.
#[derive(Debug, Default, Clone)]
pub struct MemoryCompletionCache {
    entries: Arc<Mutex<HashMap<String, CachedCompletion>>>,
}

impl MemoryCompletionCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().map(|m| m.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl CompletionCache for MemoryCompletionCache {
    async fn get(
        &self,
        key: &CompletionSignature,
    ) -> Result<Option<CachedCompletion>, CacheError> {
        let map = self.entries.lock().map_err(|_| CacheError::Poisoned)?;
        Ok(map.get(&key.key_hash).cloned())
    }

    async fn put(
        &self,
        key: &CompletionSignature,
        value: &CachedCompletion,
    ) -> Result<(), CacheError> {
        let mut map = self.entries.lock().map_err(|_| CacheError::Poisoned)?;
        map.insert(key.key_hash.clone(), value.clone());
        Ok(())
    }

    async fn exists(&self, key: &CompletionSignature) -> Result<bool, CacheError> {
        let map = self.entries.lock().map_err(|_| CacheError::Poisoned)?;
        Ok(map.contains_key(&key.key_hash))
    }

    async fn delete(&self, key_hash: &str) -> Result<bool, CacheError> {
        let mut map = self.entries.lock().map_err(|_| CacheError::Poisoned)?;
        Ok(map.remove(key_hash).is_some())
    }
}

// =============================================================================
// SINGLE FLIGHT
// =============================================================================

/// Registry of in-flight computations keyed by signature hash.
///
/// Holding a [`FlightGuard`] means no other task in this process is computing
/// the same signature. Entries are dropped once the last waiter is done.
#[derive(Debug, Default)]
pub struct SingleFlight {
    inflight: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl SingleFlight {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub async fn acquire(self: &Arc<Self>, key_hash: &str) -> Result<FlightGuard, CacheError> {
        let slot = {
            let mut map = self.inflight.lock().map_err(|_| CacheError::Poisoned)?;
            map.entry(key_hash.to_string())
                .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
                .clone()
        };
        let guard = slot.lock_owned().await;
        Ok(FlightGuard {
            key_hash: key_hash.to_string(),
            registry: Arc::clone(self),
            _guard: Some(guard),
        })
    }

    /// Number of signatures currently tracked.
    pub fn pending(&self) -> usize {
        self.inflight.lock().map(|m| m.len()).unwrap_or(0)
    }
}

pub struct FlightGuard {
    key_hash: String,
    registry: Arc<SingleFlight>,
    _guard: Option<OwnedMutexGuard<()>>,
}

impl Drop for FlightGuard {
    fn drop(&mut self) {
        // Release the slot before inspecting waiters.
        self._guard.take();
        if let Ok(mut map) = self.registry.inflight.lock() {
            if let Some(slot) = map.get(&self.key_hash) {
                // Only the registry itself still holds the slot.
                if Arc::strong_count(slot) == 1 {
                    map.remove(&self.key_hash);
                }
            }
        }
    }
}

fn hash_text(text: &str) -> String {
    blake3::hash(text.as_bytes()).to_hex().to_string()
}

fn hash_fields(fields: &[&str]) -> String {
    let mut hasher = blake3::Hasher::new();
    for (idx, field) in fields.iter().enumerate() {
        if idx > 0 {
            hasher.update(b"|");
        }
        hasher.update(field.as_bytes());
    }
    hasher.finalize().to_hex().to_string()
}

fn now_epoch() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs() as i64
}
