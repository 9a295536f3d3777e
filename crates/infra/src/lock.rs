//! Cross-invocation mutual exclusion for jobs.
//!
//! A job acquires its [`LockKey`] before doing anything else and holds it for
//! the whole invocation. Acquisition waits a bounded amount of time; a timeout
//! is reported as `Ok(false)` (another instance is running), never as an error.

use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::path::PathBuf;
use std::sync::{Mutex, PoisonError};
use std::thread;
use std::time::{Duration, Instant};

use chrono::Utc;
use fs2::FileExt;
use sha1::{Digest, Sha1};
use tracing::{debug, warn};

use mailops_core::{RunId, Signature};

/// Stable identity of a lockable job: the SHA-1 of its fully-qualified name.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct LockKey(String);

impl LockKey {
    pub fn for_job(qualified_name: &str) -> Self {
        let mut digest = [0u8; 20];
        digest.copy_from_slice(&Sha1::digest(qualified_name.as_bytes()));
        Self(Signature::from_digest(&digest).to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl core::fmt::Display for LockKey {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Lock errors (I/O on the lock provider, never contention).
#[derive(Debug, thiserror::Error)]
pub enum LockError {
    #[error("lock directory {path} unavailable: {source}")]
    Directory { path: PathBuf, source: io::Error },
    #[error("lock {key} failed: {source}")]
    Io { key: LockKey, source: io::Error },
}

/// Exclusive lock keyed by job identity.
pub trait ProcessMutex: Send + Sync {
    /// Try to become the holder of `key` on behalf of `run_id` for up to
    /// `max_wait`.
    ///
    /// Returns `Ok(false)` on timeout, without side effects.
    fn acquire(&self, key: &LockKey, run_id: RunId, max_wait: Duration) -> Result<bool, LockError>;

    /// Release `key`. A no-op when this process does not hold it.
    fn release(&self, key: &LockKey);
}

/// RAII holder of a [`ProcessMutex`] key; releases on drop.
pub struct JobLock<'a> {
    mutex: &'a dyn ProcessMutex,
    key: LockKey,
}

impl<'a> JobLock<'a> {
    /// Acquire `key` for `run_id`, returning `None` if another holder kept it
    /// for `max_wait`.
    pub fn acquire(
        mutex: &'a dyn ProcessMutex,
        key: LockKey,
        run_id: RunId,
        max_wait: Duration,
    ) -> Result<Option<Self>, LockError> {
        if mutex.acquire(&key, run_id, max_wait)? {
            Ok(Some(Self { mutex, key }))
        } else {
            Ok(None)
        }
    }
}

impl Drop for JobLock<'_> {
    fn drop(&mut self) {
        self.mutex.release(&self.key);
    }
}

impl core::fmt::Debug for JobLock<'_> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("JobLock").field("key", &self.key).finish()
    }
}

/// Advisory file locks under a shared directory.
///
/// One `<key>.lock` file per identity; the holder writes its pid and run id into
/// it for operators, followed by its label and acquisition time. Lock files are never deleted, the
/// advisory lock on the open handle is the only source of truth.
#[derive(Debug)]
pub struct FileMutex {
    dir: PathBuf,
    poll_interval: Duration,
    holder_label: String,
    held: Mutex<HashMap<LockKey, File>>,
}

impl FileMutex {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            poll_interval: Duration::from_millis(100),
            holder_label: String::new(),
            held: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    /// Free-form holder description written into the lock file next to the run id.
    pub fn with_holder_label(mut self, label: impl Into<String>) -> Self {
        self.holder_label = label.into();
        self
    }

    pub(crate) fn path_for(&self, key: &LockKey) -> PathBuf {
        self.dir.join(format!("{}.lock", key.as_str()))
    }

    fn open(&self, key: &LockKey) -> Result<File, LockError> {
        std::fs::create_dir_all(&self.dir).map_err(|source| LockError::Directory {
            path: self.dir.clone(),
            source,
        })?;
        OpenOptions::new()
            .create(true)
            .truncate(false)
            .read(true)
            .write(true)
            .open(self.path_for(key))
            .map_err(|source| LockError::Io {
                key: key.clone(),
                source,
            })
    }

    fn write_holder_record(&self, file: &mut File, run_id: RunId) -> io::Result<()> {
        file.set_len(0)?;
        writeln!(file, "pid={}", std::process::id())?;
        writeln!(file, "run_id={run_id}")?;
        writeln!(file, "holder={}", self.holder_label)?;
        writeln!(file, "acquired_at={}", Utc::now().to_rfc3339())?;
        file.flush()
    }
}

fn is_contended(err: &io::Error) -> bool {
    err.kind() == io::ErrorKind::WouldBlock
        || err.raw_os_error() == fs2::lock_contended_error().raw_os_error()
}

impl ProcessMutex for FileMutex {
    fn acquire(&self, key: &LockKey, run_id: RunId, max_wait: Duration) -> Result<bool, LockError> {
        let mut held = self.held.lock().unwrap_or_else(PoisonError::into_inner);
        if held.contains_key(key) {
            debug!(lock = %key, "lock already held by this process");
            return Ok(false);
        }

        let mut file = self.open(key)?;
        let started = Instant::now();

        loop {
            match file.try_lock_exclusive() {
                Ok(()) => {
                    if let Err(err) = self.write_holder_record(&mut file, run_id) {
                        warn!(lock = %key, error = %err, "failed to write lock holder record");
                    }
                    debug!(lock = %key, "lock acquired");
                    held.insert(key.clone(), file);
                    return Ok(true);
                }
                Err(err) if is_contended(&err) => {
                    let waited = started.elapsed();
                    if waited >= max_wait {
                        debug!(lock = %key, waited_ms = waited.as_millis() as u64, "lock busy");
                        return Ok(false);
                    }
                    thread::sleep(self.poll_interval.min(max_wait - waited));
                }
                Err(source) => {
                    return Err(LockError::Io {
                        key: key.clone(),
                        source,
                    });
                }
            }
        }
    }

    fn release(&self, key: &LockKey) {
        let mut held = self.held.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(file) = held.remove(key) {
            if let Err(err) = FileExt::unlock(&file) {
                // Closing the handle below drops the lock anyway.
                warn!(lock = %key, error = %err, "explicit unlock failed");
            }
            debug!(lock = %key, "lock released");
        }
    }
}
