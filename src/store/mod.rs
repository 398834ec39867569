//! Shared-store substrate: flock-guarded JSON tables.
//!
//! Each logical table is a single JSON file mapping a string key to a record,
//! paired with a sibling `.lock` file. Every read-modify-write cycle holds an
//! exclusive OS advisory lock on the lock file for its whole duration, so the
//! cycle is atomic with respect to any other caller, including unrelated
//! processes. Data files are replaced via write-temp-then-rename, so readers
//! never observe a torn write. An in-process mutex alone would not give the
//! cross-process guarantee the lease protocol needs.

pub mod lease;
pub mod liveness;

use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::{Result, WardenError};

/// Upper bound on waiting for the table lock. Critical sections are tiny
/// (load, mutate, rename), so hitting this means something is wedged.
const LOCK_WAIT_TIMEOUT: Duration = Duration::from_secs(5);
const LOCK_POLL_INTERVAL: Duration = Duration::from_millis(5);
const LOCK_POLL_JITTER_MS: u64 = 5;

/// One on-disk table keyed by string.
#[derive(Debug, Clone)]
pub(crate) struct TableFile {
    data_path: PathBuf,
    lock_path: PathBuf,
}

impl TableFile {
    pub fn new(dir: &Path, name: &str) -> Result<Self> {
        fs::create_dir_all(dir)?;
        Ok(Self {
            data_path: dir.join(format!("{name}.json")),
            lock_path: dir.join(format!("{name}.lock")),
        })
    }

    /// Run `f` over the table under the exclusive lock and persist the result.
    pub fn update<T, R, F>(&self, f: F) -> Result<R>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce(&mut HashMap<String, T>) -> R,
    {
        let _guard = FileLock::exclusive(&self.lock_path)?;
        let mut table = self.load()?;
        let out = f(&mut table);
        self.save(&table)?;
        Ok(out)
    }

    /// Snapshot the table under a shared lock.
    pub fn read<T>(&self) -> Result<HashMap<String, T>>
    where
        T: DeserializeOwned,
    {
        let _guard = FileLock::shared(&self.lock_path)?;
        self.load()
    }

    fn load<T>(&self) -> Result<HashMap<String, T>>
    where
        T: DeserializeOwned,
    {
        match fs::read(&self.data_path) {
            Ok(bytes) if bytes.is_empty() => Ok(HashMap::new()),
            Ok(bytes) => Ok(serde_json::from_slice(&bytes)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(HashMap::new()),
            Err(e) => Err(e.into()),
        }
    }

    fn save<T>(&self, table: &HashMap<String, T>) -> Result<()>
    where
        T: Serialize,
    {
        let tmp = self.data_path.with_extension("json.tmp");
        fs::write(&tmp, serde_json::to_vec_pretty(table)?)?;
        fs::rename(&tmp, &self.data_path)?;
        Ok(())
    }
}

/// OS advisory lock on a file, released when dropped (closing the descriptor
/// releases the flock).
struct FileLock {
    _file: File,
}

impl FileLock {
    fn exclusive(path: &Path) -> Result<Self> {
        Self::acquire(path, true)
    }

    fn shared(path: &Path) -> Result<Self> {
        Self::acquire(path, false)
    }

    fn acquire(path: &Path, exclusive: bool) -> Result<Self> {
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(false)
            .open(path)?;

        let start = Instant::now();
        loop {
            if try_flock(&file, exclusive)? {
                return Ok(Self { _file: file });
            }
            let waited = start.elapsed();
            if waited >= LOCK_WAIT_TIMEOUT {
                return Err(WardenError::LockTimeout {
                    path: path.display().to_string(),
                    waited_ms: waited.as_millis() as u64,
                });
            }
            let jitter = Duration::from_millis(rand::random::<u64>() % (LOCK_POLL_JITTER_MS + 1));
            std::thread::sleep(LOCK_POLL_INTERVAL + jitter);
        }
    }
}

/// Non-blocking flock attempt. Returns `Ok(false)` while another holder is in
/// its critical section.
#[cfg(unix)]
fn try_flock(file: &File, exclusive: bool) -> Result<bool> {
    use std::os::unix::io::AsRawFd;

    let op = if exclusive { libc::LOCK_EX } else { libc::LOCK_SH };
    // SAFETY: flock on a file descriptor owned by `file`; LOCK_NB makes the
    // call non-blocking.
    let rc = unsafe { libc::flock(file.as_raw_fd(), op | libc::LOCK_NB) };
    if rc == 0 {
        return Ok(true);
    }
    let err = std::io::Error::last_os_error();
    if err.kind() == std::io::ErrorKind::WouldBlock {
        return Ok(false);
    }
    Err(err.into())
}

#[cfg(not(unix))]
fn try_flock(_file: &File, _exclusive: bool) -> Result<bool> {
    Ok(true)
}
