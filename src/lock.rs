use std::fs::{File, OpenOptions};
use std::io::ErrorKind;
use std::thread;
use std::time::{Duration, Instant};

use camino::Utf8Path;
use fs4::FileExt;
use tracing::trace;

use crate::error::MobilityError;

/// How long `ScopedLock::acquire` keeps retrying a contended lock before
/// giving up with `MobilityError::LockTimeout`. The original behavior here
/// was unbounded; blocking a caller forever is worse than failing loudly.
pub const ACQUIRE_TIMEOUT: Duration = Duration::from_secs(5);

const RETRY_BACKOFF: Duration = Duration::from_millis(25);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockMode {
    Shared,
    Exclusive,
}

impl LockMode {
    fn as_str(self) -> &'static str {
        match self {
            LockMode::Shared => "shared",
            LockMode::Exclusive => "exclusive",
        }
    }
}

/// Advisory file lock held for the lifetime of the value.
///
/// The lock file is created on demand and never deleted; its content is
/// meaningless. Shared locks admit any number of concurrent readers,
/// exclusive locks exclude every other holder. The lock is released on drop,
/// so every exit path (including panics unwinding through the holder's
/// frame) gives it back.
#[derive(Debug)]
pub struct ScopedLock {
    file: File,
}

impl ScopedLock {
    pub fn shared(path: &Utf8Path) -> Result<Self, MobilityError> {
        Self::acquire(path, LockMode::Shared)
    }

    pub fn exclusive(path: &Utf8Path) -> Result<Self, MobilityError> {
        Self::acquire(path, LockMode::Exclusive)
    }

    pub fn acquire(path: &Utf8Path, mode: LockMode) -> Result<Self, MobilityError> {
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .open(path.as_std_path())
            .map_err(|err| MobilityError::Filesystem(format!("open lock {path}: {err}")))?;

        let started = Instant::now();
        loop {
            // Qualified calls: std's own `File::try_lock_shared` would
            // otherwise shadow the fs4 trait method and return a different
            // error type.
            let attempt = match mode {
                LockMode::Shared => FileExt::try_lock_shared(&file),
                LockMode::Exclusive => FileExt::try_lock_exclusive(&file),
            };
            match attempt {
                Ok(()) => {
                    trace!(path = %path, mode = mode.as_str(), "lock acquired");
                    return Ok(Self { file });
                }
                Err(err) if err.kind() == ErrorKind::WouldBlock => {
                    if started.elapsed() >= ACQUIRE_TIMEOUT {
                        return Err(MobilityError::LockTimeout {
                            path: path.to_owned(),
                            mode: mode.as_str(),
                            waited_ms: started.elapsed().as_millis() as u64,
                        });
                    }
                    thread::sleep(RETRY_BACKOFF);
                }
                Err(err) => {
                    return Err(MobilityError::Filesystem(format!(
                        "lock {path}: {err}"
                    )));
                }
            }
        }
    }
}

impl Drop for ScopedLock {
    fn drop(&mut self) {
        let _ = FileExt::unlock(&self.file);
    }
}
