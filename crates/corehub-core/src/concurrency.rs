use crate::CoreError;
use fs2::FileExt;
use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};

/// Lock file name inside a supervisor home directory.
pub const LOCK_FILE: &str = ".corehub.lock";

/// Exclusive advisory lock on a supervisor home directory, so two
/// supervisor processes never drive engines out of the same home.
pub struct HomeLock {
    lock_file: File,
    path: PathBuf,
}

fn open_lock_file(home: &Path) -> Result<(File, PathBuf), CoreError> {
    std::fs::create_dir_all(home)?;
    let path = home.join(LOCK_FILE);
    let file = OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(false)
        .open(&path)?;
    Ok((file, path))
}

impl HomeLock {
    /// Block until the lock on `home` is held.
    pub fn acquire(home: &Path) -> Result<Self, CoreError> {
        let (file, path) = open_lock_file(home)?;
        file.lock_exclusive()
            .map_err(|e| CoreError::Io(std::io::Error::new(std::io::ErrorKind::WouldBlock, e)))?;
        Ok(Self {
            lock_file: file,
            path,
        })
    }

    /// Returns `None` when another holder has the lock.
    pub fn try_acquire(home: &Path) -> Result<Option<Self>, CoreError> {
        let (file, path) = open_lock_file(home)?;
        match file.try_lock_exclusive() {
            Ok(()) => Ok(Some(Self {
                lock_file: file,
                path,
            })),
            Err(_) => Ok(None),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for HomeLock {
    fn drop(&mut self) {
        let _ = self.lock_file.unlock();
    }
}

static SHUTDOWN_REQUESTED: AtomicBool = AtomicBool::new(false);

/// Route SIGINT/SIGTERM into [`shutdown_requested`]. A second signal exits
/// immediately.
pub fn install_signal_handler() {
    let _ = ctrlc::set_handler(move || {
        if SHUTDOWN_REQUESTED.load(Ordering::SeqCst) {
            std::process::exit(130);
        }
        SHUTDOWN_REQUESTED.store(true, Ordering::SeqCst);
        eprintln!("\nshutdown requested, stopping engine...");
    });
}

pub fn shutdown_requested() -> bool {
    SHUTDOWN_REQUESTED.load(Ordering::SeqCst)
}
