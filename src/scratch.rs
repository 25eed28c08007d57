//! Registry of scratch files created during a run.
//!
//! Every intermediate file (encoded stream, metadata side-car, unverified
//! container) is created through [`ScratchRegistry`], so a single
//! [`ScratchRegistry::cleanup`] call removes all of them, whether the run
//! finished, failed, or was interrupted.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use log::{debug, warn};

use crate::error::Error;

#[derive(Debug)]
pub struct ScratchRegistry {
    dir: PathBuf,
    files: Mutex<Vec<PathBuf>>,
}

impl ScratchRegistry {
    /// Creates a registry that places scratch files in `dir` by default.
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            files: Mutex::new(Vec::new()),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn files(&self) -> MutexGuard<'_, Vec<PathBuf>> {
        // A poisoned list is still a valid list of paths.
        self.files.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Creates an empty scratch file in the default directory.
    pub fn create(&self, prefix: &str, suffix: &str) -> Result<PathBuf, Error> {
        let dir = self.dir.clone();
        self.create_in(&dir, prefix, suffix)
    }

    /// Creates an empty scratch file in `dir` and registers it for cleanup.
    pub fn create_in(&self, dir: &Path, prefix: &str, suffix: &str) -> Result<PathBuf, Error> {
        fs::create_dir_all(dir).map_err(|source| Error::Scratch {
            path: dir.to_path_buf(),
            source,
        })?;
        let path = tempfile::Builder::new()
            .prefix(prefix)
            .suffix(suffix)
            .tempfile_in(dir)
            .and_then(|file| file.into_temp_path().keep().map_err(|e| e.error))
            .map_err(|source| Error::Scratch {
                path: dir.to_path_buf(),
                source,
            })?;
        debug!("Created scratch file {:?}", path);
        self.files().push(path.clone());
        Ok(path)
    }

    /// Stops tracking `path` without deleting it, used once a scratch file has
    /// been published under its final name.
    pub fn forget(&self, path: &Path) {
        self.files().retain(|p| p != path);
    }

    /// Deletes and unregisters a single scratch file.
    pub fn release(&self, path: &Path) {
        self.forget(path);
        remove_quietly(path);
    }

    /// Number of files currently tracked.
    pub fn len(&self) -> usize {
        self.files().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Deletes every tracked file. Safe to call repeatedly and from an
    /// interrupt handler.
    pub fn cleanup(&self) {
        let files: Vec<PathBuf> = self.files().drain(..).collect();
        for path in files {
            remove_quietly(&path);
        }
    }
}

impl Drop for ScratchRegistry {
    fn drop(&mut self) {
        self.cleanup();
    }
}

fn remove_quietly(path: &Path) {
    match fs::remove_file(path) {
        Ok(()) => debug!("Removed scratch file {:?}", path),
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => warn!("Failed to remove scratch file {:?}: {}", path, e),
    }
}
