//! Directory cache backend
//!
//! # Layout
//!
//! ```text
//! cache-dir/                   # mode 0700
//! ├── acme_account+key         # ACME account (JSON)
//! ├── example.com              # certificate bundle (JSON envelope)
//! └── .example.com.tmp-123-4   # in-progress write, renamed into place
//! ```
//!
//! Writes go to a dot-prefixed temp file created with mode 0600 in the same
//! directory, are fsynced, then renamed over the destination.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use tracing::{debug, info, trace, warn};

use super::{check_key, Cache};
use crate::error::CacheError;

/// Cache storing one file per key
#[derive(Debug)]
pub struct DirCache {
    dir: PathBuf,
    temp_counter: AtomicU64,
}

impl DirCache {
    /// Open a cache directory, creating it with mode 0700 if absent
    ///
    /// # Errors
    ///
    /// Returns an error if the path exists but is not a directory or the
    /// directory cannot be created.
    pub fn new(dir: impl AsRef<Path>) -> Result<Self, CacheError> {
        let dir = dir.as_ref();

        if dir.exists() && !dir.is_dir() {
            return Err(CacheError::Io(std::io::Error::new(
                std::io::ErrorKind::AlreadyExists,
                format!("{} exists and is not a directory", dir.display()),
            )));
        }

        if !dir.exists() {
            fs::create_dir_all(dir)?;

            #[cfg(unix)]
            {
                use std::os::unix::fs::PermissionsExt;
                fs::set_permissions(dir, fs::Permissions::from_mode(0o700))?;
            }

            info!(cache_dir = %dir.display(), "Created certificate cache directory");
        } else {
            debug!(cache_dir = %dir.display(), "Using existing certificate cache directory");
        }

        Ok(Self {
            dir: dir.to_path_buf(),
            temp_counter: AtomicU64::new(0),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, key: &str) -> Result<PathBuf, CacheError> {
        check_key(key)?;
        Ok(self.dir.join(key))
    }

    fn temp_path_for(&self, key: &str) -> PathBuf {
        let n = self.temp_counter.fetch_add(1, Ordering::Relaxed);
        self.dir
            .join(format!(".{}.tmp-{}-{}", key, std::process::id(), n))
    }
}

/// Write `data` to `temp`, fsync, and rename it over `dest`
fn write_atomic(temp: &Path, dest: &Path, data: &[u8]) -> std::io::Result<()> {
    let result = (|| {
        let mut options = fs::OpenOptions::new();
        options.write(true).create_new(true);

        #[cfg(unix)]
        {
            use std::os::unix::fs::OpenOptionsExt;
            options.mode(0o600);
        }

        let mut file = options.open(temp)?;
        file.write_all(data)?;
        file.sync_all()?;
        drop(file);

        fs::rename(temp, dest)
    })();

    if result.is_err() {
        let _ = fs::remove_file(temp);
    }
    result
}

#[async_trait]
impl Cache for DirCache {
    async fn get(&self, key: &str) -> Result<Vec<u8>, CacheError> {
        let path = self.path_for(key)?;

        match tokio::fs::read(&path).await {
            Ok(data) => {
                trace!(key = %key, bytes = data.len(), "Cache read");
                Ok(data)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Err(CacheError::Miss),
            Err(e) => Err(CacheError::Io(e)),
        }
    }

    async fn put(&self, key: &str, data: &[u8]) -> Result<(), CacheError> {
        let dest = self.path_for(key)?;
        let temp = self.temp_path_for(key);
        let data = data.to_vec();

        tokio::task::spawn_blocking(move || write_atomic(&temp, &dest, &data))
            .await
            .map_err(|e| CacheError::Io(std::io::Error::other(e)))??;

        debug!(key = %key, "Cache entry written");
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), CacheError> {
        let path = self.path_for(key)?;

        match tokio::fs::remove_file(&path).await {
            Ok(()) => {
                debug!(key = %key, "Cache entry deleted");
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(CacheError::Io(e)),
        }
    }

    async fn keys(&self) -> Result<Vec<String>, CacheError> {
        let mut keys = Vec::new();
        let mut entries = tokio::fs::read_dir(&self.dir).await?;

        while let Some(entry) = entries.next_entry().await? {
            if !entry.file_type().await?.is_file() {
                continue;
            }
            match entry.file_name().into_string() {
                Ok(name) if check_key(&name).is_ok() => keys.push(name),
                Ok(_) => {}
                Err(name) => {
                    warn!(name = ?name, "Skipping cache file with non UTF-8 name");
                }
            }
        }

        keys.sort();
        Ok(keys)
    }
}
