//! Persisted cache files
//!
//! One JSON file per cached collection, written with temp-file + atomic
//! rename, a rotating backup chain, and optional gzip compression. Files are
//! self-describing: a format version and the schema revision they were
//! written under sit at the head of the document.

use std::fs;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{CoreError, CoreResult};

/// Current on-disk format version.
const FORMAT_VERSION: u32 = 1;
/// Gzip magic bytes, used to sniff compressed files on load.
const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];

#[derive(Serialize, Deserialize)]
struct FileHead<T> {
    format: u32,
    schema_rev: u32,
    data: T,
}

/// Handle on a directory of persisted cache files.
#[derive(Debug, Clone)]
pub struct CacheDir {
    root: PathBuf,
    backup_count: u32,
    compress: bool,
    file_mode: Option<u32>,
}

impl CacheDir {
    /// Open (and create if needed) a cache directory.
    pub fn open(root: impl Into<PathBuf>) -> CoreResult<CacheDir> {
        let root = root.into();
        fs::create_dir_all(&root).map_err(|e| CoreError::cache_io(root.display().to_string(), e))?;
        Ok(CacheDir {
            root,
            backup_count: 1,
            compress: false,
            file_mode: None,
        })
    }

    /// Number of rotated backups kept per file (`<name>.bak.1` ..).
    pub fn with_backup_count(mut self, count: u32) -> CacheDir {
        self.backup_count = count;
        self
    }

    /// Gzip-compress files on write.
    pub fn with_compression(mut self, compress: bool) -> CacheDir {
        self.compress = compress;
        self
    }

    /// Unix permission bits applied to written files.
    pub fn with_file_mode(mut self, mode: u32) -> CacheDir {
        self.file_mode = Some(mode);
        self
    }

    fn path_of(&self, name: &str) -> PathBuf {
        self.root.join(name)
    }

    /// Atomically persist a value under `name`.
    pub fn save<T: Serialize>(&self, name: &str, schema_rev: u32, value: &T) -> CoreResult<()> {
        let head = FileHead {
            format: FORMAT_VERSION,
            schema_rev,
            data: value,
        };
        let mut bytes = serde_json::to_vec(&head)?;
        if self.compress {
            let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
            encoder
                .write_all(&bytes)
                .and_then(|()| encoder.finish())
                .map(|compressed| bytes = compressed)
                .map_err(|e| CoreError::cache_io(name, e))?;
        }

        let target = self.path_of(name);
        let tmp = self.path_of(&format!(".{name}.tmp"));
        fs::write(&tmp, &bytes).map_err(|e| CoreError::cache_io(name, e))?;
        self.apply_mode(&tmp, name)?;

        self.rotate_backups(name)?;
        fs::rename(&tmp, &target).map_err(|e| CoreError::cache_io(name, e))?;
        debug!(file = %target.display(), bytes = bytes.len(), "cache file saved");
        Ok(())
    }

    /// Load a value saved under `name`. Returns `None` when the file does
    /// not exist, and the schema revision it was written under otherwise.
    pub fn load<T: DeserializeOwned>(&self, name: &str) -> CoreResult<Option<(u32, T)>> {
        let path = self.path_of(name);
        let raw = match fs::read(&path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(CoreError::cache_io(name, e)),
        };

        let bytes = if raw.starts_with(&GZIP_MAGIC) {
            let mut decoder = GzDecoder::new(raw.as_slice());
            let mut out = Vec::new();
            decoder
                .read_to_end(&mut out)
                .map_err(|e| CoreError::cache_io(name, e))?;
            out
        } else {
            raw
        };

        let head: FileHead<T> = serde_json::from_slice(&bytes)
            .map_err(|e| CoreError::corrupt_cache(name, e.to_string()))?;
        if head.format != FORMAT_VERSION {
            return Err(CoreError::UnsupportedCacheVersion {
                file: name.to_string(),
                version: head.format,
            });
        }
        Ok(Some((head.schema_rev, head.data)))
    }

    /// Remove a file and its backup chain.
    pub fn delete(&self, name: &str) -> CoreResult<()> {
        let mut paths = vec![self.path_of(name)];
        for i in 1..=self.backup_count {
            paths.push(self.path_of(&format!("{name}.bak.{i}")));
        }
        for path in paths {
            match fs::remove_file(&path) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(CoreError::cache_io(name, e)),
            }
        }
        Ok(())
    }

    fn rotate_backups(&self, name: &str) -> CoreResult<()> {
        let current = self.path_of(name);
        if self.backup_count == 0 || !current.exists() {
            return Ok(());
        }
        for i in (1..self.backup_count).rev() {
            let from = self.path_of(&format!("{name}.bak.{i}"));
            if from.exists() {
                let to = self.path_of(&format!("{name}.bak.{}", i + 1));
                fs::rename(&from, &to).map_err(|e| CoreError::cache_io(name, e))?;
            }
        }
        let first = self.path_of(&format!("{name}.bak.1"));
        fs::rename(&current, &first).map_err(|e| CoreError::cache_io(name, e))?;
        Ok(())
    }

    #[cfg(unix)]
    fn apply_mode(&self, path: &Path, name: &str) -> CoreResult<()> {
        use std::os::unix::fs::PermissionsExt;
        if let Some(mode) = self.file_mode {
            fs::set_permissions(path, fs::Permissions::from_mode(mode))
                .map_err(|e| CoreError::cache_io(name, e))?;
        }
        Ok(())
    }

    #[cfg(not(unix))]
    fn apply_mode(&self, _path: &Path, _name: &str) -> CoreResult<()> {
        Ok(())
    }
}
