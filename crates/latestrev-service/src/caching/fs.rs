use std::fmt;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use tempfile::NamedTempFile;

/// Decides how payloads of the durable tier are persisted.
///
/// Implementations receive the absolute path an entry is later looked up at, and must make the
/// complete payload visible under that path.
pub trait CacheWriter: fmt::Debug + Send + Sync {
    /// Persists `contents` at `path`, replacing any previous file.
    fn write(&self, path: &Path, contents: &[u8]) -> io::Result<()>;
}

/// Writes payloads to a temporary file first and then atomically moves it into place.
///
/// Readers thus never observe partially written files.
#[derive(Debug, Clone)]
pub struct AtomicFileWriter {
    /// Directory for temporary files, on the same filesystem as the cache.
    tmp_dir: PathBuf,
}

impl AtomicFileWriter {
    /// Creates a writer that stages temporary files in `<cache_dir>/tmp`.
    pub fn new(cache_dir: &Path) -> Self {
        Self {
            tmp_dir: cache_dir.join("tmp"),
        }
    }
}

impl CacheWriter for AtomicFileWriter {
    fn write(&self, path: &Path, contents: &[u8]) -> io::Result<()> {
        std::fs::create_dir_all(&self.tmp_dir)?;
        let mut temp_file = NamedTempFile::new_in(&self.tmp_dir)?;
        temp_file.write_all(contents)?;
        temp_file.flush()?;
        persist_tempfile(temp_file, path)?;
        Ok(())
    }
}

/// Moves `temp_file` to `cache_path`, creating its parent directories.
///
/// Directories might be removed concurrently by someone cleaning up the cache, so the
/// operations are retried a couple of times.
fn persist_tempfile(mut temp_file: NamedTempFile, cache_path: &Path) -> io::Result<std::fs::File> {
    let parent = cache_path
        .parent()
        .ok_or_else(|| io::Error::other("no parent directory to persist item"))?;

    const MAX_RETRIES: usize = 2;
    let mut retries = 0;
    let file = loop {
        retries += 1;

        if let Err(e) = std::fs::create_dir_all(parent) {
            sentry::with_scope(
                |scope| scope.set_extra("path", parent.display().to_string().into()),
                || tracing::error!("Failed to create cache directory: {:?}", e),
            );
            if retries > MAX_RETRIES {
                return Err(e);
            }
            continue;
        }

        match temp_file.persist(cache_path) {
            Ok(file) => break file,
            Err(e) => {
                temp_file = e.file;
                let err = e.error;
                sentry::with_scope(
                    |scope| scope.set_extra("path", cache_path.display().to_string().into()),
                    || tracing::error!("Failed to create cache file: {:?}", err),
                );
                if retries > MAX_RETRIES {
                    return Err(err);
                }
                continue;
            }
        }
    };
    Ok(file)
}

/// Reads a cache file, returning `None` if it does not exist.
pub async fn read_cache_file(path: &Path) -> io::Result<Option<Vec<u8>>> {
    match tokio::fs::read(path).await {
        Ok(contents) => Ok(Some(contents)),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e),
    }
}
