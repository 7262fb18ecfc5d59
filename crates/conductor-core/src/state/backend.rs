//! Durable stores the state checkpoints into.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use crate::error::{Error, Result};

/// Receives the full encoded state whenever a modifying lock scope ends.
pub trait Backend: Send + Sync {
    fn checkpoint(&self, data: &[u8]) -> Result<()>;
}

/// Writes the state to a single file, replacing it atomically.
#[derive(Debug, Clone)]
pub struct FileBackend {
    path: PathBuf,
}

impl FileBackend {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn temp_path(&self) -> PathBuf {
        let mut name = self
            .path
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_else(|| "state".into());
        name.push(".tmp");
        self.path.with_file_name(name)
    }
}

impl Backend for FileBackend {
    fn checkpoint(&self, data: &[u8]) -> Result<()> {
        if let Some(dir) = self.path.parent()
            && !dir.as_os_str().is_empty()
        {
            fs::create_dir_all(dir).map_err(|e| Error::io(dir, e))?;
        }

        let tmp = self.temp_path();
        let mut file = fs::File::create(&tmp).map_err(|e| Error::io(&tmp, e))?;
        file.write_all(data).map_err(|e| Error::io(&tmp, e))?;
        file.sync_all().map_err(|e| Error::io(&tmp, e))?;
        drop(file);

        fs::rename(&tmp, &self.path).map_err(|e| Error::io(&self.path, e))
    }
}

/// Keeps the last checkpoint in memory and counts them.
#[derive(Debug, Default)]
pub struct MemoryBackend {
    inner: Mutex<(Vec<u8>, usize)>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn last(&self) -> Vec<u8> {
        self.inner
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .0
            .clone()
    }

    pub fn checkpoints(&self) -> usize {
        self.inner.lock().unwrap_or_else(|e| e.into_inner()).1
    }
}

impl Backend for MemoryBackend {
    fn checkpoint(&self, data: &[u8]) -> Result<()> {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.0 = data.to_vec();
        inner.1 += 1;
        Ok(())
    }
}
