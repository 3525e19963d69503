//! Chunk sinks
//!
//! The formatter hands every completed chunk to a [`ChunkSink`] exactly
//! once. Sinks own naming beyond the `_pre`/`_post` suffix, durability and
//! any compression; the core keeps no reference to flushed bytes.

use std::fs::{self, File};
use std::io::Write;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use thiserror::Error;
use tracing::{debug, info};

/// Sink errors
#[derive(Error, Debug)]
pub enum SinkError {
    #[error("I/O error writing chunk {name}: {source}")]
    Io {
        name: String,
        #[source]
        source: std::io::Error,
    },
}

/// Receiver of completed chunks. Implementations must be thread-safe:
/// every formatter worker flushes through the same sink.
pub trait ChunkSink: Send + Sync {
    /// Persist one chunk. Called once per flushed chunk; repeated names can
    /// occur when a late fragment re-opens an already flushed chunk, and the
    /// sink decides whether to tolerate or reject that.
    fn write_chunk(&self, name: &str, bytes: &[u8]) -> Result<(), SinkError>;
}

/// Writes each chunk to `<dir>/<name>` via a temp file and atomic rename.
///
/// A chunk name that already exists is appended to: late fragments re-open
/// their chunk and the pieces are concatenated on disk.
pub struct FileChunkSink {
    dir: PathBuf,
    /// Serializes writes: several workers flush pieces of the same chunk
    write_lock: Mutex<()>,
    bytes_written: AtomicU64,
    chunks_written: AtomicU64,
}

impl FileChunkSink {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            write_lock: Mutex::new(()),
            bytes_written: AtomicU64::new(0),
            chunks_written: AtomicU64::new(0),
        }
    }

    pub fn bytes_written(&self) -> u64 {
        self.bytes_written.load(Ordering::Relaxed)
    }

    pub fn chunks_written(&self) -> u64 {
        self.chunks_written.load(Ordering::Relaxed)
    }

    fn io_err(name: &str, source: std::io::Error) -> SinkError {
        SinkError::Io {
            name: name.to_string(),
            source,
        }
    }
}

impl ChunkSink for FileChunkSink {
    fn write_chunk(&self, name: &str, bytes: &[u8]) -> Result<(), SinkError> {
        let _guard = self.write_lock.lock().unwrap();
        fs::create_dir_all(&self.dir).map_err(|e| Self::io_err(name, e))?;

        let final_path = self.dir.join(name);
        if final_path.exists() {
            // late re-open of an already flushed chunk
            info!(name, bytes = bytes.len(), "appending to existing chunk file");
            let mut f = fs::OpenOptions::new()
                .append(true)
                .open(&final_path)
                .map_err(|e| Self::io_err(name, e))?;
            f.write_all(bytes).map_err(|e| Self::io_err(name, e))?;
        } else {
            let tmp_path = self.dir.join(format!("{name}.tmp"));
            let mut f = File::create(&tmp_path).map_err(|e| Self::io_err(name, e))?;
            f.write_all(bytes).map_err(|e| Self::io_err(name, e))?;
            f.sync_data().map_err(|e| Self::io_err(name, e))?;
            fs::rename(&tmp_path, &final_path).map_err(|e| Self::io_err(name, e))?;
        }

        self.bytes_written
            .fetch_add(bytes.len() as u64, Ordering::Relaxed);
        self.chunks_written.fetch_add(1, Ordering::Relaxed);
        debug!(name, bytes = bytes.len(), "chunk written");
        Ok(())
    }
}
