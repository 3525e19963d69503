//! Per-worker chunk buffer
//!
//! Maps chunk keys to growing byte strings of appended fragments. Keys are
//! integers plus a part tag; the zero-padded decimal name (with an optional
//! `_pre`/`_post` suffix) is only rendered when a chunk is handed to the
//! sink or named in a diagnostic.
//!
//! Fragments are never discarded here: a fragment older than everything
//! buffered still lands in its (possibly re-created) chunk, with a warning.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{info, warn};

use super::fragment::channel_of;
use crate::sink::{ChunkSink, SinkError};

/// Which file of the chunk triple a buffer entry belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ChunkPart {
    /// Leading overlap copy, stitched into the previous chunk downstream
    Pre,
    /// The chunk proper
    Full,
    /// Trailing overlap copy
    Post,
}

/// Chunk identity: numeric id plus part tag
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ChunkKey {
    pub id: i64,
    pub part: ChunkPart,
}

impl ChunkKey {
    pub fn full(id: i64) -> Self {
        Self {
            id,
            part: ChunkPart::Full,
        }
    }

    /// Render the on-disk name, zero-padded to `width`
    pub fn name(&self, width: usize) -> String {
        match self.part {
            ChunkPart::Full => format!("{:0width$}", self.id),
            ChunkPart::Pre => format!("{:0width$}_pre", self.id),
            ChunkPart::Post => format!("{:0width$}_post", self.id),
        }
    }
}

/// Time-base and housekeeping parameters for chunk routing
#[derive(Debug, Clone)]
pub struct ChunkConfig {
    /// Chunk length in ns (without overlap)
    pub chunk_length: i64,
    /// Overlap window in ns
    pub chunk_overlap: i64,
    /// Zero-pad width of rendered names
    pub name_length: usize,
    /// Flush chunks this many ids behind the newest buffered one
    pub buffer_num_chunks: i64,
    /// Warn when a fragment lands this many chunks behind the buffer
    pub warn_if_older_than: i64,
    /// Flush chunks untouched for this long
    pub flush_idle: Duration,
}

impl ChunkConfig {
    /// Chunk pitch on the time axis
    pub fn full_chunk_length(&self) -> i64 {
        self.chunk_length + self.chunk_overlap
    }
}

impl Default for ChunkConfig {
    fn default() -> Self {
        Self {
            chunk_length: 0x7fff_ffff,
            chunk_overlap: 50_000_000,
            name_length: 6,
            buffer_num_chunks: 4,
            warn_if_older_than: 2,
            flush_idle: Duration::from_millis(1000),
        }
    }
}

#[derive(Debug)]
struct PendingChunk {
    bytes: Vec<u8>,
    last_seen: Instant,
}

/// Accumulates fragments per chunk until they are flushed to the sink.
/// One instance per worker, never shared.
pub struct ChunkBuffer {
    config: ChunkConfig,
    chunks: HashMap<ChunkKey, PendingChunk>,
    /// Bytes currently buffered, exported for monitoring
    buffered_bytes: Arc<AtomicU64>,
}

impl ChunkBuffer {
    pub fn new(config: ChunkConfig, buffered_bytes: Arc<AtomicU64>) -> Self {
        Self {
            config,
            chunks: HashMap::new(),
            buffered_bytes,
        }
    }

    pub fn pending_chunks(&self) -> usize {
        self.chunks.len()
    }

    fn id_range(&self) -> Option<(i64, i64)> {
        let mut ids = self.chunks.keys().map(|k| k.id);
        let first = ids.next()?;
        let (mut min, mut max) = (first, first);
        for id in ids {
            min = min.min(id);
            max = max.max(id);
        }
        Some((min, max))
    }

    fn append(&mut self, key: ChunkKey, fragment: &[u8]) {
        let entry = self.chunks.entry(key).or_insert_with(|| PendingChunk {
            bytes: Vec::new(),
            last_seen: Instant::now(),
        });
        entry.bytes.extend_from_slice(fragment);
        entry.last_seen = Instant::now();
        self.buffered_bytes
            .fetch_add(fragment.len() as u64, Ordering::Relaxed);
    }

    /// Route one fragment by its timestamp.
    ///
    /// A fragment inside the trailing overlap window is replicated into the
    /// current chunk's `_post` file and the next chunk's `_pre` file;
    /// everything else gets a single copy under the bare chunk id.
    pub fn add_fragment(&mut self, fragment: &[u8], timestamp: i64) {
        let full_len = self.config.full_chunk_length();
        let chunk_id = timestamp / full_len;
        let in_overlap = (chunk_id + 1) * full_len - timestamp <= self.config.chunk_overlap;

        if let Some((min_id, max_id)) = self.id_range() {
            if min_id - chunk_id > self.config.warn_if_older_than {
                warn!(
                    channel = channel_of(fragment),
                    behind = min_id - chunk_id,
                    "fragment is chunks behind the buffer, it might get lost"
                );
            } else if chunk_id - max_id > 2 {
                info!(skipped = chunk_id - max_id - 1, "skipped chunk(s)");
            }
        }

        if in_overlap {
            self.append(
                ChunkKey {
                    id: chunk_id + 1,
                    part: ChunkPart::Pre,
                },
                fragment,
            );
            self.append(
                ChunkKey {
                    id: chunk_id,
                    part: ChunkPart::Post,
                },
                fragment,
            );
        } else {
            self.append(ChunkKey::full(chunk_id), fragment);
        }
    }

    /// Hand eligible chunks to the sink and drop them.
    ///
    /// A chunk is eligible when it has been idle past the configured
    /// threshold or sits more than `buffer_num_chunks` behind the newest
    /// buffered id. With `all` set everything goes (end of run, force quit).
    pub fn flush(&mut self, sink: &dyn ChunkSink, all: bool) -> Result<usize, SinkError> {
        let max_id = self.id_range().map(|(_, max)| max);
        let now = Instant::now();
        let mut eligible: Vec<ChunkKey> = self
            .chunks
            .iter()
            .filter(|(key, chunk)| {
                if all {
                    return true;
                }
                let idle = now.duration_since(chunk.last_seen) >= self.config.flush_idle;
                let behind = max_id
                    .map(|max| max - key.id > self.config.buffer_num_chunks)
                    .unwrap_or(false);
                idle || behind
            })
            .map(|(key, _)| *key)
            .collect();
        eligible.sort();

        let mut flushed = 0;
        for key in eligible {
            if let Some(chunk) = self.chunks.remove(&key) {
                self.buffered_bytes
                    .fetch_sub(chunk.bytes.len() as u64, Ordering::Relaxed);
                sink.write_chunk(&key.name(self.config.name_length), &chunk.bytes)?;
                flushed += 1;
            }
        }
        Ok(flushed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    /// Sink collecting chunks in memory
    #[derive(Default)]
    struct CollectingSink {
        chunks: Mutex<Vec<(String, Vec<u8>)>>,
    }

    impl ChunkSink for CollectingSink {
        fn write_chunk(&self, name: &str, bytes: &[u8]) -> Result<(), SinkError> {
            self.chunks
                .lock()
                .unwrap()
                .push((name.to_string(), bytes.to_vec()));
            Ok(())
        }
    }

    fn test_config() -> ChunkConfig {
        ChunkConfig {
            chunk_length: 900,
            chunk_overlap: 100,
            name_length: 6,
            buffer_num_chunks: 4,
            warn_if_older_than: 2,
            flush_idle: Duration::from_millis(5),
        }
    }

    fn buffer(config: ChunkConfig) -> ChunkBuffer {
        ChunkBuffer::new(config, Arc::new(AtomicU64::new(0)))
    }

    #[test]
    fn test_key_names() {
        assert_eq!(ChunkKey::full(0).name(6), "000000");
        assert_eq!(ChunkKey::full(42).name(6), "000042");
        assert_eq!(
            ChunkKey {
                id: 1,
                part: ChunkPart::Pre
            }
            .name(6),
            "000001_pre"
        );
        assert_eq!(
            ChunkKey {
                id: 0,
                part: ChunkPart::Post
            }
            .name(6),
            "000000_post"
        );
        assert_eq!(ChunkKey::full(7).name(3), "007");
    }

    #[test]
    fn test_fragment_outside_overlap_single_copy() {
        // full_chunk_length = 1000, overlap = 100, ts = 800:
        // 1*1000 - 800 = 200 > 100 => bare chunk only
        let mut buf = buffer(test_config());
        buf.add_fragment(&[1, 2, 3], 800);

        assert_eq!(buf.pending_chunks(), 1);
        let sink = CollectingSink::default();
        buf.flush(&sink, true).unwrap();
        let chunks = sink.chunks.into_inner().unwrap();
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].0, "000000");
        assert_eq!(chunks[0].1, vec![1, 2, 3]);
    }

    #[test]
    fn test_fragment_in_overlap_replicated() {
        // ts = 950: 1*1000 - 950 = 50 <= 100 => post + next pre
        let mut buf = buffer(test_config());
        buf.add_fragment(&[9, 9], 950);

        assert_eq!(buf.pending_chunks(), 2);
        let sink = CollectingSink::default();
        buf.flush(&sink, true).unwrap();
        let mut names: Vec<String> =
            sink.chunks.into_inner().unwrap().into_iter().map(|(n, _)| n).collect();
        names.sort();
        assert_eq!(names, vec!["000000_post", "000001_pre"]);
    }

    #[test]
    fn test_overlap_copies_identical_bytes() {
        let mut buf = buffer(test_config());
        buf.add_fragment(&[7, 8, 9], 1999); // chunk 1 overlap
        let sink = CollectingSink::default();
        buf.flush(&sink, true).unwrap();
        let chunks = sink.chunks.into_inner().unwrap();
        assert_eq!(chunks.len(), 2);
        assert_eq!(chunks[0].1, chunks[1].1);
    }

    #[test]
    fn test_overlap_boundary_exact() {
        // boundary: (id+1)*full - ts == overlap is still in overlap
        let mut buf = buffer(test_config());
        buf.add_fragment(&[1], 900);
        assert_eq!(buf.pending_chunks(), 2);
    }

    #[test]
    fn test_append_order_preserved_within_chunk() {
        let mut buf = buffer(test_config());
        buf.add_fragment(&[1, 1], 100);
        buf.add_fragment(&[2, 2], 200);
        let sink = CollectingSink::default();
        buf.flush(&sink, true).unwrap();
        let chunks = sink.chunks.into_inner().unwrap();
        assert_eq!(chunks[0].1, vec![1, 1, 2, 2]);
    }

    #[test]
    fn test_flush_behind_max() {
        let mut buf = buffer(test_config());
        buf.add_fragment(&[1], 100); // chunk 0
        buf.add_fragment(&[2], 6_100); // chunk 6, 0 is now > 4 behind

        let sink = CollectingSink::default();
        let flushed = buf.flush(&sink, false).unwrap();
        assert_eq!(flushed, 1);
        let chunks = sink.chunks.into_inner().unwrap();
        assert_eq!(chunks[0].0, "000000");
        assert_eq!(buf.pending_chunks(), 1);
    }

    #[test]
    fn test_flush_idle() {
        let mut buf = buffer(test_config());
        buf.add_fragment(&[1], 100);
        std::thread::sleep(Duration::from_millis(10));

        let sink = CollectingSink::default();
        assert_eq!(buf.flush(&sink, false).unwrap(), 1);
        assert_eq!(buf.pending_chunks(), 0);
    }

    #[test]
    fn test_flush_not_yet_eligible() {
        let mut buf = buffer(ChunkConfig {
            flush_idle: Duration::from_secs(60),
            ..test_config()
        });
        buf.add_fragment(&[1], 100);

        let sink = CollectingSink::default();
        assert_eq!(buf.flush(&sink, false).unwrap(), 0);
        assert_eq!(buf.pending_chunks(), 1);
    }

    #[test]
    fn test_late_fragment_recreates_flushed_chunk() {
        let mut buf = buffer(test_config());
        buf.add_fragment(&[1], 100);
        let sink = CollectingSink::default();
        buf.flush(&sink, true).unwrap();

        // same chunk id again after flush
        buf.add_fragment(&[2], 150);
        buf.flush(&sink, true).unwrap();

        let chunks = sink.chunks.into_inner().unwrap();
        assert_eq!(chunks.len(), 2);
        assert_eq!(chunks[0].0, "000000");
        assert_eq!(chunks[1].0, "000000");
    }

    #[test]
    fn test_buffered_bytes_accounting() {
        let counter = Arc::new(AtomicU64::new(0));
        let mut buf = ChunkBuffer::new(test_config(), counter.clone());
        buf.add_fragment(&[0; 10], 100);
        buf.add_fragment(&[0; 10], 950); // replicated => 20 bytes
        assert_eq!(counter.load(Ordering::Relaxed), 30);

        let sink = CollectingSink::default();
        buf.flush(&sink, true).unwrap();
        assert_eq!(counter.load(Ordering::Relaxed), 0);
    }

    #[test]
    fn test_flush_order_is_sorted_by_id() {
        let mut buf = buffer(test_config());
        buf.add_fragment(&[3], 3_100);
        buf.add_fragment(&[1], 100);
        buf.add_fragment(&[2], 1_100);

        let sink = CollectingSink::default();
        buf.flush(&sink, true).unwrap();
        let names: Vec<String> =
            sink.chunks.into_inner().unwrap().into_iter().map(|(n, _)| n).collect();
        assert_eq!(names, vec!["000000", "000001", "000003"]);
    }
}
