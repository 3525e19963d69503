//! Run options for the readout host
//!
//! Options are loaded from a TOML file and expose typed accessors for the
//! pieces the data path needs: per-board wiring, the channel map, worker
//! counts, chunking parameters. Register lists, thresholds and the DAC cache
//! are carried for the board-initialization collaborator.
//!
//! # Example
//! ```ignore
//! let options = Options::load("readout.toml")?;
//! let boards = options.get_boards("V17XX", &options.hostname());
//! ```

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use thiserror::Error;

use crate::common::BenchmarkCounters;

/// Configuration errors
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to parse TOML: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Bad hex value '{0}'")]
    BadHex(String),

    #[error("Missing required field: {0}")]
    MissingField(String),
}

/// Top-level run options
#[derive(Debug, Clone, Deserialize)]
pub struct Options {
    /// Hostname used to select boards and worker counts.
    /// Falls back to $HOSTNAME, then "localhost".
    #[serde(default)]
    hostname: Option<String>,

    /// Directory the file chunk sink writes into
    #[serde(default = "default_output_dir")]
    pub output_dir: String,

    /// Data-path tuning knobs
    #[serde(default)]
    pub readout: ReadoutOptions,

    /// Formatter worker count per hostname (default: one per board)
    #[serde(default)]
    pub processing_threads: HashMap<String, usize>,

    /// Digitizer inventory
    #[serde(default)]
    pub boards: Vec<BoardEntry>,

    /// Board id (as string key) -> per-channel global labels, -1 = unmapped
    #[serde(default)]
    pub channel_map: HashMap<String, Vec<i16>>,

    /// Register writes applied during board init (external collaborator)
    #[serde(default)]
    pub registers: Vec<RegisterEntry>,

    /// Board id (as string key) -> per-channel trigger thresholds
    #[serde(default)]
    pub thresholds: HashMap<String, Vec<u16>>,

    /// JSON file caching fitted DAC baselines between runs
    #[serde(default)]
    pub dac_cache_file: Option<String>,

    /// JSON file the end-of-run benchmark summary is written to
    #[serde(default)]
    pub benchmark_file: Option<String>,
}

fn default_output_dir() -> String {
    "./strax_output".to_string()
}

/// Data-path tuning knobs, all with working defaults
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ReadoutOptions {
    /// Fragment payload size in bytes
    pub strax_fragment_payload_bytes: usize,
    /// "dual" drains the whole queue per pass, "single" one packet at a time
    pub buffer_type: String,
    /// Chunk length in ns
    pub chunk_length: i64,
    /// Chunk overlap in ns
    pub chunk_overlap: i64,
    /// Zero-pad width of chunk names
    pub chunk_name_length: usize,
    /// Flush chunks this many ids behind the newest buffered one
    pub buffer_num_chunks: i64,
    /// Warn when a fragment lands this many chunks behind the buffer
    pub warn_if_chunk_older_than: i64,
    /// Flush chunks untouched for this long, milliseconds
    pub flush_idle_ms: u64,
    /// 0 = software start, 1 = SIN (sync) start
    pub run_start: i32,
    /// "fixed" | "cached" | "fit", consumed by the baseline collaborator
    pub baseline_dac_mode: String,
}

impl Default for ReadoutOptions {
    fn default() -> Self {
        Self {
            strax_fragment_payload_bytes: 220,
            buffer_type: "dual".to_string(),
            chunk_length: 0x7fff_ffff,
            chunk_overlap: 50_000_000,
            chunk_name_length: 6,
            buffer_num_chunks: 4,
            warn_if_chunk_older_than: 2,
            flush_idle_ms: 1000,
            run_start: 0,
            baseline_dac_mode: "fixed".to_string(),
        }
    }
}

/// One digitizer in the inventory
#[derive(Debug, Clone, Deserialize)]
pub struct BoardEntry {
    /// Board id, unique across the experiment
    pub board: i16,
    /// Optical link index on this host
    pub link: usize,
    /// Crate index on the link
    #[serde(rename = "crate")]
    pub crate_num: u8,
    /// VME base address, hex string (e.g. "0x80000000")
    #[serde(default)]
    pub vme_address: String,
    /// Board type, e.g. "V1724", "V1730", "V1724_MV"
    #[serde(rename = "type")]
    pub board_type: String,
    /// Host this board is cabled to; empty = any host
    #[serde(default)]
    pub host: String,
}

/// One register write for board initialization
#[derive(Debug, Clone, Deserialize)]
pub struct RegisterEntry {
    pub board: i16,
    /// Register address, hex string
    pub reg: String,
    /// Value, hex string
    pub val: String,
}

impl RegisterEntry {
    pub fn reg_value(&self) -> Result<(u32, u32), ConfigError> {
        Ok((parse_hex(&self.reg)?, parse_hex(&self.val)?))
    }
}

/// Parse a hex string with or without "0x" prefix
pub fn parse_hex(s: &str) -> Result<u32, ConfigError> {
    let trimmed = s.trim_start_matches("0x").trim_start_matches("0X");
    u32::from_str_radix(trimmed, 16).map_err(|_| ConfigError::BadHex(s.to_string()))
}

/// Match a board type against a family pattern where 'X' is a wildcard,
/// e.g. "V17XX" matches "V1724", "V1730" and "V1724_MV".
fn family_matches(family: &str, board_type: &str) -> bool {
    let prefix: String = family.chars().take_while(|c| *c != 'X').collect();
    board_type.starts_with(&prefix)
}

impl Options {
    /// Load options from a TOML file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml(&content)
    }

    /// Load options from a TOML string (useful for testing)
    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        let options: Options = toml::from_str(content)?;
        Ok(options)
    }

    /// Resolve the hostname: config override, then $HOSTNAME, then "localhost"
    pub fn hostname(&self) -> String {
        if let Some(h) = &self.hostname {
            return h.clone();
        }
        std::env::var("HOSTNAME").unwrap_or_else(|_| "localhost".to_string())
    }

    /// Formatter worker count for a host; `default` is usually the board count
    pub fn processing_threads(&self, hostname: &str, default: usize) -> usize {
        self.processing_threads
            .get(hostname)
            .copied()
            .unwrap_or(default)
            .max(1)
    }

    /// Global channel label for (board, channel), None if unmapped.
    /// A -1 in the map means the channel is explicitly unmapped.
    pub fn channel_label(&self, board: i16, channel: u8) -> Option<i16> {
        let labels = self.channel_map.get(&board.to_string())?;
        match labels.get(channel as usize) {
            Some(l) if *l >= 0 => Some(*l),
            _ => None,
        }
    }

    /// Boards of a family (e.g. "V17XX") cabled to `hostname`
    pub fn get_boards(&self, family: &str, hostname: &str) -> Vec<&BoardEntry> {
        self.boards
            .iter()
            .filter(|b| family_matches(family, &b.board_type))
            .filter(|b| b.host.is_empty() || b.host == hostname)
            .collect()
    }

    /// Register writes for one board
    pub fn get_registers(&self, board: i16) -> Vec<&RegisterEntry> {
        self.registers.iter().filter(|r| r.board == board).collect()
    }

    /// Trigger thresholds for one board
    pub fn get_thresholds(&self, board: i16) -> Option<&Vec<u16>> {
        self.thresholds.get(&board.to_string())
    }

    /// Load cached DAC baselines for the given boards.
    /// Missing cache file yields an empty map (first run).
    pub fn get_dac(&self, boards: &[i16]) -> Result<HashMap<i16, Vec<u16>>, ConfigError> {
        let Some(path) = &self.dac_cache_file else {
            return Ok(HashMap::new());
        };
        if !Path::new(path).exists() {
            return Ok(HashMap::new());
        }
        let content = std::fs::read_to_string(path)?;
        let all: HashMap<String, Vec<u16>> = serde_json::from_str(&content)?;
        let mut out = HashMap::new();
        for bid in boards {
            if let Some(v) = all.get(&bid.to_string()) {
                out.insert(*bid, v.clone());
            }
        }
        Ok(out)
    }

    /// Persist fitted DAC baselines, merging over any existing cache
    pub fn update_dac(&self, values: &HashMap<i16, Vec<u16>>) -> Result<(), ConfigError> {
        let Some(path) = &self.dac_cache_file else {
            return Ok(());
        };
        let mut all: HashMap<String, Vec<u16>> = if Path::new(path).exists() {
            serde_json::from_str(&std::fs::read_to_string(path)?)?
        } else {
            HashMap::new()
        };
        for (bid, v) in values {
            all.insert(bid.to_string(), v.clone());
        }
        std::fs::write(path, serde_json::to_string_pretty(&all)?)?;
        Ok(())
    }

    /// Write the end-of-run benchmark summary as one JSON document
    pub fn save_benchmarks(
        &self,
        counters: &BenchmarkCounters,
        fail_counts: &HashMap<i16, u64>,
    ) -> Result<(), ConfigError> {
        let Some(path) = &self.benchmark_file else {
            return Ok(());
        };
        #[derive(Serialize)]
        struct Summary<'a> {
            hostname: String,
            counters: &'a BenchmarkCounters,
            board_fails: HashMap<String, u64>,
        }
        let summary = Summary {
            hostname: self.hostname(),
            counters,
            board_fails: fail_counts
                .iter()
                .map(|(k, v)| (k.to_string(), *v))
                .collect(),
        };
        std::fs::write(path, serde_json::to_string_pretty(&summary)?)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
        hostname = "reader0"
        output_dir = "/data/strax"

        [readout]
        strax_fragment_payload_bytes = 220
        buffer_type = "dual"
        chunk_length = 2147483647
        chunk_overlap = 50000000

        [processing_threads]
        reader0 = 4

        [[boards]]
        board = 150
        link = 0
        crate = 0
        vme_address = "0x80000000"
        type = "V1724"
        host = "reader0"

        [[boards]]
        board = 151
        link = 1
        crate = 0
        vme_address = "0x90000000"
        type = "V1730"
        host = "other_host"

        [channel_map]
        150 = [0, 1, 2, 3, 4, 5, 6, 7, -1, 9, 10, 11, 12, 13, 14, 15]

        [[registers]]
        board = 150
        reg = "0x8000"
        val = "0x310"

        [thresholds]
        150 = [60, 60, 60, 60]
    "#;

    #[test]
    fn test_load_sample() {
        let opts = Options::from_toml(SAMPLE).unwrap();
        assert_eq!(opts.hostname(), "reader0");
        assert_eq!(opts.output_dir, "/data/strax");
        assert_eq!(opts.readout.strax_fragment_payload_bytes, 220);
        assert_eq!(opts.boards.len(), 2);
    }

    #[test]
    fn test_defaults() {
        let opts = Options::from_toml("").unwrap();
        assert_eq!(opts.readout.chunk_length, 0x7fff_ffff);
        assert_eq!(opts.readout.chunk_overlap, 50_000_000);
        assert_eq!(opts.readout.chunk_name_length, 6);
        assert_eq!(opts.readout.buffer_type, "dual");
        assert_eq!(opts.readout.run_start, 0);
        assert_eq!(opts.output_dir, "./strax_output");
    }

    #[test]
    fn test_processing_threads() {
        let opts = Options::from_toml(SAMPLE).unwrap();
        assert_eq!(opts.processing_threads("reader0", 8), 4);
        assert_eq!(opts.processing_threads("unknown", 8), 8);
    }

    #[test]
    fn test_channel_label() {
        let opts = Options::from_toml(SAMPLE).unwrap();
        assert_eq!(opts.channel_label(150, 0), Some(0));
        assert_eq!(opts.channel_label(150, 7), Some(7));
        // explicit -1 means unmapped
        assert_eq!(opts.channel_label(150, 8), None);
        // unknown board
        assert_eq!(opts.channel_label(999, 0), None);
    }

    #[test]
    fn test_get_boards_family_and_host() {
        let opts = Options::from_toml(SAMPLE).unwrap();
        let boards = opts.get_boards("V17XX", "reader0");
        assert_eq!(boards.len(), 1);
        assert_eq!(boards[0].board, 150);
        assert_eq!(boards[0].link, 0);

        // other host sees the V1730
        let boards = opts.get_boards("V17XX", "other_host");
        assert_eq!(boards.len(), 1);
        assert_eq!(boards[0].board_type, "V1730");

        // narrower family
        let boards = opts.get_boards("V1730", "other_host");
        assert_eq!(boards.len(), 1);
        assert!(opts.get_boards("V1730", "reader0").is_empty());
    }

    #[test]
    fn test_registers_and_hex() {
        let opts = Options::from_toml(SAMPLE).unwrap();
        let regs = opts.get_registers(150);
        assert_eq!(regs.len(), 1);
        let (reg, val) = regs[0].reg_value().unwrap();
        assert_eq!(reg, 0x8000);
        assert_eq!(val, 0x310);
        assert!(opts.get_registers(151).is_empty());
    }

    #[test]
    fn test_parse_hex_errors() {
        assert!(parse_hex("0x80000000").is_ok());
        assert!(parse_hex("80000000").is_ok());
        assert!(parse_hex("not hex").is_err());
    }

    #[test]
    fn test_thresholds() {
        let opts = Options::from_toml(SAMPLE).unwrap();
        assert_eq!(opts.get_thresholds(150).unwrap().len(), 4);
        assert!(opts.get_thresholds(151).is_none());
    }

    #[test]
    fn test_dac_cache_roundtrip() {
        let dir = std::env::temp_dir().join("straxd_dac_test");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("dac.json");
        let _ = std::fs::remove_file(&path);

        let mut opts = Options::from_toml("").unwrap();
        opts.dac_cache_file = Some(path.to_str().unwrap().to_string());

        // empty before first write
        assert!(opts.get_dac(&[150]).unwrap().is_empty());

        let mut values = HashMap::new();
        values.insert(150i16, vec![4000u16; 8]);
        opts.update_dac(&values).unwrap();

        let loaded = opts.get_dac(&[150, 151]).unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[&150], vec![4000u16; 8]);

        let _ = std::fs::remove_file(&path);
    }
}
