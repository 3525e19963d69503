//! Benchmark accounting for the formatter workers
//!
//! # Design Principles (KISS)
//! - Plain counters owned by the worker thread (zero contention on the hot path)
//! - Merged by the supervisor at teardown, serialized once as JSON
//! - Live monitoring uses the atomics on the board queues, not these

use serde::Serialize;
use std::collections::BTreeMap;
use std::time::Duration;

/// Counters accumulated by one formatter worker over a run.
///
/// Every field is additive, so per-worker instances merge into the run total
/// with [`BenchmarkCounters::merge`].
#[derive(Debug, Default, Clone, Serialize)]
pub struct BenchmarkCounters {
    /// Raw bytes consumed from board queues
    pub bytes_processed: u64,
    /// Fragments emitted (including artificial deadtime)
    pub fragments: u64,
    /// Events decoded
    pub events: u64,
    /// Data packets consumed
    pub data_packets: u64,
    /// Histogram of drained batch sizes (batch length -> occurrences)
    pub batch_histogram: BTreeMap<usize, u64>,
    /// Time spent processing data packets, microseconds
    pub proc_time_packet_us: u64,
    /// Time spent processing events, microseconds
    pub proc_time_event_us: u64,
    /// Time spent processing channels, microseconds
    pub proc_time_channel_us: u64,
    /// Time spent handing chunks to the sink, microseconds
    pub flush_time_us: u64,
}

impl BenchmarkCounters {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record one drained batch of `len` packets
    pub fn record_batch(&mut self, len: usize) {
        *self.batch_histogram.entry(len).or_insert(0) += 1;
        self.data_packets += len as u64;
    }

    #[inline]
    pub fn add_packet_time(&mut self, d: Duration) {
        self.proc_time_packet_us += d.as_micros() as u64;
    }

    #[inline]
    pub fn add_event_time(&mut self, d: Duration) {
        self.proc_time_event_us += d.as_micros() as u64;
    }

    #[inline]
    pub fn add_channel_time(&mut self, d: Duration) {
        self.proc_time_channel_us += d.as_micros() as u64;
    }

    #[inline]
    pub fn add_flush_time(&mut self, d: Duration) {
        self.flush_time_us += d.as_micros() as u64;
    }

    /// Fold another worker's counters into this one
    pub fn merge(&mut self, other: &BenchmarkCounters) {
        self.bytes_processed += other.bytes_processed;
        self.fragments += other.fragments;
        self.events += other.events;
        self.data_packets += other.data_packets;
        for (len, n) in &other.batch_histogram {
            *self.batch_histogram.entry(*len).or_insert(0) += n;
        }
        self.proc_time_packet_us += other.proc_time_packet_us;
        self.proc_time_event_us += other.proc_time_event_us;
        self.proc_time_channel_us += other.proc_time_channel_us;
        self.flush_time_us += other.flush_time_us;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_batch() {
        let mut c = BenchmarkCounters::new();
        c.record_batch(3);
        c.record_batch(3);
        c.record_batch(1);

        assert_eq!(c.data_packets, 7);
        assert_eq!(c.batch_histogram[&3], 2);
        assert_eq!(c.batch_histogram[&1], 1);
    }

    #[test]
    fn test_merge() {
        let mut a = BenchmarkCounters::new();
        a.bytes_processed = 100;
        a.fragments = 10;
        a.record_batch(2);

        let mut b = BenchmarkCounters::new();
        b.bytes_processed = 50;
        b.events = 5;
        b.record_batch(2);
        b.record_batch(4);

        a.merge(&b);
        assert_eq!(a.bytes_processed, 150);
        assert_eq!(a.fragments, 10);
        assert_eq!(a.events, 5);
        assert_eq!(a.data_packets, 5);
        assert_eq!(a.batch_histogram[&2], 2);
        assert_eq!(a.batch_histogram[&4], 1);
    }

    #[test]
    fn test_time_accumulators() {
        let mut c = BenchmarkCounters::new();
        c.add_packet_time(Duration::from_micros(100));
        c.add_packet_time(Duration::from_micros(50));
        c.add_event_time(Duration::from_millis(1));
        assert_eq!(c.proc_time_packet_us, 150);
        assert_eq!(c.proc_time_event_us, 1000);
    }

    #[test]
    fn test_serializes_to_json() {
        let mut c = BenchmarkCounters::new();
        c.record_batch(8);
        let json = serde_json::to_string(&c).unwrap();
        assert!(json.contains("batch_histogram"));
        assert!(json.contains("data_packets"));
    }
}
