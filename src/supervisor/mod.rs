//! Run lifecycle: readout threads, formatter workers, teardown accounting
//!
//! The supervisor owns the shared queue state, spawns one readout thread
//! per optical link and a configurable number of formatter workers, and
//! tears the whole thing down in order: acquisition off, readout joined,
//! workers drained (escalating to force-quit when drain stalls), counters
//! aggregated and saved.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::common::{BenchmarkCounters, DaqError, DaqResult};
use crate::config::Options;
use crate::digitizer::{DataFormat, Digitizer};
use crate::formatter::{
    FormatterError, FormatterReport, FormatterSettings, FormatterWorker, WorkerControl,
};
use crate::readout::{readout_loop, ReadoutShared};
use crate::sink::ChunkSink;

/// Drain-poll cadence during stop
const DRAIN_POLL: Duration = Duration::from_millis(500);
/// Drain-poll attempts before escalation
const DRAIN_ATTEMPTS: u32 = 10;

struct ReadoutThread {
    link: usize,
    running: Arc<AtomicBool>,
    handle: JoinHandle<Vec<Box<dyn Digitizer>>>,
}

struct WorkerThread {
    control: Arc<WorkerControl>,
    handle: JoinHandle<Result<FormatterReport, FormatterError>>,
}

/// Poll-safe snapshot of the running pipeline
#[derive(Debug, Clone)]
pub struct DaqStatus {
    /// Total bytes read off all links
    pub bytes_read: u64,
    /// Queued packets per board
    pub queue_lengths: HashMap<i16, usize>,
    /// Bytes sitting in board queues
    pub queued_bytes: u64,
    /// Fragment bytes buffered in worker chunk buffers
    pub buffered_fragment_bytes: u64,
    /// Workers currently inside their loop
    pub workers_running: usize,
}

/// End-of-run accounting
#[derive(Debug, Default)]
pub struct RunSummary {
    pub counters: BenchmarkCounters,
    /// Board-fail events per board
    pub board_fails: HashMap<i16, u64>,
    /// Packets dropped by force quit or left in queues
    pub lost_packets: u64,
    /// Workers that terminated with an error
    pub worker_errors: usize,
}

/// Owns the running pipeline between [`Supervisor::start`] and
/// [`Supervisor::stop`].
pub struct Supervisor {
    options: Arc<Options>,
    shared: Arc<ReadoutShared>,
    read_active: Arc<AtomicBool>,
    readout_threads: Vec<ReadoutThread>,
    workers: Vec<WorkerThread>,
    data_per_chan: Arc<Mutex<HashMap<i16, u64>>>,
}

impl Supervisor {
    /// Start acquisition on the boards and spawn the pipeline threads.
    ///
    /// Boards move into their link's readout thread and come back at
    /// [`Supervisor::stop`].
    pub fn start(
        options: Arc<Options>,
        mut boards: Vec<Box<dyn Digitizer>>,
        sink: Arc<dyn ChunkSink>,
    ) -> DaqResult<Self> {
        if boards.is_empty() {
            return Err(DaqError::config("no boards to read out"));
        }

        let board_ids: Vec<i16> = boards.iter().map(|b| b.board_id()).collect();
        let formats: HashMap<i16, DataFormat> = boards
            .iter()
            .map(|b| (b.board_id(), b.data_format()))
            .collect();
        let shared = Arc::new(ReadoutShared::for_boards(&board_ids));
        let settings = FormatterSettings::from_options(&options);
        let data_per_chan = Arc::new(Mutex::new(HashMap::new()));

        // start acquisition while we still own the boards
        let sin_start = options.readout.run_start == 1;
        for board in boards.iter_mut() {
            if sin_start {
                board.sin_start()?;
            } else {
                if !board.ensure_ready(100, 1) {
                    return Err(DaqError::timeout(format!(
                        "board {} not ready to start",
                        board.board_id()
                    )));
                }
                board.software_start()?;
                if !board.ensure_started(100, 1) {
                    return Err(DaqError::timeout(format!(
                        "board {} did not start acquisition",
                        board.board_id()
                    )));
                }
            }
        }
        info!(
            boards = board_ids.len(),
            sin_start, "acquisition started"
        );

        // one readout thread per optical link
        let mut per_link: HashMap<usize, Vec<Box<dyn Digitizer>>> = HashMap::new();
        for board in boards {
            per_link.entry(board.link()).or_default().push(board);
        }

        let read_active = Arc::new(AtomicBool::new(true));
        let mut readout_threads = Vec::new();
        for (link, link_boards) in per_link {
            let running = Arc::new(AtomicBool::new(false));
            let shared2 = shared.clone();
            let active2 = read_active.clone();
            let running2 = running.clone();
            let handle = std::thread::Builder::new()
                .name(format!("readout-link{link}"))
                .spawn(move || readout_loop(link, link_boards, shared2, active2, running2))
                .map_err(DaqError::Io)?;
            readout_threads.push(ReadoutThread {
                link,
                running,
                handle,
            });
        }

        // formatter workers, boards distributed round-robin
        let hostname = options.hostname();
        let n_workers = options.processing_threads(&hostname, board_ids.len());
        let mut assignments: Vec<Vec<i16>> = vec![Vec::new(); n_workers];
        for (i, bid) in board_ids.iter().enumerate() {
            assignments[i % n_workers].push(*bid);
        }

        let mut workers = Vec::new();
        for (id, assigned) in assignments.into_iter().enumerate() {
            if assigned.is_empty() {
                continue;
            }
            let control = Arc::new(WorkerControl::new());
            let worker = FormatterWorker::new(
                id,
                assigned,
                shared.clone(),
                formats.clone(),
                options.clone(),
                settings.clone(),
                sink.clone(),
                control.clone(),
                data_per_chan.clone(),
            );
            let handle = std::thread::Builder::new()
                .name(format!("formatter-{id}"))
                .spawn(move || worker.run())
                .map_err(DaqError::Io)?;
            workers.push(WorkerThread { control, handle });
        }
        info!(
            links = readout_threads.len(),
            workers = workers.len(),
            "pipeline threads started"
        );

        Ok(Self {
            options,
            shared,
            read_active,
            readout_threads,
            workers,
            data_per_chan,
        })
    }

    /// Snapshot of queue depths and buffered bytes
    pub fn status(&self) -> DaqStatus {
        let queue_lengths: HashMap<i16, usize> = self
            .shared
            .queues
            .iter()
            .map(|(bid, q)| (*bid, q.len()))
            .collect();
        DaqStatus {
            bytes_read: self.shared.bytes_read.load(Ordering::Relaxed),
            queued_bytes: self.shared.queues.values().map(|q| q.buffered_bytes()).sum(),
            buffered_fragment_bytes: self
                .workers
                .iter()
                .map(|w| w.control.buffered_bytes.load(Ordering::Relaxed))
                .sum(),
            workers_running: self
                .workers
                .iter()
                .filter(|w| w.control.running.load(Ordering::SeqCst))
                .count(),
            queue_lengths,
        }
    }

    /// Sample volume per channel since the last call; resets the counters.
    pub fn data_per_channel(&self) -> HashMap<i16, u64> {
        let mut map = self.data_per_chan.lock().unwrap();
        let out = map.clone();
        for v in map.values_mut() {
            *v = 0;
        }
        out
    }

    /// True if any worker has terminated with an error
    pub fn check_errors(&self) -> bool {
        self.workers
            .iter()
            .any(|w| w.control.error_bit.load(Ordering::SeqCst))
    }

    fn packets_in_flight(&self) -> usize {
        let queued: usize = self.shared.queues.values().map(|q| q.len()).sum();
        let batched: usize = self
            .workers
            .iter()
            .map(|w| w.control.buffer_length.load(Ordering::Relaxed))
            .sum();
        queued + batched
    }

    /// Stop acquisition, drain and join everything, aggregate counters.
    pub fn stop(mut self) -> DaqResult<RunSummary> {
        // 1. stop reading
        self.read_active.store(false, Ordering::SeqCst);
        let mut counter = 0;
        while self
            .readout_threads
            .iter()
            .any(|t| t.running.load(Ordering::SeqCst))
            && counter < 10
        {
            std::thread::sleep(Duration::from_millis(100));
            counter += 1;
        }
        if counter >= 10 {
            debug!("readout threads taking a while to clear");
        }

        // 2. stop the boards
        for t in self.readout_threads.drain(..) {
            let link = t.link;
            let mut boards = t
                .handle
                .join()
                .map_err(|_| DaqError::other(format!("readout thread {link} panicked")))?;
            for board in boards.iter_mut() {
                board.acquisition_stop()?;
                if !board.ensure_stopped(100, 1) {
                    warn!(board = board.board_id(), "timed out waiting for acquisition stop");
                }
            }
            debug!(link, "boards stopped");
        }

        // 3. let the workers drain; escalate when no progress is made
        let mut prev = usize::MAX;
        let mut stalled = false;
        for _ in 0..DRAIN_ATTEMPTS {
            let in_flight = self.packets_in_flight();
            if in_flight == 0 {
                break;
            }
            if in_flight == prev {
                stalled = true;
                break;
            }
            prev = in_flight;
            std::thread::sleep(DRAIN_POLL);
        }
        let leftover = self.packets_in_flight();
        if stalled || leftover > 0 {
            warn!(leftover, "drain stalled, force-quitting workers");
            for w in &self.workers {
                w.control.force_quit.store(true, Ordering::SeqCst);
            }
        }
        for w in &self.workers {
            w.control.active.store(false, Ordering::SeqCst);
        }

        // 4. join workers and aggregate
        let mut summary = RunSummary::default();
        for w in self.workers.drain(..) {
            match w.handle.join() {
                Ok(Ok(report)) => {
                    summary.counters.merge(&report.counters);
                    for (bid, n) in report.fail_counter {
                        *summary.board_fails.entry(bid).or_insert(0) += n;
                    }
                    summary.lost_packets += report.lost_packets;
                }
                Ok(Err(e)) => {
                    warn!(error = %e, "formatter worker failed");
                    summary.worker_errors += 1;
                }
                Err(_) => {
                    warn!("formatter worker panicked");
                    summary.worker_errors += 1;
                }
            }
        }

        // 5. anything still queued is lost
        let mut dropped = 0u64;
        for queue in self.shared.queues.values() {
            dropped += queue.drain(None).len() as u64;
        }
        if dropped > 0 {
            warn!(lost = dropped, "deleting uncleared board queues");
            summary.lost_packets += dropped;
        }

        if !summary.board_fails.is_empty() {
            let mut msg = String::from("Found board failures: ");
            for (bid, n) in &summary.board_fails {
                msg.push_str(&format!("{bid}:{n} | "));
            }
            warn!("{}", msg);
        }

        self.options
            .save_benchmarks(&summary.counters, &summary.board_fails)
            .map_err(|e| DaqError::other(e.to_string()))?;

        info!(
            bytes = summary.counters.bytes_processed,
            events = summary.counters.events,
            fragments = summary.counters.fragments,
            data_packets = summary.counters.data_packets,
            lost = summary.lost_packets,
            "run stopped"
        );
        Ok(summary)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::emulator::{EmulatedBoardConfig, EmulatedDigitizer};
    use crate::sink::SinkError;

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

    fn options_with_map() -> Arc<Options> {
        Arc::new(
            Options::from_toml(
                r#"
                [readout]
                strax_fragment_payload_bytes = 40
                flush_idle_ms = 5

                [channel_map]
                150 = [0, 1, 2, 3, 4, 5, 6, 7, 8, 9, 10, 11, 12, 13, 14, 15]
                151 = [16, 17, 18, 19, 20, 21, 22, 23, 24, 25, 26, 27, 28, 29, 30, 31]
            "#,
            )
            .unwrap(),
        )
    }

    fn emulated(board: i16, link: usize) -> Box<dyn Digitizer> {
        Box::new(EmulatedDigitizer::new(EmulatedBoardConfig {
            board,
            link,
            samples_per_pulse: 20,
            events_per_block: 2,
            min_block_interval: Duration::from_micros(100),
            ..Default::default()
        }))
    }

    #[test]
    fn test_start_requires_boards() {
        let result = Supervisor::start(
            options_with_map(),
            Vec::new(),
            Arc::new(CollectingSink::default()),
        );
        assert!(result.is_err());
    }

    #[test]
    fn test_full_pipeline_run_and_stop() {
        let sink = Arc::new(CollectingSink::default());
        let supervisor = Supervisor::start(
            options_with_map(),
            vec![emulated(150, 0), emulated(151, 1)],
            sink.clone(),
        )
        .unwrap();

        std::thread::sleep(Duration::from_millis(50));
        let status = supervisor.status();
        assert_eq!(status.workers_running, 2);
        assert!(status.bytes_read > 0);

        let per_chan = supervisor.data_per_channel();
        assert!(!per_chan.is_empty());

        assert!(!supervisor.check_errors());
        let summary = supervisor.stop().unwrap();
        assert!(summary.counters.events > 0);
        assert!(summary.counters.fragments > 0);
        assert!(summary.counters.data_packets > 0);
        assert_eq!(summary.worker_errors, 0);
        assert!(!sink.chunks.lock().unwrap().is_empty());
    }

    #[test]
    fn test_unmapped_board_kills_worker() {
        // board 152 has no channel map entries
        let sink = Arc::new(CollectingSink::default());
        let supervisor =
            Supervisor::start(options_with_map(), vec![emulated(152, 0)], sink).unwrap();

        std::thread::sleep(Duration::from_millis(50));
        assert!(supervisor.check_errors());
        let summary = supervisor.stop().unwrap();
        assert_eq!(summary.worker_errors, 1);
    }

    #[test]
    fn test_worker_count_from_options() {
        let options = Arc::new(
            Options::from_toml(
                r#"
                hostname = "testhost"

                [processing_threads]
                testhost = 1

                [channel_map]
                150 = [0, 1, 2, 3, 4, 5, 6, 7, 8, 9, 10, 11, 12, 13, 14, 15]
                151 = [16, 17, 18, 19, 20, 21, 22, 23, 24, 25, 26, 27, 28, 29, 30, 31]
            "#,
            )
            .unwrap(),
        );
        let sink = Arc::new(CollectingSink::default());
        let supervisor =
            Supervisor::start(options, vec![emulated(150, 0), emulated(151, 0)], sink).unwrap();

        // both boards share the single worker
        std::thread::sleep(Duration::from_millis(30));
        assert_eq!(supervisor.status().workers_running, 1);
        let summary = supervisor.stop().unwrap();
        assert_eq!(summary.worker_errors, 0);
        assert!(summary.counters.events > 0);
    }
}
