//! Per-link readout: board queues and the acquisition loop
//!
//! One OS thread per optical link cycles over the boards on that link,
//! wraps every successful block read in a [`DataPacket`] and pushes it into
//! that board's [`BoardQueue`]. Formatter workers drain the queues; the two
//! sides never share a mutex across boards.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tracing::{debug, trace, warn};

use crate::digitizer::{board_errors, BlockRead, Digitizer, RawBlock};

/// Read the acquisition status register every this many passes (diagnostic)
const STATUS_CHECK_INTERVAL: u64 = 10_000;

/// Sleep between board passes
const PASS_SLEEP: Duration = Duration::from_micros(1);

// ---------------------------------------------------------------------------
// Data packet
// ---------------------------------------------------------------------------

/// One block-transfer read, immutable after enqueue.
///
/// Owns its word buffer; ownership transfers through the queue to exactly
/// one formatter worker.
#[derive(Debug)]
pub struct DataPacket {
    /// 32-bit little-endian words as read from the board
    pub words: Vec<u32>,
    /// Bytes transferred
    pub byte_size: usize,
    /// Rollover count observed by the producing board up to this packet
    pub clock_counter: u32,
    /// Low 31 bits of the board clock at the start of the block
    pub header_time: u32,
    /// Originating board
    pub board: i16,
}

impl DataPacket {
    pub fn from_block(block: RawBlock, board: i16) -> Self {
        Self {
            words: block.words,
            byte_size: block.byte_size,
            clock_counter: block.clock_counter,
            header_time: block.header_time,
            board,
        }
    }
}

// ---------------------------------------------------------------------------
// Board queue
// ---------------------------------------------------------------------------

/// Bounded-by-backpressure FIFO of packets for one board.
///
/// The length and byte counters are atomics so monitoring never takes the
/// queue mutex.
#[derive(Debug)]
pub struct BoardQueue {
    board: i16,
    inner: Mutex<VecDeque<DataPacket>>,
    length: AtomicUsize,
    buffered_bytes: AtomicU64,
}

impl BoardQueue {
    pub fn new(board: i16) -> Self {
        Self {
            board,
            inner: Mutex::new(VecDeque::new()),
            length: AtomicUsize::new(0),
            buffered_bytes: AtomicU64::new(0),
        }
    }

    pub fn board(&self) -> i16 {
        self.board
    }

    pub fn push(&self, packet: DataPacket) {
        let bytes = packet.byte_size as u64;
        let mut q = self.inner.lock().unwrap();
        q.push_back(packet);
        self.length.fetch_add(1, Ordering::Relaxed);
        self.buffered_bytes.fetch_add(bytes, Ordering::Relaxed);
    }

    /// Drain queued packets in arrival order.
    ///
    /// `limit = None` swaps out everything currently queued in one locked
    /// operation; `Some(n)` pops at most `n` packets.
    pub fn drain(&self, limit: Option<usize>) -> Vec<DataPacket> {
        if self.length.load(Ordering::Relaxed) == 0 {
            return Vec::new();
        }
        let mut q = self.inner.lock().unwrap();
        let out: Vec<DataPacket> = match limit {
            None => std::mem::take(&mut *q).into(),
            Some(n) => {
                let take = n.min(q.len());
                q.drain(..take).collect()
            }
        };
        let bytes: u64 = out.iter().map(|p| p.byte_size as u64).sum();
        self.length.fetch_sub(out.len(), Ordering::Relaxed);
        self.buffered_bytes.fetch_sub(bytes, Ordering::Relaxed);
        out
    }

    pub fn len(&self) -> usize {
        self.length.load(Ordering::Relaxed)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn buffered_bytes(&self) -> u64 {
        self.buffered_bytes.load(Ordering::Relaxed)
    }
}

// ---------------------------------------------------------------------------
// Error-inspection flags
// ---------------------------------------------------------------------------

/// Per-board "please read the error register" flags.
///
/// This is the narrow callback capability handed to formatter workers: a
/// worker that sees a board-fail event marks the board here, and the readout
/// thread owning that board performs the register read on its next pass.
#[derive(Debug)]
pub struct ErrorFlags {
    flags: HashMap<i16, AtomicBool>,
}

impl ErrorFlags {
    pub fn for_boards(boards: &[i16]) -> Self {
        Self {
            flags: boards
                .iter()
                .map(|b| (*b, AtomicBool::new(false)))
                .collect(),
        }
    }

    /// Flag a board for error inspection
    pub fn mark(&self, board: i16) {
        if let Some(f) = self.flags.get(&board) {
            f.store(true, Ordering::Relaxed);
        }
    }

    /// Clear and return the flag for a board
    pub fn take(&self, board: i16) -> bool {
        self.flags
            .get(&board)
            .map(|f| f.swap(false, Ordering::Relaxed))
            .unwrap_or(false)
    }
}

// ---------------------------------------------------------------------------
// Readout loop
// ---------------------------------------------------------------------------

/// State shared between readout threads, workers and the supervisor
#[derive(Debug)]
pub struct ReadoutShared {
    /// One queue per board
    pub queues: HashMap<i16, Arc<BoardQueue>>,
    /// Boards flagged for error-register inspection
    pub error_flags: ErrorFlags,
    /// Total bytes read off all links
    pub bytes_read: AtomicU64,
}

impl ReadoutShared {
    pub fn for_boards(boards: &[i16]) -> Self {
        Self {
            queues: boards
                .iter()
                .map(|b| (*b, Arc::new(BoardQueue::new(*b))))
                .collect(),
            error_flags: ErrorFlags::for_boards(boards),
            bytes_read: AtomicU64::new(0),
        }
    }

    pub fn queue(&self, board: i16) -> Option<Arc<BoardQueue>> {
        self.queues.get(&board).cloned()
    }
}

/// Acquisition loop for one optical link.
///
/// Cycles over the link's boards until `read_active` drops. A failed block
/// read breaks the current board pass only; the board is retried on the
/// next cycle. Sets `running` false and returns the boards for teardown.
pub fn readout_loop(
    link: usize,
    mut boards: Vec<Box<dyn Digitizer>>,
    shared: Arc<ReadoutShared>,
    read_active: Arc<AtomicBool>,
    running: Arc<AtomicBool>,
) -> Vec<Box<dyn Digitizer>> {
    running.store(true, Ordering::SeqCst);
    debug!(link, boards = boards.len(), "readout loop starting");

    let mut cycle: u64 = 0;
    while read_active.load(Ordering::Relaxed) {
        for board in boards.iter_mut() {
            let bid = board.board_id();

            if cycle % STATUS_CHECK_INTERVAL == 0 {
                let status = board.acquisition_status();
                trace!(board = bid, status = %format_args!("0x{:04x}", status), "board status");
            }

            if shared.error_flags.take(bid) {
                let err = board.check_errors();
                trace!(board = bid, err, "error register read");
                if err != -1 {
                    if err & board_errors::PLL_UNLOCK != 0 {
                        trace!(board = bid, "board has PLL unlock");
                    }
                    if err & board_errors::BUS_ERROR != 0 {
                        trace!(board = bid, "board has VME bus error");
                    }
                }
            }

            match board.read_block() {
                BlockRead::Failed => {
                    warn!(link, board = bid, "block read failed, breaking board pass");
                    break;
                }
                BlockRead::Empty => continue,
                BlockRead::Data(block) => {
                    shared
                        .bytes_read
                        .fetch_add(block.byte_size as u64, Ordering::Relaxed);
                    if let Some(queue) = shared.queues.get(&bid) {
                        queue.push(DataPacket::from_block(block, bid));
                    }
                }
            }
        }
        cycle = cycle.wrapping_add(1);
        std::thread::sleep(PASS_SLEEP);
    }

    running.store(false, Ordering::SeqCst);
    debug!(link, "readout loop returning");
    boards
}
