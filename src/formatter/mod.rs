//! Formatter workers: board blocks in, strax fragments out
//!
//! A worker drains data packets from its assigned board queues, walks the
//! 32-bit word stream (events start at a `0xA`-tagged header word), decodes
//! each enabled channel, splits pulses into fixed-size fragments and routes
//! them into time chunks. Partial failures (board-fail flag, garbled
//! headers, payload self-framing) become artificial deadtime fragments; the
//! only fatal condition is an unmapped channel.

pub mod chunk;
pub mod fragment;

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use thiserror::Error;
use tracing::{debug, trace, warn};

use crate::config::Options;
use crate::digitizer::{wire, DataFormat};
use crate::readout::{BoardQueue, DataPacket, ReadoutShared};
use crate::sink::{ChunkSink, SinkError};
use chunk::{ChunkBuffer, ChunkConfig};
use fragment::{deadtime_fragment, encode_fragment, FragmentHeader};

/// Channel-level rollover reconciliation thresholds, in clock ticks.
/// Readout polls far faster than the ~21 s wrap period, so timestamps
/// within one packet can only straddle a wrap by sitting at opposite ends
/// of the clock range.
const ROLLOVER_LOW: i64 = 500_000_000;
const ROLLOVER_HIGH: i64 = 1_500_000_000;

/// Worker idle sleep between empty drain passes
const DRAIN_SLEEP: Duration = Duration::from_micros(10);

/// Formatter errors
#[derive(Error, Debug)]
pub enum FormatterError {
    #[error(transparent)]
    Sink(#[from] SinkError),

    /// The channel map has no label for this channel. Fatal: the data
    /// plane cannot silently mislabel.
    #[error("no channel map entry for board {board} channel {channel}")]
    UnmappedChannel { board: i16, channel: u8 },
}

/// Data-path settings derived from [`Options`]
#[derive(Debug, Clone)]
pub struct FormatterSettings {
    /// Fragment payload size in bytes
    pub fragment_bytes: usize,
    /// Packets per drain pass; `None` takes the whole queue
    pub drain_limit: Option<usize>,
    /// Chunk routing parameters
    pub chunk: ChunkConfig,
}

impl FormatterSettings {
    pub fn from_options(options: &Options) -> Self {
        let r = &options.readout;
        Self {
            fragment_bytes: r.strax_fragment_payload_bytes,
            drain_limit: match r.buffer_type.as_str() {
                "single" => Some(1),
                _ => None,
            },
            chunk: ChunkConfig {
                chunk_length: r.chunk_length,
                chunk_overlap: r.chunk_overlap,
                name_length: r.chunk_name_length,
                buffer_num_chunks: r.buffer_num_chunks,
                warn_if_older_than: r.warn_if_chunk_older_than,
                flush_idle: Duration::from_millis(r.flush_idle_ms),
            },
        }
    }
}

/// Control and monitoring surface shared between a worker and the supervisor
#[derive(Debug)]
pub struct WorkerControl {
    /// Graceful stop: finish the in-flight batch, flush, exit
    pub active: AtomicBool,
    /// Fast stop: abandon remaining events, drop queued packets
    pub force_quit: AtomicBool,
    /// True while the worker thread is inside its loop
    pub running: AtomicBool,
    /// Packets remaining in the in-flight batch
    pub buffer_length: AtomicUsize,
    /// Fragment bytes currently buffered in chunks
    pub buffered_bytes: Arc<AtomicU64>,
    /// Set when the worker terminated with an error
    pub error_bit: AtomicBool,
}

impl WorkerControl {
    pub fn new() -> Self {
        Self {
            active: AtomicBool::new(true),
            force_quit: AtomicBool::new(false),
            running: AtomicBool::new(false),
            buffer_length: AtomicUsize::new(0),
            buffered_bytes: Arc::new(AtomicU64::new(0)),
            error_bit: AtomicBool::new(false),
        }
    }
}

impl Default for WorkerControl {
    fn default() -> Self {
        Self::new()
    }
}

/// What a worker hands back at the end of a run
#[derive(Debug, Default)]
pub struct FormatterReport {
    pub counters: crate::common::BenchmarkCounters,
    /// Board-fail events seen per board
    pub fail_counter: HashMap<i16, u64>,
    /// Packets dropped on force quit
    pub lost_packets: u64,
}

/// Outcome of decoding one channel within an event
enum ChannelOutcome {
    /// Words consumed; the event cursor advances by this much
    Consumed(usize),
    /// The rest of the event is unusable; skip the remaining channels
    Abandon,
}

/// One formatter worker. Owns its chunk buffer; shares only atomics,
/// the sink and the per-channel sample-volume map.
pub struct FormatterWorker {
    id: usize,
    boards: Vec<i16>,
    shared: Arc<ReadoutShared>,
    formats: HashMap<i16, DataFormat>,
    options: Arc<Options>,
    settings: FormatterSettings,
    sink: Arc<dyn ChunkSink>,
    control: Arc<WorkerControl>,
    chunks: ChunkBuffer,
    counters: crate::common::BenchmarkCounters,
    fail_counter: HashMap<i16, u64>,
    data_per_chan: Arc<Mutex<HashMap<i16, u64>>>,
}

impl FormatterWorker {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        id: usize,
        boards: Vec<i16>,
        shared: Arc<ReadoutShared>,
        formats: HashMap<i16, DataFormat>,
        options: Arc<Options>,
        settings: FormatterSettings,
        sink: Arc<dyn ChunkSink>,
        control: Arc<WorkerControl>,
        data_per_chan: Arc<Mutex<HashMap<i16, u64>>>,
    ) -> Self {
        let chunks = ChunkBuffer::new(settings.chunk.clone(), control.buffered_bytes.clone());
        Self {
            id,
            boards,
            shared,
            formats,
            options,
            settings,
            sink,
            control,
            chunks,
            counters: crate::common::BenchmarkCounters::new(),
            fail_counter: HashMap::new(),
            data_per_chan,
        }
    }

    fn queues(&self) -> Vec<Arc<BoardQueue>> {
        self.boards
            .iter()
            .filter_map(|b| self.shared.queue(*b))
            .collect()
    }

    /// Worker loop: drain, decode, flush, until stopped.
    pub fn run(mut self) -> Result<FormatterReport, FormatterError> {
        self.control.running.store(true, Ordering::SeqCst);
        debug!(worker = self.id, boards = ?self.boards, "formatter worker starting");

        let queues = self.queues();
        let mut lost_packets: u64 = 0;

        let result = (|| -> Result<(), FormatterError> {
            while self.control.active.load(Ordering::Relaxed) {
                let mut drained_any = false;
                for queue in &queues {
                    let batch = queue.drain(self.settings.drain_limit);
                    if batch.is_empty() {
                        continue;
                    }
                    drained_any = true;
                    self.control
                        .buffer_length
                        .store(batch.len(), Ordering::Relaxed);
                    self.counters.record_batch(batch.len());

                    let mut packets = batch.into_iter();
                    for packet in packets.by_ref() {
                        self.process_packet(packet)?;
                        self.control.buffer_length.fetch_sub(1, Ordering::Relaxed);
                        if self.control.force_quit.load(Ordering::Relaxed) {
                            break;
                        }
                    }
                    let dropped = packets.count();
                    if dropped > 0 {
                        lost_packets += dropped as u64;
                        self.control.buffer_length.store(0, Ordering::Relaxed);
                    }

                    let flush_start = Instant::now();
                    self.chunks.flush(self.sink.as_ref(), false)?;
                    self.counters.add_flush_time(flush_start.elapsed());

                    if self.control.force_quit.load(Ordering::Relaxed) {
                        return Ok(());
                    }
                }
                if !drained_any {
                    std::thread::sleep(DRAIN_SLEEP);
                }
            }
            Ok(())
        })();

        // force quit drains queued packets without decoding them
        if self.control.force_quit.load(Ordering::Relaxed) {
            for queue in &queues {
                lost_packets += queue.drain(None).len() as u64;
            }
            if lost_packets > 0 {
                warn!(
                    worker = self.id,
                    lost = lost_packets,
                    "force quit dropped undecoded packets"
                );
            }
        }

        // whatever happened, hand remaining chunks to the sink
        let flush_start = Instant::now();
        let flush_result = self.chunks.flush(self.sink.as_ref(), true);
        self.counters.add_flush_time(flush_start.elapsed());

        self.control.running.store(false, Ordering::SeqCst);

        let flush_result = flush_result.map(|_| ()).map_err(FormatterError::from);
        if let Err(e) = result.and(flush_result) {
            self.control.error_bit.store(true, Ordering::SeqCst);
            warn!(worker = self.id, error = %e, "formatter worker terminating on error");
            return Err(e);
        }

        debug!(worker = self.id, "formatter worker stopped");
        Ok(FormatterReport {
            counters: self.counters,
            fail_counter: self.fail_counter,
            lost_packets,
        })
    }

    /// Walk one packet's word stream and decode every event in it.
    /// Words not carrying the header sentinel are skipped one at a time.
    fn process_packet(&mut self, packet: DataPacket) -> Result<(), FormatterError> {
        let packet_start = Instant::now();
        let words = &packet.words;
        let mut idx = 0;
        while idx < words.len() {
            if wire::is_header_word(words[idx]) {
                let event_start = Instant::now();
                let consumed = self.process_event(
                    &words[idx..],
                    packet.board,
                    packet.clock_counter,
                    packet.header_time,
                )?;
                self.counters.add_event_time(event_start.elapsed());
                idx += consumed;
            } else {
                idx += 1;
            }
            if self.control.force_quit.load(Ordering::Relaxed) {
                break;
            }
        }
        self.counters.bytes_processed += packet.byte_size as u64;
        self.counters.add_packet_time(packet_start.elapsed());
        Ok(())
    }

    /// Decode one event starting at `words[0]`. Returns words consumed.
    fn process_event(
        &mut self,
        words: &[u32],
        board: i16,
        clock_counter: u32,
        header_time: u32,
    ) -> Result<usize, FormatterError> {
        if words.len() < wire::EVENT_HEADER_WORDS {
            trace!(board, remaining = words.len(), "truncated event header at buffer end");
            return Ok(words.len());
        }
        let fmt = match self.formats.get(&board) {
            Some(f) => *f,
            None => {
                warn!(board, "packet from board with no data format, skipping event");
                return Ok(wire::EVENT_HEADER_WORDS);
            }
        };

        let declared = (words[0] & wire::EVENT_SIZE_MASK) as usize;
        let words_in_event = declared.min(words.len());
        if words_in_event < declared {
            trace!(board, declared, available = words.len(), "garbled event header");
        }

        let mut channel_mask = (words[1] & wire::CHANNEL_MASK_LSB) as u16;
        if let Some(msb_idx) = fmt.channel_mask_msb_idx {
            if let Some(w) = words.get(msb_idx) {
                channel_mask |= (((w >> 24) & 0xFF) as u16) << 8;
            }
        }
        let event_time = words[3] & wire::EVENT_TIME_MASK;
        self.counters.events += 1;

        if words[1] & wire::BOARD_FAIL_BIT != 0 {
            let timestamp =
                (((clock_counter as i64) << 31) | event_time as i64) * fmt.ns_per_clock;
            self.generate_deadtime(timestamp, board);
            self.shared.error_flags.mark(board);
            *self.fail_counter.entry(board).or_insert(0) += 1;
            return Ok(wire::EVENT_HEADER_WORDS);
        }

        let event = &words[..words_in_event];
        let mut idx = wire::EVENT_HEADER_WORDS;
        for ch in 0..wire::MAX_CHANNELS as u8 {
            if channel_mask & (1 << ch) == 0 {
                continue;
            }
            let channel_start = Instant::now();
            let outcome = self.process_channel(
                event,
                idx,
                board,
                ch,
                header_time,
                event_time,
                clock_counter,
                channel_mask,
                &fmt,
            )?;
            self.counters.add_channel_time(channel_start.elapsed());
            match outcome {
                ChannelOutcome::Consumed(n) => idx += n,
                ChannelOutcome::Abandon => break,
            }
        }
        Ok(idx)
    }

    /// Decode one channel's pulse and emit its fragments.
    #[allow(clippy::too_many_arguments)]
    fn process_channel(
        &mut self,
        event: &[u32],
        offset: usize,
        board: i16,
        channel: u8,
        header_time: u32,
        event_time: u32,
        clock_counter: u32,
        channel_mask: u16,
        fmt: &DataFormat,
    ) -> Result<ChannelOutcome, FormatterError> {
        let chan = &event[offset.min(event.len())..];
        let words_in_event = event.len();

        // defaults for firmware where every channel in the event is the
        // same length and shares the event timestamp
        let mut channel_words =
            words_in_event.saturating_sub(wire::EVENT_HEADER_WORDS) / channel_mask.count_ones() as usize;
        let mut channel_time: i64 = ((clock_counter as i64) << 31) | event_time as i64;
        let mut time_msb: i64 = 0;
        let mut baseline: u16 = 0;

        // a channel sub-header overrides all of that
        if fmt.channel_header_words > 0 {
            let Some(&size_word) = chan.first() else {
                trace!(board, channel, "channel header past event end");
                return Ok(ChannelOutcome::Abandon);
            };
            let declared = (size_word & wire::CHANNEL_SIZE_MASK) as usize;
            channel_words = declared.min(words_in_event);
            if channel_words < declared {
                trace!(board, channel, declared, words_in_event, "garbled channel header");
                return Ok(ChannelOutcome::Abandon);
            }
            if channel_words <= fmt.channel_header_words {
                trace!(board, channel, channel_words, "empty channel");
                return Ok(ChannelOutcome::Abandon);
            }
            channel_time = (chan.get(1).copied().unwrap_or(0) & wire::CHANNEL_TIME_MASK) as i64;

            if fmt.channel_time_msb_idx == Some(2) {
                let w2 = chan.get(2).copied().unwrap_or(0);
                time_msb = ((w2 & 0xFFFF) as i64) << 32;
                baseline = ((w2 >> 16) & wire::BASELINE_MASK) as u16;
            } else if fmt.channel_header_words <= 2 {
                // No explicit high timestamp word: reconcile the rollover
                // locally. Channels are decoded independently, so only a
                // copy of the packet's counter is adjusted.
                let mut local_clock = clock_counter;
                if channel_time > ROLLOVER_HIGH && (header_time as i64) < ROLLOVER_LOW && local_clock != 0 {
                    local_clock -= 1;
                } else if channel_time < ROLLOVER_LOW && (header_time as i64) > ROLLOVER_HIGH {
                    local_clock += 1;
                }
                time_msb = (local_clock as i64) << 31;
            }
        }
        channel_words = channel_words.min(chan.len());

        let global_time = fmt.ns_per_clock * (time_msb + channel_time);

        // sanity-check the payload for self-framing before splitting
        for w in &chan[fmt.channel_header_words.min(channel_words)..channel_words] {
            if wire::is_header_word(*w) {
                trace!(board, channel, "header sentinel inside payload, emitting deadtime");
                self.generate_deadtime(global_time, board);
                return Ok(ChannelOutcome::Abandon);
            }
        }

        let payload = &chan[fmt.channel_header_words.min(channel_words)..channel_words];
        let mut samples: Vec<u16> = Vec::with_capacity(payload.len() * 2);
        for w in payload {
            samples.push((w & 0xFFFF) as u16);
            samples.push((w >> 16) as u16);
        }
        let samples_in_pulse = samples.len() as u32;

        let label = self
            .options
            .channel_label(board, channel)
            .ok_or(FormatterError::UnmappedChannel { board, channel })?;

        let fragment_samples = self.settings.fragment_bytes >> 1;
        let num_frags = (samples_in_pulse as usize).div_ceil(fragment_samples);
        for frag_i in 0..num_frags {
            let start = frag_i * fragment_samples;
            let end = (start + fragment_samples).min(samples.len());
            let header = FragmentHeader {
                time: global_time
                    + (frag_i * fragment_samples) as i64 * fmt.ns_per_sample as i64,
                length: (end - start) as u32,
                sample_width: fmt.ns_per_sample,
                channel: label,
                pulse_length: samples_in_pulse,
                fragment_index: frag_i as u16,
                baseline,
            };
            let frag = encode_fragment(&header, &samples[start..end], self.settings.fragment_bytes);
            self.counters.fragments += 1;
            self.chunks.add_fragment(&frag, header.time);
        }

        {
            let mut dpc = self.data_per_chan.lock().unwrap();
            *dpc.entry(label).or_insert(0) += (samples_in_pulse as u64) << 1;
        }
        Ok(ChannelOutcome::Consumed(channel_words))
    }

    fn generate_deadtime(&mut self, timestamp: i64, board: i16) {
        let frag = deadtime_fragment(timestamp, board, self.settings.fragment_bytes);
        self.counters.fragments += 1;
        self.chunks.add_fragment(&frag, timestamp);
    }
}
