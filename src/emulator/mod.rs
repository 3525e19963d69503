//! Emulated digitizer - generates wire-format blocks for testing
//!
//! Implements [`Digitizer`] without hardware: blocks are synthesized in the
//! board event format (both firmware layouts), the 31-bit clock advances and
//! wraps like the real one, and board-fail / payload-corruption events can
//! be injected at configurable probabilities.
//!
//! The word-level [`EventBuilder`] is public so tests can assemble exact
//! event images.

use std::time::{Duration, Instant};

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rand_distr::{Distribution, Normal};

use crate::common::DaqResult;
use crate::digitizer::{
    header_time_of, wire, BlockRead, ClockCounter, DataFormat, Digitizer, RawBlock,
};

// ---------------------------------------------------------------------------
// Event image builder
// ---------------------------------------------------------------------------

/// Per-channel data for one synthesized event
#[derive(Debug, Clone)]
pub struct ChannelImage {
    pub channel: u8,
    pub samples: Vec<u16>,
    /// Low 31 bits of the channel trigger time (DPP-DAW only)
    pub channel_time: u32,
    /// High 16 timestamp bits for formats carrying them in channel word 2
    pub time_msb: u16,
    /// 14-bit baseline for formats carrying it in channel word 2
    pub baseline: u16,
}

impl ChannelImage {
    pub fn new(channel: u8, samples: Vec<u16>) -> Self {
        Self {
            channel,
            samples,
            channel_time: 0,
            time_msb: 0,
            baseline: 0,
        }
    }

    pub fn with_time(mut self, channel_time: u32) -> Self {
        self.channel_time = channel_time;
        self
    }

    pub fn with_msb(mut self, time_msb: u16, baseline: u16) -> Self {
        self.time_msb = time_msb;
        self.baseline = baseline;
        self
    }
}

/// Builds one event in the board wire format
#[derive(Debug, Clone)]
pub struct EventBuilder {
    fmt: DataFormat,
    event_time: u32,
    board_fail: bool,
    channels: Vec<ChannelImage>,
}

impl EventBuilder {
    pub fn new(fmt: DataFormat, event_time: u32) -> Self {
        Self {
            fmt,
            event_time: event_time & wire::EVENT_TIME_MASK,
            board_fail: false,
            channels: Vec::new(),
        }
    }

    pub fn board_fail(mut self) -> Self {
        self.board_fail = true;
        self
    }

    pub fn channel(mut self, image: ChannelImage) -> Self {
        self.channels.push(image);
        self
    }

    /// Assemble the event words
    pub fn build(&self) -> Vec<u32> {
        let mut mask: u16 = 0;
        for ch in &self.channels {
            mask |= 1 << ch.channel;
        }

        let mut body: Vec<u32> = Vec::new();
        if !self.board_fail {
            for ch in &self.channels {
                if self.fmt.channel_header_words > 0 {
                    let sample_words = ch.samples.len().div_ceil(2);
                    let channel_words =
                        (self.fmt.channel_header_words + sample_words) as u32;
                    body.push(channel_words & wire::CHANNEL_SIZE_MASK);
                    body.push(ch.channel_time & wire::CHANNEL_TIME_MASK);
                    if self.fmt.channel_header_words >= 3 {
                        body.push(
                            ((ch.baseline as u32 & wire::BASELINE_MASK) << 16)
                                | ch.time_msb as u32,
                        );
                    }
                }
                body.extend(pack_samples(&ch.samples));
            }
        }

        let words_in_event = (wire::EVENT_HEADER_WORDS + body.len()) as u32;
        let mut words = Vec::with_capacity(words_in_event as usize);
        words.push(
            (wire::HEADER_TYPE_TAG << wire::HEADER_TYPE_SHIFT)
                | (words_in_event & wire::EVENT_SIZE_MASK),
        );
        let mut w1 = (mask as u32) & wire::CHANNEL_MASK_LSB;
        if self.board_fail {
            w1 |= wire::BOARD_FAIL_BIT;
        }
        words.push(w1);
        let mut w2 = 0u32;
        if self.fmt.channel_mask_msb_idx == Some(2) {
            w2 |= (((mask >> 8) & 0xFF) as u32) << 24;
        }
        words.push(w2);
        words.push(self.event_time);
        words.extend(body);
        words
    }
}

/// Pack 16-bit samples two per word, first sample in the low half
pub fn pack_samples(samples: &[u16]) -> Vec<u32> {
    samples
        .chunks(2)
        .map(|pair| {
            let lo = pair[0] as u32;
            let hi = pair.get(1).copied().unwrap_or(0) as u32;
            lo | (hi << 16)
        })
        .collect()
}

// ---------------------------------------------------------------------------
// Emulated board
// ---------------------------------------------------------------------------

/// Emulator configuration
#[derive(Debug, Clone)]
pub struct EmulatedBoardConfig {
    pub board: i16,
    pub link: usize,
    pub format: DataFormat,
    /// Enabled-channel bitmask
    pub channel_mask: u16,
    /// Samples per pulse (even, two per word)
    pub samples_per_pulse: usize,
    /// Events per generated block
    pub events_per_block: usize,
    /// Board clock ticks between consecutive events
    pub ticks_per_event: u64,
    /// Probability of a board-fail event
    pub fail_probability: f64,
    /// Probability of a payload word carrying the header sentinel
    pub corrupt_probability: f64,
    /// Minimum wall-clock spacing between blocks; zero = as fast as polled
    pub min_block_interval: Duration,
    /// RNG seed, fixed for reproducible tests
    pub seed: u64,
}

impl Default for EmulatedBoardConfig {
    fn default() -> Self {
        Self {
            board: 0,
            link: 0,
            format: DataFormat::default_firmware(10, 10),
            channel_mask: 0x0003,
            samples_per_pulse: 40,
            events_per_block: 4,
            ticks_per_event: 25_000,
            fail_probability: 0.0,
            corrupt_probability: 0.0,
            min_block_interval: Duration::ZERO,
            seed: 0x5eed,
        }
    }
}

/// An in-process digitizer producing synthetic blocks
pub struct EmulatedDigitizer {
    config: EmulatedBoardConfig,
    clock: ClockCounter,
    /// Free-running tick counter; its low 31 bits are the board clock
    ticks: u64,
    running: bool,
    last_block: Option<Instant>,
    registers: std::collections::HashMap<u32, u32>,
    rng: StdRng,
    amplitude: Normal<f64>,
}

impl EmulatedDigitizer {
    pub fn new(config: EmulatedBoardConfig) -> Self {
        let rng = StdRng::seed_from_u64(config.seed);
        Self {
            config,
            clock: ClockCounter::new(),
            ticks: 0,
            running: false,
            last_block: None,
            registers: std::collections::HashMap::new(),
            rng,
            amplitude: Normal::new(6000.0, 600.0).unwrap(),
        }
    }

    fn pulse(&mut self) -> Vec<u16> {
        let n = self.config.samples_per_pulse;
        let peak = self.amplitude.sample(&mut self.rng).clamp(0.0, 10000.0);
        let rise = (n / 4).max(1);
        (0..n)
            .map(|i| {
                // triangular pulse on a flat pedestal
                let pedestal = 3800.0;
                let value = if i < rise {
                    pedestal + peak * i as f64 / rise as f64
                } else {
                    pedestal + peak * (n - i) as f64 / (n - rise) as f64
                };
                (value as u16) & 0x3FFF
            })
            .collect()
    }

    fn synthesize_event(&mut self) -> Vec<u32> {
        self.ticks = self.ticks.wrapping_add(self.config.ticks_per_event);
        let event_time = (self.ticks & 0x7FFF_FFFF) as u32;
        let time_msb = ((self.ticks >> 31) & 0xFFFF) as u16;

        if self.rng.gen_bool(self.config.fail_probability) {
            return EventBuilder::new(self.config.format, event_time)
                .board_fail()
                .build();
        }

        let mut builder = EventBuilder::new(self.config.format, event_time);
        for ch in 0..wire::MAX_CHANNELS as u8 {
            if self.config.channel_mask & (1 << ch) == 0 {
                continue;
            }
            let mut samples = self.pulse();
            if self.rng.gen_bool(self.config.corrupt_probability) {
                // make one packed word look like an event header
                if samples.len() >= 2 {
                    samples[0] = 0x0000;
                    samples[1] = 0xA000;
                }
            }
            builder = builder.channel(
                ChannelImage::new(ch, samples)
                    .with_time(event_time)
                    .with_msb(time_msb, 3800),
            );
        }
        builder.build()
    }
}

impl Digitizer for EmulatedDigitizer {
    fn board_id(&self) -> i16 {
        self.config.board
    }

    fn link(&self) -> usize {
        self.config.link
    }

    fn data_format(&self) -> DataFormat {
        self.config.format
    }

    fn read_block(&mut self) -> BlockRead {
        if !self.running {
            return BlockRead::Empty;
        }
        if let Some(last) = self.last_block {
            if last.elapsed() < self.config.min_block_interval {
                return BlockRead::Empty;
            }
        }
        self.last_block = Some(Instant::now());
        let mut words = Vec::new();
        for _ in 0..self.config.events_per_block {
            words.extend(self.synthesize_event());
        }
        if words.is_empty() {
            return BlockRead::Empty;
        }
        let header_time = header_time_of(&words);
        let clock_counter = self.clock.update(header_time);
        let byte_size = words.len() * wire::WORD_SIZE;
        BlockRead::Data(RawBlock {
            words,
            byte_size,
            header_time,
            clock_counter,
        })
    }

    fn write_register(&mut self, reg: u32, value: u32) -> DaqResult<()> {
        self.registers.insert(reg, value);
        Ok(())
    }

    fn read_register(&mut self, reg: u32) -> DaqResult<u32> {
        Ok(self.registers.get(&reg).copied().unwrap_or(0))
    }

    fn acquisition_status(&mut self) -> u32 {
        if self.running {
            0x4
        } else {
            0x0
        }
    }

    fn check_errors(&mut self) -> i32 {
        0
    }

    fn software_start(&mut self) -> DaqResult<()> {
        self.running = true;
        Ok(())
    }

    fn sin_start(&mut self) -> DaqResult<()> {
        self.running = true;
        Ok(())
    }

    fn acquisition_stop(&mut self) -> DaqResult<()> {
        self.running = false;
        Ok(())
    }

    fn sw_trigger(&mut self) -> DaqResult<()> {
        Ok(())
    }

    fn ensure_ready(&mut self, _ntries: u32, _sleep_ms: u64) -> bool {
        true
    }

    fn ensure_started(&mut self, _ntries: u32, _sleep_ms: u64) -> bool {
        self.running
    }

    fn ensure_stopped(&mut self, _ntries: u32, _sleep_ms: u64) -> bool {
        !self.running
    }
}
