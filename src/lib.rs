//! straxd: readout host for VME waveform digitizers
//!
//! This crate reshapes raw digitizer block transfers into chunked,
//! per-channel strax fragments in real time:
//!
//! - one readout thread per optical link drains its boards into per-board
//!   queues ([`readout`])
//! - formatter workers decode board -> event -> channel bitfields, split
//!   pulses into fixed-size fragments and route them into time chunks
//!   ([`formatter`])
//! - completed chunks go to a [`sink::ChunkSink`]
//! - the [`supervisor`] owns thread lifecycle and teardown accounting

pub mod common;
pub mod config;
pub mod digitizer;
pub mod emulator;
pub mod formatter;
pub mod readout;
pub mod sink;
pub mod supervisor;
