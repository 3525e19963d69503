//! Fragment dump tool
//!
//! Reads one chunk file and prints every fragment header. The payload size
//! must match the producing run's `strax_fragment_payload_bytes`.
//!
//! Usage:
//!   fragment_dump ./strax_output/000000 --payload-bytes 220 -n 20

use clap::Parser;

use straxd::common::DumpArgs;
use straxd::formatter::fragment::{FragmentHeader, DEADTIME_CHANNEL, STRAX_HEADER_SIZE};

fn main() -> anyhow::Result<()> {
    let args = DumpArgs::parse();
    let bytes = std::fs::read(&args.file)?;

    let record = STRAX_HEADER_SIZE + args.payload_bytes;
    if bytes.len() % record != 0 {
        anyhow::bail!(
            "{} is {} bytes, not a multiple of the {}-byte fragment record \
             (wrong --payload-bytes?)",
            args.file,
            bytes.len(),
            record
        );
    }

    let total = bytes.len() / record;
    println!("{}: {} fragments", args.file, total);
    println!(
        "{:>20} {:>8} {:>6} {:>8} {:>10} {:>6} {:>9}",
        "time_ns", "length", "sw_ns", "channel", "pulse_len", "frag_i", "baseline"
    );

    let limit = if args.limit == 0 { total } else { args.limit };
    for (i, off) in (0..bytes.len()).step_by(record).enumerate() {
        if i >= limit {
            println!("... {} more", total - limit);
            break;
        }
        let h = FragmentHeader::parse(&bytes[off..]).expect("record boundary checked above");
        let tag = if h.channel == DEADTIME_CHANNEL {
            format!("  [deadtime, board {}]", h.baseline as i16)
        } else {
            String::new()
        };
        println!(
            "{:>20} {:>8} {:>6} {:>8} {:>10} {:>6} {:>9}{}",
            h.time, h.length, h.sample_width, h.channel, h.pulse_length, h.fragment_index,
            h.baseline, tag
        );
    }
    Ok(())
}
