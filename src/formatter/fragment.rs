//! Fragment wire format
//!
//! A fragment is a fixed-size record: a packed little-endian 24-byte header
//! followed by `payload_bytes` of raw 16-bit samples, zero-padded when the
//! fragment is the tail of a pulse.
//!
//! Header layout (offsets in bytes):
//!
//! | 0..8 | 8..12 | 12..14 | 14..16 | 16..20 | 20..22 | 22..24 |
//! |------|-------|--------|--------|--------|--------|--------|
//! | time | length | sample width | channel | pulse length | fragment index | baseline |

/// Fragment header size in bytes
pub const STRAX_HEADER_SIZE: usize = 24;

/// Channel label of artificial deadtime fragments
pub const DEADTIME_CHANNEL: i16 = 790;

/// Sample width stamped on artificial deadtime fragments
pub const DEADTIME_SAMPLE_WIDTH: u16 = 10;

/// Parsed fragment header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FragmentHeader {
    /// Global time of the first sample, ns
    pub time: i64,
    /// Samples in this fragment
    pub length: u32,
    /// ns per sample
    pub sample_width: u16,
    /// Global channel label
    pub channel: i16,
    /// Samples in the whole pulse
    pub pulse_length: u32,
    /// Fragment index within the pulse
    pub fragment_index: u16,
    /// 14-bit baseline (DPP-DAW), else 0. Deadtime fragments carry the
    /// board id here instead.
    pub baseline: u16,
}

impl FragmentHeader {
    /// Serialize packed little-endian
    pub fn to_bytes(&self) -> [u8; STRAX_HEADER_SIZE] {
        let mut out = [0u8; STRAX_HEADER_SIZE];
        out[0..8].copy_from_slice(&self.time.to_le_bytes());
        out[8..12].copy_from_slice(&self.length.to_le_bytes());
        out[12..14].copy_from_slice(&self.sample_width.to_le_bytes());
        out[14..16].copy_from_slice(&self.channel.to_le_bytes());
        out[16..20].copy_from_slice(&self.pulse_length.to_le_bytes());
        out[20..22].copy_from_slice(&self.fragment_index.to_le_bytes());
        out[22..24].copy_from_slice(&self.baseline.to_le_bytes());
        out
    }

    /// Parse the first 24 bytes of a fragment
    pub fn parse(bytes: &[u8]) -> Option<Self> {
        if bytes.len() < STRAX_HEADER_SIZE {
            return None;
        }
        Some(Self {
            time: i64::from_le_bytes(bytes[0..8].try_into().ok()?),
            length: u32::from_le_bytes(bytes[8..12].try_into().ok()?),
            sample_width: u16::from_le_bytes(bytes[12..14].try_into().ok()?),
            channel: i16::from_le_bytes(bytes[14..16].try_into().ok()?),
            pulse_length: u32::from_le_bytes(bytes[16..20].try_into().ok()?),
            fragment_index: u16::from_le_bytes(bytes[20..22].try_into().ok()?),
            baseline: u16::from_le_bytes(bytes[22..24].try_into().ok()?),
        })
    }
}

/// Channel label straight from raw fragment bytes, for diagnostics
pub fn channel_of(fragment: &[u8]) -> i16 {
    fragment
        .get(14..16)
        .and_then(|b| b.try_into().ok())
        .map(i16::from_le_bytes)
        .unwrap_or(-1)
}

/// Assemble one fragment: header, raw samples, zero padding up to
/// `payload_bytes`. `samples` must not exceed the payload capacity.
pub fn encode_fragment(header: &FragmentHeader, samples: &[u16], payload_bytes: usize) -> Vec<u8> {
    debug_assert!(samples.len() * 2 <= payload_bytes);
    let mut out = Vec::with_capacity(STRAX_HEADER_SIZE + payload_bytes);
    out.extend_from_slice(&header.to_bytes());
    for s in samples {
        out.extend_from_slice(&s.to_le_bytes());
    }
    out.resize(STRAX_HEADER_SIZE + payload_bytes, 0);
    out
}

/// Artificial deadtime fragment: channel label 790, one full-payload
/// "pulse" of zeros, the originating board id in the final header bytes.
pub fn deadtime_fragment(timestamp: i64, board: i16, payload_bytes: usize) -> Vec<u8> {
    let payload_samples = (payload_bytes >> 1) as u32;
    let header = FragmentHeader {
        time: timestamp,
        length: payload_samples,
        sample_width: DEADTIME_SAMPLE_WIDTH,
        channel: DEADTIME_CHANNEL,
        pulse_length: payload_samples,
        fragment_index: 0,
        baseline: board as u16,
    };
    encode_fragment(&header, &[], payload_bytes)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn header() -> FragmentHeader {
        FragmentHeader {
            time: 40960,
            length: 8,
            sample_width: 10,
            channel: 3,
            pulse_length: 8,
            fragment_index: 0,
            baseline: 0x0200,
        }
    }

    #[test]
    fn test_header_layout() {
        let bytes = header().to_bytes();
        assert_eq!(bytes.len(), STRAX_HEADER_SIZE);
        assert_eq!(i64::from_le_bytes(bytes[0..8].try_into().unwrap()), 40960);
        assert_eq!(u32::from_le_bytes(bytes[8..12].try_into().unwrap()), 8);
        assert_eq!(u16::from_le_bytes(bytes[12..14].try_into().unwrap()), 10);
        assert_eq!(i16::from_le_bytes(bytes[14..16].try_into().unwrap()), 3);
        assert_eq!(u32::from_le_bytes(bytes[16..20].try_into().unwrap()), 8);
        assert_eq!(u16::from_le_bytes(bytes[20..22].try_into().unwrap()), 0);
        assert_eq!(u16::from_le_bytes(bytes[22..24].try_into().unwrap()), 0x0200);
    }

    #[test]
    fn test_header_roundtrip() {
        let h = header();
        let parsed = FragmentHeader::parse(&h.to_bytes()).unwrap();
        assert_eq!(parsed, h);
    }

    #[test]
    fn test_parse_too_short() {
        assert!(FragmentHeader::parse(&[0u8; 23]).is_none());
    }

    #[test]
    fn test_encode_fragment_exact_size() {
        let samples = vec![0x1111u16; 8];
        let frag = encode_fragment(&header(), &samples, 16);
        assert_eq!(frag.len(), STRAX_HEADER_SIZE + 16);
        // fully occupied payload, no padding
        assert_eq!(&frag[24..26], &0x1111u16.to_le_bytes());
        assert_eq!(&frag[38..40], &0x1111u16.to_le_bytes());
    }

    #[test]
    fn test_encode_fragment_zero_pads_tail() {
        let samples = vec![0xABCDu16; 3];
        let frag = encode_fragment(&header(), &samples, 16);
        assert_eq!(frag.len(), STRAX_HEADER_SIZE + 16);
        assert_eq!(&frag[24..26], &0xABCDu16.to_le_bytes());
        assert_eq!(&frag[28..30], &0xABCDu16.to_le_bytes());
        // remaining 10 payload bytes are zero
        assert!(frag[30..].iter().all(|b| *b == 0));
    }

    #[test]
    fn test_channel_of() {
        let frag = encode_fragment(&header(), &[], 16);
        assert_eq!(channel_of(&frag), 3);
        assert_eq!(channel_of(&[0u8; 4]), -1);
    }

    #[test]
    fn test_deadtime_fragment() {
        let frag = deadtime_fragment(150_000_000_000, 172, 220);
        assert_eq!(frag.len(), STRAX_HEADER_SIZE + 220);

        let h = FragmentHeader::parse(&frag).unwrap();
        assert_eq!(h.time, 150_000_000_000);
        assert_eq!(h.channel, DEADTIME_CHANNEL);
        assert_eq!(h.sample_width, DEADTIME_SAMPLE_WIDTH);
        assert_eq!(h.length, 110);
        assert_eq!(h.pulse_length, 110);
        assert_eq!(h.fragment_index, 0);
        // board id rides in the trailing header bytes
        assert_eq!(h.baseline, 172);
        // payload all zero
        assert!(frag[STRAX_HEADER_SIZE..].iter().all(|b| *b == 0));
    }

    #[test]
    fn test_deadtime_negative_board_id_roundtrip() {
        let frag = deadtime_fragment(0, -1, 16);
        let h = FragmentHeader::parse(&frag).unwrap();
        assert_eq!(h.baseline as i16, -1);
    }
}
