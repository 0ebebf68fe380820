//! The fixed-size fragment record.
//!
//! Every fragment is `FRAGMENT_HEADER_BYTES` of little-endian header followed
//! by the waveform samples, zero-padded to the configured payload size so all
//! fragments in a run have identical length.

use crate::constants::FRAGMENT_HEADER_BYTES;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FragmentHeader {
    /// ns since run start
    pub timestamp: i64,
    /// samples actually carried by this fragment
    pub samples: i32,
    pub sample_width_ns: u16,
    pub channel: i16,
    /// samples in the whole pulse this fragment was cut from
    pub pulse_samples: u32,
    pub index: u16,
    pub baseline: u16,
}

impl FragmentHeader {
    pub fn encode_into(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.timestamp.to_le_bytes());
        out.extend_from_slice(&self.samples.to_le_bytes());
        out.extend_from_slice(&self.sample_width_ns.to_le_bytes());
        out.extend_from_slice(&self.channel.to_le_bytes());
        out.extend_from_slice(&self.pulse_samples.to_le_bytes());
        out.extend_from_slice(&self.index.to_le_bytes());
        out.extend_from_slice(&self.baseline.to_le_bytes());
    }

    pub fn decode(bytes: &[u8]) -> Self {
        let field = |lo: usize, hi: usize| &bytes[lo..hi];
        FragmentHeader {
            timestamp: i64::from_le_bytes(field(0, 8).try_into().unwrap()),
            samples: i32::from_le_bytes(field(8, 12).try_into().unwrap()),
            sample_width_ns: u16::from_le_bytes(field(12, 14).try_into().unwrap()),
            channel: i16::from_le_bytes(field(14, 16).try_into().unwrap()),
            pulse_samples: u32::from_le_bytes(field(16, 20).try_into().unwrap()),
            index: u16::from_le_bytes(field(20, 22).try_into().unwrap()),
            baseline: u16::from_le_bytes(field(22, 24).try_into().unwrap()),
        }
    }
}

/// Timestamp of an already-encoded fragment.
pub fn fragment_timestamp(fragment: &[u8]) -> i64 {
    i64::from_le_bytes(fragment[0..8].try_into().unwrap())
}

/// Channel of an already-encoded fragment.
pub fn fragment_channel(fragment: &[u8]) -> i16 {
    i16::from_le_bytes(fragment[14..16].try_into().unwrap())
}

/// Split one decoded pulse into encoded fragments of `payload_bytes` each,
/// the last one zero-padded.
pub fn fragment_pulse(
    header: FragmentHeader,
    waveform: &[u32],
    payload_bytes: usize,
    mut emit: impl FnMut(Vec<u8>),
) -> usize {
    let samples_per_frag = payload_bytes / 2;
    let pulse_samples = waveform.len() * 2;
    let num_frags = pulse_samples.div_ceil(samples_per_frag);
    let full_size = FRAGMENT_HEADER_BYTES + payload_bytes;

    // reinterpret the waveform words as u16 samples, little-endian
    let mut samples = Vec::with_capacity(pulse_samples);
    for w in waveform {
        samples.push((w & 0xFFFF) as u16);
        samples.push((w >> 16) as u16);
    }

    for frag_i in 0..num_frags {
        let start = frag_i * samples_per_frag;
        let end = (start + samples_per_frag).min(pulse_samples);
        let mut fragment = Vec::with_capacity(full_size);
        FragmentHeader {
            timestamp: header.timestamp
                + (samples_per_frag as i64) * (header.sample_width_ns as i64) * frag_i as i64,
            samples: (end - start) as i32,
            sample_width_ns: header.sample_width_ns,
            channel: header.channel,
            pulse_samples: pulse_samples as u32,
            index: frag_i as u16,
            baseline: header.baseline,
        }
        .encode_into(&mut fragment);
        for s in &samples[start..end] {
            fragment.extend_from_slice(&s.to_le_bytes());
        }
        fragment.resize(full_size, 0);
        emit(fragment);
    }
    num_frags
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_round_trip() {
        let header = FragmentHeader {
            timestamp: 123_456_789_000,
            samples: 110,
            sample_width_ns: 10,
            channel: 42,
            pulse_samples: 500,
            index: 3,
            baseline: 16000,
        };
        let mut bytes = Vec::new();
        header.encode_into(&mut bytes);
        assert_eq!(bytes.len(), FRAGMENT_HEADER_BYTES);
        assert_eq!(FragmentHeader::decode(&bytes), header);
        assert_eq!(fragment_timestamp(&bytes), header.timestamp);
        assert_eq!(fragment_channel(&bytes), header.channel);
    }

    #[test]
    fn pulse_splits_with_padding_on_last() {
        // 100 samples in 50 words, 40-byte payload -> 20 samples per fragment
        let waveform: Vec<u32> = (0..50u32).map(|i| (2 * i + 1) << 16 | 2 * i).collect();
        let mut frags = Vec::new();
        let n = fragment_pulse(
            FragmentHeader {
                timestamp: 1000,
                samples: 0,
                sample_width_ns: 10,
                channel: 5,
                pulse_samples: 0,
                index: 0,
                baseline: 0,
            },
            &waveform,
            40,
            |f| frags.push(f),
        );
        assert_eq!(n, 5);
        for (i, frag) in frags.iter().enumerate() {
            assert_eq!(frag.len(), FRAGMENT_HEADER_BYTES + 40);
            let hdr = FragmentHeader::decode(frag);
            assert_eq!(hdr.index, i as u16);
            assert_eq!(hdr.samples, 20);
            assert_eq!(hdr.pulse_samples, 100);
            assert_eq!(hdr.timestamp, 1000 + 20 * 10 * i as i64);
        }
        // concatenating payloads reproduces the sample stream
        let mut stream = Vec::new();
        for frag in &frags {
            stream.extend_from_slice(&frag[FRAGMENT_HEADER_BYTES..]);
        }
        for (i, pair) in stream.chunks_exact(2).take(100).enumerate() {
            assert_eq!(u16::from_le_bytes([pair[0], pair[1]]), i as u16);
        }
    }

    #[test]
    fn short_pulse_zero_pads() {
        let waveform: Vec<u32> = vec![0x0002_0001, 0x0004_0003, 0x0006_0005];
        let mut frags = Vec::new();
        fragment_pulse(
            FragmentHeader {
                timestamp: 0,
                samples: 0,
                sample_width_ns: 4,
                channel: 0,
                pulse_samples: 0,
                index: 0,
                baseline: 0,
            },
            &waveform,
            20,
            |f| frags.push(f),
        );
        assert_eq!(frags.len(), 1);
        let hdr = FragmentHeader::decode(&frags[0]);
        assert_eq!(hdr.samples, 6);
        assert_eq!(hdr.pulse_samples, 6);
        // 6 real samples, 4 samples of padding
        assert_eq!(&frags[0][FRAGMENT_HEADER_BYTES + 12..], &[0u8; 8]);
    }
}
