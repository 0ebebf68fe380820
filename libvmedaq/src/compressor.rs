//! Pluggable chunk compression.
//!
//! `delete` is the odd one out: it reports "nothing to write" so the writer
//! skips file creation entirely. It exists for throughput testing, where the
//! disk would otherwise be the bottleneck being measured.

use std::io::Write;
use std::str::FromStr;

use lz4_flex::frame::{BlockMode, BlockSize, FrameEncoder, FrameInfo};

use crate::error::CompressorError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Compressor {
    Blosc,
    Lz4,
    None,
    Delete,
}

impl FromStr for Compressor {
    type Err = CompressorError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "blosc" => Ok(Compressor::Blosc),
            "lz4" => Ok(Compressor::Lz4),
            "none" => Ok(Compressor::None),
            "delete" => Ok(Compressor::Delete),
            _ => Err(CompressorError::UnknownCompressor(s.to_string())),
        }
    }
}

impl Compressor {
    /// Compress one chunk buffer. `Ok(None)` means the input was consumed
    /// and nothing should be written.
    pub fn compress(&self, input: Vec<u8>) -> Result<Option<Vec<u8>>, CompressorError> {
        match self {
            Compressor::Blosc => {
                let ctx = blosc::Context::new()
                    .compressor(blosc::Compressor::LZ4)
                    .map_err(|_| CompressorError::BloscError)?
                    .clevel(blosc::Clevel::L5)
                    .shuffle(blosc::ShuffleMode::Byte)
                    .typesize(Some(1));
                Ok(Some(ctx.compress(&input[..]).into()))
            }
            Compressor::Lz4 => {
                let info = FrameInfo::new()
                    .block_size(BlockSize::Max256KB)
                    .block_mode(BlockMode::Linked)
                    .content_checksum(false);
                let mut encoder = FrameEncoder::with_frame_info(info, Vec::new());
                encoder.write_all(&input)?;
                Ok(Some(encoder.finish()?))
            }
            Compressor::None => Ok(Some(input)),
            Compressor::Delete => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_names() {
        assert_eq!("lz4".parse::<Compressor>().unwrap(), Compressor::Lz4);
        assert_eq!("delete".parse::<Compressor>().unwrap(), Compressor::Delete);
        assert!("gzip".parse::<Compressor>().is_err());
    }

    #[test]
    fn lz4_frame_round_trips() {
        let input: Vec<u8> = (0..10_000u32).flat_map(|i| (i % 251).to_le_bytes()).collect();
        let compressed = Compressor::Lz4.compress(input.clone()).unwrap().unwrap();
        assert!(compressed.len() < input.len());
        let mut decoder = lz4_flex::frame::FrameDecoder::new(&compressed[..]);
        let mut restored = Vec::new();
        std::io::Read::read_to_end(&mut decoder, &mut restored).unwrap();
        assert_eq!(restored, input);
    }

    #[test]
    fn none_is_passthrough() {
        let input = vec![1u8, 2, 3];
        assert_eq!(
            Compressor::None.compress(input.clone()).unwrap().unwrap(),
            input
        );
    }

    #[test]
    fn delete_produces_nothing() {
        assert!(Compressor::Delete.compress(vec![0; 128]).unwrap().is_none());
    }
}
