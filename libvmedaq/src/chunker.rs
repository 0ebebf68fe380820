//! Time-bucketing of fragments into chunks.
//!
//! Each worker keeps its own chunk buckets, so no locking happens here. A
//! fragment lands in exactly one bucket: the normal bucket of its chunk, or
//! the overlap bucket if it falls in the trailing overlap window. Overlap
//! buckets are published twice by the writer (`<id>_post` and `<id+1>_pre`).

use std::collections::BTreeMap;

use crate::fragment::{fragment_channel, fragment_timestamp};
use crate::options::Options;

#[derive(Debug, Clone)]
pub struct ChunkerConfig {
    pub chunk_length_ns: i64,
    pub chunk_overlap_ns: i64,
    pub buffer_num_chunks: i64,
    pub phase_limit: i64,
}

impl Default for ChunkerConfig {
    fn default() -> Self {
        ChunkerConfig {
            chunk_length_ns: 5_000_000_000,
            chunk_overlap_ns: 500_000_000,
            buffer_num_chunks: 2,
            phase_limit: 2,
        }
    }
}

impl ChunkerConfig {
    pub fn from_options(opts: &Options) -> Self {
        ChunkerConfig {
            chunk_length_ns: (opts.get_double("strax_chunk_length", 5.0) * 1e9) as i64,
            chunk_overlap_ns: (opts.get_double("strax_chunk_overlap", 0.5) * 1e9) as i64,
            buffer_num_chunks: opts.get_int("strax_buffer_num_chunks", 2) as i64,
            phase_limit: opts.get_int("strax_chunk_phase_limit", 2) as i64,
        }
    }

    pub fn full_chunk_length(&self) -> i64 {
        self.chunk_length_ns + self.chunk_overlap_ns
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Placement {
    Normal,
    Overlap,
}

pub struct Chunker {
    config: ChunkerConfig,
    worker_id: usize,
    chunks: BTreeMap<i64, Vec<Vec<u8>>>,
    overlaps: BTreeMap<i64, Vec<Vec<u8>>>,
}

impl Chunker {
    pub fn new(config: ChunkerConfig, worker_id: usize) -> Self {
        Chunker {
            config,
            worker_id,
            chunks: BTreeMap::new(),
            overlaps: BTreeMap::new(),
        }
    }

    pub fn config(&self) -> &ChunkerConfig {
        &self.config
    }

    pub fn chunk_id_for(&self, timestamp: i64) -> i64 {
        timestamp / self.config.full_chunk_length()
    }

    pub fn placement_for(&self, timestamp: i64) -> Placement {
        let chunk_id = self.chunk_id_for(timestamp);
        if (chunk_id + 1) * self.config.full_chunk_length() - timestamp
            <= self.config.chunk_overlap_ns
        {
            Placement::Overlap
        } else {
            Placement::Normal
        }
    }

    /// Route one encoded fragment to its bucket. Returns the chunk id.
    pub fn add_fragment(&mut self, fragment: Vec<u8>) -> i64 {
        let timestamp = fragment_timestamp(&fragment);
        let chunk_id = self.chunk_id_for(timestamp);

        let (min_chunk, max_chunk) = match (self.chunks.keys().next(), self.chunks.keys().last()) {
            (Some(min), Some(max)) => (*min, *max),
            _ => (0, 1),
        };
        if min_chunk - chunk_id > self.config.phase_limit {
            spdlog::warn!(
                "Worker {} got data from ch {} that's in chunk {} instead of {}/{} (ts {:x}), it might get lost",
                self.worker_id,
                fragment_channel(&fragment),
                chunk_id,
                min_chunk,
                max_chunk,
                timestamp
            );
        } else if chunk_id - max_chunk > 1 {
            spdlog::info!(
                "Worker {} skipped {} chunk(s) (ch{})",
                self.worker_id,
                chunk_id - max_chunk - 1,
                fragment_channel(&fragment)
            );
        }

        match self.placement_for(timestamp) {
            Placement::Normal => self.chunks.entry(chunk_id).or_default().push(fragment),
            Placement::Overlap => self.overlaps.entry(chunk_id).or_default().push(fragment),
        }
        chunk_id
    }

    fn buffered_ids(&self) -> Vec<i64> {
        let mut ids: Vec<i64> = self.chunks.keys().chain(self.overlaps.keys()).copied().collect();
        ids.sort_unstable();
        ids.dedup();
        ids
    }

    /// Chunk ids that are old enough to write out, oldest first, together
    /// with the flush floor (the first id that stays buffered). The floor
    /// advances with the fragment-weighted average chunk so a worker that
    /// momentarily sees no data for a chunk does not close it too early.
    pub fn flush_candidates(&self) -> Option<(Vec<i64>, i64)> {
        let ids = self.buffered_ids();
        let mut total_frags = 0i64;
        let mut weighted = 0f64;
        for id in &ids {
            let n = self.chunks.get(id).map_or(0, Vec::len)
                + self.overlaps.get(id).map_or(0, Vec::len);
            total_frags += n as i64;
            weighted += *id as f64 * n as f64;
        }
        if total_frags == 0 {
            return None;
        }
        let average_chunk = weighted / total_frags as f64;
        let mut floor = *ids.first()?;
        let mut flush = Vec::new();
        while (floor as f64) < average_chunk - self.config.buffer_num_chunks as f64 {
            flush.push(floor);
            floor += 1;
        }
        Some((flush, floor))
    }

    /// Claim the buckets of one chunk for writing.
    pub fn take(&mut self, chunk_id: i64) -> (Vec<Vec<u8>>, Vec<Vec<u8>>) {
        (
            self.chunks.remove(&chunk_id).unwrap_or_default(),
            self.overlaps.remove(&chunk_id).unwrap_or_default(),
        )
    }

    /// Everything still buffered, newest first. Used at end-of-run.
    pub fn remaining_ids_desc(&self) -> Vec<i64> {
        let mut ids = self.buffered_ids();
        ids.reverse();
        ids
    }

    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty() && self.overlaps.is_empty()
    }

    pub fn buffered_fragments(&self) -> usize {
        self.chunks.values().map(Vec::len).sum::<usize>()
            + self.overlaps.values().map(Vec::len).sum::<usize>()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fragment::FragmentHeader;

    fn fragment_at(timestamp: i64) -> Vec<u8> {
        let mut bytes = Vec::new();
        FragmentHeader {
            timestamp,
            samples: 0,
            sample_width_ns: 10,
            channel: 1,
            pulse_samples: 0,
            index: 0,
            baseline: 0,
        }
        .encode_into(&mut bytes);
        bytes
    }

    fn chunker() -> Chunker {
        Chunker::new(ChunkerConfig::default(), 1)
    }

    #[test]
    fn routing_matches_time_windows() {
        let mut c = chunker();
        // full chunk length 5.5e9; 5.3e9 is within the trailing 0.5e9 overlap
        assert_eq!(c.add_fragment(fragment_at(5_300_000_000)), 0);
        assert_eq!(c.placement_for(5_300_000_000), Placement::Overlap);
        assert_eq!(c.add_fragment(fragment_at(1_000_000_000)), 0);
        assert_eq!(c.placement_for(1_000_000_000), Placement::Normal);
        assert_eq!(c.add_fragment(fragment_at(5_600_000_000)), 1);
        let (normal, overlap) = c.take(0);
        assert_eq!(normal.len(), 1);
        assert_eq!(overlap.len(), 1);
    }

    #[test]
    fn overlap_boundary_is_inclusive() {
        let c = chunker();
        let full = c.config().full_chunk_length();
        let overlap = c.config().chunk_overlap_ns;
        assert_eq!(c.placement_for(full - overlap), Placement::Overlap);
        assert_eq!(c.placement_for(full - overlap - 1), Placement::Normal);
    }

    #[test]
    fn flush_floor_tracks_weighted_average() {
        let mut c = chunker();
        let full = c.config().full_chunk_length();
        // lots of data in chunk 6, a little left in chunk 0
        c.add_fragment(fragment_at(full / 2));
        for i in 0..99 {
            c.add_fragment(fragment_at(6 * full + i * 1000));
        }
        // average ~5.94, floor 2 below
        let (flush, floor) = c.flush_candidates().unwrap();
        assert_eq!(flush, vec![0, 1, 2, 3]);
        assert_eq!(floor, 4);
    }

    #[test]
    fn no_flush_when_empty() {
        let c = chunker();
        assert!(c.flush_candidates().is_none());
    }

    #[test]
    fn remaining_ids_are_descending() {
        let mut c = chunker();
        let full = c.config().full_chunk_length();
        c.add_fragment(fragment_at(full * 3 + 1));
        c.add_fragment(fragment_at(1));
        // an overlap-only chunk is not forgotten
        c.add_fragment(fragment_at(full * 5 - 1));
        assert_eq!(c.remaining_ids_desc(), vec![4, 3, 0]);
    }
}
