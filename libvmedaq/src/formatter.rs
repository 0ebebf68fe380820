//! The formatter worker: raw board blocks in, compressed chunk files out.
//!
//! Each worker claims whole data packets from the shared raw buffer, walks
//! the event stream, cuts every channel pulse into fragments, buckets them
//! by chunk, and publishes finished chunks through the compressor and the
//! atomic writer. Workers share nothing but the raw buffer and their stats
//! block, so the hot path takes no locks.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use fxhash::FxHashMap;

use crate::buffer::{DataPacket, RawBuffer};
use crate::chunker::{Chunker, ChunkerConfig};
use crate::compressor::Compressor;
use crate::constants::{EVENT_HEADER_NIBBLE, EVENT_HEADER_WORDS, FRAGMENT_HEADER_BYTES, RUN_NAME_LENGTH};
use crate::error::FormatterError;
use crate::fragment::{fragment_pulse, FragmentHeader};
use crate::models::EventHeader;
use crate::options::Options;
use crate::writer::ChunkWriter;

/// Counters one worker exposes to the controller and the status updater.
#[derive(Default)]
pub struct WorkerStats {
    error: AtomicBool,
    pub bytes_processed: AtomicUsize,
    pub output_buffer_bytes: AtomicUsize,
    data_per_chan: Mutex<FxHashMap<i16, u64>>,
    fail_counter: Mutex<FxHashMap<i32, u64>>,
}

impl WorkerStats {
    pub fn new() -> Arc<Self> {
        Arc::new(WorkerStats::default())
    }

    pub fn flag_error(&self) {
        self.error.store(true, Ordering::Release);
    }

    pub fn has_error(&self) -> bool {
        self.error.load(Ordering::Acquire)
    }

    /// Per-channel byte counts since the last call.
    pub fn take_data_per_chan(&self) -> FxHashMap<i16, u64> {
        std::mem::take(&mut self.data_per_chan.lock().unwrap())
    }

    /// Per-board fail counts since the last call.
    pub fn take_fail_counts(&self) -> FxHashMap<i32, u64> {
        std::mem::take(&mut self.fail_counter.lock().unwrap())
    }

    pub fn fail_count(&self, board_id: i32) -> u64 {
        self.fail_counter
            .lock()
            .unwrap()
            .get(&board_id)
            .copied()
            .unwrap_or(0)
    }
}

/// Derive the run directory name from the run number.
pub fn run_name(options: &Options) -> String {
    match options.get_int("number", -1) {
        -1 => "run".to_string(),
        number => format!("{:0width$}", number, width = RUN_NAME_LENGTH),
    }
}

pub struct FormatterWorker {
    worker_id: usize,
    options: Arc<Options>,
    buffer: Arc<RawBuffer>,
    active: Arc<AtomicBool>,
    stats: Arc<WorkerStats>,
    chunker: Chunker,
    compressor: Compressor,
    writer: ChunkWriter,
    fragment_bytes: usize,
    full_fragment_size: usize,
    run_number: i32,
    bytes_processed: usize,
    max_chunk_seen: Option<i64>,
    // end-of-run diagnostics
    frags_per_event: FxHashMap<usize, u64>,
    events_per_packet: FxHashMap<usize, u64>,
    bytes_per_chunk_log2: FxHashMap<u32, u64>,
}

impl FormatterWorker {
    pub fn new(
        worker_id: usize,
        options: Arc<Options>,
        buffer: Arc<RawBuffer>,
        active: Arc<AtomicBool>,
        stats: Arc<WorkerStats>,
    ) -> Result<Self, FormatterError> {
        let fragment_bytes = options.get_int("strax_fragment_payload_bytes", 220) as usize;
        let compressor: Compressor = options.get_string("compressor", "lz4").parse()?;
        let output_root = options.get_string("strax_output_path", "./");
        let hostname = options.hostname().to_string();
        let writer = ChunkWriter::new(
            std::path::Path::new(&output_root),
            &run_name(&options),
            &hostname,
            worker_id,
        )?;
        let chunker = Chunker::new(ChunkerConfig::from_options(&options), worker_id);
        let run_number = options.get_int("number", -1);
        Ok(FormatterWorker {
            worker_id,
            options,
            buffer,
            active,
            stats,
            chunker,
            compressor,
            writer,
            fragment_bytes,
            full_fragment_size: FRAGMENT_HEADER_BYTES + fragment_bytes,
            run_number,
            bytes_processed: 0,
            max_chunk_seen: None,
            frags_per_event: FxHashMap::default(),
            events_per_packet: FxHashMap::default(),
            bytes_per_chunk_log2: FxHashMap::default(),
        })
    }

    /// Thread body. Runs until shutdown, then drains the buffer and closes
    /// out the run.
    pub fn run(mut self) {
        while let Some(dp) = self.buffer.pop(&self.active) {
            if let Err(e) = self.process_packet(dp) {
                spdlog::error!("Worker {} giving up: {}", self.worker_id, e);
                self.stats.flag_error();
                return;
            }
            if self.active.load(Ordering::Acquire) {
                if let Err(e) = self.write_out_chunks() {
                    spdlog::error!("Worker {} write failed: {}", self.worker_id, e);
                    self.stats.flag_error();
                    return;
                }
            }
        }
        if self.bytes_processed > 0 {
            if let Err(e) = self.end() {
                spdlog::error!("Worker {} end-of-run failed: {}", self.worker_id, e);
                self.stats.flag_error();
            }
        }
        self.log_diagnostics();
    }

    fn process_packet(&mut self, dp: DataPacket) -> Result<(), FormatterError> {
        let mut it = 0usize;
        let mut events_this_packet = 0usize;
        let mut seen_event = false;
        let mut dpc: FxHashMap<i16, u64> = FxHashMap::default();

        while it < dp.buff.len() {
            if dp.buff[it] >> 28 == EVENT_HEADER_NIBBLE {
                let words = (dp.buff[it] & 0xFFF_FFFF) as usize;
                if words < EVENT_HEADER_WORDS || it + words > dp.buff.len() {
                    spdlog::warn!(
                        "Truncated event from {} at idx {:x}/{:x}, dropping rest of packet",
                        dp.board_id,
                        it,
                        dp.buff.len()
                    );
                    self.dump_packet(&dp);
                    break;
                }
                self.process_event(&dp.buff[it..it + words], &dp, &mut dpc)?;
                events_this_packet += 1;
                seen_event = true;
                it += words;
            } else {
                if seen_event {
                    spdlog::warn!(
                        "Missed an event from {} at idx {:x}/{:x} ({:x})",
                        dp.board_id,
                        it,
                        dp.buff.len(),
                        dp.buff[it]
                    );
                    seen_event = false;
                    // rare enough that keeping the evidence is worth a file
                    self.dump_packet(&dp);
                }
                it += 1;
            }
        }

        self.bytes_processed += dp.size_bytes();
        self.stats
            .bytes_processed
            .fetch_add(dp.size_bytes(), Ordering::Relaxed);
        *self
            .events_per_packet
            .entry(events_this_packet)
            .or_default() += 1;
        if !dpc.is_empty() {
            let mut shared = self.stats.data_per_chan.lock().unwrap();
            for (ch, bytes) in dpc {
                *shared.entry(ch).or_default() += bytes;
            }
        }
        Ok(())
    }

    fn process_event(
        &mut self,
        sv: &[u32],
        dp: &DataPacket,
        dpc: &mut FxHashMap<i16, u64>,
    ) -> Result<(), FormatterError> {
        let header = dp.decoder.unpack_event_header(sv);
        if header.board_fail {
            self.generate_artificial_deadtime(dp);
            *self
                .stats
                .fail_counter
                .lock()
                .unwrap()
                .entry(dp.board_id)
                .or_default() += 1;
            return Ok(());
        }

        let n_set = header.channel_mask.count_ones() as usize;
        let mut sv_ch = &sv[EVENT_HEADER_WORDS..];
        let mut frags = 0usize;
        for ch in 0..dp.decoder.n_channels {
            if header.channel_mask & (1 << ch) == 0 {
                continue;
            }
            if sv_ch.len() < dp.decoder.min_channel_words() {
                spdlog::warn!(
                    "Board {} event at ts {:x} ran short in channel {}",
                    dp.board_id,
                    header.event_time,
                    ch
                );
                break;
            }
            let advance = self.process_channel(sv_ch, &header, dp, n_set, ch, &mut frags, dpc)?;
            sv_ch = &sv_ch[advance.min(sv_ch.len())..];
        }
        *self.frags_per_event.entry(frags).or_default() += 1;
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    fn process_channel(
        &mut self,
        sv: &[u32],
        header: &EventHeader,
        dp: &DataPacket,
        n_channels_set: usize,
        ch: usize,
        frags: &mut usize,
        dpc: &mut FxHashMap<i16, u64>,
    ) -> Result<usize, FormatterError> {
        let hit = dp.decoder.unpack_channel_header(
            sv,
            dp.clock_counter,
            dp.header_time,
            header.event_time,
            header.words,
            n_channels_set,
            ch,
        );

        let global_ch = self.options.channel_map(dp.board_id, ch);
        // not knowing which channel the data came from is serious enough to
        // take the worker down
        if global_ch == -1 {
            return Err(FormatterError::UnmappedChannel {
                board: dp.board_id,
                channel: ch,
            });
        }

        let seed = FragmentHeader {
            timestamp: hit.timestamp_ns,
            samples: 0,
            sample_width_ns: dp.decoder.sample_width_ns,
            channel: global_ch,
            pulse_samples: 0,
            index: 0,
            baseline: hit.baseline,
        };
        let mut emitted = Vec::new();
        let n = fragment_pulse(seed, hit.waveform, self.fragment_bytes, |f| emitted.push(f));
        *frags += n;
        for fragment in emitted {
            self.add_fragment(fragment);
        }
        *dpc.entry(global_ch).or_default() += (hit.waveform.len() * 4) as u64;
        Ok(hit.words)
    }

    /// A board that flagged an internal fault for an event produced no usable
    /// waveforms; mark the interval on the model's dead-time channel instead
    /// so the gap is visible downstream.
    fn generate_artificial_deadtime(&mut self, dp: &DataPacket) {
        let ticks = ((dp.clock_counter as i64) << 31) + dp.header_time as i64;
        let samples = (self.fragment_bytes / 2) as i32;
        let mut fragment = Vec::with_capacity(self.full_fragment_size);
        FragmentHeader {
            timestamp: ticks * dp.decoder.clock_cycle_ns,
            samples,
            sample_width_ns: dp.decoder.sample_width_ns,
            channel: dp.decoder.artificial_deadtime_channel,
            pulse_samples: samples as u32,
            index: 0,
            baseline: 0,
        }
        .encode_into(&mut fragment);
        fragment.resize(self.full_fragment_size, 0);
        self.add_fragment(fragment);
    }

    fn add_fragment(&mut self, fragment: Vec<u8>) {
        let chunk_id = self.chunker.add_fragment(fragment);
        self.max_chunk_seen = Some(self.max_chunk_seen.map_or(chunk_id, |m| m.max(chunk_id)));
        self.stats
            .output_buffer_bytes
            .fetch_add(self.full_fragment_size, Ordering::Relaxed);
    }

    fn write_out_chunks(&mut self) -> Result<(), FormatterError> {
        if let Some((flush, floor)) = self.chunker.flush_candidates() {
            for chunk_id in flush {
                self.write_out_chunk(chunk_id)?;
            }
            self.writer.create_empty(floor)?;
        }
        Ok(())
    }

    fn write_out_chunk(&mut self, chunk_id: i64) -> Result<(), FormatterError> {
        let (normal, overlap) = self.chunker.take(chunk_id);
        let names = ChunkWriter::chunk_names(chunk_id);

        let mut buffers: [Option<Vec<u8>>; 2] = [None, None];
        for (i, bucket) in [normal, overlap].into_iter().enumerate() {
            if bucket.is_empty() {
                continue;
            }
            let size: usize = bucket.iter().map(Vec::len).sum();
            let mut concatenated = Vec::with_capacity(size);
            for fragment in bucket {
                concatenated.extend_from_slice(&fragment);
            }
            self.stats
                .output_buffer_bytes
                .fetch_sub(size, Ordering::Relaxed);
            *self
                .bytes_per_chunk_log2
                .entry((size as f64).log2() as u32)
                .or_default() += 1;
            buffers[i] = self.compressor.compress(concatenated)?;
        }
        let [normal_bytes, overlap_bytes] = buffers;

        if let Some(bytes) = normal_bytes {
            self.writer.publish(&names[0], &bytes)?;
        }
        if let Some(bytes) = overlap_bytes {
            // the same buffer lands as this chunk's tail and the next
            // chunk's head
            self.writer.publish(&names[1], &bytes)?;
            self.writer.publish(&names[2], &bytes)?;
        }
        Ok(())
    }

    fn end(&mut self) -> Result<(), FormatterError> {
        for chunk_id in self.chunker.remaining_ids_desc() {
            self.write_out_chunk(chunk_id)?;
        }
        if let Some(max) = self.max_chunk_seen {
            self.writer.create_empty(max + 1)?;
        }
        self.writer.write_end_marker()?;
        Ok(())
    }

    fn dump_packet(&self, dp: &DataPacket) {
        let path = self
            .writer
            .output_path()
            .join(format!("{}_{}_missed", self.run_number, self.worker_id));
        let mut bytes = Vec::with_capacity(dp.size_bytes());
        for w in &dp.buff {
            bytes.extend_from_slice(&w.to_le_bytes());
        }
        if let Err(e) = std::fs::write(&path, bytes) {
            spdlog::warn!("Could not dump block to {:?}: {}", path, e);
        }
    }

    fn log_diagnostics(&self) {
        let events: u64 = self.events_per_packet.iter().map(|(n, c)| *n as u64 * c).sum();
        let frags: u64 = self.frags_per_event.iter().map(|(n, c)| *n as u64 * c).sum();
        spdlog::debug!(
            "Worker {} processed {}: {} events, {} fragments, {} chunks written",
            self.worker_id,
            human_bytes::human_bytes(self.bytes_processed as f64),
            events,
            frags,
            self.bytes_per_chunk_log2.values().sum::<u64>()
        );
    }
}
