//! The per-link readout loop.
//!
//! One thread per optical link polls every board on that link, drains its
//! FIFO into data packets and batches them into the shared raw buffer. The
//! boards themselves are behind mutexes because the controller needs
//! register access for start/stop while the loop is running; contention is
//! negligible since lifecycle commands are rare.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use fxhash::FxHashMap;

use crate::board::Board;
use crate::buffer::{DataPacket, RawBuffer};

const STATUS_LOG_INTERVAL: u32 = 10_000;

/// Byte counters the readout loops feed and the status updater drains.
#[derive(Default)]
pub struct ReadoutStats {
    bytes_read: AtomicU64,
    per_board_bytes: Mutex<FxHashMap<i32, u64>>,
    hardware_error: AtomicBool,
}

impl ReadoutStats {
    pub fn new() -> Arc<Self> {
        Arc::new(ReadoutStats::default())
    }

    pub fn add(&self, board_id: i32, bytes: u64) {
        self.bytes_read.fetch_add(bytes, Ordering::Relaxed);
        *self
            .per_board_bytes
            .lock()
            .unwrap()
            .entry(board_id)
            .or_default() += bytes;
    }

    /// Bytes read since the last call.
    pub fn take_bytes_read(&self) -> u64 {
        self.bytes_read.swap(0, Ordering::Relaxed)
    }

    /// Per-board byte counts since the last call.
    pub fn take_per_board(&self) -> FxHashMap<i32, u64> {
        std::mem::take(&mut self.per_board_bytes.lock().unwrap())
    }

    pub fn flag_hardware_error(&self) {
        self.hardware_error.store(true, Ordering::Release);
    }

    pub fn has_hardware_error(&self) -> bool {
        self.hardware_error.load(Ordering::Acquire)
    }
}

/// Thread body for one link. Returns when `run_flag` goes false.
pub fn run_readout_loop(
    link: i32,
    boards: Vec<Arc<Mutex<Board>>>,
    buffer: Arc<RawBuffer>,
    run_flag: Arc<AtomicBool>,
    stats: Arc<ReadoutStats>,
) {
    // anything left over from a previous run is garbage
    buffer.clear();

    let mut readcycler: u32 = 0;
    let mut local: Vec<DataPacket> = Vec::new();
    while run_flag.load(Ordering::Acquire) {
        for entry in &boards {
            let mut board = entry.lock().unwrap();
            if readcycler == 0 {
                match board.acquisition_status() {
                    Ok(status) => {
                        spdlog::debug!("Board {} has status 0x{:04X}", board.bid(), status)
                    }
                    Err(e) => spdlog::warn!("{}", e),
                }
                match board.check_errors() {
                    Ok(0) => (),
                    Ok(flags) => {
                        if flags & 0x1 != 0 {
                            spdlog::warn!("Board {} has PLL unlock", board.bid());
                        }
                        if flags & 0x2 != 0 {
                            spdlog::warn!("Board {} has VME bus error", board.bid());
                        }
                        stats.flag_hardware_error();
                    }
                    Err(e) => spdlog::warn!("{}", e),
                }
            }
            match board.read() {
                Ok(Some(dp)) => {
                    stats.add(board.bid(), dp.size_bytes() as u64);
                    local.push(dp);
                }
                Ok(None) => (),
                Err(e) => {
                    // skip this board for the cycle, the partial transfer
                    // was already released
                    spdlog::warn!("Link {} readout error: {}", link, e);
                }
            }
        }
        if !local.is_empty() {
            buffer.append(&mut local);
        }
        readcycler += 1;
        if readcycler > STATUS_LOG_INTERVAL {
            readcycler = 0;
        }
        std::thread::sleep(std::time::Duration::from_micros(1));
    }
    spdlog::debug!("RO thread {} returning", link);
}
