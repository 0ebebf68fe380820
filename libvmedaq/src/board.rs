//! One digitizer board: register access, acquisition control, block readout
//! and clock-rollover bookkeeping.
//!
//! The actual VME transport sits behind [`VmeBus`] so the rest of the crate
//! is independent of the optical-link library in use; [`crate::sim::SimBus`]
//! provides an in-process implementation.

use std::sync::Arc;

use crate::buffer::DataPacket;
use crate::constants::*;
use crate::error::BoardError;
use crate::models::{BoardDecoder, BoardDescriptor};

/// Result of one MBLT cycle.
#[derive(Debug, Clone, Copy)]
pub struct MbltRead {
    pub bytes: usize,
    /// Set when the board terminated the transfer (FIFO drained).
    pub end_of_data: bool,
}

/// Low-level VME access for one board.
pub trait VmeBus: Send {
    fn init(&mut self, link: i32, crate_id: i32, address: u32) -> Result<(), BoardError>;
    fn write_register(&mut self, address: u32, value: u32) -> Result<(), BoardError>;
    fn read_register(&mut self, address: u32) -> Result<u32, BoardError>;
    /// Append up to `max_bytes` of FIFO data to `out`.
    fn read_mblt(
        &mut self,
        address: u32,
        max_bytes: usize,
        out: &mut Vec<u32>,
    ) -> Result<MbltRead, BoardError>;
}

/// Tracks wrap-arounds of the 31-bit on-board clock.
///
/// The counter wraps every `1 << 31` cycles (21 s on a V1724), so resets must
/// be counted or runs are limited to that. Incrementing whenever a timestamp
/// goes backwards is not enough because channels are quasi-independent, so
/// the tracker watches which end of the clock range recent timestamps came
/// from and only counts a wrap when the history says it really was one.
#[derive(Debug, Default)]
struct RolloverTracker {
    counter: i32,
    last_time: u32,
    seen_under_5: bool,
    seen_over_15: bool,
}

impl RolloverTracker {
    fn reset(&mut self) {
        *self = RolloverTracker::default();
    }

    fn update(&mut self, timestamp: u32) -> i32 {
        if timestamp < CLOCK_EARLY_TICKS {
            if self.seen_over_15 && !self.seen_under_5 && timestamp < self.last_time {
                self.counter += 1;
                spdlog::debug!(
                    "Clock rollover {} ({:x}/{:x})",
                    self.counter,
                    self.last_time,
                    timestamp
                );
            }
            self.seen_under_5 = true;
            self.seen_over_15 = false;
        } else if timestamp < CLOCK_LATE_TICKS {
            self.seen_under_5 = false;
            self.seen_over_15 = false;
        } else {
            self.seen_under_5 = false;
            self.seen_over_15 = true;
        }
        self.last_time = timestamp;
        self.counter
    }
}

pub struct Board {
    decoder: Arc<BoardDecoder>,
    bus: Box<dyn VmeBus>,
    descriptor: BoardDescriptor,
    rollover: RolloverTracker,
    blt_alloc_log2: Vec<u32>,
    blt_safety: f64,
    /// Echo register writes to the log.
    echo_writes: bool,
}

impl Board {
    pub fn new(descriptor: BoardDescriptor, bus: Box<dyn VmeBus>) -> Self {
        Board {
            decoder: BoardDecoder::new(descriptor.board_id, descriptor.model),
            bus,
            descriptor,
            rollover: RolloverTracker::default(),
            // escalating allocation sizes walk the line between many small
            // allocations for full digitizers and few large ones for empty
            blt_alloc_log2: vec![16, 19, 20, 23],
            blt_safety: 1.5,
            echo_writes: false,
        }
    }

    pub fn bid(&self) -> i32 {
        self.descriptor.board_id
    }

    pub fn link(&self) -> i32 {
        self.descriptor.link
    }

    pub fn decoder(&self) -> &Arc<BoardDecoder> {
        &self.decoder
    }

    pub fn n_channels(&self) -> usize {
        self.decoder.n_channels
    }

    /// Open the link and bring the board to a known state.
    pub fn init(&mut self) -> Result<(), BoardError> {
        self.bus.init(
            self.descriptor.link,
            self.descriptor.crate_id,
            self.descriptor.vme_address,
        )?;
        spdlog::debug!(
            "Board {} initialized (link/crate)({}/{})",
            self.bid(),
            self.descriptor.link,
            self.descriptor.crate_id
        );
        self.reset()?;
        std::thread::sleep(std::time::Duration::from_millis(10));
        Ok(())
    }

    /// Pre-load registers: board reset plus the error-propagation flags.
    pub fn reset(&mut self) -> Result<(), BoardError> {
        self.write_register(RESET_REGISTER, 0x1)?;
        self.write_register(BOARD_ERR_REGISTER, 0x30)?;
        Ok(())
    }

    pub fn write_register(&mut self, register: u32, value: u32) -> Result<(), BoardError> {
        self.bus.write_register(register, value)?;
        if self.echo_writes {
            spdlog::trace!("Board {} wrote 0x{:x} to 0x{:04X}", self.bid(), value, register);
        }
        Ok(())
    }

    pub fn read_register(&mut self, register: u32) -> Result<u32, BoardError> {
        let value = self.bus.read_register(register)?;
        if value == REGISTER_ERROR_PATTERN {
            return Err(BoardError::BadRead {
                board: self.bid(),
                register,
            });
        }
        Ok(value)
    }

    pub fn sin_start(&mut self) -> Result<(), BoardError> {
        self.rollover.reset();
        self.write_register(AQ_CONTROL_REGISTER, AQ_START_SIN)
    }

    pub fn software_start(&mut self) -> Result<(), BoardError> {
        self.rollover.reset();
        self.write_register(AQ_CONTROL_REGISTER, AQ_START_SW)
    }

    pub fn acquisition_stop(&mut self) -> Result<(), BoardError> {
        self.write_register(AQ_CONTROL_REGISTER, AQ_STOP)
    }

    pub fn sw_trigger(&mut self) -> Result<(), BoardError> {
        self.write_register(SW_TRIGGER_REGISTER, 0x1)
    }

    pub fn acquisition_status(&mut self) -> Result<u32, BoardError> {
        self.read_register(AQ_STATUS_REGISTER)
    }

    pub fn ensure_ready(&mut self, retries: u32, interval_us: u64) -> Result<(), BoardError> {
        self.monitor_register(AQ_STATUS_REGISTER, AQ_STATUS_READY, retries, interval_us, true)
    }

    pub fn ensure_started(&mut self, retries: u32, interval_us: u64) -> Result<(), BoardError> {
        self.monitor_register(AQ_STATUS_REGISTER, AQ_STATUS_RUNNING, retries, interval_us, true)
    }

    pub fn ensure_stopped(&mut self, retries: u32, interval_us: u64) -> Result<(), BoardError> {
        self.monitor_register(AQ_STATUS_REGISTER, AQ_STATUS_RUNNING, retries, interval_us, false)
    }

    /// Board error survey: bit 0x1 means PLL unlock, 0x2 means VME bus error.
    pub fn check_errors(&mut self) -> Result<u32, BoardError> {
        let pll = self.read_register(BOARD_FAIL_STATUS_REGISTER)?;
        let ros = self.read_register(READOUT_STATUS_REGISTER)?;
        let mut ret = 0;
        if pll & (1 << 4) != 0 {
            ret |= 0x1;
        }
        if ros & (1 << 2) != 0 {
            ret |= 0x2;
        }
        Ok(ret)
    }

    fn monitor_register(
        &mut self,
        register: u32,
        mask: u32,
        retries: u32,
        interval_us: u64,
        want_set: bool,
    ) -> Result<(), BoardError> {
        for _ in 0..retries {
            let value = self.read_register(register)?;
            if (value & mask != 0) == want_set {
                return Ok(());
            }
            std::thread::sleep(std::time::Duration::from_micros(interval_us));
        }
        spdlog::warn!(
            "Board {} MonitorRegister failed for 0x{:04X} with mask 0x{:X}, wanted {}",
            self.bid(),
            register,
            mask,
            want_set as u32
        );
        Err(BoardError::Timeout {
            board: self.bid(),
            register,
            mask,
        })
    }

    /// Drain the board FIFO with escalating MBLT transfers.
    ///
    /// Returns `None` when the board has nothing for us. A bus failure
    /// releases everything read so far.
    pub fn read(&mut self) -> Result<Option<DataPacket>, BoardError> {
        if self.acquisition_status()? & AQ_STATUS_EVENT_READY == 0 {
            return Ok(None);
        }
        let mut words: Vec<u32> = Vec::new();
        let mut cycle = 0usize;
        loop {
            let alloc_log2 = match self.blt_alloc_log2.get(cycle) {
                Some(v) => *v,
                None => self.blt_alloc_log2.last().copied().unwrap_or(23)
                    + (cycle - self.blt_alloc_log2.len()) as u32
                    + 1,
            };
            let request_bytes = ((1u64 << alloc_log2) as f64 / self.blt_safety) as usize;
            let read = self
                .bus
                .read_mblt(self.descriptor.vme_address, request_bytes, &mut words)?;
            cycle += 1;
            if read.end_of_data {
                break;
            }
        }
        if words.is_empty() {
            return Ok(None);
        }
        let (header_time, clock_counter) = match self.get_header_time(&words) {
            Some(ht) => (ht, self.get_clock_counter(ht)),
            None => {
                spdlog::info!("No clock info for {}?", self.bid());
                (REGISTER_ERROR_PATTERN, -1)
            }
        };
        Ok(Some(DataPacket {
            buff: words,
            board_id: self.bid(),
            header_time,
            clock_counter,
            decoder: Arc::clone(&self.decoder),
        }))
    }

    /// The 31-bit trigger time of the first event in a block.
    pub fn get_header_time(&self, block: &[u32]) -> Option<u32> {
        block
            .iter()
            .position(|w| w >> 28 == EVENT_HEADER_NIBBLE)
            .and_then(|i| block.get(i + 3))
            .map(|w| w & 0x7FFF_FFFF)
    }

    /// Fold `timestamp` into the rollover history and return the current
    /// wrap count for this board.
    pub fn get_clock_counter(&mut self, timestamp: u32) -> i32 {
        self.rollover.update(timestamp)
    }

    /// Write the per-channel DAC offsets for the channels set in `mask`.
    pub fn load_dac(&mut self, dac_values: &[u16], mask: u16) -> Result<(), BoardError> {
        for ch in 0..self.decoder.n_channels.min(dac_values.len()) {
            if mask & (1 << ch) == 0 {
                continue;
            }
            self.write_register(CH_DAC_REGISTER + 0x100 * ch as u32, dac_values[ch] as u32)
                .map_err(|e| {
                    spdlog::error!(
                        "Board {} failed writing DAC 0x{:04X} in channel {}",
                        self.bid(),
                        dac_values[ch],
                        ch
                    );
                    e
                })?;
        }
        Ok(())
    }

    pub fn set_thresholds(&mut self, values: &[u16]) -> Result<(), BoardError> {
        let reg = self.descriptor.model.spec().ch_trig_register;
        for ch in 0..self.decoder.n_channels.min(values.len()) {
            self.write_register(reg + 0x100 * ch as u32, values[ch] as u32)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rollover_counts_only_real_wraps() {
        let mut tracker = RolloverTracker::default();
        assert_eq!(tracker.update(0x7FFF_FFF0), 0);
        // crossing the boundary increments exactly once
        assert_eq!(tracker.update(0x0000_000F), 1);
        // staying in the early window does not
        assert_eq!(tracker.update(0x0000_00FF), 1);
        // climbing back up and wrapping again
        assert_eq!(tracker.update(0x6000_0000), 1);
        assert_eq!(tracker.update(0x7FFF_FF00), 1);
        assert_eq!(tracker.update(0x10), 2);
    }

    #[test]
    fn decoded_time_is_monotonic_across_wrap() {
        let mut tracker = RolloverTracker::default();
        let stamps: [u32; 4] = [0x7000_0000, 0x7FFF_FFF0, 0x0000_000F, 0x1000_0000];
        let mut last = -1i64;
        for ts in stamps {
            let cc = tracker.update(ts) as i64;
            let decoded = (cc << CLOCK_ROLLOVER_BITS) + ts as i64;
            assert!(decoded > last);
            last = decoded;
        }
    }
}
