//! Register addresses and decode constants shared by the V1724 family.
//!
//! Channel-indexed registers live at `base + 0x100 * channel`.

pub const AQ_CONTROL_REGISTER: u32 = 0x8100;
pub const AQ_STATUS_REGISTER: u32 = 0x8104;
pub const SW_TRIGGER_REGISTER: u32 = 0x8108;
pub const RESET_REGISTER: u32 = 0xEF24;
pub const BOARD_ERR_REGISTER: u32 = 0xEF00;
pub const BOARD_FAIL_STATUS_REGISTER: u32 = 0x8178;
pub const READOUT_STATUS_REGISTER: u32 = 0xEF04;
pub const CH_DAC_REGISTER: u32 = 0x1098;

// Acquisition control values
pub const AQ_START_SIN: u32 = 0x105;
pub const AQ_START_SW: u32 = 0x104;
pub const AQ_STOP: u32 = 0x100;

// Acquisition status bits
pub const AQ_STATUS_RUNNING: u32 = 0x4;
pub const AQ_STATUS_EVENT_READY: u32 = 0x8;
pub const AQ_STATUS_READY: u32 = 0x100;

/// Value every register read returns when the bus transaction failed.
pub const REGISTER_ERROR_PATTERN: u32 = 0xFFFFFFFF;

/// An event block starts at a word whose top nibble is 0xA.
pub const EVENT_HEADER_NIBBLE: u32 = 0xA;
pub const EVENT_HEADER_WORDS: usize = 4;
pub const MAX_CHANNELS: usize = 16;

/// The on-board clock is 31 bits wide and wraps every `1 << 31` cycles.
pub const CLOCK_ROLLOVER_BITS: u32 = 31;
/// Early-window threshold for rollover bookkeeping, in clock ticks.
pub const CLOCK_EARLY_TICKS: u32 = 500_000_000;
/// Late-window threshold for rollover bookkeeping, in clock ticks.
pub const CLOCK_LATE_TICKS: u32 = 1_500_000_000;

/// Strax fragment header size in bytes.
pub const FRAGMENT_HEADER_BYTES: usize = 24;
/// Zero-padded width of chunk directory names.
pub const CHUNK_NAME_LENGTH: usize = 6;
/// Zero-padded width of run names built from the run number.
pub const RUN_NAME_LENGTH: usize = 6;
