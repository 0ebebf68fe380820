//! The supported digitizer models and their decode logic.
//!
//! The V1724 family shares one register layout and one overall block format;
//! the models differ in channel count, sample pitch, header bit packing and a
//! handful of timing corrections. Those differences are kept as data in
//! [`ModelSpec`] so the rest of the crate never branches on the model except
//! inside the two unpack methods.

use std::str::FromStr;
use std::sync::Arc;

use crate::constants::*;
use crate::error::OptionsError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BoardModel {
    V1724,
    V1724Mv,
    V1725,
    V1730,
}

impl FromStr for BoardModel {
    type Err = OptionsError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "V1724" => Ok(BoardModel::V1724),
            "V1724_MV" => Ok(BoardModel::V1724Mv),
            "V1725" => Ok(BoardModel::V1725),
            "V1730" => Ok(BoardModel::V1730),
            _ => Err(OptionsError::UnknownBoardType(s.to_string())),
        }
    }
}

impl BoardModel {
    /// Model names covered by a config type tag.
    pub fn expand_type_tag(tag: &str) -> Vec<&'static str> {
        match tag {
            "V17XX" => vec!["V1724", "V1724_MV", "V1725", "V1730"],
            "V1724" => vec!["V1724"],
            "V1724_MV" => vec!["V1724_MV"],
            "V1725" => vec!["V1725"],
            "V1730" => vec!["V1730"],
            _ => vec![],
        }
    }

    pub fn spec(&self) -> ModelSpec {
        match self {
            BoardModel::V1724 => ModelSpec {
                n_channels: 8,
                sample_width_ns: 10,
                clock_cycle_ns: 10,
                artificial_deadtime_channel: 790,
                ch_trig_register: 0x1060,
                default_delay_ns: 0,
                default_pre_trig_ns: 0,
                constant_time_offset_ns: 0,
            },
            BoardModel::V1724Mv => ModelSpec {
                n_channels: 8,
                sample_width_ns: 10,
                clock_cycle_ns: 10,
                artificial_deadtime_channel: 791,
                // MV boards have reg 0x1n80 for channel n threshold
                ch_trig_register: 0x1080,
                default_delay_ns: 0,
                default_pre_trig_ns: 0,
                constant_time_offset_ns: 2420,
            },
            BoardModel::V1725 => ModelSpec {
                n_channels: 16,
                sample_width_ns: 4,
                clock_cycle_ns: 4,
                artificial_deadtime_channel: 794,
                ch_trig_register: 0x1060,
                default_delay_ns: 0,
                default_pre_trig_ns: 0,
                constant_time_offset_ns: 0,
            },
            BoardModel::V1730 => ModelSpec {
                n_channels: 16,
                sample_width_ns: 2,
                clock_cycle_ns: 2,
                artificial_deadtime_channel: 792,
                ch_trig_register: 0x1060,
                // see the CAEN register document for these two
                default_delay_ns: 2 * 2 * 0xA,
                default_pre_trig_ns: 6 * 2,
                constant_time_offset_ns: 0,
            },
        }
    }
}

/// Per-model constants. These are data, not code paths.
#[derive(Debug, Clone)]
pub struct ModelSpec {
    pub n_channels: usize,
    pub sample_width_ns: u16,
    pub clock_cycle_ns: i64,
    pub artificial_deadtime_channel: i16,
    pub ch_trig_register: u32,
    pub default_delay_ns: i64,
    pub default_pre_trig_ns: i64,
    pub constant_time_offset_ns: i64,
}

/// Identifies one physical board. Immutable after construction.
#[derive(Debug, Clone)]
pub struct BoardDescriptor {
    pub link: i32,
    pub crate_id: i32,
    pub board_id: i32,
    pub model: BoardModel,
    pub host: String,
    pub vme_address: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EventHeader {
    pub words: usize,
    pub channel_mask: u16,
    pub board_fail: bool,
    pub event_time: u32,
}

#[derive(Debug, Clone, Copy)]
pub struct ChannelHit<'a> {
    pub timestamp_ns: i64,
    pub words: usize,
    pub baseline: u16,
    pub waveform: &'a [u32],
}

/// The immutable decode half of a board, shared between the readout thread
/// that fills data packets and the formatter workers that consume them.
#[derive(Debug)]
pub struct BoardDecoder {
    pub board_id: i32,
    pub model: BoardModel,
    pub n_channels: usize,
    pub sample_width_ns: u16,
    pub clock_cycle_ns: i64,
    pub artificial_deadtime_channel: i16,
    pub delay_per_ch_ns: Vec<i64>,
    pub pre_trig_per_ch_ns: Vec<i64>,
    pub constant_time_offset_ns: i64,
}

impl BoardDecoder {
    pub fn new(board_id: i32, model: BoardModel) -> Arc<Self> {
        let spec = model.spec();
        Arc::new(BoardDecoder {
            board_id,
            model,
            n_channels: spec.n_channels,
            sample_width_ns: spec.sample_width_ns,
            clock_cycle_ns: spec.clock_cycle_ns,
            artificial_deadtime_channel: spec.artificial_deadtime_channel,
            delay_per_ch_ns: vec![spec.default_delay_ns; spec.n_channels],
            pre_trig_per_ch_ns: vec![spec.default_pre_trig_ns; spec.n_channels],
            constant_time_offset_ns: spec.constant_time_offset_ns,
        })
    }

    /// Smallest channel block this model can produce, in words.
    pub fn min_channel_words(&self) -> usize {
        match self.model {
            BoardModel::V1724 => 2,
            BoardModel::V1724Mv => 1,
            BoardModel::V1725 | BoardModel::V1730 => 3,
        }
    }

    /// Decode the four-word event header at the start of `sv`.
    pub fn unpack_event_header(&self, sv: &[u32]) -> EventHeader {
        let channel_mask = match self.model {
            BoardModel::V1724 | BoardModel::V1724Mv => (sv[1] & 0xFF) as u16,
            BoardModel::V1725 | BoardModel::V1730 => {
                ((sv[1] & 0xFF) | ((sv[2] >> 16) & 0xFF00)) as u16
            }
        };
        EventHeader {
            words: (sv[0] & 0xFFF_FFFF) as usize,
            channel_mask,
            board_fail: sv[1] & 0x400_0000 != 0,
            event_time: sv[3] & 0x7FFF_FFFF,
        }
    }

    /// Decode one channel block. `sv` points at the first word of the
    /// channel's data; the returned `words` is how far to advance.
    ///
    /// Channels are decoded on worker threads while the board-level rollover
    /// count was latched at read time, so the counter is re-corrected here:
    /// readout windows are short and polled frequently compared to the
    /// rollover timescale, so two timestamps in one packet can only straddle
    /// a wrap by one count.
    pub fn unpack_channel_header<'a>(
        &self,
        sv: &'a [u32],
        clock_counter: i32,
        header_time: u32,
        event_time: u32,
        words_in_event: usize,
        n_channels_set: usize,
        ch: usize,
    ) -> ChannelHit<'a> {
        match self.model {
            BoardModel::V1724 => {
                let words = ((sv[0] & 0x7F_FFFF) as usize).clamp(2, sv.len());
                let ch_time = sv[1] & 0x7FFF_FFFF;
                let rollovers = corrected_rollovers(clock_counter, ch_time, header_time);
                ChannelHit {
                    timestamp_ns: (((rollovers as i64) << CLOCK_ROLLOVER_BITS) + ch_time as i64)
                        * self.clock_cycle_ns,
                    words,
                    baseline: 0,
                    waveform: &sv[2..words],
                }
            }
            BoardModel::V1724Mv => {
                // MV channel blocks carry no header words of their own; the
                // event is split evenly and timed off the event header. The
                // MV is offset by ~2.5us relative to the other detectors for
                // reasons related to trigger formation.
                let words =
                    ((words_in_event - EVENT_HEADER_WORDS) / n_channels_set).min(sv.len());
                let pre_trig_ns = (words as i64) * 2 * self.sample_width_ns as i64
                    - self.pre_trig_per_ch_ns[ch]
                    + self.constant_time_offset_ns;
                let rollovers = corrected_rollovers(clock_counter, event_time, header_time);
                ChannelHit {
                    timestamp_ns: (((rollovers as i64) << CLOCK_ROLLOVER_BITS)
                        + event_time as i64)
                        * self.clock_cycle_ns
                        - pre_trig_ns,
                    words,
                    baseline: 0,
                    waveform: &sv[..words],
                }
            }
            BoardModel::V1725 => {
                let words = ((sv[0] & 0x7F_FFFF) as usize).clamp(3, sv.len());
                let ch_time = sv[1] as i64 | (((sv[2] & 0xFFFF) as i64) << 32);
                ChannelHit {
                    timestamp_ns: ch_time * self.clock_cycle_ns,
                    words,
                    baseline: ((sv[2] >> 16) & 0x3FFF) as u16,
                    waveform: &sv[3..words],
                }
            }
            BoardModel::V1730 => {
                let words = ((sv[0] & 0x7F_FFFF) as usize).clamp(3, sv.len());
                let ch_time = sv[1] as i64 | (((sv[2] & 0xFFFF) as i64) << 32);
                // the factor of 2 on the pre-trigger is special here, see CAEN docs
                ChannelHit {
                    timestamp_ns: ch_time * self.clock_cycle_ns
                        - self.delay_per_ch_ns[ch]
                        - self.pre_trig_per_ch_ns[ch] * 2,
                    words,
                    baseline: ((sv[2] >> 16) & 0x3FFF) as u16,
                    waveform: &sv[3..words],
                }
            }
        }
    }
}

fn corrected_rollovers(clock_counter: i32, local_time: u32, header_time: u32) -> i32 {
    if local_time > CLOCK_LATE_TICKS && header_time < CLOCK_EARLY_TICKS && clock_counter != 0 {
        clock_counter - 1
    } else if local_time < CLOCK_EARLY_TICKS && header_time > CLOCK_LATE_TICKS {
        clock_counter + 1
    } else {
        clock_counter
    }
}
