//! An in-process stand-in for the optical-link transport.
//!
//! `SimBus` behaves like a V1724-family board as seen through the VME
//! window: acquisition control and status registers work, software triggers
//! queue events, and MBLT reads drain CAEN-format blocks. The ADC baseline
//! responds linearly to the channel DAC registers so the closed-loop
//! calibration has something real to converge on.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::board::{MbltRead, VmeBus};
use crate::constants::*;
use crate::error::BoardError;
use crate::models::BoardModel;

pub struct SimBus {
    model: BoardModel,
    board_id: i32,
    registers: fxhash::FxHashMap<u32, u32>,
    running: bool,
    /// Generate events on a timer while running, no trigger needed.
    auto_trigger: bool,
    auto_period: std::time::Duration,
    last_auto: std::time::Instant,
    clock: u64,
    event_interval_ticks: u64,
    samples_per_pulse: usize,
    event_counter: u32,
    pending: std::collections::VecDeque<u32>,
    rng: StdRng,
    /// ADC counts at DAC zero, per channel.
    response_yint: f64,
    /// ADC counts per DAC count.
    response_slope: f64,
    noise_counts: f64,
}

impl SimBus {
    pub fn new(model: BoardModel, board_id: i32) -> Self {
        SimBus {
            model,
            board_id,
            registers: fxhash::FxHashMap::default(),
            running: false,
            auto_trigger: true,
            auto_period: std::time::Duration::from_millis(1),
            // far enough in the past that the first poll fires immediately
            last_auto: std::time::Instant::now()
                .checked_sub(std::time::Duration::from_secs(1))
                .unwrap_or_else(std::time::Instant::now),
            clock: 0,
            event_interval_ticks: 40_000,
            samples_per_pulse: 100,
            event_counter: 0,
            pending: std::collections::VecDeque::new(),
            rng: StdRng::seed_from_u64(board_id as u64),
            response_yint: 17000.0,
            response_slope: -0.25,
            noise_counts: 2.0,
        }
    }

    pub fn with_auto_trigger(mut self, auto: bool) -> Self {
        self.auto_trigger = auto;
        self
    }

    pub fn with_samples_per_pulse(mut self, samples: usize) -> Self {
        self.samples_per_pulse = samples;
        self
    }

    pub fn with_start_clock(mut self, ticks: u64) -> Self {
        self.clock = ticks;
        self
    }

    pub fn with_event_interval(mut self, ticks: u64) -> Self {
        self.event_interval_ticks = ticks;
        self
    }

    fn n_channels(&self) -> usize {
        self.model.spec().n_channels
    }

    fn dac(&self, ch: usize) -> u16 {
        self.registers
            .get(&(CH_DAC_REGISTER + 0x100 * ch as u32))
            .copied()
            .unwrap_or(0x0FA0) as u16
    }

    fn sample(&mut self, ch: usize) -> u16 {
        let noise: f64 = self.rng.gen_range(-self.noise_counts..=self.noise_counts);
        let adc = self.response_yint + self.response_slope * self.dac(ch) as f64 + noise;
        adc.clamp(1.0, 0x3FFE as f64) as u16
    }

    fn push_event(&mut self) {
        self.clock += self.event_interval_ticks;
        self.event_counter += 1;
        let ts = (self.clock & 0x7FFF_FFFF) as u32;
        let n_chan = self.n_channels();
        let mask: u32 = (1u32 << n_chan) - 1;
        let wf_words = self.samples_per_pulse / 2;
        let ch_header_words = match self.model {
            BoardModel::V1724 | BoardModel::V1724Mv => 2,
            BoardModel::V1725 | BoardModel::V1730 => 3,
        };
        let ch_words = ch_header_words + wf_words;
        let total = EVENT_HEADER_WORDS + n_chan * ch_words;

        self.pending.push_back(0xA000_0000 | total as u32);
        match self.model {
            BoardModel::V1724 | BoardModel::V1724Mv => {
                self.pending.push_back(mask & 0xFF);
                self.pending.push_back(self.event_counter & 0xFF_FFFF);
            }
            BoardModel::V1725 | BoardModel::V1730 => {
                self.pending.push_back(mask & 0xFF);
                self.pending
                    .push_back((self.event_counter & 0xFF_FFFF) | ((mask >> 8) & 0xFF) << 24);
            }
        }
        self.pending.push_back(ts);

        for ch in 0..n_chan {
            match self.model {
                BoardModel::V1724 | BoardModel::V1724Mv => {
                    self.pending.push_back(ch_words as u32);
                    self.pending.push_back(ts);
                }
                BoardModel::V1725 | BoardModel::V1730 => {
                    let ts48 = self.clock & 0xFFFF_FFFF_FFFF;
                    let baseline = self.sample(ch) & 0x3FFF;
                    self.pending.push_back(ch_words as u32);
                    self.pending.push_back((ts48 & 0xFFFF_FFFF) as u32);
                    self.pending
                        .push_back(((ts48 >> 32) as u32 & 0xFFFF) | (baseline as u32) << 16);
                }
            }
            for _ in 0..wf_words {
                let s0 = self.sample(ch) as u32;
                let s1 = self.sample(ch) as u32;
                self.pending.push_back(s0 | s1 << 16);
            }
        }
    }
}

impl VmeBus for SimBus {
    fn init(&mut self, _link: i32, _crate_id: i32, _address: u32) -> Result<(), BoardError> {
        Ok(())
    }

    fn write_register(&mut self, address: u32, value: u32) -> Result<(), BoardError> {
        match address {
            AQ_CONTROL_REGISTER => match value {
                AQ_START_SW | AQ_START_SIN => self.running = true,
                AQ_STOP => self.running = false,
                _ => (),
            },
            SW_TRIGGER_REGISTER => {
                if self.running {
                    self.push_event();
                }
            }
            RESET_REGISTER => {
                self.pending.clear();
                self.running = false;
            }
            _ => (),
        }
        self.registers.insert(address, value);
        Ok(())
    }

    fn read_register(&mut self, address: u32) -> Result<u32, BoardError> {
        match address {
            AQ_STATUS_REGISTER => {
                if self.running
                    && self.auto_trigger
                    && self.pending.is_empty()
                    && self.last_auto.elapsed() >= self.auto_period
                {
                    self.last_auto = std::time::Instant::now();
                    self.push_event();
                }
                let mut status = AQ_STATUS_READY;
                if self.running {
                    status |= AQ_STATUS_RUNNING;
                }
                if !self.pending.is_empty() {
                    status |= AQ_STATUS_EVENT_READY;
                }
                Ok(status)
            }
            BOARD_FAIL_STATUS_REGISTER | READOUT_STATUS_REGISTER => Ok(0),
            _ => Ok(self.registers.get(&address).copied().unwrap_or(0)),
        }
    }

    fn read_mblt(
        &mut self,
        _address: u32,
        max_bytes: usize,
        out: &mut Vec<u32>,
    ) -> Result<MbltRead, BoardError> {
        let max_words = max_bytes / std::mem::size_of::<u32>();
        let mut read = 0;
        while read < max_words {
            match self.pending.pop_front() {
                Some(w) => {
                    out.push(w);
                    read += 1;
                }
                None => break,
            }
        }
        Ok(MbltRead {
            bytes: read * std::mem::size_of::<u32>(),
            end_of_data: self.pending.is_empty(),
        })
    }
}

impl SimBus {
    pub fn board_id(&self) -> i32 {
        self.board_id
    }
}
