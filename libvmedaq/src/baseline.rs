//! Closed-loop baseline calibration.
//!
//! Each channel's input offset DAC is tuned until the quiescent ADC level
//! sits at the nominal target. In `calibrate` mode the DAC response is first
//! sampled at three fixed points and fit to a line, which both seeds the DAC
//! near the answer and refreshes the calibration table row.

use crate::board::Board;
use crate::constants::EVENT_HEADER_WORDS;
use crate::error::BoardError;
use crate::options::{CalRow, Options};

/// DAC settings the response line is sampled at.
const DAC_CAL_POINTS: [u16; 3] = [60000, 30000, 6000];

/// Damping on the computed DAC correction to prevent overshoot.
const ADJUSTMENT_DAMPING: f64 = 0.75;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BaselineOutcome {
    Converged,
    DidNotConverge,
}

#[derive(Debug, Clone)]
pub struct BaselineOptions {
    pub nominal: u16,
    pub triggers_per_step: u32,
    pub ms_between_triggers: u64,
    pub dac_settle_ms: u64,
    pub rebin_log2: u32,
    pub bins_around_max: i64,
    pub fraction_around_max: f64,
    pub adjustment_threshold: f64,
    pub convergence_threshold: i32,
    pub min_adjustment: i64,
}

impl Default for BaselineOptions {
    fn default() -> Self {
        BaselineOptions {
            nominal: 16000,
            triggers_per_step: 3,
            ms_between_triggers: 10,
            // "After writing, the user is recommended to wait for a few
            // seconds before a new RUN to let the DAC output get stabilized"
            // - CAEN documentation
            dac_settle_ms: 1000,
            rebin_log2: 1,
            bins_around_max: 3,
            fraction_around_max: 0.8,
            adjustment_threshold: 10.0,
            convergence_threshold: 3,
            min_adjustment: 0xA,
        }
    }
}

impl BaselineOptions {
    pub fn from_options(opts: &Options) -> Self {
        let d = BaselineOptions::default();
        BaselineOptions {
            nominal: opts.get_int("baseline_value", d.nominal as i32) as u16,
            triggers_per_step: opts
                .get_int("baseline_triggers_per_step", d.triggers_per_step as i32)
                as u32,
            ms_between_triggers: opts
                .get_int("baseline_ms_between_triggers", d.ms_between_triggers as i32)
                as u64,
            dac_settle_ms: opts.get_int("baseline_dac_settle_ms", d.dac_settle_ms as i32) as u64,
            rebin_log2: opts.get_int("baseline_rebin_log2", d.rebin_log2 as i32) as u32,
            bins_around_max: opts.get_int("baseline_bins_around_max", d.bins_around_max as i32)
                as i64,
            fraction_around_max: opts
                .get_double("baseline_fraction_around_max", d.fraction_around_max),
            adjustment_threshold: opts
                .get_double("baseline_adjustment_threshold", d.adjustment_threshold),
            convergence_threshold: opts
                .get_int("baseline_convergence_threshold", d.convergence_threshold),
            min_adjustment: opts.get_int("baseline_min_adjustment", d.min_adjustment as i32) as i64,
        }
    }
}

impl Board {
    /// Tune the channel DACs until the measured baselines sit within the
    /// adjustment threshold of `opts.nominal` for several consecutive steps.
    ///
    /// Timeouts in acquisition control are reported as
    /// [`BaselineOutcome::DidNotConverge`] so the caller can retry; bus and
    /// readout failures are hard errors.
    pub fn configure_baselines(
        &mut self,
        dac: &mut [u16],
        cal: &mut CalRow,
        max_iter: u32,
        calibrate: bool,
        opts: &BaselineOptions,
    ) -> Result<BaselineOutcome, BoardError> {
        let n_chan = self.n_channels();
        let target = opts.nominal as f64;
        let mut channel_finished = vec![0i32; n_chan];
        let mut cal_step = vec![0usize; n_chan];
        let mut bl_at_point = vec![[0f64; DAC_CAL_POINTS.len()]; n_chan];

        for step in 0..max_iter {
            spdlog::debug!("Board {} baseline step {}/{}", self.bid(), step, max_iter);
            if calibrate {
                for ch in 0..n_chan {
                    if cal_step[ch] < DAC_CAL_POINTS.len() {
                        dac[ch] = DAC_CAL_POINTS[cal_step[ch]];
                    }
                }
            }
            self.load_dac(dac, 0xFFFF)?;
            std::thread::sleep(std::time::Duration::from_millis(opts.dac_settle_ms));

            if self.run_trigger_cycle(opts).is_err() {
                spdlog::warn!("Board {} baseline acquisition control failed", self.bid());
                let _ = self.acquisition_stop();
                return Ok(BaselineOutcome::DidNotConverge);
            }

            let dp = match self.read()? {
                Some(dp) if dp.buff.len() > EVENT_HEADER_WORDS => dp,
                _ => {
                    spdlog::debug!("Board {} undersized baseline readout", self.bid());
                    continue;
                }
            };
            let baselines = measure_baselines(&dp.buff, &dp.decoder, opts);

            let mut done = true;
            for ch in 0..n_chan {
                let Some(baseline) = baselines[ch] else {
                    if channel_finished[ch] < opts.convergence_threshold {
                        done = false;
                    }
                    continue;
                };
                if calibrate && cal_step[ch] < DAC_CAL_POINTS.len() {
                    bl_at_point[ch][cal_step[ch]] = baseline;
                    cal_step[ch] += 1;
                    if cal_step[ch] == DAC_CAL_POINTS.len() {
                        let (slope, yint) = fit_line(&DAC_CAL_POINTS, &bl_at_point[ch]);
                        cal.slope[ch] = slope;
                        cal.yint[ch] = yint;
                        dac[ch] = ((target - yint) / slope).clamp(0.0, u16::MAX as f64) as u16;
                    }
                    done = false;
                    continue;
                }
                if channel_finished[ch] >= opts.convergence_threshold {
                    if channel_finished[ch] == opts.convergence_threshold {
                        channel_finished[ch] += 1;
                        spdlog::debug!(
                            "{}.{} converged after {} steps: {:.1}",
                            self.bid(),
                            ch,
                            step,
                            baseline
                        );
                    }
                    continue;
                }
                let off_by = target - baseline;
                if off_by.abs() < opts.adjustment_threshold {
                    channel_finished[ch] += 1;
                    continue;
                }
                done = false;
                channel_finished[ch] = (channel_finished[ch] - 1).max(0);
                let slope = cal.slope.get(ch).copied().unwrap_or(-0.25);
                let mut adjustment = (off_by / slope * ADJUSTMENT_DAMPING) as i64;
                if adjustment.abs() < opts.min_adjustment {
                    adjustment = opts.min_adjustment * adjustment.signum();
                }
                dac[ch] = (dac[ch] as i64 + adjustment).clamp(0, u16::MAX as i64) as u16;
            }
            clamp_dac_values(dac, cal);

            if done {
                return Ok(BaselineOutcome::Converged);
            }
        }
        Ok(BaselineOutcome::DidNotConverge)
    }

    fn run_trigger_cycle(&mut self, opts: &BaselineOptions) -> Result<(), BoardError> {
        self.ensure_ready(1000, 1000)?;
        self.software_start()?;
        std::thread::sleep(std::time::Duration::from_millis(1));
        self.ensure_started(1000, 1000)?;
        for _ in 0..opts.triggers_per_step {
            self.sw_trigger()?;
            std::thread::sleep(std::time::Duration::from_millis(opts.ms_between_triggers));
        }
        self.acquisition_stop()?;
        self.ensure_stopped(1000, 1000)?;
        std::thread::sleep(std::time::Duration::from_millis(1));
        Ok(())
    }
}

/// Histogram every channel's samples across all events in the block and
/// estimate the baseline as the weighted average of the bins around the
/// mode. Channels whose distribution is too wide (pulses, not pedestal)
/// yield `None`.
fn measure_baselines(
    buff: &[u32],
    decoder: &crate::models::BoardDecoder,
    opts: &BaselineOptions,
) -> Vec<Option<f64>> {
    let n_chan = decoder.n_channels;
    let mut hists = vec![vec![0u64; 0x4000 >> opts.rebin_log2]; n_chan];
    let mut it = 0usize;
    while it + EVENT_HEADER_WORDS <= buff.len() {
        if buff[it] >> 28 != 0xA {
            it += 1;
            continue;
        }
        let header = decoder.unpack_event_header(&buff[it..]);
        if header.words <= EVENT_HEADER_WORDS || header.channel_mask == 0 {
            it += EVENT_HEADER_WORDS;
            continue;
        }
        if it + header.words > buff.len() {
            break;
        }
        let n_set = header.channel_mask.count_ones() as usize;
        let mut sv = &buff[it + EVENT_HEADER_WORDS..it + header.words];
        for ch in 0..n_chan {
            if header.channel_mask & (1 << ch) == 0 {
                continue;
            }
            let hit = decoder.unpack_channel_header(
                sv,
                0,
                0,
                header.event_time,
                header.words,
                n_set,
                ch,
            );
            for w in hit.waveform {
                for val in [w & 0x3FFF, (w >> 16) & 0x3FFF] {
                    if val != 0 && val != 0x3FFF {
                        hists[ch][(val >> opts.rebin_log2) as usize] += 1;
                    }
                }
            }
            sv = &sv[hit.words.min(sv.len())..];
        }
        it += header.words;
    }

    hists
        .iter()
        .map(|hist| analyze_histogram(hist, opts))
        .collect()
}

fn analyze_histogram(hist: &[u64], opts: &BaselineOptions) -> Option<f64> {
    let max_bin = hist
        .iter()
        .enumerate()
        .max_by_key(|(_, count)| **count)
        .map(|(bin, _)| bin as i64)?;
    let lo = (max_bin - opts.bins_around_max).max(0) as usize;
    let hi = ((max_bin + opts.bins_around_max + 1) as usize).min(hist.len());
    let counts_total: u64 = hist.iter().sum();
    let counts_around_max: u64 = hist[lo..hi].iter().sum();
    if counts_total == 0 || (counts_around_max as f64) < opts.fraction_around_max * counts_total as f64
    {
        return None;
    }
    let weighted: f64 = hist[lo..hi]
        .iter()
        .enumerate()
        .map(|(i, count)| ((lo + i) as f64) * *count as f64)
        .sum();
    Some(weighted / counts_around_max as f64 * (1 << opts.rebin_log2) as f64)
}

fn fit_line(x: &[u16], y: &[f64]) -> (f64, f64) {
    let (mut b, mut c, mut d, mut e, mut f) = (0f64, 0f64, 0f64, 0f64, 0f64);
    for i in 0..x.len() {
        let xi = x[i] as f64;
        b += xi * xi;
        c += 1.0;
        d += xi * y[i];
        e += y[i];
        f += xi;
    }
    let slope = (c * d - e * f) / (b * c - f * f);
    let yint = (b * e - d * f) / (b * c - f * f);
    (slope, yint)
}

/// Keep DAC settings inside the range where the calibrated response still
/// lands on the ADC scale.
fn clamp_dac_values(dac: &mut [u16], cal: &CalRow) {
    for ch in 0..dac.len().min(cal.yint.len()) {
        let min_dac = if cal.yint[ch] > 0x3FFF as f64 {
            ((0x3FFF as f64 - cal.yint[ch]) / cal.slope[ch]).max(0.0) as u16
        } else {
            0
        };
        let clamped = dac[ch].clamp(min_dac, u16::MAX);
        if clamped != dac[ch] {
            spdlog::debug!(
                "ch {} clamped dac to 0x{:04X} ({:.2}, {:.1})",
                ch,
                clamped,
                cal.slope[ch],
                cal.yint[ch]
            );
            dac[ch] = clamped;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{BoardDescriptor, BoardModel};
    use crate::sim::SimBus;

    fn fast_options() -> BaselineOptions {
        BaselineOptions {
            dac_settle_ms: 0,
            ms_between_triggers: 0,
            ..BaselineOptions::default()
        }
    }

    fn sim_board() -> Board {
        let descriptor = BoardDescriptor {
            link: 0,
            crate_id: 0,
            board_id: 7,
            model: BoardModel::V1724,
            host: "test".into(),
            vme_address: 0,
        };
        Board::new(
            descriptor,
            Box::new(SimBus::new(BoardModel::V1724, 7).with_auto_trigger(false)),
        )
    }

    #[test]
    fn fit_line_recovers_linear_response() {
        let y: Vec<f64> = DAC_CAL_POINTS
            .iter()
            .map(|x| 17000.0 - 0.25 * *x as f64)
            .collect();
        let (slope, yint) = fit_line(&DAC_CAL_POINTS, &y);
        assert!((slope + 0.25).abs() < 1e-9);
        assert!((yint - 17000.0).abs() < 1e-6);
    }

    #[test]
    fn calibration_converges_on_simulated_board() {
        let mut board = sim_board();
        board.init().unwrap();
        let mut dac = vec![0u16; 8];
        let mut cal = CalRow::nominal(8);
        let outcome = board
            .configure_baselines(&mut dac, &mut cal, 50, true, &fast_options())
            .unwrap();
        assert_eq!(outcome, BaselineOutcome::Converged);
        for ch in 0..8 {
            // simulated response: adc = 17000 - 0.25 * dac, target 16000
            assert!(
                (dac[ch] as i64 - 4000).abs() < 200,
                "ch {} dac {}",
                ch,
                dac[ch]
            );
            assert!((cal.slope[ch] + 0.25).abs() < 0.05);
        }
    }

    #[test]
    fn cached_mode_single_pass_leaves_good_dac_alone() {
        let mut board = sim_board();
        board.init().unwrap();
        let mut dac = vec![4000u16; 8];
        let mut cal = CalRow::nominal(8);
        board
            .configure_baselines(&mut dac, &mut cal, 1, false, &fast_options())
            .unwrap();
        for ch in 0..8 {
            assert!((dac[ch] as i64 - 4000).abs() < 100);
        }
    }

    #[test]
    fn histogram_analysis_rejects_wide_distributions() {
        let opts = BaselineOptions::default();
        let mut hist = vec![0u64; 0x2000];
        for i in 0..hist.len() {
            hist[i] = 1;
        }
        assert!(analyze_histogram(&hist, &opts).is_none());
        let mut hist = vec![0u64; 0x2000];
        hist[1000] = 100;
        hist[1001] = 50;
        let bl = analyze_histogram(&hist, &opts).unwrap();
        assert!((bl - 2.0 * (1000.0 * 100.0 + 1001.0 * 50.0) / 150.0).abs() < 1e-6);
    }
}
