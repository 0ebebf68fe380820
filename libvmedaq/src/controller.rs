//! The run-lifecycle state machine.
//!
//! One controller owns the boards, the shared raw buffer, the readout
//! threads and the formatter workers, and walks them through
//! Idle -> Arming -> Armed -> Running -> Idle. Errors latch the Error state;
//! runs are not auto-recovered, the operator stops and re-arms.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;

use fxhash::FxHashMap;

use crate::baseline::{BaselineOptions, BaselineOutcome};
use crate::board::{Board, VmeBus};
use crate::buffer::RawBuffer;
use crate::error::{BoardError, ControllerError};
use crate::formatter::{FormatterWorker, WorkerStats};
use crate::models::BoardDescriptor;
use crate::options::{DacTable, Options};
use crate::readout::{run_readout_loop, ReadoutStats};
use crate::status::StatusUpdate;

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
pub enum Status {
    Idle = 0,
    Arming = 1,
    Armed = 2,
    Running = 3,
    Error = 4,
}

impl Status {
    fn from_u8(value: u8) -> Status {
        match value {
            1 => Status::Arming,
            2 => Status::Armed,
            3 => Status::Running,
            4 => Status::Error,
            _ => Status::Idle,
        }
    }
}

/// Constructs the VME transport for one board. The real optical-link
/// library lives outside this crate; tests and the bundled daemon plug in
/// [`crate::sim::SimBus`].
pub type BusFactory = Box<dyn Fn(&BoardDescriptor) -> Result<Box<dyn VmeBus>, BoardError> + Send + Sync>;

enum LinkInitError {
    Retryable,
    Fatal(BoardError),
}

pub struct Controller {
    hostname: String,
    state: Arc<AtomicU8>,
    options: Option<Arc<Options>>,
    boards: BTreeMap<i32, Vec<Arc<Mutex<Board>>>>,
    buffer: Arc<RawBuffer>,
    workers_active: Arc<AtomicBool>,
    readout_running: Arc<AtomicBool>,
    readout_handles: Vec<JoinHandle<()>>,
    worker_handles: Vec<JoinHandle<()>>,
    worker_stats: Vec<Arc<WorkerStats>>,
    readout_stats: Arc<ReadoutStats>,
    bus_factory: BusFactory,
}

impl Controller {
    pub fn new(hostname: &str, bus_factory: BusFactory) -> Self {
        Controller {
            hostname: hostname.to_string(),
            state: Arc::new(AtomicU8::new(Status::Idle as u8)),
            options: None,
            boards: BTreeMap::new(),
            buffer: Arc::new(RawBuffer::new()),
            workers_active: Arc::new(AtomicBool::new(false)),
            readout_running: Arc::new(AtomicBool::new(false)),
            readout_handles: Vec::new(),
            worker_handles: Vec::new(),
            worker_stats: Vec::new(),
            readout_stats: ReadoutStats::new(),
            bus_factory,
        }
    }

    pub fn status(&self) -> Status {
        Status::from_u8(self.state.load(Ordering::Acquire))
    }

    fn set_state(&self, status: Status) {
        self.state.store(status as u8, Ordering::Release);
    }

    /// Construct and program every configured board, then spin up the
    /// readout and formatter threads.
    pub fn arm(&mut self, options: Arc<Options>) -> Result<(), ControllerError> {
        let n_workers = options
            .get_nested_int(&format!("processing_threads.{}", self.hostname), 8)
            .max(1) as usize;
        spdlog::info!(
            "Beginning electronics initialization with {} threads",
            n_workers
        );
        self.set_state(Status::Arming);
        self.options = Some(Arc::clone(&options));

        let descriptors = match options.get_boards("V17XX", &self.hostname) {
            Ok(d) => d,
            Err(e) => {
                self.set_state(Status::Idle);
                return Err(ControllerError::ConfigError(e));
            }
        };
        let mut num_boards = 0;
        for descriptor in descriptors {
            spdlog::info!("Arming new digitizer {}", descriptor.board_id);
            let init = (self.bus_factory)(&descriptor).and_then(|bus| {
                let mut board = Board::new(descriptor.clone(), bus);
                board.init().map(|_| board)
            });
            match init {
                Ok(board) => {
                    self.boards
                        .entry(descriptor.link)
                        .or_default()
                        .push(Arc::new(Mutex::new(board)));
                    num_boards += 1;
                }
                Err(e) => {
                    spdlog::warn!("Failed to initialize digitizer {}: {}", descriptor.board_id, e);
                    self.boards.clear();
                    self.set_state(Status::Idle);
                    return Err(ControllerError::HardwareError(e));
                }
            }
        }
        spdlog::info!("This host has {} boards", num_boards);
        spdlog::debug!("Sleeping for two seconds");
        // For the sake of sanity and sleeping through the night,
        // do not remove this statement.
        std::thread::sleep(std::time::Duration::from_secs(2)); // <-- this one. Leave it here.
        // Seriously. This sleep statement is absolutely vital.

        // Parallel digitizer programming to speed baselining
        let baseline_mode = options.get_string("baseline_dac_mode", "fixed");
        let baseline_opts = BaselineOptions::from_options(&options);
        let dac_table: Mutex<DacTable> = Mutex::new(DacTable::new());
        let boards = &self.boards;
        let results: Vec<(i32, Result<(), LinkInitError>)> = std::thread::scope(|scope| {
            let handles: Vec<_> = boards
                .iter()
                .map(|(link, link_boards)| {
                    let (options, mode, bopts) = (&options, &baseline_mode, &baseline_opts);
                    let table = &dac_table;
                    (
                        *link,
                        scope.spawn(move || init_link(link_boards, options, mode, bopts, table)),
                    )
                })
                .collect();
            handles
                .into_iter()
                .map(|(link, handle)| {
                    (
                        link,
                        handle.join().unwrap_or(Err(LinkInitError::Retryable)),
                    )
                })
                .collect()
        });
        for (link, result) in results {
            match result {
                Ok(()) => (),
                Err(LinkInitError::Fatal(e)) => {
                    spdlog::warn!("Encountered errors during digitizer programming");
                    self.set_state(Status::Error);
                    return Err(ControllerError::HardwareError(e));
                }
                Err(LinkInitError::Retryable) => {
                    spdlog::warn!("Encountered errors during digitizer programming");
                    self.set_state(Status::Idle);
                    return Err(ControllerError::LinkInitError(link));
                }
            }
        }
        spdlog::debug!("Digitizer programming successful");
        if baseline_mode == "fit" {
            options.update_dac(&dac_table.into_inner().unwrap())?;
        }

        let s_in_start = options.get_int("run_start", 0) == 1;
        for entry in self.all_boards() {
            let mut board = entry.lock().unwrap();
            let result = if s_in_start {
                board.sin_start()
            } else {
                board.acquisition_stop()
            };
            if let Err(e) = result {
                self.set_state(Status::Idle);
                return Err(ControllerError::HardwareError(e));
            }
        }

        if let Err(e) = self.open_threads(n_workers, &options) {
            spdlog::warn!("Error opening threads: {}", e);
            self.set_state(Status::Idle);
            return Err(e);
        }

        std::thread::sleep(std::time::Duration::from_secs(1));
        self.set_state(Status::Armed);
        spdlog::info!("Arm command finished, returning to main loop");
        Ok(())
    }

    /// Begin acquisition. With `run_start == 0` every board is polled
    /// ready, software-started and polled running; otherwise the boards
    /// were S-IN-started during arm and this is just a state change.
    pub fn start(&mut self) -> Result<(), ControllerError> {
        let options = self.options.clone().ok_or(ControllerError::NotArmed)?;
        if options.get_int("run_start", 0) == 0 {
            for entry in self.all_boards() {
                let mut board = entry.lock().unwrap();
                spdlog::debug!("Starting board {} link {}", board.bid(), board.link());
                board.ensure_ready(1000, 1000).map_err(timeout_error)?;
                board.software_start()?;
                board.ensure_started(1000, 1000).map_err(timeout_error)?;
            }
        }
        self.set_state(Status::Running);
        Ok(())
    }

    /// Stop acquisition, wind down the readout loops and close out every
    /// worker. Always lands in Idle.
    pub fn stop(&mut self) -> Result<(), ControllerError> {
        spdlog::info!("Stopping boards");
        for entry in self.all_boards() {
            let mut board = entry.lock().unwrap();
            if let Err(e) = board.acquisition_stop() {
                spdlog::warn!("{}", e);
            }
        }
        for entry in self.all_boards() {
            let mut board = entry.lock().unwrap();
            if board.ensure_stopped(1000, 1000).is_err() {
                spdlog::warn!(
                    "Timed out waiting for {} to stop after SW stop sent",
                    board.bid()
                );
            }
        }
        spdlog::debug!("Stopped digitizers, closing threads");
        self.readout_running.store(false, Ordering::Release);
        for handle in self.readout_handles.drain(..) {
            let _ = handle.join();
        }
        self.close_workers();
        self.set_state(Status::Idle);
        spdlog::info!("Finished end sequence");
        Ok(())
    }

    /// Stop plus full teardown: drop buffered data, destroy the boards and
    /// forget the run mode.
    pub fn end(&mut self) -> Result<(), ControllerError> {
        self.stop()?;
        self.buffer.clear();
        spdlog::debug!("Closing digitizers");
        self.boards.clear();
        self.options = None;
        Ok(())
    }

    /// Survey the formatter workers (and the readout loops) for latched
    /// errors. Moves to Error if any is found; the operator is expected to
    /// stop and re-arm.
    pub fn check_errors(&mut self) -> bool {
        let mut found = self.worker_stats.iter().any(|s| s.has_error());
        found |= self.readout_stats.has_hardware_error();
        if found {
            self.set_state(Status::Error);
        }
        found
    }

    /// Snapshot-and-reset the run counters for the status stream.
    pub fn status_snapshot(&self) -> StatusUpdate {
        let mut channels: BTreeMap<i16, u64> = BTreeMap::new();
        let mut output_bytes = 0usize;
        for stats in &self.worker_stats {
            for (ch, bytes) in stats.take_data_per_chan() {
                *channels.entry(ch).or_default() += bytes;
            }
            output_bytes += stats.output_buffer_bytes.load(Ordering::Relaxed);
        }
        let boards: BTreeMap<i32, u64> = self.readout_stats.take_per_board().into_iter().collect();
        let (mode, number) = match &self.options {
            Some(o) => (o.get_string("name", "none"), o.get_int("number", -1)),
            None => ("none".to_string(), -1),
        };
        StatusUpdate {
            host: self.hostname.clone(),
            time: chrono::Utc::now(),
            status: self.status(),
            bytes_read: self.readout_stats.take_bytes_read(),
            buffer_bytes: (self.buffer.total_bytes() + output_bytes) as u64,
            boards,
            channels_kb: channels.into_iter().map(|(c, b)| (c, b >> 10)).collect(),
            mode,
            number,
        }
    }

    fn all_boards(&self) -> Vec<Arc<Mutex<Board>>> {
        self.boards.values().flatten().cloned().collect()
    }

    fn open_threads(
        &mut self,
        n_workers: usize,
        options: &Arc<Options>,
    ) -> Result<(), ControllerError> {
        self.workers_active.store(true, Ordering::Release);
        self.readout_running.store(true, Ordering::Release);
        for worker_id in 1..=n_workers {
            let stats = WorkerStats::new();
            let worker = FormatterWorker::new(
                worker_id,
                Arc::clone(options),
                Arc::clone(&self.buffer),
                Arc::clone(&self.workers_active),
                Arc::clone(&stats),
            )?;
            self.worker_stats.push(stats);
            self.worker_handles.push(
                std::thread::Builder::new()
                    .name(format!("formatter-{worker_id}"))
                    .spawn(move || worker.run())?,
            );
        }
        for (link, link_boards) in &self.boards {
            let (link, link_boards) = (*link, link_boards.clone());
            let buffer = Arc::clone(&self.buffer);
            let run_flag = Arc::clone(&self.readout_running);
            let stats = Arc::clone(&self.readout_stats);
            self.readout_handles.push(
                std::thread::Builder::new()
                    .name(format!("readout-{link}"))
                    .spawn(move || run_readout_loop(link, link_boards, buffer, run_flag, stats))?,
            );
        }
        Ok(())
    }

    fn close_workers(&mut self) {
        // let the workers drain the backlog before waving them off
        while !self.buffer.is_empty()
            && self.worker_handles.iter().any(|h| !h.is_finished())
        {
            std::thread::sleep(std::time::Duration::from_millis(10));
        }
        self.workers_active.store(false, Ordering::Release);
        self.buffer.notify_all();
        spdlog::debug!("Joining processing threads");
        for handle in self.worker_handles.drain(..) {
            let _ = handle.join();
        }
        let mut board_fails: FxHashMap<i32, u64> = FxHashMap::default();
        for stats in self.worker_stats.drain(..) {
            for (board, count) in stats.take_fail_counts() {
                *board_fails.entry(board).or_default() += count;
            }
        }
        if board_fails.values().sum::<u64>() > 0 {
            let mut msg = String::from("Found board failures: ");
            for (board, count) in &board_fails {
                msg.push_str(&format!("{board}:{count} | "));
            }
            spdlog::warn!("{}", msg);
        }
    }
}

fn timeout_error(e: BoardError) -> ControllerError {
    match e {
        BoardError::Timeout { .. } => ControllerError::TimeoutError(e.to_string()),
        other => ControllerError::HardwareError(other),
    }
}

/// Program all boards on one optical link: baselines, user registers,
/// thresholds and DACs. Runs on its own thread during arming.
fn init_link(
    boards: &[Arc<Mutex<Board>>],
    options: &Options,
    baseline_mode: &str,
    baseline_opts: &BaselineOptions,
    dac_table: &Mutex<DacTable>,
) -> Result<(), LinkInitError> {
    for entry in boards {
        let mut board = entry.lock().unwrap();
        let bid = board.bid();
        let n_chan = board.n_channels();
        spdlog::debug!("Board {} beginning specific init", bid);

        let mode = match baseline_mode {
            "fit" | "cached" | "fixed" => baseline_mode,
            other => {
                spdlog::warn!(
                    "Received unknown baseline mode '{}', valid options are 'fit', 'cached' and 'fixed'",
                    other
                );
                "fixed"
            }
        };
        let fixed_value = options.get_int("baseline_fixed_value", 0x0FA0) as u16;
        let mut cal = options.get_dac(bid, n_chan);
        cal.slope.resize(n_chan, -0.25);
        cal.yint.resize(n_chan, 17000.0);
        let mut dac = vec![fixed_value; n_chan];

        match mode {
            "fit" => {
                let mut converged = false;
                for attempt in 0..5 {
                    match board.configure_baselines(&mut dac, &mut cal, 50, true, baseline_opts) {
                        Ok(BaselineOutcome::Converged) => {
                            converged = true;
                            break;
                        }
                        Ok(BaselineOutcome::DidNotConverge) => {
                            spdlog::warn!("Board {} baselines attempt {} did not converge", bid, attempt);
                        }
                        Err(e) => return Err(LinkInitError::Fatal(e)),
                    }
                }
                if !converged {
                    return Err(LinkInitError::Retryable);
                }
            }
            "cached" => {
                spdlog::debug!("Board {} using cached baselines", bid);
                match board.configure_baselines(&mut dac, &mut cal, 1, false, baseline_opts) {
                    Ok(_) => (),
                    Err(e) => return Err(LinkInitError::Fatal(e)),
                }
            }
            _ => {
                spdlog::debug!("Loading fixed baselines with value 0x{:04X}", fixed_value);
                dac.fill(fixed_value);
            }
        }

        // Overwrite specified registers lastly to force settings
        let registers = options
            .get_registers(bid)
            .map_err(|_| LinkInitError::Retryable)?;
        for setting in registers {
            if board.write_register(setting.reg, setting.val).is_err() {
                spdlog::warn!("Failed to configure digitizers.");
                return Err(LinkInitError::Retryable);
            }
        }
        let thresholds = options.get_thresholds(bid, n_chan);
        if board.set_thresholds(&thresholds).is_err() {
            return Err(LinkInitError::Retryable);
        }
        if board.load_dac(&dac, 0xFFFF).is_err() {
            return Err(LinkInitError::Retryable);
        }
        dac_table.lock().unwrap().insert(bid, cal);
        spdlog::debug!("Board {} programmed", bid);
    }
    Ok(())
}
