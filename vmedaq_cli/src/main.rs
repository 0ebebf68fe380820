//! # vmedaq_cli
//!
//! The readout daemon. Parses the instance flags, sets up file logging, and
//! drives a [`Controller`] from simple line commands on stdin:
//!
//! ```text
//! arm <run_mode.yaml>   load a run mode and arm the boards
//! start                 begin acquisition
//! stop                  stop acquisition and close out the run
//! status                print the current state
//! quit                  stop everything and exit
//! ```
//!
//! The control-plane poller that feeds these commands from the experiment
//! database lives in a separate service; this binary only consumes them.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use clap::{Arg, ArgAction, Command};

use libvmedaq::controller::{BusFactory, Controller};
use libvmedaq::options::Options;
use libvmedaq::sim::SimBus;
use libvmedaq::status::spawn_status_updater;

struct Instance {
    id: String,
    uri: String,
    db: String,
    logdir: PathBuf,
    reader: bool,
    arm_delay_ms: u64,
    log_retention_days: u64,
}

fn parse_args() -> Result<Instance, i32> {
    let command = Command::new("vmedaq")
        .about("VME digitizer readout")
        .arg(
            Arg::new("id")
                .long("id")
                .help("id number of this readout instance")
                .required(true),
        )
        .arg(
            Arg::new("uri")
                .long("uri")
                .help("control database URI")
                .required(true),
        )
        .arg(Arg::new("db").long("db").default_value("daq"))
        .arg(Arg::new("logdir").long("logdir").default_value("."))
        .arg(Arg::new("reader").long("reader").action(ArgAction::SetTrue))
        .arg(Arg::new("cc").long("cc").action(ArgAction::SetTrue))
        .arg(
            Arg::new("arm-delay")
                .long("arm-delay")
                .default_value("15000")
                .value_parser(clap::value_parser!(u64)),
        )
        .arg(
            Arg::new("log-retention")
                .long("log-retention")
                .default_value("7")
                .value_parser(clap::value_parser!(u64)),
        );
    let matches = match command.try_get_matches() {
        Ok(m) => m,
        Err(e) if e.kind() == clap::error::ErrorKind::DisplayHelp => {
            print!("{e}");
            return Err(0);
        }
        Err(e) => {
            eprintln!("{e}");
            return Err(1);
        }
    };
    let reader = matches.get_flag("reader");
    let cc = matches.get_flag("cc");
    if reader == cc {
        eprintln!("Specify --reader XOR --cc");
        return Err(1);
    }
    Ok(Instance {
        id: matches.get_one::<String>("id").unwrap().clone(),
        uri: matches.get_one::<String>("uri").unwrap().clone(),
        db: matches.get_one::<String>("db").unwrap().clone(),
        logdir: PathBuf::from(matches.get_one::<String>("logdir").unwrap()),
        reader,
        arm_delay_ms: *matches.get_one::<u64>("arm-delay").unwrap(),
        log_retention_days: *matches.get_one::<u64>("log-retention").unwrap(),
    })
}

fn setup_logging(logdir: &Path, host: &str) -> Result<(), Box<dyn std::error::Error>> {
    std::fs::create_dir_all(logdir)?;
    let path = logdir.join(format!("{host}.log"));
    let file_sink = Arc::new(spdlog::sink::FileSink::builder().path(&path).build()?);
    let mut sinks = spdlog::default_logger().sinks().to_vec();
    sinks.push(file_sink);
    let logger = Arc::new(
        spdlog::Logger::builder()
            .sinks(sinks)
            .level_filter(spdlog::LevelFilter::MoreSevereEqual(spdlog::Level::Debug))
            .build()?,
    );
    spdlog::set_default_logger(logger);
    Ok(())
}

/// Drop log files older than the retention window.
fn prune_logs(logdir: &Path, retention_days: u64) {
    let cutoff =
        std::time::SystemTime::now() - std::time::Duration::from_secs(retention_days * 24 * 3600);
    let Ok(entries) = std::fs::read_dir(logdir) else {
        return;
    };
    for entry in entries.flatten() {
        let path = entry.path();
        if path.extension().is_some_and(|e| e == "log") {
            if let Ok(modified) = entry.metadata().and_then(|m| m.modified()) {
                if modified < cutoff {
                    spdlog::info!("Pruning old log {:?}", path);
                    let _ = std::fs::remove_file(path);
                }
            }
        }
    }
}

fn main() {
    let instance = match parse_args() {
        Ok(i) => i,
        Err(code) => std::process::exit(code),
    };

    let host = hostname::get()
        .map(|h| h.to_string_lossy().into_owned())
        .unwrap_or_else(|_| "localhost".to_string());
    let host_id = format!(
        "{host}_{}_{}",
        if instance.reader { "reader" } else { "controller" },
        instance.id
    );
    if let Err(e) = setup_logging(&instance.logdir, &host_id) {
        eprintln!("Could not set up logging: {e}");
        std::process::exit(1);
    }
    prune_logs(&instance.logdir, instance.log_retention_days);
    spdlog::info!("Readout starting with ID: (hostname+id) {}", host_id);
    spdlog::info!("Control database: {} / {}", instance.uri, instance.db);

    // the bundled transport; a production build plugs the vendor VME
    // library in here
    let factory: BusFactory = Box::new(|descriptor| {
        Ok(Box::new(SimBus::new(descriptor.model, descriptor.board_id))
            as Box<dyn libvmedaq::board::VmeBus>)
    });
    let controller = Arc::new(Mutex::new(Controller::new(&host_id, factory)));

    let updater_active = Arc::new(AtomicBool::new(true));
    let status_path = instance.logdir.join(format!("{host_id}_status.jsonl"));
    let updater = spawn_status_updater(
        Arc::clone(&controller),
        status_path,
        Arc::clone(&updater_active),
    );

    let stdin = std::io::stdin();
    let mut line = String::new();
    let exit_code = loop {
        line.clear();
        match stdin.read_line(&mut line) {
            Ok(0) => break 0,
            Ok(_) => (),
            Err(e) => {
                spdlog::error!("stdin error: {}", e);
                break 1;
            }
        }
        let mut parts = line.split_whitespace();
        match parts.next() {
            Some("arm") => {
                let Some(path) = parts.next() else {
                    spdlog::warn!("arm needs a run mode file");
                    continue;
                };
                std::thread::sleep(std::time::Duration::from_millis(instance.arm_delay_ms));
                match Options::from_file(Path::new(path), &host_id) {
                    Ok(options) => {
                        let result = controller.lock().unwrap().arm(Arc::new(options));
                        match result {
                            Ok(()) => spdlog::info!("Armed"),
                            Err(e) => spdlog::error!("Arm failed: {}", e),
                        }
                    }
                    Err(e) => spdlog::error!("Could not load run mode: {}", e),
                }
            }
            Some("start") => match controller.lock().unwrap().start() {
                Ok(()) => spdlog::info!("Running"),
                Err(e) => spdlog::error!("Start failed: {}", e),
            },
            Some("stop") => match controller.lock().unwrap().stop() {
                Ok(()) => spdlog::info!("Stopped"),
                Err(e) => spdlog::error!("Stop failed: {}", e),
            },
            Some("status") => {
                let mut ctl = controller.lock().unwrap();
                if ctl.check_errors() {
                    spdlog::warn!("A processing thread reported an error");
                }
                println!("{:?}", ctl.status());
            }
            Some("quit") | Some("exit") => break 0,
            Some(other) => spdlog::warn!("Unknown command {}", other),
            None => (),
        }
        if controller.lock().unwrap().check_errors() {
            spdlog::warn!("DAQ is in error state; stop and re-arm to recover");
        }
    };

    if let Err(e) = controller.lock().unwrap().end() {
        spdlog::error!("Teardown failed: {}", e);
    }
    updater_active.store(false, Ordering::Release);
    let _ = updater.join();
    spdlog::info!("Exiting");
    std::process::exit(exit_code);
}
