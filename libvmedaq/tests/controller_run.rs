//! Full-lifecycle tests against simulated boards.

use std::sync::Arc;

use libvmedaq::controller::{BusFactory, Controller, Status};
use libvmedaq::options::Options;
use libvmedaq::sim::SimBus;

fn sim_factory() -> BusFactory {
    Box::new(|descriptor| {
        Ok(Box::new(SimBus::new(descriptor.model, descriptor.board_id))
            as Box<dyn libvmedaq::board::VmeBus>)
    })
}

fn run_mode(output: &std::path::Path, extra: &str) -> Arc<Options> {
    let yaml = format!(
        r#"
number: 42
name: sim_test
compressor: none
strax_output_path: "{}"
processing_threads:
  tester: 1
boards:
  - {{type: V1724, link: 0, crate: 0, board: 100, vme_address: "80000000", host: tester}}
channels:
  "100": [0, 1, 2, 3, 4, 5, 6, 7]
baseline_dac_settle_ms: 0
baseline_ms_between_triggers: 0
{extra}
"#,
        output.display()
    );
    Arc::new(Options::from_value(
        serde_yaml::from_str(&yaml).unwrap(),
        "tester",
    ))
}

#[test]
fn lifecycle_produces_chunk_files() {
    let dir = tempfile::tempdir().unwrap();
    let mut controller = Controller::new("tester", sim_factory());
    assert_eq!(controller.status(), Status::Idle);

    controller.arm(run_mode(dir.path(), "")).unwrap();
    assert_eq!(controller.status(), Status::Armed);

    controller.start().unwrap();
    assert_eq!(controller.status(), Status::Running);
    std::thread::sleep(std::time::Duration::from_millis(300));

    let update = controller.status_snapshot();
    assert!(update.bytes_read > 0, "readout should have moved data");
    assert_eq!(update.number, 42);

    assert!(!controller.check_errors());
    controller.stop().unwrap();
    assert_eq!(controller.status(), Status::Idle);

    let run_dir = dir.path().join("000042");
    assert!(run_dir.join("000000/tester_1").exists());
    assert!(run_dir.join("THE_END/tester_1").exists());
    let bytes = std::fs::read(run_dir.join("000000/tester_1")).unwrap();
    assert!(!bytes.is_empty());

    controller.end().unwrap();
}

#[test]
fn fit_baselines_during_arm() {
    let dir = tempfile::tempdir().unwrap();
    let dac_file = dir.path().join("dac.yaml");
    let extra = format!(
        "baseline_dac_mode: fit\ndac_calibration_file: \"{}\"\n",
        dac_file.display()
    );
    let mut controller = Controller::new("tester", sim_factory());
    controller.arm(run_mode(dir.path(), &extra)).unwrap();
    assert_eq!(controller.status(), Status::Armed);
    controller.stop().unwrap();

    // the fitted calibration was persisted for the next run
    let table: libvmedaq::options::DacTable =
        serde_yaml::from_str(&std::fs::read_to_string(&dac_file).unwrap()).unwrap();
    let row = table.get(&100).expect("board 100 calibrated");
    for ch in 0..8 {
        // simulated response slope is -0.25 ADC per DAC count
        assert!((row.slope[ch] + 0.25).abs() < 0.05, "slope {}", row.slope[ch]);
    }
}

#[test]
fn start_without_arm_is_refused() {
    let mut controller = Controller::new("tester", sim_factory());
    assert!(controller.start().is_err());
    assert_eq!(controller.status(), Status::Idle);
}
