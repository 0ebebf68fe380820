//! The 1 Hz status stream.
//!
//! Counters are snapshot-and-reset, so each document carries the bytes seen
//! since the previous one and a consumer can derive rates by dividing by the
//! publish interval.

use std::collections::BTreeMap;
use std::io::Write;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;

use serde::Serialize;

use crate::controller::{Controller, Status};

#[derive(Debug, Serialize)]
pub struct StatusUpdate {
    pub host: String,
    pub time: chrono::DateTime<chrono::Utc>,
    pub status: Status,
    /// Bytes read off the boards since the last update.
    pub bytes_read: u64,
    /// Raw packets waiting plus fragments not yet written.
    pub buffer_bytes: u64,
    pub boards: BTreeMap<i32, u64>,
    pub channels_kb: BTreeMap<i16, u64>,
    pub mode: String,
    pub number: i32,
}

/// Publish one status document per second as a JSON line until `active`
/// goes false.
pub fn spawn_status_updater(
    controller: Arc<Mutex<Controller>>,
    path: PathBuf,
    active: Arc<AtomicBool>,
) -> JoinHandle<()> {
    std::thread::spawn(move || {
        while active.load(Ordering::Acquire) {
            let update = controller.lock().unwrap().status_snapshot();
            if let Err(e) = append_json_line(&path, &update) {
                spdlog::warn!("Could not publish status to {:?}: {}", path, e);
            }
            std::thread::sleep(std::time::Duration::from_secs(1));
        }
        spdlog::debug!("Status update returning");
    })
}

fn append_json_line(path: &PathBuf, update: &StatusUpdate) -> std::io::Result<()> {
    let mut file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)?;
    let line = serde_json::to_string(update)?;
    writeln!(file, "{line}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_serializes_to_one_json_line() {
        let update = StatusUpdate {
            host: "reader0".into(),
            time: chrono::Utc::now(),
            status: Status::Running,
            bytes_read: 1024,
            buffer_bytes: 0,
            boards: BTreeMap::from([(100, 1024)]),
            channels_kb: BTreeMap::from([(4, 1)]),
            mode: "background".into(),
            number: 7,
        };
        let line = serde_json::to_string(&update).unwrap();
        assert!(!line.contains('\n'));
        assert!(line.contains("\"status\":\"Running\""));
        assert!(line.contains("\"bytes_read\":1024"));
    }
}
