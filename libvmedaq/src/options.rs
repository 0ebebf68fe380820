//! Keyed, read-only run configuration.
//!
//! A run mode is one YAML document. The getters mirror the way the rest of
//! the crate consumes configuration: flat keys with a caller-supplied
//! default, dotted keys for per-host sections, and a few structured lookups
//! (board list, register list, channel map, DAC calibration table).

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use serde_yaml::Value;

use crate::error::OptionsError;
use crate::models::{BoardDescriptor, BoardModel};

/// One row of the DAC calibration table: the linear response of each
/// channel's ADC baseline to its DAC setting.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CalRow {
    pub slope: Vec<f64>,
    pub yint: Vec<f64>,
}

impl CalRow {
    /// Nominal response of a 14-bit ADC swept across a 16-bit DAC, used when
    /// no calibration has ever been recorded for a board.
    pub fn nominal(n_channels: usize) -> Self {
        CalRow {
            slope: vec![-0.25; n_channels],
            yint: vec![17000.0; n_channels],
        }
    }
}

/// `board_id -> CalRow`, key `-1` is the fallback default.
pub type DacTable = BTreeMap<i32, CalRow>;

#[derive(Debug, Clone)]
pub struct RegisterSetting {
    pub reg: u32,
    pub val: u32,
}

#[derive(Debug)]
pub struct Options {
    doc: Value,
    hostname: String,
    dac_path: Option<PathBuf>,
}

impl Options {
    /// Load a run mode from a YAML file.
    pub fn from_file(path: &Path, hostname: &str) -> Result<Self, OptionsError> {
        if !path.exists() {
            return Err(OptionsError::BadFilePath(path.to_path_buf()));
        }
        let yaml_str = std::fs::read_to_string(path)?;
        let doc = serde_yaml::from_str::<Value>(&yaml_str)?;
        Ok(Self::from_value(doc, hostname))
    }

    pub fn from_value(doc: Value, hostname: &str) -> Self {
        let dac_path = doc
            .get("dac_calibration_file")
            .and_then(Value::as_str)
            .map(PathBuf::from);
        Options {
            doc,
            hostname: hostname.to_string(),
            dac_path,
        }
    }

    pub fn hostname(&self) -> &str {
        &self.hostname
    }

    pub fn get_int(&self, key: &str, default: i32) -> i32 {
        match self.doc.get(key).and_then(Value::as_i64) {
            Some(v) => v as i32,
            None => {
                spdlog::trace!("Using default value for {}", key);
                default
            }
        }
    }

    pub fn get_long(&self, key: &str, default: i64) -> i64 {
        match self.doc.get(key).and_then(Value::as_i64) {
            Some(v) => v,
            // some tools autoconvert big ints to doubles on the way in
            None => match self.doc.get(key).and_then(Value::as_f64) {
                Some(v) => v as i64,
                None => {
                    spdlog::trace!("Using default value for {}", key);
                    default
                }
            },
        }
    }

    pub fn get_double(&self, key: &str, default: f64) -> f64 {
        match self.doc.get(key).and_then(Value::as_f64) {
            Some(v) => v,
            None => {
                spdlog::trace!("Using default value for {}", key);
                default
            }
        }
    }

    pub fn get_string(&self, key: &str, default: &str) -> String {
        match self.doc.get(key).and_then(Value::as_str) {
            Some(v) => v.to_string(),
            None => {
                spdlog::trace!("Using default value for {}", key);
                default.to_string()
            }
        }
    }

    fn lookup_nested(&self, dotted: &str) -> Option<&Value> {
        let mut val = &self.doc;
        for field in dotted.split('.') {
            val = val.get(field)?;
        }
        Some(val)
    }

    pub fn get_nested_int(&self, dotted: &str, default: i32) -> i32 {
        match self.lookup_nested(dotted).and_then(Value::as_i64) {
            Some(v) => v as i32,
            None => {
                spdlog::trace!("Using default value for {}", dotted);
                default
            }
        }
    }

    pub fn get_nested_string(&self, dotted: &str, default: &str) -> String {
        match self.lookup_nested(dotted).and_then(Value::as_str) {
            Some(v) => v.to_string(),
            None => {
                spdlog::trace!("Using default value for {}", dotted);
                default.to_string()
            }
        }
    }

    /// All boards of a given type tag assigned to `host`. Entries without a
    /// host field are assumed to belong to the only host there is.
    pub fn get_boards(&self, type_tag: &str, host: &str) -> Result<Vec<BoardDescriptor>, OptionsError> {
        let accepted = BoardModel::expand_type_tag(type_tag);
        let mut ret = Vec::new();
        let Some(list) = self.doc.get("boards").and_then(Value::as_sequence) else {
            return Ok(ret);
        };
        for entry in list {
            let btype = entry
                .get("type")
                .and_then(Value::as_str)
                .ok_or_else(|| OptionsError::BadBoardEntry(format!("{entry:?}")))?;
            if !accepted.contains(&btype) {
                continue;
            }
            if let Some(h) = entry.get("host").and_then(Value::as_str) {
                if h != host {
                    continue;
                }
            }
            let field = |name: &str| {
                entry
                    .get(name)
                    .and_then(Value::as_i64)
                    .ok_or_else(|| OptionsError::BadBoardEntry(format!("missing {name} in {entry:?}")))
            };
            let vme_address = match entry.get("vme_address").and_then(Value::as_str) {
                Some(s) => u32::from_str_radix(s, 16)
                    .map_err(|_| OptionsError::BadBoardEntry(format!("bad vme_address {s}")))?,
                None => 0,
            };
            ret.push(BoardDescriptor {
                link: field("link")? as i32,
                crate_id: field("crate")? as i32,
                board_id: field("board")? as i32,
                model: btype.parse()?,
                host: host.to_string(),
                vme_address,
            });
        }
        Ok(ret)
    }

    /// User register overrides for one board, plus any entries addressed to
    /// `"all"`. Registers and values are hex strings in the run mode.
    pub fn get_registers(&self, board_id: i32) -> Result<Vec<RegisterSetting>, OptionsError> {
        let mut ret = Vec::new();
        let Some(list) = self.doc.get("registers").and_then(Value::as_sequence) else {
            return Ok(ret);
        };
        for entry in list {
            let applies = match entry.get("board") {
                Some(Value::Number(n)) => n.as_i64() == Some(board_id as i64),
                Some(Value::String(s)) => s == "all",
                _ => {
                    return Err(OptionsError::BadRegisterEntry(format!(
                        "board is neither int nor \"all\": {entry:?}"
                    )))
                }
            };
            if !applies {
                continue;
            }
            let hex = |name: &str| -> Result<u32, OptionsError> {
                let s = entry
                    .get(name)
                    .and_then(Value::as_str)
                    .ok_or_else(|| OptionsError::BadRegisterEntry(format!("{entry:?}")))?;
                u32::from_str_radix(s, 16)
                    .map_err(|_| OptionsError::BadRegisterEntry(format!("bad hex {s}")))
            };
            ret.push(RegisterSetting {
                reg: hex("reg")?,
                val: hex("val")?,
            });
        }
        Ok(ret)
    }

    fn board_section<'a>(&'a self, section: &str, board_id: i32) -> Option<&'a Value> {
        let sec = self.doc.get(section)?;
        sec.get(board_id.to_string())
            .or_else(|| sec.get(Value::from(board_id as i64)))
    }

    /// Global channel number for a board channel, or -1 if unmapped.
    pub fn channel_map(&self, board_id: i32, ch: usize) -> i16 {
        match self
            .board_section("channels", board_id)
            .and_then(Value::as_sequence)
            .and_then(|s| s.get(ch))
            .and_then(Value::as_i64)
        {
            Some(v) => v as i16,
            None => {
                spdlog::error!("Failed to look up board {} ch {}", board_id, ch);
                -1
            }
        }
    }

    /// Trigger thresholds for one board, defaulting to 0xA everywhere.
    pub fn get_thresholds(&self, board_id: i32, n_channels: usize) -> Vec<u16> {
        match self
            .board_section("thresholds", board_id)
            .and_then(Value::as_sequence)
        {
            Some(seq) => seq
                .iter()
                .map(|v| v.as_i64().unwrap_or(0xA) as u16)
                .collect(),
            None => {
                spdlog::trace!("Using default thresholds for {}", board_id);
                vec![0xA; n_channels]
            }
        }
    }

    /// Calibration row for one board: the board's own row, the `-1` fallback
    /// row, or the nominal response if the table has neither.
    pub fn get_dac(&self, board_id: i32, n_channels: usize) -> CalRow {
        let table = self.load_dac_table();
        if let Some(row) = table.get(&board_id).or_else(|| table.get(&-1)) {
            return row.clone();
        }
        spdlog::info!(
            "No cached calibration for board {}, using nominal response",
            board_id
        );
        CalRow::nominal(n_channels)
    }

    fn load_dac_table(&self) -> DacTable {
        if let Some(path) = &self.dac_path {
            if path.exists() {
                match std::fs::read_to_string(path)
                    .map_err(OptionsError::from)
                    .and_then(|s| serde_yaml::from_str::<DacTable>(&s).map_err(OptionsError::from))
                {
                    Ok(table) => return table,
                    Err(e) => spdlog::warn!("Could not load DAC table from {:?}: {}", path, e),
                }
            }
        }
        match self.doc.get("dac_calibration") {
            Some(v) => serde_yaml::from_value(v.clone()).unwrap_or_default(),
            None => DacTable::new(),
        }
    }

    /// Persist an updated calibration table.
    pub fn update_dac(&self, table: &DacTable) -> Result<(), OptionsError> {
        spdlog::debug!("Saving DAC calibration for {} boards", table.len());
        match &self.dac_path {
            Some(path) => {
                std::fs::write(path, serde_yaml::to_string(table)?)?;
                Ok(())
            }
            None => {
                spdlog::info!("No dac_calibration_file configured, not persisting calibration");
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn options(yaml: &str) -> Options {
        Options::from_value(serde_yaml::from_str(yaml).unwrap(), "reader0")
    }

    #[test]
    fn scalar_getters_and_defaults() {
        let opts = options("{number: 42, strax_chunk_length: 5.0, compressor: lz4}");
        assert_eq!(opts.get_int("number", -1), 42);
        assert_eq!(opts.get_int("nope", -1), -1);
        assert_eq!(opts.get_double("strax_chunk_length", 1.0), 5.0);
        assert_eq!(opts.get_string("compressor", "blosc"), "lz4");
        assert_eq!(opts.get_long("number", 0), 42);
    }

    #[test]
    fn nested_lookup() {
        let opts = options("{processing_threads: {reader0: 4}}");
        assert_eq!(opts.get_nested_int("processing_threads.reader0", 8), 4);
        assert_eq!(opts.get_nested_int("processing_threads.reader1", 8), 8);
    }

    #[test]
    fn board_list_filters_type_and_host() {
        let opts = options(
            r#"
boards:
  - {type: V1730, link: 0, crate: 0, board: 100, vme_address: "80000000", host: reader0}
  - {type: V1724, link: 1, crate: 0, board: 101, vme_address: "90000000", host: reader1}
  - {type: V2718, link: 0, crate: 0, board: 999, vme_address: "0"}
"#,
        );
        let boards = opts.get_boards("V17XX", "reader0").unwrap();
        assert_eq!(boards.len(), 1);
        assert_eq!(boards[0].board_id, 100);
        assert_eq!(boards[0].model, BoardModel::V1730);
        assert_eq!(boards[0].vme_address, 0x8000_0000);
    }

    #[test]
    fn registers_include_all_entries() {
        let opts = options(
            r#"
registers:
  - {board: 100, reg: "8020", val: "1F4"}
  - {board: all, reg: "8000", val: "310"}
  - {board: 101, reg: "8024", val: "0"}
"#,
        );
        let regs = opts.get_registers(100).unwrap();
        assert_eq!(regs.len(), 2);
        assert_eq!(regs[0].reg, 0x8020);
        assert_eq!(regs[0].val, 0x1F4);
        assert_eq!(regs[1].reg, 0x8000);
    }

    #[test]
    fn channel_map_missing_is_minus_one() {
        let opts = options("{channels: {\"100\": [4, 5, 6]}}");
        assert_eq!(opts.channel_map(100, 1), 5);
        assert_eq!(opts.channel_map(100, 7), -1);
        assert_eq!(opts.channel_map(200, 0), -1);
    }

    #[test]
    fn dac_table_fallback_row() {
        let opts = options(
            r#"
dac_calibration:
  -1: {slope: [-0.3], yint: [16500.0]}
  100: {slope: [-0.2], yint: [17000.0]}
"#,
        );
        assert_eq!(opts.get_dac(100, 1).slope[0], -0.2);
        assert_eq!(opts.get_dac(123, 1).slope[0], -0.3);
    }
}
