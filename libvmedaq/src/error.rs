use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum OptionsError {
    #[error("Could not load options because file {0:?} does not exist")]
    BadFilePath(PathBuf),
    #[error("Options failed due to IO error: {0}")]
    IOError(#[from] std::io::Error),
    #[error("Options failed to parse YAML: {0}")]
    ParsingError(#[from] serde_yaml::Error),
    #[error("Board list entry is malformed: {0}")]
    BadBoardEntry(String),
    #[error("Register entry is malformed: {0}")]
    BadRegisterEntry(String),
    #[error("Unknown board type {0}")]
    UnknownBoardType(String),
}

#[derive(Debug, Error)]
pub enum BoardError {
    #[error("VME bus failure on board {board}: {message}")]
    Bus { board: i32, message: String },
    #[error("Board {board} read back the error pattern from register 0x{register:04X}")]
    BadRead { board: i32, register: u32 },
    #[error("Board {board} timed out polling register 0x{register:04X} for mask 0x{mask:X}")]
    Timeout { board: i32, register: u32, mask: u32 },
    #[error("Board {board} block read failed: {message}")]
    BlockRead { board: i32, message: String },
}

#[derive(Debug, Error)]
pub enum CompressorError {
    #[error("Unknown compressor {0}; valid options are blosc, lz4, none and delete")]
    UnknownCompressor(String),
    #[error("blosc refused the input buffer")]
    BloscError,
    #[error("LZ4 frame compression failed: {0}")]
    Lz4Error(#[from] lz4_flex::frame::Error),
    #[error("Compressor failed due to IO error: {0}")]
    IOError(#[from] std::io::Error),
}

#[derive(Debug, Error)]
pub enum WriterError {
    #[error("Writer failed due to IO error: {0}")]
    IOError(#[from] std::io::Error),
    #[error("Could not create output directory {0:?}; check that you have write permission here")]
    BadOutputPath(PathBuf),
}

#[derive(Debug, Error)]
pub enum FormatterError {
    #[error("No channel map entry for board {board} channel {channel}")]
    UnmappedChannel { board: i32, channel: usize },
    #[error("Formatter failed due to Writer error: {0}")]
    WriterError(#[from] WriterError),
    #[error("Formatter failed due to Compressor error: {0}")]
    CompressorError(#[from] CompressorError),
    #[error("Formatter failed due to IO error: {0}")]
    IOError(#[from] std::io::Error),
}

/// Top-level error for the controller entry points.
///
/// The variants map onto the operator-facing failure classes: configuration
/// problems are recoverable by fixing the run mode, hardware problems usually
/// by power-cycling the affected crate, timeouts often by just trying again.
#[derive(Debug, Error)]
pub enum ControllerError {
    #[error("Controller failed due to Options error: {0}")]
    ConfigError(#[from] OptionsError),
    #[error("Controller failed due to Board error: {0}")]
    HardwareError(#[from] BoardError),
    #[error("Timed out waiting for boards: {0}")]
    TimeoutError(String),
    #[error("Digitizer programming failed on link {0}")]
    LinkInitError(i32),
    #[error("No run mode loaded; arm first")]
    NotArmed,
    #[error("Controller failed due to Formatter error: {0}")]
    FormatterError(#[from] FormatterError),
    #[error("Controller failed due to IO error: {0}")]
    IOError(#[from] std::io::Error),
}
