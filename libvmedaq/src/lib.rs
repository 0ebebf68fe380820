//! # libvmedaq
//!
//! libvmedaq is the readout core of a DAQ for VME waveform digitizers. It
//! drives a fleet of CAEN V1724-family boards across multiple optical links
//! through an arm/start/stop lifecycle, continuously drains their FIFOs, and
//! reformats the raw event stream into time-chunked, compressed fragment
//! files laid out for downstream strax-style processing.
//!
//! The pipeline is
//!
//! ```text
//! boards -> readout loop -> raw buffer -> formatter workers
//!        -> chunker -> compressor -> writer -> filesystem
//! ```
//!
//! with one readout thread per optical link and a configurable number of
//! formatter workers per host. Every worker writes its own file per chunk, so
//! consumers reconstruct a `(chunk, worker)` grid; the writer guarantees the
//! grid has no holes and that files appear atomically.
//!
//! ## Output layout
//!
//! ```text
//! <strax_output_path>/<run_name>/
//!   000042/<hostname>_<worker>        one compressed file per worker
//!   000042_post/<hostname>_<worker>   trailing overlap fragments
//!   000042_pre/<hostname>_<worker>    previous chunk's overlap, same bytes
//!   THE_END/<hostname>_<worker>       end-of-run sentinel
//! ```
//!
//! ## Hardware access
//!
//! Boards are driven through the [`board::VmeBus`] trait. The crate ships
//! [`sim::SimBus`], an in-process board simulator, so the full pipeline runs
//! (and is tested) without an optical link; a production deployment provides
//! a `VmeBus` backed by the vendor VME library via [`controller::BusFactory`].

pub mod baseline;
pub mod board;
pub mod buffer;
pub mod chunker;
pub mod compressor;
pub mod constants;
pub mod controller;
pub mod error;
pub mod formatter;
pub mod fragment;
pub mod models;
pub mod options;
pub mod readout;
pub mod sim;
pub mod status;
pub mod writer;
