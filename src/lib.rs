//! # fitfarm
//!
//! Calibration scan processing for pixel-detector readout. Histogram data streamed by
//! the readout slaves is decoded per endpoint, fitted or forwarded per scan kind,
//! reassembled across mask steps and handed to a publishing sink.
//!
//! Stage wiring (one thread each, fitting fans out to a pool):
//!
//! ```text
//! Endpoint(s) -> fit queue -> worker -> result queue -> Assembler -> publish queue -> Publisher
//! ```

pub mod artifact;
pub mod assembler;
pub mod cli;
pub mod config;
pub mod control;
pub mod fit;
pub mod fragment;
pub mod logging;
pub mod manager;
pub mod net;
pub mod publisher;
pub mod queue;
pub mod registry;
pub mod result;
pub mod scan;
pub mod stats;
pub mod worker;
