//! manubuild - incremental build and caching engine for reproducible documents
//!
//! Rules turn input files into output files. Each rule's outputs are cached
//! under a key derived from its specification and the content of its inputs,
//! in a local directory and optionally a remote archive, so that only rules
//! whose inputs changed are ever run again.

pub mod cache;
pub mod cli;
pub mod config;
pub mod dataset;
pub mod engine;
pub mod error;
pub mod graph;
pub mod ui;

pub use error::{ManuError, ManuResult};
