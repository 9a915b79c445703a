//! rawmon library crate.
//!
//! Watches instrument output folders and drives each raw acquisition through
//! conversion, upload and job scheduling. The binary wires the concrete clients;
//! everything here is exposed for integration testing.

pub mod clients;
pub mod config;
pub mod domain;
pub mod error;
pub mod logging;
pub mod pipeline;
pub mod queue;
pub mod utils;
pub mod watch;

pub use error::{Error, Result, SchedulingError};
