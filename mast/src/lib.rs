//! MAST unit application layer
//!
//! Configuration loading, logging bootstrap and the command registry shared
//! by the `mast-unit` console and the `mast-solver-sim` worker binaries.

pub mod commands;
pub mod config;
pub mod logging;

pub use commands::{CommandError, CommandInfo, CommandRegistry};
pub use config::{ConfigError, LoggingConfig, MastConfig, SimulationConfig};
