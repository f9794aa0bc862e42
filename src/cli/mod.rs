//! Command implementations for the flowgate binary
//!
//! - `simulate`: drive synthetic work through a gatekeeper and report stats
//! - `config`: print the effective configuration
//!
//! ```bash
//! flowgate simulate --requests 500 --workers 16 --failure-rate 0.1
//! flowgate --config flowgate.yaml config
//! ```

pub mod commands;

pub use commands::{cmd_config, cmd_simulate, SimulateOptions, SyntheticWork};
