//! Runner library: configuration, logging setup and the demo scenarios.

pub mod logging;
pub mod scenarios;
pub mod settings;
