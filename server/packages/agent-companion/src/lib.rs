//! Companion service for coding-agent CLIs.

pub mod cli;
pub mod config;
pub mod launcher;
pub mod logging;
pub mod process;
pub mod protocol;
pub mod rate_limits;
pub mod registry;
pub mod router;
pub mod terminal;
pub mod usage;
pub mod ws_bridge;
