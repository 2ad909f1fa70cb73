//! Library crate for net-discovery-rs exposing the discovery engine modules.
pub mod config;
pub mod error;
pub mod governor;
pub mod netdetect;
pub mod orchestrator;
pub mod ports;
pub mod probe;
pub mod progress;
pub mod publisher;
pub mod scanner;
pub mod server;
pub mod targets;
pub mod types;
