// Library root: the emissions cache and job subsystem. The binary in
// `src/main.rs` is a thin CLI over `service::CarbonMetrics`.

pub mod cache;
pub mod config;
pub mod content;
pub mod db;
pub mod error;
pub mod facade;
pub mod format;
pub mod hooks;
pub mod jobs;
pub mod measurement;
pub mod metrics;
pub mod service;
pub mod stats;
pub mod store;

// Only needed by the binary, but declared pub so integration tests can
// reach them.
pub mod cli;
pub mod logging;

pub use service::CarbonMetrics;
