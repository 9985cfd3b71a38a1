//! Infrastructure layer: job storage, acquisition, dispatch, retries, the
//! external worker protocol and the background executor.

pub mod config;
pub mod jobs;
pub mod workers;


pub use config::{ConfigError, EngineConfig};
