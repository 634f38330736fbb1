pub mod config;
pub mod core;
pub mod error;
pub mod git;
pub mod log;
pub mod state;
pub mod util;
pub mod workspace;

// Scheduler, workers and the tool driver
pub mod orchestration;

pub use config::Config;
pub use error::{Error, Result};
pub use state::TaskStore;
