pub mod config;
pub mod network;
pub mod orchestrator;
pub mod ports;
pub mod protocol;
pub mod provision;
pub mod scheduler;
pub mod secrets;
pub mod supervisor;
pub mod synth;
pub mod utils;

pub use config::AppConfig;
pub use orchestrator::{Orchestrator, RunOutcome};
pub use utils::{BootstrapError, Result};
