pub mod command;
pub mod crypto;
pub mod error;

pub use command::{argv, CommandOutput, CommandRunner, SystemRunner};
pub use crypto::{generate_short_id, verify_reality_keypair};
pub use error::{BootstrapError, Result};
