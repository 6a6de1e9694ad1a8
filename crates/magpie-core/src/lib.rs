pub mod checksum;
pub mod config;
mod error;
mod types;

pub use error::{MagpieError, Result};
pub use types::*;
