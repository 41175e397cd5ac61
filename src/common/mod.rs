pub mod config;
pub mod crypto;
pub mod error;

pub use config::*;
pub use error::*;
