pub mod checkpoint;
pub mod config;
pub mod error;
pub mod executor;
pub mod host;
pub mod probe;
pub mod steps;

pub use error::{Error, Result};
