pub mod config;
pub mod error;
pub mod executor;
pub mod manifest;
pub mod modules;
pub mod native;
pub mod output;
pub mod planner;
pub mod vendor;
pub mod workspace;

pub use error::{Error, ErrorKind, Result};
