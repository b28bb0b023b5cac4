pub mod cli;
pub mod config;
pub mod ebpf;
pub mod error;
pub mod lifecycle;
pub mod output;
#[cfg(unix)]
pub mod signal;

pub use error::{Result, TracekitError};

pub const VERSION: &str = env!("CARGO_PKG_VERSION");
