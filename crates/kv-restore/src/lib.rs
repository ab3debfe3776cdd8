pub mod chunks;
pub mod config;
pub mod decode;
pub mod driver;
pub mod engine;
pub mod error;
pub mod events;
pub mod export;
pub mod kv;
pub mod lease;
pub mod logging;
pub mod sanitize;
pub mod snapshot;
pub mod task;

pub use error::{Error, ErrorKind, Result};
