//! Configuration for the channel manager and the slots.
//!
//! Settings come from an INI file (`~/.slotlink/config.ini` by default)
//! with three sections:
//!
//! - `[manager]` - operation deadline, executor width, storage retries
//! - `[slots]` - chunk size, read join window, failover bound, RPC backoff
//! - `[logging]` - log directory and file
//!
//! # Example
//!
//! ```
//! use slotlink::config::ConfigFile;
//!
//! let config = ConfigFile::default();
//! assert_eq!(config.slots.chunk_size, 2 * 1024 * 1024);
//! ```

mod defaults;
mod file;
mod parser;
mod settings;
mod size;
mod writer;

pub use defaults::*;
pub use file::{config_directory, config_file_path, ConfigFileError};
pub use settings::{ConfigFile, LoggingSettings, ManagerSettings, SlotSettings};
pub use size::{format_size, parse_size, SizeParseError};
