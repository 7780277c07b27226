//! Default values and constants for all configuration settings.
//!
//! Contains all `DEFAULT_*` constants and the `ConfigFile::default()`
//! implementation.

use super::settings::*;

// =============================================================================
// Manager
// =============================================================================

/// Deadline of a bind/unbind/destroy operation.
pub const DEFAULT_OPERATION_DEADLINE_SECS: u64 = 30;

/// Channel operations executing concurrently.
pub const DEFAULT_EXECUTOR_WORKERS: usize = 16;

pub const DEFAULT_STORE_RETRY_ATTEMPTS: usize = 5;

pub const DEFAULT_STORE_RETRY_BACKOFF_MS: u64 = 10;

pub const DEFAULT_START_TRANSFER_ATTEMPTS: usize = 3;

// =============================================================================
// Slots
// =============================================================================

/// 2 MiB transfer chunks.
pub const DEFAULT_CHUNK_SIZE: usize = 2 * 1024 * 1024;

pub const DEFAULT_READ_JOIN_GRACE_MS: u64 = 100;

pub const DEFAULT_MAX_FAILOVERS: usize = 64;

pub const DEFAULT_RPC_INITIAL_BACKOFF_MS: u64 = 50;

pub const DEFAULT_RPC_MAX_BACKOFF_MS: u64 = 5_000;

pub const DEFAULT_OPERATION_POLL_TIMEOUT_MS: u64 = 1_000;

// =============================================================================
// Logging
// =============================================================================

pub const DEFAULT_LOG_FILE: &str = "slotlink.log";

impl Default for ManagerSettings {
    fn default() -> Self {
        Self {
            operation_deadline_secs: DEFAULT_OPERATION_DEADLINE_SECS,
            executor_workers: DEFAULT_EXECUTOR_WORKERS,
            store_retry_attempts: DEFAULT_STORE_RETRY_ATTEMPTS,
            store_retry_backoff_ms: DEFAULT_STORE_RETRY_BACKOFF_MS,
            start_transfer_attempts: DEFAULT_START_TRANSFER_ATTEMPTS,
        }
    }
}

impl Default for SlotSettings {
    fn default() -> Self {
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
            read_join_grace_ms: DEFAULT_READ_JOIN_GRACE_MS,
            max_failovers: DEFAULT_MAX_FAILOVERS,
            rpc_initial_backoff_ms: DEFAULT_RPC_INITIAL_BACKOFF_MS,
            rpc_max_backoff_ms: DEFAULT_RPC_MAX_BACKOFF_MS,
            operation_poll_timeout_ms: DEFAULT_OPERATION_POLL_TIMEOUT_MS,
        }
    }
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            directory: super::file::config_directory().join("logs"),
            file: DEFAULT_LOG_FILE.to_string(),
        }
    }
}

impl Default for ConfigFile {
    fn default() -> Self {
        Self {
            manager: ManagerSettings::default(),
            slots: SlotSettings::default(),
            logging: LoggingSettings::default(),
        }
    }
}
