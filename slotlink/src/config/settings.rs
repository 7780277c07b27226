//! Settings structs for all configuration sections.
//!
//! Each struct represents one `[section]` of the INI config file.
//! These are pure data types with no parsing or serialization logic.

use std::path::PathBuf;
use std::time::Duration;

use crate::retry::RetryPolicy;

/// Complete configuration loaded from config.ini.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigFile {
    /// Channel manager settings
    pub manager: ManagerSettings,
    /// Slot and transfer settings
    pub slots: SlotSettings,
    /// Logging settings
    pub logging: LoggingSettings,
}

/// Channel manager configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ManagerSettings {
    /// Deadline of every channel operation, in seconds
    pub operation_deadline_secs: u64,
    /// Maximum channel operations executing at once
    pub executor_workers: usize,
    /// Attempts for a storage transaction failing transiently
    pub store_retry_attempts: usize,
    /// First backoff between storage attempts, in milliseconds
    pub store_retry_backoff_ms: u64,
    /// Attempts to push a resolved peer to a waiting consumer slot
    pub start_transfer_attempts: usize,
}

impl ManagerSettings {
    pub fn operation_deadline(&self) -> Duration {
        Duration::from_secs(self.operation_deadline_secs)
    }

    pub fn store_retry_policy(&self) -> RetryPolicy {
        let initial = Duration::from_millis(self.store_retry_backoff_ms);
        RetryPolicy::bounded(self.store_retry_attempts, initial, initial * 16)
    }

    pub fn start_transfer_policy(&self) -> RetryPolicy {
        let initial = Duration::from_millis(self.store_retry_backoff_ms);
        RetryPolicy::bounded(self.start_transfer_attempts, initial, initial * 16)
    }
}

/// Slot configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SlotSettings {
    /// Upper bound of one transferred chunk, in bytes
    pub chunk_size: usize,
    /// How long close() waits for read tasks before aborting them, in milliseconds
    pub read_join_grace_ms: u64,
    /// Failovers an input slot may perform before failing
    pub max_failovers: usize,
    /// First backoff of a retried RPC, in milliseconds
    pub rpc_initial_backoff_ms: u64,
    /// Largest backoff of a retried RPC, in milliseconds
    pub rpc_max_backoff_ms: u64,
    /// Slice used while awaiting a long-running operation, in milliseconds
    pub operation_poll_timeout_ms: u64,
}

impl SlotSettings {
    pub fn read_join_grace(&self) -> Duration {
        Duration::from_millis(self.read_join_grace_ms)
    }

    pub fn operation_poll_timeout(&self) -> Duration {
        Duration::from_millis(self.operation_poll_timeout_ms)
    }

    /// Retries without bound; callers stop it through cancellation.
    pub fn rpc_retry_policy(&self) -> RetryPolicy {
        RetryPolicy::unbounded(
            Duration::from_millis(self.rpc_initial_backoff_ms),
            Duration::from_millis(self.rpc_max_backoff_ms),
        )
    }
}

/// Logging configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoggingSettings {
    /// Log directory
    pub directory: PathBuf,
    /// Log file name inside the directory
    pub file: String,
}
