//! INI serialization logic for converting `ConfigFile` → INI string.
//!
//! This module contains the `to_config_string()` function that produces
//! the commented INI representation written to `config.ini`.

use std::path::Path;

use super::settings::ConfigFile;
use super::size::format_size;

/// Convert a `ConfigFile` to a commented INI string for saving.
pub(super) fn to_config_string(config: &ConfigFile) -> String {
    let manager = &config.manager;
    let slots = &config.slots;

    format!(
        r#"[manager]
; Seconds before a pending bind/unbind/destroy operation fails with DEADLINE_EXCEEDED
operation_deadline_secs = {}
; Channel operations executing at the same time
executor_workers = {}
; Attempts for a storage transaction that fails transiently
store_retry_attempts = {}
; First backoff between storage attempts (milliseconds, doubles per attempt)
store_retry_backoff_ms = {}
; Attempts to push a resolved peer to a waiting consumer slot
start_transfer_attempts = {}

[slots]
; Largest chunk moved per transfer step (e.g. 2MB, 512KB)
chunk_size = {}
; How long close() waits for in-flight reads before aborting them (milliseconds)
read_join_grace_ms = {}
; Failovers an input slot may perform before giving up
max_failovers = {}
; Backoff bounds for retried RPCs (milliseconds)
rpc_initial_backoff_ms = {}
rpc_max_backoff_ms = {}
; Slice used while awaiting a long-running operation (milliseconds)
operation_poll_timeout_ms = {}

[logging]
; Log directory (default: ~/.slotlink/logs)
directory = {}
; Log file name
file = {}
"#,
        manager.operation_deadline_secs,
        manager.executor_workers,
        manager.store_retry_attempts,
        manager.store_retry_backoff_ms,
        manager.start_transfer_attempts,
        format_size(slots.chunk_size),
        slots.read_join_grace_ms,
        slots.max_failovers,
        slots.rpc_initial_backoff_ms,
        slots.rpc_max_backoff_ms,
        slots.operation_poll_timeout_ms,
        path_to_string(&config.logging.directory),
        config.logging.file,
    )
}

/// Render a path, collapsing the home directory back to `~`.
fn path_to_string(path: &Path) -> String {
    if let Some(home) = dirs::home_dir() {
        if let Ok(stripped) = path.strip_prefix(&home) {
            return format!("~/{}", stripped.display());
        }
    }
    path.display().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use ini::Ini;

    #[test]
    fn test_written_config_parses_back() {
        let mut config = ConfigFile::default();
        config.manager.executor_workers = 3;
        config.slots.chunk_size = 64 * 1024;

        let text = to_config_string(&config);
        let ini = Ini::load_from_str(&text).unwrap();
        let parsed = super::super::parser::parse_ini(&ini).unwrap();

        assert_eq!(parsed.manager.executor_workers, 3);
        assert_eq!(parsed.slots.chunk_size, 64 * 1024);
        assert_eq!(parsed.logging.file, config.logging.file);
    }

    #[test]
    fn test_chunk_size_written_human_readable() {
        let text = to_config_string(&ConfigFile::default());
        assert!(text.contains("chunk_size = 2MB"));
    }
}
