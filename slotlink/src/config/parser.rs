//! INI parsing logic for converting `Ini` → `ConfigFile`.
//!
//! This module contains the `parse_ini()` function and its helpers.
//! It is the single place where INI key names are mapped to struct fields.

use ini::Ini;
use std::path::PathBuf;
use std::str::FromStr;

use super::file::ConfigFileError;
use super::settings::ConfigFile;
use super::size::parse_size;

/// Parse an `Ini` object into a `ConfigFile`.
///
/// Starts from `ConfigFile::default()` and overlays any values found in the INI.
pub(super) fn parse_ini(ini: &Ini) -> Result<ConfigFile, ConfigFileError> {
    let mut config = ConfigFile::default();

    // [manager] section
    if let Some(section) = ini.section(Some("manager")) {
        if let Some(v) = section.get("operation_deadline_secs") {
            config.manager.operation_deadline_secs =
                parse_positive("manager", "operation_deadline_secs", v, "seconds")?;
        }
        if let Some(v) = section.get("executor_workers") {
            config.manager.executor_workers =
                parse_positive("manager", "executor_workers", v, "workers")?;
        }
        if let Some(v) = section.get("store_retry_attempts") {
            config.manager.store_retry_attempts =
                parse_positive("manager", "store_retry_attempts", v, "attempts")?;
        }
        if let Some(v) = section.get("store_retry_backoff_ms") {
            config.manager.store_retry_backoff_ms =
                parse_positive("manager", "store_retry_backoff_ms", v, "milliseconds")?;
        }
        if let Some(v) = section.get("start_transfer_attempts") {
            config.manager.start_transfer_attempts =
                parse_positive("manager", "start_transfer_attempts", v, "attempts")?;
        }
    }

    // [slots] section
    if let Some(section) = ini.section(Some("slots")) {
        if let Some(v) = section.get("chunk_size") {
            let size = parse_size(v).map_err(|_| ConfigFileError::InvalidValue {
                section: "slots".to_string(),
                key: "chunk_size".to_string(),
                value: v.to_string(),
                reason: "expected format like '2MB', '512KB', or '65536'".to_string(),
            })?;
            if size == 0 {
                return Err(ConfigFileError::InvalidValue {
                    section: "slots".to_string(),
                    key: "chunk_size".to_string(),
                    value: v.to_string(),
                    reason: "must be greater than zero".to_string(),
                });
            }
            config.slots.chunk_size = size;
        }
        if let Some(v) = section.get("read_join_grace_ms") {
            config.slots.read_join_grace_ms =
                parse_positive("slots", "read_join_grace_ms", v, "milliseconds")?;
        }
        if let Some(v) = section.get("max_failovers") {
            config.slots.max_failovers = parse_positive("slots", "max_failovers", v, "failovers")?;
        }
        if let Some(v) = section.get("rpc_initial_backoff_ms") {
            config.slots.rpc_initial_backoff_ms =
                parse_positive("slots", "rpc_initial_backoff_ms", v, "milliseconds")?;
        }
        if let Some(v) = section.get("rpc_max_backoff_ms") {
            config.slots.rpc_max_backoff_ms =
                parse_positive("slots", "rpc_max_backoff_ms", v, "milliseconds")?;
        }
        if let Some(v) = section.get("operation_poll_timeout_ms") {
            config.slots.operation_poll_timeout_ms =
                parse_positive("slots", "operation_poll_timeout_ms", v, "milliseconds")?;
        }
        if config.slots.rpc_max_backoff_ms < config.slots.rpc_initial_backoff_ms {
            return Err(ConfigFileError::InvalidValue {
                section: "slots".to_string(),
                key: "rpc_max_backoff_ms".to_string(),
                value: config.slots.rpc_max_backoff_ms.to_string(),
                reason: "must not be smaller than rpc_initial_backoff_ms".to_string(),
            });
        }
    }

    // [logging] section
    if let Some(section) = ini.section(Some("logging")) {
        if let Some(v) = section.get("directory") {
            let v = v.trim();
            if !v.is_empty() {
                config.logging.directory = expand_tilde(v);
            }
        }
        if let Some(v) = section.get("file") {
            let v = v.trim();
            if !v.is_empty() {
                config.logging.file = v.to_string();
            }
        }
    }

    Ok(config)
}

/// Parse a strictly positive integer.
fn parse_positive<T>(section: &str, key: &str, value: &str, unit: &str) -> Result<T, ConfigFileError>
where
    T: FromStr + PartialOrd + Default,
{
    let invalid = || ConfigFileError::InvalidValue {
        section: section.to_string(),
        key: key.to_string(),
        value: value.to_string(),
        reason: format!("must be a positive integer ({})", unit),
    };
    let parsed: T = value.trim().parse().map_err(|_| invalid())?;
    if parsed <= T::default() {
        return Err(invalid());
    }
    Ok(parsed)
}

/// Expand ~ to home directory in paths.
pub(super) fn expand_tilde(path: &str) -> PathBuf {
    if let Some(stripped) = path.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(stripped);
        }
    }
    PathBuf::from(path)
}
