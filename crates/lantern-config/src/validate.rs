//! Post-merge configuration validation.
//!
//! Validates that deserialized [`Config`](crate::Config) values are within
//! acceptable ranges and that cross-field invariants hold.

use crate::error::{ConfigError, ConfigResult};
use crate::types::Config;

/// Permissions no deployment may grant. Mirrors the runtime deny-list.
const DENIED_PERMISSIONS: &[&str] = &["system.admin", "kernel.access", "security.bypass"];

/// Upper bound on any timeout, in seconds (24 hours).
const MAX_TIMEOUT_SECS: u64 = 86_400;

/// Validate a fully merged and deserialized configuration.
///
/// # Errors
///
/// Returns the first validation error found.
pub fn validate(config: &Config) -> ConfigResult<()> {
    validate_plugins(config)?;
    validate_sandbox(config)?;
    validate_orchestrator(config)?;
    validate_logging(config)?;
    Ok(())
}

fn invalid(field: &str, message: impl Into<String>) -> ConfigError {
    ConfigError::ValidationError {
        field: field.to_owned(),
        message: message.into(),
    }
}

fn check_timeout(field: &str, secs: u64) -> ConfigResult<()> {
    if secs == 0 || secs > MAX_TIMEOUT_SECS {
        return Err(invalid(
            field,
            format!("must be between 1 and {MAX_TIMEOUT_SECS} seconds, got {secs}"),
        ));
    }
    Ok(())
}

fn validate_plugins(config: &Config) -> ConfigResult<()> {
    let p = &config.plugins;

    if let Some(denied) = p
        .allowed_permissions
        .iter()
        .find(|perm| DENIED_PERMISSIONS.contains(&perm.as_str()))
    {
        return Err(invalid(
            "plugins.allowed_permissions",
            format!("'{denied}' is on the fixed deny-list and cannot be allowed"),
        ));
    }

    if p.max_package_bytes == 0 {
        return Err(invalid("plugins.max_package_bytes", "must be greater than zero"));
    }
    if p.max_concurrent_executions == 0 {
        return Err(invalid(
            "plugins.max_concurrent_executions",
            "must be greater than zero",
        ));
    }
    check_timeout("plugins.initialize_timeout_secs", p.initialize_timeout_secs)?;
    check_timeout("plugins.drain_timeout_secs", p.drain_timeout_secs)?;

    if p.trusted_keys.iter().any(|k| k.trim().is_empty()) {
        return Err(invalid("plugins.trusted_keys", "keys must not be blank"));
    }
    Ok(())
}

fn validate_sandbox(config: &Config) -> ConfigResult<()> {
    let s = &config.sandbox;

    if s.requests_per_minute == 0 {
        return Err(invalid("sandbox.requests_per_minute", "must be greater than zero"));
    }
    if s.max_http_response_bytes == 0 {
        return Err(invalid(
            "sandbox.max_http_response_bytes",
            "must be greater than zero",
        ));
    }
    // One WASM page is 64 KiB.
    if s.wasm_max_memory_bytes < 65_536 {
        return Err(invalid(
            "sandbox.wasm_max_memory_bytes",
            "must be at least one 64 KiB page",
        ));
    }
    check_timeout("sandbox.process_timeout_secs", s.process_timeout_secs)?;
    check_timeout(
        "sandbox.default_execution_timeout_secs",
        s.default_execution_timeout_secs,
    )?;
    Ok(())
}

fn validate_orchestrator(config: &Config) -> ConfigResult<()> {
    check_timeout(
        "orchestrator.default_timeout_secs",
        config.orchestrator.default_timeout_secs,
    )
}

fn validate_logging(config: &Config) -> ConfigResult<()> {
    let l = &config.logging;
    if !matches!(
        l.level.to_ascii_lowercase().as_str(),
        "trace" | "debug" | "info" | "warn" | "error"
    ) {
        return Err(invalid(
            "logging.level",
            format!(
                "unknown level '{}'; expected one of: trace, debug, info, warn, error",
                l.level
            ),
        ));
    }
    if !matches!(
        l.format.to_ascii_lowercase().as_str(),
        "pretty" | "compact" | "json" | "full"
    ) {
        return Err(invalid(
            "logging.format",
            format!(
                "unknown format '{}'; expected one of: pretty, compact, json, full",
                l.format
            ),
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        validate(&Config::default()).unwrap();
    }

    #[test]
    fn deny_listed_permission_cannot_be_allowed() {
        let mut config = Config::default();
        config
            .plugins
            .allowed_permissions
            .push("kernel.access".to_owned());
        let err = validate(&config).unwrap_err();
        assert!(err.to_string().contains("plugins.allowed_permissions"));
    }

    #[test]
    fn zero_rate_rejected() {
        let mut config = Config::default();
        config.sandbox.requests_per_minute = 0;
        assert!(validate(&config).is_err());
    }

    #[test]
    fn zero_concurrency_rejected() {
        let mut config = Config::default();
        config.plugins.max_concurrent_executions = 0;
        assert!(validate(&config).is_err());
    }

    #[test]
    fn unknown_log_format_rejected() {
        let mut config = Config::default();
        config.logging.format = "xml".to_owned();
        let err = validate(&config).unwrap_err();
        assert!(err.to_string().contains("logging.format"));
    }

    #[test]
    fn timeout_bounds_enforced() {
        let mut config = Config::default();
        config.sandbox.process_timeout_secs = MAX_TIMEOUT_SECS + 1;
        assert!(validate(&config).is_err());
    }
}
