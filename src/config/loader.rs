//! Configuration loading and management
//!
//! This module handles loading configuration from files and environment variables.

use std::path::Path;

use tracing::{debug, info};

use super::types::{parse_recursor, Config};
use crate::error::ConfigError;

/// Load configuration from a JSON file
///
/// # Arguments
///
/// * `path` - Path to the configuration file
///
/// # Errors
///
/// Returns `ConfigError` if the file cannot be read or parsed.
pub fn load_config(path: impl AsRef<Path>) -> Result<Config, ConfigError> {
    let path = path.as_ref();

    debug!("Loading configuration from {:?}", path);

    if !path.exists() {
        return Err(ConfigError::FileNotFound {
            path: path.display().to_string(),
        });
    }

    let contents = std::fs::read_to_string(path)?;

    let config = load_config_str(&contents).map_err(|e| match e {
        ConfigError::ParseError(reason) => ConfigError::ParseError(format!("{reason} at {path:?}")),
        other => other,
    })?;

    info!(
        "Configuration loaded: {} subnets, {} recursors, mdns={}",
        config.subnets.len(),
        config.dns.recursors.len(),
        config.dns.mdns
    );

    Ok(config)
}

/// Load configuration from a JSON string
///
/// # Errors
///
/// Returns `ConfigError` if parsing or validation fails.
pub fn load_config_str(json: &str) -> Result<Config, ConfigError> {
    let config: Config = serde_json::from_str(json)
        .map_err(|e| ConfigError::ParseError(format!("Failed to parse JSON: {e}")))?;

    config.validate()?;

    Ok(config)
}

/// Load configuration with environment variable overrides
///
/// Environment variables:
/// - `KWT_NET_LOG_LEVEL`: Override log level
/// - `KWT_NET_SSH_HOST`: Override SSH host (only when SSH is configured)
/// - `KWT_NET_DNS_RECURSORS`: Comma-separated recursor list
/// - `KWT_NET_PROCESS_GROUP_ID`: Override the excluded group id
///
/// # Errors
///
/// Returns `ConfigError` if loading or parsing fails.
pub fn load_config_with_env(path: impl AsRef<Path>) -> Result<Config, ConfigError> {
    let mut config = load_config(path)?;
    apply_env_overrides(&mut config)?;
    Ok(config)
}

/// Apply `KWT_NET_*` overrides to an already loaded configuration
///
/// # Errors
///
/// Returns `ConfigError::EnvError` for unparsable values.
pub fn apply_env_overrides(config: &mut Config) -> Result<(), ConfigError> {
    if let Ok(level) = std::env::var("KWT_NET_LOG_LEVEL") {
        config.log.level = level;
        debug!("Log level overridden to {}", config.log.level);
    }

    if let Ok(host) = std::env::var("KWT_NET_SSH_HOST") {
        match config.ssh.as_mut() {
            Some(ssh) => {
                ssh.host = host;
                debug!("SSH host overridden to {}", ssh.host);
            }
            None => {
                return Err(ConfigError::EnvError {
                    name: "KWT_NET_SSH_HOST".into(),
                    reason: "SSH is not configured".into(),
                })
            }
        }
    }

    if let Ok(recursors) = std::env::var("KWT_NET_DNS_RECURSORS") {
        let list: Vec<String> = recursors
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(String::from)
            .collect();
        for r in &list {
            parse_recursor(r).map_err(|_| ConfigError::EnvError {
                name: "KWT_NET_DNS_RECURSORS".into(),
                reason: format!("Invalid recursor: {r}"),
            })?;
        }
        config.dns.recursors = list;
        debug!("DNS recursors overridden to {:?}", config.dns.recursors);
    }

    if let Ok(gid) = std::env::var("KWT_NET_PROCESS_GROUP_ID") {
        config.process_group_id = Some(gid.parse().map_err(|_| ConfigError::EnvError {
            name: "KWT_NET_PROCESS_GROUP_ID".into(),
            reason: format!("Invalid group id: {gid}"),
        })?);
        debug!("Process group id overridden to {gid}");
    }

    config.validate()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn create_temp_config(json: &str) -> NamedTempFile {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(json.as_bytes()).unwrap();
        file
    }

    #[test]
    fn test_load_config() {
        let file = create_temp_config(
            r#"{
                "subnets": ["10.96.0.0/12"],
                "dns": { "recursors": ["8.8.8.8"], "map": { "test.": ["1.2.3.4"] } },
                "ssh": { "user": "tom", "host": "10.0.0.1:22", "private_key": "/tmp/key" }
            }"#,
        );
        let config = load_config(file.path()).unwrap();
        assert_eq!(config.subnets, vec!["10.96.0.0/12".to_string()]);
        assert_eq!(config.dns.map["test."].len(), 1);
        assert_eq!(config.ssh.unwrap().keepalive_secs, 3);
    }

    #[test]
    fn test_load_config_file_not_found() {
        let result = load_config("/nonexistent/path/config.json");
        assert!(matches!(result, Err(ConfigError::FileNotFound { .. })));
    }

    #[test]
    fn test_load_config_str_empty_object() {
        let config = load_config_str("{}").unwrap();
        assert!(config.subnets.is_empty());
        assert!(!config.dns.mdns);
    }

    #[test]
    fn test_load_config_invalid_json() {
        let result = load_config_str("not valid json");
        assert!(matches!(result, Err(ConfigError::ParseError(_))));
    }

    #[test]
    fn test_load_config_validation_failure() {
        let result = load_config_str(r#"{ "remote_ips": ["nope"] }"#);
        assert!(matches!(result, Err(ConfigError::ValidationError(_))));
    }

    #[test]
    fn test_load_config_parse_error_names_file() {
        let file = create_temp_config("{ not json");
        match load_config(file.path()) {
            Err(ConfigError::ParseError(reason)) => {
                assert!(reason.starts_with("Failed to parse JSON"));
                assert!(reason.contains(&file.path().display().to_string()));
            }
            other => panic!("expected parse error, got {other:?}"),
        }
    }
}
