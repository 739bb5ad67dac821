use std::path::Path;

use crate::config::schema::Config;
use crate::error::ConfigError;

const SCHEMA_JSON: &str = include_str!("../../../../schema/config-v1.json");

/// Loads a config file. `.yaml`/`.yml` files are parsed as YAML, anything
/// else as JSON.
pub fn load_config<P: AsRef<Path>>(path: P) -> Result<Config, ConfigError> {
    let path = path.as_ref();
    let content = std::fs::read_to_string(path).map_err(|e| ConfigError::ReadFile {
        path: path.to_path_buf(),
        source: e,
    })?;

    let is_yaml = path
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.eq_ignore_ascii_case("yaml") || e.eq_ignore_ascii_case("yml"))
        .unwrap_or(false);

    if is_yaml {
        load_config_from_yaml_str(&content)
    } else {
        load_config_from_str(&content)
    }
}

pub fn load_config_from_str(content: &str) -> Result<Config, ConfigError> {
    let json_value: serde_json::Value = serde_json::from_str(content)?;
    load_config_from_value(json_value)
}

pub fn load_config_from_yaml_str(content: &str) -> Result<Config, ConfigError> {
    let json_value: serde_json::Value = serde_yaml::from_str(content)?;
    load_config_from_value(json_value)
}

fn load_config_from_value(json_value: serde_json::Value) -> Result<Config, ConfigError> {
    validate_schema(&json_value)?;

    let config: Config = serde_json::from_value(json_value)?;

    validate_config(&config)?;

    Ok(config)
}

fn validate_schema(json_value: &serde_json::Value) -> Result<(), ConfigError> {
    let schema: serde_json::Value =
        serde_json::from_str(SCHEMA_JSON).map_err(|e| ConfigError::Validation {
            message: format!("Invalid embedded schema JSON: {}", e),
        })?;

    let validator = jsonschema::validator_for(&schema).map_err(|e| ConfigError::Validation {
        message: format!("Failed to compile JSON schema: {}", e),
    })?;

    let error_messages: Vec<String> = validator
        .iter_errors(json_value)
        .map(|e| e.to_string())
        .collect();
    if !error_messages.is_empty() {
        return Err(ConfigError::SchemaValidation {
            errors: error_messages.join("; "),
        });
    }

    Ok(())
}

fn validate_config(config: &Config) -> Result<(), ConfigError> {
    if config.version != "1.0" {
        return Err(ConfigError::Validation {
            message: format!("Unsupported config version: {}", config.version),
        });
    }

    if config.orchestrator.worker_count == 0 {
        return Err(ConfigError::Validation {
            message: "orchestrator.worker_count must be at least 1".to_string(),
        });
    }

    if config.retry.max_attempts == 0 {
        return Err(ConfigError::Validation {
            message: "retry.max_attempts must be at least 1".to_string(),
        });
    }

    if config.retry.max_delay_ms < config.retry.base_delay_ms {
        return Err(ConfigError::Validation {
            message: format!(
                "retry.max_delay_ms ({}) is below retry.base_delay_ms ({})",
                config.retry.max_delay_ms, config.retry.base_delay_ms
            ),
        });
    }

    if config.extraction.max_reextract_attempts == 0 {
        return Err(ConfigError::Validation {
            message: "extraction.max_reextract_attempts must be at least 1".to_string(),
        });
    }

    if config.logging.level.parse::<tracing_subscriber::EnvFilter>().is_err() {
        return Err(ConfigError::Validation {
            message: format!("Invalid logging.level filter: {}", config.logging.level),
        });
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::ExtractionStrategy;
    use crate::config::schema::LogFormat;

    #[test]
    fn test_minimal_config_uses_defaults() {
        let config = load_config_from_str(r#"{ "version": "1.0" }"#).unwrap();
        assert_eq!(config.retry.max_attempts, 3);
        assert_eq!(config.retry.base_delay_ms, 2_000);
        assert_eq!(config.scripts.max_rows_per_manifest, 5_000);
        assert_eq!(config.extraction.strategy, ExtractionStrategy::ReuseOcr);
        assert_eq!(config.orchestrator.worker_count, num_cpus::get());
        assert_eq!(config.logging.format, LogFormat::Text);
    }

    #[test]
    fn test_full_config() {
        let config_json = r#"
        {
            "version": "1.0",
            "database_path": "/var/lib/intake/intake.db",
            "orchestrator": { "worker_count": 4 },
            "retry": { "max_attempts": 5, "base_delay_ms": 100, "max_delay_ms": 1000 },
            "timeouts": { "provider_secs": 30 },
            "extraction": { "max_reextract_attempts": 2, "strategy": "ocr_first" },
            "scripts": { "timeout_ms": 250, "max_rows_per_manifest": 10 },
            "logging": { "level": "intake=debug", "format": "json" }
        }
        "#;

        let config = load_config_from_str(config_json).unwrap();
        assert_eq!(config.orchestrator.worker_count, 4);
        assert_eq!(config.retry.max_attempts, 5);
        assert_eq!(config.timeouts.provider_secs, 30);
        assert_eq!(config.extraction.strategy, ExtractionStrategy::OcrFirst);
        assert_eq!(config.scripts.limits().max_rows, 10);
        assert_eq!(config.logging.format, LogFormat::Json);
    }

    #[test]
    fn test_yaml_config() {
        let yaml = "version: \"1.0\"\norchestrator:\n  worker_count: 2\n";
        let config = load_config_from_yaml_str(yaml).unwrap();
        assert_eq!(config.orchestrator.worker_count, 2);
    }

    #[test]
    fn test_invalid_version() {
        let result = load_config_from_str(r#"{ "version": "2.0" }"#);
        assert!(matches!(result, Err(ConfigError::Validation { .. })));
    }

    #[test]
    fn test_unknown_field_rejected_by_schema() {
        let result = load_config_from_str(r#"{ "version": "1.0", "workers": 3 }"#);
        assert!(matches!(result, Err(ConfigError::SchemaValidation { .. })));
    }

    #[test]
    fn test_inverted_retry_delays() {
        let result = load_config_from_str(
            r#"{ "version": "1.0", "retry": { "base_delay_ms": 500, "max_delay_ms": 100 } }"#,
        );
        assert!(matches!(result, Err(ConfigError::Validation { .. })));
    }
}
