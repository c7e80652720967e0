#![warn(missing_docs)]

//! # scriptbox-config
//!
//! Configuration loading for the scriptbox execution engine.
//!
//! Supports TOML configuration files with environment variable expansion.
//!
//! ## Example
//!
//! ```toml
//! [sandbox]
//! timeout_ms = 5000
//! max_heap_mb = 128
//! max_concurrent = 8
//! max_fetch_calls = 50
//!
//! [network]
//! allowed_hosts = ["api.example.com", "*.internal-apis.dev"]
//! block_private_addresses = true
//!
//! [audit]
//! sink = "jsonl"
//! path = "${SCRIPTBOX_AUDIT_DIR}/audit.jsonl"
//! ```

use std::path::Path;

use serde::Deserialize;
use thiserror::Error;

/// Smallest heap ceiling accepted for a context, in megabytes.
const MIN_HEAP_MB: usize = 16;

/// Errors from config parsing.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Failed to read config file.
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    /// Failed to parse TOML.
    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    /// Invalid configuration value.
    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Top-level scriptbox configuration.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ScriptboxConfig {
    /// Sandbox execution settings.
    #[serde(default)]
    pub sandbox: SandboxOverrides,

    /// Outbound network policy for guest `fetch()`.
    #[serde(default)]
    pub network: NetworkOverrides,

    /// Audit log destination.
    #[serde(default)]
    pub audit: AuditSettings,
}

/// Sandbox configuration overrides. Unset fields keep the engine defaults.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SandboxOverrides {
    /// Default invocation budget in milliseconds.
    #[serde(default)]
    pub timeout_ms: Option<u64>,

    /// Budget for evaluating the module body, in milliseconds.
    #[serde(default)]
    pub module_timeout_ms: Option<u64>,

    /// Maximum V8 heap size in megabytes.
    #[serde(default)]
    pub max_heap_mb: Option<usize>,

    /// Maximum concurrent execution contexts.
    #[serde(default)]
    pub max_concurrent: Option<usize>,

    /// Contexts built ahead of demand.
    #[serde(default)]
    pub warm_contexts: Option<usize>,

    /// Maximum script size in kilobytes.
    #[serde(default)]
    pub max_source_kb: Option<usize>,

    /// Maximum serialized result size in kilobytes.
    #[serde(default)]
    pub max_output_kb: Option<usize>,

    /// Maximum `fetch()` calls per invocation.
    #[serde(default)]
    pub max_fetch_calls: Option<usize>,

    /// Maximum pending timers per invocation.
    #[serde(default)]
    pub max_timers: Option<usize>,

    /// Maximum console entries kept per invocation.
    #[serde(default)]
    pub max_log_entries: Option<usize>,

    /// Mask secret values in logs and the network trace.
    #[serde(default)]
    pub redact_secrets: Option<bool>,
}

/// Network policy overrides.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct NetworkOverrides {
    /// Host patterns guest code may reach: exact, `*.suffix`, or `*`.
    #[serde(default)]
    pub allowed_hosts: Option<Vec<String>>,

    /// Refuse loopback, private, link-local and metadata destinations.
    #[serde(default)]
    pub block_private_addresses: Option<bool>,

    /// Per-request timeout in milliseconds.
    #[serde(default)]
    pub request_timeout_ms: Option<u64>,

    /// Maximum response body size in kilobytes.
    #[serde(default)]
    pub max_response_kb: Option<usize>,

    /// Maximum request body size in kilobytes.
    #[serde(default)]
    pub max_request_body_kb: Option<usize>,
}

/// Where audit entries are written.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditSink {
    /// Audit entries are discarded.
    #[default]
    None,
    /// Audit entries are emitted as `tracing` events.
    Tracing,
    /// Audit entries are appended to a JSON-lines file.
    Jsonl,
}

/// Audit settings.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AuditSettings {
    /// Audit backend.
    #[serde(default)]
    pub sink: AuditSink,

    /// File path for the `jsonl` sink.
    #[serde(default)]
    pub path: Option<String>,
}

impl ScriptboxConfig {
    /// Parse a config from a TOML string.
    pub fn from_toml(toml_str: &str) -> Result<Self, ConfigError> {
        let config: ScriptboxConfig = toml::from_str(toml_str)?;
        config.validate()?;
        Ok(config)
    }

    /// Load config from a file path.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml(&content)
    }

    /// Parse a config from a TOML string, expanding `${ENV_VAR}` references.
    pub fn from_toml_with_env(toml_str: &str) -> Result<Self, ConfigError> {
        let expanded = expand_env_vars(toml_str);
        Self::from_toml(&expanded)
    }

    /// Load config from a file path, expanding environment variables.
    pub fn from_file_with_env(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_with_env(&content)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        let sandbox = &self.sandbox;
        for (name, value) in [
            ("sandbox.timeout_ms", sandbox.timeout_ms),
            ("sandbox.module_timeout_ms", sandbox.module_timeout_ms),
            ("network.request_timeout_ms", self.network.request_timeout_ms),
        ] {
            if value == Some(0) {
                return Err(ConfigError::Invalid(format!(
                    "{name} must be greater than zero"
                )));
            }
        }

        if let Some(heap) = sandbox.max_heap_mb {
            if heap < MIN_HEAP_MB {
                return Err(ConfigError::Invalid(format!(
                    "sandbox.max_heap_mb must be at least {MIN_HEAP_MB} (got {heap})"
                )));
            }
        }

        if sandbox.max_source_kb == Some(0) || sandbox.max_output_kb == Some(0) {
            return Err(ConfigError::Invalid(
                "sandbox.max_source_kb and sandbox.max_output_kb must be greater than zero".into(),
            ));
        }

        if let Some(hosts) = &self.network.allowed_hosts {
            for pattern in hosts {
                validate_host_pattern(pattern)?;
            }
        }

        if self.audit.sink == AuditSink::Jsonl && self.audit.path.is_none() {
            return Err(ConfigError::Invalid(
                "audit sink 'jsonl' requires 'path'".into(),
            ));
        }

        Ok(())
    }
}

/// Check an `allowed_hosts` entry: `*`, `*.example.com`, or a bare host name.
fn validate_host_pattern(pattern: &str) -> Result<(), ConfigError> {
    if pattern == "*" {
        return Ok(());
    }
    let host = pattern.strip_prefix("*.").unwrap_or(pattern);
    let valid = !host.is_empty()
        && !host.contains('*')
        && host
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | ':' | '[' | ']'));
    if valid {
        Ok(())
    } else {
        Err(ConfigError::Invalid(format!(
            "network.allowed_hosts: malformed host pattern '{pattern}'"
        )))
    }
}

/// Expand `${ENV_VAR}` patterns in a string using environment variables.
fn expand_env_vars(input: &str) -> String {
    let mut result = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();

    while let Some(ch) = chars.next() {
        if ch == '$' && chars.peek() == Some(&'{') {
            chars.next();
            let mut var_name = String::new();
            for c in chars.by_ref() {
                if c == '}' {
                    break;
                }
                var_name.push(c);
            }
            match std::env::var(&var_name) {
                Ok(value) => result.push_str(&value),
                // Leave the placeholder if env var not found
                Err(_) => result.push_str(&format!("${{{}}}", var_name)),
            }
        } else {
            result.push(ch);
        }
    }

    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    #[test]
    fn config_parses_sandbox_overrides() {
        let toml = r#"
            [sandbox]
            timeout_ms = 2500
            module_timeout_ms = 10000
            max_heap_mb = 128
            max_concurrent = 4
            warm_contexts = 1
            max_fetch_calls = 10
        "#;

        let config = ScriptboxConfig::from_toml(toml).unwrap();
        assert_eq!(config.sandbox.timeout_ms, Some(2500));
        assert_eq!(config.sandbox.module_timeout_ms, Some(10000));
        assert_eq!(config.sandbox.max_heap_mb, Some(128));
        assert_eq!(config.sandbox.max_concurrent, Some(4));
        assert_eq!(config.sandbox.warm_contexts, Some(1));
        assert_eq!(config.sandbox.max_fetch_calls, Some(10));
    }

    #[test]
    fn config_parses_network_policy() {
        let toml = r#"
            [network]
            allowed_hosts = ["api.example.com", "*.example.org"]
            block_private_addresses = false
            request_timeout_ms = 3000
        "#;

        let config = ScriptboxConfig::from_toml(toml).unwrap();
        assert_eq!(
            config.network.allowed_hosts.as_deref(),
            Some(&["api.example.com".to_string(), "*.example.org".to_string()][..])
        );
        assert_eq!(config.network.block_private_addresses, Some(false));
        assert_eq!(config.network.request_timeout_ms, Some(3000));
    }

    #[test]
    #[serial]
    fn config_expands_environment_variables() {
        std::env::set_var("SCRIPTBOX_TEST_AUDIT_DIR", "/var/log/scriptbox");
        let toml = r#"
            [audit]
            sink = "jsonl"
            path = "${SCRIPTBOX_TEST_AUDIT_DIR}/audit.jsonl"
        "#;

        let config = ScriptboxConfig::from_toml_with_env(toml).unwrap();
        assert_eq!(
            config.audit.path.as_deref(),
            Some("/var/log/scriptbox/audit.jsonl")
        );
        std::env::remove_var("SCRIPTBOX_TEST_AUDIT_DIR");
    }

    #[test]
    fn config_rejects_zero_timeout() {
        let err = ScriptboxConfig::from_toml("[sandbox]\ntimeout_ms = 0").unwrap_err();
        assert!(err.to_string().contains("sandbox.timeout_ms"), "{err}");
    }

    #[test]
    fn config_rejects_tiny_heap() {
        let err = ScriptboxConfig::from_toml("[sandbox]\nmax_heap_mb = 4").unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("max_heap_mb"), "{msg}");
        assert!(msg.contains("16"), "should mention the minimum: {msg}");
    }

    #[test]
    fn config_rejects_malformed_host_pattern() {
        for bad in ["", "api.*.com", "*.", "http://example.com"] {
            let toml = format!("[network]\nallowed_hosts = [\"{bad}\"]");
            assert!(
                ScriptboxConfig::from_toml(&toml).is_err(),
                "pattern {bad:?} should be rejected"
            );
        }
    }

    #[test]
    fn config_accepts_wildcard_host() {
        let config = ScriptboxConfig::from_toml("[network]\nallowed_hosts = [\"*\"]").unwrap();
        assert_eq!(config.network.allowed_hosts.unwrap(), vec!["*"]);
    }

    #[test]
    fn config_rejects_jsonl_without_path() {
        let err = ScriptboxConfig::from_toml("[audit]\nsink = \"jsonl\"").unwrap_err();
        assert!(err.to_string().contains("path"));
    }

    #[test]
    fn config_rejects_unknown_keys() {
        let err = ScriptboxConfig::from_toml("[sandbox]\nmax_tool_calls = 5").unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));
    }

    #[test]
    fn config_loads_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("scriptbox.toml");
        std::fs::write(
            &path,
            r#"
            [sandbox]
            max_concurrent = 2

            [audit]
            sink = "tracing"
        "#,
        )
        .unwrap();

        let config = ScriptboxConfig::from_file(&path).unwrap();
        assert_eq!(config.sandbox.max_concurrent, Some(2));
        assert_eq!(config.audit.sink, AuditSink::Tracing);
    }

    #[test]
    fn config_missing_file_is_io_error() {
        let err = ScriptboxConfig::from_file(Path::new("/nonexistent/scriptbox.toml")).unwrap_err();
        assert!(matches!(err, ConfigError::Io(_)));
    }

    #[test]
    fn config_uses_defaults_when_absent() {
        let config = ScriptboxConfig::from_toml("").unwrap();
        assert!(config.sandbox.timeout_ms.is_none());
        assert!(config.sandbox.max_heap_mb.is_none());
        assert!(config.network.allowed_hosts.is_none());
        assert_eq!(config.audit.sink, AuditSink::None);
    }

    #[test]
    fn env_var_expansion_preserves_unresolved() {
        let result = expand_env_vars("prefix ${DEFINITELY_NOT_SET_12345} suffix");
        assert_eq!(result, "prefix ${DEFINITELY_NOT_SET_12345} suffix");
    }

    #[test]
    fn env_var_expansion_handles_no_vars() {
        let result = expand_env_vars("no variables here");
        assert_eq!(result, "no variables here");
    }
}
