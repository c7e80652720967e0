//! Request and result types exchanged with the sandbox's callers.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use secrecy::SecretString;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::ErrorInfo;

/// Immutable input to one invocation.
#[derive(Debug, Clone, Default)]
pub struct ExecutionRequest {
    /// User-authored TypeScript or JavaScript module text.
    pub source: String,
    /// End-user request parameters, passed to the handler as `params`.
    pub params: Map<String, Value>,
    /// Decrypted secret values, passed to the handler as `secrets`.
    pub secrets: HashMap<String, SecretString>,
}

impl ExecutionRequest {
    /// A request with no params and no secrets.
    pub fn new(source: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            ..Default::default()
        }
    }

    /// Replace the parameter map.
    pub fn with_params(mut self, params: Map<String, Value>) -> Self {
        self.params = params;
        self
    }

    /// Add a single parameter.
    pub fn with_param(mut self, key: impl Into<String>, value: Value) -> Self {
        self.params.insert(key.into(), value);
        self
    }

    /// Add a single secret.
    pub fn with_secret(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.secrets
            .insert(key.into(), SecretString::from(value.into()));
        self
    }
}

/// Output of one invocation. At most one of `data` and `error` is set.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionResult {
    /// The handler's resolved value; `None` when it returned `undefined`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    /// Why the invocation failed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorInfo>,
    /// Console output in host-observed order.
    #[serde(default)]
    pub logs: Vec<LogEntry>,
    /// Outbound requests in issue order.
    #[serde(default)]
    pub network_trace: NetworkLog,
}

impl ExecutionResult {
    /// A failed result carrying no diagnostics.
    pub fn failure(error: ErrorInfo) -> Self {
        Self {
            error: Some(error),
            ..Default::default()
        }
    }

    /// Whether the invocation failed.
    pub fn is_error(&self) -> bool {
        self.error.is_some()
    }
}

/// Console method used by the guest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    /// `console.log`
    Log,
    /// `console.debug`
    Debug,
    /// `console.info`
    Info,
    /// `console.warn`
    Warn,
    /// `console.error`
    Error,
}

impl LogLevel {
    /// Lowercase method name.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Log => "log",
            Self::Debug => "debug",
            Self::Info => "info",
            Self::Warn => "warn",
            Self::Error => "error",
        }
    }
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for LogLevel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "log" => Ok(Self::Log),
            "debug" => Ok(Self::Debug),
            "info" => Ok(Self::Info),
            "warn" => Ok(Self::Warn),
            "error" => Ok(Self::Error),
            other => Err(format!("unknown console level '{other}'")),
        }
    }
}

/// One console call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogEntry {
    /// When the host received the call.
    pub timestamp: DateTime<Utc>,
    /// Which console method was used.
    pub level: LogLevel,
    /// Arguments, each projected to JSON by the guest shim.
    pub args: Vec<Value>,
}

/// One outbound request and its response (or failure).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NetworkLogEntry {
    /// Upper-case HTTP method.
    pub method: String,
    /// Absolute request URL.
    pub url: String,
    /// Headers as sent.
    pub request_headers: Vec<(String, String)>,
    /// Response status, absent when no response arrived.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<u16>,
    /// Response headers as received.
    #[serde(default)]
    pub response_headers: Vec<(String, String)>,
    /// When the request was issued.
    pub started_at: DateTime<Utc>,
    /// Time until the response head arrived, or until failure.
    pub duration_ms: u64,
    /// Failure description when no response arrived.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Ordered network trace of one invocation.
pub type NetworkLog = Vec<NetworkLogEntry>;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    #[test]
    fn result_serializes_with_camel_case_keys() {
        let result = ExecutionResult {
            data: Some(serde_json::json!({ "ok": true })),
            ..Default::default()
        };
        let json = serde_json::to_value(&result).unwrap();
        assert_eq!(json["data"]["ok"], true);
        assert!(json.get("networkTrace").is_some());
        assert!(json.get("error").is_none());
    }

    #[test]
    fn failure_result_has_no_data() {
        let result = ExecutionResult::failure(ErrorInfo::new(ErrorKind::Timeout, "late"));
        assert!(result.is_error());
        assert!(result.data.is_none());
    }

    #[test]
    fn log_level_round_trips_through_name() {
        for level in [
            LogLevel::Log,
            LogLevel::Debug,
            LogLevel::Info,
            LogLevel::Warn,
            LogLevel::Error,
        ] {
            assert_eq!(level.as_str().parse::<LogLevel>().unwrap(), level);
        }
        assert!("trace".parse::<LogLevel>().is_err());
    }

    #[test]
    fn request_builder_collects_params_and_secrets() {
        let req = ExecutionRequest::new("export default () => 1")
            .with_param("id", serde_json::json!(7))
            .with_secret("API_KEY", "abc123");
        assert_eq!(req.params["id"], 7);
        assert!(req.secrets.contains_key("API_KEY"));
    }
}
