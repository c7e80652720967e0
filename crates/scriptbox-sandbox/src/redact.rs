//! Redaction of secrets and host details from invocation output.
//!
//! Two redactors live here. [`SecretRedactor`] knows the exact secret values
//! handed to one invocation and masks them wherever they surface in the
//! network trace and console logs. [`redact_error_message`] is pattern based
//! and scrubs host-side error text (connection failures, internal errors)
//! before it is shown to the guest or written to an audit record.

use std::borrow::Cow;
use std::collections::HashMap;
use std::sync::LazyLock;

use regex::Regex;
use secrecy::{ExposeSecret, SecretString};
use serde_json::Value;

use crate::types::{LogEntry, NetworkLogEntry};

/// Replacement text for masked values.
pub const REDACTED: &str = "[REDACTED]";

/// Secrets shorter than this are not masked; they would mangle ordinary text.
pub const MIN_SECRET_LEN: usize = 4;

static URL_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"https?://[^\s'")\]}>]+"#).expect("valid regex"));

static IP_PORT_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\d{1,3}\.\d{1,3}\.\d{1,3}\.\d{1,3}(:\d+)?").expect("valid regex")
});

static UNIX_PATH_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"/(home|Users|etc|var|tmp|opt|usr|root|mnt|srv|proc|sys|dev|run|boot|snap|nix)(/[\w.\-]+)+")
        .expect("valid regex")
});

static CREDENTIAL_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)(Bearer\s+\S+|api_key\s*=\s*\S+|token\s*=\s*\S+|password\s*=\s*\S+|secret\s*=\s*\S+)",
    )
    .expect("valid regex")
});

/// AWS access key IDs.
static AWS_KEY_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?:AKIA|ABIA|ACCA|ASIA)[0-9A-Z]{16}").expect("valid regex"));

/// GitHub PATs, OAuth and fine-grained tokens.
static GITHUB_TOKEN_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?:ghp_|gho_|ghs_|ghr_|github_pat_)[a-zA-Z0-9_]{20,}").expect("valid regex")
});

static JWT_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"eyJ[a-zA-Z0-9_-]+\.eyJ[a-zA-Z0-9_-]+\.[a-zA-Z0-9_-]+").expect("valid regex")
});

static STACK_TRACE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?m)^\s*(at\s+.+|Caused by:.*)$").expect("valid regex")
});

/// Strip connection details, host paths, credentials and stack frames from
/// host-side error text.
///
/// - URLs → `[url]`
/// - IP:port addresses → `[addr]`
/// - host file paths → `[path]`
/// - credential shapes → `[REDACTED]`
/// - stack trace lines → removed
pub fn redact_error_message(error: &str) -> String {
    let mut msg = error.to_string();

    // Credentials first; they may contain URLs.
    msg = JWT_RE.replace_all(&msg, REDACTED).into_owned();
    msg = AWS_KEY_RE.replace_all(&msg, REDACTED).into_owned();
    msg = GITHUB_TOKEN_RE.replace_all(&msg, REDACTED).into_owned();
    msg = CREDENTIAL_RE.replace_all(&msg, REDACTED).into_owned();
    msg = URL_RE.replace_all(&msg, "[url]").into_owned();
    msg = IP_PORT_RE.replace_all(&msg, "[addr]").into_owned();
    msg = UNIX_PATH_RE.replace_all(&msg, "[path]").into_owned();
    msg = STACK_TRACE_RE.replace_all(&msg, "").into_owned();

    let lines: Vec<&str> = msg.lines().filter(|l| !l.trim().is_empty()).collect();
    lines.join("\n")
}

/// Masks the secret values of one invocation.
#[derive(Debug, Clone, Default)]
pub struct SecretRedactor {
    needles: Vec<String>,
}

impl SecretRedactor {
    /// Build a redactor from the secrets passed to the handler.
    pub fn new(secrets: &HashMap<String, SecretString>) -> Self {
        let mut needles: Vec<String> = secrets
            .values()
            .map(|s| s.expose_secret().to_string())
            .filter(|s| s.chars().count() >= MIN_SECRET_LEN)
            .collect();
        // Longest first so a secret that contains another is masked whole.
        needles.sort_by(|a, b| b.len().cmp(&a.len()));
        needles.dedup();
        Self { needles }
    }

    /// Whether there is anything to mask.
    pub fn is_empty(&self) -> bool {
        self.needles.is_empty()
    }

    /// Mask every secret occurrence in `text`.
    pub fn redact<'a>(&self, text: &'a str) -> Cow<'a, str> {
        let mut out = Cow::Borrowed(text);
        for needle in &self.needles {
            if out.contains(needle.as_str()) {
                out = Cow::Owned(out.replace(needle.as_str(), REDACTED));
            }
        }
        out
    }

    /// Mask secrets in every string inside a JSON value, keys included.
    pub fn redact_value(&self, value: &mut Value) {
        match value {
            Value::String(s) => {
                if let Cow::Owned(masked) = self.redact(s) {
                    *s = masked;
                }
            }
            Value::Array(items) => items.iter_mut().for_each(|v| self.redact_value(v)),
            Value::Object(map) => {
                let entries = std::mem::take(map);
                for (key, mut v) in entries {
                    self.redact_value(&mut v);
                    map.insert(self.redact(&key).into_owned(), v);
                }
            }
            _ => {}
        }
    }

    /// Mask secrets in console arguments.
    pub fn redact_logs(&self, logs: &mut [LogEntry]) {
        if self.is_empty() {
            return;
        }
        for entry in logs {
            entry.args.iter_mut().for_each(|arg| self.redact_value(arg));
        }
    }

    /// Mask secrets in request URLs, header values and error text.
    pub fn redact_trace(&self, trace: &mut [NetworkLogEntry]) {
        if self.is_empty() {
            return;
        }
        for entry in trace {
            entry.url = self.redact(&entry.url).into_owned();
            for (_, value) in entry
                .request_headers
                .iter_mut()
                .chain(entry.response_headers.iter_mut())
            {
                *value = self.redact(value).into_owned();
            }
            if let Some(err) = entry.error.as_mut() {
                *err = self.redact(err).into_owned();
            }
        }
    }
}
