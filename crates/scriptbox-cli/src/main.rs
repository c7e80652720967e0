#![warn(missing_docs)]

//! scriptbox
//!
//! Run a serverless function script in the sandbox and print its result.

use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use scriptbox_config::{AuditSettings, AuditSink, ScriptboxConfig};
use scriptbox_sandbox::audit::{AuditLogger, JsonLinesAuditLogger, NoopAuditLogger, TracingAuditLogger};
use scriptbox_sandbox::validator::validate_source;
use scriptbox_sandbox::{compile, ExecutionRequest, SandboxConfig, SandboxExecutor};
use serde_json::{Map, Value};
use tracing_subscriber::EnvFilter;

/// Exit status when the script itself failed.
const EXIT_SCRIPT_ERROR: u8 = 1;
/// Exit status when the host could not run the script.
const EXIT_HOST_ERROR: u8 = 2;

#[derive(Debug, Parser)]
#[command(name = "scriptbox", version, about = "Run untrusted function scripts in a V8 sandbox")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Execute a script and print the execution result as JSON.
    Run(RunArgs),
    /// Compile a script without running it and print the emitted module.
    Check {
        /// TypeScript or JavaScript module to compile.
        file: PathBuf,
    },
}

#[derive(Debug, Args)]
struct RunArgs {
    /// TypeScript or JavaScript module whose default export is the handler.
    file: PathBuf,

    /// Handler params as a JSON object.
    #[arg(long, conflicts_with = "params_file")]
    params: Option<String>,

    /// Read handler params from a JSON file.
    #[arg(long, value_name = "PATH")]
    params_file: Option<PathBuf>,

    /// A secret passed to the handler. Repeatable.
    #[arg(long = "secret", value_name = "KEY=VALUE", value_parser = parse_secret)]
    secrets: Vec<(String, String)>,

    /// Invocation budget. Defaults to the configured timeout.
    #[arg(long)]
    timeout_ms: Option<u64>,

    /// Config file. Falls back to `SCRIPTBOX_CONFIG`, then `./scriptbox.toml`.
    #[arg(long, value_name = "PATH")]
    config: Option<PathBuf>,

    /// Print the result on a single line.
    #[arg(long)]
    compact: bool,
}

fn parse_secret(raw: &str) -> Result<(String, String), String> {
    match raw.split_once('=') {
        Some((key, value)) if !key.trim().is_empty() => Ok((key.trim().to_string(), value.to_string())),
        _ => Err(format!("expected KEY=VALUE, got '{raw}'")),
    }
}

/// Locate the config file.
///
/// Search order:
/// 1. `--config` (must exist)
/// 2. `SCRIPTBOX_CONFIG` environment variable
/// 3. `./scriptbox.toml` in the current directory
fn find_config_file(explicit: Option<&Path>) -> Result<Option<PathBuf>> {
    if let Some(path) = explicit {
        anyhow::ensure!(path.exists(), "config file {} does not exist", path.display());
        return Ok(Some(path.to_path_buf()));
    }

    if let Ok(path) = std::env::var("SCRIPTBOX_CONFIG") {
        let p = PathBuf::from(path);
        if p.exists() {
            return Ok(Some(p));
        }
        tracing::warn!(path = %p.display(), "SCRIPTBOX_CONFIG points at a missing file, ignoring");
    }

    let cwd = PathBuf::from("scriptbox.toml");
    if cwd.exists() {
        return Ok(Some(cwd));
    }

    Ok(None)
}

fn load_config(explicit: Option<&Path>) -> Result<ScriptboxConfig> {
    match find_config_file(explicit)? {
        Some(path) => {
            tracing::info!(path = %path.display(), "loading config");
            ScriptboxConfig::from_file_with_env(&path)
                .with_context(|| format!("failed to load config from {}", path.display()))
        }
        None => {
            tracing::debug!("no config file found, using defaults");
            Ok(ScriptboxConfig::default())
        }
    }
}

/// Build SandboxConfig from config overrides.
fn build_sandbox_config(config: &ScriptboxConfig) -> SandboxConfig {
    // One script per process, so nothing is built ahead unless asked for.
    let mut out = SandboxConfig {
        warm_contexts: 0,
        ..SandboxConfig::default()
    };
    let sandbox = &config.sandbox;
    if let Some(ms) = sandbox.timeout_ms {
        out.timeout = Duration::from_millis(ms);
    }
    if let Some(ms) = sandbox.module_timeout_ms {
        out.module_timeout = Duration::from_millis(ms);
    }
    if let Some(heap) = sandbox.max_heap_mb {
        out.max_heap_size = heap.saturating_mul(1024 * 1024);
    }
    if let Some(concurrent) = sandbox.max_concurrent {
        out.max_concurrent = concurrent;
    }
    if let Some(warm) = sandbox.warm_contexts {
        out.warm_contexts = warm;
    }
    if let Some(kb) = sandbox.max_source_kb {
        out.max_source_size = kb.saturating_mul(1024);
    }
    if let Some(kb) = sandbox.max_output_kb {
        out.max_output_size = kb.saturating_mul(1024);
    }
    if let Some(calls) = sandbox.max_fetch_calls {
        out.max_fetch_calls = calls;
    }
    if let Some(timers) = sandbox.max_timers {
        out.max_timers = timers;
    }
    if let Some(entries) = sandbox.max_log_entries {
        out.max_log_entries = entries;
    }
    if let Some(redact) = sandbox.redact_secrets {
        out.redact_secrets = redact;
    }

    let network = &config.network;
    if let Some(hosts) = &network.allowed_hosts {
        out.network.allowed_hosts = hosts.clone();
    }
    if let Some(block) = network.block_private_addresses {
        out.network.block_private_addresses = block;
    }
    if let Some(ms) = network.request_timeout_ms {
        out.network.request_timeout = Duration::from_millis(ms);
    }
    if let Some(kb) = network.max_response_kb {
        out.network.max_response_size = kb.saturating_mul(1024);
    }
    if let Some(kb) = network.max_request_body_kb {
        out.max_fetch_body_size = kb.saturating_mul(1024);
    }
    out
}

async fn build_audit_logger(settings: &AuditSettings) -> Result<Arc<dyn AuditLogger>> {
    Ok(match settings.sink {
        AuditSink::None => Arc::new(NoopAuditLogger),
        AuditSink::Tracing => Arc::new(TracingAuditLogger),
        AuditSink::Jsonl => {
            let path = settings
                .path
                .as_deref()
                .context("audit sink 'jsonl' requires 'path'")?;
            let file = tokio::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .await
                .with_context(|| format!("failed to open audit log {path}"))?;
            Arc::new(JsonLinesAuditLogger::new(file))
        }
    })
}

fn load_params(inline: Option<&str>, file: Option<&Path>) -> Result<Map<String, Value>> {
    let raw = match (inline, file) {
        (Some(json), _) => json.to_string(),
        (None, Some(path)) => std::fs::read_to_string(path)
            .with_context(|| format!("failed to read params from {}", path.display()))?,
        (None, None) => return Ok(Map::new()),
    };
    match serde_json::from_str(&raw).context("params are not valid JSON")? {
        Value::Object(map) => Ok(map),
        other => anyhow::bail!("params must be a JSON object, got {}", json_type(&other)),
    }
}

fn json_type(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

fn read_script(path: &Path) -> Result<String> {
    std::fs::read_to_string(path).with_context(|| format!("failed to read script {}", path.display()))
}

async fn run(args: RunArgs) -> Result<u8> {
    let config = load_config(args.config.as_deref())?;
    let sandbox_config = build_sandbox_config(&config);
    let timeout = args
        .timeout_ms
        .map(Duration::from_millis)
        .unwrap_or(sandbox_config.timeout);

    let source = read_script(&args.file)?;
    let mut request = ExecutionRequest::new(source)
        .with_params(load_params(args.params.as_deref(), args.params_file.as_deref())?);
    for (key, value) in args.secrets {
        request = request.with_secret(key, value);
    }

    let audit = build_audit_logger(&config.audit).await?;
    let executor = SandboxExecutor::new(sandbox_config)
        .context("failed to start the sandbox")?
        .with_audit_logger(audit);

    let result = executor
        .execute(request, timeout)
        .await
        .context("execution failed")?;

    let rendered = if args.compact {
        serde_json::to_string(&result)?
    } else {
        serde_json::to_string_pretty(&result)?
    };
    println!("{rendered}");

    Ok(if result.is_error() { EXIT_SCRIPT_ERROR } else { 0 })
}

fn check(file: &Path) -> Result<u8> {
    let source = read_script(file)?;
    let compiled = validate_source(&source, SandboxConfig::default().max_source_size)
        .and_then(|()| compile(&source));
    match compiled {
        Ok(module) => {
            println!("{}", module.code);
            Ok(0)
        }
        Err(e) => {
            match e.location {
                Some(loc) => eprintln!("{}:{}:{}: {}", file.display(), loc.line, loc.column, e.message),
                None => eprintln!("{}: {}", file.display(), e.message),
            }
            Ok(EXIT_SCRIPT_ERROR)
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let outcome = match cli.command {
        Command::Run(args) => run(args).await,
        Command::Check { file } => check(&file),
    };

    match outcome {
        Ok(code) => ExitCode::from(code),
        Err(e) => {
            eprintln!("error: {e:#}");
            ExitCode::from(EXIT_HOST_ERROR)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    #[test]
    fn secret_parser_splits_on_first_equals() {
        assert_eq!(
            parse_secret("API_KEY=a=b").unwrap(),
            ("API_KEY".to_string(), "a=b".to_string())
        );
        assert_eq!(parse_secret("EMPTY=").unwrap().1, "");
        assert!(parse_secret("no-separator").is_err());
        assert!(parse_secret("=value").is_err());
    }

    #[test]
    fn cli_parses_run_arguments() {
        let cli = Cli::try_parse_from([
            "scriptbox",
            "run",
            "handler.ts",
            "--params",
            r#"{"a":1}"#,
            "--secret",
            "K=V",
            "--secret",
            "K2=V2",
            "--timeout-ms",
            "250",
            "--compact",
        ])
        .unwrap();
        let Command::Run(args) = cli.command else {
            panic!("expected run");
        };
        assert_eq!(args.file, PathBuf::from("handler.ts"));
        assert_eq!(args.secrets.len(), 2);
        assert_eq!(args.timeout_ms, Some(250));
        assert!(args.compact);
    }

    #[test]
    fn cli_rejects_params_and_params_file_together() {
        let err = Cli::try_parse_from([
            "scriptbox",
            "run",
            "handler.ts",
            "--params",
            "{}",
            "--params-file",
            "p.json",
        ]);
        assert!(err.is_err());
    }

    #[test]
    fn build_sandbox_config_defaults() {
        let config = build_sandbox_config(&ScriptboxConfig::default());
        let defaults = SandboxConfig::default();
        assert_eq!(config.timeout, defaults.timeout);
        assert_eq!(config.max_heap_size, defaults.max_heap_size);
        assert_eq!(config.warm_contexts, 0);
        assert!(config.network.block_private_addresses);
    }

    #[test]
    fn build_sandbox_config_applies_overrides() {
        let toml = r#"
            [sandbox]
            timeout_ms = 1500
            max_heap_mb = 64
            max_output_kb = 8
            warm_contexts = 3
            redact_secrets = false

            [network]
            allowed_hosts = ["api.example.com"]
            block_private_addresses = false
            max_response_kb = 16
            max_request_body_kb = 2
        "#;
        let config = build_sandbox_config(&ScriptboxConfig::from_toml(toml).unwrap());
        assert_eq!(config.timeout, Duration::from_millis(1500));
        assert_eq!(config.max_heap_size, 64 * 1024 * 1024);
        assert_eq!(config.max_output_size, 8 * 1024);
        assert_eq!(config.warm_contexts, 3);
        assert!(!config.redact_secrets);
        assert_eq!(config.network.allowed_hosts, vec!["api.example.com"]);
        assert!(!config.network.block_private_addresses);
        assert_eq!(config.network.max_response_size, 16 * 1024);
        assert_eq!(config.max_fetch_body_size, 2 * 1024);
    }

    #[test]
    fn build_sandbox_config_saturates_huge_sizes() {
        let toml = format!(
            "[sandbox]\nmax_heap_mb = {max}\nmax_output_kb = {max}\n\n[network]\nmax_response_kb = {max}\n",
            max = i64::MAX
        );
        let config = build_sandbox_config(&ScriptboxConfig::from_toml(&toml).unwrap());
        assert_eq!(config.max_heap_size, usize::MAX);
        assert_eq!(config.max_output_size, usize::MAX);
        assert_eq!(config.network.max_response_size, usize::MAX);
    }

    #[test]
    fn params_default_to_empty_object() {
        assert!(load_params(None, None).unwrap().is_empty());
    }

    #[test]
    fn params_must_be_an_object() {
        let err = load_params(Some("[1, 2]"), None).unwrap_err();
        assert!(err.to_string().contains("an array"), "{err}");
        assert!(load_params(Some("{not json"), None).is_err());
    }

    #[test]
    fn params_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("params.json");
        std::fs::write(&path, r#"{"name": "scriptbox"}"#).unwrap();
        let params = load_params(None, Some(&path)).unwrap();
        assert_eq!(params["name"], "scriptbox");
    }

    #[test]
    fn explicit_config_must_exist() {
        assert!(find_config_file(Some(Path::new("/nonexistent/scriptbox.toml"))).is_err());
    }

    #[test]
    #[serial]
    fn config_is_found_through_environment() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("custom.toml");
        std::fs::write(&path, "[sandbox]\nmax_concurrent = 3\n").unwrap();

        std::env::set_var("SCRIPTBOX_CONFIG", &path);
        let found = find_config_file(None).unwrap();
        std::env::remove_var("SCRIPTBOX_CONFIG");

        assert_eq!(found, Some(path.clone()));
        let config = load_config(Some(&path)).unwrap();
        assert_eq!(config.sandbox.max_concurrent, Some(3));
    }

    #[tokio::test]
    async fn jsonl_audit_sink_opens_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("audit.jsonl");
        let settings = AuditSettings {
            sink: AuditSink::Jsonl,
            path: Some(path.to_string_lossy().into_owned()),
        };
        build_audit_logger(&settings).await.unwrap();
        assert!(path.exists());
    }
}
