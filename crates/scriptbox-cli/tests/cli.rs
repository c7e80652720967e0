//! End-to-end runs of the `scriptbox` binary.

use std::path::Path;
use std::process::{Command, Output};

fn scriptbox(dir: &Path, args: &[&str]) -> Output {
    Command::new(env!("CARGO_BIN_EXE_scriptbox"))
        .args(args)
        .current_dir(dir)
        .env_remove("SCRIPTBOX_CONFIG")
        .env("RUST_LOG", "error")
        .output()
        .expect("failed to spawn scriptbox")
}

fn stdout_json(output: &Output) -> serde_json::Value {
    serde_json::from_slice(&output.stdout).unwrap_or_else(|e| {
        panic!(
            "stdout is not JSON ({e}): {}",
            String::from_utf8_lossy(&output.stdout)
        )
    })
}

#[test]
fn run_prints_result_and_exits_zero() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(
        dir.path().join("add.ts"),
        r#"
        type Params = { a: number; b: number };
        export default async ({ params }: { params: Params }) => {
            console.log("adding", params.a, params.b);
            return { sum: params.a + params.b };
        };
        "#,
    )
    .unwrap();

    let output = scriptbox(
        dir.path(),
        &["run", "add.ts", "--params", r#"{"a":2,"b":3}"#, "--compact"],
    );
    assert_eq!(output.status.code(), Some(0));
    let result = stdout_json(&output);
    assert_eq!(result["data"]["sum"], 5);
    assert_eq!(result["logs"][0]["args"][0], "adding");
    assert!(result["networkTrace"].as_array().unwrap().is_empty());
}

#[test]
fn script_error_exits_one() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(
        dir.path().join("fail.js"),
        "export default () => { throw new Error('nope'); };",
    )
    .unwrap();

    let output = scriptbox(dir.path(), &["run", "fail.js"]);
    assert_eq!(output.status.code(), Some(1));
    let result = stdout_json(&output);
    assert_eq!(result["error"]["kind"], "RuntimeError");
    assert_eq!(result["error"]["message"], "nope");
}

#[test]
fn missing_script_exits_two() {
    let dir = tempfile::tempdir().unwrap();
    let output = scriptbox(dir.path(), &["run", "missing.ts"]);
    assert_eq!(output.status.code(), Some(2));
    assert!(String::from_utf8_lossy(&output.stderr).contains("missing.ts"));
}

#[test]
fn config_in_working_directory_is_applied() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("scriptbox.toml"), "[sandbox]\ntimeout_ms = 100\n").unwrap();
    std::fs::write(
        dir.path().join("slow.js"),
        "export default () => new Promise((r) => setTimeout(r, 5000));",
    )
    .unwrap();

    let output = scriptbox(dir.path(), &["run", "slow.js"]);
    assert_eq!(output.status.code(), Some(1));
    assert_eq!(stdout_json(&output)["error"]["kind"], "Timeout");
}

#[test]
fn secrets_are_passed_to_the_handler() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(
        dir.path().join("secret.js"),
        "export default ({ secrets }) => secrets.NAME.toUpperCase();",
    )
    .unwrap();

    let output = scriptbox(dir.path(), &["run", "secret.js", "--secret", "NAME=value"]);
    assert_eq!(output.status.code(), Some(0));
    assert_eq!(stdout_json(&output)["data"], "VALUE");
}

#[test]
fn check_prints_compiled_module() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(
        dir.path().join("typed.ts"),
        "interface In { n: number }\nexport default ({ params }: { params: In }) => params.n * 2;\n",
    )
    .unwrap();

    let output = scriptbox(dir.path(), &["check", "typed.ts"]);
    assert_eq!(output.status.code(), Some(0));
    let code = String::from_utf8_lossy(&output.stdout);
    assert!(code.contains("export default"), "{code}");
    assert!(!code.contains("interface"), "{code}");
}

#[test]
fn check_reports_location_of_syntax_errors() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(
        dir.path().join("broken.ts"),
        "export default () => {\n  let x = ;\n};\n",
    )
    .unwrap();

    let output = scriptbox(dir.path(), &["check", "broken.ts"]);
    assert_eq!(output.status.code(), Some(1));
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.starts_with("broken.ts:2:"), "{stderr}");
}
