mod common;

use assert_cmd::Command;
use common::{dsonnet, failure_stderr, output_json, write_file};
use rstest::rstest;
use serde_json::json;
use std::time::{Duration, Instant};

#[rstest]
fn test_eval_simple_file(mut dsonnet: Command) {
    let dir = tempfile::tempdir().unwrap();
    let path = write_file(dir.path(), "main.jsonnet", "{a: 1 + 1}");
    let output = output_json(dsonnet.arg("eval").arg(&path));
    assert_eq!(output, json!({"a": 2}));
}

#[rstest]
fn test_eval_with_variables(mut dsonnet: Command) {
    let dir = tempfile::tempdir().unwrap();
    let path = write_file(
        dir.path(),
        "main.jsonnet",
        "function(region) {env: std.extVar('env'), \
         size: std.extVar('size').small, region: region}",
    );
    let output = output_json(
        dsonnet
            .arg("eval")
            .arg(&path)
            .args(["--ext-str", "env=dev"])
            .args(["--ext-code", "size={small: 1}"])
            .args(["--tla-str", "region=us-west"]),
    );
    assert_eq!(
        output,
        json!({"env": "dev", "size": 1, "region": "us-west"})
    );
}

#[rstest]
fn test_eval_shorthand_flag_reads_environment(mut dsonnet: Command) {
    let dir = tempfile::tempdir().unwrap();
    let path = write_file(
        dir.path(),
        "main.jsonnet",
        "{value: std.extVar('DSONNET_CLI_TEST_VAR')}",
    );
    let output = output_json(
        dsonnet
            .arg("eval")
            .arg(&path)
            .env("DSONNET_CLI_TEST_VAR", "bar")
            .args(["-V", "DSONNET_CLI_TEST_VAR"]),
    );
    assert_eq!(output, json!({"value": "bar"}));
}

#[rstest]
fn test_eval_missing_environment_variable(mut dsonnet: Command) {
    let dir = tempfile::tempdir().unwrap();
    let path = write_file(dir.path(), "main.jsonnet", "{}");
    let stderr = failure_stderr(
        dsonnet
            .arg("eval")
            .arg(&path)
            .env_remove("DSONNET_CLI_TEST_MISSING")
            .args(["--ext-str", "DSONNET_CLI_TEST_MISSING"]),
    );
    assert!(
        stderr.contains(
            "no value found from environment for DSONNET_CLI_TEST_MISSING"
        ),
        "unexpected stderr: {stderr}"
    );
}

#[rstest]
fn test_eval_jpath(mut dsonnet: Command) {
    let dir = tempfile::tempdir().unwrap();
    write_file(
        &dir.path().join("vendor"),
        "shared.libsonnet",
        "{shared: true}",
    );
    let path = write_file(
        dir.path(),
        "main.jsonnet",
        "import 'shared.libsonnet'",
    );
    let output = output_json(
        dsonnet
            .arg("eval")
            .arg(&path)
            .args(["--jpath", &dir.path().join("vendor").display().to_string()]),
    );
    assert_eq!(output, json!({"shared": true}));
}

#[rstest]
fn test_eval_glob_import(mut dsonnet: Command) {
    let dir = tempfile::tempdir().unwrap();
    for name in ["a", "b", "z"] {
        write_file(
            dir.path(),
            &format!("lib/{name}.json"),
            &format!("{{\"{name}\": \"{name}\"}}"),
        );
    }
    let path = write_file(
        dir.path(),
        "main.jsonnet",
        "import 'glob-import:lib/*.json'",
    );
    let output = output_json(dsonnet.arg("eval").arg(&path));
    assert_eq!(
        output,
        json!({
            "lib/a.json": {"a": "a"},
            "lib/b.json": {"b": "b"},
            "lib/z.json": {"z": "z"},
        })
    );
}

#[cfg(unix)]
#[rstest]
fn test_eval_exec_data_source(mut dsonnet: Command) {
    let dir = tempfile::tempdir().unwrap();
    let path = write_file(
        dir.path(),
        "main.jsonnet",
        "{greeting: import 'data://replay/hello'}",
    );
    let output = output_json(
        dsonnet
            .arg("eval")
            .arg(&path)
            .args(["--data-source", "exec://replay?configVar=cfg"])
            .args([
                "--ext-code",
                "cfg={command: 'sh', args: ['-c', \
                 'printf \\'\"echo %s\"\\' \"$__DS_PATH__\"']}",
            ]),
    );
    assert_eq!(output, json!({"greeting": "echo /hello"}));
}

#[cfg(unix)]
#[rstest]
fn test_eval_exec_data_source_failure(mut dsonnet: Command) {
    let dir = tempfile::tempdir().unwrap();
    let path = write_file(
        dir.path(),
        "main.jsonnet",
        "import 'data://replay/fail'",
    );
    let stderr = failure_stderr(
        dsonnet
            .arg("eval")
            .arg(&path)
            .args(["--data-source", "exec://replay?configVar=cfg"])
            .args(["--ext-code", "cfg={command: 'sh', args: ['-c', 'exit 1']}"]),
    );
    assert!(
        stderr.contains("data source replay, target=/fail:"),
        "unexpected stderr: {stderr}"
    );
    assert!(
        stderr.contains("exit status"),
        "unexpected stderr: {stderr}"
    );
}

#[cfg(unix)]
#[rstest]
fn test_eval_exec_data_source_timeout(mut dsonnet: Command) {
    let dir = tempfile::tempdir().unwrap();
    let path = write_file(
        dir.path(),
        "main.jsonnet",
        "import 'data://replay/slow'",
    );
    let start = Instant::now();
    let stderr = failure_stderr(
        dsonnet
            .arg("eval")
            .arg(&path)
            .args(["--data-source", "exec://replay?configVar=cfg"])
            .args([
                "--ext-code",
                "cfg={command: 'sh', args: ['-c', 'sleep 5'], timeout: '500ms'}",
            ]),
    );
    assert!(
        start.elapsed() < Duration::from_secs(4),
        "resolution did not respect the timeout"
    );
    assert!(
        stderr.contains("data source replay, target=/slow:"),
        "unexpected stderr: {stderr}"
    );
    assert!(stderr.contains("signal"), "unexpected stderr: {stderr}");
}

#[rstest]
fn test_demo_globs(mut dsonnet: Command) {
    let output = output_json(dsonnet.arg("eval").arg("demos/globs/main.jsonnet"));
    assert_eq!(
        output,
        json!({
            "components/batch/reports.jsonnet": {
                "image": "registry.example.com/reports:v1",
                "schedule": "@hourly",
                "checked": true,
            },
            "components/web.jsonnet": {
                "image": "registry.example.com/web:v3",
                "replicas": 2,
                "checked": true,
            },
        })
    );
}

#[rstest]
fn test_demo_natives(mut dsonnet: Command) {
    let output =
        output_json(dsonnet.arg("eval").arg("demos/natives/main.jsonnet"));
    assert_eq!(output["production"], json!(["svc-gateway"]));
    assert_eq!(output["renamed"], json!("service-gateway"));
    assert!(output["manifest"].is_string());
}

#[cfg(unix)]
#[rstest]
fn test_demo_data_source(mut dsonnet: Command) {
    let output = output_json(
        dsonnet
            .current_dir("demos/datasource")
            .arg("eval")
            .arg("main.jsonnet")
            .args(["--data-source", "exec://lookup?configVar=lookupConfig"])
            .args(["--ext-code", "lookupConfig=import 'lookup-config.jsonnet'"]),
    );
    assert_eq!(output, json!({"count": 2, "names": ["a", "b"]}));
}

#[rstest]
fn test_eval_invalid_data_source_url(mut dsonnet: Command) {
    let dir = tempfile::tempdir().unwrap();
    let path = write_file(dir.path(), "main.jsonnet", "{}");
    let stderr = failure_stderr(
        dsonnet
            .arg("eval")
            .arg(&path)
            .args(["--data-source", "exec:replay?configVar=cfg"]),
    );
    assert!(
        stderr.contains("did you forget the '//' after the ':'"),
        "unexpected stderr: {stderr}"
    );
}

#[rstest]
fn test_eval_missing_file(mut dsonnet: Command) {
    let stderr =
        failure_stderr(dsonnet.arg("eval").arg("/no/such/file.jsonnet"));
    assert!(
        stderr.contains("file not found: /no/such/file.jsonnet"),
        "unexpected stderr: {stderr}"
    );
}

#[rstest]
fn test_lint_ok(mut dsonnet: Command) {
    let dir = tempfile::tempdir().unwrap();
    let path = write_file(dir.path(), "main.jsonnet", "{a: 1}");
    dsonnet.arg("lint").arg(&path).assert().success();
}

#[rstest]
fn test_lint_failure(mut dsonnet: Command) {
    let dir = tempfile::tempdir().unwrap();
    let path = write_file(dir.path(), "broken.jsonnet", "{a: ");
    let stderr = failure_stderr(dsonnet.arg("lint").arg(&path));
    assert!(
        stderr.contains("broken.jsonnet"),
        "unexpected stderr: {stderr}"
    );
}
