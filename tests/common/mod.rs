use assert_cmd::Command;
use rstest::fixture;
use std::{
    fs,
    path::{Path, PathBuf},
};

/// Command to run dsonnet
#[fixture]
pub fn dsonnet() -> Command {
    Command::cargo_bin("dsonnet").unwrap()
}

/// Write a file under the given directory, creating parents as needed
pub fn write_file(dir: &Path, name: &str, contents: &str) -> PathBuf {
    let path = dir.join(name);
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).unwrap();
    }
    fs::write(&path, contents).unwrap();
    path
}

/// Stdout of a successful run, parsed as JSON
pub fn output_json(command: &mut Command) -> serde_json::Value {
    let assert = command.assert().success();
    let stdout = String::from_utf8(assert.get_output().stdout.clone())
        .expect("stdout is UTF-8");
    serde_json::from_str(&stdout).expect("stdout is JSON")
}

/// Stderr of a failed run
pub fn failure_stderr(command: &mut Command) -> String {
    let assert = command.assert().failure();
    String::from_utf8(assert.get_output().stderr.clone())
        .expect("stderr is UTF-8")
}
