//! Data source driver that resolves every path by running a child process.
//! Each `resolve` spawns a fresh child, so concurrent resolution needs no
//! coordination here.

use crate::sources::{ConfigProvider, DataSource, ManagedDataSource};
use anyhow::{anyhow, bail, Context};
use indexmap::IndexMap;
use log::{debug, info};
use serde::Deserialize;
use std::{
    env,
    io::Write,
    path::{Path, PathBuf},
    process::{Command, Stdio},
    sync::{mpsc, Arc, OnceLock},
    thread,
    time::Duration,
};

/// Name of the data source, exposed to the child
const ENV_SOURCE_NAME: &str = "__DS_NAME__";
/// Path being resolved, exposed to the child
const ENV_SOURCE_PATH: &str = "__DS_PATH__";

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(60);

/// Driver configuration, read from the user's config variable as JSON
#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ExecConfig {
    /// Program to run for each resolution
    command: String,
    #[serde(default)]
    args: Vec<String>,
    /// Extra environment for the child. Applied after the inherited
    /// environment, so these entries win.
    #[serde(default)]
    env: IndexMap<String, String>,
    /// Passed verbatim to the child on every invocation
    #[serde(default)]
    stdin: String,
    /// Per-resolution deadline, e.g. "500ms" or "2m"
    #[serde(default, with = "humantime_serde")]
    timeout: Option<Duration>,
    /// Whether the child sees the parent's environment
    #[serde(default)]
    inherit_env: bool,
}

/// Validated configuration: the command has been resolved to an executable
#[derive(Clone, Debug)]
struct ResolvedConfig {
    program: PathBuf,
    config: ExecConfig,
}

pub struct ExecSource {
    name: String,
    var_name: String,
    resolved: OnceLock<ResolvedConfig>,
}

impl ExecSource {
    pub fn new(name: &str, var_name: &str) -> Self {
        Self {
            name: name.to_owned(),
            var_name: var_name.to_owned(),
            resolved: OnceLock::new(),
        }
    }
}

impl DataSource for ExecSource {
    fn name(&self) -> &str {
        &self.name
    }

    fn resolve(&self, path: &str) -> anyhow::Result<String> {
        let resolved = self
            .resolved
            .get()
            .ok_or_else(|| anyhow!("data source {} not initialized", self.name))?;
        let config = &resolved.config;

        let mut command = Command::new(&resolved.program);
        command
            .args(&config.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            // Forward stderr to the user, in case something goes wrong
            .stderr(Stdio::inherit());
        if !config.inherit_env {
            command.env_clear();
        }
        command
            .envs(&config.env)
            .env(ENV_SOURCE_NAME, &self.name)
            .env(ENV_SOURCE_PATH, path);

        debug!(
            "Data source {}: running {} for path {path}",
            self.name, config.command
        );
        let mut child = command
            .spawn()
            .with_context(|| format!("error running {}", config.command))?;
        // A child that exits without reading its stdin is reported through
        // its exit status, not as a pipe error here
        if let Err(error) = child
            .stdin
            .take()
            .expect("child stdin is piped")
            .write_all(config.stdin.as_bytes())
        {
            if error.kind() != std::io::ErrorKind::BrokenPipe {
                return Err(error).with_context(|| {
                    format!("error writing stdin to {}", config.command)
                });
            }
        }

        // Watchdog: kill the child when the deadline passes. The channel
        // doubles as the all-clear signal once the child has exited.
        let timeout = config.timeout.unwrap_or(DEFAULT_TIMEOUT);
        let pid = child.id();
        let (done_tx, done_rx) = mpsc::channel::<()>();
        thread::spawn(move || {
            if done_rx.recv_timeout(timeout).is_err() {
                debug!("Killing child {pid} after {timeout:?}");
                kill_process(pid);
            }
        });

        let output = child.wait_with_output();
        let _ = done_tx.send(());
        let output = output
            .with_context(|| format!("error waiting for {}", config.command))?;

        if output.status.success() {
            String::from_utf8(output.stdout).with_context(|| {
                format!("error decoding output of {}", config.command)
            })
        } else {
            Err(anyhow!("{} failed: {}", config.command, output.status))
        }
    }
}

impl ManagedDataSource for ExecSource {
    fn init(&self, provider: Arc<dyn ConfigProvider>) -> anyhow::Result<()> {
        let raw = provider.config(&self.var_name).with_context(|| {
            format!(
                "data source {}: error reading config from variable {}",
                self.name, self.var_name
            )
        })?;
        let config: ExecConfig = serde_json::from_str(&raw).with_context(|| {
            format!("data source {}: invalid config document", self.name)
        })?;
        let program = resolve_command(&config.command).with_context(|| {
            format!("data source {}: invalid command", self.name)
        })?;
        info!(
            "Data source {} will run {} (from {})",
            self.name,
            program.display(),
            config.command
        );
        let _ = self.resolved.set(ResolvedConfig { program, config });
        Ok(())
    }

    fn close(&self) -> anyhow::Result<()> {
        Ok(())
    }
}

/// Find the executable for a command. The literal path is tried first,
/// relative to the current directory, which makes the search behave as if
/// PATH always had `.` prepended; then the regular PATH search runs.
fn resolve_command(command: &str) -> anyhow::Result<PathBuf> {
    if command.is_empty() {
        bail!("command must be specified");
    }
    let direct = PathBuf::from(command);
    if is_executable(&direct) {
        return Ok(direct);
    }
    if let Some(paths) = env::var_os("PATH") {
        for dir in env::split_paths(&paths) {
            let candidate = dir.join(command);
            if is_executable(&candidate) {
                return Ok(candidate);
            }
        }
    }
    bail!("command '{command}' not found or not executable")
}

#[cfg(unix)]
fn is_executable(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;
    path.metadata()
        .map(|meta| meta.is_file() && meta.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

#[cfg(not(unix))]
fn is_executable(path: &Path) -> bool {
    path.is_file()
}

#[cfg(unix)]
fn kill_process(pid: u32) {
    // SAFETY: plain syscall; worst case the pid is already gone
    unsafe {
        libc::kill(pid as i32, libc::SIGKILL);
    }
}

#[cfg(not(unix))]
fn kill_process(_pid: u32) {}
