//! Data source driver backed by a long-running child HTTP server. The child
//! is launched once, told which local port to bind, probed for readiness,
//! and then queried once per resolution. Concurrency is the child's
//! problem; the shared HTTP agent is thread-safe.

use crate::sources::{ConfigProvider, DataSource, ManagedDataSource};
use anyhow::{anyhow, bail, Context};
use log::{debug, info, warn};
use serde::Deserialize;
use std::{
    io::Write,
    net::TcpListener,
    process::{Child, Command, Stdio},
    sync::{Arc, Mutex, OnceLock},
    thread,
    time::{Duration, Instant},
};
use tempfile::TempDir;
use ureq::Agent;

/// Environment passed to the child server
const ENV_RUNNER: &str = "DATA_SOURCE_RUNNER";
const ENV_NAME: &str = "DATA_SOURCE_NAME";
const ENV_PORT: &str = "DATA_SOURCE_PORT";

const DEFAULT_PING_PATH: &str = "/ping";
const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_millis(100);
const DEFAULT_INIT_TIMEOUT: Duration = Duration::from_secs(10);
const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(1);

/// How often to probe the ping endpoint while starting
const PROBE_INTERVAL: Duration = Duration::from_millis(200);
/// Grace period between SIGINT and SIGKILL at shutdown
const SHUTDOWN_GRACE: Duration = Duration::from_secs(2);
/// Error response bodies are truncated to this many bytes
const BODY_SNIPPET_LEN: usize = 256;

#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct HttpConfig {
    /// Server program to launch once
    executable: String,
    #[serde(default)]
    args: Vec<String>,
    /// Readiness endpoint, expected to return 200 once serving
    #[serde(default)]
    ping_path: Option<String>,
    #[serde(default, with = "humantime_serde")]
    connect_timeout: Option<Duration>,
    #[serde(default, with = "humantime_serde")]
    init_timeout: Option<Duration>,
    #[serde(default, with = "humantime_serde")]
    request_timeout: Option<Duration>,
}

/// Lifecycle of the child server. Only `Ready` accepts resolutions;
/// `Failed` is terminal.
enum ServerState {
    Unstarted,
    Starting,
    Ready(Server),
    Failed,
    Closed,
}

impl ServerState {
    fn describe(&self) -> &'static str {
        match self {
            Self::Unstarted => "unstarted",
            Self::Starting => "starting",
            Self::Ready(_) => "ready",
            Self::Failed => "failed",
            Self::Closed => "closed",
        }
    }
}

/// A running child server and the scratch state it owns
struct Server {
    child: Child,
    /// Removed on drop, after the child is gone
    _scratch: TempDir,
}

/// Connection details, immutable once the server is ready
struct Endpoint {
    port: u16,
    agent: Agent,
}

pub struct ExecHttpSource {
    name: String,
    var_name: String,
    state: Mutex<ServerState>,
    endpoint: OnceLock<Endpoint>,
}

impl ExecHttpSource {
    pub fn new(name: &str, var_name: &str) -> Self {
        Self {
            name: name.to_owned(),
            var_name: var_name.to_owned(),
            state: Mutex::new(ServerState::Unstarted),
            endpoint: OnceLock::new(),
        }
    }

    /// Launch the child and wait for it to become ready
    fn start(
        &self,
        provider: &dyn ConfigProvider,
    ) -> anyhow::Result<(Server, Endpoint)> {
        let raw = provider.config(&self.var_name).with_context(|| {
            format!(
                "data source {}: error reading config from variable {}",
                self.name, self.var_name
            )
        })?;
        let config: HttpConfig = serde_json::from_str(&raw).with_context(|| {
            format!("data source {}: invalid config document", self.name)
        })?;
        let connect_timeout =
            config.connect_timeout.unwrap_or(DEFAULT_CONNECT_TIMEOUT);
        let init_timeout = config.init_timeout.unwrap_or(DEFAULT_INIT_TIMEOUT);
        let request_timeout =
            config.request_timeout.unwrap_or(DEFAULT_REQUEST_TIMEOUT);
        let ping_path = config
            .ping_path
            .clone()
            .unwrap_or_else(|| DEFAULT_PING_PATH.to_owned());

        let scratch = tempfile::Builder::new()
            .prefix("dsonnet-source-")
            .tempdir()
            .context("error creating scratch directory")?;
        let port = free_port()?;
        let variables = provider.variables_json()?;

        let runner = std::env::current_exe()
            .map(|path| path.display().to_string())
            .unwrap_or_default();
        info!(
            "Data source {}: starting {} on port {port}",
            self.name, config.executable
        );
        let mut child = Command::new(&config.executable)
            .args(&config.args)
            .env(ENV_RUNNER, runner)
            .env(ENV_NAME, &self.name)
            .env(ENV_PORT, port.to_string())
            .env("TMPDIR", scratch.path())
            .stdin(Stdio::piped())
            .stderr(Stdio::inherit())
            .spawn()
            .with_context(|| format!("error running {}", config.executable))?;
        // A server that doesn't care about the variable snapshot may close
        // stdin without reading; that's not an error
        if let Err(error) = child
            .stdin
            .take()
            .expect("child stdin is piped")
            .write_all(variables.as_bytes())
        {
            if error.kind() != std::io::ErrorKind::BrokenPipe {
                return Err(error).with_context(|| {
                    format!("error writing variables to {}", config.executable)
                });
            }
        }

        let ping_agent = agent(connect_timeout, connect_timeout);
        let ping_url = format!("http://127.0.0.1:{port}{ping_path}");
        let deadline = Instant::now() + init_timeout;
        loop {
            if matches!(ping_agent.get(&ping_url).call(), Ok(response) if response.status().as_u16() == 200)
            {
                debug!("Data source {} is ready", self.name);
                break;
            }
            if let Ok(Some(status)) = child.try_wait() {
                bail!(
                    "data source {}: server exited before becoming ready: {status}",
                    self.name
                );
            }
            if Instant::now() >= deadline {
                shutdown_child(&mut child);
                bail!(
                    "data source {}: server did not respond to {ping_path} \
                     within {init_timeout:?}",
                    self.name
                );
            }
            thread::sleep(PROBE_INTERVAL);
        }

        Ok((
            Server {
                child,
                _scratch: scratch,
            },
            Endpoint {
                port,
                agent: agent(connect_timeout, request_timeout),
            },
        ))
    }
}

impl DataSource for ExecHttpSource {
    fn name(&self) -> &str {
        &self.name
    }

    fn resolve(&self, path: &str) -> anyhow::Result<String> {
        {
            let state = self.state.lock().expect("server state lock");
            if !matches!(*state, ServerState::Ready(_)) {
                bail!(
                    "data source {} is not ready (state: {})",
                    self.name,
                    state.describe()
                );
            }
        }
        let endpoint = self
            .endpoint
            .get()
            .ok_or_else(|| anyhow!("data source {} has no endpoint", self.name))?;

        let url = format!("http://127.0.0.1:{}{}", endpoint.port, path);
        debug!("Data source {}: GET {url}", self.name);
        let response = endpoint
            .agent
            .get(&url)
            .call()
            .with_context(|| format!("GET {path}"))?;
        let status = response.status().as_u16();
        let body = response
            .into_body()
            .read_to_string()
            .with_context(|| format!("GET {path}: error reading response"))?;
        if status != 200 {
            bail!("GET {path} returned {status} (body={})", snippet(&body));
        }
        Ok(body)
    }
}

impl ManagedDataSource for ExecHttpSource {
    fn init(&self, provider: Arc<dyn ConfigProvider>) -> anyhow::Result<()> {
        let mut state = self.state.lock().expect("server state lock");
        if !matches!(*state, ServerState::Unstarted) {
            bail!(
                "data source {} started twice (state: {})",
                self.name,
                state.describe()
            );
        }
        *state = ServerState::Starting;
        match self.start(provider.as_ref()) {
            Ok((server, endpoint)) => {
                let _ = self.endpoint.set(endpoint);
                *state = ServerState::Ready(server);
                Ok(())
            }
            Err(error) => {
                *state = ServerState::Failed;
                Err(error)
            }
        }
    }

    fn close(&self) -> anyhow::Result<()> {
        let mut state = self.state.lock().expect("server state lock");
        if let ServerState::Ready(server) =
            std::mem::replace(&mut *state, ServerState::Closed)
        {
            let Server { mut child, _scratch } = server;
            info!("Data source {}: stopping server", self.name);
            shutdown_child(&mut child);
        }
        Ok(())
    }
}

/// Build an agent with the given timeouts. Error statuses are reported as
/// plain responses so bodies stay readable.
fn agent(connect_timeout: Duration, request_timeout: Duration) -> Agent {
    Agent::config_builder()
        .timeout_connect(Some(connect_timeout))
        .timeout_global(Some(request_timeout))
        .http_status_as_error(false)
        .build()
        .new_agent()
}

/// Ask the kernel for an unused local port. The listener is dropped before
/// the child binds; the window in between is small enough in practice.
fn free_port() -> anyhow::Result<u16> {
    let listener = TcpListener::bind("127.0.0.1:0")
        .context("error allocating local port")?;
    Ok(listener.local_addr()?.port())
}

/// Interrupt the child, giving it a grace period before the hard kill
fn shutdown_child(child: &mut Child) {
    #[cfg(unix)]
    {
        // SAFETY: plain syscall; worst case the pid is already gone
        unsafe {
            libc::kill(child.id() as i32, libc::SIGINT);
        }
        let deadline = Instant::now() + SHUTDOWN_GRACE;
        while Instant::now() < deadline {
            match child.try_wait() {
                Ok(Some(_)) => return,
                Ok(None) => thread::sleep(Duration::from_millis(50)),
                Err(error) => {
                    warn!("Error waiting for child: {error}");
                    break;
                }
            }
        }
    }
    if let Err(error) = child.kill() {
        warn!("Error killing child: {error}");
    }
    let _ = child.wait();
}

/// Truncate an error response body for display
fn snippet(body: &str) -> String {
    if body.len() > BODY_SNIPPET_LEN {
        let mut end = BODY_SNIPPET_LEN;
        while !body.is_char_boundary(end) {
            end -= 1;
        }
        format!("{}...", &body[..end])
    } else {
        body.to_owned()
    }
}
