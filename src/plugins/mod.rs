//! Out-of-process plugin protocol.
//!
//! Plugins are separate binaries. The host launches them with a magic
//! cookie in the environment; the child binds a loopback TCP port, prints a
//! one-line handshake (`core-version|protocol-version|network|address|
//! protocol`) on stdout and serves its gRPC service there. Executors get a
//! second, host-side channel for streaming status updates back (see
//! [`executor`]). Plugins are started lazily on first use, kept alive and
//! killed on host shutdown.

pub mod executor;
pub mod processor;
pub mod serve;
pub mod shell;

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command};
use tonic::transport::{Channel, Endpoint};

pub use executor::{Executor, StatusHelper};
pub use processor::Processor;

pub const MAGIC_COOKIE_KEY: &str = "CRONMESH_PLUGIN_MAGIC_COOKIE";
pub const MAGIC_COOKIE_VALUE: &str = "0bdf72a63e4bd9cd2e5f5bdb8a3ca736";
pub const PROTOCOL_VERSION: u32 = 1;

/// Default search directory for plugin binaries.
pub const DEFAULT_PLUGIN_DIR: &str = "/etc/cronmesh/plugins";

/// Hidden subcommand the host invokes on itself to serve embedded
/// executors.
pub const EMBEDDED_SUBCOMMAND: &str = "embedded-plugin";

const EXECUTOR_PREFIX: &str = "cronmesh-executor-";
const PROCESSOR_PREFIX: &str = "cronmesh-processor-";

/// Executors compiled into the host binary and served by re-invoking it.
const EMBEDDED_EXECUTORS: &[&str] = &["shell"];

#[derive(Debug, thiserror::Error)]
pub enum PluginError {
    #[error("plugin: bad handshake: {0}")]
    Handshake(String),

    #[error("plugin: magic cookie missing or wrong, run plugins through the host")]
    BadCookie,

    #[error("plugin: io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("plugin: transport error: {0}")]
    Transport(#[from] tonic::transport::Error),

    #[error("plugin: rpc error: {0}")]
    Rpc(#[from] tonic::Status),

    #[error("plugin: execution error: {0}")]
    Execution(String),
}

/// A lazily launched plugin child process with its gRPC channel.
pub struct PluginProcess {
    path: PathBuf,
    args: Vec<String>,
    conn: tokio::sync::Mutex<Option<PluginConn>>,
}

struct PluginConn {
    child: Child,
    channel: Channel,
}

impl PluginProcess {
    pub fn new(path: PathBuf, args: Vec<String>) -> Self {
        Self {
            path,
            args,
            conn: tokio::sync::Mutex::new(None),
        }
    }

    /// The channel to the running plugin, launching it on first use.
    pub async fn channel(&self) -> Result<Channel, PluginError> {
        let mut guard = self.conn.lock().await;
        if let Some(conn) = guard.as_ref() {
            return Ok(conn.channel.clone());
        }

        let conn = launch(&self.path, &self.args).await?;
        let channel = conn.channel.clone();
        *guard = Some(conn);
        Ok(channel)
    }

    pub async fn kill(&self) {
        if let Some(mut conn) = self.conn.lock().await.take() {
            let _ = conn.child.kill().await;
        }
    }
}

async fn launch(path: &Path, args: &[String]) -> Result<PluginConn, PluginError> {
    tracing::debug!(path = %path.display(), ?args, "plugin: launching");

    let mut child = Command::new(path)
        .args(args)
        .env(MAGIC_COOKIE_KEY, MAGIC_COOKIE_VALUE)
        .stdout(std::process::Stdio::piped())
        .stderr(std::process::Stdio::inherit())
        .kill_on_drop(true)
        .spawn()?;

    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| PluginError::Handshake("no stdout".to_string()))?;

    let mut lines = BufReader::new(stdout).lines();
    let line = tokio::time::timeout(Duration::from_secs(10), lines.next_line())
        .await
        .map_err(|_| PluginError::Handshake("timed out waiting for handshake".to_string()))?
        .map_err(PluginError::Io)?
        .ok_or_else(|| PluginError::Handshake("plugin exited before handshake".to_string()))?;

    let addr = parse_handshake(&line)?;

    let channel = Endpoint::from_shared(format!("http://{addr}"))
        .map_err(|e| PluginError::Handshake(e.to_string()))?
        .connect_timeout(Duration::from_secs(5))
        .connect()
        .await?;

    Ok(PluginConn { child, channel })
}

fn parse_handshake(line: &str) -> Result<String, PluginError> {
    let parts: Vec<&str> = line.trim().split('|').collect();
    if parts.len() != 5 {
        return Err(PluginError::Handshake(format!(
            "expected 5 handshake fields, got {line:?}"
        )));
    }
    let version: u32 = parts[1]
        .parse()
        .map_err(|_| PluginError::Handshake(format!("bad protocol version {:?}", parts[1])))?;
    if version != PROTOCOL_VERSION {
        return Err(PluginError::Handshake(format!(
            "unsupported protocol version {version}"
        )));
    }
    if parts[2] != "tcp" {
        return Err(PluginError::Handshake(format!(
            "unsupported network {:?}",
            parts[2]
        )));
    }
    Ok(parts[3].to_string())
}

/// Plugin registry built by discovery; maps plugin names to live clients.
#[derive(Default)]
pub struct Plugins {
    pub executors: HashMap<String, Arc<dyn Executor>>,
    pub processors: HashMap<String, Arc<dyn Processor>>,
    processes: Vec<Arc<PluginProcess>>,
}

impl Plugins {
    /// Locate plugin binaries on disk and register clients for them.
    ///
    /// Search order: the configured plugin directory (default
    /// `/etc/cronmesh/plugins`), then the directory of the host binary;
    /// whichever file is discovered last wins. Embedded executors are
    /// served by the host binary itself through a hidden subcommand.
    pub fn discover(plugin_dir: Option<&Path>) -> Result<Self, PluginError> {
        let mut plugins = Self::default();

        let mut dirs: Vec<PathBuf> = Vec::new();
        dirs.push(
            plugin_dir
                .map(Path::to_path_buf)
                .unwrap_or_else(|| PathBuf::from(DEFAULT_PLUGIN_DIR)),
        );
        let exe = std::env::current_exe()?;
        if let Some(exe_dir) = exe.parent() {
            dirs.push(exe_dir.to_path_buf());
        }

        for dir in dirs {
            for (name, path) in scan_dir(&dir, EXECUTOR_PREFIX) {
                plugins.register_executor(&name, path, Vec::new());
            }
            for (name, path) in scan_dir(&dir, PROCESSOR_PREFIX) {
                plugins.register_processor(&name, path);
            }
        }

        // Embedded executors run in-process; the host can still serve them
        // out-of-process through the hidden subcommand for external tools.
        for name in EMBEDDED_EXECUTORS {
            plugins
                .executors
                .insert(name.to_string(), Arc::new(shell::ShellExecutor));
        }

        tracing::info!(
            executors = plugins.executors.len(),
            processors = plugins.processors.len(),
            "plugin: discovery finished"
        );
        Ok(plugins)
    }

    fn register_executor(&mut self, name: &str, path: PathBuf, args: Vec<String>) {
        let process = Arc::new(PluginProcess::new(path, args));
        self.processes.push(process.clone());
        self.executors.insert(
            name.to_string(),
            Arc::new(executor::ExecutorClient::new(process)),
        );
    }

    fn register_processor(&mut self, name: &str, path: PathBuf) {
        let process = Arc::new(PluginProcess::new(path, Vec::new()));
        self.processes.push(process.clone());
        self.processors.insert(
            name.to_string(),
            Arc::new(processor::ProcessorClient::new(process)),
        );
    }

    /// Kill every running plugin child.
    pub async fn shutdown(&self) {
        for process in &self.processes {
            process.kill().await;
        }
    }
}

fn scan_dir(dir: &Path, prefix: &str) -> Vec<(String, PathBuf)> {
    let Ok(entries) = std::fs::read_dir(dir) else {
        return Vec::new();
    };

    let mut found = Vec::new();
    for entry in entries.flatten() {
        let path = entry.path();
        let Some(file_name) = path.file_name().and_then(|n| n.to_str()) else {
            continue;
        };
        if let Some(name) = plugin_name(file_name, prefix) {
            found.push((name, path));
        }
    }
    found.sort();
    found
}

// `cronmesh-executor-foo` names the plugin "foo"; a Windows `.exe` suffix
// is stripped.
fn plugin_name(file_name: &str, prefix: &str) -> Option<String> {
    let rest = file_name.strip_prefix(prefix)?;
    let name = rest.strip_suffix(".exe").unwrap_or(rest);
    if name.is_empty() {
        None
    } else {
        Some(name.to_string())
    }
}

/// Whether this process was launched by a plugin host.
pub fn launched_by_host() -> bool {
    std::env::var(MAGIC_COOKIE_KEY).map(|v| v == MAGIC_COOKIE_VALUE) == Ok(true)
}
