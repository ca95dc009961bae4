//! The embedded shell executor: runs the configured command in a child
//! process, streaming combined output through the status helper.
//!
//! Configuration keys:
//! - `command` (required): what to run.
//! - `shell`: `"true"` (default) runs through `sh -c`, `"false"` splits
//!   the command into an argv.
//! - `env`: comma-separated `KEY=value` pairs added to the environment.
//! - `cwd`: working directory.
//! - `timeout`: Go-style duration after which the child is killed.

use std::process::Stdio;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;

use crate::extcron::parse_go_duration;
use crate::plugins::executor::{Executor, StatusHelper};
use crate::plugins::PluginError;
use crate::proto;

pub struct ShellExecutor;

#[async_trait]
impl Executor for ShellExecutor {
    async fn execute(
        &self,
        request: proto::ExecuteRequest,
        status: Arc<dyn StatusHelper>,
    ) -> Result<proto::ExecuteResponse, PluginError> {
        let config = &request.config;

        let command_line = config
            .get("command")
            .filter(|c| !c.is_empty())
            .ok_or_else(|| PluginError::Execution("shell: no command configured".to_string()))?;

        let use_shell = config.get("shell").map(String::as_str) != Some("false");
        let mut command = if use_shell {
            let mut c = Command::new("sh");
            c.arg("-c").arg(command_line);
            c
        } else {
            let mut parts = command_line.split_whitespace();
            let program = parts
                .next()
                .ok_or_else(|| PluginError::Execution("shell: empty command".to_string()))?;
            let mut c = Command::new(program);
            c.args(parts);
            c
        };

        if let Some(cwd) = config.get("cwd").filter(|c| !c.is_empty()) {
            command.current_dir(cwd);
        }
        if let Some(env) = config.get("env") {
            for pair in env.split(',').filter(|p| !p.is_empty()) {
                if let Some((key, value)) = pair.split_once('=') {
                    command.env(key, value);
                }
            }
        }

        let timeout = config
            .get("timeout")
            .filter(|t| !t.is_empty())
            .map(|t| parse_go_duration(t))
            .transpose()
            .map_err(|e| PluginError::Execution(e.to_string()))?;

        tracing::info!(job = %request.job_name, command = %command_line, "shell: executing");

        let mut child = command
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| PluginError::Execution(format!("shell: spawn failed: {e}")))?;

        let stdout = child.stdout.take();
        let stderr = child.stderr.take();

        // Stream both pipes through the status helper while collecting the
        // full output for the response.
        let collector = Arc::new(tokio::sync::Mutex::new(Vec::<u8>::new()));
        let mut readers = Vec::new();
        if let Some(stdout) = stdout {
            readers.push(spawn_reader(stdout, status.clone(), collector.clone()));
        }
        if let Some(stderr) = stderr {
            readers.push(spawn_reader(stderr, status.clone(), collector.clone()));
        }

        let exit = match timeout {
            Some(limit) => match tokio::time::timeout(limit, child.wait()).await {
                Ok(result) => result,
                Err(_) => {
                    let _ = child.kill().await;
                    for reader in readers {
                        let _ = reader.await;
                    }
                    return Ok(proto::ExecuteResponse {
                        output: collector.lock().await.clone(),
                        error: format!("shell: execution timed out after {limit:?}"),
                    });
                }
            },
            None => child.wait().await,
        }
        .map_err(|e| PluginError::Execution(format!("shell: wait failed: {e}")))?;

        for reader in readers {
            let _ = reader.await;
        }
        let output = collector.lock().await.clone();

        if exit.success() {
            Ok(proto::ExecuteResponse {
                output,
                error: String::new(),
            })
        } else {
            Ok(proto::ExecuteResponse {
                output,
                error: format!("shell: command exited with {exit}"),
            })
        }
    }
}

fn spawn_reader(
    pipe: impl tokio::io::AsyncRead + Unpin + Send + 'static,
    status: Arc<dyn StatusHelper>,
    collector: Arc<tokio::sync::Mutex<Vec<u8>>>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut lines = BufReader::new(pipe).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            let mut bytes = line.into_bytes();
            bytes.push(b'\n');
            collector.lock().await.extend_from_slice(&bytes);
            if let Err(e) = status.update(bytes, false).await {
                tracing::debug!(error = %e, "shell: status update failed");
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::sync::Mutex;

    struct NullHelper {
        updates: Mutex<usize>,
    }

    #[async_trait]
    impl StatusHelper for NullHelper {
        async fn update(&self, _output: Vec<u8>, _error: bool) -> Result<i64, PluginError> {
            *self.updates.lock().unwrap() += 1;
            Ok(0)
        }
    }

    fn request(config: &[(&str, &str)]) -> proto::ExecuteRequest {
        proto::ExecuteRequest {
            job_name: "test".into(),
            config: config
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect::<HashMap<_, _>>(),
            status_server: 0,
        }
    }

    #[tokio::test]
    async fn test_successful_command_captures_output() {
        let helper = Arc::new(NullHelper {
            updates: Mutex::new(0),
        });
        let response = ShellExecutor
            .execute(request(&[("command", "echo hello")]), helper.clone())
            .await
            .unwrap();

        assert!(response.error.is_empty());
        assert_eq!(String::from_utf8_lossy(&response.output), "hello\n");
        assert_eq!(*helper.updates.lock().unwrap(), 1);
    }

    #[tokio::test]
    async fn test_failing_command_reports_exit() {
        let helper = Arc::new(NullHelper {
            updates: Mutex::new(0),
        });
        let response = ShellExecutor
            .execute(request(&[("command", "exit 3")]), helper)
            .await
            .unwrap();
        assert!(response.error.contains("exited"));
    }

    #[tokio::test]
    async fn test_missing_command_is_an_error() {
        let helper = Arc::new(NullHelper {
            updates: Mutex::new(0),
        });
        let result = ShellExecutor.execute(request(&[]), helper).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_timeout_kills_the_child() {
        let helper = Arc::new(NullHelper {
            updates: Mutex::new(0),
        });
        let started = std::time::Instant::now();
        let response = ShellExecutor
            .execute(
                request(&[("command", "sleep 5"), ("timeout", "200ms")]),
                helper,
            )
            .await
            .unwrap();
        assert!(response.error.contains("timed out"));
        assert!(started.elapsed() < std::time::Duration::from_secs(2));
    }

    #[tokio::test]
    async fn test_env_and_no_shell_mode() {
        let helper = Arc::new(NullHelper {
            updates: Mutex::new(0),
        });
        let response = ShellExecutor
            .execute(
                request(&[("command", "printenv GREETING"), ("env", "GREETING=hola")]),
                helper.clone(),
            )
            .await
            .unwrap();
        assert_eq!(String::from_utf8_lossy(&response.output), "hola\n");

        let response = ShellExecutor
            .execute(request(&[("command", "echo plain"), ("shell", "false")]), helper)
            .await
            .unwrap();
        assert_eq!(String::from_utf8_lossy(&response.output), "plain\n");
    }
}
