use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::time::Instant;

use crate::config::EngineConfig;
use crate::engine::endpoint::extract_endpoint;
use crate::engine::{Engine, EngineLauncher, LaunchOptions};
use crate::error::{Result, WorkerError};

/// Launches the automation engine as a child process.
///
/// The engine is started as
/// `<command> <args...> --port <port> --path <path> [--headless]` and is
/// considered ready once it prints a line containing a `ws://`, `wss://`,
/// `http://` or `https://` URI. Everything it prints is forwarded to
/// `tracing` at debug level.
#[derive(Debug, Clone)]
pub struct ProcessLauncher {
    config: EngineConfig,
}

impl ProcessLauncher {
    pub fn new(config: EngineConfig) -> Self {
        Self { config }
    }

    fn build_args(&self, options: &LaunchOptions) -> Vec<String> {
        let mut args = self.config.args.clone();

        args.push("--port".to_string());
        args.push(options.port.to_string());
        args.push("--path".to_string());
        args.push(options.path.clone());
        if options.headless {
            args.push("--headless".to_string());
        }

        args
    }
}

#[async_trait]
impl EngineLauncher for ProcessLauncher {
    async fn launch(&self, options: &LaunchOptions) -> Result<Box<dyn Engine>> {
        let args = self.build_args(options);
        tracing::info!(
            command = %self.config.command,
            args = ?args,
            port = options.port,
            headless = options.headless,
            "Launching engine"
        );

        let mut child = Command::new(&self.config.command)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                WorkerError::EngineLaunch(format!(
                    "failed to spawn {}: {}",
                    self.config.command, e
                ))
            })?;

        let pid = child.id();
        let stdout = child.stdout.take().ok_or_else(|| {
            WorkerError::EngineLaunch("engine stdout was not captured".to_string())
        })?;
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(forward_output(stderr, pid, "stderr"));
        }

        let deadline = Instant::now() + self.config.startup_timeout();
        let mut lines = BufReader::new(stdout).lines();
        let discovered = tokio::time::timeout_at(deadline, async {
            while let Some(line) = lines.next_line().await? {
                tracing::debug!(pid, stream = "stdout", line = %line, "engine output");
                if let Some(endpoint) = extract_endpoint(&line) {
                    return Ok(Some(endpoint.to_string()));
                }
            }
            Ok::<_, std::io::Error>(None)
        })
        .await;

        let endpoint = match discovered {
            Ok(Ok(Some(endpoint))) => endpoint,
            Ok(Ok(None)) => {
                // stdout is closed, but the process may still be running
                return match tokio::time::timeout_at(deadline, child.wait()).await {
                    Ok(Ok(status)) => Err(WorkerError::EngineLaunch(format!(
                        "engine exited with {} before advertising an endpoint",
                        status
                    ))),
                    Ok(Err(e)) => {
                        kill_child(&mut child, pid).await;
                        Err(WorkerError::EngineLaunch(format!(
                            "failed waiting for engine: {}",
                            e
                        )))
                    }
                    Err(_) => {
                        kill_child(&mut child, pid).await;
                        Err(WorkerError::EngineLaunch(format!(
                            "engine closed its output and did not advertise an endpoint within {}ms",
                            self.config.startup_timeout_ms
                        )))
                    }
                };
            }
            Ok(Err(e)) => {
                kill_child(&mut child, pid).await;
                return Err(WorkerError::EngineLaunch(format!(
                    "failed reading engine output: {}",
                    e
                )));
            }
            Err(_) => {
                kill_child(&mut child, pid).await;
                return Err(WorkerError::EngineLaunch(format!(
                    "engine did not advertise an endpoint within {}ms",
                    self.config.startup_timeout_ms
                )));
            }
        };

        tokio::spawn(async move {
            while let Ok(Some(line)) = lines.next_line().await {
                tracing::debug!(pid, stream = "stdout", line = %line, "engine output");
            }
        });

        tracing::info!(pid, endpoint = %endpoint, "Engine listening");

        Ok(Box::new(ProcessEngine {
            child,
            endpoint,
            close_grace: self.config.close_grace(),
        }))
    }
}

/// Kill an engine that failed to start; failures are logged.
async fn kill_child(child: &mut Child, pid: Option<u32>) {
    if let Err(e) = child.kill().await {
        tracing::warn!(pid, error = %e, "Failed to kill engine after failed launch");
    }
}

async fn forward_output<R>(stream: R, pid: Option<u32>, name: &'static str)
where
    R: AsyncRead + Unpin,
{
    let mut lines = BufReader::new(stream).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        tracing::debug!(pid, stream = name, line = %line, "engine output");
    }
}

/// A running engine child process.
#[derive(Debug)]
pub struct ProcessEngine {
    child: Child,
    endpoint: String,
    close_grace: Duration,
}

#[async_trait]
impl Engine for ProcessEngine {
    fn endpoint(&self) -> &str {
        &self.endpoint
    }

    /// SIGTERM, then wait up to the grace period before killing.
    async fn close(&mut self) -> Result<()> {
        if let Some(status) = self.child.try_wait()? {
            tracing::info!(status = %status, "Engine already exited");
            return Ok(());
        }

        let Some(pid) = self.child.id() else {
            return Ok(());
        };

        if let Err(e) = kill(Pid::from_raw(pid as i32), Signal::SIGTERM) {
            tracing::warn!(pid, error = %e, "Failed to send SIGTERM to engine, killing");
            self.child
                .kill()
                .await
                .map_err(|e| WorkerError::EngineClose(e.to_string()))?;
            return Ok(());
        }

        match tokio::time::timeout(self.close_grace, self.child.wait()).await {
            Ok(Ok(status)) => {
                tracing::info!(pid, status = %status, "Engine closed");
                Ok(())
            }
            Ok(Err(e)) => Err(WorkerError::EngineClose(e.to_string())),
            Err(_) => {
                tracing::warn!(
                    pid,
                    grace_ms = self.close_grace.as_millis() as u64,
                    "Engine ignored SIGTERM, killing"
                );
                self.child
                    .kill()
                    .await
                    .map_err(|e| WorkerError::EngineClose(e.to_string()))
            }
        }
    }
}
