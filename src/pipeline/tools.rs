// External tool adapter: ffprobe, ffmpeg and yt-dlp behind one contract
//
// {tool_name, arguments, timeout} -> {exit_code, stdout, stderr}

use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::io::AsyncReadExt;
use tokio::process::Command as TokioCommand;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::config::ToolsConfig;
use super::errors::{PipelineError, Result};

/// One external tool call
#[derive(Debug, Clone, PartialEq)]
pub struct ToolInvocation {
    pub tool_name: String,
    pub arguments: Vec<String>,
    pub timeout: Duration,
}

impl ToolInvocation {
    pub fn new(tool_name: impl Into<String>, arguments: Vec<String>, timeout: Duration) -> Self {
        Self {
            tool_name: tool_name.into(),
            arguments,
            timeout,
        }
    }
}

/// Captured result of a finished tool
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ToolOutput {
    /// `None` when the process was killed by a signal
    pub exit_code: Option<i32>,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
}

impl ToolOutput {
    pub fn success(&self) -> bool {
        self.exit_code == Some(0)
    }

    pub fn stdout_lossy(&self) -> String {
        String::from_utf8_lossy(&self.stdout).to_string()
    }

    pub fn stderr_lossy(&self) -> String {
        String::from_utf8_lossy(&self.stderr).to_string()
    }

    /// Last non-empty stderr lines, for error messages
    pub fn stderr_tail(&self, lines: usize) -> String {
        let stderr = self.stderr_lossy();
        let tail: Vec<&str> = stderr
            .lines()
            .filter(|l| !l.trim().is_empty())
            .collect();
        tail[tail.len().saturating_sub(lines)..].join("\n")
    }
}

/// Runs external tools; faked in tests
#[async_trait]
pub trait ToolRunner: Send + Sync {
    async fn run(&self, invocation: ToolInvocation, cancel: &CancellationToken) -> Result<ToolOutput>;
}

/// Spawns real subprocesses through tokio
#[derive(Debug, Clone, Default)]
pub struct ProcessToolRunner;

impl ProcessToolRunner {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl ToolRunner for ProcessToolRunner {
    async fn run(&self, invocation: ToolInvocation, cancel: &CancellationToken) -> Result<ToolOutput> {
        let ToolInvocation {
            tool_name,
            arguments,
            timeout,
        } = invocation;

        debug!(tool = %tool_name, args = ?arguments, "spawning tool");

        let mut child = TokioCommand::new(&tool_name)
            .args(&arguments)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| match e.kind() {
                std::io::ErrorKind::NotFound => PipelineError::ToolNotFound {
                    tool: tool_name.clone(),
                },
                _ => PipelineError::tool_failed(&tool_name, format!("failed to start: {}", e)),
            })?;

        let mut stdout_pipe = child
            .stdout
            .take()
            .ok_or_else(|| PipelineError::tool_failed(&tool_name, "failed to capture stdout"))?;
        let mut stderr_pipe = child
            .stderr
            .take()
            .ok_or_else(|| PipelineError::tool_failed(&tool_name, "failed to capture stderr"))?;

        let stdout_task = tokio::spawn(async move {
            let mut buf = Vec::new();
            stdout_pipe.read_to_end(&mut buf).await.map(|_| buf)
        });
        let stderr_task = tokio::spawn(async move {
            let mut buf = Vec::new();
            stderr_pipe.read_to_end(&mut buf).await.map(|_| buf)
        });

        let status = tokio::select! {
            waited = tokio::time::timeout(timeout, child.wait()) => match waited {
                Ok(status) => status?,
                Err(_) => {
                    warn!(tool = %tool_name, timeout_secs = timeout.as_secs(), "tool timed out, killing");
                    let _ = child.kill().await;
                    stdout_task.abort();
                    stderr_task.abort();
                    return Err(PipelineError::ToolTimeout {
                        tool: tool_name,
                        timeout_secs: timeout.as_secs(),
                    });
                }
            },
            _ = cancel.cancelled() => {
                debug!(tool = %tool_name, "cancelled, killing tool");
                let _ = child.kill().await;
                stdout_task.abort();
                stderr_task.abort();
                return Err(PipelineError::Cancelled);
            }
        };

        let join_err = |e: tokio::task::JoinError| PipelineError::tool_failed(&tool_name, e.to_string());
        let stdout = stdout_task.await.map_err(join_err)??;
        let stderr = stderr_task.await.map_err(join_err)??;

        Ok(ToolOutput {
            exit_code: status.code(),
            stdout,
            stderr,
        })
    }
}

/// Availability of one external tool
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolInfo {
    pub name: String,
    pub path: Option<PathBuf>,
    pub version: Option<String>,
    pub is_available: bool,
}

/// Look up a tool on PATH (or at an explicit path) and read its version line
pub fn detect_tool(binary: &str, version_arg: &str) -> ToolInfo {
    let path = which::which(binary).ok();

    let version = path.as_ref().and_then(|p| {
        std::process::Command::new(p)
            .arg(version_arg)
            .output()
            .ok()
            .filter(|out| out.status.success())
            .and_then(|out| {
                String::from_utf8_lossy(&out.stdout)
                    .lines()
                    .next()
                    .map(|l| l.trim().to_string())
            })
    });

    ToolInfo {
        name: binary.to_string(),
        is_available: path.is_some(),
        path,
        version,
    }
}

/// Availability report for every tool the pipeline may call
pub fn check_tools(config: &ToolsConfig) -> Vec<ToolInfo> {
    vec![
        detect_tool(&config.ffprobe, "-version"),
        detect_tool(&config.ffmpeg, "-version"),
        detect_tool(&config.ytdlp, "--version"),
    ]
}
