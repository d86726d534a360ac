//! The subprocess driver abstraction.
//!
//! Both the FFProbe adapter and the encode stage's `ffmpeg`/`mkvextract`
//! invocations go through [`ProcessRunner`] instead of calling
//! `tokio::process::Command` directly, so they can be driven against a
//! scripted [`FakeProcessRunner`] in unit tests.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

#[derive(Debug, Error)]
pub enum ProcessError {
    #[error("failed to spawn {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("{program} exited with status {code:?}, accepted codes were {accepted:?}")]
    UnacceptedExit {
        program: String,
        code: Option<i32>,
        accepted: Vec<i32>,
    },

    #[error("{program} was cancelled")]
    Cancelled { program: String },

    #[error("io error driving {program}: {source}")]
    Io {
        program: String,
        #[source]
        source: std::io::Error,
    },
}

/// A line sink used to collect or forward stdout/stderr output.
pub type LineSink = Arc<dyn Fn(&str) + Send + Sync>;

/// A single subprocess invocation request.
pub struct RunRequest {
    pub program: String,
    pub args: Vec<String>,
    pub cwd: Option<PathBuf>,
    pub env: HashMap<String, String>,
    pub stdout_sink: Option<LineSink>,
    pub stderr_sink: Option<LineSink>,
    pub cancellation: CancellationToken,
    pub accepted_exit_codes: Vec<i32>,
}

impl RunRequest {
    pub fn new(program: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
            cwd: None,
            env: HashMap::new(),
            stdout_sink: None,
            stderr_sink: None,
            cancellation: CancellationToken::new(),
            accepted_exit_codes: vec![0],
        }
    }

    pub fn with_cwd(mut self, cwd: PathBuf) -> Self {
        self.cwd = Some(cwd);
        self
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    pub fn with_stdout_sink(mut self, sink: LineSink) -> Self {
        self.stdout_sink = Some(sink);
        self
    }

    pub fn with_stderr_sink(mut self, sink: LineSink) -> Self {
        self.stderr_sink = Some(sink);
        self
    }

    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancellation = token;
        self
    }

    pub fn with_accepted_exit_codes(mut self, codes: Vec<i32>) -> Self {
        self.accepted_exit_codes = codes;
        self
    }
}

#[derive(Debug, Clone)]
pub struct RunOutcome {
    pub exit_code: Option<i32>,
}

#[async_trait]
pub trait ProcessRunner: Send + Sync {
    async fn run(&self, request: RunRequest) -> Result<RunOutcome, ProcessError>;
}

/// Drives real child processes via `tokio::process::Command`, the way the
/// reference transcoding worker drives `ffmpeg`: spawn, stream stderr
/// line-by-line into a sink, wait, then check the exit status.
#[derive(Debug, Default)]
pub struct TokioProcessRunner;

impl TokioProcessRunner {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl ProcessRunner for TokioProcessRunner {
    async fn run(&self, request: RunRequest) -> Result<RunOutcome, ProcessError> {
        let mut cmd = Command::new(&request.program);
        cmd.args(&request.args);
        if let Some(cwd) = &request.cwd {
            cmd.current_dir(cwd);
        }
        for (key, value) in &request.env {
            cmd.env(key, value);
        }
        cmd.stdout(std::process::Stdio::piped());
        cmd.stderr(std::process::Stdio::piped());

        let mut child = cmd.spawn().map_err(|source| ProcessError::Spawn {
            program: request.program.clone(),
            source,
        })?;

        let stdout = child.stdout.take();
        let stderr = child.stderr.take();

        let stdout_sink = request.stdout_sink.clone();
        let stdout_task = stdout.map(|pipe| {
            tokio::spawn(async move {
                let mut lines = BufReader::new(pipe).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    if let Some(sink) = &stdout_sink {
                        sink(&line);
                    }
                }
            })
        });

        let stderr_sink = request.stderr_sink.clone();
        let stderr_task = stderr.map(|pipe| {
            tokio::spawn(async move {
                let mut lines = BufReader::new(pipe).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    if let Some(sink) = &stderr_sink {
                        sink(&line);
                    }
                }
            })
        });

        let wait_result = tokio::select! {
            status = child.wait() => Some(status),
            _ = request.cancellation.cancelled() => {
                warn!("cancellation observed, killing {}", request.program);
                let _ = child.start_kill();
                let _ = child.wait().await;
                None
            }
        };

        if let Some(task) = stdout_task {
            let _ = task.await;
        }
        if let Some(task) = stderr_task {
            let _ = task.await;
        }

        let Some(status) = wait_result else {
            return Err(ProcessError::Cancelled {
                program: request.program,
            });
        };

        let status = status.map_err(|source| ProcessError::Io {
            program: request.program.clone(),
            source,
        })?;

        let code = status.code();
        let accepted = code.is_some_and(|c| request.accepted_exit_codes.contains(&c));
        if !accepted {
            return Err(ProcessError::UnacceptedExit {
                program: request.program,
                code,
                accepted: request.accepted_exit_codes,
            });
        }

        debug!(program = %request.program, ?code, "process completed");
        Ok(RunOutcome { exit_code: code })
    }
}

/// A scripted subprocess double for unit tests: replays canned stdout/stderr
/// lines through the request's sinks and returns a fixed exit code.
pub struct FakeProcessRunner {
    pub stdout_lines: Vec<String>,
    pub stderr_lines: Vec<String>,
    pub exit_code: i32,
}

impl FakeProcessRunner {
    pub fn new(exit_code: i32) -> Self {
        Self {
            stdout_lines: Vec::new(),
            stderr_lines: Vec::new(),
            exit_code,
        }
    }

    pub fn with_stdout(mut self, lines: Vec<String>) -> Self {
        self.stdout_lines = lines;
        self
    }

    pub fn with_stderr(mut self, lines: Vec<String>) -> Self {
        self.stderr_lines = lines;
        self
    }
}

#[async_trait]
impl ProcessRunner for FakeProcessRunner {
    async fn run(&self, request: RunRequest) -> Result<RunOutcome, ProcessError> {
        if let Some(sink) = &request.stdout_sink {
            for line in &self.stdout_lines {
                sink(line);
            }
        }
        if let Some(sink) = &request.stderr_sink {
            for line in &self.stderr_lines {
                sink(line);
            }
        }

        if request.accepted_exit_codes.contains(&self.exit_code) {
            Ok(RunOutcome {
                exit_code: Some(self.exit_code),
            })
        } else {
            Err(ProcessError::UnacceptedExit {
                program: request.program,
                code: Some(self.exit_code),
                accepted: request.accepted_exit_codes,
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[tokio::test]
    async fn fake_runner_replays_scripted_lines() {
        let runner = FakeProcessRunner::new(0).with_stderr(vec![
            "frame=  100 fps=30 time=00:00:04.00 speed=1.0x".to_string(),
        ]);
        let collected = Arc::new(Mutex::new(Vec::new()));
        let collected_clone = collected.clone();
        let sink: LineSink = Arc::new(move |line| collected_clone.lock().unwrap().push(line.to_string()));

        let request = RunRequest::new("ffmpeg", vec!["-version".to_string()]).with_stderr_sink(sink);
        let outcome = runner.run(request).await.unwrap();

        assert_eq!(outcome.exit_code, Some(0));
        assert_eq!(collected.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn fake_runner_rejects_exit_code_not_in_accepted_set() {
        let runner = FakeProcessRunner::new(2);
        let request = RunRequest::new("mkvextract", vec![]).with_accepted_exit_codes(vec![0, 1]);
        let err = runner.run(request).await.unwrap_err();
        assert!(matches!(err, ProcessError::UnacceptedExit { code: Some(2), .. }));
    }
}
