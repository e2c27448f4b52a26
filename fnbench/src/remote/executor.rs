//! Remote command execution.
//!
//! Everything that leaves the process goes through [`RemoteCommandExecutor`]:
//! CLI commands (deploy, describe, delete, token) and HTTP calls (function
//! requests, monitoring, agent API). Tests substitute a scripted executor.

use async_trait::async_trait;
use fnbench_common::util::{mask_sensitive_args, truncate_for_log};
use serde::de::DeserializeOwned;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::process::Command;
use tracing::debug;

/// Failures of the execution channel itself, not of the remote command.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RemoteError {
    #[error("command timed out after {}s: {command}", .after.as_secs())]
    Timeout { command: String, after: Duration },

    #[error("failed to start command {command}: {message}")]
    Spawn { command: String, message: String },

    #[error("HTTP request to {url} failed: {message}")]
    Http { url: String, message: String },
}

impl RemoteError {
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }
}

/// Exit status and captured output of a finished command.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn ok(stdout: impl Into<String>) -> Self {
        Self {
            exit_code: 0,
            stdout: stdout.into(),
            stderr: String::new(),
        }
    }

    pub fn failed(exit_code: i32, stderr: impl Into<String>) -> Self {
        Self {
            exit_code,
            stdout: String::new(),
            stderr: stderr.into(),
        }
    }

    pub fn success(&self) -> bool {
        self.exit_code == 0
    }

    /// Best human-readable error text: stderr, else stdout, else the exit code.
    pub fn error_text(&self) -> String {
        let stderr = self.stderr.trim();
        if !stderr.is_empty() {
            return stderr.to_string();
        }
        let stdout = self.stdout.trim();
        if !stdout.is_empty() {
            return stdout.to_string();
        }
        format!("exit code {}", self.exit_code)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HttpMethod {
    Get,
    Post,
    Delete,
}

#[derive(Debug, Clone, PartialEq)]
pub struct HttpRequest {
    pub method: HttpMethod,
    pub url: String,
    pub params: Vec<(String, String)>,
    pub headers: Vec<(String, String)>,
    pub body: Option<serde_json::Value>,
}

impl HttpRequest {
    fn new(method: HttpMethod, url: impl Into<String>) -> Self {
        Self {
            method,
            url: url.into(),
            params: Vec::new(),
            headers: Vec::new(),
            body: None,
        }
    }

    pub fn get(url: impl Into<String>) -> Self {
        Self::new(HttpMethod::Get, url)
    }

    pub fn post(url: impl Into<String>) -> Self {
        Self::new(HttpMethod::Post, url)
    }

    pub fn delete(url: impl Into<String>) -> Self {
        Self::new(HttpMethod::Delete, url)
    }

    pub fn param(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.params.push((key.into(), value.into()));
        self
    }

    pub fn header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((key.into(), value.into()));
        self
    }

    pub fn bearer(self, token: &str) -> Self {
        self.header("Authorization", format!("Bearer {token}"))
    }

    pub fn json(mut self, body: serde_json::Value) -> Self {
        self.body = Some(body);
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpResponse {
    pub status: u16,
    pub body: String,
}

impl HttpResponse {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    pub fn json<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_str(&self.body)
    }
}

/// Opaque channel to the outside world.
#[async_trait]
pub trait RemoteCommandExecutor: Send + Sync {
    /// Run a command to completion or until `timeout` elapses.
    ///
    /// A non-zero exit code is a successful call; only failures to run the
    /// command at all are errors.
    async fn run(&self, argv: &[String], timeout: Duration) -> Result<CommandOutput, RemoteError>;

    /// Perform one HTTP request. Non-2xx statuses are returned, not raised.
    async fn run_http(
        &self,
        request: HttpRequest,
        timeout: Duration,
    ) -> Result<HttpResponse, RemoteError>;
}

/// Executor backed by local processes and a blocking HTTP agent.
#[derive(Debug, Clone, Default)]
pub struct ProcessExecutor;

impl ProcessExecutor {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl RemoteCommandExecutor for ProcessExecutor {
    async fn run(&self, argv: &[String], timeout: Duration) -> Result<CommandOutput, RemoteError> {
        let masked_cmd = mask_sensitive_args(argv);
        let Some((program, args)) = argv.split_first() else {
            return Err(RemoteError::Spawn {
                command: masked_cmd,
                message: "empty command".to_string(),
            });
        };

        debug!(command = %masked_cmd, timeout_secs = timeout.as_secs(), "Running command");
        let started = Instant::now();
        let mut command = Command::new(program);
        command.args(args).kill_on_drop(true);
        let child = command.output();

        let output = match tokio::time::timeout(timeout, child).await {
            Ok(Ok(output)) => output,
            Ok(Err(e)) => {
                return Err(RemoteError::Spawn {
                    command: masked_cmd,
                    message: e.to_string(),
                });
            }
            Err(_) => {
                return Err(RemoteError::Timeout {
                    command: masked_cmd,
                    after: timeout,
                });
            }
        };

        let result = CommandOutput {
            exit_code: output.status.code().unwrap_or(-1),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        };
        debug!(
            command = %masked_cmd,
            exit_code = result.exit_code,
            elapsed_ms = started.elapsed().as_millis() as u64,
            stderr = %truncate_for_log(&result.stderr, 200),
            "Command finished"
        );
        Ok(result)
    }

    async fn run_http(
        &self,
        request: HttpRequest,
        timeout: Duration,
    ) -> Result<HttpResponse, RemoteError> {
        let url = request.url.clone();
        let join = tokio::task::spawn_blocking(move || send_blocking(request, timeout)).await;
        match join {
            Ok(result) => result,
            Err(e) => Err(RemoteError::Http {
                url,
                message: format!("request task failed: {e}"),
            }),
        }
    }
}

fn send_blocking(request: HttpRequest, timeout: Duration) -> Result<HttpResponse, RemoteError> {
    let agent: ureq::Agent = ureq::Agent::config_builder()
        .timeout_global(Some(timeout))
        .http_status_as_error(false)
        .build()
        .into();

    let map_err = |e: ureq::Error| match e {
        ureq::Error::Timeout(_) => RemoteError::Timeout {
            command: format!("{:?} {}", request.method, request.url),
            after: timeout,
        },
        other => RemoteError::Http {
            url: request.url.clone(),
            message: other.to_string(),
        },
    };

    let response = match request.method {
        HttpMethod::Get | HttpMethod::Delete => {
            let mut builder = if request.method == HttpMethod::Get {
                agent.get(&request.url)
            } else {
                agent.delete(&request.url)
            };
            for (key, value) in &request.params {
                builder = builder.query(key, value);
            }
            for (key, value) in &request.headers {
                builder = builder.header(key.as_str(), value.as_str());
            }
            builder.call()
        }
        HttpMethod::Post => {
            let mut builder = agent.post(&request.url);
            for (key, value) in &request.params {
                builder = builder.query(key, value);
            }
            for (key, value) in &request.headers {
                builder = builder.header(key.as_str(), value.as_str());
            }
            match &request.body {
                Some(body) => builder
                    .header("Content-Type", "application/json")
                    .send(body.to_string()),
                None => builder.send_empty(),
            }
        }
    };

    let mut response = response.map_err(&map_err)?;
    let status = response.status().as_u16();
    let body = response.body_mut().read_to_string().map_err(&map_err)?;
    Ok(HttpResponse { status, body })
}
