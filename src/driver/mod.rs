//! Editor/assistant automation boundary.
//!
//! The orchestrator never touches the host editor directly. Everything goes
//! through the `UiDriver` capability interface: deliver a prompt, block until
//! the assistant's response is stable, and commit or revert the edits the
//! assistant made. The production implementation talks line-delimited JSON to
//! an automation helper process; tests substitute scripted drivers.

use std::path::Path;
use std::process::Stdio;
use std::str::FromStr;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::project::Project;

/// Whether a phase's edits are preserved or rolled back.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Disposition {
    Keep,
    Revert,
}

impl Disposition {
    pub fn as_str(self) -> &'static str {
        match self {
            Disposition::Keep => "keep",
            Disposition::Revert => "revert",
        }
    }
}

impl FromStr for Disposition {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "keep" => Ok(Disposition::Keep),
            "revert" | "undo" => Ok(Disposition::Revert),
            other => Err(format!("unknown disposition: {other}")),
        }
    }
}

#[derive(Debug, Error)]
pub enum DriverError {
    #[error("timed out waiting for assistant response")]
    Timeout,
    #[error("assistant rate limited the request")]
    RateLimited,
    #[error("automation channel closed")]
    ChannelClosed,
    #[error("commit rejected by editor: {0}")]
    CommitRejected(String),
    #[error("malformed automation message: {0}")]
    Protocol(String),
    #[error("io error on automation channel: {0}")]
    Io(#[from] std::io::Error),
}

impl DriverError {
    /// Transient failures are worth retrying with backoff; the rest are not.
    pub fn is_transient(&self) -> bool {
        matches!(self, DriverError::Timeout | DriverError::RateLimited)
    }
}

/// Capability interface for driving the host editor's assistant.
#[async_trait]
pub trait UiDriver: Send + Sync {
    /// Deliver one prompt to the assistant.
    async fn send_prompt(&self, prompt: &str) -> Result<(), DriverError>;

    /// Block until the assistant's response meets stability criteria.
    async fn await_response(&self) -> Result<String, DriverError>;

    /// Keep or roll back the file edits of the phase that just finished.
    async fn commit(&self, disposition: Disposition) -> Result<(), DriverError>;
}

/// Produces a connected driver for a project. The production factory spawns
/// one helper process per project; tests hand back scripted drivers.
#[async_trait]
pub trait DriverFactory: Send + Sync {
    async fn connect(
        &self,
        project: &Project,
    ) -> Result<std::sync::Arc<dyn UiDriver>, DriverError>;
}

// ============================================================================
// Retry wrapper
// ============================================================================

/// Bounded retry with exponential backoff for transient failures.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_secs(2),
        }
    }
}

impl RetryPolicy {
    /// Delay before retry number `attempt` (0-based): base * 2^attempt.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        self.base_delay * 2u32.saturating_pow(attempt)
    }
}

/// Wraps a driver so transient delivery failures are retried before they
/// surface to the orchestrator. The retry policy is owned here, not by the
/// orchestrator.
pub struct RetryingDriver<D> {
    inner: D,
    policy: RetryPolicy,
}

impl<D: UiDriver> RetryingDriver<D> {
    pub fn new(inner: D, policy: RetryPolicy) -> Self {
        Self { inner, policy }
    }

    async fn with_retry<'a, T, F, Fut>(&'a self, what: &str, op: F) -> Result<T, DriverError>
    where
        F: Fn(&'a D) -> Fut,
        Fut: std::future::Future<Output = Result<T, DriverError>>,
    {
        let mut attempt = 0;
        loop {
            match op(&self.inner).await {
                Ok(v) => return Ok(v),
                Err(e) if e.is_transient() && attempt + 1 < self.policy.max_attempts => {
                    let delay = self.policy.delay_for(attempt);
                    warn!(
                        op = what,
                        attempt = attempt + 1,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "transient driver failure, backing off"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

#[async_trait]
impl<D: UiDriver> UiDriver for RetryingDriver<D> {
    async fn send_prompt(&self, prompt: &str) -> Result<(), DriverError> {
        self.with_retry("send_prompt", |d| d.send_prompt(prompt)).await
    }

    async fn await_response(&self) -> Result<String, DriverError> {
        self.with_retry("await_response", |d| d.await_response()).await
    }

    async fn commit(&self, disposition: Disposition) -> Result<(), DriverError> {
        // Commit failures are fatal to the project; never papered over by retry.
        self.inner.commit(disposition).await
    }
}

// ============================================================================
// Stdio helper protocol
// ============================================================================

#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum HelperCommand<'a> {
    Prompt { text: &'a str },
    Commit { action: &'a str },
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum HelperMessage {
    Response {
        text: String,
    },
    Ack,
    Error {
        message: String,
        #[serde(default)]
        transient: bool,
    },
}

/// Driver that speaks line-delimited JSON to an automation helper process.
///
/// The helper owns the actual UI automation (focusing the chat panel,
/// pasting, polling for completion, pressing keep/undo); this side only
/// sequences commands and enforces the response timeout.
pub struct StdioDriver {
    child: Mutex<Child>,
    stdin: Mutex<ChildStdin>,
    stdout: Mutex<Lines<BufReader<ChildStdout>>>,
    response_timeout: Duration,
}

impl StdioDriver {
    pub fn spawn(
        program: &str,
        args: &[String],
        project_path: &Path,
        response_timeout: Duration,
    ) -> Result<Self, DriverError> {
        let mut child = Command::new(program)
            .args(args)
            .arg(project_path)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()?;

        let stdin = child.stdin.take().ok_or(DriverError::ChannelClosed)?;
        let stdout = child.stdout.take().ok_or(DriverError::ChannelClosed)?;

        debug!(helper = program, project = %project_path.display(), "automation helper spawned");

        Ok(Self {
            child: Mutex::new(child),
            stdin: Mutex::new(stdin),
            stdout: Mutex::new(BufReader::new(stdout).lines()),
            response_timeout,
        })
    }

    async fn write_command(&self, cmd: &HelperCommand<'_>) -> Result<(), DriverError> {
        let line = serde_json::to_string(cmd)
            .map_err(|e| DriverError::Protocol(e.to_string()))?;
        let mut stdin = self.stdin.lock().await;
        stdin.write_all(line.as_bytes()).await?;
        stdin.write_all(b"\n").await?;
        stdin.flush().await?;
        Ok(())
    }

    async fn read_message(&self) -> Result<HelperMessage, DriverError> {
        let mut lines = self.stdout.lock().await;
        let line = lines
            .next_line()
            .await?
            .ok_or(DriverError::ChannelClosed)?;
        serde_json::from_str(&line).map_err(|e| DriverError::Protocol(e.to_string()))
    }

    pub async fn shutdown(&self) {
        let mut child = self.child.lock().await;
        let _ = child.kill().await;
    }
}

#[async_trait]
impl UiDriver for StdioDriver {
    async fn send_prompt(&self, prompt: &str) -> Result<(), DriverError> {
        self.write_command(&HelperCommand::Prompt { text: prompt }).await
    }

    async fn await_response(&self) -> Result<String, DriverError> {
        let msg = tokio::time::timeout(self.response_timeout, self.read_message())
            .await
            .map_err(|_| DriverError::Timeout)??;

        match msg {
            HelperMessage::Response { text } => Ok(text),
            HelperMessage::Error { message, transient } => {
                if transient {
                    Err(DriverError::RateLimited)
                } else {
                    Err(DriverError::Protocol(message))
                }
            }
            HelperMessage::Ack => Err(DriverError::Protocol(
                "unexpected ack while awaiting response".into(),
            )),
        }
    }

    async fn commit(&self, disposition: Disposition) -> Result<(), DriverError> {
        self.write_command(&HelperCommand::Commit {
            action: disposition.as_str(),
        })
        .await?;

        match self.read_message().await? {
            HelperMessage::Ack => Ok(()),
            HelperMessage::Error { message, .. } => Err(DriverError::CommitRejected(message)),
            HelperMessage::Response { .. } => Err(DriverError::Protocol(
                "unexpected response while awaiting commit ack".into(),
            )),
        }
    }
}

/// Factory spawning one `StdioDriver` per project, wrapped with retry.
pub struct StdioDriverFactory {
    pub program: String,
    pub args: Vec<String>,
    pub response_timeout: Duration,
    pub retry: RetryPolicy,
}

#[async_trait]
impl DriverFactory for StdioDriverFactory {
    async fn connect(
        &self,
        project: &Project,
    ) -> Result<std::sync::Arc<dyn UiDriver>, DriverError> {
        let driver = StdioDriver::spawn(
            &self.program,
            &self.args,
            &project.path,
            self.response_timeout,
        )?;
        Ok(std::sync::Arc::new(RetryingDriver::new(
            driver,
            self.retry.clone(),
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct FlakyDriver {
        fail_first: u32,
        calls: AtomicU32,
    }

    #[async_trait]
    impl UiDriver for FlakyDriver {
        async fn send_prompt(&self, _prompt: &str) -> Result<(), DriverError> {
            Ok(())
        }

        async fn await_response(&self) -> Result<String, DriverError> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            if n < self.fail_first {
                Err(DriverError::Timeout)
            } else {
                Ok("ok".to_string())
            }
        }

        async fn commit(&self, _disposition: Disposition) -> Result<(), DriverError> {
            Err(DriverError::CommitRejected("stuck dialog".into()))
        }
    }

    fn fast_policy(max_attempts: u32) -> RetryPolicy {
        RetryPolicy {
            max_attempts,
            base_delay: Duration::from_millis(1),
        }
    }

    #[tokio::test]
    async fn transient_failures_are_retried() {
        let driver = RetryingDriver::new(
            FlakyDriver {
                fail_first: 2,
                calls: AtomicU32::new(0),
            },
            fast_policy(3),
        );

        assert_eq!(driver.await_response().await.unwrap(), "ok");
    }

    #[tokio::test]
    async fn retries_are_bounded() {
        let driver = RetryingDriver::new(
            FlakyDriver {
                fail_first: 10,
                calls: AtomicU32::new(0),
            },
            fast_policy(3),
        );

        let err = driver.await_response().await.unwrap_err();
        assert!(matches!(err, DriverError::Timeout));
        assert_eq!(driver.inner.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn commit_failures_are_never_retried() {
        let driver = RetryingDriver::new(
            FlakyDriver {
                fail_first: 0,
                calls: AtomicU32::new(0),
            },
            fast_policy(5),
        );

        let err = driver.commit(Disposition::Revert).await.unwrap_err();
        assert!(matches!(err, DriverError::CommitRejected(_)));
    }

    #[test]
    fn backoff_grows_exponentially() {
        let policy = RetryPolicy {
            max_attempts: 4,
            base_delay: Duration::from_secs(2),
        };
        assert_eq!(policy.delay_for(0), Duration::from_secs(2));
        assert_eq!(policy.delay_for(1), Duration::from_secs(4));
        assert_eq!(policy.delay_for(2), Duration::from_secs(8));
    }

    #[test]
    fn transient_classification() {
        assert!(DriverError::Timeout.is_transient());
        assert!(DriverError::RateLimited.is_transient());
        assert!(!DriverError::ChannelClosed.is_transient());
        assert!(!DriverError::CommitRejected("x".into()).is_transient());
    }

    #[test]
    fn disposition_parsing() {
        assert_eq!("keep".parse::<Disposition>().unwrap(), Disposition::Keep);
        assert_eq!("undo".parse::<Disposition>().unwrap(), Disposition::Revert);
        assert!("maybe".parse::<Disposition>().is_err());
    }
}
