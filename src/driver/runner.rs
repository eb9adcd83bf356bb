//! Command Runners
//!
//! The production runner shells out over ssh with a hard kill window; the
//! recording runner captures every command for tests and dry-runs. Both
//! are handed to the driver at construction, never reached through a
//! global.

use crate::domain::ports::CommandRunner;
use crate::error::{Error, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;
use tracing::{debug, info, warn};

/// Hard kill window for one remote command
const EXECUTE_TIMEOUT: Duration = Duration::from_secs(60);

/// Artificial latency when command execution is skipped
const SKIP_SLEEP: Duration = Duration::from_millis(200);

// =============================================================================
// SSH Runner
// =============================================================================

/// Runs privileged commands on remote hosts over ssh
///
/// When `DAC_SKIP_ANSIBLE` is `True` the runner becomes a no-op that
/// sleeps 200 ms, which is what tests and dry-runs rely on.
pub struct SshRunner {
    skip: bool,
}

impl SshRunner {
    pub fn from_env() -> Self {
        let skip = std::env::var("DAC_SKIP_ANSIBLE")
            .map(|v| v == "True")
            .unwrap_or(false);
        Self { skip }
    }
}

#[async_trait]
impl CommandRunner for SshRunner {
    async fn execute(&self, hostname: &str, command: &str) -> Result<()> {
        info!(hostname, command, "remote execute");
        if self.skip {
            debug!("skipping as DAC_SKIP_ANSIBLE=True");
            tokio::time::sleep(SKIP_SLEEP).await;
            return Ok(());
        }

        let child = Command::new("ssh")
            .arg("-o")
            .arg("StrictHostKeyChecking=no")
            .arg("-o")
            .arg("UserKnownHostsFile=/dev/null")
            .arg(hostname)
            .arg("sudo")
            .arg(command)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .output();

        let output = match tokio::time::timeout(EXECUTE_TIMEOUT, child).await {
            Err(_) => {
                warn!(hostname, command, "remote command killed after timeout");
                return Err(Error::Timeout {
                    hostname: hostname.to_string(),
                    command: command.to_string(),
                });
            }
            Ok(result) => result?,
        };

        if output.status.success() {
            debug!(hostname, command, "remote command completed");
            Ok(())
        } else {
            let mut combined = String::from_utf8_lossy(&output.stdout).into_owned();
            combined.push_str(&String::from_utf8_lossy(&output.stderr));
            warn!(hostname, command, output = %combined, "remote command failed");
            Err(Error::CommandFailed {
                hostname: hostname.to_string(),
                output: combined,
            })
        }
    }
}

// =============================================================================
// Recording Runner
// =============================================================================

/// Behavior of the recording runner for one command pattern
#[derive(Debug, Clone)]
enum Response {
    Ok,
    Fail(String),
}

/// A command-matching rule; `host` of `None` applies to every host
struct Rule {
    host: Option<String>,
    pattern: String,
    response: Response,
}

/// Test runner that records every command instead of executing it
///
/// Failures can be injected per command substring, optionally scoped to
/// one host, which is how the mtab idempotence guards and attachment
/// error paths are exercised.
#[derive(Default)]
pub struct RecordingRunner {
    calls: Mutex<Vec<(String, String)>>,
    rules: Mutex<Vec<Rule>>,
}

impl RecordingRunner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every `(hostname, command)` pair executed so far
    pub fn calls(&self) -> Vec<(String, String)> {
        self.calls.lock().clone()
    }

    pub fn commands_for(&self, hostname: &str) -> Vec<String> {
        self.calls
            .lock()
            .iter()
            .filter(|(h, _)| h == hostname)
            .map(|(_, c)| c.clone())
            .collect()
    }

    /// Make every command containing `pattern` fail with `message`
    pub fn fail_matching(&self, pattern: &str, message: &str) {
        self.rules.lock().push(Rule {
            host: None,
            pattern: pattern.to_string(),
            response: Response::Fail(message.to_string()),
        });
    }

    /// Like `fail_matching`, but only for commands aimed at `hostname`
    pub fn fail_for_host(&self, hostname: &str, pattern: &str, message: &str) {
        self.rules.lock().push(Rule {
            host: Some(hostname.to_string()),
            pattern: pattern.to_string(),
            response: Response::Fail(message.to_string()),
        });
    }
}

#[async_trait]
impl CommandRunner for RecordingRunner {
    async fn execute(&self, hostname: &str, command: &str) -> Result<()> {
        self.calls
            .lock()
            .push((hostname.to_string(), command.to_string()));

        let response = {
            let rules = self.rules.lock();
            rules
                .iter()
                .find(|rule| {
                    rule.host.as_deref().map(|h| h == hostname).unwrap_or(true)
                        && command.contains(rule.pattern.as_str())
                })
                .map(|rule| rule.response.clone())
        };
        match response {
            Some(Response::Fail(message)) => Err(Error::CommandFailed {
                hostname: hostname.to_string(),
                output: message,
            }),
            _ => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_recording_runner_captures_calls() {
        let runner = RecordingRunner::new();
        runner.execute("host", "mkdir -p /dac/j1_job").await.unwrap();

        let calls = runner.calls();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].0, "host");
        assert_eq!(calls[0].1, "mkdir -p /dac/j1_job");
    }

    #[tokio::test]
    async fn test_recording_runner_injected_failure() {
        let runner = RecordingRunner::new();
        runner.fail_matching("losetup", "loopback busy");

        runner.execute("c1", "mkdir -p /x").await.unwrap();
        let err = runner
            .execute("c1", "losetup /dev/loop3 /x/swap/c1")
            .await
            .unwrap_err();
        assert!(matches!(err, Error::CommandFailed { .. }));
        assert_eq!(runner.commands_for("c1").len(), 2);
    }

    #[tokio::test]
    async fn test_skip_runner_is_noop() {
        let runner = SshRunner { skip: true };
        tokio::time::timeout(Duration::from_secs(2), runner.execute("h", "rm -rf /never"))
            .await
            .unwrap()
            .unwrap();
    }
}
