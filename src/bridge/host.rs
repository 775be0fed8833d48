//! Allow-listed host command execution.

use std::collections::HashSet;
use std::process::Stdio;

use tokio::process::Command;

use super::frame::OutboundFrame;
use crate::config::settings::DEFAULT_HOST_COMMANDS;

/// The programs a bridge client may run on the host.
#[derive(Debug, Clone)]
pub struct HostCommands {
    allowed: HashSet<String>,
}

impl Default for HostCommands {
    fn default() -> Self {
        Self::new(DEFAULT_HOST_COMMANDS.iter().copied())
    }
}

impl HostCommands {
    pub fn new<I, S>(allowed: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            allowed: allowed.into_iter().map(Into::into).collect(),
        }
    }

    /// Only bare program names match; `/bin/echo` is not `echo`.
    pub fn is_allowed(&self, command: &str) -> bool {
        !command.contains('/') && self.allowed.contains(command)
    }

    /// Run `command` if allowed and report the outcome as a frame.
    ///
    /// The child is killed if the returned future is dropped.
    pub async fn run(&self, command: &str, args: &[String]) -> OutboundFrame {
        if !self.is_allowed(command) {
            tracing::warn!(command = %command, "host command rejected");
            return OutboundFrame::host_failure(format!("command '{}' is not allowed", command));
        }

        tracing::debug!(command = %command, args = ?args, "running host command");
        let output = Command::new(command)
            .args(args)
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .output()
            .await;

        match output {
            Ok(output) => {
                let stderr = String::from_utf8_lossy(&output.stderr).into_owned();
                OutboundFrame::HostCommandResult {
                    success: output.status.success(),
                    data: Some(String::from_utf8_lossy(&output.stdout).into_owned()),
                    message: (!stderr.is_empty()).then_some(stderr),
                    code: output.status.code(),
                }
            }
            Err(e) => OutboundFrame::host_failure(format!("failed to run '{}': {}", command, e)),
        }
    }
}
