//! The job runner boundary.
//!
//! The coordination core only starts jobs and cancels them; what a job does
//! is the collaborator's business. Runners must observe the cancellation
//! token at bounded intervals so a stop lands promptly.

use std::process::Stdio;
use std::sync::Arc;

use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::runset::RunSet;

pub trait JobRunner: Send + Sync + 'static {
    /// Launch the job for `resource` and return its task handle. The job
    /// must exit soon after `cancel` fires.
    fn start(&self, resource: &str, target: &str, cancel: CancellationToken) -> JoinHandle<()>;
}

/// Runs the target as a shell command, streaming its stdout into the
/// resource's log mailbox so a takeover instance keeps the transcript.
pub struct CommandRunner {
    runset: Arc<dyn RunSet>,
}

impl CommandRunner {
    pub fn new(runset: Arc<dyn RunSet>) -> Self {
        Self { runset }
    }
}

impl JobRunner for CommandRunner {
    fn start(&self, resource: &str, target: &str, cancel: CancellationToken) -> JoinHandle<()> {
        let resource = resource.to_string();
        let target = target.to_string();
        let runset = self.runset.clone();
        tokio::spawn(async move {
            run_command(&resource, &target, cancel, runset).await;
        })
    }
}

async fn run_command(
    resource: &str,
    target: &str,
    cancel: CancellationToken,
    runset: Arc<dyn RunSet>,
) {
    tracing::info!(resource = %resource, target = %target, "job starting");
    log_line(&runset, resource, format!("job starting: {target}"));

    let mut child = match Command::new("sh")
        .arg("-c")
        .arg(target)
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .spawn()
    {
        Ok(child) => child,
        Err(e) => {
            tracing::error!(resource = %resource, error = %e, "failed to spawn job");
            log_line(&runset, resource, format!("failed to spawn job: {e}"));
            return;
        }
    };

    let Some(stdout) = child.stdout.take() else {
        // Should not happen with a piped stdout; just wait it out.
        wait_or_cancel(resource, &mut child, &cancel, &runset).await;
        return;
    };
    let mut lines = BufReader::new(stdout).lines();

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                if let Err(e) = child.kill().await {
                    tracing::warn!(resource = %resource, error = %e, "failed to kill job process");
                }
                tracing::info!(resource = %resource, "job cancelled");
                log_line(&runset, resource, "job cancelled".to_string());
                return;
            }
            line = lines.next_line() => match line {
                Ok(Some(line)) => log_line(&runset, resource, line),
                Ok(None) => break,
                Err(e) => {
                    tracing::warn!(resource = %resource, error = %e, "error reading job output");
                    break;
                }
            }
        }
    }

    wait_or_cancel(resource, &mut child, &cancel, &runset).await;
}

async fn wait_or_cancel(
    resource: &str,
    child: &mut tokio::process::Child,
    cancel: &CancellationToken,
    runset: &Arc<dyn RunSet>,
) {
    tokio::select! {
        _ = cancel.cancelled() => {
            if let Err(e) = child.kill().await {
                tracing::warn!(resource = %resource, error = %e, "failed to kill job process");
            }
            log_line(runset, resource, "job cancelled".to_string());
        }
        status = child.wait() => match status {
            Ok(status) => {
                tracing::info!(resource = %resource, exit = ?status.code(), "job exited");
                log_line(runset, resource, format!("job exited: {status}"));
            }
            Err(e) => {
                tracing::warn!(resource = %resource, error = %e, "failed waiting on job");
            }
        }
    }
}

fn log_line(runset: &Arc<dyn RunSet>, resource: &str, line: String) {
    if let Err(e) = runset.append_log(resource, std::slice::from_ref(&line)) {
        tracing::warn!(resource = %resource, error = %e, "failed to append job log");
    }
}
