//! Run a set of processes bound to a cancellation token.
//!
//! Every process is started, then waited on. Cancelling the token kills
//! whatever is still running. A process that fails to start, cannot be
//! waited on, or exits unsuccessfully on its own cancels the rest.
use crate::config::ProcessSpec;
use std::process::{ExitStatus, Stdio};
use tokio::process::{Child, Command};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// What happened to one supervised process.
#[derive(Debug)]
pub struct ProcessOutcome {
    pub name: String,
    pub pid: u32,
    pub status: ExitStatus,
    /// The process was still running when cancellation was requested.
    pub cancelled: bool,
}

/// Outcomes of a supervision run, in configuration order.
#[derive(Debug, Default)]
pub struct Report {
    pub outcomes: Vec<ProcessOutcome>,
}

/// Errors that end a supervision run.
#[derive(Debug)]
pub enum SuperviseError {
    /// Nothing to supervise.
    NoProcesses,
    /// Failed to spawn a process.
    Spawn {
        name: String,
        source: std::io::Error,
    },
    /// Failed to wait on a running process.
    Wait {
        name: String,
        source: std::io::Error,
    },
    /// A process exited unsuccessfully without being cancelled.
    Exited { name: String, status: ExitStatus },
}

impl std::fmt::Display for SuperviseError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SuperviseError::NoProcesses => write!(f, "no processes to supervise"),
            SuperviseError::Spawn { name, source } => {
                write!(f, "failed to spawn {}: {}", name, source)
            }
            SuperviseError::Wait { name, source } => {
                write!(f, "failed to wait on {}: {}", name, source)
            }
            SuperviseError::Exited { name, status } => {
                write!(f, "{} exited unsuccessfully ({})", name, status)
            }
        }
    }
}

impl std::error::Error for SuperviseError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            SuperviseError::Spawn { source, .. } => Some(source),
            SuperviseError::Wait { source, .. } => Some(source),
            SuperviseError::NoProcesses | SuperviseError::Exited { .. } => None,
        }
    }
}

/// Start every process in `specs` and wait for all of them.
///
/// Processes run under a child of `token`: cancelling `token` stops them all,
/// while a failing process only cancels its siblings. Every process that
/// was started is reaped before this returns, including on error.
pub async fn supervise(
    specs: &[ProcessSpec],
    token: &CancellationToken,
) -> Result<Report, SuperviseError> {
    if specs.is_empty() {
        return Err(SuperviseError::NoProcesses);
    }

    let scope = token.child_token();
    let mut running: Vec<(String, JoinHandle<Result<ProcessOutcome, SuperviseError>>)> =
        Vec::with_capacity(specs.len());
    let mut first_error = None;

    for spec in specs {
        match spawn(spec) {
            Ok(child) => {
                let name = spec.name().to_string();
                let watcher = tokio::spawn(watch(name.clone(), child, scope.clone()));
                running.push((name, watcher));
            }
            Err(e) => {
                tracing::error!(error = %e, "start failed, stopping started processes");
                scope.cancel();
                first_error = Some(e);
                break;
            }
        }
    }

    let mut report = Report::default();
    for (name, watcher) in running {
        let result = watcher.await.unwrap_or_else(|e| {
            scope.cancel();
            Err(SuperviseError::Wait {
                name,
                source: std::io::Error::other(e),
            })
        });
        match result {
            Ok(outcome) => report.outcomes.push(outcome),
            Err(e) => {
                first_error.get_or_insert(e);
            }
        }
    }

    match first_error {
        Some(e) => Err(e),
        None => Ok(report),
    }
}

fn spawn(spec: &ProcessSpec) -> Result<Child, SuperviseError> {
    tracing::info!(
        name = spec.name(),
        command = %spec.command,
        args = ?spec.args,
        "starting process"
    );

    let child = Command::new(&spec.command)
        .args(&spec.args)
        .stdin(Stdio::null())
        .kill_on_drop(true)
        .spawn()
        .map_err(|e| SuperviseError::Spawn {
            name: spec.name().to_string(),
            source: e,
        })?;

    tracing::info!(name = spec.name(), pid = child.id().unwrap_or(0), "process started");
    Ok(child)
}

enum Wake {
    Exited(std::io::Result<ExitStatus>),
    Cancelled,
}

/// Wait for `child`, killing it if `scope` is cancelled first.
async fn watch(
    name: String,
    mut child: Child,
    scope: CancellationToken,
) -> Result<ProcessOutcome, SuperviseError> {
    let pid = child.id().unwrap_or(0);

    let wake = tokio::select! {
        status = child.wait() => Wake::Exited(status),
        () = scope.cancelled() => Wake::Cancelled,
    };

    let (status, cancelled) = match wake {
        Wake::Exited(status) => (status, scope.is_cancelled()),
        Wake::Cancelled => {
            tracing::info!(name = %name, pid, "cancellation requested, killing process");
            if let Err(e) = child.start_kill() {
                // Already exited; the wait below collects it.
                tracing::debug!(name = %name, pid, error = %e, "kill failed");
            }
            (child.wait().await, true)
        }
    };

    let status = match status {
        Ok(status) => status,
        Err(e) => {
            scope.cancel();
            return Err(SuperviseError::Wait { name, source: e });
        }
    };

    tracing::info!(name = %name, pid, exit_code = ?status.code(), cancelled, "process exited");

    if !status.success() && !cancelled {
        scope.cancel();
        return Err(SuperviseError::Exited { name, status });
    }

    Ok(ProcessOutcome {
        name,
        pid,
        status,
        cancelled,
    })
}

#[cfg(test)]
impl Report {
    pub fn cancelled(&self) -> bool {
        self.outcomes.iter().any(|outcome| outcome.cancelled)
    }
}
