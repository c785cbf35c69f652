//! Bounded pool that runs remediation actions off the request path.
//!
//! Submissions go onto an unbounded queue and are picked up by a fixed
//! number of worker tasks, so at most `workers` external processes run at
//! once and nothing is ever dropped.

use async_trait::async_trait;
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::process::Command;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::{config::ActionConfig, metrics, Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    Success,
    Error,
    NotFound,
}

impl ExecutionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExecutionStatus::Success => "success",
            ExecutionStatus::Error => "error",
            ExecutionStatus::NotFound => "not_found",
        }
    }
}

/// What the process left behind.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ExitDetail {
    pub code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ExecutionOutcome {
    pub status: ExecutionStatus,
    pub message: String,
    pub exit_detail: Option<ExitDetail>,
}

impl ExecutionOutcome {
    pub fn success(detail: ExitDetail) -> Self {
        Self {
            status: ExecutionStatus::Success,
            message: "Remediation executed successfully".to_string(),
            exit_detail: Some(detail),
        }
    }

    pub fn failed(message: impl Into<String>, detail: Option<ExitDetail>) -> Self {
        Self {
            status: ExecutionStatus::Error,
            message: message.into(),
            exit_detail: detail,
        }
    }

    pub fn not_found(action_ref: &str) -> Self {
        Self {
            status: ExecutionStatus::NotFound,
            message: format!("Script not found: {}", action_ref),
            exit_detail: None,
        }
    }

    /// HTTP-style code for the outcome.
    pub fn code(&self) -> u16 {
        match self.status {
            ExecutionStatus::Success => 200,
            ExecutionStatus::NotFound => 404,
            ExecutionStatus::Error => 500,
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == ExecutionStatus::Success
    }
}

/// Runs one remediation action against one instance and reports how it went.
/// Implementations never fail; every problem becomes an outcome.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ActionRunner: Send + Sync {
    async fn run(&self, action_ref: &str, instance: &str) -> ExecutionOutcome;
}

/// Runs action references as local processes.
#[derive(Debug, Clone)]
pub struct ProcessRunner {
    config: ActionConfig,
}

impl ProcessRunner {
    pub fn new(config: ActionConfig) -> Self {
        Self { config }
    }

    fn command(&self, action_ref: &str, instance: &str) -> Command {
        let mut cmd = match &self.config.interpreter {
            Some(interpreter) => {
                let mut cmd = Command::new(interpreter);
                cmd.args(&self.config.interpreter_args).arg(action_ref);
                cmd
            }
            None => Command::new(executable_path(action_ref)),
        };

        if let Some(flag) = &self.config.instance_flag {
            cmd.arg(flag);
        }
        cmd.arg(instance)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        cmd
    }
}

/// A bare file name would be looked up on `PATH`. Anchor it to the working
/// directory so the file checked for existence is the one executed.
fn executable_path(action_ref: &str) -> PathBuf {
    let path = Path::new(action_ref);
    match path.parent() {
        Some(parent) if parent.as_os_str().is_empty() => Path::new(".").join(path),
        _ => path.to_path_buf(),
    }
}

#[async_trait]
impl ActionRunner for ProcessRunner {
    async fn run(&self, action_ref: &str, instance: &str) -> ExecutionOutcome {
        if !Path::new(action_ref).is_file() {
            return ExecutionOutcome::not_found(action_ref);
        }

        let mut cmd = self.command(action_ref, instance);
        debug!(action = %action_ref, instance = %instance, command = ?cmd, "Spawning remediation");

        match timeout(self.config.timeout, cmd.output()).await {
            Ok(Ok(output)) => {
                let detail = ExitDetail {
                    code: output.status.code(),
                    stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
                    stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
                };
                if output.status.success() {
                    ExecutionOutcome::success(detail)
                } else {
                    let diagnostic = if detail.stderr.trim().is_empty() {
                        format!("exit status {}", output.status)
                    } else {
                        detail.stderr.trim().to_string()
                    };
                    ExecutionOutcome::failed(format!("Remediation failed: {}", diagnostic), Some(detail))
                }
            }
            Ok(Err(e)) => ExecutionOutcome::failed(
                format!("Failed to start remediation {}: {}", action_ref, e),
                None,
            ),
            // Dropping the output future kills the child.
            Err(_) => ExecutionOutcome::failed(
                format!(
                    "Remediation timed out after {}s",
                    self.config.timeout.as_secs()
                ),
                None,
            ),
        }
    }
}

/// Awaitable result of one submitted execution. Dropping it is fine; the
/// outcome is logged either way.
#[derive(Debug)]
pub struct ExecutionHandle {
    id: Uuid,
    rx: oneshot::Receiver<ExecutionOutcome>,
}

impl ExecutionHandle {
    pub fn id(&self) -> Uuid {
        self.id
    }

    pub async fn outcome(self) -> Result<ExecutionOutcome> {
        self.rx
            .await
            .map_err(|_| Error::Internal(format!("execution {} ended without an outcome", self.id)))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ExecutorStats {
    /// Worker tasks still alive.
    pub workers: usize,
    pub busy: usize,
    pub queued: usize,
}

struct Job {
    id: Uuid,
    action_ref: String,
    instance: String,
    reply: oneshot::Sender<ExecutionOutcome>,
}

#[derive(Default)]
struct Counters {
    busy: AtomicUsize,
    queued: AtomicUsize,
}

pub struct ActionExecutor {
    queue_tx: Mutex<Option<mpsc::UnboundedSender<Job>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    counters: Arc<Counters>,
}

impl ActionExecutor {
    /// Starts `workers` worker tasks on the current tokio runtime.
    pub fn new(runner: Arc<dyn ActionRunner>, workers: usize) -> Result<Self> {
        if workers == 0 {
            return Err(Error::Config("executor needs at least one worker".to_string()));
        }

        let (queue_tx, queue_rx) = mpsc::unbounded_channel();
        let queue_rx = Arc::new(tokio::sync::Mutex::new(queue_rx));
        let counters = Arc::new(Counters::default());

        let handles: Vec<JoinHandle<()>> = (0..workers)
            .map(|worker| {
                let runner = runner.clone();
                let queue_rx = queue_rx.clone();
                let counters = counters.clone();
                tokio::spawn(async move {
                    worker_loop(worker, runner, queue_rx, counters).await;
                })
            })
            .collect();

        info!("Started action executor with {} workers", workers);

        Ok(Self {
            queue_tx: Mutex::new(Some(queue_tx)),
            workers: Mutex::new(handles),
            counters,
        })
    }

    /// Queues an execution and returns immediately.
    pub fn submit(&self, action_ref: &str, instance: &str) -> Result<ExecutionHandle> {
        let (reply, rx) = oneshot::channel();
        let job = Job {
            id: Uuid::new_v4(),
            action_ref: action_ref.to_string(),
            instance: instance.to_string(),
            reply,
        };
        let id = job.id;

        let queue_tx = self
            .queue_tx
            .lock()
            .map_err(|_| Error::Internal("executor queue lock poisoned".to_string()))?;
        let queue_tx = queue_tx
            .as_ref()
            .ok_or_else(|| Error::Execution("executor is shut down".to_string()))?;

        self.counters.queued.fetch_add(1, Ordering::SeqCst);
        if queue_tx.send(job).is_err() {
            self.counters.queued.fetch_sub(1, Ordering::SeqCst);
            return Err(Error::Execution("executor workers are gone".to_string()));
        }

        debug!(execution_id = %id, action = %action_ref, instance = %instance, "Queued remediation");
        Ok(ExecutionHandle { id, rx })
    }

    pub fn stats(&self) -> ExecutorStats {
        let workers = self
            .workers
            .lock()
            .map(|handles| handles.iter().filter(|h| !h.is_finished()).count())
            .unwrap_or_default();
        ExecutorStats {
            workers,
            busy: self.counters.busy.load(Ordering::SeqCst),
            queued: self.counters.queued.load(Ordering::SeqCst),
        }
    }

    /// Stops accepting work and waits for queued and running executions to
    /// finish.
    pub async fn shutdown(&self) {
        let sender = match self.queue_tx.lock() {
            Ok(mut queue_tx) => queue_tx.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        drop(sender);

        let handles: Vec<JoinHandle<()>> = match self.workers.lock() {
            Ok(mut workers) => workers.drain(..).collect(),
            Err(poisoned) => poisoned.into_inner().drain(..).collect(),
        };

        info!("Draining action executor ({} workers)", handles.len());
        for result in futures::future::join_all(handles).await {
            if let Err(e) = result {
                error!("Executor worker ended abnormally: {}", e);
            }
        }
    }
}

async fn worker_loop(
    worker: usize,
    runner: Arc<dyn ActionRunner>,
    queue_rx: Arc<tokio::sync::Mutex<mpsc::UnboundedReceiver<Job>>>,
    counters: Arc<Counters>,
) {
    loop {
        let job = {
            let mut rx = queue_rx.lock().await;
            rx.recv().await
        };
        let Some(job) = job else {
            debug!(worker, "Executor queue closed, worker exiting");
            return;
        };

        counters.queued.fetch_sub(1, Ordering::SeqCst);
        counters.busy.fetch_add(1, Ordering::SeqCst);
        metrics::ACTIONS_IN_FLIGHT.inc();

        let outcome = execute(worker, &runner, &job).await;

        metrics::ACTIONS_IN_FLIGHT.dec();
        counters.busy.fetch_sub(1, Ordering::SeqCst);
        metrics::ACTION_EXECUTIONS_TOTAL
            .with_label_values(&[outcome.status.as_str()])
            .inc();

        // The caller may have dropped the handle.
        let _ = job.reply.send(outcome);
    }
}

async fn execute(worker: usize, runner: &Arc<dyn ActionRunner>, job: &Job) -> ExecutionOutcome {
    info!(
        worker,
        execution_id = %job.id,
        action = %job.action_ref,
        instance = %job.instance,
        "Running remediation"
    );

    // A panicking runner must not take the worker down with it.
    let task = {
        let runner = runner.clone();
        let action_ref = job.action_ref.clone();
        let instance = job.instance.clone();
        tokio::spawn(async move { runner.run(&action_ref, &instance).await })
    };
    let outcome = match task.await {
        Ok(outcome) => outcome,
        Err(e) => ExecutionOutcome::failed(format!("Remediation task aborted: {}", e), None),
    };

    match outcome.status {
        ExecutionStatus::Success => info!(
            execution_id = %job.id,
            instance = %job.instance,
            stdout = %outcome.exit_detail.as_ref().map(|d| d.stdout.trim()).unwrap_or_default(),
            "Script execution successful"
        ),
        ExecutionStatus::NotFound => warn!(
            execution_id = %job.id,
            instance = %job.instance,
            "{}",
            outcome.message
        ),
        ExecutionStatus::Error => error!(
            execution_id = %job.id,
            instance = %job.instance,
            code = ?outcome.exit_detail.as_ref().and_then(|d| d.code),
            "Script execution failed: {}",
            outcome.message
        ),
    }

    outcome
}
