//! Per-run worker subprocess.

use std::future::Future;
use std::path::Path;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines};
use tokio::process::{Child, ChildStderr, ChildStdin, ChildStdout, Command};
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::config::WorkerConfig;
use crate::error::{HandlerError, RidLabel, WorkerError};
use crate::protocol::{Action, Expid, Inbound, LogLevel, Reply, WorkerMessage, WorkerRequest};
use crate::scheduler::Rid;
use crate::worker::handlers::WorkerHandlers;
use crate::worker::termination;
use crate::worker::watchdog::{ACTION_WATCHDOG, Watchdogs};

/// How a `run` or `resume` action ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunOutcome {
    Completed,
    /// The experiment yielded; it must be resumed later.
    Paused,
}

/// Interrupts a worker's in-flight I/O once closing starts.
///
/// Cloned into the owner of the worker so closing does not have to wait for
/// the worker lock.
#[derive(Debug, Clone)]
pub struct CloseSignal {
    tx: Arc<watch::Sender<bool>>,
}

impl CloseSignal {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(false);
        Self { tx: Arc::new(tx) }
    }

    pub fn close(&self) {
        self.tx.send_replace(true);
    }

    pub fn is_closed(&self) -> bool {
        *self.tx.borrow()
    }

    /// Resolves once [`close`](Self::close) has been called.
    pub async fn closed(&self) {
        let mut rx = self.tx.subscribe();
        let _ = rx.wait_for(|closed| *closed).await;
    }
}

impl Default for CloseSignal {
    fn default() -> Self {
        Self::new()
    }
}

struct Process {
    child: Child,
    stdin: ChildStdin,
    stdout: Lines<BufReader<ChildStdout>>,
}

/// Owns one subprocess for the lifetime of a run.
///
/// The subprocess is spawned lazily by [`build`](Self::build). Every action
/// is a request/reply exchange; while waiting for the reply the worker
/// serves the subprocess's own requests through its [`WorkerHandlers`].
/// `&mut self` on every exchange makes the owner's lock the single
/// in-flight-request lock.
pub struct Worker {
    config: WorkerConfig,
    handlers: Arc<dyn WorkerHandlers>,
    rid: Option<Rid>,
    filename: String,
    process: Option<Process>,
    watchdogs: Watchdogs,
    yield_time: Option<Instant>,
    closed: CloseSignal,
}

impl Worker {
    pub fn new(config: WorkerConfig, handlers: Arc<dyn WorkerHandlers>) -> Self {
        Self {
            config,
            handlers,
            rid: None,
            filename: "<none>".to_string(),
            process: None,
            watchdogs: Watchdogs::new(),
            yield_time: None,
            closed: CloseSignal::new(),
        }
    }

    pub fn close_signal(&self) -> CloseSignal {
        self.closed.clone()
    }

    pub fn rid(&self) -> Option<Rid> {
        self.rid
    }

    /// OS process id of the subprocess, while it is owned by this worker.
    pub fn pid(&self) -> Option<u32> {
        self.process.as_ref().and_then(|p| p.child.id())
    }

    /// Spawn the subprocess (first call) and build the experiment.
    pub async fn build(
        &mut self,
        rid: Rid,
        pipeline_name: &str,
        wd: Option<&Path>,
        expid: &Expid,
        priority: i32,
        timeout: Duration,
    ) -> Result<(), WorkerError> {
        self.rid = Some(rid);
        self.filename = expid.display_file().to_string();
        self.create_process(expid.log_level).await?;
        self.expect_completion(
            Action::Build {
                rid,
                pipeline_name: pipeline_name.to_string(),
                wd: wd.map(Path::to_path_buf),
                expid: expid.clone(),
                priority,
            },
            Some(timeout),
        )
        .await
    }

    pub async fn prepare(&mut self) -> Result<(), WorkerError> {
        self.expect_completion(Action::Prepare, None).await
    }

    pub async fn run(&mut self) -> Result<RunOutcome, WorkerError> {
        let completed = self.worker_action(Action::Run, None).await?;
        Ok(self.outcome(completed))
    }

    /// Re-enter a paused run. Watchdog deadlines are pushed back by the time
    /// spent paused.
    pub async fn resume(&mut self, terminate: bool) -> Result<RunOutcome, WorkerError> {
        if let Some(yielded) = self.yield_time.take() {
            self.watchdogs.shift(yielded.elapsed());
        }
        let completed = self
            .worker_action(Action::Resume { terminate }, None)
            .await?;
        Ok(self.outcome(completed))
    }

    pub async fn analyze(&mut self) -> Result<(), WorkerError> {
        self.expect_completion(Action::Analyze, None).await
    }

    pub async fn write_results(&mut self, timeout: Duration) -> Result<(), WorkerError> {
        self.expect_completion(Action::WriteResults, Some(timeout))
            .await
    }

    /// Interrupt any I/O and make sure the subprocess is gone.
    ///
    /// Escalates from a graceful `terminate` message to SIGTERM to SIGKILL,
    /// waiting at most `term_timeout` after each step. Never fails.
    pub async fn close(&mut self, term_timeout: Duration) {
        self.closed.close();
        let rid = RidLabel(self.rid);

        let Some(Process {
            mut child, stdin, ..
        }) = self.process.take()
        else {
            debug!(rid = %rid, "worker was not created");
            return;
        };

        match child.try_wait() {
            Ok(Some(status)) => {
                debug!(rid = %rid, "worker already terminated");
                if !status.success() {
                    warn!(rid = %rid, %status, "worker finished with non-zero status");
                }
                return;
            }
            Ok(None) => {}
            Err(e) => debug!(rid = %rid, error = %e, "failed to poll worker status"),
        }

        termination::terminate(
            &mut child,
            Some(stdin),
            rid,
            self.config.send_timeout,
            term_timeout,
        )
        .await;
    }

    fn outcome(&mut self, completed: bool) -> RunOutcome {
        if completed {
            RunOutcome::Completed
        } else {
            self.yield_time = Some(Instant::now());
            RunOutcome::Paused
        }
    }

    async fn create_process(&mut self, log_level: LogLevel) -> Result<(), WorkerError> {
        if self.process.is_some() {
            return Ok(());
        }
        let rid = RidLabel(self.rid);

        let mut command = Command::new(&self.config.program);
        command
            .args(&self.config.args)
            .envs(self.config.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .env("EXP_LOG_LEVEL", log_level.as_filter())
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        #[cfg(unix)]
        command.process_group(0);

        let mut child = command
            .spawn()
            .map_err(|source| WorkerError::Spawn { rid, source })?;

        let (Some(stdin), Some(stdout)) = (child.stdin.take(), child.stdout.take()) else {
            return Err(WorkerError::protocol(self.rid, "worker pipes unavailable"));
        };
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(forward_output(stderr, rid, self.filename.clone()));
        }

        debug!(rid = %rid, pid = ?child.id(), program = %self.config.program.display(), "worker started");
        self.process = Some(Process {
            child,
            stdin,
            stdout: BufReader::new(stdout).lines(),
        });
        Ok(())
    }

    /// An action that must end with `completed`.
    async fn expect_completion(
        &mut self,
        action: Action,
        timeout: Option<Duration>,
    ) -> Result<(), WorkerError> {
        let name = action.name();
        if self.worker_action(action, timeout).await? {
            Ok(())
        } else {
            Err(WorkerError::protocol(
                self.rid,
                format!("unexpected pause during {name}"),
            ))
        }
    }

    /// Send one action and serve requests until it completes or pauses.
    async fn worker_action(
        &mut self,
        action: Action,
        timeout: Option<Duration>,
    ) -> Result<bool, WorkerError> {
        if let Some(timeout) = timeout {
            self.watchdogs
                .set_action_deadline(Instant::now() + timeout);
        }
        let result = self.exchange(&action).await;
        if timeout.is_some() {
            self.watchdogs.clear_action_deadline();
        }
        result
    }

    async fn exchange(&mut self, action: &Action) -> Result<bool, WorkerError> {
        self.send(action).await?;
        match self.handle_worker_requests().await {
            Err(WorkerError::Timeout { rid, .. }) => Err(WorkerError::WatchdogTimeout { rid }),
            other => other,
        }
    }

    async fn handle_worker_requests(&mut self) -> Result<bool, WorkerError> {
        loop {
            let inbound = match self.recv(self.watchdogs.nearest()).await {
                Err(WorkerError::Timeout { rid, .. }) => {
                    return Err(WorkerError::WatchdogTimeout { rid });
                }
                other => other?,
            };

            match inbound {
                Inbound::Completed => return Ok(true),
                Inbound::Pause => return Ok(false),
                Inbound::Exception { message } => {
                    return Err(WorkerError::InternalException {
                        rid: RidLabel(self.rid),
                        message: message.unwrap_or_else(|| "see worker log".to_string()),
                    });
                }
                Inbound::Request(msg) => {
                    let result = match WorkerRequest::parse(&msg) {
                        Ok(request) => self.dispatch(request).await,
                        Err(e) => Err(e),
                    };
                    let reply = match result {
                        Ok(data) => Reply::ok(data),
                        Err(e) => {
                            debug!(rid = ?self.rid, action = %msg.action, error = %e, "worker request failed");
                            Reply::failed(e)
                        }
                    };
                    self.send(&reply).await?;
                }
            }
        }
    }

    async fn dispatch(&mut self, request: WorkerRequest) -> Result<Value, HandlerError> {
        match request {
            WorkerRequest::Log { level, message } => {
                self.handlers.log(self.rid, level, &message).await;
                Ok(Value::Null)
            }
            WorkerRequest::GetDataset { key } => self.handlers.get_dataset(&key).await,
            WorkerRequest::UpdateDataset { key, value } => self
                .handlers
                .update_dataset(&key, value)
                .await
                .map(|()| Value::Null),
            WorkerRequest::CreateWatchdog { timeout } => {
                if !timeout.is_finite() || timeout < 0.0 {
                    return Err(HandlerError::InvalidTimeout { timeout });
                }
                let id = self.watchdogs.create(Duration::from_secs_f64(timeout));
                Ok(Value::from(id))
            }
            WorkerRequest::DeleteWatchdog { id } => {
                if id != ACTION_WATCHDOG && self.watchdogs.delete(id) {
                    Ok(Value::Null)
                } else {
                    Err(HandlerError::WatchdogNotFound { id })
                }
            }
            WorkerRequest::Scheduler(query) => self.handlers.scheduler(self.rid, query).await,
        }
    }

    async fn send(&mut self, msg: &impl Serialize) -> Result<(), WorkerError> {
        let rid = self.rid;
        let mut line = serde_json::to_string(msg)
            .map_err(|e| WorkerError::protocol(rid, format!("failed to encode message: {e}")))?;
        line.push('\n');

        let process = self
            .process
            .as_mut()
            .ok_or_else(|| WorkerError::protocol(rid, "worker process not started"))?;
        let send_timeout = self.config.send_timeout;
        let write = async {
            process.stdin.write_all(line.as_bytes()).await?;
            process.stdin.flush().await
        };

        let result = tokio::select! {
            biased;
            _ = self.closed.closed() => {
                return Err(WorkerError::protocol(rid, "data transmission to worker cancelled"));
            }
            result = tokio::time::timeout(send_timeout, write) => result,
        };

        match result {
            Err(_) => Err(WorkerError::Timeout {
                rid: RidLabel(rid),
                operation: "sending data to",
            }),
            Ok(Err(e)) => Err(WorkerError::protocol(
                rid,
                format!("failed to send data to worker: {e}"),
            )),
            Ok(Ok(())) => Ok(()),
        }
    }

    async fn recv(&mut self, deadline: Option<Instant>) -> Result<Inbound, WorkerError> {
        let rid = self.rid;
        let process = self
            .process
            .as_mut()
            .ok_or_else(|| WorkerError::protocol(rid, "worker process not started"))?;

        loop {
            let read = tokio::select! {
                biased;
                _ = self.closed.closed() => {
                    return Err(WorkerError::protocol(rid, "worker closed while receiving data"));
                }
                read = with_deadline(deadline, process.stdout.next_line()) => read,
            };

            let line = match read {
                None => {
                    return Err(WorkerError::Timeout {
                        rid: RidLabel(rid),
                        operation: "receiving data from",
                    });
                }
                Some(Err(e)) => {
                    return Err(WorkerError::protocol(
                        rid,
                        format!("failed to read from worker: {e}"),
                    ));
                }
                Some(Ok(None)) => {
                    return Err(WorkerError::protocol(
                        rid,
                        "worker ended while attempting to receive data",
                    ));
                }
                Some(Ok(Some(line))) => line,
            };

            if line.trim().is_empty() {
                continue;
            }

            let msg: WorkerMessage = serde_json::from_str(&line).map_err(|e| {
                WorkerError::protocol(rid, format!("worker sent invalid JSON: {e}"))
            })?;
            return Ok(msg.into());
        }
    }
}

/// `None` when the deadline passed first.
async fn with_deadline<F: Future>(deadline: Option<Instant>, fut: F) -> Option<F::Output> {
    match deadline {
        Some(deadline) => tokio::time::timeout_at(deadline, fut).await.ok(),
        None => Some(fut.await),
    }
}

/// Copy the subprocess's stderr into the master log.
async fn forward_output(stderr: ChildStderr, rid: RidLabel, filename: String) {
    let mut lines = BufReader::new(stderr).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        info!(target: "exp_master::worker_output", rid = %rid, file = %filename, "{line}");
    }
}
