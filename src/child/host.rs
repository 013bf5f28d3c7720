//! Subprocess side of the worker protocol.

use std::io::{BufRead, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, Local, Utc};
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::{Map, Value};
use tracing::{debug, error, info};

use super::experiments::{self, Experiment};
use crate::error::ExperimentError;
use crate::protocol::{
    Action, Expid, LogLevel, MasterMessage, Reply, SchedulerQuery, WorkerMessage, WorkerRequest,
};
use crate::scheduler::Rid;

/// Current run's identity, set by `build`.
#[derive(Debug, Clone)]
struct Identity {
    rid: Rid,
    pipeline_name: String,
    expid: Expid,
    start_time: DateTime<Local>,
}

#[derive(Serialize)]
struct ResultsFile<'a> {
    rid: Rid,
    pipeline: &'a str,
    expid: &'a Expid,
    start_time: DateTime<Local>,
    run_time: Option<DateTime<Local>>,
    datasets: &'a Map<String, Value>,
}

/// Serves master actions for one experiment and exposes the master's
/// services to it.
pub struct Host {
    input: Box<dyn BufRead + Send>,
    output: Box<dyn Write + Send>,
    results_dir: PathBuf,
    identity: Option<Identity>,
    run_time: Option<DateTime<Local>>,
    /// Datasets archived with the results.
    datasets: Map<String, Value>,
}

impl Host {
    pub fn new(
        input: impl BufRead + Send + 'static,
        output: impl Write + Send + 'static,
        results_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            input: Box::new(input),
            output: Box::new(output),
            results_dir: results_dir.into(),
            identity: None,
            run_time: None,
            datasets: Map::new(),
        }
    }

    /// Process actions until `terminate` or end of input.
    pub fn serve(&mut self) -> Result<(), ExperimentError> {
        let mut experiment: Option<Box<dyn Experiment>> = None;
        loop {
            let action = match self.read_master() {
                Ok(MasterMessage::Action(action)) => action,
                Ok(MasterMessage::Reply(reply)) => {
                    return Err(ExperimentError::Protocol(format!(
                        "unexpected reply outside a request: {reply:?}"
                    )));
                }
                Err(ExperimentError::Exit) => return Ok(()),
                Err(e) => return Err(e),
            };
            let name = action.name();
            debug!(action = name, "action received");

            let result = match action {
                Action::Terminate => return Ok(()),
                Action::Build {
                    rid,
                    pipeline_name,
                    wd,
                    expid,
                    priority,
                } => {
                    info!(rid, pipeline = %pipeline_name, class = %expid.class_name, priority, "building experiment");
                    self.identity = Some(Identity {
                        rid,
                        pipeline_name,
                        expid: expid.clone(),
                        start_time: Local::now(),
                    });
                    match wd.as_deref().map(std::env::set_current_dir) {
                        Some(Err(e)) => Err(ExperimentError::Failed(format!(
                            "cannot enter working directory: {e}"
                        ))),
                        _ => experiments::create(&expid).map(|e| {
                            experiment = Some(e);
                        }),
                    }
                }
                Action::Prepare => with_experiment(&mut experiment, |e| e.prepare(self)),
                Action::Run => {
                    self.run_time = Some(Local::now());
                    match with_experiment(&mut experiment, |e| e.run(self)) {
                        // Termination delivered on resume ends the run stage normally.
                        Err(ExperimentError::TerminationRequested) => Ok(()),
                        other => other,
                    }
                }
                Action::Analyze => with_experiment(&mut experiment, |e| e.analyze(self)),
                Action::WriteResults => self.write_results().map(|path| {
                    info!(path = %path.display(), "results written");
                }),
                Action::Resume { .. } => Err(ExperimentError::Protocol(
                    "resume received while not paused".to_string(),
                )),
            };

            match result {
                Ok(()) => self.send(&WorkerMessage::completed())?,
                Err(ExperimentError::Exit) => return Ok(()),
                Err(ExperimentError::Io(e)) => return Err(ExperimentError::Io(e)),
                Err(e) => {
                    error!(action = name, error = %e, "experiment raised");
                    self.send(&WorkerMessage::exception(e.to_string()))?;
                }
            }
        }
    }

    pub fn rid(&self) -> Option<Rid> {
        self.identity.as_ref().map(|i| i.rid)
    }

    pub fn pipeline_name(&self) -> &str {
        self.identity
            .as_ref()
            .map(|i| i.pipeline_name.as_str())
            .unwrap_or("")
    }

    /// Forward a log record to the master.
    pub fn log(&mut self, level: LogLevel, message: impl Into<String>) -> Result<(), ExperimentError> {
        self.request(WorkerRequest::Log {
            level,
            message: message.into(),
        })
        .map(drop)
    }

    pub fn get_dataset(&mut self, key: &str) -> Result<Value, ExperimentError> {
        if let Some(value) = self.datasets.get(key) {
            return Ok(value.clone());
        }
        self.request(WorkerRequest::GetDataset {
            key: key.to_string(),
        })
    }

    /// Record a dataset with the results; `broadcast` also publishes it to
    /// the master's dataset store.
    pub fn set_dataset(
        &mut self,
        key: &str,
        value: Value,
        broadcast: bool,
    ) -> Result<(), ExperimentError> {
        self.datasets.insert(key.to_string(), value.clone());
        if broadcast {
            self.request(WorkerRequest::UpdateDataset {
                key: key.to_string(),
                value,
            })?;
        }
        Ok(())
    }

    pub fn create_watchdog(&mut self, timeout: Duration) -> Result<i64, ExperimentError> {
        let id = self.request(WorkerRequest::CreateWatchdog {
            timeout: timeout.as_secs_f64(),
        })?;
        decode("watchdog id", id)
    }

    pub fn delete_watchdog(&mut self, id: i64) -> Result<(), ExperimentError> {
        self.request(WorkerRequest::DeleteWatchdog { id }).map(drop)
    }

    /// Whether pausing now would let another run proceed.
    pub fn check_pause(&mut self) -> Result<bool, ExperimentError> {
        let rid = self.require_rid()?;
        let answer = self.request(WorkerRequest::Scheduler(SchedulerQuery::CheckPause { rid }))?;
        decode("check_pause answer", answer)
    }

    pub fn check_termination(&mut self) -> Result<bool, ExperimentError> {
        let rid = self.require_rid()?;
        let answer = self.request(WorkerRequest::Scheduler(SchedulerQuery::CheckTermination {
            rid,
        }))?;
        decode("check_termination answer", answer)
    }

    /// Yield to the scheduler; returns once resumed.
    ///
    /// Fails with `TerminationRequested` when the master resumes with the
    /// termination flag set.
    pub fn pause(&mut self) -> Result<(), ExperimentError> {
        self.send(&WorkerMessage::pause())?;
        match self.read_master()? {
            MasterMessage::Action(Action::Resume { terminate: true }) => {
                Err(ExperimentError::TerminationRequested)
            }
            MasterMessage::Action(Action::Resume { terminate: false }) => Ok(()),
            MasterMessage::Action(Action::Terminate) => Err(ExperimentError::Exit),
            other => Err(ExperimentError::Protocol(format!(
                "unexpected message while paused: {other:?}"
            ))),
        }
    }

    /// Submit a new run through the master's scheduler.
    pub fn submit(
        &mut self,
        pipeline_name: &str,
        expid: Expid,
        priority: i32,
        due_date: Option<DateTime<Utc>>,
        flush: bool,
    ) -> Result<Rid, ExperimentError> {
        let rid = self.request(WorkerRequest::Scheduler(SchedulerQuery::Submit {
            pipeline_name: pipeline_name.to_string(),
            expid,
            priority,
            due_date,
            flush,
        }))?;
        decode("submitted RID", rid)
    }

    /// Results file path for the current run.
    pub fn results_path(&self) -> Result<PathBuf, ExperimentError> {
        let identity = self.identity.as_ref().ok_or_else(not_built)?;
        Ok(results_path(
            &self.results_dir,
            identity.start_time,
            identity.rid,
            &identity.expid.class_name,
        ))
    }

    fn write_results(&self) -> Result<PathBuf, ExperimentError> {
        let identity = self.identity.as_ref().ok_or_else(not_built)?;
        let path = self.results_path()?;
        if let Some(dir) = path.parent() {
            std::fs::create_dir_all(dir)?;
        }
        let file = ResultsFile {
            rid: identity.rid,
            pipeline: &identity.pipeline_name,
            expid: &identity.expid,
            start_time: identity.start_time,
            run_time: self.run_time,
            datasets: &self.datasets,
        };
        let json = serde_json::to_vec_pretty(&file)
            .map_err(|e| ExperimentError::Protocol(format!("cannot encode results: {e}")))?;
        std::fs::write(&path, json)?;
        Ok(path)
    }

    fn require_rid(&self) -> Result<Rid, ExperimentError> {
        self.rid().ok_or_else(not_built)
    }

    fn request(&mut self, request: WorkerRequest) -> Result<Value, ExperimentError> {
        let msg = request.to_message();
        self.send(&msg)?;
        match self.read_master()? {
            MasterMessage::Reply(Reply::Ok { data }) => Ok(data),
            MasterMessage::Reply(Reply::Failed { exception }) => Err(ExperimentError::Request {
                action: msg.action,
                exception,
            }),
            MasterMessage::Action(Action::Terminate) => Err(ExperimentError::Exit),
            MasterMessage::Action(other) => Err(ExperimentError::Protocol(format!(
                "expected a reply to {}, got {}",
                msg.action,
                other.name()
            ))),
        }
    }

    fn send(&mut self, msg: &WorkerMessage) -> Result<(), ExperimentError> {
        let mut line = serde_json::to_string(msg)
            .map_err(|e| ExperimentError::Protocol(format!("cannot encode message: {e}")))?;
        line.push('\n');
        self.output.write_all(line.as_bytes())?;
        self.output.flush()?;
        Ok(())
    }

    /// Next message from the master; end of input is `Exit`.
    fn read_master(&mut self) -> Result<MasterMessage, ExperimentError> {
        loop {
            let mut line = String::new();
            if self.input.read_line(&mut line)? == 0 {
                return Err(ExperimentError::Exit);
            }
            if line.trim().is_empty() {
                continue;
            }
            return serde_json::from_str(&line)
                .map_err(|e| ExperimentError::Protocol(format!("invalid message from master: {e}")));
        }
    }
}

fn with_experiment(
    experiment: &mut Option<Box<dyn Experiment>>,
    f: impl FnOnce(&mut Box<dyn Experiment>) -> Result<(), ExperimentError>,
) -> Result<(), ExperimentError> {
    match experiment.as_mut() {
        Some(experiment) => f(experiment),
        None => Err(not_built()),
    }
}

fn not_built() -> ExperimentError {
    ExperimentError::Protocol("no experiment has been built".to_string())
}

fn decode<T: DeserializeOwned>(what: &str, value: Value) -> Result<T, ExperimentError> {
    serde_json::from_value(value)
        .map_err(|e| ExperimentError::Protocol(format!("unexpected {what}: {e}")))
}

/// `<results>/<YYYY-MM-DD>/<HH>/<rid:09>-<class>.json`
pub fn results_path(root: &Path, start: DateTime<Local>, rid: Rid, class_name: &str) -> PathBuf {
    root.join(start.format("%Y-%m-%d").to_string())
        .join(start.format("%H").to_string())
        .join(format!("{rid:09}-{class_name}.json"))
}
