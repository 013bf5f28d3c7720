//! Worker IPC protocol — one JSON object per line.
//!
//! The master is the client for experiment actions (`build`, `prepare`,
//! `run`, ...) and the server for requests the subprocess initiates
//! (logging, datasets, watchdogs, scheduler queries). Both directions share
//! the subprocess's stdin/stdout.

use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};

use crate::error::HandlerError;
use crate::scheduler::Rid;

/// Log level requested for an experiment's worker.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Trace,
    Debug,
    Info,
    #[default]
    Warning,
    Error,
}

impl LogLevel {
    /// Directive understood by `tracing_subscriber::EnvFilter`.
    pub fn as_filter(&self) -> &'static str {
        match self {
            Self::Trace => "trace",
            Self::Debug => "debug",
            Self::Info => "info",
            Self::Warning => "warn",
            Self::Error => "error",
        }
    }
}

impl std::fmt::Display for LogLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Trace => "trace",
            Self::Debug => "debug",
            Self::Info => "info",
            Self::Warning => "warning",
            Self::Error => "error",
        };
        write!(f, "{s}")
    }
}

/// What to execute: entry point, arguments, log level, repository revision.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Expid {
    #[serde(default)]
    pub log_level: LogLevel,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file: Option<String>,
    pub class_name: String,
    #[serde(default)]
    pub arguments: Map<String, Value>,
    /// Absent: not a repository experiment. `null`: repository head at
    /// submission time. A string: that revision.
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        deserialize_with = "double_option"
    )]
    pub repo_rev: Option<Option<String>>,
}

fn double_option<'de, D, T>(deserializer: D) -> Result<Option<Option<T>>, D::Error>
where
    D: Deserializer<'de>,
    T: Deserialize<'de>,
{
    Deserialize::deserialize(deserializer).map(Some)
}

impl Expid {
    pub fn new(class_name: impl Into<String>) -> Self {
        Self {
            log_level: LogLevel::default(),
            file: None,
            class_name: class_name.into(),
            arguments: Map::new(),
            repo_rev: None,
        }
    }

    pub fn with_argument(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.arguments.insert(name.into(), value.into());
        self
    }

    pub fn with_file(mut self, file: impl Into<String>) -> Self {
        self.file = Some(file.into());
        self
    }

    /// Take the experiment from the repository (`None` = head at submission).
    pub fn from_repository(mut self, rev: Option<String>) -> Self {
        self.repo_rev = Some(rev);
        self
    }

    /// File name used in diagnostics.
    pub fn display_file(&self) -> &str {
        self.file
            .as_deref()
            .and_then(|f| f.rsplit('/').next())
            .unwrap_or("<none>")
    }
}

/// Master → worker actions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum Action {
    Build {
        rid: Rid,
        pipeline_name: String,
        wd: Option<PathBuf>,
        expid: Expid,
        priority: i32,
    },
    Prepare,
    Run,
    Resume {
        terminate: bool,
    },
    Analyze,
    WriteResults,
    Terminate,
}

impl Action {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Build { .. } => "build",
            Self::Prepare => "prepare",
            Self::Run => "run",
            Self::Resume { .. } => "resume",
            Self::Analyze => "analyze",
            Self::WriteResults => "write_results",
            Self::Terminate => "terminate",
        }
    }
}

/// Master → worker answer to a worker-initiated request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum Reply {
    Ok { data: Value },
    Failed { exception: String },
}

impl Reply {
    pub fn ok(data: impl Into<Value>) -> Self {
        Self::Ok { data: data.into() }
    }

    pub fn failed(error: impl std::fmt::Display) -> Self {
        Self::Failed {
            exception: error.to_string(),
        }
    }
}

/// Anything the master writes; the worker side decodes with this.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MasterMessage {
    Action(Action),
    Reply(Reply),
}

/// Worker → master line as it appears on the wire.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WorkerMessage {
    pub action: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub args: Vec<Value>,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub kwargs: Map<String, Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl WorkerMessage {
    pub fn completed() -> Self {
        Self::bare("completed")
    }

    pub fn pause() -> Self {
        Self::bare("pause")
    }

    pub fn exception(message: impl Into<String>) -> Self {
        Self {
            message: Some(message.into()),
            ..Self::bare("exception")
        }
    }

    fn bare(action: &str) -> Self {
        Self {
            action: action.to_string(),
            ..Self::default()
        }
    }
}

/// Decoded worker → master message.
#[derive(Debug, Clone, PartialEq)]
pub enum Inbound {
    Completed,
    Pause,
    Exception { message: Option<String> },
    Request(WorkerMessage),
}

impl From<WorkerMessage> for Inbound {
    fn from(msg: WorkerMessage) -> Self {
        match msg.action.as_str() {
            "completed" => Self::Completed,
            "pause" => Self::Pause,
            "exception" => Self::Exception {
                message: msg.message,
            },
            _ => Self::Request(msg),
        }
    }
}

/// Requests a worker subprocess may make of the master.
#[derive(Debug, Clone, PartialEq)]
pub enum WorkerRequest {
    Log { level: LogLevel, message: String },
    GetDataset { key: String },
    UpdateDataset { key: String, value: Value },
    CreateWatchdog { timeout: f64 },
    DeleteWatchdog { id: i64 },
    Scheduler(SchedulerQuery),
}

/// Scheduler operations exposed to experiments.
#[derive(Debug, Clone, PartialEq)]
pub enum SchedulerQuery {
    Submit {
        pipeline_name: String,
        expid: Expid,
        priority: i32,
        due_date: Option<DateTime<Utc>>,
        flush: bool,
    },
    Delete { rid: Rid },
    RequestTermination { rid: Rid },
    GetStatus,
    CheckPause { rid: Rid },
    CheckTermination { rid: Rid },
}

/// Positional-or-keyword argument access for one request.
struct Arguments<'a> {
    action: &'a str,
    args: &'a [Value],
    kwargs: &'a Map<String, Value>,
}

impl<'a> Arguments<'a> {
    fn lookup(&self, index: usize, name: &str) -> Option<&'a Value> {
        self.args.get(index).or_else(|| self.kwargs.get(name))
    }

    fn decode<T: DeserializeOwned>(&self, name: &str, value: &Value) -> Result<T, HandlerError> {
        serde_json::from_value(value.clone()).map_err(|e| HandlerError::InvalidArgument {
            action: self.action.to_string(),
            name: name.to_string(),
            reason: e.to_string(),
        })
    }

    fn required<T: DeserializeOwned>(&self, index: usize, name: &str) -> Result<T, HandlerError> {
        match self.lookup(index, name) {
            Some(value) => self.decode(name, value),
            None => Err(HandlerError::MissingArgument {
                action: self.action.to_string(),
                name: name.to_string(),
            }),
        }
    }

    fn optional<T: DeserializeOwned>(
        &self,
        index: usize,
        name: &str,
    ) -> Result<Option<T>, HandlerError> {
        match self.lookup(index, name) {
            None | Some(Value::Null) => Ok(None),
            Some(value) => self.decode(name, value).map(Some),
        }
    }
}

impl WorkerRequest {
    /// Decode a request line into a typed request.
    pub fn parse(msg: &WorkerMessage) -> Result<Self, HandlerError> {
        let a = Arguments {
            action: &msg.action,
            args: &msg.args,
            kwargs: &msg.kwargs,
        };

        let request = match msg.action.as_str() {
            "log" => Self::Log {
                level: a.optional(0, "level")?.unwrap_or(LogLevel::Info),
                message: a.required(1, "message")?,
            },
            "get_dataset" => Self::GetDataset {
                key: a.required(0, "key")?,
            },
            "update_dataset" => Self::UpdateDataset {
                key: a.required(0, "key")?,
                value: a.optional(1, "value")?.unwrap_or(Value::Null),
            },
            "create_watchdog" => Self::CreateWatchdog {
                timeout: a.required(0, "timeout")?,
            },
            "delete_watchdog" => Self::DeleteWatchdog {
                id: a.required(0, "id")?,
            },
            "scheduler_submit" => Self::Scheduler(SchedulerQuery::Submit {
                pipeline_name: a.required(0, "pipeline_name")?,
                expid: a.required(1, "expid")?,
                priority: a.optional(2, "priority")?.unwrap_or(0),
                due_date: a.optional(3, "due_date")?,
                flush: a.optional(4, "flush")?.unwrap_or(false),
            }),
            "scheduler_delete" => Self::Scheduler(SchedulerQuery::Delete {
                rid: a.required(0, "rid")?,
            }),
            "scheduler_request_termination" => {
                Self::Scheduler(SchedulerQuery::RequestTermination {
                    rid: a.required(0, "rid")?,
                })
            }
            "scheduler_get_status" => Self::Scheduler(SchedulerQuery::GetStatus),
            "scheduler_check_pause" => Self::Scheduler(SchedulerQuery::CheckPause {
                rid: a.required(0, "rid")?,
            }),
            "scheduler_check_termination" => Self::Scheduler(SchedulerQuery::CheckTermination {
                rid: a.required(0, "rid")?,
            }),
            other => return Err(HandlerError::UnknownRequest(other.to_string())),
        };
        Ok(request)
    }

    /// Encode as a keyword-argument request line.
    pub fn to_message(&self) -> WorkerMessage {
        let (action, kwargs) = match self {
            Self::Log { level, message } => (
                "log",
                kwargs([("level", to_value(level)), ("message", to_value(message))]),
            ),
            Self::GetDataset { key } => ("get_dataset", kwargs([("key", to_value(key))])),
            Self::UpdateDataset { key, value } => (
                "update_dataset",
                kwargs([("key", to_value(key)), ("value", value.clone())]),
            ),
            Self::CreateWatchdog { timeout } => {
                ("create_watchdog", kwargs([("timeout", to_value(timeout))]))
            }
            Self::DeleteWatchdog { id } => ("delete_watchdog", kwargs([("id", to_value(id))])),
            Self::Scheduler(query) => match query {
                SchedulerQuery::Submit {
                    pipeline_name,
                    expid,
                    priority,
                    due_date,
                    flush,
                } => (
                    "scheduler_submit",
                    kwargs([
                        ("pipeline_name", to_value(pipeline_name)),
                        ("expid", to_value(expid)),
                        ("priority", to_value(priority)),
                        ("due_date", to_value(due_date)),
                        ("flush", to_value(flush)),
                    ]),
                ),
                SchedulerQuery::Delete { rid } => {
                    ("scheduler_delete", kwargs([("rid", to_value(rid))]))
                }
                SchedulerQuery::RequestTermination { rid } => (
                    "scheduler_request_termination",
                    kwargs([("rid", to_value(rid))]),
                ),
                SchedulerQuery::GetStatus => ("scheduler_get_status", Map::new()),
                SchedulerQuery::CheckPause { rid } => {
                    ("scheduler_check_pause", kwargs([("rid", to_value(rid))]))
                }
                SchedulerQuery::CheckTermination { rid } => (
                    "scheduler_check_termination",
                    kwargs([("rid", to_value(rid))]),
                ),
            },
        };

        WorkerMessage {
            action: action.to_string(),
            kwargs,
            ..WorkerMessage::default()
        }
    }
}

fn to_value<T: Serialize>(value: T) -> Value {
    serde_json::to_value(value).unwrap_or(Value::Null)
}

fn kwargs<const N: usize>(pairs: [(&str, Value); N]) -> Map<String, Value> {
    pairs
        .into_iter()
        .map(|(k, v)| (k.to_string(), v))
        .collect()
}
