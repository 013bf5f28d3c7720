//! Built-in experiments, looked up by class name.

use std::time::Duration;

use serde::de::DeserializeOwned;
use serde_json::{Map, Value};

use super::host::Host;
use crate::error::ExperimentError;
use crate::protocol::{Expid, LogLevel};

/// An experiment hosted in the worker subprocess.
///
/// `build` is construction (see [`create`]); the remaining stages map to
/// the master's actions.
pub trait Experiment: Send {
    fn prepare(&mut self, _host: &mut Host) -> Result<(), ExperimentError> {
        Ok(())
    }

    fn run(&mut self, host: &mut Host) -> Result<(), ExperimentError>;

    fn analyze(&mut self, _host: &mut Host) -> Result<(), ExperimentError> {
        Ok(())
    }
}

/// Build the experiment named by `expid.class_name`.
pub fn create(expid: &Expid) -> Result<Box<dyn Experiment>, ExperimentError> {
    let args = Arguments(&expid.arguments);
    let experiment: Box<dyn Experiment> = match expid.class_name.as_str() {
        "Noop" => Box::new(Noop),
        "Sleep" => Box::new(Sleep {
            duration: args.seconds("duration", 0.1)?,
        }),
        "PauseLoop" => Box::new(PauseLoop {
            interval: args.seconds("interval", 0.2)?,
            only_when_needed: args.get("check_pause", false)?,
        }),
        "Fail" => {
            let stage: String = args.get("stage", "run".to_string())?;
            if stage == "build" {
                return Err(ExperimentError::Failed("failing in build".to_string()));
            }
            Box::new(Fail { stage })
        }
        "Watchdog" => Box::new(WatchdogOverrun {
            timeout: args.seconds("timeout", 0.1)?,
            duration: args.seconds("duration", 1.0)?,
        }),
        "Stubborn" => Box::new(Stubborn {
            duration: args.seconds("duration", 3600.0)?,
        }),
        "Datasets" => Box::new(Datasets {
            key: args.get("key", "value".to_string())?,
            value: args.get("value", Value::Null)?,
            source: args.get("source", None)?,
        }),
        "Submit" => Box::new(Submit {
            pipeline: args.get("pipeline", "main".to_string())?,
            class_name: args.get("class_name", "Noop".to_string())?,
            priority: args.get("priority", 0)?,
        }),
        other => return Err(ExperimentError::UnknownClass(other.to_string())),
    };
    Ok(experiment)
}

struct Arguments<'a>(&'a Map<String, Value>);

impl Arguments<'_> {
    fn get<T: DeserializeOwned>(&self, name: &str, default: T) -> Result<T, ExperimentError> {
        match self.0.get(name) {
            None => Ok(default),
            Some(value) => serde_json::from_value(value.clone()).map_err(|e| {
                ExperimentError::InvalidArgument {
                    name: name.to_string(),
                    reason: e.to_string(),
                }
            }),
        }
    }

    fn seconds(&self, name: &str, default: f64) -> Result<Duration, ExperimentError> {
        let secs: f64 = self.get(name, default)?;
        Duration::try_from_secs_f64(secs).map_err(|e| ExperimentError::InvalidArgument {
            name: name.to_string(),
            reason: e.to_string(),
        })
    }
}

struct Noop;

impl Experiment for Noop {
    fn run(&mut self, _host: &mut Host) -> Result<(), ExperimentError> {
        Ok(())
    }
}

struct Sleep {
    duration: Duration,
}

impl Experiment for Sleep {
    fn run(&mut self, _host: &mut Host) -> Result<(), ExperimentError> {
        std::thread::sleep(self.duration);
        Ok(())
    }
}

/// Background work that yields forever until terminated.
struct PauseLoop {
    interval: Duration,
    /// Pause only when the scheduler says another run is waiting.
    only_when_needed: bool,
}

impl Experiment for PauseLoop {
    fn run(&mut self, host: &mut Host) -> Result<(), ExperimentError> {
        let result = loop {
            let pause = !self.only_when_needed || host.check_pause()?;
            if pause {
                if let Err(e) = host.pause() {
                    break e;
                }
            }
            std::thread::sleep(self.interval);
        };
        if matches!(result, ExperimentError::TerminationRequested) {
            host.set_dataset("termination_ok", Value::Bool(true), true)?;
        }
        Err(result)
    }
}

struct Fail {
    stage: String,
}

impl Fail {
    fn fail_in(&self, stage: &str) -> Result<(), ExperimentError> {
        if self.stage == stage {
            Err(ExperimentError::Failed(format!("failing in {stage}")))
        } else {
            Ok(())
        }
    }
}

impl Experiment for Fail {
    fn prepare(&mut self, _host: &mut Host) -> Result<(), ExperimentError> {
        self.fail_in("prepare")
    }

    fn run(&mut self, _host: &mut Host) -> Result<(), ExperimentError> {
        self.fail_in("run")
    }

    fn analyze(&mut self, _host: &mut Host) -> Result<(), ExperimentError> {
        self.fail_in("analyze")
    }
}

/// Arms a watchdog shorter than the work it guards.
struct WatchdogOverrun {
    timeout: Duration,
    duration: Duration,
}

impl Experiment for WatchdogOverrun {
    fn run(&mut self, host: &mut Host) -> Result<(), ExperimentError> {
        let id = host.create_watchdog(self.timeout)?;
        std::thread::sleep(self.duration);
        host.delete_watchdog(id)
    }
}

/// Never reads its input while running, so only signals stop it.
struct Stubborn {
    duration: Duration,
}

impl Experiment for Stubborn {
    fn run(&mut self, _host: &mut Host) -> Result<(), ExperimentError> {
        std::thread::sleep(self.duration);
        Ok(())
    }
}

/// Publishes a dataset, optionally copied from another one.
struct Datasets {
    key: String,
    value: Value,
    source: Option<String>,
}

impl Experiment for Datasets {
    fn run(&mut self, host: &mut Host) -> Result<(), ExperimentError> {
        let value = match &self.source {
            Some(source) => host.get_dataset(source)?,
            None => self.value.clone(),
        };
        host.set_dataset(&self.key, value, true)
    }

    fn analyze(&mut self, host: &mut Host) -> Result<(), ExperimentError> {
        host.log(LogLevel::Info, format!("published dataset {}", self.key))
    }
}

/// Submits another run through the master.
struct Submit {
    pipeline: String,
    class_name: String,
    priority: i32,
}

impl Experiment for Submit {
    fn run(&mut self, host: &mut Host) -> Result<(), ExperimentError> {
        let rid = host.submit(
            &self.pipeline,
            Expid::new(self.class_name.clone()),
            self.priority,
            None,
            false,
        )?;
        host.set_dataset("submitted_rid", Value::from(rid), true)
    }
}
