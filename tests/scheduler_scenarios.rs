//! End-to-end scheduling through the facade with real worker subprocesses.
//!
//! Each test starts a scheduler over a temporary results tree and
//! repository, runs `exp_worker` for every experiment, and watches the
//! published schedule.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use serde_json::{Value, json};
use tempfile::TempDir;
use tokio::sync::{Notify, broadcast};
use tokio::time::{sleep, timeout};

use exp_master::config::{SchedulerConfig, WorkerConfig};
use exp_master::datasets::DatasetDb;
use exp_master::error::{RepositoryError, SchedulerError};
use exp_master::notifier::{Modification, RunInfo};
use exp_master::protocol::Expid;
use exp_master::repository::{Checkout, ExperimentRepo, FilesystemBackend, RepositoryBackend};
use exp_master::scheduler::{Rid, RunStatus, Scheduler, SchedulerDeps};

struct Harness {
    dir: TempDir,
    scheduler: Scheduler,
    datasets: Arc<DatasetDb>,
    repository: Arc<ExperimentRepo>,
}

fn scheduler_config(dir: &Path) -> SchedulerConfig {
    let results_dir = dir.join("results");
    SchedulerConfig {
        worker: WorkerConfig::with_program(env!("CARGO_BIN_EXE_exp_worker"))
            .with_term_timeout(Duration::from_millis(500))
            .with_env("EXP_RESULTS_DIR", results_dir.display().to_string()),
        results_dir,
        rid_cache: dir.join("last_rid.json"),
        submission_log: Some(dir.join("submissions.jsonl")),
    }
}

impl Harness {
    fn start() -> Self {
        Self::start_in(TempDir::new().unwrap())
    }

    fn start_in(dir: TempDir) -> Self {
        let repo_root = dir.path().join("repository");
        std::fs::create_dir_all(&repo_root).unwrap();
        let repository = Arc::new(ExperimentRepo::new(Arc::new(FilesystemBackend::new(
            repo_root,
        ))));
        let datasets = Arc::new(DatasetDb::new());
        let scheduler = Scheduler::start(
            scheduler_config(dir.path()),
            SchedulerDeps {
                repository: repository.clone(),
                datasets: datasets.clone(),
            },
        );
        Self {
            dir,
            scheduler,
            datasets,
            repository,
        }
    }

    async fn submit(&self, expid: Expid, priority: i32) -> Rid {
        self.scheduler
            .submit("main", expid, priority, None, false)
            .await
            .unwrap()
    }

    async fn wait_until(&self, what: &str, condition: impl Fn(&BTreeMap<Rid, RunInfo>) -> bool) {
        let reached = timeout(Duration::from_secs(15), async {
            loop {
                if condition(&self.scheduler.get_status().await) {
                    return;
                }
                sleep(Duration::from_millis(20)).await;
            }
        })
        .await;
        assert!(reached.is_ok(), "Timed out waiting for {what}");
    }

    async fn wait_for_status(&self, rid: Rid, status: RunStatus) {
        self.wait_until(&format!("run {rid} to be {status}"), |s| {
            s.get(&rid).is_some_and(|info| info.status == status)
        })
        .await;
    }

    async fn wait_gone(&self, rid: Rid) {
        self.wait_until(&format!("run {rid} to be deleted"), |s| !s.contains_key(&rid))
            .await;
    }

    async fn wait_idle(&self) {
        self.wait_until("an empty schedule", |s| s.is_empty()).await;
    }

    fn results_file(&self, rid: Rid) -> Option<PathBuf> {
        find_file(&self.dir.path().join("results"), &format!("{rid:09}-"))
    }
}

fn find_file(root: &Path, prefix: &str) -> Option<PathBuf> {
    for entry in std::fs::read_dir(root).ok()?.flatten() {
        let path = entry.path();
        if path.is_dir() {
            if let Some(found) = find_file(&path, prefix) {
                return Some(found);
            }
        } else if path
            .file_name()
            .and_then(|n| n.to_str())
            .is_some_and(|n| n.starts_with(prefix))
        {
            return Some(path);
        }
    }
    None
}

/// Every status change seen so far, in publication order. Insertions show
/// up as `pending`, removals as `removed`.
fn drain_events(rx: &mut broadcast::Receiver<Modification>) -> Vec<(Rid, String)> {
    let mut events = Vec::new();
    loop {
        let modification = match rx.try_recv() {
            Ok(modification) => modification,
            Err(broadcast::error::TryRecvError::Lagged(_)) => continue,
            Err(_) => break,
        };
        match modification {
            Modification::Setitem { path, key, value } if path.is_empty() => {
                events.push((key.as_u64().unwrap(), value["status"].as_str().unwrap().to_string()));
            }
            Modification::Setitem { path, key, value } if key == "status" => {
                events.push((path[0].as_u64().unwrap(), value.as_str().unwrap().to_string()));
            }
            Modification::Delitem { key, .. } => {
                events.push((key.as_u64().unwrap(), "removed".to_string()));
            }
            _ => {}
        }
    }
    events
}

fn statuses_of(events: &[(Rid, String)], rid: Rid) -> Vec<&str> {
    events
        .iter()
        .filter(|(r, _)| *r == rid)
        .map(|(_, s)| s.as_str())
        .collect()
}

fn position(events: &[(Rid, String)], rid: Rid, status: &str) -> usize {
    events
        .iter()
        .position(|(r, s)| *r == rid && s == status)
        .unwrap_or_else(|| panic!("run {rid} never reached {status}: {events:?}"))
}

#[tokio::test]
async fn single_run_goes_through_every_stage() {
    let harness = Harness::start();
    let mut rx = harness.scheduler.subscribe();

    let rid = harness.submit(Expid::new("Noop"), 0).await;
    harness.wait_gone(rid).await;

    let events = drain_events(&mut rx);
    assert_eq!(
        statuses_of(&events, rid),
        vec![
            "pending",
            "preparing",
            "prepare_done",
            "running",
            "run_done",
            "analyzing",
            "deleting",
            "removed"
        ]
    );

    let results = harness.results_file(rid).expect("results written");
    let results: Value = serde_json::from_str(&std::fs::read_to_string(results).unwrap()).unwrap();
    assert_eq!(results["rid"], json!(rid));
    assert_eq!(results["pipeline"], json!("main"));
    assert_eq!(results["expid"]["class_name"], json!("Noop"));
}

#[tokio::test]
async fn higher_priority_run_preempts_background_run() {
    let harness = Harness::start();
    let mut rx = harness.scheduler.subscribe();

    let background = harness
        .submit(Expid::new("PauseLoop").with_argument("interval", 0.05), -99)
        .await;
    // `paused` is only held until the stage resumes it.
    harness.wait_for_status(background, RunStatus::Running).await;
    sleep(Duration::from_millis(200)).await;

    let urgent = harness.submit(Expid::new("Noop"), 0).await;
    harness.wait_gone(urgent).await;
    assert!(harness.scheduler.get_status().await.contains_key(&background));

    let events = drain_events(&mut rx);
    let urgent_running = position(&events, urgent, "running");
    assert!(
        events[..urgent_running]
            .iter()
            .any(|(r, s)| *r == background && s == "paused"),
        "background run must yield before the urgent one starts"
    );

    harness.scheduler.request_termination(background).await;
    harness.wait_gone(background).await;
    assert_eq!(
        harness.datasets.get("termination_ok").await.unwrap(),
        json!(true)
    );
    // Graceful termination still completes the run normally.
    assert!(harness.results_file(background).is_some());
}

#[tokio::test]
async fn check_pause_only_yields_when_outranked() {
    let harness = Harness::start();

    let background = harness
        .submit(
            Expid::new("PauseLoop")
                .with_argument("interval", 0.05)
                .with_argument("check_pause", true),
            0,
        )
        .await;
    harness.wait_for_status(background, RunStatus::Running).await;

    // Nothing is waiting, so the run keeps running.
    sleep(Duration::from_millis(300)).await;
    assert!(!harness.scheduler.check_pause(background).await.unwrap());
    assert_eq!(
        harness.scheduler.get_status().await[&background].status,
        RunStatus::Running
    );

    let urgent = harness.submit(Expid::new("Noop"), 5).await;
    harness.wait_gone(urgent).await;

    harness.scheduler.request_termination(background).await;
    harness.wait_gone(background).await;
    assert_eq!(
        harness.datasets.get("termination_ok").await.unwrap(),
        json!(true)
    );
}

#[tokio::test]
async fn flush_waits_for_equal_priority_runs() {
    let harness = Harness::start();
    let mut rx = harness.scheduler.subscribe();

    let first = harness
        .submit(Expid::new("Sleep").with_argument("duration", 0.5), 0)
        .await;
    harness.wait_for_status(first, RunStatus::Running).await;

    let flush = harness
        .scheduler
        .submit("main", Expid::new("Noop"), 0, None, true)
        .await
        .unwrap();
    harness.wait_for_status(flush, RunStatus::Flushing).await;
    harness.wait_idle().await;

    let events = drain_events(&mut rx);
    assert!(position(&events, flush, "preparing") > position(&events, first, "deleting"));
}

#[tokio::test]
async fn flush_ignores_lower_priority_runs() {
    let harness = Harness::start();
    let mut rx = harness.scheduler.subscribe();

    let first = harness
        .submit(Expid::new("Sleep").with_argument("duration", 1.0), 0)
        .await;
    harness.wait_for_status(first, RunStatus::Running).await;

    let flush = harness
        .scheduler
        .submit("main", Expid::new("Noop"), 1, None, true)
        .await
        .unwrap();
    harness.wait_idle().await;

    let events = drain_events(&mut rx);
    assert!(statuses_of(&events, flush).contains(&"flushing"));
    assert!(position(&events, flush, "prepare_done") < position(&events, first, "run_done"));
}

#[tokio::test]
async fn due_date_delays_preparation() {
    let harness = Harness::start();
    let due = Utc::now() + chrono::Duration::milliseconds(600);
    let rid = harness
        .scheduler
        .submit("main", Expid::new("Noop"), 0, Some(due), false)
        .await
        .unwrap();

    sleep(Duration::from_millis(200)).await;
    assert_eq!(
        harness.scheduler.get_status().await[&rid].status,
        RunStatus::Pending
    );
    harness.wait_gone(rid).await;
    assert!(Utc::now() >= due);
}

#[tokio::test]
async fn terminating_pending_run_deletes_it() {
    let harness = Harness::start();
    let due = Utc::now() + chrono::Duration::hours(1);
    let rid = harness
        .scheduler
        .submit("main", Expid::new("Noop"), 0, Some(due), false)
        .await
        .unwrap();

    harness.scheduler.request_termination(rid).await;
    harness.wait_gone(rid).await;
    assert!(harness.results_file(rid).is_none());
}

#[tokio::test]
async fn failing_run_does_not_stop_the_pipeline() {
    let harness = Harness::start();

    let failing = harness
        .submit(Expid::new("Fail").with_argument("stage", "run"), 0)
        .await;
    let healthy = harness.submit(Expid::new("Noop"), 0).await;
    harness.wait_idle().await;

    assert!(harness.results_file(failing).is_none());
    assert!(harness.results_file(healthy).is_some());
}

#[tokio::test]
async fn failure_in_build_is_isolated() {
    let harness = Harness::start();

    let broken = harness
        .submit(Expid::new("Fail").with_argument("stage", "build"), 0)
        .await;
    let unknown = harness.submit(Expid::new("DoesNotExist"), 0).await;
    let healthy = harness.submit(Expid::new("Noop"), 0).await;
    harness.wait_idle().await;

    assert!(harness.results_file(broken).is_none());
    assert!(harness.results_file(unknown).is_none());
    assert!(harness.results_file(healthy).is_some());
}

#[tokio::test]
async fn expired_watchdog_kills_the_run() {
    let harness = Harness::start();

    let started = std::time::Instant::now();
    let rid = harness
        .submit(
            Expid::new("Watchdog")
                .with_argument("timeout", 0.1)
                .with_argument("duration", 30.0),
            0,
        )
        .await;
    harness.wait_gone(rid).await;

    assert!(started.elapsed() < Duration::from_secs(10));
    assert!(harness.results_file(rid).is_none());
}

#[tokio::test]
async fn rids_increase_across_restarts() {
    let dir = TempDir::new().unwrap();
    let harness = Harness::start_in(dir);

    let mut rids = Vec::new();
    for _ in 0..3 {
        rids.push(harness.submit(Expid::new("Noop"), 0).await);
    }
    assert!(rids.windows(2).all(|w| w[0] < w[1]));
    harness.wait_idle().await;
    harness.scheduler.stop().await;

    let restarted = Harness::start_in(harness.dir);
    let next = restarted.submit(Expid::new("Noop"), 0).await;
    assert!(next > rids[2]);
    restarted.wait_idle().await;
}

#[tokio::test]
async fn datasets_flow_between_runs() {
    let harness = Harness::start();

    let producer = harness
        .submit(
            Expid::new("Datasets")
                .with_argument("key", "source")
                .with_argument("value", json!({"counts": [1, 2, 3]})),
            0,
        )
        .await;
    harness.wait_gone(producer).await;

    let consumer = harness
        .submit(
            Expid::new("Datasets")
                .with_argument("key", "copy")
                .with_argument("source", "source"),
            0,
        )
        .await;
    harness.wait_gone(consumer).await;

    assert_eq!(
        harness.datasets.get("copy").await.unwrap(),
        json!({"counts": [1, 2, 3]})
    );
}

#[tokio::test]
async fn experiment_can_submit_to_another_pipeline() {
    let harness = Harness::start();

    let submitter = harness
        .submit(Expid::new("Submit").with_argument("pipeline", "side"), 0)
        .await;
    harness.wait_idle().await;

    let submitted = harness.datasets.get("submitted_rid").await.unwrap();
    let submitted = submitted.as_u64().unwrap();
    assert!(submitted > submitter);
    assert!(harness.results_file(submitted).is_some());
}

#[tokio::test]
async fn repository_runs_hold_their_revision() {
    let harness = Harness::start();
    let repo = harness.dir.path().join("repository");
    std::fs::write(repo.join("HEAD"), "r1\n").unwrap();
    std::fs::create_dir_all(repo.join("r1")).unwrap();
    std::fs::write(repo.join("r1").join("MESSAGE"), "first revision\n").unwrap();

    let due = Utc::now() + chrono::Duration::hours(1);
    let rid = harness
        .scheduler
        .submit(
            "main",
            Expid::new("Noop").from_repository(None),
            0,
            Some(due),
            false,
        )
        .await
        .unwrap();

    let info = harness.scheduler.get_status().await[&rid].clone();
    assert_eq!(info.repo_msg.as_deref(), Some("first revision"));
    assert_eq!(info.expid.repo_rev, Some(Some("r1".to_string())));
    assert_eq!(harness.repository.refcount("r1").await, 1);

    harness.scheduler.delete(rid).await;
    harness.wait_gone(rid).await;
    let released = timeout(Duration::from_secs(5), async {
        while harness.repository.refcount("r1").await > 0 {
            sleep(Duration::from_millis(20)).await;
        }
    })
    .await;
    assert!(released.is_ok(), "revision still referenced");

    let missing = harness
        .scheduler
        .submit(
            "main",
            Expid::new("Noop").from_repository(Some("nope".to_string())),
            0,
            None,
            false,
        )
        .await;
    assert!(matches!(missing, Err(SchedulerError::Repository(_))));
}

#[tokio::test]
async fn empty_pipelines_are_collected() {
    let harness = Harness::start();

    let due = Utc::now() + chrono::Duration::milliseconds(300);
    let rid = harness
        .scheduler
        .submit("transient", Expid::new("Noop"), 0, Some(due), false)
        .await
        .unwrap();
    assert_eq!(harness.scheduler.pipeline_names().await, vec!["transient"]);
    harness.wait_gone(rid).await;

    let collected = timeout(Duration::from_secs(5), async {
        while !harness.scheduler.pipeline_names().await.is_empty() {
            sleep(Duration::from_millis(20)).await;
        }
    })
    .await;
    assert!(collected.is_ok());
}

#[tokio::test]
async fn stop_tears_everything_down() {
    let harness = Harness::start();

    let rid = harness
        .submit(Expid::new("Stubborn").with_argument("duration", 60.0), 0)
        .await;
    harness.wait_for_status(rid, RunStatus::Running).await;

    timeout(Duration::from_secs(10), harness.scheduler.stop())
        .await
        .expect("stop finishes");
    assert!(harness.scheduler.get_status().await.is_empty());
    assert!(harness.scheduler.pipeline_names().await.is_empty());

    let rejected = harness
        .scheduler
        .submit("main", Expid::new("Noop"), 0, None, false)
        .await;
    assert!(matches!(rejected, Err(SchedulerError::Terminated)));
}

#[tokio::test]
async fn submissions_are_logged() {
    let harness = Harness::start();
    let rid = harness.submit(Expid::new("Noop"), 3).await;
    harness.wait_gone(rid).await;

    let log = std::fs::read_to_string(harness.dir.path().join("submissions.jsonl")).unwrap();
    let record: Value = serde_json::from_str(log.lines().next().unwrap()).unwrap();
    assert_eq!(record["rid"], json!(rid));
    assert_eq!(record["priority"], json!(3));
    assert_eq!(record["expid"]["class_name"], json!("Noop"));
}

#[tokio::test]
async fn ready_run_overtakes_higher_priority_run_due_later() {
    let harness = Harness::start();
    let mut rx = harness.scheduler.subscribe();

    let due = Utc::now() + chrono::Duration::seconds(100_000);
    let later = harness
        .scheduler
        .submit("main", Expid::new("Noop"), 99, Some(due), false)
        .await
        .unwrap();
    let ready = harness.submit(Expid::new("Noop"), 0).await;
    assert_eq!((later, ready), (0, 1));

    harness.wait_gone(ready).await;
    assert_eq!(
        harness.scheduler.get_status().await[&later].status,
        RunStatus::Pending
    );
    let events = drain_events(&mut rx);
    assert!(statuses_of(&events, ready).contains(&"deleting"));
    assert_eq!(statuses_of(&events, later), vec!["pending"]);
    assert!(harness.results_file(ready).is_some());

    harness.scheduler.delete(later).await;
    harness.wait_gone(later).await;
}

#[tokio::test]
async fn paused_run_resumes_before_lower_priority_run_starts() {
    let harness = Harness::start();
    let mut rx = harness.scheduler.subscribe();

    let high = harness
        .submit(Expid::new("PauseLoop").with_argument("interval", 0.05), 5)
        .await;
    harness.wait_for_status(high, RunStatus::Running).await;
    let low = harness.submit(Expid::new("Noop"), 0).await;
    harness.wait_for_status(low, RunStatus::PrepareDone).await;

    // The high run keeps pausing, and keeps being resumed first.
    sleep(Duration::from_millis(500)).await;
    assert_eq!(
        harness.scheduler.get_status().await[&low].status,
        RunStatus::PrepareDone
    );
    let events = drain_events(&mut rx);
    assert_eq!(
        statuses_of(&events, low),
        vec!["pending", "preparing", "prepare_done"]
    );
    assert!(statuses_of(&events, high).contains(&"paused"));

    harness.scheduler.request_termination(high).await;
    harness.wait_idle().await;
    let events = drain_events(&mut rx);
    assert!(position(&events, low, "running") > position(&events, high, "run_done"));
}

/// Filesystem repository whose `head` waits until it is opened.
struct GatedBackend {
    inner: FilesystemBackend,
    opened: Notify,
}

#[async_trait]
impl RepositoryBackend for GatedBackend {
    async fn head(&self) -> Result<String, RepositoryError> {
        self.opened.notified().await;
        self.inner.head().await
    }

    async fn checkout(&self, rev: &str) -> Result<Checkout, RepositoryError> {
        self.inner.checkout(rev).await
    }

    async fn release(&self, rev: &str) -> Result<(), RepositoryError> {
        self.inner.release(rev).await
    }
}

#[tokio::test]
async fn slow_repository_does_not_hold_up_the_scheduler() {
    let dir = TempDir::new().unwrap();
    let repo_root = dir.path().join("repository");
    std::fs::create_dir_all(&repo_root).unwrap();
    let backend = Arc::new(GatedBackend {
        inner: FilesystemBackend::new(repo_root),
        opened: Notify::new(),
    });
    let repository = Arc::new(ExperimentRepo::new(backend.clone()));
    let datasets = Arc::new(DatasetDb::new());
    let scheduler = Scheduler::start(
        scheduler_config(dir.path()),
        SchedulerDeps {
            repository: repository.clone(),
            datasets: datasets.clone(),
        },
    );
    let harness = Harness {
        dir,
        scheduler,
        datasets,
        repository,
    };

    let waiting = tokio::spawn({
        let scheduler = harness.scheduler.clone();
        async move {
            scheduler
                .submit("main", Expid::new("Noop").from_repository(None), 0, None, false)
                .await
        }
    });
    sleep(Duration::from_millis(100)).await;
    assert!(!waiting.is_finished());

    let quick = timeout(Duration::from_secs(5), harness.submit(Expid::new("Noop"), 0))
        .await
        .expect("submission waited on the repository");
    assert!(
        timeout(Duration::from_secs(5), harness.scheduler.check_pause(quick))
            .await
            .is_ok()
    );
    harness.wait_gone(quick).await;

    backend.opened.notify_one();
    let resolved = timeout(Duration::from_secs(5), waiting)
        .await
        .expect("repository submission finishes once head resolves")
        .unwrap()
        .unwrap();
    assert!(resolved > quick);
    harness.wait_gone(resolved).await;
    assert!(harness.results_file(resolved).is_some());
}
