//! RID issuing with restart recovery.
//!
//! The last issued RID is cached in a small JSON file. When the cache is
//! missing, the counter resumes after the highest RID found in the results
//! tree (`<results>/YYYY-MM-DD/HH[-MM]/NNNNNNNNN-*`).

use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};

use regex::Regex;
use serde::{Deserialize, Serialize};
use tokio::fs;
use tracing::{debug, info, warn};

use crate::scheduler::Rid;

#[derive(Debug, Serialize, Deserialize)]
struct RidCache {
    last_rid: Rid,
}

/// Strictly increasing RID source.
#[derive(Debug)]
pub struct RidCounter {
    next: Mutex<Rid>,
    /// Last RID written to the cache; writes never move it backwards.
    persisted: tokio::sync::Mutex<Option<Rid>>,
    cache: PathBuf,
}

impl RidCounter {
    /// Resume from `cache`, falling back to a scan of `results_dir`.
    pub fn open(cache: impl Into<PathBuf>, results_dir: &Path) -> Self {
        let cache = cache.into();
        let next = match read_cache(&cache) {
            Some(last) => last + 1,
            None => {
                let next = scan_results(results_dir).map_or(0, |last| last + 1);
                debug!(results = %results_dir.display(), next, "RID cache missing, scanned results");
                next
            }
        };
        info!(next, "RID counter ready");
        Self {
            next: Mutex::new(next),
            persisted: tokio::sync::Mutex::new(None),
            cache,
        }
    }

    /// Issue the next RID and persist it as the last one.
    pub async fn issue(&self) -> Rid {
        let rid = {
            let mut next = self.next.lock().unwrap_or_else(PoisonError::into_inner);
            let rid = *next;
            *next += 1;
            rid
        };
        let mut persisted = self.persisted.lock().await;
        if persisted.is_some_and(|last| last > rid) {
            return rid;
        }
        match write_cache(&self.cache, rid).await {
            Ok(()) => *persisted = Some(rid),
            Err(e) => warn!(path = %self.cache.display(), error = %e, "failed to update RID cache"),
        }
        rid
    }

    /// RID the next `issue` will return.
    pub fn peek(&self) -> Rid {
        *self.next.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn read_cache(path: &Path) -> Option<Rid> {
    let content = std::fs::read_to_string(path).ok()?;
    match serde_json::from_str::<RidCache>(&content) {
        Ok(cache) => Some(cache.last_rid),
        Err(e) => {
            warn!(path = %path.display(), error = %e, "ignoring unreadable RID cache");
            None
        }
    }
}

/// Write through a temporary file so a crash never leaves a torn cache.
async fn write_cache(path: &Path, last_rid: Rid) -> std::io::Result<()> {
    let tmp = path.with_extension("json.tmp");
    fs::write(&tmp, serde_json::to_vec(&RidCache { last_rid })?).await?;
    fs::rename(&tmp, path).await
}

/// Highest RID prefix in the results tree.
fn scan_results(root: &Path) -> Option<Rid> {
    let date_dir = Regex::new(r"^\d{4}-\d{2}-\d{2}$").ok()?;
    let hour_dir = Regex::new(r"^\d{2}(-\d{2})?$").ok()?;
    let result_file = Regex::new(r"^(\d{9})-").ok()?;

    let mut last = None;
    for date in subdirs(root, &date_dir) {
        for hour in subdirs(&date, &hour_dir) {
            let Ok(entries) = std::fs::read_dir(&hour) else {
                continue;
            };
            for entry in entries.flatten() {
                let name = entry.file_name();
                let Some(caps) = name.to_str().and_then(|n| result_file.captures(n)) else {
                    continue;
                };
                if let Ok(rid) = caps[1].parse::<Rid>() {
                    last = last.max(Some(rid));
                }
            }
        }
    }
    last
}

fn subdirs(dir: &Path, pattern: &Regex) -> Vec<PathBuf> {
    let Ok(entries) = std::fs::read_dir(dir) else {
        return Vec::new();
    };
    entries
        .flatten()
        .filter(|e| e.file_type().map(|t| t.is_dir()).unwrap_or(false))
        .filter(|e| e.file_name().to_str().is_some_and(|n| pattern.is_match(n)))
        .map(|e| e.path())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn fresh_counter_starts_at_zero() {
        let dir = tempfile::tempdir().unwrap();
        let counter = RidCounter::open(dir.path().join("last_rid.json"), &dir.path().join("results"));
        assert_eq!(counter.issue().await, 0);
        assert_eq!(counter.issue().await, 1);
        assert_eq!(counter.peek(), 2);
    }

    #[tokio::test]
    async fn cache_survives_restart() {
        let dir = tempfile::tempdir().unwrap();
        let cache = dir.path().join("last_rid.json");
        let results = dir.path().join("results");
        {
            let counter = RidCounter::open(&cache, &results);
            for _ in 0..5 {
                counter.issue().await;
            }
        }
        let counter = RidCounter::open(&cache, &results);
        assert_eq!(counter.issue().await, 5);
    }

    #[tokio::test]
    async fn missing_cache_scans_results() {
        let dir = tempfile::tempdir().unwrap();
        let results = dir.path().join("results");
        let hour = results.join("2024-03-01").join("14");
        std::fs::create_dir_all(&hour).unwrap();
        std::fs::write(hour.join("000000041-Scan.json"), "{}").unwrap();
        std::fs::write(hour.join("000000007-Noop.json"), "{}").unwrap();
        std::fs::write(hour.join("notes.txt"), "").unwrap();
        let minute = results.join("2024-03-02").join("09-30");
        std::fs::create_dir_all(&minute).unwrap();
        std::fs::write(minute.join("000000012-Noop.json"), "{}").unwrap();
        std::fs::create_dir_all(results.join("scratch").join("10")).unwrap();
        std::fs::write(results.join("scratch/10/000000999-X.json"), "{}").unwrap();

        let counter = RidCounter::open(dir.path().join("last_rid.json"), &results);
        assert_eq!(counter.issue().await, 42);
    }

    #[tokio::test]
    async fn corrupt_cache_falls_back_to_scan() {
        let dir = tempfile::tempdir().unwrap();
        let cache = dir.path().join("last_rid.json");
        std::fs::write(&cache, "not json").unwrap();
        let counter = RidCounter::open(&cache, &dir.path().join("results"));
        assert_eq!(counter.issue().await, 0);
    }

    #[tokio::test]
    async fn concurrent_issues_cache_the_highest_rid() {
        let dir = tempfile::tempdir().unwrap();
        let cache = dir.path().join("last_rid.json");
        let results = dir.path().join("results");
        let counter = RidCounter::open(&cache, &results);

        let (a, b, c) = tokio::join!(counter.issue(), counter.issue(), counter.issue());
        let mut issued = vec![a, b, c];
        issued.sort();
        assert_eq!(issued, vec![0, 1, 2]);

        let cached: RidCache = serde_json::from_str(&std::fs::read_to_string(&cache).unwrap()).unwrap();
        assert_eq!(cached.last_rid, 2);
        let leftovers = std::fs::read_dir(dir.path())
            .unwrap()
            .flatten()
            .filter(|e| e.file_name().to_string_lossy().ends_with(".tmp"))
            .count();
        assert_eq!(leftovers, 0);
        assert_eq!(RidCounter::open(&cache, &results).peek(), cached.last_rid + 1);
    }
}
