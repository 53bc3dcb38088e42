//! JSON-file backed store for invocation and per-test statistics.
//!
//! The file is read once, on first access. Invocation records are kept in
//! memory and the whole file is rewritten whenever an invocation finishes.
//! The data lock only covers taking a snapshot; the write itself runs on
//! `tokio::fs` behind a separate async gate so flushes land in order.

use super::types::*;

use anyhow::{Context, Result};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tokio::sync::Mutex as AsyncMutex;

pub const STATS_FILE_NAME: &str = "stats.json";

#[derive(Default)]
struct StatsData {
    invocations_by_id: HashMap<String, TestInvocationStats>,
    tests_by_full_name: HashMap<String, TestRunStats>,
}

pub struct StatRepo {
    state_folder: PathBuf,
    data: Mutex<Option<StatsData>>,
    write_gate: AsyncMutex<()>,
}

impl StatRepo {
    pub fn new(state_folder: impl Into<PathBuf>) -> Self {
        Self {
            state_folder: state_folder.into(),
            data: Mutex::new(None),
            write_gate: AsyncMutex::new(()),
        }
    }

    pub fn file_path(&self) -> PathBuf {
        self.state_folder.join(STATS_FILE_NAME)
    }

    pub fn invocation(&self, invocation_id: &str) -> Option<TestInvocationStats> {
        self.with_data(|data| data.invocations_by_id.get(invocation_id).cloned())
    }

    pub fn save_invocation(&self, invocation: TestInvocationStats) {
        self.with_data(|data| {
            data.invocations_by_id
                .insert(invocation.invocation_id.clone(), invocation);
        });
    }

    pub fn test_stats(&self, full_name: &str) -> Option<TestRunStats> {
        self.with_data(|data| data.tests_by_full_name.get(full_name).cloned())
    }

    pub fn test_stats_for<'a>(
        &self,
        full_names: impl IntoIterator<Item = &'a str>,
    ) -> HashMap<String, TestRunStats> {
        self.with_data(|data| {
            full_names
                .into_iter()
                .filter_map(|name| {
                    data.tests_by_full_name
                        .get(name)
                        .map(|s| (name.to_string(), s.clone()))
                })
                .collect()
        })
    }

    pub fn save_test(&self, stats: TestRunStats) {
        self.with_data(|data| {
            data.tests_by_full_name
                .insert(stats.test_full_name.clone(), stats);
        });
    }

    /// Every recorded result belonging to `invocation_id`.
    pub fn invocation_results(&self, invocation_id: &str) -> Vec<TestRunResult> {
        self.with_data(|data| {
            data.tests_by_full_name
                .values()
                .flat_map(|s| s.recent_results.iter())
                .filter(|r| r.invocation_id == invocation_id)
                .cloned()
                .collect()
        })
    }

    fn with_data<T>(&self, f: impl FnOnce(&mut StatsData) -> T) -> T {
        let mut guard = self.data.lock();
        let data = guard.get_or_insert_with(|| load(&self.file_path()));
        f(data)
    }

    /// Copy of the full state, tests and invocations sorted by key. `None`
    /// until something has been read or recorded.
    pub fn snapshot(&self) -> Option<StatsFile> {
        let guard = self.data.lock();
        let data = guard.as_ref()?;

        let mut file = StatsFile {
            invocation_stats: data.invocations_by_id.values().cloned().collect(),
            test_stats: data.tests_by_full_name.values().cloned().collect(),
        };
        file.invocation_stats
            .sort_by(|a, b| a.invocation_id.cmp(&b.invocation_id));
        file.test_stats
            .sort_by(|a, b| a.test_full_name.cmp(&b.test_full_name));
        Some(file)
    }

    /// Writes the full state out. The file is replaced through a rename so a
    /// reader never sees a half-written document.
    pub async fn flush(&self) -> Result<()> {
        let _gate = self.write_gate.lock().await;
        let Some(file) = self.snapshot() else {
            return Ok(());
        };

        tokio::fs::create_dir_all(&self.state_folder)
            .await
            .with_context(|| format!("Failed to create state folder {:?}", self.state_folder))?;
        let path = self.file_path();
        let staging = path.with_extension("json.tmp");
        let json = serde_json::to_vec_pretty(&file)?;
        tokio::fs::write(&staging, json)
            .await
            .with_context(|| format!("Failed to write {:?}", staging))?;
        tokio::fs::rename(&staging, &path)
            .await
            .with_context(|| format!("Failed to replace {:?}", path))?;

        tracing::debug!(
            "Wrote {} tests and {} invocations to stat file {:?}",
            file.test_stats.len(),
            file.invocation_stats.len(),
            path
        );
        Ok(())
    }
}

fn load(path: &Path) -> StatsData {
    if !path.exists() {
        tracing::debug!("Stat file {:?} not found, starting empty", path);
        return StatsData::default();
    }

    let parsed = std::fs::read(path)
        .map_err(anyhow::Error::from)
        .and_then(|bytes| serde_json::from_slice::<StatsFile>(&bytes).map_err(anyhow::Error::from));

    match parsed {
        Ok(file) => {
            tracing::debug!(
                "Read {} tests and {} invocations from stat file {:?}",
                file.test_stats.len(),
                file.invocation_stats.len(),
                path
            );
            StatsData {
                invocations_by_id: file
                    .invocation_stats
                    .into_iter()
                    .map(|i| (i.invocation_id.clone(), i))
                    .collect(),
                tests_by_full_name: file
                    .test_stats
                    .into_iter()
                    .map(|t| (t.test_full_name.clone(), t))
                    .collect(),
            }
        }
        Err(e) => {
            tracing::error!(
                "Error reading stat file {:?}, using empty stats: {:#}",
                path,
                e
            );
            StatsData::default()
        }
    }
}
