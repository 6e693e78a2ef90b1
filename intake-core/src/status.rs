//! Point-in-time view of the pipeline for the status surface.

use std::path::PathBuf;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::dispatch::WorkerPool;
use crate::entry::{EntryStatus, FileEntry};
use crate::processor::ProcessorTable;
use crate::registry::Registry;

#[derive(Clone, Debug, Serialize)]
pub struct EntrySnapshot {
    pub path: PathBuf,
    pub status: EntryStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temp_path: Option<PathBuf>,
    pub discovered_at: DateTime<Utc>,
    pub event_count: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_event: Option<String>,
}

impl From<&FileEntry> for EntrySnapshot {
    fn from(entry: &FileEntry) -> Self {
        Self {
            path: entry.source_path().to_path_buf(),
            status: entry.status(),
            temp_path: entry.temp_path().map(PathBuf::from),
            discovered_at: entry.discovered_at(),
            event_count: entry.events().len(),
            last_event: entry.events().last().map(|event| event.message.clone()),
        }
    }
}

#[derive(Clone, Debug, Serialize, PartialEq, Eq)]
pub struct BindingSnapshot {
    pub root: PathBuf,
    pub processor: String,
}

#[derive(Clone, Copy, Debug, Serialize, PartialEq, Eq)]
pub struct WorkerSnapshot {
    pub core: usize,
    pub max: usize,
    pub live: usize,
    pub queued: usize,
    pub queue_capacity: usize,
}

impl From<&WorkerPool> for WorkerSnapshot {
    fn from(pool: &WorkerPool) -> Self {
        let config = pool.config();
        Self {
            core: config.core_workers,
            max: config.max_workers,
            live: pool.live_workers(),
            queued: pool.queued(),
            queue_capacity: config.queue_capacity,
        }
    }
}

#[derive(Clone, Debug, Serialize)]
pub struct StatusSnapshot {
    pub generated_at: DateTime<Utc>,
    pub entries: Vec<EntrySnapshot>,
    pub bindings: Vec<BindingSnapshot>,
    pub scratch_dir: PathBuf,
    pub workers: WorkerSnapshot,
    /// Human readable, e.g. `5s`.
    pub tick_period: String,
}

impl StatusSnapshot {
    pub fn capture(
        registry: &Registry,
        table: &ProcessorTable,
        pool: &WorkerPool,
        scratch_dir: PathBuf,
        tick_period: Duration,
    ) -> Self {
        let mut entries: Vec<EntrySnapshot> =
            registry.snapshot().iter().map(EntrySnapshot::from).collect();
        entries.sort_by(|a, b| a.path.cmp(&b.path));
        Self {
            generated_at: Utc::now(),
            entries,
            bindings: binding_snapshots(table),
            scratch_dir,
            workers: WorkerSnapshot::from(pool),
            tick_period: humantime::format_duration(tick_period).to_string(),
        }
    }

    pub fn count_with_status(&self, status: EntryStatus) -> usize {
        self.entries.iter().filter(|e| e.status == status).count()
    }
}

pub fn binding_snapshots(table: &ProcessorTable) -> Vec<BindingSnapshot> {
    table
        .bindings()
        .iter()
        .map(|binding| BindingSnapshot {
            root: binding.root.clone(),
            processor: binding.id.clone(),
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use std::path::Path;
    use std::sync::Arc;

    use async_trait::async_trait;

    use super::*;
    use crate::dispatch::PoolConfig;
    use crate::error::ProcessorError;
    use crate::processor::{FileProcessor, ProcessRequest, ProcessorBinding};

    struct Noop;

    #[async_trait]
    impl FileProcessor for Noop {
        async fn process(&self, _request: &ProcessRequest) -> Result<(), ProcessorError> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn snapshot_serializes_sorted_entries() {
        let registry = Registry::new();
        registry.discover("/in/b.dat");
        registry.discover("/in/a.dat");
        registry
            .transition(Path::new("/in/a.dat"), EntryStatus::Pending, EntryStatus::Ready)
            .unwrap();
        let table =
            ProcessorTable::new(vec![ProcessorBinding::new("/in", "music", Arc::new(Noop))]).unwrap();
        let pool = WorkerPool::new(PoolConfig::default());

        let snapshot = StatusSnapshot::capture(
            &registry,
            &table,
            &pool,
            PathBuf::from("/scratch"),
            Duration::from_secs(5),
        );

        assert_eq!(snapshot.entries[0].path, PathBuf::from("/in/a.dat"));
        assert_eq!(snapshot.count_with_status(EntryStatus::Pending), 1);
        let json = serde_json::to_value(&snapshot).unwrap();
        assert_eq!(json["tick_period"], "5s");
        assert_eq!(json["entries"][0]["status"], "READY");
        assert_eq!(json["entries"][1]["last_event"], "Entry created");
        assert_eq!(json["bindings"][0]["processor"], "music");
        assert_eq!(json["workers"]["core"], 2);
        pool.shutdown().await;
    }
}
