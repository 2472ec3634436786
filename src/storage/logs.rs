use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::models::{LogEntry, NewLogEntry};
use crate::storage::{single_job_batch, LogStore};

/// Next sequence number of one job, loaded lazily from disk. Readers and
/// writers of that job's file hold its lock; other jobs are unaffected.
type JobLock = Arc<Mutex<Option<u64>>>;

/// Append-only JSON-lines log store: one `logs/<job_id>.jsonl` per job.
pub struct JsonlLogStore {
    logs_dir: PathBuf,
    /// Only held long enough to look up a job's lock.
    jobs: Mutex<HashMap<Uuid, JobLock>>,
    #[cfg(test)]
    fail_after_bytes: Option<usize>,
}

impl JsonlLogStore {
    /// Create a new JsonlLogStore rooted at data_dir/logs/.
    pub async fn new(data_dir: PathBuf) -> Result<Self> {
        let logs_dir = data_dir.join("logs");
        tokio::fs::create_dir_all(&logs_dir)
            .await
            .context("Failed to create logs directory")?;
        Ok(Self {
            logs_dir,
            jobs: Mutex::new(HashMap::new()),
            #[cfg(test)]
            fail_after_bytes: None,
        })
    }

    async fn job_lock(&self, job_id: Uuid) -> JobLock {
        Arc::clone(self.jobs.lock().await.entry(job_id).or_default())
    }

    fn log_path(&self, job_id: Uuid) -> PathBuf {
        self.logs_dir.join(format!("{}.jsonl", job_id))
    }

    async fn seq_for(&self, next_seq: &mut Option<u64>, job_id: Uuid) -> Result<u64> {
        if let Some(seq) = *next_seq {
            return Ok(seq);
        }
        let entries = read_entries(&self.log_path(job_id)).await?;
        let next = entries.last().map(|e| e.seq + 1).unwrap_or(1);
        *next_seq = Some(next);
        Ok(next)
    }

    /// Write `lines` in one append. On failure the file is cut back to its
    /// previous length so a partial batch never survives.
    async fn write_lines(&self, job_id: Uuid, lines: &str) -> Result<()> {
        let path = self.log_path(job_id);
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await
            .context("Failed to open log file for appending")?;

        let previous_len = file
            .metadata()
            .await
            .context("Failed to stat log file")?
            .len();

        let written = async {
            #[cfg(test)]
            if let Some(limit) = self.fail_after_bytes.filter(|l| *l < lines.len()) {
                file.write_all(&lines.as_bytes()[..limit]).await?;
                file.flush().await?;
                return Err(std::io::Error::other("simulated short write"));
            }
            file.write_all(lines.as_bytes()).await?;
            file.flush().await
        }
        .await;

        if let Err(e) = written {
            if let Err(truncate_err) = file.set_len(previous_len).await {
                tracing::error!(
                    "Failed to roll back partial write to {:?}: {}",
                    path,
                    truncate_err
                );
            }
            return Err(e).context("Failed to append to log file");
        }

        Ok(())
    }
}

async fn read_entries(path: &Path) -> Result<Vec<LogEntry>> {
    if !path.exists() {
        return Ok(Vec::new());
    }

    let content = tokio::fs::read_to_string(path)
        .await
        .context("Failed to read log file")?;

    let mut entries = Vec::new();
    for line in content.lines().filter(|l| !l.trim().is_empty()) {
        match serde_json::from_str::<LogEntry>(line) {
            Ok(entry) => entries.push(entry),
            Err(e) => {
                tracing::warn!("Skipping malformed log line in {:?}: {}", path, e);
            }
        }
    }
    Ok(entries)
}

fn encode(entries: &[LogEntry]) -> Result<String> {
    let mut out = String::new();
    for entry in entries {
        out.push_str(&serde_json::to_string(entry).context("Failed to serialize log entry")?);
        out.push('\n');
    }
    Ok(out)
}

#[async_trait]
impl LogStore for JsonlLogStore {
    async fn append_log(&self, entry: NewLogEntry) -> Result<LogEntry> {
        let mut stored = self.append_logs(vec![entry]).await?;
        stored
            .pop()
            .context("Log store returned no entry for a single append")
    }

    async fn append_logs(&self, entries: Vec<NewLogEntry>) -> Result<Vec<LogEntry>> {
        let Some(job_id) = single_job_batch(&entries)? else {
            return Ok(Vec::new());
        };

        let lock = self.job_lock(job_id).await;
        let mut next_seq = lock.lock().await;
        let first_seq = self.seq_for(&mut next_seq, job_id).await?;

        let now = Utc::now();
        let stored: Vec<LogEntry> = entries
            .into_iter()
            .zip(first_seq..)
            .map(|(entry, seq)| entry.into_entry(seq, now))
            .collect();

        self.write_lines(job_id, &encode(&stored)?).await?;
        *next_seq = Some(first_seq + stored.len() as u64);

        Ok(stored)
    }

    async fn logs_for_job(&self, job_id: Uuid) -> Result<Vec<LogEntry>> {
        let lock = self.job_lock(job_id).await;
        let _guard = lock.lock().await;
        read_entries(&self.log_path(job_id)).await
    }

    async fn delete_logs(&self, job_id: Uuid) -> Result<()> {
        let lock = self.job_lock(job_id).await;
        let mut next_seq = lock.lock().await;
        let path = self.log_path(job_id);
        if path.exists() {
            tokio::fs::remove_file(&path)
                .await
                .context("Failed to remove log file")?;
        }
        *next_seq = None;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::LogOutcome;
    use serde_json::json;
    use tempfile::TempDir;

    async fn setup_store() -> (JsonlLogStore, TempDir) {
        let tmp_dir = TempDir::new().expect("create temp dir");
        let store = JsonlLogStore::new(tmp_dir.path().to_path_buf())
            .await
            .expect("create store");
        (store, tmp_dir)
    }

    fn entry(job_id: Uuid, task_type: &str, outcome: LogOutcome) -> NewLogEntry {
        NewLogEntry::new(job_id, task_type, outcome, format!("{} entry", task_type))
    }

    #[tokio::test]
    async fn test_append_and_read_back() {
        let (store, _tmp) = setup_store().await;
        let job_id = Uuid::now_v7();
        let stored = store
            .append_log(
                entry(job_id, "step_generate_script", LogOutcome::Completed)
                    .with_detail(json!({"step_number": 1}))
                    .with_execution_time(12),
            )
            .await
            .expect("append");
        assert_eq!(stored.seq, 1);

        let entries = store.logs_for_job(job_id).await.expect("read");
        assert_eq!(entries, vec![stored]);
        assert_eq!(entries[0].detail["step_number"], 1);
        assert_eq!(entries[0].execution_time_ms, Some(12));
    }

    #[tokio::test]
    async fn test_seq_continues_after_reopen() {
        let (store, tmp) = setup_store().await;
        let job_id = Uuid::now_v7();
        store
            .append_logs(vec![
                entry(job_id, "job_created", LogOutcome::Completed),
                entry(job_id, "pipeline_started", LogOutcome::Processing),
            ])
            .await
            .expect("batch");

        let reopened = JsonlLogStore::new(tmp.path().to_path_buf())
            .await
            .expect("reopen");
        let next = reopened
            .append_log(entry(job_id, "step_generate_script", LogOutcome::Completed))
            .await
            .expect("append");
        assert_eq!(next.seq, 3);
    }

    #[tokio::test]
    async fn test_list_logs_newest_first_with_total() {
        let (store, _tmp) = setup_store().await;
        let job_id = Uuid::now_v7();
        for task in ["a", "b", "c", "d"] {
            store
                .append_log(entry(job_id, task, LogOutcome::Completed))
                .await
                .expect("append");
        }
        let (page, total) = store.list_logs(job_id, 2, 1).await.expect("list");
        assert_eq!(total, 4);
        assert_eq!(page.len(), 2);
        assert_eq!(page[0].task_type, "c");
        assert_eq!(page[1].task_type, "b");
    }

    #[tokio::test]
    async fn test_batch_spanning_jobs_writes_nothing() {
        let (store, _tmp) = setup_store().await;
        let a = Uuid::now_v7();
        let b = Uuid::now_v7();
        let result = store
            .append_logs(vec![
                entry(a, "x", LogOutcome::Completed),
                entry(b, "x", LogOutcome::Completed),
            ])
            .await;
        assert!(result.is_err());
        assert!(store.logs_for_job(a).await.expect("read").is_empty());
        assert!(store.logs_for_job(b).await.expect("read").is_empty());
    }

    #[tokio::test]
    async fn test_malformed_lines_are_skipped() {
        let (store, tmp) = setup_store().await;
        let job_id = Uuid::now_v7();
        store
            .append_log(entry(job_id, "job_created", LogOutcome::Completed))
            .await
            .expect("append");

        let path = tmp.path().join("logs").join(format!("{}.jsonl", job_id));
        let mut content = tokio::fs::read_to_string(&path).await.expect("read");
        content.push_str("not json\n");
        tokio::fs::write(&path, content).await.expect("write");

        let entries = store.logs_for_job(job_id).await.expect("read");
        assert_eq!(entries.len(), 1);
    }

    #[tokio::test]
    async fn test_statistics_and_latest() {
        let (store, _tmp) = setup_store().await;
        let job_id = Uuid::now_v7();
        store
            .append_logs(vec![
                entry(job_id, "step_generate_script", LogOutcome::Completed).with_execution_time(10),
                entry(job_id, "step_generate_script", LogOutcome::Failed).with_execution_time(30),
            ])
            .await
            .expect("batch");

        let stats = store.statistics(job_id).await.expect("stats");
        assert_eq!(stats.len(), 1);
        assert_eq!(stats[0].total, 2);
        assert_eq!(stats[0].completed, 1);
        assert!((stats[0].avg_execution_time_ms - 20.0).abs() < f64::EPSILON);

        let latest = store
            .latest_by_type(job_id, "step_generate_script")
            .await
            .expect("latest")
            .expect("found");
        assert_eq!(latest.outcome, LogOutcome::Failed);
    }

    #[tokio::test]
    async fn test_delete_logs_resets_seq() {
        let (store, _tmp) = setup_store().await;
        let job_id = Uuid::now_v7();
        store
            .append_log(entry(job_id, "job_created", LogOutcome::Completed))
            .await
            .expect("append");
        store.delete_logs(job_id).await.expect("delete");
        assert!(store.logs_for_job(job_id).await.expect("read").is_empty());

        let fresh = store
            .append_log(entry(job_id, "job_created", LogOutcome::Completed))
            .await
            .expect("append");
        assert_eq!(fresh.seq, 1);
    }

    #[tokio::test]
    async fn test_failed_batch_write_is_rolled_back() {
        let (mut store, tmp) = setup_store().await;
        let job_id = Uuid::now_v7();
        store
            .append_log(entry(job_id, "job_created", LogOutcome::Completed))
            .await
            .expect("append");
        let path = tmp.path().join("logs").join(format!("{}.jsonl", job_id));
        let before = tokio::fs::read_to_string(&path).await.expect("read");

        // The next write stops partway through its second line.
        store.fail_after_bytes = Some(40);
        let result = store
            .append_logs(vec![
                entry(job_id, "pipeline_started", LogOutcome::Processing),
                entry(job_id, "step_generate_script", LogOutcome::Completed),
            ])
            .await;
        assert!(result.is_err());
        assert_eq!(tokio::fs::read_to_string(&path).await.expect("read"), before);

        // Nothing of the failed batch consumed a sequence number.
        store.fail_after_bytes = None;
        let next = store
            .append_log(entry(job_id, "pipeline_started", LogOutcome::Processing))
            .await
            .expect("append");
        assert_eq!(next.seq, 2);
        assert_eq!(store.logs_for_job(job_id).await.expect("read").len(), 2);
    }

    #[tokio::test]
    async fn test_busy_job_does_not_block_other_jobs() {
        let (store, _tmp) = setup_store().await;
        let busy = Uuid::now_v7();
        let other = Uuid::now_v7();

        let lock = store.job_lock(busy).await;
        let _held = lock.lock().await;

        let appended = tokio::time::timeout(
            std::time::Duration::from_secs(2),
            store.append_log(entry(other, "job_created", LogOutcome::Completed)),
        )
        .await;
        assert!(appended.expect("append for another job blocked").is_ok());
        let read = tokio::time::timeout(std::time::Duration::from_secs(2), store.logs_for_job(other)).await;
        assert_eq!(read.expect("read blocked").expect("read").len(), 1);
    }

    #[tokio::test]
    async fn test_reads_never_see_partial_appends() {
        let (store, _tmp) = setup_store().await;
        let store = Arc::new(store);
        let job_id = Uuid::now_v7();

        let writer = {
            let store = Arc::clone(&store);
            tokio::spawn(async move {
                for i in 0..50 {
                    store
                        .append_logs(vec![
                            entry(job_id, &format!("a{}", i), LogOutcome::Completed),
                            entry(job_id, &format!("b{}", i), LogOutcome::Completed),
                        ])
                        .await
                        .expect("append");
                }
            })
        };

        let mut last_len = 0;
        while !writer.is_finished() {
            let entries = store.logs_for_job(job_id).await.expect("read");
            assert_eq!(entries.len() % 2, 0, "saw half a batch");
            assert!(entries.len() >= last_len);
            last_len = entries.len();
            tokio::task::yield_now().await;
        }
        writer.await.expect("writer");
        assert_eq!(store.logs_for_job(job_id).await.expect("read").len(), 100);
    }
}
