//! Integration tests for the full engine.
//!
//! Tests: rows → Transformer → Executor → catalog store, with items, jobs
//! and progress tracked along the way.
//!
//! Verifies:
//! - Import runs settle every item and persist consistent counters
//! - Pause, resume and cancel take effect between rows
//! - Failures are classified, capped and retried
//! - Sync runs drain the queue in priority order

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    use serde_json::json;

    use catalogsync_catalog::{FieldValue, NaturalKey, RawRow, Table};

    use crate::config::EngineConfig;
    use crate::engine::{Engine, EngineError};
    use crate::error::StoreError;
    use crate::executor::{FaultPoint, InMemoryCatalogStore};
    use crate::jobs::{InMemoryJobStore, ItemStatus, JobKind, JobProgress, JobStatus, JobStore};
    use crate::queue::{InMemorySyncQueue, NewQueueEntry, Priority, QueueStatus, SyncQueue};
    use crate::retry::{ErrorKind, RetryPolicy};

    type TestEngine = Engine<InMemoryJobStore, Arc<InMemoryCatalogStore>, Arc<InMemorySyncQueue>>;

    const HEADERS: [&str; 4] = ["item_code", "product_name", "item_name", "list_price"];

    struct Harness {
        engine: Arc<TestEngine>,
        catalog: Arc<InMemoryCatalogStore>,
        queue: Arc<InMemorySyncQueue>,
    }

    fn harness_with(config: EngineConfig, policy: RetryPolicy) -> Harness {
        let catalog = Arc::new(InMemoryCatalogStore::new());
        let queue = Arc::new(InMemorySyncQueue::new());
        let engine = Engine::new(
            InMemoryJobStore::arc(),
            Arc::clone(&catalog),
            Arc::clone(&queue),
            config,
        )
        .unwrap()
        .with_retry_policy(policy);
        Harness {
            engine: Arc::new(engine),
            catalog,
            queue,
        }
    }

    fn harness() -> Harness {
        harness_with(EngineConfig::default(), RetryPolicy::fixed(3, Duration::ZERO))
    }

    /// One row per chunk, quick pause polling.
    fn stepwise() -> EngineConfig {
        EngineConfig {
            batch_size: 1,
            pause_poll_interval: Duration::from_millis(5),
            ..EngineConfig::default()
        }
    }

    fn row(code: &str) -> RawRow {
        RawRow::from_pairs([
            ("item_code", code),
            ("product_name", "Garden Hose"),
            ("item_name", format!("Garden Hose {code}").as_str()),
            ("list_price", "19.99"),
        ])
    }

    fn rows(count: usize) -> Vec<RawRow> {
        (1..=count).map(|i| row(&format!("GH-{i}"))).collect()
    }

    fn item_key(code: &str) -> NaturalKey {
        NaturalKey::single("item_code", FieldValue::text(code))
    }

    async fn wait_until(mut condition: impl FnMut() -> bool) {
        for _ in 0..2_000 {
            if condition() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
        panic!("condition not reached in time");
    }

    #[tokio::test]
    async fn three_valid_rows_complete() {
        let h = harness();
        let summary = h.engine.import(&HEADERS, rows(3), Some("ops".into())).await.unwrap();

        assert_eq!(summary.job.status, JobStatus::Completed);
        assert_eq!(summary.job.succeeded_items, 3);
        assert_eq!(summary.job.failed_items, 0);
        assert_eq!(summary.progress_percent(), 100.0);
        assert!(summary.errors.is_empty());
        assert_eq!(h.catalog.row_count(Table::Items), 3);
        assert_eq!(h.catalog.row_count(Table::Products), 1);

        let stats = h.engine.jobs().item_stats(summary.job.id).await.unwrap();
        assert_eq!(stats.success, 3);
        assert!(!h.engine.tracker().is_tracked(summary.job.id));
    }

    #[tokio::test]
    async fn one_rejected_row_fails_alone() {
        let h = harness();
        let mut input = rows(3);
        input[1] = RawRow::from_pairs([("item_code", "GH-2"), ("product_name", "Garden Hose")]);

        let summary = h.engine.import(&HEADERS, input, None).await.unwrap();

        assert_eq!(summary.counters.processed, 3);
        assert_eq!(summary.counters.succeeded, 2);
        assert_eq!(summary.counters.failed, 1);
        assert_eq!(summary.errors.len(), 1);
        assert_eq!(summary.errors[0].row, 2);
        assert!(summary.errors[0].error.contains("item_name"));
        assert_eq!(summary.job.status, JobStatus::Completed);

        let item = h.engine.jobs().find_item_by_row(summary.job.id, 2).await.unwrap().unwrap();
        assert_eq!(item.status, ItemStatus::FailedPermanent);
        assert_eq!(item.last_error_type, Some(ErrorKind::Validation));
        assert_eq!(item.retry_count, 0);
    }

    #[tokio::test]
    async fn repeated_codes_are_skipped() {
        let h = harness();
        let input = vec![row("1354-6543"), row("GH-9"), row("1354-6543")];
        let summary = h.engine.import(&HEADERS, input, None).await.unwrap();

        assert_eq!(summary.counters.succeeded, 2);
        assert_eq!(summary.counters.failed, 1);
        let item = h.engine.jobs().find_item_by_row(summary.job.id, 3).await.unwrap().unwrap();
        assert_eq!(item.status, ItemStatus::Skipped);
        assert!(item.last_error_message.unwrap().contains("first seen on row 1"));
    }

    #[tokio::test]
    async fn reimporting_the_same_rows_writes_nothing() {
        let h = harness();
        h.engine.import(&HEADERS, rows(3), None).await.unwrap();
        h.catalog.reset_stats();

        let summary = h.engine.import(&HEADERS, rows(3), None).await.unwrap();
        assert_eq!(summary.counters.succeeded, 3);
        assert_eq!(h.catalog.stats().total(), 0);
        assert_eq!(h.catalog.row_count(Table::Items), 3);
    }

    #[tokio::test]
    async fn pause_and_resume_between_rows() {
        let h = harness_with(stepwise(), RetryPolicy::fixed(3, Duration::ZERO));
        h.catalog.set_latency(Some(Duration::from_millis(2)));
        let input = rows(6);
        let job = h.engine.submit_import(&input, None).await.unwrap();

        let run = tokio::spawn({
            let engine = Arc::clone(&h.engine);
            async move { engine.run_import(job.id, input).await }
        });

        let tracker = h.engine.tracker();
        wait_until(|| tracker.is_tracked(job.id)).await;
        let seen: Arc<Mutex<Vec<JobStatus>>> = Arc::default();
        let sink = Arc::clone(&seen);
        tracker
            .register(job.id, move |p: &JobProgress| -> anyhow::Result<()> {
                sink.lock().unwrap().push(p.status);
                Ok(())
            })
            .unwrap();
        wait_until(|| !seen.lock().unwrap().is_empty()).await;

        h.engine.pause(job.id).unwrap();
        for _ in 0..2_000 {
            let persisted = h.engine.jobs().get_job(job.id).await.unwrap().unwrap();
            if persisted.status == JobStatus::Paused {
                break;
            }
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
        let held = tracker.snapshot(job.id).unwrap().processed;
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(tracker.snapshot(job.id).unwrap().processed, held);
        assert_eq!(
            h.engine.jobs().get_job(job.id).await.unwrap().unwrap().status,
            JobStatus::Paused
        );

        h.engine.resume(job.id).unwrap();
        let summary = run.await.unwrap().unwrap();
        assert_eq!(summary.job.status, JobStatus::Completed);
        assert_eq!(summary.counters.succeeded, 6);

        let mut statuses = seen.lock().unwrap().clone();
        statuses.dedup();
        assert_eq!(
            statuses,
            vec![
                JobStatus::Processing,
                JobStatus::Paused,
                JobStatus::Processing,
                JobStatus::Completed
            ]
        );
    }

    #[tokio::test]
    async fn cancel_stops_before_the_next_row() {
        let h = harness_with(stepwise(), RetryPolicy::fixed(3, Duration::ZERO));
        h.catalog.set_latency(Some(Duration::from_millis(2)));
        let input = rows(20);
        let job = h.engine.submit_import(&input, None).await.unwrap();

        let run = tokio::spawn({
            let engine = Arc::clone(&h.engine);
            async move { engine.run_import(job.id, input).await }
        });

        let tracker = h.engine.tracker();
        wait_until(|| tracker.snapshot(job.id).is_some_and(|p| p.processed >= 2)).await;
        let progress = h.engine.cancel(job.id).unwrap();
        assert_eq!(progress.status, JobStatus::Cancelled);

        let summary = run.await.unwrap().unwrap();
        assert!(summary.cancelled);
        assert_eq!(summary.job.status, JobStatus::Cancelled);
        assert!(summary.counters.processed < 20);

        let stats = h.engine.jobs().item_stats(job.id).await.unwrap();
        assert_eq!(summary.counters.processed, stats.counters().processed);
        assert!(stats.pending > 0);
        assert!(h.engine.cancel(job.id).unwrap_err().is_not_tracked());
    }

    #[tokio::test]
    async fn resume_skips_rows_already_settled() {
        let h = harness();
        let input = rows(5);
        let job = h.engine.submit_import(&input, None).await.unwrap();

        // An earlier run got through rows 1 and 2 before the process died.
        let jobs = h.engine.jobs();
        jobs.transition_job(job.id, JobStatus::Processing).await.unwrap();
        for row in 1..=2 {
            let mut item = jobs.find_item_by_row(job.id, row).await.unwrap().unwrap();
            item.mark_succeeded(chrono::Utc::now());
            jobs.update_item(&item).await.unwrap();
        }

        let summary = h.engine.resume_import(job.id, input).await.unwrap();

        assert_eq!(summary.job.status, JobStatus::Completed);
        assert_eq!(summary.counters.processed, 5);
        assert_eq!(summary.counters.succeeded, 5);
        assert!(h.catalog.record(Table::Items, &item_key("GH-1")).is_none());
        assert!(h.catalog.record(Table::Items, &item_key("GH-3")).is_some());
        assert_eq!(h.catalog.row_count(Table::Items), 3);
    }

    #[tokio::test]
    async fn retryable_failures_stop_at_the_cap() {
        let h = harness();
        let timeout = || StoreError::Timeout(Duration::from_millis(5));

        h.catalog.push_fault(FaultPoint::Any, timeout());
        let summary = h.engine.import(&HEADERS, rows(1), None).await.unwrap();
        let job_id = summary.job.id;
        let item = h.engine.jobs().find_item_by_row(job_id, 1).await.unwrap().unwrap();
        assert_eq!(item.status, ItemStatus::FailedRetryable);
        assert_eq!(item.retry_count, 1);

        h.catalog.push_fault(FaultPoint::Any, timeout());
        h.engine.retry_failed(job_id, rows(1)).await.unwrap();
        h.catalog.push_fault(FaultPoint::Any, timeout());
        let summary = h.engine.retry_failed(job_id, rows(1)).await.unwrap();
        assert_eq!(summary.errors.len(), 1);

        let item = h.engine.jobs().find_item_by_row(job_id, 1).await.unwrap().unwrap();
        assert_eq!(item.status, ItemStatus::FailedPermanent);
        assert_eq!(item.retry_count, 3);
        assert_eq!(item.last_error_type, Some(ErrorKind::Timeout));

        // Permanent now: a further pass has nothing to do.
        let summary = h.engine.retry_failed(job_id, rows(1)).await.unwrap();
        assert!(summary.errors.is_empty());
        assert_eq!(summary.counters.failed, 1);
        assert_eq!(h.catalog.row_count(Table::Items), 0);
    }

    #[tokio::test]
    async fn retry_pass_recovers_transient_failures() {
        let h = harness();
        h.catalog
            .push_fault(FaultPoint::Insert(Table::Products), StoreError::Connectivity("reset".into()));
        let summary = h.engine.import(&HEADERS, rows(2), None).await.unwrap();
        assert_eq!(summary.counters.failed, 1);
        assert!(summary.errors[0].error.contains("upsert products"));

        let summary = h.engine.retry_failed(summary.job.id, rows(2)).await.unwrap();
        assert!(summary.errors.is_empty());
        assert_eq!(summary.counters.succeeded, 2);
        assert_eq!(summary.counters.failed, 0);
        assert_eq!(summary.job.succeeded_items, 2);
        assert_eq!(h.catalog.row_count(Table::Items), 2);
    }

    #[tokio::test]
    async fn retry_waits_for_backoff() {
        let h = harness_with(
            EngineConfig::default(),
            RetryPolicy::fixed(3, Duration::from_secs(3_600)),
        );
        h.catalog.push_fault(FaultPoint::Any, StoreError::LockContention("busy".into()));
        let summary = h.engine.import(&HEADERS, rows(1), None).await.unwrap();

        let summary = h.engine.retry_failed(summary.job.id, rows(1)).await.unwrap();
        assert!(summary.errors.is_empty());
        assert_eq!(summary.warnings.len(), 1);
        assert!(summary.warnings[0].contains("retry deferred"));
        assert_eq!(summary.counters.failed, 1);
    }

    #[tokio::test]
    async fn unreachable_catalog_fails_the_job() {
        let h = harness();
        h.catalog.set_unavailable(true);
        let input = rows(3);
        let job = h.engine.submit_import(&input, None).await.unwrap();

        let err = h.engine.run_import(job.id, input.clone()).await.unwrap_err();
        assert!(matches!(err, EngineError::StorageUnavailable(_)));

        let failed = h.engine.jobs().get_job(job.id).await.unwrap().unwrap();
        assert_eq!(failed.status, JobStatus::Failed);
        assert!(failed.error_message.unwrap().contains("unavailable"));
        assert!(!h.engine.tracker().is_tracked(job.id));

        // The stranded row is picked up once the store is back.
        h.catalog.set_unavailable(false);
        let summary = h.engine.retry_failed(job.id, input).await.unwrap();
        assert_eq!(summary.counters.succeeded, 1);
        let item = h.engine.jobs().find_item_by_row(job.id, 1).await.unwrap().unwrap();
        assert_eq!(item.status, ItemStatus::Success);
    }

    #[tokio::test]
    async fn sync_run_drains_by_priority() {
        let h = harness();
        let low = h
            .queue
            .enqueue(
                NewQueueEntry::new("GH-1", "item.updated", json!({
                    "item_code": "GH-1", "product_name": "Garden Hose", "item_name": "Hose 1"
                }))
                .with_priority(Priority::Low),
            )
            .await
            .unwrap();
        let high = h
            .queue
            .enqueue(
                NewQueueEntry::new("GH-2", "item.updated", json!({
                    "item_code": "GH-2", "product_name": "Garden Hose", "item_name": "Hose 2",
                    "tags": ["outdoor", "summer"]
                }))
                .with_priority(Priority::High),
            )
            .await
            .unwrap();
        let broken = h
            .queue
            .enqueue(NewQueueEntry::new("GH-3", "item.updated", json!(["not", "an", "object"])))
            .await
            .unwrap();

        let summary = h.engine.run_sync(10, None).await.unwrap().unwrap();
        assert_eq!(summary.job.kind, JobKind::Sync);
        assert_eq!(summary.job.status, JobStatus::Completed);
        assert_eq!(summary.counters.succeeded, 2);
        assert_eq!(summary.counters.failed, 1);

        let items = h.engine.jobs().list_items(summary.job.id, None, None).await.unwrap();
        let order: Vec<&str> = items.iter().map(|i| i.source_code.as_str()).collect();
        assert_eq!(order, vec!["GH-2", "GH-3", "GH-1"]);

        for (id, expected) in [
            (high.id, QueueStatus::Done),
            (low.id, QueueStatus::Done),
            (broken.id, QueueStatus::Failed),
        ] {
            let entry = h.queue.get(id).await.unwrap().unwrap();
            assert_eq!(entry.status, expected, "entry {id}");
        }

        assert!(h.engine.run_sync(10, None).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn retryable_sync_entries_return_to_the_queue() {
        let h = harness();
        let entry = h
            .queue
            .enqueue(NewQueueEntry::new("GH-1", "item.created", json!({
                "item_code": "GH-1", "product_name": "Garden Hose", "item_name": "Hose 1"
            })))
            .await
            .unwrap();
        h.catalog.push_fault(FaultPoint::Any, StoreError::Connectivity("reset".into()));

        let summary = h.engine.run_sync(10, None).await.unwrap().unwrap();
        assert_eq!(summary.counters.failed, 1);
        let requeued = h.queue.get(entry.id).await.unwrap().unwrap();
        assert_eq!(requeued.status, QueueStatus::Pending);
        assert_eq!(requeued.retries, 1);

        let summary = h.engine.run_sync(10, None).await.unwrap().unwrap();
        assert_eq!(summary.counters.succeeded, 1);
        assert_eq!(h.queue.get(entry.id).await.unwrap().unwrap().status, QueueStatus::Done);
    }

    #[tokio::test]
    async fn sync_entry_that_keeps_failing_ends_failed_at_the_cap() {
        let h = harness();
        let stuck = h
            .queue
            .enqueue(NewQueueEntry::new("GH-1", "item.updated", json!({
                "item_code": "GH-1", "product_name": "Garden Hose", "item_name": "Hose 1"
            })))
            .await
            .unwrap();

        let mut runs = Vec::new();
        for _ in 0..8 {
            h.catalog.push_fault(FaultPoint::Any, StoreError::Connectivity("reset".into()));
            match h.engine.run_sync(10, None).await.unwrap() {
                Some(summary) => runs.push(summary.job.id),
                None => break,
            }
        }

        // max_retries = 3: two requeues, then the third failure is final.
        assert_eq!(runs.len(), 3);
        let entry = h.queue.get(stuck.id).await.unwrap().unwrap();
        assert_eq!(entry.status, QueueStatus::Failed);
        assert_eq!(entry.retries, 2);

        let mut retry_counts = Vec::new();
        for job_id in &runs {
            let item = h.engine.jobs().find_item_by_row(*job_id, 1).await.unwrap().unwrap();
            retry_counts.push(item.retry_count);
            assert!(item.retry_count <= item.max_retries);
        }
        assert_eq!(retry_counts, vec![1, 2, 3]);
        let last = h.engine.jobs().find_item_by_row(runs[2], 1).await.unwrap().unwrap();
        assert_eq!(last.status, ItemStatus::FailedPermanent);
        assert!(h.engine.run_sync(10, None).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn report_lists_failures_in_row_order() {
        let h = harness();
        let mut input = rows(4);
        input[0] = RawRow::from_pairs([("item_code", "GH-1")]);
        input[2] = RawRow::from_pairs([("item_code", "GH-3")]);
        let summary = h.engine.import(&HEADERS, input, None).await.unwrap();

        let report = h.engine.job_report(summary.job.id).await.unwrap();
        assert_eq!(report.items.success, 2);
        assert_eq!(report.items.failed_permanent, 2);
        let rows: Vec<u64> = report.failures.iter().map(|i| i.source_row_number).collect();
        assert_eq!(rows, vec![1, 3]);
        assert!(report.progress.is_none());
    }
}
