//! Fetch-side behaviour: the spawned entrypoint and the watchdog.
//!
//! Supervision tests spawn real child processes through the job client, and
//! tune the lease tunables down through the environment before any of the
//! configuration statics are touched.

mod common;

use common::*;
use std::sync::Once;
use std::time::Duration;
use trawler_core::batch::BatchStorage;
use trawler_core::db::{AttemptStatus, Catalog};
use trawler_core::err::Error;
use trawler_core::fence::keys;
use trawler_core::job::{JobClient, TerminalStatus};
use trawler_core::kvs::Store;
use trawler_core::queue::{DocFetchingArgs, QueueName};

static TUNE: Once = Once::new();

/// Shrinks the supervision tunables before the config statics initialize
fn tune_for_tests() {
	TUNE.call_once(|| {
		std::env::set_var("TRAWLER_SUPERVISOR_POLL_INTERVAL", "0");
		std::env::set_var("TRAWLER_SPAWN_LIVENESS_GRACE", "2");
		std::env::set_var("TRAWLER_CONNECTOR_ACTIVITY_TIMEOUT", "5");
	});
}

fn fetch_args(attempt_id: i64) -> DocFetchingArgs {
	DocFetchingArgs {
		attempt_id,
		cc_pair_id: CC_PAIR,
		search_settings_id: SEARCH_SETTINGS,
		tenant_id: TENANT.to_string(),
	}
}

fn shell_job(script: &str) -> JobClient {
	JobClient::new("/bin/sh").with_args(vec!["-c".to_string(), script.to_string()])
}

fn terminal_status(error: Error) -> TerminalStatus {
	match error {
		Error::Terminal {
			status,
			..
		} => status,
		other => panic!("expected a terminal error, got: {other}"),
	}
}

#[test_log::test(tokio::test)]
async fn fetch_is_blocked_by_deletion_and_stop_fences() {
	tune_for_tests();
	let h = harness();
	h.seed_defaults().await;
	let attempt = h.db.create_attempt(CC_PAIR, SEARCH_SETTINGS, false).await.unwrap();
	h.arm_fence(attempt.id, "f-abc").await;

	h.orchestrator.connector_fences(CC_PAIR).set_deletion_fence(true).await.unwrap();
	let error = h.orchestrator.run_docfetching(&fetch_args(attempt.id)).await.unwrap_err();
	assert_eq!(terminal_status(error), TerminalStatus::BlockedByDeletion);

	h.orchestrator.connector_fences(CC_PAIR).set_deletion_fence(false).await.unwrap();
	h.orchestrator.connector_fences(CC_PAIR).set_stop_fence(true).await.unwrap();
	let error = h.orchestrator.run_docfetching(&fetch_args(attempt.id)).await.unwrap_err();
	assert_eq!(terminal_status(error), TerminalStatus::BlockedByStopSignal);
}

#[test_log::test(tokio::test)]
async fn fetch_requires_a_fence() {
	tune_for_tests();
	let h = harness();
	h.seed_defaults().await;

	let error = h.orchestrator.run_docfetching(&fetch_args(100)).await.unwrap_err();
	assert_eq!(terminal_status(error), TerminalStatus::FenceNotFound);
}

#[test_log::test(tokio::test)]
async fn fetch_rejects_a_fence_for_another_attempt() {
	tune_for_tests();
	let h = harness();
	h.seed_defaults().await;
	let attempt = h.db.create_attempt(CC_PAIR, SEARCH_SETTINGS, false).await.unwrap();
	h.arm_fence(attempt.id, "f-abc").await;

	// a task left over from a previous run carries a stale attempt id
	let error = h.orchestrator.run_docfetching(&fetch_args(attempt.id + 1)).await.unwrap_err();
	assert_eq!(terminal_status(error), TerminalStatus::FenceMismatch);
}

#[test_log::test(tokio::test)]
async fn fetch_times_out_waiting_for_fence_readiness() {
	tune_for_tests();
	let h = harness();
	h.seed_defaults().await;
	let attempt = h.db.create_attempt(CC_PAIR, SEARCH_SETTINGS, false).await.unwrap();
	// a half-armed fence: the task id never lands
	let fence = h.orchestrator.index_fence(CC_PAIR, SEARCH_SETTINGS);
	fence
		.set_fence(
			&trawler_core::fence::FencePayload {
				submitted: h.clock.now(),
				started: None,
				index_attempt_id: Some(attempt.id),
				task_id: None,
			},
			None,
		)
		.await
		.unwrap();

	let clock = h.clock.clone();
	tokio::spawn(async move {
		tokio::time::sleep(Duration::from_millis(100)).await;
		clock.advance(Duration::from_secs(61));
	});

	let error = h.orchestrator.run_docfetching(&fetch_args(attempt.id)).await.unwrap_err();
	assert_eq!(terminal_status(error), TerminalStatus::FenceReadinessTimeout);
}

#[test_log::test(tokio::test)]
async fn fetch_streams_batches_and_signals_completion() {
	tune_for_tests();
	let h = harness();
	h.seed_defaults().await;
	let attempt = h.db.create_attempt(CC_PAIR, SEARCH_SETTINGS, false).await.unwrap();
	h.arm_fence(attempt.id, "f-abc").await;
	h.sources.seed(
		CC_PAIR,
		vec![documents("a", 4), documents("b", 4), documents("c", 2)],
	);

	let total = h.orchestrator.run_docfetching(&fetch_args(attempt.id)).await.unwrap();
	assert_eq!(total, 10);

	let fence = h.orchestrator.index_fence(CC_PAIR, SEARCH_SETTINGS);
	// the payload records the start, the counter the docs, the marker the end
	assert!(fence.payload().await.unwrap().unwrap().started.is_some());
	assert_eq!(fence.get_progress().await.unwrap(), Some(10));
	assert_eq!(fence.get_completion().await.unwrap(), Some(200));
	// one processing task per produced batch
	let mut batch_nums = Vec::new();
	while let Some(task) = h.queue.try_recv(QueueName::DocProcessing) {
		let args: trawler_core::queue::DocProcessingArgs =
			serde_json::from_value(task.args).unwrap();
		assert!(h.batches.get_batch(attempt.id, &args.batch_id).await.unwrap().is_some());
		batch_nums.push(args.batch_num);
	}
	assert_eq!(batch_nums, vec![1, 2, 3]);
	// extraction is stamped complete with the batch count
	let context = h.batches.extraction_context(attempt.id).await.unwrap().unwrap();
	assert_eq!(context.doc_extraction_complete_batch_num, Some(3));
	// the generator lock was released on the way out
	assert!(!h.kv.exists(&fence.generator_lock_key()).await.unwrap());
	// the attempt is running; the processors will finish it
	let attempt = h.db.attempt(attempt.id).await.unwrap().unwrap();
	assert_eq!(attempt.status, AttemptStatus::InProgress);
}

#[test_log::test(tokio::test)]
async fn fetch_with_an_empty_source_settles_immediately() {
	tune_for_tests();
	let h = harness();
	h.seed_defaults().await;
	let attempt = h.db.create_attempt(CC_PAIR, SEARCH_SETTINGS, false).await.unwrap();
	h.arm_fence(attempt.id, "f-abc").await;
	h.sources.seed(CC_PAIR, vec![]);

	assert_eq!(h.orchestrator.run_docfetching(&fetch_args(attempt.id)).await.unwrap(), 0);

	let attempt = h.db.attempt(attempt.id).await.unwrap().unwrap();
	assert_eq!(attempt.status, AttemptStatus::Success);
}

#[test_log::test(tokio::test)]
async fn a_second_fetch_cannot_take_the_generator_lock() {
	tune_for_tests();
	let h = harness();
	h.seed_defaults().await;
	let attempt = h.db.create_attempt(CC_PAIR, SEARCH_SETTINGS, false).await.unwrap();
	h.arm_fence(attempt.id, "f-abc").await;
	let fence = h.orchestrator.index_fence(CC_PAIR, SEARCH_SETTINGS);
	// another fetch process already owns the extraction
	h.kv.put(&fence.generator_lock_key(), b"other".to_vec(), None).await.unwrap();

	let error = h.orchestrator.run_docfetching(&fetch_args(attempt.id)).await.unwrap_err();
	assert_eq!(terminal_status(error), TerminalStatus::TaskAlreadyRunning);
}

#[test_log::test(tokio::test)]
async fn connector_validation_failures_carry_their_own_code() {
	tune_for_tests();
	let h = harness();
	h.seed_defaults().await;
	let attempt = h.db.create_attempt(CC_PAIR, SEARCH_SETTINGS, false).await.unwrap();
	h.arm_fence(attempt.id, "f-abc").await;
	// no source seeded: the stub factory fails validation

	let error = h.orchestrator.run_docfetching(&fetch_args(attempt.id)).await.unwrap_err();
	assert_eq!(terminal_status(error), TerminalStatus::ConnectorValidationError);
	// validation failures never write the completion marker
	let fence = h.orchestrator.index_fence(CC_PAIR, SEARCH_SETTINGS);
	assert_eq!(fence.get_completion().await.unwrap(), None);
}

#[test_log::test(tokio::test)]
async fn watchdog_classifies_a_child_blocked_by_deletion() {
	tune_for_tests();
	let h = harness_with_jobs(shell_job("exit 248"));
	h.seed_defaults().await;
	let attempt = h.db.create_attempt(CC_PAIR, SEARCH_SETTINGS, false).await.unwrap();
	h.arm_fence(attempt.id, "f-abc").await;

	let error =
		h.orchestrator.docfetching_watchdog(&fetch_args(attempt.id), "f-abc").await.unwrap_err();
	assert!(error.to_string().contains("Exception encountered"));

	let row = h.db.attempt(attempt.id).await.unwrap().unwrap();
	assert_eq!(row.status, AttemptStatus::Failed);
	assert!(row.failure_reason.unwrap().contains("exit_code=Some(248)"));
	assert!(row.full_exception_trace.unwrap().contains("248"));
	// the watchdog signal never outlives the run
	let fence = h.orchestrator.index_fence(CC_PAIR, SEARCH_SETTINGS);
	assert!(!fence.watchdog_signaled().await.unwrap());

	// the fence is torn down by the monitor's double check once the queue
	// reports the task terminal
	h.queue.mark_ready("f-abc", false, Some("exit 248".to_string()), None);
	h.kv
		.put(&keys::block_validate_indexing_fences(TENANT), b"1".to_vec(), None)
		.await
		.unwrap();
	h.orchestrator.check_for_indexing().await.unwrap();
	assert!(!fence.fenced().await.unwrap());
}

#[test_log::test(tokio::test)]
async fn watchdog_trusts_an_ok_completion_over_the_exit_code() {
	tune_for_tests();
	let h = harness_with_jobs(shell_job("exit 1"));
	h.seed_defaults().await;
	let attempt = h.db.create_attempt(CC_PAIR, SEARCH_SETTINGS, false).await.unwrap();
	h.arm_fence(attempt.id, "f-abc").await;
	let fence = h.orchestrator.index_fence(CC_PAIR, SEARCH_SETTINGS);
	fence.set_completion(200).await.unwrap();

	h.orchestrator.docfetching_watchdog(&fetch_args(attempt.id), "f-abc").await.unwrap();

	// the spurious exit code left no mark on the attempt
	let row = h.db.attempt(attempt.id).await.unwrap().unwrap();
	assert_eq!(row.status, AttemptStatus::NotStarted);
	assert!(row.failure_reason.is_none());
}

#[test_log::test(tokio::test)]
async fn watchdog_cancels_on_a_termination_signal() {
	tune_for_tests();
	let h = harness_with_jobs(shell_job("sleep 30"));
	h.seed_defaults().await;
	let attempt = h.db.create_attempt(CC_PAIR, SEARCH_SETTINGS, false).await.unwrap();
	h.arm_fence(attempt.id, "f-abc").await;
	let fence = h.orchestrator.index_fence(CC_PAIR, SEARCH_SETTINGS);
	// an administrator pulls the plug on this specific task
	fence.set_terminate("f-abc").await.unwrap();

	h.orchestrator.docfetching_watchdog(&fetch_args(attempt.id), "f-abc").await.unwrap();

	let row = h.db.attempt(attempt.id).await.unwrap().unwrap();
	assert_eq!(row.status, AttemptStatus::Canceled);
	assert!(row.failure_reason.unwrap().contains("termination signal"));
	assert!(!fence.watchdog_signaled().await.unwrap());
}

#[test_log::test(tokio::test)]
async fn watchdog_fails_the_attempt_on_activity_timeout() {
	tune_for_tests();
	let h = harness_with_jobs(shell_job("sleep 30"));
	h.seed_defaults().await;
	let attempt = h.db.create_attempt(CC_PAIR, SEARCH_SETTINGS, false).await.unwrap();
	h.arm_fence(attempt.id, "f-abc").await;

	// the connector never renews its activity lease; once the last observed
	// ttl has drained past its observation time the timeout is genuine
	let clock = h.clock.clone();
	tokio::spawn(async move {
		tokio::time::sleep(Duration::from_millis(300)).await;
		clock.advance(Duration::from_secs(6));
	});

	h.orchestrator.docfetching_watchdog(&fetch_args(attempt.id), "f-abc").await.unwrap();

	let row = h.db.attempt(attempt.id).await.unwrap().unwrap();
	assert_eq!(row.status, AttemptStatus::Failed);
	assert!(row.failure_reason.unwrap().contains("activity timeout"));
	let fence = h.orchestrator.index_fence(CC_PAIR, SEARCH_SETTINGS);
	assert!(!fence.watchdog_signaled().await.unwrap());
}
