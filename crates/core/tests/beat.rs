//! Beat tick behaviour: kick-off, idempotence, validation and monitoring.

mod common;

use common::*;
use std::time::Duration;
use trawler_core::db::{AttemptStatus, Catalog, CcPairStatus, IndexingTrigger};
use trawler_core::fence::{keys, FencePayload};
use trawler_core::kvs::Store;
use trawler_core::queue::{DocFetchingArgs, QueueName};

#[test_log::test(tokio::test)]
async fn kickoff_creates_a_fenced_attempt() {
	let h = harness();
	h.seed_defaults().await;

	let created = h.orchestrator.check_for_indexing().await.unwrap();
	assert_eq!(created, Some(1));

	// the fence exists, is registered, and carries a ready payload
	let fence = h.orchestrator.index_fence(CC_PAIR, SEARCH_SETTINGS);
	assert!(fence.fenced().await.unwrap());
	let payload = fence.payload().await.unwrap().unwrap();
	assert!(payload.is_ready());
	assert_eq!(payload.started, None);
	let members = h.kv.smembers(&keys::active_fences_set(TENANT)).await.unwrap();
	assert_eq!(members, vec![fence.fence_key()]);

	// the attempt row exists in NOT_STARTED
	let attempt_id = payload.index_attempt_id.unwrap();
	let attempt = h.db.attempt(attempt_id).await.unwrap().unwrap();
	assert_eq!(attempt.status, AttemptStatus::NotStarted);

	// the fetch task is on the docfetching queue and its id matches the fence
	let task = h.queue.try_recv(QueueName::DocFetching).expect("fetch task queued");
	assert_eq!(payload.task_id, Some(task.id.clone()));
	let args: DocFetchingArgs = serde_json::from_value(task.args).unwrap();
	assert_eq!(args.attempt_id, attempt_id);
	assert_eq!(args.cc_pair_id, CC_PAIR);
	assert_eq!(args.search_settings_id, SEARCH_SETTINGS);
	assert_eq!(args.tenant_id, TENANT);
}

#[test_log::test(tokio::test)]
async fn two_immediate_ticks_create_one_attempt() {
	let h = harness();
	h.seed_defaults().await;

	assert_eq!(h.orchestrator.check_for_indexing().await.unwrap(), Some(1));
	// the fence suppresses a second attempt
	assert_eq!(h.orchestrator.check_for_indexing().await.unwrap(), Some(0));
	assert_eq!(h.db.nonterminal_attempts().await.unwrap().len(), 1);
}

#[test_log::test(tokio::test)]
async fn tick_backs_off_when_the_beat_lock_is_held() {
	let h = harness();
	h.seed_defaults().await;
	h.kv
		.put(&keys::check_indexing_beat_lock(TENANT), b"other".to_vec(), None)
		.await
		.unwrap();

	assert_eq!(h.orchestrator.check_for_indexing().await.unwrap(), None);
	assert!(!h.orchestrator.index_fence(CC_PAIR, SEARCH_SETTINGS).fenced().await.unwrap());
}

#[test_log::test(tokio::test)]
async fn paused_deleting_and_erroring_pairs_are_skipped() {
	let h = harness();
	h.seed_defaults().await;

	for (id, mutate) in [
		(21, CcPairStatus::Paused),
		(22, CcPairStatus::Deleting),
	] {
		let mut pair = cc_pair(id);
		pair.status = mutate;
		h.db.insert_cc_pair(pair).await;
	}
	let mut erroring = cc_pair(23);
	erroring.in_repeated_error_state = true;
	h.db.insert_cc_pair(erroring).await;

	assert_eq!(h.orchestrator.check_for_indexing().await.unwrap(), Some(1));
	// only the healthy default pair got an attempt
	for id in [21, 22, 23] {
		assert!(!h.orchestrator.index_fence(id, SEARCH_SETTINGS).fenced().await.unwrap());
	}
	assert!(h.orchestrator.index_fence(CC_PAIR, SEARCH_SETTINGS).fenced().await.unwrap());
}

#[test_log::test(tokio::test)]
async fn a_trigger_overrides_a_pause_and_is_cleared() {
	let h = harness();
	h.db.insert_search_settings(search_settings(SEARCH_SETTINGS)).await;
	let mut pair = cc_pair(CC_PAIR);
	pair.status = CcPairStatus::Paused;
	pair.indexing_trigger = Some(IndexingTrigger::Reindex);
	h.db.insert_cc_pair(pair).await;

	assert_eq!(h.orchestrator.check_for_indexing().await.unwrap(), Some(1));
	let fence = h.orchestrator.index_fence(CC_PAIR, SEARCH_SETTINGS);
	let attempt_id = fence.payload().await.unwrap().unwrap().index_attempt_id.unwrap();
	// REINDEX forwards from_beginning into the attempt row
	let attempt = h.db.attempt(attempt_id).await.unwrap().unwrap();
	assert!(attempt.from_beginning);
	// the trigger was read and cleared in the same pass
	assert_eq!(h.db.cc_pair(CC_PAIR).await.unwrap().unwrap().indexing_trigger, None);
}

#[test_log::test(tokio::test)]
async fn a_fresh_attempt_respects_the_refresh_schedule() {
	let h = harness();
	h.seed_defaults().await;

	assert_eq!(h.orchestrator.check_for_indexing().await.unwrap(), Some(1));
	let fence = h.orchestrator.index_fence(CC_PAIR, SEARCH_SETTINGS);
	let attempt_id = fence.payload().await.unwrap().unwrap().index_attempt_id.unwrap();
	// settle the attempt and clear the fence
	h.db.mark_attempt_succeeded(attempt_id, false).await.unwrap();
	fence.reset().await.unwrap();

	// not due yet
	assert_eq!(h.orchestrator.check_for_indexing().await.unwrap(), Some(0));
	// due after the refresh frequency elapses
	h.tick(Duration::from_secs(3601));
	assert_eq!(h.orchestrator.check_for_indexing().await.unwrap(), Some(1));
}

#[test_log::test(tokio::test)]
async fn unfenced_attempts_are_failed_by_the_next_tick() {
	let h = harness();
	h.seed_defaults().await;
	// an attempt row with no fence should never exist
	let orphan = h.db.create_attempt(CC_PAIR, SEARCH_SETTINGS, false).await.unwrap();

	h.orchestrator.check_for_indexing().await.unwrap();

	let orphan = h.db.attempt(orphan.id).await.unwrap().unwrap();
	assert_eq!(orphan.status, AttemptStatus::Failed);
	assert!(orphan.failure_reason.unwrap().contains("Unfenced index attempt"));
}

#[test_log::test(tokio::test)]
async fn validation_clears_a_fence_whose_task_is_gone() {
	let h = harness();
	h.seed_defaults().await;
	let attempt = h.db.create_attempt(CC_PAIR, SEARCH_SETTINGS, false).await.unwrap();
	// a fence claiming a task the queue has never heard of
	h.arm_fence(attempt.id, "f-vanished").await;

	h.orchestrator.check_for_indexing().await.unwrap();

	assert!(!h.orchestrator.index_fence(CC_PAIR, SEARCH_SETTINGS).fenced().await.unwrap());
}

#[test_log::test(tokio::test)]
async fn validation_spares_a_fence_with_a_live_activity_signal() {
	let h = harness();
	h.seed_defaults().await;
	let attempt = h.db.create_attempt(CC_PAIR, SEARCH_SETTINGS, false).await.unwrap();
	h.arm_fence(attempt.id, "f-vanished").await;
	let fence = h.orchestrator.index_fence(CC_PAIR, SEARCH_SETTINGS);
	// a live lease means a supervisor or processor still owns the run
	fence.set_active().await.unwrap();

	h.orchestrator.check_for_indexing().await.unwrap();

	assert!(fence.fenced().await.unwrap());
}

#[test_log::test(tokio::test)]
async fn monitor_promotes_a_scheduled_pair_once_fenced() {
	let h = harness();
	h.db.insert_search_settings(search_settings(SEARCH_SETTINGS)).await;
	let mut pair = cc_pair(CC_PAIR);
	pair.status = CcPairStatus::Scheduled;
	h.db.insert_cc_pair(pair).await;

	assert_eq!(h.orchestrator.check_for_indexing().await.unwrap(), Some(1));

	let pair = h.db.cc_pair(CC_PAIR).await.unwrap().unwrap();
	assert_eq!(pair.status, CcPairStatus::InitialIndexing);
}

#[test_log::test(tokio::test)]
async fn worker_crash_is_detected_by_the_double_check() {
	let h = harness();
	h.seed_defaults().await;
	assert_eq!(h.orchestrator.check_for_indexing().await.unwrap(), Some(1));
	let fence = h.orchestrator.index_fence(CC_PAIR, SEARCH_SETTINGS);
	let payload = fence.payload().await.unwrap().unwrap();
	let attempt_id = payload.index_attempt_id.unwrap();
	let task_id = payload.task_id.unwrap();

	// the worker picked the task up and died; the queue reports it terminal
	// while the completion marker was never written
	let _ = h.queue.try_recv(QueueName::DocFetching).unwrap();
	h.queue.mark_ready(&task_id, false, Some("SIGKILL".to_string()), Some("trace".to_string()));
	// keep fence validation out of the way so the monitor path is exercised
	h.kv
		.put(&keys::block_validate_indexing_fences(TENANT), b"1".to_vec(), None)
		.await
		.unwrap();

	h.orchestrator.check_for_indexing().await.unwrap();

	let attempt = h.db.attempt(attempt_id).await.unwrap().unwrap();
	assert_eq!(attempt.status, AttemptStatus::Failed);
	assert!(attempt.failure_reason.unwrap().contains("aborted or exceptioned"));
	assert!(!fence.fenced().await.unwrap());
}

#[test_log::test(tokio::test)]
async fn repeated_failures_mark_the_pair_and_gate_new_attempts() {
	let h = harness();
	h.seed_defaults().await;
	for _ in 0..3 {
		let attempt = h.db.create_attempt(CC_PAIR, SEARCH_SETTINGS, false).await.unwrap();
		h.db.mark_attempt_failed(attempt.id, "boom", None).await.unwrap();
	}

	assert_eq!(h.orchestrator.check_for_indexing().await.unwrap(), Some(0));

	let pair = h.db.cc_pair(CC_PAIR).await.unwrap().unwrap();
	assert!(pair.in_repeated_error_state);
	assert!(!h.orchestrator.index_fence(CC_PAIR, SEARCH_SETTINGS).fenced().await.unwrap());
}

#[test_log::test(tokio::test)]
async fn lookup_table_rebuild_registers_stray_fences() {
	let h = harness();
	h.seed_defaults().await;
	// a fence written directly to the store, bypassing membership tracking;
	// freshly submitted so fence validation leaves it alone
	let stray = keys::fence(TENANT, 99, SEARCH_SETTINGS);
	let payload = FencePayload {
		submitted: h.clock.now(),
		..Default::default()
	};
	h.kv.put(&stray, serde_json::to_vec(&payload).unwrap(), None).await.unwrap();

	h.orchestrator.check_for_indexing().await.unwrap();

	assert!(h.kv.sismember(&keys::active_fences_set(TENANT), &stray).await.unwrap());
}
