//! Per-batch processing: duplicate suppression, shared-state fan-in,
//! failure thresholds and attempt finalization.

mod common;

use common::*;
use trawler_core::db::{AttemptStatus, Catalog, CcPairStatus};
use trawler_core::err::Error;
use trawler_core::job::TerminalStatus;
use trawler_core::kvs::Store;
use trawler_core::pipeline::{ConnectorFailure, Document};
use trawler_core::queue::DocProcessingArgs;

fn processing_args(attempt_id: i64, batch_id: &str, batch_num: u64) -> DocProcessingArgs {
	DocProcessingArgs {
		batch_id: batch_id.to_string(),
		attempt_id,
		cc_pair_id: CC_PAIR,
		tenant_id: TENANT.to_string(),
		batch_num,
	}
}

/// Seeds an attempt mid-extraction with the given stored batches
async fn seed_attempt(h: &Harness, batches: &[(String, Vec<Document>)], total: Option<u64>) -> i64 {
	h.seed_defaults().await;
	let attempt = h.db.create_attempt(CC_PAIR, SEARCH_SETTINGS, false).await.unwrap();
	h.db.mark_attempt_started(attempt.id).await.unwrap();
	h.arm_fence(attempt.id, "f-abc").await;
	for (batch_id, documents) in batches {
		h.batches.store_batch(attempt.id, batch_id, documents.clone()).await.unwrap();
	}
	use trawler_core::batch::{BatchStorage, DocExtractionContext, DocIndexingContext};
	h.batches
		.store_indexing_state(
			attempt.id,
			&DocIndexingContext {
				unfinished_batches: batches.len() as u64,
				..Default::default()
			},
		)
		.await
		.unwrap();
	h.batches
		.store_extraction_context(
			attempt.id,
			&DocExtractionContext {
				source: "web".to_string(),
				doc_extraction_complete_batch_num: total,
			},
		)
		.await
		.unwrap();
	attempt.id
}

#[test_log::test(tokio::test)]
async fn a_duplicate_batch_delivery_is_suppressed() {
	let h = harness();
	let attempt_id =
		seed_attempt(&h, &[("b2".to_string(), documents("b2", 3))], None).await;
	let fence = h.orchestrator.index_fence(CC_PAIR, SEARCH_SETTINGS);
	// the first delivery holds the per-batch lock
	h.kv.put(&fence.lock_key_by_batch(2), b"first".to_vec(), None).await.unwrap();

	let error =
		h.orchestrator.docprocessing(&processing_args(attempt_id, "b2", 2)).await.unwrap_err();
	match error {
		Error::Terminal {
			status,
			..
		} => assert_eq!(status, TerminalStatus::TaskAlreadyRunning),
		other => panic!("expected a terminal error, got: {other}"),
	}

	// the duplicate did not touch the shared state
	use trawler_core::batch::BatchStorage;
	let state = h.batches.ensure_indexing_state(attempt_id).await.unwrap();
	assert_eq!(state.batches_done, 0);
}

#[test_log::test(tokio::test)]
async fn a_missing_batch_is_skipped() {
	let h = harness();
	let attempt_id = seed_attempt(&h, &[], None).await;
	// already processed and cleaned by a previous delivery
	h.orchestrator.docprocessing(&processing_args(attempt_id, "gone", 1)).await.unwrap();
}

#[test_log::test(tokio::test)]
async fn the_final_batch_finalizes_the_attempt() {
	let h = harness();
	let batches: Vec<(String, Vec<Document>)> = (1..=3)
		.map(|n| (format!("b{n}"), documents(&format!("b{n}"), 4)))
		.collect();
	let attempt_id = seed_attempt(&h, &batches, Some(3)).await;
	let fence = h.orchestrator.index_fence(CC_PAIR, SEARCH_SETTINGS);

	for n in 1..=2 {
		h.orchestrator
			.docprocessing(&processing_args(attempt_id, &format!("b{n}"), n))
			.await
			.unwrap();
		// not finalized yet
		let row = h.db.attempt(attempt_id).await.unwrap().unwrap();
		assert_eq!(row.status, AttemptStatus::InProgress);
		assert!(fence.fenced().await.unwrap());
	}

	// the third processor observes batches_done == 3 and settles everything
	h.orchestrator.docprocessing(&processing_args(attempt_id, "b3", 3)).await.unwrap();

	let row = h.db.attempt(attempt_id).await.unwrap().unwrap();
	assert_eq!(row.status, AttemptStatus::Success);
	assert_eq!(row.total_docs_indexed, 12);
	assert_eq!(row.new_docs_indexed, 12);
	assert!(!fence.fenced().await.unwrap());
	assert_eq!(h.batches.batch_count(attempt_id), 0);
	// the pair is promoted on its first success
	assert_eq!(h.db.cc_pair(CC_PAIR).await.unwrap().unwrap().status, CcPairStatus::Active);
}

#[test_log::test(tokio::test)]
async fn failures_mark_the_attempt_partially_successful() {
	let h = harness();
	let attempt_id =
		seed_attempt(&h, &[("b1".to_string(), documents("b1", 5))], Some(1)).await;
	h.pipelines.pipeline().fail_document("b1-0", "parse error");

	h.orchestrator.docprocessing(&processing_args(attempt_id, "b1", 1)).await.unwrap();

	let row = h.db.attempt(attempt_id).await.unwrap().unwrap();
	assert_eq!(row.status, AttemptStatus::PartialSuccess);
	// the failure was recorded for later resolution
	let errors = h.db.unresolved_errors(CC_PAIR).await.unwrap();
	assert_eq!(errors.len(), 1);
	assert_eq!(errors[0].document_id.as_deref(), Some("b1-0"));
}

#[test_log::test(tokio::test)]
async fn successful_documents_resolve_their_recorded_errors() {
	let h = harness();
	let attempt_id =
		seed_attempt(&h, &[("b1".to_string(), documents("b1", 3))], Some(1)).await;
	// a previous attempt recorded a failure for a document in this batch
	h.db
		.create_attempt_error(
			attempt_id - 1,
			CC_PAIR,
			&ConnectorFailure {
				document_id: Some("b1-1".to_string()),
				message: "flaky upstream".to_string(),
			},
		)
		.await
		.unwrap();

	h.orchestrator.docprocessing(&processing_args(attempt_id, "b1", 1)).await.unwrap();

	assert!(h.db.unresolved_errors(CC_PAIR).await.unwrap().is_empty());
}

#[test_log::test(tokio::test)]
async fn the_failure_threshold_aborts_the_attempt() {
	let h = harness();
	// batch 4 brings the totals to 5 failures against 40 indexed documents:
	// 5 > 3 and 5/40 = 0.125 > 0.1
	let mut batches: Vec<(String, Vec<Document>)> = (1..=3)
		.map(|n| (format!("b{n}"), documents(&format!("b{n}"), 15)))
		.collect();
	batches.push(("b4".to_string(), documents("b4", 5)));
	let attempt_id = seed_attempt(&h, &batches, Some(4)).await;
	let pipeline = h.pipelines.pipeline();
	pipeline.fail_document("b1-0", "boom 1");
	pipeline.fail_document("b2-0", "boom 2");
	pipeline.fail_document("b3-0", "boom 3");
	pipeline.fail_document("b4-0", "boom 4");
	pipeline.fail_document("b4-1", "boom 5");

	for n in 1..=3u64 {
		h.orchestrator
			.docprocessing(&processing_args(attempt_id, &format!("b{n}"), n))
			.await
			.unwrap();
	}
	let error =
		h.orchestrator.docprocessing(&processing_args(attempt_id, "b4", 4)).await.unwrap_err();
	match error {
		Error::TooManyFailures {
			failures,
			last_failure,
		} => {
			assert_eq!(failures, 5);
			assert_eq!(last_failure, "boom 5");
		}
		other => panic!("expected the failure threshold, got: {other}"),
	}

	// the error path signals completion so nothing blocks on this attempt
	let fence = h.orchestrator.index_fence(CC_PAIR, SEARCH_SETTINGS);
	assert_eq!(fence.get_completion().await.unwrap(), Some(500));

	// the monitor finalizes the attempt as failed
	h.kv
		.put(
			&trawler_core::fence::keys::block_validate_indexing_fences(TENANT),
			b"1".to_vec(),
			None,
		)
		.await
		.unwrap();
	h.orchestrator.check_for_indexing().await.unwrap();
	let row = h.db.attempt(attempt_id).await.unwrap().unwrap();
	assert_eq!(row.status, AttemptStatus::Failed);
	assert!(!fence.fenced().await.unwrap());
}

#[test_log::test(tokio::test)]
async fn completion_error_does_not_overwrite_a_prior_ok() {
	let h = harness();
	let attempt_id = seed_attempt(&h, &[], None).await;
	let fence = h.orchestrator.index_fence(CC_PAIR, SEARCH_SETTINGS);
	fence.set_completion(200).await.unwrap();

	// a processor error path fires the 500 escape valve afterwards
	let _ = h.orchestrator.docprocessing(&processing_args(attempt_id, "gone", 9)).await;
	fence.set_completion(500).await.unwrap();

	assert_eq!(fence.get_completion().await.unwrap(), Some(200));
}
