//! Spawned-process runs of the real `trawler fetch` entrypoint.
//!
//! These tests stand in for the worker: they host the backing stores, serve
//! them on a coordination endpoint, and let the watchdog spawn the actual
//! built binary as its child. The child must observe the same fences and
//! rows the worker holds, and report back purely through its exit code.

use std::sync::{Arc, Once};
use std::time::Duration;
use trawler_core::db::{
	AttemptStatus, Catalog, CcPair, CcPairStatus, SearchSettings, SearchSettingsStatus,
};
use trawler_core::fence::{ConnectorFences, FencePayload};
use trawler_core::job::JobClient;
use trawler_core::kvs::{Clock, Store};
use trawler_core::pipeline::stub::{CountingPipelineFactory, StaticSourceFactory};
use trawler_core::queue::{DocFetchingArgs, QueueName};
use trawler_core::{batch, db, kvs, queue, rpc, Orchestrator};

/// The cc-pair the binary's built-in demo source serves documents for
const DEMO_CC_PAIR: i64 = 1;
const SEARCH_SETTINGS: i64 = 1;
const TENANT: &str = "t1";

static TUNE: Once = Once::new();

/// Shortens the supervision poll before the config statics initialize.
/// Children inherit the environment, so both sides agree.
fn tune_for_tests() {
	TUNE.call_once(|| {
		std::env::set_var("TRAWLER_SUPERVISOR_POLL_INTERVAL", "1");
	});
}

struct Worker {
	orchestrator: Orchestrator,
	kv: Arc<dyn Store>,
	db: Arc<db::mem::Datastore>,
	queue: Arc<queue::mem::Datastore>,
	clock: Clock,
}

/// Hosts the worker side: backing stores, the coordination endpoint, and a
/// job client spawning the real built binary.
async fn worker() -> Worker {
	tune_for_tests();
	let clock = Clock::default();
	let kv: Arc<dyn Store> = Arc::new(kvs::mem::Datastore::new(clock.clone()));
	let db = Arc::new(db::mem::Datastore::new(clock.clone()));
	let task_queue = Arc::new(queue::mem::Datastore::new());
	let batches = Arc::new(batch::mem::Datastore::new());

	db.insert_cc_pair(CcPair {
		id: DEMO_CC_PAIR,
		name: "demo".to_string(),
		source: "demo".to_string(),
		connector_id: Some(1),
		credential_id: Some(1),
		status: CcPairStatus::Active,
		indexing_trigger: None,
		in_repeated_error_state: false,
		refresh_freq: Some(Duration::from_secs(3600)),
	})
	.await;
	db.insert_search_settings(SearchSettings {
		id: SEARCH_SETTINGS,
		status: SearchSettingsStatus::Present,
		model_name: "embedder-small".to_string(),
		provider_type: None,
		background_reindex_enabled: false,
	})
	.await;

	let server = rpc::Server::new(
		kv.clone(),
		db.clone(),
		task_queue.clone(),
		batches.clone(),
	);
	let endpoint = server.serve("127.0.0.1:0").await.unwrap();

	let jobs = JobClient::new(env!("CARGO_BIN_EXE_trawler")).with_args(vec![
		"fetch".to_string(),
		"--endpoint".to_string(),
		endpoint.to_string(),
	]);
	let orchestrator = Orchestrator::new(
		TENANT,
		clock.clone(),
		kv.clone(),
		db.clone(),
		task_queue.clone(),
		batches,
		Arc::new(StaticSourceFactory::new()),
		Arc::new(CountingPipelineFactory::new()),
		jobs,
	);
	Worker {
		orchestrator,
		kv,
		db,
		queue: task_queue,
		clock,
	}
}

#[test_log::test(tokio::test)]
async fn a_spawned_child_joins_the_worker_stores() {
	let w = worker().await;
	let attempt = w.db.create_attempt(DEMO_CC_PAIR, SEARCH_SETTINGS, false).await.unwrap();
	// the fence the beat would have armed for this attempt
	let fence = w.orchestrator.index_fence(DEMO_CC_PAIR, SEARCH_SETTINGS);
	fence
		.set_fence(
			&FencePayload {
				submitted: w.clock.now(),
				started: None,
				index_attempt_id: Some(attempt.id),
				task_id: Some("f-abc".to_string()),
			},
			None,
		)
		.await
		.unwrap();

	let args = DocFetchingArgs {
		attempt_id: attempt.id,
		cc_pair_id: DEMO_CC_PAIR,
		search_settings_id: SEARCH_SETTINGS,
		tenant_id: TENANT.to_string(),
	};
	w.orchestrator.docfetching_watchdog(&args, "f-abc").await.unwrap();

	// the child stamped the fence, streamed its batches through the shared
	// stores, and signalled completion before exiting zero
	assert_eq!(fence.get_completion().await.unwrap(), Some(200));
	assert!(fence.payload().await.unwrap().unwrap().started.is_some());
	assert_eq!(fence.get_progress().await.unwrap(), Some(24));
	assert!(!w.kv.exists(&fence.generator_lock_key()).await.unwrap());
	let mut dispatched = 0;
	while w.queue.try_recv(QueueName::DocProcessing).is_some() {
		dispatched += 1;
	}
	assert_eq!(dispatched, 3);
	// the attempt stays running for the processors to finish
	let row = w.db.attempt(attempt.id).await.unwrap().unwrap();
	assert_eq!(row.status, AttemptStatus::InProgress);
}

#[test_log::test(tokio::test)]
async fn a_blocked_child_reports_through_its_exit_code() {
	let w = worker().await;
	let attempt = w.db.create_attempt(DEMO_CC_PAIR, SEARCH_SETTINGS, false).await.unwrap();
	let fence = w.orchestrator.index_fence(DEMO_CC_PAIR, SEARCH_SETTINGS);
	fence
		.set_fence(
			&FencePayload {
				submitted: w.clock.now(),
				started: None,
				index_attempt_id: Some(attempt.id),
				task_id: Some("f-abc".to_string()),
			},
			None,
		)
		.await
		.unwrap();
	// a deletion in progress must block the child before it fetches
	ConnectorFences::new(w.kv.clone(), TENANT, DEMO_CC_PAIR)
		.set_deletion_fence(true)
		.await
		.unwrap();

	let args = DocFetchingArgs {
		attempt_id: attempt.id,
		cc_pair_id: DEMO_CC_PAIR,
		search_settings_id: SEARCH_SETTINGS,
		tenant_id: TENANT.to_string(),
	};
	let error = w.orchestrator.docfetching_watchdog(&args, "f-abc").await.unwrap_err();
	assert!(error.to_string().contains("Exception encountered"));

	let row = w.db.attempt(attempt.id).await.unwrap().unwrap();
	assert_eq!(row.status, AttemptStatus::Failed);
	assert!(row.failure_reason.unwrap().contains("exit_code=Some(248)"));
	assert_eq!(fence.get_completion().await.unwrap(), None);
}
