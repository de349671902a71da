#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;
use trawler_core::db::{CcPair, CcPairStatus, SearchSettings, SearchSettingsStatus};
use trawler_core::fence::FencePayload;
use trawler_core::job::JobClient;
use trawler_core::kvs::{Clock, Store, Timestamp};
use trawler_core::pipeline::stub::{CountingPipelineFactory, StaticSourceFactory};
use trawler_core::pipeline::Document;
use trawler_core::{batch, db, kvs, queue, Orchestrator};

/// The manually driven clock epoch all scenarios start from
pub const T0: u64 = 1_000_000;

pub const TENANT: &str = "t1";
pub const CC_PAIR: i64 = 7;
pub const SEARCH_SETTINGS: i64 = 2;

pub struct Harness {
	pub orchestrator: Orchestrator,
	pub clock: Clock,
	pub kv: Arc<kvs::mem::Datastore>,
	pub db: Arc<db::mem::Datastore>,
	pub queue: Arc<queue::mem::Datastore>,
	pub batches: Arc<batch::mem::Datastore>,
	pub sources: Arc<StaticSourceFactory>,
	pub pipelines: Arc<CountingPipelineFactory>,
}

pub fn harness() -> Harness {
	harness_with_jobs(JobClient::new("/bin/true"))
}

pub fn harness_with_jobs(jobs: JobClient) -> Harness {
	let clock = Clock::fixed(Timestamp::from(T0));
	let kv = Arc::new(kvs::mem::Datastore::new(clock.clone()));
	let db = Arc::new(db::mem::Datastore::new(clock.clone()));
	let queue = Arc::new(queue::mem::Datastore::new());
	let batches = Arc::new(batch::mem::Datastore::new());
	let sources = Arc::new(StaticSourceFactory::new());
	let pipelines = Arc::new(CountingPipelineFactory::new());
	let orchestrator = Orchestrator::new(
		TENANT,
		clock.clone(),
		kv.clone() as Arc<dyn Store>,
		db.clone(),
		queue.clone(),
		batches.clone(),
		sources.clone(),
		pipelines.clone(),
		jobs,
	);
	Harness {
		orchestrator,
		clock,
		kv,
		db,
		queue,
		batches,
		sources,
		pipelines,
	}
}

impl Harness {
	/// Advances the manually driven clock
	pub fn tick(&self, duration: Duration) {
		self.clock.advance(duration);
	}

	/// Seeds one active cc-pair and one current search settings generation
	pub async fn seed_defaults(&self) {
		self.db.insert_cc_pair(cc_pair(CC_PAIR)).await;
		self.db.insert_search_settings(search_settings(SEARCH_SETTINGS)).await;
	}

	/// Arms a ready fence for the default composite
	pub async fn arm_fence(&self, attempt_id: i64, task_id: &str) {
		let fence = self.orchestrator.index_fence(CC_PAIR, SEARCH_SETTINGS);
		fence
			.set_fence(
				&FencePayload {
					submitted: self.clock.now(),
					started: None,
					index_attempt_id: Some(attempt_id),
					task_id: Some(task_id.to_string()),
				},
				None,
			)
			.await
			.unwrap();
	}
}

pub fn cc_pair(id: i64) -> CcPair {
	CcPair {
		id,
		name: format!("pair-{id}"),
		source: "web".to_string(),
		connector_id: Some(1),
		credential_id: Some(1),
		status: CcPairStatus::Active,
		indexing_trigger: None,
		in_repeated_error_state: false,
		refresh_freq: Some(Duration::from_secs(3600)),
	}
}

pub fn search_settings(id: i64) -> SearchSettings {
	SearchSettings {
		id,
		status: SearchSettingsStatus::Present,
		model_name: "embedder-small".to_string(),
		provider_type: None,
		background_reindex_enabled: false,
	}
}

pub fn documents(prefix: &str, count: usize) -> Vec<Document> {
	(0..count)
		.map(|n| Document {
			id: format!("{prefix}-{n}"),
			content: format!("document {prefix} {n}"),
		})
		.collect()
}
