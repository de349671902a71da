//! The orchestrator task entrypoints.
//!
//! The periodic beat, the fetch watchdog, the per-batch processors and the
//! checkpoint sweep are all methods on [`Orchestrator`], which carries the
//! process-wide dependencies as explicit handles. One orchestrator serves
//! one tenant; workers clone it per task.

pub mod beat;
pub mod checkpoint;
pub mod fetch;
pub mod monitor;
pub mod process;

use crate::batch::BatchStorage;
use crate::db::Catalog;
use crate::fence::{keys, ConnectorFences, IndexFence};
use crate::job::JobClient;
use crate::kvs::{Clock, Lock, Store};
use crate::options::EngineOptions;
use crate::pipeline::{PipelineFactory, SourceFactory};
use crate::queue::TaskQueue;
use std::sync::Arc;
use std::time::Duration;

/// The shared handle driving all orchestrator operations for one tenant.
#[derive(Clone)]
pub struct Orchestrator {
	inner: Arc<Inner>,
}

struct Inner {
	tenant: String,
	kv: Arc<dyn Store>,
	db: Arc<dyn Catalog>,
	queue: Arc<dyn TaskQueue>,
	batches: Arc<dyn BatchStorage>,
	sources: Arc<dyn SourceFactory>,
	pipelines: Arc<dyn PipelineFactory>,
	jobs: JobClient,
	clock: Clock,
	opts: EngineOptions,
}

impl Orchestrator {
	/// Creates an orchestrator for a tenant over the given collaborators
	#[allow(clippy::too_many_arguments)]
	pub fn new(
		tenant: impl Into<String>,
		clock: Clock,
		kv: Arc<dyn Store>,
		db: Arc<dyn Catalog>,
		queue: Arc<dyn TaskQueue>,
		batches: Arc<dyn BatchStorage>,
		sources: Arc<dyn SourceFactory>,
		pipelines: Arc<dyn PipelineFactory>,
		jobs: JobClient,
	) -> Self {
		Self {
			inner: Arc::new(Inner {
				tenant: tenant.into(),
				kv,
				db,
				queue,
				batches,
				sources,
				pipelines,
				jobs,
				clock,
				opts: EngineOptions::default(),
			}),
		}
	}

	/// Replaces the runtime options
	pub fn with_options(self, opts: EngineOptions) -> Self {
		Self {
			inner: Arc::new(Inner {
				opts,
				..self.inner.rebuild()
			}),
		}
	}

	/// Creates a sibling orchestrator serving another tenant over the same
	/// collaborators
	pub fn for_tenant(&self, tenant: impl Into<String>) -> Self {
		Self {
			inner: Arc::new(Inner {
				tenant: tenant.into(),
				..self.inner.rebuild()
			}),
		}
	}

	/// The tenant this orchestrator serves
	pub fn tenant(&self) -> &str {
		&self.inner.tenant
	}

	/// The shared key-value store
	pub fn kv(&self) -> &Arc<dyn Store> {
		&self.inner.kv
	}

	/// The durable record catalog
	pub fn db(&self) -> &Arc<dyn Catalog> {
		&self.inner.db
	}

	/// The task queue
	pub fn queue(&self) -> &Arc<dyn TaskQueue> {
		&self.inner.queue
	}

	/// The document batch storage
	pub fn batches(&self) -> &Arc<dyn BatchStorage> {
		&self.inner.batches
	}

	/// The clock all lease arithmetic goes through
	pub fn clock(&self) -> &Clock {
		&self.inner.clock
	}

	/// The runtime options
	pub fn options(&self) -> &EngineOptions {
		&self.inner.opts
	}

	/// A typed fence handle for a `(cc_pair, search_settings)` composite
	pub fn index_fence(&self, cc_pair: i64, search_settings: i64) -> IndexFence {
		IndexFence::new(
			self.inner.kv.clone(),
			self.inner.clock.clone(),
			&self.inner.tenant,
			cc_pair,
			search_settings,
		)
	}

	/// The connector-wide deletion and stop fences for a cc-pair
	pub fn connector_fences(&self, cc_pair: i64) -> ConnectorFences {
		ConnectorFences::new(self.inner.kv.clone(), &self.inner.tenant, cc_pair)
	}

	/// A lease-bound lock over the shared key-value store
	pub(crate) fn lock(&self, key: impl Into<String>, ttl: Duration) -> Lock {
		Lock::new(self.inner.kv.clone(), key, ttl)
	}

	/// The beat lock key for this tenant
	pub(crate) fn beat_lock_key(&self) -> String {
		keys::check_indexing_beat_lock(&self.inner.tenant)
	}

	/// How long the fence validation block signal lives. The base interval
	/// is scaled by the beat multiplier in multi-tenant deployments.
	pub(crate) fn fence_validation_expiry(&self) -> Duration {
		let base = *crate::cnf::FENCE_VALIDATION_INTERVAL;
		match self.inner.opts.multi_tenant {
			true => Duration::from_secs((base as f64 * self.inner.opts.beat_multiplier) as u64),
			false => Duration::from_secs(base),
		}
	}

	pub(crate) fn jobs(&self) -> &JobClient {
		&self.inner.jobs
	}

	pub(crate) fn sources(&self) -> &Arc<dyn SourceFactory> {
		&self.inner.sources
	}

	pub(crate) fn pipelines(&self) -> &Arc<dyn PipelineFactory> {
		&self.inner.pipelines
	}
}

impl Inner {
	fn rebuild(&self) -> Inner {
		Inner {
			tenant: self.tenant.clone(),
			kv: self.kv.clone(),
			db: self.db.clone(),
			queue: self.queue.clone(),
			batches: self.batches.clone(),
			sources: self.sources.clone(),
			pipelines: self.pipelines.clone(),
			jobs: self.jobs.clone(),
			clock: self.clock.clone(),
			opts: self.opts,
		}
	}
}
