//! The fence protocol: lease-based at-most-one-active-attempt semantics.
//!
//! A fence is a key-value entry whose existence means "this
//! `(cc_pair, search_settings)` composite has a claimed indexing attempt".
//! Sibling keys carry liveness heartbeats, a progress counter, a
//! single-assignment completion marker, and termination signals. A
//! membership set enumerates the live fences for scanning.

pub mod keys;

use crate::cnf;
use crate::err::Error;
use crate::kvs::{Clock, Store, Timestamp};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

const TARGET: &str = "trawler::core::fence";

/// The completion status meaning the fetch generator finished cleanly
pub const COMPLETION_OK: u16 = 200;

/// The completion status meaning the fetch generator (or a processor) failed
pub const COMPLETION_ERROR: u16 = 500;

/// The transient claim record held by an indexing fence.
#[derive(Clone, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
pub struct FencePayload {
	/// When the attempt was submitted by the kick-off controller
	pub submitted: Timestamp,
	/// When the fetch process actually started running
	pub started: Option<Timestamp>,
	/// The attempt row this fence covers
	pub index_attempt_id: Option<i64>,
	/// The queue task executing the fetch
	pub task_id: Option<String>,
}

impl FencePayload {
	/// A payload is ready once the kick-off controller has finished
	/// populating it with both the attempt row and the queued task id.
	pub fn is_ready(&self) -> bool {
		self.index_attempt_id.is_some() && self.task_id.is_some()
	}
}

/// A typed handle over all per-fence keys of one
/// `(tenant, cc_pair, search_settings)` composite.
#[derive(Clone)]
pub struct IndexFence {
	store: Arc<dyn Store>,
	clock: Clock,
	tenant: String,
	cc_pair: i64,
	search_settings: i64,
}

impl IndexFence {
	pub fn new(
		store: Arc<dyn Store>,
		clock: Clock,
		tenant: impl Into<String>,
		cc_pair: i64,
		search_settings: i64,
	) -> Self {
		Self {
			store,
			clock,
			tenant: tenant.into(),
			cc_pair,
			search_settings,
		}
	}

	/// The fence payload key
	pub fn fence_key(&self) -> String {
		keys::fence(&self.tenant, self.cc_pair, self.search_settings)
	}

	/// The lock key held by the fetch process during extraction
	pub fn generator_lock_key(&self) -> String {
		keys::generator_lock(&self.tenant, self.cc_pair, self.search_settings)
	}

	/// The lock key serializing shared indexing state updates
	pub fn filestore_lock_key(&self) -> String {
		keys::filestore_lock(&self.tenant, self.cc_pair, self.search_settings)
	}

	/// The lock key serializing row-level writes in batch finalization
	pub fn db_lock_key(&self) -> String {
		keys::db_lock(&self.tenant, self.cc_pair, self.search_settings)
	}

	/// The deduplication lock key for one batch
	pub fn lock_key_by_batch(&self, batch_num: u64) -> String {
		keys::batch_lock(&self.tenant, self.cc_pair, self.search_settings, batch_num)
	}

	/// Checks whether the fence exists
	pub async fn fenced(&self) -> Result<bool, Error> {
		self.store.exists(&self.fence_key()).await
	}

	/// Writes the fence payload and registers the fence in the membership
	/// set. Passing a lease duration bounds the claim; the kick-off
	/// controller writes without one and relies on `reset` for teardown.
	pub async fn set_fence(&self, payload: &FencePayload, ttl: Option<Duration>) -> Result<(), Error> {
		let key = self.fence_key();
		self.store.put(&key, serde_json::to_vec(payload)?, ttl).await?;
		self.store.sadd(&keys::active_fences_set(&self.tenant), &key).await
	}

	/// Reads the fence payload, if the fence exists
	pub async fn payload(&self) -> Result<Option<FencePayload>, Error> {
		match self.store.get(&self.fence_key()).await? {
			Some(raw) => Ok(Some(
				serde_json::from_slice(&raw)
					.map_err(|_| Error::FencePayloadInvalid(self.fence_key()))?,
			)),
			None => Ok(None),
		}
	}

	/// Records the moment the fetch process started running
	pub async fn set_started(&self) -> Result<(), Error> {
		let mut payload = self.payload().await?.ok_or_else(|| Error::FenceNotFound(self.fence_key()))?;
		payload.started = Some(self.clock.now());
		self.set_fence(&payload, None).await
	}

	/// Renews the general attempt liveness signal
	pub async fn set_active(&self) -> Result<(), Error> {
		let key = keys::active(&self.tenant, self.cc_pair, self.search_settings);
		self.store.put(&key, b"1".to_vec(), Some(Duration::from_secs(*cnf::ACTIVE_SIGNAL_TTL))).await
	}

	/// Remaining lease of the general liveness signal in whole seconds,
	/// negative when absent
	pub async fn active_ttl(&self) -> Result<i64, Error> {
		let key = keys::active(&self.tenant, self.cc_pair, self.search_settings);
		Ok(self.store.ttl(&key).await?.as_secs())
	}

	/// Raises or clears the watchdog liveness signal
	pub async fn set_watchdog(&self, up: bool) -> Result<(), Error> {
		let key = keys::watchdog_active(&self.tenant, self.cc_pair, self.search_settings);
		if up {
			self.store
				.put(&key, b"1".to_vec(), Some(Duration::from_secs(*cnf::WATCHDOG_SIGNAL_TTL)))
				.await
		} else {
			self.store.del(&key).await
		}
	}

	/// Checks whether the watchdog liveness signal is still raised
	pub async fn watchdog_signaled(&self) -> Result<bool, Error> {
		let key = keys::watchdog_active(&self.tenant, self.cc_pair, self.search_settings);
		self.store.exists(&key).await
	}

	/// Renews the connector activity signal from inside the fetch loop
	pub async fn set_connector_active(&self) -> Result<(), Error> {
		let key = keys::connector_active(&self.tenant, self.cc_pair, self.search_settings);
		self.store
			.put(&key, b"1".to_vec(), Some(Duration::from_secs(*cnf::CONNECTOR_ACTIVITY_TIMEOUT)))
			.await
	}

	/// Remaining lease of the connector activity signal in whole seconds,
	/// negative when absent
	pub async fn connector_active_ttl(&self) -> Result<i64, Error> {
		let key = keys::connector_active(&self.tenant, self.cc_pair, self.search_settings);
		Ok(self.store.ttl(&key).await?.as_secs())
	}

	/// Writes the completion marker. The marker is single-assignment: the
	/// first writer wins and later writes are ignored.
	pub async fn set_completion(&self, status: u16) -> Result<(), Error> {
		let key = keys::completion(&self.tenant, self.cc_pair, self.search_settings);
		let written = self.store.put_nx(&key, status.to_string().into_bytes(), None).await?;
		if !written {
			debug!(target: TARGET, key = %key, status, "Completion marker already set, ignoring");
		}
		Ok(())
	}

	/// Reads the completion marker, if set
	pub async fn get_completion(&self) -> Result<Option<u16>, Error> {
		let key = keys::completion(&self.tenant, self.cc_pair, self.search_settings);
		match self.store.get(&key).await? {
			Some(raw) => Ok(std::str::from_utf8(&raw).ok().and_then(|s| s.parse().ok())),
			None => Ok(None),
		}
	}

	/// Increments the progress counter
	pub async fn incr_progress(&self, by: i64) -> Result<i64, Error> {
		let key = keys::progress(&self.tenant, self.cc_pair, self.search_settings);
		self.store.incr(&key, by).await
	}

	/// Reads the progress counter, if the fetcher has reported any
	pub async fn get_progress(&self) -> Result<Option<i64>, Error> {
		let key = keys::progress(&self.tenant, self.cc_pair, self.search_settings);
		match self.store.get(&key).await? {
			Some(raw) => Ok(std::str::from_utf8(&raw).ok().and_then(|s| s.parse().ok())),
			None => Ok(None),
		}
	}

	/// Raises the termination signal for a specific fetch task
	pub async fn set_terminate(&self, task_id: &str) -> Result<(), Error> {
		let key = keys::terminate(&self.tenant, self.cc_pair, self.search_settings, task_id);
		self.store
			.put(&key, b"1".to_vec(), Some(Duration::from_secs(*cnf::TERMINATE_SIGNAL_TTL)))
			.await
	}

	/// Checks whether a termination signal is raised for a specific task
	pub async fn terminating(&self, task_id: &str) -> Result<bool, Error> {
		let key = keys::terminate(&self.tenant, self.cc_pair, self.search_settings, task_id);
		self.store.exists(&key).await
	}

	/// Atomically removes every per-fence key and deregisters the fence
	/// from the membership set.
	pub async fn reset(&self) -> Result<(), Error> {
		let tenant = &self.tenant;
		let (cc, ss) = (self.cc_pair, self.search_settings);
		self.store.del(&keys::active(tenant, cc, ss)).await?;
		self.store.del(&keys::watchdog_active(tenant, cc, ss)).await?;
		self.store.del(&keys::connector_active(tenant, cc, ss)).await?;
		self.store.del(&keys::progress(tenant, cc, ss)).await?;
		self.store.del(&keys::completion(tenant, cc, ss)).await?;
		self.store.del(&keys::generator_lock(tenant, cc, ss)).await?;
		self.store.del(&keys::filestore_lock(tenant, cc, ss)).await?;
		self.store.del(&keys::db_lock(tenant, cc, ss)).await?;
		for key in self.store.scan(&keys::batch_lock_prefix(tenant, cc, ss)).await? {
			self.store.del(&key).await?;
		}
		for key in self.store.scan(&keys::terminate_prefix(tenant, cc, ss)).await? {
			self.store.del(&key).await?;
		}
		let key = self.fence_key();
		self.store.del(&key).await?;
		self.store.srem(&keys::active_fences_set(tenant), &key).await
	}
}

/// Connector-wide fences which block indexing while a deletion or a stop is
/// in progress for a cc-pair.
#[derive(Clone)]
pub struct ConnectorFences {
	store: Arc<dyn Store>,
	tenant: String,
	cc_pair: i64,
}

impl ConnectorFences {
	pub fn new(store: Arc<dyn Store>, tenant: impl Into<String>, cc_pair: i64) -> Self {
		Self {
			store,
			tenant: tenant.into(),
			cc_pair,
		}
	}

	/// The deletion fence key for this connector
	pub fn deletion_fence_key(&self) -> String {
		keys::deletion_fence(&self.tenant, self.cc_pair)
	}

	/// The stop fence key for this connector
	pub fn stop_fence_key(&self) -> String {
		keys::stop_fence(&self.tenant, self.cc_pair)
	}

	/// Checks whether a connector deletion is in progress
	pub async fn deletion_fenced(&self) -> Result<bool, Error> {
		self.store.exists(&self.deletion_fence_key()).await
	}

	/// Checks whether a connector stop has been requested
	pub async fn stop_fenced(&self) -> Result<bool, Error> {
		self.store.exists(&self.stop_fence_key()).await
	}

	/// Raises or clears the deletion fence
	pub async fn set_deletion_fence(&self, up: bool) -> Result<(), Error> {
		let key = self.deletion_fence_key();
		match up {
			true => self.store.put(&key, b"1".to_vec(), None).await,
			false => self.store.del(&key).await,
		}
	}

	/// Raises or clears the stop fence
	pub async fn set_stop_fence(&self, up: bool) -> Result<(), Error> {
		let key = self.stop_fence_key();
		match up {
			true => self.store.put(&key, b"1".to_vec(), None).await,
			false => self.store.del(&key).await,
		}
	}
}

/// Returns the keys of all live fences for a tenant, by reading the
/// membership set and reconciling with a prefix scan of the store.
pub async fn scan_active_fences(store: &Arc<dyn Store>, tenant: &str) -> Result<Vec<String>, Error> {
	let mut fences = store.smembers(&keys::active_fences_set(tenant)).await?;
	for key in store.scan(&keys::tenant_prefix(tenant)).await? {
		if keys::is_fence(tenant, &key) && !fences.contains(&key) {
			fences.push(key);
		}
	}
	Ok(fences)
}
