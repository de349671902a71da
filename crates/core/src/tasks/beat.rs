//! The periodic kick-off controller.
//!
//! One tick advances every cc-pair through its lifecycle: reconciling the
//! active-fence lookup table, creating fenced attempts for pairs that should
//! index, failing attempts whose fences have vanished, validating fences
//! against the queue, and finally invoking the monitor for each live fence.

use super::Orchestrator;
use crate::cnf;
use crate::db::{CcPair, IndexingTrigger, SearchSettings};
use crate::err::Error;
use crate::fence::{self, keys, FencePayload};
use crate::kvs::Lock;
use crate::queue::{DocFetchingArgs, Priority, QueueName, TaskMessage, TaskName};
use std::time::Duration;
use tracing::instrument;

const TARGET: &str = "trawler::core::tasks::beat";

impl Orchestrator {
	/// Runs one beat tick.
	///
	/// Reentrant-safe: returns `None` immediately when another tick already
	/// holds the beat lock. Otherwise returns the number of attempts created.
	#[instrument(level = "debug", target = "trawler::core::tasks::beat", skip(self))]
	pub async fn check_for_indexing(&self) -> Result<Option<u64>, Error> {
		let time_start = self.clock().now();
		let lock_beat =
			self.lock(self.beat_lock_key(), Duration::from_secs(*cnf::BEAT_LOCK_TTL));
		// these ticks should never overlap
		if !lock_beat.acquire().await? {
			return Ok(None);
		}
		// operational failures inside the tick are logged and tolerated so
		// the next tick gets a clean run at them
		let tasks_created = match self.check_for_indexing_locked(&lock_beat).await {
			Ok(created) => created,
			Err(error) => {
				error!(target: TARGET, %error, "Unexpected exception during indexing check");
				0
			}
		};
		// guaranteed-run cleanup
		if lock_beat.owned().await.unwrap_or(false) {
			lock_beat.release().await?;
		} else {
			error!(
				target: TARGET,
				tenant = %self.tenant(),
				"check_for_indexing - Lock not owned on completion",
			);
		}
		let elapsed = self.clock().now().elapsed_secs(time_start);
		info!(target: TARGET, "check_for_indexing finished: elapsed={elapsed:.2}");
		Ok(Some(tasks_created))
	}

	async fn check_for_indexing_locked(&self, lock_beat: &Lock) -> Result<u64, Error> {
		// Phase 0: reconcile the active-fence lookup table, at most once per
		// rebuild interval. This is a migration compensator and unnecessary
		// on steady state.
		let block_key = keys::block_build_fence_lookup_table(self.tenant());
		if !self.kv().exists(&block_key).await? {
			self.build_fence_lookup_table().await?;
			self.kv()
				.put(&block_key, b"1".to_vec(), Some(self.options().fence_lookup_rebuild_interval))
				.await?;
		}

		// Phase 1: kick-off
		let tasks_created = self.kickoff(lock_beat).await?;
		lock_beat.reacquire().await?;

		// Phase 2: validate
		self.fail_unfenced_attempts(lock_beat).await?;
		lock_beat.reacquire().await?;
		// we want to run fence validation less frequently than the tick
		let block_key = keys::block_validate_indexing_fences(self.tenant());
		if !self.kv().exists(&block_key).await? {
			if let Err(error) = self.validate_indexing_fences(lock_beat).await {
				warn!(target: TARGET, %error, "Exception while validating indexing fences");
			}
			self.kv().put(&block_key, b"1".to_vec(), Some(self.fence_validation_expiry())).await?;
		}

		// Phase 3: finalize
		lock_beat.reacquire().await?;
		for key in fence::scan_active_fences(self.kv(), self.tenant()).await? {
			// deregister fences which no longer exist
			if !self.kv().exists(&key).await? {
				self.kv().srem(&keys::active_fences_set(self.tenant()), &key).await?;
				continue;
			}
			if keys::is_fence(self.tenant(), &key) {
				if let Err(error) = self.monitor_indexing_fence(&key).await {
					warn!(target: TARGET, %error, key = %key, "Exception while monitoring fence");
				}
			}
		}

		Ok(tasks_created)
	}

	/// Inserts any fence key missing from the membership set.
	async fn build_fence_lookup_table(&self) -> Result<(), Error> {
		let set = keys::active_fences_set(self.tenant());
		for key in self.kv().scan(&keys::tenant_prefix(self.tenant())).await? {
			if keys::is_fence(self.tenant(), &key) && !self.kv().sismember(&set, &key).await? {
				warn!(target: TARGET, key = %key, "Adding fence to the lookup table");
				self.kv().sadd(&set, &key).await?;
			}
		}
		Ok(())
	}

	/// Creates fenced attempts for every composite that should index.
	async fn kickoff(&self, lock_beat: &Lock) -> Result<u64, Error> {
		let mut tasks_created = 0;
		// check for a search settings swap, and warm up the embedding model
		// only if settings changed and no hosted provider is configured
		let old_settings = self.db().check_and_perform_index_swap().await?;
		let current = self.db().current_search_settings().await?;
		if current.provider_type.is_none() && !self.options().multi_tenant && old_settings.is_some()
		{
			if let Err(error) = self.pipelines().warm_up(&current).await {
				warn!(target: TARGET, %error, "Embedding model warm up failed");
			}
		}

		// gather cc-pairs
		lock_beat.reacquire().await?;
		let cc_pairs = self.db().cc_pairs().await?;

		// mark cc-pairs that are repeatedly failing
		for cc_pair in &cc_pairs {
			if self.is_in_repeated_error_state(cc_pair.id, current.id).await? {
				self.db().set_cc_pair_repeated_error_state(cc_pair.id, true).await?;
			}
		}

		// kick off index attempts
		for cc_pair in &cc_pairs {
			lock_beat.reacquire().await?;
			let settings_list = self.db().active_search_settings().await?;
			let secondary_index_building = settings_list.len() > 1;
			for settings in &settings_list {
				// non-live settings without background reindex enabled will
				// auto-promote shortly after creation without any indexing
				if !settings.status.is_current() && !settings.background_reindex_enabled {
					debug!(
						target: TARGET,
						cc_pair = cc_pair.id,
						search_settings = settings.id,
						"check_for_indexing - Skipping non-live search settings",
					);
					continue;
				}
				let fence = self.index_fence(cc_pair.id, settings.id);
				if fence.fenced().await? {
					debug!(
						target: TARGET,
						cc_pair = cc_pair.id,
						search_settings = settings.id,
						"check_for_indexing - Skipping fenced connector",
					);
					continue;
				}
				// re-read the pair in case an earlier composite changed it
				let cc_pair = match self.db().cc_pair(cc_pair.id).await? {
					Some(cc_pair) => cc_pair,
					None => {
						warn!(
							target: TARGET,
							cc_pair = cc_pair.id,
							"check_for_indexing - CC pair not found",
						);
						continue;
					}
				};
				if !self.should_index(&cc_pair, settings, secondary_index_building).await? {
					debug!(
						target: TARGET,
						cc_pair = cc_pair.id,
						search_settings = settings.id,
						secondary_index_building,
						"check_for_indexing - Not indexing",
					);
					continue;
				}
				// the indexing trigger is only checked and cleared with the
				// current search settings
				let mut reindex = false;
				if settings.status.is_current() {
					if let Some(trigger) = self.db().take_indexing_trigger(cc_pair.id).await? {
						if trigger == IndexingTrigger::Reindex {
							reindex = true;
						}
						info!(
							target: TARGET,
							cc_pair = cc_pair.id,
							search_settings = settings.id,
							?trigger,
							"Connector indexing manual trigger detected",
						);
					}
				}
				match self.try_create_attempt(&cc_pair, settings, reindex).await? {
					Some(attempt_id) => {
						info!(
							target: TARGET,
							index_attempt = attempt_id,
							cc_pair = cc_pair.id,
							search_settings = settings.id,
							"Connector indexing queued",
						);
						tasks_created += 1;
					}
					None => {
						info!(
							target: TARGET,
							cc_pair = cc_pair.id,
							search_settings = settings.id,
							"Failed to create indexing task",
						);
					}
				}
			}
		}
		Ok(tasks_created)
	}

	/// Decides whether a composite should start an attempt now.
	///
	/// The decision encapsulates schedules, manual triggers, pauses,
	/// deletions and secondary-index semantics. The caller has already
	/// established that no fence exists for the composite.
	pub async fn should_index(
		&self,
		cc_pair: &CcPair,
		settings: &SearchSettings,
		secondary_index_building: bool,
	) -> Result<bool, Error> {
		// a deleting pair may never start an attempt
		if cc_pair.status == crate::db::CcPairStatus::Deleting {
			return Ok(false);
		}
		// a pair with no connector or credential has nothing to fetch
		if cc_pair.connector_id.is_none() || cc_pair.credential_id.is_none() {
			return Ok(false);
		}
		// a non-current generation is only built in the background, and only
		// until its first success
		if !settings.status.is_current() {
			if !settings.background_reindex_enabled || !secondary_index_building {
				return Ok(false);
			}
			let built =
				self.db().last_successful_attempt(cc_pair.id, settings.id).await?.is_some();
			return Ok(!built);
		}
		// a manual trigger overrides pauses and the repeated-error gate
		if cc_pair.indexing_trigger.is_some() {
			return Ok(true);
		}
		if cc_pair.status == crate::db::CcPairStatus::Paused {
			return Ok(false);
		}
		if cc_pair.in_repeated_error_state {
			return Ok(false);
		}
		// schedule: index immediately if never attempted, then on the
		// configured refresh frequency
		let last = self.db().recent_attempts(cc_pair.id, settings.id, 1).await?;
		let last = match last.first() {
			Some(last) => last.clone(),
			None => return Ok(true),
		};
		let freq = match cc_pair.refresh_freq {
			Some(freq) => freq,
			None => return Ok(false),
		};
		let now = self.clock().now();
		Ok(now - last.time_updated >= freq)
	}

	/// Checks whether the recent attempt window for a composite is all
	/// failures.
	pub async fn is_in_repeated_error_state(
		&self,
		cc_pair_id: i64,
		search_settings_id: i64,
	) -> Result<bool, Error> {
		let window = *cnf::REPEATED_ERROR_STATE_THRESHOLD;
		let attempts = self.db().recent_attempts(cc_pair_id, search_settings_id, window).await?;
		Ok(attempts.len() == window
			&& attempts.iter().all(|a| a.status == crate::db::AttemptStatus::Failed))
	}

	/// Creates an attempt row, fences it, and dispatches the fetch task.
	///
	/// The steps run under the beat lock and form one logical transaction:
	/// any failure undoes the fence and marks the attempt failed, so no
	/// half-armed fence survives the tick.
	pub async fn try_create_attempt(
		&self,
		cc_pair: &CcPair,
		settings: &SearchSettings,
		reindex: bool,
	) -> Result<Option<i64>, Error> {
		let attempt = self.db().create_attempt(cc_pair.id, settings.id, reindex).await?;
		let fence = self.index_fence(cc_pair.id, settings.id);
		match self.arm_fence_and_dispatch(&fence, attempt.id, cc_pair.id, settings.id).await {
			Ok(()) => Ok(Some(attempt.id)),
			Err(error) => {
				warn!(
					target: TARGET,
					%error,
					index_attempt = attempt.id,
					cc_pair = cc_pair.id,
					search_settings = settings.id,
					"Creating the docfetching task failed, undoing",
				);
				if let Err(error) = fence.reset().await {
					warn!(target: TARGET, %error, "Fence reset failed during undo");
				}
				if let Err(error) = self
					.db()
					.mark_attempt_failed(attempt.id, "docfetching task creation failed", None)
					.await
				{
					warn!(target: TARGET, %error, "Marking attempt failed during undo failed");
				}
				Ok(None)
			}
		}
	}

	async fn arm_fence_and_dispatch(
		&self,
		fence: &crate::fence::IndexFence,
		attempt_id: i64,
		cc_pair_id: i64,
		search_settings_id: i64,
	) -> Result<(), Error> {
		// fence first, so a concurrently delivered task waits for readiness
		let mut payload = FencePayload {
			submitted: self.clock().now(),
			started: None,
			index_attempt_id: Some(attempt_id),
			task_id: None,
		};
		fence.set_fence(&payload, None).await?;
		let task = TaskMessage::new(
			TaskName::DocFetching,
			DocFetchingArgs {
				attempt_id,
				cc_pair_id,
				search_settings_id,
				tenant_id: self.tenant().to_string(),
			},
			QueueName::DocFetching,
			Priority::Medium,
		)?;
		let task_id = task.id.clone();
		self.queue().send(task).await?;
		// the enqueued task id completes the payload and makes it ready
		payload.task_id = Some(task_id);
		fence.set_fence(&payload, None).await
	}

	/// Fails attempt rows in non-terminal states whose fence is absent.
	async fn fail_unfenced_attempts(&self, lock_beat: &Lock) -> Result<(), Error> {
		for attempt in self.db().nonterminal_attempts().await? {
			lock_beat.reacquire().await?;
			let fence = self.index_fence(attempt.cc_pair_id, attempt.search_settings_id);
			// the fence must exist and must reference this attempt
			if fence.fenced().await? {
				let claimed = fence
					.payload()
					.await?
					.and_then(|p| p.index_attempt_id)
					.map(|id| id == attempt.id)
					.unwrap_or(false);
				if claimed {
					continue;
				}
			}
			let failure_reason = format!(
				"Unfenced index attempt found in DB: index_attempt={} cc_pair={} search_settings={}",
				attempt.id, attempt.cc_pair_id, attempt.search_settings_id
			);
			error!(target: TARGET, "{failure_reason}");
			self.db().mark_attempt_failed(attempt.id, &failure_reason, None).await?;
		}
		Ok(())
	}

	/// Clears fences whose owning task has disappeared from the queue.
	async fn validate_indexing_fences(&self, lock_beat: &Lock) -> Result<(), Error> {
		for key in fence::scan_active_fences(self.kv(), self.tenant()).await? {
			lock_beat.reacquire().await?;
			let (cc_pair, search_settings) = match keys::parse_fence(self.tenant(), &key) {
				Some(parsed) => parsed,
				None => continue,
			};
			let fence = self.index_fence(cc_pair, search_settings);
			let payload = match fence.payload().await? {
				Some(payload) => payload,
				None => continue,
			};
			// a live attempt signal means a supervisor or processor is still
			// renewing leases; the fence is healthy regardless of the queue
			if fence.active_ttl().await? >= 0 {
				continue;
			}
			match payload.task_id {
				None => {
					// the beat may still be arming this fence; only a stale
					// half-armed fence is cleared
					let now = self.clock().now();
					let age = now - payload.submitted;
					if age > Duration::from_secs(*cnf::FENCE_READINESS_TIMEOUT) {
						warn!(
							target: TARGET,
							key = %key,
							age = age.as_secs(),
							"Clearing half-armed fence with no task id",
						);
						fence.reset().await?;
					}
				}
				Some(task_id) => {
					// tasks can be queued, reserved by a worker, or executing
					if !self.queue().known(&task_id).await? {
						warn!(
							target: TARGET,
							key = %key,
							task_id = %task_id,
							"Clearing fence whose task is gone from the queue",
						);
						fence.reset().await?;
					}
				}
			}
		}
		Ok(())
	}
}
