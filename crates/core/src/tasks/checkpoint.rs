//! Checkpoint housekeeping.
//!
//! Finished attempts keep their extraction checkpoints for a retention
//! window so operators can resume or inspect them. A periodic sweep finds
//! the expired ones and dispatches one lightweight cleanup task each.

use super::Orchestrator;
use crate::cnf;
use crate::err::Error;
use crate::fence::keys;
use crate::queue::{CleanupCheckpointArgs, Priority, QueueName, TaskMessage, TaskName};
use std::time::Duration;
use tracing::instrument;

const TARGET: &str = "trawler::core::tasks::checkpoint";

impl Orchestrator {
	/// Sweeps for attempts with checkpoints past the retention window and
	/// dispatches a cleanup task for each.
	///
	/// Reentrant-safe: returns immediately when another sweep holds the lock.
	#[instrument(level = "debug", target = "trawler::core::tasks::checkpoint", skip(self))]
	pub async fn check_for_checkpoint_cleanup(&self) -> Result<Option<u64>, Error> {
		let lock = self.lock(
			keys::check_checkpoint_cleanup_beat_lock(self.tenant()),
			Duration::from_secs(*cnf::BEAT_LOCK_TTL),
		);
		// these ticks should never overlap
		if !lock.acquire().await? {
			return Ok(None);
		}
		let dispatched = match self.sweep_old_checkpoints().await {
			Ok(dispatched) => dispatched,
			Err(error) => {
				error!(target: TARGET, %error, "Unexpected exception during checkpoint cleanup");
				0
			}
		};
		// guaranteed-run cleanup
		if lock.owned().await.unwrap_or(false) {
			lock.release().await?;
		} else {
			error!(
				target: TARGET,
				tenant = %self.tenant(),
				"check_for_checkpoint_cleanup - Lock not owned on completion",
			);
		}
		Ok(Some(dispatched))
	}

	async fn sweep_old_checkpoints(&self) -> Result<u64, Error> {
		let now = self.clock().now();
		let retention = Duration::from_secs(*cnf::CHECKPOINT_RETENTION_DAYS * 24 * 60 * 60);
		let cutoff = crate::kvs::Timestamp::from(
			now.value.saturating_sub(retention.as_millis() as u64),
		);
		let mut dispatched = 0;
		for attempt in self.db().attempts_with_old_checkpoints(cutoff).await? {
			info!(
				target: TARGET,
				attempt = attempt.id,
				"Cleaning up checkpoint for index attempt",
			);
			self.queue()
				.send(TaskMessage::new(
					TaskName::CleanupCheckpoint,
					CleanupCheckpointArgs {
						attempt_id: attempt.id,
						tenant_id: self.tenant().to_string(),
					},
					QueueName::Light,
					Priority::Medium,
				)?)
				.await?;
			dispatched += 1;
		}
		Ok(dispatched)
	}

	/// Removes the extraction checkpoint of one attempt.
	#[instrument(level = "debug", target = "trawler::core::tasks::checkpoint", skip(self))]
	pub async fn cleanup_checkpoint(&self, attempt_id: i64) -> Result<(), Error> {
		let start = self.clock().now();
		let result = self.db().cleanup_checkpoint(attempt_id).await;
		let elapsed = self.clock().now().elapsed_secs(start);
		info!(
			target: TARGET,
			"cleanup_checkpoint completed: tenant_id={} index_attempt_id={} elapsed={:.2}",
			self.tenant(),
			attempt_id,
			elapsed,
		);
		result
	}
}
