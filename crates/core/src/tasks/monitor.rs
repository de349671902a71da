//! The per-fence monitor, run as the third pass of the beat.
//!
//! The monitor detects orphaned fences and abnormal terminations. Crash
//! detection uses a double-check: completion marker, then the task's queue
//! state, then the completion marker again. Collapsing this to a single read
//! races against watchdog teardown and must not be done.

use super::Orchestrator;
use crate::db::CcPairStatus;
use crate::err::Error;
use crate::fence::keys;
use crate::queue::TaskState;
use tracing::instrument;

const TARGET: &str = "trawler::core::tasks::monitor";

impl Orchestrator {
	/// Monitors one live fence, finalizing it once the attempt has settled.
	#[instrument(level = "debug", target = "trawler::core::tasks::monitor", skip(self))]
	pub async fn monitor_indexing_fence(&self, key: &str) -> Result<(), Error> {
		let (cc_pair_id, search_settings_id) = match keys::parse_fence(self.tenant(), key) {
			Some(parsed) => parsed,
			None => {
				warn!(target: TARGET, key = %key, "Could not parse composite id from fence key");
				return Ok(());
			}
		};
		let fence = self.index_fence(cc_pair_id, search_settings_id);
		if !fence.fenced().await? {
			return Ok(());
		}
		let payload = match fence.payload().await? {
			Some(payload) => payload,
			None => return Ok(()),
		};

		// a pair should only ever be SCHEDULED before its first fence, so a
		// live fence promotes it
		let cc_pair =
			self.db().cc_pair(cc_pair_id).await?.ok_or(Error::CcPairNotFound(cc_pair_id))?;
		if cc_pair.status == CcPairStatus::Scheduled {
			self.db().set_cc_pair_status(cc_pair_id, CcPairStatus::InitialIndexing).await?;
		}

		let now = self.clock().now();
		let elapsed_submitted = now.elapsed_secs(payload.submitted);
		let elapsed_started = payload.started.map(|started| now.elapsed_secs(started));
		let elapsed_started_str =
			elapsed_started.map(|e| format!("{e:.2}")).unwrap_or_else(|| "None".to_string());

		let progress = fence.get_progress().await?;
		if let Some(progress) = progress {
			info!(
				target: TARGET,
				"Connector indexing progress: attempt={:?} cc_pair={} search_settings={} \
				 progress={} elapsed_submitted={:.2} elapsed_started={}",
				payload.index_attempt_id,
				cc_pair_id,
				search_settings_id,
				progress,
				elapsed_submitted,
				elapsed_started_str,
			);
		}

		// the task is still setting up
		let (attempt_id, task_id) = match (payload.index_attempt_id, payload.task_id.clone()) {
			(Some(attempt_id), Some(task_id)) => (attempt_id, task_id),
			_ => return Ok(()),
		};

		// Verify: if the completion marker is unset, the task must not be in
		// a terminal queue state.
		//   inner = completion marker unset
		//   outer = queue reports the task terminal
		// then double-check the inner signal before declaring a crash.
		let completion = fence.get_completion().await?;
		let status = match completion {
			None => {
				let task_state = self.queue().state(&task_id).await?;
				if task_state.is_ready() && fence.get_completion().await?.is_none() {
					// the task is finished but never signaled completion; the
					// worker crashed or was aborted
					self.handle_worker_crash(
						&fence,
						attempt_id,
						cc_pair_id,
						search_settings_id,
						&task_id,
						task_state,
						elapsed_submitted,
					)
					.await?;
				}
				return Ok(());
			}
			Some(status) => status,
		};

		// if the generator is complete, don't finalize until the watchdog
		// has exited
		if fence.watchdog_signaled().await? {
			info!(
				target: TARGET,
				"Connector indexing - Delaying finalization until watchdog has exited: \
				 attempt={} cc_pair={} search_settings={} progress={:?} \
				 elapsed_submitted={:.2} elapsed_started={}",
				attempt_id,
				cc_pair_id,
				search_settings_id,
				progress,
				elapsed_submitted,
				elapsed_started_str,
			);
			return Ok(());
		}

		info!(
			target: TARGET,
			"Connector indexing finished: attempt={} cc_pair={} search_settings={} \
			 progress={:?} status={} elapsed_submitted={:.2} elapsed_started={}",
			attempt_id,
			cc_pair_id,
			search_settings_id,
			progress,
			status,
			elapsed_submitted,
			elapsed_started_str,
		);

		fence.reset().await?;

		// a completion status other than OK with a non-terminal attempt row
		// means a processor aborted the attempt mid-flight
		if status != crate::fence::COMPLETION_OK {
			if let Some(attempt) = self.db().attempt(attempt_id).await? {
				if !attempt.status.is_terminal() {
					let reason = format!(
						"Connector indexing finalized with error status: attempt={} status={}",
						attempt_id, status
					);
					if let Err(error) =
						self.db().mark_attempt_failed(attempt_id, &reason, None).await
					{
						warn!(
							target: TARGET,
							%error,
							attempt = attempt_id,
							"Transient exception marking index attempt as failed",
						);
					}
				}
			}
		}

		// promote the pair to ACTIVE on its first success, and let a success
		// clear the repeated-error gate
		let successful = self
			.db()
			.attempt(attempt_id)
			.await?
			.map(|a| a.status.is_successful())
			.unwrap_or(false);
		if successful
			&& matches!(cc_pair.status, CcPairStatus::Scheduled | CcPairStatus::InitialIndexing)
		{
			self.db().set_cc_pair_status(cc_pair_id, CcPairStatus::Active).await?;
		}
		if successful && cc_pair.in_repeated_error_state {
			self.db().set_cc_pair_repeated_error_state(cc_pair_id, false).await?;
		}
		Ok(())
	}

	#[allow(clippy::too_many_arguments)]
	async fn handle_worker_crash(
		&self,
		fence: &crate::fence::IndexFence,
		attempt_id: i64,
		cc_pair_id: i64,
		search_settings_id: i64,
		task_id: &str,
		task_state: TaskState,
		elapsed_submitted: f64,
	) -> Result<(), Error> {
		let (task_result, task_traceback) = match &task_state {
			TaskState::Ready {
				result,
				traceback,
				..
			} => (result.clone(), traceback.clone()),
			_ => (None, None),
		};
		let msg = format!(
			"Connector indexing aborted or exceptioned: attempt={} task={} cc_pair={} \
			 search_settings={} elapsed_submitted={:.2} result.state={:?} result.result={:?} \
			 result.traceback={:?}",
			attempt_id,
			task_id,
			cc_pair_id,
			search_settings_id,
			elapsed_submitted,
			task_state,
			task_result,
			task_traceback,
		);
		warn!(target: TARGET, "{msg}");

		// transient catalog errors here must not stop the fence reset
		match self.db().attempt(attempt_id).await {
			Ok(Some(attempt)) if !attempt.status.is_terminal() => {
				if let Err(error) = self
					.db()
					.mark_attempt_failed(attempt_id, &msg, task_traceback.as_deref())
					.await
				{
					warn!(
						target: TARGET,
						%error,
						attempt = attempt_id,
						"Transient exception marking index attempt as failed",
					);
				}
			}
			Ok(_) => {}
			Err(error) => {
				warn!(
					target: TARGET,
					%error,
					attempt = attempt_id,
					"Transient exception looking up index attempt",
				);
			}
		}

		fence.reset().await
	}
}
