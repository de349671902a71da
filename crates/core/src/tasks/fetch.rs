//! Document fetching: the spawned entrypoint and its watchdog.
//!
//! The fetch task body runs in the worker, but the extraction itself runs in
//! a spawned child process. The worker-side watchdog supervises the child
//! against termination signals and activity-lease expiry, and classifies a
//! dead child purely from its exit code.

use super::Orchestrator;
use crate::batch::DocExtractionContext;
use crate::cnf;
use crate::err::Error;
use crate::fence::{IndexFence, COMPLETION_OK};
use crate::job::{Job, JobStatus, TerminalStatus};
use crate::kvs::{Lock, Timestamp};
use crate::obs::{emit_process_memory, normalize_exception, LogBuilder};
use crate::pipeline::ProgressCallback;
use crate::queue::{DocFetchingArgs, DocProcessingArgs, Priority, QueueName, TaskMessage, TaskName};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tracing::instrument;
use uuid::Uuid;

const TARGET: &str = "trawler::core::tasks::fetch";

/// How long shared-state lock acquisition may block inside the fetch loop
const LOCK_WAIT: Duration = Duration::from_secs(60);

/// The classified outcome of one supervised fetch run
#[derive(Clone, Debug)]
pub struct JobResult {
	pub status: TerminalStatus,
	pub exit_code: Option<i32>,
	pub exception: Option<String>,
	pub connector_source: Option<String>,
}

impl Default for JobResult {
	fn default() -> Self {
		Self {
			status: TerminalStatus::Undefined,
			exit_code: None,
			exception: None,
			connector_source: None,
		}
	}
}

/// Renews the fetch-side leases on every progress notification
struct FetchProgressCallback {
	fence: IndexFence,
	lock: Arc<Lock>,
}

#[async_trait]
impl ProgressCallback for FetchProgressCallback {
	async fn progress(&self, tag: &str, amount: u64) {
		if let Err(error) = self.lock.reacquire().await {
			warn!(target: TARGET, %error, tag, "Generator lock reacquire failed in callback");
		}
		if let Err(error) = self.fence.set_active().await {
			warn!(target: TARGET, %error, tag, "Active signal renewal failed in callback");
		}
		if let Err(error) = self.fence.set_connector_active().await {
			warn!(target: TARGET, %error, tag, "Connector signal renewal failed in callback");
		}
		if amount > 0 {
			if let Err(error) = self.fence.incr_progress(amount as i64).await {
				warn!(target: TARGET, %error, tag, "Progress increment failed in callback");
			}
		}
	}
}

impl Orchestrator {
	/// The body of the spawned fetch process.
	///
	/// Fails fast with a coded error when the connector is fenced for
	/// deletion or stop, waits for its fence to become ready, then runs the
	/// extraction under the generator lock. The caller maps coded errors
	/// onto the process exit code.
	#[instrument(level = "debug", target = "trawler::core::tasks::fetch", skip(self))]
	pub async fn run_docfetching(&self, args: &DocFetchingArgs) -> Result<i64, Error> {
		info!(
			target: TARGET,
			"Indexing spawned task starting: attempt={} tenant={} cc_pair={} search_settings={}",
			args.attempt_id,
			args.tenant_id,
			args.cc_pair_id,
			args.search_settings_id,
		);

		let connector = self.connector_fences(args.cc_pair_id);
		if connector.deletion_fenced().await? {
			return Err(Error::terminal(
				TerminalStatus::BlockedByDeletion,
				format!(
					"Indexing will not start because connector deletion is in progress: \
					 attempt={} cc_pair={} fence={}",
					args.attempt_id,
					args.cc_pair_id,
					connector.deletion_fence_key()
				),
			));
		}
		if connector.stop_fenced().await? {
			return Err(Error::terminal(
				TerminalStatus::BlockedByStopSignal,
				format!(
					"Indexing will not start because a connector stop signal was detected: \
					 attempt={} cc_pair={} fence={}",
					args.attempt_id,
					args.cc_pair_id,
					connector.stop_fence_key()
				),
			));
		}

		let fence = self.index_fence(args.cc_pair_id, args.search_settings_id);
		self.wait_for_fence_readiness(&fence, args).await?;

		// the generator lock serializes the whole extraction per composite
		let lock = Arc::new(
			self.lock(fence.generator_lock_key(), Duration::from_secs(*cnf::INDEXING_LOCK_TTL)),
		);
		if !lock.acquire().await? {
			let msg = format!(
				"Indexing task already running, exiting...: index_attempt={} cc_pair={} \
				 search_settings={}",
				args.attempt_id, args.cc_pair_id, args.search_settings_id
			);
			warn!(target: TARGET, "{msg}");
			return Err(Error::terminal(TerminalStatus::TaskAlreadyRunning, msg));
		}

		fence.set_started().await?;

		let result = self.run_extraction(args, &fence, &lock).await;
		if lock.owned().await.unwrap_or(false) {
			if let Err(error) = lock.release().await {
				warn!(target: TARGET, %error, "Generator lock release failed");
			}
		}
		let total_docs = match result {
			Ok(total_docs) => {
				fence.set_completion(COMPLETION_OK).await?;
				total_docs
			}
			Err(Error::ConnectorValidation(message)) => {
				return Err(Error::terminal(
					TerminalStatus::ConnectorValidationError,
					format!(
						"Indexing task failed: attempt={} tenant={} cc_pair={} \
						 search_settings={} validation={}",
						args.attempt_id,
						args.tenant_id,
						args.cc_pair_id,
						args.search_settings_id,
						message,
					),
				));
			}
			Err(error @ Error::Terminal { .. }) => return Err(error),
			Err(error) => {
				error!(
					target: TARGET,
					%error,
					"Indexing spawned task failed: attempt={} tenant={} cc_pair={} \
					 search_settings={}",
					args.attempt_id,
					args.tenant_id,
					args.cc_pair_id,
					args.search_settings_id,
				);
				// truncate long exception messages before they travel
				let mut message = error.to_string();
				if message.len() > cnf::EXCEPTION_MESSAGE_LIMIT {
					let mut cut = cnf::EXCEPTION_MESSAGE_LIMIT;
					while !message.is_char_boundary(cut) {
						cut -= 1;
					}
					message.truncate(cut);
				}
				return Err(Error::terminal(TerminalStatus::ConnectorExceptioned, message));
			}
		};

		info!(
			target: TARGET,
			"Indexing spawned task finished: attempt={} cc_pair={} search_settings={}",
			args.attempt_id,
			args.cc_pair_id,
			args.search_settings_id,
		);
		Ok(total_docs)
	}

	/// Polls until the fence exists, its payload is fully populated, and it
	/// references this task's attempt. This closes the race where the queue
	/// delivers the task before the kick-off finishes arming the fence.
	async fn wait_for_fence_readiness(
		&self,
		fence: &IndexFence,
		args: &DocFetchingArgs,
	) -> Result<(), Error> {
		let start = self.clock().now();
		let timeout = Duration::from_secs(*cnf::FENCE_READINESS_TIMEOUT);
		loop {
			if self.clock().now() - start > timeout {
				return Err(Error::terminal(
					TerminalStatus::FenceReadinessTimeout,
					format!(
						"Timed out waiting for fence to be ready: fence={}",
						fence.fence_key()
					),
				));
			}
			if !fence.fenced().await? {
				return Err(Error::terminal(
					TerminalStatus::FenceNotFound,
					format!("Fence not found: fence={}", fence.fence_key()),
				));
			}
			let payload = match fence.payload().await? {
				Some(payload) => payload,
				None => {
					return Err(Error::terminal(
						TerminalStatus::FenceNotFound,
						format!("Fence payload invalid or not found: fence={}", fence.fence_key()),
					));
				}
			};
			if !payload.is_ready() {
				info!(
					target: TARGET,
					"Waiting for fence: fence={}",
					fence.fence_key(),
				);
				tokio::time::sleep(Duration::from_secs(cnf::FENCE_WAIT_POLL_INTERVAL)).await;
				continue;
			}
			if payload.index_attempt_id != Some(args.attempt_id) {
				return Err(Error::terminal(
					TerminalStatus::FenceMismatch,
					format!(
						"Fence id mismatch. Task may be left over from a previous run: \
						 task_index_attempt={} payload_index_attempt={:?}",
						args.attempt_id, payload.index_attempt_id
					),
				));
			}
			info!(
				target: TARGET,
				"Fence found, continuing...: fence={}",
				fence.fence_key(),
			);
			return Ok(());
		}
	}

	/// Streams batches out of the connector, dispatching one processing task
	/// per stored batch, and stamps the extraction context when drained.
	async fn run_extraction(
		&self,
		args: &DocFetchingArgs,
		fence: &IndexFence,
		lock: &Arc<Lock>,
	) -> Result<i64, Error> {
		// every row the run needs must already exist
		let attempt = self.db().attempt(args.attempt_id).await?.ok_or_else(|| {
			Error::terminal(
				TerminalStatus::IndexAttemptMismatch,
				format!("Index attempt not found: index_attempt={}", args.attempt_id),
			)
		})?;
		let cc_pair = self.db().cc_pair(args.cc_pair_id).await?.ok_or_else(|| {
			Error::terminal(
				TerminalStatus::IndexAttemptMismatch,
				format!("cc_pair not found: cc_pair={}", args.cc_pair_id),
			)
		})?;
		if cc_pair.connector_id.is_none() {
			return Err(Error::terminal(
				TerminalStatus::IndexAttemptMismatch,
				format!("Connector not found: cc_pair={}", args.cc_pair_id),
			));
		}
		if cc_pair.credential_id.is_none() {
			return Err(Error::terminal(
				TerminalStatus::IndexAttemptMismatch,
				format!("Credential not found: cc_pair={}", args.cc_pair_id),
			));
		}
		self.db().mark_attempt_started(attempt.id).await?;

		let callback = FetchProgressCallback {
			fence: fence.clone(),
			lock: lock.clone(),
		};

		info!(
			target: TARGET,
			"Indexing spawned task running entrypoint: attempt={} tenant={} cc_pair={} \
			 search_settings={}",
			args.attempt_id,
			args.tenant_id,
			args.cc_pair_id,
			args.search_settings_id,
		);

		self.batches()
			.store_extraction_context(
				attempt.id,
				&DocExtractionContext {
					source: cc_pair.source.clone(),
					doc_extraction_complete_batch_num: None,
				},
			)
			.await?;

		let mut source = self.sources().open(cc_pair.id, attempt.from_beginning).await?;
		let mut batch_num: u64 = 0;
		let mut total_docs: i64 = 0;
		while let Some(documents) = source.next_batch().await? {
			if documents.is_empty() {
				continue;
			}
			batch_num += 1;
			let docs_in_batch = documents.len() as u64;
			let batch_id = Uuid::new_v4().to_string();
			self.batches().store_batch(attempt.id, &batch_id, documents).await?;
			self.track_unfinished_batch(fence, attempt.id).await?;
			self.queue()
				.send(TaskMessage::new(
					TaskName::DocProcessing,
					DocProcessingArgs {
						batch_id: batch_id.clone(),
						attempt_id: attempt.id,
						cc_pair_id: cc_pair.id,
						tenant_id: args.tenant_id.clone(),
						batch_num,
					},
					QueueName::DocProcessing,
					Priority::Medium,
				)?)
				.await?;
			callback.progress("extract", docs_in_batch).await;
			total_docs += docs_in_batch as i64;
			debug!(
				target: TARGET,
				batch_id = %batch_id,
				batch_num,
				docs = docs_in_batch,
				"Dispatched document batch",
			);
		}

		// stamping the batch count makes processor-side completion checks
		// able to fire
		self.batches()
			.store_extraction_context(
				attempt.id,
				&DocExtractionContext {
					source: cc_pair.source.clone(),
					doc_extraction_complete_batch_num: Some(batch_num),
				},
			)
			.await?;

		// a source with nothing to index settles immediately, since no
		// processing task will ever run the completion check
		if batch_num == 0 {
			self.db().mark_attempt_succeeded(attempt.id, false).await?;
			self.db().set_indexing_trigger(cc_pair.id, None).await?;
			self.batches().delete_all(attempt.id).await?;
		}

		Ok(total_docs)
	}

	/// Registers a newly stored batch in the shared indexing state.
	async fn track_unfinished_batch(&self, fence: &IndexFence, attempt_id: i64) -> Result<(), Error> {
		let state_lock = self
			.lock(fence.filestore_lock_key(), Duration::from_secs(*cnf::INDEXING_LOCK_TTL));
		if !state_lock.acquire_timeout(LOCK_WAIT).await? {
			return Err(Error::Internal(format!(
				"could not acquire the cross-batch state lock: key={}",
				fence.filestore_lock_key()
			)));
		}
		let result = async {
			let mut state = self.batches().ensure_indexing_state(attempt_id).await?;
			state.unfinished_batches += 1;
			self.batches().store_indexing_state(attempt_id, &state).await
		}
		.await;
		state_lock.release().await?;
		result
	}

	/// Supervises one spawned fetch process to completion.
	///
	/// This is the body of the doc-fetching queue task. It must be extremely
	/// stable: every catalog access is individually guarded, and operational
	/// failures are reported as `WATCHDOG_EXCEPTIONED` on the attempt row.
	#[instrument(level = "debug", target = "trawler::core::tasks::fetch", skip(self))]
	pub async fn docfetching_watchdog(
		&self,
		args: &DocFetchingArgs,
		task_id: &str,
	) -> Result<(), Error> {
		let start = self.clock().now();
		let log = LogBuilder::new(
			&args.tenant_id,
			args.attempt_id,
			args.cc_pair_id,
			args.search_settings_id,
		);
		info!(target: TARGET, "{}", log.build("Indexing watchdog - starting"));

		let fetch_args = vec![
			"--tenant".to_string(),
			args.tenant_id.clone(),
			"--attempt-id".to_string(),
			args.attempt_id.to_string(),
			"--cc-pair-id".to_string(),
			args.cc_pair_id.to_string(),
			"--search-settings-id".to_string(),
			args.search_settings_id.to_string(),
		];
		let mut job = match self.jobs().submit(&fetch_args) {
			Ok(job) => job,
			Err(error) => {
				warn!(target: TARGET, %error, "{}", log.build("Indexing watchdog - spawn failed"));
				info!(
					target: TARGET,
					"{}",
					log.build_with(
						"Indexing watchdog - finished",
						&[("status", TerminalStatus::SpawnFailed.as_str().to_string())],
					)
				);
				return Ok(());
			}
		};

		// ensure the process has moved out of the starting state
		let mut waited: u64 = 0;
		loop {
			if waited > *cnf::SPAWN_LIVENESS_GRACE {
				info!(
					target: TARGET,
					"{}",
					log.build_with(
						"Indexing watchdog - finished",
						&[("status", TerminalStatus::SpawnNotAlive.as_str().to_string())],
					)
				);
				job.release();
				return Ok(());
			}
			if job.is_alive()? || job.exit_code()?.is_some() {
				break;
			}
			tokio::time::sleep(Duration::from_secs(1)).await;
			waited += 1;
		}

		info!(
			target: TARGET,
			"{}",
			log.build_with(
				"Indexing watchdog - spawn succeeded",
				&[("pid", format!("{:?}", job.pid()))],
			)
		);

		let fence = self.index_fence(args.cc_pair_id, args.search_settings_id);
		// the connector source only decorates final reporting; look it up
		// tolerantly
		let connector_source = match self.db().cc_pair(args.cc_pair_id).await {
			Ok(cc_pair) => cc_pair.map(|c| c.source),
			Err(_) => None,
		};

		fence.set_active().await?;
		// prime the connector activity signal; the fetch loop renews it
		fence.set_connector_active().await?;

		let mut result = match self.supervise(&mut job, &fence, args, task_id, &log).await {
			Ok(result) => result,
			Err(error) => {
				let exception = match &error {
					// validation problems carry only the message
					Error::ConnectorValidation(message) => message.clone(),
					error => error.to_string(),
				};
				JobResult {
					status: TerminalStatus::WatchdogExceptioned,
					exception: Some(exception),
					..Default::default()
				}
			}
		};
		result.connector_source = connector_source;

		self.report_watchdog_result(&mut job, &fence, args, result, start, &log).await
	}

	/// The 5-second supervision loop.
	async fn supervise(
		&self,
		job: &mut Job,
		fence: &IndexFence,
		args: &DocFetchingArgs,
		task_id: &str,
		log: &LogBuilder,
	) -> Result<JobResult, Error> {
		let mut last_memory_emit: Option<Timestamp> = None;
		// track the last ttl and the time it was observed
		let mut last_activity_observed = self.clock().now();
		let mut last_activity_ttl: u64 = 0;
		loop {
			tokio::time::sleep(Duration::from_secs(*cnf::SUPERVISOR_POLL_INTERVAL)).await;
			let now = self.clock().now();

			// the watchdog signal has a shorter lease than the active signal
			fence.set_watchdog(true).await?;
			fence.set_active().await?;

			// if the job is done, classify the outcome and break
			if job.done()? {
				let result = match self.process_job_result(job, fence, log).await {
					Ok(result) => result,
					Err(error) => {
						warn!(
							target: TARGET,
							%error,
							"{}",
							log.build("Indexing watchdog - spawned task exceptioned"),
						);
						JobResult::default()
					}
				};
				return Ok(result);
			}

			// sample child memory for tracking down connector memory issues
			if let Some(pid) = job.pid() {
				let due = match last_memory_emit {
					Some(last) => now - last >= Duration::from_secs(*cnf::MEMORY_SAMPLE_PERIOD),
					None => true,
				};
				if due {
					emit_process_memory(
						pid,
						"docfetching_worker",
						&[
							("cc_pair_id", args.cc_pair_id.to_string()),
							("search_settings_id", args.search_settings_id.to_string()),
							("index_attempt_id", args.attempt_id.to_string()),
						],
					);
					last_memory_emit = Some(now);
				}
			}

			// the exit point cleans up after a termination signal
			if fence.terminating(task_id).await? {
				warn!(
					target: TARGET,
					"{}",
					log.build("Indexing watchdog - termination signal detected"),
				);
				return Ok(JobResult {
					status: TerminalStatus::TerminatedBySignal,
					exit_code: job.exit_code()?,
					..Default::default()
				});
			}

			// activity-lease expiry is only genuine once the last observed
			// ttl has fully drained; an unexpectedly expired lease waits one
			// more cycle to tolerate observation gaps and clock skew
			let ttl = fence.connector_active_ttl().await?;
			if ttl < 0 {
				if now > last_activity_observed + Duration::from_secs(last_activity_ttl) {
					warn!(
						target: TARGET,
						"{}",
						log.build_with(
							"Indexing watchdog - activity timeout exceeded",
							&[
								("last_observed", format!("{:.2}s", now.elapsed_secs(last_activity_observed))),
								("last_ttl", last_activity_ttl.to_string()),
								("timeout", format!("{}s", *cnf::CONNECTOR_ACTIVITY_TIMEOUT)),
							],
						)
					);
					return Ok(JobResult {
						status: TerminalStatus::TerminatedByActivityTimeout,
						exit_code: job.exit_code()?,
						..Default::default()
					});
				}
				warn!(
					target: TARGET,
					"{}",
					log.build_with(
						"Indexing watchdog - activity timeout expired unexpectedly, waiting \
						 for last observed TTL before exiting",
						&[
							("last_observed", format!("{:.2}s", now.elapsed_secs(last_activity_observed))),
							("last_ttl", last_activity_ttl.to_string()),
						],
					)
				);
			} else {
				last_activity_observed = now;
				last_activity_ttl = ttl as u64;
			}

			// re-read the attempt; a finished status means the child is in
			// its own teardown, so keep polling rather than intervening
			match self.db().attempt(args.attempt_id).await {
				Ok(Some(attempt)) if attempt.status.is_terminal() => {
					debug!(
						target: TARGET,
						status = ?attempt.status,
						"{}",
						log.build("Indexing watchdog - attempt already finished externally"),
					);
				}
				Ok(_) => {}
				Err(error) => {
					warn!(
						target: TARGET,
						%error,
						"{}",
						log.build(
							"Indexing watchdog - transient exception looking up index attempt",
						),
					);
				}
			}
		}
	}

	/// Classifies a finished child process.
	async fn process_job_result(
		&self,
		job: &mut Job,
		fence: &IndexFence,
		log: &LogBuilder,
	) -> Result<JobResult, Error> {
		let mut result = JobResult {
			exit_code: job.exit_code()?,
			..Default::default()
		};
		if job.status()? != JobStatus::Error {
			result.status = TerminalStatus::Succeeded;
			return Ok(result);
		}
		// a non-zero exit code is ignored when the completion signal is OK;
		// containerized deployments can lose the real exit code
		if fence.get_completion().await? == Some(COMPLETION_OK) {
			result.status = TerminalStatus::Succeeded;
			warn!(
				target: TARGET,
				"{}",
				log.build_with(
					"Indexing watchdog - spawned task has non-zero exit code but completion \
					 signal is OK. Continuing...",
					&[("exit_code", format!("{:?}", result.exit_code))],
				)
			);
			return Ok(result);
		}
		if let Some(code) = result.exit_code {
			result.status = TerminalStatus::from_code(code);
		}
		result.exception = job
			.exception()
			.or_else(|| result.exit_code.map(|code| format!("spawned task exited with code {code}")));
		Ok(result)
	}

	/// Writes the final outcome to the attempt row and clears the watchdog
	/// signal. Transient catalog failures are logged and tolerated; nothing
	/// may raise past this point except the captured exception itself.
	async fn report_watchdog_result(
		&self,
		job: &mut Job,
		fence: &IndexFence,
		args: &DocFetchingArgs,
		result: JobResult,
		start: Timestamp,
		log: &LogBuilder,
	) -> Result<(), Error> {
		let elapsed = self.clock().now().elapsed_secs(start);

		if let Some(exception) = &result.exception {
			let failure_reason =
				format!("Spawned task exceptioned: exit_code={:?}", result.exit_code);
			if let Err(error) = self
				.db()
				.mark_attempt_failed(args.attempt_id, &failure_reason, Some(exception.as_str()))
				.await
			{
				warn!(
					target: TARGET,
					%error,
					"{}",
					log.build(
						"Indexing watchdog - transient exception marking index attempt as failed",
					),
				);
			}
			let normalized = normalize_exception(exception);
			warn!(
				target: TARGET,
				"{}",
				log.build_with(
					"Indexing watchdog - finished",
					&[
						("source", format!("{:?}", result.connector_source)),
						("status", result.status.as_str().to_string()),
						("exit_code", format!("{:?}", result.exit_code)),
						("exception", format!("\"{normalized}\"")),
						("elapsed", format!("{elapsed:.2}s")),
					],
				)
			);
			fence.set_watchdog(false).await?;
			return Err(Error::Internal(format!("Exception encountered: trace={normalized}")));
		}

		match result.status {
			TerminalStatus::TerminatedBySignal => {
				if let Err(error) = self
					.db()
					.mark_attempt_canceled(args.attempt_id, "Connector termination signal detected")
					.await
				{
					warn!(
						target: TARGET,
						%error,
						"{}",
						log.build(
							"Indexing watchdog - transient exception marking index attempt as canceled",
						),
					);
				}
				job.cancel().await?;
			}
			TerminalStatus::TerminatedByActivityTimeout => {
				let reason = format!(
					"Indexing watchdog - activity timeout exceeded: attempt={} timeout={}s",
					args.attempt_id,
					*cnf::CONNECTOR_ACTIVITY_TIMEOUT
				);
				if let Err(error) =
					self.db().mark_attempt_failed(args.attempt_id, &reason, None).await
				{
					warn!(
						target: TARGET,
						%error,
						"{}",
						log.build(
							"Indexing watchdog - transient exception marking index attempt as failed",
						),
					);
				}
				job.cancel().await?;
			}
			_ => {}
		}

		info!(
			target: TARGET,
			"{}",
			log.build_with(
				"Indexing watchdog - finished",
				&[
					("source", format!("{:?}", result.connector_source)),
					("status", result.status.as_str().to_string()),
					("exit_code", format!("{:?}", result.exit_code)),
					("elapsed", format!("{elapsed:.2}s")),
				],
			)
		);
		fence.set_watchdog(false).await?;
		Ok(())
	}
}
