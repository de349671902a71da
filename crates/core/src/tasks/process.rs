//! Per-batch document processing and attempt fan-in.
//!
//! Each stored batch is pushed through the indexing pipeline by exactly one
//! task: a per-batch lock suppresses duplicate deliveries, and all updates
//! to the shared indexing state go through the cross-batch state lock. The
//! task which observes the final increment also finalizes the attempt.

use super::Orchestrator;
use crate::batch::DocIndexingContext;
use crate::cnf;
use crate::err::Error;
use crate::fence::{IndexFence, COMPLETION_ERROR};
use crate::job::TerminalStatus;
use crate::kvs::Lock;
use crate::pipeline::{
	BatchMetadata, ConnectorFailure, Document, PipelineResult, ProgressCallback,
};
use crate::queue::DocProcessingArgs;
use async_trait::async_trait;
use nanoid::nanoid;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::instrument;

const TARGET: &str = "trawler::core::tasks::process";

/// How long shared-state lock acquisition may block per batch
const LOCK_WAIT: Duration = Duration::from_secs(60);

/// Renews the per-batch lease on progress notifications from the pipeline
struct BatchProgressCallback {
	fence: IndexFence,
	lock: Arc<Lock>,
}

#[async_trait]
impl ProgressCallback for BatchProgressCallback {
	async fn progress(&self, tag: &str, _amount: u64) {
		if let Err(error) = self.lock.reacquire().await {
			warn!(target: TARGET, %error, tag, "Batch lock reacquire failed in callback");
		}
		if let Err(error) = self.fence.set_active().await {
			warn!(target: TARGET, %error, tag, "Active signal renewal failed in callback");
		}
	}
}

impl Orchestrator {
	/// Processes one stored batch through the indexing pipeline.
	#[instrument(level = "debug", target = "trawler::core::tasks::process", skip(self))]
	pub async fn docprocessing(&self, args: &DocProcessingArgs) -> Result<(), Error> {
		let start = self.clock().now();
		info!(
			target: TARGET,
			"Processing document batch: batch_id={} attempt={} batch_num={}",
			args.batch_id,
			args.attempt_id,
			args.batch_num,
		);

		// a missing batch means it was already processed and cleaned
		let documents = match self.batches().get_batch(args.attempt_id, &args.batch_id).await? {
			Some(documents) => documents,
			None => {
				error!(
					target: TARGET,
					"No documents found for batch: batch_id={}",
					args.batch_id,
				);
				return Ok(());
			}
		};

		let attempt = self
			.db()
			.attempt(args.attempt_id)
			.await?
			.ok_or(Error::AttemptNotFound(args.attempt_id))?;
		let settings = self
			.db()
			.search_settings(attempt.search_settings_id)
			.await?
			.ok_or(Error::SearchSettingsNotFound(attempt.search_settings_id))?;
		let fence = self.index_fence(args.cc_pair_id, attempt.search_settings_id);

		// duplicate deliveries of the same batch must not double-count
		let per_batch_lock = Arc::new(self.lock(
			fence.lock_key_by_batch(args.batch_num),
			Duration::from_secs(*cnf::INDEXING_LOCK_TTL),
		));
		if !per_batch_lock.acquire().await? {
			let msg = format!(
				"Indexing batch task already running, exiting...: index_attempt={} cc_pair={} \
				 search_settings={} batch_num={}",
				args.attempt_id, args.cc_pair_id, attempt.search_settings_id, args.batch_num
			);
			warn!(target: TARGET, "{msg}");
			return Err(Error::terminal(TerminalStatus::TaskAlreadyRunning, msg));
		}

		let result = self
			.process_batch(args, &settings, &fence, &per_batch_lock, documents)
			.await;
		if per_batch_lock.owned().await.unwrap_or(false) {
			if let Err(error) = per_batch_lock.release().await {
				warn!(target: TARGET, %error, "Batch lock release failed");
			}
		}
		match result {
			Ok(processed) => {
				let elapsed = self.clock().now().elapsed_secs(start);
				info!(
					target: TARGET,
					"Completed document batch processing: batch_id={} docs={} chunks={} \
					 failures={} elapsed={:.2}s",
					args.batch_id,
					processed.total_docs,
					processed.total_chunks,
					processed.failures.len(),
					elapsed,
				);
				Ok(())
			}
			Err(error) => {
				error!(
					target: TARGET,
					%error,
					"Document batch processing failed: batch_id={} attempt={}",
					args.batch_id,
					args.attempt_id,
				);
				// signal completion with an error to unblock the watchdog
				// and the monitor; a no-op when the fetcher already signaled
				if let Err(error) = fence.set_completion(COMPLETION_ERROR).await {
					warn!(target: TARGET, %error, "Completion error signal failed");
				}
				Err(error)
			}
		}
	}

	async fn process_batch(
		&self,
		args: &DocProcessingArgs,
		settings: &crate::db::SearchSettings,
		fence: &IndexFence,
		per_batch_lock: &Arc<Lock>,
		documents: Vec<Document>,
	) -> Result<PipelineResult, Error> {
		let state_lock = self.lock(
			fence.filestore_lock_key(),
			Duration::from_secs(*cnf::INDEXING_LOCK_TTL),
		);
		let db_lock =
			self.lock(fence.db_lock_key(), Duration::from_secs(*cnf::INDEXING_LOCK_TTL));

		// make sure the shared indexing state exists before any increments
		self.with_lock(&state_lock, || async {
			self.batches().ensure_indexing_state(args.attempt_id).await.map(|_| ())
		})
		.await?;

		// build the pipeline parameterized by the attempt's settings; the
		// callback keeps the per-batch lease alive through long model calls
		let callback = Arc::new(BatchProgressCallback {
			fence: fence.clone(),
			lock: per_batch_lock.clone(),
		});
		let pipeline = self.pipelines().build(settings, callback.clone()).await?;
		let cc_pair = self.db().cc_pair(args.cc_pair_id).await?;
		let metadata = BatchMetadata {
			attempt_id: args.attempt_id,
			cc_pair_id: args.cc_pair_id,
			connector_id: cc_pair.as_ref().and_then(|c| c.connector_id),
			credential_id: cc_pair.as_ref().and_then(|c| c.credential_id),
			request_id: format!("DIP-{}", nanoid!(12)),
			batch_num: args.batch_num,
		};

		info!(
			target: TARGET,
			docs = documents.len(),
			batch_num = args.batch_num,
			"Processing documents through indexing pipeline",
		);

		per_batch_lock.reacquire().await?;
		// real work happens here!
		let result = pipeline.index_batch(&documents, &metadata).await?;
		per_batch_lock.reacquire().await?;

		// fold the batch outcome into the shared indexing state
		let state = self
			.with_lock(&state_lock, || async {
				let mut state = self.batches().ensure_indexing_state(args.attempt_id).await?;
				state.batches_done += 1;
				state.unfinished_batches = state.unfinished_batches.saturating_sub(1);
				state.total_failures += result.failures.len() as u64;
				state.net_doc_change += result.new_docs;
				state.total_chunks += result.total_chunks;
				self.batches().store_indexing_state(args.attempt_id, &state).await?;
				Ok(state)
			})
			.await?;

		// resolve previously recorded errors for documents this batch
		// indexed successfully, then record the new failures
		self.with_lock(&db_lock, || async {
			self.reconcile_errors(args, &documents, &result.failures).await
		})
		.await?;

		// more than 3 failures and a ratio above 10% aborts the attempt
		self.check_failure_threshold(&state, args.batch_num, result.failures.last())?;

		// roll the batch into the attempt's cumulative counters
		self.with_lock(&db_lock, || async {
			self.db().update_docs_indexed(args.attempt_id, result.total_docs, result.new_docs).await
		})
		.await?;

		callback.progress("docprocessing", documents.len() as u64).await;

		// completion check: the decision must observe this task's own
		// increment, so it runs under the same lock the increment used
		let finalize = self
			.with_lock(&state_lock, || async {
				let extraction = self.batches().extraction_context(args.attempt_id).await?;
				let state = self.batches().ensure_indexing_state(args.attempt_id).await?;
				Ok(match extraction.and_then(|c| c.doc_extraction_complete_batch_num) {
					Some(total) if state.batches_done >= total => Some(state),
					_ => None,
				})
			})
			.await?;
		if let Some(state) = finalize {
			self.finalize_attempt(args, fence, &state).await?;
		}

		// clean up this batch after successful processing
		self.batches().delete_batch(args.attempt_id, &args.batch_id).await?;
		Ok(result)
	}

	/// Runs a closure while holding a lease-bound lock.
	async fn with_lock<T, F, Fut>(&self, lock: &Lock, f: F) -> Result<T, Error>
	where
		F: FnOnce() -> Fut,
		Fut: std::future::Future<Output = Result<T, Error>>,
	{
		if !lock.acquire_timeout(LOCK_WAIT).await? {
			return Err(Error::Internal(format!(
				"could not acquire cross-batch lock: key={}",
				lock.key()
			)));
		}
		let result = f().await;
		lock.release().await?;
		result
	}

	/// Resolves stale per-document errors and records this batch's failures.
	async fn reconcile_errors(
		&self,
		args: &DocProcessingArgs,
		documents: &[Document],
		failures: &[ConnectorFailure],
	) -> Result<(), Error> {
		let unresolved = self.db().unresolved_errors(args.cc_pair_id).await?;
		let mut by_document: HashMap<&str, Vec<i64>> = HashMap::new();
		for error in &unresolved {
			if let Some(document_id) = &error.document_id {
				by_document.entry(document_id.as_str()).or_default().push(error.id);
			}
		}
		let failed: Vec<&str> = failures
			.iter()
			.filter_map(|f| f.document_id.as_deref())
			.collect();
		for document in documents {
			if failed.contains(&document.id.as_str()) {
				continue;
			}
			if let Some(error_ids) = by_document.get(document.id.as_str()) {
				info!(
					target: TARGET,
					document = %document.id,
					"Resolving recorded indexing errors for document",
				);
				for error_id in error_ids {
					self.db().resolve_error(*error_id).await?;
				}
			}
		}
		for failure in failures {
			self.db().create_attempt_error(args.attempt_id, args.cc_pair_id, failure).await?;
		}
		Ok(())
	}

	/// Aborts the attempt when failures pass both the count and the ratio
	/// threshold, surfacing the most recent failure.
	fn check_failure_threshold(
		&self,
		state: &DocIndexingContext,
		batch_num: u64,
		last_failure: Option<&ConnectorFailure>,
	) -> Result<(), Error> {
		let failure_ratio = state.total_failures as f64 / std::cmp::max(state.net_doc_change, 1) as f64;
		if state.total_failures > *cnf::FAILURE_COUNT_THRESHOLD
			&& failure_ratio > *cnf::FAILURE_RATIO_THRESHOLD
		{
			error!(
				target: TARGET,
				"Connector run failed with '{}' errors after '{}' batches",
				state.total_failures,
				batch_num,
			);
			return Err(Error::TooManyFailures {
				failures: state.total_failures,
				last_failure: last_failure
					.map(|f| f.message.clone())
					.unwrap_or_else(|| "None".to_string()),
			});
		}
		Ok(())
	}

	/// All batches have settled: record the terminal status, clear the
	/// trigger, clean storage, and tear the fence down.
	async fn finalize_attempt(
		&self,
		args: &DocProcessingArgs,
		fence: &IndexFence,
		state: &DocIndexingContext,
	) -> Result<(), Error> {
		let partial = state.total_failures > 0;
		info!(
			target: TARGET,
			"Finalizing index attempt: attempt={} batches_done={} failures={} partial={}",
			args.attempt_id,
			state.batches_done,
			state.total_failures,
			partial,
		);
		self.db().mark_attempt_succeeded(args.attempt_id, partial).await?;
		self.db().set_indexing_trigger(args.cc_pair_id, None).await?;
		self.batches().delete_all(args.attempt_id).await?;
		fence.reset().await?;
		// the first success promotes a pair out of its initial states, and
		// any success clears the repeated-error gate
		if let Some(cc_pair) = self.db().cc_pair(args.cc_pair_id).await? {
			if matches!(
				cc_pair.status,
				crate::db::CcPairStatus::Scheduled | crate::db::CcPairStatus::InitialIndexing
			) {
				self.db()
					.set_cc_pair_status(args.cc_pair_id, crate::db::CcPairStatus::Active)
					.await?;
			}
			if cc_pair.in_repeated_error_state {
				self.db().set_cc_pair_repeated_error_state(args.cc_pair_id, false).await?;
			}
		}
		Ok(())
	}
}
