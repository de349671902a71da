//! The durable record surface.
//!
//! The orchestrator treats its database as an external collaborator: this
//! module defines the row types it reads and writes and the [`Catalog`]
//! trait it goes through. An in-memory catalog backs the test suite and
//! single-node deployments.

#[cfg(feature = "kv-mem")]
pub mod mem;

use crate::err::Error;
use crate::kvs::Timestamp;
use crate::pipeline::ConnectorFailure;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// The operational state of a connector-credential pair
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub enum CcPairStatus {
	/// Newly created, never fenced
	Scheduled,
	/// First attempt fenced, no success yet
	InitialIndexing,
	/// At least one successful attempt
	Active,
	/// Indexing suspended by an operator
	Paused,
	/// Deletion in progress; may never start an attempt
	Deleting,
}

/// A manual indexing request recorded on a cc-pair
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub enum IndexingTrigger {
	/// Index new and changed documents
	Update,
	/// Re-index everything from the beginning
	Reindex,
}

/// A connector-credential binding plus its operational state
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CcPair {
	pub id: i64,
	pub name: String,
	/// The source system this connector reads from
	pub source: String,
	pub connector_id: Option<i64>,
	pub credential_id: Option<i64>,
	pub status: CcPairStatus,
	pub indexing_trigger: Option<IndexingTrigger>,
	pub in_repeated_error_state: bool,
	/// How often the pair should be re-indexed; `None` means manual only
	pub refresh_freq: Option<Duration>,
}

/// The lifecycle state of an index attempt
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub enum AttemptStatus {
	NotStarted,
	InProgress,
	Success,
	PartialSuccess,
	Failed,
	Canceled,
}

impl AttemptStatus {
	/// Whether the attempt has reached a terminal state
	pub fn is_terminal(&self) -> bool {
		matches!(
			self,
			AttemptStatus::Success
				| AttemptStatus::PartialSuccess
				| AttemptStatus::Failed
				| AttemptStatus::Canceled
		)
	}

	/// Whether the attempt finished with documents indexed
	pub fn is_successful(&self) -> bool {
		matches!(self, AttemptStatus::Success | AttemptStatus::PartialSuccess)
	}
}

/// A single indexing run for a `(cc_pair, search_settings)` composite
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct IndexAttempt {
	pub id: i64,
	pub cc_pair_id: i64,
	pub search_settings_id: i64,
	pub status: AttemptStatus,
	pub failure_reason: Option<String>,
	pub full_exception_trace: Option<String>,
	pub total_docs_indexed: u64,
	pub new_docs_indexed: u64,
	/// Whether this run re-indexes from the beginning
	pub from_beginning: bool,
	pub time_created: Timestamp,
	pub time_updated: Timestamp,
	/// Whether the attempt's extraction checkpoint has been swept
	pub checkpoint_cleaned: bool,
}

/// The lifecycle state of a search settings generation
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub enum SearchSettingsStatus {
	/// The settings all current indexing runs against
	Present,
	/// A new generation being built in the background
	Future,
	/// A retired generation
	Past,
}

impl SearchSettingsStatus {
	pub fn is_current(&self) -> bool {
		matches!(self, SearchSettingsStatus::Present)
	}
}

/// One generation of embedding and index configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SearchSettings {
	pub id: i64,
	pub status: SearchSettingsStatus,
	pub model_name: String,
	/// The hosted embedding provider, if any; `None` means self-hosted
	pub provider_type: Option<String>,
	/// Whether a non-current generation may be indexed in the background
	pub background_reindex_enabled: bool,
}

/// A per-document indexing failure recorded for later resolution
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AttemptError {
	pub id: i64,
	pub attempt_id: i64,
	pub cc_pair_id: i64,
	pub document_id: Option<String>,
	pub failure_message: String,
	pub is_resolved: bool,
}

/// The database operations the orchestrator requires.
#[async_trait]
pub trait Catalog: Send + Sync + 'static {
	/// Fetches all connector-credential pairs
	async fn cc_pairs(&self) -> Result<Vec<CcPair>, Error>;
	/// Fetches one connector-credential pair
	async fn cc_pair(&self, id: i64) -> Result<Option<CcPair>, Error>;
	/// Updates the status of a cc-pair
	async fn set_cc_pair_status(&self, id: i64, status: CcPairStatus) -> Result<(), Error>;
	/// Updates the repeated-error flag of a cc-pair
	async fn set_cc_pair_repeated_error_state(&self, id: i64, value: bool) -> Result<(), Error>;
	/// Atomically reads and clears the indexing trigger of a cc-pair
	async fn take_indexing_trigger(&self, id: i64) -> Result<Option<IndexingTrigger>, Error>;
	/// Sets the indexing trigger of a cc-pair
	async fn set_indexing_trigger(
		&self,
		id: i64,
		trigger: Option<IndexingTrigger>,
	) -> Result<(), Error>;

	/// Fetches one search settings generation
	async fn search_settings(&self, id: i64) -> Result<Option<SearchSettings>, Error>;
	/// Fetches the active search settings generations, current first
	async fn active_search_settings(&self) -> Result<Vec<SearchSettings>, Error>;
	/// Fetches the current search settings generation
	async fn current_search_settings(&self) -> Result<SearchSettings, Error>;
	/// Promotes a fully built future generation to current, returning the
	/// retired generation when a swap actually happened
	async fn check_and_perform_index_swap(&self) -> Result<Option<SearchSettings>, Error>;

	/// Inserts a new attempt row in the `NotStarted` state
	async fn create_attempt(
		&self,
		cc_pair_id: i64,
		search_settings_id: i64,
		from_beginning: bool,
	) -> Result<IndexAttempt, Error>;
	/// Fetches one attempt row
	async fn attempt(&self, id: i64) -> Result<Option<IndexAttempt>, Error>;
	/// Deletes an attempt row (undo path for failed fence creation)
	async fn delete_attempt(&self, id: i64) -> Result<(), Error>;
	/// Transitions an attempt to `InProgress`
	async fn mark_attempt_started(&self, id: i64) -> Result<(), Error>;
	/// Transitions an attempt to `Failed`, unless already terminal
	async fn mark_attempt_failed(
		&self,
		id: i64,
		failure_reason: &str,
		full_exception_trace: Option<&str>,
	) -> Result<(), Error>;
	/// Transitions an attempt to `Canceled`, unless already terminal
	async fn mark_attempt_canceled(&self, id: i64, reason: &str) -> Result<(), Error>;
	/// Transitions an attempt to `Success` or `PartialSuccess`
	async fn mark_attempt_succeeded(&self, id: i64, partial: bool) -> Result<(), Error>;
	/// Adds to the attempt's cumulative document counters
	async fn update_docs_indexed(
		&self,
		id: i64,
		total_docs_indexed: u64,
		new_docs_indexed: u64,
	) -> Result<(), Error>;
	/// Fetches all attempts in a non-terminal state
	async fn nonterminal_attempts(&self) -> Result<Vec<IndexAttempt>, Error>;
	/// Fetches the most recent successful attempt for a composite, if any
	async fn last_successful_attempt(
		&self,
		cc_pair_id: i64,
		search_settings_id: i64,
	) -> Result<Option<IndexAttempt>, Error>;
	/// Fetches the most recent attempts for a composite, newest first
	async fn recent_attempts(
		&self,
		cc_pair_id: i64,
		search_settings_id: i64,
		limit: usize,
	) -> Result<Vec<IndexAttempt>, Error>;
	/// Fetches terminal attempts whose checkpoints are older than the cutoff
	async fn attempts_with_old_checkpoints(
		&self,
		cutoff: Timestamp,
	) -> Result<Vec<IndexAttempt>, Error>;
	/// Removes the extraction checkpoint of an attempt
	async fn cleanup_checkpoint(&self, attempt_id: i64) -> Result<(), Error>;

	/// Records a per-document failure for an attempt
	async fn create_attempt_error(
		&self,
		attempt_id: i64,
		cc_pair_id: i64,
		failure: &ConnectorFailure,
	) -> Result<(), Error>;
	/// Fetches unresolved per-document failures for a cc-pair
	async fn unresolved_errors(&self, cc_pair_id: i64) -> Result<Vec<AttemptError>, Error>;
	/// Marks a recorded failure as resolved
	async fn resolve_error(&self, error_id: i64) -> Result<(), Error>;
}
