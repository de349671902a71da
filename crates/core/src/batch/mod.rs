//! Document batch storage shared between the fetcher and the processors.
//!
//! The fetcher streams batches in; processors pull their batch out, and all
//! of them cooperate on two small state records: the extraction context
//! (written once by the fetcher when it finishes) and the indexing context
//! (incremented by every processor under the cross-batch state lock).

#[cfg(feature = "kv-mem")]
pub mod mem;

use crate::err::Error;
use crate::pipeline::Document;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// State written by the fetch side of an attempt
#[derive(Clone, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
pub struct DocExtractionContext {
	/// The source system documents were fetched from
	pub source: String,
	/// Set once extraction has finished, to the total number of batches
	pub doc_extraction_complete_batch_num: Option<u64>,
}

/// Cumulative state shared by all processors of an attempt
#[derive(Clone, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
pub struct DocIndexingContext {
	pub batches_done: u64,
	pub unfinished_batches: u64,
	pub total_failures: u64,
	pub net_doc_change: u64,
	pub total_chunks: u64,
}

/// Storage for document batches and the per-attempt shared state.
#[async_trait]
pub trait BatchStorage: Send + Sync + 'static {
	/// Stores one batch of documents for an attempt
	async fn store_batch(
		&self,
		attempt_id: i64,
		batch_id: &str,
		documents: Vec<Document>,
	) -> Result<(), Error>;
	/// Fetches one batch, if it is still stored
	async fn get_batch(&self, attempt_id: i64, batch_id: &str)
		-> Result<Option<Vec<Document>>, Error>;
	/// Removes one batch after successful processing
	async fn delete_batch(&self, attempt_id: i64, batch_id: &str) -> Result<(), Error>;
	/// Removes every batch and state record of an attempt
	async fn delete_all(&self, attempt_id: i64) -> Result<(), Error>;

	/// Returns the indexing context, initializing it if absent
	async fn ensure_indexing_state(&self, attempt_id: i64) -> Result<DocIndexingContext, Error>;
	/// Overwrites the indexing context
	async fn store_indexing_state(
		&self,
		attempt_id: i64,
		state: &DocIndexingContext,
	) -> Result<(), Error>;

	/// Returns the extraction context, if the fetcher has written one
	async fn extraction_context(
		&self,
		attempt_id: i64,
	) -> Result<Option<DocExtractionContext>, Error>;
	/// Overwrites the extraction context
	async fn store_extraction_context(
		&self,
		attempt_id: i64,
		context: &DocExtractionContext,
	) -> Result<(), Error>;
}
