//! Interfaces to the document fetching and embedding pipelines.
//!
//! The orchestrator never embeds or indexes documents itself; it drives
//! implementations of these traits. The stub implementations are used by the
//! test suite and the single-node demo wiring.

pub mod stub;

use crate::db::SearchSettings;
use crate::err::Error;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// A document produced by a connector
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct Document {
	pub id: String,
	pub content: String,
}

/// A per-document or batch-level failure surfaced by the pipeline
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct ConnectorFailure {
	/// The document that failed, when attributable
	pub document_id: Option<String>,
	pub message: String,
}

/// The outcome of pushing one batch through the indexing pipeline
#[derive(Clone, Debug, Default)]
pub struct PipelineResult {
	pub new_docs: u64,
	pub total_docs: u64,
	pub total_chunks: u64,
	pub failures: Vec<ConnectorFailure>,
}

/// Identifying metadata attached to one batch run
#[derive(Clone, Debug)]
pub struct BatchMetadata {
	pub attempt_id: i64,
	pub cc_pair_id: i64,
	pub connector_id: Option<i64>,
	pub credential_id: Option<i64>,
	/// A randomized id correlating the batch across log streams
	pub request_id: String,
	pub batch_num: u64,
}

/// Progress notifications from long-running pipeline work. Implementations
/// renew liveness leases so supervisors can tell activity from a hang.
#[async_trait]
pub trait ProgressCallback: Send + Sync {
	async fn progress(&self, tag: &str, amount: u64);
}

/// A source of document batches for one connector run
#[async_trait]
pub trait DocumentSource: Send {
	/// Produces the next batch, or `None` once the source is drained
	async fn next_batch(&mut self) -> Result<Option<Vec<Document>>, Error>;
}

/// Opens document sources for connector-credential pairs
#[async_trait]
pub trait SourceFactory: Send + Sync + 'static {
	/// Validates the pair's configuration and opens a source for it.
	/// Configuration problems surface as [`Error::ConnectorValidation`].
	async fn open(
		&self,
		cc_pair_id: i64,
		from_beginning: bool,
	) -> Result<Box<dyn DocumentSource>, Error>;
}

/// A fully built embedding-and-indexing pipeline for one settings generation
#[async_trait]
pub trait IndexingPipeline: Send + Sync {
	async fn index_batch(
		&self,
		documents: &[Document],
		metadata: &BatchMetadata,
	) -> Result<PipelineResult, Error>;
}

/// Builds pipelines and warms up embedding models
#[async_trait]
pub trait PipelineFactory: Send + Sync + 'static {
	/// Builds a pipeline parameterized by a settings generation. The callback
	/// receives progress from inside the pipeline.
	async fn build(
		&self,
		settings: &SearchSettings,
		callback: Arc<dyn ProgressCallback>,
	) -> Result<Arc<dyn IndexingPipeline>, Error>;

	/// Warms up the embedding model for a settings generation
	async fn warm_up(&self, settings: &SearchSettings) -> Result<(), Error>;
}
