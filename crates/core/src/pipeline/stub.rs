//! Stub sources and pipelines for tests and single-node demos.

use super::*;
use dashmap::DashMap;
use std::collections::VecDeque;
use tokio::sync::Mutex;

/// A source that serves a preloaded set of batches
pub struct StaticSource {
	batches: VecDeque<Vec<Document>>,
}

#[async_trait]
impl DocumentSource for StaticSource {
	async fn next_batch(&mut self) -> Result<Option<Vec<Document>>, Error> {
		Ok(self.batches.pop_front())
	}
}

/// A factory serving preloaded batches per cc-pair.
/// Pairs with no seeded batches fail validation, which exercises the
/// connector validation exit path.
#[derive(Default)]
pub struct StaticSourceFactory {
	batches: DashMap<i64, Vec<Vec<Document>>>,
}

impl StaticSourceFactory {
	pub fn new() -> Self {
		Self::default()
	}

	/// Seeds the batches served for a cc-pair
	pub fn seed(&self, cc_pair_id: i64, batches: Vec<Vec<Document>>) {
		self.batches.insert(cc_pair_id, batches);
	}
}

#[async_trait]
impl SourceFactory for StaticSourceFactory {
	async fn open(
		&self,
		cc_pair_id: i64,
		_from_beginning: bool,
	) -> Result<Box<dyn DocumentSource>, Error> {
		match self.batches.get(&cc_pair_id) {
			Some(batches) => Ok(Box::new(StaticSource {
				batches: batches.clone().into(),
			})),
			None => Err(Error::ConnectorValidation(format!(
				"no source configured for cc_pair {cc_pair_id}"
			))),
		}
	}
}

/// A pipeline that indexes every document and reports one chunk per document.
/// Specific document ids can be seeded to fail, which exercises the failure
/// threshold and error resolution paths.
#[derive(Default)]
pub struct CountingPipeline {
	failing_docs: DashMap<String, String>,
	seen_docs: Mutex<Vec<String>>,
}

impl CountingPipeline {
	/// Seeds a document id that the pipeline will report as failed
	pub fn fail_document(&self, document_id: &str, message: &str) {
		self.failing_docs.insert(document_id.to_string(), message.to_string());
	}

	/// The ids of every document pushed through the pipeline so far
	pub async fn seen(&self) -> Vec<String> {
		self.seen_docs.lock().await.clone()
	}
}

#[async_trait]
impl IndexingPipeline for CountingPipeline {
	async fn index_batch(
		&self,
		documents: &[Document],
		_metadata: &BatchMetadata,
	) -> Result<PipelineResult, Error> {
		let mut result = PipelineResult::default();
		let mut seen = self.seen_docs.lock().await;
		for doc in documents {
			result.total_docs += 1;
			match self.failing_docs.get(&doc.id) {
				Some(message) => result.failures.push(ConnectorFailure {
					document_id: Some(doc.id.clone()),
					message: message.clone(),
				}),
				None => {
					if !seen.contains(&doc.id) {
						result.new_docs += 1;
					}
					result.total_chunks += 1;
					seen.push(doc.id.clone());
				}
			}
		}
		Ok(result)
	}
}

/// A factory handing out one shared [`CountingPipeline`]
pub struct CountingPipelineFactory {
	pipeline: Arc<CountingPipeline>,
	warmed: Mutex<Vec<i64>>,
}

impl Default for CountingPipelineFactory {
	fn default() -> Self {
		Self::new()
	}
}

impl CountingPipelineFactory {
	pub fn new() -> Self {
		Self {
			pipeline: Arc::new(CountingPipeline::default()),
			warmed: Mutex::new(Vec::new()),
		}
	}

	/// The shared pipeline, for seeding failures and inspecting results
	pub fn pipeline(&self) -> Arc<CountingPipeline> {
		self.pipeline.clone()
	}

	/// The settings generations which have been warmed up
	pub async fn warmed(&self) -> Vec<i64> {
		self.warmed.lock().await.clone()
	}
}

#[async_trait]
impl PipelineFactory for CountingPipelineFactory {
	async fn build(
		&self,
		_settings: &SearchSettings,
		callback: Arc<dyn ProgressCallback>,
	) -> Result<Arc<dyn IndexingPipeline>, Error> {
		// the callback is exercised once at build time so lease renewal
		// starts before the first batch lands
		callback.progress("build", 0).await;
		Ok(self.pipeline.clone())
	}

	async fn warm_up(&self, settings: &SearchSettings) -> Result<(), Error> {
		self.warmed.lock().await.push(settings.id);
		Ok(())
	}
}
