#![cfg(feature = "kv-mem")]

use super::*;
use dashmap::DashMap;

/// In-process batch storage used for tests and single-node deployments.
#[derive(Default)]
pub struct Datastore {
	batches: DashMap<(i64, String), Vec<Document>>,
	indexing: DashMap<i64, DocIndexingContext>,
	extraction: DashMap<i64, DocExtractionContext>,
}

impl Datastore {
	pub fn new() -> Self {
		Self::default()
	}

	/// The number of batches currently stored for an attempt
	pub fn batch_count(&self, attempt_id: i64) -> usize {
		self.batches.iter().filter(|e| e.key().0 == attempt_id).count()
	}
}

#[async_trait]
impl BatchStorage for Datastore {
	async fn store_batch(
		&self,
		attempt_id: i64,
		batch_id: &str,
		documents: Vec<Document>,
	) -> Result<(), Error> {
		self.batches.insert((attempt_id, batch_id.to_string()), documents);
		Ok(())
	}

	async fn get_batch(
		&self,
		attempt_id: i64,
		batch_id: &str,
	) -> Result<Option<Vec<Document>>, Error> {
		Ok(self.batches.get(&(attempt_id, batch_id.to_string())).map(|d| d.clone()))
	}

	async fn delete_batch(&self, attempt_id: i64, batch_id: &str) -> Result<(), Error> {
		self.batches.remove(&(attempt_id, batch_id.to_string()));
		Ok(())
	}

	async fn delete_all(&self, attempt_id: i64) -> Result<(), Error> {
		self.batches.retain(|k, _| k.0 != attempt_id);
		self.indexing.remove(&attempt_id);
		self.extraction.remove(&attempt_id);
		Ok(())
	}

	async fn ensure_indexing_state(&self, attempt_id: i64) -> Result<DocIndexingContext, Error> {
		Ok(self.indexing.entry(attempt_id).or_default().clone())
	}

	async fn store_indexing_state(
		&self,
		attempt_id: i64,
		state: &DocIndexingContext,
	) -> Result<(), Error> {
		self.indexing.insert(attempt_id, state.clone());
		Ok(())
	}

	async fn extraction_context(
		&self,
		attempt_id: i64,
	) -> Result<Option<DocExtractionContext>, Error> {
		Ok(self.extraction.get(&attempt_id).map(|c| c.clone()))
	}

	async fn store_extraction_context(
		&self,
		attempt_id: i64,
		context: &DocExtractionContext,
	) -> Result<(), Error> {
		self.extraction.insert(attempt_id, context.clone());
		Ok(())
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[tokio::test]
	async fn batches_and_state_are_scoped_per_attempt() {
		let storage = Datastore::new();
		let doc = Document {
			id: "d1".to_string(),
			content: "hello".to_string(),
		};
		storage.store_batch(100, "b1", vec![doc.clone()]).await.unwrap();
		storage.store_batch(101, "b1", vec![doc]).await.unwrap();
		assert_eq!(storage.batch_count(100), 1);
		let mut state = storage.ensure_indexing_state(100).await.unwrap();
		state.batches_done += 1;
		storage.store_indexing_state(100, &state).await.unwrap();
		storage.delete_all(100).await.unwrap();
		assert_eq!(storage.batch_count(100), 0);
		assert_eq!(storage.batch_count(101), 1);
		// state re-initializes after cleanup
		assert_eq!(storage.ensure_indexing_state(100).await.unwrap(), DocIndexingContext::default());
	}
}
