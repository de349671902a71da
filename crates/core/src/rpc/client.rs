use super::msg::{Request, Response};
use crate::batch::{BatchStorage, DocExtractionContext, DocIndexingContext};
use crate::db::{
	AttemptError, Catalog, CcPair, CcPairStatus, IndexAttempt, IndexingTrigger, SearchSettings,
};
use crate::err::Error;
use crate::kvs::{KeyTtl, Store, Timestamp};
use crate::pipeline::{ConnectorFailure, Document};
use crate::queue::{TaskMessage, TaskQueue, TaskState};
use async_trait::async_trait;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::Mutex;

const TARGET: &str = "trawler::core::rpc";

/// A connection to a worker's coordination endpoint.
///
/// The client implements the store, catalog, queue and batch-storage traits
/// by forwarding every operation, so a spawned fetch process observes
/// exactly the state its parent worker does. Calls are serialized over one
/// connection; the fetch entrypoint is sequential anyway.
pub struct Client {
	conn: Mutex<Conn>,
}

struct Conn {
	reader: BufReader<OwnedReadHalf>,
	writer: OwnedWriteHalf,
}

impl Client {
	/// Connects to the endpoint a worker published
	pub async fn connect(addr: &str) -> Result<Self, Error> {
		let stream = TcpStream::connect(addr)
			.await
			.map_err(|error| Error::Remote(format!("could not connect to '{addr}': {error}")))?;
		debug!(target: TARGET, %addr, "Connected to the coordination endpoint");
		let (read, writer) = stream.into_split();
		Ok(Self {
			conn: Mutex::new(Conn {
				reader: BufReader::new(read),
				writer,
			}),
		})
	}

	async fn call(&self, request: Request) -> Result<Response, Error> {
		let mut conn = self.conn.lock().await;
		let mut out = serde_json::to_vec(&request)?;
		out.push(b'\n');
		conn.writer.write_all(&out).await?;
		let mut line = String::new();
		if conn.reader.read_line(&mut line).await? == 0 {
			return Err(Error::Remote("the endpoint closed the connection".to_string()));
		}
		match serde_json::from_str::<Response>(&line)? {
			Response::Failure(message) => Err(Error::Remote(message)),
			response => Ok(response),
		}
	}

	async fn expect_unit(&self, request: Request) -> Result<(), Error> {
		match self.call(request).await? {
			Response::Unit => Ok(()),
			other => Err(unexpected(other)),
		}
	}

	async fn expect_bool(&self, request: Request) -> Result<bool, Error> {
		match self.call(request).await? {
			Response::Bool(value) => Ok(value),
			other => Err(unexpected(other)),
		}
	}

	async fn expect_keys(&self, request: Request) -> Result<Vec<String>, Error> {
		match self.call(request).await? {
			Response::Keys(keys) => Ok(keys),
			other => Err(unexpected(other)),
		}
	}

	async fn expect_attempt(&self, request: Request) -> Result<Option<IndexAttempt>, Error> {
		match self.call(request).await? {
			Response::Attempt(attempt) => Ok(attempt),
			other => Err(unexpected(other)),
		}
	}

	async fn expect_attempts(&self, request: Request) -> Result<Vec<IndexAttempt>, Error> {
		match self.call(request).await? {
			Response::Attempts(attempts) => Ok(attempts),
			other => Err(unexpected(other)),
		}
	}

	async fn expect_settings(&self, request: Request) -> Result<Option<SearchSettings>, Error> {
		match self.call(request).await? {
			Response::Settings(settings) => Ok(settings),
			other => Err(unexpected(other)),
		}
	}
}

fn unexpected(response: Response) -> Error {
	Error::Remote(format!("unexpected response from the endpoint: {response:?}"))
}

#[async_trait]
impl Store for Client {
	async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, Error> {
		match self
			.call(Request::KvGet {
				key: key.to_string(),
			})
			.await?
		{
			Response::Bytes(value) => Ok(value),
			other => Err(unexpected(other)),
		}
	}

	async fn put(&self, key: &str, val: Vec<u8>, ttl: Option<Duration>) -> Result<(), Error> {
		self.expect_unit(Request::KvPut {
			key: key.to_string(),
			val,
			ttl,
		})
		.await
	}

	async fn put_nx(&self, key: &str, val: Vec<u8>, ttl: Option<Duration>) -> Result<bool, Error> {
		self.expect_bool(Request::KvPutNx {
			key: key.to_string(),
			val,
			ttl,
		})
		.await
	}

	async fn del(&self, key: &str) -> Result<(), Error> {
		self.expect_unit(Request::KvDel {
			key: key.to_string(),
		})
		.await
	}

	async fn del_cas(&self, key: &str, expected: &[u8]) -> Result<bool, Error> {
		self.expect_bool(Request::KvDelCas {
			key: key.to_string(),
			expected: expected.to_vec(),
		})
		.await
	}

	async fn expire_cas(&self, key: &str, expected: &[u8], ttl: Duration) -> Result<bool, Error> {
		self.expect_bool(Request::KvExpireCas {
			key: key.to_string(),
			expected: expected.to_vec(),
			ttl,
		})
		.await
	}

	async fn exists(&self, key: &str) -> Result<bool, Error> {
		self.expect_bool(Request::KvExists {
			key: key.to_string(),
		})
		.await
	}

	async fn ttl(&self, key: &str) -> Result<KeyTtl, Error> {
		match self
			.call(Request::KvTtl {
				key: key.to_string(),
			})
			.await?
		{
			Response::Ttl(ttl) => Ok(ttl),
			other => Err(unexpected(other)),
		}
	}

	async fn incr(&self, key: &str, by: i64) -> Result<i64, Error> {
		match self
			.call(Request::KvIncr {
				key: key.to_string(),
				by,
			})
			.await?
		{
			Response::Int(value) => Ok(value),
			other => Err(unexpected(other)),
		}
	}

	async fn sadd(&self, set: &str, member: &str) -> Result<(), Error> {
		self.expect_unit(Request::KvSadd {
			set: set.to_string(),
			member: member.to_string(),
		})
		.await
	}

	async fn srem(&self, set: &str, member: &str) -> Result<(), Error> {
		self.expect_unit(Request::KvSrem {
			set: set.to_string(),
			member: member.to_string(),
		})
		.await
	}

	async fn smembers(&self, set: &str) -> Result<Vec<String>, Error> {
		self.expect_keys(Request::KvSmembers {
			set: set.to_string(),
		})
		.await
	}

	async fn sismember(&self, set: &str, member: &str) -> Result<bool, Error> {
		self.expect_bool(Request::KvSismember {
			set: set.to_string(),
			member: member.to_string(),
		})
		.await
	}

	async fn scan(&self, prefix: &str) -> Result<Vec<String>, Error> {
		self.expect_keys(Request::KvScan {
			prefix: prefix.to_string(),
		})
		.await
	}
}

#[async_trait]
impl Catalog for Client {
	async fn cc_pairs(&self) -> Result<Vec<CcPair>, Error> {
		match self.call(Request::CcPairs).await? {
			Response::CcPairs(pairs) => Ok(pairs),
			other => Err(unexpected(other)),
		}
	}

	async fn cc_pair(&self, id: i64) -> Result<Option<CcPair>, Error> {
		match self
			.call(Request::CcPair {
				id,
			})
			.await?
		{
			Response::CcPair(pair) => Ok(pair),
			other => Err(unexpected(other)),
		}
	}

	async fn set_cc_pair_status(&self, id: i64, status: CcPairStatus) -> Result<(), Error> {
		self.expect_unit(Request::SetCcPairStatus {
			id,
			status,
		})
		.await
	}

	async fn set_cc_pair_repeated_error_state(&self, id: i64, value: bool) -> Result<(), Error> {
		self.expect_unit(Request::SetCcPairRepeatedErrorState {
			id,
			value,
		})
		.await
	}

	async fn take_indexing_trigger(&self, id: i64) -> Result<Option<IndexingTrigger>, Error> {
		match self
			.call(Request::TakeIndexingTrigger {
				id,
			})
			.await?
		{
			Response::Trigger(trigger) => Ok(trigger),
			other => Err(unexpected(other)),
		}
	}

	async fn set_indexing_trigger(
		&self,
		id: i64,
		trigger: Option<IndexingTrigger>,
	) -> Result<(), Error> {
		self.expect_unit(Request::SetIndexingTrigger {
			id,
			trigger,
		})
		.await
	}

	async fn search_settings(&self, id: i64) -> Result<Option<SearchSettings>, Error> {
		self.expect_settings(Request::SearchSettings {
			id,
		})
		.await
	}

	async fn active_search_settings(&self) -> Result<Vec<SearchSettings>, Error> {
		match self.call(Request::ActiveSearchSettings).await? {
			Response::SettingsList(list) => Ok(list),
			other => Err(unexpected(other)),
		}
	}

	async fn current_search_settings(&self) -> Result<SearchSettings, Error> {
		self.expect_settings(Request::CurrentSearchSettings)
			.await?
			.ok_or_else(|| Error::Remote("no current search settings".to_string()))
	}

	async fn check_and_perform_index_swap(&self) -> Result<Option<SearchSettings>, Error> {
		self.expect_settings(Request::CheckAndPerformIndexSwap).await
	}

	async fn create_attempt(
		&self,
		cc_pair_id: i64,
		search_settings_id: i64,
		from_beginning: bool,
	) -> Result<IndexAttempt, Error> {
		self.expect_attempt(Request::CreateAttempt {
			cc_pair_id,
			search_settings_id,
			from_beginning,
		})
		.await?
		.ok_or_else(|| Error::Remote("attempt creation returned no row".to_string()))
	}

	async fn attempt(&self, id: i64) -> Result<Option<IndexAttempt>, Error> {
		self.expect_attempt(Request::Attempt {
			id,
		})
		.await
	}

	async fn delete_attempt(&self, id: i64) -> Result<(), Error> {
		self.expect_unit(Request::DeleteAttempt {
			id,
		})
		.await
	}

	async fn mark_attempt_started(&self, id: i64) -> Result<(), Error> {
		self.expect_unit(Request::MarkAttemptStarted {
			id,
		})
		.await
	}

	async fn mark_attempt_failed(
		&self,
		id: i64,
		failure_reason: &str,
		full_exception_trace: Option<&str>,
	) -> Result<(), Error> {
		self.expect_unit(Request::MarkAttemptFailed {
			id,
			failure_reason: failure_reason.to_string(),
			full_exception_trace: full_exception_trace.map(|s| s.to_string()),
		})
		.await
	}

	async fn mark_attempt_canceled(&self, id: i64, reason: &str) -> Result<(), Error> {
		self.expect_unit(Request::MarkAttemptCanceled {
			id,
			reason: reason.to_string(),
		})
		.await
	}

	async fn mark_attempt_succeeded(&self, id: i64, partial: bool) -> Result<(), Error> {
		self.expect_unit(Request::MarkAttemptSucceeded {
			id,
			partial,
		})
		.await
	}

	async fn update_docs_indexed(
		&self,
		id: i64,
		total_docs_indexed: u64,
		new_docs_indexed: u64,
	) -> Result<(), Error> {
		self.expect_unit(Request::UpdateDocsIndexed {
			id,
			total_docs_indexed,
			new_docs_indexed,
		})
		.await
	}

	async fn nonterminal_attempts(&self) -> Result<Vec<IndexAttempt>, Error> {
		self.expect_attempts(Request::NonterminalAttempts).await
	}

	async fn last_successful_attempt(
		&self,
		cc_pair_id: i64,
		search_settings_id: i64,
	) -> Result<Option<IndexAttempt>, Error> {
		self.expect_attempt(Request::LastSuccessfulAttempt {
			cc_pair_id,
			search_settings_id,
		})
		.await
	}

	async fn recent_attempts(
		&self,
		cc_pair_id: i64,
		search_settings_id: i64,
		limit: usize,
	) -> Result<Vec<IndexAttempt>, Error> {
		self.expect_attempts(Request::RecentAttempts {
			cc_pair_id,
			search_settings_id,
			limit,
		})
		.await
	}

	async fn attempts_with_old_checkpoints(
		&self,
		cutoff: Timestamp,
	) -> Result<Vec<IndexAttempt>, Error> {
		self.expect_attempts(Request::AttemptsWithOldCheckpoints {
			cutoff,
		})
		.await
	}

	async fn cleanup_checkpoint(&self, attempt_id: i64) -> Result<(), Error> {
		self.expect_unit(Request::CleanupCheckpoint {
			attempt_id,
		})
		.await
	}

	async fn create_attempt_error(
		&self,
		attempt_id: i64,
		cc_pair_id: i64,
		failure: &ConnectorFailure,
	) -> Result<(), Error> {
		self.expect_unit(Request::CreateAttemptError {
			attempt_id,
			cc_pair_id,
			failure: failure.clone(),
		})
		.await
	}

	async fn unresolved_errors(&self, cc_pair_id: i64) -> Result<Vec<AttemptError>, Error> {
		match self
			.call(Request::UnresolvedErrors {
				cc_pair_id,
			})
			.await?
		{
			Response::Errors(errors) => Ok(errors),
			other => Err(unexpected(other)),
		}
	}

	async fn resolve_error(&self, error_id: i64) -> Result<(), Error> {
		self.expect_unit(Request::ResolveError {
			error_id,
		})
		.await
	}
}

#[async_trait]
impl TaskQueue for Client {
	async fn send(&self, task: TaskMessage) -> Result<(), Error> {
		self.expect_unit(Request::QueueSend {
			task,
		})
		.await
	}

	async fn state(&self, task_id: &str) -> Result<TaskState, Error> {
		match self
			.call(Request::QueueState {
				task_id: task_id.to_string(),
			})
			.await?
		{
			Response::Task(state) => Ok(state),
			other => Err(unexpected(other)),
		}
	}
}

#[async_trait]
impl BatchStorage for Client {
	async fn store_batch(
		&self,
		attempt_id: i64,
		batch_id: &str,
		documents: Vec<Document>,
	) -> Result<(), Error> {
		self.expect_unit(Request::StoreBatch {
			attempt_id,
			batch_id: batch_id.to_string(),
			documents,
		})
		.await
	}

	async fn get_batch(
		&self,
		attempt_id: i64,
		batch_id: &str,
	) -> Result<Option<Vec<Document>>, Error> {
		match self
			.call(Request::GetBatch {
				attempt_id,
				batch_id: batch_id.to_string(),
			})
			.await?
		{
			Response::Documents(documents) => Ok(documents),
			other => Err(unexpected(other)),
		}
	}

	async fn delete_batch(&self, attempt_id: i64, batch_id: &str) -> Result<(), Error> {
		self.expect_unit(Request::DeleteBatch {
			attempt_id,
			batch_id: batch_id.to_string(),
		})
		.await
	}

	async fn delete_all(&self, attempt_id: i64) -> Result<(), Error> {
		self.expect_unit(Request::DeleteAllBatches {
			attempt_id,
		})
		.await
	}

	async fn ensure_indexing_state(&self, attempt_id: i64) -> Result<DocIndexingContext, Error> {
		match self
			.call(Request::EnsureIndexingState {
				attempt_id,
			})
			.await?
		{
			Response::IndexingState(state) => Ok(state),
			other => Err(unexpected(other)),
		}
	}

	async fn store_indexing_state(
		&self,
		attempt_id: i64,
		state: &DocIndexingContext,
	) -> Result<(), Error> {
		self.expect_unit(Request::StoreIndexingState {
			attempt_id,
			state: state.clone(),
		})
		.await
	}

	async fn extraction_context(
		&self,
		attempt_id: i64,
	) -> Result<Option<DocExtractionContext>, Error> {
		match self
			.call(Request::ExtractionContext {
				attempt_id,
			})
			.await?
		{
			Response::ExtractionState(context) => Ok(context),
			other => Err(unexpected(other)),
		}
	}

	async fn store_extraction_context(
		&self,
		attempt_id: i64,
		context: &DocExtractionContext,
	) -> Result<(), Error> {
		self.expect_unit(Request::StoreExtractionContext {
			attempt_id,
			context: context.clone(),
		})
		.await
	}
}
