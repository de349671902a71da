use super::msg::{Request, Response};
use crate::batch::BatchStorage;
use crate::db::Catalog;
use crate::err::Error;
use crate::kvs::Store;
use crate::queue::TaskQueue;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};

const TARGET: &str = "trawler::core::rpc";

/// Serves the worker's backing stores to spawned fetch processes.
///
/// One request per line, one response per line; each connection is handled
/// independently, so a child holds a single connection for its lifetime.
pub struct Server {
	kv: Arc<dyn Store>,
	db: Arc<dyn Catalog>,
	queue: Arc<dyn TaskQueue>,
	batches: Arc<dyn BatchStorage>,
}

impl Server {
	pub fn new(
		kv: Arc<dyn Store>,
		db: Arc<dyn Catalog>,
		queue: Arc<dyn TaskQueue>,
		batches: Arc<dyn BatchStorage>,
	) -> Self {
		Self {
			kv,
			db,
			queue,
			batches,
		}
	}

	/// Binds the endpoint and serves connections in the background,
	/// returning the bound address for the worker to hand to its children.
	pub async fn serve(self, addr: &str) -> Result<SocketAddr, Error> {
		let listener = TcpListener::bind(addr).await?;
		let addr = listener.local_addr()?;
		info!(target: TARGET, %addr, "Coordination endpoint listening");
		let server = Arc::new(self);
		tokio::spawn(async move {
			loop {
				match listener.accept().await {
					Ok((stream, peer)) => {
						debug!(target: TARGET, %peer, "Coordination client connected");
						let server = server.clone();
						tokio::spawn(async move {
							if let Err(error) = server.session(stream).await {
								debug!(target: TARGET, %error, "Coordination session ended");
							}
						});
					}
					Err(error) => {
						warn!(target: TARGET, %error, "Coordination accept failed");
					}
				}
			}
		});
		Ok(addr)
	}

	async fn session(&self, stream: TcpStream) -> Result<(), Error> {
		let (read, mut write) = stream.into_split();
		let mut lines = BufReader::new(read).lines();
		while let Some(line) = lines.next_line().await? {
			if line.is_empty() {
				continue;
			}
			// a malformed or failing operation answers this request only;
			// the session itself stays up
			let response = match serde_json::from_str::<Request>(&line) {
				Ok(request) => match self.dispatch(request).await {
					Ok(response) => response,
					Err(error) => Response::Failure(error.to_string()),
				},
				Err(error) => Response::Failure(error.to_string()),
			};
			let mut out = serde_json::to_vec(&response)?;
			out.push(b'\n');
			write.write_all(&out).await?;
		}
		Ok(())
	}

	async fn dispatch(&self, request: Request) -> Result<Response, Error> {
		Ok(match request {
			Request::KvGet {
				key,
			} => Response::Bytes(self.kv.get(&key).await?),
			Request::KvPut {
				key,
				val,
				ttl,
			} => {
				self.kv.put(&key, val, ttl).await?;
				Response::Unit
			}
			Request::KvPutNx {
				key,
				val,
				ttl,
			} => Response::Bool(self.kv.put_nx(&key, val, ttl).await?),
			Request::KvDel {
				key,
			} => {
				self.kv.del(&key).await?;
				Response::Unit
			}
			Request::KvDelCas {
				key,
				expected,
			} => Response::Bool(self.kv.del_cas(&key, &expected).await?),
			Request::KvExpireCas {
				key,
				expected,
				ttl,
			} => Response::Bool(self.kv.expire_cas(&key, &expected, ttl).await?),
			Request::KvExists {
				key,
			} => Response::Bool(self.kv.exists(&key).await?),
			Request::KvTtl {
				key,
			} => Response::Ttl(self.kv.ttl(&key).await?),
			Request::KvIncr {
				key,
				by,
			} => Response::Int(self.kv.incr(&key, by).await?),
			Request::KvSadd {
				set,
				member,
			} => {
				self.kv.sadd(&set, &member).await?;
				Response::Unit
			}
			Request::KvSrem {
				set,
				member,
			} => {
				self.kv.srem(&set, &member).await?;
				Response::Unit
			}
			Request::KvSmembers {
				set,
			} => Response::Keys(self.kv.smembers(&set).await?),
			Request::KvSismember {
				set,
				member,
			} => Response::Bool(self.kv.sismember(&set, &member).await?),
			Request::KvScan {
				prefix,
			} => Response::Keys(self.kv.scan(&prefix).await?),
			Request::CcPairs => Response::CcPairs(self.db.cc_pairs().await?),
			Request::CcPair {
				id,
			} => Response::CcPair(self.db.cc_pair(id).await?),
			Request::SetCcPairStatus {
				id,
				status,
			} => {
				self.db.set_cc_pair_status(id, status).await?;
				Response::Unit
			}
			Request::SetCcPairRepeatedErrorState {
				id,
				value,
			} => {
				self.db.set_cc_pair_repeated_error_state(id, value).await?;
				Response::Unit
			}
			Request::TakeIndexingTrigger {
				id,
			} => Response::Trigger(self.db.take_indexing_trigger(id).await?),
			Request::SetIndexingTrigger {
				id,
				trigger,
			} => {
				self.db.set_indexing_trigger(id, trigger).await?;
				Response::Unit
			}
			Request::SearchSettings {
				id,
			} => Response::Settings(self.db.search_settings(id).await?),
			Request::ActiveSearchSettings => {
				Response::SettingsList(self.db.active_search_settings().await?)
			}
			Request::CurrentSearchSettings => {
				Response::Settings(Some(self.db.current_search_settings().await?))
			}
			Request::CheckAndPerformIndexSwap => {
				Response::Settings(self.db.check_and_perform_index_swap().await?)
			}
			Request::CreateAttempt {
				cc_pair_id,
				search_settings_id,
				from_beginning,
			} => Response::Attempt(Some(
				self.db.create_attempt(cc_pair_id, search_settings_id, from_beginning).await?,
			)),
			Request::Attempt {
				id,
			} => Response::Attempt(self.db.attempt(id).await?),
			Request::DeleteAttempt {
				id,
			} => {
				self.db.delete_attempt(id).await?;
				Response::Unit
			}
			Request::MarkAttemptStarted {
				id,
			} => {
				self.db.mark_attempt_started(id).await?;
				Response::Unit
			}
			Request::MarkAttemptFailed {
				id,
				failure_reason,
				full_exception_trace,
			} => {
				self.db
					.mark_attempt_failed(id, &failure_reason, full_exception_trace.as_deref())
					.await?;
				Response::Unit
			}
			Request::MarkAttemptCanceled {
				id,
				reason,
			} => {
				self.db.mark_attempt_canceled(id, &reason).await?;
				Response::Unit
			}
			Request::MarkAttemptSucceeded {
				id,
				partial,
			} => {
				self.db.mark_attempt_succeeded(id, partial).await?;
				Response::Unit
			}
			Request::UpdateDocsIndexed {
				id,
				total_docs_indexed,
				new_docs_indexed,
			} => {
				self.db.update_docs_indexed(id, total_docs_indexed, new_docs_indexed).await?;
				Response::Unit
			}
			Request::NonterminalAttempts => {
				Response::Attempts(self.db.nonterminal_attempts().await?)
			}
			Request::LastSuccessfulAttempt {
				cc_pair_id,
				search_settings_id,
			} => Response::Attempt(
				self.db.last_successful_attempt(cc_pair_id, search_settings_id).await?,
			),
			Request::RecentAttempts {
				cc_pair_id,
				search_settings_id,
				limit,
			} => Response::Attempts(
				self.db.recent_attempts(cc_pair_id, search_settings_id, limit).await?,
			),
			Request::AttemptsWithOldCheckpoints {
				cutoff,
			} => Response::Attempts(self.db.attempts_with_old_checkpoints(cutoff).await?),
			Request::CleanupCheckpoint {
				attempt_id,
			} => {
				self.db.cleanup_checkpoint(attempt_id).await?;
				Response::Unit
			}
			Request::CreateAttemptError {
				attempt_id,
				cc_pair_id,
				failure,
			} => {
				self.db.create_attempt_error(attempt_id, cc_pair_id, &failure).await?;
				Response::Unit
			}
			Request::UnresolvedErrors {
				cc_pair_id,
			} => Response::Errors(self.db.unresolved_errors(cc_pair_id).await?),
			Request::ResolveError {
				error_id,
			} => {
				self.db.resolve_error(error_id).await?;
				Response::Unit
			}
			Request::QueueSend {
				task,
			} => {
				self.queue.send(task).await?;
				Response::Unit
			}
			Request::QueueState {
				task_id,
			} => Response::Task(self.queue.state(&task_id).await?),
			Request::StoreBatch {
				attempt_id,
				batch_id,
				documents,
			} => {
				self.batches.store_batch(attempt_id, &batch_id, documents).await?;
				Response::Unit
			}
			Request::GetBatch {
				attempt_id,
				batch_id,
			} => Response::Documents(self.batches.get_batch(attempt_id, &batch_id).await?),
			Request::DeleteBatch {
				attempt_id,
				batch_id,
			} => {
				self.batches.delete_batch(attempt_id, &batch_id).await?;
				Response::Unit
			}
			Request::DeleteAllBatches {
				attempt_id,
			} => {
				self.batches.delete_all(attempt_id).await?;
				Response::Unit
			}
			Request::EnsureIndexingState {
				attempt_id,
			} => Response::IndexingState(self.batches.ensure_indexing_state(attempt_id).await?),
			Request::StoreIndexingState {
				attempt_id,
				state,
			} => {
				self.batches.store_indexing_state(attempt_id, &state).await?;
				Response::Unit
			}
			Request::ExtractionContext {
				attempt_id,
			} => Response::ExtractionState(self.batches.extraction_context(attempt_id).await?),
			Request::StoreExtractionContext {
				attempt_id,
				context,
			} => {
				self.batches.store_extraction_context(attempt_id, &context).await?;
				Response::Unit
			}
		})
	}
}
