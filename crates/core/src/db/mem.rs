#![cfg(feature = "kv-mem")]

use super::*;
use crate::kvs::Clock;
use std::collections::BTreeMap;
use tokio::sync::RwLock;

const TARGET: &str = "trawler::core::db::mem";

#[derive(Default)]
struct Inner {
	cc_pairs: BTreeMap<i64, CcPair>,
	search_settings: BTreeMap<i64, SearchSettings>,
	attempts: BTreeMap<i64, IndexAttempt>,
	errors: BTreeMap<i64, AttemptError>,
	next_attempt_id: i64,
	next_error_id: i64,
}

/// An in-process catalog used for tests and single-node deployments.
pub struct Datastore {
	inner: RwLock<Inner>,
	clock: Clock,
}

impl Datastore {
	pub fn new(clock: Clock) -> Self {
		Self {
			inner: RwLock::new(Inner {
				next_attempt_id: 100,
				next_error_id: 1,
				..Default::default()
			}),
			clock,
		}
	}

	/// Seeds a cc-pair row
	pub async fn insert_cc_pair(&self, cc_pair: CcPair) {
		self.inner.write().await.cc_pairs.insert(cc_pair.id, cc_pair);
	}

	/// Seeds a search settings row
	pub async fn insert_search_settings(&self, settings: SearchSettings) {
		self.inner.write().await.search_settings.insert(settings.id, settings);
	}
}

#[async_trait]
impl Catalog for Datastore {
	async fn cc_pairs(&self) -> Result<Vec<CcPair>, Error> {
		Ok(self.inner.read().await.cc_pairs.values().cloned().collect())
	}

	async fn cc_pair(&self, id: i64) -> Result<Option<CcPair>, Error> {
		Ok(self.inner.read().await.cc_pairs.get(&id).cloned())
	}

	async fn set_cc_pair_status(&self, id: i64, status: CcPairStatus) -> Result<(), Error> {
		let mut inner = self.inner.write().await;
		let cc_pair = inner.cc_pairs.get_mut(&id).ok_or(Error::CcPairNotFound(id))?;
		cc_pair.status = status;
		Ok(())
	}

	async fn set_cc_pair_repeated_error_state(&self, id: i64, value: bool) -> Result<(), Error> {
		let mut inner = self.inner.write().await;
		let cc_pair = inner.cc_pairs.get_mut(&id).ok_or(Error::CcPairNotFound(id))?;
		cc_pair.in_repeated_error_state = value;
		Ok(())
	}

	async fn take_indexing_trigger(&self, id: i64) -> Result<Option<IndexingTrigger>, Error> {
		let mut inner = self.inner.write().await;
		let cc_pair = inner.cc_pairs.get_mut(&id).ok_or(Error::CcPairNotFound(id))?;
		Ok(cc_pair.indexing_trigger.take())
	}

	async fn set_indexing_trigger(
		&self,
		id: i64,
		trigger: Option<IndexingTrigger>,
	) -> Result<(), Error> {
		let mut inner = self.inner.write().await;
		let cc_pair = inner.cc_pairs.get_mut(&id).ok_or(Error::CcPairNotFound(id))?;
		cc_pair.indexing_trigger = trigger;
		Ok(())
	}

	async fn search_settings(&self, id: i64) -> Result<Option<SearchSettings>, Error> {
		Ok(self.inner.read().await.search_settings.get(&id).cloned())
	}

	async fn active_search_settings(&self) -> Result<Vec<SearchSettings>, Error> {
		let inner = self.inner.read().await;
		let mut list: Vec<SearchSettings> = inner
			.search_settings
			.values()
			.filter(|s| !matches!(s.status, SearchSettingsStatus::Past))
			.cloned()
			.collect();
		// current settings lead the list
		list.sort_by_key(|s| !s.status.is_current());
		Ok(list)
	}

	async fn current_search_settings(&self) -> Result<SearchSettings, Error> {
		let inner = self.inner.read().await;
		inner
			.search_settings
			.values()
			.find(|s| s.status.is_current())
			.cloned()
			.ok_or_else(|| Error::Db("no current search settings".to_string()))
	}

	async fn check_and_perform_index_swap(&self) -> Result<Option<SearchSettings>, Error> {
		// A future generation replaces the current one once every active
		// cc-pair has a successful attempt against it.
		let mut inner = self.inner.write().await;
		let future = match inner
			.search_settings
			.values()
			.find(|s| matches!(s.status, SearchSettingsStatus::Future))
		{
			Some(s) => s.clone(),
			None => return Ok(None),
		};
		let cc_pair_ids: Vec<i64> = inner.cc_pairs.keys().copied().collect();
		let ready = cc_pair_ids.iter().all(|cc| {
			inner.attempts.values().any(|a| {
				a.cc_pair_id == *cc
					&& a.search_settings_id == future.id
					&& a.status.is_successful()
			})
		});
		if !ready || cc_pair_ids.is_empty() {
			return Ok(None);
		}
		let old = inner.search_settings.values().find(|s| s.status.is_current()).cloned();
		if let Some(old) = &old {
			if let Some(s) = inner.search_settings.get_mut(&old.id) {
				s.status = SearchSettingsStatus::Past;
			}
		}
		if let Some(s) = inner.search_settings.get_mut(&future.id) {
			s.status = SearchSettingsStatus::Present;
		}
		info!(target: TARGET, new = future.id, "Search settings swap performed");
		Ok(old)
	}

	async fn create_attempt(
		&self,
		cc_pair_id: i64,
		search_settings_id: i64,
		from_beginning: bool,
	) -> Result<IndexAttempt, Error> {
		let now = self.clock.now();
		let mut inner = self.inner.write().await;
		if !inner.cc_pairs.contains_key(&cc_pair_id) {
			return Err(Error::CcPairNotFound(cc_pair_id));
		}
		if !inner.search_settings.contains_key(&search_settings_id) {
			return Err(Error::SearchSettingsNotFound(search_settings_id));
		}
		let id = inner.next_attempt_id;
		inner.next_attempt_id += 1;
		let attempt = IndexAttempt {
			id,
			cc_pair_id,
			search_settings_id,
			status: AttemptStatus::NotStarted,
			failure_reason: None,
			full_exception_trace: None,
			total_docs_indexed: 0,
			new_docs_indexed: 0,
			from_beginning,
			time_created: now,
			time_updated: now,
			checkpoint_cleaned: false,
		};
		inner.attempts.insert(id, attempt.clone());
		Ok(attempt)
	}

	async fn attempt(&self, id: i64) -> Result<Option<IndexAttempt>, Error> {
		Ok(self.inner.read().await.attempts.get(&id).cloned())
	}

	async fn delete_attempt(&self, id: i64) -> Result<(), Error> {
		self.inner.write().await.attempts.remove(&id);
		Ok(())
	}

	async fn mark_attempt_started(&self, id: i64) -> Result<(), Error> {
		let now = self.clock.now();
		let mut inner = self.inner.write().await;
		let attempt = inner.attempts.get_mut(&id).ok_or(Error::AttemptNotFound(id))?;
		attempt.status = AttemptStatus::InProgress;
		attempt.time_updated = now;
		Ok(())
	}

	async fn mark_attempt_failed(
		&self,
		id: i64,
		failure_reason: &str,
		full_exception_trace: Option<&str>,
	) -> Result<(), Error> {
		let now = self.clock.now();
		let mut inner = self.inner.write().await;
		let attempt = inner.attempts.get_mut(&id).ok_or(Error::AttemptNotFound(id))?;
		if attempt.status.is_terminal() {
			return Ok(());
		}
		attempt.status = AttemptStatus::Failed;
		attempt.failure_reason = Some(failure_reason.to_string());
		attempt.full_exception_trace = full_exception_trace.map(|s| s.to_string());
		attempt.time_updated = now;
		Ok(())
	}

	async fn mark_attempt_canceled(&self, id: i64, reason: &str) -> Result<(), Error> {
		let now = self.clock.now();
		let mut inner = self.inner.write().await;
		let attempt = inner.attempts.get_mut(&id).ok_or(Error::AttemptNotFound(id))?;
		if attempt.status.is_terminal() {
			return Ok(());
		}
		attempt.status = AttemptStatus::Canceled;
		attempt.failure_reason = Some(reason.to_string());
		attempt.time_updated = now;
		Ok(())
	}

	async fn mark_attempt_succeeded(&self, id: i64, partial: bool) -> Result<(), Error> {
		let now = self.clock.now();
		let mut inner = self.inner.write().await;
		let attempt = inner.attempts.get_mut(&id).ok_or(Error::AttemptNotFound(id))?;
		attempt.status = match partial {
			true => AttemptStatus::PartialSuccess,
			false => AttemptStatus::Success,
		};
		attempt.time_updated = now;
		Ok(())
	}

	async fn update_docs_indexed(
		&self,
		id: i64,
		total_docs_indexed: u64,
		new_docs_indexed: u64,
	) -> Result<(), Error> {
		let now = self.clock.now();
		let mut inner = self.inner.write().await;
		let attempt = inner.attempts.get_mut(&id).ok_or(Error::AttemptNotFound(id))?;
		attempt.total_docs_indexed += total_docs_indexed;
		attempt.new_docs_indexed += new_docs_indexed;
		attempt.time_updated = now;
		Ok(())
	}

	async fn nonterminal_attempts(&self) -> Result<Vec<IndexAttempt>, Error> {
		Ok(self
			.inner
			.read()
			.await
			.attempts
			.values()
			.filter(|a| !a.status.is_terminal())
			.cloned()
			.collect())
	}

	async fn last_successful_attempt(
		&self,
		cc_pair_id: i64,
		search_settings_id: i64,
	) -> Result<Option<IndexAttempt>, Error> {
		let inner = self.inner.read().await;
		Ok(inner
			.attempts
			.values()
			.filter(|a| {
				a.cc_pair_id == cc_pair_id
					&& a.search_settings_id == search_settings_id
					&& a.status.is_successful()
			})
			.max_by_key(|a| a.id)
			.cloned())
	}

	async fn recent_attempts(
		&self,
		cc_pair_id: i64,
		search_settings_id: i64,
		limit: usize,
	) -> Result<Vec<IndexAttempt>, Error> {
		let inner = self.inner.read().await;
		let mut attempts: Vec<IndexAttempt> = inner
			.attempts
			.values()
			.filter(|a| a.cc_pair_id == cc_pair_id && a.search_settings_id == search_settings_id)
			.cloned()
			.collect();
		attempts.sort_by_key(|a| std::cmp::Reverse(a.id));
		attempts.truncate(limit);
		Ok(attempts)
	}

	async fn attempts_with_old_checkpoints(
		&self,
		cutoff: Timestamp,
	) -> Result<Vec<IndexAttempt>, Error> {
		Ok(self
			.inner
			.read()
			.await
			.attempts
			.values()
			.filter(|a| a.status.is_terminal() && !a.checkpoint_cleaned && a.time_updated < cutoff)
			.cloned()
			.collect())
	}

	async fn cleanup_checkpoint(&self, attempt_id: i64) -> Result<(), Error> {
		let mut inner = self.inner.write().await;
		let attempt = inner.attempts.get_mut(&attempt_id).ok_or(Error::AttemptNotFound(attempt_id))?;
		attempt.checkpoint_cleaned = true;
		Ok(())
	}

	async fn create_attempt_error(
		&self,
		attempt_id: i64,
		cc_pair_id: i64,
		failure: &ConnectorFailure,
	) -> Result<(), Error> {
		let mut inner = self.inner.write().await;
		let id = inner.next_error_id;
		inner.next_error_id += 1;
		inner.errors.insert(
			id,
			AttemptError {
				id,
				attempt_id,
				cc_pair_id,
				document_id: failure.document_id.clone(),
				failure_message: failure.message.clone(),
				is_resolved: false,
			},
		);
		Ok(())
	}

	async fn unresolved_errors(&self, cc_pair_id: i64) -> Result<Vec<AttemptError>, Error> {
		Ok(self
			.inner
			.read()
			.await
			.errors
			.values()
			.filter(|e| e.cc_pair_id == cc_pair_id && !e.is_resolved)
			.cloned()
			.collect())
	}

	async fn resolve_error(&self, error_id: i64) -> Result<(), Error> {
		let mut inner = self.inner.write().await;
		if let Some(error) = inner.errors.get_mut(&error_id) {
			error.is_resolved = true;
		}
		Ok(())
	}
}
