use crate::batch::{DocExtractionContext, DocIndexingContext};
use crate::db::{AttemptError, CcPair, CcPairStatus, IndexAttempt, IndexingTrigger, SearchSettings};
use crate::kvs::{KeyTtl, Timestamp};
use crate::pipeline::{ConnectorFailure, Document};
use crate::queue::{TaskMessage, TaskState};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// One operation forwarded to the worker's backing stores.
#[derive(Debug, Serialize, Deserialize)]
pub(crate) enum Request {
	KvGet {
		key: String,
	},
	KvPut {
		key: String,
		val: Vec<u8>,
		ttl: Option<Duration>,
	},
	KvPutNx {
		key: String,
		val: Vec<u8>,
		ttl: Option<Duration>,
	},
	KvDel {
		key: String,
	},
	KvDelCas {
		key: String,
		expected: Vec<u8>,
	},
	KvExpireCas {
		key: String,
		expected: Vec<u8>,
		ttl: Duration,
	},
	KvExists {
		key: String,
	},
	KvTtl {
		key: String,
	},
	KvIncr {
		key: String,
		by: i64,
	},
	KvSadd {
		set: String,
		member: String,
	},
	KvSrem {
		set: String,
		member: String,
	},
	KvSmembers {
		set: String,
	},
	KvSismember {
		set: String,
		member: String,
	},
	KvScan {
		prefix: String,
	},
	CcPairs,
	CcPair {
		id: i64,
	},
	SetCcPairStatus {
		id: i64,
		status: CcPairStatus,
	},
	SetCcPairRepeatedErrorState {
		id: i64,
		value: bool,
	},
	TakeIndexingTrigger {
		id: i64,
	},
	SetIndexingTrigger {
		id: i64,
		trigger: Option<IndexingTrigger>,
	},
	SearchSettings {
		id: i64,
	},
	ActiveSearchSettings,
	CurrentSearchSettings,
	CheckAndPerformIndexSwap,
	CreateAttempt {
		cc_pair_id: i64,
		search_settings_id: i64,
		from_beginning: bool,
	},
	Attempt {
		id: i64,
	},
	DeleteAttempt {
		id: i64,
	},
	MarkAttemptStarted {
		id: i64,
	},
	MarkAttemptFailed {
		id: i64,
		failure_reason: String,
		full_exception_trace: Option<String>,
	},
	MarkAttemptCanceled {
		id: i64,
		reason: String,
	},
	MarkAttemptSucceeded {
		id: i64,
		partial: bool,
	},
	UpdateDocsIndexed {
		id: i64,
		total_docs_indexed: u64,
		new_docs_indexed: u64,
	},
	NonterminalAttempts,
	LastSuccessfulAttempt {
		cc_pair_id: i64,
		search_settings_id: i64,
	},
	RecentAttempts {
		cc_pair_id: i64,
		search_settings_id: i64,
		limit: usize,
	},
	AttemptsWithOldCheckpoints {
		cutoff: Timestamp,
	},
	CleanupCheckpoint {
		attempt_id: i64,
	},
	CreateAttemptError {
		attempt_id: i64,
		cc_pair_id: i64,
		failure: ConnectorFailure,
	},
	UnresolvedErrors {
		cc_pair_id: i64,
	},
	ResolveError {
		error_id: i64,
	},
	QueueSend {
		task: TaskMessage,
	},
	QueueState {
		task_id: String,
	},
	StoreBatch {
		attempt_id: i64,
		batch_id: String,
		documents: Vec<Document>,
	},
	GetBatch {
		attempt_id: i64,
		batch_id: String,
	},
	DeleteBatch {
		attempt_id: i64,
		batch_id: String,
	},
	DeleteAllBatches {
		attempt_id: i64,
	},
	EnsureIndexingState {
		attempt_id: i64,
	},
	StoreIndexingState {
		attempt_id: i64,
		state: DocIndexingContext,
	},
	ExtractionContext {
		attempt_id: i64,
	},
	StoreExtractionContext {
		attempt_id: i64,
		context: DocExtractionContext,
	},
}

/// The answer to one forwarded operation.
#[derive(Debug, Serialize, Deserialize)]
pub(crate) enum Response {
	Unit,
	Bool(bool),
	Int(i64),
	Bytes(Option<Vec<u8>>),
	Keys(Vec<String>),
	Ttl(KeyTtl),
	CcPairs(Vec<CcPair>),
	CcPair(Option<CcPair>),
	Trigger(Option<IndexingTrigger>),
	Settings(Option<SearchSettings>),
	SettingsList(Vec<SearchSettings>),
	Attempt(Option<IndexAttempt>),
	Attempts(Vec<IndexAttempt>),
	Errors(Vec<AttemptError>),
	Task(TaskState),
	Documents(Option<Vec<Document>>),
	IndexingState(DocIndexingContext),
	ExtractionState(Option<DocExtractionContext>),
	Failure(String),
}
