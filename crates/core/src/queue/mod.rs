//! The task-queue transport boundary.
//!
//! The orchestrator never delivers tasks itself: it places named tasks with
//! typed arguments on an external queue and inspects their delivery state.
//! Workers consume the queue and invoke the matching orchestrator operation.

#[cfg(feature = "kv-mem")]
pub mod mem;

use crate::err::Error;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// The registered task entrypoints
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub enum TaskName {
	CheckForIndexing,
	DocFetching,
	DocProcessing,
	CheckForCheckpointCleanup,
	CleanupCheckpoint,
}

impl TaskName {
	pub fn as_str(&self) -> &'static str {
		match self {
			TaskName::CheckForIndexing => "check_for_indexing",
			TaskName::DocFetching => "doc_fetching_task",
			TaskName::DocProcessing => "doc_processing_task",
			TaskName::CheckForCheckpointCleanup => "check_for_checkpoint_cleanup",
			TaskName::CleanupCheckpoint => "cleanup_checkpoint",
		}
	}
}

/// The worker pools tasks are routed to
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub enum QueueName {
	/// Long-running document fetch supervision
	DocFetching,
	/// Massively parallel per-batch processing
	DocProcessing,
	/// Short housekeeping work
	Light,
}

/// Dispatch priority within a queue
#[derive(Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd, Serialize, Deserialize)]
pub enum Priority {
	High,
	Medium,
	Low,
}

/// A named task with typed arguments, ready for dispatch
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TaskMessage {
	/// The queue-assigned task identity
	pub id: String,
	pub name: TaskName,
	pub args: serde_json::Value,
	pub queue: QueueName,
	pub priority: Priority,
}

impl TaskMessage {
	pub fn new(
		name: TaskName,
		args: impl Serialize,
		queue: QueueName,
		priority: Priority,
	) -> Result<Self, Error> {
		Ok(Self {
			id: Uuid::new_v4().to_string(),
			name,
			args: serde_json::to_value(args)?,
			queue,
			priority,
		})
	}
}

/// The delivery state of a task as reported by the queue
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub enum TaskState {
	/// The queue has no record of this task
	Unknown,
	/// Waiting in the queue
	Queued,
	/// Prefetched by a worker but not yet running
	Reserved,
	/// Currently executing
	Started,
	/// Finished, successfully or not
	Ready {
		success: bool,
		result: Option<String>,
		traceback: Option<String>,
	},
}

impl TaskState {
	/// Whether the task has reached a terminal delivery state
	pub fn is_ready(&self) -> bool {
		matches!(self, TaskState::Ready { .. })
	}
}

/// The queue operations the orchestrator requires.
#[async_trait]
pub trait TaskQueue: Send + Sync + 'static {
	/// Places a task on its queue
	async fn send(&self, task: TaskMessage) -> Result<(), Error>;
	/// Reports the delivery state of a task
	async fn state(&self, task_id: &str) -> Result<TaskState, Error>;

	/// Whether the task is present in the queue, reserved by a worker, or
	/// currently executing
	async fn known(&self, task_id: &str) -> Result<bool, Error> {
		Ok(matches!(
			self.state(task_id).await?,
			TaskState::Queued | TaskState::Reserved | TaskState::Started
		))
	}
}

/// Arguments for the beat entrypoints
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TenantArgs {
	pub tenant_id: String,
}

/// Arguments for the document fetching task
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DocFetchingArgs {
	pub attempt_id: i64,
	pub cc_pair_id: i64,
	pub search_settings_id: i64,
	pub tenant_id: String,
}

/// Arguments for the per-batch document processing task
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DocProcessingArgs {
	pub batch_id: String,
	pub attempt_id: i64,
	pub cc_pair_id: i64,
	pub tenant_id: String,
	pub batch_num: u64,
}

/// Arguments for the checkpoint cleanup task
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CleanupCheckpointArgs {
	pub attempt_id: i64,
	pub tenant_id: String,
}
