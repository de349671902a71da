#![cfg(feature = "kv-mem")]

use super::*;
use channel::{Receiver, Sender};
use dashmap::DashMap;

/// An in-process queue used for tests and single-node deployments.
///
/// Each named queue is an unbounded channel; delivery states are tracked so
/// fence validation and the monitor can inspect tasks the same way they
/// would against a networked broker.
pub struct Datastore {
	channels: DashMap<QueueName, (Sender<TaskMessage>, Receiver<TaskMessage>)>,
	states: DashMap<String, TaskState>,
}

impl Default for Datastore {
	fn default() -> Self {
		Self::new()
	}
}

impl Datastore {
	pub fn new() -> Self {
		Self {
			channels: DashMap::new(),
			states: DashMap::new(),
		}
	}

	fn channel(&self, queue: QueueName) -> (Sender<TaskMessage>, Receiver<TaskMessage>) {
		self.channels.entry(queue).or_insert_with(channel::unbounded).clone()
	}

	/// Receives the next task from a queue, waiting until one arrives
	pub async fn recv(&self, queue: QueueName) -> Result<TaskMessage, Error> {
		let (_, rx) = self.channel(queue);
		let task = rx.recv().await.map_err(|e| Error::Queue(e.to_string()))?;
		self.states.insert(task.id.clone(), TaskState::Reserved);
		Ok(task)
	}

	/// Attempts to receive the next task from a queue without waiting
	pub fn try_recv(&self, queue: QueueName) -> Option<TaskMessage> {
		let (_, rx) = self.channel(queue);
		match rx.try_recv() {
			Ok(task) => {
				self.states.insert(task.id.clone(), TaskState::Reserved);
				Some(task)
			}
			Err(_) => None,
		}
	}

	/// Records that a worker has begun executing a task
	pub fn mark_started(&self, task_id: &str) {
		self.states.insert(task_id.to_string(), TaskState::Started);
	}

	/// Records the terminal outcome of a task
	pub fn mark_ready(&self, task_id: &str, success: bool, result: Option<String>, traceback: Option<String>) {
		self.states.insert(
			task_id.to_string(),
			TaskState::Ready {
				success,
				result,
				traceback,
			},
		);
	}

	/// Drops all record of a task, as a broker with an expired result would
	pub fn forget(&self, task_id: &str) {
		self.states.remove(task_id);
	}
}

#[async_trait]
impl TaskQueue for Datastore {
	async fn send(&self, task: TaskMessage) -> Result<(), Error> {
		let (tx, _) = self.channel(task.queue);
		self.states.insert(task.id.clone(), TaskState::Queued);
		tx.send(task).await.map_err(|e| Error::Queue(e.to_string()))
	}

	async fn state(&self, task_id: &str) -> Result<TaskState, Error> {
		Ok(self.states.get(task_id).map(|s| s.clone()).unwrap_or(TaskState::Unknown))
	}
}
