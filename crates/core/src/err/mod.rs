use crate::job::TerminalStatus;
use thiserror::Error;

/// An error originating from the trawler orchestrator core.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum Error {
	/// There was a problem with the underlying key-value store
	#[error("There was a problem with the underlying key-value store: {0}")]
	Kv(String),

	/// There was a problem with the underlying database catalog
	#[error("There was a problem with the underlying database catalog: {0}")]
	Db(String),

	/// There was a problem with the underlying task queue
	#[error("There was a problem with the underlying task queue: {0}")]
	Queue(String),

	/// There was a problem with the shared coordination endpoint
	#[error("There was a problem with the coordination endpoint: {0}")]
	Remote(String),

	/// There was a problem with the underlying document batch storage
	#[error("There was a problem with the underlying document batch storage: {0}")]
	Storage(String),

	/// The specified connector-credential pair does not exist
	#[error("The connector-credential pair '{0}' does not exist")]
	CcPairNotFound(i64),

	/// The specified index attempt does not exist
	#[error("The index attempt '{0}' does not exist")]
	AttemptNotFound(i64),

	/// The specified search settings do not exist
	#[error("The search settings '{0}' do not exist")]
	SearchSettingsNotFound(i64),

	/// The specified document batch does not exist
	#[error("The document batch '{0}' does not exist")]
	BatchNotFound(String),

	/// The indexing fence for the operation does not exist
	#[error("The indexing fence '{0}' does not exist")]
	FenceNotFound(String),

	/// The indexing fence exists but its payload is missing or malformed
	#[error("The indexing fence '{0}' has an invalid payload")]
	FencePayloadInvalid(String),

	/// A lease-bound lock could not be extended because it is no longer owned
	#[error("The lock '{0}' is no longer owned by this holder")]
	LockNotOwned(String),

	/// The connector rejected its configuration or credentials
	#[error("The connector failed validation: {0}")]
	ConnectorValidation(String),

	/// A protocol failure which maps onto a reserved process exit code
	#[error("{message}")]
	Terminal {
		/// The typed terminal status used for exit-code classification
		status: TerminalStatus,
		/// The reportable failure message
		message: String,
	},

	/// The batch failure threshold for the attempt was exceeded
	#[error("Connector run encountered too many errors, aborting. Last error: {last_failure}")]
	TooManyFailures {
		/// Total failures recorded across all batches so far
		failures: u64,
		/// The message of the most recent failure
		last_failure: String,
	},

	/// The spawned process could not be started or polled
	#[error("There was a problem managing the worker process: {0}")]
	Io(#[from] std::io::Error),

	/// A value could not be serialized or deserialized
	#[error("There was a problem with serialization: {0}")]
	Serialization(#[from] serde_json::Error),

	/// An internal invariant was broken
	#[error("Internal error: {0}")]
	Internal(String),
}

impl Error {
	/// Creates a coded protocol failure carrying a reserved exit code
	pub fn terminal(status: TerminalStatus, message: impl Into<String>) -> Self {
		Error::Terminal {
			status,
			message: message.into(),
		}
	}

	/// Returns the process exit code this error maps onto, if any
	pub fn exit_code(&self) -> Option<i32> {
		match self {
			Error::Terminal {
				status,
				..
			} => status.code(),
			Error::ConnectorValidation(_) => TerminalStatus::ConnectorValidationError.code(),
			_ => None,
		}
	}
}
