use serde::{Deserialize, Serialize};

/// The classified outcome of a supervised fetch task.
///
/// Statuses with a `code` travel from the child process to the watchdog as
/// the process exit code; the table below is the whole protocol and must be
/// enforced on both sides. Watchdog-side outcomes carry no code.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[non_exhaustive]
pub enum TerminalStatus {
	/// A non-zero code with no assigned meaning
	Undefined,
	Succeeded,
	/// The child process could not be spawned
	SpawnFailed,
	/// The child process never left the starting state
	SpawnNotAlive,
	/// The child was killed by a signal
	KilledBySignal,
	/// The child was killed by the out-of-memory killer
	OutOfMemory,
	/// The connector rejected its configuration or credentials
	ConnectorValidationError,
	/// A connector deletion fence blocked the attempt
	BlockedByDeletion,
	/// A connector stop fence blocked the attempt
	BlockedByStopSignal,
	/// The fence disappeared while the child was waiting on it
	FenceNotFound,
	/// The fence never became ready within the readiness timeout
	FenceReadinessTimeout,
	/// The fence points at a different attempt than the task arguments
	FenceMismatch,
	/// The generator lock was already held by another fetch task
	TaskAlreadyRunning,
	/// A row required by the attempt was missing from the catalog
	IndexAttemptMismatch,
	/// The connector raised an unexpected exception
	ConnectorExceptioned,
	/// The watchdog itself raised an unexpected exception
	WatchdogExceptioned,
	/// An external termination signal stopped the attempt
	TerminatedBySignal,
	/// The connector activity lease expired
	TerminatedByActivityTimeout,
}

impl TerminalStatus {
	/// The process exit code assigned to this status, if any
	pub fn code(&self) -> Option<i32> {
		match self {
			TerminalStatus::Succeeded => Some(0),
			TerminalStatus::KilledBySignal => Some(-9),
			TerminalStatus::OutOfMemory => Some(137),
			TerminalStatus::ConnectorValidationError => Some(247),
			TerminalStatus::BlockedByDeletion => Some(248),
			TerminalStatus::BlockedByStopSignal => Some(249),
			TerminalStatus::FenceNotFound => Some(250),
			TerminalStatus::FenceReadinessTimeout => Some(251),
			TerminalStatus::FenceMismatch => Some(252),
			TerminalStatus::TaskAlreadyRunning => Some(253),
			TerminalStatus::IndexAttemptMismatch => Some(254),
			TerminalStatus::ConnectorExceptioned => Some(255),
			_ => None,
		}
	}

	/// Classifies a process exit code
	pub fn from_code(code: i32) -> Self {
		match code {
			0 => TerminalStatus::Succeeded,
			-9 => TerminalStatus::KilledBySignal,
			137 => TerminalStatus::OutOfMemory,
			247 => TerminalStatus::ConnectorValidationError,
			248 => TerminalStatus::BlockedByDeletion,
			249 => TerminalStatus::BlockedByStopSignal,
			250 => TerminalStatus::FenceNotFound,
			251 => TerminalStatus::FenceReadinessTimeout,
			252 => TerminalStatus::FenceMismatch,
			253 => TerminalStatus::TaskAlreadyRunning,
			254 => TerminalStatus::IndexAttemptMismatch,
			255 => TerminalStatus::ConnectorExceptioned,
			_ => TerminalStatus::Undefined,
		}
	}

	/// The reportable name of this status
	pub fn as_str(&self) -> &'static str {
		match self {
			TerminalStatus::Undefined => "undefined",
			TerminalStatus::Succeeded => "succeeded",
			TerminalStatus::SpawnFailed => "spawn_failed",
			TerminalStatus::SpawnNotAlive => "spawn_not_alive",
			TerminalStatus::KilledBySignal => "killed_by_signal",
			TerminalStatus::OutOfMemory => "out_of_memory",
			TerminalStatus::ConnectorValidationError => "connector_validation_error",
			TerminalStatus::BlockedByDeletion => "blocked_by_deletion",
			TerminalStatus::BlockedByStopSignal => "blocked_by_stop_signal",
			TerminalStatus::FenceNotFound => "fence_not_found",
			TerminalStatus::FenceReadinessTimeout => "fence_readiness_timeout",
			TerminalStatus::FenceMismatch => "fence_mismatch",
			TerminalStatus::TaskAlreadyRunning => "task_already_running",
			TerminalStatus::IndexAttemptMismatch => "index_attempt_mismatch",
			TerminalStatus::ConnectorExceptioned => "connector_exceptioned",
			TerminalStatus::WatchdogExceptioned => "watchdog_exceptioned",
			TerminalStatus::TerminatedBySignal => "terminated_by_signal",
			TerminalStatus::TerminatedByActivityTimeout => "terminated_by_activity_timeout",
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn codes_round_trip() {
		for code in [0, -9, 137, 247, 248, 249, 250, 251, 252, 253, 254, 255] {
			let status = TerminalStatus::from_code(code);
			assert_eq!(status.code(), Some(code));
		}
	}

	#[test]
	fn unassigned_codes_are_undefined() {
		assert_eq!(TerminalStatus::from_code(1), TerminalStatus::Undefined);
		assert_eq!(TerminalStatus::from_code(2), TerminalStatus::Undefined);
		assert_eq!(TerminalStatus::from_code(246), TerminalStatus::Undefined);
		assert_eq!(TerminalStatus::Undefined.code(), None);
	}
}
