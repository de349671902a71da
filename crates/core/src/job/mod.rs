//! The process job client.
//!
//! Fetch work runs in a spawned OS process so connector code cannot take the
//! worker down with it. The child is a fresh executable invocation, never a
//! fork, so it re-initializes its own pools and telemetry, and reports its
//! outcome through the typed exit-code protocol in [`TerminalStatus`].

mod status;

pub use status::TerminalStatus;

use crate::cnf;
use crate::err::Error;
use std::collections::VecDeque;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::{Arc, Mutex};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command};

const TARGET: &str = "trawler::core::job";

/// The coarse state of a spawned job
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum JobStatus {
	Running,
	Ok,
	Error,
}

/// Spawns worker processes running a declared entrypoint.
#[derive(Clone, Debug)]
pub struct JobClient {
	program: PathBuf,
	args: Vec<String>,
}

impl JobClient {
	/// Creates a client spawning the given program
	pub fn new(program: impl Into<PathBuf>) -> Self {
		Self {
			program: program.into(),
			args: Vec::new(),
		}
	}

	/// Creates a client respawning the current executable
	pub fn current_exe() -> Result<Self, Error> {
		Ok(Self::new(std::env::current_exe()?))
	}

	/// Fixed arguments placed before the per-job arguments
	pub fn with_args(mut self, args: Vec<String>) -> Self {
		self.args = args;
		self
	}

	/// Spawns a job with the given arguments appended
	pub fn submit(&self, args: &[String]) -> Result<Job, Error> {
		let mut child = Command::new(&self.program)
			.args(&self.args)
			.args(args)
			.stdin(Stdio::null())
			.stdout(Stdio::null())
			.stderr(Stdio::piped())
			.kill_on_drop(true)
			.spawn()?;
		let pid = child.id();
		debug!(target: TARGET, program = %self.program.display(), ?pid, "Spawned worker process");
		// retain a bounded tail of the child's stderr for diagnostics
		let tail: Arc<Mutex<VecDeque<String>>> = Arc::new(Mutex::new(VecDeque::new()));
		if let Some(stderr) = child.stderr.take() {
			let tail = tail.clone();
			tokio::spawn(async move {
				let mut lines = BufReader::new(stderr).lines();
				while let Ok(Some(line)) = lines.next_line().await {
					if let Ok(mut tail) = tail.lock() {
						if tail.len() >= cnf::STDERR_TAIL_LINES {
							tail.pop_front();
						}
						tail.push_back(line);
					}
				}
			});
		}
		Ok(Job {
			child,
			pid,
			exit: None,
			stderr_tail: tail,
		})
	}
}

/// A spawned worker process under supervision.
pub struct Job {
	child: Child,
	pid: Option<u32>,
	exit: Option<i32>,
	stderr_tail: Arc<Mutex<VecDeque<String>>>,
}

impl Job {
	/// The OS process id, while the handle is held
	pub fn pid(&self) -> Option<u32> {
		self.pid
	}

	fn poll(&mut self) -> Result<(), Error> {
		if self.exit.is_some() {
			return Ok(());
		}
		if let Some(status) = self.child.try_wait()? {
			self.exit = Some(exit_code(&status));
		}
		Ok(())
	}

	/// Whether the process is still running
	pub fn is_alive(&mut self) -> Result<bool, Error> {
		self.poll()?;
		Ok(self.exit.is_none())
	}

	/// The exit code, once the process has terminated. Termination by signal
	/// is reported as the negated signal number.
	pub fn exit_code(&mut self) -> Result<Option<i32>, Error> {
		self.poll()?;
		Ok(self.exit)
	}

	/// Whether the process has terminated
	pub fn done(&mut self) -> Result<bool, Error> {
		Ok(self.exit_code()?.is_some())
	}

	/// The coarse state of the job
	pub fn status(&mut self) -> Result<JobStatus, Error> {
		Ok(match self.exit_code()? {
			None => JobStatus::Running,
			Some(0) => JobStatus::Ok,
			Some(_) => JobStatus::Error,
		})
	}

	/// The retained tail of the child's standard error, if any was written
	pub fn exception(&self) -> Option<String> {
		let tail = self.stderr_tail.lock().ok()?;
		if tail.is_empty() {
			return None;
		}
		Some(tail.iter().cloned().collect::<Vec<_>>().join("\n"))
	}

	/// Sends a hard termination signal and reaps the process
	pub async fn cancel(&mut self) -> Result<(), Error> {
		if self.exit.is_none() {
			warn!(target: TARGET, pid = ?self.pid, "Cancelling worker process");
			self.child.start_kill()?;
			let status = self.child.wait().await?;
			self.exit = Some(exit_code(&status));
		}
		Ok(())
	}

	/// Frees the process handle
	pub fn release(self) {}
}

#[cfg(unix)]
fn exit_code(status: &std::process::ExitStatus) -> i32 {
	use std::os::unix::process::ExitStatusExt;
	match status.code() {
		Some(code) => code,
		// killed by a signal; report as the negated signal number
		None => -status.signal().unwrap_or(0),
	}
}

#[cfg(not(unix))]
fn exit_code(status: &std::process::ExitStatus) -> i32 {
	status.code().unwrap_or(-1)
}
