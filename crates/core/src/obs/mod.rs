//! Observability helpers for the background workers.

use std::fmt::Write;
use sysinfo::{Pid, ProcessesToUpdate, System};

const TARGET: &str = "trawler::core::obs";

/// Emits a memory sample for a process in logfmt form.
///
/// Used by the watchdog to track down connector-specific memory issues in
/// spawned fetch processes.
pub fn emit_process_memory(pid: u32, name: &str, context: &[(&str, String)]) {
	let pid = Pid::from_u32(pid);
	let mut system = System::new();
	system.refresh_processes(ProcessesToUpdate::Some(&[pid]), true);
	match system.process(pid) {
		Some(process) => {
			let mut extra = String::new();
			for (key, value) in context {
				let _ = write!(extra, " {key}={value}");
			}
			info!(
				target: TARGET,
				"Process memory: name={} pid={} rss={} virtual={}{}",
				name,
				pid,
				process.memory(),
				process.virtual_memory(),
				extra,
			);
		}
		None => {
			debug!(target: TARGET, %pid, name, "Process not found for memory sample");
		}
	}
}

/// Builds log messages carrying the identifying context of one attempt.
///
/// Messages render as `msg: tenant_id=.. attempt=.. cc_pair=..
/// search_settings=..` with optional logfmt extras, so every line of a
/// supervised run can be correlated without structured log ingestion.
#[derive(Clone, Debug)]
pub struct LogBuilder {
	tenant_id: String,
	attempt_id: i64,
	cc_pair_id: i64,
	search_settings_id: i64,
}

impl LogBuilder {
	pub fn new(
		tenant_id: impl Into<String>,
		attempt_id: i64,
		cc_pair_id: i64,
		search_settings_id: i64,
	) -> Self {
		Self {
			tenant_id: tenant_id.into(),
			attempt_id,
			cc_pair_id,
			search_settings_id,
		}
	}

	/// Renders a message with the attempt context appended
	pub fn build(&self, msg: &str) -> String {
		format!(
			"{msg}: tenant_id={} attempt={} cc_pair={} search_settings={}",
			self.tenant_id, self.attempt_id, self.cc_pair_id, self.search_settings_id
		)
	}

	/// Renders a message with the attempt context and logfmt extras appended
	pub fn build_with(&self, msg: &str, extra: &[(&str, String)]) -> String {
		let mut out = self.build(msg);
		for (key, value) in extra {
			let _ = write!(out, " {key}={value}");
		}
		out
	}
}

/// Normalizes a multi-line trace for single-line log ingestion by escaping
/// newlines and double quotes.
pub fn normalize_exception(trace: &str) -> String {
	trace.replace('\n', "\\n").replace('"', "\\\"")
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn log_builder_renders_context() {
		let builder = LogBuilder::new("t1", 100, 7, 2);
		assert_eq!(
			builder.build("Indexing watchdog - starting"),
			"Indexing watchdog - starting: tenant_id=t1 attempt=100 cc_pair=7 search_settings=2"
		);
		assert_eq!(
			builder.build_with("finished", &[("status", "succeeded".to_string())]),
			"finished: tenant_id=t1 attempt=100 cc_pair=7 search_settings=2 status=succeeded"
		);
	}

	#[test]
	fn exceptions_normalize_to_one_line() {
		assert_eq!(normalize_exception("a\nb \"c\""), "a\\nb \\\"c\\\"");
	}
}
