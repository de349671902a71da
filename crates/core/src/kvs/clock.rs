use serde::{Deserialize, Serialize};
use std::ops::{Add, Sub};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// A millisecond-precision instant used for all lease and liveness
/// arithmetic.
///
/// Leases are compared against timestamps produced by a single clock per
/// process, never across processes, so no cross-node synchronisation is
/// assumed.
#[derive(
	Clone, Copy, Debug, Default, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize,
)]
#[non_exhaustive]
pub struct Timestamp {
	pub value: u64,
}

impl From<u64> for Timestamp {
	fn from(ts: u64) -> Self {
		Timestamp {
			value: ts,
		}
	}
}

impl Add<Duration> for Timestamp {
	type Output = Timestamp;
	fn add(self, rhs: Duration) -> Timestamp {
		Timestamp {
			value: self.value.saturating_add(rhs.as_millis() as u64),
		}
	}
}

impl Sub<Timestamp> for Timestamp {
	type Output = Duration;
	fn sub(self, rhs: Timestamp) -> Duration {
		Duration::from_millis(self.value.saturating_sub(rhs.value))
	}
}

impl Timestamp {
	/// Renders the elapsed time since an earlier timestamp in seconds
	pub fn elapsed_secs(self, since: Timestamp) -> f64 {
		(self - since).as_secs_f64()
	}
}

/// The time source every lease computation reads.
///
/// Cloning hands out another handle on the same source, so a test can keep
/// one handle to drive time while the code under test reads through its own.
#[derive(Clone)]
pub struct Clock {
	source: Source,
}

#[derive(Clone)]
enum Source {
	/// System wall time
	System,
	/// Manually driven time, shared between all handles
	Manual(Arc<AtomicU64>),
}

impl Clock {
	/// A clock reading system wall time
	pub fn system() -> Self {
		Self {
			source: Source::System,
		}
	}

	/// A manually driven clock starting at the given instant, for tests
	pub fn fixed(start: Timestamp) -> Self {
		Self {
			source: Source::Manual(Arc::new(AtomicU64::new(start.value))),
		}
	}

	/// The current instant
	pub fn now(&self) -> Timestamp {
		match &self.source {
			Source::System => match SystemTime::now().duration_since(UNIX_EPOCH) {
				Ok(since_epoch) => Timestamp::from(since_epoch.as_millis() as u64),
				Err(error) => panic!("system clock is before the epoch: {error}"),
			},
			Source::Manual(millis) => Timestamp::from(millis.load(Ordering::Acquire)),
		}
	}

	/// Moves a manually driven clock forward. Has no effect on a system clock.
	pub fn advance(&self, by: Duration) {
		if let Source::Manual(millis) = &self.source {
			millis.fetch_add(by.as_millis() as u64, Ordering::AcqRel);
		}
	}

	/// Pins a manually driven clock to an instant. Has no effect on a system
	/// clock.
	pub fn set(&self, to: Timestamp) {
		if let Source::Manual(millis) = &self.source {
			millis.store(to.value, Ordering::Release);
		}
	}
}

impl Default for Clock {
	fn default() -> Self {
		Self::system()
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn system_clock_reads() {
		let clock = Clock::system();
		assert!(clock.now().value > 0);
	}

	#[test]
	fn manual_handles_share_one_source() {
		let driver = Clock::fixed(Timestamp::from(1_000));
		let reader = driver.clone();
		driver.advance(Duration::from_secs(5));
		assert_eq!(reader.now(), Timestamp::from(6_000));
		driver.set(Timestamp::from(500));
		assert_eq!(reader.now(), Timestamp::from(500));
	}

	#[test]
	fn advancing_a_system_clock_is_a_noop() {
		let clock = Clock::system();
		let before = clock.now();
		clock.advance(Duration::from_secs(3600));
		// still within a sane bound of real time
		assert!(clock.now() - before < Duration::from_secs(60));
	}

	#[test]
	fn timestamp_arithmetic() {
		let t0 = Timestamp::from(10_000);
		let t1 = t0 + Duration::from_secs(2);
		assert_eq!(t1.value, 12_000);
		assert_eq!(t1 - t0, Duration::from_secs(2));
		// subtraction never goes below zero
		assert_eq!(t0 - t1, Duration::ZERO);
	}
}
