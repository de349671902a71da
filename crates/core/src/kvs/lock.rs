use super::api::Store;
use crate::err::Error;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

const TARGET: &str = "trawler::core::kvs::lock";

/// How often a blocking acquisition retries the lock
const ACQUIRE_RETRY_INTERVAL: Duration = Duration::from_millis(100);

/// A named, lease-bound distributed mutex over the shared key-value store.
///
/// The holder is identified by a random token, so ownership checks and
/// releases are safe against a lapsed lease being claimed by another process.
/// Critical sections are expected to call [`Lock::reacquire`] before each
/// long sub-step so the lease never outlives the work.
pub struct Lock {
	store: Arc<dyn Store>,
	key: String,
	token: String,
	ttl: Duration,
}

impl Lock {
	/// Creates a new lock handle. No key is claimed until acquisition.
	pub fn new(store: Arc<dyn Store>, key: impl Into<String>, ttl: Duration) -> Self {
		Self {
			store,
			key: key.into(),
			token: Uuid::new_v4().to_string(),
			ttl,
		}
	}

	/// The key this lock is held under
	pub fn key(&self) -> &str {
		&self.key
	}

	/// Attempts to acquire the lock without blocking
	pub async fn acquire(&self) -> Result<bool, Error> {
		self.store.put_nx(&self.key, self.token.clone().into_bytes(), Some(self.ttl)).await
	}

	/// Attempts to acquire the lock, blocking up to the given timeout
	pub async fn acquire_timeout(&self, timeout: Duration) -> Result<bool, Error> {
		let start = tokio::time::Instant::now();
		loop {
			if self.acquire().await? {
				return Ok(true);
			}
			if start.elapsed() >= timeout {
				return Ok(false);
			}
			tokio::time::sleep(ACQUIRE_RETRY_INTERVAL).await;
		}
	}

	/// Extends the lease on a held lock back to its full duration.
	/// Fails with [`Error::LockNotOwned`] if the lease has lapsed and the key
	/// is gone or now held by another process.
	pub async fn reacquire(&self) -> Result<(), Error> {
		let extended = self.store.expire_cas(&self.key, self.token.as_bytes(), self.ttl).await?;
		if !extended {
			return Err(Error::LockNotOwned(self.key.clone()));
		}
		Ok(())
	}

	/// Checks whether this handle still owns the lock
	pub async fn owned(&self) -> Result<bool, Error> {
		Ok(match self.store.get(&self.key).await? {
			Some(v) => v == self.token.as_bytes(),
			None => false,
		})
	}

	/// Releases the lock if owned. Releasing a lock which is no longer owned
	/// is a no-op with a diagnostic, so cleanup paths can call this blindly.
	pub async fn release(&self) -> Result<(), Error> {
		let released = self.store.del_cas(&self.key, self.token.as_bytes()).await?;
		if !released {
			warn!(target: TARGET, key = %self.key, "Releasing a lock which is not owned");
		}
		Ok(())
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::kvs::clock::{Clock, Timestamp};
	use crate::kvs::mem;

	fn store() -> (Arc<dyn Store>, Clock) {
		let clock = Clock::fixed(Timestamp::from(0));
		(Arc::new(mem::Datastore::new(clock.clone())), clock)
	}

	#[tokio::test]
	async fn mutual_exclusion() {
		let (store, _) = store();
		let a = Lock::new(store.clone(), "lock:test", Duration::from_secs(60));
		let b = Lock::new(store.clone(), "lock:test", Duration::from_secs(60));
		assert!(a.acquire().await.unwrap());
		assert!(!b.acquire().await.unwrap());
		assert!(a.owned().await.unwrap());
		assert!(!b.owned().await.unwrap());
		a.release().await.unwrap();
		assert!(b.acquire().await.unwrap());
	}

	#[tokio::test]
	async fn reacquire_extends_the_lease() {
		let (store, clock) = store();
		let lock = Lock::new(store.clone(), "lock:test", Duration::from_secs(10));
		assert!(lock.acquire().await.unwrap());
		clock.advance(Duration::from_secs(8));
		lock.reacquire().await.unwrap();
		clock.advance(Duration::from_secs(8));
		// without the reacquire this lease would have lapsed at t=10s
		assert!(lock.owned().await.unwrap());
	}

	#[tokio::test]
	async fn reacquire_after_lapse_fails() {
		let (store, clock) = store();
		let lock = Lock::new(store.clone(), "lock:test", Duration::from_secs(10));
		assert!(lock.acquire().await.unwrap());
		clock.advance(Duration::from_secs(11));
		assert!(matches!(lock.reacquire().await, Err(Error::LockNotOwned(_))));
	}

	#[tokio::test]
	async fn release_not_owned_is_a_noop() {
		let (store, _) = store();
		let a = Lock::new(store.clone(), "lock:test", Duration::from_secs(60));
		let b = Lock::new(store.clone(), "lock:test", Duration::from_secs(60));
		assert!(a.acquire().await.unwrap());
		b.release().await.unwrap();
		// the owner's claim is untouched
		assert!(a.owned().await.unwrap());
	}
}
