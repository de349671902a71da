use crate::err::Error;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// The remaining lifetime of a key, as reported by the store.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub enum KeyTtl {
	/// The key does not exist
	Missing,
	/// The key exists and never expires
	Persistent,
	/// The key exists and expires after the given duration
	Expires(Duration),
}

impl KeyTtl {
	/// Renders the TTL in whole seconds, with negative values for absence.
	/// This matches the lease observations made by the watchdog.
	pub fn as_secs(&self) -> i64 {
		match self {
			KeyTtl::Missing => -1,
			KeyTtl::Persistent => i64::MAX,
			KeyTtl::Expires(d) => d.as_secs() as i64,
		}
	}
}

/// The shared key-value store used for all cross-process coordination.
///
/// Implementations must apply expiration before answering reads, and must
/// make the compare-and-swap style operations atomic with respect to other
/// callers of the same store. String keys are namespaced by the caller.
#[async_trait]
pub trait Store: Send + Sync + 'static {
	/// Fetches a key, if it exists and has not expired
	async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, Error>;
	/// Writes a key, with an optional lease duration
	async fn put(&self, key: &str, val: Vec<u8>, ttl: Option<Duration>) -> Result<(), Error>;
	/// Writes a key only if it is absent, returning whether the write happened
	async fn put_nx(&self, key: &str, val: Vec<u8>, ttl: Option<Duration>) -> Result<bool, Error>;
	/// Removes a key
	async fn del(&self, key: &str) -> Result<(), Error>;
	/// Removes a key only if it currently holds the expected value
	async fn del_cas(&self, key: &str, expected: &[u8]) -> Result<bool, Error>;
	/// Extends the lease of a key only if it currently holds the expected value
	async fn expire_cas(&self, key: &str, expected: &[u8], ttl: Duration) -> Result<bool, Error>;
	/// Checks whether a key exists
	async fn exists(&self, key: &str) -> Result<bool, Error>;
	/// Reports the remaining lease of a key
	async fn ttl(&self, key: &str) -> Result<KeyTtl, Error>;
	/// Atomically increments an integer key, creating it at zero if absent
	async fn incr(&self, key: &str, by: i64) -> Result<i64, Error>;
	/// Adds a member to a set
	async fn sadd(&self, set: &str, member: &str) -> Result<(), Error>;
	/// Removes a member from a set
	async fn srem(&self, set: &str, member: &str) -> Result<(), Error>;
	/// Returns all members of a set
	async fn smembers(&self, set: &str) -> Result<Vec<String>, Error>;
	/// Checks whether a member belongs to a set
	async fn sismember(&self, set: &str, member: &str) -> Result<bool, Error>;
	/// Returns a snapshot of all live keys starting with the given prefix
	async fn scan(&self, prefix: &str) -> Result<Vec<String>, Error>;
}
