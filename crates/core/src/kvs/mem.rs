#![cfg(feature = "kv-mem")]

use super::api::{KeyTtl, Store};
use super::clock::{Clock, Timestamp};
use crate::err::Error;
use async_trait::async_trait;
use dashmap::DashMap;
use std::collections::BTreeSet;
use std::time::Duration;

#[derive(Clone)]
struct Entry {
	val: Vec<u8>,
	expires: Option<Timestamp>,
}

impl Entry {
	fn live(&self, now: Timestamp) -> bool {
		match self.expires {
			Some(at) => now < at,
			None => true,
		}
	}
}

/// An in-process key-value store used for tests and single-node deployments.
///
/// Expiration is evaluated lazily against the injected clock, so tests can
/// drive lease expiry deterministically with a manually driven clock.
pub struct Datastore {
	keys: DashMap<String, Entry>,
	sets: DashMap<String, BTreeSet<String>>,
	clock: Clock,
}

impl Datastore {
	pub fn new(clock: Clock) -> Self {
		Self {
			keys: DashMap::new(),
			sets: DashMap::new(),
			clock,
		}
	}

	fn expiry(&self, ttl: Option<Duration>) -> Option<Timestamp> {
		ttl.map(|d| self.clock.now() + d)
	}
}

#[async_trait]
impl Store for Datastore {
	async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, Error> {
		let now = self.clock.now();
		// the read guard must drop before the expired entry is removed
		let expired = match self.keys.get(key) {
			Some(e) if e.live(now) => return Ok(Some(e.val.clone())),
			Some(_) => true,
			None => false,
		};
		if expired {
			self.keys.remove(key);
		}
		Ok(None)
	}

	async fn put(&self, key: &str, val: Vec<u8>, ttl: Option<Duration>) -> Result<(), Error> {
		let expires = self.expiry(ttl);
		self.keys.insert(
			key.to_string(),
			Entry {
				val,
				expires,
			},
		);
		Ok(())
	}

	async fn put_nx(&self, key: &str, val: Vec<u8>, ttl: Option<Duration>) -> Result<bool, Error> {
		let now = self.clock.now();
		let expires = self.expiry(ttl);
		let inserted = match self.keys.entry(key.to_string()) {
			dashmap::mapref::entry::Entry::Occupied(mut occupied) => {
				// an expired entry can be claimed as if absent
				if occupied.get().live(now) {
					false
				} else {
					occupied.insert(Entry {
						val,
						expires,
					});
					true
				}
			}
			dashmap::mapref::entry::Entry::Vacant(vacant) => {
				vacant.insert(Entry {
					val,
					expires,
				});
				true
			}
		};
		Ok(inserted)
	}

	async fn del(&self, key: &str) -> Result<(), Error> {
		self.keys.remove(key);
		Ok(())
	}

	async fn del_cas(&self, key: &str, expected: &[u8]) -> Result<bool, Error> {
		let now = self.clock.now();
		let removed = self
			.keys
			.remove_if(key, |_, e| e.live(now) && e.val == expected)
			.is_some();
		Ok(removed)
	}

	async fn expire_cas(&self, key: &str, expected: &[u8], ttl: Duration) -> Result<bool, Error> {
		let now = self.clock.now();
		match self.keys.get_mut(key) {
			Some(mut e) if e.live(now) && e.val == expected => {
				e.expires = Some(now + ttl);
				Ok(true)
			}
			_ => Ok(false),
		}
	}

	async fn exists(&self, key: &str) -> Result<bool, Error> {
		Ok(self.get(key).await?.is_some())
	}

	async fn ttl(&self, key: &str) -> Result<KeyTtl, Error> {
		let now = self.clock.now();
		match self.keys.get(key) {
			Some(e) if e.live(now) => match e.expires {
				Some(at) => Ok(KeyTtl::Expires(at - now)),
				None => Ok(KeyTtl::Persistent),
			},
			_ => Ok(KeyTtl::Missing),
		}
	}

	async fn incr(&self, key: &str, by: i64) -> Result<i64, Error> {
		let now = self.clock.now();
		let mut entry = self.keys.entry(key.to_string()).or_insert(Entry {
			val: b"0".to_vec(),
			expires: None,
		});
		if !entry.live(now) {
			*entry = Entry {
				val: b"0".to_vec(),
				expires: None,
			};
		}
		let current = std::str::from_utf8(&entry.val)
			.ok()
			.and_then(|s| s.parse::<i64>().ok())
			.ok_or_else(|| Error::Kv(format!("key '{key}' does not hold an integer")))?;
		let next = current + by;
		entry.val = next.to_string().into_bytes();
		Ok(next)
	}

	async fn sadd(&self, set: &str, member: &str) -> Result<(), Error> {
		self.sets.entry(set.to_string()).or_default().insert(member.to_string());
		Ok(())
	}

	async fn srem(&self, set: &str, member: &str) -> Result<(), Error> {
		if let Some(mut s) = self.sets.get_mut(set) {
			s.remove(member);
		}
		Ok(())
	}

	async fn smembers(&self, set: &str) -> Result<Vec<String>, Error> {
		Ok(match self.sets.get(set) {
			Some(s) => s.iter().cloned().collect(),
			None => Vec::new(),
		})
	}

	async fn sismember(&self, set: &str, member: &str) -> Result<bool, Error> {
		Ok(self.sets.get(set).map(|s| s.contains(member)).unwrap_or(false))
	}

	async fn scan(&self, prefix: &str) -> Result<Vec<String>, Error> {
		let now = self.clock.now();
		let mut keys: Vec<String> = self
			.keys
			.iter()
			.filter(|e| e.key().starts_with(prefix) && e.value().live(now))
			.map(|e| e.key().clone())
			.collect();
		keys.sort();
		Ok(keys)
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	fn store() -> (Datastore, Clock) {
		let clock = Clock::fixed(Timestamp::from(1_000));
		(Datastore::new(clock.clone()), clock)
	}

	#[tokio::test]
	async fn put_get_del() {
		let (ds, _) = store();
		ds.put("a", b"1".to_vec(), None).await.unwrap();
		assert_eq!(ds.get("a").await.unwrap(), Some(b"1".to_vec()));
		ds.del("a").await.unwrap();
		assert_eq!(ds.get("a").await.unwrap(), None);
	}

	#[tokio::test]
	async fn leases_expire() {
		let (ds, clock) = store();
		ds.put("a", b"1".to_vec(), Some(Duration::from_secs(5))).await.unwrap();
		assert_eq!(ds.ttl("a").await.unwrap(), KeyTtl::Expires(Duration::from_secs(5)));
		clock.advance(Duration::from_secs(6));
		assert_eq!(ds.ttl("a").await.unwrap(), KeyTtl::Missing);
		assert_eq!(ds.get("a").await.unwrap(), None);
	}

	#[tokio::test]
	async fn put_nx_respects_live_keys() {
		let (ds, clock) = store();
		assert!(ds.put_nx("a", b"1".to_vec(), Some(Duration::from_secs(5))).await.unwrap());
		assert!(!ds.put_nx("a", b"2".to_vec(), None).await.unwrap());
		// an expired key can be claimed again
		clock.advance(Duration::from_secs(6));
		assert!(ds.put_nx("a", b"3".to_vec(), None).await.unwrap());
		assert_eq!(ds.get("a").await.unwrap(), Some(b"3".to_vec()));
	}

	#[tokio::test]
	async fn compare_and_swap_operations() {
		let (ds, _) = store();
		ds.put("a", b"tok".to_vec(), Some(Duration::from_secs(5))).await.unwrap();
		assert!(!ds.del_cas("a", b"other").await.unwrap());
		assert!(ds.expire_cas("a", b"tok", Duration::from_secs(60)).await.unwrap());
		assert!(ds.del_cas("a", b"tok").await.unwrap());
		assert!(!ds.exists("a").await.unwrap());
	}

	#[tokio::test]
	async fn counters_and_sets() {
		let (ds, _) = store();
		assert_eq!(ds.incr("n", 2).await.unwrap(), 2);
		assert_eq!(ds.incr("n", 3).await.unwrap(), 5);
		ds.sadd("s", "x").await.unwrap();
		ds.sadd("s", "y").await.unwrap();
		assert!(ds.sismember("s", "x").await.unwrap());
		ds.srem("s", "x").await.unwrap();
		assert_eq!(ds.smembers("s").await.unwrap(), vec!["y".to_string()]);
	}

	#[tokio::test]
	async fn scan_filters_by_prefix() {
		let (ds, _) = store();
		ds.put("p:a", b"1".to_vec(), None).await.unwrap();
		ds.put("p:b", b"1".to_vec(), None).await.unwrap();
		ds.put("q:c", b"1".to_vec(), None).await.unwrap();
		assert_eq!(ds.scan("p:").await.unwrap(), vec!["p:a".to_string(), "p:b".to_string()]);
	}
}
