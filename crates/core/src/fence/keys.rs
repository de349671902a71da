//! Builds the key names used by the fence protocol.
//!
//! All coordination keys live under a tenant prefix. The fence key itself is
//! the claim marker; every other key is a sibling addressed by the same
//! `<cc_pair>/<search_settings>` composite id.

/// The prefix shared by all indexing fence payload keys
pub const FENCE_PREFIX: &str = "connectorindexing_fence_";

/// The name of the membership set enumerating live fence keys
pub const ACTIVE_FENCES: &str = "active_fences";

fn tenant_key(tenant: &str, rest: &str) -> String {
	format!("tenant:{tenant}:{rest}")
}

/// The membership set holding the names of all live fences
pub fn active_fences_set(tenant: &str) -> String {
	tenant_key(tenant, ACTIVE_FENCES)
}

/// The fence payload key for a `(cc_pair, search_settings)` composite
pub fn fence(tenant: &str, cc_pair: i64, search_settings: i64) -> String {
	tenant_key(tenant, &format!("{FENCE_PREFIX}{cc_pair}/{search_settings}"))
}

/// The general attempt liveness signal
pub fn active(tenant: &str, cc_pair: i64, search_settings: i64) -> String {
	tenant_key(tenant, &format!("connectorindexing_active_{cc_pair}/{search_settings}"))
}

/// The watchdog liveness signal
pub fn watchdog_active(tenant: &str, cc_pair: i64, search_settings: i64) -> String {
	tenant_key(tenant, &format!("connectorindexing_watchdog_active_{cc_pair}/{search_settings}"))
}

/// The connector activity signal, renewed inside the fetch loop
pub fn connector_active(tenant: &str, cc_pair: i64, search_settings: i64) -> String {
	tenant_key(tenant, &format!("connectorindexing_connector_active_{cc_pair}/{search_settings}"))
}

/// The lock held by the fetch process for the duration of extraction
pub fn generator_lock(tenant: &str, cc_pair: i64, search_settings: i64) -> String {
	tenant_key(tenant, &format!("connectorindexing_generator_lock_{cc_pair}/{search_settings}"))
}

/// The lock serializing updates to the shared indexing state
pub fn filestore_lock(tenant: &str, cc_pair: i64, search_settings: i64) -> String {
	tenant_key(tenant, &format!("connectorindexing_filestore_lock_{cc_pair}/{search_settings}"))
}

/// The lock serializing row-level writes during batch finalization
pub fn db_lock(tenant: &str, cc_pair: i64, search_settings: i64) -> String {
	tenant_key(tenant, &format!("connectorindexing_db_lock_{cc_pair}/{search_settings}"))
}

/// The per-batch deduplication lock
pub fn batch_lock(tenant: &str, cc_pair: i64, search_settings: i64, batch_num: u64) -> String {
	tenant_key(
		tenant,
		&format!("connectorindexing_batch_lock_{cc_pair}/{search_settings}/{batch_num}"),
	)
}

/// The prefix under which all per-batch locks for a fence live
pub fn batch_lock_prefix(tenant: &str, cc_pair: i64, search_settings: i64) -> String {
	tenant_key(tenant, &format!("connectorindexing_batch_lock_{cc_pair}/{search_settings}/"))
}

/// The progress counter incremented by the fetcher
pub fn progress(tenant: &str, cc_pair: i64, search_settings: i64) -> String {
	tenant_key(tenant, &format!("connectorindexing_progress_{cc_pair}/{search_settings}"))
}

/// The single-assignment completion marker
pub fn completion(tenant: &str, cc_pair: i64, search_settings: i64) -> String {
	tenant_key(tenant, &format!("connectorindexing_completion_{cc_pair}/{search_settings}"))
}

/// The externally toggled termination signal for a specific task
pub fn terminate(tenant: &str, cc_pair: i64, search_settings: i64, task_id: &str) -> String {
	tenant_key(
		tenant,
		&format!("connectorindexing_terminate_{cc_pair}/{search_settings}_{task_id}"),
	)
}

/// The prefix under which all termination signals for a fence live
pub fn terminate_prefix(tenant: &str, cc_pair: i64, search_settings: i64) -> String {
	tenant_key(tenant, &format!("connectorindexing_terminate_{cc_pair}/{search_settings}_"))
}

/// The fence blocking a connector while its deletion is in progress
pub fn deletion_fence(tenant: &str, cc_pair: i64) -> String {
	tenant_key(tenant, &format!("connectordeletion_fence_{cc_pair}"))
}

/// The fence blocking a connector while a stop has been requested
pub fn stop_fence(tenant: &str, cc_pair: i64) -> String {
	tenant_key(tenant, &format!("connectorstop_fence_{cc_pair}"))
}

/// The lock held across a whole indexing beat tick
pub fn check_indexing_beat_lock(tenant: &str) -> String {
	tenant_key(tenant, "check_indexing_beat_lock")
}

/// The lock held across a whole checkpoint cleanup tick
pub fn check_checkpoint_cleanup_beat_lock(tenant: &str) -> String {
	tenant_key(tenant, "check_checkpoint_cleanup_beat_lock")
}

/// The signal suppressing the active-fence lookup table rebuild
pub fn block_build_fence_lookup_table(tenant: &str) -> String {
	tenant_key(tenant, "block_build_fence_lookup_table")
}

/// The signal suppressing fence validation
pub fn block_validate_indexing_fences(tenant: &str) -> String {
	tenant_key(tenant, "block_validate_indexing_fences")
}

/// The prefix under which every key of a tenant lives
pub fn tenant_prefix(tenant: &str) -> String {
	format!("tenant:{tenant}:")
}

/// Checks whether a fully qualified key is an indexing fence payload key
pub fn is_fence(tenant: &str, key: &str) -> bool {
	match key.strip_prefix(&tenant_prefix(tenant)) {
		Some(rest) => rest.starts_with(FENCE_PREFIX),
		None => false,
	}
}

/// Extracts the `(cc_pair, search_settings)` composite from a fence key
pub fn parse_fence(tenant: &str, key: &str) -> Option<(i64, i64)> {
	let rest = key.strip_prefix(&tenant_prefix(tenant))?.strip_prefix(FENCE_PREFIX)?;
	let (cc, ss) = rest.split_once('/')?;
	Some((cc.parse().ok()?, ss.parse().ok()?))
}
