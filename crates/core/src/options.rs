use std::time::Duration;

/// Configuration for the orchestrator runtime behaviour.
/// The defaults are optimal so please only modify these if you know deliberately why you are modifying them.
#[derive(Clone, Copy, Debug)]
pub struct EngineOptions {
	/// The interval between beat ticks for this process
	pub tick_interval: Duration,
	/// Whether this deployment hosts multiple tenants
	pub multi_tenant: bool,
	/// The multiplier applied to validation intervals in multi-tenant mode
	pub beat_multiplier: f64,
	/// How often the active-fence lookup table is rebuilt from a full scan
	pub fence_lookup_rebuild_interval: Duration,
}

impl Default for EngineOptions {
	fn default() -> Self {
		Self {
			tick_interval: Duration::from_secs(15),
			multi_tenant: false,
			beat_multiplier: 8.0,
			fence_lookup_rebuild_interval: Duration::from_secs(600),
		}
	}
}

impl EngineOptions {
	pub fn with_tick_interval(mut self, interval: Duration) -> Self {
		self.tick_interval = interval;
		self
	}

	pub fn with_multi_tenant(mut self, multi_tenant: bool) -> Self {
		self.multi_tenant = multi_tenant;
		self
	}

	pub fn with_beat_multiplier(mut self, multiplier: f64) -> Self {
		self.beat_multiplier = multiplier;
		self
	}

	pub fn with_fence_lookup_rebuild_interval(mut self, interval: Duration) -> Self {
		self.fence_lookup_rebuild_interval = interval;
		self
	}
}
