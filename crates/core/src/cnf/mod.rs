use once_cell::sync::Lazy;

/// The publicly visible name of the server
pub const SERVER_NAME: &str = "Trawler";

/// How long the beat lock may be held before its lease lapses, in seconds
pub static BEAT_LOCK_TTL: Lazy<u64> = lazy_env_parse!("TRAWLER_BEAT_LOCK_TTL", u64, 120);

/// How long any indexing lock may be held before its lease lapses, in seconds
pub static INDEXING_LOCK_TTL: Lazy<u64> = lazy_env_parse!("TRAWLER_INDEXING_LOCK_TTL", u64, 3600);

/// How long a fetch task will wait for its fence to become ready, in seconds
pub static FENCE_READINESS_TIMEOUT: Lazy<u64> =
	lazy_env_parse!("TRAWLER_FENCE_READINESS_TIMEOUT", u64, 60);

/// The polling interval used while waiting for fence readiness, in seconds
pub const FENCE_WAIT_POLL_INTERVAL: u64 = 1;

/// The lease duration of the general attempt liveness signal, in seconds
pub static ACTIVE_SIGNAL_TTL: Lazy<u64> = lazy_env_parse!("TRAWLER_ACTIVE_SIGNAL_TTL", u64, 3600);

/// The lease duration of the watchdog liveness signal, in seconds
pub static WATCHDOG_SIGNAL_TTL: Lazy<u64> =
	lazy_env_parse!("TRAWLER_WATCHDOG_SIGNAL_TTL", u64, 300);

/// The lease duration of the connector activity signal, in seconds.
/// Expiry of this lease is what the watchdog treats as an activity timeout.
pub static CONNECTOR_ACTIVITY_TIMEOUT: Lazy<u64> =
	lazy_env_parse!("TRAWLER_CONNECTOR_ACTIVITY_TIMEOUT", u64, 3600);

/// The lease duration of the termination signal, in seconds
pub static TERMINATE_SIGNAL_TTL: Lazy<u64> =
	lazy_env_parse!("TRAWLER_TERMINATE_SIGNAL_TTL", u64, 600);

/// How often the watchdog polls the spawned process and its signals, in seconds
pub static SUPERVISOR_POLL_INTERVAL: Lazy<u64> =
	lazy_env_parse!("TRAWLER_SUPERVISOR_POLL_INTERVAL", u64, 5);

/// How long the watchdog waits for a spawned process to leave the starting
/// state before giving up, in seconds
pub static SPAWN_LIVENESS_GRACE: Lazy<u64> = lazy_env_parse!("TRAWLER_SPAWN_LIVENESS_GRACE", u64, 15);

/// How often a memory sample is emitted for the spawned process, in seconds
pub static MEMORY_SAMPLE_PERIOD: Lazy<u64> = lazy_env_parse!("TRAWLER_MEMORY_SAMPLE_PERIOD", u64, 60);

/// The base expiry of the fence validation block signal, in seconds
pub static FENCE_VALIDATION_INTERVAL: Lazy<u64> =
	lazy_env_parse!("TRAWLER_FENCE_VALIDATION_INTERVAL", u64, 60);

/// Number of failures beyond which an attempt is considered for abortion
pub static FAILURE_COUNT_THRESHOLD: Lazy<u64> =
	lazy_env_parse!("TRAWLER_FAILURE_COUNT_THRESHOLD", u64, 3);

/// Ratio of failures to processed documents beyond which an attempt is aborted
pub static FAILURE_RATIO_THRESHOLD: Lazy<f64> =
	lazy_env_parse!("TRAWLER_FAILURE_RATIO_THRESHOLD", f64, 0.1);

/// How many consecutive failed attempts mark a pair as repeatedly erroring
pub static REPEATED_ERROR_STATE_THRESHOLD: Lazy<usize> =
	lazy_env_parse!("TRAWLER_REPEATED_ERROR_STATE_THRESHOLD", usize, 3);

/// How long finished attempts keep their checkpoints before the sweep, in days
pub static CHECKPOINT_RETENTION_DAYS: Lazy<u64> =
	lazy_env_parse!("TRAWLER_CHECKPOINT_RETENTION_DAYS", u64, 7);

/// Maximum characters preserved from a connector exception message
pub const EXCEPTION_MESSAGE_LIMIT: usize = 1024;

/// Maximum lines of child process standard error retained for diagnostics
pub const STDERR_TAIL_LINES: usize = 50;
