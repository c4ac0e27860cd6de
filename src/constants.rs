//! Global constants used throughout the appdeploy codebase.
//!
//! Timeout durations, retry parameters, and cache tuning knobs that are
//! shared across modules. Defining them centrally keeps magic numbers
//! discoverable.

use std::time::Duration;

/// Timeout for acquiring a per-entry cache lock (15 minutes).
///
/// Populating an entry involves downloading and unpacking a potentially
/// large tarball while the lock is held, so waiters must be patient. The
/// timeout only bounds how long a waiter spins before giving up; it does
/// not bound the holder.
pub const CACHE_LOCK_TIMEOUT: Duration = Duration::from_secs(15 * 60);

/// Lower bound of the randomized sleep between lock acquisition attempts.
pub const LOCK_RETRY_MIN: Duration = Duration::from_secs(5);

/// Upper bound of the randomized sleep between lock acquisition attempts.
///
/// Uniform jitter in [`LOCK_RETRY_MIN`, `LOCK_RETRY_MAX`] spreads out
/// retries from invocations that started at the same moment.
pub const LOCK_RETRY_MAX: Duration = Duration::from_secs(10);

/// How many cache entries `appdeploy module` keeps after a successful
/// deployment. Older entries (by touch time) are trimmed.
pub const DEFAULT_CACHE_KEEP: usize = 20;

/// Timeout for `gcloud` invocations that only read state (version listing).
pub const GCLOUD_LIST_TIMEOUT: Duration = Duration::from_secs(120);

/// Prefix for transient archive and staging paths inside a cache entry.
pub const TMP_PREFIX: &str = "tmp_";

/// Prefix for entry directories that are scheduled for deletion.
pub const DEL_PREFIX: &str = "del_";
