//! Key rotation schedule
//!
//! Pure helpers deciding when the active payload key is due for rotation.
//! The store owns the rotation protocol itself (deactivate, generate,
//! prune); this module only answers scheduling questions so the policy is
//! trivially testable.

use chrono::{DateTime, Duration, Utc};

/// How long a key stays active before rotation is due
pub const ROTATION_PERIOD_DAYS: i64 = 90;

/// Historical inactive keys kept loaded for decrypting older payloads.
/// Anything beyond this bound is pruned after a successful rotation.
pub const MAX_RETAINED_KEYS: usize = 5;

/// True when `now - created_at` has reached the rotation period
pub fn should_rotate_at(created_at: DateTime<Utc>, now: DateTime<Utc>) -> bool {
    now - created_at >= Duration::days(ROTATION_PERIOD_DAYS)
}

/// True when the key created at `created_at` is due for rotation now
pub fn should_rotate(created_at: DateTime<Utc>) -> bool {
    should_rotate_at(created_at, Utc::now())
}

/// The instant rotation becomes due for a key created at `created_at`
pub fn next_rotation_date(created_at: DateTime<Utc>) -> DateTime<Utc> {
    created_at + Duration::days(ROTATION_PERIOD_DAYS)
}
