use std::time::Duration;

/// Interval between periodic refresh checks.
const REFRESH_CHECK_INTERVAL_SECS: u64 = 300; // 5 minutes
/// Refresh the access token when it expires within this window.
const REFRESH_AHEAD_SECS: u64 = 1800; // 30 minutes
/// End the session after this long without user interaction.
const INACTIVITY_TIMEOUT_SECS: u64 = 1800; // 30 minutes
/// Interval between inactivity checks.
const INACTIVITY_CHECK_INTERVAL_SECS: u64 = 30;
/// Lifetime assumed for an access token when the login/refresh response
/// carries no expiry of its own.
const ASSUMED_TOKEN_TTL_SECS: u64 = 3600; // 1 hour
/// Default capacity of the session event channel.
const EVENT_CAPACITY: usize = 64;

/// Timing and capacity knobs for a [`SessionOrchestrator`].
///
/// Production values come from `Default`; tests shrink the intervals to
/// drive the background tasks quickly.
///
/// [`SessionOrchestrator`]: crate::orchestrator::SessionOrchestrator
#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub refresh_check_interval: Duration,
    pub refresh_ahead: Duration,
    pub inactivity_timeout: Duration,
    pub inactivity_check_interval: Duration,
    pub assumed_token_ttl: Duration,
    pub event_capacity: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            refresh_check_interval: Duration::from_secs(REFRESH_CHECK_INTERVAL_SECS),
            refresh_ahead: Duration::from_secs(REFRESH_AHEAD_SECS),
            inactivity_timeout: Duration::from_secs(INACTIVITY_TIMEOUT_SECS),
            inactivity_check_interval: Duration::from_secs(INACTIVITY_CHECK_INTERVAL_SECS),
            assumed_token_ttl: Duration::from_secs(ASSUMED_TOKEN_TTL_SECS),
            event_capacity: EVENT_CAPACITY,
        }
    }
}
