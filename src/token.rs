use std::collections::BTreeMap;

use chrono::{DateTime, Duration, TimeZone, Utc};
use serde::{Deserialize, Serialize};

/// Profile of the signed-in user, as returned by the verify endpoint.
///
/// Owned exclusively by the session credentials: replaced wholesale on every
/// successful verify or refresh, never partially mutated.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct UserProfile {
    pub id: String,
    pub username: String,
    pub role: String,
    /// Keyed by permission name. A `BTreeMap` so two equal profiles always
    /// encode to the same JSON, which lets the store suppress no-op writes.
    #[serde(default)]
    pub permissions: BTreeMap<String, bool>,
}

/// The persisted credential record for one session.
///
/// Access and refresh tokens are both present or the record does not exist
/// at all. `expires_at` never decreases across successive refreshes of the
/// same session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenData {
    /// Short-lived credential sent with each authenticated request.
    pub access_token: String,
    /// Longer-lived credential used solely to obtain new access tokens.
    pub refresh_token: String,
    /// When the access token expires.
    pub expires_at: DateTime<Utc>,
    /// Profile captured at the last verify; absent only for records written
    /// before a verify completed.
    pub user: Option<UserProfile>,
}

impl TokenData {
    pub fn new(access_token: String, refresh_token: String, expires_at: DateTime<Utc>) -> Self {
        Self {
            access_token,
            refresh_token,
            expires_at,
            user: None,
        }
    }

    /// Check if the access token is expired.
    pub fn is_expired(&self) -> bool {
        self.expires_at <= Utc::now()
    }

    /// Check if the access token expires within the given window.
    pub fn expires_within(&self, window: Duration) -> bool {
        self.expires_at - Utc::now() < window
    }

    /// The persisted representation of `expires_at` (decimal epoch ms).
    pub fn expires_at_millis(&self) -> i64 {
        self.expires_at.timestamp_millis()
    }
}

/// Parse the persisted epoch-ms representation of an expiry timestamp.
pub fn expiry_from_millis(millis: i64) -> Option<DateTime<Utc>> {
    Utc.timestamp_millis_opt(millis).single()
}

/// Derived per-instance session state. Never persisted; rebuilt from the
/// token store (or its absence) on every init.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionState {
    pub is_authenticated: bool,
    pub user: Option<UserProfile>,
    pub is_loading: bool,
    pub error: Option<String>,
    /// Last observed user interaction, driving the inactivity timeout.
    pub last_activity: DateTime<Utc>,
}

impl Default for SessionState {
    fn default() -> Self {
        Self {
            is_authenticated: false,
            user: None,
            is_loading: false,
            error: None,
            last_activity: Utc::now(),
        }
    }
}

/// Lifecycle phase of a session orchestrator instance.
///
/// `Uninitialized → Verifying → {Authenticated, Refreshing, LoggedOut}`;
/// `Refreshing` returns to `Authenticated` or falls to `LoggedOut`;
/// `Destroyed` is terminal and reached only through explicit `destroy()`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionPhase {
    Uninitialized,
    Verifying,
    Authenticated,
    Refreshing,
    LoggedOut,
    Destroyed,
}

/// The fixed set of user-interaction signals that reset the inactivity
/// clock. Any UI surface may report these; the orchestrator uses them for
/// nothing else.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActivitySignal {
    PointerDown,
    PointerMove,
    KeyPress,
    Scroll,
    TouchStart,
    Click,
}
