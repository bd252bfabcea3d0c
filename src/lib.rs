//! Client-side session and token lifecycle management.
//!
//! Three components, composed bottom-up:
//!
//! - [`store::TokenStore`], a persistent synchronous key-value accessor for
//!   credential fields, shared between application instances, with change
//!   notification.
//! - [`gateway::AuthGateway`], a thin network boundary over the remote
//!   authentication service (login, refresh, verify, logout).
//! - [`orchestrator::SessionOrchestrator`], the session state machine: it
//!   persists credentials, silently refreshes them ahead of expiry, ends
//!   idle or dead sessions, keeps multiple instances over one store
//!   consistent, and announces committed transitions on an event bus.

// Export modules
pub mod config;
pub mod error;
pub mod events;
pub mod gateway;
pub mod orchestrator;
pub mod store;
pub mod token;

pub use config::SessionConfig;
pub use error::{SessionError, SessionResult};
pub use events::{EventBus, EventBusStats, SessionEvent, SessionEventKind};
pub use gateway::{AuthGateway, HttpAuthGateway, LoginResponse, RefreshResponse};
pub use orchestrator::SessionOrchestrator;
pub use store::{FileTokenStore, MemoryTokenStore, StoreChange, TokenStore};
pub use token::{ActivitySignal, SessionPhase, SessionState, TokenData, UserProfile};

#[cfg(test)]
mod tests;
