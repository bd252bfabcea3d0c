//! Unit tests for core sessionguard modules
//!
//! Orchestrator behavior is covered by the integration tests under
//! `tests/integration/`; these modules cover the leaf components.
