//! Support code for the `relay` binary.
//!
//! # Main types
//!
//! - [`agents::demo_registry`] — Registry of the nine demo agents.
//! - [`logging::init`] — `tracing-subscriber` setup from the `[logging]` section.

/// Demo agents.
pub mod agents;
/// Subscriber initialization.
pub mod logging;
