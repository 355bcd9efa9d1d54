//! Test infrastructure for the courier pipeline.
//!
//! Provides in-memory queue environments, scripted doubles for the platform
//! API and the business router, and builders for realistic update payloads.

#![warn(missing_docs)]
#![forbid(unsafe_code)]

pub mod api;
pub mod env;
pub mod fixtures;
pub mod router;

pub use api::{RecordedCall, ScriptedApiClient};
pub use courier_core::{Clock, RealClock, TestClock};
pub use env::{fast_config, TestEnv};
pub use fixtures::{answer_callback, send_message, UpdateBuilder};
pub use router::RecordingRouter;
