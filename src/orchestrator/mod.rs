//! Session orchestration modules.
//!
//! Covers process pair supervision, coordinator readiness detection,
//! output multiplexing, the shutdown protocol and the session state
//! machine that sequences them.

pub mod cleanup;
pub mod codec;
pub mod multiplexer;
pub mod readiness;
pub mod session;
pub mod supervisor;

pub use session::{LaunchTrace, Orchestrator, Session};
