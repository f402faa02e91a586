#![forbid(unsafe_code)]

//! Supervises an i-PI coordinator and a LAMMPS force worker as one
//! simulation session: readiness handshake over a unix socket file,
//! merged output log, and guaranteed cleanup.

pub mod config;
pub mod errors;
pub mod models;
pub mod orchestrator;
pub mod render;

pub use config::SupervisorConfig;
pub use errors::{AppError, Result};
