//! Domain model module declarations.

pub mod log;
pub mod params;
pub mod session;
