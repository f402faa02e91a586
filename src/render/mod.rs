//! Engine input rendering.
//!
//! The orchestrator treats rendering as one fallible step that must finish
//! before the coordinator is launched. [`ConfigRenderer`] is the seam;
//! [`ipi::IpiInputRenderer`] is the stock implementation for the i-PI +
//! LAMMPS water model.

pub mod ipi;

use std::io::Write;
use std::path::{Path, PathBuf};

use tempfile::NamedTempFile;

use crate::models::params::SimulationParams;
use crate::{AppError, Result};

/// Everything a renderer may read.
#[derive(Debug, Clone, Copy)]
pub struct RenderContext<'a> {
    /// Parameter snapshot of the session being started.
    pub params: &'a SimulationParams,
    /// The session's working directory (already created).
    pub workdir: &'a Path,
    /// Directory the engines are launched in.
    pub staging_dir: &'a Path,
    /// Socket name both engines rendezvous on.
    pub socket_name: &'a str,
}

/// Produces the engine configuration files for a session.
pub trait ConfigRenderer: Send + Sync {
    /// Write every file the engines need.
    ///
    /// Returns the paths written, in order.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Render` if any file cannot be produced.
    fn render(&self, ctx: &RenderContext<'_>) -> Result<Vec<PathBuf>>;
}

/// Write `content` to `path` atomically through a sibling temporary file.
///
/// # Errors
///
/// Returns `AppError::Render` on any I/O failure.
pub fn write_atomic(path: &Path, content: &str) -> Result<PathBuf> {
    let parent = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));

    std::fs::create_dir_all(parent).map_err(|err| {
        AppError::Render(format!("failed to create {}: {err}", parent.display()))
    })?;

    let mut tmp = NamedTempFile::new_in(parent)
        .map_err(|err| AppError::Render(format!("failed to create temporary file: {err}")))?;

    tmp.write_all(content.as_bytes())
        .map_err(|err| AppError::Render(format!("failed to write temporary file: {err}")))?;

    tmp.persist(path).map_err(|err| {
        AppError::Render(format!("failed to persist {}: {err}", path.display()))
    })?;

    Ok(path.to_path_buf())
}
