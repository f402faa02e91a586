//! Simulation parameter snapshot captured when a session starts.

use std::fmt::{Display, Formatter};
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::{AppError, Result};

/// Ensemble integrated by the coordinator.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum DynamicsMode {
    /// Constant particle number, volume and temperature.
    #[default]
    Nvt,
    /// Constant particle number, pressure and temperature.
    Npt,
    /// Microcanonical.
    Nve,
}

impl DynamicsMode {
    /// Every accepted mode, in form order.
    pub const ALL: [Self; 3] = [Self::Nvt, Self::Npt, Self::Nve];

    /// Engine keyword for this mode.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Nvt => "nvt",
            Self::Npt => "npt",
            Self::Nve => "nve",
        }
    }
}

/// Thermostat applied by the coordinator.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum ThermostatMode {
    /// White-noise Langevin.
    #[default]
    Langevin,
    /// Global path-integral Langevin.
    PileG,
    /// Local path-integral Langevin.
    PileL,
    /// Stochastic velocity rescaling.
    Svr,
    /// Global generalized Gaussian moment thermostat.
    Ggmt,
}

impl ThermostatMode {
    /// Every accepted mode, in form order.
    pub const ALL: [Self; 5] = [
        Self::Langevin,
        Self::PileG,
        Self::PileL,
        Self::Svr,
        Self::Ggmt,
    ];

    /// Engine keyword for this mode.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Langevin => "langevin",
            Self::PileG => "pile_g",
            Self::PileL => "pile_l",
            Self::Svr => "svr",
            Self::Ggmt => "ggmt",
        }
    }
}

macro_rules! keyword_enum_impls {
    ($ty:ty, $what:literal) => {
        impl Display for $ty {
            fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl FromStr for $ty {
            type Err = AppError;

            fn from_str(s: &str) -> Result<Self> {
                let wanted = s.trim().to_ascii_lowercase();
                Self::ALL
                    .into_iter()
                    .find(|mode| mode.as_str() == wanted)
                    .ok_or_else(|| {
                        AppError::InvalidParameters(format!(concat!("unknown ", $what, " '{}'"), s))
                    })
            }
        }
    };
}

keyword_enum_impls!(DynamicsMode, "dynamics mode");
keyword_enum_impls!(ThermostatMode, "thermostat mode");

/// Immutable parameter set for one run.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "snake_case")]
pub struct SimulationParams {
    /// Target temperature in kelvin.
    pub temperature: f64,
    /// Number of ring-polymer beads.
    pub nbeads: u32,
    /// Integration timestep in femtoseconds.
    pub timestep: f64,
    /// Number of steps the coordinator runs.
    pub total_steps: u64,
    /// Output stride for properties and trajectory.
    pub stride: u64,
    /// Thermostat relaxation time in femtoseconds.
    pub tau: f64,
    /// Ensemble.
    pub dynamics: DynamicsMode,
    /// Thermostat flavor.
    pub thermostat: ThermostatMode,
}

impl Default for SimulationParams {
    fn default() -> Self {
        Self {
            temperature: 300.0,
            nbeads: 32,
            timestep: 0.5,
            total_steps: 80_000,
            stride: 100,
            tau: 100.0,
            dynamics: DynamicsMode::Nvt,
            thermostat: ThermostatMode::Langevin,
        }
    }
}

fn positive_finite(field: &str, value: f64) -> Result<()> {
    if value.is_finite() && value > 0.0 {
        Ok(())
    } else {
        Err(AppError::InvalidParameters(format!(
            "{field} must be a positive number, got {value}"
        )))
    }
}

impl SimulationParams {
    /// Range-check every numeric field.
    ///
    /// # Errors
    ///
    /// Returns `AppError::InvalidParameters` naming the first bad field.
    pub fn validate(&self) -> Result<()> {
        positive_finite("temperature", self.temperature)?;
        positive_finite("timestep", self.timestep)?;
        positive_finite("tau", self.tau)?;

        if self.nbeads == 0 {
            return Err(AppError::InvalidParameters(
                "nbeads must be at least 1".into(),
            ));
        }
        if self.total_steps == 0 {
            return Err(AppError::InvalidParameters(
                "total_steps must be at least 1".into(),
            ));
        }
        if self.stride == 0 {
            return Err(AppError::InvalidParameters(
                "stride must be at least 1".into(),
            ));
        }
        Ok(())
    }

    /// `(key, value)` pairs in form order, for echoing into the session log.
    #[must_use]
    pub fn entries(&self) -> Vec<(&'static str, String)> {
        vec![
            ("temperature", self.temperature.to_string()),
            ("nbeads", self.nbeads.to_string()),
            ("timestep", self.timestep.to_string()),
            ("total_steps", self.total_steps.to_string()),
            ("stride", self.stride.to_string()),
            ("tau", self.tau.to_string()),
            ("dynamics", self.dynamics.to_string()),
            ("thermostat", self.thermostat.to_string()),
        ]
    }
}
