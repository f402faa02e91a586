//! i-PI `input.xml` and water `init.xyz` generation.

use std::fmt::Write as _;
use std::path::{Path, PathBuf};

use tracing::info;

use super::{write_atomic, ConfigRenderer, RenderContext};
use crate::Result;

/// Coordinator input file, read from the staging directory.
pub const INPUT_FILE: &str = "input.xml";

/// Geometry seed, referenced by absolute path from `input.xml`.
pub const GEOMETRY_FILE: &str = "init.xyz";

/// Single water molecule, angstrom.
pub const WATER_XYZ: &str = "3
Water molecule
O     0.000   0.000   0.000
H     0.958   0.000   0.000
H    -0.239   0.927   0.000
";

const PRNG_SEED: u32 = 32345;
const SOCKET_PORT: u32 = 32345;
const CELL_ANGSTROM: &str = "[20.0, 20.0, 20.0]";

/// Renders the stock path-integral water setup.
#[derive(Debug, Clone, Copy, Default)]
pub struct IpiInputRenderer;

impl IpiInputRenderer {
    /// Build the `input.xml` document for a session.
    #[must_use]
    pub fn input_xml(ctx: &RenderContext<'_>, workdir: &Path) -> String {
        let p = ctx.params;
        let prefix = workdir.join("simulation");
        let geometry = workdir.join(GEOMETRY_FILE);

        let mut xml = String::new();
        // Writing into a String cannot fail.
        let _ = write!(
            xml,
            "<simulation verbosity='high'>
    <output prefix='{prefix}'>
        <properties stride='{stride}' filename='out'>  [ step, time{{picosecond}}, temperature{{kelvin}},
            conserved{{electronvolt}}, potential{{electronvolt}}, kinetic_cv{{electronvolt}} ] </properties>
        <trajectory filename='pos' stride='{stride}'> positions{{angstrom}} </trajectory>
    </output>
    <total_steps>{total_steps}</total_steps>
    <prng><seed>{PRNG_SEED}</seed></prng>
    <ffsocket mode='unix' name='{socket}'>
        <address>{socket}</address>
        <port>{SOCKET_PORT}</port>
    </ffsocket>
    <system>
        <initialize nbeads='{nbeads}'>
            <file mode='xyz'> {geometry} </file>
            <cell mode='abc'> {CELL_ANGSTROM} </cell>
        </initialize>
        <forces><force forcefield='{socket}'></force></forces>
        <ensemble>
            <temperature units='kelvin'>{temperature}</temperature>
        </ensemble>
        <motion mode='dynamics'>
            <dynamics mode='{dynamics}'>
                <timestep units='femtosecond'>{timestep}</timestep>
                <thermostat mode='{thermostat}'>
                    <tau units='femtosecond'>{tau}</tau>
                </thermostat>
            </dynamics>
        </motion>
    </system>
</simulation>",
            prefix = prefix.display(),
            stride = p.stride,
            total_steps = p.total_steps,
            socket = ctx.socket_name,
            nbeads = p.nbeads,
            geometry = geometry.display(),
            temperature = p.temperature,
            dynamics = p.dynamics,
            timestep = p.timestep,
            thermostat = p.thermostat,
            tau = p.tau,
        );
        xml
    }
}

impl ConfigRenderer for IpiInputRenderer {
    fn render(&self, ctx: &RenderContext<'_>) -> Result<Vec<PathBuf>> {
        // The coordinator resolves these paths from the staging directory.
        let workdir = ctx
            .workdir
            .canonicalize()
            .unwrap_or_else(|_| ctx.workdir.to_path_buf());

        let xml = Self::input_xml(ctx, &workdir);
        let input = write_atomic(&ctx.staging_dir.join(INPUT_FILE), &xml)?;
        let seed = write_atomic(&workdir.join(GEOMETRY_FILE), WATER_XYZ)?;

        info!(
            input = %input.display(),
            seed = %seed.display(),
            "rendered coordinator inputs"
        );
        Ok(vec![input, seed])
    }
}
