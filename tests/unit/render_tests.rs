//! Unit tests for coordinator input rendering.

use std::path::Path;

use pimd_orchestrator::models::params::{DynamicsMode, SimulationParams, ThermostatMode};
use pimd_orchestrator::render::ipi::{IpiInputRenderer, GEOMETRY_FILE, INPUT_FILE};
use pimd_orchestrator::render::{write_atomic, ConfigRenderer, RenderContext};
use pimd_orchestrator::AppError;

fn context<'a>(params: &'a SimulationParams, workdir: &'a Path, staging: &'a Path) -> RenderContext<'a> {
    RenderContext {
        params,
        workdir,
        staging_dir: staging,
        socket_name: "water_ipi",
    }
}

/// The input document carries every parameter and the socket name.
#[test]
fn input_xml_reflects_parameters() {
    let params = SimulationParams {
        temperature: 250.0,
        nbeads: 16,
        total_steps: 1_000,
        dynamics: DynamicsMode::Npt,
        thermostat: ThermostatMode::Svr,
        ..SimulationParams::default()
    };
    let workdir = Path::new("/data/run_1");
    let ctx = context(&params, workdir, Path::new("/data"));

    let xml = IpiInputRenderer::input_xml(&ctx, workdir);

    assert!(xml.contains("<total_steps>1000</total_steps>"));
    assert!(xml.contains("nbeads='16'"));
    assert!(xml.contains("<temperature units='kelvin'>250</temperature>"));
    assert!(xml.contains("<dynamics mode='npt'>"));
    assert!(xml.contains("<thermostat mode='svr'>"));
    assert!(xml.contains("<address>water_ipi</address>"));
    assert!(xml.contains("/data/run_1/init.xyz"));
}

/// Rendering writes the input to staging and the geometry to the workdir.
#[test]
fn render_writes_both_files() {
    let dir = tempfile::tempdir().unwrap();
    let workdir = dir.path().join("run_1");
    let staging = dir.path().join("stage");
    std::fs::create_dir_all(&workdir).unwrap();
    let params = SimulationParams::default();

    let written = IpiInputRenderer
        .render(&context(&params, &workdir, &staging))
        .unwrap();

    assert_eq!(written.len(), 2);
    assert!(staging.join(INPUT_FILE).is_file());
    let xyz = std::fs::read_to_string(workdir.join(GEOMETRY_FILE)).unwrap();
    assert!(xyz.starts_with('3'));
}

/// `write_atomic` replaces an existing file.
#[test]
fn write_atomic_replaces_content() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("input.xml");
    std::fs::write(&path, "old").unwrap();

    write_atomic(&path, "new").unwrap();

    assert_eq!(std::fs::read_to_string(&path).unwrap(), "new");
}

/// A parent that is a file makes rendering fail with `Render`.
#[test]
fn write_atomic_reports_render_error() {
    let dir = tempfile::tempdir().unwrap();
    let blocker = dir.path().join("blocker");
    std::fs::write(&blocker, "file").unwrap();

    let err = write_atomic(&blocker.join("input.xml"), "x").unwrap_err();

    assert!(matches!(err, AppError::Render(_)));
}
