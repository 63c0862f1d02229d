//! Umbra demo viewer.
//!
//! Renders a grid of cubes sharing one checkerboard texture through the
//! deferred pipeline, with the wireframe and text overlays.
//!
//! ## Usage
//!
//! ```bash
//! cargo run -p umbra-viewer -- [OPTIONS]
//! ```
//!
//! Shaders are loaded as SPIR-V from `<asset root>/shaders`; compile the
//! GLSL sources there first, e.g. `glslc gbuffer.vert -o gbuffer.vert.spv`.
//!
//! ## Controls
//!
//! - `F1`: toggle the bounding-box overlay
//! - `F2`: toggle the text overlay
//! - `Space`: pause the camera orbit
//! - `Enter`: add a row of cubes
//! - `Escape`: quit
//!
//! ## Environment Variables
//!
//! - `RUST_LOG`: Set log level (e.g., info, debug, trace)

mod app;

use umbra_app::{run_app, AppConfig, EngineConfig};

use crate::app::{Viewer, ViewerParams};

const WIDTH: u32 = 1280;
const HEIGHT: u32 = 720;

fn main() -> anyhow::Result<()> {
    if std::env::args().any(|arg| arg == "-h" || arg == "--help") {
        print_help();
        return Ok(());
    }

    let params = ViewerParams::from_args();
    let engine = EngineConfig::default()
        .with_frames_in_flight(params.frames_in_flight)
        .with_asset_root(params.asset_root.clone());
    let mut config = AppConfig::new("Umbra Viewer")
        .with_size(WIDTH, HEIGHT)
        .with_engine(engine)
        .with_vsync(params.vsync);
    if let Some(fps) = params.target_fps {
        config = config.with_target_fps(fps);
    }
    run_app::<Viewer>(config)
}

fn print_help() {
    eprintln!(
        "Umbra Viewer

USAGE:
    cargo run -p umbra-viewer -- [OPTIONS]

OPTIONS:
    --cubes <N>             Number of cubes (default: 64)
    --frames <N>            Frames in flight, 2 or 3 (default: 2)
    --assets <DIR>          Asset root containing shaders/ (default: assets)
    --fps <N>               Target frames per second (default: unlimited)
    --vsync                 Enable vsync
    -h, --help              Print this help message

CONTROLS:
    F1      Toggle bounding-box overlay
    F2      Toggle text overlay
    Space   Pause camera orbit
    Enter   Add a row of cubes
    Escape  Quit

ENVIRONMENT VARIABLES:
    RUST_LOG                Set log level (e.g., info, debug, trace)"
    );
}
