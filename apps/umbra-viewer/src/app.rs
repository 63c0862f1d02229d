//! Viewer application: an orbiting camera over a grid of cubes.

use std::path::PathBuf;

use glam::{Mat4, Vec3};
use tracing::info;
use winit::event::{ElementState, KeyEvent, WindowEvent};
use winit::keyboard::{KeyCode, PhysicalKey};

use umbra_app::{AppContext, Camera, FrameContext, Scene, TextLine, UmbraApp};
use umbra_core::{Assets, Material, MaterialHandle, MeshData, Model, ModelHandle, Texture};
use umbra_render::PointLight;

/// Camera orbit speed in radians per second.
const ORBIT_SPEED: f32 = 0.3;

/// Spacing between cube centres.
const SPACING: f32 = 1.5;

/// Seconds between overlay text refreshes.
const TEXT_REFRESH: f32 = 0.25;

/// Options from the command line.
#[derive(Debug, Clone)]
pub struct ViewerParams {
    pub cubes: usize,
    pub frames_in_flight: usize,
    pub asset_root: PathBuf,
    pub target_fps: Option<u32>,
    pub vsync: bool,
}

impl Default for ViewerParams {
    fn default() -> Self {
        Self {
            cubes: 64,
            frames_in_flight: 2,
            asset_root: PathBuf::from("assets"),
            target_fps: None,
            vsync: false,
        }
    }
}

impl ViewerParams {
    /// Parse viewer parameters from command line arguments. Unknown or
    /// malformed options are ignored.
    pub fn from_args() -> Self {
        Self::parse(std::env::args().skip(1))
    }

    fn parse(args: impl IntoIterator<Item = String>) -> Self {
        let mut params = Self::default();
        let mut args = args.into_iter();
        while let Some(arg) = args.next() {
            match arg.as_str() {
                "--cubes" => {
                    if let Some(v) = args.next().and_then(|v| v.parse().ok()) {
                        params.cubes = v;
                    }
                }
                "--frames" => {
                    if let Some(v) = args.next().and_then(|v| v.parse().ok()) {
                        params.frames_in_flight = v;
                    }
                }
                "--assets" => {
                    if let Some(v) = args.next() {
                        params.asset_root = PathBuf::from(v);
                    }
                }
                "--fps" => params.target_fps = args.next().and_then(|v| v.parse().ok()),
                "--vsync" => params.vsync = true,
                _ => {}
            }
        }
        params
    }
}

#[derive(Default)]
struct PendingInput {
    toggle_debug: bool,
    toggle_text: bool,
    add_row: bool,
}

/// Viewer application state.
pub struct Viewer {
    scene: Scene,
    models: [ModelHandle; 2],
    /// Untextured model used by rows added at runtime.
    plain: Option<ModelHandle>,
    columns: usize,
    paused: bool,
    pending: PendingInput,
    should_exit: bool,
    since_text: f32,
}

impl Viewer {
    fn spawn_cube(&mut self) {
        let model = self.models[self.scene.instances.len() % 2];
        self.spawn(model);
    }

    fn spawn(&mut self, model: ModelHandle) {
        let index = self.scene.instances.len();
        let (x, z) = ((index % self.columns) as f32, (index / self.columns) as f32);
        self.scene
            .spawn(model, Mat4::from_translation(Vec3::new(x * SPACING, 0.0, -z * SPACING)));
    }

    /// Append a row of untextured cubes; the model is created on first use.
    fn add_row(&mut self) {
        let model = match self.plain {
            Some(model) => model,
            None => {
                let assets = &mut self.scene.assets;
                let material = assets
                    .materials
                    .insert(Material::new("plain").with_albedo([0.8, 0.8, 0.8, 1.0]));
                let model = assets
                    .models
                    .insert(Model::new("plain cube", MeshData::cube(0.3), material));
                *self.plain.insert(model)
            }
        };
        for _ in 0..self.columns {
            self.spawn(model);
        }
    }

    fn center(&self) -> Vec3 {
        let rows = self.scene.instances.len().div_ceil(self.columns).max(1);
        Vec3::new(
            (self.columns - 1) as f32 * SPACING / 2.0,
            0.0,
            -((rows - 1) as f32) * SPACING / 2.0,
        )
    }

    fn overlay_text(&self, fps: f32) -> Vec<TextLine> {
        vec![
            TextLine::new(format!("FPS {fps:.0}"), [12.0, 12.0]),
            TextLine::new(format!("CUBES {}", self.scene.instances.len()), [12.0, 36.0])
                .with_color([0.7, 0.9, 1.0, 1.0]),
        ]
    }
}

impl UmbraApp for Viewer {
    fn init(ctx: &mut AppContext) -> anyhow::Result<Self> {
        let params = ViewerParams::from_args();
        let (assets, models) = build_assets();
        let mut scene = Scene::new(assets)?;
        scene.lights = vec![
            PointLight {
                position: Vec3::new(0.0, 6.0, 4.0),
                color: Vec3::new(1.0, 0.95, 0.9),
                radius: 40.0,
            },
            PointLight {
                position: Vec3::new(10.0, 3.0, -10.0),
                color: Vec3::new(0.4, 0.6, 1.0),
                radius: 25.0,
            },
        ];

        let columns = ((params.cubes as f32).sqrt().ceil() as usize).max(1);
        let mut viewer = Self {
            scene,
            models,
            plain: None,
            columns,
            paused: false,
            pending: PendingInput::default(),
            should_exit: false,
            since_text: TEXT_REFRESH,
        };
        for _ in 0..params.cubes {
            viewer.spawn_cube();
        }

        let center = viewer.center();
        let distance = columns as f32 * SPACING * 1.5;
        viewer.scene.camera = Camera::looking_at(
            center + Vec3::new(0.0, distance * 0.6, distance),
            center,
            ctx.aspect_ratio(),
        );

        info!(
            cubes = params.cubes,
            gpu = ctx.device_name(),
            frames_in_flight = ctx.frames_in_flight(),
            "viewer scene built"
        );
        Ok(viewer)
    }

    fn scene(&self) -> &Scene {
        &self.scene
    }

    fn update(&mut self, _ctx: &AppContext, frame: &mut FrameContext<'_>) {
        let pending = std::mem::take(&mut self.pending);
        if pending.toggle_debug {
            let enabled = !frame.debug_overlay();
            frame.set_debug_overlay(enabled);
            info!(enabled, "bounding-box overlay");
        }
        if pending.toggle_text {
            let enabled = !frame.text_overlay();
            frame.set_text_overlay(enabled);
        }
        if pending.add_row {
            self.add_row();
            frame.request_upload();
        }

        if !self.paused {
            let center = self.center();
            self.scene.camera.orbit(center, ORBIT_SPEED * frame.dt);
        }

        self.since_text += frame.dt;
        if self.since_text >= TEXT_REFRESH {
            self.since_text = 0.0;
            frame.set_text(self.overlay_text(frame.fps));
        }
    }

    fn on_event(&mut self, event: &WindowEvent) -> bool {
        let WindowEvent::KeyboardInput {
            event:
                KeyEvent {
                    physical_key: PhysicalKey::Code(code),
                    state: ElementState::Pressed,
                    repeat: false,
                    ..
                },
            ..
        } = event
        else {
            return false;
        };
        match code {
            KeyCode::F1 => self.pending.toggle_debug = true,
            KeyCode::F2 => self.pending.toggle_text = true,
            KeyCode::Space => self.paused = !self.paused,
            KeyCode::Enter => self.pending.add_row = true,
            KeyCode::Escape => self.should_exit = true,
            _ => return false,
        }
        true
    }

    fn should_exit(&self) -> bool {
        self.should_exit
    }
}

/// Two cube models whose materials share one checkerboard texture.
fn build_assets() -> (Assets, [ModelHandle; 2]) {
    let mut assets = Assets::new();
    let checker = assets.textures.insert(Texture::checkerboard(
        "checker",
        64,
        8,
        [235, 235, 235, 255],
        [60, 60, 70, 255],
    ));
    let material = |assets: &mut Assets, name: &str, albedo: [f32; 4]| -> MaterialHandle {
        assets
            .materials
            .insert(Material::new(name).with_albedo(albedo).with_albedo_map(checker))
    };
    let warm = material(&mut assets, "warm", [1.0, 0.55, 0.35, 1.0]);
    let cool = material(&mut assets, "cool", [0.35, 0.6, 1.0, 1.0]);
    let small = assets
        .models
        .insert(Model::new("small cube", MeshData::cube(0.35), warm));
    let large = assets
        .models
        .insert(Model::new("large cube", MeshData::cube(0.5), cool));
    (assets, [small, large])
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> ViewerParams {
        ViewerParams::parse(args.iter().map(ToString::to_string))
    }

    #[test]
    fn parses_options() {
        let params = parse(&["--cubes", "10", "--frames", "3", "--vsync", "--fps", "60"]);
        assert_eq!(params.cubes, 10);
        assert_eq!(params.frames_in_flight, 3);
        assert!(params.vsync);
        assert_eq!(params.target_fps, Some(60));
    }

    #[test]
    fn malformed_values_keep_defaults() {
        let params = parse(&["--cubes", "many", "--unknown"]);
        assert_eq!(params.cubes, 64);
        assert_eq!(params.target_fps, None);
    }

    #[test]
    fn assets_share_one_texture() {
        let (assets, models) = build_assets();
        assert_eq!(assets.textures_of(&models).len(), 1);
        assert_eq!(assets.materials_of(&models).len(), 2);
    }
}
