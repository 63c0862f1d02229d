//! Application shell for the Umbra renderer.
//!
//! This crate handles the boilerplate around a [`FrameComposer`]:
//! - Logging initialisation
//! - Window creation and management
//! - Device, frame ring and streamer creation over the Vulkan backend
//! - Resize and stale-swapchain handling
//! - Event loop handling and frame pacing
//!
//! # Example
//!
//! ```no_run
//! use umbra_app::{run_app, AppConfig, AppContext, FrameContext, UmbraApp};
//! use umbra_render::Scene;
//!
//! struct MyApp {
//!     scene: Scene,
//! }
//!
//! impl UmbraApp for MyApp {
//!     fn init(_ctx: &mut AppContext) -> anyhow::Result<Self> {
//!         Ok(Self { scene: Scene::new(umbra_core::Assets::new())? })
//!     }
//!
//!     fn scene(&self) -> &Scene {
//!         &self.scene
//!     }
//!
//!     fn update(&mut self, _ctx: &AppContext, _frame: &mut FrameContext<'_>) {}
//! }
//!
//! fn main() -> anyhow::Result<()> {
//!     run_app::<MyApp>(AppConfig::default())
//! }
//! ```

mod app;
mod context;
mod frame;
mod runner;
mod stats;

pub use app::UmbraApp;
pub use context::AppContext;
pub use frame::FrameContext;
pub use runner::{init_logging, run_app, AppConfig};
pub use stats::FrameStats;

pub use umbra_core::EngineConfig;
pub use umbra_render::{Camera, FrameComposer, Scene, TextLine};
pub use winit::event::{DeviceEvent, DeviceId, WindowEvent};
