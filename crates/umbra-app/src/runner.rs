//! Application runner and event loop.

use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use tracing::{debug, error, info};
use tracing_subscriber::EnvFilter;
use umbra_core::EngineConfig;
use umbra_render::{FrameComposer, FrameOutcome, ShaderSet};
use winit::application::ApplicationHandler;
use winit::dpi::PhysicalSize;
use winit::event::{DeviceEvent, DeviceId, WindowEvent};
use winit::event_loop::{ActiveEventLoop, ControlFlow, EventLoop};
use winit::window::{Window, WindowId};

use crate::app::UmbraApp;
use crate::context::AppContext;
use crate::frame::FrameContext;
use crate::stats::FrameStats;

/// Application configuration.
#[derive(Clone, Debug)]
pub struct AppConfig {
    /// Window title.
    pub title: String,
    /// Initial window width.
    pub width: u32,
    /// Initial window height.
    pub height: u32,
    /// Target frames per second (None for unlimited).
    pub target_fps: Option<u32>,
    /// Renderer configuration. `vsync` and `validation` live here.
    pub engine: EngineConfig,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            title: "Umbra".to_string(),
            width: 1280,
            height: 720,
            target_fps: None,
            engine: EngineConfig::default(),
        }
    }
}

impl AppConfig {
    /// Create a new config with the given title.
    pub fn new(title: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            ..Default::default()
        }
    }

    /// Set the window dimensions.
    #[must_use]
    pub fn with_size(mut self, width: u32, height: u32) -> Self {
        self.width = width;
        self.height = height;
        self
    }

    /// Set the target FPS.
    #[must_use]
    pub fn with_target_fps(mut self, fps: u32) -> Self {
        self.target_fps = Some(fps);
        self
    }

    /// Enable or disable vsync.
    #[must_use]
    pub fn with_vsync(mut self, vsync: bool) -> Self {
        self.engine.vsync = vsync;
        self
    }

    /// Enable or disable validation layers.
    #[must_use]
    pub fn with_validation(mut self, validation: bool) -> Self {
        self.engine.validation = validation;
        self
    }

    /// Replace the renderer configuration.
    #[must_use]
    pub fn with_engine(mut self, engine: EngineConfig) -> Self {
        self.engine = engine;
        self
    }

    fn target_frame_time(&self) -> Option<Duration> {
        self.target_fps
            .filter(|&fps| fps > 0)
            .map(|fps| Duration::from_nanos(1_000_000_000 / u64::from(fps)))
    }
}

/// Install the global `tracing` subscriber. `RUST_LOG` overrides the
/// default `info` filter. Later calls are ignored.
pub fn init_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    if tracing_subscriber::fmt().with_env_filter(filter).try_init().is_err() {
        debug!("logging already initialized");
    }
}

/// Run an [`UmbraApp`] with the given configuration.
///
/// Initializes logging, creates the window, device and passes, and runs
/// the event loop until the application exits.
pub fn run_app<A: UmbraApp + 'static>(config: AppConfig) -> anyhow::Result<()> {
    init_logging();
    config.engine.validate()?;
    info!(title = %config.title, "starting");

    let event_loop = EventLoop::new()?;
    event_loop.set_control_flow(ControlFlow::Poll);

    let mut runner = AppRunner::<A> {
        config,
        state: None,
        failure: None,
    };
    event_loop.run_app(&mut runner)?;

    match runner.failure {
        Some(err) => Err(err),
        None => Ok(()),
    }
}

struct AppRunner<A: UmbraApp> {
    config: AppConfig,
    state: Option<AppState<A>>,
    /// Setup error reported by `run_app` after the loop exits.
    failure: Option<anyhow::Error>,
}

struct AppState<A: UmbraApp> {
    ctx: AppContext,
    composer: FrameComposer,
    app: A,
    target_frame_time: Option<Duration>,
    stats: FrameStats,
}

impl<A: UmbraApp + 'static> ApplicationHandler for AppRunner<A> {
    fn resumed(&mut self, event_loop: &ActiveEventLoop) {
        if self.state.is_some() {
            return;
        }

        match self.create_state(event_loop) {
            Ok(state) => {
                self.state = Some(state);
                info!("application ready");
            }
            Err(err) => {
                error!(%err, "failed to initialize application");
                self.failure = Some(err);
                event_loop.exit();
            }
        }
    }

    fn window_event(&mut self, event_loop: &ActiveEventLoop, _id: WindowId, event: WindowEvent) {
        if let Some(state) = &mut self.state {
            if state.app.on_event(&event) {
                return;
            }
        }

        match event {
            WindowEvent::CloseRequested => {
                info!("close requested");
                self.shutdown(event_loop);
            }
            WindowEvent::RedrawRequested => {
                let Some(state) = &mut self.state else {
                    return;
                };
                if let Err(err) = state.render_frame() {
                    error!(%err, "render error");
                }
                if state.app.should_exit() {
                    self.shutdown(event_loop);
                } else {
                    state.ctx.window.request_redraw();
                }
            }
            WindowEvent::Resized(size) => {
                if let Some(state) = &mut self.state {
                    if let Err(err) = state.handle_resize(size.width, size.height) {
                        error!(%err, "resize error");
                    }
                }
            }
            _ => {}
        }
    }

    fn device_event(&mut self, _event_loop: &ActiveEventLoop, device_id: DeviceId, event: DeviceEvent) {
        if let Some(state) = &mut self.state {
            state.app.on_device_event(device_id, &event);
        }
    }

    fn about_to_wait(&mut self, _event_loop: &ActiveEventLoop) {
        if let Some(state) = &self.state {
            state.ctx.window.request_redraw();
        }
    }
}

impl<A: UmbraApp + 'static> AppRunner<A> {
    fn create_state(&self, event_loop: &ActiveEventLoop) -> anyhow::Result<AppState<A>> {
        let attributes = Window::default_attributes()
            .with_title(&self.config.title)
            .with_inner_size(PhysicalSize::new(self.config.width, self.config.height));
        let window = Arc::new(event_loop.create_window(attributes)?);

        let mut ctx = AppContext::new(window, &self.config.title, self.config.engine.clone())?;
        let app = A::init(&mut ctx)?;
        let shaders = ShaderSet::from_config(&ctx.config)?;
        let composer = FrameComposer::new(
            &ctx.device,
            &ctx.renderer,
            &mut ctx.streamer,
            app.scene(),
            &ctx.config,
            &shaders,
        )?;

        Ok(AppState {
            ctx,
            composer,
            app,
            target_frame_time: self.config.target_frame_time(),
            stats: FrameStats::new(),
        })
    }

    fn shutdown(&mut self, event_loop: &ActiveEventLoop) {
        if let Some(state) = self.state.take() {
            state.cleanup();
        }
        event_loop.exit();
    }
}

impl<A: UmbraApp> AppState<A> {
    #[cfg_attr(feature = "profiling-tracy", tracing::instrument(level = "trace", skip_all))]
    fn render_frame(&mut self) -> anyhow::Result<()> {
        let frame_start = Instant::now();

        let dt = frame_start.duration_since(self.ctx.last_frame_time).as_secs_f32();
        self.ctx.last_frame_time = frame_start;
        let fps = self.stats.record(dt);

        {
            #[cfg(feature = "profiling-tracy")]
            let _span = tracing::trace_span!("frame.update").entered();
            let mut frame = FrameContext::new(&mut self.composer, dt, fps, self.ctx.frame_count);
            self.app.update(&self.ctx, &mut frame);
        }

        let outcome = self.composer.render_frame(
            &self.ctx.device,
            &mut self.ctx.renderer,
            &mut self.ctx.streamer,
            self.app.scene(),
        )?;
        match outcome {
            FrameOutcome::Presented { recreated, .. } => {
                self.ctx.frame_count += 1;
                if recreated {
                    let extent = self.ctx.extent();
                    self.app.on_resize(&self.ctx, extent.width, extent.height)?;
                }
            }
            FrameOutcome::Skipped => debug!("frame skipped, swapchain recreated"),
        }

        if let Some(target) = self.target_frame_time {
            let elapsed = frame_start.elapsed();
            if elapsed < target {
                #[cfg(feature = "profiling-tracy")]
                let _span = tracing::trace_span!("frame.pacing").entered();
                thread::sleep(target - elapsed);
            }
        }
        Ok(())
    }

    fn handle_resize(&mut self, width: u32, height: u32) -> anyhow::Result<()> {
        // Minimized.
        if width == 0 || height == 0 {
            return Ok(());
        }
        self.composer
            .resize(&self.ctx.device, &mut self.ctx.renderer, width, height)?;
        let extent = self.ctx.extent();
        self.app.on_resize(&self.ctx, extent.width, extent.height)?;
        info!(width = extent.width, height = extent.height, "resized");
        Ok(())
    }

    fn cleanup(self) {
        let Self {
            mut ctx,
            composer,
            mut app,
            stats,
            ..
        } = self;
        stats.log_summary();
        info!(frames = ctx.frame_count, "starting cleanup");

        ctx.renderer.wait_idle(&ctx.device);
        app.cleanup(&mut ctx);
        composer.destroy(&ctx.device, &ctx.renderer);
        ctx.destroy();
        info!("cleanup complete");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builder_sets_engine_flags() {
        let config = AppConfig::new("test")
            .with_size(800, 600)
            .with_vsync(true)
            .with_validation(false)
            .with_target_fps(120);
        assert_eq!((config.width, config.height), (800, 600));
        assert!(config.engine.vsync);
        assert!(!config.engine.validation);
        assert_eq!(config.target_frame_time(), Some(Duration::from_nanos(8_333_333)));
    }

    #[test]
    fn unlimited_fps_has_no_pacing() {
        assert_eq!(AppConfig::default().target_frame_time(), None);
        assert_eq!(AppConfig::default().with_target_fps(0).target_frame_time(), None);
    }
}
