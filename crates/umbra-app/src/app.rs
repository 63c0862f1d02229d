//! `UmbraApp` trait definition.

use umbra_render::Scene;
use winit::event::{DeviceEvent, DeviceId, WindowEvent};

use crate::context::AppContext;
use crate::frame::FrameContext;

/// Trait for applications driven by [`crate::run_app`].
///
/// The shell owns the device, the frame ring and the passes. The
/// application owns the [`Scene`] and changes it between frames.
pub trait UmbraApp: Sized {
    /// Initialize the application.
    ///
    /// Called once after the window and device exist and before the passes
    /// are built, so the returned scene is uploaded during setup.
    fn init(ctx: &mut AppContext) -> anyhow::Result<Self>;

    /// The scene drawn every frame.
    fn scene(&self) -> &Scene;

    /// Update application state.
    ///
    /// Called every frame before recording. Models added to the scene must
    /// be announced with [`FrameContext::request_upload`].
    fn update(&mut self, ctx: &AppContext, frame: &mut FrameContext<'_>);

    /// Handle a size change after the swapchain and passes were rebuilt.
    ///
    /// Default implementation does nothing.
    #[allow(unused_variables)]
    fn on_resize(&mut self, ctx: &AppContext, width: u32, height: u32) -> anyhow::Result<()> {
        Ok(())
    }

    /// Handle window events. Return `true` if the event was consumed.
    ///
    /// Default implementation does nothing and returns `false`.
    #[allow(unused_variables)]
    fn on_event(&mut self, event: &WindowEvent) -> bool {
        false
    }

    /// Handle device events (raw input).
    ///
    /// Default implementation does nothing.
    #[allow(unused_variables)]
    fn on_device_event(&mut self, device_id: DeviceId, event: &DeviceEvent) {}

    /// Returns true once the application wants the event loop to stop.
    fn should_exit(&self) -> bool {
        false
    }

    /// Cleanup before shutdown. The GPU is idle when this is called.
    ///
    /// Default implementation does nothing.
    #[allow(unused_variables)]
    fn cleanup(&mut self, ctx: &mut AppContext) {}
}
