//! Render passes.
//!
//! Every pass is built once, in a fixed order: uniforms, then images,
//! render pass, framebuffers, descriptor sets and pipeline. After that, each
//! frame runs `update_uniforms_data`, then `update_uniforms`, then `draw`
//! for the acquired slot. Inactive overlays are skipped entirely.

mod debug;
mod gbuffer;
mod lighting;
mod text;

pub use debug::{DebugPass, LineVertex};
pub use gbuffer::{GbufferPass, ObjectUniforms, GBUFFER_COLOR_FORMATS, GBUFFER_DEPTH_FORMAT};
pub use lighting::{GpuLight, LightingPass, LightingUniforms};
pub use text::{GlyphVertex, TextLine, TextPass, MAX_GLYPHS};

use ash::vk;

use umbra_core::EngineConfig;
use umbra_gpu::backend::{AttachmentDesc, RenderPassDesc};
use umbra_gpu::{
    CommandList, DescriptorPool, Device, FrameIndex, Framebuffer, GpuStreamer, PerFrame,
    RenderPass, Renderer, Result,
};

use crate::scene::Scene;
use crate::shaders::ShaderSet;

/// Everything a pass reads while recording one frame.
#[derive(Clone, Copy)]
pub struct FrameView<'a> {
    /// Slot returned by acquisition.
    pub frame: FrameIndex,
    pub scene: &'a Scene,
    pub streamer: &'a GpuStreamer,
    pub extent: vk::Extent2D,
}

/// Setup inputs shared by every pass constructor.
///
/// `cmd` is a one-shot list; uniform priming is recorded into it and it is
/// submitted once all passes are built.
pub struct PassSetup<'a, 'd> {
    pub device: &'d Device,
    pub renderer: &'a Renderer,
    pub cmd: &'a mut CommandList<'d>,
    pub descriptors: &'a mut DescriptorPool,
    pub config: &'a EngineConfig,
    pub shaders: &'a ShaderSet,
}

/// Per-frame protocol of a pass.
pub trait Pass {
    /// Name for logs.
    fn name(&self) -> &'static str;

    /// Inactive passes record nothing.
    fn is_active(&self) -> bool {
        true
    }

    /// Write this frame's CPU-side data into the slot's host-visible memory.
    fn update_uniforms_data(&mut self, device: &Device, view: &FrameView<'_>);

    /// Record the transfers that publish the slot's data to the GPU.
    fn update_uniforms(&self, cmd: &mut CommandList<'_>, frame: FrameIndex);

    /// Record the draws.
    fn draw(&self, cmd: &mut CommandList<'_>, view: &FrameView<'_>);
}

/// Single-attachment render pass over the present images, one framebuffer
/// per slot.
pub(crate) struct PresentFramebuffers {
    render_pass: RenderPass,
    framebuffers: PerFrame<Framebuffer>,
}

impl PresentFramebuffers {
    /// With `load` the pass draws over what earlier passes left in
    /// `COLOR_ATTACHMENT_OPTIMAL`; otherwise the image is cleared.
    pub(crate) fn new(device: &Device, renderer: &Renderer, load: bool) -> Result<Self> {
        let (load_op, initial_layout) = if load {
            (vk::AttachmentLoadOp::LOAD, vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL)
        } else {
            (vk::AttachmentLoadOp::CLEAR, vk::ImageLayout::UNDEFINED)
        };
        let render_pass = RenderPass::new(
            device,
            RenderPassDesc {
                colors: vec![AttachmentDesc {
                    format: renderer.format(),
                    load_op,
                    store_op: vk::AttachmentStoreOp::STORE,
                    initial_layout,
                    final_layout: vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
                }],
                depth: None,
            },
        )?;
        let framebuffers = create_present_framebuffers(device, renderer, &render_pass)?;
        Ok(Self {
            render_pass,
            framebuffers,
        })
    }

    pub(crate) const fn render_pass(&self) -> &RenderPass {
        &self.render_pass
    }

    pub(crate) fn framebuffer(&self, frame: FrameIndex) -> &Framebuffer {
        &self.framebuffers[frame]
    }

    /// Recreate framebuffers over the renderer's current present views.
    /// Call after `Renderer::resize`; the device is idle by then.
    pub(crate) fn rebuild(&mut self, device: &Device, renderer: &Renderer) -> Result<()> {
        let fresh = create_present_framebuffers(device, renderer, &self.render_pass)?;
        for framebuffer in std::mem::replace(&mut self.framebuffers, fresh).into_inner() {
            framebuffer.destroy(device);
        }
        Ok(())
    }

    pub(crate) fn destroy(self, device: &Device) {
        for framebuffer in self.framebuffers.into_inner() {
            framebuffer.destroy(device);
        }
        self.render_pass.destroy(device);
    }
}

fn create_present_framebuffers(
    device: &Device,
    renderer: &Renderer,
    render_pass: &RenderPass,
) -> Result<PerFrame<Framebuffer>> {
    let extent = renderer.extent();
    PerFrame::try_new(renderer.frame_slots(), |frame| {
        Framebuffer::new(
            device,
            render_pass,
            &[renderer.present_target(frame).view],
            extent,
        )
    })
}
