//! One frame, start to finish.
//!
//! Geometry and composition are recorded as two command lists of the
//! acquired slot and submitted separately. A chain semaphore orders the
//! composition submission after geometry on the GPU; the CPU only blocks
//! in acquisition, on the fence of the slot it is about to reuse.

use ash::vk;
use tracing::{debug, info, trace};

use umbra_core::EngineConfig;
use umbra_gpu::{
    CommandList, Device, FrameIndex, GpuResultExt, GpuStreamer, ImageBarrier, Renderer, Result,
    StagingBuffer, UploadReport, WorkerContext,
};

use crate::passes::{
    DebugPass, FrameView, GbufferPass, LightingPass, Pass, PassSetup, TextLine, TextPass,
};
use crate::scene::Scene;
use crate::shaders::ShaderSet;

/// Descriptor sets reserved for materials loaded after setup.
const MATERIAL_SET_HEADROOM: usize = 64;

/// Result of [`FrameComposer::render_frame`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FrameOutcome {
    /// The frame was submitted and queued for presentation. `recreated` is
    /// set when presentation reported a stale swapchain and it was rebuilt.
    Presented { frame: FrameIndex, recreated: bool },
    /// Acquisition found the swapchain out of date. It was rebuilt and
    /// nothing was recorded.
    Skipped,
}

/// Owns the passes and the recording context of the frame loop.
pub struct FrameComposer {
    worker: WorkerContext,
    gbuffer: GbufferPass,
    lighting: LightingPass,
    debug: DebugPass,
    text: TextPass,
    upload_pending: bool,
    frames_rendered: u64,
}

impl FrameComposer {
    /// Chain semaphores the renderer must be created with.
    pub const CHAIN_SEMAPHORES: usize = 1;

    /// Upload `scene` and build every pass. Blocks until setup work has
    /// executed.
    pub fn new(
        device: &Device,
        renderer: &Renderer,
        streamer: &mut GpuStreamer,
        scene: &Scene,
        config: &EngineConfig,
        shaders: &ShaderSet,
    ) -> Result<Self> {
        let frames = renderer.frame_slots();
        let max_sets = frames * 4 + scene.materials().len() + MATERIAL_SET_HEADROOM;
        let mut worker = renderer.create_worker_context(device, "composer", max_sets as u32)?;

        streamer.upload_batch(
            device,
            renderer,
            &mut worker,
            &scene.assets,
            &scene.models(),
            &scene.builtin_textures(),
        )?;

        let mut cmd = worker.begin_one_shot(device);
        let mut setup = PassSetup {
            device,
            renderer,
            cmd: &mut cmd,
            descriptors: worker.descriptor_pool(),
            config,
            shaders,
        };
        let mut gbuffer = GbufferPass::new(&mut setup)?;
        let lighting = LightingPass::new(&mut setup, &gbuffer)?;
        let debug = DebugPass::new(&mut setup)?;
        let text = TextPass::new(&mut setup, scene, streamer)?;
        gbuffer.prepare_materials(device, setup.descriptors, scene, streamer)?;

        cmd.finalize();
        renderer.submit_and_wait(device, &cmd);
        drop(cmd);
        worker.reset_one_shot(device);

        info!(
            frames,
            max_objects = config.max_objects,
            max_lights = config.max_lights,
            "frame composer ready"
        );
        Ok(Self {
            worker,
            gbuffer,
            lighting,
            debug,
            text,
            upload_pending: false,
            frames_rendered: 0,
        })
    }

    /// Upload assets of `scene` that are not resident yet and create their
    /// material descriptor sets.
    pub fn upload_scene(
        &mut self,
        device: &Device,
        renderer: &Renderer,
        streamer: &mut GpuStreamer,
        scene: &Scene,
    ) -> Result<UploadReport> {
        let report = streamer.upload_batch(
            device,
            renderer,
            &mut self.worker,
            &scene.assets,
            &scene.models(),
            &scene.builtin_textures(),
        )?;
        self.gbuffer
            .prepare_materials(device, self.worker.descriptor_pool(), scene, streamer)?;
        Ok(report)
    }

    /// Stream assets the scene gained into the next frame's geometry
    /// submission instead of blocking on a one-shot upload.
    pub fn request_upload(&mut self) {
        self.upload_pending = true;
    }

    #[must_use]
    pub const fn upload_pending(&self) -> bool {
        self.upload_pending
    }

    /// Record the pending upload ahead of the geometry pass. The returned
    /// staging buffer must outlive the frame it was recorded into.
    fn stream_scene(
        &mut self,
        device: &Device,
        cmd: &mut CommandList<'_>,
        streamer: &mut GpuStreamer,
        scene: &Scene,
    ) -> Option<StagingBuffer> {
        self.upload_pending = false;
        let (report, staging) = streamer
            .record_batch(device, cmd, &scene.assets, &scene.models(), &scene.builtin_textures())
            .or_fatal("streaming upload")?;
        self.gbuffer
            .prepare_materials(device, self.worker.descriptor_pool(), scene, streamer)
            .or_fatal("material descriptor sets");
        debug!(?report, "scene upload streamed into frame");
        Some(staging)
    }

    /// Acquire a slot, record and submit geometry and composition, present.
    #[cfg_attr(feature = "profiling-tracy", tracing::instrument(level = "trace", skip_all))]
    pub fn render_frame(
        &mut self,
        device: &Device,
        renderer: &mut Renderer,
        streamer: &mut GpuStreamer,
        scene: &Scene,
    ) -> Result<FrameOutcome> {
        let frame = match renderer.try_acquire_next_frame(device) {
            Ok(frame) => frame,
            Err(err) => {
                debug!(%err, "acquisition failed, recreating swapchain");
                let extent = renderer.extent();
                self.resize(device, renderer, extent.width, extent.height)?;
                return Ok(FrameOutcome::Skipped);
            }
        };

        // The slot's fence has signaled; its pools and buffers are free.
        self.worker.reset_frame(device, frame);
        streamer.collect_garbage(device, renderer);

        let mut geometry = self.worker.begin(device, frame);
        let staging = if self.upload_pending {
            self.stream_scene(device, &mut geometry, streamer, scene)
        } else {
            None
        };

        let view = FrameView {
            frame,
            scene,
            streamer,
            extent: renderer.extent(),
        };
        self.gbuffer.update_uniforms_data(device, &view);
        self.lighting.update_uniforms_data(device, &view);
        if self.debug.is_active() {
            self.debug.update_uniforms_data(device, &view);
        }
        if self.text.is_active() {
            self.text.update_uniforms_data(device, &view);
        }

        self.gbuffer.update_uniforms(&mut geometry, frame);
        self.gbuffer.draw(&mut geometry, &view);
        geometry.finalize();
        renderer.submit_command_lists(
            device,
            &[&geometry],
            &[],
            &[renderer.chain_semaphore(0)],
            None,
        );

        let composition_passes: Vec<&dyn Pass> = [
            &self.lighting as &dyn Pass,
            &self.debug as &dyn Pass,
            &self.text as &dyn Pass,
        ]
        .into_iter()
        .filter(|pass| pass.is_active())
        .collect();

        let mut composition = self.worker.begin(device, frame);
        for pass in &composition_passes {
            pass.update_uniforms(&mut composition, frame);
        }
        for pass in &composition_passes {
            pass.draw(&mut composition, &view);
        }
        let target = renderer.present_target(frame);
        composition.push_image_barrier(&ImageBarrier::new(
            &device.image(target.image),
            vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
            vk::ImageLayout::PRESENT_SRC_KHR,
        ));
        composition.finalize();
        renderer.submit_command_lists(
            device,
            &[&composition],
            &[
                (renderer.chain_semaphore(0), vk::PipelineStageFlags::FRAGMENT_SHADER),
                (
                    renderer.image_available(),
                    vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT,
                ),
            ],
            &[&target.render_finished],
            Some(renderer.frame_fence()),
        );
        trace!(
            %frame,
            passes = composition_passes.len() + 1,
            instances = self.gbuffer.draw_count(frame),
            "frame submitted"
        );
        if let Some(staging) = staging {
            streamer.retire_staging(device, staging, renderer.frame_number());
        }

        let stale = renderer.submit_presentation(device, frame);
        self.frames_rendered += 1;
        if stale {
            let extent = renderer.extent();
            self.resize(device, renderer, extent.width, extent.height)?;
        }
        Ok(FrameOutcome::Presented {
            frame,
            recreated: stale,
        })
    }

    /// Rebuild the swapchain and every size-dependent pass resource.
    pub fn resize(&mut self, device: &Device, renderer: &mut Renderer, width: u32, height: u32) -> Result<()> {
        let slots = renderer.frame_slots();
        renderer.resize(device, width, height)?;
        if renderer.frame_slots() != slots {
            return Err(umbra_gpu::GpuError::SwapchainCreation(format!(
                "present image count changed from {slots} to {}",
                renderer.frame_slots()
            )));
        }
        let extent = renderer.extent();
        self.gbuffer.resize(device, extent)?;
        self.lighting.resize(device, renderer, &self.gbuffer)?;
        self.debug.resize(device, renderer)?;
        self.text.resize(device, renderer)?;
        debug!(width = extent.width, height = extent.height, "passes resized");
        Ok(())
    }

    #[must_use]
    pub const fn debug_overlay(&self) -> bool {
        self.debug.enabled()
    }

    pub fn set_debug_overlay(&mut self, enabled: bool) {
        self.debug.set_enabled(enabled);
    }

    #[must_use]
    pub const fn text_overlay(&self) -> bool {
        self.text.enabled()
    }

    pub fn set_text_overlay(&mut self, enabled: bool) {
        self.text.set_enabled(enabled);
    }

    /// Replace the overlay text shown from the next frame on.
    pub fn set_text(&mut self, lines: Vec<TextLine>) {
        self.text.set_lines(lines);
    }

    #[must_use]
    pub const fn gbuffer(&self) -> &GbufferPass {
        &self.gbuffer
    }

    #[must_use]
    pub const fn debug_pass(&self) -> &DebugPass {
        &self.debug
    }

    #[must_use]
    pub const fn text_pass(&self) -> &TextPass {
        &self.text
    }

    /// Frames submitted so far.
    #[must_use]
    pub const fn frames_rendered(&self) -> u64 {
        self.frames_rendered
    }

    /// Destroy every pass. Waits for the GPU first.
    pub fn destroy(self, device: &Device, renderer: &Renderer) {
        renderer.wait_idle(device);
        self.text.destroy(device);
        self.debug.destroy(device);
        self.lighting.destroy(device);
        self.gbuffer.destroy(device);
        self.worker.destroy(device);
    }
}
