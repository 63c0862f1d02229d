//! Deferred lighting: one fullscreen triangle reading the G-buffer of the
//! same slot and writing the present image.

use ash::vk;
use tracing::{debug, warn};

use umbra_gpu::backend::{ClearValue, SamplerDesc};
use umbra_gpu::{
    CommandList, DescriptorSetLayout, DescriptorSetLayoutBuilder, DescriptorWriter, Device,
    FrameIndex, GraphicsPipeline, GraphicsPipelineConfig, PerFrame, Renderer, Result, Sampler,
};

use super::{FrameView, GbufferPass, Pass, PassSetup, PresentFramebuffers};
use crate::uniforms::UniformRing;

/// Fixed header of the lighting uniform block.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, bytemuck::Pod, bytemuck::Zeroable)]
pub struct LightingUniforms {
    pub eye: [f32; 4],
    pub ambient: [f32; 4],
    pub light_count: u32,
    pub _pad: [u32; 3],
}

/// One point light as laid out in the uniform block.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, bytemuck::Pod, bytemuck::Zeroable)]
pub struct GpuLight {
    /// xyz position, w radius.
    pub position_radius: [f32; 4],
    pub color: [f32; 4],
}

const HEADER_SIZE: u64 = std::mem::size_of::<LightingUniforms>() as u64;
const LIGHT_SIZE: u64 = std::mem::size_of::<GpuLight>() as u64;

/// Deferred lighting pass.
pub struct LightingPass {
    uniforms: UniformRing,
    target: PresentFramebuffers,
    layout: DescriptorSetLayout,
    sets: PerFrame<vk::DescriptorSet>,
    sampler: Sampler,
    pipeline: GraphicsPipeline,
    max_lights: usize,
    bytes: Vec<u8>,
}

impl LightingPass {
    /// Build the pass and bind the attachments of `gbuffer`.
    pub fn new(setup: &mut PassSetup<'_, '_>, gbuffer: &GbufferPass) -> Result<Self> {
        let device = setup.device;
        let frames = setup.renderer.frame_slots();
        let max_lights = setup.config.max_lights;

        let uniforms = UniformRing::new(
            device,
            "lights",
            HEADER_SIZE + LIGHT_SIZE * max_lights as u64,
            frames,
        )?;
        uniforms.prime(device, setup.cmd);

        let target = PresentFramebuffers::new(device, setup.renderer, false)?;
        let layout = DescriptorSetLayoutBuilder::new()
            .uniform_buffer(0, vk::ShaderStageFlags::FRAGMENT)
            .sampled_image(1, vk::ShaderStageFlags::FRAGMENT)
            .sampled_image(2, vk::ShaderStageFlags::FRAGMENT)
            .sampled_image(3, vk::ShaderStageFlags::FRAGMENT)
            .build(device)?;
        let sets = PerFrame::try_new(frames, |_| setup.descriptors.allocate(device, &layout))?;
        let sampler = Sampler::new(
            device,
            &SamplerDesc {
                filter: vk::Filter::NEAREST,
                address_mode: vk::SamplerAddressMode::CLAMP_TO_EDGE,
            },
        )?;

        let config = GraphicsPipelineConfig {
            vertex_shader: setup.shaders.lighting.vertex.clone(),
            fragment_shader: setup.shaders.lighting.fragment.clone(),
            cull_mode: vk::CullModeFlags::NONE,
            depth_test: false,
            depth_write: false,
            ..GraphicsPipelineConfig::default()
        };
        let pipeline = GraphicsPipeline::new(device, &config, target.render_pass(), &[layout.raw()], &[])?;

        let pass = Self {
            uniforms,
            target,
            layout,
            sets,
            sampler,
            pipeline,
            max_lights,
            bytes: Vec::new(),
        };
        pass.bind_gbuffer(device, gbuffer);
        debug!(frames, max_lights, "lighting pass created");
        Ok(pass)
    }

    /// Point every slot's set at the matching G-buffer attachments. No
    /// pending GPU work may use the sets.
    pub fn bind_gbuffer(&self, device: &Device, gbuffer: &GbufferPass) {
        for (frame, &set) in self.sets.iter() {
            let [albedo, normal, position] = gbuffer.color_views(frame);
            DescriptorWriter::new(device, set)
                .uniform_buffer(0, self.uniforms.buffer(frame))
                .sampled_image(1, albedo, &self.sampler)
                .sampled_image(2, normal, &self.sampler)
                .sampled_image(3, position, &self.sampler)
                .update();
        }
    }

    /// Rebuild present framebuffers and rebind the resized G-buffer.
    pub fn resize(&mut self, device: &Device, renderer: &Renderer, gbuffer: &GbufferPass) -> Result<()> {
        self.target.rebuild(device, renderer)?;
        self.bind_gbuffer(device, gbuffer);
        Ok(())
    }

    pub fn destroy(self, device: &Device) {
        self.pipeline.destroy(device);
        self.sampler.destroy(device);
        self.layout.destroy(device);
        self.target.destroy(device);
        self.uniforms.destroy(device);
    }
}

impl Pass for LightingPass {
    fn name(&self) -> &'static str {
        "lighting"
    }

    fn update_uniforms_data(&mut self, device: &Device, view: &FrameView<'_>) {
        let scene = view.scene;
        if scene.lights.len() > self.max_lights {
            warn!(
                lights = scene.lights.len(),
                max_lights = self.max_lights,
                frame = %view.frame,
                "light array full, extra lights ignored"
            );
        }
        let lights: Vec<GpuLight> = scene
            .lights
            .iter()
            .take(self.max_lights)
            .map(|light| GpuLight {
                position_radius: light.position.extend(light.radius).to_array(),
                color: light.color.extend(1.0).to_array(),
            })
            .collect();
        let header = LightingUniforms {
            eye: scene.camera.position.extend(1.0).to_array(),
            ambient: scene.ambient.extend(0.0).to_array(),
            light_count: lights.len() as u32,
            _pad: [0; 3],
        };

        self.bytes.clear();
        self.bytes.extend_from_slice(bytemuck::bytes_of(&header));
        self.bytes.extend_from_slice(bytemuck::cast_slice(&lights));
        self.uniforms.write(device, view.frame, &self.bytes);
    }

    fn update_uniforms(&self, cmd: &mut CommandList<'_>, frame: FrameIndex) {
        self.uniforms.record_upload(cmd, frame);
    }

    fn draw(&self, cmd: &mut CommandList<'_>, view: &FrameView<'_>) {
        let framebuffer = self.target.framebuffer(view.frame);
        cmd.begin_render_pass(
            self.target.render_pass(),
            framebuffer,
            &[ClearValue::Color([0.0, 0.0, 0.0, 1.0])],
        );
        cmd.set_viewport_scissor(framebuffer.extent());
        cmd.bind_pipeline(&self.pipeline);
        cmd.bind_descriptor_set(0, self.sets[view.frame]);
        cmd.draw(3, 1, 0, 0);
        cmd.end_render_pass();
    }
}
