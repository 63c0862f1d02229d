//! Wireframe overlay of instance bounding boxes.

use ash::vk;
use glam::Vec3;
use tracing::debug;

use umbra_gpu::{
    BufferId, ClearValue, CommandList, DescriptorSetLayout, DescriptorSetLayoutBuilder, DescriptorWriter, Device,
    FrameIndex, GraphicsPipeline, GraphicsPipelineConfig, PerFrame, Renderer, Result,
};

use super::{FrameView, Pass, PassSetup, PresentFramebuffers};
use crate::uniforms::{UniformRing, VertexRing};

const BOX_COLOR: [f32; 4] = [0.2, 1.0, 0.3, 1.0];
const VERTICES_PER_BOX: usize = 24;

/// Corner pairs; bit 0/1/2 of a corner index selects max x/y/z.
#[rustfmt::skip]
const BOX_EDGES: [(usize, usize); 12] = [
    (0, 1), (2, 3), (4, 5), (6, 7),
    (0, 2), (1, 3), (4, 6), (5, 7),
    (0, 4), (1, 5), (2, 6), (3, 7),
];

/// Line list vertex.
#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, bytemuck::Pod, bytemuck::Zeroable)]
pub struct LineVertex {
    pub position: [f32; 3],
    pub color: [f32; 4],
}

/// Debug overlay pass. Draws over the lit image when enabled.
pub struct DebugPass {
    uniforms: UniformRing,
    vertices: VertexRing,
    target: PresentFramebuffers,
    layout: DescriptorSetLayout,
    sets: PerFrame<vk::DescriptorSet>,
    pipeline: GraphicsPipeline,
    enabled: bool,
    max_boxes: usize,
    scratch: Vec<LineVertex>,
}

impl DebugPass {
    pub fn new(setup: &mut PassSetup<'_, '_>) -> Result<Self> {
        let device = setup.device;
        let frames = setup.renderer.frame_slots();
        let max_boxes = setup.config.max_objects;

        let uniforms = UniformRing::new(device, "debug view", 64, frames)?;
        uniforms.prime(device, setup.cmd);
        let vertices = VertexRing::new(
            device,
            "debug lines",
            std::mem::size_of::<LineVertex>() as u64,
            (max_boxes * VERTICES_PER_BOX) as u32,
            frames,
        )?;

        let target = PresentFramebuffers::new(device, setup.renderer, true)?;
        let layout = DescriptorSetLayoutBuilder::new()
            .uniform_buffer(0, vk::ShaderStageFlags::VERTEX)
            .build(device)?;
        let sets = PerFrame::try_new(frames, |frame| {
            let set = setup.descriptors.allocate(device, &layout)?;
            DescriptorWriter::new(device, set)
                .uniform_buffer(0, uniforms.buffer(frame))
                .update();
            Ok::<_, umbra_gpu::GpuError>(set)
        })?;

        let config = GraphicsPipelineConfig {
            vertex_shader: setup.shaders.debug.vertex.clone(),
            fragment_shader: setup.shaders.debug.fragment.clone(),
            vertex_bindings: vec![vk::VertexInputBindingDescription {
                binding: 0,
                stride: std::mem::size_of::<LineVertex>() as u32,
                input_rate: vk::VertexInputRate::VERTEX,
            }],
            vertex_attributes: vec![
                vk::VertexInputAttributeDescription {
                    location: 0,
                    binding: 0,
                    format: vk::Format::R32G32B32_SFLOAT,
                    offset: 0,
                },
                vk::VertexInputAttributeDescription {
                    location: 1,
                    binding: 0,
                    format: vk::Format::R32G32B32A32_SFLOAT,
                    offset: 12,
                },
            ],
            topology: vk::PrimitiveTopology::LINE_LIST,
            cull_mode: vk::CullModeFlags::NONE,
            depth_test: false,
            depth_write: false,
            ..GraphicsPipelineConfig::default()
        };
        let pipeline = GraphicsPipeline::new(device, &config, target.render_pass(), &[layout.raw()], &[])?;

        debug!(frames, max_boxes, enabled = setup.config.debug_overlay, "debug pass created");
        Ok(Self {
            uniforms,
            vertices,
            target,
            layout,
            sets,
            pipeline,
            enabled: setup.config.debug_overlay,
            max_boxes,
            scratch: Vec::new(),
        })
    }

    #[must_use]
    pub const fn enabled(&self) -> bool {
        self.enabled
    }

    pub fn set_enabled(&mut self, enabled: bool) {
        self.enabled = enabled;
    }

    /// Line vertices written for `frame` by the last update.
    #[must_use]
    pub fn vertex_count(&self, frame: FrameIndex) -> u32 {
        self.vertices.count(frame)
    }

    /// Staging, uniform and vertex buffers of `frame`.
    #[must_use]
    pub fn frame_buffers(&self, frame: FrameIndex) -> [BufferId; 3] {
        [self.uniforms.staging(frame), self.uniforms.buffer(frame), self.vertices.buffer(frame)]
    }

    pub fn resize(&mut self, device: &Device, renderer: &Renderer) -> Result<()> {
        self.target.rebuild(device, renderer)
    }

    pub fn destroy(self, device: &Device) {
        self.pipeline.destroy(device);
        self.layout.destroy(device);
        self.target.destroy(device);
        self.vertices.destroy(device);
        self.uniforms.destroy(device);
    }
}

impl Pass for DebugPass {
    fn name(&self) -> &'static str {
        "debug"
    }

    fn is_active(&self) -> bool {
        self.enabled
    }

    fn update_uniforms_data(&mut self, device: &Device, view: &FrameView<'_>) {
        let scene = view.scene;
        let mut camera = scene.camera.clone();
        camera.set_viewport(view.extent.width, view.extent.height);
        let view_projection = camera.view_projection_matrix().to_cols_array();
        self.uniforms
            .write(device, view.frame, bytemuck::cast_slice(&view_projection));

        self.scratch.clear();
        for instance in scene.instances.iter().take(self.max_boxes) {
            let (min, max) = scene.instance_bounds(instance);
            push_box(&mut self.scratch, min, max);
        }
        self.vertices.write(device, view.frame, &self.scratch);
    }

    fn update_uniforms(&self, cmd: &mut CommandList<'_>, frame: FrameIndex) {
        self.uniforms.record_upload(cmd, frame);
        self.vertices.record_upload(cmd, frame);
    }

    fn draw(&self, cmd: &mut CommandList<'_>, view: &FrameView<'_>) {
        let count = self.vertices.count(view.frame);
        if count == 0 {
            return;
        }
        let framebuffer = self.target.framebuffer(view.frame);
        cmd.begin_render_pass(
            self.target.render_pass(),
            framebuffer,
            &[ClearValue::Color([0.0; 4])],
        );
        cmd.set_viewport_scissor(framebuffer.extent());
        cmd.bind_pipeline(&self.pipeline);
        cmd.bind_descriptor_set(0, self.sets[view.frame]);
        cmd.bind_vertex_buffer(0, self.vertices.buffer(view.frame), 0);
        cmd.draw(count, 1, 0, 0);
        cmd.end_render_pass();
    }
}

/// Append the 12 edges of an axis-aligned box.
fn push_box(out: &mut Vec<LineVertex>, min: Vec3, max: Vec3) {
    let corner = |i: usize| {
        [
            if i & 1 == 0 { min.x } else { max.x },
            if i & 2 == 0 { min.y } else { max.y },
            if i & 4 == 0 { min.z } else { max.z },
        ]
    };
    for (a, b) in BOX_EDGES {
        out.push(LineVertex {
            position: corner(a),
            color: BOX_COLOR,
        });
        out.push(LineVertex {
            position: corner(b),
            color: BOX_COLOR,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn box_edges_are_axis_aligned() {
        let mut lines = Vec::new();
        push_box(&mut lines, Vec3::splat(-1.0), Vec3::new(1.0, 2.0, 3.0));
        assert_eq!(lines.len(), VERTICES_PER_BOX);
        for pair in lines.chunks(2) {
            let (a, b) = (pair[0].position, pair[1].position);
            let differing = (0..3).filter(|&i| a[i] != b[i]).count();
            assert_eq!(differing, 1, "edge {a:?} -> {b:?}");
        }
    }

    #[test]
    fn line_vertex_layout() {
        assert_eq!(std::mem::size_of::<LineVertex>(), 28);
    }
}
