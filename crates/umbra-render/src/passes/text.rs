//! Screen-space text overlay using the built-in glyph atlas.

use ash::vk;
use tracing::{debug, warn};

use umbra_gpu::backend::SamplerDesc;
use umbra_gpu::{
    BufferId, ClearValue, CommandList, DescriptorSetLayout, DescriptorSetLayoutBuilder, DescriptorWriter,
    Device, FrameIndex, GpuStreamer, GraphicsPipeline, GraphicsPipelineConfig, PerFrame, Renderer,
    Result, Sampler,
};

use super::{FrameView, Pass, PassSetup, PresentFramebuffers};
use crate::font::{self, GLYPH_HEIGHT, GLYPH_WIDTH};
use crate::scene::{is_glyph_atlas, Scene};
use crate::uniforms::{UniformRing, VertexRing};

/// Glyphs drawn per frame; further glyphs are dropped.
pub const MAX_GLYPHS: usize = 2048;
const VERTICES_PER_GLYPH: usize = 6;

/// One line of overlay text. `position` is the top-left corner in pixels.
#[derive(Clone, Debug, PartialEq)]
pub struct TextLine {
    pub text: String,
    pub position: [f32; 2],
    /// Pixels per atlas texel.
    pub scale: f32,
    pub color: [f32; 4],
}

impl TextLine {
    pub fn new(text: impl Into<String>, position: [f32; 2]) -> Self {
        Self {
            text: text.into(),
            position,
            scale: 3.0,
            color: [1.0; 4],
        }
    }

    #[must_use]
    pub const fn with_scale(mut self, scale: f32) -> Self {
        self.scale = scale;
        self
    }

    #[must_use]
    pub const fn with_color(mut self, color: [f32; 4]) -> Self {
        self.color = color;
        self
    }
}

/// Glyph quad corner, in pixels.
#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, bytemuck::Pod, bytemuck::Zeroable)]
pub struct GlyphVertex {
    pub position: [f32; 2],
    pub uv: [f32; 2],
    pub color: [f32; 4],
}

#[repr(C)]
#[derive(Clone, Copy, Debug, bytemuck::Pod, bytemuck::Zeroable)]
struct TextUniforms {
    screen: [f32; 2],
    _pad: [f32; 2],
}

/// Text overlay pass. Active when enabled and there is text to draw.
pub struct TextPass {
    uniforms: UniformRing,
    vertices: VertexRing,
    target: PresentFramebuffers,
    layout: DescriptorSetLayout,
    sets: PerFrame<vk::DescriptorSet>,
    sampler: Sampler,
    pipeline: GraphicsPipeline,
    enabled: bool,
    lines: Vec<TextLine>,
    scratch: Vec<GlyphVertex>,
}

impl TextPass {
    /// Build the pass. The scene's glyph atlas must already be resident.
    pub fn new(setup: &mut PassSetup<'_, '_>, scene: &Scene, streamer: &GpuStreamer) -> Result<Self> {
        let device = setup.device;
        let frames = setup.renderer.frame_slots();
        let atlas = scene.font_texture();
        assert!(
            is_glyph_atlas(scene.assets.texture(atlas)),
            "font texture is not a single-channel glyph atlas"
        );

        let uniforms = UniformRing::new(
            device,
            "text",
            std::mem::size_of::<TextUniforms>() as u64,
            frames,
        )?;
        uniforms.prime(device, setup.cmd);
        let vertices = VertexRing::new(
            device,
            "text glyphs",
            std::mem::size_of::<GlyphVertex>() as u64,
            (MAX_GLYPHS * VERTICES_PER_GLYPH) as u32,
            frames,
        )?;

        let target = PresentFramebuffers::new(device, setup.renderer, true)?;
        let layout = DescriptorSetLayoutBuilder::new()
            .uniform_buffer(0, vk::ShaderStageFlags::VERTEX)
            .sampled_image(1, vk::ShaderStageFlags::FRAGMENT)
            .build(device)?;
        let sampler = Sampler::new(
            device,
            &SamplerDesc {
                filter: vk::Filter::NEAREST,
                address_mode: vk::SamplerAddressMode::CLAMP_TO_EDGE,
            },
        )?;
        let atlas_view = streamer.texture(atlas).view;
        let sets = PerFrame::try_new(frames, |frame| {
            let set = setup.descriptors.allocate(device, &layout)?;
            DescriptorWriter::new(device, set)
                .uniform_buffer(0, uniforms.buffer(frame))
                .sampled_image(1, atlas_view, &sampler)
                .update();
            Ok::<_, umbra_gpu::GpuError>(set)
        })?;

        let attribute = |location, format, offset| vk::VertexInputAttributeDescription {
            location,
            binding: 0,
            format,
            offset,
        };
        let config = GraphicsPipelineConfig {
            vertex_shader: setup.shaders.text.vertex.clone(),
            fragment_shader: setup.shaders.text.fragment.clone(),
            vertex_bindings: vec![vk::VertexInputBindingDescription {
                binding: 0,
                stride: std::mem::size_of::<GlyphVertex>() as u32,
                input_rate: vk::VertexInputRate::VERTEX,
            }],
            vertex_attributes: vec![
                attribute(0, vk::Format::R32G32_SFLOAT, 0),
                attribute(1, vk::Format::R32G32_SFLOAT, 8),
                attribute(2, vk::Format::R32G32B32A32_SFLOAT, 16),
            ],
            cull_mode: vk::CullModeFlags::NONE,
            depth_test: false,
            depth_write: false,
            alpha_blend: true,
            ..GraphicsPipelineConfig::default()
        };
        let pipeline = GraphicsPipeline::new(device, &config, target.render_pass(), &[layout.raw()], &[])?;

        debug!(frames, enabled = setup.config.text_overlay, "text pass created");
        Ok(Self {
            uniforms,
            vertices,
            target,
            layout,
            sets,
            sampler,
            pipeline,
            enabled: setup.config.text_overlay,
            lines: Vec::new(),
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

    /// Replace the overlay text.
    pub fn set_lines(&mut self, lines: Vec<TextLine>) {
        self.lines = lines;
    }

    pub fn push_line(&mut self, line: TextLine) {
        self.lines.push(line);
    }

    pub fn clear(&mut self) {
        self.lines.clear();
    }

    #[must_use]
    pub fn lines(&self) -> &[TextLine] {
        &self.lines
    }

    /// Glyph vertices written for `frame` by the last update.
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
        self.sampler.destroy(device);
        self.layout.destroy(device);
        self.target.destroy(device);
        self.vertices.destroy(device);
        self.uniforms.destroy(device);
    }
}

impl Pass for TextPass {
    fn name(&self) -> &'static str {
        "text"
    }

    fn is_active(&self) -> bool {
        self.enabled && !self.lines.is_empty()
    }

    fn update_uniforms_data(&mut self, device: &Device, view: &FrameView<'_>) {
        let uniforms = TextUniforms {
            screen: [view.extent.width as f32, view.extent.height as f32],
            _pad: [0.0; 2],
        };
        self.uniforms
            .write(device, view.frame, bytemuck::bytes_of(&uniforms));

        self.scratch.clear();
        let dropped = layout_lines(&self.lines, &mut self.scratch);
        if dropped > 0 {
            warn!(dropped, max_glyphs = MAX_GLYPHS, frame = %view.frame, "text overlay glyph limit reached");
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

/// Append two triangles per visible glyph. Returns the number of glyphs
/// that did not fit.
fn layout_lines(lines: &[TextLine], out: &mut Vec<GlyphVertex>) -> usize {
    let mut glyphs = 0;
    let mut dropped = 0;
    for line in lines {
        let advance = (GLYPH_WIDTH + 1) as f32 * line.scale;
        let (width, height) = (GLYPH_WIDTH as f32 * line.scale, GLYPH_HEIGHT as f32 * line.scale);
        let [mut x, y] = line.position;
        for ch in line.text.chars() {
            // Blank and unknown characters only advance.
            if let Some(index) = font::glyph_index(ch).filter(|&i| i != 0) {
                if glyphs == MAX_GLYPHS {
                    dropped += 1;
                } else {
                    let [u0, v0, u1, v1] = font::glyph_uv(index);
                    let corner = |px: f32, py: f32, u: f32, v: f32| GlyphVertex {
                        position: [px, py],
                        uv: [u, v],
                        color: line.color,
                    };
                    let (x1, y1) = (x + width, y + height);
                    out.extend_from_slice(&[
                        corner(x, y, u0, v0),
                        corner(x1, y, u1, v0),
                        corner(x1, y1, u1, v1),
                        corner(x, y, u0, v0),
                        corner(x1, y1, u1, v1),
                        corner(x, y1, u0, v1),
                    ]);
                    glyphs += 1;
                }
            }
            x += advance;
        }
    }
    dropped
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn spaces_advance_without_quads() {
        let mut out = Vec::new();
        let dropped = layout_lines(&[TextLine::new("A B", [10.0, 20.0]).with_scale(2.0)], &mut out);
        assert_eq!(dropped, 0);
        assert_eq!(out.len(), 2 * VERTICES_PER_GLYPH);
        // 'B' starts two advances (2 * 4 texels * scale 2) to the right.
        assert_eq!(out[VERTICES_PER_GLYPH].position, [26.0, 20.0]);
        assert_eq!(out[2].position, [16.0, 30.0]);
    }

    #[test]
    fn glyphs_beyond_limit_are_dropped() {
        let text = "X".repeat(MAX_GLYPHS + 5);
        let mut out = Vec::new();
        let dropped = layout_lines(&[TextLine::new(text, [0.0, 0.0])], &mut out);
        assert_eq!(dropped, 5);
        assert_eq!(out.len(), MAX_GLYPHS * VERTICES_PER_GLYPH);
    }

    #[test]
    fn unknown_characters_are_skipped() {
        let mut out = Vec::new();
        layout_lines(&[TextLine::new("#?", [0.0, 0.0])], &mut out);
        assert!(out.is_empty());
    }

    #[test]
    fn glyph_vertex_layout() {
        assert_eq!(std::mem::size_of::<GlyphVertex>(), 32);
    }
}
