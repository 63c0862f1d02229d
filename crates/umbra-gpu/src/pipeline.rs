//! Render passes, framebuffers, samplers and graphics pipelines.

use ash::vk;

use crate::backend::{FramebufferDesc, RenderPassDesc, SamplerDesc};
use crate::device::{Device, ImageViewId};
use crate::error::{GpuError, Result};

/// First word of every SPIR-V module.
pub const SPIRV_MAGIC: u32 = 0x0723_0203;

/// Convert SPIR-V bytes to words.
pub fn spirv_from_bytes(bytes: &[u8]) -> Result<Vec<u32>> {
    if bytes.len() % 4 != 0 {
        return Err(GpuError::InvalidShader(format!(
            "SPIR-V length {} is not a multiple of 4",
            bytes.len()
        )));
    }
    let words: Vec<u32> = bytes
        .chunks_exact(4)
        .map(|chunk| u32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
        .collect();
    validate_spirv(&words)?;
    Ok(words)
}

/// Check the SPIR-V magic number.
pub fn validate_spirv(words: &[u32]) -> Result<()> {
    match words.first() {
        Some(&SPIRV_MAGIC) => Ok(()),
        Some(&other) => Err(GpuError::InvalidShader(format!(
            "bad SPIR-V magic {other:#010x}"
        ))),
        None => Err(GpuError::InvalidShader("empty SPIR-V module".into())),
    }
}

/// Graphics pipeline configuration.
#[derive(Clone, Debug)]
pub struct GraphicsPipelineConfig {
    pub vertex_shader: Vec<u32>,
    pub fragment_shader: Vec<u32>,
    pub vertex_bindings: Vec<vk::VertexInputBindingDescription>,
    pub vertex_attributes: Vec<vk::VertexInputAttributeDescription>,
    pub topology: vk::PrimitiveTopology,
    pub polygon_mode: vk::PolygonMode,
    pub cull_mode: vk::CullModeFlags,
    pub front_face: vk::FrontFace,
    pub depth_test: bool,
    pub depth_write: bool,
    /// Number of color attachments in the subpass.
    pub color_attachment_count: u32,
    /// Alpha blending on every color attachment.
    pub alpha_blend: bool,
}

impl Default for GraphicsPipelineConfig {
    fn default() -> Self {
        Self {
            vertex_shader: Vec::new(),
            fragment_shader: Vec::new(),
            vertex_bindings: Vec::new(),
            vertex_attributes: Vec::new(),
            topology: vk::PrimitiveTopology::TRIANGLE_LIST,
            polygon_mode: vk::PolygonMode::FILL,
            cull_mode: vk::CullModeFlags::BACK,
            front_face: vk::FrontFace::COUNTER_CLOCKWISE,
            depth_test: true,
            depth_write: true,
            color_attachment_count: 1,
            alpha_blend: false,
        }
    }
}

/// Render pass with its attachment description.
pub struct RenderPass {
    raw: vk::RenderPass,
    desc: RenderPassDesc,
}

impl RenderPass {
    /// Create a single-subpass render pass.
    pub fn new(device: &Device, desc: RenderPassDesc) -> Result<Self> {
        assert!(
            !desc.colors.is_empty() || desc.depth.is_some(),
            "render pass without attachments"
        );
        let raw = device.backend().create_render_pass(&desc)?;
        Ok(Self { raw, desc })
    }

    /// Raw handle.
    pub const fn raw(&self) -> vk::RenderPass {
        self.raw
    }

    /// Attachment description.
    pub const fn desc(&self) -> &RenderPassDesc {
        &self.desc
    }

    /// Number of attachments a framebuffer must supply.
    pub fn attachment_count(&self) -> usize {
        self.desc.colors.len() + usize::from(self.desc.depth.is_some())
    }

    /// Destroy the render pass.
    pub fn destroy(self, device: &Device) {
        device.backend().destroy_render_pass(self.raw);
    }
}

/// Framebuffer bound to a render pass.
pub struct Framebuffer {
    raw: vk::Framebuffer,
    extent: vk::Extent2D,
}

impl Framebuffer {
    /// Create a framebuffer from views in render pass attachment order.
    pub fn new(
        device: &Device,
        render_pass: &RenderPass,
        attachments: &[ImageViewId],
        extent: vk::Extent2D,
    ) -> Result<Self> {
        assert_eq!(
            attachments.len(),
            render_pass.attachment_count(),
            "framebuffer attachment count does not match render pass"
        );
        let views: Vec<_> = attachments
            .iter()
            .map(|&id| device.image_view(id).raw)
            .collect();
        let raw = device.backend().create_framebuffer(&FramebufferDesc {
            render_pass: render_pass.raw(),
            attachments: &views,
            extent,
        })?;
        Ok(Self { raw, extent })
    }

    /// Raw handle.
    pub const fn raw(&self) -> vk::Framebuffer {
        self.raw
    }

    /// Framebuffer size.
    pub const fn extent(&self) -> vk::Extent2D {
        self.extent
    }

    /// Destroy the framebuffer.
    pub fn destroy(self, device: &Device) {
        device.backend().destroy_framebuffer(self.raw);
    }
}

/// Texture sampler.
pub struct Sampler {
    raw: vk::Sampler,
}

impl Sampler {
    /// Create a sampler.
    pub fn new(device: &Device, desc: &SamplerDesc) -> Result<Self> {
        let raw = device.backend().create_sampler(desc)?;
        Ok(Self { raw })
    }

    /// Raw handle.
    pub const fn raw(&self) -> vk::Sampler {
        self.raw
    }

    /// Destroy the sampler.
    pub fn destroy(self, device: &Device) {
        device.backend().destroy_sampler(self.raw);
    }
}

/// Graphics pipeline wrapper.
pub struct GraphicsPipeline {
    pub pipeline: vk::Pipeline,
    pub layout: vk::PipelineLayout,
}

impl GraphicsPipeline {
    /// Create a pipeline for subpass 0 of `render_pass`.
    pub fn new(
        device: &Device,
        config: &GraphicsPipelineConfig,
        render_pass: &RenderPass,
        descriptor_set_layouts: &[vk::DescriptorSetLayout],
        push_constant_ranges: &[vk::PushConstantRange],
    ) -> Result<Self> {
        validate_spirv(&config.vertex_shader)?;
        validate_spirv(&config.fragment_shader)?;
        assert_eq!(
            config.color_attachment_count as usize,
            render_pass.desc().colors.len(),
            "pipeline color attachment count does not match render pass"
        );

        let backend = device.backend();
        let layout = backend.create_pipeline_layout(descriptor_set_layouts, push_constant_ranges)?;
        let pipeline = match backend.create_graphics_pipeline(config, layout, render_pass.raw()) {
            Ok(pipeline) => pipeline,
            Err(err) => {
                backend.destroy_pipeline_layout(layout);
                return Err(err);
            }
        };
        Ok(Self { pipeline, layout })
    }

    /// Destroy the pipeline.
    pub fn destroy(self, device: &Device) {
        device.backend().destroy_pipeline(self.pipeline);
        device.backend().destroy_pipeline_layout(self.layout);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn spirv_words_are_little_endian() {
        let bytes = [0x03, 0x02, 0x23, 0x07, 0x00, 0x00, 0x01, 0x00];
        let words = spirv_from_bytes(&bytes).unwrap();
        assert_eq!(words, [SPIRV_MAGIC, 0x0001_0000]);
    }

    #[test]
    fn unaligned_spirv_rejected() {
        assert!(matches!(
            spirv_from_bytes(&[0x03, 0x02, 0x23]),
            Err(GpuError::InvalidShader(_))
        ));
    }

    #[test]
    fn wrong_magic_rejected() {
        assert!(validate_spirv(&[0xdead_beef]).is_err());
        assert!(validate_spirv(&[]).is_err());
    }

    #[test]
    fn default_config_is_opaque_triangles() {
        let config = GraphicsPipelineConfig::default();
        assert_eq!(config.topology, vk::PrimitiveTopology::TRIANGLE_LIST);
        assert!(config.depth_test);
        assert!(!config.alpha_blend);
        assert_eq!(config.color_attachment_count, 1);
    }
}
