//! Geometry pass: rasterizes every instance into albedo, normal and
//! position attachments plus depth.

use ash::vk;
use hashbrown::HashMap;
use tracing::{debug, warn};

use umbra_core::{MaterialHandle, Vertex};
use umbra_gpu::backend::{AttachmentDesc, ClearValue, RenderPassDesc, SamplerDesc};
use umbra_gpu::{
    CommandList, DescriptorPool, DescriptorSetLayout, DescriptorSetLayoutBuilder, DescriptorWriter,
    Device, FrameIndex, Framebuffer, GpuStreamer, GraphicsPipeline, GraphicsPipelineConfig,
    ImageBarrier, ImageBuilder, ImageId, ImageViewBuilder, ImageViewId, PerFrame, RenderPass,
    Result, Sampler,
};

use super::{FrameView, Pass, PassSetup};
use crate::camera::CameraUniforms;
use crate::scene::Scene;
use crate::uniforms::UniformRing;

/// Albedo, normal and world position.
pub const GBUFFER_COLOR_FORMATS: [vk::Format; 3] = [
    vk::Format::R8G8B8A8_UNORM,
    vk::Format::R16G16B16A16_SFLOAT,
    vk::Format::R16G16B16A16_SFLOAT,
];
pub const GBUFFER_DEPTH_FORMAT: vk::Format = vk::Format::D32_SFLOAT;

/// Per-instance entry of the object uniform array.
#[repr(C)]
#[derive(Clone, Copy, Debug, bytemuck::Pod, bytemuck::Zeroable)]
pub struct ObjectUniforms {
    pub model: [[f32; 4]; 4],
}

impl ObjectUniforms {
    pub const SIZE: u64 = std::mem::size_of::<Self>() as u64;
}

/// Attachments of one frame slot.
struct Targets {
    colors: [ImageId; 3],
    color_views: [ImageViewId; 3],
    depth: ImageId,
    depth_view: ImageViewId,
}

impl Targets {
    fn destroy(self, device: &Device) {
        for view in self.color_views {
            device.destroy_image_view(view);
        }
        device.destroy_image_view(self.depth_view);
        for image in self.colors {
            device.destroy_image(image);
        }
        device.destroy_image(self.depth);
    }
}

/// Deferred geometry pass.
pub struct GbufferPass {
    camera: UniformRing,
    objects: UniformRing,
    targets: PerFrame<Targets>,
    render_pass: RenderPass,
    framebuffers: PerFrame<Framebuffer>,
    frame_layout: DescriptorSetLayout,
    material_layout: DescriptorSetLayout,
    frame_sets: PerFrame<vk::DescriptorSet>,
    material_sets: HashMap<MaterialHandle, vk::DescriptorSet>,
    sampler: Sampler,
    pipeline: GraphicsPipeline,
    max_objects: usize,
    draw_count: PerFrame<usize>,
    extent: vk::Extent2D,
}

impl GbufferPass {
    /// Build the pass for the renderer's frame slots and extent.
    pub fn new(setup: &mut PassSetup<'_, '_>) -> Result<Self> {
        let device = setup.device;
        let frames = setup.renderer.frame_slots();
        let extent = setup.renderer.extent();
        let max_objects = setup.config.max_objects;

        let (camera, objects) = create_uniforms(setup, max_objects)?;
        let targets = create_images(device, frames, extent)?;
        let render_pass = create_render_pass(device)?;
        let framebuffers = create_framebuffers(device, &render_pass, &targets, extent)?;
        let (frame_layout, material_layout, frame_sets) =
            create_descriptor_sets(device, setup.descriptors, &camera, &objects)?;
        let sampler = Sampler::new(device, &SamplerDesc::default())?;
        let pipeline = create_pipeline(setup, &render_pass, &frame_layout, &material_layout)?;

        debug!(frames, max_objects, width = extent.width, height = extent.height, "gbuffer pass created");
        Ok(Self {
            camera,
            objects,
            targets,
            render_pass,
            framebuffers,
            frame_layout,
            material_layout,
            frame_sets,
            material_sets: HashMap::new(),
            sampler,
            pipeline,
            max_objects,
            draw_count: PerFrame::new(frames, |_| 0),
            extent,
        })
    }

    /// Capacity of the object uniform array.
    #[must_use]
    pub const fn max_objects(&self) -> usize {
        self.max_objects
    }

    /// Instances drawn by the last update of `frame`.
    #[must_use]
    pub fn draw_count(&self, frame: FrameIndex) -> usize {
        self.draw_count[frame]
    }

    /// Color attachment views of `frame`, in [`GBUFFER_COLOR_FORMATS`] order.
    #[must_use]
    pub fn color_views(&self, frame: FrameIndex) -> [ImageViewId; 3] {
        self.targets[frame].color_views
    }

    /// Color attachment images of `frame`.
    #[must_use]
    pub fn color_images(&self, frame: FrameIndex) -> [ImageId; 3] {
        self.targets[frame].colors
    }

    /// Number of materials with a descriptor set.
    #[must_use]
    pub fn prepared_materials(&self) -> usize {
        self.material_sets.len()
    }

    /// Create descriptor sets for resident materials of `scene` that have
    /// none yet. No pending GPU work may use existing sets.
    pub fn prepare_materials(
        &mut self,
        device: &Device,
        descriptors: &mut DescriptorPool,
        scene: &Scene,
        streamer: &GpuStreamer,
    ) -> Result<usize> {
        let mut created = 0;
        for handle in scene.materials() {
            if self.material_sets.contains_key(&handle) {
                continue;
            }
            let material = scene.assets.material(handle);
            let albedo = material.albedo_map.unwrap_or_else(|| scene.white_texture());
            let set = descriptors.allocate(device, &self.material_layout)?;
            DescriptorWriter::new(device, set)
                .uniform_buffer(0, streamer.material(handle).params)
                .sampled_image(1, streamer.texture(albedo).view, &self.sampler)
                .update();
            self.material_sets.insert(handle, set);
            created += 1;
        }
        if created > 0 {
            debug!(created, total = self.material_sets.len(), "material descriptor sets created");
        }
        Ok(created)
    }

    /// Recreate the attachments at a new size. The device must be idle.
    pub fn resize(&mut self, device: &Device, extent: vk::Extent2D) -> Result<()> {
        let targets = create_images(device, self.targets.len(), extent)?;
        let framebuffers = create_framebuffers(device, &self.render_pass, &targets, extent)?;
        for framebuffer in std::mem::replace(&mut self.framebuffers, framebuffers).into_inner() {
            framebuffer.destroy(device);
        }
        for old in std::mem::replace(&mut self.targets, targets).into_inner() {
            old.destroy(device);
        }
        self.extent = extent;
        Ok(())
    }

    pub fn destroy(self, device: &Device) {
        self.pipeline.destroy(device);
        self.sampler.destroy(device);
        self.frame_layout.destroy(device);
        self.material_layout.destroy(device);
        for framebuffer in self.framebuffers.into_inner() {
            framebuffer.destroy(device);
        }
        self.render_pass.destroy(device);
        for targets in self.targets.into_inner() {
            targets.destroy(device);
        }
        self.camera.destroy(device);
        self.objects.destroy(device);
    }
}

impl Pass for GbufferPass {
    fn name(&self) -> &'static str {
        "gbuffer"
    }

    fn update_uniforms_data(&mut self, device: &Device, view: &FrameView<'_>) {
        let mut camera = view.scene.camera.clone();
        camera.set_viewport(view.extent.width, view.extent.height);
        self.camera
            .write(device, view.frame, bytemuck::bytes_of(&camera.uniforms()));

        let instances = &view.scene.instances;
        if instances.len() > self.max_objects {
            warn!(
                instances = instances.len(),
                max_objects = self.max_objects,
                frame = %view.frame,
                "object uniform array full, extra instances not drawn"
            );
        }
        let objects: Vec<ObjectUniforms> = instances
            .iter()
            .take(self.max_objects)
            .map(|instance| ObjectUniforms {
                model: instance.transform.to_cols_array_2d(),
            })
            .collect();
        self.objects
            .write(device, view.frame, bytemuck::cast_slice(&objects));
        self.draw_count[view.frame] = objects.len();
    }

    fn update_uniforms(&self, cmd: &mut CommandList<'_>, frame: FrameIndex) {
        self.camera.record_upload(cmd, frame);
        self.objects.record_upload(cmd, frame);
    }

    fn draw(&self, cmd: &mut CommandList<'_>, view: &FrameView<'_>) {
        let frame = view.frame;
        let mut clears = vec![ClearValue::Color([0.0; 4]); GBUFFER_COLOR_FORMATS.len()];
        clears.push(ClearValue::DepthStencil {
            depth: 1.0,
            stencil: 0,
        });
        cmd.begin_render_pass(&self.render_pass, &self.framebuffers[frame], &clears);
        cmd.set_viewport_scissor(self.extent);
        cmd.bind_pipeline(&self.pipeline);
        cmd.bind_descriptor_set(0, self.frame_sets[frame]);

        let scene = view.scene;
        for (index, instance) in scene.instances.iter().take(self.draw_count[frame]).enumerate() {
            let material = scene.assets.model(instance.model).material;
            let Some(&set) = self.material_sets.get(&material) else {
                panic!("material {material:?} has no descriptor set; call prepare_materials after uploading");
            };
            let model = view.streamer.model(instance.model);
            cmd.bind_descriptor_set(1, set);
            cmd.push_constants(vk::ShaderStageFlags::VERTEX, &(index as u32).to_le_bytes());
            cmd.bind_vertex_buffer(0, model.vertex_buffer, 0);
            cmd.bind_index_buffer(model.index_buffer, 0);
            cmd.draw_indexed(model.index_count, 1, 0, 0, 0);
        }
        cmd.end_render_pass();

        // Lighting samples the color attachments.
        let device = cmd.device();
        let barriers: Vec<_> = self.targets[frame]
            .colors
            .iter()
            .map(|&image| {
                ImageBarrier::new(
                    &device.image(image),
                    vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
                    vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
                )
            })
            .collect();
        cmd.push_barriers(&barriers, &[]);
    }
}

fn create_uniforms(setup: &mut PassSetup<'_, '_>, max_objects: usize) -> Result<(UniformRing, UniformRing)> {
    let frames = setup.renderer.frame_slots();
    let camera = UniformRing::new(setup.device, "camera", CameraUniforms::SIZE, frames)?;
    let objects = UniformRing::new(
        setup.device,
        "objects",
        ObjectUniforms::SIZE * max_objects as u64,
        frames,
    )?;
    camera.prime(setup.device, setup.cmd);
    objects.prime(setup.device, setup.cmd);
    Ok((camera, objects))
}

fn create_images(device: &Device, frames: usize, extent: vk::Extent2D) -> Result<PerFrame<Targets>> {
    PerFrame::try_new(frames, |frame| {
        let mut colors = Vec::with_capacity(GBUFFER_COLOR_FORMATS.len());
        let mut color_views = Vec::with_capacity(GBUFFER_COLOR_FORMATS.len());
        for (i, &format) in GBUFFER_COLOR_FORMATS.iter().enumerate() {
            let image = ImageBuilder::new(device, extent.width, extent.height)
                .format(format)
                .usage(vk::ImageUsageFlags::COLOR_ATTACHMENT | vk::ImageUsageFlags::SAMPLED)
                .name(format!("gbuffer {i} {}", frame.get()))
                .build()?;
            color_views.push(ImageViewBuilder::new(device, image).build()?);
            colors.push(image);
        }
        let depth = ImageBuilder::new(device, extent.width, extent.height)
            .format(GBUFFER_DEPTH_FORMAT)
            .usage(vk::ImageUsageFlags::DEPTH_STENCIL_ATTACHMENT)
            .name(format!("gbuffer depth {}", frame.get()))
            .build()?;
        let depth_view = ImageViewBuilder::new(device, depth).build()?;
        Ok(Targets {
            colors: [colors[0], colors[1], colors[2]],
            color_views: [color_views[0], color_views[1], color_views[2]],
            depth,
            depth_view,
        })
    })
}

fn create_render_pass(device: &Device) -> Result<RenderPass> {
    let colors = GBUFFER_COLOR_FORMATS
        .iter()
        .map(|&format| AttachmentDesc {
            format,
            load_op: vk::AttachmentLoadOp::CLEAR,
            store_op: vk::AttachmentStoreOp::STORE,
            initial_layout: vk::ImageLayout::UNDEFINED,
            final_layout: vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
        })
        .collect();
    RenderPass::new(
        device,
        RenderPassDesc {
            colors,
            depth: Some(AttachmentDesc {
                format: GBUFFER_DEPTH_FORMAT,
                load_op: vk::AttachmentLoadOp::CLEAR,
                store_op: vk::AttachmentStoreOp::DONT_CARE,
                initial_layout: vk::ImageLayout::UNDEFINED,
                final_layout: vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL,
            }),
        },
    )
}

fn create_framebuffers(
    device: &Device,
    render_pass: &RenderPass,
    targets: &PerFrame<Targets>,
    extent: vk::Extent2D,
) -> Result<PerFrame<Framebuffer>> {
    PerFrame::try_new(targets.len(), |frame| {
        let t = &targets[frame];
        let attachments = [t.color_views[0], t.color_views[1], t.color_views[2], t.depth_view];
        Framebuffer::new(device, render_pass, &attachments, extent)
    })
}

fn create_descriptor_sets(
    device: &Device,
    descriptors: &mut DescriptorPool,
    camera: &UniformRing,
    objects: &UniformRing,
) -> Result<(DescriptorSetLayout, DescriptorSetLayout, PerFrame<vk::DescriptorSet>)> {
    let frame_layout = DescriptorSetLayoutBuilder::new()
        .uniform_buffer(0, vk::ShaderStageFlags::VERTEX | vk::ShaderStageFlags::FRAGMENT)
        .uniform_buffer(1, vk::ShaderStageFlags::VERTEX)
        .build(device)?;
    let material_layout = DescriptorSetLayoutBuilder::new()
        .uniform_buffer(0, vk::ShaderStageFlags::FRAGMENT)
        .sampled_image(1, vk::ShaderStageFlags::FRAGMENT)
        .build(device)?;
    let frame_sets = PerFrame::try_new(camera.frames(), |frame| {
        let set = descriptors.allocate(device, &frame_layout)?;
        DescriptorWriter::new(device, set)
            .uniform_buffer(0, camera.buffer(frame))
            .uniform_buffer(1, objects.buffer(frame))
            .update();
        Ok::<_, umbra_gpu::GpuError>(set)
    })?;
    Ok((frame_layout, material_layout, frame_sets))
}

fn create_pipeline(
    setup: &PassSetup<'_, '_>,
    render_pass: &RenderPass,
    frame_layout: &DescriptorSetLayout,
    material_layout: &DescriptorSetLayout,
) -> Result<GraphicsPipeline> {
    let attribute = |location, format, offset| vk::VertexInputAttributeDescription {
        location,
        binding: 0,
        format,
        offset,
    };
    let config = GraphicsPipelineConfig {
        vertex_shader: setup.shaders.gbuffer.vertex.clone(),
        fragment_shader: setup.shaders.gbuffer.fragment.clone(),
        vertex_bindings: vec![vk::VertexInputBindingDescription {
            binding: 0,
            stride: Vertex::SIZE as u32,
            input_rate: vk::VertexInputRate::VERTEX,
        }],
        vertex_attributes: vec![
            attribute(0, vk::Format::R32G32B32_SFLOAT, 0),
            attribute(1, vk::Format::R32G32_SFLOAT, Vertex::UV_OFFSET),
            attribute(2, vk::Format::R32G32B32_SFLOAT, Vertex::NORMAL_OFFSET),
            attribute(3, vk::Format::R32G32B32_SFLOAT, Vertex::TANGENT_OFFSET),
        ],
        color_attachment_count: GBUFFER_COLOR_FORMATS.len() as u32,
        ..GraphicsPipelineConfig::default()
    };
    let push_constants = [vk::PushConstantRange {
        stage_flags: vk::ShaderStageFlags::VERTEX,
        offset: 0,
        size: std::mem::size_of::<u32>() as u32,
    }];
    GraphicsPipeline::new(
        setup.device,
        &config,
        render_pass,
        &[frame_layout.raw(), material_layout.raw()],
        &push_constants,
    )
}
