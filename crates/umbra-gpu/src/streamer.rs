//! CPU to GPU asset streaming.
//!
//! Uploads go through a host-visible staging buffer. Each `copy_*_to_gpu`
//! call maps the staging buffer once, packs the bytes of every resource in
//! the batch at 16-byte aligned offsets, unmaps, and then records for each
//! resource a barrier into the transfer state, the copy, and a barrier into
//! the state its shaders read it in. Resources that are already resident are
//! skipped, so assets shared between models are uploaded once.

use ash::vk;
use gpu_allocator::MemoryLocation;
use hashbrown::HashMap;

use umbra_core::{
    Assets, MaterialHandle, MaterialParams, ModelHandle, TextureFormat, TextureHandle,
};

use crate::barrier::{BufferBarrier, ImageBarrier};
use crate::command::CommandList;
use crate::deferred::StagingReleaseQueue;
use crate::device::{BufferId, Device, ImageId, ImageViewId};
use crate::error::Result;
use crate::renderer::Renderer;
use crate::resource::{BufferBuilder, ImageBuilder, ImageViewBuilder};
use crate::worker::WorkerContext;

/// Alignment of every region packed into a staging buffer.
pub const STAGING_ALIGNMENT: u64 = 16;

const fn align(size: u64) -> u64 {
    (size + STAGING_ALIGNMENT - 1) & !(STAGING_ALIGNMENT - 1)
}

/// Host-visible buffer that one upload batch is packed into.
#[derive(Debug)]
pub struct StagingBuffer {
    buffer: BufferId,
    size: u64,
    used: u64,
}

impl StagingBuffer {
    /// Underlying buffer.
    pub const fn buffer(&self) -> BufferId {
        self.buffer
    }

    /// Capacity in bytes.
    pub const fn size(&self) -> u64 {
        self.size
    }

    /// Bytes packed so far.
    pub const fn used(&self) -> u64 {
        self.used
    }

    /// Reserve `len` bytes, returning their offset.
    fn reserve(&mut self, len: u64) -> u64 {
        let offset = self.used;
        let end = offset + align(len);
        assert!(
            end <= self.size,
            "staging buffer overflow: {end} bytes needed, {} available",
            self.size
        );
        self.used = end;
        offset
    }
}

/// Vertex and index buffers of a resident model.
#[derive(Clone, Copy, Debug)]
pub struct GpuModel {
    pub vertex_buffer: BufferId,
    pub index_buffer: BufferId,
    pub vertex_count: u32,
    pub index_count: u32,
}

/// Parameter buffer of a resident material.
#[derive(Clone, Copy, Debug)]
pub struct GpuMaterial {
    pub params: BufferId,
}

/// Image and view of a resident texture.
#[derive(Clone, Copy, Debug)]
pub struct GpuTexture {
    pub image: ImageId,
    pub view: ImageViewId,
}

/// Counts of what one upload moved.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct UploadReport {
    pub models: usize,
    pub materials: usize,
    pub textures: usize,
    pub staging_bytes: u64,
}

impl UploadReport {
    /// Returns true if nothing needed uploading.
    pub const fn is_empty(&self) -> bool {
        self.staging_bytes == 0
    }
}

const fn texture_format(format: TextureFormat) -> vk::Format {
    match format {
        TextureFormat::Rgba8Unorm => vk::Format::R8G8B8A8_UNORM,
        TextureFormat::Rgba8Srgb => vk::Format::R8G8B8A8_SRGB,
        TextureFormat::R8Unorm => vk::Format::R8_UNORM,
    }
}

/// Owns GPU copies of scene assets and the staging buffers used to fill them.
#[derive(Default)]
pub struct GpuStreamer {
    models: HashMap<ModelHandle, GpuModel>,
    materials: HashMap<MaterialHandle, GpuMaterial>,
    textures: HashMap<TextureHandle, GpuTexture>,
    release: StagingReleaseQueue,
}

impl GpuStreamer {
    /// Create a streamer with nothing resident.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a host-visible staging buffer of `size` bytes.
    pub fn create_staging_buffer(&self, device: &Device, size: u64) -> Result<StagingBuffer> {
        let buffer = BufferBuilder::new(device, size)
            .usage(vk::BufferUsageFlags::TRANSFER_SRC)
            .memory(MemoryLocation::CpuToGpu)
            .name("staging")
            .build()?;
        tracing::debug!(size, "staging buffer created");
        Ok(StagingBuffer {
            buffer,
            size,
            used: 0,
        })
    }

    /// Returns true if `model` has been uploaded.
    pub fn is_model_loaded(&self, model: ModelHandle) -> bool {
        self.models.contains_key(&model)
    }

    /// Returns true if `material` has been uploaded.
    pub fn is_material_loaded(&self, material: MaterialHandle) -> bool {
        self.materials.contains_key(&material)
    }

    /// Returns true if `texture` has been uploaded.
    pub fn is_texture_loaded(&self, texture: TextureHandle) -> bool {
        self.textures.contains_key(&texture)
    }

    /// GPU buffers of a resident model. Panics if it was never uploaded.
    #[track_caller]
    pub fn model(&self, model: ModelHandle) -> GpuModel {
        match self.models.get(&model) {
            Some(gpu) => *gpu,
            None => panic!("model {model:?} is not resident"),
        }
    }

    /// GPU buffer of a resident material. Panics if it was never uploaded.
    #[track_caller]
    pub fn material(&self, material: MaterialHandle) -> GpuMaterial {
        match self.materials.get(&material) {
            Some(gpu) => *gpu,
            None => panic!("material {material:?} is not resident"),
        }
    }

    /// GPU image of a resident texture. Panics if it was never uploaded.
    #[track_caller]
    pub fn texture(&self, texture: TextureHandle) -> GpuTexture {
        match self.textures.get(&texture) {
            Some(gpu) => *gpu,
            None => panic!("texture {texture:?} is not resident"),
        }
    }

    /// Number of resident (models, materials, textures).
    pub fn resident_counts(&self) -> (usize, usize, usize) {
        (self.models.len(), self.materials.len(), self.textures.len())
    }

    fn pending_models(&self, models: &[ModelHandle]) -> Vec<ModelHandle> {
        let mut out: Vec<ModelHandle> = Vec::new();
        for &model in models {
            if !self.is_model_loaded(model) && !out.contains(&model) {
                out.push(model);
            }
        }
        out
    }

    fn pending_materials(&self, materials: &[MaterialHandle]) -> Vec<MaterialHandle> {
        let mut out: Vec<MaterialHandle> = Vec::new();
        for &material in materials {
            if !self.is_material_loaded(material) && !out.contains(&material) {
                out.push(material);
            }
        }
        out
    }

    fn pending_textures(&self, textures: &[TextureHandle]) -> Vec<TextureHandle> {
        let mut out: Vec<TextureHandle> = Vec::new();
        for &texture in textures {
            if !self.is_texture_loaded(texture) && !out.contains(&texture) {
                out.push(texture);
            }
        }
        out
    }

    /// Staging bytes needed for the non-resident models in `models`.
    pub fn geometry_upload_size(&self, assets: &Assets, models: &[ModelHandle]) -> u64 {
        self.pending_models(models)
            .into_iter()
            .map(|m| {
                let mesh = &assets.model(m).mesh;
                align(mesh.vertex_bytes().len() as u64) + align(mesh.index_bytes().len() as u64)
            })
            .sum()
    }

    /// Staging bytes needed for the non-resident materials in `materials`.
    pub fn material_upload_size(&self, materials: &[MaterialHandle]) -> u64 {
        self.pending_materials(materials).len() as u64
            * align(std::mem::size_of::<MaterialParams>() as u64)
    }

    /// Staging bytes needed for the non-resident textures in `textures`.
    pub fn texture_upload_size(&self, assets: &Assets, textures: &[TextureHandle]) -> u64 {
        self.pending_textures(textures)
            .into_iter()
            .map(|t| align(assets.texture(t).byte_len()))
            .sum()
    }

    /// Stage and record the upload of every non-resident model's vertex and
    /// index data. Returns the number of models uploaded.
    #[cfg_attr(feature = "profiling-tracy", tracing::instrument(level = "trace", skip_all))]
    pub fn copy_geometry_to_gpu(
        &mut self,
        device: &Device,
        assets: &Assets,
        models: &[ModelHandle],
        staging: &mut StagingBuffer,
        cmd: &mut CommandList<'_>,
    ) -> Result<usize> {
        let pending = self.pending_models(models);
        if pending.is_empty() {
            return Ok(0);
        }

        struct Region {
            model: ModelHandle,
            gpu: GpuModel,
            vertex_offset: u64,
            vertex_size: u64,
            index_offset: u64,
            index_size: u64,
        }

        let mut regions: Vec<Region> = Vec::with_capacity(pending.len());
        {
            let mut mapped = device.map_buffer(staging.buffer);
            for model in pending {
                let data = assets.model(model);
                let (vertices, indices) = (data.mesh.vertex_bytes(), data.mesh.index_bytes());
                let vertex_offset = staging.reserve(vertices.len() as u64);
                mapped.write(vertex_offset as usize, vertices);
                let index_offset = staging.reserve(indices.len() as u64);
                mapped.write(index_offset as usize, indices);

                let buffers = model_buffers(device, &data.name, vertices.len() as u64, indices.len() as u64);
                let (vertex_buffer, index_buffer) = match buffers {
                    Ok(buffers) => buffers,
                    Err(err) => {
                        for region in &regions {
                            destroy_model(device, &region.gpu);
                        }
                        return Err(err);
                    }
                };
                regions.push(Region {
                    model,
                    gpu: GpuModel {
                        vertex_buffer,
                        index_buffer,
                        vertex_count: data.mesh.vertices.len() as u32,
                        index_count: data.mesh.index_count(),
                    },
                    vertex_offset,
                    vertex_size: vertices.len() as u64,
                    index_offset,
                    index_size: indices.len() as u64,
                });
            }
        }

        make_staging_readable(device, staging, cmd);
        for region in &regions {
            upload_buffer(
                device,
                cmd,
                staging.buffer,
                region.vertex_offset,
                region.gpu.vertex_buffer,
                region.vertex_size,
                vk::AccessFlags::VERTEX_ATTRIBUTE_READ,
            );
            upload_buffer(
                device,
                cmd,
                staging.buffer,
                region.index_offset,
                region.gpu.index_buffer,
                region.index_size,
                vk::AccessFlags::INDEX_READ,
            );
            self.models.insert(region.model, region.gpu);
        }
        tracing::debug!(models = regions.len(), staged = staging.used, "geometry upload recorded");
        Ok(regions.len())
    }

    /// Stage and record the upload of every non-resident material's
    /// parameter block. Returns the number of materials uploaded.
    #[cfg_attr(feature = "profiling-tracy", tracing::instrument(level = "trace", skip_all))]
    pub fn copy_materials_to_gpu(
        &mut self,
        device: &Device,
        assets: &Assets,
        materials: &[MaterialHandle],
        staging: &mut StagingBuffer,
        cmd: &mut CommandList<'_>,
    ) -> Result<usize> {
        let pending = self.pending_materials(materials);
        if pending.is_empty() {
            return Ok(0);
        }

        let mut regions = Vec::with_capacity(pending.len());
        {
            let mut mapped = device.map_buffer(staging.buffer);
            for material in pending {
                let data = assets.material(material);
                let bytes = data.raw();
                let offset = staging.reserve(bytes.len() as u64);
                mapped.write(offset as usize, bytes);
                let params = BufferBuilder::new(device, bytes.len() as u64)
                    .usage(vk::BufferUsageFlags::UNIFORM_BUFFER | vk::BufferUsageFlags::TRANSFER_DST)
                    .name(format!("{} params", data.name))
                    .build();
                let params = match params {
                    Ok(params) => params,
                    Err(err) => {
                        for &(_, params, _, _) in &regions {
                            device.destroy_buffer(params);
                        }
                        return Err(err);
                    }
                };
                regions.push((material, params, offset, bytes.len() as u64));
            }
        }

        make_staging_readable(device, staging, cmd);
        for &(material, params, offset, size) in &regions {
            upload_buffer(
                device,
                cmd,
                staging.buffer,
                offset,
                params,
                size,
                vk::AccessFlags::UNIFORM_READ,
            );
            self.materials.insert(material, GpuMaterial { params });
        }
        tracing::debug!(materials = regions.len(), staged = staging.used, "material upload recorded");
        Ok(regions.len())
    }

    /// Stage and record the upload of every non-resident texture, leaving
    /// each image in `SHADER_READ_ONLY_OPTIMAL`. Returns the number of
    /// textures uploaded.
    #[cfg_attr(feature = "profiling-tracy", tracing::instrument(level = "trace", skip_all))]
    pub fn copy_textures_to_gpu(
        &mut self,
        device: &Device,
        assets: &Assets,
        textures: &[TextureHandle],
        staging: &mut StagingBuffer,
        cmd: &mut CommandList<'_>,
    ) -> Result<usize> {
        let pending = self.pending_textures(textures);
        if pending.is_empty() {
            return Ok(0);
        }

        let mut regions = Vec::with_capacity(pending.len());
        {
            let mut mapped = device.map_buffer(staging.buffer);
            for texture in pending {
                let data = assets.texture(texture);
                let offset = staging.reserve(data.byte_len());
                mapped.write(offset as usize, data.raw());
                let gpu = match texture_image(device, data) {
                    Ok(gpu) => gpu,
                    Err(err) => {
                        for (_, gpu, _) in &regions {
                            destroy_texture(device, gpu);
                        }
                        return Err(err);
                    }
                };
                regions.push((texture, gpu, offset));
            }
        }

        make_staging_readable(device, staging, cmd);
        for &(texture, gpu, offset) in &regions {
            let image = device.image(gpu.image);
            cmd.push_image_barrier(&ImageBarrier::new(
                &image,
                vk::ImageLayout::UNDEFINED,
                vk::ImageLayout::TRANSFER_DST_OPTIMAL,
            ));
            cmd.copy_buffer_to_image(staging.buffer, offset, gpu.image);
            cmd.push_image_barrier(&ImageBarrier::new(
                &image,
                vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
            ));
            self.textures.insert(texture, gpu);
        }
        tracing::debug!(textures = regions.len(), staged = staging.used, "texture upload recorded");
        Ok(regions.len())
    }

    /// Upload everything `models` needs and block until it is resident.
    ///
    /// Geometry, materials and textures share one staging buffer and one
    /// one-shot submission. Already resident assets cost nothing.
    pub fn upload_models(
        &mut self,
        device: &Device,
        renderer: &Renderer,
        worker: &mut WorkerContext,
        assets: &Assets,
        models: &[ModelHandle],
    ) -> Result<UploadReport> {
        self.upload_batch(device, renderer, worker, assets, models, &[])
    }

    /// Same as [`GpuStreamer::upload_models`], also uploading `extra_textures`
    /// that no model material references (glyph atlases, fallbacks).
    pub fn upload_batch(
        &mut self,
        device: &Device,
        renderer: &Renderer,
        worker: &mut WorkerContext,
        assets: &Assets,
        models: &[ModelHandle],
        extra_textures: &[TextureHandle],
    ) -> Result<UploadReport> {
        if self.batch_upload_size(assets, models, extra_textures) == 0 {
            tracing::debug!(models = models.len(), "all assets already resident");
            return Ok(UploadReport::default());
        }

        let mut cmd = worker.begin_one_shot(device);
        let recorded = self.record_batch(device, &mut cmd, assets, models, extra_textures);
        cmd.finalize();
        if let Ok(Some((_, staging))) = &recorded {
            renderer.submit_and_wait(device, &cmd);
            device.destroy_buffer(staging.buffer);
        }
        drop(cmd);
        worker.reset_one_shot(device);

        let report = recorded?.map(|(report, _)| report).unwrap_or_default();
        tracing::info!(
            models = report.models,
            materials = report.materials,
            textures = report.textures,
            bytes = report.staging_bytes,
            "scene assets uploaded"
        );
        Ok(report)
    }

    /// Staging bytes needed for everything [`GpuStreamer::record_batch`]
    /// would upload.
    pub fn batch_upload_size(
        &self,
        assets: &Assets,
        models: &[ModelHandle],
        extra_textures: &[TextureHandle],
    ) -> u64 {
        let (materials, textures) = batch_dependencies(assets, models, extra_textures);
        self.geometry_upload_size(assets, models)
            + self.material_upload_size(&materials)
            + self.texture_upload_size(assets, &textures)
    }

    /// Stage every non-resident asset of `models` and `extra_textures` and
    /// record its upload into `cmd` without submitting.
    ///
    /// Returns `None` when everything is resident. Otherwise the staging
    /// buffer must outlive the execution of `cmd`; hand it to
    /// [`GpuStreamer::retire_staging`] once `cmd` is submitted. On error
    /// nothing of the batch stays resident and `cmd` must not be submitted.
    pub fn record_batch(
        &mut self,
        device: &Device,
        cmd: &mut CommandList<'_>,
        assets: &Assets,
        models: &[ModelHandle],
        extra_textures: &[TextureHandle],
    ) -> Result<Option<(UploadReport, StagingBuffer)>> {
        let size = self.batch_upload_size(assets, models, extra_textures);
        if size == 0 {
            return Ok(None);
        }
        let (materials, textures) = batch_dependencies(assets, models, extra_textures);

        let pending_models = self.pending_models(models);
        let pending_materials = self.pending_materials(&materials);
        let pending_textures = self.pending_textures(&textures);
        let mut staging = self.create_staging_buffer(device, size)?;
        let recorded = self.copy_batch(device, cmd, assets, models, &materials, &textures, &mut staging);
        match recorded {
            Ok(report) => Ok(Some((report, staging))),
            Err(err) => {
                tracing::error!(%err, "upload batch failed, rolling back");
                self.evict(device, &pending_models, &pending_materials, &pending_textures);
                device.destroy_buffer(staging.buffer);
                Err(err)
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn copy_batch(
        &mut self,
        device: &Device,
        cmd: &mut CommandList<'_>,
        assets: &Assets,
        models: &[ModelHandle],
        materials: &[MaterialHandle],
        textures: &[TextureHandle],
        staging: &mut StagingBuffer,
    ) -> Result<UploadReport> {
        Ok(UploadReport {
            models: self.copy_geometry_to_gpu(device, assets, models, staging, cmd)?,
            materials: self.copy_materials_to_gpu(device, assets, materials, staging, cmd)?,
            textures: self.copy_textures_to_gpu(device, assets, textures, staging, cmd)?,
            staging_bytes: staging.used,
        })
    }

    /// Drop residency of the given assets and destroy their GPU copies.
    fn evict(
        &mut self,
        device: &Device,
        models: &[ModelHandle],
        materials: &[MaterialHandle],
        textures: &[TextureHandle],
    ) {
        for model in models {
            if let Some(gpu) = self.models.remove(model) {
                destroy_model(device, &gpu);
            }
        }
        for material in materials {
            if let Some(gpu) = self.materials.remove(material) {
                device.destroy_buffer(gpu.params);
            }
        }
        for texture in textures {
            if let Some(gpu) = self.textures.remove(texture) {
                destroy_texture(device, &gpu);
            }
        }
    }

    /// Hand `staging` over for destruction once frame `frame_number` has
    /// completed on the GPU.
    pub fn retire_staging(&mut self, device: &Device, staging: StagingBuffer, frame_number: u64) {
        self.release.retire(device, staging.buffer, frame_number);
    }

    /// Destroy retired staging buffers whose frames have completed.
    pub fn collect_garbage(&mut self, device: &Device, renderer: &Renderer) -> usize {
        self.release.collect(device, renderer)
    }

    /// Number of retired staging buffers not yet destroyed.
    pub fn pending_staging(&self) -> usize {
        self.release.pending_count()
    }

    /// Destroy every resident asset and retired staging buffer.
    ///
    /// The device must be idle.
    pub fn destroy(mut self, device: &Device) {
        self.release.flush(device);
        for (_, model) in self.models.drain() {
            destroy_model(device, &model);
        }
        for (_, material) in self.materials.drain() {
            device.destroy_buffer(material.params);
        }
        for (_, texture) in self.textures.drain() {
            destroy_texture(device, &texture);
        }
    }
}

/// Materials and textures a batch needs, each listed once.
fn batch_dependencies(
    assets: &Assets,
    models: &[ModelHandle],
    extra_textures: &[TextureHandle],
) -> (Vec<MaterialHandle>, Vec<TextureHandle>) {
    let materials = assets.materials_of(models);
    let mut textures = assets.textures_of(models);
    for &texture in extra_textures {
        if !textures.contains(&texture) {
            textures.push(texture);
        }
    }
    (materials, textures)
}

/// Vertex and index buffers for one model. Nothing is left behind on error.
fn model_buffers(device: &Device, name: &str, vertex_size: u64, index_size: u64) -> Result<(BufferId, BufferId)> {
    let vertex_buffer = BufferBuilder::new(device, vertex_size)
        .usage(vk::BufferUsageFlags::VERTEX_BUFFER | vk::BufferUsageFlags::TRANSFER_DST)
        .name(format!("{name} vertices"))
        .build()?;
    let index_buffer = BufferBuilder::new(device, index_size)
        .usage(vk::BufferUsageFlags::INDEX_BUFFER | vk::BufferUsageFlags::TRANSFER_DST)
        .name(format!("{name} indices"))
        .build();
    match index_buffer {
        Ok(index_buffer) => Ok((vertex_buffer, index_buffer)),
        Err(err) => {
            device.destroy_buffer(vertex_buffer);
            Err(err)
        }
    }
}

/// Image and view for one texture. Nothing is left behind on error.
fn texture_image(device: &Device, data: &umbra_core::Texture) -> Result<GpuTexture> {
    let image = ImageBuilder::new(device, data.width, data.height)
        .format(texture_format(data.format))
        .usage(vk::ImageUsageFlags::SAMPLED | vk::ImageUsageFlags::TRANSFER_DST)
        .name(data.name.clone())
        .build()?;
    match ImageViewBuilder::new(device, image).build() {
        Ok(view) => Ok(GpuTexture { image, view }),
        Err(err) => {
            device.destroy_image(image);
            Err(err)
        }
    }
}

fn destroy_model(device: &Device, model: &GpuModel) {
    device.destroy_buffer(model.vertex_buffer);
    device.destroy_buffer(model.index_buffer);
}

fn destroy_texture(device: &Device, texture: &GpuTexture) {
    device.destroy_image_view(texture.view);
    device.destroy_image(texture.image);
}

/// Make host writes to the staging buffer visible to transfer reads.
fn make_staging_readable(device: &Device, staging: &StagingBuffer, cmd: &mut CommandList<'_>) {
    cmd.push_buffer_barrier(&BufferBarrier::new(
        &device.buffer(staging.buffer),
        vk::AccessFlags::HOST_WRITE,
        vk::AccessFlags::TRANSFER_READ,
    ));
}

/// Barrier, copy, barrier for one device-local buffer.
fn upload_buffer(
    device: &Device,
    cmd: &mut CommandList<'_>,
    staging: BufferId,
    offset: u64,
    dst: BufferId,
    size: u64,
    read_access: vk::AccessFlags,
) {
    let buffer = device.buffer(dst);
    cmd.push_buffer_barrier(&BufferBarrier::new(
        &buffer,
        vk::AccessFlags::empty(),
        vk::AccessFlags::TRANSFER_WRITE,
    ));
    cmd.copy_buffer_to_buffer(staging, offset, dst, 0, size);
    cmd.push_buffer_barrier(&BufferBarrier::new(
        &buffer,
        vk::AccessFlags::TRANSFER_WRITE,
        read_access,
    ));
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::CommandPool;
    use crate::error::GpuError;
    use crate::headless::{HeadlessBackend, HeadlessConfig};
    use std::sync::Arc;
    use umbra_core::{EngineConfig, Material, MeshData, Model, Texture};

    struct Scene {
        assets: Assets,
        models: Vec<ModelHandle>,
        shared: TextureHandle,
    }

    /// Two cubes whose materials both sample one checker texture.
    fn scene() -> Scene {
        let mut assets = Assets::new();
        let shared = assets
            .textures
            .insert(Texture::checkerboard("checker", 8, 2, [255; 4], [0, 0, 0, 255]));
        let a = assets
            .materials
            .insert(Material::new("a").with_albedo_map(shared));
        let b = assets
            .materials
            .insert(Material::new("b").with_albedo_map(shared).with_albedo([1.0, 0.0, 0.0, 1.0]));
        let models = vec![
            assets.models.insert(Model::new("cube a", MeshData::cube(0.5), a)),
            assets.models.insert(Model::new("cube b", MeshData::cube(1.0), b)),
        ];
        Scene {
            assets,
            models,
            shared,
        }
    }

    fn setup() -> (Arc<HeadlessBackend>, Device) {
        let backend = Arc::new(HeadlessBackend::default());
        let device = Device::new(backend.clone());
        (backend, device)
    }

    #[test]
    fn uploaded_bytes_match_source() {
        let (backend, device) = setup();
        let scene = scene();
        let renderer = Renderer::new(&device, &EngineConfig::default(), 0).unwrap();
        let mut worker = renderer.create_worker_context(&device, "loader", 4).unwrap();
        let mut streamer = GpuStreamer::new();

        streamer
            .upload_models(&device, &renderer, &mut worker, &scene.assets, &scene.models)
            .unwrap();

        for &handle in &scene.models {
            let model = scene.assets.model(handle);
            let gpu = streamer.model(handle);
            assert_eq!(
                backend.buffer_contents(device.buffer(gpu.vertex_buffer).raw),
                model.mesh.vertex_bytes()
            );
            assert_eq!(
                backend.buffer_contents(device.buffer(gpu.index_buffer).raw),
                model.mesh.index_bytes()
            );
            let material = streamer.material(model.material);
            assert_eq!(
                backend.buffer_contents(device.buffer(material.params).raw),
                scene.assets.material(model.material).raw()
            );
        }

        let texture = streamer.texture(scene.shared);
        let raw = device.image(texture.image).raw;
        assert_eq!(backend.image_contents(raw), scene.assets.texture(scene.shared).raw());
        assert_eq!(backend.image_layout(raw), vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL);
    }

    #[test]
    fn shared_texture_staged_once() {
        let (backend, device) = setup();
        let scene = scene();
        let mut streamer = GpuStreamer::new();
        let textures = scene.assets.textures_of(&scene.models);
        let texture_bytes = scene.assets.texture(scene.shared).byte_len();

        assert_eq!(textures.len(), 1);
        assert_eq!(
            streamer.texture_upload_size(&scene.assets, &[scene.shared, scene.shared]),
            align(texture_bytes)
        );

        let mut staging = streamer
            .create_staging_buffer(&device, streamer.texture_upload_size(&scene.assets, &textures))
            .unwrap();
        let mut pool = CommandPool::new(&device, true).unwrap();
        let mut cmd = CommandList::begin(&device, &mut pool);
        let uploaded = streamer
            .copy_textures_to_gpu(&device, &scene.assets, &[scene.shared, scene.shared], &mut staging, &mut cmd)
            .unwrap();
        cmd.finalize();

        assert_eq!(uploaded, 1);
        assert_eq!(staging.used(), align(texture_bytes));
        let copies = backend
            .recorded_commands(cmd.raw())
            .iter()
            .filter(|c| matches!(c, crate::backend::Command::CopyBufferToImage { .. }))
            .count();
        assert_eq!(copies, 1);
    }

    #[test]
    fn resident_assets_are_skipped() {
        let (backend, device) = setup();
        let scene = scene();
        let renderer = Renderer::new(&device, &EngineConfig::default(), 0).unwrap();
        let mut worker = renderer.create_worker_context(&device, "loader", 4).unwrap();
        let mut streamer = GpuStreamer::new();

        let first = streamer
            .upload_models(&device, &renderer, &mut worker, &scene.assets, &scene.models[..1])
            .unwrap();
        assert_eq!((first.models, first.materials, first.textures), (1, 1, 1));

        let copied = backend.stats().bytes_copied;
        let second = streamer
            .upload_models(&device, &renderer, &mut worker, &scene.assets, &scene.models)
            .unwrap();
        assert_eq!((second.models, second.materials, second.textures), (1, 1, 0));
        let geometry = streamer.geometry_upload_size(&scene.assets, &scene.models);
        assert_eq!(geometry, 0);

        let again = streamer
            .upload_models(&device, &renderer, &mut worker, &scene.assets, &scene.models)
            .unwrap();
        assert!(again.is_empty());
        assert!(backend.stats().bytes_copied > copied);
        assert!(streamer.is_texture_loaded(scene.shared));
    }

    #[test]
    fn upload_sizes_are_aligned() {
        let scene = scene();
        let streamer = GpuStreamer::new();
        let cube = &scene.assets.model(scene.models[0]).mesh;
        assert_eq!(cube.vertex_bytes().len(), 24 * 44);
        assert_eq!(
            streamer.geometry_upload_size(&scene.assets, &scene.models[..1]),
            align(24 * 44) + align(36 * 4)
        );
        let materials = scene.assets.materials_of(&scene.models);
        assert_eq!(streamer.material_upload_size(&materials), 64);
    }

    #[test]
    #[should_panic(expected = "staging buffer overflow")]
    fn undersized_staging_panics() {
        let (_backend, device) = setup();
        let scene = scene();
        let mut streamer = GpuStreamer::new();
        let mut staging = streamer.create_staging_buffer(&device, 64).unwrap();
        let mut pool = CommandPool::new(&device, true).unwrap();
        let mut cmd = CommandList::begin(&device, &mut pool);
        let _ = streamer.copy_geometry_to_gpu(&device, &scene.assets, &scene.models, &mut staging, &mut cmd);
    }

    #[test]
    fn streamed_batch_staging_outlives_its_frame() {
        let (backend, device) = setup();
        let scene = scene();
        let mut renderer = Renderer::new(&device, &EngineConfig::default(), 0).unwrap();
        let mut worker = renderer.create_worker_context(&device, "main", 4).unwrap();
        let mut streamer = GpuStreamer::new();

        let frame = renderer.acquire_next_frame(&device);
        worker.reset_frame(&device, frame);
        let mut cmd = worker.begin(&device, frame);
        let (report, staging) = streamer
            .record_batch(&device, &mut cmd, &scene.assets, &scene.models, &[])
            .unwrap()
            .unwrap();
        assert_eq!((report.models, report.materials, report.textures), (2, 2, 1));
        cmd.push_image_barrier(&ImageBarrier::new(
            &device.image(renderer.present_target(frame).image),
            vk::ImageLayout::UNDEFINED,
            vk::ImageLayout::PRESENT_SRC_KHR,
        ));
        cmd.finalize();
        renderer.submit_command_lists(
            &device,
            &[&cmd],
            &[(renderer.image_available(), vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT)],
            &[&renderer.present_target(frame).render_finished],
            Some(renderer.frame_fence()),
        );
        streamer.retire_staging(&device, staging, renderer.frame_number());
        renderer.submit_presentation(&device, frame);

        assert_eq!(streamer.collect_garbage(&device, &renderer), 0);
        assert_eq!(streamer.pending_staging(), 1);
        renderer.wait_idle(&device);
        let before = backend.stats().live_buffers;
        assert_eq!(streamer.collect_garbage(&device, &renderer), 1);
        assert_eq!(backend.stats().live_buffers, before - 1);

        let model = scene.assets.model(scene.models[1]);
        let gpu = streamer.model(scene.models[1]);
        assert_eq!(
            backend.buffer_contents(device.buffer(gpu.vertex_buffer).raw),
            model.mesh.vertex_bytes()
        );
    }

    #[test]
    fn failed_batch_leaves_nothing_resident() {
        let scene = scene();
        let budgeted = |budget: Option<u64>| {
            let backend = Arc::new(HeadlessBackend::new(HeadlessConfig {
                memory_budget: budget,
                ..HeadlessConfig::default()
            }));
            let device = Device::new(backend.clone());
            let renderer = Renderer::new(&device, &EngineConfig::default(), 0).unwrap();
            let worker = renderer.create_worker_context(&device, "loader", 4).unwrap();
            (backend, device, renderer, worker)
        };

        let used = budgeted(None).0.stats().memory_used;
        let resident: u64 = scene
            .models
            .iter()
            .map(|&handle| {
                let model = scene.assets.model(handle);
                let material = scene.assets.material(model.material).raw().len();
                (model.mesh.vertex_bytes().len() + model.mesh.index_bytes().len() + material) as u64
            })
            .sum();
        let staging = GpuStreamer::new().batch_upload_size(&scene.assets, &scene.models, &[]);

        // Everything but the shared texture fits.
        let (backend, device, renderer, mut worker) = budgeted(Some(used + staging + resident));
        let mut streamer = GpuStreamer::new();
        let before = backend.stats();

        let result = streamer.upload_models(&device, &renderer, &mut worker, &scene.assets, &scene.models);

        assert!(matches!(result, Err(GpuError::AllocationFailed(_))));
        assert_eq!(streamer.resident_counts(), (0, 0, 0));
        let after = backend.stats();
        assert_eq!(after.live_buffers, before.live_buffers);
        assert_eq!(after.live_images, before.live_images);
        assert_eq!(after.memory_used, before.memory_used);
    }
}
