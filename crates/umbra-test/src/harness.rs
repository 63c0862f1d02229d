//! Headless frame-loop harness.
//!
//! [`HeadlessRenderer`] owns the whole stack on top of a
//! [`HeadlessBackend`]: device, frame ring, streamer and composer. Tests
//! drive frames through it and inspect the backend afterwards.

use std::path::Path;
use std::sync::Arc;

use ash::vk;
use glam::{Mat4, Vec3};
use image::{ImageBuffer, Rgba, RgbaImage};

use umbra_core::{Assets, EngineConfig, Material, MeshData, Model, Texture};
use umbra_gpu::headless::{HeadlessBackend, HeadlessConfig, HeadlessStats};
use umbra_gpu::{Device, FrameIndex, GpuStreamer, Renderer};
use umbra_render::{Camera, FrameComposer, FrameOutcome, PointLight, Scene, ShaderSet};

use crate::{Result, TestError};

/// Full renderer stack over a headless backend.
pub struct HeadlessRenderer {
    backend: Arc<HeadlessBackend>,
    device: Device,
    renderer: Renderer,
    streamer: GpuStreamer,
    composer: FrameComposer,
    scene: Scene,
}

impl HeadlessRenderer {
    /// Build the stack and upload `scene`. Shader modules are placeholders;
    /// the headless backend records draws without rasterizing them.
    pub fn new(headless: HeadlessConfig, config: &EngineConfig, scene: Scene) -> Result<Self> {
        let backend = Arc::new(HeadlessBackend::new(headless));
        let device = Device::new(backend.clone());
        let renderer = Renderer::new(&device, config, FrameComposer::CHAIN_SEMAPHORES)?;
        let mut streamer = GpuStreamer::new();
        let composer = FrameComposer::new(
            &device,
            &renderer,
            &mut streamer,
            &scene,
            config,
            &ShaderSet::stub(),
        )?;
        Ok(Self {
            backend,
            device,
            renderer,
            streamer,
            composer,
            scene,
        })
    }

    /// Record and submit one frame.
    pub fn render_frame(&mut self) -> Result<FrameOutcome> {
        Ok(self.composer.render_frame(
            &self.device,
            &mut self.renderer,
            &mut self.streamer,
            &self.scene,
        )?)
    }

    /// Render `count` frames, returning their outcomes.
    pub fn render_frames(&mut self, count: usize) -> Result<Vec<FrameOutcome>> {
        (0..count).map(|_| self.render_frame()).collect()
    }

    /// Upload whatever the scene gained since setup.
    pub fn upload_scene(&mut self) -> Result<umbra_gpu::UploadReport> {
        Ok(self.composer.upload_scene(
            &self.device,
            &self.renderer,
            &mut self.streamer,
            &self.scene,
        )?)
    }

    /// Resize the surface and every size-dependent pass resource.
    pub fn resize(&mut self, width: u32, height: u32) -> Result<()> {
        Ok(self
            .composer
            .resize(&self.device, &mut self.renderer, width, height)?)
    }

    /// Wait for all submitted work and read back the present image of
    /// `frame` as RGBA8.
    pub fn present_image(&self, frame: FrameIndex) -> Result<RgbaImage> {
        self.device.wait_idle();
        let target = self.renderer.present_target(frame);
        let image = self.device.image(target.image);
        let mut pixels = self.backend.image_contents(image.raw);
        if image.format == vk::Format::B8G8R8A8_UNORM || image.format == vk::Format::B8G8R8A8_SRGB {
            for texel in pixels.chunks_exact_mut(4) {
                texel.swap(0, 2);
            }
        }
        ImageBuffer::from_raw(image.extent.width, image.extent.height, pixels).ok_or_else(|| {
            TestError::ImageComparison(format!(
                "present image {frame} is not {}x{} RGBA8",
                image.extent.width, image.extent.height
            ))
        })
    }

    /// Write the present image of `frame` as a PNG, creating parent
    /// directories.
    pub fn save_present_image(&self, frame: FrameIndex, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        self.present_image(frame)?.save(path)?;
        tracing::info!(path = %path.display(), %frame, "present image saved");
        Ok(())
    }

    /// Counters of the headless backend.
    pub fn stats(&self) -> HeadlessStats {
        self.backend.stats()
    }

    pub fn backend(&self) -> &HeadlessBackend {
        &self.backend
    }

    pub const fn device(&self) -> &Device {
        &self.device
    }

    pub const fn renderer(&self) -> &Renderer {
        &self.renderer
    }

    pub const fn streamer(&self) -> &GpuStreamer {
        &self.streamer
    }

    pub const fn scene(&self) -> &Scene {
        &self.scene
    }

    pub fn scene_mut(&mut self) -> &mut Scene {
        &mut self.scene
    }

    pub const fn composer(&self) -> &FrameComposer {
        &self.composer
    }

    pub fn composer_mut(&mut self) -> &mut FrameComposer {
        &mut self.composer
    }

    /// Tear everything down in dependency order and return the final
    /// backend counters. Anything still live afterwards leaked.
    pub fn shutdown(self) -> HeadlessStats {
        self.composer.destroy(&self.device, &self.renderer);
        self.streamer.destroy(&self.device);
        self.renderer.destroy(&self.device);
        self.backend.stats()
    }
}

/// `count` cubes on a grid, alternating between two models whose
/// materials share one checkerboard texture, lit by two point lights.
pub fn cube_scene(count: usize) -> Result<Scene> {
    let mut assets = Assets::new();
    let checker = assets.textures.insert(Texture::checkerboard(
        "checker",
        16,
        4,
        [230, 230, 230, 255],
        [40, 40, 40, 255],
    ));
    let red = assets
        .materials
        .insert(Material::new("red").with_albedo([1.0, 0.2, 0.2, 1.0]).with_albedo_map(checker));
    let blue = assets
        .materials
        .insert(Material::new("blue").with_albedo([0.2, 0.2, 1.0, 1.0]).with_albedo_map(checker));
    let small = assets
        .models
        .insert(Model::new("small cube", MeshData::cube(0.25), red));
    let large = assets
        .models
        .insert(Model::new("large cube", MeshData::cube(0.45), blue));

    let mut scene = Scene::new(assets)?;
    let side = (count as f32).sqrt().ceil().max(1.0) as usize;
    for i in 0..count {
        let (x, z) = ((i % side) as f32, (i / side) as f32);
        let model = if i % 2 == 0 { small } else { large };
        scene.spawn(model, Mat4::from_translation(Vec3::new(x, 0.0, -z)));
    }
    scene.lights = vec![
        PointLight {
            position: Vec3::new(0.0, 4.0, 2.0),
            color: Vec3::ONE,
            radius: 20.0,
        },
        PointLight {
            position: Vec3::new(side as f32, 2.0, -(side as f32)),
            color: Vec3::new(1.0, 0.8, 0.6),
            radius: 12.0,
        },
    ];
    let center = Vec3::new(side as f32 / 2.0, 0.0, -(side as f32) / 2.0);
    scene.camera = Camera::looking_at(center + Vec3::new(0.0, side as f32, side as f32 * 1.5), center, 1.0);
    Ok(scene)
}

/// Normalized RGB difference between two images (0.0-1.0).
pub fn image_difference(a: &RgbaImage, b: &RgbaImage) -> Result<f64> {
    if a.dimensions() != b.dimensions() {
        return Err(TestError::ImageComparison(format!(
            "Image dimensions don't match: {:?} vs {:?}",
            a.dimensions(),
            b.dimensions()
        )));
    }
    let total: u64 = a
        .pixels()
        .zip(b.pixels())
        .map(|(pa, pb): (&Rgba<u8>, &Rgba<u8>)| {
            (0..3)
                .map(|c| u64::from(pa[c].abs_diff(pb[c])))
                .sum::<u64>()
        })
        .sum();
    let max = u64::from(a.width()) * u64::from(a.height()) * 3 * 255;
    Ok(total as f64 / max as f64)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identical_images_do_not_differ() {
        let image = RgbaImage::from_pixel(4, 4, Rgba([10, 20, 30, 255]));
        assert!(image_difference(&image, &image).unwrap() < f64::EPSILON);
    }

    #[test]
    fn mismatched_dimensions_are_rejected() {
        let a = RgbaImage::new(4, 4);
        let b = RgbaImage::new(4, 5);
        assert!(matches!(
            image_difference(&a, &b),
            Err(TestError::ImageComparison(_))
        ));
    }

    #[test]
    fn cube_scene_shares_one_texture() {
        let scene = cube_scene(4).unwrap();
        assert_eq!(scene.instances.len(), 4);
        assert_eq!(scene.models().len(), 2);
        assert_eq!(scene.assets.textures_of(&scene.models()).len(), 1);
    }
}
