//! What a frame draws: assets, placed instances, lights and the camera.

use glam::{Mat4, Vec3};
use umbra_core::{Assets, MaterialHandle, ModelHandle, Texture, TextureFormat, TextureHandle};

use crate::camera::Camera;
use crate::font;

/// A model placed in the world.
#[derive(Clone, Copy, Debug)]
pub struct Instance {
    pub model: ModelHandle,
    pub transform: Mat4,
}

impl Instance {
    /// Place `model` with `transform`.
    pub const fn new(model: ModelHandle, transform: Mat4) -> Self {
        Self { model, transform }
    }
}

/// Point light.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct PointLight {
    pub position: Vec3,
    pub color: Vec3,
    pub radius: f32,
}

/// A renderable scene.
pub struct Scene {
    pub assets: Assets,
    pub instances: Vec<Instance>,
    pub lights: Vec<PointLight>,
    pub camera: Camera,
    pub ambient: Vec3,
    white_texture: TextureHandle,
    font_texture: TextureHandle,
}

impl Scene {
    /// Wrap `assets`, adding the 1x1 white fallback texture and the glyph
    /// atlas the passes sample.
    pub fn new(mut assets: Assets) -> umbra_core::Result<Self> {
        let white_texture = assets
            .textures
            .insert(Texture::checkerboard("white", 1, 1, [255; 4], [255; 4]));
        let font_texture = assets.textures.insert(font::atlas_texture()?);
        Ok(Self {
            assets,
            instances: Vec::new(),
            lights: Vec::new(),
            camera: Camera::default(),
            ambient: Vec3::splat(0.05),
            white_texture,
            font_texture,
        })
    }

    /// Texture bound for materials without an albedo map.
    pub const fn white_texture(&self) -> TextureHandle {
        self.white_texture
    }

    /// Glyph atlas of the text overlay.
    pub const fn font_texture(&self) -> TextureHandle {
        self.font_texture
    }

    /// Textures the passes need beyond those of model materials.
    pub fn builtin_textures(&self) -> [TextureHandle; 2] {
        [self.white_texture, self.font_texture]
    }

    /// Add an instance.
    pub fn spawn(&mut self, model: ModelHandle, transform: Mat4) {
        self.instances.push(Instance::new(model, transform));
    }

    /// Unique models used by instances, in first-use order.
    pub fn models(&self) -> Vec<ModelHandle> {
        let mut out: Vec<ModelHandle> = Vec::new();
        for instance in &self.instances {
            if !out.contains(&instance.model) {
                out.push(instance.model);
            }
        }
        out
    }

    /// Unique materials used by instances.
    pub fn materials(&self) -> Vec<MaterialHandle> {
        self.assets.materials_of(&self.models())
    }

    /// World-space bounds of `instance`.
    pub fn instance_bounds(&self, instance: &Instance) -> (Vec3, Vec3) {
        let (min, max) = self.assets.model(instance.model).mesh.bounds();
        let corners = (0..8).map(|i| {
            let corner = Vec3::new(
                if i & 1 == 0 { min.x } else { max.x },
                if i & 2 == 0 { min.y } else { max.y },
                if i & 4 == 0 { min.z } else { max.z },
            );
            instance.transform.transform_point3(corner)
        });
        corners.fold(
            (Vec3::splat(f32::INFINITY), Vec3::splat(f32::NEG_INFINITY)),
            |(lo, hi), p| (lo.min(p), hi.max(p)),
        )
    }
}

/// Check that a texture can back the glyph atlas.
pub(crate) fn is_glyph_atlas(texture: &Texture) -> bool {
    texture.format == TextureFormat::R8Unorm
}

#[cfg(test)]
mod tests {
    use super::*;
    use umbra_core::{Material, MeshData, Model};

    #[test]
    fn builtins_are_registered() {
        let scene = Scene::new(Assets::new()).unwrap();
        let [white, font] = scene.builtin_textures();
        assert_eq!(scene.assets.texture(white).raw(), &[255, 255, 255, 255]);
        assert!(is_glyph_atlas(scene.assets.texture(font)));
    }

    #[test]
    fn models_are_deduplicated() {
        let mut assets = Assets::new();
        let material = assets.materials.insert(Material::new("m"));
        let cube = assets
            .models
            .insert(Model::new("cube", MeshData::cube(0.5), material));
        let mut scene = Scene::new(assets).unwrap();
        scene.spawn(cube, Mat4::IDENTITY);
        scene.spawn(cube, Mat4::from_translation(Vec3::X));
        assert_eq!(scene.models(), vec![cube]);
        assert_eq!(scene.materials(), vec![material]);
    }

    #[test]
    fn bounds_follow_transform() {
        let mut assets = Assets::new();
        let material = assets.materials.insert(Material::new("m"));
        let cube = assets
            .models
            .insert(Model::new("cube", MeshData::cube(0.5), material));
        let scene = Scene::new(assets).unwrap();
        let instance = Instance::new(cube, Mat4::from_translation(Vec3::new(2.0, 0.0, 0.0)));
        let (min, max) = scene.instance_bounds(&instance);
        assert_eq!(min, Vec3::new(1.5, -0.5, -0.5));
        assert_eq!(max, Vec3::new(2.5, 0.5, 0.5));
    }
}
