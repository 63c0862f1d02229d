//! In-memory asset libraries.
//!
//! File decoding lives outside the renderer. Loaders hand decoded data to
//! these libraries and receive typed handles back; the GPU streamer reads the
//! raw bytes exposed here and copies them verbatim into staging memory.

use bytemuck::{Pod, Zeroable};
use glam::Vec3;

use crate::error::{Error, Result};
use crate::handle::{Arena, Handle};
use crate::types::{TextureFormat, Triangle, Vertex};

/// Handle to a [`Model`] in [`Assets::models`].
pub type ModelHandle = Handle<Model>;
/// Handle to a [`Material`] in [`Assets::materials`].
pub type MaterialHandle = Handle<Material>;
/// Handle to a [`Texture`] in [`Assets::textures`].
pub type TextureHandle = Handle<Texture>;

/// Decoded triangle mesh.
#[derive(Clone, Debug, Default)]
pub struct MeshData {
    pub vertices: Vec<Vertex>,
    pub triangles: Vec<Triangle>,
}

impl MeshData {
    /// Create a mesh from vertices and index triples.
    pub fn new(vertices: Vec<Vertex>, triangles: Vec<Triangle>) -> Self {
        Self {
            vertices,
            triangles,
        }
    }

    /// Raw interleaved vertex bytes.
    pub fn vertex_bytes(&self) -> &[u8] {
        bytemuck::cast_slice(&self.vertices)
    }

    /// Raw index bytes (3 x `u32` per face).
    pub fn index_bytes(&self) -> &[u8] {
        bytemuck::cast_slice(&self.triangles)
    }

    /// Number of indices (three per face).
    pub fn index_count(&self) -> u32 {
        (self.triangles.len() * 3) as u32
    }

    /// Axis-aligned bounds of the vertex positions.
    pub fn bounds(&self) -> (Vec3, Vec3) {
        if self.vertices.is_empty() {
            return (Vec3::ZERO, Vec3::ZERO);
        }
        self.vertices.iter().fold(
            (Vec3::splat(f32::MAX), Vec3::splat(f32::MIN)),
            |(min, max), v| {
                let p = Vec3::from(v.position);
                (min.min(p), max.max(p))
            },
        )
    }

    /// Axis-aligned cube centred on the origin, four vertices per face.
    pub fn cube(half_extent: f32) -> Self {
        let h = half_extent;
        // (normal, tangent, four corners counter-clockwise seen from outside)
        let faces: [([f32; 3], [f32; 3], [[f32; 3]; 4]); 6] = [
            ([0.0, 0.0, 1.0], [1.0, 0.0, 0.0], [[-h, -h, h], [h, -h, h], [h, h, h], [-h, h, h]]),
            ([0.0, 0.0, -1.0], [-1.0, 0.0, 0.0], [[h, -h, -h], [-h, -h, -h], [-h, h, -h], [h, h, -h]]),
            ([1.0, 0.0, 0.0], [0.0, 0.0, -1.0], [[h, -h, h], [h, -h, -h], [h, h, -h], [h, h, h]]),
            ([-1.0, 0.0, 0.0], [0.0, 0.0, 1.0], [[-h, -h, -h], [-h, -h, h], [-h, h, h], [-h, h, -h]]),
            ([0.0, 1.0, 0.0], [1.0, 0.0, 0.0], [[-h, h, h], [h, h, h], [h, h, -h], [-h, h, -h]]),
            ([0.0, -1.0, 0.0], [1.0, 0.0, 0.0], [[-h, -h, -h], [h, -h, -h], [h, -h, h], [-h, -h, h]]),
        ];
        let uvs = [[0.0, 1.0], [1.0, 1.0], [1.0, 0.0], [0.0, 0.0]];

        let mut vertices = Vec::with_capacity(24);
        let mut triangles = Vec::with_capacity(12);
        for (normal, tangent, corners) in faces {
            let base = vertices.len() as u32;
            for (corner, uv) in corners.iter().zip(uvs) {
                vertices.push(Vertex::new(*corner, uv, normal, tangent));
            }
            triangles.push([base, base + 1, base + 2]);
            triangles.push([base, base + 2, base + 3]);
        }

        Self::new(vertices, triangles)
    }
}

/// Material parameters as laid out in the material uniform buffer.
#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, Pod, Zeroable)]
pub struct MaterialParams {
    pub albedo: [f32; 4],
    pub roughness: f32,
    pub metallic: f32,
    pub has_albedo_map: u32,
    pub has_normal_map: u32,
}

impl Default for MaterialParams {
    fn default() -> Self {
        Self {
            albedo: [1.0, 1.0, 1.0, 1.0],
            roughness: 0.8,
            metallic: 0.0,
            has_albedo_map: 0,
            has_normal_map: 0,
        }
    }
}

/// Surface description shared by any number of models.
#[derive(Clone, Debug)]
pub struct Material {
    pub name: String,
    pub params: MaterialParams,
    pub albedo_map: Option<TextureHandle>,
    pub normal_map: Option<TextureHandle>,
}

impl Material {
    /// Create a material with default parameters and no maps.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            params: MaterialParams::default(),
            albedo_map: None,
            normal_map: None,
        }
    }

    /// Set the albedo map.
    #[must_use]
    pub fn with_albedo_map(mut self, texture: TextureHandle) -> Self {
        self.albedo_map = Some(texture);
        self.params.has_albedo_map = 1;
        self
    }

    /// Set the normal map.
    #[must_use]
    pub fn with_normal_map(mut self, texture: TextureHandle) -> Self {
        self.normal_map = Some(texture);
        self.params.has_normal_map = 1;
        self
    }

    /// Set the base color.
    #[must_use]
    pub fn with_albedo(mut self, albedo: [f32; 4]) -> Self {
        self.params.albedo = albedo;
        self
    }

    /// Raw uniform bytes.
    pub fn raw(&self) -> &[u8] {
        bytemuck::bytes_of(&self.params)
    }

    /// Textures referenced by this material, albedo first.
    pub fn textures(&self) -> impl Iterator<Item = TextureHandle> {
        self.albedo_map.into_iter().chain(self.normal_map)
    }
}

/// Decoded 2D texture.
#[derive(Clone, Debug)]
pub struct Texture {
    pub name: String,
    pub width: u32,
    pub height: u32,
    pub format: TextureFormat,
    pixels: Vec<u8>,
}

impl Texture {
    /// Create a texture, checking that the pixel data matches the dimensions.
    pub fn new(
        name: impl Into<String>,
        width: u32,
        height: u32,
        format: TextureFormat,
        pixels: Vec<u8>,
    ) -> Result<Self> {
        let name = name.into();
        if width == 0 || height == 0 {
            return Err(Error::InvalidData(format!("texture '{name}' has zero extent")));
        }
        let expected = width as usize * height as usize * format.bytes_per_texel();
        if pixels.len() != expected {
            return Err(Error::InvalidData(format!(
                "texture '{name}' is {width}x{height} {format:?} ({expected} bytes) but has {} bytes",
                pixels.len()
            )));
        }
        Ok(Self {
            name,
            width,
            height,
            format,
            pixels,
        })
    }

    /// Two-colour RGBA checkerboard with `cell`-texel squares.
    pub fn checkerboard(name: impl Into<String>, size: u32, cell: u32, a: [u8; 4], b: [u8; 4]) -> Self {
        let cell = cell.max(1);
        let mut pixels = Vec::with_capacity((size * size * 4) as usize);
        for y in 0..size {
            for x in 0..size {
                let texel = if ((x / cell) + (y / cell)) % 2 == 0 { a } else { b };
                pixels.extend_from_slice(&texel);
            }
        }
        Self {
            name: name.into(),
            width: size,
            height: size,
            format: TextureFormat::Rgba8Srgb,
            pixels,
        }
    }

    /// Raw texel bytes, rows tightly packed.
    pub fn raw(&self) -> &[u8] {
        &self.pixels
    }

    /// Size of the texel data in bytes.
    pub fn byte_len(&self) -> u64 {
        self.pixels.len() as u64
    }
}

/// A renderable mesh plus the material it is drawn with.
#[derive(Clone, Debug)]
pub struct Model {
    pub name: String,
    pub mesh: MeshData,
    pub material: MaterialHandle,
}

impl Model {
    /// Create a model.
    pub fn new(name: impl Into<String>, mesh: MeshData, material: MaterialHandle) -> Self {
        Self {
            name: name.into(),
            mesh,
            material,
        }
    }
}

/// All CPU-side assets of a scene.
#[derive(Default)]
pub struct Assets {
    pub models: Arena<Model>,
    pub materials: Arena<Material>,
    pub textures: Arena<Texture>,
}

impl Assets {
    /// Create empty libraries.
    pub fn new() -> Self {
        Self::default()
    }

    /// Get a model. Panics on an unknown handle.
    pub fn model(&self, handle: ModelHandle) -> &Model {
        self.models
            .get(handle)
            .unwrap_or_else(|| panic!("unknown model {handle:?}"))
    }

    /// Get a material. Panics on an unknown handle.
    pub fn material(&self, handle: MaterialHandle) -> &Material {
        self.materials
            .get(handle)
            .unwrap_or_else(|| panic!("unknown material {handle:?}"))
    }

    /// Get a texture. Panics on an unknown handle.
    pub fn texture(&self, handle: TextureHandle) -> &Texture {
        self.textures
            .get(handle)
            .unwrap_or_else(|| panic!("unknown texture {handle:?}"))
    }

    /// Look up a texture by name.
    pub fn find_texture(&self, name: &str) -> Result<TextureHandle> {
        self.textures
            .iter()
            .find(|(_, t)| t.name == name)
            .map(|(h, _)| h)
            .ok_or_else(|| Error::NotFound(format!("texture '{name}'")))
    }

    /// Unique materials referenced by `models`, in first-use order.
    pub fn materials_of(&self, models: &[ModelHandle]) -> Vec<MaterialHandle> {
        let mut out: Vec<MaterialHandle> = Vec::new();
        for &model in models {
            let material = self.model(model).material;
            if !out.contains(&material) {
                out.push(material);
            }
        }
        out
    }

    /// Unique textures referenced by the materials of `models`, in first-use order.
    pub fn textures_of(&self, models: &[ModelHandle]) -> Vec<TextureHandle> {
        let mut out: Vec<TextureHandle> = Vec::new();
        for material in self.materials_of(models) {
            for texture in self.material(material).textures() {
                if !out.contains(&texture) {
                    out.push(texture);
                }
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cube_has_24_vertices_and_12_faces() {
        let cube = MeshData::cube(0.5);
        assert_eq!(cube.vertices.len(), 24);
        assert_eq!(cube.triangles.len(), 12);
        assert_eq!(cube.index_count(), 36);
        assert_eq!(cube.vertex_bytes().len(), 24 * Vertex::SIZE);
        assert_eq!(cube.index_bytes().len(), 36 * 4);
    }

    #[test]
    fn cube_bounds() {
        let (min, max) = MeshData::cube(2.0).bounds();
        approx::assert_relative_eq!(min.x, -2.0);
        approx::assert_relative_eq!(max.y, 2.0);
    }

    #[test]
    fn texture_rejects_mismatched_pixels() {
        let result = Texture::new("bad", 4, 4, TextureFormat::Rgba8Unorm, vec![0; 10]);
        assert!(matches!(result, Err(Error::InvalidData(_))));
    }

    #[test]
    fn shared_texture_is_listed_once() {
        let mut assets = Assets::new();
        let checker = assets
            .textures
            .insert(Texture::checkerboard("checker", 8, 2, [255; 4], [0, 0, 0, 255]));
        let red = assets
            .materials
            .insert(Material::new("red").with_albedo_map(checker));
        let blue = assets
            .materials
            .insert(Material::new("blue").with_albedo_map(checker));
        let a = assets.models.insert(Model::new("a", MeshData::cube(1.0), red));
        let b = assets.models.insert(Model::new("b", MeshData::cube(1.0), blue));

        assert_eq!(assets.materials_of(&[a, b]), vec![red, blue]);
        assert_eq!(assets.textures_of(&[a, b]), vec![checker]);
    }

    #[test]
    fn find_texture_by_name() {
        let mut assets = Assets::new();
        let h = assets
            .textures
            .insert(Texture::checkerboard("grid", 4, 1, [1; 4], [2; 4]));
        assert_eq!(assets.find_texture("grid").unwrap(), h);
        assert!(assets.find_texture("missing").is_err());
    }
}
