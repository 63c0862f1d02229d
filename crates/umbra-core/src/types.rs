//! Byte-layout contracts shared between asset data and shaders.

use bytemuck::{Pod, Zeroable};
use serde::{Deserialize, Serialize};

/// Interleaved vertex: position, uv, normal, tangent.
///
/// Uploaded verbatim; the vertex input layout of the geometry pass
/// must match this struct exactly.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Pod, Zeroable)]
pub struct Vertex {
    pub position: [f32; 3],
    pub uv: [f32; 2],
    pub normal: [f32; 3],
    pub tangent: [f32; 3],
}

impl Vertex {
    /// Size in bytes.
    pub const SIZE: usize = std::mem::size_of::<Self>();

    /// Number of `f32` components per vertex.
    pub const FLOATS: usize = Self::SIZE / std::mem::size_of::<f32>();

    /// Byte offset of the uv attribute.
    pub const UV_OFFSET: u32 = 12;
    /// Byte offset of the normal attribute.
    pub const NORMAL_OFFSET: u32 = 20;
    /// Byte offset of the tangent attribute.
    pub const TANGENT_OFFSET: u32 = 32;

    /// Create a vertex.
    pub const fn new(position: [f32; 3], uv: [f32; 2], normal: [f32; 3], tangent: [f32; 3]) -> Self {
        Self {
            position,
            uv,
            normal,
            tangent,
        }
    }
}

/// One face: three `u32` indices into the vertex array.
pub type Triangle = [u32; 3];

/// Pixel formats the texture path understands.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TextureFormat {
    /// 8-bit RGBA, linear.
    Rgba8Unorm,
    /// 8-bit RGBA, sRGB encoded.
    #[default]
    Rgba8Srgb,
    /// Single 8-bit channel (glyph atlases).
    R8Unorm,
}

impl TextureFormat {
    /// Bytes per texel.
    pub const fn bytes_per_texel(self) -> usize {
        match self {
            Self::Rgba8Unorm | Self::Rgba8Srgb => 4,
            Self::R8Unorm => 1,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn vertex_layout_is_eleven_floats() {
        assert_eq!(Vertex::SIZE, 44);
        assert_eq!(Vertex::FLOATS, 11);
    }

    #[test]
    fn vertex_attribute_offsets() {
        assert_eq!(std::mem::offset_of!(Vertex, uv) as u32, Vertex::UV_OFFSET);
        assert_eq!(std::mem::offset_of!(Vertex, normal) as u32, Vertex::NORMAL_OFFSET);
        assert_eq!(std::mem::offset_of!(Vertex, tangent) as u32, Vertex::TANGENT_OFFSET);
    }

    #[test]
    fn triangle_is_three_u32() {
        assert_eq!(std::mem::size_of::<Triangle>(), 12);
    }
}
