//! Core types, handles and asset contracts for the Umbra renderer.
//!
//! This crate provides the foundational types used throughout the renderer:
//! - Generational arenas and typed handles
//! - The vertex / index byte layout shared with shaders
//! - In-memory asset libraries (models, materials, textures)
//! - Engine configuration and the common error type

pub mod assets;
pub mod config;
pub mod error;
pub mod handle;
pub mod types;

pub use assets::{
    Assets, Material, MaterialHandle, MaterialParams, MeshData, Model, ModelHandle, Texture,
    TextureHandle,
};
pub use config::EngineConfig;
pub use error::{Error, Result};
pub use handle::{Arena, Handle};
pub use types::{TextureFormat, Triangle, Vertex};

/// Renderer-wide constants.
pub mod constants {
    /// Size of the object uniform array compiled into `gbuffer.vert`
    /// (`MAX_OBJECTS`).
    pub const SHADER_MAX_OBJECTS: usize = 512;
    /// Size of the light array compiled into `lighting.frag` (`MAX_LIGHTS`).
    pub const SHADER_MAX_LIGHTS: usize = 32;
    /// Default capacity of the per-object uniform array in the geometry pass.
    pub const DEFAULT_MAX_OBJECTS: usize = SHADER_MAX_OBJECTS;
    /// Default capacity of the light array in the lighting pass.
    pub const DEFAULT_MAX_LIGHTS: usize = SHADER_MAX_LIGHTS;
    /// Smallest supported number of frames in flight.
    pub const MIN_FRAMES_IN_FLIGHT: usize = 2;
    /// Largest supported number of frames in flight.
    pub const MAX_FRAMES_IN_FLIGHT: usize = 3;
}
