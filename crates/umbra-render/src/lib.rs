//! Deferred shading passes and frame composition for the Umbra renderer.
//!
//! This crate provides:
//! - Camera math and the scene a frame draws
//! - Per-frame-slot uniform and vertex rings
//! - The G-buffer, lighting, debug wireframe and text passes
//! - [`FrameComposer`], which sequences one frame across them

pub mod camera;
pub mod composer;
pub mod font;
pub mod passes;
pub mod scene;
pub mod shaders;
pub mod uniforms;

pub use camera::{Camera, CameraUniforms};
pub use composer::{FrameComposer, FrameOutcome};
pub use passes::{
    DebugPass, FrameView, GbufferPass, LightingPass, Pass, PassSetup, TextLine, TextPass,
};
pub use scene::{Instance, PointLight, Scene};
pub use shaders::{ShaderPair, ShaderSet};
pub use uniforms::{UniformRing, VertexRing};
