//! Engine configuration.
//!
//! Built once at startup and handed down explicitly; nothing in the renderer
//! reads configuration from process-wide state.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::constants::{
    DEFAULT_MAX_LIGHTS, DEFAULT_MAX_OBJECTS, MAX_FRAMES_IN_FLIGHT, MIN_FRAMES_IN_FLIGHT,
    SHADER_MAX_LIGHTS, SHADER_MAX_OBJECTS,
};
use crate::error::{Error, Result};

/// Renderer configuration.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Number of frames the CPU may record ahead of the GPU (2 or 3).
    pub frames_in_flight: usize,
    /// Enable vsync.
    pub vsync: bool,
    /// Enable Vulkan validation layers.
    pub validation: bool,
    /// Capacity of the per-object uniform array.
    pub max_objects: usize,
    /// Capacity of the light array.
    pub max_lights: usize,
    /// Root directory that asset loaders resolve relative paths against.
    pub asset_root: PathBuf,
    /// Start with the wireframe overlay enabled.
    pub debug_overlay: bool,
    /// Start with the text overlay enabled.
    pub text_overlay: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            frames_in_flight: MIN_FRAMES_IN_FLIGHT,
            vsync: false,
            validation: cfg!(debug_assertions),
            max_objects: DEFAULT_MAX_OBJECTS,
            max_lights: DEFAULT_MAX_LIGHTS,
            asset_root: PathBuf::from("assets"),
            debug_overlay: false,
            text_overlay: true,
        }
    }
}

impl EngineConfig {
    /// Set the number of frames in flight.
    #[must_use]
    pub fn with_frames_in_flight(mut self, frames: usize) -> Self {
        self.frames_in_flight = frames;
        self
    }

    /// Set the per-object uniform capacity.
    #[must_use]
    pub fn with_max_objects(mut self, max_objects: usize) -> Self {
        self.max_objects = max_objects;
        self
    }

    /// Set the light capacity.
    #[must_use]
    pub fn with_max_lights(mut self, max_lights: usize) -> Self {
        self.max_lights = max_lights;
        self
    }

    /// Set the asset root.
    #[must_use]
    pub fn with_asset_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.asset_root = root.into();
        self
    }

    /// Check value ranges. Object and light capacities may not exceed the
    /// array sizes compiled into the shaders.
    pub fn validate(&self) -> Result<()> {
        if !(MIN_FRAMES_IN_FLIGHT..=MAX_FRAMES_IN_FLIGHT).contains(&self.frames_in_flight) {
            return Err(Error::InvalidConfig(format!(
                "frames_in_flight must be {MIN_FRAMES_IN_FLIGHT} or {MAX_FRAMES_IN_FLIGHT}, got {}",
                self.frames_in_flight
            )));
        }
        if !(1..=SHADER_MAX_OBJECTS).contains(&self.max_objects) {
            return Err(Error::InvalidConfig(format!(
                "max_objects must be in 1..={SHADER_MAX_OBJECTS}, got {}",
                self.max_objects
            )));
        }
        if !(1..=SHADER_MAX_LIGHTS).contains(&self.max_lights) {
            return Err(Error::InvalidConfig(format!(
                "max_lights must be in 1..={SHADER_MAX_LIGHTS}, got {}",
                self.max_lights
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_is_valid() {
        EngineConfig::default().validate().unwrap();
    }

    #[test]
    fn frames_in_flight_out_of_range() {
        assert!(EngineConfig::default().with_frames_in_flight(1).validate().is_err());
        assert!(EngineConfig::default().with_frames_in_flight(4).validate().is_err());
        EngineConfig::default().with_frames_in_flight(3).validate().unwrap();
    }

    #[test]
    fn zero_objects_rejected() {
        assert!(EngineConfig::default().with_max_objects(0).validate().is_err());
    }

    #[test]
    fn capacities_above_shader_arrays_rejected() {
        let err = EngineConfig::default().with_max_objects(600).validate().unwrap_err();
        assert!(err.to_string().contains("max_objects"), "{err}");
        assert!(EngineConfig::default().with_max_lights(33).validate().is_err());

        EngineConfig::default()
            .with_max_objects(SHADER_MAX_OBJECTS)
            .with_max_lights(SHADER_MAX_LIGHTS)
            .validate()
            .unwrap();
        EngineConfig::default().with_max_objects(64).validate().unwrap();
    }
}
