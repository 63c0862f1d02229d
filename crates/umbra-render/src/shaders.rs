//! Precompiled SPIR-V for the built-in passes.
//!
//! Shaders are compiled offline from `assets/shaders/*.{vert,frag}` and
//! loaded as `<name>.vert.spv` / `<name>.frag.spv` from the shader
//! directory under the configured asset root.

use std::path::Path;

use umbra_core::EngineConfig;
use umbra_gpu::pipeline::spirv_from_bytes;
use umbra_gpu::Result;

/// Vertex and fragment module of one pass.
#[derive(Clone, Debug)]
pub struct ShaderPair {
    pub vertex: Vec<u32>,
    pub fragment: Vec<u32>,
}

impl ShaderPair {
    fn load(dir: &Path, name: &str) -> Result<Self> {
        Ok(Self {
            vertex: load_module(dir, &format!("{name}.vert.spv"))?,
            fragment: load_module(dir, &format!("{name}.frag.spv"))?,
        })
    }
}

/// Shaders of every built-in pass.
#[derive(Clone, Debug)]
pub struct ShaderSet {
    pub gbuffer: ShaderPair,
    pub lighting: ShaderPair,
    pub debug: ShaderPair,
    pub text: ShaderPair,
}

impl ShaderSet {
    /// Load every pass from `dir`.
    pub fn load(dir: &Path) -> Result<Self> {
        let set = Self {
            gbuffer: ShaderPair::load(dir, "gbuffer")?,
            lighting: ShaderPair::load(dir, "lighting")?,
            debug: ShaderPair::load(dir, "debug")?,
            text: ShaderPair::load(dir, "text")?,
        };
        tracing::debug!(dir = %dir.display(), "shaders loaded");
        Ok(set)
    }

    /// Load from `<asset_root>/shaders`.
    pub fn from_config(config: &EngineConfig) -> Result<Self> {
        Self::load(&config.asset_root.join("shaders"))
    }

    /// Header-only modules accepted by the headless backend.
    #[cfg(any(test, feature = "headless"))]
    pub fn stub() -> Self {
        let module = vec![umbra_gpu::pipeline::SPIRV_MAGIC, 0x0001_0000, 0, 1, 0];
        let pair = ShaderPair {
            vertex: module.clone(),
            fragment: module,
        };
        Self {
            gbuffer: pair.clone(),
            lighting: pair.clone(),
            debug: pair.clone(),
            text: pair,
        }
    }
}

fn load_module(dir: &Path, file: &str) -> Result<Vec<u32>> {
    let path = dir.join(file);
    let bytes = std::fs::read(&path)
        .map_err(|_| umbra_core::Error::NotFound(path.display().to_string()))?;
    spirv_from_bytes(&bytes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use umbra_gpu::GpuError;

    #[test]
    fn missing_directory_reports_path() {
        let err = ShaderSet::load(Path::new("/nonexistent/umbra/shaders")).unwrap_err();
        match err {
            GpuError::Core(umbra_core::Error::NotFound(path)) => {
                assert!(path.ends_with("gbuffer.vert.spv"));
            }
            other => panic!("unexpected error {other}"),
        }
    }

    #[test]
    fn loads_modules_from_disk() {
        let dir = std::env::temp_dir().join(format!("umbra-shaders-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let words = [umbra_gpu::pipeline::SPIRV_MAGIC, 0x0001_0000, 0, 1, 0];
        let bytes: Vec<u8> = words.iter().flat_map(|w| w.to_le_bytes()).collect();
        for name in ["gbuffer", "lighting", "debug", "text"] {
            for stage in ["vert", "frag"] {
                std::fs::write(dir.join(format!("{name}.{stage}.spv")), &bytes).unwrap();
            }
        }

        let set = ShaderSet::load(&dir).unwrap();
        assert_eq!(set.text.fragment, words);
        std::fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn rejects_non_spirv() {
        let dir = std::env::temp_dir().join(format!("umbra-bad-shaders-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join("gbuffer.vert.spv"), b"#version 450").unwrap();
        let err = ShaderSet::load(&dir).unwrap_err();
        assert!(matches!(err, GpuError::InvalidShader(_)));
        std::fs::remove_dir_all(&dir).unwrap();
    }
}
