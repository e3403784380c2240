//! SPIR-V shader modules.

use std::path::Path;
use std::sync::Arc;

use ash::vk;

use crate::context::Device;
use crate::error::{CreateStep, GpuError, Result};
use crate::handle::Unique;

/// First word of every SPIR-V module.
pub const SPIRV_MAGIC: u32 = 0x0723_0203;

/// Convert little-endian SPIR-V bytes to words, checking length and magic.
pub fn spirv_words(bytes: &[u8]) -> Result<Vec<u32>> {
    if bytes.is_empty() || bytes.len() % 4 != 0 {
        return Err(GpuError::InvalidSpirv(format!(
            "length {} is not a non-zero multiple of 4",
            bytes.len()
        )));
    }
    let words: Vec<u32> = bytes
        .chunks_exact(4)
        .map(|chunk| u32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
        .collect();
    if words[0] != SPIRV_MAGIC {
        return Err(GpuError::InvalidSpirv(format!(
            "bad magic number {:#010x}",
            words[0]
        )));
    }
    Ok(words)
}

/// Owned shader module.
#[derive(Debug)]
pub struct ShaderModule {
    module: Unique<vk::ShaderModule, Arc<Device>>,
}

impl ShaderModule {
    /// Create a module from SPIR-V bytes.
    pub fn from_bytes(device: &Arc<Device>, bytes: &[u8]) -> Result<Self> {
        let words = spirv_words(bytes)?;
        let create_info = vk::ShaderModuleCreateInfo::default().code(&words);
        // SAFETY: the device is live and `words` is a validated SPIR-V header.
        let module = unsafe { device.create_shader_module(&create_info, None) }
            .map_err(GpuError::step(CreateStep::CreateShaderModule))?;
        Ok(Self {
            // SAFETY: freshly created from `device`.
            module: unsafe { Unique::new(device.clone(), module) },
        })
    }

    /// Read a compiled `.spv` file and create a module from it.
    pub fn from_file(device: &Arc<Device>, path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let bytes = std::fs::read(path)?;
        tracing::debug!(path = %path.display(), bytes = bytes.len(), "Loading shader");
        Self::from_bytes(device, &bytes)
    }

    pub fn handle(&self) -> vk::ShaderModule {
        self.module.handle()
    }
}
