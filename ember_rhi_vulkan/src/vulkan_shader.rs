/// Shader - Vulkan implementation of the Shader trait

use ember_rhi::ember::{Error, Result};
use ember_rhi::ember::render::{content_hash, Shader as RhiShader, ShaderDesc, ShaderStage};
use ember_rhi::{engine_bail_warn, engine_err};
use ash::vk;
use std::any::Any;
use std::ffi::CString;
use std::sync::Arc;

use crate::vulkan_context::GpuContext;
use crate::vulkan_format::shader_stage_to_vk;

const LOG_SOURCE: &str = "ember::vulkan::Shader";
const SPIRV_MAGIC: u32 = 0x0723_0203;

/// Vulkan shader implementation
pub struct Shader {
    ctx: Arc<GpuContext>,
    pub(crate) module: vk::ShaderModule,
    stage: ShaderStage,
    entry_point: String,
    /// Null-terminated copy of `entry_point` for pipeline creation
    pub(crate) entry_point_c: CString,
    hash: u64,
}

/// Bytecode as SPIR-V words, after the size and magic checks
pub(crate) fn spirv_words(code: &[u8]) -> Result<Vec<u32>> {
    if code.is_empty() {
        engine_bail_warn!(LOG_SOURCE, "Shader bytecode is empty");
    }
    if code.len() % 4 != 0 {
        engine_bail_warn!(LOG_SOURCE, "Shader bytecode not 4-byte aligned (size: {} bytes)", code.len());
    }
    let words: Vec<u32> = code
        .chunks_exact(4)
        .map(|w| u32::from_le_bytes([w[0], w[1], w[2], w[3]]))
        .collect();
    if words[0] != SPIRV_MAGIC {
        engine_bail_warn!(LOG_SOURCE, "Shader bytecode has no SPIR-V magic (found {:#010x})", words[0]);
    }
    Ok(words)
}

/// Fail unless the module declares an entry point named `entry_point`
pub(crate) fn check_entry_point(words: &[u32], entry_point: &str) -> Result<()> {
    let entry_points = spirq::ReflectConfig::new()
        .spv(words)
        .ref_all_rscs(true)
        .reflect()
        .map_err(|e| engine_err!(LOG_SOURCE, "SPIR-V reflection failed: {:?}", e))?;
    if entry_points.iter().any(|ep| ep.name == entry_point) {
        return Ok(());
    }
    let names: Vec<&str> = entry_points.iter().map(|ep| ep.name.as_str()).collect();
    engine_bail_warn!(LOG_SOURCE, "Entry point '{}' not found in shader (available: {:?})", entry_point, names)
}

impl Shader {
    pub(crate) fn create(ctx: &Arc<GpuContext>, desc: &ShaderDesc<'_>) -> Result<Self> {
        let words = spirv_words(desc.code)?;
        check_entry_point(&words, desc.entry_point)?;
        let entry_point_c = CString::new(desc.entry_point)
            .map_err(|_| Error::InvalidResource(format!("entry point '{}' contains a NUL byte", desc.entry_point)))?;

        let create_info = vk::ShaderModuleCreateInfo::default().code(&words);
        let module = unsafe { ctx.device.create_shader_module(&create_info, None) }
            .map_err(|e| engine_err!(LOG_SOURCE, "Failed to create shader module: {:?}", e))?;

        Ok(Self {
            ctx: Arc::clone(ctx),
            module,
            stage: desc.stage,
            entry_point: desc.entry_point.to_string(),
            entry_point_c,
            hash: content_hash(desc.code),
        })
    }

    pub fn handle(&self) -> vk::ShaderModule {
        self.module
    }

    pub(crate) fn vk_stage(&self) -> vk::ShaderStageFlags {
        shader_stage_to_vk(self.stage)
    }
}

impl RhiShader for Shader {
    fn stage(&self) -> ShaderStage {
        self.stage
    }

    fn entry_point(&self) -> &str {
        &self.entry_point
    }

    fn content_hash(&self) -> u64 {
        self.hash
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

impl Drop for Shader {
    fn drop(&mut self) {
        unsafe { self.ctx.device.destroy_shader_module(self.module, None) };
    }
}

#[cfg(test)]
#[path = "vulkan_shader_tests.rs"]
mod tests;
