// Shader registry records
//
// Shaders arrive as SPIR-V blobs. The registry keeps the bytecode so a
// reload can swap it, plus the handles of every PSO built from the shader
// so those pipelines can be rebuilt in place.

use anyhow::{ensure, Context, Result};
use ash::vk;

use crate::handle::PsoHandle;
use crate::types::ShaderType;

#[derive(Default)]
pub struct Shader {
    pub name: String,
    pub shader_type: Option<ShaderType>,
    pub bytecode: Vec<u8>,
    pub module: vk::ShaderModule,
    /// Holders: the creating caller plus every PSO built from this shader.
    pub refcount: u32,
    /// PSOs compiled against this shader, rebuilt on reload. Weak back-edges;
    /// the PSO's reference to the shader is the only counted one.
    pub linked_psos: Vec<PsoHandle>,
}

/// Builds a module from a SPIR-V blob. The blob is copied to guarantee word
/// alignment; input from disk or the network is rarely 4-byte aligned.
pub fn create_shader_module(
    device: &ash::Device,
    bytecode: &[u8],
    name: &str,
) -> Result<vk::ShaderModule> {
    ensure!(
        bytecode.len() % 4 == 0 && !bytecode.is_empty(),
        "Shader '{name}' bytecode size {} is not a whole number of SPIR-V words",
        bytecode.len()
    );
    let words: Vec<u32> = bytecode
        .chunks_exact(4)
        .map(|c| u32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect();

    let create_info = vk::ShaderModuleCreateInfo::builder().code(&words);
    unsafe {
        device
            .create_shader_module(&create_info, None)
            .with_context(|| format!("Failed to create shader module '{name}'"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_shader_record_is_empty() {
        let s = Shader::default();
        assert!(s.bytecode.is_empty());
        assert!(s.linked_psos.is_empty());
        assert_eq!(s.refcount, 0);
        assert_eq!(s.module, vk::ShaderModule::null());
        assert!(s.shader_type.is_none());
    }
}
