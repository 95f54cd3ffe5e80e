/*! External SPIR-V compilation and shader module creation. GLSL sources go
 * through the `glslc` CLI; only the compiled bytes are consumed here.
 */

use std::{fs, io::Cursor, path::Path, process::Command, sync::Arc};

use anyhow::{Context, Result};
use ash::vk;

use crate::error::GfxError;

use super::Device;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShaderStage {
    Vertex,
    Fragment,
}

impl ShaderStage {
    /// Recognised source extensions for hot-reloadable GLSL.
    pub fn from_source_path(path: &Path) -> Option<Self> {
        match path.extension().and_then(|ext| ext.to_str()) {
            Some("vert") => Some(Self::Vertex),
            Some("frag") => Some(Self::Fragment),
            _ => None,
        }
    }

    pub(crate) fn to_vulkan_flags(self) -> vk::ShaderStageFlags {
        match self {
            Self::Vertex => vk::ShaderStageFlags::VERTEX,
            Self::Fragment => vk::ShaderStageFlags::FRAGMENT,
        }
    }
}

/// Runs `glslc <src> -o <src>.spv` (with `-g` in debug builds) and reads
/// the result back as bytes. Exit code zero means success.
pub fn compile_glsl(source_path: &Path) -> Result<Vec<u8>> {
    let destination = {
        let mut os = source_path.as_os_str().to_owned();
        os.push(".spv");
        std::path::PathBuf::from(os)
    };
    let mut command = Command::new("glslc");
    command.arg(source_path);
    if cfg!(debug_assertions) {
        command.arg("-g");
    }
    command.arg("-o").arg(&destination);
    let output = command
        .output()
        .with_context(|| format!("failed to invoke glslc for {}", source_path.display()))?;
    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr).into_owned();
        log::error!("glslc failed for {}: {stderr}", source_path.display());
        return Err(GfxError::ShaderCompile(stderr).into());
    }
    let bytes = fs::read(&destination)
        .with_context(|| format!("failed to read {}", destination.display()))?;
    Ok(bytes)
}

/// Decodes SPIR-V bytes into 32-bit little-endian words, validating the
/// length is a multiple of four and the magic number matches.
pub fn read_spirv_words(bytes: &[u8]) -> Result<Vec<u32>> {
    let mut cursor = Cursor::new(bytes);
    let words = ash::util::read_spv(&mut cursor)
        .map_err(|err| GfxError::ShaderCompile(format!("invalid SPIR-V: {err}")))?;
    Ok(words)
}

pub struct ShaderModule {
    pub(crate) raw: vk::ShaderModule,
    pub stage: ShaderStage,
    device: Arc<Device>,
}

impl ShaderModule {
    pub fn from_spirv_bytes(device: Arc<Device>, stage: ShaderStage, bytes: &[u8]) -> Result<Self> {
        let words = read_spirv_words(bytes)?;
        let info = vk::ShaderModuleCreateInfo::default().code(&words);
        let raw = unsafe { device.raw.create_shader_module(&info, None)? };
        Ok(Self { raw, stage, device })
    }
}

impl Drop for ShaderModule {
    fn drop(&mut self) {
        unsafe { self.device.raw.destroy_shader_module(self.raw, None) };
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stage_is_recognised_from_extension() {
        assert_eq!(
            ShaderStage::from_source_path(Path::new("shaders/lit.vert")),
            Some(ShaderStage::Vertex)
        );
        assert_eq!(
            ShaderStage::from_source_path(Path::new("shaders/lit.frag")),
            Some(ShaderStage::Fragment)
        );
        assert_eq!(ShaderStage::from_source_path(Path::new("shaders/lit.glsl")), None);
    }

    #[test]
    fn spirv_words_reject_truncated_input() {
        // Length not a multiple of four.
        assert!(read_spirv_words(&[0x03, 0x02, 0x23]).is_err());
    }

    #[test]
    fn spirv_words_round_trip_little_endian() {
        // Magic number followed by one word.
        let bytes = [0x03u8, 0x02, 0x23, 0x07, 0x78, 0x56, 0x34, 0x12];
        let words = read_spirv_words(&bytes).unwrap();
        assert_eq!(words, vec![0x0723_0203, 0x1234_5678]);
    }
}
