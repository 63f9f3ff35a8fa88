// Shader modules and SPIR-V reflection
//
// A shader pool entry carries the native module plus what reflection
// discovered: the stage and the zero-or-one push-constant block. A blob
// declaring more than one push-constant block is rejected with a panic,
// not an error; it cannot come out of a correct asset pipeline.

use ash::vk;
use spirv_reflect::types::ReflectShaderStageFlags;

use super::device::DeviceContext;
use super::error::{GpuError, Result, VkCall};

/// Byte range of a push-constant block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PushRange {
    pub offset: u32,
    pub size: u32,
}

/// Pool entry for one shader module.
pub struct Shader {
    pub module: vk::ShaderModule,
    pub stage: vk::ShaderStageFlags,
    pub push_range: Option<PushRange>,
}

/// SPIR-V words are little-endian u32s; reject blobs that are not a whole
/// number of words.
fn spirv_words(bytes: &[u8]) -> Result<Vec<u32>> {
    if bytes.is_empty() || bytes.len() % 4 != 0 {
        return Err(GpuError::Reflection(format!(
            "SPIR-V blob length {} is not a positive multiple of 4",
            bytes.len()
        )));
    }
    Ok(bytes
        .chunks_exact(4)
        .map(|chunk| u32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
        .collect())
}

fn stage_to_vk(stage: ReflectShaderStageFlags) -> Result<vk::ShaderStageFlags> {
    match stage {
        ReflectShaderStageFlags::VERTEX => Ok(vk::ShaderStageFlags::VERTEX),
        ReflectShaderStageFlags::FRAGMENT => Ok(vk::ShaderStageFlags::FRAGMENT),
        ReflectShaderStageFlags::COMPUTE => Ok(vk::ShaderStageFlags::COMPUTE),
        other => Err(GpuError::Reflection(format!(
            "unsupported shader stage {other:?}"
        ))),
    }
}

/// Discover the stage and push-constant block of a SPIR-V blob.
fn reflect(bytes: &[u8]) -> Result<(vk::ShaderStageFlags, Option<PushRange>)> {
    let module = spirv_reflect::ShaderModule::load_u8_data(bytes)
        .map_err(|e| GpuError::Reflection(e.to_string()))?;

    let stage = stage_to_vk(module.get_shader_stage())?;

    let blocks = module
        .enumerate_push_constant_blocks(None)
        .map_err(|e| GpuError::Reflection(e.to_string()))?;
    assert!(
        blocks.len() <= 1,
        "shader declares {} push-constant blocks; at most one is supported",
        blocks.len()
    );
    let push_range = blocks
        .first()
        .filter(|block| block.size > 0)
        .map(|block| PushRange {
            offset: block.offset,
            size: block.size,
        });

    Ok((stage, push_range))
}

pub fn create_shader_resource(
    device: &DeviceContext,
    bytes: &[u8],
    name: &str,
) -> Result<Shader> {
    let (stage, push_range) = reflect(bytes)?;

    let words = spirv_words(bytes)?;
    let create_info = vk::ShaderModuleCreateInfo::builder().code(&words);
    let module = unsafe { device.device.create_shader_module(&create_info, None) }
        .vk_call("vkCreateShaderModule")?;

    device.set_object_name(module, name);
    log::debug!(
        "Created shader {:?}: {:?}, push range {:?}",
        name,
        stage,
        push_range
    );

    Ok(Shader {
        module,
        stage,
        push_range,
    })
}

pub fn destroy_shader_resource(device: &DeviceContext, shader: &Shader) {
    unsafe { device.device.destroy_shader_module(shader.module, None) };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn word_conversion_is_little_endian() {
        let bytes = [0x03, 0x02, 0x23, 0x07, 0x00, 0x00, 0x01, 0x00];
        let words = spirv_words(&bytes).unwrap();
        assert_eq!(words, vec![0x0723_0203, 0x0001_0000]);
    }

    #[test]
    fn misaligned_blob_is_a_reflection_error() {
        let err = spirv_words(&[1, 2, 3]).unwrap_err();
        assert!(matches!(err, GpuError::Reflection(_)));
        let err = spirv_words(&[]).unwrap_err();
        assert!(matches!(err, GpuError::Reflection(_)));
    }

    #[test]
    fn stage_mapping_covers_supported_stages() {
        assert_eq!(
            stage_to_vk(ReflectShaderStageFlags::VERTEX).unwrap(),
            vk::ShaderStageFlags::VERTEX
        );
        assert_eq!(
            stage_to_vk(ReflectShaderStageFlags::FRAGMENT).unwrap(),
            vk::ShaderStageFlags::FRAGMENT
        );
        assert_eq!(
            stage_to_vk(ReflectShaderStageFlags::COMPUTE).unwrap(),
            vk::ShaderStageFlags::COMPUTE
        );
        assert!(stage_to_vk(ReflectShaderStageFlags::GEOMETRY).is_err());
    }
}
