// Buffer pool entries and memory-type selection
//
// Buffers own their device memory directly: the pool entry records the
// native buffer, the allocation (memory handle, type index, size), a cached
// device address for address-capable buffers, and a persistent host mapping
// for host-visible ones.

use ash::vk;
use bitflags::bitflags;

use super::device::DeviceContext;
use super::error::{GpuError, Result, VkCall};

bitflags! {
    /// Abstract buffer usage. Translated to native usage bits at creation.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct BufferUsage: u32 {
        const TRANSFER_SRC   = 1 << 0;
        const TRANSFER_DST   = 1 << 1;
        const UNIFORM        = 1 << 2;
        const STORAGE        = 1 << 3;
        const INDEX          = 1 << 4;
        const INDIRECT       = 1 << 5;
        /// The buffer gets a queryable device address (vertex pulling etc).
        const DEVICE_ADDRESS = 1 << 6;
    }
}

/// Where the buffer's memory should live.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemoryUsage {
    /// Device-local, not host-accessible. General-purpose GPU data.
    GpuOnly,
    /// Host-visible and persistently mapped. Staging and streaming data.
    CpuToGpu,
}

#[derive(Debug, Clone)]
pub struct BufferDesc<'a> {
    pub size: u64,
    pub usage: BufferUsage,
    pub memory: MemoryUsage,
    /// Debug name; attached to the native object when naming is enabled.
    pub name: &'a str,
}

/// Pool entry for one buffer.
pub struct Buffer {
    pub buffer: vk::Buffer,
    pub memory: vk::DeviceMemory,
    pub memory_type_index: u32,
    pub memory_size: u64,
    pub size: u64,
    /// Cached device address; 0 when the buffer is not address-capable.
    pub device_address: u64,
    /// Persistent mapping; null when the buffer is not host-visible.
    pub mapped: *mut u8,
}

fn to_vk_usage(usage: BufferUsage) -> vk::BufferUsageFlags {
    let mut out = vk::BufferUsageFlags::empty();
    if usage.contains(BufferUsage::TRANSFER_SRC) {
        out |= vk::BufferUsageFlags::TRANSFER_SRC;
    }
    if usage.contains(BufferUsage::TRANSFER_DST) {
        out |= vk::BufferUsageFlags::TRANSFER_DST;
    }
    if usage.contains(BufferUsage::UNIFORM) {
        out |= vk::BufferUsageFlags::UNIFORM_BUFFER;
    }
    if usage.contains(BufferUsage::STORAGE) {
        out |= vk::BufferUsageFlags::STORAGE_BUFFER;
    }
    if usage.contains(BufferUsage::INDEX) {
        out |= vk::BufferUsageFlags::INDEX_BUFFER;
    }
    if usage.contains(BufferUsage::INDIRECT) {
        out |= vk::BufferUsageFlags::INDIRECT_BUFFER;
    }
    if usage.contains(BufferUsage::DEVICE_ADDRESS) {
        out |= vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS;
    }
    out
}

/// Hard, wanted, and unwanted memory property flags for a placement.
pub fn memory_profile(
    memory: MemoryUsage,
) -> (
    vk::MemoryPropertyFlags,
    vk::MemoryPropertyFlags,
    vk::MemoryPropertyFlags,
) {
    match memory {
        MemoryUsage::GpuOnly => (
            vk::MemoryPropertyFlags::DEVICE_LOCAL,
            vk::MemoryPropertyFlags::empty(),
            vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_CACHED,
        ),
        MemoryUsage::CpuToGpu => (
            vk::MemoryPropertyFlags::HOST_VISIBLE,
            vk::MemoryPropertyFlags::HOST_COHERENT,
            vk::MemoryPropertyFlags::DEVICE_LOCAL,
        ),
    }
}

/// Pick the memory type minimizing missing-wanted + present-unwanted flag
/// counts, subject to the hard `required` mask and the requirement bits from
/// the native memory-requirements query. Ties keep the lowest index.
pub fn pick_memory_type(
    types: &[vk::MemoryType],
    type_bits: u32,
    required: vk::MemoryPropertyFlags,
    preferred: vk::MemoryPropertyFlags,
    avoided: vk::MemoryPropertyFlags,
) -> Option<u32> {
    let mut best: Option<(u32, u32)> = None;
    for (index, ty) in types.iter().enumerate() {
        if type_bits & (1u32 << index) == 0 {
            continue;
        }
        if !ty.property_flags.contains(required) {
            continue;
        }
        let missing = (preferred & !ty.property_flags).as_raw().count_ones();
        let unwanted = (ty.property_flags & avoided).as_raw().count_ones();
        let cost = missing + unwanted;
        match best {
            Some((_, best_cost)) if cost >= best_cost => {}
            _ => best = Some((index as u32, cost)),
        }
    }
    best.map(|(index, _)| index)
}

pub fn create_buffer_resource(device: &DeviceContext, desc: &BufferDesc) -> Result<Buffer> {
    let buffer_info = vk::BufferCreateInfo::builder()
        .size(desc.size)
        .usage(to_vk_usage(desc.usage))
        .sharing_mode(vk::SharingMode::EXCLUSIVE);
    let buffer = unsafe { device.device.create_buffer(&buffer_info, None) }
        .vk_call("vkCreateBuffer")?;

    let requirements = unsafe { device.device.get_buffer_memory_requirements(buffer) };
    let (required, preferred, avoided) = memory_profile(desc.memory);
    let type_count = device.memory_properties.memory_type_count as usize;
    let Some(memory_type_index) = pick_memory_type(
        &device.memory_properties.memory_types[..type_count],
        requirements.memory_type_bits,
        required,
        preferred,
        avoided,
    ) else {
        unsafe { device.device.destroy_buffer(buffer, None) };
        return Err(GpuError::MissingCapability(format!(
            "no memory type for a {} byte {:?} buffer",
            desc.size, desc.memory
        )));
    };

    let mut flags_info =
        vk::MemoryAllocateFlagsInfo::builder().flags(vk::MemoryAllocateFlags::DEVICE_ADDRESS);
    let mut alloc_info = vk::MemoryAllocateInfo::builder()
        .allocation_size(requirements.size)
        .memory_type_index(memory_type_index);
    if desc.usage.contains(BufferUsage::DEVICE_ADDRESS) {
        alloc_info = alloc_info.push_next(&mut flags_info);
    }
    let memory = match unsafe { device.device.allocate_memory(&alloc_info, None) }
        .vk_call("vkAllocateMemory")
    {
        Ok(memory) => memory,
        Err(err) => {
            unsafe { device.device.destroy_buffer(buffer, None) };
            return Err(err);
        }
    };
    if let Err(err) =
        unsafe { device.device.bind_buffer_memory(buffer, memory, 0) }.vk_call("vkBindBufferMemory")
    {
        unsafe {
            device.device.destroy_buffer(buffer, None);
            device.device.free_memory(memory, None);
        }
        return Err(err);
    }

    let mapped = if desc.memory == MemoryUsage::CpuToGpu {
        unsafe {
            device
                .device
                .map_memory(memory, 0, vk::WHOLE_SIZE, vk::MemoryMapFlags::empty())
        }
        .vk_call("vkMapMemory")? as *mut u8
    } else {
        std::ptr::null_mut()
    };

    let device_address = if desc.usage.contains(BufferUsage::DEVICE_ADDRESS) {
        let address_info = vk::BufferDeviceAddressInfo::builder().buffer(buffer);
        unsafe { device.device.get_buffer_device_address(&address_info) }
    } else {
        0
    };

    device.set_object_name(buffer, desc.name);
    log::debug!(
        "Created buffer {:?}: {} bytes, type {}, usage {:?}",
        desc.name,
        desc.size,
        memory_type_index,
        desc.usage
    );

    Ok(Buffer {
        buffer,
        memory,
        memory_type_index,
        memory_size: requirements.size,
        size: desc.size,
        device_address,
        mapped,
    })
}

/// Freeing the memory also drops any persistent mapping.
pub fn destroy_buffer_resource(device: &DeviceContext, buffer: &Buffer) {
    unsafe {
        device.device.destroy_buffer(buffer.buffer, None);
        device.device.free_memory(buffer.memory, None);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn memory_type(flags: vk::MemoryPropertyFlags) -> vk::MemoryType {
        vk::MemoryType {
            property_flags: flags,
            heap_index: 0,
        }
    }

    const DEVICE_LOCAL: vk::MemoryPropertyFlags = vk::MemoryPropertyFlags::DEVICE_LOCAL;
    const HOST_VISIBLE: vk::MemoryPropertyFlags = vk::MemoryPropertyFlags::HOST_VISIBLE;
    const HOST_COHERENT: vk::MemoryPropertyFlags = vk::MemoryPropertyFlags::HOST_COHERENT;

    #[test]
    fn required_mask_is_hard() {
        let types = [
            memory_type(HOST_VISIBLE | HOST_COHERENT),
            memory_type(DEVICE_LOCAL),
        ];
        let picked = pick_memory_type(
            &types,
            0b11,
            DEVICE_LOCAL,
            vk::MemoryPropertyFlags::empty(),
            vk::MemoryPropertyFlags::empty(),
        );
        assert_eq!(picked, Some(1));
    }

    #[test]
    fn type_bits_filter_applies() {
        let types = [memory_type(DEVICE_LOCAL), memory_type(DEVICE_LOCAL)];
        let picked = pick_memory_type(
            &types,
            0b10,
            DEVICE_LOCAL,
            vk::MemoryPropertyFlags::empty(),
            vk::MemoryPropertyFlags::empty(),
        );
        assert_eq!(picked, Some(1));
    }

    #[test]
    fn preferred_flags_lower_cost() {
        let types = [
            memory_type(HOST_VISIBLE),
            memory_type(HOST_VISIBLE | HOST_COHERENT),
        ];
        let picked = pick_memory_type(
            &types,
            0b11,
            HOST_VISIBLE,
            HOST_COHERENT,
            vk::MemoryPropertyFlags::empty(),
        );
        assert_eq!(picked, Some(1));
    }

    #[test]
    fn avoided_flags_raise_cost() {
        let types = [
            memory_type(HOST_VISIBLE | DEVICE_LOCAL),
            memory_type(HOST_VISIBLE),
        ];
        let picked = pick_memory_type(
            &types,
            0b11,
            HOST_VISIBLE,
            vk::MemoryPropertyFlags::empty(),
            DEVICE_LOCAL,
        );
        assert_eq!(picked, Some(1));
    }

    #[test]
    fn ties_keep_lowest_index() {
        let types = [memory_type(DEVICE_LOCAL), memory_type(DEVICE_LOCAL)];
        let picked = pick_memory_type(
            &types,
            0b11,
            DEVICE_LOCAL,
            vk::MemoryPropertyFlags::empty(),
            vk::MemoryPropertyFlags::empty(),
        );
        assert_eq!(picked, Some(0));
    }

    #[test]
    fn no_match_is_none() {
        let types = [memory_type(HOST_VISIBLE)];
        let picked = pick_memory_type(
            &types,
            0b1,
            DEVICE_LOCAL,
            vk::MemoryPropertyFlags::empty(),
            vk::MemoryPropertyFlags::empty(),
        );
        assert_eq!(picked, None);
    }

    #[test]
    fn usage_translation_covers_every_flag() {
        let all = BufferUsage::all();
        let native = to_vk_usage(all);
        assert!(native.contains(vk::BufferUsageFlags::TRANSFER_SRC));
        assert!(native.contains(vk::BufferUsageFlags::TRANSFER_DST));
        assert!(native.contains(vk::BufferUsageFlags::UNIFORM_BUFFER));
        assert!(native.contains(vk::BufferUsageFlags::STORAGE_BUFFER));
        assert!(native.contains(vk::BufferUsageFlags::INDEX_BUFFER));
        assert!(native.contains(vk::BufferUsageFlags::INDIRECT_BUFFER));
        assert!(native.contains(vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS));
        assert_eq!(to_vk_usage(BufferUsage::empty()), vk::BufferUsageFlags::empty());
    }

    #[test]
    fn gpu_only_profile_avoids_host_flags() {
        let (required, _, avoided) = memory_profile(MemoryUsage::GpuOnly);
        assert!(required.contains(DEVICE_LOCAL));
        assert!(avoided.contains(HOST_VISIBLE));
    }

    #[test]
    fn cpu_to_gpu_profile_requires_host_visible() {
        let (required, preferred, _) = memory_profile(MemoryUsage::CpuToGpu);
        assert!(required.contains(HOST_VISIBLE));
        assert!(preferred.contains(HOST_COHERENT));
    }
}
