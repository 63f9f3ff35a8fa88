// Image pool entries
//
// 2D images with optimal tiling and device-local memory. Swapchain
// backbuffers are wrapped through the same pool but own no device memory;
// destroying a wrapper tears down only the view and the pool entry.

use ash::vk;
use bitflags::bitflags;

use super::buffer::{memory_profile, pick_memory_type, MemoryUsage};
use super::device::DeviceContext;
use super::error::{GpuError, Result, VkCall};

bitflags! {
    /// Abstract image usage. Translated to native usage bits at creation.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct ImageUsage: u32 {
        const SAMPLED          = 1 << 0;
        const COLOR_ATTACHMENT = 1 << 1;
        const DEPTH_ATTACHMENT = 1 << 2;
        const TRANSFER_SRC     = 1 << 3;
        const TRANSFER_DST     = 1 << 4;
        const STORAGE          = 1 << 5;
    }
}

#[derive(Debug, Clone)]
pub struct ImageDesc<'a> {
    pub width: u32,
    pub height: u32,
    pub format: vk::Format,
    pub usage: ImageUsage,
    /// Debug name; attached to the native object when naming is enabled.
    pub name: &'a str,
}

/// Pool entry for one image.
pub struct Image {
    pub image: vk::Image,
    pub view: vk::ImageView,
    /// Null for swapchain wrappers; the presentation engine owns those.
    pub memory: vk::DeviceMemory,
    pub memory_type_index: u32,
    pub memory_size: u64,
    pub width: u32,
    pub height: u32,
    pub format: vk::Format,
    /// Bindless sampled-image slot; 0 = unbound.
    pub bind_index: u32,
}

impl Image {
    pub fn owns_memory(&self) -> bool {
        self.memory != vk::DeviceMemory::null()
    }
}

fn to_vk_usage(usage: ImageUsage) -> vk::ImageUsageFlags {
    let mut out = vk::ImageUsageFlags::empty();
    if usage.contains(ImageUsage::SAMPLED) {
        out |= vk::ImageUsageFlags::SAMPLED;
    }
    if usage.contains(ImageUsage::COLOR_ATTACHMENT) {
        out |= vk::ImageUsageFlags::COLOR_ATTACHMENT;
    }
    if usage.contains(ImageUsage::DEPTH_ATTACHMENT) {
        out |= vk::ImageUsageFlags::DEPTH_STENCIL_ATTACHMENT;
    }
    if usage.contains(ImageUsage::TRANSFER_SRC) {
        out |= vk::ImageUsageFlags::TRANSFER_SRC;
    }
    if usage.contains(ImageUsage::TRANSFER_DST) {
        out |= vk::ImageUsageFlags::TRANSFER_DST;
    }
    if usage.contains(ImageUsage::STORAGE) {
        out |= vk::ImageUsageFlags::STORAGE;
    }
    out
}

/// Aspect implied by the pixel format.
pub fn aspect_for_format(format: vk::Format) -> vk::ImageAspectFlags {
    match format {
        vk::Format::D16_UNORM | vk::Format::D32_SFLOAT | vk::Format::X8_D24_UNORM_PACK32 => {
            vk::ImageAspectFlags::DEPTH
        }
        vk::Format::D16_UNORM_S8_UINT
        | vk::Format::D24_UNORM_S8_UINT
        | vk::Format::D32_SFLOAT_S8_UINT => {
            vk::ImageAspectFlags::DEPTH | vk::ImageAspectFlags::STENCIL
        }
        _ => vk::ImageAspectFlags::COLOR,
    }
}

fn create_view(
    device: &DeviceContext,
    image: vk::Image,
    format: vk::Format,
) -> Result<vk::ImageView> {
    let view_info = vk::ImageViewCreateInfo::builder()
        .image(image)
        .view_type(vk::ImageViewType::TYPE_2D)
        .format(format)
        .subresource_range(vk::ImageSubresourceRange {
            aspect_mask: aspect_for_format(format),
            base_mip_level: 0,
            level_count: 1,
            base_array_layer: 0,
            layer_count: 1,
        });
    unsafe { device.device.create_image_view(&view_info, None) }.vk_call("vkCreateImageView")
}

pub fn create_image_resource(device: &DeviceContext, desc: &ImageDesc) -> Result<Image> {
    let image_info = vk::ImageCreateInfo::builder()
        .image_type(vk::ImageType::TYPE_2D)
        .extent(vk::Extent3D {
            width: desc.width,
            height: desc.height,
            depth: 1,
        })
        .mip_levels(1)
        .array_layers(1)
        .format(desc.format)
        .tiling(vk::ImageTiling::OPTIMAL)
        .initial_layout(vk::ImageLayout::UNDEFINED)
        .usage(to_vk_usage(desc.usage))
        .samples(vk::SampleCountFlags::TYPE_1)
        .sharing_mode(vk::SharingMode::EXCLUSIVE);
    let image =
        unsafe { device.device.create_image(&image_info, None) }.vk_call("vkCreateImage")?;

    let requirements = unsafe { device.device.get_image_memory_requirements(image) };
    let (required, preferred, avoided) = memory_profile(MemoryUsage::GpuOnly);
    let type_count = device.memory_properties.memory_type_count as usize;
    let Some(memory_type_index) = pick_memory_type(
        &device.memory_properties.memory_types[..type_count],
        requirements.memory_type_bits,
        required,
        preferred,
        avoided,
    ) else {
        unsafe { device.device.destroy_image(image, None) };
        return Err(GpuError::MissingCapability(format!(
            "no device-local memory type for a {}x{} {:?} image",
            desc.width, desc.height, desc.format
        )));
    };

    let alloc_info = vk::MemoryAllocateInfo::builder()
        .allocation_size(requirements.size)
        .memory_type_index(memory_type_index);
    let memory = match unsafe { device.device.allocate_memory(&alloc_info, None) }
        .vk_call("vkAllocateMemory")
    {
        Ok(memory) => memory,
        Err(err) => {
            unsafe { device.device.destroy_image(image, None) };
            return Err(err);
        }
    };
    if let Err(err) =
        unsafe { device.device.bind_image_memory(image, memory, 0) }.vk_call("vkBindImageMemory")
    {
        unsafe {
            device.device.destroy_image(image, None);
            device.device.free_memory(memory, None);
        }
        return Err(err);
    }

    let view = create_view(device, image, desc.format)?;

    device.set_object_name(image, desc.name);
    log::debug!(
        "Created image {:?}: {}x{} {:?}, usage {:?}",
        desc.name,
        desc.width,
        desc.height,
        desc.format,
        desc.usage
    );

    Ok(Image {
        image,
        view,
        memory,
        memory_type_index,
        memory_size: requirements.size,
        width: desc.width,
        height: desc.height,
        format: desc.format,
        bind_index: 0,
    })
}

/// Wrap a presentation-engine image. Owns the view but no memory.
pub fn wrap_swapchain_image(
    device: &DeviceContext,
    image: vk::Image,
    format: vk::Format,
    extent: vk::Extent2D,
) -> Result<Image> {
    let view = create_view(device, image, format)?;
    Ok(Image {
        image,
        view,
        memory: vk::DeviceMemory::null(),
        memory_type_index: 0,
        memory_size: 0,
        width: extent.width,
        height: extent.height,
        format,
        bind_index: 0,
    })
}

pub fn destroy_image_resource(device: &DeviceContext, image: &Image) {
    unsafe {
        device.device.destroy_image_view(image.view, None);
        if image.owns_memory() {
            device.device.destroy_image(image.image, None);
            device.device.free_memory(image.memory, None);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn aspect_follows_format() {
        assert_eq!(
            aspect_for_format(vk::Format::B8G8R8A8_SRGB),
            vk::ImageAspectFlags::COLOR
        );
        assert_eq!(
            aspect_for_format(vk::Format::D32_SFLOAT),
            vk::ImageAspectFlags::DEPTH
        );
        assert_eq!(
            aspect_for_format(vk::Format::D24_UNORM_S8_UINT),
            vk::ImageAspectFlags::DEPTH | vk::ImageAspectFlags::STENCIL
        );
    }

    #[test]
    fn usage_translation_covers_every_flag() {
        let native = to_vk_usage(ImageUsage::all());
        assert!(native.contains(vk::ImageUsageFlags::SAMPLED));
        assert!(native.contains(vk::ImageUsageFlags::COLOR_ATTACHMENT));
        assert!(native.contains(vk::ImageUsageFlags::DEPTH_STENCIL_ATTACHMENT));
        assert!(native.contains(vk::ImageUsageFlags::TRANSFER_SRC));
        assert!(native.contains(vk::ImageUsageFlags::TRANSFER_DST));
        assert!(native.contains(vk::ImageUsageFlags::STORAGE));
    }
}
