// Swapchain - window presentation
//
// Backbuffers are wrapped through the image pool like any other image, but
// the presentation engine owns their memory; recreation tears down views
// and pool entries only. Format, present mode, and extent choices are pure
// functions over the queried surface data.

use ash::extensions::khr;
use ash::vk;

use super::device::DeviceContext;
use super::error::{GpuError, Result, SwapchainStatus, VkCall};
use super::handle::{Handle, Pool};
use super::image::{self, Image};

/// Outcome of acquiring the next backbuffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AcquireOutcome {
    Ready { image_index: u32 },
    /// Nothing was acquired; recreate before trying again.
    NeedsRecreate,
}

pub struct Swapchain {
    pub swapchain: vk::SwapchainKHR,
    pub loader: khr::Swapchain,
    pub format: vk::Format,
    pub extent: vk::Extent2D,
    /// Pool handles of the wrapped backbuffers, in native image order.
    pub backbuffers: Vec<Handle<Image>>,
    preferred_mode: Option<vk::PresentModeKHR>,
}

/// Prefer 8-bit SRGB swapchain formats, BGRA first.
pub fn choose_surface_format(formats: &[vk::SurfaceFormatKHR]) -> Option<vk::SurfaceFormatKHR> {
    const PREFERENCE: [vk::Format; 4] = [
        vk::Format::B8G8R8A8_SRGB,
        vk::Format::R8G8B8A8_SRGB,
        vk::Format::B8G8R8A8_UNORM,
        vk::Format::R8G8B8A8_UNORM,
    ];
    for wanted in PREFERENCE {
        if let Some(&found) = formats
            .iter()
            .find(|f| f.format == wanted && f.color_space == vk::ColorSpaceKHR::SRGB_NONLINEAR)
        {
            return Some(found);
        }
    }
    None
}

/// Honor an explicit preference when the surface offers it, otherwise take
/// MAILBOX (low latency, no tearing) and fall back to the always-available
/// FIFO.
pub fn choose_present_mode(
    available: &[vk::PresentModeKHR],
    preferred: Option<vk::PresentModeKHR>,
) -> vk::PresentModeKHR {
    if let Some(mode) = preferred {
        if available.contains(&mode) {
            return mode;
        }
    }
    if available.contains(&vk::PresentModeKHR::MAILBOX) {
        return vk::PresentModeKHR::MAILBOX;
    }
    vk::PresentModeKHR::FIFO
}

/// The surface dictates the extent when it reports a fixed one; otherwise
/// clamp the requested size to the reported bounds.
pub fn choose_extent(
    caps: &vk::SurfaceCapabilitiesKHR,
    width: u32,
    height: u32,
) -> vk::Extent2D {
    if caps.current_extent.width != u32::MAX {
        return caps.current_extent;
    }
    vk::Extent2D {
        width: width.clamp(caps.min_image_extent.width, caps.max_image_extent.width),
        height: height.clamp(caps.min_image_extent.height, caps.max_image_extent.height),
    }
}

/// One above the minimum, clamped to the maximum (0 = unbounded).
pub fn choose_image_count(caps: &vk::SurfaceCapabilitiesKHR) -> u32 {
    let mut count = caps.min_image_count + 1;
    if caps.max_image_count > 0 && count > caps.max_image_count {
        count = caps.max_image_count;
    }
    count
}

impl Swapchain {
    pub fn new(
        device: &DeviceContext,
        images: &mut Pool<Image>,
        width: u32,
        height: u32,
        preferred_mode: Option<vk::PresentModeKHR>,
    ) -> Result<Self> {
        let loader = khr::Swapchain::new(&device.instance, &device.device);
        let mut swapchain = Self {
            swapchain: vk::SwapchainKHR::null(),
            loader,
            format: vk::Format::UNDEFINED,
            extent: vk::Extent2D::default(),
            backbuffers: Vec::new(),
            preferred_mode,
        };
        swapchain.create(device, images, width, height)?;
        Ok(swapchain)
    }

    /// Tear down the old chain and build a new one at the given size.
    /// Safe to call when nothing changed; the result is equivalent.
    pub fn recreate(
        &mut self,
        device: &DeviceContext,
        images: &mut Pool<Image>,
        width: u32,
        height: u32,
    ) -> Result<()> {
        device.wait_idle()?;
        self.destroy(device, images);
        self.create(device, images, width, height)
    }

    fn create(
        &mut self,
        device: &DeviceContext,
        images: &mut Pool<Image>,
        width: u32,
        height: u32,
    ) -> Result<()> {
        let caps = unsafe {
            device
                .surface_loader
                .get_physical_device_surface_capabilities(device.physical_device, device.surface)
        }
        .vk_call("vkGetPhysicalDeviceSurfaceCapabilitiesKHR")?;
        let formats = unsafe {
            device
                .surface_loader
                .get_physical_device_surface_formats(device.physical_device, device.surface)
        }
        .vk_call("vkGetPhysicalDeviceSurfaceFormatsKHR")?;
        let present_modes = unsafe {
            device
                .surface_loader
                .get_physical_device_surface_present_modes(device.physical_device, device.surface)
        }
        .vk_call("vkGetPhysicalDeviceSurfacePresentModesKHR")?;

        let surface_format = choose_surface_format(&formats).ok_or_else(|| {
            GpuError::MissingCapability("no compatible surface format".into())
        })?;
        let present_mode = choose_present_mode(&present_modes, self.preferred_mode);
        let extent = choose_extent(&caps, width, height);
        let image_count = choose_image_count(&caps);

        log::info!(
            "Creating swapchain: {}x{}, {:?}, {:?}, {} images",
            extent.width,
            extent.height,
            surface_format.format,
            present_mode,
            image_count
        );

        let create_info = vk::SwapchainCreateInfoKHR::builder()
            .surface(device.surface)
            .min_image_count(image_count)
            .image_format(surface_format.format)
            .image_color_space(surface_format.color_space)
            .image_extent(extent)
            .image_array_layers(1)
            .image_usage(vk::ImageUsageFlags::COLOR_ATTACHMENT | vk::ImageUsageFlags::TRANSFER_DST)
            .image_sharing_mode(vk::SharingMode::EXCLUSIVE)
            .pre_transform(caps.current_transform)
            .composite_alpha(vk::CompositeAlphaFlagsKHR::OPAQUE)
            .present_mode(present_mode)
            .clipped(true);

        self.swapchain = unsafe { self.loader.create_swapchain(&create_info, None) }
            .vk_call("vkCreateSwapchainKHR")?;
        self.format = surface_format.format;
        self.extent = extent;

        let native_images = unsafe { self.loader.get_swapchain_images(self.swapchain) }
            .vk_call("vkGetSwapchainImagesKHR")?;
        self.backbuffers.reserve(native_images.len());
        for (index, &native) in native_images.iter().enumerate() {
            let wrapper = image::wrap_swapchain_image(device, native, self.format, extent)?;
            device.set_object_name(native, &format!("backbuffer {index}"));
            self.backbuffers.push(images.alloc(wrapper));
        }

        Ok(())
    }

    /// View-and-pool-entry teardown only; the presentation engine owns the
    /// backbuffer memory.
    pub fn destroy(&mut self, device: &DeviceContext, images: &mut Pool<Image>) {
        for handle in self.backbuffers.drain(..) {
            let wrapper = images.free(handle);
            assert!(
                !wrapper.owns_memory(),
                "backbuffer wrapper must not own device memory"
            );
            image::destroy_image_resource(device, &wrapper);
        }
        if self.swapchain != vk::SwapchainKHR::null() {
            unsafe { self.loader.destroy_swapchain(self.swapchain, None) };
            self.swapchain = vk::SwapchainKHR::null();
        }
    }

    pub fn acquire(&self, semaphore: vk::Semaphore) -> Result<AcquireOutcome> {
        let result = unsafe {
            self.loader
                .acquire_next_image(self.swapchain, u64::MAX, semaphore, vk::Fence::null())
        };
        match result {
            // A suboptimal acquire still hands us an image; finish the frame
            // and let present report the recreate.
            Ok((image_index, _suboptimal)) => Ok(AcquireOutcome::Ready { image_index }),
            Err(vk::Result::ERROR_OUT_OF_DATE_KHR) => Ok(AcquireOutcome::NeedsRecreate),
            Err(result) => Err(GpuError::Native {
                call: "vkAcquireNextImageKHR",
                result,
            }),
        }
    }

    pub fn present(
        &self,
        queue: vk::Queue,
        image_index: u32,
        wait_semaphores: &[vk::Semaphore],
    ) -> Result<SwapchainStatus> {
        let swapchains = [self.swapchain];
        let image_indices = [image_index];
        let present_info = vk::PresentInfoKHR::builder()
            .wait_semaphores(wait_semaphores)
            .swapchains(&swapchains)
            .image_indices(&image_indices);

        let result = unsafe { self.loader.queue_present(queue, &present_info) };
        match result {
            Ok(false) => Ok(SwapchainStatus::Ok),
            Ok(true) | Err(vk::Result::ERROR_OUT_OF_DATE_KHR) => Ok(SwapchainStatus::NeedsRecreate),
            Err(result) => Err(GpuError::Native {
                call: "vkQueuePresentKHR",
                result,
            }),
        }
    }

    pub fn backbuffer(&self, image_index: u32) -> Handle<Image> {
        self.backbuffers[image_index as usize]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn format(f: vk::Format, space: vk::ColorSpaceKHR) -> vk::SurfaceFormatKHR {
        vk::SurfaceFormatKHR {
            format: f,
            color_space: space,
        }
    }

    #[test]
    fn format_choice_prefers_bgra_srgb() {
        let formats = [
            format(vk::Format::R8G8B8A8_UNORM, vk::ColorSpaceKHR::SRGB_NONLINEAR),
            format(vk::Format::B8G8R8A8_SRGB, vk::ColorSpaceKHR::SRGB_NONLINEAR),
        ];
        let chosen = choose_surface_format(&formats).unwrap();
        assert_eq!(chosen.format, vk::Format::B8G8R8A8_SRGB);
    }

    #[test]
    fn format_choice_falls_through_preference_order() {
        let formats = [
            format(vk::Format::R16G16B16A16_SFLOAT, vk::ColorSpaceKHR::SRGB_NONLINEAR),
            format(vk::Format::R8G8B8A8_UNORM, vk::ColorSpaceKHR::SRGB_NONLINEAR),
        ];
        let chosen = choose_surface_format(&formats).unwrap();
        assert_eq!(chosen.format, vk::Format::R8G8B8A8_UNORM);
    }

    #[test]
    fn format_choice_rejects_wrong_color_space() {
        let formats = [format(
            vk::Format::B8G8R8A8_SRGB,
            vk::ColorSpaceKHR::EXTENDED_SRGB_LINEAR_EXT,
        )];
        assert!(choose_surface_format(&formats).is_none());
    }

    #[test]
    fn present_mode_honors_available_preference() {
        let available = [vk::PresentModeKHR::FIFO, vk::PresentModeKHR::IMMEDIATE];
        let chosen = choose_present_mode(&available, Some(vk::PresentModeKHR::IMMEDIATE));
        assert_eq!(chosen, vk::PresentModeKHR::IMMEDIATE);
    }

    #[test]
    fn present_mode_defaults_to_mailbox_then_fifo() {
        let with_mailbox = [vk::PresentModeKHR::FIFO, vk::PresentModeKHR::MAILBOX];
        assert_eq!(
            choose_present_mode(&with_mailbox, None),
            vk::PresentModeKHR::MAILBOX
        );
        let fifo_only = [vk::PresentModeKHR::FIFO];
        assert_eq!(
            choose_present_mode(&fifo_only, None),
            vk::PresentModeKHR::FIFO
        );
        assert_eq!(
            choose_present_mode(&fifo_only, Some(vk::PresentModeKHR::MAILBOX)),
            vk::PresentModeKHR::FIFO
        );
    }

    #[test]
    fn extent_takes_fixed_surface_size() {
        let caps = vk::SurfaceCapabilitiesKHR {
            current_extent: vk::Extent2D {
                width: 800,
                height: 600,
            },
            ..Default::default()
        };
        let extent = choose_extent(&caps, 1920, 1080);
        assert_eq!((extent.width, extent.height), (800, 600));
    }

    #[test]
    fn extent_clamps_when_surface_is_flexible() {
        let caps = vk::SurfaceCapabilitiesKHR {
            current_extent: vk::Extent2D {
                width: u32::MAX,
                height: u32::MAX,
            },
            min_image_extent: vk::Extent2D {
                width: 200,
                height: 200,
            },
            max_image_extent: vk::Extent2D {
                width: 1000,
                height: 1000,
            },
            ..Default::default()
        };
        let extent = choose_extent(&caps, 4000, 100);
        assert_eq!((extent.width, extent.height), (1000, 200));
    }

    #[test]
    fn image_count_is_min_plus_one_clamped() {
        let unbounded = vk::SurfaceCapabilitiesKHR {
            min_image_count: 2,
            max_image_count: 0,
            ..Default::default()
        };
        assert_eq!(choose_image_count(&unbounded), 3);

        let tight = vk::SurfaceCapabilitiesKHR {
            min_image_count: 2,
            max_image_count: 2,
            ..Default::default()
        };
        assert_eq!(choose_image_count(&tight), 2);
    }
}
