// Immediate submissions
//
// A blocking upload path, independent of the frame pipeline: its own
// command pool, its own timeline semaphore, its own staging ring. Copies
// are recorded lazily into one open command buffer; `wait` submits and
// blocks until the device has drained everything. When the staging ring
// cannot hold the next copy, the path spills: it waits for the in-flight
// work, resets the ring, and retries.

use ash::vk;

use super::barrier::{buffer_barrier, image_barrier, stage_mask, ResourceAccess};
use super::buffer::{
    create_buffer_resource, destroy_buffer_resource, Buffer, BufferDesc, BufferUsage, MemoryUsage,
};
use super::device::DeviceContext;
use super::error::{GpuError, Result, VkCall};
use super::frame::StagingCursor;
use super::image::{aspect_for_format, Image};

pub const IMMEDIATE_STAGING_SIZE: u64 = 32 * 1024 * 1024;

/// Texel size for formats accepted by `copy_to_image`. None means the
/// format is not a supported upload target.
pub fn bytes_per_texel(format: vk::Format) -> Option<u64> {
    match format {
        vk::Format::R8_UNORM | vk::Format::R8_SRGB => Some(1),
        vk::Format::R8G8_UNORM | vk::Format::R16_SFLOAT => Some(2),
        vk::Format::R8G8B8A8_UNORM
        | vk::Format::R8G8B8A8_SRGB
        | vk::Format::B8G8R8A8_UNORM
        | vk::Format::B8G8R8A8_SRGB
        | vk::Format::R16G16_SFLOAT
        | vk::Format::R32_SFLOAT => Some(4),
        vk::Format::R16G16B16A16_SFLOAT | vk::Format::R32G32_SFLOAT => Some(8),
        vk::Format::R32G32B32A32_SFLOAT => Some(16),
        _ => None,
    }
}

pub struct ImmediateContext {
    command_pool: vk::CommandPool,
    command_buffer: vk::CommandBuffer,
    timeline: vk::Semaphore,
    submissions: u64,
    staging: Buffer,
    cursor: StagingCursor,
    recording: bool,
}

impl ImmediateContext {
    pub fn new(device: &DeviceContext) -> Result<Self> {
        let staging = create_buffer_resource(
            device,
            &BufferDesc {
                size: IMMEDIATE_STAGING_SIZE,
                usage: BufferUsage::TRANSFER_SRC,
                memory: MemoryUsage::CpuToGpu,
                name: "immediate staging",
            },
        )?;

        let mut timeline_info = vk::SemaphoreTypeCreateInfo::builder()
            .semaphore_type(vk::SemaphoreType::TIMELINE)
            .initial_value(0);
        let semaphore_info = vk::SemaphoreCreateInfo::builder().push_next(&mut timeline_info);
        let timeline = unsafe { device.device.create_semaphore(&semaphore_info, None) }
            .vk_call("vkCreateSemaphore")?;

        let pool_info = vk::CommandPoolCreateInfo::builder()
            .flags(vk::CommandPoolCreateFlags::TRANSIENT)
            .queue_family_index(device.queue_family);
        let command_pool = unsafe { device.device.create_command_pool(&pool_info, None) }
            .vk_call("vkCreateCommandPool")?;

        let alloc_info = vk::CommandBufferAllocateInfo::builder()
            .command_pool(command_pool)
            .level(vk::CommandBufferLevel::PRIMARY)
            .command_buffer_count(1);
        let command_buffer = unsafe { device.device.allocate_command_buffers(&alloc_info) }
            .vk_call("vkAllocateCommandBuffers")?[0];

        Ok(Self {
            command_pool,
            command_buffer,
            timeline,
            submissions: 0,
            staging,
            cursor: StagingCursor::new(IMMEDIATE_STAGING_SIZE),
            recording: false,
        })
    }

    fn ensure_recording(&mut self, device: &DeviceContext) -> Result<()> {
        if self.recording {
            return Ok(());
        }
        let begin_info = vk::CommandBufferBeginInfo::builder()
            .flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT);
        unsafe {
            device
                .device
                .begin_command_buffer(self.command_buffer, &begin_info)
        }
        .vk_call("vkBeginCommandBuffer")?;
        self.recording = true;
        Ok(())
    }

    /// Reserve staging space for `size` bytes, spilling through `wait` when
    /// the ring is full. A copy that can never fit is a capability error.
    fn reserve(&mut self, device: &DeviceContext, size: u64) -> Result<u64> {
        if size > IMMEDIATE_STAGING_SIZE {
            return Err(GpuError::MissingCapability(format!(
                "immediate copy of {} bytes exceeds the {} byte staging ring",
                size, IMMEDIATE_STAGING_SIZE
            )));
        }
        if let Some(offset) = self.cursor.allocate(size, 16) {
            return Ok(offset);
        }
        self.wait(device)?;
        match self.cursor.allocate(size, 16) {
            Some(offset) => Ok(offset),
            None => unreachable!("empty staging ring rejected a copy that fits"),
        }
    }

    fn stage(&mut self, device: &DeviceContext, bytes: &[u8]) -> Result<u64> {
        let offset = self.reserve(device, bytes.len() as u64)?;
        unsafe {
            std::ptr::copy_nonoverlapping(
                bytes.as_ptr(),
                self.staging.mapped.add(offset as usize),
                bytes.len(),
            );
        }
        Ok(offset)
    }

    /// Stage `bytes` and record a copy into `dst`. Blocks only when the
    /// staging ring spills.
    pub fn copy_to_buffer(
        &mut self,
        device: &DeviceContext,
        dst: &Buffer,
        dst_offset: u64,
        bytes: &[u8],
    ) -> Result<()> {
        let staging_offset = self.stage(device, bytes)?;
        self.ensure_recording(device)?;

        let region = vk::BufferCopy {
            src_offset: staging_offset,
            dst_offset,
            size: bytes.len() as u64,
        };
        let drain = buffer_barrier(
            dst.buffer,
            ResourceAccess::TRANSFER_WRITE,
            ResourceAccess::INDEX_READ
                | ResourceAccess::INDIRECT_ARGS
                | ResourceAccess::VERTEX_SHADER_READ
                | ResourceAccess::FRAGMENT_SHADER_READ,
        );
        unsafe {
            device.device.cmd_copy_buffer(
                self.command_buffer,
                self.staging.buffer,
                dst.buffer,
                &[region],
            );
            device.device.cmd_pipeline_barrier(
                self.command_buffer,
                stage_mask(ResourceAccess::TRANSFER_WRITE),
                stage_mask(
                    ResourceAccess::INDEX_READ
                        | ResourceAccess::INDIRECT_ARGS
                        | ResourceAccess::VERTEX_SHADER_READ
                        | ResourceAccess::FRAGMENT_SHADER_READ,
                ),
                vk::DependencyFlags::empty(),
                &[],
                &[drain],
                &[],
            );
        }
        Ok(())
    }

    /// Stage tightly packed pixels and record the full upload sequence for
    /// `dst`: transition in, copy, transition to shader-readable. Panics
    /// when the byte count does not match the image dimensions.
    pub fn copy_to_image(
        &mut self,
        device: &DeviceContext,
        dst: &Image,
        bytes: &[u8],
    ) -> Result<()> {
        if let Some(texel) = bytes_per_texel(dst.format) {
            let expected = u64::from(dst.width) * u64::from(dst.height) * texel;
            assert_eq!(
                bytes.len() as u64,
                expected,
                "pixel data is {} bytes, a {}x{} {:?} image needs {}",
                bytes.len(),
                dst.width,
                dst.height,
                dst.format,
                expected
            );
        }
        let staging_offset = self.stage(device, bytes)?;
        self.ensure_recording(device)?;

        let aspect = aspect_for_format(dst.format);
        let to_transfer = image_barrier(
            dst.image,
            aspect,
            ResourceAccess::empty(),
            ResourceAccess::TRANSFER_WRITE,
        );
        let to_sampled = image_barrier(
            dst.image,
            aspect,
            ResourceAccess::TRANSFER_WRITE,
            ResourceAccess::VERTEX_SHADER_READ | ResourceAccess::FRAGMENT_SHADER_READ,
        );
        let region = vk::BufferImageCopy {
            buffer_offset: staging_offset,
            buffer_row_length: 0,
            buffer_image_height: 0,
            image_subresource: vk::ImageSubresourceLayers {
                aspect_mask: aspect,
                mip_level: 0,
                base_array_layer: 0,
                layer_count: 1,
            },
            image_offset: vk::Offset3D { x: 0, y: 0, z: 0 },
            image_extent: vk::Extent3D {
                width: dst.width,
                height: dst.height,
                depth: 1,
            },
        };
        unsafe {
            device.device.cmd_pipeline_barrier(
                self.command_buffer,
                stage_mask(ResourceAccess::empty()),
                stage_mask(ResourceAccess::TRANSFER_WRITE),
                vk::DependencyFlags::empty(),
                &[],
                &[],
                &[to_transfer],
            );
            device.device.cmd_copy_buffer_to_image(
                self.command_buffer,
                self.staging.buffer,
                dst.image,
                vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                &[region],
            );
            device.device.cmd_pipeline_barrier(
                self.command_buffer,
                stage_mask(ResourceAccess::TRANSFER_WRITE),
                stage_mask(
                    ResourceAccess::VERTEX_SHADER_READ | ResourceAccess::FRAGMENT_SHADER_READ,
                ),
                vk::DependencyFlags::empty(),
                &[],
                &[],
                &[to_sampled],
            );
        }
        Ok(())
    }

    /// Submit any recorded copies and block until the device has executed
    /// every immediate submission so far, then recycle the pool and ring.
    pub fn wait(&mut self, device: &DeviceContext) -> Result<()> {
        if self.recording {
            unsafe { device.device.end_command_buffer(self.command_buffer) }
                .vk_call("vkEndCommandBuffer")?;
            self.recording = false;
            self.submissions += 1;

            let command_buffers = [self.command_buffer];
            let signal_semaphores = [self.timeline];
            let signal_values = [self.submissions];
            let mut timeline_submit = vk::TimelineSemaphoreSubmitInfo::builder()
                .signal_semaphore_values(&signal_values);
            let submit_info = vk::SubmitInfo::builder()
                .command_buffers(&command_buffers)
                .signal_semaphores(&signal_semaphores)
                .push_next(&mut timeline_submit);
            unsafe {
                device
                    .device
                    .queue_submit(device.queue, &[submit_info.build()], vk::Fence::null())
            }
            .vk_call("vkQueueSubmit")?;
            log::debug!("Immediate submission {} flushed", self.submissions);
        }

        if self.submissions > 0 {
            let semaphores = [self.timeline];
            let values = [self.submissions];
            let wait_info = vk::SemaphoreWaitInfo::builder()
                .semaphores(&semaphores)
                .values(&values);
            unsafe { device.device.wait_semaphores(&wait_info, u64::MAX) }
                .vk_call("vkWaitSemaphores")?;
        }

        unsafe {
            device
                .device
                .reset_command_pool(self.command_pool, vk::CommandPoolResetFlags::empty())
        }
        .vk_call("vkResetCommandPool")?;
        self.cursor.reset();
        Ok(())
    }

    pub fn destroy(&mut self, device: &DeviceContext) {
        unsafe {
            device.device.destroy_semaphore(self.timeline, None);
            device.device.destroy_command_pool(self.command_pool, None);
        }
        destroy_buffer_resource(device, &self.staging);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn texel_sizes_for_upload_formats() {
        assert_eq!(bytes_per_texel(vk::Format::R8_UNORM), Some(1));
        assert_eq!(bytes_per_texel(vk::Format::R8G8B8A8_SRGB), Some(4));
        assert_eq!(bytes_per_texel(vk::Format::B8G8R8A8_UNORM), Some(4));
        assert_eq!(bytes_per_texel(vk::Format::R16G16B16A16_SFLOAT), Some(8));
        assert_eq!(bytes_per_texel(vk::Format::R32G32B32A32_SFLOAT), Some(16));
    }

    #[test]
    fn compressed_and_depth_formats_are_not_upload_targets() {
        assert_eq!(bytes_per_texel(vk::Format::D32_SFLOAT), None);
        assert_eq!(bytes_per_texel(vk::Format::BC7_SRGB_BLOCK), None);
    }
}
