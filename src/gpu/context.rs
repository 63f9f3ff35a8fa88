// GPU context
//
// The one public entry point of the layer. Owns the device, the bindless
// table, the frame pipeline, the immediate path, the swapchain, and the
// four resource pools. Everything callers touch goes through typed
// handles; native objects never cross this boundary except vk::Format in
// descs. Recording commands panic when no frame is open; that is a
// caller bug, not a runtime condition.

use ash::vk;
use raw_window_handle::{RawDisplayHandle, RawWindowHandle};

use super::barrier::{access_mask, buffer_barrier, image_barrier, stage_mask, ResourceAccess};
use super::buffer::{create_buffer_resource, destroy_buffer_resource, Buffer, BufferDesc};
use super::descriptor::BindlessTable;
use super::device::DeviceContext;
use super::error::{Result, SwapchainStatus};
use super::frame::{FramePipeline, FrameStatus, FRAMES_IN_FLIGHT};
use super::handle::{Handle, Pool};
use super::image::{
    aspect_for_format, create_image_resource, destroy_image_resource, Image, ImageDesc, ImageUsage,
};
use super::immediate::ImmediateContext;
use super::pipeline::{
    create_pipeline_resource, destroy_pipeline_resource, Pipeline, PipelineDesc,
};
use super::shader::{create_shader_resource, destroy_shader_resource, Shader};
use super::swapchain::Swapchain;

/// Knobs read once at init.
#[derive(Debug, Clone)]
pub struct GpuConfig {
    pub validation: bool,
    pub debug_names: bool,
    pub frames_in_flight: usize,
    pub preferred_present_mode: Option<vk::PresentModeKHR>,
}

impl Default for GpuConfig {
    fn default() -> Self {
        Self {
            validation: cfg!(debug_assertions),
            debug_names: cfg!(debug_assertions),
            frames_in_flight: FRAMES_IN_FLIGHT,
            preferred_present_mode: None,
        }
    }
}

impl GpuConfig {
    /// Configured frame depth, clamped to the slot count the pipeline
    /// actually has.
    pub fn clamped_frames_in_flight(&self) -> usize {
        self.frames_in_flight.clamp(1, FRAMES_IN_FLIGHT)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IndexKind {
    U16,
    U32,
}

pub fn index_type(kind: IndexKind) -> vk::IndexType {
    match kind {
        IndexKind::U16 => vk::IndexType::UINT16,
        IndexKind::U32 => vk::IndexType::UINT32,
    }
}

/// One dynamic-rendering pass. `clear_color`/`clear_depth` of None load
/// the existing attachment contents.
#[derive(Debug, Clone)]
pub struct PassDesc<'a> {
    pub pipeline: Handle<Pipeline>,
    pub color_attachments: &'a [Handle<Image>],
    pub depth_attachment: Option<Handle<Image>>,
    pub clear_color: Option<[f32; 4]>,
    pub clear_depth: Option<f32>,
    pub width: u32,
    pub height: u32,
}

pub struct Gpu {
    buffers: Pool<Buffer>,
    images: Pool<Image>,
    shaders: Pool<Shader>,
    pipelines: Pool<Pipeline>,

    swapchain: Swapchain,
    immediate: ImmediateContext,
    frames: FramePipeline,
    bindless: BindlessTable,
    device: DeviceContext,

    in_pass: bool,
    bound_pipeline: Option<Handle<Pipeline>>,
}

impl Gpu {
    pub fn new(
        display_handle: RawDisplayHandle,
        window_handle: RawWindowHandle,
        width: u32,
        height: u32,
        config: &GpuConfig,
    ) -> Result<Self> {
        let device = DeviceContext::new(
            display_handle,
            window_handle,
            config.validation,
            config.debug_names,
        )?;
        let bindless = BindlessTable::new(&device)?;
        let frames = FramePipeline::new(&device, config.clamped_frames_in_flight())?;
        let immediate = ImmediateContext::new(&device)?;

        let mut images = Pool::new();
        let swapchain = Swapchain::new(
            &device,
            &mut images,
            width,
            height,
            config.preferred_present_mode,
        )?;

        log::info!(
            "GPU context ready: {}x{} {:?}",
            width,
            height,
            swapchain.format
        );

        Ok(Self {
            buffers: Pool::new(),
            images,
            shaders: Pool::new(),
            pipelines: Pool::new(),
            swapchain,
            immediate,
            frames,
            bindless,
            device,
            in_pass: false,
            bound_pipeline: None,
        })
    }

    // ---- resources ------------------------------------------------------

    pub fn create_buffer(&mut self, desc: &BufferDesc) -> Result<Handle<Buffer>> {
        let buffer = create_buffer_resource(&self.device, desc)?;
        Ok(self.buffers.alloc(buffer))
    }

    pub fn destroy_buffer(&mut self, handle: Handle<Buffer>) {
        let buffer = self.buffers.free(handle);
        destroy_buffer_resource(&self.device, &buffer);
    }

    /// Create an image; sampled images also get a bindless slot pointing
    /// at the fresh view. The slot is never reused after destroy.
    pub fn create_image(&mut self, desc: &ImageDesc) -> Result<Handle<Image>> {
        let mut image = create_image_resource(&self.device, desc)?;
        if desc.usage.contains(ImageUsage::SAMPLED) {
            match self.bindless.register_image(&self.device, image.view) {
                Ok(slot) => image.bind_index = slot,
                Err(err) => {
                    destroy_image_resource(&self.device, &image);
                    return Err(err);
                }
            }
        }
        Ok(self.images.alloc(image))
    }

    pub fn destroy_image(&mut self, handle: Handle<Image>) {
        let image = self.images.free(handle);
        destroy_image_resource(&self.device, &image);
    }

    pub fn create_shader(&mut self, bytes: &[u8], name: &str) -> Result<Handle<Shader>> {
        let shader = create_shader_resource(&self.device, bytes, name)?;
        Ok(self.shaders.alloc(shader))
    }

    pub fn destroy_shader(&mut self, handle: Handle<Shader>) {
        let shader = self.shaders.free(handle);
        destroy_shader_resource(&self.device, &shader);
    }

    pub fn create_pipeline(&mut self, desc: &PipelineDesc) -> Result<Handle<Pipeline>> {
        let shaders: Vec<&Shader> = desc.shaders.iter().map(|&h| self.shaders.get(h)).collect();
        let pipeline =
            create_pipeline_resource(&self.device, self.bindless.layout, &shaders, desc)?;
        Ok(self.pipelines.alloc(pipeline))
    }

    pub fn destroy_pipeline(&mut self, handle: Handle<Pipeline>) {
        let pipeline = self.pipelines.free(handle);
        destroy_pipeline_resource(&self.device, &pipeline);
    }

    // ---- typed accessors ------------------------------------------------

    pub fn buffer_device_address(&self, handle: Handle<Buffer>) -> u64 {
        self.buffers.get(handle).device_address
    }

    pub fn buffer_size(&self, handle: Handle<Buffer>) -> u64 {
        self.buffers.get(handle).size
    }

    pub fn image_width(&self, handle: Handle<Image>) -> u32 {
        self.images.get(handle).width
    }

    pub fn image_height(&self, handle: Handle<Image>) -> u32 {
        self.images.get(handle).height
    }

    pub fn image_format(&self, handle: Handle<Image>) -> vk::Format {
        self.images.get(handle).format
    }

    /// Bindless slot of a sampled image; 0 means unbound.
    pub fn image_bind_index(&self, handle: Handle<Image>) -> u32 {
        self.images.get(handle).bind_index
    }

    pub fn swapchain_format(&self) -> vk::Format {
        self.swapchain.format
    }

    pub fn swapchain_extent(&self) -> (u32, u32) {
        (self.swapchain.extent.width, self.swapchain.extent.height)
    }

    // ---- frame lifecycle ------------------------------------------------

    pub fn begin_frame(&mut self) -> Result<FrameStatus> {
        self.frames
            .begin_frame(&self.device, &self.swapchain, &self.images)
    }

    pub fn end_frame(&mut self) -> Result<SwapchainStatus> {
        assert!(!self.in_pass, "a pass is still open at end of frame");
        self.frames
            .end_frame(&self.device, &self.swapchain, &self.images)
    }

    pub fn recreate_swapchain(&mut self, width: u32, height: u32) -> Result<()> {
        assert!(
            !self.frames.is_recording(),
            "cannot recreate the swapchain while a frame is being recorded"
        );
        self.swapchain
            .recreate(&self.device, &mut self.images, width, height)
    }

    /// Stream `bytes` into `dst` through the current frame's staging
    /// region. Ordering against draws is the caller's barrier.
    pub fn copy_to_buffer(
        &mut self,
        dst: Handle<Buffer>,
        dst_offset: u64,
        bytes: &[u8],
    ) -> Result<()> {
        let buffer = self.buffers.get(dst);
        self.frames
            .copy_to_buffer(&self.device, buffer, dst_offset, bytes)
    }

    // ---- immediate path --------------------------------------------------

    pub fn immediate_copy_to_buffer(
        &mut self,
        dst: Handle<Buffer>,
        dst_offset: u64,
        bytes: &[u8],
    ) -> Result<()> {
        let buffer = self.buffers.get(dst);
        self.immediate
            .copy_to_buffer(&self.device, buffer, dst_offset, bytes)
    }

    pub fn immediate_copy_to_image(&mut self, dst: Handle<Image>, bytes: &[u8]) -> Result<()> {
        let image = self.images.get(dst);
        self.immediate.copy_to_image(&self.device, image, bytes)
    }

    /// Flush and block until every immediate copy so far has executed.
    pub fn immediate_wait(&mut self) -> Result<()> {
        self.immediate.wait(&self.device)
    }

    pub fn wait_idle(&self) -> Result<()> {
        self.device.wait_idle()
    }

    // ---- recording -------------------------------------------------------

    pub fn cmd_barrier_image(
        &self,
        image: Handle<Image>,
        src: ResourceAccess,
        dst: ResourceAccess,
    ) {
        let cb = self.frames.command_buffer();
        let entry = self.images.get(image);
        let barrier = image_barrier(entry.image, aspect_for_format(entry.format), src, dst);
        unsafe {
            self.device.device.cmd_pipeline_barrier(
                cb,
                stage_mask(src),
                stage_mask(dst),
                vk::DependencyFlags::empty(),
                &[],
                &[],
                &[barrier],
            );
        }
    }

    pub fn cmd_barrier_buffer(
        &self,
        buffer: Handle<Buffer>,
        src: ResourceAccess,
        dst: ResourceAccess,
    ) {
        let cb = self.frames.command_buffer();
        let entry = self.buffers.get(buffer);
        let barrier = buffer_barrier(entry.buffer, src, dst);
        unsafe {
            self.device.device.cmd_pipeline_barrier(
                cb,
                stage_mask(src),
                stage_mask(dst),
                vk::DependencyFlags::empty(),
                &[],
                &[barrier],
                &[],
            );
        }
    }

    /// Global execution + memory barrier between two abstract access sets.
    pub fn cmd_barrier(&self, src: ResourceAccess, dst: ResourceAccess) {
        let cb = self.frames.command_buffer();
        let barrier = vk::MemoryBarrier::builder()
            .src_access_mask(access_mask(src))
            .dst_access_mask(access_mask(dst))
            .build();
        unsafe {
            self.device.device.cmd_pipeline_barrier(
                cb,
                stage_mask(src),
                stage_mask(dst),
                vk::DependencyFlags::empty(),
                &[barrier],
                &[],
                &[],
            );
        }
    }

    /// Begin dynamic rendering, bind the pipeline and the global bindless
    /// set, set viewport and scissor to the pass extent.
    pub fn cmd_begin_pass(&mut self, desc: &PassDesc) {
        assert!(!self.in_pass, "a pass is already open");
        let cb = self.frames.command_buffer();
        let pipeline = self.pipelines.get(desc.pipeline);

        let clear = desc.clear_color.unwrap_or([0.0; 4]);
        let color_load = if desc.clear_color.is_some() {
            vk::AttachmentLoadOp::CLEAR
        } else {
            vk::AttachmentLoadOp::LOAD
        };
        let color_attachments: Vec<_> = desc
            .color_attachments
            .iter()
            .map(|&handle| {
                vk::RenderingAttachmentInfo::builder()
                    .image_view(self.images.get(handle).view)
                    .image_layout(vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL)
                    .load_op(color_load)
                    .store_op(vk::AttachmentStoreOp::STORE)
                    .clear_value(vk::ClearValue {
                        color: vk::ClearColorValue { float32: clear },
                    })
                    .build()
            })
            .collect();

        let render_area = vk::Rect2D {
            offset: vk::Offset2D { x: 0, y: 0 },
            extent: vk::Extent2D {
                width: desc.width,
                height: desc.height,
            },
        };
        let mut rendering_info = vk::RenderingInfo::builder()
            .render_area(render_area)
            .layer_count(1)
            .color_attachments(&color_attachments);
        let depth_attachment;
        if let Some(handle) = desc.depth_attachment {
            depth_attachment = vk::RenderingAttachmentInfo::builder()
                .image_view(self.images.get(handle).view)
                .image_layout(vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL)
                .load_op(if desc.clear_depth.is_some() {
                    vk::AttachmentLoadOp::CLEAR
                } else {
                    vk::AttachmentLoadOp::LOAD
                })
                .store_op(vk::AttachmentStoreOp::STORE)
                .clear_value(vk::ClearValue {
                    depth_stencil: vk::ClearDepthStencilValue {
                        depth: desc.clear_depth.unwrap_or(1.0),
                        stencil: 0,
                    },
                })
                .build();
            rendering_info = rendering_info.depth_attachment(&depth_attachment);
        }

        unsafe {
            self.device
                .dynamic_rendering
                .cmd_begin_rendering(cb, &rendering_info);
            self.device
                .device
                .cmd_bind_pipeline(cb, pipeline.bind_point, pipeline.pipeline);
            self.device.device.cmd_bind_descriptor_sets(
                cb,
                pipeline.bind_point,
                pipeline.layout,
                0,
                &[self.bindless.set],
                &[],
            );
            let viewport = vk::Viewport {
                x: 0.0,
                y: 0.0,
                width: desc.width as f32,
                height: desc.height as f32,
                min_depth: 0.0,
                max_depth: 1.0,
            };
            self.device.device.cmd_set_viewport(cb, 0, &[viewport]);
            self.device.device.cmd_set_scissor(cb, 0, &[render_area]);
        }

        self.in_pass = true;
        self.bound_pipeline = Some(desc.pipeline);
    }

    pub fn cmd_end_pass(&mut self) {
        assert!(self.in_pass, "no pass is open");
        let cb = self.frames.command_buffer();
        unsafe { self.device.dynamic_rendering.cmd_end_rendering(cb) };
        self.in_pass = false;
        self.bound_pipeline = None;
    }

    pub fn cmd_bind_index_buffer(&self, buffer: Handle<Buffer>, offset: u64, kind: IndexKind) {
        let cb = self.frames.command_buffer();
        let entry = self.buffers.get(buffer);
        unsafe {
            self.device
                .device
                .cmd_bind_index_buffer(cb, entry.buffer, offset, index_type(kind));
        }
    }

    /// Push `bytes` into the bound pipeline's push-constant range. Panics
    /// when no pipeline is bound, the pipeline declares no range, or the
    /// data does not fit it.
    pub fn cmd_push_constants(&self, bytes: &[u8]) {
        let cb = self.frames.command_buffer();
        let handle = self
            .bound_pipeline
            .unwrap_or_else(|| panic!("no pipeline is bound"));
        let pipeline = self.pipelines.get(handle);
        let Some(range) = pipeline.push_range else {
            panic!("bound pipeline declares no push constants");
        };
        assert!(
            bytes.len() as u32 <= range.size,
            "push data is {} bytes, the pipeline range holds {}",
            bytes.len(),
            range.size
        );
        unsafe {
            self.device.device.cmd_push_constants(
                cb,
                pipeline.layout,
                pipeline.push_stages,
                range.offset,
                bytes,
            );
        }
    }

    pub fn cmd_draw(
        &self,
        vertex_count: u32,
        instance_count: u32,
        first_vertex: u32,
        first_instance: u32,
    ) {
        let cb = self.frames.command_buffer();
        unsafe {
            self.device.device.cmd_draw(
                cb,
                vertex_count,
                instance_count,
                first_vertex,
                first_instance,
            );
        }
    }

    pub fn cmd_draw_indexed(
        &self,
        index_count: u32,
        instance_count: u32,
        first_index: u32,
        vertex_offset: i32,
        first_instance: u32,
    ) {
        let cb = self.frames.command_buffer();
        unsafe {
            self.device.device.cmd_draw_indexed(
                cb,
                index_count,
                instance_count,
                first_index,
                vertex_offset,
                first_instance,
            );
        }
    }

    pub fn cmd_draw_indexed_indirect(
        &self,
        buffer: Handle<Buffer>,
        offset: u64,
        draw_count: u32,
        stride: u32,
    ) {
        let cb = self.frames.command_buffer();
        let entry = self.buffers.get(buffer);
        unsafe {
            self.device
                .device
                .cmd_draw_indexed_indirect(cb, entry.buffer, offset, draw_count, stride);
        }
    }

    /// Transfer-clear the acquired backbuffer. Works without any pipeline
    /// or pass; the image ends up back in color-attachment state.
    pub fn cmd_clear_backbuffer(&self, color: [f32; 4]) {
        assert!(!self.in_pass, "cannot clear the backbuffer inside a pass");
        let cb = self.frames.command_buffer();
        let handle = self.swapchain.backbuffer(self.frames.current_image_index());
        let target = self.images.get(handle);
        let aspect = aspect_for_format(target.format);

        let to_transfer = image_barrier(
            target.image,
            aspect,
            ResourceAccess::COLOR_ATTACHMENT,
            ResourceAccess::TRANSFER_WRITE,
        );
        let to_attachment = image_barrier(
            target.image,
            aspect,
            ResourceAccess::TRANSFER_WRITE,
            ResourceAccess::COLOR_ATTACHMENT,
        );
        let range = vk::ImageSubresourceRange {
            aspect_mask: aspect,
            base_mip_level: 0,
            level_count: vk::REMAINING_MIP_LEVELS,
            base_array_layer: 0,
            layer_count: vk::REMAINING_ARRAY_LAYERS,
        };
        unsafe {
            self.device.device.cmd_pipeline_barrier(
                cb,
                stage_mask(ResourceAccess::COLOR_ATTACHMENT),
                stage_mask(ResourceAccess::TRANSFER_WRITE),
                vk::DependencyFlags::empty(),
                &[],
                &[],
                &[to_transfer],
            );
            self.device.device.cmd_clear_color_image(
                cb,
                target.image,
                vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                &vk::ClearColorValue { float32: color },
                &[range],
            );
            self.device.device.cmd_pipeline_barrier(
                cb,
                stage_mask(ResourceAccess::TRANSFER_WRITE),
                stage_mask(ResourceAccess::COLOR_ATTACHMENT),
                vk::DependencyFlags::empty(),
                &[],
                &[],
                &[to_attachment],
            );
        }
    }
}

impl Drop for Gpu {
    fn drop(&mut self) {
        if let Err(err) = self.device.wait_idle() {
            log::error!("Wait-idle failed during teardown: {err}");
        }

        if !self.pipelines.is_empty() {
            log::debug!("Destroying {} leaked pipelines", self.pipelines.len());
        }
        for pipeline in self.pipelines.drain() {
            destroy_pipeline_resource(&self.device, &pipeline);
        }
        if !self.shaders.is_empty() {
            log::debug!("Destroying {} leaked shaders", self.shaders.len());
        }
        for shader in self.shaders.drain() {
            destroy_shader_resource(&self.device, &shader);
        }

        self.bindless.destroy(&self.device);
        self.frames.destroy(&self.device);
        self.immediate.destroy(&self.device);
        self.swapchain.destroy(&self.device, &mut self.images);

        if !self.images.is_empty() {
            log::debug!("Destroying {} leaked images", self.images.len());
        }
        for image in self.images.drain() {
            destroy_image_resource(&self.device, &image);
        }
        if !self.buffers.is_empty() {
            log::debug!("Destroying {} leaked buffers", self.buffers.len());
        }
        for buffer in self.buffers.drain() {
            destroy_buffer_resource(&self.device, &buffer);
        }

        log::info!("GPU context destroyed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_depth_is_clamped_to_the_slot_count() {
        let mut config = GpuConfig::default();
        config.frames_in_flight = 0;
        assert_eq!(config.clamped_frames_in_flight(), 1);
        config.frames_in_flight = 2;
        assert_eq!(config.clamped_frames_in_flight(), 2);
        config.frames_in_flight = 64;
        assert_eq!(config.clamped_frames_in_flight(), FRAMES_IN_FLIGHT);
    }

    #[test]
    fn index_kinds_map_to_native_types() {
        assert_eq!(index_type(IndexKind::U16), vk::IndexType::UINT16);
        assert_eq!(index_type(IndexKind::U32), vk::IndexType::UINT32);
    }
}
