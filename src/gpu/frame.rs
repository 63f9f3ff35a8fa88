// Frame pipelining
//
// Up to FRAMES_IN_FLIGHT frames are recorded ahead of the device. One
// timeline semaphore orders everything: the submit for frame F signals
// value F, and frame F waits for value F - FRAMES_IN_FLIGHT before it
// reuses that frame's slot. Binary semaphores only cross the presentation
// boundary (acquire and present); all CPU throttling goes through the
// timeline.

use ash::vk;

use super::barrier::{image_barrier, stage_mask, ResourceAccess};
use super::buffer::{
    create_buffer_resource, destroy_buffer_resource, Buffer, BufferDesc, BufferUsage, MemoryUsage,
};
use super::device::DeviceContext;
use super::error::{GpuError, Result, SwapchainStatus, VkCall};
use super::handle::{Handle, Pool};
use super::image::{aspect_for_format, Image};
use super::swapchain::{AcquireOutcome, Swapchain};

pub const FRAMES_IN_FLIGHT: usize = 3;

/// Per-slot staging budget for `copy_to_buffer` during a frame.
pub const FRAME_STAGING_SIZE: u64 = 8 * 1024 * 1024;

/// One frame's identity in the schedule.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameTicket {
    /// 1-based frame number; also the timeline value the submit signals.
    pub number: u64,
    /// Timeline value that must complete before this frame's slot is safe
    /// to reuse. Zero means no wait.
    pub wait_value: u64,
    /// Which in-flight slot this frame records into.
    pub slot: usize,
}

/// Pure bookkeeping for the frame counter and the single-recording rule.
pub struct FrameSchedule {
    frames_in_flight: u64,
    counter: u64,
    recording: bool,
}

impl FrameSchedule {
    pub fn new(frames_in_flight: usize) -> Self {
        assert!(frames_in_flight > 0, "need at least one frame in flight");
        Self {
            frames_in_flight: frames_in_flight as u64,
            counter: 0,
            recording: false,
        }
    }

    /// Hand out the next frame's ticket. Panics if a frame is already being
    /// recorded; recording is strictly one frame at a time.
    pub fn begin(&mut self) -> FrameTicket {
        assert!(
            !self.recording,
            "frame {} is still being recorded",
            self.counter + 1
        );
        self.recording = true;
        let number = self.counter + 1;
        FrameTicket {
            number,
            wait_value: number.saturating_sub(self.frames_in_flight),
            slot: ((number - 1) % self.frames_in_flight) as usize,
        }
    }

    /// The frame was submitted; advance the counter by exactly one.
    pub fn end(&mut self) {
        assert!(self.recording, "no frame is being recorded");
        self.recording = false;
        self.counter += 1;
    }

    /// Abandon the ticket without advancing. The next `begin` re-issues the
    /// same frame number.
    pub fn cancel(&mut self) {
        assert!(self.recording, "no frame is being recorded");
        self.recording = false;
    }

    /// Number of frames submitted so far.
    pub fn completed(&self) -> u64 {
        self.counter
    }
}

/// Bump allocator over one slot's staging region. Reset every time the
/// slot comes around again.
pub struct StagingCursor {
    offset: u64,
    capacity: u64,
}

impl StagingCursor {
    pub fn new(capacity: u64) -> Self {
        Self {
            offset: 0,
            capacity,
        }
    }

    pub fn reset(&mut self) {
        self.offset = 0;
    }

    /// Offset of a fresh `size`-byte region, or None when the slot's budget
    /// is spent.
    pub fn allocate(&mut self, size: u64, align: u64) -> Option<u64> {
        debug_assert!(align.is_power_of_two());
        let aligned = (self.offset + align - 1) & !(align - 1);
        if aligned + size > self.capacity {
            return None;
        }
        self.offset = aligned + size;
        Some(aligned)
    }

    pub fn used(&self) -> u64 {
        self.offset
    }
}

struct FrameSlot {
    command_pool: vk::CommandPool,
    command_buffer: vk::CommandBuffer,
    acquire_semaphore: vk::Semaphore,
    submit_semaphore: vk::Semaphore,
    staging: StagingCursor,
}

struct CurrentFrame {
    ticket: FrameTicket,
    image_index: u32,
}

/// What `begin_frame` produced.
pub enum FrameStatus {
    Ready(Frame),
    /// The surface changed under us; no frame was started.
    NeedsRecreate,
}

/// A frame being recorded.
#[derive(Debug, Clone, Copy)]
pub struct Frame {
    pub number: u64,
    pub backbuffer: Handle<Image>,
}

pub struct FramePipeline {
    slots: Vec<FrameSlot>,
    timeline: vk::Semaphore,
    schedule: FrameSchedule,
    staging_buffer: Buffer,
    current: Option<CurrentFrame>,
}

impl FramePipeline {
    /// `frames_in_flight` must already be clamped to 1..=FRAMES_IN_FLIGHT.
    pub fn new(device: &DeviceContext, frames_in_flight: usize) -> Result<Self> {
        assert!(
            (1..=FRAMES_IN_FLIGHT).contains(&frames_in_flight),
            "frames_in_flight {} outside 1..={}",
            frames_in_flight,
            FRAMES_IN_FLIGHT
        );
        let staging_buffer = create_buffer_resource(
            device,
            &BufferDesc {
                size: FRAME_STAGING_SIZE * frames_in_flight as u64,
                usage: BufferUsage::TRANSFER_SRC,
                memory: MemoryUsage::CpuToGpu,
                name: "frame staging ring",
            },
        )?;

        let mut timeline_info = vk::SemaphoreTypeCreateInfo::builder()
            .semaphore_type(vk::SemaphoreType::TIMELINE)
            .initial_value(0);
        let semaphore_info = vk::SemaphoreCreateInfo::builder().push_next(&mut timeline_info);
        let timeline = unsafe { device.device.create_semaphore(&semaphore_info, None) }
            .vk_call("vkCreateSemaphore")?;

        let mut slots = Vec::with_capacity(frames_in_flight);
        for _ in 0..frames_in_flight {
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

            let binary_info = vk::SemaphoreCreateInfo::builder();
            let acquire_semaphore = unsafe { device.device.create_semaphore(&binary_info, None) }
                .vk_call("vkCreateSemaphore")?;
            let submit_semaphore = unsafe { device.device.create_semaphore(&binary_info, None) }
                .vk_call("vkCreateSemaphore")?;

            slots.push(FrameSlot {
                command_pool,
                command_buffer,
                acquire_semaphore,
                submit_semaphore,
                staging: StagingCursor::new(FRAME_STAGING_SIZE),
            });
        }

        log::info!(
            "Frame pipeline ready: {} frames in flight, {} KiB staging per frame",
            frames_in_flight,
            FRAME_STAGING_SIZE / 1024
        );

        Ok(Self {
            slots,
            timeline,
            schedule: FrameSchedule::new(frames_in_flight),
            staging_buffer,
            current: None,
        })
    }

    /// Throttle, acquire, and open the next frame's command buffer. When
    /// the surface is out of date no frame starts and the schedule stays
    /// where it was.
    pub fn begin_frame(
        &mut self,
        device: &DeviceContext,
        swapchain: &Swapchain,
        images: &Pool<Image>,
    ) -> Result<FrameStatus> {
        let ticket = self.schedule.begin();

        if ticket.wait_value > 0 {
            let semaphores = [self.timeline];
            let values = [ticket.wait_value];
            let wait_info = vk::SemaphoreWaitInfo::builder()
                .semaphores(&semaphores)
                .values(&values);
            if let Err(err) = unsafe { device.device.wait_semaphores(&wait_info, u64::MAX) }
                .vk_call("vkWaitSemaphores")
            {
                self.schedule.cancel();
                return Err(err);
            }
        }

        let slot = &mut self.slots[ticket.slot];
        slot.staging.reset();
        if let Err(err) = unsafe {
            device
                .device
                .reset_command_pool(slot.command_pool, vk::CommandPoolResetFlags::empty())
        }
        .vk_call("vkResetCommandPool")
        {
            self.schedule.cancel();
            return Err(err);
        }

        let image_index = match swapchain.acquire(slot.acquire_semaphore) {
            Ok(AcquireOutcome::Ready { image_index }) => image_index,
            Ok(AcquireOutcome::NeedsRecreate) => {
                self.schedule.cancel();
                return Ok(FrameStatus::NeedsRecreate);
            }
            Err(err) => {
                self.schedule.cancel();
                return Err(err);
            }
        };

        let begin_info = vk::CommandBufferBeginInfo::builder()
            .flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT);
        unsafe { device.device.begin_command_buffer(slot.command_buffer, &begin_info) }
            .vk_call("vkBeginCommandBuffer")?;

        // Backbuffer contents are discarded; transition from UNDEFINED.
        let backbuffer = swapchain.backbuffer(image_index);
        let target = images.get(backbuffer);
        let to_attachment = image_barrier(
            target.image,
            aspect_for_format(target.format),
            ResourceAccess::empty(),
            ResourceAccess::COLOR_ATTACHMENT,
        );
        unsafe {
            device.device.cmd_pipeline_barrier(
                slot.command_buffer,
                stage_mask(ResourceAccess::empty()),
                stage_mask(ResourceAccess::COLOR_ATTACHMENT),
                vk::DependencyFlags::empty(),
                &[],
                &[],
                &[to_attachment],
            );
        }

        self.current = Some(CurrentFrame {
            ticket,
            image_index,
        });
        Ok(FrameStatus::Ready(Frame {
            number: ticket.number,
            backbuffer,
        }))
    }

    /// Close the frame, submit it, and present. The frame counts as
    /// submitted even when present asks for a recreate.
    pub fn end_frame(
        &mut self,
        device: &DeviceContext,
        swapchain: &Swapchain,
        images: &Pool<Image>,
    ) -> Result<SwapchainStatus> {
        let Some(current) = self.current.take() else {
            panic!("no frame is being recorded");
        };
        let slot = &self.slots[current.ticket.slot];

        let target = images.get(swapchain.backbuffer(current.image_index));
        let to_present = image_barrier(
            target.image,
            aspect_for_format(target.format),
            ResourceAccess::COLOR_ATTACHMENT,
            ResourceAccess::PRESENT,
        );
        unsafe {
            device.device.cmd_pipeline_barrier(
                slot.command_buffer,
                stage_mask(ResourceAccess::COLOR_ATTACHMENT),
                stage_mask(ResourceAccess::PRESENT),
                vk::DependencyFlags::empty(),
                &[],
                &[],
                &[to_present],
            );
            device
                .device
                .end_command_buffer(slot.command_buffer)
                .vk_call("vkEndCommandBuffer")?;
        }

        let wait_semaphores = [slot.acquire_semaphore];
        let wait_stages = [vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT];
        let wait_values = [0];
        let command_buffers = [slot.command_buffer];
        let signal_semaphores = [slot.submit_semaphore, self.timeline];
        let signal_values = [0, current.ticket.number];
        let mut timeline_submit = vk::TimelineSemaphoreSubmitInfo::builder()
            .wait_semaphore_values(&wait_values)
            .signal_semaphore_values(&signal_values);
        let submit_info = vk::SubmitInfo::builder()
            .wait_semaphores(&wait_semaphores)
            .wait_dst_stage_mask(&wait_stages)
            .command_buffers(&command_buffers)
            .signal_semaphores(&signal_semaphores)
            .push_next(&mut timeline_submit);
        unsafe {
            device
                .device
                .queue_submit(device.queue, &[submit_info.build()], vk::Fence::null())
        }
        .vk_call("vkQueueSubmit")?;
        self.schedule.end();

        swapchain.present(device.queue, current.image_index, &[slot.submit_semaphore])
    }

    /// Command buffer of the frame being recorded. Panics outside
    /// begin/end.
    pub fn command_buffer(&self) -> vk::CommandBuffer {
        let current = self
            .current
            .as_ref()
            .unwrap_or_else(|| panic!("no frame is being recorded"));
        self.slots[current.ticket.slot].command_buffer
    }

    pub fn is_recording(&self) -> bool {
        self.current.is_some()
    }

    /// Swapchain image index of the frame being recorded. Panics outside
    /// begin/end.
    pub fn current_image_index(&self) -> u32 {
        let current = self
            .current
            .as_ref()
            .unwrap_or_else(|| panic!("no frame is being recorded"));
        current.image_index
    }

    pub fn frame_count(&self) -> u64 {
        self.schedule.completed()
    }

    /// Stage `bytes` in the frame's staging region and record a copy into
    /// `dst`. The copy executes before any draw of this frame only if the
    /// caller orders it with a barrier.
    pub fn copy_to_buffer(
        &mut self,
        device: &DeviceContext,
        dst: &Buffer,
        dst_offset: u64,
        bytes: &[u8],
    ) -> Result<()> {
        let current = self
            .current
            .as_ref()
            .unwrap_or_else(|| panic!("no frame is being recorded"));
        let slot = &mut self.slots[current.ticket.slot];

        let size = bytes.len() as u64;
        let Some(relative) = slot.staging.allocate(size, 4) else {
            return Err(GpuError::MissingCapability(format!(
                "frame staging exhausted: {} bytes requested, {} of {} used",
                size,
                slot.staging.used(),
                FRAME_STAGING_SIZE
            )));
        };
        let staging_offset = current.ticket.slot as u64 * FRAME_STAGING_SIZE + relative;

        unsafe {
            std::ptr::copy_nonoverlapping(
                bytes.as_ptr(),
                self.staging_buffer.mapped.add(staging_offset as usize),
                bytes.len(),
            );
            let region = vk::BufferCopy {
                src_offset: staging_offset,
                dst_offset,
                size,
            };
            device.device.cmd_copy_buffer(
                slot.command_buffer,
                self.staging_buffer.buffer,
                dst.buffer,
                &[region],
            );
        }
        Ok(())
    }

    pub fn destroy(&mut self, device: &DeviceContext) {
        unsafe {
            for slot in &self.slots {
                device.device.destroy_semaphore(slot.acquire_semaphore, None);
                device.device.destroy_semaphore(slot.submit_semaphore, None);
                device.device.destroy_command_pool(slot.command_pool, None);
            }
            device.device.destroy_semaphore(self.timeline, None);
        }
        self.slots.clear();
        destroy_buffer_resource(device, &self.staging_buffer);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_numbers_advance_by_one() {
        let mut schedule = FrameSchedule::new(3);
        for expected in 1..=10 {
            let ticket = schedule.begin();
            assert_eq!(ticket.number, expected);
            schedule.end();
            assert_eq!(schedule.completed(), expected);
        }
    }

    #[test]
    fn early_frames_do_not_wait() {
        let mut schedule = FrameSchedule::new(3);
        for _ in 0..3 {
            assert_eq!(schedule.begin().wait_value, 0);
            schedule.end();
        }
        assert_eq!(schedule.begin().wait_value, 1);
    }

    #[test]
    fn wait_value_trails_by_frames_in_flight() {
        let mut schedule = FrameSchedule::new(3);
        for _ in 0..20 {
            schedule.begin();
            schedule.end();
        }
        let ticket = schedule.begin();
        assert_eq!(ticket.number, 21);
        assert_eq!(ticket.wait_value, 18);
    }

    #[test]
    fn slots_cycle_in_order() {
        let mut schedule = FrameSchedule::new(3);
        let mut seen = Vec::new();
        for _ in 0..7 {
            seen.push(schedule.begin().slot);
            schedule.end();
        }
        assert_eq!(seen, vec![0, 1, 2, 0, 1, 2, 0]);
    }

    #[test]
    #[should_panic(expected = "still being recorded")]
    fn begin_twice_panics() {
        let mut schedule = FrameSchedule::new(3);
        schedule.begin();
        schedule.begin();
    }

    #[test]
    #[should_panic(expected = "no frame is being recorded")]
    fn end_without_begin_panics() {
        let mut schedule = FrameSchedule::new(3);
        schedule.end();
    }

    #[test]
    fn cancel_reissues_the_same_frame() {
        let mut schedule = FrameSchedule::new(3);
        let first = schedule.begin();
        schedule.cancel();
        let retry = schedule.begin();
        assert_eq!(first, retry);
        schedule.end();
        assert_eq!(schedule.completed(), 1);
    }

    #[test]
    fn staging_bumps_and_aligns() {
        let mut cursor = StagingCursor::new(256);
        assert_eq!(cursor.allocate(10, 4), Some(0));
        // 10 rounds up to 12 for 4-byte alignment.
        assert_eq!(cursor.allocate(4, 4), Some(12));
        assert_eq!(cursor.allocate(1, 64), Some(64));
        assert_eq!(cursor.used(), 65);
    }

    #[test]
    fn staging_exhaustion_returns_none() {
        let mut cursor = StagingCursor::new(64);
        assert_eq!(cursor.allocate(64, 4), Some(0));
        assert_eq!(cursor.allocate(1, 4), None);
        // Exhaustion does not corrupt the cursor.
        assert_eq!(cursor.used(), 64);
    }

    #[test]
    fn staging_reset_starts_over() {
        let mut cursor = StagingCursor::new(128);
        cursor.allocate(100, 4).unwrap();
        cursor.reset();
        assert_eq!(cursor.allocate(100, 4), Some(0));
    }
}
