// Abstract barrier vocabulary
//
// Callers describe resource transitions with `ResourceAccess` bitflags; the
// translation to native stage/access/layout triples lives here and nowhere
// else. The three translation functions are total over the flag set.

use ash::vk;
use bitflags::bitflags;

bitflags! {
    /// How a resource is used on one side of a barrier.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct ResourceAccess: u32 {
        const INDIRECT_ARGS        = 1 << 0;
        const INDEX_READ           = 1 << 1;
        const VERTEX_SHADER_READ   = 1 << 2;
        const FRAGMENT_SHADER_READ = 1 << 3;
        const SHADER_WRITE         = 1 << 4;
        const COLOR_ATTACHMENT     = 1 << 5;
        const DEPTH_ATTACHMENT     = 1 << 6;
        const TRANSFER_READ        = 1 << 7;
        const TRANSFER_WRITE       = 1 << 8;
        const HOST_WRITE           = 1 << 9;
        const PRESENT              = 1 << 10;
    }
}

pub fn stage_mask(access: ResourceAccess) -> vk::PipelineStageFlags {
    if access.is_empty() {
        // No prior work to wait on.
        return vk::PipelineStageFlags::TOP_OF_PIPE;
    }
    let mut stages = vk::PipelineStageFlags::empty();
    if access.contains(ResourceAccess::INDIRECT_ARGS) {
        stages |= vk::PipelineStageFlags::DRAW_INDIRECT;
    }
    if access.contains(ResourceAccess::INDEX_READ) {
        stages |= vk::PipelineStageFlags::VERTEX_INPUT;
    }
    if access.contains(ResourceAccess::VERTEX_SHADER_READ) {
        stages |= vk::PipelineStageFlags::VERTEX_SHADER;
    }
    if access.contains(ResourceAccess::FRAGMENT_SHADER_READ) {
        stages |= vk::PipelineStageFlags::FRAGMENT_SHADER;
    }
    if access.contains(ResourceAccess::SHADER_WRITE) {
        stages |= vk::PipelineStageFlags::VERTEX_SHADER | vk::PipelineStageFlags::FRAGMENT_SHADER;
    }
    if access.contains(ResourceAccess::COLOR_ATTACHMENT) {
        stages |= vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT;
    }
    if access.contains(ResourceAccess::DEPTH_ATTACHMENT) {
        stages |= vk::PipelineStageFlags::EARLY_FRAGMENT_TESTS
            | vk::PipelineStageFlags::LATE_FRAGMENT_TESTS;
    }
    if access.intersects(ResourceAccess::TRANSFER_READ | ResourceAccess::TRANSFER_WRITE) {
        stages |= vk::PipelineStageFlags::TRANSFER;
    }
    if access.contains(ResourceAccess::HOST_WRITE) {
        stages |= vk::PipelineStageFlags::HOST;
    }
    if access.contains(ResourceAccess::PRESENT) {
        stages |= vk::PipelineStageFlags::BOTTOM_OF_PIPE;
    }
    stages
}

pub fn access_mask(access: ResourceAccess) -> vk::AccessFlags {
    let mut flags = vk::AccessFlags::empty();
    if access.contains(ResourceAccess::INDIRECT_ARGS) {
        flags |= vk::AccessFlags::INDIRECT_COMMAND_READ;
    }
    if access.contains(ResourceAccess::INDEX_READ) {
        flags |= vk::AccessFlags::INDEX_READ;
    }
    if access.intersects(ResourceAccess::VERTEX_SHADER_READ | ResourceAccess::FRAGMENT_SHADER_READ)
    {
        flags |= vk::AccessFlags::SHADER_READ;
    }
    if access.contains(ResourceAccess::SHADER_WRITE) {
        flags |= vk::AccessFlags::SHADER_WRITE;
    }
    if access.contains(ResourceAccess::COLOR_ATTACHMENT) {
        flags |= vk::AccessFlags::COLOR_ATTACHMENT_WRITE;
    }
    if access.contains(ResourceAccess::DEPTH_ATTACHMENT) {
        flags |= vk::AccessFlags::DEPTH_STENCIL_ATTACHMENT_READ
            | vk::AccessFlags::DEPTH_STENCIL_ATTACHMENT_WRITE;
    }
    if access.contains(ResourceAccess::TRANSFER_READ) {
        flags |= vk::AccessFlags::TRANSFER_READ;
    }
    if access.contains(ResourceAccess::TRANSFER_WRITE) {
        flags |= vk::AccessFlags::TRANSFER_WRITE;
    }
    if access.contains(ResourceAccess::HOST_WRITE) {
        flags |= vk::AccessFlags::HOST_WRITE;
    }
    // PRESENT carries no access; the presentation engine synchronizes itself.
    flags
}

/// The image layout implied by an access set. Attachment and transfer uses
/// dominate shader reads when combined.
pub fn image_layout(access: ResourceAccess) -> vk::ImageLayout {
    if access.is_empty() {
        return vk::ImageLayout::UNDEFINED;
    }
    if access.contains(ResourceAccess::PRESENT) {
        return vk::ImageLayout::PRESENT_SRC_KHR;
    }
    if access.contains(ResourceAccess::COLOR_ATTACHMENT) {
        return vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL;
    }
    if access.contains(ResourceAccess::DEPTH_ATTACHMENT) {
        return vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL;
    }
    if access.contains(ResourceAccess::TRANSFER_WRITE) {
        return vk::ImageLayout::TRANSFER_DST_OPTIMAL;
    }
    if access.contains(ResourceAccess::TRANSFER_READ) {
        return vk::ImageLayout::TRANSFER_SRC_OPTIMAL;
    }
    if access.contains(ResourceAccess::SHADER_WRITE) {
        return vk::ImageLayout::GENERAL;
    }
    if access.intersects(ResourceAccess::VERTEX_SHADER_READ | ResourceAccess::FRAGMENT_SHADER_READ)
    {
        return vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL;
    }
    vk::ImageLayout::GENERAL
}

/// Build a full-subresource image barrier between two abstract access states.
pub fn image_barrier(
    image: vk::Image,
    aspect: vk::ImageAspectFlags,
    src: ResourceAccess,
    dst: ResourceAccess,
) -> vk::ImageMemoryBarrier {
    vk::ImageMemoryBarrier::builder()
        .src_access_mask(access_mask(src))
        .dst_access_mask(access_mask(dst))
        .old_layout(image_layout(src))
        .new_layout(image_layout(dst))
        .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
        .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
        .image(image)
        .subresource_range(vk::ImageSubresourceRange {
            aspect_mask: aspect,
            base_mip_level: 0,
            level_count: vk::REMAINING_MIP_LEVELS,
            base_array_layer: 0,
            layer_count: vk::REMAINING_ARRAY_LAYERS,
        })
        .build()
}

pub fn buffer_barrier(
    buffer: vk::Buffer,
    src: ResourceAccess,
    dst: ResourceAccess,
) -> vk::BufferMemoryBarrier {
    vk::BufferMemoryBarrier::builder()
        .src_access_mask(access_mask(src))
        .dst_access_mask(access_mask(dst))
        .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
        .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
        .buffer(buffer)
        .offset(0)
        .size(vk::WHOLE_SIZE)
        .build()
}

#[cfg(test)]
mod tests {
    use super::*;

    const ALL: [ResourceAccess; 11] = [
        ResourceAccess::INDIRECT_ARGS,
        ResourceAccess::INDEX_READ,
        ResourceAccess::VERTEX_SHADER_READ,
        ResourceAccess::FRAGMENT_SHADER_READ,
        ResourceAccess::SHADER_WRITE,
        ResourceAccess::COLOR_ATTACHMENT,
        ResourceAccess::DEPTH_ATTACHMENT,
        ResourceAccess::TRANSFER_READ,
        ResourceAccess::TRANSFER_WRITE,
        ResourceAccess::HOST_WRITE,
        ResourceAccess::PRESENT,
    ];

    #[test]
    fn every_flag_has_a_stage() {
        for &access in &ALL {
            assert_ne!(
                stage_mask(access),
                vk::PipelineStageFlags::empty(),
                "{access:?} maps to no stage"
            );
        }
    }

    #[test]
    fn every_flag_has_a_layout() {
        for &access in &ALL {
            assert_ne!(
                image_layout(access),
                vk::ImageLayout::UNDEFINED,
                "{access:?} maps to UNDEFINED"
            );
        }
    }

    #[test]
    fn single_flag_translations() {
        assert_eq!(
            stage_mask(ResourceAccess::INDIRECT_ARGS),
            vk::PipelineStageFlags::DRAW_INDIRECT
        );
        assert_eq!(
            access_mask(ResourceAccess::INDEX_READ),
            vk::AccessFlags::INDEX_READ
        );
        assert_eq!(
            stage_mask(ResourceAccess::VERTEX_SHADER_READ),
            vk::PipelineStageFlags::VERTEX_SHADER
        );
        assert_eq!(
            access_mask(ResourceAccess::VERTEX_SHADER_READ),
            vk::AccessFlags::SHADER_READ
        );
        assert_eq!(
            image_layout(ResourceAccess::FRAGMENT_SHADER_READ),
            vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL
        );
        assert_eq!(
            stage_mask(ResourceAccess::COLOR_ATTACHMENT),
            vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT
        );
        assert_eq!(
            access_mask(ResourceAccess::COLOR_ATTACHMENT),
            vk::AccessFlags::COLOR_ATTACHMENT_WRITE
        );
        assert_eq!(
            image_layout(ResourceAccess::COLOR_ATTACHMENT),
            vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL
        );
        assert_eq!(
            image_layout(ResourceAccess::DEPTH_ATTACHMENT),
            vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL
        );
        assert_eq!(
            stage_mask(ResourceAccess::TRANSFER_WRITE),
            vk::PipelineStageFlags::TRANSFER
        );
        assert_eq!(
            image_layout(ResourceAccess::TRANSFER_WRITE),
            vk::ImageLayout::TRANSFER_DST_OPTIMAL
        );
        assert_eq!(
            image_layout(ResourceAccess::TRANSFER_READ),
            vk::ImageLayout::TRANSFER_SRC_OPTIMAL
        );
        assert_eq!(
            access_mask(ResourceAccess::HOST_WRITE),
            vk::AccessFlags::HOST_WRITE
        );
    }

    #[test]
    fn present_has_layout_but_no_access() {
        assert_eq!(
            image_layout(ResourceAccess::PRESENT),
            vk::ImageLayout::PRESENT_SRC_KHR
        );
        assert_eq!(access_mask(ResourceAccess::PRESENT), vk::AccessFlags::empty());
        assert_eq!(
            stage_mask(ResourceAccess::PRESENT),
            vk::PipelineStageFlags::BOTTOM_OF_PIPE
        );
    }

    #[test]
    fn empty_access_is_top_of_pipe_undefined() {
        assert_eq!(
            stage_mask(ResourceAccess::empty()),
            vk::PipelineStageFlags::TOP_OF_PIPE
        );
        assert_eq!(access_mask(ResourceAccess::empty()), vk::AccessFlags::empty());
        assert_eq!(
            image_layout(ResourceAccess::empty()),
            vk::ImageLayout::UNDEFINED
        );
    }

    #[test]
    fn attachment_dominates_shader_read_layout() {
        let combined = ResourceAccess::COLOR_ATTACHMENT | ResourceAccess::FRAGMENT_SHADER_READ;
        assert_eq!(
            image_layout(combined),
            vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL
        );
    }

    #[test]
    fn combined_flags_union_stages_and_accesses() {
        let combined = ResourceAccess::TRANSFER_WRITE | ResourceAccess::HOST_WRITE;
        assert_eq!(
            stage_mask(combined),
            vk::PipelineStageFlags::TRANSFER | vk::PipelineStageFlags::HOST
        );
        assert_eq!(
            access_mask(combined),
            vk::AccessFlags::TRANSFER_WRITE | vk::AccessFlags::HOST_WRITE
        );
    }

    #[test]
    fn present_transition_matches_clear_loop_shape() {
        // The present -> color-attachment transition recorded at frame begin.
        let b = image_barrier(
            vk::Image::null(),
            vk::ImageAspectFlags::COLOR,
            ResourceAccess::empty(),
            ResourceAccess::COLOR_ATTACHMENT,
        );
        assert_eq!(b.old_layout, vk::ImageLayout::UNDEFINED);
        assert_eq!(b.new_layout, vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL);
        assert_eq!(b.dst_access_mask, vk::AccessFlags::COLOR_ATTACHMENT_WRITE);
    }
}
