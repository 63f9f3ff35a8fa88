// Graphics pipeline construction
//
// Pipelines render through dynamic rendering; there are no render-pass or
// framebuffer objects. Vertex input is always empty: geometry is pulled
// from storage buffers by device address. Viewport and scissor are dynamic
// state set at pass begin.

use ash::vk;

use super::device::DeviceContext;
use super::error::{GpuError, Result, VkCall};
use super::handle::Handle;
use super::shader::{PushRange, Shader};

#[derive(Debug, Clone)]
pub struct PipelineDesc<'a> {
    pub shaders: &'a [Handle<Shader>],
    pub color_formats: &'a [vk::Format],
    pub depth_format: Option<vk::Format>,
    pub depth_test: bool,
    pub depth_write: bool,
    pub cull_backfaces: bool,
    pub blend_alpha: bool,
    /// Debug name; attached to the native object when naming is enabled.
    pub name: &'a str,
}

/// Pool entry for one pipeline.
pub struct Pipeline {
    pub pipeline: vk::Pipeline,
    pub layout: vk::PipelineLayout,
    pub bind_point: vk::PipelineBindPoint,
    pub push_range: Option<PushRange>,
    pub push_stages: vk::ShaderStageFlags,
}

/// Merge the push-constant ranges of all stages. Stages that declare a
/// range must agree exactly on offset and size; their stage flags are OR-ed
/// into one native range. Disagreement is a contract violation.
pub fn merge_push_ranges(
    stages: &[(vk::ShaderStageFlags, Option<PushRange>)],
) -> Option<(PushRange, vk::ShaderStageFlags)> {
    let mut merged: Option<(PushRange, vk::ShaderStageFlags)> = None;
    for (stage, range) in stages {
        let Some(range) = range else { continue };
        match &mut merged {
            None => merged = Some((*range, *stage)),
            Some((existing, stage_flags)) => {
                assert_eq!(
                    existing, range,
                    "push-constant ranges must agree across shader stages"
                );
                *stage_flags |= *stage;
            }
        }
    }
    merged
}

pub fn create_pipeline_resource(
    device: &DeviceContext,
    bindless_layout: vk::DescriptorSetLayout,
    shaders: &[&Shader],
    desc: &PipelineDesc,
) -> Result<Pipeline> {
    assert!(!shaders.is_empty(), "pipeline needs at least one shader");

    let reflected: Vec<_> = shaders.iter().map(|s| (s.stage, s.push_range)).collect();
    let merged = merge_push_ranges(&reflected);

    let set_layouts = [bindless_layout];
    let mut layout_info = vk::PipelineLayoutCreateInfo::builder().set_layouts(&set_layouts);
    let push_ranges;
    if let Some((range, stage_flags)) = merged {
        push_ranges = [vk::PushConstantRange {
            stage_flags,
            offset: range.offset,
            size: range.size,
        }];
        layout_info = layout_info.push_constant_ranges(&push_ranges);
    }
    let layout = unsafe { device.device.create_pipeline_layout(&layout_info, None) }
        .vk_call("vkCreatePipelineLayout")?;

    let stages: Vec<_> = shaders
        .iter()
        .map(|shader| {
            vk::PipelineShaderStageCreateInfo::builder()
                .stage(shader.stage)
                .module(shader.module)
                .name(c"main")
                .build()
        })
        .collect();

    // Vertex pulling: no bindings, no attributes.
    let vertex_input = vk::PipelineVertexInputStateCreateInfo::builder();

    let input_assembly = vk::PipelineInputAssemblyStateCreateInfo::builder()
        .topology(vk::PrimitiveTopology::TRIANGLE_LIST)
        .primitive_restart_enable(false);

    let viewport_state = vk::PipelineViewportStateCreateInfo::builder()
        .viewport_count(1)
        .scissor_count(1);

    let rasterizer = vk::PipelineRasterizationStateCreateInfo::builder()
        .depth_clamp_enable(false)
        .rasterizer_discard_enable(false)
        .polygon_mode(vk::PolygonMode::FILL)
        .line_width(1.0)
        .cull_mode(if desc.cull_backfaces {
            vk::CullModeFlags::BACK
        } else {
            vk::CullModeFlags::NONE
        })
        .front_face(vk::FrontFace::COUNTER_CLOCKWISE)
        .depth_bias_enable(false);

    let multisampling = vk::PipelineMultisampleStateCreateInfo::builder()
        .sample_shading_enable(false)
        .rasterization_samples(vk::SampleCountFlags::TYPE_1);

    let has_depth = desc.depth_format.is_some();
    let depth_stencil = vk::PipelineDepthStencilStateCreateInfo::builder()
        .depth_test_enable(has_depth && desc.depth_test)
        .depth_write_enable(has_depth && desc.depth_write)
        .depth_compare_op(vk::CompareOp::LESS)
        .depth_bounds_test_enable(false)
        .stencil_test_enable(false);

    let blend_attachments: Vec<_> = desc
        .color_formats
        .iter()
        .map(|_| {
            let mut attachment = vk::PipelineColorBlendAttachmentState::builder()
                .color_write_mask(vk::ColorComponentFlags::RGBA)
                .blend_enable(desc.blend_alpha);
            if desc.blend_alpha {
                attachment = attachment
                    .src_color_blend_factor(vk::BlendFactor::SRC_ALPHA)
                    .dst_color_blend_factor(vk::BlendFactor::ONE_MINUS_SRC_ALPHA)
                    .color_blend_op(vk::BlendOp::ADD)
                    .src_alpha_blend_factor(vk::BlendFactor::ONE)
                    .dst_alpha_blend_factor(vk::BlendFactor::ONE_MINUS_SRC_ALPHA)
                    .alpha_blend_op(vk::BlendOp::ADD);
            }
            attachment.build()
        })
        .collect();
    let color_blending = vk::PipelineColorBlendStateCreateInfo::builder()
        .logic_op_enable(false)
        .attachments(&blend_attachments);

    let dynamic_states = [vk::DynamicState::VIEWPORT, vk::DynamicState::SCISSOR];
    let dynamic_state =
        vk::PipelineDynamicStateCreateInfo::builder().dynamic_states(&dynamic_states);

    let mut rendering_info = vk::PipelineRenderingCreateInfo::builder()
        .color_attachment_formats(desc.color_formats)
        .depth_attachment_format(desc.depth_format.unwrap_or(vk::Format::UNDEFINED));

    let pipeline_info = vk::GraphicsPipelineCreateInfo::builder()
        .stages(&stages)
        .vertex_input_state(&vertex_input)
        .input_assembly_state(&input_assembly)
        .viewport_state(&viewport_state)
        .rasterization_state(&rasterizer)
        .multisample_state(&multisampling)
        .depth_stencil_state(&depth_stencil)
        .color_blend_state(&color_blending)
        .dynamic_state(&dynamic_state)
        .layout(layout)
        .push_next(&mut rendering_info)
        .build();

    let pipelines = unsafe {
        device.device.create_graphics_pipelines(
            vk::PipelineCache::null(),
            &[pipeline_info],
            None,
        )
    }
    .map_err(|(_, result)| result)
    .vk_call("vkCreateGraphicsPipelines");
    let pipeline = match pipelines {
        Ok(pipelines) => pipelines[0],
        Err(err) => {
            unsafe { device.device.destroy_pipeline_layout(layout, None) };
            return Err(err);
        }
    };

    device.set_object_name(pipeline, desc.name);
    log::debug!(
        "Created pipeline {:?}: {} stages, {} color attachments, depth {:?}",
        desc.name,
        shaders.len(),
        desc.color_formats.len(),
        desc.depth_format
    );

    Ok(Pipeline {
        pipeline,
        layout,
        bind_point: vk::PipelineBindPoint::GRAPHICS,
        push_range: merged.map(|(range, _)| range),
        push_stages: merged.map(|(_, stages)| stages).unwrap_or_default(),
    })
}

pub fn destroy_pipeline_resource(device: &DeviceContext, pipeline: &Pipeline) {
    unsafe {
        device.device.destroy_pipeline(pipeline.pipeline, None);
        device.device.destroy_pipeline_layout(pipeline.layout, None);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const VERTEX: vk::ShaderStageFlags = vk::ShaderStageFlags::VERTEX;
    const FRAGMENT: vk::ShaderStageFlags = vk::ShaderStageFlags::FRAGMENT;

    #[test]
    fn merge_agrees_across_stages() {
        let range = PushRange {
            offset: 0,
            size: 64,
        };
        let merged = merge_push_ranges(&[(VERTEX, Some(range)), (FRAGMENT, Some(range))]);
        let (out, stages) = merged.unwrap();
        assert_eq!(out, range);
        assert_eq!(stages, VERTEX | FRAGMENT);
    }

    #[test]
    fn merge_takes_the_single_declaring_stage() {
        let range = PushRange {
            offset: 0,
            size: 16,
        };
        let merged = merge_push_ranges(&[(VERTEX, Some(range)), (FRAGMENT, None)]);
        let (out, stages) = merged.unwrap();
        assert_eq!(out, range);
        assert_eq!(stages, VERTEX);
    }

    #[test]
    fn merge_without_ranges_is_none() {
        assert!(merge_push_ranges(&[(VERTEX, None), (FRAGMENT, None)]).is_none());
        assert!(merge_push_ranges(&[]).is_none());
    }

    #[test]
    #[should_panic(expected = "push-constant ranges must agree")]
    fn merge_mismatch_panics() {
        let a = PushRange {
            offset: 0,
            size: 64,
        };
        let b = PushRange {
            offset: 0,
            size: 32,
        };
        merge_push_ranges(&[(VERTEX, Some(a)), (FRAGMENT, Some(b))]);
    }
}
