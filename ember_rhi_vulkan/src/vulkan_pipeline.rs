/// Pipeline - Vulkan graphics and compute pipelines
///
/// Graphics pipelines are built for dynamic rendering: attachment formats come
/// from `vk::PipelineRenderingCreateInfo` and there is no render pass object.
/// Viewport and scissor are always dynamic.

use ember_rhi::ember::{Error, Result};
use ember_rhi::ember::render::{
    ComputePipelineDesc, DescriptorSetLayout as RhiDescriptorSetLayout, Pipeline as RhiPipeline,
    PipelineBindPoint, PipelineDesc, PushConstantRange, ShaderStage,
};
use ember_rhi::engine_error;
use ash::vk;
use std::any::Any;
use std::sync::Arc;

use crate::vulkan_context::GpuContext;
use crate::vulkan_descriptor_set::DescriptorSetLayout;
use crate::vulkan_format::{
    blend_factor_to_vk, blend_op_to_vk, buffer_format_to_vk, compare_op_to_vk, cull_mode_to_vk, front_face_to_vk,
    input_rate_to_vk, polygon_mode_to_vk, stage_flags_to_vk, stencil_state_to_vk, texture_format_to_vk,
    topology_to_vk, write_mask_to_vk,
};
use crate::vulkan_shader::Shader;

const LOG_SOURCE: &str = "ember::vulkan::Pipeline";

/// Vulkan graphics or compute pipeline
pub struct Pipeline {
    ctx: Arc<GpuContext>,
    bind_point: PipelineBindPoint,
    pub(crate) pipeline: vk::Pipeline,
    pub(crate) layout: vk::PipelineLayout,
    push_constant_ranges: Vec<PushConstantRange>,
    /// Keeps the set layouts alive as long as the pipeline layout references them
    set_layouts: Vec<Arc<dyn RhiDescriptorSetLayout>>,
}

/// Push constant ranges must be 4-byte aligned, non-empty and within the device limit
pub(crate) fn validate_push_constants(ranges: &[PushConstantRange], max_size: u32) -> Result<()> {
    for range in ranges {
        if range.size == 0 || range.offset % 4 != 0 || range.size % 4 != 0 {
            return Err(Error::InvalidResource(format!(
                "push constant range {}+{} must be non-empty and 4-byte aligned", range.offset, range.size
            )));
        }
        if range.offset.checked_add(range.size).map_or(true, |end| end > max_size) {
            return Err(Error::InvalidResource(format!(
                "push constant range {}+{} exceeds device limit of {} bytes", range.offset, range.size, max_size
            )));
        }
        if range.stages.is_empty() {
            return Err(Error::InvalidResource(format!(
                "push constant range {}+{} has no shader stage", range.offset, range.size
            )));
        }
    }
    Ok(())
}

/// Map a failed pipeline-level native call to `NativeError`
fn pipeline_error(operation: &str, result: vk::Result) -> Error {
    engine_error!(LOG_SOURCE, "{} failed: {:?}", operation, result);
    Error::NativeError { operation: operation.to_string(), code: result.as_raw() }
}

/// Build the pipeline layout shared by both kinds of pipeline
fn create_layout(
    ctx: &GpuContext,
    set_layouts: &[Arc<dyn RhiDescriptorSetLayout>],
    ranges: &[PushConstantRange],
) -> Result<vk::PipelineLayout> {
    let set_layout_handles = set_layouts.iter()
        .map(|l| DescriptorSetLayout::from_rhi(l.as_ref()).map(|l| l.layout))
        .collect::<Result<Vec<_>>>()?;
    let push_constant_ranges: Vec<vk::PushConstantRange> = ranges.iter()
        .map(|r| vk::PushConstantRange {
            stage_flags: stage_flags_to_vk(r.stages),
            offset: r.offset,
            size: r.size,
        })
        .collect();
    let layout_info = vk::PipelineLayoutCreateInfo::default()
        .set_layouts(&set_layout_handles)
        .push_constant_ranges(&push_constant_ranges);
    unsafe { ctx.device.create_pipeline_layout(&layout_info, None) }
        .map_err(|e| pipeline_error("vkCreatePipelineLayout", e))
}

/// Take the single pipeline out of a batch create call, destroying the layout on failure
fn single_pipeline(
    ctx: &GpuContext,
    layout: vk::PipelineLayout,
    operation: &str,
    created: std::result::Result<Vec<vk::Pipeline>, (Vec<vk::Pipeline>, vk::Result)>,
) -> Result<vk::Pipeline> {
    let pipeline = match created {
        Ok(pipelines) => pipelines.into_iter().next(),
        Err((partial, e)) => {
            unsafe {
                for p in partial.into_iter().filter(|p| *p != vk::Pipeline::null()) {
                    ctx.device.destroy_pipeline(p, None);
                }
                ctx.device.destroy_pipeline_layout(layout, None);
            }
            return Err(pipeline_error(operation, e));
        }
    };
    pipeline.ok_or_else(|| {
        unsafe { ctx.device.destroy_pipeline_layout(layout, None) };
        Error::BackendError(format!("{} returned no pipeline", operation))
    })
}

impl Pipeline {
    pub(crate) fn create(ctx: &Arc<GpuContext>, desc: &PipelineDesc) -> Result<Self> {
        if desc.vertex_shader.stage() != ShaderStage::Vertex || desc.fragment_shader.stage() != ShaderStage::Fragment {
            return Err(Error::InvalidResource(format!(
                "pipeline needs a vertex and a fragment shader, got {:?} and {:?}",
                desc.vertex_shader.stage(), desc.fragment_shader.stage()
            )));
        }
        if desc.color_formats.is_empty() && desc.depth_format.is_none() {
            return Err(Error::InvalidResource("pipeline has no attachment formats".to_string()));
        }
        desc.vertex_layout.validate().map_err(Error::InvalidResource)?;
        validate_push_constants(&desc.push_constant_ranges, ctx.limits.max_push_constants_size)?;

        let vertex_shader = desc.vertex_shader.as_any().downcast_ref::<Shader>()
            .ok_or_else(|| Error::InvalidResource("vertex shader was not created by the Vulkan backend".to_string()))?;
        let fragment_shader = desc.fragment_shader.as_any().downcast_ref::<Shader>()
            .ok_or_else(|| Error::InvalidResource("fragment shader was not created by the Vulkan backend".to_string()))?;

        let layout = create_layout(ctx, &desc.descriptor_set_layouts, &desc.push_constant_ranges)?;

        // Shader stages
        let shader_stages = [
            vk::PipelineShaderStageCreateInfo::default()
                .stage(vertex_shader.vk_stage())
                .module(vertex_shader.module)
                .name(&vertex_shader.entry_point_c),
            vk::PipelineShaderStageCreateInfo::default()
                .stage(fragment_shader.vk_stage())
                .module(fragment_shader.module)
                .name(&fragment_shader.entry_point_c),
        ];

        // Vertex input
        let vertex_bindings: Vec<vk::VertexInputBindingDescription> = desc.vertex_layout.bindings.iter()
            .map(|b| vk::VertexInputBindingDescription {
                binding: b.binding,
                stride: b.stride,
                input_rate: input_rate_to_vk(b.input_rate),
            })
            .collect();
        let vertex_attributes: Vec<vk::VertexInputAttributeDescription> = desc.vertex_layout.attributes.iter()
            .map(|a| vk::VertexInputAttributeDescription {
                location: a.location,
                binding: a.binding,
                format: buffer_format_to_vk(a.format),
                offset: a.offset,
            })
            .collect();
        let vertex_input_state = vk::PipelineVertexInputStateCreateInfo::default()
            .vertex_binding_descriptions(&vertex_bindings)
            .vertex_attribute_descriptions(&vertex_attributes);

        let input_assembly_state = vk::PipelineInputAssemblyStateCreateInfo::default()
            .topology(topology_to_vk(desc.topology))
            .primitive_restart_enable(false);

        // Viewport and scissor are dynamic; only the counts matter here
        let viewport_state = vk::PipelineViewportStateCreateInfo::default()
            .viewport_count(1)
            .scissor_count(1);

        let rasterization = &desc.rasterization;
        let mut rasterization_state = vk::PipelineRasterizationStateCreateInfo::default()
            .depth_clamp_enable(false)
            .rasterizer_discard_enable(false)
            .polygon_mode(polygon_mode_to_vk(rasterization.polygon_mode))
            .line_width(1.0)
            .cull_mode(cull_mode_to_vk(rasterization.cull_mode))
            .front_face(front_face_to_vk(rasterization.front_face));
        rasterization_state = match rasterization.depth_bias {
            Some(bias) => rasterization_state
                .depth_bias_enable(true)
                .depth_bias_constant_factor(bias.constant_factor)
                .depth_bias_slope_factor(bias.slope_factor)
                .depth_bias_clamp(bias.clamp),
            None => rasterization_state.depth_bias_enable(false),
        };

        let depth = &desc.depth_stencil;
        let has_depth = desc.depth_format.is_some();
        let depth_stencil_state = vk::PipelineDepthStencilStateCreateInfo::default()
            .depth_test_enable(has_depth && depth.depth_test_enable)
            .depth_write_enable(has_depth && depth.depth_write_enable)
            .depth_compare_op(compare_op_to_vk(depth.depth_compare_op))
            .depth_bounds_test_enable(false)
            .stencil_test_enable(has_depth && depth.stencil_test_enable)
            .front(stencil_state_to_vk(&depth.front))
            .back(stencil_state_to_vk(&depth.back));

        let multisample_state = vk::PipelineMultisampleStateCreateInfo::default()
            .sample_shading_enable(false)
            .rasterization_samples(vk::SampleCountFlags::TYPE_1);

        let blend = &desc.color_blend;
        let mut blend_attachment = vk::PipelineColorBlendAttachmentState::default()
            .color_write_mask(write_mask_to_vk(blend.write_mask))
            .blend_enable(blend.blend_enable);
        if blend.blend_enable {
            blend_attachment = blend_attachment
                .src_color_blend_factor(blend_factor_to_vk(blend.src_color_factor))
                .dst_color_blend_factor(blend_factor_to_vk(blend.dst_color_factor))
                .color_blend_op(blend_op_to_vk(blend.color_blend_op))
                .src_alpha_blend_factor(blend_factor_to_vk(blend.src_alpha_factor))
                .dst_alpha_blend_factor(blend_factor_to_vk(blend.dst_alpha_factor))
                .alpha_blend_op(blend_op_to_vk(blend.alpha_blend_op));
        }
        let blend_attachments = vec![blend_attachment; desc.color_formats.len()];
        let color_blend_state = vk::PipelineColorBlendStateCreateInfo::default()
            .logic_op_enable(false)
            .attachments(&blend_attachments);

        let dynamic_states = [vk::DynamicState::VIEWPORT, vk::DynamicState::SCISSOR];
        let dynamic_state = vk::PipelineDynamicStateCreateInfo::default().dynamic_states(&dynamic_states);

        // Attachment formats
        let color_formats: Vec<vk::Format> = desc.color_formats.iter().map(|&f| texture_format_to_vk(f)).collect();
        let depth_format = desc.depth_format.map_or(vk::Format::UNDEFINED, texture_format_to_vk);
        let stencil_format = match desc.depth_format {
            Some(f) if f.has_stencil() => depth_format,
            _ => vk::Format::UNDEFINED,
        };
        let mut rendering_info = vk::PipelineRenderingCreateInfo::default()
            .color_attachment_formats(&color_formats)
            .depth_attachment_format(depth_format)
            .stencil_attachment_format(stencil_format);

        let create_info = vk::GraphicsPipelineCreateInfo::default()
            .push_next(&mut rendering_info)
            .stages(&shader_stages)
            .vertex_input_state(&vertex_input_state)
            .input_assembly_state(&input_assembly_state)
            .viewport_state(&viewport_state)
            .rasterization_state(&rasterization_state)
            .depth_stencil_state(&depth_stencil_state)
            .multisample_state(&multisample_state)
            .color_blend_state(&color_blend_state)
            .dynamic_state(&dynamic_state)
            .layout(layout);

        let pipelines = unsafe {
            ctx.device.create_graphics_pipelines(vk::PipelineCache::null(), &[create_info], None)
        };
        let pipeline = single_pipeline(ctx, layout, "vkCreateGraphicsPipelines", pipelines)?;

        Ok(Self {
            ctx: Arc::clone(ctx),
            bind_point: PipelineBindPoint::Graphics,
            pipeline,
            layout,
            push_constant_ranges: desc.push_constant_ranges.clone(),
            set_layouts: desc.descriptor_set_layouts.clone(),
        })
    }

    pub(crate) fn create_compute(ctx: &Arc<GpuContext>, desc: &ComputePipelineDesc) -> Result<Self> {
        if desc.shader.stage() != ShaderStage::Compute {
            return Err(Error::InvalidResource(format!(
                "compute pipeline needs a compute shader, got {:?}", desc.shader.stage()
            )));
        }
        validate_push_constants(&desc.push_constant_ranges, ctx.limits.max_push_constants_size)?;
        let shader = desc.shader.as_any().downcast_ref::<Shader>()
            .ok_or_else(|| Error::InvalidResource("compute shader was not created by the Vulkan backend".to_string()))?;

        let layout = create_layout(ctx, &desc.descriptor_set_layouts, &desc.push_constant_ranges)?;
        let stage = vk::PipelineShaderStageCreateInfo::default()
            .stage(shader.vk_stage())
            .module(shader.module)
            .name(&shader.entry_point_c);
        let create_info = vk::ComputePipelineCreateInfo::default()
            .stage(stage)
            .layout(layout);

        let pipelines = unsafe {
            ctx.device.create_compute_pipelines(vk::PipelineCache::null(), &[create_info], None)
        };
        let pipeline = single_pipeline(ctx, layout, "vkCreateComputePipelines", pipelines)?;

        Ok(Self {
            ctx: Arc::clone(ctx),
            bind_point: PipelineBindPoint::Compute,
            pipeline,
            layout,
            push_constant_ranges: desc.push_constant_ranges.clone(),
            set_layouts: desc.descriptor_set_layouts.clone(),
        })
    }

    pub fn handle(&self) -> vk::Pipeline {
        self.pipeline
    }

    /// Downcast an RHI pipeline created by this backend
    pub(crate) fn from_rhi(pipeline: &dyn RhiPipeline) -> Result<&Pipeline> {
        pipeline.as_any().downcast_ref::<Pipeline>()
            .ok_or_else(|| Error::InvalidResource("pipeline was not created by the Vulkan backend".to_string()))
    }
}

impl RhiPipeline for Pipeline {
    fn bind_point(&self) -> PipelineBindPoint {
        self.bind_point
    }

    fn push_constant_ranges(&self) -> &[PushConstantRange] {
        &self.push_constant_ranges
    }

    fn descriptor_set_count(&self) -> u32 {
        self.set_layouts.len() as u32
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

impl Drop for Pipeline {
    fn drop(&mut self) {
        unsafe {
            self.ctx.device.destroy_pipeline(self.pipeline, None);
            self.ctx.device.destroy_pipeline_layout(self.layout, None);
        }
    }
}

#[cfg(test)]
#[path = "vulkan_pipeline_tests.rs"]
mod tests;
