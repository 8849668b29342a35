/// CommandList - Vulkan implementation of the CommandList trait
///
/// Records into a primary command buffer borrowed from the frame slot that
/// was current at creation. The slot's pool is reset by the device at the
/// start of that slot's next frame and its buffers are reused, so dropping
/// the list frees nothing.
///
/// Attachment layouts are tracked per (mip, layer): `begin_rendering` moves
/// only the bound subresources into attachment layouts with one batched
/// barrier, and `end_rendering` moves them to their terminal layouts.

use ember_rhi::ember::{Error, Result};
use ember_rhi::ember::render::{
    Buffer as RhiBuffer, CommandList as RhiCommandList, DescriptorSet as RhiDescriptorSet, ImageLayout, IndexType,
    Pipeline as RhiPipeline, PipelineBindPoint, Rect2D, RenderingAttachment, ShaderStageFlags, SubresourceRange,
    Texture as RhiTexture, Viewport,
};
use ember_rhi::engine_err;
use ash::vk;
use std::any::Any;
use std::sync::Arc;

use crate::vulkan_buffer::Buffer;
use crate::vulkan_context::GpuContext;
use crate::vulkan_descriptor_set::DescriptorSet;
use crate::vulkan_format::{
    bind_point_to_vk, clear_value_to_vk, index_type_to_vk, load_op_to_vk, stage_flags_to_vk, store_op_to_vk,
};
use crate::vulkan_pipeline::Pipeline;
use crate::vulkan_texture::{image_barriers, ImageLayoutState, Texture};

const LOG_SOURCE: &str = "ember::vulkan::CommandList";

// ============================================================================
// RECORDING STATE
// ============================================================================

/// Recording state of a command list
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordingState {
    Initial,
    Recording,
    Rendering,
    Ended,
}

/// State machine guarding every recording call
#[derive(Debug)]
pub(crate) struct RecordingTracker {
    state: RecordingState,
    /// Set while the last bound pipeline is a compute pipeline
    compute_bound: bool,
}

impl RecordingTracker {
    pub(crate) fn new() -> Self {
        Self { state: RecordingState::Initial, compute_bound: false }
    }

    pub(crate) fn state(&self) -> RecordingState {
        self.state
    }

    fn reject(&self, operation: &str) -> Error {
        Error::InvalidOperation(format!("{} not allowed in state {:?}", operation, self.state))
    }

    pub(crate) fn begin(&mut self) -> Result<()> {
        match self.state {
            RecordingState::Initial | RecordingState::Ended => {
                self.state = RecordingState::Recording;
                self.compute_bound = false;
                Ok(())
            }
            _ => Err(self.reject("begin")),
        }
    }

    pub(crate) fn end(&mut self) -> Result<()> {
        self.require_outside_rendering("end")?;
        self.state = RecordingState::Ended;
        Ok(())
    }

    pub(crate) fn begin_rendering(&mut self) -> Result<()> {
        self.require_outside_rendering("begin_rendering")?;
        self.state = RecordingState::Rendering;
        Ok(())
    }

    pub(crate) fn end_rendering(&mut self) -> Result<()> {
        self.require_rendering("end_rendering")?;
        self.state = RecordingState::Recording;
        Ok(())
    }

    pub(crate) fn bind_pipeline(&mut self, bind_point: PipelineBindPoint) -> Result<()> {
        self.require_recording("bind_pipeline")?;
        self.compute_bound = bind_point == PipelineBindPoint::Compute;
        Ok(())
    }

    pub(crate) fn dispatch(&self) -> Result<()> {
        self.require_outside_rendering("dispatch")?;
        if !self.compute_bound {
            return Err(Error::InvalidOperation("dispatch without a bound compute pipeline".to_string()));
        }
        Ok(())
    }

    /// Between `begin` and `end`, inside or outside a rendering scope
    pub(crate) fn require_recording(&self, operation: &str) -> Result<()> {
        match self.state {
            RecordingState::Recording | RecordingState::Rendering => Ok(()),
            _ => Err(self.reject(operation)),
        }
    }

    pub(crate) fn require_outside_rendering(&self, operation: &str) -> Result<()> {
        match self.state {
            RecordingState::Recording => Ok(()),
            _ => Err(self.reject(operation)),
        }
    }

    pub(crate) fn require_rendering(&self, operation: &str) -> Result<()> {
        match self.state {
            RecordingState::Rendering => Ok(()),
            _ => Err(self.reject(operation)),
        }
    }
}

// ============================================================================
// ATTACHMENT BOOKKEEPING
// ============================================================================

/// One subresource bound as an attachment of the open rendering scope
pub(crate) struct BoundAttachment {
    pub(crate) layouts: Arc<ImageLayoutState>,
    pub(crate) image: vk::Image,
    pub(crate) aspect: vk::ImageAspectFlags,
    pub(crate) mip: u32,
    pub(crate) layer: u32,
    pub(crate) is_depth: bool,
    pub(crate) is_swapchain: bool,
}

impl BoundAttachment {
    pub(crate) fn attachment_layout(&self) -> ImageLayout {
        if self.is_depth { ImageLayout::DepthStencilAttachment } else { ImageLayout::ColorAttachment }
    }

    /// Layout the subresource is left in when the rendering scope closes
    pub(crate) fn terminal_layout(&self) -> ImageLayout {
        if self.is_swapchain { ImageLayout::PresentSrc } else { ImageLayout::ShaderReadOnly }
    }

    fn move_to(&self, layout: ImageLayout) -> Result<Vec<vk::ImageMemoryBarrier2<'static>>> {
        let changes = self.layouts.transition(SubresourceRange::single(self.mip, self.layer), layout)?;
        Ok(image_barriers(self.image, self.aspect, &changes, layout))
    }
}

/// Attachments of the open rendering scope
#[derive(Default)]
pub(crate) struct AttachmentTracker {
    bound: Vec<BoundAttachment>,
}

impl AttachmentTracker {
    /// Record the attachments and return the barriers moving them into attachment layouts
    pub(crate) fn bind(&mut self, attachments: Vec<BoundAttachment>) -> Result<Vec<vk::ImageMemoryBarrier2<'static>>> {
        let mut barriers = Vec::new();
        for attachment in &attachments {
            barriers.extend(attachment.move_to(attachment.attachment_layout())?);
        }
        self.bound = attachments;
        Ok(barriers)
    }

    /// Forget the attachments and return the barriers moving them to their terminal layouts
    pub(crate) fn release(&mut self) -> Result<Vec<vk::ImageMemoryBarrier2<'static>>> {
        let mut barriers = Vec::new();
        for attachment in self.bound.drain(..) {
            barriers.extend(attachment.move_to(attachment.terminal_layout())?);
        }
        Ok(barriers)
    }
}

fn bound_attachment(texture: &Texture, attachment: &RenderingAttachment) -> BoundAttachment {
    BoundAttachment {
        layouts: Arc::clone(&texture.layouts),
        image: texture.image,
        aspect: texture.aspect,
        mip: attachment.mip_level,
        layer: attachment.array_layer,
        is_depth: texture.info().format.is_depth(),
        is_swapchain: !texture.owns_image(),
    }
}

// ============================================================================
// COMMAND LIST
// ============================================================================

/// Vulkan command list implementation
pub struct CommandList {
    ctx: Arc<GpuContext>,
    command_buffer: vk::CommandBuffer,
    /// Frame slot whose pool owns the command buffer
    frame_slot: usize,
    tracker: RecordingTracker,
    attachments: AttachmentTracker,
}

impl CommandList {
    /// Wrap a primary command buffer handed out by the frame slot `frame_slot`
    pub(crate) fn new(ctx: &Arc<GpuContext>, command_buffer: vk::CommandBuffer, frame_slot: usize) -> Self {
        Self {
            ctx: Arc::clone(ctx),
            command_buffer,
            frame_slot,
            tracker: RecordingTracker::new(),
            attachments: AttachmentTracker::default(),
        }
    }

    pub fn command_buffer(&self) -> vk::CommandBuffer {
        self.command_buffer
    }

    pub fn state(&self) -> RecordingState {
        self.tracker.state()
    }

    pub(crate) fn frame_slot(&self) -> usize {
        self.frame_slot
    }

    /// Command buffer ready for submission; the list must have been ended
    pub(crate) fn submittable(&self) -> Result<vk::CommandBuffer> {
        if self.tracker.state() != RecordingState::Ended {
            return Err(Error::InvalidOperation(format!(
                "command list submitted in state {:?}", self.tracker.state()
            )));
        }
        Ok(self.command_buffer)
    }

    fn rendering_attachment_info(
        view: vk::ImageView,
        layout: vk::ImageLayout,
        attachment: &RenderingAttachment,
    ) -> vk::RenderingAttachmentInfo<'static> {
        vk::RenderingAttachmentInfo::default()
            .image_view(view)
            .image_layout(layout)
            .load_op(load_op_to_vk(attachment.load_op))
            .store_op(store_op_to_vk(attachment.store_op))
            .clear_value(clear_value_to_vk(attachment.clear_value))
    }
}

impl RhiCommandList for CommandList {
    fn begin(&mut self) -> Result<()> {
        self.tracker.begin()?;
        let begin_info = vk::CommandBufferBeginInfo::default()
            .flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT);
        let result = unsafe {
            self.ctx.device
                .reset_command_buffer(self.command_buffer, vk::CommandBufferResetFlags::empty())
                .and_then(|_| self.ctx.device.begin_command_buffer(self.command_buffer, &begin_info))
        };
        if let Err(e) = result {
            self.tracker = RecordingTracker::new();
            return Err(engine_err!(LOG_SOURCE, "Failed to begin command buffer: {:?}", e));
        }
        Ok(())
    }

    fn end(&mut self) -> Result<()> {
        self.tracker.require_outside_rendering("end")?;
        unsafe { self.ctx.device.end_command_buffer(self.command_buffer) }
            .map_err(|e| engine_err!(LOG_SOURCE, "Failed to end command buffer: {:?}", e))?;
        self.tracker.end()
    }

    fn begin_rendering(
        &mut self,
        color_attachments: &[RenderingAttachment],
        depth_attachment: Option<&RenderingAttachment>,
        render_area: Rect2D,
    ) -> Result<()> {
        self.tracker.require_outside_rendering("begin_rendering")?;
        if color_attachments.is_empty() && depth_attachment.is_none() {
            return Err(Error::InvalidOperation("begin_rendering without attachments".to_string()));
        }

        // Resolve views first so a bad attachment leaves every tracked layout untouched
        let mut bound = Vec::with_capacity(color_attachments.len() + 1);
        let mut color_infos = Vec::with_capacity(color_attachments.len());
        for attachment in color_attachments {
            let texture = Texture::from_rhi(attachment.texture.as_ref())?;
            if texture.info().format.is_depth() {
                return Err(Error::InvalidResource("depth texture bound as a color attachment".to_string()));
            }
            let view = texture.subresource_view(attachment.mip_level, attachment.array_layer)?;
            color_infos.push(Self::rendering_attachment_info(view, vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL, attachment));
            bound.push(bound_attachment(texture, attachment));
        }
        let mut depth_info = None;
        let mut has_stencil = false;
        if let Some(attachment) = depth_attachment {
            let texture = Texture::from_rhi(attachment.texture.as_ref())?;
            if !texture.info().format.is_depth() {
                return Err(Error::InvalidResource("color texture bound as the depth attachment".to_string()));
            }
            has_stencil = texture.info().format.has_stencil();
            let view = texture.subresource_view(attachment.mip_level, attachment.array_layer)?;
            depth_info = Some(Self::rendering_attachment_info(
                view,
                vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL,
                attachment,
            ));
            bound.push(bound_attachment(texture, attachment));
        }

        let barriers = self.attachments.bind(bound)?;
        self.ctx.sync.pipeline_barrier(self.command_buffer, &[], &[], &barriers);

        let area = vk::Rect2D {
            offset: vk::Offset2D { x: render_area.x, y: render_area.y },
            extent: vk::Extent2D { width: render_area.width, height: render_area.height },
        };
        let mut rendering_info = vk::RenderingInfo::default()
            .render_area(area)
            .layer_count(1)
            .color_attachments(&color_infos);
        if let Some(depth) = depth_info.as_ref() {
            rendering_info = rendering_info.depth_attachment(depth);
            if has_stencil {
                rendering_info = rendering_info.stencil_attachment(depth);
            }
        }
        unsafe { self.ctx.device.cmd_begin_rendering(self.command_buffer, &rendering_info) };
        self.tracker.begin_rendering()
    }

    fn end_rendering(&mut self) -> Result<()> {
        self.tracker.require_rendering("end_rendering")?;
        unsafe { self.ctx.device.cmd_end_rendering(self.command_buffer) };
        let barriers = self.attachments.release()?;
        self.ctx.sync.pipeline_barrier(self.command_buffer, &[], &[], &barriers);
        self.tracker.end_rendering()
    }

    fn set_viewport(&mut self, viewport: Viewport) -> Result<()> {
        self.tracker.require_recording("set_viewport")?;
        let viewport = vk::Viewport {
            x: viewport.x,
            y: viewport.y,
            width: viewport.width,
            height: viewport.height,
            min_depth: viewport.min_depth,
            max_depth: viewport.max_depth,
        };
        unsafe { self.ctx.device.cmd_set_viewport(self.command_buffer, 0, &[viewport]) };
        Ok(())
    }

    fn set_scissor(&mut self, scissor: Rect2D) -> Result<()> {
        self.tracker.require_recording("set_scissor")?;
        let scissor = vk::Rect2D {
            offset: vk::Offset2D { x: scissor.x, y: scissor.y },
            extent: vk::Extent2D { width: scissor.width, height: scissor.height },
        };
        unsafe { self.ctx.device.cmd_set_scissor(self.command_buffer, 0, &[scissor]) };
        Ok(())
    }

    fn bind_pipeline(&mut self, pipeline: &Arc<dyn RhiPipeline>) -> Result<()> {
        let bind_point = pipeline.bind_point();
        let pipeline = Pipeline::from_rhi(pipeline.as_ref())?;
        self.tracker.bind_pipeline(bind_point)?;
        unsafe {
            self.ctx.device.cmd_bind_pipeline(self.command_buffer, bind_point_to_vk(bind_point), pipeline.pipeline);
        }
        Ok(())
    }

    fn bind_descriptor_set(
        &mut self,
        pipeline: &Arc<dyn RhiPipeline>,
        set_index: u32,
        descriptor_set: &Arc<dyn RhiDescriptorSet>,
    ) -> Result<()> {
        self.tracker.require_recording("bind_descriptor_set")?;
        if set_index >= pipeline.descriptor_set_count() {
            return Err(Error::InvalidOperation(format!(
                "set index {} outside pipeline layout of {} sets", set_index, pipeline.descriptor_set_count()
            )));
        }
        let layout = Pipeline::from_rhi(pipeline.as_ref())?.layout;
        let set = DescriptorSet::from_rhi(descriptor_set.as_ref())?.set;
        unsafe {
            self.ctx.device.cmd_bind_descriptor_sets(
                self.command_buffer,
                bind_point_to_vk(pipeline.bind_point()),
                layout,
                set_index,
                &[set],
                &[],
            );
        }
        Ok(())
    }

    fn push_constants(
        &mut self,
        pipeline: &Arc<dyn RhiPipeline>,
        stages: ShaderStageFlags,
        offset: u32,
        data: &[u8],
    ) -> Result<()> {
        self.tracker.require_recording("push_constants")?;
        if data.is_empty() || data.len() % 4 != 0 || offset % 4 != 0 {
            return Err(Error::InvalidOperation(format!(
                "push constants {}+{} must be non-empty and 4-byte aligned", offset, data.len()
            )));
        }
        let end = offset as u64 + data.len() as u64;
        let covered = pipeline.push_constant_ranges().iter()
            .any(|r| r.stages.contains(stages) && r.offset <= offset && end <= (r.offset + r.size) as u64);
        if !covered {
            return Err(Error::InvalidOperation(format!(
                "push constants {}+{} for {:?} not covered by the pipeline layout", offset, data.len(), stages
            )));
        }
        let layout = Pipeline::from_rhi(pipeline.as_ref())?.layout;
        unsafe {
            self.ctx.device.cmd_push_constants(self.command_buffer, layout, stage_flags_to_vk(stages), offset, data);
        }
        Ok(())
    }

    fn bind_vertex_buffer(&mut self, binding: u32, buffer: &Arc<dyn RhiBuffer>, offset: u64) -> Result<()> {
        self.tracker.require_recording("bind_vertex_buffer")?;
        let buffer = Buffer::from_rhi(buffer.as_ref())?;
        unsafe { self.ctx.device.cmd_bind_vertex_buffers(self.command_buffer, binding, &[buffer.buffer], &[offset]) };
        Ok(())
    }

    fn bind_index_buffer(&mut self, buffer: &Arc<dyn RhiBuffer>, offset: u64, index_type: IndexType) -> Result<()> {
        self.tracker.require_recording("bind_index_buffer")?;
        let buffer = Buffer::from_rhi(buffer.as_ref())?;
        unsafe {
            self.ctx.device.cmd_bind_index_buffer(self.command_buffer, buffer.buffer, offset, index_type_to_vk(index_type));
        }
        Ok(())
    }

    fn draw(&mut self, vertex_count: u32, instance_count: u32, first_vertex: u32, first_instance: u32) -> Result<()> {
        self.tracker.require_rendering("draw")?;
        unsafe {
            self.ctx.device.cmd_draw(self.command_buffer, vertex_count, instance_count, first_vertex, first_instance);
        }
        Ok(())
    }

    fn draw_indexed(
        &mut self,
        index_count: u32,
        instance_count: u32,
        first_index: u32,
        vertex_offset: i32,
        first_instance: u32,
    ) -> Result<()> {
        self.tracker.require_rendering("draw_indexed")?;
        unsafe {
            self.ctx.device.cmd_draw_indexed(
                self.command_buffer,
                index_count,
                instance_count,
                first_index,
                vertex_offset,
                first_instance,
            );
        }
        Ok(())
    }

    fn dispatch(&mut self, group_count_x: u32, group_count_y: u32, group_count_z: u32) -> Result<()> {
        self.tracker.dispatch()?;
        unsafe { self.ctx.device.cmd_dispatch(self.command_buffer, group_count_x, group_count_y, group_count_z) };
        Ok(())
    }

    fn transition_image_layout(
        &mut self,
        texture: &Arc<dyn RhiTexture>,
        new_layout: ImageLayout,
        range: SubresourceRange,
    ) -> Result<()> {
        self.tracker.require_outside_rendering("transition_image_layout")?;
        let barriers = Texture::from_rhi(texture.as_ref())?.transition_barriers(range, new_layout)?;
        self.ctx.sync.pipeline_barrier(self.command_buffer, &[], &[], &barriers);
        Ok(())
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

#[cfg(test)]
#[path = "vulkan_command_list_tests.rs"]
mod tests;
