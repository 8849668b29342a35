/// CommandList trait - records rendering commands with dynamic rendering

use std::any::Any;
use std::sync::Arc;
use crate::error::Result;
use crate::graphics_device::{
    Pipeline, Buffer, Texture, DescriptorSet, IndexType, ShaderStageFlags,
    ImageLayout, SubresourceRange,
};

/// Viewport dimensions and depth range
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Viewport {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
    pub min_depth: f32,
    pub max_depth: f32,
}

impl Viewport {
    /// Full-extent viewport with depth range [0, 1]
    pub fn from_extent(width: u32, height: u32) -> Self {
        Self { x: 0.0, y: 0.0, width: width as f32, height: height as f32, min_depth: 0.0, max_depth: 1.0 }
    }
}

/// 2D rectangle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Rect2D {
    pub x: i32,
    pub y: i32,
    pub width: u32,
    pub height: u32,
}

impl Rect2D {
    pub fn from_extent(width: u32, height: u32) -> Self {
        Self { x: 0, y: 0, width, height }
    }
}

/// Clear value for an attachment
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ClearValue {
    /// RGBA
    Color([f32; 4]),
    DepthStencil { depth: f32, stencil: u32 },
}

/// What happens to attachment contents when rendering begins
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LoadOp {
    Load,
    #[default]
    Clear,
    DontCare,
}

/// What happens to attachment contents when rendering ends
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StoreOp {
    #[default]
    Store,
    DontCare,
}

/// One attachment of a dynamic rendering scope
///
/// Only the (mip, layer) subresource is rendered to and transitioned.
#[derive(Clone)]
pub struct RenderingAttachment {
    pub texture: Arc<dyn Texture>,
    pub mip_level: u32,
    pub array_layer: u32,
    pub load_op: LoadOp,
    pub store_op: StoreOp,
    pub clear_value: ClearValue,
}

impl RenderingAttachment {
    /// Mip 0 / layer 0, cleared to `clear_color` and stored
    pub fn color(texture: Arc<dyn Texture>, clear_color: [f32; 4]) -> Self {
        Self {
            texture,
            mip_level: 0,
            array_layer: 0,
            load_op: LoadOp::Clear,
            store_op: StoreOp::Store,
            clear_value: ClearValue::Color(clear_color),
        }
    }

    /// Mip 0 / layer 0, cleared to `depth` and discarded after the pass
    pub fn depth(texture: Arc<dyn Texture>, depth: f32) -> Self {
        Self {
            texture,
            mip_level: 0,
            array_layer: 0,
            load_op: LoadOp::Clear,
            store_op: StoreOp::DontCare,
            clear_value: ClearValue::DepthStencil { depth, stencil: 0 },
        }
    }

    /// Builder-style subresource selection
    pub fn at(mut self, mip_level: u32, array_layer: u32) -> Self {
        self.mip_level = mip_level;
        self.array_layer = array_layer;
        self
    }
}

/// Command list for recording GPU work
///
/// State machine: `begin` -> recording -> [`begin_rendering` .. `end_rendering`]* -> `end`.
/// Calls made in the wrong state return `Error::InvalidOperation`.
/// Submitted through `GraphicsDevice::submit_command_list`.
pub trait CommandList: Send + Sync {
    /// Begin recording
    fn begin(&mut self) -> Result<()>;

    /// Finish recording (not allowed inside a rendering scope)
    fn end(&mut self) -> Result<()>;

    /// Open a dynamic rendering scope
    ///
    /// Each attachment subresource is transitioned into its attachment layout
    /// with a single batched barrier before rendering starts.
    fn begin_rendering(
        &mut self,
        color_attachments: &[RenderingAttachment],
        depth_attachment: Option<&RenderingAttachment>,
        render_area: Rect2D,
    ) -> Result<()>;

    /// Close the rendering scope
    ///
    /// Swapchain images move to PRESENT_SRC, every other attachment to
    /// SHADER_READ_ONLY.
    fn end_rendering(&mut self) -> Result<()>;

    fn set_viewport(&mut self, viewport: Viewport) -> Result<()>;

    fn set_scissor(&mut self, scissor: Rect2D) -> Result<()>;

    fn bind_pipeline(&mut self, pipeline: &Arc<dyn Pipeline>) -> Result<()>;

    /// Bind a descriptor set at `set_index` of the pipeline layout
    fn bind_descriptor_set(
        &mut self,
        pipeline: &Arc<dyn Pipeline>,
        set_index: u32,
        descriptor_set: &Arc<dyn DescriptorSet>,
    ) -> Result<()>;

    fn push_constants(
        &mut self,
        pipeline: &Arc<dyn Pipeline>,
        stages: ShaderStageFlags,
        offset: u32,
        data: &[u8],
    ) -> Result<()>;

    fn bind_vertex_buffer(&mut self, binding: u32, buffer: &Arc<dyn Buffer>, offset: u64) -> Result<()>;

    fn bind_index_buffer(&mut self, buffer: &Arc<dyn Buffer>, offset: u64, index_type: IndexType) -> Result<()>;

    fn draw(&mut self, vertex_count: u32, instance_count: u32, first_vertex: u32, first_instance: u32) -> Result<()>;

    fn draw_indexed(
        &mut self,
        index_count: u32,
        instance_count: u32,
        first_index: u32,
        vertex_offset: i32,
        first_instance: u32,
    ) -> Result<()>;

    /// Dispatch compute work groups; needs a bound compute pipeline, outside rendering
    fn dispatch(&mut self, group_count_x: u32, group_count_y: u32, group_count_z: u32) -> Result<()>;

    /// Transition a range of subresources from their tracked layouts
    fn transition_image_layout(
        &mut self,
        texture: &Arc<dyn Texture>,
        new_layout: ImageLayout,
        range: SubresourceRange,
    ) -> Result<()>;

    /// Downcast support for backends
    fn as_any(&self) -> &dyn Any;
}
