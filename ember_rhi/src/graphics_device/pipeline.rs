/// Pipeline trait, the full graphics pipeline state descriptor and the compute descriptor

use std::any::Any;
use std::sync::Arc;
use crate::graphics_device::{
    Shader, BufferFormat, ShaderStageFlags, TextureFormat, DescriptorSetLayout,
};

// ===== VERTEX INPUT =====

/// Primitive topology
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PrimitiveTopology {
    #[default]
    TriangleList,
    TriangleStrip,
    LineList,
    PointList,
}

/// Vertex input rate
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum VertexInputRate {
    #[default]
    Vertex,
    Instance,
}

/// One vertex attribute (shader location fed from a binding)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VertexAttribute {
    pub location: u32,
    pub binding: u32,
    pub format: BufferFormat,
    /// Byte offset inside one element of the binding
    pub offset: u32,
}

/// One vertex buffer binding
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VertexBinding {
    pub binding: u32,
    pub stride: u32,
    pub input_rate: VertexInputRate,
}

/// Vertex input layout
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VertexLayout {
    pub bindings: Vec<VertexBinding>,
    pub attributes: Vec<VertexAttribute>,
}

impl VertexLayout {
    /// Every attribute must reference a declared binding and fit inside its stride
    pub fn validate(&self) -> std::result::Result<(), String> {
        for attr in &self.attributes {
            let binding = self.bindings.iter()
                .find(|b| b.binding == attr.binding)
                .ok_or_else(|| format!("attribute at location {} uses undeclared binding {}", attr.location, attr.binding))?;
            if attr.offset + attr.format.size_bytes() > binding.stride {
                return Err(format!(
                    "attribute at location {} (offset {} + {} bytes) exceeds stride {}",
                    attr.location, attr.offset, attr.format.size_bytes(), binding.stride
                ));
            }
        }
        Ok(())
    }
}

/// Push constant range
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PushConstantRange {
    pub stages: ShaderStageFlags,
    pub offset: u32,
    pub size: u32,
}

/// Index buffer element type
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IndexType {
    U16,
    U32,
}

impl IndexType {
    pub fn size_bytes(&self) -> u32 {
        match self {
            IndexType::U16 => 2,
            IndexType::U32 => 4,
        }
    }
}

// ===== RASTERIZATION =====

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CullMode {
    None,
    Front,
    #[default]
    Back,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FrontFace {
    #[default]
    CounterClockwise,
    Clockwise,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PolygonMode {
    #[default]
    Fill,
    Line,
    Point,
}

/// Depth bias parameters
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DepthBias {
    pub constant_factor: f32,
    pub slope_factor: f32,
    pub clamp: f32,
}

/// Rasterizer state
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct RasterizationState {
    pub cull_mode: CullMode,
    pub front_face: FrontFace,
    pub polygon_mode: PolygonMode,
    /// None disables depth bias
    pub depth_bias: Option<DepthBias>,
}

// ===== DEPTH / STENCIL =====

/// Comparison operator for depth, stencil and comparison samplers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompareOp {
    Never,
    Less,
    Equal,
    LessOrEqual,
    Greater,
    NotEqual,
    GreaterOrEqual,
    Always,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StencilOp {
    Keep,
    Zero,
    Replace,
    IncrementAndClamp,
    DecrementAndClamp,
    Invert,
    IncrementAndWrap,
    DecrementAndWrap,
}

/// Per-face stencil state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StencilOpState {
    pub fail_op: StencilOp,
    pub pass_op: StencilOp,
    pub depth_fail_op: StencilOp,
    pub compare_op: CompareOp,
    pub compare_mask: u32,
    pub write_mask: u32,
    pub reference: u32,
}

impl Default for StencilOpState {
    fn default() -> Self {
        Self {
            fail_op: StencilOp::Keep,
            pass_op: StencilOp::Keep,
            depth_fail_op: StencilOp::Keep,
            compare_op: CompareOp::Always,
            compare_mask: 0xFF,
            write_mask: 0xFF,
            reference: 0,
        }
    }
}

/// Depth and stencil test state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DepthStencilState {
    pub depth_test_enable: bool,
    pub depth_write_enable: bool,
    pub depth_compare_op: CompareOp,
    pub stencil_test_enable: bool,
    pub front: StencilOpState,
    pub back: StencilOpState,
}

impl Default for DepthStencilState {
    fn default() -> Self {
        Self {
            depth_test_enable: true,
            depth_write_enable: true,
            depth_compare_op: CompareOp::Less,
            stencil_test_enable: false,
            front: StencilOpState::default(),
            back: StencilOpState::default(),
        }
    }
}

// ===== BLENDING =====

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlendFactor {
    Zero,
    One,
    SrcColor,
    OneMinusSrcColor,
    DstColor,
    OneMinusDstColor,
    SrcAlpha,
    OneMinusSrcAlpha,
    DstAlpha,
    OneMinusDstAlpha,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlendOp {
    Add,
    Subtract,
    ReverseSubtract,
    Min,
    Max,
}

/// Blend state shared by every color attachment
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ColorBlendState {
    pub blend_enable: bool,
    pub src_color_factor: BlendFactor,
    pub dst_color_factor: BlendFactor,
    pub color_blend_op: BlendOp,
    pub src_alpha_factor: BlendFactor,
    pub dst_alpha_factor: BlendFactor,
    pub alpha_blend_op: BlendOp,
    /// RGBA write mask, bit 0 = R
    pub write_mask: u8,
}

impl ColorBlendState {
    /// Standard premultiplied-free alpha blending
    pub fn alpha_blend() -> Self {
        Self {
            blend_enable: true,
            src_color_factor: BlendFactor::SrcAlpha,
            dst_color_factor: BlendFactor::OneMinusSrcAlpha,
            src_alpha_factor: BlendFactor::One,
            dst_alpha_factor: BlendFactor::OneMinusSrcAlpha,
            ..Default::default()
        }
    }
}

impl Default for ColorBlendState {
    fn default() -> Self {
        Self {
            blend_enable: false,
            src_color_factor: BlendFactor::One,
            dst_color_factor: BlendFactor::Zero,
            color_blend_op: BlendOp::Add,
            src_alpha_factor: BlendFactor::One,
            dst_alpha_factor: BlendFactor::Zero,
            alpha_blend_op: BlendOp::Add,
            write_mask: 0b1111,
        }
    }
}

// ===== PIPELINE DESCRIPTOR =====

/// Descriptor for creating a graphics pipeline (dynamic rendering, no render pass)
///
/// Viewport and scissor are always dynamic state.
#[derive(Clone)]
pub struct PipelineDesc {
    pub vertex_shader: Arc<dyn Shader>,
    pub fragment_shader: Arc<dyn Shader>,
    pub vertex_layout: VertexLayout,
    pub topology: PrimitiveTopology,
    pub rasterization: RasterizationState,
    pub depth_stencil: DepthStencilState,
    pub color_blend: ColorBlendState,
    /// Set layouts, index = set number
    pub descriptor_set_layouts: Vec<Arc<dyn DescriptorSetLayout>>,
    pub push_constant_ranges: Vec<PushConstantRange>,
    /// Formats of the color attachments the pipeline renders into
    pub color_formats: Vec<TextureFormat>,
    /// Depth attachment format, if any
    pub depth_format: Option<TextureFormat>,
}

impl PipelineDesc {
    /// Minimal descriptor: default fixed-function state, one color target
    pub fn new(
        vertex_shader: Arc<dyn Shader>,
        fragment_shader: Arc<dyn Shader>,
        color_format: TextureFormat,
    ) -> Self {
        Self {
            vertex_shader,
            fragment_shader,
            vertex_layout: VertexLayout::default(),
            topology: PrimitiveTopology::TriangleList,
            rasterization: RasterizationState::default(),
            depth_stencil: DepthStencilState::default(),
            color_blend: ColorBlendState::default(),
            descriptor_set_layouts: Vec::new(),
            push_constant_ranges: Vec::new(),
            color_formats: vec![color_format],
            depth_format: None,
        }
    }
}

/// Descriptor for creating a compute pipeline
#[derive(Clone)]
pub struct ComputePipelineDesc {
    pub shader: Arc<dyn Shader>,
    /// Set layouts, index = set number
    pub descriptor_set_layouts: Vec<Arc<dyn DescriptorSetLayout>>,
    pub push_constant_ranges: Vec<PushConstantRange>,
}

impl ComputePipelineDesc {
    pub fn new(shader: Arc<dyn Shader>) -> Self {
        Self { shader, descriptor_set_layouts: Vec::new(), push_constant_ranges: Vec::new() }
    }
}

/// Where a pipeline binds: draws use graphics pipelines, dispatches use compute pipelines
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineBindPoint {
    Graphics,
    Compute,
}

/// Graphics or compute pipeline trait
pub trait Pipeline: Send + Sync {
    fn bind_point(&self) -> PipelineBindPoint;

    /// Push constant ranges declared by the pipeline layout
    fn push_constant_ranges(&self) -> &[PushConstantRange];

    /// Number of descriptor sets in the pipeline layout
    fn descriptor_set_count(&self) -> u32;

    /// Downcast support for backends
    fn as_any(&self) -> &dyn Any;
}

#[cfg(test)]
#[path = "pipeline_tests.rs"]
mod tests;
