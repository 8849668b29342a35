/// Mock graphics device for unit tests (no GPU required)
///
/// Resources keep their data in memory, command lists record a textual log of
/// calls and the device simulates the frame protocol (slot rotation, skipped
/// frames, device loss).

use std::any::Any;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use rustc_hash::FxHashMap;

use crate::error::{Error, Result};
use crate::graphics_device::{
    GraphicsDevice, GraphicsDeviceStats, FrameBegin,
    Buffer, BufferDesc, BufferUsage, MemoryType,
    Texture, TextureDesc, TextureInfo, TextureFormat, TextureUsage, ImageLayout, SubresourceRange,
    Sampler, SamplerDesc, Shader, ShaderDesc, ShaderStage, ShaderStageFlags, content_hash,
    Pipeline, PipelineBindPoint, PipelineDesc, ComputePipelineDesc, PushConstantRange,
    DescriptorSetLayout, DescriptorSetLayoutDesc, DescriptorSet, DescriptorType, check_binding,
    CommandList, RenderingAttachment, Rect2D, Viewport, IndexType,
};
use crate::engine_bail;

// ============================================================================
// Mock Buffer
// ============================================================================

pub struct MockBuffer {
    pub desc: BufferDesc,
    data: Mutex<Vec<u8>>,
    mapped: AtomicBool,
}

impl MockBuffer {
    pub fn new(desc: BufferDesc) -> Self {
        let data = Mutex::new(vec![0u8; desc.size as usize]);
        Self { desc, data, mapped: AtomicBool::new(false) }
    }

    /// Snapshot of the buffer bytes
    pub fn contents(&self) -> Vec<u8> {
        self.data.lock().unwrap().clone()
    }
}

impl Buffer for MockBuffer {
    fn size(&self) -> u64 {
        self.desc.size
    }

    fn usage(&self) -> BufferUsage {
        self.desc.usage
    }

    fn memory_type(&self) -> MemoryType {
        self.desc.memory_type
    }

    fn map(&self) -> Result<*mut u8> {
        if !self.desc.memory_type.is_host_visible() {
            return Err(Error::InvalidOperation("cannot map a device-local buffer".to_string()));
        }
        self.mapped.store(true, Ordering::Relaxed);
        Ok(self.data.lock().unwrap().as_mut_ptr())
    }

    fn unmap(&self) {
        self.mapped.store(false, Ordering::Relaxed);
    }

    fn is_mapped(&self) -> bool {
        self.mapped.load(Ordering::Relaxed)
    }

    fn update(&self, offset: u64, data: &[u8]) -> Result<()> {
        if !self.desc.memory_type.is_host_visible() {
            return Err(Error::InvalidOperation("cannot update a device-local buffer from the CPU".to_string()));
        }
        let end = offset as usize + data.len();
        let mut bytes = self.data.lock().unwrap();
        if end > bytes.len() {
            engine_bail!("ember::mock", "update out of bounds: {} > {}", end, bytes.len());
        }
        bytes[offset as usize..end].copy_from_slice(data);
        Ok(())
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

// ============================================================================
// Mock Texture
// ============================================================================

pub struct MockTexture {
    pub info: TextureInfo,
    pub swapchain_image: bool,
    layouts: Mutex<FxHashMap<(u32, u32), ImageLayout>>,
}

impl MockTexture {
    pub fn new(desc: &TextureDesc) -> Self {
        Self { info: TextureInfo::from(desc), swapchain_image: false, layouts: Mutex::new(FxHashMap::default()) }
    }

    pub fn swapchain(width: u32, height: u32) -> Self {
        let desc = TextureDesc::new_2d(width, height, TextureFormat::B8G8R8A8_SRGB, TextureUsage::COLOR_ATTACHMENT);
        Self { swapchain_image: true, ..Self::new(&desc) }
    }

    pub fn set_layout(&self, range: SubresourceRange, layout: ImageLayout) {
        let mut layouts = self.layouts.lock().unwrap();
        for key in range.iter() {
            layouts.insert(key, layout);
        }
    }
}

impl Texture for MockTexture {
    fn info(&self) -> &TextureInfo {
        &self.info
    }

    fn is_swapchain_image(&self) -> bool {
        self.swapchain_image
    }

    fn layout(&self, mip: u32, layer: u32) -> ImageLayout {
        self.layouts.lock().unwrap().get(&(mip, layer)).copied().unwrap_or_default()
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

// ============================================================================
// Mock Sampler / Shader / Pipeline
// ============================================================================

pub struct MockSampler {
    pub desc: SamplerDesc,
}

impl Sampler for MockSampler {
    fn desc(&self) -> &SamplerDesc {
        &self.desc
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

pub struct MockShader {
    pub stage: ShaderStage,
    pub hash: u64,
}

impl MockShader {
    pub fn new(stage: ShaderStage, code: &[u8]) -> Self {
        Self { stage, hash: content_hash(code) }
    }
}

impl Shader for MockShader {
    fn stage(&self) -> ShaderStage {
        self.stage
    }

    fn entry_point(&self) -> &str {
        "main"
    }

    fn content_hash(&self) -> u64 {
        self.hash
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

pub struct MockPipeline {
    pub bind_point: PipelineBindPoint,
    pub push_constant_ranges: Vec<PushConstantRange>,
    pub set_count: u32,
}

impl Pipeline for MockPipeline {
    fn bind_point(&self) -> PipelineBindPoint {
        self.bind_point
    }

    fn push_constant_ranges(&self) -> &[PushConstantRange] {
        &self.push_constant_ranges
    }

    fn descriptor_set_count(&self) -> u32 {
        self.set_count
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

// ============================================================================
// Mock Descriptors
// ============================================================================

pub struct MockDescriptorSetLayout {
    pub desc: DescriptorSetLayoutDesc,
}

impl DescriptorSetLayout for MockDescriptorSetLayout {
    fn desc(&self) -> &DescriptorSetLayoutDesc {
        &self.desc
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

pub struct MockDescriptorSet {
    pub layout: Arc<dyn DescriptorSetLayout>,
    pub writes: Mutex<Vec<(u32, DescriptorType)>>,
}

impl DescriptorSet for MockDescriptorSet {
    fn layout(&self) -> &Arc<dyn DescriptorSetLayout> {
        &self.layout
    }

    fn update_uniform_buffer(&self, binding: u32, _buffer: &Arc<dyn Buffer>, _offset: u64, _range: u64) -> Result<()> {
        check_binding(self.layout.desc(), binding, DescriptorType::UniformBuffer)?;
        self.writes.lock().unwrap().push((binding, DescriptorType::UniformBuffer));
        Ok(())
    }

    fn update_storage_buffer(&self, binding: u32, _buffer: &Arc<dyn Buffer>, _offset: u64, _range: u64) -> Result<()> {
        check_binding(self.layout.desc(), binding, DescriptorType::StorageBuffer)?;
        self.writes.lock().unwrap().push((binding, DescriptorType::StorageBuffer));
        Ok(())
    }

    fn update_combined_image_sampler(&self, binding: u32, _texture: &Arc<dyn Texture>, _sampler: &Arc<dyn Sampler>) -> Result<()> {
        check_binding(self.layout.desc(), binding, DescriptorType::CombinedImageSampler)?;
        self.writes.lock().unwrap().push((binding, DescriptorType::CombinedImageSampler));
        Ok(())
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

// ============================================================================
// Mock Command List
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum MockRecordState {
    Initial,
    Recording,
    Rendering,
    Ended,
}

/// Records each call by name; mirrors the backend state machine
pub struct MockCommandList {
    state: MockRecordState,
    compute_bound: bool,
    attachments: Vec<(Arc<dyn Texture>, u32, u32)>,
    pub commands: Vec<String>,
}

impl MockCommandList {
    pub fn new() -> Self {
        Self { state: MockRecordState::Initial, compute_bound: false, attachments: Vec::new(), commands: Vec::new() }
    }

    pub fn is_ended(&self) -> bool {
        self.state == MockRecordState::Ended
    }

    fn record(&mut self, name: &str) -> Result<()> {
        if !matches!(self.state, MockRecordState::Recording | MockRecordState::Rendering) {
            return Err(Error::InvalidOperation(format!("{} called outside begin/end", name)));
        }
        self.commands.push(name.to_string());
        Ok(())
    }
}

fn set_mock_layout(texture: &Arc<dyn Texture>, mip: u32, layer: u32, layout: ImageLayout) {
    if let Some(mock) = texture.as_any().downcast_ref::<MockTexture>() {
        mock.set_layout(SubresourceRange::single(mip, layer), layout);
    }
}

impl CommandList for MockCommandList {
    fn begin(&mut self) -> Result<()> {
        if self.state != MockRecordState::Initial && self.state != MockRecordState::Ended {
            return Err(Error::InvalidOperation("begin while recording".to_string()));
        }
        self.state = MockRecordState::Recording;
        self.compute_bound = false;
        self.commands.clear();
        self.commands.push("begin".to_string());
        Ok(())
    }

    fn end(&mut self) -> Result<()> {
        if self.state != MockRecordState::Recording {
            return Err(Error::InvalidOperation("end outside of recording".to_string()));
        }
        self.commands.push("end".to_string());
        self.state = MockRecordState::Ended;
        Ok(())
    }

    fn begin_rendering(
        &mut self,
        color_attachments: &[RenderingAttachment],
        depth_attachment: Option<&RenderingAttachment>,
        _render_area: Rect2D,
    ) -> Result<()> {
        if self.state != MockRecordState::Recording {
            return Err(Error::InvalidOperation("begin_rendering outside of recording".to_string()));
        }
        for a in color_attachments {
            set_mock_layout(&a.texture, a.mip_level, a.array_layer, ImageLayout::ColorAttachment);
            self.attachments.push((a.texture.clone(), a.mip_level, a.array_layer));
        }
        if let Some(d) = depth_attachment {
            set_mock_layout(&d.texture, d.mip_level, d.array_layer, ImageLayout::DepthStencilAttachment);
            self.attachments.push((d.texture.clone(), d.mip_level, d.array_layer));
        }
        self.state = MockRecordState::Rendering;
        self.commands.push("begin_rendering".to_string());
        Ok(())
    }

    fn end_rendering(&mut self) -> Result<()> {
        if self.state != MockRecordState::Rendering {
            return Err(Error::InvalidOperation("end_rendering without begin_rendering".to_string()));
        }
        for (texture, mip, layer) in self.attachments.drain(..) {
            let terminal = if texture.is_swapchain_image() { ImageLayout::PresentSrc } else { ImageLayout::ShaderReadOnly };
            set_mock_layout(&texture, mip, layer, terminal);
        }
        self.state = MockRecordState::Recording;
        self.commands.push("end_rendering".to_string());
        Ok(())
    }

    fn set_viewport(&mut self, _viewport: Viewport) -> Result<()> {
        self.record("set_viewport")
    }

    fn set_scissor(&mut self, _scissor: Rect2D) -> Result<()> {
        self.record("set_scissor")
    }

    fn bind_pipeline(&mut self, pipeline: &Arc<dyn Pipeline>) -> Result<()> {
        self.record("bind_pipeline")?;
        self.compute_bound = pipeline.bind_point() == PipelineBindPoint::Compute;
        Ok(())
    }

    fn bind_descriptor_set(&mut self, _pipeline: &Arc<dyn Pipeline>, _set_index: u32, _set: &Arc<dyn DescriptorSet>) -> Result<()> {
        self.record("bind_descriptor_set")
    }

    fn push_constants(&mut self, _pipeline: &Arc<dyn Pipeline>, _stages: ShaderStageFlags, _offset: u32, _data: &[u8]) -> Result<()> {
        self.record("push_constants")
    }

    fn bind_vertex_buffer(&mut self, _binding: u32, _buffer: &Arc<dyn Buffer>, _offset: u64) -> Result<()> {
        self.record("bind_vertex_buffer")
    }

    fn bind_index_buffer(&mut self, _buffer: &Arc<dyn Buffer>, _offset: u64, _index_type: IndexType) -> Result<()> {
        self.record("bind_index_buffer")
    }

    fn draw(&mut self, _vertex_count: u32, _instance_count: u32, _first_vertex: u32, _first_instance: u32) -> Result<()> {
        self.record("draw")
    }

    fn draw_indexed(&mut self, _index_count: u32, _instance_count: u32, _first_index: u32, _vertex_offset: i32, _first_instance: u32) -> Result<()> {
        self.record("draw_indexed")
    }

    fn dispatch(&mut self, _x: u32, _y: u32, _z: u32) -> Result<()> {
        if self.state != MockRecordState::Recording {
            return Err(Error::InvalidOperation("dispatch outside of recording or inside rendering".to_string()));
        }
        if !self.compute_bound {
            return Err(Error::InvalidOperation("dispatch without a compute pipeline".to_string()));
        }
        self.record("dispatch")
    }

    fn transition_image_layout(&mut self, texture: &Arc<dyn Texture>, new_layout: ImageLayout, range: SubresourceRange) -> Result<()> {
        self.record("transition_image_layout")?;
        if let Some(mock) = texture.as_any().downcast_ref::<MockTexture>() {
            mock.set_layout(range, new_layout);
        }
        Ok(())
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

// ============================================================================
// Mock Graphics Device
// ============================================================================

pub struct MockGraphicsDevice {
    pub max_frames_in_flight: usize,
    frame_index: usize,
    image_index: usize,
    back_buffers: Vec<Arc<MockTexture>>,
    depth: Arc<MockTexture>,
    frame_open: bool,
    /// Number of upcoming `begin_frame` calls that report `Skipped`
    pub skip_next_frames: u32,
    /// Returned by the next `begin_frame` instead of a frame
    pub fail_next_frame: Option<Error>,
    /// Returned by the next `create_command_list`
    pub fail_next_command_list: Option<Error>,
    /// Returned by the next `submit_command_lists`
    pub fail_next_submit: Option<Error>,
    pub abandoned_frames: u32,
    /// Uploads not yet flushed
    pub pending_uploads: u32,
    pub transfer_flushes: u32,
    /// Command logs of every submitted list, in submission order
    pub submitted: Vec<Vec<String>>,
    pub created_buffers: usize,
    pub created_textures: usize,
    pub uploaded_bytes: u64,
    stats: GraphicsDeviceStats,
}

impl MockGraphicsDevice {
    pub fn new() -> Self {
        let depth_desc = TextureDesc::new_2d(800, 600, TextureFormat::D32_FLOAT, TextureUsage::DEPTH_STENCIL_ATTACHMENT);
        Self {
            max_frames_in_flight: 2,
            frame_index: 0,
            image_index: 0,
            back_buffers: (0..3).map(|_| Arc::new(MockTexture::swapchain(800, 600))).collect(),
            depth: Arc::new(MockTexture::new(&depth_desc)),
            frame_open: false,
            skip_next_frames: 0,
            fail_next_frame: None,
            fail_next_command_list: None,
            fail_next_submit: None,
            abandoned_frames: 0,
            pending_uploads: 0,
            transfer_flushes: 0,
            submitted: Vec::new(),
            created_buffers: 0,
            created_textures: 0,
            uploaded_bytes: 0,
            stats: GraphicsDeviceStats::default(),
        }
    }

    pub fn back_buffer_mock(&self, index: usize) -> Arc<MockTexture> {
        self.back_buffers[index].clone()
    }

    fn flush(&mut self) {
        if self.pending_uploads > 0 {
            self.pending_uploads = 0;
            self.transfer_flushes += 1;
        }
    }
}

impl GraphicsDevice for MockGraphicsDevice {
    fn create_buffer(&mut self, desc: BufferDesc) -> Result<Arc<dyn Buffer>> {
        if desc.size == 0 {
            return Err(Error::InvalidResource("buffer size must be non-zero".to_string()));
        }
        self.created_buffers += 1;
        Ok(Arc::new(MockBuffer::new(desc)))
    }

    fn create_and_upload_buffer(&mut self, mut desc: BufferDesc, data: &[u8]) -> Result<Arc<dyn Buffer>> {
        if data.len() as u64 > desc.size {
            return Err(Error::InvalidResource("upload larger than buffer".to_string()));
        }
        desc.usage |= BufferUsage::TRANSFER_DST;
        self.uploaded_bytes += data.len() as u64;
        self.pending_uploads += 1;
        self.create_buffer(desc)
    }

    fn create_texture_2d(&mut self, desc: TextureDesc) -> Result<Arc<dyn Texture>> {
        if desc.width == 0 || desc.height == 0 {
            return Err(Error::InvalidResource("texture extent must be non-zero".to_string()));
        }
        self.created_textures += 1;
        Ok(Arc::new(MockTexture::new(&desc)))
    }

    fn create_and_upload_texture(&mut self, desc: TextureDesc, data: &[u8]) -> Result<Arc<dyn Texture>> {
        let expected = desc.level0_size() * desc.array_layers.max(1) as u64;
        if data.len() as u64 != expected {
            return Err(Error::InvalidResource(format!("expected {} bytes of texel data, got {}", expected, data.len())));
        }
        self.uploaded_bytes += data.len() as u64;
        self.pending_uploads += 1;
        let texture = Arc::new(MockTexture::new(&desc));
        texture.set_layout(texture.info.full_range(), ImageLayout::ShaderReadOnly);
        self.created_textures += 1;
        Ok(texture)
    }

    fn create_sampler(&mut self, desc: SamplerDesc) -> Result<Arc<dyn Sampler>> {
        Ok(Arc::new(MockSampler { desc }))
    }

    fn create_shader(&mut self, desc: ShaderDesc) -> Result<Arc<dyn Shader>> {
        if desc.code.is_empty() || desc.code.len() % 4 != 0 {
            return Err(Error::InvalidResource("shader bytecode must be a non-empty multiple of 4 bytes".to_string()));
        }
        Ok(Arc::new(MockShader::new(desc.stage, desc.code)))
    }

    fn create_graphics_pipeline(&mut self, desc: PipelineDesc) -> Result<Arc<dyn Pipeline>> {
        desc.vertex_layout.validate().map_err(Error::InvalidResource)?;
        Ok(Arc::new(MockPipeline {
            bind_point: PipelineBindPoint::Graphics,
            push_constant_ranges: desc.push_constant_ranges.clone(),
            set_count: desc.descriptor_set_layouts.len() as u32,
        }))
    }

    fn create_compute_pipeline(&mut self, desc: ComputePipelineDesc) -> Result<Arc<dyn Pipeline>> {
        if desc.shader.stage() != ShaderStage::Compute {
            return Err(Error::InvalidResource(format!("compute pipeline needs a compute shader, got {:?}", desc.shader.stage())));
        }
        Ok(Arc::new(MockPipeline {
            bind_point: PipelineBindPoint::Compute,
            push_constant_ranges: desc.push_constant_ranges,
            set_count: desc.descriptor_set_layouts.len() as u32,
        }))
    }

    fn create_descriptor_set_layout(&mut self, desc: DescriptorSetLayoutDesc) -> Result<Arc<dyn DescriptorSetLayout>> {
        desc.validate()?;
        Ok(Arc::new(MockDescriptorSetLayout { desc }))
    }

    fn allocate_descriptor_set(&mut self, layout: &Arc<dyn DescriptorSetLayout>) -> Result<Arc<dyn DescriptorSet>> {
        Ok(Arc::new(MockDescriptorSet { layout: layout.clone(), writes: Mutex::new(Vec::new()) }))
    }

    fn create_command_list(&mut self) -> Result<Box<dyn CommandList>> {
        if let Some(err) = self.fail_next_command_list.take() {
            return Err(err);
        }
        Ok(Box::new(MockCommandList::new()))
    }

    fn submit_command_lists(&mut self, command_lists: &[&dyn CommandList]) -> Result<()> {
        if !self.frame_open {
            return Err(Error::InvalidOperation("submit outside of a frame".to_string()));
        }
        if let Some(err) = self.fail_next_submit.take() {
            return Err(err);
        }
        self.flush();
        for cmd in command_lists {
            let mock = cmd.as_any().downcast_ref::<MockCommandList>()
                .ok_or_else(|| Error::InvalidResource("foreign command list".to_string()))?;
            if !mock.is_ended() {
                return Err(Error::InvalidOperation("command list was not ended".to_string()));
            }
            self.submitted.push(mock.commands.clone());
        }
        Ok(())
    }

    fn begin_frame(&mut self) -> Result<FrameBegin> {
        if let Some(err) = self.fail_next_frame.take() {
            return Err(err);
        }
        if self.frame_open {
            return Err(Error::InvalidOperation("begin_frame while a frame is open".to_string()));
        }
        self.flush();
        if self.skip_next_frames > 0 {
            self.skip_next_frames -= 1;
            self.stats.frames_skipped += 1;
            self.stats.swapchain_recreations += 1;
            return Ok(FrameBegin::Skipped);
        }
        self.frame_open = true;
        self.stats.frames_begun += 1;
        Ok(FrameBegin::Ready)
    }

    fn present(&mut self) -> Result<()> {
        if !self.frame_open {
            return Err(Error::InvalidOperation("present without begin_frame".to_string()));
        }
        self.frame_open = false;
        self.stats.frames_presented += 1;
        self.image_index = (self.image_index + 1) % self.back_buffers.len();
        self.frame_index = (self.frame_index + 1) % self.max_frames_in_flight;
        Ok(())
    }

    fn abandon_frame(&mut self) -> Result<()> {
        if self.frame_open {
            self.frame_open = false;
            self.abandoned_frames += 1;
            self.stats.frames_abandoned += 1;
        }
        Ok(())
    }

    fn current_back_buffer(&self) -> Result<Arc<dyn Texture>> {
        Ok(self.back_buffers[self.image_index].clone())
    }

    fn depth_buffer(&self) -> Option<Arc<dyn Texture>> {
        Some(self.depth.clone())
    }

    fn current_frame_index(&self) -> usize {
        self.frame_index
    }

    fn resize(&mut self, _width: u32, _height: u32) {}

    fn swapchain_extent(&self) -> (u32, u32) {
        (800, 600)
    }

    fn swapchain_format(&self) -> TextureFormat {
        TextureFormat::B8G8R8A8_SRGB
    }

    fn depth_format(&self) -> TextureFormat {
        TextureFormat::D32_FLOAT
    }

    fn flush_transfers(&self) -> Result<()> {
        // Pending uploads are drained by the next begin_frame or submit
        Ok(())
    }

    fn wait_idle(&self) -> Result<()> {
        Ok(())
    }

    fn stats(&self) -> GraphicsDeviceStats {
        self.stats
    }
}

#[cfg(test)]
#[path = "mock_graphics_device_tests.rs"]
mod tests;
