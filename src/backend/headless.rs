//! Headless backend that records commands instead of talking to a GPU.
//!
//! Buffer contents are kept in memory so writes and copies can be inspected,
//! and failures can be injected to exercise the recovery paths of the frame loop.

use crate::backend::traits::*;
use crate::backend::types::*;
use std::collections::{HashMap, VecDeque};
use std::ops::Range;

/// A command captured by the headless backend, in recording order.
#[derive(Debug, Clone, PartialEq)]
pub enum RecordedCommand {
    BeginRenderPass {
        label: Option<String>,
        color_views: Vec<TextureViewHandle>,
        color_loads: Vec<LoadOp>,
        depth_load: Option<LoadOp>,
    },
    EndRenderPass,
    SetPipeline(RenderPipelineHandle),
    SetBindGroup {
        index: u32,
        bind_group: BindGroupHandle,
        offsets: Vec<u32>,
    },
    SetVertexBuffer {
        slot: u32,
        buffer: BufferHandle,
        offset: u64,
    },
    SetIndexBuffer {
        buffer: BufferHandle,
        offset: u64,
    },
    Draw {
        vertices: Range<u32>,
        instances: Range<u32>,
    },
    DrawIndexed {
        indices: Range<u32>,
        instances: Range<u32>,
    },
    WriteBuffer {
        buffer: BufferHandle,
        offset: u64,
        size: u64,
    },
    CopyBufferToBuffer {
        src: BufferHandle,
        dst: BufferHandle,
        size: u64,
    },
    CopyBufferToTexture {
        src: BufferHandle,
        dst: TextureHandle,
    },
    Submit(SubmissionIndex),
    Present,
}

struct BufferRecord {
    desc: BufferDescriptor,
    data: Vec<u8>,
}

/// Backend with no GPU behind it
pub struct HeadlessBackend {
    capabilities: BackendCapabilities,
    surface_size: (u32, u32),
    present_mode: PresentMode,
    configure_count: u32,

    buffers: HashMap<u64, BufferRecord>,
    textures: HashMap<u64, TextureDescriptor>,
    texture_views: HashMap<u64, TextureHandle>,
    samplers: HashMap<u64, SamplerDescriptor>,
    bind_group_layouts: HashMap<u64, Vec<BindGroupLayoutEntry>>,
    bind_groups: HashMap<u64, BindGroupLayoutHandle>,
    render_pipelines: HashMap<u64, Option<String>>,
    next_id: u64,

    commands: Vec<RecordedCommand>,
    recording: bool,
    in_render_pass: bool,
    acquired: Option<TextureViewHandle>,

    next_submission: u64,
    submission_lag: u64,

    // Failure injection
    acquire_failures: VecDeque<BackendError>,
    texture_failures: u32,
    fail_next_submit: bool,
}

impl HeadlessBackend {
    /// Create a headless backend with a surface of the given size
    pub fn new(width: u32, height: u32) -> Self {
        Self {
            capabilities: BackendCapabilities {
                backend: BackendKind::Headless,
                adapter_name: "Headless".to_string(),
                shader_formats: ShaderFormats::WGSL,
                debug_enabled: false,
                min_uniform_buffer_offset_alignment: 256,
                max_texture_dimension_2d: 8192,
            },
            surface_size: (width.max(1), height.max(1)),
            present_mode: PresentMode::Fifo,
            configure_count: 0,
            buffers: HashMap::new(),
            textures: HashMap::new(),
            texture_views: HashMap::new(),
            samplers: HashMap::new(),
            bind_group_layouts: HashMap::new(),
            bind_groups: HashMap::new(),
            render_pipelines: HashMap::new(),
            next_id: 1,
            commands: Vec::new(),
            recording: false,
            in_render_pass: false,
            acquired: None,
            next_submission: 1,
            submission_lag: 0,
            acquire_failures: VecDeque::new(),
            texture_failures: 0,
            fail_next_submit: false,
        }
    }

    pub fn with_min_uniform_alignment(mut self, alignment: u32) -> Self {
        self.capabilities.min_uniform_buffer_offset_alignment = alignment;
        self
    }

    pub fn with_max_texture_dimension(mut self, max: u32) -> Self {
        self.capabilities.max_texture_dimension_2d = max;
        self
    }

    pub fn with_shader_formats(mut self, formats: ShaderFormats) -> Self {
        self.capabilities.shader_formats = formats;
        self
    }

    pub fn with_debug_layers(mut self, enabled: bool) -> Self {
        self.capabilities.debug_enabled = enabled;
        self
    }

    /// Make the next acquires fail with the given errors, in order
    pub fn fail_next_acquire(&mut self, error: BackendError) {
        self.acquire_failures.push_back(error);
    }

    /// Make the next `count` texture creations fail
    pub fn fail_next_texture_creations(&mut self, count: u32) {
        self.texture_failures = count;
    }

    pub fn fail_next_submit(&mut self) {
        self.fail_next_submit = true;
    }

    /// Keep the last `lag` submissions reported as still executing
    pub fn set_submission_lag(&mut self, lag: u64) {
        self.submission_lag = lag;
    }

    pub fn commands(&self) -> &[RecordedCommand] {
        &self.commands
    }

    pub fn take_commands(&mut self) -> Vec<RecordedCommand> {
        std::mem::take(&mut self.commands)
    }

    pub fn clear_commands(&mut self) {
        self.commands.clear();
    }

    /// Number of draw and indexed draw commands recorded so far
    pub fn draw_count(&self) -> usize {
        self.commands
            .iter()
            .filter(|c| matches!(c, RecordedCommand::Draw { .. } | RecordedCommand::DrawIndexed { .. }))
            .count()
    }

    /// Labels of the render passes recorded so far, in order
    pub fn render_pass_labels(&self) -> Vec<String> {
        self.commands
            .iter()
            .filter_map(|c| match c {
                RecordedCommand::BeginRenderPass { label, .. } => {
                    Some(label.clone().unwrap_or_default())
                }
                _ => None,
            })
            .collect()
    }

    pub fn buffer_data(&self, buffer: BufferHandle) -> Option<&[u8]> {
        self.buffers.get(&buffer.0).map(|b| b.data.as_slice())
    }

    pub fn buffer_descriptor(&self, buffer: BufferHandle) -> Option<&BufferDescriptor> {
        self.buffers.get(&buffer.0).map(|b| &b.desc)
    }

    pub fn texture_descriptor(&self, texture: TextureHandle) -> Option<&TextureDescriptor> {
        self.textures.get(&texture.0)
    }

    /// Descriptor of the texture a view was created from
    pub fn view_descriptor(&self, view: TextureViewHandle) -> Option<&TextureDescriptor> {
        self.texture_views
            .get(&view.0)
            .and_then(|texture| self.textures.get(&texture.0))
    }

    pub fn pipeline_label(&self, pipeline: RenderPipelineHandle) -> Option<&str> {
        self.render_pipelines
            .get(&pipeline.0)
            .and_then(|label| label.as_deref())
    }

    pub fn live_buffers(&self) -> usize {
        self.buffers.len()
    }

    pub fn live_textures(&self) -> usize {
        self.textures.len()
    }

    pub fn live_samplers(&self) -> usize {
        self.samplers.len()
    }

    pub fn configure_count(&self) -> u32 {
        self.configure_count
    }

    pub fn present_mode(&self) -> PresentMode {
        self.present_mode
    }

    fn alloc_id(&mut self) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        id
    }

    fn record(&mut self, command: RecordedCommand) {
        log::trace!("HeadlessBackend: {:?}", command);
        self.commands.push(command);
    }

    fn record_in_pass(&mut self, command: RecordedCommand) {
        if !self.in_render_pass {
            log::warn!("HeadlessBackend: {:?} recorded outside of a render pass", command);
            return;
        }
        self.record(command);
    }

    fn completed_submission(&self) -> u64 {
        (self.next_submission - 1).saturating_sub(self.submission_lag)
    }
}

impl GraphicsBackend for HeadlessBackend {
    fn capabilities(&self) -> BackendCapabilities {
        self.capabilities.clone()
    }

    fn configure_surface(&mut self, config: &SurfaceConfiguration) -> BackendResult<(u32, u32)> {
        if config.width == 0 || config.height == 0 {
            return Err(BackendError::SurfaceCreationFailed(format!(
                "surface size must be non-zero, got {}x{}",
                config.width, config.height
            )));
        }
        self.surface_size = clamp_surface_size(
            config.width,
            config.height,
            self.capabilities.max_texture_dimension_2d,
        );
        self.present_mode = config.present_mode;
        self.configure_count += 1;
        Ok(self.surface_size)
    }

    fn surface_size(&self) -> (u32, u32) {
        self.surface_size
    }

    fn swapchain_format(&self) -> TextureFormat {
        TextureFormat::Bgra8UnormSrgb
    }

    fn acquire_next_image(&mut self) -> BackendResult<FrameContext> {
        if let Some(error) = self.acquire_failures.pop_front() {
            return Err(error);
        }
        let view = TextureViewHandle(self.alloc_id());
        self.acquired = Some(view);
        Ok(FrameContext {
            swapchain_view: view,
            width: self.surface_size.0,
            height: self.surface_size.1,
        })
    }

    fn present(&mut self) -> BackendResult<()> {
        if self.acquired.take().is_none() {
            return Err(BackendError::PresentFailed("no acquired image".into()));
        }
        self.record(RecordedCommand::Present);
        Ok(())
    }

    fn begin_commands(&mut self) -> BackendResult<()> {
        if self.recording {
            log::warn!("HeadlessBackend: begin_commands with an open recording");
        }
        self.recording = true;
        Ok(())
    }

    fn discard_commands(&mut self) {
        self.recording = false;
        self.in_render_pass = false;
        self.acquired = None;
    }

    fn submit(&mut self) -> BackendResult<SubmissionIndex> {
        if !self.recording {
            return Err(BackendError::NoCommandRecording);
        }
        self.recording = false;
        self.in_render_pass = false;
        if std::mem::take(&mut self.fail_next_submit) {
            return Err(BackendError::SubmitFailed("injected failure".into()));
        }
        let index = SubmissionIndex(self.next_submission);
        self.next_submission += 1;
        self.record(RecordedCommand::Submit(index));
        Ok(index)
    }

    fn is_submission_complete(&mut self, index: SubmissionIndex) -> bool {
        self.completed_submission() >= index.0
    }

    fn wait_for_submission(&mut self, _index: SubmissionIndex) -> BackendResult<()> {
        // Waiting drains everything that is in flight
        self.submission_lag = 0;
        Ok(())
    }

    fn wait_idle(&mut self) -> BackendResult<()> {
        self.submission_lag = 0;
        Ok(())
    }

    fn create_buffer(&mut self, desc: &BufferDescriptor) -> BackendResult<BufferHandle> {
        log::trace!("HeadlessBackend: creating buffer {:?} (size: {})", desc.label, desc.size);
        let id = self.alloc_id();
        self.buffers.insert(
            id,
            BufferRecord {
                desc: desc.clone(),
                data: vec![0; desc.size as usize],
            },
        );
        Ok(BufferHandle(id))
    }

    fn create_buffer_init(
        &mut self,
        desc: &BufferDescriptor,
        data: &[u8],
    ) -> BackendResult<BufferHandle> {
        let handle = self.create_buffer(desc)?;
        if let Some(record) = self.buffers.get_mut(&handle.0) {
            let len = data.len().min(record.data.len());
            record.data[..len].copy_from_slice(&data[..len]);
        }
        Ok(handle)
    }

    fn write_buffer(&mut self, buffer: BufferHandle, offset: u64, data: &[u8]) {
        let Some(record) = self.buffers.get_mut(&buffer.0) else {
            log::warn!("HeadlessBackend: write to unknown buffer {}", buffer.0);
            return;
        };
        let start = offset as usize;
        let end = start + data.len();
        if end > record.data.len() {
            log::warn!(
                "HeadlessBackend: write of {} bytes at {} overruns buffer {:?}",
                data.len(),
                offset,
                record.desc.label
            );
            return;
        }
        record.data[start..end].copy_from_slice(data);
        self.record(RecordedCommand::WriteBuffer {
            buffer,
            offset,
            size: data.len() as u64,
        });
    }

    fn create_texture(&mut self, desc: &TextureDescriptor) -> BackendResult<TextureHandle> {
        if self.texture_failures > 0 {
            self.texture_failures -= 1;
            return Err(BackendError::TextureCreationFailed(format!(
                "{:?}: injected failure",
                desc.label
            )));
        }
        let max = self.capabilities.max_texture_dimension_2d;
        if desc.width == 0 || desc.height == 0 || desc.width > max || desc.height > max {
            return Err(BackendError::TextureCreationFailed(format!(
                "{:?}: invalid size {}x{}",
                desc.label, desc.width, desc.height
            )));
        }
        log::trace!(
            "HeadlessBackend: creating texture {:?} ({}x{})",
            desc.label,
            desc.width,
            desc.height
        );
        let id = self.alloc_id();
        self.textures.insert(id, desc.clone());
        Ok(TextureHandle(id))
    }

    fn create_texture_view(&mut self, texture: TextureHandle) -> BackendResult<TextureViewHandle> {
        if !self.textures.contains_key(&texture.0) {
            return Err(BackendError::ResourceNotFound(format!("texture {}", texture.0)));
        }
        let id = self.alloc_id();
        self.texture_views.insert(id, texture);
        Ok(TextureViewHandle(id))
    }

    fn write_texture(&mut self, texture: TextureHandle, data: &[u8], width: u32, height: u32) {
        log::trace!(
            "HeadlessBackend: writing {} bytes ({}x{}) to texture {}",
            data.len(),
            width,
            height,
            texture.0
        );
    }

    fn create_sampler(&mut self, desc: &SamplerDescriptor) -> BackendResult<SamplerHandle> {
        log::trace!("HeadlessBackend: creating sampler {:?}", desc.label);
        let id = self.alloc_id();
        self.samplers.insert(id, desc.clone());
        Ok(SamplerHandle(id))
    }

    fn create_bind_group_layout(
        &mut self,
        entries: &[BindGroupLayoutEntry],
    ) -> BackendResult<BindGroupLayoutHandle> {
        let id = self.alloc_id();
        self.bind_group_layouts.insert(id, entries.to_vec());
        Ok(BindGroupLayoutHandle(id))
    }

    fn create_bind_group(
        &mut self,
        layout: BindGroupLayoutHandle,
        entries: &[(u32, BindGroupEntry)],
    ) -> BackendResult<BindGroupHandle> {
        let Some(layout_entries) = self.bind_group_layouts.get(&layout.0) else {
            return Err(BackendError::ResourceNotFound(format!("bind group layout {}", layout.0)));
        };
        if layout_entries.len() != entries.len() {
            return Err(BackendError::ResourceNotFound(format!(
                "bind group expects {} entries, got {}",
                layout_entries.len(),
                entries.len()
            )));
        }
        for (_, entry) in entries {
            let known = match entry {
                BindGroupEntry::Buffer { buffer, .. } => self.buffers.contains_key(&buffer.0),
                BindGroupEntry::Texture(view) => self.texture_views.contains_key(&view.0),
                BindGroupEntry::Sampler(sampler) => self.samplers.contains_key(&sampler.0),
            };
            if !known {
                return Err(BackendError::ResourceNotFound(format!("{:?}", entry)));
            }
        }
        let id = self.alloc_id();
        self.bind_groups.insert(id, layout);
        Ok(BindGroupHandle(id))
    }

    fn create_render_pipeline(
        &mut self,
        desc: &RenderPipelineDescriptor,
    ) -> BackendResult<RenderPipelineHandle> {
        if !desc.vertex_shader.contains("vs_main") {
            return Err(BackendError::PipelineCreationFailed(format!(
                "{:?}: missing vs_main entry point",
                desc.label
            )));
        }
        let id = self.alloc_id();
        self.render_pipelines.insert(id, desc.label.clone());
        Ok(RenderPipelineHandle(id))
    }

    fn copy_buffer_to_buffer(
        &mut self,
        src: BufferHandle,
        src_offset: u64,
        dst: BufferHandle,
        dst_offset: u64,
        size: u64,
    ) {
        if self.in_render_pass {
            log::warn!("HeadlessBackend: buffer copy recorded inside a render pass");
        }
        let Some(bytes) = self.buffers.get(&src.0).and_then(|record| {
            record
                .data
                .get(src_offset as usize..(src_offset + size) as usize)
                .map(|slice| slice.to_vec())
        }) else {
            log::warn!("HeadlessBackend: copy source out of range");
            return;
        };
        let Some(target) = self.buffers.get_mut(&dst.0).and_then(|record| {
            record
                .data
                .get_mut(dst_offset as usize..(dst_offset + size) as usize)
        }) else {
            log::warn!("HeadlessBackend: copy destination out of range");
            return;
        };
        target.copy_from_slice(&bytes);
        self.record(RecordedCommand::CopyBufferToBuffer { src, dst, size });
    }

    fn copy_buffer_to_texture(
        &mut self,
        src: BufferHandle,
        _src_offset: u64,
        _bytes_per_row: u32,
        dst: TextureHandle,
        _width: u32,
        _height: u32,
    ) {
        self.record(RecordedCommand::CopyBufferToTexture { src, dst });
    }

    fn begin_render_pass(&mut self, desc: &RenderPassDescriptor) {
        if self.in_render_pass {
            log::warn!("HeadlessBackend: begin_render_pass while another pass is open");
            self.end_render_pass();
        }
        self.in_render_pass = true;
        self.record(RecordedCommand::BeginRenderPass {
            label: desc.label.clone(),
            color_views: desc.color_attachments.iter().map(|a| a.view).collect(),
            color_loads: desc.color_attachments.iter().map(|a| a.load_op.clone()).collect(),
            depth_load: desc
                .depth_stencil_attachment
                .as_ref()
                .map(|d| d.depth_load_op.clone()),
        });
    }

    fn end_render_pass(&mut self) {
        if self.in_render_pass {
            self.in_render_pass = false;
            self.record(RecordedCommand::EndRenderPass);
        }
    }

    fn set_render_pipeline(&mut self, pipeline: RenderPipelineHandle) {
        self.record_in_pass(RecordedCommand::SetPipeline(pipeline));
    }

    fn set_bind_group(&mut self, index: u32, bind_group: BindGroupHandle, dynamic_offsets: &[u32]) {
        self.record_in_pass(RecordedCommand::SetBindGroup {
            index,
            bind_group,
            offsets: dynamic_offsets.to_vec(),
        });
    }

    fn set_vertex_buffer(&mut self, slot: u32, buffer: BufferHandle, offset: u64) {
        self.record_in_pass(RecordedCommand::SetVertexBuffer { slot, buffer, offset });
    }

    fn set_index_buffer(&mut self, buffer: BufferHandle, offset: u64, _format: IndexFormat) {
        self.record_in_pass(RecordedCommand::SetIndexBuffer { buffer, offset });
    }

    fn draw(&mut self, vertices: Range<u32>, instances: Range<u32>) {
        self.record_in_pass(RecordedCommand::Draw { vertices, instances });
    }

    fn draw_indexed(&mut self, indices: Range<u32>, _base_vertex: i32, instances: Range<u32>) {
        self.record_in_pass(RecordedCommand::DrawIndexed { indices, instances });
    }

    fn destroy_buffer(&mut self, buffer: BufferHandle) {
        self.buffers.remove(&buffer.0);
    }

    fn destroy_texture(&mut self, texture: TextureHandle) {
        self.textures.remove(&texture.0);
    }

    fn destroy_texture_view(&mut self, view: TextureViewHandle) {
        self.texture_views.remove(&view.0);
    }

    fn destroy_sampler(&mut self, sampler: SamplerHandle) {
        self.samplers.remove(&sampler.0);
    }

    fn destroy_bind_group(&mut self, bind_group: BindGroupHandle) {
        self.bind_groups.remove(&bind_group.0);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_copy_between_buffers_moves_bytes() {
        let mut backend = HeadlessBackend::new(64, 64);
        let usage = BufferUsage::COPY_SRC | BufferUsage::COPY_DST;
        let src = backend
            .create_buffer_init(&BufferDescriptor::new("src", 8, usage), &[1, 2, 3, 4, 5, 6, 7, 8])
            .unwrap();
        let dst = backend.create_buffer(&BufferDescriptor::new("dst", 8, usage)).unwrap();

        backend.begin_commands().unwrap();
        backend.copy_buffer_to_buffer(src, 2, dst, 4, 4);

        assert_eq!(backend.buffer_data(dst).unwrap(), &[0, 0, 0, 0, 3, 4, 5, 6]);
    }

    #[test]
    fn test_submission_lag_keeps_work_in_flight() {
        let mut backend = HeadlessBackend::new(64, 64);
        backend.set_submission_lag(1);

        backend.begin_commands().unwrap();
        let first = backend.submit().unwrap();
        assert!(!backend.is_submission_complete(first));

        backend.begin_commands().unwrap();
        let second = backend.submit().unwrap();
        assert!(backend.is_submission_complete(first));
        assert!(!backend.is_submission_complete(second));

        backend.wait_for_submission(second).unwrap();
        assert!(backend.is_submission_complete(second));
    }

    #[test]
    fn test_injected_acquire_failure_is_consumed_once() {
        let mut backend = HeadlessBackend::new(64, 64);
        backend.fail_next_acquire(BackendError::SurfaceOutdated);

        assert_eq!(backend.acquire_next_image().unwrap_err(), BackendError::SurfaceOutdated);
        assert!(backend.acquire_next_image().is_ok());
    }

    #[test]
    fn test_draws_outside_pass_are_not_recorded() {
        let mut backend = HeadlessBackend::new(64, 64);
        backend.begin_commands().unwrap();
        backend.draw(0..3, 0..1);
        assert_eq!(backend.draw_count(), 0);
    }
}
