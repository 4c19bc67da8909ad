//! Per-model instance arrays with chunked culling

use crate::backend::{
    BufferDescriptor, BufferHandle, BufferUsage, GraphicsBackend, VertexAttribute, VertexBufferLayout,
    VertexFormat, VertexStepMode,
};
use crate::error::RenderResult;
use crate::resources::frame_pool::{FrameResourcePool, UploadPath};
use crate::scene::{Aabb, Frustum};
use bytemuck::{Pod, Zeroable};
use glam::{Mat4, Vec4};
use std::collections::HashMap;
use thiserror::Error;

/// Identity of a renderable model type (a building kind, a terrain tile kind, ...)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ModelId(pub u32);

/// Per-instance data, read by the vertex shader at step rate "instance".
///
/// 64 B transform, 16 B color, 16 B emissive, 4 B ambient override, 12 B padding.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Pod, Zeroable)]
pub struct InstanceRecord {
    pub transform: Mat4,
    pub color: Vec4,
    /// rgb = emissive color, a = intensity
    pub emissive: Vec4,
    /// Negative means "use the scene ambient"
    pub ambient_override: f32,
    pub _padding: [f32; 3],
}

static_assertions::const_assert_eq!(std::mem::size_of::<InstanceRecord>(), 112);

impl InstanceRecord {
    pub fn new(transform: Mat4, color: Vec4, emissive: Vec4) -> Self {
        Self {
            transform,
            color,
            emissive,
            ambient_override: -1.0,
            _padding: [0.0; 3],
        }
    }

    pub fn with_ambient_override(mut self, ambient: f32) -> Self {
        self.ambient_override = ambient.max(0.0);
        self
    }

    pub fn ambient_override(&self) -> Option<f32> {
        (self.ambient_override >= 0.0).then_some(self.ambient_override)
    }

    /// Vertex layout at shader locations 3..=9
    pub fn layout() -> VertexBufferLayout {
        let vec4 = |location: u32, offset: u64| VertexAttribute {
            location,
            format: VertexFormat::Float32x4,
            offset,
        };
        VertexBufferLayout {
            array_stride: std::mem::size_of::<Self>() as u64,
            step_mode: VertexStepMode::Instance,
            attributes: vec![
                vec4(3, 0),
                vec4(4, 16),
                vec4(5, 32),
                vec4(6, 48),
                vec4(7, 64),
                vec4(8, 80),
                VertexAttribute {
                    location: 9,
                    format: VertexFormat::Float32,
                    offset: 96,
                },
            ],
        }
    }
}

/// Returned by `InstanceBuffer::add` when the buffer is full
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("instance buffer full ({capacity} instances)")]
pub struct CapacityExceeded {
    pub capacity: u32,
}

/// A contiguous range of instances culled as a unit
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct InstanceChunk {
    pub start: u32,
    pub count: u32,
    pub bounds: Aabb,
    pub visible: bool,
}

/// GPU array of instance records for one model
pub struct InstanceBuffer {
    buffer: BufferHandle,
    capacity: u32,
    records: Vec<InstanceRecord>,
    chunk_size: Option<u32>,
    chunks: Vec<InstanceChunk>,
    chunks_dirty: bool,
    local_bounds: Aabb,
    dropped: u64,
    uploaded: u32,
}

impl InstanceBuffer {
    /// `chunk_size` of `None` disables chunking; the whole buffer is drawn at once
    pub fn create(
        backend: &mut dyn GraphicsBackend,
        label: &str,
        capacity: u32,
        chunk_size: Option<u32>,
        local_bounds: Aabb,
    ) -> RenderResult<Self> {
        let size = (capacity.max(1) as u64) * std::mem::size_of::<InstanceRecord>() as u64;
        let buffer = backend.create_buffer(&BufferDescriptor::new(
            format!("{label}_instances"),
            size,
            BufferUsage::VERTEX | BufferUsage::COPY_DST,
        ))?;
        Ok(Self {
            buffer,
            capacity,
            records: Vec::with_capacity(capacity as usize),
            chunk_size: chunk_size.filter(|size| *size > 0),
            chunks: Vec::new(),
            chunks_dirty: false,
            local_bounds,
            dropped: 0,
            uploaded: 0,
        })
    }

    /// Clear the CPU-side list for a new frame
    pub fn begin(&mut self) {
        self.records.clear();
        self.chunks_dirty = true;
    }

    /// Append one instance; a full buffer rejects it and counts the drop
    pub fn add(&mut self, record: InstanceRecord) -> Result<u32, CapacityExceeded> {
        if self.records.len() as u32 >= self.capacity {
            self.dropped += 1;
            return Err(CapacityExceeded {
                capacity: self.capacity,
            });
        }
        self.records.push(record);
        self.chunks_dirty = true;
        Ok(self.records.len() as u32 - 1)
    }

    /// Upload this frame's records, staged through the frame pool when it has room
    pub fn end(&mut self, backend: &mut dyn GraphicsBackend, frame_pool: &mut FrameResourcePool) -> UploadPath {
        if self.chunks_dirty {
            self.rebuild_chunks();
        }
        self.uploaded = self.records.len() as u32;
        if self.records.is_empty() {
            return UploadPath::Staged;
        }
        frame_pool.stage_buffer_upload(backend, self.buffer, 0, bytemuck::cast_slice(&self.records))
    }

    /// Partition the instances into fixed-size chunks and recompute their bounds
    pub fn rebuild_chunks(&mut self) {
        self.chunks.clear();
        self.chunks_dirty = false;
        let Some(chunk_size) = self.chunk_size else {
            return;
        };
        for (i, group) in self.records.chunks(chunk_size as usize).enumerate() {
            let bounds = group.iter().fold(Aabb::EMPTY, |acc, record| {
                acc.union(&self.local_bounds.transformed(&record.transform))
            });
            self.chunks.push(InstanceChunk {
                start: i as u32 * chunk_size,
                count: group.len() as u32,
                bounds,
                visible: true,
            });
        }
    }

    /// Mark chunks entirely outside the frustum invisible. Returns (visible, culled).
    pub fn update_chunk_visibility(&mut self, frustum: &Frustum) -> (u32, u32) {
        if self.chunks_dirty {
            self.rebuild_chunks();
        }
        let mut visible = 0;
        let mut culled = 0;
        for chunk in &mut self.chunks {
            chunk.visible = frustum.intersects_aabb(&chunk.bounds);
            if chunk.visible {
                visible += 1;
            } else {
                culled += 1;
            }
        }
        (visible, culled)
    }

    /// Instance ranges to draw: visible chunks, or everything when chunking is off
    pub fn draw_ranges(&self) -> Vec<std::ops::Range<u32>> {
        if self.chunk_size.is_none() {
            if self.uploaded == 0 {
                return Vec::new();
            }
            return vec![0..self.uploaded];
        }
        self.chunks
            .iter()
            .filter(|c| c.visible && c.start + c.count <= self.uploaded)
            .map(|c| c.start..c.start + c.count)
            .collect()
    }

    /// Records that reached the GPU at the last `end`
    pub fn uploaded_count(&self) -> u32 {
        self.uploaded
    }

    pub fn instance_count(&self) -> u32 {
        self.records.len() as u32
    }

    pub fn capacity(&self) -> u32 {
        self.capacity
    }

    pub fn records(&self) -> &[InstanceRecord] {
        &self.records
    }

    pub fn chunks(&self) -> &[InstanceChunk] {
        &self.chunks
    }

    pub fn is_chunked(&self) -> bool {
        self.chunk_size.is_some()
    }

    pub fn dropped_count(&self) -> u64 {
        self.dropped
    }

    pub fn buffer(&self) -> BufferHandle {
        self.buffer
    }

    pub fn destroy(self, backend: &mut dyn GraphicsBackend) {
        backend.destroy_buffer(self.buffer);
    }
}

/// One `InstanceBuffer` per model, created on first use
#[derive(Default)]
pub struct InstanceBufferPool {
    buffers: HashMap<ModelId, InstanceBuffer>,
}

impl InstanceBufferPool {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get_or_create(
        &mut self,
        backend: &mut dyn GraphicsBackend,
        id: ModelId,
        capacity: u32,
        chunk_size: Option<u32>,
        local_bounds: Aabb,
    ) -> RenderResult<&mut InstanceBuffer> {
        if !self.buffers.contains_key(&id) {
            let buffer = InstanceBuffer::create(
                backend,
                &format!("model_{}", id.0),
                capacity,
                chunk_size,
                local_bounds,
            )?;
            log::debug!("Created instance buffer for model {} (capacity {})", id.0, capacity);
            self.buffers.insert(id, buffer);
        }
        // Inserted above when missing
        self.buffers
            .get_mut(&id)
            .ok_or(crate::error::RenderError::UnknownModel(id.0))
    }

    /// Insert a freshly created buffer, destroying any previous one for the model
    pub fn replace(&mut self, backend: &mut dyn GraphicsBackend, id: ModelId, buffer: InstanceBuffer) {
        if let Some(old) = self.buffers.insert(id, buffer) {
            old.destroy(backend);
        }
    }

    pub fn get(&self, id: ModelId) -> Option<&InstanceBuffer> {
        self.buffers.get(&id)
    }

    pub fn get_mut(&mut self, id: ModelId) -> Option<&mut InstanceBuffer> {
        self.buffers.get_mut(&id)
    }

    pub fn remove(&mut self, backend: &mut dyn GraphicsBackend, id: ModelId) -> bool {
        match self.buffers.remove(&id) {
            Some(buffer) => {
                buffer.destroy(backend);
                true
            }
            None => false,
        }
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = (&ModelId, &mut InstanceBuffer)> {
        self.buffers.iter_mut()
    }

    pub fn len(&self) -> usize {
        self.buffers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffers.is_empty()
    }

    pub fn release_all(&mut self, backend: &mut dyn GraphicsBackend) {
        for (_, buffer) in self.buffers.drain() {
            buffer.destroy(backend);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::HeadlessBackend;
    use crate::config::FramePoolConfig;
    use glam::Vec3;

    fn unit_bounds() -> Aabb {
        Aabb::from_center_half_extents(Vec3::ZERO, Vec3::splat(0.5))
    }

    fn record_at(x: f32) -> InstanceRecord {
        InstanceRecord::new(Mat4::from_translation(Vec3::new(x, 0.0, 0.0)), Vec4::ONE, Vec4::ZERO)
    }

    #[test]
    fn test_add_beyond_capacity_fails_without_corrupting() {
        let mut backend = HeadlessBackend::new(64, 64);
        let mut buffer = InstanceBuffer::create(&mut backend, "test", 4, None, unit_bounds()).unwrap();
        buffer.begin();
        for i in 0..4 {
            assert_eq!(buffer.add(record_at(i as f32)), Ok(i));
            assert_eq!(buffer.instance_count(), i + 1);
        }
        assert_eq!(buffer.add(record_at(99.0)), Err(CapacityExceeded { capacity: 4 }));
        assert_eq!(buffer.instance_count(), 4);
        assert_eq!(buffer.dropped_count(), 1);
        assert_eq!(buffer.records()[3], record_at(3.0));
    }

    #[test]
    fn test_chunks_partition_instances() {
        let mut backend = HeadlessBackend::new(64, 64);
        let mut buffer = InstanceBuffer::create(&mut backend, "test", 16, Some(4), unit_bounds()).unwrap();
        buffer.begin();
        for i in 0..10 {
            buffer.add(record_at(i as f32 * 10.0)).unwrap();
        }
        buffer.rebuild_chunks();

        let counts: Vec<u32> = buffer.chunks().iter().map(|c| c.count).collect();
        assert_eq!(counts, vec![4, 4, 2]);
        let first = buffer.chunks()[0].bounds;
        assert_eq!(first.min.x, -0.5);
        assert_eq!(first.max.x, 30.5);
    }

    #[test]
    fn test_culling_hides_chunks_outside_view() {
        let mut backend = HeadlessBackend::new(64, 64);
        let mut pool = FrameResourcePool::new(&mut backend, &FramePoolConfig::default()).unwrap();
        let mut buffer = InstanceBuffer::create(&mut backend, "test", 8, Some(2), unit_bounds()).unwrap();
        buffer.begin();
        // Two instances in front of the camera, two far behind it
        for x in [0.0, 1.0] {
            buffer.add(record_at(x)).unwrap();
        }
        for z in [500.0, 501.0] {
            buffer
                .add(InstanceRecord::new(
                    Mat4::from_translation(Vec3::new(0.0, 0.0, z)),
                    Vec4::ONE,
                    Vec4::ZERO,
                ))
                .unwrap();
        }
        pool.begin_frame(&mut backend);
        buffer.end(&mut backend, &mut pool);

        let view = Mat4::look_at_rh(Vec3::new(0.0, 5.0, 20.0), Vec3::ZERO, Vec3::Y);
        let proj = Mat4::perspective_rh(1.0, 1.0, 0.1, 100.0);
        let frustum = Frustum::from_view_projection(&(proj * view));

        assert_eq!(buffer.update_chunk_visibility(&frustum), (1, 1));
        assert_eq!(buffer.draw_ranges(), vec![0..2]);
    }

    #[test]
    fn test_unchunked_buffer_draws_everything() {
        let mut backend = HeadlessBackend::new(64, 64);
        let mut pool = FrameResourcePool::new(&mut backend, &FramePoolConfig::default()).unwrap();
        let mut buffer = InstanceBuffer::create(&mut backend, "test", 8, None, unit_bounds()).unwrap();
        buffer.begin();
        for i in 0..3 {
            buffer.add(record_at(i as f32)).unwrap();
        }
        pool.begin_frame(&mut backend);
        buffer.end(&mut backend, &mut pool);
        assert_eq!(buffer.draw_ranges(), vec![0..3]);
    }

    #[test]
    fn test_pool_creates_lazily() {
        let mut backend = HeadlessBackend::new(64, 64);
        let mut pool = InstanceBufferPool::new();
        assert!(pool.get(ModelId(7)).is_none());
        pool.get_or_create(&mut backend, ModelId(7), 16, None, unit_bounds())
            .unwrap();
        pool.get_or_create(&mut backend, ModelId(7), 16, None, unit_bounds())
            .unwrap();
        assert_eq!(pool.len(), 1);
        assert_eq!(backend.live_buffers(), 1);
    }
}
