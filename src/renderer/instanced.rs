//! Batched instanced rendering
//!
//! Each registered model type owns one instance buffer. Per frame the simulation
//! appends instances, the renderer uploads them in bulk, culls chunks against the
//! camera frustum and issues one instanced draw per visible chunk. Thousands of
//! terrain tiles or buildings therefore cost a handful of draws per model type.

use crate::backend::GraphicsBackend;
use crate::config::InstanceConfig;
use crate::error::{LastError, RenderError, RenderResult};
use crate::renderer::state::RenderPassState;
use crate::resources::{
    AssetRegistry, FrameResourcePool, GpuMesh, InstanceBuffer, InstanceBufferPool, InstanceRecord, MaterialHandle,
    MeshHandle, ModelId,
};
use crate::scene::Frustum;
use glam::{Mat4, Vec4};
use std::collections::BTreeMap;
use std::ops::Range;

/// Bind group slot of the material block
pub const MATERIAL_GROUP: u32 = 1;

/// Opaque layers, rendered in declaration order
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum RenderLayer {
    Terrain,
    Buildings,
    Effects,
}

impl RenderLayer {
    pub const ORDER: [RenderLayer; 3] = [RenderLayer::Terrain, RenderLayer::Buildings, RenderLayer::Effects];
}

/// How a model's instances are partitioned for culling
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Chunking {
    /// Renderer-wide setting
    #[default]
    Default,
    Disabled,
    Fixed(u32),
}

/// Mesh and material a model type renders with. Not owned by the renderer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ModelAsset {
    pub mesh: MeshHandle,
    pub material: MaterialHandle,
    pub layer: RenderLayer,
    pub chunking: Chunking,
}

impl ModelAsset {
    pub fn new(mesh: MeshHandle, material: MaterialHandle, layer: RenderLayer) -> Self {
        Self {
            mesh,
            material,
            layer,
            chunking: Chunking::Default,
        }
    }

    pub fn with_chunking(mut self, chunking: Chunking) -> Self {
        self.chunking = chunking;
        self
    }
}

#[derive(Debug, Clone, Copy)]
struct ModelBatch {
    asset: ModelAsset,
}

pub struct InstancedRenderer {
    batches: BTreeMap<ModelId, ModelBatch>,
    instances: InstanceBufferPool,
    config: InstanceConfig,
    frustum: Option<(Mat4, Frustum)>,
    frustum_updates: u64,
    dropped: u64,
    frame_dropped: u64,
    visible_chunks: u32,
    culled_chunks: u32,
    last_error: LastError,
}

impl InstancedRenderer {
    pub fn new(config: &InstanceConfig) -> Self {
        Self {
            batches: BTreeMap::new(),
            instances: InstanceBufferPool::new(),
            config: config.clone(),
            frustum: None,
            frustum_updates: 0,
            dropped: 0,
            frame_dropped: 0,
            visible_chunks: 0,
            culled_chunks: 0,
            last_error: LastError::new(),
        }
    }

    fn chunk_size(&self, chunking: Chunking) -> Option<u32> {
        match chunking {
            Chunking::Default => self
                .config
                .chunking_enabled
                .then_some(self.config.default_chunk_size),
            Chunking::Disabled => None,
            Chunking::Fixed(size) => Some(size),
        }
    }

    /// Bind a model identity to its assets and create its instance buffer.
    ///
    /// Registering an id again replaces the previous binding and buffer.
    pub fn register_model(
        &mut self,
        backend: &mut dyn GraphicsBackend,
        assets: &AssetRegistry,
        id: ModelId,
        asset: ModelAsset,
        capacity: u32,
    ) -> RenderResult<()> {
        let mesh: &GpuMesh = assets
            .mesh(asset.mesh)
            .ok_or_else(|| RenderError::StaleHandle(format!("mesh for model {}", id.0)))?;
        let local_bounds = mesh.local_bounds;
        let chunk_size = self.chunk_size(asset.chunking);

        if self.instances.remove(backend, id) {
            log::debug!("Model {} re-registered", id.0);
        }
        self.instances
            .get_or_create(backend, id, capacity, chunk_size, local_bounds)?;
        self.batches.insert(id, ModelBatch { asset });
        Ok(())
    }

    pub fn unregister_model(&mut self, backend: &mut dyn GraphicsBackend, id: ModelId) -> bool {
        self.instances.remove(backend, id);
        self.batches.remove(&id).is_some()
    }

    pub fn is_registered(&self, id: ModelId) -> bool {
        self.batches.contains_key(&id)
    }

    pub fn model_count(&self) -> usize {
        self.batches.len()
    }

    /// Clear every batch's instance list
    pub fn begin_frame(&mut self) {
        for (_, buffer) in self.instances.iter_mut() {
            buffer.begin();
        }
        self.frame_dropped = 0;
    }

    /// Queue one instance. Unknown models and full buffers drop it and return false.
    pub fn add_instance(&mut self, id: ModelId, transform: Mat4, tint: Vec4, emissive: Vec4) -> bool {
        self.add_record(id, InstanceRecord::new(transform, tint, emissive))
    }

    pub fn add_record(&mut self, id: ModelId, record: InstanceRecord) -> bool {
        let added = self.batches.contains_key(&id)
            && self
                .instances
                .get_mut(id)
                .is_some_and(|buffer| buffer.add(record).is_ok());
        if !added {
            self.dropped += 1;
            self.frame_dropped += 1;
        }
        added
    }

    /// Instances queued for `id` this frame
    pub fn instance_count(&self, id: ModelId) -> u32 {
        self.instances.get(id).map_or(0, InstanceBuffer::instance_count)
    }

    pub fn instance_buffer(&self, id: ModelId) -> Option<&InstanceBuffer> {
        self.instances.get(id)
    }

    /// Recompute the culling frustum if the view-projection changed. Returns whether it did.
    pub fn update_frustum(&mut self, view_proj: &Mat4) -> bool {
        if matches!(&self.frustum, Some((source, _)) if source == view_proj) {
            return false;
        }
        self.frustum = Some((*view_proj, Frustum::from_view_projection(view_proj)));
        self.frustum_updates += 1;
        true
    }

    /// Times the frustum was rebuilt
    pub fn frustum_updates(&self) -> u64 {
        self.frustum_updates
    }

    /// Upload every batch and refresh chunk visibility against the current frustum
    pub fn upload_instances(&mut self, backend: &mut dyn GraphicsBackend, frame_pool: &mut FrameResourcePool) -> u32 {
        if self.frame_dropped > 0 {
            log::warn!("Dropped {} instances this frame", self.frame_dropped);
        }
        let mut uploaded = 0;
        self.visible_chunks = 0;
        self.culled_chunks = 0;
        for (_, buffer) in self.instances.iter_mut() {
            buffer.end(backend, frame_pool);
            uploaded += buffer.uploaded_count();
            if let Some((_, frustum)) = &self.frustum {
                let (visible, culled) = buffer.update_chunk_visibility(frustum);
                self.visible_chunks += visible;
                self.culled_chunks += culled;
            }
        }
        uploaded
    }

    fn bind_batch(
        backend: &mut dyn GraphicsBackend,
        state: &mut RenderPassState,
        mesh: &GpuMesh,
        buffer: &InstanceBuffer,
    ) {
        state.set_vertex_buffer(backend, 0, mesh.vertex_buffer, 0);
        state.set_vertex_buffer(backend, 1, buffer.buffer(), 0);
        if mesh.index_count > 0 {
            state.set_index_buffer(backend, mesh.index_buffer);
        }
    }

    fn draw(backend: &mut dyn GraphicsBackend, mesh: &GpuMesh, instances: Range<u32>) {
        if mesh.index_count > 0 {
            backend.draw_indexed(0..mesh.index_count, 0, instances);
        } else {
            backend.draw(0..mesh.vertex_count, instances);
        }
    }

    fn require_camera(&mut self, state: &RenderPassState) -> bool {
        if state.is_camera_bound() {
            return true;
        }
        self.last_error.set(
            RenderError::ContractViolation("instanced draw before the camera block was bound".into()).to_string(),
        );
        false
    }

    /// Draw one opaque layer with the pipeline the caller bound.
    ///
    /// Returns the number of draw calls, or `None` when the camera block is not bound.
    pub fn render(
        &mut self,
        backend: &mut dyn GraphicsBackend,
        state: &mut RenderPassState,
        assets: &AssetRegistry,
        layer: RenderLayer,
    ) -> Option<u32> {
        if !self.require_camera(state) {
            return None;
        }
        let mut draws = 0;
        for (id, batch) in self.batches.iter().filter(|(_, b)| b.asset.layer == layer) {
            let Some(buffer) = self.instances.get(*id) else {
                continue;
            };
            let ranges = buffer.draw_ranges();
            if ranges.is_empty() {
                continue;
            }
            let (Some(mesh), Some(material)) = (assets.mesh(batch.asset.mesh), assets.material(batch.asset.material))
            else {
                log::warn!("Skipping model {}: its mesh or material was removed", id.0);
                continue;
            };

            state.set_bind_group(backend, MATERIAL_GROUP, material.bind_group, &[]);
            Self::bind_batch(backend, state, mesh, buffer);
            for range in ranges {
                Self::draw(backend, mesh, range);
                draws += 1;
            }
        }
        Some(draws)
    }

    /// Draw every uploaded instance of every layer, unculled, for a depth-only pass
    pub fn render_depth(
        &mut self,
        backend: &mut dyn GraphicsBackend,
        state: &mut RenderPassState,
        assets: &AssetRegistry,
    ) -> Option<u32> {
        if !self.require_camera(state) {
            return None;
        }
        let mut draws = 0;
        for layer in RenderLayer::ORDER {
            for (id, batch) in self.batches.iter().filter(|(_, b)| b.asset.layer == layer) {
                let Some(buffer) = self.instances.get(*id) else {
                    continue;
                };
                let count = buffer.uploaded_count();
                if count == 0 {
                    continue;
                }
                let Some(mesh) = assets.mesh(batch.asset.mesh) else {
                    continue;
                };
                Self::bind_batch(backend, state, mesh, buffer);
                Self::draw(backend, mesh, 0..count);
                draws += 1;
            }
        }
        Some(draws)
    }

    /// Total instances dropped since creation
    pub fn dropped_instances(&self) -> u64 {
        self.dropped
    }

    /// Chunks that passed the frustum test at the last upload
    pub fn visible_chunks(&self) -> u32 {
        self.visible_chunks
    }

    pub fn culled_chunks(&self) -> u32 {
        self.culled_chunks
    }

    pub fn last_error(&self) -> Option<&str> {
        self.last_error.get()
    }

    pub fn release_all(&mut self, backend: &mut dyn GraphicsBackend) {
        self.instances.release_all(backend);
        self.batches.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{HeadlessBackend, RecordedCommand, RenderPassDescriptor};
    use crate::config::FramePoolConfig;
    use crate::pipeline::material_layout_entries;
    use crate::resources::{MaterialDesc, MeshData, SamplerCache};
    use glam::Vec3;

    struct Fixture {
        backend: HeadlessBackend,
        assets: AssetRegistry,
        pool: FrameResourcePool,
        mesh: MeshHandle,
        material: MaterialHandle,
    }

    fn fixture() -> Fixture {
        let mut backend = HeadlessBackend::new(64, 64);
        let mut assets = AssetRegistry::new();
        let mut samplers = SamplerCache::new();
        let layout = backend.create_bind_group_layout(&material_layout_entries()).unwrap();
        let gpu_mesh = GpuMesh::upload(&mut backend, &MeshData::cube(), 0).unwrap();
        let mesh = assets.register_mesh(gpu_mesh);
        let material = assets
            .register_material(&mut backend, layout, &mut samplers, MaterialDesc::default())
            .unwrap();
        let pool = FrameResourcePool::new(&mut backend, &FramePoolConfig::default()).unwrap();
        Fixture {
            backend,
            assets,
            pool,
            mesh,
            material,
        }
    }

    fn at(x: f32) -> Mat4 {
        Mat4::from_translation(Vec3::new(x, 0.0, 0.0))
    }

    #[test]
    fn test_unregistered_model_drops_silently() {
        let mut renderer = InstancedRenderer::new(&InstanceConfig::default());
        renderer.begin_frame();
        assert!(!renderer.add_instance(ModelId(3), Mat4::IDENTITY, Vec4::ONE, Vec4::ZERO));
        assert_eq!(renderer.dropped_instances(), 1);
    }

    #[test]
    fn test_reregistering_replaces_buffer() {
        let mut f = fixture();
        let mut renderer = InstancedRenderer::new(&InstanceConfig::default());
        let asset = ModelAsset::new(f.mesh, f.material, RenderLayer::Buildings);
        renderer
            .register_model(&mut f.backend, &f.assets, ModelId(1), asset, 4)
            .unwrap();
        renderer
            .register_model(&mut f.backend, &f.assets, ModelId(1), asset, 16)
            .unwrap();

        assert_eq!(renderer.model_count(), 1);
        assert_eq!(renderer.instance_buffer(ModelId(1)).unwrap().capacity(), 16);
    }

    #[test]
    fn test_render_requires_camera_binding() {
        let mut f = fixture();
        let mut renderer = InstancedRenderer::new(&InstanceConfig::default());
        let mut state = RenderPassState::new();
        state.begin_pass("opaque");
        assert_eq!(renderer.render(&mut f.backend, &mut state, &f.assets, RenderLayer::Terrain), None);
        assert!(renderer.last_error().unwrap().contains("camera"));
    }

    #[test]
    fn test_one_draw_per_visible_chunk() {
        let mut f = fixture();
        let mut renderer = InstancedRenderer::new(&InstanceConfig::default());
        let asset = ModelAsset::new(f.mesh, f.material, RenderLayer::Terrain).with_chunking(Chunking::Fixed(2));
        renderer
            .register_model(&mut f.backend, &f.assets, ModelId(1), asset, 16)
            .unwrap();

        renderer.begin_frame();
        for x in 0..6 {
            assert!(renderer.add_instance(ModelId(1), at(x as f32), Vec4::ONE, Vec4::ZERO));
        }
        let view = Mat4::look_at_rh(Vec3::new(2.5, 10.0, 20.0), Vec3::new(2.5, 0.0, 0.0), Vec3::Y);
        let proj = Mat4::perspective_rh(1.0, 1.0, 0.1, 200.0);
        assert!(renderer.update_frustum(&(proj * view)));
        assert!(!renderer.update_frustum(&(proj * view)));

        f.backend.begin_commands().unwrap();
        f.pool.begin_frame(&mut f.backend);
        assert_eq!(renderer.upload_instances(&mut f.backend, &mut f.pool), 6);
        f.pool.flush(&mut f.backend);
        assert_eq!(renderer.visible_chunks(), 3);

        f.backend.begin_render_pass(&RenderPassDescriptor {
            label: Some("opaque".into()),
            color_attachments: vec![],
            depth_stencil_attachment: None,
        });
        let mut state = RenderPassState::new();
        state.begin_pass("opaque");
        state.bind_camera(&mut f.backend, crate::backend::BindGroupHandle(0), 0);
        let draws = renderer
            .render(&mut f.backend, &mut state, &f.assets, RenderLayer::Terrain)
            .unwrap();
        assert_eq!(draws, 3);
        assert_eq!(
            renderer.render(&mut f.backend, &mut state, &f.assets, RenderLayer::Buildings),
            Some(0)
        );

        let instanced: Vec<_> = f
            .backend
            .commands()
            .iter()
            .filter_map(|c| match c {
                RecordedCommand::DrawIndexed { instances, .. } => Some(instances.clone()),
                _ => None,
            })
            .collect();
        assert_eq!(instanced, vec![0..2, 2..4, 4..6]);
    }

    #[test]
    fn test_removed_mesh_skips_batch() {
        let mut f = fixture();
        let mut renderer = InstancedRenderer::new(&InstanceConfig::default());
        let asset = ModelAsset::new(f.mesh, f.material, RenderLayer::Effects);
        renderer
            .register_model(&mut f.backend, &f.assets, ModelId(9), asset, 4)
            .unwrap();
        renderer.begin_frame();
        renderer.add_instance(ModelId(9), Mat4::IDENTITY, Vec4::ONE, Vec4::ZERO);
        f.pool.begin_frame(&mut f.backend);
        renderer.upload_instances(&mut f.backend, &mut f.pool);
        f.assets.remove_mesh(f.mesh);

        let mut state = RenderPassState::new();
        state.begin_pass("opaque");
        state.bind_camera(&mut f.backend, crate::backend::BindGroupHandle(0), 0);
        assert_eq!(
            renderer.render(&mut f.backend, &mut state, &f.assets, RenderLayer::Effects),
            Some(0)
        );
    }
}
