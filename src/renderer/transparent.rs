//! Back-to-front transparent object queue
//!
//! Construction ghosts, selection overlays and underground views are drawn one
//! object at a time after the opaque scene, blended in order of decreasing
//! distance from the camera.

use crate::backend::{GraphicsBackend, RenderPipelineHandle};
use crate::config::TransparentStyles;
use crate::error::{LastError, RenderError};
use crate::pipeline::UniformBindGroups;
use crate::renderer::instanced::{RenderLayer, MATERIAL_GROUP};
use crate::renderer::state::RenderPassState;
use crate::resources::{AssetRegistry, MaterialHandle, MeshHandle, UniformBufferPool};
use bytemuck::{Pod, Zeroable};
use glam::{Mat4, Vec3, Vec4};

/// Bind group slot of the per-object block
pub const OBJECT_GROUP: u32 = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransparentKind {
    Generic,
    ConstructionGhost,
    SelectionOverlay,
    UndergroundGhost,
}

/// Per-object uniform block bound at group 2
#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
pub struct TransparentUniform {
    pub model: Mat4,
    pub color: Vec4,
    /// rgb = color, a = intensity
    pub emissive: Vec4,
}

static_assertions::const_assert_eq!(std::mem::size_of::<TransparentUniform>(), 96);

#[derive(Debug, Clone, Copy)]
pub struct TransparentObject {
    pub mesh: MeshHandle,
    pub material: MaterialHandle,
    pub transform: Mat4,
    pub color: Vec4,
    pub emissive: Vec4,
    pub kind: TransparentKind,
    pub layer: RenderLayer,
    distance_sq: f32,
}

impl TransparentObject {
    pub fn world_position(&self) -> Vec3 {
        self.transform.w_axis.truncate()
    }

    /// Squared distance to the camera position given at `begin`, as of the last sort
    pub fn distance_sq(&self) -> f32 {
        self.distance_sq
    }
}

pub struct TransparentRenderQueue {
    objects: Vec<TransparentObject>,
    styles: TransparentStyles,
    camera_position: Vec3,
    sorted: bool,
    contract_violations: u64,
    last_error: LastError,
}

impl TransparentRenderQueue {
    pub fn new(styles: TransparentStyles) -> Self {
        Self {
            objects: Vec::new(),
            styles,
            camera_position: Vec3::ZERO,
            sorted: false,
            contract_violations: 0,
            last_error: LastError::new(),
        }
    }

    /// Clear the queue and set the viewpoint distances are measured from
    pub fn begin(&mut self, camera_position: Vec3) {
        self.objects.clear();
        self.camera_position = camera_position;
        self.sorted = false;
    }

    fn push(&mut self, kind: TransparentKind, mesh: MeshHandle, material: MaterialHandle, transform: Mat4, color: Vec4, emissive: Vec4) {
        let layer = match kind {
            TransparentKind::Generic => self.styles.generic_layer,
            TransparentKind::ConstructionGhost => self.styles.ghost_layer,
            TransparentKind::SelectionOverlay => self.styles.overlay_layer,
            TransparentKind::UndergroundGhost => self.styles.underground_layer,
        };
        self.objects.push(TransparentObject {
            mesh,
            material,
            transform,
            color,
            emissive,
            kind,
            layer,
            distance_sq: 0.0,
        });
        self.sorted = false;
    }

    /// Queue a generic object; `None` uses the generic style tint
    pub fn add_object(
        &mut self,
        mesh: MeshHandle,
        material: MaterialHandle,
        transform: Mat4,
        color: Option<Vec4>,
        emissive: Vec4,
    ) {
        let color = color.unwrap_or(self.styles.generic);
        self.push(TransparentKind::Generic, mesh, material, transform, color, emissive);
    }

    pub fn add_construction_ghost(&mut self, mesh: MeshHandle, material: MaterialHandle, transform: Mat4) {
        let color = self.styles.construction_ghost;
        self.push(TransparentKind::ConstructionGhost, mesh, material, transform, color, Vec4::ZERO);
    }

    /// Selection overlays glow slightly in their own tint
    pub fn add_selection_overlay(&mut self, mesh: MeshHandle, material: MaterialHandle, transform: Mat4) {
        let color = self.styles.selection_overlay;
        let emissive = color.truncate().extend(0.5);
        self.push(TransparentKind::SelectionOverlay, mesh, material, transform, color, emissive);
    }

    pub fn add_underground_ghost(&mut self, mesh: MeshHandle, material: MaterialHandle, transform: Mat4) {
        let color = self.styles.underground_ghost;
        self.push(TransparentKind::UndergroundGhost, mesh, material, transform, color, Vec4::ZERO);
    }

    /// Measure each object's distance from its translation and order farthest
    /// first. Equal distances keep insertion order.
    pub fn sort_back_to_front(&mut self) {
        let camera = self.camera_position;
        for object in &mut self.objects {
            object.distance_sq = object.world_position().distance_squared(camera);
        }
        self.objects
            .sort_by(|a, b| b.distance_sq.total_cmp(&a.distance_sq));
        self.sorted = true;
    }

    pub fn is_sorted(&self) -> bool {
        self.sorted
    }

    pub fn objects(&self) -> &[TransparentObject] {
        &self.objects
    }

    pub fn len(&self) -> usize {
        self.objects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }

    pub fn contract_violations(&self) -> u64 {
        self.contract_violations
    }

    pub fn last_error(&self) -> Option<&str> {
        self.last_error.get()
    }

    fn violation(&mut self, message: &str) -> Option<u32> {
        self.contract_violations += 1;
        self.last_error
            .set(RenderError::ContractViolation(message.to_string()).to_string());
        None
    }

    /// Draw every queued object in its current order.
    ///
    /// Refuses an unsorted, non-empty queue and returns `None`. Objects whose
    /// uniform block cannot be allocated are skipped.
    pub fn render(
        &mut self,
        backend: &mut dyn GraphicsBackend,
        state: &mut RenderPassState,
        assets: &AssetRegistry,
        uniforms: &mut UniformBufferPool,
        object_groups: &mut UniformBindGroups,
        pipeline: RenderPipelineHandle,
    ) -> Option<u32> {
        if self.objects.is_empty() {
            return Some(0);
        }
        if !self.sorted {
            return self.violation("transparent objects rendered before sort_back_to_front");
        }
        if !state.is_camera_bound() {
            return self.violation("transparent draw before the camera block was bound");
        }

        state.set_pipeline(backend, pipeline);
        let mut draws = 0;
        for object in &self.objects {
            let (Some(mesh), Some(material)) = (assets.mesh(object.mesh), assets.material(object.material)) else {
                log::warn!("Skipping transparent {:?}: its mesh or material was removed", object.kind);
                continue;
            };
            let block = TransparentUniform {
                model: object.transform,
                color: object.color,
                emissive: object.emissive,
            };
            let Some(allocation) = uniforms.write(backend, bytemuck::bytes_of(&block)) else {
                continue;
            };
            let group = match object_groups.get_or_create(backend, allocation.buffer) {
                Ok(group) => group,
                Err(e) => {
                    self.last_error.set(format!("transparent object bind group: {e}"));
                    continue;
                }
            };

            state.set_bind_group(backend, MATERIAL_GROUP, material.bind_group, &[]);
            state.set_bind_group(backend, OBJECT_GROUP, group, &[allocation.dynamic_offset()]);
            state.set_vertex_buffer(backend, 0, mesh.vertex_buffer, 0);
            if mesh.index_count > 0 {
                state.set_index_buffer(backend, mesh.index_buffer);
                backend.draw_indexed(0..mesh.index_count, 0, 0..1);
            } else {
                backend.draw(0..mesh.vertex_count, 0..1);
            }
            draws += 1;
        }
        Some(draws)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::HeadlessBackend;
    use crate::config::UniformPoolConfig;
    use rstest::rstest;

    fn handles() -> (MeshHandle, MaterialHandle) {
        (MeshHandle::default(), MaterialHandle::default())
    }

    fn at_distance(z: f32) -> Mat4 {
        Mat4::from_translation(Vec3::new(0.0, 0.0, z))
    }

    #[test]
    fn test_sort_farthest_first() {
        let (mesh, material) = handles();
        let mut queue = TransparentRenderQueue::new(TransparentStyles::default());
        queue.begin(Vec3::ZERO);
        for z in [10.0, 1.0, 5.0] {
            queue.add_object(mesh, material, at_distance(z), None, Vec4::ZERO);
        }
        queue.sort_back_to_front();

        let order: Vec<f32> = queue.objects().iter().map(|o| o.world_position().z).collect();
        assert_eq!(order, vec![10.0, 5.0, 1.0]);
    }

    #[test]
    fn test_equal_distances_keep_insertion_order() {
        let (mesh, material) = handles();
        let mut queue = TransparentRenderQueue::new(TransparentStyles::default());
        queue.begin(Vec3::ZERO);
        queue.add_construction_ghost(mesh, material, at_distance(3.0));
        queue.add_selection_overlay(mesh, material, at_distance(-3.0));
        queue.add_underground_ghost(mesh, material, at_distance(8.0));
        queue.sort_back_to_front();

        let kinds: Vec<_> = queue.objects().iter().map(|o| o.kind).collect();
        assert_eq!(
            kinds,
            vec![
                TransparentKind::UndergroundGhost,
                TransparentKind::ConstructionGhost,
                TransparentKind::SelectionOverlay
            ]
        );
    }

    #[test]
    fn test_kind_styles_applied() {
        let styles = TransparentStyles::default();
        let (mesh, material) = handles();
        let mut queue = TransparentRenderQueue::new(styles.clone());
        queue.begin(Vec3::ZERO);
        queue.add_object(mesh, material, Mat4::IDENTITY, None, Vec4::ZERO);
        queue.add_object(mesh, material, Mat4::IDENTITY, Some(Vec4::ONE), Vec4::ZERO);
        queue.add_construction_ghost(mesh, material, Mat4::IDENTITY);

        assert_eq!(queue.objects()[0].color, styles.generic);
        assert_eq!(queue.objects()[1].color, Vec4::ONE);
        assert_eq!(queue.objects()[2].color, styles.construction_ghost);
    }

    #[test]
    fn test_layers_follow_configuration() {
        let (mesh, material) = handles();
        let styles = TransparentStyles {
            overlay_layer: RenderLayer::Terrain,
            ..TransparentStyles::default()
        };
        let mut queue = TransparentRenderQueue::new(styles);
        queue.begin(Vec3::ZERO);
        queue.add_object(mesh, material, Mat4::IDENTITY, None, Vec4::ZERO);
        queue.add_construction_ghost(mesh, material, Mat4::IDENTITY);
        queue.add_selection_overlay(mesh, material, Mat4::IDENTITY);
        queue.add_underground_ghost(mesh, material, Mat4::IDENTITY);

        let layers: Vec<_> = queue.objects().iter().map(|o| o.layer).collect();
        assert_eq!(
            layers,
            vec![
                RenderLayer::Effects,
                RenderLayer::Buildings,
                RenderLayer::Terrain,
                RenderLayer::Terrain
            ]
        );
    }

    #[test]
    fn test_distances_measured_at_sort() {
        let (mesh, material) = handles();
        let mut queue = TransparentRenderQueue::new(TransparentStyles::default());
        queue.begin(Vec3::new(0.0, 0.0, 2.0));
        queue.add_object(mesh, material, at_distance(5.0), None, Vec4::ZERO);
        assert_eq!(queue.objects()[0].distance_sq(), 0.0);

        queue.sort_back_to_front();
        assert_eq!(queue.objects()[0].distance_sq(), 9.0);
    }

    #[rstest]
    #[case::origin(Vec3::ZERO)]
    #[case::off_axis(Vec3::new(37.0, 4.0, -12.5))]
    #[case::above(Vec3::new(0.0, 250.0, 0.0))]
    #[case::negative(Vec3::new(-80.0, -3.0, -64.0))]
    fn test_sort_is_non_increasing_for_any_camera(#[case] camera: Vec3) {
        let (mesh, material) = handles();
        let mut queue = TransparentRenderQueue::new(TransparentStyles::default());
        queue.begin(camera);

        // Deterministic scatter over a 200-unit cube around the origin
        let mut seed = 0x2545_f491_u32;
        let mut next = || {
            seed ^= seed << 13;
            seed ^= seed >> 17;
            seed ^= seed << 5;
            (seed % 20_000) as f32 / 100.0 - 100.0
        };
        for _ in 0..64 {
            let position = Vec3::new(next(), next(), next());
            queue.add_object(mesh, material, Mat4::from_translation(position), None, Vec4::ZERO);
        }
        queue.sort_back_to_front();

        let distances: Vec<f32> = queue.objects().iter().map(|o| o.distance_sq()).collect();
        assert!(distances.windows(2).all(|pair| pair[0] >= pair[1]), "{distances:?}");
        for object in queue.objects() {
            assert_eq!(object.distance_sq(), object.world_position().distance_squared(camera));
        }
    }

    #[test]
    fn test_adding_after_sort_requires_new_sort() {
        let (mesh, material) = handles();
        let mut backend = HeadlessBackend::new(64, 64);
        let layout = backend.create_bind_group_layout(&[]).unwrap();
        let mut groups = UniformBindGroups::new(layout, 96, Vec::new());
        let mut uniforms = UniformBufferPool::new(&UniformPoolConfig::default(), 256);
        let assets = AssetRegistry::new();
        let mut state = RenderPassState::new();
        let pipeline = RenderPipelineHandle(0);

        let mut queue = TransparentRenderQueue::new(TransparentStyles::default());
        queue.begin(Vec3::ZERO);
        queue.add_object(mesh, material, at_distance(2.0), None, Vec4::ZERO);
        queue.sort_back_to_front();
        queue.add_object(mesh, material, at_distance(4.0), None, Vec4::ZERO);
        assert!(!queue.is_sorted());

        let drawn = queue.render(&mut backend, &mut state, &assets, &mut uniforms, &mut groups, pipeline);
        assert_eq!(drawn, None);
        assert_eq!(queue.contract_violations(), 1);
        assert_eq!(backend.draw_count(), 0);
    }

    #[test]
    fn test_empty_queue_renders_nothing() {
        let mut backend = HeadlessBackend::new(64, 64);
        let layout = backend.create_bind_group_layout(&[]).unwrap();
        let mut groups = UniformBindGroups::new(layout, 96, Vec::new());
        let mut uniforms = UniformBufferPool::new(&UniformPoolConfig::default(), 256);
        let mut queue = TransparentRenderQueue::new(TransparentStyles::default());
        queue.begin(Vec3::ZERO);

        let drawn = queue.render(
            &mut backend,
            &mut RenderPassState::new(),
            &AssetRegistry::new(),
            &mut uniforms,
            &mut groups,
            RenderPipelineHandle(0),
        );
        assert_eq!(drawn, Some(0));
        assert_eq!(queue.contract_violations(), 0);
    }
}
