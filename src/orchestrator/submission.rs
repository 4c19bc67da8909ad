//! Per-frame scene submission from the simulation side

use crate::renderer::{InstancedRenderer, TransparentRenderQueue};
use crate::resources::{InstanceRecord, MaterialHandle, MeshHandle, ModelId};
use glam::{Mat4, Vec4};

/// Write access to this frame's instance batches and transparent queue.
///
/// Only obtainable while a frame is in the `Acquired` stage.
pub struct SceneSubmission<'a> {
    pub(crate) instanced: &'a mut InstancedRenderer,
    pub(crate) transparent: &'a mut TransparentRenderQueue,
}

impl SceneSubmission<'_> {
    /// Returns false when the model is unknown or its buffer is full
    pub fn add_instance(&mut self, id: ModelId, transform: Mat4, tint: Vec4, emissive: Vec4) -> bool {
        self.instanced.add_instance(id, transform, tint, emissive)
    }

    pub fn add_record(&mut self, id: ModelId, record: InstanceRecord) -> bool {
        self.instanced.add_record(id, record)
    }

    pub fn instance_count(&self, id: ModelId) -> u32 {
        self.instanced.instance_count(id)
    }

    pub fn add_object(
        &mut self,
        mesh: MeshHandle,
        material: MaterialHandle,
        transform: Mat4,
        color: Option<Vec4>,
        emissive: Vec4,
    ) {
        self.transparent.add_object(mesh, material, transform, color, emissive);
    }

    pub fn add_construction_ghost(&mut self, mesh: MeshHandle, material: MaterialHandle, transform: Mat4) {
        self.transparent.add_construction_ghost(mesh, material, transform);
    }

    pub fn add_selection_overlay(&mut self, mesh: MeshHandle, material: MaterialHandle, transform: Mat4) {
        self.transparent.add_selection_overlay(mesh, material, transform);
    }

    pub fn add_underground_ghost(&mut self, mesh: MeshHandle, material: MaterialHandle, transform: Mat4) {
        self.transparent.add_underground_ghost(mesh, material, transform);
    }
}
