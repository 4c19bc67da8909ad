//! Redundant state-binding elision for one render pass

use crate::backend::{
    BindGroupHandle, BufferHandle, GraphicsBackend, IndexFormat, RenderPipelineHandle,
};

const MAX_BIND_GROUPS: usize = 4;
const MAX_VERTEX_BUFFERS: usize = 2;

/// Bind group slot that carries the per-pass camera and lighting block
pub const CAMERA_GROUP: u32 = 0;

#[derive(Debug, Clone, PartialEq, Eq)]
struct BoundGroup {
    bind_group: BindGroupHandle,
    offsets: Vec<u32>,
}

/// What is currently bound in the open pass.
///
/// Every setter compares against the cached value and skips the backend call when
/// nothing changes. Call `begin_pass` at every pass boundary.
#[derive(Debug, Default)]
pub struct RenderPassState {
    pass_label: Option<&'static str>,
    pipeline: Option<RenderPipelineHandle>,
    bind_groups: [Option<BoundGroup>; MAX_BIND_GROUPS],
    vertex_buffers: [Option<(BufferHandle, u64)>; MAX_VERTEX_BUFFERS],
    index_buffer: Option<BufferHandle>,
    camera_bound: bool,
    elided: u64,
}

impl RenderPassState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Forget everything bound in the previous pass
    pub fn begin_pass(&mut self, label: &'static str) {
        self.end_pass();
        self.pass_label = Some(label);
    }

    pub fn end_pass(&mut self) {
        self.pass_label = None;
        self.pipeline = None;
        self.bind_groups = Default::default();
        self.vertex_buffers = [None; MAX_VERTEX_BUFFERS];
        self.index_buffer = None;
        self.camera_bound = false;
    }

    pub fn set_pipeline(&mut self, backend: &mut dyn GraphicsBackend, pipeline: RenderPipelineHandle) {
        if self.pipeline == Some(pipeline) {
            self.elided += 1;
            return;
        }
        backend.set_render_pipeline(pipeline);
        self.pipeline = Some(pipeline);
    }

    pub fn set_bind_group(
        &mut self,
        backend: &mut dyn GraphicsBackend,
        index: u32,
        bind_group: BindGroupHandle,
        offsets: &[u32],
    ) {
        let Some(slot) = self.bind_groups.get_mut(index as usize) else {
            backend.set_bind_group(index, bind_group, offsets);
            return;
        };
        if let Some(bound) = slot {
            if bound.bind_group == bind_group && bound.offsets == offsets {
                self.elided += 1;
                return;
            }
        }
        backend.set_bind_group(index, bind_group, offsets);
        *slot = Some(BoundGroup {
            bind_group,
            offsets: offsets.to_vec(),
        });
    }

    /// Bind the camera/lighting block; drawing is only legal once this happened in the pass
    pub fn bind_camera(&mut self, backend: &mut dyn GraphicsBackend, bind_group: BindGroupHandle, offset: u32) {
        self.set_bind_group(backend, CAMERA_GROUP, bind_group, &[offset]);
        self.camera_bound = true;
    }

    pub fn set_vertex_buffer(&mut self, backend: &mut dyn GraphicsBackend, slot: u32, buffer: BufferHandle, offset: u64) {
        let Some(cached) = self.vertex_buffers.get_mut(slot as usize) else {
            backend.set_vertex_buffer(slot, buffer, offset);
            return;
        };
        if *cached == Some((buffer, offset)) {
            self.elided += 1;
            return;
        }
        backend.set_vertex_buffer(slot, buffer, offset);
        *cached = Some((buffer, offset));
    }

    pub fn set_index_buffer(&mut self, backend: &mut dyn GraphicsBackend, buffer: BufferHandle) {
        if self.index_buffer == Some(buffer) {
            self.elided += 1;
            return;
        }
        backend.set_index_buffer(buffer, 0, IndexFormat::Uint32);
        self.index_buffer = Some(buffer);
    }

    pub fn is_camera_bound(&self) -> bool {
        self.camera_bound
    }

    /// Label of the open pass, if any
    pub fn pass_label(&self) -> Option<&'static str> {
        self.pass_label
    }

    /// Binds skipped because the state was already current, over the state's lifetime
    pub fn elided_binds(&self) -> u64 {
        self.elided
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{BufferDescriptor, BufferUsage, HeadlessBackend, RecordedCommand, RenderPassDescriptor};

    #[test]
    fn test_repeated_binds_are_elided() {
        let mut backend = HeadlessBackend::new(64, 64);
        let buffer = backend
            .create_buffer(&BufferDescriptor::new("vb", 64, BufferUsage::VERTEX))
            .unwrap();
        backend.begin_commands().unwrap();
        backend.begin_render_pass(&RenderPassDescriptor {
            label: Some("test".into()),
            color_attachments: vec![],
            depth_stencil_attachment: None,
        });

        let mut state = RenderPassState::new();
        state.begin_pass("test");
        state.set_vertex_buffer(&mut backend, 0, buffer, 0);
        state.set_vertex_buffer(&mut backend, 0, buffer, 0);
        state.set_index_buffer(&mut backend, buffer);
        state.set_index_buffer(&mut backend, buffer);

        let binds = backend
            .commands()
            .iter()
            .filter(|c| matches!(c, RecordedCommand::SetVertexBuffer { .. } | RecordedCommand::SetIndexBuffer { .. }))
            .count();
        assert_eq!(binds, 2);
        assert_eq!(state.elided_binds(), 2);
    }

    #[test]
    fn test_pass_boundary_resets_camera() {
        let mut backend = HeadlessBackend::new(64, 64);
        let mut state = RenderPassState::new();
        state.begin_pass("first");
        state.bind_camera(&mut backend, BindGroupHandle(1), 0);
        assert!(state.is_camera_bound());

        state.begin_pass("second");
        assert!(!state.is_camera_bound());
        assert_eq!(state.pass_label(), Some("second"));
    }
}
