//! Bind groups over uniform-pool blocks

use crate::backend::{BindGroupEntry, BindGroupHandle, BindGroupLayoutHandle, BufferHandle, GraphicsBackend};
use crate::error::RenderResult;
use std::collections::HashMap;

/// One bind group per uniform block, for layouts whose binding 0 is a dynamic uniform.
///
/// Extra entries (textures, samplers) are shared by every group.
pub struct UniformBindGroups {
    layout: BindGroupLayoutHandle,
    binding_size: u64,
    extra: Vec<(u32, BindGroupEntry)>,
    groups: HashMap<BufferHandle, BindGroupHandle>,
}

impl UniformBindGroups {
    pub fn new(layout: BindGroupLayoutHandle, binding_size: u64, extra: Vec<(u32, BindGroupEntry)>) -> Self {
        Self {
            layout,
            binding_size,
            extra,
            groups: HashMap::new(),
        }
    }

    pub fn layout(&self) -> BindGroupLayoutHandle {
        self.layout
    }

    pub fn get_or_create(
        &mut self,
        backend: &mut dyn GraphicsBackend,
        buffer: BufferHandle,
    ) -> RenderResult<BindGroupHandle> {
        if let Some(group) = self.groups.get(&buffer) {
            return Ok(*group);
        }
        let mut entries = Vec::with_capacity(self.extra.len() + 1);
        entries.push((
            0,
            BindGroupEntry::Buffer {
                buffer,
                offset: 0,
                size: Some(self.binding_size),
            },
        ));
        entries.extend(self.extra.iter().cloned());
        let group = backend.create_bind_group(self.layout, &entries)?;
        self.groups.insert(buffer, group);
        Ok(group)
    }

    pub fn len(&self) -> usize {
        self.groups.len()
    }

    pub fn is_empty(&self) -> bool {
        self.groups.is_empty()
    }

    pub fn release(&mut self, backend: &mut dyn GraphicsBackend) {
        for (_, group) in self.groups.drain() {
            backend.destroy_bind_group(group);
        }
    }
}
