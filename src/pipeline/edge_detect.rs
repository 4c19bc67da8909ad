//! Screen-space outline pass over the opaque scene

use crate::backend::{
    BindGroupEntry, BindGroupHandle, BindGroupLayoutEntry, BindGroupLayoutHandle, BindingType, BlendState,
    BufferDescriptor, BufferHandle, BufferUsage, ColorAttachment, ColorTargetState, ColorWrites, CullMode, FrontFace,
    GraphicsBackend, LoadOp, PrimitiveTopology, RenderPassDescriptor, RenderPipelineDescriptor, RenderPipelineHandle,
    ShaderStageFlags, StoreOp, TextureSampleType,
};
use crate::config::EdgeConfig;
use crate::error::RenderResult;
use crate::pipeline::shaders::EDGE_SHADER;
use crate::pipeline::targets::{TargetSet, HDR_FORMAT};
use crate::renderer::RenderPassState;
use bytemuck::{Pod, Zeroable};
use glam::Vec4;

pub const EDGE_PASS_LABEL: &str = "Edge Detection";

#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
struct EdgeParams {
    color: Vec4,
    thresholds: Vec4,
}

impl From<&EdgeConfig> for EdgeParams {
    fn from(config: &EdgeConfig) -> Self {
        let [r, g, b] = config.color;
        Self {
            color: Vec4::new(r, g, b, 1.0),
            thresholds: Vec4::new(config.normal_threshold, config.depth_threshold, config.strength, 0.0),
        }
    }
}

pub struct EdgeDetectPass {
    layout: BindGroupLayoutHandle,
    pipeline: RenderPipelineHandle,
    params: BufferHandle,
    /// Bind group over the targets of one size generation
    bind_group: Option<(u64, BindGroupHandle)>,
}

impl EdgeDetectPass {
    pub fn new(backend: &mut dyn GraphicsBackend, config: &EdgeConfig) -> RenderResult<Self> {
        let layout = backend.create_bind_group_layout(&[
            BindGroupLayoutEntry {
                binding: 0,
                visibility: ShaderStageFlags::FRAGMENT,
                ty: BindingType::Texture {
                    sample_type: TextureSampleType::Float { filterable: false },
                },
            },
            BindGroupLayoutEntry {
                binding: 1,
                visibility: ShaderStageFlags::FRAGMENT,
                ty: BindingType::Texture {
                    sample_type: TextureSampleType::Depth,
                },
            },
            BindGroupLayoutEntry {
                binding: 2,
                visibility: ShaderStageFlags::FRAGMENT,
                ty: BindingType::UniformBuffer { dynamic: false },
            },
        ])?;

        let pipeline = backend.create_render_pipeline(&RenderPipelineDescriptor {
            label: Some("edge_pipeline".into()),
            vertex_shader: EDGE_SHADER.to_string(),
            fragment_shader: Some(EDGE_SHADER.to_string()),
            vertex_layouts: vec![],
            bind_group_layouts: vec![layout],
            primitive_topology: PrimitiveTopology::TriangleList,
            front_face: FrontFace::Ccw,
            cull_mode: CullMode::None,
            depth_stencil: None,
            color_targets: vec![ColorTargetState {
                format: HDR_FORMAT,
                blend: Some(BlendState::alpha_blending()),
                write_mask: ColorWrites::ALL,
            }],
        })?;

        let params = backend.create_buffer_init(
            &BufferDescriptor::new(
                "edge_params",
                std::mem::size_of::<EdgeParams>() as u64,
                BufferUsage::UNIFORM | BufferUsage::COPY_DST,
            ),
            bytemuck::bytes_of(&EdgeParams::from(config)),
        )?;

        Ok(Self {
            layout,
            pipeline,
            params,
            bind_group: None,
        })
    }

    pub fn set_params(&mut self, backend: &mut dyn GraphicsBackend, config: &EdgeConfig) {
        backend.write_buffer(self.params, 0, bytemuck::bytes_of(&EdgeParams::from(config)));
    }

    fn bind_group(
        &mut self,
        backend: &mut dyn GraphicsBackend,
        targets: &TargetSet,
        generation: u64,
    ) -> RenderResult<BindGroupHandle> {
        if let Some((built_for, group)) = self.bind_group {
            if built_for == generation {
                return Ok(group);
            }
            backend.destroy_bind_group(group);
            self.bind_group = None;
        }
        let group = backend.create_bind_group(
            self.layout,
            &[
                (0, BindGroupEntry::Texture(targets.normal.view)),
                (1, BindGroupEntry::Texture(targets.depth.view)),
                (
                    2,
                    BindGroupEntry::Buffer {
                        buffer: self.params,
                        offset: 0,
                        size: None,
                    },
                ),
            ],
        )?;
        self.bind_group = Some((generation, group));
        Ok(group)
    }

    /// Blend outlines derived from the normal and depth targets over scene color
    pub fn execute(
        &mut self,
        backend: &mut dyn GraphicsBackend,
        state: &mut RenderPassState,
        targets: &TargetSet,
        generation: u64,
    ) -> RenderResult<()> {
        let group = self.bind_group(backend, targets, generation)?;

        backend.begin_render_pass(&RenderPassDescriptor {
            label: Some(EDGE_PASS_LABEL.into()),
            color_attachments: vec![ColorAttachment {
                view: targets.scene_color.view,
                load_op: LoadOp::Load,
                store_op: StoreOp::Store,
            }],
            depth_stencil_attachment: None,
        });
        state.begin_pass(EDGE_PASS_LABEL);
        state.set_pipeline(backend, self.pipeline);
        state.set_bind_group(backend, 0, group, &[]);
        backend.draw(0..3, 0..1);
        backend.end_render_pass();
        state.end_pass();
        Ok(())
    }

    pub fn release(&mut self, backend: &mut dyn GraphicsBackend) {
        if let Some((_, group)) = self.bind_group.take() {
            backend.destroy_bind_group(group);
        }
        backend.destroy_buffer(self.params);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::HeadlessBackend;
    use crate::pipeline::targets::AuxiliaryTargets;

    #[test]
    fn test_bind_group_rebuilt_per_generation() {
        let mut backend = HeadlessBackend::new(128, 128);
        let mut pass = EdgeDetectPass::new(&mut backend, &EdgeConfig::default()).unwrap();
        let mut targets = AuxiliaryTargets::new(1);
        let mut state = RenderPassState::new();
        backend.begin_commands().unwrap();

        assert!(targets.ensure(&mut backend, (128, 128), 1));
        pass.execute(&mut backend, &mut state, targets.get().unwrap(), 1).unwrap();
        let first = pass.bind_group.map(|(_, g)| g);
        pass.execute(&mut backend, &mut state, targets.get().unwrap(), 1).unwrap();
        assert_eq!(pass.bind_group.map(|(_, g)| g), first);

        assert!(targets.ensure(&mut backend, (256, 256), 2));
        pass.execute(&mut backend, &mut state, targets.get().unwrap(), 2).unwrap();
        assert_ne!(pass.bind_group.map(|(_, g)| g), first);
        assert_eq!(backend.draw_count(), 3);
        assert_eq!(
            backend.render_pass_labels(),
            vec![EDGE_PASS_LABEL, EDGE_PASS_LABEL, EDGE_PASS_LABEL]
        );
    }
}
