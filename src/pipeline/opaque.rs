//! Main scene passes: opaque geometry into the HDR targets, then blended transparents on top

use crate::backend::{
    BindGroupEntry, BindGroupLayoutEntry, BindGroupLayoutHandle, BindingType, BlendState, ColorAttachment,
    ColorTargetState, ColorWrites, CompareFunction, CullMode, DepthStencilAttachment, DepthStencilState, FrameUniforms,
    FrontFace, GraphicsBackend, LoadOp, PrimitiveTopology, RenderPassDescriptor, RenderPipelineDescriptor,
    RenderPipelineHandle, ShaderStageFlags, StoreOp, TextureSampleType, Vertex,
};
use crate::config::ClearValues;
use crate::error::RenderResult;
use crate::pipeline::bindings::UniformBindGroups;
use crate::pipeline::shaders::{SCENE_SHADER, TRANSPARENT_SHADER};
use crate::pipeline::shadow_pass::ShadowPass;
use crate::pipeline::targets::{TargetSet, DEPTH_FORMAT, HDR_FORMAT};
use crate::renderer::{RenderPassState, TransparentUniform};
use crate::resources::{InstanceRecord, UniformAllocation};

pub const OPAQUE_PASS_LABEL: &str = "Opaque Pass";
pub const TRANSPARENT_PASS_LABEL: &str = "Transparent Pass";

/// Group 0: frame block, shadow map, shadow comparison sampler
pub fn frame_layout_entries() -> Vec<BindGroupLayoutEntry> {
    vec![
        BindGroupLayoutEntry {
            binding: 0,
            visibility: ShaderStageFlags::VERTEX_FRAGMENT,
            ty: BindingType::UniformBuffer { dynamic: true },
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
            ty: BindingType::Sampler { comparison: true },
        },
    ]
}

/// Group 1: material block, base texture, base sampler
pub fn material_layout_entries() -> Vec<BindGroupLayoutEntry> {
    vec![
        BindGroupLayoutEntry {
            binding: 0,
            visibility: ShaderStageFlags::FRAGMENT,
            ty: BindingType::UniformBuffer { dynamic: false },
        },
        BindGroupLayoutEntry {
            binding: 1,
            visibility: ShaderStageFlags::FRAGMENT,
            ty: BindingType::Texture {
                sample_type: TextureSampleType::Float { filterable: true },
            },
        },
        BindGroupLayoutEntry {
            binding: 2,
            visibility: ShaderStageFlags::FRAGMENT,
            ty: BindingType::Sampler { comparison: false },
        },
    ]
}

/// Group 2: per-object block of the transparent pipeline
pub fn object_layout_entries() -> Vec<BindGroupLayoutEntry> {
    vec![BindGroupLayoutEntry {
        binding: 0,
        visibility: ShaderStageFlags::VERTEX_FRAGMENT,
        ty: BindingType::UniformBuffer { dynamic: true },
    }]
}

fn hdr_target(blend: Option<BlendState>) -> ColorTargetState {
    ColorTargetState {
        format: HDR_FORMAT,
        blend,
        write_mask: ColorWrites::ALL,
    }
}

pub struct OpaquePass {
    material_layout: BindGroupLayoutHandle,
    opaque_pipeline: RenderPipelineHandle,
    transparent_pipeline: RenderPipelineHandle,
    frame_groups: UniformBindGroups,
    object_groups: UniformBindGroups,
}

impl OpaquePass {
    pub fn new(backend: &mut dyn GraphicsBackend, shadow: &ShadowPass) -> RenderResult<Self> {
        let frame_layout = backend.create_bind_group_layout(&frame_layout_entries())?;
        let material_layout = backend.create_bind_group_layout(&material_layout_entries())?;
        let object_layout = backend.create_bind_group_layout(&object_layout_entries())?;

        let opaque_pipeline = backend.create_render_pipeline(&RenderPipelineDescriptor {
            label: Some("opaque_pipeline".into()),
            vertex_shader: SCENE_SHADER.to_string(),
            fragment_shader: Some(SCENE_SHADER.to_string()),
            vertex_layouts: vec![Vertex::layout(), InstanceRecord::layout()],
            bind_group_layouts: vec![frame_layout, material_layout],
            primitive_topology: PrimitiveTopology::TriangleList,
            front_face: FrontFace::Ccw,
            cull_mode: CullMode::Back,
            depth_stencil: Some(DepthStencilState::new(DEPTH_FORMAT, true, CompareFunction::Less)),
            color_targets: vec![hdr_target(None), hdr_target(None), hdr_target(None)],
        })?;

        let transparent_pipeline = backend.create_render_pipeline(&RenderPipelineDescriptor {
            label: Some("transparent_pipeline".into()),
            vertex_shader: TRANSPARENT_SHADER.to_string(),
            fragment_shader: Some(TRANSPARENT_SHADER.to_string()),
            vertex_layouts: vec![Vertex::layout()],
            bind_group_layouts: vec![frame_layout, material_layout, object_layout],
            primitive_topology: PrimitiveTopology::TriangleList,
            front_face: FrontFace::Ccw,
            cull_mode: CullMode::None,
            depth_stencil: Some(DepthStencilState::new(DEPTH_FORMAT, false, CompareFunction::Less)),
            color_targets: vec![hdr_target(Some(BlendState::alpha_blending()))],
        })?;

        let frame_groups = UniformBindGroups::new(
            frame_layout,
            std::mem::size_of::<FrameUniforms>() as u64,
            vec![
                (1, BindGroupEntry::Texture(shadow.map_view())),
                (2, BindGroupEntry::Sampler(shadow.sampler())),
            ],
        );
        let object_groups = UniformBindGroups::new(
            object_layout,
            std::mem::size_of::<TransparentUniform>() as u64,
            Vec::new(),
        );

        Ok(Self {
            material_layout,
            opaque_pipeline,
            transparent_pipeline,
            frame_groups,
            object_groups,
        })
    }

    /// Layout materials must be registered against
    pub fn material_layout(&self) -> BindGroupLayoutHandle {
        self.material_layout
    }

    pub fn transparent_pipeline(&self) -> RenderPipelineHandle {
        self.transparent_pipeline
    }

    pub fn object_groups_mut(&mut self) -> &mut UniformBindGroups {
        &mut self.object_groups
    }

    /// Open the opaque pass, clearing every scene target, and bind the camera block
    pub fn begin(
        &mut self,
        backend: &mut dyn GraphicsBackend,
        state: &mut RenderPassState,
        targets: &TargetSet,
        clear: &ClearValues,
        frame_block: &UniformAllocation,
    ) -> RenderResult<()> {
        // Bind groups first; nothing below can fail once the pass is open
        let group = self.frame_groups.get_or_create(backend, frame_block.buffer)?;

        backend.begin_render_pass(&RenderPassDescriptor {
            label: Some(OPAQUE_PASS_LABEL.into()),
            color_attachments: vec![
                ColorAttachment {
                    view: targets.scene_color.view,
                    load_op: LoadOp::Clear(clear.color),
                    store_op: StoreOp::Store,
                },
                ColorAttachment {
                    view: targets.normal.view,
                    load_op: LoadOp::Clear(clear.neutral_normal),
                    store_op: StoreOp::Store,
                },
                ColorAttachment {
                    view: targets.emissive.view,
                    load_op: LoadOp::Clear([0.0; 4]),
                    store_op: StoreOp::Store,
                },
            ],
            depth_stencil_attachment: Some(DepthStencilAttachment {
                view: targets.depth.view,
                depth_load_op: LoadOp::Clear([clear.depth; 4]),
                depth_store_op: StoreOp::Store,
                depth_clear_value: clear.depth,
            }),
        });
        state.begin_pass(OPAQUE_PASS_LABEL);
        state.set_pipeline(backend, self.opaque_pipeline);
        state.bind_camera(backend, group, frame_block.dynamic_offset());
        Ok(())
    }

    /// Reopen scene color and depth for blended drawing
    pub fn begin_transparent(
        &mut self,
        backend: &mut dyn GraphicsBackend,
        state: &mut RenderPassState,
        targets: &TargetSet,
        frame_block: &UniformAllocation,
    ) -> RenderResult<()> {
        let group = self.frame_groups.get_or_create(backend, frame_block.buffer)?;

        backend.begin_render_pass(&RenderPassDescriptor {
            label: Some(TRANSPARENT_PASS_LABEL.into()),
            color_attachments: vec![ColorAttachment {
                view: targets.scene_color.view,
                load_op: LoadOp::Load,
                store_op: StoreOp::Store,
            }],
            depth_stencil_attachment: Some(DepthStencilAttachment {
                view: targets.depth.view,
                depth_load_op: LoadOp::Load,
                depth_store_op: StoreOp::Store,
                depth_clear_value: 1.0,
            }),
        });
        state.begin_pass(TRANSPARENT_PASS_LABEL);
        state.set_pipeline(backend, self.transparent_pipeline);
        state.bind_camera(backend, group, frame_block.dynamic_offset());
        Ok(())
    }

    pub fn end(&mut self, backend: &mut dyn GraphicsBackend, state: &mut RenderPassState) {
        backend.end_render_pass();
        state.end_pass();
    }

    pub fn release(&mut self, backend: &mut dyn GraphicsBackend) {
        self.frame_groups.release(backend);
        self.object_groups.release(backend);
    }
}
