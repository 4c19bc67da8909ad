//! Directional-light shadow map

use crate::backend::{
    BindGroupLayoutEntry, BindGroupLayoutHandle, BindingType, CompareFunction, CullMode, DepthStencilAttachment,
    DepthStencilState, FrontFace, GraphicsBackend, LoadOp, PrimitiveTopology, RenderPassDescriptor,
    RenderPipelineDescriptor, RenderPipelineHandle, SamplerHandle, ShaderStageFlags, StoreOp, TextureViewHandle,
    Vertex,
};
use crate::config::ShadowConfig;
use crate::error::RenderResult;
use crate::pipeline::bindings::UniformBindGroups;
use crate::pipeline::shaders::SHADOW_SHADER;
use crate::pipeline::targets::{RenderTarget, DEPTH_FORMAT};
use crate::renderer::{InstancedRenderer, RenderPassState};
use crate::resources::{AssetRegistry, InstanceRecord, SamplerCache, SamplerConfig, UniformAllocation};
use crate::scene::FrameCamera;
use glam::{Mat4, Vec3};

pub const SHADOW_PASS_LABEL: &str = "Shadow Pass";

pub struct ShadowPass {
    enabled: bool,
    map: RenderTarget,
    sampler: SamplerHandle,
    pipeline: RenderPipelineHandle,
    frame_groups: UniformBindGroups,
    extent: f32,
    light_direction: Vec3,
}

impl ShadowPass {
    /// A disabled pass still owns a 1x1 map so the scene bind group stays valid
    pub fn new(backend: &mut dyn GraphicsBackend, samplers: &mut SamplerCache, config: &ShadowConfig) -> RenderResult<Self> {
        let map_size = if config.enabled { config.map_size } else { 1 };
        let map = RenderTarget::create(backend, "shadow_map", (map_size, map_size), DEPTH_FORMAT)?;
        let sampler = samplers.get_or_create(backend, &SamplerConfig::SHADOW)?;

        let layout = backend.create_bind_group_layout(&[BindGroupLayoutEntry {
            binding: 0,
            visibility: ShaderStageFlags::VERTEX_FRAGMENT,
            ty: BindingType::UniformBuffer { dynamic: true },
        }])?;
        let pipeline = Self::create_pipeline(backend, layout)?;

        log::info!(
            "Shadow pass ready: {}x{} map, {}",
            map_size,
            map_size,
            if config.enabled { "enabled" } else { "disabled" }
        );

        Ok(Self {
            enabled: config.enabled,
            map,
            sampler,
            pipeline,
            frame_groups: UniformBindGroups::new(
                layout,
                std::mem::size_of::<crate::backend::FrameUniforms>() as u64,
                Vec::new(),
            ),
            extent: config.extent,
            light_direction: config.light_direction.normalize_or_zero(),
        })
    }

    fn create_pipeline(
        backend: &mut dyn GraphicsBackend,
        layout: BindGroupLayoutHandle,
    ) -> RenderResult<RenderPipelineHandle> {
        let mut depth = DepthStencilState::new(DEPTH_FORMAT, true, CompareFunction::LessEqual);
        depth.depth_bias = 2;
        depth.depth_bias_slope_scale = 2.0;

        Ok(backend.create_render_pipeline(&RenderPipelineDescriptor {
            label: Some("shadow_pipeline".into()),
            vertex_shader: SHADOW_SHADER.to_string(),
            fragment_shader: None,
            vertex_layouts: vec![Vertex::layout(), InstanceRecord::layout()],
            bind_group_layouts: vec![layout],
            primitive_topology: PrimitiveTopology::TriangleList,
            front_face: FrontFace::Ccw,
            cull_mode: CullMode::Back,
            depth_stencil: Some(depth),
            color_targets: vec![],
        })?)
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn map_view(&self) -> TextureViewHandle {
        self.map.view
    }

    pub fn sampler(&self) -> SamplerHandle {
        self.sampler
    }

    /// One shadow map texel in UV units
    pub fn texel_size(&self) -> f32 {
        1.0 / self.map.width as f32
    }

    /// Direction the light travels
    pub fn light_direction(&self) -> Vec3 {
        self.light_direction
    }

    /// Orthographic light-space matrix centred where the view ray meets the ground.
    ///
    /// The centre is snapped to whole shadow texels so the map does not shimmer as
    /// the camera pans.
    pub fn light_view_projection(&self, camera: &FrameCamera) -> Mat4 {
        let forward = -camera.view.row(2).truncate();
        let mut focus = Vec3::new(camera.position.x, 0.0, camera.position.z);
        if forward.y.abs() > 1e-4 {
            let t = -camera.position.y / forward.y;
            if t > 0.0 {
                focus = camera.position + forward * t;
            }
        }
        let texel = 2.0 * self.extent / self.map.width as f32;
        focus.x = (focus.x / texel).floor() * texel;
        focus.z = (focus.z / texel).floor() * texel;
        focus.y = 0.0;

        let up = if self.light_direction.y.abs() > 0.99 { Vec3::Z } else { Vec3::Y };
        let eye = focus - self.light_direction * self.extent * 2.0;
        let view = Mat4::look_at_rh(eye, focus, up);
        let e = self.extent;
        let projection = Mat4::orthographic_rh(-e, e, -e, e, 0.1, e * 4.0);
        projection * view
    }

    /// Render every uploaded instance into the shadow map. Disabled passes record nothing.
    pub fn render(
        &mut self,
        backend: &mut dyn GraphicsBackend,
        state: &mut RenderPassState,
        instanced: &mut InstancedRenderer,
        assets: &AssetRegistry,
        frame_block: &UniformAllocation,
    ) -> RenderResult<u32> {
        if !self.enabled {
            return Ok(0);
        }
        let group = self.frame_groups.get_or_create(backend, frame_block.buffer)?;

        backend.begin_render_pass(&RenderPassDescriptor {
            label: Some(SHADOW_PASS_LABEL.into()),
            color_attachments: vec![],
            depth_stencil_attachment: Some(DepthStencilAttachment {
                view: self.map.view,
                depth_load_op: LoadOp::Clear([1.0; 4]),
                depth_store_op: StoreOp::Store,
                depth_clear_value: 1.0,
            }),
        });
        state.begin_pass(SHADOW_PASS_LABEL);
        state.set_pipeline(backend, self.pipeline);
        state.bind_camera(backend, group, frame_block.dynamic_offset());
        let draws = instanced.render_depth(backend, state, assets).unwrap_or(0);
        backend.end_render_pass();
        state.end_pass();
        Ok(draws)
    }

    pub fn release(&mut self, backend: &mut dyn GraphicsBackend) {
        self.frame_groups.release(backend);
        backend.destroy_texture_view(self.map.view);
        backend.destroy_texture(self.map.texture);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::HeadlessBackend;
    use crate::scene::Camera;
    use glam::Vec4;

    #[test]
    fn test_light_projection_centres_on_ground_focus() {
        let mut backend = HeadlessBackend::new(64, 64);
        let mut samplers = SamplerCache::new();
        let config = ShadowConfig {
            map_size: 1024,
            extent: 32.0,
            ..ShadowConfig::default()
        };
        let pass = ShadowPass::new(&mut backend, &mut samplers, &config).unwrap();

        let camera = Camera::new(Vec3::new(0.0, 20.0, 20.0), Vec3::ZERO).snapshot();
        let clip = pass.light_view_projection(&camera) * Vec4::new(0.0, 0.0, 0.0, 1.0);
        let ndc = clip.truncate() / clip.w;
        assert!(ndc.x.abs() < 0.01 && ndc.y.abs() < 0.01, "focus at {ndc:?}");
        assert!((0.0..=1.0).contains(&ndc.z));
    }

    #[test]
    fn test_disabled_pass_keeps_placeholder_map() {
        let mut backend = HeadlessBackend::new(64, 64);
        let mut samplers = SamplerCache::new();
        let pass = ShadowPass::new(&mut backend, &mut samplers, &ShadowConfig {
            enabled: false,
            ..ShadowConfig::default()
        })
        .unwrap();

        assert!(!pass.is_enabled());
        let desc = backend.view_descriptor(pass.map_view()).unwrap();
        assert_eq!((desc.width, desc.height), (1, 1));
        assert_eq!(pass.texel_size(), 1.0);
    }
}
