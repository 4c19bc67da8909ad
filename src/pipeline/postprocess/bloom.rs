//! Bloom over the emissive target, composited with the scene into the swapchain

use crate::backend::{
    BindGroupEntry, BindGroupHandle, BindGroupLayoutEntry, BindGroupLayoutHandle, BindingType, BlendState,
    BufferDescriptor, BufferHandle, BufferUsage, ColorAttachment, ColorTargetState, ColorWrites, CullMode, FrontFace,
    GraphicsBackend, LoadOp, PrimitiveTopology, RenderPassDescriptor, RenderPipelineDescriptor, RenderPipelineHandle,
    SamplerHandle, ShaderStageFlags, StoreOp, TextureFormat, TextureSampleType, TextureViewHandle,
};
use crate::config::BloomConfig;
use crate::error::RenderResult;
use crate::pipeline::shaders::fullscreen_vertex_wgsl;
use crate::pipeline::targets::{TargetSet, HDR_FORMAT};
use crate::renderer::RenderPassState;
use crate::resources::{SamplerCache, SamplerConfig};
use bytemuck::{Pod, Zeroable};

pub const BLOOM_EXTRACT_LABEL: &str = "Bloom Extract";
pub const BLOOM_DOWNSAMPLE_LABEL: &str = "Bloom Downsample";
pub const BLOOM_UPSAMPLE_LABEL: &str = "Bloom Upsample";
pub const BLOOM_COMPOSITE_LABEL: &str = "Bloom Composite";

#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
struct BloomParams {
    threshold: f32,
    intensity: f32,
    _padding: [f32; 2],
}

macro_rules! bloom_bindings_wgsl {
    () => {
        r#"
struct BloomParams {
    threshold: f32,
    intensity: f32,
}

@group(0) @binding(0) var source_texture: texture_2d<f32>;
@group(0) @binding(1) var source_sampler: sampler;
@group(0) @binding(2) var<uniform> params: BloomParams;
"#
    };
}

pub const BLOOM_EXTRACT_SHADER: &str = concat!(
    fullscreen_vertex_wgsl!(),
    bloom_bindings_wgsl!(),
    r#"
@fragment
fn fs_main(input: FullscreenOutput) -> @location(0) vec4<f32> {
    let color = textureSample(source_texture, source_sampler, input.uv);
    let luminance = dot(color.rgb, vec3<f32>(0.2126, 0.7152, 0.0722));
    let weight = max(luminance - params.threshold, 0.0) / max(luminance, 0.0001);
    return vec4<f32>(color.rgb * weight, 1.0);
}
"#
);

pub const BLOOM_DOWNSAMPLE_SHADER: &str = concat!(
    fullscreen_vertex_wgsl!(),
    bloom_bindings_wgsl!(),
    r#"
@fragment
fn fs_main(input: FullscreenOutput) -> @location(0) vec4<f32> {
    let texel = 1.0 / vec2<f32>(textureDimensions(source_texture));
    var color = textureSample(source_texture, source_sampler, input.uv) * 4.0;
    color += textureSample(source_texture, source_sampler, input.uv + vec2<f32>(-texel.x, -texel.y));
    color += textureSample(source_texture, source_sampler, input.uv + vec2<f32>(texel.x, -texel.y));
    color += textureSample(source_texture, source_sampler, input.uv + vec2<f32>(-texel.x, texel.y));
    color += textureSample(source_texture, source_sampler, input.uv + vec2<f32>(texel.x, texel.y));
    return vec4<f32>(color.rgb / 8.0, 1.0);
}
"#
);

pub const BLOOM_UPSAMPLE_SHADER: &str = concat!(
    fullscreen_vertex_wgsl!(),
    bloom_bindings_wgsl!(),
    r#"
// 3x3 tent filter
@fragment
fn fs_main(input: FullscreenOutput) -> @location(0) vec4<f32> {
    let texel = 1.0 / vec2<f32>(textureDimensions(source_texture));
    var color = vec3<f32>(0.0);
    for (var y = -1; y <= 1; y++) {
        for (var x = -1; x <= 1; x++) {
            let weight = f32((2 - abs(x)) * (2 - abs(y)));
            let offset = vec2<f32>(f32(x), f32(y)) * texel;
            color += textureSample(source_texture, source_sampler, input.uv + offset).rgb * weight;
        }
    }
    return vec4<f32>(color / 16.0, 1.0);
}
"#
);

pub const BLOOM_COMPOSITE_SHADER: &str = concat!(
    fullscreen_vertex_wgsl!(),
    bloom_bindings_wgsl!(),
    r#"
@group(0) @binding(3) var bloom_texture: texture_2d<f32>;

fn reinhard_tonemap(color: vec3<f32>) -> vec3<f32> {
    return color / (color + vec3<f32>(1.0));
}

@fragment
fn fs_main(input: FullscreenOutput) -> @location(0) vec4<f32> {
    let scene = textureSample(source_texture, source_sampler, input.uv).rgb;
    let bloom = textureSample(bloom_texture, source_sampler, input.uv).rgb;
    return vec4<f32>(reinhard_tonemap(scene + bloom * params.intensity), 1.0);
}
"#
);

struct BloomPipelines {
    extract: RenderPipelineHandle,
    downsample: RenderPipelineHandle,
    upsample: RenderPipelineHandle,
    composite: RenderPipelineHandle,
}

/// Bind groups over one size generation of the targets
struct BloomBindGroups {
    generation: u64,
    extract: BindGroupHandle,
    /// `downsample[i]` reads mip i and writes mip i + 1
    downsample: Vec<BindGroupHandle>,
    /// `upsample[i]` reads mip i + 1 and adds into mip i
    upsample: Vec<BindGroupHandle>,
    composite: BindGroupHandle,
}

impl BloomBindGroups {
    fn all(&self) -> impl Iterator<Item = BindGroupHandle> + '_ {
        [self.extract, self.composite]
            .into_iter()
            .chain(self.downsample.iter().copied())
            .chain(self.upsample.iter().copied())
    }
}

/// Extract, blur down the mip chain, blur back up, composite to the swapchain.
///
/// With bloom disabled only the composite runs, with zero intensity, so the scene
/// still reaches the swapchain.
pub struct BloomPass {
    layout: BindGroupLayoutHandle,
    composite_layout: BindGroupLayoutHandle,
    pipelines: BloomPipelines,
    sampler: SamplerHandle,
    params: BufferHandle,
    enabled: bool,
    groups: Option<BloomBindGroups>,
}

impl BloomPass {
    pub fn new(
        backend: &mut dyn GraphicsBackend,
        samplers: &mut SamplerCache,
        config: &BloomConfig,
        output_format: TextureFormat,
    ) -> RenderResult<Self> {
        let mut entries = vec![
            BindGroupLayoutEntry {
                binding: 0,
                visibility: ShaderStageFlags::FRAGMENT,
                ty: BindingType::Texture {
                    sample_type: TextureSampleType::Float { filterable: true },
                },
            },
            BindGroupLayoutEntry {
                binding: 1,
                visibility: ShaderStageFlags::FRAGMENT,
                ty: BindingType::Sampler { comparison: false },
            },
            BindGroupLayoutEntry {
                binding: 2,
                visibility: ShaderStageFlags::FRAGMENT,
                ty: BindingType::UniformBuffer { dynamic: false },
            },
        ];
        let layout = backend.create_bind_group_layout(&entries)?;
        entries.push(BindGroupLayoutEntry {
            binding: 3,
            visibility: ShaderStageFlags::FRAGMENT,
            ty: BindingType::Texture {
                sample_type: TextureSampleType::Float { filterable: true },
            },
        });
        let composite_layout = backend.create_bind_group_layout(&entries)?;

        let pipelines = BloomPipelines {
            extract: Self::create_pipeline(backend, "bloom_extract", BLOOM_EXTRACT_SHADER, layout, HDR_FORMAT, None)?,
            downsample: Self::create_pipeline(
                backend,
                "bloom_downsample",
                BLOOM_DOWNSAMPLE_SHADER,
                layout,
                HDR_FORMAT,
                None,
            )?,
            upsample: Self::create_pipeline(
                backend,
                "bloom_upsample",
                BLOOM_UPSAMPLE_SHADER,
                layout,
                HDR_FORMAT,
                Some(BlendState::additive()),
            )?,
            composite: Self::create_pipeline(
                backend,
                "bloom_composite",
                BLOOM_COMPOSITE_SHADER,
                composite_layout,
                output_format,
                None,
            )?,
        };

        let sampler = samplers.get_or_create(backend, &SamplerConfig::LINEAR_CLAMP)?;
        let params = backend.create_buffer_init(
            &BufferDescriptor::new(
                "bloom_params",
                std::mem::size_of::<BloomParams>() as u64,
                BufferUsage::UNIFORM | BufferUsage::COPY_DST,
            ),
            bytemuck::bytes_of(&Self::params_for(config)),
        )?;

        Ok(Self {
            layout,
            composite_layout,
            pipelines,
            sampler,
            params,
            enabled: !config.force_disable,
            groups: None,
        })
    }

    fn params_for(config: &BloomConfig) -> BloomParams {
        BloomParams {
            threshold: config.threshold,
            intensity: if config.force_disable { 0.0 } else { config.intensity },
            _padding: [0.0; 2],
        }
    }

    fn create_pipeline(
        backend: &mut dyn GraphicsBackend,
        label: &str,
        shader: &str,
        layout: BindGroupLayoutHandle,
        format: TextureFormat,
        blend: Option<BlendState>,
    ) -> RenderResult<RenderPipelineHandle> {
        Ok(backend.create_render_pipeline(&RenderPipelineDescriptor {
            label: Some(label.to_string()),
            vertex_shader: shader.to_string(),
            fragment_shader: Some(shader.to_string()),
            vertex_layouts: vec![],
            bind_group_layouts: vec![layout],
            primitive_topology: PrimitiveTopology::TriangleList,
            front_face: FrontFace::Ccw,
            cull_mode: CullMode::None,
            depth_stencil: None,
            color_targets: vec![ColorTargetState {
                format,
                blend,
                write_mask: ColorWrites::ALL,
            }],
        })?)
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Apply new threshold, intensity or enable state
    pub fn configure(&mut self, backend: &mut dyn GraphicsBackend, config: &BloomConfig) {
        self.enabled = !config.force_disable;
        backend.write_buffer(self.params, 0, bytemuck::bytes_of(&Self::params_for(config)));
    }

    fn source_group(
        &self,
        backend: &mut dyn GraphicsBackend,
        source: TextureViewHandle,
    ) -> RenderResult<BindGroupHandle> {
        Ok(backend.create_bind_group(
            self.layout,
            &[
                (0, BindGroupEntry::Texture(source)),
                (1, BindGroupEntry::Sampler(self.sampler)),
                (
                    2,
                    BindGroupEntry::Buffer {
                        buffer: self.params,
                        offset: 0,
                        size: None,
                    },
                ),
            ],
        )?)
    }

    fn build_groups(
        &self,
        backend: &mut dyn GraphicsBackend,
        targets: &TargetSet,
        generation: u64,
    ) -> RenderResult<BloomBindGroups> {
        let extract = self.source_group(backend, targets.emissive.view)?;
        let mut downsample = Vec::new();
        let mut upsample = Vec::new();
        for pair in targets.bloom_mips.windows(2) {
            downsample.push(self.source_group(backend, pair[0].view)?);
            upsample.push(self.source_group(backend, pair[1].view)?);
        }
        let bloom_view = targets
            .bloom_mips
            .first()
            .map_or(targets.emissive.view, |mip| mip.view);
        let composite = backend.create_bind_group(
            self.composite_layout,
            &[
                (0, BindGroupEntry::Texture(targets.scene_color.view)),
                (1, BindGroupEntry::Sampler(self.sampler)),
                (
                    2,
                    BindGroupEntry::Buffer {
                        buffer: self.params,
                        offset: 0,
                        size: None,
                    },
                ),
                (3, BindGroupEntry::Texture(bloom_view)),
            ],
        )?;
        Ok(BloomBindGroups {
            generation,
            extract,
            downsample,
            upsample,
            composite,
        })
    }

    #[allow(clippy::too_many_arguments)]
    fn fullscreen(
        &self,
        backend: &mut dyn GraphicsBackend,
        state: &mut RenderPassState,
        label: &'static str,
        target: TextureViewHandle,
        load_op: LoadOp,
        pipeline: RenderPipelineHandle,
        group: BindGroupHandle,
    ) {
        backend.begin_render_pass(&RenderPassDescriptor {
            label: Some(label.into()),
            color_attachments: vec![ColorAttachment {
                view: target,
                load_op,
                store_op: StoreOp::Store,
            }],
            depth_stencil_attachment: None,
        });
        state.begin_pass(label);
        state.set_pipeline(backend, pipeline);
        state.set_bind_group(backend, 0, group, &[]);
        backend.draw(0..3, 0..1);
        backend.end_render_pass();
        state.end_pass();
    }

    /// Run the bloom chain and write the tonemapped result into `output`.
    ///
    /// Returns the number of passes recorded.
    pub fn execute(
        &mut self,
        backend: &mut dyn GraphicsBackend,
        state: &mut RenderPassState,
        targets: &TargetSet,
        generation: u64,
        output: TextureViewHandle,
    ) -> RenderResult<u32> {
        if self.groups.as_ref().map(|g| g.generation) != Some(generation) {
            if let Some(old) = self.groups.take() {
                for group in old.all() {
                    backend.destroy_bind_group(group);
                }
            }
            self.groups = Some(self.build_groups(backend, targets, generation)?);
        }
        let Some(groups) = self.groups.as_ref() else {
            return Ok(0);
        };

        let mut passes = 0;
        let clear = LoadOp::Clear([0.0, 0.0, 0.0, 1.0]);
        if self.enabled {
            if let Some(first) = targets.bloom_mips.first() {
                self.fullscreen(
                    backend,
                    state,
                    BLOOM_EXTRACT_LABEL,
                    first.view,
                    clear.clone(),
                    self.pipelines.extract,
                    groups.extract,
                );
                passes += 1;
            }
            for (i, group) in groups.downsample.iter().enumerate() {
                let dst = targets.bloom_mips[i + 1].view;
                self.fullscreen(
                    backend,
                    state,
                    BLOOM_DOWNSAMPLE_LABEL,
                    dst,
                    clear.clone(),
                    self.pipelines.downsample,
                    *group,
                );
                passes += 1;
            }
            for (i, group) in groups.upsample.iter().enumerate().rev() {
                let dst = targets.bloom_mips[i].view;
                self.fullscreen(
                    backend,
                    state,
                    BLOOM_UPSAMPLE_LABEL,
                    dst,
                    LoadOp::Load,
                    self.pipelines.upsample,
                    *group,
                );
                passes += 1;
            }
        }
        self.fullscreen(
            backend,
            state,
            BLOOM_COMPOSITE_LABEL,
            output,
            clear,
            self.pipelines.composite,
            groups.composite,
        );
        Ok(passes + 1)
    }

    pub fn release(&mut self, backend: &mut dyn GraphicsBackend) {
        if let Some(groups) = self.groups.take() {
            for group in groups.all() {
                backend.destroy_bind_group(group);
            }
        }
        backend.destroy_buffer(self.params);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::HeadlessBackend;
    use crate::pipeline::targets::AuxiliaryTargets;

    fn run(config: &BloomConfig, levels: u32) -> (u32, Vec<String>) {
        let mut backend = HeadlessBackend::new(256, 256);
        let mut samplers = SamplerCache::new();
        let format = backend.swapchain_format();
        let mut pass = BloomPass::new(&mut backend, &mut samplers, config, format).unwrap();
        let mut targets = AuxiliaryTargets::new(levels);
        assert!(targets.ensure(&mut backend, (256, 256), 1));
        let output = targets.get().unwrap().scene_color.view;

        backend.begin_commands().unwrap();
        let passes = pass
            .execute(&mut backend, &mut RenderPassState::new(), targets.get().unwrap(), 1, output)
            .unwrap();
        (passes, backend.render_pass_labels())
    }

    #[test]
    fn test_full_chain_pass_order() {
        let (passes, labels) = run(&BloomConfig::default(), 3);
        assert_eq!(passes, 6);
        assert_eq!(
            labels,
            vec![
                BLOOM_EXTRACT_LABEL,
                BLOOM_DOWNSAMPLE_LABEL,
                BLOOM_DOWNSAMPLE_LABEL,
                BLOOM_UPSAMPLE_LABEL,
                BLOOM_UPSAMPLE_LABEL,
                BLOOM_COMPOSITE_LABEL
            ]
        );
    }

    #[test]
    fn test_disabled_bloom_only_composites() {
        let config = BloomConfig {
            force_disable: true,
            ..BloomConfig::default()
        };
        let (passes, labels) = run(&config, 3);
        assert_eq!(passes, 1);
        assert_eq!(labels, vec![BLOOM_COMPOSITE_LABEL]);
    }
}
