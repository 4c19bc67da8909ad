//! WGSL sources for the scene passes.
//!
//! Every module exposes `vs_main`, and `fs_main` where it has a fragment stage.
//! The frame block mirrors `FrameUniforms`; the instance inputs mirror `InstanceRecord`.

macro_rules! frame_uniforms_wgsl {
    () => {
        r#"
struct FrameUniforms {
    view_proj: mat4x4<f32>,
    light_view_proj: mat4x4<f32>,
    view: mat4x4<f32>,
    camera_position: vec4<f32>,
    // xyz = direction towards the light, w = intensity
    light_direction: vec4<f32>,
    // rgb = ambient, a = shadow strength
    ambient: vec4<f32>,
    // x = shadow texel size, y = shadows enabled
    shadow_params: vec4<f32>,
}
"#
    };
}

macro_rules! fullscreen_vertex_wgsl {
    () => {
        r#"
struct FullscreenOutput {
    @builtin(position) position: vec4<f32>,
    @location(0) uv: vec2<f32>,
}

@vertex
fn vs_main(@builtin(vertex_index) vertex_index: u32) -> FullscreenOutput {
    var output: FullscreenOutput;

    // Generate fullscreen triangle
    let x = f32((vertex_index << 1u) & 2u);
    let y = f32(vertex_index & 2u);
    output.position = vec4<f32>(x * 2.0 - 1.0, y * 2.0 - 1.0, 0.0, 1.0);
    output.uv = vec2<f32>(x, 1.0 - y);

    return output;
}
"#
    };
}

pub(crate) use fullscreen_vertex_wgsl;

/// Instanced opaque geometry writing color, view-space normal and emissive targets
pub const SCENE_SHADER: &str = concat!(
    frame_uniforms_wgsl!(),
    r#"
struct MaterialUniform {
    base_color: vec4<f32>,
    emissive: vec4<f32>,
}

@group(0) @binding(0) var<uniform> frame: FrameUniforms;
@group(0) @binding(1) var shadow_map: texture_depth_2d;
@group(0) @binding(2) var shadow_sampler: sampler_comparison;

@group(1) @binding(0) var<uniform> material: MaterialUniform;
@group(1) @binding(1) var base_texture: texture_2d<f32>;
@group(1) @binding(2) var base_sampler: sampler;

struct VertexInput {
    @location(0) position: vec3<f32>,
    @location(1) normal: vec3<f32>,
    @location(2) uv: vec2<f32>,
}

struct InstanceInput {
    @location(3) model_0: vec4<f32>,
    @location(4) model_1: vec4<f32>,
    @location(5) model_2: vec4<f32>,
    @location(6) model_3: vec4<f32>,
    @location(7) color: vec4<f32>,
    @location(8) emissive: vec4<f32>,
    @location(9) ambient_override: f32,
}

struct VertexOutput {
    @builtin(position) clip_position: vec4<f32>,
    @location(0) world_position: vec3<f32>,
    @location(1) world_normal: vec3<f32>,
    @location(2) uv: vec2<f32>,
    @location(3) color: vec4<f32>,
    @location(4) emissive: vec4<f32>,
    @location(5) ambient_override: f32,
}

struct SceneOutput {
    @location(0) color: vec4<f32>,
    @location(1) normal: vec4<f32>,
    @location(2) emissive: vec4<f32>,
}

@vertex
fn vs_main(vertex: VertexInput, instance: InstanceInput) -> VertexOutput {
    let model = mat4x4<f32>(instance.model_0, instance.model_1, instance.model_2, instance.model_3);
    let world = model * vec4<f32>(vertex.position, 1.0);

    var out: VertexOutput;
    out.clip_position = frame.view_proj * world;
    out.world_position = world.xyz;
    out.world_normal = normalize((model * vec4<f32>(vertex.normal, 0.0)).xyz);
    out.uv = vertex.uv;
    out.color = instance.color;
    out.emissive = instance.emissive;
    out.ambient_override = instance.ambient_override;
    return out;
}

// 3x3 PCF over the light-space depth map
fn shadow_factor(world_position: vec3<f32>) -> f32 {
    if frame.shadow_params.y < 0.5 {
        return 1.0;
    }
    let light_clip = frame.light_view_proj * vec4<f32>(world_position, 1.0);
    let ndc = light_clip.xyz / light_clip.w;
    let uv = vec2<f32>(ndc.x * 0.5 + 0.5, 0.5 - ndc.y * 0.5);
    if uv.x < 0.0 || uv.x > 1.0 || uv.y < 0.0 || uv.y > 1.0 || ndc.z > 1.0 {
        return 1.0;
    }
    let texel = frame.shadow_params.x;
    var lit = 0.0;
    for (var y = -1; y <= 1; y++) {
        for (var x = -1; x <= 1; x++) {
            let offset = vec2<f32>(f32(x), f32(y)) * texel;
            lit += textureSampleCompareLevel(shadow_map, shadow_sampler, uv + offset, ndc.z);
        }
    }
    return mix(1.0 - frame.ambient.a, 1.0, lit / 9.0);
}

@fragment
fn fs_main(in: VertexOutput) -> SceneOutput {
    let albedo = textureSample(base_texture, base_sampler, in.uv) * material.base_color * in.color;
    let normal = normalize(in.world_normal);
    let light_dir = normalize(frame.light_direction.xyz);
    let ndotl = max(dot(normal, light_dir), 0.0);

    var ambient = frame.ambient.rgb;
    if in.ambient_override >= 0.0 {
        ambient = vec3<f32>(in.ambient_override);
    }

    let direct = ndotl * frame.light_direction.w * shadow_factor(in.world_position);
    let emissive = in.emissive.rgb * in.emissive.a + material.emissive.rgb * material.emissive.a;
    let view_normal = normalize((frame.view * vec4<f32>(normal, 0.0)).xyz);

    var out: SceneOutput;
    out.color = vec4<f32>(albedo.rgb * (ambient + direct) + emissive, albedo.a);
    out.normal = vec4<f32>(view_normal * 0.5 + 0.5, 1.0);
    out.emissive = vec4<f32>(emissive, 1.0);
    return out;
}
"#
);

/// Depth-only light-space render of instanced geometry
pub const SHADOW_SHADER: &str = concat!(
    frame_uniforms_wgsl!(),
    r#"
@group(0) @binding(0) var<uniform> frame: FrameUniforms;

struct ShadowInput {
    @location(0) position: vec3<f32>,
    @location(3) model_0: vec4<f32>,
    @location(4) model_1: vec4<f32>,
    @location(5) model_2: vec4<f32>,
    @location(6) model_3: vec4<f32>,
}

@vertex
fn vs_main(in: ShadowInput) -> @builtin(position) vec4<f32> {
    let model = mat4x4<f32>(in.model_0, in.model_1, in.model_2, in.model_3);
    return frame.light_view_proj * model * vec4<f32>(in.position, 1.0);
}
"#
);

/// Alpha-blended single objects; model, color and emissive come from a per-object block
pub const TRANSPARENT_SHADER: &str = concat!(
    frame_uniforms_wgsl!(),
    r#"
struct MaterialUniform {
    base_color: vec4<f32>,
    emissive: vec4<f32>,
}

struct ObjectUniform {
    model: mat4x4<f32>,
    color: vec4<f32>,
    emissive: vec4<f32>,
}

@group(0) @binding(0) var<uniform> frame: FrameUniforms;
@group(0) @binding(1) var shadow_map: texture_depth_2d;
@group(0) @binding(2) var shadow_sampler: sampler_comparison;

@group(1) @binding(0) var<uniform> material: MaterialUniform;
@group(1) @binding(1) var base_texture: texture_2d<f32>;
@group(1) @binding(2) var base_sampler: sampler;

@group(2) @binding(0) var<uniform> object: ObjectUniform;

struct VertexInput {
    @location(0) position: vec3<f32>,
    @location(1) normal: vec3<f32>,
    @location(2) uv: vec2<f32>,
}

struct VertexOutput {
    @builtin(position) clip_position: vec4<f32>,
    @location(0) world_normal: vec3<f32>,
    @location(1) uv: vec2<f32>,
}

@vertex
fn vs_main(vertex: VertexInput) -> VertexOutput {
    let world = object.model * vec4<f32>(vertex.position, 1.0);

    var out: VertexOutput;
    out.clip_position = frame.view_proj * world;
    out.world_normal = normalize((object.model * vec4<f32>(vertex.normal, 0.0)).xyz);
    out.uv = vertex.uv;
    return out;
}

@fragment
fn fs_main(in: VertexOutput) -> @location(0) vec4<f32> {
    let albedo = textureSample(base_texture, base_sampler, in.uv) * material.base_color * object.color;
    let ndotl = max(dot(normalize(in.world_normal), normalize(frame.light_direction.xyz)), 0.0);
    let lit = albedo.rgb * (frame.ambient.rgb + ndotl * frame.light_direction.w);
    let emissive = object.emissive.rgb * object.emissive.a;
    return vec4<f32>(lit + emissive, albedo.a);
}
"#
);

/// Screen-space edges from normal and depth discontinuities, blended over the scene color
pub const EDGE_SHADER: &str = concat!(
    fullscreen_vertex_wgsl!(),
    r#"
struct EdgeParams {
    // rgb = edge color
    color: vec4<f32>,
    // x = normal threshold, y = depth threshold, z = strength
    thresholds: vec4<f32>,
}

@group(0) @binding(0) var normal_texture: texture_2d<f32>;
@group(0) @binding(1) var depth_texture: texture_depth_2d;
@group(0) @binding(2) var<uniform> params: EdgeParams;

@fragment
fn fs_main(in: FullscreenOutput) -> @location(0) vec4<f32> {
    let dims = vec2<i32>(textureDimensions(normal_texture));
    let pixel = vec2<i32>(in.position.xy);
    let center_normal = textureLoad(normal_texture, pixel, 0).xyz;
    let center_depth = textureLoad(depth_texture, pixel, 0);

    var offsets = array<vec2<i32>, 4>(
        vec2<i32>(1, 0),
        vec2<i32>(-1, 0),
        vec2<i32>(0, 1),
        vec2<i32>(0, -1),
    );

    var normal_edge = 0.0;
    var depth_edge = 0.0;
    for (var i = 0; i < 4; i++) {
        let neighbor = clamp(pixel + offsets[i], vec2<i32>(0, 0), dims - vec2<i32>(1, 1));
        let normal = textureLoad(normal_texture, neighbor, 0).xyz;
        let depth = textureLoad(depth_texture, neighbor, 0);
        normal_edge = max(normal_edge, length(normal - center_normal));
        depth_edge = max(depth_edge, abs(depth - center_depth));
    }

    let edge = max(step(params.thresholds.x, normal_edge), step(params.thresholds.y, depth_edge));
    return vec4<f32>(params.color.rgb, edge * params.thresholds.z);
}
"#
);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_every_shader_has_entry_points() {
        for source in [SCENE_SHADER, TRANSPARENT_SHADER, EDGE_SHADER] {
            assert!(source.contains("fn vs_main"));
            assert!(source.contains("fn fs_main"));
        }
        assert!(SHADOW_SHADER.contains("fn vs_main"));
        assert!(!SHADOW_SHADER.contains("fn fs_main"));
    }
}
