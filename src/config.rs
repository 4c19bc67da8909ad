//! Renderer configuration

use crate::backend::PresentMode;
use crate::error::{RenderError, RenderResult};
use crate::renderer::RenderLayer;
use glam::{Vec3, Vec4};

/// What the frame pool does when it rotates onto a slot whose GPU work may still be running
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FencePolicy {
    /// Trust the slot rotation alone
    RotationOnly,
    /// Poll the slot's submission; log and count a reuse of unfinished work
    #[default]
    WarnOnOverrun,
    /// Block until the slot's submission has finished
    Wait,
}

/// Configuration for the rotating frame resource pool
#[derive(Debug, Clone)]
pub struct FramePoolConfig {
    /// Number of rotating slots (2..=4)
    pub slot_count: usize,
    /// Staging bytes for constant/buffer uploads per slot
    pub constants_capacity: u64,
    /// Staging bytes for texel uploads per slot
    pub texel_capacity: u64,
    pub fence_policy: FencePolicy,
}

impl Default for FramePoolConfig {
    fn default() -> Self {
        Self {
            slot_count: 3,
            constants_capacity: 1024 * 1024,
            texel_capacity: 4 * 1024 * 1024,
            fence_policy: FencePolicy::default(),
        }
    }
}

/// Configuration for the uniform block allocator
#[derive(Debug, Clone)]
pub struct UniformPoolConfig {
    pub block_capacity: u64,
    /// Minimum alignment; raised to the device's requirement when that is larger
    pub alignment: u64,
}

impl Default for UniformPoolConfig {
    fn default() -> Self {
        Self {
            block_capacity: 256 * 1024,
            alignment: 256,
        }
    }
}

#[derive(Debug, Clone)]
pub struct InstanceConfig {
    pub default_chunk_size: u32,
    pub chunking_enabled: bool,
}

impl Default for InstanceConfig {
    fn default() -> Self {
        Self {
            default_chunk_size: 256,
            chunking_enabled: true,
        }
    }
}

/// Default tint and render layer per transparent object kind; alpha is the translucency
#[derive(Debug, Clone)]
pub struct TransparentStyles {
    pub generic: Vec4,
    pub construction_ghost: Vec4,
    pub selection_overlay: Vec4,
    pub underground_ghost: Vec4,
    pub generic_layer: RenderLayer,
    pub ghost_layer: RenderLayer,
    pub overlay_layer: RenderLayer,
    pub underground_layer: RenderLayer,
}

impl Default for TransparentStyles {
    fn default() -> Self {
        Self {
            generic: Vec4::new(1.0, 1.0, 1.0, 0.5),
            construction_ghost: Vec4::new(0.4, 0.7, 1.0, 0.45),
            selection_overlay: Vec4::new(1.0, 0.9, 0.2, 0.3),
            underground_ghost: Vec4::new(0.6, 0.4, 0.2, 0.35),
            generic_layer: RenderLayer::Effects,
            ghost_layer: RenderLayer::Buildings,
            overlay_layer: RenderLayer::Effects,
            underground_layer: RenderLayer::Terrain,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ClearValues {
    pub color: [f32; 4],
    pub depth: f32,
    /// Encoded "up" normal written before the opaque pass
    pub neutral_normal: [f32; 4],
}

impl Default for ClearValues {
    fn default() -> Self {
        Self {
            color: [0.53, 0.72, 0.87, 1.0],
            depth: 1.0,
            neutral_normal: [0.5, 1.0, 0.5, 0.0],
        }
    }
}

#[derive(Debug, Clone)]
pub struct ShadowConfig {
    pub enabled: bool,
    pub map_size: u32,
    /// Half-width of the orthographic light volume in world units
    pub extent: f32,
    /// Direction the light travels
    pub light_direction: Vec3,
    pub light_intensity: f32,
    pub strength: f32,
}

impl Default for ShadowConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            map_size: 2048,
            extent: 64.0,
            light_direction: Vec3::new(-0.4, -1.0, -0.3),
            light_intensity: 1.0,
            strength: 0.6,
        }
    }
}

#[derive(Debug, Clone)]
pub struct EdgeConfig {
    pub normal_threshold: f32,
    pub depth_threshold: f32,
    pub strength: f32,
    pub color: [f32; 3],
}

impl Default for EdgeConfig {
    fn default() -> Self {
        Self {
            normal_threshold: 0.4,
            depth_threshold: 0.002,
            strength: 0.8,
            color: [0.05, 0.05, 0.08],
        }
    }
}

/// Bloom quality presets; each maps to a number of blur mip levels
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BloomQuality {
    Low,
    #[default]
    Medium,
    High,
}

impl BloomQuality {
    pub fn mip_levels(&self) -> u32 {
        match self {
            BloomQuality::Low => 2,
            BloomQuality::Medium => 3,
            BloomQuality::High => 5,
        }
    }
}

#[derive(Debug, Clone)]
pub struct BloomConfig {
    pub quality: BloomQuality,
    pub threshold: f32,
    pub intensity: f32,
    /// Skip extraction and blur entirely; the scene is still composited to the swapchain
    pub force_disable: bool,
}

impl Default for BloomConfig {
    fn default() -> Self {
        Self {
            quality: BloomQuality::default(),
            threshold: 1.0,
            intensity: 0.6,
            force_disable: false,
        }
    }
}

/// Configuration for the whole renderer
#[derive(Debug, Clone)]
pub struct RendererConfig {
    pub frame_pool: FramePoolConfig,
    pub uniform_pool: UniformPoolConfig,
    pub instances: InstanceConfig,
    pub transparent: TransparentStyles,
    pub clear: ClearValues,
    pub shadow: ShadowConfig,
    pub edge: EdgeConfig,
    pub bloom: BloomConfig,
    pub ambient: Vec3,
    pub present_mode: PresentMode,
    pub debug_layers: bool,
}

impl Default for RendererConfig {
    fn default() -> Self {
        Self {
            frame_pool: FramePoolConfig::default(),
            uniform_pool: UniformPoolConfig::default(),
            instances: InstanceConfig::default(),
            transparent: TransparentStyles::default(),
            clear: ClearValues::default(),
            shadow: ShadowConfig::default(),
            edge: EdgeConfig::default(),
            bloom: BloomConfig::default(),
            ambient: Vec3::new(0.25, 0.27, 0.3),
            present_mode: PresentMode::Fifo,
            debug_layers: cfg!(debug_assertions),
        }
    }
}

impl RendererConfig {
    pub fn with_slot_count(mut self, slot_count: usize) -> Self {
        self.frame_pool.slot_count = slot_count;
        self
    }

    pub fn with_fence_policy(mut self, policy: FencePolicy) -> Self {
        self.frame_pool.fence_policy = policy;
        self
    }

    pub fn with_shadows(mut self, enabled: bool) -> Self {
        self.shadow.enabled = enabled;
        self
    }

    pub fn with_bloom_quality(mut self, quality: BloomQuality) -> Self {
        self.bloom.quality = quality;
        self
    }

    pub fn with_bloom_disabled(mut self, disabled: bool) -> Self {
        self.bloom.force_disable = disabled;
        self
    }

    pub fn with_chunking(mut self, enabled: bool) -> Self {
        self.instances.chunking_enabled = enabled;
        self
    }

    pub fn with_present_mode(mut self, present_mode: PresentMode) -> Self {
        self.present_mode = present_mode;
        self
    }

    pub fn with_debug_layers(mut self, enabled: bool) -> Self {
        self.debug_layers = enabled;
        self
    }

    /// Reject values the renderer cannot work with
    pub fn validate(&self) -> RenderResult<()> {
        let pool = &self.frame_pool;
        if !(2..=4).contains(&pool.slot_count) {
            return Err(RenderError::InvalidParameter(format!(
                "frame pool slot count must be in 2..=4, got {}",
                pool.slot_count
            )));
        }
        if pool.constants_capacity == 0 || pool.texel_capacity == 0 {
            return Err(RenderError::InvalidParameter(
                "frame pool capacities must be non-zero".into(),
            ));
        }
        let uniforms = &self.uniform_pool;
        if !uniforms.alignment.is_power_of_two() {
            return Err(RenderError::InvalidParameter(format!(
                "uniform alignment must be a power of two, got {}",
                uniforms.alignment
            )));
        }
        if uniforms.block_capacity < uniforms.alignment {
            return Err(RenderError::InvalidParameter(format!(
                "uniform block capacity {} is smaller than the alignment {}",
                uniforms.block_capacity, uniforms.alignment
            )));
        }
        if self.instances.default_chunk_size == 0 {
            return Err(RenderError::InvalidParameter("chunk size must be non-zero".into()));
        }
        if self.shadow.map_size == 0 {
            return Err(RenderError::InvalidParameter("shadow map size must be non-zero".into()));
        }
        if self.shadow.light_direction.length_squared() == 0.0 {
            return Err(RenderError::InvalidParameter("light direction must be non-zero".into()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        assert!(RendererConfig::default().validate().is_ok());
    }

    #[test]
    fn test_slot_count_out_of_range_rejected() {
        for slots in [0, 1, 5] {
            let config = RendererConfig::default().with_slot_count(slots);
            assert!(matches!(config.validate(), Err(RenderError::InvalidParameter(_))));
        }
    }

    #[test]
    fn test_non_power_of_two_alignment_rejected() {
        let mut config = RendererConfig::default();
        config.uniform_pool.alignment = 192;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_bloom_quality_mip_levels() {
        assert_eq!(BloomQuality::Low.mip_levels(), 2);
        assert_eq!(BloomQuality::Medium.mip_levels(), 3);
        assert_eq!(BloomQuality::High.mip_levels(), 5);
    }
}
