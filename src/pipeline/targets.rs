//! Size-dependent auxiliary render targets
//!
//! Scene color, view-space normals, emissive, depth and the bloom mip chain all
//! follow the surface size. They are rebuilt lazily when the surface's size
//! generation changes; a failed rebuild leaves the set empty so the next frame
//! retries.

use crate::backend::{GraphicsBackend, TextureDescriptor, TextureFormat, TextureHandle, TextureUsage, TextureViewHandle};
use crate::error::{LastError, RenderError, RenderResult};

/// Format of the HDR scene color, normal and emissive targets
pub const HDR_FORMAT: TextureFormat = TextureFormat::Rgba16Float;

/// Format of the scene depth buffer
pub const DEPTH_FORMAT: TextureFormat = TextureFormat::Depth32Float;

/// Texture dimensions relative to the screen size (1.0 = full screen)
#[derive(Debug, Clone, Copy)]
pub struct TextureSize {
    pub width_scale: f32,
    pub height_scale: f32,
}

impl Default for TextureSize {
    fn default() -> Self {
        Self::uniform(1.0)
    }
}

impl TextureSize {
    pub fn uniform(scale: f32) -> Self {
        Self {
            width_scale: scale,
            height_scale: scale,
        }
    }

    /// Never resolves to zero
    pub fn resolve(&self, screen_width: u32, screen_height: u32) -> (u32, u32) {
        let width = ((screen_width as f32) * self.width_scale) as u32;
        let height = ((screen_height as f32) * self.height_scale) as u32;
        (width.max(1), height.max(1))
    }
}

/// A texture with its default view
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RenderTarget {
    pub texture: TextureHandle,
    pub view: TextureViewHandle,
    pub width: u32,
    pub height: u32,
    pub format: TextureFormat,
}

impl RenderTarget {
    pub fn create(
        backend: &mut dyn GraphicsBackend,
        label: &str,
        size: (u32, u32),
        format: TextureFormat,
    ) -> RenderResult<Self> {
        let texture = backend.create_texture(&TextureDescriptor {
            label: Some(label.to_string()),
            width: size.0,
            height: size.1,
            format,
            usage: TextureUsage::RENDER_ATTACHMENT | TextureUsage::TEXTURE_BINDING,
        })?;
        let view = match backend.create_texture_view(texture) {
            Ok(view) => view,
            Err(e) => {
                backend.destroy_texture(texture);
                return Err(e.into());
            }
        };
        Ok(Self {
            texture,
            view,
            width: size.0,
            height: size.1,
            format,
        })
    }

    pub fn destroy(self, backend: &mut dyn GraphicsBackend) {
        backend.destroy_texture_view(self.view);
        backend.destroy_texture(self.texture);
    }

    pub fn size(&self) -> (u32, u32) {
        (self.width, self.height)
    }
}

/// The full set of size-dependent targets for one surface size
#[derive(Debug, Clone)]
pub struct TargetSet {
    pub scene_color: RenderTarget,
    pub normal: RenderTarget,
    pub emissive: RenderTarget,
    pub depth: RenderTarget,
    /// Half resolution first, each following level halves again
    pub bloom_mips: Vec<RenderTarget>,
}

impl TargetSet {
    fn all(&self) -> impl Iterator<Item = &RenderTarget> {
        [&self.scene_color, &self.normal, &self.emissive, &self.depth]
            .into_iter()
            .chain(self.bloom_mips.iter())
    }

    fn destroy(self, backend: &mut dyn GraphicsBackend) {
        for target in [self.scene_color, self.normal, self.emissive, self.depth] {
            target.destroy(backend);
        }
        for mip in self.bloom_mips {
            mip.destroy(backend);
        }
    }
}

/// Owner of the auxiliary targets, keyed by the surface size generation
pub struct AuxiliaryTargets {
    set: Option<TargetSet>,
    generation: u64,
    bloom_levels: u32,
    rebuilds: u64,
    last_error: LastError,
}

impl AuxiliaryTargets {
    pub fn new(bloom_levels: u32) -> Self {
        Self {
            set: None,
            generation: 0,
            bloom_levels: bloom_levels.max(1),
            rebuilds: 0,
            last_error: LastError::new(),
        }
    }

    /// Make sure the targets match `size`; rebuilds when `generation` moved on.
    ///
    /// Returns false when a target could not be created. Nothing is kept in that
    /// case, so the next call tries again.
    pub fn ensure(&mut self, backend: &mut dyn GraphicsBackend, size: (u32, u32), generation: u64) -> bool {
        if self.set.is_some() && self.generation == generation {
            return true;
        }
        if let Some(old) = self.set.take() {
            old.destroy(backend);
        }

        match Self::build(backend, size, self.bloom_levels) {
            Ok(set) => {
                log::debug!(
                    "Auxiliary targets rebuilt at {}x{} (generation {})",
                    size.0,
                    size.1,
                    generation
                );
                self.set = Some(set);
                self.generation = generation;
                self.rebuilds += 1;
                self.last_error.clear();
                true
            }
            Err(e) => {
                self.last_error
                    .set(format!("auxiliary targets at {}x{} failed: {e}", size.0, size.1));
                false
            }
        }
    }

    fn build(backend: &mut dyn GraphicsBackend, size: (u32, u32), bloom_levels: u32) -> RenderResult<TargetSet> {
        let mut specs = vec![
            ("scene_color".to_string(), size, HDR_FORMAT),
            ("scene_normal".to_string(), size, HDR_FORMAT),
            ("scene_emissive".to_string(), size, HDR_FORMAT),
            ("scene_depth".to_string(), size, DEPTH_FORMAT),
        ];
        for level in 0..bloom_levels {
            let scale = 1.0 / (2u32 << level) as f32;
            let mip_size = TextureSize::uniform(scale).resolve(size.0, size.1);
            specs.push((format!("bloom_mip_{level}"), mip_size, HDR_FORMAT));
        }

        let mut created = Vec::with_capacity(specs.len());
        for (label, target_size, format) in specs {
            match RenderTarget::create(backend, &label, target_size, format) {
                Ok(target) => created.push(target),
                Err(e) => {
                    for target in created {
                        target.destroy(backend);
                    }
                    return Err(e);
                }
            }
        }

        let bloom_mips = created.split_off(4);
        let mut fixed = created.into_iter();
        match (fixed.next(), fixed.next(), fixed.next(), fixed.next()) {
            (Some(scene_color), Some(normal), Some(emissive), Some(depth)) => Ok(TargetSet {
                scene_color,
                normal,
                emissive,
                depth,
                bloom_mips,
            }),
            _ => Err(RenderError::InvalidParameter("incomplete target set".into())),
        }
    }

    pub fn get(&self) -> Option<&TargetSet> {
        self.set.as_ref()
    }

    /// Size generation the current set was built for
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Dimensions of every live target, scene color first
    pub fn dimensions(&self) -> Vec<(u32, u32)> {
        self.set
            .as_ref()
            .map(|set| set.all().map(RenderTarget::size).collect())
            .unwrap_or_default()
    }

    pub fn bloom_levels(&self) -> u32 {
        self.bloom_levels
    }

    /// Number of successful (re)builds
    pub fn rebuilds(&self) -> u64 {
        self.rebuilds
    }

    pub fn last_error(&self) -> Option<&str> {
        self.last_error.get()
    }

    pub fn release(&mut self, backend: &mut dyn GraphicsBackend) {
        if let Some(set) = self.set.take() {
            set.destroy(backend);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::HeadlessBackend;

    #[test]
    fn test_rebuild_only_on_new_generation() {
        let mut backend = HeadlessBackend::new(64, 64);
        let mut targets = AuxiliaryTargets::new(3);
        assert!(targets.ensure(&mut backend, (1280, 720), 1));
        assert!(targets.ensure(&mut backend, (1280, 720), 1));
        assert_eq!(targets.rebuilds(), 1);

        let set = targets.get().unwrap();
        assert_eq!(set.scene_color.size(), (1280, 720));
        let mips: Vec<_> = set.bloom_mips.iter().map(RenderTarget::size).collect();
        assert_eq!(mips, vec![(640, 360), (320, 180), (160, 90)]);
        assert_eq!(backend.live_textures(), 7);

        assert!(targets.ensure(&mut backend, (1920, 1080), 2));
        assert_eq!(targets.get().unwrap().depth.size(), (1920, 1080));
        assert_eq!(backend.live_textures(), 7);
    }

    #[test]
    fn test_failed_rebuild_keeps_nothing_and_retries() {
        let mut backend = HeadlessBackend::new(64, 64);
        let mut targets = AuxiliaryTargets::new(2);
        backend.fail_next_texture_creations(1);

        assert!(!targets.ensure(&mut backend, (800, 600), 1));
        assert!(targets.get().is_none());
        assert!(targets.last_error().is_some());
        assert_eq!(backend.live_textures(), 0);

        assert!(targets.ensure(&mut backend, (800, 600), 1));
        assert!(targets.last_error().is_none());
    }

    #[test]
    fn test_relative_size_never_zero() {
        assert_eq!(TextureSize::uniform(0.001).resolve(100, 100), (1, 1));
        assert_eq!(TextureSize::default().resolve(640, 360), (640, 360));
    }
}
