//! Sampler deduplication

use crate::backend::{AddressMode, CompareFunction, FilterMode, GraphicsBackend, SamplerDescriptor, SamplerHandle};
use crate::error::RenderResult;
use std::collections::HashMap;

/// Everything that distinguishes one sampler from another
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SamplerConfig {
    pub mag_filter: FilterMode,
    pub min_filter: FilterMode,
    pub mipmap_filter: FilterMode,
    pub address_mode_u: AddressMode,
    pub address_mode_v: AddressMode,
    pub compare: Option<CompareFunction>,
}

impl SamplerConfig {
    pub const LINEAR_CLAMP: Self = Self::uniform(FilterMode::Linear, AddressMode::ClampToEdge);
    pub const LINEAR_REPEAT: Self = Self::uniform(FilterMode::Linear, AddressMode::Repeat);
    pub const NEAREST_CLAMP: Self = Self::uniform(FilterMode::Nearest, AddressMode::ClampToEdge);
    /// Depth comparison sampler for shadow lookups
    pub const SHADOW: Self = Self {
        compare: Some(CompareFunction::LessEqual),
        ..Self::LINEAR_CLAMP
    };

    const fn uniform(filter: FilterMode, address: AddressMode) -> Self {
        Self {
            mag_filter: filter,
            min_filter: filter,
            mipmap_filter: filter,
            address_mode_u: address,
            address_mode_v: address,
            compare: None,
        }
    }

    fn descriptor(&self) -> SamplerDescriptor {
        SamplerDescriptor {
            label: Some(format!("{:?}/{:?}", self.mag_filter, self.address_mode_u)),
            mag_filter: self.mag_filter,
            min_filter: self.min_filter,
            mipmap_filter: self.mipmap_filter,
            address_mode_u: self.address_mode_u,
            address_mode_v: self.address_mode_v,
            address_mode_w: self.address_mode_u,
            compare: self.compare,
        }
    }
}

impl Default for SamplerConfig {
    fn default() -> Self {
        Self::LINEAR_CLAMP
    }
}

/// Owns every sampler the renderer creates; one per distinct `SamplerConfig`
#[derive(Default)]
pub struct SamplerCache {
    samplers: HashMap<SamplerConfig, SamplerHandle>,
}

impl SamplerCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get_or_create(
        &mut self,
        backend: &mut dyn GraphicsBackend,
        config: &SamplerConfig,
    ) -> RenderResult<SamplerHandle> {
        if let Some(handle) = self.samplers.get(config) {
            return Ok(*handle);
        }
        let handle = backend.create_sampler(&config.descriptor())?;
        log::debug!("Created sampler {:?}", config);
        self.samplers.insert(*config, handle);
        Ok(handle)
    }

    pub fn len(&self) -> usize {
        self.samplers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samplers.is_empty()
    }

    /// Destroy every cached sampler
    pub fn clear(&mut self, backend: &mut dyn GraphicsBackend) {
        for (_, handle) in self.samplers.drain() {
            backend.destroy_sampler(handle);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::HeadlessBackend;

    #[test]
    fn test_same_config_shares_sampler() {
        let mut backend = HeadlessBackend::new(64, 64);
        let mut cache = SamplerCache::new();
        let a = cache.get_or_create(&mut backend, &SamplerConfig::LINEAR_CLAMP).unwrap();
        let b = cache.get_or_create(&mut backend, &SamplerConfig::LINEAR_CLAMP).unwrap();
        let c = cache.get_or_create(&mut backend, &SamplerConfig::SHADOW).unwrap();

        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(cache.len(), 2);
        assert_eq!(backend.live_samplers(), 2);

        cache.clear(&mut backend);
        assert!(cache.is_empty());
        assert_eq!(backend.live_samplers(), 0);
    }
}
