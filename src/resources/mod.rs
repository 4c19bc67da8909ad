//! Resource management
//!
//! Transient per-frame memory (frame pool, uniform pool), cached samplers,
//! per-model instance arrays and the registry of loader-supplied assets.

mod arena;
mod assets;
mod frame_pool;
mod instance_buffer;
mod sampler_cache;
mod uniform_pool;

pub use arena::*;
pub use assets::*;
pub use frame_pool::*;
pub use instance_buffer::*;
pub use sampler_cache::*;
pub use uniform_pool::*;

/// Round `value` up to a multiple of the power-of-two `alignment`
pub(crate) fn align_up(value: u64, alignment: u64) -> u64 {
    debug_assert!(alignment.is_power_of_two());
    (value + alignment - 1) & !(alignment - 1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_align_up() {
        assert_eq!(align_up(0, 256), 0);
        assert_eq!(align_up(1, 256), 256);
        assert_eq!(align_up(256, 256), 256);
        assert_eq!(align_up(257, 16), 272);
    }
}
