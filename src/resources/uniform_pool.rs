//! Block allocator for frame-scoped uniform data.
//!
//! Allocations are aligned to the uniform offset alignment so they can be bound
//! with dynamic offsets. They live until the next `reset`; nothing is freed
//! individually. GPU memory is only returned by `release_all`.

use crate::backend::{BufferDescriptor, BufferHandle, BufferUsage, GraphicsBackend};
use crate::config::UniformPoolConfig;
use crate::error::{LastError, RenderError};
use crate::resources::align_up;

/// A region of a uniform block, valid until the pool's next `reset`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UniformAllocation {
    pub buffer: BufferHandle,
    pub offset: u64,
    pub size: u64,
}

impl UniformAllocation {
    /// Offset in the form `set_bind_group` takes
    pub fn dynamic_offset(&self) -> u32 {
        self.offset as u32
    }
}

struct UniformBlock {
    buffer: BufferHandle,
    cursor: u64,
}

pub struct UniformBufferPool {
    blocks: Vec<UniformBlock>,
    current: usize,
    block_capacity: u64,
    alignment: u64,
    frame_usage: u64,
    last_frame_peak: u64,
    failed_allocations: u64,
    last_error: LastError,
}

impl UniformBufferPool {
    /// `device_alignment` is the backend's minimum uniform offset alignment
    pub fn new(config: &UniformPoolConfig, device_alignment: u32) -> Self {
        let alignment = config
            .alignment
            .max(device_alignment as u64)
            .max(1)
            .next_power_of_two();
        Self {
            blocks: Vec::new(),
            current: 0,
            block_capacity: config.block_capacity,
            alignment,
            frame_usage: 0,
            last_frame_peak: 0,
            failed_allocations: 0,
            last_error: LastError::new(),
        }
    }

    fn create_block(&mut self, backend: &mut dyn GraphicsBackend) -> Option<usize> {
        let label = format!("uniform_block_{}", self.blocks.len());
        match backend.create_buffer(&BufferDescriptor::new(
            label,
            self.block_capacity,
            BufferUsage::UNIFORM | BufferUsage::COPY_DST,
        )) {
            Ok(buffer) => {
                log::debug!("Uniform pool grew to {} blocks", self.blocks.len() + 1);
                self.blocks.push(UniformBlock { buffer, cursor: 0 });
                Some(self.blocks.len() - 1)
            }
            Err(e) => {
                self.last_error.set(format!("uniform block creation failed: {e}"));
                None
            }
        }
    }

    /// Allocate `size` bytes at an aligned offset.
    ///
    /// Fails for zero sizes and for sizes larger than one block.
    pub fn allocate(&mut self, backend: &mut dyn GraphicsBackend, size: u64) -> Option<UniformAllocation> {
        if size == 0 || size > self.block_capacity {
            self.failed_allocations += 1;
            let error = if size == 0 {
                RenderError::InvalidParameter("zero-sized uniform allocation".into())
            } else {
                RenderError::AllocationTooLarge {
                    requested: size,
                    capacity: self.block_capacity,
                }
            };
            self.last_error.set(error.to_string());
            return None;
        }

        let mut index = self.current;
        loop {
            if index == self.blocks.len() {
                match self.create_block(backend) {
                    Some(created) => index = created,
                    None => {
                        self.failed_allocations += 1;
                        return None;
                    }
                }
            }
            let block = &mut self.blocks[index];
            let offset = align_up(block.cursor, self.alignment);
            if offset + size <= self.block_capacity {
                block.cursor = offset + size;
                self.current = index;
                self.frame_usage += size;
                return Some(UniformAllocation {
                    buffer: block.buffer,
                    offset,
                    size,
                });
            }
            index += 1;
        }
    }

    /// Allocate and fill with `data`
    pub fn write(&mut self, backend: &mut dyn GraphicsBackend, data: &[u8]) -> Option<UniformAllocation> {
        let allocation = self.allocate(backend, data.len() as u64)?;
        backend.write_buffer(allocation.buffer, allocation.offset, data);
        Some(allocation)
    }

    /// Rewind every block for a new frame
    pub fn reset(&mut self) {
        self.last_frame_peak = self.frame_usage;
        self.frame_usage = 0;
        self.current = 0;
        for block in &mut self.blocks {
            block.cursor = 0;
        }
    }

    /// Destroy every block
    pub fn release_all(&mut self, backend: &mut dyn GraphicsBackend) {
        for block in self.blocks.drain(..) {
            backend.destroy_buffer(block.buffer);
        }
        self.current = 0;
        self.frame_usage = 0;
    }

    pub fn alignment(&self) -> u64 {
        self.alignment
    }

    pub fn block_capacity(&self) -> u64 {
        self.block_capacity
    }

    pub fn block_count(&self) -> usize {
        self.blocks.len()
    }

    pub fn block_buffers(&self) -> impl Iterator<Item = BufferHandle> + '_ {
        self.blocks.iter().map(|b| b.buffer)
    }

    /// Bytes handed out since the last `reset`
    pub fn frame_usage(&self) -> u64 {
        self.frame_usage
    }

    /// Bytes handed out in the frame before the last `reset`
    pub fn last_frame_peak(&self) -> u64 {
        self.last_frame_peak
    }

    pub fn failed_allocations(&self) -> u64 {
        self.failed_allocations
    }

    pub fn last_error(&self) -> Option<&str> {
        self.last_error.get()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::HeadlessBackend;
    use rstest::rstest;

    fn pool(capacity: u64) -> UniformBufferPool {
        UniformBufferPool::new(
            &UniformPoolConfig {
                block_capacity: capacity,
                alignment: 256,
            },
            64,
        )
    }

    #[test]
    fn test_offsets_respect_alignment() {
        let mut backend = HeadlessBackend::new(64, 64);
        let mut pool = pool(4096);
        for size in [1, 17, 255, 256, 300, 1000] {
            let allocation = pool.allocate(&mut backend, size).unwrap();
            assert_eq!(allocation.offset % 256, 0);
            assert_eq!(allocation.size, size);
        }
    }

    #[rstest]
    #[case::fresh_pool(None)]
    #[case::after_one_byte(Some(1))]
    #[case::after_partial_block(Some(2304))]
    fn test_full_block_allocation(#[case] earlier: Option<u64>) {
        let mut backend = HeadlessBackend::new(64, 64);
        let mut pool = pool(4096);
        let previous = earlier.map(|size| pool.allocate(&mut backend, size).unwrap());

        let capacity = pool.block_capacity();
        let full = pool.allocate(&mut backend, capacity).unwrap();
        assert_eq!(full.offset, 0);
        assert_eq!(full.offset % pool.alignment(), 0);
        assert_eq!(full.size, 4096);
        match previous {
            Some(previous) => {
                assert_ne!(full.buffer, previous.buffer);
                assert_eq!(pool.block_count(), 2);
            }
            None => assert_eq!(pool.block_count(), 1),
        }
        // The full block leaves no room; the next allocation grows again
        let next = pool.allocate(&mut backend, 1).unwrap();
        assert_ne!(next.buffer, full.buffer);
        assert_eq!(next.offset, 0);
    }

    #[test]
    fn test_device_alignment_wins_when_larger() {
        let pool = UniformBufferPool::new(&UniformPoolConfig::default(), 1024);
        assert_eq!(pool.alignment(), 1024);
    }

    #[test]
    fn test_oversized_allocation_fails() {
        let mut backend = HeadlessBackend::new(64, 64);
        let mut pool = pool(1024);
        assert!(pool.allocate(&mut backend, 2048).is_none());
        assert!(pool.last_error().unwrap().contains("exceeds block capacity"));
        assert_eq!(pool.block_count(), 0);
    }

    #[test]
    fn test_grows_new_block_on_exhaustion() {
        let mut backend = HeadlessBackend::new(64, 64);
        let mut pool = pool(1024);
        let first = pool.allocate(&mut backend, 1000).unwrap();
        let second = pool.allocate(&mut backend, 1000).unwrap();
        assert_ne!(first.buffer, second.buffer);
        assert_eq!(second.offset, 0);
        assert_eq!(pool.block_count(), 2);
    }

    #[test]
    fn test_reset_keeps_blocks_and_records_peak() {
        let mut backend = HeadlessBackend::new(64, 64);
        let mut pool = pool(1024);
        pool.allocate(&mut backend, 600).unwrap();
        pool.allocate(&mut backend, 600).unwrap();
        pool.reset();

        assert_eq!(pool.last_frame_peak(), 1200);
        assert_eq!(pool.block_count(), 2);
        let again = pool.allocate(&mut backend, 16).unwrap();
        assert_eq!(again.offset, 0);

        pool.release_all(&mut backend);
        assert_eq!(pool.block_count(), 0);
        assert_eq!(backend.live_buffers(), 0);
    }
}
