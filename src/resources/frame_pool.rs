//! Rotating per-frame staging memory.
//!
//! The pool owns N slots (2..=4). Each slot holds two staging regions, one for
//! constant/buffer uploads and one for texel uploads. Frame N writes into slot
//! `N % slots`, so the CPU can fill the next frame's data while the GPU still
//! reads the previous submissions.
//!
//! # Slot lifecycle
//!
//! ```text
//! Idle --begin_frame--> Mapped --allocate--> Written --end_frame--> Unmapped
//!   ^                                                                  |
//!   +-------------------- rotation wraps back to the slot --------------+
//! ```
//!
//! `begin_frame` is the only place write cursors are reset.
//!
//! # Staged uploads
//!
//! `stage_buffer_upload` and `stage_texture_upload` copy bytes into the current
//! slot and remember a copy command. `flush` writes the slot's staging memory
//! and records those copies. An upload that does not fit falls back to a direct
//! queue write, and the failed allocation is counted.

use crate::backend::{BufferDescriptor, BufferHandle, BufferUsage, GraphicsBackend, SubmissionIndex, TextureHandle};
use crate::config::{FencePolicy, FramePoolConfig};
use crate::error::{RenderError, RenderResult};
use crate::resources::align_up;

/// Alignment of allocations from the constants region
pub const CONSTANTS_ALIGNMENT: u64 = 16;

/// Alignment of texel rows and allocations, as required by buffer-to-texture copies
pub const TEXEL_ROW_ALIGNMENT: u64 = 256;

/// Lifecycle state of one frame slot
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotState {
    Idle,
    Mapped,
    Written,
    Unmapped,
}

/// Which path an upload took
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UploadPath {
    Staged,
    /// The slot was exhausted; the data went through a direct queue write
    Direct,
}

/// A writable region handed out by the pool
pub struct StagingRegion<'a> {
    /// Byte offset of the region inside the slot's staging buffer
    pub offset: u64,
    pub data: &'a mut [u8],
}

#[derive(Debug, Clone, Copy)]
enum PendingCopy {
    Buffer {
        src_offset: u64,
        dst: BufferHandle,
        dst_offset: u64,
        size: u64,
    },
    Texture {
        src_offset: u64,
        bytes_per_row: u32,
        dst: TextureHandle,
        width: u32,
        height: u32,
    },
}

/// CPU shadow of one staging buffer with its write cursor
struct StagingArena {
    buffer: BufferHandle,
    shadow: Vec<u8>,
    cursor: u64,
    flushed: u64,
}

impl StagingArena {
    fn new(backend: &mut dyn GraphicsBackend, label: String, capacity: u64) -> RenderResult<Self> {
        let buffer = backend.create_buffer(&BufferDescriptor::new(
            label,
            capacity,
            BufferUsage::COPY_SRC | BufferUsage::COPY_DST,
        ))?;
        Ok(Self {
            buffer,
            shadow: vec![0; capacity as usize],
            cursor: 0,
            flushed: 0,
        })
    }

    fn capacity(&self) -> u64 {
        self.shadow.len() as u64
    }

    fn fits(&self, size: u64, alignment: u64) -> bool {
        size > 0
            && align_up(self.cursor, alignment)
                .checked_add(size)
                .is_some_and(|end| end <= self.capacity())
    }

    /// Callers check `fits` first
    fn allocate(&mut self, size: u64, alignment: u64) -> StagingRegion<'_> {
        let offset = align_up(self.cursor, alignment);
        self.cursor = offset + size;
        StagingRegion {
            offset,
            data: &mut self.shadow[offset as usize..(offset + size) as usize],
        }
    }

    fn reset(&mut self) {
        self.cursor = 0;
        self.flushed = 0;
    }

    fn flush(&mut self, backend: &mut dyn GraphicsBackend) {
        if self.cursor > self.flushed {
            let range = self.flushed as usize..self.cursor as usize;
            backend.write_buffer(self.buffer, self.flushed, &self.shadow[range]);
            self.flushed = self.cursor;
        }
    }
}

/// One rotating slot of the pool
pub struct FrameResourceSet {
    constants: StagingArena,
    texels: StagingArena,
    frame_stamp: u64,
    submission: SubmissionIndex,
    state: SlotState,
    pending_copies: Vec<PendingCopy>,
}

impl FrameResourceSet {
    pub fn state(&self) -> SlotState {
        self.state
    }

    /// Frame number this slot was last begun for (1-based)
    pub fn frame_stamp(&self) -> u64 {
        self.frame_stamp
    }

    /// Submission that last consumed this slot
    pub fn submission(&self) -> SubmissionIndex {
        self.submission
    }

    pub fn constants_cursor(&self) -> u64 {
        self.constants.cursor
    }

    pub fn texel_cursor(&self) -> u64 {
        self.texels.cursor
    }

    pub fn staging_buffer(&self) -> BufferHandle {
        self.constants.buffer
    }
}

/// N rotating sets of transient upload memory
pub struct FrameResourcePool {
    slots: Vec<FrameResourceSet>,
    current: usize,
    frames_begun: u64,
    in_frame: bool,
    fence_policy: FencePolicy,
    failed_allocations: u64,
    overruns: u64,
}

impl FrameResourcePool {
    pub fn new(backend: &mut dyn GraphicsBackend, config: &FramePoolConfig) -> RenderResult<Self> {
        if !(2..=4).contains(&config.slot_count) {
            return Err(RenderError::InvalidParameter(format!(
                "frame pool needs 2..=4 slots, got {}",
                config.slot_count
            )));
        }

        let mut slots = Vec::with_capacity(config.slot_count);
        for i in 0..config.slot_count {
            slots.push(FrameResourceSet {
                constants: StagingArena::new(
                    backend,
                    format!("frame_constants_{i}"),
                    config.constants_capacity,
                )?,
                texels: StagingArena::new(backend, format!("frame_texels_{i}"), config.texel_capacity)?,
                frame_stamp: 0,
                submission: SubmissionIndex::NONE,
                state: SlotState::Idle,
                pending_copies: Vec::new(),
            });
        }
        log::debug!(
            "Frame pool: {} slots, {} KiB constants, {} KiB texels each",
            config.slot_count,
            config.constants_capacity / 1024,
            config.texel_capacity / 1024
        );

        Ok(Self {
            slots,
            current: 0,
            frames_begun: 0,
            in_frame: false,
            fence_policy: config.fence_policy,
            failed_allocations: 0,
            overruns: 0,
        })
    }

    /// Rotate to the next slot and reset its cursors. Returns the slot index.
    pub fn begin_frame(&mut self, backend: &mut dyn GraphicsBackend) -> usize {
        if self.in_frame {
            log::warn!("FrameResourcePool::begin_frame called twice; ending the previous frame");
            self.end_frame(backend);
        }

        self.current = (self.frames_begun % self.slots.len() as u64) as usize;
        self.frames_begun += 1;

        let slot = &mut self.slots[self.current];
        let submission = slot.submission;
        if submission != SubmissionIndex::NONE && !backend.is_submission_complete(submission) {
            match self.fence_policy {
                FencePolicy::RotationOnly => {}
                FencePolicy::WarnOnOverrun => {
                    self.overruns += 1;
                    log::warn!(
                        "Frame slot {} reused while submission {} is still executing",
                        self.current,
                        submission.value()
                    );
                }
                FencePolicy::Wait => {
                    if let Err(e) = backend.wait_for_submission(submission) {
                        log::error!("Waiting for frame slot {} failed: {e}", self.current);
                    }
                }
            }
        }

        let slot = &mut self.slots[self.current];
        slot.constants.reset();
        slot.texels.reset();
        slot.pending_copies.clear();
        slot.frame_stamp = self.frames_begun;
        slot.state = SlotState::Mapped;
        self.in_frame = true;
        self.current
    }

    /// Allocate from the current slot's constants region
    pub fn allocate(&mut self, size: u64) -> Option<StagingRegion<'_>> {
        self.allocate_in(size, false)
    }

    /// Allocate from the current slot's texel region
    pub fn allocate_texels(&mut self, size: u64) -> Option<StagingRegion<'_>> {
        self.allocate_in(size, true)
    }

    fn allocate_in(&mut self, size: u64, texels: bool) -> Option<StagingRegion<'_>> {
        if !self.in_frame {
            log::warn!("Frame pool allocation outside of a frame");
            self.failed_allocations += 1;
            return None;
        }
        let alignment = if texels { TEXEL_ROW_ALIGNMENT } else { CONSTANTS_ALIGNMENT };
        let slot = &self.slots[self.current];
        let arena = if texels { &slot.texels } else { &slot.constants };
        if !arena.fits(size, alignment) {
            self.failed_allocations += 1;
            log::warn!(
                "Frame slot {} exhausted: {} bytes requested, {} of {} used",
                self.current,
                size,
                arena.cursor,
                arena.capacity()
            );
            return None;
        }

        let slot = &mut self.slots[self.current];
        slot.state = SlotState::Written;
        let arena = if texels { &mut slot.texels } else { &mut slot.constants };
        Some(arena.allocate(size, alignment))
    }

    /// Stage bytes for `dst` at `dst_offset`; copied when the pool is flushed
    pub fn stage_buffer_upload(
        &mut self,
        backend: &mut dyn GraphicsBackend,
        dst: BufferHandle,
        dst_offset: u64,
        bytes: &[u8],
    ) -> UploadPath {
        if bytes.is_empty() {
            return UploadPath::Staged;
        }
        // Buffer copies work in 4-byte units
        let copyable = bytes.len() % 4 == 0 && dst_offset % 4 == 0;
        let staged = if copyable {
            self.allocate(bytes.len() as u64).map(|region| {
                region.data.copy_from_slice(bytes);
                region.offset
            })
        } else {
            None
        };

        match staged {
            Some(src_offset) => {
                self.slots[self.current].pending_copies.push(PendingCopy::Buffer {
                    src_offset,
                    dst,
                    dst_offset,
                    size: bytes.len() as u64,
                });
                UploadPath::Staged
            }
            None => {
                backend.write_buffer(dst, dst_offset, bytes);
                UploadPath::Direct
            }
        }
    }

    /// Stage tightly packed texels for a whole 2D texture
    pub fn stage_texture_upload(
        &mut self,
        backend: &mut dyn GraphicsBackend,
        dst: TextureHandle,
        data: &[u8],
        width: u32,
        height: u32,
        bytes_per_pixel: u32,
    ) -> UploadPath {
        let row = width.checked_mul(bytes_per_pixel).map(|row| row as usize);
        let packed = row.and_then(|row| row.checked_mul(height as usize));
        let (Some(row), Some(packed)) = (row, packed) else {
            self.failed_allocations += 1;
            log::error!(
                "Texture upload of {}x{} at {} bytes per pixel overflows",
                width,
                height,
                bytes_per_pixel
            );
            return UploadPath::Direct;
        };
        if row == 0 || data.len() < packed {
            log::error!(
                "Texture upload of {} bytes is too small for {}x{}",
                data.len(),
                width,
                height
            );
            return UploadPath::Direct;
        }
        let padded_row = align_up(row as u64, TEXEL_ROW_ALIGNMENT);
        // A saturated size never fits and is counted as exhaustion
        let size = padded_row.saturating_mul(height as u64);
        let staged = self.allocate_texels(size).map(|region| {
            for (y, src) in data.chunks_exact(row).take(height as usize).enumerate() {
                let start = y * padded_row as usize;
                region.data[start..start + row].copy_from_slice(src);
            }
            region.offset
        });

        match staged {
            Some(src_offset) => {
                self.slots[self.current].pending_copies.push(PendingCopy::Texture {
                    src_offset,
                    bytes_per_row: padded_row as u32,
                    dst,
                    width,
                    height,
                });
                UploadPath::Staged
            }
            None => {
                backend.write_texture(dst, &data[..packed], width, height);
                UploadPath::Direct
            }
        }
    }

    /// Write the current slot's staging memory and record its pending copies.
    ///
    /// Must be called outside of a render pass.
    pub fn flush(&mut self, backend: &mut dyn GraphicsBackend) {
        if !self.in_frame {
            return;
        }
        let slot = &mut self.slots[self.current];
        slot.constants.flush(backend);
        slot.texels.flush(backend);
        for copy in slot.pending_copies.drain(..) {
            match copy {
                PendingCopy::Buffer {
                    src_offset,
                    dst,
                    dst_offset,
                    size,
                } => backend.copy_buffer_to_buffer(slot.constants.buffer, src_offset, dst, dst_offset, size),
                PendingCopy::Texture {
                    src_offset,
                    bytes_per_row,
                    dst,
                    width,
                    height,
                } => backend.copy_buffer_to_texture(
                    slot.texels.buffer,
                    src_offset,
                    bytes_per_row,
                    dst,
                    width,
                    height,
                ),
            }
        }
    }

    /// Close the current slot. Anything staged after the last `flush` is flushed here.
    pub fn end_frame(&mut self, backend: &mut dyn GraphicsBackend) {
        if !self.in_frame {
            log::warn!("FrameResourcePool::end_frame without begin_frame");
            return;
        }
        if !self.slots[self.current].pending_copies.is_empty() {
            log::debug!("Uploads staged after the upload stage land after this frame's draws");
        }
        self.flush(backend);
        self.slots[self.current].state = SlotState::Unmapped;
        self.in_frame = false;
    }

    /// Associate the current slot with the submission that consumes it
    pub fn stamp_submission(&mut self, index: SubmissionIndex) {
        self.slots[self.current].submission = index;
    }

    pub fn is_in_frame(&self) -> bool {
        self.in_frame
    }

    pub fn slot_count(&self) -> usize {
        self.slots.len()
    }

    pub fn current_slot(&self) -> usize {
        self.current
    }

    pub fn slot(&self, index: usize) -> Option<&FrameResourceSet> {
        self.slots.get(index)
    }

    /// Write cursor of the current slot's constants region
    pub fn current_cursor(&self) -> u64 {
        self.slots[self.current].constants.cursor
    }

    pub fn failed_allocations(&self) -> u64 {
        self.failed_allocations
    }

    /// Slot reuses observed while the previous submission was still running
    pub fn overruns(&self) -> u64 {
        self.overruns
    }

    /// Destroy all staging buffers
    pub fn release(&mut self, backend: &mut dyn GraphicsBackend) {
        for slot in self.slots.drain(..) {
            backend.destroy_buffer(slot.constants.buffer);
            backend.destroy_buffer(slot.texels.buffer);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{HeadlessBackend, RecordedCommand};

    fn pool(backend: &mut HeadlessBackend, slots: usize, capacity: u64) -> FrameResourcePool {
        let config = FramePoolConfig {
            slot_count: slots,
            constants_capacity: capacity,
            texel_capacity: 4096,
            fence_policy: FencePolicy::WarnOnOverrun,
        };
        FrameResourcePool::new(backend, &config).unwrap()
    }

    #[test]
    fn test_rotation_wraps_modulo_slot_count() {
        let mut backend = HeadlessBackend::new(64, 64);
        let mut pool = pool(&mut backend, 3, 1024);
        let slots: Vec<usize> = (0..7)
            .map(|_| {
                let slot = pool.begin_frame(&mut backend);
                pool.end_frame(&mut backend);
                slot
            })
            .collect();
        assert_eq!(slots, vec![0, 1, 2, 0, 1, 2, 0]);
    }

    #[test]
    fn test_allocations_are_aligned_and_exhaust_gracefully() {
        let mut backend = HeadlessBackend::new(64, 64);
        let mut pool = pool(&mut backend, 2, 128);
        pool.begin_frame(&mut backend);

        assert_eq!(pool.allocate(10).unwrap().offset, 0);
        assert_eq!(pool.allocate(10).unwrap().offset, 16);
        assert!(pool.allocate(200).is_none());
        assert_eq!(pool.failed_allocations(), 1);
        // The earlier allocations are untouched by the failure
        assert_eq!(pool.current_cursor(), 26);
    }

    #[test]
    fn test_state_machine() {
        let mut backend = HeadlessBackend::new(64, 64);
        let mut pool = pool(&mut backend, 2, 1024);
        assert_eq!(pool.slot(0).unwrap().state(), SlotState::Idle);

        pool.begin_frame(&mut backend);
        assert_eq!(pool.slot(0).unwrap().state(), SlotState::Mapped);
        pool.allocate(64).unwrap();
        assert_eq!(pool.slot(0).unwrap().state(), SlotState::Written);
        pool.end_frame(&mut backend);
        assert_eq!(pool.slot(0).unwrap().state(), SlotState::Unmapped);
    }

    #[test]
    fn test_nested_begin_force_ends_previous_frame() {
        let mut backend = HeadlessBackend::new(64, 64);
        let mut pool = pool(&mut backend, 2, 1024);
        pool.begin_frame(&mut backend);
        pool.allocate(32).unwrap();
        let slot = pool.begin_frame(&mut backend);

        assert_eq!(slot, 1);
        assert_eq!(pool.slot(0).unwrap().state(), SlotState::Unmapped);
        assert_eq!(pool.current_cursor(), 0);
    }

    #[test]
    fn test_staged_buffer_upload_copies_on_flush() {
        let mut backend = HeadlessBackend::new(64, 64);
        let mut pool = pool(&mut backend, 2, 1024);
        let dst = backend
            .create_buffer(&BufferDescriptor::new("dst", 16, BufferUsage::COPY_DST))
            .unwrap();

        backend.begin_commands().unwrap();
        pool.begin_frame(&mut backend);
        let path = pool.stage_buffer_upload(&mut backend, dst, 8, &[9, 9, 9, 9]);
        assert_eq!(path, UploadPath::Staged);
        pool.flush(&mut backend);

        assert_eq!(&backend.buffer_data(dst).unwrap()[8..12], &[9, 9, 9, 9]);
        assert!(backend
            .commands()
            .iter()
            .any(|c| matches!(c, RecordedCommand::CopyBufferToBuffer { dst: d, .. } if *d == dst)));
    }

    #[test]
    fn test_exhausted_slot_falls_back_to_direct_write() {
        let mut backend = HeadlessBackend::new(64, 64);
        let mut pool = pool(&mut backend, 2, 16);
        let dst = backend
            .create_buffer(&BufferDescriptor::new("dst", 64, BufferUsage::COPY_DST))
            .unwrap();

        pool.begin_frame(&mut backend);
        let bytes = [7u8; 32];
        assert_eq!(pool.stage_buffer_upload(&mut backend, dst, 0, &bytes), UploadPath::Direct);
        assert_eq!(&backend.buffer_data(dst).unwrap()[..32], &bytes);
        assert_eq!(pool.failed_allocations(), 1);
    }

    #[test]
    fn test_overrun_counted_when_slot_still_in_flight() {
        let mut backend = HeadlessBackend::new(64, 64);
        backend.set_submission_lag(4);
        let mut pool = pool(&mut backend, 2, 1024);

        for _ in 0..3 {
            backend.begin_commands().unwrap();
            pool.begin_frame(&mut backend);
            pool.end_frame(&mut backend);
            let index = backend.submit().unwrap();
            pool.stamp_submission(index);
        }
        // Third frame wrapped onto slot 0 while submission 1 was still lagging
        assert_eq!(pool.overruns(), 1);
    }

    #[test]
    fn test_texture_upload_pads_rows() {
        let mut backend = HeadlessBackend::new(64, 64);
        let mut pool = pool(&mut backend, 2, 1024);
        let texture = backend
            .create_texture(&crate::backend::TextureDescriptor {
                width: 2,
                height: 2,
                ..Default::default()
            })
            .unwrap();

        pool.begin_frame(&mut backend);
        let texels = [255u8; 16];
        assert_eq!(
            pool.stage_texture_upload(&mut backend, texture, &texels, 2, 2, 4),
            UploadPath::Staged
        );
        assert_eq!(pool.slot(0).unwrap().texel_cursor(), 512);
    }

    #[test]
    fn test_oversized_allocation_is_exhaustion_not_overflow() {
        let mut backend = HeadlessBackend::new(64, 64);
        let mut pool = pool(&mut backend, 2, 128);
        pool.begin_frame(&mut backend);

        assert_eq!(pool.allocate(8).unwrap().offset, 0);
        assert!(pool.allocate(u64::MAX - 4).is_none());
        assert!(pool.allocate_texels(u64::MAX).is_none());
        assert_eq!(pool.failed_allocations(), 2);
        assert_eq!(pool.current_cursor(), 8);
        // The slot is still usable afterwards
        assert_eq!(pool.allocate(8).unwrap().offset, 16);
    }

    #[test]
    fn test_texture_upload_with_overflowing_row_is_rejected() {
        let mut backend = HeadlessBackend::new(64, 64);
        let mut pool = pool(&mut backend, 2, 1024);
        let texture = backend
            .create_texture(&crate::backend::TextureDescriptor {
                width: 2,
                height: 2,
                ..Default::default()
            })
            .unwrap();

        pool.begin_frame(&mut backend);
        let path = pool.stage_texture_upload(&mut backend, texture, &[0u8; 16], u32::MAX, 2, 4);
        assert_eq!(path, UploadPath::Direct);
        assert_eq!(pool.failed_allocations(), 1);
        assert_eq!(pool.slot(0).unwrap().texel_cursor(), 0);
    }
}
