//! Presentation surface: the window's image chain as seen by the renderer

use crate::backend::{
    BackendError, FrameContext, GraphicsBackend, PresentMode, SurfaceConfiguration,
};
use crate::device::{CommandRecorder, DeviceId, GraphicsDevice};
use crate::error::{LastError, RenderError};

/// Result of the most recent acquire attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AcquireStatus {
    Ready,
    /// Nothing to draw into this tick (minimized, timeout, surface being rebuilt)
    Unavailable,
    Failed,
}

/// Surface state tracked against the device that claimed it.
///
/// Size and present-mode changes are deferred and applied at the next acquire,
/// so they never take effect in the middle of a frame.
pub struct PresentationSurface {
    claimed_by: Option<DeviceId>,
    size: (u32, u32),
    pending_size: Option<(u32, u32)>,
    present_mode: PresentMode,
    pending_present_mode: Option<PresentMode>,
    needs_configure: bool,
    minimized: bool,
    size_generation: u64,
    image_acquired: bool,
    last_status: AcquireStatus,
    last_error: LastError,
}

impl PresentationSurface {
    pub fn new(width: u32, height: u32, present_mode: PresentMode) -> Self {
        Self {
            claimed_by: None,
            size: (width, height),
            pending_size: None,
            present_mode,
            pending_present_mode: None,
            needs_configure: true,
            minimized: width == 0 || height == 0,
            size_generation: 0,
            image_acquired: false,
            last_status: AcquireStatus::Unavailable,
            last_error: LastError::new(),
        }
    }

    /// Claim the surface for a device.
    ///
    /// Claiming again with the same device is a no-op that succeeds; claiming a surface
    /// held by another device fails until it is released.
    pub fn claim<B: GraphicsBackend>(&mut self, device: &mut GraphicsDevice<B>) -> bool {
        match self.claimed_by {
            Some(owner) if owner == device.id() => true,
            Some(_) => {
                self.last_error.set("surface is already claimed by another device");
                false
            }
            None => {
                self.claimed_by = Some(device.id());
                self.needs_configure = true;
                if self.minimized {
                    // Configured on the first acquire after the window is restored
                    return true;
                }
                if self.configure(device) {
                    log::info!("Surface claimed at {}x{}", self.size.0, self.size.1);
                    true
                } else {
                    self.claimed_by = None;
                    false
                }
            }
        }
    }

    /// Release the claim; the surface may be claimed again afterwards
    pub fn release(&mut self) {
        if self.claimed_by.take().is_some() {
            log::info!("Surface released");
        }
        self.image_acquired = false;
    }

    pub fn is_claimed(&self) -> bool {
        self.claimed_by.is_some()
    }

    pub fn is_claimed_by(&self, device: DeviceId) -> bool {
        self.claimed_by == Some(device)
    }

    /// Record a new window size. Size-dependent targets are rebuilt before the next pass.
    pub fn on_resize(&mut self, width: u32, height: u32) {
        if width == 0 || height == 0 {
            log::debug!("Surface minimized");
            self.minimized = true;
            return;
        }
        self.minimized = false;
        if self.pending_size.is_none() && (width, height) == self.size && !self.needs_configure {
            return;
        }
        log::debug!("Surface resize to {}x{} pending", width, height);
        self.pending_size = Some((width, height));
    }

    /// Request a present mode; applied with the next acquired image
    pub fn set_present_mode(&mut self, present_mode: PresentMode) {
        if present_mode != self.present_mode {
            self.pending_present_mode = Some(present_mode);
        }
    }

    fn configure<B: GraphicsBackend>(&mut self, device: &mut GraphicsDevice<B>) -> bool {
        let (width, height) = self.pending_size.unwrap_or(self.size);
        let present_mode = self.pending_present_mode.unwrap_or(self.present_mode);
        let config = SurfaceConfiguration::new(width, height).with_present_mode(present_mode);

        match device.backend_mut().configure_surface(&config) {
            Ok(applied) => {
                if applied != (width, height) {
                    log::warn!(
                        "Surface size {}x{} clamped to {}x{}",
                        width,
                        height,
                        applied.0,
                        applied.1
                    );
                }
                if applied != self.size || self.size_generation == 0 {
                    self.size_generation += 1;
                }
                self.size = applied;
                self.present_mode = present_mode;
                self.pending_size = None;
                self.pending_present_mode = None;
                self.needs_configure = false;
                true
            }
            Err(e) => {
                self.last_error.set(format!("surface configuration failed: {e}"));
                false
            }
        }
    }

    /// Acquire the next presentable image.
    ///
    /// `None` skips the frame; `acquire_status` tells a benign skip from a failure.
    pub fn acquire_next_image<B: GraphicsBackend>(
        &mut self,
        device: &mut GraphicsDevice<B>,
        recorder: &CommandRecorder,
    ) -> Option<FrameContext> {
        if !self.is_claimed_by(device.id()) || recorder.device() != device.id() {
            self.last_error.set(RenderError::SurfaceNotClaimed.to_string());
            self.last_status = AcquireStatus::Failed;
            return None;
        }
        if self.image_acquired {
            log::warn!("Previous surface image was never presented");
            self.image_acquired = false;
        }
        if self.minimized {
            self.last_status = AcquireStatus::Unavailable;
            return None;
        }

        let dirty = self.needs_configure
            || self.pending_size.is_some()
            || self.pending_present_mode.is_some();
        if dirty && !self.configure(device) {
            self.last_status = AcquireStatus::Failed;
            return None;
        }

        match device.backend_mut().acquire_next_image() {
            Ok(frame) => {
                self.image_acquired = true;
                self.last_status = AcquireStatus::Ready;
                Some(frame)
            }
            Err(BackendError::SurfaceOutdated) | Err(BackendError::SurfaceLost) => {
                log::info!("Surface outdated, reconfiguring before the next frame");
                self.needs_configure = true;
                self.last_status = AcquireStatus::Unavailable;
                None
            }
            Err(BackendError::Timeout) => {
                log::warn!("Timed out waiting for a surface image");
                self.last_status = AcquireStatus::Unavailable;
                None
            }
            Err(e) => {
                self.last_error.set(format!("acquire failed: {e}"));
                self.last_status = AcquireStatus::Failed;
                None
            }
        }
    }

    /// Present the acquired image
    pub fn present<B: GraphicsBackend>(&mut self, device: &mut GraphicsDevice<B>) -> bool {
        if !self.image_acquired {
            self.last_error.set("present without an acquired image");
            return false;
        }
        self.image_acquired = false;
        match device.backend_mut().present() {
            Ok(()) => true,
            Err(e) => {
                self.last_error.set(format!("present failed: {e}"));
                false
            }
        }
    }

    /// Give an acquired image back without presenting it
    pub(crate) fn drop_image(&mut self) {
        self.image_acquired = false;
    }

    /// Current configured size
    pub fn size(&self) -> (u32, u32) {
        self.size
    }

    /// Bumped whenever the configured size changes; size-dependent targets compare against it
    pub fn size_generation(&self) -> u64 {
        self.size_generation
    }

    pub fn present_mode(&self) -> PresentMode {
        self.present_mode
    }

    pub fn is_minimized(&self) -> bool {
        self.minimized
    }

    pub fn acquire_status(&self) -> AcquireStatus {
        self.last_status
    }

    pub fn last_error(&self) -> Option<&str> {
        self.last_error.get()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::HeadlessBackend;

    fn device() -> GraphicsDevice<HeadlessBackend> {
        GraphicsDevice::new(HeadlessBackend::new(1280, 720), false).unwrap()
    }

    #[test]
    fn test_claim_is_idempotent() {
        let mut device = device();
        let mut surface = PresentationSurface::new(1280, 720, PresentMode::Fifo);
        assert!(surface.claim(&mut device));
        assert!(surface.claim(&mut device));
        assert_eq!(device.backend().configure_count(), 1);
        assert_eq!(surface.size_generation(), 1);
    }

    #[test]
    fn test_claim_by_second_device_fails_until_released() {
        let mut first = device();
        let mut second = device();
        let mut surface = PresentationSurface::new(1280, 720, PresentMode::Fifo);
        assert!(surface.claim(&mut first));
        assert!(!surface.claim(&mut second));
        surface.release();
        assert!(surface.claim(&mut second));
    }

    #[test]
    fn test_present_mode_applies_on_next_acquire() {
        let mut device = device();
        let mut surface = PresentationSurface::new(1280, 720, PresentMode::Fifo);
        surface.claim(&mut device);
        surface.set_present_mode(PresentMode::Mailbox);
        assert_eq!(device.backend().present_mode(), PresentMode::Fifo);

        let recorder = device.acquire_command_recorder().unwrap();
        assert!(surface.acquire_next_image(&mut device, &recorder).is_some());
        assert_eq!(device.backend().present_mode(), PresentMode::Mailbox);
        assert_eq!(surface.present_mode(), PresentMode::Mailbox);
    }

    #[test]
    fn test_minimized_surface_is_unavailable() {
        let mut device = device();
        let mut surface = PresentationSurface::new(1280, 720, PresentMode::Fifo);
        surface.claim(&mut device);
        surface.on_resize(0, 0);

        let recorder = device.acquire_command_recorder().unwrap();
        assert!(surface.acquire_next_image(&mut device, &recorder).is_none());
        assert_eq!(surface.acquire_status(), AcquireStatus::Unavailable);
        assert!(surface.last_error().is_none());
    }

    #[test]
    fn test_outdated_surface_reconfigures_on_next_acquire() {
        let mut device = device();
        let mut surface = PresentationSurface::new(1280, 720, PresentMode::Fifo);
        surface.claim(&mut device);
        device.backend_mut().fail_next_acquire(BackendError::SurfaceOutdated);

        let recorder = device.acquire_command_recorder().unwrap();
        assert!(surface.acquire_next_image(&mut device, &recorder).is_none());
        assert_eq!(surface.acquire_status(), AcquireStatus::Unavailable);

        assert!(surface.acquire_next_image(&mut device, &recorder).is_some());
        assert_eq!(device.backend().configure_count(), 2);
    }

    #[test]
    fn test_resize_bumps_generation_once_applied() {
        let mut device = device();
        let mut surface = PresentationSurface::new(1280, 720, PresentMode::Fifo);
        surface.claim(&mut device);
        surface.on_resize(1920, 1080);
        assert_eq!(surface.size(), (1280, 720));

        let recorder = device.acquire_command_recorder().unwrap();
        let frame = surface.acquire_next_image(&mut device, &recorder).unwrap();
        assert_eq!((frame.width, frame.height), (1920, 1080));
        assert_eq!(surface.size_generation(), 2);
    }
}
