//! Graphics device: the logical GPU connection and command submission

use crate::backend::{BackendCapabilities, GraphicsBackend, ShaderFormats, SubmissionIndex};
use crate::error::{LastError, RenderError, RenderResult};
use std::sync::atomic::{AtomicU64, Ordering};

static NEXT_DEVICE_ID: AtomicU64 = AtomicU64::new(1);

/// Identity of a `GraphicsDevice`, used by surfaces to track who claimed them
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DeviceId(u64);

/// Token for an open command recording.
///
/// Only the most recently acquired recorder of a device is live; it is consumed by
/// `submit` or `abandon`. A recorder that was dropped instead is discarded when the
/// next one is acquired.
#[derive(Debug)]
pub struct CommandRecorder {
    device: DeviceId,
    sequence: u64,
}

impl CommandRecorder {
    pub fn device(&self) -> DeviceId {
        self.device
    }

    /// Sequence number of this recording on its device
    pub fn sequence(&self) -> u64 {
        self.sequence
    }
}

/// Owns the backend and mediates all command submission
pub struct GraphicsDevice<B: GraphicsBackend> {
    id: DeviceId,
    backend: B,
    capabilities: BackendCapabilities,
    /// Sequence of the open recording, if any
    open: Option<u64>,
    recordings: u64,
    stale_recordings: u64,
    last_submission: SubmissionIndex,
    submitted: u64,
    failed_submissions: u64,
    last_error: LastError,
}

impl<B: GraphicsBackend> GraphicsDevice<B> {
    /// Wrap an initialized backend.
    ///
    /// Fails if the backend cannot ingest WGSL, since every pipeline is authored in it.
    pub fn new(backend: B, debug_layers_requested: bool) -> RenderResult<Self> {
        let capabilities = backend.capabilities();
        if !capabilities.shader_formats.contains(ShaderFormats::WGSL) {
            return Err(RenderError::Backend(
                crate::backend::BackendError::InitializationFailed(format!(
                    "{} does not accept WGSL shaders",
                    capabilities.adapter_name
                )),
            ));
        }
        if debug_layers_requested && !capabilities.debug_enabled {
            log::warn!("Debug layers requested but not available on {}", capabilities.adapter_name);
        }
        log::info!(
            "Graphics device ready: {} ({:?}, debug: {})",
            capabilities.adapter_name,
            capabilities.backend,
            capabilities.debug_enabled
        );

        Ok(Self {
            id: DeviceId(NEXT_DEVICE_ID.fetch_add(1, Ordering::Relaxed)),
            backend,
            capabilities,
            open: None,
            recordings: 0,
            stale_recordings: 0,
            last_submission: SubmissionIndex::NONE,
            submitted: 0,
            failed_submissions: 0,
            last_error: LastError::new(),
        })
    }

    pub fn id(&self) -> DeviceId {
        self.id
    }

    pub fn capabilities(&self) -> &BackendCapabilities {
        &self.capabilities
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    pub fn backend_mut(&mut self) -> &mut B {
        &mut self.backend
    }

    /// Open a command recording; `None` if the backend refuses.
    ///
    /// A recording left open by a dropped recorder is discarded first, so one lost
    /// frame never blocks the next.
    pub fn acquire_command_recorder(&mut self) -> Option<CommandRecorder> {
        if let Some(sequence) = self.open.take() {
            log::warn!("Command recording {sequence} was never submitted or abandoned; discarding it");
            self.stale_recordings += 1;
            self.backend.discard_commands();
        }
        if let Err(e) = self.backend.begin_commands() {
            self.last_error.set(format!("failed to begin command recording: {e}"));
            return None;
        }
        self.recordings += 1;
        self.open = Some(self.recordings);
        Some(CommandRecorder {
            device: self.id,
            sequence: self.recordings,
        })
    }

    /// Whether `recorder` is this device's open recording
    fn is_live(&self, recorder: &CommandRecorder) -> bool {
        recorder.device == self.id && self.open == Some(recorder.sequence)
    }

    /// Submit a recording to the queue.
    ///
    /// Failures are reported, never retried; the caller drops the frame.
    pub fn submit(&mut self, recorder: CommandRecorder) -> Option<SubmissionIndex> {
        if !self.is_live(&recorder) {
            self.last_error.set(if recorder.device != self.id {
                "command recorder belongs to another device"
            } else {
                "command recorder is no longer open"
            });
            return None;
        }
        self.open = None;
        match self.backend.submit() {
            Ok(index) => {
                self.submitted += 1;
                self.last_submission = index;
                Some(index)
            }
            Err(e) => {
                self.failed_submissions += 1;
                self.last_error.set(format!("submit failed: {e}"));
                None
            }
        }
    }

    /// Drop a recording without submitting it
    pub fn abandon(&mut self, recorder: CommandRecorder) {
        if !self.is_live(&recorder) {
            log::warn!("Abandoning a command recorder that is not open on this device");
            return;
        }
        self.open = None;
        self.backend.discard_commands();
    }

    /// Whether a command recording is currently open
    pub fn is_recording(&self) -> bool {
        self.open.is_some()
    }

    /// Recordings discarded because their recorder was dropped
    pub fn stale_recordings(&self) -> u64 {
        self.stale_recordings
    }

    /// Block until the GPU is idle. Only for shutdown and resize boundaries.
    pub fn wait_for_idle(&mut self) -> bool {
        match self.backend.wait_idle() {
            Ok(()) => true,
            Err(e) => {
                self.last_error.set(format!("wait for idle failed: {e}"));
                false
            }
        }
    }

    pub fn last_submission(&self) -> SubmissionIndex {
        self.last_submission
    }

    pub fn submitted_count(&self) -> u64 {
        self.submitted
    }

    pub fn failed_submissions(&self) -> u64 {
        self.failed_submissions
    }

    pub fn last_error(&self) -> Option<&str> {
        self.last_error.get()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::HeadlessBackend;

    #[test]
    fn test_device_rejects_backend_without_wgsl() {
        let backend = HeadlessBackend::new(64, 64).with_shader_formats(ShaderFormats::SPIRV);
        assert!(GraphicsDevice::new(backend, false).is_err());
    }

    #[test]
    fn test_only_latest_recorder_is_live() {
        let mut device = GraphicsDevice::new(HeadlessBackend::new(64, 64), false).unwrap();
        let stale = device.acquire_command_recorder().unwrap();
        let recorder = device.acquire_command_recorder().unwrap();
        assert_eq!(device.stale_recordings(), 1);

        assert!(device.submit(stale).is_none());
        assert!(device.last_error().is_some());
        assert!(device.is_recording());

        let index = device.submit(recorder).unwrap();
        assert_eq!(index, device.last_submission());
        assert!(!device.is_recording());
    }

    #[test]
    fn test_dropped_recorder_does_not_block_the_next() {
        let mut device = GraphicsDevice::new(HeadlessBackend::new(64, 64), false).unwrap();
        drop(device.acquire_command_recorder().unwrap());
        assert!(device.is_recording());

        let recorder = device.acquire_command_recorder().unwrap();
        assert!(device.submit(recorder).is_some());
        assert_eq!(device.submitted_count(), 1);
    }

    #[test]
    fn test_submit_failure_is_reported_not_retried() {
        let mut device = GraphicsDevice::new(HeadlessBackend::new(64, 64), false).unwrap();
        device.backend_mut().fail_next_submit();
        let recorder = device.acquire_command_recorder().unwrap();
        assert!(device.submit(recorder).is_none());
        assert_eq!(device.failed_submissions(), 1);
        assert_eq!(device.submitted_count(), 0);
        assert!(!device.is_recording());
    }

    #[test]
    fn test_recorder_from_other_device_is_rejected() {
        let mut first = GraphicsDevice::new(HeadlessBackend::new(64, 64), false).unwrap();
        let mut second = GraphicsDevice::new(HeadlessBackend::new(64, 64), false).unwrap();
        let recorder = first.acquire_command_recorder().unwrap();
        assert!(second.submit(recorder).is_none());
        assert_eq!(second.last_error(), Some("command recorder belongs to another device"));

        // The owner recovers on its next acquire
        let recorder = first.acquire_command_recorder().unwrap();
        assert!(first.submit(recorder).is_some());
    }
}
