//! Renderer error types.

use crate::backend::BackendError;
use thiserror::Error;

/// Errors produced by the renderer core
#[derive(Error, Debug, Clone, PartialEq)]
pub enum RenderError {
    #[error(transparent)]
    Backend(#[from] BackendError),
    #[error("invalid parameter: {0}")]
    InvalidParameter(String),
    #[error("allocation of {requested} bytes exceeds block capacity of {capacity} bytes")]
    AllocationTooLarge { requested: u64, capacity: u64 },
    #[error("unknown model {0}")]
    UnknownModel(u32),
    #[error("stale handle: {0}")]
    StaleHandle(String),
    #[error("surface is not claimed by this device")]
    SurfaceNotClaimed,
    #[error("contract violation: {0}")]
    ContractViolation(String),
}

pub type RenderResult<T> = Result<T, RenderError>;

/// Last error message recorded by a component.
///
/// Per-frame operations report failure through `bool`/`Option` and leave the reason here.
#[derive(Debug, Default, Clone)]
pub struct LastError {
    message: Option<String>,
}

impl LastError {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record an error, logging it at error level
    pub fn set(&mut self, message: impl Into<String>) {
        let message = message.into();
        log::error!("{}", message);
        self.message = Some(message);
    }

    pub fn clear(&mut self) {
        self.message = None;
    }

    pub fn get(&self) -> Option<&str> {
        self.message.as_deref()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = RenderError::AllocationTooLarge {
            requested: 300_000,
            capacity: 262_144,
        };
        assert_eq!(
            err.to_string(),
            "allocation of 300000 bytes exceeds block capacity of 262144 bytes"
        );

        let err: RenderError = BackendError::SurfaceLost.into();
        assert_eq!(err.to_string(), "Surface lost");
    }

    #[test]
    fn test_last_error_keeps_latest_message() {
        let mut last = LastError::new();
        assert!(last.get().is_none());
        last.set("first");
        last.set(RenderError::SurfaceNotClaimed.to_string());
        assert_eq!(last.get(), Some("surface is not claimed by this device"));
        last.clear();
        assert!(last.get().is_none());
    }
}
