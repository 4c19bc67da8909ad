//! Frame statistics

/// Counters accumulated across frames for diagnostics.
///
/// Fields prefixed `last_frame_` are overwritten every frame; the rest only grow.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FrameStatistics {
    pub presented_frames: u64,
    pub skipped_frames: u64,
    pub failed_frames: u64,
    pub dropped_instances: u64,
    pub failed_allocations: u64,
    pub contract_violations: u64,
    /// Frame slots reused while their previous submission was still executing
    pub slot_overruns: u64,
    pub elided_binds: u64,
    pub peak_uniform_bytes: u64,
    pub last_frame_draw_calls: u32,
    pub last_frame_culled_chunks: u32,
    pub last_frame_visible_chunks: u32,
}

impl FrameStatistics {
    pub fn new() -> Self {
        Self::default()
    }

    /// Total frames that went through `begin_frame`
    pub fn total_frames(&self) -> u64 {
        self.presented_frames + self.skipped_frames + self.failed_frames
    }

    pub(crate) fn reset_frame_counters(&mut self) {
        self.last_frame_draw_calls = 0;
        self.last_frame_culled_chunks = 0;
        self.last_frame_visible_chunks = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_total_frames() {
        let stats = FrameStatistics {
            presented_frames: 5,
            skipped_frames: 2,
            failed_frames: 1,
            ..Default::default()
        };
        assert_eq!(stats.total_frames(), 8);
    }
}
