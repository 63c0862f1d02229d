//! Frame timing statistics.

use tracing::info;

/// Min / max / average frames per second over a run.
#[derive(Clone, Copy, Debug)]
pub struct FrameStats {
    frames: u64,
    min_fps: f64,
    max_fps: f64,
    fps_sum: f64,
}

impl Default for FrameStats {
    fn default() -> Self {
        Self {
            frames: 0,
            min_fps: f64::MAX,
            max_fps: 0.0,
            fps_sum: 0.0,
        }
    }
}

impl FrameStats {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a frame that took `dt` seconds. Returns its fps, or 0 for a
    /// zero-length frame which is not recorded.
    pub fn record(&mut self, dt: f32) -> f32 {
        if dt <= 0.0 {
            return 0.0;
        }
        let fps = 1.0 / f64::from(dt);
        self.min_fps = self.min_fps.min(fps);
        self.max_fps = self.max_fps.max(fps);
        self.fps_sum += fps;
        self.frames += 1;
        fps as f32
    }

    pub const fn frames(&self) -> u64 {
        self.frames
    }

    /// `None` until a frame was recorded.
    pub fn min_fps(&self) -> Option<f64> {
        (self.frames > 0).then_some(self.min_fps)
    }

    pub fn max_fps(&self) -> Option<f64> {
        (self.frames > 0).then_some(self.max_fps)
    }

    pub fn average_fps(&self) -> Option<f64> {
        (self.frames > 0).then(|| self.fps_sum / self.frames as f64)
    }

    /// Log the summary at `info`.
    pub fn log_summary(&self) {
        let (Some(min), Some(max), Some(avg)) = (self.min_fps(), self.max_fps(), self.average_fps()) else {
            return;
        };
        info!(
            frames = self.frames,
            min = format_args!("{min:.1}"),
            max = format_args!("{max:.1}"),
            avg = format_args!("{avg:.1}"),
            "FPS statistics"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn empty_stats_have_no_summary() {
        let stats = FrameStats::new();
        assert_eq!(stats.frames(), 0);
        assert!(stats.average_fps().is_none());
        assert!(stats.min_fps().is_none());
    }

    #[test]
    fn records_min_max_and_average() {
        let mut stats = FrameStats::new();
        assert_relative_eq!(stats.record(0.01), 100.0, epsilon = 1e-3);
        stats.record(0.02);
        stats.record(0.04);
        assert_eq!(stats.frames(), 3);
        assert_relative_eq!(stats.min_fps().unwrap(), 25.0, epsilon = 1e-3);
        assert_relative_eq!(stats.max_fps().unwrap(), 100.0, epsilon = 1e-3);
        assert_relative_eq!(stats.average_fps().unwrap(), 175.0 / 3.0, epsilon = 1e-3);
    }

    #[test]
    fn zero_length_frames_are_ignored() {
        let mut stats = FrameStats::new();
        assert_relative_eq!(stats.record(0.0), 0.0);
        assert_eq!(stats.frames(), 0);
    }
}
