//! Per-frame context for application updates.

use umbra_render::{FrameComposer, TextLine};

/// Handed to [`crate::UmbraApp::update`] once per frame.
pub struct FrameContext<'a> {
    composer: &'a mut FrameComposer,
    /// Delta time since last frame in seconds.
    pub dt: f32,
    /// Instantaneous frames per second.
    pub fps: f32,
    /// Frames rendered before this one.
    pub frame_number: u64,
}

impl<'a> FrameContext<'a> {
    pub(crate) fn new(composer: &'a mut FrameComposer, dt: f32, fps: f32, frame_number: u64) -> Self {
        Self {
            composer,
            dt,
            fps,
            frame_number,
        }
    }

    /// Stream scene assets that are not resident yet into this frame.
    pub fn request_upload(&mut self) {
        self.composer.request_upload();
    }

    #[must_use]
    pub fn debug_overlay(&self) -> bool {
        self.composer.debug_overlay()
    }

    pub fn set_debug_overlay(&mut self, enabled: bool) {
        self.composer.set_debug_overlay(enabled);
    }

    #[must_use]
    pub fn text_overlay(&self) -> bool {
        self.composer.text_overlay()
    }

    pub fn set_text_overlay(&mut self, enabled: bool) {
        self.composer.set_text_overlay(enabled);
    }

    /// Replace the overlay text.
    pub fn set_text(&mut self, lines: Vec<TextLine>) {
        self.composer.set_text(lines);
    }
}
