//! Line-based transcript viewport.
//!
//! Offsets count lines from the top of the transcript. While following the
//! bottom, new content keeps the newest line visible; once the user scrolls
//! up, the offset stays put and a prepend shifts it by the prepended height
//! so the same messages remain on screen.

use std::ops::Range;

pub struct ScrollManager {
    viewport: usize,
    content_height: usize,
    offset: usize,
    follow_bottom: bool,
}

impl ScrollManager {
    pub fn new(viewport: usize) -> Self {
        Self {
            viewport: viewport.max(1),
            content_height: 0,
            offset: 0,
            follow_bottom: true,
        }
    }

    pub fn offset(&self) -> usize {
        self.offset
    }

    pub fn is_following_bottom(&self) -> bool {
        self.follow_bottom
    }

    pub fn is_at_top(&self) -> bool {
        self.offset == 0
    }

    /// Content was re-rendered with `height` lines.
    pub fn set_content_height(&mut self, height: usize) {
        self.content_height = height;
        if self.follow_bottom {
            self.offset = self.max_offset();
        } else {
            self.offset = self.offset.min(self.max_offset());
        }
    }

    /// `prepended` lines were inserted above the previous first line.
    pub fn keep_anchor(&mut self, prepended: usize) {
        if self.follow_bottom {
            return;
        }
        self.offset = (self.offset + prepended).min(self.max_offset());
    }

    pub fn scroll_up(&mut self, lines: usize) {
        self.offset = self.offset.saturating_sub(lines);
        if self.offset < self.max_offset() {
            self.follow_bottom = false;
        }
    }

    pub fn scroll_down(&mut self, lines: usize) {
        self.offset = (self.offset + lines).min(self.max_offset());
        if self.offset == self.max_offset() {
            self.follow_bottom = true;
        }
    }

    pub fn reset(&mut self) {
        self.content_height = 0;
        self.offset = 0;
        self.follow_bottom = true;
    }

    pub fn visible(&self) -> Range<usize> {
        self.offset..(self.offset + self.viewport).min(self.content_height)
    }

    fn max_offset(&self) -> usize {
        self.content_height.saturating_sub(self.viewport)
    }
}
