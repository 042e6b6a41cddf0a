// Copyright 2023 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Display reordering of decoded frames, grouped by GOP.
//!
//! Decode order and display order differ whenever B-frames are in use. Each
//! key frame resets the POC to zero and anchors a GOP; within a GOP, display
//! order is ascending POC. Frames become displayable strictly in POC steps of
//! [`POC_STEP`], which is how encoders allocate POC for progressive content.

use std::collections::VecDeque;

use log::debug;
use log::warn;

use crate::decoder::DecodedFrame;

/// POC distance between two consecutively displayed frames: one coded frame
/// covers two fields, even in progressive streams.
pub const POC_STEP: i32 = 2;

/// Number of GOPs the queue will hold: the one being displayed and the one
/// being decoded into.
const MAX_GOPS: usize = 2;

#[derive(Default)]
struct Gop {
    /// Frames of this GOP, sorted by POC ascending.
    frames: Vec<DecodedFrame>,
}

/// A GOP-indexed reorder queue.
///
/// Shared between the ingestion path (which pushes decoded frames) and the
/// display scheduler (which takes them in display order); the caller wraps it
/// in a mutex.
#[derive(Default)]
pub struct GopQueue {
    gops: VecDeque<Gop>,
    /// POC the next displayable frame must carry.
    expected_poc: i32,
}

impl GopQueue {
    pub fn new() -> Self {
        Default::default()
    }

    /// Adds a decoded frame.
    ///
    /// A key frame (POC 0) opens a new GOP at the tail; any other frame is
    /// sorted into the current one. If a third GOP opens while the head GOP
    /// still holds undisplayable frames, the head is stale (its remaining
    /// frames can never match the expected POC again) and is dropped.
    pub fn push(&mut self, frame: DecodedFrame) {
        if frame.poc == 0 || self.gops.is_empty() {
            self.gops.push_back(Gop::default());
        }

        while self.gops.len() > MAX_GOPS {
            let stale = self.gops.pop_front();
            self.expected_poc = 0;
            if let Some(stale) = stale {
                if !stale.frames.is_empty() {
                    warn!(
                        "dropping stale GOP with {} undisplayed frames",
                        stale.frames.len()
                    );
                }
            }
        }

        if let Some(gop) = self.gops.back_mut() {
            let pos = gop.frames.partition_point(|f| f.poc <= frame.poc);
            debug!("queueing frame poc={} at gop position {}", frame.poc, pos);
            gop.frames.insert(pos, frame);
        }
    }

    /// Whether the next displayable frame is available, i.e. the head GOP's
    /// lowest POC equals the expected POC.
    pub fn has_next_frame(&mut self) -> bool {
        self.prune();

        match self.gops.front() {
            Some(gop) => gop
                .frames
                .first()
                .map_or(false, |frame| frame.poc == self.expected_poc),
            None => false,
        }
    }

    /// Removes and returns the next displayable frame, advancing the expected
    /// POC by [`POC_STEP`].
    ///
    /// Returns `None` when no frame with the expected POC is buffered; this
    /// is the chosen contract (rather than panicking), so callers may poll
    /// without checking [`GopQueue::has_next_frame`] first.
    pub fn take_next_frame(&mut self) -> Option<DecodedFrame> {
        if !self.has_next_frame() {
            return None;
        }

        let frame = self.gops.front_mut().map(|gop| gop.frames.remove(0));
        self.expected_poc += POC_STEP;
        frame
    }

    /// Whether no frames are buffered at all.
    pub fn is_empty(&self) -> bool {
        self.gops.iter().all(|gop| gop.frames.is_empty())
    }

    /// Total number of buffered frames across all GOPs.
    pub fn len(&self) -> usize {
        self.gops.iter().map(|gop| gop.frames.len()).sum()
    }

    pub fn clear(&mut self) {
        self.gops.clear();
        self.expected_poc = 0;
    }

    /// Drops exhausted GOPs from the head; each crossed boundary restarts the
    /// expected POC at the next GOP's key frame.
    fn prune(&mut self) {
        while self.gops.len() > 1 && self.gops.front().map_or(false, |gop| gop.frames.is_empty()) {
            self.gops.pop_front();
            self.expected_poc = 0;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decoder::PictureType;
    use crate::DecodedFormat;
    use crate::Resolution;

    fn frame(poc: i32) -> DecodedFrame {
        DecodedFrame {
            pixels: Vec::new(),
            poc,
            frame_num: poc / 2,
            pic_type: if poc == 0 {
                PictureType::I
            } else {
                PictureType::P
            },
            resolution: Resolution {
                width: 16,
                height: 16,
            },
            format: DecodedFormat::I420,
        }
    }

    #[test]
    fn reorders_decode_order_to_display_order() {
        let mut queue = GopQueue::new();

        // Decode order I(0) P(4) B(2); display order is by ascending POC.
        queue.push(frame(0));
        queue.push(frame(4));
        queue.push(frame(2));

        let mut displayed = Vec::new();
        while let Some(frame) = queue.take_next_frame() {
            displayed.push(frame.poc);
        }
        assert_eq!(displayed, vec![0, 2, 4]);
        assert!(queue.is_empty());
    }

    #[test]
    fn expected_poc_advances_in_steps_of_two() {
        let mut queue = GopQueue::new();

        queue.push(frame(0));
        queue.push(frame(4));

        assert!(queue.has_next_frame());
        assert_eq!(queue.take_next_frame().unwrap().poc, 0);

        // POC 2 is missing: 4 is not displayable yet.
        assert!(!queue.has_next_frame());
        assert!(queue.take_next_frame().is_none());

        queue.push(frame(2));
        assert_eq!(queue.take_next_frame().unwrap().poc, 2);
        assert_eq!(queue.take_next_frame().unwrap().poc, 4);
    }

    #[test]
    fn gop_boundary_resets_expected_poc() {
        let mut queue = GopQueue::new();

        queue.push(frame(0));
        queue.push(frame(2));
        assert_eq!(queue.take_next_frame().unwrap().poc, 0);
        assert_eq!(queue.take_next_frame().unwrap().poc, 2);

        // Next GOP: POC restarts at 0.
        queue.push(frame(0));
        assert!(queue.has_next_frame());
        assert_eq!(queue.take_next_frame().unwrap().poc, 0);
    }

    #[test]
    fn overflowing_gops_drop_the_stale_head() {
        let mut queue = GopQueue::new();

        // The head GOP stalls: expected POC 0 but only POC 4 buffered.
        queue.push(frame(4));
        assert!(!queue.has_next_frame());

        queue.push(frame(0));
        queue.push(frame(0));

        // Two newer GOPs displaced the stalled one.
        assert!(queue.has_next_frame());
        assert_eq!(queue.take_next_frame().unwrap().poc, 0);
        assert_eq!(queue.take_next_frame().unwrap().poc, 0);
        assert!(queue.take_next_frame().is_none());
    }

    #[test]
    fn clear_empties_everything() {
        let mut queue = GopQueue::new();
        queue.push(frame(0));
        queue.push(frame(2));
        queue.clear();
        assert!(queue.is_empty());
        assert_eq!(queue.len(), 0);
        assert!(!queue.has_next_frame());
    }
}
