// Copyright 2023 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Reconstruction and display pacing of a live H.264 elementary stream
//! delivered as small binary chunks over a lossy telemetry transport.
//!
//! The transport hands us a scalar value update at irregular intervals. Each
//! update carries a 16-bit rolling sequence counter and up to 253 payload
//! bytes; delivery and ordering are not guaranteed, and the only signal of
//! loss is a gap in the counter. [`engine::VideoFeed`] turns that into decoded
//! pictures handed to a renderer in display order:
//!
//! chunk -> [`demuxer::h264es::BitstreamBuffer`] -> NAL parsing
//! ([`codec::h264::parser`]) -> picture assembly
//! ([`demuxer::h264es::EsDemuxer`]) -> external decode ([`decoder`]) ->
//! display reordering ([`reorder`]) -> paced delivery ([`engine`]).
//!
//! The macroblock-level decoder itself is an external collaborator behind
//! [`decoder::DecodeBackend`]; so are the renderer and status surface behind
//! [`engine::VideoSink`].

pub mod codec;
pub mod decoder;
pub mod demuxer;
pub mod engine;
pub mod reorder;

use std::str::FromStr;

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct Resolution {
    pub width: u32,
    pub height: u32,
}

impl std::fmt::Display for Resolution {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{}x{}", self.width, self.height)
    }
}

/// Pixel layout of a decoded frame as reported by the decode backend.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum DecodedFormat {
    NV12,
    I420,
}

impl std::fmt::Display for DecodedFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            DecodedFormat::NV12 => write!(f, "NV12"),
            DecodedFormat::I420 => write!(f, "I420"),
        }
    }
}

impl FromStr for DecodedFormat {
    type Err = &'static str;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "nv12" | "NV12" => Ok(DecodedFormat::NV12),
            "i420" | "I420" => Ok(DecodedFormat::I420),
            _ => Err("unrecognized output format. Valid values: nv12, i420"),
        }
    }
}
