// Copyright 2023 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! The external decode capability. The macroblock-level decoder is not part
//! of this crate; the engine talks to it through these traits, bootstrapping
//! a context from the first packet that carries full SPS+PPS+picture context
//! and dropping it on the first decode failure.

use thiserror::Error;

use crate::demuxer::h264es::Packet;
use crate::DecodedFormat;
use crate::Resolution;

#[derive(Debug, Error)]
pub enum DecodeError {
    /// The supplied bytes do not carry enough context to set up a decoder.
    #[error("not enough context to create a decode context")]
    MissingContext,
    /// The backend rejected the data.
    #[error(transparent)]
    BackendError(#[from] anyhow::Error),
}

/// Coding type of a decoded picture, as reported by the backend.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum PictureType {
    I,
    P,
    B,
}

/// One decoded picture, in decode order. Ownership moves into the reorder
/// queue and from there to the renderer.
pub struct DecodedFrame {
    pub pixels: Vec<u8>,
    pub poc: i32,
    pub frame_num: i32,
    pub pic_type: PictureType,
    pub resolution: Resolution,
    pub format: DecodedFormat,
}

/// Factory side of the decode capability.
pub trait DecodeBackend {
    /// Scores `data` between 0 and 100 for decodability: a range containing
    /// a picture plus the SPS and PPS needed to decode it scores 100 and is
    /// accepted as context for [`DecodeBackend::create_context`].
    fn probe(&self, data: &[u8]) -> u32;

    /// Creates a decode context primed with the parameter sets found in
    /// `data`.
    fn create_context(&mut self, data: &[u8]) -> Result<Box<dyn DecodeContext>, DecodeError>;
}

/// One decoding session. Decoding is synchronous and bounded; a failed call
/// invalidates the context.
pub trait DecodeContext {
    fn decode(&mut self, packet: &Packet) -> Result<DecodedFrame, DecodeError>;
}
