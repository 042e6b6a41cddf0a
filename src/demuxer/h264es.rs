// Copyright 2023 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Demuxing of a H.264 Annex-B elementary stream that arrives in arbitrarily
//! split chunks: byte accumulation, NAL unit discovery, grouping of slices
//! into coded pictures, and decode-order tagging (frame number and POC).
//!
//! The demuxer is loss-aware: [`EsDemuxer::salvage`] force-finalizes the open
//! picture when the transport reports a gap, and [`EsDemuxer::flush`] discards
//! buffered bytes while keeping the parameter-set cache, which normally
//! survives loss.

use std::ops::Range;
use std::rc::Rc;

use log::debug;
use log::warn;
use thiserror::Error;

use crate::codec::h264::parser::find_start_code;
use crate::codec::h264::parser::Nalu;
use crate::codec::h264::parser::NaluHeader;
use crate::codec::h264::parser::NaluType;
use crate::codec::h264::parser::ParseError;
use crate::codec::h264::parser::Parser;
use crate::codec::h264::parser::SliceHeader;
use crate::codec::h264::parser::Sps;

/// Default capacity of the bitstream buffer. Chosen generously above one
/// picture's worst-case size for the streams this transport carries.
pub const DEFAULT_BUFFER_CAPACITY: usize = 128 * 1024;

#[derive(Debug, Error, PartialEq, Eq)]
#[error("bitstream buffer capacity ({capacity} bytes) exceeded")]
pub struct BufferFull {
    pub capacity: usize,
}

/// A fixed-capacity byte accumulator with a read cursor and a fill limit.
///
/// Invariant: `pos <= limit <= capacity`. Bytes in `[0, pos)` are fully
/// consumed NAL data, discarded on the next [`BitstreamBuffer::compact`].
pub struct BitstreamBuffer {
    data: Vec<u8>,
    pos: usize,
    limit: usize,
}

impl BitstreamBuffer {
    pub fn new(capacity: usize) -> Self {
        Self {
            data: vec![0; capacity],
            pos: 0,
            limit: 0,
        }
    }

    /// Appends `bytes` to the fill region. The read cursor is unaffected.
    pub fn inject(&mut self, bytes: &[u8]) -> Result<(), BufferFull> {
        if self.limit + bytes.len() > self.data.len() {
            return Err(BufferFull {
                capacity: self.data.len(),
            });
        }

        self.data[self.limit..self.limit + bytes.len()].copy_from_slice(bytes);
        self.limit += bytes.len();
        Ok(())
    }

    /// Finds the next complete NAL unit after the read cursor.
    ///
    /// Returns the payload range between the unit's start code and the start
    /// code that terminates it, with RBSP trailing zeros trimmed, and leaves
    /// the cursor on the terminating start code (including the zero byte of a
    /// four-byte code, which belongs to the following unit's range). Returns
    /// `None` with the cursor unmoved if no terminated unit is available yet;
    /// the same bytes are re-scanned once more data arrives, so a start code
    /// split across two injections is found.
    pub fn next_nalu(&mut self) -> Option<Range<usize>> {
        let filled = &self.data[..self.limit];

        let marker = find_start_code(filled, self.pos)?;
        let payload_start = marker + 3;

        let next = find_start_code(filled, payload_start)?;
        let sc_start = if filled[next - 1] == 0x00 { next - 1 } else { next };

        let mut payload_end = sc_start;
        while payload_end > payload_start && filled[payload_end - 1] == 0x00 {
            // trailing_zero_8bits
            payload_end -= 1;
        }

        self.pos = sc_start;
        Some(payload_start..payload_end)
    }

    pub fn pos(&self) -> usize {
        self.pos
    }

    pub fn set_pos(&mut self, pos: usize) {
        debug_assert!(pos <= self.limit);
        self.pos = pos;
    }

    pub fn view(&self, range: Range<usize>) -> &[u8] {
        &self.data[range]
    }

    /// Discards all bytes before the read cursor, shifting the rest to the
    /// front. A no-op when the cursor is at the front already.
    pub fn compact(&mut self) {
        if self.pos == 0 {
            return;
        }

        self.data.copy_within(self.pos..self.limit, 0);
        self.limit -= self.pos;
        self.pos = 0;
    }

    /// Discards everything. A no-op on an empty buffer.
    pub fn clear(&mut self) {
        self.pos = 0;
        self.limit = 0;
    }

    pub fn len(&self) -> usize {
        self.limit
    }

    pub fn is_empty(&self) -> bool {
        self.limit == 0
    }
}

impl Default for BitstreamBuffer {
    fn default() -> Self {
        Self::new(DEFAULT_BUFFER_CAPACITY)
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum FrameType {
    Key,
    Inter,
}

/// One coded picture: the slice NALUs of a single picture plus any SPS, PPS
/// or AUD units immediately preceding them, start codes included, tagged with
/// decode-order data.
#[derive(Clone, Debug)]
pub struct Packet {
    pub data: Vec<u8>,
    /// Absolute frame number, accumulated across frame_num wraparounds.
    pub frame_num: i32,
    /// Picture order count; 0 for every key frame.
    pub poc: i32,
    pub frame_type: FrameType,
    /// Monotonically increasing packet index, in assembly order.
    pub seq: u64,
}

/// State carried across pictures by the POC and frame-number derivations.
/// Reset whenever the buffer is flushed after loss.
#[derive(Default)]
struct ContinuityState {
    prev_frame_num_offset: i32,
    prev_frame_num: i32,
    prev_pic_order_cnt_msb: i32,
    prev_pic_order_cnt_lsb: i32,
}

/// Reconstructs coded pictures from an H.264 elementary stream delivered in
/// chunks.
///
/// [`EsDemuxer::inject`] appends transport bytes, [`EsDemuxer::next_packet`]
/// scans for the next finalized picture. A picture is only known to be
/// complete once the first slice of the *following* picture is seen, so the
/// final picture of a burst stays open until more data (or a salvage) arrives.
#[derive(Default)]
pub struct EsDemuxer {
    buffer: BitstreamBuffer,
    parser: Parser,
    /// Position of the first NALU of the currently open picture, if any.
    packet_mark: Option<usize>,
    /// The most recent slice of the open picture, against which the
    /// same-picture predicate is evaluated.
    prev_slice: Option<(NaluHeader, SliceHeader)>,
    continuity: ContinuityState,
    seq: u64,
    fps: f64,
}

impl EsDemuxer {
    pub fn new() -> Self {
        Default::default()
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            buffer: BitstreamBuffer::new(capacity),
            ..Default::default()
        }
    }

    /// Appends a chunk of elementary-stream bytes.
    pub fn inject(&mut self, bytes: &[u8]) -> Result<(), BufferFull> {
        self.buffer.inject(bytes)
    }

    /// The frame rate advertised by the most recent SPS carrying VUI timing
    /// information, or 0.0 if none was seen yet.
    pub fn fps(&self) -> f64 {
        self.fps
    }

    /// Scans forward for the next finalized coded picture.
    ///
    /// Returns `None` once all buffered data has been consumed without
    /// completing a picture; the open picture (if any) stays open.
    pub fn next_packet(&mut self) -> Option<Packet> {
        loop {
            let nal_pos = self.buffer.pos();
            let range = self.buffer.next_nalu()?;

            if self.packet_mark.is_none() {
                self.packet_mark = Some(nal_pos);
            }

            let hdr = match NaluHeader::parse(self.buffer.view(range.clone())) {
                Ok(hdr) => hdr,
                Err(err) => {
                    debug!("skipping unparsable NALU header: {:#}", err);
                    continue;
                }
            };

            match hdr.type_ {
                NaluType::Slice | NaluType::SliceIdr => {
                    let nalu = Nalu {
                        header: hdr,
                        data: self.buffer.view(range),
                    };

                    let sh = match self.parser.parse_slice_header(&nalu) {
                        Ok(sh) => sh,
                        Err(ParseError::MissingParameterSet) => {
                            // No usable PPS, probably because loss ate it.
                            // Drop everything consumed so far and keep
                            // scanning for parameter sets.
                            debug!("slice without cached parameter sets, discarding");
                            self.buffer.compact();
                            self.packet_mark = None;
                            continue;
                        }
                        Err(err) => {
                            debug!("skipping unparsable slice header: {:#}", err);
                            continue;
                        }
                    };

                    let boundary = match &self.prev_slice {
                        Some((prev_hdr, prev_sh)) => {
                            !same_picture(&self.parser, prev_hdr, &hdr, prev_sh, &sh)
                        }
                        None => false,
                    };

                    if boundary {
                        // The new slice opens the next picture; it is not part
                        // of the one being finalized and will be re-read on
                        // the next call.
                        self.buffer.set_pos(nal_pos);
                        return self.finalize_packet();
                    }

                    self.prev_slice = Some((hdr, sh));
                }
                NaluType::Sps => {
                    let nalu = Nalu {
                        header: hdr,
                        data: self.buffer.view(range),
                    };
                    match self.parser.parse_sps(&nalu) {
                        Ok(sps) => {
                            if let Some(fps) = sps.frame_rate() {
                                self.fps = fps;
                            }
                        }
                        Err(err) => debug!("dropping undecodable SPS: {:#}", err),
                    }
                }
                NaluType::Pps => {
                    let nalu = Nalu {
                        header: hdr,
                        data: self.buffer.view(range),
                    };
                    if let Err(err) = self.parser.parse_pps(&nalu) {
                        debug!("dropping undecodable PPS: {:#}", err);
                    }
                }
                NaluType::AuDelimiter => {
                    // AUD units usually appear before SPS/PPS. If nothing has
                    // been cached yet we joined mid-stream: use the delimiter
                    // as the start of the next candidate picture.
                    if !self.parser.have_parameter_sets() {
                        self.packet_mark = Some(nal_pos);
                    }
                }
                _ => (),
            }
        }
    }

    /// Force-finalizes the currently open picture, using the read cursor as
    /// the picture end.
    ///
    /// Normal finalization needs the next picture's first slice as a
    /// boundary; after transport loss that slice may never arrive, so this is
    /// the loss-recovery path to not drop an otherwise complete picture.
    pub fn salvage(&mut self) -> Option<Packet> {
        self.finalize_packet()
    }

    /// Discards all buffered bytes, the open picture and the continuity
    /// state. Cached parameter sets survive, as they typically do across
    /// transport loss.
    pub fn flush(&mut self) {
        self.buffer.clear();
        self.packet_mark = None;
        self.prev_slice = None;
        self.continuity = ContinuityState::default();
    }

    /// Full reset for stream restart: [`EsDemuxer::flush`] plus the parameter
    /// sets, the advertised frame rate and the packet sequence counter.
    pub fn reset(&mut self) {
        self.flush();
        self.parser.reset();
        self.fps = 0.0;
        self.seq = 0;
    }

    fn finalize_packet(&mut self) -> Option<Packet> {
        let (mark, (hdr, sh)) = match (self.packet_mark, self.prev_slice.take()) {
            (Some(mark), Some(prev)) => (mark, prev),
            (_, prev) => {
                self.prev_slice = prev;
                return None;
            }
        };

        let sps = match self.parser.get_pps(sh.pic_parameter_set_id) {
            Some(pps) => Rc::clone(&pps.sps),
            None => {
                // Cannot happen while the cache only grows, but do not panic
                // on it either.
                warn!("open picture dropped: its parameter sets vanished");
                self.packet_mark = None;
                self.buffer.compact();
                return None;
            }
        };

        let end = self.buffer.pos();
        let data = self.buffer.view(mark..end).to_vec();

        let (frame_num, poc) = self.detect_poc(&sps, &hdr, &sh);

        self.buffer.compact();
        self.packet_mark = None;

        let packet = Packet {
            data,
            frame_num,
            poc,
            frame_type: if hdr.idr_pic_flag {
                FrameType::Key
            } else {
                FrameType::Inter
            },
            seq: self.seq,
        };
        self.seq += 1;

        debug!(
            "assembled packet #{}: frame_num={} poc={} type={:?}, {} bytes",
            packet.seq,
            packet.frame_num,
            packet.poc,
            packet.frame_type,
            packet.data.len()
        );

        Some(packet)
    }

    /// Derives the absolute frame number and the POC of a finalized picture,
    /// updating the continuity state.
    fn detect_poc(&mut self, sps: &Sps, hdr: &NaluHeader, sh: &SliceHeader) -> (i32, i32) {
        let max_frame_num = sps.max_frame_num() as i32;
        let frame_num = i32::from(sh.frame_num);

        if self.detect_gap(frame_num, max_frame_num) {
            // An unannounced frame_num jump. Advance once so the offset
            // accumulation does not misread it as a wraparound.
            self.continuity.prev_frame_num = (self.continuity.prev_frame_num + 1) % max_frame_num;
        }

        let mmco5 = hdr.ref_idc != 0 && !hdr.idr_pic_flag && sh.dec_ref_pic_marking.has_mmco_5();
        let abs_frame_num = self.update_frame_number(frame_num, max_frame_num, mmco5);

        let poc = if matches!(hdr.type_, NaluType::Slice) {
            self.calc_poc(abs_frame_num, sps, hdr, sh)
        } else {
            // Key frame: POC restarts at zero.
            self.continuity.prev_pic_order_cnt_msb = 0;
            self.continuity.prev_pic_order_cnt_lsb = 0;
            0
        };

        (abs_frame_num, poc)
    }

    fn detect_gap(&self, frame_num: i32, max_frame_num: i32) -> bool {
        frame_num != self.continuity.prev_frame_num
            && frame_num != (self.continuity.prev_frame_num + 1) % max_frame_num
    }

    fn update_frame_number(&mut self, frame_num: i32, max_frame_num: i32, mmco5: bool) -> i32 {
        let frame_num_offset = if self.continuity.prev_frame_num > frame_num {
            self.continuity.prev_frame_num_offset + max_frame_num
        } else {
            self.continuity.prev_frame_num_offset
        };

        let abs_frame_num = frame_num_offset + frame_num;

        self.continuity.prev_frame_num = if mmco5 { 0 } else { frame_num };
        self.continuity.prev_frame_num_offset = frame_num_offset;
        abs_frame_num
    }

    fn calc_poc(&mut self, abs_frame_num: i32, sps: &Sps, hdr: &NaluHeader, sh: &SliceHeader) -> i32 {
        match sps.pic_order_cnt_type {
            0 => self.calc_poc0(sps, hdr, sh),
            1 => self.calc_poc1(abs_frame_num, sps, hdr, sh),
            _ => self.calc_poc2(abs_frame_num, hdr),
        }
    }

    /// Spec 8.2.1.1.
    fn calc_poc0(&mut self, sps: &Sps, hdr: &NaluHeader, sh: &SliceHeader) -> i32 {
        let pic_order_cnt_lsb = i32::from(sh.pic_order_cnt_lsb);
        let max_pic_order_cnt_lsb = sps.max_pic_order_cnt_lsb();

        let prev_lsb = self.continuity.prev_pic_order_cnt_lsb;
        let prev_msb = self.continuity.prev_pic_order_cnt_msb;

        let pic_order_cnt_msb = if pic_order_cnt_lsb < prev_lsb
            && prev_lsb - pic_order_cnt_lsb >= max_pic_order_cnt_lsb / 2
        {
            prev_msb + max_pic_order_cnt_lsb
        } else if pic_order_cnt_lsb > prev_lsb
            && pic_order_cnt_lsb - prev_lsb > max_pic_order_cnt_lsb / 2
        {
            prev_msb - max_pic_order_cnt_lsb
        } else {
            prev_msb
        };

        // Only reference pictures update the predictors.
        if hdr.ref_idc != 0 {
            self.continuity.prev_pic_order_cnt_msb = pic_order_cnt_msb;
            self.continuity.prev_pic_order_cnt_lsb = pic_order_cnt_lsb;
        }

        pic_order_cnt_msb + pic_order_cnt_lsb
    }

    /// Spec 8.2.1.2.
    fn calc_poc1(
        &self,
        mut abs_frame_num: i32,
        sps: &Sps,
        hdr: &NaluHeader,
        sh: &SliceHeader,
    ) -> i32 {
        let num_ref_frames = i32::from(sps.num_ref_frames_in_pic_order_cnt_cycle);

        if num_ref_frames == 0 {
            abs_frame_num = 0;
        }
        if hdr.ref_idc == 0 && abs_frame_num > 0 {
            abs_frame_num -= 1;
        }

        let expected_delta_per_cycle: i32 = sps.offset_for_ref_frame.iter().sum();

        let mut expected_pic_order_cnt = if abs_frame_num > 0 {
            let pic_order_cnt_cycle_cnt = (abs_frame_num - 1) / num_ref_frames;
            let frame_num_in_cycle = (abs_frame_num - 1) % num_ref_frames;

            let mut expected = pic_order_cnt_cycle_cnt * expected_delta_per_cycle;
            for offset in &sps.offset_for_ref_frame[..=frame_num_in_cycle as usize] {
                expected += offset;
            }
            expected
        } else {
            0
        };

        if hdr.ref_idc == 0 {
            expected_pic_order_cnt += sps.offset_for_non_ref_pic;
        }

        expected_pic_order_cnt + sh.delta_pic_order_cnt[0]
    }

    /// Spec 8.2.1.3.
    fn calc_poc2(&self, abs_frame_num: i32, hdr: &NaluHeader) -> i32 {
        if hdr.ref_idc == 0 {
            2 * abs_frame_num - 1
        } else {
            2 * abs_frame_num
        }
    }
}

/// Whether two consecutive slices belong to the same coded picture, per the
/// access-unit boundary rules of clause 7.4.1.2.4.
fn same_picture(
    parser: &Parser,
    nu1: &NaluHeader,
    nu2: &NaluHeader,
    sh1: &SliceHeader,
    sh2: &SliceHeader,
) -> bool {
    if sh1.pic_parameter_set_id != sh2.pic_parameter_set_id {
        return false;
    }

    if sh1.frame_num != sh2.frame_num {
        return false;
    }

    let sps = match parser.get_pps(sh1.pic_parameter_set_id) {
        Some(pps) => &pps.sps,
        None => return false,
    };

    if sps.pic_order_cnt_type == 0 && sh1.pic_order_cnt_lsb != sh2.pic_order_cnt_lsb {
        return false;
    }

    if sps.pic_order_cnt_type == 1
        && (sh1.delta_pic_order_cnt[0] != sh2.delta_pic_order_cnt[0]
            || sh1.delta_pic_order_cnt[1] != sh2.delta_pic_order_cnt[1])
    {
        return false;
    }

    if (nu1.ref_idc == 0 || nu2.ref_idc == 0) && nu1.ref_idc != nu2.ref_idc {
        return false;
    }

    if (nu1.type_ == NaluType::SliceIdr) != (nu2.type_ == NaluType::SliceIdr) {
        return false;
    }

    if sh1.idr_pic_id != sh2.idr_pic_id {
        return false;
    }

    true
}
