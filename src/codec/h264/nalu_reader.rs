// Copyright 2023 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

// Client code is not expected to exercise every reader primitive.
#![allow(dead_code)]

use std::io::Cursor;

use anyhow::anyhow;
use bytes::Buf;
use thiserror::Error;

/// A bit reader for H.264 RBSP payloads. It removes emulation-prevention
/// bytes on the fly and understands the rbsp_trailing_bits() stop bit.
pub(crate) struct NaluReader<'a> {
    /// A reference into the next unread byte in the stream.
    data: Cursor<&'a [u8]>,
    /// Contents of the current byte. First unread bit starting at position
    /// 8 - num_remaining_bits_in_curr_byte.
    curr_byte: u32,
    /// Number of bits remaining in `curr_byte`.
    num_remaining_bits_in_curr_byte: usize,
    /// Last two bytes read, for emulation-prevention detection.
    prev_two_bytes: u32,
    /// Number of emulation-prevention bytes (0x000003) seen so far.
    num_epb: usize,
}

#[derive(Debug, Error)]
pub(crate) enum GetByteError {
    #[error("reader ran out of bits")]
    OutOfBits,
}

#[derive(Debug, Error)]
pub(crate) enum ReadBitsError {
    #[error("more than 31 ({0}) bits were requested")]
    TooManyBitsRequested(usize),
    #[error("failed to advance the current byte")]
    GetByte(#[from] GetByteError),
    #[error("failed to convert read input to target type")]
    ConversionFailed,
}

impl<'a> NaluReader<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self {
            data: Cursor::new(data),
            curr_byte: Default::default(),
            num_remaining_bits_in_curr_byte: Default::default(),
            prev_two_bytes: 0xffff,
            num_epb: Default::default(),
        }
    }

    /// Read a single bit from the stream.
    pub fn read_bit(&mut self) -> Result<bool, ReadBitsError> {
        let bit = self.read_bits::<u32>(1)?;
        match bit {
            1 => Ok(true),
            0 => Ok(false),
            _ => panic!("Unexpected value {}", bit),
        }
    }

    /// Read up to 31 bits from the stream.
    pub fn read_bits<U: TryFrom<u32>>(&mut self, num_bits: usize) -> Result<U, ReadBitsError> {
        if num_bits > 31 {
            return Err(ReadBitsError::TooManyBitsRequested(num_bits));
        }

        let mut bits_left = num_bits;
        let mut out = 0;

        while self.num_remaining_bits_in_curr_byte < bits_left {
            out |= self.curr_byte << (bits_left - self.num_remaining_bits_in_curr_byte);
            bits_left -= self.num_remaining_bits_in_curr_byte;
            self.update_curr_byte()?;
        }

        out |= self.curr_byte >> (self.num_remaining_bits_in_curr_byte - bits_left);
        out &= (1 << num_bits) - 1;
        self.num_remaining_bits_in_curr_byte -= bits_left;

        U::try_from(out).map_err(|_| ReadBitsError::ConversionFailed)
    }

    /// Skip `num_bits` bits from the stream.
    pub fn skip_bits(&mut self, mut num_bits: usize) -> Result<(), ReadBitsError> {
        while num_bits > 0 {
            let n = std::cmp::min(num_bits, 31);
            self.read_bits::<u32>(n)?;
            num_bits -= n;
        }

        Ok(())
    }

    /// Returns the amount of bits left in the stream.
    pub fn num_bits_left(&self) -> usize {
        self.data.remaining() * 8 + self.num_remaining_bits_in_curr_byte
    }

    /// Whether the stream still has RBSP data. Implements more_rbsp_data().
    /// See the specification for more details.
    pub fn has_more_rbsp_data(&mut self) -> bool {
        if self.num_remaining_bits_in_curr_byte == 0 && self.update_curr_byte().is_err() {
            // no more data at all in the rbsp
            return false;
        }

        // If the next bit is the stop bit, then we should only see unset bits
        // until the end of the data.
        if (self.curr_byte & ((1 << (self.num_remaining_bits_in_curr_byte - 1)) - 1)) != 0 {
            return true;
        }

        let data = self.data.chunk();
        for data in &data[0..self.data.remaining()] {
            if *data != 0 {
                return true;
            }
        }

        self.data.advance(self.data.remaining());
        false
    }

    /// Reads an unsigned Exp-Golomb coded value. Implements ue(v).
    pub fn read_ue<U: TryFrom<u32>>(&mut self) -> anyhow::Result<U> {
        let mut num_bits = 0;
        let mut bit = self.read_bits::<u32>(1)?;

        while bit == 0 {
            num_bits += 1;
            bit = self.read_bits(1)?;
        }

        if num_bits > 31 {
            return Err(anyhow!("Invalid stream"));
        }

        let mut value = (1 << num_bits) - 1;

        // A 31-zero prefix only encodes u32::MAX; anything else overflows.
        if num_bits == 31 {
            let rest = self.read_bits::<u32>(num_bits)?;
            if rest == 0 {
                return U::try_from(value).map_err(|_| anyhow!("Conversion error"));
            } else {
                return Err(anyhow!("Invalid stream"));
            }
        }

        if num_bits > 0 {
            value += self.read_bits::<u32>(num_bits)?;
        }

        U::try_from(value).map_err(|_| anyhow!("Conversion error"))
    }

    /// Reads an unsigned Exp-Golomb coded value, checking it against `max`.
    pub fn read_ue_max<U: TryFrom<u32>>(&mut self, max: u32) -> anyhow::Result<U> {
        let ue = self.read_ue::<u32>()?;
        if ue > max {
            Err(anyhow!(
                "Value out of bounds: expected at most {}, got {}",
                max,
                ue
            ))
        } else {
            U::try_from(ue).map_err(|_| anyhow!("Conversion error"))
        }
    }

    /// Reads a signed Exp-Golomb coded value. Implements se(v).
    pub fn read_se<U: TryFrom<i32>>(&mut self) -> anyhow::Result<U> {
        let ue = self.read_ue::<u32>()? as i32;

        if ue % 2 == 0 {
            U::try_from(-ue / 2).map_err(|_| anyhow!("Conversion error"))
        } else {
            U::try_from(ue / 2 + 1).map_err(|_| anyhow!("Conversion error"))
        }
    }

    fn get_byte(&mut self) -> Result<u8, GetByteError> {
        if self.data.remaining() == 0 {
            return Err(GetByteError::OutOfBits);
        }

        Ok(self.data.get_u8())
    }

    fn update_curr_byte(&mut self) -> Result<(), GetByteError> {
        let mut byte = self.get_byte()?;

        if (self.prev_two_bytes & 0xffff) == 0 && byte == 0x03 {
            // Emulation-prevention byte; skip it and read the real payload
            // byte. Three new bytes must go by before another one can occur.
            self.num_epb += 1;
            byte = self.get_byte()?;
            self.prev_two_bytes = 0xffff;
        }

        self.num_remaining_bits_in_curr_byte = 8;
        self.prev_two_bytes = ((self.prev_two_bytes & 0xff) << 8) | u32::from(byte);

        self.curr_byte = u32::from(byte);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::NaluReader;

    #[test]
    fn read_stream_without_escape_and_trailing_zero_bytes() {
        const RBSP: [u8; 6] = [0x01, 0x23, 0x45, 0x67, 0x89, 0xa0];

        let mut reader = NaluReader::new(&RBSP);
        assert_eq!(reader.read_bits::<u32>(1).unwrap(), 0);
        assert_eq!(reader.num_bits_left(), 47);
        assert!(reader.has_more_rbsp_data());

        assert_eq!(reader.read_bits::<u32>(8).unwrap(), 0x02);
        assert_eq!(reader.num_bits_left(), 39);
        assert!(reader.has_more_rbsp_data());

        assert_eq!(reader.read_bits::<u32>(31).unwrap(), 0x23456789);
        assert_eq!(reader.num_bits_left(), 8);
        assert!(reader.has_more_rbsp_data());

        assert_eq!(reader.read_bits::<u32>(1).unwrap(), 1);
        assert_eq!(reader.num_bits_left(), 7);
        assert!(reader.has_more_rbsp_data());

        assert_eq!(reader.read_bits::<u32>(1).unwrap(), 0);
        assert_eq!(reader.num_bits_left(), 6);
        assert!(!reader.has_more_rbsp_data());
    }

    #[test]
    fn emulation_prevention_removal() {
        // The 0x03 in 00 00 03 01 is an escape and must not be seen by the
        // bit-level consumer.
        const RBSP: [u8; 4] = [0x00, 0x00, 0x03, 0x01];

        let mut reader = NaluReader::new(&RBSP);
        assert_eq!(reader.read_bits::<u32>(8).unwrap(), 0x00);
        assert_eq!(reader.read_bits::<u32>(8).unwrap(), 0x00);
        assert_eq!(reader.read_bits::<u32>(8).unwrap(), 0x01);
        assert!(!reader.has_more_rbsp_data());
    }

    #[test]
    fn ue_and_se_values() {
        // ue(0)=1, ue(1)=010, ue(2)=011, packed MSB-first.
        const RBSP: [u8; 1] = [0b1010_0110];

        let mut reader = NaluReader::new(&RBSP);
        assert_eq!(reader.read_ue::<u32>().unwrap(), 0);
        assert_eq!(reader.read_ue::<u32>().unwrap(), 1);
        assert_eq!(reader.read_ue::<u32>().unwrap(), 2);

        // se maps ue 1 -> 1, ue 2 -> -1.
        const SIGNED: [u8; 1] = [0b0100_1100];
        let mut reader = NaluReader::new(&SIGNED);
        assert_eq!(reader.read_se::<i32>().unwrap(), 1);
        assert_eq!(reader.read_se::<i32>().unwrap(), -1);
    }

    #[test]
    fn ue_max_bound() {
        const RBSP: [u8; 1] = [0b0011_1000]; // ue = 6

        let mut reader = NaluReader::new(&RBSP);
        assert!(reader.read_ue_max::<u32>(5).is_err());
    }

    #[test]
    fn stop_bit_occupies_full_byte() {
        const RBSP: [u8; 2] = [0xab, 0x80];

        let mut reader = NaluReader::new(&RBSP);
        assert_eq!(reader.num_bits_left(), 16);
        assert!(reader.has_more_rbsp_data());

        assert_eq!(reader.read_bits::<u32>(8).unwrap(), 0xab);
        assert_eq!(reader.num_bits_left(), 8);

        assert!(!reader.has_more_rbsp_data());
    }
}
