//! Gorilla decoder for time-series decompression

use super::bitstream::BitReader;
use crate::{Result, StrandError, Timestamp};

/// Gorilla decoder for time-series data
///
/// The element count is not part of the stream; callers pass it from the
/// node header, or from a builder's live count when reading pending pairs.
pub struct GorillaDecoder<'a> {
    reader: BitReader<'a>,
    count: usize,
    decoded: usize,

    // Timestamp state
    prev_timestamp: i64,
    prev_timestamp_delta: i64,

    // Value state
    prev_value_bits: u64,
    prev_leading_zeros: u32,
    prev_trailing_zeros: u32,
}

impl<'a> GorillaDecoder<'a> {
    /// Create a new decoder over `count` pairs
    pub fn new(data: &'a [u8], count: usize) -> Self {
        Self {
            reader: BitReader::new(data),
            count,
            decoded: 0,
            prev_timestamp: 0,
            prev_timestamp_delta: 0,
            prev_value_bits: 0,
            prev_leading_zeros: 0,
            prev_trailing_zeros: 0,
        }
    }

    /// Decode all pairs
    pub fn decode_all(&mut self) -> Result<Vec<(Timestamp, f64)>> {
        let mut points = Vec::with_capacity(self.count);

        while let Some((ts, val)) = self.decode_next()? {
            points.push((ts, val));
        }

        Ok(points)
    }

    /// Decode the next timestamp-value pair
    pub fn decode_next(&mut self) -> Result<Option<(Timestamp, f64)>> {
        if self.decoded >= self.count {
            return Ok(None);
        }

        if self.decoded == 0 {
            return self.decode_first();
        }

        let timestamp = self.decode_timestamp()?;
        let value = self.decode_value()?;
        self.decoded += 1;

        Ok(Some((timestamp, value)))
    }

    fn take_bit(&mut self) -> Result<bool> {
        self.reader
            .read_bit()
            .ok_or_else(|| StrandError::Compression("unexpected end of stream".into()))
    }

    fn take_bits(&mut self, n: u32) -> Result<u64> {
        self.reader
            .read_bits(n)
            .ok_or_else(|| StrandError::Compression("unexpected end of stream".into()))
    }

    fn decode_first(&mut self) -> Result<Option<(Timestamp, f64)>> {
        let timestamp = self.take_bits(64)? as i64;
        let value_bits = self.take_bits(64)?;

        self.prev_timestamp = timestamp;
        self.prev_value_bits = value_bits;
        self.decoded = 1;

        Ok(Some((timestamp, f64::from_bits(value_bits))))
    }

    fn decode_timestamp(&mut self) -> Result<i64> {
        let delta_of_delta = if !self.take_bit()? {
            // '0': same delta
            0
        } else if !self.take_bit()? {
            // '10': 7-bit delta-of-delta
            self.take_bits(7)? as i64 - 63
        } else if !self.take_bit()? {
            // '110': 9-bit
            self.take_bits(9)? as i64 - 255
        } else if !self.take_bit()? {
            // '1110': 12-bit
            self.take_bits(12)? as i64 - 2047
        } else {
            // '1111': full 64-bit
            self.take_bits(64)? as i64
        };

        let delta = self.prev_timestamp_delta + delta_of_delta;
        let timestamp = self.prev_timestamp + delta;

        self.prev_timestamp_delta = delta;
        self.prev_timestamp = timestamp;

        Ok(timestamp)
    }

    fn decode_value(&mut self) -> Result<f64> {
        if !self.take_bit()? {
            // Same value
            return Ok(f64::from_bits(self.prev_value_bits));
        }

        let (leading_zeros, meaningful_bits) = if !self.take_bit()? {
            // Previous window
            let meaningful = 64 - self.prev_leading_zeros - self.prev_trailing_zeros;
            (self.prev_leading_zeros, meaningful)
        } else {
            // New window; a nonzero xor has at least one meaningful bit,
            // so a stored 0 means the full 64-bit window
            let leading = self.take_bits(5)? as u32;
            let mut meaningful = self.take_bits(6)? as u32;
            if meaningful == 0 {
                meaningful = 64;
            }
            if leading + meaningful > 64 {
                return Err(StrandError::Compression(
                    "window exceeds 64 bits".into(),
                ));
            }

            self.prev_leading_zeros = leading;
            self.prev_trailing_zeros = 64 - leading - meaningful;

            (leading, meaningful)
        };

        let meaningful_value = self.take_bits(meaningful_bits)?;

        let trailing_zeros = 64 - leading_zeros - meaningful_bits;
        let xor = meaningful_value << trailing_zeros;
        let value_bits = self.prev_value_bits ^ xor;

        self.prev_value_bits = value_bits;

        Ok(f64::from_bits(value_bits))
    }
}
