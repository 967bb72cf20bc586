//! Gorilla encoder for time-series compression

use super::bitstream::BitWriter;
use super::{Aggregates, CompressedRun};
use crate::{AppendOutcome, Timestamp};

/// Bounded Gorilla encoder
///
/// Pairs are accepted only while the encoded stream fits `capacity` bytes
/// and timestamps never decrease. A rejected pair leaves the encoder state
/// untouched.
pub struct GorillaEncoder {
    writer: BitWriter,
    capacity: usize,
    aggregates: Aggregates,

    // Timestamp state
    prev_timestamp: i64,
    prev_timestamp_delta: i64,

    // Value state
    prev_value_bits: u64,
    prev_leading_zeros: u32,
    prev_trailing_zeros: u32,
}

#[derive(Clone, Copy)]
struct EncoderState {
    prev_timestamp: i64,
    prev_timestamp_delta: i64,
    prev_value_bits: u64,
    prev_leading_zeros: u32,
    prev_trailing_zeros: u32,
}

impl GorillaEncoder {
    /// Create an encoder whose output may not exceed `capacity` bytes
    pub fn bounded(capacity: usize) -> Self {
        Self {
            writer: BitWriter::with_capacity(capacity),
            capacity,
            aggregates: Aggregates::empty(),
            prev_timestamp: 0,
            prev_timestamp_delta: 0,
            prev_value_bits: 0,
            prev_leading_zeros: 0,
            prev_trailing_zeros: 0,
        }
    }

    /// Encode a timestamp-value pair
    pub fn put(&mut self, timestamp: Timestamp, value: f64) -> AppendOutcome {
        if self.aggregates.count > 0 && timestamp < self.prev_timestamp {
            return AppendOutcome::OutOfOrder;
        }

        let mark = self.writer.mark();
        let state = self.save_state();

        if self.aggregates.count == 0 {
            self.encode_first(timestamp, value);
        } else {
            self.encode_timestamp(timestamp);
            self.encode_value(value);
        }

        if self.writer.len() > self.capacity {
            self.writer.rollback(mark);
            self.restore_state(state);
            return AppendOutcome::Full;
        }

        self.aggregates.update(timestamp, value);
        AppendOutcome::Ok
    }

    /// Number of pairs accepted so far
    pub fn count(&self) -> u32 {
        self.aggregates.count
    }

    /// Check if no pair was accepted yet
    pub fn is_empty(&self) -> bool {
        self.aggregates.count == 0
    }

    /// Aggregates of the pairs accepted so far
    pub fn aggregates(&self) -> &Aggregates {
        &self.aggregates
    }

    /// Encoded bytes so far, including pending partial-byte bits.
    ///
    /// Together with `count` this lets a caller decode the pending pairs
    /// of a not-yet-finished encoder.
    pub fn pending_bytes(&self) -> Vec<u8> {
        self.writer.snapshot()
    }

    /// Finish encoding and return the compressed run
    pub fn finish(self) -> CompressedRun {
        CompressedRun {
            data: self.writer.finish(),
            aggregates: self.aggregates,
        }
    }

    fn save_state(&self) -> EncoderState {
        EncoderState {
            prev_timestamp: self.prev_timestamp,
            prev_timestamp_delta: self.prev_timestamp_delta,
            prev_value_bits: self.prev_value_bits,
            prev_leading_zeros: self.prev_leading_zeros,
            prev_trailing_zeros: self.prev_trailing_zeros,
        }
    }

    fn restore_state(&mut self, state: EncoderState) {
        self.prev_timestamp = state.prev_timestamp;
        self.prev_timestamp_delta = state.prev_timestamp_delta;
        self.prev_value_bits = state.prev_value_bits;
        self.prev_leading_zeros = state.prev_leading_zeros;
        self.prev_trailing_zeros = state.prev_trailing_zeros;
    }

    fn encode_first(&mut self, timestamp: i64, value: f64) {
        self.prev_timestamp = timestamp;

        // First pair is stored verbatim: 64 bits of timestamp, 64 of value
        self.writer.write_bits(timestamp as u64, 64);

        let value_bits = value.to_bits();
        self.writer.write_bits(value_bits, 64);
        self.prev_value_bits = value_bits;
    }

    fn encode_timestamp(&mut self, timestamp: i64) {
        let delta = timestamp - self.prev_timestamp;
        let delta_of_delta = delta - self.prev_timestamp_delta;

        // Most consecutive timestamps share a delta, so delta-of-delta is
        // usually 0 and costs a single bit
        if delta_of_delta == 0 {
            self.writer.write_bit(false);
        } else if (-63..=64).contains(&delta_of_delta) {
            self.writer.write_bits(0b10, 2);
            self.writer.write_bits((delta_of_delta + 63) as u64, 7);
        } else if (-255..=256).contains(&delta_of_delta) {
            self.writer.write_bits(0b110, 3);
            self.writer.write_bits((delta_of_delta + 255) as u64, 9);
        } else if (-2047..=2048).contains(&delta_of_delta) {
            self.writer.write_bits(0b1110, 4);
            self.writer.write_bits((delta_of_delta + 2047) as u64, 12);
        } else {
            self.writer.write_bits(0b1111, 4);
            self.writer.write_bits(delta_of_delta as u64, 64);
        }

        self.prev_timestamp_delta = delta;
        self.prev_timestamp = timestamp;
    }

    fn encode_value(&mut self, value: f64) {
        let value_bits = value.to_bits();
        let xor = value_bits ^ self.prev_value_bits;

        if xor == 0 {
            // Identical value, single '0' bit
            self.writer.write_bit(false);
        } else {
            self.writer.write_bit(true);

            let leading_zeros = xor.leading_zeros();
            let trailing_zeros = xor.trailing_zeros();

            if leading_zeros >= self.prev_leading_zeros
                && trailing_zeros >= self.prev_trailing_zeros
            {
                // Meaningful bits fit the previous window
                self.writer.write_bit(false);
                let meaningful_bits = 64 - self.prev_leading_zeros - self.prev_trailing_zeros;
                let shifted = xor >> self.prev_trailing_zeros;
                self.writer.write_bits(shifted, meaningful_bits);
            } else {
                // New window: 5 bits of leading-zero count, 6 bits of length
                self.writer.write_bit(true);

                // The stored leading count saturates at 31; the window
                // widens instead so both sides derive the same layout
                let leading = leading_zeros.min(31);
                let meaningful_bits = 64 - leading - trailing_zeros;
                self.writer.write_bits(leading as u64, 5);
                // A full 64-bit window is stored as 0
                self.writer.write_bits((meaningful_bits & 63) as u64, 6);

                let shifted = xor >> trailing_zeros;
                self.writer.write_bits(shifted, meaningful_bits);

                self.prev_leading_zeros = leading;
                self.prev_trailing_zeros = trailing_zeros;
            }
        }

        self.prev_value_bits = value_bits;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encoder_single_point() {
        let mut encoder = GorillaEncoder::bounded(4096);
        assert_eq!(encoder.put(1000000000, 23.5), AppendOutcome::Ok);
        let run = encoder.finish();

        assert_eq!(run.aggregates.count, 1);
        assert_eq!(run.aggregates.ts_min, 1000000000);
        assert_eq!(run.aggregates.ts_max, 1000000000);
        assert_eq!(run.aggregates.sum, 23.5);
    }

    #[test]
    fn test_encoder_constant_delta() {
        let mut encoder = GorillaEncoder::bounded(4096);

        // Constant 10-second intervals, constant value
        for i in 0..100 {
            let outcome = encoder.put(1000000000 + i * 10_000_000_000, 23.5);
            assert_eq!(outcome, AppendOutcome::Ok);
        }

        let run = encoder.finish();
        assert_eq!(run.aggregates.count, 100);

        // Each additional point should cost about 2 bits
        let bytes_per_point = run.bytes_per_point();
        assert!(
            bytes_per_point < 2.0,
            "Expected < 2 bytes/point for constant data, got {}",
            bytes_per_point
        );
    }

    #[test]
    fn test_encoder_rejects_out_of_order() {
        let mut encoder = GorillaEncoder::bounded(4096);
        assert_eq!(encoder.put(100, 1.0), AppendOutcome::Ok);
        assert_eq!(encoder.put(99, 2.0), AppendOutcome::OutOfOrder);
        // Equal timestamps are accepted
        assert_eq!(encoder.put(100, 3.0), AppendOutcome::Ok);
        assert_eq!(encoder.count(), 2);
    }

    #[test]
    fn test_encoder_reports_full() {
        let mut encoder = GorillaEncoder::bounded(64);

        let mut accepted = 0u32;
        for i in 0..1000 {
            match encoder.put(i, (i * 7919) as f64) {
                AppendOutcome::Ok => accepted += 1,
                AppendOutcome::Full => break,
                AppendOutcome::OutOfOrder => panic!("monotone input rejected"),
            }
        }

        assert!(accepted > 0);
        assert_eq!(encoder.count(), accepted);

        // Once full, a further put stays rejected and changes nothing
        let before = encoder.pending_bytes();
        assert_eq!(encoder.put(2000, 1.0), AppendOutcome::Full);
        assert_eq!(encoder.pending_bytes(), before);

        let run = encoder.finish();
        assert!(run.data.len() <= 64);
        assert_eq!(run.aggregates.count, accepted);
    }

    #[test]
    fn test_encoder_aggregates() {
        let mut encoder = GorillaEncoder::bounded(4096);
        for (ts, v) in [(10, 4.0), (20, -1.0), (30, 2.5)] {
            assert_eq!(encoder.put(ts, v), AppendOutcome::Ok);
        }

        let agg = *encoder.aggregates();
        assert_eq!(agg.count, 3);
        assert_eq!(agg.ts_min, 10);
        assert_eq!(agg.ts_max, 30);
        assert_eq!(agg.v_min, -1.0);
        assert_eq!(agg.v_max, 4.0);
        assert_eq!(agg.sum, 5.5);
    }
}
