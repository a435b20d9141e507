//! Property-based tests for the integer codecs and the time-window
//! partitioner.

use alopex_burrow::codec::{
    BitPackDecoder, BitPackEncoder, PforDecoder, PforEncoder, RunLengthDecoder, RunLengthEncoder,
};
use alopex_burrow::partitioner::{partition_key_for, partition_keys_for};
use alopex_burrow::BurrowError;
use proptest::prelude::*;
use std::collections::HashSet;
use std::time::Duration;

/// Values bounded by a random `max_val`.
fn bounded_values() -> impl Strategy<Value = (u32, Vec<u32>)> {
    any::<u32>().prop_flat_map(|max_val| {
        (
            Just(max_val),
            prop::collection::vec(0..=max_val, 0..400),
        )
    })
}

/// Mostly small counters with rare high-magnitude outliers.
fn counter_values() -> impl Strategy<Value = Vec<u64>> {
    prop::collection::vec(
        prop_oneof![
            20 => 1_000u64..1_200,
            1 => any::<u64>(),
        ],
        0..600,
    )
}

proptest! {
    #[test]
    fn test_bitpack_roundtrip_proptest((max_val, values) in bounded_values()) {
        let mut encoder = BitPackEncoder::new(max_val);
        for &value in &values {
            encoder.encode(value).unwrap();
        }
        encoder.flush();
        let data = encoder.data().to_vec();

        let mut decoder = BitPackDecoder::new(&data).unwrap();
        prop_assert_eq!(decoder.max_val(), max_val);
        let mut decoded = Vec::with_capacity(values.len());
        while let Some(value) = decoder.next() {
            decoded.push(value);
        }
        prop_assert_eq!(decoded, values);
    }

    #[test]
    fn test_bitpack_peek_does_not_advance(values in prop::collection::vec(0u32..16, 1..50)) {
        let mut encoder = BitPackEncoder::new(15);
        for &value in &values {
            encoder.encode(value).unwrap();
        }
        let data = encoder.finish();

        let mut decoder = BitPackDecoder::new(&data).unwrap();
        for &value in &values {
            prop_assert_eq!(decoder.peek(), Some(value));
            prop_assert_eq!(decoder.peek(), Some(value));
            prop_assert_eq!(decoder.next(), Some(value));
        }
        prop_assert_eq!(decoder.peek(), None);
    }

    #[test]
    fn test_bitpack_rejects_values_above_max(max_val in 0u32..u32::MAX, excess in 1u32..1000) {
        let mut encoder = BitPackEncoder::new(max_val);
        let value = max_val.saturating_add(excess);
        let result = encoder.encode(value);
        let is_out_of_range = matches!(result, Err(BurrowError::ValueOutOfRange { .. }));
        prop_assert!(is_out_of_range);
    }

    #[test]
    fn test_pfor_roundtrip_with_outliers_proptest(values in counter_values()) {
        let mut encoder = PforEncoder::new();
        for &value in &values {
            encoder.encode(value);
        }
        encoder.flush();
        let data = encoder.data().to_vec();
        prop_assert_eq!(encoder.size(), data.len());

        let mut decoder = PforDecoder::new(&data);
        let mut decoded = Vec::with_capacity(values.len());
        while let Some(value) = decoder.next() {
            decoded.push(value);
        }
        prop_assert_eq!(decoded, values);
    }

    #[test]
    fn test_run_length_roundtrip_proptest(
        runs in prop::collection::vec((0u32..8, 1usize..20), 0..50)
    ) {
        let values: Vec<u32> = runs
            .iter()
            .flat_map(|&(value, len)| std::iter::repeat(value).take(len))
            .collect();
        let mut encoder = RunLengthEncoder::new();
        for &value in &values {
            encoder.encode(value);
        }
        let data = encoder.finish();

        let mut decoder = RunLengthDecoder::new(&data);
        let mut decoded = Vec::new();
        while let Some(value) = decoder.next() {
            decoded.push(value);
        }
        prop_assert_eq!(decoded, values);
    }

    #[test]
    fn test_same_window_same_key_proptest(
        window_nanos in 1u64..10_000_000_000,
        start in -1_000_000_000_000i64..1_000_000_000_000,
        a in 0u64..10_000_000_000,
        b in 0u64..10_000_000_000,
    ) {
        let window = Duration::from_nanos(window_nanos);
        let w = window_nanos as i64;
        let base = start.div_euclid(w) * w;
        let t1 = base + (a % window_nanos) as i64;
        let t2 = base + (b % window_nanos) as i64;
        prop_assert_eq!(
            partition_key_for(b"stream", t1, window),
            partition_key_for(b"stream", t2, window)
        );
        prop_assert_ne!(
            partition_key_for(b"stream", t1, window),
            partition_key_for(b"stream", base + w, window)
        );
    }

    #[test]
    fn test_partition_keys_cover_range_proptest(
        window_nanos in 1u64..1_000_000,
        from in -1_000_000_000_000i64..1_000_000_000_000,
        span_permille in 0u64..40_000,
    ) {
        let window = Duration::from_nanos(window_nanos);
        let w = window_nanos as i64;
        let until = from + (span_permille * window_nanos / 1000) as i64;

        let keys = partition_keys_for(b"stream", from, until, window).unwrap();
        let expected_len = if until == from {
            0
        } else {
            (until - 1).div_euclid(w) - from.div_euclid(w) + 1
        };
        prop_assert_eq!(keys.len() as i64, expected_len);

        let distinct: HashSet<_> = keys.iter().collect();
        prop_assert_eq!(distinct.len(), keys.len());

        let first_window = from.div_euclid(w);
        for (i, key) in keys.iter().enumerate() {
            let window_start = (first_window + i as i64) * w;
            prop_assert_eq!(*key, partition_key_for(b"stream", window_start, window));
        }
    }

    #[test]
    fn test_inverted_range_is_rejected_proptest(
        from in -1_000_000i64..1_000_000,
        back in 1i64..1_000,
    ) {
        let result = partition_keys_for(b"stream", from, from - back, Duration::from_secs(1));
        let is_invalid_range = matches!(result, Err(BurrowError::InvalidRange { .. }));
        prop_assert!(is_invalid_range);
    }
}
