//! In-memory tier: the caller already holds block timestamps.

use std::collections::BTreeMap;

use chaincache_core::TimestampMode;

use crate::error::ResolveError;

/// Block timestamps supplied by the caller. Timestamps must be non-decreasing in
/// block number.
#[derive(Debug, Clone, Copy)]
pub enum TimestampHint<'a> {
    Mapping(&'a BTreeMap<u64, u64>),
    Arrays {
        block_numbers: &'a [u64],
        timestamps: &'a [u64],
    },
}

impl<'a> From<&'a BTreeMap<u64, u64>> for TimestampHint<'a> {
    fn from(mapping: &'a BTreeMap<u64, u64>) -> Self {
        Self::Mapping(mapping)
    }
}

impl TimestampHint<'_> {
    pub fn block_of_timestamp(self, timestamp: u64, mode: TimestampMode) -> Result<u64, ResolveError> {
        match self {
            Self::Mapping(mapping) => block_from_mapping(mapping, timestamp, mode),
            Self::Arrays {
                block_numbers,
                timestamps,
            } => block_from_arrays(block_numbers, timestamps, timestamp, mode),
        }
    }
}

pub fn block_from_arrays(
    block_numbers: &[u64],
    timestamps: &[u64],
    timestamp: u64,
    mode: TimestampMode,
) -> Result<u64, ResolveError> {
    if block_numbers.len() != timestamps.len() {
        return Err(ResolveError::configuration(format!(
            "{} block numbers but {} timestamps",
            block_numbers.len(),
            timestamps.len()
        )));
    }
    let index = match mode {
        TimestampMode::After | TimestampMode::Equal => {
            Some(timestamps.partition_point(|ts| *ts < timestamp))
                .filter(|index| *index < timestamps.len())
        }
        TimestampMode::Before => timestamps
            .partition_point(|ts| *ts <= timestamp)
            .checked_sub(1),
    };
    index
        .map(|index| block_numbers[index])
        .ok_or(ResolveError::OutOfRange { timestamp, mode })
}

/// Bisects the block numbers of `mapping`, so a lookup costs a logarithmic
/// number of range queries rather than a scan.
pub fn block_from_mapping(
    mapping: &BTreeMap<u64, u64>,
    timestamp: u64,
    mode: TimestampMode,
) -> Result<u64, ResolveError> {
    let out_of_range = ResolveError::OutOfRange { timestamp, mode };
    let is_upper = |ts: u64| match mode {
        TimestampMode::Before => ts > timestamp,
        TimestampMode::After | TimestampMode::Equal => ts >= timestamp,
    };
    let (Some((&first, &first_ts)), Some((&last, &last_ts))) =
        (mapping.first_key_value(), mapping.last_key_value())
    else {
        return Err(out_of_range);
    };
    if is_upper(first_ts) {
        return match mode {
            TimestampMode::Before => Err(out_of_range),
            TimestampMode::After | TimestampMode::Equal => Ok(first),
        };
    }
    if !is_upper(last_ts) {
        return match mode {
            TimestampMode::Before => Ok(last),
            TimestampMode::After | TimestampMode::Equal => Err(out_of_range),
        };
    }

    // `lo` stays below the answer side, `hi` on it.
    let (mut lo, mut hi) = (first, last);
    loop {
        let mid = lo + (hi - lo) / 2;
        let inner = mapping.range(mid.max(lo + 1)..hi).next().or_else(|| {
            if mid > lo + 1 {
                mapping.range(lo + 1..mid).next_back()
            } else {
                None
            }
        });
        let Some((&number, &ts)) = inner else {
            break;
        };
        if is_upper(ts) {
            hi = number;
        } else {
            lo = number;
        }
    }
    Ok(match mode {
        TimestampMode::Before => lo,
        TimestampMode::After | TimestampMode::Equal => hi,
    })
}

#[cfg(test)]
mod tests {
    use super::{TimestampHint, block_from_arrays};
    use crate::error::ResolveError;
    use chaincache_core::TimestampMode;
    use std::collections::BTreeMap;

    const NUMBERS: [u64; 3] = [100, 200, 300];
    const TIMESTAMPS: [u64; 3] = [1000, 2000, 3000];

    #[test]
    fn arrays_select_by_mode() {
        let hint = TimestampHint::Arrays {
            block_numbers: &NUMBERS,
            timestamps: &TIMESTAMPS,
        };
        let lookup = |timestamp, mode| hint.block_of_timestamp(timestamp, mode).expect("block");
        assert_eq!(lookup(1500, TimestampMode::After), 200);
        assert_eq!(lookup(1500, TimestampMode::Before), 100);
        assert_eq!(lookup(2000, TimestampMode::Equal), 200);
        assert_eq!(lookup(2000, TimestampMode::Before), 200);
        assert_eq!(lookup(2500, TimestampMode::Equal), 300);
        assert_eq!(lookup(500, TimestampMode::After), 100);
    }

    #[test]
    fn mapping_matches_arrays() {
        let mapping: BTreeMap<u64, u64> = NUMBERS.into_iter().zip(TIMESTAMPS).collect();
        let hint = TimestampHint::from(&mapping);
        for timestamp in [999, 1000, 1500, 2000, 2999, 3000] {
            for mode in [TimestampMode::After, TimestampMode::Before, TimestampMode::Equal] {
                let from_arrays = block_from_arrays(&NUMBERS, &TIMESTAMPS, timestamp, mode).ok();
                let from_mapping = hint.block_of_timestamp(timestamp, mode).ok();
                assert_eq!(from_arrays, from_mapping, "{timestamp} {mode}");
            }
        }
    }

    #[test]
    fn ties_pick_the_outermost_block() {
        let numbers = [10, 11, 12, 13];
        let timestamps = [100, 112, 112, 124];
        assert_eq!(
            block_from_arrays(&numbers, &timestamps, 112, TimestampMode::After).expect("after"),
            11
        );
        assert_eq!(
            block_from_arrays(&numbers, &timestamps, 112, TimestampMode::Before).expect("before"),
            12
        );
    }

    #[test]
    fn sparse_mapping_matches_arrays() {
        let numbers: Vec<u64> = (0..500).map(|index| index * 7 + index % 3).collect();
        let timestamps: Vec<u64> = (0..500).map(|index| 10_000 + (index / 4) * 12).collect();
        let mapping: BTreeMap<u64, u64> =
            numbers.iter().copied().zip(timestamps.iter().copied()).collect();
        let hint = TimestampHint::from(&mapping);
        for timestamp in (9_990..11_520).step_by(5) {
            for mode in [TimestampMode::After, TimestampMode::Before, TimestampMode::Equal] {
                let from_arrays = block_from_arrays(&numbers, &timestamps, timestamp, mode).ok();
                let from_mapping = hint.block_of_timestamp(timestamp, mode).ok();
                assert_eq!(from_arrays, from_mapping, "{timestamp} {mode}");
            }
        }

        let single: BTreeMap<u64, u64> = [(5, 50)].into_iter().collect();
        let hint = TimestampHint::from(&single);
        assert_eq!(hint.block_of_timestamp(50, TimestampMode::Before).expect("before"), 5);
        assert_eq!(hint.block_of_timestamp(50, TimestampMode::After).expect("after"), 5);
        assert!(hint.block_of_timestamp(51, TimestampMode::After).is_err());
        assert!(
            TimestampHint::from(&BTreeMap::new())
                .block_of_timestamp(50, TimestampMode::After)
                .is_err()
        );
    }

    #[test]
    fn rejects_bad_input() {
        let err = block_from_arrays(&NUMBERS, &TIMESTAMPS[..2], 1500, TimestampMode::After)
            .expect_err("length mismatch");
        assert!(matches!(err, ResolveError::Configuration(_)));

        let err = block_from_arrays(&NUMBERS, &TIMESTAMPS, 3001, TimestampMode::After)
            .expect_err("past the last block");
        assert!(matches!(err, ResolveError::OutOfRange { timestamp: 3001, .. }));

        let err = block_from_arrays(&NUMBERS, &TIMESTAMPS, 999, TimestampMode::Before)
            .expect_err("before the first block");
        assert!(matches!(err, ResolveError::OutOfRange { timestamp: 999, .. }));
    }
}
