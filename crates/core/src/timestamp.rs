use std::str::FromStr;
use std::time::{SystemTime, UNIX_EPOCH};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum TimestampError {
    #[error("time is before the unix epoch")]
    BeforeEpoch,
    #[error("invalid timestamp {value:?}: {reason}")]
    Invalid { value: String, reason: String },
}

/// A point in time accepted by the resolver, normalized to unix seconds before use.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Timestamp {
    Seconds(u64),
    Time(SystemTime),
}

impl Timestamp {
    pub fn to_seconds(self) -> Result<u64, TimestampError> {
        match self {
            Self::Seconds(seconds) => Ok(seconds),
            Self::Time(time) => time
                .duration_since(UNIX_EPOCH)
                .map(|duration| duration.as_secs())
                .map_err(|_| TimestampError::BeforeEpoch),
        }
    }
}

impl From<u64> for Timestamp {
    fn from(seconds: u64) -> Self {
        Self::Seconds(seconds)
    }
}

impl From<SystemTime> for Timestamp {
    fn from(time: SystemTime) -> Self {
        Self::Time(time)
    }
}

/// Integer seconds or an RFC 3339 date (`2023-01-01T00:00:00Z`, `2023-01-01 00:00:00`).
impl FromStr for Timestamp {
    type Err = TimestampError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let value = value.trim();
        if let Ok(seconds) = value.parse::<u64>() {
            return Ok(Self::Seconds(seconds));
        }
        humantime::parse_rfc3339_weak(value)
            .map(Self::Time)
            .map_err(|err| TimestampError::Invalid {
                value: value.to_string(),
                reason: err.to_string(),
            })
    }
}

#[cfg(test)]
mod tests {
    use super::Timestamp;
    use std::time::{Duration, UNIX_EPOCH};

    #[test]
    fn parses_seconds_and_dates() {
        let seconds: Timestamp = "1672531200".parse().expect("seconds");
        assert_eq!(seconds.to_seconds().expect("normalize"), 1_672_531_200);

        let date: Timestamp = "2023-01-01T00:00:00Z".parse().expect("rfc3339");
        assert_eq!(date.to_seconds().expect("normalize"), 1_672_531_200);

        let time = Timestamp::from(UNIX_EPOCH + Duration::from_millis(5_900));
        assert_eq!(time.to_seconds().expect("normalize"), 5);

        assert!("yesterday".parse::<Timestamp>().is_err());
    }
}
