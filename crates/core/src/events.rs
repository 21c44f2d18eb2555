use alloy::primitives::{Address, B256, Bytes};
use alloy_rpc_types_eth::Log;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum EventError {
    #[error("log is missing {0}")]
    MissingField(&'static str),
    #[error("column {column} has {actual} rows, expected {expected}")]
    ColumnLengthMismatch {
        column: &'static str,
        expected: usize,
        actual: usize,
    },
}

/// A raw log as stored in the events cache. Identity is `(block_number, log_index)`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncodedEvent {
    pub block_number: u64,
    pub transaction_index: u64,
    pub log_index: u64,
    pub transaction_hash: B256,
    pub contract_address: Address,
    pub event_hash: Option<B256>,
    pub topic1: Option<B256>,
    pub topic2: Option<B256>,
    pub topic3: Option<B256>,
    pub unindexed: Bytes,
}

impl TryFrom<&Log> for EncodedEvent {
    type Error = EventError;

    fn try_from(log: &Log) -> Result<Self, Self::Error> {
        let topics = log.topics();
        Ok(Self {
            block_number: log
                .block_number
                .ok_or(EventError::MissingField("block_number"))?,
            transaction_index: log
                .transaction_index
                .ok_or(EventError::MissingField("transaction_index"))?,
            log_index: log.log_index.ok_or(EventError::MissingField("log_index"))?,
            transaction_hash: log
                .transaction_hash
                .ok_or(EventError::MissingField("transaction_hash"))?,
            contract_address: log.address(),
            event_hash: topics.first().copied(),
            topic1: topics.get(1).copied(),
            topic2: topics.get(2).copied(),
            topic3: topics.get(3).copied(),
            unindexed: log.data().data.clone(),
        })
    }
}

/// Columnar form of an event batch, one vector per field.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EventColumns {
    pub block_number: Vec<u64>,
    pub transaction_index: Vec<u64>,
    pub log_index: Vec<u64>,
    pub transaction_hash: Vec<B256>,
    pub contract_address: Vec<Address>,
    pub event_hash: Vec<Option<B256>>,
    pub topic1: Vec<Option<B256>>,
    pub topic2: Vec<Option<B256>>,
    pub topic3: Vec<Option<B256>>,
    pub unindexed: Vec<Bytes>,
}

impl EventColumns {
    #[must_use]
    pub fn len(&self) -> usize {
        self.block_number.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.block_number.is_empty()
    }

    pub fn push(&mut self, event: EncodedEvent) {
        self.block_number.push(event.block_number);
        self.transaction_index.push(event.transaction_index);
        self.log_index.push(event.log_index);
        self.transaction_hash.push(event.transaction_hash);
        self.contract_address.push(event.contract_address);
        self.event_hash.push(event.event_hash);
        self.topic1.push(event.topic1);
        self.topic2.push(event.topic2);
        self.topic3.push(event.topic3);
        self.unindexed.push(event.unindexed);
    }

    pub fn into_records(self) -> Result<Vec<EncodedEvent>, EventError> {
        let expected = self.len();
        for (column, actual) in [
            ("transaction_index", self.transaction_index.len()),
            ("log_index", self.log_index.len()),
            ("transaction_hash", self.transaction_hash.len()),
            ("contract_address", self.contract_address.len()),
            ("event_hash", self.event_hash.len()),
            ("topic1", self.topic1.len()),
            ("topic2", self.topic2.len()),
            ("topic3", self.topic3.len()),
            ("unindexed", self.unindexed.len()),
        ] {
            if actual != expected {
                return Err(EventError::ColumnLengthMismatch {
                    column,
                    expected,
                    actual,
                });
            }
        }

        let mut transaction_index = self.transaction_index.into_iter();
        let mut log_index = self.log_index.into_iter();
        let mut transaction_hash = self.transaction_hash.into_iter();
        let mut contract_address = self.contract_address.into_iter();
        let mut event_hash = self.event_hash.into_iter();
        let mut topic1 = self.topic1.into_iter();
        let mut topic2 = self.topic2.into_iter();
        let mut topic3 = self.topic3.into_iter();
        let mut unindexed = self.unindexed.into_iter();
        self.block_number
            .into_iter()
            .map(|block_number| {
                Some(EncodedEvent {
                    block_number,
                    transaction_index: transaction_index.next()?,
                    log_index: log_index.next()?,
                    transaction_hash: transaction_hash.next()?,
                    contract_address: contract_address.next()?,
                    event_hash: event_hash.next()?,
                    topic1: topic1.next()?,
                    topic2: topic2.next()?,
                    topic3: topic3.next()?,
                    unindexed: unindexed.next()?,
                })
            })
            .collect::<Option<Vec<_>>>()
            .ok_or(EventError::ColumnLengthMismatch {
                column: "block_number",
                expected,
                actual: expected,
            })
    }
}

impl FromIterator<EncodedEvent> for EventColumns {
    fn from_iter<I: IntoIterator<Item = EncodedEvent>>(iter: I) -> Self {
        let mut columns = Self::default();
        for event in iter {
            columns.push(event);
        }
        columns
    }
}

/// Events handed to intake, either as records or as columns.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EventBatch {
    Records(Vec<EncodedEvent>),
    Columns(EventColumns),
}

impl EventBatch {
    pub fn into_records(self) -> Result<Vec<EncodedEvent>, EventError> {
        match self {
            Self::Records(events) => Ok(events),
            Self::Columns(columns) => columns.into_records(),
        }
    }
}

impl From<Vec<EncodedEvent>> for EventBatch {
    fn from(events: Vec<EncodedEvent>) -> Self {
        Self::Records(events)
    }
}

impl From<EventColumns> for EventBatch {
    fn from(columns: EventColumns) -> Self {
        Self::Columns(columns)
    }
}

/// Which logs a query range covers. `None` fields match anything.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EventFilter {
    pub contract_address: Option<Address>,
    pub event_hash: Option<B256>,
    pub topic1: Option<B256>,
    pub topic2: Option<B256>,
    pub topic3: Option<B256>,
}

impl EventFilter {
    /// Stable key for persisting query ranges of this filter.
    #[must_use]
    pub fn key(&self) -> String {
        fn part<T: std::fmt::Display>(value: Option<&T>) -> String {
            value.map_or_else(|| "*".to_string(), ToString::to_string)
        }
        format!(
            "{}|{}|{}|{}|{}",
            part(self.contract_address.as_ref()),
            part(self.event_hash.as_ref()),
            part(self.topic1.as_ref()),
            part(self.topic2.as_ref()),
            part(self.topic3.as_ref()),
        )
    }

    #[must_use]
    pub fn matches(&self, event: &EncodedEvent) -> bool {
        fn matches_field<T: PartialEq>(filter: Option<&T>, value: Option<&T>) -> bool {
            filter.is_none_or(|wanted| value == Some(wanted))
        }
        matches_field(
            self.contract_address.as_ref(),
            Some(&event.contract_address),
        ) && matches_field(self.event_hash.as_ref(), event.event_hash.as_ref())
            && matches_field(self.topic1.as_ref(), event.topic1.as_ref())
            && matches_field(self.topic2.as_ref(), event.topic2.as_ref())
            && matches_field(self.topic3.as_ref(), event.topic3.as_ref())
    }
}

/// An inclusive block range that has been indexed for `filter`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventQuery {
    pub start_block: u64,
    pub end_block: u64,
    pub filter: EventFilter,
}

#[cfg(test)]
mod tests {
    use super::{EncodedEvent, EventBatch, EventColumns, EventError, EventFilter};
    use alloy::primitives::{Address, B256, Bytes};

    fn event(block_number: u64, log_index: u64) -> EncodedEvent {
        EncodedEvent {
            block_number,
            transaction_index: 0,
            log_index,
            transaction_hash: B256::repeat_byte(1),
            contract_address: Address::repeat_byte(2),
            event_hash: Some(B256::repeat_byte(3)),
            topic1: None,
            topic2: None,
            topic3: None,
            unindexed: Bytes::from_static(&[0xaa]),
        }
    }

    #[test]
    fn columns_normalize_to_records() {
        let records = vec![event(10, 0), event(11, 4)];
        let columns: EventColumns = records.clone().into_iter().collect();
        assert_eq!(columns.len(), 2);

        let normalized = EventBatch::from(columns)
            .into_records()
            .expect("normalize columns");
        assert_eq!(normalized, records);
    }

    #[test]
    fn ragged_columns_are_rejected() {
        let mut columns: EventColumns = vec![event(10, 0), event(11, 1)].into_iter().collect();
        columns.topic2.pop();
        let err = columns.into_records().expect_err("ragged columns");
        assert!(matches!(
            err,
            EventError::ColumnLengthMismatch {
                column: "topic2",
                expected: 2,
                actual: 1
            }
        ));
    }

    #[test]
    fn filter_matching_and_key() {
        let wanted = EventFilter {
            contract_address: Some(Address::repeat_byte(2)),
            ..EventFilter::default()
        };
        let other = EventFilter {
            contract_address: Some(Address::repeat_byte(9)),
            ..EventFilter::default()
        };
        assert!(wanted.matches(&event(1, 0)));
        assert!(!other.matches(&event(1, 0)));
        assert!(EventFilter::default().matches(&event(1, 0)));
        assert_ne!(wanted.key(), other.key());
        assert_eq!(EventFilter::default().key(), "*|*|*|*|*");
    }
}
