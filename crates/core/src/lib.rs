pub mod client;
pub mod confirmations;
pub mod events;
pub mod provider;
pub mod query_rpc_pool;
pub mod schema;
pub mod store;
pub mod timestamp;
pub mod types;

pub use client::{ChainClient, ClientError};
pub use confirmations::{ConfirmationPolicy, PolicyError};
pub use events::{EncodedEvent, EventBatch, EventColumns, EventError, EventFilter, EventQuery};
pub use schema::{SchemaDescriptor, SchemaName, SchemaVersion};
pub use store::{Store, StoreError, StoreRead, StoreWrite};
pub use timestamp::{Timestamp, TimestampError};
pub use types::{BlockRef, ConfirmationContext, TimestampMode};
