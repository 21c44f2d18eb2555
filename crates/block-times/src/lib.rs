pub mod arrays;
pub mod error;
pub mod resolver;
pub mod search;

pub use arrays::TimestampHint;
pub use error::ResolveError;
pub use resolver::{BlockSelector, BlockTimeResolver, Resolution, ResolveRequest, Tier};
pub use search::{SearchRound, TimestampSearchCache};
