pub mod guard;
pub mod intake;
pub mod manager;
pub mod types;

pub use guard::{GuardError, RepairReport, repair};
pub use intake::{EventIntake, IntakeError, IntakeOutcome};
pub use manager::{CacheManager, CacheManagerError, NetworkCache};
pub use types::NetworkConfig;
