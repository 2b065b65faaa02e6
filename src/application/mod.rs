//! Application services: the relay drain loop, its leadership supervisor,
//! and maintenance jobs.

mod maintenance;
mod relay;
mod supervisor;

pub use maintenance::{purge_published, MaintenanceError, PurgeOutcome};
pub use relay::{RelayNotifier, RelayProcessor, RelayProcessorConfig};
pub use supervisor::{RelayHandle, RelaySupervisor};
