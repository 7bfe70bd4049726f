pub mod scheduler;
pub mod tracked;

pub use scheduler::{CullReport, DiscoveryReport, RefreshReport, Scheduler, SchedulerConfig};
pub use tracked::TrackedSet;
