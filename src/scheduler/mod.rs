//! Scheduler: trigger registry, dispatcher and shutdown.
//!
//! Timers in the [`TriggerRegistry`] send requests over a channel to the
//! dispatcher loop in [`Scheduler`], which runs each one on its own task
//! through the execution coordinator.

mod engine;
mod handle;
mod registry;
mod types;

pub use engine::{DEFAULT_SHUTDOWN_GRACE, RegistrationReport, Scheduler, SchedulerConfig};
pub use handle::SchedulerHandle;
pub use registry::{RegistrationError, TriggerHandle, TriggerRegistry};
pub use types::{SchedulerError, SchedulerState};
