//! Priority-tiered database queue hierarchy.
//!
//! - [`work`]: the generic payload-agnostic priority queue primitive
//! - [`database_queue`]: one named queue + one dedicated worker + one
//!   persistent connection
//! - [`lead`]: lead-queue child management (spawn/retire per tier)
//! - [`manager`]: the process-wide registry of lead queues and the
//!   subsystem lifecycle context
//! - [`results`]: result slots keyed by query id

pub mod database_queue;
pub mod lead;
pub mod manager;
pub mod results;
pub mod work;

pub use database_queue::{DatabaseQueue, QueueOptions};
pub use manager::{DatabaseSubsystem, ManagerStats, QueueManager};
pub use results::{PendingResult, ResultRouter};
pub use work::WorkQueue;
