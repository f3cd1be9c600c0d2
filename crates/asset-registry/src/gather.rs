//! Background gathering of package metadata.
//!
//! The [`gatherer`] discovers and reads package files off the main thread
//! and publishes value-typed [`batch`]es into thread-safe queues; the
//! [`scheduler`] drains them on the consuming thread and applies results to
//! the registry state under the write lock.

pub mod batch;
pub mod gatherer;
pub mod scheduler;

pub use batch::{GatherBatch, PackageDependencyRecord};
pub use gatherer::{Gatherer, GatherMode};
pub use scheduler::{GatherScheduler, GatherState, PerformanceMode, TickState};
