//! Quota-Aware Concurrency Fabric: shares a finite external-API budget
//! across heterogeneous task classes with adaptive feedback.

mod concurrency;
mod types;

pub use concurrency::{ConcurrencyFabric, FabricPermit};
pub use types::{Outcome, TaskClass, WindowSummary, WINDOW_CAP};
