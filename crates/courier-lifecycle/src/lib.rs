//! Message-lifecycle decision pipeline for Courier.
//!
//! Provides the correlation context, deduplication engine, telemetry state
//! machine, decision trace ledger and outbound gate evaluator, plus the
//! pipeline facade that wires them together over the repository traits in
//! `courier-store`.

pub mod lifecycle_config;
pub mod lifecycle_context;
pub mod lifecycle_dedupe;
pub mod lifecycle_explain;
pub mod lifecycle_gate;
pub mod lifecycle_persistence;
pub mod lifecycle_pipeline;
pub mod lifecycle_sweeper;
pub mod lifecycle_telemetry;
pub mod lifecycle_trace;

#[cfg(test)]
pub(crate) mod test_support;

pub use lifecycle_config::*;
pub use lifecycle_context::*;
pub use lifecycle_dedupe::*;
pub use lifecycle_explain::*;
pub use lifecycle_gate::*;
pub use lifecycle_persistence::*;
pub use lifecycle_pipeline::*;
pub use lifecycle_sweeper::*;
pub use lifecycle_telemetry::*;
pub use lifecycle_trace::*;

use std::sync::{Mutex, MutexGuard};

pub(crate) fn lock_unpoisoned<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}
