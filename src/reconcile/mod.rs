//! Reconciliation of observed game telemetry against plans.
//!
//! Matchers are pure scoring functions; the drivers read stores, score every
//! candidate pair, and persist proposals above the confidence floor. Users
//! confirm or reject; the plan store owns the state machine.

pub mod jobs;
pub mod transactions;

pub use jobs::{propose_job_matches, score_job, JobMatcherConfig};
pub use transactions::{propose_transaction_matches, score_transaction, TransactionMatcherConfig};

/// Default confidence floor below which candidates are not proposed.
pub const DEFAULT_MIN_CONFIDENCE: f64 = 0.3;
