// Settlement engine: entity state machines, feed derivation and the per-kind reconcilers
pub mod engine;
pub mod feed;
pub mod jobs;
pub mod payments;
pub mod payouts;
pub mod refunds;
pub mod scheduler;
pub mod state;
pub mod transfers;

pub use engine::{ItemOutcome, ReconcileReport};
pub use jobs::SettlementEngine;
pub use scheduler::SettlementScheduler;
