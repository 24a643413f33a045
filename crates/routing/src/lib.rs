//! Priority scoring, committed-load ledger, and the geo→skill→load
//! assignment engine.

pub mod engine;
pub mod ledger;
pub mod score;

pub use engine::{RoutingEngine, RoutingFailure, RoutingTicket};
pub use ledger::LoadLedger;
pub use score::{score_ticket, PriorityScore};
