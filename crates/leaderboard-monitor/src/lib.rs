#![forbid(unsafe_code)]

//! Polling side of the tracker: fetch the upstream ranking, reconcile it
//! against the stored players, and repeat on a fixed period.

mod reconcile;
mod scheduler;
mod source;

pub use reconcile::{reconcile, run_pass, PassOutcome, ReconcileReport};
pub use scheduler::Scheduler;
pub use source::{
    parse_ranking_payload, HiscoreRankingSource, DEFAULT_RANKING_SIZE, DEFAULT_RANKING_URL,
    MAXED_TOTAL_LEVEL,
};
