pub mod deviation;
pub mod matching;
pub mod statistics;

pub use deviation::{compute as compute_deviation, signed_difference};
pub use matching::{MatchOutcome, MatchingEngine};
pub use statistics::{compute_all, compute_group, compute_metrics};
