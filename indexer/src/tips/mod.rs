//! Header collection near the chain tip

pub mod tracker;
pub mod unconfirmed;

pub use tracker::{TipCandidate, TipTracker, TipTrackerSettings};
pub use unconfirmed::UnconfirmedBlockManager;
