//! Flow identity, per-flow accumulation and feature finalization.

pub mod accumulator;
pub mod finalize;
pub mod key;
pub mod state;

pub use accumulator::FlowAccumulator;
pub use finalize::{active_idle_means, finalize, FeatureVector};
pub use key::{resolve, Direction, Endpoint, FlowKey};
pub use state::{ArrivalLog, FlowState, GapTotals};
