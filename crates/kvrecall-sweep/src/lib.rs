pub mod batch;
pub mod context;
pub mod schedule;
pub mod scheduler;
pub mod trial;

pub use batch::{split_for_submission, BatchOptions, BatchOrchestrator};
pub use context::RunContext;
pub use schedule::{explicit_pairs, plan, staircase, GridMode};
pub use scheduler::{Scheduler, SweepOptions, SweepReport, UnitFailure};
pub use trial::max_token_cap;
