// ABOUTME: Execution module - request/result model, strategy planning, and the
// ABOUTME: runner that drives tool calls through a backend.

mod executor;
mod planner;
mod runner;
mod types;

pub use executor::*;
pub use planner::ExecutionPlanner;
pub use runner::*;
pub use types::*;

#[cfg(test)]
mod planner_test;
