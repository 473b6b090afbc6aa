// ABOUTME: Resource module - task admission under CPU, memory, and concurrency
// ABOUTME: limits across cooperative, thread, and process execution contexts.

mod governor;
mod monitor;
mod task;

pub use governor::*;
pub use monitor::*;
pub use task::*;

#[cfg(test)]
mod governor_test;
