// ABOUTME: Root module for toolgate - concurrent execution governance for agent tool calls.
// ABOUTME: Re-exports all public types from submodules.

pub mod coordinator;
pub mod error;
pub mod execution;
pub mod gate;
pub mod prelude;
pub mod resource;
pub mod tool;

pub use error::GovernorError;
pub use gate::{GateConfig, ToolGate};
