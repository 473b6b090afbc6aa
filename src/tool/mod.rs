// ABOUTME: Tool module - the tool-backend capability, registry, and outputs.
// ABOUTME: Everything the execution core knows about concrete tools lives here.

mod registry;
mod result;
mod traits;

pub use registry::*;
pub use result::*;
pub use traits::*;

#[cfg(test)]
mod result_test;
