//! Test utilities for exercising the vat kernel with deterministic fixture vats.
//!
//! - `fixtures`: small vats covering counting, exporting, holding, relaying and upgrades
//! - `TestKernel`: a kernel over an in-memory store with every fixture registered

pub mod fixtures;
mod harness;

pub use fixtures::fixture_registry;
pub use harness::{TestKernel, mem_store};
