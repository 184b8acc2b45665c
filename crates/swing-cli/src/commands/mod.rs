//! CLI command handlers.

pub mod bundle;
pub mod check;
pub mod dump;
pub mod snapshots;
pub mod stats;
pub mod transcript;
pub mod vats;

use anyhow::{Context, Result};
use swing_kernel::KernelKeeper;

/// Write pending changes back to the database.
pub fn commit(keeper: &mut KernelKeeper) -> Result<usize> {
    keeper.store_mut().commit().context("commit changes")
}
