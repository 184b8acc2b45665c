//! `swing stats` command.

use anyhow::Result;

use crate::opts::{StoreOpts, open_keeper};
use crate::output::print_success;

pub fn cmd_stats(opts: &StoreOpts) -> Result<()> {
    let keeper = open_keeper(opts)?;
    let stats = swing_kernel::collect_stats(&keeper)?;
    print_success(opts, serde_json::to_value(&stats)?, Vec::new())
}
