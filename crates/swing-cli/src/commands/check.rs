//! `swing check` command.

use anyhow::Result;
use serde_json::Value;

use crate::opts::{StoreOpts, open_keeper};
use crate::output::print_success;

pub fn cmd_check(opts: &StoreOpts) -> Result<()> {
    let keeper = open_keeper(opts)?;
    let violations = swing_kernel::check_invariants(&keeper)?;
    if violations.is_empty() {
        return print_success(opts, Value::String("ok".into()), Vec::new());
    }
    let data = if opts.wants_json() {
        serde_json::to_value(&violations)?
    } else {
        violations
            .iter()
            .map(|v| Value::String(v.to_string()))
            .collect()
    };
    print_success(opts, data, Vec::new())?;
    anyhow::bail!("{} invariant violation(s)", violations.len())
}
