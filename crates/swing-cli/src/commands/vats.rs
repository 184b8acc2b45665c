//! `swing vats` command.

use anyhow::Result;
use serde::Serialize;
use serde_json::Value;

use crate::opts::{StoreOpts, open_keeper};
use crate::output::print_success;

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct VatRow {
    id: String,
    name: String,
    bundle: String,
    incarnation: u64,
    alive: bool,
    critical: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    terminated: Option<swing_kernel::TerminationRecord>,
}

pub fn cmd_vats(opts: &StoreOpts) -> Result<()> {
    let keeper = open_keeper(opts)?;
    let mut rows = Vec::new();
    for vat in keeper.all_vat_ids()? {
        let options = keeper.vat_options(vat)?;
        rows.push(VatRow {
            id: vat.to_string(),
            name: options.name.clone(),
            bundle: keeper.vat_source(vat)?.bundle,
            incarnation: keeper.incarnation(vat)?,
            alive: keeper.is_vat_alive(vat)?,
            critical: options.critical,
            terminated: keeper.termination_record(vat)?,
        });
    }
    let data = if opts.wants_json() {
        serde_json::to_value(&rows)?
    } else {
        rows.iter()
            .map(|row| {
                let state = if row.alive { "alive" } else { "terminated" };
                Value::String(format!(
                    "{}\t{}\t{}\tincarnation {}\t{state}",
                    row.id, row.name, row.bundle, row.incarnation
                ))
            })
            .collect()
    };
    print_success(opts, data, Vec::new())
}
