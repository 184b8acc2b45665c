//! `swing transcript` commands.

use anyhow::Result;
use clap::Args;
use serde_json::{Value, json};

use crate::commands::commit;
use crate::opts::{StoreOpts, open_keeper, resolve_vat};
use crate::output::print_success;

#[derive(Args, Debug)]
pub struct PruneArgs {
    /// Only this vat (id or name)
    #[arg(long)]
    pub vat: Option<String>,

    /// Also delete snapshots that are no longer in use
    #[arg(long)]
    pub snapshots: bool,
}

#[derive(Args, Debug)]
pub struct SpansArgs {
    /// Vat id or name
    pub vat: String,
}

pub fn cmd_prune(opts: &StoreOpts, args: &PruneArgs) -> Result<()> {
    let mut keeper = open_keeper(opts)?;
    let vats = match &args.vat {
        Some(vat) => vec![resolve_vat(&keeper, vat)?],
        None => keeper.all_vat_ids()?,
    };
    let mut items = 0;
    let mut snapshots = 0;
    for vat in &vats {
        let key = vat.to_string();
        items += keeper.store_mut().prune_superseded(&key)?;
        if args.snapshots {
            snapshots += keeper.store_mut().delete_unused_snapshots(Some(&key))?;
        }
    }
    commit(&mut keeper)?;
    let data = if opts.wants_json() {
        json!({ "vats": vats.len(), "items": items, "snapshots": snapshots })
    } else {
        Value::String(format!(
            "pruned {items} transcript items and {snapshots} snapshots across {} vats",
            vats.len()
        ))
    };
    print_success(opts, data, Vec::new())
}

pub fn cmd_spans(opts: &StoreOpts, args: &SpansArgs) -> Result<()> {
    let keeper = open_keeper(opts)?;
    let vat = resolve_vat(&keeper, &args.vat)?.to_string();
    let spans = keeper.store().spans(Some(&vat))?;
    let data = if opts.wants_json() {
        serde_json::to_value(&spans)?
    } else {
        spans
            .iter()
            .map(|s| {
                let current = if s.is_current { "\tcurrent" } else { "" };
                Value::String(format!(
                    "[{}, {})\tincarnation {}\t{}{current}",
                    s.start_pos, s.end_pos, s.incarnation, s.hash
                ))
            })
            .collect()
    };
    print_success(opts, data, Vec::new())
}
