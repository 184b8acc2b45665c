//! `swing snapshots` commands.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Args;
use serde_json::{Value, json};

use crate::opts::{StoreOpts, open_keeper, resolve_vat};
use crate::output::print_success;

#[derive(Args, Debug)]
pub struct ListArgs {
    /// Only this vat (id or name)
    #[arg(long)]
    pub vat: Option<String>,
}

#[derive(Args, Debug)]
pub struct ExtractArgs {
    /// Vat id or name
    pub vat: String,

    /// Transcript position the snapshot was taken at
    pub pos: u64,

    /// Destination file
    #[arg(long)]
    pub out: PathBuf,
}

pub fn cmd_list(opts: &StoreOpts, args: &ListArgs) -> Result<()> {
    let keeper = open_keeper(opts)?;
    let vat = match &args.vat {
        Some(vat) => Some(resolve_vat(&keeper, vat)?.to_string()),
        None => None,
    };
    let records = keeper.store().snapshots(vat.as_deref())?;
    let data = if opts.wants_json() {
        serde_json::to_value(&records)?
    } else {
        records
            .iter()
            .map(|r| {
                let use_mark = if r.in_use { "in use" } else { "unused" };
                Value::String(format!(
                    "{}@{}\t{} bytes\t{}\t{use_mark}",
                    r.vat_id, r.snap_pos, r.uncompressed_size, r.hash
                ))
            })
            .collect()
    };
    print_success(opts, data, Vec::new())
}

pub fn cmd_extract(opts: &StoreOpts, args: &ExtractArgs) -> Result<()> {
    let keeper = open_keeper(opts)?;
    let vat = resolve_vat(&keeper, &args.vat)?.to_string();
    let Some(bytes) = keeper.store().snapshot_bytes(&vat, args.pos)? else {
        anyhow::bail!("no snapshot of {vat} at position {}", args.pos);
    };
    std::fs::write(&args.out, &bytes)
        .with_context(|| format!("write snapshot to '{}'", args.out.display()))?;
    let data = if opts.wants_json() {
        json!({ "vat": vat, "pos": args.pos, "bytes": bytes.len(), "out": args.out })
    } else {
        Value::String(format!("wrote {} bytes to {}", bytes.len(), args.out.display()))
    };
    print_success(opts, data, Vec::new())
}
