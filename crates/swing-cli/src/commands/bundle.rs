//! `swing replace-bundle` command.
//!
//! Rewrites `vN.source` in place. The vat's transcript is replayed against
//! the new bundle the next time its worker is brought online, so the new
//! code must behave identically on the recorded deliveries.

use anyhow::Result;
use clap::Args;
use serde_json::{Value, json};
use swing_kernel::VatSource;

use crate::commands::commit;
use crate::opts::{StoreOpts, open_keeper, resolve_vat};
use crate::output::print_success;

#[derive(Args, Debug)]
pub struct ReplaceBundleArgs {
    /// Vat id (`v3`) or name
    pub vat: String,

    /// Bundle name to record for the vat
    pub bundle: String,
}

pub fn cmd_replace_bundle(opts: &StoreOpts, args: &ReplaceBundleArgs) -> Result<()> {
    let mut keeper = open_keeper(opts)?;
    let vat = resolve_vat(&keeper, &args.vat)?;
    if !keeper.is_vat_alive(vat)? {
        anyhow::bail!("{vat} is terminated");
    }
    let previous = keeper.vat_source(vat)?.bundle;
    keeper.set_vat_source(vat, &VatSource::bundle(&args.bundle))?;
    commit(&mut keeper)?;
    tracing::info!("{vat} bundle {previous} -> {}", args.bundle);
    let data = if opts.wants_json() {
        json!({ "vat": vat.to_string(), "previous": previous, "bundle": args.bundle })
    } else {
        Value::String(format!("{vat}: {previous} -> {}", args.bundle))
    };
    print_success(opts, data, Vec::new())
}
