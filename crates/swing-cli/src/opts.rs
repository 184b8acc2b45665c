//! Global CLI options and store resolution.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Args;
use swing_abi::VatId;
use swing_kernel::KernelKeeper;
use swing_store::{SqliteBackend, SwingStore};

/// Global options for CLI commands.
#[derive(Args, Debug, Clone)]
pub struct StoreOpts {
    /// SQLite kernel database (env: SWING_DB)
    #[arg(long, global = true, env = "SWING_DB")]
    pub db: Option<PathBuf>,

    /// JSON output envelope
    #[arg(long, global = true)]
    pub json: bool,

    /// Pretty-print JSON output (implies --json)
    #[arg(long, global = true)]
    pub pretty: bool,
}

impl StoreOpts {
    pub fn wants_json(&self) -> bool {
        self.json || self.pretty
    }
}

/// Open the kernel store named by `--db`. The file must already exist;
/// the CLI never creates a fresh kernel.
pub fn open_keeper(opts: &StoreOpts) -> Result<KernelKeeper> {
    let Some(path) = &opts.db else {
        anyhow::bail!("no database specified. Pass --db <PATH> or set SWING_DB");
    };
    if !path.is_file() {
        anyhow::bail!("database '{}' not found", path.display());
    }
    let backend = SqliteBackend::open(path)
        .with_context(|| format!("open database '{}'", path.display()))?;
    Ok(KernelKeeper::new(SwingStore::new(backend)))
}

/// Accept either a vat id (`v3`) or a registered vat name.
pub fn resolve_vat(keeper: &KernelKeeper, vat: &str) -> Result<VatId> {
    if let Ok(id) = vat.parse::<VatId>() {
        if keeper.all_vat_ids()?.contains(&id) {
            return Ok(id);
        }
    }
    match keeper.vat_id_for_name(vat)? {
        Some(id) => Ok(id),
        None => anyhow::bail!("unknown vat '{vat}'"),
    }
}
