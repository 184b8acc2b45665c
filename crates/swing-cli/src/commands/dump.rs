//! `swing dump` command.

use anyhow::Result;
use clap::Args;
use serde_json::{Map, Value};

use crate::opts::{StoreOpts, open_keeper};
use crate::output::print_success;

#[derive(Args, Debug)]
pub struct DumpArgs {
    /// Single key to print
    #[arg(conflicts_with = "prefix")]
    pub key: Option<String>,

    /// Print every key starting with this prefix (all keys when empty)
    #[arg(long)]
    pub prefix: Option<String>,
}

pub fn cmd_dump(opts: &StoreOpts, args: &DumpArgs) -> Result<()> {
    let keeper = open_keeper(opts)?;
    if let Some(key) = &args.key {
        let Some(value) = keeper.store().get(key)? else {
            anyhow::bail!("key '{key}' not found");
        };
        return print_success(opts, Value::String(value), Vec::new());
    }

    let prefix = args.prefix.as_deref().unwrap_or("");
    let rows = keeper.store().prefixed(prefix)?;
    let mut warnings = Vec::new();
    if rows.is_empty() {
        warnings.push(format!("no keys under prefix '{prefix}'"));
    }
    let data = if opts.wants_json() {
        let map: Map<String, Value> = rows
            .into_iter()
            .map(|(key, value)| (key, Value::String(value)))
            .collect();
        Value::Object(map)
    } else {
        rows.into_iter()
            .map(|(key, value)| Value::String(format!("{key} = {value}")))
            .collect()
    };
    print_success(opts, data, warnings)
}
