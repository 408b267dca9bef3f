use serde_json::{json, Value};
use tokenfetch_core::{CacheError, CacheWarehouse, WarehouseConfig};

use crate::cli::{CacheArgs, CacheCommand};
use crate::error::CliError;

pub fn run(args: &CacheArgs) -> Result<Value, CliError> {
    execute(args.command, WarehouseConfig::default())
}

fn execute(command: CacheCommand, config: WarehouseConfig) -> Result<Value, CliError> {
    let warehouse = CacheWarehouse::open(config).map_err(CacheError::from)?;

    match command {
        CacheCommand::Stats => {
            let stats = warehouse.stats().map_err(CacheError::from)?;
            Ok(serde_json::to_value(stats)?)
        }
        CacheCommand::Clear => {
            let removed = warehouse.clear().map_err(CacheError::from)?;
            Ok(json!({
                "db_path": warehouse.db_path().display().to_string(),
                "removed": removed,
            }))
        }
    }
}
