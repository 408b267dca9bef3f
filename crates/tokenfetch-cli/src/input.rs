use std::fs;
use std::path::Path;

use serde::Deserialize;
use tokenfetch_core::EntityRef;

use crate::error::CliError;

/// One row of an input file. `Id`/`Symbol` spreadsheet headers are accepted too.
#[derive(Debug, Deserialize)]
struct InputRow {
    #[serde(alias = "Id", alias = "ID")]
    id: i64,
    #[serde(alias = "Symbol")]
    symbol: String,
}

/// Collect `(id, symbol)` pairs from `--entity` flags and an optional input file.
///
/// Validation and deduplication are left to the engine so every bad row surfaces the same way.
pub fn collect_entities(
    flags: &[String],
    input: Option<&Path>,
) -> Result<Vec<(i64, String)>, CliError> {
    let mut entities = flags
        .iter()
        .map(|flag| {
            EntityRef::parse(flag).map(|entity| (entity.id(), entity.symbol().to_owned()))
        })
        .collect::<Result<Vec<_>, _>>()?;

    if let Some(path) = input {
        let raw = fs::read_to_string(path)?;
        let rows: Vec<InputRow> =
            serde_json::from_str(&raw).map_err(|source| CliError::InvalidInput {
                path: path.to_path_buf(),
                source,
            })?;
        entities.extend(rows.into_iter().map(|row| (row.id, row.symbol)));
    }

    Ok(entities)
}
