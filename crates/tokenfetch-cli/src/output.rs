use std::io::{self, Write};

use serde::Serialize;
use serde_json::json;
use tokenfetch_core::BatchReport;

use crate::cli::OutputFormat;
use crate::error::CliError;

pub fn render<T: Serialize>(value: &T, pretty: bool) -> Result<(), CliError> {
    let payload = if pretty {
        serde_json::to_string_pretty(value)?
    } else {
        serde_json::to_string(value)?
    };
    println!("{payload}");
    Ok(())
}

pub fn render_report(
    report: &BatchReport,
    format: OutputFormat,
    pretty: bool,
) -> Result<(), CliError> {
    match format {
        OutputFormat::Json => render(report, pretty),
        OutputFormat::Ndjson => {
            let stdout = io::stdout();
            write_ndjson(report, &mut stdout.lock())
        }
    }
}

/// One line per result, ledger entry and cancelled entity, then a closing summary line.
pub fn write_ndjson(report: &BatchReport, out: &mut impl Write) -> Result<(), CliError> {
    for result in &report.results {
        writeln!(out, "{}", json!({ "type": "result", "result": result }))?;
    }
    for entry in &report.errors {
        writeln!(out, "{}", json!({ "type": "error", "error": entry }))?;
    }
    for entity in &report.cancelled {
        writeln!(out, "{}", json!({ "type": "cancelled", "entity": entity }))?;
    }
    writeln!(
        out,
        "{}",
        json!({
            "type": "summary",
            "run_id": report.run_id,
            "window": report.window,
            "summary": report.summary,
        })
    )?;
    out.flush()?;
    Ok(())
}
