//! Rendering of delivered results for stdout.

use dispatch_core::QueryResult;

use crate::config::OutputFormat;

/// Render one result as a single output line.
pub fn render(result: &QueryResult, format: OutputFormat) -> Result<String, serde_json::Error> {
    match format {
        OutputFormat::Text => Ok(format!("{}: {}", result.term, result.matches.join(", "))),
        OutputFormat::Json => serde_json::to_string(result),
    }
}
