use anyhow::Result;
use clap::ValueEnum;

use crate::audit::{render_human, AuditRecord};

#[derive(Clone, Copy, Debug, ValueEnum)]
pub enum OutputFormat {
    Human,
    Json,
    Yaml,
}

pub fn render(record: &AuditRecord, format: OutputFormat) -> Result<String> {
    Ok(match format {
        OutputFormat::Human => render_human(record),
        OutputFormat::Json => serde_json::to_string_pretty(record)?,
        OutputFormat::Yaml => serde_yaml::to_string(record)?,
    })
}
