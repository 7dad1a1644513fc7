use std::collections::HashMap;

use tracing::trace;

#[derive(Debug, Clone, serde::Deserialize)]
pub struct Config {
    pub checks: Vec<CheckDefinition>,
}

/// A declarative check definition as it appears in the config file.
///
/// `sinks` is an ordered list of single-entry maps, `{sinkType: argsMap}`.
/// The args map may carry an `id` key, which makes the constructed sink
/// shareable across definitions referencing the same id.
#[derive(Debug, Clone, serde::Deserialize)]
pub struct CheckDefinition {
    pub name: String,
    #[serde(rename = "type")]
    pub check_type: String,
    #[serde(default)]
    pub args: HashMap<String, String>,
    /// Interval between check executions, in seconds
    #[serde(default = "default_interval")]
    pub interval: u64,
    #[serde(default)]
    pub sinks: Vec<HashMap<String, HashMap<String, String>>>,
}

fn default_interval() -> u64 {
    15
}

pub fn read_config_file(path: &str) -> anyhow::Result<Config> {
    let file_content = std::fs::read_to_string(path)?;
    serde_json::from_str(&file_content)
        .map_err(|_| anyhow::anyhow!("Invalid configuration file provided!"))
        .inspect(|config: &Config| trace!("loaded {} check definitions", config.checks.len()))
}
