use std::sync::Arc;

use bson::{Bson, Document};
use docdb_planner::{Command, EngineConfig, MemoryCatalog, Planner};
use tracing::debug;

use crate::error::CliError;

/// Planner settings with `catalog` installed as the hook table.
pub fn engine_config(json: Option<&str>, catalog: MemoryCatalog) -> Result<EngineConfig, CliError> {
    let config: EngineConfig = match json {
        Some(json) => serde_json::from_str(json).map_err(|source| CliError::Json {
            what: "engine config",
            source,
        })?,
        None => EngineConfig::default(),
    };
    config.hooks.swap(Arc::new(catalog));
    Ok(config)
}

/// Plan one command. Planner errors come back as `{ok: 0, ...}` replies.
pub fn explain(
    command_json: &str,
    database: Option<&str>,
    config: &EngineConfig,
) -> Result<Document, CliError> {
    let spec: Document = serde_json::from_str(command_json).map_err(|source| CliError::Json {
        what: "command",
        source,
    })?;
    let planned = Command::parse(&spec, database).and_then(|command| {
        debug!(command = command.name(), "planning");
        Planner::new(config).plan(&command)
    });
    Ok(match planned {
        Ok(plan) => {
            let mut reply = plan.to_document();
            reply.insert("ok", Bson::Double(1.0));
            reply
        }
        Err(err) => err.to_document(),
    })
}

pub fn render(reply: &Document) -> Result<String, CliError> {
    serde_json::to_string_pretty(reply).map_err(|source| CliError::Json {
        what: "reply",
        source,
    })
}
