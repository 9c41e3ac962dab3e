use std::io::Read;
use std::process;

use docdb_cli::catalog::load_catalog;
use docdb_cli::error::CliError;
use docdb_cli::explain::{engine_config, explain, render};
use docdb_planner::MemoryCatalog;

/// `docdb-explain [COMMAND_FILE]`
///
/// Reads a JSON command from the file (or stdin when absent or `-`) and
/// prints its plan. `DOCDB_CATALOG` and `DOCDB_ENGINE_CONFIG` name JSON
/// files holding the catalog and planner settings; `DOCDB_DATABASE`
/// overrides the command's `$db`.
fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    if let Err(e) = run() {
        eprintln!("docdb-explain: {e}");
        process::exit(1);
    }
}

fn run() -> Result<(), CliError> {
    let command = match std::env::args().nth(1).filter(|arg| arg != "-") {
        Some(path) => read_file(&path)?,
        None => {
            let mut buf = String::new();
            std::io::stdin()
                .read_to_string(&mut buf)
                .map_err(|source| CliError::Read {
                    path: "stdin".into(),
                    source,
                })?;
            buf
        }
    };

    let catalog = match std::env::var("DOCDB_CATALOG") {
        Ok(path) => load_catalog(&read_file(&path)?)?,
        Err(_) => MemoryCatalog::default(),
    };
    let config_json = std::env::var("DOCDB_ENGINE_CONFIG")
        .ok()
        .map(|path| read_file(&path))
        .transpose()?;
    let config = engine_config(config_json.as_deref(), catalog)?;
    let database = std::env::var("DOCDB_DATABASE").ok();

    let reply = explain(&command, database.as_deref(), &config)?;
    tracing::info!(ok = reply.get_f64("ok").unwrap_or(0.0), "planned");
    println!("{}", render(&reply)?);
    Ok(())
}

fn read_file(path: &str) -> Result<String, CliError> {
    std::fs::read_to_string(path).map_err(|source| CliError::Read {
        path: path.to_string(),
        source,
    })
}
