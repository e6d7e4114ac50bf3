mod buffer;
mod bus;
mod config;
mod dedup;
mod destination;
mod mqtt;
mod outcome;
mod pool;
mod stats;
mod supervisor;
mod task;
mod telemetry;
mod validator;
mod warehouse;

use anyhow::{anyhow, Result};
use std::sync::Arc;
use tracing_subscriber::fmt::writer::BoxMakeWriter;

use crate::config::{Config, LogConfig};
use crate::supervisor::Shutdown;

fn init_tracing(cfg: &LogConfig) -> Result<()> {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&cfg.level));

    let writer = match cfg.output.as_str() {
        "stdout" => BoxMakeWriter::new(std::io::stdout),
        "stderr" => BoxMakeWriter::new(std::io::stderr),
        path => {
            let file = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)?;
            BoxMakeWriter::new(Arc::new(file))
        }
    };

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_writer(writer);

    let result = if cfg.format == "json" {
        builder.json().try_init()
    } else {
        builder.try_init()
    };
    result.map_err(|err| anyhow!(err.to_string()))
}

async fn run() -> Result<Shutdown> {
    let cfg = Config::load()?;
    init_tracing(&cfg.log)?;
    supervisor::run(cfg).await
}

#[tokio::main]
async fn main() {
    let result = run().await;
    if let Err(err) = &result {
        eprintln!("{err:#}");
    }
    std::process::exit(supervisor::exit_code(&result));
}
