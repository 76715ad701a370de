use std::{net::SocketAddr, path::PathBuf};

use clap::Parser;

/// Prism: a model-agnostic LLM gateway.
#[derive(Debug, Parser)]
#[command(name = "prism", version, about)]
pub struct Args {
    /// Path to the TOML configuration file.
    #[arg(short, long, default_value = "prism.toml")]
    pub config: PathBuf,

    /// Socket address to listen on. Overrides the configuration file.
    #[arg(short, long)]
    pub listen: Option<SocketAddr>,

    /// Log filter, e.g. "info" or "llm=debug,info".
    #[arg(long, default_value = "info")]
    pub log: String,
}
