use std::path::PathBuf;

use clap::{Parser, Subcommand};

/// Conduit model gateway
#[derive(Debug, Parser)]
#[command(name = "conduit", about = "One chat, model and embedding API over many LLM providers")]
pub struct Args {
    /// Path to configuration file
    #[arg(short, long, default_value = "conduit.toml", env = "CONDUIT_CONFIG")]
    pub config: PathBuf,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Send one chat message and print the reply
    Chat {
        /// Provider table name from the config file
        provider: String,

        /// User message
        prompt: String,

        /// Model id; defaults to the provider's default model
        #[arg(short, long, default_value = "")]
        model: String,

        /// Optional system prompt
        #[arg(short, long)]
        system: Option<String>,

        /// Wait for the full response instead of streaming
        #[arg(long)]
        no_stream: bool,

        /// Print canonical events as JSON lines
        #[arg(long)]
        json: bool,

        /// Per-call deadline (e.g. `30s`), overriding the provider timeout
        #[arg(long, value_parser = duration)]
        timeout: Option<std::time::Duration>,
    },
    /// List the models a provider offers
    Models {
        /// Provider table name from the config file
        provider: String,
    },
    /// List registered providers and their capabilities
    Providers,
}

fn duration(raw: &str) -> Result<std::time::Duration, String> {
    duration_str::parse(raw)
}
