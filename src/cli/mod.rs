//! CLI for the cache gateway

pub mod serve;

use clap::{Parser, Subcommand};

/// LLM Cache Gateway - semantic caching and coordination for LLM providers
#[derive(Parser)]
#[command(name = "llm-cache-gateway")]
#[command(version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand)]
pub enum Command {
    /// Run the gateway server
    Serve,
}
