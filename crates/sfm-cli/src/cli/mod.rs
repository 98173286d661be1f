//! CLI for the sfm fetch layer.

mod commands;

use anyhow::Result;
use clap::{Parser, Subcommand};
use sfm_core::config;
use sfm_core::ServiceConfig;
use std::path::PathBuf;

use commands::{run_batch, run_config, run_get, run_upload};

/// Top-level CLI for sfm.
#[derive(Debug, Parser)]
#[command(name = "sfm")]
#[command(about = "sfm: managed HTTP fetches with retry, admission and resumable upload", long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: CliCommand,
}

#[derive(Debug, Subcommand)]
pub enum CliCommand {
    /// Fetch one URL and print the body (or save it).
    Get {
        /// HTTP/HTTPS URL to fetch.
        url: String,

        /// Write the body to FILE instead of stdout.
        #[arg(short = 'o', long, value_name = "FILE")]
        output: Option<PathBuf>,

        /// Extra request header, `Name: value`. May be repeated.
        #[arg(short = 'H', long = "header", value_name = "HEADER")]
        headers: Vec<String>,

        /// Override the configured retry ceiling for this fetch.
        #[arg(long, value_name = "N")]
        retries: Option<u32>,
    },

    /// Fetch every URL listed in a file through one shared service.
    Batch {
        /// File with one URL per line; blank lines and `#` comments are skipped.
        path: PathBuf,

        /// Per-host concurrency ceiling (defaults to the config value).
        #[arg(long, value_name = "N")]
        per_host: Option<usize>,

        /// Global concurrency ceiling (defaults to the config value).
        #[arg(long, value_name = "N")]
        global: Option<usize>,
    },

    /// Upload a file with the resumable chunked protocol.
    Upload {
        /// Path of the file to upload.
        path: PathBuf,

        /// Negotiation endpoint.
        #[arg(long, value_name = "URL")]
        endpoint: String,

        /// Bytes per chunk (defaults to the config value).
        #[arg(long, value_name = "BYTES")]
        chunk_size: Option<u64>,

        /// Declared type of the uploaded content.
        #[arg(long, value_name = "TYPE")]
        content_type: Option<String>,
    },

    /// Print the config file path and the effective values.
    Config,
}

impl CliCommand {
    pub async fn run_from_args() -> Result<()> {
        let cli = Cli::parse();
        let cfg = config::load_or_init()?;
        tracing::debug!("loaded config: {:?}", cfg);
        let service_config = ServiceConfig::from(&cfg);

        match cli.command {
            CliCommand::Get {
                url,
                output,
                headers,
                retries,
            } => run_get(service_config, &url, output.as_deref(), &headers, retries).await?,
            CliCommand::Batch {
                path,
                per_host,
                global,
            } => run_batch(service_config, &path, per_host, global).await?,
            CliCommand::Upload {
                path,
                endpoint,
                chunk_size,
                content_type,
            } => run_upload(service_config, path, &endpoint, chunk_size, content_type).await?,
            CliCommand::Config => run_config(&cfg)?,
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests;
