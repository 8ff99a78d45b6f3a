/*
 *  Copyright 2025-2026 Colliery Software
 *
 *  Licensed under the Apache License, Version 2.0 (the "License");
 *  you may not use this file except in compliance with the License.
 *  You may obtain a copy of the License at
 *
 *      http://www.apache.org/licenses/LICENSE-2.0
 *
 *  Unless required by applicable law or agreed to in writing, software
 *  distributed under the License is distributed on an "AS IS" BASIS,
 *  WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
 *  See the License for the specific language governing permissions and
 *  limitations under the License.
 */

//! Tracklane CLI - inspect and exercise the durable client store.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};
use tracklane::TrackingConfig;

mod commands;

/// Tracklane - offline-first delivery tracking
#[derive(Parser)]
#[command(name = "tracklane")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Client store location (can also be set via TRACKLANE_DATABASE_URL)
    #[arg(long, env = "TRACKLANE_DATABASE_URL", global = true)]
    database_url: Option<String>,

    /// TOML configuration file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Inspect or edit the pending operation queue
    Queue {
        #[command(subcommand)]
        command: QueueCommands,
    },
    /// Inspect error records
    Errors {
        #[command(subcommand)]
        command: ErrorCommands,
    },
    /// Run the courier scenario against an in-process tracking service
    Simulate,
}

#[derive(Subcommand)]
enum QueueCommands {
    /// Print pending operations in processing order
    List,
    /// Drop every pending operation for one delivery
    Purge {
        /// Delivery id
        #[arg(long)]
        entity: String,
    },
}

#[derive(Subcommand)]
enum ErrorCommands {
    /// Print error records
    List {
        /// Only records in this status (pending, resolved or failed)
        #[arg(long)]
        status: Option<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"))
    };

    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(filter)
        .init();

    let config = match &cli.config {
        Some(path) => TrackingConfig::from_toml_file(path)
            .with_context(|| format!("Failed to load configuration from {}", path.display()))?,
        None => TrackingConfig::default(),
    };
    let database_url = cli
        .database_url
        .unwrap_or_else(|| config.database_url().to_string());

    match cli.command {
        Commands::Queue { command } => match command {
            QueueCommands::List => commands::queue::list(&database_url).await?,
            QueueCommands::Purge { entity } => {
                commands::queue::purge(&database_url, &entity).await?
            }
        },
        Commands::Errors { command } => match command {
            ErrorCommands::List { status } => {
                commands::errors::list(&database_url, status.as_deref()).await?
            }
        },
        Commands::Simulate => commands::simulate::run(&config).await?,
    }

    Ok(())
}
