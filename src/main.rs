use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use sqlx::postgres::PgPoolOptions;
use tracing::info;

mod aggregate;
mod config;
mod db;
mod error;
mod http;
mod loader;
mod models;
mod pipeline;
mod render;
mod storage;

#[derive(Parser)]
#[command(name = "volunteer-hours-analytics")]
#[command(about = "Volunteer hours charts, generated on request and saved to storage", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Serve generate_and_save_plots over HTTP
    Serve {
        #[arg(long, env = "PORT", default_value_t = 8080)]
        port: u16,
        #[command(flatten)]
        pipeline: config::PipelineArgs,
    },
    /// Run one invocation and print the response body
    Run {
        /// JSON request body to use instead of an empty one
        #[arg(long)]
        request: Option<PathBuf>,
        #[command(flatten)]
        pipeline: config::PipelineArgs,
    },
    /// Create or upgrade the Postgres schema
    InitDb {
        #[arg(long, env = "DATABASE_URL", hide_env_values = true)]
        database_url: String,
    },
    /// Load sample activity rows into Postgres
    Seed {
        #[arg(long, env = "DATABASE_URL", hide_env_values = true)]
        database_url: String,
    },
    /// Import a sheet export into Postgres
    Import {
        #[arg(long)]
        csv: PathBuf,
        #[arg(long, env = "DATABASE_URL", hide_env_values = true)]
        database_url: String,
    },
}

async fn connect(database_url: &str) -> anyhow::Result<sqlx::PgPool> {
    PgPoolOptions::new()
        .max_connections(5)
        .connect(database_url)
        .await
        .context("failed to connect to Postgres")
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Serve { port, pipeline: args } => {
            let state = Arc::new(http::AppState {
                settings: args.settings()?,
                writer: args.writer(),
            });
            info!(
                source = %state.settings.source.describe(),
                destination = %state.writer.describe(),
                "starting function server"
            );
            http::serve(state, SocketAddr::from(([0, 0, 0, 0], port))).await?;
        }
        Commands::Run { request, pipeline: args } => {
            let body = match request {
                Some(path) => std::fs::read(&path)
                    .with_context(|| format!("cannot read request body {}", path.display()))?,
                None => Vec::new(),
            };
            let request = http::parse_request(&body)?;
            let settings = args.settings()?;
            let writer = args.writer();

            let outcome = pipeline::invoke(request, &settings, writer.as_ref()).await;
            let (code, response) = http::build_response(outcome);
            println!("{}", serde_json::to_string_pretty(&response)?);
            anyhow::ensure!(code.is_success(), "invocation finished with {code}");
        }
        Commands::InitDb { database_url } => {
            db::init_db(&connect(&database_url).await?).await?;
            println!("Schema ready.");
        }
        Commands::Seed { database_url } => {
            db::seed(&connect(&database_url).await?).await?;
            println!("Seed data inserted.");
        }
        Commands::Import { csv, database_url } => {
            let inserted = db::import_csv(&connect(&database_url).await?, &csv).await?;
            println!("Inserted {inserted} activity rows from {}.", csv.display());
        }
    }

    Ok(())
}
