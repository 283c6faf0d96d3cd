mod routes;
mod state;

use std::path::PathBuf;

use anyhow::{Context, Result};
use axum::Router;
use chrono::Utc;
use clap::{Parser, Subcommand};
use slotbook_core::settings::{LogFormat, LoggingSettings, Settings};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::info;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

use crate::state::AppState;

#[derive(Parser)]
#[command(name = "slotbook")]
#[command(about = "Appointment bookings kept in sync with your calendar and payment provider")]
struct Cli {
    /// Config file (defaults to ~/.config/slotbook/config.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the HTTP API
    Serve {
        /// Address to listen on, overriding server.listen
        #[arg(long)]
        listen: Option<String>,
    },
    /// Materialize the next occurrence of every active series
    ExtendSeries,
    /// Send payment requests for bills that have come due
    SendBills,
    /// Mark bookings that have ended as completed
    Complete,
}

fn init_tracing(logging: &LoggingSettings) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("{},tower_http=info", logging.level)));

    match logging.format {
        LogFormat::Json => tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().json())
            .init(),
        LogFormat::Pretty => tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer())
            .init(),
    }
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .merge(routes::bookings::router())
        .merge(routes::series::router())
        .merge(routes::cron::router())
        .with_state(state)
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let settings = Settings::load(cli.config.as_deref())?;
    init_tracing(&settings.logging);

    let state = AppState::from_settings(&settings).await?;

    match cli.command {
        Commands::Serve { listen } => {
            let addr = listen.unwrap_or_else(|| settings.server.listen.clone());

            let cors = CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any);
            let router = app(state).layer(cors).layer(TraceLayer::new_for_http());

            let listener = tokio::net::TcpListener::bind(&addr)
                .await
                .with_context(|| format!("Could not listen on {}", addr))?;
            info!("slotbook listening on http://{}", addr);
            axum::serve(listener, router).await?;
        }
        Commands::ExtendSeries => {
            let report = state.scheduler().run_once().await?;
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
        Commands::SendBills => {
            let report = state.orchestrator().send_due_bills(Utc::now()).await?;
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
        Commands::Complete => {
            let report = state.orchestrator().complete_elapsed(Utc::now()).await?;
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
    }

    Ok(())
}
