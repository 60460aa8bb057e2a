use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info};

mod assistant;
mod cache;
mod config;
mod db;
mod pipeline;
mod session;
mod util;
mod voice;
mod web;

use crate::assistant::AssistantManager;
use crate::cache::CachedAssistant;
use crate::config::{AppConfig, CliArgs};
use crate::db::connector::DbConnector;
use crate::util::logging::init_tracing;
use crate::voice::VoiceTranscriber;
use crate::web::state::AppState;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize logging
    init_tracing();

    // Parse command line arguments
    let args = CliArgs::parse();

    // Load configuration
    let config = match AppConfig::new(&args) {
        Ok(config) => config,
        Err(e) => {
            error!("Failed to load configuration: {}", e);
            return Err(e.into());
        }
    };

    // Ensure data directory exists
    let data_dir = PathBuf::from(&config.data_dir);
    if !data_dir.exists() {
        info!("Creating data directory: {}", config.data_dir);
        std::fs::create_dir_all(&data_dir)?;
    }

    info!("Initializing database connector");
    let connector = Arc::new(DbConnector::new(
        data_dir.clone(),
        config.database.default_url.clone(),
        config.database.pool_size as u32,
    ));

    // Bind the default dataset up front so the first question does not pay
    // for the download; an upload can still bind later if this fails
    if let Err(e) = connector.bind_default().await {
        error!("Failed to bind default database: {}", e);
    }

    // Initialize the model service
    info!(
        "Initializing model service with backend: {}",
        config.assistant.backend
    );
    let manager = AssistantManager::new(&config.assistant)?;
    let assistant = CachedAssistant::new(manager);

    // Voice input is optional; it needs a transcription service
    let transcriber = match config.voice.api_url {
        Some(_) => Some(VoiceTranscriber::new(&config.voice)?),
        None => {
            info!("Voice input disabled: no transcription API configured");
            None
        }
    };

    // Create application state
    let app_state = Arc::new(AppState::new(
        config.clone(),
        connector,
        assistant,
        transcriber,
    ));

    // Start the web server
    info!(
        "Starting TextQL server on {}:{}",
        config.web.host, config.web.port
    );
    match web::run_server(config.web, app_state).await {
        Ok(_) => info!("Server stopped gracefully"),
        Err(e) => {
            error!("Server error: {}", e);
            return Err(Box::new(std::io::Error::other(e.to_string())) as Box<dyn std::error::Error>);
        }
    }

    Ok(())
}
