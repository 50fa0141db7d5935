#![forbid(unsafe_code)]

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Result, anyhow};
use clap::Parser;
use tracing::{error, info, warn};

mod bridge;
mod cli;
mod config;
mod db;
mod discord;
mod matrix;
mod space;
mod utils;
mod web;

use bridge::platform::{GroupDirectory, HistorySource, MessageSink, Platform};
use bridge::router::IdentityPatterns;
use bridge::{BridgeCore, PlatformHandles};
use cli::{Cli, CliCommand};
use config::Config;
use discord::DiscordClient;
use matrix::{MatrixAppservice, MatrixEventProcessor};
use space::HttpDataSpace;
use web::{WebServer, WebState};

const SHUTDOWN_DRAIN: Duration = Duration::from_secs(10);

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = match Config::load_from_file(&cli.config) {
        Ok(config) => config,
        Err(err) => {
            eprintln!("failed to load {}: {}", cli.config.display(), err);
            std::process::exit(1);
        }
    };
    utils::logging::init_tracing(&config.logging);

    match cli.command() {
        CliCommand::GenerateRegistration { output } => generate_registration(&config, output),
        CliCommand::Run => run(config).await,
    }
}

fn generate_registration(config: &Config, output: &std::path::Path) -> Result<()> {
    let matrix_config = config
        .matrix
        .clone()
        .ok_or_else(|| anyhow!("the `matrix` section is required to generate a registration"))?;
    let url = matrix_config
        .bridge_url
        .clone()
        .unwrap_or_else(|| format!("http://{}:{}", config.api.bind_address, config.api.port));
    let appservice = MatrixAppservice::new(matrix_config)?;
    let registration = serde_yaml::to_string(&appservice.registration_preview(&url))?;
    std::fs::write(output, registration)?;
    info!("wrote appservice registration to {}", output.display());
    Ok(())
}

async fn run(config: Config) -> Result<()> {
    info!("space bridge starting up");

    let db_manager = Arc::new(db::DatabaseManager::new(&config.database).await?);
    db_manager.migrate().await?;

    let space = Arc::new(HttpDataSpace::new(&config.space)?);

    let mut handles = PlatformHandles::default();
    let mut identities = IdentityPatterns::default();

    let discord_client = match config.discord.clone() {
        Some(discord_config) => {
            let client = Arc::new(DiscordClient::new(discord_config));
            handles.sinks.push(client.clone() as Arc<dyn MessageSink>);
            handles
                .sources
                .insert(Platform::Discord, client.clone() as Arc<dyn HistorySource>);
            identities = identities.with(Platform::Discord, discord::identity_pattern()?);
            Some(client)
        }
        None => None,
    };

    let matrix_appservice = match config.matrix.clone() {
        Some(matrix_config) => {
            let appservice = Arc::new(MatrixAppservice::new(matrix_config)?);
            handles.sinks.push(appservice.clone() as Arc<dyn MessageSink>);
            handles
                .sources
                .insert(Platform::Matrix, appservice.clone() as Arc<dyn HistorySource>);
            handles
                .directories
                .insert(Platform::Matrix, appservice.clone() as Arc<dyn GroupDirectory>);
            identities = identities.with(Platform::Matrix, appservice.identity_pattern());
            Some(appservice)
        }
        None => None,
    };
    handles.identities = identities;

    let bridge = Arc::new(BridgeCore::new(
        db_manager.clone(),
        space,
        handles,
        &config.sync,
    ));

    let matrix_processor = match &matrix_appservice {
        Some(appservice) => {
            let processor = Arc::new(MatrixEventProcessor::new(appservice.clone()));
            processor.set_bridge(bridge.clone()).await;
            if discord_client.is_none() {
                bridge.set_identity(appservice.bot_user_id());
            }
            Some(processor)
        }
        None => None,
    };

    if let Some(client) = &discord_client {
        client.set_bridge(bridge.clone()).await;
    }

    let web_server = WebServer::new(
        config.api.clone(),
        WebState {
            bridge: bridge.clone(),
            matrix: matrix_processor,
            homeserver_token: config.matrix.as_ref().map(|m| m.homeserver_token.clone()),
        },
    );
    let web_handle = tokio::spawn(async move {
        if let Err(err) = web_server.start().await {
            error!("web server error: {}", err);
        }
    });

    let core = bridge.clone();
    let bridge_handle = tokio::spawn(async move {
        if let Err(err) = core.start().await {
            error!("bridge error: {}", err);
        }
    });

    if let Some(client) = discord_client.clone() {
        tokio::spawn(async move {
            if let Err(err) = client.start().await {
                error!("discord client error: {}", err);
            }
        });
    }

    tokio::select! {
        _ = web_handle => {},
        _ = bridge_handle => {},
        _ = tokio::signal::ctrl_c() => info!("shutdown signal received"),
    }

    bridge.shutdown();
    if !bridge.drain(SHUTDOWN_DRAIN).await {
        warn!(
            "in-flight work still running after {}s, exiting anyway",
            SHUTDOWN_DRAIN.as_secs()
        );
    }
    if let Some(client) = &discord_client {
        client.stop().await?;
    }

    info!("space bridge shutting down");
    Ok(())
}
