use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};
use sqlx::SqlitePool;
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::EnvFilter;

use marquee_server::config::ServerConfig;
use marquee_server::db::pool::{create_pool, run_migrations};
use marquee_server::db::queries::{channels, users};
use marquee_server::db::sqlite::SqliteDatabase;
use marquee_server::engine::registry::RoomRegistry;
use marquee_server::engine::services::Services;
use marquee_server::metadata::HttpMetadataResolver;
use marquee_server::web::app_state::AppState;
use marquee_server::web::rate_limit::ApiRateLimiters;
use marquee_server::web::router::build_router;

#[derive(Parser)]
#[command(name = "marquee-server", about = "Synchronized media rooms with chat")]
struct Cli {
    /// Path to the TOML config file.
    #[arg(long, default_value = "marquee.toml")]
    config: String,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Register a room and make `owner` its founder.
    Register { channel: String, owner: String },
    /// Set an account's site-wide rank (255 for site admins).
    SetGlobalRank { name: String, rank: f64 },
}

async fn run_admin_command(pool: &SqlitePool, command: Command) -> anyhow::Result<()> {
    match command {
        Command::Register { channel, owner } => {
            channels::register_channel(pool, &channel, &owner)
                .await
                .with_context(|| format!("failed to register {channel}"))?;
            info!(channel = %channel, owner = %owner, "room registered");
        }
        Command::SetGlobalRank { name, rank } => {
            users::upsert_user(pool, &name, rank)
                .await
                .with_context(|| format!("failed to set rank for {name}"))?;
            info!(name = %name, rank, "global rank updated");
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let config = ServerConfig::load(&cli.config)?;

    // Initialize database
    let pool = create_pool(&config.database.url)
        .await
        .context("failed to connect to database")?;
    run_migrations(&pool)
        .await
        .context("failed to run database migrations")?;

    if let Some(command) = cli.command {
        return run_admin_command(&pool, command).await;
    }

    let settings = config.to_settings()?;
    tokio::fs::create_dir_all(&settings.dump_dir)
        .await
        .with_context(|| format!("failed to create {}", settings.dump_dir.display()))?;

    let resolver = HttpMetadataResolver::new(config.metadata.base_url.clone(), config.metadata_timeout());
    let services = Services::new(
        Arc::new(SqliteDatabase::new(pool.clone())),
        Arc::new(resolver),
        settings,
    );
    let registry = Arc::new(RoomRegistry::new(services));

    let shutdown = CancellationToken::new();
    let autosave = registry.spawn_autosave(config.save_interval(), shutdown.clone());

    let rate_limiters = Arc::new(ApiRateLimiters::new(config.server.trust_proxy));
    let sweeper = {
        let limiters = rate_limiters.clone();
        let cancel = shutdown.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_secs(300));
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => limiters.cleanup(Duration::from_secs(600)),
                }
            }
        })
    };

    let app_state = Arc::new(AppState {
        registry: registry.clone(),
        trust_proxy: config.server.trust_proxy,
        public_url: config.server.public_url.clone(),
    });
    let app = build_router(app_state, rate_limiters);

    let web_addr = &config.server.web_address;
    info!("Marquee server starting on {}", web_addr);

    let listener = tokio::net::TcpListener::bind(web_addr)
        .await
        .with_context(|| format!("failed to bind web listener on {web_addr}"))?;

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(async {
        let _ = tokio::signal::ctrl_c().await;
        info!("shutdown requested");
    })
    .await
    .context("server error")?;

    shutdown.cancel();
    let _ = autosave.await;
    let _ = sweeper.await;
    registry.shutdown().await;
    pool.close().await;
    Ok(())
}
