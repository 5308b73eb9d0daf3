use std::sync::Arc;

use audit_core::settings::EnvSettings;
use audit_core::AuditConfig;
use clap::Parser;
use tokio::sync::broadcast;
use tracing_subscriber::{fmt, EnvFilter};

use audit_server::http::{self, HttpState};
use audit_server::subsystems::{cleanup, relay::AiRelay};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    #[arg(short, long, default_value = "audit.toml")]
    config: String,

    #[arg(long)]
    health: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env file if present (dev convenience — production uses real env vars)
    dotenvy::dotenv().ok();

    let args = Args::parse();

    // Init logging
    fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive(tracing::Level::INFO.into()))
        .init();

    // Load config
    let config = match AuditConfig::load(&args.config) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Failed to load config from {}: {}", args.config, e);
            std::process::exit(1);
        }
    };

    // Connect to DB
    let pool = match audit_core::db::create_pool(&config.database).await {
        Ok(p) => p,
        Err(e) => {
            eprintln!("Failed to connect to database: {}", e);
            std::process::exit(1);
        }
    };

    if args.health {
        match audit_core::db::health_check(&pool).await {
            Ok(v) => println!("✅ PostgreSQL connected: {}", v),
            Err(e) => {
                println!("❌ PostgreSQL connection failed: {}", e);
                std::process::exit(1);
            }
        }
        println!("✅ audit DB health check passed");
        return Ok(());
    }

    sqlx::migrate!("./migrations").run(&pool).await?;

    let (tx, _rx) = broadcast::channel(1);
    let shutdown_tx = tx.clone();

    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_err() {
            tracing::error!("Failed to listen for Ctrl+C");
            return;
        }
        tracing::info!("Shutdown signal received");
        let _ = shutdown_tx.send(());
    });

    // Spawn the expiry sweep loop
    let cleanup_pool = pool.clone();
    let cleanup_config = config.cleanup.clone();
    let cleanup_shutdown = tx.subscribe();
    tokio::spawn(async move {
        cleanup::run_cleanup_loop(cleanup_pool, cleanup_config, cleanup_shutdown).await;
    });

    let relay = AiRelay::from_config(&config.ai)?;
    let state = Arc::new(HttpState {
        pool,
        config,
        settings: Arc::new(EnvSettings),
        relay: Arc::new(relay),
    });

    http::start_http_server(state, tx.subscribe()).await?;

    Ok(())
}
