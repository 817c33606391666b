use std::env;
use std::path::PathBuf;
use std::sync::Arc;

use axum::http::HeaderValue;
use clap::Parser;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use wagate_core::autoreply::ai::OpenAiClient;
use wagate_core::autoreply::shipping::RajaOngkirClient;
use wagate_core::config::GatewayConfig;
use wagate_core::Database;

mod context;
mod http;
mod provider;
mod ws;

use context::ServerContext;
use provider::DevTransportFactory;

#[derive(Parser, Debug, Clone)]
#[command(name = "wagate")]
#[command(author, version, about = "Multi-tenant WhatsApp messaging gateway")]
struct Args {
    /// Address the HTTP/WS server binds to.
    #[arg(long, default_value = "0.0.0.0:8080")]
    addr: String,

    /// Postgres connection URL.
    #[arg(long, env = "DATABASE_URL", default_value = "postgres://wagate@localhost:5432/wagate")]
    database_url: String,

    /// Root directory for per-session credentials.
    #[arg(long)]
    session_storage_path: Option<PathBuf>,

    /// Logging level: "info", "warn", "debug", "error", or "trace".
    #[arg(long = "log-level", short = 'L', default_value = "info",
          value_parser = ["info", "warn", "debug", "error", "trace"])]
    log_level: String,
}

fn init_tracing(level: &str) {
    let default_filter = format!("wagate={0},wagate_core={0},wagate_server={0},tower_http=warn", level);
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));
    let subscriber = tracing_subscriber::fmt().with_env_filter(filter).finish();
    tracing::subscriber::set_global_default(subscriber)
        .expect("failed to set global tracing subscriber");
}

fn env_or(key: &str, default: &str) -> String {
    env::var(key).unwrap_or_else(|_| default.to_string())
}

#[tokio::main]
async fn main() {
    let args = Args::parse();
    init_tracing(&args.log_level);
    info!(addr = %args.addr, "wagate starting");

    // Exit code 1 on fatal startup errors (unreachable database).
    let db = match Database::new(&args.database_url).await {
        Ok(db) => db,
        Err(e) => {
            error!("database unreachable: {}", e);
            std::process::exit(1);
        }
    };
    if let Err(e) = db.migrate().await {
        error!("migration failed: {}", e);
        std::process::exit(1);
    }

    let mut config = GatewayConfig::from_env();
    if let Some(path) = args.session_storage_path.clone() {
        config.session_storage_path = path;
    }

    let factory = Arc::new(DevTransportFactory::from_env());
    let shipping = Arc::new(RajaOngkirClient::new(
        &env_or("RAJAONGKIR_BASE_URL", "https://api.rajaongkir.com/starter"),
        &env_or("RAJAONGKIR_API_KEY", ""),
    ));
    let ai = Arc::new(OpenAiClient::new(
        &env_or("OPENAI_BASE_URL", "https://api.openai.com/v1"),
        &env_or("OPENAI_API_KEY", ""),
        &env_or("OPENAI_MODEL", "gpt-4o-mini"),
    ));

    let ctx = ServerContext::build(&db, config, factory, shipping, ai).await;

    match ctx.manager.restore_sessions().await {
        Ok(restored) => info!(restored, "previous sessions restored"),
        Err(e) => warn!("session restore failed: {}", e),
    }

    let cors = cors_layer(&ctx);
    let app = http::router(Arc::clone(&ctx))
        .merge(ws::router(Arc::clone(&ctx)))
        .layer(TraceLayer::new_for_http())
        .layer(cors);

    let listener = match tokio::net::TcpListener::bind(&args.addr).await {
        Ok(listener) => listener,
        Err(e) => {
            error!(addr = %args.addr, "bind failed: {}", e);
            std::process::exit(1);
        }
    };
    info!(addr = %args.addr, "listening");

    let shutdown_ctx = Arc::clone(&ctx);
    let result = axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = tokio::signal::ctrl_c().await;
            info!("shutdown signal received");
            shutdown_ctx.bus.shutdown();
            shutdown_ctx.manager.shutdown().await;
        })
        .await;

    if let Err(e) = result {
        error!("server error: {}", e);
        std::process::exit(1);
    }
    info!("wagate stopped");
}

fn cors_layer(ctx: &ServerContext) -> CorsLayer {
    if ctx.config.cors_origins.is_empty() {
        return CorsLayer::new()
            .allow_origin(Any)
            .allow_methods(Any)
            .allow_headers(Any);
    }
    let origins: Vec<HeaderValue> = ctx
        .config
        .cors_origins
        .iter()
        .filter_map(|origin| origin.parse().ok())
        .collect();
    CorsLayer::new()
        .allow_origin(origins)
        .allow_methods(Any)
        .allow_headers(Any)
}
