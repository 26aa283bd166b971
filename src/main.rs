use anyhow::Result;
use clap::Parser;
use std::{sync::Arc, time::Duration};
use tokio::net::TcpListener;
use tracing::{info, warn};

mod api;
mod auth;
mod database;
mod error;
mod identity;
mod posts;
mod rate_limit;
mod types;

use crate::{
    api::AppState,
    auth::JwtVerifier,
    database::Database,
    identity::ClerkClient,
    posts::PostsService,
    rate_limit::{MemoryRateLimiter, RateLimitConfig, RateLimiter, UpstashRateLimiter},
};

#[derive(Parser)]
#[command(name = "chirp-backend")]
#[command(about = "Post and feed API backed by an external identity provider")]
struct Args {
    #[arg(long, env = "DATABASE_URL", default_value = "sqlite:./chirp.db?mode=rwc")]
    database_url: String,

    #[arg(long, env = "PORT", default_value = "3000")]
    port: u16,

    #[arg(long, env = "CLERK_SECRET_KEY")]
    clerk_secret_key: String,

    #[arg(long, env = "CLERK_API_URL", default_value = "https://api.clerk.com/v1")]
    clerk_api_url: String,

    /// PEM-encoded public key used to verify session tokens
    #[arg(long, env = "CLERK_JWT_KEY")]
    clerk_jwt_key: String,

    /// Origins allowed in the session token `azp` claim
    #[arg(long, env = "AUTHORIZED_PARTIES", value_delimiter = ',')]
    authorized_parties: Vec<String>,

    #[arg(long, env = "UPSTASH_REDIS_REST_URL")]
    upstash_redis_rest_url: Option<String>,

    #[arg(long, env = "UPSTASH_REDIS_REST_TOKEN")]
    upstash_redis_rest_token: Option<String>,

    #[arg(long, env = "RATE_LIMIT_MAX", default_value = "3")]
    rate_limit_max: u32,

    #[arg(long, env = "RATE_LIMIT_WINDOW_SECS", default_value = "60")]
    rate_limit_window_secs: u64,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt::init();
    dotenvy::dotenv().ok();

    let args = Args::parse();

    // Initialize database
    let db = Arc::new(Database::new(&args.database_url).await?);
    db.migrate().await?;

    let identity = Arc::new(ClerkClient::new(
        &args.clerk_api_url,
        args.clerk_secret_key.clone(),
    )?);
    let verifier = Arc::new(JwtVerifier::from_rsa_pem(
        &args.clerk_jwt_key,
        args.authorized_parties.clone(),
    )?);

    let rate_limit_config = RateLimitConfig {
        max_requests: args.rate_limit_max,
        window: Duration::from_secs(args.rate_limit_window_secs),
        ..RateLimitConfig::default()
    };
    let rate_limiter: Arc<dyn RateLimiter> =
        match (args.upstash_redis_rest_url, args.upstash_redis_rest_token) {
            (Some(url), Some(token)) => {
                info!("Using Upstash rate limiter at {}", url);
                Arc::new(UpstashRateLimiter::new(url, token, rate_limit_config))
            }
            _ => {
                warn!("UPSTASH_REDIS_REST_URL/TOKEN not set, using in-process rate limiter");
                Arc::new(MemoryRateLimiter::new(rate_limit_config))
            }
        };

    let app_state = AppState {
        posts: Arc::new(PostsService::new(Arc::clone(&db), identity, rate_limiter)),
        verifier,
    };

    let app = api::router(app_state);

    let listener = TcpListener::bind(format!("0.0.0.0:{}", args.port)).await?;
    info!("Chirp API listening on port {}", args.port);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("Shutting down, closing database pool");
    db.close().await;
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("Failed to listen for Ctrl-C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                warn!("Failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
