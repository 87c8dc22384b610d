use std::net::SocketAddr;
use std::sync::Arc;

use tracing::info;

use matchwire::config::Config;
use matchwire::issuer::{self, IssuerState, RateLimiter};
use matchwire::signaling::SignalingServer;
use matchwire::token::TokenIssuer;

#[tokio::main]
async fn main() -> std::io::Result<()> {
    tracing_subscriber::fmt::init();

    let config = Config::from_env();

    println!("   Matchwire signaling service");
    println!(
        "   Tokens on {}:{}, signaling on {}:{}",
        config.host, config.http_port, config.host, config.signaling_port
    );
    println!("   Press Ctrl+C to stop\n");

    let tokens = Arc::new(TokenIssuer::new(&config.token_secret, config.token_ttl));

    let limiter = Arc::new(RateLimiter::new(config.quota_per_source));
    issuer::spawn_reset_ticker(limiter.clone(), config.quota_reset_interval);

    let signaling = SignalingServer::new(tokens.clone(), config.abandon_after);

    let state = IssuerState {
        tokens,
        limiter,
        matchmaker: signaling.handle(),
        max_rooms: config.max_rooms,
    };

    let http_addr = format!("{}:{}", config.host, config.http_port);
    let listener = tokio::net::TcpListener::bind(&http_addr).await?;
    info!("Token endpoint listening on {}", http_addr);

    let signaling_addr = format!("{}:{}", config.host, config.signaling_port);

    let token_server = async {
        axum::serve(
            listener,
            issuer::router(state).into_make_service_with_connect_info::<SocketAddr>(),
        )
        .await
    };

    tokio::select! {
        result = token_server => result,
        result = signaling.run(&signaling_addr) => result,
    }
}
