//! HTTP endpoint that mints admission tokens
//!
//! Issuance is the only place admission control runs: a per-source request
//! quota and a service-wide room ceiling. Already-admitted sessions are
//! never evicted because the cap was reached later.

use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::extract::{ConnectInfo, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use serde::Serialize;
use thiserror::Error;
use tower_http::cors::CorsLayer;
use tracing::{debug, error};

use crate::signaling::MatchmakerHandle;
use crate::token::TokenIssuer;

/// Per-source request counters, cleared wholesale on a fixed cadence.
///
/// The quota window and the reset cadence are independent knobs; this is a
/// coarse full-reset counter, not a sliding window.
pub struct RateLimiter {
    quota: u32,
    counts: Mutex<HashMap<IpAddr, u32>>,
}

impl RateLimiter {
    pub fn new(quota: u32) -> Self {
        Self {
            quota,
            counts: Mutex::new(HashMap::new()),
        }
    }

    /// Whether this source has used up its quota for the current interval
    pub fn over_quota(&self, source: IpAddr) -> bool {
        let counts = self.counts.lock().expect("rate limiter lock poisoned");
        counts.get(&source).copied().unwrap_or(0) >= self.quota
    }

    /// Count one granted request against the source
    pub fn record(&self, source: IpAddr) {
        let mut counts = self.counts.lock().expect("rate limiter lock poisoned");
        *counts.entry(source).or_insert(0) += 1;
    }

    /// Clear every source counter at once
    pub fn reset(&self) {
        let mut counts = self.counts.lock().expect("rate limiter lock poisoned");
        counts.clear();
    }
}

/// Periodically clears all source counters
pub fn spawn_reset_ticker(limiter: Arc<RateLimiter>, interval: Duration) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        // the first tick completes immediately
        ticker.tick().await;
        loop {
            ticker.tick().await;
            debug!("Clearing per-source token counters");
            limiter.reset();
        }
    });
}

#[derive(Debug, Error)]
pub enum IssueError {
    #[error("too many token requests")]
    QuotaExceeded,

    #[error("service is at capacity")]
    CapacityExceeded,

    #[error("internal error: {0}")]
    Internal(String),
}

#[derive(Clone)]
pub struct IssuerState {
    pub tokens: Arc<TokenIssuer>,
    pub limiter: Arc<RateLimiter>,
    pub matchmaker: MatchmakerHandle,
    pub max_rooms: usize,
}

#[derive(Debug, Serialize)]
struct TokenResponse {
    token: String,
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: String,
}

pub fn router(state: IssuerState) -> Router {
    Router::new()
        .route("/token", get(issue_token))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

async fn issue_token(
    State(state): State<IssuerState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
) -> Response {
    match issue(&state, addr.ip()).await {
        Ok(token) => Json(TokenResponse { token }).into_response(),
        Err(e @ (IssueError::QuotaExceeded | IssueError::CapacityExceeded)) => {
            debug!("Refusing token for {}: {}", addr.ip(), e);
            (
                StatusCode::TOO_MANY_REQUESTS,
                Json(ErrorBody {
                    error: e.to_string(),
                }),
            )
                .into_response()
        }
        Err(e) => {
            error!("Token issuance failed: {}", e);
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(ErrorBody {
                    error: "internal error".to_string(),
                }),
            )
                .into_response()
        }
    }
}

/// Quota first, then the room ceiling; a rejection leaves the source
/// counter untouched.
async fn issue(state: &IssuerState, source: IpAddr) -> Result<String, IssueError> {
    if state.limiter.over_quota(source) {
        return Err(IssueError::QuotaExceeded);
    }

    let rooms = state
        .matchmaker
        .room_count()
        .await
        .map_err(|e| IssueError::Internal(e.to_string()))?;
    if rooms >= state.max_rooms {
        return Err(IssueError::CapacityExceeded);
    }

    state.limiter.record(source);
    state
        .tokens
        .mint()
        .map_err(|e| IssueError::Internal(e.to_string()))
}
