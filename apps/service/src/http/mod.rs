//! HTTP surface: the peer side of both probes, plus health and metrics exposition.

mod routes;

use std::net::SocketAddr;
use std::sync::Arc;

use actix_web::web::{Bytes, Data};
use actix_web::{App, HttpServer};
use tracing::info;

use crate::metrics::MetricsAggregator;

pub use routes::routes;

/// Shared state behind every route
pub struct AppState {
    pub aggregator: Arc<MetricsAggregator>,
    /// Body served by `/download`, allocated once
    pub payload: Bytes,
}

impl AppState {
    pub fn new(aggregator: Arc<MetricsAggregator>, payload_bytes: usize) -> Self {
        Self { aggregator, payload: Bytes::from(vec![0u8; payload_bytes]) }
    }
}

/// Serve until the process receives SIGINT or SIGTERM
pub async fn run_server(addr: SocketAddr, state: AppState) -> std::io::Result<()> {
    let state = Data::new(state);
    info!(%addr, payload_bytes = state.payload.len(), "Starting HTTP server");

    HttpServer::new(move || App::new().app_data(state.clone()).configure(routes))
        .bind(addr)?
        .run()
        .await
}
