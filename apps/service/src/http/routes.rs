use actix_web::http::header::ContentType;
use actix_web::web::{Data, ServiceConfig};
use actix_web::{HttpResponse, Responder, get};
use prometheus::TEXT_FORMAT;
use tracing::error;

use super::AppState;
use crate::monitoring::checker::PING_RESPONSE;

pub fn routes(cfg: &mut ServiceConfig) {
    cfg.service(health_route)
        .service(ping_route)
        .service(download_route)
        .service(metrics_route);
}

/// Health check route
/// This route returns no content, the response status is enough.
#[get("/")]
pub async fn health_route() -> impl Responder {
    HttpResponse::Ok()
}

#[get("/ping")]
pub async fn ping_route() -> impl Responder {
    HttpResponse::Ok().content_type(ContentType::plaintext()).body(PING_RESPONSE)
}

#[get("/download")]
pub async fn download_route(state: Data<AppState>) -> impl Responder {
    HttpResponse::Ok().content_type(ContentType::octet_stream()).body(state.payload.clone())
}

#[get("/metrics")]
pub async fn metrics_route(state: Data<AppState>) -> HttpResponse {
    match state.aggregator.encode_text() {
        Ok(text) => HttpResponse::Ok().content_type(TEXT_FORMAT).body(text),
        Err(e) => {
            error!("Failed to encode metrics: {}", e);
            HttpResponse::InternalServerError().finish()
        }
    }
}
