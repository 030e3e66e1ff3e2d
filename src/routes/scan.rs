// src/routes/scan.rs
use std::sync::Arc;

use actix_web::{get, post, web, HttpResponse, Responder, Scope};
use serde::Serialize;
use serde_json::Value;

use crate::{
    db::redis::{snapshot_key, RedisPool},
    services::{
        circuit_breaker::BreakerState,
        scanner::{CycleOutcome, Scanner},
        subscribers::SubscriberRegistry,
    },
    utils::types::ApiResponse,
};

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ScanStatus {
    pub service_available: bool,
    pub breaker_state: BreakerState,
    pub subscribers: usize,
    pub last_outcome: Option<CycleOutcome>,
}

/// GET /api/scan/status
#[get("/status")]
async fn status(
    scanner: web::Data<Arc<Scanner>>,
    registry: web::Data<Arc<SubscriberRegistry>>,
) -> impl Responder {
    HttpResponse::Ok().json(ApiResponse::ok(ScanStatus {
        service_available: scanner.health().is_available(),
        breaker_state: scanner.breaker().state(),
        subscribers: registry.len(),
        last_outcome: scanner.last_outcome(),
    }))
}

/// POST /api/scan/trigger: same as a watchlist change; runs in the background.
#[post("/trigger")]
async fn trigger(scanner: web::Data<Arc<Scanner>>) -> impl Responder {
    let scanner = Arc::clone(scanner.get_ref());
    actix_web::rt::spawn(async move {
        scanner.trigger().await;
    });
    HttpResponse::Accepted().json(ApiResponse::ok("scan requested"))
}

/// GET /api/scan/latest: stock list of the last completed cycle; cleared when a cycle aborts.
#[get("/latest")]
async fn latest(redis: Option<web::Data<RedisPool>>) -> impl Responder {
    let Some(redis) = redis else {
        return HttpResponse::ServiceUnavailable().json(ApiResponse::<()>::err("snapshot cache not configured"));
    };
    match redis.get_json::<_, Value>(snapshot_key("stocks_update")).await {
        Ok(Some(stocks)) => HttpResponse::Ok().json(ApiResponse::ok(stocks)),
        Ok(None) => HttpResponse::NotFound()
            .json(ApiResponse::<()>::err("no current scan results (none yet, or the last cycle aborted)")),
        Err(e) => {
            log::error!("latest: cache error: {e}");
            HttpResponse::InternalServerError().json(ApiResponse::<()>::err("cache error"))
        }
    }
}

pub fn scan_scope() -> Scope {
    web::scope("/api/scan")
        .service(status)
        .service(trigger)
        .service(latest)
}
