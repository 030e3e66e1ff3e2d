// tests/routes.rs
mod common;

use std::sync::Arc;

use actix_web::{test, web, App};
use serde_json::Value;

use common::*;
use scanraptor_backend::{
    middleware::metrics::Metrics,
    routes::{health::health_routes, scan::scan_scope},
    services::subscribers::SubscriberRegistry,
};

macro_rules! app {
    ($h:expr, $registry:expr) => {
        test::init_service(
            App::new()
                .wrap(Metrics)
                .app_data(web::Data::new(Arc::clone(&$h.scanner)))
                .app_data(web::Data::new(Arc::clone(&$registry)))
                .service(scan_scope())
                .configure(health_routes),
        )
        .await
    };
}

fn idle_harness() -> Harness {
    harness(
        MockMarket::with(&[("A", 1.0)]),
        MockAnalysis { healthy: true, ..MockAnalysis::default() },
        MockStore::default(),
        test_config(&["A"]),
    )
}

#[actix_rt::test]
async fn health_and_api_routes_coexist() {
    let h = idle_harness();
    let registry = Arc::new(SubscriberRegistry::new());
    let app = app!(h, registry);

    let req = test::TestRequest::get().uri("/health").to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), 200);
    assert_eq!(test::read_body(resp).await, web::Bytes::from_static(b"OK"));

    let req = test::TestRequest::get().uri("/api/scan/status").to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), 200);
}

#[actix_rt::test]
async fn status_reports_gate_breaker_and_subscribers() {
    let h = idle_harness();
    let registry = Arc::new(SubscriberRegistry::new());
    registry.register("127.0.0.1:5555".parse().unwrap());
    let app = app!(h, registry);

    let req = test::TestRequest::get().uri("/api/scan/status").to_request();
    let body: Value = test::call_and_read_body_json(&app, req).await;
    assert_eq!(body["success"], true);
    assert_eq!(body["data"]["serviceAvailable"], false);
    assert_eq!(body["data"]["breakerState"], "CLOSED");
    assert_eq!(body["data"]["subscribers"], 1);
    assert_eq!(body["data"]["lastOutcome"], Value::Null);

    h.scanner.health().set_available(true);
    h.scanner.trigger().await;

    let req = test::TestRequest::get().uri("/api/scan/status").to_request();
    let body: Value = test::call_and_read_body_json(&app, req).await;
    assert_eq!(body["data"]["serviceAvailable"], true);
    assert_eq!(body["data"]["lastOutcome"]["outcome"], "completed");
    assert_eq!(body["data"]["lastOutcome"]["analyzed"], 1);
}

#[actix_rt::test]
async fn trigger_is_accepted() {
    let h = idle_harness();
    let registry = Arc::new(SubscriberRegistry::new());
    let app = app!(h, registry);

    let req = test::TestRequest::post().uri("/api/scan/trigger").to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), 202);
    let body: Value = test::read_body_json(resp).await;
    assert_eq!(body["data"], "scan requested");
}

#[actix_rt::test]
async fn latest_without_cache_is_unavailable() {
    let h = idle_harness();
    let registry = Arc::new(SubscriberRegistry::new());
    let app = app!(h, registry);

    let req = test::TestRequest::get().uri("/api/scan/latest").to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), 503);
}

#[actix_rt::test]
async fn metrics_without_recorder_is_not_found() {
    let h = idle_harness();
    let registry = Arc::new(SubscriberRegistry::new());
    let app = app!(h, registry);

    let req = test::TestRequest::get().uri("/metrics").to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), 404);
}
