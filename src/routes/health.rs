use actix_web::{get, web, HttpResponse};
use metrics_exporter_prometheus::PrometheusHandle;

#[get("/health")]
async fn health_check() -> HttpResponse {
    HttpResponse::Ok().body("OK")
}

/// Prometheus text format; 404 when no recorder was installed.
#[get("/metrics")]
async fn metrics_export(handle: Option<web::Data<PrometheusHandle>>) -> HttpResponse {
    match handle {
        Some(h) => HttpResponse::Ok()
            .content_type("text/plain; version=0.0.4")
            .body(h.render()),
        None => HttpResponse::NotFound().finish(),
    }
}

/// Root-level routes; registered via `.configure` so they never shadow `/api/*`.
pub fn health_routes(cfg: &mut web::ServiceConfig) {
    cfg.service(health_check).service(metrics_export);
}
