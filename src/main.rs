use std::sync::Arc;

use actix_web::{middleware::Logger, web, App, HttpServer};
use metrics_exporter_prometheus::PrometheusBuilder;
use sqlx::postgres::PgPoolOptions;
use tokio::net::TcpListener;
use tracing_subscriber::EnvFilter;

use scanraptor_backend::{
    config::settings::Settings,
    db::{queries::PgStore, redis::{self as cache, RedisPool}},
    middleware::metrics::Metrics,
    routes::{health::health_routes, scan::scan_scope},
    services::{
        analysis::HttpAnalysisClient,
        market_data::HttpMarketData,
        scan_bus::ScanBus,
        scanner::{ScanDeps, Scanner},
        scheduler,
        subscribers::{self, SubscriberRegistry},
    },
};

fn init_logging(settings: &Settings) {
    if settings.json_logs() {
        // also picks up `log` records through tracing-log
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
            .init();
    } else {
        env_logger::Builder::from_env(
            env_logger::Env::default().default_filter_or("info"),
        )
            .init();
    }
}

#[actix_web::main]
async fn main() -> anyhow::Result<()> {
    let settings = Settings::new().unwrap_or_else(|e| {
        eprintln!("Failed to load settings: {e}");
        std::process::exit(1);
    });
    init_logging(&settings);
    log::info!("Starting ScanRaptor backend…");

    let prometheus = PrometheusBuilder::new().install_recorder()?;

    let pg_pool = PgPoolOptions::new()
        .max_connections(5)
        .connect(&settings.database_url)
        .await?;
    let redis_pool = RedisPool::new(&settings.redis_url).await?;

    // --- pipeline -----------------------------------------------------------
    let bus = ScanBus::new();
    let market = Arc::new(HttpMarketData::new(&settings.quote_provider_url));
    let deps = ScanDeps {
        quotes: market.clone(),
        history: market,
        analysis: Arc::new(HttpAnalysisClient::new(&settings.analysis_service_url)),
        store: Arc::new(PgStore::new(pg_pool)),
    };
    let scanner = Arc::new(Scanner::new(deps, settings.scan.clone(), bus.clone()));
    let registry = Arc::new(SubscriberRegistry::new());

    // --- background tasks ---------------------------------------------------
    cache::spawn_snapshot_writer(&bus, redis_pool.clone(), settings.scan.scan_interval * 2);
    scheduler::spawn_breaker_bridge(scanner.clone());
    // the first scan must see a real availability flag
    scanner.health().check_once().await;
    scheduler::spawn_health_loop(scanner.clone());
    scheduler::spawn_scan_loop(scanner.clone());
    cache::spawn_watchlist_listener(redis_pool.clone(), scanner.clone());

    let ws_listener = TcpListener::bind(("0.0.0.0", settings.ws_port)).await?;
    {
        let scanner = scanner.clone();
        let registry = registry.clone();
        tokio::spawn(async move {
            if let Err(e) = subscribers::serve(ws_listener, scanner, registry).await {
                log::error!("subscriber socket: {e:?}");
            }
        });
    }

    let port = settings.server_port;
    HttpServer::new(move || {
        App::new()
            .wrap(Logger::default())
            .wrap(Metrics)
            .app_data(web::Data::new(scanner.clone()))
            .app_data(web::Data::new(registry.clone()))
            .app_data(web::Data::new(redis_pool.clone()))
            .app_data(web::Data::new(prometheus.clone()))
            .service(scan_scope())
            .configure(health_routes)
    })
        .bind(("0.0.0.0", port))?
        .run()
        .await?;

    Ok(())
}
