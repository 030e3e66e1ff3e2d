pub mod config;
pub mod db {
    pub mod models;
    pub mod queries;
    pub mod redis;
}
pub mod middleware {
    pub mod metrics;
}
pub mod routes {
    pub mod health;
    pub mod scan;
}
pub mod services {
    pub mod analysis;
    pub mod chunked;
    pub mod circuit_breaker;
    pub mod health;
    pub mod market_data;
    pub mod retry;
    pub mod scan_bus;
    pub mod scanner;
    pub mod scheduler;
    pub mod subscribers;
}

pub mod utils;
