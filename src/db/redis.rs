//  src/db/redis.rs

use std::{sync::Arc, time::Duration, time::Instant};

use async_trait::async_trait;
use futures_util::StreamExt;
use redis::{aio::ConnectionManager, AsyncCommands, Client, RedisError, ToRedisArgs};
use serde::{de::DeserializeOwned, Serialize};
use serde_json::Value;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;

use crate::services::scan_bus::{ScanBus, ScanEvent, ScanPhase};
use crate::services::scanner::Scanner;
use crate::utils::errors::CacheError;

/// Key namespace for cached scan payloads: `scan:<topic>`.
pub const SNAPSHOT_PREFIX: &str = "scan";
/// Publishing anything on this channel asks for a fresh scan.
pub const WATCHLIST_CHANNEL: &str = "watchlist:changed";
/// Topics whose payloads are kept under [`SNAPSHOT_PREFIX`].
pub const CACHED_TOPICS: [&str; 4] = ["stocks_update", "recommendations", "strategy_matches", "fast_accumulators"];

/// Thin, cheap-to-clone handle.
#[derive(Clone)]
pub struct RedisPool {
    client: Client,
    manager: Arc<ConnectionManager>,
}

impl RedisPool {
    /// Build once at start-up and share via `.app_data()` in Actix.
    pub async fn new(url: &str) -> Result<Self, RedisError> {
        let client = Client::open(url)?;
        let manager = client.get_connection_manager().await?;
        Ok(Self {
            client,
            manager: Arc::new(manager),
        })
    }

    fn conn(&self) -> ConnectionManager {
        self.manager.as_ref().clone()
    }

    // ─── Helpers ──────────────────────────────────────────────────────────────
    pub async fn set_json<K, T>(&self, key: K, value: &T, ttl_secs: u64) -> Result<(), CacheError>
    where
        K: ToRedisArgs + Send + Sync,
        T: Serialize,
    {
        let mut con = self.conn();
        let payload = serde_json::to_string(value)?;

        let started = Instant::now();
        if ttl_secs == 0 {
            redis::cmd("SET").arg(key).arg(payload).query_async::<_, ()>(&mut con).await?;
        } else {
            redis::cmd("SET")
                .arg(key)
                .arg(payload)
                .arg("EX")
                .arg(ttl_secs)
                .query_async::<_, ()>(&mut con)
                .await?;
        }
        log::debug!("redis SET took {:?}", started.elapsed());
        Ok(())
    }

    pub async fn get_json<K, T>(&self, key: K) -> Result<Option<T>, CacheError>
    where
        K: ToRedisArgs + Send + Sync,
        T: DeserializeOwned,
    {
        let mut con = self.conn();
        let started = Instant::now();
        let raw: Option<String> = con.get(key).await?;
        log::debug!("redis GET took {:?}", started.elapsed());

        Ok(match raw {
            Some(s) => Some(serde_json::from_str(&s)?),
            None => None,
        })
    }
}

pub fn snapshot_key(topic: &str) -> String {
    format!("{SNAPSHOT_PREFIX}:{topic}")
}

/// Where the snapshot writer puts the latest scan payloads.
#[async_trait]
pub trait SnapshotStore: Send + Sync {
    async fn put_snapshot(&self, topic: &'static str, payload: &Value, ttl_secs: u64) -> Result<(), CacheError>;
    /// Forget every cached topic.
    async fn clear_snapshots(&self) -> Result<(), CacheError>;
}

#[async_trait]
impl SnapshotStore for RedisPool {
    async fn put_snapshot(&self, topic: &'static str, payload: &Value, ttl_secs: u64) -> Result<(), CacheError> {
        self.set_json(snapshot_key(topic), payload, ttl_secs).await
    }

    async fn clear_snapshots(&self) -> Result<(), CacheError> {
        let keys: Vec<String> = CACHED_TOPICS.iter().map(|t| snapshot_key(t)).collect();
        let mut con = self.conn();
        redis::cmd("DEL").arg(keys).query_async::<_, ()>(&mut con).await?;
        Ok(())
    }
}

#[derive(Debug, PartialEq)]
enum SnapshotAction {
    Write,
    Clear,
    Skip,
}

/// Data events are cached; an aborted cycle wipes the cache so readers never get
/// a previous cycle's results passed off as current.
fn snapshot_action(event: &ScanEvent) -> SnapshotAction {
    match event {
        ScanEvent::StocksUpdate(_)
        | ScanEvent::Recommendations { .. }
        | ScanEvent::StrategyMatches { .. }
        | ScanEvent::FastAccumulators(_) => SnapshotAction::Write,
        ScanEvent::ScanStatus { phase: ScanPhase::Error, .. } | ScanEvent::FetchError { .. } => {
            SnapshotAction::Clear
        }
        _ => SnapshotAction::Skip,
    }
}

/// Copies the payload of every data event into `scan:<topic>` with `ttl`,
/// and drops all of them when a cycle errors out.
pub fn spawn_snapshot_writer<S>(bus: &ScanBus, store: S, ttl: Duration) -> JoinHandle<()>
where
    S: SnapshotStore + 'static,
{
    let mut rx = bus.subscribe();
    let ttl_secs = ttl.as_secs().max(1);
    tokio::spawn(async move {
        loop {
            let event = match rx.recv().await {
                Ok(ev) => ev,
                Err(RecvError::Lagged(n)) => {
                    log::warn!("snapshot writer lagged, skipped {n} event(s)");
                    continue;
                }
                Err(RecvError::Closed) => break,
            };
            match snapshot_action(&event) {
                SnapshotAction::Skip => {}
                SnapshotAction::Clear => {
                    log::debug!("scan aborted ({}), clearing cached snapshots", event.topic());
                    if let Err(e) = store.clear_snapshots().await {
                        log::warn!("snapshot clear failed: {e}");
                    }
                }
                SnapshotAction::Write => {
                    let payload = match serde_json::to_value(&event) {
                        Ok(mut v) => v["payload"].take(),
                        Err(e) => {
                            log::error!("snapshot encode failed for {}: {e}", event.topic());
                            continue;
                        }
                    };
                    if let Err(e) = store.put_snapshot(event.topic(), &payload, ttl_secs).await {
                        log::warn!("snapshot write failed for {}: {e}", event.topic());
                    }
                }
            }
        }
    })
}

/// Triggers a scan for every message on [`WATCHLIST_CHANNEL`]; reconnects on error.
pub fn spawn_watchlist_listener(redis: RedisPool, scanner: Arc<Scanner>) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            if let Err(e) = listen_watchlist(&redis, &scanner).await {
                log::warn!("watchlist listener: {e}; reconnecting");
            }
            tokio::time::sleep(Duration::from_secs(5)).await;
        }
    })
}

async fn listen_watchlist(redis: &RedisPool, scanner: &Arc<Scanner>) -> Result<(), CacheError> {
    let mut pubsub = redis.client.get_async_pubsub().await?;
    pubsub.subscribe(WATCHLIST_CHANNEL).await?;
    log::info!("listening for watchlist changes on {WATCHLIST_CHANNEL}");

    let mut messages = pubsub.on_message();
    while messages.next().await.is_some() {
        log::debug!("watchlist changed, triggering scan");
        let scanner = Arc::clone(scanner);
        tokio::spawn(async move {
            scanner.trigger().await;
        });
    }
    Ok(())
}
