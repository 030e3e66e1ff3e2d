// src/services/subscribers.rs

//!  Real-time subscriber transport (WebSocket)
//!
//!  * Accepts sockets and forwards every [`ScanEvent`] as `{"topic","payload"}` JSON
//!  * On connect: sends the current availability flag, then schedules a scan
//!    after `connect_scan_delay` so the newcomer is not left waiting for the timer
//!  * Slow sockets skip what they missed; nothing is re-sent

use std::net::SocketAddr;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use futures_util::{SinkExt, StreamExt};
use serde::Serialize;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast::error::RecvError;
use tokio_tungstenite::accept_async;
use tungstenite::Message;
use uuid::Uuid;

use crate::services::scan_bus::ScanEvent;
use crate::services::scanner::Scanner;
use crate::services::scheduler;

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SubscriberInfo {
    pub addr: SocketAddr,
    pub connected_at: DateTime<Utc>,
}

/// Who is connected right now.
#[derive(Default)]
pub struct SubscriberRegistry {
    inner: DashMap<Uuid, SubscriberInfo>,
}

impl SubscriberRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, addr: SocketAddr) -> Uuid {
        let id = Uuid::new_v4();
        self.inner.insert(id, SubscriberInfo { addr, connected_at: Utc::now() });
        metrics::gauge!("ws_subscribers", self.inner.len() as f64);
        id
    }

    pub fn remove(&self, id: &Uuid) -> Option<SubscriberInfo> {
        let removed = self.inner.remove(id).map(|(_, info)| info);
        metrics::gauge!("ws_subscribers", self.inner.len() as f64);
        removed
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }
}

/// Accept loop; each socket gets its own task.
pub async fn serve(
    listener: TcpListener,
    scanner: Arc<Scanner>,
    registry: Arc<SubscriberRegistry>,
) -> anyhow::Result<()> {
    log::info!("subscriber socket listening on {}", listener.local_addr()?);
    loop {
        let (stream, addr) = listener.accept().await?;
        let scanner = Arc::clone(&scanner);
        let registry = Arc::clone(&registry);
        tokio::spawn(async move {
            if let Err(e) = session(stream, addr, scanner, registry).await {
                log::debug!("subscriber {addr} dropped: {e}");
            }
        });
    }
}

async fn session(
    stream: TcpStream,
    addr: SocketAddr,
    scanner: Arc<Scanner>,
    registry: Arc<SubscriberRegistry>,
) -> anyhow::Result<()> {
    let ws = accept_async(stream).await?;
    let (mut sink, mut source) = ws.split();
    // subscribe before the greeting so nothing published in between is lost
    let mut rx = scanner.bus().subscribe();

    let id = registry.register(addr);
    log::info!("subscriber {addr} connected ({} online)", registry.len());

    let result: anyhow::Result<()> = async {
        let hello = ScanEvent::ServiceStatus { available: scanner.health().is_available() };
        sink.send(Message::Text(hello.to_json()?.into())).await?;
        scheduler::schedule_scan(Arc::clone(&scanner), scanner.config().connect_scan_delay);

        loop {
            tokio::select! {
                ev = rx.recv() => match ev {
                    Ok(ev) => sink.send(Message::Text(ev.to_json()?.into())).await?,
                    Err(RecvError::Lagged(n)) => log::debug!("subscriber {addr} lagged, skipped {n} event(s)"),
                    Err(RecvError::Closed) => break,
                },
                msg = source.next() => match msg {
                    None | Some(Ok(Message::Close(_))) => break,
                    Some(Ok(Message::Ping(p))) => sink.send(Message::Pong(p)).await?,
                    Some(Ok(_)) => {} // inbound frames carry no commands
                    Some(Err(e)) => return Err(e.into()),
                },
            }
        }
        Ok(())
    }
    .await;

    registry.remove(&id);
    log::info!("subscriber {addr} disconnected ({} online)", registry.len());
    result
}
