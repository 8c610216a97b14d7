//! Bounded fan-out of publish and fetch operations across relays.

use std::{
    collections::{BTreeMap, HashSet},
    fmt,
    sync::atomic::{AtomicU64, Ordering},
    time::Duration,
};

use futures_util::{future::join_all, SinkExt, StreamExt};
use tokio::sync::Semaphore;
use tokio::time::{timeout, timeout_at, Instant};
use tokio_tungstenite::tungstenite::Message;

use crate::{
    backoff::{RelayBackoff, RelayTarget},
    cache::TtlCache,
    error::{Error, Result},
    event::{unix_now, Event},
    relay::{connect_ws, ClientMessage, Filter, RelayMessage, RelayStream},
};

/// Limits and timeouts for a [`RelayClient`].
#[derive(Debug, Clone)]
pub struct RelayClientConfig {
    /// Global ceiling on simultaneous relay connections.
    pub max_concurrent: usize,
    /// Relays consulted per fetch.
    pub max_relays_read: usize,
    /// Relays consulted per publish.
    pub max_relays_write: usize,
    /// Per-operation network timeout.
    pub timeout: Duration,
    /// Lifetime of cached fetch results.
    pub cache_ttl: Duration,
    /// Optional SOCKS5 proxy `host:port`.
    pub tor_socks: Option<String>,
}

impl Default for RelayClientConfig {
    fn default() -> Self {
        Self {
            max_concurrent: 5,
            max_relays_read: 5,
            max_relays_write: 5,
            timeout: Duration::from_secs(5),
            cache_ttl: Duration::from_secs(30),
            tor_socks: None,
        }
    }
}

/// Outcome of publishing to one relay.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PublishStatus {
    Ok,
    /// Skipped because the relay is cooling down.
    Cooldown,
    Error(String),
}

impl PublishStatus {
    pub fn is_ok(&self) -> bool {
        matches!(self, PublishStatus::Ok)
    }
}

impl fmt::Display for PublishStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PublishStatus::Ok => write!(f, "ok"),
            PublishStatus::Cooldown => write!(f, "cooldown"),
            PublishStatus::Error(reason) => write!(f, "error:{reason}"),
        }
    }
}

/// A signed event and the per-relay outcome of sending it.
#[derive(Debug, Clone)]
pub struct Published {
    pub event: Event,
    pub relays: BTreeMap<String, PublishStatus>,
}

impl Published {
    /// Relays that took the event.
    pub fn accepted(&self) -> usize {
        self.relays.values().filter(|s| s.is_ok()).count()
    }
}

/// Relay fan-out engine.
///
/// Owns the backoff state of every relay it talks to and a short-lived
/// cache of fetch results. One semaphore bounds connections across publish
/// and fetch.
pub struct RelayClient {
    config: RelayClientConfig,
    semaphore: Semaphore,
    backoff: RelayBackoff,
    cache: TtlCache<String, Vec<Event>>,
    next_sub: AtomicU64,
}

impl RelayClient {
    pub fn new(config: RelayClientConfig) -> Self {
        Self {
            semaphore: Semaphore::new(config.max_concurrent.max(1)),
            backoff: RelayBackoff::new(),
            cache: TtlCache::new(config.cache_ttl),
            next_sub: AtomicU64::new(0),
            config,
        }
    }

    pub fn config(&self) -> &RelayClientConfig {
        &self.config
    }

    /// Backoff snapshot for `relay`.
    pub fn relay_state(&self, relay: &str) -> RelayTarget {
        self.backoff.snapshot(relay)
    }

    /// Send `event` to at most `max_relays_write` of `relays`.
    ///
    /// Relays on cooldown are reported without being contacted. A missing
    /// acknowledgment is not a failure. The fetch cache is cleared once all
    /// attempts are done.
    pub async fn publish(&self, event: &Event, relays: &[String]) -> BTreeMap<String, PublishStatus> {
        let targets = select_relays(relays, self.config.max_relays_write);
        let mut results = BTreeMap::new();
        let mut live = Vec::new();
        for relay in targets {
            if self.backoff.is_on_cooldown(&relay) {
                tracing::debug!(relay = %relay, "skipping relay on cooldown");
                results.insert(relay, PublishStatus::Cooldown);
            } else {
                live.push(relay);
            }
        }
        match ClientMessage::Event(event).to_json() {
            Ok(frame) => {
                let attempts = live.iter().map(|relay| self.publish_one(relay, &frame, &event.id));
                for (relay, status) in live.iter().zip(join_all(attempts).await) {
                    results.insert(relay.clone(), status);
                }
            }
            Err(e) => {
                for relay in live {
                    results.insert(relay, PublishStatus::Error(e.to_string()));
                }
            }
        }
        self.cache.clear();
        results
    }

    async fn publish_one(&self, relay: &str, frame: &str, event_id: &str) -> PublishStatus {
        let Ok(_permit) = self.semaphore.acquire().await else {
            return PublishStatus::Error("client closed".into());
        };
        let started = Instant::now();
        match self.deliver(relay, frame, event_id).await {
            Ok(ack) => {
                self.backoff.record_success(relay);
                let elapsed_ms = started.elapsed().as_millis() as u64;
                match ack {
                    Some((false, message)) => {
                        tracing::warn!(relay, event_id, %message, "relay rejected event");
                        PublishStatus::Error(format!("rejected: {message}"))
                    }
                    _ => {
                        tracing::info!(relay, event_id, elapsed_ms, "published event");
                        PublishStatus::Ok
                    }
                }
            }
            Err(e) => {
                self.backoff.record_failure(relay);
                tracing::warn!(relay, event_id, error = %e, "publish failed");
                PublishStatus::Error(failure_reason(e))
            }
        }
    }

    /// Connect, send, and wait briefly for `OK`. `None` means no ack arrived.
    async fn deliver(&self, relay: &str, frame: &str, event_id: &str) -> Result<Option<(bool, String)>> {
        let wait = self.config.timeout;
        let mut ws = self.connect(relay, wait).await?;
        timeout(wait, ws.send(Message::Text(frame.to_string())))
            .await
            .map_err(|_| Error::relay(relay, "send timed out"))?
            .map_err(|e| Error::relay(relay, e))?;
        let ack = timeout(wait, wait_for_ok(&mut ws, event_id))
            .await
            .unwrap_or(None);
        let _ = timeout(wait, ws.close(None)).await;
        Ok(ack)
    }

    /// Collect events matching `filters` from at most `max_relays_read` of
    /// `relays`.
    ///
    /// Results are the concatenation of every relay's events, duplicates
    /// included, and are not signature checked. A relay that fails only
    /// loses its own contribution. An empty result means nothing could be
    /// read, not that nothing exists.
    pub async fn fetch_events(
        &self,
        filters: &[Filter],
        relays: &[String],
        timeout_override: Option<Duration>,
    ) -> Vec<Event> {
        let targets = select_relays(relays, self.config.max_relays_read);
        if targets.is_empty() {
            return Vec::new();
        }
        let key = match cache_key(filters, &targets) {
            Ok(key) => key,
            Err(e) => {
                tracing::warn!(error = %e, "cannot encode filters");
                return Vec::new();
            }
        };
        if let Some(hit) = self.cache.get(&key) {
            tracing::debug!(count = hit.len(), "fetch served from cache");
            return hit;
        }
        let sub_id = format!(
            "fetch-{}-{}",
            unix_now(),
            self.next_sub.fetch_add(1, Ordering::Relaxed)
        );
        let req = match (ClientMessage::Req {
            subscription_id: &sub_id,
            filters,
        })
        .to_json()
        {
            Ok(req) => req,
            Err(e) => {
                tracing::warn!(error = %e, "cannot encode subscription");
                return Vec::new();
            }
        };
        let wait = timeout_override.unwrap_or(self.config.timeout);
        let live: Vec<&String> = targets
            .iter()
            .filter(|relay| {
                let cooling = self.backoff.is_on_cooldown(relay);
                if cooling {
                    tracing::debug!(relay = %relay, "skipping relay on cooldown");
                }
                !cooling
            })
            .collect();
        let per_relay = join_all(live.iter().map(|relay| self.fetch_one(relay, &req, &sub_id, wait))).await;
        let events: Vec<Event> = per_relay.into_iter().flatten().collect();
        self.cache.insert(key, events.clone());
        events
    }

    async fn fetch_one(&self, relay: &str, req: &str, sub_id: &str, wait: Duration) -> Vec<Event> {
        let Ok(_permit) = self.semaphore.acquire().await else {
            return Vec::new();
        };
        let started = Instant::now();
        let mut events = Vec::new();
        match self.collect(relay, req, sub_id, wait, &mut events).await {
            Ok(()) => {
                self.backoff.record_success(relay);
                tracing::info!(
                    relay,
                    count = events.len(),
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "fetched events"
                );
            }
            Err(e) => {
                self.backoff.record_failure(relay);
                tracing::warn!(relay, count = events.len(), error = %e, "fetch failed");
            }
        }
        events
    }

    /// Stream events for one subscription into `events` until `EOSE`, close
    /// or the deadline. Events read before a failure are kept.
    async fn collect(
        &self,
        relay: &str,
        req: &str,
        sub_id: &str,
        wait: Duration,
        events: &mut Vec<Event>,
    ) -> Result<()> {
        let mut ws = self.connect(relay, wait).await?;
        timeout(wait, ws.send(Message::Text(req.to_string())))
            .await
            .map_err(|_| Error::relay(relay, "send timed out"))?
            .map_err(|e| Error::relay(relay, e))?;
        let deadline = Instant::now() + wait;
        let outcome = loop {
            let next = match timeout_at(deadline, ws.next()).await {
                Ok(next) => next,
                Err(_) => break Err(Error::relay(relay, "timed out waiting for EOSE")),
            };
            match next {
                None | Some(Ok(Message::Close(_))) => break Ok(()),
                Some(Err(e)) => break Err(Error::relay(relay, e)),
                Some(Ok(Message::Text(txt))) => match RelayMessage::parse(&txt) {
                    Some(RelayMessage::Event {
                        subscription_id,
                        event,
                    }) if subscription_id == sub_id => events.push(event),
                    Some(RelayMessage::Eose { subscription_id }) if subscription_id == sub_id => {
                        break Ok(())
                    }
                    Some(RelayMessage::Closed {
                        subscription_id,
                        message,
                    }) if subscription_id == sub_id => {
                        tracing::debug!(relay, %message, "subscription closed by relay");
                        break Ok(());
                    }
                    Some(RelayMessage::Notice { message }) => {
                        tracing::debug!(relay, %message, "relay notice");
                    }
                    _ => {}
                },
                Some(Ok(_)) => {}
            }
        };
        if let Ok(close) = (ClientMessage::Close {
            subscription_id: sub_id,
        })
        .to_json()
        {
            let _ = timeout(wait, ws.send(Message::Text(close))).await;
        }
        let _ = timeout(wait, ws.close(None)).await;
        outcome
    }

    async fn connect(&self, relay: &str, wait: Duration) -> Result<RelayStream> {
        timeout(wait, connect_ws(relay, self.config.tor_socks.as_deref()))
            .await
            .map_err(|_| Error::relay(relay, "connect timed out"))?
    }
}

async fn wait_for_ok(ws: &mut RelayStream, event_id: &str) -> Option<(bool, String)> {
    while let Some(Ok(msg)) = ws.next().await {
        if let Message::Text(txt) = msg {
            if let Some(RelayMessage::Ok {
                event_id: id,
                accepted,
                message,
            }) = RelayMessage::parse(&txt)
            {
                if id == event_id {
                    return Some((accepted, message));
                }
            }
        }
    }
    None
}

/// First `limit` distinct relays, in input order.
pub fn select_relays(relays: &[String], limit: usize) -> Vec<String> {
    let mut seen = HashSet::new();
    relays
        .iter()
        .map(|r| r.trim())
        .filter(|r| !r.is_empty() && seen.insert(*r))
        .take(limit)
        .map(str::to_string)
        .collect()
}

/// Order-independent key over filters and relay set.
fn cache_key(filters: &[Filter], relays: &[String]) -> Result<String> {
    let mut encoded = filters
        .iter()
        .map(|f| serde_json::to_value(f).map(|v| v.to_string()))
        .collect::<std::result::Result<Vec<_>, _>>()?;
    encoded.sort();
    let mut relays = relays.to_vec();
    relays.sort();
    Ok(format!("[{}]|{}", encoded.join(","), relays.join(",")))
}

fn failure_reason(e: Error) -> String {
    match e {
        Error::RelayConnection { reason, .. } => reason,
        other => other.to_string(),
    }
}
