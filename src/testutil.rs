//! In-process mock relays for tests.

use std::{
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};

use futures_util::{SinkExt, StreamExt};
use secp256k1::SecretKey;
use serde_json::Value;
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::{accept_async, tungstenite::Message};

use crate::{
    event::{self, Event, EventDraft},
    relay::Filter,
};

/// How a mock relay answers.
#[derive(Clone)]
pub(crate) enum Behavior {
    /// Answer `REQ` with matching events then `EOSE`; accept every `EVENT`.
    Serve(Vec<Event>),
    /// Answer `EVENT` with `OK false`.
    Reject(String),
    /// Read frames and never answer.
    Silent,
    /// Sign incoming bunker requests with the key.
    Bunker(SecretKey),
    /// Answer bunker requests with an error.
    BunkerError(String),
    /// Hold each `REQ` or `EVENT` for the delay, then answer `EOSE` or `OK`.
    Slow(Duration),
}

/// Requests being worked on at once, across every relay sharing it.
#[derive(Default)]
pub(crate) struct Gauge {
    busy: AtomicUsize,
    peak: AtomicUsize,
}

impl Gauge {
    fn enter(&self) {
        let now = self.busy.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
    }

    fn leave(&self) {
        self.busy.fetch_sub(1, Ordering::SeqCst);
    }

    pub(crate) fn peak(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }
}

pub(crate) struct MockRelay {
    pub url: String,
    connections: Arc<AtomicUsize>,
    received: Arc<Mutex<Vec<Value>>>,
}

impl MockRelay {
    pub(crate) async fn spawn(behavior: Behavior) -> Self {
        Self::spawn_gauged(behavior, Arc::new(Gauge::default())).await
    }

    /// Like [`MockRelay::spawn`], reporting slow requests to `gauge`.
    pub(crate) async fn spawn_gauged(behavior: Behavior, gauge: Arc<Gauge>) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("ws://{}", listener.local_addr().unwrap());
        let connections = Arc::new(AtomicUsize::new(0));
        let received = Arc::new(Mutex::new(Vec::new()));
        let (count, seen) = (connections.clone(), received.clone());
        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                count.fetch_add(1, Ordering::SeqCst);
                tokio::spawn(serve(stream, behavior.clone(), seen.clone(), gauge.clone()));
            }
        });
        Self {
            url,
            connections,
            received,
        }
    }

    /// Number of accepted TCP connections so far.
    pub(crate) fn connections(&self) -> usize {
        self.connections.load(Ordering::SeqCst)
    }

    /// Every frame received, parsed as JSON.
    pub(crate) fn received(&self) -> Vec<Value> {
        self.received.lock().unwrap().clone()
    }

    /// Events received in `EVENT` frames.
    pub(crate) fn published(&self) -> Vec<Event> {
        self.received()
            .into_iter()
            .filter(|v| v[0] == "EVENT")
            .filter_map(|v| serde_json::from_value(v[1].clone()).ok())
            .collect()
    }
}

/// URL of a port nobody listens on.
pub(crate) async fn dead_relay() -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);
    format!("ws://{addr}")
}

fn matches(filter: &Filter, ev: &Event) -> bool {
    let any = |allowed: &Option<Vec<String>>, values: Vec<&str>| match allowed {
        Some(list) => values.iter().any(|v| list.iter().any(|a| a == v)),
        None => true,
    };
    filter.kinds.as_ref().map_or(true, |k| k.contains(&ev.kind))
        && any(&filter.ids, vec![ev.id.as_str()])
        && any(&filter.authors, vec![ev.pubkey.as_str()])
        && any(&filter.events, ev.tag_values("e").collect())
        && any(&filter.pubkeys, ev.tag_values("p").collect())
}

async fn serve(stream: TcpStream, behavior: Behavior, seen: Arc<Mutex<Vec<Value>>>, gauge: Arc<Gauge>) {
    let Ok(mut ws) = accept_async(stream).await else {
        return;
    };
    while let Some(Ok(msg)) = ws.next().await {
        let Message::Text(txt) = msg else {
            continue;
        };
        let Ok(val) = serde_json::from_str::<Value>(&txt) else {
            continue;
        };
        seen.lock().unwrap().push(val.clone());
        let work = val[0] == "REQ" || val[0] == "EVENT";
        if let (Behavior::Slow(delay), true) = (&behavior, work) {
            gauge.enter();
            tokio::time::sleep(*delay).await;
            gauge.leave();
        }
        let replies = respond(&behavior, &val);
        for reply in replies {
            if ws.send(Message::Text(reply.to_string())).await.is_err() {
                return;
            }
        }
    }
}

fn respond(behavior: &Behavior, val: &Value) -> Vec<Value> {
    match behavior {
        Behavior::Silent => vec![],
        Behavior::Bunker(key) => {
            let draft: EventDraft = serde_json::from_value(val["params"][0].clone()).unwrap();
            let signed = event::sign(key, &draft).unwrap();
            vec![
                serde_json::json!({"id": "someone-else", "result": "ignored"}),
                serde_json::json!({"id": val["id"], "result": signed}),
            ]
        }
        Behavior::BunkerError(msg) => vec![serde_json::json!({"id": val["id"], "error": msg})],
        Behavior::Serve(_) | Behavior::Reject(_) | Behavior::Slow(_) if val[0] == "REQ" => {
            let sub = val[1].clone();
            let filters: Vec<Filter> = val
                .as_array()
                .map(|arr| {
                    arr.iter()
                        .skip(2)
                        .filter_map(|f| serde_json::from_value(f.clone()).ok())
                        .collect()
                })
                .unwrap_or_default();
            let mut out = Vec::new();
            if let Behavior::Serve(events) = behavior {
                for ev in events.iter().filter(|ev| filters.iter().any(|f| matches(f, ev))) {
                    out.push(serde_json::json!(["EVENT", sub, ev]));
                }
            }
            out.push(serde_json::json!(["EOSE", sub]));
            out
        }
        Behavior::Serve(_) | Behavior::Slow(_) if val[0] == "EVENT" => {
            vec![serde_json::json!(["OK", val[1]["id"], true, ""])]
        }
        Behavior::Reject(msg) if val[0] == "EVENT" => {
            vec![serde_json::json!(["OK", val[1]["id"], false, msg])]
        }
        _ => vec![],
    }
}
