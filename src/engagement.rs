//! Like and zap counts per event.
//!
//! Confirmed state is rebuilt from relay receipts on every hydration;
//! optimistic local actions are kept beside it until a receipt confirms
//! them.

use std::{
    collections::{HashMap, HashSet},
    sync::{Arc, Mutex, MutexGuard},
    time::Duration,
};

use serde::Serialize;
use tokio::time::Instant;

use crate::{
    client::{Published, RelayClient},
    error::Result,
    event::{self, Event, EventDraft, Tag, KIND_REACTION, KIND_ZAP_RECEIPT, KIND_ZAP_REQUEST},
    relay::Filter,
    signer::Signer,
    store::BlockList,
};

/// Counts for one event as seen by one viewer.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Engagement {
    pub event_id: String,
    pub like_count: usize,
    pub liked_by_me: bool,
    pub zap_count: usize,
    pub total_sats: u64,
}

/// Result of a like or zap action.
#[derive(Debug, Clone)]
pub struct EngagementUpdate {
    pub engagement: Engagement,
    /// `None` when nothing was sent, e.g. for an unlike.
    pub published: Option<Published>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct Zap {
    sender: Option<String>,
    sats: u64,
}

#[derive(Debug, Clone, Default)]
struct EventState {
    likers: HashSet<String>,
    /// Keyed by receipt id.
    zaps: HashMap<String, Zap>,
    /// Zap request ids named by confirmed receipts.
    confirmed_requests: HashSet<String>,
    pending_likes: HashSet<String>,
    pending_unlikes: HashSet<String>,
    /// Keyed by zap request id.
    pending_zaps: HashMap<String, Zap>,
}

impl EventState {
    fn liked_by(&self, viewer: &str) -> bool {
        (self.likers.contains(viewer) || self.pending_likes.contains(viewer))
            && !self.pending_unlikes.contains(viewer)
    }

    /// Swap in freshly confirmed state and drop pending actions it covers.
    fn reconcile(&mut self, likers: HashSet<String>, zaps: HashMap<String, Zap>, requests: HashSet<String>) {
        self.pending_likes.retain(|p| !likers.contains(p));
        self.pending_zaps.retain(|id, _| !requests.contains(id));
        self.likers = likers;
        self.zaps = zaps;
        self.confirmed_requests = requests;
    }

    fn view(&self, event_id: &str, viewer: Option<&str>, blocked: &HashSet<String>) -> Engagement {
        let likers: HashSet<&String> = self
            .likers
            .iter()
            .chain(self.pending_likes.iter())
            .filter(|p| !self.pending_unlikes.contains(*p) && !blocked.contains(*p))
            .collect();
        let zaps: Vec<&Zap> = self
            .zaps
            .values()
            .chain(self.pending_zaps.values())
            .filter(|z| z.sender.as_ref().map_or(true, |s| !blocked.contains(s)))
            .collect();
        Engagement {
            event_id: event_id.to_string(),
            like_count: likers.len(),
            liked_by_me: viewer.map_or(false, |v| self.liked_by(v) && !blocked.contains(v)),
            zap_count: zaps.len(),
            total_sats: zaps.iter().map(|z| z.sats).sum(),
        }
    }
}

/// Engagement state for many events, each entry living `ttl` past its last
/// update.
#[derive(Debug)]
pub struct EngagementCache {
    ttl: Duration,
    entries: Mutex<HashMap<String, (Instant, EventState)>>,
}

impl EngagementCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            entries: Mutex::new(HashMap::new()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, (Instant, EventState)>> {
        self.entries.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Apply `f` to the live state for `event_id` under one lock.
    fn update<T>(&self, event_id: &str, f: impl FnOnce(&mut EventState) -> T) -> T {
        let now = Instant::now();
        let mut entries = self.lock();
        entries.retain(|_, (expires_at, _)| *expires_at > now);
        let entry = entries
            .entry(event_id.to_string())
            .or_insert_with(|| (now, EventState::default()));
        entry.0 = now + self.ttl;
        f(&mut entry.1)
    }

    fn view(&self, event_id: &str, viewer: Option<&str>, blocked: &HashSet<String>) -> Engagement {
        let now = Instant::now();
        match self.lock().get(event_id) {
            Some((expires_at, state)) if *expires_at > now => state.view(event_id, viewer, blocked),
            _ => EventState::default().view(event_id, viewer, blocked),
        }
    }

    /// Live entries.
    pub fn len(&self) -> usize {
        let now = Instant::now();
        self.lock().values().filter(|(expires_at, _)| *expires_at > now).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

pub struct EngagementService {
    client: Arc<RelayClient>,
    blocks: Arc<dyn BlockList>,
    cache: Arc<EngagementCache>,
}

impl EngagementService {
    pub fn new(client: Arc<RelayClient>, blocks: Arc<dyn BlockList>, cache: Arc<EngagementCache>) -> Self {
        Self { client, blocks, cache }
    }

    /// Rebuild confirmed counts for `event_ids` from relay reactions and zap
    /// receipts. An empty fetch leaves existing state alone.
    pub async fn hydrate(&self, event_ids: &[String], relays: &[String]) {
        if event_ids.is_empty() {
            return;
        }
        let filter = Filter::new()
            .kinds([KIND_REACTION, KIND_ZAP_RECEIPT])
            .events(event_ids.iter().cloned());
        let fetched = self.client.fetch_events(&[filter], relays, None).await;
        if fetched.is_empty() {
            tracing::debug!(count = event_ids.len(), "no engagement data available");
            return;
        }
        let mut seen = HashSet::new();
        let verified: Vec<Event> = fetched
            .into_iter()
            .filter(|ev| seen.insert(ev.id.clone()) && event::verify(ev))
            .collect();

        for id in event_ids {
            let mut likers = HashSet::new();
            let mut zaps = HashMap::new();
            let mut requests = HashSet::new();
            for ev in verified.iter().filter(|ev| target_of(ev) == Some(id.as_str())) {
                match ev.kind {
                    KIND_REACTION if ev.content.trim() != "-" => {
                        likers.insert(ev.pubkey.clone());
                    }
                    KIND_ZAP_RECEIPT => {
                        let request = embedded_request(ev);
                        if let Some(req) = &request {
                            requests.insert(req.id.clone());
                        }
                        zaps.insert(
                            ev.id.clone(),
                            Zap {
                                sender: request.as_ref().map(|r| r.pubkey.clone()),
                                sats: zap_sats(ev, request.as_ref()),
                            },
                        );
                    }
                    _ => {}
                }
            }
            tracing::debug!(event_id = %id, likes = likers.len(), zaps = zaps.len(), "hydrated engagement");
            self.cache.update(id, |state| state.reconcile(likers, zaps, requests));
        }
    }

    /// Counts for `event_id`, hiding likes and zaps from authors `viewer`
    /// blocked.
    pub fn engagement_for(&self, event_id: &str, viewer: Option<&str>) -> Engagement {
        let blocked = match viewer {
            Some(v) => self.blocks.blocked_for(v).unwrap_or_else(|e| {
                tracing::warn!(viewer = v, error = %e, "block list unavailable");
                HashSet::new()
            }),
            None => HashSet::new(),
        };
        self.cache.view(event_id, viewer, &blocked)
    }

    /// Like `event_id`, or drop the signer's like if present.
    ///
    /// A like publishes a `+` reaction. Unliking only changes local state.
    pub async fn toggle_like(
        &self,
        signer: &Signer,
        event_id: &str,
        author: &str,
        relays: &[String],
    ) -> Result<EngagementUpdate> {
        let viewer = signer.public_key().to_string();
        let unliked = self.cache.update(event_id, |state| {
            if state.liked_by(&viewer) {
                state.pending_likes.remove(&viewer);
                if state.likers.contains(&viewer) {
                    state.pending_unlikes.insert(viewer.clone());
                }
                true
            } else {
                false
            }
        });
        if unliked {
            return Ok(EngagementUpdate {
                engagement: self.engagement_for(event_id, Some(&viewer)),
                published: None,
            });
        }
        let draft = EventDraft::new(
            viewer.as_str(),
            KIND_REACTION,
            vec![Tag::new(["e", event_id]), Tag::new(["p", author])],
            "+",
        );
        let signed = signer.sign_event(&draft).await?;
        self.cache.update(event_id, |state| {
            state.pending_unlikes.remove(&viewer);
            if !state.likers.contains(&viewer) {
                state.pending_likes.insert(viewer.clone());
            }
        });
        let statuses = self.client.publish(&signed, relays).await;
        Ok(EngagementUpdate {
            engagement: self.engagement_for(event_id, Some(&viewer)),
            published: Some(Published {
                event: signed,
                relays: statuses,
            }),
        })
    }

    /// Publish a zap request for `sats` and count it until a receipt
    /// confirms it.
    pub async fn add_zap(
        &self,
        signer: &Signer,
        event_id: &str,
        author: &str,
        sats: u64,
        relays: &[String],
    ) -> Result<EngagementUpdate> {
        let viewer = signer.public_key().to_string();
        let mut relays_tag = vec!["relays".to_string()];
        relays_tag.extend(relays.iter().cloned());
        let draft = EventDraft::new(
            viewer.as_str(),
            KIND_ZAP_REQUEST,
            vec![
                Tag::new(["e", event_id]),
                Tag::new(["p", author]),
                Tag::new(["amount".to_string(), sats.saturating_mul(1000).to_string()]),
                Tag(relays_tag),
            ],
            "",
        );
        let signed = signer.sign_event(&draft).await?;
        self.cache.update(event_id, |state| {
            if !state.confirmed_requests.contains(&signed.id) {
                state.pending_zaps.insert(
                    signed.id.clone(),
                    Zap {
                        sender: Some(viewer.clone()),
                        sats,
                    },
                );
            }
        });
        let statuses = self.client.publish(&signed, relays).await;
        Ok(EngagementUpdate {
            engagement: self.engagement_for(event_id, Some(&viewer)),
            published: Some(Published {
                event: signed,
                relays: statuses,
            }),
        })
    }
}

/// Event a reaction or receipt points at: its last `e` tag.
fn target_of(ev: &Event) -> Option<&str> {
    ev.tag_values("e").last()
}

/// Zap request carried in a receipt's `description` tag.
fn embedded_request(receipt: &Event) -> Option<Event> {
    let description = receipt.first_tag_value("description")?;
    serde_json::from_str::<Event>(description)
        .ok()
        .filter(|req| req.kind == KIND_ZAP_REQUEST)
}

/// Sats paid by a receipt: its `amount` tag, else the request's, in msat
/// floored to whole sats.
pub fn zap_sats(receipt: &Event, request: Option<&Event>) -> u64 {
    receipt
        .first_tag_value("amount")
        .or_else(|| request.and_then(|r| r.first_tag_value("amount")))
        .and_then(|msat| msat.trim().parse::<u64>().ok())
        .map_or(0, |msat| msat / 1000)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::RelayClientConfig;
    use crate::event::tests::{signed, test_key};
    use crate::keys::derive_public_key_hex;
    use crate::store::FileStore;
    use crate::testutil::{Behavior, MockRelay};
    use tempfile::TempDir;

    fn target() -> String {
        "ee".repeat(32)
    }

    fn reaction(seed: u8, content: &str) -> Event {
        signed(seed, KIND_REACTION, 1, vec![Tag::new(["e", target().as_str()])], content)
    }

    fn receipt(seed: u8, request: &Event, amount: Option<&str>) -> Event {
        let mut tags = vec![
            Tag::new(["e", target().as_str()]),
            Tag::new(["description".to_string(), serde_json::to_string(request).unwrap()]),
        ];
        if let Some(a) = amount {
            tags.push(Tag::new(["amount", a]));
        }
        signed(seed, KIND_ZAP_RECEIPT, 2, tags, "")
    }

    fn zap_request(seed: u8, msat: &str) -> Event {
        signed(
            seed,
            KIND_ZAP_REQUEST,
            1,
            vec![Tag::new(["e", target().as_str()]), Tag::new(["amount", msat])],
            "",
        )
    }

    fn service(dir: &TempDir) -> (EngagementService, Arc<FileStore>, Arc<EngagementCache>) {
        let store = Arc::new(FileStore::new(dir.path().to_path_buf()));
        store.init().unwrap();
        let client = Arc::new(RelayClient::new(RelayClientConfig {
            timeout: Duration::from_millis(500),
            cache_ttl: Duration::ZERO,
            ..Default::default()
        }));
        let cache = Arc::new(EngagementCache::new(Duration::from_secs(300)));
        (EngagementService::new(client, store.clone(), cache.clone()), store, cache)
    }

    #[test]
    fn sats_from_msat_amounts() {
        let req = zap_request(1, "21000");
        assert_eq!(zap_sats(&receipt(9, &req, Some("21999")), None), 21);
        assert_eq!(zap_sats(&receipt(9, &req, Some("999")), None), 0);
        assert_eq!(zap_sats(&receipt(9, &req, Some("lots")), None), 0);
        let no_amount = receipt(9, &req, None);
        assert_eq!(zap_sats(&no_amount, embedded_request(&no_amount).as_ref()), 21);
    }

    #[tokio::test]
    async fn hydrate_counts_verified_receipts_from_scratch() {
        let dir = TempDir::new().unwrap();
        let (svc, _, _) = service(&dir);
        let mut forged = reaction(4, "+");
        forged.content = "🤙".into();
        let req = zap_request(5, "50000");
        let relay = MockRelay::spawn(Behavior::Serve(vec![
            reaction(1, "+"),
            reaction(1, "🔥"),
            reaction(2, "+"),
            reaction(3, "-"),
            forged,
            receipt(9, &req, None),
        ]))
        .await;
        let relays = vec![relay.url.clone()];
        let ids = vec![target()];
        svc.hydrate(&ids, &relays).await;
        svc.hydrate(&ids, &relays).await;
        let e = svc.engagement_for(&target(), None);
        assert_eq!(e.like_count, 2);
        assert_eq!(e.zap_count, 1);
        assert_eq!(e.total_sats, 50);
        assert!(!e.liked_by_me);
        let liker = derive_public_key_hex(&test_key(1));
        assert!(svc.engagement_for(&target(), Some(&liker)).liked_by_me);
    }

    #[tokio::test]
    async fn blocked_authors_are_not_counted() {
        let dir = TempDir::new().unwrap();
        let (svc, store, _) = service(&dir);
        let req = zap_request(2, "10000");
        let relay = MockRelay::spawn(Behavior::Serve(vec![
            reaction(1, "+"),
            reaction(2, "+"),
            receipt(9, &req, None),
        ]))
        .await;
        svc.hydrate(&[target()], &[relay.url.clone()]).await;
        let viewer = derive_public_key_hex(&test_key(7));
        store.block(&viewer, &derive_public_key_hex(&test_key(2))).unwrap();
        let e = svc.engagement_for(&target(), Some(&viewer));
        assert_eq!(e.like_count, 1);
        assert_eq!(e.zap_count, 0);
        assert_eq!(svc.engagement_for(&target(), None).like_count, 2);
    }

    #[tokio::test]
    async fn optimistic_like_reconciles_with_receipt() {
        let dir = TempDir::new().unwrap();
        let (svc, _, cache) = service(&dir);
        let outbox = MockRelay::spawn(Behavior::Serve(vec![])).await;
        let signer = Signer::local(test_key(3));
        let update = svc
            .toggle_like(&signer, &target(), "author", &[outbox.url.clone()])
            .await
            .unwrap();
        assert_eq!(update.engagement.like_count, 1);
        assert!(update.engagement.liked_by_me);
        let reaction = update.published.unwrap().event;
        assert_eq!(reaction.content, "+");
        assert_eq!(outbox.published(), vec![reaction.clone()]);

        let relay = MockRelay::spawn(Behavior::Serve(vec![reaction])).await;
        svc.hydrate(&[target()], &[relay.url.clone()]).await;
        let e = svc.engagement_for(&target(), Some(signer.public_key()));
        assert_eq!(e.like_count, 1);
        assert!(e.liked_by_me);
        cache.update(&target(), |s| assert!(s.pending_likes.is_empty()));
    }

    #[tokio::test]
    async fn unlike_is_local_only() {
        let dir = TempDir::new().unwrap();
        let (svc, _, _) = service(&dir);
        let outbox = MockRelay::spawn(Behavior::Serve(vec![])).await;
        let signer = Signer::local(test_key(3));
        let relays = vec![outbox.url.clone()];
        svc.toggle_like(&signer, &target(), "author", &relays).await.unwrap();
        let update = svc.toggle_like(&signer, &target(), "author", &relays).await.unwrap();
        assert!(update.published.is_none());
        assert_eq!(update.engagement.like_count, 0);
        assert_eq!(outbox.published().len(), 1);
    }

    #[tokio::test]
    async fn unlike_hides_confirmed_like() {
        let dir = TempDir::new().unwrap();
        let (svc, _, _) = service(&dir);
        let relay = MockRelay::spawn(Behavior::Serve(vec![reaction(3, "+")])).await;
        let relays = vec![relay.url.clone()];
        svc.hydrate(&[target()], &relays).await;
        let signer = Signer::local(test_key(3));
        let update = svc.toggle_like(&signer, &target(), "author", &relays).await.unwrap();
        assert!(update.published.is_none());
        assert_eq!(update.engagement.like_count, 0);
        svc.hydrate(&[target()], &relays).await;
        assert_eq!(svc.engagement_for(&target(), None).like_count, 0);
    }

    #[tokio::test]
    async fn zap_confirmed_by_receipt_is_counted_once() {
        let dir = TempDir::new().unwrap();
        let (svc, _, _) = service(&dir);
        let outbox = MockRelay::spawn(Behavior::Serve(vec![])).await;
        let signer = Signer::local(test_key(4));
        let update = svc
            .add_zap(&signer, &target(), "author", 21, &[outbox.url.clone()])
            .await
            .unwrap();
        assert_eq!(update.engagement.zap_count, 1);
        assert_eq!(update.engagement.total_sats, 21);
        let request = update.published.unwrap().event;
        assert_eq!(request.kind, KIND_ZAP_REQUEST);
        assert_eq!(request.first_tag_value("amount"), Some("21000"));
        assert_eq!(request.first_tag_value("relays"), Some(outbox.url.as_str()));

        let relay = MockRelay::spawn(Behavior::Serve(vec![receipt(9, &request, None)])).await;
        svc.hydrate(&[target()], &[relay.url.clone()]).await;
        let e = svc.engagement_for(&target(), None);
        assert_eq!((e.zap_count, e.total_sats), (1, 21));
    }

    #[tokio::test]
    async fn empty_fetch_keeps_state() {
        let dir = TempDir::new().unwrap();
        let (svc, _, _) = service(&dir);
        let relay = MockRelay::spawn(Behavior::Serve(vec![reaction(1, "+")])).await;
        svc.hydrate(&[target()], &[relay.url.clone()]).await;
        let empty = MockRelay::spawn(Behavior::Serve(vec![])).await;
        svc.hydrate(&[target()], &[empty.url.clone()]).await;
        assert_eq!(svc.engagement_for(&target(), None).like_count, 1);
    }

    #[tokio::test]
    async fn browser_signer_leaves_state_untouched() {
        let dir = TempDir::new().unwrap();
        let (svc, _, _) = service(&dir);
        let signer = Signer::BrowserDelegated { pubkey: "ab".repeat(32) };
        assert!(svc.toggle_like(&signer, &target(), "author", &[]).await.is_err());
        assert!(svc.add_zap(&signer, &target(), "author", 5, &[]).await.is_err());
        let e = svc.engagement_for(&target(), Some(signer.public_key()));
        assert_eq!((e.like_count, e.zap_count), (0, 0));
    }

    #[tokio::test(start_paused = true)]
    async fn cache_entries_expire() {
        let cache = EngagementCache::new(Duration::from_secs(300));
        cache.update("a", |s| {
            s.likers.insert("p".into());
        });
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.view("a", None, &HashSet::new()).like_count, 1);
        tokio::time::advance(Duration::from_secs(301)).await;
        assert!(cache.is_empty());
        assert_eq!(cache.view("a", None, &HashSet::new()).like_count, 0);
    }
}
